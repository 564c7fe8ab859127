//! # Telephony Media-Stream WebSocket
//!
//! The telephony platform connects to `/ws/telephony` (or `/ws/telephony/{call_sid}`) once
//! per call and streams the caller's audio as JSON text frames.
//!
//! ## Actor Model:
//! Each connection is one actor hosting one [`BridgeController`]. Both inbound drains are
//! attached to the same actor context:
//! - the telephony WebSocket stream (`StreamHandler<ws::Message>`)
//! - the voice-AI event stream (`StreamHandler<AiLegSignal>`), added once the leg opens
//!
//! Actix runs the handlers one at a time, so the controller has a single writer and no lock.
//!
//! ## Lifecycle:
//! 1. **Upgrade**: refused with 503 when the session limit is reached
//! 2. **start**: the controller asks for the voice-AI leg; the open runs as an actor future
//! 3. **Relay**: media events in, assistant audio out
//! 4. **stop / close**: the controller winds both legs down; the registry entry is removed

use crate::ai_voice::client::AiVoiceItem;
use crate::ai_voice::{AiVoiceChannel, AiVoiceConnector};
use crate::bridge::{BridgeController, Directive, TelephonyLeg};
use crate::error::{AppError, BridgeError};
use crate::state::AppState;
use crate::telephony::{protocol, OutboundTelephonyMessage, TelephonyEvent};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often the telephony socket is pinged
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long the telephony socket may stay silent before it is dropped
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Telephony leg that queues serialized frames for the actor to write.
///
/// The controller runs inside actor handlers, which already hold the WebSocket context,
/// so outbound frames are flushed to it right after each controller call.
#[derive(Debug, Default)]
pub struct QueuedTelephonyLeg {
    pending: VecDeque<String>,
}

impl QueuedTelephonyLeg {
    pub fn drain(&mut self) -> impl Iterator<Item = String> + '_ {
        self.pending.drain(..)
    }
}

impl TelephonyLeg for QueuedTelephonyLeg {
    fn send(&mut self, message: &OutboundTelephonyMessage) -> Result<(), BridgeError> {
        self.pending.push_back(message.to_json()?);
        Ok(())
    }
}

/// One item from the voice-AI event stream, delivered to the actor.
#[derive(Debug)]
pub struct AiLegSignal(pub AiVoiceItem);

/// WebSocket actor bridging one call.
pub struct TelephonyBridgeSocket {
    session_id: String,
    controller: BridgeController<QueuedTelephonyLeg, AiVoiceChannel>,
    connector: AiVoiceConnector,
    app_state: web::Data<AppState>,
    last_heartbeat: Instant,
}

impl TelephonyBridgeSocket {
    pub fn new(
        session_id: String,
        controller: BridgeController<QueuedTelephonyLeg, AiVoiceChannel>,
        connector: AiVoiceConnector,
        app_state: web::Data<AppState>,
    ) -> Self {
        Self {
            session_id,
            controller,
            connector,
            app_state,
            last_heartbeat: Instant::now(),
        }
    }

    /// Carry out what the controller asked for and publish its new state.
    fn apply(&mut self, directive: Directive, ctx: &mut ws::WebsocketContext<Self>) {
        for text in self.controller.telephony_mut().drain() {
            ctx.text(text);
        }
        self.app_state.update_session(self.controller.snapshot());

        match directive {
            Directive::Continue => {}
            Directive::OpenAiLeg(identity) => {
                debug!(session_id = %self.session_id, call_sid = %identity.call_sid, "Opening voice-AI leg");
                let connector = self.connector.clone();
                let session_id = self.session_id.clone();
                let open = async move { connector.open(&session_id).await };
                ctx.spawn(open.into_actor(self).map(|result, act, ctx| act.ai_leg_opened(result, ctx)));
            }
            Directive::Terminate => {
                debug!(session_id = %self.session_id, "Session closed, dropping telephony connection");
                ctx.stop();
            }
        }
    }

    fn ai_leg_opened(&mut self, result: Result<AiVoiceChannel, BridgeError>, ctx: &mut ws::WebsocketContext<Self>) {
        let result = result.map(|mut channel| {
            if let Some(events) = channel.receive_events() {
                ctx.add_stream(events.map(AiLegSignal));
            }
            channel
        });
        let directive = self.controller.on_ai_leg_opened(result);
        self.apply(directive, ctx);
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match protocol::parse_inbound(text) {
            Ok(TelephonyEvent::Unknown) => {
                debug!(
                    session_id = %self.session_id,
                    event = protocol::event_name(text).as_deref().unwrap_or("<none>"),
                    "Ignoring unknown telephony event"
                );
            }
            Ok(event) => {
                let directive = self.controller.on_telephony_event(event);
                self.apply(directive, ctx);
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Dropping malformed telephony message");
            }
        }
    }

    fn transport_closed(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let directive = self.controller.on_telephony_closed();
        self.apply(directive, ctx);
        ctx.stop();
    }
}

impl Actor for TelephonyBridgeSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "Telephony connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "Telephony heartbeat timeout, closing connection");
                act.transport_closed(ctx);
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // No-op when the controller already reached Closed
        let _ = self.controller.on_telephony_closed();
        let snapshot = self.controller.snapshot();
        info!(
            session_id = %self.session_id,
            lifecycle = %snapshot.lifecycle,
            transcript_entries = snapshot.transcript_entries,
            "Telephony connection stopped"
        );
        self.app_state.finish_session(&snapshot);
    }
}

/// Handle incoming telephony WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TelephonyBridgeSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                warn!(session_id = %self.session_id, bytes = data.len(), "Ignoring binary telephony frame");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, reason = ?reason, "Telephony WebSocket closed");
                ctx.close(reason);
                self.transport_closed(ctx);
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "Telephony WebSocket protocol error");
                self.transport_closed(ctx);
            }
        }
    }
}

/// Handle items from the voice-AI leg.
impl StreamHandler<AiLegSignal> for TelephonyBridgeSocket {
    fn handle(&mut self, signal: AiLegSignal, ctx: &mut Self::Context) {
        let directive = match signal.0 {
            Ok(event) => self.controller.on_ai_event(event),
            Err(reason) => self.controller.on_ai_leg_closed(reason),
        };
        self.apply(directive, ctx);
    }

    /// The voice-AI stream ending must not stop the telephony actor.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Voice-AI event stream finished");
    }
}

/// WebSocket endpoint handler for the telephony media stream.
///
/// ## HTTP to WebSocket Upgrade:
/// A slot in the session registry is reserved before the upgrade; it is released when
/// the actor stops, or right away if the upgrade itself fails.
pub async fn telephony_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let session_id = Uuid::new_v4().to_string();
    let call_sid_hint = req.match_info().get("call_sid").map(str::to_string);
    info!(
        session_id = %session_id,
        call_sid_hint = ?call_sid_hint,
        peer = ?req.connection_info().peer_addr(),
        "New telephony connection request"
    );

    // Each call keeps the configuration it started with
    let config = app_state.get_config();
    let controller = BridgeController::new(session_id.clone(), QueuedTelephonyLeg::default(), config.bridge.clone())
        .with_call_sid_hint(call_sid_hint);
    let snapshot = controller.snapshot();

    if !app_state.try_register_session(snapshot.clone(), config.performance.max_concurrent_sessions) {
        warn!(
            session_id = %session_id,
            max_sessions = config.performance.max_concurrent_sessions,
            "Rejecting telephony connection, session limit reached"
        );
        return Err(AppError::ServiceUnavailable(format!(
            "Maximum concurrent sessions ({}) reached",
            config.performance.max_concurrent_sessions
        ))
        .into());
    }

    let connector = AiVoiceConnector::from_config(&config.hume, &config.bridge);
    let actor = TelephonyBridgeSocket::new(session_id, controller, connector, app_state.clone());

    ws::start(actor, &req, stream).map_err(|e| {
        app_state.finish_session(&snapshot);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::bridge::controller::Lifecycle;
    use actix_web::http::StatusCode;
    use actix_web::test::TestRequest;
    use actix_web::{App, FromRequest, HttpServer};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use futures_util::SinkExt;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..250 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within 5s");
    }

    /// Voice-AI stand-in: reports every JSON message it receives and answers each
    /// `audio_input` with 240 bytes of linear16 audio.
    async fn fake_voice_ai() -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/v0/evi/chat", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                let WsMessage::Text(text) = message else { continue };
                let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                if value["type"] == "audio_input" {
                    let reply = json!({"type": "audio_output", "data": BASE64.encode(vec![0u8; 240])});
                    ws.send(WsMessage::Text(reply.to_string().into())).await.unwrap();
                }
                let _ = seen_tx.send(value);
            }
        });

        (endpoint, seen_rx)
    }

    #[test]
    fn test_queued_leg_preserves_order() {
        let mut leg = QueuedTelephonyLeg::default();
        leg.send(&OutboundTelephonyMessage::mark("ST1", "a")).unwrap();
        leg.send(&OutboundTelephonyMessage::media("ST1", &[0xFF])).unwrap();

        let sent: Vec<String> = leg.drain().collect();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("\"mark\""));
        assert!(sent[1].contains("\"media\""));
        assert_eq!(leg.drain().count(), 0);
    }

    #[actix_web::test]
    async fn test_upgrade_refused_at_session_limit() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let state = web::Data::new(AppState::new(config));

        let occupied: BridgeController<QueuedTelephonyLeg, AiVoiceChannel> =
            BridgeController::new("existing", QueuedTelephonyLeg::default(), AppConfig::default().bridge);
        assert!(state.try_register_session(occupied.snapshot(), 1));

        let (req, mut payload) = TestRequest::get().uri("/ws/telephony").to_http_parts();
        let stream = web::Payload::from_request(&req, &mut payload).await.unwrap();
        let err = telephony_websocket(req, stream, state.clone()).await.unwrap_err();

        assert_eq!(err.as_response_error().status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.active_sessions(), 1);
        assert_eq!(state.get_metrics_snapshot().sessions_rejected, 1);
    }

    #[actix_web::test]
    async fn test_failed_upgrade_releases_slot() {
        let state = web::Data::new(AppState::new(AppConfig::default()));

        // Plain GET without upgrade headers
        let (req, mut payload) = TestRequest::get().uri("/ws/telephony/CA123").to_http_parts();
        let stream = web::Payload::from_request(&req, &mut payload).await.unwrap();
        let result = telephony_websocket(req, stream, state.clone()).await;

        assert!(result.is_err());
        assert_eq!(state.active_sessions(), 0);
        assert_eq!(state.get_metrics_snapshot().sessions_started, 1);
    }

    #[actix_web::test]
    async fn test_call_is_bridged_end_to_end() {
        let (endpoint, mut seen) = fake_voice_ai().await;

        let mut config = AppConfig::default();
        config.hume.api_key = "test-key".to_string();
        config.hume.secret_key = "test-secret".to_string();
        config.hume.config_id = "cfg-e2e".to_string();
        config.hume.endpoint = endpoint;
        let state = web::Data::new(AppState::new(config));

        let app_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_state.clone())
                .route("/ws/telephony", web::get().to(telephony_websocket))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let server_handle = server.handle();
        actix_web::rt::spawn(server);

        let (mut phone, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/telephony", addr))
            .await
            .unwrap();

        let start = json!({
            "event": "start",
            "start": {
                "callSid": "CA1",
                "streamSid": "ST1",
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            },
            "streamSid": "ST1"
        });
        phone.send(WsMessage::Text(start.to_string().into())).await.unwrap();

        let settings = tokio::time::timeout(Duration::from_secs(5), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settings["type"], "session_settings");
        assert_eq!(settings["config_id"], "cfg-e2e");

        let registry = state.clone();
        wait_until(|| {
            registry
                .session_snapshots()
                .iter()
                .any(|s| s.lifecycle == Lifecycle::Active)
        })
        .await;

        // 20ms of µ-law from the caller
        let media = json!({"event": "media", "streamSid": "ST1", "media": {"payload": BASE64.encode(vec![0xFFu8; 160])}});
        phone.send(WsMessage::Text(media.to_string().into())).await.unwrap();

        let audio = tokio::time::timeout(Duration::from_secs(5), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(audio["type"], "audio_input");
        let pcm = BASE64.decode(audio["data"].as_str().unwrap()).unwrap();
        assert_eq!(pcm.len(), 320);

        // The 240 byte reply comes back as one 120 byte media frame; marks may surround it
        let outbound = loop {
            let message = tokio::time::timeout(Duration::from_secs(5), phone.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let WsMessage::Text(text) = message else { continue };
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            if value["event"] == "media" {
                break value;
            }
        };
        assert_eq!(outbound["streamSid"], "ST1");
        let mulaw = BASE64.decode(outbound["media"]["payload"].as_str().unwrap()).unwrap();
        assert_eq!(mulaw.len(), 120);

        phone.send(WsMessage::Text(json!({"event": "stop"}).to_string().into())).await.unwrap();

        let registry = state.clone();
        wait_until(|| registry.active_sessions() == 0).await;
        assert_eq!(state.get_metrics_snapshot().sessions_started, 1);

        // Nothing after the first message was another handshake
        while let Ok(value) = seen.try_recv() {
            assert_ne!(value["type"], "session_settings");
        }

        server_handle.stop(false).await;
    }
}
