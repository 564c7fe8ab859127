//! # Voice-AI WebSocket Client
//!
//! Opens the outbound connection for one call and hands back an [`AiVoiceChannel`].
//!
//! ## Connection Lifecycle:
//! 1. **Open**: credentials checked locally, then WebSocket upgrade with auth headers
//! 2. **Handshake**: exactly one `session_settings` message, inside the connect timeout
//! 3. **Drive**: a spawned task owns the socket, draining the outbound queue, decoding
//!    inbound frames and pinging the service
//! 4. **Close**: orderly close frame on request, or a `ChannelClosed` item on the event
//!    stream when the socket fails or goes quiet
//!
//! ## Concurrency:
//! The channel handle never touches the socket. Outbound frames go through a bounded
//! mpsc queue; inbound events come back through a second one, exposed as a stream.

use crate::ai_voice::protocol::{self, AiVoiceEvent, OutboundAiMessage};
use crate::audio::frame::{AudioEncoding, AudioFrame};
use crate::config::{BridgeConfig, HumeConfig};
use crate::error::BridgeError;

use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type AiSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Items yielded by [`AiVoiceChannel::receive_events`].
///
/// An `Err` is always `ChannelClosed` and is always the last item.
pub type AiVoiceItem = Result<AiVoiceEvent, BridgeError>;

/// Depth of the inbound event queue between the driver and the session actor.
const EVENT_QUEUE_DEPTH: usize = 64;

const CLOSED_LOCALLY: &str = "closed locally";

/// API key and secret key for the voice-AI service.
#[derive(Clone)]
pub struct AiVoiceCredentials {
    pub api_key: String,
    pub secret_key: String,
}

impl fmt::Debug for AiVoiceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiVoiceCredentials")
            .field("api_key", &"********")
            .field("secret_key", &"********")
            .finish()
    }
}

/// Everything needed to open a voice-AI leg, captured from configuration at call start.
#[derive(Debug, Clone)]
pub struct AiVoiceConnector {
    credentials: AiVoiceCredentials,
    config_id: String,
    endpoint: String,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    queue_depth: usize,
}

impl AiVoiceConnector {
    pub fn new(credentials: AiVoiceCredentials, config_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let hume = HumeConfig::default();
        Self {
            credentials,
            config_id: config_id.into(),
            endpoint: endpoint.into(),
            connect_timeout: hume.connect_timeout(),
            heartbeat_interval: hume.heartbeat_interval(),
            heartbeat_timeout: hume.heartbeat_timeout(),
            queue_depth: BridgeConfig::default().ai_send_queue_depth,
        }
    }

    pub fn from_config(hume: &HumeConfig, bridge: &BridgeConfig) -> Self {
        let credentials = AiVoiceCredentials {
            api_key: hume.api_key.clone(),
            secret_key: hume.secret_key.clone(),
        };
        let mut connector = Self::new(credentials, hume.config_id.clone(), hume.endpoint.clone())
            .with_connect_timeout(hume.connect_timeout())
            .with_heartbeat(hume.heartbeat_interval(), hume.heartbeat_timeout());
        connector.queue_depth = bridge.ai_send_queue_depth.max(1);
        connector
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Open the voice-AI leg for one call.
    ///
    /// ## Errors:
    /// - `ConfigInvalid`: a credential or the config id is missing (no network call is made)
    /// - `ConnectTimeout`: upgrade plus handshake did not finish within the connect timeout
    /// - `AuthRejected`: the service answered the upgrade with an HTTP error status
    /// - `Transport`: any other connection failure
    pub async fn open(&self, session_id: &str) -> Result<AiVoiceChannel, BridgeError> {
        self.check_credentials()?;
        let request = self.build_request()?;

        info!(session_id = %session_id, endpoint = %self.endpoint, "Connecting to voice-AI service");

        let handshake = async {
            let (mut socket, response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(map_connect_error)?;
            debug!(session_id = %session_id, status = response.status().as_u16(), "Voice-AI upgrade accepted");

            let settings = OutboundAiMessage::session_settings(&self.config_id).to_json()?;
            socket
                .send(WsMessage::Text(settings.into()))
                .await
                .map_err(|e| BridgeError::Transport(format!("failed to send session_settings: {}", e)))?;
            Ok::<_, BridgeError>(socket)
        };

        let socket = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| BridgeError::ConnectTimeout(self.connect_timeout.as_millis() as u64))??;

        let (command_tx, command_rx) = mpsc::channel(self.queue_depth);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let heartbeat = Heartbeat {
            interval: self.heartbeat_interval,
            timeout: self.heartbeat_timeout,
        };

        tokio::spawn(drive_socket(socket, command_rx, event_tx, heartbeat, session_id.to_string()));

        info!(session_id = %session_id, config_id = %self.config_id, "Voice-AI leg open");

        Ok(AiVoiceChannel {
            commands: command_tx,
            events: Some(event_rx),
            session_id: session_id.to_string(),
            closed: false,
        })
    }

    fn check_credentials(&self) -> Result<(), BridgeError> {
        let mut missing = Vec::new();
        if self.credentials.api_key.trim().is_empty() {
            missing.push("api_key");
        }
        if self.credentials.secret_key.trim().is_empty() {
            missing.push("secret_key");
        }
        if self.config_id.trim().is_empty() {
            missing.push("config_id");
        }
        if !missing.is_empty() {
            return Err(BridgeError::ConfigInvalid(format!("missing {}", missing.join(", "))));
        }

        let id_ok = self
            .config_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !id_ok {
            return Err(BridgeError::ConfigInvalid(format!(
                "config_id '{}' contains unsupported characters",
                self.config_id
            )));
        }
        Ok(())
    }

    fn build_request(&self) -> Result<Request, BridgeError> {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        let url = format!("{}{}config_id={}", self.endpoint, separator, self.config_id);

        let mut request = url
            .into_client_request()
            .map_err(|e| BridgeError::ConfigInvalid(format!("invalid endpoint '{}': {}", self.endpoint, e)))?;

        let api_key = HeaderValue::from_str(&self.credentials.api_key)
            .map_err(|_| BridgeError::ConfigInvalid("api_key is not a valid header value".to_string()))?;
        let secret_key = HeaderValue::from_str(&self.credentials.secret_key)
            .map_err(|_| BridgeError::ConfigInvalid("secret_key is not a valid header value".to_string()))?;

        request.headers_mut().insert("X-Hume-Api-Key", api_key);
        request.headers_mut().insert("X-Hume-Secret-Key", secret_key);
        Ok(request)
    }
}

fn map_connect_error(err: tungstenite::Error) -> BridgeError {
    match err {
        tungstenite::Error::Http(response) => BridgeError::AuthRejected {
            status: response.status().as_u16(),
            reason: response
                .status()
                .canonical_reason()
                .unwrap_or("upgrade rejected")
                .to_string(),
        },
        other => BridgeError::Transport(other.to_string()),
    }
}

/// Handle to an open voice-AI leg.
///
/// Owned by exactly one session controller. Dropping it closes the socket.
#[derive(Debug)]
pub struct AiVoiceChannel {
    commands: mpsc::Sender<DriverCommand>,
    events: Option<mpsc::Receiver<AiVoiceItem>>,
    session_id: String,
    closed: bool,
}

#[derive(Debug)]
enum DriverCommand {
    Send(String),
    Close,
}

impl AiVoiceChannel {
    /// Queue one linear16 frame as an `audio_input` message.
    ///
    /// Never blocks. A full queue drops this frame only (`QueueFull`); a closed leg is
    /// `ChannelClosed`.
    pub fn send(&self, frame: &AudioFrame) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ChannelClosed("voice-AI leg already closed".to_string()));
        }
        if frame.encoding != AudioEncoding::Linear16 {
            return Err(BridgeError::Encode(format!(
                "voice-AI leg expects linear16, got {:?}",
                frame.encoding
            )));
        }

        let json = OutboundAiMessage::audio_input(&frame.payload).to_json()?;
        self.commands.try_send(DriverCommand::Send(json)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BridgeError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                BridgeError::ChannelClosed("voice-AI connection is gone".to_string())
            }
        })
    }

    /// Take the inbound event stream. Available once; later calls return `None`.
    pub fn receive_events(&mut self) -> Option<ReceiverStream<AiVoiceItem>> {
        self.events.take().map(ReceiverStream::new)
    }

    /// Request an orderly close. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!(session_id = %self.session_id, "Closing voice-AI leg");
        // A full queue still closes: the driver stops once this handle is dropped.
        let _ = self.commands.try_send(DriverCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.commands.is_closed()
    }
}

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    interval: Duration,
    timeout: Duration,
}

/// Owns the socket for the lifetime of the leg.
async fn drive_socket(
    socket: AiSocket,
    mut commands: mpsc::Receiver<DriverCommand>,
    events: mpsc::Sender<AiVoiceItem>,
    heartbeat: Heartbeat,
    session_id: String,
) {
    let (mut sink, mut stream) = socket.split();
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping_sent_at: Option<Instant> = None;

    let reason = loop {
        let pong_deadline = ping_sent_at.map(|sent| sent + heartbeat.timeout);

        tokio::select! {
            command = commands.recv() => match command {
                Some(DriverCommand::Send(json)) => {
                    if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                        break format!("send failed: {}", e);
                    }
                }
                Some(DriverCommand::Close) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break CLOSED_LOCALLY.to_string();
                }
            },

            incoming = stream.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => break format!("transport error: {}", e),
                    None => break "connection ended".to_string(),
                };
                // Any traffic proves the service is alive
                ping_sent_at = None;

                match message {
                    WsMessage::Text(text) => {
                        if let Some(event) = classify(text.as_str(), &session_id) {
                            if events.send(Ok(event)).await.is_err() {
                                debug!(session_id = %session_id, "Voice-AI event consumer gone");
                            }
                        }
                    }
                    WsMessage::Close(frame) => {
                        break match frame {
                            Some(frame) => format!("closed by remote ({}): {}", frame.code, frame.reason),
                            None => "closed by remote".to_string(),
                        };
                    }
                    WsMessage::Binary(data) => {
                        debug!(session_id = %session_id, bytes = data.len(), "Ignoring binary voice-AI frame");
                    }
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                }
            }

            _ = ticker.tick() => {
                // One ping outstanding at a time
                if ping_sent_at.is_none() {
                    if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                        break format!("ping failed: {}", e);
                    }
                    ping_sent_at = Some(Instant::now());
                }
            }

            _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                break "heartbeat timeout".to_string();
            }
        }
    };

    if reason == CLOSED_LOCALLY {
        debug!(session_id = %session_id, "Voice-AI leg closed");
    } else {
        warn!(session_id = %session_id, reason = %reason, "Voice-AI leg ended");
    }
    let _ = events.send(Err(BridgeError::ChannelClosed(reason))).await;
}

/// Decode one text frame, logging the ones that are dropped.
fn classify(text: &str, session_id: &str) -> Option<AiVoiceEvent> {
    match protocol::decode_event(text) {
        Ok(AiVoiceEvent::Unknown) => {
            debug!(
                session_id = %session_id,
                event_type = protocol::event_type(text).as_deref().unwrap_or("<none>"),
                "Ignoring unknown voice-AI event"
            );
            None
        }
        Ok(event) => Some(event),
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Dropping malformed voice-AI message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request as ServerRequest, Response};
    use tokio_tungstenite::tungstenite::http::{self, StatusCode};

    fn connector(endpoint: String) -> AiVoiceConnector {
        AiVoiceConnector::new(
            AiVoiceCredentials {
                api_key: "test-key".to_string(),
                secret_key: "test-secret".to_string(),
            },
            "cfg-123",
            endpoint,
        )
    }

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/v0/evi/chat", listener.local_addr().unwrap());
        (listener, endpoint)
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_without_network() {
        let connector = AiVoiceConnector::new(
            AiVoiceCredentials {
                api_key: String::new(),
                secret_key: "secret".to_string(),
            },
            "",
            "ws://127.0.0.1:9/unused",
        );
        match connector.open("s1").await {
            Err(BridgeError::ConfigInvalid(msg)) => {
                assert!(msg.contains("api_key"));
                assert!(msg.contains("config_id"));
            }
            other => panic!("expected ConfigInvalid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_then_relay_both_ways() {
        let (listener, endpoint) = listener().await;
        let seen: Arc<Mutex<Option<(String, Option<String>)>>> = Arc::new(Mutex::new(None));
        let seen_server = seen.clone();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = move |req: &ServerRequest, resp: Response| -> Result<Response, ErrorResponse> {
                let key = req
                    .headers()
                    .get("x-hume-api-key")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                *seen_server.lock().unwrap() = Some((req.uri().to_string(), key));
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await.unwrap();

            let settings = ws.next().await.unwrap().unwrap().into_text().unwrap();
            ws.send(WsMessage::Text(r#"{"type": "audio_output", "data": "AQI="}"#.to_string().into()))
                .await
                .unwrap();
            let audio = ws.next().await.unwrap().unwrap().into_text().unwrap();
            (settings.to_string(), audio.to_string())
        });

        let mut channel = connector(endpoint).open("s1").await.unwrap();
        let mut events = channel.receive_events().unwrap();
        assert!(channel.receive_events().is_none());

        let frame = AudioFrame::new(AudioEncoding::Linear16, vec![0x01, 0x02], 1);
        channel.send(&frame).unwrap();

        match events.next().await {
            Some(Ok(AiVoiceEvent::AudioOutput { data, .. })) => assert_eq!(data, "AQI="),
            other => panic!("unexpected item {:?}", other),
        }

        let (settings, audio) = server.await.unwrap();
        let settings: serde_json::Value = serde_json::from_str(&settings).unwrap();
        assert_eq!(settings["type"], "session_settings");
        assert_eq!(settings["config_id"], "cfg-123");
        assert_eq!(settings["audio"]["sample_rate"], 8000);
        let audio: serde_json::Value = serde_json::from_str(&audio).unwrap();
        assert_eq!(audio["type"], "audio_input");
        assert_eq!(audio["data"], "AQI=");

        let (uri, key) = seen.lock().unwrap().clone().unwrap();
        assert!(uri.contains("config_id=cfg-123"));
        assert_eq!(key.as_deref(), Some("test-key"));

        // Server dropped the socket: the stream ends with ChannelClosed
        match events.next().await {
            Some(Err(BridgeError::ChannelClosed(_))) => {}
            other => panic!("expected ChannelClosed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_upgrade_is_auth_rejected() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let reject = |_req: &ServerRequest, _resp: Response| -> Result<Response, ErrorResponse> {
                Err(http::Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .body(None)
                    .unwrap())
            };
            let _ = tokio_tungstenite::accept_hdr_async(tcp, reject).await;
        });

        match connector(endpoint).open("s1").await {
            Err(BridgeError::AuthRejected { status, .. }) => assert_eq!(status, 401),
            other => panic!("expected AuthRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_server_is_connect_timeout() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let result = connector(endpoint)
            .with_connect_timeout(Duration::from_millis(300))
            .open("s1")
            .await;
        assert!(matches!(result, Err(BridgeError::ConnectTimeout(_))));
    }

    #[tokio::test]
    async fn test_unanswered_ping_closes_the_leg() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            // Never read, so pings are never answered
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut channel = connector(endpoint)
            .with_heartbeat(Duration::from_millis(200), Duration::from_millis(200))
            .open("s1")
            .await
            .unwrap();
        let mut events = channel.receive_events().unwrap();

        let item = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap();
        match item {
            Some(Err(BridgeError::ChannelClosed(reason))) => assert!(reason.contains("heartbeat")),
            other => panic!("expected heartbeat failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pong_deadline_shorter_than_ping_interval() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut channel = connector(endpoint)
            .with_heartbeat(Duration::from_millis(1000), Duration::from_millis(100))
            .open("s1")
            .await
            .unwrap();
        let mut events = channel.receive_events().unwrap();
        let opened_at = Instant::now();

        // Ping at 1s, deadline at 1.1s; the next ping tick would be 2s
        let item = tokio::time::timeout(Duration::from_millis(1800), events.next())
            .await
            .unwrap();
        match item {
            Some(Err(BridgeError::ChannelClosed(reason))) => assert_eq!(reason, "heartbeat timeout"),
            other => panic!("expected heartbeat failure, got {:?}", other),
        }
        assert!(opened_at.elapsed() >= Duration::from_millis(1000));
    }

    #[test]
    fn test_new_takes_section_defaults() {
        let connector = connector("ws://127.0.0.1:9/unused".to_string());
        let hume = HumeConfig::default();
        assert_eq!(connector.connect_timeout, hume.connect_timeout());
        assert_eq!(connector.heartbeat_interval, hume.heartbeat_interval());
        assert_eq!(connector.heartbeat_timeout, hume.heartbeat_timeout());
        assert_eq!(connector.queue_depth, BridgeConfig::default().ai_send_queue_depth);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_sends_close_frame() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _settings = ws.next().await.unwrap().unwrap();
            matches!(ws.next().await, Some(Ok(WsMessage::Close(_))))
        });

        let mut channel = connector(endpoint).open("s1").await.unwrap();
        channel.close();
        channel.close();
        assert!(channel.is_closed());

        let frame = AudioFrame::new(AudioEncoding::Linear16, vec![0, 0], 1);
        assert!(matches!(channel.send(&frame), Err(BridgeError::ChannelClosed(_))));
        assert!(server.await.unwrap());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = AiVoiceCredentials {
            api_key: "abc".to_string(),
            secret_key: "def".to_string(),
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("abc"));
        assert!(!printed.contains("def"));
    }
}
