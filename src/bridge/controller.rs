//! # Bridge Session Controller
//!
//! The per-call state machine. It owns both leg handles and is the only place where
//! audio crosses from one leg to the other.
//!
//! ## Lifecycle:
//! ```text
//! Idle --start--> Connecting --leg open--> Active --stop / leg lost--> Closing --both legs closed--> Closed
//!                     |                                                   ^
//!                     +----------- open failed / stop / bad format -------+
//! ```
//!
//! ## Relay Rules:
//! - Caller audio is only forwarded while `Active`; anything earlier or later is dropped
//! - Frames are transcoded once per hop and never buffered
//! - Frame-scoped failures drop one frame; leg-fatal failures move the call to `Closing`
//! - Nothing is reported to the opposite leg
//!
//! The controller is synchronous. Its host feeds it one input at a time, which keeps the
//! session single-writer without any locking.

use crate::ai_voice::protocol as ai_protocol;
use crate::ai_voice::{AiVoiceChannel, AiVoiceEvent};
use crate::audio::{codec, BRIDGE_SAMPLE_RATE};
use crate::audio::frame::{split_payload, AudioEncoding, AudioFrame, Direction, FrameSequencer};
use crate::bridge::transcript::{Speaker, Transcript};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::telephony::protocol::{MediaPayload, OutboundTelephonyMessage, StreamStart, TelephonyEvent};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Outbound half of the telephony leg, as seen by the controller.
pub trait TelephonyLeg {
    fn send(&mut self, message: &OutboundTelephonyMessage) -> Result<(), BridgeError>;
}

/// Outbound half of the voice-AI leg, as seen by the controller.
pub trait AiVoiceLeg {
    fn send_audio(&mut self, frame: &AudioFrame) -> Result<(), BridgeError>;
    fn close(&mut self);
}

impl AiVoiceLeg for AiVoiceChannel {
    fn send_audio(&mut self, frame: &AudioFrame) -> Result<(), BridgeError> {
        self.send(frame)
    }

    fn close(&mut self) {
        AiVoiceChannel::close(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Connecting => "connecting",
            Lifecycle::Active => "active",
            Lifecycle::Closing => "closing",
            Lifecycle::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Call identity announced by the telephony `start` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallIdentity {
    pub call_sid: String,
    pub stream_sid: String,
}

/// What the host has to do after feeding an input to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Nothing beyond what the controller already did
    Continue,
    /// Open the voice-AI leg and report back through `on_ai_leg_opened`
    OpenAiLeg(CallIdentity),
    /// The session reached `Closed`
    Terminate,
}

/// Relay counters, for diagnostics only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub frames_to_ai_voice: u64,
    pub frames_to_telephony: u64,
    pub dropped_to_ai_voice: u64,
    pub dropped_to_telephony: u64,
    pub marks_sent: u64,
    pub ai_events: u64,
    /// Times the caller talked over the assistant
    pub interruptions: u64,
}

/// Point-in-time view of one session, published to the registry.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub call_sid_hint: Option<String>,
    pub call_sid: Option<String>,
    pub stream_sid: Option<String>,
    pub lifecycle: Lifecycle,
    pub stats: RelayStats,
    pub transcript_entries: usize,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct BridgeController<T: TelephonyLeg, A: AiVoiceLeg> {
    session_id: String,
    call_sid_hint: Option<String>,
    settings: BridgeConfig,
    lifecycle: Lifecycle,
    telephony: T,
    telephony_open: bool,
    ai: Option<A>,
    ai_pending: bool,
    identity: Option<CallIdentity>,
    sequencer: FrameSequencer,
    stats: RelayStats,
    transcript: Transcript,
    bursts: u64,
    last_error: Option<String>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<T: TelephonyLeg, A: AiVoiceLeg> BridgeController<T, A> {
    pub fn new(session_id: impl Into<String>, telephony: T, settings: BridgeConfig) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            call_sid_hint: None,
            transcript: Transcript::new(settings.transcript_max_entries),
            settings,
            lifecycle: Lifecycle::Idle,
            telephony,
            telephony_open: true,
            ai: None,
            ai_pending: false,
            identity: None,
            sequencer: FrameSequencer::default(),
            stats: RelayStats::default(),
            bursts: 0,
            last_error: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Record the call id taken from the connection URL, before `start` confirms it.
    pub fn with_call_sid_hint(mut self, hint: Option<String>) -> Self {
        self.call_sid_hint = hint;
        self
    }

    /// The telephony leg, for hosts that flush its output themselves.
    pub fn telephony_mut(&mut self) -> &mut T {
        &mut self.telephony
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            call_sid_hint: self.call_sid_hint.clone(),
            call_sid: self.identity.as_ref().map(|i| i.call_sid.clone()),
            stream_sid: self.identity.as_ref().map(|i| i.stream_sid.clone()),
            lifecycle: self.lifecycle,
            stats: self.stats.clone(),
            transcript_entries: self.transcript.len(),
            last_error: self.last_error.clone(),
            started_at: self.started_at,
            updated_at: self.updated_at,
        }
    }

    /// Feed one parsed telephony event.
    pub fn on_telephony_event(&mut self, event: TelephonyEvent) -> Directive {
        self.updated_at = Utc::now();
        match event {
            TelephonyEvent::Connected { protocol } => {
                debug!(session_id = %self.session_id, protocol = ?protocol, "Telephony stream connected");
                Directive::Continue
            }
            TelephonyEvent::Start { start } => self.handle_start(start),
            TelephonyEvent::Media { media } => {
                self.handle_media(&media);
                self.settle()
            }
            TelephonyEvent::Mark { mark } => {
                debug!(session_id = %self.session_id, mark = %mark.name, "Playback reached mark");
                Directive::Continue
            }
            TelephonyEvent::Dtmf { dtmf } => {
                info!(session_id = %self.session_id, digit = %dtmf.digit, "Caller pressed a key");
                Directive::Continue
            }
            TelephonyEvent::Stop => {
                info!(
                    session_id = %self.session_id,
                    lifecycle = %self.lifecycle,
                    frames_to_ai_voice = self.stats.frames_to_ai_voice,
                    frames_to_telephony = self.stats.frames_to_telephony,
                    "Telephony stream stopped"
                );
                self.telephony_open = false;
                self.begin_closing();
                self.settle()
            }
            TelephonyEvent::Unknown => {
                debug!(session_id = %self.session_id, "Ignoring unknown telephony event");
                Directive::Continue
            }
        }
    }

    /// The telephony transport closed, with or without a `stop` first.
    pub fn on_telephony_closed(&mut self) -> Directive {
        self.updated_at = Utc::now();
        if self.telephony_open {
            info!(session_id = %self.session_id, lifecycle = %self.lifecycle, "Telephony transport closed");
        }
        self.telephony_open = false;
        self.begin_closing();
        self.settle()
    }

    /// Result of the open requested by [`Directive::OpenAiLeg`].
    pub fn on_ai_leg_opened(&mut self, result: Result<A, BridgeError>) -> Directive {
        self.updated_at = Utc::now();
        self.ai_pending = false;
        match result {
            Ok(mut leg) => {
                if self.lifecycle == Lifecycle::Connecting {
                    info!(session_id = %self.session_id, "Bridge active");
                    self.ai = Some(leg);
                    self.lifecycle = Lifecycle::Active;
                } else {
                    debug!(
                        session_id = %self.session_id,
                        lifecycle = %self.lifecycle,
                        "Voice-AI leg opened after the call ended, closing it"
                    );
                    leg.close();
                }
            }
            Err(e) => {
                error!(
                    session_id = %self.session_id,
                    error_kind = e.kind(),
                    error = %e,
                    "Could not open voice-AI leg; caller audio will be dropped"
                );
                self.last_error = Some(e.to_string());
                if self.lifecycle == Lifecycle::Connecting {
                    self.lifecycle = Lifecycle::Closing;
                }
            }
        }
        self.settle()
    }

    /// Feed one event from the voice-AI leg.
    pub fn on_ai_event(&mut self, event: AiVoiceEvent) -> Directive {
        self.updated_at = Utc::now();
        if self.lifecycle != Lifecycle::Active {
            debug!(session_id = %self.session_id, event = event.kind(), lifecycle = %self.lifecycle, "Ignoring voice-AI event");
            return Directive::Continue;
        }
        self.stats.ai_events += 1;

        match event {
            AiVoiceEvent::AudioOutput { data, index } => {
                self.relay_to_telephony(&data, index);
            }
            AiVoiceEvent::UserTranscript { message, models, interim } => {
                if interim {
                    debug!(session_id = %self.session_id, text = %message.content, "Caller speaking");
                } else {
                    let emotions = models.map(|m| m.top_emotions(3)).unwrap_or_default();
                    info!(session_id = %self.session_id, text = %message.content, emotions = ?emotions, "Caller said");
                    self.transcript.push(Speaker::Caller, &message.content);
                }
            }
            AiVoiceEvent::AssistantTranscript { message, .. } => {
                info!(session_id = %self.session_id, text = %message.content, "Assistant said");
                self.transcript.push(Speaker::Assistant, &message.content);
            }
            AiVoiceEvent::ProsodyInfo { models } => {
                let emotions = models.map(|m| m.top_emotions(3)).unwrap_or_default();
                debug!(session_id = %self.session_id, emotions = ?emotions, "Assistant prosody");
            }
            AiVoiceEvent::AssistantEnd => {
                debug!(session_id = %self.session_id, "Assistant finished its turn");
            }
            AiVoiceEvent::UserInterruption => {
                self.stats.interruptions += 1;
                info!(session_id = %self.session_id, interruptions = self.stats.interruptions, "Caller interrupted the assistant");
            }
            AiVoiceEvent::EmotionScores { emotions } => {
                let top = ai_protocol::top_scores(&emotions, 3);
                debug!(session_id = %self.session_id, emotions = ?top, "Emotion scores");
            }
            AiVoiceEvent::ErrorEvent { code, message, slug } => {
                warn!(
                    session_id = %self.session_id,
                    code = %code,
                    slug = ?slug,
                    message = %message,
                    "Voice-AI service reported an error"
                );
            }
            AiVoiceEvent::ChatMetadata { chat_id, chat_group_id } => {
                info!(session_id = %self.session_id, chat_id = %chat_id, chat_group_id = ?chat_group_id, "Voice-AI chat started");
            }
            AiVoiceEvent::Unknown => {}
        }
        self.settle()
    }

    /// The voice-AI leg is gone.
    pub fn on_ai_leg_closed(&mut self, reason: BridgeError) -> Directive {
        self.updated_at = Utc::now();
        if self.ai.take().is_none() {
            // Already closed by us
            return self.settle();
        }
        if self.lifecycle == Lifecycle::Active {
            error!(session_id = %self.session_id, error = %reason, "Voice-AI leg lost, no longer relaying");
            self.last_error = Some(reason.to_string());
            self.lifecycle = Lifecycle::Closing;
        }
        self.settle()
    }

    fn handle_start(&mut self, start: StreamStart) -> Directive {
        if self.lifecycle != Lifecycle::Idle {
            warn!(
                session_id = %self.session_id,
                stream_sid = %start.stream_sid,
                lifecycle = %self.lifecycle,
                "Ignoring duplicate start event"
            );
            return Directive::Continue;
        }

        let identity = CallIdentity {
            call_sid: start.call_sid,
            stream_sid: start.stream_sid,
        };
        if let Some(hint) = &self.call_sid_hint {
            if hint != &identity.call_sid {
                warn!(session_id = %self.session_id, hint = %hint, call_sid = %identity.call_sid, "Call id differs from connection path");
            }
        }
        info!(
            session_id = %self.session_id,
            call_sid = %identity.call_sid,
            stream_sid = %identity.stream_sid,
            encoding = %start.media_format.encoding,
            sample_rate = start.media_format.sample_rate,
            "Telephony stream started"
        );
        self.identity = Some(identity.clone());

        if let Err(reason) = start.media_format.validate() {
            error!(session_id = %self.session_id, reason = %reason, "Misconfigured telephony media format");
            self.last_error = Some(format!("misconfigured media format: {}", reason));
            self.lifecycle = Lifecycle::Closing;
            return self.settle();
        }

        self.lifecycle = Lifecycle::Connecting;
        self.ai_pending = true;
        Directive::OpenAiLeg(identity)
    }

    fn handle_media(&mut self, media: &MediaPayload) {
        if self.lifecycle != Lifecycle::Active {
            self.stats.dropped_to_ai_voice += 1;
            if self.stats.dropped_to_ai_voice == 1 {
                warn!(session_id = %self.session_id, lifecycle = %self.lifecycle, "Dropping caller audio, bridge not active");
            } else {
                debug!(session_id = %self.session_id, lifecycle = %self.lifecycle, "Dropping caller audio");
            }
            return;
        }

        let compressed = match media.decode() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.stats.dropped_to_ai_voice += 1;
                warn!(session_id = %self.session_id, error = %e, "Dropping undecodable media frame");
                return;
            }
        };
        let pcm = codec::to_linear_pcm(&compressed);
        if pcm.is_empty() {
            self.stats.dropped_to_ai_voice += 1;
            debug!(session_id = %self.session_id, "Skipping empty media frame");
            return;
        }

        let frame = AudioFrame::new(AudioEncoding::Linear16, pcm, self.sequencer.next(Direction::ToAiVoice));
        let Some(ai) = self.ai.as_mut() else {
            self.stats.dropped_to_ai_voice += 1;
            return;
        };

        match ai.send_audio(&frame) {
            Ok(()) => {
                self.stats.frames_to_ai_voice += 1;
                tracing::trace!(
                    session_id = %self.session_id,
                    sequence = frame.sequence,
                    bytes = frame.payload.len(),
                    duration_ms = frame.duration_ms(BRIDGE_SAMPLE_RATE),
                    "Relayed caller audio"
                );
            }
            Err(e) if e.is_leg_fatal() => {
                self.stats.dropped_to_ai_voice += 1;
                error!(session_id = %self.session_id, error = %e, "Voice-AI leg closed during send");
                self.last_error = Some(e.to_string());
                if let Some(mut leg) = self.ai.take() {
                    leg.close();
                }
                self.lifecycle = Lifecycle::Closing;
            }
            Err(e) => {
                self.stats.dropped_to_ai_voice += 1;
                warn!(session_id = %self.session_id, sequence = frame.sequence, error = %e, "Dropped caller audio frame");
            }
        }
    }

    fn relay_to_telephony(&mut self, data: &str, index: Option<u64>) {
        let pcm = match ai_protocol::decode_audio(data) {
            Ok(pcm) => pcm,
            Err(e) => {
                self.stats.dropped_to_telephony += 1;
                warn!(session_id = %self.session_id, error = %e, "Dropping undecodable assistant audio");
                return;
            }
        };
        let mulaw = match codec::to_compressed(&pcm) {
            Ok(mulaw) if !mulaw.is_empty() => mulaw,
            Ok(_) => return,
            Err(e) => {
                self.stats.dropped_to_telephony += 1;
                warn!(session_id = %self.session_id, error = %e, "Dropping assistant audio that could not be encoded");
                return;
            }
        };
        let Some(stream_sid) = self.identity.as_ref().map(|i| i.stream_sid.clone()) else {
            return;
        };

        self.bursts += 1;
        let burst = self.bursts;
        if self.settings.send_marks {
            self.send_mark(&stream_sid, format!("assistant-audio-{}-start", burst));
        }

        for chunk in split_payload(&mulaw, self.settings.max_outbound_frame_bytes, AudioEncoding::Mulaw) {
            let sequence = self.sequencer.next(Direction::ToTelephony);
            let message = OutboundTelephonyMessage::media(&stream_sid, chunk);
            match self.telephony.send(&message) {
                Ok(()) => {
                    self.stats.frames_to_telephony += 1;
                    tracing::trace!(session_id = %self.session_id, sequence, index = ?index, bytes = chunk.len(), "Relayed assistant audio");
                }
                Err(e) => {
                    self.stats.dropped_to_telephony += 1;
                    warn!(session_id = %self.session_id, sequence, error = %e, "Could not send audio to telephony leg");
                    if e.is_leg_fatal() {
                        self.telephony_open = false;
                        self.begin_closing();
                        return;
                    }
                }
            }
        }

        if self.settings.send_marks {
            self.send_mark(&stream_sid, format!("assistant-audio-{}-end", burst));
        }
    }

    fn send_mark(&mut self, stream_sid: &str, name: String) {
        // Marks are advisory; a failed one is not worth more than a debug line
        match self.telephony.send(&OutboundTelephonyMessage::mark(stream_sid, name)) {
            Ok(()) => self.stats.marks_sent += 1,
            Err(e) => debug!(session_id = %self.session_id, error = %e, "Mark not sent"),
        }
    }

    /// Move toward `Closed`: close the voice-AI leg if we still hold it.
    fn begin_closing(&mut self) {
        if let Some(mut leg) = self.ai.take() {
            leg.close();
        }
        if self.lifecycle != Lifecycle::Closed {
            self.lifecycle = Lifecycle::Closing;
        }
    }

    /// `Closing` becomes `Closed` once both legs are down and no open is in flight.
    fn settle(&mut self) -> Directive {
        if self.lifecycle == Lifecycle::Closing && self.ai.is_none() && !self.ai_pending && !self.telephony_open {
            self.lifecycle = Lifecycle::Closed;
            info!(
                session_id = %self.session_id,
                frames_to_ai_voice = self.stats.frames_to_ai_voice,
                frames_to_telephony = self.stats.frames_to_telephony,
                dropped_to_ai_voice = self.stats.dropped_to_ai_voice,
                dropped_to_telephony = self.stats.dropped_to_telephony,
                last_sequence_to_ai_voice = self.sequencer.current(Direction::ToAiVoice),
                last_sequence_to_telephony = self.sequencer.current(Direction::ToTelephony),
                caller_lines = self.transcript.count(Speaker::Caller),
                assistant_lines = self.transcript.count(Speaker::Assistant),
                "Bridge session closed"
            );
            if !self.transcript.is_empty() {
                for entry in self.transcript.entries() {
                    debug!(session_id = %self.session_id, speaker = ?entry.speaker, at = %entry.at, text = %entry.text, "Transcript");
                }
            }
        }
        if self.lifecycle == Lifecycle::Closed {
            Directive::Terminate
        } else {
            Directive::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telephony::protocol::{parse_inbound, MediaFormat};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct RecordingTelephony {
        sent: Rc<RefCell<Vec<OutboundTelephonyMessage>>>,
    }

    impl TelephonyLeg for RecordingTelephony {
        fn send(&mut self, message: &OutboundTelephonyMessage) -> Result<(), BridgeError> {
            self.sent.borrow_mut().push(message.clone());
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingAi {
        frames: Rc<RefCell<Vec<AudioFrame>>>,
        closed: Rc<RefCell<bool>>,
        fail_with: Option<BridgeError>,
    }

    impl AiVoiceLeg for RecordingAi {
        fn send_audio(&mut self, frame: &AudioFrame) -> Result<(), BridgeError> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            self.frames.borrow_mut().push(frame.clone());
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.borrow_mut() = true;
        }
    }

    fn settings(send_marks: bool) -> BridgeConfig {
        BridgeConfig {
            max_outbound_frame_bytes: 3200,
            send_marks,
            ai_send_queue_depth: 8,
            transcript_max_entries: 10,
        }
    }

    fn start_event() -> TelephonyEvent {
        TelephonyEvent::Start {
            start: StreamStart {
                call_sid: "CA1".to_string(),
                stream_sid: "ST1".to_string(),
                media_format: MediaFormat {
                    encoding: "audio/x-mulaw".to_string(),
                    sample_rate: 8000,
                    channels: 1,
                },
            },
        }
    }

    fn media_event(mulaw: &[u8]) -> TelephonyEvent {
        let text = format!(r#"{{"event": "media", "media": {{"payload": "{}"}}}}"#, BASE64.encode(mulaw));
        parse_inbound(&text).unwrap()
    }

    fn active_controller(
        send_marks: bool,
    ) -> (BridgeController<RecordingTelephony, RecordingAi>, RecordingTelephony, RecordingAi) {
        let telephony = RecordingTelephony::default();
        let ai = RecordingAi::default();
        let mut controller = BridgeController::new("s1", telephony.clone(), settings(send_marks));
        assert_eq!(
            controller.on_telephony_event(start_event()),
            Directive::OpenAiLeg(CallIdentity {
                call_sid: "CA1".to_string(),
                stream_sid: "ST1".to_string(),
            })
        );
        assert_eq!(controller.lifecycle, Lifecycle::Connecting);
        controller.on_ai_leg_opened(Ok(ai.clone()));
        assert_eq!(controller.lifecycle, Lifecycle::Active);
        (controller, telephony, ai)
    }

    #[test]
    fn test_start_then_stop_without_media_closes_cleanly() {
        let (mut controller, telephony, ai) = active_controller(true);
        assert_eq!(controller.on_telephony_event(TelephonyEvent::Stop), Directive::Terminate);
        assert_eq!(controller.lifecycle, Lifecycle::Closed);
        assert!(ai.frames.borrow().is_empty());
        assert!(*ai.closed.borrow());
        assert!(telephony.sent.borrow().is_empty());
    }

    #[test]
    fn test_caller_audio_keeps_arrival_order() {
        let (mut controller, _telephony, ai) = active_controller(false);
        controller.on_telephony_event(media_event(&[0x01; 4]));
        controller.on_telephony_event(media_event(&[0x02; 4]));
        controller.on_telephony_event(media_event(&[0x03; 4]));

        let frames = ai.frames.borrow();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames.iter().map(|f| f.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
        for (frame, code) in frames.iter().zip([0x01u8, 0x02, 0x03]) {
            assert_eq!(frame.payload, codec::to_linear_pcm(&[code; 4]));
        }
        assert_eq!(controller.stats.frames_to_ai_voice, 3);
    }

    #[test]
    fn test_closed_ai_leg_moves_to_closing() {
        let telephony = RecordingTelephony::default();
        let failing = RecordingAi {
            fail_with: Some(BridgeError::ChannelClosed("gone".to_string())),
            ..RecordingAi::default()
        };
        let mut controller = BridgeController::new("s1", telephony, settings(false));
        controller.on_telephony_event(start_event());
        controller.on_ai_leg_opened(Ok(failing.clone()));

        assert_eq!(controller.on_telephony_event(media_event(&[0xFF; 160])), Directive::Continue);
        assert_eq!(controller.lifecycle, Lifecycle::Closing);
        assert!(*failing.closed.borrow());

        // Telephony side keeps running until its own stop
        controller.on_telephony_event(media_event(&[0xFF; 160]));
        assert_eq!(controller.lifecycle, Lifecycle::Closing);
        assert_eq!(controller.on_telephony_event(TelephonyEvent::Stop), Directive::Terminate);
    }

    #[test]
    fn test_queue_full_drops_only_that_frame() {
        let telephony = RecordingTelephony::default();
        let busy = RecordingAi {
            fail_with: Some(BridgeError::QueueFull),
            ..RecordingAi::default()
        };
        let mut controller = BridgeController::new("s1", telephony, settings(false));
        controller.on_telephony_event(start_event());
        controller.on_ai_leg_opened(Ok(busy));
        controller.on_telephony_event(media_event(&[0xFF; 160]));

        assert_eq!(controller.lifecycle, Lifecycle::Active);
        assert_eq!(controller.stats.dropped_to_ai_voice, 1);
    }

    #[test]
    fn test_round_trip_audio_lengths() {
        let (mut controller, telephony, ai) = active_controller(false);

        controller.on_telephony_event(media_event(&[0xFF; 160]));
        assert_eq!(ai.frames.borrow()[0].payload.len(), 320);

        let pcm = vec![0u8; 240];
        controller.on_ai_event(AiVoiceEvent::AudioOutput {
            data: BASE64.encode(&pcm),
            index: Some(0),
        });

        let sent = telephony.sent.borrow();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            OutboundTelephonyMessage::Media { stream_sid, media } => {
                assert_eq!(stream_sid, "ST1");
                assert_eq!(BASE64.decode(&media.payload).unwrap().len(), 120);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_assistant_audio_is_split_and_bracketed_by_marks() {
        let telephony = RecordingTelephony::default();
        let mut config = settings(true);
        config.max_outbound_frame_bytes = 160;
        let mut controller: BridgeController<_, RecordingAi> =
            BridgeController::new("s1", telephony.clone(), config);
        controller.on_telephony_event(start_event());
        controller.on_ai_leg_opened(Ok(RecordingAi::default()));

        // 400 samples of linear16 -> 400 bytes of µ-law -> 160 + 160 + 80
        controller.on_ai_event(AiVoiceEvent::AudioOutput {
            data: BASE64.encode(vec![0u8; 800]),
            index: None,
        });

        let sent = telephony.sent.borrow();
        assert_eq!(sent.len(), 5);
        assert!(matches!(&sent[0], OutboundTelephonyMessage::Mark { mark, .. } if mark.name == "assistant-audio-1-start"));
        assert!(matches!(&sent[4], OutboundTelephonyMessage::Mark { mark, .. } if mark.name == "assistant-audio-1-end"));
        assert_eq!(controller.stats.frames_to_telephony, 3);
        assert_eq!(controller.stats.marks_sent, 2);
    }

    #[test]
    fn test_odd_length_assistant_audio_is_dropped() {
        let (mut controller, telephony, _ai) = active_controller(true);
        controller.on_ai_event(AiVoiceEvent::AudioOutput {
            data: BASE64.encode([0u8; 3]),
            index: None,
        });
        assert!(telephony.sent.borrow().is_empty());
        assert_eq!(controller.stats.dropped_to_telephony, 1);
        assert_eq!(controller.lifecycle, Lifecycle::Active);
    }

    #[test]
    fn test_failed_open_drops_media_until_stop() {
        let mut controller: BridgeController<_, RecordingAi> =
            BridgeController::new("s1", RecordingTelephony::default(), settings(false));
        controller.on_telephony_event(start_event());
        controller.on_ai_leg_opened(Err(BridgeError::ConnectTimeout(10)));
        assert_eq!(controller.lifecycle, Lifecycle::Closing);

        controller.on_telephony_event(media_event(&[0xFF; 160]));
        assert_eq!(controller.stats.dropped_to_ai_voice, 1);
        assert_eq!(controller.on_telephony_event(TelephonyEvent::Stop), Directive::Terminate);
        assert!(controller.snapshot().last_error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_stop_while_connecting_closes_late_leg() {
        let mut controller = BridgeController::new("s1", RecordingTelephony::default(), settings(false));
        controller.on_telephony_event(start_event());
        assert_eq!(controller.on_telephony_event(TelephonyEvent::Stop), Directive::Continue);
        assert_eq!(controller.lifecycle, Lifecycle::Closing);

        let late = RecordingAi::default();
        assert_eq!(controller.on_ai_leg_opened(Ok(late.clone())), Directive::Terminate);
        assert!(*late.closed.borrow());
        assert_eq!(controller.lifecycle, Lifecycle::Closed);
    }

    #[test]
    fn test_bad_media_format_never_opens() {
        let mut controller: BridgeController<_, RecordingAi> =
            BridgeController::new("s1", RecordingTelephony::default(), settings(false));
        let event = TelephonyEvent::Start {
            start: StreamStart {
                call_sid: "CA1".to_string(),
                stream_sid: "ST1".to_string(),
                media_format: MediaFormat {
                    encoding: "audio/x-mulaw".to_string(),
                    sample_rate: 16000,
                    channels: 1,
                },
            },
        };
        assert_eq!(controller.on_telephony_event(event), Directive::Continue);
        assert_eq!(controller.lifecycle, Lifecycle::Closing);
        assert_eq!(controller.on_telephony_closed(), Directive::Terminate);
    }

    #[test]
    fn test_media_before_start_and_duplicate_start() {
        let ai = RecordingAi::default();
        let mut controller = BridgeController::new("s1", RecordingTelephony::default(), settings(false));
        controller.on_telephony_event(media_event(&[0xFF; 10]));
        assert_eq!(controller.stats.dropped_to_ai_voice, 1);

        controller.on_telephony_event(start_event());
        controller.on_ai_leg_opened(Ok(ai.clone()));
        assert_eq!(controller.on_telephony_event(start_event()), Directive::Continue);
        assert_eq!(controller.lifecycle, Lifecycle::Active);
        assert!(ai.frames.borrow().is_empty());
    }

    #[test]
    fn test_ai_leg_closing_unexpectedly() {
        let (mut controller, _telephony, _ai) = active_controller(false);
        let directive = controller.on_ai_leg_closed(BridgeError::ChannelClosed("heartbeat timeout".into()));
        assert_eq!(directive, Directive::Continue);
        assert_eq!(controller.lifecycle, Lifecycle::Closing);

        // Assistant audio is no longer forwarded
        controller.on_ai_event(AiVoiceEvent::AssistantEnd);
        assert_eq!(controller.stats.ai_events, 0);
        assert_eq!(controller.on_telephony_closed(), Directive::Terminate);
    }

    #[test]
    fn test_interruptions_are_counted_in_snapshot() {
        let (mut controller, _telephony, _ai) = active_controller(false);
        let interruption = ai_protocol::decode_event(r#"{"type": "user_interruption", "time": 1200}"#).unwrap();
        controller.on_ai_event(interruption.clone());
        controller.on_ai_event(interruption);

        assert_eq!(controller.snapshot().stats.interruptions, 2);
        assert_eq!(controller.lifecycle, Lifecycle::Active);
    }

    #[test]
    fn test_transcript_collects_final_lines() {
        let (mut controller, _telephony, _ai) = active_controller(false);
        let user = ai_protocol::decode_event(
            r#"{"type": "user_message", "message": {"role": "user", "content": "hello"}, "interim": false}"#,
        )
        .unwrap();
        let interim = ai_protocol::decode_event(
            r#"{"type": "user_message", "message": {"role": "user", "content": "hel"}, "interim": true}"#,
        )
        .unwrap();
        let assistant = ai_protocol::decode_event(
            r#"{"type": "assistant_message", "message": {"role": "assistant", "content": "Hi there"}}"#,
        )
        .unwrap();
        controller.on_ai_event(interim);
        controller.on_ai_event(user);
        controller.on_ai_event(assistant);

        assert_eq!(controller.transcript.len(), 2);
        assert_eq!(controller.transcript.count(Speaker::Caller), 1);
        assert_eq!(controller.snapshot().transcript_entries, 2);
    }
}
