//! # Voice-AI (Hume EVI) Message Protocol
//!
//! JSON text frames exchanged with the empathic voice interface.
//!
//! ## Outbound (bridge → service):
//! - `session_settings`: sent once, right after the socket opens
//! - `audio_input`: one base64 linear16 frame of caller audio
//!
//! ## Inbound (service → bridge):
//! Decoded into [`AiVoiceEvent`] by the `type` tag. Only `audio_output` carries audio;
//! everything else is informational and is logged by the session controller.

use crate::audio::{BRIDGE_CHANNELS, BRIDGE_SAMPLE_RATE};
use crate::error::BridgeError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Typed event received from the voice-AI leg.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AiVoiceEvent {
    /// Assistant speech, base64 linear16
    AudioOutput {
        data: String,
        #[serde(default)]
        index: Option<u64>,
    },

    /// Transcription of what the caller said
    #[serde(rename = "user_message")]
    UserTranscript {
        message: ChatMessage,
        #[serde(default)]
        models: Option<InferenceModels>,
        #[serde(default)]
        interim: bool,
    },

    /// Text of what the assistant is saying
    #[serde(rename = "assistant_message")]
    AssistantTranscript {
        message: ChatMessage,
        #[serde(default)]
        models: Option<InferenceModels>,
    },

    /// Prosody scores for the assistant's speech
    #[serde(rename = "assistant_prosody")]
    ProsodyInfo {
        #[serde(default)]
        models: Option<InferenceModels>,
    },

    /// The assistant finished its turn
    AssistantEnd,

    /// The caller started talking over the assistant
    UserInterruption,

    /// Standalone emotion scores
    EmotionScores {
        #[serde(default)]
        emotions: BTreeMap<String, f64>,
    },

    /// Error reported by the service
    #[serde(rename = "error")]
    ErrorEvent {
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        slug: Option<String>,
    },

    /// First message of a chat, carrying the service-side identifiers
    ChatMetadata {
        chat_id: String,
        #[serde(default)]
        chat_group_id: Option<String>,
    },

    /// Any type this bridge does not know about
    #[serde(other)]
    Unknown,
}

impl AiVoiceEvent {
    /// Wire name of the event, for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            AiVoiceEvent::AudioOutput { .. } => "audio_output",
            AiVoiceEvent::UserTranscript { .. } => "user_message",
            AiVoiceEvent::AssistantTranscript { .. } => "assistant_message",
            AiVoiceEvent::ProsodyInfo { .. } => "assistant_prosody",
            AiVoiceEvent::AssistantEnd => "assistant_end",
            AiVoiceEvent::UserInterruption => "user_interruption",
            AiVoiceEvent::EmotionScores { .. } => "emotion_scores",
            AiVoiceEvent::ErrorEvent { .. } => "error",
            AiVoiceEvent::ChatMetadata { .. } => "chat_metadata",
            AiVoiceEvent::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: String,
}

/// Expression-measurement results attached to transcript and prosody events.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct InferenceModels {
    #[serde(default)]
    pub prosody: Option<ProsodyScores>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ProsodyScores {
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
}

impl InferenceModels {
    /// The `n` highest-scoring prosody dimensions.
    pub fn top_emotions(&self, n: usize) -> Vec<(String, f64)> {
        self.prosody
            .as_ref()
            .map(|p| top_scores(&p.scores, n))
            .unwrap_or_default()
    }
}

/// The `n` highest entries of a score map, highest first.
pub fn top_scores(scores: &BTreeMap<String, f64>, n: usize) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = scores.iter().map(|(k, v)| (k.clone(), *v)).collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(n);
    ranked
}

/// Decode the base64 body of an `audio_output` event.
pub fn decode_audio(data: &str) -> Result<Vec<u8>, BridgeError> {
    BASE64
        .decode(data.as_bytes())
        .map_err(|e| BridgeError::Protocol(format!("invalid base64 audio_output data: {}", e)))
}

/// Parse one inbound text frame.
pub fn decode_event(text: &str) -> Result<AiVoiceEvent, BridgeError> {
    serde_json::from_str(text).map_err(|e| BridgeError::Protocol(format!("invalid voice-AI message: {}", e)))
}

/// Best-effort extraction of the `type` tag, for logging unknown events.
pub fn event_type(text: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Tag {
        #[serde(rename = "type")]
        kind: String,
    }
    serde_json::from_str::<Tag>(text).ok().map(|tag| tag.kind)
}

/// Messages sent to the voice-AI service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundAiMessage {
    SessionSettings {
        config_id: String,
        audio: AudioSettings,
    },

    AudioInput {
        /// Base64 linear16 audio
        data: String,
    },
}

/// Audio format declared for the whole session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioSettings {
    pub encoding: String,
    pub channels: u8,
    pub sample_rate: u32,
}

impl OutboundAiMessage {
    /// The handshake: linear16, 8kHz, mono, matching the telephony leg's rate.
    pub fn session_settings(config_id: &str) -> Self {
        OutboundAiMessage::SessionSettings {
            config_id: config_id.to_string(),
            audio: AudioSettings {
                encoding: "linear16".to_string(),
                channels: BRIDGE_CHANNELS,
                sample_rate: BRIDGE_SAMPLE_RATE,
            },
        }
    }

    /// Wrap raw linear16 bytes into an `audio_input` message.
    pub fn audio_input(pcm: &[u8]) -> Self {
        OutboundAiMessage::AudioInput {
            data: BASE64.encode(pcm),
        }
    }

    pub fn to_json(&self) -> Result<String, BridgeError> {
        serde_json::to_string(self).map_err(|e| BridgeError::Protocol(e.to_string()))
    }
}
