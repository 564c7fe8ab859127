//! # Telephony Media-Stream Protocol
//!
//! JSON text frames exchanged with the telephony platform's media stream.
//!
//! ## Inbound (platform → bridge):
//! - `connected`: informational
//! - `start`: call id, stream id and media format
//! - `media`: one base64 µ-law payload
//! - `mark`: playback reached a mark we sent earlier
//! - `dtmf`: a keypad digit pressed by the caller
//! - `stop`: the stream has ended
//!
//! ## Outbound (bridge → platform):
//! - `media`: base64 µ-law payload for the stream
//! - `mark`: named marker placed after queued audio

use crate::audio::{BRIDGE_CHANNELS, BRIDGE_SAMPLE_RATE};
use crate::error::BridgeError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Inbound telephony events, decoded by their `event` tag.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },

    Start {
        start: StreamStart,
    },

    Media {
        media: MediaPayload,
    },

    Mark {
        mark: MarkPayload,
    },

    Dtmf {
        dtmf: DtmfPayload,
    },

    Stop,

    /// Any event type this bridge does not know about
    #[serde(other)]
    Unknown,
}

/// Body of the `start` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub call_sid: String,
    pub stream_sid: String,
    pub media_format: MediaFormat,
}

/// Audio format declared by the platform at stream start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u8,
}

impl MediaFormat {
    /// Check the format is 8kHz mono µ-law, the only one the bridge relays.
    pub fn validate(&self) -> Result<(), String> {
        let encoding = self.encoding.to_ascii_lowercase();
        if encoding != "audio/x-mulaw" && encoding != "mulaw" {
            return Err(format!("unsupported encoding '{}'", self.encoding));
        }
        if self.sample_rate != BRIDGE_SAMPLE_RATE {
            return Err(format!(
                "unsupported sample rate {} (expected {})",
                self.sample_rate, BRIDGE_SAMPLE_RATE
            ));
        }
        if self.channels != BRIDGE_CHANNELS {
            return Err(format!(
                "unsupported channel count {} (expected {})",
                self.channels, BRIDGE_CHANNELS
            ));
        }
        Ok(())
    }
}

/// Body of the `media` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded µ-law audio
    pub payload: String,
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl MediaPayload {
    /// Decode the base64 payload into raw µ-law bytes.
    pub fn decode(&self) -> Result<Vec<u8>, BridgeError> {
        BASE64
            .decode(self.payload.as_bytes())
            .map_err(|e| BridgeError::Protocol(format!("invalid base64 media payload: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DtmfPayload {
    pub digit: String,
}

/// Outbound frames sent to the telephony platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundTelephonyMessage {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },

    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMedia {
    /// Base64-encoded µ-law audio
    pub payload: String,
}

impl OutboundTelephonyMessage {
    /// Build a `media` frame from raw µ-law bytes.
    pub fn media(stream_sid: &str, mulaw: &[u8]) -> Self {
        OutboundTelephonyMessage::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia {
                payload: BASE64.encode(mulaw),
            },
        }
    }

    /// Build a `mark` frame.
    pub fn mark(stream_sid: &str, name: impl Into<String>) -> Self {
        OutboundTelephonyMessage::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkPayload { name: name.into() },
        }
    }

    /// Serialize to the JSON text sent on the socket.
    pub fn to_json(&self) -> Result<String, BridgeError> {
        serde_json::to_string(self).map_err(|e| BridgeError::Protocol(e.to_string()))
    }
}

/// Parse one inbound text frame.
///
/// Invalid JSON or a known event missing a required field is a `Protocol` error;
/// the caller logs it and drops the message.
pub fn parse_inbound(text: &str) -> Result<TelephonyEvent, BridgeError> {
    serde_json::from_str(text).map_err(|e| BridgeError::Protocol(format!("invalid telephony message: {}", e)))
}

/// Best-effort extraction of the `event` tag, for logging unknown events.
pub fn event_name(text: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Tag {
        event: String,
    }
    serde_json::from_str::<Tag>(text).ok().map(|tag| tag.event)
}
