//! # Audio Frames
//!
//! An [`AudioFrame`] is one payload crossing the bridge, tagged with its encoding and the
//! ordinal it was given when relayed. Frames are created at relay time and dropped as soon
//! as they have been handed to the outgoing leg.

use serde::Serialize;

/// Encoding of an audio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// G.711 µ-law, one byte per sample (telephony leg)
    Mulaw,
    /// Signed 16-bit little-endian PCM (voice-AI leg)
    Linear16,
}

impl AudioEncoding {
    /// Bytes used by one sample in this encoding.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioEncoding::Mulaw => 1,
            AudioEncoding::Linear16 => 2,
        }
    }
}

/// Relay direction, used to keep separate ordinal counters per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Caller audio going to the voice-AI service
    ToAiVoice,
    /// Assistant audio going back to the caller
    ToTelephony,
}

/// One unit of audio exchanged between legs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub encoding: AudioEncoding,
    pub payload: Vec<u8>,
    /// Ordinal assigned at relay time, starting at 1 per session and direction
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(encoding: AudioEncoding, payload: Vec<u8>, sequence: u64) -> Self {
        Self {
            encoding,
            payload,
            sequence,
        }
    }

    /// Number of samples carried by this frame.
    pub fn sample_count(&self) -> usize {
        self.payload.len() / self.encoding.bytes_per_sample()
    }

    /// Playback duration at the given sample rate, in milliseconds.
    pub fn duration_ms(&self, sample_rate: u32) -> u64 {
        if sample_rate == 0 {
            return 0;
        }
        (self.sample_count() as u64 * 1000) / sample_rate as u64
    }
}

/// Monotonic per-direction frame ordinals for one session.
#[derive(Debug, Default, Clone)]
pub struct FrameSequencer {
    to_ai_voice: u64,
    to_telephony: u64,
}

impl FrameSequencer {
    /// Hand out the next ordinal for a direction.
    pub fn next(&mut self, direction: Direction) -> u64 {
        let counter = match direction {
            Direction::ToAiVoice => &mut self.to_ai_voice,
            Direction::ToTelephony => &mut self.to_telephony,
        };
        *counter += 1;
        *counter
    }

    /// Last ordinal handed out for a direction (0 if none yet).
    pub fn current(&self, direction: Direction) -> u64 {
        match direction {
            Direction::ToAiVoice => self.to_ai_voice,
            Direction::ToTelephony => self.to_telephony,
        }
    }
}

/// Split a payload into consecutive chunks of at most `max_bytes`.
///
/// A `max_bytes` of zero leaves the payload whole. Chunk boundaries always fall on
/// sample boundaries for the given encoding.
pub fn split_payload(payload: &[u8], max_bytes: usize, encoding: AudioEncoding) -> Vec<&[u8]> {
    if payload.is_empty() {
        return Vec::new();
    }
    let sample_bytes = encoding.bytes_per_sample();
    let limit = (max_bytes / sample_bytes) * sample_bytes;
    if max_bytes == 0 || limit == 0 || payload.len() <= limit {
        return vec![payload];
    }
    payload.chunks(limit).collect()
}
