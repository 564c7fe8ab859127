//! # Audio Module
//!
//! Sample-level conversion between the two legs of a bridged call.
//!
//! ## Key Components:
//! - **Codec**: G.711 µ-law ⇄ linear PCM16 transcoder (pure, stateless)
//! - **Frame**: audio frame type, per-direction sequencing, payload chunking
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 8kHz on both legs (no resampling)
//! - **Channels**: Mono (1 channel)
//! - **Telephony leg**: 8-bit µ-law
//! - **Voice-AI leg**: 16-bit little-endian signed PCM

pub mod codec;   // µ-law <-> PCM16 conversion
pub mod frame;   // Audio frames and sequencing

/// Sample rate shared by both legs.
pub const BRIDGE_SAMPLE_RATE: u32 = 8000;

/// Channel count shared by both legs.
pub const BRIDGE_CHANNELS: u8 = 1;
