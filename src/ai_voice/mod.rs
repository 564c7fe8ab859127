//! # Voice-AI Leg
//!
//! The outbound side of a bridged call: a WebSocket client connection to the
//! empathic voice interface.
//!
//! ## Key Components:
//! - **protocol**: session handshake, `audio_input` frames and typed inbound events
//! - **client**: connection setup, the socket driver task and the channel handle

pub mod client;
pub mod protocol;

pub use client::{AiVoiceChannel, AiVoiceConnector};
pub use protocol::AiVoiceEvent;
