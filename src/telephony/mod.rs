//! # Telephony Leg
//!
//! The inbound side of a bridged call: the platform connects to `/ws/telephony` and
//! streams the caller's audio as JSON `media` events.
//!
//! ## Key Components:
//! - **protocol**: typed inbound events and outbound `media` / `mark` frames
//!
//! The socket itself is owned by the per-call actor in [`crate::websocket`].

pub mod protocol;

pub use protocol::{OutboundTelephonyMessage, TelephonyEvent};
