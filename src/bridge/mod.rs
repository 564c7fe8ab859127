//! # Bridge Module
//!
//! Per-call coordination between the telephony leg and the voice-AI leg.
//!
//! ## Key Components:
//! - **controller**: the session state machine and the leg traits it drives
//! - **transcript**: what was said on the call, kept for the session's lifetime

pub mod controller;
pub mod transcript;

pub use controller::{BridgeController, Directive, SessionSnapshot, TelephonyLeg};
