//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between sections)
//! - Platform variables (HOST, PORT, HUME_API_KEY, HUME_SECRET_KEY, HUME_CONFIG_ID)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (HOST, PORT, HUME_*)
//! 2. Environment variables (APP_SERVER__PORT, APP_HUME__CONFIG_ID, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub hume: HumeConfig,
    pub bridge: BridgeConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Voice-AI (Hume EVI) connection settings.
///
/// ## Fields:
/// - `api_key` / `secret_key`: per-deployment credentials
/// - `config_id`: EVI configuration to use for every call
/// - `endpoint`: WebSocket URL of the chat endpoint
/// - `connect_timeout_secs`: bound on the opening handshake
/// - `heartbeat_interval_secs` / `heartbeat_timeout_secs`: ping cadence and pong deadline
///
/// The three credential fields may be empty at startup. A call that needs them fails fast
/// with `ConfigInvalid` before any network traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumeConfig {
    pub api_key: String,
    pub secret_key: String,
    pub config_id: String,
    pub endpoint: String,
    pub connect_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

/// Audio relay tuning.
///
/// ## Fields:
/// - `max_outbound_frame_bytes`: largest µ-law payload sent to the telephony leg in one
///   `media` frame (0 sends each assistant audio chunk whole)
/// - `send_marks`: bracket each assistant audio chunk with `mark` frames
/// - `ai_send_queue_depth`: outbound frames allowed to wait for the voice-AI socket
/// - `transcript_max_entries`: per-call transcript lines kept in memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub max_outbound_frame_bytes: usize,
    pub send_marks: bool,
    pub ai_send_queue_depth: usize,
    pub transcript_max_entries: usize,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: Maximum number of calls bridged simultaneously
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            hume: HumeConfig::default(),
            bridge: BridgeConfig::default(),
            performance: PerformanceConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
            port: 8080,
        }
    }
}

impl Default for HumeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            config_id: String::new(),
            endpoint: "wss://api.hume.ai/v0/evi/chat".to_string(),
            connect_timeout_secs: 10,
            heartbeat_interval_secs: 20,
            heartbeat_timeout_secs: 20,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_outbound_frame_bytes: 3200,  // 400ms of 8kHz µ-law
            send_marks: true,
            ai_send_queue_depth: 64,
            transcript_max_entries: 200,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
        }
    }
}

impl HumeConfig {
    /// Names of required credential fields that are empty.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.api_key.trim().is_empty() {
            missing.push("api_key");
        }
        if self.secret_key.trim().is_empty() {
            missing.push("secret_key");
        }
        if self.config_id.trim().is_empty() {
            missing.push("config_id");
        }
        missing
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_BRIDGE__SEND_MARKS=false`: Disable mark frames
    /// - `HUME_API_KEY=...`: Credential as provided by the deployment platform
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Variables set by deployment platforms without the APP_ prefix
        let overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("HUME_API_KEY", "hume.api_key"),
            ("HUME_SECRET_KEY", "hume.secret_key"),
            ("HUME_CONFIG_ID", "hume.config_id"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Session limit, queue depth and timeouts are greater than 0
    /// - The voice-AI endpoint is a WebSocket URL
    ///
    /// Missing credentials are not an error here; see [`HumeConfig::missing_credentials`].
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.bridge.ai_send_queue_depth == 0 {
            return Err(anyhow::anyhow!("Voice-AI send queue depth must be greater than 0"));
        }

        if self.hume.connect_timeout_secs == 0
            || self.hume.heartbeat_interval_secs == 0
            || self.hume.heartbeat_timeout_secs == 0
        {
            return Err(anyhow::anyhow!("Voice-AI timeouts must be greater than 0 seconds"));
        }

        if !(self.hume.endpoint.starts_with("ws://") || self.hume.endpoint.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Voice-AI endpoint must be a ws:// or wss:// URL, got '{}'",
                self.hume.endpoint
            ));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only non-credential fields can be changed this way. For example, send
    /// `{"bridge": {"max_outbound_frame_bytes": 1600}}` to change only the frame size.
    /// Calls already in progress keep the configuration they started with.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Port {} is out of range", port))?;
            }
        }

        if let Some(hume) = partial_config.get("hume") {
            if let Some(endpoint) = hume.get("endpoint").and_then(|v| v.as_str()) {
                self.hume.endpoint = endpoint.to_string();
            }
            if let Some(secs) = hume.get("connect_timeout_secs").and_then(|v| v.as_u64()) {
                self.hume.connect_timeout_secs = secs;
            }
            if let Some(secs) = hume.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                self.hume.heartbeat_interval_secs = secs;
            }
            if let Some(secs) = hume.get("heartbeat_timeout_secs").and_then(|v| v.as_u64()) {
                self.hume.heartbeat_timeout_secs = secs;
            }
        }

        if let Some(bridge) = partial_config.get("bridge") {
            if let Some(bytes) = bridge.get("max_outbound_frame_bytes").and_then(|v| v.as_u64()) {
                self.bridge.max_outbound_frame_bytes = bytes as usize;
            }
            if let Some(marks) = bridge.get("send_marks").and_then(|v| v.as_bool()) {
                self.bridge.send_marks = marks;
            }
            if let Some(depth) = bridge.get("ai_send_queue_depth").and_then(|v| v.as_u64()) {
                self.bridge.ai_send_queue_depth = depth as usize;
            }
            if let Some(entries) = bridge.get("transcript_max_entries").and_then(|v| v.as_u64()) {
                self.bridge.transcript_max_entries = entries as usize;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Configuration as JSON with credentials masked, for the config endpoint and logs.
    pub fn redacted_json(&self) -> serde_json::Value {
        serde_json::json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port
            },
            "hume": {
                "api_key": redact(&self.hume.api_key),
                "secret_key": redact(&self.hume.secret_key),
                "config_id": self.hume.config_id,
                "endpoint": self.hume.endpoint,
                "connect_timeout_secs": self.hume.connect_timeout_secs,
                "heartbeat_interval_secs": self.hume.heartbeat_interval_secs,
                "heartbeat_timeout_secs": self.hume.heartbeat_timeout_secs
            },
            "bridge": {
                "max_outbound_frame_bytes": self.bridge.max_outbound_frame_bytes,
                "send_marks": self.bridge.send_marks,
                "ai_send_queue_depth": self.bridge.ai_send_queue_depth,
                "transcript_max_entries": self.bridge.transcript_max_entries
            },
            "performance": {
                "max_concurrent_sessions": self.performance.max_concurrent_sessions
            }
        })
    }
}

fn redact(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        "********".to_string()
    }
}
