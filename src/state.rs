//! # Application State Management
//!
//! Shared state accessed by HTTP handlers and by every bridged call simultaneously.
//!
//! ## What lives here:
//! - **Configuration**: read at the start of each call, updatable at runtime
//! - **Metrics**: request counters and cumulative relay counters
//! - **Session registry**: a diagnostic snapshot per active call
//!
//! The registry is only ever written by the call that owns an entry and read by the
//! diagnostics endpoints. No relay decision depends on it.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers and session actors hold a reference to the same data
//! - **RwLock**: multiple readers OR one writer at a time
//!
//! ### Lock poisoning
//! A panic while holding a lock "poisons" it. The data guarded here are counters and
//! snapshots that stay valid after a panic, so we recover the guard with
//! `PoisonError::into_inner` instead of propagating the panic.

use crate::bridge::SessionSnapshot;
use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state shared across all request handlers and session actors.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and relay metrics
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Snapshots of active calls, keyed by session id
    pub sessions: Arc<RwLock<HashMap<String, SessionSnapshot>>>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests and bridged calls.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: overall load and reliability
/// - **sessions_started / sessions_rejected**: call volume and capacity pressure
/// - **frames_* / dropped_***: relay health summed over finished calls
/// - **endpoint_metrics**: per-endpoint latency
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Calls accepted since server start
    pub sessions_started: u64,

    /// Calls refused because the session limit was reached
    pub sessions_rejected: u64,

    /// Frames relayed by finished calls, per direction
    pub frames_to_ai_voice: u64,
    pub frames_to_telephony: u64,

    /// Frames dropped by finished calls, both directions
    pub frames_dropped: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// The first time we see an endpoint, `.entry().or_default()` creates its metric.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a slot for a new call.
    ///
    /// Capacity check and insert happen under one write lock, so two connections racing
    /// for the last slot cannot both get it. Returns `false` when the limit is reached.
    pub fn try_register_session(&self, snapshot: SessionSnapshot, max_sessions: usize) -> bool {
        let admitted = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            if sessions.len() >= max_sessions {
                false
            } else {
                sessions.insert(snapshot.session_id.clone(), snapshot);
                true
            }
        };

        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        if admitted {
            metrics.sessions_started += 1;
        } else {
            metrics.sessions_rejected += 1;
        }
        admitted
    }

    /// Publish a fresher snapshot for a registered call.
    pub fn update_session(&self, snapshot: SessionSnapshot) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = sessions.get_mut(&snapshot.session_id) {
            *entry = snapshot;
        }
    }

    /// Remove a finished call and fold its counters into the totals.
    pub fn finish_session(&self, snapshot: &SessionSnapshot) {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&snapshot.session_id)
            .is_some();
        if !removed {
            return;
        }

        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.frames_to_ai_voice += snapshot.stats.frames_to_ai_voice;
        metrics.frames_to_telephony += snapshot.stats.frames_to_telephony;
        metrics.frames_dropped += snapshot.stats.dropped_to_ai_voice + snapshot.stats.dropped_to_telephony;
    }

    /// Number of calls currently registered.
    pub fn active_sessions(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Snapshots of all active calls, oldest first.
    pub fn session_snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.started_at);
        snapshots
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Cloning avoids holding the lock while the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
