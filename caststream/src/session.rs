//! One live HTTP serving relationship between a server and a renderer.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Rolling bandwidth window size.
const MAX_BANDWIDTH_SAMPLES: usize = 10;
/// Connection history window size.
const MAX_CONNECTION_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Initializing,
    Active,
    Stalled,
    Error,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Active => "active",
            SessionStatus::Stalled => "stalled",
            SessionStatus::Error => "error",
            SessionStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct BandwidthSample {
    bytes: u64,
    duration: Duration,
}

/// Tracking state for one streaming session.
///
/// The registry owns the canonical copy; everything handed out to other
/// components is a clone.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    pub session_id: String,
    pub device_name: String,
    pub video_path: PathBuf,
    pub server_ip: String,
    pub server_port: u16,
    pub start_time: DateTime<Utc>,
    pub bytes_served: u64,
    pub client_ip: Option<String>,
    pub client_connections: u32,
    pub connection_errors: u32,
    pub status: SessionStatus,
    pub error_message: Option<String>,
    pub active: bool,

    started: Instant,
    last_activity: Instant,
    /// Set when `active` flips to false, drives garbage collection.
    inactive_since: Option<Instant>,
    bandwidth_samples: VecDeque<BandwidthSample>,
    connection_history: VecDeque<(DateTime<Utc>, bool)>,
}

impl StreamingSession {
    pub fn new(
        session_id: String,
        device_name: String,
        video_path: PathBuf,
        server_ip: String,
        server_port: u16,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            device_name,
            video_path,
            server_ip,
            server_port,
            start_time: Utc::now(),
            bytes_served: 0,
            client_ip: None,
            client_connections: 0,
            connection_errors: 0,
            status: SessionStatus::Initializing,
            error_message: None,
            active: true,
            started: now,
            last_activity: now,
            inactive_since: None,
            bandwidth_samples: VecDeque::with_capacity(MAX_BANDWIDTH_SAMPLES),
            connection_history: VecDeque::with_capacity(MAX_CONNECTION_HISTORY),
        }
    }

    /// Record bytes flowing to the renderer.
    pub fn update_activity(&mut self, client_ip: Option<&str>, bytes: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_activity);
        self.last_activity = now;

        if let Some(ip) = client_ip {
            self.client_ip = Some(ip.to_string());
        }

        if bytes > 0 {
            self.bytes_served += bytes;
            if self.bandwidth_samples.len() == MAX_BANDWIDTH_SAMPLES {
                self.bandwidth_samples.pop_front();
            }
            self.bandwidth_samples.push_back(BandwidthSample {
                bytes,
                duration: elapsed.max(Duration::from_millis(1)),
            });
        }

        // A stalled session that starts moving again is healthy.
        if self.status == SessionStatus::Stalled {
            self.status = SessionStatus::Active;
        }
    }

    /// Record a client connection opening (`true`) or failing (`false`).
    pub fn record_connection(&mut self, connected: bool) {
        if self.connection_history.len() == MAX_CONNECTION_HISTORY {
            self.connection_history.pop_front();
        }
        self.connection_history.push_back((Utc::now(), connected));

        if connected {
            self.client_connections += 1;
            self.last_activity = Instant::now();
            if self.status == SessionStatus::Initializing {
                self.status = SessionStatus::Active;
            }
        } else {
            self.connection_errors += 1;
            if self.status == SessionStatus::Active {
                self.status = SessionStatus::Stalled;
            }
        }
    }

    pub fn set_error(&mut self, message: &str) {
        self.status = SessionStatus::Error;
        self.error_message = Some(message.to_string());
        self.deactivate();
    }

    pub fn complete(&mut self) {
        self.status = SessionStatus::Completed;
        self.deactivate();
    }

    /// Mark stalled (done by the registry monitor, not by clients).
    pub(crate) fn mark_stalled(&mut self) {
        self.status = SessionStatus::Stalled;
    }

    fn deactivate(&mut self) {
        if self.active {
            self.active = false;
            self.inactive_since = Some(Instant::now());
        }
    }

    /// Mean transfer rate over the retained samples, bytes per second.
    pub fn bandwidth(&self) -> f64 {
        if self.bandwidth_samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .bandwidth_samples
            .iter()
            .map(|s| s.bytes as f64 / s.duration.as_secs_f64())
            .sum();
        sum / self.bandwidth_samples.len() as f64
    }

    /// True once `threshold` has elapsed since the last activity.
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        self.last_activity.elapsed() >= threshold
    }

    /// Total session age.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time spent inactive, if the session is no longer active.
    pub fn inactive_for(&self) -> Option<Duration> {
        self.inactive_since.map(|at| at.elapsed())
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&mut self, by: Duration) {
        self.last_activity = Instant::now() - by;
    }

    #[cfg(test)]
    pub(crate) fn backdate_inactive(&mut self, by: Duration) {
        self.inactive_since = Some(Instant::now() - by);
    }
}
