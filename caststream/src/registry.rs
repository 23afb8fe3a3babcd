//! Registry of streaming sessions and the stall-detection monitor.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::{SessionStatus, StreamingSession};

/// Monitor pass interval.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Inactivity threshold before a session counts as stalled. 90 seconds
/// is intentional: many renderers buffer the whole video locally and
/// then issue no HTTP reads for minutes.
const INACTIVITY_THRESHOLD: Duration = Duration::from_secs(90);

/// Sessions older than this get reported to health handlers even when
/// they still show activity.
const MAX_SESSION_AGE: Duration = Duration::from_secs(24 * 3600);

/// Inactive sessions are retained this long before garbage collection.
const INACTIVE_RETENTION: Duration = Duration::from_secs(3600);

/// Callback invoked with a session snapshot when it stalls or ages out.
pub type HealthHandler = Arc<dyn Fn(&StreamingSession) + Send + Sync>;

/// Aggregate streaming statistics.
#[derive(Debug, Clone, Default)]
pub struct StreamingStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub total_bytes_served: u64,
    pub total_connection_errors: u32,
    pub devices_streaming: usize,
    pub sessions_by_status: HashMap<&'static str, usize>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, StreamingSession>,
    /// device name -> session ids
    device_index: HashMap<String, Vec<String>>,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    handlers: Mutex<Vec<HealthHandler>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    stop_flag: AtomicBool,
}

/// Shared, clonable handle to the session table.
///
/// The registry exclusively owns the `session_id -> session` table and
/// the per-device index; every accessor returns copies.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                handlers: Mutex::new(Vec::new()),
                monitor: Mutex::new(None),
                stop_flag: AtomicBool::new(false),
            }),
        }
    }

    /// Create and start tracking a session; returns a snapshot.
    pub fn register_session(
        &self,
        device_name: &str,
        video_path: &Path,
        server_ip: &str,
        server_port: u16,
    ) -> StreamingSession {
        let session = StreamingSession::new(
            Uuid::new_v4().to_string(),
            device_name.to_string(),
            video_path.to_path_buf(),
            server_ip.to_string(),
            server_port,
        );

        {
            let mut state = self.lock_state();
            state
                .device_index
                .entry(device_name.to_string())
                .or_default()
                .push(session.session_id.clone());
            state
                .sessions
                .insert(session.session_id.clone(), session.clone());
        }

        info!(
            "Registered streaming session {} for {} ({} via {}:{})",
            session.session_id,
            device_name,
            video_path.display(),
            server_ip,
            server_port
        );

        self.ensure_monitoring_running();
        session
    }

    pub fn unregister_session(&self, session_id: &str) -> bool {
        let mut state = self.lock_state();
        let Some(session) = state.sessions.remove(session_id) else {
            return false;
        };
        if let Some(ids) = state.device_index.get_mut(&session.device_name) {
            ids.retain(|id| id != session_id);
            if ids.is_empty() {
                state.device_index.remove(&session.device_name);
            }
        }
        info!(
            "Unregistered streaming session {} for {}",
            session_id, session.device_name
        );
        true
    }

    /// Remove every session belonging to a device. Used on disconnect.
    pub fn unregister_device_sessions(&self, device_name: &str) -> usize {
        let ids: Vec<String> = {
            let state = self.lock_state();
            state
                .device_index
                .get(device_name)
                .cloned()
                .unwrap_or_default()
        };
        let count = ids.len();
        for id in ids {
            self.unregister_session(&id);
        }
        count
    }

    pub fn get_session(&self, session_id: &str) -> Option<StreamingSession> {
        self.lock_state().sessions.get(session_id).cloned()
    }

    pub fn sessions_for_device(&self, device_name: &str) -> Vec<StreamingSession> {
        let state = self.lock_state();
        state
            .device_index
            .get(device_name)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn active_sessions(&self) -> Vec<StreamingSession> {
        self.lock_state()
            .sessions
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect()
    }

    /// Record bytes served on a specific session.
    pub fn update_activity(&self, session_id: &str, client_ip: Option<&str>, bytes: u64) -> bool {
        let mut state = self.lock_state();
        match state.sessions.get_mut(session_id) {
            Some(session) => {
                session.update_activity(client_ip, bytes);
                true
            }
            None => false,
        }
    }

    /// Record bytes served, addressed by (port, file) as the HTTP layer
    /// sees them. Updates every active session streaming that file from
    /// that port.
    pub fn record_transfer(&self, server_port: u16, video_path: &Path, client_ip: &str, bytes: u64) {
        let mut state = self.lock_state();
        for session in state.sessions.values_mut() {
            if session.active
                && session.server_port == server_port
                && session.video_path == video_path
            {
                session.update_activity(Some(client_ip), bytes);
            }
        }
    }

    /// Record a connection event addressed by (port, file).
    pub fn record_connection_for(&self, server_port: u16, video_path: &Path, connected: bool) {
        let mut state = self.lock_state();
        for session in state.sessions.values_mut() {
            if session.active
                && session.server_port == server_port
                && session.video_path == video_path
            {
                session.record_connection(connected);
            }
        }
    }

    pub fn record_connection_event(&self, session_id: &str, connected: bool) -> bool {
        let mut state = self.lock_state();
        match state.sessions.get_mut(session_id) {
            Some(session) => {
                session.record_connection(connected);
                true
            }
            None => false,
        }
    }

    pub fn set_error(&self, session_id: &str, message: &str) -> bool {
        let mut state = self.lock_state();
        match state.sessions.get_mut(session_id) {
            Some(session) => {
                session.set_error(message);
                true
            }
            None => false,
        }
    }

    pub fn complete_session(&self, session_id: &str) -> bool {
        let mut state = self.lock_state();
        match state.sessions.get_mut(session_id) {
            Some(session) => {
                session.complete();
                true
            }
            None => false,
        }
    }

    /// Register a callback for stalled or over-age sessions.
    pub fn register_health_check_handler(&self, handler: HealthHandler) {
        self.inner.handlers.lock().expect("handler list poisoned").push(handler);
    }

    pub fn get_streaming_stats(&self) -> StreamingStats {
        let state = self.lock_state();
        let mut stats = StreamingStats {
            total_sessions: state.sessions.len(),
            ..StreamingStats::default()
        };

        let mut devices = std::collections::HashSet::new();
        for session in state.sessions.values() {
            if session.active {
                stats.active_sessions += 1;
                devices.insert(session.device_name.clone());
            }
            stats.total_bytes_served += session.bytes_served;
            stats.total_connection_errors += session.connection_errors;
            *stats.sessions_by_status.entry(session.status.as_str()).or_insert(0) += 1;
        }
        stats.devices_streaming = devices.len();
        stats
    }

    /// Stop the monitor thread and wait for it to exit.
    pub fn stop_monitoring(&self) {
        self.inner.stop_flag.store(true, Ordering::SeqCst);
        let handle = self.inner.monitor.lock().expect("monitor handle poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.inner.state.lock().expect("session table poisoned")
    }

    fn ensure_monitoring_running(&self) {
        let mut guard = self.inner.monitor.lock().expect("monitor handle poisoned");
        if guard.is_some() {
            return;
        }

        self.inner.stop_flag.store(false, Ordering::SeqCst);
        let registry = self.clone();
        let handle = thread::Builder::new()
            .name("stream-monitor".to_string())
            .spawn(move || registry.monitoring_loop())
            .expect("failed to spawn stream monitor thread");
        *guard = Some(handle);
        debug!("Streaming session monitor started");
    }

    fn monitoring_loop(&self) {
        while !self.inner.stop_flag.load(Ordering::SeqCst) {
            self.check_sessions_health();
            self.clean_stale_sessions();

            // Chunked sleep keeps cancellation latency well under the
            // check interval.
            let mut slept = Duration::ZERO;
            while slept < HEALTH_CHECK_INTERVAL {
                if self.inner.stop_flag.load(Ordering::SeqCst) {
                    return;
                }
                let step = Duration::from_millis(500);
                thread::sleep(step);
                slept += step;
            }
        }
    }

    /// One monitor pass: flag stalls, surface unhealthy sessions.
    fn check_sessions_health(&self) {
        let mut flagged: Vec<StreamingSession> = Vec::new();

        {
            let mut state = self.lock_state();
            for session in state.sessions.values_mut() {
                if !session.active {
                    continue;
                }
                if session.is_stalled(INACTIVITY_THRESHOLD) {
                    if session.status != SessionStatus::Stalled {
                        warn!(
                            "Session {} for {} stalled (no activity for {:?})",
                            session.session_id, session.device_name, INACTIVITY_THRESHOLD
                        );
                        session.mark_stalled();
                    }
                    flagged.push(session.clone());
                } else if session.age() >= MAX_SESSION_AGE {
                    warn!(
                        "Session {} for {} has run for over 24h",
                        session.session_id, session.device_name
                    );
                    flagged.push(session.clone());
                }
            }
        }

        if flagged.is_empty() {
            return;
        }

        // Handlers run outside the table lock: they may call back into
        // the registry or the device manager.
        let handlers: Vec<HealthHandler> = self
            .inner
            .handlers
            .lock()
            .expect("handler list poisoned")
            .clone();
        for session in &flagged {
            for handler in &handlers {
                handler(session);
            }
        }
    }

    /// Drop sessions that have been inactive beyond the retention window.
    fn clean_stale_sessions(&self) {
        let stale: Vec<String> = {
            let state = self.lock_state();
            state
                .sessions
                .values()
                .filter(|s| {
                    !s.active && s.inactive_for().is_some_and(|d| d >= INACTIVE_RETENTION)
                })
                .map(|s| s.session_id.clone())
                .collect()
        };

        for id in stale {
            debug!("Garbage-collecting inactive session {}", id);
            self.unregister_session(&id);
        }
    }

    #[cfg(test)]
    pub(crate) fn with_session_mut(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut StreamingSession),
    ) {
        let mut state = self.lock_state();
        if let Some(session) = state.sessions.get_mut(session_id) {
            f(session);
        }
    }

    #[cfg(test)]
    pub(crate) fn run_monitor_pass(&self) {
        self.check_sessions_health();
        self.clean_stale_sessions();
    }
}
