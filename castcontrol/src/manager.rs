//! Device manager: registry, discovery, assignment, health.
//!
//! Owns the `name -> Device` table and the assignment bookkeeping, runs
//! the discovery loop and reconciles the observed fleet against the
//! desired state in `castconfig`, delegating playback to per-device
//! [`RendererDriver`]s and stream serving to `caststream`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use tracing::{debug, error, info, warn};

use castconfig::ConfigService;
use caststream::{SessionRegistry, SessionStatus, StreamingServerPool, StreamingSession};
use caststream::server::VIDEO_FILE_KEY;

use crate::description::{
    AVTRANSPORT_SERVICE_TYPE, DeviceDescription, fetch_device_description,
};
use crate::device::{Device, DeviceInfo, DeviceKind, DeviceStatus};
use crate::overlay;
use crate::renderer::{MediaItem, RendererBackend, RendererDriver};
use crate::ssdp;

/// One discovery cycle every 10 seconds.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);
/// SSDP response collection window.
const SSDP_WINDOW: Duration = Duration::from_secs(2);
/// Description fetch timeout.
const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(5);
/// Parallel description fetches per cycle.
const FETCH_WORKERS: usize = 3;

/// Non-observation budget before a device is marked disconnected.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period during which a missed cycle changes nothing.
const GRACE_PERIOD: Duration = Duration::from_secs(10);
/// Playing devices get a longer grace period.
const GRACE_PERIOD_PLAYING: Duration = Duration::from_secs(20);

/// Assignment retry budget and backoff base.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

/// Per-device playback health check interval.
const PLAYBACK_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Consecutive not-playing observations before recovery.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Settle delay between stopping one video and starting another.
const STOP_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Priority given to matured scheduled assignments.
const SCHEDULED_PRIORITY: u8 = 100;

/// Who is steering a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    /// The manager converges the device toward its configured video.
    #[default]
    Auto,
    /// A user took over; auto-assignment and recovery stand down.
    Manual,
}

/// Database collaborator for playback progress. Persistence itself is
/// outside the control plane; the manager only writes through.
pub trait ProgressStore: Send + Sync {
    fn save_progress(&self, device_name: &str, position: &str, duration: &str, progress: u8);
}

#[derive(Debug, Clone)]
struct Assignment {
    video_path: PathBuf,
    priority: u8,
}

/// A not-yet-live assignment waiting for its wall-clock start.
#[derive(Debug, Clone)]
pub struct ScheduledAssignment {
    pub video_path: PathBuf,
    pub priority: u8,
    pub scheduled_time: DateTime<Utc>,
}

/// Per-device playback attempt statistics.
#[derive(Debug, Clone, Default)]
pub struct PlaybackStats {
    pub attempts: u32,
    pub successes: u32,
    /// video path -> (attempts, successes)
    pub per_video: HashMap<String, (u32, u32)>,
}

impl PlaybackStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    fn record(&mut self, video: &Path, success: bool) {
        self.attempts += 1;
        let entry = self
            .per_video
            .entry(video.to_string_lossy().to_string())
            .or_insert((0, 0));
        entry.0 += 1;
        if success {
            self.successes += 1;
            entry.1 += 1;
        }
    }
}

/// Snapshot of the discovery loop state.
#[derive(Debug, Clone)]
pub struct DiscoveryStatus {
    pub running: bool,
    pub paused: bool,
    pub last_cycle: Option<DateTime<Utc>>,
    pub device_count: usize,
}

struct HealthMonitor {
    stop: Arc<AtomicBool>,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    devices: HashMap<String, Device>,
    drivers: HashMap<String, Arc<RendererDriver>>,
    assignments: HashMap<String, Assignment>,
    retries: HashMap<String, u32>,
    control_modes: HashMap<String, ControlMode>,
    stats: HashMap<String, PlaybackStats>,
}

struct ManagerInner {
    config: Arc<ConfigService>,
    registry: SessionRegistry,
    pool: Arc<StreamingServerPool>,
    state: Mutex<ManagerState>,
    scheduled: Mutex<HashMap<String, ScheduledAssignment>>,
    health_monitors: Mutex<HashMap<String, HealthMonitor>>,
    progress_store: Mutex<Option<Arc<dyn ProgressStore>>>,
    discovery_stop: AtomicBool,
    discovery_paused: AtomicBool,
    discovery_handle: Mutex<Option<JoinHandle<()>>>,
    last_cycle: Mutex<Option<DateTime<Utc>>>,
}

/// What the disconnection policy decides for an unobserved device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectAction {
    Keep,
    Disconnect,
    Purge,
}

/// Staging of the disconnection policy, by elapsed non-observation.
fn disconnect_action(elapsed: Duration, is_playing: bool) -> DisconnectAction {
    let grace = if is_playing {
        GRACE_PERIOD_PLAYING
    } else {
        GRACE_PERIOD
    };
    if elapsed <= grace {
        return DisconnectAction::Keep;
    }
    if elapsed >= CONNECTIVITY_TIMEOUT * 2 {
        return DisconnectAction::Purge;
    }
    if elapsed >= CONNECTIVITY_TIMEOUT {
        return DisconnectAction::Disconnect;
    }
    DisconnectAction::Keep
}

/// The control-plane service owning devices and assignments.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

impl DeviceManager {
    pub fn new(
        config: Arc<ConfigService>,
        registry: SessionRegistry,
        pool: Arc<StreamingServerPool>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry,
                pool,
                state: Mutex::new(ManagerState::default()),
                scheduled: Mutex::new(HashMap::new()),
                health_monitors: Mutex::new(HashMap::new()),
                progress_store: Mutex::new(None),
                discovery_stop: AtomicBool::new(false),
                discovery_paused: AtomicBool::new(false),
                discovery_handle: Mutex::new(None),
                last_cycle: Mutex::new(None),
            }),
        }
    }

    fn from_weak(weak: &Weak<ManagerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn set_progress_store(&self, store: Arc<dyn ProgressStore>) {
        *self
            .inner
            .progress_store
            .lock()
            .expect("progress store poisoned") = Some(store);
    }

    /// Hook this manager into the registry's stall callbacks.
    pub fn install_health_handler(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .registry
            .register_health_check_handler(Arc::new(move |session: &StreamingSession| {
                if let Some(manager) = DeviceManager::from_weak(&weak) {
                    manager.handle_streaming_issue(session);
                }
            }));
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.inner.state.lock().expect("manager state poisoned")
    }

    // =====================================================================
    // Registry operations
    // =====================================================================

    /// Idempotent registration.
    ///
    /// A matching (name, hostname, location) registration only refreshes
    /// `last_seen`; changed parameters are applied in place so streaming
    /// state and the playing flag survive a renderer re-announcing
    /// itself. Update-in-place, never unregister-then-register: a
    /// concurrent health monitor must not observe the device missing.
    pub fn register(&self, info: DeviceInfo) -> Option<Device> {
        if info.name.is_empty() {
            warn!("Refusing to register a device without a name");
            return None;
        }

        let mut guard = self.lock_state();
        let state = &mut *guard;

        if let Some(existing) = state.devices.get_mut(&info.name) {
            if !existing.matches_info(&info) {
                info!(
                    "Updating device {} ({} -> {})",
                    info.name, existing.location, info.location
                );
                existing.apply_info(&info);
                // The driver points at the old endpoint.
                state.drivers.remove(&info.name);
            }
        } else {
            info!("Registered new device {} at {}", info.name, info.hostname);
            state.devices.insert(
                info.name.clone(),
                Device::from_info(info.clone(), DeviceStatus::Connected),
            );
        }

        let device = state.devices.get_mut(&info.name).expect("just inserted");
        device.last_seen = SystemTime::now();
        if device.status == DeviceStatus::Disconnected {
            info!("Device {} is back online", device.name);
            device.status = DeviceStatus::Connected;
            device.connected_since = Some(Utc::now());
        }

        Some(device.clone())
    }

    /// Remove a device and all state derived from it.
    pub fn unregister(&self, name: &str) -> bool {
        let (device, driver) = {
            let mut state = self.lock_state();
            let device = state.devices.remove(name);
            let driver = state.drivers.remove(name);
            state.assignments.remove(name);
            state.retries.remove(name);
            state.control_modes.remove(name);
            state.stats.remove(name);
            (device, driver)
        };

        if device.is_none() {
            return false;
        }

        // Monitors are signalled, not joined: unregister must not block.
        if let Some(driver) = driver {
            driver.disable_loop();
        }
        self.signal_health_monitor(name);
        self.inner.scheduled.lock().expect("scheduled poisoned").remove(name);
        self.inner.registry.unregister_device_sessions(name);

        info!("Unregistered device {}", name);
        true
    }

    pub fn list(&self) -> Vec<Device> {
        self.lock_state().devices.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Device> {
        self.lock_state().devices.get(name).cloned()
    }

    /// Partial status update; unspecified fields keep their values.
    pub fn update_status(
        &self,
        name: &str,
        status: DeviceStatus,
        is_playing: Option<bool>,
        current_video: Option<PathBuf>,
        error: Option<String>,
    ) -> bool {
        let mut state = self.lock_state();
        let Some(device) = state.devices.get_mut(name) else {
            return false;
        };

        device.status = status;
        if let Some(playing) = is_playing {
            device.is_playing = playing;
        }
        if let Some(video) = current_video {
            device.current_video = Some(video);
        }
        if let Some(message) = error {
            device.last_error = Some(message);
            device.last_error_time = Some(Utc::now());
        }
        true
    }

    /// Record playback progress and write it through to the store.
    pub fn update_playback_progress(
        &self,
        name: &str,
        position: &str,
        duration: &str,
        progress: u8,
    ) -> bool {
        let updated = {
            let mut state = self.lock_state();
            match state.devices.get_mut(name) {
                Some(device) => {
                    device.playback_position = Some(position.to_string());
                    device.playback_duration = Some(duration.to_string());
                    device.playback_progress = Some(progress);
                    true
                }
                None => false,
            }
        };

        if updated {
            let store = self
                .inner
                .progress_store
                .lock()
                .expect("progress store poisoned")
                .clone();
            if let Some(store) = store {
                store.save_progress(name, position, duration, progress);
            }
        }
        updated
    }

    // =====================================================================
    // Assignment protocol
    // =====================================================================

    /// Assign a video to a device.
    ///
    /// Scheduled assignments are stored and promoted by the discovery
    /// sweep; live assignments follow the priority rule (`new >=
    /// current`), stop any other playing video, then delegate to the
    /// driver with bounded-backoff retries on failure.
    pub fn assign(
        &self,
        name: &str,
        video_path: &Path,
        priority: u8,
        schedule: Option<DateTime<Utc>>,
    ) -> bool {
        // User-initiated manual state wins over automation.
        if self.control_mode(name) != ControlMode::Auto {
            info!(
                "Skipping assignment for {}: device is under user control",
                name
            );
            return false;
        }

        if !video_path.exists() {
            error!(
                "Cannot assign {} to {}: file does not exist",
                video_path.display(),
                name
            );
            return false;
        }

        let current_priority = {
            let state = self.lock_state();
            state.assignments.get(name).map(|a| a.priority).unwrap_or(0)
        };
        if priority < current_priority {
            info!(
                "Not overriding current assignment for {}: priority {} < {}",
                name, priority, current_priority
            );
            return false;
        }

        if let Some(at) = schedule {
            if at > Utc::now() {
                info!(
                    "Scheduled {} for {} at {}",
                    video_path.display(),
                    name,
                    at
                );
                self.inner.scheduled.lock().expect("scheduled poisoned").insert(
                    name.to_string(),
                    ScheduledAssignment {
                        video_path: video_path.to_path_buf(),
                        priority,
                        scheduled_time: at,
                    },
                );
                return true;
            }
        }

        // Stop a different video before switching.
        let (playing_other, driver) = {
            let state = self.lock_state();
            let playing_other = state
                .devices
                .get(name)
                .map(|d| {
                    d.is_playing && d.current_video.as_deref() != Some(video_path)
                })
                .unwrap_or(false);
            (playing_other, state.drivers.get(name).cloned())
        };
        if playing_other {
            if let Some(driver) = driver {
                info!("Stopping current video on {} before reassignment", name);
                if let Err(e) = driver.stop() {
                    warn!("Stop before reassignment failed on {}: {}", name, e);
                }
                thread::sleep(STOP_SETTLE_DELAY);
            }
        }

        {
            let mut state = self.lock_state();
            state.assignments.insert(
                name.to_string(),
                Assignment {
                    video_path: video_path.to_path_buf(),
                    priority,
                },
            );
            state.retries.insert(name.to_string(), 0);
        }

        let ok = self.auto_play(name, video_path);
        if !ok {
            self.schedule_retry(name, video_path, priority);
        }
        ok
    }

    fn control_mode(&self, name: &str) -> ControlMode {
        self.lock_state()
            .control_modes
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Return a device to automatic convergence.
    pub fn resume_auto_mode(&self, name: &str) {
        self.lock_state()
            .control_modes
            .insert(name.to_string(), ControlMode::Auto);
    }

    fn set_control_mode(&self, name: &str, mode: ControlMode) {
        self.lock_state()
            .control_modes
            .insert(name.to_string(), mode);
    }

    /// Start streaming + playback for an assigned video.
    fn auto_play(&self, name: &str, video_path: &Path) -> bool {
        let Some(device) = self.get(name) else {
            warn!("Cannot play on unknown device {}", name);
            return false;
        };

        let config = self.inner.config.get(name);
        let loop_playback = config.as_ref().map(|c| c.loop_playback).unwrap_or(true);

        let serve_ip = castutils::serve_ip();
        let files = vec![(VIDEO_FILE_KEY.to_string(), video_path.to_path_buf())];
        let started = match self.inner.pool.start_server(&files, &serve_ip) {
            Ok(started) => started,
            Err(e) => {
                error!("Cannot start streaming server for {}: {}", name, e);
                self.record_attempt(name, video_path, false);
                self.mark_error(name, &format!("streaming server failed: {e}"));
                return false;
            }
        };

        let Some(url) = started.urls.get(VIDEO_FILE_KEY).cloned() else {
            error!("Streaming server returned no URL for {}", name);
            return false;
        };

        let session =
            self.inner
                .registry
                .register_session(name, video_path, &started.serve_ip, started.port);

        let driver = self.driver_for(&device);
        let media = MediaItem {
            url: url.clone(),
            file_path: video_path.to_path_buf(),
            title: video_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "video".to_string()),
            duration_hint: None,
        };

        match driver.play(media, loop_playback) {
            Ok(()) => {
                {
                    let mut state = self.lock_state();
                    if let Some(device) = state.devices.get_mut(name) {
                        device.status = DeviceStatus::Playing;
                        device.is_playing = true;
                        device.current_video = Some(video_path.to_path_buf());
                        device.streaming_url = Some(url);
                        device.streaming_port = Some(started.port);
                        device.last_error = None;
                    }
                }
                self.record_attempt(name, video_path, true);
                self.start_health_monitor(name);

                if let Some(config) = config.filter(|c| c.enable_overlay_sync) {
                    let video_name = config
                        .sync_video_name
                        .clone()
                        .unwrap_or_else(|| media_name_of(video_path));
                    overlay::notify_overlay_sync(&video_name);
                }

                info!("Device {} now playing {}", name, video_path.display());
                true
            }
            Err(e) => {
                error!("Playback failed on {}: {}", name, e);
                self.inner
                    .registry
                    .set_error(&session.session_id, &e.to_string());
                self.record_attempt(name, video_path, false);
                self.mark_error(name, &e.to_string());
                false
            }
        }
    }

    fn mark_error(&self, name: &str, message: &str) {
        let mut state = self.lock_state();
        if let Some(device) = state.devices.get_mut(name) {
            device.record_error(message);
        }
    }

    fn record_attempt(&self, name: &str, video: &Path, success: bool) {
        let mut state = self.lock_state();
        state
            .stats
            .entry(name.to_string())
            .or_default()
            .record(video, success);
    }

    /// Retry a failed assignment with exponential backoff.
    ///
    /// delay = RETRY_BASE_DELAY * 2^retry_count, bounded by
    /// [`MAX_RETRY_ATTEMPTS`]; exhaustion resets the counter and leaves
    /// the assignment in place with the device in error state.
    fn schedule_retry(&self, name: &str, video_path: &Path, priority: u8) {
        let retry_count = {
            let mut state = self.lock_state();
            let count = state.retries.get(name).copied().unwrap_or(0);
            if count >= MAX_RETRY_ATTEMPTS {
                state.retries.insert(name.to_string(), 0);
                warn!(
                    "Max retry attempts ({}) reached for {}, giving up",
                    MAX_RETRY_ATTEMPTS, name
                );
                return;
            }
            state.retries.insert(name.to_string(), count + 1);
            count
        };

        let delay = RETRY_BASE_DELAY * 2u32.pow(retry_count);
        info!(
            "Scheduling retry {}/{} for {} in {:?}",
            retry_count + 1,
            MAX_RETRY_ATTEMPTS,
            name,
            delay
        );

        let weak = Arc::downgrade(&self.inner);
        let name = name.to_string();
        let video_path = video_path.to_path_buf();
        let _ = thread::Builder::new()
            .name(format!("retry-{}", name))
            .spawn(move || {
                thread::sleep(delay);
                let Some(manager) = DeviceManager::from_weak(&weak) else {
                    return;
                };

                // The assignment may have been replaced while we slept.
                let still_assigned = {
                    let state = manager.lock_state();
                    state
                        .assignments
                        .get(&name)
                        .is_some_and(|a| a.video_path == video_path)
                };
                if !still_assigned {
                    debug!("Dropping retry for {}: assignment changed", name);
                    return;
                }

                if !manager.auto_play(&name, &video_path) {
                    manager.schedule_retry(&name, &video_path, priority);
                }
            });
    }

    pub fn get_device_playback_stats(&self, name: &str) -> Option<PlaybackStats> {
        self.lock_state().stats.get(name).cloned()
    }

    pub fn get_scheduled_assignments(&self) -> HashMap<String, ScheduledAssignment> {
        self.inner.scheduled.lock().expect("scheduled poisoned").clone()
    }

    /// Remove and return scheduled assignments due at `now`.
    fn take_due_schedules(&self, now: DateTime<Utc>) -> Vec<(String, ScheduledAssignment)> {
        let mut scheduled = self.inner.scheduled.lock().expect("scheduled poisoned");
        let due: Vec<String> = scheduled
            .iter()
            .filter(|(_, a)| a.scheduled_time <= now)
            .map(|(name, _)| name.clone())
            .collect();
        due.into_iter()
            .filter_map(|name| scheduled.remove(&name).map(|a| (name, a)))
            .collect()
    }

    /// Promote matured scheduled assignments to live ones.
    fn promote_due_schedules(&self) {
        for (name, assignment) in self.take_due_schedules(Utc::now()) {
            info!(
                "Promoting scheduled assignment for {}: {}",
                name,
                assignment.video_path.display()
            );
            self.assign(&name, &assignment.video_path, SCHEDULED_PRIORITY, None);
        }
    }

    // =====================================================================
    // Discovery
    // =====================================================================

    pub fn start_discovery(&self) {
        let mut guard = self
            .inner
            .discovery_handle
            .lock()
            .expect("discovery handle poisoned");
        if guard.is_some() {
            warn!("Discovery is already running");
            return;
        }

        self.inner.discovery_stop.store(false, Ordering::SeqCst);
        self.inner.discovery_paused.store(false, Ordering::SeqCst);

        let manager = self.clone();
        let handle = thread::Builder::new()
            .name("discovery".to_string())
            .spawn(move || manager.discovery_loop())
            .expect("failed to spawn discovery thread");
        *guard = Some(handle);
        info!("Discovery started");
    }

    /// Signal the discovery loop and wait up to one second for it.
    pub fn stop_discovery(&self) {
        self.inner.discovery_stop.store(true, Ordering::SeqCst);

        let handle = self
            .inner
            .discovery_handle
            .lock()
            .expect("discovery handle poisoned")
            .take();
        let Some(handle) = handle else {
            return;
        };

        for _ in 0..10 {
            if handle.is_finished() {
                let _ = handle.join();
                info!("Discovery stopped");
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
        // The loop observes the flag at its next suspension point; no
        // need to keep waiting on it.
        warn!("Discovery thread still draining, detaching");
    }

    pub fn pause_discovery(&self) {
        self.inner.discovery_paused.store(true, Ordering::SeqCst);
        info!("Discovery paused");
    }

    pub fn resume_discovery(&self) {
        self.inner.discovery_paused.store(false, Ordering::SeqCst);
        info!("Discovery resumed");
    }

    pub fn get_discovery_status(&self) -> DiscoveryStatus {
        let running = self
            .inner
            .discovery_handle
            .lock()
            .expect("discovery handle poisoned")
            .as_ref()
            .is_some_and(|h| !h.is_finished());
        DiscoveryStatus {
            running,
            paused: self.inner.discovery_paused.load(Ordering::SeqCst),
            last_cycle: *self.inner.last_cycle.lock().expect("last cycle poisoned"),
            device_count: self.lock_state().devices.len(),
        }
    }

    fn discovery_loop(&self) {
        while !self.inner.discovery_stop.load(Ordering::SeqCst) {
            if !self.inner.discovery_paused.load(Ordering::SeqCst) {
                self.run_discovery_cycle();
                *self.inner.last_cycle.lock().expect("last cycle poisoned") = Some(Utc::now());
            }

            let mut slept = Duration::ZERO;
            while slept < DISCOVERY_INTERVAL {
                if self.inner.discovery_stop.load(Ordering::SeqCst) {
                    return;
                }
                let step = Duration::from_millis(250);
                thread::sleep(step);
                slept += step;
            }
        }
    }

    /// One discovery cycle: sweep schedules, search, reconcile, stage
    /// disconnects.
    fn run_discovery_cycle(&self) {
        self.promote_due_schedules();

        let responses = match ssdp::search_avtransport(SSDP_WINDOW) {
            Ok(responses) => responses,
            Err(e) => {
                warn!("SSDP search failed: {}", e);
                Vec::new()
            }
        };

        let descriptions = fetch_descriptions(responses);
        let mut observed = HashSet::new();

        for description in descriptions {
            let name = description.friendly_name.clone();
            let (is_new, is_changed) = {
                let state = self.lock_state();
                match state.devices.get(&name) {
                    None => (true, false),
                    Some(existing) => (
                        false,
                        existing.hostname != description.hostname
                            || existing.location != description.location,
                    ),
                }
            };

            let info = DeviceInfo {
                name: name.clone(),
                kind: DeviceKind::Dlna,
                hostname: description.hostname.clone(),
                control_url: description.control_url.clone(),
                service_type: description.service_type.clone(),
                location: description.location.clone(),
                friendly_name: Some(description.friendly_name.clone()),
                manufacturer: description.manufacturer.clone(),
            };

            if self.register(info).is_some() {
                observed.insert(name.clone());
                self.process_auto_assignment(&name, is_new || is_changed);
            }
        }

        self.check_disconnected(&observed);
    }

    /// Converge one observed device toward its configured video.
    fn process_auto_assignment(&self, name: &str, force: bool) {
        let Some(config) = self.inner.config.get(name) else {
            debug!("No configuration for {}, nothing to assign", name);
            return;
        };

        if !force {
            let playing = self
                .get(name)
                .map(|d| d.is_playing)
                .unwrap_or(false);
            if playing {
                return;
            }
        }

        self.assign(name, &config.video_file, config.priority, config.schedule);
    }

    /// Apply the disconnection policy to devices missing from `observed`.
    fn check_disconnected(&self, observed: &HashSet<String>) {
        let now = SystemTime::now();
        let snapshot: Vec<(String, SystemTime, bool, DeviceStatus, DeviceKind)> = {
            let state = self.lock_state();
            state
                .devices
                .values()
                .map(|d| (d.name.clone(), d.last_seen, d.is_playing, d.status, d.kind))
                .collect()
        };

        for (name, last_seen, is_playing, status, kind) in snapshot {
            if observed.contains(&name) {
                continue;
            }
            // Transcreen devices do not announce over SSDP; their
            // liveness is judged by their own API failures.
            if kind == DeviceKind::Transcreen {
                continue;
            }
            let Ok(elapsed) = now.duration_since(last_seen) else {
                continue;
            };

            match disconnect_action(elapsed, is_playing) {
                DisconnectAction::Keep => {}
                DisconnectAction::Disconnect => {
                    if status != DeviceStatus::Disconnected {
                        warn!(
                            "Device {} unseen for {:?}, marking disconnected",
                            name, elapsed
                        );
                        self.mark_disconnected(&name);
                    }
                }
                DisconnectAction::Purge => {
                    warn!("Device {} unseen for {:?}, purging", name, elapsed);
                    self.unregister(&name);
                }
            }
        }
    }

    /// Transition a device to disconnected, tearing its sessions down.
    fn mark_disconnected(&self, name: &str) {
        let driver = {
            let mut state = self.lock_state();
            if let Some(device) = state.devices.get_mut(name) {
                device.status = DeviceStatus::Disconnected;
                device.is_playing = false;
                device.streaming_url = None;
                device.streaming_port = None;
                device.connected_since = None;
            }
            state.drivers.get(name).cloned()
        };

        if let Some(driver) = driver {
            driver.disable_loop();
        }
        self.signal_health_monitor(name);
        // No active sessions may survive a disconnect.
        self.inner.registry.unregister_device_sessions(name);
    }

    // =====================================================================
    // Health monitoring
    // =====================================================================

    fn start_health_monitor(&self, name: &str) {
        let mut monitors = self
            .inner
            .health_monitors
            .lock()
            .expect("health monitors poisoned");

        // Replace a previous monitor for this device; it exits on its
        // own after seeing the flag.
        if let Some(old) = monitors.remove(name) {
            old.stop.store(true, Ordering::SeqCst);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let weak = Arc::downgrade(&self.inner);
        let device_name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("health-{}", name))
            .spawn(move || health_monitor_loop(weak, device_name, stop_clone))
            .expect("failed to spawn health monitor thread");

        monitors.insert(name.to_string(), HealthMonitor { stop, handle });
    }

    fn signal_health_monitor(&self, name: &str) {
        let mut monitors = self
            .inner
            .health_monitors
            .lock()
            .expect("health monitors poisoned");
        if let Some(monitor) = monitors.remove(name) {
            monitor.stop.store(true, Ordering::SeqCst);
        }
    }

    /// Registry callback for stalled or over-age sessions.
    fn handle_streaming_issue(&self, session: &StreamingSession) {
        // Sessions can belong to pseudo-devices (e.g. "overlay") that
        // the manager does not own.
        if self.get(&session.device_name).is_none() {
            return;
        }

        if session.status != SessionStatus::Stalled && session.status != SessionStatus::Error {
            return;
        }

        warn!(
            "Streaming issue on {} (session {}, {})",
            session.device_name, session.session_id, session.status
        );
        self.update_status(
            &session.device_name,
            DeviceStatus::StreamingIssue,
            None,
            None,
            Some(format!("session {} {}", session.session_id, session.status)),
        );

        if self.control_mode(&session.device_name) != ControlMode::Auto {
            return;
        }

        let assigned = {
            let state = self.lock_state();
            state
                .assignments
                .get(&session.device_name)
                .map(|a| a.video_path.clone())
        };
        if let Some(video) = assigned {
            self.recover(&session.device_name, &video);
        }
    }

    /// Stop, clean up and re-play the assigned video.
    fn recover(&self, name: &str, video_path: &Path) {
        info!("Attempting recovery on {}", name);

        let driver = self.lock_state().drivers.get(name).cloned();
        if let Some(driver) = driver {
            if let Err(e) = driver.stop() {
                debug!("Stop during recovery of {} failed: {}", name, e);
            }
        }
        self.inner.registry.unregister_device_sessions(name);

        if !self.auto_play(name, video_path) {
            let priority = {
                let state = self.lock_state();
                state.assignments.get(name).map(|a| a.priority).unwrap_or(0)
            };
            self.schedule_retry(name, video_path, priority);
        }
    }

    fn driver_for(&self, device: &Device) -> Arc<RendererDriver> {
        let mut state = self.lock_state();
        if let Some(driver) = state.drivers.get(&device.name) {
            let endpoint_matches = match driver.control_url() {
                Some(url) => url == device.control_url,
                None => device.kind == DeviceKind::Transcreen,
            };
            if endpoint_matches {
                return Arc::clone(driver);
            }
        }

        let driver = Arc::new(RendererDriver::new(
            device.name.clone(),
            RendererBackend::for_device(device),
        ));
        state
            .drivers
            .insert(device.name.clone(), Arc::clone(&driver));
        driver
    }

    // =====================================================================
    // Manual control (REST collaborator surface)
    // =====================================================================

    /// User-initiated play; puts the device under manual control.
    pub fn play_device(&self, name: &str, video_path: &Path) -> bool {
        if !video_path.exists() {
            error!(
                "Cannot play {} on {}: file does not exist",
                video_path.display(),
                name
            );
            return false;
        }

        self.set_control_mode(name, ControlMode::Manual);
        {
            let mut state = self.lock_state();
            state.assignments.insert(
                name.to_string(),
                Assignment {
                    video_path: video_path.to_path_buf(),
                    priority: SCHEDULED_PRIORITY,
                },
            );
            state.retries.insert(name.to_string(), 0);
        }
        self.auto_play(name, video_path)
    }

    /// User-initiated stop; automation stands down until resumed.
    pub fn stop_device(&self, name: &str) -> bool {
        self.set_control_mode(name, ControlMode::Manual);
        self.signal_health_monitor(name);

        let driver = self.lock_state().drivers.get(name).cloned();
        let stopped = match driver {
            Some(driver) => driver.stop().is_ok(),
            None => false,
        };

        {
            let mut state = self.lock_state();
            if let Some(device) = state.devices.get_mut(name) {
                device.is_playing = false;
                device.status = DeviceStatus::Connected;
                device.current_video = None;
                device.streaming_url = None;
                device.streaming_port = None;
            }
        }
        self.inner.registry.unregister_device_sessions(name);
        stopped
    }

    pub fn pause_device(&self, name: &str) -> bool {
        let driver = self.lock_state().drivers.get(name).cloned();
        match driver {
            Some(driver) => match driver.pause() {
                Ok(()) => {
                    self.update_status(name, DeviceStatus::Paused, Some(false), None, None);
                    true
                }
                Err(e) => {
                    warn!("Pause failed on {}: {}", name, e);
                    false
                }
            },
            None => false,
        }
    }

    pub fn seek_device(&self, name: &str, position_secs: u64) -> bool {
        let driver = self.lock_state().drivers.get(name).cloned();
        match driver {
            Some(driver) => match driver.seek(position_secs) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Seek failed on {}: {}", name, e);
                    false
                }
            },
            None => false,
        }
    }

    // =====================================================================
    // Config passthrough
    // =====================================================================

    /// Load desired state and pre-register its devices.
    ///
    /// Pre-registered devices start disconnected; discovery flips them
    /// online when they actually answer.
    pub fn load_devices_from_config(&self, path: &Path) -> Vec<String> {
        let names = self.inner.config.load_from_file(path);

        for name in &names {
            let Some(config) = self.inner.config.get(name) else {
                continue;
            };
            let info = DeviceInfo {
                name: name.clone(),
                kind: config.kind,
                hostname: config.hostname.clone(),
                control_url: config.action_url.clone(),
                service_type: AVTRANSPORT_SERVICE_TYPE.to_string(),
                location: config.location.clone().unwrap_or_default(),
                friendly_name: config.friendly_name.clone(),
                manufacturer: config.manufacturer.clone(),
            };

            let mut state = self.lock_state();
            state
                .devices
                .entry(name.clone())
                .or_insert_with(|| Device::from_info(info, DeviceStatus::Disconnected));
        }

        names
    }

    pub fn save_devices_to_config(&self, path: &Path) -> bool {
        self.inner.config.save_to_file(path, None)
    }

    // =====================================================================
    // Shutdown
    // =====================================================================

    /// Stop every background task owned by the manager.
    pub fn shutdown(&self) {
        self.stop_discovery();

        {
            let mut monitors = self
                .inner
                .health_monitors
                .lock()
                .expect("health monitors poisoned");
            for (_, monitor) in monitors.drain() {
                monitor.stop.store(true, Ordering::SeqCst);
            }
        }

        let drivers: Vec<Arc<RendererDriver>> = {
            let state = self.lock_state();
            state.drivers.values().cloned().collect()
        };
        for driver in drivers {
            driver.disable_loop();
        }

        self.inner.registry.stop_monitoring();
        self.inner.pool.stop_all();
        info!("Device manager shut down");
    }
}

fn media_name_of(video_path: &Path) -> String {
    video_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| video_path.to_string_lossy().to_string())
}

/// Fetch device descriptions on a small worker pool.
fn fetch_descriptions(responses: Vec<ssdp::SsdpResponse>) -> Vec<DeviceDescription> {
    if responses.is_empty() {
        return Vec::new();
    }

    let (task_tx, task_rx) = bounded::<ssdp::SsdpResponse>(responses.len());
    let (result_tx, result_rx) = bounded::<DeviceDescription>(responses.len());

    let worker_count = FETCH_WORKERS.min(responses.len());
    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let task_rx = task_rx.clone();
        let result_tx = result_tx.clone();
        workers.push(thread::spawn(move || {
            while let Ok(task) = task_rx.recv() {
                match fetch_device_description(&task.location, DESCRIPTION_TIMEOUT) {
                    Ok(description) => {
                        let _ = result_tx.send(description);
                    }
                    Err(e) => {
                        warn!("Description fetch for {} failed: {}", task.location, e);
                    }
                }
            }
        }));
    }
    drop(task_rx);
    drop(result_tx);

    for response in responses {
        let _ = task_tx.send(response);
    }
    drop(task_tx);

    let mut descriptions = Vec::new();
    while let Ok(description) = result_rx.recv() {
        descriptions.push(description);
    }
    for worker in workers {
        let _ = worker.join();
    }
    descriptions
}

/// Per-device playback health loop.
fn health_monitor_loop(weak: Weak<ManagerInner>, name: String, stop: Arc<AtomicBool>) {
    let mut consecutive_failures: u32 = 0;

    loop {
        // Interval sleep, bailing quickly on the stop flag.
        let mut slept = Duration::ZERO;
        while slept < PLAYBACK_HEALTH_CHECK_INTERVAL {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            let step = Duration::from_millis(250);
            thread::sleep(step);
            slept += step;
        }

        let Some(manager) = DeviceManager::from_weak(&weak) else {
            return;
        };

        // Exit when the device is gone or no longer assigned.
        let Some(device) = manager.get(&name) else {
            return;
        };
        let assigned = {
            let state = manager.lock_state();
            state.assignments.get(&name).map(|a| a.video_path.clone())
        };
        let Some(video_path) = assigned else {
            return;
        };

        // A user steering the device wins over automation.
        if manager.control_mode(&name) != ControlMode::Auto {
            continue;
        }

        if !device.is_playing {
            consecutive_failures += 1;
            warn!(
                "[{}] Not playing when it should be ({}/{})",
                name, consecutive_failures, MAX_CONSECUTIVE_FAILURES
            );
            if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                consecutive_failures = 0;
                manager.recover(&name, &video_path);
            }
            continue;
        }
        consecutive_failures = 0;

        let sessions = manager.inner.registry.sessions_for_device(&name);
        let has_active = sessions.iter().any(|s| s.active);
        if !has_active {
            // is_playing without a live session violates the serving
            // invariant; restart the stream.
            warn!("[{}] Playing without an active streaming session", name);
            manager.recover(&name, &video_path);
            continue;
        }

        let troubled: Vec<&StreamingSession> = sessions
            .iter()
            .filter(|s| {
                s.status == SessionStatus::Stalled || s.status == SessionStatus::Error
            })
            .collect();
        if !troubled.is_empty() {
            let bytes: u64 = troubled.iter().map(|s| s.bytes_served).sum();
            manager.update_status(
                &name,
                DeviceStatus::StreamingIssue,
                None,
                None,
                Some(format!(
                    "{} troubled session(s), {} bytes served",
                    troubled.len(),
                    bytes
                )),
            );
        }
    }
}
