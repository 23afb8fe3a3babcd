//! Renderer driver: transport commands plus the per-device loop monitor.
//!
//! The driver owns the only path to a device's transport endpoint; a
//! per-device mutex serializes every command so the loop monitor and
//! external callers never interleave SOAP calls on the same renderer.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::{debug, info, warn};

use castdidl::VideoItem;
use castutils::{format_secs_to_hms, parse_hms_to_secs};

use crate::avtransport::AvTransportClient;
use crate::device::{Device, DeviceKind};
use crate::transcreen::TranscreenClient;

/// Inactivity span after which the monitor probes the transport state
/// instead of trusting its timer.
const INACTIVITY_PROBE_THRESHOLD: Duration = Duration::from_secs(60);

/// Restart verification: RelTime at or under this counts as "rewound".
const RESTART_VERIFY_WINDOW: u64 = 5;

/// Cooldown after a monitor error.
const ERROR_COOLDOWN_SECS: u64 = 5;

/// Duration assumed when every sensing source fails.
const FALLBACK_DURATION_SECS: u64 = 30;

/// Delay between Stop and SetAVTransportURI in a full reset.
const STOP_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// What the driver is currently keeping on screen.
#[derive(Debug, Clone)]
pub struct MediaItem {
    /// Renderer-facing HTTP URL.
    pub url: String,
    /// Local file backing the URL.
    pub file_path: PathBuf,
    pub title: String,
    /// Duration in seconds when already known (e.g. from metadata).
    pub duration_hint: Option<u64>,
}

impl MediaItem {
    fn didl(&self, duration_secs: Option<u64>) -> Result<String> {
        VideoItem {
            title: self.title.clone(),
            url: self.url.clone(),
            file_path: self.file_path.to_string_lossy().to_string(),
            duration_secs,
        }
        .to_didl()
        .map_err(|e| anyhow!("Failed to build DIDL-Lite metadata: {e}"))
    }
}

/// Transport capability set shared by the device kinds.
#[derive(Debug, Clone)]
pub enum RendererBackend {
    Dlna(AvTransportClient),
    Transcreen(TranscreenClient),
}

impl RendererBackend {
    pub fn for_device(device: &Device) -> Self {
        match device.kind {
            DeviceKind::Dlna => RendererBackend::Dlna(AvTransportClient::new(
                device.control_url.clone(),
                device.service_type.clone(),
            )),
            DeviceKind::Transcreen => {
                RendererBackend::Transcreen(TranscreenClient::new(device.hostname.clone()))
            }
        }
    }

    fn is_dlna(&self) -> bool {
        matches!(self, RendererBackend::Dlna(_))
    }
}

struct MonitorHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Loop-monitor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    /// Sleeping until the media approaches its end.
    AwaitingEnd,
    /// Activity went quiet; ask the transport what it is doing.
    Probing,
    /// Rewind or re-arm playback.
    Restarting,
    /// An iteration failed; back off before trying again.
    ErrorCooldown,
}

/// Per-device driver. One instance per registered renderer; clones
/// share state, which lets the loop monitor carry its own handle.
#[derive(Clone)]
pub struct RendererDriver {
    name: String,
    backend: RendererBackend,
    /// Serializes all transport commands to this device.
    command_lock: Arc<Mutex<()>>,
    /// Desired looping state; cleared by stop.
    loop_enabled: Arc<AtomicBool>,
    monitor: Arc<Mutex<Option<MonitorHandle>>>,
    last_activity: Arc<Mutex<Instant>>,
    current: Arc<Mutex<Option<MediaItem>>>,
}

impl RendererDriver {
    pub fn new(name: String, backend: RendererBackend) -> Self {
        Self {
            name,
            backend,
            command_lock: Arc::new(Mutex::new(())),
            loop_enabled: Arc::new(AtomicBool::new(false)),
            monitor: Arc::new(Mutex::new(None)),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn control_url(&self) -> Option<&str> {
        match &self.backend {
            RendererBackend::Dlna(client) => Some(&client.control_url),
            RendererBackend::Transcreen(_) => None,
        }
    }

    pub fn current_media(&self) -> Option<MediaItem> {
        self.current.lock().expect("current media poisoned").clone()
    }

    /// Start playback and, for looping DLNA devices, the loop monitor.
    pub fn play(&self, media: MediaItem, loop_playback: bool) -> Result<()> {
        info!("[{}] Playing {}", self.name, media.url);
        *self.current.lock().expect("current media poisoned") = Some(media.clone());

        match &self.backend {
            RendererBackend::Dlna(client) => {
                let didl = media.didl(media.duration_hint)?;
                let _guard = self.command_lock.lock().expect("command lock poisoned");
                client.set_av_transport_uri(&media.url, &didl)?;
                client.play()?;
            }
            RendererBackend::Transcreen(client) => {
                let _guard = self.command_lock.lock().expect("command lock poisoned");
                client.play(&media.url, loop_playback)?;
            }
        }

        self.touch_activity();

        // Transcreen loops natively; only DLNA needs the monitor.
        if loop_playback && self.backend.is_dlna() {
            self.loop_enabled.store(true, Ordering::SeqCst);
            self.start_loop_monitor();
        } else {
            self.loop_enabled.store(false, Ordering::SeqCst);
            self.stop_loop_monitor();
        }

        Ok(())
    }

    /// Stop playback, tearing the loop monitor down first.
    pub fn stop(&self) -> Result<()> {
        info!("[{}] Stopping playback", self.name);
        self.loop_enabled.store(false, Ordering::SeqCst);
        self.stop_loop_monitor();

        let result = {
            let _guard = self.command_lock.lock().expect("command lock poisoned");
            match &self.backend {
                RendererBackend::Dlna(client) => client.stop(),
                RendererBackend::Transcreen(client) => client.stop(),
            }
        };

        *self.current.lock().expect("current media poisoned") = None;
        result
    }

    pub fn pause(&self) -> Result<()> {
        let _guard = self.command_lock.lock().expect("command lock poisoned");
        match &self.backend {
            RendererBackend::Dlna(client) => client.pause(),
            RendererBackend::Transcreen(client) => client.pause(),
        }
    }

    /// Seek to a position in seconds.
    pub fn seek(&self, position_secs: u64) -> Result<()> {
        let target = format_secs_to_hms(position_secs);
        let _guard = self.command_lock.lock().expect("command lock poisoned");
        match &self.backend {
            RendererBackend::Dlna(client) => client.seek(&target),
            RendererBackend::Transcreen(client) => client.seek(&target),
        }
    }

    /// Disable looping without waiting for the monitor to exit. Used on
    /// unregister, where blocking is not allowed.
    pub fn disable_loop(&self) {
        self.loop_enabled.store(false, Ordering::SeqCst);
        if let Ok(guard) = self.monitor.lock() {
            if let Some(monitor) = guard.as_ref() {
                monitor.stop.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn has_loop_monitor(&self) -> bool {
        self.monitor
            .lock()
            .expect("monitor handle poisoned")
            .as_ref()
            .is_some_and(|m| !m.handle.is_finished())
    }

    // =====================================================================
    // Loop monitor
    // =====================================================================

    /// Start the loop monitor, replacing any existing one.
    fn start_loop_monitor(&self) {
        let mut guard = self.monitor.lock().expect("monitor handle poisoned");

        // At most one monitor per device: signal the old one and wait
        // for it before spawning the replacement.
        if let Some(old) = guard.take() {
            old.stop.store(true, Ordering::SeqCst);
            let _ = old.handle.join();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let driver = self.clone();

        let handle = thread::Builder::new()
            .name(format!("loop-monitor-{}", self.name))
            .spawn(move || driver.monitor_loop(stop_clone))
            .expect("failed to spawn loop monitor thread");

        *guard = Some(MonitorHandle { stop, handle });
        debug!("[{}] Loop monitor started", self.name);
    }

    /// Signal the monitor and wait for it to exit.
    fn stop_loop_monitor(&self) {
        let mut guard = self.monitor.lock().expect("monitor handle poisoned");
        if let Some(monitor) = guard.take() {
            monitor.stop.store(true, Ordering::SeqCst);
            let _ = monitor.handle.join();
            debug!("[{}] Loop monitor stopped", self.name);
        }
    }

    fn monitor_active(&self, stop: &AtomicBool) -> bool {
        !stop.load(Ordering::SeqCst) && self.loop_enabled.load(Ordering::SeqCst)
    }

    /// The monitor body. Every failure transitions to a cooldown; the
    /// thread only exits when looping is disabled.
    fn monitor_loop(&self, stop: Arc<AtomicBool>) {
        let mut state = MonitorState::AwaitingEnd;

        while self.monitor_active(&stop) {
            state = match state {
                MonitorState::AwaitingEnd => self.await_end(&stop),
                MonitorState::Probing => self.probe_transport(),
                MonitorState::Restarting => match self.restart_playback() {
                    Ok(()) => {
                        info!("[{}] Restarted looping video", self.name);
                        self.touch_activity();
                        MonitorState::AwaitingEnd
                    }
                    Err(e) => {
                        warn!("[{}] Restart failed: {}", self.name, e);
                        MonitorState::ErrorCooldown
                    }
                },
                MonitorState::ErrorCooldown => {
                    self.sleep_while_active(Duration::from_secs(ERROR_COOLDOWN_SECS), &stop);
                    MonitorState::AwaitingEnd
                }
            };
        }

        debug!("[{}] Loop monitor exiting", self.name);
    }

    /// Sleep until the media nears its end, then restart.
    fn await_end(&self, stop: &AtomicBool) -> MonitorState {
        if self.last_activity_elapsed() > INACTIVITY_PROBE_THRESHOLD {
            return MonitorState::Probing;
        }

        let duration = self.sense_duration();
        let wait = compute_wait_secs(duration);
        debug!(
            "[{}] Waiting {}s of {}s before restarting",
            self.name, wait, duration
        );

        if !self.sleep_while_active(Duration::from_secs(wait), stop) {
            // Looping was disabled mid-sleep; the outer loop exits.
            return MonitorState::AwaitingEnd;
        }

        MonitorState::Restarting
    }

    /// Ask the transport whether it is actually playing.
    fn probe_transport(&self) -> MonitorState {
        let RendererBackend::Dlna(client) = &self.backend else {
            return MonitorState::AwaitingEnd;
        };

        let info = {
            let _guard = self.command_lock.lock().expect("command lock poisoned");
            client.get_transport_info()
        };

        match info {
            Ok(info) => {
                if info.current_transport_state != "UNKNOWN" {
                    self.touch_activity();
                }
                if info.current_transport_state == "PLAYING" {
                    MonitorState::AwaitingEnd
                } else {
                    debug!(
                        "[{}] Transport reports {} while looping",
                        self.name, info.current_transport_state
                    );
                    MonitorState::Restarting
                }
            }
            Err(e) => {
                warn!("[{}] Transport probe failed: {}", self.name, e);
                MonitorState::ErrorCooldown
            }
        }
    }

    /// Restart the current video.
    ///
    /// Strategy, in order:
    /// 1. If the transport is PLAYING or PAUSED_PLAYBACK, seek back to
    ///    00:00:00 (resuming when paused) and verify the rewind took.
    /// 2. Full reset: Stop, settle, SetAVTransportURI with complete
    ///    DIDL-Lite, Play.
    fn restart_playback(&self) -> Result<()> {
        let media = self
            .current_media()
            .ok_or_else(|| anyhow!("no current media to restart"))?;

        let RendererBackend::Dlna(client) = &self.backend else {
            return Ok(());
        };

        let _guard = self.command_lock.lock().expect("command lock poisoned");

        if let Ok(info) = client.get_transport_info() {
            let state = info.current_transport_state.as_str();
            if state == "PLAYING" || state == "PAUSED_PLAYBACK" {
                match self.seek_restart(client, state) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        debug!(
                            "[{}] Seek restart failed ({}), falling back to full reset",
                            self.name, e
                        );
                    }
                }
            }
        }

        // Full reset path.
        if let Err(e) = client.stop() {
            debug!("[{}] Stop before reset failed: {}", self.name, e);
        }
        thread::sleep(STOP_SETTLE_DELAY);

        let duration = media.duration_hint.or_else(|| ffprobe_duration(&media.file_path));
        let didl = media.didl(duration)?;
        client.set_av_transport_uri(&media.url, &didl)?;
        client.play()
    }

    fn seek_restart(&self, client: &AvTransportClient, state: &str) -> Result<()> {
        debug!("[{}] Seeking to beginning", self.name);
        client.seek("00:00:00")?;
        if state == "PAUSED_PLAYBACK" {
            client.play()?;
        }

        let position = client.get_position_info()?;
        match parse_hms_to_secs(&position.rel_time) {
            Some(secs) if secs <= RESTART_VERIFY_WINDOW => Ok(()),
            Some(secs) => Err(anyhow!("seek did not rewind (RelTime at {}s)", secs)),
            None => Err(anyhow!("seek verification unavailable (RelTime {})", position.rel_time)),
        }
    }

    /// Video duration in seconds, best source first: the stored hint,
    /// ffprobe on the backing file, the transport's TrackDuration, then
    /// a fixed fallback.
    fn sense_duration(&self) -> u64 {
        let media = self.current_media();

        if let Some(duration) = media.as_ref().and_then(|m| m.duration_hint) {
            return duration;
        }

        if let Some(duration) = media.as_ref().and_then(|m| ffprobe_duration(&m.file_path)) {
            debug!("[{}] ffprobe duration: {}s", self.name, duration);
            return duration;
        }

        if let RendererBackend::Dlna(client) = &self.backend {
            let position = {
                let _guard = self.command_lock.lock().expect("command lock poisoned");
                client.get_position_info()
            };
            if let Ok(position) = position {
                if let Some(duration) = parse_hms_to_secs(&position.track_duration) {
                    if duration > 0 {
                        debug!("[{}] TrackDuration: {}s", self.name, duration);
                        return duration;
                    }
                }
            }
        }

        warn!(
            "[{}] Could not determine video duration, assuming {}s",
            self.name, FALLBACK_DURATION_SECS
        );
        FALLBACK_DURATION_SECS
    }

    fn touch_activity(&self) {
        *self.last_activity.lock().expect("activity clock poisoned") = Instant::now();
    }

    fn last_activity_elapsed(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity clock poisoned")
            .elapsed()
    }

    /// Sleep in 1-second slices, bailing out as soon as looping is
    /// disabled. Returns true when the full span elapsed.
    fn sleep_while_active(&self, span: Duration, stop: &AtomicBool) -> bool {
        let deadline = Instant::now() + span;
        while Instant::now() < deadline {
            if !self.monitor_active(stop) {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(remaining.min(Duration::from_secs(1)));
        }
        self.monitor_active(stop)
    }
}

/// Seconds to sleep before the restart attempt.
///
/// Long videos restart 10 seconds early (never sooner than 5 seconds
/// in); very short clips restart at their halfway point.
fn compute_wait_secs(duration: u64) -> u64 {
    if duration <= 15 {
        (duration / 2).max(1)
    } else {
        duration.saturating_sub(10).max(5)
    }
}

/// Duration of a media file via a local ffprobe invocation.
fn ffprobe_duration(file_path: &Path) -> Option<u64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(file_path)
        .output()
        .ok()?;

    if !output.status.success() {
        debug!(
            "ffprobe failed for {}: {}",
            file_path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let seconds: f64 = text.trim().parse().ok()?;
    if seconds.is_finite() && seconds > 0.0 {
        Some(seconds.round() as u64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_driver() -> RendererDriver {
        // Port 1 on loopback refuses connections immediately, so every
        // SOAP attempt fails fast.
        RendererDriver::new(
            "test-device".to_string(),
            RendererBackend::Dlna(AvTransportClient::new(
                "http://127.0.0.1:1/AVTransport/Control".to_string(),
                "urn:schemas-upnp-org:service:AVTransport:1".to_string(),
            )),
        )
    }

    #[test]
    fn test_compute_wait_secs() {
        assert_eq!(compute_wait_secs(120), 110);
        assert_eq!(compute_wait_secs(30), 20);
        assert_eq!(compute_wait_secs(16), 6);
        // At 15s and below the restart lands at the halfway point.
        assert_eq!(compute_wait_secs(15), 7);
        assert_eq!(compute_wait_secs(14), 7);
        assert_eq!(compute_wait_secs(4), 2);
        assert_eq!(compute_wait_secs(1), 1);
        assert_eq!(compute_wait_secs(0), 1);
        // Floor of 5 seconds for durations just over the threshold.
        assert_eq!(compute_wait_secs(17), 7);
        assert_eq!(compute_wait_secs(20), 10);
    }

    #[test]
    fn test_duration_sensing_falls_back_to_default() {
        let driver = unreachable_driver();
        *driver.current.lock().unwrap() = Some(MediaItem {
            url: "http://10.0.0.2:9000/file_video/a.mp4".to_string(),
            file_path: PathBuf::from("/nonexistent/a.mp4"),
            title: "a".to_string(),
            duration_hint: None,
        });

        assert_eq!(driver.sense_duration(), FALLBACK_DURATION_SECS);
    }

    #[test]
    fn test_duration_hint_wins() {
        let driver = unreachable_driver();
        *driver.current.lock().unwrap() = Some(MediaItem {
            url: "http://10.0.0.2:9000/file_video/a.mp4".to_string(),
            file_path: PathBuf::from("/nonexistent/a.mp4"),
            title: "a".to_string(),
            duration_hint: Some(90),
        });

        assert_eq!(driver.sense_duration(), 90);
    }

    #[test]
    fn test_monitor_lifecycle_exactly_one() {
        let driver = unreachable_driver();
        *driver.current.lock().unwrap() = Some(MediaItem {
            url: "http://10.0.0.2:9000/file_video/a.mp4".to_string(),
            file_path: PathBuf::from("/nonexistent/a.mp4"),
            title: "a".to_string(),
            duration_hint: Some(600),
        });

        driver.loop_enabled.store(true, Ordering::SeqCst);
        driver.start_loop_monitor();
        assert!(driver.has_loop_monitor());

        // Replacing keeps exactly one monitor alive.
        driver.start_loop_monitor();
        assert!(driver.has_loop_monitor());

        driver.loop_enabled.store(false, Ordering::SeqCst);
        driver.stop_loop_monitor();
        assert!(!driver.has_loop_monitor());
    }

    #[test]
    fn test_disable_loop_signals_without_joining() {
        let driver = unreachable_driver();
        *driver.current.lock().unwrap() = Some(MediaItem {
            url: "http://10.0.0.2:9000/file_video/a.mp4".to_string(),
            file_path: PathBuf::from("/nonexistent/a.mp4"),
            title: "a".to_string(),
            duration_hint: Some(600),
        });

        driver.loop_enabled.store(true, Ordering::SeqCst);
        driver.start_loop_monitor();
        driver.disable_loop();
        assert!(!driver.loop_enabled.load(Ordering::SeqCst));

        // The monitor exits on its own within a sleep slice.
        std::thread::sleep(Duration::from_millis(1500));
        assert!(!driver.has_loop_monitor());
    }

    #[test]
    fn test_backend_for_device_kinds() {
        use crate::device::{DeviceInfo, DeviceStatus};

        let info = DeviceInfo {
            name: "Proj-A".to_string(),
            kind: DeviceKind::Dlna,
            hostname: "10.0.0.45".to_string(),
            control_url: "http://10.0.0.45:3500/ctrl".to_string(),
            service_type: "urn:schemas-upnp-org:service:AVTransport:1".to_string(),
            location: "http://10.0.0.45:3500/desc.xml".to_string(),
            friendly_name: None,
            manufacturer: None,
        };
        let device = Device::from_info(info.clone(), DeviceStatus::Connected);
        assert!(RendererBackend::for_device(&device).is_dlna());

        let mut transcreen_info = info;
        transcreen_info.kind = DeviceKind::Transcreen;
        let device = Device::from_info(transcreen_info, DeviceStatus::Connected);
        assert!(!RendererBackend::for_device(&device).is_dlna());
    }
}
