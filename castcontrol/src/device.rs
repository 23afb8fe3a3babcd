//! Observed device state.

use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

pub use castconfig::DeviceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Connected,
    Disconnected,
    Playing,
    Paused,
    Error,
    StreamingIssue,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Connected => "connected",
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Playing => "playing",
            DeviceStatus::Paused => "paused",
            DeviceStatus::Error => "error",
            DeviceStatus::StreamingIssue => "streaming_issue",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration input, produced by discovery or loaded from config.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    pub hostname: String,
    pub control_url: String,
    pub service_type: String,
    pub location: String,
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
}

/// A controllable renderer and its observed state.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub kind: DeviceKind,
    pub hostname: String,
    pub control_url: String,
    pub service_type: String,
    pub location: String,
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,

    pub status: DeviceStatus,
    pub is_playing: bool,
    pub current_video: Option<PathBuf>,
    pub streaming_url: Option<String>,
    pub streaming_port: Option<u16>,

    pub last_seen: SystemTime,
    pub connected_since: Option<DateTime<Utc>>,

    pub playback_position: Option<String>,
    pub playback_duration: Option<String>,
    pub playback_progress: Option<u8>,

    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

impl Device {
    pub fn from_info(info: DeviceInfo, status: DeviceStatus) -> Self {
        let connected_since = match status {
            DeviceStatus::Disconnected => None,
            _ => Some(Utc::now()),
        };
        Self {
            name: info.name,
            kind: info.kind,
            hostname: info.hostname,
            control_url: info.control_url,
            service_type: info.service_type,
            location: info.location,
            friendly_name: info.friendly_name,
            manufacturer: info.manufacturer,
            status,
            is_playing: false,
            current_video: None,
            streaming_url: None,
            streaming_port: None,
            last_seen: SystemTime::now(),
            connected_since,
            playback_position: None,
            playback_duration: None,
            playback_progress: None,
            last_error: None,
            last_error_time: None,
        }
    }

    /// True when the registration input matches what is already stored.
    pub fn matches_info(&self, info: &DeviceInfo) -> bool {
        self.hostname == info.hostname && self.location == info.location
    }

    /// Apply changed endpoint parameters in place.
    ///
    /// Streaming state and playback flags are deliberately left
    /// untouched: a renderer that re-announces with a new location is
    /// still the same device, often mid-playback.
    pub fn apply_info(&mut self, info: &DeviceInfo) {
        self.kind = info.kind;
        self.hostname = info.hostname.clone();
        self.control_url = info.control_url.clone();
        self.service_type = info.service_type.clone();
        self.location = info.location.clone();
        if info.friendly_name.is_some() {
            self.friendly_name = info.friendly_name.clone();
        }
        if info.manufacturer.is_some() {
            self.manufacturer = info.manufacturer.clone();
        }
    }

    pub fn record_error(&mut self, message: &str) {
        self.status = DeviceStatus::Error;
        self.last_error = Some(message.to_string());
        self.last_error_time = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> DeviceInfo {
        DeviceInfo {
            name: "Proj-A".to_string(),
            kind: DeviceKind::Dlna,
            hostname: "10.0.0.45".to_string(),
            control_url: "http://10.0.0.45:3500/ctrl".to_string(),
            service_type: "urn:schemas-upnp-org:service:AVTransport:1".to_string(),
            location: "http://10.0.0.45:3500/desc.xml".to_string(),
            friendly_name: Some("Proj-A".to_string()),
            manufacturer: None,
        }
    }

    #[test]
    fn test_from_info_connected() {
        let device = Device::from_info(sample_info(), DeviceStatus::Connected);
        assert_eq!(device.status, DeviceStatus::Connected);
        assert!(device.connected_since.is_some());
        assert!(!device.is_playing);
    }

    #[test]
    fn test_from_info_disconnected_has_no_connected_since() {
        let device = Device::from_info(sample_info(), DeviceStatus::Disconnected);
        assert!(device.connected_since.is_none());
    }

    #[test]
    fn test_apply_info_preserves_streaming_state() {
        let mut device = Device::from_info(sample_info(), DeviceStatus::Connected);
        device.is_playing = true;
        device.streaming_url = Some("http://10.0.0.2:9000/file_video/a.mp4".to_string());
        device.streaming_port = Some(9000);

        let mut moved = sample_info();
        moved.hostname = "10.0.0.99".to_string();
        moved.location = "http://10.0.0.99:3500/desc.xml".to_string();
        device.apply_info(&moved);

        assert_eq!(device.hostname, "10.0.0.99");
        assert!(device.is_playing);
        assert_eq!(device.streaming_port, Some(9000));
    }

    #[test]
    fn test_record_error() {
        let mut device = Device::from_info(sample_info(), DeviceStatus::Connected);
        device.record_error("play failed");
        assert_eq!(device.status, DeviceStatus::Error);
        assert_eq!(device.last_error.as_deref(), Some("play failed"));
        assert!(device.last_error_time.is_some());
    }
}
