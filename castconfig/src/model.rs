//! Device configuration entries and their JSON encoding.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Kind of controllable renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Dlna,
    Transcreen,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Dlna => write!(f, "dlna"),
            DeviceKind::Transcreen => write!(f, "transcreen"),
        }
    }
}

fn default_priority() -> u8 {
    50
}

fn default_loop() -> bool {
    true
}

/// Desired-state entry for one device.
///
/// Matches the JSON configuration contract: an array of these objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_name: String,

    #[serde(rename = "type")]
    pub kind: DeviceKind,

    pub hostname: String,

    /// AVTransport control endpoint (or Transcreen API base).
    pub action_url: String,

    /// Absolute path of the video to keep playing; must exist on disk.
    pub video_file: PathBuf,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    /// Device-description URL, when known ahead of discovery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Assignment priority, 0-100.
    #[serde(default = "default_priority")]
    pub priority: u8,

    #[serde(rename = "loop", default = "default_loop")]
    pub loop_playback: bool,

    /// Wall-clock start time; until then the assignment stays scheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<DateTime<Utc>>,

    #[serde(default)]
    pub airplay_mode: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub airplay_url: Option<String>,

    #[serde(default)]
    pub enable_overlay_sync: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_video_name: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            kind: DeviceKind::default(),
            hostname: String::new(),
            action_url: String::new(),
            video_file: PathBuf::new(),
            friendly_name: None,
            manufacturer: None,
            location: None,
            priority: default_priority(),
            loop_playback: default_loop(),
            schedule: None,
            airplay_mode: false,
            airplay_url: None,
            enable_overlay_sync: false,
            sync_video_name: None,
        }
    }
}

impl DeviceConfig {
    /// Check required fields and that the video file exists on disk.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() {
            return Err(ConfigError::MissingField("device_name"));
        }
        if self.hostname.is_empty() {
            return Err(ConfigError::MissingField("hostname"));
        }
        if self.action_url.is_empty() {
            return Err(ConfigError::MissingField("action_url"));
        }
        if self.video_file.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("video_file"));
        }
        if !self.video_file.exists() {
            return Err(ConfigError::VideoFileNotFound(self.video_file.clone()));
        }
        if self.priority > 100 {
            return Err(ConfigError::InvalidPriority(self.priority));
        }
        Ok(())
    }
}

/// Partial update merged into an existing [`DeviceConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfigPatch {
    pub hostname: Option<String>,
    pub action_url: Option<String>,
    pub video_file: Option<PathBuf>,
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    pub location: Option<String>,
    pub priority: Option<u8>,
    #[serde(rename = "loop")]
    pub loop_playback: Option<bool>,
    pub schedule: Option<Option<DateTime<Utc>>>,
    pub airplay_mode: Option<bool>,
    pub airplay_url: Option<String>,
    pub enable_overlay_sync: Option<bool>,
    pub sync_video_name: Option<String>,
}

impl DeviceConfigPatch {
    pub fn apply_to(&self, config: &mut DeviceConfig) {
        if let Some(v) = &self.hostname {
            config.hostname = v.clone();
        }
        if let Some(v) = &self.action_url {
            config.action_url = v.clone();
        }
        if let Some(v) = &self.video_file {
            config.video_file = v.clone();
        }
        if let Some(v) = &self.friendly_name {
            config.friendly_name = Some(v.clone());
        }
        if let Some(v) = &self.manufacturer {
            config.manufacturer = Some(v.clone());
        }
        if let Some(v) = &self.location {
            config.location = Some(v.clone());
        }
        if let Some(v) = self.priority {
            config.priority = v;
        }
        if let Some(v) = self.loop_playback {
            config.loop_playback = v;
        }
        if let Some(v) = self.schedule {
            config.schedule = v;
        }
        if let Some(v) = self.airplay_mode {
            config.airplay_mode = v;
        }
        if let Some(v) = &self.airplay_url {
            config.airplay_url = Some(v.clone());
        }
        if let Some(v) = self.enable_overlay_sync {
            config.enable_overlay_sync = v;
        }
        if let Some(v) = &self.sync_video_name {
            config.sync_video_name = Some(v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serde_names() {
        assert_eq!(serde_json::to_string(&DeviceKind::Dlna).unwrap(), r#""dlna""#);
        assert_eq!(
            serde_json::to_string(&DeviceKind::Transcreen).unwrap(),
            r#""transcreen""#
        );
        let kind: DeviceKind = serde_json::from_str(r#""transcreen""#).unwrap();
        assert_eq!(kind, DeviceKind::Transcreen);
    }

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: DeviceConfig = serde_json::from_value(serde_json::json!({
            "device_name": "Proj-A",
            "type": "dlna",
            "hostname": "10.0.0.45",
            "action_url": "http://10.0.0.45:3500/ctrl",
            "video_file": "/v/a.mp4"
        }))
        .unwrap();

        assert_eq!(config.priority, 50);
        assert!(config.loop_playback);
        assert!(!config.airplay_mode);
        assert!(config.schedule.is_none());
    }

    #[test]
    fn test_loop_field_renamed() {
        let config: DeviceConfig = serde_json::from_value(serde_json::json!({
            "device_name": "Proj-A",
            "type": "dlna",
            "hostname": "10.0.0.45",
            "action_url": "http://10.0.0.45:3500/ctrl",
            "video_file": "/v/a.mp4",
            "loop": false
        }))
        .unwrap();
        assert!(!config.loop_playback);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["loop"], serde_json::json!(false));
    }

    #[test]
    fn test_validate_missing_fields() {
        let config = DeviceConfig {
            device_name: "Proj-A".to_string(),
            ..DeviceConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("hostname"))
        ));
    }
}
