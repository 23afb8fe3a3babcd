//! # castconfig - desired-state device configuration
//!
//! Thread-safe table of per-device desired state with source-priority
//! arbitration and JSON-file persistence. The table is the single source
//! of truth the device manager converges the fleet toward.
//!
//! Configuration sources carry a priority: file-backed sources (names
//! ending in `.json`) rank above manual writes, and a lower-priority
//! source can never overwrite a higher-priority entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};

mod model;

pub use model::{DeviceConfig, DeviceConfigPatch, DeviceKind};

/// Bounded lock acquisition; past this we degrade to a logged no-op.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Priority of `.json` file sources.
const FILE_SOURCE_PRIORITY: u8 = 100;
/// Priority of every other source (manual writes, API calls).
const DEFAULT_SOURCE_PRIORITY: u8 = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("video file not found: {0}")]
    VideoFileNotFound(PathBuf),

    #[error("priority {0} is out of range (0-100)")]
    InvalidPriority(u8),

    #[error("source '{new}' cannot override entry from higher-priority source '{current}'")]
    SourcePriority { new: String, current: String },
}

/// Priority of a configuration source name.
fn source_priority(source: &str) -> u8 {
    if source.ends_with(".json") {
        FILE_SOURCE_PRIORITY
    } else {
        DEFAULT_SOURCE_PRIORITY
    }
}

#[derive(Debug, Clone)]
struct ConfigEntry {
    config: DeviceConfig,
    source: String,
}

#[derive(Debug, Default)]
struct ConfigTable {
    entries: HashMap<String, ConfigEntry>,
}

/// Thread-safe store of `name -> DeviceConfig` with source arbitration.
///
/// All operations return safe defaults (false / None / empty) when the
/// table lock cannot be acquired within [`LOCK_TIMEOUT`]; callers treat
/// that as a failed no-op.
#[derive(Debug, Default)]
pub struct ConfigService {
    table: Mutex<ConfigTable>,
}

impl ConfigService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Option<parking_lot::MutexGuard<'_, ConfigTable>> {
        let guard = self.table.try_lock_for(LOCK_TIMEOUT);
        if guard.is_none() {
            error!("Timed out acquiring configuration lock after {:?}", LOCK_TIMEOUT);
        }
        guard
    }

    /// Add or replace the configuration for a device.
    ///
    /// Validates required fields and that `video_file` exists on disk,
    /// and refuses to overwrite an entry owned by a higher-priority
    /// source. Returns false on any refusal (logged, never panics).
    pub fn add(&self, name: &str, config: DeviceConfig, source: &str) -> bool {
        let Some(mut table) = self.lock() else {
            return false;
        };
        Self::add_locked(&mut table, name, config, source)
    }

    /// Add under an already-held lock, used by `load_from_file`.
    fn add_locked(
        table: &mut ConfigTable,
        name: &str,
        config: DeviceConfig,
        source: &str,
    ) -> bool {
        if let Err(e) = config.validate() {
            error!("Rejecting configuration for device {}: {}", name, e);
            return false;
        }

        if let Some(current) = table.entries.get(name) {
            if source_priority(&current.source) > source_priority(source) {
                info!(
                    "Not overriding configuration for {} from {} (current source {} has higher priority)",
                    name, source, current.source
                );
                return false;
            }
        }

        table.entries.insert(
            name.to_string(),
            ConfigEntry {
                config,
                source: source.to_string(),
            },
        );
        info!("Stored configuration for device {} from {}", name, source);
        true
    }

    /// Defensive copy of one device configuration.
    pub fn get(&self, name: &str) -> Option<DeviceConfig> {
        let table = self.lock()?;
        table.entries.get(name).map(|e| e.config.clone())
    }

    /// Source that owns the current entry for a device.
    pub fn get_source(&self, name: &str) -> Option<String> {
        let table = self.lock()?;
        table.entries.get(name).map(|e| e.source.clone())
    }

    /// Snapshot of the whole table.
    pub fn get_all(&self) -> HashMap<String, DeviceConfig> {
        let Some(table) = self.lock() else {
            return HashMap::new();
        };
        table
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.config.clone()))
            .collect()
    }

    /// Merge a partial update into an existing entry.
    ///
    /// Subject to the same source-priority rule as [`add`](Self::add);
    /// the merged entry is re-validated before being stored.
    pub fn update(&self, name: &str, patch: DeviceConfigPatch, source: &str) -> bool {
        let Some(mut table) = self.lock() else {
            return false;
        };

        let Some(entry) = table.entries.get(name) else {
            warn!("Cannot update unknown device configuration: {}", name);
            return false;
        };

        if source_priority(&entry.source) > source_priority(source) {
            info!(
                "Not updating configuration for {} from {} (current source {} has higher priority)",
                name, source, entry.source
            );
            return false;
        }

        let mut merged = entry.config.clone();
        patch.apply_to(&mut merged);

        if let Err(e) = merged.validate() {
            error!("Rejecting configuration update for {}: {}", name, e);
            return false;
        }

        table.entries.insert(
            name.to_string(),
            ConfigEntry {
                config: merged,
                source: source.to_string(),
            },
        );
        info!("Updated configuration for device {} from {}", name, source);
        true
    }

    pub fn remove(&self, name: &str) -> bool {
        let Some(mut table) = self.lock() else {
            return false;
        };
        if table.entries.remove(name).is_some() {
            info!("Removed configuration for device {}", name);
            true
        } else {
            warn!("Device {} not found in configurations", name);
            false
        }
    }

    /// Drop all entries.
    pub fn clear(&self) {
        if let Some(mut table) = self.lock() {
            table.entries.clear();
        }
    }

    /// Load a JSON array of device entries from `path`.
    ///
    /// Entries previously loaded from this exact path are purged first so
    /// that re-loading an edited file behaves as a hot reload. Per-entry
    /// failures are logged and skipped. Returns the names that loaded.
    pub fn load_from_file(&self, path: &Path) -> Vec<String> {
        let source = path.to_string_lossy().to_string();

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                error!("Cannot read configuration file {}: {}", source, e);
                return Vec::new();
            }
        };

        let configs: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(serde_json::Value::Array(items)) => items,
            Ok(_) => {
                error!("Invalid configuration format in {}, expected an array", source);
                return Vec::new();
            }
            Err(e) => {
                error!("Cannot parse configuration file {}: {}", source, e);
                return Vec::new();
            }
        };

        let Some(mut table) = self.lock() else {
            return Vec::new();
        };

        // Hot-reload semantics: entries this file no longer declares must
        // not survive a reload.
        table.entries.retain(|_, entry| entry.source != source);

        let mut loaded = Vec::new();
        for value in configs {
            let config: DeviceConfig = match serde_json::from_value(value) {
                Ok(config) => config,
                Err(e) => {
                    error!("Skipping invalid entry in {}: {}", source, e);
                    continue;
                }
            };

            let name = config.device_name.clone();
            if name.is_empty() {
                error!("Skipping entry with empty device_name in {}", source);
                continue;
            }

            if Self::add_locked(&mut table, &name, config, &source) {
                loaded.push(name);
            }
        }

        info!("Loaded {} device configuration(s) from {}", loaded.len(), source);
        loaded
    }

    /// Write the table (optionally filtered by source) as a JSON array.
    pub fn save_to_file(&self, path: &Path, filter_source: Option<&str>) -> bool {
        let configs: Vec<DeviceConfig> = {
            let Some(table) = self.lock() else {
                return false;
            };
            let mut entries: Vec<_> = table
                .entries
                .values()
                .filter(|e| filter_source.is_none_or(|s| e.source == s))
                .map(|e| e.config.clone())
                .collect();
            entries.sort_by(|a, b| a.device_name.cmp(&b.device_name));
            entries
        };

        let json = match serde_json::to_string_pretty(&configs) {
            Ok(json) => json,
            Err(e) => {
                error!("Cannot serialize configurations: {}", e);
                return false;
            }
        };

        match std::fs::write(path, json) {
            Ok(()) => {
                info!("Saved {} configuration(s) to {}", configs.len(), path.display());
                true
            }
            Err(e) => {
                error!("Cannot write configuration file {}: {}", path.display(), e);
                false
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn test_video_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"fake video")
            .unwrap();
        path
    }

    fn sample_config(video_file: PathBuf) -> DeviceConfig {
        DeviceConfig {
            device_name: "Proj-A".to_string(),
            kind: DeviceKind::Dlna,
            hostname: "10.0.0.45".to_string(),
            action_url: "http://10.0.0.45:3500/ctrl".to_string(),
            video_file,
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn test_add_and_get_defensive_copy() {
        let dir = tempfile::tempdir().unwrap();
        let video = test_video_file(&dir, "a.mp4");
        let service = ConfigService::new();

        assert!(service.add("Proj-A", sample_config(video), "manual"));

        let mut copy = service.get("Proj-A").unwrap();
        copy.priority = 99;
        assert_eq!(service.get("Proj-A").unwrap().priority, 50);
    }

    #[test]
    fn test_add_rejects_missing_video_file() {
        let service = ConfigService::new();
        let config = sample_config(PathBuf::from("/nonexistent/video.mp4"));

        assert!(!service.add("Proj-A", config, "manual"));
        assert!(service.get("Proj-A").is_none());
        assert!(service.get_all().is_empty());
    }

    #[test]
    fn test_add_rejects_missing_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        let video = test_video_file(&dir, "a.mp4");
        let service = ConfigService::new();

        let mut config = sample_config(video);
        config.hostname = String::new();
        assert!(!service.add("Proj-A", config, "manual"));
    }

    #[test]
    fn test_source_priority_protects_file_entries() {
        let dir = tempfile::tempdir().unwrap();
        let video = test_video_file(&dir, "a.mp4");
        let service = ConfigService::new();

        assert!(service.add("Proj-A", sample_config(video.clone()), "/etc/devices.json"));

        let mut manual = sample_config(video.clone());
        manual.priority = 80;
        assert!(!service.add("Proj-A", manual, "manual"));
        assert_eq!(service.get("Proj-A").unwrap().priority, 50);

        // A file source may replace another file source.
        let mut other_file = sample_config(video);
        other_file.priority = 80;
        assert!(service.add("Proj-A", other_file, "/tmp/override.json"));
        assert_eq!(service.get("Proj-A").unwrap().priority, 80);
    }

    #[test]
    fn test_update_merges_partial() {
        let dir = tempfile::tempdir().unwrap();
        let video = test_video_file(&dir, "a.mp4");
        let service = ConfigService::new();
        service.add("Proj-A", sample_config(video), "manual");

        let patch = DeviceConfigPatch {
            priority: Some(70),
            loop_playback: Some(false),
            ..DeviceConfigPatch::default()
        };
        assert!(service.update("Proj-A", patch, "manual"));

        let config = service.get("Proj-A").unwrap();
        assert_eq!(config.priority, 70);
        assert!(!config.loop_playback);
        assert_eq!(config.hostname, "10.0.0.45");
    }

    #[test]
    fn test_update_unknown_device_fails() {
        let service = ConfigService::new();
        assert!(!service.update("ghost", DeviceConfigPatch::default(), "manual"));
    }

    #[test]
    fn test_load_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let video_a = test_video_file(&dir, "a.mp4");
        let video_b = test_video_file(&dir, "b.mp4");

        let config_path = dir.path().join("devices.json");
        let entries = serde_json::json!([
            {
                "device_name": "Proj-A",
                "type": "dlna",
                "hostname": "10.0.0.45",
                "action_url": "http://10.0.0.45:3500/ctrl",
                "video_file": video_a.to_string_lossy(),
                "priority": 60
            },
            {
                "device_name": "Wall-B",
                "type": "transcreen",
                "hostname": "10.0.0.46",
                "action_url": "http://10.0.0.46/play",
                "video_file": video_b.to_string_lossy(),
                "loop": false
            }
        ]);
        std::fs::write(&config_path, entries.to_string()).unwrap();

        let service = ConfigService::new();
        let mut loaded = service.load_from_file(&config_path);
        loaded.sort();
        assert_eq!(loaded, vec!["Proj-A".to_string(), "Wall-B".to_string()]);

        let saved_path = dir.path().join("saved.json");
        assert!(service.save_to_file(&saved_path, None));

        let reloaded = ConfigService::new();
        let mut names = reloaded.load_from_file(&saved_path);
        names.sort();
        assert_eq!(names, vec!["Proj-A".to_string(), "Wall-B".to_string()]);
        assert_eq!(reloaded.get("Proj-A").unwrap().priority, 60);
        assert!(!reloaded.get("Wall-B").unwrap().loop_playback);
    }

    #[test]
    fn test_hot_reload_purges_removed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let video_a = test_video_file(&dir, "a.mp4");
        let video_b = test_video_file(&dir, "b.mp4");
        let config_path = dir.path().join("devices.json");

        let write_entries = |names: &[(&str, &PathBuf)]| {
            let entries: Vec<_> = names
                .iter()
                .map(|(name, video)| {
                    serde_json::json!({
                        "device_name": name,
                        "type": "dlna",
                        "hostname": "10.0.0.45",
                        "action_url": "http://10.0.0.45:3500/ctrl",
                        "video_file": video.to_string_lossy(),
                    })
                })
                .collect();
            std::fs::write(&config_path, serde_json::Value::Array(entries).to_string()).unwrap();
        };

        let service = ConfigService::new();
        write_entries(&[("Proj-A", &video_a), ("Wall-B", &video_b)]);
        assert_eq!(service.load_from_file(&config_path).len(), 2);

        // Wall-B removed from the file, Proj-C added.
        write_entries(&[("Proj-A", &video_a), ("Proj-C", &video_b)]);
        assert_eq!(service.load_from_file(&config_path).len(), 2);

        let all = service.get_all();
        assert!(all.contains_key("Proj-A"));
        assert!(all.contains_key("Proj-C"));
        assert!(!all.contains_key("Wall-B"));
    }

    #[test]
    fn test_load_skips_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        let video = test_video_file(&dir, "a.mp4");
        let config_path = dir.path().join("devices.json");

        let entries = serde_json::json!([
            {
                "device_name": "Proj-A",
                "type": "dlna",
                "hostname": "10.0.0.45",
                "action_url": "http://10.0.0.45:3500/ctrl",
                "video_file": video.to_string_lossy(),
            },
            { "device_name": "broken" },
            {
                "device_name": "NoFile",
                "type": "dlna",
                "hostname": "10.0.0.46",
                "action_url": "http://10.0.0.46:3500/ctrl",
                "video_file": "/missing/video.mp4",
            }
        ]);
        std::fs::write(&config_path, entries.to_string()).unwrap();

        let service = ConfigService::new();
        assert_eq!(service.load_from_file(&config_path), vec!["Proj-A".to_string()]);
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let video = test_video_file(&dir, "a.mp4");
        let service = ConfigService::new();
        service.add("Proj-A", sample_config(video), "manual");

        service.clear();
        assert!(service.get_all().is_empty());
    }
}
