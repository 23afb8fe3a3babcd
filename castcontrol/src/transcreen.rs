//! Transcreen renderer backend.
//!
//! Transcreen devices expose a small JSON-over-HTTP API instead of
//! UPnP: `POST /play {url, loop}`, `POST /stop`, `POST /pause`,
//! `POST /seek {position}` on port 80 of the device.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};
use ureq::Agent;

const TRANSCREEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TranscreenClient {
    pub hostname: String,
}

impl TranscreenClient {
    pub fn new(hostname: String) -> Self {
        Self { hostname }
    }

    fn agent() -> Agent {
        Agent::config_builder()
            .timeout_global(Some(TRANSCREEN_TIMEOUT))
            .build()
            .into()
    }

    fn endpoint(&self, action: &str) -> String {
        format!("http://{}/{}", self.hostname, action)
    }

    fn post(&self, action: &str, payload: Option<serde_json::Value>) -> Result<()> {
        let url = self.endpoint(action);
        debug!("Transcreen {} -> {}", action, url);

        let response = match payload {
            Some(body) => Self::agent().post(&url).send_json(&body),
            None => Self::agent().post(&url).send_empty(),
        }
        .with_context(|| format!("Transcreen {} request to {} failed", action, url))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Transcreen {} returned HTTP status {}",
                action,
                response.status()
            ));
        }
        Ok(())
    }

    /// Start playback of `video_url`; Transcreen loops natively.
    pub fn play(&self, video_url: &str, loop_playback: bool) -> Result<()> {
        info!("Playing {} on Transcreen {}", video_url, self.hostname);
        self.post(
            "play",
            Some(serde_json::json!({ "url": video_url, "loop": loop_playback })),
        )
    }

    pub fn stop(&self) -> Result<()> {
        info!("Stopping playback on Transcreen {}", self.hostname);
        self.post("stop", None)
    }

    pub fn pause(&self) -> Result<()> {
        self.post("pause", None)
    }

    /// Seek to an "HH:MM:SS" position.
    pub fn seek(&self, position: &str) -> Result<()> {
        self.post("seek", Some(serde_json::json!({ "position": position })))
    }
}
