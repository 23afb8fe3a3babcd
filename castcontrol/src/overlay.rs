//! Best-effort notification to the overlay subsystem.

use std::time::Duration;

use tracing::{debug, warn};
use ureq::Agent;

const OVERLAY_SYNC_URL: &str = "http://localhost:8000/api/overlay/sync";
const OVERLAY_TIMEOUT: Duration = Duration::from_secs(2);

/// Tell the overlay service that auto-play started a video.
///
/// Fire-and-forget: failures are logged and never propagate, the overlay
/// service is optional.
pub fn notify_overlay_sync(video_name: &str) {
    let url = format!(
        "{}?triggered_by=dlna_auto_play&video_name={}",
        OVERLAY_SYNC_URL,
        percent_encode(video_name)
    );

    let agent: Agent = Agent::config_builder()
        .timeout_global(Some(OVERLAY_TIMEOUT))
        .build()
        .into();

    match agent.post(&url).send_empty() {
        Ok(response) => {
            debug!(
                "Overlay sync triggered for {} (HTTP {})",
                video_name,
                response.status()
            );
        }
        Err(e) => {
            warn!("Overlay sync for {} failed: {}", video_name, e);
        }
    }
}

/// Minimal percent-encoding for a query parameter value.
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("loop-a.mp4"), "loop-a.mp4");
        assert_eq!(percent_encode("my video.mp4"), "my%20video.mp4");
        assert_eq!(percent_encode("a&b"), "a%26b");
    }
}
