//! HH:MM:SS helpers for UPnP time strings.

/// Parse "HH:MM:SS" style time strings to seconds.
///
/// Returns None for empty or sentinel values such as "NOT_IMPLEMENTED",
/// "UNKNOWN" or "-:--:--", which UPnP renderers use for "no information".
pub fn parse_hms_to_secs(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if s == "NOT_IMPLEMENTED" || s == "UNKNOWN" || s == "-:--:--" {
        return None;
    }

    let parts: Vec<_> = s.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: u64 = parts[0].parse().ok()?;
    let minutes: u64 = parts[1].parse().ok()?;
    // Some renderers report fractional seconds ("00:01:30.500").
    let seconds: u64 = parts[2]
        .split('.')
        .next()
        .and_then(|p| p.parse().ok())?;

    Some(hours * 3600 + minutes * 60 + seconds)
}

/// Format a second count as "HH:MM:SS", the REL_TIME encoding of Seek.
pub fn format_secs_to_hms(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
