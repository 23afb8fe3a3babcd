//! Shared helpers for the castfleet workspace.

pub mod ip_utils;
pub mod retry;
pub mod time_utils;

pub use ip_utils::{guess_local_ip, serve_ip};
pub use retry::retry;
pub use time_utils::{format_secs_to_hms, parse_hms_to_secs};
