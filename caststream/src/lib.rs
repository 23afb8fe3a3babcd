//! # caststream - per-renderer HTTP streaming
//!
//! Serves local video files to DLNA renderers over dedicated HTTP
//! servers (one port per stream start, probed in 9000-9100) and tracks
//! every serving relationship as a [`StreamingSession`]. A monitoring
//! task detects stalled sessions and surfaces them through registered
//! health-check callbacks.

pub mod registry;
pub mod server;
pub mod session;

pub use registry::{SessionRegistry, StreamingStats};
pub use server::{StartedStream, StreamError, StreamingServerPool, normalize_file_name};
pub use session::{SessionStatus, StreamingSession};
