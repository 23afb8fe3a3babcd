//! Per-port HTTP servers serving video files with DLNA headers.
//!
//! Every stream start gets its own server on a port probed in the
//! 9000-9100 range; a pool keeps the most recent five alive and stops
//! the rest to avoid port exhaustion. Renderers are erratic HTTP
//! clients: many issue their second request against the bare filename,
//! or change the path casing, so the route table answers the exact
//! path, the basename alone and case-insensitive variants.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::net::TcpListener as StdTcpListener;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::SessionRegistry;

/// Port range reserved for the streaming subsystem.
const PORT_RANGE_START: u16 = 9000;
const PORT_RANGE_END: u16 = 9100;

/// Servers kept alive by `cleanup_old_servers`.
const KEEP_LAST_SERVERS: usize = 5;

/// Stable URL tag under which video files are exposed.
pub const VIDEO_FILE_KEY: &str = "file_video";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no bindable port in range {0}-{1}")]
    PortExhausted(u16, u16),

    #[error("no files to serve")]
    NoFiles,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// ASCII slug for a served filename.
///
/// Lowercases, drops non-ASCII, collapses whitespace and dash runs to a
/// single dash and keeps only word characters, dots and dashes.
pub fn normalize_file_name(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;

    for c in value.chars() {
        if !c.is_ascii() {
            continue;
        }
        let c = c.to_ascii_lowercase();
        if c.is_whitespace() || c == '-' {
            pending_dash = true;
        } else if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        }
    }

    slug.trim_matches(|c| c == '-' || c == '_').to_string()
}

/// URL path -> file mapping with basename and case-insensitive fallbacks.
#[derive(Debug, Default, Clone)]
struct RouteTable {
    exact: HashMap<String, PathBuf>,
    lower: HashMap<String, PathBuf>,
}

impl RouteTable {
    fn add_file(&mut self, file_key: &str, file_path: &Path) -> String {
        let name = normalize_file_name(
            &file_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        );
        let url_path = format!("/{}/{}", file_key, name);
        let basename_path = format!("/{}", name);

        for key in [&url_path, &basename_path] {
            self.exact.insert(key.clone(), file_path.to_path_buf());
            self.lower
                .insert(key.to_ascii_lowercase(), file_path.to_path_buf());
        }

        url_path
    }

    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        if let Some(path) = self.exact.get(request_path) {
            return Some(path.clone());
        }
        if let Some(path) = self.lower.get(&request_path.to_ascii_lowercase()) {
            return Some(path.clone());
        }
        // Renderers sometimes re-request by filename alone, under an
        // arbitrary prefix.
        let basename = request_path.rsplit('/').next()?;
        let fallback = format!("/{}", basename);
        self.exact
            .get(&fallback)
            .or_else(|| self.lower.get(&fallback.to_ascii_lowercase()))
            .cloned()
    }
}

struct ServerState {
    routes: RouteTable,
    registry: SessionRegistry,
    port: u16,
}

/// One running streaming server.
struct StreamingServer {
    port: u16,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl StreamingServer {
    fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!("Stopped streaming server on port {}", self.port);
    }
}

/// Result of a stream start: the renderer-facing URLs per file key.
#[derive(Debug, Clone)]
pub struct StartedStream {
    pub port: u16,
    pub serve_ip: String,
    /// file key -> full HTTP URL
    pub urls: HashMap<String, String>,
}

/// Pool of streaming servers, oldest-first.
pub struct StreamingServerPool {
    servers: Mutex<Vec<StreamingServer>>,
    registry: SessionRegistry,
}

impl StreamingServerPool {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            servers: Mutex::new(Vec::new()),
            registry,
        }
    }

    /// Start a server for `files` on the first bindable port in range.
    ///
    /// `files` maps stable file keys (e.g. [`VIDEO_FILE_KEY`]) to local
    /// paths. Old servers beyond the most recent five are stopped first.
    pub fn start_server(
        &self,
        files: &[(String, PathBuf)],
        serve_ip: &str,
    ) -> Result<StartedStream, StreamError> {
        if files.is_empty() {
            return Err(StreamError::NoFiles);
        }

        self.cleanup_old_servers(KEEP_LAST_SERVERS);

        let (listener, port) = probe_port(PORT_RANGE_START, PORT_RANGE_END)?;

        let mut routes = RouteTable::default();
        let mut urls = HashMap::new();
        for (file_key, file_path) in files {
            let url_path = routes.add_file(file_key, file_path);
            urls.insert(
                file_key.clone(),
                format!("http://{}:{}{}", serve_ip, port, url_path),
            );
        }

        let state = Arc::new(ServerState {
            routes,
            registry: self.registry.clone(),
            port,
        });
        let shutdown = CancellationToken::new();
        let handle = spawn_server_thread(listener, state, shutdown.clone())?;

        info!(
            "Streaming server started on {}:{} serving {} file(s)",
            serve_ip,
            port,
            files.len()
        );

        self.servers.lock().expect("server pool poisoned").push(StreamingServer {
            port,
            shutdown,
            handle: Some(handle),
        });

        Ok(StartedStream {
            port,
            serve_ip: serve_ip.to_string(),
            urls,
        })
    }

    /// Stop servers beyond the most recent `keep_last`.
    pub fn cleanup_old_servers(&self, keep_last: usize) {
        let mut doomed = Vec::new();
        {
            let mut servers = self.servers.lock().expect("server pool poisoned");
            while servers.len() > keep_last {
                doomed.push(servers.remove(0));
            }
        }
        for mut server in doomed {
            info!("Cleaning up old streaming server on port {}", server.port);
            server.stop();
        }
    }

    /// Number of currently running servers.
    pub fn server_count(&self) -> usize {
        self.servers.lock().expect("server pool poisoned").len()
    }

    /// Stop every server in the pool.
    pub fn stop_all(&self) {
        let mut servers = {
            let mut guard = self.servers.lock().expect("server pool poisoned");
            std::mem::take(&mut *guard)
        };
        for server in &mut servers {
            server.stop();
        }
    }
}

impl Drop for StreamingServerPool {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Find the first bindable port in `[start, end]`.
fn probe_port(start: u16, end: u16) -> Result<(StdTcpListener, u16), StreamError> {
    for port in start..=end {
        match StdTcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => {
                debug!("Bound streaming port {}", port);
                return Ok((listener, port));
            }
            Err(e) => {
                debug!("Port {} not available: {}", port, e);
            }
        }
    }
    Err(StreamError::PortExhausted(start, end))
}

/// Run one axum server on its own thread with a current-thread runtime.
fn spawn_server_thread(
    listener: StdTcpListener,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, StreamError> {
    listener.set_nonblocking(true)?;
    let port = state.port;

    let handle = thread::Builder::new()
        .name(format!("stream-{}", port))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("Cannot build runtime for streaming server {}: {}", port, e);
                    return;
                }
            };

            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::from_std(listener) {
                    Ok(l) => l,
                    Err(e) => {
                        error!("Cannot adopt listener for port {}: {}", port, e);
                        return;
                    }
                };

                let app = Router::new().fallback(serve_file).with_state(state);
                let serve = axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
                )
                .with_graceful_shutdown(async move { shutdown.cancelled().await });

                if let Err(e) = serve.await {
                    error!("Streaming server on port {} failed: {}", port, e);
                }
            });
        })?;

    Ok(handle)
}

async fn serve_file(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(client): ConnectInfo<std::net::SocketAddr>,
    request: Request,
) -> Response {
    let request_path = request.uri().path().to_string();
    let client_ip = client.ip().to_string();

    let Some(file_path) = state.routes.resolve(&request_path) else {
        error!(
            "No file mapped for {} (client {})",
            request_path, client_ip
        );
        return (StatusCode::NOT_FOUND, "File not found").into_response();
    };

    info!(
        "Streaming request from {} for {} ({})",
        client_ip,
        request_path,
        file_path.display()
    );

    let mut file = match tokio::fs::File::open(&file_path).await {
        Ok(file) => file,
        Err(e) => {
            error!("Cannot open {}: {}", file_path.display(), e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error streaming file").into_response();
        }
    };

    let total_len = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            error!("Cannot stat {}: {}", file_path.display(), e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error streaming file").into_response();
        }
    };

    let range = request
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_byte_range(v, total_len));

    let (status, start, length) = match range {
        Some((start, end)) => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
        None => (StatusCode::OK, 0, total_len),
    };

    if start > 0 {
        if let Err(e) = file.seek(SeekFrom::Start(start)).await {
            error!("Cannot seek {}: {}", file_path.display(), e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error streaming file").into_response();
        }
    }

    state
        .registry
        .record_connection_for(state.port, &file_path, true);

    let path_str = file_path.to_string_lossy().to_string();
    let stream = ActivityStream::new(
        ReaderStream::with_capacity(file.take(length), 64 * 1024),
        state.registry.clone(),
        state.port,
        file_path.clone(),
        client_ip,
    );

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, castdidl::mime_type_for(&path_str))
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, length)
        .header(
            "contentFeatures.dlna.org",
            castdidl::content_features_for(&path_str),
        )
        .header("transferMode.dlna.org", "Streaming");

    if status == StatusCode::PARTIAL_CONTENT {
        let content_range = format!("bytes {}-{}/{}", start, start + length - 1, total_len);
        response = response.header(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&content_range).expect("ascii header value"),
        );
    }

    response
        .body(Body::from_stream(stream))
        .expect("valid response")
}

/// Parse a single-range `Range: bytes=start-end` header.
///
/// Returns the inclusive (start, end) pair, clamped to the file size.
/// Multi-range and suffix forms are not supported and yield None (the
/// whole file is served with a 200 instead).
fn parse_byte_range(value: &str, total_len: u64) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;
    let start: u64 = start_str.trim().parse().ok()?;
    if start >= total_len {
        return None;
    }
    let end = match end_str.trim() {
        "" => total_len - 1,
        s => s.parse::<u64>().ok()?.min(total_len - 1),
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

/// File chunk stream that reports transfer activity to the registry.
struct ActivityStream {
    inner: ReaderStream<tokio::io::Take<tokio::fs::File>>,
    registry: SessionRegistry,
    port: u16,
    file_path: PathBuf,
    client_ip: String,
    finished: bool,
}

impl ActivityStream {
    fn new(
        inner: ReaderStream<tokio::io::Take<tokio::fs::File>>,
        registry: SessionRegistry,
        port: u16,
        file_path: PathBuf,
        client_ip: String,
    ) -> Self {
        Self {
            inner,
            registry,
            port,
            file_path,
            client_ip,
            finished: false,
        }
    }
}

impl Stream for ActivityStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.registry.record_transfer(
                    this.port,
                    &this.file_path,
                    &this.client_ip,
                    chunk.len() as u64,
                );
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                debug!(
                    "Finished streaming {} to {}",
                    this.file_path.display(),
                    this.client_ip
                );
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ActivityStream {
    fn drop(&mut self) {
        // A renderer hanging up mid-file shows up as a dropped body.
        if !self.finished {
            warn!(
                "Client {} disconnected while streaming {}",
                self.client_ip,
                self.file_path.display()
            );
            self.registry
                .record_connection_for(self.port, &self.file_path, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_file_name() {
        assert_eq!(normalize_file_name("My Video.mp4"), "my-video.mp4");
        assert_eq!(normalize_file_name("loop_a.mp4"), "loop_a.mp4");
        assert_eq!(normalize_file_name("Café Vidéo.mkv"), "caf-vido.mkv");
        assert_eq!(normalize_file_name("--spaced   out--.ts"), "spaced-out-.ts");
        assert_eq!(normalize_file_name("plain.mp4"), "plain.mp4");
    }

    #[test]
    fn test_route_table_exact_and_fallbacks() {
        let mut routes = RouteTable::default();
        let url_path = routes.add_file(VIDEO_FILE_KEY, Path::new("/v/My Loop.mp4"));
        assert_eq!(url_path, "/file_video/my-loop.mp4");

        // Exact path.
        assert_eq!(
            routes.resolve("/file_video/my-loop.mp4"),
            Some(PathBuf::from("/v/My Loop.mp4"))
        );
        // Basename-only second request.
        assert_eq!(
            routes.resolve("/my-loop.mp4"),
            Some(PathBuf::from("/v/My Loop.mp4"))
        );
        // Case-insensitive variant.
        assert_eq!(
            routes.resolve("/FILE_VIDEO/MY-LOOP.MP4"),
            Some(PathBuf::from("/v/My Loop.mp4"))
        );
        // Unknown prefix, known basename.
        assert_eq!(
            routes.resolve("/whatever/my-loop.mp4"),
            Some(PathBuf::from("/v/My Loop.mp4"))
        );
        // Unknown file.
        assert_eq!(routes.resolve("/file_video/other.mp4"), None);
    }

    #[test]
    fn test_parse_byte_range() {
        assert_eq!(parse_byte_range("bytes=0-499", 1000), Some((0, 499)));
        assert_eq!(parse_byte_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_byte_range("bytes=0-4999", 1000), Some((0, 999)));
        assert_eq!(parse_byte_range("bytes=1000-", 1000), None);
        assert_eq!(parse_byte_range("bytes=5-2", 1000), None);
        assert_eq!(parse_byte_range("bytes=0-100,200-300", 1000), None);
        assert_eq!(parse_byte_range("items=0-10", 1000), None);
    }

    #[test]
    fn test_probe_port_skips_taken_port() {
        // Occupy the first port of a private sub-range, the probe must
        // land on the next one.
        let taken = StdTcpListener::bind(("0.0.0.0", 0)).unwrap();
        let base = taken.local_addr().unwrap().port();

        if base < u16::MAX - 1 {
            match probe_port(base, base + 1) {
                Ok((_, port)) => assert_eq!(port, base + 1),
                // The neighbour port may be in use on a busy host; the
                // probe then reports exhaustion, which is also correct.
                Err(StreamError::PortExhausted(_, _)) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    }

    #[test]
    fn test_probe_port_exhaustion() {
        let taken = StdTcpListener::bind(("0.0.0.0", 0)).unwrap();
        let base = taken.local_addr().unwrap().port();

        match probe_port(base, base) {
            Err(StreamError::PortExhausted(start, end)) => {
                assert_eq!((start, end), (base, base));
            }
            Ok(_) => panic!("expected exhaustion"),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
