//! HTTP/1.0 streaming server.
//!
//! One dedicated thread runs a current-thread reactor that accepts
//! connections on a TCP, UNIX-domain, or systemd-provided socket and serves
//! `/`, `/state`, `/snapshot` and the `multipart/x-mixed-replace` `/stream`.
//! A periodic refresh task pulls the pipeline's latest frame into the
//! exposed slot and fans the tick out to the per-client tasks.

pub mod client;
pub mod exposed;

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock;
use crate::encoder::Encoder;
use crate::stream::{blank, StreamOutput};

use client::{ClientRegistry, StreamOptions};
use exposed::{Refresh, Refresher};

const BOUNDARY: &str = "boundarydonotcross";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REQUEST_HEAD: usize = 8 * 1024;
const SD_LISTEN_FDS_START: i32 = 3;

const INDEX_PAGE: &str = "<!DOCTYPE html>\
<html>\
<head><title>vstream</title></head>\
<body>\
<h3>vstream</h3>\
<ul>\
<li><a href=\"/state\">/state</a> &mdash; stream state in JSON</li>\
<li><a href=\"/snapshot\">/snapshot</a> &mdash; current frame</li>\
<li><a href=\"/stream\">/stream</a> &mdash; live MJPEG stream</li>\
</ul>\
</body>\
</html>";

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("can't bind http server: {0}")]
    Bind(io::Error),

    #[error("http i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub unix_path: Option<PathBuf>,
    pub unix_rm: bool,
    pub unix_mode: Option<u32>,
    pub systemd: bool,
    pub user: Option<String>,
    pub passwd: String,
    pub static_path: Option<PathBuf>,
    pub drop_same_frames: u32,
    pub last_as_blank: i64,
    pub blank_path: Option<PathBuf>,
    pub desired_fps: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            unix_path: None,
            unix_rm: false,
            unix_mode: None,
            systemd: false,
            user: None,
            passwd: String::new(),
            static_path: None,
            drop_same_frames: 0,
            last_as_blank: -1,
            blank_path: None,
            desired_fps: 30,
        }
    }
}

/// Reporting hooks for the optional H.264 sink stream.
pub struct H264Info {
    pub bitrate_kbps: u32,
    pub gop: u32,
    pub online: Arc<AtomicBool>,
}

enum BoundListener {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

struct ServerState {
    output: Arc<StreamOutput>,
    encoder: Arc<Encoder>,
    refresher: Refresher,
    clients: ClientRegistry,
    auth_token: Option<String>,
    refresh_tx: broadcast::Sender<Refresh>,
    static_path: Option<PathBuf>,
    desired_fps: u32,
    drop_same_frames: u32,
    h264: Option<H264Info>,
}

pub struct Server {
    listener: BoundListener,
    state: Arc<ServerState>,
}

impl Server {
    /// Binds the listening socket and prepares all shared state.
    pub fn bind(
        config: &ServerConfig,
        output: Arc<StreamOutput>,
        encoder: Arc<Encoder>,
        h264: Option<H264Info>,
    ) -> Result<Self, ServerError> {
        let listener = Self::bind_listener(config)?;

        let auth_token = config.user.as_ref().map(|user| {
            info!("using HTTP basic auth");
            format!(
                "Basic {}",
                BASE64.encode(format!("{user}:{}", config.passwd))
            )
        });

        let blank_frame = blank::load(config.blank_path.as_deref());
        let refresher = Refresher::new(
            Arc::clone(&output),
            blank_frame,
            config.drop_same_frames,
            config.last_as_blank,
        );

        let (refresh_tx, _) = broadcast::channel(32);

        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                output,
                encoder,
                refresher,
                clients: ClientRegistry::new(),
                auth_token,
                refresh_tx,
                static_path: config.static_path.clone(),
                desired_fps: config.desired_fps,
                drop_same_frames: config.drop_same_frames,
                h264,
            }),
        })
    }

    fn bind_listener(config: &ServerConfig) -> Result<BoundListener, ServerError> {
        if config.systemd {
            if std::env::var("LISTEN_FDS").map(|v| v.parse::<u32>().unwrap_or(0)) == Ok(1) {
                info!("using the systemd-provided socket");
                let listener =
                    unsafe { std::net::TcpListener::from_raw_fd(SD_LISTEN_FDS_START) };
                listener.set_nonblocking(true).map_err(ServerError::Bind)?;
                return Ok(BoundListener::Tcp(listener));
            }
            warn!("systemd socket requested but LISTEN_FDS is not set");
        }

        if let Some(path) = &config.unix_path {
            debug!(path = %path.display(), "binding HTTP to UNIX socket");
            if config.unix_rm {
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(ServerError::Bind(err)),
                }
            }
            let listener =
                std::os::unix::net::UnixListener::bind(path).map_err(ServerError::Bind)?;
            if let Some(mode) = config.unix_mode {
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                    .map_err(ServerError::Bind)?;
            }
            listener.set_nonblocking(true).map_err(ServerError::Bind)?;
            info!(path = %path.display(), "listening HTTP on UNIX socket");
            return Ok(BoundListener::Unix(listener));
        }

        let addr = format!("{}:{}", config.host, config.port);
        debug!(addr = %addr, "binding HTTP");
        let listener = std::net::TcpListener::bind(&addr).map_err(ServerError::Bind)?;
        listener.set_nonblocking(true).map_err(ServerError::Bind)?;
        info!(addr = %listener.local_addr().map_err(ServerError::Bind)?, "listening HTTP");
        Ok(BoundListener::Tcp(listener))
    }

    /// The TCP address actually bound, for tests and logs.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.listener {
            BoundListener::Tcp(listener) => listener.local_addr().ok(),
            BoundListener::Unix(_) => None,
        }
    }

    /// Runs the reactor until `stop` is raised.
    pub fn run(self, stop: Arc<AtomicBool>) -> Result<(), ServerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.serve(stop));
        Ok(())
    }

    async fn serve(self, stop: Arc<AtomicBool>) {
        let state = Arc::clone(&self.state);

        // The exposure refresh tick, about twice the target frame rate.
        let refresh_us = if state.desired_fps > 0 {
            1_000_000 / (state.desired_fps as u64 * 2)
        } else {
            16_000
        };
        let refresh_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_micros(refresh_us.max(1_000)));
            loop {
                tick.tick().await;
                let refresh = refresh_state.refresher.refresh();
                if refresh.frame_updated && refresh_state.clients.count() > 0 {
                    refresh_state.refresher.bump_queued();
                }
                // Nobody listening is fine.
                let _ = refresh_state.refresh_tx.send(refresh);
            }
        });

        let mut stop_tick = tokio::time::interval(Duration::from_millis(100));
        info!("starting HTTP eventloop");
        match self.listener {
            BoundListener::Tcp(listener) => {
                let listener = tokio::net::TcpListener::from_std(listener)
                    .expect("listener was set nonblocking at bind");
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((socket, peer)) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(async move {
                                    handle_connection(state, socket, peer.to_string()).await;
                                });
                            }
                            Err(err) => warn!(error = %err, "accept failed"),
                        },
                        _ = stop_tick.tick() => {
                            if stop.load(Ordering::SeqCst) {
                                break;
                            }
                        }
                    }
                }
            }
            BoundListener::Unix(listener) => {
                let listener = tokio::net::UnixListener::from_std(listener)
                    .expect("listener was set nonblocking at bind");
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((socket, _)) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(async move {
                                    handle_connection(state, socket, "unix".to_string()).await;
                                });
                            }
                            Err(err) => warn!(error = %err, "accept failed"),
                        },
                        _ = stop_tick.tick() => {
                            if stop.load(Ordering::SeqCst) {
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!("HTTP eventloop stopped");
    }
}

struct Request {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    headers: HashMap<String, String>,
}

async fn read_request<S: AsyncRead + Unpin>(socket: &mut S) -> Option<Request> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(REQUEST_TIMEOUT, socket.read(&mut buf))
            .await
            .ok()?
            .ok()?;
        if n == 0 {
            return None;
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_REQUEST_HEAD {
            return None;
        }
    }

    let head = String::from_utf8_lossy(&head);
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?;

    let (path, query_str) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Some(Request {
        method,
        path: percent_decode(path),
        query: parse_query(query_str),
        headers,
    })
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn query_get<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn query_true(query: &[(String, String)], key: &str) -> bool {
    matches!(
        query_get(query, key).map(|v| v.to_ascii_lowercase()),
        Some(ref v) if v == "1" || v == "true" || v == "yes"
    )
}

const NO_CACHE_HEADERS: &str = "Access-Control-Allow-Origin: *\r\n\
Cache-Control: no-store, no-cache, must-revalidate, proxy-revalidate, pre-check=0, post-check=0, max-age=0\r\n\
Pragma: no-cache\r\n\
Expires: Mon, 3 Jan 2000 12:34:56 GMT\r\n";

async fn handle_connection<S>(state: Arc<ServerState>, mut socket: S, peer: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let request = match read_request(&mut socket).await {
        Some(request) => request,
        None => return,
    };
    debug!(peer = %peer, method = %request.method, path = %request.path, "request");

    if let Some(token) = &state.auth_token {
        if request.headers.get("authorization") != Some(token) {
            let _ = socket
                .write_all(
                    b"HTTP/1.0 401 Unauthorized\r\n\
                      WWW-Authenticate: Basic realm=\"Restricted area\"\r\n\
                      Content-Length: 0\r\n\r\n",
                )
                .await;
            return;
        }
    }

    if request.method == "HEAD" {
        let _ = socket.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await;
        return;
    }
    if request.method != "GET" {
        let _ = socket
            .write_all(b"HTTP/1.0 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n")
            .await;
        return;
    }

    match request.path.as_str() {
        "/state" => serve_state(&state, &mut socket).await,
        "/snapshot" => serve_snapshot(&state, &mut socket).await,
        "/stream" => serve_stream(state, socket, request, peer).await,
        path => {
            if let Some(root) = state.static_path.clone() {
                serve_static(&root, path, &mut socket).await;
            } else if path == "/" {
                serve_index(&mut socket).await;
            } else {
                let _ = socket
                    .write_all(b"HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        }
    }
}

async fn serve_index<S: AsyncWrite + Unpin>(socket: &mut S) {
    let response = format!(
        "HTTP/1.0 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
        INDEX_PAGE.len(),
        INDEX_PAGE
    );
    let _ = socket.write_all(response.as_bytes()).await;
}

async fn serve_static<S: AsyncWrite + Unpin>(root: &Path, path: &str, socket: &mut S) {
    let rel = path.trim_start_matches('/');
    let rel = if rel.is_empty() { "index.html" } else { rel };
    if rel.split('/').any(|part| part == "..") {
        let _ = socket
            .write_all(b"HTTP/1.0 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
            .await;
        return;
    }
    let full = root.join(rel);
    match tokio::fs::read(&full).await {
        Ok(body) => {
            let header = format!(
                "HTTP/1.0 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
                guess_mime(&full),
                body.len()
            );
            if socket.write_all(header.as_bytes()).await.is_ok() {
                let _ = socket.write_all(&body).await;
            }
        }
        Err(_) => {
            let _ = socket
                .write_all(b"HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
        }
    }
}

fn guess_mime(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

async fn serve_state<S: AsyncWrite + Unpin>(state: &ServerState, socket: &mut S) {
    let (width, height, online, captured_fps, queued_fps) = {
        let exposed = state.refresher.lock();
        (
            exposed.frame.width,
            exposed.frame.height,
            exposed.online,
            exposed.captured_fps,
            exposed.queued_fps,
        )
    };

    let mut result = serde_json::json!({
        "encoder": {
            "type": state.encoder.active_type().name(),
            "quality": state.encoder.quality(),
        },
        "source": {
            "resolution": {"width": width, "height": height},
            "online": online,
            "desired_fps": state.desired_fps,
            "captured_fps": captured_fps,
        },
        "stream": {
            "queued_fps": queued_fps,
            "clients": state.clients.count(),
            "clients_stat": state.clients.stat_entries(),
        },
    });
    if let Some(h264) = &state.h264 {
        result["h264"] = serde_json::json!({
            "bitrate_kbps": h264.bitrate_kbps,
            "gop": h264.gop,
            "online": h264.online.load(Ordering::SeqCst),
        });
    }
    let body = serde_json::json!({"ok": true, "result": result}).to_string();

    let response = format!(
        "HTTP/1.0 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
}

fn exposed_meta_headers(exposed: &exposed::Exposed, client_fps: Option<u32>) -> String {
    let mut headers = String::with_capacity(512);
    headers.push_str(&format!(
        "X-UStreamer-Online: {}\r\n\
         X-UStreamer-Dropped: {}\r\n\
         X-UStreamer-Width: {}\r\n\
         X-UStreamer-Height: {}\r\n",
        exposed.online, exposed.dropped, exposed.frame.width, exposed.frame.height
    ));
    if let Some(fps) = client_fps {
        headers.push_str(&format!("X-UStreamer-Client-FPS: {fps}\r\n"));
    }
    headers.push_str(&format!(
        "X-UStreamer-Grab-Time: {:.6}\r\n\
         X-UStreamer-Encode-Begin-Time: {:.6}\r\n\
         X-UStreamer-Encode-End-Time: {:.6}\r\n\
         X-UStreamer-Expose-Begin-Time: {:.6}\r\n\
         X-UStreamer-Expose-Cmp-Time: {:.6}\r\n\
         X-UStreamer-Expose-End-Time: {:.6}\r\n\
         X-UStreamer-Send-Time: {:.6}\r\n",
        exposed.frame.grab_ts,
        exposed.frame.encode_begin_ts,
        exposed.frame.encode_end_ts,
        exposed.expose_begin_ts,
        exposed.expose_cmp_ts,
        exposed.expose_end_ts,
        clock::now_monotonic(),
    ));
    headers
}

async fn serve_snapshot<S: AsyncWrite + Unpin>(state: &ServerState, socket: &mut S) {
    let (body, meta) = {
        let exposed = state.refresher.lock();
        (
            Bytes::copy_from_slice(exposed.frame.data()),
            exposed_meta_headers(&exposed, None),
        )
    };

    let header = format!(
        "HTTP/1.0 200 OK\r\n\
         {NO_CACHE_HEADERS}\
         X-Timestamp: {:.6}\r\n\
         {meta}\
         Content-Type: image/jpeg\r\n\
         Content-Length: {}\r\n\r\n",
        clock::now_real(),
        body.len(),
    );
    if socket.write_all(header.as_bytes()).await.is_ok() {
        let _ = socket.write_all(&body).await;
    }
}

fn advance_headers_block() -> String {
    format!(
        "Content-Type: image/jpeg\r\nX-Timestamp: {:.6}\r\n\r\n",
        clock::now_real()
    )
}

/// Builds one multipart part from the currently exposed frame.
fn build_part(state: &ServerState, options: &StreamOptions, client_fps: u32) -> Bytes {
    let exposed = state.refresher.lock();
    let mut part = String::with_capacity(512);

    if !options.advance_headers {
        part.push_str(&format!(
            "Content-Type: image/jpeg\r\nContent-Length: {}\r\nX-Timestamp: {:.6}\r\n",
            exposed.frame.used(),
            clock::now_real(),
        ));
        if options.extra_headers {
            part.push_str(&exposed_meta_headers(&exposed, Some(client_fps)));
        }
        part.push_str("\r\n");
    }

    let mut bytes = Vec::with_capacity(part.len() + exposed.frame.used() + 64);
    bytes.extend_from_slice(part.as_bytes());
    bytes.extend_from_slice(exposed.frame.data());
    bytes.extend_from_slice(format!("\r\n--{BOUNDARY}\r\n").as_bytes());
    drop(exposed);

    if options.advance_headers {
        // Chromium renders a frame only when the next part's headers arrive;
        // sending them right after the body forces the render out.
        bytes.extend_from_slice(advance_headers_block().as_bytes());
    }
    Bytes::from(bytes)
}

async fn serve_stream<S>(state: Arc<ServerState>, mut socket: S, request: Request, peer: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let options = StreamOptions {
        key: query_get(&request.query, "key").map(str::to_string),
        extra_headers: query_true(&request.query, "extra_headers"),
        advance_headers: query_true(&request.query, "advance_headers"),
        dual_final_frames: query_true(&request.query, "dual_final_frames"),
    };

    // Subscribe before the first write so no refresh tick is lost.
    let mut refresh_rx = state.refresh_tx.subscribe();

    let (id, stats) = state.clients.register(&options);
    let count = state.clients.count();
    if count == 1 {
        state.output.no_clients.store(false, Ordering::SeqCst);
    }
    info!(peer = %peer, id = %id, clients = count, "registered a new stream client");

    let mut initial = format!(
        "HTTP/1.0 200 OK\r\n\
         {NO_CACHE_HEADERS}\
         Set-Cookie: stream_client={}/{}; path=/; max-age=30\r\n\
         Content-Type: multipart/x-mixed-replace;boundary={BOUNDARY}\r\n\
         \r\n\
         --{BOUNDARY}\r\n",
        options.key.as_deref().unwrap_or("0"),
        id,
    );
    if options.advance_headers {
        initial.push_str(&advance_headers_block());
    }

    let mut need_first_frame = true;
    let mut updated_prev = false;

    let result: Result<(), io::Error> = async {
        socket.write_all(initial.as_bytes()).await?;
        let mut drain = [0u8; 256];

        loop {
            let refresh = tokio::select! {
                received = refresh_rx.recv() => match received {
                    Ok(refresh) => refresh,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                // Streams are write-only; any read activity means EOF or an
                // error and lets us drop the client without a pending write.
                read = socket.read(&mut drain) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                },
            };

            // WebKit renders the last frame of a drop-same-frames series
            // late; one duplicate finishes the series on time.
            let dual_update = state.drop_same_frames > 0
                && options.dual_final_frames
                && refresh.stream_updated
                && updated_prev
                && !refresh.frame_updated;

            if dual_update || refresh.frame_updated || need_first_frame {
                let part = build_part(&state, &options, stats.fps());
                socket.write_all(&part).await?;
                stats.bump();
                need_first_frame = false;
                updated_prev = refresh.frame_updated;
            } else if refresh.stream_updated {
                updated_prev = false;
            }
        }
        Ok(())
    }
    .await;

    if let Err(err) = result {
        debug!(id = %id, error = %err, "stream client write failed");
    }

    state.clients.unregister(&id);
    let count = state.clients.count();
    if count == 0 {
        state.output.no_clients.store(true, Ordering::SeqCst);
    }
    info!(peer = %peer, id = %id, clients = count, "disconnected the stream client");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let query = parse_query("key=abc&extra_headers=1&advance_headers=true&plain");
        assert_eq!(query_get(&query, "key"), Some("abc"));
        assert!(query_true(&query, "extra_headers"));
        assert!(query_true(&query, "advance_headers"));
        assert!(!query_true(&query, "dual_final_frames"));
        assert_eq!(query_get(&query, "plain"), Some(""));
    }

    #[test]
    fn test_query_true_values() {
        for value in ["1", "true", "yes", "TRUE", "Yes"] {
            let query = parse_query(&format!("x={value}"));
            assert!(query_true(&query, "x"), "{value} should be true");
        }
        for value in ["0", "false", "no", ""] {
            let query = parse_query(&format!("x={value}"));
            assert!(!query_true(&query, "x"), "{value} should be false");
        }
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zzoops"), "%zzoops");
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime(Path::new("index.html")), "text/html");
        assert_eq!(guess_mime(Path::new("a.jpg")), "image/jpeg");
        assert_eq!(guess_mime(Path::new("weird.bin")), "application/octet-stream");
    }
}
