//! HTTP surface: status, evidence listing, snapshots and the MJPEG stream.
//!
//! Plain `TcpListener` with a non-blocking accept loop on one thread. Ordinary
//! requests are answered inline; each `/video_feed` connection gets its own
//! thread holding one broadcaster subscription.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::broadcast::{FrameBroadcaster, Received};
use crate::encode::stream_content_type;
use crate::evidence::{EvidenceRecord, EvidenceStore};
use crate::status::StatusQuery;

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 500;
const DEFAULT_ANALYTICS_DAYS: i64 = 30;
const MAX_ANALYTICS_DAYS: i64 = 3650;
const STREAM_POLL: Duration = Duration::from_millis(250);
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub snapshot_root: PathBuf,
    /// Prefix for `snapshot_url` fields, without a trailing slash.
    pub public_base_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            snapshot_root: PathBuf::from("snapshots"),
            public_base_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

/// Shared handles the API reads from.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn EvidenceStore>,
    pub status: Arc<StatusQuery>,
    /// `None` when the pipeline failed to start.
    pub broadcaster: Option<Arc<FrameBroadcaster>>,
}

impl ApiState {
    fn pipeline_running(&self) -> bool {
        self.broadcaster
            .as_ref()
            .map(|b| !b.is_closed())
            .unwrap_or(false)
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: ApiState) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let state = self.state;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, state, shutdown_thread) {
                log::error!("api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    state: ApiState,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut streams: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        streams.retain(|s| !s.is_finished());
        match listener.accept() {
            Ok((stream, _)) => {
                match handle_connection(stream, &cfg, &state, &shutdown) {
                    Ok(Some(handle)) => streams.push(handle),
                    Ok(None) => {}
                    Err(err) => log::warn!("api request rejected: {}", err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for stream in streams {
        let _ = stream.join();
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    state: &ApiState,
    shutdown: &Arc<AtomicBool>,
) -> Result<Option<JoinHandle<()>>> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(None);
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(None);
    }

    match request.path.as_str() {
        "/health" => {
            let pipeline = if state.pipeline_running() {
                "running"
            } else {
                "unavailable"
            };
            let body = serde_json::json!({ "status": "ok", "pipeline": pipeline });
            write_serialized(&mut stream, 200, &body)?;
        }
        "/status" => {
            let report = state.status.latest_status(Utc::now());
            write_serialized(&mut stream, 200, &report)?;
        }
        "/api/latest_status" => {
            let report = state.status.latest_status(Utc::now());
            let body = serde_json::json!({
                "status_level": report.level,
                "message": report.message,
                "confidence": report.confidence,
            });
            write_serialized(&mut stream, 200, &body)?;
        }
        "/events" => {
            let limit = match request.query_number("limit", DEFAULT_EVENT_LIMIT as i64) {
                Some(limit) if limit > 0 => (limit as usize).min(MAX_EVENT_LIMIT),
                _ => {
                    write_json_response(&mut stream, 400, r#"{"error":"invalid_limit"}"#)?;
                    return Ok(None);
                }
            };
            match state.store.list_recent(limit) {
                Ok(records) => {
                    let body: Vec<EventView<'_>> = records
                        .iter()
                        .map(|r| EventView::new(r, &cfg.public_base_url))
                        .collect();
                    write_serialized(&mut stream, 200, &body)?;
                }
                Err(err) => {
                    log::warn!("event listing failed: {:#}", err);
                    write_json_response(&mut stream, 500, r#"{"error":"store_unavailable"}"#)?;
                }
            }
        }
        "/analytics" => {
            let days = match request.query_number("days", DEFAULT_ANALYTICS_DAYS) {
                Some(days) if days > 0 => days.min(MAX_ANALYTICS_DAYS),
                _ => {
                    write_json_response(&mut stream, 400, r#"{"error":"invalid_days"}"#)?;
                    return Ok(None);
                }
            };
            let since = Utc::now() - chrono::Duration::days(days);
            match state.store.daily_counts(since) {
                Ok(counts) => {
                    let body = serde_json::json!({ "days": days, "counts": counts });
                    write_serialized(&mut stream, 200, &body)?;
                }
                Err(err) => {
                    log::warn!("analytics query failed: {:#}", err);
                    write_json_response(&mut stream, 500, r#"{"error":"store_unavailable"}"#)?;
                }
            }
        }
        "/video_feed" => {
            let Some(broadcaster) = state.broadcaster.as_ref().filter(|b| !b.is_closed()) else {
                write_json_response(&mut stream, 503, r#"{"error":"stream_unavailable"}"#)?;
                return Ok(None);
            };
            let broadcaster = Arc::clone(broadcaster);
            let shutdown = Arc::clone(shutdown);
            let handle = std::thread::Builder::new()
                .name(format!("watchpost-stream-{}", peer))
                .spawn(move || {
                    if let Err(err) = serve_stream(stream, &broadcaster, &shutdown) {
                        log::debug!("stream to {} ended: {}", peer, err);
                    }
                })?;
            return Ok(Some(handle));
        }
        path => match path.strip_prefix("/snapshots/") {
            Some(name) => serve_snapshot(&mut stream, &cfg.snapshot_root, name)?,
            None => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?,
        },
    }
    Ok(None)
}

#[derive(Serialize)]
struct EventView<'a> {
    #[serde(flatten)]
    record: &'a EvidenceRecord,
    snapshot_url: String,
}

impl<'a> EventView<'a> {
    fn new(record: &'a EvidenceRecord, base: &str) -> Self {
        Self {
            record,
            snapshot_url: format!("{}/snapshots/{}", base, record.snapshot_path),
        }
    }
}

fn serve_snapshot(stream: &mut TcpStream, root: &std::path::Path, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return write_json_response(stream, 400, r#"{"error":"invalid_snapshot_name"}"#);
    }
    match std::fs::read(root.join(name)) {
        Ok(bytes) => write_response(stream, 200, "image/jpeg", &bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            write_json_response(stream, 404, r#"{"error":"not_found"}"#)
        }
        Err(err) => {
            log::warn!("snapshot {} unreadable: {}", name, err);
            write_json_response(stream, 500, r#"{"error":"snapshot_unreadable"}"#)
        }
    }
}

fn serve_stream(
    mut stream: TcpStream,
    broadcaster: &Arc<FrameBroadcaster>,
    shutdown: &AtomicBool,
) -> Result<()> {
    let subscription = broadcaster.subscribe();
    stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        stream_content_type()
    );
    stream.write_all(header.as_bytes())?;
    while !shutdown.load(Ordering::SeqCst) {
        match subscription.recv_timeout(STREAM_POLL) {
            Received::Frame(frame) => {
                stream.write_all(&frame.multipart_chunk())?;
                stream.flush()?;
            }
            Received::Timeout => continue,
            Received::Closed => break,
        }
    }
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(k.to_string(), v.to_string());
    }
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        params,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_serialized<T: Serialize>(stream: &mut TcpStream, status: u16, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    params: HashMap<String, String>,
}

impl HttpRequest {
    /// `Some(default)` when absent, `None` when present but not an integer.
    fn query_number(&self, key: &str, default: i64) -> Option<i64> {
        match self.params.get(key) {
            Some(raw) => raw.parse().ok(),
            None => Some(default),
        }
    }
}
