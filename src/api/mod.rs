//! HTTP surface of the road-condition service.
//!
//! A blocking `TcpListener` accept loop with one thread per connection.
//! Control routes answer with small JSON bodies; the two video feeds and the
//! event stream hold their connection open and write until the stream ends or
//! the viewer leaves.

mod upload;

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::annotate::FrameAnnotator;
use crate::config::RoadwatchConfig;
use crate::detect::SharedOracle;
use crate::events::{EventNotifier, EventQueue};
use crate::pipeline::{FramePipeline, PipelineOptions};
use crate::publish::{MultipartEncoder, PublishOutcome, StreamPublisher};
use crate::source::{SourceKind, SourceManager, SourceState};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub boundary: String,
    pub camera_jpeg_quality: u8,
    pub file_jpeg_quality: u8,
    pub max_blank_frames: u32,
    pub event_poll_interval: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from_config(&RoadwatchConfig::default())
    }
}

impl ApiConfig {
    pub fn from_config(cfg: &RoadwatchConfig) -> Self {
        Self {
            addr: cfg.api.addr.clone(),
            upload_dir: cfg.api.upload_dir.clone(),
            max_upload_bytes: cfg.api.max_upload_bytes,
            boundary: cfg.stream.boundary.clone(),
            camera_jpeg_quality: cfg.stream.camera_jpeg_quality,
            file_jpeg_quality: cfg.stream.file_jpeg_quality,
            max_blank_frames: cfg.stream.max_blank_frames,
            event_poll_interval: cfg.events.poll_interval,
        }
    }
}

/// Shared service state handed to every connection.
#[derive(Clone)]
pub struct ApiContext {
    pub manager: Arc<SourceManager>,
    pub oracle: SharedOracle,
    pub queue: Arc<EventQueue>,
    pub annotator: FrameAnnotator,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Streams already running finish on their
    /// own once their source stops.
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
    ctx: ApiContext,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, ctx: ApiContext) -> Self {
        Self { cfg, ctx }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api listener on {}", configured_addr))?;
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
        let cfg = Arc::new(self.cfg);
        let ctx = self.ctx;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, ctx, shutdown_thread) {
                log::error!("api: server stopped: {}", err);
            }
        });

        log::info!("api: listening on http://{}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: Arc<ApiConfig>,
    ctx: ApiContext,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let cfg = Arc::clone(&cfg);
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &cfg, &ctx) {
                        log::warn!("api: request from {} failed: {:#}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, cfg: &ApiConfig, ctx: &ApiContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({"error": "forbidden"}))?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, &json!({"error": "bad request"}))?;
            return Err(err);
        }
    };
    log::debug!("api: {} {}", request.method, request.raw_path);

    let Some(route) = Route::find(&request.path) else {
        write_json_response(&mut stream, 404, &json!({"error": "not found"}))?;
        return Ok(());
    };
    if request.method != route.method() {
        write_json_response(&mut stream, 405, &json!({"error": "method not allowed"}))?;
        return Ok(());
    }

    match route {
        Route::Health => {
            let state = ctx.manager.state();
            let flags = ctx.manager.flags();
            write_json_response(
                &mut stream,
                200,
                &json!({
                    "status": "ok",
                    "source": describe_state(&state),
                    "file_active": flags.file_active,
                    "camera_active": flags.camera_active,
                    "queued_events": ctx.queue.len(),
                }),
            )?;
        }
        Route::Upload => upload::handle(&mut stream, request, cfg, ctx)?,
        Route::StartCamera => match ctx.manager.open_camera() {
            Ok(()) => {
                write_json_response(&mut stream, 200, &json!({"message": "Camera started"}))?
            }
            Err(err) => write_json_response(
                &mut stream,
                500,
                &json!({"error": format!("Camera error: {}", err)}),
            )?,
        },
        Route::StopCamera => {
            ctx.manager.stop();
            write_json_response(
                &mut stream,
                200,
                &json!({"message": "Camera stopped successfully"}),
            )?;
        }
        Route::Abort => {
            ctx.manager.abort();
            write_json_response(&mut stream, 200, &json!({"message": "Processing aborted"}))?;
        }
        Route::VideoFeed => {
            stream_video(&mut stream, cfg, ctx, SourceKind::File, cfg.file_jpeg_quality)?
        }
        Route::CameraFeed => {
            stream_video(&mut stream, cfg, ctx, SourceKind::Camera, cfg.camera_jpeg_quality)?
        }
        Route::PotholeEvents => stream_events(&mut stream, cfg, ctx)?,
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Health,
    Upload,
    StartCamera,
    StopCamera,
    Abort,
    VideoFeed,
    CameraFeed,
    PotholeEvents,
}

impl Route {
    fn find(path: &str) -> Option<Self> {
        let route = match path {
            "/health" => Route::Health,
            "/upload" => Route::Upload,
            "/start_camera" => Route::StartCamera,
            "/stop_camera" => Route::StopCamera,
            "/abort" => Route::Abort,
            "/video_feed" => Route::VideoFeed,
            "/camera_feed" => Route::CameraFeed,
            "/pothole_events" => Route::PotholeEvents,
            _ => return None,
        };
        Some(route)
    }

    fn method(self) -> &'static str {
        match self {
            Route::Upload | Route::StartCamera | Route::StopCamera | Route::Abort => "POST",
            Route::Health | Route::VideoFeed | Route::CameraFeed | Route::PotholeEvents => "GET",
        }
    }
}

fn describe_state(state: &SourceState) -> String {
    match state {
        SourceState::Idle => "idle".to_string(),
        SourceState::File { path } => format!("file:{}", path),
        SourceState::Camera { device } => format!("camera:{}", device),
    }
}

fn stream_video(
    stream: &mut TcpStream,
    cfg: &ApiConfig,
    ctx: &ApiContext,
    kind: SourceKind,
    quality: u8,
) -> Result<()> {
    let publisher = StreamPublisher::new(MultipartEncoder::new(cfg.boundary.clone(), quality));
    write_stream_head(stream, &publisher.encoder().content_type())?;

    let Some(lease) = ctx.manager.lease(kind) else {
        log::info!("api: no active {} source; closing feed", kind.as_str());
        return Ok(());
    };
    let pipeline = FramePipeline::new(
        Arc::clone(&ctx.manager),
        lease,
        Arc::clone(&ctx.oracle),
        ctx.annotator.clone(),
        Arc::clone(&ctx.queue),
        PipelineOptions {
            max_blank_frames: cfg.max_blank_frames,
        },
    );
    let stats = publisher.publish(pipeline, stream);
    if let PublishOutcome::EncodingFailed(reason) = &stats.outcome {
        log::warn!("api: {} feed cut short: {}", kind.as_str(), reason);
    }
    log::info!(
        "api: {} feed closed after {} frames ({} bytes)",
        kind.as_str(),
        stats.frames_sent,
        stats.bytes_sent
    );
    Ok(())
}

fn stream_events(stream: &mut TcpStream, cfg: &ApiConfig, ctx: &ApiContext) -> Result<()> {
    write_stream_head(stream, "text/event-stream")?;
    let notifier = EventNotifier::new(
        Arc::clone(&ctx.queue),
        ctx.manager.activity(),
        cfg.event_poll_interval,
    );
    for message in notifier {
        let delivered = stream
            .write_all(message.to_sse().as_bytes())
            .and_then(|_| stream.flush());
        if let Err(err) = delivered {
            log::info!("api: event subscriber left: {}", err);
            break;
        }
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    /// Body bytes that arrived together with the headers.
    body_prefix: Vec<u8>,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn content_length(&self) -> Result<Option<u64>> {
        self.header("content-length")
            .map(|value| {
                value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| anyhow!("invalid content-length"))
            })
            .transpose()
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        raw_path: raw_path.to_string(),
        query,
        headers,
        body_prefix: data[header_end + 4..].to_vec(),
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (percent_decode(k), percent_decode(v)))
        .collect()
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        411 => "HTTP/1.1 411 Length Required",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line(status),
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

/// Headers for an open-ended streaming body: no Content-Length, closed by
/// the server when the stream ends.
fn write_stream_head(stream: &mut TcpStream, content_type: &str) -> Result<()> {
    let header = format!(
        "{}\r\nContent-Type: {}\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        status_line(200),
        content_type
    );
    stream.write_all(header.as_bytes())?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_and_methods() {
        assert_eq!(Route::find("/upload"), Some(Route::Upload));
        assert_eq!(Route::Upload.method(), "POST");
        assert_eq!(Route::find("/camera_feed").map(Route::method), Some("GET"));
        assert_eq!(Route::find("/events"), None);
    }

    #[test]
    fn query_values_are_decoded() {
        let query = parse_query("filename=road%20trip.mjpg&flag&x=a+b");
        assert_eq!(query.get("filename").map(String::as_str), Some("road trip.mjpg"));
        assert_eq!(query.get("flag").map(String::as_str), Some(""));
        assert_eq!(query.get("x").map(String::as_str), Some("a b"));
    }

    #[test]
    fn truncated_percent_escape_is_kept() {
        assert_eq!(percent_decode("50%"), "50%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }
}
