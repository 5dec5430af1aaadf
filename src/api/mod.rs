//! Blocking HTTP/JSON control API for live sessions and processing jobs.
//!
//! Every route except health requires `Authorization: Bearer <token>`; the
//! token is generated at startup and optionally written to a 0600 file.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{DetectorSettings, StreamSafeConfig};
use crate::jobs::{DownloadError, JobService, JobSpec, StartError};
use crate::live::{Feed, LiveManager, StreamRequest};
use crate::processor::{KindPolicy, ProcessorFactory, StreamSafeProcessor};
use crate::settings::{DetectionKind, DetectionSettings};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const HEALTH_PATH: &str = "/api/system/health";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub token_path: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            token_path: None,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    pub token: String,
    pub token_path: Option<PathBuf>,
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

/// Random bearer token fixed for the lifetime of the server.
#[derive(Clone)]
pub struct ApiToken {
    token: [u8; 32],
}

impl ApiToken {
    pub fn generate() -> Self {
        let mut token = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);
        Self { token }
    }

    pub fn token_hex(&self) -> String {
        hex::encode(self.token)
    }

    pub fn validate(&self, presented: &str) -> Result<()> {
        let presented = parse_hex32(presented)?;
        if presented != self.token {
            return Err(anyhow!("api token invalid"));
        }
        Ok(())
    }
}

/// Everything the handlers need, shared with the server thread.
pub struct ApiState {
    pub live: LiveManager,
    pub jobs: JobService,
    pub detectors: DetectorSettings,
    pub default_settings: DetectionSettings,
    models: Vec<(DetectionKind, &'static str)>,
    started: Instant,
}

impl ApiState {
    pub fn new(
        live: LiveManager,
        jobs: JobService,
        factory: &ProcessorFactory,
        detectors: DetectorSettings,
        default_settings: DetectionSettings,
    ) -> Result<Self> {
        let models = factory()
            .context("build processor for model listing")?
            .registry()
            .list()?;
        Ok(Self {
            live,
            jobs,
            detectors,
            default_settings,
            models,
            started: Instant::now(),
        })
    }

    pub fn from_config(cfg: &StreamSafeConfig) -> Result<Self> {
        let factory = StreamSafeProcessor::factory(cfg.detectors.clone());
        let live = LiveManager::new(cfg.source.clone(), cfg.live.clone(), factory.clone());
        let jobs = JobService::new(
            factory.clone(),
            cfg.jobs.output_dir.clone(),
            cfg.source.clone(),
            cfg.jobs.history_cap,
        );
        Self::new(live, jobs, &factory, cfg.detectors.clone(), cfg.detection)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stop live sessions and cancel running jobs.
    pub fn shutdown(&self) -> Result<()> {
        self.live.stop_all()?;
        self.jobs.shutdown()
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: Arc<ApiState>) -> Self {
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

        let api_token = ApiToken::generate();
        let token = api_token.token_hex();
        if let Some(path) = &self.cfg.token_path {
            write_token_file(path, &token)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let state = self.state.clone();
        let join = std::thread::Builder::new()
            .name("streamsafe-api".into())
            .spawn(move || {
                if let Err(err) = run_api(listener, &state, &api_token, shutdown_thread) {
                    log::error!("api stopped: {}", err);
                }
            })?;
        log::info!("api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            token,
            token_path: self.cfg.token_path,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    state: &ApiState,
    token: &ApiToken,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, state, token) {
                    log::warn!("api request rejected: {}", err);
                }
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

fn handle_connection(mut stream: TcpStream, state: &ApiState, token: &ApiToken) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        return Response::error(403, "forbidden").write_to(&mut stream);
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            Response::error(400, "bad_request").write_to(&mut stream)?;
            return Err(err);
        }
    };

    if request.path != HEALTH_PATH {
        if request.has_query_token() {
            return Response::error(400, "token_query_param_not_allowed").write_to(&mut stream);
        }
        let Some(presented) = request.bearer_token() else {
            return Response::error(401, "missing_token").write_to(&mut stream);
        };
        if let Err(err) = token.validate(&presented) {
            Response::error(401, "invalid_token").write_to(&mut stream)?;
            return Err(err);
        }
    }

    let response = route(state, &request).unwrap_or_else(|err| {
        log::warn!("{} {} failed: {:#}", request.method, request.path, err);
        Response::error(500, "internal_error")
    });
    response.write_to(&mut stream)
}

fn route(state: &ApiState, request: &HttpRequest) -> Result<Response> {
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let method = request.method.as_str();

    match (segments.as_slice(), method) {
        (["api", "system", "health"], "GET") => Ok(health(state)),
        (["api", "detection", "capabilities"], "GET") => Ok(capabilities(state)),
        (["api", "models"], "GET") => Ok(models(state)),

        (["api", "live", "start"], "POST") => live_start(state, request),
        (["api", "live", id, "stop"], "POST") => live_stop(state, id),
        (["api", "live", id, "status"], "GET") => live_status(state, id),
        (["api", "live", id, "settings"], "PUT") => live_settings(state, id, request),
        (["api", "live", id, "metrics"], "GET") => live_metrics(state, id),
        (["api", "live", id, "frame"], "GET") => live_frame(state, id, request),

        (["api", "jobs"], "POST") => job_submit(state, request),
        (["api", "jobs"], "GET") => job_list(state),
        (["api", "process", "start"], "POST") => job_start(state, request),
        (["api", "jobs", id, "status"], "GET") => job_status(state, id),
        (["api", "jobs", id, "progress"], "GET") => job_progress(state, id),
        (["api", "jobs", id, "cancel"], "POST") => job_cancel(state, id),
        (["api", "jobs", id, "download"], "GET") => job_download(state, id, request),

        (path, _) if is_known_path(path) => Ok(Response::error(405, "method_not_allowed")),
        _ => Ok(Response::error(404, "not_found")),
    }
}

fn is_known_path(segments: &[&str]) -> bool {
    matches!(
        segments,
        ["api", "system", "health"]
            | ["api", "detection", "capabilities"]
            | ["api", "models"]
            | ["api", "live", "start"]
            | ["api", "live", _, "stop" | "status" | "settings" | "metrics" | "frame"]
            | ["api", "jobs"]
            | ["api", "process", "start"]
            | ["api", "jobs", _, "status" | "progress" | "cancel" | "download"]
    )
}

fn health(state: &ApiState) -> Response {
    Response::json(
        200,
        &json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "active_streams": state.live.active_count(),
            "active_jobs": state.jobs.active_count(),
            "uptime_seconds": state.uptime().as_secs_f64(),
        }),
    )
}

fn capabilities(state: &ApiState) -> Response {
    let kinds: Vec<Value> = DetectionKind::ALL
        .iter()
        .map(|kind| {
            let policy = KindPolicy::from_settings(*kind, &state.detectors);
            json!({
                "kind": kind,
                "label": kind.label(),
                "description": kind.description(),
                "method": kind.method(),
                "cadence": policy.cadence,
                "max_regions": policy.max_regions,
            })
        })
        .collect();
    Response::json(
        200,
        &json!({
            "detection_types": kinds,
            "default_settings": state.default_settings,
        }),
    )
}

fn models(state: &ApiState) -> Response {
    let models: Vec<Value> = state
        .models
        .iter()
        .map(|(kind, backend)| json!({ "kind": kind, "backend": backend }))
        .collect();
    Response::json(200, &json!({ "models": models }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LiveStartBody {
    detection_settings: Option<DetectionSettings>,
    stream_config: StreamRequest,
}

fn live_start(state: &ApiState, request: &HttpRequest) -> Result<Response> {
    let body: LiveStartBody = match request.json_or_default() {
        Ok(body) => body,
        Err(_) => return Ok(Response::error(400, "invalid_json")),
    };
    let settings = body.detection_settings.unwrap_or(state.default_settings);
    match state.live.start(&body.stream_config, settings) {
        Ok(id) => Ok(Response::json(
            200,
            &json!({ "stream_id": id, "status": "started", "detection_settings": settings }),
        )),
        Err(err) => {
            log::warn!("live start failed: {:#}", err);
            Ok(Response::error(400, "stream_start_failed"))
        }
    }
}

fn live_stop(state: &ApiState, id: &str) -> Result<Response> {
    match state.live.stop(id)? {
        Some(snapshot) => Ok(Response::json(200, &json!({ "stream_id": id, "final": snapshot }))),
        None => Ok(Response::error(404, "stream_not_found")),
    }
}

fn live_status(state: &ApiState, id: &str) -> Result<Response> {
    match state.live.snapshot(id)? {
        Some(snapshot) => Ok(Response::json(200, &serde_json::to_value(snapshot)?)),
        None => Ok(Response::error(404, "stream_not_found")),
    }
}

fn live_settings(state: &ApiState, id: &str, request: &HttpRequest) -> Result<Response> {
    let body: Value = match request.json() {
        Ok(body) => body,
        Err(_) => return Ok(Response::error(400, "invalid_json")),
    };
    let settings = match DetectionSettings::from_update(&body) {
        Ok(settings) => settings,
        Err(err) => {
            log::warn!("settings update for {} rejected: {:#}", id, err);
            return Ok(Response::error(400, "invalid_settings"));
        }
    };
    match state.live.update_settings(id, settings)? {
        Some(snapshot) => Ok(Response::json(200, &serde_json::to_value(snapshot)?)),
        None => Ok(Response::error(404, "stream_not_found")),
    }
}

fn live_metrics(state: &ApiState, id: &str) -> Result<Response> {
    match state.live.metrics(id)? {
        Some(metrics) => Ok(Response::json(200, &serde_json::to_value(metrics)?)),
        None => Ok(Response::error(404, "stream_not_found")),
    }
}

fn live_frame(state: &ApiState, id: &str, request: &HttpRequest) -> Result<Response> {
    let feed = match request.query_param("feed") {
        Some(value) => match value.parse::<Feed>() {
            Ok(feed) => feed,
            Err(_) => return Ok(Response::error(400, "invalid_feed")),
        },
        None => Feed::Redacted,
    };
    match state.live.preview(id, feed)? {
        Some(Some(jpeg)) => Ok(Response::bytes(200, "image/jpeg", jpeg)),
        Some(None) => Ok(Response::error(404, "frame_unavailable")),
        None => Ok(Response::error(404, "stream_not_found")),
    }
}

fn job_submit(state: &ApiState, request: &HttpRequest) -> Result<Response> {
    let spec: JobSpec = match request.json() {
        Ok(spec) => spec,
        Err(_) => return Ok(Response::error(400, "invalid_json")),
    };
    match state.jobs.submit(spec) {
        Ok(id) => Ok(Response::json(200, &json!({ "job_id": id, "status": "pending" }))),
        Err(err) => {
            log::warn!("job rejected: {:#}", err);
            Ok(Response::error(400, "invalid_job"))
        }
    }
}

fn job_list(state: &ApiState) -> Result<Response> {
    let jobs: Vec<Value> = state.jobs.list()?.iter().map(|job| job.to_json()).collect();
    Ok(Response::json(200, &json!({ "jobs": jobs })))
}

#[derive(Debug, Deserialize)]
struct JobStartBody {
    job_id: String,
}

fn job_start(state: &ApiState, request: &HttpRequest) -> Result<Response> {
    let body: JobStartBody = match request.json() {
        Ok(body) => body,
        Err(_) => return Ok(Response::error(400, "invalid_json")),
    };
    match state.jobs.start(&body.job_id) {
        Ok(()) => Ok(Response::json(
            200,
            &json!({ "job_id": body.job_id, "status": "running" }),
        )),
        Err(err) => match err.downcast_ref::<StartError>() {
            Some(StartError::NotFound) => Ok(Response::error(404, "job_not_found")),
            Some(StartError::NotPending(_)) => Ok(Response::error(409, "job_not_pending")),
            None => Err(err),
        },
    }
}

fn job_status(state: &ApiState, id: &str) -> Result<Response> {
    let Some(job) = state.jobs.get(id)? else {
        return Ok(Response::error(404, "job_not_found"));
    };
    Ok(Response::json(
        200,
        &json!({
            "job_id": job.id,
            "type": job.kind,
            "status": job.status,
            "progress": job.progress,
            "error_message": job.error_message,
            "output": job.output,
        }),
    ))
}

fn job_progress(state: &ApiState, id: &str) -> Result<Response> {
    let Some(job) = state.jobs.get(id)? else {
        return Ok(Response::error(404, "job_not_found"));
    };
    Ok(Response::json(
        200,
        &json!({
            "job_id": job.id,
            "status": job.status,
            "progress": job.progress,
            "current_stage": job.current_stage,
            "processed_frames": job.processed_frames,
            "total_frames": job.total_frames,
            "duration": job.duration(),
            "eta_seconds": job.eta_seconds(),
        }),
    ))
}

fn job_cancel(state: &ApiState, id: &str) -> Result<Response> {
    if state.jobs.get(id)?.is_none() {
        return Ok(Response::error(404, "job_not_found"));
    }
    if state.jobs.cancel(id)? {
        Ok(Response::json(200, &json!({ "job_id": id, "status": "cancelled" })))
    } else {
        Ok(Response::error(409, "job_not_cancellable"))
    }
}

/// Serve one file from a completed job's output, `manifest.json` by default.
fn job_download(state: &ApiState, id: &str, request: &HttpRequest) -> Result<Response> {
    let file = request.query_param("file").unwrap_or("manifest.json");
    let path = match state.jobs.output_file(id, file) {
        Ok(path) => path,
        Err(err) => {
            return match err.downcast_ref::<DownloadError>() {
                Some(DownloadError::NotFound) => Ok(Response::error(404, "job_not_found")),
                Some(DownloadError::NotCompleted(_)) => Ok(Response::error(409, "job_not_completed")),
                Some(DownloadError::InvalidPath) => Ok(Response::error(400, "invalid_file")),
                Some(DownloadError::MissingFile) => Ok(Response::error(404, "file_not_found")),
                None => Err(err),
            };
        }
    };
    let body = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    Ok(Response::bytes(200, content_type_for(&path), body))
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json(status: u16, value: &Value) -> Self {
        Self::bytes(status, "application/json", value.to_string().into_bytes())
    }

    fn error(status: u16, code: &str) -> Self {
        Self::json(status, &json!({ "error": code }))
    }

    fn bytes(status: u16, content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type,
            body,
        }
    }

    fn write_to(&self, stream: &mut TcpStream) -> Result<()> {
        write_response(stream, self.status, self.content_type, &self.body)
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
        body,
    })
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
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
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
    headers: HashMap<String, String>,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    fn bearer_token(&self) -> Option<String> {
        if let Some(value) = self.headers.get("authorization") {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
                return Some(parts[1].to_string());
            }
        }
        None
    }

    fn query_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.raw_path
            .split_once('?')
            .map(|(_, query)| query)
            .unwrap_or("")
            .split('&')
            .filter_map(|pair| pair.split_once('='))
    }

    fn has_query_token(&self) -> bool {
        self.query_pairs().any(|(k, _)| k == "token")
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.query_pairs().find(|(k, _)| *k == name).map(|(_, v)| v)
    }

    fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).context("parse request body")
    }

    /// Empty bodies deserialize to the type's default.
    fn json_or_default<T: serde::de::DeserializeOwned + Default>(&self) -> Result<T> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        self.json()
    }
}

fn write_token_file(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{token}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn parse_hex32(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value)?;
    if bytes.len() != 32 {
        return Err(anyhow!("token must be 32 bytes"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
