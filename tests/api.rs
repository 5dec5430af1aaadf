use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

use streamsafe::api::{ApiConfig, ApiHandle, ApiServer, ApiState};
use streamsafe::config::{DetectorSettings, LiveSettings, SourceSettings};
use streamsafe::jobs::JobService;
use streamsafe::live::LiveManager;
use streamsafe::{DetectionSettings, StreamSafeProcessor};

struct Reply {
    headers: String,
    body: Vec<u8>,
}

impl Reply {
    fn status(&self) -> &str {
        self.headers.lines().next().unwrap_or("")
    }

    fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

struct TestApi {
    _dir: tempfile::TempDir,
    state: Arc<ApiState>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let dir = tempdir()?;
        let source = SourceSettings {
            uri: "stub://api".to_string(),
            target_fps: 60,
            width: 160,
            height: 120,
        };
        let factory = StreamSafeProcessor::factory(DetectorSettings::default());
        let live = LiveManager::new(source.clone(), LiveSettings::default(), factory.clone());
        let jobs = JobService::new(factory.clone(), dir.path().join("out"), source, 10);
        let state = Arc::new(ApiState::new(
            live,
            jobs,
            &factory,
            DetectorSettings::default(),
            DetectionSettings::all(),
        )?);

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            token_path: Some(dir.path().join("api.token")),
        };
        let api_handle = ApiServer::new(api_config, state.clone()).spawn()?;

        Ok(Self {
            _dir: dir,
            state,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn send(&self, method: &str, path: &str, token: Option<&str>, body: Option<&str>) -> Result<Reply> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let mut request = format!("{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n", method, path);
        if let Some(token) = token {
            request.push_str(&format!("Authorization: Bearer {}\r\n", token));
        }
        let body = body.unwrap_or("");
        request.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
        stream.write_all(request.as_bytes())?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;
        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| anyhow!("malformed response"))?;
        Ok(Reply {
            headers: String::from_utf8_lossy(&raw[..split]).into_owned(),
            body: raw[split + 4..].to_vec(),
        })
    }

    fn call(&self, method: &str, path: &str, body: Option<&str>) -> Result<Reply> {
        let token = self.handle().token.clone();
        self.send(method, path, Some(&token), body)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        let _ = self.state.shutdown();
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn poll<F: FnMut() -> Result<bool>>(mut done: F) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if done()? {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    Err(anyhow!("condition not reached in time"))
}

#[test]
fn health_is_public() -> Result<()> {
    let api = TestApi::new()?;
    let reply = api.send("GET", "/api/system/health", None, None)?;
    assert!(reply.status().contains("200 OK"));
    let body = reply.json()?;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["active_streams"], 0);
    Ok(())
}

#[test]
fn token_file_matches_handle() -> Result<()> {
    let api = TestApi::new()?;
    let path = api.handle().token_path.clone().ok_or_else(|| anyhow!("no token path"))?;
    let written = std::fs::read_to_string(path)?;
    assert_eq!(written.trim(), api.handle().token);
    Ok(())
}

#[test]
fn api_rejects_missing_or_wrong_token() -> Result<()> {
    let api = TestApi::new()?;

    let reply = api.send("GET", "/api/jobs", None, None)?;
    assert!(reply.status().contains("401 Unauthorized"));
    assert_eq!(reply.json()?["error"], "missing_token");

    let wrong = "11".repeat(32);
    let reply = api.send("GET", "/api/jobs", Some(&wrong), None)?;
    assert!(reply.status().contains("401 Unauthorized"));
    assert_eq!(reply.json()?["error"], "invalid_token");
    Ok(())
}

#[test]
fn api_rejects_token_in_query() -> Result<()> {
    let api = TestApi::new()?;
    let path = format!("/api/jobs?token={}", api.handle().token);
    let reply = api.send("GET", &path, None, None)?;
    assert!(reply.status().contains("400 Bad Request"));
    assert_eq!(reply.json()?["error"], "token_query_param_not_allowed");
    Ok(())
}

#[test]
fn unknown_routes_and_methods() -> Result<()> {
    let api = TestApi::new()?;
    assert!(api.call("GET", "/api/nope", None)?.status().contains("404"));
    let reply = api.call("DELETE", "/api/jobs", None)?;
    assert!(reply.status().contains("405"));
    assert_eq!(reply.json()?["error"], "method_not_allowed");
    Ok(())
}

#[test]
fn capabilities_and_models() -> Result<()> {
    let api = TestApi::new()?;
    let caps = api.call("GET", "/api/detection/capabilities", None)?.json()?;
    let kinds = caps["detection_types"].as_array().ok_or_else(|| anyhow!("no kinds"))?;
    assert_eq!(kinds.len(), 3);
    assert_eq!(kinds[0]["kind"], "license_plates");
    assert_eq!(kinds[0]["cadence"], 1);
    assert_eq!(kinds[1]["kind"], "block_numbers");
    assert_eq!(kinds[1]["cadence"], 30);
    assert_eq!(kinds[2]["method"], "HSV");
    assert_eq!(kinds[2]["cadence"], 15);

    let models = api.call("GET", "/api/models", None)?.json()?;
    let models = models["models"].as_array().ok_or_else(|| anyhow!("no models"))?;
    assert_eq!(models.len(), 3);
    assert!(models
        .iter()
        .any(|m| m["kind"] == "street_signs" && m["backend"] == "hsv-signs"));
    Ok(())
}

#[test]
fn live_session_lifecycle() -> Result<()> {
    let api = TestApi::new()?;
    let body = r#"{"detection_settings": {"street_signs": true},
                   "stream_config": {"source": "stub://api?frames=100000"}}"#;
    let reply = api.call("POST", "/api/live/start", Some(body))?;
    assert!(reply.status().contains("200 OK"));
    let id = reply.json()?["stream_id"]
        .as_str()
        .ok_or_else(|| anyhow!("no stream id"))?
        .to_string();

    let status = api.call("GET", &format!("/api/live/{}/status", id), None)?.json()?;
    assert_eq!(status["detection_settings"]["street_signs"], true);
    assert_eq!(status["detection_settings"]["license_plates"], false);

    let updated = api
        .call(
            "PUT",
            &format!("/api/live/{}/settings", id),
            Some(r#"{"license_plates": true}"#),
        )?
        .json()?;
    assert_eq!(updated["detection_settings"]["license_plates"], true);
    assert_eq!(updated["detection_settings"]["street_signs"], false);

    let updated = api
        .call(
            "PUT",
            &format!("/api/live/{}/settings", id),
            Some(r#"{"detection_settings": {"license_plates": true, "street_signs": true}}"#),
        )?
        .json()?;
    assert_eq!(updated["detection_settings"]["license_plates"], true);
    assert_eq!(updated["detection_settings"]["street_signs"], true);

    let reply = api.call(
        "PUT",
        &format!("/api/live/{}/settings", id),
        Some(r#"{"settings": {"license_plates": false}}"#),
    )?;
    assert!(reply.status().contains("400"));
    assert_eq!(reply.json()?["error"], "invalid_settings");
    let status = api.call("GET", &format!("/api/live/{}/status", id), None)?.json()?;
    assert_eq!(status["detection_settings"]["license_plates"], true);
    assert_eq!(status["detection_settings"]["street_signs"], true);

    poll(|| {
        let reply = api.call("GET", &format!("/api/live/{}/frame?feed=original", id), None)?;
        Ok(reply.status().contains("200 OK") && reply.headers.contains("image/jpeg"))
    })?;
    let reply = api.call("GET", &format!("/api/live/{}/frame?feed=sideways", id), None)?;
    assert!(reply.status().contains("400"));

    let metrics = api.call("GET", &format!("/api/live/{}/metrics", id), None)?.json()?;
    assert!(metrics["average"].is_object());

    let stopped = api.call("POST", &format!("/api/live/{}/stop", id), None)?;
    assert!(stopped.status().contains("200 OK"));
    assert_eq!(stopped.json()?["final"]["is_streaming"], false);

    let again = api.call("POST", &format!("/api/live/{}/stop", id), None)?;
    assert!(again.status().contains("404"));
    assert_eq!(again.json()?["error"], "stream_not_found");
    Ok(())
}

#[test]
fn live_start_with_bad_source_fails() -> Result<()> {
    let api = TestApi::new()?;
    let body = r#"{"stream_config": {"source": "/does/not/exist"}}"#;
    let reply = api.call("POST", "/api/live/start", Some(body))?;
    assert!(reply.status().contains("400"));
    assert_eq!(reply.json()?["error"], "stream_start_failed");

    let reply = api.call("POST", "/api/live/start", Some("{not json"))?;
    assert_eq!(reply.json()?["error"], "invalid_json");
    Ok(())
}

#[test]
fn job_lifecycle() -> Result<()> {
    let api = TestApi::new()?;
    let body = r#"{"inputs": ["stub://job?frames=5"], "quality": "low",
                   "detection_settings": {"license_plates": true}}"#;
    let reply = api.call("POST", "/api/jobs", Some(body))?;
    assert!(reply.status().contains("200 OK"));
    let id = reply.json()?["job_id"]
        .as_str()
        .ok_or_else(|| anyhow!("no job id"))?
        .to_string();

    let status = api.call("GET", &format!("/api/jobs/{}/status", id), None)?.json()?;
    assert_eq!(status["status"], "pending");

    let start_body = format!(r#"{{"job_id": "{}"}}"#, id);
    let reply = api.call("POST", "/api/process/start", Some(&start_body))?;
    assert!(reply.status().contains("200 OK"));

    poll(|| {
        let status = api.call("GET", &format!("/api/jobs/{}/status", id), None)?.json()?;
        Ok(status["status"] == "completed")
    })?;

    let progress = api.call("GET", &format!("/api/jobs/{}/progress", id), None)?.json()?;
    assert_eq!(progress["progress"], 100.0);
    assert_eq!(progress["processed_frames"], 5);
    assert!(progress["eta_seconds"].is_null());

    let listed = api.call("GET", "/api/jobs", None)?.json()?;
    let jobs = listed["jobs"].as_array().ok_or_else(|| anyhow!("no jobs"))?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["kind"], "video_processing");

    let reply = api.call("POST", "/api/process/start", Some(&start_body))?;
    assert!(reply.status().contains("409"));
    assert_eq!(reply.json()?["error"], "job_not_pending");

    let reply = api.call("POST", &format!("/api/jobs/{}/cancel", id), None)?;
    assert!(reply.status().contains("409"));

    let manifest = api.call("GET", &format!("/api/jobs/{}/download", id), None)?;
    assert!(manifest.status().contains("200 OK"));
    assert!(manifest.headers.contains("application/json"));
    let frames = manifest.json()?["frames"].as_array().map(Vec::len);
    assert_eq!(frames, Some(5));

    let frame = api.call(
        "GET",
        &format!("/api/jobs/{}/download?file=frame_000005.png", id),
        None,
    )?;
    assert!(frame.headers.contains("image/png"));
    assert_eq!(&frame.body[1..4], b"PNG");

    let reply = api.call("GET", &format!("/api/jobs/{}/download?file=../api.token", id), None)?;
    assert!(reply.status().contains("400"));
    assert_eq!(reply.json()?["error"], "invalid_file");
    let reply = api.call("GET", &format!("/api/jobs/{}/download?file=missing.png", id), None)?;
    assert_eq!(reply.json()?["error"], "file_not_found");
    Ok(())
}

#[test]
fn job_errors() -> Result<()> {
    let api = TestApi::new()?;
    let reply = api.call("GET", "/api/jobs/missing/status", None)?;
    assert_eq!(reply.json()?["error"], "job_not_found");

    let reply = api.call("POST", "/api/process/start", Some(r#"{"job_id": "missing"}"#))?;
    assert!(reply.status().contains("404"));

    let reply = api.call("POST", "/api/jobs", Some(r#"{"inputs": []}"#))?;
    assert_eq!(reply.json()?["error"], "invalid_job");

    let reply = api.call(
        "POST",
        "/api/jobs",
        Some(r#"{"inputs": ["stub://x"], "output_format": "gif"}"#),
    )?;
    assert!(reply.status().contains("400"));
    assert_eq!(reply.json()?["error"], "invalid_job");

    let reply = api.call(
        "POST",
        "/api/jobs",
        Some(r#"{"inputs": ["stub://x"], "quality": "cinematic"}"#),
    )?;
    assert!(reply.status().contains("200 OK"));

    let reply = api.call("POST", "/api/jobs", Some(r#"{"inputs": ["stub://x"]}"#))?;
    let id = reply.json()?["job_id"].as_str().unwrap_or_default().to_string();
    let reply = api.call("POST", &format!("/api/jobs/{}/cancel", id), None)?;
    assert!(reply.status().contains("200 OK"));
    let status = api.call("GET", &format!("/api/jobs/{}/status", id), None)?.json()?;
    assert_eq!(status["status"], "cancelled");

    let reply = api.call("GET", &format!("/api/jobs/{}/download", id), None)?;
    assert!(reply.status().contains("409"));
    assert_eq!(reply.json()?["error"], "job_not_completed");
    let reply = api.call("GET", "/api/jobs/missing/download", None)?;
    assert_eq!(reply.json()?["error"], "job_not_found");
    Ok(())
}
