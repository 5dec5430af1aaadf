//! Blocking client for the streamsafed HTTP API.

use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::jobs::JobSpec;
use crate::live::{Feed, StreamRequest};
use crate::settings::DetectionSettings;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FRAME_BYTES: u64 = 32 * 1024 * 1024;

/// Non-2xx answer from the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    /// Value of the `error` field, or `unknown` when the body had none.
    pub code: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "api returned {}: {}", self.status, self.code)
    }
}

impl std::error::Error for ApiError {}

pub struct StreamSafeClient {
    base_url: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl StreamSafeClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, token: Option<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            agent,
        }
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let request = self
            .agent
            .request(method, &format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Bearer {}", token)),
            None => request,
        }
    }

    fn send(&self, method: &str, path: &str, body: Option<&Value>) -> Result<ureq::Response> {
        let request = self.request(method, path);
        let result = match body {
            Some(body) => request.send_json(body.clone()),
            None => request.call(),
        };
        match result {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(status, response)) => {
                let code = response
                    .into_json::<Value>()
                    .ok()
                    .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                Err(ApiError { status, code }.into())
            }
            Err(err) => Err(err).with_context(|| format!("{} {}", method, path)),
        }
    }

    fn json<T: DeserializeOwned>(&self, method: &str, path: &str, body: Option<&Value>) -> Result<T> {
        self.send(method, path, body)?
            .into_json()
            .with_context(|| format!("decode response of {} {}", method, path))
    }

    pub fn health(&self) -> Result<Value> {
        self.json("GET", "/api/system/health", None)
    }

    pub fn capabilities(&self) -> Result<Value> {
        self.json("GET", "/api/detection/capabilities", None)
    }

    pub fn models(&self) -> Result<Value> {
        self.json("GET", "/api/models", None)
    }

    /// Start a live session; returns its id.
    pub fn start_stream(&self, settings: DetectionSettings, stream: &StreamRequest) -> Result<String> {
        let body = json!({ "detection_settings": settings, "stream_config": stream });
        let reply: Value = self.json("POST", "/api/live/start", Some(&body))?;
        string_field(&reply, "stream_id")
    }

    pub fn stop_stream(&self, id: &str) -> Result<Value> {
        self.json("POST", &format!("/api/live/{}/stop", id), None)
    }

    pub fn stream_status(&self, id: &str) -> Result<Value> {
        self.json("GET", &format!("/api/live/{}/status", id), None)
    }

    pub fn update_stream_settings(&self, id: &str, settings: DetectionSettings) -> Result<Value> {
        let body = json!({ "detection_settings": settings });
        self.json("PUT", &format!("/api/live/{}/settings", id), Some(&body))
    }

    pub fn stream_metrics(&self, id: &str) -> Result<Value> {
        self.json("GET", &format!("/api/live/{}/metrics", id), None)
    }

    /// Latest preview JPEG for one side of the dual feed.
    pub fn stream_frame(&self, id: &str, feed: Feed) -> Result<Vec<u8>> {
        let feed = match feed {
            Feed::Original => "original",
            Feed::Redacted => "redacted",
        };
        let response = self.send("GET", &format!("/api/live/{}/frame?feed={}", id, feed), None)?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_FRAME_BYTES)
            .read_to_end(&mut bytes)
            .context("read frame body")?;
        Ok(bytes)
    }

    /// Fetch a file from a completed job's output; `None` asks for its manifest.
    pub fn download_job_file(&self, id: &str, file: Option<&str>) -> Result<Vec<u8>> {
        let path = match file {
            Some(file) => format!("/api/jobs/{}/download?file={}", id, file),
            None => format!("/api/jobs/{}/download", id),
        };
        let response = self.send("GET", &path, None)?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_FRAME_BYTES)
            .read_to_end(&mut bytes)
            .context("read job output")?;
        Ok(bytes)
    }

    /// Submit a job; returns its id.
    pub fn submit_job(&self, spec: &JobSpec) -> Result<String> {
        let body = serde_json::to_value(spec)?;
        let reply: Value = self.json("POST", "/api/jobs", Some(&body))?;
        string_field(&reply, "job_id")
    }

    pub fn list_jobs(&self) -> Result<Value> {
        self.json("GET", "/api/jobs", None)
    }

    pub fn start_job(&self, id: &str) -> Result<Value> {
        self.json("POST", "/api/process/start", Some(&json!({ "job_id": id })))
    }

    pub fn job_status(&self, id: &str) -> Result<Value> {
        self.json("GET", &format!("/api/jobs/{}/status", id), None)
    }

    pub fn job_progress(&self, id: &str) -> Result<Value> {
        self.json("GET", &format!("/api/jobs/{}/progress", id), None)
    }

    pub fn cancel_job(&self, id: &str) -> Result<Value> {
        self.json("POST", &format!("/api/jobs/{}/cancel", id), None)
    }
}

fn string_field(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("response missing '{}'", field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = StreamSafeClient::new("http://127.0.0.1:8000/", None);
        assert_eq!(client.base_url, "http://127.0.0.1:8000");
    }

    #[test]
    fn string_field_requires_strings() {
        let value = json!({ "job_id": "abc", "count": 3 });
        assert_eq!(string_field(&value, "job_id").ok().as_deref(), Some("abc"));
        assert!(string_field(&value, "count").is_err());
        assert!(string_field(&value, "missing").is_err());
    }

    #[test]
    fn api_error_display() {
        let err = ApiError {
            status: 404,
            code: "job_not_found".into(),
        };
        assert_eq!(err.to_string(), "api returned 404: job_not_found");
    }
}
