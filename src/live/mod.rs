//! Live stream sessions.
//!
//! A session runs two threads joined by a bounded channel:
//!
//! ```text
//! capture thread --(sync_channel, depth N)--> processing thread --> FrameSink
//! ```
//!
//! Capture never blocks on a slow processor: when the channel is full the
//! fresh frame is dropped and counted, so display latency stays bounded.
//! Detection toggles live behind a lock and may change while running.

mod metrics;
mod state;

use std::collections::HashMap;
use std::io::Cursor;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use image::ImageFormat;
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub use metrics::{MetricAverages, MetricPoint, StreamMetrics, METRICS_HISTORY_CAP};
pub use state::{LiveSnapshot, LiveStreamState};

use crate::config::{LiveSettings, SourceSettings};
use crate::frame::Frame;
use crate::ingest::{self, FrameSource};
use crate::processor::{ProcessorFactory, StreamSafeProcessor};
use crate::settings::DetectionSettings;
use crate::sink::{FrameSink, NullSink, SinkSummary};

const HEALTH_LOG_EVERY: u64 = 300;
const METRICS_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug)]
pub struct LiveSessionConfig {
    pub queue_depth: usize,
    pub preview: bool,
    /// Capture pacing; 0 disables pacing.
    pub target_fps: u32,
}

impl Default for LiveSessionConfig {
    fn default() -> Self {
        Self {
            queue_depth: 2,
            preview: true,
            target_fps: 30,
        }
    }
}

/// Which side of the dual feed to preview.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feed {
    Original,
    Redacted,
}

impl FromStr for Feed {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "original" => Ok(Feed::Original),
            "redacted" | "processed" => Ok(Feed::Redacted),
            other => Err(anyhow!("unknown feed '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub fps: f64,
    pub latency_ms: f64,
    pub detection_count: u64,
    pub dropped_frames: u64,
    pub average: MetricAverages,
}

struct PreviewPair {
    original: Frame,
    redacted: Frame,
}

struct Shared {
    running: AtomicBool,
    source: String,
    settings: RwLock<DetectionSettings>,
    state: Mutex<LiveStreamState>,
    metrics: Mutex<StreamMetrics>,
    preview: Option<Mutex<Option<PreviewPair>>>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn record_error(&self, message: String) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(message);
        }
    }
}

/// One running capture → redact → sink pipeline.
pub struct LiveSession {
    shared: Arc<Shared>,
    capture: Option<JoinHandle<()>>,
    processing: Option<JoinHandle<Result<SinkSummary>>>,
}

impl LiveSession {
    /// Connect `source` and start both threads.
    pub fn start(
        mut source: Box<dyn FrameSource>,
        processor: StreamSafeProcessor,
        sink: Box<dyn FrameSink>,
        settings: DetectionSettings,
        config: LiveSessionConfig,
    ) -> Result<Self> {
        source.connect().context("connect live source")?;
        let uri = source.stats().uri;

        let mut state = LiveStreamState::default();
        state.start();
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            source: uri.clone(),
            settings: RwLock::new(settings),
            state: Mutex::new(state),
            metrics: Mutex::new(StreamMetrics::new()),
            preview: config.preview.then(|| Mutex::new(None)),
            last_error: Mutex::new(None),
        });

        let (tx, rx) = mpsc::sync_channel::<Frame>(config.queue_depth.max(1));

        let capture_shared = shared.clone();
        let target_fps = config.target_fps;
        let capture = thread::Builder::new()
            .name("streamsafe-capture".into())
            .spawn(move || capture_loop(source, tx, capture_shared, target_fps))
            .context("spawn capture thread")?;

        let processing_shared = shared.clone();
        let processing = thread::Builder::new()
            .name("streamsafe-process".into())
            .spawn(move || processing_loop(rx, processor, sink, processing_shared))
            .context("spawn processing thread")?;

        log::info!("live session started on {}", uri);
        Ok(Self {
            shared,
            capture: Some(capture),
            processing: Some(processing),
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn source(&self) -> &str {
        &self.shared.source
    }

    pub fn settings(&self) -> Result<DetectionSettings> {
        self.shared
            .settings
            .read()
            .map(|s| *s)
            .map_err(|_| anyhow!("settings lock poisoned"))
    }

    pub fn update_settings(&self, settings: DetectionSettings) -> Result<()> {
        let mut guard = self
            .shared
            .settings
            .write()
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        *guard = settings;
        log::info!("live settings on {} now {:?}", self.shared.source, settings.enabled());
        Ok(())
    }

    pub fn snapshot(&self) -> Result<LiveSnapshot> {
        let settings = self.settings()?;
        let state = self
            .shared
            .state
            .lock()
            .map_err(|_| anyhow!("state lock poisoned"))?;
        Ok(state.snapshot(settings, &self.shared.source))
    }

    pub fn metrics(&self) -> Result<MetricsSummary> {
        let average = self
            .shared
            .metrics
            .lock()
            .map_err(|_| anyhow!("metrics lock poisoned"))?
            .average(METRICS_WINDOW);
        let state = self
            .shared
            .state
            .lock()
            .map_err(|_| anyhow!("state lock poisoned"))?;
        Ok(MetricsSummary {
            fps: state.fps,
            latency_ms: state.latency_ms,
            detection_count: state.detection_count,
            dropped_frames: state.dropped_frames,
            average,
        })
    }

    /// Latest frame of `feed` as JPEG, once one has been processed.
    pub fn preview_jpeg(&self, feed: Feed) -> Result<Option<Vec<u8>>> {
        let Some(preview) = self.shared.preview.as_ref() else {
            return Err(anyhow!("preview is disabled for this session"));
        };
        let guard = preview
            .lock()
            .map_err(|_| anyhow!("preview lock poisoned"))?;
        let Some(pair) = guard.as_ref() else {
            return Ok(None);
        };
        let frame = match feed {
            Feed::Original => &pair.original,
            Feed::Redacted => &pair.redacted,
        };
        let mut jpeg = Vec::new();
        frame
            .image()
            .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .context("encode preview")?;
        Ok(Some(jpeg))
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Stop capture, drain the queue, join both threads and return the final snapshot.
    pub fn stop(&mut self) -> Result<LiveSnapshot> {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.capture.take() {
            handle
                .join()
                .map_err(|_| anyhow!("capture thread panicked"))?;
        }
        if let Some(handle) = self.processing.take() {
            let summary = handle
                .join()
                .map_err(|_| anyhow!("processing thread panicked"))??;
            log::info!(
                "live session on {} stopped after {} frames",
                self.shared.source,
                summary.frames_written
            );
        }
        self.snapshot()
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if self.capture.is_some() || self.processing.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("live session shutdown: {:#}", e);
            }
        }
    }
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    tx: SyncSender<Frame>,
    shared: Arc<Shared>,
    target_fps: u32,
) {
    let interval = (target_fps > 0).then(|| Duration::from_secs_f64(1.0 / target_fps as f64));
    let mut last_capture: Option<Instant> = None;

    while shared.running.load(Ordering::SeqCst) {
        if let (Some(interval), Some(last)) = (interval, last_capture) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        last_capture = Some(Instant::now());

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("live source {} reached end of stream", shared.source);
                break;
            }
            Err(e) => {
                log::warn!("live source {} error: {:#}", shared.source, e);
                shared.record_error(format!("{:#}", e));
                if !source.is_healthy() {
                    break;
                }
                continue;
            }
        };

        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_dropped)) => {
                if let Ok(mut state) = shared.state.lock() {
                    state.record_dropped();
                }
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    shared.running.store(false, Ordering::SeqCst);
}

/// Marks the session stopped when the processing thread exits, on any path.
struct StopOnExit<'a>(&'a Shared);

impl Drop for StopOnExit<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
        let mut state = self
            .0
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.stop();
    }
}

fn processing_loop(
    rx: Receiver<Frame>,
    mut processor: StreamSafeProcessor,
    mut sink: Box<dyn FrameSink>,
    shared: Arc<Shared>,
) -> Result<SinkSummary> {
    let _stop = StopOnExit(shared.as_ref());
    for mut frame in rx {
        let settings = shared
            .settings
            .read()
            .map(|s| *s)
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        let original = shared.preview.as_ref().map(|_| frame.clone());

        let report = processor.process_frame(&mut frame, &settings);
        if let Err(e) = sink.write(&frame) {
            log::warn!("live sink write failed: {:#}", e);
            shared.record_error(format!("{:#}", e));
        }

        let detections = report.detection_count() as u64;
        let (fps, latency_ms, frames, dropped) = {
            let mut state = shared
                .state
                .lock()
                .map_err(|_| anyhow!("state lock poisoned"))?;
            state.update_frame_stats(report.elapsed, detections);
            (state.fps, state.latency_ms, state.frame_count, state.dropped_frames)
        };
        if let Ok(mut metrics) = shared.metrics.lock() {
            metrics.add(fps, latency_ms, detections);
        }
        if let (Some(preview), Some(original)) = (shared.preview.as_ref(), original) {
            if let Ok(mut slot) = preview.lock() {
                *slot = Some(PreviewPair {
                    original,
                    redacted: frame,
                });
            }
        }

        if frames % HEALTH_LOG_EVERY == 0 {
            log::info!(
                "live {}: {} frames, {:.1} fps, {:.0} ms, {} dropped",
                shared.source,
                frames,
                fps,
                latency_ms,
                dropped
            );
        }
    }

    sink.finish()
}

/// Optional overrides for a new session's source.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamRequest {
    pub source: Option<String>,
    pub target_fps: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Sessions addressed by id, as served by the API.
pub struct LiveManager {
    source_defaults: SourceSettings,
    live: LiveSettings,
    factory: ProcessorFactory,
    sessions: Mutex<HashMap<String, LiveSession>>,
}

impl LiveManager {
    pub fn new(source_defaults: SourceSettings, live: LiveSettings, factory: ProcessorFactory) -> Self {
        Self {
            source_defaults,
            live,
            factory,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, LiveSession>>> {
        self.sessions
            .lock()
            .map_err(|_| anyhow!("live session lock poisoned"))
    }

    /// Open the requested source and start a session on it. Returns the session id.
    pub fn start(&self, request: &StreamRequest, settings: DetectionSettings) -> Result<String> {
        let source_settings = SourceSettings {
            uri: request
                .source
                .clone()
                .unwrap_or_else(|| self.source_defaults.uri.clone()),
            target_fps: request.target_fps.unwrap_or(self.source_defaults.target_fps),
            width: request.width.unwrap_or(self.source_defaults.width),
            height: request.height.unwrap_or(self.source_defaults.height),
        };
        let source = ingest::open_source(&source_settings.uri, &source_settings)?;
        let processor = (self.factory)()?;
        let config = LiveSessionConfig {
            queue_depth: self.live.queue_depth,
            preview: self.live.preview,
            target_fps: source_settings.target_fps,
        };
        let session = LiveSession::start(source, processor, Box::new(NullSink::default()), settings, config)?;

        let id = new_session_id();
        self.sessions()?.insert(id.clone(), session);
        Ok(id)
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.sessions()?.contains_key(id))
    }

    /// Stop and forget a session. `None` if the id is unknown.
    pub fn stop(&self, id: &str) -> Result<Option<LiveSnapshot>> {
        let session = self.sessions()?.remove(id);
        match session {
            Some(mut session) => session.stop().map(Some),
            None => Ok(None),
        }
    }

    pub fn snapshot(&self, id: &str) -> Result<Option<LiveSnapshot>> {
        self.sessions()?
            .get(id)
            .map(LiveSession::snapshot)
            .transpose()
    }

    pub fn update_settings(&self, id: &str, settings: DetectionSettings) -> Result<Option<LiveSnapshot>> {
        let sessions = self.sessions()?;
        let Some(session) = sessions.get(id) else {
            return Ok(None);
        };
        session.update_settings(settings)?;
        session.snapshot().map(Some)
    }

    pub fn metrics(&self, id: &str) -> Result<Option<MetricsSummary>> {
        self.sessions()?.get(id).map(LiveSession::metrics).transpose()
    }

    /// `Ok(None)` for an unknown id; `Ok(Some(None))` before the first processed frame.
    pub fn preview(&self, id: &str, feed: Feed) -> Result<Option<Option<Vec<u8>>>> {
        self.sessions()?
            .get(id)
            .map(|session| session.preview_jpeg(feed))
            .transpose()
    }

    /// Sessions still capturing.
    pub fn active_count(&self) -> usize {
        self.sessions()
            .map(|sessions| sessions.values().filter(|s| s.is_running()).count())
            .unwrap_or(0)
    }

    pub fn stop_all(&self) -> Result<()> {
        let drained: Vec<(String, LiveSession)> = self.sessions()?.drain().collect();
        for (id, mut session) in drained {
            if let Err(e) = session.stop() {
                log::warn!("stopping live session {}: {:#}", id, e);
            }
        }
        Ok(())
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
