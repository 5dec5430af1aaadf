//! Background processing jobs.
//!
//! A job redacts one or more offline inputs (video files, image folders,
//! synthetic streams) into image sequences under the output root. Jobs live
//! in a bounded in-memory queue; workers run one thread per started job and
//! check for cancellation between frames.

use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::SourceSettings;
use crate::format::{validate_video_file, Quality};
use crate::ingest::{self, IMAGE_EXTENSIONS};
use crate::processor::ProcessorFactory;
use crate::settings::DetectionSettings;
use crate::sink::{FrameSink, ImageSequenceSink, OutputFormat};

pub const DEFAULT_HISTORY_CAP: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    VideoProcessing,
    BatchProcessing,
}

fn default_output_format() -> String {
    "png".to_string()
}

/// What a job should process and how.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub inputs: Vec<String>,
    #[serde(default)]
    pub detection_settings: DetectionSettings,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default = "default_output_format")]
    pub output_format: String,
}

impl JobSpec {
    pub fn video(input: impl Into<String>, settings: DetectionSettings, quality: Quality) -> Self {
        Self {
            inputs: vec![input.into()],
            detection_settings: settings,
            quality,
            output_format: default_output_format(),
        }
    }

    pub fn batch(inputs: Vec<String>, settings: DetectionSettings, quality: Quality) -> Self {
        Self {
            inputs,
            detection_settings: settings,
            quality,
            output_format: default_output_format(),
        }
    }

    pub fn kind(&self) -> JobKind {
        if self.inputs.len() > 1 {
            JobKind::BatchProcessing
        } else {
            JobKind::VideoProcessing
        }
    }
}

/// A processing job. Times are seconds since the Unix epoch.
#[derive(Clone, Debug, Serialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: f64,
    pub created_at: f64,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub error_message: Option<String>,
    pub input: JobSpec,
    pub output: serde_json::Map<String, serde_json::Value>,
    pub total_frames: u64,
    pub processed_frames: u64,
    pub current_stage: String,
    pub estimated_completion: Option<f64>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: new_job_id(),
            kind: spec.kind(),
            status: JobStatus::Pending,
            progress: 0.0,
            created_at: now_secs(),
            started_at: None,
            completed_at: None,
            error_message: None,
            input: spec,
            output: serde_json::Map::new(),
            total_frames: 0,
            processed_frames: 0,
            current_stage: String::new(),
            estimated_completion: None,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(now_secs());
    }

    pub fn complete(&mut self, output: serde_json::Map<String, serde_json::Value>) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now_secs());
        self.progress = 100.0;
        self.output.extend(output);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(now_secs());
        self.error_message = Some(message.into());
    }

    pub fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now_secs());
    }

    pub fn update_progress(&mut self, progress: f64, stage: &str, processed_frames: Option<u64>) {
        self.update_progress_at(now_secs(), progress, stage, processed_frames);
    }

    fn update_progress_at(&mut self, now: f64, progress: f64, stage: &str, processed: Option<u64>) {
        self.progress = progress.clamp(0.0, 100.0);
        if !stage.is_empty() {
            self.current_stage = stage.to_string();
        }
        if let Some(processed) = processed {
            self.processed_frames = processed;
        }
        if let Some(started) = self.started_at {
            if self.progress > 0.0 {
                let elapsed = now - started;
                self.estimated_completion = Some(started + elapsed / self.progress * 100.0);
            }
        }
    }

    /// Seconds since start, up to completion if finished.
    pub fn duration(&self) -> f64 {
        match self.started_at {
            Some(started) => (self.completed_at.unwrap_or_else(now_secs) - started).max(0.0),
            None => 0.0,
        }
    }

    /// Seconds left, only while running.
    pub fn eta_seconds(&self) -> Option<f64> {
        match (self.status, self.estimated_completion) {
            (JobStatus::Running, Some(done)) => Some((done - now_secs()).max(0.0)),
            _ => None,
        }
    }

    /// Serialized job plus derived duration and ETA.
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(map) = value.as_object_mut() {
            map.insert("duration".into(), self.duration().into());
            map.insert("eta_seconds".into(), self.eta_seconds().into());
        }
        value
    }
}

/// Jobs by id plus a bounded submission history.
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<String, Job>,
    history: VecDeque<String>,
    max_history: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

impl JobQueue {
    pub fn new(max_history: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            history: VecDeque::new(),
            max_history: max_history.max(1),
        }
    }

    /// Add a job. When history overflows the oldest entry leaves it, and its
    /// job is forgotten too if it already finished.
    pub fn add(&mut self, job: Job) -> String {
        let id = job.id.clone();
        self.jobs.insert(id.clone(), job);
        self.history.push_back(id.clone());
        if self.history.len() > self.max_history {
            if let Some(old) = self.history.pop_front() {
                if self.jobs.get(&old).is_some_and(|j| j.status.is_terminal()) {
                    self.jobs.remove(&old);
                }
            }
        }
        id
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// All jobs, oldest first.
    pub fn all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        jobs
    }

    pub fn by_status(&self, status: JobStatus) -> Vec<&Job> {
        self.jobs.values().filter(|j| j.status == status).collect()
    }

    pub fn active(&self) -> Vec<&Job> {
        self.by_status(JobStatus::Running)
    }

    pub fn pending(&self) -> Vec<&Job> {
        self.by_status(JobStatus::Pending)
    }

    /// Cancel a pending or running job.
    pub fn cancel(&mut self, id: &str) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) if matches!(job.status, JobStatus::Pending | JobStatus::Running) => {
                job.cancel();
                true
            }
            _ => false,
        }
    }

    /// Forget finished jobs that completed more than `max_age` ago.
    pub fn cleanup_completed(&mut self, max_age: Duration) -> usize {
        let cutoff = now_secs() - max_age.as_secs_f64();
        let stale: Vec<String> = self
            .jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.completed_at.is_some_and(|t| t < cutoff))
            .map(|j| j.id.clone())
            .collect();
        for id in &stale {
            self.jobs.remove(id);
            self.history.retain(|h| h != id);
        }
        stale.len()
    }
}

/// Why a job could not be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    NotFound,
    NotPending(JobStatus),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::NotFound => f.write_str("job not found"),
            StartError::NotPending(status) => write!(f, "job is {:?}, not pending", status),
        }
    }
}

impl std::error::Error for StartError {}

/// Why a job output file could not be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    NotFound,
    NotCompleted(JobStatus),
    InvalidPath,
    MissingFile,
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::NotFound => f.write_str("job not found"),
            DownloadError::NotCompleted(status) => write!(f, "job is {:?}, not completed", status),
            DownloadError::InvalidPath => f.write_str("output path escapes the job directory"),
            DownloadError::MissingFile => f.write_str("no such output file"),
        }
    }
}

impl std::error::Error for DownloadError {}

/// Runs jobs from a shared queue on worker threads.
pub struct JobService {
    queue: Arc<Mutex<JobQueue>>,
    factory: ProcessorFactory,
    output_root: PathBuf,
    source_defaults: SourceSettings,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl JobService {
    pub fn new(
        factory: ProcessorFactory,
        output_root: PathBuf,
        source_defaults: SourceSettings,
        history_cap: usize,
    ) -> Self {
        Self {
            queue: Arc::new(Mutex::new(JobQueue::new(history_cap))),
            factory,
            output_root,
            source_defaults,
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn queue(&self) -> Result<MutexGuard<'_, JobQueue>> {
        lock_queue(&self.queue)
    }

    /// Validate and enqueue a job. It stays pending until [`JobService::start`].
    pub fn submit(&self, spec: JobSpec) -> Result<String> {
        if spec.inputs.is_empty() {
            return Err(anyhow!("job needs at least one input"));
        }
        for input in &spec.inputs {
            validate_input(input)?;
        }
        spec.output_format.parse::<OutputFormat>()?;
        let job = Job::new(spec);
        log::info!("job {} submitted ({:?})", job.id, job.kind);
        Ok(self.queue()?.add(job))
    }

    /// Start a pending job on its own worker thread.
    pub fn start(&self, id: &str) -> Result<()> {
        self.reap_finished()?;
        let spec = {
            let mut queue = self.queue()?;
            let job = queue.get_mut(id).ok_or(StartError::NotFound)?;
            if job.status != JobStatus::Pending {
                return Err(StartError::NotPending(job.status).into());
            }
            job.start();
            job.update_progress(0.0, "Opening input", None);
            job.input.clone()
        };

        let worker = Worker {
            id: id.to_string(),
            queue: self.queue.clone(),
            factory: self.factory.clone(),
            output_dir: self.output_root.join(id),
            source_defaults: self.source_defaults.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("streamsafe-job-{}", &id[..8.min(id.len())]))
            .spawn(move || worker.run(spec))
            .context("spawn job worker")?;
        self.workers
            .lock()
            .map_err(|_| anyhow!("worker lock poisoned"))?
            .insert(id.to_string(), handle);
        Ok(())
    }

    pub fn cancel(&self, id: &str) -> Result<bool> {
        let cancelled = self.queue()?.cancel(id);
        if cancelled {
            log::info!("job {} cancelled", id);
        }
        Ok(cancelled)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.queue()?.get(id).cloned())
    }

    pub fn list(&self) -> Result<Vec<Job>> {
        self.reap_finished()?;
        Ok(self.queue()?.all())
    }

    /// Resolve `relative` inside a completed job's output directory.
    pub fn output_file(&self, id: &str, relative: &str) -> Result<PathBuf> {
        let status = self
            .queue()?
            .get(id)
            .map(|job| job.status)
            .ok_or(DownloadError::NotFound)?;
        if status != JobStatus::Completed {
            return Err(DownloadError::NotCompleted(status).into());
        }
        let relative = Path::new(relative);
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if relative.as_os_str().is_empty() || !contained {
            return Err(DownloadError::InvalidPath.into());
        }
        let path = self.output_root.join(id).join(relative);
        if !path.is_file() {
            return Err(DownloadError::MissingFile.into());
        }
        Ok(path)
    }

    /// Join workers whose threads have already exited.
    fn reap_finished(&self) -> Result<()> {
        let finished: Vec<(String, JoinHandle<()>)> = {
            let mut workers = self
                .workers
                .lock()
                .map_err(|_| anyhow!("worker lock poisoned"))?;
            let done: Vec<String> = workers
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            done.into_iter()
                .filter_map(|id| workers.remove(&id).map(|handle| (id, handle)))
                .collect()
        };
        for (id, handle) in finished {
            if handle.join().is_err() {
                log::warn!("job worker {} panicked", id);
            }
        }
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.queue().map(|q| q.active().len()).unwrap_or(0)
    }

    pub fn cleanup_completed(&self, max_age: Duration) -> Result<usize> {
        Ok(self.queue()?.cleanup_completed(max_age))
    }

    /// Wait for a started job's worker to exit.
    pub fn join(&self, id: &str) -> Result<()> {
        let handle = self
            .workers
            .lock()
            .map_err(|_| anyhow!("worker lock poisoned"))?
            .remove(id);
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow!("job worker {} panicked", id))?;
        }
        Ok(())
    }

    /// Cancel everything still running and wait for the workers.
    pub fn shutdown(&self) -> Result<()> {
        let running: Vec<String> = self.queue()?.active().iter().map(|j| j.id.clone()).collect();
        for id in &running {
            self.cancel(id)?;
        }
        let ids: Vec<String> = self
            .workers
            .lock()
            .map_err(|_| anyhow!("worker lock poisoned"))?
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.join(&id)?;
        }
        Ok(())
    }
}

struct Worker {
    id: String,
    queue: Arc<Mutex<JobQueue>>,
    factory: ProcessorFactory,
    output_dir: PathBuf,
    source_defaults: SourceSettings,
}

enum Outcome {
    Finished(serde_json::Map<String, serde_json::Value>),
    Cancelled,
}

impl Worker {
    fn run(self, spec: JobSpec) {
        let outcome = self.process(&spec);
        let Ok(mut queue) = lock_queue(&self.queue) else {
            log::error!("job {}: queue lock poisoned", self.id);
            return;
        };
        let Some(job) = queue.get_mut(&self.id) else {
            return;
        };
        match outcome {
            Ok(Outcome::Finished(output)) if job.status == JobStatus::Running => {
                job.update_progress(100.0, "Completed", None);
                job.complete(output);
                log::info!("job {} completed: {} frames", self.id, job.processed_frames);
            }
            Ok(_) => log::info!("job {} stopped ({:?})", self.id, job.status),
            Err(e) => {
                log::warn!("job {} failed: {:#}", self.id, e);
                if job.status == JobStatus::Running {
                    job.fail(format!("{:#}", e));
                }
            }
        }
    }

    fn is_cancelled(&self) -> Result<bool> {
        let queue = lock_queue(&self.queue)?;
        Ok(queue
            .get(&self.id)
            .map(|j| j.status != JobStatus::Running)
            .unwrap_or(true))
    }

    fn update(&self, f: impl FnOnce(&mut Job)) -> Result<()> {
        let mut queue = lock_queue(&self.queue)?;
        if let Some(job) = queue.get_mut(&self.id) {
            f(job);
        }
        Ok(())
    }

    fn process(&self, spec: &JobSpec) -> Result<Outcome> {
        let inputs = spec.inputs.len();
        let format: OutputFormat = spec.output_format.parse()?;
        let mut outputs = Vec::with_capacity(inputs);
        let mut index_entries = Vec::with_capacity(inputs);
        let mut processed: u64 = 0;
        let mut detections: u64 = 0;
        let mut redacted: u64 = 0;

        for (index, input) in spec.inputs.iter().enumerate() {
            let mut source = ingest::open_source(input, &self.source_defaults)
                .with_context(|| format!("open input {}", input))?;
            source.connect().with_context(|| format!("connect input {}", input))?;
            let total = source.frame_count_hint();
            if let Some(total) = total {
                self.update(|job| job.total_frames += total)?;
            }

            let dir = if inputs == 1 {
                self.output_dir.clone()
            } else {
                self.output_dir.join(format!("{:03}", index + 1))
            };
            let mut sink = ImageSequenceSink::create(&dir, spec.quality)?.with_format(format);
            let mut processor = (self.factory)()?;
            let stage = format!("Processing input {}/{}", index + 1, inputs);
            let mut frames_in_input: u64 = 0;

            while let Some(mut frame) = source.next_frame()? {
                if self.is_cancelled()? {
                    sink.finish()?;
                    return Ok(Outcome::Cancelled);
                }
                let report = processor.process_frame(&mut frame, &spec.detection_settings);
                sink.write(&frame)?;

                frames_in_input += 1;
                processed += 1;
                detections += report.detection_count() as u64;
                redacted += report.redacted_regions as u64;

                let within = match total {
                    Some(total) if total > 0 => (frames_in_input as f64 / total as f64).min(1.0),
                    _ => 0.0,
                };
                let progress = (index as f64 + within) / inputs as f64 * 100.0;
                self.update(|job| job.update_progress(progress.min(99.0), &stage, Some(processed)))?;
            }

            let summary = sink.finish()?;
            if let Some(path) = summary.output {
                outputs.push(serde_json::Value::String(path.display().to_string()));
            }
            index_entries.push(serde_json::json!({
                "input": input,
                "dir": format!("{:03}", index + 1),
                "frames": frames_in_input,
            }));
        }

        // Batch outputs get a top-level manifest pointing at each input's directory.
        if inputs > 1 {
            let index = serde_json::json!({ "inputs": index_entries });
            let path = self.output_dir.join("manifest.json");
            let json = serde_json::to_vec_pretty(&index).context("serialize batch manifest")?;
            std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        }

        let mut output = serde_json::Map::new();
        output.insert("outputs".into(), serde_json::Value::Array(outputs));
        output.insert("frames".into(), processed.into());
        output.insert("detections".into(), detections.into());
        output.insert("redacted_regions".into(), redacted.into());
        Ok(Outcome::Finished(output))
    }
}

fn lock_queue(queue: &Mutex<JobQueue>) -> Result<MutexGuard<'_, JobQueue>> {
    queue.lock().map_err(|_| anyhow!("job queue lock poisoned"))
}

/// Video files must pass the upload checks; other inputs only need to exist.
fn validate_input(input: &str) -> Result<()> {
    if input.contains("://") {
        return Ok(());
    }
    let path = Path::new(input);
    let meta = std::fs::metadata(path).with_context(|| format!("input {} not found", input))?;
    if meta.is_dir() {
        return Ok(());
    }
    let is_image = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
    if is_image {
        return Ok(());
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(input);
    validate_video_file(name, meta.len()).map(|_| ())
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Random version-4 style UUID string.
fn new_job_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
