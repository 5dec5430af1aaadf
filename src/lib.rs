//! StreamSafe
//!
//! Privacy redaction for live video and recorded footage. Frames flow from a
//! source through a processor that finds privacy-sensitive regions and blurs
//! them in place before anything is written or previewed.
//!
//! # Detection
//!
//! Three kinds of content are redacted, each toggled independently:
//!
//! 1. **License plates**: YOLO model (ONNX through tract) or fixed fallback regions, every frame.
//! 2. **Block numbers**: OCR on a thresholded grayscale frame, every 30th frame.
//! 3. **Street signs**: HSV color masking for green signs, every 15th frame.
//!
//! Detectors that run on a cadence keep their last regions, which are blurred
//! on every frame in between.
//!
//! # Module Structure
//!
//! - `frame`, `region`, `redact`: pixel buffers, rectangles, blur
//! - `detect`, `ocr`: detector backends and their registry
//! - `processor`: per-kind scheduling and redaction
//! - `ingest`, `sink`: frame sources and outputs
//! - `live`, `jobs`: threaded live sessions and background processing jobs
//! - `api`, `client`: HTTP control surface and its client
//! - `config`, `format`, `ui`: configuration, human formatting, terminal output

pub mod api;
pub mod client;
pub mod config;
pub mod detect;
pub mod format;
pub mod frame;
pub mod ingest;
pub mod jobs;
pub mod live;
pub mod ocr;
pub mod processor;
pub mod redact;
pub mod region;
pub mod settings;
pub mod sink;
pub mod ui;

pub use api::{ApiConfig, ApiHandle, ApiServer, ApiState};
pub use client::{ApiError, StreamSafeClient};
pub use config::StreamSafeConfig;
pub use detect::{BackendRegistry, Detection, DetectorBackend};
pub use format::Quality;
pub use frame::Frame;
pub use ingest::{open_source, FrameSource};
pub use jobs::{Job, JobKind, JobQueue, JobService, JobSpec, JobStatus};
pub use live::{Feed, LiveManager, LiveSession, LiveSessionConfig, LiveStreamState, StreamMetrics};
pub use processor::{FrameReport, ProcessorFactory, StreamSafeProcessor};
pub use redact::{redact_region, BlurKind};
pub use region::Region;
pub use settings::{DetectionKind, DetectionSettings};
pub use sink::{FrameSink, ImageSequenceSink, NullSink};
