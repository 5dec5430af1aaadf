//! Frame ingestion sources.
//!
//! - `stub://name[?frames=N]`: synthetic street scene (tests, demos)
//! - a local image file or a directory of images
//! - video files and network streams through GStreamer (feature: ingest-gstreamer)
//!
//! Sources decode in memory and hand frames to the caller. They MUST NOT
//! write frames to disk or forward them anywhere else.

#[cfg(feature = "ingest-gstreamer")]
mod stream;
mod images;
mod synthetic;

use std::path::Path;

use anyhow::{anyhow, Result};

use crate::config::SourceSettings;
use crate::frame::Frame;

#[cfg(feature = "ingest-gstreamer")]
pub use stream::GstreamerSource;
pub use images::{ImageSource, IMAGE_EXTENSIONS};
pub use synthetic::SyntheticSource;

/// A producer of frames.
pub trait FrameSource: Send {
    fn connect(&mut self) -> Result<()>;

    /// Next frame, or `None` once the stream has ended.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;

    /// Total frames, when the source knows it up front.
    fn frame_count_hint(&self) -> Option<u64> {
        None
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub uri: String,
}

/// Open the source named by `uri`. The source is not connected yet.
pub fn open_source(uri: &str, settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(anyhow!("source uri is empty"));
    }
    if uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(uri, settings)?));
    }
    if !uri.contains("://") {
        let path = Path::new(uri);
        if path.is_dir() || images::is_image_path(path) {
            return Ok(Box::new(ImageSource::new(path)?));
        }
    }
    open_stream(uri, settings)
}

#[cfg(feature = "ingest-gstreamer")]
fn open_stream(uri: &str, settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(GstreamerSource::new(uri, settings)?))
}

#[cfg(not(feature = "ingest-gstreamer"))]
fn open_stream(uri: &str, _settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "source '{}' requires the ingest-gstreamer feature",
        uri
    ))
}
