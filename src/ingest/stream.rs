use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use url::Url;

use super::{FrameSource, SourceStats};
use crate::config::SourceSettings;
use crate::frame::Frame;

/// Video files and network streams decoded by GStreamer.
///
/// Pipeline: `uridecodebin ! videoconvert ! video/x-raw,format=RGB ! appsink`.
/// Live sources (`rtsp://`) drop stale buffers; files deliver every frame.
pub struct GstreamerSource {
    uri: String,
    target_fps: u32,
    live: bool,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

impl GstreamerSource {
    pub fn new(uri: &str, settings: &SourceSettings) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let uri = to_gst_uri(uri)?;
        let live = uri.starts_with("rtsp://") || uri.starts_with("rtsps://");
        let pipeline_description = format!(
            "uridecodebin uri={} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink",
            uri
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build decode pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("decode pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_sync(false);
        if live {
            appsink.set_max_buffers(1);
            appsink.set_drop(true);
        } else {
            appsink.set_max_buffers(4);
            appsink.set_drop(false);
        }

        Ok(Self {
            uri,
            target_fps: settings.target_fps,
            live,
            pipeline,
            appsink,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    fn frame_timeout(&self) -> gstreamer::ClockTime {
        let base_ms = if self.target_fps == 0 {
            500
        } else {
            (1000 / self.target_fps).saturating_mul(4)
        };
        // Files may need longer to preroll than a live camera.
        let floor = if self.live { 500 } else { 5_000 };
        gstreamer::ClockTime::from_mseconds(base_ms.max(floor) as u64)
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.target_fps == 0 {
            2_000
        } else {
            (1000 / self.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    /// Drain bus messages. Returns true once the stream has ended.
    fn poll_bus(&mut self) -> bool {
        let Some(bus) = self.pipeline.bus() else {
            return false;
        };
        let mut eos = false;
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => eos = true,
                _ => {}
            }
        }
        eos
    }
}

impl FrameSource for GstreamerSource {
    fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set decode pipeline to Playing")?;
        self.connected_at = Some(Instant::now());
        log::info!("GstreamerSource: connected to {}", self.uri);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let eos = self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("{}", err));
        }

        let sample = match self.appsink.try_pull_sample(self.frame_timeout()) {
            Some(sample) => sample,
            None if eos || self.appsink.is_eos() => return Ok(None),
            None => return Err(anyhow!("stream {} stalled", self.uri)),
        };
        let (pixels, width, height) = sample_to_pixels(&sample)?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(Frame::from_rgb(pixels, width, height, self.frame_count)?))
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            uri: self.uri.clone(),
        }
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

/// Local paths become `file://` URIs; anything with a scheme passes through.
fn to_gst_uri(uri: &str) -> Result<String> {
    if uri.contains("://") {
        return Ok(uri.to_string());
    }
    let path = Path::new(uri);
    let absolute = path
        .canonicalize()
        .with_context(|| format!("video file {} not found", path.display()))?;
    Url::from_file_path(&absolute)
        .map(|url| url.to_string())
        .map_err(|_| anyhow!("cannot build a file uri for {}", absolute.display()))
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return data
            .get(..row_bytes * height as usize)
            .map(|pixels| (pixels.to_vec(), width, height))
            .context("buffer shorter than frame");
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).context("buffer row is out of bounds")?);
    }

    Ok((pixels, width, height))
}
