//! Destinations for redacted frames.
//!
//! Only redacted frames ever reach a sink.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::format::Quality;
use crate::frame::Frame;

pub trait FrameSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and report what was written. Called once after the last frame.
    fn finish(&mut self) -> Result<SinkSummary>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SinkSummary {
    pub frames_written: u64,
    pub output: Option<PathBuf>,
}

/// Discards frames; used for display-only live sessions.
#[derive(Default)]
pub struct NullSink {
    frames: u64,
}

impl FrameSink for NullSink {
    fn write(&mut self, _frame: &Frame) -> Result<()> {
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<SinkSummary> {
        Ok(SinkSummary {
            frames_written: self.frames,
            output: None,
        })
    }
}

/// Image encoding for sequence frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpg" | "jpeg" => Ok(OutputFormat::Jpeg),
            other => Err(anyhow!("unsupported output format '{}' (expected png or jpg)", other)),
        }
    }
}

#[derive(Serialize)]
struct ManifestEntry {
    file: String,
    sequence: u64,
    width: u32,
    height: u32,
    sha256: String,
}

#[derive(Serialize)]
struct Manifest<'a> {
    quality: Quality,
    format: OutputFormat,
    resolution: &'static str,
    fps: u32,
    frames: &'a [ManifestEntry],
}

/// Writes numbered frames (PNG unless told otherwise) plus a `manifest.json`
/// with per-file digests.
pub struct ImageSequenceSink {
    dir: PathBuf,
    quality: Quality,
    format: OutputFormat,
    entries: Vec<ManifestEntry>,
}

impl ImageSequenceSink {
    pub fn create(dir: &Path, quality: Quality) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create output dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            quality,
            format: OutputFormat::default(),
            entries: Vec::new(),
        })
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FrameSink for ImageSequenceSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let (w, h) = self.quality.fit(frame.width(), frame.height());
        let name = format!("frame_{:06}.{}", self.entries.len() + 1, self.format.extension());
        let path = self.dir.join(&name);
        let saved = if (w, h) == (frame.width(), frame.height()) {
            frame.image().save(&path)
        } else {
            imageops::resize(frame.image(), w, h, FilterType::Triangle).save(&path)
        };
        saved.with_context(|| format!("write {}", path.display()))?;

        let bytes = fs::read(&path).with_context(|| format!("read back {}", path.display()))?;
        self.entries.push(ManifestEntry {
            file: name,
            sequence: frame.sequence,
            width: w,
            height: h,
            sha256: hex::encode(Sha256::digest(&bytes)),
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<SinkSummary> {
        let manifest = Manifest {
            quality: self.quality,
            format: self.format,
            resolution: self.quality.resolution(),
            fps: self.quality.fps(),
            frames: &self.entries,
        };
        let path = self.dir.join("manifest.json");
        let json = serde_json::to_vec_pretty(&manifest).context("serialize manifest")?;
        fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(SinkSummary {
            frames_written: self.entries.len() as u64,
            output: Some(self.dir.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn sequence_sink_scales_and_records_digests() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("job");
        let mut sink = ImageSequenceSink::create(&out, Quality::Low)?;
        sink.write(&Frame::new(RgbImage::new(1280, 720), 1))?;
        sink.write(&Frame::new(RgbImage::new(320, 240), 2))?;
        let summary = sink.finish()?;
        assert_eq!(summary.frames_written, 2);
        assert_eq!(summary.output.as_deref(), Some(out.as_path()));

        let first = image::open(out.join("frame_000001.png"))?;
        assert_eq!((first.width(), first.height()), (853, 480));

        let manifest: serde_json::Value =
            serde_json::from_slice(&fs::read(out.join("manifest.json"))?)?;
        assert_eq!(manifest["quality"], "low");
        let frames = manifest["frames"].as_array().cloned().unwrap_or_default();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["sequence"], 2);
        assert_eq!(frames[0]["sha256"].as_str().map(str::len), Some(64));
        Ok(())
    }

    #[test]
    fn sequence_sink_writes_jpeg_when_asked() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("jpeg");
        let mut sink = ImageSequenceSink::create(&out, Quality::Medium)?.with_format("JPEG".parse()?);
        sink.write(&Frame::new(RgbImage::new(64, 48), 1))?;
        sink.finish()?;

        let bytes = fs::read(out.join("frame_000001.jpg"))?;
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let manifest: serde_json::Value =
            serde_json::from_slice(&fs::read(out.join("manifest.json"))?)?;
        assert_eq!(manifest["format"], "jpeg");
        assert_eq!(manifest["frames"][0]["file"], "frame_000001.jpg");
        Ok(())
    }

    #[test]
    fn output_format_names() -> Result<()> {
        assert_eq!("png".parse::<OutputFormat>()?, OutputFormat::Png);
        assert_eq!("jpg".parse::<OutputFormat>()?, OutputFormat::Jpeg);
        assert!("gif".parse::<OutputFormat>().is_err());
        assert!("mp4".parse::<OutputFormat>().is_err());
        Ok(())
    }

    #[test]
    fn null_sink_counts() -> Result<()> {
        let mut sink = NullSink::default();
        sink.write(&Frame::new(RgbImage::new(2, 2), 1))?;
        assert_eq!(sink.finish()?.frames_written, 1);
        Ok(())
    }
}
