//! Display formatting, output quality presets and upload validation.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub const MAX_VIDEO_BYTES: u64 = 100 * 1024 * 1024;
pub const VIDEO_EXTENSIONS: [&str; 7] = ["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm"];

pub fn format_fps(fps: f64) -> String {
    if fps >= 1.0 {
        format!("{:.1}", fps)
    } else if fps > 0.0 {
        format!("{:.2}", fps)
    } else {
        "0.0".to_string()
    }
}

pub fn format_latency(latency_ms: f64) -> String {
    if latency_ms >= 1000.0 {
        format!("{:.1}s", latency_ms / 1000.0)
    } else {
        format!("{:.0}ms", latency_ms)
    }
}

pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.0}s", seconds)
    } else if seconds < 3600.0 {
        let total = seconds as u64;
        format!("{}m {}s", total / 60, total % 60)
    } else {
        let total = seconds as u64;
        format!("{}h {}m", total / 3600, (total % 3600) / 60)
    }
}

pub fn format_file_size(size_bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if size_bytes == 0 {
        return "0B".to_string();
    }
    let mut unit = 0;
    let mut scaled = size_bytes as f64;
    while scaled >= 1024.0 && unit < UNITS.len() - 1 {
        scaled /= 1024.0;
        unit += 1;
    }
    let rounded = (scaled * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        format!("{:.1} {}", rounded, UNITS[unit])
    } else {
        format!("{} {}", rounded, UNITS[unit])
    }
}

pub fn format_bitrate(bitrate_bps: u64) -> String {
    if bitrate_bps >= 1_000_000 {
        format!("{:.1} Mbps", bitrate_bps as f64 / 1_000_000.0)
    } else if bitrate_bps >= 1_000 {
        format!("{:.0} Kbps", bitrate_bps as f64 / 1_000.0)
    } else {
        format!("{} bps", bitrate_bps)
    }
}

/// Seconds left at the current rate, for progress strictly between 0 and 100.
pub fn calculate_eta(progress: f64, elapsed_seconds: f64) -> Option<f64> {
    if progress <= 0.0 || progress >= 100.0 || elapsed_seconds <= 0.0 {
        return None;
    }
    let rate = progress / elapsed_seconds;
    Some((100.0 - progress) / rate)
}

pub fn format_eta(eta_seconds: Option<f64>) -> String {
    match eta_seconds {
        Some(eta) if eta > 0.0 => format_duration(eta),
        _ => "Unknown".to_string(),
    }
}

pub fn format_detection_count(count: u64) -> String {
    if count >= 1_000_000 {
        format!("{:.1}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.1}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

/// Frames per second achieved so far.
pub fn processing_speed(frames_processed: u64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds <= 0.0 {
        return 0.0;
    }
    frames_processed as f64 / elapsed_seconds
}

pub fn estimate_processing_time(total_frames: u64, current_fps: f64) -> f64 {
    if current_fps <= 0.0 {
        return 0.0;
    }
    total_frames as f64 / current_fps
}

pub fn truncate_text(text: &str, max_length: usize) -> String {
    if text.chars().count() <= max_length {
        return text.to_string();
    }
    let keep = max_length.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Replace path-hostile characters, drop control characters, cap at 255 chars keeping the extension.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| (*c as u32) >= 32)
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    if cleaned.chars().count() <= 255 {
        return cleaned;
    }
    match cleaned.rsplit_once('.') {
        Some((stem, ext)) => {
            let max_stem = 255usize.saturating_sub(ext.chars().count() + 1);
            let stem: String = stem.chars().take(max_stem).collect();
            format!("{}.{}", stem, ext)
        }
        None => cleaned.chars().take(255).collect(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidatedVideo {
    pub size: u64,
    pub formatted_size: String,
}

/// Check an upload's name and size against the accepted video formats.
pub fn validate_video_file(file_name: &str, size_bytes: u64) -> Result<ValidatedVideo> {
    if size_bytes > MAX_VIDEO_BYTES {
        return Err(anyhow!(
            "File too large. Maximum size is {}",
            format_file_size(MAX_VIDEO_BYTES)
        ));
    }
    let lower = file_name.to_lowercase();
    if !VIDEO_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{}", ext)))
    {
        let supported: Vec<String> = VIDEO_EXTENSIONS.iter().map(|e| format!(".{}", e)).collect();
        return Err(anyhow!(
            "Invalid file type. Supported: {}",
            supported.join(", ")
        ));
    }
    Ok(ValidatedVideo {
        size: size_bytes,
        formatted_size: format_file_size(size_bytes),
    })
}

/// Output quality presets for processed video.
///
/// Deserializing is lenient like [`Quality::parse_or_default`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
    Ultra,
}

impl Quality {
    /// Lenient parse: unknown names fall back to medium.
    pub fn parse_or_default(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }

    pub fn resolution(&self) -> &'static str {
        match self {
            Quality::Low => "480p",
            Quality::Medium => "720p",
            Quality::High => "1080p",
            Quality::Ultra => "4K",
        }
    }

    pub fn max_height(&self) -> u32 {
        match self {
            Quality::Low => 480,
            Quality::Medium => 720,
            Quality::High => 1080,
            Quality::Ultra => 2160,
        }
    }

    pub fn bitrate(&self) -> u64 {
        match self {
            Quality::Low => 1_000_000,
            Quality::Medium => 3_000_000,
            Quality::High => 8_000_000,
            Quality::Ultra => 20_000_000,
        }
    }

    pub fn fps(&self) -> u32 {
        match self {
            Quality::Low => 24,
            _ => 30,
        }
    }

    /// Output size for a `width` x `height` input: downscaled to the preset height, never upscaled.
    pub fn fit(&self, width: u32, height: u32) -> (u32, u32) {
        let max_h = self.max_height();
        if height <= max_h || height == 0 {
            return (width, height);
        }
        let scaled_w = (width as u64 * max_h as u64 / height as u64).max(1) as u32;
        (scaled_w, max_h)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
            Quality::Ultra => "ultra",
        })
    }
}

impl<'de> Deserialize<'de> for Quality {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Quality::parse_or_default(&name))
    }
}

impl FromStr for Quality {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            "ultra" => Ok(Quality::Ultra),
            other => Err(anyhow!("unknown quality '{}'", other)),
        }
    }
}
