use std::time::{Duration, Instant};

use serde::Serialize;

use crate::settings::DetectionSettings;

/// Running statistics of one live stream.
#[derive(Clone, Debug, Default)]
pub struct LiveStreamState {
    pub is_streaming: bool,
    /// Instantaneous rate from the gap between the last two frames.
    pub fps: f64,
    /// Processing time of the last frame, in milliseconds.
    pub latency_ms: f64,
    /// Detections since the stream was last started.
    pub detection_count: u64,
    pub total_detections: u64,
    pub frame_count: u64,
    /// Running mean of per-frame processing time, in seconds.
    pub avg_processing_time: f64,
    pub dropped_frames: u64,
    started_at: Option<Instant>,
    last_frame_at: Option<Instant>,
}

impl LiveStreamState {
    pub fn start(&mut self) {
        self.is_streaming = true;
        self.started_at = Some(Instant::now());
        self.frame_count = 0;
        self.detection_count = 0;
    }

    pub fn stop(&mut self) {
        self.is_streaming = false;
        self.started_at = None;
        self.last_frame_at = None;
        self.fps = 0.0;
        self.latency_ms = 0.0;
    }

    pub fn update_frame_stats(&mut self, processing: Duration, detections: u64) {
        self.update_frame_stats_at(Instant::now(), processing, detections);
    }

    pub fn update_frame_stats_at(&mut self, now: Instant, processing: Duration, detections: u64) {
        if let Some(last) = self.last_frame_at {
            let gap = now.saturating_duration_since(last).as_secs_f64();
            if gap > 0.0 {
                self.fps = 1.0 / gap;
            }
        }
        self.last_frame_at = Some(now);
        self.frame_count += 1;
        self.detection_count += detections;
        self.total_detections += detections;

        let secs = processing.as_secs_f64();
        if secs > 0.0 {
            let n = self.frame_count as f64;
            self.avg_processing_time = (self.avg_processing_time * (n - 1.0) + secs) / n;
            self.latency_ms = secs * 1000.0;
        }
    }

    pub fn record_dropped(&mut self) {
        self.dropped_frames += 1;
    }

    pub fn duration(&self) -> Duration {
        self.started_at
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    pub fn average_fps(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs > 0.0 && self.frame_count > 0 {
            self.frame_count as f64 / secs
        } else {
            0.0
        }
    }

    pub fn detections_per_second(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs > 0.0 {
            self.total_detections as f64 / secs
        } else {
            0.0
        }
    }

    pub fn snapshot(&self, settings: DetectionSettings, source: &str) -> LiveSnapshot {
        LiveSnapshot {
            is_streaming: self.is_streaming,
            source: source.to_string(),
            fps: self.fps,
            latency_ms: self.latency_ms,
            detection_count: self.detection_count,
            total_detections: self.total_detections,
            frame_count: self.frame_count,
            dropped_frames: self.dropped_frames,
            stream_duration_secs: self.duration().as_secs_f64(),
            average_fps: self.average_fps(),
            detections_per_second: self.detections_per_second(),
            avg_processing_ms: self.avg_processing_time * 1000.0,
            detection_settings: settings,
        }
    }
}

/// Serializable view of a live stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LiveSnapshot {
    pub is_streaming: bool,
    pub source: String,
    pub fps: f64,
    pub latency_ms: f64,
    pub detection_count: u64,
    pub total_detections: u64,
    pub frame_count: u64,
    pub dropped_frames: u64,
    pub stream_duration_secs: f64,
    pub average_fps: f64,
    pub detections_per_second: f64,
    pub avg_processing_ms: f64,
    pub detection_settings: DetectionSettings,
}
