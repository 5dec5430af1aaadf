use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

pub const METRICS_HISTORY_CAP: usize = 1000;

#[derive(Clone, Copy, Debug)]
pub struct MetricPoint {
    pub fps: f64,
    pub latency_ms: f64,
    pub detections: u64,
    pub at: Instant,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct MetricAverages {
    pub fps: f64,
    pub latency_ms: f64,
    pub detections: f64,
}

/// Bounded history of per-frame metrics, oldest evicted first.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    history: VecDeque<MetricPoint>,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, fps: f64, latency_ms: f64, detections: u64) {
        self.push(MetricPoint {
            fps,
            latency_ms,
            detections,
            at: Instant::now(),
        });
    }

    pub fn push(&mut self, point: MetricPoint) {
        self.history.push_back(point);
        while self.history.len() > METRICS_HISTORY_CAP {
            self.history.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Points recorded within the last `window`.
    pub fn recent(&self, window: Duration) -> Vec<MetricPoint> {
        let now = Instant::now();
        self.history
            .iter()
            .filter(|p| now.saturating_duration_since(p.at) <= window)
            .copied()
            .collect()
    }

    pub fn average(&self, window: Duration) -> MetricAverages {
        let recent = self.recent(window);
        if recent.is_empty() {
            return MetricAverages::default();
        }
        let n = recent.len() as f64;
        MetricAverages {
            fps: recent.iter().map(|p| p.fps).sum::<f64>() / n,
            latency_ms: recent.iter().map(|p| p.latency_ms).sum::<f64>() / n,
            detections: recent.iter().map(|p| p.detections as f64).sum::<f64>() / n,
        }
    }
}
