// src/pipeline/metrics.rs
//
// Production observability. Tracks timing, counts, and rates for every
// pipeline stage. Export via logs or the final run summary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_frames: Arc<AtomicU64>,
    pub frames_dropped: Arc<AtomicU64>,
    pub frames_skipped: Arc<AtomicU64>,
    pub out_of_order_frames: Arc<AtomicU64>,
    pub detections_total: Arc<AtomicU64>,
    pub detector_failures: Arc<AtomicU64>,
    pub detector_timeouts: Arc<AtomicU64>,
    pub tracks_spawned: Arc<AtomicU64>,
    pub crossings_total: Arc<AtomicU64>,
    pub snapshots_written: Arc<AtomicU64>,
    pub api_successes: Arc<AtomicU64>,
    pub api_failures: Arc<AtomicU64>,
    pub detect_time_us: Arc<AtomicU64>,
    pub track_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            total_frames: Arc::new(AtomicU64::new(0)),
            frames_dropped: Arc::new(AtomicU64::new(0)),
            frames_skipped: Arc::new(AtomicU64::new(0)),
            out_of_order_frames: Arc::new(AtomicU64::new(0)),
            detections_total: Arc::new(AtomicU64::new(0)),
            detector_failures: Arc::new(AtomicU64::new(0)),
            detector_timeouts: Arc::new(AtomicU64::new(0)),
            tracks_spawned: Arc::new(AtomicU64::new(0)),
            crossings_total: Arc::new(AtomicU64::new(0)),
            snapshots_written: Arc::new(AtomicU64::new(0)),
            api_successes: Arc::new(AtomicU64::new(0)),
            api_failures: Arc::new(AtomicU64::new(0)),
            detect_time_us: Arc::new(AtomicU64::new(0)),
            track_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.total_frames.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_frames: self.total_frames.load(Ordering::Relaxed),
            fps: self.fps(),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            out_of_order_frames: self.out_of_order_frames.load(Ordering::Relaxed),
            detections_total: self.detections_total.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            detector_timeouts: self.detector_timeouts.load(Ordering::Relaxed),
            tracks_spawned: self.tracks_spawned.load(Ordering::Relaxed),
            crossings_total: self.crossings_total.load(Ordering::Relaxed),
            snapshots_written: self.snapshots_written.load(Ordering::Relaxed),
            api_successes: self.api_successes.load(Ordering::Relaxed),
            api_failures: self.api_failures.load(Ordering::Relaxed),
            last_detect_us: self.detect_time_us.load(Ordering::Relaxed),
            last_track_us: self.track_time_us.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub total_frames: u64,
    pub fps: f64,
    pub frames_dropped: u64,
    pub frames_skipped: u64,
    pub out_of_order_frames: u64,
    pub detections_total: u64,
    pub detector_failures: u64,
    pub detector_timeouts: u64,
    pub tracks_spawned: u64,
    pub crossings_total: u64,
    pub snapshots_written: u64,
    pub api_successes: u64,
    pub api_failures: u64,
    pub last_detect_us: u64,
    pub last_track_us: u64,
    pub elapsed_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = PipelineMetrics::new();
        metrics.inc(&metrics.total_frames);
        metrics.inc(&metrics.total_frames);
        metrics.add(&metrics.detections_total, 5);

        let summary = metrics.summary();
        assert_eq!(summary.total_frames, 2);
        assert_eq!(summary.detections_total, 5);
        assert_eq!(summary.crossings_total, 0);
    }
}
