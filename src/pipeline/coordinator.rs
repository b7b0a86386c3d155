// src/pipeline/coordinator.rs
//
// Frame Pipeline Coordinator. Drives the per-frame sequence:
// detect → track → crossing evaluation → aggregation → dispatch.
//
// Frames are processed in strictly increasing frame_index order — motion
// prediction and the previous/current crossing comparison both depend on
// it. Gaps are normal frame loss; reordered frames are dropped. When a
// frame blows the processing budget the next queued frame is skipped,
// trading completeness for liveness.

use crate::aggregator::{CountAggregator, CountsSnapshot};
use crate::api_client::ApiClient;
use crate::counting::LineCounter;
use crate::data_logger::DataLogger;
use crate::detection::DetectionAdapter;
use crate::pipeline::metrics::{MetricsSummary, PipelineMetrics};
use crate::tracker::VehicleTracker;
use crate::types::{Config, Frame};
use crate::video_source::FrameQueue;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub struct PipelineCoordinator {
    config: Config,
    adapter: DetectionAdapter,
    tracker: VehicleTracker,
    counter: LineCounter,
    aggregator: CountAggregator,
    logger: DataLogger,
    api: Option<ApiClient>,
    metrics: Arc<PipelineMetrics>,
    stop: Arc<AtomicBool>,
    last_frame_index: Option<u64>,
    skip_next: bool,
    frames_since_snapshot: u64,
}

impl PipelineCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        adapter: DetectionAdapter,
        tracker: VehicleTracker,
        counter: LineCounter,
        aggregator: CountAggregator,
        logger: DataLogger,
        api: Option<ApiClient>,
        metrics: Arc<PipelineMetrics>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            adapter,
            tracker,
            counter,
            aggregator,
            logger,
            api,
            metrics,
            stop,
            last_frame_index: None,
            skip_next: false,
            frames_since_snapshot: 0,
        }
    }

    /// Consume the frame queue until the source is exhausted or a stop is
    /// requested, then drain.
    pub async fn run(&mut self, queue: Arc<FrameQueue>) -> Result<MetricsSummary> {
        info!(
            "Pipeline started: {} counting zone(s) configured",
            self.counter.zones().zone_count()
        );

        while let Some((frame_index, frame)) = queue.pop().await {
            if self.stop.load(Ordering::Relaxed) {
                info!(
                    "Stop requested, abandoning {} queued frame(s)",
                    queue.len()
                );
                break;
            }
            self.process_frame(frame_index, frame);
        }

        self.drain().await;
        Ok(self.metrics.summary())
    }

    /// One full pass through the pipeline for one frame.
    pub fn process_frame(&mut self, frame_index: u64, frame: Frame) {
        if let Some(last) = self.last_frame_index {
            if frame_index <= last {
                warn!(
                    "Out-of-order frame {} (last processed {}), dropping",
                    frame_index, last
                );
                self.metrics.inc(&self.metrics.out_of_order_frames);
                return;
            }
        }

        if self.skip_next {
            self.skip_next = false;
            debug!("Skipping frame {} to recover the frame budget", frame_index);
            self.metrics.inc(&self.metrics.frames_skipped);
            self.last_frame_index = Some(frame_index);
            return;
        }

        let started = Instant::now();
        let frame = Arc::new(frame);

        let detect_started = Instant::now();
        let detections = self.adapter.detect(frame_index, &frame);
        self.metrics.set_timing(
            &self.metrics.detect_time_us,
            detect_started.elapsed().as_micros() as u64,
        );
        self.metrics
            .add(&self.metrics.detections_total, detections.len() as u64);

        let track_started = Instant::now();
        self.tracker.update(frame_index, &detections);
        self.metrics.set_timing(
            &self.metrics.track_time_us,
            track_started.elapsed().as_micros() as u64,
        );
        self.metrics
            .tracks_spawned
            .store(self.tracker.total_spawned(), Ordering::Relaxed);

        let events = self.counter.update(frame_index, self.tracker.tracks_mut());
        for event in &events {
            self.aggregator.apply(event);
            self.metrics.inc(&self.metrics.crossings_total);
            info!(
                "Count: zone='{}' class={} direction={} total={}",
                event.zone_id,
                event.class.as_str(),
                event.direction.as_str(),
                self.aggregator.total()
            );
            if let Err(e) = self.logger.log_crossing(event, self.aggregator.total()) {
                error!("Failed to write event log: {:#}", e);
            }
        }
        if !events.is_empty() {
            if let Some(api) = &mut self.api {
                api.push_events(events, self.aggregator.snapshot());
            }
        }

        self.frames_since_snapshot += 1;
        if self.config.pipeline.snapshot_interval_frames > 0
            && self.frames_since_snapshot >= self.config.pipeline.snapshot_interval_frames
        {
            self.frames_since_snapshot = 0;
            match self.logger.log_snapshot(&self.aggregator.snapshot()) {
                Ok(()) => self.metrics.inc(&self.metrics.snapshots_written),
                Err(e) => error!("Failed to write count snapshot: {:#}", e),
            }
        }

        self.metrics.inc(&self.metrics.total_frames);
        self.last_frame_index = Some(frame_index);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms > self.config.pipeline.max_frame_latency_ms {
            warn!(
                "Frame {} took {}ms (budget {}ms), will skip the next frame",
                frame_index, elapsed_ms, self.config.pipeline.max_frame_latency_ms
            );
            self.skip_next = true;
        }
    }

    /// Graceful shutdown: unfinished tracks are dropped without emitting
    /// crossings, the final counts go to the sink and the API, and the run
    /// summary is logged.
    async fn drain(&mut self) {
        let leftover = self.tracker.tracks().len();
        if leftover > 0 {
            info!("Dropping {} unfinished track(s)", leftover);
        }

        let snapshot = self.aggregator.snapshot();
        match self.logger.log_snapshot(&snapshot) {
            Ok(()) => self.metrics.inc(&self.metrics.snapshots_written),
            Err(e) => error!("Failed to write final snapshot: {:#}", e),
        }

        if let Some(api) = &self.api {
            let bound = Duration::from_secs(self.config.api.timeout_secs + 5);
            let handle = api.push_final(snapshot.clone());
            if tokio::time::timeout(bound, handle).await.is_err() {
                warn!("Final API push did not finish within {:?}", bound);
            }
        }

        info!(
            "Pipeline drained: {} frames processed, {} vehicles counted",
            self.metrics
                .total_frames
                .load(Ordering::Relaxed),
            snapshot.total
        );
    }

    pub fn counts(&self) -> CountsSnapshot {
        self.aggregator.snapshot()
    }
}
