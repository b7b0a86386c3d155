// src/main.rs

mod aggregator;
mod api_client;
mod config;
mod counting;
mod data_logger;
mod detection;
mod pipeline;
mod tracker;
mod types;
mod video_source;

use aggregator::CountAggregator;
use anyhow::{Context, Result};
use api_client::ApiClient;
use counting::{LineCounter, ZoneSet};
use data_logger::DataLogger;
use detection::{DetectionAdapter, NullDetector, ReplayDetector, VehicleDetect};
use pipeline::{PipelineCoordinator, PipelineMetrics};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracker::VehicleTracker;
use tracing::{info, warn};
use types::{Config, DetectorKind};
use video_source::{spawn_acquisition, FrameQueue, RawVideoSource};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "vehicle_counter={}",
                    config.logging.level
                ))
            }),
        )
        .init();

    info!("🚗 Vehicle Counting System Starting");
    info!("✓ Configuration loaded from {}", config_path);

    // Line geometry is validated before any frame is processed — a broken
    // setup is a startup failure, not a runtime surprise.
    let zones = ZoneSet::load(&config.counting.line_config)?;
    info!(
        "✓ {} counting zone(s) loaded from {}",
        zones.zone_count(),
        config.counting.line_config
    );

    let detector: Box<dyn VehicleDetect> = match config.detector.kind {
        DetectorKind::Replay => {
            let path = config
                .detector
                .path
                .as_deref()
                .context("detector.path is required for kind: replay")?;
            info!("✓ Replaying detections from {}", path);
            Box::new(ReplayDetector::load(path)?)
        }
        DetectorKind::None => {
            warn!("No detector configured — continuing without object detection");
            Box::new(NullDetector)
        }
    };

    let metrics = Arc::new(PipelineMetrics::new());
    let adapter = DetectionAdapter::new(detector, &config.detector, metrics.clone());
    let tracker = VehicleTracker::new(config.tracker.clone());
    let counter = LineCounter::new(zones, config.counting.anchor);
    let logger = DataLogger::new(&config.logging, &config.camera)?;
    let api = ApiClient::new(&config.api, &config.camera, metrics.clone())?;
    info!("✓ Pipeline components ready");

    let source = RawVideoSource::open(&config.source)?;
    let queue = FrameQueue::new(config.pipeline.queue_capacity, metrics.clone());
    let stop = Arc::new(AtomicBool::new(false));

    {
        let stop = stop.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal, stopping...");
                stop.store(true, Ordering::Relaxed);
                queue.close();
            }
        });
    }

    let producer = spawn_acquisition(Box::new(source), queue.clone(), stop.clone());

    let mut coordinator = PipelineCoordinator::new(
        config,
        adapter,
        tracker,
        counter,
        CountAggregator::new(),
        logger,
        api,
        metrics,
        stop,
    );
    let summary = coordinator.run(queue).await?;
    producer.await?;

    info!("========================================");
    info!("Run summary");
    info!("  Frames processed: {}", summary.total_frames);
    info!("  Average FPS: {:.1}", summary.fps);
    info!("  Vehicles counted: {}", summary.crossings_total);
    info!("  Tracks spawned: {}", summary.tracks_spawned);
    info!(
        "  Frames dropped/skipped/reordered: {}/{}/{}",
        summary.frames_dropped, summary.frames_skipped, summary.out_of_order_frames
    );
    if summary.detector_failures > 0 || summary.detector_timeouts > 0 {
        warn!(
            "  Detector failures/timeouts: {}/{}",
            summary.detector_failures, summary.detector_timeouts
        );
    }
    info!("========================================");

    Ok(())
}
