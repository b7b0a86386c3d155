// src/data_logger.rs
//
// Append-only logging sink: one CSV row per crossing event plus periodic
// JSON count snapshots. Both files survive process restarts — we only ever
// append, and the CSV header is written just once for a fresh file.

use crate::aggregator::CountsSnapshot;
use crate::types::{CameraConfig, CrossingEvent, LoggingConfig};
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const EVENT_CSV_HEADER: &str =
    "timestamp,date,time,location_id,camera_id,zone_id,class,direction,track_id,frame_index,total\n";

pub struct DataLogger {
    enabled: bool,
    event_log: PathBuf,
    snapshot_log: PathBuf,
    location_id: String,
    camera_id: String,
}

impl DataLogger {
    pub fn new(config: &LoggingConfig, camera: &CameraConfig) -> Result<Self> {
        let logger = Self {
            enabled: config.enabled,
            event_log: PathBuf::from(&config.event_log),
            snapshot_log: PathBuf::from(&config.snapshot_log),
            location_id: camera.location_id.clone(),
            camera_id: camera.id.clone(),
        };

        if logger.enabled {
            ensure_parent_dir(&logger.event_log)?;
            ensure_parent_dir(&logger.snapshot_log)?;
            if !logger.event_log.exists() {
                std::fs::write(&logger.event_log, EVENT_CSV_HEADER)
                    .with_context(|| format!("Failed to create {}", logger.event_log.display()))?;
                info!("Created new event log: {}", logger.event_log.display());
            }
            info!("Logging crossing events to {}", logger.event_log.display());
        }

        Ok(logger)
    }

    /// Append one crossing event. `total` is the running count after this
    /// event was applied.
    pub fn log_crossing(&self, event: &CrossingEvent, total: u64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let local = event.timestamp.with_timezone(&chrono::Local);
        let row = format!(
            "{},{},{},{},{},{},{},{},{},{},{}\n",
            local.format("%Y-%m-%d %H:%M:%S"),
            local.format("%Y-%m-%d"),
            local.format("%H:%M:%S"),
            self.location_id,
            self.camera_id,
            event.zone_id,
            event.class.as_str(),
            event.direction.as_str(),
            event.track_id,
            event.frame_index,
            total
        );

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.event_log)
            .with_context(|| format!("Failed to open {}", self.event_log.display()))?;
        file.write_all(row.as_bytes())
            .with_context(|| format!("Failed to append to {}", self.event_log.display()))?;

        debug!(
            "Logged crossing: track={} zone={} total={}",
            event.track_id, event.zone_id, total
        );
        Ok(())
    }

    /// Append one JSON snapshot line with the current counts.
    pub fn log_snapshot(&self, snapshot: &CountsSnapshot) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        #[derive(serde::Serialize)]
        struct SnapshotRecord<'a> {
            timestamp: chrono::DateTime<Utc>,
            location_id: &'a str,
            camera_id: &'a str,
            counts: &'a CountsSnapshot,
        }

        let record = SnapshotRecord {
            timestamp: Utc::now(),
            location_id: &self.location_id,
            camera_id: &self.camera_id,
            counts: snapshot,
        };

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.snapshot_log)
            .with_context(|| format!("Failed to open {}", self.snapshot_log.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to {}", self.snapshot_log.display()))?;

        Ok(())
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}
