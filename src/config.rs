// src/config.rs

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        let contents = interpolate_env(&contents);
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Anything wrong here is fatal before the first
    /// frame is processed.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            anyhow::bail!(
                "detector.confidence_threshold must be in [0, 1], got {}",
                self.detector.confidence_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.detector.nms_iou_threshold) {
            anyhow::bail!(
                "detector.nms_iou_threshold must be in [0, 1], got {}",
                self.detector.nms_iou_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.tracker.min_iou) {
            anyhow::bail!(
                "tracker.min_iou must be in [0, 1], got {}",
                self.tracker.min_iou
            );
        }
        if self.tracker.confirm_hits == 0 {
            anyhow::bail!("tracker.confirm_hits must be at least 1");
        }
        if self.tracker.history_window < 2 {
            anyhow::bail!(
                "tracker.history_window must be at least 2 (crossing tests \
                 need a previous and a current position)"
            );
        }
        if self.source.width == 0 || self.source.height == 0 {
            anyhow::bail!("source.width and source.height must be non-zero");
        }
        if self.source.fps <= 0.0 {
            anyhow::bail!("source.fps must be positive, got {}", self.source.fps);
        }
        if self.pipeline.queue_capacity == 0 {
            anyhow::bail!("pipeline.queue_capacity must be at least 1");
        }
        Ok(())
    }
}

/// Replace `${ENV_VAR}` references in the raw config text before parsing.
/// Unset variables become empty strings.
fn interpolate_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated reference, keep verbatim
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn test_config() -> Config {
        Config {
            camera: CameraConfig {
                id: "cam-01".into(),
                location_id: "gate-a".into(),
            },
            source: SourceConfig {
                kind: SourceKind::File,
                path: Some("frames.rgb".into()),
                width: 1280,
                height: 720,
                fps: 30.0,
            },
            detector: DetectorConfig {
                kind: DetectorKind::None,
                path: None,
                confidence_threshold: 0.5,
                classes: vec![2, 3, 5, 7],
                nms_iou_threshold: 0.45,
                timeout_ms: 200,
            },
            tracker: TrackerConfig::default(),
            counting: CountingConfig {
                line_config: "lines.json".into(),
                anchor: AnchorPoint::Centroid,
            },
            pipeline: PipelineConfig {
                queue_capacity: 8,
                max_frame_latency_ms: 500,
                snapshot_interval_frames: 300,
            },
            logging: LoggingConfig {
                level: "info".into(),
                enabled: true,
                event_log: "logs/events.csv".into(),
                snapshot_log: "logs/snapshots.jsonl".into(),
            },
            api: ApiConfig {
                enabled: false,
                endpoint: String::new(),
                timeout_secs: 10,
                retry_attempts: 3,
                send_interval_secs: 60,
            },
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let mut config = test_config();
        config.detector.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_history_window_rejected() {
        let mut config = test_config();
        config.tracker.history_window = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let mut config = test_config();
        config.pipeline.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_interpolation() {
        std::env::set_var("VEHICLE_COUNTER_TEST_CAM", "cam-42");
        let text = "camera: ${VEHICLE_COUNTER_TEST_CAM}";
        assert_eq!(interpolate_env(text), "camera: cam-42");
    }

    #[test]
    fn test_env_interpolation_unset_is_empty() {
        std::env::remove_var("VEHICLE_COUNTER_TEST_UNSET");
        assert_eq!(interpolate_env("x${VEHICLE_COUNTER_TEST_UNSET}y"), "xy");
    }

    #[test]
    fn test_env_interpolation_unterminated_kept() {
        assert_eq!(interpolate_env("a${UNTERMINATED"), "a${UNTERMINATED");
    }
}
