// src/detection.rs
//
// Detection Adapter: wraps an external detector capability behind a thin
// boundary. The pipeline never fails because of the detector — errors and
// timeouts degrade to an empty detection set for that frame.
//
// The detector runs on its own worker thread; each call is awaited with
// `recv_timeout` so a hung model cannot stall the frame loop. Results that
// arrive after their deadline are discarded by frame index.

use crate::pipeline::metrics::PipelineMetrics;
use crate::types::{Detection, DetectorConfig, Frame, RawDetection, VehicleClass};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The consumed detector capability. Implementations run model inference
/// (or replay its recorded output); they are free to fail — the adapter
/// absorbs it.
pub trait VehicleDetect: Send {
    fn detect(&mut self, frame_index: u64, frame: &Frame) -> Result<Vec<RawDetection>>;
}

/// Always-empty detector, the "continuing without object detection" mode.
pub struct NullDetector;

impl VehicleDetect for NullDetector {
    fn detect(&mut self, _frame_index: u64, _frame: &Frame) -> Result<Vec<RawDetection>> {
        Ok(Vec::new())
    }
}

/// Replays per-frame detections recorded by an external inference process.
/// Input is JSONL, one object per detection:
/// `{"frame_index": 12, "bbox": [x1,y1,x2,y2], "class_id": 2, "confidence": 0.91}`
pub struct ReplayDetector {
    by_frame: HashMap<u64, Vec<RawDetection>>,
}

#[derive(serde::Deserialize)]
struct ReplayRow {
    frame_index: u64,
    #[serde(flatten)]
    detection: RawDetection,
}

impl ReplayDetector {
    pub fn load(path: &str) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open detections file {}", path))?;
        let mut by_frame: HashMap<u64, Vec<RawDetection>> = HashMap::new();
        let mut rows = 0usize;
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row: ReplayRow = serde_json::from_str(&line)
                .with_context(|| format!("Bad detection row in {}: {}", path, line))?;
            by_frame.entry(row.frame_index).or_default().push(row.detection);
            rows += 1;
        }
        debug!(
            "Loaded {} recorded detections across {} frames from {}",
            rows,
            by_frame.len(),
            path
        );
        Ok(Self { by_frame })
    }
}

impl VehicleDetect for ReplayDetector {
    fn detect(&mut self, frame_index: u64, _frame: &Frame) -> Result<Vec<RawDetection>> {
        Ok(self.by_frame.get(&frame_index).cloned().unwrap_or_default())
    }
}

pub struct DetectionAdapter {
    job_tx: SyncSender<(u64, Arc<Frame>)>,
    result_rx: Receiver<(u64, Result<Vec<RawDetection>>)>,
    timeout: Duration,
    confidence_threshold: f32,
    allowed: Vec<VehicleClass>,
    nms_iou_threshold: f32,
    metrics: Arc<PipelineMetrics>,
}

impl DetectionAdapter {
    pub fn new(
        mut detector: Box<dyn VehicleDetect>,
        config: &DetectorConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        // One slot of buffering: a job can queue while the worker is busy
        // with the previous (possibly timed-out) one.
        let (job_tx, job_rx) = mpsc::sync_channel::<(u64, Arc<Frame>)>(1);
        let (result_tx, result_rx) = mpsc::channel();

        std::thread::spawn(move || {
            for (frame_index, frame) in job_rx.iter() {
                let result = detector.detect(frame_index, &frame);
                if result_tx.send((frame_index, result)).is_err() {
                    break;
                }
            }
        });

        let allowed = config
            .classes
            .iter()
            .filter_map(|&id| VehicleClass::from_class_id(id))
            .collect();

        Self {
            job_tx,
            result_rx,
            timeout: Duration::from_millis(config.timeout_ms),
            confidence_threshold: config.confidence_threshold,
            allowed,
            nms_iou_threshold: config.nms_iou_threshold,
            metrics,
        }
    }

    /// Detect vehicles in one frame. Never fails: detector errors, timeouts
    /// and a busy worker all yield an empty result for this frame.
    pub fn detect(&mut self, frame_index: u64, frame: &Arc<Frame>) -> Vec<Detection> {
        // Drop results of earlier frames that timed out and finished late
        while let Ok((stale_index, _)) = self.result_rx.try_recv() {
            debug!("Discarding stale detector result for frame {}", stale_index);
        }

        match self.job_tx.try_send((frame_index, frame.clone())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Detector still busy, treating frame {} as empty",
                    frame_index
                );
                self.metrics.inc(&self.metrics.detector_timeouts);
                return Vec::new();
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("Detector worker is gone, treating frame {} as empty", frame_index);
                self.metrics.inc(&self.metrics.detector_failures);
                return Vec::new();
            }
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.result_rx.recv_timeout(remaining) {
                Ok((index, result)) if index == frame_index => {
                    return match result {
                        Ok(raw) => self.filter(raw),
                        Err(e) => {
                            warn!("Detector failed on frame {}: {:#}", frame_index, e);
                            self.metrics.inc(&self.metrics.detector_failures);
                            Vec::new()
                        }
                    };
                }
                Ok((stale_index, _)) => {
                    debug!("Discarding stale detector result for frame {}", stale_index);
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "Detector exceeded {}ms on frame {}, treating as empty",
                        self.timeout.as_millis(),
                        frame_index
                    );
                    self.metrics.inc(&self.metrics.detector_timeouts);
                    return Vec::new();
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Detector worker died on frame {}", frame_index);
                    self.metrics.inc(&self.metrics.detector_failures);
                    return Vec::new();
                }
            }
        }
    }

    /// Confidence threshold, class validation and NMS — applied here so the
    /// Track Manager can assume deduplicated, in-taxonomy boxes.
    fn filter(&self, raw: Vec<RawDetection>) -> Vec<Detection> {
        let mut detections: Vec<Detection> = raw
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold)
            .filter_map(|d| {
                let class = VehicleClass::from_class_id(d.class_id)?;
                if !self.allowed.contains(&class) {
                    return None;
                }
                Some(Detection {
                    bbox: d.bbox,
                    class,
                    confidence: d.confidence,
                })
            })
            .collect();
        detections = nms(detections, self.nms_iou_threshold);
        detections
    }
}

/// Greedy non-maximum suppression by descending confidence.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();

    while !detections.is_empty() {
        let current = detections.remove(0);
        detections.retain(|det| calculate_iou(&current.bbox, &det.bbox) < iou_threshold);
        keep.push(current);
    }

    keep
}

fn calculate_iou(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    let x1 = box1[0].max(box2[0]);
    let y1 = box1[1].max(box2[1]);
    let x2 = box1[2].min(box2[2]);
    let y2 = box1[3].min(box2[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area1 = (box1[2] - box1[0]) * (box1[3] - box1[1]);
    let area2 = (box2[2] - box2[0]) * (box2[3] - box2[1]);
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DetectorKind;

    fn frame() -> Arc<Frame> {
        Arc::new(Frame {
            data: vec![0u8; 4 * 4 * 3],
            width: 4,
            height: 4,
            timestamp_ms: 0.0,
        })
    }

    fn detector_config() -> DetectorConfig {
        DetectorConfig {
            kind: DetectorKind::None,
            path: None,
            confidence_threshold: 0.5,
            classes: vec![2, 3, 5, 7],
            nms_iou_threshold: 0.45,
            timeout_ms: 500,
        }
    }

    fn raw(bbox: [f32; 4], class_id: usize, confidence: f32) -> RawDetection {
        RawDetection {
            bbox,
            class_id,
            confidence,
        }
    }

    struct ScriptedDetector {
        rows: Vec<RawDetection>,
    }

    impl VehicleDetect for ScriptedDetector {
        fn detect(&mut self, _frame_index: u64, _frame: &Frame) -> Result<Vec<RawDetection>> {
            Ok(self.rows.clone())
        }
    }

    struct FailingDetector;

    impl VehicleDetect for FailingDetector {
        fn detect(&mut self, _frame_index: u64, _frame: &Frame) -> Result<Vec<RawDetection>> {
            anyhow::bail!("model exploded")
        }
    }

    struct SlowDetector {
        delay: Duration,
    }

    impl VehicleDetect for SlowDetector {
        fn detect(&mut self, _frame_index: u64, _frame: &Frame) -> Result<Vec<RawDetection>> {
            std::thread::sleep(self.delay);
            Ok(vec![raw([0.0, 0.0, 10.0, 10.0], 2, 0.9)])
        }
    }

    #[test]
    fn test_confidence_and_class_filtering() {
        let detector = ScriptedDetector {
            rows: vec![
                raw([0.0, 0.0, 10.0, 10.0], 2, 0.9),   // kept
                raw([100.0, 0.0, 110.0, 10.0], 2, 0.3), // below threshold
                raw([200.0, 0.0, 210.0, 10.0], 0, 0.9), // person, not a vehicle
            ],
        };
        let metrics = Arc::new(PipelineMetrics::new());
        let mut adapter = DetectionAdapter::new(Box::new(detector), &detector_config(), metrics);

        let detections = adapter.detect(1, &frame());
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class, VehicleClass::Car);
    }

    #[test]
    fn test_allow_list_restricts_classes() {
        let detector = ScriptedDetector {
            rows: vec![
                raw([0.0, 0.0, 10.0, 10.0], 2, 0.9),
                raw([100.0, 0.0, 110.0, 10.0], 7, 0.9),
            ],
        };
        let mut config = detector_config();
        config.classes = vec![7]; // trucks only
        let metrics = Arc::new(PipelineMetrics::new());
        let mut adapter = DetectionAdapter::new(Box::new(detector), &config, metrics);

        let detections = adapter.detect(1, &frame());
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class, VehicleClass::Truck);
    }

    #[test]
    fn test_nms_suppresses_duplicate_boxes() {
        let detector = ScriptedDetector {
            rows: vec![
                raw([100.0, 100.0, 200.0, 200.0], 2, 0.9),
                raw([105.0, 102.0, 205.0, 201.0], 2, 0.8), // same vehicle
                raw([400.0, 100.0, 500.0, 200.0], 2, 0.7), // different vehicle
            ],
        };
        let metrics = Arc::new(PipelineMetrics::new());
        let mut adapter = DetectionAdapter::new(Box::new(detector), &detector_config(), metrics);

        let detections = adapter.detect(1, &frame());
        assert_eq!(detections.len(), 2);
        // The higher-confidence duplicate survives
        assert!((detections[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_detector_failure_yields_empty() {
        let metrics = Arc::new(PipelineMetrics::new());
        let mut adapter =
            DetectionAdapter::new(Box::new(FailingDetector), &detector_config(), metrics.clone());

        let detections = adapter.detect(1, &frame());
        assert!(detections.is_empty());
        assert_eq!(
            metrics
                .detector_failures
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_detector_timeout_yields_empty_and_recovers() {
        let mut config = detector_config();
        config.timeout_ms = 30;
        let metrics = Arc::new(PipelineMetrics::new());
        let mut adapter = DetectionAdapter::new(
            Box::new(SlowDetector {
                delay: Duration::from_millis(150),
            }),
            &config,
            metrics.clone(),
        );

        assert!(adapter.detect(1, &frame()).is_empty());
        assert_eq!(
            metrics
                .detector_timeouts
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );

        // Let the slow call finish, then make sure its stale result does not
        // leak into a later frame.
        std::thread::sleep(Duration::from_millis(200));
        assert!(adapter.detect(2, &frame()).is_empty());
    }

    #[test]
    fn test_null_detector_is_empty() {
        let metrics = Arc::new(PipelineMetrics::new());
        let mut adapter =
            DetectionAdapter::new(Box::new(NullDetector), &detector_config(), metrics);
        assert!(adapter.detect(1, &frame()).is_empty());
    }

    #[test]
    fn test_replay_detector_parses_jsonl() {
        let path = std::env::temp_dir().join(format!(
            "vehicle_counter_replay_{}.jsonl",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "{\"frame_index\":1,\"bbox\":[0,0,10,10],\"class_id\":2,\"confidence\":0.9}\n\
             {\"frame_index\":1,\"bbox\":[50,0,60,10],\"class_id\":7,\"confidence\":0.8}\n\
             {\"frame_index\":3,\"bbox\":[0,0,10,10],\"class_id\":5,\"confidence\":0.7}\n",
        )
        .unwrap();

        let mut replay = ReplayDetector::load(path.to_str().unwrap()).unwrap();
        let frame = frame();
        assert_eq!(replay.detect(1, &frame).unwrap().len(), 2);
        assert_eq!(replay.detect(2, &frame).unwrap().len(), 0);
        assert_eq!(replay.detect(3, &frame).unwrap().len(), 1);

        std::fs::remove_file(&path).ok();
    }
}
