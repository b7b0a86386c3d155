// src/types.rs

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    pub source: SourceConfig,
    pub detector: DetectorConfig,
    pub tracker: TrackerConfig,
    pub counting: CountingConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    pub location_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// "file" reads raw rgb24 frames from `path`, "stdin" reads them from
    /// standard input (e.g. `ffmpeg -i cam.mp4 -f rawvideo -pix_fmt rgb24 -`).
    pub kind: SourceKind,
    #[serde(default)]
    pub path: Option<String>,
    pub width: usize,
    pub height: usize,
    pub fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    File,
    Stdin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// "replay" consumes per-frame detections from a JSONL file produced by
    /// an external inference process; "none" runs without a detector.
    pub kind: DetectorKind,
    #[serde(default)]
    pub path: Option<String>,
    pub confidence_threshold: f32,
    /// COCO class ids accepted at the adapter boundary (2=car, 3=motorcycle,
    /// 5=bus, 7=truck). Anything else is dropped before tracking.
    pub classes: Vec<usize>,
    pub nms_iou_threshold: f32,
    /// Budget for one detector call. A slower call is treated as an empty
    /// detection result for that frame.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Replay,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Minimum IoU to match a detection to an existing track
    pub min_iou: f32,
    /// Consecutive hits required to promote Tentative → Confirmed
    pub confirm_hits: u32,
    /// Consecutive misses before a track transitions to Lost
    pub max_miss_frames: u32,
    /// Frames a Lost track stays in the association pool before removal
    pub grace_frames: u32,
    /// Bounded length of each track's position history
    pub history_window: usize,
    /// IoU multiplier applied to cross-class candidate matches
    pub cross_class_iou_penalty: f32,
    pub class_policy: ClassPolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_iou: 0.15,
            confirm_hits: 3,
            max_miss_frames: 10,
            grace_frames: 20,
            history_window: 30,
            cross_class_iou_penalty: 0.5,
            class_policy: ClassPolicy::LockOnConfirm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassPolicy {
    /// Class frozen at first confirmation; later conflicting detections
    /// cannot flip it, so a track's events stay in one class.
    LockOnConfirm,
    /// Rolling majority vote over recent matched detections.
    MajorityVote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountingConfig {
    /// Path to the line/region geometry file written by the setup tool
    pub line_config: String,
    pub anchor: AnchorPoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorPoint {
    Centroid,
    BottomCenter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bounded frame queue size; under backpressure the oldest frame is dropped
    pub queue_capacity: usize,
    /// If a frame takes longer than this, the next queued frame is skipped
    pub max_frame_latency_ms: u64,
    /// Emit a count snapshot to the logging sink every N processed frames
    pub snapshot_interval_frames: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub enabled: bool,
    pub event_log: String,
    pub snapshot_log: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    /// Minimum seconds between event pushes (the final flush is exempt)
    pub send_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub timestamp_ms: f64,
}

/// What a detector capability produces, before boundary validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDetection {
    pub bbox: [f32; 4], // [x1, y1, x2, y2] pixels
    pub class_id: usize,
    pub confidence: f32,
}

/// Closed vehicle taxonomy. Raw class ids are validated into this at the
/// Detection Adapter boundary; nothing downstream sees an open-ended id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl VehicleClass {
    pub fn from_class_id(class_id: usize) -> Option<Self> {
        match class_id {
            2 => Some(Self::Car),
            3 => Some(Self::Motorcycle),
            5 => Some(Self::Bus),
            7 => Some(Self::Truck),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Car => "car",
            Self::Motorcycle => "motorcycle",
            Self::Bus => "bus",
            Self::Truck => "truck",
        }
    }

    pub const ALL: [VehicleClass; 4] = [
        VehicleClass::Car,
        VehicleClass::Motorcycle,
        VehicleClass::Bus,
        VehicleClass::Truck,
    ];
}

/// A validated detection, ephemeral per frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4], // [x1, y1, x2, y2] pixels
    pub class: VehicleClass,
    pub confidence: f32,
}

impl Detection {
    pub fn center(&self) -> (f32, f32) {
        (
            (self.bbox[0] + self.bbox[2]) * 0.5,
            (self.bbox[1] + self.bbox[3]) * 0.5,
        )
    }
}

/// Crossing direction relative to the line's `a → b` orientation. For
/// regions, entering maps to `AToB` and leaving to `BToA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AToB => "a_to_b",
            Self::BToA => "b_to_a",
        }
    }

    pub fn reversed(&self) -> Self {
        match self {
            Self::AToB => Self::BToA,
            Self::BToA => Self::AToB,
        }
    }
}

/// The single record marking a track's transition across a counting zone.
/// Emitted at most once per (track, zone).
#[derive(Debug, Clone, Serialize)]
pub struct CrossingEvent {
    pub track_id: u32,
    pub zone_id: String,
    pub class: VehicleClass,
    pub direction: Direction,
    pub frame_index: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
