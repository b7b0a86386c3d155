// src/tracker.rs
//
// IoU-based multi-object tracker for fixed-camera vehicle counting.
//
// Design:
//   - Greedy IoU matching on motion-predicted boxes (sufficient for <20
//     objects per frame), deterministic tie-break toward the lowest track id
//   - Tracks coast through brief detection gaps (flicker, occlusion)
//   - Cross-class matches penalized so same-class candidates win
//   - Each track carries the set of counting zones it has already been
//     counted on; that set is the at-most-once guarantee for the counter

use crate::types::{ClassPolicy, Detection, Direction, TrackerConfig, VehicleClass};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

/// Rolling window for the majority-vote class policy.
const CLASS_VOTE_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Lost,
}

/// A single tracked vehicle.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub bbox: [f32; 4],
    pub state: TrackState,
    pub class: VehicleClass,
    /// (frame_index, bbox) of matched frames, bounded to the history window
    pub history: VecDeque<(u64, [f32; 4])>,
    pub consecutive_hits: u32,
    pub frames_since_hit: u32,
    pub last_seen_frame: u64,
    pub last_confidence: f32,
    /// Zones this track has already been counted on — at most one entry per
    /// zone id, ever. The counting engine appends, nobody removes.
    pub crossed_zones: HashMap<String, Direction>,
    /// Class frozen at confirmation under the lock_on_confirm policy
    locked_class: Option<VehicleClass>,
    class_votes: VecDeque<VehicleClass>,
}

impl Track {
    fn new(id: u32, det: &Detection, frame_index: u64) -> Self {
        let mut history = VecDeque::new();
        history.push_back((frame_index, det.bbox));
        let mut class_votes = VecDeque::new();
        class_votes.push_back(det.class);
        Self {
            id,
            bbox: det.bbox,
            state: TrackState::Tentative,
            class: det.class,
            history,
            consecutive_hits: 1,
            frames_since_hit: 0,
            last_seen_frame: frame_index,
            last_confidence: det.confidence,
            crossed_zones: HashMap::new(),
            locked_class: None,
            class_votes,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.bbox[0] + self.bbox[2]) * 0.5,
            (self.bbox[1] + self.bbox[3]) * 0.5,
        )
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == TrackState::Confirmed
    }

    /// Whether this track was matched on the given frame — only then do its
    /// last two history entries describe fresh motion.
    pub fn updated_on(&self, frame_index: u64) -> bool {
        self.frames_since_hit == 0 && self.last_seen_frame == frame_index
    }

    /// Last box advanced by the per-frame velocity of the last two matched
    /// positions (simple linear motion). Falls back to the last box.
    fn predicted_bbox(&self, frame_index: u64) -> [f32; 4] {
        if self.history.len() < 2 {
            return self.bbox;
        }
        let (f_prev, b_prev) = self.history[self.history.len() - 2];
        let (f_last, b_last) = self.history[self.history.len() - 1];
        let span = f_last.saturating_sub(f_prev) as f32;
        if span <= 0.0 {
            return self.bbox;
        }
        let vx = ((b_last[0] + b_last[2]) - (b_prev[0] + b_prev[2])) * 0.5 / span;
        let vy = ((b_last[1] + b_last[3]) - (b_prev[1] + b_prev[3])) * 0.5 / span;
        let dt = frame_index.saturating_sub(f_last) as f32;
        [
            b_last[0] + vx * dt,
            b_last[1] + vy * dt,
            b_last[2] + vx * dt,
            b_last[3] + vy * dt,
        ]
    }

    fn update_with_detection(&mut self, det: &Detection, frame_index: u64, config: &TrackerConfig) {
        let gap = self.frames_since_hit;
        self.bbox = det.bbox;
        self.history.push_back((frame_index, det.bbox));
        while self.history.len() > config.history_window {
            self.history.pop_front();
        }
        self.consecutive_hits += 1;
        self.frames_since_hit = 0;
        self.last_seen_frame = frame_index;
        self.last_confidence = det.confidence;

        match config.class_policy {
            ClassPolicy::LockOnConfirm => {
                if self.locked_class.is_none() {
                    self.class = det.class;
                }
            }
            ClassPolicy::MajorityVote => {
                self.class_votes.push_back(det.class);
                while self.class_votes.len() > CLASS_VOTE_WINDOW {
                    self.class_votes.pop_front();
                }
                self.class = self.majority_class();
            }
        }

        match self.state {
            TrackState::Tentative => {
                if self.consecutive_hits >= config.confirm_hits {
                    self.state = TrackState::Confirmed;
                    if config.class_policy == ClassPolicy::LockOnConfirm {
                        self.locked_class = Some(self.class);
                    }
                    debug!("Track {} confirmed as {}", self.id, self.class.as_str());
                }
            }
            TrackState::Lost => {
                self.state = TrackState::Confirmed;
                self.consecutive_hits = 1;
                debug!("Track {} re-associated after {}-frame gap", self.id, gap);
            }
            TrackState::Confirmed => {}
        }
    }

    fn mark_missed(&mut self, config: &TrackerConfig) {
        self.frames_since_hit += 1;
        self.consecutive_hits = 0;
        if self.state == TrackState::Confirmed && self.frames_since_hit > config.max_miss_frames {
            self.state = TrackState::Lost;
            debug!(
                "Track {} lost after {} missed frames",
                self.id, self.frames_since_hit
            );
        }
    }

    fn majority_class(&self) -> VehicleClass {
        let mut best = self.class;
        let mut best_count = 0usize;
        for candidate in VehicleClass::ALL {
            let count = self.class_votes.iter().filter(|&&c| c == candidate).count();
            if count > best_count {
                best = candidate;
                best_count = count;
            }
        }
        best
    }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if inter <= 0.0 {
        return 0.0;
    }

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

pub struct VehicleTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u32,
}

impl VehicleTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::with_capacity(32),
            next_id: 1,
        }
    }

    /// Process one frame of (already filtered and deduplicated) detections.
    /// Returns the live tracks: active ones plus those coasting in Lost.
    pub fn update(&mut self, frame_index: u64, detections: &[Detection]) -> &[Track] {
        let predicted: Vec<[f32; 4]> = self
            .tracks
            .iter()
            .map(|t| t.predicted_bbox(frame_index))
            .collect();

        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let raw_iou = iou(&predicted[ti], &det.bbox);
                if raw_iou < self.config.min_iou {
                    continue;
                }
                // Confirmed tracks prefer same-class matches; a cross-class
                // candidate only wins when nothing better overlaps.
                let effective_iou = if track.state != TrackState::Tentative
                    && track.class != det.class
                {
                    raw_iou * self.config.cross_class_iou_penalty
                } else {
                    raw_iou
                };
                if effective_iou >= self.config.min_iou {
                    pairs.push((ti, di, effective_iou));
                }
            }
        }

        // Descending score; ambiguous overlaps resolve toward the lowest
        // track id, then the lowest detection index — fully deterministic.
        pairs.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.tracks[a.0].id.cmp(&self.tracks[b.0].id))
                .then_with(|| a.1.cmp(&b.1))
        });

        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut matched_dets = vec![false; detections.len()];

        for (ti, di, _score) in &pairs {
            if matched_tracks[*ti] || matched_dets[*di] {
                continue;
            }
            matched_tracks[*ti] = true;
            matched_dets[*di] = true;
            self.tracks[*ti].update_with_detection(&detections[*di], frame_index, &self.config);
        }

        for (ti, matched) in matched_tracks.iter().enumerate() {
            if !matched {
                self.tracks[ti].mark_missed(&self.config);
            }
        }

        for (di, matched) in matched_dets.iter().enumerate() {
            if !matched {
                let track = Track::new(self.next_id, &detections[di], frame_index);
                debug!(
                    "New track {} spawned: class={}, bbox=[{:.0},{:.0},{:.0},{:.0}]",
                    track.id,
                    track.class.as_str(),
                    track.bbox[0],
                    track.bbox[1],
                    track.bbox[2],
                    track.bbox[3]
                );
                self.next_id += 1;
                self.tracks.push(track);
            }
        }

        let max_miss = self.config.max_miss_frames;
        let grace = self.config.grace_frames;
        self.tracks.retain(|t| {
            // Tentative tracks never earned a grace period
            if t.state == TrackState::Tentative && t.frames_since_hit > max_miss {
                debug!("Track {} pruned (tentative, never confirmed)", t.id);
                return false;
            }
            if t.frames_since_hit > max_miss + grace {
                info!(
                    "Track {} removed after {} frames without a detection",
                    t.id, t.frames_since_hit
                );
                return false;
            }
            true
        });

        &self.tracks
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> &mut [Track] {
        &mut self.tracks
    }

    pub fn confirmed_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_confirmed()).count()
    }

    /// Total tracks ever spawned (monotonic id counter).
    pub fn total_spawned(&self) -> u64 {
        (self.next_id - 1) as u64
    }
}
