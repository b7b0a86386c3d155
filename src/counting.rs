// src/counting.rs
//
// Line Crossing Engine. Turns confirmed track trajectories into at most one
// CrossingEvent per (track, zone).
//
// Line test: previous and current anchor points on strictly opposite sides
// of the infinite line through a→b, AND the movement segment intersects the
// finite counting segment (not its extension). Side is the sign of the 2D
// cross product — the classic ax + by + c form.
//
// Region test: point-in-polygon membership transition. Entering counts as
// AToB, leaving as BToA.

use crate::tracker::Track;
use crate::types::{AnchorPoint, CrossingEvent, Direction, VehicleClass};
use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DirectionFilter {
    AToB,
    BToA,
    #[default]
    Both,
}

impl DirectionFilter {
    pub fn permits(&self, direction: Direction) -> bool {
        match self {
            Self::Both => true,
            Self::AToB => direction == Direction::AToB,
            Self::BToA => direction == Direction::BToA,
        }
    }
}

/// A counting line as drawn in the setup tool, in frame pixel coordinates.
#[derive(Debug, Clone, Deserialize)]
pub struct Line {
    pub id: String,
    /// [a, b] — direction AToB means crossing from the positive side of a→b
    /// (left of the segment direction) to the negative side.
    pub points: [(f32, f32); 2],
    #[serde(default)]
    pub direction: DirectionFilter,
    /// Optional class filter; None counts every vehicle class
    #[serde(default)]
    pub classes: Option<Vec<VehicleClass>>,
}

/// A counting region (entry/exit zone), ≥3 vertices.
#[derive(Debug, Clone, Deserialize)]
pub struct Region {
    pub id: String,
    pub points: Vec<(f32, f32)>,
    #[serde(default)]
    pub direction: DirectionFilter,
    #[serde(default)]
    pub classes: Option<Vec<VehicleClass>>,
}

/// The full zone geometry for one camera, loaded once per session from the
/// file the interactive setup tool writes. Immutable during processing.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneSet {
    #[serde(default)]
    pub lines: Vec<Line>,
    #[serde(default)]
    pub regions: Vec<Region>,
}

impl ZoneSet {
    pub fn load(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read line config {}", path))?;
        let zones: ZoneSet = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse line config {}", path))?;
        zones.validate()?;
        Ok(zones)
    }

    /// Geometry validation — fatal before the first frame.
    pub fn validate(&self) -> Result<()> {
        if self.lines.is_empty() && self.regions.is_empty() {
            anyhow::bail!("No counting lines or regions configured");
        }
        let mut seen = std::collections::HashSet::new();
        for line in &self.lines {
            let (a, b) = (line.points[0], line.points[1]);
            let len_sq = (b.0 - a.0).powi(2) + (b.1 - a.1).powi(2);
            if len_sq < 1.0 {
                anyhow::bail!("Line '{}' is degenerate (zero length)", line.id);
            }
            if !seen.insert(line.id.as_str()) {
                anyhow::bail!("Duplicate zone id '{}'", line.id);
            }
        }
        for region in &self.regions {
            if region.points.len() < 3 {
                anyhow::bail!(
                    "Region '{}' needs at least 3 points, got {}",
                    region.id,
                    region.points.len()
                );
            }
            if !seen.insert(region.id.as_str()) {
                anyhow::bail!("Duplicate zone id '{}'", region.id);
            }
        }
        Ok(())
    }

    pub fn zone_count(&self) -> usize {
        self.lines.len() + self.regions.len()
    }
}

/// Signed side of point `p` relative to the infinite line through a→b.
/// Positive on one side, negative on the other, zero on the line.
fn side_of_line(a: (f32, f32), b: (f32, f32), p: (f32, f32)) -> f32 {
    (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0)
}

/// Crossing direction of the movement `prev → curr` over the finite segment
/// a→b, or None if it does not cross.
fn line_crossing(a: (f32, f32), b: (f32, f32), prev: (f32, f32), curr: (f32, f32)) -> Option<Direction> {
    let d_prev = side_of_line(a, b, prev);
    let d_curr = side_of_line(a, b, curr);

    // Strictly opposite sides of the infinite line
    if d_prev == 0.0 || d_curr == 0.0 || (d_prev > 0.0) == (d_curr > 0.0) {
        return None;
    }

    // The crossing point must fall on the finite segment: a and b must not
    // both lie on the same side of the movement segment.
    let d_a = side_of_line(prev, curr, a);
    let d_b = side_of_line(prev, curr, b);
    if d_a * d_b > 0.0 {
        return None;
    }

    if d_prev > 0.0 {
        Some(Direction::AToB)
    } else {
        Some(Direction::BToA)
    }
}

/// Even-odd ray casting.
fn point_in_polygon(p: (f32, f32), polygon: &[(f32, f32)]) -> bool {
    let mut inside = false;
    let n = polygon.len();
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if (yi > p.1) != (yj > p.1) && p.0 < (xj - xi) * (p.1 - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn anchor_of(bbox: &[f32; 4], anchor: AnchorPoint) -> (f32, f32) {
    match anchor {
        AnchorPoint::Centroid => ((bbox[0] + bbox[2]) * 0.5, (bbox[1] + bbox[3]) * 0.5),
        AnchorPoint::BottomCenter => ((bbox[0] + bbox[2]) * 0.5, bbox[3]),
    }
}

pub struct LineCounter {
    zones: ZoneSet,
    anchor: AnchorPoint,
}

impl LineCounter {
    pub fn new(zones: ZoneSet, anchor: AnchorPoint) -> Self {
        Self { zones, anchor }
    }

    pub fn zones(&self) -> &ZoneSet {
        &self.zones
    }

    /// Evaluate every configured zone against every confirmed track that was
    /// matched on this frame. Emits at most one event per (track, zone) —
    /// `crossed_zones` on the track is the invariant carrier, so a vehicle
    /// survives detector flicker and re-association without double counting.
    pub fn update(&self, frame_index: u64, tracks: &mut [Track]) -> Vec<CrossingEvent> {
        let mut events = Vec::new();

        for track in tracks.iter_mut() {
            if !track.is_confirmed() || !track.updated_on(frame_index) {
                continue;
            }
            if track.history.len() < 2 {
                continue;
            }

            let (_, prev_bbox) = track.history[track.history.len() - 2];
            let (_, curr_bbox) = track.history[track.history.len() - 1];
            let prev = anchor_of(&prev_bbox, self.anchor);
            let curr = anchor_of(&curr_bbox, self.anchor);

            for line in &self.zones.lines {
                if track.crossed_zones.contains_key(&line.id) {
                    continue;
                }
                let Some(direction) = line_crossing(line.points[0], line.points[1], prev, curr)
                else {
                    continue;
                };
                // Filtered crossings do not consume the at-most-once budget:
                // a vehicle crossing against the counted direction and later
                // returning with it still yields exactly one event.
                if !line.direction.permits(direction) {
                    debug!(
                        "Track {} crossed line '{}' {} — filtered by direction",
                        track.id,
                        line.id,
                        direction.as_str()
                    );
                    continue;
                }
                if let Some(classes) = &line.classes {
                    if !classes.contains(&track.class) {
                        continue;
                    }
                }
                track.crossed_zones.insert(line.id.clone(), direction);
                info!(
                    "Track {} ({}) crossed line '{}' {} at frame {}",
                    track.id,
                    track.class.as_str(),
                    line.id,
                    direction.as_str(),
                    frame_index
                );
                events.push(CrossingEvent {
                    track_id: track.id,
                    zone_id: line.id.clone(),
                    class: track.class,
                    direction,
                    frame_index,
                    timestamp: chrono::Utc::now(),
                });
            }

            for region in &self.zones.regions {
                if track.crossed_zones.contains_key(&region.id) {
                    continue;
                }
                let was_inside = point_in_polygon(prev, &region.points);
                let is_inside = point_in_polygon(curr, &region.points);
                let direction = match (was_inside, is_inside) {
                    (false, true) => Direction::AToB,
                    (true, false) => Direction::BToA,
                    _ => continue,
                };
                if !region.direction.permits(direction) {
                    continue;
                }
                if let Some(classes) = &region.classes {
                    if !classes.contains(&track.class) {
                        continue;
                    }
                }
                track.crossed_zones.insert(region.id.clone(), direction);
                info!(
                    "Track {} ({}) {} region '{}' at frame {}",
                    track.id,
                    track.class.as_str(),
                    if direction == Direction::AToB {
                        "entered"
                    } else {
                        "left"
                    },
                    region.id,
                    frame_index
                );
                events.push(CrossingEvent {
                    track_id: track.id,
                    zone_id: region.id.clone(),
                    class: track.class,
                    direction,
                    frame_index,
                    timestamp: chrono::Utc::now(),
                });
            }
        }

        events
    }
}
