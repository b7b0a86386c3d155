// src/aggregator.rs
//
// Count Aggregator. Owns the per-zone / per-class / per-direction running
// counts for one camera session. Idempotence is the crossing engine's
// guarantee — events arriving here are already deduplicated.

use crate::types::{CrossingEvent, Direction, VehicleClass};
use serde::Serialize;
use std::collections::HashMap;

type ZoneCounts = HashMap<VehicleClass, HashMap<Direction, u64>>;

#[derive(Debug, Default)]
pub struct CountAggregator {
    counts: HashMap<String, ZoneCounts>,
    total: u64,
}

/// Read-only copy of the counts, for the logging sink and API payloads.
#[derive(Debug, Clone, Serialize)]
pub struct CountsSnapshot {
    pub total: u64,
    pub zones: HashMap<String, ZoneCounts>,
}

impl CountAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &CrossingEvent) {
        *self
            .counts
            .entry(event.zone_id.clone())
            .or_default()
            .entry(event.class)
            .or_default()
            .entry(event.direction)
            .or_default() += 1;
        self.total += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn count(&self, zone_id: &str, class: VehicleClass, direction: Direction) -> u64 {
        self.counts
            .get(zone_id)
            .and_then(|z| z.get(&class))
            .and_then(|c| c.get(&direction))
            .copied()
            .unwrap_or(0)
    }

    pub fn zone_total(&self, zone_id: &str) -> u64 {
        self.counts
            .get(zone_id)
            .map(|z| z.values().flat_map(|c| c.values()).sum())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> CountsSnapshot {
        CountsSnapshot {
            total: self.total,
            zones: self.counts.clone(),
        }
    }

    /// Operator-triggered reset, either one zone or everything.
    pub fn reset(&mut self, zone_id: Option<&str>) {
        match zone_id {
            Some(id) => {
                if let Some(zone) = self.counts.remove(id) {
                    let removed: u64 = zone.values().flat_map(|c| c.values()).sum();
                    self.total -= removed;
                }
            }
            None => {
                self.counts.clear();
                self.total = 0;
            }
        }
    }
}
