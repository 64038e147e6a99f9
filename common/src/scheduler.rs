//! Cooperative stage scheduler for the node's control loop.
//!
//! Each call to [`Scheduler::next`] hands out at most one due stage, walking the
//! table in its fixed order. The caller runs that stage to completion and may do
//! other work (drain web requests, feed a watchdog) before asking again.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    LoadTotals,
    Connectivity,
    LightSensor,
    Display,
    Meter,
    Sockets,
    /// Rule evaluation followed by the max-on sweep.
    Automation,
    WebServer,
    Presence,
    DailyTotals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Once,
    Every(u64),
}

#[derive(Debug, Clone)]
struct Slot {
    stage: Stage,
    cadence: Cadence,
    last_run_ms: Option<u64>,
}

impl Slot {
    fn is_due(&self, now_ms: u64) -> bool {
        match (self.cadence, self.last_run_ms) {
            (_, None) => true,
            (Cadence::Once, Some(_)) => false,
            (Cadence::Every(interval), Some(last)) => now_ms.saturating_sub(last) >= interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    slots: Vec<Slot>,
    cursor: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(&[
            (Stage::LoadTotals, Cadence::Once),
            (Stage::Connectivity, Cadence::Every(30_000)),
            (Stage::LightSensor, Cadence::Every(30_000)),
            (Stage::Display, Cadence::Every(1_000)),
            (Stage::Meter, Cadence::Every(1_000)),
            (Stage::Sockets, Cadence::Every(5_000)),
            (Stage::Automation, Cadence::Every(2_000)),
            (Stage::WebServer, Cadence::Every(100)),
            (Stage::Presence, Cadence::Every(60_000)),
            (Stage::DailyTotals, Cadence::Every(60_000)),
        ])
    }
}

impl Scheduler {
    pub fn new(table: &[(Stage, Cadence)]) -> Self {
        Self {
            slots: table
                .iter()
                .map(|&(stage, cadence)| Slot {
                    stage,
                    cadence,
                    last_run_ms: None,
                })
                .collect(),
            cursor: 0,
        }
    }

    /// Returns the next due stage after the previous one, wrapping around the
    /// table at most once. `None` means nothing is due yet.
    pub fn next(&mut self, now_ms: u64) -> Option<Stage> {
        let len = self.slots.len();
        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            let slot = &mut self.slots[index];
            if slot.is_due(now_ms) {
                slot.last_run_ms = Some(now_ms);
                self.cursor = (index + 1) % len;
                return Some(slot.stage);
            }
        }
        None
    }

    /// Time until the earliest stage becomes due.
    pub fn idle_for_ms(&self, now_ms: u64) -> Option<u64> {
        self.slots
            .iter()
            .filter_map(|slot| match (slot.cadence, slot.last_run_ms) {
                (_, None) => Some(0),
                (Cadence::Once, Some(_)) => None,
                (Cadence::Every(interval), Some(last)) => {
                    Some(interval.saturating_sub(now_ms.saturating_sub(last)))
                }
            })
            .min()
    }
}
