//! Rule expressions that drive the sockets.
//!
//! A [`Rule`] is a tree of primitives and combinators. It is evaluated once per cycle
//! by [`AutomationEngine::evaluate`](crate::engine::AutomationEngine::evaluate), which
//! supplies the clock, sensors, memory slots and socket records.

use serde::{Deserialize, Serialize};

use crate::{
    clock::{DayMask, TimeOfDay},
    config::AutomationConfig,
    socket_state::SocketId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum Rule {
    Always,
    Never,
    TimeAfter { at: TimeOfDay },
    /// `at` shifted by `minutes`, plus a per-day offset of up to 59 minutes when
    /// `daily_jitter` is set.
    TimeAfterOffset {
        at: TimeOfDay,
        #[serde(default)]
        minutes: u32,
        #[serde(default)]
        daily_jitter: bool,
    },
    TimeBefore { at: TimeOfDay },
    TimeBetween { start: TimeOfDay, end: TimeOfDay },
    Weekday { days: DayMask },
    LightAbove { lux: f32 },
    LightBelow { lux: f32 },
    Present,
    Absent,
    ExportAbove { watts: f32 },
    ExportBelow { watts: f32 },
    ImportAbove { watts: f32 },
    ImportBelow { watts: f32 },
    IsOn { socket: SocketId },
    IsOff { socket: SocketId },
    OnFor { socket: SocketId, minutes: u32 },
    OffFor { socket: SocketId, minutes: u32 },
    And { all: Vec<Rule> },
    Or { any: Vec<Rule> },
    Not { rule: Box<Rule> },
    Latch {
        slot: usize,
        set: Box<Rule>,
        reset: Box<Rule>,
    },
    Delay { slot: usize, trigger: Box<Rule> },
}

impl Rule {
    pub fn after(at: TimeOfDay) -> Self {
        Self::TimeAfter { at }
    }

    pub fn after_offset(at: TimeOfDay, minutes: u32, daily_jitter: bool) -> Self {
        Self::TimeAfterOffset {
            at,
            minutes,
            daily_jitter,
        }
    }

    pub fn before(at: TimeOfDay) -> Self {
        Self::TimeBefore { at }
    }

    pub fn between(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self::TimeBetween { start, end }
    }

    pub fn and(all: impl IntoIterator<Item = Rule>) -> Self {
        Self::And {
            all: all.into_iter().collect(),
        }
    }

    pub fn or(any: impl IntoIterator<Item = Rule>) -> Self {
        Self::Or {
            any: any.into_iter().collect(),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(rule: Rule) -> Self {
        Self::Not {
            rule: Box::new(rule),
        }
    }

    pub fn latch(slot: usize, set: Rule, reset: Rule) -> Self {
        Self::Latch {
            slot,
            set: Box::new(set),
            reset: Box::new(reset),
        }
    }

    pub fn delay(slot: usize, trigger: Rule) -> Self {
        Self::Delay {
            slot,
            trigger: Box::new(trigger),
        }
    }
}

/// Integer-coded OR; any positive value counts as true.
pub fn logical_or(a: i32, b: i32) -> bool {
    a > 0 || b > 0
}

pub fn logical_and(a: i32, b: i32) -> bool {
    a > 0 && b > 0
}

pub fn logical_not(a: i32) -> bool {
    a <= 0
}

/// The pair of conditions attached to one socket. Both are evaluated every cycle;
/// callers are expected to keep them mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketRules {
    pub socket: SocketId,
    pub turn_on: Rule,
    pub turn_off: Rule,
}

/// Stock behaviour of the three-socket node:
///
/// 1. surplus load: on while exporting above the on threshold, off below the off threshold
/// 2. evening light: on after 17:45 when darker than 75 lux
/// 3. evening light: on after 17:30 when darker than 50 lux
pub fn default_rules(config: &AutomationConfig) -> Vec<SocketRules> {
    let evening = |socket: u8, hour: u8, minute: u8, lux: f32| SocketRules {
        socket: SocketId(socket),
        turn_on: Rule::and([
            Rule::after(TimeOfDay { hour, minute }),
            Rule::LightBelow { lux },
        ]),
        turn_off: Rule::not(Rule::LightBelow { lux }),
    };

    vec![
        SocketRules {
            socket: SocketId(1),
            turn_on: Rule::ExportAbove {
                watts: config.power_on_threshold_w,
            },
            turn_off: Rule::ExportBelow {
                watts: config.power_off_threshold_w,
            },
        },
        evening(2, 17, 45, 75.0),
        evening(3, 17, 30, 50.0),
    ]
}
