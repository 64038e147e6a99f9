use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Time of day assumed by time-window rules while the wall clock is unsynchronized.
pub const FALLBACK_TIME: TimeOfDay = TimeOfDay { hour: 12, minute: 0 };

/// Time source for the automation core.
///
/// `now_ms` must be monotonic so duration arithmetic never goes negative, even when
/// the wall clock jumps after an NTP sync. `wall_clock` returns `None` until the
/// clock has been synchronized.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn wall_clock(&self) -> Option<WallClock>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub fn index(self) -> usize {
        match self {
            Self::Mon => 0,
            Self::Tue => 1,
            Self::Wed => 2,
            Self::Thu => 3,
            Self::Fri => 4,
            Self::Sat => 5,
            Self::Sun => 6,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index % 7 {
            0 => Self::Mon,
            1 => Self::Tue,
            2 => Self::Wed,
            3 => Self::Thu,
            4 => Self::Fri,
            5 => Self::Sat,
            _ => Self::Sun,
        }
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }
}

/// Bit pattern of weekdays, one bit per [`DayOfWeek::index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayMask(pub u8);

impl DayMask {
    pub const WEEKDAYS: Self = Self(0b0001_1111);
    pub const WEEKEND: Self = Self(0b0110_0000);
    pub const EVERYDAY: Self = Self(0b0111_1111);

    pub fn of(days: &[DayOfWeek]) -> Self {
        Self(days.iter().fold(0, |mask, day| mask | (1u8 << day.index())))
    }

    pub fn contains(self, day: DayOfWeek) -> bool {
        self.0 & (1u8 << day.index()) != 0
    }
}

/// Wall-clock reading used by time-window rules and the daily totals checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClock {
    pub hour: u8,
    pub minute: u8,
    pub weekday: DayOfWeek,
    /// Zero-based day of the year.
    pub day_of_year: u16,
}

impl WallClock {
    pub fn from_datetime<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        Self {
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            weekday: DayOfWeek::from_chrono(now.weekday()),
            day_of_year: now.ordinal0() as u16,
        }
    }

    pub fn time_of_day(&self) -> TimeOfDay {
        TimeOfDay {
            hour: self.hour,
            minute: self.minute,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time of day `{0}`, expected HH:MM")]
pub struct ParseTimeError(String);

impl TimeOfDay {
    pub const fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self { hour, minute })
        } else {
            None
        }
    }

    pub fn minutes(self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }

    pub fn from_minutes(minutes: u32) -> Self {
        let minutes = minutes % (24 * 60);
        Self {
            hour: (minutes / 60) as u8,
            minute: (minutes % 60) as u8,
        }
    }

    /// Adds minutes, wrapping past midnight.
    pub fn plus_minutes(self, minutes: u32) -> Self {
        Self::from_minutes(self.minutes() as u32 + minutes)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for TimeOfDay {
    type Err = ParseTimeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimeError(value.to_string());
        let (hour, minute) = value.trim().split_once(':').ok_or_else(err)?;
        let hour = hour.parse::<u8>().map_err(|_| err())?;
        let minute = minute.parse::<u8>().map_err(|_| err())?;
        Self::new(hour, minute).ok_or_else(err)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-day pseudo-random offset in `0..60` minutes, stable for a given day so a
/// shifted start time does not move around within the day.
pub fn daily_jitter_minutes(day_of_year: u16) -> u32 {
    let mut x = u64::from(day_of_year).wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    ((x ^ (x >> 31)) % 60) as u32
}

/// `now >= target`, same-day comparison.
pub fn time_after(now: TimeOfDay, target: TimeOfDay) -> bool {
    now.minutes() >= target.minutes()
}

/// `now < target`, same-day comparison.
pub fn time_before(now: TimeOfDay, target: TimeOfDay) -> bool {
    now.minutes() < target.minutes()
}

/// Start inclusive, end exclusive. A window whose start is later than its end
/// spans midnight.
pub fn time_between(now: TimeOfDay, start: TimeOfDay, end: TimeOfDay) -> bool {
    let (now, start, end) = (now.minutes(), start.minutes(), end.minutes());
    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}
