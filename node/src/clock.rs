use std::{sync::OnceLock, time::Instant};

use anyhow::{anyhow, Context};
use chrono::{Datelike, Utc};
use chrono_tz::Tz;
use powernode_common::{Clock, WallClock};

/// Epoch years before this mean SNTP has not set the clock yet.
const FIRST_SYNCED_YEAR: i32 = 2024;

pub const DEFAULT_TIMEZONE: &str = "Europe/Amsterdam";

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    timezone: Tz,
}

impl SystemClock {
    pub fn new(timezone: &str) -> anyhow::Result<Self> {
        let timezone = parse_timezone(timezone)?;
        Ok(Self { timezone })
    }

    /// Falls back to [`DEFAULT_TIMEZONE`] when the configured name is unknown.
    pub fn or_default(timezone: &str) -> Self {
        Self::new(timezone).unwrap_or_else(|err| {
            log::warn!("{err:#}; using {DEFAULT_TIMEZONE}");
            Self {
                timezone: Tz::Europe__Amsterdam,
            }
        })
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn wall_clock(&self) -> Option<WallClock> {
        let now = Utc::now();
        if now.year() < FIRST_SYNCED_YEAR {
            return None;
        }
        Some(WallClock::from_datetime(&now.with_timezone(&self.timezone)))
    }
}

pub fn parse_timezone(timezone: &str) -> anyhow::Result<Tz> {
    timezone
        .trim()
        .parse::<Tz>()
        .map_err(|err| anyhow!("{err}"))
        .with_context(|| format!("invalid timezone `{timezone}`"))
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_timezone() {
        assert!(SystemClock::new("Mars/Olympus").is_err());
        assert_eq!(
            SystemClock::or_default("Mars/Olympus").timezone(),
            Tz::Europe__Amsterdam
        );
    }

    #[test]
    fn accepts_configured_timezone() {
        let clock = SystemClock::new(" America/New_York ").unwrap();
        assert_eq!(clock.timezone(), Tz::America__New_York);
    }

    #[test]
    fn monotonic_time_never_goes_back() {
        let first = monotonic_ms();
        assert!(monotonic_ms() >= first);
    }
}
