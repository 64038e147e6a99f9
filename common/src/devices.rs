use crate::{clock::Clock, error::DeviceError};

/// Smart meter capability. Readings are the values cached by the last poll.
pub trait PowerMeter {
    fn update(&mut self, now_ms: u64);
    fn current_import_w(&self) -> f32;
    fn current_export_w(&self) -> f32;
    fn total_import_kwh(&self) -> f64;
    fn total_export_kwh(&self) -> f64;
    /// Whether the last poll succeeded.
    fn is_connected(&self) -> bool;
}

/// Networked power socket.
///
/// `current_state` is the cached last-known state and is only refreshed by `update`.
/// A failed read must leave it unchanged. After a failed `set_state` the cache is
/// unconfirmed, so `is_connected` reports false until a read succeeds again.
pub trait SocketDevice {
    fn update(&mut self, now_ms: u64);
    fn current_state(&self) -> bool;
    fn set_state(&mut self, on: bool) -> Result<(), DeviceError>;
    fn is_connected(&self) -> bool;
}

pub trait LightSensor {
    fn light_level(&mut self) -> Option<f32>;
}

/// Reachability check used as a presence signal. Implementations rate-limit
/// themselves so callers may ask every cycle.
pub trait PresenceProbe {
    fn is_present(&mut self, now_ms: u64) -> bool;
}

/// Capabilities lent to the automation engine for one call.
///
/// The application owns every device; `sockets[n]` is socket id `n + 1` and `None`
/// marks a socket without a configured address.
pub struct Devices<'a, S: SocketDevice> {
    pub clock: &'a dyn Clock,
    pub sockets: &'a mut [Option<S>],
    pub meter: Option<&'a dyn PowerMeter>,
    pub light: Option<&'a mut dyn LightSensor>,
    pub presence: Option<&'a mut dyn PresenceProbe>,
}

impl<'a, S: SocketDevice> Devices<'a, S> {
    pub fn new(clock: &'a dyn Clock, sockets: &'a mut [Option<S>]) -> Self {
        Self {
            clock,
            sockets,
            meter: None,
            light: None,
            presence: None,
        }
    }

    pub fn with_meter(mut self, meter: &'a dyn PowerMeter) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn with_light(mut self, light: &'a mut dyn LightSensor) -> Self {
        self.light = Some(light);
        self
    }

    pub fn with_presence(mut self, presence: &'a mut dyn PresenceProbe) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn socket(&self, index: usize) -> Option<&S> {
        self.sockets.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn socket_mut(&mut self, index: usize) -> Option<&mut S> {
        self.sockets.get_mut(index).and_then(Option::as_mut)
    }
}

pub const DEFAULT_READ_INTERVAL_MS: u64 = 1_000;
const BACKOFF_STEP_MS: u64 = 5_000;
const BACKOFF_MAX_MS: u64 = 60_000;

/// Poll pacing for flaky devices: a fixed read interval, stretched by
/// `failures * 5s` (capped at 60s) while the device keeps failing.
#[derive(Debug, Clone)]
pub struct Backoff {
    read_interval_ms: u64,
    last_attempt_ms: Option<u64>,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(read_interval_ms: u64) -> Self {
        Self {
            read_interval_ms,
            last_attempt_ms: None,
            consecutive_failures: 0,
        }
    }

    pub fn backoff_ms(&self) -> u64 {
        (self.consecutive_failures as u64)
            .saturating_mul(BACKOFF_STEP_MS)
            .min(BACKOFF_MAX_MS)
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        let Some(last) = self.last_attempt_ms else {
            return true;
        };
        let elapsed = now_ms.saturating_sub(last);
        elapsed >= self.read_interval_ms && elapsed >= self.backoff_ms()
    }

    pub fn retry_in_ms(&self, now_ms: u64) -> u64 {
        let Some(last) = self.last_attempt_ms else {
            return 0;
        };
        let wait = self.read_interval_ms.max(self.backoff_ms());
        wait.saturating_sub(now_ms.saturating_sub(last))
    }

    /// Records a successful attempt. Returns `true` if the device was failing before.
    pub fn record_success(&mut self, now_ms: u64) -> bool {
        let recovered = self.consecutive_failures > 0;
        self.consecutive_failures = 0;
        self.last_attempt_ms = Some(now_ms);
        recovered
    }

    pub fn record_failure(&mut self, now_ms: u64) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_attempt_ms = Some(now_ms);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_READ_INTERVAL_MS)
    }
}
