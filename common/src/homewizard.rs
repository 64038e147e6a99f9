//! HomeWizard-style device proxies over an injected HTTP transport.
//!
//! Sockets expose `GET/PUT /api/v1/state` with `{"power_on": bool}`; the P1 meter
//! exposes `GET /api/v1/data`. Each proxy paces its own polling with [`Backoff`].

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    devices::{Backoff, PowerMeter, PresenceProbe, SocketDevice},
    error::DeviceError,
};

const OFFLINE_LOG_INTERVAL_MS: u64 = 30_000;
pub const PRESENCE_CHECK_INTERVAL_MS: u64 = 60_000;

/// Blocking HTTP client used by the proxies. Implementations enforce their own
/// request timeout.
pub trait HttpTransport {
    fn get(&mut self, url: &str) -> Result<String, DeviceError>;
    fn put_json(&mut self, url: &str, body: &str) -> Result<String, DeviceError>;
}

/// Single reachability attempt against a host.
pub trait Pinger {
    fn ping(&mut self, host: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SocketStatePayload {
    pub power_on: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct MeterDataPayload {
    pub active_power_w: f32,
    #[serde(default)]
    pub total_power_import_kwh: Option<f64>,
    #[serde(default)]
    pub total_power_export_kwh: Option<f64>,
}

impl MeterDataPayload {
    /// Splits the signed net power into (import, export) watts.
    pub fn import_export_w(&self) -> (f32, f32) {
        if self.active_power_w < 0.0 {
            (0.0, -self.active_power_w)
        } else {
            (self.active_power_w, 0.0)
        }
    }
}

pub struct HomeWizardSocket<T: HttpTransport> {
    transport: T,
    host: String,
    state_url: String,
    last_known_state: bool,
    /// Set by a failed PUT; only a successful read confirms the cache again.
    unconfirmed: bool,
    backoff: Backoff,
    last_log_ms: Option<u64>,
}

impl<T: HttpTransport> HomeWizardSocket<T> {
    pub fn new(host: &str, transport: T) -> Self {
        info!("socket device at {host} initialized");
        Self {
            transport,
            host: host.to_string(),
            state_url: format!("http://{host}/api/v1/state"),
            last_known_state: false,
            unconfirmed: false,
            backoff: Backoff::default(),
            last_log_ms: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn read_state(&mut self) -> Result<bool, DeviceError> {
        let body = self.transport.get(&self.state_url)?;
        let payload: SocketStatePayload =
            serde_json::from_str(&body).map_err(|err| DeviceError::Decode(err.to_string()))?;
        Ok(payload.power_on)
    }

    fn should_log(&mut self, now_ms: u64) -> bool {
        let due = self
            .last_log_ms
            .map(|last| now_ms.saturating_sub(last) >= OFFLINE_LOG_INTERVAL_MS)
            .unwrap_or(true);
        if due {
            self.last_log_ms = Some(now_ms);
        }
        due
    }
}

impl<T: HttpTransport> SocketDevice for HomeWizardSocket<T> {
    fn update(&mut self, now_ms: u64) {
        if !self.backoff.is_due(now_ms) {
            return;
        }

        match self.read_state() {
            Ok(state) => {
                self.last_known_state = state;
                self.unconfirmed = false;
                if self.backoff.record_success(now_ms) {
                    info!("socket {} back online", self.host);
                    self.last_log_ms = Some(now_ms);
                }
                debug!("socket {} is {}", self.host, if state { "on" } else { "off" });
            }
            Err(err) => {
                self.backoff.record_failure(now_ms);
                if self.should_log(now_ms) {
                    warn!(
                        "socket {} offline: {err} (retry in {}s)",
                        self.host,
                        self.backoff.backoff_ms() / 1000
                    );
                }
            }
        }
    }

    fn current_state(&self) -> bool {
        self.last_known_state
    }

    fn set_state(&mut self, on: bool) -> Result<(), DeviceError> {
        let body = serde_json::to_string(&SocketStatePayload { power_on: on })
            .map_err(|err| DeviceError::Decode(err.to_string()))?;
        if let Err(err) = self.transport.put_json(&self.state_url, &body) {
            self.unconfirmed = true;
            return Err(err);
        }
        self.last_known_state = on;
        info!("socket {} switched {}", self.host, if on { "on" } else { "off" });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.backoff.consecutive_failures() == 0 && !self.unconfirmed
    }
}

pub struct HomeWizardMeter<T: HttpTransport> {
    transport: T,
    data_url: String,
    import_w: f32,
    export_w: f32,
    total_import_kwh: f64,
    total_export_kwh: f64,
    connected: bool,
    backoff: Backoff,
}

impl<T: HttpTransport> HomeWizardMeter<T> {
    pub fn new(host: &str, transport: T) -> Self {
        Self {
            transport,
            data_url: format!("http://{host}/api/v1/data"),
            import_w: 0.0,
            export_w: 0.0,
            total_import_kwh: 0.0,
            total_export_kwh: 0.0,
            connected: false,
            backoff: Backoff::default(),
        }
    }

    fn read_data(&mut self) -> Result<MeterDataPayload, DeviceError> {
        let body = self.transport.get(&self.data_url)?;
        serde_json::from_str(&body).map_err(|err| DeviceError::Decode(err.to_string()))
    }
}

impl<T: HttpTransport> PowerMeter for HomeWizardMeter<T> {
    fn update(&mut self, now_ms: u64) {
        if !self.backoff.is_due(now_ms) {
            return;
        }

        match self.read_data() {
            Ok(data) => {
                (self.import_w, self.export_w) = data.import_export_w();
                if let Some(total) = data.total_power_import_kwh {
                    self.total_import_kwh = total;
                }
                if let Some(total) = data.total_power_export_kwh {
                    self.total_export_kwh = total;
                }
                if self.backoff.record_success(now_ms) {
                    info!("p1 meter back online");
                }
                self.connected = true;
            }
            Err(err) => {
                if self.connected {
                    warn!("p1 meter read failed: {err}");
                }
                self.backoff.record_failure(now_ms);
                self.connected = false;
            }
        }
    }

    fn current_import_w(&self) -> f32 {
        self.import_w
    }

    fn current_export_w(&self) -> f32 {
        self.export_w
    }

    fn total_import_kwh(&self) -> f64 {
        self.total_import_kwh
    }

    fn total_export_kwh(&self) -> f64 {
        self.total_export_kwh
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Presence probe that pings at most once per [`PRESENCE_CHECK_INTERVAL_MS`] and
/// answers from cache in between.
pub struct CachedPresence<P: Pinger> {
    pinger: P,
    host: String,
    last_known: bool,
    last_check_ms: Option<u64>,
    consecutive_failures: u32,
}

impl<P: Pinger> CachedPresence<P> {
    pub fn new(host: &str, pinger: P) -> Self {
        info!("presence check for {host} initialized");
        Self {
            pinger,
            host: host.to_string(),
            last_known: false,
            last_check_ms: None,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl<P: Pinger> PresenceProbe for CachedPresence<P> {
    fn is_present(&mut self, now_ms: u64) -> bool {
        if let Some(last) = self.last_check_ms {
            if now_ms.saturating_sub(last) < PRESENCE_CHECK_INTERVAL_MS {
                return self.last_known;
            }
        }
        self.last_check_ms = Some(now_ms);

        let reachable = self.pinger.ping(&self.host);
        if reachable {
            if !self.last_known {
                info!("presence: {} detected", self.host);
            }
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.last_known {
                info!("presence: {} lost", self.host);
            }
        }

        self.last_known = reachable;
        reachable
    }
}
