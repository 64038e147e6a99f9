use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    rule::{default_rules, SocketRules},
    socket_state::MAX_SOCKETS,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub power_on_threshold_w: f32,
    pub power_off_threshold_w: f32,
    pub min_on_time_s: u64,
    pub min_off_time_s: u64,
    pub max_on_time_s: u64,
    pub light_sample_interval_ms: u64,
    pub delay_period_ms: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            power_on_threshold_w: 1000.0,
            power_off_threshold_w: 990.0,
            min_on_time_s: 300,
            min_off_time_s: 300,
            max_on_time_s: 1800,
            light_sample_interval_ms: 30_000,
            delay_period_ms: 300_000,
        }
    }
}

impl AutomationConfig {
    pub fn min_on_time_ms(&self) -> u64 {
        self.min_on_time_s.saturating_mul(1000)
    }

    pub fn min_off_time_ms(&self) -> u64 {
        self.min_off_time_s.saturating_mul(1000)
    }

    pub fn max_on_time_ms(&self) -> u64 {
        self.max_on_time_s.saturating_mul(1000)
    }

    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        if !self.power_on_threshold_w.is_finite() || self.power_on_threshold_w < 0.0 {
            self.power_on_threshold_w = defaults.power_on_threshold_w;
        }
        if !self.power_off_threshold_w.is_finite() || self.power_off_threshold_w < 0.0 {
            self.power_off_threshold_w = defaults.power_off_threshold_w;
        }
        if self.power_off_threshold_w > self.power_on_threshold_w {
            warn!(
                "off threshold {}W above on threshold {}W, clamping",
                self.power_off_threshold_w, self.power_on_threshold_w
            );
            self.power_off_threshold_w = self.power_on_threshold_w;
        }

        self.max_on_time_s = self.max_on_time_s.max(60);
        self.light_sample_interval_ms = self.light_sample_interval_ms.max(1_000);
        self.delay_period_ms = self.delay_period_ms.max(1_000);
    }
}

/// Network addresses of the devices the node talks to. An empty, `"0"` or
/// `"null"` address leaves the device unconfigured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub meter_ip: String,
    pub socket_ips: Vec<String>,
    pub phone_ip: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            meter_ip: String::new(),
            socket_ips: vec![String::new(); 3],
            phone_ip: String::new(),
        }
    }
}

fn configured(address: &str) -> Option<&str> {
    let address = address.trim();
    match address {
        "" | "0" | "null" => None,
        _ => Some(address),
    }
}

impl DeviceConfig {
    pub fn meter_host(&self) -> Option<&str> {
        configured(&self.meter_ip)
    }

    pub fn phone_host(&self) -> Option<&str> {
        configured(&self.phone_ip)
    }

    /// Address of the socket at `index` (socket id minus one).
    pub fn socket_host(&self, index: usize) -> Option<&str> {
        self.socket_ips.get(index).and_then(|ip| configured(ip))
    }

    pub fn socket_count(&self) -> usize {
        self.socket_ips.len().min(MAX_SOCKETS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub timezone: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            timezone: "Europe/Amsterdam".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub automation: AutomationConfig,
    pub devices: DeviceConfig,
    pub network: NetworkConfig,
    /// Per-socket rules. Left empty, the stock rules for the configured thresholds apply.
    pub rules: Vec<SocketRules>,
}

impl RuntimeConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_str(raw)?;
        config.sanitize();
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        self.automation.sanitize();

        if self.devices.socket_ips.len() > MAX_SOCKETS {
            warn!(
                "{} sockets configured, keeping the first {MAX_SOCKETS}",
                self.devices.socket_ips.len()
            );
            self.devices.socket_ips.truncate(MAX_SOCKETS);
        }

        let socket_count = self.devices.socket_count();
        self.rules.retain(|rules| {
            let valid = rules.socket.index(socket_count).is_ok();
            if !valid {
                warn!("dropping rules for unknown socket {}", rules.socket);
            }
            valid
        });
    }

    pub fn effective_rules(&self) -> Vec<SocketRules> {
        if self.rules.is_empty() {
            default_rules(&self.automation)
                .into_iter()
                .filter(|rules| rules.socket.index(self.devices.socket_count()).is_ok())
                .collect()
        } else {
            self.rules.clone()
        }
    }
}
