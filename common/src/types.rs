use serde::{Deserialize, Serialize};

use crate::socket_state::SocketId;

/// Snapshot served at `GET /data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeStatus {
    pub import_power: f32,
    pub export_power: f32,
    pub total_import: f64,
    pub total_export: f64,
    pub today_import: f64,
    pub today_export: f64,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub light: Option<f32>,
    /// Local time as `HH:MM`, absent until the clock is synchronized.
    pub time: Option<String>,
    pub time_synced: bool,
    pub meter_connected: bool,
    pub present: bool,
    pub switches: Vec<SocketStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketStatus {
    pub socket: SocketId,
    pub state: bool,
    pub connected: bool,
    pub forced_off: bool,
    pub duration: String,
    pub duration_ms: u64,
    pub last_change: Option<String>,
}

/// Body of `POST /switch/{n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRequest {
    pub state: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SwitchResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Renders a dwell duration the way the status page shows it: `"1h 23m"`, or
/// `"5m"` below an hour.
pub fn format_duration(duration_ms: u64) -> String {
    let minutes = duration_ms / 60_000;
    let (hours, minutes) = (minutes / 60, minutes % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
