use thiserror::Error;

/// Failures surfaced by the automation core. None of them are fatal: callers log
/// and keep cycling.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AutomationError {
    #[error("invalid socket id {0}")]
    InvalidSocketId(u8),
    #[error("invalid memory slot {0}")]
    InvalidMemorySlot(usize),
    #[error("device unreachable{}: {reason}", socket.map(|id| format!(" (socket {id})")).unwrap_or_default())]
    DeviceUnreachable { socket: Option<u8>, reason: String },
    #[error("wall clock not synchronized")]
    TimeUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("network not connected")]
    NotConnected,
    #[error("http request failed: {0}")]
    Http(String),
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("invalid device payload: {0}")]
    Decode(String),
    #[error("backing off, retry in {retry_in_ms}ms")]
    Backoff { retry_in_ms: u64 },
}

impl AutomationError {
    pub fn unreachable(socket: Option<u8>, err: &DeviceError) -> Self {
        Self::DeviceUnreachable {
            socket,
            reason: err.to_string(),
        }
    }
}
