use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{clock::TimeOfDay, error::AutomationError};

/// Upper bound on configured sockets. Keeps every id inside `u8`.
pub const MAX_SOCKETS: usize = 16;

/// One-based socket number, validated against the configured socket count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketId(pub u8);

impl SocketId {
    pub fn index(self, socket_count: usize) -> Result<usize, AutomationError> {
        let number = self.0 as usize;
        if (1..=socket_count).contains(&number) {
            Ok(number - 1)
        } else {
            Err(AutomationError::InvalidSocketId(self.0))
        }
    }

    pub fn from_index(index: usize) -> Self {
        debug_assert!(index < MAX_SOCKETS);
        Self(u8::try_from(index + 1).unwrap_or(u8::MAX))
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine-side record of one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRuntimeState {
    current_state: bool,
    tracked_since_ms: u64,
    last_state_change_ms: Option<u64>,
    last_change_at: Option<TimeOfDay>,
    transition_acknowledged: bool,
    forced_off: bool,
}

impl SocketRuntimeState {
    pub fn new(now_ms: u64) -> Self {
        Self {
            current_state: false,
            tracked_since_ms: now_ms,
            last_state_change_ms: None,
            last_change_at: None,
            transition_acknowledged: true,
            forced_off: false,
        }
    }

    pub fn reset(&mut self, now_ms: u64) {
        *self = Self::new(now_ms);
    }

    pub fn current_state(&self) -> bool {
        self.current_state
    }

    pub fn last_state_change_ms(&self) -> Option<u64> {
        self.last_state_change_ms
    }

    /// Wall-clock time of the last transition, for display.
    pub fn last_change_at(&self) -> Option<TimeOfDay> {
        self.last_change_at
    }

    pub fn transition_acknowledged(&self) -> bool {
        self.transition_acknowledged
    }

    pub fn forced_off(&self) -> bool {
        self.forced_off
    }

    /// Time spent in the current state. Before any transition this counts from
    /// the moment tracking started.
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_state_change_ms.unwrap_or(self.tracked_since_ms))
    }

    /// Whole minutes in the current state, truncated.
    pub fn elapsed_minutes(&self, now_ms: u64) -> u64 {
        self.elapsed_ms(now_ms) / 60_000
    }

    /// Elapsed time since the last transition, `None` if there never was one.
    pub fn since_last_change_ms(&self, now_ms: u64) -> Option<u64> {
        self.last_state_change_ms
            .map(|last| now_ms.saturating_sub(last))
    }

    /// Reconciles with the state reported by the device. Returns `true` when a
    /// transition was observed.
    pub fn observe(&mut self, device_state: bool, now_ms: u64, wall: Option<TimeOfDay>) -> bool {
        if device_state == self.current_state {
            return false;
        }

        self.current_state = device_state;
        self.last_state_change_ms = Some(now_ms);
        self.last_change_at = wall;
        self.transition_acknowledged = false;
        if device_state {
            self.forced_off = false;
        }
        true
    }

    /// Records a command the engine issued successfully.
    pub fn record_command(&mut self, state: bool, now_ms: u64, wall: Option<TimeOfDay>) {
        if state != self.current_state {
            self.current_state = state;
            self.last_state_change_ms = Some(now_ms);
            self.last_change_at = wall;
        }
        if state {
            self.forced_off = false;
        }
        self.transition_acknowledged = true;
    }

    /// Records the safety cutoff regardless of whether the device accepted it.
    pub fn record_forced_off(&mut self, now_ms: u64, wall: Option<TimeOfDay>) {
        self.current_state = false;
        self.last_state_change_ms = Some(now_ms);
        self.last_change_at = wall;
        self.transition_acknowledged = true;
        self.forced_off = true;
    }

    pub(crate) fn clear_forced_off(&mut self) {
        self.forced_off = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_id_range_is_one_based() {
        assert_eq!(SocketId(1).index(3), Ok(0));
        assert_eq!(SocketId(3).index(3), Ok(2));
        assert_eq!(
            SocketId(0).index(3),
            Err(AutomationError::InvalidSocketId(0))
        );
        assert_eq!(
            SocketId(4).index(3),
            Err(AutomationError::InvalidSocketId(4))
        );
    }

    #[test]
    fn from_index_is_one_based() {
        assert_eq!(SocketId::from_index(0), SocketId(1));
        assert_eq!(SocketId::from_index(MAX_SOCKETS - 1).0 as usize, MAX_SOCKETS);
    }

    #[test]
    fn starts_off_and_acknowledged() {
        let state = SocketRuntimeState::new(500);
        assert!(!state.current_state());
        assert!(state.transition_acknowledged());
        assert!(!state.forced_off());
        assert_eq!(state.last_state_change_ms(), None);
        assert_eq!(state.elapsed_ms(60_500), 60_000);
    }

    #[test]
    fn observe_only_stamps_real_transitions() {
        let mut state = SocketRuntimeState::new(0);
        let wall = TimeOfDay::new(17, 45);

        assert!(!state.observe(false, 1_000, wall));
        assert_eq!(state.last_state_change_ms(), None);

        assert!(state.observe(true, 2_000, wall));
        assert_eq!(state.last_state_change_ms(), Some(2_000));
        assert_eq!(state.last_change_at(), wall);
        assert!(!state.transition_acknowledged());

        assert!(!state.observe(true, 3_000, wall));
        assert_eq!(state.last_state_change_ms(), Some(2_000));
    }

    #[test]
    fn repeated_command_keeps_timestamp() {
        let mut state = SocketRuntimeState::new(0);
        state.record_command(true, 1_000, None);
        state.record_command(true, 9_000, None);

        assert_eq!(state.last_state_change_ms(), Some(1_000));
        assert!(state.transition_acknowledged());
    }

    #[test]
    fn observed_on_clears_forced_off() {
        let mut state = SocketRuntimeState::new(0);
        state.record_command(true, 0, None);
        state.record_forced_off(1_000, None);
        assert!(state.forced_off());
        assert!(!state.current_state());

        state.observe(true, 2_000, None);
        assert!(!state.forced_off());
    }

    #[test]
    fn elapsed_minutes_truncate() {
        let mut state = SocketRuntimeState::new(0);
        state.record_command(true, 0, None);
        assert_eq!(state.elapsed_minutes(119_999), 1);
        assert_eq!(state.elapsed_minutes(120_000), 2);
    }

    #[test]
    fn reset_restores_initial_record() {
        let mut state = SocketRuntimeState::new(0);
        state.record_command(true, 100, None);
        state.record_forced_off(200, None);

        state.reset(300);
        assert_eq!(state, SocketRuntimeState::new(300));
    }
}
