use log::info;
use thiserror::Error;

use crate::{config::AutomationConfig, socket_state::SocketRuntimeState};

/// Reason a rule-driven transition was held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("forced off, minimum off time not reached ({remaining_ms}ms left)")]
    MinOffTime { remaining_ms: u64 },
    #[error("minimum on time not reached ({remaining_ms}ms left)")]
    MinOnTime { remaining_ms: u64 },
}

/// Dwell limits and the max-on cutoff, applied to every socket alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyPolicy {
    pub min_on_ms: u64,
    pub min_off_ms: u64,
    pub max_on_ms: u64,
}

impl SafetyPolicy {
    pub fn from_config(config: &AutomationConfig) -> Self {
        Self {
            min_on_ms: config.min_on_time_ms(),
            min_off_ms: config.min_off_time_ms(),
            max_on_ms: config.max_on_time_ms(),
        }
    }

    /// Checks a rule-driven transition. An ON request that is allowed clears the
    /// socket's forced-off flag.
    pub fn check(
        &self,
        state: &mut SocketRuntimeState,
        requested: bool,
        now_ms: u64,
    ) -> Result<(), Denial> {
        // A socket that never changed state has nothing to dwell on.
        let Some(elapsed) = state.since_last_change_ms(now_ms) else {
            if requested {
                state.clear_forced_off();
            }
            return Ok(());
        };

        if requested {
            if state.forced_off() && elapsed < self.min_off_ms {
                return Err(Denial::MinOffTime {
                    remaining_ms: self.min_off_ms - elapsed,
                });
            }
            if state.forced_off() {
                info!("forced-off hold released after {}s", elapsed / 1000);
                state.clear_forced_off();
            }
            Ok(())
        } else if elapsed < self.min_on_ms {
            Err(Denial::MinOnTime {
                remaining_ms: self.min_on_ms - elapsed,
            })
        } else {
            Ok(())
        }
    }

    pub fn max_on_exceeded(&self, state: &SocketRuntimeState, now_ms: u64) -> bool {
        state.current_state() && state.elapsed_ms(now_ms) > self.max_on_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60_000;

    fn policy() -> SafetyPolicy {
        SafetyPolicy::from_config(&AutomationConfig::default())
    }

    #[test]
    fn defaults_come_from_config_seconds() {
        assert_eq!(
            policy(),
            SafetyPolicy {
                min_on_ms: 5 * MINUTE,
                min_off_ms: 5 * MINUTE,
                max_on_ms: 30 * MINUTE,
            }
        );
    }

    #[test]
    fn off_request_waits_for_min_on_time() {
        let mut state = SocketRuntimeState::new(0);
        state.record_command(true, 0, None);

        assert_eq!(
            policy().check(&mut state, false, 4 * MINUTE),
            Err(Denial::MinOnTime {
                remaining_ms: MINUTE
            })
        );
        assert_eq!(policy().check(&mut state, false, 5 * MINUTE), Ok(()));
    }

    #[test]
    fn on_request_is_free_unless_forced_off() {
        let mut state = SocketRuntimeState::new(0);
        state.record_command(true, 0, None);
        state.record_command(false, 10 * MINUTE, None);

        assert_eq!(policy().check(&mut state, true, 10 * MINUTE + 1), Ok(()));
    }

    #[test]
    fn forced_off_holds_until_min_off_time() {
        let mut state = SocketRuntimeState::new(0);
        state.record_command(true, 0, None);
        state.record_forced_off(30 * MINUTE, None);

        assert!(policy().check(&mut state, true, 31 * MINUTE).is_err());
        assert!(state.forced_off());

        assert_eq!(policy().check(&mut state, true, 35 * MINUTE), Ok(()));
        assert!(!state.forced_off());
    }

    #[test]
    fn untouched_socket_passes_dwell() {
        let mut state = SocketRuntimeState::new(0);
        assert_eq!(policy().check(&mut state, false, 1), Ok(()));
        assert_eq!(policy().check(&mut state, true, 1), Ok(()));
    }

    #[test]
    fn max_on_is_strictly_greater() {
        let mut state = SocketRuntimeState::new(0);
        state.record_command(true, 0, None);

        assert!(!policy().max_on_exceeded(&state, 30 * MINUTE));
        assert!(policy().max_on_exceeded(&state, 30 * MINUTE + 1));

        state.record_command(false, 40 * MINUTE, None);
        assert!(!policy().max_on_exceeded(&state, 90 * MINUTE));
    }
}
