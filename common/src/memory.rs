use log::{debug, warn};

use crate::error::AutomationError;

pub const MEMORY_SLOTS: usize = 32;

/// Fixed bank of integer cells backing latch and delay rules.
///
/// Latches store 0/1, delay gates store the monotonic timestamp at which they were
/// armed (0 = idle). Out-of-range slots are rejected without touching any cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySlots {
    cells: [u64; MEMORY_SLOTS],
}

impl Default for MemorySlots {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySlots {
    pub fn new() -> Self {
        Self {
            cells: [0; MEMORY_SLOTS],
        }
    }

    fn check(slot: usize) -> Result<(), AutomationError> {
        if slot < MEMORY_SLOTS {
            Ok(())
        } else {
            warn!("memory slot {slot} out of range");
            Err(AutomationError::InvalidMemorySlot(slot))
        }
    }

    pub fn read(&self, slot: usize) -> Result<u64, AutomationError> {
        Self::check(slot)?;
        Ok(self.cells[slot])
    }

    pub fn set(&mut self, slot: usize, value: u64) -> Result<(), AutomationError> {
        Self::check(slot)?;
        self.cells[slot] = value;
        Ok(())
    }

    /// Set-reset latch. `set` is ignored while the cell is already on and `reset`
    /// while it is already off, so a single call flips at most once.
    pub fn latch_until(
        &mut self,
        slot: usize,
        set: bool,
        reset: bool,
    ) -> Result<bool, AutomationError> {
        Self::check(slot)?;
        let cell = &mut self.cells[slot];
        if *cell == 0 && set {
            *cell = 1;
            debug!("latch {slot} set");
        } else if *cell != 0 && reset {
            *cell = 0;
            debug!("latch {slot} reset");
        }
        Ok(*cell != 0)
    }

    /// Edge-triggered one-shot delay.
    ///
    /// An idle slot armed by `trigger` records `now_ms` and yields false. Once
    /// `delay_ms` has elapsed the gate yields true for exactly one call and returns
    /// to idle. The trigger is not consulted while the gate is armed.
    pub fn delay_gate(
        &mut self,
        slot: usize,
        trigger: bool,
        now_ms: u64,
        delay_ms: u64,
    ) -> Result<bool, AutomationError> {
        Self::check(slot)?;
        let cell = &mut self.cells[slot];

        if *cell == 0 {
            if trigger {
                // 0 means idle, so an arm at t=0 is stored as 1ms.
                *cell = now_ms.max(1);
                debug!("delay {slot} armed at {now_ms}ms");
            }
            return Ok(false);
        }

        if now_ms.saturating_sub(*cell) >= delay_ms {
            *cell = 0;
            debug!("delay {slot} elapsed");
            return Ok(true);
        }

        Ok(false)
    }
}
