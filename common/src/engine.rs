use log::{debug, info, warn};

use crate::{
    clock::{self, TimeOfDay, FALLBACK_TIME},
    config::AutomationConfig,
    devices::{Devices, PowerMeter, SocketDevice},
    error::{AutomationError, DeviceError},
    memory::MemorySlots,
    rule::{logical_and, logical_not, logical_or, Rule, SocketRules},
    safety::{Denial, SafetyPolicy},
    socket_state::{SocketId, SocketRuntimeState, MAX_SOCKETS},
    types::{format_duration, SocketStatus},
};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    Commanded {
        socket: SocketId,
        state: bool,
    },
    CommandFailed {
        socket: SocketId,
        state: bool,
        error: AutomationError,
    },
    Denied {
        socket: SocketId,
        state: bool,
        reason: Denial,
    },
    ForcedOff {
        socket: SocketId,
        command_ok: bool,
    },
}

fn on_off(state: bool) -> &'static str {
    if state {
        "on"
    } else {
        "off"
    }
}

/// Decides, once per cycle, which sockets to switch.
///
/// The engine owns the per-socket records, the memory slots and the last light
/// sample. Devices stay with the caller and are lent in through [`Devices`] on
/// every call.
#[derive(Debug, Clone)]
pub struct AutomationEngine {
    config: AutomationConfig,
    policy: SafetyPolicy,
    sockets: Vec<SocketRuntimeState>,
    memory: MemorySlots,
    lux: Option<f32>,
    last_light_sample_ms: Option<u64>,
}

impl AutomationEngine {
    pub fn new(mut config: AutomationConfig, socket_count: usize, now_ms: u64) -> Self {
        config.sanitize();
        Self {
            policy: SafetyPolicy::from_config(&config),
            config,
            sockets: vec![SocketRuntimeState::new(now_ms); socket_count.min(MAX_SOCKETS)],
            memory: MemorySlots::new(),
            lux: None,
            last_light_sample_ms: None,
        }
    }

    pub fn config(&self) -> &AutomationConfig {
        &self.config
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn current_lux(&self) -> Option<f32> {
        self.lux
    }

    pub fn socket_state(&self, id: SocketId) -> Result<&SocketRuntimeState, AutomationError> {
        let index = self.index(id)?;
        Ok(&self.sockets[index])
    }

    fn index(&self, id: SocketId) -> Result<usize, AutomationError> {
        id.index(self.sockets.len()).inspect_err(|err| warn!("{err}"))
    }

    fn wall_time<S: SocketDevice>(devices: &Devices<'_, S>) -> Option<TimeOfDay> {
        devices.clock.wall_clock().map(|wall| wall.time_of_day())
    }

    /// One full automation pass: light sample, every socket's rules in order, then
    /// the max-on sweep.
    pub fn run_cycle<S: SocketDevice>(
        &mut self,
        devices: &mut Devices<'_, S>,
        rules: &[SocketRules],
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        self.update_light(devices);

        for socket_rules in rules {
            let id = socket_rules.socket;
            let Ok(index) = self.index(id) else {
                continue;
            };
            if devices.socket(index).is_none() {
                debug!("socket {id} not configured, skipping rules");
                continue;
            }

            let on = self.evaluate(devices, &socket_rules.turn_on);
            match self.turn_on(devices, id, on) {
                Ok(Some(action)) => actions.push(action),
                Ok(None) => {}
                Err(err) => warn!("socket {id} turn on: {err}"),
            }

            let off = self.evaluate(devices, &socket_rules.turn_off);
            match self.turn_off(devices, id, off) {
                Ok(Some(action)) => actions.push(action),
                Ok(None) => {}
                Err(err) => warn!("socket {id} turn off: {err}"),
            }
        }

        actions.extend(self.enforce_max_on_time(devices));
        actions
    }

    /// Refreshes every configured socket proxy.
    pub fn poll_devices<S: SocketDevice>(&mut self, devices: &mut Devices<'_, S>) {
        let now = devices.now_ms();
        for socket in devices.sockets.iter_mut().flatten() {
            socket.update(now);
        }
    }

    pub fn turn_on<S: SocketDevice>(
        &mut self,
        devices: &mut Devices<'_, S>,
        id: SocketId,
        condition: bool,
    ) -> Result<Option<EngineAction>, AutomationError> {
        self.request(devices, id, true, condition)
    }

    pub fn turn_off<S: SocketDevice>(
        &mut self,
        devices: &mut Devices<'_, S>,
        id: SocketId,
        condition: bool,
    ) -> Result<Option<EngineAction>, AutomationError> {
        self.request(devices, id, false, condition)
    }

    fn request<S: SocketDevice>(
        &mut self,
        devices: &mut Devices<'_, S>,
        id: SocketId,
        requested: bool,
        condition: bool,
    ) -> Result<Option<EngineAction>, AutomationError> {
        let index = self.index(id)?;
        // Dwell checks must see transitions made outside the engine.
        self.refresh_duration(devices, id)?;

        let record = &self.sockets[index];
        let needs_command =
            record.current_state() != requested || !record.transition_acknowledged();
        let action = if condition && needs_command {
            Some(self.attempt(devices, index, requested))
        } else {
            None
        };

        self.refresh_duration(devices, id)?;
        Ok(action)
    }

    fn attempt<S: SocketDevice>(
        &mut self,
        devices: &mut Devices<'_, S>,
        index: usize,
        requested: bool,
    ) -> EngineAction {
        let id = SocketId::from_index(index);
        let now = devices.now_ms();

        if let Err(reason) = self.policy.check(&mut self.sockets[index], requested, now) {
            debug!("socket {id} {} denied: {reason}", on_off(requested));
            return EngineAction::Denied {
                socket: id,
                state: requested,
                reason,
            };
        }

        let wall = Self::wall_time(devices);
        let result = match devices.socket_mut(index) {
            Some(socket) => socket.set_state(requested),
            None => Err(DeviceError::NotConnected),
        };

        match result {
            Ok(()) => {
                self.sockets[index].record_command(requested, now, wall);
                info!("socket {id} turned {}", on_off(requested));
                EngineAction::Commanded {
                    socket: id,
                    state: requested,
                }
            }
            Err(err) => {
                let error = AutomationError::unreachable(Some(id.0), &err);
                warn!("{error}");
                EngineAction::CommandFailed {
                    socket: id,
                    state: requested,
                    error,
                }
            }
        }
    }

    /// Reconciles the socket record with the proxy's last known state. A proxy whose
    /// last read failed is treated as unknown and leaves the record alone.
    pub fn refresh_duration<S: SocketDevice>(
        &mut self,
        devices: &Devices<'_, S>,
        id: SocketId,
    ) -> Result<(), AutomationError> {
        let index = self.index(id)?;
        let Some(socket) = devices.socket(index) else {
            return Err(AutomationError::unreachable(
                Some(id.0),
                &DeviceError::NotConnected,
            ));
        };
        if !socket.is_connected() {
            return Ok(());
        }

        let device_state = socket.current_state();
        let wall = Self::wall_time(devices);
        if self.sockets[index].observe(device_state, devices.now_ms(), wall) {
            info!("socket {id} observed {}", on_off(device_state));
        }
        Ok(())
    }

    /// Cuts every socket that has been on longer than the max-on time. Dwell limits
    /// do not apply and the record is updated even if the command fails.
    pub fn enforce_max_on_time<S: SocketDevice>(
        &mut self,
        devices: &mut Devices<'_, S>,
    ) -> Vec<EngineAction> {
        let now = devices.now_ms();
        let wall = Self::wall_time(devices);
        let mut actions = Vec::new();

        for index in 0..self.sockets.len() {
            if !self.policy.max_on_exceeded(&self.sockets[index], now) {
                continue;
            }
            let id = SocketId::from_index(index);
            warn!(
                "socket {id} on for {}, max on time reached, forcing off",
                format_duration(self.sockets[index].elapsed_ms(now))
            );

            let result = match devices.socket_mut(index) {
                Some(socket) => socket.set_state(false),
                None => Err(DeviceError::NotConnected),
            };
            let command_ok = match result {
                Ok(()) => true,
                Err(err) => {
                    warn!("socket {id} forced off but command failed: {err}");
                    false
                }
            };
            self.sockets[index].record_forced_off(now, wall);
            actions.push(EngineAction::ForcedOff {
                socket: id,
                command_ok,
            });
        }

        actions
    }

    /// Switches a socket on behalf of the user. Dwell limits are skipped; the
    /// max-on cutoff still applies on later cycles.
    pub fn manual_switch<S: SocketDevice>(
        &mut self,
        devices: &mut Devices<'_, S>,
        id: SocketId,
        state: bool,
    ) -> Result<(), AutomationError> {
        let index = self.index(id)?;
        let now = devices.now_ms();
        let wall = Self::wall_time(devices);
        let socket = devices
            .socket_mut(index)
            .ok_or_else(|| AutomationError::unreachable(Some(id.0), &DeviceError::NotConnected))?;

        socket
            .set_state(state)
            .map_err(|err| AutomationError::unreachable(Some(id.0), &err))?;
        self.sockets[index].record_command(state, now, wall);
        info!("socket {id} switched {} manually", on_off(state));
        Ok(())
    }

    /// Rule-driven transition check. An allowed ON clears the forced-off flag.
    pub fn can_transition(
        &mut self,
        id: SocketId,
        requested: bool,
        now_ms: u64,
    ) -> Result<bool, AutomationError> {
        let index = self.index(id)?;
        Ok(self
            .policy
            .check(&mut self.sockets[index], requested, now_ms)
            .is_ok())
    }

    pub fn is_on<S: SocketDevice>(
        &mut self,
        devices: &Devices<'_, S>,
        id: SocketId,
    ) -> Result<bool, AutomationError> {
        self.refresh_duration(devices, id)?;
        Ok(self.socket_state(id)?.current_state())
    }

    pub fn is_off<S: SocketDevice>(
        &mut self,
        devices: &Devices<'_, S>,
        id: SocketId,
    ) -> Result<bool, AutomationError> {
        self.is_on(devices, id).map(|on| !on)
    }

    pub fn has_been_on_for<S: SocketDevice>(
        &mut self,
        devices: &Devices<'_, S>,
        id: SocketId,
        minutes: u32,
    ) -> Result<bool, AutomationError> {
        self.has_been_in_state_for(devices, id, true, minutes)
    }

    pub fn has_been_off_for<S: SocketDevice>(
        &mut self,
        devices: &Devices<'_, S>,
        id: SocketId,
        minutes: u32,
    ) -> Result<bool, AutomationError> {
        self.has_been_in_state_for(devices, id, false, minutes)
    }

    fn has_been_in_state_for<S: SocketDevice>(
        &mut self,
        devices: &Devices<'_, S>,
        id: SocketId,
        state: bool,
        minutes: u32,
    ) -> Result<bool, AutomationError> {
        self.refresh_duration(devices, id)?;
        let record = self.socket_state(id)?;
        Ok(record.current_state() == state
            && record.elapsed_minutes(devices.now_ms()) >= u64::from(minutes))
    }

    /// Time of day for window rules, [`FALLBACK_TIME`] while unsynchronized.
    pub fn time_of_day<S: SocketDevice>(&self, devices: &Devices<'_, S>) -> TimeOfDay {
        match devices.clock.wall_clock() {
            Some(wall) => wall.time_of_day(),
            None => {
                debug!("{}, assuming {FALLBACK_TIME}", AutomationError::TimeUnavailable);
                FALLBACK_TIME
            }
        }
    }

    pub fn time_after<S: SocketDevice>(&self, devices: &Devices<'_, S>, at: TimeOfDay) -> bool {
        clock::time_after(self.time_of_day(devices), at)
    }

    /// `time_after` against `at` shifted by `minutes` and, if asked, the day's
    /// jitter. Without a synchronized clock no jitter is added.
    pub fn time_after_offset<S: SocketDevice>(
        &self,
        devices: &Devices<'_, S>,
        at: TimeOfDay,
        minutes: u32,
        daily_jitter: bool,
    ) -> bool {
        let jitter = match devices.clock.wall_clock() {
            Some(wall) if daily_jitter => clock::daily_jitter_minutes(wall.day_of_year),
            _ => 0,
        };
        let target = at.plus_minutes(minutes + jitter);
        debug!("shifted start {at} -> {target}");
        clock::time_after(self.time_of_day(devices), target)
    }

    pub fn time_before<S: SocketDevice>(&self, devices: &Devices<'_, S>, at: TimeOfDay) -> bool {
        clock::time_before(self.time_of_day(devices), at)
    }

    pub fn time_between<S: SocketDevice>(
        &self,
        devices: &Devices<'_, S>,
        start: TimeOfDay,
        end: TimeOfDay,
    ) -> bool {
        clock::time_between(self.time_of_day(devices), start, end)
    }

    /// Samples the light sensor when the sample interval has elapsed.
    pub fn update_light<S: SocketDevice>(&mut self, devices: &mut Devices<'_, S>) {
        let now = devices.now_ms();
        let due = self
            .last_light_sample_ms
            .map(|last| now.saturating_sub(last) >= self.config.light_sample_interval_ms)
            .unwrap_or(true);
        if !due {
            return;
        }
        let Some(sensor) = devices.light.as_deref_mut() else {
            return;
        };

        self.last_light_sample_ms = Some(now);
        match sensor.light_level() {
            Some(lux) => {
                debug!("light level {lux:.1} lux");
                self.lux = Some(lux);
            }
            None => warn!("light sensor read failed, keeping last sample"),
        }
    }

    pub fn light_above(&self, lux: f32) -> bool {
        self.lux.is_some_and(|current| current > lux)
    }

    pub fn light_below(&self, lux: f32) -> bool {
        self.lux.is_some_and(|current| current < lux)
    }

    pub fn presence_detected<S: SocketDevice>(&self, devices: &mut Devices<'_, S>) -> bool {
        let now = devices.now_ms();
        devices
            .presence
            .as_deref_mut()
            .is_some_and(|probe| probe.is_present(now))
    }

    pub fn latch_until(
        &mut self,
        slot: usize,
        set: bool,
        reset: bool,
    ) -> Result<bool, AutomationError> {
        self.memory.latch_until(slot, set, reset)
    }

    pub fn delay_gate(
        &mut self,
        slot: usize,
        trigger: bool,
        now_ms: u64,
    ) -> Result<bool, AutomationError> {
        self.memory
            .delay_gate(slot, trigger, now_ms, self.config.delay_period_ms)
    }

    pub fn memory_set(&mut self, slot: usize, value: u64) -> Result<(), AutomationError> {
        self.memory.set(slot, value)
    }

    pub fn memory_read(&self, slot: usize) -> Result<u64, AutomationError> {
        self.memory.read(slot)
    }

    /// Evaluates a rule tree. Every operand is evaluated, so latches and delays
    /// nested under a combinator advance on every cycle. Errors evaluate to false.
    pub fn evaluate<S: SocketDevice>(&mut self, devices: &mut Devices<'_, S>, rule: &Rule) -> bool {
        let result = match rule {
            Rule::Always => true,
            Rule::Never => false,
            Rule::TimeAfter { at } => self.time_after(devices, *at),
            Rule::TimeAfterOffset {
                at,
                minutes,
                daily_jitter,
            } => self.time_after_offset(devices, *at, *minutes, *daily_jitter),
            Rule::TimeBefore { at } => self.time_before(devices, *at),
            Rule::TimeBetween { start, end } => self.time_between(devices, *start, *end),
            Rule::Weekday { days } => devices
                .clock
                .wall_clock()
                .is_some_and(|wall| days.contains(wall.weekday)),
            Rule::LightAbove { lux } => self.light_above(*lux),
            Rule::LightBelow { lux } => self.light_below(*lux),
            Rule::Present => self.presence_detected(devices),
            Rule::Absent => !self.presence_detected(devices),
            Rule::ExportAbove { watts } => {
                Self::meter_reading(devices, |meter| meter.current_export_w() > *watts)
            }
            Rule::ExportBelow { watts } => {
                Self::meter_reading(devices, |meter| meter.current_export_w() < *watts)
            }
            Rule::ImportAbove { watts } => {
                Self::meter_reading(devices, |meter| meter.current_import_w() > *watts)
            }
            Rule::ImportBelow { watts } => {
                Self::meter_reading(devices, |meter| meter.current_import_w() < *watts)
            }
            Rule::IsOn { socket } => self.is_on(devices, *socket).unwrap_or(false),
            Rule::IsOff { socket } => self.is_off(devices, *socket).unwrap_or(false),
            Rule::OnFor { socket, minutes } => self
                .has_been_on_for(devices, *socket, *minutes)
                .unwrap_or(false),
            Rule::OffFor { socket, minutes } => self
                .has_been_off_for(devices, *socket, *minutes)
                .unwrap_or(false),
            Rule::And { all } => all
                .iter()
                .map(|rule| i32::from(self.evaluate(devices, rule)))
                .fold(true, |acc, value| logical_and(i32::from(acc), value)),
            Rule::Or { any } => any
                .iter()
                .map(|rule| i32::from(self.evaluate(devices, rule)))
                .fold(false, |acc, value| logical_or(i32::from(acc), value)),
            Rule::Not { rule } => logical_not(i32::from(self.evaluate(devices, rule))),
            Rule::Latch { slot, set, reset } => {
                let set = self.evaluate(devices, set);
                let reset = self.evaluate(devices, reset);
                self.latch_until(*slot, set, reset).unwrap_or(false)
            }
            Rule::Delay { slot, trigger } => {
                let trigger = self.evaluate(devices, trigger);
                let now = devices.now_ms();
                self.delay_gate(*slot, trigger, now).unwrap_or(false)
            }
        };

        debug!("{rule:?} -> {result}");
        result
    }

    fn meter_reading<S: SocketDevice>(
        devices: &Devices<'_, S>,
        check: impl FnOnce(&dyn PowerMeter) -> bool,
    ) -> bool {
        match devices.meter {
            Some(meter) if meter.is_connected() => check(meter),
            _ => false,
        }
    }

    pub fn socket_statuses<S: SocketDevice>(
        &self,
        sockets: &[Option<S>],
        now_ms: u64,
    ) -> Vec<SocketStatus> {
        self.sockets
            .iter()
            .enumerate()
            .map(|(index, record)| {
                let duration_ms = record.elapsed_ms(now_ms);
                SocketStatus {
                    socket: SocketId::from_index(index),
                    state: record.current_state(),
                    connected: sockets
                        .get(index)
                        .and_then(Option::as_ref)
                        .is_some_and(SocketDevice::is_connected),
                    forced_off: record.forced_off(),
                    duration: format_duration(duration_ms),
                    duration_ms,
                    last_change: record.last_change_at().map(|at| at.to_string()),
                }
            })
            .collect()
    }

    /// Returns every socket record and memory slot to its initial state.
    pub fn reset(&mut self, now_ms: u64) {
        for record in &mut self.sockets {
            record.reset(now_ms);
        }
        self.memory = MemorySlots::new();
        self.lux = None;
        self.last_light_sample_ms = None;
    }
}
