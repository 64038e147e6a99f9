use std::cell::Cell;

use powernode_common::{
    AutomationConfig, AutomationEngine, Clock, DayOfWeek, DeviceError, Devices, EngineAction,
    PowerMeter, Rule, RuntimeConfig, SocketDevice, SocketId, SocketRules, TimeOfDay, WallClock,
};

const SECOND: u64 = 1_000;
const MINUTE: u64 = 60 * SECOND;

struct ManualClock {
    now: Cell<u64>,
    wall: Cell<Option<WallClock>>,
}

impl ManualClock {
    fn new() -> Self {
        Self {
            now: Cell::new(0),
            wall: Cell::new(None),
        }
    }

    fn set(&self, now_ms: u64) {
        self.now.set(now_ms);
    }

    fn set_wall(&self, hour: u8, minute: u8) {
        self.wall.set(Some(WallClock {
            hour,
            minute,
            weekday: DayOfWeek::Wed,
            day_of_year: 100,
        }));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn wall_clock(&self) -> Option<WallClock> {
        self.wall.get()
    }
}

#[derive(Default)]
struct MockSocket {
    state: bool,
    commands: Vec<bool>,
}

impl SocketDevice for MockSocket {
    fn update(&mut self, _now_ms: u64) {}

    fn current_state(&self) -> bool {
        self.state
    }

    fn set_state(&mut self, on: bool) -> Result<(), DeviceError> {
        self.commands.push(on);
        self.state = on;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

struct MockMeter {
    export_w: Cell<f32>,
}

impl PowerMeter for MockMeter {
    fn update(&mut self, _now_ms: u64) {}

    fn current_import_w(&self) -> f32 {
        0.0
    }

    fn current_export_w(&self) -> f32 {
        self.export_w.get()
    }

    fn total_import_kwh(&self) -> f64 {
        0.0
    }

    fn total_export_kwh(&self) -> f64 {
        0.0
    }

    fn is_connected(&self) -> bool {
        true
    }
}

struct Rig {
    clock: ManualClock,
    meter: MockMeter,
    sockets: Vec<Option<MockSocket>>,
    engine: AutomationEngine,
    rules: Vec<SocketRules>,
}

impl Rig {
    fn new(config: RuntimeConfig) -> Self {
        Self {
            clock: ManualClock::new(),
            meter: MockMeter {
                export_w: Cell::new(0.0),
            },
            sockets: (0..3).map(|_| Some(MockSocket::default())).collect(),
            engine: AutomationEngine::new(config.automation.clone(), 3, 0),
            rules: config.effective_rules(),
        }
    }

    fn cycle_at(&mut self, now_ms: u64) -> Vec<EngineAction> {
        self.clock.set(now_ms);
        let mut devices = Devices::new(&self.clock, &mut self.sockets).with_meter(&self.meter);
        self.engine.poll_devices(&mut devices);
        self.engine.run_cycle(&mut devices, &self.rules)
    }

    fn commands(&self, socket: usize) -> &[bool] {
        self.sockets[socket]
            .as_ref()
            .map(|socket| socket.commands.as_slice())
            .unwrap_or_default()
    }
}

#[test]
fn surplus_export_switches_socket_once() {
    let mut rig = Rig::new(RuntimeConfig::default());
    rig.meter.export_w.set(1200.0);

    let actions = rig.cycle_at(0);
    assert_eq!(
        actions,
        vec![EngineAction::Commanded {
            socket: SocketId(1),
            state: true
        }]
    );

    for second in 1..120 {
        assert!(rig.cycle_at(second * SECOND).is_empty());
    }
    assert_eq!(rig.commands(0), &[true]);
    assert!(rig.commands(1).is_empty());
}

#[test]
fn forced_off_socket_waits_out_min_off_time() {
    let mut rig = Rig::new(RuntimeConfig::default());
    rig.meter.export_w.set(1200.0);
    rig.cycle_at(0);

    let forced_at = 30 * MINUTE + 1;
    assert_eq!(
        rig.cycle_at(forced_at),
        vec![EngineAction::ForcedOff {
            socket: SocketId(1),
            command_ok: true
        }]
    );
    let record = rig.engine.socket_state(SocketId(1)).unwrap();
    assert!(record.forced_off());
    assert!(!record.current_state());

    let denied = rig.cycle_at(forced_at + SECOND);
    assert!(matches!(
        denied.as_slice(),
        [EngineAction::Denied {
            socket: SocketId(1),
            state: true,
            ..
        }]
    ));
    assert!(rig.engine.socket_state(SocketId(1)).unwrap().forced_off());

    let resumed = rig.cycle_at(forced_at + 5 * MINUTE);
    assert_eq!(
        resumed,
        vec![EngineAction::Commanded {
            socket: SocketId(1),
            state: true
        }]
    );
    assert!(!rig.engine.socket_state(SocketId(1)).unwrap().forced_off());
    assert_eq!(rig.commands(0), &[true, false, true]);
}

#[test]
fn flapping_export_never_breaks_dwell_limits() {
    let mut rig = Rig::new(RuntimeConfig::default());
    let config = AutomationConfig::default();
    let mut history: Vec<(u64, EngineAction)> = Vec::new();

    for step in 0..1_440u64 {
        let now = step * 10 * SECOND;
        // Swing between surplus and deficit every 40 seconds.
        let export = if (step / 4) % 2 == 0 { 1500.0 } else { 200.0 };
        rig.meter.export_w.set(export);
        history.extend(rig.cycle_at(now).into_iter().map(|action| (now, action)));
    }

    let transitions: Vec<(u64, bool, bool)> = history
        .iter()
        .filter_map(|(at, action)| match action {
            EngineAction::Commanded { state, .. } => Some((*at, *state, false)),
            EngineAction::ForcedOff { .. } => Some((*at, false, true)),
            _ => None,
        })
        .collect();
    assert!(transitions.len() > 4, "expected the socket to cycle");

    for pair in transitions.windows(2) {
        let (previous_at, previous_state, previous_forced) = pair[0];
        let (at, state, forced) = pair[1];
        let elapsed = at - previous_at;

        if previous_state && !state && !forced {
            assert!(elapsed >= config.min_on_time_ms(), "off after {elapsed}ms");
        }
        if previous_forced && state {
            assert!(elapsed >= config.min_off_time_ms(), "on after {elapsed}ms");
        }
        if forced {
            assert!(elapsed > config.max_on_time_ms());
        }
    }
}

#[test]
fn evening_light_rule_uses_time_and_lux() {
    struct Dim(f32);

    impl powernode_common::LightSensor for Dim {
        fn light_level(&mut self) -> Option<f32> {
            Some(self.0)
        }
    }

    let clock = ManualClock::new();
    let mut sockets: Vec<Option<MockSocket>> = (0..3).map(|_| Some(MockSocket::default())).collect();
    let mut engine = AutomationEngine::new(AutomationConfig::default(), 3, 0);
    let rules = RuntimeConfig::default().effective_rules();
    let mut light = Dim(60.0);

    clock.set_wall(17, 40);
    let mut devices = Devices::new(&clock, &mut sockets).with_light(&mut light);
    assert!(engine.run_cycle(&mut devices, &rules).is_empty());

    clock.set(SECOND);
    clock.set_wall(17, 45);
    let mut devices = Devices::new(&clock, &mut sockets).with_light(&mut light);
    let actions = engine.run_cycle(&mut devices, &rules);
    assert_eq!(
        actions,
        vec![EngineAction::Commanded {
            socket: SocketId(2),
            state: true
        }]
    );
    // 60 lux is not dark enough for socket 3 (< 50).
    assert!(sockets[2].as_ref().unwrap().commands.is_empty());
}

#[test]
fn latch_rule_holds_socket_between_edges() {
    let latch = Rule::latch(
        0,
        Rule::ExportAbove { watts: 2000.0 },
        Rule::ExportBelow { watts: 100.0 },
    );
    let config = RuntimeConfig {
        rules: vec![SocketRules {
            socket: SocketId(3),
            turn_on: latch.clone(),
            turn_off: Rule::not(latch),
        }],
        ..RuntimeConfig::default()
    };
    let mut rig = Rig::new(config);

    rig.meter.export_w.set(2500.0);
    rig.cycle_at(0);
    assert_eq!(rig.engine.memory_read(0), Ok(1));

    // Between the thresholds the latch keeps its value.
    rig.meter.export_w.set(800.0);
    for minute in 1..10 {
        rig.cycle_at(minute * MINUTE);
    }
    assert_eq!(rig.commands(2), &[true]);

    rig.meter.export_w.set(50.0);
    rig.cycle_at(10 * MINUTE);
    assert_eq!(rig.engine.memory_read(0), Ok(0));
}

#[test]
fn delayed_rule_fires_after_five_minutes() {
    let config = RuntimeConfig {
        rules: vec![SocketRules {
            socket: SocketId(2),
            turn_on: Rule::delay(1, Rule::ExportAbove { watts: 500.0 }),
            turn_off: Rule::Never,
        }],
        ..RuntimeConfig::default()
    };
    let mut rig = Rig::new(config);
    rig.meter.export_w.set(900.0);

    rig.cycle_at(SECOND);
    rig.cycle_at(4 * MINUTE);
    rig.cycle_at(5 * MINUTE);
    assert!(rig.commands(1).is_empty());

    rig.cycle_at(5 * MINUTE + SECOND);
    assert_eq!(rig.commands(1), &[true]);
}

#[test]
fn overnight_window_rule() {
    let config = RuntimeConfig {
        rules: vec![SocketRules {
            socket: SocketId(1),
            turn_on: Rule::between(
                TimeOfDay { hour: 22, minute: 0 },
                TimeOfDay { hour: 6, minute: 0 },
            ),
            turn_off: Rule::not(Rule::between(
                TimeOfDay { hour: 22, minute: 0 },
                TimeOfDay { hour: 6, minute: 0 },
            )),
        }],
        ..RuntimeConfig::default()
    };
    let mut rig = Rig::new(config);

    rig.clock.set_wall(23, 30);
    rig.cycle_at(0);
    rig.clock.set_wall(3, 0);
    rig.cycle_at(10 * MINUTE);
    rig.clock.set_wall(12, 0);
    rig.cycle_at(20 * MINUTE);

    assert_eq!(rig.commands(0), &[true, false]);
}

#[derive(Clone, Default)]
struct FlakyLink {
    online: std::rc::Rc<Cell<bool>>,
    relay_on: std::rc::Rc<Cell<bool>>,
}

impl powernode_common::HttpTransport for FlakyLink {
    fn get(&mut self, _url: &str) -> Result<String, DeviceError> {
        if !self.online.get() {
            return Err(DeviceError::Http("timeout".into()));
        }
        Ok(format!(r#"{{"power_on":{}}}"#, self.relay_on.get()))
    }

    fn put_json(&mut self, _url: &str, body: &str) -> Result<String, DeviceError> {
        if !self.online.get() {
            return Err(DeviceError::Http("timeout".into()));
        }
        self.relay_on.set(body.contains("true"));
        Ok(body.to_string())
    }
}

#[test]
fn failed_cutoff_holds_until_socket_answers_again() {
    let link = FlakyLink::default();
    link.online.set(true);
    let clock = ManualClock::new();
    let mut sockets = vec![Some(powernode_common::HomeWizardSocket::new(
        "10.0.0.5",
        link.clone(),
    ))];
    let mut engine = AutomationEngine::new(AutomationConfig::default(), 1, 0);

    let mut devices = Devices::new(&clock, &mut sockets);
    engine.poll_devices(&mut devices);
    engine.turn_on(&mut devices, SocketId(1), true).unwrap();
    assert!(link.relay_on.get());

    link.online.set(false);
    clock.set(31 * MINUTE);
    let mut devices = Devices::new(&clock, &mut sockets);
    assert_eq!(
        engine.enforce_max_on_time(&mut devices),
        vec![EngineAction::ForcedOff {
            socket: SocketId(1),
            command_ok: false
        }]
    );

    clock.set(31 * MINUTE + 2 * SECOND);
    let mut devices = Devices::new(&clock, &mut sockets);
    engine.poll_devices(&mut devices);
    engine.refresh_duration(&devices, SocketId(1)).unwrap();
    let record = engine.socket_state(SocketId(1)).unwrap();
    assert!(!record.current_state());
    assert!(record.forced_off());
    assert_eq!(record.last_state_change_ms(), Some(31 * MINUTE));

    // The relay really stayed on; a successful read reports it.
    link.online.set(true);
    clock.set(32 * MINUTE);
    let mut devices = Devices::new(&clock, &mut sockets);
    engine.poll_devices(&mut devices);
    engine.refresh_duration(&devices, SocketId(1)).unwrap();
    assert!(engine.socket_state(SocketId(1)).unwrap().current_state());
}
