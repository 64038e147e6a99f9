//! The node's control loop, shared by the host and ESP32 builds.
//!
//! A single thread owns every device proxy and the automation engine. It walks the
//! stage [`Scheduler`], publishes a [`NodeStatus`] snapshot for the web server and
//! answers manual switch requests that arrive over a channel.

use std::{
    sync::{
        mpsc::{Receiver, Sender},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use log::{debug, error, info, warn};
use serde::Serialize;

use powernode_common::{
    AutomationConfig, AutomationEngine, CachedPresence, Clock, DailyTotals, DailyTotalsTracker,
    DeviceConfig, Devices, HomeWizardMeter, HomeWizardSocket, HttpTransport, LightSensor,
    NodeStatus, Pinger, PowerMeter, PresenceProbe, RuntimeConfig, Scheduler, SocketId,
    SocketRules, Stage, SwitchResponse,
};

use crate::clock::SystemClock;

const MAX_IDLE_SLEEP_MS: u64 = 100;

/// Manual switch request from the web server, answered on `reply`.
pub struct SwitchCommand {
    pub socket: SocketId,
    pub state: bool,
    pub reply: Sender<SwitchResponse>,
}

/// What the control loop needs from the platform around it.
pub trait Platform {
    fn load_totals(&mut self) -> anyhow::Result<Option<DailyTotals>>;
    fn save_totals(&mut self, totals: &DailyTotals) -> anyhow::Result<()>;
    fn network_connected(&mut self) -> bool;
    fn feed_watchdog(&mut self) {}
}

/// Configuration as served at `GET /api/config`. The Wi-Fi password is reduced to a flag.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    pub automation: AutomationConfig,
    pub devices: DeviceConfig,
    pub rules: Vec<SocketRules>,
    pub timezone: String,
    pub wifi_ssid: String,
    pub wifi_pass_set: bool,
}

impl From<&RuntimeConfig> for ConfigView {
    fn from(runtime: &RuntimeConfig) -> Self {
        Self {
            automation: runtime.automation.clone(),
            devices: runtime.devices.clone(),
            rules: runtime.effective_rules(),
            timezone: runtime.network.timezone.clone(),
            wifi_ssid: runtime.network.wifi_ssid.clone(),
            wifi_pass_set: !runtime.network.wifi_pass.is_empty(),
        }
    }
}

pub struct Node<T: HttpTransport, P: Pinger, L: LightSensor, B: Platform> {
    clock: SystemClock,
    engine: AutomationEngine,
    rules: Arc<[SocketRules]>,
    scheduler: Scheduler,
    sockets: Vec<Option<HomeWizardSocket<T>>>,
    meter: Option<HomeWizardMeter<T>>,
    light: Option<L>,
    presence: Option<CachedPresence<P>>,
    present: bool,
    network_up: bool,
    totals: DailyTotalsTracker,
    platform: B,
    status: Arc<Mutex<NodeStatus>>,
    switches: Receiver<SwitchCommand>,
}

impl<T, P, L, B> Node<T, P, L, B>
where
    T: HttpTransport + Clone,
    P: Pinger,
    L: LightSensor,
    B: Platform,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: &RuntimeConfig,
        clock: SystemClock,
        transport: T,
        pinger: P,
        light: Option<L>,
        platform: B,
        status: Arc<Mutex<NodeStatus>>,
        switches: Receiver<SwitchCommand>,
    ) -> Self {
        let devices = &runtime.devices;
        let sockets: Vec<_> = (0..devices.socket_count())
            .map(|index| {
                let host = devices.socket_host(index);
                if host.is_none() {
                    info!("socket {} has no address, skipping", index + 1);
                }
                host.map(|host| HomeWizardSocket::new(host, transport.clone()))
            })
            .collect();
        let meter = devices
            .meter_host()
            .map(|host| HomeWizardMeter::new(host, transport.clone()));
        if meter.is_none() {
            warn!("no meter address configured, power rules stay inactive");
        }
        let presence = devices
            .phone_host()
            .map(|host| CachedPresence::new(host, pinger));

        let now = clock.now_ms();
        Self {
            clock,
            engine: AutomationEngine::new(runtime.automation.clone(), sockets.len(), now),
            rules: runtime.effective_rules().into(),
            scheduler: Scheduler::default(),
            sockets,
            meter,
            light,
            presence,
            present: false,
            network_up: true,
            totals: DailyTotalsTracker::default(),
            platform,
            status,
            switches,
        }
    }

    pub fn run(mut self) {
        info!(
            "control loop started with {} sockets and {} rule sets",
            self.sockets.len(),
            self.rules.len()
        );
        loop {
            self.platform.feed_watchdog();
            let now = self.clock.now_ms();
            match self.scheduler.next(now) {
                Some(stage) => self.run_stage(stage, now),
                None => {
                    let idle = self
                        .scheduler
                        .idle_for_ms(now)
                        .unwrap_or(MAX_IDLE_SLEEP_MS)
                        .clamp(1, MAX_IDLE_SLEEP_MS);
                    thread::sleep(Duration::from_millis(idle));
                }
            }
        }
    }

    fn run_stage(&mut self, stage: Stage, now: u64) {
        match stage {
            Stage::LoadTotals => self.load_totals(),
            Stage::Connectivity => self.check_connectivity(),
            Stage::LightSensor => self.with_devices(|engine, devices| engine.update_light(devices)),
            Stage::Display => {
                self.publish_status(now);
                self.log_summary();
            }
            Stage::Meter => {
                if let Some(meter) = self.meter.as_mut() {
                    meter.update(now);
                }
            }
            Stage::Sockets => self.with_devices(|engine, devices| engine.poll_devices(devices)),
            Stage::Automation => {
                let rules = Arc::clone(&self.rules);
                let actions =
                    self.with_devices(|engine, devices| engine.run_cycle(devices, &rules));
                if !actions.is_empty() {
                    debug!("automation cycle: {actions:?}");
                    self.publish_status(now);
                }
            }
            Stage::WebServer => {
                if self.handle_switch_requests() > 0 {
                    self.publish_status(now);
                }
            }
            Stage::Presence => {
                if let Some(presence) = self.presence.as_mut() {
                    self.present = presence.is_present(now);
                }
            }
            Stage::DailyTotals => self.checkpoint_totals(),
        }
    }

    fn with_devices<R>(
        &mut self,
        f: impl FnOnce(&mut AutomationEngine, &mut Devices<'_, HomeWizardSocket<T>>) -> R,
    ) -> R {
        let mut devices = Devices::new(&self.clock, &mut self.sockets);
        if let Some(meter) = self.meter.as_ref() {
            devices = devices.with_meter(meter);
        }
        if let Some(light) = self.light.as_mut() {
            devices = devices.with_light(light);
        }
        if let Some(presence) = self.presence.as_mut() {
            devices = devices.with_presence(presence);
        }
        f(&mut self.engine, &mut devices)
    }

    fn load_totals(&mut self) {
        match self.platform.load_totals() {
            Ok(checkpoint) => {
                if let Some(checkpoint) = checkpoint {
                    info!(
                        "loaded totals checkpoint for day {}: import {:.3} kWh, export {:.3} kWh",
                        checkpoint.day, checkpoint.import_kwh, checkpoint.export_kwh
                    );
                }
                self.totals = DailyTotalsTracker::new(checkpoint);
            }
            Err(err) => warn!("failed to load daily totals: {err:#}"),
        }
    }

    fn checkpoint_totals(&mut self) {
        let Some(wall) = self.clock.wall_clock() else {
            debug!("clock not synchronized, skipping daily totals");
            return;
        };
        let Some(meter) = self.meter.as_ref().filter(|meter| meter.is_connected()) else {
            return;
        };
        let checkpoint = self.totals.observe(
            wall.day_of_year,
            meter.total_import_kwh(),
            meter.total_export_kwh(),
        );
        if let Some(checkpoint) = checkpoint {
            if let Err(err) = self.platform.save_totals(&checkpoint) {
                warn!("failed to persist daily totals: {err:#}");
            }
        }
    }

    fn check_connectivity(&mut self) {
        let connected = self.platform.network_connected();
        if connected != self.network_up {
            if connected {
                info!("network connection restored");
            } else {
                warn!("network connection lost");
            }
            self.network_up = connected;
        }
    }

    fn handle_switch_requests(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(command) = self.switches.try_recv() {
            let result = self.with_devices(|engine, devices| {
                engine.manual_switch(devices, command.socket, command.state)
            });
            let response = match result {
                Ok(()) => SwitchResponse::ok(),
                Err(err) => {
                    warn!("manual switch of socket {} failed: {err}", command.socket);
                    SwitchResponse::failed(err)
                }
            };
            if command.reply.send(response).is_err() {
                debug!("switch requester for socket {} went away", command.socket);
            }
            handled += 1;
        }
        handled
    }

    fn snapshot(&self, now: u64) -> NodeStatus {
        let wall = self.clock.wall_clock();
        let mut status = NodeStatus {
            light: self.engine.current_lux(),
            time: wall.map(|wall| wall.time_of_day().to_string()),
            time_synced: wall.is_some(),
            present: self.present,
            switches: self.engine.socket_statuses(&self.sockets, now),
            ..NodeStatus::default()
        };

        if let Some(meter) = self.meter.as_ref() {
            let (total_import, total_export) = (meter.total_import_kwh(), meter.total_export_kwh());
            let (today_import, today_export) = self.totals.today(total_import, total_export);
            status.import_power = meter.current_import_w();
            status.export_power = meter.current_export_w();
            status.total_import = total_import;
            status.total_export = total_export;
            status.today_import = today_import;
            status.today_export = today_export;
            status.meter_connected = meter.is_connected();
        }
        status
    }

    fn publish_status(&mut self, now: u64) {
        let snapshot = self.snapshot(now);
        match self.status.lock() {
            Ok(mut shared) => *shared = snapshot,
            Err(_) => warn!("status snapshot lock poisoned"),
        }
    }

    fn log_summary(&self) {
        let sockets = self
            .engine
            .socket_statuses(&self.sockets, self.clock.now_ms())
            .iter()
            .map(|socket| {
                format!(
                    "{}:{}{}",
                    socket.socket,
                    if socket.state { "on" } else { "off" },
                    if socket.forced_off { "!" } else { "" }
                )
            })
            .collect::<Vec<_>>()
            .join(" ");
        let (import_w, export_w) = self
            .meter
            .as_ref()
            .map(|meter| (meter.current_import_w(), meter.current_export_w()))
            .unwrap_or_default();
        debug!(
            "import {import_w:.0}W export {export_w:.0}W lux {} | {sockets}",
            self.engine
                .current_lux()
                .map(|lux| format!("{lux:.0}"))
                .unwrap_or_else(|| "-".into())
        );
    }
}

/// Builds the node on its own thread and runs it forever. Device drivers that are
/// not `Send` are created inside `build`.
pub fn spawn_control_loop<F, T, P, L, B>(stack_size: usize, build: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<Node<T, P, L, B>> + Send + 'static,
    T: HttpTransport + Clone,
    P: Pinger,
    L: LightSensor,
    B: Platform,
{
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(stack_size)
        .spawn(move || match build() {
            Ok(node) => node.run(),
            Err(err) => error!("control loop startup failed: {err:#}"),
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use powernode_common::{homewizard::SocketStatePayload, DeviceError};

    use super::*;

    #[derive(Clone, Default)]
    struct FakeTransport {
        socket_on: Arc<Mutex<bool>>,
        meter_offline: bool,
    }

    impl HttpTransport for FakeTransport {
        fn get(&mut self, url: &str) -> Result<String, DeviceError> {
            if url.ends_with("/api/v1/data") {
                if self.meter_offline {
                    return Err(DeviceError::Http("connection refused".into()));
                }
                return Ok(r#"{"active_power_w":-1500.0,"total_power_import_kwh":1200.5,"total_power_export_kwh":800.25}"#.into());
            }
            Ok(format!(r#"{{"power_on":{}}}"#, *self.socket_on.lock().unwrap()))
        }

        fn put_json(&mut self, _url: &str, body: &str) -> Result<String, DeviceError> {
            let payload: SocketStatePayload = serde_json::from_str(body).unwrap();
            *self.socket_on.lock().unwrap() = payload.power_on;
            Ok(body.to_string())
        }
    }

    struct NoPing;

    impl Pinger for NoPing {
        fn ping(&mut self, _host: &str) -> bool {
            false
        }
    }

    struct NoLight;

    impl LightSensor for NoLight {
        fn light_level(&mut self) -> Option<f32> {
            None
        }
    }

    #[derive(Default)]
    struct MemoryPlatform {
        saved: Arc<Mutex<Vec<DailyTotals>>>,
    }

    impl Platform for MemoryPlatform {
        fn load_totals(&mut self) -> anyhow::Result<Option<DailyTotals>> {
            Ok(None)
        }

        fn save_totals(&mut self, totals: &DailyTotals) -> anyhow::Result<()> {
            self.saved.lock().unwrap().push(*totals);
            Ok(())
        }

        fn network_connected(&mut self) -> bool {
            true
        }
    }

    fn runtime() -> RuntimeConfig {
        let mut runtime = RuntimeConfig::default();
        runtime.devices.meter_ip = "192.168.1.50".into();
        runtime.devices.socket_ips = vec!["192.168.1.61".into(), String::new(), "0".into()];
        runtime
    }

    type TestNode = Node<FakeTransport, NoPing, NoLight, MemoryPlatform>;

    fn node(
        transport: FakeTransport,
        platform: MemoryPlatform,
    ) -> (TestNode, Arc<Mutex<NodeStatus>>, Sender<SwitchCommand>) {
        let status = Arc::new(Mutex::new(NodeStatus::default()));
        let (tx, rx) = mpsc::channel();
        let node = Node::new(
            &runtime(),
            SystemClock::or_default("Europe/Amsterdam"),
            transport,
            NoPing,
            None,
            platform,
            status.clone(),
            rx,
        );
        (node, status, tx)
    }

    #[test]
    fn unconfigured_sockets_are_skipped() {
        let (node, _, _) = node(FakeTransport::default(), MemoryPlatform::default());
        assert_eq!(node.sockets.len(), 3);
        assert!(node.sockets[0].is_some());
        assert!(node.sockets[1].is_none());
        assert!(node.sockets[2].is_none());
    }

    #[test]
    fn manual_switch_is_answered_and_published() {
        let transport = FakeTransport::default();
        let (mut node, status, tx) = node(transport.clone(), MemoryPlatform::default());
        let (reply_tx, reply_rx) = mpsc::channel();

        tx.send(SwitchCommand {
            socket: SocketId(1),
            state: true,
            reply: reply_tx,
        })
        .unwrap();
        node.run_stage(Stage::WebServer, 1_000);

        assert_eq!(reply_rx.recv().unwrap(), SwitchResponse::ok());
        assert!(*transport.socket_on.lock().unwrap());
        let published = status.lock().unwrap().clone();
        assert!(published.switches[0].state);
    }

    #[test]
    fn switching_unconfigured_socket_fails() {
        let (mut node, _, tx) = node(FakeTransport::default(), MemoryPlatform::default());
        let (reply_tx, reply_rx) = mpsc::channel();

        tx.send(SwitchCommand {
            socket: SocketId(2),
            state: true,
            reply: reply_tx,
        })
        .unwrap();
        node.run_stage(Stage::WebServer, 1_000);

        assert!(!reply_rx.recv().unwrap().success);
    }

    #[test]
    fn meter_readings_reach_the_status_snapshot() {
        let platform = MemoryPlatform::default();
        let saved = platform.saved.clone();
        let (mut node, status, _) = node(FakeTransport::default(), platform);

        node.run_stage(Stage::LoadTotals, 0);
        node.run_stage(Stage::Meter, 0);
        node.run_stage(Stage::DailyTotals, 0);
        node.run_stage(Stage::Display, 0);

        let published = status.lock().unwrap().clone();
        assert!(published.meter_connected);
        assert_eq!(published.export_power, 1500.0);
        assert_eq!(published.import_power, 0.0);
        assert_eq!(published.total_import, 1200.5);
        assert_eq!(published.today_export, 0.0);
        assert_eq!(saved.lock().unwrap().len(), 1);
    }

    #[test]
    fn offline_meter_skips_totals_checkpoint() {
        let platform = MemoryPlatform::default();
        let saved = platform.saved.clone();
        let transport = FakeTransport {
            meter_offline: true,
            ..FakeTransport::default()
        };
        let (mut node, status, _) = node(transport, platform);

        node.run_stage(Stage::Meter, 0);
        node.run_stage(Stage::DailyTotals, 0);
        node.run_stage(Stage::Display, 0);

        assert!(saved.lock().unwrap().is_empty());
        assert!(!status.lock().unwrap().meter_connected);
    }

    #[test]
    fn config_view_hides_wifi_password() {
        let mut runtime = runtime();
        runtime.network.wifi_pass = "hunter2".into();
        let view = ConfigView::from(&runtime);

        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(view.wifi_pass_set);
        assert_eq!(view.rules.len(), 3);
    }
}
