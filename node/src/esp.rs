use std::{
    net::Ipv4Addr,
    sync::{mpsc, Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::BLOCK,
    i2c::{I2cConfig, I2cDriver},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    ping::{Configuration as PingConfiguration, EspPing},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use powernode_common::{
    parse_switch_path, DailyTotals, DeviceError, HttpTransport, LightSensor, NetworkConfig,
    NodeStatus, Pinger, RuntimeConfig, SocketId, SwitchRequest, SwitchResponse, ROUTE_CONFIG,
    ROUTE_STATUS,
};

use crate::{
    app::{spawn_control_loop, ConfigView, Node, Platform, SwitchCommand},
    clock::{monotonic_ms, SystemClock},
};

const NVS_NAMESPACE: &str = "powernode";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_TOTALS_KEY: &str = "totals_json";
const MAX_HTTP_BODY: usize = 4096;
const MAX_DEVICE_BODY: usize = 2048;
const DEVICE_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const SWITCH_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_LOOP_STACK_SIZE: usize = 16 * 1024;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const BH1750_ADDRESS: u8 = 0x23;
const BH1750_POWER_ON: u8 = 0x01;
const BH1750_CONTINUOUS_HIGH_RES: u8 = 0x10;

const INDEX_HTML: &str = include_str!("../web/index.html");
const APP_JS: &str = include_str!("../web/app.js");
const STYLE_CSS: &str = include_str!("../web/style.css");

#[derive(Clone)]
struct WebState {
    status: Arc<Mutex<NodeStatus>>,
    switches: mpsc::Sender<SwitchCommand>,
    config: Arc<ConfigView>,
    socket_count: usize,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime.network);

    info!(
        "NVS config loaded: ssid=`{}`, meter=`{}`, sockets={:?}",
        runtime.network.wifi_ssid, runtime.devices.meter_ip, runtime.devices.socket_ips,
    );

    let peripherals = Peripherals::take()?;
    let light = match I2cDriver::new(
        peripherals.i2c0,
        peripherals.pins.gpio21,
        peripherals.pins.gpio22,
        &I2cConfig::new().baudrate(100_u32.kHz().into()),
    )
    .map_err(anyhow::Error::from)
    .and_then(Bh1750::new)
    {
        Ok(sensor) => {
            info!("BH1750 light sensor initialized at 0x{BH1750_ADDRESS:02x}");
            Some(sensor)
        }
        Err(err) => {
            warn!("light sensor unavailable, light rules stay inactive: {err:#}");
            None
        }
    };

    let wifi = match connect_wifi(peripherals.modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => wifi,
        Err(err) => {
            warn!("wifi startup failed ({err:#}); restarting");
            thread::sleep(Duration::from_secs(5));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
    };
    disable_wifi_power_save();

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let clock = SystemClock::or_default(&runtime.network.timezone);
    let status = Arc::new(Mutex::new(NodeStatus::default()));
    let (switch_tx, switch_rx) = mpsc::channel();
    let web_state = WebState {
        status: status.clone(),
        switches: switch_tx,
        config: Arc::new(ConfigView::from(&runtime)),
        socket_count: runtime.devices.socket_count(),
    };

    spawn_control_loop(CONTROL_LOOP_STACK_SIZE, move || {
        if let Err(err) = add_current_task_to_watchdog() {
            warn!("failed to register control loop with watchdog: {err:#}");
        }
        let platform = EspPlatform {
            nvs: nvs_store,
            disconnected_since_ms: None,
        };
        Ok(Node::new(
            &runtime,
            clock,
            EspTransport,
            EspPinger,
            light,
            platform,
            status,
            switch_rx,
        ))
    })?;

    let server = create_http_server(web_state)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
}

fn create_http_server(state: WebState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/app.js", Method::Get, move |req| {
        req.into_ok_response()?.write_all(APP_JS.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/style.css", Method::Get, move |req| {
        req.into_ok_response()?.write_all(STYLE_CSS.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler(ROUTE_STATUS, Method::Get, move |req| {
            let snapshot = match state.status.lock() {
                Ok(status) => status.clone(),
                Err(_) => return write_error(req, 500, "Status unavailable"),
            };
            write_json(req, 200, &snapshot)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler(ROUTE_CONFIG, Method::Get, move |req| {
            write_json(req, 200, state.config.as_ref())
        })?;
    }

    server.fn_handler("/switch/*", Method::Post, move |mut req| {
        let socket = match parse_switch_path(req.uri()) {
            Some(socket) => SocketId(socket),
            None => return write_error(req, 404, "Unknown switch"),
        };
        if let Err(err) = socket.index(state.socket_count) {
            return write_json(req, 400, &SwitchResponse::failed(err));
        }

        let body = read_request_body(&mut req)?;
        let request: SwitchRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => return write_error(req, 400, &format!("Invalid switch body: {err}")),
        };

        let (reply_tx, reply_rx) = mpsc::channel();
        let command = SwitchCommand {
            socket,
            state: request.state,
            reply: reply_tx,
        };
        if state.switches.send(command).is_err() {
            return write_json(req, 503, &SwitchResponse::failed("control loop is not running"));
        }

        match reply_rx.recv_timeout(SWITCH_REPLY_TIMEOUT) {
            Ok(response) if response.success => write_json(req, 200, &response),
            Ok(response) => write_json(req, 502, &response),
            Err(_) => write_json(
                req,
                504,
                &SwitchResponse::failed("control loop did not answer"),
            ),
        }
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize + ?Sized>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    write_json(req, status_code, &serde_json::json!({ "error": message }))
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let ssid = network.wifi_ssid.trim();
    if ssid.is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{ssid}`");

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        )),
    }
}

struct EspPlatform {
    nvs: NvsStore,
    disconnected_since_ms: Option<u64>,
}

impl Platform for EspPlatform {
    fn load_totals(&mut self) -> anyhow::Result<Option<DailyTotals>> {
        self.nvs.load_totals()
    }

    fn save_totals(&mut self, totals: &DailyTotals) -> anyhow::Result<()> {
        self.nvs.save_totals(totals)
    }

    fn network_connected(&mut self) -> bool {
        let connected = is_wifi_station_connected();
        let now_ms = monotonic_ms();

        if connected {
            self.disconnected_since_ms = None;
        } else if let Some(disconnected_since_ms) = self.disconnected_since_ms {
            if now_ms.saturating_sub(disconnected_since_ms) >= WIFI_RESTART_GRACE_MS {
                warn!(
                    "wifi disconnected for {}s; restarting device for recovery",
                    WIFI_RESTART_GRACE_MS / 1000
                );
                thread::sleep(Duration::from_millis(100));
                unsafe { esp_idf_svc::sys::esp_restart() };
            }
        } else {
            self.disconnected_since_ms = Some(now_ms);
        }
        connected
    }

    fn feed_watchdog(&mut self) {
        feed_watchdog();
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => Ok(RuntimeConfig::from_json(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn load_totals(&self) -> anyhow::Result<Option<DailyTotals>> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 256];

        match nvs.get_str(NVS_TOTALS_KEY, &mut buffer)? {
            Some(value) => Ok(Some(serde_json::from_str::<DailyTotals>(value)?)),
            None => Ok(None),
        }
    }

    fn save_totals(&self, totals: &DailyTotals) -> anyhow::Result<()> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(totals)?;
        nvs.set_str(NVS_TOTALS_KEY, &payload)?;
        Ok(())
    }
}

/// Device HTTP over the IDF client. Each request opens its own connection.
#[derive(Clone, Copy)]
struct EspTransport;

impl EspTransport {
    fn request(&self, method: Method, url: &str, body: Option<&str>) -> Result<String, DeviceError> {
        let conf = HttpClientConfiguration {
            timeout: Some(DEVICE_HTTP_TIMEOUT),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&conf).map_err(http_error)?;
        let mut client = HttpClient::wrap(connection);

        let content_length = body.map(|body| body.len().to_string());
        let headers: Vec<(&str, &str)> = match content_length.as_deref() {
            Some(length) => vec![
                ("Content-Type", "application/json"),
                ("Content-Length", length),
            ],
            None => Vec::new(),
        };

        let mut request = client.request(method, url, &headers).map_err(http_error)?;
        if let Some(body) = body {
            request.write_all(body.as_bytes()).map_err(http_error)?;
            request.flush().map_err(http_error)?;
        }
        let mut response = request.submit().map_err(http_error)?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(DeviceError::Status(status));
        }

        let mut payload = Vec::new();
        let mut chunk = [0_u8; 256];
        loop {
            let read = response.read(&mut chunk).map_err(http_error)?;
            if read == 0 {
                break;
            }
            payload.extend_from_slice(&chunk[..read]);
            if payload.len() > MAX_DEVICE_BODY {
                return Err(DeviceError::Decode("device response too large".into()));
            }
        }
        String::from_utf8(payload).map_err(|err| DeviceError::Decode(err.to_string()))
    }
}

impl HttpTransport for EspTransport {
    fn get(&mut self, url: &str) -> Result<String, DeviceError> {
        self.request(Method::Get, url, None)
    }

    fn put_json(&mut self, url: &str, body: &str) -> Result<String, DeviceError> {
        self.request(Method::Put, url, Some(body))
    }
}

fn http_error(err: impl core::fmt::Debug) -> DeviceError {
    DeviceError::Http(format!("{err:?}"))
}

struct EspPinger;

impl Pinger for EspPinger {
    fn ping(&mut self, host: &str) -> bool {
        let Ok(ip) = host.parse::<Ipv4Addr>() else {
            warn!("presence host `{host}` is not an IPv4 address");
            return false;
        };
        let conf = PingConfiguration {
            count: 1,
            timeout: Duration::from_secs(1),
            ..Default::default()
        };
        match EspPing::default().ping(ip, &conf) {
            Ok(summary) => summary.received > 0,
            Err(err) => {
                warn!("ping {host} failed: {err}");
                false
            }
        }
    }
}

/// BH1750 ambient light sensor in continuous high resolution mode.
struct Bh1750 {
    i2c: I2cDriver<'static>,
}

impl Bh1750 {
    fn new(mut i2c: I2cDriver<'static>) -> anyhow::Result<Self> {
        i2c.write(BH1750_ADDRESS, &[BH1750_POWER_ON], BLOCK)
            .context("BH1750 did not acknowledge power on")?;
        i2c.write(BH1750_ADDRESS, &[BH1750_CONTINUOUS_HIGH_RES], BLOCK)
            .context("failed to set BH1750 measurement mode")?;
        Ok(Self { i2c })
    }
}

impl LightSensor for Bh1750 {
    fn light_level(&mut self) -> Option<f32> {
        let mut raw = [0_u8; 2];
        match self.i2c.read(BH1750_ADDRESS, &mut raw, BLOCK) {
            Ok(()) => Some(f32::from(u16::from_be_bytes(raw)) / 1.2),
            Err(err) => {
                warn!("BH1750 read failed: {err}");
                None
            }
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}
