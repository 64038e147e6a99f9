use std::{
    f32::consts::PI,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    process::{Command, Stdio},
    sync::{mpsc, Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use reqwest::{blocking::Client, header::CONTENT_TYPE};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use powernode_common::{
    Clock, DailyTotals, DeviceError, HttpTransport, LightSensor, NodeStatus, Pinger,
    RuntimeConfig, SocketId, SwitchRequest, SwitchResponse, ROUTE_CONFIG, ROUTE_STATUS,
    ROUTE_SWITCH,
};

use crate::{
    app::{spawn_control_loop, ConfigView, Node, Platform, SwitchCommand},
    clock::SystemClock,
};

const DEVICE_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const SWITCH_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_LOOP_STACK_SIZE: usize = 512 * 1024;
const NIGHT_LUX: f32 = 2.0;
const PEAK_LUX: f32 = 800.0;

#[derive(Clone)]
struct AppState {
    status: Arc<Mutex<NodeStatus>>,
    switches: mpsc::Sender<SwitchCommand>,
    config: Arc<ConfigView>,
    socket_count: usize,
}

#[derive(Clone)]
struct AppStore {
    config_path: Arc<PathBuf>,
    totals_path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    let clock = SystemClock::or_default(&runtime.network.timezone);

    info!(
        "config loaded: meter=`{}`, sockets={:?}, phone=`{}`, timezone={}",
        runtime.devices.meter_ip,
        runtime.devices.socket_ips,
        runtime.devices.phone_ip,
        clock.timezone(),
    );

    let status = Arc::new(Mutex::new(NodeStatus::default()));
    let (switch_tx, switch_rx) = mpsc::channel();
    let app_state = AppState {
        status: status.clone(),
        switches: switch_tx,
        config: Arc::new(ConfigView::from(&runtime)),
        socket_count: runtime.devices.socket_count(),
    };

    let fixed_lux = std::env::var("POWERNODE_LUX")
        .ok()
        .and_then(|value| value.parse::<f32>().ok());
    spawn_control_loop(CONTROL_LOOP_STACK_SIZE, move || {
        let transport = ReqwestTransport::new()?;
        let light = SimulatedLight { clock, fixed_lux };
        Ok(Node::new(
            &runtime,
            clock,
            transport,
            CommandPinger,
            Some(light),
            HostPlatform { store },
            status,
            switch_rx,
        ))
    })?;

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route(ROUTE_STATUS, get(handle_get_status))
        .route(ROUTE_SWITCH, post(handle_switch))
        .route(ROUTE_CONFIG, get(handle_get_config))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("POWERNODE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;

    info!("status page listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = match state.status.lock() {
        Ok(status) => status.clone(),
        Err(_) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Status unavailable");
        }
    };
    Json(snapshot).into_response()
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.as_ref().clone())
}

async fn handle_switch(
    State(state): State<AppState>,
    Path(socket): Path<u8>,
    Json(request): Json<SwitchRequest>,
) -> impl IntoResponse {
    let socket = SocketId(socket);
    if let Err(err) = socket.index(state.socket_count) {
        return (StatusCode::BAD_REQUEST, Json(SwitchResponse::failed(err))).into_response();
    }

    let (reply_tx, reply_rx) = mpsc::channel();
    let command = SwitchCommand {
        socket,
        state: request.state,
        reply: reply_tx,
    };
    if state.switches.send(command).is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SwitchResponse::failed("control loop is not running")),
        )
            .into_response();
    }

    let reply =
        tokio::task::spawn_blocking(move || reply_rx.recv_timeout(SWITCH_REPLY_TIMEOUT)).await;
    match reply {
        Ok(Ok(response)) if response.success => Json(response).into_response(),
        Ok(Ok(response)) => (StatusCode::BAD_GATEWAY, Json(response)).into_response(),
        _ => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(SwitchResponse::failed("control loop did not answer")),
        )
            .into_response(),
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("POWERNODE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.powernode"));

        Self {
            config_path: Arc::new(data_dir.join("config.json")),
            totals_path: Arc::new(data_dir.join("daily_totals.json")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read_to_string(self.config_path.as_ref()).await {
            Ok(raw) => RuntimeConfig::from_json(&raw)
                .with_context(|| format!("invalid config in {}", self.config_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    "no config at {}, using defaults",
                    self.config_path.display()
                );
                Ok(RuntimeConfig::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn load_totals(&self) -> anyhow::Result<Option<DailyTotals>> {
        match std::fs::read(self.totals_path.as_ref()) {
            Ok(raw) => Ok(Some(serde_json::from_slice::<DailyTotals>(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save_totals(&self, totals: &DailyTotals) -> anyhow::Result<()> {
        let path = self.totals_path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(totals)?;
        std::fs::write(path, payload)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

struct HostPlatform {
    store: AppStore,
}

impl Platform for HostPlatform {
    fn load_totals(&mut self) -> anyhow::Result<Option<DailyTotals>> {
        self.store.load_totals()
    }

    fn save_totals(&mut self, totals: &DailyTotals) -> anyhow::Result<()> {
        self.store.save_totals(totals)
    }

    fn network_connected(&mut self) -> bool {
        true
    }
}

#[derive(Clone)]
struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(DEVICE_HTTP_TIMEOUT)
            .build()
            .context("failed to build device http client")?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&mut self, url: &str) -> Result<String, DeviceError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| DeviceError::Http(err.to_string()))?;
        read_body(response)
    }

    fn put_json(&mut self, url: &str, body: &str) -> Result<String, DeviceError> {
        let response = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .map_err(|err| DeviceError::Http(err.to_string()))?;
        read_body(response)
    }
}

fn read_body(response: reqwest::blocking::Response) -> Result<String, DeviceError> {
    let status = response.status();
    if !status.is_success() {
        return Err(DeviceError::Status(status.as_u16()));
    }
    response
        .text()
        .map_err(|err| DeviceError::Decode(err.to_string()))
}

/// Presence via the system `ping` binary, one echo with a one second wait.
struct CommandPinger;

impl Pinger for CommandPinger {
    fn ping(&mut self, host: &str) -> bool {
        Command::new("ping")
            .args(["-c", "1", "-W", "1", host])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }
}

/// Stand-in for the BH1750: a daylight curve over local time, or a fixed
/// reading from `POWERNODE_LUX`.
struct SimulatedLight {
    clock: SystemClock,
    fixed_lux: Option<f32>,
}

impl LightSensor for SimulatedLight {
    fn light_level(&mut self) -> Option<f32> {
        if let Some(lux) = self.fixed_lux {
            return Some(lux);
        }
        let wall = self.clock.wall_clock()?;
        Some(daylight_lux(f32::from(wall.time_of_day().minutes()) / 60.0))
    }
}

/// Sun up from 07:00 to 19:00, peaking at 13:00.
fn daylight_lux(hours: f32) -> f32 {
    let phase = (hours - 7.0) / 12.0;
    if !(0.0..=1.0).contains(&phase) {
        return NIGHT_LUX;
    }
    NIGHT_LUX + PEAK_LUX * (phase * PI).sin()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
