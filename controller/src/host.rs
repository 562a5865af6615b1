use std::{
    future::IntoFuture,
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use growlight_common::{
    ConnectOutcome, ConnectionCredentials, ConnectivityManager, DeviceConfig, DeviceError,
    DimmerOutput, KeyValueStore, LightOutput, Namespace, NetworkLink, PersistedSchedule,
    SimulatedSensors, SystemControl,
};

use crate::{
    clock::ZonedClock,
    control::{ControlLoop, ControlRequest, REPLY_TIMEOUT},
    portal::{self, CaptivePortal, Submission},
    web,
};

const DEFAULT_DATA_DIR: &str = "./.growlight";
const CONFIG_FILE: &str = "device.json";
const LOOP_PERIOD_MS: u64 = 10;

/// What the HTTP surface serves, set by the device thread as it boots.
#[derive(Clone, Default)]
enum Mode {
    #[default]
    Booting,
    Provisioning(Sender<Submission>),
    Dashboard(Sender<ControlRequest>),
}

#[derive(Clone, Default)]
struct AppState {
    mode: Arc<Mutex<Mode>>,
}

/// Leaves provisioning when the portal is dropped on restart.
struct PortalGuard(AppState);

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// One JSON file per namespace under the data directory.
#[derive(Debug, Clone)]
struct FileStore {
    dir: Arc<PathBuf>,
}

/// Station link that never touches a radio. `GROWLIGHT_SIM_NETWORKS` lists
/// reachable networks as `name:secret` pairs separated by commas; when unset
/// every network is reachable with any secret.
#[derive(Debug, Default)]
struct SimulatedLink {
    networks: Option<Vec<(String, String)>>,
    up: bool,
}

struct HostSystem {
    restart: Arc<AtomicBool>,
}

struct LoggingDimmer;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = PathBuf::from(
        std::env::var("GROWLIGHT_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string()),
    );
    let config = load_config(&data_dir);
    let store = FileStore::new(data_dir.clone());
    let dns_port = env_port("GROWLIGHT_DNS_PORT");
    info!("data directory {}", data_dir.display());

    let app_state = AppState::default();
    let port = env_port("GROWLIGHT_HTTP_PORT").unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind growlight server at {addr}"))?;
    info!("growlight listening on http://{addr}");

    let device_state = app_state.clone();
    let device = tokio::task::spawn_blocking(move || {
        run_device(&config, store, &device_state, dns_port)
    });

    tokio::select! {
        served = axum::serve(listener, build_router(app_state)).into_future() => {
            served.context("http server failed")?;
        }
        finished = device => {
            finished.context("device thread panicked")??;
        }
    }
    Ok(())
}

fn env_port(name: &str) -> Option<u16> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
}

fn load_config(data_dir: &Path) -> DeviceConfig {
    let path = data_dir.join(CONFIG_FILE);
    let mut config = match std::fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!("ignoring invalid {}: {err}", path.display());
            DeviceConfig::default()
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => DeviceConfig::default(),
        Err(err) => {
            warn!("failed to read {}: {err}", path.display());
            DeviceConfig::default()
        }
    };
    config.sanitize();
    config
}

/// Boots the device repeatedly; a requested restart tears everything down
/// and starts over with the same persisted store, like a power cycle.
fn run_device(
    config: &DeviceConfig,
    store: FileStore,
    app_state: &AppState,
    dns_port: Option<u16>,
) -> anyhow::Result<()> {
    loop {
        boot_device(config, store.clone(), app_state, dns_port)?;
        info!("simulated restart");
    }
}

fn boot_device(
    config: &DeviceConfig,
    store: FileStore,
    app_state: &AppState,
    dns_port: Option<u16>,
) -> anyhow::Result<()> {
    let restart = Arc::new(AtomicBool::new(false));
    let system = HostSystem {
        restart: restart.clone(),
    };

    let portal_state = app_state.clone();
    let portal = CaptivePortal::new(
        move |submissions| {
            portal_state.set_mode(Mode::Provisioning(submissions));
            Ok(PortalGuard(portal_state.clone()))
        },
        dns_port.map(|port| (Ipv4Addr::LOCALHOST, port)),
    );

    let clock = ZonedClock::new(&config.timezone).unwrap_or_else(|err| {
        warn!("{err:#}; falling back to UTC");
        ZonedClock::utc()
    });
    info!("local time zone {}", clock.timezone());
    let connectivity = ConnectivityManager::new(
        config.connectivity.clone(),
        store.clone(),
        SimulatedLink::from_env(),
        portal,
        system,
    );
    let schedule = PersistedSchedule::load(store, config.light.ramp_duration_minutes);
    let light: LightOutput<Box<dyn DimmerOutput>> = LightOutput::new(Box::new(LoggingDimmer));
    let (requests, request_rx) = mpsc::channel();

    let mut control = ControlLoop::new(
        config,
        connectivity,
        schedule,
        light,
        Box::new(SimulatedSensors::new()),
        Box::new(clock),
        request_rx,
    );

    let outcome = control.boot().context("connectivity startup failed")?;
    info!("boot finished in state {}", control.state().as_str());
    if outcome == ConnectOutcome::Connected {
        app_state.set_mode(Mode::Dashboard(requests));
    }

    while !restart.load(Ordering::Relaxed) {
        control.step();
        thread::sleep(Duration::from_millis(LOOP_PERIOD_MS));
    }

    app_state.set_mode(Mode::Booting);
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/save", post(handle_save))
        .route("/data.json", get(handle_data))
        .route("/settings", post(handle_settings))
        .fallback(handle_fallback)
        .with_state(state)
}

async fn handle_root(State(state): State<AppState>) -> Response {
    match state.mode() {
        Mode::Provisioning(_) => Html(web::PORTAL_HTML).into_response(),
        Mode::Dashboard(_) => Html(web::DASHBOARD_HTML).into_response(),
        Mode::Booting => error_response(StatusCode::SERVICE_UNAVAILABLE, "device is starting"),
    }
}

async fn handle_save(State(state): State<AppState>, body: String) -> Response {
    let Mode::Provisioning(submissions) = state.mode() else {
        return error_response(StatusCode::NOT_FOUND, "provisioning is not active");
    };

    let credentials = match web::credentials_from_form(&web::decode_form(&body)) {
        Some(credentials) if credentials.is_usable() => credentials,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Html(web::failure_page("A network name is required.")),
            )
                .into_response()
        }
    };
    let network_name = credentials.network_name.clone();

    let saved = tokio::task::spawn_blocking(move || portal::submit(&submissions, credentials))
        .await
        .unwrap_or(false);
    if saved {
        Html(web::saved_page(&network_name)).into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(web::failure_page("The credentials could not be stored.")),
        )
            .into_response()
    }
}

async fn handle_data(State(state): State<AppState>) -> Response {
    let Mode::Dashboard(requests) = state.mode() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "not connected");
    };

    match ask(requests, |reply| ControlRequest::Telemetry { reply }).await {
        Some(payload) => Json(payload).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "controller busy"),
    }
}

async fn handle_settings(State(state): State<AppState>, body: String) -> Response {
    let Mode::Dashboard(requests) = state.mode() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "not connected");
    };
    let update = match web::parse_settings(&body) {
        Ok(update) => update,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    match ask(requests, |reply| ControlRequest::UpdateSettings { update, reply }).await {
        Some(Ok(())) => Json(serde_json::json!({ "saved": true })).into_response(),
        Some(Err(err)) => {
            let status = StatusCode::from_u16(web::settings_error_status(&err))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_response(status, &err.to_string())
        }
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "controller busy"),
    }
}

async fn handle_fallback(State(state): State<AppState>) -> Response {
    match state.mode() {
        Mode::Provisioning(_) => (StatusCode::FOUND, [(header::LOCATION, "/")]).into_response(),
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Sends a request to the control loop and waits for its reply off the
/// async runtime.
async fn ask<T, F>(requests: Sender<ControlRequest>, request: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce(Sender<T>) -> ControlRequest + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let (reply, answer) = mpsc::channel();
        requests.send(request(reply)).ok()?;
        answer.recv_timeout(REPLY_TIMEOUT).ok()
    })
    .await
    .ok()
    .flatten()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

impl AppState {
    fn mode(&self) -> Mode {
        self.mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }
}

impl Drop for PortalGuard {
    fn drop(&mut self) {
        self.0.set_mode(Mode::Booting);
    }
}

impl FileStore {
    fn new(dir: PathBuf) -> Self {
        Self { dir: Arc::new(dir) }
    }

    fn path(&self, namespace: Namespace) -> PathBuf {
        self.dir.join(format!("{}.json", namespace.as_str()))
    }
}

impl KeyValueStore for FileStore {
    fn read(&self, namespace: Namespace) -> Result<Option<String>, DeviceError> {
        match std::fs::read_to_string(self.path(namespace)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DeviceError::persistence(namespace.as_str(), err)),
        }
    }

    fn write(&mut self, namespace: Namespace, record: &str) -> Result<(), DeviceError> {
        let fail = |err: std::io::Error| DeviceError::persistence(namespace.as_str(), err);
        std::fs::create_dir_all(self.dir.as_ref()).map_err(fail)?;

        // Rename is atomic, so readers see the old record or the new one.
        let path = self.path(namespace);
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, record).map_err(fail)?;
        std::fs::rename(&staging, &path).map_err(fail)
    }

    fn erase(&mut self, namespace: Namespace) -> Result<(), DeviceError> {
        match std::fs::remove_file(self.path(namespace)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DeviceError::persistence(namespace.as_str(), err)),
        }
    }
}

impl SimulatedLink {
    fn from_env() -> Self {
        Self::with_networks(std::env::var("GROWLIGHT_SIM_NETWORKS").ok().as_deref())
    }

    fn with_networks(list: Option<&str>) -> Self {
        let networks = list.map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(|entry| {
                    let (name, secret) = entry.split_once(':').unwrap_or((entry, ""));
                    (name.to_string(), secret.to_string())
                })
                .collect()
        });
        Self {
            networks,
            ..Self::default()
        }
    }
}

impl NetworkLink for SimulatedLink {
    fn join(&mut self, credentials: &ConnectionCredentials) -> Result<(), DeviceError> {
        self.up = false;
        let reachable = match &self.networks {
            None => true,
            Some(networks) => match networks
                .iter()
                .find(|(name, _)| *name == credentials.network_name)
            {
                Some((_, secret)) if *secret == credentials.secret => true,
                Some(_) => {
                    return Err(DeviceError::CredentialRejected {
                        network: credentials.network_name.clone(),
                        reason: "wrong secret".to_string(),
                    })
                }
                None => false,
            },
        };
        self.up = reachable;
        Ok(())
    }

    fn is_up(&mut self) -> bool {
        self.up
    }

    fn reconnect(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn leave(&mut self) {
        self.up = false;
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), DeviceError> {
        info!("simulated access point `{ssid}` is up");
        Ok(())
    }

    fn address(&mut self) -> Option<Ipv4Addr> {
        self.up.then_some(Ipv4Addr::LOCALHOST)
    }
}

impl SystemControl for HostSystem {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn restart(&mut self) {
        self.restart.store(true, Ordering::Relaxed);
    }
}

impl DimmerOutput for LoggingDimmer {
    fn set_duty(&mut self, duty: u8) -> Result<(), DeviceError> {
        info!("light output duty {duty}/255");
        Ok(())
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
