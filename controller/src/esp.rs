use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{
        mpsc::{self, Sender},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::dht11;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, Gpio34, IOPin, InputOutput, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::EspSntp,
    wifi::EspWifi,
};
use log::{info, warn};
use serde::Serialize;

use growlight_common::{
    store, ConnectOutcome, ConnectionCredentials, ConnectivityManager, DeviceConfig, DeviceError,
    DimmerOutput, KeyValueStore, LightOutput, Namespace, NetworkLink, PersistedSchedule,
    SensorReadings, SensorSource, SimulatedSensors, SystemControl, TelemetrySource,
};

use crate::{
    clock::ZonedClock,
    control::{ControlLoop, ControlRequest, REPLY_TIMEOUT},
    portal::{self, CaptivePortal, Submission},
    web,
};

const NVS_NAMESPACE: &str = "growlight";
const NVS_READ_BUFFER: usize = 1024;
const MAX_HTTP_BODY: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const LOOP_PERIOD_MS: u64 = 10;
/// Default address of the esp-idf soft-AP interface.
const AP_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 71, 1);
const DNS_PORT: u16 = 53;

type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct EspWifiLink {
    wifi: EspWifi<'static>,
    network_name: String,
}

struct LedcDimmer {
    driver: LedcDriver<'static>,
}

struct EspSensors {
    dht_pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
    light: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
}

struct EspSystem;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut config = DeviceConfig::default();
    if option_env!("GROWLIGHT_SENSOR_SOURCE") == Some("hardware") {
        config.telemetry.sensor_source = SensorSource::Hardware;
    }
    config.sanitize();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };
    ensure_wifi_defaults(&mut nvs_store);

    let Peripherals {
        modem,
        pins,
        ledc,
        adc1,
        ..
    } = Peripherals::take()?;

    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition)).context("wifi init failed")?;

    let timer = LedcTimerDriver::new(
        ledc.timer0,
        &TimerConfig::default().frequency(Hertz(config.light.pwm_frequency_hz)),
    )
    .context("failed to configure LEDC timer")?;
    let pwm_pin = unsafe { AnyOutputPin::new(config.light.pwm_pin) };
    let driver = LedcDriver::new(ledc.channel0, timer, pwm_pin)
        .with_context(|| format!("failed to attach LEDC to GPIO{}", config.light.pwm_pin))?;
    info!(
        "light output on GPIO{} @ {} Hz",
        config.light.pwm_pin, config.light.pwm_frequency_hz
    );
    let light: LightOutput<Box<dyn DimmerOutput>> =
        LightOutput::new(Box::new(LedcDimmer { driver }));

    let sensors: Box<dyn TelemetrySource> = match config.telemetry.sensor_source {
        SensorSource::Hardware => {
            match EspSensors::new(pins.gpio16.downgrade(), adc1, pins.gpio34) {
                Ok(sensors) => Box::new(sensors),
                Err(err) => {
                    warn!("hardware sensors unavailable, simulating: {err:#}");
                    Box::new(SimulatedSensors::new())
                }
            }
        }
        SensorSource::Simulated => Box::new(SimulatedSensors::new()),
    };
    info!("sensor source: {}", config.telemetry.sensor_source.as_str());

    let clock = ZonedClock::new(&config.timezone).unwrap_or_else(|err| {
        warn!("{err:#}; falling back to UTC");
        ZonedClock::utc()
    });
    info!("local time zone {}", clock.timezone());

    let portal = CaptivePortal::new(create_portal_server, Some((AP_ADDRESS, DNS_PORT)));
    let connectivity = ConnectivityManager::new(
        config.connectivity.clone(),
        nvs_store.clone(),
        EspWifiLink::new(wifi),
        portal,
        EspSystem,
    );
    let schedule = PersistedSchedule::load(nvs_store, config.light.ramp_duration_minutes);
    let (requests, request_rx) = mpsc::channel();
    let mut control = ControlLoop::new(
        &config,
        connectivity,
        schedule,
        light,
        sensors,
        Box::new(clock),
        request_rx,
    );

    let outcome = control.boot().context("connectivity startup failed")?;
    info!("boot finished in state {}", control.state().as_str());

    // Keep services alive for the program lifetime.
    let _services = match outcome {
        ConnectOutcome::Connected => Some(start_connected_services(requests)?),
        ConnectOutcome::NotConnected => None,
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    loop {
        feed_watchdog();
        control.step();
        thread::sleep(Duration::from_millis(LOOP_PERIOD_MS));
    }
}

fn start_connected_services(
    requests: Sender<ControlRequest>,
) -> anyhow::Result<(EspSntp<'static>, EspHttpServer<'static>)> {
    disable_wifi_power_save();

    let sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    let server = create_dashboard_server(requests)?;
    info!("dashboard listening on port 80");
    Ok((sntp, server))
}

/// Seeds the credential record from the build environment when nothing is
/// stored yet.
fn ensure_wifi_defaults(nvs_store: &mut NvsStore) {
    let Some(ssid) = option_env!("WIFI_SSID") else {
        return;
    };

    match nvs_store.read(Namespace::NetworkCredentials) {
        Ok(None) => {
            let credentials = ConnectionCredentials::new(ssid, option_env!("WIFI_PASS").unwrap_or(""));
            match store::save_record(nvs_store, Namespace::NetworkCredentials, &credentials) {
                Ok(()) => info!("seeded credentials for `{ssid}` from build environment"),
                Err(err) => warn!("failed to seed credentials: {err}"),
            }
        }
        Ok(Some(_)) => {}
        Err(err) => warn!("failed to check stored credentials: {err}"),
    }
}

fn create_portal_server(submissions: Sender<Submission>) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, |req| {
        write_html(req, 200, web::PORTAL_HTML)
    })?;

    server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let pairs = web::decode_form(&String::from_utf8_lossy(&body));

        let credentials = match web::credentials_from_form(&pairs) {
            Some(credentials) if credentials.is_usable() => credentials,
            _ => return write_html(req, 400, &web::failure_page("A network name is required.")),
        };
        let network_name = credentials.network_name.clone();

        if portal::submit(&submissions, credentials) {
            write_html(req, 200, &web::saved_page(&network_name))
        } else {
            write_html(
                req,
                500,
                &web::failure_page("The credentials could not be stored."),
            )
        }
    })?;

    // Registered last so the routes above win.
    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, |req| {
        req.into_response(302, Some("Found"), &[("Location", "/")])?;
        Ok(())
    })?;

    Ok(server)
}

fn create_dashboard_server(
    requests: Sender<ControlRequest>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, |req| {
        write_html(req, 200, web::DASHBOARD_HTML)
    })?;

    {
        let requests = requests.clone();
        server.fn_handler::<anyhow::Error, _>("/data.json", Method::Get, move |req| {
            let (reply, answer) = mpsc::channel();
            requests
                .send(ControlRequest::Telemetry { reply })
                .map_err(|_| anyhow!("control loop stopped"))?;
            match answer.recv_timeout(REPLY_TIMEOUT) {
                Ok(payload) => write_json(req, &payload),
                Err(_) => write_error(req, 503, "controller busy"),
            }
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/settings", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let update = match web::parse_settings(&String::from_utf8_lossy(&body)) {
            Ok(update) => update,
            Err(err) => return write_error(req, 400, &err.to_string()),
        };

        let (reply, answer) = mpsc::channel();
        requests
            .send(ControlRequest::UpdateSettings { update, reply })
            .map_err(|_| anyhow!("control loop stopped"))?;
        match answer.recv_timeout(REPLY_TIMEOUT) {
            Ok(Ok(())) => write_json(req, &serde_json::json!({ "saved": true })),
            Ok(Err(err)) => write_error(req, web::settings_error_status(&err), &err.to_string()),
            Err(_) => write_error(req, 503, "controller busy"),
        }
    })?;

    Ok(server)
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
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

fn write_html(req: HttpRequest<'_, '_>, status_code: u16, page: &str) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/html; charset=utf-8")],
    )?
    .write_all(page.as_bytes())?;
    Ok(())
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

impl NvsStore {
    fn open(&self, namespace: Namespace) -> Result<EspNvs<NvsDefault>, DeviceError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| DeviceError::persistence(namespace.as_str(), err))
    }
}

impl KeyValueStore for NvsStore {
    fn read(&self, namespace: Namespace) -> Result<Option<String>, DeviceError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| DeviceError::persistence(namespace.as_str(), "store lock poisoned"))?;
        let nvs = self.open(namespace)?;
        let mut buffer = vec![0_u8; NVS_READ_BUFFER];

        nvs.get_str(namespace.short_key(), &mut buffer)
            .map(|value| value.map(str::to_string))
            .map_err(|err| DeviceError::persistence(namespace.as_str(), err))
    }

    fn write(&mut self, namespace: Namespace, record: &str) -> Result<(), DeviceError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| DeviceError::persistence(namespace.as_str(), "store lock poisoned"))?;
        let mut nvs = self.open(namespace)?;
        nvs.set_str(namespace.short_key(), record)
            .map_err(|err| DeviceError::persistence(namespace.as_str(), err))
    }

    fn erase(&mut self, namespace: Namespace) -> Result<(), DeviceError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| DeviceError::persistence(namespace.as_str(), "store lock poisoned"))?;
        let mut nvs = self.open(namespace)?;
        nvs.remove(namespace.short_key())
            .map(|_| ())
            .map_err(|err| DeviceError::persistence(namespace.as_str(), err))
    }
}

impl EspWifiLink {
    fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi,
            network_name: String::new(),
        }
    }

    fn rejected(&self, reason: impl ToString) -> DeviceError {
        DeviceError::CredentialRejected {
            network: self.network_name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl NetworkLink for EspWifiLink {
    fn join(&mut self, credentials: &ConnectionCredentials) -> Result<(), DeviceError> {
        self.network_name = credentials.network_name.clone();

        let auth_method = if credentials.secret.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        let configuration = Configuration::Client(ClientConfiguration {
            ssid: credentials
                .network_name
                .as_str()
                .try_into()
                .map_err(|_| self.rejected("network name too long"))?,
            password: credentials
                .secret
                .as_str()
                .try_into()
                .map_err(|_| self.rejected("secret too long"))?,
            auth_method,
            ..Default::default()
        });

        self.wifi
            .set_configuration(&configuration)
            .map_err(|err| self.rejected(err))?;
        self.wifi.start().map_err(|err| self.rejected(err))?;
        self.wifi.connect().map_err(|err| self.rejected(err))?;
        Ok(())
    }

    fn is_up(&mut self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn reconnect(&mut self) -> Result<(), DeviceError> {
        let _ = self.wifi.disconnect();
        self.wifi.connect().map_err(|_| DeviceError::LinkTimeout {
            network: self.network_name.clone(),
            attempts: 1,
        })
    }

    fn leave(&mut self) {
        let _ = self.wifi.disconnect();
        let _ = self.wifi.stop();
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), DeviceError> {
        let unavailable = |reason: String| DeviceError::AccessPointUnavailable(reason);
        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| unavailable(format!("SSID `{ssid}` too long")))?,
                auth_method: AuthMethod::None,
                channel: 1,
                ..Default::default()
            }))
            .map_err(|err| unavailable(err.to_string()))?;
        self.wifi.start().map_err(|err| unavailable(err.to_string()))?;
        info!("open access point `{ssid}` at {AP_ADDRESS}");
        Ok(())
    }

    fn address(&mut self) -> Option<Ipv4Addr> {
        let info = self.wifi.sta_netif().get_ip_info().ok()?;
        (!info.ip.is_unspecified()).then_some(info.ip)
    }
}

impl DimmerOutput for LedcDimmer {
    fn set_duty(&mut self, duty: u8) -> Result<(), DeviceError> {
        let scaled = u32::from(duty) * self.driver.get_max_duty() / u32::from(u8::MAX);
        self.driver
            .set_duty(scaled)
            .map_err(|err| DeviceError::OutputFailure(err.to_string()))
    }
}

impl EspSensors {
    fn new(dht_pin: AnyIOPin, adc1: ADC1, light_pin: Gpio34) -> anyhow::Result<Self> {
        let mut dht_pin = PinDriver::input_output_od(dht_pin)?;
        dht_pin.set_pull(Pull::Up)?;
        dht_pin.set_high()?;

        let adc = AdcDriver::new(adc1).context("ADC1 init failed")?;
        let channel_config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let light = AdcChannelDriver::new(adc, light_pin, &channel_config)
            .context("light sensor channel init failed")?;

        Ok(Self {
            dht_pin,
            delay: Ets,
            light,
        })
    }
}

impl TelemetrySource for EspSensors {
    fn read(&mut self) -> SensorReadings {
        let (temperature_c, humidity_pct) = match self
            .dht_pin
            .set_high()
            .map_err(|err| format!("{err:?}"))
            .and_then(|()| {
                dht11::blocking::read(&mut self.delay, &mut self.dht_pin)
                    .map_err(|err| format!("{err:?}"))
            }) {
            Ok(reading) => (
                Some(f32::from(reading.temperature)),
                Some(f32::from(reading.relative_humidity)),
            ),
            Err(err) => {
                warn!("DHT11 read failed: {err}");
                (None, None)
            }
        };

        let light_raw = match self.light.read_raw() {
            Ok(raw) => Some(raw),
            Err(err) => {
                warn!("light sensor read failed: {err}");
                None
            }
        };

        SensorReadings {
            temperature_c,
            humidity_pct,
            light_raw,
        }
    }
}

impl SystemControl for EspSystem {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn restart(&mut self) {
        info!("restarting");
        unsafe { esp_idf_svc::sys::esp_restart() };
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

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
