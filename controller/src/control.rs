use std::{
    sync::mpsc::{Receiver, Sender},
    time::Duration,
};

use chrono::NaiveDateTime;
use growlight_common::{
    compute_duty_cycle, Cadence, ConnectOutcome, ConnectionState, ConnectivityEvent,
    ConnectivityManager, DeviceConfig, DeviceError, DimmerOutput, FieldNaming, KeyValueStore,
    LightOutput, NetworkLink, PersistedSchedule, ProvisioningPortal, ScheduleConfig, SensorCache,
    SettingsSink, SettingsUpdate, SystemControl, TelemetryPayload, TelemetrySource, TimeOfDay,
    WallClock,
};
use log::{debug, info, warn};
use serde_json::Value;

/// How long an HTTP handler waits for the control loop to answer.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests from HTTP handlers. Each carries the channel its answer goes back on.
pub enum ControlRequest {
    Telemetry {
        reply: Sender<Value>,
    },
    UpdateSettings {
        update: SettingsUpdate,
        reply: Sender<Result<(), DeviceError>>,
    },
}

/// Single-threaded owner of all device state. Every sub-task is time-gated
/// and driven from [`ControlLoop::step`].
pub struct ControlLoop<S, L, P, Y> {
    connectivity: ConnectivityManager<S, L, P, Y>,
    schedule: PersistedSchedule<S>,
    light: LightOutput<Box<dyn DimmerOutput>>,
    sensors: Box<dyn TelemetrySource>,
    cache: SensorCache,
    clock: Box<dyn WallClock>,
    requests: Receiver<ControlRequest>,
    field_naming: FieldNaming,
    light_cadence: Cadence,
    sensor_cadence: Cadence,
    status_cadence: Cadence,
}

impl<S, L, P, Y> ControlLoop<S, L, P, Y>
where
    S: KeyValueStore,
    L: NetworkLink,
    P: ProvisioningPortal,
    Y: SystemControl,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &DeviceConfig,
        connectivity: ConnectivityManager<S, L, P, Y>,
        schedule: PersistedSchedule<S>,
        light: LightOutput<Box<dyn DimmerOutput>>,
        sensors: Box<dyn TelemetrySource>,
        clock: Box<dyn WallClock>,
        requests: Receiver<ControlRequest>,
    ) -> Self {
        Self {
            connectivity,
            schedule,
            light,
            sensors,
            cache: SensorCache::new(),
            clock,
            requests,
            field_naming: config.telemetry.field_naming,
            light_cadence: Cadence::new(config.light.update_interval_ms),
            sensor_cadence: Cadence::new(config.telemetry.refresh_interval_ms),
            status_cadence: Cadence::new(config.telemetry.status_interval_ms),
        }
    }

    /// Darkens the fixture, then runs the blocking connectivity startup.
    pub fn boot(&mut self) -> Result<ConnectOutcome, DeviceError> {
        if let Err(err) = self.light.force_off() {
            warn!("failed to drive light off at boot: {err}");
        }

        let schedule = self.schedule.schedule();
        info!(
            "schedule: on {} off {} ramp {} min max {}%",
            schedule.on_time,
            schedule.off_time,
            schedule.ramp_duration_minutes,
            schedule.max_intensity_percent
        );

        self.connectivity.initialize()
    }

    pub fn state(&self) -> ConnectionState {
        self.connectivity.state()
    }

    pub fn step(&mut self) {
        match self.connectivity.tick() {
            ConnectivityEvent::Restart(reason) => {
                info!("restart requested ({reason:?})");
                return;
            }
            ConnectivityEvent::LinkRestored => self.status_cadence.reset(),
            _ => {}
        }

        self.serve_requests();

        if self.connectivity.state() != ConnectionState::Connected {
            return;
        }

        let now_ms = self.connectivity.system().now_ms();
        if self.sensor_cadence.due(now_ms) {
            self.refresh_sensors();
        }
        if self.light_cadence.due(now_ms) {
            self.update_light();
        }
        if self.status_cadence.due(now_ms) {
            self.log_status();
        }
    }

    fn refresh_sensors(&mut self) {
        for rejected in self.cache.refresh(&mut self.sensors) {
            debug!("{rejected}, keeping last value");
        }
    }

    fn update_light(&mut self) {
        let Some(duty) = scheduled_duty(self.clock.local_now(), self.schedule.schedule()) else {
            return;
        };
        match self.light.apply(duty) {
            Ok(true) => debug!("light duty {duty}/255"),
            Ok(false) => {}
            Err(err) => warn!("{err}"),
        }
    }

    fn log_status(&mut self) {
        let address = self
            .connectivity
            .link_mut()
            .address()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".to_string());
        let time = match self.clock.local_now() {
            Ok(now) => now.format("%a %d/%m/%Y %H:%M:%S").to_string(),
            Err(err) => err.to_string(),
        };
        let sensors = self.cache.snapshot();
        let schedule = self.schedule.schedule();

        info!(
            "status: network `{}` ip {address} | {time} | {:.1} C {:.1} % light {} | on {} off {} max {}% | duty {}/255",
            self.connectivity.network_name().unwrap_or("-"),
            sensors.temperature_c,
            sensors.humidity_pct,
            sensors.light_raw,
            schedule.on_time,
            schedule.off_time,
            schedule.max_intensity_percent,
            self.light.duty_cycle(),
        );
    }

    fn serve_requests(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            match request {
                ControlRequest::Telemetry { reply } => {
                    let payload = TelemetryPayload::new(
                        self.clock.local_now().ok(),
                        self.cache.snapshot(),
                        *self.schedule.schedule(),
                        self.light.duty_cycle(),
                    );
                    let _ = reply.send(payload.to_json(self.field_naming));
                }
                ControlRequest::UpdateSettings { update, reply } => {
                    let result = self.apply_settings(&update);
                    if let Err(err) = &result {
                        warn!("settings rejected: {err}");
                    }
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn apply_settings(&mut self, update: &SettingsUpdate) -> Result<(), DeviceError> {
        let ramp = self.schedule.schedule().ramp_duration_minutes;
        let schedule = update.validate(ramp)?;
        self.schedule.apply_schedule(schedule)?;
        self.light_cadence.reset();
        Ok(())
    }
}

/// Duty for the current local time, or `None` while the clock is unsynced.
pub fn scheduled_duty(
    now: Result<NaiveDateTime, DeviceError>,
    schedule: &ScheduleConfig,
) -> Option<u8> {
    let now = now.ok()?;
    Some(compute_duty_cycle(TimeOfDay::from_time(&now), schedule))
}
