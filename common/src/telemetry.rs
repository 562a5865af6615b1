use chrono::NaiveDateTime;
use serde_json::{json, Value};

use crate::{config::FieldNaming, error::DeviceError, schedule::ScheduleConfig};

pub const DATE_PENDING: &str = "Syncing...";
pub const TIME_PENDING: &str = "--:--:--";
/// 12-bit ADC full scale.
pub const LIGHT_RAW_MAX: u16 = 4095;

/// One sampling pass. `None` means the sensor could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorReadings {
    pub temperature_c: Option<f32>,
    pub humidity_pct: Option<f32>,
    pub light_raw: Option<u16>,
}

pub trait TelemetrySource {
    fn read(&mut self) -> SensorReadings;
}

impl<T: TelemetrySource + ?Sized> TelemetrySource for Box<T> {
    fn read(&mut self) -> SensorReadings {
        (**self).read()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorSnapshot {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub light_raw: u16,
}

/// Last known-good value per quantity.
#[derive(Debug, Default)]
pub struct SensorCache {
    snapshot: SensorSnapshot,
}

impl SensorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        self.snapshot
    }

    /// Takes one reading and keeps only values inside the sensor ranges.
    /// Rejected quantities are returned; their previous value stays cached.
    pub fn refresh(&mut self, source: &mut impl TelemetrySource) -> Vec<DeviceError> {
        let readings = source.read();
        let mut rejected = Vec::new();

        match readings.temperature_c {
            Some(value) if value.is_finite() && (-40.0..=80.0).contains(&value) => {
                self.snapshot.temperature_c = value;
            }
            _ => rejected.push(DeviceError::SensorReadInvalid {
                quantity: "temperature",
            }),
        }

        match readings.humidity_pct {
            Some(value) if value.is_finite() && (0.0..=100.0).contains(&value) => {
                self.snapshot.humidity_pct = value;
            }
            _ => rejected.push(DeviceError::SensorReadInvalid {
                quantity: "humidity",
            }),
        }

        match readings.light_raw {
            Some(value) if value <= LIGHT_RAW_MAX => self.snapshot.light_raw = value,
            _ => rejected.push(DeviceError::SensorReadInvalid { quantity: "light" }),
        }

        rejected
    }
}

/// Deterministic stand-in for the real sensors: slow triangle waves around
/// indoor grow-room values.
#[derive(Debug, Default)]
pub struct SimulatedSensors {
    step: u32,
}

impl SimulatedSensors {
    pub fn new() -> Self {
        Self::default()
    }
}

fn triangle(step: u32, period: u32) -> f32 {
    let phase = step % period;
    let half = period / 2;
    let distance = if phase <= half { phase } else { period - phase };
    distance as f32 / half as f32
}

impl TelemetrySource for SimulatedSensors {
    fn read(&mut self) -> SensorReadings {
        self.step = self.step.wrapping_add(1);
        let temperature = 22.0 + 6.0 * triangle(self.step, 40);
        let humidity = 50.0 + 20.0 * triangle(self.step.wrapping_add(7), 30);
        let light = 400.0 + 2_400.0 * triangle(self.step.wrapping_add(3), 60);

        SensorReadings {
            temperature_c: Some(temperature.max(15.0)),
            humidity_pct: Some(humidity.max(30.0)),
            light_raw: Some((light as u16).max(100)),
        }
    }
}

/// Read surface served to the dashboard.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPayload {
    pub date: String,
    pub time: String,
    pub sensors: SensorSnapshot,
    pub schedule: ScheduleConfig,
    pub duty_cycle: u8,
}

impl TelemetryPayload {
    pub fn new(
        now: Option<NaiveDateTime>,
        sensors: SensorSnapshot,
        schedule: ScheduleConfig,
        duty_cycle: u8,
    ) -> Self {
        let (date, time) = match now {
            Some(now) => (
                now.format("%d/%m/%Y").to_string(),
                now.format("%H:%M:%S").to_string(),
            ),
            None => (DATE_PENDING.to_string(), TIME_PENDING.to_string()),
        };

        Self {
            date,
            time,
            sensors,
            schedule,
            duty_cycle,
        }
    }

    pub fn to_json(&self, naming: FieldNaming) -> Value {
        let temperature = round_tenth(self.sensors.temperature_c);
        let humidity = round_tenth(self.sensors.humidity_pct);
        let on_time = self.schedule.on_time.to_string();
        let off_time = self.schedule.off_time.to_string();

        match naming {
            FieldNaming::Canonical => json!({
                "date": self.date,
                "time": self.time,
                "temperatureC": temperature,
                "humidityPct": humidity,
                "lightRaw": self.sensors.light_raw,
                "onTime": on_time,
                "offTime": off_time,
                "maxIntensityPercent": self.schedule.max_intensity_percent,
                "dutyCycle": self.duty_cycle,
            }),
            FieldNaming::Legacy => json!({
                "date": self.date,
                "time": self.time,
                "temperatura": temperature,
                "humidade": humidity,
                "luminosidade": self.sensors.light_raw,
                "hora_ligar": on_time,
                "hora_desligar": off_time,
                "luz_maxima": self.schedule.max_intensity_percent,
                "dutyCycle": self.duty_cycle,
            }),
        }
    }
}

fn round_tenth(value: f32) -> f64 {
    (f64::from(value) * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{testing::ReplaySensors, time_of_day::TimeOfDay};

    fn reading(temperature: f32, humidity: f32, light: u16) -> SensorReadings {
        SensorReadings {
            temperature_c: Some(temperature),
            humidity_pct: Some(humidity),
            light_raw: Some(light),
        }
    }

    #[test]
    fn invalid_readings_keep_last_good_value() {
        let mut cache = SensorCache::new();
        let mut source = ReplaySensors::new([
            reading(24.5, 61.0, 1_800),
            SensorReadings {
                temperature_c: Some(f32::NAN),
                humidity_pct: None,
                light_raw: Some(9_999),
            },
            reading(25.0, 130.0, 1_700),
        ]);

        assert!(cache.refresh(&mut source).is_empty());

        let rejected = cache.refresh(&mut source);
        assert_eq!(
            rejected,
            vec![
                DeviceError::SensorReadInvalid {
                    quantity: "temperature"
                },
                DeviceError::SensorReadInvalid { quantity: "humidity" },
                DeviceError::SensorReadInvalid { quantity: "light" },
            ]
        );
        assert_eq!(
            cache.snapshot(),
            SensorSnapshot {
                temperature_c: 24.5,
                humidity_pct: 61.0,
                light_raw: 1_800,
            }
        );

        assert_eq!(cache.refresh(&mut source).len(), 1);
        assert_eq!(cache.snapshot().temperature_c, 25.0);
        assert_eq!(cache.snapshot().humidity_pct, 61.0);
        assert_eq!(cache.snapshot().light_raw, 1_700);
    }

    #[test]
    fn simulated_sensors_stay_in_range() {
        let mut sensors = SimulatedSensors::new();
        let mut cache = SensorCache::new();
        for _ in 0..500 {
            assert!(cache.refresh(&mut sensors).is_empty());
            let snapshot = cache.snapshot();
            assert!(snapshot.temperature_c >= 15.0);
            assert!(snapshot.humidity_pct >= 30.0);
            assert!(snapshot.light_raw >= 100);
        }
    }

    fn sample_payload(now: Option<NaiveDateTime>) -> TelemetryPayload {
        let schedule = ScheduleConfig {
            on_time: TimeOfDay::from_hm(18, 0).unwrap(),
            off_time: TimeOfDay::from_hm(6, 0).unwrap(),
            ramp_duration_minutes: 60,
            max_intensity_percent: 100,
        };
        let sensors = SensorSnapshot {
            temperature_c: 24.46,
            humidity_pct: 58.0,
            light_raw: 2_048,
        };
        TelemetryPayload::new(now, sensors, schedule, 255)
    }

    #[test]
    fn canonical_payload_fields() {
        let now = NaiveDate::from_ymd_opt(2026, 3, 9)
            .unwrap()
            .and_hms_opt(21, 5, 7)
            .unwrap();
        let json = sample_payload(Some(now)).to_json(FieldNaming::Canonical);

        assert_eq!(
            json,
            json!({
                "date": "09/03/2026",
                "time": "21:05:07",
                "temperatureC": 24.5,
                "humidityPct": 58.0,
                "lightRaw": 2048,
                "onTime": "18:00",
                "offTime": "06:00",
                "maxIntensityPercent": 100,
                "dutyCycle": 255,
            })
        );
    }

    #[test]
    fn legacy_payload_fields_while_time_syncs() {
        let json = sample_payload(None).to_json(FieldNaming::Legacy);

        assert_eq!(json["date"], "Syncing...");
        assert_eq!(json["time"], "--:--:--");
        assert_eq!(json["hora_ligar"], "18:00");
        assert_eq!(json["hora_desligar"], "06:00");
        assert_eq!(json["luz_maxima"], 100);
        assert_eq!(json["luminosidade"], 2048);
        assert!(json.get("onTime").is_none());
    }
}
