use log::{info, warn};
use serde::Deserialize;

use crate::{
    error::DeviceError,
    schedule::ScheduleConfig,
    store::{self, KeyValueStore, Namespace},
    time_of_day::TimeOfDay,
};

/// Raw settings as submitted by the dashboard, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SettingsUpdate {
    #[serde(rename = "onTime", alias = "hora_ligar", alias = "ligar", alias = "horaLigar")]
    pub on_time: String,
    #[serde(
        rename = "offTime",
        alias = "hora_desligar",
        alias = "desligar",
        alias = "horaDesligar"
    )]
    pub off_time: String,
    #[serde(
        rename = "maxIntensityPercent",
        alias = "luz_maxima",
        alias = "aceleracao",
        alias = "luzMaxima"
    )]
    pub max_intensity_percent: i64,
}

const ON_TIME_KEYS: &[&str] = &["onTime", "hora_ligar", "ligar", "horaLigar"];
const OFF_TIME_KEYS: &[&str] = &["offTime", "hora_desligar", "desligar", "horaDesligar"];
const INTENSITY_KEYS: &[&str] = &["maxIntensityPercent", "luz_maxima", "aceleracao", "luzMaxima"];

impl SettingsUpdate {
    /// Builds an update from decoded form fields, accepting the legacy names.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self, DeviceError> {
        let field = |keys: &[&str]| {
            pairs
                .iter()
                .find(|(key, _)| keys.contains(&key.as_str()))
                .map(|(_, value)| value.trim().to_string())
                .ok_or_else(|| DeviceError::InvalidSettings(format!("missing `{}`", keys[0])))
        };

        let on_time = field(ON_TIME_KEYS)?;
        let off_time = field(OFF_TIME_KEYS)?;
        let raw_intensity = field(INTENSITY_KEYS)?;
        let max_intensity_percent = raw_intensity.parse().map_err(|_| {
            DeviceError::InvalidSettings(format!(
                "`{raw_intensity}` is not a whole percentage"
            ))
        })?;

        Ok(Self {
            on_time,
            off_time,
            max_intensity_percent,
        })
    }

    pub fn validate(&self, ramp_duration_minutes: u16) -> Result<ScheduleConfig, DeviceError> {
        let on_time: TimeOfDay = self.on_time.parse()?;
        let off_time: TimeOfDay = self.off_time.parse()?;
        let max_intensity_percent = u8::try_from(self.max_intensity_percent)
            .ok()
            .filter(|percent| *percent <= 100)
            .ok_or_else(|| {
                DeviceError::InvalidSettings(format!(
                    "intensity {} is outside 0-100",
                    self.max_intensity_percent
                ))
            })?;

        Ok(ScheduleConfig {
            on_time,
            off_time,
            ramp_duration_minutes,
            max_intensity_percent,
        })
    }
}

/// Accepts validated schedule updates.
pub trait SettingsSink {
    fn apply_schedule(&mut self, schedule: ScheduleConfig) -> Result<(), DeviceError>;
}

/// Schedule held in memory and mirrored to the `schedule-settings` record.
#[derive(Debug)]
pub struct PersistedSchedule<S> {
    store: S,
    schedule: ScheduleConfig,
}

impl<S: KeyValueStore> PersistedSchedule<S> {
    pub fn load(store: S, ramp_duration_minutes: u16) -> Self {
        let schedule = match store::load_record::<ScheduleConfig>(&store, Namespace::ScheduleSettings)
        {
            Ok(Some(schedule)) => schedule,
            Ok(None) => ScheduleConfig::default(),
            Err(err) => {
                warn!("stored schedule unreadable, using defaults: {err}");
                ScheduleConfig::default()
            }
        }
        .with_ramp(ramp_duration_minutes);

        if schedule.ramps_overlap() {
            warn!(
                "ramp of {} min overlaps the {}-{} schedule",
                schedule.ramp_duration_minutes, schedule.on_time, schedule.off_time
            );
        }

        Self { store, schedule }
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }
}

impl<S: KeyValueStore> SettingsSink for PersistedSchedule<S> {
    fn apply_schedule(&mut self, schedule: ScheduleConfig) -> Result<(), DeviceError> {
        let schedule = schedule.with_ramp(self.schedule.ramp_duration_minutes);
        store::save_record(&mut self.store, Namespace::ScheduleSettings, &schedule)?;
        self.schedule = schedule;

        info!(
            "schedule saved: on {} off {} max {}%",
            schedule.on_time, schedule.off_time, schedule.max_intensity_percent
        );
        if schedule.ramps_overlap() {
            warn!(
                "ramp of {} min overlaps the {}-{} schedule",
                schedule.ramp_duration_minutes, schedule.on_time, schedule.off_time
            );
        }
        Ok(())
    }
}
