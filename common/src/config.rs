use serde::{Deserialize, Serialize};

use crate::schedule::DEFAULT_RAMP_MINUTES;

pub const DEFAULT_AP_SSID: &str = "Growlight-Setup";
pub const DEFAULT_TIMEZONE: &str = "America/Sao_Paulo";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub join_attempts: u32,
    pub join_attempt_delay_ms: u64,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_failures: u32,
    pub ack_flush_delay_ms: u64,
    pub restart_notice_delay_ms: u64,
    pub ap_ssid: String,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            join_attempts: 30,
            join_attempt_delay_ms: 500,
            reconnect_interval_ms: 5_000,
            max_reconnect_failures: 10,
            ack_flush_delay_ms: 3_000,
            restart_notice_delay_ms: 1_000,
            ap_ssid: DEFAULT_AP_SSID.to_string(),
        }
    }
}

impl ConnectivityConfig {
    pub fn sanitize(&mut self) {
        self.join_attempts = self.join_attempts.clamp(1, 240);
        self.join_attempt_delay_ms = self.join_attempt_delay_ms.clamp(50, 10_000);
        self.reconnect_interval_ms = self.reconnect_interval_ms.clamp(500, 300_000);
        self.max_reconnect_failures = self.max_reconnect_failures.clamp(1, 1_000);

        let ssid = self.ap_ssid.trim();
        // 802.11 caps SSIDs at 32 bytes.
        if ssid.is_empty() || ssid.len() > 32 {
            self.ap_ssid = DEFAULT_AP_SSID.to_string();
        } else if ssid.len() != self.ap_ssid.len() {
            self.ap_ssid = ssid.to_string();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LightConfig {
    pub ramp_duration_minutes: u16,
    pub pwm_pin: i32,
    pub pwm_frequency_hz: u32,
    pub update_interval_ms: u64,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            ramp_duration_minutes: DEFAULT_RAMP_MINUTES,
            pwm_pin: 25,
            pwm_frequency_hz: 5_000,
            update_interval_ms: 1_000,
        }
    }
}

impl LightConfig {
    pub fn sanitize(&mut self) {
        self.ramp_duration_minutes = self.ramp_duration_minutes.min(720);
        if self.pwm_pin < 0 {
            self.pwm_pin = 25;
        }
        self.pwm_frequency_hz = self.pwm_frequency_hz.clamp(100, 40_000);
        self.update_interval_ms = self.update_interval_ms.clamp(100, 60_000);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SensorSource {
    #[default]
    Simulated,
    Hardware,
}

impl SensorSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simulated => "simulated",
            Self::Hardware => "hardware",
        }
    }
}

/// Key set used for the telemetry read surface and settings form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldNaming {
    #[default]
    Canonical,
    Legacy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub sensor_source: SensorSource,
    pub field_naming: FieldNaming,
    pub refresh_interval_ms: u64,
    pub status_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sensor_source: SensorSource::Simulated,
            field_naming: FieldNaming::Canonical,
            refresh_interval_ms: 2_000,
            status_interval_ms: 10_000,
        }
    }
}

impl TelemetryConfig {
    pub fn sanitize(&mut self) {
        // DHT11 cannot be sampled faster than once per second.
        self.refresh_interval_ms = self.refresh_interval_ms.clamp(1_000, 600_000);
        self.status_interval_ms = self.status_interval_ms.clamp(1_000, 3_600_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub connectivity: ConnectivityConfig,
    pub light: LightConfig,
    pub telemetry: TelemetryConfig,
    pub timezone: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            connectivity: ConnectivityConfig::default(),
            light: LightConfig::default(),
            telemetry: TelemetryConfig::default(),
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        self.connectivity.sanitize();
        self.light.sanitize();
        self.telemetry.sanitize();
        if self.timezone.trim().is_empty() {
            self.timezone = DEFAULT_TIMEZONE.to_string();
        }
    }
}
