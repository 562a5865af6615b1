pub mod cadence;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod light;
pub mod schedule;
pub mod settings;
pub mod store;
pub mod telemetry;
pub mod time_of_day;

#[cfg(test)]
mod testing;

pub use cadence::Cadence;
pub use config::{
    ConnectivityConfig, DeviceConfig, FieldNaming, LightConfig, SensorSource, TelemetryConfig,
};
pub use connectivity::{
    ConnectOutcome, ConnectionCredentials, ConnectionState, ConnectivityEvent,
    ConnectivityManager, NetworkLink, ProvisioningPortal, RestartReason, RetryState,
    SystemControl,
};
pub use error::DeviceError;
pub use light::{DimmerOutput, LightOutput};
pub use schedule::{compute_duty_cycle, ScheduleConfig};
pub use settings::{PersistedSchedule, SettingsSink, SettingsUpdate};
pub use store::{KeyValueStore, MemoryStore, Namespace};
pub use telemetry::{
    SensorCache, SensorReadings, SensorSnapshot, SimulatedSensors, TelemetryPayload,
    TelemetrySource,
};
pub use time_of_day::{TimeOfDay, WallClock};
