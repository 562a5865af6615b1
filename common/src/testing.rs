use std::collections::VecDeque;

use crate::{
    connectivity::{ConnectionCredentials, NetworkLink, ProvisioningPortal, SystemControl},
    error::DeviceError,
    light::DimmerOutput,
    telemetry::{SensorReadings, TelemetrySource},
};

#[derive(Debug, Default)]
pub struct ScriptedLink {
    pub up: bool,
    /// Polls of `is_up` after a join before the link comes up. `None` never does.
    pub up_after_polls: Option<u32>,
    pub reject_join: bool,
    pub fail_reconnect: bool,
    pub fail_access_point: bool,
    pub joined: Option<ConnectionCredentials>,
    pub access_point: Option<String>,
    pub reconnects: u32,
    pub left: bool,
    polls: u32,
}

impl ScriptedLink {
    pub fn reachable() -> Self {
        Self::up_after_polls(1)
    }

    pub fn up_after_polls(polls: u32) -> Self {
        Self {
            up_after_polls: Some(polls),
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn rejecting() -> Self {
        Self {
            reject_join: true,
            ..Self::default()
        }
    }
}

impl NetworkLink for ScriptedLink {
    fn join(&mut self, credentials: &ConnectionCredentials) -> Result<(), DeviceError> {
        if self.reject_join {
            return Err(DeviceError::CredentialRejected {
                network: credentials.network_name.clone(),
                reason: "authentication failed".to_string(),
            });
        }
        self.joined = Some(credentials.clone());
        self.polls = 0;
        Ok(())
    }

    fn is_up(&mut self) -> bool {
        if !self.up && self.joined.is_some() {
            if let Some(needed) = self.up_after_polls {
                self.polls += 1;
                if self.polls >= needed {
                    self.up = true;
                    self.up_after_polls = None;
                }
            }
        }
        self.up
    }

    fn reconnect(&mut self) -> Result<(), DeviceError> {
        self.reconnects += 1;
        if self.fail_reconnect {
            return Err(DeviceError::LinkTimeout {
                network: "scripted".to_string(),
                attempts: 1,
            });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.left = true;
        self.up = false;
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), DeviceError> {
        if self.fail_access_point {
            return Err(DeviceError::AccessPointUnavailable("radio busy".to_string()));
        }
        self.access_point = Some(ssid.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct QueuedPortal {
    pub opened: bool,
    pub pending: VecDeque<ConnectionCredentials>,
    pub acks: Vec<bool>,
}

impl ProvisioningPortal for QueuedPortal {
    fn open(&mut self) -> Result<(), DeviceError> {
        self.opened = true;
        Ok(())
    }

    fn service(&mut self) -> Option<ConnectionCredentials> {
        self.pending.pop_front()
    }

    fn acknowledge(&mut self, result: &Result<(), DeviceError>) {
        self.acks.push(result.is_ok());
    }
}

#[derive(Debug, Default)]
pub struct RecordingSystem {
    pub now_ms: u64,
    pub delays: Vec<u64>,
    pub restarts: u32,
}

impl RecordingSystem {
    pub fn advance(&mut self, ms: u64) {
        self.now_ms += ms;
    }
}

impl SystemControl for RecordingSystem {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn delay_ms(&mut self, ms: u64) {
        self.delays.push(ms);
        self.now_ms += ms;
    }

    fn restart(&mut self) {
        self.restarts += 1;
    }
}

#[derive(Debug, Default)]
pub struct RecordingDimmer {
    pub writes: Vec<u8>,
    pub attempts: u32,
    fail: bool,
}

impl RecordingDimmer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

impl DimmerOutput for RecordingDimmer {
    fn set_duty(&mut self, duty: u8) -> Result<(), DeviceError> {
        self.attempts += 1;
        if self.fail {
            return Err(DeviceError::OutputFailure("channel not configured".to_string()));
        }
        self.writes.push(duty);
        Ok(())
    }
}

/// Replays readings in order, then repeats the last one.
#[derive(Debug, Default)]
pub struct ReplaySensors {
    pub readings: VecDeque<SensorReadings>,
    last: SensorReadings,
}

impl ReplaySensors {
    pub fn new(readings: impl IntoIterator<Item = SensorReadings>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
            last: SensorReadings::default(),
        }
    }
}

impl TelemetrySource for ReplaySensors {
    fn read(&mut self) -> SensorReadings {
        if let Some(next) = self.readings.pop_front() {
            self.last = next;
        }
        self.last
    }
}
