use std::{fmt, net::Ipv4Addr};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::ConnectivityConfig,
    error::DeviceError,
    store::{self, KeyValueStore, Namespace},
};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCredentials {
    #[serde(rename = "networkName", alias = "ssid")]
    pub network_name: String,
    #[serde(default, alias = "pass")]
    pub secret: String,
}

impl ConnectionCredentials {
    pub fn new(network_name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            network_name: network_name.into(),
            secret: secret.into(),
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.network_name.trim().is_empty()
    }
}

impl fmt::Debug for ConnectionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCredentials")
            .field("network_name", &self.network_name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Unconfigured,
    ApProvisioning,
    ConnectingSta,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconfigured => "UNCONFIGURED",
            Self::ApProvisioning => "AP_PROVISIONING",
            Self::ConnectingSta => "CONNECTING_STA",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryState {
    pub consecutive_failures: u32,
    pub last_attempt_ms: Option<u64>,
    attempt_pending: bool,
}

impl RetryState {
    fn reset(&mut self, now_ms: u64) {
        *self = Self {
            consecutive_failures: 0,
            last_attempt_ms: Some(now_ms),
            attempt_pending: false,
        };
    }

    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.attempt_pending = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    CredentialsSaved,
    ReconnectExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Idle,
    LinkLost,
    ReconnectAttempt { attempt: u32 },
    LinkRestored,
    Restart(RestartReason),
}

/// Station/AP radio control. Every call returns promptly; association
/// progress is observed through [`NetworkLink::is_up`].
pub trait NetworkLink {
    fn join(&mut self, credentials: &ConnectionCredentials) -> Result<(), DeviceError>;

    fn is_up(&mut self) -> bool;

    /// Re-issues association with the last joined network.
    fn reconnect(&mut self) -> Result<(), DeviceError>;

    fn leave(&mut self);

    fn start_access_point(&mut self, ssid: &str) -> Result<(), DeviceError>;

    fn address(&mut self) -> Option<Ipv4Addr> {
        None
    }
}

/// Captive portal surface: DNS redirect plus the credential form.
pub trait ProvisioningPortal {
    fn open(&mut self) -> Result<(), DeviceError>;

    /// Services pending traffic and hands back a submission, if one arrived.
    fn service(&mut self) -> Option<ConnectionCredentials>;

    /// Reports the save result to whoever submitted the last credentials.
    fn acknowledge(&mut self, result: &Result<(), DeviceError>);
}

pub trait SystemControl {
    fn now_ms(&self) -> u64;

    fn delay_ms(&mut self, ms: u64);

    /// Reboots the device. Hardware implementations do not return.
    fn restart(&mut self);
}

pub struct ConnectivityManager<S, L, P, Y> {
    config: ConnectivityConfig,
    store: S,
    link: L,
    portal: P,
    system: Y,
    state: ConnectionState,
    network_name: Option<String>,
    retry: RetryState,
}

impl<S, L, P, Y> ConnectivityManager<S, L, P, Y>
where
    S: KeyValueStore,
    L: NetworkLink,
    P: ProvisioningPortal,
    Y: SystemControl,
{
    pub fn new(config: ConnectivityConfig, store: S, link: L, portal: P, system: Y) -> Self {
        Self {
            config,
            store,
            link,
            portal,
            system,
            state: ConnectionState::Unconfigured,
            network_name: None,
            retry: RetryState::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry(&self) -> RetryState {
        self.retry
    }

    pub fn network_name(&self) -> Option<&str> {
        self.network_name.as_deref()
    }

    pub fn system(&self) -> &Y {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut Y {
        &mut self.system
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn portal_mut(&mut self) -> &mut P {
        &mut self.portal
    }

    /// Blocking startup. Joins the stored network within the attempt budget or
    /// falls back to provisioning. Only an access point that cannot be
    /// brought up is reported as an error.
    pub fn initialize(&mut self) -> Result<ConnectOutcome, DeviceError> {
        let stored = match store::load_record::<ConnectionCredentials>(
            &self.store,
            Namespace::NetworkCredentials,
        ) {
            Ok(credentials) => credentials.filter(ConnectionCredentials::is_usable),
            Err(err) => {
                warn!("ignoring unreadable credentials: {err}");
                None
            }
        };

        let Some(credentials) = stored else {
            info!("no stored network credentials");
            self.enter_provisioning()?;
            return Ok(ConnectOutcome::NotConnected);
        };

        self.state = ConnectionState::ConnectingSta;
        info!("joining `{}`", credentials.network_name);

        match self.join_blocking(&credentials) {
            Ok(()) => {
                let now_ms = self.system.now_ms();
                self.retry.reset(now_ms);
                self.network_name = Some(credentials.network_name);
                self.state = ConnectionState::Connected;
                if let Some(address) = self.link.address() {
                    info!("connected, address {address}");
                } else {
                    info!("connected");
                }
                Ok(ConnectOutcome::Connected)
            }
            Err(err) => {
                warn!("{err}; discarding stored credentials");
                self.link.leave();
                self.clear_credentials();
                self.enter_provisioning()?;
                Ok(ConnectOutcome::NotConnected)
            }
        }
    }

    fn join_blocking(&mut self, credentials: &ConnectionCredentials) -> Result<(), DeviceError> {
        self.link.join(credentials)?;

        for _ in 0..self.config.join_attempts {
            if self.link.is_up() {
                return Ok(());
            }
            self.system.delay_ms(self.config.join_attempt_delay_ms);
        }

        if self.link.is_up() {
            return Ok(());
        }

        Err(DeviceError::LinkTimeout {
            network: credentials.network_name.clone(),
            attempts: self.config.join_attempts,
        })
    }

    fn enter_provisioning(&mut self) -> Result<(), DeviceError> {
        self.link.start_access_point(&self.config.ap_ssid)?;
        self.portal.open()?;
        self.state = ConnectionState::ApProvisioning;
        info!(
            "provisioning access point `{}` is up",
            self.config.ap_ssid
        );
        Ok(())
    }

    /// Must run on every loop iteration.
    pub fn tick(&mut self) -> ConnectivityEvent {
        let now_ms = self.system.now_ms();
        match self.state {
            ConnectionState::ApProvisioning => self.service_portal(),
            ConnectionState::Connected => self.supervise(now_ms),
            ConnectionState::Reconnecting => self.retry_link(now_ms),
            ConnectionState::Unconfigured | ConnectionState::ConnectingSta => {
                ConnectivityEvent::Idle
            }
        }
    }

    fn service_portal(&mut self) -> ConnectivityEvent {
        let Some(credentials) = self.portal.service() else {
            return ConnectivityEvent::Idle;
        };

        info!("portal submitted credentials for `{}`", credentials.network_name);
        match self.save_credentials(credentials) {
            Ok(()) => ConnectivityEvent::Restart(RestartReason::CredentialsSaved),
            Err(err) => {
                warn!("credentials not saved: {err}");
                ConnectivityEvent::Idle
            }
        }
    }

    /// Persists the pair as one record, waits for the acknowledgment to reach
    /// the submitter, then restarts so the next boot joins the new network.
    pub fn save_credentials(&mut self, credentials: ConnectionCredentials) -> Result<(), DeviceError> {
        let result = if credentials.is_usable() {
            store::save_record(&mut self.store, Namespace::NetworkCredentials, &credentials)
        } else {
            Err(DeviceError::InvalidSettings(
                "network name must not be empty".to_string(),
            ))
        };

        self.portal.acknowledge(&result);
        result?;

        info!(
            "credentials for `{}` saved, restarting in {} ms",
            credentials.network_name, self.config.ack_flush_delay_ms
        );
        self.system.delay_ms(self.config.ack_flush_delay_ms);
        self.state = ConnectionState::Unconfigured;
        self.system.restart();
        Ok(())
    }

    fn supervise(&mut self, now_ms: u64) -> ConnectivityEvent {
        if self.link.is_up() {
            self.retry.reset(now_ms);
            return ConnectivityEvent::Idle;
        }

        warn!(
            "link to `{}` dropped, retrying every {} ms",
            self.network_name.as_deref().unwrap_or("?"),
            self.config.reconnect_interval_ms
        );
        self.retry.reset(now_ms);
        self.state = ConnectionState::Reconnecting;
        ConnectivityEvent::LinkLost
    }

    fn retry_link(&mut self, now_ms: u64) -> ConnectivityEvent {
        if self.link.is_up() {
            info!(
                "link restored after {} failed attempt(s)",
                self.retry.consecutive_failures
            );
            self.retry.reset(now_ms);
            self.state = ConnectionState::Connected;
            return ConnectivityEvent::LinkRestored;
        }

        let due = self
            .retry
            .last_attempt_ms
            .map(|last| now_ms.saturating_sub(last) >= self.config.reconnect_interval_ms)
            .unwrap_or(true);
        if !due {
            return ConnectivityEvent::Idle;
        }

        // An attempt that has not brought the link up within one interval failed.
        if self.retry.attempt_pending {
            self.retry.record_failure();
        }

        if self.retry.consecutive_failures >= self.config.max_reconnect_failures {
            return self.fail_over();
        }

        let attempt = self.retry.consecutive_failures + 1;
        self.retry.last_attempt_ms = Some(now_ms);
        info!(
            "reconnect attempt {attempt}/{}",
            self.config.max_reconnect_failures
        );
        match self.link.reconnect() {
            Ok(()) => self.retry.attempt_pending = true,
            Err(err) => {
                warn!("reconnect attempt {attempt} failed: {err}");
                self.retry.record_failure();
            }
        }

        ConnectivityEvent::ReconnectAttempt { attempt }
    }

    fn fail_over(&mut self) -> ConnectivityEvent {
        warn!(
            "{} consecutive reconnect failures, clearing credentials and restarting",
            self.retry.consecutive_failures
        );
        self.clear_credentials();
        self.state = ConnectionState::Unconfigured;
        self.system.delay_ms(self.config.restart_notice_delay_ms);
        self.system.restart();
        ConnectivityEvent::Restart(RestartReason::ReconnectExhausted)
    }

    fn clear_credentials(&mut self) {
        self.network_name = None;
        if let Err(err) = self.store.erase(Namespace::NetworkCredentials) {
            warn!("failed to clear stored credentials: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        store::MemoryStore,
        testing::{QueuedPortal, RecordingSystem, ScriptedLink},
    };

    type TestManager = ConnectivityManager<MemoryStore, ScriptedLink, QueuedPortal, RecordingSystem>;

    const HOME: &str = r#"{"networkName": "home", "secret": "hunter22"}"#;

    fn manager(store: MemoryStore, link: ScriptedLink) -> TestManager {
        ConnectivityManager::new(
            ConnectivityConfig::default(),
            store,
            link,
            QueuedPortal::default(),
            RecordingSystem::default(),
        )
    }

    fn connected(store: MemoryStore) -> TestManager {
        let mut manager = manager(store, ScriptedLink::reachable());
        assert_eq!(manager.initialize().unwrap(), ConnectOutcome::Connected);
        manager
    }

    fn stored_credentials(store: &MemoryStore) -> Option<ConnectionCredentials> {
        store::load_record(store, Namespace::NetworkCredentials).unwrap()
    }

    /// Advances the clock one retry interval and ticks.
    fn next_interval(manager: &mut TestManager) -> ConnectivityEvent {
        manager.system_mut().advance(5_000);
        manager.tick()
    }

    #[test]
    fn no_credentials_enters_provisioning() {
        let mut manager = manager(MemoryStore::new(), ScriptedLink::reachable());

        assert_eq!(manager.initialize().unwrap(), ConnectOutcome::NotConnected);
        assert_eq!(manager.state(), ConnectionState::ApProvisioning);
        assert_eq!(manager.link_mut().access_point.as_deref(), Some("Growlight-Setup"));
        assert!(manager.portal_mut().opened);
        assert_eq!(manager.link_mut().joined, None);
    }

    #[test]
    fn stored_credentials_join_and_connect() {
        let store = MemoryStore::new().with_record(Namespace::NetworkCredentials, HOME);
        let mut manager = manager(store, ScriptedLink::up_after_polls(4));

        assert_eq!(manager.initialize().unwrap(), ConnectOutcome::Connected);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.network_name(), Some("home"));
        assert_eq!(
            manager.link_mut().joined,
            Some(ConnectionCredentials::new("home", "hunter22"))
        );
        assert_eq!(manager.system().delays, vec![500, 500, 500]);
    }

    #[test]
    fn legacy_credential_keys_are_accepted() {
        let store = MemoryStore::new()
            .with_record(Namespace::NetworkCredentials, r#"{"ssid": "old", "pass": "pw"}"#);
        let mut manager = connected(store);
        assert_eq!(manager.network_name(), Some("old"));
        assert_eq!(
            manager.link_mut().joined,
            Some(ConnectionCredentials::new("old", "pw"))
        );
    }

    #[test]
    fn join_timeout_discards_credentials() {
        let store = MemoryStore::new().with_record(Namespace::NetworkCredentials, HOME);
        let mut manager = manager(store.clone(), ScriptedLink::unreachable());

        assert_eq!(manager.initialize().unwrap(), ConnectOutcome::NotConnected);
        assert_eq!(manager.state(), ConnectionState::ApProvisioning);
        assert_eq!(stored_credentials(&store), None);
        assert_eq!(manager.system().delays.len(), 30);
        assert!(manager.system().delays.iter().all(|delay| *delay == 500));
        assert!(manager.link_mut().left);
    }

    #[test]
    fn rejected_join_discards_credentials() {
        let store = MemoryStore::new().with_record(Namespace::NetworkCredentials, HOME);
        let mut manager = manager(store.clone(), ScriptedLink::rejecting());

        assert_eq!(manager.initialize().unwrap(), ConnectOutcome::NotConnected);
        assert_eq!(manager.state(), ConnectionState::ApProvisioning);
        assert_eq!(stored_credentials(&store), None);
        assert!(manager.system().delays.is_empty());
    }

    #[test]
    fn access_point_failure_is_reported() {
        let mut link = ScriptedLink::reachable();
        link.fail_access_point = true;
        let mut manager = manager(MemoryStore::new(), link);

        assert!(matches!(
            manager.initialize(),
            Err(DeviceError::AccessPointUnavailable(_))
        ));
        assert_eq!(manager.state(), ConnectionState::Unconfigured);
    }

    #[test]
    fn healthy_link_is_a_no_op() {
        let store = MemoryStore::new().with_record(Namespace::NetworkCredentials, HOME);
        let mut manager = connected(store);

        for _ in 0..5 {
            assert_eq!(next_interval(&mut manager), ConnectivityEvent::Idle);
        }
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.retry().consecutive_failures, 0);
        assert_eq!(manager.link_mut().reconnects, 0);
    }

    #[test]
    fn dropped_link_is_retried_once_per_interval() {
        let store = MemoryStore::new().with_record(Namespace::NetworkCredentials, HOME);
        let mut manager = connected(store);
        manager.link_mut().up = false;

        assert_eq!(manager.tick(), ConnectivityEvent::LinkLost);
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        manager.system_mut().advance(4_999);
        assert_eq!(manager.tick(), ConnectivityEvent::Idle);
        assert_eq!(manager.link_mut().reconnects, 0);

        manager.system_mut().advance(1);
        assert_eq!(manager.tick(), ConnectivityEvent::ReconnectAttempt { attempt: 1 });
        assert_eq!(manager.tick(), ConnectivityEvent::Idle);
        assert_eq!(manager.link_mut().reconnects, 1);

        assert_eq!(
            next_interval(&mut manager),
            ConnectivityEvent::ReconnectAttempt { attempt: 2 }
        );
        assert_eq!(manager.retry().consecutive_failures, 1);
    }

    #[test]
    fn restored_link_resets_retry_state() {
        let store = MemoryStore::new().with_record(Namespace::NetworkCredentials, HOME);
        let mut manager = connected(store);
        manager.link_mut().up = false;
        manager.tick();
        next_interval(&mut manager);
        next_interval(&mut manager);
        next_interval(&mut manager);
        assert_eq!(manager.retry().consecutive_failures, 2);

        manager.link_mut().up = true;
        assert_eq!(manager.tick(), ConnectivityEvent::LinkRestored);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.retry().consecutive_failures, 0);
    }

    #[test]
    fn ten_failed_reconnects_clear_credentials_and_restart() {
        let store = MemoryStore::new().with_record(Namespace::NetworkCredentials, HOME);
        let mut manager = connected(store.clone());
        manager.link_mut().up = false;
        assert_eq!(manager.tick(), ConnectivityEvent::LinkLost);

        for attempt in 1..=10 {
            assert_eq!(
                next_interval(&mut manager),
                ConnectivityEvent::ReconnectAttempt { attempt }
            );
        }
        assert_eq!(manager.system().restarts, 0);
        assert!(stored_credentials(&store).is_some());

        assert_eq!(
            next_interval(&mut manager),
            ConnectivityEvent::Restart(RestartReason::ReconnectExhausted)
        );
        assert_eq!(manager.system().restarts, 1);
        assert_eq!(manager.system().delays.last(), Some(&1_000));
        assert_eq!(manager.state(), ConnectionState::Unconfigured);
        assert_eq!(stored_credentials(&store), None);

        let mut rebooted = self::manager(store, ScriptedLink::reachable());
        assert_eq!(rebooted.state(), ConnectionState::Unconfigured);
        assert_eq!(rebooted.initialize().unwrap(), ConnectOutcome::NotConnected);
        assert_eq!(rebooted.state(), ConnectionState::ApProvisioning);
    }

    #[test]
    fn reconnect_errors_count_as_failures() {
        let store = MemoryStore::new().with_record(Namespace::NetworkCredentials, HOME);
        let mut manager = connected(store);
        manager.link_mut().up = false;
        manager.link_mut().fail_reconnect = true;
        manager.tick();

        assert_eq!(
            next_interval(&mut manager),
            ConnectivityEvent::ReconnectAttempt { attempt: 1 }
        );
        assert_eq!(manager.retry().consecutive_failures, 1);
    }

    #[test]
    fn portal_submission_is_saved_then_restarts() {
        let store = MemoryStore::new();
        let mut manager = manager(store.clone(), ScriptedLink::reachable());
        manager.initialize().unwrap();

        assert_eq!(manager.tick(), ConnectivityEvent::Idle);
        manager
            .portal_mut()
            .pending
            .push_back(ConnectionCredentials::new("garden", "s3cret"));

        assert_eq!(
            manager.tick(),
            ConnectivityEvent::Restart(RestartReason::CredentialsSaved)
        );
        assert_eq!(store.write_count(), 1);
        assert_eq!(
            stored_credentials(&store),
            Some(ConnectionCredentials::new("garden", "s3cret"))
        );
        assert_eq!(manager.portal_mut().acks, vec![true]);
        assert_eq!(manager.system().delays, vec![3_000]);
        assert_eq!(manager.system().restarts, 1);
    }

    #[test]
    fn empty_network_name_is_refused() {
        let store = MemoryStore::new();
        let mut manager = manager(store.clone(), ScriptedLink::reachable());
        manager.initialize().unwrap();
        manager
            .portal_mut()
            .pending
            .push_back(ConnectionCredentials::new("  ", "x"));

        assert_eq!(manager.tick(), ConnectivityEvent::Idle);
        assert_eq!(manager.state(), ConnectionState::ApProvisioning);
        assert_eq!(manager.portal_mut().acks, vec![false]);
        assert_eq!(store.write_count(), 0);
        assert_eq!(manager.system().restarts, 0);
    }

    #[test]
    fn failed_write_keeps_portal_open() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let mut manager = manager(store.clone(), ScriptedLink::reachable());
        manager.initialize().unwrap();

        let result = manager.save_credentials(ConnectionCredentials::new("garden", "pw"));
        assert!(matches!(result, Err(DeviceError::PersistenceFailure { .. })));
        assert_eq!(manager.portal_mut().acks, vec![false]);
        assert_eq!(manager.state(), ConnectionState::ApProvisioning);
        assert_eq!(manager.system().restarts, 0);
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let rendered = format!("{:?}", ConnectionCredentials::new("home", "hunter22"));
        assert!(rendered.contains("home"));
        assert!(!rendered.contains("hunter22"));
    }
}
