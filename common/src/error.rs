use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("link to `{network}` not established after {attempts} polls")]
    LinkTimeout { network: String, attempts: u32 },

    #[error("network `{network}` rejected the join request: {reason}")]
    CredentialRejected { network: String, reason: String },

    #[error("wall clock has not been synchronized yet")]
    TimeNotSynced,

    #[error("sensor returned an unusable {quantity} reading")]
    SensorReadInvalid { quantity: &'static str },

    #[error("persistent store failure in `{namespace}`: {reason}")]
    PersistenceFailure {
        namespace: &'static str,
        reason: String,
    },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("access point unavailable: {0}")]
    AccessPointUnavailable(String),

    #[error("light output write failed: {0}")]
    OutputFailure(String),
}

impl DeviceError {
    pub fn persistence(namespace: &'static str, reason: impl ToString) -> Self {
        Self::PersistenceFailure {
            namespace,
            reason: reason.to_string(),
        }
    }
}
