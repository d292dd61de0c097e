use thiserror::Error;

/// Failure taxonomy for every upstream interaction. The variant decides the
/// recovery path: caches fall back on transient variants, the REST layer
/// retries `AuthExpired` exactly once, order rejections surface untouched.
///
/// `Clone` lets a single refresh result fan out to every caller waiting on
/// the same in-flight token request.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Access token expired")]
    AuthExpired,

    #[error("Authentication failed: {reason}")]
    AuthFailure { reason: String },

    #[error("Upstream unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Invalid response data: {reason}")]
    DataInvalid { reason: String },

    #[error("Order rejected: {reason}")]
    OrderRejected { reason: String },

    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },
}

impl BrokerError {
    /// Transient failures degrade to last-known-good state; terminal ones
    /// are surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Unavailable { .. }
                | BrokerError::DataInvalid { .. }
                | BrokerError::ConnectionLost { .. }
        )
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        BrokerError::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        BrokerError::DataInvalid {
            reason: reason.into(),
        }
    }
}

impl From<reqwest_middleware::Error> for BrokerError {
    fn from(err: reqwest_middleware::Error) -> Self {
        BrokerError::Unavailable {
            reason: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        BrokerError::Unavailable {
            reason: err.to_string(),
        }
    }
}
