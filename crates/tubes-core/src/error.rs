use thiserror::Error;

/// Failure to establish the secure-shell transport for an endpoint.
///
/// Cloneable so a single in-flight connect can report the same failure to
/// every caller that joined it.
#[derive(Debug, Clone, Error)]
#[error("SSH connection to {endpoint} failed: {reason}")]
pub struct ConnectionError {
    pub endpoint: String,
    pub reason: String,
    /// Whether another attempt could plausibly succeed (network errors yes,
    /// authentication or host-key rejection no)
    pub retryable: bool,
}

impl ConnectionError {
    pub fn new(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn fatal(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Errors surfaced by endpoints and their services
#[derive(Debug, Error)]
pub enum TubesError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("{service} is disabled")]
    ServiceDisabled { service: String },

    #[error("Listener error on {addr}: {source}")]
    Listener {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to dial {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TubesError {
    pub fn disabled(service: impl Into<String>) -> Self {
        Self::ServiceDisabled {
            service: service.into(),
        }
    }

    pub fn listener(addr: impl ToString, source: std::io::Error) -> Self {
        Self::Listener {
            addr: addr.to_string(),
            source,
        }
    }

    pub fn dial(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::Dial {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// True for the "service is switched off" outcome, which callers treat
    /// as a normal stop rather than a failure
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::ServiceDisabled { .. })
    }
}

pub type Result<T, E = TubesError> = std::result::Result<T, E>;

