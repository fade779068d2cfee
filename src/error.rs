use std::sync::Arc;

use thiserror::Error;

/// Represents a result type for operations in this crate.
///
/// Assignment never returns this type: it always produces a variant, falling back to control.
/// `Result` is used for configuration loading, collaborator I/O and the client facade.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the caller.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Configuration or input is malformed (e.g., an experiment without treatment variants).
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The backend rejected our credentials.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// Backend responded with a non-success status code.
    #[error("backend responded with status {status}")]
    Server {
        /// HTTP status code.
        status: u16,
    },

    /// Network error.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// Failed to (de)serialize a payload.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Requested operation is switched off in [`EngineConfig`](crate::EngineConfig).
    #[error("{0} is disabled by configuration")]
    FeatureDisabled(&'static str),

    /// Statistics were requested for an experiment without usable results.
    #[error(transparent)]
    InsufficientData(#[from] crate::statistics::InsufficientData),
}

impl Error {
    /// Whether retrying the request may succeed.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Server { status } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        if let Some(status) = value.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Error::Unauthorized;
            }
            return Error::Server {
                status: status.as_u16(),
            };
        }
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(value.to_string())
    }
}

/// Failure while evaluating experiment targeting. Never leaves the crate: the targeting
/// evaluator logs it and applies [`TargetingErrorPolicy`](crate::targeting::TargetingErrorPolicy).
#[derive(Error, Debug, Clone, PartialEq)]
pub(crate) enum TargetingError {
    #[error("user id {0:?} does not carry a numeric suffix")]
    NonNumericUserId(String),
    #[error("attribute {attribute:?} cannot be compared with operator {operator}")]
    IncomparableAttribute {
        attribute: String,
        operator: &'static str,
    },
}

/// Failure while computing an assignment. Never leaves the crate: the engine falls back to the
/// control variant.
#[derive(Error, Debug, Clone, PartialEq)]
pub(crate) enum AssignmentError {
    #[error("hash digest is too short to derive a bucket")]
    ShortDigest,
    #[error("failed to serialize hashing input: {0}")]
    HashInput(String),
}
