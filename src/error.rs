use serde::{Serialize, Serializer};
use thiserror::Error;

/// Failures surfaced by the connection workflow. Every variant renders as a
/// message that can be shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("Gmail authorization window was closed before access was granted")]
    UserCancelled,

    #[error("Gmail authorization timed out; please try again")]
    Timeout,

    #[error("OAuth error: {0}")]
    ProviderError(String),

    #[error("Please log in first")]
    Unauthenticated,

    #[error("Gmail token exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("Gmail sync failed: {0}")]
    SyncFailed(String),

    #[error("a Gmail connection attempt is already in progress")]
    AlreadyInProgress,
}

impl ConnectError {
    /// Maps a backend failure raised while obtaining or redeeming an
    /// authorization artifact.
    pub fn from_exchange(error: ApiError) -> Self {
        match error {
            ApiError::Unauthenticated => Self::Unauthenticated,
            ApiError::Transport { message, .. } => Self::NetworkError(message),
            ApiError::Status { message, .. } | ApiError::Decode { message, .. } => {
                Self::ExchangeFailed(message)
            }
        }
    }

    /// Maps a failure of the ingestion fetch call. Every sync failure is
    /// `SyncFailed`, including a missing session, so it is never mistaken for
    /// a failed connection.
    pub fn from_sync(error: ApiError) -> Self {
        match error {
            ApiError::Unauthenticated => Self::SyncFailed(Self::Unauthenticated.to_string()),
            other => Self::SyncFailed(other.to_string()),
        }
    }
}

impl From<ApiError> for ConnectError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Unauthenticated => Self::Unauthenticated,
            other => Self::NetworkError(other.to_string()),
        }
    }
}

impl Serialize for ConnectError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Failures at the HTTP boundary, before they are classified for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("no authenticated session")]
    Unauthenticated,

    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} returned {status}: {message}")]
    Status {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("decode {endpoint} response: {message}")]
    Decode { endpoint: String, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field} '{value}': {reason}")]
    Invalid {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("malformed id token: {0}")]
    Malformed(String),

    #[error("id token has expired")]
    Expired,
}
