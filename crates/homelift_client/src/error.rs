//! Error types shared by the API client, the session store and the notification channel.

use reqwest::StatusCode;

/// Config load/save error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid URL `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("HTTP client setup failed: {0}")]
    Client(String),
}

/// Persisted session read/write error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt session data: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Network-level failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::with_source(e.to_string(), e)
    }
}

/// Why the out-of-band credential refresh failed.
///
/// Cloneable so that every call waiting on the same refresh receives the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh request failed: {0}")]
    Transport(String),
    #[error("refresh rejected with status {status}")]
    Rejected { status: u16 },
    #[error("refresh response carried no access credential")]
    MissingCredential,
    #[error("could not persist refreshed credential: {0}")]
    Session(String),
}

/// Error returned by [`ApiClient::request`](crate::client::ApiClient::request).
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("request failed with status {status}")]
    Status { status: StatusCode, body: String },
    #[error("request still unauthorized after credential refresh (status {status})")]
    Unauthenticated { status: StatusCode },
    #[error("session expired: {0}")]
    Refresh(#[from] RefreshError),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("session store error: {0}")]
    Session(#[from] SessionError),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("invalid request URL `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

impl RequestError {
    /// True when the session was torn down while serving this call.
    pub fn is_terminal_auth(&self) -> bool {
        matches!(
            self,
            RequestError::Unauthenticated { .. } | RequestError::Refresh(_)
        )
    }

    /// HTTP status carried by the error, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RequestError::Status { status, .. } | RequestError::Unauthenticated { status } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Notification channel connection failure. Handled internally by the reconnect loop.
#[derive(Debug, thiserror::Error)]
#[error("connection failed: {0}")]
pub struct ConnectError(pub String);

impl From<tokio_tungstenite::tungstenite::Error> for ConnectError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ConnectError(e.to_string())
    }
}
