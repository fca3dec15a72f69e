//! Crate-wide error type.

use thiserror::Error;

/// Errors produced by the realtime client, REST boundary and configuration layer.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The streaming transport failed to open or broke mid-session.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connecting took longer than the configured timeout.
    #[error("connection timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// An operation needed an authenticated identity but none is set.
    #[error("no authenticated user")]
    NotAuthenticated,

    /// No access token could be found in the token store.
    #[error("access token missing")]
    MissingToken,

    /// The access token is not a decodable JWT.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// An inbound frame did not match the `{type, data}` envelope.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The REST API rejected the request payload (HTTP 400).
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// The REST API could not find the room or user (HTTP 404).
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Any other non-2xx REST response.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// The HTTP request could not be sent or its body could not be read.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A logout or shutdown abandoned the connection attempt mid-dial.
    #[error("connection attempt cancelled")]
    ConnectCancelled,

    /// Reconnect attempts were exhausted.
    #[error("realtime connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },
}

impl ClientError {
    /// HTTP status carried by REST failures, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::InvalidInput { .. } => Some(400),
            ClientError::NotFound { .. } => Some(404),
            ClientError::Http { status, .. } => Some(*status),
            ClientError::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Crate result type.
pub type Result<T> = std::result::Result<T, ClientError>;
