use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error code the server uses for an expired session.
pub const SESSION_EXPIRED_CODE: i64 = 408;

/// A structured error reported by the server, either for a whole reply, for
/// one function result inside a batch, or as an out-of-band event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

impl ServerError {
    pub fn new(code: i64, msg: impl Into<String>) -> Self {
        ServerError {
            code,
            msg: msg.into(),
        }
    }

    pub fn is_session_expired(&self) -> bool {
        self.code == SESSION_EXPIRED_CODE
    }

    /// The server reports commands it has already forgotten about with a
    /// "does not exist" message. Those are treated as stopped.
    pub fn is_missing_command(&self) -> bool {
        self.msg.contains("does not exist")
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error {}: {}", self.code, self.msg)
    }
}

impl std::error::Error for ServerError {}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("could not encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Application(ServerError),
    #[error("command fetch failed: {0}")]
    CommandFetch(ServerError),
    #[error("a command needs at least one id")]
    EmptyCommand,
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid server url: {0}")]
    Url(#[from] url::ParseError),
}
