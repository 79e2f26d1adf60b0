//! Error types for forgestr-relay

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
