use thiserror::Error;

use crate::types::Protocol;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Invalid stream locator {locator}: {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("Protocol mismatch for {key}: state is {state}, engine is {engine}")]
    ProtocolMismatch {
        key: String,
        state: Protocol,
        engine: Protocol,
    },

    #[error("A media sink is required to load {0}")]
    SinkRequired(String),

    #[error("Adaptive streaming is not supported by this sink")]
    Unsupported,

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error {status} for {url}")]
    Http { status: reqwest::StatusCode, url: String },

    #[error("Playlist error: {0}")]
    Playlist(String),

    #[error("Peer session error: {0}")]
    Peer(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Check HTTP response status before processing body.
pub fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, StreamError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(StreamError::Http {
            status,
            url: resp.url().to_string(),
        });
    }
    Ok(resp)
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<url::ParseError> for StreamError {
    fn from(err: url::ParseError) -> Self {
        Self::Playlist(format!("invalid URI: {err}"))
    }
}

impl From<webrtc::Error> for StreamError {
    fn from(err: webrtc::Error) -> Self {
        Self::Peer(err.to_string())
    }
}
