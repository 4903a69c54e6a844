use thiserror::Error;

use mqtt_relay_middleware::TransportError;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("malformed payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("path not found: {0}")]
    PathNotFound(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("subscribe failed: {0}")]
    Subscribe(TransportError),
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(TransportError),
    #[error("connection error: {0}")]
    Connection(TransportError),
    #[error("publish dropped: broker not connected")]
    PublishWhileDisconnected,
    #[error("publish failed: {0}")]
    Publish(TransportError),
    #[error("unknown comparison: {0}")]
    UnknownComparison(String),
    #[error("relay stopped")]
    Closed,
}
