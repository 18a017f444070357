//! Crate-wide error types for local faults (config, persistence, channels).
//!
//! Distinct from [`crate::upstream::ErrorKind`], which classifies the
//! outcome of a single upstream attempt rather than a fault in the gateway
//! itself.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("persistence I/O error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("bind error: {0}")]
    Bind(std::io::Error),
}
