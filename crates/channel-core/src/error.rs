use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ChannelState;

/// Broad error category used by consumers to decide how to react.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelErrorCategory {
    /// Invalid construction-time configuration.
    Config,
    /// The transport reported an error or an unexpected close.
    ConnectionFailed,
    /// A send was attempted while the channel was not open.
    NotConnected,
    /// An inbound frame could not be decoded.
    MalformedMessage,
    /// Automatic retries reached the configured ceiling.
    RetryExhausted,
    /// Invariant break inside the channel.
    Internal,
}

/// Stable channel error payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChannelError {
    /// High-level error category.
    pub category: ChannelErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ChannelError {
    /// Construct a new channel error.
    pub fn new(
        category: ChannelErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_config(field: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ChannelErrorCategory::Config,
            "invalid_config",
            format!("invalid {field}: {reason}"),
        )
    }

    pub fn not_connected(current: ChannelState) -> Self {
        Self::new(
            ChannelErrorCategory::NotConnected,
            "not_connected",
            format!("cannot send while channel is {current}"),
        )
    }

    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ChannelErrorCategory::ConnectionFailed,
            "connection_failed",
            reason,
        )
    }

    pub fn malformed_message(reason: impl Into<String>) -> Self {
        Self::new(
            ChannelErrorCategory::MalformedMessage,
            "malformed_message",
            reason,
        )
    }

    pub fn retry_exhausted(attempts: u32) -> Self {
        Self::new(
            ChannelErrorCategory::RetryExhausted,
            "retry_exhausted",
            format!("gave up after {attempts} failed connection attempts"),
        )
    }

    pub fn encode_failed(reason: impl Into<String>) -> Self {
        Self::new(ChannelErrorCategory::Internal, "encode_failed", reason)
    }
}
