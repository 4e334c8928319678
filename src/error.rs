//! Top-level error type
//!
//! Each layer has its own `thiserror` enum; [`AgentError`] wraps them so the
//! agent loop, the direct client and the binary can use `?` across layers.

use crate::backoff::BackoffError;
use crate::config::ConfigError;
use crate::dispatcher::SubmitError;
use crate::registry::RegistryError;
use crate::supervisor::ConnectError;
use crate::transport::{EngineError, TransportError};
use crate::waiter::WaitError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Command submission failed: {0}")]
    Submit(#[from] SubmitError),

    #[error("Subscription registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Wait failed: {0}")]
    Wait(#[from] WaitError),

    #[error("Backoff error: {0}")]
    Backoff(#[from] BackoffError),

    #[error("Outgoing publish table full (capacity {capacity})")]
    OutgoingTableFull { capacity: usize },

    #[error("Subscription to '{filter}' rejected after {attempts} attempts")]
    SubscribeRejected { filter: String, attempts: u32 },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl AgentError {
    /// Create invalid input error
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Whether the error came from running out of reconnection attempts
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(
            self,
            AgentError::Connect(_) | AgentError::Backoff(BackoffError::Exhausted { .. })
        )
    }
}

/// Result type for Agent operations
pub type AgentResult<T> = Result<T, AgentError>;
