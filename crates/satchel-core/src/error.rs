// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The error taxonomy shared across the workspace.
//!
//! Propagation policy: network/session failures are retried by the session
//! engine up to the reconnect cap and then surface as a state transition, not
//! an error; dispatch failures never escape the dispatcher; webhook failures
//! are logged and swallowed.

use thiserror::Error;

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, SatchelError>;

/// The primary error type used across all Satchel crates.
#[derive(Debug, Error)]
pub enum SatchelError {
    /// Operation requires an authenticated session and there is none.
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    /// The remote endpoint rejected our credentials; a fresh login is needed.
    #[error("session invalidated by remote: {0}")]
    SessionInvalidated(String),

    /// The remote endpoint rejected a send. Never auto-retried.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    /// Malformed remote payload; treated as a transient poll failure.
    #[error("decode error: {0}")]
    Decode(String),

    /// A single extension unit failed to load. Other units are unaffected.
    #[error("plugin '{plugin}' failed to load: {reason}")]
    PluginLoad { plugin: String, reason: String },

    /// A command handler failed. Caught at the dispatch boundary and turned
    /// into a visible error reply.
    #[error("command '{command}' failed: {reason}")]
    CommandExecution { command: String, reason: String },

    /// An outbound webhook call failed. Logged, never retried.
    #[error("webhook delivery failed: {0}")]
    WebhookDelivery(String),

    /// Storage backend errors (connection, query, serialization).
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Configuration errors (invalid TOML, bad values).
    #[error("configuration error: {0}")]
    Config(String),

    /// Network-level failures talking to the remote endpoint or a webhook.
    #[error("network error: {message}")]
    Network {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A bot-API capability the remote self-chat cannot express.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Lookup by id found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller passed an argument that fails validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SatchelError {
    /// Wrap an arbitrary error as a storage failure.
    pub fn storage<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SatchelError::Storage {
            source: Box::new(source),
        }
    }

    /// Wrap an arbitrary error as a network failure with context.
    pub fn network<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SatchelError::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = SatchelError::CommandExecution {
            command: "echo".to_string(),
            reason: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "command 'echo' failed: boom");
    }

    #[test]
    fn network_wrapper_keeps_message() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let err = SatchelError::network("poll request", io);
        assert!(err.to_string().contains("poll request"));
    }
}
