//! Error types for the natlink client.

use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the connection engine, subscriptions and request/reply.
///
/// Cloneable so one start failure can be handed to every waiting publisher.
#[derive(Debug, Clone, Error)]
pub enum NatsError {
    /// A connection-level failure: handshake rejected, transport dropped, server refused us.
    #[error("connection error: {reason}")]
    Connection {
        /// Human readable cause.
        reason: String,
    },

    /// No endpoint in the pool accepted a connection.
    #[error("no servers available for connection")]
    NoServers,

    /// The endpoint asked for TLS but the server does not offer it.
    #[error("secure connection wanted but server {server} does not offer TLS")]
    SecureConnWanted {
        /// Endpoint that was being connected.
        server: String,
    },

    /// The server requires TLS but the endpoint is plain.
    #[error("secure connection required by server {server}")]
    SecureConnRequired {
        /// Endpoint that was being connected.
        server: String,
    },

    /// Too many PINGs went unanswered, or the server reported a stale connection.
    #[error("stale connection")]
    StaleConnection,

    /// Malformed bytes or an operation unexpected in the current stage.
    #[error("protocol error in state {state}: {context}")]
    Protocol {
        /// Parser state or handshake stage the fault was detected in.
        state: String,
        /// Excerpt of the offending input or a description.
        context: String,
    },

    /// `-ERR` text sent by the server.
    #[error("server error: {0}")]
    Server(String),

    /// A bounded wait elapsed.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Operation that was waiting.
        operation: String,
        /// The bound that elapsed.
        timeout_ms: u64,
    },

    /// The caller's cancel token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The subscription has been invalidated.
    #[error("bad subscription")]
    BadSubscription,

    /// Payload larger than the server-advertised maximum.
    #[error("payload too large: {size} bytes (max {max_payload})")]
    MaxPayload {
        /// Size of the rejected payload.
        size: usize,
        /// Limit advertised in INFO.
        max_payload: u64,
    },

    /// The connection reached its terminal closed state.
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport is not attached.
    #[error("not connected")]
    NotConnected,

    /// Subject or queue name fails validation.
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),

    /// Argument outside its accepted range or wrong for the subscription mode.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// TLS setup or handshake failed.
    #[error("TLS error: {reason}")]
    Tls {
        /// Cause reported by rustls or the PEM loader.
        reason: String,
    },

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// JSON encoding of CONNECT or decoding of INFO failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying socket error.
    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl NatsError {
    /// Builds a [`NatsError::Connection`] from any displayable cause.
    pub fn connection(reason: impl Into<String>) -> Self {
        NatsError::Connection {
            reason: reason.into(),
        }
    }

    /// Builds a [`NatsError::Protocol`].
    pub fn protocol(state: impl Into<String>, context: impl Into<String>) -> Self {
        NatsError::Protocol {
            state: state.into(),
            context: context.into(),
        }
    }

    /// Builds a [`NatsError::Timeout`] for `operation` bounded by `timeout_ms`.
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        NatsError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Returns true when retrying against another server may succeed.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            NatsError::Connection { .. }
                | NatsError::NoServers
                | NatsError::StaleConnection
                | NatsError::Protocol { .. }
                | NatsError::Server(_)
                | NatsError::Io(_)
        )
    }
}

impl From<std::io::Error> for NatsError {
    fn from(e: std::io::Error) -> Self {
        NatsError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for NatsError {
    fn from(e: serde_json::Error) -> Self {
        NatsError::Serialization(e.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, NatsError>;
