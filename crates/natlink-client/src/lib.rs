#![warn(missing_docs)]

//! natlink client: subject-based publish/subscribe over a reconnecting connection engine
//!
//! A [`Connection`] owns one worker task that connects to a server from its pool, performs the
//! INFO/CONNECT/PING handshake (upgrading to TLS when asked), and then runs the steady-state loop
//! that parses inbound traffic, flushes queued protocol lines and keeps the session alive with
//! PINGs. Faults unwind to a reconnect loop that backs off and rotates through known servers,
//! restoring every subscription on the new session.
//!
//! Subscriptions are either pulled with [`Subscription::next_message`] or driven by a handler on
//! a shared dispatcher task. Request/reply rides on one wildcard inbox subscription per
//! connection, with a watchdog expiring requests that outlive their timeout.

pub mod cancel;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod keepalive;
pub mod message;
pub mod metrics;
pub mod parser;
pub mod protocol;
pub mod request;
pub mod server_pool;
pub mod subject;
pub mod subscription;
pub mod tls;
pub mod transport;

mod sub_pool;
mod writer;

pub use cancel::{bounded, new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use config::{ClientOptions, EventHooks, TlsOptions};
pub use connection::{Connection, LifeCycle};
pub use endpoint::{AuthMode, ServerEndpoint, DEFAULT_PORT};
pub use engine::ConnState;
pub use error::{NatsError, Result};
pub use keepalive::PingStats;
pub use message::{InboundMessage, OutboundMessage};
pub use metrics::{ConnectionStats, StatsSnapshot};
pub use parser::{ParsedEvent, Parser};
pub use protocol::ServerInfo;
pub use request::INBOX_PREFIX;
pub use server_pool::{ServerConnectionStatus, ServerPool};
pub use subscription::{
    AsyncMessageHandler, HandlerError, HandlerResult, MessageHandler, PendingLimits, Subscription,
    SubscriptionStats,
};
pub use tls::CertValidator;
pub use transport::{Connector, TcpConnector, TcpConnectorConfig};
