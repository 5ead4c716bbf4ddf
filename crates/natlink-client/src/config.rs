//! Client configuration and event hooks.

use crate::endpoint::ServerEndpoint;
use crate::engine::ConnState;
use crate::error::{NatsError, Result};
use crate::tls::CertValidator;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Timeout applied to each read while waiting for INFO, +OK and PONG during the handshake.
pub const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_millis(5000);

/// Smallest ping interval the engine will schedule.
pub const MIN_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Connection options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Servers to connect to. Empty means `127.0.0.1:4222`.
    pub servers: Vec<ServerEndpoint>,
    /// Keep the configured order instead of shuffling (default: false).
    pub no_randomize: bool,
    /// Client name sent in CONNECT.
    pub name: Option<String>,
    /// Ask the server to acknowledge every operation with +OK (default: false).
    pub verbose: bool,
    /// Ask the server for strict subject checking (default: false).
    pub pedantic: bool,
    /// Consecutive failed sessions before the connection closes, also the per-server
    /// failure bound in the rotating reconnect view (default: 60).
    pub max_reconnect: u32,
    /// Backoff between attempts in milliseconds (default: 2000).
    pub reconnect_wait_ms: u64,
    /// TCP connect timeout in milliseconds (default: 2000).
    pub connect_timeout_ms: u64,
    /// Ping interval in milliseconds, 0 disables pings (default: 120000).
    pub ping_interval_ms: u64,
    /// Unanswered pings tolerated before the connection is stale (default: 2).
    pub max_pings_out: u32,
    /// Default per-subscription pending message limit, 0 for unlimited (default: 65536).
    pub pending_msgs_limit: usize,
    /// Default per-subscription pending byte limit, 0 for unlimited (default: 64 MiB).
    pub pending_bytes_limit: usize,
    /// Request watchdog tick in milliseconds (default: 1000).
    pub request_watchdog_interval_ms: u64,
    /// TLS material for `tls://` endpoints.
    pub tls: TlsOptions,
    /// Callbacks for background events.
    #[serde(skip)]
    pub hooks: EventHooks,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            no_randomize: false,
            name: None,
            verbose: false,
            pedantic: false,
            max_reconnect: 60,
            reconnect_wait_ms: 2000,
            connect_timeout_ms: 2000,
            ping_interval_ms: 120_000,
            max_pings_out: 2,
            pending_msgs_limit: 65_536,
            pending_bytes_limit: 65_536 * 1024,
            request_watchdog_interval_ms: 1000,
            tls: TlsOptions::default(),
            hooks: EventHooks::default(),
        }
    }
}

impl ClientOptions {
    /// Options for a single server given as a URL.
    pub fn with_server(url: &str) -> Result<Self> {
        Ok(Self {
            servers: vec![ServerEndpoint::parse(url)?],
            ..Self::default()
        })
    }

    /// Loads options from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| NatsError::Config(format!("{}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let options: ClientOptions = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| NatsError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| NatsError::Config(e.to_string()))?
            }
            _ => {
                return Err(NatsError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        options.validate()?;
        Ok(options)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(NatsError::Config("connect_timeout_ms must be > 0".into()));
        }
        if self.request_watchdog_interval_ms == 0 {
            return Err(NatsError::Config(
                "request_watchdog_interval_ms must be > 0".into(),
            ));
        }
        if let Some(name) = &self.name {
            if name.contains(['\r', '\n']) {
                return Err(NatsError::Config("name must be a single line".into()));
            }
        }
        Ok(())
    }

    /// Backoff between attempts.
    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    /// TCP connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Effective ping interval, floored at [`MIN_PING_INTERVAL`]; `None` when pings are disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        if self.ping_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.ping_interval_ms).max(MIN_PING_INTERVAL))
        }
    }

    /// Request watchdog tick.
    pub fn request_watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.request_watchdog_interval_ms)
    }
}

/// TLS material used when upgrading `tls://` endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// PEM-encoded CA bundle trusted for server certificates.
    pub ca_cert_pem: Option<String>,
    /// Path to a PEM CA bundle, read when `ca_cert_pem` is unset.
    pub ca_cert_file: Option<PathBuf>,
    /// PEM-encoded client certificate chain for mutual TLS.
    pub client_cert_pem: Option<String>,
    /// PEM-encoded client private key for mutual TLS.
    pub client_key_pem: Option<String>,
    /// Callback consulted for every server certificate.
    #[serde(skip)]
    pub validator: Option<CertValidator>,
}

impl TlsOptions {
    /// Resolves the CA bundle from inline PEM or file.
    pub fn ca_pem(&self) -> Result<Option<Vec<u8>>> {
        if let Some(pem) = &self.ca_cert_pem {
            return Ok(Some(pem.as_bytes().to_vec()));
        }
        match &self.ca_cert_file {
            Some(path) => std::fs::read(path)
                .map(Some)
                .map_err(|e| NatsError::Config(format!("{}: {}", path.display(), e))),
            None => Ok(None),
        }
    }
}

/// Called on every connection state transition.
pub type StateChangedFn = Arc<dyn Fn(ConnState) + Send + Sync>;
/// Called for faults detected on background tasks, with the state at the time.
pub type AsyncErrorFn = Arc<dyn Fn(&NatsError, ConnState) + Send + Sync>;
/// Called with newly discovered servers.
pub type ServerDiscoveredFn = Arc<dyn Fn(&[ServerEndpoint]) + Send + Sync>;
/// Called with `(sid, subject)` when a subscription enters the slow-consumer state.
pub type SlowConsumerFn = Arc<dyn Fn(u64, &str) + Send + Sync>;

/// Optional user callbacks. Hooks run on engine tasks and must not block.
#[derive(Clone, Default)]
pub struct EventHooks {
    state_changed: Option<StateChangedFn>,
    async_error: Option<AsyncErrorFn>,
    server_discovered: Option<ServerDiscoveredFn>,
    slow_consumer: Option<SlowConsumerFn>,
}

impl EventHooks {
    /// Sets the state-change hook.
    pub fn on_state_changed(mut self, f: impl Fn(ConnState) + Send + Sync + 'static) -> Self {
        self.state_changed = Some(Arc::new(f));
        self
    }

    /// Sets the async-error hook.
    pub fn on_async_error(
        mut self,
        f: impl Fn(&NatsError, ConnState) + Send + Sync + 'static,
    ) -> Self {
        self.async_error = Some(Arc::new(f));
        self
    }

    /// Sets the server-discovered hook.
    pub fn on_server_discovered(
        mut self,
        f: impl Fn(&[ServerEndpoint]) + Send + Sync + 'static,
    ) -> Self {
        self.server_discovered = Some(Arc::new(f));
        self
    }

    /// Sets the slow-consumer hook.
    pub fn on_slow_consumer(mut self, f: impl Fn(u64, &str) + Send + Sync + 'static) -> Self {
        self.slow_consumer = Some(Arc::new(f));
        self
    }

    pub(crate) fn state_changed(&self, state: ConnState) {
        if let Some(f) = &self.state_changed {
            f(state);
        }
    }

    pub(crate) fn async_error(&self, error: &NatsError, state: ConnState) {
        if let Some(f) = &self.async_error {
            f(error, state);
        }
    }

    pub(crate) fn server_discovered(&self, servers: &[ServerEndpoint]) {
        if let Some(f) = &self.server_discovered {
            f(servers);
        }
    }

    pub(crate) fn slow_consumer(&self, sid: u64, subject: &str) {
        if let Some(f) = &self.slow_consumer {
            f(sid, subject);
        }
    }
}

impl fmt::Debug for EventHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHooks")
            .field("state_changed", &self.state_changed.is_some())
            .field("async_error", &self.async_error.is_some())
            .field("server_discovered", &self.server_discovered.is_some())
            .field("slow_consumer", &self.slow_consumer.is_some())
            .finish()
    }
}
