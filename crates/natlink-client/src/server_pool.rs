//! Ordered pool of known servers with per-server retry accounting.

use crate::cancel::{bounded, sleep_or_cancel, CancelToken};
use crate::config::ClientOptions;
use crate::endpoint::ServerEndpoint;
use crate::error::{NatsError, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Shared randomness source for shuffling and inbox names.
pub type SharedRng = Arc<Mutex<StdRng>>;

/// Connection bookkeeping for one endpoint.
#[derive(Debug, Clone)]
pub struct ServerConnectionStatus {
    /// The endpoint.
    pub endpoint: ServerEndpoint,
    /// Learned from INFO rather than configured.
    pub implicit: bool,
    /// Time of the last connection attempt.
    pub last_attempt: Option<Instant>,
    /// Whether any attempt ever succeeded.
    pub did_connect: bool,
    /// Consecutive failed attempts.
    pub reconnects: u32,
}

impl ServerConnectionStatus {
    fn new(endpoint: ServerEndpoint, implicit: bool) -> Self {
        Self {
            endpoint,
            implicit,
            last_attempt: None,
            did_connect: false,
            reconnects: 0,
        }
    }
}

#[derive(Debug)]
struct PoolState {
    servers: Vec<ServerConnectionStatus>,
    current: Option<ServerEndpoint>,
}

/// Known servers in connection order.
#[derive(Debug)]
pub struct ServerPool {
    state: Mutex<PoolState>,
    rng: SharedRng,
    no_randomize: bool,
    max_reconnect: u32,
    reconnect_wait: Duration,
}

impl ServerPool {
    /// Builds the pool from the configured servers, shuffled unless `no_randomize`.
    pub fn new(options: &ClientOptions, rng: SharedRng) -> Self {
        let mut endpoints = if options.servers.is_empty() {
            vec![ServerEndpoint::default()]
        } else {
            options.servers.clone()
        };
        if !options.no_randomize {
            endpoints.shuffle(&mut *rng.lock());
        }
        let servers = endpoints
            .into_iter()
            .map(|ep| ServerConnectionStatus::new(ep, false))
            .collect();
        Self {
            state: Mutex::new(PoolState {
                servers,
                current: None,
            }),
            rng,
            no_randomize: options.no_randomize,
            max_reconnect: options.max_reconnect,
            reconnect_wait: options.reconnect_wait(),
        }
    }

    /// The endpoint of the last successful connection.
    pub fn current(&self) -> Option<ServerEndpoint> {
        self.state.lock().current.clone()
    }

    /// Every endpoint still in the pool, in connection order.
    pub fn known_servers(&self) -> Vec<ServerEndpoint> {
        self.state
            .lock()
            .servers
            .iter()
            .map(|s| s.endpoint.clone())
            .collect()
    }

    /// Endpoints learned from the servers.
    pub fn discovered_servers(&self) -> Vec<ServerEndpoint> {
        self.state
            .lock()
            .servers
            .iter()
            .filter(|s| s.implicit)
            .map(|s| s.endpoint.clone())
            .collect()
    }

    /// Copy of the per-server bookkeeping.
    pub fn statuses(&self) -> Vec<ServerConnectionStatus> {
        self.state.lock().servers.clone()
    }

    /// Merges peers advertised in INFO. Returns the endpoints that were new.
    pub fn add_discovered(&self, urls: &[String], secured: bool) -> Vec<ServerEndpoint> {
        let mut fresh: Vec<ServerEndpoint> = Vec::new();
        let mut state = self.state.lock();
        for url in urls {
            let endpoint = match ServerEndpoint::parse(url) {
                Ok(ep) => ep.with_tls(secured),
                Err(e) => {
                    warn!(url = %url, error = %e, "ignoring advertised server");
                    continue;
                }
            };
            let known = state.servers.iter().any(|s| s.endpoint == endpoint);
            if !known && !fresh.contains(&endpoint) {
                fresh.push(endpoint);
            }
        }
        if !self.no_randomize {
            fresh.shuffle(&mut *self.rng.lock());
        }
        state.servers.extend(
            fresh
                .iter()
                .cloned()
                .map(|ep| ServerConnectionStatus::new(ep, true)),
        );
        if !fresh.is_empty() {
            debug!(added = fresh.len(), total = state.servers.len(), "discovered servers");
        }
        fresh
    }

    /// Opens a connection to the next suitable server using `attempt`.
    ///
    /// On the initial attempt candidates are tried in list order. On reconnect the server that was
    /// current moves to the tail (or is dropped once it has failed `max_reconnect` times) and the
    /// new head is tried, repeating until one succeeds or the pool is exhausted.
    pub async fn connect<T, F, Fut>(
        &self,
        initial: bool,
        token: &CancelToken,
        mut attempt: F,
    ) -> Result<(T, ServerEndpoint)>
    where
        F: FnMut(ServerEndpoint) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if initial {
            let candidates = self.known_servers();
            for (i, endpoint) in candidates.iter().enumerate() {
                if let Some(conn) = self.try_one(endpoint, token, &mut attempt).await? {
                    return Ok((conn, endpoint.clone()));
                }
                if i + 1 < candidates.len() && sleep_or_cancel(self.reconnect_wait, token).await {
                    return Err(NatsError::Cancelled);
                }
            }
            return Err(NatsError::NoServers);
        }

        let mut cursor = self.current();
        loop {
            let next = {
                let mut state = self.state.lock();
                if let Some(tried) = cursor.take() {
                    self.rotate(&mut state, &tried);
                }
                state.servers.first().map(|s| s.endpoint.clone())
            };
            let Some(endpoint) = next else {
                return Err(NatsError::NoServers);
            };
            if let Some(conn) = self.try_one(&endpoint, token, &mut attempt).await? {
                return Ok((conn, endpoint));
            }
            if sleep_or_cancel(self.reconnect_wait, token).await {
                return Err(NatsError::Cancelled);
            }
            cursor = Some(endpoint);
        }
    }

    async fn try_one<T, F, Fut>(
        &self,
        endpoint: &ServerEndpoint,
        token: &CancelToken,
        attempt: &mut F,
    ) -> Result<Option<T>>
    where
        F: FnMut(ServerEndpoint) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.update(endpoint, |s| s.last_attempt = Some(Instant::now()));
        match bounded(attempt(endpoint.clone()), None, token, "connect").await? {
            Ok(conn) => {
                self.update(endpoint, |s| {
                    s.reconnects = 0;
                    s.did_connect = true;
                });
                self.state.lock().current = Some(endpoint.clone());
                Ok(Some(conn))
            }
            Err(e) => {
                warn!(server = %endpoint, error = %e, "connection attempt failed");
                self.update(endpoint, |s| s.reconnects += 1);
                Ok(None)
            }
        }
    }

    fn rotate(&self, state: &mut PoolState, tried: &ServerEndpoint) {
        let Some(pos) = state.servers.iter().position(|s| &s.endpoint == tried) else {
            return;
        };
        let status = state.servers.remove(pos);
        if self.max_reconnect > 0 && status.reconnects < self.max_reconnect {
            state.servers.push(status);
        } else {
            debug!(server = %status.endpoint, "server removed from pool");
        }
    }

    fn update(&self, endpoint: &ServerEndpoint, f: impl FnOnce(&mut ServerConnectionStatus)) {
        let mut state = self.state.lock();
        if let Some(status) = state.servers.iter_mut().find(|s| &s.endpoint == endpoint) {
            f(status);
        }
    }
}
