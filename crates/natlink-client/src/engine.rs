//! The connection worker: connect, handshake, steady loop, reconnect.
//!
//! One worker task per connection owns the read half of the session and drives the parser. The
//! write half lives in the [`ProtocolWriter`] so application tasks can publish concurrently.
//! Every fault unwinds to the outer retry loop, which backs off and asks the server pool for the
//! next candidate until the connection is stopped or runs out of attempts.

use crate::cancel::{bounded, sleep_or_cancel, CancelToken};
use crate::config::{ClientOptions, HANDSHAKE_READ_TIMEOUT};
use crate::endpoint::ServerEndpoint;
use crate::error::{NatsError, Result};
use crate::keepalive::{PingAction, PingTracker};
use crate::metrics::ConnectionStats;
use crate::parser::{ParsedEvent, Parser};
use crate::protocol::{ConnectInfo, ServerInfo, PING, PONG};
use crate::server_pool::{ServerPool, SharedRng};
use crate::sub_pool::SubscriptionPool;
use crate::transport::{Connector, Transport, TransportReader};
use crate::writer::{LinkState, ProtocolWriter};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnState {
    /// No session. Initial state and the state between sessions.
    Disconnected = 0,
    /// First connection attempt in progress.
    Connecting = 1,
    /// Logically connected.
    Connected = 2,
    /// A later connection attempt in progress.
    Reconnecting = 3,
    /// Terminal; the connection never reconnects.
    Closed = 4,
}

impl From<u8> for ConnState {
    fn from(v: u8) -> Self {
        match v {
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            3 => ConnState::Reconnecting,
            4 => ConnState::Closed,
            _ => ConnState::Disconnected,
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Disconnected => write!(f, "Disconnected"),
            ConnState::Connecting => write!(f, "Connecting"),
            ConnState::Connected => write!(f, "Connected"),
            ConnState::Reconnecting => write!(f, "Reconnecting"),
            ConnState::Closed => write!(f, "Closed"),
        }
    }
}

/// How a steady-state `-ERR` is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerErrorKind {
    Stale,
    Authorization,
    Permissions,
    Other,
}

fn classify_server_error(text: &str) -> ServerErrorKind {
    let lower = text.trim().to_ascii_lowercase();
    if lower.contains("stale connection") {
        ServerErrorKind::Stale
    } else if lower.contains("authorization violation") || lower.contains("authorization timeout") {
        ServerErrorKind::Authorization
    } else if lower.starts_with("permissions violation") {
        ServerErrorKind::Permissions
    } else {
        ServerErrorKind::Other
    }
}

/// State shared between the worker task and the [`crate::Connection`] facade.
pub(crate) struct ConnectionEngine {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    pool: ServerPool,
    writer: Arc<ProtocolWriter>,
    subs: Arc<SubscriptionPool>,
    stats: Arc<ConnectionStats>,
    pings: PingTracker,
    state: AtomicU8,
    ever_connected: AtomicBool,
    start_failure: Mutex<Option<NatsError>>,
    info: Mutex<Option<ServerInfo>>,
}

impl ConnectionEngine {
    pub(crate) fn new(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        rng: SharedRng,
    ) -> Arc<Self> {
        let stats = Arc::new(ConnectionStats::new());
        let writer = Arc::new(ProtocolWriter::new(stats.clone()));
        let subs = SubscriptionPool::new(writer.clone(), &options);
        let pool = ServerPool::new(&options, rng);
        let pings = PingTracker::new(options.max_pings_out);
        Arc::new(Self {
            options,
            connector,
            pool,
            writer,
            subs,
            stats,
            pings,
            state: AtomicU8::new(ConnState::Disconnected as u8),
            ever_connected: AtomicBool::new(false),
            start_failure: Mutex::new(None),
            info: Mutex::new(None),
        })
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub(crate) fn writer(&self) -> &Arc<ProtocolWriter> {
        &self.writer
    }

    pub(crate) fn subs(&self) -> &Arc<SubscriptionPool> {
        &self.subs
    }

    pub(crate) fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    pub(crate) fn pool(&self) -> &ServerPool {
        &self.pool
    }

    pub(crate) fn pings(&self) -> &PingTracker {
        &self.pings
    }

    pub(crate) fn server_info(&self) -> Option<ServerInfo> {
        self.info.lock().clone()
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::SeqCst))
    }

    /// Moves to `next` unless already there or Closed. Fires the state hook on change.
    pub(crate) fn set_state(&self, next: ConnState) {
        let closed = ConnState::Closed as u8;
        let target = next as u8;
        let changed = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                (cur != closed && cur != target).then_some(target)
            });
        if let Ok(prev) = changed {
            info!(from = %ConnState::from(prev), to = %next, "connection state changed");
            self.options.hooks.state_changed(next);
        }
    }

    /// The outer retry loop. Runs until `token` fires or attempts are exhausted.
    pub(crate) async fn run(self: Arc<Self>, token: CancelToken) {
        let mut failed_sessions: u32 = 0;
        let mut initial = true;
        loop {
            if token.is_cancelled() {
                break;
            }
            if initial {
                self.set_state(ConnState::Connecting);
            } else {
                if sleep_or_cancel(self.options.reconnect_wait(), &token).await {
                    break;
                }
                self.set_state(ConnState::Reconnecting);
            }

            let mut logical = false;
            let result = self.run_session(initial, &token, &mut logical).await;
            self.writer.detach().await;
            if token.is_cancelled() {
                break;
            }
            let error = match result {
                Ok(()) => NatsError::connection("session ended"),
                Err(e) => e,
            };
            if logical {
                failed_sessions = 0;
            }
            if self.ever_connected.load(Ordering::SeqCst) {
                // publishers wait through reconnects
                self.writer.set_link(LinkState::Pending);
            } else {
                *self.start_failure.lock() = Some(error.clone());
                self.writer.set_link(LinkState::Failed(error.clone()));
            }
            warn!(error = %error, logical, "session failed");
            self.options.hooks.async_error(&error, self.state());
            self.set_state(ConnState::Disconnected);

            initial = false;
            failed_sessions += 1;
            if failed_sessions >= self.options.max_reconnect {
                warn!(attempts = failed_sessions, "giving up on reconnection");
                break;
            }
        }
        self.shutdown().await;
    }

    /// Waits for the first logical connect. A connection that closed without ever connecting
    /// reports the failure of its first session.
    pub(crate) async fn wait_started(
        &self,
        timeout: Option<std::time::Duration>,
        token: &CancelToken,
    ) -> Result<()> {
        match self.writer.wait_connected(timeout, token).await {
            Err(NatsError::ConnectionClosed) => Err(self
                .start_failure
                .lock()
                .clone()
                .unwrap_or(NatsError::ConnectionClosed)),
            other => other,
        }
    }

    /// Terminal teardown shared by the worker and `stop`.
    pub(crate) async fn shutdown(&self) {
        self.writer.detach().await;
        self.writer.set_link(LinkState::Closed);
        self.set_state(ConnState::Closed);
        self.subs.close_all();
    }

    async fn run_session(
        &self,
        initial: bool,
        token: &CancelToken,
        logical: &mut bool,
    ) -> Result<()> {
        *self.info.lock() = None;
        let connector = self.connector.clone();
        let (transport, endpoint) = self
            .pool
            .connect(initial, token, |endpoint| {
                let connector = connector.clone();
                async move { connector.connect(&endpoint).await.map(Transport::new) }
            })
            .await?;
        debug!(server = %endpoint, "transport open, awaiting INFO");

        let mut parser = Parser::new();
        let (transport, leftover) = self
            .handshake(transport, &endpoint, &mut parser, token)
            .await?;

        let max_payload = self.server_info().map(|i| i.max_payload).unwrap_or(0);
        let (mut reader, write_half) = transport.into_split();
        self.writer.attach(write_half, max_payload).await;
        self.pings.reset();
        self.subs.restore_subscriptions();
        self.writer.flush_control().await?;

        *logical = true;
        if self.ever_connected.swap(true, Ordering::SeqCst) {
            self.stats.record_reconnect();
        }
        self.set_state(ConnState::Connected);
        self.writer.set_link(LinkState::Connected);
        info!(server = %endpoint, max_payload, "logically connected");

        for event in leftover {
            self.handle_event(event)?;
        }
        self.steady(&mut reader, &mut parser, token).await
    }

    async fn read_events(
        &self,
        transport: &mut Transport,
        parser: &mut Parser,
        token: &CancelToken,
        stage: &str,
    ) -> Result<Vec<ParsedEvent>> {
        let segment = bounded(
            transport.read_segment(Some(HANDSHAKE_READ_TIMEOUT)),
            None,
            token,
            stage,
        )
        .await??
        .ok_or_else(|| NatsError::timeout(stage, HANDSHAKE_READ_TIMEOUT.as_millis() as u64))?;
        let mut events = Vec::new();
        parser.parse(&segment, |event| {
            events.push(event);
            Ok(())
        })?;
        Ok(events)
    }

    /// INFO, TLS negotiation, CONNECT+PING and the wait for PONG. Returns the (possibly upgraded)
    /// transport and any events that arrived after the PONG.
    async fn handshake(
        &self,
        mut transport: Transport,
        endpoint: &ServerEndpoint,
        parser: &mut Parser,
        token: &CancelToken,
    ) -> Result<(Transport, Vec<ParsedEvent>)> {
        let mut pending: VecDeque<ParsedEvent> = VecDeque::new();
        let info = loop {
            if let Some(event) = pending.pop_front() {
                match event {
                    ParsedEvent::Info(json) => break ServerInfo::parse(&json)?,
                    ParsedEvent::Err(text) => {
                        return Err(NatsError::connection(format!("server rejected: {}", text)))
                    }
                    other => {
                        return Err(NatsError::protocol(
                            "AwaitInfo",
                            format!("expected INFO, got {:?}", other),
                        ))
                    }
                }
            }
            pending.extend(self.read_events(&mut transport, parser, token, "await INFO").await?);
        };

        if endpoint.is_secured() && !info.tls_required {
            return Err(NatsError::SecureConnWanted {
                server: endpoint.to_string(),
            });
        }
        if info.tls_required && !endpoint.is_secured() {
            return Err(NatsError::SecureConnRequired {
                server: endpoint.to_string(),
            });
        }
        if endpoint.is_secured() {
            transport = transport.upgrade(self.connector.as_ref(), endpoint).await?;
            // bytes after INFO belong to the plain stream
            pending.clear();
            parser.reset();
        }
        debug!(server_id = %info.server_id, version = %info.version, "INFO received");
        self.apply_info(info, endpoint.is_secured());

        let connect = ConnectInfo::new(&self.options, endpoint).to_line()?;
        transport.write_all(&connect).await?;
        transport.write_all(PING).await?;

        let stage = if self.options.verbose {
            "SendConnectVerbose"
        } else {
            "SendConnectNormal"
        };
        let mut awaiting_ok = self.options.verbose;
        loop {
            while let Some(event) = pending.pop_front() {
                match event {
                    ParsedEvent::Ok => awaiting_ok = false,
                    ParsedEvent::Pong if awaiting_ok => {
                        return Err(NatsError::protocol(stage, "PONG before +OK"))
                    }
                    ParsedEvent::Pong => return Ok((transport, pending.into_iter().collect())),
                    ParsedEvent::Ping => transport.write_all(PONG).await?,
                    ParsedEvent::Info(json) => {
                        self.apply_info(ServerInfo::parse(&json)?, endpoint.is_secured())
                    }
                    ParsedEvent::Err(text) => {
                        return Err(NatsError::connection(format!("server rejected: {}", text)))
                    }
                    ParsedEvent::Msg(msg) => {
                        return Err(NatsError::protocol(
                            stage,
                            format!("MSG for sid {} before connect completed", msg.sid()),
                        ))
                    }
                }
            }
            pending.extend(self.read_events(&mut transport, parser, token, stage).await?);
        }
    }

    async fn steady(
        &self,
        reader: &mut TransportReader,
        parser: &mut Parser,
        token: &CancelToken,
    ) -> Result<()> {
        let mut ticker = self.options.ping_interval().map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                _ = self.writer.control_signal() => {
                    self.writer.flush_control().await?;
                }
                _ = next_tick(&mut ticker) => {
                    match self.pings.on_tick() {
                        PingAction::Send => self.writer.enqueue(Bytes::from_static(PING)),
                        PingAction::Stale => return Err(NatsError::StaleConnection),
                    }
                }
                segment = reader.read_segment() => {
                    let segment = segment?;
                    parser.parse(&segment, |event| self.handle_event(event))?;
                }
            }
        }
    }

    fn handle_event(&self, event: ParsedEvent) -> Result<()> {
        match event {
            ParsedEvent::Msg(msg) => {
                self.stats.record_in(msg.payload_len());
                self.subs.process_message(msg);
            }
            ParsedEvent::Ping => self.writer.enqueue(Bytes::from_static(PONG)),
            ParsedEvent::Pong => self.pings.record_pong(),
            ParsedEvent::Ok => {}
            ParsedEvent::Info(json) => {
                let secured = self.pool.current().is_some_and(|ep| ep.is_secured());
                self.apply_info(ServerInfo::parse(&json)?, secured);
            }
            ParsedEvent::Err(text) => return self.on_server_error(text),
        }
        Ok(())
    }

    fn on_server_error(&self, text: String) -> Result<()> {
        match classify_server_error(&text) {
            ServerErrorKind::Stale => Err(NatsError::StaleConnection),
            ServerErrorKind::Authorization => Err(NatsError::connection(text)),
            ServerErrorKind::Permissions => {
                warn!(error = %text, "server reported permissions violation");
                self.options
                    .hooks
                    .async_error(&NatsError::Server(text), self.state());
                Ok(())
            }
            ServerErrorKind::Other => Err(NatsError::protocol(self.state().to_string(), text)),
        }
    }

    fn apply_info(&self, info: ServerInfo, secured: bool) {
        self.writer.set_max_payload(info.max_payload);
        let fresh = self.pool.add_discovered(&info.connect_urls, secured);
        *self.info.lock() = Some(info);
        if !fresh.is_empty() {
            info!(count = fresh.len(), "discovered servers");
            self.options.hooks.server_discovered(&fresh);
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
