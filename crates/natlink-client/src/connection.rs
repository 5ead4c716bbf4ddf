//! Public connection handle.

use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
use crate::config::ClientOptions;
use crate::endpoint::ServerEndpoint;
use crate::engine::{ConnState, ConnectionEngine};
use crate::error::{NatsError, Result};
use crate::keepalive::PingStats;
use crate::message::{InboundMessage, OutboundMessage};
use crate::metrics::StatsSnapshot;
use crate::protocol::ServerInfo;
use crate::request::{new_inbox, RequestReplyManager};
use crate::server_pool::{ServerConnectionStatus, SharedRng};
use crate::subscription::{
    AsyncMessageHandler, Delivery, HandlerResult, MessageHandler, ReactiveHandler, Subscription,
};
use crate::transport::{Connector, TcpConnector, TcpConnectorConfig};
use futures::FutureExt;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Outer life-cycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeCycle {
    /// Not running.
    Idle,
    /// `start` in progress.
    Starting,
    /// Worker task running.
    Running,
    /// `stop` in progress.
    Stopping,
}

impl LifeCycle {
    fn begin_start(&mut self) -> bool {
        if *self == LifeCycle::Idle {
            *self = LifeCycle::Starting;
            true
        } else {
            false
        }
    }

    fn begin_stop(&mut self) -> bool {
        if *self == LifeCycle::Stopping {
            return false;
        }
        *self = LifeCycle::Stopping;
        true
    }
}

struct ConnectionInner {
    engine: Arc<ConnectionEngine>,
    requests: Arc<RequestReplyManager>,
    rng: SharedRng,
    life: Mutex<LifeCycle>,
    closed: AtomicBool,
    worker: Mutex<Option<(CancelHandle, JoinHandle<()>)>>,
}

impl ConnectionInner {
    /// Runs after the worker returns. When the worker gave up on its own this releases request
    /// waiters and the dispatcher, the same way `stop` does.
    async fn worker_exited(&self) {
        self.requests.shutdown().await;
        self.engine.subs().stop_dispatcher().await;
        self.closed.store(true, Ordering::SeqCst);
        let mut life = self.life.lock();
        if *life == LifeCycle::Running {
            *life = LifeCycle::Idle;
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some((handle, _task)) = self.worker.get_mut().take() {
            handle.cancel(CancelReason::ConnectionStopped);
        }
        self.engine.subs().close_all();
    }
}

/// A client connection: one worker task, one subscription pool, one request/reply engine.
///
/// Cloning is cheap and every clone drives the same connection. Must be used inside a tokio
/// runtime.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("life_cycle", &self.life_cycle())
            .field("server", &self.connected_server())
            .finish()
    }
}

impl Connection {
    /// Creates a connection over TCP (and rustls for `tls://` endpoints).
    pub fn new(options: ClientOptions) -> Result<Self> {
        options.validate()?;
        let connector = TcpConnector::new(
            TcpConnectorConfig {
                connect_timeout_ms: options.connect_timeout_ms,
                nodelay: true,
            },
            &options.tls,
        )?;
        Self::with_parts(options, Arc::new(connector), StdRng::from_entropy())
    }

    /// Creates a connection with an explicit transport factory and randomness source.
    pub fn with_parts(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        rng: StdRng,
    ) -> Result<Self> {
        options.validate()?;
        let rng: SharedRng = Arc::new(Mutex::new(rng));
        let inbox = new_inbox(&rng);
        let requests = RequestReplyManager::new(inbox, options.request_watchdog_interval());
        let engine = ConnectionEngine::new(options, connector, rng.clone());
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                engine,
                requests,
                rng,
                life: Mutex::new(LifeCycle::Idle),
                closed: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) || self.state() == ConnState::Closed {
            return Err(NatsError::ConnectionClosed);
        }
        Ok(())
    }

    /// Spawns the worker, dispatcher and request watchdog. Starting a running connection is a
    /// no-op; starting a closed one fails with [`NatsError::ConnectionClosed`].
    pub fn start(&self) -> Result<()> {
        {
            let mut life = self.inner.life.lock();
            self.ensure_open()?;
            if !life.begin_start() {
                return Ok(());
            }
        }
        let engine = &self.inner.engine;
        if let Err(e) = self.inner.requests.ensure_inbox(engine.subs()) {
            *self.inner.life.lock() = LifeCycle::Idle;
            return Err(e);
        }
        engine.subs().start_dispatcher();
        self.inner.requests.start_watchdog();

        *self.inner.life.lock() = LifeCycle::Running;
        let (token, handle) = new_cancel_pair();
        let worker = engine.clone().run(token);
        let inner = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            worker.await;
            if let Some(inner) = inner.upgrade() {
                inner.worker_exited().await;
            }
        });
        *self.inner.worker.lock() = Some((handle, task));
        info!(
            servers = engine.pool().known_servers().len(),
            "connection started"
        );
        Ok(())
    }

    /// Starts and waits for the first logical connect. A failure before that point is returned.
    pub async fn start_and_wait(
        &self,
        timeout: Option<Duration>,
        token: &CancelToken,
    ) -> Result<()> {
        self.start()?;
        self.inner.engine.wait_started(timeout, token).await
    }

    /// Stops every task and closes the connection for good. A second call is a no-op.
    pub async fn stop(&self) {
        {
            let mut life = self.inner.life.lock();
            if self.inner.closed.load(Ordering::SeqCst) || !life.begin_stop() {
                return;
            }
        }
        let worker = self.inner.worker.lock().take();
        if let Some((handle, task)) = worker {
            handle.cancel(CancelReason::ConnectionStopped);
            if let Err(e) = task.await {
                warn!(error = %e, "connection worker failed");
            }
        }
        self.inner.engine.subs().stop_dispatcher().await;
        self.inner.requests.shutdown().await;
        self.inner.engine.shutdown().await;
        self.inner.closed.store(true, Ordering::SeqCst);
        *self.inner.life.lock() = LifeCycle::Idle;
        info!("connection stopped");
    }

    /// Same as [`Connection::stop`].
    pub async fn close(&self) {
        self.stop().await
    }

    /// Observable connection state.
    pub fn state(&self) -> ConnState {
        self.inner.engine.state()
    }

    /// Outer life-cycle.
    pub fn life_cycle(&self) -> LifeCycle {
        *self.inner.life.lock()
    }

    /// Publishes `msg`, waiting as long as needed for the connection.
    pub async fn publish(&self, msg: &OutboundMessage) -> Result<()> {
        self.publish_with(msg, None, &CancelToken::none()).await
    }

    /// Publishes `msg`, waiting at most `timeout` for the connection.
    pub async fn publish_with(
        &self,
        msg: &OutboundMessage,
        timeout: Option<Duration>,
        token: &CancelToken,
    ) -> Result<()> {
        self.inner.engine.writer().publish(msg, timeout, token).await
    }

    /// Creates a pull subscription.
    pub fn subscribe(&self, subject: &str, queue: Option<&str>) -> Result<Subscription> {
        self.ensure_open()?;
        self.inner
            .engine
            .subs()
            .subscribe(subject, queue, Delivery::pull())
    }

    /// Creates a subscription whose messages are handed to `handler` on the dispatcher task.
    pub fn subscribe_with_handler<F>(
        &self,
        subject: &str,
        queue: Option<&str>,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(InboundMessage, &CancelToken) -> HandlerResult + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let subs = self.inner.engine.subs();
        let handler: MessageHandler = Arc::new(handler);
        let delivery = Delivery::push(ReactiveHandler::Sync(handler), subs.root_token());
        subs.subscribe(subject, queue, delivery)
    }

    /// Like [`Connection::subscribe_with_handler`] with an async handler. Handler futures are
    /// awaited one at a time.
    pub fn subscribe_with_async_handler<F, Fut>(
        &self,
        subject: &str,
        queue: Option<&str>,
        handler: F,
    ) -> Result<Subscription>
    where
        F: Fn(InboundMessage, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.ensure_open()?;
        let subs = self.inner.engine.subs();
        let handler: AsyncMessageHandler =
            Arc::new(move |msg: InboundMessage, token: CancelToken| handler(msg, token).boxed());
        let delivery = Delivery::push(ReactiveHandler::Async(handler), subs.root_token());
        subs.subscribe(subject, queue, delivery)
    }

    /// Publishes `msg` with a private reply subject and returns the first reply.
    ///
    /// `timeout` bounds both the wait for the connection and the wait for the reply; `None`
    /// waits indefinitely.
    pub async fn request(
        &self,
        msg: &OutboundMessage,
        timeout: Option<Duration>,
        token: &CancelToken,
    ) -> Result<InboundMessage> {
        self.ensure_open()?;
        self.inner.requests.ensure_inbox(self.inner.engine.subs())?;
        self.inner
            .requests
            .request(self.inner.engine.writer(), msg, timeout, token)
            .await
    }

    /// A fresh unique inbox subject.
    pub fn new_inbox(&self) -> String {
        new_inbox(&self.inner.rng)
    }

    /// The inbox prefix used for requests on this connection.
    pub fn request_inbox(&self) -> &str {
        self.inner.requests.inbox()
    }

    /// Traffic counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.engine.stats().snapshot()
    }

    /// Zeroes traffic counters.
    pub fn reset_stats(&self) {
        self.inner.engine.stats().reset()
    }

    /// Every server in the pool, configured and discovered.
    pub fn known_servers(&self) -> Vec<ServerEndpoint> {
        self.inner.engine.pool().known_servers()
    }

    /// Per-server connection bookkeeping: attempts, failures, whether it ever connected.
    pub fn server_statuses(&self) -> Vec<ServerConnectionStatus> {
        self.inner.engine.pool().statuses()
    }

    /// Keep-alive counters of the current session.
    pub fn ping_stats(&self) -> PingStats {
        self.inner.engine.pings().stats()
    }

    /// Servers learned from INFO.
    pub fn discovered_servers(&self) -> Vec<ServerEndpoint> {
        self.inner.engine.pool().discovered_servers()
    }

    /// INFO of the current session.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.engine.server_info()
    }

    /// The server of the current session, while connected.
    pub fn connected_server(&self) -> Option<ServerEndpoint> {
        if self.state() != ConnState::Connected {
            return None;
        }
        self.inner.engine.pool().current()
    }

    /// Id of the server of the current session, while connected.
    pub fn connected_server_id(&self) -> Option<String> {
        if self.state() != ConnState::Connected {
            return None;
        }
        self.server_info().map(|i| i.server_id)
    }

    /// Largest payload the server accepts, 0 before the first INFO.
    pub fn max_payload(&self) -> u64 {
        self.inner.engine.writer().max_payload()
    }

    /// Active subscriptions, the request inbox included.
    pub fn subscription_count(&self) -> usize {
        self.inner.engine.subs().len()
    }

    /// The options this connection was built with.
    pub fn options(&self) -> &ClientOptions {
        self.inner.engine.options()
    }
}
