//! Request/reply over a shared inbox subscription.
//!
//! Each connection owns one wildcard inbox subscription, `<inbox>.*`. A request publishes with
//! reply subject `<inbox>.<id>` and waits on a one-shot completion. Replies are matched by the
//! id suffix; a watchdog task expires requests whose timeout has elapsed.

use crate::cancel::{bounded, new_cancel_pair, CancelHandle, CancelReason, CancelToken};
use crate::error::{NatsError, Result};
use crate::message::{InboundMessage, OutboundMessage};
use crate::server_pool::SharedRng;
use crate::sub_pool::SubscriptionPool;
use crate::subscription::{Delivery, Subscription};
use crate::writer::ProtocolWriter;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Prefix of every generated inbox subject.
pub const INBOX_PREFIX: &str = "_INBOX.";

const INBOX_TOKEN_LEN: usize = 22;

/// Generates a fresh `_INBOX.<22 alphanumerics>` subject.
pub fn new_inbox(rng: &SharedRng) -> String {
    let mut rng = rng.lock();
    let token: String = (0..INBOX_TOKEN_LEN)
        .map(|_| char::from(rng.sample(Alphanumeric)))
        .collect();
    format!("{}{}", INBOX_PREFIX, token)
}

struct Budget {
    remaining: Option<Duration>,
    last_tick: Instant,
}

/// One outstanding request.
pub(crate) struct InFlightRequest {
    timeout_ms: u64,
    budget: Mutex<Budget>,
    completion: Mutex<Option<oneshot::Sender<Result<InboundMessage>>>>,
}

impl InFlightRequest {
    pub(crate) fn new(
        timeout: Option<Duration>,
        now: Instant,
    ) -> (Self, oneshot::Receiver<Result<InboundMessage>>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            timeout_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            budget: Mutex::new(Budget {
                remaining: timeout,
                last_tick: now,
            }),
            completion: Mutex::new(Some(tx)),
        };
        (request, rx)
    }

    /// Completes with a reply. Returns false if already completed.
    pub(crate) fn resolve(&self, msg: InboundMessage) -> bool {
        self.complete(Ok(msg))
    }

    /// Completes with an error. Returns false if already completed.
    pub(crate) fn reject(&self, error: NatsError) -> bool {
        self.complete(Err(error))
    }

    fn complete(&self, outcome: Result<InboundMessage>) -> bool {
        match self.completion.lock().take() {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Charges the time since the last tick. Returns true once the budget is spent.
    pub(crate) fn tick(&self, now: Instant) -> bool {
        let mut budget = self.budget.lock();
        let elapsed = now.saturating_duration_since(budget.last_tick);
        budget.last_tick = now;
        match budget.remaining {
            None => false,
            Some(left) => {
                let left = left.saturating_sub(elapsed);
                budget.remaining = Some(left);
                left.is_zero()
            }
        }
    }
}

pub(crate) struct RequestReplyManager {
    inbox: String,
    next_id: AtomicU64,
    table: Mutex<HashMap<u64, Arc<InFlightRequest>>>,
    interval: Duration,
    watchdog: Mutex<Option<(CancelHandle, JoinHandle<()>)>>,
    inbox_sub: Mutex<Option<Subscription>>,
}

impl RequestReplyManager {
    pub(crate) fn new(inbox: String, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            inbox,
            next_id: AtomicU64::new(1),
            table: Mutex::new(HashMap::new()),
            interval,
            watchdog: Mutex::new(None),
            inbox_sub: Mutex::new(None),
        })
    }

    pub(crate) fn inbox(&self) -> &str {
        &self.inbox
    }

    /// Subscribes the shared inbox if not yet done.
    pub(crate) fn ensure_inbox(self: &Arc<Self>, subs: &Arc<SubscriptionPool>) -> Result<()> {
        let mut slot = self.inbox_sub.lock();
        if slot.as_ref().is_some_and(Subscription::is_valid) {
            return Ok(());
        }
        let me: Weak<Self> = Arc::downgrade(self);
        let handler = Arc::new(move |msg: InboundMessage| {
            if let Some(manager) = me.upgrade() {
                manager.on_reply(msg);
            }
        });
        let pattern = format!("{}.*", self.inbox);
        *slot = Some(subs.subscribe(&pattern, None, Delivery::Inline(handler))?);
        debug!(inbox = %self.inbox, "inbox subscribed");
        Ok(())
    }

    fn on_reply(&self, msg: InboundMessage) {
        let id = msg
            .subject()
            .rsplit('.')
            .next()
            .and_then(|suffix| suffix.parse::<u64>().ok());
        let Some(id) = id else {
            trace!(subject = msg.subject(), "unparseable inbox reply");
            return;
        };
        let request = self.table.lock().remove(&id);
        match request {
            Some(request) => {
                request.resolve(msg);
            }
            None => trace!(id, "reply for unknown or expired request"),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.table.lock().len()
    }

    /// Publishes `msg` with a private reply subject and waits for the first reply.
    pub(crate) async fn request(
        &self,
        writer: &ProtocolWriter,
        msg: &OutboundMessage,
        timeout: Option<Duration>,
        token: &CancelToken,
    ) -> Result<InboundMessage> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (request, rx) = InFlightRequest::new(timeout, Instant::now());
        self.table.lock().insert(id, Arc::new(request));

        let outbound = msg.redirect_reply(format!("{}.{}", self.inbox, id));
        if let Err(e) = writer.publish(&outbound, timeout, token).await {
            self.table.lock().remove(&id);
            return Err(e);
        }
        trace!(id, subject = msg.subject(), "request published");

        match bounded(rx, None, token, "request").await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(NatsError::ConnectionClosed),
            Err(e) => {
                self.table.lock().remove(&id);
                Err(e)
            }
        }
    }

    /// Rejects every request whose budget is spent at `now`.
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<Arc<InFlightRequest>> = {
            let mut table = self.table.lock();
            let ids: Vec<u64> = table
                .iter()
                .filter(|(_, r)| r.tick(now))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        for request in &expired {
            request.reject(NatsError::timeout("request", request.timeout_ms));
        }
        expired.len()
    }

    pub(crate) fn start_watchdog(self: &Arc<Self>) {
        let mut slot = self.watchdog.lock();
        if slot.is_some() {
            return;
        }
        let (token, handle) = new_cancel_pair();
        let me = Arc::downgrade(self);
        let interval = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = me.upgrade() else { break };
                let expired = manager.sweep(Instant::now());
                if expired > 0 {
                    debug!(expired, "requests timed out");
                }
            }
        });
        *slot = Some((handle, task));
    }

    /// Stops the watchdog and fails everything still outstanding.
    pub(crate) async fn shutdown(&self) {
        let running = self.watchdog.lock().take();
        if let Some((handle, task)) = running {
            handle.cancel(CancelReason::ConnectionStopped);
            if let Err(e) = task.await {
                warn!(error = %e, "request watchdog failed");
            }
        }
        let pending: Vec<Arc<InFlightRequest>> =
            self.table.lock().drain().map(|(_, r)| r).collect();
        for request in pending {
            request.reject(NatsError::ConnectionClosed);
        }
        self.inbox_sub.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use crate::metrics::ConnectionStats;
    use crate::transport::Transport;
    use crate::writer::LinkState;
    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> SharedRng {
        Arc::new(Mutex::new(StdRng::seed_from_u64(7)))
    }

    #[test]
    fn test_new_inbox_shape() {
        let rng = rng();
        let a = new_inbox(&rng);
        let b = new_inbox(&rng);
        assert!(a.starts_with(INBOX_PREFIX));
        assert_eq!(a.len(), INBOX_PREFIX.len() + INBOX_TOKEN_LEN);
        assert!(a[INBOX_PREFIX.len()..].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_first_completion_wins() {
        let (req, mut rx) = InFlightRequest::new(None, Instant::now());
        let reply = InboundMessage::new("x".into(), None, 1, Bytes::new());
        assert!(req.resolve(reply));
        assert!(!req.reject(NatsError::Cancelled));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_tick_charges_actual_elapsed_time() {
        let start = Instant::now();
        let (req, _rx) = InFlightRequest::new(Some(Duration::from_millis(100)), start);
        assert!(!req.tick(start + Duration::from_millis(60)));
        assert!(!req.tick(start + Duration::from_millis(99)));
        assert!(req.tick(start + Duration::from_millis(100)));

        let (forever, _rx) = InFlightRequest::new(None, start);
        assert!(!forever.tick(start + Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_sweep_rejects_expired() {
        let manager = RequestReplyManager::new("_INBOX.t".into(), Duration::from_millis(10));
        let start = Instant::now();
        let (req, rx) = InFlightRequest::new(Some(Duration::from_millis(5)), start);
        manager.table.lock().insert(1, Arc::new(req));
        assert_eq!(manager.sweep(start + Duration::from_millis(10)), 1);
        assert_eq!(manager.outstanding(), 0);
        assert!(matches!(
            rx.await.unwrap(),
            Err(NatsError::Timeout { timeout_ms: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_reply_routed_through_inbox() {
        let options = ClientOptions::default();
        let stats = Arc::new(ConnectionStats::new());
        let writer = Arc::new(ProtocolWriter::new(stats));
        let subs = SubscriptionPool::new(writer.clone(), &options);
        let manager = RequestReplyManager::new("_INBOX.abc".into(), Duration::from_millis(50));
        manager.ensure_inbox(&subs).unwrap();
        manager.ensure_inbox(&subs).unwrap();
        assert_eq!(subs.len(), 1);

        let (client, _server) = tokio::io::duplex(4096);
        let (_reader, tw) = Transport::new(Box::new(client)).into_split();
        writer.attach(tw, 1024).await;
        writer.set_link(LinkState::Connected);

        let responder = {
            let subs = subs.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                subs.process_message(InboundMessage::new(
                    "_INBOX.abc.1".into(),
                    None,
                    1,
                    Bytes::from_static(b"pong"),
                ));
            })
        };
        let reply = manager
            .request(
                &writer,
                &OutboundMessage::new("svc", b"ping"),
                Some(Duration::from_secs(2)),
                &CancelToken::none(),
            )
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(reply.payload(), &Bytes::from_static(b"pong"));
        assert_eq!(manager.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_request_times_out_via_watchdog() {
        let options = ClientOptions::default();
        let writer = Arc::new(ProtocolWriter::new(Arc::new(ConnectionStats::new())));
        let subs = SubscriptionPool::new(writer.clone(), &options);
        let manager = RequestReplyManager::new("_INBOX.w".into(), Duration::from_millis(10));
        manager.ensure_inbox(&subs).unwrap();
        manager.start_watchdog();

        let (client, _server) = tokio::io::duplex(4096);
        let (_reader, tw) = Transport::new(Box::new(client)).into_split();
        writer.attach(tw, 0).await;
        writer.set_link(LinkState::Connected);

        let started = Instant::now();
        let err = manager
            .request(
                &writer,
                &OutboundMessage::new("svc", b""),
                Some(Duration::from_millis(50)),
                &CancelToken::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NatsError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(manager.outstanding(), 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_removes_request() {
        let options = ClientOptions::default();
        let writer = Arc::new(ProtocolWriter::new(Arc::new(ConnectionStats::new())));
        let _subs = SubscriptionPool::new(writer.clone(), &options);
        let manager = RequestReplyManager::new("_INBOX.c".into(), Duration::from_millis(10));
        let (client, _server) = tokio::io::duplex(4096);
        let (_reader, tw) = Transport::new(Box::new(client)).into_split();
        writer.attach(tw, 0).await;
        writer.set_link(LinkState::Connected);

        let (token, handle) = new_cancel_pair();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel(CancelReason::UserRequested);
        });
        let err = manager
            .request(&writer, &OutboundMessage::new("svc", b""), None, &token)
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, NatsError::Cancelled));
        assert_eq!(manager.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_unregisters() {
        let writer = ProtocolWriter::new(Arc::new(ConnectionStats::new()));
        writer.set_link(LinkState::Closed);
        let manager = RequestReplyManager::new("_INBOX.f".into(), Duration::from_millis(10));
        let err = manager
            .request(&writer, &OutboundMessage::new("svc", b""), None, &CancelToken::none())
            .await
            .unwrap_err();
        assert!(matches!(err, NatsError::ConnectionClosed));
        assert_eq!(manager.outstanding(), 0);
    }
}
