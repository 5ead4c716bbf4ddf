//! Subscriptions: per-subscription pending queues, limits and delivery.
//!
//! A subscription is either passive (the application pulls with [`Subscription::next_message`])
//! or reactive (a handler is driven by the connection's dispatcher task). Both share the same
//! admission path: a message is queued only while the subscription is within its pending limits,
//! otherwise it is dropped and the subscription is flagged as a slow consumer until it catches up.

use crate::cancel::{bounded, CancelHandle, CancelReason, CancelToken};
use crate::error::{NatsError, Result};
use crate::message::InboundMessage;
use crate::sub_pool::SubscriptionPool;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Outcome reported by a message handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler observed cancellation; no further messages are delivered to it.
    #[error("handler cancelled delivery")]
    Cancelled,
    /// The handler failed on this message. Delivery continues.
    #[error("handler failed: {0}")]
    Failed(String),
}

/// Result of one handler invocation.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Synchronous handler for reactive subscriptions.
pub type MessageHandler = Arc<dyn Fn(InboundMessage, &CancelToken) -> HandlerResult + Send + Sync>;

/// Asynchronous handler for reactive subscriptions.
pub type AsyncMessageHandler =
    Arc<dyn Fn(InboundMessage, CancelToken) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

pub(crate) type InlineHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Pending-queue limits. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PendingLimits {
    /// Maximum queued messages.
    pub msgs: usize,
    /// Maximum queued payload bytes.
    pub bytes: usize,
}

impl PendingLimits {
    /// Creates limits.
    pub fn new(msgs: usize, bytes: usize) -> Self {
        Self { msgs, bytes }
    }

    fn exceeded_by(&self, msgs: usize, bytes: usize) -> bool {
        (self.msgs > 0 && msgs > self.msgs) || (self.bytes > 0 && bytes > self.bytes)
    }

    fn below(&self, msgs: usize, bytes: usize) -> bool {
        (self.msgs == 0 || msgs < self.msgs) && (self.bytes == 0 || bytes < self.bytes)
    }
}

/// Per-subscription counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    /// Messages routed to this subscription, dropped ones included.
    pub processed_msgs: u64,
    /// Payload bytes routed to this subscription.
    pub processed_bytes: u64,
    /// Messages handed to the application.
    pub delivered_msgs: u64,
    /// Messages dropped for exceeding pending limits.
    pub dropped_msgs: u64,
    /// Messages currently queued.
    pub pending_msgs: usize,
    /// Payload bytes currently queued.
    pub pending_bytes: usize,
    /// High-water mark of queued messages.
    pub max_pending_msgs: usize,
    /// High-water mark of queued bytes.
    pub max_pending_bytes: usize,
}

pub(crate) enum ReactiveHandler {
    Sync(MessageHandler),
    Async(AsyncMessageHandler),
}

pub(crate) enum Delivery {
    Pull {
        ready: Semaphore,
    },
    Push {
        handler: ReactiveHandler,
        token: CancelToken,
        cancel: CancelHandle,
        scheduled: AtomicBool,
    },
    Inline(InlineHandler),
}

impl Delivery {
    pub(crate) fn pull() -> Self {
        Delivery::Pull {
            ready: Semaphore::new(0),
        }
    }

    pub(crate) fn push(handler: ReactiveHandler, parent: &CancelToken) -> Self {
        let (token, cancel) = parent.child();
        Delivery::Push {
            handler,
            token,
            cancel,
            scheduled: AtomicBool::new(false),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Delivery::Pull { .. } => "pull",
            Delivery::Push { .. } => "push",
            Delivery::Inline(_) => "inline",
        }
    }
}

#[derive(Default)]
struct SubState {
    queue: VecDeque<InboundMessage>,
    pending_bytes: usize,
    limits: Option<PendingLimits>,
    slow: bool,
    admitted: u64,
    stats: SubscriptionStats,
}

/// What happened to a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Queued { limit_reached: bool },
    Delivered,
    Dropped { became_slow: bool },
    Rejected,
}

pub(crate) struct SubscriptionShared {
    sid: u64,
    subject: String,
    queue_group: Option<String>,
    delivery: Delivery,
    valid: AtomicBool,
    max_msgs: AtomicU64,
    defaults: PendingLimits,
    state: Mutex<SubState>,
}

impl SubscriptionShared {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        queue_group: Option<String>,
        delivery: Delivery,
        defaults: PendingLimits,
    ) -> Self {
        Self {
            sid,
            subject,
            queue_group,
            delivery,
            valid: AtomicBool::new(true),
            max_msgs: AtomicU64::new(0),
            defaults,
            state: Mutex::new(SubState::default()),
        }
    }

    pub(crate) fn sid(&self) -> u64 {
        self.sid
    }

    pub(crate) fn subject(&self) -> &str {
        &self.subject
    }

    pub(crate) fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub(crate) fn is_push(&self) -> bool {
        matches!(self.delivery, Delivery::Push { .. })
    }

    /// Arms the auto-unsubscribe limit. Returns true when it is already reached.
    pub(crate) fn arm(&self, max: u64) -> bool {
        self.max_msgs.store(max, Ordering::SeqCst);
        self.state.lock().admitted >= max
    }

    /// Messages still allowed before the armed limit, if armed.
    pub(crate) fn remaining_allowance(&self) -> Option<u64> {
        let max = self.max_msgs.load(Ordering::SeqCst);
        if max == 0 {
            return None;
        }
        Some(max.saturating_sub(self.state.lock().admitted))
    }

    fn effective_limits(&self, state: &SubState) -> PendingLimits {
        state.limits.unwrap_or(self.defaults)
    }

    /// Routes one message into this subscription.
    pub(crate) fn admit(
        self: &Arc<Self>,
        mut msg: InboundMessage,
        pool: &Weak<SubscriptionPool>,
    ) -> Admission {
        if !self.is_valid() {
            return Admission::Rejected;
        }
        let len = msg.payload_len();

        if let Delivery::Inline(handler) = &self.delivery {
            {
                let mut state = self.state.lock();
                state.stats.processed_msgs += 1;
                state.stats.processed_bytes += len as u64;
                state.stats.delivered_msgs += 1;
            }
            handler(msg);
            return Admission::Delivered;
        }

        let mut state = self.state.lock();
        state.stats.processed_msgs += 1;
        state.stats.processed_bytes += len as u64;

        if let Delivery::Push { token, .. } = &self.delivery {
            if token.is_cancelled() {
                state.stats.dropped_msgs += 1;
                return Admission::Dropped { became_slow: false };
            }
        }

        let limits = self.effective_limits(&state);
        if state.slow || limits.exceeded_by(state.queue.len() + 1, state.pending_bytes + len) {
            state.stats.dropped_msgs += 1;
            let became_slow = !state.slow;
            state.slow = true;
            return Admission::Dropped { became_slow };
        }

        msg.attach(WeakSubscription {
            shared: Arc::downgrade(self),
            pool: pool.clone(),
        });
        state.queue.push_back(msg);
        state.pending_bytes += len;
        state.admitted += 1;
        let pending_msgs = state.queue.len();
        let pending_bytes = state.pending_bytes;
        state.stats.max_pending_msgs = state.stats.max_pending_msgs.max(pending_msgs);
        state.stats.max_pending_bytes = state.stats.max_pending_bytes.max(pending_bytes);
        let max = self.max_msgs.load(Ordering::SeqCst);
        let limit_reached = max > 0 && state.admitted >= max;
        drop(state);

        if let Delivery::Pull { ready } = &self.delivery {
            ready.add_permits(1);
        }
        Admission::Queued { limit_reached }
    }

    /// Takes the oldest queued message.
    pub(crate) fn try_dequeue(&self) -> Option<InboundMessage> {
        let mut state = self.state.lock();
        let msg = state.queue.pop_front()?;
        state.pending_bytes -= msg.payload_len();
        state.stats.delivered_msgs += 1;
        if state.slow {
            let limits = self.effective_limits(&state);
            if limits.below(state.queue.len(), state.pending_bytes) {
                state.slow = false;
                debug!(sid = self.sid, "subscription caught up");
            }
        }
        Some(msg)
    }

    /// Marks the subscription invalid. `discard` also drops queued messages and stops the handler.
    pub(crate) fn invalidate(&self, discard: bool) {
        self.valid.store(false, Ordering::SeqCst);
        if discard {
            let mut state = self.state.lock();
            state.queue.clear();
            state.pending_bytes = 0;
            state.slow = false;
        }
        match &self.delivery {
            Delivery::Pull { ready } => ready.close(),
            Delivery::Push { cancel, .. } if discard => cancel.cancel(CancelReason::Unsubscribed),
            _ => {}
        }
    }

    /// Sets the scheduled flag, returning true if it was clear.
    pub(crate) fn mark_scheduled(&self) -> bool {
        match &self.delivery {
            Delivery::Push { scheduled, .. } => !scheduled.swap(true, Ordering::SeqCst),
            _ => false,
        }
    }

    pub(crate) fn clear_scheduled(&self) {
        if let Delivery::Push { scheduled, .. } = &self.delivery {
            scheduled.store(false, Ordering::SeqCst);
        }
    }

    /// Runs the handler over every queued message.
    pub(crate) async fn forward_pending(&self) {
        let Delivery::Push {
            handler,
            token,
            cancel,
            ..
        } = &self.delivery
        else {
            return;
        };
        loop {
            if token.is_cancelled() {
                break;
            }
            let Some(msg) = self.try_dequeue() else {
                break;
            };
            let outcome = match handler {
                ReactiveHandler::Sync(f) => {
                    std::panic::catch_unwind(AssertUnwindSafe(|| f(msg, token)))
                }
                ReactiveHandler::Async(f) => {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| f(msg, token.clone()))) {
                        Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                        Err(panic) => Err(panic),
                    }
                }
            };
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(HandlerError::Cancelled)) => {
                    debug!(sid = self.sid, subject = %self.subject, "handler stopped delivery");
                    cancel.cancel(CancelReason::HandlerStopped);
                    break;
                }
                Ok(Err(HandlerError::Failed(reason))) => {
                    warn!(
                        sid = self.sid,
                        subject = %self.subject,
                        error = %reason,
                        "message handler failed"
                    );
                }
                Err(_) => {
                    warn!(sid = self.sid, subject = %self.subject, "message handler panicked");
                }
            }
        }
    }

    pub(crate) async fn next_message(
        &self,
        timeout: Option<Duration>,
        token: &CancelToken,
    ) -> Result<InboundMessage> {
        let Delivery::Pull { ready } = &self.delivery else {
            return Err(NatsError::InvalidArgument(format!(
                "next_message requires a pull subscription, sid {} is {}",
                self.sid,
                self.delivery.kind()
            )));
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let total_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
        loop {
            if let Some(msg) = self.try_dequeue() {
                return Ok(msg);
            }
            if !self.is_valid() {
                return Err(NatsError::BadSubscription);
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                return Err(NatsError::timeout("next message", total_ms));
            }
            match bounded(ready.acquire(), remaining, token, "next message").await {
                Ok(Ok(permit)) => permit.forget(),
                // closed: drain what is left, then report
                Ok(Err(_)) => {}
                Err(NatsError::Timeout { .. }) => {
                    return Err(NatsError::timeout("next message", total_ms))
                }
                Err(other) => return Err(other),
            }
        }
    }

    pub(crate) fn set_limits(&self, limits: PendingLimits) {
        let mut state = self.state.lock();
        state.limits = Some(limits);
        if state.slow && limits.below(state.queue.len(), state.pending_bytes) {
            state.slow = false;
        }
    }

    pub(crate) fn limits(&self) -> PendingLimits {
        let state = self.state.lock();
        self.effective_limits(&state)
    }

    pub(crate) fn is_slow(&self) -> bool {
        self.state.lock().slow
    }

    pub(crate) fn stats(&self) -> SubscriptionStats {
        let state = self.state.lock();
        SubscriptionStats {
            pending_msgs: state.queue.len(),
            pending_bytes: state.pending_bytes,
            ..state.stats
        }
    }

    pub(crate) fn reset_stats(&self) {
        let mut state = self.state.lock();
        state.stats = SubscriptionStats::default();
    }
}

/// Application handle to a subscription. Dropping it does not unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
    pool: Arc<SubscriptionPool>,
}

/// Non-owning reference from a delivered message back to its subscription.
#[derive(Clone)]
pub struct WeakSubscription {
    shared: Weak<SubscriptionShared>,
    pool: Weak<SubscriptionPool>,
}

impl WeakSubscription {
    /// The subscription, if the connection still holds it.
    pub fn upgrade(&self) -> Option<Subscription> {
        Some(Subscription {
            shared: self.shared.upgrade()?,
            pool: self.pool.upgrade()?,
        })
    }
}

impl std::fmt::Debug for WeakSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sid = self.shared.upgrade().map(|s| s.sid);
        f.debug_struct("WeakSubscription").field("sid", &sid).finish()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.shared.sid)
            .field("subject", &self.shared.subject)
            .field("queue", &self.shared.queue_group)
            .field("delivery", &self.shared.delivery.kind())
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(shared: Arc<SubscriptionShared>, pool: Arc<SubscriptionPool>) -> Self {
        Self { shared, pool }
    }

    /// Subscription id, unique within the connection.
    pub fn sid(&self) -> u64 {
        self.shared.sid
    }

    /// Subject pattern.
    pub fn subject(&self) -> &str {
        &self.shared.subject
    }

    /// Queue group, if any.
    pub fn queue(&self) -> Option<&str> {
        self.shared.queue_group()
    }

    /// False once unsubscribed, auto-unsubscribed or the connection closed.
    pub fn is_valid(&self) -> bool {
        self.shared.is_valid()
    }

    /// True while messages are being dropped for exceeding pending limits.
    pub fn is_slow_consumer(&self) -> bool {
        self.shared.is_slow()
    }

    /// Pulls the next message. Fails with [`NatsError::BadSubscription`] once the subscription is
    /// invalid and its queue is drained.
    pub async fn next_message(
        &self,
        timeout: Option<Duration>,
        token: &CancelToken,
    ) -> Result<InboundMessage> {
        self.shared.next_message(timeout, token).await
    }

    /// Removes the subscription now. Queued messages are discarded.
    pub fn unsubscribe(&self) -> Result<()> {
        self.pool.unsubscribe(self.shared.sid, 0)
    }

    /// Removes the subscription after `max` messages in total have been received.
    pub fn auto_unsubscribe(&self, max: u64) -> Result<()> {
        if max == 0 {
            return Err(NatsError::InvalidArgument(
                "auto-unsubscribe limit must be positive".into(),
            ));
        }
        self.pool.unsubscribe(self.shared.sid, max)
    }

    /// Overrides the connection-wide pending limits for this subscription.
    pub fn set_pending_limits(&self, msgs: usize, bytes: usize) {
        self.shared.set_limits(PendingLimits::new(msgs, bytes));
    }

    /// Limits currently in effect.
    pub fn pending_limits(&self) -> PendingLimits {
        self.shared.limits()
    }

    /// Current counters.
    pub fn stats(&self) -> SubscriptionStats {
        self.shared.stats()
    }

    /// Zeroes counters. Pending gauges reflect the queue and are unaffected.
    pub fn reset_stats(&self) {
        self.shared.reset_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    fn msg(sid: u64, payload: &'static [u8]) -> InboundMessage {
        InboundMessage::new("a".into(), None, sid, Bytes::from_static(payload))
    }

    fn pull_sub(msgs: usize, bytes: usize) -> Arc<SubscriptionShared> {
        Arc::new(SubscriptionShared::new(
            1,
            "a".into(),
            None,
            Delivery::pull(),
            PendingLimits::new(msgs, bytes),
        ))
    }

    #[test]
    fn test_slow_consumer_transitions() {
        let sub = pull_sub(2, 0);
        let pool = Weak::new();
        assert!(matches!(sub.admit(msg(1, b"1"), &pool), Admission::Queued { .. }));
        assert!(matches!(sub.admit(msg(1, b"2"), &pool), Admission::Queued { .. }));
        assert_eq!(
            sub.admit(msg(1, b"3"), &pool),
            Admission::Dropped { became_slow: true }
        );
        assert!(sub.is_slow());
        // one consumed leaves 1 < 2: recovered
        assert_eq!(sub.try_dequeue().unwrap().payload(), &Bytes::from_static(b"1"));
        assert!(!sub.is_slow());
        assert!(matches!(sub.admit(msg(1, b"4"), &pool), Admission::Queued { .. }));
        let stats = sub.stats();
        assert_eq!(stats.processed_msgs, 4);
        assert_eq!(stats.dropped_msgs, 1);
        assert_eq!(stats.pending_msgs, 2);
        assert_eq!(stats.max_pending_msgs, 2);
    }

    #[test]
    fn test_drop_everything_while_slow() {
        let sub = pull_sub(0, 4);
        let pool = Weak::new();
        assert!(matches!(sub.admit(msg(1, b"abc"), &pool), Admission::Queued { .. }));
        assert_eq!(
            sub.admit(msg(1, b"de"), &pool),
            Admission::Dropped { became_slow: true }
        );
        // would fit, still dropped while flagged
        assert_eq!(
            sub.admit(msg(1, b"d"), &pool),
            Admission::Dropped { became_slow: false }
        );
        assert_eq!(sub.stats().pending_bytes, 3);
    }

    #[test]
    fn test_zero_limits_are_unlimited() {
        let sub = pull_sub(0, 0);
        let pool = Weak::new();
        for _ in 0..1000 {
            assert!(matches!(sub.admit(msg(1, b"x"), &pool), Admission::Queued { .. }));
        }
        assert!(!sub.is_slow());
    }

    #[test]
    fn test_override_limits() {
        let sub = pull_sub(10, 0);
        sub.set_limits(PendingLimits::new(1, 0));
        assert_eq!(sub.limits(), PendingLimits::new(1, 0));
        let pool = Weak::new();
        sub.admit(msg(1, b"x"), &pool);
        assert_eq!(
            sub.admit(msg(1, b"y"), &pool),
            Admission::Dropped { became_slow: true }
        );
    }

    #[test]
    fn test_limit_reached_reported() {
        let sub = pull_sub(0, 0);
        let pool = Weak::new();
        assert!(!sub.arm(2));
        assert_eq!(sub.remaining_allowance(), Some(2));
        assert_eq!(
            sub.admit(msg(1, b"x"), &pool),
            Admission::Queued {
                limit_reached: false
            }
        );
        assert_eq!(
            sub.admit(msg(1, b"y"), &pool),
            Admission::Queued {
                limit_reached: true
            }
        );
        assert_eq!(sub.remaining_allowance(), Some(0));
    }

    #[tokio::test]
    async fn test_next_message_drains_after_invalidate() {
        let sub = pull_sub(0, 0);
        let pool = Weak::new();
        sub.admit(msg(1, b"x"), &pool);
        sub.invalidate(false);
        assert!(sub.admit(msg(1, b"y"), &pool) == Admission::Rejected);
        let got = sub.next_message(None, &CancelToken::none()).await.unwrap();
        assert_eq!(got.payload(), &Bytes::from_static(b"x"));
        let err = sub.next_message(None, &CancelToken::none()).await.unwrap_err();
        assert!(matches!(err, NatsError::BadSubscription));
    }

    #[tokio::test]
    async fn test_next_message_wakes_on_admit() {
        let sub = pull_sub(0, 0);
        let waiter = {
            let sub = sub.clone();
            tokio::spawn(async move {
                sub.next_message(Some(Duration::from_secs(5)), &CancelToken::none())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sub.admit(msg(1, b"late"), &Weak::new());
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.payload(), &Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn test_next_message_timeout_and_cancel() {
        let sub = pull_sub(0, 0);
        let err = sub
            .next_message(Some(Duration::from_millis(20)), &CancelToken::none())
            .await
            .unwrap_err();
        assert!(matches!(err, NatsError::Timeout { timeout_ms: 20, .. }));

        let (token, handle) = crate::cancel::new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        let err = sub
            .next_message(Some(Duration::from_secs(5)), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, NatsError::Cancelled));
    }

    #[tokio::test]
    async fn test_forward_pending_handles_failures_and_panics() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler: MessageHandler = Arc::new(move |m: InboundMessage, _t: &CancelToken| {
            counter.fetch_add(1, Ordering::SeqCst);
            match &m.payload()[..] {
                b"fail" => Err(HandlerError::Failed("nope".into())),
                b"panic" => panic!("handler blew up"),
                _ => Ok(()),
            }
        });
        let sub = Arc::new(SubscriptionShared::new(
            3,
            "a".into(),
            None,
            Delivery::push(ReactiveHandler::Sync(handler), &CancelToken::none()),
            PendingLimits::default(),
        ));
        let pool = Weak::new();
        for p in [&b"ok"[..], &b"fail"[..], &b"panic"[..], &b"ok"[..]] {
            sub.admit(
                InboundMessage::new("a".into(), None, 3, Bytes::copy_from_slice(p)),
                &pool,
            );
        }
        sub.forward_pending().await;
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert_eq!(sub.stats().delivered_msgs, 4);
    }

    #[tokio::test]
    async fn test_handler_cancellation_stops_delivery() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler: AsyncMessageHandler = Arc::new(move |_m, _t| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Cancelled)
            }
            .boxed()
        });
        let sub = Arc::new(SubscriptionShared::new(
            4,
            "a".into(),
            None,
            Delivery::push(ReactiveHandler::Async(handler), &CancelToken::none()),
            PendingLimits::default(),
        ));
        let pool = Weak::new();
        sub.admit(msg(4, b"1"), &pool);
        sub.admit(msg(4, b"2"), &pool);
        sub.forward_pending().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(
            sub.admit(msg(4, b"3"), &pool),
            Admission::Dropped { became_slow: false }
        );
        assert!(sub.is_valid());
    }

    #[test]
    fn test_scheduled_flag() {
        let handler: MessageHandler = Arc::new(|_m: InboundMessage, _t: &CancelToken| Ok(()));
        let sub = SubscriptionShared::new(
            5,
            "a".into(),
            None,
            Delivery::push(ReactiveHandler::Sync(handler), &CancelToken::none()),
            PendingLimits::default(),
        );
        assert!(sub.mark_scheduled());
        assert!(!sub.mark_scheduled());
        sub.clear_scheduled();
        assert!(sub.mark_scheduled());
        assert!(!pull_sub(0, 0).mark_scheduled());
    }
}
