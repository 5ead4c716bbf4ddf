//! Registry of live subscriptions and the dispatcher that drives reactive handlers.

use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
use crate::config::{ClientOptions, EventHooks};
use crate::error::{NatsError, Result};
use crate::message::InboundMessage;
use crate::protocol::{sub_line, unsub_line};
use crate::subject::{validate_pattern, validate_queue};
use crate::subscription::{Admission, Delivery, PendingLimits, Subscription, SubscriptionShared};
use crate::writer::ProtocolWriter;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// How queued messages are treated when a subscription is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    /// Already queued messages are still delivered.
    Drain,
    /// Queued messages are dropped.
    Discard,
}

struct Registry {
    next_sid: u64,
    subs: HashMap<u64, Arc<SubscriptionShared>>,
}

pub(crate) struct SubscriptionPool {
    writer: Arc<ProtocolWriter>,
    defaults: PendingLimits,
    hooks: EventHooks,
    registry: Mutex<Registry>,
    pending: Mutex<VecDeque<Arc<SubscriptionShared>>>,
    work: Notify,
    root: CancelToken,
    root_handle: CancelHandle,
    dispatcher: Mutex<Option<(CancelHandle, JoinHandle<()>)>>,
}

impl SubscriptionPool {
    pub(crate) fn new(writer: Arc<ProtocolWriter>, options: &ClientOptions) -> Arc<Self> {
        let (root, root_handle) = new_cancel_pair();
        Arc::new(Self {
            writer,
            defaults: PendingLimits::new(options.pending_msgs_limit, options.pending_bytes_limit),
            hooks: options.hooks.clone(),
            registry: Mutex::new(Registry {
                next_sid: 1,
                subs: HashMap::new(),
            }),
            pending: Mutex::new(VecDeque::new()),
            work: Notify::new(),
            root,
            root_handle,
            dispatcher: Mutex::new(None),
        })
    }

    /// Parent token for reactive handler tokens.
    pub(crate) fn root_token(&self) -> &CancelToken {
        &self.root
    }

    /// Registers a subscription and queues its SUB line.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        subject: &str,
        queue: Option<&str>,
        delivery: Delivery,
    ) -> Result<Subscription> {
        validate_pattern(subject)?;
        if let Some(queue) = queue {
            validate_queue(queue)?;
        }
        let shared = {
            let mut registry = self.registry.lock();
            let sid = registry.next_sid;
            registry.next_sid += 1;
            let shared = Arc::new(SubscriptionShared::new(
                sid,
                subject.to_string(),
                queue.map(str::to_string),
                delivery,
                self.defaults,
            ));
            registry.subs.insert(sid, shared.clone());
            self.writer.enqueue(sub_line(subject, queue, sid));
            shared
        };
        debug!(sid = shared.sid(), subject, queue = ?queue, "subscribed");
        Ok(Subscription::new(shared, self.clone()))
    }

    /// `max == 0` removes now; otherwise removal happens after `max` messages in total.
    pub(crate) fn unsubscribe(&self, sid: u64, max: u64) -> Result<()> {
        if max == 0 {
            return if self.remove(sid, Removal::Discard) {
                Ok(())
            } else {
                Err(NatsError::BadSubscription)
            };
        }
        let reached = {
            let registry = self.registry.lock();
            let shared = registry.subs.get(&sid).ok_or(NatsError::BadSubscription)?;
            let reached = shared.arm(max);
            if !reached {
                self.writer.enqueue(unsub_line(sid, Some(max)));
            }
            reached
        };
        if reached {
            self.remove(sid, Removal::Drain);
        }
        debug!(sid, max, reached, "auto-unsubscribe armed");
        Ok(())
    }

    /// Drops `sid` from the registry and queues its UNSUB. Returns false if unknown.
    pub(crate) fn remove(&self, sid: u64, mode: Removal) -> bool {
        let removed = {
            let mut registry = self.registry.lock();
            let removed = registry.subs.remove(&sid);
            if removed.is_some() {
                self.writer.enqueue(unsub_line(sid, None));
            }
            removed
        };
        let Some(shared) = removed else {
            return false;
        };
        if mode == Removal::Discard {
            self.pending.lock().retain(|s| s.sid() != sid);
        }
        shared.invalidate(mode == Removal::Discard);
        debug!(sid, mode = ?mode, "unsubscribed");
        true
    }

    /// Routes a MSG to its subscription. Messages for unknown sids are dropped.
    pub(crate) fn process_message(self: &Arc<Self>, msg: InboundMessage) {
        let sid = msg.sid();
        let Some(shared) = self.registry.lock().subs.get(&sid).cloned() else {
            trace!(sid, "dropping message for unknown subscription");
            return;
        };
        match shared.admit(msg, &Arc::downgrade(self)) {
            Admission::Queued { limit_reached } => {
                if shared.is_push() {
                    self.schedule(&shared);
                }
                if limit_reached {
                    self.remove(sid, Removal::Drain);
                }
            }
            Admission::Dropped { became_slow: true } => {
                warn!(sid, subject = shared.subject(), "slow consumer, dropping messages");
                self.hooks.slow_consumer(sid, shared.subject());
            }
            Admission::Dropped { .. } | Admission::Delivered | Admission::Rejected => {}
        }
    }

    fn schedule(&self, shared: &Arc<SubscriptionShared>) {
        if shared.mark_scheduled() {
            self.pending.lock().push_back(shared.clone());
            self.work.notify_one();
        }
    }

    /// Rebuilds the control queue for a new session: one SUB per live subscription, followed by
    /// the remaining allowance of armed auto-unsubscribes.
    pub(crate) fn restore_subscriptions(&self) {
        let registry = self.registry.lock();
        let mut sids: Vec<&u64> = registry.subs.keys().collect();
        sids.sort_unstable();
        let mut lines: Vec<Bytes> = Vec::with_capacity(sids.len());
        for sid in sids {
            let shared = &registry.subs[sid];
            lines.push(sub_line(shared.subject(), shared.queue_group(), *sid));
            if let Some(remaining) = shared.remaining_allowance() {
                lines.push(unsub_line(*sid, Some(remaining)));
            }
        }
        let count = registry.subs.len();
        self.writer.replace_queue(lines);
        drop(registry);
        debug!(subscriptions = count, "restored subscriptions");
    }

    /// Invalidates every subscription and stops their handlers. No UNSUB lines are sent.
    pub(crate) fn close_all(&self) {
        let subs: Vec<Arc<SubscriptionShared>> = {
            let mut registry = self.registry.lock();
            registry.subs.drain().map(|(_, s)| s).collect()
        };
        self.pending.lock().clear();
        self.root_handle.cancel(CancelReason::ConnectionStopped);
        for shared in &subs {
            shared.invalidate(true);
        }
        debug!(closed = subs.len(), "closed all subscriptions");
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.lock().subs.len()
    }

    /// Spawns the dispatcher task if it is not running.
    pub(crate) fn start_dispatcher(self: &Arc<Self>) {
        let mut slot = self.dispatcher.lock();
        if slot.is_some() {
            return;
        }
        let (token, handle) = self.root.child();
        let pool = self.clone();
        let task = tokio::spawn(async move { pool.dispatch_loop(token).await });
        *slot = Some((handle, task));
    }

    /// Stops the dispatcher and waits for the current handler to return.
    pub(crate) async fn stop_dispatcher(&self) {
        let running = self.dispatcher.lock().take();
        if let Some((handle, task)) = running {
            handle.cancel(CancelReason::ConnectionStopped);
            self.work.notify_one();
            if let Err(e) = task.await {
                warn!(error = %e, "dispatcher task failed");
            }
        }
    }

    async fn dispatch_loop(&self, token: CancelToken) {
        debug!("dispatcher started");
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = self.work.notified() => {}
            }
            loop {
                if token.is_cancelled() {
                    break;
                }
                let next = self.pending.lock().pop_front();
                let Some(shared) = next else {
                    break;
                };
                shared.clear_scheduled();
                shared.forward_pending().await;
            }
        }
        debug!("dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ConnectionStats;
    use crate::subscription::{MessageHandler, ReactiveHandler};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pool_with(options: &ClientOptions) -> (Arc<SubscriptionPool>, Arc<ProtocolWriter>) {
        let writer = Arc::new(ProtocolWriter::new(Arc::new(ConnectionStats::new())));
        (SubscriptionPool::new(writer.clone(), options), writer)
    }

    fn pool() -> (Arc<SubscriptionPool>, Arc<ProtocolWriter>) {
        pool_with(&ClientOptions::default())
    }

    fn msg(sid: u64, payload: &'static [u8]) -> InboundMessage {
        InboundMessage::new("a".into(), None, sid, Bytes::from_static(payload))
    }

    fn lines(writer: &ProtocolWriter) -> Vec<String> {
        writer
            .queued()
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    #[test]
    fn test_sids_are_sequential_and_sub_queued() {
        let (pool, writer) = pool();
        let a = pool.subscribe("a.*", None, Delivery::pull()).unwrap();
        let b = pool.subscribe("b", Some("workers"), Delivery::pull()).unwrap();
        assert_eq!(a.sid(), 1);
        assert_eq!(b.sid(), 2);
        assert_eq!(lines(&writer), vec!["SUB a.* 1\r\n", "SUB b workers 2\r\n"]);
    }

    #[test]
    fn test_invalid_subject_rejected() {
        let (pool, _) = pool();
        assert!(pool.subscribe("", None, Delivery::pull()).is_err());
        assert!(pool.subscribe("a", Some("bad queue"), Delivery::pull()).is_err());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_unsubscribe_removes_and_queues_unsub() {
        let (pool, writer) = pool();
        let sub = pool.subscribe("a", None, Delivery::pull()).unwrap();
        sub.unsubscribe().unwrap();
        assert!(!sub.is_valid());
        assert_eq!(pool.len(), 0);
        assert_eq!(lines(&writer), vec!["SUB a 1\r\n", "UNSUB 1\r\n"]);
        assert!(matches!(sub.unsubscribe(), Err(NatsError::BadSubscription)));
    }

    #[tokio::test]
    async fn test_auto_unsubscribe_drains() {
        let (pool, writer) = pool();
        let sub = pool.subscribe("a", None, Delivery::pull()).unwrap();
        sub.auto_unsubscribe(2).unwrap();
        pool.process_message(msg(1, b"1"));
        pool.process_message(msg(1, b"2"));
        pool.process_message(msg(1, b"3"));
        assert!(!sub.is_valid());
        assert_eq!(
            lines(&writer),
            vec!["SUB a 1\r\n", "UNSUB 1 2\r\n", "UNSUB 1\r\n"]
        );
        let token = CancelToken::none();
        let first = sub.next_message(None, &token).await.unwrap();
        let second = sub.next_message(None, &token).await.unwrap();
        assert_eq!(first.payload(), &Bytes::from_static(b"1"));
        assert_eq!(second.payload(), &Bytes::from_static(b"2"));
        assert!(matches!(
            sub.next_message(None, &token).await,
            Err(NatsError::BadSubscription)
        ));
    }

    #[test]
    fn test_auto_unsubscribe_already_reached() {
        let (pool, _) = pool();
        let sub = pool.subscribe("a", None, Delivery::pull()).unwrap();
        pool.process_message(msg(1, b"1"));
        pool.process_message(msg(1, b"2"));
        sub.auto_unsubscribe(2).unwrap();
        assert!(!sub.is_valid());
        assert_eq!(sub.stats().pending_msgs, 2);
    }

    #[test]
    fn test_unknown_sid_dropped() {
        let (pool, _) = pool();
        let sub = pool.subscribe("a", None, Delivery::pull()).unwrap();
        pool.process_message(msg(99, b"x"));
        assert_eq!(sub.stats().processed_msgs, 0);
    }

    #[test]
    fn test_slow_consumer_hook_fires_per_transition() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut options = ClientOptions::default();
        options.pending_msgs_limit = 1;
        options.hooks = EventHooks::default().on_slow_consumer(move |_sid, _subject| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (pool, _) = pool_with(&options);
        let sub = pool.subscribe("a", None, Delivery::pull()).unwrap();
        pool.process_message(msg(1, b"1"));
        pool.process_message(msg(1, b"2"));
        pool.process_message(msg(1, b"3"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(sub.is_slow_consumer());
    }

    #[test]
    fn test_restore_subscriptions_replaces_queue() {
        let (pool, writer) = pool();
        let a = pool.subscribe("a", None, Delivery::pull()).unwrap();
        let _b = pool.subscribe("b", Some("q"), Delivery::pull()).unwrap();
        a.auto_unsubscribe(5).unwrap();
        pool.process_message(msg(1, b"x"));
        writer.enqueue(Bytes::from_static(b"PING\r\n"));
        pool.restore_subscriptions();
        assert_eq!(
            lines(&writer),
            vec!["SUB a 1\r\n", "UNSUB 1 4\r\n", "SUB b q 2\r\n"]
        );
    }

    #[tokio::test]
    async fn test_close_all_invalidates() {
        let (pool, _) = pool();
        let sub = pool.subscribe("a", None, Delivery::pull()).unwrap();
        pool.close_all();
        assert!(!sub.is_valid());
        assert_eq!(pool.len(), 0);
        assert!(matches!(
            sub.next_message(None, &CancelToken::none()).await,
            Err(NatsError::BadSubscription)
        ));
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_in_order() {
        let (pool, _) = pool();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |m: InboundMessage, _t: &CancelToken| {
            let _ = tx.send(m.payload().clone());
            Ok(())
        });
        let root = pool.root_token().clone();
        let sub = pool
            .subscribe("a", None, Delivery::push(ReactiveHandler::Sync(handler), &root))
            .unwrap();
        pool.start_dispatcher();
        for p in [&b"1"[..], &b"2"[..], &b"3"[..]] {
            pool.process_message(InboundMessage::new(
                "a".into(),
                None,
                sub.sid(),
                Bytes::copy_from_slice(p),
            ));
        }
        for expected in [&b"1"[..], &b"2"[..], &b"3"[..]] {
            let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&got[..], expected);
        }
        pool.stop_dispatcher().await;
        assert_eq!(sub.stats().delivered_msgs, 3);
    }
}
