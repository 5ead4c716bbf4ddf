//! The single write path to the server.
//!
//! Every byte sent to the server passes through one tokio mutex around the buffered write half, so
//! a PUB frame, a PING and queued SUB/UNSUB lines never interleave. SUB/UNSUB/PONG/PING lines are
//! queued here and flushed by the connection worker; publishes write directly under the lock.

use crate::cancel::{bounded, CancelToken};
use crate::error::{NatsError, Result};
use crate::message::OutboundMessage;
use crate::metrics::ConnectionStats;
use crate::protocol::{pub_header, CRLF};
use crate::subject::validate_subject;
use crate::transport::TransportWriter;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Whether application writes can proceed.
#[derive(Debug, Clone)]
pub(crate) enum LinkState {
    /// Handshake not (yet) complete; writers wait.
    Pending,
    /// Logically connected.
    Connected,
    /// The last session failed before reaching logical connect.
    Failed(NatsError),
    /// Terminal.
    Closed,
}

pub(crate) struct ProtocolWriter {
    sink: tokio::sync::Mutex<Option<TransportWriter>>,
    control: Mutex<Vec<Bytes>>,
    control_ready: Notify,
    link: watch::Sender<LinkState>,
    max_payload: AtomicU64,
    stats: Arc<ConnectionStats>,
}

impl ProtocolWriter {
    pub(crate) fn new(stats: Arc<ConnectionStats>) -> Self {
        let (link, _) = watch::channel(LinkState::Pending);
        Self {
            sink: tokio::sync::Mutex::new(None),
            control: Mutex::new(Vec::new()),
            control_ready: Notify::new(),
            link,
            max_payload: AtomicU64::new(0),
            stats,
        }
    }

    /// Queues a protocol line for the worker to flush.
    pub(crate) fn enqueue(&self, line: Bytes) {
        self.control.lock().push(line);
        self.control_ready.notify_one();
    }

    /// Replaces everything queued with `lines`.
    pub(crate) fn replace_queue(&self, lines: Vec<Bytes>) {
        *self.control.lock() = lines;
        self.control_ready.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> Vec<Bytes> {
        self.control.lock().clone()
    }

    /// Completes when lines were queued since the last wake-up.
    pub(crate) async fn control_signal(&self) {
        self.control_ready.notified().await
    }

    /// Writes every queued line under the writer lock.
    pub(crate) async fn flush_control(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let lines = std::mem::take(&mut *self.control.lock());
        if lines.is_empty() {
            return Ok(());
        }
        let Some(writer) = sink.as_mut() else {
            self.requeue_front(lines);
            return Err(NatsError::NotConnected);
        };
        let parts: Vec<&[u8]> = lines.iter().map(|l| l.as_ref()).collect();
        writer.write_parts(&parts).await
    }

    fn requeue_front(&self, mut lines: Vec<Bytes>) {
        let mut queue = self.control.lock();
        lines.append(&mut queue);
        *queue = lines;
    }

    /// Installs the write half of a freshly handshaken session.
    pub(crate) async fn attach(&self, writer: TransportWriter, max_payload: u64) {
        self.max_payload.store(max_payload, Ordering::SeqCst);
        *self.sink.lock().await = Some(writer);
    }

    /// Removes and closes the write half.
    pub(crate) async fn detach(&self) {
        if let Some(mut writer) = self.sink.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub(crate) fn set_max_payload(&self, max_payload: u64) {
        self.max_payload.store(max_payload, Ordering::SeqCst);
    }

    pub(crate) fn max_payload(&self) -> u64 {
        self.max_payload.load(Ordering::SeqCst)
    }

    pub(crate) fn set_link(&self, state: LinkState) {
        self.link.send_replace(state);
    }

    #[cfg(test)]
    pub(crate) fn link(&self) -> LinkState {
        self.link.borrow().clone()
    }

    /// Waits until the session is logically connected.
    pub(crate) async fn wait_connected(
        &self,
        timeout: Option<Duration>,
        token: &CancelToken,
    ) -> Result<()> {
        let mut rx = self.link.subscribe();
        let wait = async move {
            loop {
                match &*rx.borrow_and_update() {
                    LinkState::Connected => return Ok(()),
                    LinkState::Failed(error) => return Err(error.clone()),
                    LinkState::Closed => return Err(NatsError::ConnectionClosed),
                    LinkState::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return Err(NatsError::ConnectionClosed);
                }
            }
        };
        bounded(wait, timeout, token, "logical connect").await?
    }

    /// Publishes `msg` once logically connected.
    pub(crate) async fn publish(
        &self,
        msg: &OutboundMessage,
        timeout: Option<Duration>,
        token: &CancelToken,
    ) -> Result<()> {
        validate_subject(msg.subject())?;
        if let Some(reply) = msg.reply_to() {
            validate_subject(reply)?;
        }
        self.wait_connected(timeout, token).await?;

        let size = msg.payload().len();
        let max_payload = self.max_payload();
        if max_payload > 0 && size as u64 > max_payload {
            return Err(NatsError::MaxPayload { size, max_payload });
        }

        let header = pub_header(msg.subject(), msg.reply_to(), size);
        {
            let mut sink = self.sink.lock().await;
            let writer = sink.as_mut().ok_or(NatsError::NotConnected)?;
            writer.write_parts(&[&header[..], msg.payload(), CRLF]).await?;
        }
        self.stats.record_out(size);
        Ok(())
    }
}
