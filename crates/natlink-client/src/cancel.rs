//! Cooperative cancellation for every blocking client operation.
//!
//! A [`CancelToken`] is passed to publish, pull, request and start waits. It composes with an
//! optional timeout through [`bounded`]: whichever fires first decides the outcome, and
//! cancellation is always reported as [`NatsError::Cancelled`], never as a timeout.

use crate::error::{NatsError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reasons for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Explicit application request.
    #[default]
    UserRequested,
    /// The owning connection is stopping.
    ConnectionStopped,
    /// The subscription was removed.
    Unsubscribed,
    /// A handler asked to stop further delivery.
    HandlerStopped,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::ConnectionStopped => write!(f, "ConnectionStopped"),
            CancelReason::Unsubscribed => write!(f, "Unsubscribed"),
            CancelReason::HandlerStopped => write!(f, "HandlerStopped"),
        }
    }
}

type ReasonSlot = Arc<Mutex<Option<CancelReason>>>;

/// A cloneable cancellation token observed by waiting operations.
#[derive(Clone)]
pub struct CancelToken {
    inner: CancellationToken,
    // own slot first, then ancestors
    reasons: Vec<ReasonSlot>,
}

/// The handle that triggers cancellation of its paired token.
#[derive(Clone)]
pub struct CancelHandle {
    inner: CancellationToken,
    reason: ReasonSlot,
}

/// Creates a new token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let inner = CancellationToken::new();
    let reason: ReasonSlot = Arc::new(Mutex::new(None));
    (
        CancelToken {
            inner: inner.clone(),
            reasons: vec![reason.clone()],
        },
        CancelHandle { inner, reason },
    )
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn none() -> Self {
        Self {
            inner: CancellationToken::new(),
            reasons: Vec::new(),
        }
    }

    /// Returns true once the token (or any ancestor) has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// The first recorded reason along the ancestor chain.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        if !self.is_cancelled() {
            return None;
        }
        self.reasons
            .iter()
            .find_map(|slot| *slot.lock())
            .or(Some(CancelReason::UserRequested))
    }

    /// Creates a child token cancelled together with this one, but cancellable on its own.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let inner = self.inner.child_token();
        let reason: ReasonSlot = Arc::new(Mutex::new(None));
        let mut reasons = Vec::with_capacity(self.reasons.len() + 1);
        reasons.push(reason.clone());
        reasons.extend(self.reasons.iter().cloned());
        (
            CancelToken {
                inner: inner.clone(),
                reasons,
            },
            CancelHandle { inner, reason },
        )
    }

    /// Completes when the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelHandle {
    /// Triggers cancellation. Only the first reason is kept.
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.cancel();
    }

    /// Returns true once cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Runs `fut` until it completes, `timeout` elapses or `token` fires.
pub async fn bounded<F>(
    fut: F,
    timeout: Option<Duration>,
    token: &CancelToken,
    operation: &str,
) -> Result<F::Output>
where
    F: Future,
{
    if token.is_cancelled() {
        return Err(NatsError::Cancelled);
    }
    let guarded = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| NatsError::timeout(operation, limit.as_millis() as u64)),
            None => Ok(fut.await),
        }
    };
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(NatsError::Cancelled),
        out = guarded => out,
    }
}

/// Sleeps for `delay`. Returns true if `token` fired first.
pub async fn sleep_or_cancel(delay: Duration, token: &CancelToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
