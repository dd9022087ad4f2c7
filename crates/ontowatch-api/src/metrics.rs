// ── Subscriber metrics ──
//
// Decorator over any `ObjectSetSubscriber`: wraps each listener so events
// are counted on their way through. The wrapped subscriber is untouched.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::future::BoxFuture;

use crate::error::Error;
use crate::listener::{ObjectSetListener, ObjectUpdate, SubscriptionError};
use crate::subscriber::{ObjectSetSubscriber, SubscribeSpec, SubscriptionHandle};

/// Counters shared by every subscription made through one `MeteredSubscriber`.
#[derive(Debug, Default)]
pub struct FeedMetrics {
    subscriptions: AtomicU64,
    active: AtomicU64,
    changes: AtomicU64,
    out_of_date: AtomicU64,
    errors: AtomicU64,
    terminal_errors: AtomicU64,
}

/// Point-in-time copy of `FeedMetrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedMetricsSnapshot {
    pub subscriptions: u64,
    pub active: u64,
    pub changes: u64,
    pub out_of_date: u64,
    pub errors: u64,
    pub terminal_errors: u64,
}

impl FeedMetrics {
    pub fn snapshot(&self) -> FeedMetricsSnapshot {
        FeedMetricsSnapshot {
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            changes: self.changes.load(Ordering::Relaxed),
            out_of_date: self.out_of_date.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            terminal_errors: self.terminal_errors.load(Ordering::Relaxed),
        }
    }

    /// Counts a subscription out of `active` once, however it ends.
    fn finish(&self, finished: &AtomicBool) {
        if finished.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

pub struct MeteredSubscriber<S> {
    inner: S,
    metrics: Arc<FeedMetrics>,
}

impl<S: ObjectSetSubscriber> MeteredSubscriber<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            metrics: Arc::new(FeedMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<FeedMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl<S: ObjectSetSubscriber> ObjectSetSubscriber for MeteredSubscriber<S> {
    fn subscribe(
        &self,
        spec: SubscribeSpec,
        listener: Arc<dyn ObjectSetListener>,
    ) -> BoxFuture<'_, Result<SubscriptionHandle, Error>> {
        let metrics = Arc::clone(&self.metrics);
        let finished = Arc::new(AtomicBool::new(false));
        let counting = Arc::new(CountingListener {
            inner: listener,
            metrics: Arc::clone(&metrics),
            finished: Arc::clone(&finished),
        });
        Box::pin(async move {
            // Counted up front: a terminal error can arrive before `subscribe` returns.
            metrics.active.fetch_add(1, Ordering::Relaxed);
            let handle = match self.inner.subscribe(spec, counting).await {
                Ok(handle) => handle,
                Err(e) => {
                    metrics.finish(&finished);
                    return Err(e);
                }
            };
            metrics.subscriptions.fetch_add(1, Ordering::Relaxed);

            let counted = handle.clone();
            let on_cancel = Arc::clone(&metrics);
            Ok(SubscriptionHandle::new(move || {
                counted.unsubscribe();
                on_cancel.finish(&finished);
            }))
        })
    }
}

struct CountingListener {
    inner: Arc<dyn ObjectSetListener>,
    metrics: Arc<FeedMetrics>,
    finished: Arc<AtomicBool>,
}

impl ObjectSetListener for CountingListener {
    fn on_change(&self, update: ObjectUpdate) {
        self.metrics.changes.fetch_add(1, Ordering::Relaxed);
        self.inner.on_change(update);
    }

    fn on_successful_subscription(&self) {
        self.inner.on_successful_subscription();
    }

    fn on_out_of_date(&self) {
        self.metrics.out_of_date.fetch_add(1, Ordering::Relaxed);
        self.inner.on_out_of_date();
    }

    fn on_error(&self, error: SubscriptionError) {
        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
        if error.subscription_closed {
            self.metrics.terminal_errors.fetch_add(1, Ordering::Relaxed);
            self.metrics.finish(&self.finished);
        }
        self.inner.on_error(error);
    }

    fn on_initial_load_complete(&self) {
        self.inner.on_initial_load_complete();
    }
}
