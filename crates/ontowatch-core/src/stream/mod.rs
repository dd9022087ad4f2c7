// ── Reactive observations ──
//
// Handles returned to callers of `observe_object` and `observe_list`. Each
// holds a reference on its cache key for as long as it lives; dropping the
// handle is how a caller unsubscribes.

pub(crate) mod connector;
mod payload;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::cache::CacheKey;
use crate::error::CoreError;
use crate::query::CollectionQuery;
use crate::store::{Snapshot, Store};

pub use payload::{FeedStatus, ListPayload, ObjectPayload};

// ── Object observation ───────────────────────────────────────────────

/// A live view of one cached object.
pub struct ObjectObservation {
    store: Store,
    key: CacheKey,
    receiver: watch::Receiver<Snapshot>,
}

impl ObjectObservation {
    /// `key` must already be retained on behalf of this observation.
    pub(crate) fn new(store: Store, key: CacheKey) -> Self {
        let receiver = store.subject(&key);
        Self {
            store,
            key,
            receiver,
        }
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.key
    }

    /// The latest payload.
    pub fn current(&self) -> ObjectPayload {
        ObjectPayload::from(&*self.receiver.borrow())
    }

    /// Wait for the next change. Returns `None` once the key is evicted or
    /// the store shuts down.
    pub async fn changed(&mut self) -> Option<ObjectPayload> {
        self.receiver.changed().await.ok()?;
        Some(ObjectPayload::from(&*self.receiver.borrow_and_update()))
    }

    /// Convert into a `Stream` that yields the current payload first.
    pub fn into_stream(self) -> ObjectStream {
        ObjectStream {
            inner: WatchStream::new(self.receiver.clone()),
            _observation: self,
        }
    }
}

impl Drop for ObjectObservation {
    fn drop(&mut self) {
        self.store.release(&self.key);
    }
}

/// `Stream` adapter for `ObjectObservation`.
pub struct ObjectStream {
    inner: WatchStream<Snapshot>,
    _observation: ObjectObservation,
}

impl Stream for ObjectStream {
    type Item = ObjectPayload;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|snapshot| snapshot.as_ref().map(ObjectPayload::from))
    }
}

// ── List observation ─────────────────────────────────────────────────

/// A live view of one cached list, including its members and feed state.
pub struct ListObservation {
    store: Store,
    query: Arc<CollectionQuery>,
    receiver: watch::Receiver<Arc<ListPayload>>,
}

impl ListObservation {
    /// `query`'s key must already be retained on behalf of this observation.
    pub(crate) fn new(store: Store, query: Arc<CollectionQuery>) -> Self {
        let receiver = query.attach();
        Self {
            store,
            query,
            receiver,
        }
    }

    pub fn cache_key(&self) -> &CacheKey {
        self.query.key()
    }

    pub fn current(&self) -> Arc<ListPayload> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change. Returns `None` once the query is gone.
    pub async fn changed(&mut self) -> Option<Arc<ListPayload>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Load the next page. Concurrent calls share one request; resolves
    /// immediately when there is nothing more to load.
    pub fn fetch_more(&self) -> BoxFuture<'static, Result<(), CoreError>> {
        self.query.fetch_more()
    }

    pub fn into_stream(self) -> ListStream {
        ListStream {
            inner: WatchStream::new(self.receiver.clone()),
            _observation: self,
        }
    }
}

impl Drop for ListObservation {
    fn drop(&mut self) {
        self.query.detach();
        self.store.release(self.query.key());
    }
}

/// `Stream` adapter for `ListObservation`.
pub struct ListStream {
    inner: WatchStream<Arc<ListPayload>>,
    _observation: ListObservation,
}

impl Stream for ListStream {
    type Item = Arc<ListPayload>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
