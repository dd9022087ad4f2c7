// ── Queries ──
//
// A query owns one cache key and knows how to (re)fetch it. The store keeps
// one query per key, so concurrent observers of the same data share a
// single in-flight fetch.

pub mod collection_query;
pub mod object_query;
pub mod sorting;
pub mod where_clause;

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use ontowatch_api::{ObjectInstance, ObjectTypeRef, PrimaryKey};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheKey, Changes, OptimisticId, OrderTerm, Status};
use crate::error::CoreError;
use crate::store::Store;

pub use collection_query::{AutoFetch, CollectionQuery, ListDefinition};
pub use object_query::ObjectQuery;
pub use sorting::{InsertionOrder, OrderBySort, SortingStrategy};
pub use where_clause::Match;

/// Behaviour shared by every query the store tracks.
pub trait Query: Send + Sync + 'static {
    fn cache_key(&self) -> &CacheKey;

    /// Fetch from the source. Joins a fetch already in flight; without
    /// `force`, skips the network if the entry is loaded and fresh.
    fn revalidate(self: Arc<Self>, force: bool) -> BoxFuture<'static, Result<(), CoreError>>;

    /// React to a committed batch. Queries that write in response must
    /// thread `changes` through `Store::batch_with_changes`.
    fn on_changes(self: Arc<Self>, changes: &mut Changes, optimistic_id: Option<OptimisticId>);

    /// Revalidate if this query covers objects of `api_name`.
    fn invalidate_object_type(
        self: Arc<Self>,
        api_name: &str,
    ) -> Option<BoxFuture<'static, Result<(), CoreError>>> {
        (self.cache_key().api_name() == api_name).then(|| self.revalidate(true))
    }

    /// Cancel in-flight work. Called when the key is evicted.
    fn dispose(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

// ── Data source ──────────────────────────────────────────────────────

/// One page request for a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub object_type: ObjectTypeRef,
    /// Canonical where clause.
    pub filter: Arc<Value>,
    pub order_by: Vec<OrderTerm>,
    pub page_size: Option<u32>,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub data: Vec<ObjectInstance>,
    pub next_page_token: Option<String>,
    pub total_count: Option<u64>,
}

/// Where queries load data from. Usually backed by the platform's REST API.
pub trait DataSource: Send + Sync {
    /// `Ok(None)` means the object does not exist.
    fn fetch_object<'a>(
        &'a self,
        api_name: &'a str,
        primary_key: &'a PrimaryKey,
    ) -> BoxFuture<'a, Result<Option<ObjectInstance>, CoreError>>;

    fn fetch_page(&self, request: PageRequest) -> BoxFuture<'_, Result<Page, CoreError>>;
}

// ── Shared fetch machinery ───────────────────────────────────────────

type SharedFetch = Shared<BoxFuture<'static, Result<(), Arc<CoreError>>>>;
type FetchFuture = BoxFuture<'static, Result<(), CoreError>>;

struct Pending {
    fetch: SharedFetch,
    /// Loading a further page rather than the whole entry.
    paging: bool,
}

#[derive(Default)]
struct FetchState {
    pending: Option<Pending>,
    generation: u64,
    last_success: Option<Instant>,
}

/// Request coalescing and cancellation shared by the concrete queries.
pub(crate) struct QueryCore {
    pub(crate) store: Store,
    pub(crate) key: CacheKey,
    pub(crate) cancel: CancellationToken,
    fetch: Arc<Mutex<FetchState>>,
}

impl QueryCore {
    pub(crate) fn new(store: Store, key: CacheKey) -> Self {
        Self {
            store,
            key,
            cancel: CancellationToken::new(),
            fetch: Arc::new(Mutex::new(FetchState::default())),
        }
    }

    pub(crate) fn is_fetching(&self) -> bool {
        self.fetch.lock().pending.is_some()
    }

    /// The fetch in flight, and whether it is a page load.
    pub(crate) fn in_flight(&self) -> Option<(FetchFuture, bool)> {
        let state = self.fetch.lock();
        let pending = state.pending.as_ref()?;
        Some((self.await_shared(pending.fetch.clone()), pending.paging))
    }

    /// Join the fetch in flight or start one with `start`.
    pub(crate) fn revalidate<F>(
        &self,
        force: bool,
        start: impl FnOnce(CancellationToken) -> F,
    ) -> BoxFuture<'static, Result<(), CoreError>>
    where
        F: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        self.start_fetch(force, false, start)
    }

    /// Like `revalidate(true, ..)`, marking the fetch as a page load.
    pub(crate) fn fetch_page<F>(
        &self,
        start: impl FnOnce(CancellationToken) -> F,
    ) -> BoxFuture<'static, Result<(), CoreError>>
    where
        F: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        self.start_fetch(true, true, start)
    }

    fn start_fetch<F>(
        &self,
        force: bool,
        paging: bool,
        start: impl FnOnce(CancellationToken) -> F,
    ) -> BoxFuture<'static, Result<(), CoreError>>
    where
        F: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        let mut state = self.fetch.lock();
        if let Some(pending) = &state.pending {
            return self.await_shared(pending.fetch.clone());
        }
        if self.cancel.is_cancelled() {
            return Box::pin(async { Err(CoreError::Cancelled) });
        }
        if !force && self.is_fresh(&state) {
            tracing::trace!(key = %self.key, "fresh, skipping fetch");
            return Box::pin(async { Ok(()) });
        }

        state.generation += 1;
        let generation = state.generation;
        let task = tokio::spawn(start(self.cancel.child_token()));
        let tracker = Arc::clone(&self.fetch);
        let key = self.key.clone();

        let shared = async move {
            let result = match task.await {
                Ok(result) => result.map_err(Arc::new),
                Err(e) => Err(Arc::new(CoreError::Fetch {
                    key: key.to_string(),
                    message: e.to_string(),
                })),
            };
            let mut state = tracker.lock();
            if state.generation == generation {
                state.pending = None;
                if result.is_ok() {
                    state.last_success = Some(Instant::now());
                }
            }
            result
        }
        .boxed()
        .shared();

        // Drive to completion even if every caller drops its future.
        tokio::spawn(shared.clone());
        state.pending = Some(Pending {
            fetch: shared.clone(),
            paging,
        });
        drop(state);
        self.await_shared(shared)
    }

    /// Loaded, and written or fetched within the dedupe interval. Entries
    /// written by other queries (list pages, feed updates) count too.
    fn is_fresh(&self, state: &FetchState) -> bool {
        let dedupe = self.store.config().dedupe_interval;
        let Some(entry) = self.store.get_value(&self.key) else {
            return false;
        };
        if entry.status != Status::Loaded {
            return false;
        }
        let fetched_recently = state.last_success.is_some_and(|last| last.elapsed() < dedupe);
        let age_ms = chrono::Utc::now().timestamp_millis() - entry.last_updated;
        let written_recently =
            u128::try_from(age_ms).is_ok_and(|age| age < dedupe.as_millis());
        fetched_recently || written_recently
    }

    fn await_shared(&self, shared: SharedFetch) -> BoxFuture<'static, Result<(), CoreError>> {
        let key = self.key.to_string();
        Box::pin(async move {
            shared.await.map_err(|e| match &*e {
                CoreError::Cancelled => CoreError::Cancelled,
                other => CoreError::Fetch {
                    key,
                    message: other.to_string(),
                },
            })
        })
    }

    pub(crate) fn dispose(&self) {
        self.cancel.cancel();
    }
}

/// Spawn `revalidate` in the background, logging failures.
pub(crate) fn spawn_revalidate<Q: Query>(query: Arc<Q>, force: bool) {
    let key = query.cache_key().clone();
    let fetch = query.revalidate(force);
    tokio::spawn(async move {
        match fetch.await {
            Ok(()) | Err(CoreError::Cancelled) => {}
            Err(e) => tracing::warn!(%key, error = %e, "background revalidation failed"),
        }
    });
}

/// Wait for `fetch` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fetch: impl Future<Output = Result<T, CoreError>>,
) -> Result<T, CoreError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CoreError::Cancelled),
        result = fetch => result,
    }
}
