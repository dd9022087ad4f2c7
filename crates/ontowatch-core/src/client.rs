// ── Observable client ──
//
// The entry point for consumers. Wraps a `Store`, a `DataSource` for
// fetches, and an optional change feed, and hands out observations that
// keep their cache keys alive for as long as they are held.

use std::sync::Arc;

use futures_util::future::join_all;
use ontowatch_api::{ObjectInstance, ObjectSetSubscriber, ObjectTypeRef, PrimaryKey};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheKey, OptimisticId, OrderTerm, Status};
use crate::config::CacheConfig;
use crate::error::CoreError;
use crate::query::{
    AutoFetch, CollectionQuery, DataSource, ListDefinition, ObjectQuery, Query, spawn_revalidate,
    where_clause,
};
use crate::store::{BatchOptions, Store};
use crate::stream::{ListObservation, ObjectObservation};

// ── Options ──────────────────────────────────────────────────────────

/// Whether observing should hit the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ObserveMode {
    /// Revalidate unless the entry was fetched within the dedupe interval.
    #[default]
    Normal,
    /// Always revalidate.
    Force,
    /// Serve only what is cached.
    Offline,
}

/// Describes a list to observe.
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub type_ref: ObjectTypeRef,
    /// Where clause in the platform's JSON dialect. `Null` or `{}` matches all.
    pub filter: Value,
    pub order_by: Vec<OrderTerm>,
    pub page_size: Option<u32>,
    pub auto_fetch: AutoFetch,
    pub mode: ObserveMode,
}

impl ListOptions {
    pub fn new(type_ref: ObjectTypeRef) -> Self {
        Self {
            type_ref,
            filter: Value::Null,
            order_by: Vec::new(),
            page_size: None,
            auto_fetch: AutoFetch::default(),
            mode: ObserveMode::default(),
        }
    }

    /// Every object of a concrete type.
    pub fn objects(api_name: impl Into<String>) -> Self {
        Self::new(ObjectTypeRef::object(api_name))
    }

    /// Every object implementing an interface.
    pub fn interface(api_name: impl Into<String>) -> Self {
        Self::new(ObjectTypeRef::interface(api_name))
    }

    pub fn with_where(mut self, filter: Value) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, term: OrderTerm) -> Self {
        self.order_by.push(term);
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn auto_fetch(mut self, auto_fetch: AutoFetch) -> Self {
        self.auto_fetch = auto_fetch;
        self
    }

    pub fn mode(mut self, mode: ObserveMode) -> Self {
        self.mode = mode;
        self
    }
}

/// One change in an optimistic update.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEdit {
    Upsert(ObjectInstance),
    Delete {
        api_name: String,
        primary_key: PrimaryKey,
    },
}

// ── ObservableClient ─────────────────────────────────────────────────

/// Reactive access to ontology objects.
///
/// Cheaply cloneable via `Arc<ClientInner>`. Must be created inside a
/// Tokio runtime: construction spawns the cache garbage collector.
#[derive(Clone)]
pub struct ObservableClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    store: Store,
    source: Arc<dyn DataSource>,
    feed: Option<Arc<dyn ObjectSetSubscriber>>,
    cancel: CancellationToken,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl ObservableClient {
    /// A client without a change feed. Lists still maintain themselves from
    /// local writes.
    pub fn new(config: CacheConfig, source: Arc<dyn DataSource>) -> Self {
        Self::build(config, source, None)
    }

    /// A client whose observed lists also follow `feed`.
    pub fn with_feed(
        config: CacheConfig,
        source: Arc<dyn DataSource>,
        feed: Arc<dyn ObjectSetSubscriber>,
    ) -> Self {
        Self::build(config, source, Some(feed))
    }

    fn build(
        config: CacheConfig,
        source: Arc<dyn DataSource>,
        feed: Option<Arc<dyn ObjectSetSubscriber>>,
    ) -> Self {
        let store = Store::new(config);
        let cancel = CancellationToken::new();
        let gc_task = store.spawn_gc(cancel.child_token());
        Self {
            inner: Arc::new(ClientInner {
                store,
                source,
                feed,
                cancel,
                gc_task: Mutex::new(Some(gc_task)),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    // ── Observation ──────────────────────────────────────────────────

    /// Observe one object. The first payload reflects whatever is cached.
    pub fn observe_object(
        &self,
        api_name: &str,
        primary_key: impl Into<PrimaryKey>,
        mode: ObserveMode,
    ) -> ObjectObservation {
        let store = &self.inner.store;
        let primary_key = primary_key.into();
        let key = store.object_key(api_name, &primary_key);
        store.retain(&key);
        let observation = ObjectObservation::new(store.clone(), key.clone());

        let query = self.object_query(&key, api_name, primary_key);
        kick(query, mode);
        observation
    }

    /// Observe a filtered, ordered list.
    pub fn observe_list(&self, options: ListOptions) -> ListObservation {
        let store = &self.inner.store;
        let ListOptions {
            type_ref,
            filter,
            order_by,
            page_size,
            auto_fetch,
            mode,
        } = options;
        let definition = ListDefinition {
            filter: where_clause::canonicalize(&filter),
            page_size: page_size.or(store.config().default_page_size),
            type_ref,
            order_by,
        };
        let key = store.list_key(
            definition.type_ref.kind,
            &definition.type_ref.api_name,
            definition.filter.clone(),
            definition.order_by.clone(),
            definition.page_size,
        );
        store.retain(&key);

        let query = store.query(&key, || {
            Arc::new(CollectionQuery::new(
                store.clone(),
                key.clone(),
                Arc::clone(&self.inner.source),
                self.inner.feed.clone(),
                definition.clone(),
            ))
        });
        query.request_min_results(auto_fetch);
        let observation = ListObservation::new(store.clone(), Arc::clone(&query));
        kick(query, mode);
        observation
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Apply `edits` in a new optimistic overlay. Observers see them at once;
    /// `clear_optimistic` with the returned id rolls them back.
    pub fn apply_optimistic(
        &self,
        edits: impl IntoIterator<Item = ObjectEdit>,
    ) -> Result<OptimisticId, CoreError> {
        let store = &self.inner.store;
        let id = store.new_optimistic_id();
        store.batch(BatchOptions::optimistic(id), |batch| {
            for edit in edits {
                match edit {
                    ObjectEdit::Upsert(object) => {
                        batch.store_object(object);
                    }
                    ObjectEdit::Delete {
                        api_name,
                        primary_key,
                    } => {
                        let key = batch.object_key(&api_name, &primary_key);
                        batch.delete(&key, Status::Loaded);
                    }
                }
            }
            Ok(())
        })?;
        debug!(%id, "optimistic update applied");
        Ok(id)
    }

    pub fn clear_optimistic(&self, id: OptimisticId) {
        self.inner.store.clear_optimistic_layer(id);
    }

    /// Write a server-confirmed object, e.g. the result of an action.
    pub fn update_object(&self, object: ObjectInstance) -> Result<CacheKey, CoreError> {
        self.inner
            .store
            .batch(BatchOptions::default(), |batch| Ok(batch.store_object(object)))
    }

    /// Record a server-confirmed deletion.
    pub fn delete_object(&self, api_name: &str, primary_key: &PrimaryKey) -> Result<(), CoreError> {
        self.inner.store.batch(BatchOptions::default(), |batch| {
            let key = batch.object_key(api_name, primary_key);
            batch.delete(&key, Status::Loaded);
            Ok(())
        })
    }

    // ── Invalidation ─────────────────────────────────────────────────

    /// Re-fetch one object now.
    pub async fn invalidate_object(
        &self,
        api_name: &str,
        primary_key: impl Into<PrimaryKey>,
    ) -> Result<(), CoreError> {
        let primary_key = primary_key.into();
        let key = self.inner.store.object_key(api_name, &primary_key);
        self.object_query(&key, api_name, primary_key)
            .revalidate(true)
            .await
    }

    /// Re-fetch every live object and list query of `api_name`. Individual
    /// failures are logged and land in the affected entries' status.
    pub async fn invalidate_object_type(&self, api_name: &str) {
        let fetches: Vec<_> = self
            .inner
            .store
            .queries()
            .into_iter()
            .filter_map(|query| query.invalidate_object_type(api_name))
            .collect();
        let count = fetches.len();
        for result in join_all(fetches).await {
            if let Err(e) = result {
                debug!(api_name, error = %e, "invalidation fetch failed");
            }
        }
        debug!(api_name, queries = count, "object type invalidated");
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Stop the garbage collector and dispose every query. Observations
    /// stop receiving updates.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.gc_task.lock().take() {
            task.abort();
        }
        self.inner.store.shutdown();
    }

    fn object_query(&self, key: &CacheKey, api_name: &str, primary_key: PrimaryKey) -> Arc<ObjectQuery> {
        let store = &self.inner.store;
        store.query(key, || {
            Arc::new(ObjectQuery::new(
                store.clone(),
                key.clone(),
                Arc::clone(&self.inner.source),
                api_name,
                primary_key.clone(),
            ))
        })
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn kick<Q: Query>(query: Arc<Q>, mode: ObserveMode) {
    match mode {
        ObserveMode::Normal => spawn_revalidate(query, false),
        ObserveMode::Force => spawn_revalidate(query, true),
        ObserveMode::Offline => {}
    }
}
