// ── Collection query ──
//
// Loads a filtered, ordered list page by page and keeps it current. Object
// writes from anywhere in the store are matched against the where clause
// after every batch, and while the list is observed an optional change-feed
// subscription pushes server-side adds and removals straight into it.

use std::any::Any;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use ontowatch_api::{
    ObjectInstance, ObjectSetListener, ObjectSetSubscriber, ObjectState, ObjectTypeRef,
    ObjectUpdate, SubscribeSpec, SubscriptionError, SubscriptionHandle, TypeKind,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::{
    CacheKey, CacheValue, Canonical, Changes, CollectionData, OptimisticId, OrderTerm, Status,
};
use crate::error::CoreError;
use crate::store::{BatchContext, BatchOptions, Store};
use crate::stream::connector;
use crate::stream::{FeedStatus, ListPayload};

use super::sorting::{InsertionOrder, OrderBySort, SortingStrategy};
use super::where_clause::{self, Match};
use super::{DataSource, Page, PageRequest, Query, QueryCore, cancellable, spawn_revalidate};

/// How many results a list loads before it reports `Loaded`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AutoFetch {
    /// Only the first page; more on `fetch_more`.
    #[default]
    FirstPage,
    /// Keep fetching pages until at least this many objects are loaded.
    AtLeast(usize),
    /// Every page.
    All,
}

impl AutoFetch {
    fn min_results(self) -> usize {
        match self {
            Self::FirstPage => 0,
            Self::AtLeast(n) => n,
            Self::All => usize::MAX,
        }
    }
}

/// Describes the list a `CollectionQuery` maintains.
#[derive(Debug, Clone)]
pub struct ListDefinition {
    pub type_ref: ObjectTypeRef,
    /// Canonical where clause.
    pub filter: Canonical,
    pub order_by: Vec<OrderTerm>,
    pub page_size: Option<u32>,
}

#[derive(Default)]
struct ListState {
    next_page_token: Option<String>,
    min_results: usize,
    observers: usize,
    feed: Option<SubscriptionHandle>,
    connection: Option<CancellationToken>,
}

pub struct CollectionQuery {
    core: QueryCore,
    source: Arc<dyn DataSource>,
    feed: Option<Arc<dyn ObjectSetSubscriber>>,
    definition: ListDefinition,
    sorting: Box<dyn SortingStrategy>,
    state: Mutex<ListState>,
    feed_status: watch::Sender<FeedStatus>,
    payload: watch::Sender<Arc<ListPayload>>,
}

impl CollectionQuery {
    pub fn new(
        store: Store,
        key: CacheKey,
        source: Arc<dyn DataSource>,
        feed: Option<Arc<dyn ObjectSetSubscriber>>,
        definition: ListDefinition,
    ) -> Self {
        let sorting: Box<dyn SortingStrategy> = if definition.order_by.is_empty() {
            Box::new(InsertionOrder)
        } else {
            Box::new(OrderBySort::new(definition.order_by.clone()))
        };
        Self {
            core: QueryCore::new(store, key),
            source,
            feed,
            definition,
            sorting,
            state: Mutex::new(ListState::default()),
            feed_status: watch::channel(FeedStatus::Disabled).0,
            payload: watch::channel(Arc::new(ListPayload::default())).0,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.core.key
    }

    pub fn store(&self) -> &Store {
        &self.core.store
    }

    pub fn definition(&self) -> &ListDefinition {
        &self.definition
    }

    pub fn has_more(&self) -> bool {
        self.state.lock().next_page_token.is_some()
    }

    pub fn feed_status(&self) -> watch::Receiver<FeedStatus> {
        self.feed_status.subscribe()
    }

    /// Raise the number of results a full fetch loads. Never lowers it.
    pub fn request_min_results(&self, auto_fetch: AutoFetch) {
        let mut state = self.state.lock();
        state.min_results = state.min_results.max(auto_fetch.min_results());
    }

    pub(crate) fn publish(&self, payload: ListPayload) {
        self.payload.send_replace(Arc::new(payload));
    }

    // ── Fetching ─────────────────────────────────────────────────────

    /// Load the page after the last one loaded. Joins a page load already
    /// in flight; waits for a full load in flight first so the page token
    /// is current.
    pub fn fetch_more(self: &Arc<Self>) -> BoxFuture<'static, Result<(), CoreError>> {
        let query = Arc::clone(self);
        Box::pin(async move {
            if let Some((pending, paging)) = query.core.in_flight() {
                pending.await?;
                if paging {
                    return Ok(());
                }
            }
            if !query.has_more() {
                return Ok(());
            }
            let pager = Arc::clone(&query);
            query
                .core
                .fetch_page(move |cancel| async move {
                    let token = pager.state.lock().next_page_token.clone();
                    match token {
                        Some(token) => pager.fetch_pages(Some(token), 0, cancel).await,
                        None => Ok(()),
                    }
                })
                .await
        })
    }

    /// Fetch pages starting at `start` (the first page when `None`) until
    /// `min_results` objects are loaded or the source runs out.
    async fn fetch_pages(
        self: Arc<Self>,
        start: Option<String>,
        min_results: usize,
        cancel: CancellationToken,
    ) -> Result<(), CoreError> {
        let store = &self.core.store;
        let key = &self.core.key;
        let mut append = start.is_some();
        let mut page_token = start;
        let mut loaded = if append {
            store
                .get_truth(key)
                .and_then(|entry| entry.value.as_collection().map(|d| d.data.len()))
                .unwrap_or_default()
        } else {
            0
        };

        store.batch(BatchOptions::default(), |batch| {
            batch.set_status(key, Status::Loading);
            Ok(())
        })?;

        loop {
            let request = self.page_request(page_token.take());
            let page = match cancellable(&cancel, self.source.fetch_page(request)).await {
                Ok(page) => page,
                Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                Err(e) => {
                    self.write_error();
                    return Err(e);
                }
            };
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let Page {
                data,
                next_page_token,
                total_count,
            } = page;
            loaded += data.len();
            let more = next_page_token.is_some() && loaded < min_results;
            let status = if more { Status::Loading } else { Status::Loaded };
            self.state.lock().next_page_token.clone_from(&next_page_token);

            store.batch(BatchOptions::default(), |batch| {
                let keys: Vec<CacheKey> = data
                    .into_iter()
                    .map(|object| batch.store_object(object))
                    .collect();
                self.update_list(batch, keys, status, append, total_count);
                Ok(())
            })?;
            tracing::debug!(%key, loaded, more, "list page stored");

            if !more {
                return Ok(());
            }
            append = true;
            page_token = next_page_token;
        }
    }

    fn page_request(&self, page_token: Option<String>) -> PageRequest {
        PageRequest {
            object_type: self.definition.type_ref.clone(),
            filter: self.definition.filter.shared_value(),
            order_by: self.definition.order_by.clone(),
            page_size: self.definition.page_size,
            page_token,
        }
    }

    fn write_error(&self) {
        let result = self.core.store.batch(BatchOptions::default(), |batch| {
            batch.set_status(&self.core.key, Status::Error);
            Ok(())
        });
        if let Err(e) = result {
            tracing::debug!(key = %self.core.key, error = %e, "could not record fetch error");
        }
    }

    // ── List maintenance ─────────────────────────────────────────────

    /// The collection currently stored for this list, if it was ever loaded.
    fn current_list(&self, batch: &BatchContext<'_>) -> Option<(Arc<CollectionData>, Status)> {
        let entry = batch.read(&self.core.key)?;
        let data = entry.value.as_collection()?;
        Some((Arc::clone(data), entry.status))
    }

    /// Replace (or extend) the list with `keys`, sorted and deduplicated.
    /// Adjusts member reference counts for truth writes and skips the write
    /// entirely when neither the members nor the status changed.
    fn update_list(
        &self,
        batch: &mut BatchContext<'_>,
        keys: Vec<CacheKey>,
        status: Status,
        append: bool,
        total_count: Option<u64>,
    ) {
        let key = &self.core.key;
        let existing = batch.read(key);
        let previous = existing
            .as_ref()
            .and_then(|entry| entry.value.as_collection().cloned());
        let old: &[CacheKey] = previous.as_ref().map_or(&[], |d| d.data.as_slice());

        let combined: Vec<CacheKey> = if append {
            old.iter().cloned().chain(keys).collect()
        } else {
            keys
        };
        let sorted = {
            let view: &BatchContext<'_> = batch;
            let lookup = |k: &CacheKey| {
                view.read(k)
                    .and_then(|entry| entry.value.as_object().cloned())
            };
            self.sorting.sort(combined, &lookup)
        };
        let mut seen = HashSet::new();
        let data: Vec<CacheKey> = sorted
            .into_iter()
            .filter(|k| seen.insert(k.clone()))
            .collect();

        // Overlays come and go; only truth membership holds references.
        if !batch.optimistic_write() {
            let old_set: HashSet<&CacheKey> = old.iter().collect();
            let new_set: HashSet<&CacheKey> = data.iter().collect();
            for member in data.iter().filter(|k| !old_set.contains(k)) {
                batch.retain(member);
            }
            for member in old.iter().filter(|k| !new_set.contains(k)) {
                batch.release(member);
            }
        }

        let collection = CollectionData {
            data,
            total_count: total_count.or_else(|| previous.as_ref().and_then(|d| d.total_count)),
        };
        match existing {
            Some(entry) if previous.as_deref() == Some(&collection) => {
                if entry.status != status {
                    batch.write(key, entry.value, status);
                }
            }
            _ => {
                batch.write(key, CacheValue::Collection(Arc::new(collection)), status);
            }
        }
        batch.changes().register_list(key.clone());
    }

    fn apply_feed_update(self: &Arc<Self>, update: &ObjectUpdate) {
        let store = &self.core.store;
        let result = match update.state {
            ObjectState::AddedOrUpdated => store.batch(BatchOptions::default(), |batch| {
                let member = batch.store_object((*update.object).clone());
                let Some((list, status)) = self.current_list(batch) else {
                    return Ok(false);
                };
                let keys = list.data.iter().cloned().chain([member]).collect();
                self.update_list(batch, keys, status, false, None);
                Ok(false)
            }),
            ObjectState::Removed => store.batch(BatchOptions::default(), |batch| {
                let member = object_key(batch, &update.object);
                let Some((list, status)) = self.current_list(batch) else {
                    return Ok(false);
                };
                if status != Status::Loaded {
                    return Ok(true);
                }
                if list.data.contains(&member) {
                    let keys = list.data.iter().filter(|k| **k != member).cloned().collect();
                    self.update_list(batch, keys, status, false, None);
                }
                Ok(false)
            }),
        };
        match result {
            Ok(true) => spawn_revalidate(Arc::clone(self), true),
            Ok(false) => {}
            Err(e) => tracing::warn!(key = %self.core.key, error = %e, "feed update dropped"),
        }
    }

    // ── Observers and the change feed ────────────────────────────────

    /// Register an observer. The first one starts the payload connector
    /// and the feed subscription.
    pub(crate) fn attach(self: &Arc<Self>) -> watch::Receiver<Arc<ListPayload>> {
        let connection = {
            let mut state = self.state.lock();
            state.observers += 1;
            if state.observers == 1 {
                let token = self.core.cancel.child_token();
                state.connection = Some(token.clone());
                Some(token)
            } else {
                None
            }
        };

        if let Some(token) = connection {
            let list = self.core.store.subject(&self.core.key).borrow().clone();
            let feed = self.feed_status.borrow().clone();
            let (payload, _) =
                connector::build_list_payload(&self.core.store, &list, feed, self.has_more());
            self.publish(payload);

            tokio::spawn(connector::run(Arc::downgrade(self), token.clone()));
            if let Some(feed) = &self.feed {
                self.connect_feed(Arc::clone(feed), token);
            }
        }
        self.payload.subscribe()
    }

    /// Drop an observer. The last one stops the connector and unsubscribes
    /// from the feed.
    pub(crate) fn detach(&self) {
        let (feed, connection) = {
            let mut state = self.state.lock();
            state.observers = state.observers.saturating_sub(1);
            if state.observers > 0 {
                return;
            }
            (state.feed.take(), state.connection.take())
        };
        if let Some(connection) = connection {
            connection.cancel();
        }
        if let Some(feed) = feed {
            feed.unsubscribe();
        }
        if self.feed.is_some() {
            self.feed_status.send_replace(FeedStatus::Disabled);
        }
    }

    fn connect_feed(self: &Arc<Self>, feed: Arc<dyn ObjectSetSubscriber>, token: CancellationToken) {
        let type_ref = self.definition.type_ref.clone();
        let object_set = where_clause::to_wire(&type_ref, self.definition.filter.value());
        let spec = SubscribeSpec::base(type_ref).with_object_set(object_set);
        let listener: Arc<dyn ObjectSetListener> = Arc::new(FeedListener {
            query: Arc::downgrade(self),
        });
        let query = Arc::downgrade(self);

        self.feed_status.send_replace(FeedStatus::Connecting);
        tokio::spawn(async move {
            match feed.subscribe(spec, listener).await {
                Ok(handle) => {
                    let Some(query) = query.upgrade() else {
                        handle.unsubscribe();
                        return;
                    };
                    let mut state = query.state.lock();
                    if token.is_cancelled() {
                        drop(state);
                        handle.unsubscribe();
                    } else {
                        state.feed = Some(handle);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "change feed subscription failed");
                    if let Some(query) = query.upgrade() {
                        query.feed_status.send_replace(FeedStatus::Closed {
                            subscription_closed: true,
                            message: e.to_string(),
                        });
                    }
                }
            }
        });
    }
}

fn object_key(batch: &BatchContext<'_>, object: &ObjectInstance) -> CacheKey {
    batch.object_key(object.object_type(), object.primary_key())
}

impl Query for CollectionQuery {
    fn cache_key(&self) -> &CacheKey {
        &self.core.key
    }

    fn revalidate(self: Arc<Self>, force: bool) -> BoxFuture<'static, Result<(), CoreError>> {
        let min_results = self.state.lock().min_results;
        let query = Arc::clone(&self);
        self.core.revalidate(force, move |cancel| {
            query.fetch_pages(None, min_results, cancel)
        })
    }

    fn on_changes(self: Arc<Self>, changes: &mut Changes, optimistic_id: Option<OptimisticId>) {
        let key = self.core.key.clone();
        if !changes.modified.insert(key.clone()) {
            return;
        }

        // Interface lists cannot evaluate their clause against concrete
        // objects; they follow deletes and the feed only.
        let filter = self.definition.filter.value();
        let candidates: Vec<(Arc<ObjectInstance>, bool, Match)> =
            if self.definition.type_ref.kind == TypeKind::Object {
                changes
                    .objects_of_type(&self.definition.type_ref.api_name)
                    .map(|(object, is_new)| {
                        (Arc::clone(object), is_new, where_clause::matches(filter, object))
                    })
                    .collect()
            } else {
                Vec::new()
            };
        let deleted: Vec<CacheKey> = changes.deleted.iter().cloned().collect();
        if candidates.is_empty() && deleted.is_empty() {
            return;
        }

        let uncertain = candidates.iter().any(|(_, _, m)| *m == Match::Sorta);
        let fetching = self.core.is_fetching();
        let options = BatchOptions { optimistic_id };
        let result = self.core.store.batch_with_changes(options, changes, |batch| {
            let Some((list, current_status)) = self.current_list(batch) else {
                return Ok(false);
            };

            let mut remove: HashSet<CacheKey> = deleted
                .iter()
                .filter(|k| list.data.contains(k))
                .cloned()
                .collect();
            let mut add = Vec::new();
            for (object, is_new, matched) in &candidates {
                let member = object_key(batch, object);
                match matched {
                    Match::Strict => add.push(member),
                    // Undecidable locally; the refetch settles it.
                    Match::Sorta => {}
                    // Optimistic edits never take objects out of a list.
                    Match::No if *is_new || batch.optimistic_write() => {}
                    Match::No => {
                        remove.insert(member);
                    }
                }
            }
            if add.is_empty() && remove.is_empty() {
                return Ok(true);
            }

            let status = if batch.optimistic_write() || uncertain {
                Status::Loading
            } else if fetching {
                current_status
            } else {
                Status::Loaded
            };
            let keys = list
                .data
                .iter()
                .filter(|k| !remove.contains(*k))
                .cloned()
                .chain(add)
                .collect();
            self.update_list(batch, keys, status, false, None);
            Ok(true)
        });

        // `Ok(true)`: the list is loaded and was considered.
        match result {
            Ok(true) if uncertain && optimistic_id.is_none() => spawn_revalidate(self, true),
            Ok(_) => {}
            Err(e) => tracing::warn!(%key, error = %e, "list maintenance failed"),
        }
    }

    fn dispose(&self) {
        let (feed, connection) = {
            let mut state = self.state.lock();
            (state.feed.take(), state.connection.take())
        };
        if let Some(connection) = connection {
            connection.cancel();
        }
        if let Some(feed) = feed {
            feed.unsubscribe();
        }
        self.core.dispose();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ── Feed listener ────────────────────────────────────────────────────

/// Routes change-feed callbacks into the query without keeping it alive.
struct FeedListener {
    query: Weak<CollectionQuery>,
}

impl ObjectSetListener for FeedListener {
    fn on_change(&self, update: ObjectUpdate) {
        if let Some(query) = self.query.upgrade() {
            query.apply_feed_update(&update);
        }
    }

    fn on_successful_subscription(&self) {
        if let Some(query) = self.query.upgrade() {
            query.feed_status.send_replace(FeedStatus::Subscribed);
        }
    }

    fn on_out_of_date(&self) {
        let Some(query) = self.query.upgrade() else {
            return;
        };
        query.feed_status.send_replace(FeedStatus::OutOfDate);
        let refetch = Arc::clone(&query).revalidate(true);
        let weak = Arc::downgrade(&query);
        tokio::spawn(async move {
            let result = refetch.await;
            let Some(query) = weak.upgrade() else { return };
            match result {
                Ok(()) => {
                    query.feed_status.send_if_modified(|status| {
                        if *status == FeedStatus::OutOfDate {
                            *status = FeedStatus::Subscribed;
                            true
                        } else {
                            false
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(key = %query.core.key, error = %e, "refetch after feed gap failed");
                }
            }
        });
    }

    fn on_error(&self, error: SubscriptionError) {
        let Some(query) = self.query.upgrade() else {
            return;
        };
        if error.subscription_closed {
            query.feed_status.send_replace(FeedStatus::Closed {
                subscription_closed: true,
                message: error.cause.to_string(),
            });
        } else {
            tracing::debug!(key = %query.core.key, cause = %error.cause, "feed error, reconnecting");
            query.feed_status.send_replace(FeedStatus::Connecting);
        }
    }

    fn on_initial_load_complete(&self) {
        if let Some(query) = self.query.upgrade() {
            tracing::debug!(key = %query.core.key, "feed initial load complete");
        }
    }
}
