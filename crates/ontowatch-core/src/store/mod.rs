// ── Reference-counted layered store ──
//
// Owns every layer, the key registry, reference counts, per-key watch
// subjects, and the live queries. All mutation goes through `batch()`,
// which holds the state lock for the whole batch body so commits are
// serialized and observers see entries in commit order.

pub mod batch;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ontowatch_api::{PrimaryKey, TypeKind};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{
    CacheKey, CacheKeyRegistry, Canonical, Changes, Entry, KeyData, Layer, OptimisticId,
    OrderTerm, RefCounts, RingBuffer,
};
use crate::config::CacheConfig;
use crate::error::CoreError;
use crate::query::Query;

pub use batch::{BatchContext, BatchOptions};
use batch::BatchGuard;

/// What a key's subject carries: the visible entry plus whether it differs
/// from server truth.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub entry: Entry,
    pub is_optimistic: bool,
}

/// One committed batch, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub sequence: u64,
    pub changed_keys: usize,
    pub optimistic_id: Option<OptimisticId>,
    pub committed_at: DateTime<Utc>,
}

struct StoreState {
    top: Arc<Layer>,
    revision: u64,
    sequence: u64,
    history: RingBuffer<CommitRecord>,
}

struct StoreInner {
    config: CacheConfig,
    state: Mutex<StoreState>,
    keys: Mutex<CacheKeyRegistry>,
    refcounts: Mutex<RefCounts>,
    subjects: DashMap<CacheKey, watch::Sender<Snapshot>>,
    queries: DashMap<CacheKey, Arc<dyn Query>>,
    next_optimistic: AtomicU64,
    closed: AtomicBool,
}

/// Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    top: Layer::truth(),
                    revision: 0,
                    sequence: 0,
                    history: RingBuffer::new(config.history_capacity),
                }),
                keys: Mutex::new(CacheKeyRegistry::new()),
                refcounts: Mutex::new(RefCounts::new(config.keep_alive)),
                subjects: DashMap::new(),
                queries: DashMap::new(),
                next_optimistic: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // ── Keys ─────────────────────────────────────────────────────────

    /// Intern `data` and start tracking it for collection.
    pub fn cache_key(&self, data: KeyData) -> CacheKey {
        let (key, _) = self.inner.keys.lock().get(data);
        self.inner.refcounts.lock().register(&key);
        key
    }

    pub fn object_key(&self, api_name: &str, primary_key: &PrimaryKey) -> CacheKey {
        self.cache_key(KeyData::Object {
            api_name: api_name.to_owned(),
            primary_key: primary_key.clone(),
        })
    }

    pub fn list_key(
        &self,
        kind: TypeKind,
        api_name: &str,
        filter: Canonical,
        order_by: Vec<OrderTerm>,
        page_size: Option<u32>,
    ) -> CacheKey {
        self.cache_key(KeyData::List {
            kind,
            api_name: api_name.to_owned(),
            filter,
            order_by,
            page_size,
        })
    }

    pub fn retain(&self, key: &CacheKey) {
        self.inner.refcounts.lock().retain(key);
    }

    pub fn release(&self, key: &CacheKey) {
        self.inner.refcounts.lock().release(key);
    }

    pub fn ref_count(&self, key: &CacheKey) -> usize {
        self.inner.refcounts.lock().count(key)
    }

    pub fn key_count(&self) -> usize {
        self.inner.keys.lock().len()
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// The visible entry for `key`, overlays included.
    pub fn get_value(&self, key: &CacheKey) -> Option<Entry> {
        self.inner.state.lock().top.get(key).cloned()
    }

    /// The server-confirmed entry for `key`, ignoring overlays.
    pub fn get_truth(&self, key: &CacheKey) -> Option<Entry> {
        self.inner.state.lock().top.truth_layer().get(key).cloned()
    }

    /// Subscribe to `key`. The receiver starts at the current snapshot.
    pub fn subject(&self, key: &CacheKey) -> watch::Receiver<Snapshot> {
        let state = self.inner.state.lock();
        self.inner
            .subjects
            .entry(key.clone())
            .or_insert_with(|| watch::channel(snapshot_of(&state.top, key)).0)
            .subscribe()
    }

    /// Most recent commits, oldest first.
    pub fn recent_commits(&self) -> Vec<CommitRecord> {
        self.inner.state.lock().history.iter().cloned().collect()
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// The live query for `key`, created with `create` if there is none.
    pub fn query<Q: Query>(&self, key: &CacheKey, create: impl Fn() -> Arc<Q>) -> Arc<Q> {
        let mut created: Option<Arc<Q>> = None;
        let existing = {
            let slot = self.inner.queries.entry(key.clone()).or_insert_with(|| {
                let query = create();
                created = Some(Arc::clone(&query));
                query as Arc<dyn Query>
            });
            Arc::clone(slot.value())
        };
        if let Some(query) = created {
            return query;
        }
        match existing.into_any().downcast::<Q>() {
            Ok(query) => query,
            Err(_) => {
                tracing::warn!(%key, "replacing query of a different kind");
                let query = create();
                self.inner
                    .queries
                    .insert(key.clone(), Arc::clone(&query) as Arc<dyn Query>);
                query
            }
        }
    }

    pub fn get_query(&self, key: &CacheKey) -> Option<Arc<dyn Query>> {
        self.inner.queries.get(key).map(|q| Arc::clone(q.value()))
    }

    pub fn queries(&self) -> Vec<Arc<dyn Query>> {
        self.inner
            .queries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    // ── Batches ──────────────────────────────────────────────────────

    pub fn new_optimistic_id(&self) -> OptimisticId {
        OptimisticId(self.inner.next_optimistic.fetch_add(1, Ordering::Relaxed))
    }

    /// Run `f` as one atomic write. Returns `NestedBatch` if called from
    /// inside another batch body on the same thread.
    pub fn batch<R>(
        &self,
        options: BatchOptions,
        f: impl FnOnce(&mut BatchContext<'_>) -> Result<R, CoreError>,
    ) -> Result<R, CoreError> {
        let mut changes = Changes::new();
        self.batch_with_changes(options, &mut changes, f)
    }

    /// Like `batch`, accumulating into an existing change set. Queries that
    /// already marked themselves in `changes.modified` are not re-notified.
    pub fn batch_with_changes<R>(
        &self,
        options: BatchOptions,
        changes: &mut Changes,
        f: impl FnOnce(&mut BatchContext<'_>) -> Result<R, CoreError>,
    ) -> Result<R, CoreError> {
        if self.is_closed() {
            return Err(CoreError::StoreClosed);
        }
        let guard = BatchGuard::enter()?;
        let mut state = self.inner.state.lock();
        let StoreState { top, revision, .. } = &mut *state;

        let mut ctx = BatchContext::new(self, &**top, revision, options.optimistic_id, changes);
        let result = f(&mut ctx)?;
        let BatchContext {
            writes,
            retains,
            releases,
            ..
        } = ctx;

        let changed_keys = writes.len();
        if changed_keys > 0 {
            self.commit(&mut state, writes, options.optimistic_id);
        }
        drop(state);
        drop(guard);

        if !retains.is_empty() || !releases.is_empty() {
            let mut refcounts = self.inner.refcounts.lock();
            for key in &retains {
                refcounts.retain(key);
            }
            for key in &releases {
                refcounts.release(key);
            }
        }

        if changed_keys > 0 {
            self.dispatch(changes, options.optimistic_id);
        }
        Ok(result)
    }

    fn commit(
        &self,
        state: &mut StoreState,
        writes: indexmap::IndexMap<CacheKey, Entry>,
        optimistic_id: Option<OptimisticId>,
    ) {
        let before: Vec<(CacheKey, Option<Entry>)> = writes
            .keys()
            .map(|key| (key.clone(), state.top.get(key).cloned()))
            .collect();
        let changed_keys = writes.len();

        let top = std::mem::replace(&mut state.top, Layer::truth());
        state.top = match optimistic_id {
            Some(id) => top.add_layer(id).with_entries(writes),
            None => {
                let (truth, overlays) = top.split();
                Layer::stack(truth.with_entries(writes), overlays)
            }
        };

        self.notify(&state.top, before);

        state.sequence += 1;
        state.history.push(CommitRecord {
            sequence: state.sequence,
            changed_keys,
            optimistic_id,
            committed_at: Utc::now(),
        });
        tracing::trace!(
            sequence = state.sequence,
            changed_keys,
            optimistic = optimistic_id.is_some(),
            "batch committed"
        );
    }

    /// Push new snapshots for every key whose visible entry changed.
    fn notify(&self, top: &Layer, before: Vec<(CacheKey, Option<Entry>)>) {
        for (key, old) in before {
            let new = top.get(&key);
            let unchanged = match (&old, new) {
                (Some(old), Some(new)) => old.same_write(new),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                continue;
            }
            if let Some(subject) = self.inner.subjects.get(&key) {
                subject.send_replace(snapshot_of(top, &key));
            }
        }
    }

    fn dispatch(&self, changes: &mut Changes, optimistic_id: Option<OptimisticId>) {
        if changes.is_empty() {
            return;
        }
        for query in self.queries() {
            if changes.modified.contains(query.cache_key()) {
                continue;
            }
            query.on_changes(changes, optimistic_id);
        }
    }

    /// Drop every overlay tagged `id`, restoring the view beneath it.
    pub fn clear_optimistic_layer(&self, id: OptimisticId) {
        let mut state = self.inner.state.lock();
        let keys: HashSet<CacheKey> = state.top.overlay_keys(id).into_iter().collect();
        let before: Vec<(CacheKey, Option<Entry>)> = keys
            .into_iter()
            .map(|key| {
                let entry = state.top.get(&key).cloned();
                (key, entry)
            })
            .collect();

        let top = std::mem::replace(&mut state.top, Layer::truth());
        state.top = top.remove_layer(id);
        self.notify(&state.top, before);
        tracing::debug!(%id, "optimistic layer removed");
    }

    // ── Garbage collection ───────────────────────────────────────────

    /// Evict every key whose keep-alive has lapsed. Returns the evicted keys.
    pub fn gc_now(&self) -> Vec<CacheKey> {
        let expired = self.inner.refcounts.lock().gc(Instant::now());
        if expired.is_empty() {
            return expired;
        }

        let orphaned: Vec<CacheKey> = {
            let mut state = self.inner.state.lock();
            let orphaned = expired
                .iter()
                .filter_map(|key| state.top.truth_layer().get(key))
                .filter_map(|entry| entry.value.as_collection().cloned())
                .flat_map(|data| data.data.clone())
                .collect();
            let top = std::mem::replace(&mut state.top, Layer::truth());
            state.top = top.evict(&expired);
            orphaned
        };

        {
            let mut keys = self.inner.keys.lock();
            for key in &expired {
                keys.remove(key);
            }
        }
        for key in &expired {
            self.inner.subjects.remove(key);
            if let Some((_, query)) = self.inner.queries.remove(key) {
                query.dispose();
            }
        }
        if !orphaned.is_empty() {
            let mut refcounts = self.inner.refcounts.lock();
            for key in &orphaned {
                refcounts.release(key);
            }
        }

        tracing::debug!(evicted = expired.len(), "cache gc");
        expired
    }

    /// Run `gc_now` every `gc_interval` until `cancel` fires or the store is dropped.
    pub fn spawn_gc(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.gc_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        Store { inner }.gc_now();
                    }
                }
            }
            tracing::debug!("cache gc task exiting");
        })
    }

    /// Dispose every query and refuse further batches.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let queries: Vec<Arc<dyn Query>> = self.queries();
        self.inner.queries.clear();
        for query in queries {
            query.dispose();
        }
        self.inner.subjects.clear();
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("keys", &self.key_count())
            .field("queries", &self.inner.queries.len())
            .finish_non_exhaustive()
    }
}

fn snapshot_of(top: &Layer, key: &CacheKey) -> Snapshot {
    let entry = top
        .get(key)
        .cloned()
        .unwrap_or_else(|| Entry::init(key.clone()));
    let truth = top.truth_layer().get(key);
    let is_optimistic = match truth {
        Some(truth) => !truth.value.same_as(&entry.value),
        None => entry.revision != 0,
    };
    Snapshot {
        entry,
        is_optimistic,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use ontowatch_api::ObjectInstance;

    use super::*;
    use crate::cache::{CacheValue, CollectionData, Status};

    fn todo(pk: i64, body: &str) -> ObjectInstance {
        ObjectInstance::new("Todo", pk).with_property("body", body)
    }

    fn body(store: &Store, key: &CacheKey) -> Option<String> {
        store
            .get_value(key)?
            .value
            .as_object()?
            .property("body")?
            .as_str()
            .map(str::to_owned)
    }

    #[test]
    fn failed_batch_leaves_no_trace() {
        let store = Store::new(CacheConfig::default());
        let result: Result<(), CoreError> = store.batch(BatchOptions::default(), |batch| {
            let key = batch.store_object(todo(1, "x"));
            batch.retain(&key);
            Err(CoreError::Aborted {
                message: "nope".into(),
            })
        });
        assert!(matches!(result, Err(CoreError::Aborted { .. })));

        let key = store.object_key("Todo", &PrimaryKey::Integer(1));
        assert!(store.get_value(&key).is_none());
        assert_eq!(store.ref_count(&key), 0);
        assert!(store.recent_commits().is_empty());
    }

    #[test]
    fn nested_batch_is_rejected() {
        let store = Store::new(CacheConfig::default());
        let inner = store
            .batch(BatchOptions::default(), |_| {
                Ok(matches!(
                    store.batch(BatchOptions::default(), |_| Ok(())),
                    Err(CoreError::NestedBatch)
                ))
            })
            .unwrap();
        assert!(inner);
        // The guard is released afterwards.
        store.batch(BatchOptions::default(), |_| Ok(())).unwrap();
    }

    #[test]
    fn reads_inside_a_batch_see_staged_writes() {
        let store = Store::new(CacheConfig::default());
        store
            .batch(BatchOptions::default(), |batch| {
                let key = batch.store_object(todo(1, "x"));
                let staged = batch.read(&key).unwrap();
                assert_eq!(staged.status, Status::Loaded);
                assert!(batch.changes().added.contains(&key));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn reads_of_committed_entries_inside_a_batch_do_not_block() {
        let store = Store::new(CacheConfig::default());
        let key = store
            .batch(BatchOptions::default(), |batch| Ok(batch.store_object(todo(1, "x"))))
            .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = store.clone();
        std::thread::spawn(move || {
            let seen = worker.batch(BatchOptions::default(), |batch| {
                let again = batch.object_key("Todo", &PrimaryKey::Integer(1));
                Ok(batch.read(&again).map(|entry| entry.status))
            });
            let _ = tx.send(seen);
        });

        let seen = rx.recv_timeout(Duration::from_secs(2)).expect("batch blocked");
        assert_eq!(seen.unwrap(), Some(Status::Loaded));
        assert!(store.get_value(&key).is_some());
    }

    #[tokio::test]
    async fn unchanged_status_and_repeat_deletes_are_not_writes() {
        let store = Store::new(CacheConfig::default());
        let key = store
            .batch(BatchOptions::default(), |batch| Ok(batch.store_object(todo(1, "x"))))
            .unwrap();
        let mut rx = store.subject(&key);
        let _ = rx.borrow_and_update();
        let before = store.get_value(&key).unwrap();

        store
            .batch(BatchOptions::default(), |batch| {
                batch.set_status(&key, Status::Loaded);
                batch.write(&key, CacheValue::Object(Arc::new(todo(1, "x"))), Status::Loaded);
                Ok(())
            })
            .unwrap();
        assert!(!rx.has_changed().unwrap());
        assert!(store.get_value(&key).unwrap().same_write(&before));
        assert_eq!(store.recent_commits().len(), 1);

        store
            .batch(BatchOptions::default(), |batch| {
                batch.delete(&key, Status::Loaded);
                Ok(())
            })
            .unwrap();
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();
        let tombstone = store.get_value(&key).unwrap();

        store
            .batch(BatchOptions::default(), |batch| {
                batch.delete(&key, Status::Loaded);
                Ok(())
            })
            .unwrap();
        assert!(!rx.has_changed().unwrap());
        assert_eq!(store.get_value(&key).unwrap().revision, tombstone.revision);
        assert_eq!(store.recent_commits().len(), 2);
    }

    #[test]
    fn identical_object_writes_are_skipped() {
        let store = Store::new(CacheConfig::default());
        let key = store
            .batch(BatchOptions::default(), |batch| Ok(batch.store_object(todo(1, "x"))))
            .unwrap();
        let before = store.get_value(&key).unwrap();

        let mut changes = Changes::new();
        store
            .batch_with_changes(BatchOptions::default(), &mut changes, |batch| {
                batch.store_object(todo(1, "x"));
                Ok(())
            })
            .unwrap();
        assert!(changes.is_empty());
        assert!(store.get_value(&key).unwrap().same_write(&before));
        assert_eq!(store.recent_commits().len(), 1);
    }

    #[tokio::test]
    async fn overlays_notify_and_restore() {
        let store = Store::new(CacheConfig::default());
        let key = store
            .batch(BatchOptions::default(), |batch| Ok(batch.store_object(todo(1, "truth"))))
            .unwrap();
        let mut rx = store.subject(&key);
        assert!(!rx.borrow_and_update().is_optimistic);

        let id = store.new_optimistic_id();
        store
            .batch(BatchOptions::optimistic(id), |batch| {
                batch.store_object(todo(1, "optimistic"));
                Ok(())
            })
            .unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_optimistic);
        assert_eq!(body(&store, &key).as_deref(), Some("optimistic"));
        assert_eq!(
            store.get_truth(&key).unwrap().value.as_object().unwrap().property("body"),
            Some(&serde_json::json!("truth"))
        );

        // A truth write under the overlay is not visible yet.
        store
            .batch(BatchOptions::default(), |batch| {
                batch.store_object(todo(1, "server"));
                Ok(())
            })
            .unwrap();
        assert!(!rx.has_changed().unwrap());

        store.clear_optimistic_layer(id);
        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert!(!snapshot.is_optimistic);
        assert_eq!(body(&store, &key).as_deref(), Some("server"));
    }

    #[test]
    fn last_updated_never_goes_backwards() {
        let store = Store::new(CacheConfig::default());
        let key = store.object_key("Todo", &PrimaryKey::Integer(1));
        let first = store
            .batch(BatchOptions::default(), |batch| {
                Ok(batch.write(&key, CacheValue::Empty, Status::Loading))
            })
            .unwrap();
        let second = store
            .batch(BatchOptions::default(), |batch| {
                Ok(batch.set_status(&key, Status::Loaded))
            })
            .unwrap();
        assert!(second.last_updated >= first.last_updated);
        assert!(second.revision > first.revision);
    }

    #[tokio::test(start_paused = true)]
    async fn gc_evicts_released_keys_and_their_list_members() {
        let config = CacheConfig {
            keep_alive: Duration::from_secs(10),
            ..CacheConfig::default()
        };
        let store = Store::new(config);
        let list = store.list_key(TypeKind::Object, "Todo", Canonical::empty(), Vec::new(), None);
        store.retain(&list);

        let member = store
            .batch(BatchOptions::default(), |batch| {
                let member = batch.store_object(todo(1, "x"));
                batch.retain(&member);
                batch.write(
                    &list,
                    CacheValue::Collection(Arc::new(CollectionData {
                        data: vec![member.clone()],
                        total_count: None,
                    })),
                    Status::Loaded,
                );
                Ok(member)
            })
            .unwrap();
        assert_eq!(store.ref_count(&member), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.gc_now().is_empty());

        store.release(&list);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.gc_now(), vec![list.clone()]);
        assert!(store.get_value(&list).is_none());
        // The member lost its only reference and follows after the keep-alive.
        assert_eq!(store.ref_count(&member), 0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.gc_now(), vec![member.clone()]);
        assert!(store.get_value(&member).is_none());
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn shutdown_refuses_batches() {
        let store = Store::new(CacheConfig::default());
        store.shutdown();
        assert!(matches!(
            store.batch(BatchOptions::default(), |_| Ok(())),
            Err(CoreError::StoreClosed)
        ));
    }
}
