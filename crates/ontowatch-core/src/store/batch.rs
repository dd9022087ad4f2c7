// ── Batch context ──
//
// The only way to mutate the store. Writes are staged here and become
// visible together when the batch commits; an error from the batch body
// throws the staged writes away.

use std::cell::Cell;
use std::sync::Arc;

use indexmap::IndexMap;
use ontowatch_api::{ObjectInstance, PrimaryKey};

use crate::cache::{CacheKey, CacheValue, Changes, Entry, Layer, OptimisticId, Status};
use crate::error::CoreError;

use super::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Write into a new overlay tagged with this id instead of the truth layer.
    pub optimistic_id: Option<OptimisticId>,
}

impl BatchOptions {
    pub fn optimistic(id: OptimisticId) -> Self {
        Self {
            optimistic_id: Some(id),
        }
    }
}

pub struct BatchContext<'a> {
    store: &'a Store,
    top: &'a Layer,
    next_revision: &'a mut u64,
    optimistic_id: Option<OptimisticId>,
    changes: &'a mut Changes,
    pub(super) writes: IndexMap<CacheKey, Entry>,
    pub(super) retains: Vec<CacheKey>,
    pub(super) releases: Vec<CacheKey>,
}

impl<'a> BatchContext<'a> {
    pub(super) fn new(
        store: &'a Store,
        top: &'a Layer,
        next_revision: &'a mut u64,
        optimistic_id: Option<OptimisticId>,
        changes: &'a mut Changes,
    ) -> Self {
        Self {
            store,
            top,
            next_revision,
            optimistic_id,
            changes,
            writes: IndexMap::new(),
            retains: Vec::new(),
            releases: Vec::new(),
        }
    }

    pub fn optimistic_write(&self) -> bool {
        self.optimistic_id.is_some()
    }

    pub fn changes(&mut self) -> &mut Changes {
        &mut *self.changes
    }

    /// Read through staged writes. Optimistic batches see the full layer
    /// stack; truth batches see only the truth layer.
    pub fn read(&self, key: &CacheKey) -> Option<Entry> {
        if let Some(entry) = self.writes.get(key) {
            return Some(entry.clone());
        }
        let base = if self.optimistic_write() {
            self.top
        } else {
            self.top.truth_layer()
        };
        base.get(key).cloned()
    }

    /// Stage `value` under `key`. An equal value with the same status is
    /// not a write: the existing entry comes back and nothing is staged.
    pub fn write(&mut self, key: &CacheKey, value: CacheValue, status: Status) -> Entry {
        let previous = self.read(key);
        if let Some(previous) = previous.as_ref() {
            if previous.status == status && previous.value.equivalent(&value) {
                return previous.clone();
            }
        }
        let now = chrono::Utc::now().timestamp_millis();
        let last_updated = previous.map_or(now, |previous| previous.last_updated.max(now));
        *self.next_revision += 1;

        let entry = Entry {
            cache_key: key.clone(),
            value,
            status,
            last_updated,
            revision: *self.next_revision,
        };
        self.writes.insert(key.clone(), entry.clone());
        entry
    }

    /// Write a tombstone for `key`.
    pub fn delete(&mut self, key: &CacheKey, status: Status) -> Entry {
        self.changes.delete(key.clone());
        self.write(key, CacheValue::Tombstone, status)
    }

    /// Keep the value, change only the status.
    pub fn set_status(&mut self, key: &CacheKey, status: Status) -> Entry {
        let value = self.read(key).map(|entry| entry.value).unwrap_or_default();
        self.write(key, value, status)
    }

    /// Deferred until commit; dropped if the batch fails.
    pub fn retain(&mut self, key: &CacheKey) {
        self.retains.push(key.clone());
    }

    /// Deferred until commit; dropped if the batch fails.
    pub fn release(&mut self, key: &CacheKey) {
        self.releases.push(key.clone());
    }

    pub fn object_key(&self, api_name: &str, primary_key: &PrimaryKey) -> CacheKey {
        self.store.object_key(api_name, primary_key)
    }

    /// Store an object under its concrete type and record the change.
    /// Writing an identical, already-loaded object is a no-op.
    pub fn store_object(&mut self, object: ObjectInstance) -> CacheKey {
        let object = if object.api_name() == object.object_type() {
            object
        } else {
            let concrete = object.object_type().to_owned();
            object.as_interface(concrete)
        };
        let key = self.object_key(object.object_type(), object.primary_key());

        let existing = self.read(&key);
        let previous = existing
            .as_ref()
            .and_then(|entry| entry.value.as_object().cloned());
        if let (Some(previous), Some(entry)) = (&previous, &existing) {
            if **previous == object && entry.status == Status::Loaded {
                return key;
            }
        }

        let object = Arc::new(object);
        self.write(&key, CacheValue::Object(Arc::clone(&object)), Status::Loaded);
        self.changes
            .register_object(key.clone(), object, previous.is_none());
        key
    }
}

// ── Re-entrancy guard ────────────────────────────────────────────────

thread_local! {
    static IN_BATCH: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a batch until dropped.
pub(super) struct BatchGuard(());

impl BatchGuard {
    pub(super) fn enter() -> Result<Self, CoreError> {
        IN_BATCH.with(|flag| {
            if flag.replace(true) {
                Err(CoreError::NestedBatch)
            } else {
                Ok(Self(()))
            }
        })
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        IN_BATCH.with(|flag| flag.set(false));
    }
}
