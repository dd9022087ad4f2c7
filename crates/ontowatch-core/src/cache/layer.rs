// ── Layered cache snapshots ──
//
// The bottom layer holds server-confirmed truth. Optimistic writes go into
// overlay layers stacked on top, each tagged with the id of the operation
// that created it. Reads walk from the top down, so an overlay shadows
// whatever is beneath it until it is removed.

use std::collections::HashMap;
use std::sync::Arc;

use ontowatch_api::ObjectInstance;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use super::cache_key::CacheKey;

/// Identifies the overlay layers written by one optimistic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OptimisticId(pub(crate) u64);

impl std::fmt::Display for OptimisticId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "optimistic-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    #[default]
    Init,
    Loading,
    Loaded,
    Error,
}

/// Contents of a collection entry: object keys in display order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectionData {
    pub data: Vec<CacheKey>,
    pub total_count: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub enum CacheValue {
    #[default]
    Empty,
    Object(Arc<ObjectInstance>),
    Collection(Arc<CollectionData>),
    /// The key was deleted; shadows any value in lower layers.
    Tombstone,
}

impl CacheValue {
    /// Identity comparison: two values are the same if they share storage.
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Empty, Self::Empty) | (Self::Tombstone, Self::Tombstone) => true,
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            (Self::Collection(a), Self::Collection(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Structural comparison: shared storage or equal contents.
    pub fn equivalent(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b) || a == b,
            (Self::Collection(a), Self::Collection(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => self.same_as(other),
        }
    }

    pub fn as_object(&self) -> Option<&Arc<ObjectInstance>> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Arc<CollectionData>> {
        match self {
            Self::Collection(data) => Some(data),
            _ => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub cache_key: CacheKey,
    pub value: CacheValue,
    pub status: Status,
    /// Milliseconds since the epoch; never goes backwards for a key.
    pub last_updated: i64,
    /// Store-wide write sequence number; distinct for every write.
    pub(crate) revision: u64,
}

impl Entry {
    /// Placeholder for a key that has never been written.
    pub fn init(cache_key: CacheKey) -> Self {
        Self {
            cache_key,
            value: CacheValue::Empty,
            status: Status::Init,
            last_updated: 0,
            revision: 0,
        }
    }

    /// Whether `other` is the very same write as `self`.
    pub fn same_write(&self, other: &Self) -> bool {
        self.revision == other.revision && self.value.same_as(&other.value)
    }
}

// ── Layer ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Layer {
    parent: Option<Arc<Layer>>,
    layer_id: Option<OptimisticId>,
    entries: HashMap<CacheKey, Entry>,
}

impl Layer {
    /// An empty truth layer.
    pub fn truth() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn layer_id(&self) -> Option<OptimisticId> {
        self.layer_id
    }

    pub fn parent(&self) -> Option<&Arc<Layer>> {
        self.parent.as_ref()
    }

    pub fn is_truth(&self) -> bool {
        self.parent.is_none()
    }

    /// Look up `key`, walking down through parents.
    pub fn get(&self, key: &CacheKey) -> Option<&Entry> {
        let mut layer = self;
        loop {
            if let Some(entry) = layer.entries.get(key) {
                return Some(entry);
            }
            layer = layer.parent.as_deref()?;
        }
    }

    /// The bottom (truth) layer of this chain.
    pub fn truth_layer(&self) -> &Layer {
        let mut layer = self;
        while let Some(parent) = layer.parent.as_deref() {
            layer = parent;
        }
        layer
    }

    /// Entries written to this layer only.
    pub fn own_entries(&self) -> impl Iterator<Item = (&CacheKey, &Entry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stack a new empty overlay on top of this chain.
    pub fn add_layer(self: &Arc<Self>, layer_id: OptimisticId) -> Arc<Layer> {
        Arc::new(Layer {
            parent: Some(Arc::clone(self)),
            layer_id: Some(layer_id),
            entries: HashMap::new(),
        })
    }

    /// This layer with `writes` applied. Mutates in place when unshared.
    pub fn with_entries(
        self: Arc<Self>,
        writes: impl IntoIterator<Item = (CacheKey, Entry)>,
    ) -> Arc<Layer> {
        let mut layer = Arc::unwrap_or_clone(self);
        layer.entries.extend(writes);
        Arc::new(layer)
    }

    /// The chain with every overlay tagged `layer_id` dropped.
    pub fn remove_layer(self: Arc<Self>, layer_id: OptimisticId) -> Arc<Layer> {
        let (truth, mut overlays) = self.split();
        overlays.retain(|layer| layer.layer_id != Some(layer_id));
        Self::stack(truth, overlays)
    }

    /// Re-stack this chain's overlays on a replacement truth layer.
    pub fn rebase(self: Arc<Self>, truth: Arc<Layer>) -> Arc<Layer> {
        let (_, overlays) = self.split();
        Self::stack(truth, overlays)
    }

    /// Every overlay key in this chain, topmost layer first.
    pub fn overlay_keys(&self, layer_id: OptimisticId) -> Vec<CacheKey> {
        let mut keys = Vec::new();
        let mut layer = self;
        while let Some(parent) = layer.parent.as_deref() {
            if layer.layer_id == Some(layer_id) {
                keys.extend(layer.entries.keys().cloned());
            }
            layer = parent;
        }
        keys
    }

    /// Drop `keys` from every layer in the chain.
    pub fn evict(self: Arc<Self>, keys: &[CacheKey]) -> Arc<Layer> {
        let (truth, overlays) = self.split();
        let mut truth = Arc::unwrap_or_clone(truth);
        for key in keys {
            truth.entries.remove(key);
        }
        let overlays = overlays
            .into_iter()
            .map(|mut layer| {
                for key in keys {
                    layer.entries.remove(key);
                }
                layer
            })
            .collect();
        Self::stack(Arc::new(truth), overlays)
    }

    /// Detach the truth layer and the overlays above it (bottom first).
    /// Overlays come back parentless.
    pub(crate) fn split(self: Arc<Self>) -> (Arc<Layer>, Vec<Layer>) {
        if self.parent.is_none() {
            return (self, Vec::new());
        }
        let mut layer = Arc::unwrap_or_clone(self);
        let parent = layer.parent.take();
        let (truth, mut overlays) = match parent {
            Some(parent) => parent.split(),
            None => (Layer::truth(), Vec::new()),
        };
        overlays.push(layer);
        (truth, overlays)
    }

    pub(crate) fn stack(truth: Arc<Layer>, overlays: Vec<Layer>) -> Arc<Layer> {
        overlays.into_iter().fold(truth, |parent, mut layer| {
            layer.parent = Some(parent);
            Arc::new(layer)
        })
    }
}
