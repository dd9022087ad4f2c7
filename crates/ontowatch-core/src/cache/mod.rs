// ── Cache primitives ──
//
// Plain data structures with no async or locking of their own; the
// `Store` composes them.

pub mod cache_key;
pub mod changes;
pub mod layer;
pub mod refcounts;
pub mod ring_buffer;

pub use cache_key::{CacheKey, CacheKeyRegistry, Canonical, KeyData, OrderTerm, SortDirection};
pub use changes::Changes;
pub use layer::{CacheValue, CollectionData, Entry, Layer, OptimisticId, Status};
pub use refcounts::RefCounts;
pub use ring_buffer::RingBuffer;
