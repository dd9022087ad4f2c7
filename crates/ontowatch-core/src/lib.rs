// ontowatch-core: Reactive object cache between ontowatch-api and consumers.
//
// Data flows in from two directions: queries fetch pages and objects from a
// `DataSource`, and change feeds push updates through `ontowatch-api`
// subscribers. Both land in the layered `Store` via atomic batches, and
// observers are notified per cache key in commit order.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod query;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use cache::{CacheKey, CacheValue, CollectionData, Entry, OptimisticId, OrderTerm, Status};
pub use client::{ListOptions, ObjectEdit, ObservableClient, ObserveMode};
pub use config::CacheConfig;
pub use error::CoreError;
pub use query::{AutoFetch, DataSource, Page, PageRequest, Query};
pub use store::{BatchContext, BatchOptions, Store};
pub use stream::{
    FeedStatus, ListObservation, ListPayload, ObjectObservation, ObjectPayload,
};
