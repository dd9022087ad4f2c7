// ── Single-object query ──

use std::any::Any;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use ontowatch_api::PrimaryKey;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheKey, Changes, OptimisticId, Status};
use crate::error::CoreError;
use crate::store::{BatchOptions, Store};

use super::{DataSource, Query, QueryCore, cancellable};

/// Loads one object by type and primary key.
pub struct ObjectQuery {
    core: QueryCore,
    source: Arc<dyn DataSource>,
    api_name: String,
    primary_key: PrimaryKey,
}

impl ObjectQuery {
    pub fn new(
        store: Store,
        key: CacheKey,
        source: Arc<dyn DataSource>,
        api_name: impl Into<String>,
        primary_key: PrimaryKey,
    ) -> Self {
        Self {
            core: QueryCore::new(store, key),
            source,
            api_name: api_name.into(),
            primary_key,
        }
    }

    pub fn is_fetching(&self) -> bool {
        self.core.is_fetching()
    }

    async fn fetch(self: Arc<Self>, cancel: CancellationToken) -> Result<(), CoreError> {
        let store = &self.core.store;
        let key = &self.core.key;
        store.batch(BatchOptions::default(), |batch| {
            batch.set_status(key, Status::Loading);
            Ok(())
        })?;

        let fetched = cancellable(
            &cancel,
            self.source.fetch_object(&self.api_name, &self.primary_key),
        )
        .await;

        match fetched {
            Ok(Some(object)) => store.batch(BatchOptions::default(), |batch| {
                batch.store_object(object);
                Ok(())
            }),
            Ok(None) => {
                tracing::debug!(%key, "object no longer exists");
                store.batch(BatchOptions::default(), |batch| {
                    batch.delete(key, Status::Loaded);
                    Ok(())
                })
            }
            Err(CoreError::Cancelled) => Err(CoreError::Cancelled),
            Err(e) => {
                store.batch(BatchOptions::default(), |batch| {
                    batch.set_status(key, Status::Error);
                    Ok(())
                })?;
                Err(e)
            }
        }
    }
}

impl Query for ObjectQuery {
    fn cache_key(&self) -> &CacheKey {
        &self.core.key
    }

    fn revalidate(self: Arc<Self>, force: bool) -> BoxFuture<'static, Result<(), CoreError>> {
        let query = Arc::clone(&self);
        self.core
            .revalidate(force, move |cancel| query.fetch(cancel))
    }

    fn on_changes(self: Arc<Self>, _changes: &mut Changes, _optimistic_id: Option<OptimisticId>) {
        // Object entries are written directly; nothing to maintain.
    }

    fn dispose(&self) {
        self.core.dispose();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
