// Shared fakes for the observable-client integration tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;

use ontowatch_api::{
    Error, ObjectInstance, ObjectSetListener, ObjectSetSubscriber, ObjectState, ObjectUpdate,
    PrimaryKey, SubscribeSpec, SubscriptionHandle,
};
use ontowatch_core::query::where_clause::{self, Match};
use ontowatch_core::{
    CoreError, DataSource, ListObservation, ListPayload, ObjectObservation, ObjectPayload, Page,
    PageRequest,
};

pub fn todo(pk: i64, body: &str) -> ObjectInstance {
    ObjectInstance::new("Todo", pk).with_property("body", body)
}

pub fn body(object: &ObjectInstance) -> Option<&str> {
    object.property("body").and_then(Value::as_str)
}

// ── Data source ─────────────────────────────────────────────────────

/// In-memory backend. Paging tokens are offsets.
#[derive(Default)]
pub struct FakeSource {
    objects: Mutex<Vec<ObjectInstance>>,
    failing: Mutex<HashSet<PrimaryKey>>,
    pub object_fetches: AtomicUsize,
    pub page_fetches: AtomicUsize,
}

impl FakeSource {
    pub fn with_objects(objects: Vec<ObjectInstance>) -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(objects),
            ..Self::default()
        })
    }

    /// Insert ahead of everything else, shifting later pages by one.
    pub fn prepend(&self, object: ObjectInstance) {
        self.objects.lock().unwrap().insert(0, object);
    }

    pub fn fail(&self, pk: impl Into<PrimaryKey>) {
        self.failing.lock().unwrap().insert(pk.into());
    }

    pub fn object_fetches(&self) -> usize {
        self.object_fetches.load(Ordering::SeqCst)
    }

    pub fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::SeqCst)
    }
}

impl DataSource for FakeSource {
    fn fetch_object<'a>(
        &'a self,
        api_name: &'a str,
        primary_key: &'a PrimaryKey,
    ) -> BoxFuture<'a, Result<Option<ObjectInstance>, CoreError>> {
        Box::pin(async move {
            self.object_fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.failing.lock().unwrap().contains(primary_key) {
                return Err(CoreError::Fetch {
                    key: format!("{api_name}:{primary_key}"),
                    message: "backend unavailable".into(),
                });
            }
            let objects = self.objects.lock().unwrap();
            Ok(objects
                .iter()
                .find(|o| o.object_type() == api_name && o.primary_key() == primary_key)
                .cloned())
        })
    }

    fn fetch_page(&self, request: PageRequest) -> BoxFuture<'_, Result<Page, CoreError>> {
        Box::pin(async move {
            self.page_fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let matching: Vec<ObjectInstance> = self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|o| o.object_type() == request.object_type.api_name)
                .filter(|o| where_clause::matches(&request.filter, o) == Match::Strict)
                .cloned()
                .collect();

            let offset: usize = request
                .page_token
                .as_deref()
                .map_or(0, |token| token.parse().unwrap());
            let size = request
                .page_size
                .map_or(matching.len().max(1), |s| usize::try_from(s).unwrap());
            let data: Vec<ObjectInstance> =
                matching.iter().skip(offset).take(size).cloned().collect();
            let next = offset + data.len();
            Ok(Page {
                next_page_token: (next < matching.len()).then(|| next.to_string()),
                total_count: Some(u64::try_from(matching.len()).unwrap()),
                data,
            })
        })
    }
}

// ── Change feed ─────────────────────────────────────────────────────

struct Registration {
    object_set: Value,
    listener: Arc<dyn ObjectSetListener>,
    handle: SubscriptionHandle,
}

/// A feed driven by the test: `emit` delivers straight to every live listener.
#[derive(Default)]
pub struct LoopbackFeed {
    registrations: Mutex<Vec<Registration>>,
}

impl LoopbackFeed {
    pub fn emit(&self, object: &ObjectInstance, state: ObjectState) {
        for listener in self.live() {
            listener.on_change(ObjectUpdate {
                object: Arc::new(object.clone()),
                state,
            });
        }
    }

    pub fn signal_out_of_date(&self) {
        for listener in self.live() {
            listener.on_out_of_date();
        }
    }

    pub fn active(&self) -> usize {
        self.live().len()
    }

    pub fn object_sets(&self) -> Vec<Value> {
        self.registrations
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.object_set.clone())
            .collect()
    }

    fn live(&self) -> Vec<Arc<dyn ObjectSetListener>> {
        self.registrations
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.handle.is_active())
            .map(|r| Arc::clone(&r.listener))
            .collect()
    }
}

impl ObjectSetSubscriber for LoopbackFeed {
    fn subscribe(
        &self,
        spec: SubscribeSpec,
        listener: Arc<dyn ObjectSetListener>,
    ) -> BoxFuture<'_, Result<SubscriptionHandle, Error>> {
        Box::pin(async move {
            let handle = SubscriptionHandle::new(|| {});
            listener.on_successful_subscription();
            self.registrations.lock().unwrap().push(Registration {
                object_set: spec.object_set,
                listener,
                handle: handle.clone(),
            });
            Ok(handle)
        })
    }
}

// ── Waiting ─────────────────────────────────────────────────────────

pub async fn wait_list(
    observation: &mut ListObservation,
    predicate: impl Fn(&ListPayload) -> bool,
) -> Arc<ListPayload> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = observation.current();
            if predicate(&current) {
                return current;
            }
            observation.changed().await.expect("list observation closed");
        }
    })
    .await
    .expect("timed out waiting for list payload")
}

pub async fn wait_object(
    observation: &mut ObjectObservation,
    predicate: impl Fn(&ObjectPayload) -> bool,
) -> ObjectPayload {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = observation.current();
            if predicate(&current) {
                return current;
            }
            observation.changed().await.expect("object observation closed");
        }
    })
    .await
    .expect("timed out waiting for object payload")
}

pub fn pks(payload: &ListPayload) -> Vec<PrimaryKey> {
    payload
        .objects
        .iter()
        .map(|o| o.primary_key().clone())
        .collect()
}
