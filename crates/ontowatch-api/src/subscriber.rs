// ── Subscriber seam ──
//
// `ObjectSetSubscriber` is the boundary the cache talks to. Both bindings
// implement it; decorators (see `metrics`) wrap it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};
use url::Url;

use crate::backoff::ReconnectConfig;
use crate::error::Error;
use crate::listener::{ObjectSetListener, ObjectUpdate};
use crate::object::ObjectFactory;
use crate::ontology::{ObjectTypeRef, OntologyProvider, TokenProvider, TypeKind, resolve_properties};
use crate::sse_subscriber::SseSubscriber;
use crate::transport::TransportConfig;
use crate::websocket::WebSocketSubscriber;
use crate::wire::{ObjectLoadingResponseOptions, ObjectSetUpdate, SubscribeRequest};

/// Everything a subscriber needs to reach the server and decode objects.
#[derive(Clone)]
pub struct FeedContext {
    pub base_url: Url,
    pub ontology_rid: String,
    pub tokens: Arc<dyn TokenProvider>,
    pub ontology: Arc<dyn OntologyProvider>,
    pub objects: Arc<dyn ObjectFactory>,
}

impl fmt::Debug for FeedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedContext")
            .field("base_url", &self.base_url.as_str())
            .field("ontology_rid", &self.ontology_rid)
            .finish_non_exhaustive()
    }
}

/// What to subscribe to.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeSpec {
    pub object_type: ObjectTypeRef,
    /// Wire-format object set definition.
    pub object_set: Value,
    /// Requested properties; empty means all.
    pub properties: Vec<String>,
    pub load_rids: bool,
    /// SSE only: ask the server to stream the current contents first.
    pub include_initial_state: bool,
}

impl SubscribeSpec {
    /// Subscribe to every object of a type.
    pub fn base(object_type: ObjectTypeRef) -> Self {
        let object_set = match object_type.kind {
            TypeKind::Object => {
                serde_json::json!({"type": "base", "objectType": object_type.api_name})
            }
            TypeKind::Interface => {
                serde_json::json!({"type": "interfaceBase", "interfaceType": object_type.api_name})
            }
        };
        Self {
            object_type,
            object_set,
            properties: Vec::new(),
            load_rids: false,
            include_initial_state: false,
        }
    }

    pub fn with_object_set(mut self, object_set: Value) -> Self {
        self.object_set = object_set;
        self
    }

    pub fn with_properties(mut self, properties: Vec<String>) -> Self {
        self.properties = properties;
        self
    }
}

/// Opens live subscriptions on an object set.
pub trait ObjectSetSubscriber: Send + Sync {
    fn subscribe(
        &self,
        spec: SubscribeSpec,
        listener: Arc<dyn ObjectSetListener>,
    ) -> BoxFuture<'_, Result<SubscriptionHandle, Error>>;
}

impl<T: ObjectSetSubscriber + ?Sized> ObjectSetSubscriber for Arc<T> {
    fn subscribe(
        &self,
        spec: SubscribeSpec,
        listener: Arc<dyn ObjectSetListener>,
    ) -> BoxFuture<'_, Result<SubscriptionHandle, Error>> {
        (**self).subscribe(spec, listener)
    }
}

// ── SubscriptionHandle ───────────────────────────────────────────────

/// Cancels one subscription. Cloneable; `unsubscribe` is idempotent.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    active: AtomicBool,
    on_cancel: Box<dyn Fn() + Send + Sync>,
}

impl SubscriptionHandle {
    pub fn new(on_cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                active: AtomicBool::new(true),
                on_cancel: Box::new(on_cancel),
            }),
        }
    }

    /// Stop delivery and release the subscription. Later calls do nothing.
    pub fn unsubscribe(&self) {
        if self.inner.active.swap(false, Ordering::AcqRel) {
            (self.inner.on_cancel)();
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

// ── Transport selection ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StreamTransport {
    /// One HTTP stream per subscription.
    #[default]
    Sse,
    /// One multiplexed socket for all subscriptions.
    WebSocket,
}

#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub transport: StreamTransport,
    pub reconnect: ReconnectConfig,
    /// How long an idle WebSocket stays open after its last unsubscribe.
    pub teardown_grace: Duration,
    pub http: TransportConfig,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            transport: StreamTransport::default(),
            reconnect: ReconnectConfig::default(),
            teardown_grace: Duration::from_secs(15),
            http: TransportConfig::default(),
        }
    }
}

/// Build the subscriber for the configured binding.
///
/// The WebSocket binding spawns its connection task, so this must run
/// inside a tokio runtime.
pub fn connect_feed(
    ctx: FeedContext,
    options: &FeedOptions,
) -> Result<Arc<dyn ObjectSetSubscriber>, Error> {
    match options.transport {
        StreamTransport::Sse => {
            let http = options.http.build_client()?;
            Ok(Arc::new(SseSubscriber::new(ctx, http, options.reconnect.clone())))
        }
        StreamTransport::WebSocket => Ok(Arc::new(WebSocketSubscriber::spawn(ctx, options))),
    }
}

// ── Resolved subscriptions ───────────────────────────────────────────

/// A spec resolved against the ontology: the wire request plus what is
/// needed to decode updates for it.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedSubscription {
    pub request: SubscribeRequest,
    pub interface_api_name: Option<String>,
    pub primary_key_property: Option<String>,
    pub reference_properties: Vec<String>,
}

impl ResolvedSubscription {
    pub(crate) async fn resolve(ctx: &FeedContext, spec: &SubscribeSpec) -> Result<Self, Error> {
        let selection =
            resolve_properties(ctx.ontology.as_ref(), &spec.object_type, &spec.properties).await?;
        let interface_api_name = match spec.object_type.kind {
            TypeKind::Interface => Some(spec.object_type.api_name.clone()),
            TypeKind::Object => None,
        };

        Ok(Self {
            request: SubscribeRequest {
                object_set: spec.object_set.clone(),
                property_set: selection.properties,
                reference_set: selection.reference_properties.clone(),
                object_loading_response_options: spec.load_rids.then_some(
                    ObjectLoadingResponseOptions {
                        should_load_object_rids: true,
                    },
                ),
            },
            interface_api_name,
            primary_key_property: selection.primary_key_property,
            reference_properties: selection.reference_properties,
        })
    }

    /// Decode wire updates. Updates that fail to decode are logged and skipped.
    pub(crate) fn decode_updates(
        &self,
        factory: &dyn ObjectFactory,
        updates: Vec<ObjectSetUpdate>,
    ) -> Vec<ObjectUpdate> {
        let mut decoded = Vec::with_capacity(updates.len());
        for update in updates {
            let (raw, state) = match update {
                ObjectSetUpdate::Object {
                    mut object,
                    state,
                    rid,
                } => {
                    for prop in &self.reference_properties {
                        object.remove(prop);
                    }
                    if let Some(rid) = rid {
                        object.entry("__rid").or_insert(Value::String(rid));
                    }
                    (object, state)
                }
                ObjectSetUpdate::Reference {
                    object_type,
                    primary_key,
                    property,
                    value,
                } => (
                    self.reference_to_object(object_type, primary_key, property, value),
                    crate::wire::ObjectState::AddedOrUpdated,
                ),
            };

            match factory.create(raw, self.interface_api_name.as_deref()) {
                Ok(object) => decoded.push(ObjectUpdate {
                    object: Arc::new(object),
                    state,
                }),
                Err(e) => tracing::warn!(error = %e, "dropping undecodable object update"),
            }
        }
        decoded
    }

    fn reference_to_object(
        &self,
        object_type: String,
        primary_key: Map<String, Value>,
        property: String,
        value: Value,
    ) -> Map<String, Value> {
        let key_value = self
            .primary_key_property
            .as_ref()
            .and_then(|pk| primary_key.get(pk))
            .or_else(|| primary_key.values().next())
            .cloned()
            .unwrap_or(Value::Null);

        let mut raw = Map::new();
        raw.insert("__apiName".into(), Value::String(object_type));
        raw.insert("__primaryKey".into(), key_value);
        raw.extend(primary_key);
        raw.insert(property, value);
        raw
    }
}
