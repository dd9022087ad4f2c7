// ontowatch-api: change-feed transport for ontology object sets (SSE + WebSocket)

pub mod backoff;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod object;
pub mod ontology;
pub mod sse;
pub mod sse_subscriber;
pub mod subscriber;
pub mod transport;
pub mod websocket;
pub mod wire;

pub use backoff::{ExponentialBackoff, ReconnectConfig};
pub use error::Error;
pub use listener::{ErrorCause, ObjectSetListener, ObjectUpdate, SubscriptionError};
pub use metrics::{FeedMetrics, FeedMetricsSnapshot, MeteredSubscriber};
pub use object::{ObjectFactory, ObjectInstance, PrimaryKey, WireObjectFactory};
pub use ontology::{
    InterfaceDefinition, ObjectDefinition, ObjectTypeRef, OntologyProvider, PropertyDefinition,
    StaticOntology, StaticToken, TokenProvider, TypeKind,
};
pub use sse_subscriber::SseSubscriber;
pub use subscriber::{
    FeedContext, FeedOptions, ObjectSetSubscriber, StreamTransport, SubscribeSpec,
    SubscriptionHandle, connect_feed,
};
pub use transport::{TlsMode, TransportConfig};
pub use websocket::{SubscriptionStatus, WebSocketSubscriber};
pub use wire::ObjectState;
