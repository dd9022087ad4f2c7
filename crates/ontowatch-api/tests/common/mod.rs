// Shared helpers for the change-feed integration tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use ontowatch_api::{
    ErrorCause, FeedContext, ObjectDefinition, ObjectSetListener, ObjectUpdate, PrimaryKey,
    PropertyDefinition, ReconnectConfig, StaticOntology, StaticToken, SubscriptionError,
    WireObjectFactory,
};

pub const TOKEN: &str = "secret-token";
pub const ONTOLOGY: &str = "ri.ontology.main";

/// Everything a listener can observe, flattened for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Subscribed,
    OutOfDate,
    InitialLoadComplete,
    Change { pk: PrimaryKey, body: Option<Value>, removed: bool },
    Error { closed: bool, cause: ErrorCause },
}

pub struct Recorder(mpsc::UnboundedSender<Event>);

impl ObjectSetListener for Recorder {
    fn on_change(&self, update: ObjectUpdate) {
        let _ = self.0.send(Event::Change {
            pk: update.object.primary_key().clone(),
            body: update.object.property("body").cloned(),
            removed: update.state == ontowatch_api::ObjectState::Removed,
        });
    }

    fn on_successful_subscription(&self) {
        let _ = self.0.send(Event::Subscribed);
    }

    fn on_out_of_date(&self) {
        let _ = self.0.send(Event::OutOfDate);
    }

    fn on_error(&self, error: SubscriptionError) {
        let _ = self.0.send(Event::Error {
            closed: error.subscription_closed,
            cause: error.cause,
        });
    }

    fn on_initial_load_complete(&self) {
        let _ = self.0.send(Event::InitialLoadComplete);
    }
}

pub fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder(tx)), rx)
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for listener event")
        .expect("listener channel closed")
}

/// Asserts nothing arrives for a short while.
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Event>) {
    if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await {
        panic!("unexpected listener event: {event:?}");
    }
}

pub fn context(base_url: &str) -> FeedContext {
    let todo = ObjectDefinition {
        api_name: "Todo".into(),
        primary_key_api_name: "id".into(),
        properties: BTreeMap::from([
            ("id".into(), PropertyDefinition::new("integer")),
            ("body".into(), PropertyDefinition::new("string")),
        ]),
    };
    FeedContext {
        base_url: Url::parse(base_url).unwrap(),
        ontology_rid: ONTOLOGY.into(),
        tokens: Arc::new(StaticToken::new(TOKEN.to_string().into())),
        ontology: Arc::new(StaticOntology::new().with_object(todo)),
        objects: Arc::new(WireObjectFactory),
    }
}

pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_retries: None,
    }
}
