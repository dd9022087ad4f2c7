use std::sync::Arc;

use ontowatch_api::ObjectInstance;
use serde::Serialize;

use crate::cache::Status;
use crate::store::Snapshot;

/// State of a list's change-feed subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum FeedStatus {
    /// No feed is configured, or nobody is observing the list.
    #[default]
    Disabled,
    Connecting,
    Subscribed,
    /// Updates may have been missed; a refetch is under way.
    OutOfDate,
    #[serde(rename_all = "camelCase")]
    Closed {
        subscription_closed: bool,
        message: String,
    },
}

/// What an object observer sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPayload {
    /// `None` until loaded, and after the object was deleted.
    pub object: Option<Arc<ObjectInstance>>,
    pub status: Status,
    pub last_updated: i64,
    pub is_optimistic: bool,
}

impl From<&Snapshot> for ObjectPayload {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            object: snapshot.entry.value.as_object().cloned(),
            status: snapshot.entry.status,
            last_updated: snapshot.entry.last_updated,
            is_optimistic: snapshot.is_optimistic,
        }
    }
}

/// What a list observer sees.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPayload {
    pub objects: Vec<Arc<ObjectInstance>>,
    pub status: Status,
    /// The list entry or any member differs from server truth.
    pub is_optimistic: bool,
    pub last_updated: i64,
    pub has_more: bool,
    pub total_count: Option<u64>,
    pub feed: FeedStatus,
}
