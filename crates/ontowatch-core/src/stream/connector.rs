// ── List payload connector ──
//
// A list observer needs more than the list entry: each member object has
// its own subject, and the feed status lives on the query. One task per
// observed list merges all of them into a single `ListPayload` channel.
// Bursts of member changes are coalesced by yielding once per round.

use std::sync::{Arc, Weak};

use futures_util::StreamExt;
use futures_util::stream::select_all;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::query::CollectionQuery;
use crate::store::{Snapshot, Store};

use super::payload::{FeedStatus, ListPayload};

/// Assemble a payload from the list snapshot. Also returns the member
/// subjects so the caller can wait on them.
pub(crate) fn build_list_payload(
    store: &Store,
    list: &Snapshot,
    feed: FeedStatus,
    has_more: bool,
) -> (ListPayload, Vec<watch::Receiver<Snapshot>>) {
    let data = list.entry.value.as_collection();
    let members: Vec<watch::Receiver<Snapshot>> = data
        .map(|data| data.data.iter().map(|key| store.subject(key)).collect())
        .unwrap_or_default();

    let mut is_optimistic = list.is_optimistic;
    let mut last_updated = list.entry.last_updated;
    let mut objects = Vec::with_capacity(members.len());
    for member in &members {
        let snapshot = member.borrow();
        is_optimistic |= snapshot.is_optimistic;
        last_updated = last_updated.max(snapshot.entry.last_updated);
        if let Some(object) = snapshot.entry.value.as_object() {
            objects.push(Arc::clone(object));
        }
    }

    let payload = ListPayload {
        objects,
        status: list.entry.status,
        is_optimistic,
        last_updated,
        has_more,
        total_count: data.and_then(|data| data.total_count),
        feed,
    };
    (payload, members)
}

/// Keep the query's payload channel current until `cancel` fires, the list
/// is evicted, or the query is dropped.
pub(crate) async fn run(query: Weak<CollectionQuery>, cancel: CancellationToken) {
    let (mut list_rx, mut feed_rx) = {
        let Some(query) = query.upgrade() else { return };
        (query.store().subject(query.key()), query.feed_status())
    };

    loop {
        let members = {
            let Some(query) = query.upgrade() else { break };
            let list = list_rx.borrow_and_update().clone();
            let feed = feed_rx.borrow_and_update().clone();
            let (payload, members) =
                build_list_payload(query.store(), &list, feed, query.has_more());
            query.publish(payload);
            members
        };
        let mut member_changes = select_all(members.into_iter().map(WatchStream::from_changes));

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = list_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = feed_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            Some(_) = member_changes.next() => {}
        }
        tokio::task::yield_now().await;
    }
    tracing::trace!("list connector exiting");
}
