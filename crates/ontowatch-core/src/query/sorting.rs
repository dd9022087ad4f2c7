// ── List ordering ──

use std::cmp::Ordering;
use std::sync::Arc;

use ontowatch_api::ObjectInstance;
use serde_json::Value;

use crate::cache::{CacheKey, OrderTerm, SortDirection};

use super::where_clause::compare_values;

/// Orders the keys of a list. `lookup` resolves a key to its cached object.
pub trait SortingStrategy: Send + Sync {
    fn sort(
        &self,
        keys: Vec<CacheKey>,
        lookup: &dyn Fn(&CacheKey) -> Option<Arc<ObjectInstance>>,
    ) -> Vec<CacheKey>;
}

/// Keeps keys in the order they were received.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertionOrder;

impl SortingStrategy for InsertionOrder {
    fn sort(
        &self,
        keys: Vec<CacheKey>,
        _lookup: &dyn Fn(&CacheKey) -> Option<Arc<ObjectInstance>>,
    ) -> Vec<CacheKey> {
        keys
    }
}

/// Sorts by a sequence of property terms. Missing and null values sort last
/// in either direction. The sort is stable.
#[derive(Debug, Clone, Default)]
pub struct OrderBySort {
    terms: Vec<OrderTerm>,
}

impl OrderBySort {
    pub fn new(terms: Vec<OrderTerm>) -> Self {
        Self { terms }
    }

    fn compare(&self, a: Option<&ObjectInstance>, b: Option<&ObjectInstance>) -> Ordering {
        for term in &self.terms {
            let left = a.and_then(|o| present(o.property(&term.property)));
            let right = b.and_then(|o| present(o.property(&term.property)));
            let ordering = match (left, right) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(l), Some(r)) => {
                    let ordering = compare_values(l, r)
                        .unwrap_or_else(|| l.to_string().cmp(&r.to_string()));
                    match term.direction {
                        SortDirection::Asc => ordering,
                        SortDirection::Desc => ordering.reverse(),
                    }
                }
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

impl SortingStrategy for OrderBySort {
    fn sort(
        &self,
        keys: Vec<CacheKey>,
        lookup: &dyn Fn(&CacheKey) -> Option<Arc<ObjectInstance>>,
    ) -> Vec<CacheKey> {
        if self.terms.is_empty() {
            return keys;
        }
        let mut resolved: Vec<(CacheKey, Option<Arc<ObjectInstance>>)> = keys
            .into_iter()
            .map(|key| {
                let object = lookup(&key);
                (key, object)
            })
            .collect();
        resolved.sort_by(|(_, a), (_, b)| self.compare(a.as_deref(), b.as_deref()));
        resolved.into_iter().map(|(key, _)| key).collect()
    }
}
