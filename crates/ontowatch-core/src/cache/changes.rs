// ── Change sets ──
//
// Accumulated by a batch and handed to every query afterwards so lists
// can maintain themselves. The same set is threaded through follow-up
// batches; a query marks its own key in `modified` once it has reacted.

use std::collections::HashSet;
use std::sync::Arc;

use ontowatch_api::ObjectInstance;

use super::cache_key::CacheKey;

#[derive(Debug, Default, Clone)]
pub struct Changes {
    pub added_objects: Vec<Arc<ObjectInstance>>,
    pub modified_objects: Vec<Arc<ObjectInstance>>,
    pub added: HashSet<CacheKey>,
    pub modified: HashSet<CacheKey>,
    pub deleted: HashSet<CacheKey>,
}

impl Changes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_object(&mut self, key: CacheKey, object: Arc<ObjectInstance>, is_new: bool) {
        if is_new {
            self.added_objects.push(object);
            self.added.insert(key);
        } else {
            self.modified_objects.push(object);
            self.modified.insert(key);
        }
    }

    pub fn register_list(&mut self, key: CacheKey) {
        self.modified.insert(key);
    }

    pub fn delete(&mut self, key: CacheKey) {
        self.deleted.insert(key);
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Objects added or modified whose concrete type is `object_type`.
    pub fn objects_of_type<'a>(
        &'a self,
        object_type: &'a str,
    ) -> impl Iterator<Item = (&'a Arc<ObjectInstance>, bool)> + 'a {
        let added = self.added_objects.iter().map(|o| (o, true));
        let modified = self.modified_objects.iter().map(|o| (o, false));
        added
            .chain(modified)
            .filter(move |(o, _)| o.object_type() == object_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::cache_key::{CacheKeyRegistry, KeyData};
    use ontowatch_api::PrimaryKey;

    #[test]
    fn objects_are_split_by_novelty_and_type() {
        let mut registry = CacheKeyRegistry::new();
        let key = |registry: &mut CacheKeyRegistry, api: &str, pk: i64| {
            registry
                .get(KeyData::Object {
                    api_name: api.into(),
                    primary_key: PrimaryKey::Integer(pk),
                })
                .0
        };

        let mut changes = Changes::new();
        assert!(changes.is_empty());
        changes.register_object(
            key(&mut registry, "Todo", 1),
            Arc::new(ObjectInstance::new("Todo", 1)),
            true,
        );
        changes.register_object(
            key(&mut registry, "Todo", 2),
            Arc::new(ObjectInstance::new("Todo", 2)),
            false,
        );
        changes.register_object(
            key(&mut registry, "Person", 3),
            Arc::new(ObjectInstance::new("Person", 3)),
            true,
        );

        let todos: Vec<bool> = changes.objects_of_type("Todo").map(|(_, new)| new).collect();
        assert_eq!(todos, vec![true, false]);
        assert_eq!(changes.added.len(), 2);
        assert!(!changes.is_empty());
    }
}
