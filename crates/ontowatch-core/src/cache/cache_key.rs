// ── Cache keys ──
//
// Structural identity for everything the store caches. Keys are interned
// through `CacheKeyRegistry` so that equal keys share one allocation and
// compare by pointer on the hot path.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ontowatch_api::{ObjectTypeRef, PrimaryKey, TypeKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display};

/// A JSON value paired with its canonical text.
///
/// Equality and hashing use the text only, so two canonical values that
/// serialize the same are the same key component.
#[derive(Clone)]
pub struct Canonical {
    json: Arc<str>,
    value: Arc<Value>,
}

impl Canonical {
    /// Wrap an already-canonicalized value.
    pub fn new(value: Value) -> Self {
        Self {
            json: Arc::from(value.to_string()),
            value: Arc::new(value),
        }
    }

    /// The empty filter `{}`.
    pub fn empty() -> Self {
        Self::new(Value::Object(serde_json::Map::new()))
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn shared_value(&self) -> Arc<Value> {
        Arc::clone(&self.value)
    }

    pub fn as_str(&self) -> &str {
        &self.json
    }

    pub fn is_empty_object(&self) -> bool {
        self.value.as_object().is_some_and(serde_json::Map::is_empty)
    }
}

impl PartialEq for Canonical {
    fn eq(&self, other: &Self) -> bool {
        self.json == other.json
    }
}

impl Eq for Canonical {}

impl Hash for Canonical {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.json.hash(state);
    }
}

impl fmt::Debug for Canonical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.json)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// One `orderBy` term. Term priority is the position in the list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderTerm {
    pub property: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderTerm {
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// The identity fields of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyData {
    Object {
        api_name: String,
        primary_key: PrimaryKey,
    },
    List {
        kind: TypeKind,
        api_name: String,
        filter: Canonical,
        order_by: Vec<OrderTerm>,
        page_size: Option<u32>,
    },
}

/// Interned, immutable cache key.
#[derive(Clone)]
pub struct CacheKey(Arc<KeyData>);

impl CacheKey {
    pub fn data(&self) -> &KeyData {
        &self.0
    }

    pub fn api_name(&self) -> &str {
        match &*self.0 {
            KeyData::Object { api_name, .. } | KeyData::List { api_name, .. } => api_name,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(*self.0, KeyData::Object { .. })
    }

    pub fn is_list(&self) -> bool {
        matches!(*self.0, KeyData::List { .. })
    }

    pub fn primary_key(&self) -> Option<&PrimaryKey> {
        match &*self.0 {
            KeyData::Object { primary_key, .. } => Some(primary_key),
            KeyData::List { .. } => None,
        }
    }

    /// The type a list key ranges over.
    pub fn type_ref(&self) -> ObjectTypeRef {
        match &*self.0 {
            KeyData::Object { api_name, .. } => ObjectTypeRef::object(api_name.clone()),
            KeyData::List { kind, api_name, .. } => ObjectTypeRef {
                kind: *kind,
                api_name: api_name.clone(),
            },
        }
    }

    /// Whether both handles point at the same interned allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            KeyData::Object {
                api_name,
                primary_key,
            } => write!(f, "object:{api_name}:{primary_key}"),
            KeyData::List {
                kind,
                api_name,
                filter,
                order_by,
                page_size,
            } => {
                write!(f, "list:{kind}:{api_name}:{filter:?}")?;
                for term in order_by {
                    write!(f, ":{}={}", term.property, term.direction)?;
                }
                if let Some(size) = page_size {
                    write!(f, ":page={size}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::borrow::Borrow<KeyData> for CacheKey {
    fn borrow(&self) -> &KeyData {
        &self.0
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Interns cache keys so that structurally equal keys share identity.
#[derive(Debug, Default)]
pub struct CacheKeyRegistry {
    keys: HashSet<CacheKey>,
}

impl CacheKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the interned key for `data`, creating it if needed.
    /// The flag is `true` when the key was created by this call.
    pub fn get(&mut self, data: KeyData) -> (CacheKey, bool) {
        if let Some(existing) = self.keys.get(&data) {
            return (existing.clone(), false);
        }
        let key = CacheKey(Arc::new(data));
        self.keys.insert(key.clone());
        (key, true)
    }

    pub fn remove(&mut self, key: &CacheKey) -> bool {
        self.keys.remove(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
