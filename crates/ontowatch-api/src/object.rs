// ── Ontology objects ──
//
// Objects arrive on the wire as flat JSON maps carrying `__apiName`,
// `__primaryKey`, and optionally `__rid` next to their properties.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Primary key of an object. Keys are strings or integers on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Integer(i64),
    String(String),
}

impl PrimaryKey {
    /// Parse a primary key out of an arbitrary JSON value.
    ///
    /// Non-integral numbers and booleans fall back to their JSON text.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Number(n) => Some(
                n.as_i64()
                    .map_or_else(|| Self::String(n.to_string()), Self::Integer),
            ),
            Value::Bool(b) => Some(Self::String(b.to_string())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Integer(i) => Value::from(*i),
            Self::String(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for PrimaryKey {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// A single ontology object as held by the cache.
///
/// `api_name` is the name the object was requested under (an interface name
/// for interface subscriptions), `object_type` is always the concrete type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInstance {
    api_name: String,
    object_type: String,
    primary_key: PrimaryKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rid: Option<String>,
    properties: Map<String, Value>,
}

impl ObjectInstance {
    pub fn new(api_name: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
        let api_name = api_name.into();
        Self {
            object_type: api_name.clone(),
            api_name,
            primary_key: primary_key.into(),
            rid: None,
            properties: Map::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_rid(mut self, rid: impl Into<String>) -> Self {
        self.rid = Some(rid.into());
        self
    }

    /// View this object through an interface.
    pub fn as_interface(mut self, interface_api_name: impl Into<String>) -> Self {
        self.api_name = interface_api_name.into();
        self
    }

    pub fn api_name(&self) -> &str {
        &self.api_name
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    pub fn rid(&self) -> Option<&str> {
        self.rid.as_deref()
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    /// Render back into the flat wire shape.
    pub fn to_wire(&self) -> Map<String, Value> {
        let mut map = self.properties.clone();
        map.insert("__apiName".into(), Value::String(self.object_type.clone()));
        map.insert("__primaryKey".into(), self.primary_key.to_json());
        if let Some(rid) = &self.rid {
            map.insert("__rid".into(), Value::String(rid.clone()));
        }
        map
    }
}

// ── Factory ──────────────────────────────────────────────────────────

/// Turns raw wire objects into `ObjectInstance`s.
///
/// Embedders can swap this out to attach derived properties or to validate
/// payloads against generated types.
pub trait ObjectFactory: Send + Sync {
    fn create(
        &self,
        raw: Map<String, Value>,
        interface_api_name: Option<&str>,
    ) -> Result<ObjectInstance, Error>;
}

/// Default factory: reads the `__`-prefixed metadata and keeps every other
/// field as a property.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireObjectFactory;

impl ObjectFactory for WireObjectFactory {
    fn create(
        &self,
        mut raw: Map<String, Value>,
        interface_api_name: Option<&str>,
    ) -> Result<ObjectInstance, Error> {
        let object_type = match raw.remove("__apiName") {
            Some(Value::String(name)) => name,
            _ => return Err(Error::InvalidObject("missing __apiName".into())),
        };
        let primary_key = raw
            .remove("__primaryKey")
            .as_ref()
            .and_then(PrimaryKey::from_json)
            .ok_or_else(|| {
                Error::InvalidObject(format!("{object_type} object without __primaryKey"))
            })?;
        let rid = match raw.remove("__rid") {
            Some(Value::String(rid)) => Some(rid),
            _ => None,
        };
        raw.retain(|k, _| !k.starts_with("__"));

        Ok(ObjectInstance {
            api_name: interface_api_name.map_or_else(|| object_type.clone(), str::to_owned),
            object_type,
            primary_key,
            rid,
            properties: raw,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn factory_strips_metadata() {
        let obj = WireObjectFactory
            .create(
                raw(json!({
                    "__apiName": "Todo",
                    "__primaryKey": 1,
                    "__rid": "ri.todo.1",
                    "__title": "ignored",
                    "body": "x",
                })),
                None,
            )
            .unwrap();

        assert_eq!(obj.api_name(), "Todo");
        assert_eq!(obj.primary_key(), &PrimaryKey::Integer(1));
        assert_eq!(obj.rid(), Some("ri.todo.1"));
        assert_eq!(obj.properties().len(), 1);
        assert_eq!(obj.property("body"), Some(&json!("x")));
    }

    #[test]
    fn factory_views_object_through_interface() {
        let obj = WireObjectFactory
            .create(
                raw(json!({"__apiName": "Employee", "__primaryKey": "e1"})),
                Some("Person"),
            )
            .unwrap();
        assert_eq!(obj.api_name(), "Person");
        assert_eq!(obj.object_type(), "Employee");
    }

    #[test]
    fn factory_rejects_objects_without_key() {
        let err = WireObjectFactory
            .create(raw(json!({"__apiName": "Todo"})), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidObject(_)));
    }

    #[test]
    fn wire_roundtrip_keeps_metadata() {
        let obj = ObjectInstance::new("Todo", 7).with_property("body", "y");
        let back = WireObjectFactory.create(obj.to_wire(), None).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn primary_key_from_fractional_number_is_textual() {
        assert_eq!(
            PrimaryKey::from_json(&json!(1.5)),
            Some(PrimaryKey::String("1.5".into()))
        );
        assert_eq!(PrimaryKey::from_json(&Value::Null), None);
    }
}
