// ── Ontology metadata and credentials ──
//
// Collaborator seams: the transport needs type definitions to resolve
// property sets and a bearer token to authenticate. Both are async because
// real implementations fetch them over the network.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::error::Error;

/// Property type whose values are streamed as reference updates.
pub const GEOTIME_SERIES_REFERENCE: &str = "geotimeSeriesReference";

/// Whether a subscription targets a concrete object type or an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TypeKind {
    Object,
    Interface,
}

/// A reference to an object or interface type by api name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTypeRef {
    pub kind: TypeKind,
    pub api_name: String,
}

impl ObjectTypeRef {
    pub fn object(api_name: impl Into<String>) -> Self {
        Self {
            kind: TypeKind::Object,
            api_name: api_name.into(),
        }
    }

    pub fn interface(api_name: impl Into<String>) -> Self {
        Self {
            kind: TypeKind::Interface,
            api_name: api_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefinition {
    #[serde(rename = "type")]
    pub data_type: String,
}

impl PropertyDefinition {
    pub fn new(data_type: impl Into<String>) -> Self {
        Self {
            data_type: data_type.into(),
        }
    }

    pub fn is_reference(&self) -> bool {
        self.data_type == GEOTIME_SERIES_REFERENCE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDefinition {
    pub api_name: String,
    pub primary_key_api_name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceDefinition {
    pub api_name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDefinition>,
}

/// Source of object and interface definitions.
pub trait OntologyProvider: Send + Sync {
    fn object_definition<'a>(
        &'a self,
        api_name: &'a str,
    ) -> BoxFuture<'a, Result<Arc<ObjectDefinition>, Error>>;

    fn interface_definition<'a>(
        &'a self,
        api_name: &'a str,
    ) -> BoxFuture<'a, Result<Arc<InterfaceDefinition>, Error>>;
}

/// Source of bearer tokens. Called on every (re)connect so rotated tokens
/// are picked up.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> BoxFuture<'_, Result<SecretString, Error>>;
}

// ── Static implementations ───────────────────────────────────────────

/// A fixed token.
#[derive(Clone)]
pub struct StaticToken(SecretString);

impl StaticToken {
    pub fn new(token: SecretString) -> Self {
        Self(token)
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> BoxFuture<'_, Result<SecretString, Error>> {
        Box::pin(future::ready(Ok(self.0.clone())))
    }
}

/// In-memory ontology, populated up front.
#[derive(Debug, Clone, Default)]
pub struct StaticOntology {
    objects: HashMap<String, Arc<ObjectDefinition>>,
    interfaces: HashMap<String, Arc<InterfaceDefinition>>,
}

impl StaticOntology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, def: ObjectDefinition) -> Self {
        self.objects.insert(def.api_name.clone(), Arc::new(def));
        self
    }

    pub fn with_interface(mut self, def: InterfaceDefinition) -> Self {
        self.interfaces.insert(def.api_name.clone(), Arc::new(def));
        self
    }
}

impl OntologyProvider for StaticOntology {
    fn object_definition<'a>(
        &'a self,
        api_name: &'a str,
    ) -> BoxFuture<'a, Result<Arc<ObjectDefinition>, Error>> {
        let found = self
            .objects
            .get(api_name)
            .cloned()
            .ok_or_else(|| Error::UnknownType {
                kind: "object",
                api_name: api_name.to_owned(),
            });
        Box::pin(future::ready(found))
    }

    fn interface_definition<'a>(
        &'a self,
        api_name: &'a str,
    ) -> BoxFuture<'a, Result<Arc<InterfaceDefinition>, Error>> {
        let found = self
            .interfaces
            .get(api_name)
            .cloned()
            .ok_or_else(|| Error::UnknownType {
                kind: "interface",
                api_name: api_name.to_owned(),
            });
        Box::pin(future::ready(found))
    }
}

// ── Property resolution ──────────────────────────────────────────────

/// Requested properties split by how the server streams them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySelection {
    pub properties: Vec<String>,
    pub reference_properties: Vec<String>,
    /// Primary key property name, known only for object subscriptions.
    pub primary_key_property: Option<String>,
}

/// Resolve the requested property names against the type definition.
///
/// An empty request selects every property. Unknown names are dropped.
pub async fn resolve_properties(
    ontology: &dyn OntologyProvider,
    type_ref: &ObjectTypeRef,
    requested: &[String],
) -> Result<PropertySelection, Error> {
    let (defs, primary_key_property) = match type_ref.kind {
        TypeKind::Object => {
            let def = ontology.object_definition(&type_ref.api_name).await?;
            (def.properties.clone(), Some(def.primary_key_api_name.clone()))
        }
        TypeKind::Interface => {
            let def = ontology.interface_definition(&type_ref.api_name).await?;
            (def.properties.clone(), None)
        }
    };

    let wanted: Vec<&String> = if requested.is_empty() {
        defs.keys().collect()
    } else {
        requested.iter().filter(|p| defs.contains_key(*p)).collect()
    };

    let mut selection = PropertySelection {
        primary_key_property,
        ..PropertySelection::default()
    };
    for name in wanted {
        let is_reference = defs.get(name).is_some_and(PropertyDefinition::is_reference);
        if is_reference {
            selection.reference_properties.push(name.clone());
        } else {
            selection.properties.push(name.clone());
        }
    }
    Ok(selection)
}
