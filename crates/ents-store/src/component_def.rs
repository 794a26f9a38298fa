//! Component definitions and the registry that assigns their ids.
//!
//! A definition is a named record schema identified to callers by its `uri`.
//! Ids are handed out sequentially by the registry on first registration and
//! are only meaningful within one store. Two definitions with the same uri
//! and property shape share a structural hash, which is the dedup key.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use hashbrown::HashMap;
use rustc_hash::FxHasher;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    component::Component,
    error::{StoreError, StoreResult},
};

/// Identifier of a registered definition. `0` means unregistered.
pub type DefId = u32;

const DEFAULT_PROPERTY_TYPE: &str = "string";

/// One declared attribute of a definition.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertySpec {
    pub name: String,
    /// Declared type name (`"type"` in JSON).
    pub kind: String,
    /// Value filled in by [`ComponentDef::create_component`]. `Null` means none.
    pub default: Value,
    pub optional: bool,
    /// Extra metadata keys. Carried through export but not part of the hash.
    pub additional: Map<String, Value>,
}

impl PropertySpec {
    /// A string property with no default.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DEFAULT_PROPERTY_TYPE.to_string(),
            default: Value::Null,
            optional: false,
            additional: Map::new(),
        }
    }

    #[must_use]
    pub fn with_type(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Normalize a property from either a bare name or an object.
    pub fn from_json(value: &Value) -> StoreResult<Self> {
        match value {
            Value::String(name) => Ok(Self::new(name.clone())),
            Value::Object(obj) => {
                let mut spec = match obj.get("name") {
                    Some(Value::String(name)) => Self::new(name.clone()),
                    _ => {
                        return Err(StoreError::InvalidDef(format!(
                            "property without a name: {value}"
                        )));
                    }
                };
                for (key, v) in obj {
                    match key.as_str() {
                        "name" => {}
                        "type" => {
                            spec.kind = v
                                .as_str()
                                .ok_or_else(|| {
                                    StoreError::InvalidDef(format!(
                                        "property {} has a non-string type",
                                        spec.name
                                    ))
                                })?
                                .to_string();
                        }
                        "default" => spec.default = v.clone(),
                        "optional" => spec.optional = v.as_bool().unwrap_or(false),
                        _ => {
                            spec.additional.insert(key.clone(), v.clone());
                        }
                    }
                }
                Ok(spec)
            }
            other => Err(StoreError::InvalidDef(format!(
                "property must be a name or an object, got {other}"
            ))),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("name".into(), Value::String(self.name.clone()));
        obj.insert("type".into(), Value::String(self.kind.clone()));
        if !self.default.is_null() {
            obj.insert("default".into(), self.default.clone());
        }
        if self.optional {
            obj.insert("optional".into(), Value::Bool(true));
        }
        for (key, v) in &self.additional {
            obj.insert(key.clone(), v.clone());
        }
        Value::Object(obj)
    }

    fn hash_shape<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.kind.hash(state);
        // serde_json maps are key-sorted, so the rendering is canonical
        self.default.to_string().hash(state);
        self.optional.hash(state);
    }
}

/// A registered (or about to be registered) record schema.
#[derive(Clone, PartialEq)]
pub struct ComponentDef {
    id: DefId,
    uri: String,
    name: String,
    properties: Vec<PropertySpec>,
    hash: u64,
}

impl ComponentDef {
    /// Build an unregistered definition (id 0).
    pub fn new(uri: impl Into<String>, properties: Vec<PropertySpec>) -> Self {
        let uri = uri.into();
        let name = name_from_uri(&uri);
        Self::build(0, uri, name, properties)
    }

    /// Build a definition carrying an explicit id.
    pub fn with_id(id: DefId, uri: impl Into<String>, properties: Vec<PropertySpec>) -> Self {
        let mut def = Self::new(uri, properties);
        def.id = id;
        def
    }

    /// Override the display name. Does not affect the hash.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn build(id: DefId, uri: String, name: String, properties: Vec<PropertySpec>) -> Self {
        let hash = structural_hash(&uri, &properties);
        Self {
            id,
            uri,
            name,
            properties,
            hash,
        }
    }

    /// Normalize any accepted description into a definition.
    ///
    /// Accepted shapes:
    /// - `"/component/title"`
    /// - `["/component/title", ["text", {"name": "rank", "type": "integer"}]]`
    /// - `[7, "/component/title", [...]]` (explicit id first)
    /// - `{"@d"?: 7, "uri": "...", "name"?: "...", "properties"?: [...]}`
    pub fn from_json(value: &Value) -> StoreResult<Self> {
        match value {
            Value::String(uri) => Ok(Self::new(uri.clone(), Vec::new())),
            Value::Array(items) => {
                let (id, rest) = match items.first() {
                    Some(Value::Number(n)) => (json_def_id(n)?, &items[1..]),
                    _ => (0, &items[..]),
                };
                let uri = match rest.first() {
                    Some(Value::String(uri)) => uri.clone(),
                    _ => {
                        return Err(StoreError::InvalidDef(format!(
                            "expected a uri in {value}"
                        )));
                    }
                };
                let properties = match rest.get(1) {
                    Some(props) => parse_properties(props)?,
                    None => Vec::new(),
                };
                Ok(Self::with_id(id, uri, properties))
            }
            Value::Object(obj) => {
                let uri = obj
                    .get("uri")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StoreError::InvalidDef(format!("missing uri in {value}")))?;
                let properties = match obj.get("properties") {
                    Some(props) => parse_properties(props)?,
                    None => Vec::new(),
                };
                let id = match obj.get("@d") {
                    Some(Value::Number(n)) => json_def_id(n)?,
                    _ => 0,
                };
                let mut def = Self::with_id(id, uri, properties);
                if let Some(name) = obj.get("name").and_then(Value::as_str) {
                    def.name = name.to_string();
                }
                Ok(def)
            }
            other => Err(StoreError::InvalidDef(format!(
                "cannot build a component def from {other}"
            ))),
        }
    }

    /// Export form: `{ "@d"?, "name", "uri", "properties"? }`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        if self.id != 0 {
            obj.insert("@d".into(), Value::from(self.id));
        }
        obj.insert("name".into(), Value::String(self.name.clone()));
        obj.insert("uri".into(), Value::String(self.uri.clone()));
        if !self.properties.is_empty() {
            obj.insert(
                "properties".into(),
                Value::Array(self.properties.iter().map(PropertySpec::to_json).collect()),
            );
        }
        Value::Object(obj)
    }

    #[must_use]
    pub const fn id(&self) -> DefId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: DefId) {
        self.id = id;
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn properties(&self) -> &[PropertySpec] {
        &self.properties
    }

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Structural hash over `(uri, properties)`.
    #[must_use]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Create an orphan component of this definition.
    ///
    /// Declared defaults are filled in first, then `attrs` is laid over them.
    #[must_use]
    pub fn create_component(&self, attrs: Map<String, Value>) -> Component {
        let mut com = Component::new(0, self.id);
        for prop in &self.properties {
            if !prop.default.is_null() {
                com.set(prop.name.clone(), prop.default.clone());
            }
        }
        for (key, value) in attrs {
            com.set(key, value);
        }
        com
    }
}

impl fmt::Debug for ComponentDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDef")
            .field("id", &self.id)
            .field("uri", &self.uri)
            .field("properties", &self.properties.len())
            .field("hash", &format_args!("{:#018x}", self.hash))
            .finish()
    }
}

fn json_def_id(n: &serde_json::Number) -> StoreResult<DefId> {
    n.as_u64()
        .and_then(|id| DefId::try_from(id).ok())
        .ok_or_else(|| StoreError::InvalidDef(format!("invalid def id {n}")))
}

fn parse_properties(value: &Value) -> StoreResult<Vec<PropertySpec>> {
    match value {
        Value::Array(items) => items.iter().map(PropertySpec::from_json).collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(StoreError::InvalidDef(format!(
            "properties must be an array, got {other}"
        ))),
    }
}

fn structural_hash(uri: &str, properties: &[PropertySpec]) -> u64 {
    let mut hasher = FxHasher::default();
    uri.hash(&mut hasher);
    (properties.len() as u64).hash(&mut hasher);
    for prop in properties {
        prop.hash_shape(&mut hasher);
    }
    hasher.finish()
}

/// `/component/todo-item` -> `TodoItem`
fn name_from_uri(uri: &str) -> String {
    let last = uri.rsplit('/').find(|s| !s.is_empty()).unwrap_or(uri);
    last.split(['-', '_'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect::<String>()
            })
        })
        .collect()
}

/// Registry of definitions for one store.
///
/// Registration is idempotent: re-registering a definition whose
/// structural hash is already known returns the existing definition.
#[derive(Clone, Default)]
pub struct ComponentDefRegistry {
    /// Definitions indexed by `id - 1`.
    defs: Vec<ComponentDef>,
    /// Latest definition registered for each uri.
    by_uri: HashMap<String, DefId>,
    by_hash: HashMap<u64, DefId>,
}

impl ComponentDefRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, returning the stored copy and whether it was new.
    pub fn register(&mut self, mut def: ComponentDef) -> (ComponentDef, bool) {
        if let Some(existing) = self
            .by_hash
            .get(&def.hash)
            .and_then(|&id| self.get_by_def_id(id))
        {
            debug!(uri = existing.uri(), id = existing.id(), "def already registered");
            return (existing.clone(), false);
        }

        let id = self.defs.len() as DefId + 1;
        def.set_id(id);
        if let Some(previous) = self.by_uri.insert(def.uri.clone(), id) {
            debug!(uri = def.uri(), previous, id, "uri now points at a new schema");
        }
        self.by_hash.insert(def.hash, id);
        debug!(uri = def.uri(), id, "registered component def");
        self.defs.push(def.clone());
        (def, true)
    }

    #[must_use]
    pub fn get_by_uri(&self, uri: &str) -> Option<&ComponentDef> {
        self.by_uri.get(uri).and_then(|&id| self.get_by_def_id(id))
    }

    #[must_use]
    pub fn get_by_hash(&self, hash: u64) -> Option<&ComponentDef> {
        self.by_hash.get(&hash).and_then(|&id| self.get_by_def_id(id))
    }

    #[must_use]
    pub fn get_by_def_id(&self, id: DefId) -> Option<&ComponentDef> {
        let idx = id.checked_sub(1)? as usize;
        self.defs.get(idx)
    }

    /// Look a definition up by id (number) or uri (string).
    #[must_use]
    pub fn resolve(&self, key: &Value) -> Option<&ComponentDef> {
        match key {
            Value::Number(n) => n
                .as_u64()
                .and_then(|id| DefId::try_from(id).ok())
                .and_then(|id| self.get_by_def_id(id)),
            Value::String(uri) => self.get_by_uri(uri),
            _ => None,
        }
    }

    #[must_use]
    pub fn defs(&self) -> &[ComponentDef] {
        &self.defs
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

impl fmt::Debug for ComponentDefRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDefRegistry")
            .field("count", &self.len())
            .field("defs", &self.defs)
            .finish()
    }
}
