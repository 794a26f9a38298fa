//! Component records and their primary key.
//!
//! A component is a flat attribute map carrying two reserved fields, the
//! owning entity id (`@e`) and the definition id (`@d`). A component whose
//! entity id is `0` is an orphan: it has not been attached to an entity yet
//! and has no [`ComponentId`].
//!
//! # Wire Format
//!
//! ```text
//! { "@e": 23, "@d": 2, "text": "buy milk", ... }
//! ```
//!
//! The textual form of a [`ComponentId`] is `"[23,2]"`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    component_def::{ComponentDefRegistry, DefId},
    entity::EntityId,
    error::{StoreError, StoreResult},
};

/// Primary key of the component table: `(entity, def)`.
///
/// Orders by entity first, then definition, so a range scan over one
/// entity's components is contiguous.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentId {
    pub entity_id: EntityId,
    pub def_id: DefId,
}

impl ComponentId {
    #[must_use]
    pub const fn new(entity_id: EntityId, def_id: DefId) -> Self {
        Self { entity_id, def_id }
    }

    /// Pack into a single u64: `(entity << 32) | def`.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.entity_id as u64) << 32) | (self.def_id as u64)
    }

    /// Unpack from [`ComponentId::to_bits`].
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            entity_id: (bits >> 32) as u32,
            def_id: bits as u32,
        }
    }

    /// The `[entity, def]` tuple form.
    #[must_use]
    pub const fn to_tuple(self) -> (EntityId, DefId) {
        (self.entity_id, self.def_id)
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId[{},{}]", self.entity_id, self.def_id)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.entity_id, self.def_id)
    }
}

impl FromStr for ComponentId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_id, def_id): (EntityId, DefId) =
            serde_json::from_str(s).map_err(|_| StoreError::InvalidComponentId(s.to_string()))?;
        Ok(Self::new(entity_id, def_id))
    }
}

impl Serialize for ComponentId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_tuple().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ComponentId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (entity_id, def_id) = <(EntityId, DefId)>::deserialize(deserializer)?;
        Ok(Self::new(entity_id, def_id))
    }
}

/// A schema-typed record attached to at most one entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Component {
    #[serde(rename = "@e", default)]
    pub entity_id: EntityId,
    #[serde(rename = "@d")]
    pub def_id: DefId,
    #[serde(flatten)]
    pub attrs: Map<String, Value>,
}

impl Component {
    #[must_use]
    pub fn new(entity_id: EntityId, def_id: DefId) -> Self {
        Self {
            entity_id,
            def_id,
            attrs: Map::new(),
        }
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value.into());
        self
    }

    /// `None` while the component is an orphan.
    #[must_use]
    pub const fn id(&self) -> Option<ComponentId> {
        if self.entity_id == 0 {
            None
        } else {
            Some(ComponentId::new(self.entity_id, self.def_id))
        }
    }

    #[must_use]
    pub const fn is_orphan(&self) -> bool {
        self.entity_id == 0
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    /// Look an attribute up by JSON pointer, e.g. `/address/city`.
    #[must_use]
    pub fn pointer(&self, path: &str) -> Option<&Value> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let (head, rest) = match path.find('/') {
            Some(idx) => path.split_at(idx),
            None => (path, ""),
        };
        let value = self.attrs.get(&unescape_pointer(head))?;
        if rest.is_empty() {
            Some(value)
        } else {
            value.pointer(rest)
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.attrs.insert(key.into(), value);
    }

    /// Parse a record in wire format.
    ///
    /// `@d` may be a numeric def id or a uri resolved through `registry`;
    /// `@e` defaults to `0` (orphan).
    pub fn from_json(value: &Value, registry: &ComponentDefRegistry) -> StoreResult<Self> {
        let Value::Object(obj) = value else {
            return Err(StoreError::InvalidComponent(format!(
                "expected an object, got {value}"
            )));
        };

        let def_key = obj
            .get("@d")
            .ok_or_else(|| StoreError::InvalidComponent(format!("missing @d in {value}")))?;
        let def = registry
            .resolve(def_key)
            .ok_or_else(|| StoreError::DefNotFound(def_key.to_string()))?;

        let entity_id = match obj.get("@e") {
            None | Some(Value::Null) => 0,
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|id| EntityId::try_from(id).ok())
                .ok_or_else(|| StoreError::InvalidComponent(format!("invalid @e {n}")))?,
            Some(other) => {
                return Err(StoreError::InvalidComponent(format!("invalid @e {other}")));
            }
        };

        let attrs = obj
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "@e" | "@d"))
            .map(|(key, v)| (key.clone(), v.clone()))
            .collect();

        let mut com = def.create_component(attrs);
        com.entity_id = entity_id;
        Ok(com)
    }

    /// Wire-format rendering.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("@e".into(), Value::from(self.entity_id));
        obj.insert("@d".into(), Value::from(self.def_id));
        for (key, value) in &self.attrs {
            obj.insert(key.clone(), value.clone());
        }
        Value::Object(obj)
    }
}

fn unescape_pointer(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::component_def::ComponentDef;

    #[test]
    fn test_component_id_text_round_trip() {
        let id = ComponentId::new(23, 2);
        assert_eq!(id.to_string(), "[23,2]");

        let parsed: ComponentId = "[23,2]".parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.to_tuple(), (23, 2));

        assert!("23,2".parse::<ComponentId>().is_err());
        assert!("[1]".parse::<ComponentId>().is_err());
    }

    #[test]
    fn test_component_id_bits_roundtrip() {
        let id = ComponentId::new(u32::MAX, 7);
        assert_eq!(ComponentId::from_bits(id.to_bits()), id);
    }

    #[test]
    fn test_component_id_ordering() {
        let a = ComponentId::new(1, 9);
        let b = ComponentId::new(2, 1);
        let c = ComponentId::new(2, 3);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_orphan_has_no_id() {
        let com = Component::new(0, 3);
        assert!(com.is_orphan());
        assert_eq!(com.id(), None);

        let attached = Component::new(5, 3);
        assert_eq!(attached.id(), Some(ComponentId::new(5, 3)));
    }

    #[test]
    fn test_wire_format() {
        let com = Component::new(23, 2).with("text", "buy milk");
        let json = serde_json::to_value(&com).unwrap();
        assert_eq!(json, json!({"@e": 23, "@d": 2, "text": "buy milk"}));
        assert_eq!(com.to_json(), json);

        let back: Component = serde_json::from_value(json).unwrap();
        assert_eq!(back, com);
    }

    #[test]
    fn test_from_json_resolves_uri() {
        let mut registry = ComponentDefRegistry::new();
        registry.register(ComponentDef::new("/component/title", vec![]));

        let com = Component::from_json(
            &json!({"@e": 100, "@d": "/component/title", "text": "wake up"}),
            &registry,
        )
        .unwrap();
        assert_eq!(com.entity_id, 100);
        assert_eq!(com.def_id, 1);
        assert_eq!(com.get("text"), Some(&json!("wake up")));

        let orphan = Component::from_json(&json!({"@d": 1}), &registry).unwrap();
        assert!(orphan.is_orphan());

        let missing = Component::from_json(&json!({"@d": "/component/nope"}), &registry);
        assert!(matches!(missing, Err(StoreError::DefNotFound(_))));
    }

    #[test]
    fn test_pointer_lookup() {
        let com = Component::new(1, 1)
            .with("address", json!({"city": "Leeds", "lines": ["a", "b"]}))
            .with("a/b", 3);

        assert_eq!(com.pointer("/address/city"), Some(&json!("Leeds")));
        assert_eq!(com.pointer("/address/lines/1"), Some(&json!("b")));
        assert_eq!(com.pointer("address"), com.get("address"));
        assert_eq!(com.pointer("/a~1b"), Some(&json!(3)));
        assert_eq!(com.pointer("/missing"), None);
    }
}
