//! Values that flow through the query stack.

use std::{collections::BTreeMap, fmt};

use ents_store::{AttrRef, BitField, Component, ComponentDef, Entity, Filter};
use serde_json::{Map, Number, Value};

/// Which entity set a value refers to.
///
/// The host store is the one the VM was created with; local stores are
/// created by `!es` and live as long as the VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreRef {
    Host,
    Local(usize),
}

/// A tagged stack value.
#[derive(Clone, Debug, PartialEq)]
pub enum StackValue {
    Value(Value),
    Entity(Entity),
    Component(Component),
    ComponentDef(ComponentDef),
    ComponentAttr(AttrRef),
    Bitfield(BitField),
    List(Vec<StackValue>),
    Map(BTreeMap<String, StackValue>),
    Filter(Filter),
    EntitySet(StoreRef),
    /// Quoted text spelling a bracket. Reads as a string and is never run
    /// as one, even when replayed from a list body.
    Quoted(String),
}

/// Type tags used in word signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SType {
    Any,
    Value,
    Entity,
    Component,
    ComponentDef,
    ComponentAttr,
    Bitfield,
    List,
    Map,
    Filter,
    EntitySet,
}

impl SType {
    #[must_use]
    pub fn matches(self, value: &StackValue) -> bool {
        self == Self::Any || self == value.stype()
    }
}

impl fmt::Display for SType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl StackValue {
    #[must_use]
    pub const fn stype(&self) -> SType {
        match self {
            Self::Value(_) | Self::Quoted(_) => SType::Value,
            Self::Entity(_) => SType::Entity,
            Self::Component(_) => SType::Component,
            Self::ComponentDef(_) => SType::ComponentDef,
            Self::ComponentAttr(_) => SType::ComponentAttr,
            Self::Bitfield(_) => SType::Bitfield,
            Self::List(_) => SType::List,
            Self::Map(_) => SType::Map,
            Self::Filter(_) => SType::Filter,
            Self::EntitySet(_) => SType::EntitySet,
        }
    }

    /// Plain string payload, if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Value(Value::String(s)) | Self::Quoted(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Value(Value::Number(n)) => n.as_f64(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Value(Value::Number(n)) => n.as_i64(),
            _ => None,
        }
    }

    /// Non-negative integer that fits in a u32 (entity and def ids).
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Value(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        }
    }

    /// Truthiness: null, false, 0, "" and empty containers are false.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Value(v) => match v {
                Value::Null => false,
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
                Value::String(s) => !s.is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(_) => true,
            },
            Self::List(items) => !items.is_empty(),
            Self::Map(map) => !map.is_empty(),
            Self::Quoted(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// JSON rendering of any stack value.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Value(v) => v.clone(),
            Self::Entity(e) => e.to_json(),
            Self::Component(c) => c.to_json(),
            Self::ComponentDef(d) => d.to_json(),
            Self::ComponentAttr(a) => Value::String(a.to_string()),
            Self::Bitfield(bf) => serde_json::to_value(bf).unwrap_or(Value::Null),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<_, _>>(),
            ),
            Self::Filter(f) => f.to_json(),
            Self::EntitySet(StoreRef::Host) => serde_json::json!({ "@es": "host" }),
            Self::EntitySet(StoreRef::Local(idx)) => serde_json::json!({ "@es": idx }),
            Self::Quoted(s) => Value::String(s.clone()),
        }
    }

    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::Value(Value::String(s.into()))
    }

    #[must_use]
    pub const fn bool(b: bool) -> Self {
        Self::Value(Value::Bool(b))
    }

    /// A number, kept integral when it has no fractional part.
    #[must_use]
    pub fn number(n: f64) -> Self {
        if n.fract() == 0.0 && n.abs() < 9.0e15 {
            Self::Value(Value::from(n as i64))
        } else {
            Self::Value(Number::from_f64(n).map_or(Value::Null, Value::Number))
        }
    }
}

impl From<Value> for StackValue {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<&str> for StackValue {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl From<u32> for StackValue {
    fn from(n: u32) -> Self {
        Self::Value(Value::from(n))
    }
}

impl From<i64> for StackValue {
    fn from(n: i64) -> Self {
        Self::Value(Value::from(n))
    }
}

impl From<Entity> for StackValue {
    fn from(e: Entity) -> Self {
        Self::Entity(e)
    }
}

impl From<Component> for StackValue {
    fn from(c: Component) -> Self {
        Self::Component(c)
    }
}

impl fmt::Display for StackValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(Value::String(s)) | Self::Quoted(s) => write!(f, "{s}"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}
