//! Filter trees and their in-memory lookup plan.
//!
//! A [`Filter`] is an unevaluated boolean expression over component
//! attributes and definition membership. Query programs build one without
//! touching the store; [`FilterPlan`] then turns it into set operations over
//! entity ids:
//!
//! ```text
//! ["and", ["==", "/component/status#/is", "active"], ["defs", [3]]]
//!   -> Intersect[Scan(def 2, /is == "active"), HasDefs{3}]
//! ```

use std::{collections::BTreeSet, fmt};

use serde_json::Value;

use crate::{
    bitfield::BitField,
    component_def::{ComponentDef, ComponentDefRegistry, DefId},
    entity::EntityId,
    entity_set::EntitySet,
    error::{StoreError, StoreResult},
};

/// A reference to one attribute of one definition, written `uri#/path`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AttrRef {
    pub def_id: DefId,
    pub uri: String,
    /// JSON pointer into the component's attributes.
    pub path: String,
}

impl AttrRef {
    /// Parse `uri#/path`, resolving the uri through `registry`.
    ///
    /// A path without a leading `/` is treated as a top-level attribute name.
    pub fn parse(text: &str, registry: &ComponentDefRegistry) -> StoreResult<Self> {
        Self::parse_with(text, |uri| registry.get_by_uri(uri).map(ComponentDef::id))
    }

    /// Parse `uri#/path` with a caller-supplied uri lookup.
    pub fn parse_with(
        text: &str,
        resolve: impl FnOnce(&str) -> Option<DefId>,
    ) -> StoreResult<Self> {
        let Some((uri, path)) = text.split_once('#') else {
            return Err(StoreError::InvalidFilter(format!(
                "attribute reference {text:?} has no '#'"
            )));
        };
        if path.is_empty() {
            return Err(StoreError::InvalidFilter(format!(
                "attribute reference {text:?} has an empty path"
            )));
        }
        let def_id = resolve(uri).ok_or_else(|| StoreError::DefNotFound(uri.to_string()))?;
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Ok(Self {
            def_id,
            uri: uri.to_string(),
            path,
        })
    }
}

impl fmt::Debug for AttrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttrRef({}#{}, def {})", self.uri, self.path, self.def_id)
    }
}

impl fmt::Display for AttrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.uri, self.path)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
}

impl CompareOp {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

/// One side of a comparison.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Attr(AttrRef),
    Value(Value),
}

/// An unevaluated boolean expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Compare {
        op: CompareOp,
        attr: AttrRef,
        value: Value,
    },
    /// Entities carrying any of the given defs.
    Defs(BitField),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Build a comparison. Whichever side is an attribute reference becomes
    /// the lookup key; the other side is the literal to match.
    pub fn compare(op: CompareOp, lhs: Operand, rhs: Operand) -> StoreResult<Self> {
        match (lhs, rhs) {
            (Operand::Attr(attr), Operand::Value(value))
            | (Operand::Value(value), Operand::Attr(attr)) => Ok(Self::Compare { op, attr, value }),
            (Operand::Attr(a), Operand::Attr(b)) => Err(StoreError::InvalidFilter(format!(
                "cannot compare two attributes ({a} {} {b})",
                op.as_str()
            ))),
            (Operand::Value(a), Operand::Value(b)) => Err(StoreError::InvalidFilter(format!(
                "comparison needs an attribute reference ({a} {} {b})",
                op.as_str()
            ))),
        }
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// The `[op, left, right]` tree form.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Compare { op, attr, value } => {
                serde_json::json!([op.as_str(), attr.to_string(), value])
            }
            Self::Defs(bf) => serde_json::json!(["defs", bf.to_values()]),
            Self::And(a, b) => serde_json::json!(["and", a.to_json(), b.to_json()]),
            Self::Or(a, b) => serde_json::json!(["or", a.to_json(), b.to_json()]),
            Self::Not(a) => serde_json::json!(["not", a.to_json()]),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// In-memory lookup plan for a [`Filter`].
///
/// Nested `and`/`or` chains are flattened so each set operation runs once
/// over all of its branches.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterPlan {
    Scan {
        def_id: DefId,
        path: String,
        op: CompareOp,
        value: Value,
    },
    HasDefs(BitField),
    Intersect(Vec<FilterPlan>),
    Union(Vec<FilterPlan>),
    Complement(Box<FilterPlan>),
}

impl FilterPlan {
    #[must_use]
    pub fn new(filter: &Filter) -> Self {
        match filter {
            Filter::Compare { op, attr, value } => Self::Scan {
                def_id: attr.def_id,
                path: attr.path.clone(),
                op: *op,
                value: value.clone(),
            },
            Filter::Defs(bf) => Self::HasDefs(bf.clone()),
            Filter::And(a, b) => {
                let mut branches = Vec::new();
                flatten_and(a, &mut branches);
                flatten_and(b, &mut branches);
                Self::Intersect(branches)
            }
            Filter::Or(a, b) => {
                let mut branches = Vec::new();
                flatten_or(a, &mut branches);
                flatten_or(b, &mut branches);
                Self::Union(branches)
            }
            Filter::Not(a) => Self::Complement(Box::new(Self::new(a))),
        }
    }

    /// Run the plan, returning matching entity ids in ascending order.
    #[must_use]
    pub fn execute(&self, es: &EntitySet) -> BTreeSet<EntityId> {
        match self {
            Self::Scan {
                def_id,
                path,
                op,
                value,
            } => es
                .components_of_def(*def_id)
                .filter(|com| {
                    let found = com.pointer(path).unwrap_or(&Value::Null);
                    let equal = values_equal(found, value);
                    match op {
                        CompareOp::Eq => equal,
                        CompareOp::Ne => !equal,
                    }
                })
                .map(|com| com.entity_id)
                .collect(),
            Self::HasDefs(bf) => es.match_entities(bf).into_iter().collect(),
            Self::Intersect(branches) => {
                let mut branches = branches.iter();
                let Some(first) = branches.next() else {
                    return BTreeSet::new();
                };
                let mut acc = first.execute(es);
                for branch in branches {
                    if acc.is_empty() {
                        break;
                    }
                    let other = branch.execute(es);
                    acc.retain(|id| other.contains(id));
                }
                acc
            }
            Self::Union(branches) => branches.iter().flat_map(|b| b.execute(es)).collect(),
            Self::Complement(inner) => {
                let excluded = inner.execute(es);
                es.entity_ids()
                    .filter(|id| !excluded.contains(id))
                    .collect()
            }
        }
    }
}

fn flatten_and(filter: &Filter, out: &mut Vec<FilterPlan>) {
    if let Filter::And(a, b) = filter {
        flatten_and(a, out);
        flatten_and(b, out);
    } else {
        out.push(FilterPlan::new(filter));
    }
}

fn flatten_or(filter: &Filter, out: &mut Vec<FilterPlan>) {
    if let Filter::Or(a, b) = filter {
        flatten_or(a, out);
        flatten_or(b, out);
    } else {
        out.push(FilterPlan::new(filter));
    }
}

/// JSON equality, except numbers compare by value (`1 == 1.0`).
///
/// Two integers compare exactly, so neighbours above 2^53 stay distinct.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return x == y;
            }
            if x.is_f64() || y.is_f64() {
                return x.as_f64() == y.as_f64();
            }
            // one side only fits i64, the other only u64
            false
        }
        _ => a == b,
    }
}

impl EntitySet {
    /// Evaluate a filter against the committed tables.
    #[must_use]
    pub fn apply_filter(&self, filter: &Filter) -> BTreeSet<EntityId> {
        let plan = FilterPlan::new(filter);
        let ids = plan.execute(self);
        tracing::debug!(%filter, matched = ids.len(), "applied filter");
        ids
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::component::Component;

    fn store() -> EntitySet {
        let mut es = EntitySet::new();
        es.register(ComponentDef::from_json(&json!(["/component/status", ["is"]])).unwrap());
        es.register(ComponentDef::from_json(&json!(["/component/score", ["points"]])).unwrap());
        es.register(ComponentDef::new("/component/flag", vec![]));
        es.add_components([
            Component::new(1, 1).with("is", "active"),
            Component::new(1, 2).with("points", 10),
            Component::new(2, 1).with("is", "inactive"),
            Component::new(2, 3),
            Component::new(3, 1).with("is", "active"),
            Component::new(3, 3),
            Component::new(4, 2).with("points", 10.0),
        ])
        .unwrap();
        es.apply_updates();
        es
    }

    fn attr(es: &EntitySet, text: &str) -> AttrRef {
        AttrRef::parse(text, es.registry()).unwrap()
    }

    #[test]
    fn test_attr_ref_parse() {
        let es = store();
        let a = attr(&es, "/component/status#/is");
        assert_eq!(a.def_id, 1);
        assert_eq!(a.path, "/is");
        assert_eq!(a.to_string(), "/component/status#/is");

        assert_eq!(attr(&es, "/component/status#is").path, "/is");
        assert!(matches!(
            AttrRef::parse("/component/status", es.registry()),
            Err(StoreError::InvalidFilter(_))
        ));
        assert!(matches!(
            AttrRef::parse("/component/nope#/x", es.registry()),
            Err(StoreError::DefNotFound(_))
        ));
    }

    #[test]
    fn test_compare_accepts_literal_on_either_side() {
        let es = store();
        let a = attr(&es, "/component/status#/is");
        let left = Filter::compare(
            CompareOp::Eq,
            Operand::Attr(a.clone()),
            Operand::Value(json!("active")),
        )
        .unwrap();
        let right = Filter::compare(
            CompareOp::Eq,
            Operand::Value(json!("active")),
            Operand::Attr(a),
        )
        .unwrap();
        assert_eq!(left, right);
        assert_eq!(es.apply_filter(&left), BTreeSet::from([1, 3]));

        assert!(Filter::compare(CompareOp::Eq, Operand::Value(json!(1)), Operand::Value(json!(1))).is_err());
    }

    #[test]
    fn test_numbers_compare_by_value() {
        let es = store();
        let f = Filter::compare(
            CompareOp::Eq,
            Operand::Attr(attr(&es, "/component/score#/points")),
            Operand::Value(json!(10)),
        )
        .unwrap();
        assert_eq!(es.apply_filter(&f), BTreeSet::from([1, 4]));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let big = 1_u64 << 53;
        assert!(!values_equal(&json!(big), &json!(big + 1)));
        assert!(values_equal(&json!(big + 1), &json!(big + 1)));
        assert!(!values_equal(&json!(i64::MAX), &json!(i64::MAX - 1)));
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!(0.5), &json!(0.5)));
        assert!(!values_equal(&json!(-1), &json!(u64::MAX)));
    }

    #[test]
    fn test_and_or_not() {
        let es = store();
        let active = Filter::compare(
            CompareOp::Eq,
            Operand::Attr(attr(&es, "/component/status#/is")),
            Operand::Value(json!("active")),
        )
        .unwrap();
        let flagged = Filter::Defs(BitField::from_values([3]));

        assert_eq!(es.apply_filter(&active.clone().and(flagged.clone())), BTreeSet::from([3]));
        assert_eq!(
            es.apply_filter(&active.clone().or(flagged.clone())),
            BTreeSet::from([1, 2, 3])
        );
        assert_eq!(es.apply_filter(&flagged.negate()), BTreeSet::from([1, 4]));
    }

    #[test]
    fn test_not_equal_requires_component() {
        let es = store();
        let f = Filter::compare(
            CompareOp::Ne,
            Operand::Attr(attr(&es, "/component/status#/is")),
            Operand::Value(json!("active")),
        )
        .unwrap();
        assert_eq!(es.apply_filter(&f), BTreeSet::from([2]));
    }

    #[test]
    fn test_plan_flattens_chains() {
        let a = Filter::Defs(BitField::from_values([1]));
        let b = Filter::Defs(BitField::from_values([2]));
        let c = Filter::Defs(BitField::from_values([3]));
        let plan = FilterPlan::new(&a.and(b).and(c));
        let FilterPlan::Intersect(branches) = plan else {
            panic!("expected intersect");
        };
        assert_eq!(branches.len(), 3);
    }

    #[test]
    fn test_tree_form() {
        let es = store();
        let f = Filter::compare(
            CompareOp::Eq,
            Operand::Attr(attr(&es, "/component/status#/is")),
            Operand::Value(json!("active")),
        )
        .unwrap()
        .and(Filter::Defs(BitField::from_values([3])));
        assert_eq!(
            f.to_json(),
            json!(["and", ["==", "/component/status#/is", "active"], ["defs", [3]]])
        );
    }
}
