//! Entities: an id plus the components it owns.
//!
//! An entity never holds references into a store. It is a plain value built
//! by the store (or by a query) and joined to components by id.

use std::{collections::BTreeMap, fmt};

use serde_json::Value;

use crate::{bitfield::BitField, component::Component, component_def::DefId};

/// Raw entity identifier. `0` means "not yet assigned a store identity".
pub type EntityId = u32;

/// An entity value.
///
/// Invariant: `bit_field.get(d)` iff `components` has an entry for `d`.
#[derive(Clone, Default, PartialEq)]
pub struct Entity {
    id: EntityId,
    bit_field: BitField,
    components: BTreeMap<DefId, Component>,
}

impl Entity {
    #[must_use]
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// An entity shell that knows which defs it has but carries no records.
    #[must_use]
    pub fn with_bit_field(id: EntityId, bit_field: BitField) -> Self {
        Self {
            id,
            bit_field,
            components: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> EntityId {
        self.id
    }

    /// Reassign the id, restamping every owned component.
    pub fn set_id(&mut self, id: EntityId) {
        self.id = id;
        for com in self.components.values_mut() {
            com.entity_id = id;
        }
    }

    #[must_use]
    pub const fn is_orphan(&self) -> bool {
        self.id == 0
    }

    #[must_use]
    pub const fn bit_field(&self) -> &BitField {
        &self.bit_field
    }

    /// Attach a component, replacing any existing one of the same def.
    pub fn add_component(&mut self, mut com: Component) {
        com.entity_id = self.id;
        self.bit_field.set(com.def_id);
        self.components.insert(com.def_id, com);
    }

    pub fn remove_component(&mut self, def_id: DefId) -> Option<Component> {
        let removed = self.components.remove(&def_id);
        self.bit_field.clear(def_id);
        removed
    }

    #[must_use]
    pub fn get_component(&self, def_id: DefId) -> Option<&Component> {
        self.components.get(&def_id)
    }

    #[must_use]
    pub fn has_component(&self, def_id: DefId) -> bool {
        self.bit_field.get(def_id) && !self.bit_field.is_all()
    }

    /// Components in ascending def order.
    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    pub fn into_components(self) -> impl Iterator<Item = Component> {
        self.components.into_values()
    }

    /// Number of definitions this entity carries.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.bit_field.count()
    }

    /// JSON rendering: `{"@e": id, "components": [...]}`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "@e": self.id,
            "components": self.components().map(Component::to_json).collect::<Vec<_>>(),
        })
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}, {:?})", self.id, self.bit_field.to_values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_component_keeps_bits_in_sync() {
        let mut e = Entity::new(10);
        e.add_component(Component::new(0, 2).with("text", "hi"));
        e.add_component(Component::new(99, 5));

        assert_eq!(e.bit_field().to_values(), vec![2, 5]);
        assert_eq!(e.size(), 2);
        assert!(e.components().all(|c| c.entity_id == 10));
        assert!(e.has_component(2));
        assert!(!e.has_component(3));
    }

    #[test]
    fn test_remove_component() {
        let mut e = Entity::new(1);
        e.add_component(Component::new(0, 2));
        e.add_component(Component::new(0, 4));

        let removed = e.remove_component(2).unwrap();
        assert_eq!(removed.def_id, 2);
        assert_eq!(e.bit_field().to_values(), vec![4]);
        assert!(e.remove_component(2).is_none());
    }

    #[test]
    fn test_set_id_restamps_components() {
        let mut e = Entity::new(0);
        assert!(e.is_orphan());
        e.add_component(Component::new(0, 1));

        e.set_id(42);
        assert_eq!(e.get_component(1).unwrap().entity_id, 42);
        assert!(!e.is_orphan());
    }

    #[test]
    fn test_shell_has_bits_but_no_records() {
        let e = Entity::with_bit_field(3, BitField::from_values([1, 2]));
        assert_eq!(e.size(), 2);
        assert_eq!(e.components().count(), 0);
    }
}
