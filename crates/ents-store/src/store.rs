//! The storage contract query words depend on.
//!
//! [`EntitySet`] is the in-memory implementation. Other backends (a disk
//! table, a browser record database) implement the same trait and can be
//! driven by the same query programs.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::{
    bitfield::BitField,
    component::{Component, ComponentId},
    component_def::{ComponentDef, DefId},
    entity::{Entity, EntityId},
    entity_set::{CloneOptions, EntitySet, Populate},
    error::StoreResult,
    filter::{AttrRef, Filter},
};

/// Backend-independent store operations.
///
/// Reads return owned values so implementations are free to materialize
/// records from outside process memory. Writes are staged and only become
/// visible after [`EntityStore::apply_updates`] /
/// [`EntityStore::apply_remove_changes`].
pub trait EntityStore {
    fn register(&mut self, def: ComponentDef) -> ComponentDef;

    fn get_by_uri(&self, uri: &str) -> Option<ComponentDef>;

    fn get_by_hash(&self, hash: u64) -> Option<ComponentDef>;

    fn get_by_def_id(&self, id: DefId) -> Option<ComponentDef>;

    fn component_defs(&self) -> Vec<ComponentDef>;

    /// Create an orphan component of the def named by uri or id.
    fn create_component(&self, def: &Value, attrs: Map<String, Value>) -> StoreResult<Component>;

    /// Resolve uris and/or ids into a field, skipping unknown defs.
    fn resolve_bit_field(&self, keys: &[Value]) -> BitField {
        let mut bf = BitField::new();
        for key in keys {
            let def = match key {
                Value::String(uri) => self.get_by_uri(uri),
                Value::Number(n) => n
                    .as_u64()
                    .and_then(|id| DefId::try_from(id).ok())
                    .and_then(|id| self.get_by_def_id(id)),
                _ => None,
            };
            if let Some(def) = def {
                bf.set(def.id());
            }
        }
        bf
    }

    /// Parse a `uri#/path` attribute reference against this store's defs.
    fn attr_ref(&self, text: &str) -> StoreResult<AttrRef> {
        AttrRef::parse_with(text, |uri| self.get_by_uri(uri).map(|def| def.id()))
    }

    fn size(&self) -> usize;

    fn get_entity(&self, id: EntityId, populate: Populate) -> Option<Entity>;

    /// Lazy sequence of fully populated entities. Each call starts over.
    fn entities(&self) -> Box<dyn Iterator<Item = Entity> + '_>;

    fn get_component(&self, id: ComponentId) -> Option<Component>;

    fn add_components(&mut self, components: Vec<Component>) -> StoreResult<()>;

    /// Stage every component of an entity, assigning an id to an orphan.
    fn add_entity(&mut self, entity: Entity) -> StoreResult<EntityId>;

    fn apply_updates(&mut self);

    fn remove_components(&mut self, ids: Vec<ComponentId>) -> usize;

    fn remove_entity(&mut self, id: EntityId) -> usize;

    fn apply_remove_changes(&mut self);

    /// Start a new mutation cycle. The change sets only describe writes made
    /// after this call.
    fn begin_changes(&mut self);

    fn match_entities(&self, bf: &BitField) -> Vec<EntityId>;

    fn match_components(&self, bf: &BitField, eids: Option<&[EntityId]>) -> Vec<Component>;

    fn apply_filter(&self, filter: &Filter) -> StoreResult<BTreeSet<EntityId>>;

    fn clone_store(&self, opts: CloneOptions) -> Self
    where
        Self: Sized;
}

impl EntityStore for EntitySet {
    fn register(&mut self, def: ComponentDef) -> ComponentDef {
        Self::register(self, def)
    }

    fn get_by_uri(&self, uri: &str) -> Option<ComponentDef> {
        Self::get_by_uri(self, uri).cloned()
    }

    fn get_by_hash(&self, hash: u64) -> Option<ComponentDef> {
        Self::get_by_hash(self, hash).cloned()
    }

    fn get_by_def_id(&self, id: DefId) -> Option<ComponentDef> {
        Self::get_by_def_id(self, id).cloned()
    }

    fn component_defs(&self) -> Vec<ComponentDef> {
        Self::component_defs(self).to_vec()
    }

    fn create_component(&self, def: &Value, attrs: Map<String, Value>) -> StoreResult<Component> {
        Self::create_component(self, def, attrs)
    }

    fn resolve_bit_field(&self, keys: &[Value]) -> BitField {
        Self::resolve_bit_field(self, keys)
    }

    fn attr_ref(&self, text: &str) -> StoreResult<AttrRef> {
        AttrRef::parse(text, self.registry())
    }

    fn size(&self) -> usize {
        Self::size(self)
    }

    fn get_entity(&self, id: EntityId, populate: Populate) -> Option<Entity> {
        Self::get_entity(self, id, populate)
    }

    fn entities(&self) -> Box<dyn Iterator<Item = Entity> + '_> {
        Box::new(Self::entities(self))
    }

    fn get_component(&self, id: ComponentId) -> Option<Component> {
        Self::get_component(self, id).cloned()
    }

    fn add_components(&mut self, components: Vec<Component>) -> StoreResult<()> {
        Self::add_components(self, components)
    }

    fn add_entity(&mut self, entity: Entity) -> StoreResult<EntityId> {
        Self::add_entity(self, entity)
    }

    fn apply_updates(&mut self) {
        Self::apply_updates(self);
    }

    fn remove_components(&mut self, ids: Vec<ComponentId>) -> usize {
        Self::remove_components(self, ids)
    }

    fn remove_entity(&mut self, id: EntityId) -> usize {
        Self::remove_entity(self, id)
    }

    fn apply_remove_changes(&mut self) {
        Self::apply_remove_changes(self);
    }

    fn begin_changes(&mut self) {
        Self::begin_changes(self);
    }

    fn match_entities(&self, bf: &BitField) -> Vec<EntityId> {
        Self::match_entities(self, bf)
    }

    fn match_components(&self, bf: &BitField, eids: Option<&[EntityId]>) -> Vec<Component> {
        Self::match_components(self, bf, eids)
            .into_iter()
            .cloned()
            .collect()
    }

    fn apply_filter(&self, filter: &Filter) -> StoreResult<BTreeSet<EntityId>> {
        Ok(Self::apply_filter(self, filter))
    }

    fn clone_store(&self, opts: CloneOptions) -> Self {
        self.clone_with(opts)
    }
}
