//! EntitySet - the in-memory store.
//!
//! The set owns the definition registry, the authoritative entity and
//! component tables, and two staging tables. Writes are staged first and only
//! become visible through the authoritative tables on an explicit commit:
//!
//! ```text
//! add_components ──► com_updates / ent_updates ──apply_updates──► components / entities
//! remove_*       ──► com_changes.removed       ──apply_remove_changes──► delete + cascade
//! ```
//!
//! Every touched id is recorded in a [`ChangeSet`] so a caller (e.g. a sync
//! layer) can read the net delta of a cycle via [`EntitySet::entity_changes`]
//! and [`EntitySet::component_changes`].

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::{
    bitfield::{self, BitField},
    change_set::{ChangeSet, ChangeSetOp},
    component::{Component, ComponentId},
    component_def::{ComponentDef, ComponentDefRegistry, DefId},
    entity::{Entity, EntityId},
    error::{StoreError, StoreResult},
};

/// Store configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntitySetOptions {
    /// First id handed out to orphan entities. Ids already in use are skipped.
    pub first_entity_id: EntityId,
}

impl Default for EntitySetOptions {
    fn default() -> Self {
        Self { first_entity_id: 1 }
    }
}

/// What [`EntitySet::clone_with`] copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloneOptions {
    pub clone_defs: bool,
    pub clone_entities: bool,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            clone_defs: true,
            clone_entities: true,
        }
    }
}

/// How much of an entity [`EntitySet::get_entity`] joins in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Populate {
    /// A bare shell: id and bit field only.
    No,
    /// Every component the entity has.
    All,
    /// Only the components whose def bit is set in the field.
    Only(BitField),
}

impl From<bool> for Populate {
    fn from(populate: bool) -> Self {
        if populate { Self::All } else { Self::No }
    }
}

impl From<BitField> for Populate {
    fn from(bf: BitField) -> Self {
        Self::Only(bf)
    }
}

/// Bitfield-indexed in-memory entity/component store.
#[derive(Clone, Debug)]
pub struct EntitySet {
    options: EntitySetOptions,
    defs: ComponentDefRegistry,
    /// Authoritative entity index: id -> defs it carries.
    entities: BTreeMap<EntityId, BitField>,
    /// Authoritative component table.
    components: BTreeMap<ComponentId, Component>,
    /// Staged entity writes, folded in by `apply_updates`.
    ent_updates: BTreeMap<EntityId, BitField>,
    /// Staged component writes, folded in by `apply_updates`.
    com_updates: BTreeMap<ComponentId, Component>,
    ent_changes: ChangeSet<EntityId>,
    com_changes: ChangeSet<ComponentId>,
    next_entity_id: EntityId,
}

impl Default for EntitySet {
    fn default() -> Self {
        Self::new()
    }
}

impl EntitySet {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(EntitySetOptions::default())
    }

    #[must_use]
    pub fn with_options(options: EntitySetOptions) -> Self {
        Self {
            options,
            defs: ComponentDefRegistry::new(),
            entities: BTreeMap::new(),
            components: BTreeMap::new(),
            ent_updates: BTreeMap::new(),
            com_updates: BTreeMap::new(),
            ent_changes: ChangeSet::new(),
            com_changes: ChangeSet::new(),
            next_entity_id: options.first_entity_id.max(1),
        }
    }

    #[must_use]
    pub const fn options(&self) -> EntitySetOptions {
        self.options
    }

    // ==================== Definitions ====================

    /// Register a definition. Re-registering a known schema returns the
    /// existing definition unchanged.
    pub fn register(&mut self, def: ComponentDef) -> ComponentDef {
        self.defs.register(def).0
    }

    /// Register from any accepted JSON description (see [`ComponentDef::from_json`]).
    pub fn register_json(&mut self, spec: &Value) -> StoreResult<ComponentDef> {
        Ok(self.register(ComponentDef::from_json(spec)?))
    }

    #[must_use]
    pub fn get_by_uri(&self, uri: &str) -> Option<&ComponentDef> {
        self.defs.get_by_uri(uri)
    }

    #[must_use]
    pub fn get_by_hash(&self, hash: u64) -> Option<&ComponentDef> {
        self.defs.get_by_hash(hash)
    }

    #[must_use]
    pub fn get_by_def_id(&self, id: DefId) -> Option<&ComponentDef> {
        self.defs.get_by_def_id(id)
    }

    #[must_use]
    pub fn component_defs(&self) -> &[ComponentDef] {
        self.defs.defs()
    }

    #[must_use]
    pub const fn registry(&self) -> &ComponentDefRegistry {
        &self.defs
    }

    /// Create an orphan component of the def named by uri or id.
    pub fn create_component(&self, def: &Value, attrs: Map<String, Value>) -> StoreResult<Component> {
        let def = self
            .defs
            .resolve(def)
            .ok_or_else(|| StoreError::DefNotFound(def.to_string()))?;
        Ok(def.create_component(attrs))
    }

    /// Resolve uris and/or ids into a field. Unknown defs are skipped.
    #[must_use]
    pub fn resolve_bit_field(&self, keys: &[Value]) -> BitField {
        let mut bf = BitField::new();
        for key in keys {
            match self.defs.resolve(key) {
                Some(def) => bf.set(def.id()),
                None => debug!(%key, "ignoring unknown def in bitfield"),
            }
        }
        bf
    }

    // ==================== Write path ====================

    /// Hand out a fresh entity id, skipping ids already present.
    pub fn create_entity_id(&mut self) -> EntityId {
        loop {
            let id = self.next_entity_id;
            self.next_entity_id = self.next_entity_id.wrapping_add(1).max(1);
            if !self.entities.contains_key(&id) && !self.ent_updates.contains_key(&id) {
                return id;
            }
        }
    }

    /// Stage components for addition.
    ///
    /// Orphans are grouped into fresh entities (see `assign_entity_ids`).
    /// Nothing becomes visible through the read path until
    /// [`EntitySet::apply_updates`]. Every component must reference a
    /// registered def, otherwise nothing is staged.
    pub fn add_components(
        &mut self,
        components: impl IntoIterator<Item = Component>,
    ) -> StoreResult<()> {
        let mut components: Vec<Component> = components.into_iter().collect();
        if let Some(unknown) = components
            .iter()
            .find(|com| self.defs.get_by_def_id(com.def_id).is_none())
        {
            return Err(StoreError::DefNotFound(unknown.def_id.to_string()));
        }

        self.assign_entity_ids(&mut components);

        let ids: Vec<ComponentId> = components
            .into_iter()
            .map(|com| self.mark_component_add(com))
            .collect();
        self.apply_updated_components(&ids);

        debug!(
            staged = ids.len(),
            pending_entities = self.ent_updates.len(),
            "staged components"
        );
        Ok(())
    }

    /// Stage every component of an entity. An orphan entity gets a fresh id.
    pub fn add_entity(&mut self, mut entity: Entity) -> StoreResult<EntityId> {
        if entity.is_orphan() {
            let id = self.create_entity_id();
            entity.set_id(id);
        }
        let id = entity.id();
        self.add_components(entity.into_components())?;
        Ok(id)
    }

    /// Give orphan components an entity id.
    ///
    /// Orphans are grouped in input order. A new entity is opened when none
    /// is open yet or when the orphan's def was already seen in the current
    /// run, so `[a(X), b(Y), c(X)]` becomes `{a, b}` and `{c}`.
    fn assign_entity_ids(&mut self, components: &mut [Component]) {
        let mut current: EntityId = 0;
        let mut seen = BitField::new();

        for com in components.iter_mut().filter(|com| com.is_orphan()) {
            if current == 0 || seen.get(com.def_id) {
                current = self.create_entity_id();
                seen = BitField::new();
                trace!(entity = current, "opened entity for orphan components");
            }
            com.entity_id = current;
            seen.set(com.def_id);
        }
    }

    fn mark_component_add(&mut self, com: Component) -> ComponentId {
        let id = ComponentId::new(com.entity_id, com.def_id);
        let existed = self.com_updates.contains_key(&id) || self.components.contains_key(&id);
        self.com_updates.insert(id, com);
        if existed {
            self.com_changes.update(id);
        } else {
            self.com_changes.add(id);
        }
        id
    }

    fn apply_updated_components(&mut self, ids: &[ComponentId]) {
        for id in ids {
            let eid = id.entity_id;
            let mut bf = match self
                .ent_updates
                .get(&eid)
                .or_else(|| self.entities.get(&eid))
            {
                Some(bf) => bf.clone(),
                None => {
                    self.ent_changes.add(eid);
                    BitField::new()
                }
            };
            bf.set(id.def_id);
            self.ent_updates.insert(eid, bf);
            self.ent_changes.update(eid);
        }
    }

    /// Fold staged writes into the authoritative tables in one pass.
    ///
    /// A staged component that is also marked removed is dropped along with
    /// its bit. A committed component marked removed keeps its bit until
    /// [`EntitySet::apply_remove_changes`] deletes it.
    pub fn apply_updates(&mut self) {
        let com_updates = std::mem::take(&mut self.com_updates);
        let mut ent_updates = std::mem::take(&mut self.ent_updates);
        let (coms, ents) = (com_updates.len(), ent_updates.len());

        for id in self.com_changes.removed() {
            if self.components.contains_key(&id) {
                continue;
            }
            if let Some(bf) = ent_updates.get_mut(&id.entity_id) {
                bf.clear(id.def_id);
            }
        }

        for (id, com) in com_updates {
            if self.com_changes.op(&id) != Some(ChangeSetOp::Remove) {
                self.components.insert(id, com);
            }
        }
        for (eid, bf) in ent_updates {
            if bf.count() > 0 {
                self.entities.insert(eid, bf);
            } else if !self.entities.contains_key(&eid) {
                self.ent_changes.remove(eid);
            }
        }

        debug!(
            components = coms,
            entities = ents,
            total_entities = self.entities.len(),
            "applied updates"
        );
    }

    /// Mark components for removal. Returns how many were marked.
    ///
    /// Unknown ids are ignored. Call [`EntitySet::apply_remove_changes`] to
    /// commit.
    pub fn remove_components(&mut self, ids: impl IntoIterator<Item = ComponentId>) -> usize {
        let mut marked = 0;
        for id in ids {
            if self.components.contains_key(&id) || self.com_updates.contains_key(&id) {
                self.com_changes.remove(id);
                marked += 1;
            }
        }
        marked
    }

    /// Mark every component of an entity for removal.
    pub fn remove_entity(&mut self, eid: EntityId) -> usize {
        let ids = self.component_ids_of(eid);
        self.remove_components(ids)
    }

    fn component_ids_of(&self, eid: EntityId) -> Vec<ComponentId> {
        let range = ComponentId::new(eid, 0)..=ComponentId::new(eid, DefId::MAX);
        let mut ids: BTreeSet<ComponentId> = self.components.range(range.clone()).map(|(id, _)| *id).collect();
        ids.extend(self.com_updates.range(range).map(|(id, _)| *id));
        ids.into_iter().collect()
    }

    /// Delete every component marked removed and cascade to entities.
    ///
    /// An entity whose last component is removed is itself removed.
    pub fn apply_remove_changes(&mut self) {
        let removed: Vec<ComponentId> = self.com_changes.removed().collect();
        let mut dropped_entities = 0;

        for id in &removed {
            self.com_updates.remove(id);
            self.components.remove(id);

            let eid = id.entity_id;
            if let Some(bf) = self.ent_updates.get_mut(&eid) {
                bf.clear(id.def_id);
                if bf.count() == 0 {
                    self.ent_updates.remove(&eid);
                }
            }
            let staged = self.ent_updates.contains_key(&eid);
            if let Some(bf) = self.entities.get_mut(&eid) {
                bf.clear(id.def_id);
                if bf.count() > 0 {
                    self.ent_changes.update(eid);
                } else {
                    self.entities.remove(&eid);
                    if staged {
                        // still carries staged components
                        self.ent_changes.update(eid);
                    } else {
                        self.ent_changes.remove(eid);
                        dropped_entities += 1;
                    }
                }
            } else if !staged {
                self.ent_changes.remove(eid);
            }
        }

        debug!(
            components = removed.len(),
            entities = dropped_entities,
            "applied remove changes"
        );
    }

    /// Start a new mutation cycle by clearing both change sets.
    pub fn begin_changes(&mut self) {
        self.ent_changes.clear();
        self.com_changes.clear();
    }

    #[must_use]
    pub const fn entity_changes(&self) -> &ChangeSet<EntityId> {
        &self.ent_changes
    }

    #[must_use]
    pub const fn component_changes(&self) -> &ChangeSet<ComponentId> {
        &self.com_changes
    }

    // ==================== Read path ====================

    /// Number of committed entities.
    #[must_use]
    pub fn size(&self) -> usize {
        self.entities.len()
    }

    /// Fetch an entity, joining in as much as `populate` asks for.
    pub fn get_entity(&self, id: EntityId, populate: impl Into<Populate>) -> Option<Entity> {
        let bf = self.entities.get(&id)?;
        let only = match populate.into() {
            Populate::No => return Some(Entity::with_bit_field(id, bf.clone())),
            Populate::All => None,
            Populate::Only(only) => Some(only),
        };

        let mut entity = Entity::new(id);
        for def_id in bf.iter() {
            if only.as_ref().is_some_and(|only| !only.get(def_id)) {
                continue;
            }
            if let Some(com) = self.components.get(&ComponentId::new(id, def_id)) {
                entity.add_component(com.clone());
            }
        }
        Some(entity)
    }

    /// Lazily iterate every committed entity, fully populated, ascending id.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entities
            .keys()
            .filter_map(|&id| self.get_entity(id, Populate::All))
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    #[must_use]
    pub fn has_entity(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Committed bit field of an entity.
    #[must_use]
    pub fn entity_bit_field(&self, id: EntityId) -> Option<&BitField> {
        self.entities.get(&id)
    }

    /// Read a committed component. Staged writes are not visible here.
    #[must_use]
    pub fn get_component(&self, id: ComponentId) -> Option<&Component> {
        self.components.get(&id)
    }

    /// Every committed component, ordered by entity then def.
    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    pub fn components_of_def(&self, def_id: DefId) -> impl Iterator<Item = &Component> {
        self.components
            .values()
            .filter(move |com| com.def_id == def_id)
    }

    /// Ids of entities whose field intersects `bf`, ascending.
    #[must_use]
    pub fn match_entities(&self, bf: &BitField) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|(_, ebf)| bitfield::and(bf, ebf))
            .map(|(&id, _)| id)
            .collect()
    }

    /// Components whose def is in `bf`, optionally restricted to `eids`.
    ///
    /// Results are ordered by entity, then def; with `eids` the entity order
    /// follows the given slice.
    #[must_use]
    pub fn match_components(&self, bf: &BitField, eids: Option<&[EntityId]>) -> Vec<&Component> {
        match eids {
            None => self
                .components
                .values()
                .filter(|com| bf.get(com.def_id))
                .collect(),
            Some(eids) => eids
                .iter()
                .filter_map(|eid| self.entities.get(eid).map(|ebf| (*eid, ebf)))
                .flat_map(|(eid, ebf)| {
                    ebf.iter()
                        .filter(|&def_id| bf.get(def_id))
                        .filter_map(move |def_id| {
                            self.components.get(&ComponentId::new(eid, def_id))
                        })
                })
                .collect(),
        }
    }

    /// A new store sharing nothing mutable with this one.
    ///
    /// Staging tables and change sets are never carried over.
    #[must_use]
    pub fn clone_with(&self, opts: CloneOptions) -> Self {
        let mut out = Self::with_options(self.options);
        if opts.clone_defs {
            out.defs = self.defs.clone();
        }
        if opts.clone_entities {
            out.entities = self.entities.clone();
            out.components = self.components.clone();
            out.next_entity_id = self.next_entity_id;
        }
        out
    }

    // ==================== JSON ====================

    /// Load a `{ "defs": [...], "components": [...] }` document and commit it.
    pub fn import_json(&mut self, doc: &Value) -> StoreResult<()> {
        if let Some(defs) = doc.get("defs").and_then(Value::as_array) {
            for spec in defs {
                self.register_json(spec)?;
            }
        }
        if let Some(coms) = doc.get("components").and_then(Value::as_array) {
            let coms = coms
                .iter()
                .map(|c| Component::from_json(c, &self.defs))
                .collect::<StoreResult<Vec<_>>>()?;
            self.add_components(coms)?;
            self.apply_updates();
        }
        Ok(())
    }

    /// Export committed defs and components.
    #[must_use]
    pub fn export_json(&self) -> Value {
        serde_json::json!({
            "defs": self.component_defs().iter().map(ComponentDef::to_json).collect::<Vec<_>>(),
            "components": self.components().map(Component::to_json).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store_with_defs() -> (EntitySet, DefId, DefId) {
        let mut es = EntitySet::new();
        let chan = es.register(ComponentDef::from_json(&json!(["/component/channel", ["name"]])).unwrap());
        let status = es.register(ComponentDef::from_json(&json!(["/component/status", ["is"]])).unwrap());
        (es, chan.id(), status.id())
    }

    #[test]
    fn test_flat_list_splits_on_repeated_def() {
        let (mut es, x, y) = store_with_defs();
        es.add_components([
            Component::new(0, x).with("name", "a"),
            Component::new(0, y).with("is", "b"),
            Component::new(0, x).with("name", "c"),
        ])
        .unwrap();
        es.apply_updates();

        assert_eq!(es.size(), 2);
        let ids: Vec<_> = es.entity_ids().collect();
        let first = es.get_entity(ids[0], true).unwrap();
        let second = es.get_entity(ids[1], true).unwrap();

        assert_eq!(first.bit_field().to_values(), vec![x, y]);
        assert_eq!(first.get_component(x).unwrap().get("name"), Some(&json!("a")));
        assert_eq!(second.bit_field().to_values(), vec![x]);
        assert_eq!(second.get_component(x).unwrap().get("name"), Some(&json!("c")));
    }

    #[test]
    fn test_same_def_twice_lands_on_two_entities() {
        let (mut es, x, _) = store_with_defs();
        es.add_components([Component::new(0, x), Component::new(0, x)])
            .unwrap();
        es.apply_updates();
        assert_eq!(es.size(), 2);
    }

    #[test]
    fn test_writes_invisible_until_applied() {
        let (mut es, x, _) = store_with_defs();
        es.add_components([Component::new(5, x).with("name", "old")])
            .unwrap();
        es.apply_updates();

        let id = ComponentId::new(5, x);
        es.add_components([Component::new(5, x).with("name", "new")])
            .unwrap();
        assert_eq!(es.get_component(id).unwrap().get("name"), Some(&json!("old")));

        es.apply_updates();
        assert_eq!(es.get_component(id).unwrap().get("name"), Some(&json!("new")));
    }

    #[test]
    fn test_change_sets_classify_add_and_update() {
        let (mut es, x, y) = store_with_defs();
        es.add_components([Component::new(5, x)]).unwrap();
        es.apply_updates();

        assert_eq!(es.entity_changes().op(&5), Some(ChangeSetOp::Add));
        assert_eq!(
            es.component_changes().op(&ComponentId::new(5, x)),
            Some(ChangeSetOp::Add)
        );

        es.begin_changes();
        es.add_components([Component::new(5, x), Component::new(5, y)])
            .unwrap();
        es.apply_updates();

        assert_eq!(
            es.component_changes().op(&ComponentId::new(5, x)),
            Some(ChangeSetOp::Update)
        );
        assert_eq!(
            es.component_changes().op(&ComponentId::new(5, y)),
            Some(ChangeSetOp::Add)
        );
        assert_eq!(es.entity_changes().op(&5), Some(ChangeSetOp::Update));
    }

    #[test]
    fn test_unknown_def_stages_nothing() {
        let (mut es, x, _) = store_with_defs();
        let result = es.add_components([Component::new(0, x), Component::new(0, 99)]);
        assert!(matches!(result, Err(StoreError::DefNotFound(_))));

        es.apply_updates();
        assert_eq!(es.size(), 0);
        assert!(es.component_changes().is_empty());
    }

    #[test]
    fn test_removing_last_component_removes_entity() {
        let (mut es, x, y) = store_with_defs();
        es.add_components([Component::new(7, x), Component::new(7, y)])
            .unwrap();
        es.apply_updates();

        es.remove_components([ComponentId::new(7, x)]);
        es.apply_remove_changes();
        assert_eq!(es.entity_bit_field(7).unwrap().to_values(), vec![y]);
        assert!(es.get_component(ComponentId::new(7, x)).is_none());

        es.remove_components([ComponentId::new(7, y)]);
        es.apply_remove_changes();
        assert!(!es.has_entity(7));
        assert_eq!(es.entity_changes().op(&7), Some(ChangeSetOp::Remove));
    }

    #[test]
    fn test_remove_entity_cascades() {
        let (mut es, x, y) = store_with_defs();
        es.add_components([Component::new(3, x), Component::new(3, y), Component::new(4, x)])
            .unwrap();
        es.apply_updates();

        assert_eq!(es.remove_entity(3), 2);
        es.apply_remove_changes();

        assert!(!es.has_entity(3));
        assert!(es.has_entity(4));
        assert_eq!(es.components().count(), 1);
    }

    #[test]
    fn test_remove_staged_component_before_apply() {
        let (mut es, x, _) = store_with_defs();
        es.add_components([Component::new(9, x)]).unwrap();
        es.remove_components([ComponentId::new(9, x)]);
        es.apply_remove_changes();
        es.apply_updates();

        assert!(!es.has_entity(9));
        assert!(es.get_component(ComponentId::new(9, x)).is_none());
    }

    #[test]
    fn test_staged_add_then_remove_leaves_no_entity() {
        let (mut es, x, _) = store_with_defs();
        es.add_components([Component::new(9, x)]).unwrap();
        es.remove_components([ComponentId::new(9, x)]);
        es.apply_updates();

        assert!(es.get_entity(9, Populate::All).is_none());
        assert!(es.get_component(ComponentId::new(9, x)).is_none());
        assert_eq!(es.size(), 0);

        es.apply_remove_changes();
        assert_eq!(es.size(), 0);
    }

    #[test]
    fn test_replacing_last_component_keeps_entity_either_order() {
        for removes_first in [true, false] {
            let (mut es, x, y) = store_with_defs();
            es.add_components([Component::new(7, x)]).unwrap();
            es.apply_updates();

            es.begin_changes();
            es.remove_components([ComponentId::new(7, x)]);
            es.add_components([Component::new(7, y)]).unwrap();
            if removes_first {
                es.apply_remove_changes();
                es.apply_updates();
            } else {
                es.apply_updates();
                es.apply_remove_changes();
            }

            assert!(es.has_entity(7), "removes_first = {removes_first}");
            assert_eq!(es.entity_bit_field(7).unwrap().to_values(), vec![y]);
            assert!(es.get_component(ComponentId::new(7, x)).is_none());
            assert!(es.get_component(ComponentId::new(7, y)).is_some());
            assert_eq!(es.entity_changes().op(&7), Some(ChangeSetOp::Update));
        }
    }

    #[test]
    fn test_get_entity_populate_modes() {
        let (mut es, x, y) = store_with_defs();
        es.add_components([Component::new(1, x), Component::new(1, y)])
            .unwrap();
        es.apply_updates();

        let shell = es.get_entity(1, false).unwrap();
        assert_eq!(shell.size(), 2);
        assert_eq!(shell.components().count(), 0);

        let full = es.get_entity(1, true).unwrap();
        assert_eq!(full.components().count(), 2);

        let thin = es.get_entity(1, BitField::from_values([y])).unwrap();
        assert_eq!(thin.components().map(|c| c.def_id).collect::<Vec<_>>(), vec![y]);

        assert!(es.get_entity(2, true).is_none());
    }

    #[test]
    fn test_clone_is_independent() {
        let (mut es, x, _) = store_with_defs();
        es.add_components([Component::new(1, x).with("name", "orig")])
            .unwrap();
        es.apply_updates();

        let mut copy = es.clone_with(CloneOptions::default());
        copy.add_components([Component::new(1, x).with("name", "changed"), Component::new(2, x)])
            .unwrap();
        copy.apply_updates();

        assert_eq!(es.size(), 1);
        assert_eq!(
            es.get_component(ComponentId::new(1, x)).unwrap().get("name"),
            Some(&json!("orig"))
        );
        assert_eq!(copy.size(), 2);

        let defs_only = es.clone_with(CloneOptions {
            clone_defs: true,
            clone_entities: false,
        });
        assert_eq!(defs_only.size(), 0);
        assert_eq!(defs_only.component_defs().len(), 2);
    }

    #[test]
    fn test_generated_ids_skip_existing() {
        let (mut es, x, _) = store_with_defs();
        es.add_components([Component::new(1, x), Component::new(2, x)])
            .unwrap();
        es.apply_updates();

        let eid = es.add_entity(Entity::new(0)).unwrap();
        assert_eq!(eid, 3);
    }

    #[test]
    fn test_match_entities_and_components() {
        let (mut es, x, y) = store_with_defs();
        es.add_components([
            Component::new(1, x),
            Component::new(2, y),
            Component::new(3, x),
            Component::new(3, y),
        ])
        .unwrap();
        es.apply_updates();

        assert_eq!(es.match_entities(&BitField::from_values([x])), vec![1, 3]);
        assert_eq!(es.match_entities(&BitField::all()), vec![1, 2, 3]);
        assert!(es.match_entities(&BitField::new()).is_empty());

        let coms = es.match_components(&BitField::from_values([y]), None);
        assert_eq!(coms.iter().map(|c| c.entity_id).collect::<Vec<_>>(), vec![2, 3]);

        let coms = es.match_components(&BitField::all(), Some(&[3, 1]));
        assert_eq!(
            coms.iter().map(|c| (c.entity_id, c.def_id)).collect::<Vec<_>>(),
            vec![(3, x), (3, y), (1, x)]
        );
    }

    #[test]
    fn test_json_import_export() {
        let doc = json!({
            "defs": [
                {"uri": "/component/title", "properties": ["text"]},
                "/component/completed"
            ],
            "components": [
                {"@e": 100, "@d": "/component/title", "text": "wake up"},
                {"@e": 100, "@d": "/component/completed"},
                {"@e": 101, "@d": 1, "text": "eat"}
            ]
        });
        let mut es = EntitySet::new();
        es.import_json(&doc).unwrap();

        assert_eq!(es.size(), 2);
        assert_eq!(es.get_entity(100, true).unwrap().size(), 2);

        let mut copy = EntitySet::new();
        copy.import_json(&es.export_json()).unwrap();
        assert_eq!(copy.export_json(), es.export_json());
    }

    #[test]
    fn test_register_is_idempotent_through_store() {
        let mut es = EntitySet::new();
        let spec = json!(["/component/position", [{"name": "rank", "type": "integer"}, "file"]]);
        let a = es.register_json(&spec).unwrap();
        let b = es
            .register_json(&json!({
                "uri": "/component/position",
                "properties": [{"name": "rank", "type": "integer"}, {"name": "file"}]
            }))
            .unwrap();

        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.id(), b.id());
        assert_eq!(es.component_defs().len(), 1);
    }
}
