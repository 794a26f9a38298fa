#![allow(clippy::missing_fields_in_debug)]

//! ents-store - bitfield-indexed entity/component record store
//!
//! Records ("components") are typed by registered schemas ("component
//! defs") and attached to integer entities. Each entity keeps a [`BitField`]
//! of the defs it carries, so "entities that have X or Y" is a bit test
//! rather than a table scan.
//!
//! # Key Concepts
//!
//! - **ComponentDef**: a schema (uri, properties) with a structural hash;
//!   registering the same shape twice returns the existing def
//! - **Component**: `{ "@e": entity, "@d": def, ...attrs }`
//! - **EntitySet**: the store; writes are staged and committed explicitly
//! - **ChangeSet**: the net add/update/remove delta of one mutation cycle
//! - **Filter**: an unevaluated attribute predicate run as a set plan
//!
//! # Example
//!
//! ```
//! use ents_store::{Component, ComponentDef, EntitySet};
//!
//! let mut es = EntitySet::new();
//! let title = es.register(ComponentDef::new("/component/title", vec![]));
//!
//! es.add_components([Component::new(0, title.id()).with("text", "buy milk")])
//!     .unwrap();
//! assert_eq!(es.size(), 0); // staged, not yet visible
//!
//! es.apply_updates();
//! assert_eq!(es.size(), 1);
//! ```

pub mod bitfield;
mod change_set;
mod component;
mod component_def;
mod entity;
mod entity_set;
mod error;
mod filter;
mod store;

pub use bitfield::BitField;
pub use change_set::{ChangeSet, ChangeSetOp};
pub use component::{Component, ComponentId};
pub use component_def::{ComponentDef, ComponentDefRegistry, DefId, PropertySpec};
pub use entity::{Entity, EntityId};
pub use entity_set::{CloneOptions, EntitySet, EntitySetOptions, Populate};
pub use error::{StoreError, StoreResult};
pub use filter::{AttrRef, CompareOp, Filter, FilterPlan, Operand, values_equal};
pub use store::EntityStore;
