//! Per-entity data trees and variable tables.
//!
//! Every entity owns two dependencies: a data tree holding its attributes
//! (`concept.*`, `value`, `symbol.*`, `visual.*`, ...) and a table of
//! `$variables` through which commands hand `(dependency, key)` pairs to
//! each other. Primary attributes are seeded known before any command runs;
//! everything a command writes is locked as derived.

use crate::arena::DepId;
use crate::catalog::Concept;
use crate::core::{Entity, EntityId};
use crate::dependency::{DepKind, DependencyGraph, KeyPath, KeyRef};
use crate::error::FieldError;
use crate::symbol::{identifier, number, SYMBOL_KEY};
use crate::value::Datum;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as Json};
use std::collections::BTreeMap;
use tracing::trace;

/// Root segment of the concept namespace.
pub const CONCEPT_KEY: &str = "concept";
/// Key of the entity's primary value.
pub const VALUE_KEY: &str = "value";
/// Key under which a node with children exports its own value.
pub const OWN_VALUE_KEY: &str = "_value";

/// State of an entity data tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataState {
    pub entity: EntityId,
    /// Precedence group of the entity's concept, lower binds tighter.
    pub precedence: Option<usize>,
}

/// Variables bound by commands compiled for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableTable {
    pub owner: Option<EntityId>,
    bindings: BTreeMap<String, KeyRef>,
}

impl VariableTable {
    pub fn get(&self, name: &str) -> Option<&KeyRef> {
        self.bindings.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }
}

/// The two dependencies owned by an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDeps {
    pub data: DepId,
    pub variables: DepId,
}

impl EntityDeps {
    #[inline]
    pub fn data_key(&self, path: impl Into<KeyPath>) -> KeyRef {
        KeyRef::new(self.data, path)
    }
}

/// Snapshot of a data field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub path: KeyPath,
    pub value: Option<Datum>,
    pub previous_value: Option<Datum>,
    pub locked: bool,
    pub known: bool,
    pub propagated: bool,
}

impl DependencyGraph {
    /// Creates and seeds the data tree and variable table of `entity`.
    pub fn create_entity_data(
        &mut self,
        entity: &Entity,
        concept: &Concept,
        precedence: Option<usize>,
    ) -> EntityDeps {
        let data = self.create(DepKind::Data(DataState {
            entity: entity.id,
            precedence,
        }));
        let variables = self.create(DepKind::Variables(VariableTable {
            owner: Some(entity.id),
            bindings: BTreeMap::new(),
        }));

        self.seed(data, "concept.id", Datum::Number(concept.id.as_u64() as f64), true);
        self.seed(data, "concept.name", Datum::Text(concept.name.clone()), true);
        let value = entity.value.to_datum();
        if let Some(v) = &value {
            self.seed(data, VALUE_KEY, v.clone(), true);
        }

        let text = KeyPath::from_segments([SYMBOL_KEY, "text"]);
        if let Some(name) = &entity.name {
            self.seed(data, text, Datum::Text(identifier(name)), true);
        } else if let Some(n) = entity.value.as_number() {
            self.seed(data, text, Datum::Text(number(n)), true);
        } else if let Some(template) = &concept.symbol {
            self.seed(data, text, Datum::Text(template.clone()), false);
        }
        trace!(entity = %entity.id, data = %data, variables = %variables, "seeded entity data");
        EntityDeps { data, variables }
    }

    fn seed(&mut self, dep: DepId, path: impl Into<KeyPath>, value: Datum, known: bool) {
        let path = path.into();
        if let Some(d) = self.get_mut(dep) {
            let meta = d.ensure_key(&path);
            meta.value = Some(value);
            meta.known = known;
        }
    }

    /// Owner entity of a data tree.
    pub fn data_state(&self, dep: DepId) -> Option<&DataState> {
        match self.get(dep)?.kind() {
            DepKind::Data(state) => Some(state),
            _ => None,
        }
    }

    /// Writes a derived value. Keys that are known (or lie under a known
    /// key) hold primary data and are left untouched; returns whether the
    /// write happened.
    pub(crate) fn write_value(&mut self, key: &KeyRef, value: Datum) -> bool {
        let owner = self.data_state(key.dep).map(|s| s.entity);
        let Some(dep) = self.get_mut(key.dep) else {
            return false;
        };
        if key
            .key
            .ancestry()
            .any(|p| dep.key(&p).map_or(false, |m| m.known))
        {
            trace!(key = %key, "skipping write to known key");
            return false;
        }
        let meta = dep.ensure_key(&key.key);
        meta.previous_value = meta.value.take();
        meta.value = Some(value);
        meta.locked = true;
        if key.key.first() == Some(CONCEPT_KEY) {
            if let Some(entity) = owner {
                self.mark_entity_dirty(entity);
            }
        }
        true
    }

    /// Appends `value` as the next free numerically indexed child of `key`.
    pub(crate) fn append_child(&mut self, key: &KeyRef, value: Datum) -> Option<KeyPath> {
        let dep = self.get(key.dep)?;
        let next = dep
            .children(&key.key)
            .iter()
            .filter_map(|c| c.last().and_then(|s| s.parse::<usize>().ok()))
            .map(|n| n + 1)
            .max()
            .unwrap_or(0);
        let child = key.key.child(next.to_string());
        self.write_value(&KeyRef::new(key.dep, child.clone()), value)
            .then_some(child)
    }

    /// Pushes `value` onto the list value of `key`.
    pub(crate) fn append_value(&mut self, key: &KeyRef, value: Datum) -> bool {
        let combined = match self.value(key).cloned() {
            Some(current) => current.push(value),
            None => Datum::List(vec![value]),
        };
        self.write_value(key, combined)
    }

    /// Removes the value of `key` and of every key below it. Sub-keys that
    /// take part in wait edges are kept (emptied) so the edges stay valid.
    pub(crate) fn clear_key(&mut self, key: &KeyRef) {
        let Some(dep) = self.get_mut(key.dep) else {
            return;
        };
        if let Some(meta) = dep.key_mut(&key.key) {
            meta.previous_value = meta.value.take();
        }
        let mut removable = Vec::new();
        for path in dep.subtree_paths(&key.key).into_iter().skip(1) {
            if let Some(meta) = dep.key_mut(&path) {
                meta.previous_value = meta.value.take();
                if meta.waiting.is_empty() && meta.triggers.is_empty() {
                    removable.push(path);
                }
            }
        }
        // Only drop leaves-first so no kept key loses its ancestors.
        removable.sort_by(|a, b| b.len().cmp(&a.len()));
        for path in removable {
            if dep.descendants(&path).next().is_none() {
                dep.remove_key(&path);
            }
        }
    }

    /// Binds `$name` in a variable table and marks it known.
    pub fn bind_variable(&mut self, variables: DepId, name: &str, target: KeyRef) {
        let Some(dep) = self.get_mut(variables) else {
            return;
        };
        if let DepKind::Variables(table) = dep.kind_mut() {
            trace!(variable = name, target = %target, "bound variable");
            table.bindings.insert(name.to_string(), target);
        } else {
            return;
        }
        // Variable keys are always live so bindings reach waiting commands.
        let key = KeyRef::new(variables, KeyPath::from_segments([name]));
        if let Some(meta) = self.get_mut(variables).map(|d| d.ensure_key(&key.key)) {
            meta.active = true;
        }
        self.set_known(&key, false);
    }

    /// Current binding of `$name`.
    pub fn variable(&self, variables: DepId, name: &str) -> Option<&KeyRef> {
        match self.get(variables)?.kind() {
            DepKind::Variables(table) => table.get(name),
            _ => None,
        }
    }

    /// Snapshot of a field.
    pub fn field(&self, key: &KeyRef) -> Option<Field> {
        let meta = self.key(key)?;
        Some(Field {
            path: key.key.clone(),
            value: meta.value.clone(),
            previous_value: meta.previous_value.clone(),
            locked: meta.locked,
            known: meta.known,
            propagated: meta.propagated,
        })
    }

    /// Interactive edit of a primary field. Derived (locked) fields refuse.
    /// Returns the previous value.
    pub fn edit_field(
        &mut self,
        entity: EntityId,
        key: &KeyRef,
        value: Datum,
    ) -> Result<Option<Datum>, FieldError> {
        if self.data_state(key.dep).map(|s| s.entity) != Some(entity) {
            return Err(FieldError::UnknownEntity(entity));
        }
        let Some(dep) = self.get_mut(key.dep) else {
            return Err(FieldError::UnknownEntity(entity));
        };
        let meta = dep.ensure_key(&key.key);
        if meta.locked {
            return Err(FieldError::Locked {
                entity,
                path: key.key.clone(),
            });
        }
        meta.previous_value = meta.value.replace(value);
        meta.known = true;
        let previous = meta.previous_value.clone();
        if key.key.first() == Some(CONCEPT_KEY) {
            self.mark_entity_dirty(entity);
        }
        Ok(previous)
    }

    /// Exports the sub-tree at `key` as nested JSON. A key holding both a
    /// value and children keeps its value under `_value`.
    pub fn collect_tree(&self, key: &KeyRef) -> Json {
        let Some(dep) = self.get(key.dep) else {
            return Json::Null;
        };
        tree_json(dep, &key.key)
    }
}

fn tree_json(dep: &crate::dependency::Dependency, path: &KeyPath) -> Json {
    let own = dep
        .key(path)
        .and_then(|m| m.value())
        .map(|v| serde_json::to_value(v).unwrap_or(Json::Null));
    let children = dep.children(path);
    if children.is_empty() {
        return own.unwrap_or(Json::Null);
    }
    let mut object = JsonMap::new();
    if let Some(own) = own {
        object.insert(OWN_VALUE_KEY.to_string(), own);
    }
    for child in children {
        let value = tree_json(dep, &child);
        if let (Some(segment), false) = (child.last(), value.is_null()) {
            object.insert(segment.to_string(), value);
        }
    }
    if object.is_empty() {
        Json::Null
    } else {
        Json::Object(object)
    }
}
