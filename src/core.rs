//! Entities and the active relation.
//!
//! A relation is a forest of entities. Every entity has at most one head and
//! one reference parent; together these links form trees, never cycles. The
//! children of an entity are the entities naming it as head (or, on the
//! other side, as reference).
//!
//! # Invariants
//! - Entity ids are unique within a relation.
//! - Every head/reference link names an existing entity.
//! - Following head/reference links never returns to the starting entity.
//!
//! # Determinism
//! Entities are stored in a `BTreeMap`; children and topological order are
//! sorted by id.

use crate::catalog::{Catalog, ConceptId};
use crate::error::RelationError;
use crate::matching::MapId;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Identifier of an entity in the active relation.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

/// Which parent link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Side {
    Head,
    Reference,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Head, Side::Reference];

    #[inline]
    pub fn other(self) -> Side {
        match self {
            Side::Head => Side::Reference,
            Side::Reference => Side::Head,
        }
    }
}

/// An entity as supplied by the editor or persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub concept: ConceptId,
    #[serde(default)]
    pub head: Option<EntityId>,
    #[serde(default)]
    pub reference: Option<EntityId>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub name: Option<String>,
}

impl EntityRecord {
    pub fn new(id: u64, concept: ConceptId) -> Self {
        Self {
            id: EntityId::new(id),
            concept,
            head: None,
            reference: None,
            value: Value::empty(),
            name: None,
        }
    }

    pub fn with_head(mut self, head: u64) -> Self {
        self.head = Some(EntityId::new(head));
        self
    }

    pub fn with_reference(mut self, reference: u64) -> Self {
        self.reference = Some(EntityId::new(reference));
        self
    }

    pub fn with_value(mut self, value: &str) -> Self {
        self.value = Value::parse(value);
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// Where an entity came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    /// Synthesised by a satisfied law.
    pub appended: bool,
    /// Synthesised and not yet accepted.
    pub tentative: bool,
    /// Maps whose append produced or reused this entity.
    pub from_maps: BTreeSet<MapId>,
}

/// A node of the active relation.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub concept: ConceptId,
    pub head: Option<EntityId>,
    pub reference: Option<EntityId>,
    pub value: Value,
    pub name: Option<String>,
    /// Set by [`Relation::recompute_deep`].
    pub deep: bool,
    pub provenance: Provenance,
}

impl Entity {
    pub fn from_record(record: EntityRecord) -> Self {
        Self {
            id: record.id,
            concept: record.concept,
            head: record.head,
            reference: record.reference,
            value: record.value,
            name: record.name,
            deep: false,
            provenance: Provenance::default(),
        }
    }

    #[inline]
    pub fn parent(&self, side: Side) -> Option<EntityId> {
        match side {
            Side::Head => self.head,
            Side::Reference => self.reference,
        }
    }

    #[inline]
    pub fn is_tentative(&self) -> bool {
        self.provenance.tentative
    }

    pub fn to_record(&self) -> EntityRecord {
        EntityRecord {
            id: self.id,
            concept: self.concept,
            head: self.head,
            reference: self.reference,
            value: self.value.clone(),
            name: self.name.clone(),
        }
    }
}

/// The active relation graph.
#[derive(Debug, Clone, Default)]
pub struct Relation {
    entities: BTreeMap<EntityId, Entity>,
    next_id: u64,
}

impl Relation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a relation from editor records, in any order.
    pub fn from_records<I>(records: I, catalog: &Catalog) -> Result<Self, RelationError>
    where
        I: IntoIterator<Item = EntityRecord>,
    {
        let mut relation = Relation::new();
        for record in records {
            if catalog.concept(record.concept).is_none() {
                return Err(RelationError::UnknownConcept {
                    entity: record.id,
                    concept: record.concept,
                });
            }
            if relation.entities.contains_key(&record.id) {
                return Err(RelationError::DuplicateEntity(record.id));
            }
            relation.next_id = relation.next_id.max(record.id.as_u64() + 1);
            relation.entities.insert(record.id, Entity::from_record(record));
        }
        for entity in relation.entities.values() {
            for side in Side::BOTH {
                if let Some(parent) = entity.parent(side) {
                    if !relation.entities.contains_key(&parent) {
                        return Err(RelationError::UnknownParent {
                            entity: entity.id,
                            parent,
                        });
                    }
                }
            }
        }
        let order = relation.topological();
        if order.len() != relation.entities.len() {
            let sorted: BTreeSet<EntityId> = order.into_iter().collect();
            let entity = relation
                .entities
                .keys()
                .copied()
                .find(|id| !sorted.contains(id))
                .unwrap_or(EntityId::new(0));
            return Err(RelationError::Cycle { entity });
        }
        relation.recompute_deep();
        Ok(relation)
    }

    /// Returns a fresh entity id.
    pub fn fresh_id(&mut self) -> EntityId {
        let id = EntityId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Inserts an entity whose parents already exist.
    pub fn insert(&mut self, entity: Entity, catalog: &Catalog) -> Result<EntityId, RelationError> {
        if self.entities.contains_key(&entity.id) {
            return Err(RelationError::DuplicateEntity(entity.id));
        }
        if catalog.concept(entity.concept).is_none() {
            return Err(RelationError::UnknownConcept {
                entity: entity.id,
                concept: entity.concept,
            });
        }
        for side in Side::BOTH {
            if let Some(parent) = entity.parent(side) {
                if parent == entity.id {
                    return Err(RelationError::Cycle { entity: entity.id });
                }
                if !self.entities.contains_key(&parent) {
                    return Err(RelationError::UnknownParent {
                        entity: entity.id,
                        parent,
                    });
                }
            }
        }
        let id = entity.id;
        self.next_id = self.next_id.max(id.as_u64() + 1);
        self.entities.insert(id, entity);
        Ok(id)
    }

    /// Removes an entity; children lose the link to it.
    pub fn remove(&mut self, id: EntityId) -> Result<Entity, RelationError> {
        let entity = self
            .entities
            .remove(&id)
            .ok_or(RelationError::UnknownEntity(id))?;
        for other in self.entities.values_mut() {
            if other.head == Some(id) {
                other.head = None;
            }
            if other.reference == Some(id) {
                other.reference = None;
            }
        }
        Ok(entity)
    }

    /// Relinks an entity, refusing links that would close a cycle.
    pub fn set_parents(
        &mut self,
        id: EntityId,
        head: Option<EntityId>,
        reference: Option<EntityId>,
    ) -> Result<(), RelationError> {
        if !self.entities.contains_key(&id) {
            return Err(RelationError::UnknownEntity(id));
        }
        for parent in [head, reference].into_iter().flatten() {
            if !self.entities.contains_key(&parent) {
                return Err(RelationError::UnknownParent { entity: id, parent });
            }
            if parent == id || self.ancestors(parent).contains(&id) {
                return Err(RelationError::Cycle { entity: id });
            }
        }
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.head = head;
            entity.reference = reference;
        }
        Ok(())
    }

    pub fn set_value(&mut self, id: EntityId, value: Value) -> Result<(), RelationError> {
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(RelationError::UnknownEntity(id))?;
        entity.value = value;
        Ok(())
    }

    pub fn set_concept(
        &mut self,
        id: EntityId,
        concept: ConceptId,
        catalog: &Catalog,
    ) -> Result<(), RelationError> {
        if catalog.concept(concept).is_none() {
            return Err(RelationError::UnknownConcept { entity: id, concept });
        }
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(RelationError::UnknownEntity(id))?;
        entity.concept = concept;
        Ok(())
    }

    #[inline]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    #[inline]
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Entities linking to `id` on `side`, sorted by id.
    pub fn children(&self, id: EntityId, side: Side) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|e| e.parent(side) == Some(id))
            .map(|e| e.id)
            .collect()
    }

    /// Every entity reachable by following head/reference links from `id`.
    pub fn ancestors(&self, id: EntityId) -> BTreeSet<EntityId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(entity) = self.entities.get(&current) else {
                continue;
            };
            for parent in [entity.head, entity.reference].into_iter().flatten() {
                if seen.insert(parent) {
                    stack.push(parent);
                }
            }
        }
        seen
    }

    /// Parents before children (Kahn), ties broken by id.
    ///
    /// Entities on a cycle are omitted, so a short result signals a cycle.
    ///
    /// # Citations
    /// - Kahn, "Topological sorting of large networks" (1962)
    pub fn topological(&self) -> Vec<EntityId> {
        let mut indegree: BTreeMap<EntityId, usize> = BTreeMap::new();
        let mut children: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();
        for entity in self.entities.values() {
            let parents: BTreeSet<EntityId> = [entity.head, entity.reference]
                .into_iter()
                .flatten()
                .filter(|p| self.entities.contains_key(p))
                .collect();
            indegree.insert(entity.id, parents.len());
            for parent in parents {
                children.entry(parent).or_default().push(entity.id);
            }
        }
        let mut ready: VecDeque<EntityId> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.entities.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            if let Some(kids) = children.get(&id) {
                for kid in kids {
                    if let Some(d) = indegree.get_mut(kid) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push_back(*kid);
                        }
                    }
                }
            }
        }
        order
    }

    /// Recomputes the deep flag: an accepted entity is deep when no accepted
    /// entity links to it.
    pub fn recompute_deep(&mut self) {
        let mut has_child: BTreeSet<EntityId> = BTreeSet::new();
        for entity in self.entities.values().filter(|e| !e.is_tentative()) {
            has_child.extend([entity.head, entity.reference].into_iter().flatten());
        }
        for entity in self.entities.values_mut() {
            entity.deep = !entity.is_tentative() && !has_child.contains(&entity.id);
        }
    }

    /// Ids of deep entities, sorted.
    pub fn deep_nodes(&self) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|e| e.deep)
            .map(|e| e.id)
            .collect()
    }

    pub fn to_records(&self) -> Vec<EntityRecord> {
        self.entities.values().map(Entity::to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sample_catalog;

    fn cid(catalog: &Catalog, name: &str) -> ConceptId {
        catalog.concept_by_name(name).map(|c| c.id).unwrap()
    }

    #[test]
    fn records_in_any_order() {
        let catalog = sample_catalog();
        let point = cid(&catalog, "point");
        let relation = Relation::from_records(
            vec![
                EntityRecord::new(2, point).with_head(1),
                EntityRecord::new(1, point),
            ],
            &catalog,
        )
        .unwrap();
        assert_eq!(relation.topological(), vec![EntityId::new(1), EntityId::new(2)]);
        assert_eq!(relation.children(EntityId::new(1), Side::Head), vec![EntityId::new(2)]);
        assert_eq!(relation.deep_nodes(), vec![EntityId::new(2)]);
    }

    #[test]
    fn cycles_are_rejected() {
        let catalog = sample_catalog();
        let point = cid(&catalog, "point");
        let err = Relation::from_records(
            vec![
                EntityRecord::new(1, point).with_head(2),
                EntityRecord::new(2, point).with_reference(1),
            ],
            &catalog,
        )
        .unwrap_err();
        assert!(matches!(err, RelationError::Cycle { .. }));

        let mut relation = Relation::from_records(
            vec![
                EntityRecord::new(1, point),
                EntityRecord::new(2, point).with_head(1),
            ],
            &catalog,
        )
        .unwrap();
        assert_eq!(
            relation.set_parents(EntityId::new(1), Some(EntityId::new(2)), None),
            Err(RelationError::Cycle {
                entity: EntityId::new(1)
            })
        );
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let catalog = sample_catalog();
        let point = cid(&catalog, "point");
        let err =
            Relation::from_records(vec![EntityRecord::new(1, point).with_head(9)], &catalog).unwrap_err();
        assert_eq!(
            err,
            RelationError::UnknownParent {
                entity: EntityId::new(1),
                parent: EntityId::new(9)
            }
        );
    }

    #[test]
    fn removing_detaches_children() {
        let catalog = sample_catalog();
        let point = cid(&catalog, "point");
        let mut relation = Relation::from_records(
            vec![
                EntityRecord::new(1, point),
                EntityRecord::new(2, point).with_head(1),
            ],
            &catalog,
        )
        .unwrap();
        relation.remove(EntityId::new(1)).unwrap();
        assert_eq!(relation.get(EntityId::new(2)).and_then(|e| e.head), None);
        assert_eq!(relation.fresh_id(), EntityId::new(3));
    }

    #[test]
    fn tentative_children_do_not_hide_deep_parents() {
        let catalog = sample_catalog();
        let point = cid(&catalog, "point");
        let mut relation =
            Relation::from_records(vec![EntityRecord::new(1, point)], &catalog).unwrap();
        let id = relation.fresh_id();
        let mut child = Entity::from_record(EntityRecord::new(id.as_u64(), point).with_head(1));
        child.provenance.appended = true;
        child.provenance.tentative = true;
        relation.insert(child, &catalog).unwrap();
        relation.recompute_deep();
        assert_eq!(relation.deep_nodes(), vec![EntityId::new(1)]);
    }
}
