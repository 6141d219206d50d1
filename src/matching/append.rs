//! Appending the conclusions of a satisfied map.
//!
//! Each conclusion of the law is one branch. A branch is planned first,
//! walking head/reference links up to nodes the map already knows, and only
//! committed when the whole branch resolves. A branch whose plan fails is
//! skipped and logged; sibling branches are unaffected.
//!
//! An equivalent existing child (same concept under the same head, and the
//! same reference when the law node has one) is reused instead of creating a
//! duplicate. Data nodes are not created: their formula becomes an inferred
//! command owned by the entity their head resolves to.

use super::{MapId, MatchPass, Matcher};
use crate::catalog::{Catalog, ConceptId, LawId, LawNodeId};
use crate::core::{Entity, EntityId, Provenance, Relation, Side};
use crate::error::SessionError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};

/// A command contributed by a law's data node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferredFormula {
    pub map: MapId,
    pub node: LawNodeId,
    pub owner: EntityId,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Entity(EntityId),
    /// Result of step `n` of the plan.
    Planned(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Reuse {
        node: LawNodeId,
        entity: EntityId,
    },
    Create {
        node: LawNodeId,
        head: Option<Slot>,
        reference: Option<Slot>,
    },
    Formula {
        node: LawNodeId,
        owner: Slot,
    },
}

#[derive(Debug, Default)]
struct Plan {
    steps: Vec<Step>,
    slots: BTreeMap<LawNodeId, Slot>,
}

struct Planner<'p> {
    relation: &'p Relation,
    catalog: &'p Catalog,
    law: LawId,
    known: &'p BTreeMap<LawNodeId, EntityId>,
    formulas: &'p BTreeMap<LawNodeId, (EntityId, String)>,
}

impl Planner<'_> {
    fn slot(&self, node: LawNodeId, plan: &mut Plan, trail: &mut BTreeSet<LawNodeId>) -> Option<Slot> {
        if let Some(slot) = plan.slots.get(&node) {
            return Some(*slot);
        }
        if let Some(entity) = self.known.get(&node) {
            return self.relation.contains(*entity).then_some(Slot::Entity(*entity));
        }
        if let Some((owner, _)) = self.formulas.get(&node) {
            return self.relation.contains(*owner).then_some(Slot::Entity(*owner));
        }
        if !trail.insert(node) {
            return None;
        }
        let n = self.catalog.law_node(self.law, node)?;
        let head = match n.head {
            Some(h) => Some(self.slot(h, plan, trail)?),
            None => None,
        };
        let reference = match n.reference {
            Some(r) => Some(self.slot(r, plan, trail)?),
            None => None,
        };

        let slot = if n.is_data() {
            let owner = head?;
            plan.steps.push(Step::Formula { node, owner });
            owner
        } else if let Some(entity) = self.existing_child(n.concept, head, reference, n.reference.is_some()) {
            plan.steps.push(Step::Reuse { node, entity });
            Slot::Entity(entity)
        } else {
            plan.steps.push(Step::Create {
                node,
                head,
                reference,
            });
            Slot::Planned(plan.steps.len() - 1)
        };
        plan.slots.insert(node, slot);
        Some(slot)
    }

    /// An existing child of `head` equivalent to the node being appended.
    fn existing_child(
        &self,
        concept: ConceptId,
        head: Option<Slot>,
        reference: Option<Slot>,
        needs_reference: bool,
    ) -> Option<EntityId> {
        let Some(Slot::Entity(head)) = head else {
            return None;
        };
        let reference = match (needs_reference, reference) {
            (false, _) => None,
            (true, Some(Slot::Entity(r))) => Some(r),
            (true, _) => return None,
        };
        self.relation
            .children(head, Side::Head)
            .into_iter()
            .filter_map(|id| self.relation.get(id))
            .find(|child| child.concept == concept && (reference.is_none() || child.reference == reference))
            .map(|child| child.id)
    }
}

impl Matcher {
    /// Marks `id` satisfied and appends every conclusion of its law.
    /// Returns, per conclusion, the entity it resolved to.
    pub fn append(&mut self, pass: &mut MatchPass<'_>, id: MapId) -> Vec<Option<EntityId>> {
        let catalog = pass.catalog;
        let Some(map) = self.maps.get_mut(&id) else {
            return Vec::new();
        };
        if !map.satisfied {
            map.satisfied = true;
            map.tentative = pass.tentative;
            pass.outcome.stats.maps_satisfied += 1;
            pass.outcome.satisfied.push(id);
        }
        let law = map.law;
        let law_name = catalog.law(law).map(|l| l.name.as_str()).unwrap_or("");
        debug!(map = %id, law = %law_name, tentative = map.tentative, "appending conclusions");

        let mut resolved = Vec::new();
        for &node in catalog.conclusions(law) {
            let result = self.append_branch(pass, id, node);
            if result.is_none() {
                warn!(map = %id, law = %law_name, node = %node, "could not append conclusion");
            }
            resolved.push(result);
        }
        if let Some(map) = self.maps.get_mut(&id) {
            map.conclusions = resolved.iter().flatten().copied().collect();
        }
        resolved
    }

    fn append_branch(&mut self, pass: &mut MatchPass<'_>, id: MapId, node: LawNodeId) -> Option<EntityId> {
        let map = self.maps.get(&id)?;
        let mut plan = Plan::default();
        let root = {
            let planner = Planner {
                relation: &*pass.relation,
                catalog: pass.catalog,
                law: map.law,
                known: &map.node_to_entity,
                formulas: &map.formulas,
            };
            planner.slot(node, &mut plan, &mut BTreeSet::new())?
        };
        self.commit(pass, id, &plan.steps, root)
    }

    /// Applies a planned branch. Entities are inserted first; the map, the
    /// reused entities and the pass outcome are only touched once every
    /// insert of the branch succeeded. A failed insert removes the entities
    /// this branch already created.
    fn commit(&mut self, pass: &mut MatchPass<'_>, id: MapId, steps: &[Step], root: Slot) -> Option<EntityId> {
        let catalog = pass.catalog;
        let map = self.maps.get(&id)?;
        let (law, tentative) = (map.law, map.tentative);
        let resolve = |slot: Slot, made: &[Option<EntityId>]| match slot {
            Slot::Entity(e) => Some(e),
            Slot::Planned(i) => made.get(i).copied().flatten(),
        };

        let mut made: Vec<Option<EntityId>> = vec![None; steps.len()];
        let mut created: Vec<(LawNodeId, EntityId)> = Vec::new();
        let mut formulas: Vec<(LawNodeId, EntityId, String)> = Vec::new();
        for (i, step) in steps.iter().enumerate() {
            let done = match *step {
                Step::Reuse { entity, .. } => Some(entity),
                Step::Create {
                    node,
                    head,
                    reference,
                } => catalog.law_node(law, node).and_then(|n| {
                    let entity = Entity {
                        id: pass.relation.fresh_id(),
                        concept: n.concept,
                        head: head.and_then(|s| resolve(s, &made)),
                        reference: reference.and_then(|s| resolve(s, &made)),
                        value: n.value.clone(),
                        name: n.name.clone(),
                        deep: false,
                        provenance: Provenance {
                            appended: true,
                            tentative,
                            from_maps: BTreeSet::from([id]),
                        },
                    };
                    match pass.relation.insert(entity, catalog) {
                        Ok(entity) => {
                            created.push((node, entity));
                            Some(entity)
                        }
                        Err(error) => {
                            warn!(map = %id, node = %node, %error, "append rejected by relation");
                            None
                        }
                    }
                }),
                Step::Formula { node, owner } => resolve(owner, &made).and_then(|owner| {
                    let source = catalog.law_node(law, node)?.formula.clone()?;
                    formulas.push((node, owner, source));
                    Some(owner)
                }),
            };
            match done {
                Some(entity) => made[i] = Some(entity),
                None => {
                    for (_, entity) in created.iter().rev() {
                        let _ = pass.relation.remove(*entity);
                    }
                    debug!(map = %id, removed = created.len(), "branch rolled back");
                    return None;
                }
            }
        }

        let map = self.maps.get_mut(&id)?;
        for step in steps {
            if let Step::Reuse { node, entity } = *step {
                if let Some(existing) = pass.relation.get_mut(entity) {
                    if existing.provenance.appended {
                        existing.provenance.from_maps.insert(id);
                        existing.provenance.tentative &= tentative;
                    }
                }
                map.record(entity, node);
                trace!(map = %id, node = %node, entity = %entity, "reused equivalent entity");
            }
        }
        for (node, entity) in created {
            map.record(entity, node);
            pass.outcome.stats.nodes_appended += 1;
            pass.outcome.appended.push(entity);
            trace!(map = %id, node = %node, entity = %entity, "appended entity");
        }
        for (node, owner, source) in formulas {
            map.formulas.insert(node, (owner, source.clone()));
            pass.outcome.stats.commands_inferred += 1;
            pass.outcome.inferred.push(InferredFormula {
                map: id,
                node,
                owner,
                source,
            });
        }
        resolve(root, &made)
    }

    /// Commits (`false`) or withdraws (`true`) a satisfied map. Appended
    /// entities stay tentative only while every map claiming them is
    /// tentative; the relation's deep set is recomputed.
    pub fn set_tentative(
        &mut self,
        relation: &mut Relation,
        id: MapId,
        tentative: bool,
    ) -> Result<(), SessionError> {
        let map = self.maps.get_mut(&id).ok_or(SessionError::UnknownMap(id))?;
        if !map.satisfied {
            return Err(SessionError::NotSatisfied(id));
        }
        map.tentative = tentative;

        let claimed: Vec<EntityId> = relation
            .iter()
            .filter(|e| e.provenance.appended && e.provenance.from_maps.contains(&id))
            .map(|e| e.id)
            .collect();
        for entity in claimed {
            let still_tentative = relation.get(entity).map_or(false, |e| {
                e.provenance
                    .from_maps
                    .iter()
                    .all(|m| self.maps.get(m).map_or(true, |m| m.tentative))
            });
            if let Some(e) = relation.get_mut(entity) {
                e.provenance.tentative = still_tentative;
            }
        }
        relation.recompute_deep();
        debug!(map = %id, tentative, "map tentative flag changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sample_catalog;
    use crate::core::EntityRecord;
    use crate::matching::tests::{concept, two_vectors};

    fn satisfied_map(matcher: &mut Matcher, pass: &mut MatchPass<'_>) -> MapId {
        let m1 = matcher
            .create_map(pass, LawId::new(100), EntityId::new(6), LawNodeId::new(1002))
            .unwrap();
        let m2 = matcher
            .create_map(pass, LawId::new(100), EntityId::new(8), LawNodeId::new(1004))
            .unwrap();
        assert!(matcher.check_intersection(pass, m1, m2));
        matcher.satisfied().next().unwrap().id()
    }

    #[test]
    fn conclusions_are_created_once() {
        let catalog = sample_catalog();
        let mut relation = two_vectors(&catalog);
        let mut matcher = Matcher::new(1_000);
        let mut pass = MatchPass::new(&mut relation, &catalog, false);
        let id = satisfied_map(&mut matcher, &mut pass);
        assert_eq!(pass.outcome().stats.nodes_appended, 1);
        assert_eq!(pass.outcome().inferred.len(), 1);

        let first = matcher.append(&mut pass, id);
        assert_eq!(pass.outcome().stats.nodes_appended, 1);
        assert_eq!(pass.outcome().inferred.len(), 1);
        assert_eq!(pass.outcome().stats.maps_satisfied, 1);

        let map = matcher.get(id).unwrap();
        let segment = map.entity_for(LawNodeId::new(1005)).unwrap();
        // The data node resolves to the entity owning its formula.
        assert_eq!(first, vec![Some(segment)]);
        assert_eq!(map.conclusions(), &[segment]);
        let formulas: Vec<_> = map.formulas().collect();
        assert_eq!(
            formulas,
            vec![(LawNodeId::new(1006), segment, "symbol.over = '<mo>&#x2192;</mo>'")]
        );
        let created = pass.relation().get(segment).unwrap();
        assert_eq!(created.head, Some(EntityId::new(6)));
        assert_eq!(created.reference, Some(EntityId::new(8)));
        assert!(created.provenance.appended);
    }

    #[test]
    fn existing_equivalent_child_is_reused() {
        let catalog = sample_catalog();
        let mut relation = two_vectors(&catalog);
        let segment = concept(&catalog, "segment");
        relation
            .insert(
                Entity::from_record(EntityRecord::new(20, segment).with_head(6).with_reference(8)),
                &catalog,
            )
            .unwrap();
        let mut matcher = Matcher::new(1_000);
        let mut pass = MatchPass::new(&mut relation, &catalog, false);
        let id = satisfied_map(&mut matcher, &mut pass);
        assert_eq!(pass.outcome().stats.nodes_appended, 0);
        let map = matcher.get(id).unwrap();
        assert_eq!(map.conclusions(), &[EntityId::new(20)]);
        // User entities never pick up map provenance.
        assert!(pass.relation().get(EntityId::new(20)).unwrap().provenance.from_maps.is_empty());
    }

    #[test]
    fn branch_with_missing_parent_is_skipped() {
        let catalog = sample_catalog();
        let mut relation = two_vectors(&catalog);
        let mut matcher = Matcher::new(1_000);
        let id = {
            let mut pass = MatchPass::new(&mut relation, &catalog, true);
            satisfied_map(&mut matcher, &mut pass)
        };
        let before = relation.len();
        // Drop the appended segment and one matched vector.
        let segment = matcher.get(id).unwrap().entity_for(LawNodeId::new(1005)).unwrap();
        relation.remove(segment).unwrap();
        relation.remove(EntityId::new(8)).unwrap();
        if let Some(map) = matcher.get_mut(id) {
            map.node_to_entity.remove(&LawNodeId::new(1005));
            map.entity_to_node.remove(&segment);
            map.formulas.clear();
        }
        let mut pass = MatchPass::new(&mut relation, &catalog, true);
        assert_eq!(matcher.append(&mut pass, id), vec![None]);
        assert_eq!(pass.relation().len(), before - 2);
    }

    #[test]
    fn failed_insert_rolls_back_the_branch() {
        let catalog = sample_catalog();
        let mut relation = two_vectors(&catalog);
        let mut matcher = Matcher::new(1_000);
        let mut pass = MatchPass::new(&mut relation, &catalog, false);
        let id = satisfied_map(&mut matcher, &mut pass);
        let before = pass.relation().len();
        let map_before = matcher.get(id).unwrap().clone();
        let stats_before = pass.outcome().stats;

        // The second creation names a parent that does not exist.
        let steps = [
            Step::Create {
                node: LawNodeId::new(1005),
                head: Some(Slot::Entity(EntityId::new(6))),
                reference: Some(Slot::Entity(EntityId::new(8))),
            },
            Step::Create {
                node: LawNodeId::new(1005),
                head: Some(Slot::Planned(0)),
                reference: Some(Slot::Entity(EntityId::new(999))),
            },
            Step::Formula {
                node: LawNodeId::new(1006),
                owner: Slot::Planned(0),
            },
        ];
        assert_eq!(matcher.commit(&mut pass, id, &steps, Slot::Planned(1)), None);
        assert_eq!(pass.relation().len(), before);
        assert_eq!(matcher.get(id).unwrap(), &map_before);
        assert_eq!(pass.outcome().stats, stats_before);
    }

    #[test]
    fn accepting_a_suggestion_commits_its_entities() {
        let catalog = sample_catalog();
        let mut relation = two_vectors(&catalog);
        let mut matcher = Matcher::new(1_000);
        let id = {
            let mut pass = MatchPass::new(&mut relation, &catalog, true);
            satisfied_map(&mut matcher, &mut pass)
        };
        let segment = matcher.get(id).unwrap().entity_for(LawNodeId::new(1005)).unwrap();
        assert!(matcher.get(id).unwrap().is_tentative());
        assert!(relation.get(segment).unwrap().is_tentative());

        matcher.set_tentative(&mut relation, id, false).unwrap();
        assert!(!relation.get(segment).unwrap().is_tentative());
        assert!(relation.get(segment).unwrap().deep);
        assert!(!relation.get(EntityId::new(6)).unwrap().deep);

        assert_eq!(
            matcher.set_tentative(&mut relation, MapId::new(99), false),
            Err(SessionError::UnknownMap(MapId::new(99)))
        );
    }
}
