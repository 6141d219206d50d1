//! Law matching.
//!
//! A [`Map`] is a partial correspondence between relation entities and the
//! predicate nodes of one law. Matching is seeded at the law's deep
//! predicates: an entity that structurally matches a deep predicate (and,
//! recursively, whose parents match the predicate's parents) starts a new
//! map. Maps for the same law with disjoint deep predicates are merged when
//! they agree on every shared entity; a merged map whose predicate nodes
//! equal one of the law's predicate sets is *satisfied* and its conclusions
//! are appended to the relation (see [`append`]).
//!
//! # Invariants
//! - A map is injective both ways: [`Map::node_for`] and [`Map::entity_for`]
//!   are inverse partial functions.
//! - Pairs are validated as a whole before any of them is committed.
//! - The same union of deep predicate pairs is never merged twice.
//! - Tentative entities never match predicates.
//!
//! # Determinism
//! Maps, pairs and registries are ordered maps; entities are visited in
//! topological order and laws in catalog order.

pub mod append;

pub use append::InferredFormula;

use crate::catalog::{Catalog, LawId, LawNodeId};
use crate::config::{EvaluateOptions, EvaluateStats};
use crate::core::{Entity, EntityId, Relation, Side};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, trace, warn};

/// Identifier of a map, unique within a [`Matcher`].
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapId(u64);

impl MapId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MapId({})", self.0)
    }
}

/// A correspondence between relation entities and law nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Map {
    id: MapId,
    law: LawId,
    entity_to_node: BTreeMap<EntityId, LawNodeId>,
    node_to_entity: BTreeMap<LawNodeId, EntityId>,
    deep_predicates: BTreeSet<LawNodeId>,
    /// Maps sharing at least one pair with this one.
    intersections: BTreeSet<MapId>,
    satisfied: bool,
    tentative: bool,
    /// Entities the conclusions resolved to, in conclusion order.
    conclusions: Vec<EntityId>,
    /// Data nodes folded into commands: node -> (owner, command).
    formulas: BTreeMap<LawNodeId, (EntityId, String)>,
}

impl Map {
    fn new(id: MapId, law: LawId) -> Self {
        Self {
            id,
            law,
            entity_to_node: BTreeMap::new(),
            node_to_entity: BTreeMap::new(),
            deep_predicates: BTreeSet::new(),
            intersections: BTreeSet::new(),
            satisfied: false,
            tentative: false,
            conclusions: Vec::new(),
            formulas: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> MapId {
        self.id
    }

    #[inline]
    pub fn law(&self) -> LawId {
        self.law
    }

    #[inline]
    pub fn node_for(&self, entity: EntityId) -> Option<LawNodeId> {
        self.entity_to_node.get(&entity).copied()
    }

    #[inline]
    pub fn entity_for(&self, node: LawNodeId) -> Option<EntityId> {
        self.node_to_entity.get(&node).copied()
    }

    /// `(entity, node)` pairs in entity order.
    pub fn pairs(&self) -> impl Iterator<Item = (EntityId, LawNodeId)> + '_ {
        self.entity_to_node.iter().map(|(e, n)| (*e, *n))
    }

    pub fn len(&self) -> usize {
        self.entity_to_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_to_node.is_empty()
    }

    #[inline]
    pub fn deep_predicates(&self) -> &BTreeSet<LawNodeId> {
        &self.deep_predicates
    }

    #[inline]
    pub fn intersections(&self) -> &BTreeSet<MapId> {
        &self.intersections
    }

    #[inline]
    pub fn is_satisfied(&self) -> bool {
        self.satisfied
    }

    #[inline]
    pub fn is_tentative(&self) -> bool {
        self.tentative
    }

    #[inline]
    pub fn conclusions(&self) -> &[EntityId] {
        &self.conclusions
    }

    pub fn formulas(&self) -> impl Iterator<Item = (LawNodeId, EntityId, &str)> + '_ {
        self.formulas
            .iter()
            .map(|(node, (owner, source))| (*node, *owner, source.as_str()))
    }

    /// Both directions agree and have the same size.
    pub fn is_injective(&self) -> bool {
        self.entity_to_node.len() == self.node_to_entity.len()
            && self
                .entity_to_node
                .iter()
                .all(|(e, n)| self.node_to_entity.get(n) == Some(e))
    }

    /// Mapped nodes that are predicates of the law.
    fn predicate_nodes(&self, catalog: &Catalog) -> BTreeSet<LawNodeId> {
        self.node_to_entity
            .keys()
            .copied()
            .filter(|n| catalog.is_predicate(self.law, *n))
            .collect()
    }

    /// Records a pair unless it would break injectivity.
    fn record(&mut self, entity: EntityId, node: LawNodeId) -> bool {
        match (self.entity_to_node.get(&entity), self.node_to_entity.get(&node)) {
            (None, None) => {
                self.entity_to_node.insert(entity, node);
                self.node_to_entity.insert(node, entity);
                true
            }
            (Some(n), Some(e)) => *n == node && *e == entity,
            _ => false,
        }
    }

    /// Whether `(entity, node)` may join the map given the committed pairs
    /// and the pairs already `planned`. `Some(true)` means the pair is
    /// present already.
    fn admits(&self, entity: EntityId, node: LawNodeId, planned: &[(EntityId, LawNodeId)]) -> Option<bool> {
        match (self.entity_to_node.get(&entity), self.node_to_entity.get(&node)) {
            (Some(n), Some(e)) if *n == node && *e == entity => return Some(true),
            (None, None) => {}
            _ => return None,
        }
        for &(e, n) in planned {
            match (e == entity, n == node) {
                (true, true) => return Some(true),
                (false, false) => {}
                _ => return None,
            }
        }
        Some(false)
    }

    /// Collects the pairs needed to match `entity` to `node`, parents
    /// included. Nothing is committed; on failure `plan` is left as it was.
    fn plan_pair(
        &self,
        relation: &Relation,
        catalog: &Catalog,
        entity: EntityId,
        node: LawNodeId,
        plan: &mut Vec<(EntityId, LawNodeId)>,
    ) -> bool {
        match self.admits(entity, node, plan) {
            None => return false,
            Some(true) => return true,
            Some(false) => {}
        }
        let (Some(e), Some(n)) = (relation.get(entity), catalog.law_node(self.law, node)) else {
            return false;
        };
        if e.is_tentative() || n.is_data() || !catalog.instance_of(e.concept, n.concept) || !n.value.includes(&e.value) {
            return false;
        }
        plan.push((entity, node));
        let symmetric = catalog.concept(e.concept).map_or(false, |c| c.symmetric);
        for swapped in [false, true] {
            if swapped && !symmetric {
                break;
            }
            let mark = plan.len();
            if self.plan_parents(relation, catalog, e, node, swapped, plan) {
                return true;
            }
            plan.truncate(mark);
        }
        plan.pop();
        false
    }

    fn plan_parents(
        &self,
        relation: &Relation,
        catalog: &Catalog,
        entity: &Entity,
        node: LawNodeId,
        swapped: bool,
        plan: &mut Vec<(EntityId, LawNodeId)>,
    ) -> bool {
        let Some(n) = catalog.law_node(self.law, node) else {
            return false;
        };
        Side::BOTH.into_iter().all(|side| match n.parent(side) {
            None => true,
            Some(parent_node) => {
                let side = if swapped { side.other() } else { side };
                entity
                    .parent(side)
                    .map_or(false, |p| self.plan_pair(relation, catalog, p, parent_node, plan))
            }
        })
    }
}

/// How a set of predicate nodes relates to a law's predicate sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coverage {
    Outside,
    Partial,
    Exact,
}

fn coverage(catalog: &Catalog, law: LawId, nodes: &BTreeSet<LawNodeId>) -> Coverage {
    let Some(law) = catalog.law(law) else {
        return Coverage::Outside;
    };
    let mut partial = false;
    for set in &law.predicate_sets {
        if nodes.is_subset(set) {
            if nodes.len() == set.len() {
                return Coverage::Exact;
            }
            partial = true;
        }
    }
    if partial {
        Coverage::Partial
    } else {
        Coverage::Outside
    }
}

/// Everything one pass produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassOutcome {
    pub stats: EvaluateStats,
    pub appended: Vec<EntityId>,
    pub satisfied: Vec<MapId>,
    pub inferred: Vec<InferredFormula>,
}

/// What a matching pass reads and writes.
#[derive(Debug)]
pub struct MatchPass<'a> {
    relation: &'a mut Relation,
    catalog: &'a Catalog,
    tentative: bool,
    outcome: PassOutcome,
}

impl<'a> MatchPass<'a> {
    pub fn new(relation: &'a mut Relation, catalog: &'a Catalog, tentative: bool) -> Self {
        Self {
            relation,
            catalog,
            tentative,
            outcome: PassOutcome::default(),
        }
    }

    #[inline]
    pub fn relation(&self) -> &Relation {
        self.relation
    }

    #[inline]
    pub fn outcome(&self) -> &PassOutcome {
        &self.outcome
    }

    pub fn finish(self) -> PassOutcome {
        self.outcome
    }
}

/// Owns every map of a session.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    maps: BTreeMap<MapId, Map>,
    next_map: u64,
    /// Maps containing each `(entity, node)` pair.
    registry: BTreeMap<(EntityId, LawNodeId), BTreeSet<MapId>>,
    /// Tag each entity was last checked under.
    checked: BTreeMap<EntityId, String>,
    checks: usize,
    max_checks: usize,
}

impl Matcher {
    /// Creates a matcher allowing `max_checks` map checks per pass.
    pub fn new(max_checks: usize) -> Self {
        Self {
            max_checks,
            ..Self::default()
        }
    }

    #[inline]
    pub fn get(&self, id: MapId) -> Option<&Map> {
        self.maps.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: MapId) -> Option<&mut Map> {
        self.maps.get_mut(&id)
    }

    pub fn maps(&self) -> impl Iterator<Item = &Map> {
        self.maps.values()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Satisfied maps, in creation order.
    pub fn satisfied(&self) -> impl Iterator<Item = &Map> {
        self.maps.values().filter(|m| m.satisfied)
    }

    /// Maps containing the pair `(entity, node)`.
    pub fn maps_at(&self, entity: EntityId, node: LawNodeId) -> Vec<MapId> {
        self.registry
            .get(&(entity, node))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops every map and the checked-entity memo.
    pub fn reset(&mut self) {
        debug!(maps = self.maps.len(), "resetting matcher");
        self.maps.clear();
        self.registry.clear();
        self.checked.clear();
        self.next_map = 0;
    }

    /// Drops the maps that mention `entity` and forgets it was checked.
    pub fn forget_entity(&mut self, entity: EntityId) {
        let stale: Vec<MapId> = self
            .maps
            .values()
            .filter(|m| m.entity_to_node.contains_key(&entity))
            .map(|m| m.id)
            .collect();
        for id in stale {
            if let Some(map) = self.maps.remove(&id) {
                for (e, n) in map.pairs() {
                    if let Some(set) = self.registry.get_mut(&(e, n)) {
                        set.remove(&id);
                    }
                }
            }
        }
        self.registry.retain(|_, set| !set.is_empty());
        self.checked.remove(&entity);
    }

    fn budget_left(&mut self) -> bool {
        if self.checks >= self.max_checks {
            return false;
        }
        self.checks += 1;
        if self.checks == self.max_checks {
            warn!(max_checks = self.max_checks, "map check limit reached; remaining candidates skipped");
        }
        true
    }

    fn allocate(&mut self, mut map: Map) -> MapId {
        let id = MapId::new(self.next_map);
        self.next_map += 1;
        map.id = id;
        let pairs: Vec<(EntityId, LawNodeId)> = map.pairs().collect();
        for (e, n) in pairs {
            let others = self.registry.entry((e, n)).or_default();
            map.intersections.extend(others.iter().copied());
            others.insert(id);
        }
        map.intersections.remove(&id);
        self.maps.insert(id, map);
        id
    }

    /// Runs one matching pass over the relation.
    ///
    /// Entities already checked under `opts.tag` are skipped unless listed
    /// in `dirty`. Entities appended as accepted knowledge during the pass
    /// are checked too.
    pub fn evaluate(
        &mut self,
        relation: &mut Relation,
        catalog: &Catalog,
        opts: &EvaluateOptions,
        dirty: &BTreeSet<EntityId>,
    ) -> PassOutcome {
        if opts.reset {
            self.reset();
        }
        self.checks = 0;
        let maps_before = self.next_map;
        let mut pass = MatchPass::new(relation, catalog, opts.tentative);
        let mut seen: BTreeSet<EntityId> = BTreeSet::new();
        loop {
            let pending: Vec<EntityId> = pass
                .relation
                .topological()
                .into_iter()
                .filter(|id| !seen.contains(id))
                .filter(|id| pass.relation.get(*id).map_or(false, |e| !e.is_tentative()))
                .filter(|id| dirty.contains(id) || self.checked.get(id) != Some(&opts.tag))
                .collect();
            if pending.is_empty() || self.checks >= self.max_checks {
                break;
            }
            for id in pending {
                seen.insert(id);
                self.checked.insert(id, opts.tag.clone());
                pass.outcome.stats.nodes_checked += 1;
                self.check_entity(&mut pass, id);
            }
        }
        pass.relation.recompute_deep();
        let mut outcome = pass.finish();
        outcome.stats.maps_created = (self.next_map - maps_before) as usize;
        info!(
            tag = %opts.tag,
            tentative = opts.tentative,
            nodes_checked = outcome.stats.nodes_checked,
            maps_created = outcome.stats.maps_created,
            maps_satisfied = outcome.stats.maps_satisfied,
            nodes_appended = outcome.stats.nodes_appended,
            commands_inferred = outcome.stats.commands_inferred,
            "evaluate pass finished"
        );
        outcome
    }

    /// Seeds maps for `entity` at every deep predicate it matches, then
    /// appends or merges them. Returns the maps created.
    pub fn check_entity(&mut self, pass: &mut MatchPass<'_>, entity: EntityId) -> Vec<MapId> {
        let catalog = pass.catalog;
        let mut created = Vec::new();
        for law in catalog.laws() {
            for &node in catalog.deep_predicates(law.id) {
                if !self.budget_left() {
                    return created;
                }
                let Some(id) = self.create_map(pass, law.id, entity, node) else {
                    continue;
                };
                created.push(id);
                let predicates = self.maps.get(&id).map(|m| m.predicate_nodes(catalog)).unwrap_or_default();
                if coverage(catalog, law.id, &predicates) == Coverage::Exact {
                    self.append(pass, id);
                } else {
                    self.check_intersections(pass, id);
                }
            }
        }
        created
    }

    /// Creates a map matching `entity` to the deep predicate `node`.
    ///
    /// Returns `None` when the structure does not match or an identical
    /// single-predicate map exists already.
    pub fn create_map(
        &mut self,
        pass: &mut MatchPass<'_>,
        law: LawId,
        entity: EntityId,
        node: LawNodeId,
    ) -> Option<MapId> {
        let exists = self.registry.get(&(entity, node)).map_or(false, |ids| {
            ids.iter().any(|id| {
                self.maps
                    .get(id)
                    .map_or(false, |m| m.deep_predicates.len() == 1 && m.deep_predicates.contains(&node))
            })
        });
        if exists {
            return None;
        }
        let mut map = Map::new(MapId::new(u64::MAX), law);
        let mut plan = Vec::new();
        if !map.plan_pair(pass.relation, pass.catalog, entity, node, &mut plan) {
            return None;
        }
        for (e, n) in plan {
            map.record(e, n);
        }
        map.deep_predicates.insert(node);
        let id = self.allocate(map);
        trace!(map = %id, entity = %entity, node = %node, "created map");
        Some(id)
    }

    /// Checks `id` against every unsatisfied map of the same law, maps it
    /// already intersects first.
    pub fn check_intersections(&mut self, pass: &mut MatchPass<'_>, id: MapId) {
        let Some(map) = self.maps.get(&id) else {
            return;
        };
        let law = map.law;
        let mut candidates: Vec<MapId> = map.intersections.iter().copied().collect();
        candidates.extend(
            self.maps
                .values()
                .filter(|m| m.law == law && !m.satisfied && m.id != id && !map.intersections.contains(&m.id))
                .map(|m| m.id),
        );
        for other in candidates {
            if !self.budget_left() {
                return;
            }
            self.check_intersection(pass, id, other);
        }
    }

    /// Merges two maps of the same law when their deep predicates are
    /// disjoint, the union is not covered by an existing map, the union
    /// stays within a predicate set and both maps agree on every shared
    /// entity and node. A merge that completes a predicate set is appended.
    pub fn check_intersection(&mut self, pass: &mut MatchPass<'_>, a: MapId, b: MapId) -> bool {
        let catalog = pass.catalog;
        let (Some(ma), Some(mb)) = (self.maps.get(&a), self.maps.get(&b)) else {
            return false;
        };
        if a == b || ma.law != mb.law || ma.satisfied || mb.satisfied {
            return false;
        }
        if !ma.deep_predicates.is_disjoint(&mb.deep_predicates) {
            return false;
        }

        let mut deep_pairs = Vec::new();
        for m in [ma, mb] {
            for n in &m.deep_predicates {
                match m.entity_for(*n) {
                    Some(e) => deep_pairs.push((e, *n)),
                    None => return false,
                }
            }
        }
        let mut covering: Option<BTreeSet<MapId>> = None;
        for pair in &deep_pairs {
            let here = self.registry.get(pair).cloned().unwrap_or_default();
            covering = Some(match covering {
                None => here,
                Some(acc) => acc.intersection(&here).copied().collect(),
            });
        }
        if let Some(dup) = covering.as_ref().and_then(|c| c.iter().next()) {
            trace!(a = %a, b = %b, covered_by = %dup, "intersection already covered");
            return false;
        }

        let mut predicates = ma.predicate_nodes(catalog);
        predicates.extend(mb.predicate_nodes(catalog));
        let cover = coverage(catalog, ma.law, &predicates);
        if cover == Coverage::Outside {
            return false;
        }

        let mut merged = Map::new(MapId::new(u64::MAX), ma.law);
        for m in [ma, mb] {
            for (e, n) in m.pairs().filter(|(_, n)| catalog.is_predicate(m.law, *n)) {
                if !merged.record(e, n) {
                    trace!(a = %a, b = %b, entity = %e, node = %n, "maps disagree");
                    return false;
                }
            }
        }
        merged.deep_predicates = ma.deep_predicates.union(&mb.deep_predicates).copied().collect();
        let inherited: BTreeSet<MapId> = ma.intersections.union(&mb.intersections).copied().collect();

        let id = self.allocate(merged);
        if let Some(m) = self.maps.get_mut(&id) {
            m.intersections.extend(inherited);
            m.intersections.remove(&a);
            m.intersections.remove(&b);
        }
        debug!(map = %id, a = %a, b = %b, exact = cover == Coverage::Exact, "merged maps");
        if cover == Coverage::Exact {
            self.append(pass, id);
        } else {
            self.check_intersections(pass, id);
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::tests::sample_catalog;
    use crate::catalog::ConceptId;
    use crate::core::EntityRecord;
    use proptest::prelude::*;

    pub(crate) fn concept(catalog: &Catalog, name: &str) -> ConceptId {
        catalog.concept_by_name(name).unwrap().id
    }

    /// Two point/vector pairs: 5 <- 6 and 7 <- 8.
    pub(crate) fn two_vectors(catalog: &Catalog) -> Relation {
        let (point, vector) = (concept(catalog, "point"), concept(catalog, "vector"));
        Relation::from_records(
            vec![
                EntityRecord::new(5, point).with_name("a"),
                EntityRecord::new(6, vector).with_head(5).with_value("3"),
                EntityRecord::new(7, point).with_name("b"),
                EntityRecord::new(8, vector).with_head(7),
            ],
            catalog,
        )
        .unwrap()
    }

    const LAW: LawId = LawId::new(100);

    fn n(raw: u64) -> LawNodeId {
        LawNodeId::new(raw)
    }

    fn e(raw: u64) -> EntityId {
        EntityId::new(raw)
    }

    #[test]
    fn seeding_maps_parents_with_the_predicate() {
        let catalog = sample_catalog();
        let mut relation = two_vectors(&catalog);
        let mut matcher = Matcher::new(1_000);
        let mut pass = MatchPass::new(&mut relation, &catalog, false);
        let id = matcher.create_map(&mut pass, LAW, e(6), n(1002)).unwrap();
        let map = matcher.get(id).unwrap();
        assert_eq!(map.entity_for(n(1001)), Some(e(5)));
        assert_eq!(map.node_for(e(6)), Some(n(1002)));
        assert!(map.is_injective());
        // Same seed again is suppressed.
        assert_eq!(matcher.create_map(&mut pass, LAW, e(6), n(1002)), None);
        // A point is not a vector.
        assert_eq!(matcher.create_map(&mut pass, LAW, e(5), n(1002)), None);
    }

    #[test]
    fn value_constraints_filter_matches() {
        let catalog = sample_catalog();
        let (point, vector) = (concept(&catalog, "point"), concept(&catalog, "vector"));
        let mut relation = Relation::from_records(
            vec![
                EntityRecord::new(1, point),
                EntityRecord::new(2, vector).with_head(1).with_value("12"),
            ],
            &catalog,
        )
        .unwrap();
        let mut matcher = Matcher::new(1_000);
        let mut pass = MatchPass::new(&mut relation, &catalog, false);
        // 1002 requires a value in (0,10); 1004 accepts anything.
        assert_eq!(matcher.create_map(&mut pass, LAW, e(2), n(1002)), None);
        assert!(matcher.create_map(&mut pass, LAW, e(2), n(1004)).is_some());
    }

    #[test]
    fn disjoint_maps_merge_into_a_satisfied_map() {
        let catalog = sample_catalog();
        let mut relation = two_vectors(&catalog);
        let mut matcher = Matcher::new(1_000);
        let mut pass = MatchPass::new(&mut relation, &catalog, false);
        let m1 = matcher.create_map(&mut pass, LAW, e(6), n(1002)).unwrap();
        let m2 = matcher.create_map(&mut pass, LAW, e(8), n(1004)).unwrap();

        assert!(matcher.check_intersection(&mut pass, m1, m2));
        let merged = matcher.satisfied().next().unwrap().clone();
        for (entity, node) in [(5, 1001), (6, 1002), (7, 1003), (8, 1004)] {
            assert_eq!(merged.entity_for(n(node)), Some(e(entity)));
        }
        assert!(merged.is_injective());
        assert_eq!(pass.outcome().stats.maps_satisfied, 1);

        // The same union a second time is a duplicate.
        assert!(!matcher.check_intersection(&mut pass, m1, m2));
        assert!(!matcher.check_intersection(&mut pass, m2, m1));
        assert_eq!(matcher.satisfied().count(), 1);
    }

    #[test]
    fn overlapping_or_conflicting_maps_do_not_merge() {
        let catalog = sample_catalog();
        let (point, vector) = (concept(&catalog, "point"), concept(&catalog, "vector"));
        // One vector on one point: 1002 and 1004 would both need entity 2.
        let mut relation = Relation::from_records(
            vec![
                EntityRecord::new(1, point),
                EntityRecord::new(2, vector).with_head(1).with_value("5"),
            ],
            &catalog,
        )
        .unwrap();
        let mut matcher = Matcher::new(1_000);
        let mut pass = MatchPass::new(&mut relation, &catalog, false);
        let m1 = matcher.create_map(&mut pass, LAW, e(2), n(1002)).unwrap();
        let m2 = matcher.create_map(&mut pass, LAW, e(2), n(1004)).unwrap();
        assert!(!matcher.check_intersection(&mut pass, m1, m2));
        assert!(!matcher.check_intersection(&mut pass, m1, m1));
        assert_eq!(matcher.satisfied().count(), 0);
    }

    #[test]
    fn evaluate_appends_once_and_skips_checked_entities() {
        let catalog = sample_catalog();
        let mut relation = two_vectors(&catalog);
        let mut matcher = Matcher::new(10_000);
        let opts = EvaluateOptions::default();
        let outcome = matcher.evaluate(&mut relation, &catalog, &opts, &BTreeSet::new());
        assert_eq!(outcome.stats.nodes_checked, 4 + outcome.stats.nodes_appended);
        assert!(outcome.stats.maps_satisfied >= 1);
        assert_eq!(outcome.stats.commands_inferred, outcome.inferred.len());

        let segment = concept(&catalog, "segment");
        let segments = relation.iter().filter(|e| e.concept == segment).count();
        // Only entity 6 satisfies the value constraint of 1002.
        assert_eq!(segments, 1);

        let again = matcher.evaluate(&mut relation, &catalog, &opts, &BTreeSet::new());
        assert_eq!(again.stats.nodes_checked, 0);
        assert_eq!(relation.iter().filter(|e| e.concept == segment).count(), segments);
    }

    #[test]
    fn tentative_entities_are_not_matched() {
        let catalog = sample_catalog();
        let mut relation = two_vectors(&catalog);
        let mut matcher = Matcher::new(10_000);
        let opts = EvaluateOptions::suggest();
        let outcome = matcher.evaluate(&mut relation, &catalog, &opts, &BTreeSet::new());
        assert!(!outcome.appended.is_empty());
        for id in &outcome.appended {
            let entity = relation.get(*id).unwrap();
            assert!(entity.is_tentative());
            assert!(entity.provenance.appended);
            assert!(!entity.deep);
        }
        // Only the four original entities were checked.
        assert_eq!(outcome.stats.nodes_checked, 4);
    }

    #[test]
    fn forgetting_an_entity_drops_its_maps() {
        let catalog = sample_catalog();
        let mut relation = two_vectors(&catalog);
        let mut matcher = Matcher::new(1_000);
        let mut pass = MatchPass::new(&mut relation, &catalog, false);
        let m1 = matcher.create_map(&mut pass, LAW, e(6), n(1002)).unwrap();
        let m2 = matcher.create_map(&mut pass, LAW, e(8), n(1004)).unwrap();
        matcher.forget_entity(e(5));
        assert!(matcher.get(m1).is_none());
        assert!(matcher.get(m2).is_some());
        assert!(matcher.maps_at(e(6), n(1002)).is_empty());
    }

    fn relation_strategy() -> impl Strategy<Value = Vec<(bool, Option<usize>, u8)>> {
        // (is_vector, head index among earlier entities, value)
        prop::collection::vec((any::<bool>(), prop::option::of(0usize..8), 0u8..12), 1..9)
    }

    proptest! {
        #[test]
        fn maps_stay_injective(layout in relation_strategy()) {
            let catalog = sample_catalog();
            let (point, vector) = (concept(&catalog, "point"), concept(&catalog, "vector"));
            let records: Vec<EntityRecord> = layout
                .iter()
                .enumerate()
                .map(|(i, (is_vector, head, value))| {
                    let id = i as u64 + 1;
                    let mut record = EntityRecord::new(id, if *is_vector { vector } else { point })
                        .with_value(&value.to_string());
                    if let Some(h) = head.filter(|h| *h < i) {
                        record = record.with_head(h as u64 + 1);
                    }
                    record
                })
                .collect();
            let mut relation = Relation::from_records(records, &catalog).unwrap();
            let mut matcher = Matcher::new(5_000);
            matcher.evaluate(&mut relation, &catalog, &EvaluateOptions::default(), &BTreeSet::new());
            for map in matcher.maps() {
                prop_assert!(map.is_injective(), "map {} is not injective", map.id());
            }
        }
    }
}
