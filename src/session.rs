//! The session: one object owning the catalog, the active relation, every
//! live dependency and every map.
//!
//! A session drives the passes the editor asks for:
//!
//! - [`Session::evaluate`] runs law matching over entities that are new or
//!   flagged dirty and records the formulas satisfied laws assert.
//! - [`Session::resolve_data`] rebuilds the dependency graph for one
//!   attribute family: it seeds a data tree per entity, compiles concept and
//!   inferred commands, activates the attribute and drains the cascade.
//! - [`Session::suggest`] evaluates tentatively and lists the satisfied,
//!   still tentative maps with the symbols of their conclusions.
//! - [`Session::accept_suggestion`] commits one of them.
//!
//! Dependency trees only live until the next `resolve_data`; maps, inferred
//! commands and the dirty set persist across passes.

use crate::catalog::{Catalog, ConceptId, LawNodeId};
use crate::command::{CommandTemplate, CompileContext};
use crate::config::{EngineConfig, EvaluateOptions, EvaluateStats};
use crate::core::{Entity, EntityId, EntityRecord, Relation};
use crate::data::{EntityDeps, Field};
use crate::dependency::DependencyGraph;
use crate::error::{FieldError, RelationError, SessionError};
use crate::fingerprint::{HashValue, DOMAIN_RELATION};
use crate::matching::{InferredFormula, MapId, Matcher};
use crate::value::{Datum, Value};
use crate::visual::{shapes, Shape, VISUAL_KEY};
use serde::Serialize;
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// A command contributed by a satisfied law, compiled with the concept
/// commands of its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferredCommand {
    pub map: MapId,
    pub node: LawNodeId,
    pub owner: EntityId,
    pub source: String,
    /// Attribute family of the command target.
    pub attribute: String,
}

/// A satisfied, still tentative law application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    pub map: MapId,
    pub law: String,
    /// Rendered symbols of the conclusions, in conclusion order.
    pub symbols: Vec<String>,
}

#[derive(Debug)]
pub struct Session {
    catalog: Catalog,
    config: EngineConfig,
    relation: Relation,
    graph: DependencyGraph,
    entities: BTreeMap<EntityId, EntityDeps>,
    matcher: Matcher,
    inferred: BTreeMap<(MapId, LawNodeId), InferredCommand>,
    dirty: BTreeSet<EntityId>,
    /// Attribute family the graph was last resolved for.
    resolved: Option<String>,
}

impl Session {
    pub fn new(catalog: Catalog, config: EngineConfig) -> Self {
        Self {
            graph: DependencyGraph::new(config.max_cascade_steps),
            matcher: Matcher::new(config.max_map_checks),
            catalog,
            config,
            relation: Relation::new(),
            entities: BTreeMap::new(),
            inferred: BTreeMap::new(),
            dirty: BTreeSet::new(),
            resolved: None,
        }
    }

    /// Builds a session over editor records.
    pub fn from_records<I>(catalog: Catalog, config: EngineConfig, records: I) -> Result<Self, SessionError>
    where
        I: IntoIterator<Item = EntityRecord>,
    {
        let relation = Relation::from_records(records, &catalog)?;
        let mut session = Self::new(catalog, config);
        session.relation = relation;
        Ok(session)
    }

    #[inline]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    #[inline]
    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    #[inline]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Data tree and variable table of `entity` from the last resolution.
    pub fn entity_deps(&self, entity: EntityId) -> Option<EntityDeps> {
        self.entities.get(&entity).copied()
    }

    pub fn inferred_commands(&self) -> impl Iterator<Item = &InferredCommand> {
        self.inferred.values()
    }

    /// Entities waiting to be re-checked by the next evaluate pass.
    pub fn dirty(&self) -> &BTreeSet<EntityId> {
        &self.dirty
    }

    /// Replaces the catalog. A catalog with a different fingerprint drops
    /// every map and inferred command and flags every entity.
    pub fn set_catalog(&mut self, catalog: Catalog) -> Result<(), SessionError> {
        if let Some(entity) = self.relation.iter().find(|e| catalog.concept(e.concept).is_none()) {
            return Err(RelationError::UnknownConcept {
                entity: entity.id,
                concept: entity.concept,
            }
            .into());
        }
        let changed = catalog.fingerprint() != self.catalog.fingerprint();
        self.catalog = catalog;
        if changed {
            info!(catalog = %self.catalog.fingerprint(), "catalog changed; resetting maps");
            self.matcher.reset();
            self.inferred.clear();
            self.dirty.extend(self.relation.ids());
            self.clear_graph();
        }
        Ok(())
    }

    fn clear_graph(&mut self) {
        self.graph.clear();
        self.entities.clear();
        self.resolved = None;
    }

    /// Rebuilds every data tree and resolves the `attribute` family.
    /// Returns the number of command instances compiled.
    pub fn resolve_data(&mut self, attribute: &str) -> usize {
        if !self.config.is_attribute(attribute) {
            debug!(attribute, "not a configured attribute type");
        }
        self.clear_graph();
        let order = self.relation.topological();
        for id in &order {
            let Some(entity) = self.relation.get(*id) else {
                continue;
            };
            let Some(concept) = self.catalog.concept(entity.concept) else {
                warn!(entity = %id, concept = %entity.concept, "entity concept missing from catalog");
                continue;
            };
            let precedence = self
                .catalog
                .precedence_index(entity.concept, &self.config.symbol_precedence);
            let deps = self.graph.create_entity_data(entity, concept, precedence);
            self.entities.insert(*id, deps);
        }

        let ctx = CompileContext {
            relation: &self.relation,
            catalog: &self.catalog,
            entities: &self.entities,
        };
        let mut compiled = 0;
        for id in &order {
            let Some(entity) = self.relation.get(*id) else {
                continue;
            };
            for source in self.catalog.commands_for(entity.concept, attribute) {
                compiled += self.graph.compile_source(&ctx, *id, source);
            }
            for command in self
                .inferred
                .values()
                .filter(|c| c.owner == *id && c.attribute == attribute)
            {
                compiled += self.graph.compile_source(&ctx, *id, &command.source);
            }
        }

        for deps in self.entities.values() {
            self.graph.activate(&deps.data_key(attribute), true);
        }
        self.graph.settle();
        self.dirty.extend(self.graph.take_dirty_entities());
        self.resolved = Some(attribute.to_string());

        let stats = self.graph.stats();
        debug!(
            attribute,
            entities = self.entities.len(),
            commands = compiled,
            commands_executed = stats.commands_executed,
            "resolved attribute"
        );
        compiled
    }

    /// Resolves `symbol` and returns every rendered symbol.
    pub fn symbolize(&mut self) -> BTreeMap<EntityId, String> {
        self.resolve_data("symbol");
        self.symbols()
    }

    /// Symbols rendered by the last resolution.
    pub fn symbols(&self) -> BTreeMap<EntityId, String> {
        self.entities
            .iter()
            .filter_map(|(id, deps)| self.graph.symbol(deps.data).map(|s| (*id, s)))
            .collect()
    }

    pub fn symbol(&self, entity: EntityId) -> Option<String> {
        self.graph.symbol(self.entities.get(&entity)?.data)
    }

    /// Resolves `visual` and exports every non-empty sub-tree.
    pub fn visualize(&mut self) -> BTreeMap<EntityId, Json> {
        self.resolve_data(VISUAL_KEY);
        self.entities
            .iter()
            .map(|(id, deps)| (*id, self.graph.collect_tree(&deps.data_key(VISUAL_KEY))))
            .filter(|(_, tree)| !tree.is_null())
            .collect()
    }

    /// Shapes of `entity` from the last `visual` resolution.
    pub fn shapes(&self, entity: EntityId) -> Vec<Shape> {
        self.entities
            .get(&entity)
            .map(|deps| shapes(&self.graph.collect_tree(&deps.data_key(VISUAL_KEY))))
            .unwrap_or_default()
    }

    /// Runs one law-matching pass.
    pub fn evaluate(&mut self, opts: &EvaluateOptions) -> EvaluateStats {
        let mut dirty = std::mem::take(&mut self.dirty);
        dirty.extend(self.graph.take_dirty_entities());
        if opts.reset {
            self.inferred.clear();
        }
        let outcome = self
            .matcher
            .evaluate(&mut self.relation, &self.catalog, opts, &dirty);
        for formula in outcome.inferred {
            self.record_formula(formula);
        }
        outcome.stats
    }

    fn record_formula(&mut self, formula: InferredFormula) {
        let attribute = match CommandTemplate::parse(&formula.source) {
            Ok(template) => template.target.key.first().map(str::to_string),
            Err(error) => {
                debug!(map = %formula.map, node = %formula.node, %error, "law formula does not parse");
                return;
            }
        };
        let Some(attribute) = attribute else {
            debug!(map = %formula.map, node = %formula.node, "law formula has no attribute");
            return;
        };
        self.inferred
            .entry((formula.map, formula.node))
            .or_insert(InferredCommand {
                map: formula.map,
                node: formula.node,
                owner: formula.owner,
                source: formula.source,
                attribute,
            });
    }

    /// Evaluates tentatively, symbolizes and lists the pending suggestions.
    pub fn suggest(&mut self) -> Vec<Suggestion> {
        self.evaluate(&EvaluateOptions::suggest());
        self.symbolize();
        self.suggestions()
    }

    /// Satisfied, tentative maps with the symbols of the last resolution.
    pub fn suggestions(&self) -> Vec<Suggestion> {
        self.matcher
            .satisfied()
            .filter(|m| m.is_tentative())
            .map(|m| Suggestion {
                map: m.id(),
                law: self
                    .catalog
                    .law(m.law())
                    .map(|l| l.name.clone())
                    .unwrap_or_default(),
                symbols: m.conclusions().iter().filter_map(|e| self.symbol(*e)).collect(),
            })
            .collect()
    }

    /// Commits a suggestion and re-symbolizes.
    pub fn accept_suggestion(&mut self, map: MapId) -> Result<(), SessionError> {
        self.matcher.set_tentative(&mut self.relation, map, false)?;
        let committed: Vec<EntityId> = self
            .relation
            .iter()
            .filter(|e| e.provenance.from_maps.contains(&map) && !e.is_tentative())
            .map(|e| e.id)
            .collect();
        info!(map = %map, entities = committed.len(), "accepted suggestion");
        self.dirty.extend(committed);
        self.symbolize();
        Ok(())
    }

    pub fn add_entity(&mut self, record: EntityRecord) -> Result<EntityId, SessionError> {
        let id = self.relation.insert(Entity::from_record(record), &self.catalog)?;
        self.relation.recompute_deep();
        self.dirty.insert(id);
        Ok(id)
    }

    /// Removes an entity; its children lose the link and are re-checked.
    pub fn remove_entity(&mut self, id: EntityId) -> Result<Entity, SessionError> {
        let children: Vec<EntityId> = self
            .relation
            .iter()
            .filter(|e| e.head == Some(id) || e.reference == Some(id))
            .map(|e| e.id)
            .collect();
        let removed = self.relation.remove(id)?;
        self.relation.recompute_deep();
        self.forget(id);
        for child in children {
            self.forget(child);
            self.dirty.insert(child);
        }
        self.dirty.remove(&id);
        if let Some(deps) = self.entities.remove(&id) {
            self.graph.remove(deps.data);
            self.graph.remove(deps.variables);
        }
        Ok(removed)
    }

    pub fn set_value(&mut self, id: EntityId, value: Value) -> Result<(), SessionError> {
        self.relation.set_value(id, value)?;
        self.touch(id);
        Ok(())
    }

    pub fn set_concept(&mut self, id: EntityId, concept: ConceptId) -> Result<(), SessionError> {
        self.relation.set_concept(id, concept, &self.catalog)?;
        self.touch(id);
        Ok(())
    }

    pub fn set_parents(
        &mut self,
        id: EntityId,
        head: Option<EntityId>,
        reference: Option<EntityId>,
    ) -> Result<(), SessionError> {
        self.relation.set_parents(id, head, reference)?;
        self.relation.recompute_deep();
        self.touch(id);
        Ok(())
    }

    fn touch(&mut self, id: EntityId) {
        self.forget(id);
        self.dirty.insert(id);
    }

    /// Drops maps mentioning `id` and the commands they inferred.
    fn forget(&mut self, id: EntityId) {
        self.matcher.forget_entity(id);
        self.inferred
            .retain(|(map, _), command| command.owner != id && self.matcher.get(*map).is_some());
    }

    /// Edits a primary field of the last resolution. Derived fields refuse.
    pub fn set_field(&mut self, entity: EntityId, path: &str, value: Datum) -> Result<Option<Datum>, SessionError> {
        let deps = self
            .entities
            .get(&entity)
            .ok_or(FieldError::UnknownEntity(entity))?;
        let previous = self.graph.edit_field(entity, &deps.data_key(path), value)?;
        self.dirty.extend(self.graph.take_dirty_entities());
        Ok(previous)
    }

    pub fn field(&self, entity: EntityId, path: &str) -> Option<Field> {
        self.graph.field(&self.entities.get(&entity)?.data_key(path))
    }

    /// Content hash of the relation records.
    pub fn fingerprint(&self) -> HashValue {
        let bytes = serde_json::to_vec(&self.relation.to_records()).unwrap_or_default();
        HashValue::hash_with_domain(DOMAIN_RELATION, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{sample_catalog, SAMPLE_CATALOG};
    use crate::catalog::CatalogDef;

    fn e(raw: u64) -> EntityId {
        EntityId::new(raw)
    }

    fn session(records: impl FnOnce(&Catalog) -> Vec<EntityRecord>) -> Session {
        let catalog = sample_catalog();
        let records = records(&catalog);
        Session::from_records(catalog, EngineConfig::default(), records).unwrap()
    }

    fn cid(catalog: &Catalog, name: &str) -> ConceptId {
        catalog.concept_by_name(name).unwrap().id
    }

    fn vectors(catalog: &Catalog) -> Vec<EntityRecord> {
        let (point, vector) = (cid(catalog, "point"), cid(catalog, "vector"));
        vec![
            EntityRecord::new(5, point).with_name("a"),
            EntityRecord::new(6, vector).with_head(5).with_value("3"),
            EntityRecord::new(7, point).with_name("b"),
            EntityRecord::new(8, vector).with_head(7),
        ]
    }

    #[test]
    fn edits_keep_the_relation_consistent() {
        let mut s = session(vectors);
        let point = cid(s.catalog(), "point");
        assert!(matches!(
            s.add_entity(EntityRecord::new(9, point).with_head(42)),
            Err(SessionError::Relation(RelationError::UnknownParent { .. }))
        ));
        assert_eq!(s.add_entity(EntityRecord::new(9, point).with_head(6)).unwrap(), e(9));
        assert!(matches!(
            s.set_parents(e(5), Some(e(9)), None),
            Err(SessionError::Relation(RelationError::Cycle { .. }))
        ));
        assert!(s.dirty().contains(&e(9)));

        s.remove_entity(e(6)).unwrap();
        assert!(s.relation().get(e(9)).unwrap().head.is_none());
        assert!(s.dirty().contains(&e(9)));
        assert!(!s.dirty().contains(&e(6)));
    }

    #[test]
    fn value_edits_drop_stale_maps() {
        let mut s = session(vectors);
        let stats = s.evaluate(&EvaluateOptions::default());
        assert_eq!(stats.maps_satisfied, 1);
        assert_eq!(s.inferred_commands().count(), 1);

        // 12 falls outside (0,10): the law no longer applies to vector 6.
        s.set_value(e(6), Value::parse("12")).unwrap();
        assert_eq!(s.matcher().satisfied().count(), 0);
        assert_eq!(s.inferred_commands().count(), 0);
        let again = s.evaluate(&EvaluateOptions::default());
        assert_eq!(again.maps_satisfied, 0);
        assert_eq!(again.nodes_checked, 1);
    }

    #[test]
    fn inferred_commands_target_their_attribute() {
        let mut s = session(vectors);
        s.evaluate(&EvaluateOptions::default());
        let command = s.inferred_commands().next().unwrap().clone();
        assert_eq!(command.attribute, "symbol");
        assert_eq!(command.node, LawNodeId::new(1006));
        let segment = cid(s.catalog(), "segment");
        assert_eq!(s.relation().get(command.owner).unwrap().concept, segment);

        let symbols = s.symbolize();
        let rendered = &symbols[&command.owner];
        assert!(rendered.starts_with("<mover>"), "{rendered}");
        assert!(rendered.contains("&#x2192;"));
    }

    #[test]
    fn field_edits_honour_locks() {
        let mut s = session(vectors);
        assert!(matches!(
            s.set_field(e(5), "value", Datum::Number(1.0)),
            Err(SessionError::Field(FieldError::UnknownEntity(_)))
        ));
        s.resolve_data("visual");
        let previous = s.set_field(e(6), "value", Datum::Number(4.0)).unwrap();
        assert_eq!(previous, Some(Datum::Number(3.0)));
        let field = s.field(e(6), "value").unwrap();
        assert_eq!(field.previous_value, Some(Datum::Number(3.0)));
        assert!(!field.locked);

        s.set_field(e(5), "concept.name", Datum::from("vector")).unwrap();
        assert!(s.dirty().contains(&e(5)));
    }

    #[test]
    fn changed_catalog_resets_maps() {
        let mut s = session(vectors);
        s.evaluate(&EvaluateOptions::default());
        assert!(!s.matcher().is_empty());

        // Same content, same fingerprint: nothing is dropped.
        s.set_catalog(Catalog::from_json(SAMPLE_CATALOG).unwrap()).unwrap();
        assert!(!s.matcher().is_empty());

        let mut def = s.catalog().def().clone();
        def.laws.clear();
        s.set_catalog(Catalog::new(def).unwrap()).unwrap();
        assert!(s.matcher().is_empty());
        assert_eq!(s.inferred_commands().count(), 0);
        assert_eq!(s.dirty().len(), s.relation().len());

        assert!(matches!(
            s.set_catalog(Catalog::new(CatalogDef::default()).unwrap()),
            Err(SessionError::Relation(RelationError::UnknownConcept { .. }))
        ));
    }

    #[test]
    fn accepting_requires_a_satisfied_map() {
        let mut s = session(vectors);
        assert_eq!(
            s.accept_suggestion(MapId::new(7)),
            Err(SessionError::UnknownMap(MapId::new(7)))
        );
        s.evaluate(&EvaluateOptions::suggest());
        let unsatisfied = s.matcher().maps().find(|m| !m.is_satisfied()).unwrap().id();
        assert_eq!(
            s.accept_suggestion(unsatisfied),
            Err(SessionError::NotSatisfied(unsatisfied))
        );
    }

    #[test]
    fn fingerprint_tracks_relation_content() {
        let mut s = session(vectors);
        let before = s.fingerprint();
        assert_eq!(before, s.fingerprint());
        s.set_value(e(8), Value::parse("1")).unwrap();
        assert_ne!(before, s.fingerprint());
    }
}
