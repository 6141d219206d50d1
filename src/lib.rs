//! lawgraph: constraint propagation and law matching over concept graphs.
//!
//! A relation is a forest of entities, each typed by a concept and linked to
//! at most one head and one reference parent. Concepts carry small commands
//! (`symbol.text = {{A.symbol}} + '<mo>+</mo>' + {{B.symbol}}`) that compile
//! into dependency edges between per-entity data trees; resolving an
//! attribute family pushes values through those edges until every key that
//! can resolve has. Laws are predicate templates: when a set of entities
//! matches one of a law's predicate sets, the law's conclusions are appended
//! to the relation, either as accepted knowledge or as tentative
//! suggestions.
//!
//! # Architecture
//!
//! - [`arena`]: generation-checked storage for live dependency trees.
//! - [`dependency`]: the wait/resolve/propagate engine and its cascade queue.
//! - [`data`], [`symbol`], [`visual`]: entity data trees, symbol markup and
//!   shapes read from resolved trees.
//! - [`command`]: reference parser, expression evaluator and compiler.
//! - [`core`], [`catalog`], [`value`]: entities, concepts, laws and values.
//! - [`matching`]: maps, intersections and appending conclusions.
//! - [`session`]: the object owning all of the above for one editing session.
//!
//! # Determinism
//!
//! All registries are ordered maps; the cascade queue is FIFO; entities are
//! visited in topological order with ties broken by id. Two sessions fed the
//! same catalog and records produce the same maps, ids and symbols.
//!
//! # Example
//!
//! ```
//! use lawgraph::prelude::*;
//!
//! let catalog = Catalog::from_json(r#"{
//!     "concepts": [
//!         { "id": 1, "name": "point" },
//!         { "id": 2, "name": "sum", "commands": { "symbol": [
//!             "symbol.text = {{A.symbol}} + '<mo>+</mo>' + {{B.symbol}}"
//!         ] } }
//!     ]
//! }"#).unwrap();
//! let point = ConceptId::new(1);
//! let sum = ConceptId::new(2);
//! let mut session = Session::from_records(
//!     catalog,
//!     EngineConfig::default(),
//!     vec![
//!         EntityRecord::new(1, point).with_name("a"),
//!         EntityRecord::new(2, point).with_name("b"),
//!         EntityRecord::new(3, sum).with_head(1).with_reference(2),
//!     ],
//! ).unwrap();
//! let symbols = session.symbolize();
//! assert_eq!(
//!     symbols[&EntityId::new(3)],
//!     "<mrow><mrow><mi>a</mi></mrow><mo>+</mo><mrow><mi>b</mi></mrow></mrow>"
//! );
//! ```

pub mod arena;
pub mod catalog;
pub mod command;
pub mod config;
pub mod core;
pub mod data;
pub mod dependency;
pub mod error;
pub mod fingerprint;
pub mod matching;
pub mod session;
pub mod symbol;
pub mod value;
pub mod visual;

pub use crate::catalog::{Catalog, ConceptId, LawId, LawNodeId};
pub use crate::core::{Entity, EntityId, EntityRecord, Relation};
pub use crate::error::{CatalogError, FieldError, RelationError, SessionError};
pub use crate::matching::{Map, MapId, Matcher};
pub use crate::session::{Session, Suggestion};

/// Prelude for convenient usage.
pub mod prelude {
    pub use crate::arena::{DepArena, DepId};
    pub use crate::catalog::{Catalog, CatalogDef, Concept, ConceptId, Law, LawId, LawNode, LawNodeId};
    pub use crate::command::{CommandOp, CommandTemplate, Reference};
    pub use crate::config::{EngineConfig, EvaluateOptions, EvaluateStats};
    pub use crate::core::{Entity, EntityId, EntityRecord, Provenance, Relation, Side};
    pub use crate::data::{EntityDeps, Field};
    pub use crate::dependency::{DepKind, DependencyGraph, KeyPath, KeyRef};
    pub use crate::error::{CatalogError, FieldError, RelationError, SessionError};
    pub use crate::fingerprint::HashValue;
    pub use crate::matching::{InferredFormula, Map, MapId, Matcher};
    pub use crate::session::{InferredCommand, Session, Suggestion};
    pub use crate::value::{Datum, Value};
    pub use crate::visual::{shapes, Point, Shape};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use crate::catalog::tests::sample_catalog;

    fn e(raw: u64) -> EntityId {
        EntityId::new(raw)
    }

    fn session(records: impl FnOnce(&dyn Fn(&str) -> ConceptId) -> Vec<EntityRecord>) -> Session {
        let catalog = sample_catalog();
        let records = {
            let id = |name: &str| catalog.concept_by_name(name).unwrap().id;
            records(&id)
        };
        Session::from_records(catalog, EngineConfig::default(), records).unwrap()
    }

    fn vectors(c: &dyn Fn(&str) -> ConceptId) -> Vec<EntityRecord> {
        vec![
            EntityRecord::new(5, c("point")).with_name("a"),
            EntityRecord::new(6, c("vector")).with_head(5).with_value("3"),
            EntityRecord::new(7, c("point")).with_name("b"),
            EntityRecord::new(8, c("vector")).with_head(7),
        ]
    }

    fn number(session: &Session, entity: u64, path: &str) -> Option<f64> {
        session
            .field(e(entity), path)
            .and_then(|f| f.value)
            .and_then(|v| v.as_number())
    }

    /// A component scales its direction into its head's delta.
    #[test]
    fn component_accumulates_into_vector_delta() {
        let mut s = session(|c| {
            vec![
                EntityRecord::new(1, c("direction")).with_value("0"),
                EntityRecord::new(2, c("vector")),
                EntityRecord::new(3, c("component")).with_head(2).with_reference(1).with_value("5"),
            ]
        });
        let trees = s.visualize();
        assert_eq!(number(&s, 1, "visual.delta.x"), Some(1.0));
        assert_eq!(number(&s, 2, "visual.delta.x"), Some(5.0));
        assert_eq!(number(&s, 2, "visual.delta.y"), Some(0.0));
        assert_eq!(trees[&e(2)]["delta"]["x"], serde_json::json!(5.0));
        assert!(s.field(e(2), "visual.delta.x").unwrap().locked);
    }

    /// Two single-vector maps merge into one satisfied map; the same union
    /// is never merged again.
    #[test]
    fn disjoint_maps_merge_once() {
        let mut s = session(vectors);
        let stats = s.evaluate(&EvaluateOptions::default());
        assert_eq!(stats.maps_satisfied, 1);
        assert_eq!(stats.nodes_appended, 1);
        assert_eq!(stats.commands_inferred, 1);

        let map = s.matcher().satisfied().next().unwrap().clone();
        for (entity, node) in [(5, 1001), (6, 1002), (7, 1003), (8, 1004)] {
            assert_eq!(map.entity_for(LawNodeId::new(node)), Some(e(entity)));
            assert_eq!(map.node_for(e(entity)), Some(LawNodeId::new(node)));
        }
        assert!(map.is_injective());

        let again = s.evaluate(&EvaluateOptions::default());
        assert_eq!(again.maps_satisfied, 0);
        assert_eq!(s.matcher().satisfied().count(), 1);
    }

    /// Re-deriving a satisfied law reuses the conclusion already present.
    #[test]
    fn appending_is_idempotent() {
        let mut s = session(vectors);
        s.evaluate(&EvaluateOptions::default());
        let before = s.relation().len();

        let reset = EvaluateOptions {
            reset: true,
            ..EvaluateOptions::default()
        };
        let stats = s.evaluate(&reset);
        assert_eq!(stats.maps_satisfied, 1);
        assert_eq!(stats.nodes_appended, 0);
        assert_eq!(s.relation().len(), before);
        assert_eq!(s.inferred_commands().count(), 1);
    }

    #[test]
    fn suggestions_stay_hidden_until_accepted() {
        let mut s = session(vectors);
        let suggestions = s.suggest();
        assert_eq!(suggestions.len(), 1);
        let suggestion = &suggestions[0];
        assert_eq!(suggestion.law, "vectors span a segment");
        assert_eq!(suggestion.symbols.len(), 1);
        assert!(suggestion.symbols[0].contains("&#x2192;"));

        let segment = s.matcher().get(suggestion.map).unwrap().conclusions()[0];
        assert!(s.relation().get(segment).unwrap().is_tentative());
        assert!(!s.relation().deep_nodes().contains(&segment));
        // Tentative structure does not take part in matching.
        assert_eq!(s.evaluate(&EvaluateOptions::suggest()).nodes_checked, 0);

        s.accept_suggestion(suggestion.map).unwrap();
        let accepted = s.relation().get(segment).unwrap();
        assert!(!accepted.is_tentative());
        assert!(accepted.deep);
        assert!(s.suggestions().is_empty());
        assert!(s.symbol(segment).unwrap().starts_with("<mover>"));
    }

    /// `text`, then `subscript`, then `superscript`.
    #[test]
    fn symbol_parts_nest_in_fixed_order() {
        let mut def = sample_catalog().def().clone();
        if let Some(point) = def.concepts.iter_mut().find(|c| c.name == "point") {
            point.commands.insert(
                "symbol".to_string(),
                vec![
                    "symbol.superscript = '2'".to_string(),
                    "symbol.subscript = '1'".to_string(),
                ],
            );
        }
        let catalog = Catalog::new(def).unwrap();
        let point = catalog.concept_by_name("point").unwrap().id;
        let mut s = Session::from_records(
            catalog,
            EngineConfig::default(),
            vec![EntityRecord::new(1, point).with_name("x")],
        )
        .unwrap();
        assert_eq!(
            s.symbolize()[&e(1)],
            "<msup><msub><mrow><mi>x</mi></mrow><mrow>1</mrow></msub><mrow>2</mrow></msup>"
        );
    }
}
