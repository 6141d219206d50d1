//! Error types.
//!
//! Only structural problems surface as errors: a catalog that cannot be
//! valid, an edit that would break the relation, a request naming a map
//! that does not exist. Compile and resolution failures inside a pass are
//! absorbed where they happen and only logged.

use crate::catalog::{ConceptId, LawId, LawNodeId};
use crate::core::EntityId;
use crate::dependency::KeyPath;
use crate::matching::MapId;
use thiserror::Error;

/// A concept/law catalog that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("duplicate concept id {0}")]
    DuplicateConcept(ConceptId),
    #[error("concept {concept} inherits from unknown concept {parent}")]
    UnknownParentConcept { concept: ConceptId, parent: ConceptId },
    #[error("concept inheritance cycle through {0}")]
    ConceptCycle(ConceptId),
    #[error("duplicate law id {0}")]
    DuplicateLaw(LawId),
    #[error("duplicate law node id {0}")]
    DuplicateNode(LawNodeId),
    #[error("law `{law}`: node {node} uses unknown concept {concept}")]
    UnknownConcept {
        law: String,
        node: LawNodeId,
        concept: ConceptId,
    },
    #[error("law `{law}`: node {node} links to {target}, which is not a node of the law")]
    DanglingLink {
        law: String,
        node: LawNodeId,
        target: LawNodeId,
    },
    #[error("law `{law}`: head/reference cycle through node {node}")]
    LawCycle { law: String, node: LawNodeId },
    #[error("law `{law}` declares no predicate sets")]
    NoPredicateSets { law: String },
    #[error("law `{law}`: predicate set {index} is empty")]
    EmptyPredicateSet { law: String, index: usize },
    #[error("law `{law}`: predicate set {index} names {node}, which is not a node of the law")]
    UnknownPredicate {
        law: String,
        index: usize,
        node: LawNodeId,
    },
    #[error("law `{law}`: data node {node} cannot take part in a predicate")]
    DataNodePredicate { law: String, node: LawNodeId },
    #[error("law `{law}`: data node {node} has no head to attach its formula to")]
    DataNodeWithoutHead { law: String, node: LawNodeId },
    #[error("law `{law}`: predicate sets {first} and {second} are identical")]
    DuplicatePredicateSet {
        law: String,
        first: usize,
        second: usize,
    },
    #[error("law `{law}`: predicate set {index} contains {node} but not its parent {parent}")]
    OpenPredicateSet {
        law: String,
        index: usize,
        node: LawNodeId,
        parent: LawNodeId,
    },
    #[error("law `{law}`: deep node {node} is not a node of the law")]
    UnknownDeepNode { law: String, node: LawNodeId },
    #[error("catalog decode failed: {0}")]
    Decode(String),
    #[error("catalog encode failed: {0}")]
    Encode(String),
}

/// An edit that would leave the active relation inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelationError {
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),
    #[error("entity {0} already exists")]
    DuplicateEntity(EntityId),
    #[error("entity {entity} uses unknown concept {concept}")]
    UnknownConcept { entity: EntityId, concept: ConceptId },
    #[error("entity {entity} links to unknown parent {parent}")]
    UnknownParent { entity: EntityId, parent: EntityId },
    #[error("linking entity {entity} would create a head/reference cycle")]
    Cycle { entity: EntityId },
}

/// A rejected field edit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("no data tree for entity {0}; run a propagation pass first")]
    UnknownEntity(EntityId),
    #[error("field `{path}` of entity {entity} is derived and cannot be edited")]
    Locked { entity: EntityId, path: KeyPath },
}

/// Errors surfaced by the session driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("unknown map {0}")]
    UnknownMap(MapId),
    #[error("map {0} is not satisfied")]
    NotSatisfied(MapId),
    #[error(transparent)]
    Relation(#[from] RelationError),
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}
