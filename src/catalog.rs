//! The concept/law catalog.
//!
//! Concepts carry command templates per attribute type and an optional
//! default symbol. Laws are small trees of typed nodes; some of them form
//! predicate sets (alternative AND-groups that must all be matched), the
//! remaining leaves are conclusions appended once a predicate set matches.
//!
//! A [`Catalog`] is validated once when built and is immutable afterwards.
//! Its [`fingerprint`](Catalog::fingerprint) identifies the content.

use crate::core::Side;
use crate::error::CatalogError;
use crate::fingerprint::{HashValue, DOMAIN_CATALOG};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

macro_rules! catalog_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[repr(transparent)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            #[inline]
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

catalog_id!(
    /// Identifier of a concept.
    ConceptId
);
catalog_id!(
    /// Identifier of a law.
    LawId
);
catalog_id!(
    /// Identifier of a law node; unique across the catalog.
    LawNodeId
);

/// A typed category of entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub id: ConceptId,
    pub name: String,
    #[serde(default)]
    pub parents: Vec<ConceptId>,
    /// Command templates keyed by attribute type (`symbol`, `visual`, ...).
    #[serde(default)]
    pub commands: BTreeMap<String, Vec<String>>,
    /// Default markup used when an entity has neither name nor value.
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub symmetric: bool,
}

/// A node of a law template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LawNode {
    pub id: LawNodeId,
    pub concept: ConceptId,
    #[serde(default)]
    pub head: Option<LawNodeId>,
    #[serde(default)]
    pub reference: Option<LawNodeId>,
    /// Constraint on the matched entity's value; empty accepts anything.
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub name: Option<String>,
    /// Present on data nodes: a command asserted on the head's entity.
    #[serde(default)]
    pub formula: Option<String>,
}

impl LawNode {
    #[inline]
    pub fn parent(&self, side: Side) -> Option<LawNodeId> {
        match side {
            Side::Head => self.head,
            Side::Reference => self.reference,
        }
    }

    #[inline]
    pub fn is_data(&self) -> bool {
        self.formula.is_some()
    }
}

/// A stored law.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Law {
    pub id: LawId,
    pub name: String,
    pub nodes: Vec<LawNode>,
    /// Alternative satisfying sets; each must be closed under parents.
    pub predicate_sets: Vec<BTreeSet<LawNodeId>>,
    /// Conclusion anchors. Empty means every leaf outside the predicates.
    #[serde(default)]
    pub deep_nodes: Vec<LawNodeId>,
}

/// Serializable catalog content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogDef {
    #[serde(default)]
    pub concepts: Vec<Concept>,
    #[serde(default)]
    pub laws: Vec<Law>,
}

/// Derived per-law lookup tables.
#[derive(Debug, Clone, Default)]
struct LawIndex {
    nodes: BTreeMap<LawNodeId, usize>,
    predicates: BTreeSet<LawNodeId>,
    deep_predicates: Vec<LawNodeId>,
    conclusions: Vec<LawNodeId>,
}

/// A validated, immutable catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    def: CatalogDef,
    concepts: BTreeMap<ConceptId, usize>,
    by_name: BTreeMap<String, ConceptId>,
    /// Reflexive ancestor list per concept, ancestors first.
    lineage: BTreeMap<ConceptId, Vec<ConceptId>>,
    laws: BTreeMap<LawId, usize>,
    law_index: BTreeMap<LawId, LawIndex>,
    fingerprint: HashValue,
}

impl Catalog {
    /// Validates `def` and builds the lookup tables.
    pub fn new(def: CatalogDef) -> Result<Self, CatalogError> {
        let mut concepts = BTreeMap::new();
        let mut by_name = BTreeMap::new();
        for (i, concept) in def.concepts.iter().enumerate() {
            if concepts.insert(concept.id, i).is_some() {
                return Err(CatalogError::DuplicateConcept(concept.id));
            }
            by_name.entry(concept.name.clone()).or_insert(concept.id);
        }
        for concept in &def.concepts {
            for parent in &concept.parents {
                if !concepts.contains_key(parent) {
                    return Err(CatalogError::UnknownParentConcept {
                        concept: concept.id,
                        parent: *parent,
                    });
                }
            }
        }

        let mut lineage = BTreeMap::new();
        for concept in &def.concepts {
            let mut order = Vec::new();
            let mut seen = BTreeSet::new();
            let mut on_path = BTreeSet::new();
            collect_lineage(&def, &concepts, concept.id, &mut seen, &mut on_path, &mut order)?;
            lineage.insert(concept.id, order);
        }

        let mut laws = BTreeMap::new();
        let mut law_index = BTreeMap::new();
        let mut all_nodes = BTreeSet::new();
        for (i, law) in def.laws.iter().enumerate() {
            if laws.insert(law.id, i).is_some() {
                return Err(CatalogError::DuplicateLaw(law.id));
            }
            for node in &law.nodes {
                if !all_nodes.insert(node.id) {
                    return Err(CatalogError::DuplicateNode(node.id));
                }
            }
            law_index.insert(law.id, index_law(law, &concepts)?);
        }

        let bytes = serde_cbor::to_vec(&def).map_err(|e| CatalogError::Encode(e.to_string()))?;
        let fingerprint = HashValue::hash_with_domain(DOMAIN_CATALOG, &bytes);
        Ok(Self {
            def,
            concepts,
            by_name,
            lineage,
            laws,
            law_index,
            fingerprint,
        })
    }

    /// Parses and validates a JSON catalog.
    pub fn from_json(src: &str) -> Result<Self, CatalogError> {
        let def: CatalogDef =
            serde_json::from_str(src).map_err(|e| CatalogError::Decode(e.to_string()))?;
        Self::new(def)
    }

    /// Decodes and validates a CBOR catalog.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, CatalogError> {
        let def: CatalogDef =
            serde_cbor::from_slice(bytes).map_err(|e| CatalogError::Decode(e.to_string()))?;
        Self::new(def)
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, CatalogError> {
        serde_cbor::to_vec(&self.def).map_err(|e| CatalogError::Encode(e.to_string()))
    }

    #[inline]
    pub fn def(&self) -> &CatalogDef {
        &self.def
    }

    #[inline]
    pub fn fingerprint(&self) -> HashValue {
        self.fingerprint
    }

    pub fn concept(&self, id: ConceptId) -> Option<&Concept> {
        self.concepts.get(&id).map(|&i| &self.def.concepts[i])
    }

    pub fn concept_by_name(&self, name: &str) -> Option<&Concept> {
        self.by_name.get(name).and_then(|id| self.concept(*id))
    }

    pub fn concepts(&self) -> impl Iterator<Item = &Concept> {
        self.def.concepts.iter()
    }

    /// `a` is `b` or inherits from it.
    pub fn instance_of(&self, a: ConceptId, b: ConceptId) -> bool {
        self.lineage.get(&a).map_or(false, |l| l.contains(&b))
    }

    /// `instance_of` against a concept name.
    pub fn instance_of_name(&self, a: ConceptId, name: &str) -> bool {
        self.by_name
            .get(name)
            .map_or(false, |b| self.instance_of(a, *b))
    }

    /// Ancestors first, `id` last.
    pub fn lineage(&self, id: ConceptId) -> &[ConceptId] {
        self.lineage.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Command templates for `attribute`, inherited ones first.
    pub fn commands_for(&self, id: ConceptId, attribute: &str) -> Vec<&str> {
        self.lineage(id)
            .iter()
            .filter_map(|c| self.concept(*c))
            .filter_map(|c| c.commands.get(attribute))
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Index of the first precedence group naming the concept or one of its
    /// ancestors.
    pub fn precedence_index(&self, id: ConceptId, groups: &[Vec<String>]) -> Option<usize> {
        let names: Vec<&str> = self
            .lineage(id)
            .iter()
            .filter_map(|c| self.concept(*c))
            .map(|c| c.name.as_str())
            .collect();
        groups
            .iter()
            .position(|group| group.iter().any(|g| names.contains(&g.as_str())))
    }

    pub fn law(&self, id: LawId) -> Option<&Law> {
        self.laws.get(&id).map(|&i| &self.def.laws[i])
    }

    pub fn laws(&self) -> impl Iterator<Item = &Law> {
        self.def.laws.iter()
    }

    pub fn law_node(&self, law: LawId, node: LawNodeId) -> Option<&LawNode> {
        let index = self.law_index.get(&law)?.nodes.get(&node)?;
        self.law(law).map(|l| &l.nodes[*index])
    }

    pub fn is_predicate(&self, law: LawId, node: LawNodeId) -> bool {
        self.law_index
            .get(&law)
            .map_or(false, |i| i.predicates.contains(&node))
    }

    /// Predicate nodes with no predicate children; matching is seeded here.
    pub fn deep_predicates(&self, law: LawId) -> &[LawNodeId] {
        self.law_index
            .get(&law)
            .map(|i| i.deep_predicates.as_slice())
            .unwrap_or(&[])
    }

    /// Conclusion anchors appended on satisfaction.
    pub fn conclusions(&self, law: LawId) -> &[LawNodeId] {
        self.law_index
            .get(&law)
            .map(|i| i.conclusions.as_slice())
            .unwrap_or(&[])
    }
}

fn collect_lineage(
    def: &CatalogDef,
    index: &BTreeMap<ConceptId, usize>,
    id: ConceptId,
    seen: &mut BTreeSet<ConceptId>,
    on_path: &mut BTreeSet<ConceptId>,
    order: &mut Vec<ConceptId>,
) -> Result<(), CatalogError> {
    if seen.contains(&id) {
        return Ok(());
    }
    if !on_path.insert(id) {
        return Err(CatalogError::ConceptCycle(id));
    }
    if let Some(&i) = index.get(&id) {
        for parent in &def.concepts[i].parents {
            collect_lineage(def, index, *parent, seen, on_path, order)?;
        }
    }
    on_path.remove(&id);
    seen.insert(id);
    order.push(id);
    Ok(())
}

fn index_law(law: &Law, concepts: &BTreeMap<ConceptId, usize>) -> Result<LawIndex, CatalogError> {
    let name = || law.name.clone();
    let mut index = LawIndex::default();
    for (i, node) in law.nodes.iter().enumerate() {
        index.nodes.insert(node.id, i);
    }
    let node = |id: &LawNodeId| index.nodes.get(id).map(|&i| &law.nodes[i]);

    for n in &law.nodes {
        if !concepts.contains_key(&n.concept) {
            return Err(CatalogError::UnknownConcept {
                law: name(),
                node: n.id,
                concept: n.concept,
            });
        }
        for side in Side::BOTH {
            if let Some(target) = n.parent(side) {
                if node(&target).is_none() {
                    return Err(CatalogError::DanglingLink {
                        law: name(),
                        node: n.id,
                        target,
                    });
                }
            }
        }
        if n.is_data() && n.head.is_none() {
            return Err(CatalogError::DataNodeWithoutHead {
                law: name(),
                node: n.id,
            });
        }
    }

    // Each walk up the head/reference links must terminate.
    for n in &law.nodes {
        let mut stack = vec![(n.id, 0usize)];
        while let Some((current, depth)) = stack.pop() {
            if depth > law.nodes.len() {
                return Err(CatalogError::LawCycle {
                    law: name(),
                    node: n.id,
                });
            }
            if let Some(cur) = node(&current) {
                for parent in [cur.head, cur.reference].into_iter().flatten() {
                    stack.push((parent, depth + 1));
                }
            }
        }
    }

    if law.predicate_sets.is_empty() {
        return Err(CatalogError::NoPredicateSets { law: name() });
    }
    for (i, set) in law.predicate_sets.iter().enumerate() {
        if set.is_empty() {
            return Err(CatalogError::EmptyPredicateSet { law: name(), index: i });
        }
        for id in set {
            let Some(member) = node(id) else {
                return Err(CatalogError::UnknownPredicate {
                    law: name(),
                    index: i,
                    node: *id,
                });
            };
            if member.is_data() {
                return Err(CatalogError::DataNodePredicate {
                    law: name(),
                    node: *id,
                });
            }
            for parent in [member.head, member.reference].into_iter().flatten() {
                if !set.contains(&parent) {
                    return Err(CatalogError::OpenPredicateSet {
                        law: name(),
                        index: i,
                        node: *id,
                        parent,
                    });
                }
            }
        }
        if let Some(first) = law.predicate_sets[..i].iter().position(|s| s == set) {
            return Err(CatalogError::DuplicatePredicateSet {
                law: name(),
                first,
                second: i,
            });
        }
        index.predicates.extend(set.iter().copied());
    }

    let mut has_child = BTreeSet::new();
    let mut has_predicate_child = BTreeSet::new();
    for n in &law.nodes {
        for parent in [n.head, n.reference].into_iter().flatten() {
            has_child.insert(parent);
            if index.predicates.contains(&n.id) {
                has_predicate_child.insert(parent);
            }
        }
    }
    index.deep_predicates = index
        .predicates
        .iter()
        .copied()
        .filter(|p| !has_predicate_child.contains(p))
        .collect();

    if law.deep_nodes.is_empty() {
        index.conclusions = law
            .nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| !index.predicates.contains(id) && !has_child.contains(id))
            .collect();
    } else {
        for id in &law.deep_nodes {
            if node(id).is_none() {
                return Err(CatalogError::UnknownDeepNode {
                    law: name(),
                    node: *id,
                });
            }
        }
        index.conclusions = law
            .deep_nodes
            .iter()
            .copied()
            .filter(|id| !index.predicates.contains(id))
            .collect();
    }
    Ok(index)
}
