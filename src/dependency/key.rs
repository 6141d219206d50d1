//! Key paths and per-key bookkeeping.

use crate::arena::DepId;
use crate::value::Datum;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Dot separated path of a key relative to its dependency root.
///
/// The empty path is the root. Ordering is lexicographic by segment, which
/// keeps every sub-tree contiguous inside a `BTreeMap<KeyPath, _>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    #[inline]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parses `a.b.c`; empty segments are ignored.
    pub fn parse(src: &str) -> Self {
        Self(
            src.split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    #[inline]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// The closest ancestor, or `None` for the root.
    pub fn parent(&self) -> Option<KeyPath> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn child(&self, segment: impl Into<String>) -> KeyPath {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn join(&self, suffix: &KeyPath) -> KeyPath {
        let mut segments = self.0.clone();
        segments.extend(suffix.0.iter().cloned());
        Self(segments)
    }

    pub fn starts_with(&self, prefix: &KeyPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// `self` relative to `prefix`, if `prefix` is an ancestor (or equal).
    pub fn strip_prefix(&self, prefix: &KeyPath) -> Option<KeyPath> {
        self.0
            .strip_prefix(prefix.0.as_slice())
            .map(|rest| Self(rest.to_vec()))
    }

    /// `self` followed by each of its ancestors, root last.
    pub fn ancestry(&self) -> impl Iterator<Item = KeyPath> + '_ {
        (0..=self.0.len()).rev().map(move |n| Self(self.0[..n].to_vec()))
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for KeyPath {
    fn from(src: &str) -> Self {
        KeyPath::parse(src)
    }
}

/// A `(dependency, key)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRef {
    pub dep: DepId,
    pub key: KeyPath,
}

impl KeyRef {
    #[inline]
    pub fn new(dep: DepId, key: impl Into<KeyPath>) -> Self {
        Self {
            dep,
            key: key.into(),
        }
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dep, self.key)
    }
}

/// Action run once when a wait edge is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    /// The waiting command's `$variable` target has been bound.
    BindTarget,
    /// Expression block `n` of the waiting command reads a variable that
    /// has been bound.
    BindBlock(usize),
}

/// One entry of a key's wait set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitEdge {
    pub satisfied: bool,
    pub callback: Option<Callback>,
}

/// Metadata of a single key.
#[derive(Debug, Clone, Default)]
pub struct KeyMeta {
    pub(crate) value: Option<Datum>,
    pub(crate) previous_value: Option<Datum>,
    pub(crate) locked: bool,
    pub(crate) active: bool,
    pub(crate) known: bool,
    pub(crate) propagated: bool,
    pub(crate) blocked: bool,
    pub(crate) waiting: BTreeMap<KeyRef, WaitEdge>,
    pub(crate) triggers: BTreeSet<KeyRef>,
}

impl KeyMeta {
    #[inline]
    pub fn value(&self) -> Option<&Datum> {
        self.value.as_ref()
    }

    #[inline]
    pub fn previous_value(&self) -> Option<&Datum> {
        self.previous_value.as_ref()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[inline]
    pub fn is_known(&self) -> bool {
        self.known
    }

    #[inline]
    pub fn is_propagated(&self) -> bool {
        self.propagated
    }

    /// Sources this key still waits on.
    pub fn pending(&self) -> impl Iterator<Item = &KeyRef> {
        self.waiting
            .iter()
            .filter(|(_, edge)| !edge.satisfied)
            .map(|(source, _)| source)
    }

    pub fn waiting(&self) -> impl Iterator<Item = (&KeyRef, &WaitEdge)> {
        self.waiting.iter()
    }

    pub fn triggers(&self) -> impl Iterator<Item = &KeyRef> {
        self.triggers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn subtrees_are_contiguous() {
        let mut map = BTreeMap::new();
        for p in ["visual", "visual.origin", "visual.origin.x", "visual0", "visual.a", "value"] {
            map.insert(KeyPath::parse(p), ());
        }
        let prefix = KeyPath::parse("visual");
        let sub: Vec<String> = map
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(sub, vec!["visual", "visual.a", "visual.origin", "visual.origin.x"]);
    }

    #[test]
    fn ancestry_walks_to_root() {
        let path = KeyPath::parse("visual.origin.x");
        let chain: Vec<String> = path.ancestry().map(|p| p.to_string()).collect();
        assert_eq!(chain, vec!["visual.origin.x", "visual.origin", "visual", ""]);
        assert_eq!(
            path.strip_prefix(&KeyPath::parse("visual")),
            Some(KeyPath::parse("origin.x"))
        );
        assert_eq!(path.strip_prefix(&KeyPath::parse("value")), None);
    }
}
