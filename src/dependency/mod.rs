//! Generic propagation trees with cross-tree wait/trigger edges.
//!
//! A [`Dependency`] is a tree of keys addressed by [`KeyPath`]. A key may
//! *wait* on keys of other dependencies; the waited-on key records the
//! inverse edge as a *trigger*. When a key and its whole sub-tree have every
//! wait edge satisfied, it *resolves*: the owner's resolution hook runs, the
//! key is marked propagated and each trigger is notified exactly once.
//!
//! The concrete behaviour of a tree (entity data, variable tables, compiled
//! commands) is selected by its [`DepKind`]; the wait/resolve/propagate
//! algorithm is shared.
//!
//! # Invariants
//! - A key's value is only read downstream after the key is propagated.
//! - A key propagates only when every wait edge in its sub-tree is satisfied,
//!   or when it has been marked known.
//! - `wait` with identical arguments registers one edge; `resolve` runs an
//!   edge's callback at most once; `propagate` notifies each trigger once.
//! - Only active keys resolve.
//!
//! # Determinism
//! Keys, wait sets and triggers are ordered maps and the cascade queue is
//! FIFO, so the same sequence of calls yields the same resolution order.

pub mod key;
pub mod worklist;

pub use key::{Callback, KeyMeta, KeyPath, KeyRef, WaitEdge};
pub use worklist::{CascadeQueue, Event};

use crate::arena::{DepArena, DepId};
use crate::command::CommandState;
use crate::core::EntityId;
use crate::data::{DataState, VariableTable};
use crate::symbol::SYMBOL_KEY;
use crate::value::Datum;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};

/// Behaviour attached to a dependency tree.
#[derive(Debug, Clone)]
pub enum DepKind {
    /// The data tree of one entity.
    Data(DataState),
    /// Per-entity table of `$variables`.
    Variables(VariableTable),
    /// One compiled command instance.
    Command(Box<CommandState>),
    /// A tree without a resolution hook.
    Plain,
}

/// A propagation tree.
#[derive(Debug, Clone)]
pub struct Dependency {
    kind: DepKind,
    keys: BTreeMap<KeyPath, KeyMeta>,
}

impl Dependency {
    fn new(kind: DepKind) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(KeyPath::root(), KeyMeta::default());
        Self { kind, keys }
    }

    #[inline]
    pub fn kind(&self) -> &DepKind {
        &self.kind
    }

    #[inline]
    pub(crate) fn kind_mut(&mut self) -> &mut DepKind {
        &mut self.kind
    }

    /// Metadata of `path`, if the key exists.
    #[inline]
    pub fn key(&self, path: &KeyPath) -> Option<&KeyMeta> {
        self.keys.get(path)
    }

    #[inline]
    pub(crate) fn key_mut(&mut self, path: &KeyPath) -> Option<&mut KeyMeta> {
        self.keys.get_mut(path)
    }

    /// Returns the key, creating it and any missing ancestors.
    ///
    /// New keys inherit the active flag of their closest existing ancestor.
    pub(crate) fn ensure_key(&mut self, path: &KeyPath) -> &mut KeyMeta {
        if !self.keys.contains_key(path) {
            let mut missing: Vec<KeyPath> = Vec::new();
            let mut active = false;
            for ancestor in path.ancestry() {
                match self.keys.get(&ancestor) {
                    Some(meta) => {
                        active = meta.active;
                        break;
                    }
                    None => missing.push(ancestor),
                }
            }
            for p in missing.into_iter().rev() {
                self.keys.insert(
                    p,
                    KeyMeta {
                        active,
                        ..KeyMeta::default()
                    },
                );
            }
        }
        self.keys.entry(path.clone()).or_default()
    }

    /// Keys strictly below `path`, in order.
    pub fn descendants<'a>(
        &'a self,
        path: &'a KeyPath,
    ) -> impl Iterator<Item = (&'a KeyPath, &'a KeyMeta)> + 'a {
        self.keys
            .range(path.clone()..)
            .skip_while(move |(k, _)| *k == path)
            .take_while(move |(k, _)| k.starts_with(path))
    }

    /// `path` followed by its descendants.
    pub fn subtree_paths(&self, path: &KeyPath) -> Vec<KeyPath> {
        self.keys
            .range(path.clone()..)
            .take_while(|(k, _)| k.starts_with(path))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Direct children of `path`.
    pub fn children(&self, path: &KeyPath) -> Vec<KeyPath> {
        self.descendants(path)
            .filter(|(k, _)| k.len() == path.len() + 1)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Removes a single key. The root is never removed.
    pub(crate) fn remove_key(&mut self, path: &KeyPath) -> Option<KeyMeta> {
        if path.is_root() {
            return None;
        }
        self.keys.remove(path)
    }

    /// Unsatisfied wait edges of `path` and its sub-tree, as
    /// `(waiting key, source)` pairs. Sub-trees below a known key are
    /// skipped. Returns `None` if the sub-tree contains a blocked key.
    fn pending_in_subtree(&self, path: &KeyPath) -> Option<Vec<(KeyPath, KeyRef)>> {
        let mut pending = Vec::new();
        let mut skip: Option<&KeyPath> = None;
        for (k, meta) in self.keys.range(path.clone()..) {
            if !k.starts_with(path) {
                break;
            }
            if let Some(prefix) = skip {
                if k.starts_with(prefix) {
                    continue;
                }
                skip = None;
            }
            if k != path && meta.known {
                skip = Some(k);
                continue;
            }
            if meta.blocked {
                return None;
            }
            pending.extend(meta.pending().map(|source| (k.clone(), source.clone())));
        }
        Some(pending)
    }
}

/// Longest chain of sources an on-demand check follows before giving up.
pub const MAX_CHECK_DEPTH: usize = 256;

/// Counters for one dependency graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeStats {
    pub events: u64,
    pub callbacks_run: u64,
    pub keys_propagated: u64,
    pub commands_executed: u64,
}

/// Session-owned registry of live dependency trees.
#[derive(Debug)]
pub struct DependencyGraph {
    deps: DepArena<Dependency>,
    queue: CascadeQueue,
    draining: bool,
    max_steps: usize,
    stats: CascadeStats,
    dirty_entities: BTreeSet<EntityId>,
}

impl DependencyGraph {
    /// Creates an empty graph whose cascade drains at most `max_steps`
    /// events per entry point.
    pub fn new(max_steps: usize) -> Self {
        Self {
            deps: DepArena::new(),
            queue: CascadeQueue::new(),
            draining: false,
            max_steps,
            stats: CascadeStats::default(),
            dirty_entities: BTreeSet::new(),
        }
    }

    /// Allocates a dependency of the given kind with an empty root key.
    pub fn create(&mut self, kind: DepKind) -> DepId {
        self.deps.allocate(Dependency::new(kind))
    }

    /// Drops a dependency. Edges other trees hold towards it become inert.
    pub fn remove(&mut self, id: DepId) -> Option<Dependency> {
        self.deps.deallocate(id)
    }

    /// Drops every dependency and pending event.
    pub fn clear(&mut self) {
        self.deps.clear();
        self.queue.clear();
        self.stats = CascadeStats::default();
    }

    #[inline]
    pub fn get(&self, id: DepId) -> Option<&Dependency> {
        self.deps.get(id)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: DepId) -> Option<&mut Dependency> {
        self.deps.get_mut(id)
    }

    pub fn ids(&self) -> Vec<DepId> {
        self.deps.ids()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.deps.live_count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.deps.live_count() == 0
    }

    #[inline]
    pub fn stats(&self) -> CascadeStats {
        self.stats
    }

    /// Looks a key up. With `create`, the key (and its ancestors) is created
    /// when missing. Unknown dependencies yield `None`.
    pub fn get_key(&mut self, key: &KeyRef, create: bool) -> Option<&KeyMeta> {
        let dep = self.deps.get_mut(key.dep)?;
        if create {
            Some(&*dep.ensure_key(&key.key))
        } else {
            dep.key(&key.key)
        }
    }

    /// Read-only lookup.
    #[inline]
    pub fn key(&self, key: &KeyRef) -> Option<&KeyMeta> {
        self.deps.get(key.dep)?.key(&key.key)
    }

    /// Current value of a key.
    #[inline]
    pub fn value(&self, key: &KeyRef) -> Option<&Datum> {
        self.key(key)?.value()
    }

    /// Entities whose `concept.*` data changed since the last call.
    pub fn take_dirty_entities(&mut self) -> BTreeSet<EntityId> {
        std::mem::take(&mut self.dirty_entities)
    }

    pub(crate) fn mark_entity_dirty(&mut self, entity: EntityId) {
        self.dirty_entities.insert(entity);
    }

    // ------------------------------------------------------------------
    // Wait / resolve
    // ------------------------------------------------------------------

    /// Registers that `waiter` cannot resolve until `source` propagates.
    ///
    /// Returns `false` when the edge already existed (the call is then a
    /// no-op) or either dependency is gone. An active waiter activates the
    /// source; an already propagated source resolves the edge immediately.
    pub fn wait(&mut self, waiter: &KeyRef, source: &KeyRef, callback: Option<Callback>) -> bool {
        let added = self.wait_inner(waiter, source, callback);
        self.drain();
        added
    }

    /// `wait` without draining; for use from resolution hooks and callbacks.
    pub(crate) fn wait_inner(
        &mut self,
        waiter: &KeyRef,
        source: &KeyRef,
        callback: Option<Callback>,
    ) -> bool {
        if !self.deps.contains(waiter.dep) || !self.deps.contains(source.dep) {
            return false;
        }
        let waiter_active = {
            let Some(dep) = self.deps.get_mut(waiter.dep) else {
                return false;
            };
            let under_active = waiter
                .key
                .parent()
                .and_then(|p| dep.key(&p))
                .map_or(false, |m| m.active);
            let meta = dep.ensure_key(&waiter.key);
            // Sub-keys created under a live key are live too.
            meta.active |= under_active;
            if meta.waiting.contains_key(source) {
                return false;
            }
            if meta.propagated {
                trace!(waiter = %waiter, source = %source, "wait registered on propagated key");
            }
            meta.waiting.insert(
                source.clone(),
                WaitEdge {
                    satisfied: false,
                    callback,
                },
            );
            meta.active
        };
        let source_propagated = match self.deps.get_mut(source.dep) {
            Some(dep) => {
                let meta = dep.ensure_key(&source.key);
                meta.triggers.insert(waiter.clone());
                meta.propagated
            }
            None => false,
        };
        if waiter_active {
            self.activate_from(source);
        }
        if source_propagated {
            self.queue.push_resolve(waiter.clone(), source.clone());
        }
        true
    }

    /// Satisfies the edge `waiter -> source`, running its callback once, and
    /// re-checks `waiter`. Returns `false` if the edge was unknown or had
    /// already been satisfied.
    pub fn resolve(&mut self, waiter: &KeyRef, source: &KeyRef) -> bool {
        let newly = self.resolve_edge(waiter, source);
        self.drain();
        newly
    }

    fn resolve_edge(&mut self, waiter: &KeyRef, source: &KeyRef) -> bool {
        if !self.satisfy(waiter, source) {
            return false;
        }
        let mut visiting = BTreeSet::new();
        self.check_inner(waiter, false, &mut visiting);
        true
    }

    /// Marks one edge satisfied and runs its callback. No re-check.
    fn satisfy(&mut self, waiter: &KeyRef, source: &KeyRef) -> bool {
        let callback = {
            let Some(edge) = self
                .deps
                .get_mut(waiter.dep)
                .and_then(|dep| dep.key_mut(&waiter.key))
                .and_then(|meta| meta.waiting.get_mut(source))
            else {
                return false;
            };
            if edge.satisfied {
                return false;
            }
            edge.satisfied = true;
            edge.callback.take()
        };
        if let Some(callback) = callback {
            self.stats.callbacks_run += 1;
            self.run_callback(waiter, source, callback);
        }
        true
    }

    fn run_callback(&mut self, waiter: &KeyRef, source: &KeyRef, callback: Callback) {
        let is_command = matches!(
            self.deps.get(waiter.dep).map(Dependency::kind),
            Some(DepKind::Command(_))
        );
        if is_command {
            self.bind_command_variable(waiter.dep, source, callback);
        } else {
            trace!(waiter = %waiter, ?callback, "callback on non-command dependency ignored");
        }
    }

    /// Resolves `key` if its whole sub-tree is satisfied.
    ///
    /// With `probe`, unsatisfied edges are verified by checking their sources
    /// on demand instead of waiting for propagation events. On success the
    /// resolution hook runs, the key propagates, and the closest ancestor is
    /// checked in turn.
    pub fn check_resolved(&mut self, key: &KeyRef, probe: bool) -> bool {
        let mut visiting = BTreeSet::new();
        let resolved = self.check_inner(key, probe, &mut visiting);
        self.drain();
        resolved
    }

    /// `visiting` holds the keys on the current on-demand check path.
    fn check_inner(&mut self, key: &KeyRef, probe: bool, visiting: &mut BTreeSet<KeyRef>) -> bool {
        let mut entered = false;
        let resolved = self.check_step(key, probe, visiting, &mut entered);
        if entered {
            visiting.remove(key);
        }
        resolved
    }

    fn check_step(
        &mut self,
        key: &KeyRef,
        probe: bool,
        visiting: &mut BTreeSet<KeyRef>,
        entered: &mut bool,
    ) -> bool {
        loop {
            let Some(dep) = self.deps.get(key.dep) else {
                return false;
            };
            let Some(meta) = dep.key(&key.key) else {
                return false;
            };
            if meta.propagated {
                return true;
            }
            if !meta.active || meta.blocked {
                return false;
            }
            if meta.known {
                break;
            }
            // A variable resolves only once `bind_variable` marks it known.
            if matches!(dep.kind(), DepKind::Variables(_)) {
                return false;
            }
            let Some(pending) = dep.pending_in_subtree(&key.key) else {
                return false;
            };
            if pending.is_empty() {
                break;
            }
            // Sources that already propagated can be satisfied right away.
            let mut progressed = false;
            let mut blocked_on = Vec::new();
            for (waiting_key, source) in pending {
                let source_done = self.key(&source).map_or(false, |m| m.propagated);
                if source_done {
                    progressed |= self.satisfy(&KeyRef::new(key.dep, waiting_key), &source);
                } else {
                    blocked_on.push((waiting_key, source));
                }
            }
            if blocked_on.is_empty() || progressed {
                continue;
            }
            if !probe {
                return false;
            }
            if !*entered {
                if visiting.len() >= MAX_CHECK_DEPTH {
                    debug!(key = %key, depth = visiting.len(), "on-demand check too deep; key left pending");
                    return false;
                }
                if !visiting.insert(key.clone()) {
                    return false;
                }
                *entered = true;
            }
            for (waiting_key, source) in blocked_on {
                if !self.check_inner(&source, true, visiting) {
                    return false;
                }
                self.satisfy(&KeyRef::new(key.dep, waiting_key), &source);
            }
        }
        self.complete(key);
        if let Some(parent) = key.key.parent() {
            self.check_inner(&KeyRef::new(key.dep, parent), false, visiting);
        }
        true
    }

    /// Propagates a resolved key and its ready descendants, deepest first.
    fn complete(&mut self, key: &KeyRef) {
        let (ready, deferred) = {
            let Some(dep) = self.deps.get(key.dep) else {
                return;
            };
            let known_root = dep.key(&key.key).map_or(false, |m| m.known);
            let mut ready = Vec::new();
            let mut deferred = Vec::new();
            let mut under_known: Option<&KeyPath> = None;
            for (path, meta) in dep.descendants(&key.key) {
                if let Some(prefix) = under_known {
                    if path.starts_with(prefix) {
                        if !meta.propagated {
                            deferred.push(KeyRef::new(key.dep, path.clone()));
                        }
                        continue;
                    }
                    under_known = None;
                }
                if meta.propagated {
                    continue;
                }
                if known_root || meta.blocked {
                    deferred.push(KeyRef::new(key.dep, path.clone()));
                    continue;
                }
                if meta.known {
                    under_known = Some(path);
                }
                ready.push(path.clone());
            }
            ready.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
            (ready, deferred)
        };
        for path in ready {
            let child = KeyRef::new(key.dep, path);
            self.fully_resolve(&child);
            self.propagate_key(&child);
        }
        self.fully_resolve(key);
        self.propagate_key(key);
        self.queue.push_checks(deferred);
    }

    /// Resolution hook, dispatched on the dependency kind.
    fn fully_resolve(&mut self, key: &KeyRef) {
        let is_symbol = key.key.len() == 1 && key.key.first() == Some(SYMBOL_KEY);
        match self.deps.get(key.dep).map(Dependency::kind) {
            Some(DepKind::Data(_)) if is_symbol => self.aggregate_symbol(key.dep),
            Some(DepKind::Command(_)) if key.key.is_root() => self.execute_command(key.dep),
            _ => {}
        }
    }

    /// Marks a key propagated and notifies its triggers. Idempotent.
    pub fn propagate(&mut self, key: &KeyRef) {
        self.propagate_key(key);
        self.drain();
    }

    fn propagate_key(&mut self, key: &KeyRef) {
        let triggers: Vec<KeyRef> = {
            let Some(meta) = self.deps.get_mut(key.dep).and_then(|d| d.key_mut(&key.key)) else {
                return;
            };
            if meta.propagated {
                return;
            }
            meta.propagated = true;
            meta.triggers.iter().cloned().collect()
        };
        self.stats.keys_propagated += 1;
        trace!(key = %key, triggers = triggers.len(), "propagated");
        for waiter in triggers {
            self.queue.push_resolve(waiter, key.clone());
        }
    }

    // ------------------------------------------------------------------
    // Activation / known / blocked
    // ------------------------------------------------------------------

    /// Activates `key` and everything it transitively waits on, or
    /// deactivates it. Deactivation is refused (returns `false`) while an
    /// active key outside the sub-tree still waits on it.
    pub fn activate(&mut self, key: &KeyRef, active: bool) -> bool {
        if active {
            self.activate_from(key);
            self.drain();
            true
        } else {
            self.deactivate(key)
        }
    }

    fn activate_from(&mut self, start: &KeyRef) {
        let mut stack = vec![start.clone()];
        let mut newly = Vec::new();
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let Some(dep) = self.deps.get_mut(current.dep) else {
                continue;
            };
            dep.ensure_key(&current.key);
            for path in dep.subtree_paths(&current.key) {
                let Some(meta) = dep.key_mut(&path) else {
                    continue;
                };
                if !meta.active {
                    meta.active = true;
                    newly.push(KeyRef::new(current.dep, path));
                }
                stack.extend(meta.waiting.keys().cloned());
            }
        }
        self.queue.push_checks(newly);
    }

    fn deactivate(&mut self, key: &KeyRef) -> bool {
        let sources = {
            let Some(dep) = self.deps.get(key.dep) else {
                return false;
            };
            match dep.key(&key.key) {
                Some(meta) if meta.active => {}
                Some(_) => return true,
                None => return false,
            }
            for (_, meta) in dep
                .keys
                .range(key.key.clone()..)
                .take_while(|(k, _)| k.starts_with(&key.key))
            {
                for waiter in &meta.triggers {
                    let inside = waiter.dep == key.dep && waiter.key.starts_with(&key.key);
                    if !inside && self.key(waiter).map_or(false, KeyMeta::is_active) {
                        return false;
                    }
                }
            }
            let mut sources = BTreeSet::new();
            for (_, meta) in dep
                .keys
                .range(key.key.clone()..)
                .take_while(|(k, _)| k.starts_with(&key.key))
            {
                sources.extend(meta.waiting.keys().cloned());
            }
            sources
        };
        if let Some(dep) = self.deps.get_mut(key.dep) {
            for path in dep.subtree_paths(&key.key) {
                if let Some(meta) = dep.key_mut(&path) {
                    meta.active = false;
                    meta.propagated = false;
                    for edge in meta.waiting.values_mut() {
                        edge.satisfied = false;
                    }
                }
            }
        }
        for source in sources {
            // Sources still needed elsewhere refuse; that is expected.
            let _ = self.deactivate(&source);
        }
        true
    }

    /// Forces `key` (and with `recursive` its sub-tree) to resolve
    /// irrespective of its wait set.
    pub fn set_known(&mut self, key: &KeyRef, recursive: bool) {
        let Some(dep) = self.deps.get_mut(key.dep) else {
            return;
        };
        dep.ensure_key(&key.key).known = true;
        if recursive {
            for path in dep.subtree_paths(&key.key) {
                if let Some(meta) = dep.key_mut(&path) {
                    meta.known = true;
                }
            }
        }
        self.queue.push_check(key.clone());
        self.drain();
    }

    /// Marks a key as never resolvable. Used when a reference names data
    /// that cannot exist, so everything downstream stays pending.
    pub fn block(&mut self, key: &KeyRef) {
        if let Some(dep) = self.deps.get_mut(key.dep) {
            dep.ensure_key(&key.key).blocked = true;
        }
    }

    /// Checks every active, unpropagated key and runs the cascade to a
    /// fixpoint.
    pub fn settle(&mut self) {
        let mut keys = Vec::new();
        for (id, dep) in self.deps.iter() {
            for (path, meta) in &dep.keys {
                if meta.active && !meta.propagated {
                    keys.push(KeyRef::new(id, path.clone()));
                }
            }
        }
        self.queue.push_checks(keys);
        self.drain();
    }

    /// Active keys under `prefix` of `dep` that have not propagated.
    pub fn pending_keys(&self, dep: DepId, prefix: &KeyPath) -> Vec<KeyPath> {
        let Some(dep) = self.deps.get(dep) else {
            return Vec::new();
        };
        dep.keys
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, meta)| meta.active && !meta.propagated)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub(crate) fn count_command_executed(&mut self) {
        self.stats.commands_executed += 1;
    }

    /// Runs queued cascade events until the queue is empty or the step
    /// bound is hit. Nested calls return immediately; the outermost drain
    /// picks up their events.
    fn drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        let mut steps = 0usize;
        while let Some(event) = self.queue.pop() {
            steps += 1;
            self.stats.events += 1;
            if steps > self.max_steps {
                warn!(
                    max_steps = self.max_steps,
                    remaining = self.queue.len(),
                    "cascade step limit reached; remaining keys stay pending"
                );
                self.queue.clear();
                break;
            }
            match event {
                Event::Resolve { waiter, source } => {
                    self.resolve_edge(&waiter, &source);
                }
                Event::Check(key) => {
                    let mut visiting = BTreeSet::new();
                    self.check_inner(&key, false, &mut visiting);
                }
            }
        }
        self.draining = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> DependencyGraph {
        DependencyGraph::new(10_000)
    }

    #[test]
    fn get_key_only_creates_on_request() {
        let mut g = graph();
        let d = g.create(DepKind::Plain);
        let k = KeyRef::new(d, "visual.origin");
        assert!(g.get_key(&k, false).is_none());
        assert!(g.get_key(&k, true).is_some());
        assert!(g.key(&KeyRef::new(d, "visual")).is_some());
    }

    #[test]
    fn wait_is_idempotent() {
        let mut g = graph();
        let a = g.create(DepKind::Plain);
        let b = g.create(DepKind::Plain);
        let waiter = KeyRef::new(a, "x");
        let source = KeyRef::new(b, "y");
        assert!(g.wait(&waiter, &source, None));
        assert!(!g.wait(&waiter, &source, None));
        assert_eq!(g.key(&waiter).map(|m| m.waiting().count()), Some(1));
        assert_eq!(g.key(&source).map(|m| m.triggers().count()), Some(1));
    }

    #[test]
    fn resolve_runs_callback_once() {
        let mut g = graph();
        let a = g.create(DepKind::Plain);
        let b = g.create(DepKind::Plain);
        let waiter = KeyRef::new(a, "x");
        let source = KeyRef::new(b, "y");
        g.wait(&waiter, &source, Some(Callback::BindBlock(0)));
        assert!(g.resolve(&waiter, &source));
        assert!(!g.resolve(&waiter, &source));
        assert_eq!(g.stats().callbacks_run, 1);
    }

    #[test]
    fn propagation_cascades_through_active_keys() {
        let mut g = graph();
        let a = g.create(DepKind::Plain);
        let b = g.create(DepKind::Plain);
        let c = g.create(DepKind::Plain);
        let ka = KeyRef::new(a, "out");
        let kb = KeyRef::new(b, "mid");
        let kc = KeyRef::new(c, "in");
        g.wait(&ka, &kb, None);
        g.wait(&kb, &kc, None);
        g.activate(&ka, true);
        // Activation flows to every source, and the leaf has no waits.
        assert!(g.key(&kc).map_or(false, KeyMeta::is_active));
        assert!(g.key(&ka).map_or(false, KeyMeta::is_propagated));
        assert!(g.key(&kb).map_or(false, KeyMeta::is_propagated));
    }

    #[test]
    fn inactive_keys_do_not_resolve() {
        let mut g = graph();
        let a = g.create(DepKind::Plain);
        let k = KeyRef::new(a, "symbol");
        g.get_key(&k, true);
        assert!(!g.check_resolved(&k, false));
        g.activate(&k, true);
        assert!(g.key(&k).map_or(false, KeyMeta::is_propagated));
    }

    #[test]
    fn pending_sub_key_holds_parent() {
        let mut g = graph();
        let a = g.create(DepKind::Plain);
        let b = g.create(DepKind::Plain);
        let parent = KeyRef::new(a, "visual");
        let child = KeyRef::new(a, "visual.delta");
        let source = KeyRef::new(b, "never");
        g.wait(&child, &source, None);
        g.block(&source);
        g.activate(&parent, true);
        assert!(!g.key(&parent).map_or(false, KeyMeta::is_propagated));
        assert_eq!(g.pending_keys(a, &KeyPath::parse("visual")).len(), 2);
    }

    #[test]
    fn set_known_overrides_wait_set() {
        let mut g = graph();
        let a = g.create(DepKind::Plain);
        let b = g.create(DepKind::Plain);
        let k = KeyRef::new(a, "value");
        let source = KeyRef::new(b, "never");
        g.wait(&k, &source, None);
        g.block(&source);
        g.activate(&k, true);
        assert!(!g.key(&k).map_or(false, KeyMeta::is_propagated));
        g.set_known(&k, false);
        assert!(g.key(&k).map_or(false, KeyMeta::is_propagated));
    }

    #[test]
    fn probe_resolves_without_prior_events() {
        let mut g = graph();
        let a = g.create(DepKind::Plain);
        let b = g.create(DepKind::Plain);
        let ka = KeyRef::new(a, "x");
        let kb = KeyRef::new(b, "y");
        g.wait(&ka, &kb, None);
        // Activate directly without cascading: mark both active by hand.
        for k in [&ka, &kb] {
            if let Some(meta) = g.get_mut(k.dep).and_then(|d| d.key_mut(&k.key)) {
                meta.active = true;
            }
        }
        assert!(!g.check_resolved(&ka, false));
        assert!(g.check_resolved(&ka, true));
        assert!(g.key(&kb).map_or(false, KeyMeta::is_propagated));
    }

    #[test]
    fn cycles_stay_pending_even_when_probed() {
        let mut g = graph();
        let a = g.create(DepKind::Plain);
        let b = g.create(DepKind::Plain);
        let ka = KeyRef::new(a, "x");
        let kb = KeyRef::new(b, "y");
        g.wait(&ka, &kb, None);
        g.wait(&kb, &ka, None);
        g.activate(&ka, true);
        assert!(!g.check_resolved(&ka, true));
        assert!(!g.key(&ka).map_or(false, KeyMeta::is_propagated));
    }

    #[test]
    fn deactivation_refused_while_dependents_are_active() {
        let mut g = graph();
        let a = g.create(DepKind::Plain);
        let b = g.create(DepKind::Plain);
        let ka = KeyRef::new(a, "x");
        let kb = KeyRef::new(b, "y");
        g.wait(&ka, &kb, None);
        g.activate(&ka, true);
        assert!(!g.activate(&kb, false));
        assert!(g.activate(&ka, false));
        assert!(!g.key(&kb).map_or(true, KeyMeta::is_active));
    }

    #[test]
    fn unbound_variable_holds_its_readers() {
        let mut g = graph();
        let vars = g.create(DepKind::Variables(VariableTable::default()));
        let data = g.create(DepKind::Plain);
        let reader = KeyRef::new(data, "visual.size");
        let var = KeyRef::new(vars, "o");
        g.wait(&reader, &var, None);
        g.activate(&reader, true);
        g.settle();
        assert!(g.key(&var).map_or(false, KeyMeta::is_active));
        assert!(!g.key(&var).map_or(false, KeyMeta::is_propagated));
        assert!(!g.key(&reader).map_or(false, KeyMeta::is_propagated));

        let target = KeyRef::new(data, "visual.origin");
        g.bind_variable(vars, "o", target.clone());
        assert_eq!(g.variable(vars, "o"), Some(&target));
        assert!(g.key(&var).map_or(false, KeyMeta::is_propagated));
        assert!(g.key(&reader).map_or(false, KeyMeta::is_propagated));
    }

    #[test]
    fn deep_chains_stop_at_the_check_bound_then_settle() {
        let mut g = graph();
        let deps: Vec<DepId> = (0..2_000).map(|_| g.create(DepKind::Plain)).collect();
        let keys: Vec<KeyRef> = deps.iter().map(|d| KeyRef::new(*d, "x")).collect();
        for pair in keys.windows(2) {
            g.wait(&pair[0], &pair[1], None);
        }
        for k in &keys {
            if let Some(meta) = g.get_mut(k.dep).and_then(|d| d.key_mut(&k.key)) {
                meta.active = true;
            }
        }
        assert!(!g.check_resolved(&keys[0], true));
        assert!(!g.key(&keys[0]).map_or(false, KeyMeta::is_propagated));
        g.settle();
        assert!(keys.iter().all(|k| g.key(k).map_or(false, KeyMeta::is_propagated)));
    }

    #[test]
    fn sub_keys_waiting_under_a_live_key_are_live() {
        let mut g = graph();
        let a = g.create(DepKind::Plain);
        let b = g.create(DepKind::Plain);
        let parent = KeyRef::new(a, "visual.origin");
        g.get_key(&parent, true);
        g.activate(&parent, true);
        let child = KeyRef::new(a, "visual.origin.x");
        let source = KeyRef::new(b, "y");
        g.wait(&child, &source, None);
        assert!(g.key(&child).map_or(false, KeyMeta::is_active));
        assert!(g.key(&source).map_or(false, KeyMeta::is_active));
        assert!(g.key(&child).map_or(false, KeyMeta::is_propagated));
    }

    #[test]
    fn propagate_is_idempotent() {
        let mut g = graph();
        let a = g.create(DepKind::Plain);
        let k = KeyRef::new(a, "x");
        g.get_key(&k, true);
        g.propagate(&k);
        g.propagate(&k);
        assert_eq!(g.stats().keys_propagated, 1);
    }
}
