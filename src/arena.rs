//! Session arena for live dependency instances.
//!
//! Every dependency tree created during a compile/evaluate pass (entity data,
//! variable tables, commands) lives in one `DepArena` owned by the session.
//! Identifiers are dense indices tagged with a generation so that a `DepId`
//! kept across a `clear` or `deallocate` can never alias a newer instance.
//!
//! # Determinism
//! - `DepId` ordering is by `(index, generation)`.
//! - Iteration order over slots is by index.
//! - Free-list reuse is LIFO, so identical allocation/deallocation sequences
//!   yield identical ids across runs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a dependency instance inside a [`DepArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DepId {
    index: u32,
    generation: u32,
}

impl DepId {
    /// Returns the slot index.
    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns the slot generation this id was issued for.
    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for DepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dep#{}", self.index)
    }
}

#[derive(Debug, Clone)]
struct Slot<T> {
    data: Option<T>,
    generation: u32,
    next_free: Option<u32>,
}

/// Contiguous storage with free-list reuse and generation checks.
#[derive(Debug, Clone)]
pub struct DepArena<T> {
    slots: Vec<Slot<T>>,
    free_list_head: Option<u32>,
    live_count: usize,
}

impl<T> DepArena<T> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list_head: None,
            live_count: 0,
        }
    }

    /// Stores `data` and returns its id, reusing the most recently freed slot.
    pub fn allocate(&mut self, data: T) -> DepId {
        self.live_count += 1;
        if let Some(idx) = self.free_list_head {
            let slot = &mut self.slots[idx as usize];
            debug_assert!(slot.data.is_none(), "free slot should have no data");
            self.free_list_head = slot.next_free.take();
            slot.data = Some(data);
            DepId {
                index: idx,
                generation: slot.generation,
            }
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot {
                data: Some(data),
                generation: 0,
                next_free: None,
            });
            DepId {
                index: idx,
                generation: 0,
            }
        }
    }

    /// Removes the instance behind `id`, returning it.
    ///
    /// Returns `None` if the id is stale or already freed.
    pub fn deallocate(&mut self, id: DepId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let data = slot.data.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.free_list_head;
        self.free_list_head = Some(id.index);
        self.live_count -= 1;
        Some(data)
    }

    /// Returns the instance behind `id` if it is still live.
    #[inline]
    pub fn get(&self, id: DepId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.data.as_ref())
    }

    /// Mutable variant of [`DepArena::get`].
    #[inline]
    pub fn get_mut(&mut self, id: DepId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.data.as_mut())
    }

    /// Returns `true` if `id` refers to a live instance.
    #[inline]
    pub fn contains(&self, id: DepId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live instances.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Ids of all live instances, in index order.
    pub fn ids(&self) -> Vec<DepId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Iterates live instances in index order.
    pub fn iter(&self) -> impl Iterator<Item = (DepId, &T)> {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| {
            slot.data.as_ref().map(|data| {
                (
                    DepId {
                        index: idx as u32,
                        generation: slot.generation,
                    },
                    data,
                )
            })
        })
    }

    /// Drops every instance. Generations advance so old ids stay invalid.
    pub fn clear(&mut self) {
        let ids = self.ids();
        for id in ids.into_iter().rev() {
            self.deallocate(id);
        }
    }
}

impl<T> Default for DepArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_reuse() {
        let mut arena: DepArena<&'static str> = DepArena::new();
        let a = arena.allocate("a");
        let b = arena.allocate("b");
        assert_eq!(arena.live_count(), 2);
        assert_eq!(arena.deallocate(a), Some("a"));
        assert_eq!(arena.get(a), None);

        let c = arena.allocate("c");
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a, "reused slot must carry a new generation");
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(c), Some(&"c"));
        assert_eq!(arena.get(b), Some(&"b"));
    }

    #[test]
    fn stale_ids_do_not_deallocate() {
        let mut arena: DepArena<u8> = DepArena::new();
        let a = arena.allocate(1);
        arena.deallocate(a);
        let _b = arena.allocate(2);
        assert_eq!(arena.deallocate(a), None);
        assert_eq!(arena.live_count(), 1);
    }

    #[test]
    fn iteration_is_by_index() {
        let mut arena: DepArena<i32> = DepArena::new();
        let ids: Vec<_> = (0..5).map(|i| arena.allocate(i)).collect();
        arena.deallocate(ids[1]);
        arena.deallocate(ids[3]);
        arena.allocate(100);
        arena.allocate(200);
        let collected: Vec<_> = arena.iter().map(|(id, &v)| (id.index(), v)).collect();
        assert_eq!(collected, vec![(0, 0), (1, 200), (2, 2), (3, 100), (4, 4)]);
    }

    #[test]
    fn clear_invalidates_everything() {
        let mut arena: DepArena<i32> = DepArena::new();
        let a = arena.allocate(1);
        arena.clear();
        assert_eq!(arena.live_count(), 0);
        assert!(!arena.contains(a));
    }
}
