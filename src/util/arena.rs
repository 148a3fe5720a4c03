//! Arena storage for thread records.
//!
//! Thread records are addressed by stable indices with generation counters,
//! so a stale identifier held by a queue or a join record can never reach a
//! recycled slot. This is the ownership discipline that keeps a thread from
//! being reachable through two run queues at once: queues move the index,
//! the arena owns the record.

use core::fmt;
use core::hash::{Hash, Hasher};

/// An index into an arena with a generation counter for ABA safety.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArenaIndex {
    index: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Creates an arena index from raw parts (primarily for tests).
    #[inline]
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the raw slot index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Returns the generation counter.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaIndex({}:{})", self.index, self.generation)
    }
}

impl Hash for ArenaIndex {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        let packed = (u64::from(self.index) << 32) | u64::from(self.generation);
        state.write_u64(packed);
    }
}

enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

impl<T: fmt::Debug> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Occupied { generation, .. } => write!(f, "Occupied(gen {generation})"),
            Self::Vacant { generation, .. } => write!(f, "Vacant(gen {generation})"),
        }
    }
}

/// A slot arena with generation-checked indices and a free list.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Inserts a value and returns its index.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.len += 1;
        if let Some(free) = self.free_head {
            let slot = &mut self.slots[free as usize];
            let Slot::Vacant {
                next_free,
                generation,
            } = *slot
            else {
                unreachable!("free list points at an occupied slot");
            };
            self.free_head = next_free;
            *slot = Slot::Occupied { value, generation };
            return ArenaIndex::new(free, generation);
        }
        let index = u32::try_from(self.slots.len()).expect("arena slot count overflow");
        self.slots.push(Slot::Occupied {
            value,
            generation: 0,
        });
        ArenaIndex::new(index, 0)
    }

    /// Returns a reference to the value at `idx`, or `None` if the index is
    /// stale or vacant.
    #[must_use]
    pub fn get(&self, idx: ArenaIndex) -> Option<&T> {
        match self.slots.get(idx.index as usize) {
            Some(Slot::Occupied { value, generation }) if *generation == idx.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Returns a mutable reference to the value at `idx`, or `None` if the
    /// index is stale or vacant.
    pub fn get_mut(&mut self, idx: ArenaIndex) -> Option<&mut T> {
        match self.slots.get_mut(idx.index as usize) {
            Some(Slot::Occupied { value, generation }) if *generation == idx.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Removes and returns the value at `idx`. The slot's generation is
    /// bumped so outstanding copies of the index become stale.
    pub fn remove(&mut self, idx: ArenaIndex) -> Option<T> {
        let slot = self.slots.get_mut(idx.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == idx.generation => {
                let next_gen = generation.wrapping_add(1);
                let old = std::mem::replace(
                    slot,
                    Slot::Vacant {
                        next_free: self.free_head,
                        generation: next_gen,
                    },
                );
                self.free_head = Some(idx.index);
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    /// Number of live entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if there are no live entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over live entries.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Occupied { value, generation } => Some((
                    ArenaIndex::new(u32::try_from(i).expect("slot index fits u32"), *generation),
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_roundtrip() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn stale_index_is_rejected_after_reuse() {
        let mut arena = Arena::new();
        let a = arena.insert(1u32);
        assert_eq!(arena.remove(a), Some(1));
        let b = arena.insert(2u32);
        // The slot is reused with a bumped generation.
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
        assert_eq!(arena.get(a), None, "stale index must not resolve");
        assert_eq!(arena.get(b), Some(&2));
        assert_eq!(arena.remove(a), None, "stale remove must be rejected");
    }

    #[test]
    fn double_remove_is_rejected() {
        let mut arena = Arena::new();
        let a = arena.insert(7u8);
        assert_eq!(arena.remove(a), Some(7));
        assert_eq!(arena.remove(a), None);
    }

    #[test]
    fn iter_visits_only_live_entries() {
        let mut arena = Arena::new();
        let a = arena.insert(10);
        let _b = arena.insert(20);
        let _c = arena.insert(30);
        arena.remove(a);
        let values: Vec<i32> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![20, 30]);
    }

    #[test]
    fn free_list_reuses_slots() {
        let mut arena = Arena::new();
        let ids: Vec<_> = (0..8).map(|i| arena.insert(i)).collect();
        for id in &ids {
            arena.remove(*id);
        }
        for i in 0..8 {
            let id = arena.insert(i);
            assert!(id.index() < 8, "vacant slots should be reused, got {id:?}");
        }
        assert_eq!(arena.len(), 8);
    }
}
