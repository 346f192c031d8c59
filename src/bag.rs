//! Slot-arena registries with stable removal keys.
//!
//! Every waiter collection in the store (data requests, status requests,
//! range-status requests, missing-range requests) needs O(1) insertion and
//! O(1) removal by a handle that stays valid while other entries come and
//! go. A growable vector of optional slots plus a free list of reclaimed
//! indices gives exactly that. Each slot carries a generation counter so a
//! stale key for a reclaimed slot can never remove its new occupant.

/// Key identifying one entry in a [`Bag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BagKey {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    item: Option<T>,
}

/// Registry of live entries addressed by stable keys.
///
/// Keys returned by [`Bag::add`] remain valid until that entry is removed;
/// removing an entry never moves any other entry. Reclaimed slots are
/// reused for later insertions under a fresh generation.
#[derive(Debug)]
pub struct Bag<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Default for Bag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Bag<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Inserts an entry and returns its stable key.
    pub fn add(&mut self, item: T) -> BagKey {
        self.len += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                debug_assert!(slot.item.is_none());
                slot.item = Some(item);
                BagKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    item: Some(item),
                });
                BagKey {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    /// Removes the entry for `key`, returning it if it was still live.
    ///
    /// Removal is idempotent: a second removal with the same key, or a key
    /// whose slot was reclaimed and reused, returns `None` and changes
    /// nothing.
    pub fn remove(&mut self, key: BagKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index)?;
        if slot.generation != key.generation {
            return None;
        }
        let item = slot.item.take()?;
        slot.generation += 1;
        self.free.push(key.index);
        self.len -= 1;
        Some(item)
    }

    /// Returns a mutable reference to the entry for `key`, if live.
    pub fn get_mut(&mut self, key: BagKey) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.index)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.item.as_mut()
    }

    /// Removes and returns every live entry.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(item) = slot.item.take() {
                slot.generation += 1;
                self.free.push(index);
                items.push(item);
            }
        }
        self.len = 0;
        items
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the registry holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over live entries.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.item.as_ref())
    }

    /// Iterates over live entries together with their keys.
    pub fn iter_with_keys(&self) -> impl Iterator<Item = (BagKey, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.item.as_ref().map(|item| {
                (
                    BagKey {
                        index,
                        generation: slot.generation,
                    },
                    item,
                )
            })
        })
    }

    /// Mutable variant of [`Bag::iter_with_keys`].
    pub fn iter_mut_with_keys(&mut self) -> impl Iterator<Item = (BagKey, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.item.as_mut().map(move |item| {
                (
                    BagKey {
                        index,
                        generation,
                    },
                    item,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_returns_stable_keys() {
        let mut bag = Bag::new();
        let a = bag.add("a");
        let b = bag.add("b");
        let c = bag.add("c");

        assert_eq!(bag.remove(b), Some("b"));
        assert_eq!(bag.remove(a), Some("a"));
        assert_eq!(bag.remove(c), Some("c"));
        assert!(bag.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut bag = Bag::new();
        let key = bag.add(7);

        assert_eq!(bag.remove(key), Some(7));
        assert_eq!(bag.remove(key), None);
        assert_eq!(bag.len(), 0);
    }

    #[test]
    fn test_stale_key_cannot_remove_reused_slot() {
        let mut bag = Bag::new();
        let old = bag.add(1);
        bag.remove(old);

        let fresh = bag.add(2);
        assert_eq!(bag.remove(old), None);
        assert_eq!(bag.remove(fresh), Some(2));
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut bag = Bag::new();
        let a = bag.add(1);
        let _b = bag.add(2);

        bag.remove(a);
        bag.add(3);
        // Still only two physical slots.
        assert_eq!(bag.slots.len(), 2);
        assert_eq!(bag.len(), 2);
    }

    #[test]
    fn test_iter_skips_removed_entries() {
        let mut bag = Bag::new();
        bag.add(1);
        let b = bag.add(2);
        bag.add(3);
        bag.remove(b);

        let values: Vec<i32> = bag.iter().copied().collect();
        assert_eq!(values, vec![1, 3]);
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut bag = Bag::new();
        let a = bag.add(1);
        bag.add(2);

        let drained = bag.drain();
        assert_eq!(drained.len(), 2);
        assert!(bag.is_empty());
        // Keys issued before the drain are dead.
        assert_eq!(bag.remove(a), None);
    }

    #[test]
    fn test_get_mut_respects_generation() {
        let mut bag = Bag::new();
        let key = bag.add(10);
        *bag.get_mut(key).unwrap() = 20;
        assert_eq!(bag.remove(key), Some(20));
        assert!(bag.get_mut(key).is_none());
    }
}
