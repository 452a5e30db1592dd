/// Generational identifier handed out by an [`Arena`].
///
/// Starts from generation 1 so that an all-zero id never refers to a live
/// slot, the same way a null handle never refers to a live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaId {
    index: u32,
    generation: u32,
}

impl ArenaId {
    pub const fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a single opaque value for hosts that traffic in integers.
    pub fn to_bits(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage keyed by [`ArenaId`].
///
/// Removing a value bumps the slot's generation, so ids issued before the
/// removal stop resolving even after the slot is reused.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Store a value and return its id.
    pub fn insert(&mut self, value: T) -> ArenaId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return ArenaId::from_raw(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        ArenaId::from_raw(index, 1)
    }

    pub fn get(&self, id: ArenaId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, id: ArenaId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, id: ArenaId) -> bool {
        self.get(id).is_some()
    }

    /// Remove a value, invalidating `id` and every copy of it.
    pub fn remove(&mut self, id: ArenaId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    /// Remove every value. Ids issued so far stay invalid afterwards.
    pub fn drain(&mut self) -> Vec<(ArenaId, T)> {
        let mut out = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                out.push((ArenaId::from_raw(index as u32, slot.generation), value));
                slot.generation = slot.generation.wrapping_add(1).max(1);
                self.free.push(index as u32);
            }
        }
        self.len = 0;
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArenaId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (ArenaId::from_raw(index as u32, slot.generation), value))
        })
    }

    /// Return number of live values.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
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
    fn test_insert_and_get() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_ne!(a, b);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_removed_id_is_stale_after_slot_reuse() {
        let mut arena = Arena::new();
        let old = arena.insert(1u32);
        assert_eq!(arena.remove(old), Some(1));
        let new = arena.insert(2u32);
        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert!(arena.get(old).is_none());
        assert_eq!(arena.get(new), Some(&2));
        assert!(arena.remove(old).is_none());
    }

    #[test]
    fn test_drain_invalidates_everything() {
        let mut arena = Arena::new();
        let ids: Vec<_> = (0..4).map(|i| arena.insert(i)).collect();
        let drained = arena.drain();
        assert_eq!(drained.len(), 4);
        assert!(arena.is_empty());
        for id in ids {
            assert!(!arena.contains(id));
        }
        let fresh = arena.insert(9);
        assert_eq!(arena.get(fresh), Some(&9));
    }

    #[test]
    fn test_bits_round_trip() {
        let id = ArenaId::from_raw(7, 3);
        assert_eq!(ArenaId::from_bits(id.to_bits()), id);
    }

    #[test]
    fn test_zero_bits_never_resolve() {
        let mut arena = Arena::new();
        arena.insert(());
        assert!(arena.get(ArenaId::from_bits(0)).is_none());
    }
}
