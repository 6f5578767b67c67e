// src/slab.rs
//! Fixed-capacity arena with an intrusive free list.
//!
//! The slab is the single owner of every connection session; everything else
//! refers to a session by its index.

enum Entry<T> {
    Occupied(T),
    /// Free slot holding the index of the next free slot.
    Vacant(Option<usize>),
}

pub struct Slab<T> {
    entries: Box<[Entry<T>]>,
    head_free: Option<usize>,
    active_count: usize,
}

impl<T> Slab<T> {
    /// Reserve every slot up front; the slab never reallocates.
    pub fn new(capacity: usize) -> Self {
        let entries: Vec<Entry<T>> = (0..capacity)
            .map(|i| Entry::Vacant((i + 1 < capacity).then_some(i + 1)))
            .collect();

        Self {
            entries: entries.into_boxed_slice(),
            head_free: (capacity > 0).then_some(0),
            active_count: 0,
        }
    }

    /// O(1) allocation. Hands the value back when the slab is full.
    pub fn allocate(&mut self, value: T) -> Result<usize, T> {
        let Some(idx) = self.head_free else {
            return Err(value);
        };

        let slot = &mut self.entries[idx];
        let next = match slot {
            Entry::Vacant(next) => *next,
            // The free list only ever threads vacant slots.
            Entry::Occupied(_) => return Err(value),
        };

        self.head_free = next;
        *slot = Entry::Occupied(value);
        self.active_count += 1;
        Ok(idx)
    }

    /// O(1) deallocation. Freeing a vacant or out-of-range slot returns `None`.
    pub fn free(&mut self, index: usize) -> Option<T> {
        let slot = self.entries.get_mut(index)?;
        if matches!(slot, Entry::Vacant(_)) {
            return None; // double free
        }

        let old = std::mem::replace(slot, Entry::Vacant(self.head_free));
        self.head_free = Some(index);
        self.active_count -= 1;

        match old {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant(_) => None,
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        match self.entries.get(index)? {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant(_) => None,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        match self.entries.get_mut(index)? {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant(_) => None,
        }
    }

    /// Indices of every occupied slot, collected so the caller may mutate
    /// or free while walking them.
    pub fn occupied(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| matches!(e, Entry::Occupied(_)).then_some(i))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| match e {
            Entry::Occupied(value) => Some((i, value)),
            Entry::Vacant(_) => None,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_operations() {
        let mut slab = Slab::new(10);

        assert_eq!(slab.len(), 0);
        assert_eq!(slab.capacity(), 10);

        let idx1 = slab.allocate("a").unwrap();
        assert_eq!(idx1, 0);
        assert_eq!(slab.get(idx1), Some(&"a"));

        let idx2 = slab.allocate("b").unwrap();
        assert_eq!(idx2, 1);

        assert_eq!(slab.free(idx1), Some("a"));
        assert_eq!(slab.len(), 1);

        // Index 0 was pushed to the head of the free list.
        let idx3 = slab.allocate("c").unwrap();
        assert_eq!(idx3, 0);
        assert_eq!(slab.occupied(), vec![0, 1]);
    }

    #[test]
    fn double_free_is_ignored() {
        let mut slab = Slab::new(2);
        let idx = slab.allocate(7u32).unwrap();
        assert_eq!(slab.free(idx), Some(7));
        assert_eq!(slab.free(idx), None);
        assert_eq!(slab.free(99), None);
        assert!(slab.is_empty());
        assert!(slab.get_mut(idx).is_none());
    }

    #[test]
    fn full_slab_returns_the_value() {
        let mut slab = Slab::new(1);
        slab.allocate(1u8).unwrap();
        assert_eq!(slab.allocate(2u8), Err(2));

        let mut empty: Slab<u8> = Slab::new(0);
        assert_eq!(empty.allocate(3), Err(3));
    }
}
