//! Fixed-capacity id-indexed storage.
//!
//! Processes, threads, and handles are all referenced by small reusable
//! integer ids rather than pointers, so the cross-references between them
//! (parent/child links, wait-queue membership, handle slots) can never
//! dangle: a stale id simply fails lookup. `IdTable` is the one allocator
//! behind all of those id spaces. Insertion always picks the smallest free
//! index, which is also the contract the handle table exposes to userspace.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{ErrorCode, KernelResult};

/// A slot table with stable, reusable integer ids.
pub struct IdTable<T> {
    slots: Vec<Option<T>>,
    len: usize,
}

impl<T> IdTable<T> {
    /// Create a table with room for `capacity` entries (ids `0..capacity`).
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert at the smallest free index. Fails with `NoSpace` when full.
    pub fn insert(&mut self, value: T) -> KernelResult<usize> {
        let id = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ErrorCode::NoSpace)?;
        self.slots[id] = Some(value);
        self.len += 1;
        Ok(id)
    }

    /// Insert at a specific index. Fails with `InUse` if occupied.
    pub fn insert_at(&mut self, id: usize, value: T) -> KernelResult<()> {
        let slot = self.slots.get_mut(id).ok_or(ErrorCode::InvalidIndex)?;
        if slot.is_some() {
            return Err(ErrorCode::InUse);
        }
        *slot = Some(value);
        self.len += 1;
        Ok(())
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    /// Remove and return the entry at `id`, freeing the id for reuse.
    pub fn remove(&mut self, id: usize) -> Option<T> {
        let taken = self.slots.get_mut(id).and_then(Option::take);
        if taken.is_some() {
            self.len -= 1;
        }
        taken
    }

    /// Move the entry out of its slot, leaving the id reserved.
    ///
    /// Used by dispatch paths that must call into an entry while the table
    /// itself stays borrowable; pair with [`IdTable::insert_at`] to restore.
    pub fn take(&mut self, id: usize) -> Option<T> {
        self.remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|v| (id, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_mut().map(|v| (id, v)))
    }

    pub fn ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.iter().map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_smallest_free_index() {
        let mut t: IdTable<&str> = IdTable::new(4);
        assert_eq!(t.insert("a").unwrap(), 0);
        assert_eq!(t.insert("b").unwrap(), 1);
        assert_eq!(t.insert("c").unwrap(), 2);
        t.remove(1);
        assert_eq!(t.insert("d").unwrap(), 1);
        assert_eq!(t.insert("e").unwrap(), 3);
        assert_eq!(t.insert("f"), Err(ErrorCode::NoSpace));
    }

    #[test]
    fn ids_are_reusable_and_stable() {
        let mut t: IdTable<u32> = IdTable::new(2);
        let id = t.insert(7).unwrap();
        assert_eq!(t.remove(id), Some(7));
        assert!(!t.contains(id));
        let id2 = t.insert(9).unwrap();
        assert_eq!(id, id2);
        assert_eq!(t.get(id2), Some(&9));
    }

    #[test]
    fn insert_at_rejects_occupied() {
        let mut t: IdTable<u32> = IdTable::new(2);
        t.insert_at(1, 5).unwrap();
        assert_eq!(t.insert_at(1, 6), Err(ErrorCode::InUse));
        assert_eq!(t.insert_at(9, 6), Err(ErrorCode::InvalidIndex));
        assert_eq!(t.len(), 1);
    }
}
