//! Integer id registry.
//!
//! The id space `[0, 2^31)` is partitioned into ranges, created lazily the first
//! time a caller asks for ids above a `start` that is not yet a range boundary.
//! Each range hands out ids from a LIFO list of explicitly freed ids first, then
//! from a counter of never-used ids. Owners live in an ordered map so lookup is
//! `O(log n)` and iteration runs in ascending id order.

use crate::error::{MmError, MmResult};
use std::collections::BTreeMap;
use std::ops::ControlFlow;

/// Exclusive upper bound of the id space.
pub const ID_LIMIT: u32 = 1 << 31;

#[derive(Debug, Clone)]
struct FreeRange {
    start: u32,
    end: u32,
    min_unused: u32,
    free_ids: Vec<u32>,
}

impl FreeRange {
    const fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            min_unused: start,
            free_ids: Vec::new(),
        }
    }

    const fn is_full(&self) -> bool {
        self.min_unused >= self.end
    }

    fn take(&mut self) -> Option<u32> {
        if let Some(id) = self.free_ids.pop() {
            return Some(id);
        }
        if self.is_full() {
            return None;
        }
        let id = self.min_unused;
        self.min_unused += 1;
        Some(id)
    }
}

#[derive(Debug)]
pub struct IdAllocator<T> {
    /// Sorted by `start`; consecutive ranges share boundaries.
    ranges: Vec<FreeRange>,
    used: BTreeMap<u32, T>,
}

impl<T> Default for IdAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IdAllocator<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ranges: vec![FreeRange::new(0, ID_LIMIT)],
            used: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.used.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Index of the range beginning exactly at `start`, splitting one if needed.
    fn range_at(&mut self, start: u32) -> usize {
        let idx = self.ranges.partition_point(|r| r.start < start);
        if idx < self.ranges.len() && self.ranges[idx].start == start {
            return idx;
        }

        // ranges[0] starts at 0, so idx >= 1 here.
        let prev = &mut self.ranges[idx - 1];
        let mut split = FreeRange::new(start, prev.end);
        prev.end = start;

        if prev.is_full() {
            split.min_unused = prev.min_unused;
            prev.min_unused = start;

            let (keep, moved): (Vec<u32>, Vec<u32>) = std::mem::take(&mut prev.free_ids)
                .into_iter()
                .partition(|&id| id < start);
            prev.free_ids = keep;
            split.free_ids = moved;
        }

        self.ranges.insert(idx, split);
        idx
    }

    /// Index of the range that contains `id`.
    fn range_of(&self, id: u32) -> usize {
        self.ranges.partition_point(|r| r.start <= id) - 1
    }

    /// Allocates an id `>= start` and binds it to `owner`.
    ///
    /// # Errors
    /// `InvalidArgument` when `start` is negative, `OutOfMemory` when no id is left.
    pub fn allocate(&mut self, start: i32, owner: T) -> MmResult<u32> {
        let start = u32::try_from(start)
            .map_err(|_| MmError::InvalidArgument(format!("negative id start {start}")))?;

        let first = self.range_at(start);
        for range in &mut self.ranges[first..] {
            if let Some(id) = range.take() {
                self.used.insert(id, owner);
                return Ok(id);
            }
        }
        Err(MmError::OutOfMemory)
    }

    /// # Errors
    /// `NotFound` if `id` is not allocated.
    pub fn lookup(&self, id: u32) -> MmResult<&T> {
        self.used
            .get(&id)
            .ok_or_else(|| MmError::NotFound(format!("id {id}")))
    }

    /// # Errors
    /// `NotFound` if `id` is not allocated.
    pub fn lookup_mut(&mut self, id: u32) -> MmResult<&mut T> {
        self.used
            .get_mut(&id)
            .ok_or_else(|| MmError::NotFound(format!("id {id}")))
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.used.contains_key(&id)
    }

    /// Frees `id` for reuse and hands back its owner.
    ///
    /// # Errors
    /// `NotFound` if `id` is not allocated, `OutOfMemory` if the free list cannot grow.
    pub fn remove(&mut self, id: u32) -> MmResult<T> {
        if !self.used.contains_key(&id) {
            return Err(MmError::NotFound(format!("id {id}")));
        }

        let idx = self.range_of(id);
        let range = &mut self.ranges[idx];
        range
            .free_ids
            .try_reserve(1)
            .map_err(|_| MmError::OutOfMemory)?;
        range.free_ids.push(id);

        self.used
            .remove(&id)
            .ok_or_else(|| MmError::NotFound(format!("id {id}")))
    }

    /// Rebinds `id` to `owner`, returning the previous owner.
    ///
    /// # Errors
    /// `NotFound` if `id` is not allocated.
    pub fn replace(&mut self, id: u32, owner: T) -> MmResult<T> {
        let slot = self.lookup_mut(id)?;
        Ok(std::mem::replace(slot, owner))
    }

    /// Ascending iteration over `(id, owner)`.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.used.iter().map(|(&id, owner)| (id, owner))
    }

    /// Visits every entry in ascending id order until `visit` breaks.
    ///
    /// The registry cannot be mutated from inside `visit`; collect ids first
    /// when entries have to be removed.
    pub fn for_each<B, F>(&self, mut visit: F) -> Option<B>
    where
        F: FnMut(u32, &T) -> ControlFlow<B>,
    {
        for (&id, owner) in &self.used {
            if let ControlFlow::Break(b) = visit(id, owner) {
                return Some(b);
            }
        }
        None
    }

    /// Drops all bookkeeping and hands back every owner, leaving a fresh registry.
    pub fn remove_all(&mut self) -> Vec<(u32, T)> {
        self.ranges = vec![FreeRange::new(0, ID_LIMIT)];
        std::mem::take(&mut self.used).into_iter().collect()
    }

    /// Tears the registry down, handing back the owners still registered.
    #[must_use]
    pub fn destroy(mut self) -> Vec<(u32, T)> {
        self.remove_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn allocates_sequentially_from_start() {
        let mut idr = IdAllocator::new();
        assert_eq!(idr.allocate(1, "a").unwrap(), 1);
        assert_eq!(idr.allocate(1, "b").unwrap(), 2);
        assert_eq!(idr.allocate(1, "c").unwrap(), 3);
        assert_eq!(*idr.lookup(2).unwrap(), "b");
        assert!(idr.lookup(0).is_err());
    }

    #[test]
    fn negative_start_is_invalid() {
        let mut idr = IdAllocator::new();
        assert!(matches!(
            idr.allocate(-1, ()),
            Err(MmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn freed_ids_are_reused_lifo() {
        let mut idr = IdAllocator::new();
        for _ in 0..5 {
            idr.allocate(1, ()).unwrap();
        }
        idr.remove(2).unwrap();
        idr.remove(4).unwrap();
        assert_eq!(idr.allocate(1, ()).unwrap(), 4);
        assert_eq!(idr.allocate(1, ()).unwrap(), 2);
        assert_eq!(idr.allocate(1, ()).unwrap(), 6);
    }

    #[test]
    fn remove_unknown_is_not_found() {
        let mut idr: IdAllocator<()> = IdAllocator::new();
        assert!(matches!(idr.remove(7), Err(MmError::NotFound(_))));
    }

    #[test]
    fn split_hands_over_freed_ids() {
        let mut idr = IdAllocator::new();
        for _ in 0..10 {
            idr.allocate(0, ()).unwrap();
        }
        idr.remove(8).unwrap();
        idr.remove(3).unwrap();

        // Splitting at 5 moves 8 (and the unused counter) into the new range.
        assert_eq!(idr.allocate(5, ()).unwrap(), 8);
        assert_eq!(idr.allocate(5, ()).unwrap(), 10);
        assert_eq!(idr.allocate(0, ()).unwrap(), 3);
    }

    #[test]
    fn lower_range_falls_through_to_higher_one() {
        let mut idr = IdAllocator::new();
        assert_eq!(idr.allocate(3, ()).unwrap(), 3);
        // [0, 3) is untouched.
        assert_eq!(idr.allocate(0, ()).unwrap(), 0);
        assert_eq!(idr.allocate(0, ()).unwrap(), 1);
        assert_eq!(idr.allocate(0, ()).unwrap(), 2);
        // [0, 3) is full now, so the search moves into [3, ..).
        assert_eq!(idr.allocate(0, ()).unwrap(), 4);
    }

    #[test]
    fn replace_and_iterate_in_order() {
        let mut idr = IdAllocator::new();
        idr.allocate(10, 'x').unwrap();
        idr.allocate(1, 'y').unwrap();
        idr.allocate(1, 'z').unwrap();
        assert_eq!(idr.replace(10, 'w').unwrap(), 'x');

        let seen: Vec<_> = idr.iter().map(|(id, &c)| (id, c)).collect();
        assert_eq!(seen, vec![(1, 'y'), (2, 'z'), (10, 'w')]);

        let first_z = idr.for_each(|id, &c| {
            if c == 'z' {
                ControlFlow::Break(id)
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(first_z, Some(2));
    }

    #[test]
    fn remove_all_resets() {
        let mut idr = IdAllocator::new();
        idr.allocate(1, 1).unwrap();
        idr.allocate(1, 2).unwrap();
        let drained = idr.remove_all();
        assert_eq!(drained, vec![(1, 1), (2, 2)]);
        assert!(idr.is_empty());
        assert_eq!(idr.allocate(1, 3).unwrap(), 1);
        assert_eq!(idr.destroy(), vec![(1, 3)]);
    }

    proptest! {
        #[test]
        fn never_hands_out_a_live_id(ops in prop::collection::vec((any::<bool>(), 0i32..64), 1..200)) {
            let mut idr = IdAllocator::new();
            let mut live = BTreeSet::new();

            for (alloc, arg) in ops {
                if alloc || live.is_empty() {
                    let id = idr.allocate(arg, ()).unwrap();
                    prop_assert!(id >= arg as u32);
                    prop_assert!(live.insert(id), "id {} handed out twice", id);
                } else {
                    let victim = *live.iter().nth(arg as usize % live.len()).unwrap();
                    idr.remove(victim).unwrap();
                    live.remove(&victim);
                }
                prop_assert_eq!(idr.len(), live.len());
            }
        }
    }
}
