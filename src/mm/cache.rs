//! The cache directory: which buffer objects hold VRAM blocks, and who goes
//! when the pool runs dry.
//!
//! Replacement is CAR (Clock with Adaptive Replacement) applied to whole buffer
//! objects instead of pages:
//!
//! - `T1` holds objects seen once since placement, `T2` objects that were
//!   re-referenced. Both are resident.
//! - `B1` and `B2` are ghost lists: the history of objects evicted from `T1`
//!   and `T2`. They hold no blocks.
//! - `p` is the target size of `T1` in blocks. A hit in `B1` grows it, a hit
//!   in `B2` shrinks it.
//! - Pinned objects are parked on their own list and never considered for
//!   eviction.
//!
//! Lists are intrusive: each object carries its `prev`/`next` arena ids.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{MmError, MmResult};
use crate::hw::{
    BackingStoreProvider, RangeAllocator, VramAperture, copy_from_vram, copy_to_vram,
};
use crate::mm::bo::{BoId, BufferObject, CacheClass, ChannelBinding, Domain};
use crate::utils::blocks_for;
use std::collections::HashMap;

/// Where an object is and, if it holds blocks, at which pool offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub domain: Domain,
    /// Byte offset of the object's first block, while resident.
    pub offset: Option<u64>,
}

/// Snapshot of the directory counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub t1_blocks: u32,
    pub t2_blocks: u32,
    pub b1_blocks: u32,
    pub b2_blocks: u32,
    pub pinned_blocks: u32,
    pub free_blocks: u32,
    pub total_blocks: u32,
    /// Adaptive target for `T1`, in blocks.
    pub target_t1: u32,
    pub objects: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct BoList {
    head: Option<BoId>,
    tail: Option<BoId>,
    len: usize,
    blocks: u32,
}

const T1: usize = 0;
const T2: usize = 1;
const B1: usize = 2;
const B2: usize = 3;
const PINNED: usize = 4;

pub struct CacheDirectory {
    objects: HashMap<BoId, BufferObject>,
    next_id: u64,

    // Indexed by `CacheClass::slot`.
    lists: [BoList; 5],

    total_blocks: u32,
    free_blocks: u32,
    p: u32,
    block_size: u32,

    ranges: Box<dyn RangeAllocator>,
    aperture: Box<dyn VramAperture>,
    backing: Box<dyn BackingStoreProvider>,
}

impl CacheDirectory {
    #[must_use]
    pub fn new(
        block_size: u32,
        ranges: Box<dyn RangeAllocator>,
        aperture: Box<dyn VramAperture>,
        backing: Box<dyn BackingStoreProvider>,
    ) -> Self {
        let total_blocks = ranges.total_blocks();
        Self {
            objects: HashMap::new(),
            next_id: 1,
            lists: [BoList::default(); 5],
            total_blocks,
            free_blocks: total_blocks,
            p: 0,
            block_size,
            ranges,
            aperture,
            backing,
        }
    }

    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            t1_blocks: self.lists[T1].blocks,
            t2_blocks: self.lists[T2].blocks,
            b1_blocks: self.lists[B1].blocks,
            b2_blocks: self.lists[B2].blocks,
            pinned_blocks: self.lists[PINNED].blocks,
            free_blocks: self.free_blocks,
            total_blocks: self.total_blocks,
            target_t1: self.p,
            objects: self.objects.len(),
        }
    }

    /// # Errors
    /// `NotFound` if `id` was destroyed or never existed.
    pub fn get(&self, id: BoId) -> MmResult<&BufferObject> {
        self.objects
            .get(&id)
            .ok_or_else(|| MmError::NotFound(format!("buffer object {}", id.0)))
    }

    fn get_mut(&mut self, id: BoId) -> MmResult<&mut BufferObject> {
        self.objects
            .get_mut(&id)
            .ok_or_else(|| MmError::NotFound(format!("buffer object {}", id.0)))
    }

    /// Arena ids on `class`'s list, head first.
    #[must_use]
    pub fn list(&self, class: CacheClass) -> Vec<BoId> {
        let Some(slot) = class.slot() else {
            return self
                .objects
                .iter()
                .filter(|(_, bo)| bo.class == CacheClass::Untracked)
                .map(|(&id, _)| id)
                .collect();
        };

        let mut out = Vec::with_capacity(self.lists[slot].len);
        let mut cursor = self.lists[slot].head;
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.objects.get(&id).and_then(|bo| bo.link.next);
        }
        out
    }

    #[must_use]
    pub fn placement(&self, id: BoId) -> Option<Placement> {
        let bo = self.objects.get(&id)?;
        Some(Placement {
            domain: bo.domain,
            offset: bo
                .range
                .as_ref()
                .and_then(|r| r.first_block())
                .map(|b| u64::from(b) * u64::from(self.block_size)),
        })
    }

    // ===========================================================================================
    // Intrusive lists
    // ===========================================================================================

    fn push_tail(&mut self, id: BoId, class: CacheClass) {
        let Some(slot) = class.slot() else {
            return;
        };
        let old_tail = self.lists[slot].tail;

        let Some(bo) = self.objects.get_mut(&id) else {
            return;
        };
        debug_assert_eq!(bo.class, CacheClass::Untracked);
        bo.class = class;
        bo.link.prev = old_tail;
        bo.link.next = None;
        let blocks = bo.block_count;

        match old_tail.and_then(|t| self.objects.get_mut(&t)) {
            Some(tail) => tail.link.next = Some(id),
            None => self.lists[slot].head = Some(id),
        }

        let list = &mut self.lists[slot];
        list.tail = Some(id);
        list.len += 1;
        list.blocks += blocks;
    }

    fn unlink(&mut self, id: BoId) {
        let Some(bo) = self.objects.get_mut(&id) else {
            return;
        };
        let Some(slot) = bo.class.slot() else {
            return;
        };
        let link = std::mem::take(&mut bo.link);
        let blocks = bo.block_count;
        bo.class = CacheClass::Untracked;

        match link.prev.and_then(|p| self.objects.get_mut(&p)) {
            Some(prev) => prev.link.next = link.next,
            None => self.lists[slot].head = link.next,
        }
        match link.next.and_then(|n| self.objects.get_mut(&n)) {
            Some(next) => next.link.prev = link.prev,
            None => self.lists[slot].tail = link.prev,
        }

        let list = &mut self.lists[slot];
        list.len -= 1;
        list.blocks -= blocks;
    }

    fn requeue(&mut self, id: BoId, class: CacheClass) {
        self.unlink(id);
        self.push_tail(id, class);
    }

    // ===========================================================================================
    // Object lifetime
    // ===========================================================================================

    /// Creates an unplaced object of `size` bytes backed by a fresh shadow copy.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty or oversized object; provider errors otherwise.
    pub fn create(&mut self, size: u64) -> MmResult<BoId> {
        if size == 0 {
            return Err(MmError::InvalidArgument("zero-sized object".into()));
        }
        let block_count = u32::try_from(blocks_for(size, self.block_size))
            .map_err(|_| MmError::InvalidArgument(format!("object of {size} bytes")))?;
        let shadow_len = usize::try_from(u64::from(block_count) * u64::from(self.block_size))
            .map_err(|_| MmError::InvalidArgument(format!("object of {size} bytes")))?;

        let shadow = self.backing.allocate(shadow_len)?;

        let id = BoId(self.next_id);
        self.next_id += 1;
        self.objects
            .insert(id, BufferObject::new(size, block_count, shadow));
        Ok(id)
    }

    /// Releases the object's blocks and drops its shadow copy.
    ///
    /// # Errors
    /// `NotFound` if `id` is unknown.
    pub fn destroy(&mut self, id: BoId) -> MmResult<()> {
        self.release(id)?;
        self.objects.remove(&id);
        Ok(())
    }

    /// Returns every block held by `id` to the pool and takes it off every list.
    ///
    /// # Errors
    /// `NotFound` if `id` is unknown.
    pub fn release(&mut self, id: BoId) -> MmResult<()> {
        let bo = self.get_mut(id)?;
        let range = bo.range.take();
        let blocks = bo.block_count;
        bo.prior_class = None;
        bo.referenced = false;
        bo.swapped_out = false;

        self.unlink(id);

        if let Some(range) = range {
            self.ranges.release(range);
            self.free_blocks += blocks;
        }
        Ok(())
    }

    // ===========================================================================================
    // Replacement
    // ===========================================================================================

    /// Reserves blocks for `id`, evicting other objects if the pool is short.
    ///
    /// # Errors
    /// - `OutOfMemory` if evicting every unpinned object still would not free enough blocks.
    /// - `InvalidArgument` if the object already holds blocks.
    /// - `Exhausted` if the range allocator disagrees with the block accounting.
    pub fn reserve(&mut self, id: BoId, pin_immediately: bool) -> MmResult<Placement> {
        let bo = self.get(id)?;
        let n = bo.block_count;
        let class = bo.class;

        if bo.range.is_some() {
            return Err(MmError::InvalidArgument(format!(
                "buffer object {} already holds blocks",
                id.0
            )));
        }
        if n > self.total_blocks {
            return Err(MmError::OutOfMemory);
        }

        if self.free_blocks < n {
            let evictable = self.lists[T1].blocks + self.lists[T2].blocks;
            if self.free_blocks + evictable < n {
                log::debug!(
                    "Cannot place {n} blocks: {} free, {evictable} evictable",
                    self.free_blocks
                );
                return Err(MmError::OutOfMemory);
            }

            self.evict(n)?;

            if !class.is_ghost() {
                self.trim_ghosts();
            }
        }

        let Some(range) = self.ranges.reserve(n) else {
            log::error!(
                "Range allocator refused {n} blocks with {} accounted free",
                self.free_blocks
            );
            return Err(MmError::Exhausted(self.free_blocks));
        };

        match class {
            CacheClass::B1 => {
                let b1 = self.lists[B1].blocks.max(1);
                let delta = (self.lists[B2].blocks / b1).max(1);
                self.p = self.p.saturating_add(delta).min(self.total_blocks);
                log::debug!("B1 hit on {}: p -> {}", id.0, self.p);
                self.requeue(id, CacheClass::T2);
            }
            CacheClass::B2 => {
                let b2 = self.lists[B2].blocks.max(1);
                let delta = (self.lists[B1].blocks / b2).max(1);
                self.p = self.p.saturating_sub(delta);
                log::debug!("B2 hit on {}: p -> {}", id.0, self.p);
                self.requeue(id, CacheClass::T2);
            }
            _ => {
                self.unlink(id);
                self.push_tail(id, CacheClass::T1);
            }
        }

        self.free_blocks -= n;
        let bo = self.get_mut(id)?;
        bo.range = Some(range);
        bo.referenced = false;
        bo.swapped_out = false;

        if pin_immediately {
            self.pin(id)?;
        }

        self.placement(id)
            .ok_or_else(|| MmError::NotFound(format!("buffer object {}", id.0)))
    }

    /// Evicts from the heads of `T1`/`T2` until at least `needed` blocks are free.
    ///
    /// Callers check beforehand that enough blocks are evictable; the sweep then
    /// terminates because every referenced object is given exactly one second
    /// chance before it becomes a victim.
    fn evict(&mut self, needed: u32) -> MmResult<()> {
        while self.free_blocks < needed {
            let t1 = self.lists[T1];
            let t2 = self.lists[T2];
            let from_t1 = t1.head.is_some() && (t1.blocks >= self.p.max(1) || t2.head.is_none());

            let Some(victim) = (if from_t1 { t1.head } else { t2.head }) else {
                return Err(MmError::OutOfMemory);
            };

            let bo = self.get_mut(victim)?;
            if bo.referenced {
                // Second chance: clear and move to the frequency side.
                bo.referenced = false;
                self.requeue(victim, CacheClass::T2);
                continue;
            }

            let ghost = if from_t1 {
                CacheClass::B1
            } else {
                CacheClass::B2
            };
            self.swap_out(victim, ghost)?;
        }
        Ok(())
    }

    /// Writes a resident object back to its shadow, frees its blocks and
    /// leaves its history on `ghost`.
    fn swap_out(&mut self, id: BoId, ghost: CacheClass) -> MmResult<()> {
        let block_size = self.block_size;
        let bo = self
            .objects
            .get_mut(&id)
            .ok_or_else(|| MmError::NotFound(format!("buffer object {}", id.0)))?;

        if let Some(range) = bo.range.as_ref() {
            copy_from_vram(
                self.aperture.as_ref(),
                range,
                block_size,
                0,
                bo.shadow.as_mut_slice(),
            )?;
        }

        let range = bo.range.take();
        let blocks = bo.block_count;
        bo.swapped_out = true;
        bo.referenced = false;

        if let Some(range) = range {
            self.ranges.release(range);
            self.free_blocks += blocks;
        }
        self.requeue(id, ghost);

        log::debug!("Evicted {} ({blocks} blocks) to {ghost:?}", id.0);
        Ok(())
    }

    /// Bounds the ghost history after an eviction made room for a new object.
    fn trim_ghosts(&mut self) {
        let [t1, t2, b1, b2, _] = self.lists;
        let total = u64::from(self.total_blocks);

        let victim = if u64::from(b1.blocks) + u64::from(t1.blocks) >= total {
            b1.head
        } else if u64::from(t1.blocks)
            + u64::from(t2.blocks)
            + u64::from(b1.blocks)
            + u64::from(b2.blocks)
            >= 2 * total
        {
            b2.head
        } else {
            None
        };

        if let Some(id) = victim {
            log::debug!("Dropping ghost {}", id.0);
            self.unlink(id);
        }
    }

    // ===========================================================================================
    // Pinning
    // ===========================================================================================

    /// Makes a resident object non-evictable.
    ///
    /// # Errors
    /// `Busy` if already pinned, `InvalidArgument` if it holds no blocks.
    pub fn pin(&mut self, id: BoId) -> MmResult<()> {
        let bo = self.get_mut(id)?;
        match bo.class {
            CacheClass::Pinned => Err(MmError::Busy),
            class @ (CacheClass::T1 | CacheClass::T2) => {
                bo.prior_class = Some(class);
                self.requeue(id, CacheClass::Pinned);
                Ok(())
            }
            _ => Err(MmError::InvalidArgument(format!(
                "buffer object {} is not resident",
                id.0
            ))),
        }
    }

    /// Returns a pinned object to the list it came from, marked as referenced.
    ///
    /// # Errors
    /// `InvalidArgument` if the object is not pinned.
    pub fn unpin(&mut self, id: BoId) -> MmResult<()> {
        let bo = self.get_mut(id)?;
        if bo.class != CacheClass::Pinned {
            return Err(MmError::InvalidArgument(format!(
                "buffer object {} is not pinned",
                id.0
            )));
        }
        let prior = bo.prior_class.take().unwrap_or(CacheClass::T1);
        bo.referenced = true;
        self.requeue(id, prior);
        Ok(())
    }

    /// Prepares an object for GPU or CPU access and pins it.
    ///
    /// A swapped-out object gets new blocks and its contents back from the
    /// shadow; a resident one is marked referenced. Touching an object that is
    /// already pinned only refreshes the referenced bit.
    ///
    /// # Errors
    /// `InvalidArgument` if the object is not in the VRAM domain; reservation errors otherwise.
    pub fn touch(&mut self, id: BoId) -> MmResult<Placement> {
        let bo = self.get_mut(id)?;
        if bo.domain != Domain::Vram {
            return Err(MmError::InvalidArgument(format!(
                "buffer object {} is not placed in VRAM",
                id.0
            )));
        }

        if bo.swapped_out || bo.range.is_none() {
            self.reserve(id, true)?;
            self.restore(id)?;
        } else {
            bo.referenced = true;
            if bo.class != CacheClass::Pinned {
                self.pin(id)?;
            }
        }

        self.placement(id)
            .ok_or_else(|| MmError::NotFound(format!("buffer object {}", id.0)))
    }

    /// Copies the shadow into the object's blocks.
    fn restore(&mut self, id: BoId) -> MmResult<()> {
        let block_size = self.block_size;
        let bo = self
            .objects
            .get(&id)
            .ok_or_else(|| MmError::NotFound(format!("buffer object {}", id.0)))?;
        if let Some(range) = bo.range.as_ref() {
            copy_to_vram(
                self.aperture.as_mut(),
                range,
                block_size,
                0,
                bo.shadow.as_slice(),
            )?;
        }
        Ok(())
    }

    // ===========================================================================================
    // Domains and data
    // ===========================================================================================

    /// Moves an object between domains, copying its contents.
    ///
    /// # Errors
    /// `Busy` if the object is pinned; reservation errors when moving into VRAM.
    pub fn move_to(&mut self, id: BoId, domain: Domain) -> MmResult<Placement> {
        let bo = self.get(id)?;
        let from = bo.domain;

        if from == domain {
            return self
                .placement(id)
                .ok_or_else(|| MmError::NotFound(format!("buffer object {}", id.0)));
        }
        if bo.class == CacheClass::Pinned {
            return Err(MmError::Busy);
        }

        match (from, domain) {
            (_, Domain::Vram) => {
                self.reserve(id, false)?;
                self.restore(id)?;
            }
            (Domain::Vram, _) => {
                self.write_back(id)?;
                self.release(id)?;
            }
            // Both sides live in system memory.
            _ => {}
        }

        self.get_mut(id)?.domain = domain;
        log::debug!("Moved {} from {from:?} to {domain:?}", id.0);
        self.placement(id)
            .ok_or_else(|| MmError::NotFound(format!("buffer object {}", id.0)))
    }

    /// Copies resident blocks into the shadow.
    fn write_back(&mut self, id: BoId) -> MmResult<()> {
        let block_size = self.block_size;
        let bo = self
            .objects
            .get_mut(&id)
            .ok_or_else(|| MmError::NotFound(format!("buffer object {}", id.0)))?;
        if let Some(range) = bo.range.as_ref() {
            copy_from_vram(
                self.aperture.as_ref(),
                range,
                block_size,
                0,
                bo.shadow.as_mut_slice(),
            )?;
        }
        Ok(())
    }

    fn check_access(bo: &BufferObject, offset: u64, len: usize) -> MmResult<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= bo.size => Ok(()),
            _ => Err(MmError::InvalidArgument(format!(
                "access 0x{offset:x}+0x{len:x} beyond object of 0x{:x} bytes",
                bo.size
            ))),
        }
    }

    /// Reads object contents from VRAM when resident, from the shadow otherwise.
    ///
    /// # Errors
    /// `InvalidArgument` if the access runs past the end of the object.
    pub fn read(&self, id: BoId, offset: u64, buf: &mut [u8]) -> MmResult<()> {
        let bo = self.get(id)?;
        Self::check_access(bo, offset, buf.len())?;

        if let Some(range) = bo.range.as_ref() {
            return copy_from_vram(self.aperture.as_ref(), range, self.block_size, offset, buf);
        }
        let start = offset as usize;
        buf.copy_from_slice(&bo.shadow.as_slice()[start..start + buf.len()]);
        Ok(())
    }

    /// Writes object contents to VRAM when resident, to the shadow otherwise.
    ///
    /// # Errors
    /// `InvalidArgument` if the access runs past the end of the object.
    pub fn write(&mut self, id: BoId, offset: u64, data: &[u8]) -> MmResult<()> {
        let block_size = self.block_size;
        let bo = self
            .objects
            .get_mut(&id)
            .ok_or_else(|| MmError::NotFound(format!("buffer object {}", id.0)))?;
        Self::check_access(bo, offset, data.len())?;

        if let Some(range) = bo.range.as_ref() {
            return copy_to_vram(self.aperture.as_mut(), range, block_size, offset, data);
        }
        let start = offset as usize;
        bo.shadow.as_mut_slice()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// # Errors
    /// `NotFound` if `id` is unknown.
    pub fn set_binding(&mut self, id: BoId, binding: Option<ChannelBinding>) -> MmResult<()> {
        self.get_mut(id)?.binding = binding;
        Ok(())
    }

    // ===========================================================================================
    // GPU activity
    // ===========================================================================================

    /// Records that the submission `seqno` references `id`.
    ///
    /// # Errors
    /// `Busy` if the object is already referenced by outstanding work.
    pub fn mark_active(&mut self, id: BoId, seqno: u32) -> MmResult<()> {
        let bo = self.get_mut(id)?;
        if bo.last_seqno != 0 {
            return Err(MmError::Busy);
        }
        bo.last_seqno = seqno;
        Ok(())
    }

    /// Clears the object's fence and drops its GPU pin.
    ///
    /// # Errors
    /// `NotFound` if `id` is unknown.
    pub fn retire(&mut self, id: BoId) -> MmResult<()> {
        let bo = self.get_mut(id)?;
        bo.last_seqno = 0;
        if bo.class == CacheClass::Pinned {
            self.unpin(id)?;
        }
        Ok(())
    }
}
