//! Interfaces to the collaborators the memory manager drives but does not own:
//! the block range allocator, the VRAM aperture, CPU shadow storage, submission
//! channels and the clock used to schedule retirement polls.
//!
//! Each trait comes with a software implementation so the core can run without
//! a device.

pub mod channel;
pub mod range;
pub mod sysmem;
pub mod timer;

use crate::error::MmResult;
use std::fmt;
use std::time::Instant;

/// A run of consecutive blocks inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub first: u32,
    pub count: u32,
}

impl Extent {
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.first + self.count
    }
}

/// Blocks reserved for one buffer object. Contiguous when it holds a single extent.
///
/// Not `Clone`: a range goes back to its allocator exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct BlockRange {
    extents: Vec<Extent>,
}

impl BlockRange {
    #[must_use]
    pub const fn new(extents: Vec<Extent>) -> Self {
        Self { extents }
    }

    #[must_use]
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Total blocks across all extents.
    #[must_use]
    pub fn blocks(&self) -> u32 {
        self.extents.iter().map(|e| e.count).sum()
    }

    /// First block of the range, used as the object's presumed offset.
    #[must_use]
    pub fn first_block(&self) -> Option<u32> {
        self.extents.first().map(|e| e.first)
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.extents.len() == 1
    }
}

/// Turns a block count into a reserved range within a flat pool of `total_blocks` units.
pub trait RangeAllocator: Send {
    /// Reserve `block_count` blocks. `None` means the pool has no room left.
    fn reserve(&mut self, block_count: u32) -> Option<BlockRange>;

    /// Return a previously reserved range.
    fn release(&mut self, range: BlockRange);

    /// Size of the managed pool in blocks.
    fn total_blocks(&self) -> u32;
}

/// CPU view of the VRAM pool (the framebuffer BAR).
pub trait VramAperture: Send {
    /// Copy `buf.len()` bytes starting at byte `offset` out of VRAM.
    fn read(&self, offset: u64, buf: &mut [u8]) -> MmResult<()>;

    /// Copy `data` into VRAM starting at byte `offset`.
    fn write(&mut self, offset: u64, data: &[u8]) -> MmResult<()>;

    /// Size of the aperture in bytes.
    fn size(&self) -> u64;
}

/// CPU-resident shadow of an object's contents.
pub trait BackingStore: Send + fmt::Debug {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// Allocates and frees shadow copies. Freeing happens when the returned box drops.
pub trait BackingStoreProvider: Send {
    fn allocate(&self, size: usize) -> MmResult<Box<dyn BackingStore>>;
}

/// A command submission channel and its hardware completion counter.
pub trait SubmissionChannel: Send + Sync {
    /// Emit a command that writes `seqno` to the completion counter once all
    /// prior work on this channel has finished.
    fn emit_fence(&self, seqno: u32) -> MmResult<()>;

    /// Last sequence number the hardware reported as completed.
    fn completed_seqno(&self) -> u32;
}

/// Time source for retirement polling.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Walks the extents of `range` and yields `(vram_offset, chunk_start, chunk_len)`
/// for the `len` bytes starting `obj_offset` bytes into the object.
fn chunks(
    range: &BlockRange,
    block_size: u32,
    obj_offset: u64,
    len: usize,
) -> Vec<(u64, usize, usize)> {
    let block_size = u64::from(block_size);
    let mut out = Vec::new();
    let mut skip = obj_offset;
    let mut done = 0usize;

    for extent in range.extents() {
        if done >= len {
            break;
        }
        let extent_bytes = u64::from(extent.count) * block_size;
        if skip >= extent_bytes {
            skip -= extent_bytes;
            continue;
        }
        let avail = (extent_bytes - skip) as usize;
        let take = avail.min(len - done);
        out.push((u64::from(extent.first) * block_size + skip, done, take));
        done += take;
        skip = 0;
    }
    out
}

/// Copies `src` into the object held in `range`, starting `obj_offset` bytes in.
///
/// # Errors
/// Propagates aperture bounds errors.
pub fn copy_to_vram(
    aperture: &mut dyn VramAperture,
    range: &BlockRange,
    block_size: u32,
    obj_offset: u64,
    src: &[u8],
) -> MmResult<()> {
    for (vram_offset, start, len) in chunks(range, block_size, obj_offset, src.len()) {
        aperture.write(vram_offset, &src[start..start + len])?;
    }
    Ok(())
}

/// Copies out of the object held in `range`, starting `obj_offset` bytes in.
///
/// # Errors
/// Propagates aperture bounds errors.
pub fn copy_from_vram(
    aperture: &dyn VramAperture,
    range: &BlockRange,
    block_size: u32,
    obj_offset: u64,
    dst: &mut [u8],
) -> MmResult<()> {
    for (vram_offset, start, len) in chunks(range, block_size, obj_offset, dst.len()) {
        aperture.read(vram_offset, &mut dst[start..start + len])?;
    }
    Ok(())
}
