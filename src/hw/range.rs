use super::{BlockRange, Extent, RangeAllocator};
use std::collections::BTreeMap;

/// First-fit block allocator over a flat pool.
///
/// Prefers a single hole large enough for the whole request; when the pool is
/// too fragmented for that, the request is served from several holes in address
/// order. A reservation therefore only fails when fewer than `block_count`
/// blocks are free in total.
#[derive(Debug)]
pub struct BlockRangeAllocator {
    total_blocks: u32,

    // Tracks occupied extents: First block -> Count
    occupied: BTreeMap<u32, u32>,
    used_blocks: u32,
}

impl BlockRangeAllocator {
    #[must_use]
    pub const fn new(total_blocks: u32) -> Self {
        Self {
            total_blocks,
            occupied: BTreeMap::new(),
            used_blocks: 0,
        }
    }

    #[must_use]
    pub const fn free_blocks(&self) -> u32 {
        self.total_blocks - self.used_blocks
    }

    /// Free holes in address order.
    fn holes(&self) -> Vec<Extent> {
        let mut holes = Vec::new();
        let mut cursor = 0u32;

        for (&start, &count) in &self.occupied {
            if start > cursor {
                holes.push(Extent {
                    first: cursor,
                    count: start - cursor,
                });
            }
            cursor = start + count;
        }

        if cursor < self.total_blocks {
            holes.push(Extent {
                first: cursor,
                count: self.total_blocks - cursor,
            });
        }
        holes
    }
}

impl RangeAllocator for BlockRangeAllocator {
    fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    fn reserve(&mut self, block_count: u32) -> Option<BlockRange> {
        if block_count == 0 || block_count > self.free_blocks() {
            return None;
        }

        let holes = self.holes();

        let extents = if let Some(hole) = holes.iter().find(|h| h.count >= block_count) {
            vec![Extent {
                first: hole.first,
                count: block_count,
            }]
        } else {
            // No single hole is big enough: stitch the request together.
            let mut remaining = block_count;
            let mut extents = Vec::new();
            for hole in holes {
                if remaining == 0 {
                    break;
                }
                let take = hole.count.min(remaining);
                extents.push(Extent {
                    first: hole.first,
                    count: take,
                });
                remaining -= take;
            }
            if remaining > 0 {
                return None;
            }
            extents
        };

        for extent in &extents {
            self.occupied.insert(extent.first, extent.count);
        }
        self.used_blocks += block_count;
        Some(BlockRange::new(extents))
    }

    fn release(&mut self, range: BlockRange) {
        for extent in range.extents() {
            match self.occupied.remove(&extent.first) {
                Some(count) if count == extent.count => self.used_blocks -= count,
                Some(count) => {
                    log::warn!(
                        "Released extent {}+{} but {}+{} was tracked",
                        extent.first,
                        extent.count,
                        extent.first,
                        count
                    );
                    self.used_blocks -= count;
                }
                None => log::warn!(
                    "Tried to release extent {}+{} which was not tracked",
                    extent.first,
                    extent.count
                ),
            }
        }
    }
}
