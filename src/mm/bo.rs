use crate::error::{MmError, MmResult};
use crate::hw::{BackingStore, BlockRange};
use crate::mm::fence::ChannelId;

/// Stable arena index of a buffer object inside the cache directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoId(pub(crate) u64);

impl BoId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Where an object's contents currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Cpu,
    Vram,
    Gart,
}

impl Domain {
    pub const CPU_BIT: u32 = 1 << 0;
    pub const VRAM_BIT: u32 = 1 << 1;
    pub const GART_BIT: u32 = 1 << 2;

    /// Converts to the domain mask used on the ioctl boundary.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Cpu => Self::CPU_BIT,
            Self::Vram => Self::VRAM_BIT,
            Self::Gart => Self::GART_BIT,
        }
    }

    /// # Errors
    /// `InvalidArgument` unless exactly one known domain bit is set.
    pub fn from_bits(bits: u32) -> MmResult<Self> {
        match bits {
            Self::CPU_BIT => Ok(Self::Cpu),
            Self::VRAM_BIT => Ok(Self::Vram),
            Self::GART_BIT => Ok(Self::Gart),
            _ => Err(MmError::InvalidArgument(format!(
                "invalid domain mask 0x{bits:x}"
            ))),
        }
    }
}

/// Which cache-directory list an object sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    Untracked,
    /// Resident, seen once since placement.
    T1,
    /// Resident, re-referenced.
    T2,
    /// Ghost of an object evicted from T1.
    B1,
    /// Ghost of an object evicted from T2.
    B2,
    /// Resident and not evictable.
    Pinned,
}

impl CacheClass {
    pub(crate) const fn slot(self) -> Option<usize> {
        match self {
            Self::Untracked => None,
            Self::T1 => Some(0),
            Self::T2 => Some(1),
            Self::B1 => Some(2),
            Self::B2 => Some(3),
            Self::Pinned => Some(4),
        }
    }

    #[must_use]
    pub const fn is_ghost(self) -> bool {
        matches!(self, Self::B1 | Self::B2)
    }
}

/// Mapping of an object into a submission channel's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    pub channel: ChannelId,
    pub gpu_va: u64,
    pub tile_flags: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Link {
    pub prev: Option<BoId>,
    pub next: Option<BoId>,
}

/// A buffer object as seen by the cache directory.
#[derive(Debug)]
pub struct BufferObject {
    pub(crate) range: Option<BlockRange>,
    pub(crate) size: u64,
    pub(crate) block_count: u32,
    pub(crate) domain: Domain,
    pub(crate) class: CacheClass,
    /// Class to go back to on unpin. Only set while `class == Pinned`.
    pub(crate) prior_class: Option<CacheClass>,
    pub(crate) referenced: bool,
    pub(crate) swapped_out: bool,
    pub(crate) binding: Option<ChannelBinding>,
    pub(crate) last_seqno: u32,
    pub(crate) shadow: Box<dyn BackingStore>,
    pub(crate) link: Link,
}

impl BufferObject {
    pub(crate) fn new(size: u64, block_count: u32, shadow: Box<dyn BackingStore>) -> Self {
        Self {
            range: None,
            size,
            block_count,
            domain: Domain::Cpu,
            class: CacheClass::Untracked,
            prior_class: None,
            referenced: false,
            swapped_out: false,
            binding: None,
            last_seqno: 0,
            shadow,
            link: Link::default(),
        }
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn block_count(&self) -> u32 {
        self.block_count
    }

    #[must_use]
    pub const fn domain(&self) -> Domain {
        self.domain
    }

    #[must_use]
    pub const fn cache_class(&self) -> CacheClass {
        self.class
    }

    #[must_use]
    pub const fn prior_class(&self) -> Option<CacheClass> {
        self.prior_class
    }

    #[must_use]
    pub const fn is_referenced(&self) -> bool {
        self.referenced
    }

    #[must_use]
    pub const fn is_swapped_out(&self) -> bool {
        self.swapped_out
    }

    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        matches!(self.class, CacheClass::Pinned)
    }

    /// True while the object holds blocks in the pool.
    #[must_use]
    pub const fn is_resident(&self) -> bool {
        self.range.is_some()
    }

    #[must_use]
    pub const fn range(&self) -> Option<&BlockRange> {
        self.range.as_ref()
    }

    #[must_use]
    pub const fn binding(&self) -> Option<ChannelBinding> {
        self.binding
    }

    #[must_use]
    pub const fn last_seqno(&self) -> u32 {
        self.last_seqno
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_bits_round_trip() {
        for d in [Domain::Cpu, Domain::Vram, Domain::Gart] {
            assert_eq!(Domain::from_bits(d.bits()).unwrap(), d);
        }
        assert!(Domain::from_bits(Domain::CPU_BIT | Domain::VRAM_BIT).is_err());
        assert!(Domain::from_bits(0).is_err());
    }
}
