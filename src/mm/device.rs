#![allow(clippy::cast_possible_truncation)]

use crate::error::{MmError, MmResult};
use crate::hw::range::BlockRangeAllocator;
use crate::hw::sysmem::{HostAperture, SysmemProvider};
use crate::hw::timer::SystemClock;
use crate::hw::{BackingStoreProvider, Clock, RangeAllocator, SubmissionChannel, VramAperture};
use crate::mm::bo::{BoId, CacheClass, ChannelBinding, Domain};
use crate::mm::cache::{CacheDirectory, CacheStats, Placement};
use crate::mm::fence::{ChannelId, FenceTracker, RetireWorker};
use crate::mm::gem::{FileContext, GemObject, NameTable, ObjectCounters};
use crate::utils::{is_block_aligned, lock};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const DEFAULT_RETIRE_INTERVAL: Duration = Duration::from_secs(1);

// ===============================================================================================
// Configuration
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub total_blocks: u32,
    pub block_size: u32,
    /// Delay between a submission and the first check for its completion.
    pub retire_interval: Duration,
}

impl DeviceConfig {
    #[must_use]
    pub const fn pool_bytes(&self) -> u64 {
        self.total_blocks as u64 * self.block_size as u64
    }
}

/// Builds a [`Device`]. Every hardware collaborator defaults to its software stand-in.
pub struct DeviceBuilder {
    total_blocks: u32,
    block_size: u32,
    retire_interval: Duration,

    ranges: Option<Box<dyn RangeAllocator>>,
    aperture: Option<Box<dyn VramAperture>>,
    backing: Option<Box<dyn BackingStoreProvider>>,
    clock: Option<Arc<dyn Clock>>,
}

impl DeviceBuilder {
    #[must_use]
    pub const fn new(total_blocks: u32) -> Self {
        Self {
            total_blocks,
            block_size: DEFAULT_BLOCK_SIZE,
            retire_interval: DEFAULT_RETIRE_INTERVAL,
            ranges: None,
            aperture: None,
            backing: None,
            clock: None,
        }
    }

    #[must_use]
    pub const fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub const fn with_retire_interval(mut self, interval: Duration) -> Self {
        self.retire_interval = interval;
        self
    }

    #[must_use]
    pub fn with_range_allocator(mut self, ranges: Box<dyn RangeAllocator>) -> Self {
        self.ranges = Some(ranges);
        self
    }

    #[must_use]
    pub fn with_aperture(mut self, aperture: Box<dyn VramAperture>) -> Self {
        self.aperture = Some(aperture);
        self
    }

    #[must_use]
    pub fn with_backing_store(mut self, backing: Box<dyn BackingStoreProvider>) -> Self {
        self.backing = Some(backing);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validates the configuration and creates the device.
    ///
    /// # Errors
    /// - `InvalidArgument` for an empty pool, a block size that is not a power of
    ///   two, or collaborators that disagree with the pool size.
    /// - `Io` if the default aperture mapping cannot be created.
    pub fn build(self) -> MmResult<Device> {
        if self.total_blocks == 0 {
            return Err(MmError::InvalidArgument("empty VRAM pool".into()));
        }
        if !self.block_size.is_power_of_two() {
            return Err(MmError::InvalidArgument(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }

        let config = DeviceConfig {
            total_blocks: self.total_blocks,
            block_size: self.block_size,
            retire_interval: self.retire_interval,
        };

        let ranges: Box<dyn RangeAllocator> = self
            .ranges
            .unwrap_or_else(|| Box::new(BlockRangeAllocator::new(config.total_blocks)));
        if ranges.total_blocks() != config.total_blocks {
            return Err(MmError::InvalidArgument(format!(
                "range allocator manages {} blocks, device has {}",
                ranges.total_blocks(),
                config.total_blocks
            )));
        }

        let aperture: Box<dyn VramAperture> = match self.aperture {
            Some(aperture) => aperture,
            None => {
                let bytes = usize::try_from(config.pool_bytes()).map_err(|_| {
                    MmError::InvalidArgument(format!("pool of {} bytes", config.pool_bytes()))
                })?;
                Box::new(HostAperture::new(bytes)?)
            }
        };
        if aperture.size() < config.pool_bytes() {
            return Err(MmError::InvalidArgument(format!(
                "aperture of 0x{:x} bytes cannot cover a pool of 0x{:x}",
                aperture.size(),
                config.pool_bytes()
            )));
        }

        let backing: Box<dyn BackingStoreProvider> =
            self.backing.unwrap_or_else(|| Box::new(SysmemProvider));
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        log::debug!(
            "VRAM pool: {} blocks of {} bytes, retire interval {:?}",
            config.total_blocks,
            config.block_size,
            config.retire_interval
        );

        Ok(Device {
            config,
            cache: Arc::new(Mutex::new(CacheDirectory::new(
                config.block_size,
                ranges,
                aperture,
                backing,
            ))),
            fences: Mutex::new(FenceTracker::new(config.retire_interval)),
            names: Arc::new(NameTable::new()),
            counters: Arc::new(ObjectCounters::default()),
            clock,
        })
    }
}

// ===============================================================================================
// Device
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub object_count: usize,
    pub object_memory: u64,
    pub cache: CacheStats,
}

/// Snapshot of one object's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
    pub name: Option<u32>,
    pub placement: Placement,
    pub cache_class: CacheClass,
    pub referenced: bool,
    pub swapped_out: bool,
    pub binding: Option<ChannelBinding>,
    pub last_seqno: u32,
}

/// Result of [`Device::exec`]: the fence seqno and where each submitted object
/// was placed, in the order the handles were given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub seqno: u32,
    pub placements: Vec<Placement>,
}

/// The memory manager of one device.
///
/// Lock order: fence tracker, then cache directory. Handle and name tables are
/// never held while taking either.
pub struct Device {
    config: DeviceConfig,
    cache: Arc<Mutex<CacheDirectory>>,
    fences: Mutex<FenceTracker>,
    names: Arc<NameTable>,
    counters: Arc<ObjectCounters>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Device {
    #[must_use]
    pub const fn config(&self) -> DeviceConfig {
        self.config
    }

    #[must_use]
    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            object_count: self.counters.objects(),
            object_memory: self.counters.memory(),
            cache: lock(&self.cache).stats(),
        }
    }

    // --- Contexts and handles -------------------------------------------------------------

    #[must_use]
    pub fn open_context(&self) -> FileContext {
        FileContext::new(Arc::clone(&self.names))
    }

    /// Releases every handle `ctx` holds. Returns how many there were.
    ///
    /// A named object whose last handle this was loses its name too.
    pub fn close_context(&self, ctx: FileContext) -> usize {
        let released = ctx.close();
        if released > 0 {
            log::debug!("Context closed with {released} open handles");
        }
        released
    }

    /// Creates a CPU-domain object of `size` bytes and returns a handle to it in `ctx`.
    ///
    /// # Errors
    /// `InvalidArgument` unless `size` is a non-zero multiple of the block size.
    pub fn create_object(&self, ctx: &FileContext, size: u64) -> MmResult<u32> {
        if size == 0 || !is_block_aligned(size, self.config.block_size) {
            return Err(MmError::InvalidArgument(format!(
                "object size 0x{size:x} is not a multiple of 0x{:x}",
                self.config.block_size
            )));
        }

        let bo = lock(&self.cache).create(size)?;
        let object = GemObject::new(
            bo,
            size,
            Arc::clone(&self.cache),
            Arc::clone(&self.counters),
        );
        ctx.create_handle(object)
    }

    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn lookup(&self, ctx: &FileContext, handle: u32) -> MmResult<Arc<GemObject>> {
        ctx.lookup(handle)
    }

    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn delete_handle(&self, ctx: &FileContext, handle: u32) -> MmResult<()> {
        ctx.delete_handle(handle)
    }

    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn object_info(&self, ctx: &FileContext, handle: u32) -> MmResult<ObjectInfo> {
        let object = ctx.lookup(handle)?;
        let cache = lock(&self.cache);
        let bo = cache.get(object.bo())?;
        let placement = cache
            .placement(object.bo())
            .ok_or_else(|| MmError::NotFound(format!("handle {handle}")))?;
        Ok(ObjectInfo {
            size: bo.size(),
            name: object.name(),
            placement,
            cache_class: bo.cache_class(),
            referenced: bo.is_referenced(),
            swapped_out: bo.is_swapped_out(),
            binding: bo.binding(),
            last_seqno: bo.last_seqno(),
        })
    }

    // --- Names ----------------------------------------------------------------------------

    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn export_name(&self, ctx: &FileContext, handle: u32) -> MmResult<u32> {
        let object = ctx.lookup(handle)?;
        self.names.export(&object)
    }

    /// Opens a new handle in `ctx` for the object exported as `name`.
    ///
    /// # Errors
    /// `NotFound` for an unknown name.
    pub fn import_name(&self, ctx: &FileContext, name: u32) -> MmResult<u32> {
        ctx.adopt(self.names.open(name)?)
    }

    /// # Errors
    /// `NotFound` for an unknown handle or an object without a name.
    pub fn release_name(&self, ctx: &FileContext, handle: u32) -> MmResult<()> {
        let object = ctx.lookup(handle)?;
        self.names.release(&object)
    }

    // --- Placement and data ---------------------------------------------------------------

    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn placement(&self, ctx: &FileContext, handle: u32) -> MmResult<Placement> {
        let object = ctx.lookup(handle)?;
        lock(&self.cache)
            .placement(object.bo())
            .ok_or_else(|| MmError::NotFound(format!("handle {handle}")))
    }

    /// Moves an object to `domain` and reports where it ended up.
    ///
    /// # Errors
    /// `Busy` if the object is pinned; `OutOfMemory` if VRAM cannot make room.
    pub fn move_object(
        &self,
        ctx: &FileContext,
        handle: u32,
        domain: Domain,
    ) -> MmResult<Placement> {
        let object = ctx.lookup(handle)?;
        lock(&self.cache).move_to(object.bo(), domain)
    }

    /// # Errors
    /// `InvalidArgument` for an access past the end of the object; `Busy` if it is
    /// pinned in VRAM.
    pub fn read(
        &self,
        ctx: &FileContext,
        handle: u32,
        offset: u64,
        buf: &mut [u8],
    ) -> MmResult<()> {
        let object = ctx.lookup(handle)?;
        let bo = object.bo();
        let mut cache = lock(&self.cache);
        Self::with_prefault(&mut cache, bo, |cache| cache.read(bo, offset, buf))
    }

    /// # Errors
    /// `InvalidArgument` for an access past the end of the object; `Busy` if it is
    /// pinned in VRAM.
    pub fn write(
        &self,
        ctx: &FileContext,
        handle: u32,
        offset: u64,
        data: &[u8],
    ) -> MmResult<()> {
        let object = ctx.lookup(handle)?;
        let bo = object.bo();
        let mut cache = lock(&self.cache);
        Self::with_prefault(&mut cache, bo, |cache| cache.write(bo, offset, data))
    }

    /// Runs `access` with a VRAM object faulted in and pinned, then returns it
    /// to normal cache management. Other domains are accessed directly.
    fn with_prefault<R>(
        cache: &mut CacheDirectory,
        bo: BoId,
        access: impl FnOnce(&mut CacheDirectory) -> MmResult<R>,
    ) -> MmResult<R> {
        let object = cache.get(bo)?;
        if object.domain() != Domain::Vram {
            return access(cache);
        }
        if object.is_pinned() {
            return Err(MmError::Busy);
        }

        cache.touch(bo)?;
        let result = access(cache);
        cache.unpin(bo)?;
        result
    }

    /// Faults a VRAM object in and pins it for direct CPU access until
    /// [`Device::set_normal`]. Objects in other domains are left as they are.
    ///
    /// # Errors
    /// `Busy` if the object is pinned or still belongs to outstanding work;
    /// reservation errors if a swapped-out object cannot be placed again.
    pub fn prefault(&self, ctx: &FileContext, handle: u32) -> MmResult<Placement> {
        let object = ctx.lookup(handle)?;
        let bo = object.bo();
        let mut cache = lock(&self.cache);
        let state = cache.get(bo)?;
        if state.last_seqno() != 0 || state.is_pinned() {
            return Err(MmError::Busy);
        }
        if state.domain() == Domain::Vram {
            return cache.touch(bo);
        }
        cache
            .placement(bo)
            .ok_or_else(|| MmError::NotFound(format!("handle {handle}")))
    }

    /// Ends CPU access started by [`Device::prefault`] and hands the object
    /// back to the replacement policy.
    ///
    /// # Errors
    /// `Busy` while GPU work references the object; `InvalidArgument` if a VRAM
    /// object is not pinned.
    pub fn set_normal(&self, ctx: &FileContext, handle: u32) -> MmResult<()> {
        let object = ctx.lookup(handle)?;
        let bo = object.bo();
        let mut cache = lock(&self.cache);
        let state = cache.get(bo)?;
        if state.last_seqno() != 0 {
            return Err(MmError::Busy);
        }
        if state.domain() != Domain::Vram {
            return Ok(());
        }
        cache.unpin(bo)
    }

    // --- Channels -------------------------------------------------------------------------

    pub fn create_channel(&self, hw: Arc<dyn SubmissionChannel>) -> ChannelId {
        let id = lock(&self.fences).create_channel(hw);
        log::debug!("Created channel {}", id.0);
        id
    }

    /// Abandons the channel's queued work and drops the GPU holds it had.
    /// Returns the number of abandoned requests.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel.
    pub fn destroy_channel(&self, channel: ChannelId) -> MmResult<usize> {
        let mut released = Vec::new();
        let abandoned = {
            let mut fences = lock(&self.fences);
            let mut cache = lock(&self.cache);
            let abandoned = fences.destroy_channel(channel, &mut cache)?;
            released.extend(abandoned.objects);
            abandoned.requests
        };
        drop(released);
        Ok(abandoned)
    }

    /// Outstanding requests on `channel`.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel.
    pub fn pending(&self, channel: ChannelId) -> MmResult<usize> {
        lock(&self.fences).pending(channel)
    }

    /// Places the object in VRAM and binds it into `channel`'s address space.
    ///
    /// # Errors
    /// `NotFound` for an unknown handle or channel; placement errors otherwise.
    pub fn chan_map(
        &self,
        ctx: &FileContext,
        handle: u32,
        channel: ChannelId,
        gpu_va: u64,
        tile_flags: u32,
    ) -> MmResult<Placement> {
        let object = ctx.lookup(handle)?;
        let fences = lock(&self.fences);
        if !fences.contains(channel) {
            return Err(MmError::NotFound(format!("channel {}", channel.0)));
        }

        let mut cache = lock(&self.cache);
        let placement = cache.move_to(object.bo(), Domain::Vram)?;
        cache.set_binding(
            object.bo(),
            Some(ChannelBinding {
                channel,
                gpu_va,
                tile_flags,
            }),
        )?;
        Ok(placement)
    }

    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn chan_unmap(&self, ctx: &FileContext, handle: u32) -> MmResult<()> {
        let object = ctx.lookup(handle)?;
        let mut cache = lock(&self.cache);
        if cache.get(object.bo())?.binding().is_none() {
            log::warn!("Unmapping handle {handle}, which is not mapped");
        }
        cache.set_binding(object.bo(), None)
    }

    // --- Submission and retirement --------------------------------------------------------

    /// Submits work referencing `handles` on `channel`.
    ///
    /// Each object is placed in VRAM and pinned, a fence is emitted, and every
    /// object is tied to the new seqno until it retires. If any step before the
    /// fence fails, objects pinned here are unpinned again. The returned
    /// [`Submission`] lists where each object was placed, in handle order.
    ///
    /// # Errors
    /// - `InvalidArgument` if a handle is listed twice.
    /// - `Busy` if an object still belongs to outstanding work.
    /// - `NotFound` for unknown handles or channel.
    /// - `OutOfMemory` if the working set does not fit in VRAM.
    pub fn exec(
        &self,
        ctx: &FileContext,
        channel: ChannelId,
        handles: &[u32],
    ) -> MmResult<Submission> {
        let objects = handles
            .iter()
            .map(|&h| ctx.lookup(h))
            .collect::<MmResult<Vec<_>>>()?;

        let mut seen = HashSet::with_capacity(objects.len());
        if !objects.iter().all(|o| seen.insert(o.bo())) {
            return Err(MmError::InvalidArgument(
                "object listed twice in one submission".into(),
            ));
        }

        let now = self.clock.now();
        let mut fences = lock(&self.fences);
        if !fences.contains(channel) {
            return Err(MmError::NotFound(format!("channel {}", channel.0)));
        }
        let mut cache = lock(&self.cache);

        let mut pinned_here = Vec::with_capacity(objects.len());
        let submitted = objects
            .iter()
            .try_for_each(|o| {
                if Self::fault_in(&mut cache, o.bo())? {
                    pinned_here.push(o.bo());
                }
                Ok::<(), MmError>(())
            })
            .and_then(|()| fences.submit(channel, now));

        let seqno = match submitted {
            Ok(seqno) => seqno,
            Err(e) => {
                for bo in pinned_here {
                    if let Err(u) = cache.unpin(bo) {
                        log::warn!("Unwinding submission on buffer object {}: {u}", bo.raw());
                    }
                }
                return Err(e);
            }
        };

        let mut placements = Vec::with_capacity(objects.len());
        for object in &objects {
            fences.mark_active(channel, seqno, Arc::clone(object), &mut cache)?;
            let placement = cache.placement(object.bo()).ok_or_else(|| {
                MmError::NotFound(format!("buffer object {}", object.bo().raw()))
            })?;
            placements.push(placement);
        }
        Ok(Submission { seqno, placements })
    }

    /// Faults `bo` into VRAM and pins it. Returns whether this call did the pinning.
    fn fault_in(cache: &mut CacheDirectory, bo: BoId) -> MmResult<bool> {
        let object = cache.get(bo)?;
        if object.last_seqno() != 0 {
            return Err(MmError::Busy);
        }
        let was_pinned = object.is_pinned();
        if object.domain() != Domain::Vram {
            cache.move_to(bo, Domain::Vram)?;
        }
        cache.touch(bo)?;
        Ok(!was_pinned)
    }

    /// Retires completed work on `channel`. Returns the number of retired requests.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel.
    pub fn retire(&self, channel: ChannelId) -> MmResult<usize> {
        let now = self.clock.now();
        let mut released = Vec::new();
        let requests = {
            let mut fences = lock(&self.fences);
            let mut cache = lock(&self.cache);
            let retired = fences.retire(channel, &mut cache, now)?;
            released.extend(retired.objects);
            retired.requests
        };
        drop(released);
        Ok(requests)
    }

    /// Retires every channel whose poll deadline has passed on the device clock.
    /// Returns the number of retired requests.
    ///
    /// # Errors
    /// Propagates retirement errors.
    pub fn poll(&self) -> MmResult<usize> {
        let now = self.clock.now();
        let mut released = Vec::new();
        let mut requests = 0;
        {
            let mut fences = lock(&self.fences);
            let mut cache = lock(&self.cache);
            for channel in fences.due_channels(now) {
                let retired = fences.retire(channel, &mut cache, now)?;
                requests += retired.requests;
                released.extend(retired.objects);
            }
        }
        drop(released);
        Ok(requests)
    }

    /// Polls on a background thread every retire interval until the worker is
    /// dropped or the device goes away.
    ///
    /// # Errors
    /// `Io` if the thread cannot be spawned.
    pub fn start_retire_worker(self: &Arc<Self>) -> MmResult<RetireWorker> {
        let device = Arc::downgrade(self);
        RetireWorker::spawn(self.config.retire_interval, move || {
            let Some(device) = device.upgrade() else {
                return false;
            };
            if let Err(e) = device.poll() {
                log::warn!("Background retirement failed: {e}");
            }
            true
        })
    }
}
