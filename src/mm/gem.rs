//! Client-visible object wrappers, per-context handle tables and the global
//! name table.
//!
//! Every handle and every name holds one `Arc<GemObject>`. Outstanding GPU work
//! holds another through the fence tracker. The object's buffer is destroyed
//! when the last of them goes away. Closing the last handle of a named object
//! also drops its name.

use crate::error::{MmError, MmResult};
use crate::mm::bo::BoId;
use crate::mm::cache::CacheDirectory;
use crate::mm::idr::IdAllocator;
use crate::utils::lock;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Handles start at 1 so 0 can mean "no handle" on the ioctl boundary.
const FIRST_HANDLE: i32 = 1;
const FIRST_NAME: i32 = 1;

/// Device-wide object statistics.
#[derive(Debug, Default)]
pub struct ObjectCounters {
    objects: AtomicUsize,
    memory: AtomicU64,
}

impl ObjectCounters {
    #[must_use]
    pub fn objects(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn memory(&self) -> u64 {
        self.memory.load(Ordering::Relaxed)
    }
}

pub struct GemObject {
    bo: BoId,
    size: u64,
    // 0 while unnamed.
    name: AtomicU32,
    // Handles across all contexts.
    handles: AtomicU32,
    cache: Arc<Mutex<CacheDirectory>>,
    counters: Arc<ObjectCounters>,
}

impl fmt::Debug for GemObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GemObject")
            .field("bo", &self.bo)
            .field("size", &self.size)
            .field("name", &self.name())
            .field("handles", &self.handle_count())
            .finish_non_exhaustive()
    }
}

impl GemObject {
    /// Wraps an already created cache-directory object.
    pub(crate) fn new(
        bo: BoId,
        size: u64,
        cache: Arc<Mutex<CacheDirectory>>,
        counters: Arc<ObjectCounters>,
    ) -> Arc<Self> {
        counters.objects.fetch_add(1, Ordering::Relaxed);
        counters.memory.fetch_add(size, Ordering::Relaxed);
        Arc::new(Self {
            bo,
            size,
            name: AtomicU32::new(0),
            handles: AtomicU32::new(0),
            cache,
            counters,
        })
    }

    #[must_use]
    pub const fn bo(&self) -> BoId {
        self.bo
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Global name, once exported.
    #[must_use]
    pub fn name(&self) -> Option<u32> {
        match self.name.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    /// Open handles across all contexts.
    #[must_use]
    pub fn handle_count(&self) -> u32 {
        self.handles.load(Ordering::Acquire)
    }
}

impl Drop for GemObject {
    fn drop(&mut self) {
        if let Err(e) = lock(&self.cache).destroy(self.bo) {
            log::warn!("Destroying buffer object {}: {e}", self.bo.raw());
        }
        self.counters.objects.fetch_sub(1, Ordering::Relaxed);
        self.counters.memory.fetch_sub(self.size, Ordering::Relaxed);
    }
}

// ===============================================================================================
// Per-context handles
// ===============================================================================================

/// One client's view of the device: its handle table.
///
/// Dropping a context releases its handles the same way [`FileContext::close`] does.
#[derive(Debug)]
pub struct FileContext {
    handles: Mutex<IdAllocator<Arc<GemObject>>>,
    names: Arc<NameTable>,
}

impl FileContext {
    #[must_use]
    pub fn new(names: Arc<NameTable>) -> Self {
        Self {
            handles: Mutex::new(IdAllocator::new()),
            names,
        }
    }

    /// # Errors
    /// `OutOfMemory` if the handle table cannot grow.
    pub fn create_handle(&self, object: Arc<GemObject>) -> MmResult<u32> {
        object.handles.fetch_add(1, Ordering::AcqRel);
        self.adopt(object)
    }

    /// Stores a handle whose count was already taken by the caller.
    pub(crate) fn adopt(&self, object: Arc<GemObject>) -> MmResult<u32> {
        let result = lock(&self.handles).allocate(FIRST_HANDLE, Arc::clone(&object));
        if result.is_err() {
            self.put_handle(&object);
        }
        result
    }

    /// Gives back one handle count; the last one takes the name with it.
    fn put_handle(&self, object: &GemObject) {
        if object.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.names.release_unhandled(object);
        }
    }

    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn lookup(&self, handle: u32) -> MmResult<Arc<GemObject>> {
        lock(&self.handles)
            .lookup(handle)
            .map(Arc::clone)
            .map_err(|_| MmError::NotFound(format!("handle {handle}")))
    }

    /// Removes `handle`. The object goes away if this was its last reference.
    ///
    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn delete_handle(&self, handle: u32) -> MmResult<()> {
        let object = lock(&self.handles)
            .remove(handle)
            .map_err(|_| MmError::NotFound(format!("handle {handle}")))?;
        // Released outside the table lock; destruction takes the cache lock.
        self.put_handle(&object);
        drop(object);
        Ok(())
    }

    #[must_use]
    pub fn handle_count(&self) -> usize {
        lock(&self.handles).len()
    }

    /// Handles in ascending order.
    #[must_use]
    pub fn handles(&self) -> Vec<u32> {
        lock(&self.handles).iter().map(|(id, _)| id).collect()
    }

    /// Releases every handle. Returns how many there were.
    pub fn close(&self) -> usize {
        let entries = lock(&self.handles).remove_all();
        for (_, object) in &entries {
            self.put_handle(object);
        }
        entries.len()
    }
}

impl Drop for FileContext {
    fn drop(&mut self) {
        self.close();
    }
}

// ===============================================================================================
// Global names
// ===============================================================================================

#[derive(Debug, Default)]
pub struct NameTable {
    names: Mutex<IdAllocator<Arc<GemObject>>>,
}

impl NameTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gives `object` a global name, or returns the one it already has.
    ///
    /// # Errors
    /// `OutOfMemory` if the name table cannot grow.
    pub fn export(&self, object: &Arc<GemObject>) -> MmResult<u32> {
        let mut names = lock(&self.names);
        if let Some(name) = object.name() {
            return Ok(name);
        }
        let name = names.allocate(FIRST_NAME, Arc::clone(object))?;
        object.name.store(name, Ordering::Release);
        log::debug!("Exported buffer object {} as name {name}", object.bo.raw());
        Ok(name)
    }

    /// # Errors
    /// `NotFound` for an unknown name.
    pub fn lookup(&self, name: u32) -> MmResult<Arc<GemObject>> {
        lock(&self.names)
            .lookup(name)
            .map(Arc::clone)
            .map_err(|_| MmError::NotFound(format!("name {name}")))
    }

    /// Looks `name` up and takes a handle count on it in one step, so the
    /// name cannot be dropped between the lookup and the new handle.
    /// Pair with [`FileContext::adopt`].
    pub(crate) fn open(&self, name: u32) -> MmResult<Arc<GemObject>> {
        let names = lock(&self.names);
        let object = names
            .lookup(name)
            .map(Arc::clone)
            .map_err(|_| MmError::NotFound(format!("name {name}")))?;
        object.handles.fetch_add(1, Ordering::AcqRel);
        Ok(object)
    }

    /// Drops the name of `object` and the reference it held.
    ///
    /// # Errors
    /// `NotFound` if the object was never exported.
    pub fn release(&self, object: &GemObject) -> MmResult<()> {
        let held = {
            let mut names = lock(&self.names);
            let name = object.name.swap(0, Ordering::AcqRel);
            if name == 0 {
                return Err(MmError::NotFound(format!(
                    "name of buffer object {}",
                    object.bo.raw()
                )));
            }
            names.remove(name)?
        };
        drop(held);
        Ok(())
    }

    /// Drops the name of an object whose last handle just closed, unless a
    /// handle was reopened through the name in the meantime.
    fn release_unhandled(&self, object: &GemObject) {
        let held = {
            let mut names = lock(&self.names);
            if object.handle_count() != 0 {
                return;
            }
            match object.name.swap(0, Ordering::AcqRel) {
                0 => return,
                name => names.remove(name).ok(),
            }
        };
        if held.is_some() {
            log::debug!("Last handle of buffer object {} closed, name dropped", object.bo.raw());
        }
        drop(held);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.names).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
