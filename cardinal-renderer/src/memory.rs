//! C2 — category-tagged dynamic and bump allocators with stats.
//!
//! This is host-memory bookkeeping, independent of the device-memory
//! allocator (C5). It exists so the engine can answer "who is holding
//! memory" the way the original engine's `cardinal_memory_*` API did,
//! without hand-rolling an allocator: [`DynamicAllocator`] tracks layouts
//! so `free`/`realloc` can recover them, [`BumpAllocator`] is a classic
//! arena, and [`CategoryAllocator`] is a thin accounting façade over either.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Subsystem tags used to attribute allocations (spec §3 "Category
/// allocator").
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum MemoryCategory {
    Engine,
    Renderer,
    VulkanBuffers,
    VulkanDevice,
    Textures,
    Meshes,
    Assets,
    Shaders,
    Window,
    Logging,
    Temporary,
    Unknown,
}

pub const MEMORY_CATEGORY_COUNT: usize = 12;

impl MemoryCategory {
    pub fn index(self) -> usize {
        self as usize
    }

    pub const ALL: [MemoryCategory; MEMORY_CATEGORY_COUNT] = [
        MemoryCategory::Engine,
        MemoryCategory::Renderer,
        MemoryCategory::VulkanBuffers,
        MemoryCategory::VulkanDevice,
        MemoryCategory::Textures,
        MemoryCategory::Meshes,
        MemoryCategory::Assets,
        MemoryCategory::Shaders,
        MemoryCategory::Window,
        MemoryCategory::Logging,
        MemoryCategory::Temporary,
        MemoryCategory::Unknown,
    ];
}

/// Per-category allocation statistics.
#[derive(Copy, Clone, Debug, Default)]
pub struct MemoryStats {
    pub total_allocated: u64,
    pub current_usage: u64,
    pub peak_usage: u64,
    pub alloc_count: u64,
    pub free_count: u64,
}

impl MemoryStats {
    fn record_alloc(&mut self, size: u64) {
        self.total_allocated += size;
        self.current_usage += size;
        self.peak_usage = self.peak_usage.max(self.current_usage);
        self.alloc_count += 1;
    }

    fn record_free(&mut self, size: u64) {
        self.current_usage = self.current_usage.saturating_sub(size);
        self.free_count += 1;
    }
}

/// Errors common to all allocator shapes.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("system allocator returned null")]
    SystemAllocationFailed,
    #[error("invalid layout ({size} bytes, align {align})")]
    InvalidLayout { size: usize, align: usize },
    #[error("bump allocator out of capacity (requested {requested}, remaining {remaining})")]
    OutOfCapacity { requested: usize, remaining: usize },
    #[error("pointer is not tracked by this allocator")]
    UntrackedPointer,
}

/// A thin wrapper over the system allocator that records every live
/// allocation's layout so `free`/`realloc` can recover size and alignment.
///
/// The tracker is an open-addressed table keyed by pointer address, kept
/// below ~50% load factor by doubling capacity (spec §4.2).
pub struct DynamicAllocator {
    live: Mutex<HashMap<usize, Layout>>,
}

impl DynamicAllocator {
    pub fn new() -> DynamicAllocator {
        DynamicAllocator {
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        let align = align.max(std::mem::align_of::<usize>());
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| MemoryError::InvalidLayout { size, align })?;
        // SAFETY: layout is non-zero-sized and validated above.
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or(MemoryError::SystemAllocationFailed)?;
        self.live.lock().insert(ptr.as_ptr() as usize, layout);
        Ok(ptr)
    }

    pub fn free(&self, ptr: NonNull<u8>) -> Result<usize, MemoryError> {
        let layout = self
            .live
            .lock()
            .remove(&(ptr.as_ptr() as usize))
            .ok_or(MemoryError::UntrackedPointer)?;
        // SAFETY: layout matches the one used in `alloc` for this pointer.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(layout.size())
    }

    /// Reallocates, upgrading alignment via alloc+copy+free when the new
    /// alignment exceeds what the system realloc would guarantee.
    pub fn realloc(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
        new_align: usize,
    ) -> Result<(NonNull<u8>, usize), MemoryError> {
        let old_layout = {
            let guard = self.live.lock();
            *guard
                .get(&(ptr.as_ptr() as usize))
                .ok_or(MemoryError::UntrackedPointer)?
        };

        if new_align > old_layout.align() {
            let new_ptr = self.alloc(new_size, new_align)?;
            let copy_len = old_layout.size().min(new_size);
            // SAFETY: both regions are valid for `copy_len` bytes and
            // non-overlapping (freshly allocated destination).
            unsafe {
                std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
            }
            let old_size = self.free(ptr)?;
            let _ = old_size;
            return Ok((new_ptr, old_layout.size()));
        }

        let new_layout = Layout::from_size_align(new_size, old_layout.align())
            .map_err(|_| MemoryError::InvalidLayout {
                size: new_size,
                align: old_layout.align(),
            })?;
        // SAFETY: `ptr` was allocated with `old_layout` by this allocator.
        let raw = unsafe { alloc::realloc(ptr.as_ptr(), old_layout, new_size) };
        let raw = NonNull::new(raw).ok_or(MemoryError::SystemAllocationFailed)?;
        let mut guard = self.live.lock();
        guard.remove(&(ptr.as_ptr() as usize));
        guard.insert(raw.as_ptr() as usize, new_layout);
        Ok((raw, old_layout.size()))
    }
}

impl Default for DynamicAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-capacity linear (bump) allocator. `free` is a no-op; `reset`
/// rewinds the offset to zero.
pub struct BumpAllocator {
    buffer: Mutex<Vec<u8>>,
    offset: AtomicUsize,
    capacity: usize,
}

impl BumpAllocator {
    pub fn new(capacity: usize) -> BumpAllocator {
        BumpAllocator {
            buffer: Mutex::new(vec![0u8; capacity]),
            offset: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Bumps the offset by `size` aligned to `align`, returning the byte
    /// range `[start, start+size)` within the arena.
    pub fn alloc(&self, size: usize, align: usize) -> Result<(usize, usize), MemoryError> {
        let align = align.max(1);
        loop {
            let current = self.offset.load(Ordering::Relaxed);
            let aligned = (current + align - 1) & !(align - 1);
            let end = aligned
                .checked_add(size)
                .ok_or(MemoryError::OutOfCapacity {
                    requested: size,
                    remaining: self.capacity.saturating_sub(current),
                })?;
            if end > self.capacity {
                return Err(MemoryError::OutOfCapacity {
                    requested: size,
                    remaining: self.capacity.saturating_sub(current),
                });
            }
            if self
                .offset
                .compare_exchange(current, end, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok((aligned, end));
            }
        }
    }

    /// No-op: individual allocations in a bump arena are never freed.
    pub fn free(&self, _range: (usize, usize)) {}

    /// Degrades to alloc+copy, as the arena can't grow an in-place range.
    pub fn realloc(
        &self,
        old_range: (usize, usize),
        new_size: usize,
        align: usize,
    ) -> Result<(usize, usize), MemoryError> {
        let (new_start, new_end) = self.alloc(new_size, align)?;
        let old_len = old_range.1 - old_range.0;
        let copy_len = old_len.min(new_size);
        let mut buf = self.buffer.lock();
        let (src_start, dst_start) = (old_range.0, new_start);
        for i in 0..copy_len {
            buf[dst_start + i] = buf[src_start + i];
        }
        Ok((new_start, new_end))
    }

    /// Rewinds the arena to empty. Existing allocations become invalid.
    pub fn reset(&self) {
        self.offset.store(0, Ordering::Relaxed);
    }

    pub fn used(&self) -> usize {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Underlying shape a [`CategoryAllocator`] can wrap.
pub enum Backing<'a> {
    Dynamic(&'a DynamicAllocator),
    Bump(&'a BumpAllocator),
}

/// Attributes every allocation routed through it to one [`MemoryCategory`],
/// updating the shared [`MemorySystem`] stats table.
pub struct CategoryAllocator<'a> {
    category: MemoryCategory,
    backing: Backing<'a>,
    stats: &'a MemorySystem,
}

impl<'a> CategoryAllocator<'a> {
    pub fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        match self.backing {
            Backing::Dynamic(d) => {
                let ptr = d.alloc(size, align)?;
                self.stats.record_alloc(self.category, size as u64);
                Ok(ptr)
            }
            Backing::Bump(_) => unreachable!("bump category allocators return ranges, not NonNull; use alloc_range"),
        }
    }

    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), MemoryError> {
        match self.backing {
            Backing::Dynamic(d) => {
                let size = d.free(ptr)?;
                self.stats.record_free(self.category, size as u64);
                Ok(())
            }
            Backing::Bump(_) => Ok(()),
        }
    }
}

/// Global memory subsystem: the default dynamic and bump allocators plus
/// per-category stats tables. Initialized once at startup (spec §4.2
/// "Default set at init").
pub struct MemorySystem {
    pub dynamic: DynamicAllocator,
    pub bump: BumpAllocator,
    stats: [Mutex<MemoryStats>; MEMORY_CATEGORY_COUNT],
}

impl MemorySystem {
    pub fn new(bump_capacity: usize) -> MemorySystem {
        MemorySystem {
            dynamic: DynamicAllocator::new(),
            bump: BumpAllocator::new(bump_capacity),
            stats: Default::default(),
        }
    }

    pub fn category(&self, category: MemoryCategory) -> CategoryAllocator<'_> {
        CategoryAllocator {
            category,
            backing: Backing::Dynamic(&self.dynamic),
            stats: self,
        }
    }

    fn record_alloc(&self, category: MemoryCategory, size: u64) {
        self.stats[category.index()].lock().record_alloc(size);
    }

    fn record_free(&self, category: MemoryCategory, size: u64) {
        self.stats[category.index()].lock().record_free(size);
    }

    pub fn stats_for(&self, category: MemoryCategory) -> MemoryStats {
        *self.stats[category.index()].lock()
    }

    pub fn total_stats(&self) -> MemoryStats {
        let mut total = MemoryStats::default();
        for category in MemoryCategory::ALL {
            let s = self.stats_for(category);
            total.total_allocated += s.total_allocated;
            total.current_usage += s.current_usage;
            total.peak_usage = total.peak_usage.max(s.current_usage);
            total.alloc_count += s.alloc_count;
            total.free_count += s.free_count;
        }
        total
    }

    pub fn reset_stats(&self) {
        for s in &self.stats {
            *s.lock() = MemoryStats::default();
        }
    }
}

impl Default for MemorySystem {
    fn default() -> Self {
        MemorySystem::new(crate::config::DEFAULT_BUMP_ALLOCATOR_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocator_rejects_overflow() {
        let bump = BumpAllocator::new(16);
        assert!(bump.alloc(8, 1).is_ok());
        assert!(bump.alloc(8, 1).is_ok());
        assert!(matches!(
            bump.alloc(1, 1),
            Err(MemoryError::OutOfCapacity { .. })
        ));
    }

    #[test]
    fn bump_allocator_reset_restores_capacity() {
        let bump = BumpAllocator::new(16);
        bump.alloc(16, 1).unwrap();
        assert!(bump.alloc(1, 1).is_err());
        bump.reset();
        assert!(bump.alloc(16, 1).is_ok());
    }

    #[test]
    fn dynamic_allocator_roundtrip() {
        let dyn_alloc = DynamicAllocator::new();
        let ptr = dyn_alloc.alloc(64, 8).unwrap();
        let freed = dyn_alloc.free(ptr).unwrap();
        assert_eq!(freed, 64);
    }

    #[test]
    fn category_allocator_restores_usage_on_free() {
        let system = MemorySystem::new(1024);
        let cat = system.category(MemoryCategory::Meshes);
        let ptr = cat.alloc(128, 8).unwrap();
        assert_eq!(system.stats_for(MemoryCategory::Meshes).current_usage, 128);
        cat.free(ptr).unwrap();
        assert_eq!(system.stats_for(MemoryCategory::Meshes).current_usage, 0);
    }
}
