//! Chunk heap: allocation and placement of heap-resident stack chunks.
//!
//! The heap hands out pinned heap objects in two tiers:
//!
//! 1. **Thread-local budget** ([`ChunkHeap::try_tlab_alloc`]): bump-style
//!    accounting against a per-carrier word budget. No safepoint can
//!    occur and the object always lands in young space, so the caller
//!    may keep writing to it without barriers.
//! 2. **Shared allocation** ([`ChunkHeap::allocate`]): polls a safepoint
//!    and may place the object in old space when young space is
//!    exhausted, in which case subsequent reference stores into it need
//!    barriers.
//!
//! Objects never move; young space "collection" is modeled as promotion
//! ([`ChunkHeap::age_young`]), which flips [`ChunkHeap::requires_barriers`]
//! for the survivors. That is the only part of collection this crate
//! models, because it is the only part the continuation core observes.

use crate::config::HeapConfig;
use crate::stats::HeapStats;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// A heap-allocatable object that can report its own footprint.
pub trait HeapObject {
    /// Total size in words, header included.
    fn size_in_words(&self) -> usize;
}

// =============================================================================
// Heap Reference
// =============================================================================

/// A copyable reference to a heap-resident object.
///
/// The referent is owned and pinned by the heap; a `HeapRef` does not
/// keep it alive by itself and must not outlive the heap, the same
/// contract a collected runtime gives out for raw object references.
/// Mutation through a `HeapRef` is reserved to the carrier thread that
/// owns the continuation, which is what makes the aliasing sound.
pub struct HeapRef<T> {
    ptr: NonNull<T>,
}

impl<T> HeapRef<T> {
    /// Wrap a raw pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object owned by a `ChunkHeap`.
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        Self {
            // SAFETY: caller guarantees a valid, non-null object pointer
            ptr: unsafe { NonNull::new_unchecked(ptr) },
        }
    }

    /// The raw pointer.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Address of the referent, as used by barrier sets and the old-space
    /// index.
    #[inline(always)]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl<T> Clone for HeapRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for HeapRef<T> {}

impl<T> std::ops::Deref for HeapRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the heap pins the referent for its own lifetime
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> std::ops::DerefMut for HeapRef<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: mutation is reserved to the owning carrier thread
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> PartialEq for HeapRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for HeapRef<T> {}

impl<T> std::fmt::Debug for HeapRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeapRef({:#x})", self.addr())
    }
}

// =============================================================================
// Shared allocation result
// =============================================================================

/// Outcome of a shared-space allocation.
#[derive(Debug)]
pub struct SharedAlloc<T> {
    /// The allocated object, or `None` when the heap is exhausted.
    pub object: Option<HeapRef<T>>,
    /// Whether stores into the object need barriers.
    pub requires_barriers: bool,
    /// Whether the allocation polled a safepoint.
    pub safepointed: bool,
}

// =============================================================================
// Chunk Heap
// =============================================================================

struct Spaces<T> {
    young: Vec<Box<T>>,
    old: Vec<Box<T>>,
    old_addrs: FxHashSet<usize>,
    young_used: usize,
    old_used: usize,
    tlab_used: usize,
}

/// The chunk heap.
pub struct ChunkHeap<T: HeapObject> {
    config: HeapConfig,
    spaces: Mutex<Spaces<T>>,
    safepoint_epoch: AtomicU64,
    stats: HeapStats,
}

impl<T: HeapObject> ChunkHeap<T> {
    /// Create a heap with the given configuration.
    pub fn new(config: HeapConfig) -> Self {
        Self {
            config,
            spaces: Mutex::new(Spaces {
                young: Vec::new(),
                old: Vec::new(),
                old_addrs: FxHashSet::default(),
                young_used: 0,
                old_used: 0,
                tlab_used: 0,
            }),
            safepoint_epoch: AtomicU64::new(0),
            stats: HeapStats::default(),
        }
    }

    /// The heap configuration.
    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Largest single object the heap will hand out, in words.
    #[inline]
    pub fn chunk_max_words(&self) -> usize {
        self.config.chunk_max_words
    }

    /// Allocation counters.
    #[inline]
    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// Safepoints polled by shared allocations so far.
    #[inline]
    pub fn safepoint_epoch(&self) -> u64 {
        self.safepoint_epoch.load(Ordering::Acquire)
    }

    /// Try to allocate from the thread-local budget. Never safepoints;
    /// the object always lands in young space.
    pub fn try_tlab_alloc(&self, object: T) -> Option<HeapRef<T>> {
        let size = object.size_in_words();
        let mut spaces = self.spaces.lock();
        if spaces.tlab_used + size > self.config.tlab_words
            || spaces.young_used + size > self.config.young_words
        {
            return None;
        }
        spaces.tlab_used += size;
        spaces.young_used += size;
        let mut boxed = Box::new(object);
        // SAFETY: the box is pinned in the young vector for the heap's lifetime
        let r = unsafe { HeapRef::from_raw(&mut *boxed as *mut T) };
        spaces.young.push(boxed);
        HeapStats::count(&self.stats.tlab_allocs);
        Some(r)
    }

    /// Shared-space allocation. Polls a safepoint; falls back to old
    /// space (barriered) when young space is exhausted; refuses when the
    /// heap is full.
    pub fn allocate(&self, object: T) -> SharedAlloc<T> {
        self.safepoint_epoch.fetch_add(1, Ordering::AcqRel);

        let size = object.size_in_words();
        let mut spaces = self.spaces.lock();

        if spaces.young_used + size <= self.config.young_words {
            spaces.young_used += size;
            let mut boxed = Box::new(object);
            // SAFETY: pinned in the young vector for the heap's lifetime
            let r = unsafe { HeapRef::from_raw(&mut *boxed as *mut T) };
            spaces.young.push(boxed);
            HeapStats::count(&self.stats.shared_allocs);
            return SharedAlloc {
                object: Some(r),
                requires_barriers: false,
                safepointed: true,
            };
        }

        if spaces.old_used + size <= self.config.old_words {
            spaces.old_used += size;
            let mut boxed = Box::new(object);
            // SAFETY: pinned in the old vector for the heap's lifetime
            let r = unsafe { HeapRef::from_raw(&mut *boxed as *mut T) };
            spaces.old_addrs.insert(r.addr());
            spaces.old.push(boxed);
            HeapStats::count(&self.stats.shared_allocs);
            HeapStats::count(&self.stats.barriered_allocs);
            return SharedAlloc {
                object: Some(r),
                requires_barriers: true,
                safepointed: true,
            };
        }

        HeapStats::count(&self.stats.failed_allocs);
        SharedAlloc {
            object: None,
            requires_barriers: false,
            safepointed: true,
        }
    }

    /// Whether stores into the object need barriers (old space).
    pub fn requires_barriers(&self, object: HeapRef<T>) -> bool {
        self.spaces.lock().old_addrs.contains(&object.addr())
    }

    /// Promote every young object to old space. Models the survivors of
    /// a young collection: addresses are unchanged but subsequent
    /// reference stores need barriers.
    pub fn age_young(&self) {
        let mut spaces = self.spaces.lock();
        let promoted: Vec<Box<T>> = std::mem::take(&mut spaces.young);
        let promoted_words = spaces.young_used;
        spaces.old_used += promoted_words;
        spaces.young_used = 0;
        spaces.tlab_used = 0;
        for boxed in promoted {
            spaces.old_addrs.insert(&*boxed as *const T as usize);
            spaces.old.push(boxed);
            HeapStats::count(&self.stats.promotions);
        }
    }

    /// Refill the thread-local budget.
    pub fn reset_tlab(&self) {
        self.spaces.lock().tlab_used = 0;
    }

    /// Live objects across both spaces.
    pub fn live_objects(&self) -> usize {
        let spaces = self.spaces.lock();
        spaces.young.len() + spaces.old.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Blob {
        words: Vec<usize>,
    }

    impl Blob {
        fn new(n: usize) -> Self {
            Self {
                words: vec![0; n],
            }
        }
    }

    impl HeapObject for Blob {
        fn size_in_words(&self) -> usize {
            self.words.len()
        }
    }

    #[test]
    fn test_tlab_alloc_no_safepoint() {
        let heap = ChunkHeap::new(HeapConfig::for_testing(64, 256, 256));
        let epoch = heap.safepoint_epoch();

        let r = heap.try_tlab_alloc(Blob::new(32)).unwrap();
        assert_eq!(heap.safepoint_epoch(), epoch);
        assert!(!heap.requires_barriers(r));
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn test_tlab_budget_exhaustion() {
        let heap = ChunkHeap::new(HeapConfig::for_testing(40, 256, 256));
        assert!(heap.try_tlab_alloc(Blob::new(32)).is_some());
        assert!(heap.try_tlab_alloc(Blob::new(32)).is_none());

        heap.reset_tlab();
        assert!(heap.try_tlab_alloc(Blob::new(32)).is_some());
    }

    #[test]
    fn test_shared_alloc_safepoints() {
        let heap = ChunkHeap::new(HeapConfig::for_testing(16, 256, 256));
        let epoch = heap.safepoint_epoch();

        let alloc = heap.allocate(Blob::new(64));
        assert!(alloc.object.is_some());
        assert!(alloc.safepointed);
        assert!(!alloc.requires_barriers);
        assert!(heap.safepoint_epoch() > epoch);
    }

    #[test]
    fn test_old_space_fallback_requires_barriers() {
        let heap = ChunkHeap::new(HeapConfig::for_testing(16, 64, 256));
        heap.allocate(Blob::new(64));

        let alloc = heap.allocate(Blob::new(32));
        let r = alloc.object.unwrap();
        assert!(alloc.requires_barriers);
        assert!(heap.requires_barriers(r));
    }

    #[test]
    fn test_heap_exhaustion() {
        let heap = ChunkHeap::new(HeapConfig::for_testing(16, 32, 32));
        heap.allocate(Blob::new(32));
        heap.allocate(Blob::new(32));

        let alloc = heap.allocate(Blob::new(32));
        assert!(alloc.object.is_none());
        assert_eq!(heap.stats().failed_allocs.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_age_young_flips_barrier_predicate() {
        let heap = ChunkHeap::new(HeapConfig::for_testing(64, 256, 256));
        let r = heap.try_tlab_alloc(Blob::new(16)).unwrap();
        assert!(!heap.requires_barriers(r));

        heap.age_young();
        assert!(heap.requires_barriers(r));
        // Address stability across promotion.
        assert_eq!(r.words.len(), 16);
    }
}
