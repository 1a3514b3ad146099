//! Heap-resident stack chunks.
//!
//! A stack chunk is a heap object holding a contiguous run of frozen
//! stack words plus a small header. Chunk word offsets use the same
//! downward-growing convention as the native stack, so a frozen region
//! copies over without index translation:
//!
//! ```text
//! offset 0                                           stack_size
//! ┌──────┬─────────────────────────────────────────────┬──────┐
//! │ free │ meta │ top frame │ ... │ bottom frame │ args │      │
//! └──────┴─────────────────────────────────────────────┴──────┘
//!         ^ sp - metadata    ^ sp grows down (toward 0)
//! ```
//!
//! Header invariants (checked by [`StackChunk::verify`]):
//!
//! - empty ⇔ `sp == stack_size` ⇔ `max_size == 0`
//! - non-empty ⇒ the word at `sp - 1` equals `pc`
//! - non-empty ⇒ `sp + max_size ≤ stack_size + argsize` (the top
//!   `argsize` words of the bottom frame overlap into the parent)

use crate::frame::RegisterMap;
use crate::wrapper::ContId;
use spindle_core::platform;
use spindle_core::types::{Pc, Word};
use spindle_gc::{BarrierSet, HeapObject, HeapRef};

/// Reference to a heap-resident chunk.
pub type ChunkRef = HeapRef<StackChunk>;

/// Header words accounted to every chunk for heap sizing.
const CHUNK_HEADER_WORDS: usize = 8;

// =============================================================================
// Chunk Flags
// =============================================================================

/// Chunk flag bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFlags(u8);

impl ChunkFlags {
    /// No flags set.
    pub const NONE: ChunkFlags = ChunkFlags(0);
    /// The chunk holds at least one interpreted or stub frame.
    pub const HAS_MIXED_FRAMES: ChunkFlags = ChunkFlags(1 << 0);
    /// A collection has processed this chunk; mutation must re-notify
    /// the collector.
    pub const GC_MODE: ChunkFlags = ChunkFlags(1 << 1);
    /// The chunk carries a reference bitmap.
    pub const HAS_BITMAP: ChunkFlags = ChunkFlags(1 << 2);

    /// Whether every flag in `other` is set.
    #[inline(always)]
    pub const fn contains(self, other: ChunkFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags in `other`.
    #[inline(always)]
    pub fn insert(&mut self, other: ChunkFlags) {
        self.0 |= other.0;
    }

    /// Clear the flags in `other`.
    #[inline(always)]
    pub fn remove(&mut self, other: ChunkFlags) {
        self.0 &= !other.0;
    }

    /// Raw bits.
    #[inline(always)]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

// =============================================================================
// Stack Chunk
// =============================================================================

/// A heap object holding frozen stack frames.
pub struct StackChunk {
    stack_size: usize,
    sp: usize,
    argsize: usize,
    max_size: usize,
    pc: Pc,
    parent: Option<ChunkRef>,
    cont: ContId,
    flags: ChunkFlags,
    bitmap: Option<Box<[u64]>>,
    words: Box<[Word]>,
}

impl StackChunk {
    /// Create an empty chunk with capacity for `stack_size` words.
    pub fn new(stack_size: usize, cont: ContId) -> Self {
        Self {
            stack_size,
            sp: stack_size,
            argsize: 0,
            max_size: 0,
            pc: Pc::NULL,
            parent: None,
            cont,
            flags: ChunkFlags::NONE,
            bitmap: None,
            words: vec![0; stack_size].into_boxed_slice(),
        }
    }

    // =========================================================================
    // Header accessors
    // =========================================================================

    /// Capacity in words.
    #[inline(always)]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Offset of the topmost live frame's sp.
    #[inline(always)]
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Set the topmost sp offset.
    #[inline(always)]
    pub fn set_sp(&mut self, sp: usize) {
        debug_assert!(sp <= self.stack_size);
        self.sp = sp;
    }

    /// Stack-argument words of the bottom frame, overlapping the parent.
    #[inline(always)]
    pub fn argsize(&self) -> usize {
        self.argsize
    }

    /// Set the bottom frame's argument overlap.
    #[inline(always)]
    pub fn set_argsize(&mut self, argsize: usize) {
        self.argsize = argsize;
    }

    /// Live content size in words, used for thaw sizing.
    #[inline(always)]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Set the live content size.
    #[inline(always)]
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    /// Continuation point of the topmost frozen frame.
    #[inline(always)]
    pub fn pc(&self) -> Pc {
        self.pc
    }

    /// Set the topmost continuation point.
    #[inline(always)]
    pub fn set_pc(&mut self, pc: Pc) {
        self.pc = pc;
    }

    /// Next chunk toward the bottom of the continuation.
    #[inline(always)]
    pub fn parent(&self) -> Option<ChunkRef> {
        self.parent
    }

    /// Link the parent chunk.
    #[inline(always)]
    pub fn set_parent(&mut self, parent: Option<ChunkRef>) {
        self.parent = parent;
    }

    /// Owning continuation.
    #[inline(always)]
    pub fn cont(&self) -> ContId {
        self.cont
    }

    /// Flag bits.
    #[inline(always)]
    pub fn flags(&self) -> ChunkFlags {
        self.flags
    }

    /// Whether the chunk is empty.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.sp == self.stack_size
    }

    /// Whether the chunk holds interpreted or stub frames.
    #[inline(always)]
    pub fn has_mixed_frames(&self) -> bool {
        self.flags.contains(ChunkFlags::HAS_MIXED_FRAMES)
    }

    /// Mark or clear the mixed-frames flag.
    #[inline]
    pub fn set_has_mixed_frames(&mut self, value: bool) {
        if value {
            self.flags.insert(ChunkFlags::HAS_MIXED_FRAMES);
        } else {
            self.flags.remove(ChunkFlags::HAS_MIXED_FRAMES);
        }
    }

    /// Whether a collection has processed the chunk.
    #[inline(always)]
    pub fn is_gc_mode(&self) -> bool {
        self.flags.contains(ChunkFlags::GC_MODE)
    }

    /// Mark or clear GC mode. Set by the collector when it scans the
    /// chunk in place.
    #[inline]
    pub fn set_gc_mode(&mut self, value: bool) {
        if value {
            self.flags.insert(ChunkFlags::GC_MODE);
        } else {
            self.flags.remove(ChunkFlags::GC_MODE);
        }
    }

    /// Whether the chunk carries a reference bitmap.
    #[inline(always)]
    pub fn has_bitmap(&self) -> bool {
        self.flags.contains(ChunkFlags::HAS_BITMAP)
    }

    /// Any condition that forces thaw onto the slow path.
    #[inline]
    pub fn has_thaw_slowpath_condition(&self) -> bool {
        self.flags.contains(ChunkFlags::HAS_MIXED_FRAMES)
            || self.flags.contains(ChunkFlags::GC_MODE)
            || self.flags.contains(ChunkFlags::HAS_BITMAP)
    }

    // =========================================================================
    // Word access
    // =========================================================================

    /// The chunk's word array.
    #[inline(always)]
    pub fn words(&self) -> &[Word] {
        &self.words
    }

    /// Mutable word array.
    #[inline(always)]
    pub fn words_mut(&mut self) -> &mut [Word] {
        &mut self.words
    }

    /// Bulk copy from the native stack into the chunk.
    #[inline]
    pub fn copy_from_stack(&mut self, stack: &[Word], stack_from: usize, chunk_to: usize, size: usize) {
        self.words[chunk_to..chunk_to + size].copy_from_slice(&stack[stack_from..stack_from + size]);
    }

    /// Bulk copy from the chunk onto the native stack.
    #[inline]
    pub fn copy_to_stack(&self, stack: &mut [Word], chunk_from: usize, stack_to: usize, size: usize) {
        stack[stack_to..stack_to + size].copy_from_slice(&self.words[chunk_from..chunk_from + size]);
    }

    /// Return-pc slot below the given chunk sp offset.
    #[inline]
    pub fn read_ret_pc(&self, sp: usize) -> Pc {
        platform::read_ret_pc(&self.words, sp)
    }

    /// Patch the return-pc slot below the given chunk sp offset.
    #[inline]
    pub fn patch_ret_pc(&mut self, sp: usize, pc: Pc) {
        platform::patch_ret_pc(&mut self.words, sp, pc);
    }

    // =========================================================================
    // Reference bitmap
    // =========================================================================

    /// Install an all-clear bitmap covering the word array. Called by
    /// the collector before it starts publishing per-word reference
    /// information.
    pub fn ensure_bitmap(&mut self) {
        if self.bitmap.is_none() {
            let len = (self.stack_size + 63) / 64;
            self.bitmap = Some(vec![0u64; len].into_boxed_slice());
            self.flags.insert(ChunkFlags::HAS_BITMAP);
        }
    }

    /// Set the reference bit for a word offset.
    pub fn set_bitmap_bit(&mut self, offset: usize) {
        debug_assert!(offset < self.stack_size);
        if let Some(bitmap) = &mut self.bitmap {
            bitmap[offset / 64] |= 1 << (offset % 64);
        }
    }

    /// Whether the reference bit is set for a word offset.
    pub fn bitmap_bit(&self, offset: usize) -> bool {
        match &self.bitmap {
            Some(bitmap) => bitmap[offset / 64] & (1 << (offset % 64)) != 0,
            None => false,
        }
    }

    /// Clear reference bits for `range` words starting at `start`.
    /// Used after thawing argument words that now live in the parent
    /// frame, so the next scan does not double-process them.
    pub fn clear_bitmap_bits(&mut self, start: usize, range: usize) {
        if let Some(bitmap) = &mut self.bitmap {
            for offset in start..start + range {
                bitmap[offset / 64] &= !(1 << (offset % 64));
            }
        }
    }

    // =========================================================================
    // Barrier gateway
    // =========================================================================

    /// Apply store barriers for every reference word in the live
    /// region: the bitmap-tracked slots plus any callee-saved spill
    /// slots the walk's register map recorded. Invoked after freezing
    /// into barriered memory and per frame on GC-seen thaws.
    pub fn do_store_barriers<B: BarrierSet>(
        &self,
        self_addr: usize,
        barriers: &B,
        map: &RegisterMap,
    ) {
        // The argument-overlap words belong to the parent frame; visit
        // them only when the map asks for argument references.
        let end = if map.include_argument_refs {
            self.stack_size
        } else {
            self.stack_size - self.argsize
        };
        match &self.bitmap {
            Some(bitmap) => {
                for offset in self.sp..end {
                    if bitmap[offset / 64] & (1 << (offset % 64)) != 0 {
                        barriers.store_ref(self_addr + offset * std::mem::size_of::<Word>());
                    }
                }
            }
            None => {
                // Without a bitmap every live word is conservatively
                // treated as a potential reference holder; one barrier
                // per chunk is enough for card-granular sets.
                barriers.store_ref(self_addr);
            }
        }
        // References spilled into a stub frame are known to the map,
        // not the bitmap.
        for &slot in map.callee_saved_slots() {
            barriers.store_ref(self_addr + slot * std::mem::size_of::<Word>());
        }
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Check the header invariants. Debug builds call this at the end
    /// of every freeze and thaw.
    pub fn verify(&self) {
        debug_assert!(self.sp <= self.stack_size);
        debug_assert_eq!(self.is_empty(), self.max_size == 0, "empty iff max_size == 0");
        if !self.is_empty() {
            debug_assert!(self.sp >= platform::METADATA_WORDS);
            // Mixed chunks carry alignment headroom in max_size, one
            // wiggle word per interpreted frame, so the bound is exact
            // only for compiled-only content.
            debug_assert!(
                self.has_mixed_frames()
                    || self.sp + self.max_size <= self.stack_size + self.argsize,
                "live content exceeds capacity plus overlap"
            );
            debug_assert_eq!(
                self.read_ret_pc(self.sp),
                self.pc,
                "top return-pc slot must match chunk pc"
            );
        } else {
            debug_assert_eq!(self.argsize, 0);
        }
    }
}

impl HeapObject for StackChunk {
    fn size_in_words(&self) -> usize {
        let bitmap_words = self.bitmap.as_ref().map_or(0, |b| b.len());
        CHUNK_HEADER_WORDS + self.stack_size + bitmap_words
    }
}

impl std::fmt::Debug for StackChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackChunk")
            .field("stack_size", &self.stack_size)
            .field("sp", &self.sp)
            .field("argsize", &self.argsize)
            .field("max_size", &self.max_size)
            .field("pc", &self.pc)
            .field("flags", &self.flags.bits())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
