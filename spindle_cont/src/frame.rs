//! Frame descriptor: a uniform view over interpreted, compiled and stub
//! frames.
//!
//! A frame is (pc, sp, unextended_sp, fp) plus the code blob containing
//! the pc; the blob supplies the kind, the fixed frame size and the
//! reference map. The same descriptor serves frames on the native stack
//! and frames inside a chunk (`on_heap`), whose positions index the
//! chunk's word array instead.
//!
//! `unextended_sp` differs from `sp` only for interpreted frames whose
//! operand stack has grown past the base; sizing always uses the
//! greater extent.

use crate::interp;
use crate::thread::CarrierThread;
use smallvec::SmallVec;
use spindle_core::code::{CodeBlob, CodeCache, CodeKind, MethodTable, RefMap};
use spindle_core::platform;
use spindle_core::types::{Pc, Word};
use std::sync::Arc;

// =============================================================================
// Frame Kind
// =============================================================================

/// Kind of a frame, derived from the code blob containing its pc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Template-interpreter frame.
    Interpreted = 0,
    /// JIT-compiled frame.
    Compiled = 1,
    /// Runtime stub frame.
    Stub = 2,
    /// Native frame; never freezable.
    Native = 3,
    /// Compiled frame sitting at its blob's deopt handler.
    Deoptimized = 4,
}

// =============================================================================
// Register Map
// =============================================================================

/// Walk-time register state.
///
/// The small map is all the compiled-frame walks need: ordinary frames
/// keep no references in registers across a call. A safepoint stub from
/// forced preemption spills the interrupted caller's callee-saved
/// registers into its own frame, so walks that may cross one carry a
/// full map; crossing the stub records the spill slots that hold
/// references, and barrier sweeps visit them alongside the
/// bitmap-tracked words.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    /// Whether barrier sweeps visit the argument-overlap words, which
    /// belong to the parent frame.
    pub include_argument_refs: bool,
    full: bool,
    callee_saved: SmallVec<[usize; 4]>,
}

impl RegisterMap {
    /// The minimal map for walks that cannot meet a stub frame.
    pub fn small() -> Self {
        Self {
            include_argument_refs: false,
            full: false,
            callee_saved: SmallVec::new(),
        }
    }

    /// A full map tracking callee-saved spill slots.
    pub fn full_map() -> Self {
        Self {
            include_argument_refs: false,
            full: true,
            callee_saved: SmallVec::new(),
        }
    }

    /// Whether callee-saved state is tracked.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Record a stub frame's reference spill slots at the frame's
    /// current position. Small maps track no callee-saved state and
    /// ignore the update.
    pub fn update_with_stub_frame(&mut self, f: &Frame) {
        if !self.full {
            return;
        }
        if let Some(ref_map) = f.ref_map() {
            for &slot in ref_map.slots() {
                self.callee_saved.push(f.sp + slot as usize);
            }
        }
    }

    /// Spill slots recorded from crossed stub frames, as word offsets
    /// in the space the frames live in.
    #[inline]
    pub fn callee_saved_slots(&self) -> &[usize] {
        &self.callee_saved
    }
}

// =============================================================================
// Frame
// =============================================================================

/// A frame on the native stack or inside a chunk.
#[derive(Clone)]
pub struct Frame {
    /// Pc at which the frame continues.
    pub pc: Pc,
    /// Stack pointer (lowest word of the fixed frame).
    pub sp: usize,
    /// Extended stack pointer; equals `sp` except for interpreted frames
    /// with a grown operand stack.
    pub unextended_sp: usize,
    /// Frame pointer; meaningful for interpreted frames.
    pub fp: usize,
    /// Whether positions index a chunk rather than the native stack.
    pub on_heap: bool,
    blob: Option<Arc<CodeBlob>>,
}

impl Frame {
    /// The empty sentinel frame (caller of an empty chunk).
    pub fn empty() -> Self {
        Self {
            pc: Pc::NULL,
            sp: 0,
            unextended_sp: 0,
            fp: 0,
            on_heap: true,
            blob: None,
        }
    }

    /// Whether this is the empty sentinel.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.pc.is_null()
    }

    /// Build a frame at a known position, resolving the blob for `pc`.
    pub fn resolve(
        code: &CodeCache,
        words: &[Word],
        pc: Pc,
        sp: usize,
        fp: usize,
        on_heap: bool,
    ) -> Frame {
        let blob = code.blob_containing(pc);
        let unextended_sp = match blob.as_deref().map(CodeBlob::kind) {
            Some(CodeKind::Interpreted) => interp::unextended_sp(words, fp, sp),
            _ => sp,
        };
        Frame {
            pc,
            sp,
            unextended_sp,
            fp,
            on_heap,
            blob,
        }
    }

    /// Build a frame from fully resolved parts. Chunk-side walkers use
    /// this because heap frames carry relativized header slots that
    /// [`Frame::resolve`] must not reinterpret.
    pub(crate) fn from_parts(
        pc: Pc,
        sp: usize,
        unextended_sp: usize,
        fp: usize,
        on_heap: bool,
        blob: Option<Arc<CodeBlob>>,
    ) -> Frame {
        Frame {
            pc,
            sp,
            unextended_sp,
            fp,
            on_heap,
            blob,
        }
    }

    /// The thread's newest frame, from the published anchor.
    pub fn last_frame(thread: &CarrierThread, code: &CodeCache) -> Frame {
        let anchor = thread.anchor().expect("no frame anchor published");
        Frame::resolve(code, thread.stack(), anchor.pc, anchor.sp, anchor.fp, false)
    }

    /// The blob containing the frame's pc.
    #[inline(always)]
    pub fn blob(&self) -> Option<&Arc<CodeBlob>> {
        self.blob.as_ref()
    }

    /// Derived frame kind.
    pub fn kind(&self) -> FrameKind {
        match self.blob.as_deref() {
            None => FrameKind::Native,
            Some(blob) => match blob.kind() {
                CodeKind::Interpreted => FrameKind::Interpreted,
                CodeKind::Stub => FrameKind::Stub,
                CodeKind::Native => FrameKind::Native,
                CodeKind::Compiled => {
                    if blob.is_deopt_pc(self.pc) {
                        FrameKind::Deoptimized
                    } else {
                        FrameKind::Compiled
                    }
                }
            },
        }
    }

    /// Whether the frame is interpreted.
    #[inline]
    pub fn is_interpreted(&self) -> bool {
        self.kind() == FrameKind::Interpreted
    }

    /// Whether the frame is compiled (deoptimized included).
    #[inline]
    pub fn is_compiled(&self) -> bool {
        matches!(self.kind(), FrameKind::Compiled | FrameKind::Deoptimized)
    }

    /// Whether the frame is a runtime stub.
    #[inline]
    pub fn is_stub(&self) -> bool {
        self.kind() == FrameKind::Stub
    }

    /// Reference map of the frame's blob. `None` for interpreted and
    /// native frames; a compiled frame without one pins.
    #[inline]
    pub fn ref_map(&self) -> Option<&RefMap> {
        self.blob.as_deref().and_then(CodeBlob::ref_map)
    }

    /// Frame size in words. Interpreted frames size themselves from
    /// their header; everything else comes from the blob.
    pub fn size(&self, words: &[Word], methods: &MethodTable) -> usize {
        match self.kind() {
            FrameKind::Interpreted => interp::frame_size(words, self.fp, self.unextended_sp, methods),
            _ => self.blob.as_deref().map_or(0, CodeBlob::frame_size),
        }
    }

    /// Stack-argument words the frame receives from its caller.
    pub fn stack_argsize(&self, words: &[Word], methods: &MethodTable) -> usize {
        match self.kind() {
            FrameKind::Interpreted => interp::method_of(words, self.fp, methods)
                .map_or(0, |m| m.size_of_parameters),
            _ => self.blob.as_deref().map_or(0, CodeBlob::stack_argsize),
        }
    }

    /// One past the highest word of the fixed frame.
    pub fn frame_bottom(&self, words: &[Word], methods: &MethodTable) -> usize {
        match self.kind() {
            FrameKind::Interpreted => interp::frame_bottom(words, self.fp, methods),
            _ => self.sp + self.blob.as_deref().map_or(0, CodeBlob::frame_size),
        }
    }

    /// Walk to the sender frame.
    pub fn sender(&self, code: &CodeCache, words: &[Word]) -> Frame {
        let (sender_sp, sender_pc, sender_fp) = if self.is_interpreted() {
            (
                interp::read_sender_sp(words, self.fp),
                Pc::from_word(words[self.fp + interp::RETURN_PC_OFFSET]),
                words[self.fp + interp::SAVED_FP_OFFSET],
            )
        } else {
            let sender_sp = self.unextended_sp + self.blob.as_deref().map_or(0, CodeBlob::frame_size);
            (
                sender_sp,
                platform::read_ret_pc(words, sender_sp),
                platform::read_saved_fp(words, sender_sp),
            )
        };
        Frame::resolve(code, words, sender_pc, sender_sp, sender_fp, self.on_heap)
    }

    /// Whether the frame holds an object monitor.
    #[inline]
    pub fn is_owning_monitor(&self, thread: &CarrierThread) -> bool {
        thread.frame_owns_monitor(self.fp)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "Frame(empty)");
        }
        f.debug_struct("Frame")
            .field("kind", &self.kind())
            .field("pc", &self.pc)
            .field("sp", &self.sp)
            .field("unextended_sp", &self.unextended_sp)
            .field("fp", &self.fp)
            .field("on_heap", &self.on_heap)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_frame() {
        let f = Frame::empty();
        assert!(f.is_empty());
        assert_eq!(f.kind(), FrameKind::Native);
    }

    #[test]
    fn test_kind_from_blob() {
        let code = CodeCache::new();
        let compiled = code.register_compiled("m", 8, 0, RefMap::empty());
        let stub = code.register_stub("stub", 2, None);
        let words = vec![0usize; 64];

        let f = Frame::resolve(&code, &words, compiled.start(), 16, 22, false);
        assert_eq!(f.kind(), FrameKind::Compiled);
        assert!(f.is_compiled());
        assert_eq!(f.unextended_sp, f.sp);

        let s = Frame::resolve(&code, &words, stub.start(), 8, 14, false);
        assert_eq!(s.kind(), FrameKind::Stub);

        let n = Frame::resolve(&code, &words, Pc(3), 8, 14, false);
        assert_eq!(n.kind(), FrameKind::Native);
    }

    #[test]
    fn test_deoptimized_kind() {
        let code = CodeCache::new();
        let blob = code.register_compiled("m", 8, 0, RefMap::empty());
        let words = vec![0usize; 64];

        let f = Frame::resolve(&code, &words, blob.deopt_handler(), 16, 22, false);
        assert_eq!(f.kind(), FrameKind::Deoptimized);
        assert!(f.is_compiled());
    }

    #[test]
    fn test_compiled_sender_walk() {
        let code = CodeCache::new();
        let callee = code.register_compiled("callee", 6, 0, RefMap::empty());
        let caller = code.register_compiled("caller", 8, 0, RefMap::empty());

        // Caller frame at sp 20, callee frame [14, 20) below it.
        let mut words = vec![0usize; 64];
        words[19] = caller.start().offset(4).to_word(); // return into caller
        words[18] = 30; // caller's saved fp

        let f = Frame::resolve(&code, &words, callee.start(), 14, 18, false);
        let sender = f.sender(&code, &words);
        assert_eq!(sender.sp, 20);
        assert_eq!(sender.pc, caller.start().offset(4));
        assert_eq!(sender.fp, 30);
        assert_eq!(sender.kind(), FrameKind::Compiled);
    }

    #[test]
    fn test_monitor_query_uses_fp() {
        let code = CodeCache::new();
        let blob = code.register_compiled("m", 8, 0, RefMap::empty());
        let words = vec![0usize; 64];
        let mut thread = CarrierThread::new(64);

        let f = Frame::resolve(&code, &words, blob.start(), 16, 22, false);
        assert!(!f.is_owning_monitor(&thread));
        thread.add_monitor(22);
        assert!(f.is_owning_monitor(&thread));
    }

    #[test]
    fn test_full_map_records_stub_spill_slots() {
        let code = CodeCache::new();
        let stub = code.register_stub("safepoint", 4, Some(RefMap::from_slots([0, 2])));
        let words = vec![0usize; 64];
        let f = Frame::resolve(&code, &words, stub.start(), 10, 12, false);

        let mut map = RegisterMap::full_map();
        assert!(map.is_full());
        map.update_with_stub_frame(&f);
        // Sp-relative reference slots land at their absolute positions.
        assert_eq!(map.callee_saved_slots(), &[10, 12]);
    }

    #[test]
    fn test_small_map_ignores_stub_updates() {
        let code = CodeCache::new();
        let stub = code.register_stub("safepoint", 4, Some(RefMap::from_slots([0, 1])));
        let words = vec![0usize; 64];
        let f = Frame::resolve(&code, &words, stub.start(), 10, 12, false);

        let mut map = RegisterMap::small();
        assert!(!map.is_full());
        map.update_with_stub_frame(&f);
        assert!(map.callee_saved_slots().is_empty());
    }
}
