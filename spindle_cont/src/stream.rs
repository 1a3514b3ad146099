//! Cursor over the frames inside a stack chunk.
//!
//! The stream starts at the chunk's topmost frame and advances toward
//! the bottom; the walk ends where the bottom frame's argument overlap
//! begins (`stack_size - argsize`). The current pc and fp are tracked
//! across `next` from the frame's own linkage slots (return-address and
//! saved-fp), which freeze keeps valid inside the chunk.
//!
//! Two modes exist, selected at compile time so the fast paths carry no
//! mixed-frame checks: [`CompiledOnly`] for chunks known to hold only
//! compiled frames, and [`Mixed`] for the slow paths, which understands
//! the relativized header of interpreted frames.

use crate::chunk::ChunkRef;
use crate::frame::{Frame, RegisterMap};
use crate::interp;
use spindle_core::code::{CodeBlob, CodeCache, CodeKind, MethodTable};
use spindle_core::platform;
use spindle_core::types::Pc;
use std::marker::PhantomData;
use std::sync::Arc;

/// Compile-time stream mode.
pub trait FrameMode {
    /// Whether interpreted frames may appear.
    const MIXED: bool;
}

/// Fast-path mode: every frame is compiled.
pub struct CompiledOnly;

impl FrameMode for CompiledOnly {
    const MIXED: bool = false;
}

/// Slow-path mode: interpreted and stub frames may appear.
pub struct Mixed;

impl FrameMode for Mixed {
    const MIXED: bool = true;
}

// =============================================================================
// Chunk Frame Stream
// =============================================================================

/// Top-to-bottom cursor over a chunk's frames.
pub struct ChunkFrameStream<'a, M: FrameMode> {
    chunk: ChunkRef,
    code: &'a CodeCache,
    methods: &'a MethodTable,
    sp: usize,
    pc: Pc,
    fp: usize,
    end: usize,
    blob: Option<Arc<CodeBlob>>,
    _mode: PhantomData<M>,
}

impl<'a, M: FrameMode> ChunkFrameStream<'a, M> {
    /// Open a stream at the chunk's topmost frame.
    pub fn new(chunk: ChunkRef, code: &'a CodeCache, methods: &'a MethodTable) -> Self {
        let end = chunk.stack_size() - chunk.argsize();
        let sp = chunk.sp().min(end);
        let pc = chunk.pc();
        let fp = if sp < end {
            platform::read_saved_fp(chunk.words(), sp)
        } else {
            0
        };
        let mut stream = Self {
            chunk,
            code,
            methods,
            sp,
            pc,
            fp,
            end,
            blob: None,
            _mode: PhantomData,
        };
        stream.resolve_blob();
        stream
    }

    fn resolve_blob(&mut self) {
        self.blob = if self.is_done() {
            None
        } else {
            self.code.blob_containing(self.pc)
        };
        debug_assert!(
            M::MIXED
                || self
                    .blob
                    .as_deref()
                    .map_or(true, |b| b.kind() == CodeKind::Compiled),
            "compiled-only stream over a mixed chunk"
        );
    }

    /// Whether the walk has passed the bottom frame.
    #[inline(always)]
    pub fn is_done(&self) -> bool {
        self.sp >= self.end
    }

    /// Sp offset of the current frame.
    #[inline(always)]
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Pc at which the current frame continues.
    #[inline(always)]
    pub fn current_pc(&self) -> Pc {
        debug_assert!(!self.is_done());
        self.pc
    }

    /// Whether the current frame is compiled.
    #[inline]
    pub fn is_compiled(&self) -> bool {
        self.blob.as_deref().map_or(false, |b| b.kind() == CodeKind::Compiled)
    }

    /// Whether the current frame is interpreted.
    #[inline]
    pub fn is_interpreted(&self) -> bool {
        M::MIXED && self.blob.as_deref().map_or(false, |b| b.kind() == CodeKind::Interpreted)
    }

    /// Whether the current frame is a stub.
    #[inline]
    pub fn is_stub(&self) -> bool {
        M::MIXED && self.blob.as_deref().map_or(false, |b| b.kind() == CodeKind::Stub)
    }

    /// Fp of the current interpreted frame, as a chunk offset.
    pub fn fp(&self) -> usize {
        debug_assert!(self.is_interpreted());
        self.fp
    }

    /// Extended sp of the current frame; sits below `sp` for an
    /// interpreted frame whose operand stack has grown.
    pub fn unextended_sp(&self) -> usize {
        if self.is_done() {
            return self.sp;
        }
        if self.is_interpreted() {
            let rel = interp::read_slot(self.chunk.words(), self.fp, interp::LAST_SP_SLOT);
            if rel == 0 {
                self.sp
            } else {
                self.fp - rel
            }
        } else {
            self.sp
        }
    }

    /// Current frame size in words.
    pub fn frame_size(&self) -> usize {
        if self.is_interpreted() {
            interp::frame_bottom(self.chunk.words(), self.fp, self.methods) - self.unextended_sp()
        } else {
            self.blob.as_deref().map_or(0, CodeBlob::frame_size)
        }
    }

    /// Stack-argument words of the current frame.
    pub fn stack_argsize(&self) -> usize {
        if self.is_interpreted() {
            interp::method_of(self.chunk.words(), self.fp, self.methods)
                .map_or(0, |m| m.size_of_parameters)
        } else {
            self.blob.as_deref().map_or(0, CodeBlob::stack_argsize)
        }
    }

    /// Materialize the current frame (or the empty sentinel when done).
    pub fn to_frame(&self) -> Frame {
        if self.is_done() {
            return Frame::empty();
        }
        let fp = if self.is_interpreted() { self.fp } else { 0 };
        Frame::from_parts(
            self.pc,
            self.sp,
            self.unextended_sp(),
            fp,
            true,
            self.blob.clone(),
        )
    }

    /// Advance past the current frame. The sender's pc and fp come from
    /// the current frame's linkage slots. Crossing a stub frame records
    /// its reference spill slots into `map`; the references belong to
    /// the sender, whose barrier sweep must visit them.
    pub fn next(&mut self, map: &mut RegisterMap) {
        debug_assert!(!self.is_done());
        if M::MIXED && self.is_stub() {
            map.update_with_stub_frame(&self.to_frame());
        }
        let words = self.chunk.words();
        let (next_sp, next_pc, next_fp) = if self.is_interpreted() {
            (
                interp::frame_bottom(words, self.fp, self.methods),
                Pc::from_word(words[self.fp + interp::RETURN_PC_OFFSET]),
                words[self.fp + interp::SAVED_FP_OFFSET],
            )
        } else {
            let sender_sp = self.sp + self.frame_size();
            (
                sender_sp,
                platform::read_ret_pc(words, sender_sp),
                platform::read_saved_fp(words, sender_sp),
            )
        };
        if next_sp >= self.end {
            self.sp = self.end;
        } else {
            self.sp = next_sp;
            self.pc = next_pc;
            self.fp = next_fp;
        }
        self.resolve_blob();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::StackChunk;
    use crate::wrapper::ContId;
    use spindle_core::code::RefMap;
    use spindle_gc::{ChunkHeap, HeapConfig};

    /// Build a chunk holding two compiled frames: top (size 6, args 0)
    /// over bottom (size 8, args 2).
    fn two_frame_chunk(
        heap: &ChunkHeap<StackChunk>,
        code: &CodeCache,
    ) -> (ChunkRef, Pc, Pc) {
        let top_blob = code.register_compiled("top", 6, 0, RefMap::empty());
        let bottom_blob = code.register_compiled("bottom", 8, 2, RefMap::empty());

        // Layout: [sp=2 .. 8) top, [8 .. 16) bottom, [16 .. 18) args.
        let mut chunk = heap.try_tlab_alloc(StackChunk::new(18, ContId(1))).unwrap();
        chunk.set_sp(2);
        chunk.set_max_size(16);
        let top_pc = top_blob.start().offset(1);
        let bottom_pc = bottom_blob.start().offset(1);
        chunk.set_pc(top_pc);
        chunk.set_argsize(2);
        platform::patch_ret_pc(chunk.words_mut(), 2, top_pc);
        platform::patch_ret_pc(chunk.words_mut(), 8, bottom_pc);
        (chunk, top_pc, bottom_pc)
    }

    #[test]
    fn test_compiled_only_walk() {
        let heap = ChunkHeap::new(HeapConfig::default());
        let code = CodeCache::new();
        let methods = MethodTable::new();
        let (chunk, top_pc, bottom_pc) = two_frame_chunk(&heap, &code);

        let mut stream: ChunkFrameStream<'_, CompiledOnly> =
            ChunkFrameStream::new(chunk, &code, &methods);
        assert!(!stream.is_done());
        assert_eq!(stream.current_pc(), top_pc);
        assert_eq!(stream.frame_size(), 6);
        assert_eq!(stream.stack_argsize(), 0);
        assert!(stream.is_compiled());

        stream.next(&mut RegisterMap::small());
        assert!(!stream.is_done());
        assert_eq!(stream.current_pc(), bottom_pc);
        assert_eq!(stream.frame_size(), 8);
        assert_eq!(stream.stack_argsize(), 2);

        stream.next(&mut RegisterMap::small());
        assert!(stream.is_done());
        assert!(stream.to_frame().is_empty());
    }

    #[test]
    fn test_empty_chunk_stream_done() {
        let heap = ChunkHeap::new(HeapConfig::default());
        let code = CodeCache::new();
        let methods = MethodTable::new();
        let chunk = heap.try_tlab_alloc(StackChunk::new(16, ContId(1))).unwrap();

        let stream: ChunkFrameStream<'_, Mixed> = ChunkFrameStream::new(chunk, &code, &methods);
        assert!(stream.is_done());
        assert!(stream.to_frame().is_empty());
    }

    #[test]
    fn test_mixed_walk_reads_interp_header() {
        let heap = ChunkHeap::new(HeapConfig::default());
        let code = CodeCache::new();
        let methods = MethodTable::new();
        let interp_blob = code.register_interpreter("interpreter");
        let method = methods.register("m", 3, 1, false, 16);

        // One interpreted frame: sp=4, fp=4+HEADER_SLOTS, locals above,
        // ending at the chunk's top edge with the parameter word
        // overlapping into the argument area.
        let sp = 4;
        let fp = sp + interp::HEADER_SLOTS;
        let bottom = fp + interp::LOCALS_OFFSET + method.max_locals;
        let mut chunk = heap
            .try_tlab_alloc(StackChunk::new(bottom, ContId(1)))
            .unwrap();
        chunk.set_sp(sp);
        chunk.set_argsize(method.size_of_parameters);
        chunk.set_max_size(bottom - sp);
        chunk.set_has_mixed_frames(true);
        let pc = interp_blob.start().offset(2);
        chunk.set_pc(pc);
        platform::patch_ret_pc(chunk.words_mut(), sp, pc);
        // Heap frames keep their fp as a chunk offset in the saved-fp slot.
        platform::patch_saved_fp(chunk.words_mut(), sp, fp);
        interp::write_slot(chunk.words_mut(), fp, interp::METHOD_SLOT, method.id.to_word());
        interp::write_slot(chunk.words_mut(), fp, interp::LAST_SP_SLOT, 0);

        let mut stream: ChunkFrameStream<'_, Mixed> = ChunkFrameStream::new(chunk, &code, &methods);
        assert!(stream.is_interpreted());
        assert_eq!(stream.fp(), fp);
        assert_eq!(stream.unextended_sp(), sp);
        assert_eq!(stream.frame_size(), bottom - sp);
        assert_eq!(stream.stack_argsize(), 1);

        let f = stream.to_frame();
        assert!(f.on_heap);
        assert_eq!(f.fp, fp);

        stream.next(&mut RegisterMap::small());
        assert!(stream.is_done());
    }

    #[test]
    fn test_crossing_a_stub_records_spill_slots() {
        let heap = ChunkHeap::new(HeapConfig::default());
        let code = CodeCache::new();
        let methods = MethodTable::new();
        let stub_blob = code.register_stub("safepoint", 4, Some(RefMap::from_slots([0, 1])));
        let caller_blob = code.register_compiled("interrupted", 8, 0, RefMap::empty());

        // Layout: [sp=2 .. 6) stub, [6 .. 14) caller.
        let mut chunk = heap.try_tlab_alloc(StackChunk::new(14, ContId(1))).unwrap();
        chunk.set_sp(2);
        chunk.set_max_size(12);
        chunk.set_has_mixed_frames(true);
        let stub_pc = stub_blob.start().offset(1);
        chunk.set_pc(stub_pc);
        platform::patch_ret_pc(chunk.words_mut(), 2, stub_pc);
        platform::patch_ret_pc(chunk.words_mut(), 6, caller_blob.start().offset(2));

        let mut stream: ChunkFrameStream<'_, Mixed> = ChunkFrameStream::new(chunk, &code, &methods);
        assert!(stream.is_stub());

        let mut map = RegisterMap::full_map();
        stream.next(&mut map);
        assert!(stream.is_compiled());
        // The stub's sp-relative reference slots landed at their chunk
        // offsets.
        assert_eq!(map.callee_saved_slots(), &[2, 3]);

        // A small map ignores the crossing.
        let mut stream: ChunkFrameStream<'_, Mixed> = ChunkFrameStream::new(chunk, &code, &methods);
        let mut small = RegisterMap::small();
        stream.next(&mut small);
        assert!(small.callee_saved_slots().is_empty());
    }

    #[test]
    fn test_extended_operand_stack_reported() {
        let heap = ChunkHeap::new(HeapConfig::default());
        let code = CodeCache::new();
        let methods = MethodTable::new();
        let interp_blob = code.register_interpreter("interpreter");
        let method = methods.register("m", 2, 0, false, 16);

        let sp = 6;
        let fp = sp + interp::HEADER_SLOTS + 2; // two operand words below the header
        let bottom = fp + interp::LOCALS_OFFSET + method.max_locals;
        let mut chunk = heap
            .try_tlab_alloc(StackChunk::new(bottom, ContId(1)))
            .unwrap();
        chunk.set_sp(sp + 2);
        chunk.set_max_size(bottom - sp);
        let pc = interp_blob.start().offset(1);
        chunk.set_pc(pc);
        platform::patch_ret_pc(chunk.words_mut(), sp + 2, pc);
        platform::patch_saved_fp(chunk.words_mut(), sp + 2, fp);
        interp::write_slot(chunk.words_mut(), fp, interp::METHOD_SLOT, method.id.to_word());
        // Operand stack grew two words past the walk sp.
        interp::write_slot(chunk.words_mut(), fp, interp::LAST_SP_SLOT, fp - sp);

        let stream: ChunkFrameStream<'_, Mixed> = ChunkFrameStream::new(chunk, &code, &methods);
        assert_eq!(stream.unextended_sp(), sp);
        assert_eq!(stream.frame_size(), bottom - sp);
    }
}
