//! Thaw engine: reinstall frozen frames onto the native stack.
//!
//! `prepare_thaw` sizes the stack room (popping an empty tail chunk
//! first), then `thaw` copies frames out of the tail chunk:
//!
//! - **Fast path** (compiled-only chunk, no barriers, no bitmap): below
//!   the bulk threshold the whole chunk is copied and emptied in one
//!   move; above it exactly one frame is thawed and the chunk's header
//!   advances past it.
//! - **Slow path**: a stream-driven recursive walk thawing up to two
//!   frames (one on return-barrier re-entry), derelativizing
//!   interpreted headers, applying store barriers on GC-seen chunks and
//!   deoptimizing frames whose code demands it.
//!
//! Whatever the path, the bottom thawed frame's return slot is patched
//! with the return-barrier stub while frozen frames remain, or with the
//! true entry pc once the continuation is empty; a later method return
//! through the barrier re-enters this engine with
//! [`ThawKind::ReturnBarrier`].

use crate::frame::{Frame, FrameKind, RegisterMap};
use crate::interp;
use crate::runtime::ContinuationRuntime;
use crate::stream::{ChunkFrameStream, CompiledOnly, Mixed};
use crate::thread::CarrierThread;
use crate::wrapper::{Continuation, ContinuationWrapper};
use smallvec::SmallVec;
use spindle_core::platform::{
    self, frame_align_index, is_frame_aligned, ALIGN_WIGGLE, METADATA_WORDS,
};
use spindle_core::types::{Pc, Word};
use spindle_gc::BarrierSet;

/// Below this many live words the fast path thaws the whole chunk;
/// above it, one frame at a time. Purely a latency heuristic.
const BULK_THAW_THRESHOLD_WORDS: usize = 500;

/// Extra sizing slack beyond `max_size`, covering the synthetic return
/// frame and alignment at both ends.
const THAW_SIZE_SLACK_WORDS: usize = 200;

/// Native-code stack estimate added to the overflow check.
const NATIVE_CALL_SLACK_WORDS: usize = 40;

// =============================================================================
// Thaw Kind
// =============================================================================

/// Why the thaw stub was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThawKind {
    /// First resumption of the continuation's top.
    Top = 0,
    /// Re-entry from the synthetic return barrier.
    ReturnBarrier = 1,
    /// Resumption that must immediately deliver an exception.
    Exception = 2,
}

impl ThawKind {
    /// Convert from the raw discriminant.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Top),
            1 => Some(Self::ReturnBarrier),
            2 => Some(Self::Exception),
            _ => None,
        }
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Size the native stack room a thaw needs. Returns bytes, or 0 when
/// the native stack cannot accommodate the thaw.
pub fn prepare_thaw<B: BarrierSet>(
    _rt: &ContinuationRuntime<B>,
    thread: &CarrierThread,
    cont: &mut Continuation,
    _return_barrier: bool,
) -> usize {
    let mut chunk = cont.tail().expect("prepare_thaw without tail chunk");

    // The tail can be empty because it was kept for another freeze; we
    // are here to thaw, so move past it.
    if chunk.is_empty() {
        let parent = chunk.parent().expect("empty tail without parent");
        debug_assert!(!parent.is_empty());
        cont.set_tail(Some(parent));
        chunk = parent;
    }
    chunk.verify();
    debug_assert!(chunk.max_size() > 0);

    let size = thaw_size_words(chunk.max_size());
    let entry_sp = thread.entry().expect("no continuation entry").entry_sp;
    if !thread.check_stack_room(entry_sp, size + NATIVE_CALL_SLACK_WORDS) {
        return 0;
    }
    size * std::mem::size_of::<Word>()
}

#[inline]
fn thaw_size_words(max_size: usize) -> usize {
    max_size + METADATA_WORDS + 2 * ALIGN_WIGGLE + THAW_SIZE_SLACK_WORDS
}

/// Thaw frames from the tail chunk onto the carrier's stack; returns
/// the native sp at which the resumed frame expects control.
pub fn thaw<B: BarrierSet>(
    rt: &ContinuationRuntime<B>,
    thread: &mut CarrierThread,
    cont: &mut Continuation,
    kind: ThawKind,
) -> usize {
    debug_assert!(!cont.is_done());
    debug_assert!(!cont.is_empty());
    let mut engine = ThawEngine::new(rt, thread, cont);
    engine.thaw(kind)
}

// =============================================================================
// Thaw Engine
// =============================================================================

struct ThawEngine<'a, B: BarrierSet> {
    rt: &'a ContinuationRuntime<B>,
    thread: &'a mut CarrierThread,
    cont: ContinuationWrapper<'a>,
    /// Highest sp among thawed frames that disable the freeze fast
    /// path (interpreted or deoptimized).
    fastpath: Option<usize>,
    barriers: bool,
    /// Extended sp of the chunk top before the walk, for max_size
    /// accounting.
    top_unextended_sp: usize,
    align_size: usize,
    frames: usize,
    /// Deopt pc rewrites applied after all copies, so a callee's copy
    /// cannot undo them.
    deopt_patches: SmallVec<[(usize, Pc); 2]>,
}

impl<'a, B: BarrierSet> ThawEngine<'a, B> {
    fn new(
        rt: &'a ContinuationRuntime<B>,
        thread: &'a mut CarrierThread,
        cont: &'a mut Continuation,
    ) -> Self {
        let cont = ContinuationWrapper::open(cont, thread);
        Self {
            rt,
            thread,
            cont,
            fastpath: None,
            barriers: false,
            top_unextended_sp: 0,
            align_size: 0,
            frames: 0,
            deopt_patches: SmallVec::new(),
        }
    }

    fn thaw(&mut self, kind: ThawKind) -> usize {
        let chunk = self.cont.tail().expect("tail chosen by prepare_thaw");
        debug_assert!(!chunk.is_empty());

        self.barriers = self.rt.heap.requires_barriers(chunk);
        let fast = !self.barriers
            && self.thread.fastpath_state()
            && !self.thread.interp_only_mode
            && !chunk.has_thaw_slowpath_condition()
            && !self.rt.preserve_frame_pointer;

        let sp = if fast {
            self.thaw_fast()
        } else {
            self.thaw_slow(kind == ThawKind::ReturnBarrier)
        };

        if let Some(chunk) = self.cont.tail() {
            chunk.verify();
        }
        debug_assert!(is_frame_aligned(sp));
        sp
    }

    fn seen_by_gc(&self) -> bool {
        self.barriers || self.cont.tail().map_or(false, |c| c.is_gc_mode())
    }

    // =========================================================================
    // Fast path
    // =========================================================================

    fn thaw_fast(&mut self) -> usize {
        let mut chunk = self.cont.tail().expect("non-empty tail");
        let chunk_start_sp = chunk.sp();
        let full_chunk_size = chunk.stack_size() - chunk_start_sp;

        let argsize;
        let thaw_size;
        let empty;
        if full_chunk_size < BULK_THAW_THRESHOLD_WORDS {
            // Bulk thaw: the whole chunk in one copy.
            argsize = chunk.argsize();
            thaw_size = full_chunk_size;
            empty = true;
            let new_sp = chunk.stack_size();
            chunk.set_sp(new_sp);
            chunk.set_argsize(0);
            chunk.set_max_size(0);
        } else {
            // Single-frame thaw: peel the topmost compiled frame plus
            // its outgoing arguments.
            let mut stream: ChunkFrameStream<'_, CompiledOnly> =
                ChunkFrameStream::new(chunk, &self.rt.code, &self.rt.methods);
            let frame_size = stream.frame_size();
            argsize = stream.stack_argsize();
            stream.next(&mut RegisterMap::small());
            empty = stream.is_done();
            if empty {
                debug_assert_eq!(argsize, chunk.argsize());
                let new_sp = chunk.stack_size();
                chunk.set_sp(new_sp);
                chunk.set_argsize(0);
                chunk.set_max_size(0);
            } else {
                let next_pc = stream.current_pc();
                chunk.set_sp(chunk_start_sp + frame_size);
                let new_max_size = chunk.max_size() - frame_size;
                chunk.set_max_size(new_max_size);
                chunk.set_pc(next_pc);
                debug_assert_eq!(chunk.read_ret_pc(chunk.sp()), next_pc);
            }
            thaw_size = frame_size + argsize;
        }

        let is_last = empty && chunk.parent().is_none();

        let entry_sp = self.cont.entry_sp();
        let stack_sp = frame_align_index(entry_sp - thaw_size);
        let bottom_sp = frame_align_index(entry_sp - argsize);

        chunk.copy_to_stack(
            self.thread.stack_mut(),
            chunk_start_sp - METADATA_WORDS,
            stack_sp - METADATA_WORDS,
            thaw_size + METADATA_WORDS,
        );
        debug_assert!(stack_sp + thaw_size <= entry_sp);
        debug_assert!(entry_sp <= stack_sp + thaw_size + ALIGN_WIGGLE);

        self.cont.set_argsize(argsize);
        self.cont.write(self.thread);

        self.patch_return(bottom_sp, is_last);
        stack_sp
    }

    /// Install the return barrier (or the true entry pc on the last
    /// thaw) in the bottom thawed frame's return slot.
    fn patch_return(&mut self, bottom_sp: usize, is_last: bool) {
        let pc = if is_last {
            self.cont.entry_pc()
        } else {
            self.rt.stubs.return_barrier_pc()
        };
        platform::patch_ret_pc(self.thread.stack_mut(), bottom_sp, pc);
    }

    // =========================================================================
    // Slow path
    // =========================================================================

    fn thaw_slow(&mut self, return_barrier: bool) -> usize {
        self.align_size = 0;
        self.frames = 0;
        let num_frames = if return_barrier { 1 } else { 2 };

        let chunk = self.cont.tail().expect("non-empty tail");
        let mut stream: ChunkFrameStream<'_, Mixed> =
            ChunkFrameStream::new(chunk, &self.rt.code, &self.rt.methods);
        self.top_unextended_sp = stream.unextended_sp();

        let hf = stream.to_frame();
        let top = self.thaw_one_frame(&mut stream, hf, num_frames, true);
        let sp = self.finish_thaw(&top);
        self.cont.write(self.thread);
        self.thread.set_fastpath_watermark(self.fastpath);
        sp
    }

    fn thaw_one_frame(
        &mut self,
        stream: &mut ChunkFrameStream<'_, Mixed>,
        hf: Frame,
        num_frames: usize,
        top: bool,
    ) -> Frame {
        debug_assert!(num_frames > 0);
        debug_assert!(!hf.is_empty());
        if top && hf.is_stub() {
            self.recurse_thaw_stub_frame(stream, hf, num_frames)
        } else if hf.is_interpreted() {
            self.recurse_thaw_interpreted_frame(stream, hf, num_frames)
        } else {
            self.recurse_thaw_compiled_frame(stream, hf, num_frames, false)
        }
    }

    /// Shared recursion step: advance the stream past the current frame
    /// and either end at the entry or thaw the next frame first.
    /// Returns the caller's stack frame and whether the current frame
    /// is the bottom-most thawed one.
    fn recurse_thaw_managed_frame(
        &mut self,
        stream: &mut ChunkFrameStream<'_, Mixed>,
        mut num_frames: usize,
        current_interpreted: bool,
    ) -> (Frame, bool) {
        self.frames += 1;
        let argsize = stream.stack_argsize();
        stream.next(&mut RegisterMap::small());

        // Never leave a compiled caller of an interpreted frame as the
        // chunk's new top; thaw it too.
        if num_frames == 1 && !stream.is_done() && current_interpreted && stream.is_compiled() {
            num_frames += 1;
        }

        if num_frames == 1 || stream.is_done() {
            let entry = self.finalize_thaw(stream, if current_interpreted { 0 } else { argsize });
            (entry, true)
        } else {
            let hf = stream.to_frame();
            let f = self.thaw_one_frame(stream, hf, num_frames - 1, false);
            (f, false)
        }
    }

    /// End of the walk: position the chunk header past the thawed
    /// frames and hand back the entry frame as the bottom caller.
    fn finalize_thaw(&mut self, stream: &ChunkFrameStream<'_, Mixed>, argsize: usize) -> Frame {
        let mut chunk = self.cont.tail().expect("non-empty tail");

        if !stream.is_done() {
            let sp = stream.sp();
            let pc = stream.current_pc();
            chunk.set_sp(sp);
            chunk.set_pc(pc);
            // Keep the top-of-chunk metadata consistent for the next
            // stream and the next freeze.
            chunk.patch_ret_pc(sp, pc);
            if stream.is_interpreted() {
                platform::patch_saved_fp(chunk.words_mut(), sp, stream.fp());
            }
        } else {
            chunk.set_argsize(0);
            let new_sp = chunk.stack_size();
            chunk.set_sp(new_sp);
            chunk.set_pc(Pc::NULL);
        }

        let delta = stream.unextended_sp() - self.top_unextended_sp;
        let new_max_size = chunk.max_size().saturating_sub(delta);
        chunk.set_max_size(new_max_size);

        self.cont.set_argsize(argsize);

        Frame::resolve(
            &self.rt.code,
            self.thread.stack(),
            self.cont.entry_pc(),
            self.cont.entry_sp(),
            self.cont.entry_fp(),
            false,
        )
    }

    fn recurse_thaw_compiled_frame(
        &mut self,
        stream: &mut ChunkFrameStream<'_, Mixed>,
        hf: Frame,
        num_frames: usize,
        stub_caller: bool,
    ) -> Frame {
        debug_assert!(!hf.is_interpreted());
        if !stub_caller && self.seen_by_gc() {
            // The stub walk already applied barriers with a full map.
            let chunk = self.cont.tail().expect("non-empty tail");
            chunk.do_store_barriers(chunk.addr(), &self.rt.barriers, &RegisterMap::small());
        }

        let blob = hf.blob().expect("compiled frame without blob").clone();
        let frame_size = blob.frame_size();
        let own_argsize = blob.stack_argsize();

        let (caller, bottom) = self.recurse_thaw_managed_frame(stream, num_frames, false);

        // Alignment headroom owed whenever an interpreted neighbor is
        // or stays adjacent.
        let chunk = self.cont.tail().expect("non-empty tail");
        if (!bottom && caller.is_interpreted())
            || (bottom && !chunk.is_empty() && self.rt.code.is_interpreted_pc(chunk.pc()))
        {
            self.align_size += ALIGN_WIGGLE;
        }

        // Arguments travel with the frame when it lands against the
        // entry or an interpreted caller; against a compiled caller
        // they already live in the caller's frame.
        let added_argsize = if bottom || caller.is_interpreted() {
            own_argsize
        } else {
            0
        };
        let fsize = frame_size + added_argsize;

        let f_sp = if bottom {
            frame_align_index(self.cont.entry_sp() - own_argsize) - frame_size
        } else if caller.is_interpreted() {
            // An interpreted caller's extended sp need not be aligned;
            // pad between the frames to keep compiled sps aligned.
            frame_align_index(caller.unextended_sp - frame_size)
        } else {
            caller.unextended_sp - frame_size
        };
        let mut f = Frame::from_parts(hf.pc, f_sp, f_sp, 0, false, Some(blob.clone()));

        chunk.copy_to_stack(
            self.thread.stack_mut(),
            hf.unextended_sp - METADATA_WORDS,
            f_sp - METADATA_WORDS,
            fsize + METADATA_WORDS,
        );

        self.patch(&f, &caller, bottom);

        if hf.kind() == FrameKind::Deoptimized {
            self.maybe_set_fastpath(f.sp);
        } else if blob.is_marked_for_deoptimization() || self.thread.interp_only_mode {
            // The frame cannot rely on code patching once resumed;
            // deoptimize it in place.
            let handler = blob.deopt_handler();
            f.pc = handler;
            self.deopt_patches.push((f.sp, handler));
            self.maybe_set_fastpath(f.sp);
        }

        if bottom {
            let mut chunk = self.cont.tail().expect("non-empty tail");
            if chunk.has_bitmap() && added_argsize > 0 {
                // The argument words now live in the parent frame.
                chunk.clear_bitmap_bits(hf.unextended_sp + frame_size, added_argsize);
            }
        }

        f
    }

    fn recurse_thaw_interpreted_frame(
        &mut self,
        stream: &mut ChunkFrameStream<'_, Mixed>,
        hf: Frame,
        num_frames: usize,
    ) -> Frame {
        debug_assert!(hf.is_interpreted());
        if self.seen_by_gc() {
            let chunk = self.cont.tail().expect("non-empty tail");
            chunk.do_store_barriers(chunk.addr(), &self.rt.barriers, &RegisterMap::small());
        }

        let chunk = self.cont.tail().expect("non-empty tail");
        let method = interp::method_of(chunk.words(), hf.fp, &self.rt.methods)
            .expect("interpreted frame without method");
        let locals = method.max_locals;
        let argsize = method.size_of_parameters;

        let (caller, bottom) = self.recurse_thaw_managed_frame(stream, num_frames, true);

        self.align_size += ALIGN_WIGGLE;

        let hf_bottom = hf.fp + interp::LOCALS_OFFSET + locals;
        let fsize = hf_bottom - hf.unextended_sp;

        // Locals end against the entry (bottom) or overlap the caller's
        // outgoing area.
        let frame_bottom = if bottom {
            self.cont.entry_sp()
        } else {
            caller.unextended_sp + argsize
        };
        let f_fp = frame_bottom - interp::LOCALS_OFFSET - locals;
        let f_usp = f_fp - (hf.fp - hf.unextended_sp);
        let f = Frame::from_parts(hf.pc, f_usp, f_usp, f_fp, false, hf.blob().cloned());

        chunk.copy_to_stack(
            self.thread.stack_mut(),
            hf.fp + interp::LOCALS_OFFSET,
            f_fp + interp::LOCALS_OFFSET,
            locals,
        );
        chunk.copy_to_stack(
            self.thread.stack_mut(),
            hf.unextended_sp,
            f_usp,
            fsize - locals,
        );

        interp::derelativize_metadata(chunk.words(), hf.fp, self.thread.stack_mut(), f_fp, &method);
        self.patch(&f, &caller, bottom);
        self.maybe_set_fastpath(f.sp);

        if bottom {
            let mut chunk = self.cont.tail().expect("non-empty tail");
            if chunk.has_bitmap() && locals > 0 {
                chunk.clear_bitmap_bits(hf_bottom - locals, locals);
            }
        }

        f
    }

    /// A safepoint stub frozen by forced preemption sits on top; thaw
    /// its compiled caller with a full register map, then the stub.
    fn recurse_thaw_stub_frame(
        &mut self,
        stream: &mut ChunkFrameStream<'_, Mixed>,
        hf: Frame,
        num_frames: usize,
    ) -> Frame {
        self.frames += 1;

        // Crossing the stub records the spill slots that hold the
        // caller's callee-saved references.
        let mut map = RegisterMap::full_map();
        stream.next(&mut map);
        debug_assert!(!stream.is_done());
        debug_assert_eq!(
            map.callee_saved_slots().len(),
            hf.ref_map().map_or(0, |m| m.len())
        );

        if self.seen_by_gc() {
            // The caller's reference set includes the stub's spill slots.
            let chunk = self.cont.tail().expect("non-empty tail");
            chunk.do_store_barriers(chunk.addr(), &self.rt.barriers, &map);
        }

        let caller_hf = stream.to_frame();
        let caller = self.recurse_thaw_compiled_frame(stream, caller_hf, num_frames, true);
        debug_assert!(!caller.is_interpreted());

        let blob = hf.blob().expect("stub frame without blob").clone();
        let frame_size = blob.frame_size();
        let f_sp = caller.unextended_sp - frame_size;
        let f = Frame::from_parts(hf.pc, f_sp, f_sp, 0, false, Some(blob));

        let chunk = self.cont.tail().expect("non-empty tail");
        chunk.copy_to_stack(
            self.thread.stack_mut(),
            hf.sp - METADATA_WORDS,
            f_sp - METADATA_WORDS,
            frame_size + METADATA_WORDS,
        );

        self.patch(&f, &caller, false);
        f
    }

    /// Link a thawed frame to its caller on the stack.
    fn patch(&mut self, f: &Frame, caller: &Frame, bottom: bool) {
        let boundary = if f.is_interpreted() {
            f.fp + interp::LOCALS_OFFSET
        } else {
            f.sp + f.blob().map_or(0, |b| b.frame_size())
        };

        if bottom {
            debug_assert_eq!(caller.sp, self.cont.entry_sp());
            let pc = if self.cont.is_empty() {
                caller.pc
            } else {
                self.rt.stubs.return_barrier_pc()
            };
            platform::patch_ret_pc(self.thread.stack_mut(), boundary, pc);
        }

        platform::patch_saved_fp(self.thread.stack_mut(), boundary, caller.fp);

        if f.is_interpreted() {
            interp::patch_sender_sp(self.thread.stack_mut(), f.fp, caller.unextended_sp);
        }
    }

    fn maybe_set_fastpath(&mut self, sp: usize) {
        self.fastpath = Some(self.fastpath.map_or(sp, |cur| cur.max(sp)));
    }

    /// Trim or retain the emptied chunk, realign the final sp, apply
    /// deferred deopt patches and push the synthetic return frame.
    fn finish_thaw(&mut self, f: &Frame) -> usize {
        let mut chunk = self.cont.tail().expect("non-empty tail");

        if chunk.is_empty() {
            if self.seen_by_gc() {
                // Unusable for another freeze; drop it from the list.
                self.cont.clear_tail_to(chunk.parent());
            } else {
                chunk.set_has_mixed_frames(false);
            }
            chunk.set_max_size(0);
        } else {
            let new_max_size = chunk.max_size().saturating_sub(self.align_size);
            chunk.set_max_size(new_max_size);
        }

        let mut sp = f.sp;
        if !is_frame_aligned(sp) {
            debug_assert!(f.is_interpreted());
            sp -= 1;
        }

        for (frame_sp, handler) in std::mem::take(&mut self.deopt_patches) {
            platform::patch_ret_pc(self.thread.stack_mut(), frame_sp, handler);
        }

        self.push_return_frame(f, sp);
        sp
    }

    /// Write the synthetic return frame's metadata below the final sp;
    /// the thaw stub jumps through it into the topmost thawed frame.
    fn push_return_frame(&mut self, f: &Frame, sp: usize) {
        platform::patch_ret_pc(self.thread.stack_mut(), sp, f.pc);
        platform::patch_saved_fp(self.thread.stack_mut(), sp, f.fp);
    }
}

// =============================================================================
// Tests
// =============================================================================
