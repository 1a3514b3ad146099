//! Freeze engine: capture live native frames into a stack chunk.
//!
//! The hot case is the **fast path**: every frame between the yield
//! stub and the entry is compiled, the tail chunk needs no barriers,
//! and the whole region is captured with one bulk copy plus O(1)
//! patching. Everything else goes through the **slow path**, a
//! sender-by-sender recursive walk that relativizes interpreted frames
//! and applies store barriers when the chunk demands them.
//!
//! Pinning is not an error. A frame that cannot be frozen (native, or
//! holding a monitor, or a critical section on the entry) aborts the
//! whole operation with a status code and leaves the continuation
//! object and chunk list exactly as found; the single publish step is
//! `cont.write()`, which only runs on success.
//!
//! ```text
//!   native stack                          tail chunk
//!   ┌─────────────┐ entry_sp              ┌─────────────┐ stack_size
//!   │ entry frame │                       │ bottom args │
//!   ├─────────────┤ ─┐                    ├─────────────┤
//!   │ frame C     │  │                    │ frame C     │
//!   │ frame B     │  │  one bulk copy →   │ frame B     │
//!   │ frame A     │  │                    │ frame A     │
//!   ├─────────────┤ ─┘                    ├─────────────┤ sp
//!   │ yield stub  │ sp                    │ pc, fp      │ sp - 2
//!   └─────────────┘                       └─────────────┘
//! ```

use crate::chunk::{ChunkRef, StackChunk};
use crate::frame::{Frame, FrameKind, RegisterMap};
use crate::interp;
use crate::runtime::ContinuationRuntime;
use crate::stream::{ChunkFrameStream, Mixed};
use crate::thread::CarrierThread;
use crate::wrapper::{Continuation, ContinuationWrapper, PinnedReason, ScopeId};
use spindle_core::platform::{
    self, frame_align_index, frame_align_words, ALIGN_WIGGLE, METADATA_WORDS,
};
use spindle_gc::BarrierSet;

// =============================================================================
// Freeze Result
// =============================================================================

/// Status of a freeze attempt, as returned through the yield stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FreezeResult {
    /// All frames frozen; the topmost now lives in the tail chunk.
    Ok = 0,
    /// Recursion-end sentinel, never returned to the caller.
    OkBottom = 1,
    /// A critical section on the entry forbids yielding.
    PinnedCs = 2,
    /// A native or un-scannable frame is present.
    PinnedNative = 3,
    /// A frame holds an object monitor.
    PinnedMonitor = 4,
    /// Stack overflow or allocation failure.
    Exception = 5,
}

impl FreezeResult {
    /// Convert from the raw status code.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::OkBottom),
            2 => Some(Self::PinnedCs),
            3 => Some(Self::PinnedNative),
            4 => Some(Self::PinnedMonitor),
            5 => Some(Self::Exception),
            _ => None,
        }
    }

    /// Whether this is one of the benign pin statuses.
    #[inline]
    pub const fn is_pinned(self) -> bool {
        matches!(self, Self::PinnedCs | Self::PinnedNative | Self::PinnedMonitor)
    }

    /// Status name, for diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ok => "freeze_ok",
            Self::OkBottom => "freeze_ok_bottom",
            Self::PinnedCs => "freeze_pinned_cs",
            Self::PinnedNative => "freeze_pinned_native",
            Self::PinnedMonitor => "freeze_pinned_monitor",
            Self::Exception => "freeze_exception",
        }
    }
}

impl std::fmt::Display for FreezeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Freeze the mounted continuation of `thread`; `sp` is the native sp
/// at the yield stub frame.
pub fn freeze<B: BarrierSet>(
    rt: &ContinuationRuntime<B>,
    thread: &mut CarrierThread,
    cont: &mut Continuation,
    sp: usize,
) -> FreezeResult {
    freeze_internal(rt, thread, cont, sp, false)
}

/// Freeze under forced preemption: the top frame may be a safepoint
/// stub and stack overflow degrades to a status code.
pub fn freeze_preempt<B: BarrierSet>(
    rt: &ContinuationRuntime<B>,
    thread: &mut CarrierThread,
    cont: &mut Continuation,
    sp: usize,
) -> FreezeResult {
    freeze_internal(rt, thread, cont, sp, true)
}

fn freeze_internal<B: BarrierSet>(
    rt: &ContinuationRuntime<B>,
    thread: &mut CarrierThread,
    cont: &mut Continuation,
    sp: usize,
    preempt: bool,
) -> FreezeResult {
    debug_assert!(!thread.has_pending_stack_overflow());
    let entry = thread.entry().expect("freeze without mounted continuation");
    let entry_sp = entry.entry_sp;
    let pinned_cs = entry.pin_count > 0;

    // Drop a watermark that no longer covers live frames.
    if let Some(watermark) = thread.fastpath_watermark() {
        if watermark > entry_sp || watermark < sp {
            thread.set_fastpath_watermark(None);
        }
    }

    if pinned_cs {
        cont.set_pinned_reason(PinnedReason::CriticalSection);
        return FreezeResult::PinnedCs;
    }

    let mut engine = FreezeEngine::new(rt, thread, cont, preempt);
    let fast = engine.can_freeze_fast();
    let result = if fast && engine.is_chunk_available_for_fast_freeze(sp) {
        engine.try_freeze_fast(sp, true)
    } else if fast {
        engine.try_freeze_fast(sp, false)
    } else {
        engine.freeze_slow()
    };
    engine.epilog(result)
}

// =============================================================================
// Freeze Engine
// =============================================================================

struct FreezeEngine<'a, B: BarrierSet> {
    rt: &'a ContinuationRuntime<B>,
    thread: &'a mut CarrierThread,
    cont: ContinuationWrapper<'a>,
    preempt: bool,
    /// Set when the tail chunk (possibly freshly allocated) lives in
    /// barriered memory; the slow path sweeps barriers after copying.
    barriers: bool,
    /// Set when chunk allocation went through the safepointing shared
    /// path; disqualifies the fast path.
    alloc_safepointed: bool,
    /// Sender sp of the bottom-most freezable frame.
    bottom_address: usize,
    /// Total words accumulated by the slow walk, metadata included.
    size: usize,
    /// Alignment headroom accumulated for interpreted frames.
    align_size: usize,
    /// Frames visited by the slow walk.
    frames: usize,
    /// Overlap applied to the bottom frame by `finalize_freeze`.
    bottom_overlap: usize,
    /// Register map carried by the slow walk; upgraded to a full map
    /// when a safepoint stub is frozen, so the barrier sweep visits the
    /// stub's reference spill slots.
    map: RegisterMap,
}

impl<'a, B: BarrierSet> FreezeEngine<'a, B> {
    fn new(
        rt: &'a ContinuationRuntime<B>,
        thread: &'a mut CarrierThread,
        cont: &'a mut Continuation,
        preempt: bool,
    ) -> Self {
        let cont = ContinuationWrapper::open(cont, thread);
        let bottom_address = frame_align_index(cont.entry_sp() - cont.argsize());
        Self {
            rt,
            thread,
            cont,
            preempt,
            barriers: false,
            alloc_safepointed: false,
            bottom_address,
            size: 0,
            align_size: 0,
            frames: 0,
            bottom_overlap: 0,
            map: RegisterMap::small(),
        }
    }

    fn epilog(mut self, result: FreezeResult) -> FreezeResult {
        match result {
            FreezeResult::Ok => {
                debug_assert!(self.cont.is_written());
                debug_assert!(!self.cont.is_empty());
                if let Some(chunk) = self.cont.tail() {
                    chunk.verify();
                }
            }
            FreezeResult::PinnedNative => self.cont.set_pinned_reason(PinnedReason::Native),
            FreezeResult::PinnedMonitor => self.cont.set_pinned_reason(PinnedReason::Monitor),
            _ => {}
        }
        result
    }

    fn can_freeze_fast(&self) -> bool {
        !self.preempt && self.thread.cont_fastpath() && self.thread.held_monitor_count() == 0
    }

    // =========================================================================
    // Fast path
    // =========================================================================

    /// Whether the tail chunk can absorb a compiled-only freeze of the
    /// region above `sp` without allocation.
    fn is_chunk_available_for_fast_freeze(&self, sp: usize) -> bool {
        let Some(chunk) = self.cont.tail() else {
            return false;
        };
        if chunk.is_gc_mode() || chunk.has_mixed_frames() || self.rt.heap.requires_barriers(chunk) {
            return false;
        }
        let top = sp + METADATA_WORDS;
        let bottom = self.cont.entry_sp() - frame_align_words(self.cont.argsize());
        let mut size = bottom - top;
        if chunk.sp() < chunk.stack_size() {
            size -= self.cont.argsize();
        }
        chunk.sp() >= METADATA_WORDS + size
    }

    fn try_freeze_fast(&mut self, sp: usize, chunk_available: bool) -> FreezeResult {
        let frozen = if chunk_available {
            self.freeze_fast(sp, true)
        } else {
            self.freeze_fast(sp, false)
        };
        if frozen {
            return FreezeResult::Ok;
        }
        if self.thread.has_pending_stack_overflow() {
            return FreezeResult::Exception;
        }
        self.freeze_slow()
    }

    /// Bulk-copy the compiled-only region into the tail chunk. Returns
    /// false when the fast path must be retried slowly.
    fn freeze_fast(&mut self, sp: usize, chunk_available: bool) -> bool {
        let argsize = self.cont.argsize();
        let cont_stack_top = sp + METADATA_WORDS;
        let cont_stack_bottom = self.cont.entry_sp() - frame_align_words(argsize);
        let cont_size = cont_stack_bottom - cont_stack_top;
        debug_assert!(cont_size > 0);

        let mut chunk;
        let chunk_start_sp;
        let mut reused_nonempty = false;

        if chunk_available {
            chunk = self.cont.tail().expect("available chunk");
            if chunk.sp() < chunk.stack_size() {
                // Reuse with argument overlap: the top `argsize` words of
                // the chunk's current top frame are the bottom frame's
                // caller arguments and will be overwritten by the copy.
                reused_nonempty = true;
                chunk_start_sp = chunk.sp() + argsize;
                debug_assert!(chunk_start_sp <= chunk.stack_size());
                let new_max_size = chunk.max_size() + cont_size - argsize;
                chunk.set_max_size(new_max_size);

                // The chunk's copy of the bottom frame's saved fp may
                // carry data that went stale since the thaw; refresh the
                // stack's copy from the chunk before freezing over it.
                let bottom_sp = cont_stack_bottom - argsize;
                debug_assert_eq!(bottom_sp, self.bottom_address);
                debug_assert!(self
                    .rt
                    .stubs
                    .is_return_barrier(platform::read_ret_pc(self.thread.stack(), bottom_sp)));
                let chunk_fp = platform::read_saved_fp(chunk.words(), chunk.sp());
                platform::patch_saved_fp(self.thread.stack_mut(), bottom_sp, chunk_fp);
            } else {
                chunk_start_sp = chunk.sp();
                debug_assert_eq!(chunk_start_sp, chunk.stack_size());
                chunk.set_max_size(cont_size);
                chunk.set_argsize(argsize);
            }
        } else {
            match self.allocate_chunk(cont_size + METADATA_WORDS) {
                Some(c) => chunk = c,
                None => return false,
            }
            if self.barriers || self.alloc_safepointed || !self.thread.cont_fastpath() {
                // Allocation safepointed or landed in barriered memory;
                // retry on the slow path, which knows how to sweep
                // barriers over the frozen region.
                return false;
            }
            chunk.set_max_size(cont_size);
            chunk.set_argsize(argsize);
            // A fresh chunk freezes together with the bottom frame's
            // stack arguments; they are stored again in the parent.
            chunk_start_sp = chunk.stack_size();
        }

        debug_assert!(!chunk.has_mixed_frames() && !chunk.is_gc_mode() && !chunk.has_bitmap());

        let old_pc = chunk.pc();

        // Unwind before writing: an asynchronous walker sees either no
        // continuation frames on the stack or a consistent chunk.
        self.unwind_frames();

        let chunk_new_sp = chunk_start_sp - cont_size;
        chunk.copy_from_stack(
            self.thread.stack(),
            cont_stack_top - METADATA_WORDS,
            chunk_new_sp - METADATA_WORDS,
            cont_size + METADATA_WORDS,
        );

        if reused_nonempty {
            // Re-link the new bottom frame to the prior top frame.
            let chunk_bottom_sp = chunk_new_sp + cont_size - argsize;
            chunk.patch_ret_pc(chunk_bottom_sp, old_pc);
        }

        chunk.set_sp(chunk_new_sp);
        chunk.set_pc(platform::read_ret_pc(self.thread.stack(), cont_stack_top));

        self.cont.write(self.thread);
        true
    }

    // =========================================================================
    // Slow path
    // =========================================================================

    fn freeze_slow(&mut self) -> FreezeResult {
        self.size = 0;
        self.align_size = 0;
        self.frames = 0;
        self.bottom_overlap = 0;
        self.map = RegisterMap::small();

        let f = self.freeze_start_frame();
        match self.freeze_frame(f, 0, false, true) {
            Ok(top) => {
                self.finish_freeze(&top);
                self.cont.write(self.thread);
                FreezeResult::Ok
            }
            Err(result) => result,
        }
    }

    fn freeze_start_frame(&self) -> Frame {
        let f = Frame::last_frame(self.thread, &self.rt.code);
        if !self.preempt {
            debug_assert!(self.rt.stubs.is_yield_stub(f.pc));
            return f.sender(&self.rt.code, self.thread.stack());
        }
        // Forced preemption: the newest frame is a safepoint stub or an
        // interpreted frame interrupted at a poll.
        if !self.rt.code.is_interpreted_pc(f.pc) {
            debug_assert!(f.is_stub() && f.ref_map().is_some());
            let sender = f.sender(&self.rt.code, self.thread.stack());
            if self.rt.code.is_interpreted_pc(sender.pc) {
                return sender;
            }
        }
        f
    }

    /// Recursive per-frame walk. Returns the heap frame placed for `f`,
    /// which becomes the caller link of the frame above it.
    fn freeze_frame(
        &mut self,
        f: Frame,
        callee_argsize: usize,
        callee_interpreted: bool,
        top: bool,
    ) -> Result<Frame, FreezeResult> {
        if self.stack_overflow() {
            return Err(FreezeResult::Exception);
        }

        match f.kind() {
            FrameKind::Compiled | FrameKind::Deoptimized => {
                if f.ref_map().is_none() {
                    return Err(FreezeResult::PinnedNative);
                }
                if f.is_owning_monitor(self.thread) {
                    return Err(FreezeResult::PinnedMonitor);
                }
                self.recurse_freeze_compiled_frame(f, callee_argsize, callee_interpreted)
            }
            FrameKind::Interpreted => {
                if f.is_owning_monitor(self.thread) {
                    return Err(FreezeResult::PinnedMonitor);
                }
                let native = interp::method_of(self.thread.stack(), f.fp, &self.rt.methods)
                    .map_or(false, |m| m.is_native);
                if native {
                    return Err(FreezeResult::PinnedNative);
                }
                self.recurse_freeze_interpreted_frame(f, callee_argsize, callee_interpreted)
            }
            FrameKind::Stub if self.preempt && top => self.recurse_freeze_stub_frame(f),
            _ => Err(FreezeResult::PinnedNative),
        }
    }

    /// Shared recursion step: accumulate the frame, then either end the
    /// recursion at the entry or walk to the sender. Returns the caller
    /// heap frame and whether `f` is the bottom-most frozen frame.
    fn recurse(
        &mut self,
        f: &Frame,
        fsize: usize,
        argsize: usize,
    ) -> Result<(Frame, bool), FreezeResult> {
        debug_assert!(fsize > 0);
        self.size += fsize;
        self.frames += 1;

        if f.frame_bottom(self.thread.stack(), &self.rt.methods) >= self.bottom_address - 1 {
            let caller = self.finalize_freeze(f, argsize)?;
            Ok((caller, true))
        } else {
            let sender = f.sender(&self.rt.code, self.thread.stack());
            let hf = self.freeze_frame(sender, argsize, f.is_interpreted(), false)?;
            Ok((hf, false))
        }
    }

    /// Recursion end: pick or allocate the chunk every frame unwinds
    /// into, and hand back its prior top frame as the bottom caller.
    fn finalize_freeze(&mut self, callee: &Frame, argsize: usize) -> Result<Frame, FreezeResult> {
        self.size += METADATA_WORDS;

        let mut overlap = 0;
        let mut unextended_sp = None;
        if let Some(chunk) = self.cont.tail() {
            let mut usp = chunk.sp();
            if !chunk.is_empty() {
                let top_interpreted = self.rt.code.is_interpreted_pc(chunk.pc());
                if top_interpreted {
                    let stream: ChunkFrameStream<'_, Mixed> =
                        ChunkFrameStream::new(chunk, &self.rt.code, &self.rt.methods);
                    usp = stream.unextended_sp();
                }
                if callee.is_interpreted() == top_interpreted {
                    overlap = argsize;
                }
            }
            unextended_sp = Some(usp);
        }

        self.size -= overlap;
        self.bottom_overlap = overlap;

        let needs_chunk = match (self.cont.tail(), unextended_sp) {
            (None, _) => true,
            (Some(chunk), Some(usp)) => {
                usp < self.size
                    || chunk.is_gc_mode()
                    || (!self.barriers && self.rt.heap.requires_barriers(chunk))
            }
            _ => true,
        };

        let mut chunk = if needs_chunk {
            // A fresh chunk stores the bottom frame's arguments itself.
            self.size += overlap;
            self.bottom_overlap = 0;
            let Some(mut c) = self.allocate_chunk(self.size) else {
                return Err(FreezeResult::Exception);
            };
            let new_sp = c.stack_size() - argsize;
            c.set_sp(new_sp);
            c.set_argsize(argsize);
            c
        } else {
            let mut c = self.cont.tail().expect("reusable chunk");
            if c.is_empty() {
                let new_sp = c.stack_size() - argsize;
                c.set_sp(new_sp);
                c.set_argsize(argsize);
                self.size += overlap;
                self.bottom_overlap = 0;
            }
            c
        };

        chunk.set_has_mixed_frames(true);
        debug_assert!(!self.barriers || self.rt.heap.requires_barriers(chunk));

        // Unwind before the first chunk write, as on the fast path.
        self.unwind_frames();

        let new_max_size = chunk.max_size() + self.size - METADATA_WORDS;
        chunk.set_max_size(new_max_size);

        let stream: ChunkFrameStream<'_, Mixed> =
            ChunkFrameStream::new(chunk, &self.rt.code, &self.rt.methods);
        Ok(stream.to_frame())
    }

    fn recurse_freeze_compiled_frame(
        &mut self,
        f: Frame,
        callee_argsize: usize,
        callee_interpreted: bool,
    ) -> Result<Frame, FreezeResult> {
        let blob = f.blob().expect("compiled frame without blob").clone();
        let frame_size = blob.frame_size();
        let argsize = blob.stack_argsize();
        let frame_top = f.unextended_sp + if callee_interpreted { 0 } else { callee_argsize };
        let fsize = f.sp + frame_size + argsize - frame_top;

        let (caller, bottom) = self.recurse(&f, fsize, argsize)?;

        let hf_sp = if bottom {
            let base = if caller.is_empty() {
                self.cont.tail().expect("chunk chosen by finalize").stack_size()
            } else {
                caller.unextended_sp
            };
            base + self.bottom_overlap - (frame_size + argsize)
        } else {
            caller.unextended_sp - frame_size
        };
        let hf = Frame::from_parts(f.pc, hf_sp, hf_sp, 0, true, Some(blob));

        let mut chunk = self.cont.tail().expect("chunk chosen by finalize");
        let skip = frame_top - f.unextended_sp;
        chunk.copy_from_stack(self.thread.stack(), frame_top, hf_sp + skip, fsize);

        if caller.is_interpreted() {
            self.align_size += ALIGN_WIGGLE;
        }
        self.patch(&f, &hf, &caller, bottom);
        Ok(hf)
    }

    fn recurse_freeze_interpreted_frame(
        &mut self,
        f: Frame,
        callee_argsize: usize,
        callee_interpreted: bool,
    ) -> Result<Frame, FreezeResult> {
        let method = interp::method_of(self.thread.stack(), f.fp, &self.rt.methods)
            .expect("interpreted frame without method");
        let locals = method.max_locals;
        let argsize = method.size_of_parameters;
        let frame_top = f.unextended_sp + if callee_interpreted { 0 } else { callee_argsize };
        let frame_bottom = f.fp + interp::LOCALS_OFFSET + locals;
        let fsize = frame_bottom - frame_top;

        let (caller, bottom) = self.recurse(&f, fsize, argsize)?;

        // Place the heap frame so its locals end against the caller.
        let locals_end = if bottom {
            let base = if caller.is_empty() {
                self.cont.tail().expect("chunk chosen by finalize").stack_size()
            } else {
                caller.unextended_sp
            };
            base + self.bottom_overlap
        } else {
            caller.unextended_sp + argsize
        };
        let hf_fp = locals_end - interp::LOCALS_OFFSET - locals;
        let hf_usp = hf_fp - (f.fp - f.unextended_sp);
        let hf_top = hf_fp - (f.fp - frame_top);
        let hf = Frame::from_parts(f.pc, hf_usp, hf_usp, hf_fp, true, f.blob().cloned());

        let mut chunk = self.cont.tail().expect("chunk chosen by finalize");
        // Locals and the rest copied separately: the locals overlap the
        // caller, the rest runs from the operand stack to the saved fp.
        chunk.copy_from_stack(
            self.thread.stack(),
            f.fp + interp::LOCALS_OFFSET,
            hf_fp + interp::LOCALS_OFFSET,
            locals,
        );
        chunk.copy_from_stack(self.thread.stack(), frame_top, hf_top, fsize - locals);

        interp::relativize_metadata(self.thread.stack(), f.fp, chunk.words_mut(), hf_fp, &method);

        self.align_size += ALIGN_WIGGLE;
        self.patch(&f, &hf, &caller, bottom);
        Ok(hf)
    }

    /// Forced preemption left a safepoint stub on top. The stub's frame
    /// holds the interrupted caller's callee-saved registers, so the
    /// walk upgrades to a full register map and records the spill slots
    /// once the stub lands in the chunk; the barrier sweep visits them.
    fn recurse_freeze_stub_frame(&mut self, f: Frame) -> Result<Frame, FreezeResult> {
        let blob = f.blob().expect("stub frame without blob").clone();
        let frame_size = blob.frame_size();
        self.size += frame_size;
        self.frames += 1;
        self.map = RegisterMap::full_map();

        let sender = f.sender(&self.rt.code, self.thread.stack());
        debug_assert!(sender.unextended_sp < self.bottom_address - 1);
        if sender.ref_map().is_none() {
            return Err(FreezeResult::PinnedNative);
        }
        if sender.is_owning_monitor(self.thread) {
            return Err(FreezeResult::PinnedMonitor);
        }

        let caller = self.recurse_freeze_compiled_frame(sender, 0, false)?;

        let hf_sp = caller.unextended_sp - frame_size;
        let hf = Frame::from_parts(f.pc, hf_sp, hf_sp, 0, true, Some(blob));
        let mut chunk = self.cont.tail().expect("chunk chosen by finalize");
        chunk.copy_from_stack(self.thread.stack(), f.sp, hf_sp, frame_size);

        // The spill slots now live at the stub's chunk position.
        self.map.update_with_stub_frame(&hf);
        Ok(hf)
    }

    /// Link the placed heap frame to its caller inside the chunk.
    fn patch(&mut self, f: &Frame, hf: &Frame, caller: &Frame, bottom: bool) {
        let mut chunk = self.cont.tail().expect("chunk chosen by finalize");
        // The frame's link slots toward its caller: the return-address
        // and saved-fp words at its sender boundary.
        let boundary = if f.is_interpreted() {
            hf.fp + interp::LOCALS_OFFSET
        } else {
            hf.sp + f.blob().map_or(0, |b| b.frame_size())
        };

        if bottom {
            if !caller.is_empty() {
                // Re-link to the prior chunk top, as the fast path does.
                platform::patch_ret_pc(chunk.words_mut(), boundary, caller.pc);
            }
        } else {
            debug_assert!(!caller.is_empty());
        }

        if caller.is_interpreted() && !caller.is_empty() {
            // Keep the interpreted caller's fp recoverable by walkers.
            platform::patch_saved_fp(chunk.words_mut(), boundary, caller.fp);
        }
    }

    fn finish_freeze(&mut self, top: &Frame) {
        let mut chunk = self.cont.tail().expect("chunk chosen by finalize");

        // Top-of-chunk metadata: the continuation pc and, for an
        // interpreted top frame, its fp as a chunk offset.
        platform::patch_ret_pc(chunk.words_mut(), top.sp, top.pc);
        if top.is_interpreted() {
            platform::patch_saved_fp(chunk.words_mut(), top.sp, top.fp);
        }

        chunk.set_sp(top.sp);
        chunk.set_pc(top.pc);
        let new_max_size = chunk.max_size() + self.align_size;
        chunk.set_max_size(new_max_size);

        if self.barriers {
            chunk.do_store_barriers(chunk.addr(), &self.rt.barriers, &self.map);
        }
    }

    // =========================================================================
    // Support
    // =========================================================================

    /// Reset the anchor to the entry. Runs after the last possible
    /// safepoint and before any chunk write, so an asynchronous walk
    /// sees either the pre-freeze stack or the published chunk.
    fn unwind_frames(&mut self) {
        self.thread.set_anchor_to_entry();
    }

    /// Detect overflow of the walk itself. Raises on the carrier unless
    /// freezing for a forced preemption.
    fn stack_overflow(&mut self) -> bool {
        if self.frames >= self.thread.freeze_recursion_limit() {
            if !self.preempt {
                self.thread.raise_stack_overflow();
            }
            return true;
        }
        false
    }

    /// Allocate a chunk of `stack_size` words and stage it as the tail.
    fn allocate_chunk(&mut self, stack_size: usize) -> Option<ChunkRef> {
        if stack_size > self.rt.heap.chunk_max_words() {
            if !self.preempt {
                self.thread.raise_stack_overflow();
            }
            return None;
        }

        let parent = self.cont.last_nonempty_chunk();
        let mut chunk = match self.rt.heap.try_tlab_alloc(StackChunk::new(stack_size, self.cont.id())) {
            Some(c) => c,
            None => {
                let alloc = self.rt.heap.allocate(StackChunk::new(stack_size, self.cont.id()));
                self.alloc_safepointed = alloc.safepointed;
                let c = alloc.object?;
                self.barriers = alloc.requires_barriers;
                c
            }
        };

        debug_assert_eq!(chunk.stack_size(), stack_size);
        debug_assert!(chunk.is_empty());
        chunk.set_parent(parent);
        self.cont.set_tail(chunk);
        Some(chunk)
    }
}

// =============================================================================
// Pinned query
// =============================================================================

/// Advisory query: would a freeze up to `scope` pin, and why. Returns
/// [`FreezeResult::Ok`] when yielding is possible.
pub fn is_pinned<B: BarrierSet>(
    rt: &ContinuationRuntime<B>,
    thread: &CarrierThread,
    scope: ScopeId,
) -> FreezeResult {
    let Some(mut entry) = thread.entry() else {
        return FreezeResult::Ok;
    };
    if entry.pin_count > 0 {
        return FreezeResult::PinnedCs;
    }

    let mut f = Frame::last_frame(thread, &rt.code);
    if rt.stubs.is_yield_stub(f.pc) {
        f = f.sender(&rt.code, thread.stack());
    }

    loop {
        // Walk off the innermost entry's frames first. The entry
        // boundary sits below the entry sp by the bottom frame's
        // argument overlap.
        let boundary = platform::frame_align_index(entry.entry_sp - entry.argsize);
        while f.unextended_sp < boundary {
            let pinned = frame_pin_status(rt, thread, &f);
            if pinned != FreezeResult::Ok {
                return pinned;
            }
            f = f.sender(&rt.code, thread.stack());
        }
        if entry.scope == scope {
            return FreezeResult::Ok;
        }
        match &entry.parent {
            Some(parent) => {
                entry = &**parent;
                if entry.pin_count > 0 {
                    return FreezeResult::PinnedCs;
                }
            }
            None => return FreezeResult::Ok,
        }
    }
}

fn frame_pin_status<B: BarrierSet>(
    rt: &ContinuationRuntime<B>,
    thread: &CarrierThread,
    f: &Frame,
) -> FreezeResult {
    match f.kind() {
        FrameKind::Interpreted => {
            if f.is_owning_monitor(thread) {
                FreezeResult::PinnedMonitor
            } else if interp::method_of(thread.stack(), f.fp, &rt.methods)
                .map_or(false, |m| m.is_native)
            {
                FreezeResult::PinnedNative
            } else {
                FreezeResult::Ok
            }
        }
        FrameKind::Compiled | FrameKind::Deoptimized => {
            if f.ref_map().is_none() {
                FreezeResult::PinnedNative
            } else if f.is_owning_monitor(thread) {
                FreezeResult::PinnedMonitor
            } else {
                FreezeResult::Ok
            }
        }
        _ => FreezeResult::PinnedNative,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_round_trip() {
        for result in [
            FreezeResult::Ok,
            FreezeResult::OkBottom,
            FreezeResult::PinnedCs,
            FreezeResult::PinnedNative,
            FreezeResult::PinnedMonitor,
            FreezeResult::Exception,
        ] {
            assert_eq!(FreezeResult::from_u8(result as u8), Some(result));
        }
        assert_eq!(FreezeResult::from_u8(6), None);
    }

    #[test]
    fn test_pin_classification() {
        assert!(FreezeResult::PinnedCs.is_pinned());
        assert!(FreezeResult::PinnedNative.is_pinned());
        assert!(FreezeResult::PinnedMonitor.is_pinned());
        assert!(!FreezeResult::Ok.is_pinned());
        assert!(!FreezeResult::Exception.is_pinned());
    }

    #[test]
    fn test_result_names() {
        assert_eq!(FreezeResult::Ok.to_string(), "freeze_ok");
        assert_eq!(FreezeResult::PinnedMonitor.to_string(), "freeze_pinned_monitor");
    }
}
