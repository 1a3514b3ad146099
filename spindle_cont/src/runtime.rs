//! Runtime aggregate and entry-point resolution.
//!
//! Freeze and thaw are monomorphized over the barrier set, the way the
//! rest of this runtime monomorphizes its GC-dependent hot paths. The
//! [`ContinuationRuntime`] is resolved once at init, after the barrier
//! set is chosen, and is immutable thereafter; it bundles the code
//! cache, method table, stub routines and chunk heap the engines
//! consult, and exposes the four stub-facing entry points.

use crate::chunk::StackChunk;
use crate::freeze::{self, FreezeResult};
use crate::stubs::StubRoutines;
use crate::thaw::{self, ThawKind};
use crate::thread::CarrierThread;
use crate::wrapper::{Continuation, ScopeId};
use spindle_core::code::{CodeCache, MethodTable};
use spindle_gc::{BarrierSet, ChunkHeap, HeapConfig};

/// The resolved continuation runtime.
pub struct ContinuationRuntime<B: BarrierSet> {
    /// Code cache: pc resolution for every stack walk.
    pub code: CodeCache,
    /// Interpreted-method registry.
    pub methods: MethodTable,
    /// Installed stub blobs.
    pub stubs: StubRoutines,
    /// Chunk heap.
    pub heap: ChunkHeap<StackChunk>,
    /// Store-barrier set.
    pub barriers: B,
    /// Forces every thaw onto the slow path, keeping frame pointers
    /// exact for external unwinders.
    pub preserve_frame_pointer: bool,
}

impl<B: BarrierSet> ContinuationRuntime<B> {
    /// Resolve the runtime for a barrier configuration. Installs the
    /// stubs into a fresh code cache.
    pub fn resolve(heap_config: HeapConfig, barriers: B) -> Self {
        let code = CodeCache::new();
        let stubs = StubRoutines::install(&code);
        Self {
            code,
            methods: MethodTable::new(),
            stubs,
            heap: ChunkHeap::new(heap_config),
            barriers,
            preserve_frame_pointer: false,
        }
    }

    /// Freeze the mounted continuation; `sp` is the native sp at the
    /// yield stub. Returns 0 on success or a positive status code.
    pub fn freeze(&self, thread: &mut CarrierThread, cont: &mut Continuation, sp: usize) -> u8 {
        freeze::freeze(self, thread, cont, sp) as u8
    }

    /// Freeze under forced preemption: pinning stays a status code and
    /// the top frame may be a safepoint stub.
    pub fn freeze_preempt(
        &self,
        thread: &mut CarrierThread,
        cont: &mut Continuation,
        sp: usize,
    ) -> u8 {
        freeze::freeze_preempt(self, thread, cont, sp) as u8
    }

    /// Size the native stack room a thaw needs, in bytes; 0 signals
    /// stack overflow.
    pub fn prepare_thaw(
        &self,
        thread: &CarrierThread,
        cont: &mut Continuation,
        return_barrier: bool,
    ) -> usize {
        thaw::prepare_thaw(self, thread, cont, return_barrier)
    }

    /// Thaw frames from the tail chunk; returns the native sp at which
    /// execution resumes.
    pub fn thaw(&self, thread: &mut CarrierThread, cont: &mut Continuation, kind: ThawKind) -> usize {
        thaw::thaw(self, thread, cont, kind)
    }

    /// Advisory pin query for the language frontend.
    pub fn is_pinned(&self, thread: &CarrierThread, scope: ScopeId) -> u8 {
        freeze::is_pinned(self, thread, scope) as u8
    }

    /// Whether a freeze status is a benign pin.
    pub fn is_pin_status(status: u8) -> bool {
        FreezeResult::from_u8(status).map_or(false, |r| r.is_pinned())
    }
}
