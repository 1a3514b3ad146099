//! Runtime stub installation.
//!
//! The yield stub, the return-barrier stub and the safepoint stub are
//! registered into the code cache once at runtime init; their addresses
//! are then used as sentinel pcs in frozen bottom-of-chunk return slots
//! and as walk anchors. The continuation-entry blob is registered here
//! too, so entry frames resolve to a compiled blob like any other.

use spindle_core::code::{CodeBlob, CodeCache, RefMap};
use spindle_core::platform;
use spindle_core::types::Pc;
use std::sync::Arc;

/// Frame size of the safepoint stub, words.
const SAFEPOINT_STUB_FRAME_WORDS: usize = 6;

/// Frame size of the continuation entry blob, words.
const ENTRY_FRAME_WORDS: usize = 8;

/// The resolved stub blobs.
pub struct StubRoutines {
    yield_stub: Arc<CodeBlob>,
    return_barrier: Arc<CodeBlob>,
    safepoint_stub: Arc<CodeBlob>,
    entry_blob: Arc<CodeBlob>,
    interpreter: Arc<CodeBlob>,
}

impl StubRoutines {
    /// Register the stubs. Called once at runtime init, before any
    /// freeze or thaw can run.
    pub fn install(code: &CodeCache) -> Self {
        let yield_stub = code.register_stub("cont_yield_stub", platform::METADATA_WORDS, None);
        let return_barrier = code.register_stub("cont_return_barrier", 0, None);
        let safepoint_stub = code.register_stub(
            "safepoint_poll_stub",
            SAFEPOINT_STUB_FRAME_WORDS,
            Some(RefMap::from_slots([0, 1])),
        );
        let entry_blob = code.register_compiled("cont_enter", ENTRY_FRAME_WORDS, 0, RefMap::empty());
        let interpreter = code.register_interpreter("template_interpreter");
        Self {
            yield_stub,
            return_barrier,
            safepoint_stub,
            entry_blob,
            interpreter,
        }
    }

    /// The yield stub blob.
    #[inline]
    pub fn yield_stub(&self) -> &Arc<CodeBlob> {
        &self.yield_stub
    }

    /// The safepoint stub blob, the top frame under forced preemption.
    #[inline]
    pub fn safepoint_stub(&self) -> &Arc<CodeBlob> {
        &self.safepoint_stub
    }

    /// The continuation entry blob.
    #[inline]
    pub fn entry_blob(&self) -> &Arc<CodeBlob> {
        &self.entry_blob
    }

    /// The interpreter's code region.
    #[inline]
    pub fn interpreter(&self) -> &Arc<CodeBlob> {
        &self.interpreter
    }

    /// The sentinel installed in a thawed bottom frame's return slot.
    #[inline]
    pub fn return_barrier_pc(&self) -> Pc {
        self.return_barrier.start()
    }

    /// Whether `pc` is the return barrier.
    #[inline]
    pub fn is_return_barrier(&self, pc: Pc) -> bool {
        self.return_barrier.contains(pc)
    }

    /// Whether `pc` lies in the yield stub.
    #[inline]
    pub fn is_yield_stub(&self, pc: Pc) -> bool {
        self.yield_stub.contains(pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::code::CodeKind;

    #[test]
    fn test_install_registers_blobs() {
        let code = CodeCache::new();
        let stubs = StubRoutines::install(&code);

        assert_eq!(stubs.yield_stub().frame_size(), platform::METADATA_WORDS);
        assert_eq!(stubs.yield_stub().kind(), CodeKind::Stub);
        assert!(stubs.safepoint_stub().ref_map().is_some());
        assert_eq!(stubs.entry_blob().kind(), CodeKind::Compiled);
        assert!(code.is_interpreted_pc(stubs.interpreter().start()));
    }

    #[test]
    fn test_sentinel_queries() {
        let code = CodeCache::new();
        let stubs = StubRoutines::install(&code);

        assert!(stubs.is_return_barrier(stubs.return_barrier_pc()));
        assert!(!stubs.is_return_barrier(stubs.yield_stub().start()));
        assert!(stubs.is_yield_stub(stubs.yield_stub().start().offset(1)));
    }
}
