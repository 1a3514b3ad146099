//! Continuation objects and the mutable freeze/thaw view over them.
//!
//! A [`Continuation`] is the heap-side identity of a virtual thread's
//! suspended state: a scope tag and the head of its chunk list. The
//! [`ContinuationWrapper`] is opened by the freeze and thaw engines for
//! the duration of one operation; it accumulates the new tail locally
//! and [`ContinuationWrapper::write`] commits in a single visible step,
//! so a concurrent stack walker observes either the pre-state or a
//! consistent post-state, never a torn intermediate.

use crate::chunk::ChunkRef;
use crate::thread::CarrierThread;
use spindle_core::types::Pc;

/// Identity of a continuation, stored as the chunk back reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContId(pub u64);

/// Opaque scope tag used by the pinned query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u64);

/// Why the last freeze attempt refused, advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PinnedReason {
    /// A critical-section marker on the entry.
    CriticalSection = 0,
    /// A native or un-scannable frame.
    Native = 1,
    /// A frame holding an object monitor.
    Monitor = 2,
}

// =============================================================================
// Continuation
// =============================================================================

/// A continuation object: scope, chunk list head, terminal state.
#[derive(Debug)]
pub struct Continuation {
    id: ContId,
    scope: ScopeId,
    tail: Option<ChunkRef>,
    done: bool,
    pinned_reason: Option<PinnedReason>,
}

impl Continuation {
    /// Create an unmounted continuation.
    pub fn new(id: ContId, scope: ScopeId) -> Self {
        Self {
            id,
            scope,
            tail: None,
            done: false,
            pinned_reason: None,
        }
    }

    /// The continuation's identity tag.
    #[inline(always)]
    pub fn id(&self) -> ContId {
        self.id
    }

    /// The scope tag.
    #[inline(always)]
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Head of the chunk list; `None` iff never mounted.
    #[inline(always)]
    pub fn tail(&self) -> Option<ChunkRef> {
        self.tail
    }

    /// Directly relink the tail. Used by thaw preparation when popping
    /// an empty chunk; freeze goes through the wrapper commit instead.
    #[inline]
    pub fn set_tail(&mut self, tail: Option<ChunkRef>) {
        self.tail = tail;
    }

    /// Whether the continuation has terminated.
    #[inline(always)]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Mark the continuation terminal.
    #[inline]
    pub fn set_done(&mut self) {
        self.done = true;
    }

    /// Last recorded pin reason, advisory.
    #[inline(always)]
    pub fn pinned_reason(&self) -> Option<PinnedReason> {
        self.pinned_reason
    }

    /// Record why a freeze refused.
    #[inline]
    pub fn set_pinned_reason(&mut self, reason: PinnedReason) {
        self.pinned_reason = Some(reason);
    }

    /// Newest chunk that still holds frames, skipping reusable empties.
    pub fn last_nonempty_chunk(&self) -> Option<ChunkRef> {
        let mut chunk = self.tail;
        while let Some(c) = chunk {
            if !c.is_empty() {
                return Some(c);
            }
            chunk = c.parent();
        }
        None
    }

    /// Whether no frozen frames exist anywhere in the chunk list.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.last_nonempty_chunk().is_none()
    }
}

// =============================================================================
// Continuation Wrapper
// =============================================================================

/// Mutable view of a continuation opened for one freeze or thaw.
///
/// Entry-frame facts are snapshotted at open time; tail and entry
/// argsize changes stay local until [`write`](Self::write).
pub struct ContinuationWrapper<'a> {
    cont: &'a mut Continuation,
    entry_sp: usize,
    entry_fp: usize,
    entry_pc: Pc,
    argsize: usize,
    tail: Option<ChunkRef>,
    written: bool,
}

impl<'a> ContinuationWrapper<'a> {
    /// Open the wrapper against the thread's current entry.
    pub fn open(cont: &'a mut Continuation, thread: &CarrierThread) -> Self {
        let entry = thread.entry().expect("no continuation entry on carrier");
        debug_assert_eq!(entry.cont_id, cont.id);
        let tail = cont.tail();
        Self {
            cont,
            entry_sp: entry.entry_sp,
            entry_fp: entry.entry_fp,
            entry_pc: entry.entry_pc,
            argsize: entry.argsize,
            tail,
            written: false,
        }
    }

    /// The continuation's identity.
    #[inline(always)]
    pub fn id(&self) -> ContId {
        self.cont.id()
    }

    /// Entry frame sp.
    #[inline(always)]
    pub fn entry_sp(&self) -> usize {
        self.entry_sp
    }

    /// Entry frame fp.
    #[inline(always)]
    pub fn entry_fp(&self) -> usize {
        self.entry_fp
    }

    /// Entry frame pc, the true caller pc of the bottom frame.
    #[inline(always)]
    pub fn entry_pc(&self) -> Pc {
        self.entry_pc
    }

    /// Entry argsize: stack-argument words of the bottom-most frame.
    #[inline(always)]
    pub fn argsize(&self) -> usize {
        self.argsize
    }

    /// Stage a new entry argsize.
    #[inline]
    pub fn set_argsize(&mut self, argsize: usize) {
        self.argsize = argsize;
    }

    /// The working tail, including a staged change.
    #[inline(always)]
    pub fn tail(&self) -> Option<ChunkRef> {
        self.tail
    }

    /// Stage a new tail chunk.
    #[inline]
    pub fn set_tail(&mut self, tail: ChunkRef) {
        self.tail = Some(tail);
    }

    /// Stage tail removal.
    #[inline]
    pub fn clear_tail_to(&mut self, tail: Option<ChunkRef>) {
        self.tail = tail;
    }

    /// Newest non-empty chunk, observing the staged tail.
    pub fn last_nonempty_chunk(&self) -> Option<ChunkRef> {
        let mut chunk = self.tail;
        while let Some(c) = chunk {
            if !c.is_empty() {
                return Some(c);
            }
            chunk = c.parent();
        }
        None
    }

    /// Whether no frozen frames exist, observing the staged tail.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.last_nonempty_chunk().is_none()
    }

    /// Record an advisory pin reason on the continuation.
    #[inline]
    pub fn set_pinned_reason(&mut self, reason: PinnedReason) {
        self.cont.set_pinned_reason(reason);
    }

    /// Commit the staged tail and entry argsize. This is the single
    /// publish step; everything written into a fresh chunk beforehand
    /// becomes visible with it.
    pub fn write(&mut self, thread: &mut CarrierThread) {
        self.cont.set_tail(self.tail);
        if let Some(entry) = thread.entry_mut() {
            entry.argsize = self.argsize;
        }
        self.written = true;
    }

    /// Whether `write` has been called on this wrapper.
    #[inline]
    pub fn is_written(&self) -> bool {
        self.written
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::StackChunk;
    use spindle_gc::{ChunkHeap, HeapConfig};

    #[test]
    fn test_new_continuation() {
        let cont = Continuation::new(ContId(7), ScopeId(1));
        assert_eq!(cont.id(), ContId(7));
        assert!(cont.tail().is_none());
        assert!(cont.is_empty());
        assert!(!cont.is_done());
        assert!(cont.pinned_reason().is_none());
    }

    #[test]
    fn test_last_nonempty_skips_empty_tail() {
        let heap: ChunkHeap<StackChunk> = ChunkHeap::new(HeapConfig::default());
        let mut cont = Continuation::new(ContId(1), ScopeId(1));

        let mut parent = heap.try_tlab_alloc(StackChunk::new(32, ContId(1))).unwrap();
        parent.set_sp(16);
        parent.set_max_size(16);
        parent.set_pc(spindle_core::Pc(0x1000));
        parent.words_mut()[15] = 0x1000;

        let mut tail = heap.try_tlab_alloc(StackChunk::new(32, ContId(1))).unwrap();
        tail.set_parent(Some(parent));

        cont.set_tail(Some(tail));
        assert_eq!(cont.last_nonempty_chunk(), Some(parent));
        assert!(!cont.is_empty());
    }

    #[test]
    fn test_wrapper_commit_is_single_step() {
        let heap: ChunkHeap<StackChunk> = ChunkHeap::new(HeapConfig::default());
        let mut cont = Continuation::new(ContId(1), ScopeId(1));
        let mut thread = CarrierThread::new(256);
        thread.push_entry(ContId(1), ScopeId(1), 200, 204, spindle_core::Pc(0x2000));

        let chunk = heap.try_tlab_alloc(StackChunk::new(32, ContId(1))).unwrap();
        {
            let mut wrapper = ContinuationWrapper::open(&mut cont, &thread);
            wrapper.set_tail(chunk);
            wrapper.set_argsize(3);
            // Not yet visible.
            assert_eq!(wrapper.tail(), Some(chunk));
        }
        assert!(cont.tail().is_none(), "abandoned wrapper leaves pre-state");

        let mut wrapper = ContinuationWrapper::open(&mut cont, &thread);
        wrapper.set_tail(chunk);
        wrapper.set_argsize(3);
        wrapper.write(&mut thread);
        assert!(wrapper.is_written());
        drop(wrapper);

        assert_eq!(cont.tail(), Some(chunk));
        assert_eq!(thread.entry().unwrap().argsize, 3);
    }
}
