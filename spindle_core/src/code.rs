//! Code cache: pc-range to code-blob resolution.
//!
//! A frame's kind is not stored in the frame; it is derived from the code
//! blob containing the frame's pc. The cache hands out code-space address
//! ranges at registration time and answers `blob_containing(pc)` with a
//! sorted-map range lookup, the same shape as the JIT-side safepoint
//! registries.
//!
//! Interpreted methods additionally carry a method descriptor (locals
//! count, parameter size, bytecode range) looked up through the
//! [`MethodTable`]; the interpreter's bcp is an absolute address inside
//! the method's bytecode range.

use crate::types::{Pc, Word};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// First code-space address handed out; zero stays the null pc.
const CODE_SPACE_BASE: usize = 0x1000;

/// First bytecode-space address handed out to interpreted methods.
const BYTECODE_SPACE_BASE: usize = 0x1000_0000;

/// Default code-range size for a registered blob, in code positions.
const DEFAULT_BLOB_RANGE: usize = 0x100;

// =============================================================================
// Code Kind
// =============================================================================

/// Kind of code a blob contains, and so the kind of any frame whose pc
/// falls inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CodeKind {
    /// Template-interpreter code; frames are fp-anchored and variable.
    Interpreted = 0,
    /// JIT-compiled method with a fixed frame size and a reference map.
    Compiled = 1,
    /// Runtime stub (yield, return barrier, safepoint).
    Stub = 2,
    /// Native wrapper; cannot be frozen.
    Native = 3,
}

impl CodeKind {
    /// Convert from the raw discriminant.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Interpreted),
            1 => Some(Self::Compiled),
            2 => Some(Self::Stub),
            3 => Some(Self::Native),
            _ => None,
        }
    }
}

// =============================================================================
// Reference Map
// =============================================================================

/// Sp-relative word offsets that hold heap references while the blob's
/// frame is on stack.
///
/// Compiled blobs without a reference map are native wrappers; freezing
/// through them pins the continuation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefMap {
    slots: SmallVec<[u16; 8]>,
}

impl RefMap {
    /// An empty map: the frame holds no references.
    #[inline]
    pub fn empty() -> Self {
        Self {
            slots: SmallVec::new(),
        }
    }

    /// Build a map from sp-relative slot offsets.
    pub fn from_slots(slots: impl IntoIterator<Item = u16>) -> Self {
        let mut slots: SmallVec<[u16; 8]> = slots.into_iter().collect();
        slots.sort_unstable();
        slots.dedup();
        Self { slots }
    }

    /// Sp-relative offsets of reference slots, sorted ascending.
    #[inline]
    pub fn slots(&self) -> &[u16] {
        &self.slots
    }

    /// Number of reference slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the frame holds no references.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// =============================================================================
// Code Blob
// =============================================================================

/// Descriptor for one region of code space.
///
/// For compiled blobs, `frame_size` counts the fixed frame in words
/// (return address and saved fp included) and `stack_argsize` the words
/// of stack-passed arguments the blob expects above its frame.
#[derive(Debug)]
pub struct CodeBlob {
    name: Box<str>,
    kind: CodeKind,
    start: Pc,
    range: usize,
    frame_size: usize,
    stack_argsize: usize,
    ref_map: Option<RefMap>,
    /// Set when the deoptimizer decides frames of this blob must unwind
    /// through the interpreter. Checked on thaw.
    marked_for_deopt: AtomicBool,
}

impl CodeBlob {
    /// Blob name, for diagnostics.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Code kind of this blob.
    #[inline(always)]
    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    /// First pc of the blob's range.
    #[inline(always)]
    pub fn start(&self) -> Pc {
        self.start
    }

    /// Whether `pc` falls inside this blob.
    #[inline(always)]
    pub fn contains(&self, pc: Pc) -> bool {
        pc.0 >= self.start.0 && pc.0 < self.start.0 + self.range
    }

    /// Fixed frame size in words. Zero for interpreted blobs, whose
    /// frames size themselves.
    #[inline(always)]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Stack-passed argument words expected above the frame.
    #[inline(always)]
    pub fn stack_argsize(&self) -> usize {
        self.stack_argsize
    }

    /// Reference map, if the blob has one. `None` marks a frame the GC
    /// cannot scan, which pins the continuation.
    #[inline(always)]
    pub fn ref_map(&self) -> Option<&RefMap> {
        self.ref_map.as_ref()
    }

    /// The blob's deoptimization handler entry.
    #[inline]
    pub fn deopt_handler(&self) -> Pc {
        debug_assert_eq!(self.kind, CodeKind::Compiled);
        Pc(self.start.0 + self.range - 1)
    }

    /// Whether `pc` is this blob's deoptimization handler.
    #[inline]
    pub fn is_deopt_pc(&self, pc: Pc) -> bool {
        self.kind == CodeKind::Compiled && pc == self.deopt_handler()
    }

    /// Mark the blob so thaw deoptimizes its frames in place.
    #[inline]
    pub fn mark_for_deoptimization(&self) {
        self.marked_for_deopt.store(true, Ordering::Release);
    }

    /// Whether the blob has been marked for deoptimization.
    #[inline]
    pub fn is_marked_for_deoptimization(&self) -> bool {
        self.marked_for_deopt.load(Ordering::Acquire)
    }
}

// =============================================================================
// Code Cache
// =============================================================================

/// Registry of all code blobs, indexed by start address.
///
/// Reads (pc resolution during stack walks) vastly outnumber writes
/// (blob registration), so the index lives under an `RwLock`.
pub struct CodeCache {
    blobs: RwLock<BTreeMap<usize, Arc<CodeBlob>>>,
    next_start: AtomicUsize,
}

impl CodeCache {
    /// Create an empty code cache.
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(BTreeMap::new()),
            next_start: AtomicUsize::new(CODE_SPACE_BASE),
        }
    }

    fn register(
        &self,
        name: &str,
        kind: CodeKind,
        frame_size: usize,
        stack_argsize: usize,
        ref_map: Option<RefMap>,
    ) -> Arc<CodeBlob> {
        let start = self.next_start.fetch_add(DEFAULT_BLOB_RANGE, Ordering::Relaxed);
        let blob = Arc::new(CodeBlob {
            name: name.into(),
            kind,
            start: Pc(start),
            range: DEFAULT_BLOB_RANGE,
            frame_size,
            stack_argsize,
            ref_map,
            marked_for_deopt: AtomicBool::new(false),
        });
        self.blobs.write().insert(start, Arc::clone(&blob));
        blob
    }

    /// Register a compiled method blob.
    pub fn register_compiled(
        &self,
        name: &str,
        frame_size: usize,
        stack_argsize: usize,
        ref_map: RefMap,
    ) -> Arc<CodeBlob> {
        self.register(name, CodeKind::Compiled, frame_size, stack_argsize, Some(ref_map))
    }

    /// Register a compiled native wrapper: no reference map, so frames
    /// of this blob pin the continuation.
    pub fn register_native_wrapper(&self, name: &str, frame_size: usize) -> Arc<CodeBlob> {
        self.register(name, CodeKind::Compiled, frame_size, 0, None)
    }

    /// Register the interpreter's code region.
    pub fn register_interpreter(&self, name: &str) -> Arc<CodeBlob> {
        self.register(name, CodeKind::Interpreted, 0, 0, None)
    }

    /// Register a runtime stub blob.
    pub fn register_stub(&self, name: &str, frame_size: usize, ref_map: Option<RefMap>) -> Arc<CodeBlob> {
        self.register(name, CodeKind::Stub, frame_size, 0, ref_map)
    }

    /// Register a native entry blob.
    pub fn register_native(&self, name: &str, frame_size: usize) -> Arc<CodeBlob> {
        self.register(name, CodeKind::Native, frame_size, 0, None)
    }

    /// Resolve the blob containing `pc`, if any.
    pub fn blob_containing(&self, pc: Pc) -> Option<Arc<CodeBlob>> {
        if pc.is_null() {
            return None;
        }
        let blobs = self.blobs.read();
        let (_, blob) = blobs.range(..=pc.0).next_back()?;
        blob.contains(pc).then(|| Arc::clone(blob))
    }

    /// Code kind at `pc`, if a blob contains it.
    #[inline]
    pub fn kind_at(&self, pc: Pc) -> Option<CodeKind> {
        self.blob_containing(pc).map(|b| b.kind())
    }

    /// Whether `pc` falls inside interpreter code.
    #[inline]
    pub fn is_interpreted_pc(&self, pc: Pc) -> bool {
        self.kind_at(pc) == Some(CodeKind::Interpreted)
    }

    /// Number of registered blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

// =============================================================================
// Interpreted Methods
// =============================================================================

/// Identifier of an interpreted method, as stored raw in the method slot
/// of an interpreter frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(pub u64);

impl MethodId {
    /// Raw word representation for a frame slot.
    #[inline(always)]
    pub const fn to_word(self) -> Word {
        self.0 as Word
    }

    /// Reconstruct from a frame slot.
    #[inline(always)]
    pub const fn from_word(word: Word) -> MethodId {
        MethodId(word as u64)
    }
}

/// Descriptor of an interpreted method.
#[derive(Debug)]
pub struct InterpMethod {
    /// Stable id, stored in the frame's method slot.
    pub id: MethodId,
    /// Method name, for diagnostics.
    pub name: Box<str>,
    /// Locals count, including parameters.
    pub max_locals: usize,
    /// Parameter words, the overlap with the caller.
    pub size_of_parameters: usize,
    /// Whether this is a native method entry; such frames pin.
    pub is_native: bool,
    /// First bytecode address; the bcp is `base + bci`.
    pub bytecode_base: Pc,
    /// Bytecode length in positions.
    pub bytecode_len: usize,
}

impl InterpMethod {
    /// Whether `bcp` points into this method's bytecode.
    #[inline]
    pub fn contains_bcp(&self, bcp: Pc) -> bool {
        bcp.0 >= self.bytecode_base.0 && bcp.0 < self.bytecode_base.0 + self.bytecode_len
    }

    /// Bytecode index for an absolute bcp.
    #[inline]
    pub fn bci(&self, bcp: Pc) -> usize {
        debug_assert!(self.contains_bcp(bcp));
        bcp.0 - self.bytecode_base.0
    }

    /// Absolute bcp for a bytecode index.
    #[inline]
    pub fn bcp(&self, bci: usize) -> Pc {
        debug_assert!(bci < self.bytecode_len);
        self.bytecode_base.offset(bci)
    }
}

/// Registry of interpreted methods, keyed by [`MethodId`].
pub struct MethodTable {
    methods: RwLock<FxHashMap<u64, Arc<InterpMethod>>>,
    next_id: AtomicUsize,
    next_bytecode: AtomicUsize,
}

impl MethodTable {
    /// Create an empty method table.
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(FxHashMap::default()),
            next_id: AtomicUsize::new(1),
            next_bytecode: AtomicUsize::new(BYTECODE_SPACE_BASE),
        }
    }

    /// Register a method and hand out its bytecode range.
    pub fn register(
        &self,
        name: &str,
        max_locals: usize,
        size_of_parameters: usize,
        is_native: bool,
        bytecode_len: usize,
    ) -> Arc<InterpMethod> {
        debug_assert!(size_of_parameters <= max_locals);
        let id = MethodId(self.next_id.fetch_add(1, Ordering::Relaxed) as u64);
        let base = self.next_bytecode.fetch_add(bytecode_len.max(1), Ordering::Relaxed);
        let method = Arc::new(InterpMethod {
            id,
            name: name.into(),
            max_locals,
            size_of_parameters,
            is_native,
            bytecode_base: Pc(base),
            bytecode_len: bytecode_len.max(1),
        });
        self.methods.write().insert(id.0, Arc::clone(&method));
        method
    }

    /// Look up a method by id.
    pub fn get(&self, id: MethodId) -> Option<Arc<InterpMethod>> {
        self.methods.read().get(&id.0).cloned()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_kind_round_trip() {
        for kind in [
            CodeKind::Interpreted,
            CodeKind::Compiled,
            CodeKind::Stub,
            CodeKind::Native,
        ] {
            assert_eq!(CodeKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(CodeKind::from_u8(4), None);
    }

    #[test]
    fn test_ref_map_sorted_dedup() {
        let map = RefMap::from_slots([5, 1, 5, 3]);
        assert_eq!(map.slots(), &[1, 3, 5]);
        assert_eq!(map.len(), 3);
        assert!(RefMap::empty().is_empty());
    }

    #[test]
    fn test_blob_resolution() {
        let cache = CodeCache::new();
        let a = cache.register_compiled("a", 8, 2, RefMap::empty());
        let b = cache.register_compiled("b", 16, 0, RefMap::empty());

        assert_eq!(cache.blob_containing(a.start()).unwrap().name(), "a");
        assert_eq!(
            cache.blob_containing(a.start().offset(10)).unwrap().name(),
            "a"
        );
        assert_eq!(cache.blob_containing(b.start()).unwrap().name(), "b");
        assert!(cache.blob_containing(Pc::NULL).is_none());
        assert!(cache.blob_containing(Pc(1)).is_none());
    }

    #[test]
    fn test_kind_derivation() {
        let cache = CodeCache::new();
        let interp = cache.register_interpreter("interpreter");
        let stub = cache.register_stub("yield_stub", 2, None);

        assert!(cache.is_interpreted_pc(interp.start().offset(3)));
        assert_eq!(cache.kind_at(stub.start()), Some(CodeKind::Stub));
        assert_eq!(cache.kind_at(Pc(2)), None);
    }

    #[test]
    fn test_deopt_marking() {
        let cache = CodeCache::new();
        let blob = cache.register_compiled("hot", 8, 0, RefMap::empty());

        assert!(!blob.is_marked_for_deoptimization());
        blob.mark_for_deoptimization();
        assert!(blob.is_marked_for_deoptimization());

        let handler = blob.deopt_handler();
        assert!(blob.contains(handler));
        assert!(blob.is_deopt_pc(handler));
        assert!(!blob.is_deopt_pc(blob.start()));
    }

    #[test]
    fn test_native_wrapper_has_no_ref_map() {
        let cache = CodeCache::new();
        let blob = cache.register_native_wrapper("jni_wrapper", 6);
        assert_eq!(blob.kind(), CodeKind::Compiled);
        assert!(blob.ref_map().is_none());
    }

    #[test]
    fn test_method_table() {
        let table = MethodTable::new();
        let m = table.register("loop_body", 6, 2, false, 40);

        assert_eq!(table.get(m.id).unwrap().name.as_ref(), "loop_body");
        assert!(table.get(MethodId(999)).is_none());

        let bcp = m.bcp(17);
        assert!(m.contains_bcp(bcp));
        assert_eq!(m.bci(bcp), 17);
    }

    #[test]
    fn test_method_id_word_round_trip() {
        let id = MethodId(42);
        assert_eq!(MethodId::from_word(id.to_word()), id);
    }
}
