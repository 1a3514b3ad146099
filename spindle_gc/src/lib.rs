//! Chunk heap and store barriers for the Spindle runtime.
//!
//! The continuation core consumes the collector through two narrow
//! contracts, and this crate is their home:
//!
//! - **Allocation**: [`heap::ChunkHeap`] hands out heap-resident stack
//!   chunks, first from a thread-local allocation budget (no safepoint),
//!   then from shared space (may safepoint, may land the object where
//!   stores need barriers).
//! - **Barriers**: [`barrier::BarrierSet`] is the store-barrier hook
//!   applied when reference words are written into memory the collector
//!   already tracks.
//!
//! Collection itself is out of scope here; the heap only answers the
//! questions freeze and thaw ask: "where does this chunk live", "does it
//! need barriers", and "did allocating it poll a safepoint".

#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::new_without_default)]

pub mod barrier;
pub mod config;
pub mod heap;
mod stats;

pub use barrier::{BarrierKind, BarrierSet, CardTableBarriers, NoBarriers};
pub use config::HeapConfig;
pub use heap::{ChunkHeap, HeapObject, HeapRef, SharedAlloc};
pub use stats::HeapStats;
