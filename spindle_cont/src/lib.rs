//! Continuation freeze/thaw core for the Spindle virtual-thread runtime.
//!
//! A continuation is a suspended execution state: a contiguous prefix of
//! a carrier thread's native stack, captured (frozen) into a
//! heap-resident stack chunk and later reinstalled (thawed) onto some
//! carrier's stack to resume exactly where it left off. This crate is
//! the hot core of that mechanism; its amortized budget per operation
//! is on the order of a hundred nanoseconds, which is why the common
//! case is a single bulk copy with O(1) patching.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     ContinuationRuntime                        │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌─────────────┐   ┌───────────────────────┐ │
//! │  │ CodeCache  │   │ StubRoutines│   │ ChunkHeap + BarrierSet│ │
//! │  │ pc → blob  │   │ yield/ret   │   │ tlab / shared alloc   │ │
//! │  └────────────┘   └─────────────┘   └───────────────────────┘ │
//! │                                                                │
//! │  freeze(sp) ──▶ FreezeEngine ──▶ StackChunk ◀── ThawEngine ◀── │
//! │                  fast: bulk copy    │  sp, pc      thaw(kind)  │
//! │                  slow: per-frame    │  argsize                 │
//! │                  walk, relativize   │  max_size, bitmap        │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engines are monomorphized over the store-barrier set and consult
//! the collector only through two questions: does this chunk's memory
//! need store barriers, and has a collection seen it. Frame formats are
//! consumed through the code cache (compiled blobs) and the interpreter
//! frame schema ([`interp`]).
//!
//! Freeze does not return to its caller in the resumed code: the yield
//! stub's epilogue unwinds past it. Thaw returns a stack pointer that
//! the thaw stub jumps to, bypassing a normal return.

#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::new_without_default)]

pub mod chunk;
pub mod frame;
pub mod freeze;
pub mod interp;
pub mod runtime;
pub mod stream;
pub mod stubs;
pub mod thaw;
pub mod thread;
pub mod wrapper;

pub use chunk::{ChunkFlags, ChunkRef, StackChunk};
pub use frame::{Frame, FrameKind, RegisterMap};
pub use freeze::FreezeResult;
pub use runtime::ContinuationRuntime;
pub use stream::{ChunkFrameStream, CompiledOnly, Mixed};
pub use stubs::StubRoutines;
pub use thaw::ThawKind;
pub use thread::{CarrierThread, ContinuationEntry, FrameAnchor};
pub use wrapper::{ContId, Continuation, ContinuationWrapper, PinnedReason, ScopeId};
