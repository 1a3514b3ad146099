//! Shared leaf types for the Spindle virtual-thread runtime.
//!
//! This crate holds the pieces every other runtime crate depends on:
//!
//! - **Word/pc types**: the machine-word and code-address vocabulary used
//!   by stacks, chunks and frame walkers ([`types`]).
//! - **Code cache**: resolves a pc to the code blob containing it, which
//!   is how a frame's kind (interpreted / compiled / stub) is derived
//!   ([`code`]).
//! - **Platform shim**: frame-layout constants and alignment math that
//!   would otherwise be scattered across every stack-walking loop
//!   ([`platform`]).
//!
//! Nothing in here allocates on a hot path; the code cache is read-mostly
//! and guarded by a `parking_lot::RwLock`.

#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::new_without_default)]

pub mod code;
pub mod platform;
pub mod types;

pub use code::{CodeBlob, CodeCache, CodeKind, InterpMethod, MethodId, MethodTable, RefMap};
pub use types::{Pc, Word};
