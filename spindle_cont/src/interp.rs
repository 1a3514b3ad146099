//! Interpreter frame schema and position-independence conversion.
//!
//! An interpreted frame is fp-anchored and variable-sized:
//!
//! ```text
//!   fp+2+L  ──────────────  frame bottom (toward caller)
//!           locals (L words, parameters overlap the caller)
//!   fp+2    first local slot
//!   fp+1    return address to caller          raw
//!   fp      saved caller fp                   raw
//!   fp-1    sender sp                         caller pointer
//!   fp-2    method id                         raw
//!   fp-3    bcp                               bytecode pointer
//!   fp-4    locals pointer (to local[0])      self pointer
//!   fp-5    last sp (operand-stack top), 0 when not extended
//!           operand stack grows down from here
//!   usp     ──────────────  frame top
//! ```
//!
//! While a frame sits inside a chunk it must be position-independent, so
//! freeze rewrites each header slot by its class: raw slots copy
//! verbatim, self pointers become offsets against the frame's own fp,
//! the bcp becomes the bytecode index against the method's bytecode
//! base, and the caller pointer becomes a placeholder that thaw
//! re-resolves against the actual caller. Thaw applies the exact
//! inverse, which is what makes relativize/derelativize an identity on
//! the header.

use spindle_core::code::{InterpMethod, MethodId, MethodTable};
use spindle_core::types::{Pc, Word};
use std::sync::Arc;

/// Saved caller fp, at `fp + SAVED_FP_OFFSET`.
pub const SAVED_FP_OFFSET: usize = 0;
/// Return address to the caller, at `fp + RETURN_PC_OFFSET`.
pub const RETURN_PC_OFFSET: usize = 1;
/// First local slot, at `fp + LOCALS_OFFSET`; locals extend upward.
pub const LOCALS_OFFSET: usize = 2;

/// Sender sp slot, at `fp - SENDER_SP_SLOT`.
pub const SENDER_SP_SLOT: usize = 1;
/// Method id slot, at `fp - METHOD_SLOT`.
pub const METHOD_SLOT: usize = 2;
/// Bcp slot, at `fp - BCP_SLOT`.
pub const BCP_SLOT: usize = 3;
/// Locals pointer slot, at `fp - LOCALS_PTR_SLOT`.
pub const LOCALS_PTR_SLOT: usize = 4;
/// Last sp slot, at `fp - LAST_SP_SLOT`.
pub const LAST_SP_SLOT: usize = 5;
/// Header words below fp.
pub const HEADER_SLOTS: usize = 5;

/// Placeholder stored in a frozen frame's sender-sp slot; thaw patches
/// the real caller sp over it.
pub const SENDER_SP_PLACEHOLDER: Word = Word::MAX;

// =============================================================================
// Slot access
// =============================================================================

/// Read a header slot `below` words under fp.
#[inline(always)]
pub fn read_slot(words: &[Word], fp: usize, below: usize) -> Word {
    words[fp - below]
}

/// Write a header slot `below` words under fp.
#[inline(always)]
pub fn write_slot(words: &mut [Word], fp: usize, below: usize, value: Word) {
    words[fp - below] = value;
}

/// The frame's method, from its method slot.
pub fn method_of(words: &[Word], fp: usize, methods: &MethodTable) -> Option<Arc<InterpMethod>> {
    methods.get(MethodId::from_word(read_slot(words, fp, METHOD_SLOT)))
}

/// The frame's extended stack pointer: the last-sp slot when the
/// operand stack has grown past `sp`, otherwise `sp` itself.
#[inline]
pub fn unextended_sp(words: &[Word], fp: usize, sp: usize) -> usize {
    let last_sp = read_slot(words, fp, LAST_SP_SLOT);
    if last_sp == 0 {
        sp
    } else {
        sp.min(last_sp)
    }
}

/// One past the highest local; the frame's extent toward the caller.
pub fn frame_bottom(words: &[Word], fp: usize, methods: &MethodTable) -> usize {
    let max_locals = method_of(words, fp, methods).map_or(0, |m| m.max_locals);
    fp + LOCALS_OFFSET + max_locals
}

/// Frame size in words from the extended top to the frame bottom.
pub fn frame_size(words: &[Word], fp: usize, unextended_sp: usize, methods: &MethodTable) -> usize {
    frame_bottom(words, fp, methods) - unextended_sp
}

/// The caller sp recorded in the frame. Never the placeholder on a
/// stack-resident frame.
#[inline]
pub fn read_sender_sp(words: &[Word], fp: usize) -> usize {
    let sender_sp = read_slot(words, fp, SENDER_SP_SLOT);
    debug_assert_ne!(sender_sp, SENDER_SP_PLACEHOLDER);
    sender_sp
}

/// Absolute locals pointer for a frame of `max_locals` locals: the slot
/// of local zero, which sits highest.
#[inline]
pub const fn locals_ptr(fp: usize, max_locals: usize) -> usize {
    fp + LOCALS_OFFSET + max_locals - 1
}

// =============================================================================
// Relativize / derelativize
// =============================================================================

/// Rewrite the header of a frozen frame to be position-independent.
///
/// Called after the frame's words were copied into the chunk; `f_fp`
/// addresses the stack-side frame, `hf_fp` the chunk-side copy.
pub fn relativize_metadata(
    stack: &[Word],
    f_fp: usize,
    chunk: &mut [Word],
    hf_fp: usize,
    method: &InterpMethod,
) {
    let bcp = Pc::from_word(read_slot(stack, f_fp, BCP_SLOT));
    write_slot(chunk, hf_fp, BCP_SLOT, method.bci(bcp) as Word);

    let locals = read_slot(stack, f_fp, LOCALS_PTR_SLOT);
    debug_assert!(locals > f_fp);
    write_slot(chunk, hf_fp, LOCALS_PTR_SLOT, locals - f_fp);

    let last_sp = read_slot(stack, f_fp, LAST_SP_SLOT);
    let rel_last_sp = if last_sp == 0 { 0 } else { f_fp - last_sp };
    write_slot(chunk, hf_fp, LAST_SP_SLOT, rel_last_sp);

    write_slot(chunk, hf_fp, SENDER_SP_SLOT, SENDER_SP_PLACEHOLDER);
}

/// Rewrite the header of a thawed frame back to absolute pointers.
/// The sender-sp slot is patched separately once the caller is known.
pub fn derelativize_metadata(
    chunk: &[Word],
    hf_fp: usize,
    stack: &mut [Word],
    f_fp: usize,
    method: &InterpMethod,
) {
    let bci = read_slot(chunk, hf_fp, BCP_SLOT) as usize;
    write_slot(stack, f_fp, BCP_SLOT, method.bcp(bci).to_word());

    let rel_locals = read_slot(chunk, hf_fp, LOCALS_PTR_SLOT);
    write_slot(stack, f_fp, LOCALS_PTR_SLOT, f_fp + rel_locals);

    let rel_last_sp = read_slot(chunk, hf_fp, LAST_SP_SLOT);
    let last_sp = if rel_last_sp == 0 { 0 } else { f_fp - rel_last_sp };
    write_slot(stack, f_fp, LAST_SP_SLOT, last_sp);
}

/// Patch the sender-sp slot to the caller's extended sp. Applied on
/// freeze toward the chunk copy and on thaw toward the stack copy.
#[inline]
pub fn patch_sender_sp(words: &mut [Word], fp: usize, sender_sp: usize) {
    write_slot(words, fp, SENDER_SP_SLOT, sender_sp);
}

// =============================================================================
// Tests
// =============================================================================
