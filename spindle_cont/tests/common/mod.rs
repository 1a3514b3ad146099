//! Shared test harness: builds continuation stacks on a carrier thread
//! the way the enter/yield stubs lay them out at runtime.

use spindle_cont::{CarrierThread, ContId, Continuation, ContinuationRuntime, ScopeId};
use spindle_core::code::{CodeBlob, InterpMethod};
use spindle_core::platform;
use spindle_core::types::{Pc, Word};
use spindle_cont::interp;
use spindle_gc::{BarrierSet, HeapConfig, NoBarriers};
use std::sync::Arc;

/// Carrier stack size used by the harness, words.
pub const TEST_STACK_WORDS: usize = 8192;

/// Small heap so tests can exhaust spaces deliberately.
pub fn test_heap_config() -> HeapConfig {
    HeapConfig::for_testing(16 * 1024, 64 * 1024, 256 * 1024)
}

/// Runtime with no store barriers.
pub fn runtime() -> ContinuationRuntime<NoBarriers> {
    ContinuationRuntime::resolve(test_heap_config(), NoBarriers)
}

// =============================================================================
// Stack Builder
// =============================================================================

/// Builds entry, compiled, interpreted and stub frames on a fresh
/// carrier thread, tracking the linkage the next frame needs.
pub struct StackBuilder<'rt, B: BarrierSet> {
    pub rt: &'rt ContinuationRuntime<B>,
    pub thread: CarrierThread,
    pub cont: Continuation,
    pub entry_sp: usize,
    cur_bottom: usize,
    caller_pc: Pc,
    caller_fp: usize,
    first: bool,
    fill: Word,
}

impl<'rt, B: BarrierSet> StackBuilder<'rt, B> {
    pub fn new(rt: &'rt ContinuationRuntime<B>) -> Self {
        Self::with_id(rt, 1)
    }

    pub fn with_id(rt: &'rt ContinuationRuntime<B>, id: u64) -> Self {
        let mut thread = CarrierThread::new(TEST_STACK_WORDS);
        let entry_sp = TEST_STACK_WORDS - 16;
        let entry_fp = entry_sp + 4;
        let entry_pc = rt.stubs.entry_blob().start().offset(5);
        thread.push_entry(ContId(id), ScopeId(id), entry_sp, entry_fp, entry_pc);

        Self {
            rt,
            thread,
            cont: Continuation::new(ContId(id), ScopeId(id)),
            entry_sp,
            cur_bottom: entry_sp,
            caller_pc: entry_pc,
            caller_fp: entry_fp,
            first: true,
            fill: 0x100,
        }
    }

    fn sender_sp_for(&mut self, argsize: usize) -> usize {
        if self.first {
            self.first = false;
            self.thread.entry_mut().unwrap().argsize = argsize;
            platform::frame_align_index(self.entry_sp - argsize)
        } else {
            self.cur_bottom
        }
    }

    /// Push a compiled frame. `args` are the stack-passed argument
    /// words the caller sets up for it.
    pub fn push_compiled(&mut self, blob: &Arc<CodeBlob>, args: &[Word]) -> usize {
        assert_eq!(args.len(), blob.stack_argsize());
        if blob.ref_map().is_none() {
            // Entering a native wrapper turns the chunk fast paths off,
            // the same way the interpreter does.
            self.thread.set_fastpath_state(false);
        }
        let sender_sp = self.sender_sp_for(args.len());

        let stack = self.thread.stack_mut();
        for (i, &arg) in args.iter().enumerate() {
            stack[sender_sp + i] = arg;
        }
        platform::patch_ret_pc(stack, sender_sp, self.caller_pc);
        platform::patch_saved_fp(stack, sender_sp, self.caller_fp);

        let sp = sender_sp - blob.frame_size();
        for i in sp..sender_sp - platform::METADATA_WORDS {
            stack[i] = self.fill + (i - sp) as Word;
        }
        self.fill += 0x100;

        self.cur_bottom = sp;
        self.caller_pc = blob.start().offset(2);
        self.caller_fp = sp;
        sp
    }

    /// Push an interpreted frame. `locals` covers all `max_locals`
    /// slots (parameters first); `operand` is the live operand stack,
    /// deepest word last.
    pub fn push_interpreted(
        &mut self,
        method: &Arc<InterpMethod>,
        bci: usize,
        locals: &[Word],
        operand: &[Word],
    ) -> (usize, usize) {
        assert_eq!(locals.len(), method.max_locals);
        let argsize = method.size_of_parameters;
        let sender_sp = self.sender_sp_for(argsize);

        // Locals end against the caller's argument area.
        let fp = sender_sp + argsize - interp::LOCALS_OFFSET - method.max_locals;
        let sp = fp - interp::HEADER_SLOTS - operand.len();

        let stack = self.thread.stack_mut();
        for (j, &value) in locals.iter().enumerate() {
            stack[fp + interp::LOCALS_OFFSET + j] = value;
        }
        stack[fp + interp::RETURN_PC_OFFSET] = self.caller_pc.to_word();
        stack[fp + interp::SAVED_FP_OFFSET] = self.caller_fp;
        interp::write_slot(stack, fp, interp::SENDER_SP_SLOT, sender_sp);
        interp::write_slot(stack, fp, interp::METHOD_SLOT, method.id.to_word());
        interp::write_slot(stack, fp, interp::BCP_SLOT, method.bcp(bci).to_word());
        interp::write_slot(
            stack,
            fp,
            interp::LOCALS_PTR_SLOT,
            interp::locals_ptr(fp, method.max_locals),
        );
        interp::write_slot(stack, fp, interp::LAST_SP_SLOT, sp);
        for (j, &value) in operand.iter().enumerate() {
            stack[fp - interp::HEADER_SLOTS - 1 - j] = value;
        }

        // Interpreter execution disables the chunk fast paths.
        self.thread.set_fastpath_state(false);

        self.cur_bottom = sp;
        self.caller_pc = self.rt.stubs.interpreter().start().offset(3);
        self.caller_fp = fp;
        (sp, fp)
    }

    fn push_stub(&mut self, blob_pc: Pc, frame_size: usize) -> usize {
        let sender_sp = self.cur_bottom;
        let stack = self.thread.stack_mut();
        platform::patch_ret_pc(stack, sender_sp, self.caller_pc);
        platform::patch_saved_fp(stack, sender_sp, self.caller_fp);

        let sp = sender_sp - frame_size;
        platform::patch_ret_pc(stack, sp, blob_pc);
        platform::patch_saved_fp(stack, sp, sender_sp);
        self.thread.set_anchor(sp);
        sp
    }

    /// Push the yield stub and publish the anchor at it. Returns the sp
    /// to pass to freeze.
    pub fn push_yield_stub(&mut self) -> usize {
        let pc = self.rt.stubs.yield_stub().start().offset(1);
        self.push_stub(pc, platform::METADATA_WORDS)
    }

    /// Push a safepoint stub, as forced preemption would.
    pub fn push_safepoint_stub(&mut self) -> usize {
        let blob = Arc::clone(self.rt.stubs.safepoint_stub());
        let pc = blob.start().offset(1);
        self.push_stub(pc, blob.frame_size())
    }

    /// Continue building above frames just thawed at `sp`.
    pub fn resume_after_thaw(&mut self, sp: usize) {
        let stack = self.thread.stack();
        self.caller_pc = platform::read_ret_pc(stack, sp);
        self.caller_fp = platform::read_saved_fp(stack, sp);
        self.cur_bottom = sp;
    }

    /// Push the yield stub and freeze.
    pub fn yield_and_freeze(&mut self) -> u8 {
        let sp = self.push_yield_stub();
        self.rt.freeze(&mut self.thread, &mut self.cont, sp)
    }

    /// Snapshot a stack region for byte-identity comparisons.
    pub fn snapshot(&self, from: usize, to: usize) -> Vec<Word> {
        self.thread.stack()[from..to].to_vec()
    }
}
