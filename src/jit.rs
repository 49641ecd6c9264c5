//! The JIT core: block compilation pipeline and the dispatch loop.

use tracing::{debug, trace};

use crate::arch::{self, CompileParams};
use crate::block::{BasicBlock, BlockCache, BlockKey};
use crate::guest::{Arch, Gpr, Mode, IRQ_VECTOR};
use crate::memory::Memory;
use crate::opt;
use crate::state::State;
use crate::translate::Translator;
use crate::{trace_blocks, JitError};

/// One guest CPU instance.
///
/// Compiled blocks embed the addresses of `state` and `memory`, so a `Jit`
/// must never move once the first block is compiled; construction hands it
/// out boxed and the facade keeps it that way.
pub(crate) struct Jit {
    state: State,
    memory: Box<dyn Memory>,
    translator: Translator,
    block_cache: BlockCache,
    irq_line: bool,
    cycles_to_run: i64,
}

impl Jit {
    pub(crate) fn new(memory: Box<dyn Memory>, arch: Arch) -> Box<Jit> {
        Box::new(Jit {
            state: State::new(),
            memory,
            translator: Translator::new(arch),
            block_cache: BlockCache::new(),
            irq_line: false,
            cycles_to_run: 0,
        })
    }

    pub(crate) fn state(&self) -> &State {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub(crate) fn irq_line(&self) -> bool {
        self.irq_line
    }

    pub(crate) fn set_irq_line(&mut self, asserted: bool) {
        self.irq_line = asserted;
    }

    /// Run for at least `cycles` guest cycles. Leftover budget (blocks
    /// overshoot by up to their length) carries into the next call.
    pub(crate) fn run(&mut self, cycles: u32) -> Result<(), JitError> {
        self.cycles_to_run += i64::from(cycles);

        while self.cycles_to_run > 0 {
            if self.irq_line {
                self.signal_irq();
            }

            let key = BlockKey::from_state(&self.state);
            if self.block_cache.get(key).is_none() {
                self.compile_block(key)?;
            }
            let block = self
                .block_cache
                .get(key)
                .expect("block was just compiled and inserted");
            let function = block
                .function()
                .expect("cached blocks are always compiled");
            let length = block.length;

            unsafe { function() };
            self.cycles_to_run -= i64::from(length);
        }
        Ok(())
    }

    fn compile_block(&mut self, key: BlockKey) -> Result<(), JitError> {
        let mut block = Box::new(BasicBlock::new(key));

        self.translator
            .translate(&mut block, self.memory.as_mut())
            .map_err(|err| JitError::UnimplementedInstruction {
                address: err.address,
                thumb: err.thumb,
            })?;

        if block.length == 0 {
            return Err(JitError::UnknownOpcode {
                address: key.address(),
                thumb: key.thumb(),
            });
        }

        for micro_block in &mut block.micro_blocks {
            opt::optimize(micro_block);
        }

        if trace_blocks() {
            for micro_block in &block.micro_blocks {
                debug!(address = key.address(), "block IR:\n{micro_block}");
            }
        }

        let params = CompileParams {
            state: &mut self.state,
            memory: &mut self.memory,
            thumb: key.thumb(),
        };
        arch::compile(&mut block, &params).map_err(|_| JitError::OutOfHostRegisters {
            address: key.address(),
        })?;

        debug!(
            address = key.address(),
            thumb = key.thumb(),
            cycles = block.length,
            fast_dispatch = block.enable_fast_dispatch,
            "compiled block"
        );
        self.block_cache.insert(key, block);
        Ok(())
    }

    /// IRQ exception entry, taken when the line is asserted and CPSR has
    /// IRQs unmasked.
    fn signal_irq(&mut self) {
        let cpsr = self.state.cpsr();
        if cpsr.irq_masked() {
            return;
        }
        trace!(pc = self.state.gpr(cpsr.mode(), Gpr::PC), "irq entry");

        *self.state.spsr_mut(Mode::Irq) = cpsr;

        let pc = self.state.gpr(Mode::Irq, Gpr::PC);
        // LR points at the preempted instruction + 4; the stored PC is
        // already instruction + 8 in ARM state and + 4 in Thumb.
        let lr = if cpsr.thumb() { pc } else { pc.wrapping_sub(4) };

        let mut entry = cpsr;
        entry.set_mode(Mode::Irq);
        entry.set_irq_masked(true);
        entry.set_thumb(false);
        *self.state.cpsr_mut() = entry;

        *self.state.gpr_mut(Mode::Irq, Gpr::LR) = lr;
        // Fetch-ahead convention for the first handler instruction.
        *self.state.gpr_mut(Mode::Irq, Gpr::PC) = IRQ_VECTOR + 8;
    }
}
