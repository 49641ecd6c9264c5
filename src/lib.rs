//! aramid: a dynamic binary translator running a 32-bit ARM guest on an
//! x86-64 host.
//!
//! Guest code is decoded into an SSA IR per straight-line block, optimized,
//! register-allocated with a single-block linear scan and emitted through
//! dynasm into executable buffers. Compiled blocks are cached by a digest
//! of the guest state (PC, T-bit, mode) and dispatched with one lookup.
//!
//! Embedders create a [`Cpu`] from a [`Descriptor`] carrying their
//! [`Memory`] implementation, poke registers, and call [`Cpu::run`].

pub mod block;
pub mod decode;
pub mod guest;
pub mod ir;
pub mod memory;
pub mod opt;
pub mod regalloc;
pub mod state;
pub mod translate;

mod arch;
mod jit;

#[cfg(test)]
mod testmem;

use std::sync::OnceLock;

use thiserror::Error;

pub use guest::{Arch, Condition, Cpsr, Gpr, Mode, ShiftType, IRQ_VECTOR};
pub use memory::{Bus, Memory, HALTCNT_ADDRESS, ROM_REGIONS};
pub use state::State;

static TRACE_BLOCKS: OnceLock<bool> = OnceLock::new();

/// Whether to log each compiled block's IR through `tracing`.
///
/// Read once from `ARAMID_TRACE_BLOCKS` (`1` or `true`), then cached.
pub(crate) fn trace_blocks() -> bool {
    *TRACE_BLOCKS.get_or_init(|| {
        matches!(
            std::env::var("ARAMID_TRACE_BLOCKS").as_deref(),
            Ok("1") | Ok("true")
        )
    })
}

/// Fatal translation or compilation failure. A block either compiles and
/// is cached whole, or nothing of it survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JitError {
    /// No instruction could be decoded at the current PC.
    #[error("unknown opcode at {address:#010X} (thumb = {thumb})")]
    UnknownOpcode { address: u32, thumb: bool },
    /// The instruction decodes but has no translation handler yet.
    #[error("unimplemented instruction at {address:#010X} (thumb = {thumb})")]
    UnimplementedInstruction { address: u32, thumb: bool },
    /// The block keeps more values live than the host has registers.
    #[error("out of host registers while compiling block at {address:#010X}")]
    OutOfHostRegisters { address: u32 },
}

/// Everything needed to construct a CPU.
pub struct Descriptor {
    pub memory: Box<dyn Memory>,
    pub arch: Arch,
}

/// A guest CPU.
///
/// Owns the JIT behind a stable heap allocation: compiled code embeds the
/// addresses of the register file and the memory collaborator.
pub struct Cpu {
    jit: Box<jit::Jit>,
}

impl Cpu {
    pub fn new(descriptor: Descriptor) -> Cpu {
        Cpu {
            jit: jit::Jit::new(descriptor.memory, descriptor.arch),
        }
    }

    /// Execute for at least `cycles` guest cycles. The budget overshoot of
    /// the last block carries over into the next call.
    pub fn run(&mut self, cycles: u32) -> Result<(), JitError> {
        self.jit.run(cycles)
    }

    /// The IRQ line. The embedder owns the level; it stays asserted until
    /// deasserted here.
    pub fn irq_line(&self) -> bool {
        self.jit.irq_line()
    }

    pub fn set_irq_line(&mut self, asserted: bool) {
        self.jit.set_irq_line(asserted);
    }

    /// Read a register as seen from the current mode.
    pub fn gpr(&self, reg: Gpr) -> u32 {
        let mode = self.cpsr().mode();
        self.jit.state().gpr(mode, reg)
    }

    pub fn set_gpr(&mut self, reg: Gpr, value: u32) {
        let mode = self.cpsr().mode();
        *self.jit.state_mut().gpr_mut(mode, reg) = value;
    }

    /// Read a register from a specific mode's bank.
    pub fn gpr_banked(&self, reg: Gpr, mode: Mode) -> u32 {
        self.jit.state().gpr(mode, reg)
    }

    pub fn set_gpr_banked(&mut self, reg: Gpr, mode: Mode, value: u32) {
        *self.jit.state_mut().gpr_mut(mode, reg) = value;
    }

    pub fn cpsr(&self) -> Cpsr {
        self.jit.state().cpsr()
    }

    pub fn set_cpsr(&mut self, cpsr: Cpsr) {
        *self.jit.state_mut().cpsr_mut() = cpsr;
    }

    pub fn spsr(&self, mode: Mode) -> Cpsr {
        self.jit.state().spsr(mode)
    }

    pub fn set_spsr(&mut self, mode: Mode, value: Cpsr) {
        *self.jit.state_mut().spsr_mut(mode) = value;
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::testmem::TestMemory;

    fn cpu_with(memory: TestMemory, arch: Arch) -> Cpu {
        Cpu::new(Descriptor {
            memory: Box::new(memory),
            arch,
        })
    }

    fn arm_rom(words: &[u32]) -> TestMemory {
        let mut memory = TestMemory::new();
        for (i, word) in words.iter().enumerate() {
            memory.write_rom_32(0x0800_0000 + i as u32 * 4, *word);
        }
        memory
    }

    /// Point the CPU at `address` with the fetch-ahead PC convention.
    fn enter(cpu: &mut Cpu, address: u32, thumb: bool) {
        let mut cpsr = cpu.cpsr();
        cpsr.set_thumb(thumb);
        cpu.set_cpsr(cpsr);
        let offset = if thumb { 4 } else { 8 };
        cpu.set_gpr(Gpr::PC, address + offset);
    }

    #[test]
    fn add_immediate_end_to_end() {
        // ADD R2, R2, #1 (AL, no flags), R2 starts at 0x41.
        let mut cpu = cpu_with(arm_rom(&[0xE2822001, 0xEA000000]), Arch::Armv4T);
        let cpsr_before = cpu.cpsr();
        cpu.set_gpr(Gpr::R2, 0x0000_0041);
        enter(&mut cpu, 0x0800_0000, false);
        cpu.run(1).unwrap();
        assert_eq!(cpu.gpr(Gpr::R2), 0x0000_0042);
        // PC advanced by one instruction.
        assert_eq!(cpu.gpr(Gpr::PC), 0x0800_0004 + 8);
        assert_eq!(cpu.cpsr().bits(), cpsr_before.bits());
    }

    #[test]
    fn mov_immediate_overwrites_prior_value() {
        // MOV R0, #0xFF regardless of what was there.
        let mut cpu = cpu_with(arm_rom(&[0xE3A000FF, 0xEA000000]), Arch::Armv4T);
        cpu.set_gpr(Gpr::R0, 0xDEAD_0000);
        enter(&mut cpu, 0x0800_0000, false);
        cpu.run(1).unwrap();
        assert_eq!(cpu.gpr(Gpr::R0), 0x0000_00FF);
    }

    #[test]
    fn adds_sets_flags_end_to_end() {
        // ADDS R0, R1, R2 with 0xFFFFFFFF + 1.
        let mut cpu = cpu_with(arm_rom(&[0xE0910002, 0xEA000000]), Arch::Armv4T);
        cpu.set_gpr(Gpr::R1, 0xFFFF_FFFF);
        cpu.set_gpr(Gpr::R2, 1);
        enter(&mut cpu, 0x0800_0000, false);
        cpu.run(1).unwrap();
        assert_eq!(cpu.gpr(Gpr::R0), 0);
        let cpsr = cpu.cpsr();
        assert!(cpsr.z() && cpsr.c() && !cpsr.n() && !cpsr.v());
        assert_eq!(cpsr.mode(), Mode::System);
    }

    #[test]
    fn rom_shortcut_end_to_end() {
        // LDR R0, [PC, #0] at 0x08000100 pulls the literal at 0x08000108.
        let mut memory = TestMemory::new();
        memory.write_rom_32(0x0800_0100, 0xE59F0000);
        memory.write_rom_bytes(0x0800_0108, &[0xDE, 0xAD, 0xBE, 0xEF]);
        let mut cpu = cpu_with(memory, Arch::Armv4T);
        enter(&mut cpu, 0x0800_0100, false);
        cpu.run(1).unwrap();
        assert_eq!(cpu.gpr(Gpr::R0), 0xEFBE_ADDE);
    }

    #[test]
    fn thumb_pc_relative_load_end_to_end() {
        // Thumb LDR R0, [PC, #0] at 0x08000102 reads (0x102 & !3) + 4.
        let mut memory = TestMemory::new();
        memory.write_rom_16(0x0800_0102, 0x4800);
        memory.write_rom_bytes(0x0800_0104, &[0xBE, 0xBA, 0xFE, 0xCA]);
        let mut cpu = cpu_with(memory, Arch::Armv4T);
        enter(&mut cpu, 0x0800_0102, true);
        cpu.run(1).unwrap();
        assert_eq!(cpu.gpr(Gpr::R0), 0xCAFE_BABE);
    }

    #[test]
    fn byte_store_to_io_runs_and_ends_the_block() {
        // STRB R0, [R1, #0] with R1 pointing at HALT control.
        let mut cpu = cpu_with(arm_rom(&[0xE5C10000, 0xE2822001]), Arch::Armv4T);
        cpu.set_gpr(Gpr::R0, 0x80);
        cpu.set_gpr(Gpr::R1, HALTCNT_ADDRESS);
        enter(&mut cpu, 0x0800_0000, false);
        cpu.run(1).unwrap();
        // The block ended at the store: the following ADD did not run.
        assert_eq!(cpu.gpr(Gpr::R2), 0);
        assert_eq!(cpu.gpr(Gpr::PC), 0x0800_0004 + 8);
    }

    #[test]
    fn load_to_pc_exchanges_on_armv5te() {
        // LDR PC, [R0] with the loaded word's low bit set.
        let mut memory = arm_rom(&[0xE590F000]);
        memory.write_ram_32(0x1000, 0x0000_8001);
        let mut cpu = cpu_with(memory, Arch::Armv5Te);
        cpu.set_gpr(Gpr::R0, 0x1000);
        enter(&mut cpu, 0x0800_0000, false);
        cpu.run(1).unwrap();
        // Next entry decodes Thumb at 0x8000.
        assert!(cpu.cpsr().thumb());
        assert_eq!(cpu.gpr(Gpr::PC), 0x8000 + 4);
    }

    #[test]
    fn load_to_pc_keeps_arm_on_armv4t() {
        let mut memory = arm_rom(&[0xE590F000]);
        memory.write_ram_32(0x1000, 0x0000_8001);
        let mut cpu = cpu_with(memory, Arch::Armv4T);
        cpu.set_gpr(Gpr::R0, 0x1000);
        enter(&mut cpu, 0x0800_0000, false);
        cpu.run(1).unwrap();
        assert!(!cpu.cpsr().thumb());
        assert_eq!(cpu.gpr(Gpr::PC), 0x8000 + 8);
    }

    #[test]
    fn irq_entry_switches_mode_and_banks() {
        // Handler at the vector: ADD R2, R2, #1.
        let mut memory = TestMemory::new();
        memory.write_ram_32(IRQ_VECTOR, 0xE2822001);
        let mut cpu = cpu_with(memory, Arch::Armv4T);

        let mut cpsr = Cpsr::default();
        cpsr.set_mode(Mode::User);
        cpsr.set_irq_masked(false);
        cpu.set_cpsr(cpsr);
        let user_cpsr = cpu.cpsr();
        cpu.set_gpr_banked(Gpr::LR, Mode::User, 0x1111_1111);
        cpu.set_gpr(Gpr::PC, 0x0000_1000);
        cpu.set_irq_line(true);

        cpu.run(1).unwrap();

        let cpsr = cpu.cpsr();
        assert_eq!(cpsr.mode(), Mode::Irq);
        assert!(cpsr.irq_masked());
        assert!(!cpsr.thumb());
        assert_eq!(cpu.gpr_banked(Gpr::LR, Mode::Irq), 0x0000_0FFC);
        // The user bank was untouched.
        assert_eq!(cpu.gpr_banked(Gpr::LR, Mode::User), 0x1111_1111);
        assert_eq!(cpu.spsr(Mode::Irq).bits(), user_cpsr.bits());
        // The handler instruction ran.
        assert_eq!(cpu.gpr(Gpr::R2), 1);
    }

    #[test]
    fn masked_irq_is_not_taken() {
        let mut memory = TestMemory::new();
        memory.write_ram_32(0x100, 0xE2822001); // ADD R2, R2, #1
        let mut cpu = cpu_with(memory, Arch::Armv4T);
        let mut cpsr = Cpsr::default();
        cpsr.set_irq_masked(true);
        cpu.set_cpsr(cpsr);
        cpu.set_gpr(Gpr::PC, 0x100 + 8);
        cpu.set_irq_line(true);
        cpu.run(1).unwrap();
        assert_eq!(cpu.cpsr().mode(), Mode::System);
        assert_eq!(cpu.gpr(Gpr::R2), 1);
    }

    #[test]
    fn unknown_opcode_is_fatal_with_context() {
        // B is decodable on real silicon but outside the staged decoder.
        let mut cpu = cpu_with(arm_rom(&[0xEA000000]), Arch::Armv4T);
        enter(&mut cpu, 0x0800_0000, false);
        let err = cpu.run(1).unwrap_err();
        assert_eq!(
            err,
            JitError::UnimplementedInstruction {
                address: 0x0800_0000,
                thumb: false
            }
        );
    }

    #[test]
    fn unmapped_pc_is_an_unknown_opcode() {
        let mut cpu = cpu_with(TestMemory::new(), Arch::Armv4T);
        enter(&mut cpu, 0x0BAD_0000, false);
        let err = cpu.run(1).unwrap_err();
        assert_eq!(
            err,
            JitError::UnknownOpcode {
                address: 0x0BAD_0000,
                thumb: false
            }
        );
    }

    #[test]
    fn blocks_are_translated_once_and_reexecuted() {
        // Two ADDs, then re-enter the same block three times.
        let mut cpu = cpu_with(
            arm_rom(&[0xE2822001, 0xE2811001, 0xEA000000]),
            Arch::Armv4T,
        );
        // The block is two cycles long; a matching budget keeps every
        // call at exactly one dispatch.
        for expected in 1..=3u32 {
            enter(&mut cpu, 0x0800_0000, false);
            cpu.run(2).unwrap();
            assert_eq!(cpu.gpr(Gpr::R2), expected);
            assert_eq!(cpu.gpr(Gpr::R1), expected);
        }
    }

    #[test]
    fn cycle_budget_carries_over() {
        // A two-instruction block consumes 2 cycles per entry.
        let mut cpu = cpu_with(
            arm_rom(&[0xE2822001, 0xE2811001, 0xEA000000]),
            Arch::Armv4T,
        );
        enter(&mut cpu, 0x0800_0000, false);
        cpu.run(1).unwrap();
        assert_eq!(cpu.gpr(Gpr::R2), 1);
        // The block overshot by 1 cycle; a 1-cycle budget is consumed by
        // the debt and nothing runs.
        enter(&mut cpu, 0x0800_0000, false);
        cpu.run(1).unwrap();
        assert_eq!(cpu.gpr(Gpr::R2), 1);
        // A second cycle pays off the debt and runs the block again.
        cpu.run(1).unwrap();
        assert_eq!(cpu.gpr(Gpr::R2), 2);
    }

    #[test]
    fn thumb_adds_runs() {
        // Thumb ADDS R2, #1 twice, then an untranslatable halfword.
        let mut memory = TestMemory::new();
        memory.write_rom_16(0x0800_0000, 0x3201);
        memory.write_rom_16(0x0800_0002, 0x3201);
        memory.write_rom_16(0x0800_0004, 0xB500);
        let mut cpu = cpu_with(memory, Arch::Armv4T);
        enter(&mut cpu, 0x0800_0000, true);
        cpu.run(1).unwrap();
        assert_eq!(cpu.gpr(Gpr::R2), 2);
        assert_eq!(cpu.gpr(Gpr::PC), 0x0800_0004 + 4);
        assert!(cpu.cpsr().thumb());
    }
}
