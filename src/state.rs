//! Banked guest register file.
//!
//! The struct is `repr(C)` because compiled blocks address it directly as
//! `[state_base + offset]`; the offset helpers below must agree with the
//! routing done by [`State::gpr`] and friends, and a test pins that down.

use std::mem::offset_of;

use crate::guest::{Cpsr, Gpr, Mode};

/// Which r13/r14 (and SPSR) bank a mode uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum Bank {
    /// User and System share the unbanked registers.
    None = 0,
    Fiq = 1,
    Irq = 2,
    Supervisor = 3,
    Abort = 4,
    Undefined = 5,
}

impl Bank {
    fn of(mode: Mode) -> Bank {
        match mode {
            Mode::User | Mode::System => Bank::None,
            Mode::Fiq => Bank::Fiq,
            Mode::Irq => Bank::Irq,
            Mode::Supervisor => Bank::Supervisor,
            Mode::Abort => Bank::Abort,
            Mode::Undefined => Bank::Undefined,
        }
    }
}

const BANK_COUNT: usize = 6;

/// Guest CPU state: banked GPRs, CPSR and per-mode SPSRs.
///
/// PC is stored as the fetch-ahead value, `instruction_address +
/// 2 * opcode_size`, matching the guest's pipelined reads of r15. Writes to
/// PC through the IR become visible only at block boundaries.
#[repr(C)]
pub struct State {
    /// r0-r12 for every mode except FIQ (r0-r7 are shared with FIQ too).
    gpr: [u32; 13],
    /// r8-r12 in FIQ mode.
    gpr_fiq: [u32; 5],
    /// r13/r14 per bank.
    bank: [[u32; 2]; BANK_COUNT],
    /// r15, shared by all modes.
    pc: u32,
    cpsr: Cpsr,
    /// SPSR per bank. The `Bank::None` slot exists but is architecturally
    /// unreachable; User/System reads return it rather than faulting.
    spsr: [Cpsr; BANK_COUNT],
}

impl State {
    pub fn new() -> State {
        State {
            gpr: [0; 13],
            gpr_fiq: [0; 5],
            bank: [[0; 2]; BANK_COUNT],
            pc: 0,
            cpsr: Cpsr::default(),
            spsr: [Cpsr::default(); BANK_COUNT],
        }
    }

    pub fn gpr(&self, mode: Mode, reg: Gpr) -> u32 {
        match reg.index() {
            i @ 0..=7 => self.gpr[i],
            i @ 8..=12 if mode == Mode::Fiq => self.gpr_fiq[i - 8],
            i @ 8..=12 => self.gpr[i],
            i @ (13 | 14) => self.bank[Bank::of(mode) as usize][i - 13],
            _ => self.pc,
        }
    }

    pub fn gpr_mut(&mut self, mode: Mode, reg: Gpr) -> &mut u32 {
        match reg.index() {
            i @ 0..=7 => &mut self.gpr[i],
            i @ 8..=12 if mode == Mode::Fiq => &mut self.gpr_fiq[i - 8],
            i @ 8..=12 => &mut self.gpr[i],
            i @ (13 | 14) => &mut self.bank[Bank::of(mode) as usize][i - 13],
            _ => &mut self.pc,
        }
    }

    pub fn cpsr(&self) -> Cpsr {
        self.cpsr
    }

    pub fn cpsr_mut(&mut self) -> &mut Cpsr {
        &mut self.cpsr
    }

    pub fn spsr(&self, mode: Mode) -> Cpsr {
        self.spsr[Bank::of(mode) as usize]
    }

    pub fn spsr_mut(&mut self, mode: Mode) -> &mut Cpsr {
        &mut self.spsr[Bank::of(mode) as usize]
    }

    /// Byte offset of a banked GPR, for state-relative addressing in
    /// emitted code. Must route exactly like [`State::gpr`].
    pub(crate) fn gpr_offset(mode: Mode, reg: Gpr) -> usize {
        match reg.index() {
            i @ 0..=7 => offset_of!(State, gpr) + i * 4,
            i @ 8..=12 if mode == Mode::Fiq => offset_of!(State, gpr_fiq) + (i - 8) * 4,
            i @ 8..=12 => offset_of!(State, gpr) + i * 4,
            i @ (13 | 14) => offset_of!(State, bank) + (Bank::of(mode) as usize * 2 + i - 13) * 4,
            _ => offset_of!(State, pc),
        }
    }

    pub(crate) fn pc_offset() -> usize {
        offset_of!(State, pc)
    }

    pub(crate) fn cpsr_offset() -> usize {
        offset_of!(State, cpsr)
    }
}

impl Default for State {
    fn default() -> State {
        State::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_registers_are_shared() {
        let mut state = State::new();
        *state.gpr_mut(Mode::User, Gpr::R3) = 0x1234;
        assert_eq!(state.gpr(Mode::Fiq, Gpr::R3), 0x1234);
        assert_eq!(state.gpr(Mode::Irq, Gpr::R3), 0x1234);
    }

    #[test]
    fn fiq_banks_r8_to_r12() {
        let mut state = State::new();
        *state.gpr_mut(Mode::User, Gpr::R8) = 1;
        *state.gpr_mut(Mode::Fiq, Gpr::R8) = 2;
        assert_eq!(state.gpr(Mode::User, Gpr::R8), 1);
        assert_eq!(state.gpr(Mode::System, Gpr::R8), 1);
        assert_eq!(state.gpr(Mode::Fiq, Gpr::R8), 2);
    }

    #[test]
    fn r13_r14_are_banked_per_mode() {
        let mut state = State::new();
        *state.gpr_mut(Mode::User, Gpr::SP) = 0x100;
        *state.gpr_mut(Mode::Irq, Gpr::SP) = 0x200;
        *state.gpr_mut(Mode::Supervisor, Gpr::SP) = 0x300;
        assert_eq!(state.gpr(Mode::User, Gpr::SP), 0x100);
        // System shares the User bank.
        assert_eq!(state.gpr(Mode::System, Gpr::SP), 0x100);
        assert_eq!(state.gpr(Mode::Irq, Gpr::SP), 0x200);
        assert_eq!(state.gpr(Mode::Supervisor, Gpr::SP), 0x300);
    }

    #[test]
    fn pc_is_shared_by_all_modes() {
        let mut state = State::new();
        *state.gpr_mut(Mode::Supervisor, Gpr::PC) = 0x08000008;
        assert_eq!(state.gpr(Mode::User, Gpr::PC), 0x08000008);
    }

    #[test]
    fn offsets_agree_with_routing() {
        let mut state = State::new();
        let base = &state as *const State as usize;
        let modes = [
            Mode::User,
            Mode::Fiq,
            Mode::Irq,
            Mode::Supervisor,
            Mode::Abort,
            Mode::Undefined,
            Mode::System,
        ];
        for mode in modes {
            for reg in 0..16 {
                let reg = Gpr::from_bits(reg);
                let via_ref = state.gpr_mut(mode, reg) as *mut u32 as usize - base;
                assert_eq!(via_ref, State::gpr_offset(mode, reg), "{mode:?} {reg}");
            }
        }
        let cpsr = state.cpsr_mut() as *mut Cpsr as usize - base;
        assert_eq!(cpsr, State::cpsr_offset());
    }
}
