//! Guest architecture constants: registers, modes, condition codes and the
//! program status register layout.

use std::fmt;

/// Address of the IRQ exception vector.
pub const IRQ_VECTOR: u32 = 0x18;

/// Guest architecture revision. Selects, among other things, whether a load
/// into PC exchanges the instruction set (ARMv5TE) or keeps it (ARMv4T).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Armv4T,
    Armv5Te,
}

// ─── General-purpose registers ──────────────────────────────────────────────

/// A guest general-purpose register index. Which physical storage it names
/// depends on the current [`Mode`]; see [`crate::state::State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gpr {
    pub const SP: Gpr = Gpr::R13;
    pub const LR: Gpr = Gpr::R14;
    pub const PC: Gpr = Gpr::R15;

    /// Decode a 4-bit register field.
    pub fn from_bits(bits: u32) -> Gpr {
        match bits & 0xF {
            0 => Gpr::R0,
            1 => Gpr::R1,
            2 => Gpr::R2,
            3 => Gpr::R3,
            4 => Gpr::R4,
            5 => Gpr::R5,
            6 => Gpr::R6,
            7 => Gpr::R7,
            8 => Gpr::R8,
            9 => Gpr::R9,
            10 => Gpr::R10,
            11 => Gpr::R11,
            12 => Gpr::R12,
            13 => Gpr::R13,
            14 => Gpr::R14,
            _ => Gpr::R15,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.index())
    }
}

// ─── Processor modes ────────────────────────────────────────────────────────

/// Processor mode, as encoded in the low five bits of the CPSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Mode {
    User = 0b10000,
    Fiq = 0b10001,
    Irq = 0b10010,
    Supervisor = 0b10011,
    Abort = 0b10111,
    Undefined = 0b11011,
    System = 0b11111,
}

impl Mode {
    pub fn from_bits(bits: u32) -> Option<Mode> {
        match bits & 0x1F {
            0b10000 => Some(Mode::User),
            0b10001 => Some(Mode::Fiq),
            0b10010 => Some(Mode::Irq),
            0b10011 => Some(Mode::Supervisor),
            0b10111 => Some(Mode::Abort),
            0b11011 => Some(Mode::Undefined),
            0b11111 => Some(Mode::System),
            _ => None,
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    /// Three-letter mnemonic used in IR listings.
    pub fn short(self) -> &'static str {
        match self {
            Mode::User => "usr",
            Mode::Fiq => "fiq",
            Mode::Irq => "irq",
            Mode::Supervisor => "svc",
            Mode::Abort => "abt",
            Mode::Undefined => "und",
            Mode::System => "sys",
        }
    }
}

// ─── Condition codes and shifts ─────────────────────────────────────────────

/// Instruction condition code (bits 31-28 of an ARM instruction word).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
    Nv,
}

impl Condition {
    pub fn from_bits(bits: u32) -> Condition {
        match bits & 0xF {
            0 => Condition::Eq,
            1 => Condition::Ne,
            2 => Condition::Cs,
            3 => Condition::Cc,
            4 => Condition::Mi,
            5 => Condition::Pl,
            6 => Condition::Vs,
            7 => Condition::Vc,
            8 => Condition::Hi,
            9 => Condition::Ls,
            10 => Condition::Ge,
            11 => Condition::Lt,
            12 => Condition::Gt,
            13 => Condition::Le,
            14 => Condition::Al,
            _ => Condition::Nv,
        }
    }
}

/// Barrel shifter operation (bits 6-5 of a shifted register operand).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftType {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl ShiftType {
    pub fn from_bits(bits: u32) -> ShiftType {
        match bits & 3 {
            0 => ShiftType::Lsl,
            1 => ShiftType::Lsr,
            2 => ShiftType::Asr,
            _ => ShiftType::Ror,
        }
    }
}

// ─── Program status register ────────────────────────────────────────────────

/// Current/saved program status register.
///
/// Wraps the raw 32-bit value; the layout is the architectural one (mode in
/// bits 4-0, T in bit 5, IRQ mask in bit 7, NZCV in bits 31-28). The wrapper
/// is `repr(transparent)` because emitted code reads and writes the word
/// in place inside [`crate::state::State`].
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Cpsr(u32);

impl Cpsr {
    const THUMB: u32 = 1 << 5;
    const MASK_IRQ: u32 = 1 << 7;
    const N: u32 = 1 << 31;
    const Z: u32 = 1 << 30;
    const C: u32 = 1 << 29;
    const V: u32 = 1 << 28;

    pub fn from_bits(bits: u32) -> Cpsr {
        Cpsr(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// The current mode. Reserved mode patterns collapse to System.
    pub fn mode(self) -> Mode {
        Mode::from_bits(self.0).unwrap_or(Mode::System)
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.0 = (self.0 & !0x1F) | mode.bits();
    }

    pub fn thumb(self) -> bool {
        self.0 & Self::THUMB != 0
    }

    pub fn set_thumb(&mut self, thumb: bool) {
        self.0 = (self.0 & !Self::THUMB) | (u32::from(thumb) << 5);
    }

    pub fn irq_masked(self) -> bool {
        self.0 & Self::MASK_IRQ != 0
    }

    pub fn set_irq_masked(&mut self, masked: bool) {
        self.0 = (self.0 & !Self::MASK_IRQ) | (u32::from(masked) << 7);
    }

    pub fn n(self) -> bool {
        self.0 & Self::N != 0
    }

    pub fn z(self) -> bool {
        self.0 & Self::Z != 0
    }

    pub fn c(self) -> bool {
        self.0 & Self::C != 0
    }

    pub fn v(self) -> bool {
        self.0 & Self::V != 0
    }
}

impl Default for Cpsr {
    /// Mode System, everything else clear.
    fn default() -> Cpsr {
        Cpsr(Mode::System.bits())
    }
}

impl fmt::Debug for Cpsr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cpsr({:08X}: {} {}{} {}{}{}{})",
            self.0,
            self.mode().short(),
            if self.thumb() { 't' } else { 'a' },
            if self.irq_masked() { 'I' } else { '-' },
            if self.n() { 'N' } else { '-' },
            if self.z() { 'Z' } else { '-' },
            if self.c() { 'C' } else { '-' },
            if self.v() { 'V' } else { '-' },
        )
    }
}
