//! Guest instruction classification.
//!
//! Raw instruction words are decoded into typed structs before translation;
//! the translator never looks at encoding bits. Coverage is staged: the two
//! instruction classes below decode fully, everything else classifies as
//! [`ArmInstr::Undefined`] and surfaces instead of being skipped.

use crate::guest::{Condition, Gpr, ShiftType};

/// Data-processing ALU operation (bits 24-21).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpOpcode {
    And,
    Eor,
    Sub,
    Rsb,
    Add,
    Adc,
    Sbc,
    Rsc,
    Tst,
    Teq,
    Cmp,
    Cmn,
    Orr,
    Mov,
    Bic,
    Mvn,
}

impl DpOpcode {
    fn from_bits(bits: u32) -> DpOpcode {
        match bits & 0xF {
            0 => DpOpcode::And,
            1 => DpOpcode::Eor,
            2 => DpOpcode::Sub,
            3 => DpOpcode::Rsb,
            4 => DpOpcode::Add,
            5 => DpOpcode::Adc,
            6 => DpOpcode::Sbc,
            7 => DpOpcode::Rsc,
            8 => DpOpcode::Tst,
            9 => DpOpcode::Teq,
            10 => DpOpcode::Cmp,
            11 => DpOpcode::Cmn,
            12 => DpOpcode::Orr,
            13 => DpOpcode::Mov,
            14 => DpOpcode::Bic,
            _ => DpOpcode::Mvn,
        }
    }
}

/// Shift amount of a shifted register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftAmount {
    Imm(u8),
    Reg(Gpr),
}

/// The second operand of a data-processing instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand2 {
    /// 8-bit immediate rotated right. `rotate` is stored pre-scaled: twice
    /// the 4-bit field from the encoding.
    Imm { value: u32, rotate: u32 },
    Reg {
        reg: Gpr,
        shift: ShiftType,
        amount: ShiftAmount,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmDataProcessing {
    pub condition: Condition,
    pub opcode: DpOpcode,
    pub set_flags: bool,
    pub op1: Gpr,
    pub dst: Gpr,
    pub op2: Operand2,
}

/// Offset of a single data transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOffset {
    Imm(u32),
    /// Register with a fixed shift; the amount is always an immediate in
    /// this class. `Lsr`/`Asr` with amount 0 encode a shift by 32, and
    /// `Ror` with amount 0 encodes RRX.
    Reg {
        reg: Gpr,
        shift: ShiftType,
        amount: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmSingleDataTransfer {
    pub condition: Condition,
    /// Add the offset before the access (pre-indexed) rather than after.
    pub pre_index: bool,
    pub add: bool,
    pub byte: bool,
    pub writeback: bool,
    pub load: bool,
    pub base: Gpr,
    pub dst: Gpr,
    pub offset: TransferOffset,
}

/// A classified guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmInstr {
    DataProcessing(ArmDataProcessing),
    SingleDataTransfer(ArmSingleDataTransfer),
    Undefined,
}

/// Classify one 32-bit ARM instruction word.
pub fn decode_arm(word: u32) -> ArmInstr {
    let condition = Condition::from_bits(word >> 28);
    match (word >> 26) & 3 {
        0b00 => decode_data_processing(word, condition),
        0b01 => decode_single_data_transfer(word, condition),
        // Branches, block transfers, coprocessor and software interrupt
        // space.
        _ => ArmInstr::Undefined,
    }
}

fn decode_data_processing(word: u32, condition: Condition) -> ArmInstr {
    let immediate = word & (1 << 25) != 0;

    // Multiplies, swaps and halfword transfers occupy the register-operand
    // space with bits 4 and 7 both set.
    if !immediate && word & 0x90 == 0x90 {
        return ArmInstr::Undefined;
    }

    let opcode = DpOpcode::from_bits(word >> 21);
    let set_flags = word & (1 << 20) != 0;

    // TST/TEQ/CMP/CMN without S encode PSR transfers and BX.
    if !set_flags
        && matches!(
            opcode,
            DpOpcode::Tst | DpOpcode::Teq | DpOpcode::Cmp | DpOpcode::Cmn
        )
    {
        return ArmInstr::Undefined;
    }

    let op2 = if immediate {
        Operand2::Imm {
            value: word & 0xFF,
            rotate: ((word >> 8) & 0xF) * 2,
        }
    } else {
        let amount = if word & (1 << 4) != 0 {
            ShiftAmount::Reg(Gpr::from_bits(word >> 8))
        } else {
            ShiftAmount::Imm(((word >> 7) & 0x1F) as u8)
        };
        Operand2::Reg {
            reg: Gpr::from_bits(word),
            shift: ShiftType::from_bits(word >> 5),
            amount,
        }
    };

    ArmInstr::DataProcessing(ArmDataProcessing {
        condition,
        opcode,
        set_flags,
        op1: Gpr::from_bits(word >> 16),
        dst: Gpr::from_bits(word >> 12),
        op2,
    })
}

fn decode_single_data_transfer(word: u32, condition: Condition) -> ArmInstr {
    let register_offset = word & (1 << 25) != 0;

    // Register offset with bit 4 set is undefined-instruction space.
    if register_offset && word & (1 << 4) != 0 {
        return ArmInstr::Undefined;
    }

    let offset = if register_offset {
        TransferOffset::Reg {
            reg: Gpr::from_bits(word),
            shift: ShiftType::from_bits(word >> 5),
            amount: ((word >> 7) & 0x1F) as u8,
        }
    } else {
        TransferOffset::Imm(word & 0xFFF)
    };

    ArmInstr::SingleDataTransfer(ArmSingleDataTransfer {
        condition,
        pre_index: word & (1 << 24) != 0,
        add: word & (1 << 23) != 0,
        byte: word & (1 << 22) != 0,
        writeback: word & (1 << 21) != 0,
        load: word & (1 << 20) != 0,
        base: Gpr::from_bits(word >> 16),
        dst: Gpr::from_bits(word >> 12),
        offset,
    })
}

/// Classify one 16-bit Thumb instruction halfword.
///
/// Thumb instructions reuse the ARM structs; only the formats the
/// translator can act on decode, the rest classify as `Undefined`.
pub fn decode_thumb(half: u16) -> ArmInstr {
    let half = u32::from(half);

    // Format 6: LDR Rd, [PC, #imm8 << 2].
    if half & 0xF800 == 0x4800 {
        return ArmInstr::SingleDataTransfer(ArmSingleDataTransfer {
            condition: Condition::Al,
            pre_index: true,
            add: true,
            byte: false,
            writeback: false,
            load: true,
            base: Gpr::PC,
            dst: Gpr::from_bits(half >> 8 & 7),
            offset: TransferOffset::Imm((half & 0xFF) << 2),
        });
    }

    // Format 3: MOV/CMP/ADD/SUB with an 8-bit immediate. All of these set
    // flags.
    if half & 0xE000 == 0x2000 {
        let dst = Gpr::from_bits(half >> 8 & 7);
        let op2 = Operand2::Imm {
            value: half & 0xFF,
            rotate: 0,
        };
        let opcode = match (half >> 11) & 3 {
            0b00 => DpOpcode::Mov,
            0b10 => DpOpcode::Add,
            // CMP and SUB immediate are not staged yet.
            _ => return ArmInstr::Undefined,
        };
        return ArmInstr::DataProcessing(ArmDataProcessing {
            condition: Condition::Al,
            opcode,
            set_flags: true,
            op1: dst,
            dst,
            op2,
        });
    }

    ArmInstr::Undefined
}
