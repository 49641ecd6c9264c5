//! Translation of guest instructions into IR.
//!
//! The translator decodes straight-line guest code starting at a block's
//! key and emits IR into the block's micro-block until an instruction ends
//! the block or has no handler. Handlers mirror the guest's visible effect
//! order exactly; the optimizer relies on that.

use tracing::debug;

use crate::block::BasicBlock;
use crate::decode::{
    decode_arm, decode_thumb, ArmDataProcessing, ArmInstr, ArmSingleDataTransfer, DpOpcode,
    Operand2, ShiftAmount, TransferOffset,
};
use crate::guest::{Arch, Condition, Gpr, Mode, ShiftType};
use crate::ir::{IrConstant, IrGuestReg, IrType, IrValue, MicroBlock, TransferSize};
use crate::memory::{in_rom, Bus, Memory, HALTCNT_ADDRESS};

/// Result of translating one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Straight-line flow continues into the next instruction.
    Continue,
    /// The instruction ends the basic block.
    BreakBasicBlock,
    /// No handler covers this instruction (yet).
    Unimplemented,
}

/// The first instruction of a block has no handler; nothing was translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unimplemented {
    pub address: u32,
    pub thumb: bool,
}

pub struct Translator {
    arch: Arch,
}

impl Translator {
    pub fn new(arch: Arch) -> Translator {
        Translator { arch }
    }

    /// Populate `block` by decoding guest code at its key.
    ///
    /// An instruction without a handler ends the block; if it was the
    /// first one, nothing is translatable there and an error carries the
    /// faulting address. A block that ends early because code ran out
    /// (fetch refused) is left with `length == 0` for the caller to
    /// report.
    pub fn translate(
        &self,
        block: &mut BasicBlock,
        memory: &mut dyn Memory,
    ) -> Result<(), Unimplemented> {
        let key = block.key;
        let thumb = key.thumb();
        let opcode_size: u32 = if thumb { 2 } else { 4 };

        let mut ctx = BlockCtx {
            emitter: MicroBlock::new(),
            memory,
            arch: self.arch,
            mode: key.mode(),
            thumb,
            opcode_size,
            code_address: key.address(),
            disable_fast_dispatch: false,
        };

        let mut instructions = 0u32;
        loop {
            let checkpoint = ctx.emitter.code().len();
            let Some(instr) = ctx.fetch() else {
                break;
            };
            let status = match instr {
                ArmInstr::DataProcessing(opcode) => ctx.data_processing(opcode),
                ArmInstr::SingleDataTransfer(opcode) => ctx.single_data_transfer(opcode),
                ArmInstr::Undefined => Status::Unimplemented,
            };
            match status {
                Status::Continue => {
                    instructions += 1;
                    ctx.code_address = ctx.code_address.wrapping_add(opcode_size);
                }
                Status::BreakBasicBlock => {
                    instructions += 1;
                    break;
                }
                Status::Unimplemented => {
                    // Roll back whatever the handler emitted before giving
                    // up; the instruction becomes the start of the next
                    // block, where hitting it again is a hard error.
                    ctx.emitter.truncate_code(checkpoint);
                    if instructions == 0 {
                        return Err(Unimplemented {
                            address: ctx.code_address,
                            thumb,
                        });
                    }
                    break;
                }
            }
        }

        block.length = instructions + ctx.emitter.data_cycles;
        if ctx.disable_fast_dispatch {
            block.enable_fast_dispatch = false;
        }
        debug!(
            address = key.address(),
            thumb,
            instructions,
            cycles = block.length,
            "translated block"
        );
        block.micro_blocks.push(ctx.emitter);
        Ok(())
    }
}

struct BlockCtx<'a> {
    emitter: MicroBlock,
    memory: &'a mut dyn Memory,
    arch: Arch,
    mode: Mode,
    thumb: bool,
    opcode_size: u32,
    /// Address of the instruction currently being translated.
    code_address: u32,
    disable_fast_dispatch: bool,
}

impl BlockCtx<'_> {
    fn fetch(&mut self) -> Option<ArmInstr> {
        if self.thumb {
            self.memory
                .fast_read_16(self.code_address & !1, Bus::Code)
                .map(decode_thumb)
        } else {
            self.memory
                .fast_read_32(self.code_address & !3, Bus::Code)
                .map(decode_arm)
        }
    }

    fn guest_reg(&self, reg: Gpr) -> IrGuestReg {
        IrGuestReg {
            reg,
            mode: self.mode,
        }
    }

    /// Store the fetch-ahead PC for the next instruction.
    fn emit_advance_pc(&mut self) {
        self.emitter
            .advance_pc(self.code_address.wrapping_add(self.opcode_size * 3));
    }

    fn data_processing(&mut self, opcode: ArmDataProcessing) -> Status {
        if opcode.condition != Condition::Al {
            return Status::Unimplemented;
        }
        // Flag updates beyond the adder's are not modeled yet.
        if opcode.set_flags && opcode.opcode != DpOpcode::Add {
            return Status::Unimplemented;
        }
        // A computed PC must not propagate into the block; writes to PC
        // would have to end it, which this class does not support yet.
        if opcode.dst == Gpr::PC {
            return Status::Unimplemented;
        }

        let op2: IrValue = match opcode.op2 {
            Operand2::Imm { value, rotate } => {
                // The carry-out of a nonzero rotate is not forwarded; only
                // ADD sets flags today and its carry comes from the adder.
                IrConstant::u32(value.rotate_right(rotate)).into()
            }
            Operand2::Reg { reg, shift, amount } => {
                let source = self.emitter.create_var(IrType::U32, "shift_source");
                let result = self.emitter.create_var(IrType::U32, "shift_result");
                self.emitter.load_gpr(self.guest_reg(reg), source);
                let amount: IrValue = match amount {
                    ShiftAmount::Imm(value) => IrConstant::u32(value.into()).into(),
                    ShiftAmount::Reg(reg) => {
                        let amount = self.emitter.create_var(IrType::U32, "shift_amount");
                        self.emitter.load_gpr(self.guest_reg(reg), amount);
                        amount.into()
                    }
                };
                self.emitter
                    .shift(shift, result, source, amount, opcode.set_flags);
                result.into()
            }
        };

        match opcode.opcode {
            DpOpcode::Add => {
                let op1 = self.emitter.create_var(IrType::U32, "op1");
                let result = self.emitter.create_var(IrType::U32, "result");
                self.emitter.load_gpr(self.guest_reg(opcode.op1), op1);
                self.emitter.add(result, op1, op2, opcode.set_flags);
                self.emitter.store_gpr(self.guest_reg(opcode.dst), result);
                if opcode.set_flags {
                    // The flag writeback is atomic from the guest's view:
                    // nothing may touch CPSR between these three ops.
                    let cpsr_in = self.emitter.create_var(IrType::U32, "cpsr_in");
                    let cpsr_out = self.emitter.create_var(IrType::U32, "cpsr_out");
                    self.emitter.load_cpsr(cpsr_in);
                    self.emitter.update_nzcv(cpsr_out, cpsr_in);
                    self.emitter.store_cpsr(cpsr_out);
                }
            }
            DpOpcode::Mov => {
                self.emitter.store_gpr(self.guest_reg(opcode.dst), op2);
            }
            _ => return Status::Unimplemented,
        }

        self.emit_advance_pc();
        Status::Continue
    }

    fn single_data_transfer(&mut self, opcode: ArmSingleDataTransfer) -> Status {
        if opcode.condition != Condition::Al {
            return Status::Unimplemented;
        }
        // Post-indexed with writeback forces a user-mode access (LDRT and
        // STRT), which is not supported.
        if !opcode.pre_index && opcode.writeback {
            return Status::Unimplemented;
        }

        let mut might_be_haltcnt_write = false;
        if !opcode.load && opcode.byte {
            // A byte store that might land on HALT control can stop the
            // guest clock; the dispatcher must get control back afterwards.
            // Only a PC-relative target can be excluded statically.
            might_be_haltcnt_write = match (opcode.base, opcode.offset) {
                (Gpr::PC, TransferOffset::Imm(imm)) => {
                    self.transfer_address(imm, opcode.add) == HALTCNT_ADDRESS
                }
                _ => true,
            };
        }

        let offset: IrValue = match opcode.offset {
            TransferOffset::Imm(imm) => {
                // PC-relative load from a region known to be ROM: read the
                // target now and emit the literal instead of a runtime
                // load.
                if opcode.base == Gpr::PC
                    && opcode.pre_index
                    && !opcode.writeback
                    && opcode.load
                    && opcode.dst != Gpr::PC
                {
                    let address = self.transfer_address(imm, opcode.add);
                    if in_rom(address) && (opcode.byte || address & 3 == 0) {
                        let literal = if opcode.byte {
                            self.memory.fast_read_8(address, Bus::Data).map(u32::from)
                        } else {
                            self.memory.fast_read_32(address, Bus::Data)
                        };
                        // A refused fast read falls through to the runtime
                        // load below.
                        if let Some(value) = literal {
                            let data = self.emitter.create_var(IrType::U32, "data");
                            self.emitter.mov(data, IrConstant::u32(value), false);
                            self.emitter.store_gpr(self.guest_reg(opcode.dst), data);
                            self.emit_advance_pc();
                            self.emitter.data_cycles += 1;
                            return Status::Continue;
                        }
                    }
                }
                IrConstant::u32(imm).into()
            }
            TransferOffset::Reg { reg, shift, amount } => {
                // ROR #0 encodes RRX, which needs the carry flag.
                if shift == ShiftType::Ror && amount == 0 {
                    return Status::Unimplemented;
                }
                // LSR/ASR #0 encode a shift by 32.
                let amount = match (shift, amount) {
                    (ShiftType::Lsr | ShiftType::Asr, 0) => 32,
                    (_, n) => u32::from(n),
                };
                let offset_reg = self.emitter.create_var(IrType::U32, "base_offset_reg");
                let offset_var = self.emitter.create_var(IrType::U32, "base_offset_shifted");
                self.emitter.load_gpr(self.guest_reg(reg), offset_reg);
                self.emitter
                    .shift(shift, offset_var, offset_reg, IrConstant::u32(amount), false);
                offset_var.into()
            }
        };

        let base_old = self.emitter.create_var(IrType::U32, "base_old");
        let base_new = self.emitter.create_var(IrType::U32, "base_new");

        if opcode.base == Gpr::PC {
            // PC is word-aligned before forming the address so that no
            // rotated read happens on Thumb PC-relative loads.
            let base = (self.code_address & !3).wrapping_add(self.opcode_size * 2);
            self.emitter.mov(base_old, IrConstant::u32(base), false);
        } else {
            self.emitter.load_gpr(self.guest_reg(opcode.base), base_old);
        }

        if opcode.add {
            self.emitter.add(base_new, base_old, offset, false);
        } else {
            self.emitter.sub(base_new, base_old, offset, false);
        }

        let address = if opcode.pre_index { base_new } else { base_old };

        // Advance PC before the access so a fault observes the next PC.
        self.emit_advance_pc();

        let writes_back = !opcode.pre_index || opcode.writeback;
        if opcode.load {
            let data = self.emitter.create_var(IrType::U32, "data");
            // Writeback happens first: a loaded base register keeps the
            // loaded value.
            if writes_back {
                self.emitter.store_gpr(self.guest_reg(opcode.base), base_new);
            }
            if opcode.byte {
                self.emitter.ldr(TransferSize::Byte, false, data, address);
            } else {
                self.emitter.ldr(TransferSize::Word, true, data, address);
            }
            self.emitter.store_gpr(self.guest_reg(opcode.dst), data);
        } else {
            let data = self.emitter.create_var(IrType::U32, "data");
            self.emitter.load_gpr(self.guest_reg(opcode.dst), data);
            if opcode.byte {
                self.emitter.str(TransferSize::Byte, data, address);
            } else {
                self.emitter.str(TransferSize::Word, data, address);
            }
            if writes_back {
                self.emitter.store_gpr(self.guest_reg(opcode.base), base_new);
            }
        }

        self.emitter.data_cycles += 1;

        if opcode.load && opcode.dst == Gpr::PC {
            if self.arch == Arch::Armv5Te {
                // Interworking load: the low bit of the loaded value
                // selects the instruction set.
                let target = self.emitter.create_var(IrType::U32, "exchange_target");
                self.emitter.load_gpr(self.guest_reg(Gpr::PC), target);
                self.emitter.flush_exchange(target);
            } else {
                self.emitter.flush();
            }
            return Status::BreakBasicBlock;
        }

        if might_be_haltcnt_write {
            self.disable_fast_dispatch = true;
            return Status::BreakBasicBlock;
        }

        Status::Continue
    }

    /// Absolute address of a PC-based transfer with an immediate offset.
    fn transfer_address(&self, offset: u32, add: bool) -> u32 {
        let base = (self.code_address & !3).wrapping_add(self.opcode_size * 2);
        if add {
            base.wrapping_add(offset)
        } else {
            base.wrapping_sub(offset)
        }
    }
}
