//! x86-64 backend: walks micro-block IR in order and appends host bytes.
//!
//! Encoding is delegated to dynasm; this module only decides which
//! instructions to emit for each IR opcode and which registers they use,
//! asking the allocator for operands (reads before writes). The finalize
//! step seals the buffer executable; nothing else touches executable
//! memory.

use dynasmrt::x64::Assembler;
use dynasmrt::{dynasm, DynasmApi};

use crate::block::BasicBlock;
use crate::ir::{IrOp, IrValue, TransferSize, VarId};
use crate::memory::{mem_read_32, mem_read_8, mem_write_32, mem_write_8, Memory};
use crate::regalloc::{Exhausted, HostReg, RegisterAllocator};
use crate::state::State;

// Register assignments:
//   r15 = guest State pointer, embedded as an immediate at compile time
//   rax = scratch; carries the RFLAGS captured by a flag-setting op until
//         the following UpdateNzcv consumes them, and call return values
//   rcx = shift counts (x86 variable shifts take the count in cl) and
//         short-lived shuffling
//   rsp = host stack
// Everything else is handed out by the register allocator. Memory
// trampolines are extern "C": live caller-saved registers are saved
// around each call and the stack stays 16-byte aligned.

/// Everything a block's code is specialized on.
pub(crate) struct CompileParams {
    pub state: *mut State,
    pub memory: *mut Box<dyn Memory>,
    /// The block key's T-bit; `Flush` realigns PC differently per set.
    pub thumb: bool,
}

/// Compile `block`'s IR into executable host code and store the entry
/// function on the block.
pub(crate) fn compile(block: &mut BasicBlock, params: &CompileParams) -> Result<(), Exhausted> {
    let mut ops = Assembler::new().expect("failed to create assembler");
    let entry = ops.offset();
    let state_ptr = params.state as usize as i64;

    // Entry leaves rsp 8 mod 16; six pushes plus the pad realign it.
    dynasm!(ops
        ; .arch x64
        ; push rbx
        ; push rbp
        ; push r12
        ; push r13
        ; push r14
        ; push r15
        ; sub rsp, 8
        ; mov r15, QWORD state_ptr
    );

    for micro_block in &block.micro_blocks {
        let mut ra = RegisterAllocator::new(micro_block);
        for (location, op) in micro_block.code().iter().enumerate() {
            emit_op(&mut ops, &mut ra, location, op, params)?;
        }
    }

    dynasm!(ops
        ; .arch x64
        ; add rsp, 8
        ; pop r15
        ; pop r14
        ; pop r13
        ; pop r12
        ; pop rbp
        ; pop rbx
        ; ret
    );

    ops.commit().expect("failed to commit assembly");
    let buffer = ops
        .finalize()
        .unwrap_or_else(|_| panic!("failed to finalize assembly"));
    let function =
        unsafe { std::mem::transmute::<*const u8, unsafe extern "C" fn()>(buffer.ptr(entry)) };
    block.set_compiled(buffer, function);
    Ok(())
}

/// A resolved IR value: a host register or an immediate.
#[derive(Clone, Copy)]
enum Operand {
    Reg(HostReg),
    Imm(u32),
}

fn resolve(
    ra: &mut RegisterAllocator,
    location: usize,
    value: IrValue,
) -> Result<Operand, Exhausted> {
    match value {
        IrValue::Var(var) => Ok(Operand::Reg(ra.get_reg(var, location)?)),
        IrValue::Const(constant) => Ok(Operand::Imm(constant.value)),
    }
}

fn mov_into(ops: &mut Assembler, dst: HostReg, src: Operand) {
    match src {
        Operand::Reg(src) => {
            if src != dst {
                dynasm!(ops ; .arch x64 ; mov Rd(dst.code()), Rd(src.code()));
            }
        }
        Operand::Imm(value) => {
            dynasm!(ops ; .arch x64 ; mov Rd(dst.code()), value as i32);
        }
    }
}

/// Save `saves` across a call, keeping rsp 16-byte aligned.
fn emit_saves(ops: &mut Assembler, saves: &[HostReg]) {
    for reg in saves {
        dynasm!(ops ; .arch x64 ; push Rq(reg.code()));
    }
    if saves.len() % 2 == 1 {
        dynasm!(ops ; .arch x64 ; sub rsp, 8);
    }
}

fn emit_restores(ops: &mut Assembler, saves: &[HostReg]) {
    if saves.len() % 2 == 1 {
        dynasm!(ops ; .arch x64 ; add rsp, 8);
    }
    for reg in saves.iter().rev() {
        dynasm!(ops ; .arch x64 ; pop Rq(reg.code()));
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

fn emit_op(
    ops: &mut Assembler,
    ra: &mut RegisterAllocator,
    location: usize,
    op: &IrOp,
    params: &CompileParams,
) -> Result<(), Exhausted> {
    match op {
        IrOp::LoadGpr { reg, dst } => {
            let dst = ra.get_reg(*dst, location)?;
            let offset = State::gpr_offset(reg.mode, reg.reg) as i32;
            dynasm!(ops ; .arch x64 ; mov Rd(dst.code()), [r15 + offset]);
        }
        IrOp::StoreGpr { reg, src } => {
            let offset = State::gpr_offset(reg.mode, reg.reg) as i32;
            match resolve(ra, location, *src)? {
                Operand::Reg(src) => {
                    dynasm!(ops ; .arch x64 ; mov [r15 + offset], Rd(src.code()));
                }
                Operand::Imm(value) => {
                    dynasm!(ops ; .arch x64 ; mov DWORD [r15 + offset], value as i32);
                }
            }
        }
        IrOp::LoadCpsr { dst } => {
            let dst = ra.get_reg(*dst, location)?;
            let offset = State::cpsr_offset() as i32;
            dynasm!(ops ; .arch x64 ; mov Rd(dst.code()), [r15 + offset]);
        }
        IrOp::StoreCpsr { src } => {
            let offset = State::cpsr_offset() as i32;
            match resolve(ra, location, *src)? {
                Operand::Reg(src) => {
                    dynasm!(ops ; .arch x64 ; mov [r15 + offset], Rd(src.code()));
                }
                Operand::Imm(value) => {
                    dynasm!(ops ; .arch x64 ; mov DWORD [r15 + offset], value as i32);
                }
            }
        }
        IrOp::Mov {
            dst,
            src,
            set_flags,
        } => {
            let src = resolve(ra, location, *src)?;
            let dst = ra.get_reg(*dst, location)?;
            mov_into(ops, dst, src);
            if *set_flags {
                // Only N and Z come from the result here; the shifter
                // carry is not modeled.
                dynasm!(ops ; .arch x64
                    ; test Rd(dst.code()), Rd(dst.code())
                    ; pushfq
                    ; pop rax
                );
            }
        }
        IrOp::Add {
            dst,
            lhs,
            rhs,
            set_flags,
        } => {
            let lhs = resolve(ra, location, *lhs)?;
            let rhs = resolve(ra, location, *rhs)?;
            let dst = ra.get_reg(*dst, location)?;
            mov_into(ops, dst, lhs);
            match rhs {
                Operand::Reg(rhs) => {
                    dynasm!(ops ; .arch x64 ; add Rd(dst.code()), Rd(rhs.code()));
                }
                Operand::Imm(value) => {
                    dynasm!(ops ; .arch x64 ; add Rd(dst.code()), value as i32);
                }
            }
            if *set_flags {
                dynasm!(ops ; .arch x64 ; pushfq ; pop rax);
            }
        }
        IrOp::Sub {
            dst,
            lhs,
            rhs,
            set_flags,
        } => {
            let lhs = resolve(ra, location, *lhs)?;
            let rhs = resolve(ra, location, *rhs)?;
            let dst = ra.get_reg(*dst, location)?;
            mov_into(ops, dst, lhs);
            match rhs {
                Operand::Reg(rhs) => {
                    dynasm!(ops ; .arch x64 ; sub Rd(dst.code()), Rd(rhs.code()));
                }
                Operand::Imm(value) => {
                    dynasm!(ops ; .arch x64 ; sub Rd(dst.code()), value as i32);
                }
            }
            if *set_flags {
                // The captured carry has x86 borrow polarity; translation
                // only sets flags on ADD today.
                dynasm!(ops ; .arch x64 ; pushfq ; pop rax);
            }
        }
        IrOp::Lsl {
            dst, src, amount, ..
        } => emit_shift(ops, ra, location, ShiftKind::Lsl, *dst, *src, *amount)?,
        IrOp::Lsr {
            dst, src, amount, ..
        } => emit_shift(ops, ra, location, ShiftKind::Lsr, *dst, *src, *amount)?,
        IrOp::Asr {
            dst, src, amount, ..
        } => emit_shift(ops, ra, location, ShiftKind::Asr, *dst, *src, *amount)?,
        IrOp::Ror {
            dst, src, amount, ..
        } => emit_shift(ops, ra, location, ShiftKind::Ror, *dst, *src, *amount)?,
        IrOp::Ldr {
            size,
            rotate,
            dst,
            addr,
        } => {
            let addr = ra.get_reg(*addr, location)?;
            let dst = ra.get_reg(*dst, location)?;
            // dst is excluded: the pops below must not clobber the result.
            let saves: Vec<HostReg> = ra
                .live_regs()
                .into_iter()
                .filter(|reg| reg.is_caller_saved() && *reg != dst)
                .collect();
            let read_fn = match size {
                TransferSize::Byte => mem_read_8 as usize,
                TransferSize::Word => mem_read_32 as usize,
            };
            let read_ptr = read_fn as i64;
            let memory_ptr = params.memory as usize as i64;
            emit_saves(ops, &saves);
            dynasm!(ops ; .arch x64
                ; mov esi, Rd(addr.code())
                ; mov rdi, QWORD memory_ptr
                ; mov rax, QWORD read_ptr
                ; call rax
            );
            emit_restores(ops, &saves);
            if *rotate && *size == TransferSize::Word {
                // Unaligned guest loads rotate right by 8 * (addr & 3).
                dynasm!(ops ; .arch x64
                    ; mov ecx, Rd(addr.code())
                    ; and ecx, 3
                    ; shl ecx, 3
                    ; ror eax, cl
                );
            }
            dynasm!(ops ; .arch x64 ; mov Rd(dst.code()), eax);
        }
        IrOp::Str { size, src, addr } => {
            let src = ra.get_reg(*src, location)?;
            let addr = ra.get_reg(*addr, location)?;
            let saves: Vec<HostReg> = ra
                .live_regs()
                .into_iter()
                .filter(|reg| reg.is_caller_saved())
                .collect();
            let write_fn = match size {
                TransferSize::Byte => mem_write_8 as usize,
                TransferSize::Word => mem_write_32 as usize,
            };
            let write_ptr = write_fn as i64;
            let memory_ptr = params.memory as usize as i64;
            emit_saves(ops, &saves);
            // Stage the value through rcx so the argument moves cannot
            // clobber each other.
            dynasm!(ops ; .arch x64
                ; mov ecx, Rd(src.code())
                ; mov esi, Rd(addr.code())
                ; mov edx, ecx
                ; mov rdi, QWORD memory_ptr
                ; mov rax, QWORD write_ptr
                ; call rax
            );
            emit_restores(ops, &saves);
        }
        IrOp::UpdateNzcv { dst, src } => {
            let src = resolve(ra, location, *src)?;
            let dst = ra.get_reg(*dst, location)?;
            mov_into(ops, dst, src);
            dynasm!(ops ; .arch x64
                ; and Rd(dst.code()), 0x0FFF_FFFF
                // SF and ZF sit 24 bits below N and Z.
                ; mov ecx, eax
                ; shl ecx, 24
                ; and ecx, 0xC000_0000u32 as i32
                ; or Rd(dst.code()), ecx
                // CF (bit 0) -> C (bit 29).
                ; mov ecx, eax
                ; shl ecx, 29
                ; and ecx, 0x2000_0000
                ; or Rd(dst.code()), ecx
                // OF (bit 11) -> V (bit 28).
                ; mov ecx, eax
                ; shl ecx, 17
                ; and ecx, 0x1000_0000
                ; or Rd(dst.code()), ecx
            );
        }
        IrOp::AdvancePc { pc } => {
            let offset = State::pc_offset() as i32;
            let pc = *pc as i32;
            dynasm!(ops ; .arch x64 ; mov DWORD [r15 + offset], pc);
        }
        IrOp::Flush => {
            let offset = State::pc_offset() as i32;
            // pc holds a raw branch target; realign it to the fetch-ahead
            // convention for the current instruction set.
            if params.thumb {
                dynasm!(ops ; .arch x64
                    ; mov eax, [r15 + offset]
                    ; and eax, -2
                    ; add eax, 4
                    ; mov [r15 + offset], eax
                );
            } else {
                dynasm!(ops ; .arch x64
                    ; mov eax, [r15 + offset]
                    ; and eax, -4
                    ; add eax, 8
                    ; mov [r15 + offset], eax
                );
            }
        }
        IrOp::FlushExchange { addr } => {
            let addr = ra.get_reg(*addr, location)?;
            let pc = State::pc_offset() as i32;
            let cpsr = State::cpsr_offset() as i32;
            dynasm!(ops ; .arch x64
                // eax = new T bit.
                ; mov eax, Rd(addr.code())
                ; and eax, 1
                ; mov ecx, eax
                ; shl ecx, 5
                ; and DWORD [r15 + cpsr], -33
                ; or [r15 + cpsr], ecx
                // pc = (target & !(3 - 2*T)) + 8 - 4*T.
                ; mov ecx, 3
                ; sub ecx, eax
                ; sub ecx, eax
                ; not ecx
                ; and ecx, Rd(addr.code())
                ; shl eax, 2
                ; add ecx, 8
                ; sub ecx, eax
                ; mov [r15 + pc], ecx
            );
        }
    }
    Ok(())
}

fn emit_shift(
    ops: &mut Assembler,
    ra: &mut RegisterAllocator,
    location: usize,
    kind: ShiftKind,
    dst: VarId,
    src: IrValue,
    amount: IrValue,
) -> Result<(), Exhausted> {
    // The set_flags bit on shifts (the shifter carry-out) is not realized;
    // flags are produced by the flag-setting arithmetic op that consumes
    // the shifted value.
    let src = resolve(ra, location, src)?;
    let amount = resolve(ra, location, amount)?;
    let dst = ra.get_reg(dst, location)?;
    mov_into(ops, dst, src);

    match amount {
        Operand::Imm(amount) => {
            let amount = amount & 0xFF;
            if amount >= 32 {
                // x86 masks shift counts to five bits; the guest does not.
                match kind {
                    ShiftKind::Lsl | ShiftKind::Lsr => {
                        dynasm!(ops ; .arch x64 ; xor Rd(dst.code()), Rd(dst.code()));
                    }
                    ShiftKind::Asr => {
                        dynasm!(ops ; .arch x64 ; sar Rd(dst.code()), 31);
                    }
                    ShiftKind::Ror => {
                        let amount = (amount & 31) as i8;
                        if amount != 0 {
                            dynasm!(ops ; .arch x64 ; ror Rd(dst.code()), amount);
                        }
                    }
                }
            } else if amount > 0 {
                let amount = amount as i8;
                match kind {
                    ShiftKind::Lsl => dynasm!(ops ; .arch x64 ; shl Rd(dst.code()), amount),
                    ShiftKind::Lsr => dynasm!(ops ; .arch x64 ; shr Rd(dst.code()), amount),
                    ShiftKind::Asr => dynasm!(ops ; .arch x64 ; sar Rd(dst.code()), amount),
                    ShiftKind::Ror => dynasm!(ops ; .arch x64 ; ror Rd(dst.code()), amount),
                }
            }
        }
        Operand::Reg(amount) => {
            // The guest uses the low byte of the amount register.
            dynasm!(ops ; .arch x64
                ; mov ecx, Rd(amount.code())
                ; and ecx, 0xFF
            );
            match kind {
                ShiftKind::Lsl => {
                    dynasm!(ops ; .arch x64
                        ; shl Rd(dst.code()), cl
                        ; xor eax, eax
                        ; cmp ecx, 32
                        ; cmovae Rd(dst.code()), eax
                    );
                }
                ShiftKind::Lsr => {
                    dynasm!(ops ; .arch x64
                        ; shr Rd(dst.code()), cl
                        ; xor eax, eax
                        ; cmp ecx, 32
                        ; cmovae Rd(dst.code()), eax
                    );
                }
                ShiftKind::Asr => {
                    // Clamp to 31: the result of ASR #32.. matches ASR #31.
                    dynasm!(ops ; .arch x64
                        ; mov eax, 31
                        ; cmp ecx, eax
                        ; cmova ecx, eax
                        ; sar Rd(dst.code()), cl
                    );
                }
                ShiftKind::Ror => {
                    // Rotation is modular; cl semantics already match.
                    dynasm!(ops ; .arch x64 ; ror Rd(dst.code()), cl);
                }
            }
        }
    }
    Ok(())
}
