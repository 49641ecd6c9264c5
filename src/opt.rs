//! Per-micro-block IR rewrites.
//!
//! Runs after translation and before codegen. Every pass preserves the
//! ordered sequence of side-effecting opcodes (guest register and CPSR
//! writes, memory ops, PC updates, flushes) and the SSA property; the
//! whole pipeline iterates to a fixpoint, which also makes it idempotent.

use std::collections::{HashMap, HashSet};

use crate::ir::{IrConstant, IrOp, IrValue, MicroBlock, VarId};

/// Optimize one micro-block in place.
pub fn optimize(micro_block: &mut MicroBlock) {
    loop {
        let mut changed = false;
        changed |= propagate_constants(micro_block);
        changed |= fold_constant_arithmetic(micro_block);
        changed |= eliminate_dead_vars(micro_block);
        if !changed {
            break;
        }
    }
}

/// Replace reads of a variable defined by `Mov` of a constant with the
/// constant itself. The `Mov` usually becomes dead and falls to the
/// elimination pass. Flag-setting moves are left alone.
fn propagate_constants(micro_block: &mut MicroBlock) -> bool {
    let mut constants: HashMap<VarId, IrConstant> = HashMap::new();
    for op in micro_block.code() {
        if let IrOp::Mov {
            dst,
            src: IrValue::Const(constant),
            set_flags: false,
        } = op
        {
            constants.insert(*dst, *constant);
        }
    }
    if constants.is_empty() {
        return false;
    }

    let mut changed = false;
    for op in micro_block.code_mut() {
        for value in op.values_mut() {
            if let IrValue::Var(var) = value {
                if let Some(constant) = constants.get(var) {
                    *value = IrValue::Const(*constant);
                    changed = true;
                }
            }
        }
    }
    changed
}

/// Fold `Add`/`Sub` of two constants into a `Mov` of the result.
fn fold_constant_arithmetic(micro_block: &mut MicroBlock) -> bool {
    let mut changed = false;
    for op in micro_block.code_mut() {
        let folded = match *op {
            IrOp::Add {
                dst,
                lhs: IrValue::Const(lhs),
                rhs: IrValue::Const(rhs),
                set_flags: false,
            } => Some((dst, lhs.value.wrapping_add(rhs.value))),
            IrOp::Sub {
                dst,
                lhs: IrValue::Const(lhs),
                rhs: IrValue::Const(rhs),
                set_flags: false,
            } => Some((dst, lhs.value.wrapping_sub(rhs.value))),
            _ => None,
        };
        if let Some((dst, value)) = folded {
            *op = IrOp::Mov {
                dst,
                src: IrValue::Const(IrConstant::u32(value)),
                set_flags: false,
            };
            changed = true;
        }
    }
    changed
}

/// Remove opcodes defining variables that are never read, when removal is
/// invisible: the opcode must have no guest-visible effect and must not
/// produce host flags for a later `UpdateNzcv`.
fn eliminate_dead_vars(micro_block: &mut MicroBlock) -> bool {
    let mut read: HashSet<VarId> = HashSet::new();
    for op in micro_block.code() {
        read.extend(op.read_vars());
    }

    let before = micro_block.code().len();
    micro_block.code_mut().retain(|op| {
        if op.has_side_effect() {
            return true;
        }
        match op.written_var() {
            Some(dst) => read.contains(&dst),
            None => true,
        }
    });
    micro_block.code().len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::{Gpr, Mode};
    use crate::ir::{IrGuestReg, IrType, TransferSize};

    fn r(reg: Gpr) -> IrGuestReg {
        IrGuestReg {
            reg,
            mode: Mode::System,
        }
    }

    fn side_effect_ops(micro_block: &MicroBlock) -> Vec<IrOp> {
        micro_block
            .code()
            .iter()
            .filter(|op| op.has_side_effect())
            .cloned()
            .collect()
    }

    #[test]
    fn dead_load_is_removed() {
        let mut mb = MicroBlock::new();
        let dead = mb.create_var(IrType::U32, "dead");
        let live = mb.create_var(IrType::U32, "live");
        mb.load_gpr(r(Gpr::R0), dead);
        mb.load_gpr(r(Gpr::R1), live);
        mb.store_gpr(r(Gpr::R2), live);

        optimize(&mut mb);

        assert_eq!(mb.code().len(), 2);
        assert!(!mb.code().iter().any(|op| op.writes(dead)));
    }

    #[test]
    fn constant_mov_propagates_and_dies() {
        let mut mb = MicroBlock::new();
        let constant = mb.create_var(IrType::U32, "constant");
        let sum = mb.create_var(IrType::U32, "sum");
        let base = mb.create_var(IrType::U32, "base");
        mb.load_gpr(r(Gpr::R1), base);
        mb.mov(constant, IrConstant::u32(4), false);
        mb.add(sum, base, constant, false);
        mb.store_gpr(r(Gpr::R0), sum);

        optimize(&mut mb);

        // The Mov is gone; the Add reads the constant directly.
        assert!(!mb.code().iter().any(|op| matches!(op, IrOp::Mov { .. })));
        assert!(mb.code().iter().any(|op| matches!(
            op,
            IrOp::Add {
                rhs: IrValue::Const(c),
                ..
            } if c.value == 4
        )));
    }

    #[test]
    fn constant_add_chain_folds_to_a_single_constant() {
        // mov a, 0x08000108; mov b, 4; add c, a, b; store c
        let mut mb = MicroBlock::new();
        let a = mb.create_var(IrType::U32, "a");
        let b = mb.create_var(IrType::U32, "b");
        let c = mb.create_var(IrType::U32, "c");
        mb.mov(a, IrConstant::u32(0x0800_0108), false);
        mb.mov(b, IrConstant::u32(4), false);
        mb.add(c, a, b, false);
        mb.store_gpr(r(Gpr::R0), c);

        optimize(&mut mb);

        // Everything collapses into a store of the folded constant.
        assert_eq!(mb.code().len(), 1);
        assert!(matches!(
            mb.code()[0],
            IrOp::StoreGpr {
                src: IrValue::Const(constant),
                ..
            } if constant.value == 0x0800_010C
        ));
    }

    #[test]
    fn flag_setting_ops_survive_even_when_unread() {
        let mut mb = MicroBlock::new();
        let op1 = mb.create_var(IrType::U32, "op1");
        let result = mb.create_var(IrType::U32, "result");
        let cpsr_in = mb.create_var(IrType::U32, "cpsr_in");
        let cpsr_out = mb.create_var(IrType::U32, "cpsr_out");
        mb.load_gpr(r(Gpr::R1), op1);
        // The result is never stored, but the flags feed UpdateNzcv.
        mb.add(result, op1, IrConstant::u32(1), true);
        mb.load_cpsr(cpsr_in);
        mb.update_nzcv(cpsr_out, cpsr_in);
        mb.store_cpsr(cpsr_out);

        optimize(&mut mb);

        assert!(mb
            .code()
            .iter()
            .any(|op| matches!(op, IrOp::Add { set_flags: true, .. })));
        assert!(mb
            .code()
            .iter()
            .any(|op| matches!(op, IrOp::UpdateNzcv { .. })));
    }

    #[test]
    fn loads_are_never_removed() {
        // A guest load with an unread destination still reads the bus.
        let mut mb = MicroBlock::new();
        let addr = mb.create_var(IrType::U32, "addr");
        let data = mb.create_var(IrType::U32, "data");
        mb.load_gpr(r(Gpr::R1), addr);
        mb.ldr(TransferSize::Word, true, data, addr);
        mb.advance_pc(0x8);

        optimize(&mut mb);

        assert!(mb.code().iter().any(|op| matches!(op, IrOp::Ldr { .. })));
    }

    #[test]
    fn side_effect_order_is_preserved() {
        let mut mb = MicroBlock::new();
        let dead = mb.create_var(IrType::U32, "dead");
        let addr = mb.create_var(IrType::U32, "addr");
        let data = mb.create_var(IrType::U32, "data");
        let constant = mb.create_var(IrType::U32, "constant");
        mb.load_gpr(r(Gpr::R0), dead);
        mb.load_gpr(r(Gpr::R1), addr);
        mb.advance_pc(0x0800_0008);
        mb.ldr(TransferSize::Word, true, data, addr);
        mb.store_gpr(r(Gpr::R2), data);
        mb.mov(constant, IrConstant::u32(7), false);
        mb.store_gpr(r(Gpr::R3), constant);
        mb.flush();

        let before = side_effect_ops(&mb);
        optimize(&mut mb);
        let after = side_effect_ops(&mb);

        // Constant propagation may rewrite operands of side-effecting ops,
        // but their kinds and order must match.
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(
                std::mem::discriminant(b),
                std::mem::discriminant(a),
                "{b} vs {a}"
            );
        }
        mb.assert_ssa();
    }

    #[test]
    fn optimizer_is_idempotent() {
        let mut mb = MicroBlock::new();
        let a = mb.create_var(IrType::U32, "a");
        let b = mb.create_var(IrType::U32, "b");
        let c = mb.create_var(IrType::U32, "c");
        let dead = mb.create_var(IrType::U32, "dead");
        mb.mov(a, IrConstant::u32(2), false);
        mb.load_gpr(r(Gpr::R1), b);
        mb.add(c, a, b, false);
        mb.load_gpr(r(Gpr::R5), dead);
        mb.store_gpr(r(Gpr::R0), c);

        optimize(&mut mb);
        let once = mb.to_string();
        optimize(&mut mb);
        assert_eq!(once, mb.to_string());
    }
}
