//! SSA intermediate representation for translated guest code.
//!
//! The translator lowers each guest instruction into a handful of IR
//! opcodes over single-assignment variables. Variables live in the arena of
//! the micro-block that created them and never escape it; opcodes refer to
//! them by typed id. The optimizer rewrites the opcode list in place and
//! the backend walks it once, in order, to emit host code.

use std::fmt;
use std::marker::PhantomData;

use crate::guest::{Gpr, Mode, ShiftType};

// ─── Arena and id types ─────────────────────────────────────────────────────

/// Typed index into an [`Arena`]. Generic over the element type for type
/// safety.
pub struct Id<T> {
    index: u32,
    _phantom: PhantomData<T>,
}

// Manual impls to avoid requiring T: Clone/Copy/Debug/PartialEq/Eq/Hash.
// The derived versions would propagate T's bounds, but Id<T> equality
// depends only on the index, not on T.
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

impl<T> Id<T> {
    fn new(index: u32) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// The raw index into the arena.
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Vec-backed arena with typed indexing via [`Id`].
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T: fmt::Debug> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena").field("items", &self.items).finish()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, item: T) -> Id<T> {
        let id = Id::new(self.items.len() as u32);
        self.items.push(item);
        id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (Id::new(i as u32), item))
    }
}

impl<T> std::ops::Index<Id<T>> for Arena<T> {
    type Output = T;
    fn index(&self, id: Id<T>) -> &T {
        &self.items[id.index()]
    }
}

// ─── Values ─────────────────────────────────────────────────────────────────

pub type VarId = Id<IrVariable>;

/// Width of an IR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrType {
    U8,
    U16,
    U32,
}

/// A single-assignment variable. Exactly one opcode in the owning
/// micro-block writes it; any number may read it.
#[derive(Debug)]
pub struct IrVariable {
    pub ty: IrType,
    /// Human-readable tag for listings; not identity.
    pub tag: &'static str,
}

/// An immediate. Value type: freely duplicated, never in `vars()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrConstant {
    pub value: u32,
    pub ty: IrType,
}

impl IrConstant {
    pub fn u32(value: u32) -> IrConstant {
        IrConstant {
            value,
            ty: IrType::U32,
        }
    }
}

impl From<u32> for IrConstant {
    fn from(value: u32) -> IrConstant {
        IrConstant::u32(value)
    }
}

/// Logical identity of one banked guest register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrGuestReg {
    pub reg: Gpr,
    pub mode: Mode,
}

impl fmt::Display for IrGuestReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.reg, self.mode.short())
    }
}

/// A variable or a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrValue {
    Var(VarId),
    Const(IrConstant),
}

impl IrValue {
    pub fn var(self) -> Option<VarId> {
        match self {
            IrValue::Var(v) => Some(v),
            IrValue::Const(_) => None,
        }
    }
}

impl From<VarId> for IrValue {
    fn from(var: VarId) -> IrValue {
        IrValue::Var(var)
    }
}

impl From<IrConstant> for IrValue {
    fn from(constant: IrConstant) -> IrValue {
        IrValue::Const(constant)
    }
}

impl fmt::Display for IrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrValue::Var(v) => write!(f, "v{}", v.index()),
            IrValue::Const(c) => write!(f, "{:#x}", c.value),
        }
    }
}

/// Width of a guest memory transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSize {
    Byte,
    Word,
}

// ─── Opcodes ────────────────────────────────────────────────────────────────

/// The IR operation vocabulary.
///
/// `set_flags` means the operation produces host flags that a following
/// [`IrOp::UpdateNzcv`] consumes; the pair must not have another
/// flag-producing op or a call interleaved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrOp {
    /// dst = guest register.
    LoadGpr { reg: IrGuestReg, dst: VarId },
    /// guest register = src.
    StoreGpr { reg: IrGuestReg, src: IrValue },
    /// dst = CPSR.
    LoadCpsr { dst: VarId },
    /// CPSR = src.
    StoreCpsr { src: IrValue },
    /// dst = src.
    Mov {
        dst: VarId,
        src: IrValue,
        set_flags: bool,
    },
    /// dst = lhs + rhs.
    Add {
        dst: VarId,
        lhs: IrValue,
        rhs: IrValue,
        set_flags: bool,
    },
    /// dst = lhs - rhs.
    Sub {
        dst: VarId,
        lhs: IrValue,
        rhs: IrValue,
        set_flags: bool,
    },
    /// dst = src << amount, with the guest's semantics for amounts >= 32.
    Lsl {
        dst: VarId,
        src: IrValue,
        amount: IrValue,
        set_flags: bool,
    },
    /// dst = src >> amount (logical).
    Lsr {
        dst: VarId,
        src: IrValue,
        amount: IrValue,
        set_flags: bool,
    },
    /// dst = src >> amount (arithmetic).
    Asr {
        dst: VarId,
        src: IrValue,
        amount: IrValue,
        set_flags: bool,
    },
    /// dst = src rotated right by amount.
    Ror {
        dst: VarId,
        src: IrValue,
        amount: IrValue,
        set_flags: bool,
    },
    /// dst = memory[addr]. Word loads rotate the value right by
    /// `8 * (addr & 3)` when `rotate` is set.
    Ldr {
        size: TransferSize,
        rotate: bool,
        dst: VarId,
        addr: VarId,
    },
    /// memory[addr] = src.
    Str {
        size: TransferSize,
        src: VarId,
        addr: VarId,
    },
    /// dst = src with NZCV replaced from the host flags captured by the
    /// last flag-setting opcode.
    UpdateNzcv { dst: VarId, src: IrValue },
    /// guest PC = pc. Emitted per instruction with the fetch-ahead value
    /// for the following instruction.
    AdvancePc { pc: u32 },
    /// Realign guest PC to the fetch-ahead convention after a raw target
    /// was stored to it. Keeps the current instruction set.
    Flush,
    /// Like `Flush`, but the low bit of `addr` selects the instruction
    /// set (ARMv5TE load-to-PC interworking).
    FlushExchange { addr: VarId },
}

impl IrOp {
    /// The variable this opcode writes, if any. At most one, which is what
    /// keeps the block in SSA form.
    pub fn written_var(&self) -> Option<VarId> {
        match *self {
            IrOp::LoadGpr { dst, .. }
            | IrOp::LoadCpsr { dst }
            | IrOp::Mov { dst, .. }
            | IrOp::Add { dst, .. }
            | IrOp::Sub { dst, .. }
            | IrOp::Lsl { dst, .. }
            | IrOp::Lsr { dst, .. }
            | IrOp::Asr { dst, .. }
            | IrOp::Ror { dst, .. }
            | IrOp::Ldr { dst, .. }
            | IrOp::UpdateNzcv { dst, .. } => Some(dst),
            IrOp::StoreGpr { .. }
            | IrOp::StoreCpsr { .. }
            | IrOp::Str { .. }
            | IrOp::AdvancePc { .. }
            | IrOp::Flush
            | IrOp::FlushExchange { .. } => None,
        }
    }

    /// The variables this opcode reads, in operand order.
    pub fn read_vars(&self) -> impl Iterator<Item = VarId> {
        let values: [Option<VarId>; 2] = match *self {
            IrOp::LoadGpr { .. } | IrOp::LoadCpsr { .. } | IrOp::AdvancePc { .. } | IrOp::Flush => {
                [None, None]
            }
            IrOp::StoreGpr { src, .. } | IrOp::StoreCpsr { src } => [src.var(), None],
            IrOp::Mov { src, .. } => [src.var(), None],
            IrOp::Add { lhs, rhs, .. } | IrOp::Sub { lhs, rhs, .. } => [lhs.var(), rhs.var()],
            IrOp::Lsl { src, amount, .. }
            | IrOp::Lsr { src, amount, .. }
            | IrOp::Asr { src, amount, .. }
            | IrOp::Ror { src, amount, .. } => [src.var(), amount.var()],
            IrOp::Ldr { addr, .. } => [Some(addr), None],
            IrOp::Str { src, addr, .. } => [Some(src), Some(addr)],
            IrOp::UpdateNzcv { src, .. } => [src.var(), None],
            IrOp::FlushExchange { addr } => [Some(addr), None],
        };
        values.into_iter().flatten()
    }

    pub fn writes(&self, var: VarId) -> bool {
        self.written_var() == Some(var)
    }

    pub fn reads(&self, var: VarId) -> bool {
        self.read_vars().any(|v| v == var)
    }

    /// True when removing this opcode would change guest-visible behavior
    /// or the host flags a later `UpdateNzcv` consumes. Guest loads count:
    /// reading IO is observable.
    pub fn has_side_effect(&self) -> bool {
        match *self {
            IrOp::StoreGpr { .. }
            | IrOp::StoreCpsr { .. }
            | IrOp::Ldr { .. }
            | IrOp::Str { .. }
            | IrOp::AdvancePc { .. }
            | IrOp::Flush
            | IrOp::FlushExchange { .. } => true,
            IrOp::Mov { set_flags, .. }
            | IrOp::Add { set_flags, .. }
            | IrOp::Sub { set_flags, .. }
            | IrOp::Lsl { set_flags, .. }
            | IrOp::Lsr { set_flags, .. }
            | IrOp::Asr { set_flags, .. }
            | IrOp::Ror { set_flags, .. } => set_flags,
            IrOp::LoadGpr { .. } | IrOp::LoadCpsr { .. } | IrOp::UpdateNzcv { .. } => false,
        }
    }

    /// Mutable access to every `IrValue` operand. Operands that are
    /// variables by construction (addresses, store data) are not included.
    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut IrValue> {
        let values: Vec<&mut IrValue> = match self {
            IrOp::LoadGpr { .. }
            | IrOp::LoadCpsr { .. }
            | IrOp::Ldr { .. }
            | IrOp::Str { .. }
            | IrOp::AdvancePc { .. }
            | IrOp::Flush
            | IrOp::FlushExchange { .. } => Vec::new(),
            IrOp::StoreGpr { src, .. } | IrOp::StoreCpsr { src } => vec![src],
            IrOp::Mov { src, .. } => vec![src],
            IrOp::Add { lhs, rhs, .. } | IrOp::Sub { lhs, rhs, .. } => vec![lhs, rhs],
            IrOp::Lsl { src, amount, .. }
            | IrOp::Lsr { src, amount, .. }
            | IrOp::Asr { src, amount, .. }
            | IrOp::Ror { src, amount, .. } => vec![src, amount],
            IrOp::UpdateNzcv { src, .. } => vec![src],
        };
        values.into_iter()
    }
}

// ─── Micro-block ────────────────────────────────────────────────────────────

/// One IR emitter: an ordered opcode sequence plus the variables it
/// created. A basic block is a sequence of micro-blocks; translation
/// currently produces exactly one.
#[derive(Debug)]
pub struct MicroBlock {
    code: Vec<IrOp>,
    vars: Arena<IrVariable>,
    /// Extra guest cycles charged for memory transfers in this block.
    pub data_cycles: u32,
}

impl MicroBlock {
    pub fn new() -> MicroBlock {
        MicroBlock {
            code: Vec::new(),
            vars: Arena::new(),
            data_cycles: 0,
        }
    }

    /// Create a fresh variable. The id is only meaningful within this
    /// micro-block.
    pub fn create_var(&mut self, ty: IrType, tag: &'static str) -> VarId {
        self.vars.push(IrVariable { ty, tag })
    }

    /// Opcodes in insertion order.
    pub fn code(&self) -> &[IrOp] {
        &self.code
    }

    pub(crate) fn code_mut(&mut self) -> &mut Vec<IrOp> {
        &mut self.code
    }

    /// Drop opcodes from `len` onward. Used to roll back a partially
    /// emitted instruction; orphaned variables stay in the arena but are
    /// never allocated.
    pub(crate) fn truncate_code(&mut self, len: usize) {
        self.code.truncate(len);
    }

    /// Variables in creation order.
    pub fn vars(&self) -> impl Iterator<Item = (VarId, &IrVariable)> {
        self.vars.iter()
    }

    pub fn var(&self, id: VarId) -> &IrVariable {
        &self.vars[id]
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    pub fn push(&mut self, op: IrOp) {
        self.code.push(op);
    }

    // Emitter methods, one per opcode.

    pub fn load_gpr(&mut self, reg: IrGuestReg, dst: VarId) {
        self.push(IrOp::LoadGpr { reg, dst });
    }

    pub fn store_gpr(&mut self, reg: IrGuestReg, src: impl Into<IrValue>) {
        self.push(IrOp::StoreGpr {
            reg,
            src: src.into(),
        });
    }

    pub fn load_cpsr(&mut self, dst: VarId) {
        self.push(IrOp::LoadCpsr { dst });
    }

    pub fn store_cpsr(&mut self, src: impl Into<IrValue>) {
        self.push(IrOp::StoreCpsr { src: src.into() });
    }

    pub fn mov(&mut self, dst: VarId, src: impl Into<IrValue>, set_flags: bool) {
        self.push(IrOp::Mov {
            dst,
            src: src.into(),
            set_flags,
        });
    }

    pub fn add(
        &mut self,
        dst: VarId,
        lhs: impl Into<IrValue>,
        rhs: impl Into<IrValue>,
        set_flags: bool,
    ) {
        self.push(IrOp::Add {
            dst,
            lhs: lhs.into(),
            rhs: rhs.into(),
            set_flags,
        });
    }

    pub fn sub(
        &mut self,
        dst: VarId,
        lhs: impl Into<IrValue>,
        rhs: impl Into<IrValue>,
        set_flags: bool,
    ) {
        self.push(IrOp::Sub {
            dst,
            lhs: lhs.into(),
            rhs: rhs.into(),
            set_flags,
        });
    }

    /// Emit the shift opcode selected by `ty`.
    pub fn shift(
        &mut self,
        ty: ShiftType,
        dst: VarId,
        src: impl Into<IrValue>,
        amount: impl Into<IrValue>,
        set_flags: bool,
    ) {
        let src = src.into();
        let amount = amount.into();
        self.push(match ty {
            ShiftType::Lsl => IrOp::Lsl {
                dst,
                src,
                amount,
                set_flags,
            },
            ShiftType::Lsr => IrOp::Lsr {
                dst,
                src,
                amount,
                set_flags,
            },
            ShiftType::Asr => IrOp::Asr {
                dst,
                src,
                amount,
                set_flags,
            },
            ShiftType::Ror => IrOp::Ror {
                dst,
                src,
                amount,
                set_flags,
            },
        });
    }

    pub fn ldr(&mut self, size: TransferSize, rotate: bool, dst: VarId, addr: VarId) {
        self.push(IrOp::Ldr {
            size,
            rotate,
            dst,
            addr,
        });
    }

    pub fn str(&mut self, size: TransferSize, src: VarId, addr: VarId) {
        self.push(IrOp::Str { size, src, addr });
    }

    pub fn update_nzcv(&mut self, dst: VarId, src: impl Into<IrValue>) {
        self.push(IrOp::UpdateNzcv {
            dst,
            src: src.into(),
        });
    }

    pub fn advance_pc(&mut self, pc: u32) {
        self.push(IrOp::AdvancePc { pc });
    }

    pub fn flush(&mut self) {
        self.push(IrOp::Flush);
    }

    pub fn flush_exchange(&mut self, addr: VarId) {
        self.push(IrOp::FlushExchange { addr });
    }

    /// Panic unless every variable is written by at most one opcode.
    #[cfg(test)]
    pub(crate) fn assert_ssa(&self) {
        for (id, var) in self.vars() {
            let writers = self.code.iter().filter(|op| op.writes(id)).count();
            assert!(
                writers <= 1,
                "v{} ({}) written by {} opcodes",
                id.index(),
                var.tag,
                writers
            );
        }
    }
}

impl Default for MicroBlock {
    fn default() -> MicroBlock {
        MicroBlock::new()
    }
}

// ─── Listings ───────────────────────────────────────────────────────────────

impl fmt::Display for IrOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn s(set_flags: bool) -> &'static str {
            if set_flags {
                ".s"
            } else {
                ""
            }
        }
        match self {
            IrOp::LoadGpr { reg, dst } => write!(f, "v{} = gpr {reg}", dst.index()),
            IrOp::StoreGpr { reg, src } => write!(f, "gpr {reg} = {src}"),
            IrOp::LoadCpsr { dst } => write!(f, "v{} = cpsr", dst.index()),
            IrOp::StoreCpsr { src } => write!(f, "cpsr = {src}"),
            IrOp::Mov {
                dst,
                src,
                set_flags,
            } => write!(f, "v{} = mov{} {src}", dst.index(), s(*set_flags)),
            IrOp::Add {
                dst,
                lhs,
                rhs,
                set_flags,
            } => write!(f, "v{} = add{} {lhs}, {rhs}", dst.index(), s(*set_flags)),
            IrOp::Sub {
                dst,
                lhs,
                rhs,
                set_flags,
            } => write!(f, "v{} = sub{} {lhs}, {rhs}", dst.index(), s(*set_flags)),
            IrOp::Lsl {
                dst,
                src,
                amount,
                set_flags,
            } => write!(f, "v{} = lsl{} {src}, {amount}", dst.index(), s(*set_flags)),
            IrOp::Lsr {
                dst,
                src,
                amount,
                set_flags,
            } => write!(f, "v{} = lsr{} {src}, {amount}", dst.index(), s(*set_flags)),
            IrOp::Asr {
                dst,
                src,
                amount,
                set_flags,
            } => write!(f, "v{} = asr{} {src}, {amount}", dst.index(), s(*set_flags)),
            IrOp::Ror {
                dst,
                src,
                amount,
                set_flags,
            } => write!(f, "v{} = ror{} {src}, {amount}", dst.index(), s(*set_flags)),
            IrOp::Ldr {
                size,
                rotate,
                dst,
                addr,
            } => {
                let suffix = match (size, rotate) {
                    (TransferSize::Byte, _) => "b",
                    (TransferSize::Word, false) => "w",
                    (TransferSize::Word, true) => "w.ror",
                };
                write!(f, "v{} = ldr.{suffix} [v{}]", dst.index(), addr.index())
            }
            IrOp::Str { size, src, addr } => {
                let suffix = match size {
                    TransferSize::Byte => "b",
                    TransferSize::Word => "w",
                };
                write!(f, "str.{suffix} [v{}], v{}", addr.index(), src.index())
            }
            IrOp::UpdateNzcv { dst, src } => write!(f, "v{} = nzcv {src}", dst.index()),
            IrOp::AdvancePc { pc } => write!(f, "pc = {pc:#010x}"),
            IrOp::Flush => write!(f, "flush"),
            IrOp::FlushExchange { addr } => write!(f, "flush.bx v{}", addr.index()),
        }
    }
}

impl fmt::Display for MicroBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, op) in self.code.iter().enumerate() {
            writeln!(f, "{i:>3}: {op}")?;
        }
        Ok(())
    }
}
