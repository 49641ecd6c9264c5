//! Linear-scan register allocation over a single micro-block.
//!
//! Liveness is a single expiration point per variable: the last opcode
//! index that reads or writes it. Allocation walks the block in order,
//! recycling registers whose variable expired strictly before the current
//! location. There is no spilling; running out of registers fails the
//! block's compilation.

use crate::ir::{MicroBlock, VarId};

/// An x86-64 register, by hardware encoding. The encoding is what dynasm
/// dynamic register operands consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostReg(u8);

pub const RAX: HostReg = HostReg(0);
pub const RCX: HostReg = HostReg(1);
pub const RDX: HostReg = HostReg(2);
pub const RBX: HostReg = HostReg(3);
pub const RSP: HostReg = HostReg(4);
pub const RBP: HostReg = HostReg(5);
pub const RSI: HostReg = HostReg(6);
pub const RDI: HostReg = HostReg(7);
pub const R8: HostReg = HostReg(8);
pub const R9: HostReg = HostReg(9);
pub const R10: HostReg = HostReg(10);
pub const R11: HostReg = HostReg(11);
pub const R12: HostReg = HostReg(12);
pub const R13: HostReg = HostReg(13);
pub const R14: HostReg = HostReg(14);
pub const R15: HostReg = HostReg(15);

/// Registers the allocator may hand out. rax (scratch and flag capture),
/// rcx (shift counts), rsp and r15 (guest state base) are reserved by the
/// emitter and must never appear here.
///
/// The free list pops from the end, so the callee-saved registers at the
/// tail are handed out first and short blocks avoid save/restore traffic
/// around memory calls. The ordering is deterministic but not contractual.
pub const ALLOCATABLE: [HostReg; 12] = [
    R11, R10, R9, R8, RDI, RSI, RDX, RBP, R14, R13, R12, RBX,
];

/// Registers an `extern "C"` call may clobber, among the allocatable set.
pub const CALLER_SAVED: [HostReg; 7] = [RDX, RSI, RDI, R8, R9, R10, R11];

impl HostReg {
    pub fn code(self) -> u8 {
        self.0
    }

    pub fn is_caller_saved(self) -> bool {
        CALLER_SAVED.contains(&self)
    }
}

/// The free list ran dry: more variables are simultaneously live than
/// there are allocatable host registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

pub struct RegisterAllocator {
    /// Last opcode index touching each variable; `None` means the
    /// variable is never used and is not allocated.
    expiry: Vec<Option<usize>>,
    allocation: Vec<Option<HostReg>>,
    free_list: Vec<HostReg>,
}

impl RegisterAllocator {
    pub fn new(micro_block: &MicroBlock) -> RegisterAllocator {
        let mut expiry = vec![None; micro_block.var_count()];
        for (location, op) in micro_block.code().iter().enumerate() {
            if let Some(dst) = op.written_var() {
                expiry[dst.index()] = Some(location);
            }
            for var in op.read_vars() {
                expiry[var.index()] = Some(location);
            }
        }
        RegisterAllocator {
            allocation: vec![None; expiry.len()],
            expiry,
            free_list: ALLOCATABLE.to_vec(),
        }
    }

    /// The register holding `var` at opcode index `location`, allocating
    /// on first use. Expired variables are recycled first, so a register
    /// is reused at the earliest legal point.
    pub fn get_reg(&mut self, var: VarId, location: usize) -> Result<HostReg, Exhausted> {
        if let Some(reg) = self.allocation[var.index()] {
            return Ok(reg);
        }
        self.expire(location);
        let reg = self.free_list.pop().ok_or(Exhausted)?;
        self.allocation[var.index()] = Some(reg);
        Ok(reg)
    }

    fn expire(&mut self, location: usize) {
        for index in 0..self.allocation.len() {
            let Some(reg) = self.allocation[index] else {
                continue;
            };
            let expired = match self.expiry[index] {
                Some(last) => last < location,
                None => true,
            };
            if expired {
                self.free_list.push(reg);
                self.allocation[index] = None;
            }
        }
    }

    /// Registers currently bound to variables, ascending by encoding.
    /// The emitter saves the caller-saved subset around memory calls.
    pub fn live_regs(&self) -> Vec<HostReg> {
        let mut regs: Vec<HostReg> = self.allocation.iter().flatten().copied().collect();
        regs.sort_by_key(|reg| reg.code());
        regs
    }

    #[cfg(test)]
    fn expiry_of(&self, var: VarId) -> Option<usize> {
        self.expiry[var.index()]
    }
}
