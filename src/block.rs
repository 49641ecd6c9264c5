//! Basic blocks, block keys and the block cache.

use dynasmrt::ExecutableBuffer;

use crate::guest::{Gpr, Mode};
use crate::ir::MicroBlock;
use crate::state::State;

/// Compact digest of the guest state bits that determine how code at the
/// current PC decodes and executes. Compared as an opaque 64-bit word.
///
/// Layout: `(address >> 1) << 6 | thumb << 5 | mode`. The low address bit
/// is always zero (Thumb code is halfword-aligned), so dropping it keeps
/// the key dense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey(u64);

impl BlockKey {
    /// Digest the current state. The stored PC is the fetch-ahead value,
    /// so the block's first instruction sits two opcodes back.
    pub fn from_state(state: &State) -> BlockKey {
        let cpsr = state.cpsr();
        let opcode_size: u32 = if cpsr.thumb() { 2 } else { 4 };
        let address = state
            .gpr(cpsr.mode(), Gpr::PC)
            .wrapping_sub(opcode_size * 2);
        BlockKey::new(address, cpsr.thumb(), cpsr.mode())
    }

    pub fn new(address: u32, thumb: bool, mode: Mode) -> BlockKey {
        BlockKey((u64::from(address >> 1) << 6) | (u64::from(thumb) << 5) | u64::from(mode.bits()))
    }

    /// Address of the block's first instruction.
    pub fn address(self) -> u32 {
        ((self.0 >> 6) << 1) as u32
    }

    pub fn thumb(self) -> bool {
        self.0 & (1 << 5) != 0
    }

    /// Reserved mode patterns cannot be encoded, so this is total.
    pub fn mode(self) -> Mode {
        Mode::from_bits(self.0 as u32).unwrap_or(Mode::System)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// A compiled straight-line guest code region.
#[derive(Debug)]
pub struct BasicBlock {
    pub key: BlockKey,
    pub micro_blocks: Vec<MicroBlock>,
    /// Guest cycles one execution consumes: translated instructions plus
    /// their data cycles.
    pub length: u32,
    /// Cleared when the block ends in a side effect that might reenter
    /// the dispatcher (a possible HALT-control write). The block is still
    /// cached; the flag only vetoes dispatch shortcuts.
    pub enable_fast_dispatch: bool,
    compiled: Option<CompiledCode>,
}

/// The executable form of a block: the sealed buffer plus its entry.
#[derive(Debug)]
struct CompiledCode {
    buffer: ExecutableBuffer,
    function: unsafe extern "C" fn(),
}

impl BasicBlock {
    pub fn new(key: BlockKey) -> BasicBlock {
        BasicBlock {
            key,
            micro_blocks: Vec::new(),
            length: 0,
            enable_fast_dispatch: true,
            compiled: None,
        }
    }

    pub(crate) fn set_compiled(&mut self, buffer: ExecutableBuffer, function: unsafe extern "C" fn()) {
        self.compiled = Some(CompiledCode { buffer, function });
    }

    /// Entry point of the compiled code, once the backend ran.
    pub fn function(&self) -> Option<unsafe extern "C" fn()> {
        self.compiled.as_ref().map(|code| code.function)
    }

    /// The emitted host bytes, for inspection.
    pub fn code(&self) -> Option<&[u8]> {
        self.compiled.as_ref().map(|code| &code.buffer[..])
    }
}

// ─── Block cache ────────────────────────────────────────────────────────────

const OUTER_BITS: u32 = 18;
const INNER_BITS: u32 = 19;
const OUTER_LEN: usize = 1 << OUTER_BITS;
const INNER_LEN: usize = 1 << INNER_BITS;
const INNER_MASK: u64 = (1 << INNER_BITS) - 1;

/// Two-level sparse table over block keys: the top bits index the outer
/// table, the low bits a lazily allocated inner one. Lookup is two
/// indirections; eviction is a coarse full flush.
pub struct BlockCache {
    tables: Vec<Option<Box<InnerTable>>>,
}

struct InnerTable {
    blocks: Vec<Option<Box<BasicBlock>>>,
}

impl BlockCache {
    pub fn new() -> BlockCache {
        BlockCache {
            tables: std::iter::repeat_with(|| None).take(OUTER_LEN).collect(),
        }
    }

    pub fn get(&self, key: BlockKey) -> Option<&BasicBlock> {
        let table = self.tables[(key.value() >> INNER_BITS) as usize].as_ref()?;
        table.blocks[(key.value() & INNER_MASK) as usize].as_deref()
    }

    pub fn insert(&mut self, key: BlockKey, block: Box<BasicBlock>) {
        let table = self.tables[(key.value() >> INNER_BITS) as usize].get_or_insert_with(|| {
            Box::new(InnerTable {
                blocks: std::iter::repeat_with(|| None).take(INNER_LEN).collect(),
            })
        });
        table.blocks[(key.value() & INNER_MASK) as usize] = Some(block);
    }

    /// Drop every compiled block. Used when guest code may have changed.
    pub fn flush(&mut self) {
        for table in &mut self.tables {
            *table = None;
        }
    }
}

impl Default for BlockCache {
    fn default() -> BlockCache {
        BlockCache::new()
    }
}
