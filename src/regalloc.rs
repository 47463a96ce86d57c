//! Register allocation for the emitters.
//!
//! The emitters work against a fixed file of 16 vector registers. Each slot
//! tracks which node's value it currently holds, whether it is pinned by the
//! instruction currently being expanded, whether its contents would need a
//! write-back on eviction, and a usage counter for least-recently-used
//! eviction. Slots can be blacklisted, which removes them from allocation
//! entirely; the backends use this to reserve a private scratch register.
//!
//! Because every computed node is written back to the value buffer
//! immediately, register contents can be discarded at any point without
//! affecting correctness. The dirty bit exists for completeness and for the
//! flush path in `ensure_in_register`; the emitters never actually leave a
//! register dirty.

use crate::ir::NodeId;
use crate::result::{CodegenError, CodegenResult};
use core::ops::Range;

/// Number of slots in the vector register file.
pub const NUM_REGS: usize = 16;

/// State of the vector register file during one compilation.
pub struct RegisterFile {
    contents: [Option<NodeId>; NUM_REGS],
    locked: [bool; NUM_REGS],
    dirty: [bool; NUM_REGS],
    blacklisted: [bool; NUM_REGS],
    usage: [u64; NUM_REGS],
    counter: u64,
    volatile_range: Range<usize>,
}

impl RegisterFile {
    /// Create an empty register file. `volatile_range` is the span of slots
    /// the platform ABI treats as caller-saved across external calls.
    pub fn new(volatile_range: Range<usize>) -> Self {
        Self {
            contents: [None; NUM_REGS],
            locked: [false; NUM_REGS],
            dirty: [false; NUM_REGS],
            blacklisted: [false; NUM_REGS],
            usage: [0; NUM_REGS],
            counter: 0,
            volatile_range,
        }
    }

    /// Forget all contents, locks, and dirty bits. Blacklist bits survive.
    pub fn clear(&mut self) {
        self.contents = [None; NUM_REGS];
        self.locked = [false; NUM_REGS];
        self.dirty = [false; NUM_REGS];
        self.usage = [0; NUM_REGS];
        self.counter = 0;
    }

    /// Linear scan for the slot currently holding `node`.
    pub fn find(&self, node: NodeId) -> Option<u8> {
        self.contents
            .iter()
            .position(|&c| c == Some(node))
            .map(|i| i as u8)
    }

    /// Pick a slot for a new value, avoiding the given slots.
    ///
    /// Prefers an empty, unlocked, non-blacklisted slot; otherwise evicts
    /// the least recently used unlocked slot. If nothing can be found while
    /// honoring the avoid list, the avoid list is dropped and the search
    /// repeated. The returned slot keeps its previous contents and dirty
    /// bit; the caller decides whether a flush is needed before reuse.
    pub fn allocate(&mut self, avoid: &[u8]) -> CodegenResult<u8> {
        if let Some(slot) = self.pick(avoid) {
            return Ok(slot);
        }
        if !avoid.is_empty() {
            if let Some(slot) = self.pick(&[]) {
                return Ok(slot);
            }
        }
        Err(CodegenError::Allocator)
    }

    fn pick(&mut self, avoid: &[u8]) -> Option<u8> {
        let usable = |i: usize| {
            !self.locked[i] && !self.blacklisted[i] && !avoid.contains(&(i as u8))
        };
        for i in 0..NUM_REGS {
            if self.contents[i].is_none() && usable(i) {
                self.counter += 1;
                self.usage[i] = self.counter;
                return Some(i as u8);
            }
        }
        let lru = (0..NUM_REGS)
            .filter(|&i| usable(i))
            .min_by_key(|&i| self.usage[i])?;
        self.counter += 1;
        self.usage[lru] = self.counter;
        Some(lru as u8)
    }

    /// Record that `slot` now holds `node`.
    pub fn set(&mut self, slot: u8, node: NodeId, dirty: bool) {
        let i = slot as usize;
        self.contents[i] = Some(node);
        self.dirty[i] = dirty;
        self.counter += 1;
        self.usage[i] = self.counter;
    }

    /// Forget the contents of `slot` without touching its lock bit.
    pub fn evict(&mut self, slot: u8) {
        let i = slot as usize;
        self.contents[i] = None;
        self.dirty[i] = false;
    }

    /// The node currently held by `slot`, if any.
    pub fn node_in(&self, slot: u8) -> Option<NodeId> {
        self.contents[slot as usize]
    }

    /// Bump the LRU counter of a slot that was just used.
    pub fn touch(&mut self, slot: u8) {
        self.counter += 1;
        self.usage[slot as usize] = self.counter;
    }

    /// Pin a slot for the duration of the current instruction expansion.
    pub fn lock(&mut self, slot: u8) {
        self.locked[slot as usize] = true;
    }

    /// Release a pinned slot.
    pub fn unlock(&mut self, slot: u8) {
        self.locked[slot as usize] = false;
    }

    /// Whether the slot is currently pinned.
    pub fn is_locked(&self, slot: u8) -> bool {
        self.locked[slot as usize]
    }

    /// Mark the slot as needing a write-back before eviction.
    pub fn mark_dirty(&mut self, slot: u8) {
        self.dirty[slot as usize] = true;
    }

    /// Mark the slot as matching the value buffer.
    pub fn mark_clean(&mut self, slot: u8) {
        self.dirty[slot as usize] = false;
    }

    /// Whether the slot would need a write-back on eviction.
    pub fn is_dirty(&self, slot: u8) -> bool {
        self.dirty[slot as usize]
    }

    /// Permanently remove a slot from allocation. Any tracked contents are
    /// dropped.
    pub fn blacklist(&mut self, slot: u8) {
        let i = slot as usize;
        self.blacklisted[i] = true;
        self.contents[i] = None;
        self.dirty[i] = false;
        self.usage[i] = 0;
    }

    /// Whether the slot is blacklisted.
    pub fn is_blacklisted(&self, slot: u8) -> bool {
        self.blacklisted[slot as usize]
    }

    /// Forget the contents of every slot in the ABI volatile range. Called
    /// after every external math callout; the callee may have clobbered any
    /// of them.
    pub fn invalidate_volatile(&mut self) {
        for i in self.volatile_range.clone() {
            if i < NUM_REGS {
                self.contents[i] = None;
                self.dirty[i] = false;
                self.usage[i] = 0;
            }
        }
    }
}
