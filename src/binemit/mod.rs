//! Binary emission: shared context plus the forward and reverse emitters.

pub mod constants;
pub mod forward;
pub mod reverse;

use crate::ir::{Graph, NodeId, Opcode};
use crate::isa::{Assembler, VectorIsa};
use crate::regalloc::RegisterFile;
use crate::result::{CodegenError, CodegenResult};
use crate::runtime::TraceRing;
use std::collections::HashSet;

use self::constants::ConstantPool;

/// State shared by both emission passes over one compilation.
pub struct EmitContext<'a> {
    /// The assembler the function body is emitted into.
    pub ops: &'a mut Assembler,
    /// The instruction-set backend.
    pub isa: &'a dyn VectorIsa,
    /// Vector register file state.
    pub regs: &'a mut RegisterFile,
    /// Lowered constant pool.
    pub pool: &'a ConstantPool,
    /// The optimized graph being compiled.
    pub graph: &'a Graph,
    /// Constants that have already been stored to their value-buffer slot.
    /// Later uses load from the buffer like any other node.
    pub processed_constants: HashSet<NodeId>,
    /// Trace ring address when runtime tracing is enabled.
    pub trace: Option<*mut TraceRing>,
}

impl<'a> EmitContext<'a> {
    /// Create a context for one compilation.
    pub fn new(
        ops: &'a mut Assembler,
        isa: &'a dyn VectorIsa,
        regs: &'a mut RegisterFile,
        pool: &'a ConstantPool,
        graph: &'a Graph,
        trace: Option<*mut TraceRing>,
    ) -> Self {
        Self {
            ops,
            isa,
            regs,
            pool,
            graph,
            processed_constants: HashSet::new(),
            trace,
        }
    }

    /// Make sure `node`'s value is in a register and return its slot.
    ///
    /// If the node is already tracked, that slot is returned. Otherwise a
    /// slot is allocated (honoring `avoid`), flushed if it held an
    /// unwritten value, and loaded: from the constant pool on a constant's
    /// first touch (with a store so later uses read from memory), from the
    /// value buffer in every other case.
    pub fn ensure_in_register(&mut self, node: NodeId, avoid: &[u8]) -> CodegenResult<u8> {
        if let Some(slot) = self.regs.find(node) {
            self.regs.touch(slot);
            return Ok(slot);
        }
        let slot = self.allocate_flushed(avoid)?;
        let is_fresh_constant = self.graph.node(node).op == Opcode::Constant
            && !self.processed_constants.contains(&node);
        if is_fresh_constant {
            let entry = self.pool.entry(node).ok_or_else(|| {
                CodegenError::Structural(format!("constant node {} missing from pool", node))
            })?;
            // Bit compare: -0.0 must not take the xor fast path, it would
            // come back as +0.0.
            if entry.value.to_bits() == 0 {
                self.isa.emit_zero(self.ops, slot);
            } else {
                self.isa.emit_load_const(self.ops, slot, entry.label);
            }
            self.isa.emit_store_value(self.ops, slot, node);
            self.processed_constants.insert(node);
        } else {
            self.isa.emit_load_value(self.ops, slot, node);
        }
        self.regs.set(slot, node, false);
        Ok(slot)
    }

    /// Allocate a destination slot without loading anything into it.
    pub fn alloc_dst(&mut self, avoid: &[u8]) -> CodegenResult<u8> {
        let slot = self.allocate_flushed(avoid)?;
        self.regs.evict(slot);
        Ok(slot)
    }

    /// Allocate a locked anonymous temporary. The caller must pair it with
    /// [`release_temp`](Self::release_temp); the slot is never tracked as
    /// holding a node.
    pub fn alloc_temp(&mut self, avoid: &[u8]) -> CodegenResult<u8> {
        let slot = self.alloc_dst(avoid)?;
        self.regs.lock(slot);
        Ok(slot)
    }

    /// Unlock and forget an anonymous temporary.
    pub fn release_temp(&mut self, slot: u8) {
        self.regs.unlock(slot);
        self.regs.evict(slot);
    }

    /// Record that `slot` now holds `node` and write it through to the
    /// value buffer. Every node result goes through here, which is what
    /// lets the allocator discard register contents at any point.
    pub fn finish_node(&mut self, slot: u8, node: NodeId) {
        self.regs.set(slot, node, false);
        self.isa.emit_store_value(self.ops, slot, node);
        if let Some(ring) = self.trace {
            self.isa.emit_trace(self.ops, ring, node, slot);
        }
    }

    fn allocate_flushed(&mut self, avoid: &[u8]) -> CodegenResult<u8> {
        let slot = self.regs.allocate(avoid)?;
        if self.regs.is_dirty(slot) {
            if let Some(old) = self.regs.node_in(slot) {
                self.isa.emit_store_value(self.ops, slot, old);
            }
            self.regs.mark_clean(slot);
        }
        Ok(slot)
    }
}
