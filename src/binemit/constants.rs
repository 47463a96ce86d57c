//! Lowering of the graph's constant pool into the code image.
//!
//! Each distinct 64-bit pattern gets one dynamic label; inserting the same
//! bits twice hands back the existing label, so deduplication is bit-exact.
//! The pool body is embedded 32-byte aligned after the function and every
//! load resolves RIP-relative through its label, which also means a packed
//! kernel can broadcast from the same 8-byte entry a scalar kernel loads.

use crate::ir::{Graph, NodeId, Opcode};
use crate::isa::Assembler;
use crate::result::{CodegenError, CodegenResult};
use dynasm::dynasm;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi};
use std::collections::HashMap;

/// Where one constant node's value lives in the pool.
#[derive(Copy, Clone)]
pub struct PoolEntry {
    /// Label of the 8-byte pool slot.
    pub label: DynamicLabel,
    /// The constant's value.
    pub value: f64,
}

/// The lowered constant pool for one compilation.
pub struct ConstantPool {
    entries: HashMap<NodeId, PoolEntry>,
    unique: Vec<(u64, DynamicLabel)>,
}

impl ConstantPool {
    /// Collect every live constant node of `graph`, deduplicate, and create
    /// the labels their loads will reference. Rejects constant nodes whose
    /// immediate indexes outside the graph's pool.
    pub fn build(graph: &Graph, ops: &mut Assembler) -> CodegenResult<Self> {
        let mut by_bits: HashMap<u64, DynamicLabel> = HashMap::new();
        let mut unique = Vec::new();
        let mut entries = HashMap::new();

        for (i, node) in graph.nodes.iter().enumerate() {
            if node.is_dead || node.op != Opcode::Constant {
                continue;
            }
            let index = node.imm as usize;
            let value = *graph.const_pool.get(index).ok_or_else(|| {
                CodegenError::Structural(format!(
                    "node {} references constant pool entry {} of {}",
                    i,
                    index,
                    graph.const_pool.len()
                ))
            })?;
            let bits = value.to_bits();
            let label = *by_bits.entry(bits).or_insert_with(|| {
                let label = ops.new_dynamic_label();
                unique.push((bits, label));
                label
            });
            entries.insert(i as NodeId, PoolEntry { label, value });
        }

        Ok(Self { entries, unique })
    }

    /// The pool entry for a constant node, if it has one.
    pub fn entry(&self, node: NodeId) -> Option<&PoolEntry> {
        self.entries.get(&node)
    }

    /// Number of distinct constants in the pool.
    pub fn len(&self) -> usize {
        self.unique.len()
    }

    /// True if no constants were collected.
    pub fn is_empty(&self) -> bool {
        self.unique.is_empty()
    }

    /// Size of the embedded pool body in bytes.
    pub fn byte_size(&self) -> usize {
        self.unique.len() * 8
    }

    /// Emit the pool body at the current position, binding every label.
    /// Called after the epilogue so the data sits past the function.
    pub fn embed(&self, ops: &mut Assembler) {
        if self.unique.is_empty() {
            return;
        }
        dynasm!(ops ; .arch x64 ; .align 32);
        for &(bits, label) in &self.unique {
            dynasm!(ops
                ; .arch x64
                ; =>label
                ; .i64 bits as i64
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_values_share_a_slot() {
        let mut g = Graph::new();
        g.add_constant(1.5);
        g.add_constant(2.5);
        g.add_constant(1.5);
        let mut ops = Assembler::new().unwrap();
        let pool = ConstantPool::build(&g, &mut ops).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.byte_size(), 16);
    }

    #[test]
    fn negative_zero_is_distinct_from_zero() {
        let mut g = Graph::new();
        g.add_constant(0.0);
        g.add_constant(-0.0);
        let mut ops = Assembler::new().unwrap();
        let pool = ConstantPool::build(&g, &mut ops).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn dead_constants_are_skipped() {
        let mut g = Graph::new();
        let c = g.add_constant(4.0);
        g.nodes[c as usize].is_dead = true;
        let mut ops = Assembler::new().unwrap();
        let pool = ConstantPool::build(&g, &mut ops).unwrap();
        assert!(pool.is_empty());
        assert!(pool.entry(c).is_none());
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut g = Graph::new();
        let mut node = crate::ir::Node::new(Opcode::Constant);
        node.imm = 9.0;
        g.push(node);
        let mut ops = Assembler::new().unwrap();
        assert!(ConstantPool::build(&g, &mut ops).is_err());
    }

    #[test]
    fn embedding_appends_aligned_data() {
        let mut g = Graph::new();
        g.add_constant(3.25);
        let mut ops = Assembler::new().unwrap();
        let pool = ConstantPool::build(&g, &mut ops).unwrap();
        pool.embed(&mut ops);
        let buf = ops.finalize().ok().unwrap();
        assert!(buf.len() >= 8);
        // The value must appear somewhere in the image, 8-byte aligned.
        let bytes = 3.25f64.to_bits().to_le_bytes();
        let found = buf
            .chunks_exact(8)
            .any(|chunk| chunk == bytes);
        assert!(found);
    }
}
