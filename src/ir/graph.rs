//! The computation graph: a tape of nodes plus a constant pool.
//!
//! Node references are `u32` indices into the owning graph rather than Rust
//! references. This keeps the in-memory representation compact and makes the
//! acyclicity invariant purely positional: every operand id is strictly less
//! than the id of the node using it.
//!
//! Transformation passes never mutate a graph in place. They produce a new
//! graph together with a remap table from old ids to new ids, so the mapping
//! from caller-visible ids to post-optimization ids stays explicit. Nodes
//! eliminated by a pass keep their slot with `is_dead` set, which preserves
//! the indices of everything downstream.

use crate::ir::Opcode;
use crate::result::{CodegenError, CodegenResult};
use core::fmt;

/// A node index. Stable for the lifetime of the owning graph.
pub type NodeId = u32;

/// Sentinel for an absent operand or a node eliminated in a remap.
pub const NO_NODE: NodeId = u32::MAX;

/// A single operation record.
#[derive(Copy, Clone, Debug)]
pub struct Node {
    /// Operation kind.
    pub op: Opcode,
    /// Self id, assigned on insertion. Stable identity during rewrites.
    pub dst: NodeId,
    /// First operand, or `NO_NODE`.
    pub a: NodeId,
    /// Second operand, or `NO_NODE`.
    pub b: NodeId,
    /// Third operand, or `NO_NODE`.
    pub c: NodeId,
    /// Reserved bit flags.
    pub flags: u32,
    /// Immediate. Pool index for `Constant`, literal value for
    /// `BoolConstant` and `IntConstant`, unused otherwise.
    pub imm: f64,
    /// Depends transitively on a runtime `Input`.
    pub is_active: bool,
    /// Eliminated by a pass; the slot is retained to keep ids stable.
    pub is_dead: bool,
    /// On the reverse-propagation frontier of a differentiation input.
    pub needs_gradient: bool,
}

impl Node {
    /// Create a node with no operands. Flags default to inactive and alive.
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            dst: NO_NODE,
            a: NO_NODE,
            b: NO_NODE,
            c: NO_NODE,
            flags: 0,
            imm: 0.0,
            is_active: false,
            is_dead: false,
            needs_gradient: false,
        }
    }

    /// Create a unary node.
    pub fn unary(op: Opcode, a: NodeId) -> Self {
        let mut n = Self::new(op);
        n.a = a;
        n
    }

    /// Create a binary node.
    pub fn binary(op: Opcode, a: NodeId, b: NodeId) -> Self {
        let mut n = Self::new(op);
        n.a = a;
        n.b = b;
        n
    }

    /// Create a ternary node.
    pub fn ternary(op: Opcode, a: NodeId, b: NodeId, c: NodeId) -> Self {
        let mut n = Self::new(op);
        n.a = a;
        n.b = b;
        n.c = c;
        n
    }

    /// The operand ids that are actually present, in order.
    pub fn operands(&self) -> impl Iterator<Item = NodeId> {
        [self.a, self.b, self.c]
            .into_iter()
            .filter(|&id| id != NO_NODE)
    }
}

/// A computation graph: an ordered node tape, a constant pool, the set of
/// outputs the caller reads, and the set of inputs gradients are requested
/// for.
#[derive(Clone, Default)]
pub struct Graph {
    /// All nodes, in insertion order. Indices are stable ids.
    pub nodes: Vec<Node>,
    /// Pool of constant values referenced by `Constant` node immediates.
    pub const_pool: Vec<f64>,
    /// Ids of nodes whose final values the caller reads.
    pub outputs: Vec<NodeId>,
    /// Ids of input nodes for which gradients are requested.
    pub diff_inputs: Vec<NodeId>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes, dead slots included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Borrow a node by id.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    /// Append a node, assigning its id and deriving `is_active` from its
    /// operands when the opcode is not a placeholder.
    pub fn push(&mut self, mut node: Node) -> NodeId {
        let id = self.nodes.len() as NodeId;
        node.dst = id;
        if !node.op.is_placeholder() && node.op != Opcode::BoolConstant
            && node.op != Opcode::IntConstant
        {
            node.is_active = node
                .operands()
                .any(|op| self.nodes[op as usize].is_active);
        }
        self.nodes.push(node);
        id
    }

    /// Append a constant node backed by a fresh pool entry.
    pub fn add_constant(&mut self, value: f64) -> NodeId {
        let index = self.const_pool.len();
        self.const_pool.push(value);
        let mut node = Node::new(Opcode::Constant);
        node.imm = index as f64;
        node.is_active = false;
        self.push(node)
    }

    /// Append a runtime input node.
    pub fn add_input(&mut self) -> NodeId {
        let mut node = Node::new(Opcode::Input);
        node.is_active = true;
        self.push(node)
    }

    /// Append a unary operation.
    pub fn add_unary(&mut self, op: Opcode, a: NodeId) -> NodeId {
        self.push(Node::unary(op, a))
    }

    /// Append a binary operation.
    pub fn add_binary(&mut self, op: Opcode, a: NodeId, b: NodeId) -> NodeId {
        self.push(Node::binary(op, a, b))
    }

    /// Append a ternary operation.
    pub fn add_ternary(&mut self, op: Opcode, a: NodeId, b: NodeId, c: NodeId) -> NodeId {
        self.push(Node::ternary(op, a, b, c))
    }

    /// Mark a node as an output the caller will read back.
    pub fn mark_output(&mut self, id: NodeId) {
        self.outputs.push(id);
    }

    /// Mark an input node as a differentiation input.
    pub fn mark_diff_input(&mut self, id: NodeId) {
        self.diff_inputs.push(id);
    }

    /// Set `needs_gradient` on every node reachable forward from a
    /// differentiation input. See [`crate::analysis::propagate_gradients`].
    pub fn propagate_gradients(&mut self) {
        crate::analysis::propagate_gradients(self);
    }

    /// The value behind a node if it is a live `Constant` with a valid pool
    /// index.
    pub fn constant_value(&self, id: NodeId) -> Option<f64> {
        let node = self.nodes.get(id as usize)?;
        if node.op != Opcode::Constant || node.is_dead {
            return None;
        }
        self.const_pool.get(node.imm as usize).copied()
    }

    /// Check the structural invariants: operand ids strictly below the node
    /// id, arity conformance, constant pool indices in range, and outputs
    /// and differentiation inputs naming live nodes.
    pub fn validate(&self) -> CodegenResult<()> {
        for (i, node) in self.nodes.iter().enumerate() {
            let id = i as NodeId;
            let arity = node.op.arity();
            let ops = [node.a, node.b, node.c];
            for (slot, &op) in ops.iter().enumerate() {
                if slot < arity {
                    if op == NO_NODE {
                        return Err(CodegenError::Structural(format!(
                            "node {} ({}) is missing operand {}",
                            id, node.op, slot
                        )));
                    }
                    if op >= id {
                        return Err(CodegenError::Structural(format!(
                            "node {} ({}) refers forward to node {}",
                            id, node.op, op
                        )));
                    }
                } else if op != NO_NODE {
                    return Err(CodegenError::Structural(format!(
                        "node {} ({}) has a spurious operand {}",
                        id, node.op, slot
                    )));
                }
            }
            if node.op == Opcode::Constant {
                let index = node.imm as usize;
                if index >= self.const_pool.len() {
                    return Err(CodegenError::Structural(format!(
                        "node {} references constant pool entry {} of {}",
                        id,
                        index,
                        self.const_pool.len()
                    )));
                }
            }
        }
        for &out in &self.outputs {
            match self.nodes.get(out as usize) {
                Some(node) if !node.is_dead => {}
                _ => {
                    return Err(CodegenError::Structural(format!(
                        "output names unknown or dead node {}",
                        out
                    )))
                }
            }
        }
        for &di in &self.diff_inputs {
            match self.nodes.get(di as usize) {
                Some(node) if !node.is_dead => {}
                _ => {
                    return Err(CodegenError::Structural(format!(
                        "differentiation input names unknown or dead node {}",
                        di
                    )))
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, node) in self.nodes.iter().enumerate() {
            write!(f, "n{}: {}", i, node.op)?;
            for op in node.operands() {
                write!(f, " n{}", op)?;
            }
            if node.op == Opcode::Constant {
                if let Some(v) = self.constant_value(i as NodeId) {
                    write!(f, " = {}", v)?;
                }
            } else if node.op == Opcode::BoolConstant || node.op == Opcode::IntConstant {
                write!(f, " = {}", node.imm)?;
            }
            if node.is_dead {
                write!(f, " [dead]")?;
            }
            if node.needs_gradient {
                write!(f, " [grad]")?;
            }
            writeln!(f)?;
        }
        writeln!(f, "outputs: {:?}", self.outputs)?;
        write!(f, "diff inputs: {:?}", self.diff_inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_is_derived_from_operands() {
        let mut g = Graph::new();
        let x = g.add_input();
        let c = g.add_constant(2.0);
        let m = g.add_binary(Opcode::Mul, x, c);
        let cc = g.add_binary(Opcode::Add, c, c);
        assert!(g.node(x).is_active);
        assert!(!g.node(c).is_active);
        assert!(g.node(m).is_active);
        assert!(!g.node(cc).is_active);
    }

    #[test]
    fn validate_accepts_well_formed() {
        let mut g = Graph::new();
        let x = g.add_input();
        let y = g.add_unary(Opcode::Neg, x);
        g.mark_output(y);
        assert_eq!(g.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_forward_reference() {
        let mut g = Graph::new();
        g.add_input();
        g.nodes.push(Node::unary(Opcode::Neg, 7));
        assert!(matches!(
            g.validate(),
            Err(CodegenError::Structural(_))
        ));
    }

    #[test]
    fn validate_rejects_bad_constant_index() {
        let mut g = Graph::new();
        let mut node = Node::new(Opcode::Constant);
        node.imm = 3.0;
        g.push(node);
        assert!(matches!(g.validate(), Err(CodegenError::Structural(_))));
    }

    #[test]
    fn validate_rejects_spurious_operand() {
        let mut g = Graph::new();
        let x = g.add_input();
        let mut node = Node::unary(Opcode::Neg, x);
        node.b = x;
        g.push(node);
        assert!(matches!(g.validate(), Err(CodegenError::Structural(_))));
    }

    #[test]
    fn constant_value_reads_through_pool() {
        let mut g = Graph::new();
        let c = g.add_constant(6.5);
        assert_eq!(g.constant_value(c), Some(6.5));
        let x = g.add_input();
        assert_eq!(g.constant_value(x), None);
    }
}
