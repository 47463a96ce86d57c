//! Intermediate representation of a computation.
//!
//! The IR is a flat tape of operation records. Operand fields hold indices
//! into the owning graph's node list, never pointers, and every operand must
//! refer to an earlier node, so cycles are impossible by construction.

mod graph;
mod opcodes;

pub use self::graph::{Graph, Node, NodeId, NO_NODE};
pub use self::opcodes::{CondCode, Opcode};
