//! Rewriting of numerically fragile patterns into stable equivalents.
//!
//! The cleaner runs a single left-to-right pass over the source graph and
//! applies four rewrites:
//!
//! - `1 / exp(x)` becomes `exp(-x)`, avoiding overflow of the intermediate
//!   for large negative `x`.
//! - `exp(x) / exp(y)` becomes `exp(x - y)`.
//! - `log(exp(x))` collapses to `x`.
//! - `sqrt(x * x)` becomes `|x|`.
//!
//! Every rewrite consults operands through the in-progress remap, so earlier
//! rewrites compose with later ones. Nodes that match no pattern are copied
//! with their operands relocated; dead nodes are copied verbatim so that
//! slot positions stay stable.

use crate::ir::{Graph, Node, NodeId, Opcode, NO_NODE};

/// Output of the cleaner: the rewritten graph, the id remap from source ids
/// to rewritten ids, and the number of rewrites applied.
pub struct CleaningResult {
    /// The rewritten graph.
    pub graph: Graph,
    /// Source node id to rewritten node id.
    pub remap: Vec<NodeId>,
    /// How many fragile patterns were replaced.
    pub fixes: usize,
}

/// Tolerance when matching a literal constant operand such as the `1.0`
/// numerator of a reciprocal exponential.
const CONST_MATCH_EPS: f64 = 1e-15;

/// Apply the stability rewrites to `graph`. With `enabled` unset the graph
/// is passed through with an identity remap, which keeps the orchestrator's
/// phase sequence uniform.
pub fn clean(graph: &Graph, enabled: bool) -> CleaningResult {
    if !enabled {
        return CleaningResult {
            graph: graph.clone(),
            remap: (0..graph.len() as NodeId).collect(),
            fixes: 0,
        };
    }

    let mut out = Graph::new();
    out.const_pool = graph.const_pool.clone();
    let mut remap = vec![NO_NODE; graph.len()];
    let mut fixes = 0usize;

    let relocate = |remap: &[NodeId], id: NodeId| -> NodeId {
        if id == NO_NODE {
            NO_NODE
        } else {
            remap[id as usize]
        }
    };

    for old_id in 0..graph.len() {
        let node = &graph.nodes[old_id];

        let mut copy = *node;
        copy.a = relocate(&remap, node.a);
        copy.b = relocate(&remap, node.b);
        copy.c = relocate(&remap, node.c);

        if node.is_dead {
            remap[old_id] = push_preserving(&mut out, copy);
            continue;
        }

        match node.op {
            Opcode::Div => {
                if is_constant(graph, node.a, 1.0) && is_live_op(graph, node.b, Opcode::Exp) {
                    // 1 / exp(x) -> exp(-x)
                    let x = relocate(&remap, graph.node(node.b).a);
                    let exp = graph.node(node.b);
                    let mut neg = Node::unary(Opcode::Neg, x);
                    neg.needs_gradient = exp.needs_gradient;
                    let neg_id = out.push(neg);
                    copy.op = Opcode::Exp;
                    copy.a = neg_id;
                    copy.b = NO_NODE;
                    copy.c = NO_NODE;
                    fixes += 1;
                } else if is_live_op(graph, node.a, Opcode::Exp)
                    && is_live_op(graph, node.b, Opcode::Exp)
                {
                    // exp(x) / exp(y) -> exp(x - y)
                    let x = relocate(&remap, graph.node(node.a).a);
                    let y = relocate(&remap, graph.node(node.b).a);
                    let mut sub = Node::binary(Opcode::Sub, x, y);
                    sub.needs_gradient = graph.node(node.a).needs_gradient
                        || graph.node(node.b).needs_gradient;
                    let sub_id = out.push(sub);
                    copy.op = Opcode::Exp;
                    copy.a = sub_id;
                    copy.b = NO_NODE;
                    copy.c = NO_NODE;
                    fixes += 1;
                }
            }
            Opcode::Log => {
                if is_live_op(graph, node.a, Opcode::Exp) {
                    // log(exp(x)) -> x. No replacement node is needed; the
                    // log's id simply routes to x.
                    remap[old_id] = relocate(&remap, graph.node(node.a).a);
                    fixes += 1;
                    continue;
                }
            }
            Opcode::Sqrt => {
                if is_live_op(graph, node.a, Opcode::Mul) {
                    let mul = graph.node(node.a);
                    if mul.a == mul.b {
                        // sqrt(x * x) -> |x|
                        copy.op = Opcode::Abs;
                        copy.a = relocate(&remap, mul.a);
                        copy.b = NO_NODE;
                        copy.c = NO_NODE;
                        fixes += 1;
                    }
                }
            }
            _ => {}
        }

        remap[old_id] = out.push(copy);
    }

    for &out_id in &graph.outputs {
        let mapped = remap[out_id as usize];
        if mapped != NO_NODE {
            out.mark_output(mapped);
        }
    }
    for &di in &graph.diff_inputs {
        let mapped = remap[di as usize];
        if mapped != NO_NODE {
            out.mark_diff_input(mapped);
        }
    }

    log::debug!("stability cleaning applied {} rewrites", fixes);
    CleaningResult {
        graph: out,
        remap,
        fixes,
    }
}

/// Push a dead node without letting the builder rederive its activity; its
/// operands may have been relocated to nodes with different flags.
fn push_preserving(out: &mut Graph, node: Node) -> NodeId {
    let id = out.nodes.len() as NodeId;
    let mut node = node;
    node.dst = id;
    out.nodes.push(node);
    id
}

fn is_live_op(graph: &Graph, id: NodeId, op: Opcode) -> bool {
    (id as usize) < graph.len() && {
        let node = graph.node(id);
        node.op == op && !node.is_dead
    }
}

fn is_constant(graph: &Graph, id: NodeId, expected: f64) -> bool {
    match graph.constant_value(id) {
        Some(v) => (v - expected).abs() < CONST_MATCH_EPS,
        None => false,
    }
}
