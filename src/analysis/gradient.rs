//! Forward propagation of the `needs_gradient` flag.

use crate::ir::Graph;

/// Recompute the `needs_gradient` closure from the graph's differentiation
/// inputs.
///
/// A node carries the flag iff it is itself a differentiation input or at
/// least one of its operands carries it. Dead nodes are skipped and never
/// propagate. The sweep is a single pass from low to high index, which is
/// sufficient because operands always precede their users.
pub fn propagate_gradients(graph: &mut Graph) {
    for node in &mut graph.nodes {
        node.needs_gradient = false;
    }
    for i in 0..graph.diff_inputs.len() {
        let id = graph.diff_inputs[i] as usize;
        if !graph.nodes[id].is_dead {
            graph.nodes[id].needs_gradient = true;
        }
    }
    for i in 0..graph.nodes.len() {
        if graph.nodes[i].is_dead || graph.nodes[i].needs_gradient {
            continue;
        }
        let needs = graph.nodes[i]
            .operands()
            .any(|op| !graph.nodes[op as usize].is_dead && graph.nodes[op as usize].needs_gradient);
        if needs {
            graph.nodes[i].needs_gradient = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Graph, Opcode};

    #[test]
    fn closure_follows_forward_paths() {
        let mut g = Graph::new();
        let x = g.add_input();
        let y = g.add_input();
        let c = g.add_constant(2.0);
        let xc = g.add_binary(Opcode::Mul, x, c);
        let yc = g.add_binary(Opcode::Mul, y, c);
        let sum = g.add_binary(Opcode::Add, xc, yc);
        g.mark_diff_input(x);
        propagate_gradients(&mut g);

        assert!(g.node(x).needs_gradient);
        assert!(!g.node(y).needs_gradient);
        assert!(!g.node(c).needs_gradient);
        assert!(g.node(xc).needs_gradient);
        assert!(!g.node(yc).needs_gradient);
        assert!(g.node(sum).needs_gradient);
    }

    #[test]
    fn repropagation_clears_stale_flags() {
        let mut g = Graph::new();
        let x = g.add_input();
        let n = g.add_unary(Opcode::Neg, x);
        g.mark_diff_input(x);
        propagate_gradients(&mut g);
        assert!(g.node(n).needs_gradient);

        g.diff_inputs.clear();
        propagate_gradients(&mut g);
        assert!(!g.node(x).needs_gradient);
        assert!(!g.node(n).needs_gradient);
    }

    #[test]
    fn dead_nodes_do_not_propagate() {
        let mut g = Graph::new();
        let x = g.add_input();
        let n = g.add_unary(Opcode::Neg, x);
        let m = g.add_unary(Opcode::Neg, n);
        g.mark_diff_input(x);
        g.nodes[n as usize].is_dead = true;
        propagate_gradients(&mut g);
        assert!(!g.node(m).needs_gradient);
    }
}
