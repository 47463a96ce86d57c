//! Graph optimization: inactive-subgraph folding, algebraic simplification,
//! common subexpression elimination, and a final unreachable-code sweep.
//!
//! The optimizer clones the input graph and iterates its enabled passes
//! until a fixed point or the configured pass limit. Eliminated nodes are
//! marked dead but keep their slot, so downstream ids never shift; a
//! redirect table records where each eliminated node's value now lives.
//! After the loop, nodes unreachable from any output or differentiation
//! input are swept dead with no replacement.

use crate::config::Config;
use crate::ir::{Graph, NodeId, Opcode, NO_NODE};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Counters describing what the optimizer did.
#[derive(Clone, Debug, Default)]
pub struct OptimizeStats {
    /// Passes performed before reaching a fixed point or the limit.
    pub passes: u32,
    /// Inactive nodes evaluated at compile time.
    pub inactive_folds: usize,
    /// Algebraic identities applied.
    pub algebraic_rewrites: usize,
    /// Nodes merged into an earlier structural duplicate.
    pub cse_merges: usize,
    /// Nodes swept by the reachability pass.
    pub dead_code: usize,
    /// Node count of the input graph.
    pub nodes_in: usize,
    /// Live nodes remaining after all passes.
    pub live_nodes_out: usize,
    /// Wall-clock time spent in the optimizer.
    pub elapsed: Duration,
}

/// Run the optimizer over `graph`, returning the optimized graph, the remap
/// from input ids to output ids (`NO_NODE` for nodes that no longer hold an
/// addressable value), and statistics.
pub fn run(graph: &Graph, config: &Config) -> (Graph, Vec<NodeId>, OptimizeStats) {
    let start = Instant::now();
    let mut stats = OptimizeStats {
        nodes_in: graph.len(),
        ..Default::default()
    };

    let identity: Vec<NodeId> = (0..graph.len() as NodeId).collect();
    if !config.enable_optimizations || config.max_optimization_passes == 0 {
        stats.live_nodes_out = graph.nodes.iter().filter(|n| !n.is_dead).count();
        stats.elapsed = start.elapsed();
        return (graph.clone(), identity, stats);
    }

    let mut g = graph.clone();
    let mut redirect = identity;

    while stats.passes < config.max_optimization_passes {
        let mut changed = 0;
        if config.enable_inactive_folding {
            let n = fold_inactive(&mut g, &redirect);
            stats.inactive_folds += n;
            changed += n;
        }
        if config.enable_algebraic_simplification {
            let n = simplify_algebraic(&mut g, &mut redirect);
            stats.algebraic_rewrites += n;
            changed += n;
        }
        if config.enable_cse {
            let n = eliminate_common_subexpressions(&mut g, &mut redirect);
            stats.cse_merges += n;
            changed += n;
        }
        rewrite_references(&mut g, &redirect);
        stats.passes += 1;
        if changed == 0 {
            break;
        }
    }

    stats.dead_code = sweep_unreachable(&mut g, &mut redirect);

    let remap: Vec<NodeId> = (0..g.len() as NodeId)
        .map(|i| resolve(&redirect, i))
        .collect();
    stats.live_nodes_out = g.nodes.iter().filter(|n| !n.is_dead).count();
    stats.elapsed = start.elapsed();
    log::debug!(
        "optimizer: {} passes, {} folds, {} algebraic, {} cse, {} unreachable, {} -> {} live nodes",
        stats.passes,
        stats.inactive_folds,
        stats.algebraic_rewrites,
        stats.cse_merges,
        stats.dead_code,
        stats.nodes_in,
        stats.live_nodes_out
    );
    (g, remap, stats)
}

fn resolve(redirect: &[NodeId], mut id: NodeId) -> NodeId {
    if id == NO_NODE {
        return NO_NODE;
    }
    while redirect[id as usize] != id {
        id = redirect[id as usize];
        if id == NO_NODE {
            return NO_NODE;
        }
    }
    id
}

/// Evaluate every pure inactive node whose operands are known at compile
/// time and replace it with a constant backed by a fresh pool entry.
fn fold_inactive(g: &mut Graph, redirect: &[NodeId]) -> usize {
    let mut vals: Vec<Option<f64>> = vec![None; g.len()];
    let mut folds = 0;

    for i in 0..g.len() {
        let node = g.nodes[i];
        if node.is_dead {
            continue;
        }
        match node.op {
            Opcode::Constant => {
                vals[i] = g.const_pool.get(node.imm as usize).copied();
            }
            Opcode::BoolConstant | Opcode::IntConstant => {
                vals[i] = Some(node.imm);
            }
            op if !node.is_active && op.is_foldable() && op.arity() > 0 => {
                let operand = |id: NodeId| -> Option<f64> {
                    let r = resolve(redirect, id);
                    if r == NO_NODE {
                        None
                    } else {
                        vals[r as usize]
                    }
                };
                let a = operand(node.a);
                let b = if op.arity() > 1 { operand(node.b) } else { Some(0.0) };
                let c = if op.arity() > 2 { operand(node.c) } else { Some(0.0) };
                if let (Some(a), Some(b), Some(c)) = (a, b, c) {
                    let value = evaluate(op, a, b, c);
                    vals[i] = Some(value);
                    replace_with_constant(g, i, value);
                    folds += 1;
                }
            }
            _ => {}
        }
    }
    folds
}

/// Compile-time evaluation of a pure opcode.
fn evaluate(op: Opcode, a: f64, b: f64, c: f64) -> f64 {
    use Opcode::*;
    let as01 = |v: bool| if v { 1.0 } else { 0.0 };
    match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Div => a / b,
        Neg => -a,
        Abs => a.abs(),
        Square => a * a,
        Recip => 1.0 / a,
        Mod => a - b * (a / b).trunc(),
        Exp => a.exp(),
        Log => a.ln(),
        Sqrt => a.sqrt(),
        Pow => a.powf(b),
        Sin => a.sin(),
        Cos => a.cos(),
        Tan => a.tan(),
        Min => a.min(b),
        Max => a.max(b),
        If => {
            if a != 0.0 {
                b
            } else {
                c
            }
        }
        CmpLT => as01(a < b),
        CmpLE => as01(a <= b),
        CmpGT => as01(a > b),
        CmpGE => as01(a >= b),
        CmpEQ => as01(a == b),
        CmpNE => as01(a != b),
        BoolAnd => as01(a != 0.0 && b != 0.0),
        BoolOr => as01(a != 0.0 || b != 0.0),
        BoolNot => as01(a == 0.0),
        BoolEq => as01((a != 0.0) == (b != 0.0)),
        BoolNe => as01((a != 0.0) != (b != 0.0)),
        IntAdd => (a.trunc() + b.trunc()).trunc(),
        IntSub => (a.trunc() - b.trunc()).trunc(),
        IntMul => (a.trunc() * b.trunc()).trunc(),
        IntDiv => (a.trunc() / b.trunc()).trunc(),
        IntMod => {
            let (x, y) = (a.trunc(), b.trunc());
            x - y * (x / y).trunc()
        }
        IntNeg => -a.trunc(),
        IntCmpLT => as01(a.trunc() < b.trunc()),
        IntCmpLE => as01(a.trunc() <= b.trunc()),
        IntCmpGT => as01(a.trunc() > b.trunc()),
        IntCmpGE => as01(a.trunc() >= b.trunc()),
        IntCmpEQ => as01(a.trunc() == b.trunc()),
        IntCmpNE => as01(a.trunc() != b.trunc()),
        IntIf => {
            if a != 0.0 {
                b.trunc()
            } else {
                c.trunc()
            }
        }
        Input | Constant | BoolConstant | IntConstant | ArrayIndex => {
            unreachable!("not foldable: {}", op)
        }
    }
}

fn replace_with_constant(g: &mut Graph, i: usize, value: f64) {
    let index = g.const_pool.len();
    g.const_pool.push(value);
    let node = &mut g.nodes[i];
    node.op = Opcode::Constant;
    node.imm = index as f64;
    node.a = NO_NODE;
    node.b = NO_NODE;
    node.c = NO_NODE;
    node.is_active = false;
}

/// Apply the algebraic identity table. A node whose value is now produced
/// elsewhere is marked dead and redirected; a node that collapses to a
/// literal becomes a constant in place.
fn simplify_algebraic(g: &mut Graph, redirect: &mut Vec<NodeId>) -> usize {
    enum Rewrite {
        RouteTo(NodeId),
        Literal(f64),
        Rewire(NodeId),
    }

    let mut rewrites = 0;
    for i in 0..g.len() {
        if g.nodes[i].is_dead {
            continue;
        }
        let node = g.nodes[i];
        let a = resolve(redirect, node.a);
        let b = resolve(redirect, node.b);
        // Bit-strict matching: a -0.0 constant must never trigger a
        // sign-changing rewrite such as x * 0 -> 0.
        let matches = |id: NodeId, literal: f64| {
            g.constant_value(id).map(f64::to_bits) == Some(literal.to_bits())
        };
        let ca_zero = matches(a, 0.0);
        let cb_zero = matches(b, 0.0);
        let ca_one = matches(a, 1.0);
        let cb_one = matches(b, 1.0);

        let rewrite = match node.op {
            Opcode::Add if ca_zero => Rewrite::RouteTo(b),
            Opcode::Add if cb_zero => Rewrite::RouteTo(a),
            Opcode::Sub if cb_zero => Rewrite::RouteTo(a),
            Opcode::Mul if ca_zero || cb_zero => Rewrite::Literal(0.0),
            Opcode::Mul if ca_one => Rewrite::RouteTo(b),
            Opcode::Mul if cb_one => Rewrite::RouteTo(a),
            Opcode::Div if cb_one => Rewrite::RouteTo(a),
            Opcode::Pow if cb_zero => Rewrite::Literal(1.0),
            Opcode::Pow if cb_one => Rewrite::RouteTo(a),
            Opcode::Neg => {
                let inner = g.nodes[a as usize];
                if inner.op == Opcode::Neg && !inner.is_dead {
                    Rewrite::RouteTo(resolve(redirect, inner.a))
                } else {
                    continue;
                }
            }
            Opcode::Abs => {
                let inner = g.nodes[a as usize];
                if inner.op == Opcode::Abs && !inner.is_dead {
                    Rewrite::Rewire(resolve(redirect, inner.a))
                } else {
                    continue;
                }
            }
            _ => continue,
        };

        match rewrite {
            Rewrite::RouteTo(target) => {
                g.nodes[i].is_dead = true;
                redirect[i] = target;
            }
            Rewrite::Literal(value) => replace_with_constant(g, i, value),
            Rewrite::Rewire(operand) => g.nodes[i].a = operand,
        }
        rewrites += 1;
    }
    rewrites
}

/// Merge live nodes with the same opcode, operands, and immediate bits into
/// the earliest occurrence.
fn eliminate_common_subexpressions(g: &mut Graph, redirect: &mut Vec<NodeId>) -> usize {
    let mut seen: HashMap<(Opcode, NodeId, NodeId, NodeId, u64), NodeId> = HashMap::new();
    let mut merges = 0;

    for i in 0..g.len() {
        let node = g.nodes[i];
        if node.is_dead || node.op == Opcode::Input {
            continue;
        }
        let key = (
            node.op,
            resolve(redirect, node.a),
            resolve(redirect, node.b),
            resolve(redirect, node.c),
            node.imm.to_bits(),
        );
        match seen.get(&key) {
            Some(&earlier) => {
                g.nodes[i].is_dead = true;
                redirect[i] = earlier;
                merges += 1;
            }
            None => {
                seen.insert(key, i as NodeId);
            }
        }
    }
    merges
}

/// Route every live reference, output, and differentiation input through
/// the redirect table.
fn rewrite_references(g: &mut Graph, redirect: &[NodeId]) {
    for node in g.nodes.iter_mut().filter(|n| !n.is_dead) {
        if node.a != NO_NODE {
            node.a = resolve(redirect, node.a);
        }
        if node.b != NO_NODE {
            node.b = resolve(redirect, node.b);
        }
        if node.c != NO_NODE {
            node.c = resolve(redirect, node.c);
        }
    }
    for out in g.outputs.iter_mut() {
        *out = resolve(redirect, *out);
    }
    for di in g.diff_inputs.iter_mut() {
        *di = resolve(redirect, *di);
    }
}

/// Mark live nodes unreachable from any output or differentiation input as
/// dead. Inputs are exempt; the caller writes them regardless.
fn sweep_unreachable(g: &mut Graph, redirect: &mut Vec<NodeId>) -> usize {
    let mut reachable = vec![false; g.len()];
    let mut worklist: Vec<NodeId> = g
        .outputs
        .iter()
        .chain(g.diff_inputs.iter())
        .copied()
        .filter(|&id| id != NO_NODE)
        .collect();
    while let Some(id) = worklist.pop() {
        let i = id as usize;
        if reachable[i] {
            continue;
        }
        reachable[i] = true;
        if !g.nodes[i].is_dead {
            worklist.extend(g.nodes[i].operands());
        }
    }

    let mut swept = 0;
    for i in 0..g.len() {
        let node = &mut g.nodes[i];
        if !node.is_dead && !reachable[i] && node.op != Opcode::Input {
            node.is_dead = true;
            redirect[i] = NO_NODE;
            swept += 1;
        }
    }
    swept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config::default()
    }

    #[test]
    fn disabled_optimizer_is_identity() {
        let mut g = Graph::new();
        let x = g.add_input();
        let c = g.add_constant(0.0);
        let s = g.add_binary(Opcode::Add, x, c);
        g.mark_output(s);
        let (out, remap, stats) = run(&g, &Config::no_optimization());
        assert_eq!(stats.passes, 0);
        assert_eq!(remap, vec![0, 1, 2]);
        assert!(!out.node(s).is_dead);
    }

    #[test]
    fn add_zero_is_removed() {
        let mut g = Graph::new();
        let x = g.add_input();
        let zero = g.add_constant(0.0);
        let s = g.add_binary(Opcode::Add, x, zero);
        g.mark_output(s);
        let (out, remap, stats) = run(&g, &cfg());
        assert!(stats.algebraic_rewrites >= 1);
        assert_eq!(remap[s as usize], x);
        assert!(out.node(s).is_dead);
        assert_eq!(out.outputs, vec![x]);
    }

    #[test]
    fn mul_zero_collapses_to_constant() {
        let mut g = Graph::new();
        let x = g.add_input();
        let zero = g.add_constant(0.0);
        let m = g.add_binary(Opcode::Mul, x, zero);
        g.mark_output(m);
        let (out, remap, _) = run(&g, &cfg());
        let m2 = remap[m as usize];
        assert_eq!(out.node(m2).op, Opcode::Constant);
        assert_eq!(out.constant_value(m2), Some(0.0));
    }

    #[test]
    fn pow_identities() {
        let mut g = Graph::new();
        let x = g.add_input();
        let zero = g.add_constant(0.0);
        let one = g.add_constant(1.0);
        let p0 = g.add_binary(Opcode::Pow, x, zero);
        let p1 = g.add_binary(Opcode::Pow, x, one);
        g.mark_output(p0);
        g.mark_output(p1);
        let (out, remap, _) = run(&g, &cfg());
        assert_eq!(out.constant_value(remap[p0 as usize]), Some(1.0));
        assert_eq!(remap[p1 as usize], x);
    }

    #[test]
    fn double_negation_cancels() {
        let mut g = Graph::new();
        let x = g.add_input();
        let n1 = g.add_unary(Opcode::Neg, x);
        let n2 = g.add_unary(Opcode::Neg, n1);
        g.mark_output(n2);
        let (out, remap, _) = run(&g, &cfg());
        assert_eq!(remap[n2 as usize], x);
        assert_eq!(out.outputs, vec![x]);
    }

    #[test]
    fn nested_abs_collapses() {
        let mut g = Graph::new();
        let x = g.add_input();
        let a1 = g.add_unary(Opcode::Abs, x);
        let a2 = g.add_unary(Opcode::Abs, a1);
        g.mark_output(a2);
        let (out, remap, _) = run(&g, &cfg());
        let root = out.node(remap[a2 as usize]);
        assert_eq!(root.op, Opcode::Abs);
        assert_eq!(root.a, x);
    }

    #[test]
    fn inactive_subtree_folds_to_constant() {
        let mut g = Graph::new();
        let x = g.add_input();
        let two = g.add_constant(2.0);
        let three = g.add_constant(3.0);
        let six = g.add_binary(Opcode::Mul, two, three);
        let s = g.add_binary(Opcode::Add, x, six);
        g.mark_output(s);
        let (out, remap, stats) = run(&g, &cfg());
        assert!(stats.inactive_folds >= 1);
        let folded = out.node(remap[six as usize]);
        assert_eq!(folded.op, Opcode::Constant);
        assert_eq!(out.constant_value(remap[six as usize]), Some(6.0));
    }

    #[test]
    fn cse_merges_duplicates() {
        let mut g = Graph::new();
        let x = g.add_input();
        let y = g.add_input();
        let s1 = g.add_binary(Opcode::Add, x, y);
        let s2 = g.add_binary(Opcode::Add, x, y);
        let m = g.add_binary(Opcode::Mul, s1, s2);
        g.mark_output(m);
        let (out, remap, stats) = run(&g, &cfg());
        assert!(stats.cse_merges >= 1);
        assert_eq!(remap[s2 as usize], s1);
        let root = out.node(remap[m as usize]);
        assert_eq!(root.a, s1);
        assert_eq!(root.b, s1);
    }

    #[test]
    fn cse_is_idempotent() {
        let mut g = Graph::new();
        let x = g.add_input();
        let y = g.add_input();
        let s1 = g.add_binary(Opcode::Add, x, y);
        let s2 = g.add_binary(Opcode::Add, x, y);
        let m = g.add_binary(Opcode::Mul, s1, s2);
        g.mark_output(m);

        let mut config = cfg();
        config.enable_inactive_folding = false;
        config.enable_algebraic_simplification = false;
        let (once, _, _) = run(&g, &config);
        let (twice, _, _) = run(&once, &config);

        assert_eq!(once.len(), twice.len());
        for (a, b) in once.nodes.iter().zip(twice.nodes.iter()) {
            assert_eq!(a.op, b.op);
            assert_eq!(a.a, b.a);
            assert_eq!(a.b, b.b);
            assert_eq!(a.is_dead, b.is_dead);
        }
    }

    #[test]
    fn unreachable_nodes_are_swept() {
        let mut g = Graph::new();
        let x = g.add_input();
        let dead = g.add_unary(Opcode::Neg, x);
        let live = g.add_unary(Opcode::Abs, x);
        g.mark_output(live);
        let (out, remap, stats) = run(&g, &cfg());
        assert_eq!(stats.dead_code, 1);
        assert!(out.node(dead).is_dead);
        assert_eq!(remap[dead as usize], NO_NODE);
        assert!(!out.node(live).is_dead);
    }

    #[test]
    fn acyclicity_survives_optimization() {
        let mut g = Graph::new();
        let x = g.add_input();
        let zero = g.add_constant(0.0);
        let a = g.add_binary(Opcode::Add, x, zero);
        let b = g.add_binary(Opcode::Mul, a, a);
        g.mark_output(b);
        let (out, _, _) = run(&g, &cfg());
        for (i, node) in out.nodes.iter().enumerate() {
            if node.is_dead {
                continue;
            }
            for op in node.operands() {
                assert!((op as usize) < i, "node {} refers forward", i);
            }
        }
    }
}
