//! The reverse-mode gradient emitter.
//!
//! Runs after the forward pass, when the value buffer holds the forward
//! value of every live node. The pass seeds `gradient[output] = 1.0` for
//! each output, then walks the nodes in reverse index order. For every live
//! node `n` carrying `needs_gradient`, the upstream gradient `g` is read
//! from the gradient buffer and `∂n/∂x · g` is accumulated into the
//! gradient slot of each operand `x` that itself needs a gradient. Forward
//! values are re-read through the same allocator and constant machinery as
//! the forward pass.
//!
//! Opcodes that are piecewise constant with respect to the differentiation
//! inputs (comparisons, booleans, the integer alphabet, an `If` condition)
//! contribute nothing and are skipped.
//!
//! Ordering matters around callouts: a callout may clobber the entire
//! vector file, and anonymous temporaries are not reloadable, so each
//! contribution performs its callout first and only then loads the upstream
//! gradient and combines. Tracked node values reload transparently.

use crate::binemit::EmitContext;
use crate::ir::{CondCode, Node, NodeId, Opcode, NO_NODE};
use crate::isa::LibCall;
use crate::result::CodegenResult;

/// Emit the reverse sweep. Assumes the caller zero-initialized the gradient
/// buffer before execution.
pub fn emit(cx: &mut EmitContext) -> CodegenResult<()> {
    seed_outputs(cx)?;
    for id in (0..cx.graph.len() as NodeId).rev() {
        let node = *cx.graph.node(id);
        if node.is_dead || !node.needs_gradient || !node.op.is_differentiable() {
            continue;
        }
        emit_node(cx, id, &node)?;
    }
    Ok(())
}

/// Store 1.0 into the gradient slot of every output.
fn seed_outputs(cx: &mut EmitContext) -> CodegenResult<()> {
    if cx.graph.outputs.is_empty() {
        return Ok(());
    }
    let one = cx.alloc_temp(&[])?;
    cx.isa.emit_load_imm(cx.ops, one, 1.0);
    for i in 0..cx.graph.outputs.len() {
        let out = cx.graph.outputs[i];
        cx.isa.emit_store_grad(cx.ops, one, out);
    }
    cx.release_temp(one);
    Ok(())
}

/// Whether gradient contributions should be accumulated into `id`.
fn wants(cx: &EmitContext, id: NodeId) -> bool {
    id != NO_NODE && {
        let node = cx.graph.node(id);
        !node.is_dead && node.needs_gradient
    }
}

/// Load `gradient[node]` into a locked anonymous temporary.
fn load_upstream(cx: &mut EmitContext, node: NodeId, avoid: &[u8]) -> CodegenResult<u8> {
    let g = cx.alloc_temp(avoid)?;
    cx.isa.emit_load_grad(cx.ops, g, node);
    Ok(g)
}

fn emit_node(cx: &mut EmitContext, id: NodeId, node: &Node) -> CodegenResult<()> {
    use Opcode::*;
    match node.op {
        Add => {
            let g = load_upstream(cx, id, &[])?;
            if wants(cx, node.a) {
                cx.isa.emit_accum_grad(cx.ops, g, node.a);
            }
            if wants(cx, node.b) {
                cx.isa.emit_accum_grad(cx.ops, g, node.b);
            }
            cx.release_temp(g);
        }
        Sub => {
            let g = load_upstream(cx, id, &[])?;
            if wants(cx, node.a) {
                cx.isa.emit_accum_grad(cx.ops, g, node.a);
            }
            if wants(cx, node.b) {
                cx.isa.emit_neg(cx.ops, g);
                cx.isa.emit_accum_grad(cx.ops, g, node.b);
            }
            cx.release_temp(g);
        }
        Mul => {
            let va = cx.ensure_in_register(node.a, &[])?;
            cx.regs.lock(va);
            let vb = cx.ensure_in_register(node.b, &[va])?;
            cx.regs.lock(vb);
            let g = load_upstream(cx, id, &[va, vb])?;
            if wants(cx, node.a) {
                let t = cx.alloc_temp(&[va, vb, g])?;
                cx.isa.emit_move(cx.ops, t, g);
                cx.isa.emit_mul(cx.ops, t, vb);
                cx.isa.emit_accum_grad(cx.ops, t, node.a);
                cx.release_temp(t);
            }
            if wants(cx, node.b) {
                cx.isa.emit_mul(cx.ops, g, va);
                cx.isa.emit_accum_grad(cx.ops, g, node.b);
            }
            cx.release_temp(g);
            cx.regs.unlock(vb);
            cx.regs.unlock(va);
        }
        Div => {
            // d/da = g / b, d/db = -(g / b) * n with n = a / b.
            let vb = cx.ensure_in_register(node.b, &[])?;
            cx.regs.lock(vb);
            let g = load_upstream(cx, id, &[vb])?;
            cx.isa.emit_div(cx.ops, g, vb);
            if wants(cx, node.a) {
                cx.isa.emit_accum_grad(cx.ops, g, node.a);
            }
            if wants(cx, node.b) {
                let vn = cx.ensure_in_register(id, &[vb, g])?;
                cx.isa.emit_mul(cx.ops, g, vn);
                cx.isa.emit_neg(cx.ops, g);
                cx.isa.emit_accum_grad(cx.ops, g, node.b);
            }
            cx.release_temp(g);
            cx.regs.unlock(vb);
        }
        Neg => {
            let g = load_upstream(cx, id, &[])?;
            cx.isa.emit_neg(cx.ops, g);
            cx.isa.emit_accum_grad(cx.ops, g, node.a);
            cx.release_temp(g);
        }
        Abs => {
            // Flip the upstream sign where the argument is negative.
            let va = cx.ensure_in_register(node.a, &[])?;
            cx.regs.lock(va);
            let z = cx.alloc_temp(&[va])?;
            cx.isa.emit_zero(cx.ops, z);
            let m = cx.alloc_temp(&[va, z])?;
            cx.isa.emit_cmp_mask(cx.ops, m, va, z, CondCode::LessThan);
            cx.isa.emit_all_ones(cx.ops, z);
            cx.isa.emit_shl(cx.ops, z, 63);
            cx.isa.emit_and(cx.ops, m, z);
            let g = load_upstream(cx, id, &[va, z, m])?;
            cx.isa.emit_xor(cx.ops, g, m);
            cx.isa.emit_accum_grad(cx.ops, g, node.a);
            cx.release_temp(g);
            cx.release_temp(m);
            cx.release_temp(z);
            cx.regs.unlock(va);
        }
        Square => {
            // d/da = 2 a g.
            let va = cx.ensure_in_register(node.a, &[])?;
            cx.regs.lock(va);
            let g = load_upstream(cx, id, &[va])?;
            cx.isa.emit_mul(cx.ops, g, va);
            cx.isa.emit_add(cx.ops, g, g);
            cx.isa.emit_accum_grad(cx.ops, g, node.a);
            cx.release_temp(g);
            cx.regs.unlock(va);
        }
        Recip => {
            // d/da = -n² g with n = 1 / a.
            let vn = cx.ensure_in_register(id, &[])?;
            cx.regs.lock(vn);
            let g = load_upstream(cx, id, &[vn])?;
            cx.isa.emit_mul(cx.ops, g, vn);
            cx.isa.emit_mul(cx.ops, g, vn);
            cx.isa.emit_neg(cx.ops, g);
            cx.isa.emit_accum_grad(cx.ops, g, node.a);
            cx.release_temp(g);
            cx.regs.unlock(vn);
        }
        Mod => {
            // n = a - b trunc(a / b): d/da = g, d/db = -trunc(a / b) g.
            if wants(cx, node.a) {
                let g = load_upstream(cx, id, &[])?;
                cx.isa.emit_accum_grad(cx.ops, g, node.a);
                cx.release_temp(g);
            }
            if wants(cx, node.b) {
                let va = cx.ensure_in_register(node.a, &[])?;
                cx.regs.lock(va);
                let vb = cx.ensure_in_register(node.b, &[va])?;
                cx.regs.lock(vb);
                let t = cx.alloc_temp(&[va, vb])?;
                cx.isa.emit_move(cx.ops, t, va);
                cx.isa.emit_div(cx.ops, t, vb);
                cx.isa.emit_trunc(cx.ops, t, t);
                let g = load_upstream(cx, id, &[va, vb, t])?;
                cx.isa.emit_mul(cx.ops, t, g);
                cx.isa.emit_neg(cx.ops, t);
                cx.isa.emit_accum_grad(cx.ops, t, node.b);
                cx.release_temp(g);
                cx.release_temp(t);
                cx.regs.unlock(vb);
                cx.regs.unlock(va);
            }
        }
        Exp => {
            // d/da = n g, reusing the stored forward value.
            let vn = cx.ensure_in_register(id, &[])?;
            cx.regs.lock(vn);
            let g = load_upstream(cx, id, &[vn])?;
            cx.isa.emit_mul(cx.ops, g, vn);
            cx.isa.emit_accum_grad(cx.ops, g, node.a);
            cx.release_temp(g);
            cx.regs.unlock(vn);
        }
        Log => {
            // d/da = g / a.
            let va = cx.ensure_in_register(node.a, &[])?;
            cx.regs.lock(va);
            let g = load_upstream(cx, id, &[va])?;
            cx.isa.emit_div(cx.ops, g, va);
            cx.isa.emit_accum_grad(cx.ops, g, node.a);
            cx.release_temp(g);
            cx.regs.unlock(va);
        }
        Sqrt => {
            // d/da = g / (2 n).
            let vn = cx.ensure_in_register(id, &[])?;
            cx.regs.lock(vn);
            let g = load_upstream(cx, id, &[vn])?;
            cx.isa.emit_div(cx.ops, g, vn);
            let half = cx.alloc_temp(&[vn, g])?;
            cx.isa.emit_load_imm(cx.ops, half, 0.5);
            cx.isa.emit_mul(cx.ops, g, half);
            cx.isa.emit_accum_grad(cx.ops, g, node.a);
            cx.release_temp(half);
            cx.release_temp(g);
            cx.regs.unlock(vn);
        }
        Sin => {
            // d/da = cos(a) g. The callout runs before the upstream load.
            let va = cx.ensure_in_register(node.a, &[])?;
            let d = cx.alloc_temp(&[va])?;
            cx.isa.emit_call1(cx.ops, d, va, LibCall::Cos, cx.regs);
            let g = load_upstream(cx, id, &[d])?;
            cx.isa.emit_mul(cx.ops, g, d);
            cx.isa.emit_accum_grad(cx.ops, g, node.a);
            cx.release_temp(g);
            cx.release_temp(d);
        }
        Cos => {
            // d/da = -sin(a) g.
            let va = cx.ensure_in_register(node.a, &[])?;
            let d = cx.alloc_temp(&[va])?;
            cx.isa.emit_call1(cx.ops, d, va, LibCall::Sin, cx.regs);
            let g = load_upstream(cx, id, &[d])?;
            cx.isa.emit_mul(cx.ops, g, d);
            cx.isa.emit_neg(cx.ops, g);
            cx.isa.emit_accum_grad(cx.ops, g, node.a);
            cx.release_temp(g);
            cx.release_temp(d);
        }
        Tan => {
            // d/da = (1 + n²) g, reusing the stored forward value.
            let vn = cx.ensure_in_register(id, &[])?;
            cx.regs.lock(vn);
            let t = cx.alloc_temp(&[vn])?;
            cx.isa.emit_move(cx.ops, t, vn);
            cx.isa.emit_mul(cx.ops, t, vn);
            let one = cx.alloc_temp(&[vn, t])?;
            cx.isa.emit_load_imm(cx.ops, one, 1.0);
            cx.isa.emit_add(cx.ops, t, one);
            cx.release_temp(one);
            let g = load_upstream(cx, id, &[vn, t])?;
            cx.isa.emit_mul(cx.ops, g, t);
            cx.isa.emit_accum_grad(cx.ops, g, node.a);
            cx.release_temp(g);
            cx.release_temp(t);
            cx.regs.unlock(vn);
        }
        Pow => {
            emit_pow(cx, id, node)?;
        }
        Min => {
            emit_min_max(cx, id, node, CondCode::LessThanOrEqual)?;
        }
        Max => {
            emit_min_max(cx, id, node, CondCode::GreaterThanOrEqual)?;
        }
        If => {
            // The gradient routes to whichever arm the mask selects; the
            // condition is treated as piecewise constant.
            let vc = cx.ensure_in_register(node.a, &[])?;
            cx.regs.lock(vc);
            let m = cx.alloc_temp(&[vc])?;
            cx.isa.emit_mask_from_bool(cx.ops, m, vc);
            let g = load_upstream(cx, id, &[vc, m])?;
            if wants(cx, node.b) {
                let t = cx.alloc_temp(&[vc, m, g])?;
                cx.isa.emit_move(cx.ops, t, g);
                cx.isa.emit_and(cx.ops, t, m);
                cx.isa.emit_accum_grad(cx.ops, t, node.b);
                cx.release_temp(t);
            }
            if wants(cx, node.c) {
                cx.isa.emit_andnot(cx.ops, m, g);
                cx.isa.emit_accum_grad(cx.ops, m, node.c);
            }
            cx.release_temp(g);
            cx.release_temp(m);
            cx.regs.unlock(vc);
        }
        _ => unreachable!("opcode {} is not differentiable", node.op),
    }
    Ok(())
}

/// `n = a^b`: `d/da = b a^(b-1) g` and `d/db = n ln(a) g`. Each side needs
/// its own callout, so the two contributions are emitted independently.
fn emit_pow(cx: &mut EmitContext, id: NodeId, node: &Node) -> CodegenResult<()> {
    if wants(cx, node.a) {
        let va = cx.ensure_in_register(node.a, &[])?;
        cx.regs.lock(va);
        let vb = cx.ensure_in_register(node.b, &[va])?;
        cx.regs.lock(vb);
        let e = cx.alloc_temp(&[va, vb])?;
        let one = cx.alloc_temp(&[va, vb, e])?;
        cx.isa.emit_load_imm(cx.ops, one, 1.0);
        cx.isa.emit_move(cx.ops, e, vb);
        cx.isa.emit_sub(cx.ops, e, one);
        cx.release_temp(one);
        let p = cx.alloc_temp(&[va, vb, e])?;
        cx.isa.emit_call2(cx.ops, p, va, e, LibCall::Pow, cx.regs);
        cx.release_temp(e);
        cx.regs.unlock(vb);
        cx.regs.unlock(va);

        let g = load_upstream(cx, id, &[p])?;
        let vb = cx.ensure_in_register(node.b, &[p, g])?;
        cx.isa.emit_mul(cx.ops, g, vb);
        cx.isa.emit_mul(cx.ops, g, p);
        cx.isa.emit_accum_grad(cx.ops, g, node.a);
        cx.release_temp(g);
        cx.release_temp(p);
    }
    if wants(cx, node.b) {
        let va = cx.ensure_in_register(node.a, &[])?;
        let l = cx.alloc_temp(&[va])?;
        cx.isa.emit_call1(cx.ops, l, va, LibCall::Log, cx.regs);

        let g = load_upstream(cx, id, &[l])?;
        let vn = cx.ensure_in_register(id, &[l, g])?;
        cx.isa.emit_mul(cx.ops, g, vn);
        cx.isa.emit_mul(cx.ops, g, l);
        cx.isa.emit_accum_grad(cx.ops, g, node.b);
        cx.release_temp(g);
        cx.release_temp(l);
    }
    Ok(())
}

/// The winning side of a `Min`/`Max` receives the whole gradient; ties go
/// to the first operand.
fn emit_min_max(cx: &mut EmitContext, id: NodeId, node: &Node, cc: CondCode) -> CodegenResult<()> {
    let va = cx.ensure_in_register(node.a, &[])?;
    cx.regs.lock(va);
    let vb = cx.ensure_in_register(node.b, &[va])?;
    cx.regs.lock(vb);
    let m = cx.alloc_temp(&[va, vb])?;
    cx.isa.emit_cmp_mask(cx.ops, m, va, vb, cc);
    let g = load_upstream(cx, id, &[va, vb, m])?;
    if wants(cx, node.a) {
        let t = cx.alloc_temp(&[va, vb, m, g])?;
        cx.isa.emit_move(cx.ops, t, g);
        cx.isa.emit_and(cx.ops, t, m);
        cx.isa.emit_accum_grad(cx.ops, t, node.a);
        cx.release_temp(t);
    }
    if wants(cx, node.b) {
        cx.isa.emit_andnot(cx.ops, m, g);
        cx.isa.emit_accum_grad(cx.ops, m, node.b);
    }
    cx.release_temp(g);
    cx.release_temp(m);
    cx.regs.unlock(vb);
    cx.regs.unlock(va);
    Ok(())
}
