//! The forward emitter.
//!
//! Walks the optimized node sequence in order and lowers each live node
//! through the instruction-set backend. Operands are brought into registers
//! with `ensure_in_register` and pinned while the node expands; the
//! destination is written back to the value buffer immediately, so any
//! later eviction or callout can safely discard register contents.
//!
//! Operand placement follows the operand forms of the backend: with native
//! three-operand instructions a fresh destination is used, otherwise the
//! destructive form runs in the first operand's register, swapping operands
//! for commutative opcodes when that saves a move. Transcendentals always
//! materialize into a fresh destination because the callout destroys the
//! argument register.

use crate::binemit::EmitContext;
use crate::ir::{CondCode, Node, NodeId, Opcode, NO_NODE};
use crate::isa::LibCall;
use crate::result::{CodegenError, CodegenResult};
use smallvec::SmallVec;

type Avoid = SmallVec<[u8; 4]>;

/// Emit the forward pass for every live node.
pub fn emit(cx: &mut EmitContext) -> CodegenResult<()> {
    for id in 0..cx.graph.len() as NodeId {
        let node = *cx.graph.node(id);
        if node.is_dead {
            continue;
        }
        emit_node(cx, id, &node)?;
    }
    Ok(())
}

fn emit_node(cx: &mut EmitContext, id: NodeId, node: &Node) -> CodegenResult<()> {
    use Opcode::*;
    match node.op {
        // The caller has already placed the value in the buffer.
        Input => Ok(()),
        Constant => emit_constant(cx, id),

        Add => binary(cx, id, node, true, BinOp::Add),
        Sub => binary(cx, id, node, false, BinOp::Sub),
        Mul => binary(cx, id, node, true, BinOp::Mul),
        Div => binary(cx, id, node, false, BinOp::Div),

        Neg => unary_in_place(cx, id, node, UnOp::Neg),
        Abs => unary_in_place(cx, id, node, UnOp::Abs),
        Square => unary_in_place(cx, id, node, UnOp::Square),
        Sqrt => unary_in_place(cx, id, node, UnOp::Sqrt),
        Recip => unary_in_place(cx, id, node, UnOp::Recip),

        Mod => destructive_binary(cx, id, node, false, DestrOp::Mod),
        Min => destructive_binary(cx, id, node, true, DestrOp::Min),
        Max => destructive_binary(cx, id, node, true, DestrOp::Max),

        Exp => call_unary(cx, id, node, LibCall::Exp),
        Log => call_unary(cx, id, node, LibCall::Log),
        Sin => call_unary(cx, id, node, LibCall::Sin),
        Cos => call_unary(cx, id, node, LibCall::Cos),
        Tan => call_unary(cx, id, node, LibCall::Tan),
        Pow => call_pow(cx, id, node),

        CmpLT => comparison(cx, id, node, CondCode::LessThan, false),
        CmpLE => comparison(cx, id, node, CondCode::LessThanOrEqual, false),
        CmpGT => comparison(cx, id, node, CondCode::GreaterThan, false),
        CmpGE => comparison(cx, id, node, CondCode::GreaterThanOrEqual, false),
        CmpEQ => comparison(cx, id, node, CondCode::Equal, false),
        CmpNE => comparison(cx, id, node, CondCode::NotEqual, false),

        If => emit_select(cx, id, node, false),

        BoolConstant | IntConstant => emit_literal(cx, id, node.imm),
        // AND over canonical 0.0/1.0 values is multiplication.
        BoolAnd => destructive_binary(cx, id, node, true, DestrOp::Mul),
        BoolOr => emit_bool_or(cx, id, node),
        BoolNot => emit_bool_not(cx, id, node),
        BoolEq => comparison(cx, id, node, CondCode::Equal, false),
        BoolNe => comparison(cx, id, node, CondCode::NotEqual, false),

        IntAdd => int_binary(cx, id, node, IntBinOp::Add),
        IntSub => int_binary(cx, id, node, IntBinOp::Sub),
        IntMul => int_binary(cx, id, node, IntBinOp::Mul),
        IntDiv => int_binary(cx, id, node, IntBinOp::Div),
        IntMod => int_binary(cx, id, node, IntBinOp::Mod),
        IntNeg => emit_int_neg(cx, id, node),
        IntCmpLT => comparison(cx, id, node, CondCode::LessThan, true),
        IntCmpLE => comparison(cx, id, node, CondCode::LessThanOrEqual, true),
        IntCmpGT => comparison(cx, id, node, CondCode::GreaterThan, true),
        IntCmpGE => comparison(cx, id, node, CondCode::GreaterThanOrEqual, true),
        IntCmpEQ => comparison(cx, id, node, CondCode::Equal, true),
        IntCmpNE => comparison(cx, id, node, CondCode::NotEqual, true),
        IntIf => emit_select(cx, id, node, true),

        ArrayIndex => Err(CodegenError::Unsupported("array_index")),
    }
}

/// A constant's first use loads from the pool and stores to the buffer;
/// afterwards it behaves like any other node.
fn emit_constant(cx: &mut EmitContext, id: NodeId) -> CodegenResult<()> {
    if cx.processed_constants.contains(&id) || cx.regs.find(id).is_some() {
        return Ok(());
    }
    let entry = *cx.pool.entry(id).ok_or_else(|| {
        CodegenError::Structural(format!("constant node {} missing from pool", id))
    })?;
    let dst = cx.alloc_dst(&[])?;
    // Bit compare: -0.0 must not take the xor fast path.
    if entry.value.to_bits() == 0 {
        cx.isa.emit_zero(cx.ops, dst);
    } else {
        cx.isa.emit_load_const(cx.ops, dst, entry.label);
    }
    cx.finish_node(dst, id);
    cx.processed_constants.insert(id);
    Ok(())
}

/// Boolean and integer literals are materialized from the immediate.
fn emit_literal(cx: &mut EmitContext, id: NodeId, value: f64) -> CodegenResult<()> {
    let dst = cx.alloc_dst(&[])?;
    // Bit compare: -0.0 must not take the xor fast path.
    if value.to_bits() == 0 {
        cx.isa.emit_zero(cx.ops, dst);
    } else {
        cx.isa.emit_load_imm(cx.ops, dst, value);
    }
    cx.finish_node(dst, id);
    Ok(())
}

#[derive(Copy, Clone)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Destructive two-operand opcodes without a three-operand form.
#[derive(Copy, Clone)]
enum DestrOp {
    Mul,
    Mod,
    Min,
    Max,
}

#[derive(Copy, Clone)]
enum UnOp {
    Neg,
    Abs,
    Square,
    Sqrt,
    Recip,
}

fn binary(
    cx: &mut EmitContext,
    id: NodeId,
    node: &Node,
    commutative: bool,
    op: BinOp,
) -> CodegenResult<()> {
    if cx.isa.supports_three_operand() {
        let a = ensure_avoiding(cx, node.a, &[node.b])?;
        cx.regs.lock(a);
        let b = cx.ensure_in_register(node.b, &[a])?;
        cx.regs.lock(b);
        let dst = cx.alloc_dst(&[a, b])?;
        match op {
            BinOp::Add => cx.isa.emit_add3(cx.ops, dst, a, b),
            BinOp::Sub => cx.isa.emit_sub3(cx.ops, dst, a, b),
            BinOp::Mul => cx.isa.emit_mul3(cx.ops, dst, a, b),
            BinOp::Div => cx.isa.emit_div3(cx.ops, dst, a, b),
        }
        cx.finish_node(dst, id);
        cx.regs.unlock(b);
        cx.regs.unlock(a);
        Ok(())
    } else {
        let (dst, rhs) = place_destructive(cx, node, commutative)?;
        match op {
            BinOp::Add => cx.isa.emit_add(cx.ops, dst, rhs),
            BinOp::Sub => cx.isa.emit_sub(cx.ops, dst, rhs),
            BinOp::Mul => cx.isa.emit_mul(cx.ops, dst, rhs),
            BinOp::Div => cx.isa.emit_div(cx.ops, dst, rhs),
        }
        cx.finish_node(dst, id);
        cx.regs.unlock(rhs);
        cx.regs.unlock(dst);
        Ok(())
    }
}

/// Two-operand form used on every backend for the opcodes with no native
/// three-operand encoding.
fn destructive_binary(
    cx: &mut EmitContext,
    id: NodeId,
    node: &Node,
    commutative: bool,
    op: DestrOp,
) -> CodegenResult<()> {
    let (dst, rhs) = place_destructive(cx, node, commutative)?;
    match op {
        DestrOp::Mul => cx.isa.emit_mul(cx.ops, dst, rhs),
        DestrOp::Mod => cx.isa.emit_mod(cx.ops, dst, rhs),
        DestrOp::Min => cx.isa.emit_min(cx.ops, dst, rhs),
        DestrOp::Max => cx.isa.emit_max(cx.ops, dst, rhs),
    }
    cx.finish_node(dst, id);
    cx.regs.unlock(rhs);
    cx.regs.unlock(dst);
    Ok(())
}

/// Bring both operands into registers for a destructive binary: the first
/// operand's register becomes the destination. For commutative opcodes the
/// operands swap when the second one is already register-resident and the
/// first is not, saving a load. Both returned slots are locked.
fn place_destructive(
    cx: &mut EmitContext,
    node: &Node,
    commutative: bool,
) -> CodegenResult<(u8, u8)> {
    let (dst_id, rhs_id) = if commutative
        && cx.regs.find(node.a).is_none()
        && cx.regs.find(node.b).is_some()
    {
        (node.b, node.a)
    } else {
        (node.a, node.b)
    };

    let dst = ensure_avoiding(cx, dst_id, &[rhs_id])?;
    cx.regs.lock(dst);
    let rhs = cx.ensure_in_register(rhs_id, &[dst])?;
    cx.regs.lock(rhs);
    Ok((dst, rhs))
}

/// Unary opcodes run in place on the operand register, which is then
/// re-tagged as holding the result. The operand value itself stays
/// reloadable from the value buffer.
fn unary_in_place(cx: &mut EmitContext, id: NodeId, node: &Node, op: UnOp) -> CodegenResult<()> {
    let r = cx.ensure_in_register(node.a, &[])?;
    match op {
        UnOp::Neg => cx.isa.emit_neg(cx.ops, r),
        UnOp::Abs => cx.isa.emit_abs(cx.ops, r),
        UnOp::Square => cx.isa.emit_square(cx.ops, r),
        UnOp::Sqrt => cx.isa.emit_sqrt(cx.ops, r),
        UnOp::Recip => cx.isa.emit_recip(cx.ops, r),
    }
    cx.finish_node(r, id);
    Ok(())
}

fn call_unary(cx: &mut EmitContext, id: NodeId, node: &Node, call: LibCall) -> CodegenResult<()> {
    let a = cx.ensure_in_register(node.a, &[])?;
    let dst = cx.alloc_dst(&[a])?;
    cx.isa.emit_call1(cx.ops, dst, a, call, cx.regs);
    cx.finish_node(dst, id);
    Ok(())
}

fn call_pow(cx: &mut EmitContext, id: NodeId, node: &Node) -> CodegenResult<()> {
    let a = ensure_avoiding(cx, node.a, &[node.b])?;
    cx.regs.lock(a);
    let b = cx.ensure_in_register(node.b, &[a])?;
    cx.regs.lock(b);
    let dst = cx.alloc_dst(&[a, b])?;
    cx.isa.emit_call2(cx.ops, dst, a, b, LibCall::Pow, cx.regs);
    cx.regs.unlock(b);
    cx.regs.unlock(a);
    cx.finish_node(dst, id);
    Ok(())
}

fn comparison(
    cx: &mut EmitContext,
    id: NodeId,
    node: &Node,
    cc: CondCode,
    truncate: bool,
) -> CodegenResult<()> {
    let a = ensure_avoiding(cx, node.a, &[node.b])?;
    cx.regs.lock(a);
    let b = cx.ensure_in_register(node.b, &[a])?;
    cx.regs.lock(b);

    let (lhs, rhs);
    let mut temps = Avoid::new();
    if truncate {
        let ta = cx.alloc_temp(&[a, b])?;
        cx.isa.emit_trunc(cx.ops, ta, a);
        let tb = cx.alloc_temp(&[a, b, ta])?;
        cx.isa.emit_trunc(cx.ops, tb, b);
        temps.push(ta);
        temps.push(tb);
        lhs = ta;
        rhs = tb;
    } else {
        lhs = a;
        rhs = b;
    }

    let mut avoid = Avoid::from_slice(&[a, b]);
    avoid.extend_from_slice(&temps);
    let dst = cx.alloc_dst(&avoid)?;
    cx.isa.emit_cmp(cx.ops, dst, lhs, rhs, cc);

    for t in temps {
        cx.release_temp(t);
    }
    cx.finish_node(dst, id);
    cx.regs.unlock(b);
    cx.regs.unlock(a);
    Ok(())
}

fn emit_select(cx: &mut EmitContext, id: NodeId, node: &Node, truncate: bool) -> CodegenResult<()> {
    let cond = ensure_avoiding(cx, node.a, &[node.b, node.c])?;
    cx.regs.lock(cond);
    let t = ensure_avoiding(cx, node.b, &[node.c])?;
    cx.regs.lock(t);
    let f = cx.ensure_in_register(node.c, &[cond, t])?;
    cx.regs.lock(f);

    let (tv, fv);
    let mut temps = Avoid::new();
    if truncate {
        let tt = cx.alloc_temp(&[cond, t, f])?;
        cx.isa.emit_trunc(cx.ops, tt, t);
        let tf = cx.alloc_temp(&[cond, t, f, tt])?;
        cx.isa.emit_trunc(cx.ops, tf, f);
        temps.push(tt);
        temps.push(tf);
        tv = tt;
        fv = tf;
    } else {
        tv = t;
        fv = f;
    }

    let mut avoid = Avoid::from_slice(&[cond, t, f]);
    avoid.extend_from_slice(&temps);
    let dst = cx.alloc_dst(&avoid)?;
    cx.isa.emit_select(cx.ops, dst, cond, tv, fv);
    if truncate {
        cx.isa.emit_trunc(cx.ops, dst, dst);
    }

    for temp in temps {
        cx.release_temp(temp);
    }
    cx.finish_node(dst, id);
    cx.regs.unlock(f);
    cx.regs.unlock(t);
    cx.regs.unlock(cond);
    Ok(())
}

fn emit_bool_or(cx: &mut EmitContext, id: NodeId, node: &Node) -> CodegenResult<()> {
    // a OR b over canonical values as a + b - a*b.
    let a = ensure_avoiding(cx, node.a, &[node.b])?;
    cx.regs.lock(a);
    let b = cx.ensure_in_register(node.b, &[a])?;
    cx.regs.lock(b);

    let sum = cx.alloc_temp(&[a, b])?;
    cx.isa.emit_move(cx.ops, sum, a);
    cx.isa.emit_add(cx.ops, sum, b);
    let prod = cx.alloc_dst(&[a, b, sum])?;
    cx.isa.emit_move(cx.ops, prod, a);
    cx.isa.emit_mul(cx.ops, prod, b);
    cx.isa.emit_sub(cx.ops, sum, prod);

    cx.regs.unlock(sum);
    cx.finish_node(sum, id);
    cx.regs.unlock(b);
    cx.regs.unlock(a);
    Ok(())
}

fn emit_bool_not(cx: &mut EmitContext, id: NodeId, node: &Node) -> CodegenResult<()> {
    // NOT over a canonical value is 1 - x.
    let a = cx.ensure_in_register(node.a, &[])?;
    cx.regs.lock(a);
    let dst = cx.alloc_dst(&[a])?;
    cx.isa.emit_load_imm(cx.ops, dst, 1.0);
    cx.isa.emit_sub(cx.ops, dst, a);
    cx.finish_node(dst, id);
    cx.regs.unlock(a);
    Ok(())
}

#[derive(Copy, Clone)]
enum IntBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Integer arithmetic truncates both operands toward zero, applies the real
/// operation, and truncates the result again, preserving the all-doubles
/// buffer layout.
fn int_binary(cx: &mut EmitContext, id: NodeId, node: &Node, op: IntBinOp) -> CodegenResult<()> {
    let a = ensure_avoiding(cx, node.a, &[node.b])?;
    cx.regs.lock(a);
    let b = cx.ensure_in_register(node.b, &[a])?;
    cx.regs.lock(b);

    let ta = cx.alloc_temp(&[a, b])?;
    cx.isa.emit_trunc(cx.ops, ta, a);
    let tb = cx.alloc_temp(&[a, b, ta])?;
    cx.isa.emit_trunc(cx.ops, tb, b);

    match op {
        IntBinOp::Add => cx.isa.emit_add(cx.ops, ta, tb),
        IntBinOp::Sub => cx.isa.emit_sub(cx.ops, ta, tb),
        IntBinOp::Mul => cx.isa.emit_mul(cx.ops, ta, tb),
        IntBinOp::Div => cx.isa.emit_div(cx.ops, ta, tb),
        IntBinOp::Mod => cx.isa.emit_mod(cx.ops, ta, tb),
    }
    cx.isa.emit_trunc(cx.ops, ta, ta);

    cx.release_temp(tb);
    cx.regs.unlock(ta);
    cx.finish_node(ta, id);
    cx.regs.unlock(b);
    cx.regs.unlock(a);
    Ok(())
}

fn emit_int_neg(cx: &mut EmitContext, id: NodeId, node: &Node) -> CodegenResult<()> {
    let r = cx.ensure_in_register(node.a, &[])?;
    cx.isa.emit_trunc(cx.ops, r, r);
    cx.isa.emit_neg(cx.ops, r);
    cx.finish_node(r, id);
    Ok(())
}

/// Ensure `node` is in a register without evicting the registers of the
/// other operands named in `keep`.
fn ensure_avoiding(cx: &mut EmitContext, node: NodeId, keep: &[NodeId]) -> CodegenResult<u8> {
    let mut avoid = Avoid::new();
    for &other in keep {
        if other != NO_NODE {
            if let Some(slot) = cx.regs.find(other) {
                avoid.push(slot);
            }
        }
    }
    cx.ensure_in_register(node, &avoid)
}
