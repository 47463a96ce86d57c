//! AVX2 packed backend: four doubles per lane group.
//!
//! Uses the VEX-encoded `pd` instructions on the `ymm` file, so most
//! operations get a native non-destructive three-operand form. `ymm15` is
//! the backend scratch. Value-buffer slots are 32 bytes apart and the
//! buffers are 32-byte aligned, so every slot access can use aligned moves.
//!
//! Transcendentals have no packed equivalent in the math library; each lane
//! is staged to the stack and processed by a scalar callout, then the
//! destination is reassembled from the staging area.

use crate::ir::{CondCode, NodeId};
use crate::isa::{Assembler, LibCall, VectorIsa};
use crate::regalloc::RegisterFile;
use dynasm::dynasm;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi};

/// Stack frame below the saved registers: ten 32-byte vector slots. The low
/// 64 bytes double as the lane staging area for callouts.
const FRAME_BYTES: i32 = 320;

const CMP_NEQ_UQ: i8 = 4;
const ROUND_TRUNC: i8 = 0b1011;
const SCRATCH: u8 = 15;

fn disp(node: NodeId) -> i32 {
    (node as i64 * 32) as i32
}

/// The packed instruction set.
pub struct PackedIsa;

impl PackedIsa {
    fn emit_call_indirect(&self, ops: &mut Assembler, call: LibCall) {
        let target = call.address();
        dynasm!(ops
            ; .arch x64
            ; mov rax, QWORD target
            ; call rax
        );
    }
}

impl VectorIsa for PackedIsa {
    fn name(&self) -> &'static str {
        "AVX2-Packed"
    }

    fn vector_width(&self) -> usize {
        4
    }

    fn buffer_alignment(&self) -> usize {
        32
    }

    fn supports_three_operand(&self) -> bool {
        true
    }

    fn emit_prologue(&self, ops: &mut Assembler) {
        dynasm!(ops
            ; .arch x64
            ; push rbp
            ; mov rbp, rsp
            ; push rbx
            ; push r12
            ; sub rsp, FRAME_BYTES
            ; mov rbx, rdi
            ; mov r12, rsi
        );
    }

    fn emit_epilogue(&self, ops: &mut Assembler) {
        dynasm!(ops
            ; .arch x64
            ; add rsp, FRAME_BYTES
            ; pop r12
            ; pop rbx
            ; pop rbp
            ; vzeroupper
            ; ret
        );
    }

    fn emit_move(&self, ops: &mut Assembler, dst: u8, src: u8) {
        if dst != src {
            dynasm!(ops ; .arch x64 ; vmovapd Ry(dst), Ry(src));
        }
    }

    fn emit_add(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; vaddpd Ry(dst), Ry(dst), Ry(src));
    }

    fn emit_sub(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; vsubpd Ry(dst), Ry(dst), Ry(src));
    }

    fn emit_mul(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; vmulpd Ry(dst), Ry(dst), Ry(src));
    }

    fn emit_div(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; vdivpd Ry(dst), Ry(dst), Ry(src));
    }

    fn emit_add3(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8) {
        dynasm!(ops ; .arch x64 ; vaddpd Ry(dst), Ry(a), Ry(b));
    }

    fn emit_sub3(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8) {
        dynasm!(ops ; .arch x64 ; vsubpd Ry(dst), Ry(a), Ry(b));
    }

    fn emit_mul3(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8) {
        dynasm!(ops ; .arch x64 ; vmulpd Ry(dst), Ry(a), Ry(b));
    }

    fn emit_div3(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8) {
        dynasm!(ops ; .arch x64 ; vdivpd Ry(dst), Ry(a), Ry(b));
    }

    fn emit_neg(&self, ops: &mut Assembler, dst: u8) {
        dynasm!(ops
            ; .arch x64
            ; vpcmpeqd Ry(SCRATCH), Ry(SCRATCH), Ry(SCRATCH)
            ; vpsllq Ry(SCRATCH), Ry(SCRATCH), 63
            ; vxorpd Ry(dst), Ry(dst), Ry(SCRATCH)
        );
    }

    fn emit_abs(&self, ops: &mut Assembler, dst: u8) {
        dynasm!(ops
            ; .arch x64
            ; vpcmpeqd Ry(SCRATCH), Ry(SCRATCH), Ry(SCRATCH)
            ; vpsrlq Ry(SCRATCH), Ry(SCRATCH), 1
            ; vandpd Ry(dst), Ry(dst), Ry(SCRATCH)
        );
    }

    fn emit_square(&self, ops: &mut Assembler, dst: u8) {
        dynasm!(ops ; .arch x64 ; vmulpd Ry(dst), Ry(dst), Ry(dst));
    }

    fn emit_sqrt(&self, ops: &mut Assembler, dst: u8) {
        dynasm!(ops ; .arch x64 ; vsqrtpd Ry(dst), Ry(dst));
    }

    fn emit_recip(&self, ops: &mut Assembler, dst: u8) {
        self.emit_load_imm(ops, SCRATCH, 1.0);
        dynasm!(ops ; .arch x64 ; vdivpd Ry(dst), Ry(SCRATCH), Ry(dst));
    }

    fn emit_mod(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops
            ; .arch x64
            ; vdivpd Ry(SCRATCH), Ry(dst), Ry(src)
            ; vroundpd Ry(SCRATCH), Ry(SCRATCH), ROUND_TRUNC
            ; vmulpd Ry(SCRATCH), Ry(SCRATCH), Ry(src)
            ; vsubpd Ry(dst), Ry(dst), Ry(SCRATCH)
        );
    }

    fn emit_min(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; vminpd Ry(dst), Ry(dst), Ry(src));
    }

    fn emit_max(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; vmaxpd Ry(dst), Ry(dst), Ry(src));
    }

    fn emit_trunc(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; vroundpd Ry(dst), Ry(src), ROUND_TRUNC);
    }

    fn emit_cmp(&self, ops: &mut Assembler, dst: u8, lhs: u8, rhs: u8, cc: CondCode) {
        self.emit_cmp_mask(ops, dst, lhs, rhs, cc);
        self.emit_load_imm(ops, SCRATCH, 1.0);
        dynasm!(ops ; .arch x64 ; vandpd Ry(dst), Ry(dst), Ry(SCRATCH));
    }

    fn emit_cmp_mask(&self, ops: &mut Assembler, dst: u8, lhs: u8, rhs: u8, cc: CondCode) {
        let (first, second, cc) = match cc {
            CondCode::GreaterThan | CondCode::GreaterThanOrEqual => (rhs, lhs, cc.swapped_args()),
            _ => (lhs, rhs, cc),
        };
        let pred = cc.sse_predicate();
        dynasm!(ops ; .arch x64 ; vcmppd Ry(dst), Ry(first), Ry(second), pred);
    }

    fn emit_mask_from_bool(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops
            ; .arch x64
            ; vxorpd Ry(SCRATCH), Ry(SCRATCH), Ry(SCRATCH)
            ; vcmppd Ry(dst), Ry(src), Ry(SCRATCH), CMP_NEQ_UQ
        );
    }

    fn emit_select(&self, ops: &mut Assembler, dst: u8, cond: u8, t: u8, f: u8) {
        debug_assert!(dst != cond && dst != t && dst != f);
        self.emit_mask_from_bool(ops, dst, cond);
        dynasm!(ops
            ; .arch x64
            ; vandpd Ry(SCRATCH), Ry(t), Ry(dst)
            ; vandnpd Ry(dst), Ry(dst), Ry(f)
            ; vorpd Ry(dst), Ry(dst), Ry(SCRATCH)
        );
    }

    fn emit_and(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; vandpd Ry(dst), Ry(dst), Ry(src));
    }

    fn emit_or(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; vorpd Ry(dst), Ry(dst), Ry(src));
    }

    fn emit_xor(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; vxorpd Ry(dst), Ry(dst), Ry(src));
    }

    fn emit_andnot(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; vandnpd Ry(dst), Ry(dst), Ry(src));
    }

    fn emit_all_ones(&self, ops: &mut Assembler, dst: u8) {
        dynasm!(ops ; .arch x64 ; vpcmpeqd Ry(dst), Ry(dst), Ry(dst));
    }

    fn emit_shl(&self, ops: &mut Assembler, dst: u8, bits: i8) {
        dynasm!(ops ; .arch x64 ; vpsllq Ry(dst), Ry(dst), bits);
    }

    fn emit_shr(&self, ops: &mut Assembler, dst: u8, bits: i8) {
        dynasm!(ops ; .arch x64 ; vpsrlq Ry(dst), Ry(dst), bits);
    }

    fn emit_zero(&self, ops: &mut Assembler, dst: u8) {
        dynasm!(ops ; .arch x64 ; vxorpd Ry(dst), Ry(dst), Ry(dst));
    }

    fn emit_load_imm(&self, ops: &mut Assembler, dst: u8, value: f64) {
        let bits = value.to_bits() as i64;
        dynasm!(ops
            ; .arch x64
            ; mov rax, QWORD bits
            ; vmovq Rx(dst), rax
            ; vbroadcastsd Ry(dst), Rx(dst)
        );
    }

    fn emit_load_value(&self, ops: &mut Assembler, dst: u8, node: NodeId) {
        let off = disp(node);
        dynasm!(ops ; .arch x64 ; vmovapd Ry(dst), [rbx + off]);
    }

    fn emit_store_value(&self, ops: &mut Assembler, src: u8, node: NodeId) {
        let off = disp(node);
        dynasm!(ops ; .arch x64 ; vmovapd [rbx + off], Ry(src));
    }

    fn emit_load_const(&self, ops: &mut Assembler, dst: u8, label: DynamicLabel) {
        // The pool stores one 8-byte copy of each constant; broadcast it.
        dynasm!(ops ; .arch x64 ; vbroadcastsd Ry(dst), [=>label]);
    }

    fn emit_load_grad(&self, ops: &mut Assembler, dst: u8, node: NodeId) {
        let off = disp(node);
        dynasm!(ops ; .arch x64 ; vmovapd Ry(dst), [r12 + off]);
    }

    fn emit_store_grad(&self, ops: &mut Assembler, src: u8, node: NodeId) {
        let off = disp(node);
        dynasm!(ops ; .arch x64 ; vmovapd [r12 + off], Ry(src));
    }

    fn emit_accum_grad(&self, ops: &mut Assembler, src: u8, node: NodeId) {
        let off = disp(node);
        dynasm!(ops
            ; .arch x64
            ; vmovapd Ry(SCRATCH), [r12 + off]
            ; vaddpd Ry(SCRATCH), Ry(SCRATCH), Ry(src)
            ; vmovapd [r12 + off], Ry(SCRATCH)
        );
    }

    fn emit_call1(&self, ops: &mut Assembler, dst: u8, src: u8, call: LibCall,
        regs: &mut RegisterFile)
    {
        dynasm!(ops
            ; .arch x64
            ; vmovupd [rsp], Ry(src)
            ; vzeroupper
        );
        for lane in 0..4i32 {
            let off = lane * 8;
            dynasm!(ops ; .arch x64 ; movsd Rx(0), [rsp + off]);
            self.emit_call_indirect(ops, call);
            dynasm!(ops ; .arch x64 ; movsd [rsp + off], Rx(0));
        }
        regs.invalidate_volatile();
        dynasm!(ops ; .arch x64 ; vmovupd Ry(dst), [rsp]);
    }

    fn emit_call2(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8, call: LibCall,
        regs: &mut RegisterFile)
    {
        dynasm!(ops
            ; .arch x64
            ; vmovupd [rsp], Ry(a)
            ; vmovupd [rsp + 32], Ry(b)
            ; vzeroupper
        );
        for lane in 0..4i32 {
            let off = lane * 8;
            let off_b = 32 + off;
            dynasm!(ops
                ; .arch x64
                ; movsd Rx(0), [rsp + off]
                ; movsd Rx(1), [rsp + off_b]
            );
            self.emit_call_indirect(ops, call);
            dynasm!(ops ; .arch x64 ; movsd [rsp + off], Rx(0));
        }
        regs.invalidate_volatile();
        dynasm!(ops ; .arch x64 ; vmovupd Ry(dst), [rsp]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_function_assembles() {
        let isa = PackedIsa;
        let mut ops = Assembler::new().unwrap();
        isa.emit_prologue(&mut ops);
        isa.emit_epilogue(&mut ops);
        let buf = ops.finalize().ok().unwrap();
        assert!(buf.len() > 8);
    }

    #[test]
    fn packed_arithmetic_assembles() {
        let isa = PackedIsa;
        let mut ops = Assembler::new().unwrap();
        isa.emit_load_value(&mut ops, 0, 1);
        isa.emit_load_value(&mut ops, 1, 2);
        isa.emit_add3(&mut ops, 2, 0, 1);
        isa.emit_store_value(&mut ops, 2, 3);
        let buf = ops.finalize().ok().unwrap();
        assert!(!buf.is_empty());
    }
}
