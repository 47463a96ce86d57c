//! SSE2 scalar backend: one double per lane.
//!
//! Uses the `sd`-suffixed scalar instructions on the low 64 bits of the
//! `xmm` file. `xmm15` is the backend scratch. Value-buffer slots are eight
//! bytes apart, so node `n` lives at `[rbx + 8n]` and its gradient at
//! `[r12 + 8n]`.

use crate::ir::{CondCode, NodeId};
use crate::isa::{Assembler, LibCall, VectorIsa};
use crate::regalloc::RegisterFile;
use crate::runtime::{TraceRing, TRACE_CAPACITY};
use dynasm::dynasm;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi};

/// Stack frame reserved below the saved registers: ten 16-byte vector slots.
const FRAME_BYTES: i32 = 160;

/// Unordered not-equal predicate for `cmpsd`.
const CMP_NEQ_UQ: i8 = 4;

/// `roundsd` immediate for round-toward-zero with exceptions suppressed.
const ROUND_TRUNC: i8 = 0b1011;

const SCRATCH: u8 = 15;

fn disp(node: NodeId) -> i32 {
    (node as i64 * 8) as i32
}

/// The scalar instruction set.
pub struct ScalarIsa;

impl VectorIsa for ScalarIsa {
    fn name(&self) -> &'static str {
        "SSE2-Scalar"
    }

    fn vector_width(&self) -> usize {
        1
    }

    fn buffer_alignment(&self) -> usize {
        16
    }

    fn supports_three_operand(&self) -> bool {
        false
    }

    fn supports_trace(&self) -> bool {
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
            ; ret
        );
    }

    fn emit_move(&self, ops: &mut Assembler, dst: u8, src: u8) {
        if dst != src {
            dynasm!(ops ; .arch x64 ; movsd Rx(dst), Rx(src));
        }
    }

    fn emit_add(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; addsd Rx(dst), Rx(src));
    }

    fn emit_sub(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; subsd Rx(dst), Rx(src));
    }

    fn emit_mul(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; mulsd Rx(dst), Rx(src));
    }

    fn emit_div(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; divsd Rx(dst), Rx(src));
    }

    fn emit_add3(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8) {
        self.emit_move(ops, dst, a);
        self.emit_add(ops, dst, b);
    }

    fn emit_sub3(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8) {
        self.emit_move(ops, dst, a);
        self.emit_sub(ops, dst, b);
    }

    fn emit_mul3(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8) {
        self.emit_move(ops, dst, a);
        self.emit_mul(ops, dst, b);
    }

    fn emit_div3(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8) {
        self.emit_move(ops, dst, a);
        self.emit_div(ops, dst, b);
    }

    fn emit_neg(&self, ops: &mut Assembler, dst: u8) {
        // Flip the sign bit: all-ones shifted left 63.
        dynasm!(ops
            ; .arch x64
            ; pcmpeqd Rx(SCRATCH), Rx(SCRATCH)
            ; psllq Rx(SCRATCH), 63
            ; xorpd Rx(dst), Rx(SCRATCH)
        );
    }

    fn emit_abs(&self, ops: &mut Assembler, dst: u8) {
        // Clear the sign bit: all-ones shifted right 1.
        dynasm!(ops
            ; .arch x64
            ; pcmpeqd Rx(SCRATCH), Rx(SCRATCH)
            ; psrlq Rx(SCRATCH), 1
            ; andpd Rx(dst), Rx(SCRATCH)
        );
    }

    fn emit_square(&self, ops: &mut Assembler, dst: u8) {
        dynasm!(ops ; .arch x64 ; mulsd Rx(dst), Rx(dst));
    }

    fn emit_sqrt(&self, ops: &mut Assembler, dst: u8) {
        dynasm!(ops ; .arch x64 ; sqrtsd Rx(dst), Rx(dst));
    }

    fn emit_recip(&self, ops: &mut Assembler, dst: u8) {
        self.emit_load_imm(ops, SCRATCH, 1.0);
        dynasm!(ops
            ; .arch x64
            ; divsd Rx(SCRATCH), Rx(dst)
            ; movsd Rx(dst), Rx(SCRATCH)
        );
    }

    fn emit_mod(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops
            ; .arch x64
            ; movsd Rx(SCRATCH), Rx(dst)
            ; divsd Rx(SCRATCH), Rx(src)
            ; roundsd Rx(SCRATCH), Rx(SCRATCH), ROUND_TRUNC
            ; mulsd Rx(SCRATCH), Rx(src)
            ; subsd Rx(dst), Rx(SCRATCH)
        );
    }

    fn emit_min(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; minsd Rx(dst), Rx(src));
    }

    fn emit_max(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; maxsd Rx(dst), Rx(src));
    }

    fn emit_trunc(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; roundsd Rx(dst), Rx(src), ROUND_TRUNC);
    }

    fn emit_cmp(&self, ops: &mut Assembler, dst: u8, lhs: u8, rhs: u8, cc: CondCode) {
        self.emit_cmp_mask(ops, dst, lhs, rhs, cc);
        // AND the mask with the bit pattern of 1.0 for the canonical
        // {0.0, 1.0} encoding.
        self.emit_load_imm(ops, SCRATCH, 1.0);
        dynasm!(ops ; .arch x64 ; andpd Rx(dst), Rx(SCRATCH));
    }

    fn emit_cmp_mask(&self, ops: &mut Assembler, dst: u8, lhs: u8, rhs: u8, cc: CondCode) {
        debug_assert!(dst != lhs && dst != rhs);
        // The greater-than forms have no predicate; compare swapped.
        let (first, second, cc) = match cc {
            CondCode::GreaterThan | CondCode::GreaterThanOrEqual => (rhs, lhs, cc.swapped_args()),
            _ => (lhs, rhs, cc),
        };
        self.emit_move(ops, dst, first);
        let pred = cc.sse_predicate();
        dynasm!(ops ; .arch x64 ; cmpsd Rx(dst), Rx(second), pred);
    }

    fn emit_mask_from_bool(&self, ops: &mut Assembler, dst: u8, src: u8) {
        debug_assert!(dst != src);
        dynasm!(ops
            ; .arch x64
            ; xorpd Rx(SCRATCH), Rx(SCRATCH)
            ; movsd Rx(dst), Rx(src)
            ; cmpsd Rx(dst), Rx(SCRATCH), CMP_NEQ_UQ
        );
    }

    fn emit_select(&self, ops: &mut Assembler, dst: u8, cond: u8, t: u8, f: u8) {
        debug_assert!(dst != cond && dst != t && dst != f);
        self.emit_mask_from_bool(ops, dst, cond);
        dynasm!(ops
            ; .arch x64
            ; movsd Rx(SCRATCH), Rx(t)
            ; andpd Rx(SCRATCH), Rx(dst)
            ; andnpd Rx(dst), Rx(f)
            ; orpd Rx(dst), Rx(SCRATCH)
        );
    }

    fn emit_and(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; andpd Rx(dst), Rx(src));
    }

    fn emit_or(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; orpd Rx(dst), Rx(src));
    }

    fn emit_xor(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; xorpd Rx(dst), Rx(src));
    }

    fn emit_andnot(&self, ops: &mut Assembler, dst: u8, src: u8) {
        dynasm!(ops ; .arch x64 ; andnpd Rx(dst), Rx(src));
    }

    fn emit_all_ones(&self, ops: &mut Assembler, dst: u8) {
        dynasm!(ops ; .arch x64 ; pcmpeqd Rx(dst), Rx(dst));
    }

    fn emit_shl(&self, ops: &mut Assembler, dst: u8, bits: i8) {
        dynasm!(ops ; .arch x64 ; psllq Rx(dst), bits);
    }

    fn emit_shr(&self, ops: &mut Assembler, dst: u8, bits: i8) {
        dynasm!(ops ; .arch x64 ; psrlq Rx(dst), bits);
    }

    fn emit_zero(&self, ops: &mut Assembler, dst: u8) {
        dynasm!(ops ; .arch x64 ; xorpd Rx(dst), Rx(dst));
    }

    fn emit_load_imm(&self, ops: &mut Assembler, dst: u8, value: f64) {
        let bits = value.to_bits() as i64;
        dynasm!(ops
            ; .arch x64
            ; mov rax, QWORD bits
            ; movq Rx(dst), rax
        );
    }

    fn emit_load_value(&self, ops: &mut Assembler, dst: u8, node: NodeId) {
        let off = disp(node);
        dynasm!(ops ; .arch x64 ; movsd Rx(dst), [rbx + off]);
    }

    fn emit_store_value(&self, ops: &mut Assembler, src: u8, node: NodeId) {
        let off = disp(node);
        dynasm!(ops ; .arch x64 ; movsd [rbx + off], Rx(src));
    }

    fn emit_load_const(&self, ops: &mut Assembler, dst: u8, label: DynamicLabel) {
        dynasm!(ops ; .arch x64 ; movsd Rx(dst), [=>label]);
    }

    fn emit_load_grad(&self, ops: &mut Assembler, dst: u8, node: NodeId) {
        let off = disp(node);
        dynasm!(ops ; .arch x64 ; movsd Rx(dst), [r12 + off]);
    }

    fn emit_store_grad(&self, ops: &mut Assembler, src: u8, node: NodeId) {
        let off = disp(node);
        dynasm!(ops ; .arch x64 ; movsd [r12 + off], Rx(src));
    }

    fn emit_accum_grad(&self, ops: &mut Assembler, src: u8, node: NodeId) {
        let off = disp(node);
        dynasm!(ops
            ; .arch x64
            ; movsd Rx(SCRATCH), [r12 + off]
            ; addsd Rx(SCRATCH), Rx(src)
            ; movsd [r12 + off], Rx(SCRATCH)
        );
    }

    fn emit_call1(&self, ops: &mut Assembler, dst: u8, src: u8, call: LibCall,
        regs: &mut RegisterFile)
    {
        if src != 0 {
            dynasm!(ops ; .arch x64 ; movsd Rx(0), Rx(src));
        }
        let target = call.address();
        dynasm!(ops
            ; .arch x64
            ; mov rax, QWORD target
            ; call rax
        );
        regs.invalidate_volatile();
        if dst != 0 {
            dynasm!(ops ; .arch x64 ; movsd Rx(dst), Rx(0));
        }
    }

    fn emit_call2(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8, call: LibCall,
        regs: &mut RegisterFile)
    {
        // Stage a into xmm0 and b into xmm1 without clobbering either.
        if b == 0 {
            if a == 1 {
                dynasm!(ops
                    ; .arch x64
                    ; movsd Rx(SCRATCH), Rx(0)
                    ; movsd Rx(0), Rx(1)
                    ; movsd Rx(1), Rx(SCRATCH)
                );
            } else {
                dynasm!(ops ; .arch x64 ; movsd Rx(1), Rx(0));
                if a != 0 {
                    dynasm!(ops ; .arch x64 ; movsd Rx(0), Rx(a));
                }
            }
        } else {
            if a != 0 {
                dynasm!(ops ; .arch x64 ; movsd Rx(0), Rx(a));
            }
            if b != 1 {
                dynasm!(ops ; .arch x64 ; movsd Rx(1), Rx(b));
            }
        }
        let target = call.address();
        dynasm!(ops
            ; .arch x64
            ; mov rax, QWORD target
            ; call rax
        );
        regs.invalidate_volatile();
        if dst != 0 {
            dynasm!(ops ; .arch x64 ; movsd Rx(dst), Rx(0));
        }
    }

    fn emit_trace(&self, ops: &mut Assembler, ring: *mut TraceRing, node: NodeId, src: u8) {
        let mask = (TRACE_CAPACITY - 1) as i32;
        let base = ring as i64;
        let id = node as i32;
        dynasm!(ops
            ; .arch x64
            ; mov rcx, QWORD base
            ; mov rax, [rcx]
            ; mov rdx, rax
            ; and rdx, mask
            ; shl rdx, 4
            ; mov QWORD [rcx + rdx + 16], id
            ; movsd [rcx + rdx + 24], Rx(src)
            ; add rax, 1
            ; mov [rcx], rax
        );
    }
}
