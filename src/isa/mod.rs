//! Instruction set abstraction.
//!
//! Every byte the compiler emits goes through the [`VectorIsa`] trait, which
//! exposes one emission primitive per operation family plus memory moves,
//! mask construction, and ABI glue. There are exactly two implementations: a
//! scalar one operating on one double per lane and a packed one operating on
//! four doubles per lane. The emitters never name a concrete instruction
//! themselves, so the choice of width is invisible to them.
//!
//! Register conventions of the emitted function, which uses the System V
//! x86-64 calling convention regardless of host OS:
//!
//! | Register | Role                                        |
//! |----------|---------------------------------------------|
//! | `rdi`    | values pointer argument                     |
//! | `rsi`    | gradients pointer argument (may be null)    |
//! | `rdx`    | lane-group count argument                   |
//! | `rbx`    | values base for the body (callee-saved)     |
//! | `r12`    | gradients base for the body (callee-saved)  |
//! | `rax`, `rcx`, `rdx` | scratch for immediates, callouts, tracing |
//! | vector 0..=14 | allocatable register file              |
//! | vector 15 | backend-private scratch, blacklisted       |
//!
//! The base pointers live in callee-saved registers so they survive math
//! callouts. System V classifies all vector registers as caller-saved, so
//! the whole file is treated as volatile across a callout; correctness
//! relies on every node value being written back to the value buffer as soon
//! as it is computed.

pub(crate) mod packed;
pub(crate) mod scalar;

use crate::ir::{CondCode, NodeId};
use crate::regalloc::{RegisterFile, NUM_REGS};
use crate::runtime::TraceRing;
use core::ops::Range;
use dynasmrt::DynamicLabel;

/// The runtime assembler the backends emit into.
pub type Assembler = dynasmrt::x64::Assembler;

/// Which instruction set to compile for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IsaKind {
    /// SSE2 scalar double operations, one lane.
    Scalar,
    /// AVX2 packed double operations, four lanes.
    Packed4,
}

impl IsaKind {
    /// Parse an instruction-set name as used by the configuration
    /// environment variable. Both the short and the descriptive spellings
    /// are accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "scalar" | "SSE2-Scalar" | "SSE2" => Some(Self::Scalar),
            "packed4" | "AVX2-Packed" | "AVX2" => Some(Self::Packed4),
            _ => None,
        }
    }

    /// Doubles processed per lane group.
    pub fn vector_width(self) -> usize {
        match self {
            Self::Scalar => 1,
            Self::Packed4 => 4,
        }
    }
}

/// Construct the backend for an instruction-set kind.
pub fn lookup(kind: IsaKind) -> Box<dyn VectorIsa> {
    match kind {
        IsaKind::Scalar => Box::new(scalar::ScalarIsa),
        IsaKind::Packed4 => Box::new(packed::PackedIsa),
    }
}

/// A math-library routine the emitted code may call.
///
/// The targets are `extern "sysv64"` wrappers over the Rust `f64` methods,
/// so the emitted call sequence is identical on every host OS.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LibCall {
    /// `exp(x)`.
    Exp,
    /// `ln(x)`.
    Log,
    /// `sin(x)`.
    Sin,
    /// `cos(x)`.
    Cos,
    /// `tan(x)`.
    Tan,
    /// `pow(x, y)`; the only two-argument routine.
    Pow,
}

extern "sysv64" fn call_exp(x: f64) -> f64 {
    x.exp()
}
extern "sysv64" fn call_log(x: f64) -> f64 {
    x.ln()
}
extern "sysv64" fn call_sin(x: f64) -> f64 {
    x.sin()
}
extern "sysv64" fn call_cos(x: f64) -> f64 {
    x.cos()
}
extern "sysv64" fn call_tan(x: f64) -> f64 {
    x.tan()
}
extern "sysv64" fn call_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

impl LibCall {
    /// Absolute address of the routine, for an indirect `call` through
    /// `rax`.
    pub fn address(self) -> i64 {
        match self {
            Self::Exp => call_exp as usize as i64,
            Self::Log => call_log as usize as i64,
            Self::Sin => call_sin as usize as i64,
            Self::Cos => call_cos as usize as i64,
            Self::Tan => call_tan as usize as i64,
            Self::Pow => call_pow as usize as i64,
        }
    }
}

/// The capability set a code generation backend provides.
///
/// Register operands are indices into the vector register file; the backend
/// maps them onto `xmm` or `ymm` registers. Destructive two-operand forms
/// overwrite `dst` in place; the three-operand forms take distinct sources
/// and are native on the packed backend. `emit_cmp` produces the canonical
/// 0.0/1.0 encoding, `emit_cmp_mask` the raw all-ones/all-zeros mask.
pub trait VectorIsa {
    /// Descriptive backend name, also accepted by `IsaKind::from_name`.
    fn name(&self) -> &'static str;

    /// Doubles per lane group.
    fn vector_width(&self) -> usize;

    /// Minimum alignment of the value and gradient buffers in bytes.
    fn buffer_alignment(&self) -> usize;

    /// The backend-private scratch register. Must be blacklisted in the
    /// allocator before emission starts.
    fn scratch(&self) -> u8 {
        15
    }

    /// Register-file slots the ABI treats as caller-saved across callouts.
    /// Under System V that is the entire file.
    fn volatile_range(&self) -> Range<usize> {
        0..NUM_REGS
    }

    /// Whether the backend has native non-destructive three-operand forms.
    fn supports_three_operand(&self) -> bool;

    /// Whether `emit_trace` emits anything.
    fn supports_trace(&self) -> bool {
        false
    }

    /// Function prologue: stack frame, callee-saved GP spills, and the move
    /// of the argument pointers into their body registers.
    fn emit_prologue(&self, ops: &mut Assembler);

    /// Function epilogue, mirroring the prologue, ending in `ret`.
    fn emit_epilogue(&self, ops: &mut Assembler);

    /// Save the callee-saved part of the vector file. System V has none,
    /// so the default emits nothing.
    fn emit_save_callee_regs(&self, _ops: &mut Assembler) {}

    /// Restore the callee-saved part of the vector file.
    fn emit_restore_callee_regs(&self, _ops: &mut Assembler) {}

    /// `dst = src`. No code when the indices are equal.
    fn emit_move(&self, ops: &mut Assembler, dst: u8, src: u8);

    /// `dst += src`.
    fn emit_add(&self, ops: &mut Assembler, dst: u8, src: u8);
    /// `dst -= src`.
    fn emit_sub(&self, ops: &mut Assembler, dst: u8, src: u8);
    /// `dst *= src`.
    fn emit_mul(&self, ops: &mut Assembler, dst: u8, src: u8);
    /// `dst /= src`.
    fn emit_div(&self, ops: &mut Assembler, dst: u8, src: u8);

    /// `dst = a + b`.
    fn emit_add3(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8);
    /// `dst = a - b`.
    fn emit_sub3(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8);
    /// `dst = a * b`.
    fn emit_mul3(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8);
    /// `dst = a / b`.
    fn emit_div3(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8);

    /// `dst = -dst`, via the sign-bit mask.
    fn emit_neg(&self, ops: &mut Assembler, dst: u8);
    /// `dst = |dst|`, via the sign-bit mask.
    fn emit_abs(&self, ops: &mut Assembler, dst: u8);
    /// `dst = dst * dst`.
    fn emit_square(&self, ops: &mut Assembler, dst: u8);
    /// `dst = sqrt(dst)`, native instruction.
    fn emit_sqrt(&self, ops: &mut Assembler, dst: u8);
    /// `dst = 1 / dst`.
    fn emit_recip(&self, ops: &mut Assembler, dst: u8);
    /// `dst = dst - src * trunc(dst / src)`.
    fn emit_mod(&self, ops: &mut Assembler, dst: u8, src: u8);
    /// `dst = min(dst, src)`, native instruction.
    fn emit_min(&self, ops: &mut Assembler, dst: u8, src: u8);
    /// `dst = max(dst, src)`, native instruction.
    fn emit_max(&self, ops: &mut Assembler, dst: u8, src: u8);
    /// `dst = trunc(src)`, round toward zero.
    fn emit_trunc(&self, ops: &mut Assembler, dst: u8, src: u8);

    /// Ordered comparison producing the canonical 0.0/1.0 real. `dst` must
    /// be distinct from both operands.
    fn emit_cmp(&self, ops: &mut Assembler, dst: u8, lhs: u8, rhs: u8, cc: CondCode);

    /// Ordered comparison producing the raw all-ones/all-zeros mask. `dst`
    /// must be distinct from both operands.
    fn emit_cmp_mask(&self, ops: &mut Assembler, dst: u8, lhs: u8, rhs: u8, cc: CondCode);

    /// Normalize a 0.0/1.0 value into an all-ones/all-zeros mask by
    /// comparing against zero. `dst` must be distinct from `src`.
    fn emit_mask_from_bool(&self, ops: &mut Assembler, dst: u8, src: u8);

    /// `dst = cond != 0 ? t : f`, blend-free via and/andnot/or. `dst` must
    /// be distinct from all three operands.
    fn emit_select(&self, ops: &mut Assembler, dst: u8, cond: u8, t: u8, f: u8);

    /// Bitwise `dst &= src`.
    fn emit_and(&self, ops: &mut Assembler, dst: u8, src: u8);
    /// Bitwise `dst |= src`.
    fn emit_or(&self, ops: &mut Assembler, dst: u8, src: u8);
    /// Bitwise `dst ^= src`.
    fn emit_xor(&self, ops: &mut Assembler, dst: u8, src: u8);
    /// Bitwise `dst = !dst & src`.
    fn emit_andnot(&self, ops: &mut Assembler, dst: u8, src: u8);
    /// All bits of every lane set.
    fn emit_all_ones(&self, ops: &mut Assembler, dst: u8);
    /// Shift each 64-bit lane left by a bit count.
    fn emit_shl(&self, ops: &mut Assembler, dst: u8, bits: i8);
    /// Shift each 64-bit lane right by a bit count.
    fn emit_shr(&self, ops: &mut Assembler, dst: u8, bits: i8);
    /// `dst = 0.0` in every lane.
    fn emit_zero(&self, ops: &mut Assembler, dst: u8);

    /// Load a literal into every lane of `dst`, staged through `rax`.
    fn emit_load_imm(&self, ops: &mut Assembler, dst: u8, value: f64);

    /// Load `values[node]` into `dst`.
    fn emit_load_value(&self, ops: &mut Assembler, dst: u8, node: NodeId);
    /// Store `src` into `values[node]`.
    fn emit_store_value(&self, ops: &mut Assembler, src: u8, node: NodeId);
    /// Load a pool constant into every lane of `dst`, RIP-relative.
    fn emit_load_const(&self, ops: &mut Assembler, dst: u8, label: DynamicLabel);
    /// Load `gradients[node]` into `dst`.
    fn emit_load_grad(&self, ops: &mut Assembler, dst: u8, node: NodeId);
    /// Store `src` into `gradients[node]`.
    fn emit_store_grad(&self, ops: &mut Assembler, src: u8, node: NodeId);
    /// `gradients[node] += src`, staged through the scratch register.
    fn emit_accum_grad(&self, ops: &mut Assembler, src: u8, node: NodeId);

    /// Call a one-argument math routine lane-wise: `dst = f(src)`.
    ///
    /// The implementation stages the argument, performs the call with the
    /// stack correctly aligned, invalidates the volatile range in the
    /// allocator, and moves the result into `dst`. `dst` must have been
    /// allocated before the call; its previous contents need no saving.
    fn emit_call1(&self, ops: &mut Assembler, dst: u8, src: u8, call: LibCall,
        regs: &mut RegisterFile);

    /// Call a two-argument math routine lane-wise: `dst = f(a, b)`.
    fn emit_call2(&self, ops: &mut Assembler, dst: u8, a: u8, b: u8, call: LibCall,
        regs: &mut RegisterFile);

    /// Append a `{node, value}` record to the trace ring. A backend that
    /// does not support tracing emits nothing.
    fn emit_trace(&self, _ops: &mut Assembler, _ring: *mut TraceRing, _node: NodeId, _src: u8) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isa_names_map_to_kinds() {
        assert_eq!(IsaKind::from_name("scalar"), Some(IsaKind::Scalar));
        assert_eq!(IsaKind::from_name("SSE2-Scalar"), Some(IsaKind::Scalar));
        assert_eq!(IsaKind::from_name("SSE2"), Some(IsaKind::Scalar));
        assert_eq!(IsaKind::from_name("packed4"), Some(IsaKind::Packed4));
        assert_eq!(IsaKind::from_name("AVX2-Packed"), Some(IsaKind::Packed4));
        assert_eq!(IsaKind::from_name("AVX2"), Some(IsaKind::Packed4));
        assert_eq!(IsaKind::from_name("NEON"), None);
    }

    #[test]
    fn widths() {
        assert_eq!(IsaKind::Scalar.vector_width(), 1);
        assert_eq!(IsaKind::Packed4.vector_width(), 4);
        assert_eq!(lookup(IsaKind::Scalar).vector_width(), 1);
        assert_eq!(lookup(IsaKind::Packed4).vector_width(), 4);
    }

    #[test]
    fn libcalls_have_distinct_addresses() {
        let calls = [
            LibCall::Exp,
            LibCall::Log,
            LibCall::Sin,
            LibCall::Cos,
            LibCall::Tan,
            LibCall::Pow,
        ];
        for (i, a) in calls.iter().enumerate() {
            assert_ne!(a.address(), 0);
            for b in &calls[i + 1..] {
                assert_ne!(a.address(), b.address());
            }
        }
    }
}
