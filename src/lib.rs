//! Tapelift code generation library.
//!
//! Tapelift compiles a caller-assembled dataflow graph of double-precision
//! operations into directly executable x86-64 machine code and runs it over a
//! caller-owned value buffer. The compiled function evaluates the forward
//! pass and, when differentiation inputs are marked on the graph, a
//! reverse-mode gradient sweep that accumulates into a parallel gradient
//! buffer.
//!
//! The pipeline is linear: stability cleaning rewrites numerically fragile
//! patterns, the optimizer folds inactive subgraphs and deduplicates
//! structurally equal nodes, gradient flags are propagated, and the two
//! emission passes lower the surviving nodes through an instruction-set
//! abstraction with a scalar (one double per lane) and a packed (four doubles
//! per lane) implementation.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use crate::config::Config;
pub use crate::engine::Engine;
pub use crate::isa::IsaKind;
pub use crate::result::{CodegenError, CodegenResult};
pub use crate::runtime::{
    CompiledKernel, ExecutionError, KernelRequirements, TraceRecord, ValueBuffer,
};

pub mod analysis;
pub mod ir;
pub mod isa;
pub mod runtime;

mod binemit;
mod config;
mod engine;
mod regalloc;
mod result;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
