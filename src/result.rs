//! Result and error types representing the outcome of compiling a graph.

use thiserror::Error;

/// A compilation error.
///
/// Any error aborts the compile as a whole; partially emitted artifacts are
/// dropped. Runtime domain errors (`log` of a negative number and friends)
/// are never compilation errors, the emitted code produces IEEE-754 NaN or
/// infinities instead.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodegenError {
    /// A graph-level constraint was violated: an operand referring forward,
    /// a constant node indexing outside the pool, an output or
    /// differentiation input naming an unknown node, or an arity mismatch.
    #[error("malformed graph: {0}")]
    Structural(String),

    /// The assembler could not be created or the emitted code could not be
    /// finalized into executable memory.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// The register allocator could not produce an assignable register even
    /// after eviction. This indicates a bug in the emitter's lock
    /// discipline, not a property of the input graph.
    #[error("register allocator failure: no assignable register")]
    Allocator,

    /// The opcode is declared but has no settled emission contract.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error.
pub type CodegenResult<T> = Result<T, CodegenError>;
