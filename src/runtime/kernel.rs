//! The compiled kernel: an executable image plus the metadata a caller
//! needs to run it.

use crate::ir::NodeId;
use crate::runtime::{TraceRecord, TraceRing, ValueBuffer};
use dynasmrt::{AssemblyOffset, ExecutableBuffer};
use thiserror::Error;

/// Call signature of the emitted function. The System V convention is
/// spelled out so the contract holds on every host OS.
pub type KernelFn = unsafe extern "sysv64" fn(*mut f64, *mut f64, usize);

/// What a buffer must provide for a kernel to execute against it.
#[derive(Clone, Debug)]
pub struct KernelRequirements {
    /// Doubles per lane group.
    pub vector_width: usize,
    /// Lane groups the buffer must hold.
    pub required_nodes: usize,
    /// Minimum buffer alignment in bytes.
    pub alignment: usize,
    /// Caller-visible node id to buffer slot. Empty means identity.
    pub remap: Vec<NodeId>,
    /// Whether the kernel writes gradients and so requires the gradient
    /// region.
    pub needs_gradients: bool,
}

/// A precondition violation when executing a kernel.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExecutionError {
    /// The buffer holds fewer lane groups than the kernel addresses.
    #[error("buffer holds {available} lane groups, kernel requires {required}")]
    BufferTooSmall {
        /// Lane groups the kernel addresses.
        required: usize,
        /// Lane groups the buffer holds.
        available: usize,
    },
    /// The buffer was allocated for a different vector width.
    #[error("kernel has vector width {kernel}, buffer has {buffer}")]
    WidthMismatch {
        /// The kernel's width.
        kernel: usize,
        /// The buffer's width.
        buffer: usize,
    },
    /// The kernel computes gradients but the buffer has no gradient
    /// region.
    #[error("kernel computes gradients but the buffer has no gradient region")]
    GradientBufferRequired,
}

/// An executable compiled from one graph.
///
/// Owns the executable memory; dropping the kernel releases it. Execution
/// is re-entrant with respect to other kernels, but one kernel/buffer pair
/// must not be entered concurrently from multiple threads.
pub struct CompiledKernel {
    code: ExecutableBuffer,
    entry: AssemblyOffset,
    isa_name: &'static str,
    vector_width: usize,
    required_nodes: usize,
    alignment: usize,
    remap: Vec<NodeId>,
    needs_gradients: bool,
    trace: Option<Box<TraceRing>>,
}

impl CompiledKernel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        code: ExecutableBuffer,
        entry: AssemblyOffset,
        isa_name: &'static str,
        vector_width: usize,
        required_nodes: usize,
        alignment: usize,
        remap: Vec<NodeId>,
        needs_gradients: bool,
        trace: Option<Box<TraceRing>>,
    ) -> Self {
        Self {
            code,
            entry,
            isa_name,
            vector_width,
            required_nodes,
            alignment,
            remap,
            needs_gradients,
            trace,
        }
    }

    /// Run the kernel over a buffer. Inputs must already be stored; outputs
    /// and gradients are read back afterwards through the buffer.
    pub fn execute(&self, buffer: &mut ValueBuffer) -> Result<(), ExecutionError> {
        if buffer.vector_width() != self.vector_width {
            return Err(ExecutionError::WidthMismatch {
                kernel: self.vector_width,
                buffer: buffer.vector_width(),
            });
        }
        if buffer.lane_groups() < self.required_nodes {
            return Err(ExecutionError::BufferTooSmall {
                required: self.required_nodes,
                available: buffer.lane_groups(),
            });
        }
        if self.needs_gradients && !buffer.has_gradients() {
            return Err(ExecutionError::GradientBufferRequired);
        }

        let entry: KernelFn = unsafe { core::mem::transmute(self.code.ptr(self.entry)) };
        let count = buffer.lane_groups();
        let values = buffer.values_ptr();
        let gradients = buffer.gradients_ptr();
        unsafe { entry(values, gradients, count) };
        Ok(())
    }

    /// The buffer contract for this kernel.
    pub fn requirements(&self) -> KernelRequirements {
        KernelRequirements {
            vector_width: self.vector_width,
            required_nodes: self.required_nodes,
            alignment: self.alignment,
            remap: self.remap.clone(),
            needs_gradients: self.needs_gradients,
        }
    }

    /// Doubles per lane group.
    pub fn vector_width(&self) -> usize {
        self.vector_width
    }

    /// Lane groups the kernel addresses.
    pub fn required_nodes(&self) -> usize {
        self.required_nodes
    }

    /// Caller-visible node id to buffer slot mapping.
    pub fn remap(&self) -> &[NodeId] {
        &self.remap
    }

    /// Whether the kernel contains a reverse pass.
    pub fn computes_gradients(&self) -> bool {
        self.needs_gradients
    }

    /// Name of the instruction set the kernel was compiled for.
    pub fn isa_name(&self) -> &'static str {
        self.isa_name
    }

    /// Size of the executable image in bytes, pool included.
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// Raw entry point, for benchmarking harnesses.
    pub fn entry_ptr(&self) -> *const u8 {
        self.code.ptr(self.entry)
    }

    /// Records captured by the trace ring, oldest first. Empty when
    /// tracing was not enabled for this kernel.
    pub fn trace_records(&self) -> Vec<TraceRecord> {
        self.trace.as_ref().map(|t| t.records()).unwrap_or_default()
    }

    /// Reset the trace ring.
    pub fn clear_trace(&self) {
        if let Some(trace) = &self.trace {
            trace.clear();
        }
    }
}
