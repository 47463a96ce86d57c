//! Runtime side of the compiler: compiled kernels, value buffers, and the
//! optional execution trace ring.

mod buffer;
mod kernel;
mod trace;

pub use self::buffer::ValueBuffer;
pub use self::kernel::{CompiledKernel, ExecutionError, KernelRequirements};
pub use self::trace::{TraceRecord, TraceRing, TRACE_CAPACITY};
