//! The compilation engine: a linear pipeline from graph to kernel.

use crate::analysis::{self, optimize, stability};
use crate::binemit::constants::ConstantPool;
use crate::binemit::{forward, reverse, EmitContext};
use crate::config::Config;
use crate::ir::{Graph, NodeId, NO_NODE};
use crate::isa::{self, Assembler};
use crate::regalloc::RegisterFile;
use crate::result::{CodegenError, CodegenResult};
use crate::runtime::{CompiledKernel, TraceRing};
use dynasmrt::DynasmApi;

/// The JIT compilation engine.
///
/// Holds a configuration and compiles any number of graphs with it. The
/// engine keeps no per-compilation state; each `compile` call owns its
/// assembler, register file, and constant pool, so separate compilations
/// never interfere.
pub struct Engine {
    config: Config,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Engine {
    /// Create an engine with the given configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Compile a graph into an executable kernel.
    ///
    /// The pipeline: validation, stability cleaning, optimization, gradient
    /// closure, constant pool construction, forward emission, reverse
    /// emission when differentiation inputs exist, pool embedding, and
    /// finalization into executable memory. Any error aborts the whole
    /// compile.
    pub fn compile(&self, graph: &Graph) -> CodegenResult<CompiledKernel> {
        let isa = isa::lookup(self.config.isa);

        if self.config.validate_graph {
            graph.validate()?;
        }
        if self.config.print_graph {
            log::debug!("input graph:\n{}", graph);
        }

        let stability_enabled =
            self.config.enable_optimizations && self.config.enable_stability_cleaning;
        let cleaned = stability::clean(graph, stability_enabled);
        if self.config.print_graph && stability_enabled {
            log::debug!("after stability cleaning:\n{}", cleaned.graph);
        }

        let (mut optimized, opt_remap, stats) = optimize::run(&cleaned.graph, &self.config);
        if self.config.print_stats {
            log::info!(
                "compiled with {} stability fixes, optimizer stats: {:?}",
                cleaned.fixes,
                stats
            );
        }

        analysis::propagate_gradients(&mut optimized);
        if self.config.print_graph {
            log::debug!("optimized graph:\n{}", optimized);
        }

        let width = isa.vector_width();
        let lane_bytes = width as u64 * 8;
        if optimized.len() as u64 * lane_bytes > i32::MAX as u64 {
            return Err(CodegenError::Structural(
                "graph exceeds the addressable value buffer range".to_string(),
            ));
        }

        let has_gradients = !optimized.diff_inputs.is_empty()
            && optimized
                .nodes
                .iter()
                .any(|n| !n.is_dead && n.needs_gradient);

        let mut ops = Assembler::new()
            .map_err(|e| CodegenError::Resource(format!("assembler creation failed: {}", e)))?;
        let entry = ops.offset();
        let pool = ConstantPool::build(&optimized, &mut ops)?;

        let mut regs = RegisterFile::new(isa.volatile_range());
        regs.blacklist(isa.scratch());

        let mut trace_ring = if self.config.runtime_trace && isa.supports_trace() {
            Some(TraceRing::new_boxed())
        } else {
            None
        };
        let trace_ptr = trace_ring.as_deref_mut().map(|ring| ring as *mut TraceRing);

        isa.emit_prologue(&mut ops);
        isa.emit_save_callee_regs(&mut ops);
        {
            let mut cx =
                EmitContext::new(&mut ops, &*isa, &mut regs, &pool, &optimized, trace_ptr);
            forward::emit(&mut cx)?;
            if has_gradients {
                reverse::emit(&mut cx)?;
            }
        }
        isa.emit_restore_callee_regs(&mut ops);
        isa.emit_epilogue(&mut ops);
        pool.embed(&mut ops);

        let code = ops.finalize().map_err(|_| {
            CodegenError::Resource("finalizing executable memory failed".to_string())
        })?;
        if self.config.print_assembly {
            log::debug!(
                "emitted {} bytes for {} ({} pool constants, {} bytes of pool)",
                code.len(),
                isa.name(),
                pool.len(),
                pool.byte_size()
            );
        }

        let remap: Vec<NodeId> = cleaned
            .remap
            .iter()
            .map(|&r| {
                if r == NO_NODE {
                    NO_NODE
                } else {
                    opt_remap[r as usize]
                }
            })
            .collect();

        Ok(CompiledKernel::new(
            code,
            entry,
            isa.name(),
            width,
            optimized.len(),
            isa.buffer_alignment(),
            remap,
            has_gradients,
            trace_ring,
        ))
    }
}
