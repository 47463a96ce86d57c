//! Compiler configuration.

use crate::isa::IsaKind;

/// Environment variable overriding the configured instruction set.
pub const ISA_ENV_VAR: &str = "TAPELIFT_ISA";

/// Settings controlling optimization passes, instruction-set selection, and
/// debug output.
///
/// The debug flags are observational only; they route through `log` and
/// never change the semantics of compiled code.
#[derive(Clone, Debug)]
pub struct Config {
    /// Master switch for all graph transformations.
    pub enable_optimizations: bool,
    /// Fold constant subgraphs (nodes with `is_active` unset).
    pub enable_inactive_folding: bool,
    /// Common subexpression elimination.
    pub enable_cse: bool,
    /// Algebraic identities such as `x * 1 -> x`.
    pub enable_algebraic_simplification: bool,
    /// Rewrite numerically fragile patterns, e.g. `1/exp(x) -> exp(-x)`.
    pub enable_stability_cleaning: bool,
    /// Iterate the optimizer until no change or this many passes. Zero
    /// disables the optimizer loop entirely.
    pub max_optimization_passes: u32,
    /// Validate graph structure before compilation.
    pub validate_graph: bool,
    /// Log the graph before and after each transformation phase.
    pub print_graph: bool,
    /// Log the emitted code size and a byte dump of the function.
    pub print_assembly: bool,
    /// Log per-pass statistics.
    pub print_stats: bool,
    /// Attach a per-kernel trace ring and emit a record store after every
    /// node. Only honored by the scalar instruction set; tracing would
    /// perturb lane state in packed mode.
    pub runtime_trace: bool,
    /// Which instruction set to emit for.
    pub isa: IsaKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_optimizations: true,
            enable_inactive_folding: true,
            enable_cse: true,
            enable_algebraic_simplification: true,
            enable_stability_cleaning: true,
            max_optimization_passes: 5,
            validate_graph: true,
            print_graph: false,
            print_assembly: false,
            print_stats: false,
            runtime_trace: false,
            isa: IsaKind::Scalar,
        }
    }
}

impl Config {
    /// The default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default configuration with the instruction-set override from the
    /// environment applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply the `TAPELIFT_ISA` override if it is set and recognized.
    /// Unrecognized values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(ISA_ENV_VAR) {
            if let Some(kind) = IsaKind::from_name(&value) {
                self.isa = kind;
            }
        }
    }

    /// All debug output enabled.
    pub fn debug() -> Self {
        Self {
            print_graph: true,
            print_assembly: true,
            print_stats: true,
            ..Self::default()
        }
    }

    /// Every transformation disabled; the graph is emitted as recorded.
    pub fn no_optimization() -> Self {
        Self {
            enable_optimizations: false,
            enable_inactive_folding: false,
            enable_cse: false,
            enable_algebraic_simplification: false,
            enable_stability_cleaning: false,
            max_optimization_passes: 0,
            ..Self::default()
        }
    }

    /// A higher optimization pass limit.
    pub fn fast() -> Self {
        Self {
            max_optimization_passes: 10,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_all_passes() {
        let c = Config::default();
        assert!(c.enable_optimizations);
        assert!(c.enable_stability_cleaning);
        assert_eq!(c.max_optimization_passes, 5);
        assert_eq!(c.isa, IsaKind::Scalar);
    }

    #[test]
    fn no_optimization_disables_everything() {
        let c = Config::no_optimization();
        assert!(!c.enable_optimizations);
        assert!(!c.enable_stability_cleaning);
        assert_eq!(c.max_optimization_passes, 0);
    }
}
