//! Graph analysis and transformation passes.
//!
//! Passes never mutate their input graph. Each returns a fresh graph plus a
//! remap table from the ids of the input graph to the ids of the result,
//! with `NO_NODE` marking ids that no longer address anything.

pub mod optimize;
pub mod stability;

mod gradient;

pub use self::gradient::propagate_gradients;
pub use self::optimize::OptimizeStats;
pub use self::stability::CleaningResult;
