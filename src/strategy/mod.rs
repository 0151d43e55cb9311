// =============================================================================
// Strategy layer — evaluators and the per-run tick pipeline
// =============================================================================

pub mod runner;
pub mod strategies;
