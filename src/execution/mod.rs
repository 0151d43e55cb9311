// =============================================================================
// Execution layer — idempotent order pipeline
// =============================================================================

pub mod engine;
pub mod intents;
