//! meterflow - meter reading pipeline
//!
//! Turns periodic detection ticks from a visual meter reader into billed
//! delta-consumption measurements. See [`pipeline`] for the orchestration
//! layer and `src/bin/meter_runtime.rs` for the production binary.

pub mod pipeline;
