//! Machine model for the rheo scheduler.
//!
//! Supplies per-operator execution weights and the stream configuration
//! consumed by the pre-scheduling pass.

mod machine;

pub use machine::{MachineModel, OpWeight, StreamConfig, WeightOracle, DISABLE_NULL_STREAM_ENV};
