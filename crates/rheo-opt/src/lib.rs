//! Graph optimization passes for rheo.
//!
//! Provides a [`Pass`] trait, a [`PassManager`] with fixed-point iteration,
//! and the two core passes: value-numbering horizontal fusion
//! ([`HorizontalFusion`]) and multi-stream pre-scheduling
//! ([`PreScheduling`]).

mod encode;
mod fusion;
mod schedule;

pub use encode::{
    encode_conv, encode_generic, EncodeInfo, EncodeKey, Encoder, EncoderRegistry, OpRole, ValueId,
    ValueMap,
};
pub use fusion::HorizontalFusion;
pub use schedule::PreScheduling;

use std::fmt::Debug;

use rheo_analysis::WeightOracle;
use rheo_ir::Program;

/// An optimization pass that transforms a program in place.
pub trait Pass: Debug {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Run the pass on a program. Returns `true` if anything was modified.
    fn run(&self, program: &mut Program) -> bool;
}

/// Maximum number of fixed-point iterations before giving up.
const MAX_ITERATIONS: usize = 10;

/// Runs passes in sequence with fixed-point iteration.
#[derive(Debug, Default)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    /// Creates an empty pass manager with no passes.
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Adds a pass to the pipeline.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Runs all passes until a fixed point is reached or the iteration limit.
    pub fn run(&self, program: &mut Program) {
        for _ in 0..MAX_ITERATIONS {
            let mut changed = false;
            for pass in &self.passes {
                let pass_changed = pass.run(program);
                log::debug!("pass {}: changed={pass_changed}", pass.name());
                changed |= pass_changed;
            }
            if !changed {
                break;
            }
        }
    }
}

/// Pipeline mirroring the device compile flow: pre-scheduling runs first,
/// horizontal fusion at a later position.
pub fn default_pipeline<W>(weights: W, num_streams: usize) -> PassManager
where
    W: WeightOracle + Debug + 'static,
{
    let mut pm = PassManager::new();
    pm.add_pass(Box::new(PreScheduling::new(weights, num_streams)));
    pm.add_pass(Box::new(HorizontalFusion::new()));
    pm
}
