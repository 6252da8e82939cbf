//! Per-operator cost table and stream capability gate.

use std::collections::HashMap;

/// Static execution cost of one operator instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpWeight {
    /// Abstract issue cycles consumed by list scheduling.
    pub cycles: i64,
    /// The operator runs on the host and is not assigned a device stream.
    pub run_on_cpu: bool,
}

impl OpWeight {
    pub const fn new(cycles: i64, run_on_cpu: bool) -> Self {
        Self { cycles, run_on_cpu }
    }
}

/// Capability supplying a weight for every operator name.
///
/// The oracle is total: names it does not know cost nothing.
pub trait WeightOracle {
    fn call(&self, op_name: &str) -> OpWeight;
}

impl<F> WeightOracle for F
where
    F: Fn(&str) -> OpWeight,
{
    fn call(&self, op_name: &str) -> OpWeight {
        self(op_name)
    }
}

/// Default device cost table.
///
/// The entries are relative issue weights, not calibrated latencies; they
/// only need to rank operators so the scheduler keeps heavy chains
/// together.
#[derive(Clone, Debug)]
pub struct MachineModel {
    table: HashMap<String, OpWeight>,
}

impl Default for MachineModel {
    fn default() -> Self {
        let mut table = HashMap::new();
        let builtins: &[(&str, OpWeight)] = &[
            ("@literal", OpWeight::new(0, true)),
            ("@param", OpWeight::new(0, true)),
            ("convolution", OpWeight::new(8, false)),
            ("concat", OpWeight::new(2, false)),
            ("split", OpWeight::new(1, false)),
            ("add", OpWeight::new(1, false)),
            ("mul", OpWeight::new(1, false)),
            ("relu", OpWeight::new(1, false)),
            ("broadcast", OpWeight::new(0, false)),
            ("reshape", OpWeight::new(0, false)),
            ("load", OpWeight::new(0, false)),
        ];
        for (name, w) in builtins {
            table.insert((*name).to_string(), *w);
        }
        Self { table }
    }
}

impl MachineModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides or adds an operator entry.
    pub fn set(&mut self, name: impl Into<String>, weight: OpWeight) {
        self.table.insert(name.into(), weight);
    }
}

impl WeightOracle for MachineModel {
    fn call(&self, op_name: &str) -> OpWeight {
        self.table
            .get(op_name)
            .copied()
            .unwrap_or(OpWeight::new(0, false))
    }
}

/// When this variable is set the device creates real per-stream queues;
/// otherwise every kernel is launched on the null stream.
pub const DISABLE_NULL_STREAM_ENV: &str = "MIGRAPH_DISABLE_NULL_STREAM";

/// Stream configuration for the target device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub num_streams: usize,
}

impl StreamConfig {
    /// Streams the device exposes when multi-stream execution is enabled.
    pub const DEFAULT_STREAMS: usize = 4;

    /// Reads the capability gate from the environment.
    pub fn from_env() -> Self {
        let num_streams = if std::env::var_os(DISABLE_NULL_STREAM_ENV).is_some() {
            Self::DEFAULT_STREAMS
        } else {
            1
        };
        Self { num_streams }
    }
}
