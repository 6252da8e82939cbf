//! Instruction encoding for value numbering.
//!
//! Fusable instructions hash to 64-bit bit-packed keys:
//!
//! ```text
//! | 63..48 | 47..32               | 31..24 | 23..16 | 15..0    |
//! | opcode | first-input value id | filter | kernel | reserved |
//! ```
//!
//! Generic operators fill the first two fields; convolution-like operators
//! additionally pack the trailing two dimensions of their second operand.
//! Encoding fails whenever a field overflows its range.

use std::collections::HashMap;

use rheo_ir::{InsId, Program};

/// A packed encoding key.
pub type EncodeKey = u64;

/// Dense id of a hash-value node in the fusion DAG.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Map from instruction to the hash value it currently carries.
pub type ValueMap = HashMap<InsId, ValueId>;

const OPCODE_BITS: u32 = 16;
const HASH_ID_BITS: u32 = 16;
const FILTER_BITS: u32 = 8;
const KERNEL_BITS: u32 = 8;

const fn opcode_shift() -> u32 {
    u64::BITS - OPCODE_BITS
}

const fn hash_id_shift() -> u32 {
    opcode_shift() - HASH_ID_BITS
}

const fn filter_shift() -> u32 {
    hash_id_shift() - FILTER_BITS
}

const fn kernel_shift() -> u32 {
    filter_shift() - KERNEL_BITS
}

/// Result of encoding one instruction: the key plus the hash values of the
/// operands that contributed to it.
#[derive(Clone, Debug)]
pub struct EncodeInfo {
    pub key: EncodeKey,
    pub inputs: Vec<ValueId>,
}

/// Encoding strategy for one operator name.
pub type Encoder = fn(&Program, InsId, &ValueMap, u32) -> Option<EncodeInfo>;

/// Role of a registered operator in fusion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpRole {
    Generic,
    ConvLike,
}

/// Encodes the opcode and the first operand's hash id.
///
/// Returns `None` when the first operand has not been hashed or a field
/// overflows.
pub fn encode_generic(
    prog: &Program,
    ins: InsId,
    values: &ValueMap,
    opcode: u32,
) -> Option<EncodeInfo> {
    if opcode >= 1 << OPCODE_BITS {
        return None;
    }
    let first = *prog[ins].inputs.first()?;
    let val = *values.get(&first)?;
    if val.0 >= 1 << HASH_ID_BITS {
        return None;
    }
    let key = (u64::from(opcode) << opcode_shift()) | (u64::from(val.0) << hash_id_shift());
    Some(EncodeInfo {
        key,
        inputs: vec![val],
    })
}

/// Generic encoding plus the filter and kernel dimensions taken from the
/// last two dimensions of the second operand's shape.
pub fn encode_conv(
    prog: &Program,
    ins: InsId,
    values: &ValueMap,
    opcode: u32,
) -> Option<EncodeInfo> {
    let mut info = encode_generic(prog, ins, values, opcode)?;
    let second = *prog[ins].inputs.get(1)?;
    let dims = &prog[second].shape.dims;
    if dims.len() < 2 {
        return None;
    }
    let filter = dims[dims.len() - 2] as u64;
    let kernel = dims[dims.len() - 1] as u64;
    if filter >= 1 << FILTER_BITS || kernel >= 1 << KERNEL_BITS {
        return None;
    }
    info.key |= (filter << filter_shift()) | (kernel << kernel_shift());
    Some(info)
}

/// Registry mapping operator names to encoding strategies.
#[derive(Clone, Debug, Default)]
pub struct EncoderRegistry {
    ops: HashMap<String, (Encoder, OpRole)>,
}

impl EncoderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in fusable operators.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register("convolution", encode_conv, OpRole::ConvLike);
        r.register("add", encode_generic, OpRole::Generic);
        r.register("mul", encode_generic, OpRole::Generic);
        r.register("relu", encode_generic, OpRole::Generic);
        r
    }

    /// Registers an encoding strategy for an operator name.
    pub fn register(&mut self, name: impl Into<String>, encoder: Encoder, role: OpRole) {
        self.ops.insert(name.into(), (encoder, role));
    }

    /// The encoder registered for `name`, if any.
    pub fn encoder(&self, name: &str) -> Option<Encoder> {
        self.ops.get(name).map(|(e, _)| *e)
    }

    /// Whether `name` is registered with the convolution-like role.
    pub fn is_conv_like(&self, name: &str) -> bool {
        matches!(self.ops.get(name), Some((_, OpRole::ConvLike)))
    }
}

/// Interns serialized operator forms as dense opcodes.
#[derive(Clone, Debug, Default)]
pub struct OpcodeTable {
    table: HashMap<String, u32>,
    next: u32,
}

impl OpcodeTable {
    pub fn intern(&mut self, form: &str) -> u32 {
        if let Some(&op) = self.table.get(form) {
            return op;
        }
        let op = self.next;
        self.next += 1;
        self.table.insert(form.to_string(), op);
        op
    }
}
