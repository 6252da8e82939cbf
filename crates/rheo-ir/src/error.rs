//! Error types for the rheo IR.

use crate::shape::Shape;

/// Errors produced by shape inference and program edits.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// An operator received the wrong number of inputs.
    #[error("{op}: expected {expected} inputs, found {found}")]
    Arity {
        op: String,
        expected: usize,
        found: usize,
    },

    /// An axis parameter does not fit the operand rank.
    #[error("{op}: axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { op: String, axis: usize, rank: usize },

    /// Two operand shapes cannot be combined.
    #[error("{op}: mismatched operand shapes {lhs} and {rhs}")]
    ShapeMismatch { op: String, lhs: Shape, rhs: Shape },

    /// An operand violates an operator-specific constraint.
    #[error("{op}: {reason}")]
    InvalidOperands { op: String, reason: String },

    /// Attempted to remove an instruction that is still consumed.
    #[error("cannot remove an instruction that still has consumers")]
    HasConsumers,

    /// A def/use edge is missing its mirror.
    #[error("def/use inconsistency: {0}")]
    Inconsistent(String),

    /// An instruction precedes one of its operand definitions.
    #[error("instruction at position {user} consumes a later definition")]
    UseBeforeDef { user: usize },
}
