//! Instructions and scheduler annotations.

use crate::literal::Literal;
use crate::op::Op;
use crate::shape::Shape;

/// Identifier of an instruction: a stable index into its program's arena.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct InsId(pub u32);

impl InsId {
    /// Returns the zero-based slot index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Bitflags for the synchronization events the scheduler records.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct EventMask(u32);

impl EventMask {
    /// Empty mask (no flags set).
    pub const EMPTY: Self = Self(0);
    /// The producer must record an event on its stream.
    pub const RECORD_EVENT: Self = Self(1);
    /// The consumer must wait for the producer's event.
    pub const WAIT_EVENT: Self = Self(2);

    /// Returns `true` if `self` contains all flags in `other`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no flags are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One node of the program graph.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub op: Op,
    pub shape: Shape,
    /// Present only when `op` is the literal-constant marker.
    pub lit: Option<Literal>,
    /// Ordered operand list.
    pub inputs: Vec<InsId>,
    /// Consumers, one entry per consuming argument occurrence.
    /// Maintained by [`Program`](crate::Program) edits.
    pub outputs: Vec<InsId>,
    /// Execution stream assigned by pre-scheduling.
    pub stream: Option<usize>,
    /// Synchronization events recorded by pre-scheduling.
    pub mask: EventMask,
}

impl Instruction {
    /// The operator name string.
    pub fn name(&self) -> &str {
        self.op.name()
    }

    /// Whether this is a literal-constant instruction.
    pub fn is_literal(&self) -> bool {
        matches!(self.op, Op::Literal)
    }

    /// Adds event flags to the scheduler mask.
    pub fn add_mask(&mut self, m: EventMask) {
        self.mask |= m;
    }

    /// Tests event flags on the scheduler mask.
    pub fn has_mask(&self, m: EventMask) -> bool {
        self.mask.contains(m)
    }
}
