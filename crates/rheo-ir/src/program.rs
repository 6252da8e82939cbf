//! The ordered instruction program and its edit primitives.

use std::collections::HashMap;
use std::ops::{Index, IndexMut};

use crate::error::IrError;
use crate::instruction::{EventMask, InsId, Instruction};
use crate::literal::Literal;
use crate::op::Op;
use crate::shape::Shape;

#[derive(Clone, Debug)]
struct Slot {
    ins: Instruction,
    prev: Option<InsId>,
    next: Option<InsId>,
    linked: bool,
}

/// An ordered, mutable sequence of instructions.
///
/// Instructions live in an append-only slot arena; program order is an
/// intrusive doubly linked list over the slots. Removing an instruction
/// unlinks it without invalidating any other [`InsId`].
#[derive(Clone, Debug, Default)]
pub struct Program {
    slots: Vec<Slot>,
    head: Option<InsId>,
    tail: Option<InsId>,
    len: usize,
}

impl Program {
    /// Creates an empty program.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of linked instructions.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the program has no instructions.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates instruction ids in program order.
    pub fn iter(&self) -> impl Iterator<Item = InsId> + '_ {
        std::iter::successors(self.head, move |&id| self.slots[id.index()].next)
    }

    /// The instruction following `id` in program order, if any.
    pub fn next_of(&self, id: InsId) -> Option<InsId> {
        self.slots[id.index()].next
    }

    /// Appends an instruction at the end of the program.
    ///
    /// The result shape is inferred from the operand shapes; def/use edges
    /// are registered on both sides.
    pub fn push(&mut self, op: Op, inputs: Vec<InsId>) -> Result<InsId, IrError> {
        self.build(op, inputs, None)
    }

    /// Inserts an instruction immediately before `pos`.
    pub fn insert_before(
        &mut self,
        pos: InsId,
        op: Op,
        inputs: Vec<InsId>,
    ) -> Result<InsId, IrError> {
        self.build(op, inputs, Some(pos))
    }

    /// Adds a parameter leaf at the end of the program.
    pub fn add_param(&mut self, shape: Shape) -> InsId {
        self.push(Op::Param { shape }, Vec::new())
            .expect("parameters take no operands")
    }

    /// Adds a literal constant at the head of the program.
    pub fn add_literal(&mut self, lit: Literal) -> InsId {
        let id = self.alloc(Instruction {
            op: Op::Literal,
            shape: lit.shape().clone(),
            lit: Some(lit),
            inputs: Vec::new(),
            outputs: Vec::new(),
            stream: None,
            mask: EventMask::EMPTY,
        });
        self.link_before(id, self.head);
        id
    }

    /// Moves `ins` immediately before `before` and returns `ins`.
    pub fn move_before(&mut self, ins: InsId, before: InsId) -> InsId {
        self.unlink(ins);
        self.link_before(ins, Some(before));
        ins
    }

    /// Removes an instruction with no remaining consumers, detaching it
    /// from its producers' output lists.
    pub fn remove(&mut self, id: InsId) -> Result<(), IrError> {
        if !self.slots[id.index()].ins.outputs.is_empty() {
            return Err(IrError::HasConsumers);
        }
        let inputs = std::mem::take(&mut self.slots[id.index()].ins.inputs);
        for input in inputs {
            self.slots[input.index()].ins.outputs.retain(|&o| o != id);
        }
        self.unlink(id);
        Ok(())
    }

    /// Rewrites every occurrence of `old` in `user`'s operand list to
    /// `new`, fixing both output lists. A no-op if `old` does not occur.
    pub fn replace_argument(&mut self, user: InsId, old: InsId, new: InsId) {
        let mut count = 0;
        for arg in &mut self.slots[user.index()].ins.inputs {
            if *arg == old {
                *arg = new;
                count += 1;
            }
        }
        if count == 0 {
            return;
        }
        self.slots[old.index()].ins.outputs.retain(|&o| o != user);
        for _ in 0..count {
            self.slots[new.index()].ins.outputs.push(user);
        }
    }

    /// Checks def/use mirror consistency and that every producer precedes
    /// every consumer in program order.
    pub fn validate(&self) -> Result<(), IrError> {
        let mut position: HashMap<InsId, usize> = HashMap::new();
        for (ndx, id) in self.iter().enumerate() {
            position.insert(id, ndx);
        }
        for (&id, &ndx) in &position {
            let ins = &self[id];
            for &input in &ins.inputs {
                let def = position.get(&input).ok_or_else(|| {
                    IrError::Inconsistent(format!("@{ndx} consumes an unlinked instruction"))
                })?;
                if *def >= ndx {
                    return Err(IrError::UseBeforeDef { user: ndx });
                }
                if !self[input].outputs.contains(&id) {
                    return Err(IrError::Inconsistent(format!(
                        "@{def} does not list @{ndx} as a consumer"
                    )));
                }
            }
            for &output in &ins.outputs {
                if !position.contains_key(&output) {
                    return Err(IrError::Inconsistent(format!(
                        "@{ndx} lists an unlinked consumer"
                    )));
                }
                if !self[output].inputs.contains(&id) {
                    return Err(IrError::Inconsistent(format!(
                        "@{ndx} lists a consumer that does not use it"
                    )));
                }
            }
        }
        Ok(())
    }

    fn build(&mut self, op: Op, inputs: Vec<InsId>, pos: Option<InsId>) -> Result<InsId, IrError> {
        let shapes: Vec<Shape> = inputs.iter().map(|&i| self[i].shape.clone()).collect();
        let shape = op.compute_shape(&shapes)?;
        let id = self.alloc(Instruction {
            op,
            shape,
            lit: None,
            inputs: inputs.clone(),
            outputs: Vec::new(),
            stream: None,
            mask: EventMask::EMPTY,
        });
        for input in inputs {
            self.slots[input.index()].ins.outputs.push(id);
        }
        self.link_before(id, pos);
        Ok(id)
    }

    fn alloc(&mut self, ins: Instruction) -> InsId {
        let id = InsId(u32::try_from(self.slots.len()).expect("program exceeds u32::MAX slots"));
        self.slots.push(Slot {
            ins,
            prev: None,
            next: None,
            linked: false,
        });
        id
    }

    /// Links `id` before `pos`, or at the tail when `pos` is `None`.
    fn link_before(&mut self, id: InsId, pos: Option<InsId>) {
        debug_assert!(!self.slots[id.index()].linked);
        let prev = match pos {
            Some(p) => self.slots[p.index()].prev,
            None => self.tail,
        };
        self.slots[id.index()].prev = prev;
        self.slots[id.index()].next = pos;
        match prev {
            Some(p) => self.slots[p.index()].next = Some(id),
            None => self.head = Some(id),
        }
        match pos {
            Some(p) => self.slots[p.index()].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.slots[id.index()].linked = true;
        self.len += 1;
    }

    fn unlink(&mut self, id: InsId) {
        debug_assert!(self.slots[id.index()].linked);
        let Slot { prev, next, .. } = self.slots[id.index()];
        match prev {
            Some(p) => self.slots[p.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n.index()].prev = prev,
            None => self.tail = prev,
        }
        let slot = &mut self.slots[id.index()];
        slot.prev = None;
        slot.next = None;
        slot.linked = false;
        self.len -= 1;
    }
}

impl Index<InsId> for Program {
    type Output = Instruction;

    fn index(&self, id: InsId) -> &Instruction {
        &self.slots[id.index()].ins
    }
}

impl IndexMut<InsId> for Program {
    fn index_mut(&mut self, id: InsId) -> &mut Instruction {
        &mut self.slots[id.index()].ins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ElementType;

    fn f32s(dims: &[usize]) -> Shape {
        Shape::new(ElementType::F32, dims.to_vec())
    }

    #[test]
    fn push_builds_def_use_edges() {
        let mut p = Program::new();
        let x = p.add_param(f32s(&[2, 2]));
        let y = p.add_param(f32s(&[2, 2]));
        let add = p.push(Op::Add, vec![x, y]).unwrap();

        assert_eq!(p[add].inputs, vec![x, y]);
        assert_eq!(p[x].outputs, vec![add]);
        assert_eq!(p[y].outputs, vec![add]);
        assert_eq!(p[add].shape.dims, vec![2, 2]);
        p.validate().unwrap();
    }

    #[test]
    fn duplicate_argument_occurrences() {
        let mut p = Program::new();
        let x = p.add_param(f32s(&[4]));
        let add = p.push(Op::Add, vec![x, x]).unwrap();
        assert_eq!(p[x].outputs, vec![add, add]);
        p.validate().unwrap();
    }

    #[test]
    fn literals_prepend() {
        let mut p = Program::new();
        let x = p.add_param(f32s(&[4]));
        let lit = p.add_literal(Literal::from_f32s(&[4], &[1.0, 2.0, 3.0, 4.0]));
        let order: Vec<InsId> = p.iter().collect();
        assert_eq!(order, vec![lit, x]);
    }

    #[test]
    fn insert_and_move() {
        let mut p = Program::new();
        let a = p.add_param(f32s(&[4]));
        let b = p.push(Op::Relu, vec![a]).unwrap();
        let c = p.insert_before(b, Op::Relu, vec![a]).unwrap();
        assert_eq!(p.iter().collect::<Vec<_>>(), vec![a, c, b]);

        p.move_before(b, c);
        assert_eq!(p.iter().collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(p.next_of(a), Some(b));
    }

    #[test]
    fn remove_requires_no_consumers() {
        let mut p = Program::new();
        let a = p.add_param(f32s(&[4]));
        let b = p.push(Op::Relu, vec![a]).unwrap();
        assert!(matches!(p.remove(a), Err(IrError::HasConsumers)));

        p.remove(b).unwrap();
        assert!(p[a].outputs.is_empty());
        p.remove(a).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn replace_argument_rewires() {
        let mut p = Program::new();
        let a = p.add_param(f32s(&[4]));
        let b = p.add_param(f32s(&[4]));
        let r = p.push(Op::Relu, vec![a]).unwrap();

        p.replace_argument(r, a, b);
        assert_eq!(p[r].inputs, vec![b]);
        assert!(p[a].outputs.is_empty());
        assert_eq!(p[b].outputs, vec![r]);

        // Replacing a non-argument is a no-op.
        p.replace_argument(r, a, b);
        assert_eq!(p[b].outputs, vec![r]);
        p.validate().unwrap();
    }

    #[test]
    fn validate_catches_use_before_def() {
        let mut p = Program::new();
        let a = p.add_param(f32s(&[4]));
        let b = p.push(Op::Relu, vec![a]).unwrap();
        p.move_before(a, b);
        p.validate().unwrap();

        p.move_before(b, a);
        assert!(matches!(p.validate(), Err(IrError::UseBeforeDef { .. })));
    }

    #[test]
    fn validate_catches_broken_mirror() {
        let mut p = Program::new();
        let a = p.add_param(f32s(&[4]));
        let _r = p.push(Op::Relu, vec![a]).unwrap();
        p[a].outputs.clear();
        assert!(matches!(p.validate(), Err(IrError::Inconsistent(_))));
    }

    #[test]
    fn shape_inference_failure_is_reported() {
        let mut p = Program::new();
        let a = p.add_param(f32s(&[2, 3]));
        let b = p.add_param(f32s(&[2, 4]));
        assert!(p.push(Op::Add, vec![a, b]).is_err());
        // The failed push must not leave dangling consumers behind.
        assert!(p[a].outputs.is_empty());
        assert!(p[b].outputs.is_empty());
    }
}
