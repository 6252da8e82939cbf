//! Horizontal fusion of sibling operators.
//!
//! Value-numbers instructions that share an operator signature, groups the
//! matching siblings under hash-value nodes, and rewrites each fusable
//! cluster into one widened operation followed by a split that restores
//! the original consumer views.
//!
//! The pass proceeds in two phases over a shared hash DAG:
//!
//! 1. **Hashing** walks the program once, creating a root node for every
//!    instruction with duplicated same-operator consumers and propagating
//!    a "to be hashed" flag downward. Flagged instructions are encoded by
//!    their registered [`Encoder`](crate::encode::Encoder); equal keys
//!    collapse onto one hash-value node.
//! 2. **Transform** extends every multi-instruction node along its
//!    unique-output chain, concatenates the siblings' private input chains
//!    (byte-level for literals), drops the redundant siblings, and inserts
//!    a tail split so every original consumer sees its old view again.
//!
//! Failures below the cluster level (axis ambiguity, branching input
//! chains, oversized encodings) skip that cluster and leave the rest of
//! the program eligible.

use std::collections::{BTreeSet, HashMap, HashSet};

use rheo_ir::{InsId, Literal, Op, Program, Shape};

use crate::encode::{EncodeKey, EncoderRegistry, OpRole, OpcodeTable, ValueId, ValueMap};
use crate::Pass;

/// Concat axis of convolution outputs (NCHW channels).
const CONV_CHANNEL_AXIS: usize = 1;
/// Concat axis of convolution filters (output-channel major).
const CONV_FILTER_AXIS: usize = 0;

/// Horizontal fusion pass.
#[derive(Debug)]
pub struct HorizontalFusion {
    registry: EncoderRegistry,
}

impl Default for HorizontalFusion {
    fn default() -> Self {
        Self::new()
    }
}

impl HorizontalFusion {
    pub fn new() -> Self {
        Self {
            registry: EncoderRegistry::with_builtins(),
        }
    }

    /// Registers an additional fusable operator.
    pub fn register_op(
        &mut self,
        name: impl Into<String>,
        encoder: crate::encode::Encoder,
        role: OpRole,
    ) {
        self.registry.register(name, encoder, role);
    }
}

impl Pass for HorizontalFusion {
    fn name(&self) -> &str {
        "horizontal-fusion"
    }

    fn run(&self, program: &mut Program) -> bool {
        let mut cx = FusionContext::new(program, &self.registry);
        cx.hash_program();
        cx.transform()
    }
}

/// A node of the parallel hash DAG.
#[derive(Clone, Debug)]
struct HashValue {
    id: ValueId,
    /// Program point where the node was first seen.
    program_point: u32,
    root: bool,
}

struct FusionContext<'a> {
    prog: &'a mut Program,
    registry: &'a EncoderRegistry,
    opcodes: OpcodeTable,
    values: Vec<HashValue>,
    /// Instruction → hash value currently assigned.
    instr_value: ValueMap,
    /// Instructions flagged to be hashed when the walk reaches them.
    flagged: HashSet<InsId>,
    /// Program point → instruction.
    point_instr: Vec<InsId>,
    key_value: HashMap<EncodeKey, ValueId>,
    value_inputs: HashMap<ValueId, BTreeSet<ValueId>>,
    value_outputs: HashMap<ValueId, BTreeSet<ValueId>>,
    /// Program points of the instructions sharing each hash value.
    value_instrs: HashMap<ValueId, BTreeSet<u32>>,
    cur_point: u32,
}

impl<'a> FusionContext<'a> {
    fn new(prog: &'a mut Program, registry: &'a EncoderRegistry) -> Self {
        Self {
            prog,
            registry,
            opcodes: OpcodeTable::default(),
            values: Vec::new(),
            instr_value: ValueMap::new(),
            flagged: HashSet::new(),
            point_instr: Vec::new(),
            key_value: HashMap::new(),
            value_inputs: HashMap::new(),
            value_outputs: HashMap::new(),
            value_instrs: HashMap::new(),
            cur_point: 0,
        }
    }

    // ----- phase 1: hashing -----

    fn hash_program(&mut self) {
        let order: Vec<InsId> = self.prog.iter().collect();
        for ins in order {
            self.process(ins);
            self.point_instr.push(ins);
            self.cur_point += 1;
        }
    }

    fn process(&mut self, ins: InsId) {
        if self.prog[ins].is_literal() {
            return;
        }
        if self.flagged.contains(&ins) && self.hash(ins).is_some() {
            let outputs = self.prog[ins].outputs.clone();
            for out in outputs {
                self.flagged.insert(out);
            }
            return;
        }
        // Root detection: two or more consumers sharing an operator name.
        let outputs = self.prog[ins].outputs.clone();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for &out in &outputs {
            *counts.entry(self.prog[out].name().to_string()).or_insert(0) += 1;
        }
        if counts.values().any(|&c| c > 1) {
            let id = self.create_value(ins);
            self.values[id.index()].root = true;
            for &out in &outputs {
                if counts[self.prog[out].name()] > 1 {
                    self.flagged.insert(out);
                }
            }
        }
    }

    fn hash(&mut self, ins: InsId) -> Option<ValueId> {
        let encoder = self.registry.encoder(self.prog[ins].name())?;
        let opcode = self.opcodes.intern(&self.prog[ins].op.to_string());
        let Some(info) = encoder(self.prog, ins, &self.instr_value, opcode) else {
            log::warn!("value hash failed for {}", self.prog[ins].name());
            return None;
        };
        let id = match self.key_value.get(&info.key) {
            Some(&v) => {
                self.add_instr(v);
                self.instr_value.insert(ins, v);
                v
            }
            None => {
                let v = self.create_value(ins);
                self.key_value.insert(info.key, v);
                v
            }
        };
        for input in info.inputs {
            self.value_inputs.entry(id).or_default().insert(input);
            self.value_outputs.entry(input).or_default().insert(id);
        }
        Some(id)
    }

    fn create_value(&mut self, ins: InsId) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(HashValue {
            id,
            program_point: self.cur_point,
            root: false,
        });
        self.add_instr(id);
        self.instr_value.insert(ins, id);
        id
    }

    fn add_instr(&mut self, id: ValueId) {
        self.value_instrs
            .entry(id)
            .or_default()
            .insert(self.cur_point);
    }

    fn instr_count(&self, id: ValueId) -> usize {
        self.value_instrs.get(&id).map_or(0, BTreeSet::len)
    }

    /// Instructions currently attached to a hash value, in point order.
    fn instrs(&self, id: ValueId) -> Vec<InsId> {
        self.value_instrs
            .get(&id)
            .map(|points| {
                points
                    .iter()
                    .map(|&p| self.point_instr[p as usize])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Collapses a fused node's instruction set to its first point.
    fn update_hash_tree(&mut self, id: ValueId) {
        if let Some(points) = self.value_instrs.get_mut(&id) {
            if let Some(&first) = points.iter().next() {
                points.clear();
                points.insert(first);
            }
        }
    }

    // ----- phase 2: transform -----

    fn transform(&mut self) -> bool {
        let mut changed = false;
        for ndx in 0..self.values.len() {
            let id = self.values[ndx].id;
            let count = self.instr_count(id);
            if count <= 1 {
                continue;
            }
            // Extend the cluster along the unique-output chain while the
            // member count is preserved.
            let mut cluster = vec![id];
            let mut cur = id;
            while let Some(outs) = self.value_outputs.get(&cur) {
                if outs.len() != 1 {
                    break;
                }
                let next = *outs.iter().next().expect("non-empty output set");
                if self.instr_count(next) != count {
                    break;
                }
                cluster.push(next);
                cur = next;
            }
            changed |= self.fuse_cluster(&cluster);
        }
        changed
    }

    fn fuse_cluster(&mut self, cluster: &[ValueId]) -> bool {
        let mut visited: HashSet<InsId> = HashSet::new();
        let mut root_of: HashMap<InsId, InsId> = HashMap::new();
        let mut orig_dims: HashMap<InsId, Vec<Vec<usize>>> = HashMap::new();
        let mut enum_in_cluster: HashMap<InsId, usize> = HashMap::new();
        let mut split_axis: HashMap<InsId, usize> = HashMap::new();
        let mut last_value: Option<ValueId> = None;
        let mut changed = false;

        for &vid in cluster {
            // Common inputs hold exactly one instruction; they are shared
            // across the siblings and must not be concatenated.
            let input_values: Vec<ValueId> = self
                .value_inputs
                .get(&vid)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            let mut ok = true;
            for ival in input_values {
                let shared = self.instrs(ival);
                if shared.len() != 1 {
                    ok = false;
                    break;
                }
                visited.insert(shared[0]);
            }
            if !ok {
                continue;
            }

            let base_instrs = self.instrs(vid);
            let ins0 = base_instrs[0];

            // Remember original dimensions and consumer enumeration before
            // any rewiring happens.
            let mut lens: Vec<Vec<usize>> = Vec::new();
            for (e, &b) in base_instrs.iter().enumerate() {
                lens.push(self.prog[b].shape.dims.clone());
                for &out in &self.prog[b].outputs {
                    enum_in_cluster.insert(out, e);
                }
            }
            orig_dims.insert(ins0, lens);

            if self.prog[ins0].inputs.len() == 1 {
                // Elementwise followers widen in place once their producer
                // has been fused.
                let input = self.prog[ins0].inputs[0];
                if let Some(&ax) = split_axis.get(&input) {
                    let widened = self.prog[input].shape.clone();
                    self.prog[ins0].shape = widened;
                    self.remove_redundant_roots(&base_instrs);
                    self.update_hash_tree(vid);
                    last_value = Some(vid);
                    split_axis.insert(ins0, ax);
                    changed = true;
                }
                continue;
            }

            // Concat axis and input walks, congruence-checked against the
            // first sibling.
            let mut axis: Option<usize> = None;
            let mut all_inputs: Vec<Vec<InsId>> = Vec::new();
            let mut ok = true;
            for &b in &base_instrs {
                if axis.is_none() {
                    axis = self.find_concat_axis(b, &visited);
                }
                let Some(ax) = axis else {
                    ok = false;
                    break;
                };
                split_axis.insert(b, ax);
                let walk = self.walk(b, &mut visited);
                if walk.is_empty()
                    || (!all_inputs.is_empty()
                        && !self.compare_inputs(&all_inputs[0], &walk, b, ax))
                {
                    ok = false;
                    break;
                }
                for &w in &walk {
                    root_of.insert(w, b);
                }
                all_inputs.push(walk);
            }
            if !ok {
                continue;
            }
            let ax = axis.expect("axis fixed by the first sibling");
            log::debug!(
                "fusing {} {} siblings along axis {ax}",
                base_instrs.len(),
                self.prog[ins0].name(),
            );

            // Concatenate every aligned input position.
            for ndx in 0..all_inputs[0].len() {
                let group: Vec<InsId> = all_inputs.iter().map(|walk| walk[ndx]).collect();
                self.concat_group(&group, &root_of, ax);
            }

            self.remove_redundant_roots(&base_instrs);

            // Dead sibling chains, consumers first. The first sibling keeps
            // its non-literal chain; replaced literals go everywhere.
            for (sibling, walk) in all_inputs.iter().enumerate() {
                for &w in walk.iter().rev() {
                    if sibling == 0 && !self.prog[w].is_literal() {
                        continue;
                    }
                    self.prog
                        .remove(w)
                        .expect("fused input chain still has consumers");
                }
            }

            self.update_hash_tree(vid);
            last_value = Some(vid);
            changed = true;
        }

        if let Some(last) = last_value {
            self.insert_tail_split(last, &orig_dims, &enum_in_cluster, &split_axis);
        }
        changed
    }

    /// The unique axis along which `ins` differs from each of its common
    /// inputs; `None` on ambiguity. Convolution-like operators must fuse
    /// along the channel axis.
    fn find_concat_axis(&self, ins: InsId, visited: &HashSet<InsId>) -> Option<usize> {
        let mut axis: Option<usize> = None;
        for &input in &self.prog[ins].inputs {
            if !visited.contains(&input) {
                continue;
            }
            let cur = find_unique_axis(&self.prog[ins].shape.dims, &self.prog[input].shape.dims)?;
            if axis.is_some_and(|a| a != cur) {
                return None;
            }
            axis = Some(cur);
        }
        let axis = axis?;
        if self.registry.is_conv_like(self.prog[ins].name()) && axis != CONV_CHANNEL_AXIS {
            return None;
        }
        Some(axis)
    }

    /// Rebases the concat axis onto a sibling input: convolution filters
    /// concatenate along their output-channel axis, and broadcast operands
    /// re-resolve the axis by matching the base dimension length.
    fn sibling_axis(&self, ins: InsId, base: InsId, base_axis: usize) -> Option<usize> {
        if self.registry.is_conv_like(self.prog[base].name()) {
            return Some(CONV_FILTER_AXIS);
        }
        if let Some(&out) = self.prog[ins].outputs.first() {
            if matches!(self.prog[out].op, Op::Broadcast { .. }) {
                let dim = self.prog[base].shape.dims.get(base_axis).copied()?;
                return self.prog[ins].shape.dims.iter().position(|&d| d == dim);
            }
        }
        Some(base_axis)
    }

    /// Collects the private input chain of `ins`, leaves first.
    ///
    /// Accepts only single-input/single-output intermediates terminating at
    /// a visited node or a literal leaf; any branching yields an empty walk.
    fn walk(&self, ins: InsId, visited: &mut HashSet<InsId>) -> Vec<InsId> {
        let mut stack: Vec<InsId> = Vec::new();
        for &input in &self.prog[ins].inputs {
            if !visited.contains(&input) {
                stack.push(input);
            }
        }
        let mut ret = Vec::new();
        while let Some(&top) = stack.last() {
            let t = &self.prog[top];
            if t.inputs.len() > 1
                || t.outputs.len() > 1
                || (t.inputs.is_empty() && !t.is_literal())
            {
                return Vec::new();
            } else if t.inputs.is_empty() || visited.contains(&top) {
                ret.push(top);
                stack.pop();
            } else {
                let input = t.inputs[0];
                stack.push(input);
                visited.insert(top);
            }
        }
        ret
    }

    /// Pairwise congruence of two sibling input walks: equal length, equal
    /// operator names, and matching dimensions outside the concat axis.
    fn compare_inputs(
        &self,
        base_walk: &[InsId],
        walk: &[InsId],
        base_ins: InsId,
        base_axis: usize,
    ) -> bool {
        if base_walk.len() != walk.len() {
            return false;
        }
        for (&a, &b) in base_walk.iter().zip(walk) {
            if self.prog[a].name() != self.prog[b].name() {
                return false;
            }
            let Some(axis) = self.sibling_axis(b, base_ins, base_axis) else {
                return false;
            };
            if !dims_match_except(
                &self.prog[a].shape.dims,
                &self.prog[b].shape.dims,
                Some(axis),
            ) {
                return false;
            }
        }
        true
    }

    /// Concatenates one aligned input position across the siblings and
    /// widens the single consumer's shape.
    fn concat_group(&mut self, group: &[InsId], root_of: &HashMap<InsId, InsId>, root_axis: usize) {
        let ins0 = group[0];
        let base = root_of[&ins0];
        let mut base_lens = self.prog[base].shape.dims.clone();
        let axis = self
            .sibling_axis(ins0, base, root_axis)
            .expect("concat axis vanished during rewrite");

        let mut sum = 0;
        let mut base_sum = 0;
        for &g in group {
            sum += self.prog[g].shape.dims[axis];
            base_sum += self.prog[root_of[&g]].shape.dims[root_axis];
        }
        base_lens[root_axis] = base_sum;

        assert_eq!(
            self.prog[ins0].outputs.len(),
            1,
            "fused input must have a single consumer"
        );
        let output = self.prog[ins0].outputs[0];
        assert!(
            output == base
                || dims_match_except(
                    &self.prog[base].shape.dims,
                    &self.prog[output].shape.dims,
                    None,
                ),
            "input chain consumer disagrees with its root shape"
        );

        if self.prog[ins0].is_literal() {
            // Byte-concatenate the sibling literals along `axis`:
            // slice size is the product of trailing dimensions times the
            // element size, interleaved once per leading index.
            let s0 = self.prog[ins0].shape.clone();
            let esize = s0.elem.size();
            let mut new_lens = s0.dims.clone();
            new_lens[axis] = sum;
            let trailing: usize = s0.dims[axis + 1..].iter().product();
            let leading: usize = s0.dims[..axis].iter().product();
            let per_slice: Vec<usize> = group
                .iter()
                .map(|&g| self.prog[g].shape.dims[axis] * trailing * esize)
                .collect();

            let mut buf = Vec::with_capacity(leading * per_slice.iter().sum::<usize>());
            for s in 0..leading {
                for (i, &g) in group.iter().enumerate() {
                    let bytes = self.prog[g]
                        .lit
                        .as_ref()
                        .expect("literal instruction without payload")
                        .bytes();
                    buf.extend_from_slice(&bytes[s * per_slice[i]..(s + 1) * per_slice[i]]);
                }
            }
            let new_lit = self
                .prog
                .add_literal(Literal::new(Shape::new(s0.elem, new_lens), buf));

            let out_elem = self.prog[output].shape.elem;
            self.prog[output].shape = Shape::new(out_elem, base_lens);
            self.prog.replace_argument(output, ins0, new_lit);

            if let Op::Broadcast { axis: bcast_axis, .. } = self.prog[output].op {
                // Broadcast embeds its output shape; rebuild it now that
                // the operand widened.
                let op = Op::Broadcast {
                    axis: bcast_axis,
                    out_shape: self.prog[output].shape.clone(),
                };
                let in_shape = self.prog[new_lit].shape.clone();
                let new_shape = op
                    .compute_shape(&[in_shape])
                    .expect("widened broadcast no longer matches its operand");
                self.prog[output].op = op;
                self.prog[output].shape = new_shape;
            }
        } else {
            assert!(
                dims_match_except(&self.prog[output].shape.dims, &base_lens, Some(root_axis)),
                "widened consumer disagrees outside the concat axis"
            );
            let out_elem = self.prog[output].shape.elem;
            self.prog[output].shape = Shape::new(out_elem, base_lens);
        }
    }

    /// Rewires every consumer of the redundant siblings onto the first one
    /// and removes the duplicates.
    fn remove_redundant_roots(&mut self, base_instrs: &[InsId]) {
        let keep = base_instrs[0];
        for &b in &base_instrs[1..] {
            let outputs = self.prog[b].outputs.clone();
            for out in outputs {
                self.prog.replace_argument(out, b, keep);
            }
            self.prog
                .remove(b)
                .expect("redundant sibling still has consumers");
        }
    }

    /// Inserts the tail split after the last fused cluster node and rewires
    /// every original consumer to its slice view.
    fn insert_tail_split(
        &mut self,
        last: ValueId,
        orig_dims: &HashMap<InsId, Vec<Vec<usize>>>,
        enum_in_cluster: &HashMap<InsId, usize>,
        split_axis: &HashMap<InsId, usize>,
    ) {
        let base = self.instrs(last);
        assert_eq!(base.len(), 1, "fused cluster must collapse to one instruction");
        let last_ins = base[0];
        let axis = split_axis[&last_ins];
        let dims = orig_dims[&last_ins].clone();
        let slice_dims: Vec<usize> = dims.iter().map(|d| d[axis]).collect();

        let outputs = self.prog[last_ins].outputs.clone();
        let mut concat_enums: HashSet<usize> = HashSet::new();
        for &out in &outputs {
            if matches!(self.prog[out].op, Op::Concat { .. }) {
                concat_enums.insert(enum_in_cluster[&out]);
            }
        }

        let elem = self.prog[last_ins].shape.elem;
        let mut offsets = Vec::with_capacity(dims.len());
        let mut offset = 0usize;
        for d in &dims {
            offsets.push(offset);
            offset += Shape::new(elem, d.clone()).bytes();
        }

        let anchor = self.prog.next_of(last_ins);
        let split = self.insert_at(
            anchor,
            Op::Split {
                axis,
                slice_dims: slice_dims.clone(),
                slice_selector: (0, slice_dims.len() - 1),
            },
            vec![last_ins],
        );

        let mut enum_instr: HashMap<usize, InsId> = HashMap::new();
        for out in outputs {
            let e = *enum_in_cluster
                .get(&out)
                .expect("consumer outside the cluster enumeration");
            let new_ins = match enum_instr.get(&e) {
                Some(&n) => n,
                None => {
                    let mut n = split;
                    let mut add_load = true;
                    if concat_enums.contains(&e) {
                        n = self.break_split(e, split);
                        add_load = n == split;
                    }
                    if add_load {
                        n = self.insert_at(
                            anchor,
                            Op::Load {
                                shape: Shape::new(elem, dims[e].clone()),
                                byte_offset: offsets[e],
                            },
                            vec![split],
                        );
                    } else {
                        n = self.insert_at(anchor, Op::Reshape { dims: dims[e].clone() }, vec![n]);
                    }
                    enum_instr.insert(e, n);
                    n
                }
            };
            self.prog.replace_argument(out, last_ins, new_ins);
        }
    }

    /// Splits the slice selector so one branch isolates `enum_ndx` and the
    /// surviving split keeps the remaining contiguous range. Returns the
    /// original split unchanged when only one index remains.
    fn break_split(&mut self, enum_ndx: usize, split: InsId) -> InsId {
        let Op::Split {
            axis,
            slice_dims,
            slice_selector: (first, last),
        } = self.prog[split].op.clone()
        else {
            unreachable!("break_split on a non-split instruction");
        };
        assert!(last >= first);
        assert!(
            enum_ndx == first || enum_ndx == last,
            "break index must sit on the selector boundary"
        );
        if first == last {
            return split;
        }
        let input = self.prog[split].inputs[0];
        let new_split = self
            .prog
            .insert_before(
                split,
                Op::Split {
                    axis,
                    slice_dims: slice_dims.clone(),
                    slice_selector: (enum_ndx, enum_ndx),
                },
                vec![input],
            )
            .expect("isolated slice selector is well-formed");

        let selector = if first == enum_ndx {
            (enum_ndx + 1, last)
        } else {
            (first, enum_ndx - 1)
        };
        let op = Op::Split {
            axis,
            slice_dims,
            slice_selector: selector,
        };
        let input_shape = self.prog[input].shape.clone();
        let shape = op
            .compute_shape(&[input_shape])
            .expect("narrowed slice selector is well-formed");
        self.prog[split].op = op;
        self.prog[split].shape = shape;
        new_split
    }

    fn insert_at(&mut self, anchor: Option<InsId>, op: Op, inputs: Vec<InsId>) -> InsId {
        let built = match anchor {
            Some(pos) => self.prog.insert_before(pos, op, inputs),
            None => self.prog.push(op, inputs),
        };
        built.expect("shape inference failed while rewriting a fused cluster")
    }
}

/// The axis where the two dimension vectors differ, when they differ in
/// exactly one. Rank changes resolve to the leading axis.
fn find_unique_axis(lens1: &[usize], lens2: &[usize]) -> Option<usize> {
    if lens1.len() != lens2.len() {
        return Some(0);
    }
    let mut found = None;
    let mut count = 0;
    for (i, (a, b)) in lens1.iter().zip(lens2).enumerate() {
        if a != b {
            count += 1;
            found = Some(i);
        }
    }
    if count == 1 {
        found
    } else {
        None
    }
}

/// Whether the dimension vectors match everywhere outside `axis`.
fn dims_match_except(a: &[usize], b: &[usize], axis: Option<usize>) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .enumerate()
            .all(|(i, (x, y))| x == y || Some(i) == axis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rheo_ir::{ElementType, Literal};

    fn f32s(dims: &[usize]) -> Shape {
        Shape::new(ElementType::F32, dims.to_vec())
    }

    #[test]
    fn unique_axis_resolution() {
        assert_eq!(find_unique_axis(&[1, 4, 2, 2], &[1, 3, 2, 2]), Some(1));
        assert_eq!(find_unique_axis(&[1, 4, 2, 2], &[1, 4, 2, 2]), None);
        assert_eq!(find_unique_axis(&[1, 4, 2, 2], &[1, 3, 3, 2]), None);
        // Rank changes resolve to the leading axis.
        assert_eq!(find_unique_axis(&[2, 3], &[3]), Some(0));
    }

    #[test]
    fn dims_matching() {
        assert!(dims_match_except(&[4, 3, 3, 3], &[8, 3, 3, 3], Some(0)));
        assert!(!dims_match_except(&[4, 3, 3, 3], &[8, 3, 5, 3], Some(0)));
        assert!(dims_match_except(&[1, 4], &[1, 4], None));
        assert!(!dims_match_except(&[1, 4], &[1, 4, 1], Some(2)));
    }

    #[test]
    fn sibling_convolutions_share_a_hash_value() {
        let mut p = Program::new();
        let x = p.add_param(f32s(&[1, 3, 4, 4]));
        let w1 = p.add_literal(Literal::from_f32s(&[4, 3, 3, 3], &[0.5; 108]));
        let w2 = p.add_literal(Literal::from_f32s(&[8, 3, 3, 3], &[0.25; 216]));
        let conv = Op::Convolution {
            padding: [1, 1],
            stride: [1, 1],
        };
        let c1 = p.push(conv.clone(), vec![x, w1]).unwrap();
        let c2 = p.push(conv, vec![x, w2]).unwrap();

        let registry = EncoderRegistry::with_builtins();
        let mut cx = FusionContext::new(&mut p, &registry);
        cx.hash_program();

        // One root for the shared input, one value holding both siblings.
        assert_eq!(cx.values.len(), 2);
        assert!(cx.values[0].root);
        let shared = cx.instr_value[&c1];
        assert_eq!(cx.instr_value[&c2], shared);
        assert_eq!(cx.instr_count(shared), 2);
        assert_eq!(cx.instrs(shared), vec![c1, c2]);
        assert_eq!(cx.values[shared.index()].program_point, 3);
    }

    #[test]
    fn consumers_with_distinct_operators_do_not_root() {
        let mut p = Program::new();
        let x = p.add_param(f32s(&[1, 4]));
        let y = p.add_param(f32s(&[1, 4]));
        let _r = p.push(Op::Relu, vec![x]).unwrap();
        let _m = p.push(Op::Mul, vec![x, y]).unwrap();

        let registry = EncoderRegistry::with_builtins();
        let mut cx = FusionContext::new(&mut p, &registry);
        cx.hash_program();
        assert!(cx.values.is_empty());
    }

    #[test]
    fn walk_rejects_branching_chains() {
        let mut p = Program::new();
        let x = p.add_param(f32s(&[1, 3, 4, 4]));
        let w = p.add_literal(Literal::from_f32s(&[4, 3, 3, 3], &[1.0; 108]));
        let conv = Op::Convolution {
            padding: [1, 1],
            stride: [1, 1],
        };
        let c = p.push(conv, vec![x, w]).unwrap();
        // A second consumer of the filter makes it non-private.
        let _other = p.push(Op::Relu, vec![w]).unwrap();

        let registry = EncoderRegistry::with_builtins();
        let cx = FusionContext::new(&mut p, &registry);
        let mut visited = HashSet::new();
        visited.insert(x);
        assert!(cx.walk(c, &mut visited).is_empty());
    }

    #[test]
    fn walk_collects_leaves_first() {
        let mut p = Program::new();
        let x = p.add_param(f32s(&[1, 4, 2, 2]));
        let bias = p.add_literal(Literal::from_f32s(&[4], &[0.0; 4]));
        let bc = p
            .push(
                Op::Broadcast {
                    axis: 1,
                    out_shape: f32s(&[1, 4, 2, 2]),
                },
                vec![bias],
            )
            .unwrap();
        let add = p.push(Op::Add, vec![x, bc]).unwrap();

        let registry = EncoderRegistry::with_builtins();
        let cx = FusionContext::new(&mut p, &registry);
        let mut visited = HashSet::new();
        visited.insert(x);
        assert_eq!(cx.walk(add, &mut visited), vec![bias, bc]);
    }
}
