//! Multi-stream pre-scheduling.
//!
//! Computes subtree weights over the def/use DAG, produces a weighted
//! topological order that keeps critical paths contiguous, assigns each
//! instruction to an execution stream, records cross-stream event masks,
//! and splices the program into the scheduled order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt::Debug;

use rheo_analysis::WeightOracle;
use rheo_ir::{EventMask, InsId, Program};

use crate::Pass;

/// Children lighter than this stay in their parent's partition.
const MIN_PARTITION_WEIGHT: i64 = 2;

/// Pre-scheduling pass.
///
/// Stream and event annotations land on the instructions; the spliced
/// program order is the execution order the downstream executor replays.
/// With `num_streams == 0` only the weighted topological reorder happens.
#[derive(Debug)]
pub struct PreScheduling<W> {
    weights: W,
    num_streams: usize,
}

impl<W: WeightOracle> PreScheduling<W> {
    pub fn new(weights: W, num_streams: usize) -> Self {
        Self {
            weights,
            num_streams,
        }
    }

    /// Runs the pass. Returns `true` if the program order or any
    /// annotation changed.
    pub fn run(&self, program: &mut Program) -> bool {
        if program.is_empty() {
            return false;
        }
        let before: Vec<InsId> = program.iter().collect();
        let annotated;
        {
            let mut cx = SchedContext::new(program, &self.weights);
            cx.compute_weights();
            let mut order = cx.weighted_topo_sort();
            cx.assign_streams(&mut order, self.num_streams);
            cx.splice(&order);
            annotated = cx.annotated;
        }
        if cfg!(debug_assertions) {
            program
                .validate()
                .expect("pre-scheduling produced a use before its definition");
        }
        let after: Vec<InsId> = program.iter().collect();
        before != after || annotated
    }
}

impl<W: WeightOracle + Debug> Pass for PreScheduling<W> {
    fn name(&self) -> &str {
        "pre-scheduling"
    }

    fn run(&self, program: &mut Program) -> bool {
        PreScheduling::run(self, program)
    }
}

/// Scheduling metadata for one instruction.
#[derive(Clone, Debug)]
struct DagNode {
    ins: InsId,
    ins_ndx: usize,
    weight: i64,
    weight_sum: i64,
    partition: Option<usize>,
    stream: Option<usize>,
    earliest_cycle: i64,
    sched_cycle: i64,
    run_on_cpu: bool,
    /// Designated critical successor, kept for diagnostics.
    first_child: Option<usize>,
    is_exit: bool,
}

impl DagNode {
    fn can_use_stream(&self) -> bool {
        !self.run_on_cpu
    }
}

/// Dense partition table: id → accumulated weight.
#[derive(Debug, Default)]
struct PartitionTable {
    weight_sum: Vec<i64>,
}

impl PartitionTable {
    fn create(&mut self) -> usize {
        self.weight_sum.push(0);
        self.weight_sum.len() - 1
    }

    fn add_weight(&mut self, partition: usize, weight: i64) {
        self.weight_sum[partition] += weight;
    }

    fn load(&self, partition: usize) -> i64 {
        self.weight_sum[partition]
    }
}

/// Per-stream cursor state during assignment.
struct StreamState {
    next_cycles: Vec<i64>,
    max_cycle: i64,
}

/// Max-heap entry that drains children lightest-first, heaviest last.
#[derive(Eq, PartialEq)]
struct QueuedChild {
    weight_sum: i64,
    ins_ndx: usize,
    node: usize,
}

impl Ord for QueuedChild {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .weight_sum
            .cmp(&self.weight_sum)
            .then(self.ins_ndx.cmp(&other.ins_ndx))
    }
}

impl PartialOrd for QueuedChild {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SchedContext<'a, W> {
    prog: &'a mut Program,
    weights: &'a W,
    nodes: Vec<DagNode>,
    instr_node: HashMap<InsId, usize>,
    exits: Vec<usize>,
    partitions: PartitionTable,
    annotated: bool,
}

impl<'a, W: WeightOracle> SchedContext<'a, W> {
    fn new(prog: &'a mut Program, weights: &'a W) -> Self {
        Self {
            prog,
            weights,
            nodes: Vec::new(),
            instr_node: HashMap::new(),
            exits: Vec::new(),
            partitions: PartitionTable::default(),
            annotated: false,
        }
    }

    /// Static weights from the oracle and subtree sums over distinct
    /// producers; instructions with no consumers become exits, sorted
    /// heaviest first.
    fn compute_weights(&mut self) {
        let order: Vec<InsId> = self.prog.iter().collect();
        for (ndx, ins) in order.into_iter().enumerate() {
            let w = self.weights.call(self.prog[ins].name());
            let mut node = DagNode {
                ins,
                ins_ndx: ndx,
                weight: w.cycles,
                weight_sum: w.cycles,
                partition: None,
                stream: None,
                earliest_cycle: 0,
                sched_cycle: 0,
                run_on_cpu: w.run_on_cpu,
                first_child: None,
                is_exit: false,
            };
            let mut seen: HashSet<usize> = HashSet::new();
            for &arg in &self.prog[ins].inputs {
                let def = self.instr_node[&arg];
                if seen.insert(def) {
                    node.weight_sum += self.nodes[def].weight_sum;
                }
            }
            if self.prog[ins].outputs.is_empty() {
                node.is_exit = true;
                self.exits.push(ndx);
            }
            self.instr_node.insert(ins, ndx);
            self.nodes.push(node);
        }
        let mut exits = std::mem::take(&mut self.exits);
        exits.sort_by(|&a, &b| {
            self.nodes[b]
                .weight_sum
                .cmp(&self.nodes[a].weight_sum)
                .then(self.nodes[a].ins_ndx.cmp(&self.nodes[b].ins_ndx))
        });
        self.exits = exits;
    }

    /// Reverse DFS from the exits. Children are drained from a priority
    /// queue lightest-first onto the DFS stack, so the heaviest child is
    /// descended first and each subtree's critical path is emitted
    /// contiguously at its head. The heaviest child inherits the current
    /// partition and becomes `first_child`; light children inherit too;
    /// everything else opens a fresh partition.
    fn weighted_topo_sort(&mut self) -> Vec<usize> {
        let mut sorted: Vec<usize> = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = Vec::new();
        let mut queue: BinaryHeap<QueuedChild> = BinaryHeap::new();
        let mut visited = vec![false; self.nodes.len()];
        let mut emitted = vec![false; self.nodes.len()];

        for exit_ndx in 0..self.exits.len() {
            let exit = self.exits[exit_ndx];
            stack.push(exit);
            let p = self.partitions.create();
            self.nodes[exit].partition = Some(p);
            self.partitions.add_weight(p, self.nodes[exit].weight);

            while let Some(&cur) = stack.last() {
                if emitted[cur] {
                    stack.pop();
                    continue;
                }
                let has_inputs = !self.prog[self.nodes[cur].ins].inputs.is_empty();
                if visited[cur] || !has_inputs {
                    stack.pop();
                    sorted.push(cur);
                    emitted[cur] = true;
                    continue;
                }
                let inputs = self.prog[self.nodes[cur].ins].inputs.clone();
                for arg in inputs {
                    let child = self.instr_node[&arg];
                    if !emitted[child] {
                        queue.push(QueuedChild {
                            weight_sum: self.nodes[child].weight_sum,
                            ins_ndx: self.nodes[child].ins_ndx,
                            node: child,
                        });
                    }
                }
                let cur_partition = self.nodes[cur].partition.expect("parent is partitioned");
                while let Some(entry) = queue.pop() {
                    let child = entry.node;
                    stack.push(child);
                    let p = if self.nodes[child].weight_sum < MIN_PARTITION_WEIGHT {
                        cur_partition
                    } else if !queue.is_empty() {
                        self.partitions.create()
                    } else {
                        self.nodes[cur].first_child = Some(child);
                        cur_partition
                    };
                    self.nodes[child].partition = Some(p);
                    self.partitions.add_weight(p, self.nodes[child].weight);
                }
                visited[cur] = true;
            }
        }
        log::debug!(
            "pre-scheduling: {} nodes, {} partitions, {} exits",
            self.nodes.len(),
            self.partitions.weight_sum.len(),
            self.exits.len(),
        );
        sorted
    }

    /// Walks the topological order assigning streams, then re-sorts by
    /// scheduled cycle with the original position as tiebreak.
    fn assign_streams(&mut self, order: &mut Vec<usize>, num_streams: usize) {
        if num_streams == 0 {
            return;
        }
        let mut info = StreamState {
            next_cycles: vec![0; num_streams],
            max_cycle: 0,
        };
        let mut partition_stream: HashMap<usize, usize> = HashMap::new();
        for &n in order.iter() {
            let partition = self.nodes[n]
                .partition
                .expect("topological sort partitions every node");
            let stream = match partition_stream.get(&partition) {
                Some(&s) => s,
                None => self.pick_stream(&info, n, num_streams),
            };
            self.nodes[n].stream = Some(stream);
            self.record(&mut info, n);
            partition_stream.insert(partition, stream);
        }
        order.sort_by(|&a, &b| {
            self.nodes[a]
                .sched_cycle
                .cmp(&self.nodes[b].sched_cycle)
                .then(self.nodes[a].ins_ndx.cmp(&self.nodes[b].ins_ndx))
        });
    }

    /// First stream that can absorb the node's partition before the
    /// current high-water mark; otherwise the stream that frees earliest.
    fn pick_stream(&self, info: &StreamState, n: usize, num_streams: usize) -> usize {
        if info.max_cycle == 0 {
            return 0;
        }
        let load = self
            .partitions
            .load(self.nodes[n].partition.expect("node is partitioned"));
        let earliest = self.nodes[n].earliest_cycle;
        let mut min_cycle = i64::MAX;
        let mut min_stream = 0;
        for s in 0..num_streams {
            let cycle = info.next_cycles[s].max(earliest);
            if cycle < info.max_cycle && (info.max_cycle - cycle) > load {
                return s;
            }
            if cycle < min_cycle {
                min_cycle = cycle;
                min_stream = s;
            }
        }
        min_stream
    }

    /// Books the node on its stream, floors every consumer's data-ready
    /// cycle, and emits stream/event annotations onto the instruction.
    fn record(&mut self, info: &mut StreamState, n: usize) {
        let stream = self.nodes[n].stream.expect("stream chosen before record");
        let sched = self.nodes[n].earliest_cycle.max(info.next_cycles[stream]);
        self.nodes[n].sched_cycle = sched;
        let next = sched + self.nodes[n].weight;
        info.next_cycles[stream] = next;
        info.max_cycle = info.max_cycle.max(next);

        let ins = self.nodes[n].ins;
        let outputs = self.prog[ins].outputs.clone();
        for out in outputs {
            let user = self.instr_node[&out];
            self.nodes[user].earliest_cycle = self.nodes[user].earliest_cycle.max(next);
        }

        if self.nodes[n].can_use_stream() {
            if self.prog[ins].stream != Some(stream) {
                self.prog[ins].stream = Some(stream);
                self.annotated = true;
            }
            let inputs = self.prog[ins].inputs.clone();
            for arg in inputs {
                match self.prog[arg].stream {
                    Some(s) if s != stream => {
                        if !self.prog[arg].has_mask(EventMask::RECORD_EVENT) {
                            self.prog[arg].add_mask(EventMask::RECORD_EVENT);
                            self.annotated = true;
                        }
                        if !self.prog[ins].has_mask(EventMask::WAIT_EVENT) {
                            self.prog[ins].add_mask(EventMask::WAIT_EVENT);
                            self.annotated = true;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Reorders the underlying program to match the scheduled sequence by
    /// walking it back to front and moving each instruction before its
    /// successor.
    fn splice(&mut self, order: &[usize]) {
        if order.len() < 2 {
            return;
        }
        let mut insert_before = self.nodes[*order.last().expect("non-empty order")].ins;
        for &n in order[..order.len() - 1].iter().rev() {
            insert_before = self.prog.move_before(self.nodes[n].ins, insert_before);
        }
    }
}
