//! Dependency DAG over model ops and its depth layering.

use log::{debug, info};
use rustc_hash::FxHashMap;

use crate::error::{Result, SchedError};
use crate::model::{Model, OpId};
use crate::tensor::TensorId;

/// The op dependency DAG, layered by depth.
///
/// An edge A -> B exists iff any output tensor of A is an input of B.
/// `depth` is the longest-path distance from the sources; two ops at the
/// same depth have no data dependency between them. Depths that contain
/// send/recv ops hold only send/recv ops, so the transport layer sees a
/// synchronous barrier.
#[derive(Debug)]
pub struct OpGraph {
    depth_of: Vec<usize>,
    depths: Vec<Vec<OpId>>,
    send_recv_ops: Vec<OpId>,
}

impl OpGraph {
    /// Builds the DAG from the model's declared op list.
    pub fn build(model: &Model) -> Result<Self> {
        let n = model.ops().len();

        // Every op writing a tensor is a producer of it. Multiple writers
        // are legal at this point; the layering below rejects the cyclic
        // cases.
        let mut producers: FxHashMap<TensorId, Vec<usize>> = FxHashMap::default();
        for (i, op) in model.ops().iter().enumerate() {
            for &out in &op.outputs {
                producers.entry(out).or_default().push(i);
            }
        }

        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];
        for (b, op) in model.ops().iter().enumerate() {
            for &t in &op.inputs {
                for &a in producers.get(&t).map(Vec::as_slice).unwrap_or(&[]) {
                    if a != b && !succs[a].contains(&b) {
                        succs[a].push(b);
                        indegree[b] += 1;
                    }
                }
            }
        }

        // Kahn layering; depth is the longest path from any source. Ready
        // ops are taken in declaration order so ties are deterministic.
        let mut depth_of = vec![0usize; n];
        let mut placed = vec![false; n];
        let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut done = 0;
        while let Some(&a) = ready.first() {
            ready.remove(0);
            placed[a] = true;
            done += 1;
            for &b in &succs[a] {
                depth_of[b] = depth_of[b].max(depth_of[a] + 1);
                indegree[b] -= 1;
                if indegree[b] == 0 {
                    let pos = ready.partition_point(|&x| x < b);
                    ready.insert(pos, b);
                }
            }
        }
        if done < n {
            let op_ids = (0..n).filter(|&i| !placed[i]).collect::<Vec<_>>();
            return Err(SchedError::CyclicGraph { op_ids });
        }

        let mut graph = OpGraph {
            depth_of,
            depths: Vec::new(),
            send_recv_ops: model
                .ops()
                .iter()
                .filter(|op| op.otype.is_comm())
                .map(|op| op.id)
                .collect(),
        };
        graph.layer(model);
        graph.hoist_comm(model);
        info!(
            "op graph: {} ops in {} depths, {} send/recv",
            n,
            graph.depths.len(),
            graph.send_recv_ops.len()
        );
        Ok(graph)
    }

    /// Groups ops into per-depth lists, declaration order inside a depth.
    fn layer(&mut self, model: &Model) {
        let max_depth = self.depth_of.iter().copied().max().map_or(0, |d| d + 1);
        self.depths = vec![Vec::new(); max_depth];
        for (i, op) in model.ops().iter().enumerate() {
            self.depths[self.depth_of[i]].push(op.id);
        }
    }

    /// Splits every depth that mixes compute and communication: compute
    /// ops keep the earlier slot, send/recv ops move to a depth of their
    /// own right after. Relative depth order is otherwise preserved, so
    /// all dependencies stay satisfied.
    fn hoist_comm(&mut self, model: &Model) {
        let mut depths = Vec::with_capacity(self.depths.len());
        for layer in self.depths.drain(..) {
            let (comm, compute): (Vec<OpId>, Vec<OpId>) = layer
                .into_iter()
                .partition(|&id| model.ops()[id.0].otype.is_comm());
            if !compute.is_empty() {
                depths.push(compute);
            }
            if !comm.is_empty() {
                debug!("hoisted {} send/recv ops to depth {}", comm.len(), depths.len());
                depths.push(comm);
            }
        }
        for (d, layer) in depths.iter().enumerate() {
            for &id in layer {
                self.depth_of[id.0] = d;
            }
        }
        self.depths = depths;
    }

    /// Number of depth layers.
    pub fn num_depths(&self) -> usize {
        self.depths.len()
    }

    /// Depth of an op.
    pub fn depth(&self, op: OpId) -> usize {
        self.depth_of[op.0]
    }

    /// Ops at a depth, in declaration order.
    pub fn ops_at(&self, depth: usize) -> &[OpId] {
        &self.depths[depth]
    }

    /// All depth layers in execution order.
    pub fn depths(&self) -> &[Vec<OpId>] {
        &self.depths
    }

    /// Send/recv ops in declaration order.
    pub fn send_recv_ops(&self) -> &[OpId] {
        &self.send_recv_ops
    }

    /// True if the depth consists of send/recv ops.
    pub fn is_comm_depth(&self, model: &Model, depth: usize) -> bool {
        self.depths[depth]
            .iter()
            .any(|&id| model.ops()[id.0].otype.is_comm())
    }
}
