//! Scheduled ops and the per-depth sequence builder.
//!
//! A [`SchedOpSeq`] is a run of ops sharing one kernel invocation. The
//! builder merges ops of a depth under the per-sequence warp cap; the
//! sequence hash identifies the generated kernel, so equal sequences
//! share source.

use log::debug;

use crate::catalog::KernelCatalog;
use crate::device::DeviceInfo;
use crate::graph::OpGraph;
use crate::model::{Model, Op, OpConfig, OpId};
use crate::sched::planner::{BufferPlan, PhysicalAddress};
use crate::shape::div_up;
use crate::tensor::TensorBufId;

/// One op as scheduled: operands resolved to physical locations, a warp
/// count, an SM affinity (-1 when unconstrained) and its ordinal within
/// the depth.
#[derive(Debug, Clone)]
pub struct SchedOp {
    pub op: OpId,
    pub inputs: Vec<PhysicalAddress>,
    pub outputs: Vec<PhysicalAddress>,
    pub warps: u32,
    pub sm_affinity: i32,
    pub ordinal: usize,
}

/// An ordered run of ops sharing one kernel launch.
#[derive(Debug, Clone)]
pub struct SchedOpSeq {
    /// Sequence number within its depth.
    pub id: usize,
    pub depth: usize,
    pub ops: Vec<SchedOp>,
    /// Total warp requirement.
    pub warps: u32,
    /// SMs the sequence occupies at `warps_per_sm` warps each.
    pub sm_demand: u32,
    /// Signature hash; equal hashes share generated source.
    pub hash: u64,
    /// Buffers the sequence touches, for affinity packing.
    pub bufs: Vec<TensorBufId>,
    /// Output payload bytes, the profiler's unit of work.
    pub bytes: u64,
    /// True if the sequence carries send/recv ops.
    pub comm: bool,
}

/// Builds the sequences of one depth.
pub fn build_seqs(
    model: &Model,
    graph: &OpGraph,
    plan: &BufferPlan,
    catalog: &dyn KernelCatalog,
    info: &DeviceInfo,
    depth: usize,
    wps: u32,
) -> Vec<SchedOpSeq> {
    let mut seqs: Vec<SchedOpSeq> = Vec::new();
    let mut current: Vec<(&Op, SchedOp)> = Vec::new();

    let flush = |group: &mut Vec<(&Op, SchedOp)>, seqs: &mut Vec<SchedOpSeq>| {
        if group.is_empty() {
            return;
        }
        let ops: Vec<&Op> = group.iter().map(|(op, _)| *op).collect();
        let scheds: Vec<SchedOp> = group.drain(..).map(|(_, s)| s).collect();
        let warps = scheds.iter().map(|s| s.warps).sum();
        let id = seqs.len();
        seqs.push(SchedOpSeq {
            id,
            depth,
            hash: seq_hash(&ops, model),
            bufs: seq_bufs(&ops, model),
            bytes: ops
                .iter()
                .flat_map(|op| op.outputs.iter())
                .map(|&t| model.get_tensor(t).shape_bytes() as u64)
                .sum(),
            comm: ops.iter().any(|op| op.otype.is_comm()),
            ops: scheds,
            warps,
            sm_demand: div_up(i64::from(warps), i64::from(info.warps_per_sm)) as u32,
        });
    };

    for (ordinal, &op_id) in graph.ops_at(depth).iter().enumerate() {
        let op = &model.ops()[op_id.0];
        let sched = SchedOp {
            op: op_id,
            inputs: resolve_all(&op.inputs, model, plan),
            outputs: resolve_all(&op.outputs, model, plan),
            warps: catalog.warps_for(op, model),
            sm_affinity: -1,
            ordinal,
        };
        if let Some(last_op) = current.last().map(|(op, _)| *op) {
            if can_merge(last_op, op, &current, &sched, model, catalog, wps) {
                current.push((op, sched));
                continue;
            }
            flush(&mut current, &mut seqs);
        }
        current.push((op, sched));
    }
    flush(&mut current, &mut seqs);
    debug!(
        "depth {depth}: {} ops -> {} sequences",
        graph.ops_at(depth).len(),
        seqs.len()
    );
    seqs
}

/// Merge rule for consecutive ops A, B of one depth: B either consumes
/// only outputs of A, or the two are data-parallel siblings over the same
/// shape without a conflicting output buffer. The combined warp count must
/// stay under the per-sequence cap and the opcodes must be declared
/// sequence-compatible.
fn can_merge(
    a: &Op,
    b: &Op,
    group: &[(&Op, SchedOp)],
    sched_b: &SchedOp,
    model: &Model,
    catalog: &dyn KernelCatalog,
    wps: u32,
) -> bool {
    if !catalog.seq_compatible(a.otype, b.otype) {
        return false;
    }
    let group_warps: u32 = group.iter().map(|(_, s)| s.warps).sum();
    if group_warps + sched_b.warps > wps {
        return false;
    }
    let chained = !b.inputs.is_empty() && b.inputs.iter().all(|t| a.outputs.contains(t));
    if chained {
        return true;
    }
    // Data-parallel siblings: same output shape, disjoint output buffers
    // across the whole group.
    let shape_a = &model.get_tensor(a.outputs[0]).shape;
    let shape_b = &model.get_tensor(b.outputs[0]).shape;
    if shape_a != shape_b {
        return false;
    }
    let out_bufs_b: Vec<TensorBufId> =
        b.outputs.iter().map(|&t| model.get_tensor(t).buf).collect();
    group.iter().all(|(op, _)| {
        op.outputs
            .iter()
            .all(|&t| !out_bufs_b.contains(&model.get_tensor(t).buf))
    })
}

fn resolve_all(
    tensors: &[crate::tensor::TensorId],
    model: &Model,
    plan: &BufferPlan,
) -> Vec<PhysicalAddress> {
    tensors
        .iter()
        .filter_map(|&t| plan.resolve(model.get_tensor(t)))
        .collect()
}

fn seq_bufs(ops: &[&Op], model: &Model) -> Vec<TensorBufId> {
    let mut bufs: Vec<TensorBufId> = ops
        .iter()
        .flat_map(|op| op.inputs.iter().chain(op.outputs.iter()))
        .map(|&t| model.get_tensor(t).buf)
        .collect();
    bufs.sort_unstable();
    bufs.dedup();
    bufs
}

/// Signature hash of a sequence: opcodes, canonical shapes, element types
/// and tile parameters, folded with FNV-1a so the value is stable across
/// processes.
pub fn seq_hash(ops: &[&Op], model: &Model) -> u64 {
    let mut h = Fnv1a::new();
    for op in ops {
        h.write_bytes(op.otype.name().as_bytes());
        for &t in op.inputs.iter().chain(op.outputs.iter()) {
            let tensor = model.get_tensor(t);
            h.write_bytes(tensor.ttype.name().as_bytes());
            for &d in tensor.shape.as_slice() {
                h.write_u64(d as u64);
            }
            for &d in tensor.ldims.as_slice() {
                h.write_u64(d as u64);
            }
            for &d in tensor.offs.as_slice() {
                h.write_u64(d as u64);
            }
        }
        match &op.cfg {
            OpConfig::None => h.write_u64(0),
            OpConfig::Scale(f) => h.write_u64(u64::from(f.to_bits())),
            OpConfig::Transpose(perm) => {
                for &p in perm {
                    h.write_u64(p as u64);
                }
            }
            OpConfig::Matmul { tile_m, tile_n } => {
                h.write_u64(*tile_m as u64);
                h.write_u64(*tile_n as u64);
            }
            OpConfig::Comm { peer, sid } => {
                h.write_u64(*peer as u64);
                h.write_u64(*sid as u64);
            }
            OpConfig::FusedChain(steps) => {
                for step in steps {
                    h.write_bytes(step.op.name().as_bytes());
                    h.write_u64(u64::from(step.factor.unwrap_or(0.0).to_bits()));
                }
            }
        }
    }
    h.finish()
}

/// Minimal FNV-1a, kept in-crate so hashes do not depend on std hasher
/// seeds.
struct Fnv1a(u64);

impl Fnv1a {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    fn new() -> Self {
        Fnv1a(Self::OFFSET)
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0 ^ u64::from(b)).wrapping_mul(Self::PRIME);
        }
    }

    fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DefaultCatalog;
    use crate::device::HostDevice;
    use crate::ipc::LocalHub;
    use crate::sched::planner::{plan_buffers, ArenaStrategy};
    use crate::shape::Dims;
    use crate::tensor::TensorType;
    use std::time::Duration;

    fn dims(v: &[i64]) -> Dims {
        Dims::new(v.to_vec()).unwrap()
    }

    fn info() -> DeviceInfo {
        DeviceInfo {
            sm_count: 4,
            warps_per_sm: 16,
            bytes_free: 1 << 26,
        }
    }

    fn setup(m: &Model) -> (OpGraph, BufferPlan) {
        let g = OpGraph::build(m).unwrap();
        let dev = HostDevice::new(info());
        let hub = LocalHub::new();
        let t = hub.transport_for(0);
        let plan = plan_buffers(
            m,
            &g,
            0,
            &dev,
            &t,
            ArenaStrategy::ReuseDisjoint,
            Duration::from_millis(10),
        )
        .unwrap();
        (g, plan)
    }

    #[test]
    fn test_siblings_merge_under_cap() {
        // Two small parallel relu ops at depth 0 fuse into one sequence.
        let mut m = Model::new();
        let x = m.tensor(dims(&[64]), TensorType::Fp32).unwrap();
        let y = m.tensor(dims(&[64]), TensorType::Fp32).unwrap();
        let a = m.relu(x).unwrap();
        let b = m.relu(y).unwrap();
        m.mark_output(a);
        m.mark_output(b);
        let (g, plan) = setup(&m);
        let seqs = build_seqs(&m, &g, &plan, &DefaultCatalog, &info(), 0, 16);
        assert_eq!(seqs.len(), 1);
        assert_eq!(seqs[0].ops.len(), 2);
        assert_eq!(seqs[0].warps, 2);
    }

    #[test]
    fn test_warp_cap_splits_sequences() {
        // Four 10-warp siblings under a 16-warp cap stay separate.
        let mut m = Model::new();
        let mut outs = Vec::new();
        for _ in 0..4 {
            let x = m.tensor(dims(&[81920]), TensorType::Fp32).unwrap();
            let o = m.relu(x).unwrap();
            m.mark_output(o);
            outs.push(o);
        }
        let (g, plan) = setup(&m);
        let seqs = build_seqs(&m, &g, &plan, &DefaultCatalog, &info(), 0, 16);
        assert_eq!(seqs.len(), 4);
        assert!(seqs.iter().all(|s| s.warps == 10));
    }

    #[test]
    fn test_incompatible_ops_split() {
        let mut m = Model::new();
        let x = m.tensor(dims(&[8, 8]), TensorType::Fp32).unwrap();
        let y = m.tensor(dims(&[8, 8]), TensorType::Fp32).unwrap();
        let t = m.transpose(x, &[1, 0]).unwrap();
        let r = m.relu(y).unwrap();
        m.mark_output(t);
        m.mark_output(r);
        let (g, plan) = setup(&m);
        let seqs = build_seqs(&m, &g, &plan, &DefaultCatalog, &info(), 0, 16);
        assert_eq!(seqs.len(), 2);
    }

    #[test]
    fn test_equal_sequences_share_hash() {
        let mut m = Model::new();
        let x = m.tensor(dims(&[81920]), TensorType::Fp32).unwrap();
        let y = m.tensor(dims(&[81920]), TensorType::Fp32).unwrap();
        let a = m.relu(x).unwrap();
        let b = m.relu(y).unwrap();
        m.mark_output(a);
        m.mark_output(b);
        let (g, plan) = setup(&m);
        let seqs = build_seqs(&m, &g, &plan, &DefaultCatalog, &info(), 0, 16);
        assert_eq!(seqs.len(), 2);
        assert_eq!(seqs[0].hash, seqs[1].hash);
    }

    #[test]
    fn test_different_shapes_differ_in_hash() {
        let mut m = Model::new();
        let x = m.tensor(dims(&[81920]), TensorType::Fp32).unwrap();
        let y = m.tensor(dims(&[40960]), TensorType::Fp32).unwrap();
        let a = m.relu(x).unwrap();
        let b = m.relu(y).unwrap();
        m.mark_output(a);
        m.mark_output(b);
        let (g, plan) = setup(&m);
        let seqs = build_seqs(&m, &g, &plan, &DefaultCatalog, &info(), 0, 16);
        assert_eq!(seqs.len(), 2);
        assert_ne!(seqs[0].hash, seqs[1].hash);
    }
}
