//! Buffer planning: liveness, arena layout and cross-rank import/export.

use std::time::Duration;

use log::{debug, info};
use rustc_hash::FxHashMap;

use crate::device::{DeviceAddress, DeviceManager, IpcHandle};
use crate::error::{Result, SchedError};
use crate::graph::OpGraph;
use crate::ipc::IpcTransport;
use crate::model::Model;
use crate::shape::pad;
use crate::tensor::{Tensor, TensorBufId};

/// Buffers are placed at multiples of this within the arena.
const ARENA_ALIGN: u64 = 256;

/// Arena layout strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaStrategy {
    /// Buffers with disjoint liveness may share bytes.
    ReuseDisjoint,
    /// Strictly sequential layout, for debugging.
    NoReuse,
}

/// Planning record of one buffer.
#[derive(Debug, Clone)]
pub struct BufInfo {
    /// Rank of the GPU holding the buffer; equals the local rank for
    /// buffers allocated here.
    pub gpu_id: i32,
    pub bytes: u64,
    pub tbuf: TensorBufId,
    /// Import/export key; -1 for local-only buffers.
    pub sid: i32,
    /// Byte offset inside the owning arena.
    pub offset: u64,
}

/// A resolved tensor location: buffer base plus view origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAddress {
    pub base: DeviceAddress,
    pub offset_bytes: u64,
}

impl PhysicalAddress {
    pub fn addr(&self) -> DeviceAddress {
        self.base.offset(self.offset_bytes)
    }
}

/// The planner's output: one [`BufInfo`] per planned buffer and the
/// logical-to-physical translation map.
#[derive(Debug)]
pub struct BufferPlan {
    pub buf_infos: Vec<BufInfo>,
    pub buf_trans: FxHashMap<TensorBufId, DeviceAddress>,
    pub arena_bytes: u64,
}

impl BufferPlan {
    /// Physical location of a tensor's view origin.
    pub fn resolve(&self, t: &Tensor) -> Option<PhysicalAddress> {
        let base = *self.buf_trans.get(&t.buf)?;
        let origin = vec![0; t.ndims()];
        Some(PhysicalAddress {
            base,
            offset_bytes: t.offset_bytes(&origin) as u64,
        })
    }

    pub fn info_for(&self, buf: TensorBufId) -> Option<&BufInfo> {
        self.buf_infos.iter().find(|b| b.tbuf == buf)
    }
}

struct BufRecord {
    id: TensorBufId,
    bytes: u64,
    sid: i32,
    imported_rank: i32,
    exported: bool,
    first_depth: usize,
    last_depth: usize,
}

/// Plans every buffer the schedule touches.
#[allow(clippy::too_many_arguments)]
pub fn plan_buffers(
    model: &Model,
    graph: &OpGraph,
    gpu_id: i32,
    device: &dyn DeviceManager,
    transport: &dyn IpcTransport,
    strategy: ArenaStrategy,
    import_deadline: Duration,
) -> Result<BufferPlan> {
    let records = collect_records(model, graph);

    // Duplicate export sids are a hard error before anything is placed.
    let mut sid_owner: FxHashMap<i32, TensorBufId> = FxHashMap::default();
    for r in records.iter().filter(|r| r.exported && r.sid >= 0) {
        if let Some(&first) = sid_owner.get(&r.sid) {
            return Err(SchedError::ExportConflict {
                sid: r.sid,
                first: first.0,
                second: r.id.0,
            });
        }
        sid_owner.insert(r.sid, r.id);
    }

    let (offsets, arena_bytes) = layout_arena(&records, strategy);

    let dev_info = device.device_info();
    if arena_bytes > dev_info.bytes_free {
        return Err(SchedError::OutOfDeviceMemory {
            needed: arena_bytes,
            available: dev_info.bytes_free,
        });
    }
    let arena = device.allocate_arena(arena_bytes)?;
    info!("buffer plan: {} buffers, {arena_bytes} arena bytes", records.len());

    let mut buf_infos = Vec::with_capacity(records.len());
    let mut buf_trans = FxHashMap::default();
    for r in &records {
        if r.imported_rank >= 0 {
            let handle = transport.lookup(r.imported_rank, r.sid, import_deadline)?;
            let addr = device.resolve_import(&handle)?;
            buf_trans.insert(r.id, addr);
            buf_infos.push(BufInfo {
                gpu_id: r.imported_rank,
                bytes: r.bytes,
                tbuf: r.id,
                sid: r.sid,
                offset: 0,
            });
        } else {
            let offset = offsets[&r.id];
            let addr = arena.offset(offset);
            if r.exported && r.sid >= 0 {
                device.register_export(r.sid, addr, r.bytes)?;
                transport.publish(
                    r.sid,
                    IpcHandle {
                        addr,
                        bytes: r.bytes,
                    },
                )?;
            }
            buf_trans.insert(r.id, addr);
            buf_infos.push(BufInfo {
                gpu_id,
                bytes: r.bytes,
                tbuf: r.id,
                sid: r.sid,
                offset,
            });
        }
    }
    Ok(BufferPlan {
        buf_infos,
        buf_trans,
        arena_bytes,
    })
}

/// Gathers the buffers worth planning: those an op touches, plus every
/// exported, imported or output-marked one. Dangling views left behind by
/// optimization get no space.
fn collect_records(model: &Model, graph: &OpGraph) -> Vec<BufRecord> {
    let max_depth = graph.num_depths().saturating_sub(1);
    let mut touched: FxHashMap<TensorBufId, (usize, usize)> = FxHashMap::default();
    for op in model.ops() {
        let d = graph.depth(op.id);
        for &t in op.inputs.iter().chain(op.outputs.iter()) {
            let buf = model.get_tensor(t).buf;
            let e = touched.entry(buf).or_insert((d, d));
            e.0 = e.0.min(d);
            e.1 = e.1.max(d);
        }
    }

    let mut records = Vec::new();
    for buf in model.bufs() {
        let exported = model
            .tensors()
            .iter()
            .any(|t| t.buf == buf.id && t.exported);
        let observed = exported
            || model
                .outputs()
                .iter()
                .any(|&t| model.get_tensor(t).buf == buf.id);
        let live = touched.get(&buf.id).copied();
        if live.is_none() && !observed && buf.imported_rank < 0 {
            continue;
        }
        let (first, last) = live.unwrap_or((0, max_depth));
        // Anything observable from outside stays live to the end.
        let last = if observed { max_depth } else { last };
        let bytes = model
            .tensors()
            .iter()
            .filter(|t| t.buf == buf.id)
            .map(|t| t.ldims_bytes() as u64)
            .max()
            .unwrap_or(buf.bytes)
            .max(buf.bytes);
        records.push(BufRecord {
            id: buf.id,
            bytes,
            sid: buf.sid,
            imported_rank: buf.imported_rank,
            exported,
            first_depth: first,
            last_depth: last,
        });
    }
    records
}

/// Lays out local buffers in the arena: decreasing size, ties by id,
/// first-fit into the lowest gap not claimed by a conflicting buffer.
fn layout_arena(
    records: &[BufRecord],
    strategy: ArenaStrategy,
) -> (FxHashMap<TensorBufId, u64>, u64) {
    let mut order: Vec<&BufRecord> = records.iter().filter(|r| r.imported_rank < 0).collect();
    order.sort_by(|a, b| b.bytes.cmp(&a.bytes).then(a.id.cmp(&b.id)));

    let mut placed: Vec<(&BufRecord, u64)> = Vec::new();
    let mut arena_end = 0u64;
    for r in &order {
        let size = pad(r.bytes.max(1) as i64, ARENA_ALIGN as i64) as u64;
        let mut conflicts: Vec<(u64, u64)> = placed
            .iter()
            .filter(|(p, _)| match strategy {
                ArenaStrategy::NoReuse => true,
                ArenaStrategy::ReuseDisjoint => {
                    let live_overlap =
                        r.first_depth <= p.last_depth && p.first_depth <= r.last_depth;
                    live_overlap || r.exported || p.exported
                }
            })
            .map(|(p, off)| (*off, *off + pad(p.bytes.max(1) as i64, ARENA_ALIGN as i64) as u64))
            .collect();
        conflicts.sort_unstable();

        let mut offset = 0u64;
        for &(start, end) in &conflicts {
            if offset + size <= start {
                break;
            }
            offset = offset.max(end);
        }
        debug!(
            "buf {} ({} bytes, live {}..{}): arena offset {offset}",
            r.id.0, r.bytes, r.first_depth, r.last_depth
        );
        placed.push((r, offset));
        arena_end = arena_end.max(offset + size);
    }

    let offsets = placed.into_iter().map(|(r, off)| (r.id, off)).collect();
    (offsets, arena_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceInfo, HostDevice};
    use crate::ipc::LocalHub;
    use crate::shape::Dims;
    use crate::tensor::TensorType;

    fn dims(v: &[i64]) -> Dims {
        Dims::new(v.to_vec()).unwrap()
    }

    fn info() -> DeviceInfo {
        DeviceInfo {
            sm_count: 4,
            warps_per_sm: 16,
            bytes_free: 1 << 24,
        }
    }

    /// x -> relu -> relu -> relu -> relu, four depths.
    fn chain_model() -> (Model, OpGraph) {
        let mut m = Model::new();
        let x = m.tensor(dims(&[16]), TensorType::Fp32).unwrap();
        let a = m.relu(x).unwrap();
        let b = m.relu(a).unwrap();
        let c = m.relu(b).unwrap();
        let d = m.relu(c).unwrap();
        m.mark_output(d);
        let g = OpGraph::build(&m).unwrap();
        (m, g)
    }

    fn plan(m: &Model, g: &OpGraph, strategy: ArenaStrategy) -> BufferPlan {
        let dev = HostDevice::new(info());
        let hub = LocalHub::new();
        let t = hub.transport_for(0);
        plan_buffers(m, g, 0, &dev, &t, strategy, Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn test_disjoint_liveness_buffers_reuse_bytes() {
        let (m, g) = chain_model();
        let reuse = plan(&m, &g, ArenaStrategy::ReuseDisjoint);
        let none = plan(&m, &g, ArenaStrategy::NoReuse);

        // relu outputs: bufs 1 (live 0..1) and 3 (live 2..3) can share.
        let b1 = reuse.info_for(TensorBufId(1)).unwrap();
        let b3 = reuse.info_for(TensorBufId(3)).unwrap();
        assert_eq!(b1.offset, b3.offset);

        let b1 = none.info_for(TensorBufId(1)).unwrap();
        let b3 = none.info_for(TensorBufId(3)).unwrap();
        assert_ne!(b1.offset, b3.offset);
        assert!(none.arena_bytes > reuse.arena_bytes);
    }

    #[test]
    fn test_live_overlap_stays_disjoint() {
        let (m, g) = chain_model();
        let p = plan(&m, &g, ArenaStrategy::ReuseDisjoint);

        // Consecutive relu buffers overlap in liveness and must not share.
        for w in [[0usize, 1], [1, 2], [2, 3], [3, 4]] {
            let a = p.info_for(TensorBufId(w[0])).unwrap();
            let b = p.info_for(TensorBufId(w[1])).unwrap();
            let disjoint = a.offset + a.bytes <= b.offset || b.offset + b.bytes <= a.offset;
            assert!(disjoint, "bufs {w:?} overlap");
        }
    }

    #[test]
    fn test_out_of_memory() {
        let mut m = Model::new();
        let x = m.tensor(dims(&[1024, 1024]), TensorType::Fp32).unwrap();
        m.mark_output(x);
        let g = OpGraph::build(&m).unwrap();
        let dev = HostDevice::new(DeviceInfo {
            sm_count: 4,
            warps_per_sm: 16,
            bytes_free: 1024,
        });
        let hub = LocalHub::new();
        let t = hub.transport_for(0);
        let err = plan_buffers(
            &m,
            &g,
            0,
            &dev,
            &t,
            ArenaStrategy::ReuseDisjoint,
            Duration::from_millis(10),
        )
        .unwrap_err();
        assert!(matches!(err, SchedError::OutOfDeviceMemory { .. }));
    }

    #[test]
    fn test_export_conflict() {
        let mut m = Model::new();
        let a = m.tensor(dims(&[16]), TensorType::Fp32).unwrap();
        let b = m.tensor(dims(&[16]), TensorType::Fp32).unwrap();
        m.export(a, 3);
        m.export(b, 3);
        let g = OpGraph::build(&m).unwrap();
        let dev = HostDevice::new(info());
        let hub = LocalHub::new();
        let t = hub.transport_for(0);
        let err = plan_buffers(
            &m,
            &g,
            0,
            &dev,
            &t,
            ArenaStrategy::ReuseDisjoint,
            Duration::from_millis(10),
        )
        .unwrap_err();
        assert!(matches!(err, SchedError::ExportConflict { sid: 3, .. }));
    }

    #[test]
    fn test_import_unresolved_after_deadline() {
        let mut m = Model::new();
        let _r = m.import(dims(&[16]), TensorType::Fp32, 1, 9).unwrap();
        let g = OpGraph::build(&m).unwrap();
        let dev = HostDevice::new(info());
        let hub = LocalHub::new();
        let t = hub.transport_for(0);
        let err = plan_buffers(
            &m,
            &g,
            0,
            &dev,
            &t,
            ArenaStrategy::ReuseDisjoint,
            Duration::from_millis(5),
        )
        .unwrap_err();
        assert!(matches!(err, SchedError::ImportUnresolved { rank: 1, sid: 9, .. }));
    }
}
