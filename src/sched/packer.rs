//! Packing sequences of one depth onto the device's SM/warp budget.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rustc_hash::FxHashSet;

use crate::device::{DeviceInfo, DeviceManager};
use crate::error::{Result, SchedError};
use crate::sched::profiler::SeqProfiler;
use crate::sched::seq::SchedOpSeq;
use crate::tensor::TensorBufId;

/// One launch entry: the sequences running concurrently at a depth, the
/// launch geometry and the kernel symbol codegen will emit for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sched {
    pub depth: usize,
    pub entry: usize,
    /// Ids of the sequences in this entry, ascending.
    pub seq_ids: Vec<usize>,
    /// Concurrent warp demand of the entry.
    pub warps: u32,
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub kernel: String,
}

impl Sched {
    fn from_group(depth: usize, entry: usize, mut seq_ids: Vec<usize>, seqs: &[SchedOpSeq]) -> Sched {
        seq_ids.sort_unstable();
        let warps = seq_ids.iter().map(|&i| seqs[i].warps).sum();
        let sm_total: u32 = seq_ids.iter().map(|&i| seqs[i].sm_demand).sum();
        let max_warps = seq_ids.iter().map(|&i| seqs[i].warps).max().unwrap_or(1);
        Sched {
            depth,
            entry,
            seq_ids,
            warps,
            grid: (sm_total.max(1), 1, 1),
            block: (32 * max_warps, 1, 1),
            kernel: format!("sched_d{depth}_e{entry}"),
        }
    }
}

/// Contract shared by the packers: every sequence runs exactly once, the
/// concurrent warp demand of each entry stays within the device budget,
/// and entry order is deterministic.
pub trait Packer {
    fn pack(&self, depth: usize, seqs: &[SchedOpSeq], info: &DeviceInfo) -> Result<Vec<Sched>>;
}

/// A single sequence over the whole device budget can never be packed.
fn check_feasible(depth: usize, seqs: &[SchedOpSeq], budget: u32) -> Result<()> {
    for seq in seqs {
        if seq.warps > budget {
            return Err(SchedError::PackerInfeasible {
                depth,
                seq: seq.id,
                warps: seq.warps,
                budget,
            });
        }
    }
    Ok(())
}

/// Greedy first-fit, descending by warp count, ties by sequence id.
#[derive(Debug, Default)]
pub struct DefaultPacker;

impl Packer for DefaultPacker {
    fn pack(&self, depth: usize, seqs: &[SchedOpSeq], info: &DeviceInfo) -> Result<Vec<Sched>> {
        let budget = info.warp_budget();
        check_feasible(depth, seqs, budget)?;

        let mut order: Vec<usize> = (0..seqs.len()).collect();
        order.sort_by(|&a, &b| seqs[b].warps.cmp(&seqs[a].warps).then(a.cmp(&b)));

        let mut groups: Vec<(Vec<usize>, u32)> = Vec::new();
        for i in order {
            let w = seqs[i].warps;
            match groups.iter_mut().find(|(_, used)| *used + w <= budget) {
                Some((ids, used)) => {
                    ids.push(i);
                    *used += w;
                }
                None => groups.push((vec![i], w)),
            }
        }
        Ok(groups
            .into_iter()
            .enumerate()
            .map(|(e, (ids, _))| Sched::from_group(depth, e, ids, seqs))
            .collect())
    }
}

/// Partitions the depth's sequences by shared-buffer affinity.
///
/// Sequences are nodes of a hypergraph whose hyperedges are shared
/// TensorBufs; the packer greedily grows partitions that keep sharing
/// local, weighted by profiled costs, under the per-partition warp cap.
/// Adjacent partitions whose combined warps still fit are merged
/// afterwards. Exceeding the time budget falls back to [`DefaultPacker`].
pub struct PartitionedPacker {
    device: Arc<dyn DeviceManager>,
    profiler: RefCell<SeqProfiler>,
    time_budget: Duration,
}

impl PartitionedPacker {
    pub fn new(device: Arc<dyn DeviceManager>, time_budget: Duration) -> Self {
        PartitionedPacker {
            device,
            profiler: RefCell::new(SeqProfiler::new()),
            time_budget,
        }
    }

    fn partition(
        &self,
        depth: usize,
        seqs: &[SchedOpSeq],
        budget: u32,
        deadline: Instant,
    ) -> Option<Vec<Vec<usize>>> {
        let mut profiler = self.profiler.borrow_mut();
        let costs: Vec<u64> = seqs
            .iter()
            .map(|s| profiler.cost(self.device.as_ref(), s))
            .collect();

        let mut order: Vec<usize> = (0..seqs.len()).collect();
        order.sort_by(|&a, &b| costs[b].cmp(&costs[a]).then(a.cmp(&b)));

        struct Partition {
            ids: Vec<usize>,
            warps: u32,
            bufs: FxHashSet<TensorBufId>,
        }
        // Aim for the fewest partitions the warp budget allows; a
        // no-affinity sequence opens a fresh partition while slots remain
        // instead of crowding the first one.
        let total_warps: u32 = seqs.iter().map(|s| s.warps).sum();
        let k_target = total_warps.div_ceil(budget).max(1) as usize;

        let mut parts: Vec<Partition> = Vec::new();
        for i in order {
            if Instant::now() >= deadline {
                return None;
            }
            let seq = &seqs[i];
            // Score each partition by how many of the sequence's buffers
            // it already holds; hyperedges kept internal are edges not cut.
            let best = parts
                .iter()
                .enumerate()
                .filter(|(_, p)| p.warps + seq.warps <= budget)
                .map(|(k, p)| {
                    let shared = seq.bufs.iter().filter(|b| p.bufs.contains(*b)).count();
                    (shared, std::cmp::Reverse(p.warps), std::cmp::Reverse(k))
                })
                .max();
            match best {
                Some((shared, _, std::cmp::Reverse(k))) if shared > 0 || parts.len() >= k_target => {
                    parts[k].ids.push(i);
                    parts[k].warps += seq.warps;
                    parts[k].bufs.extend(seq.bufs.iter().copied());
                }
                _ => parts.push(Partition {
                    ids: vec![i],
                    warps: seq.warps,
                    bufs: seq.bufs.iter().copied().collect(),
                }),
            }
        }

        // Deterministic entry order: by smallest sequence id.
        let mut groups: Vec<Vec<usize>> = parts.into_iter().map(|p| p.ids).collect();
        for g in &mut groups {
            g.sort_unstable();
        }
        groups.sort_by_key(|g| g[0]);

        // Simplify: merge neighbors that still fit together.
        let mut merged: Vec<(Vec<usize>, u32)> = Vec::new();
        for g in groups {
            let warps: u32 = g.iter().map(|&i| seqs[i].warps).sum();
            match merged.last_mut() {
                Some((ids, used)) if *used + warps <= budget => {
                    debug!("depth {depth}: merging partition into predecessor");
                    ids.extend(g);
                    *used += warps;
                }
                _ => merged.push((g, warps)),
            }
        }
        Some(merged.into_iter().map(|(ids, _)| ids).collect())
    }
}

impl Packer for PartitionedPacker {
    fn pack(&self, depth: usize, seqs: &[SchedOpSeq], info: &DeviceInfo) -> Result<Vec<Sched>> {
        let budget = info.warp_budget();
        check_feasible(depth, seqs, budget)?;

        let deadline = Instant::now() + self.time_budget;
        match self.partition(depth, seqs, budget, deadline) {
            Some(groups) => Ok(groups
                .into_iter()
                .enumerate()
                .map(|(e, ids)| Sched::from_group(depth, e, ids, seqs))
                .collect()),
            None => {
                warn!("depth {depth}: partitioning exceeded its time budget, using default packer");
                DefaultPacker.pack(depth, seqs, info)
            }
        }
    }
}

/// Communication depths are packed in isolation: one entry holding every
/// sequence, so the transport layer sees a synchronous barrier.
pub fn pack_comm_depth(depth: usize, seqs: &[SchedOpSeq], info: &DeviceInfo) -> Result<Vec<Sched>> {
    let budget = info.warp_budget();
    check_feasible(depth, seqs, budget)?;
    let total: u32 = seqs.iter().map(|s| s.warps).sum();
    if total > budget {
        return Err(SchedError::PackerInfeasible {
            depth,
            seq: seqs.last().map(|s| s.id).unwrap_or(0),
            warps: total,
            budget,
        });
    }
    Ok(vec![Sched::from_group(
        depth,
        0,
        (0..seqs.len()).collect(),
        seqs,
    )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    fn seq(id: usize, warps: u32, bufs: &[usize]) -> SchedOpSeq {
        SchedOpSeq {
            id,
            depth: 0,
            ops: Vec::new(),
            warps,
            sm_demand: warps.div_ceil(16),
            hash: id as u64,
            bufs: bufs.iter().map(|&b| TensorBufId(b)).collect(),
            bytes: 1024,
            comm: false,
        }
    }

    fn info() -> DeviceInfo {
        DeviceInfo {
            sm_count: 2,
            warps_per_sm: 16,
            bytes_free: 1 << 20,
        }
    }

    #[test]
    fn test_first_fit_descending() {
        // Four 10-warp sequences under a 32-warp budget: 3 + 1.
        let seqs: Vec<_> = (0..4).map(|i| seq(i, 10, &[i])).collect();
        let scheds = DefaultPacker.pack(0, &seqs, &info()).unwrap();
        assert_eq!(scheds.len(), 2);
        assert_eq!(scheds[0].seq_ids, vec![0, 1, 2]);
        assert_eq!(scheds[0].warps, 30);
        assert_eq!(scheds[1].seq_ids, vec![3]);
        assert_eq!(scheds[1].warps, 10);
    }

    #[test]
    fn test_oversized_sequence_is_infeasible() {
        let seqs = vec![seq(0, 33, &[0])];
        let err = DefaultPacker.pack(2, &seqs, &info()).unwrap_err();
        assert!(matches!(
            err,
            SchedError::PackerInfeasible {
                depth: 2,
                seq: 0,
                warps: 33,
                budget: 32
            }
        ));
    }

    #[test]
    fn test_every_sequence_packed_once() {
        let seqs: Vec<_> = (0..9).map(|i| seq(i, (i as u32 % 5) + 3, &[i])).collect();
        let scheds = DefaultPacker.pack(0, &seqs, &info()).unwrap();
        let mut all: Vec<usize> = scheds.iter().flat_map(|s| s.seq_ids.clone()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..9).collect::<Vec<_>>());
        assert!(scheds.iter().all(|s| s.warps <= 32));
    }

    #[test]
    fn test_partitioned_groups_by_shared_buffers() {
        let dev: Arc<dyn DeviceManager> = Arc::new(HostDevice::new(info()));
        let packer = PartitionedPacker::new(dev, Duration::from_secs(1));
        // Sequences 0/2 share buffer 7, sequences 1/3 share buffer 8; the
        // pairs exceed one entry's budget only when split badly.
        let seqs = vec![
            seq(0, 12, &[7]),
            seq(1, 12, &[8]),
            seq(2, 12, &[7]),
            seq(3, 12, &[8]),
        ];
        let scheds = packer.pack(0, &seqs, &info()).unwrap();
        let mut all: Vec<usize> = scheds.iter().flat_map(|s| s.seq_ids.clone()).collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);
        for s in &scheds {
            assert!(s.warps <= 32);
        }
        // Buffer-sharing pairs end up in the same entry.
        let entry_of = |id: usize| scheds.iter().position(|s| s.seq_ids.contains(&id)).unwrap();
        assert_eq!(entry_of(0), entry_of(2));
        assert_eq!(entry_of(1), entry_of(3));
    }

    #[test]
    fn test_partitioned_zero_budget_falls_back() {
        let dev: Arc<dyn DeviceManager> = Arc::new(HostDevice::new(info()));
        let packer = PartitionedPacker::new(dev, Duration::from_secs(0));
        let seqs: Vec<_> = (0..4).map(|i| seq(i, 10, &[i])).collect();
        let scheds = packer.pack(0, &seqs, &info()).unwrap();
        // Fallback is the default packer's answer.
        assert_eq!(scheds.len(), 2);
        assert_eq!(scheds[0].seq_ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_comm_depth_single_entry() {
        let mut seqs: Vec<_> = (0..3).map(|i| seq(i, 1, &[i])).collect();
        for s in &mut seqs {
            s.comm = true;
        }
        let scheds = pack_comm_depth(4, &seqs, &info()).unwrap();
        assert_eq!(scheds.len(), 1);
        assert_eq!(scheds[0].seq_ids, vec![0, 1, 2]);
    }
}
