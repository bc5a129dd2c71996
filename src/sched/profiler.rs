//! Sequence cost measurement for the partitioned packer.

use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::device::DeviceManager;
use crate::sched::seq::SchedOpSeq;

/// Warp counts a sequence is measured under.
pub const CANDIDATE_WARPS: [u32; 6] = [1, 2, 4, 8, 16, 32];

/// Measures one-off micro-kernels per unique sequence hash and caches the
/// results. A timed-out measurement downgrades to a heuristic cost; the
/// packer never blocks on profiling.
#[derive(Default)]
pub struct SeqProfiler {
    cache: FxHashMap<(u64, u32), u64>,
}

impl SeqProfiler {
    pub fn new() -> Self {
        SeqProfiler::default()
    }

    /// Cycles for the sequence at the smallest candidate warp count
    /// covering its requirement.
    pub fn cost(&mut self, device: &dyn DeviceManager, seq: &SchedOpSeq) -> u64 {
        let warps = CANDIDATE_WARPS
            .iter()
            .copied()
            .find(|&w| w >= seq.warps)
            .unwrap_or(*CANDIDATE_WARPS.last().unwrap());
        if let Some(&cycles) = self.cache.get(&(seq.hash, warps)) {
            return cycles;
        }
        let cycles = match device.measure_cycles(seq.hash, warps, seq.bytes) {
            Ok(c) => c,
            Err(e) => {
                warn!("{e}; falling back to heuristic cost");
                heuristic_cost(seq)
            }
        };
        debug!(
            "profiled seq {:#018x} at {warps} warps: {cycles} cycles",
            seq.hash
        );
        self.cache.insert((seq.hash, warps), cycles);
        cycles
    }

    /// Warm the cache across all candidate warp counts.
    pub fn measure_candidates(&mut self, device: &dyn DeviceManager, seq: &SchedOpSeq) {
        for warps in CANDIDATE_WARPS {
            if self.cache.contains_key(&(seq.hash, warps)) {
                continue;
            }
            if let Ok(cycles) = device.measure_cycles(seq.hash, warps, seq.bytes) {
                self.cache.insert((seq.hash, warps), cycles);
            }
        }
    }
}

/// Deterministic stand-in when the device cannot be measured.
fn heuristic_cost(seq: &SchedOpSeq) -> u64 {
    1000 + seq.bytes / u64::from(seq.warps.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceInfo, HostDevice};

    fn seq(hash: u64, warps: u32, bytes: u64) -> SchedOpSeq {
        SchedOpSeq {
            id: 0,
            depth: 0,
            ops: Vec::new(),
            warps,
            sm_demand: 1,
            hash,
            bufs: Vec::new(),
            bytes,
            comm: false,
        }
    }

    fn info() -> DeviceInfo {
        DeviceInfo {
            sm_count: 4,
            warps_per_sm: 16,
            bytes_free: 1 << 20,
        }
    }

    #[test]
    fn test_cost_is_cached() {
        let dev = HostDevice::new(info());
        let mut p = SeqProfiler::new();
        let s = seq(11, 3, 4096);
        let first = p.cost(&dev, &s);
        assert_eq!(first, p.cost(&dev, &s));
        // 3 warps rounds up to the 4-warp candidate.
        assert_eq!(first, 1000 + 4096 / 4);
    }

    #[test]
    fn test_timeout_uses_heuristic() {
        let dev = HostDevice::with_stalled_profiler(info());
        let mut p = SeqProfiler::new();
        let s = seq(11, 4, 4096);
        assert_eq!(p.cost(&dev, &s), 1000 + 4096 / 4);
    }
}
