//! The scheduler: drives optimization, planning, packing and codegen.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use rustc_hash::FxHashMap;

use crate::catalog::{DefaultCatalog, KernelCatalog};
use crate::codegen::emit_depth;
use crate::device::{DeviceAddress, DeviceManager};
use crate::error::Result;
use crate::graph::{optimize_model, OpGraph};
use crate::ipc::IpcTransport;
use crate::model::Model;
use crate::sched::packer::{pack_comm_depth, DefaultPacker, Packer, PartitionedPacker, Sched};
use crate::sched::planner::{plan_buffers, ArenaStrategy, BufInfo, PhysicalAddress};
use crate::sched::seq::build_seqs;
use crate::tensor::{Tensor, TensorBufId, TensorId};

/// Which depth packer to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackerKind {
    #[default]
    Default,
    Partitioned,
}

/// Tunables of one scheduling run.
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    /// Max warps per sequence.
    pub wps: u32,
    pub packer: PackerKind,
    pub import_deadline_ms: u64,
    pub arena_strategy: ArenaStrategy,
    /// Time the partitioned packer may spend per depth before falling
    /// back to the default packer.
    pub partition_budget_ms: u64,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        ScheduleOptions {
            wps: 16,
            packer: PackerKind::Default,
            import_deadline_ms: 30_000,
            arena_strategy: ArenaStrategy::ReuseDisjoint,
            partition_budget_ms: 1_000,
        }
    }
}

/// Everything the executor needs to compile and run the model: one source
/// unit per depth, the launch entries per depth, and the buffer plan.
#[derive(Debug)]
pub struct KernelPlan {
    pub kernel_sources: Vec<String>,
    pub launches: Vec<Vec<Sched>>,
    pub buf_infos: Vec<BufInfo>,
    model: Model,
    buf_trans: FxHashMap<TensorBufId, DeviceAddress>,
}

impl KernelPlan {
    pub fn num_depths(&self) -> usize {
        self.launches.len()
    }

    /// The model as scheduled, after optimization rewrites.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Physical location of a tensor's view origin.
    pub fn resolve_tensor(&self, t: &Tensor) -> Option<PhysicalAddress> {
        let base = *self.buf_trans.get(&t.buf)?;
        let origin = vec![0; t.ndims()];
        Some(PhysicalAddress {
            base,
            offset_bytes: t.offset_bytes(&origin) as u64,
        })
    }

    pub fn resolve(&self, id: TensorId) -> Option<PhysicalAddress> {
        self.resolve_tensor(self.model.get_tensor(id))
    }
}

/// Schedules one model onto one rank's device.
///
/// The scheduler consumes itself on [`schedule`](Scheduler::schedule); a
/// model is scheduled at most once and re-scheduling takes a fresh
/// instance.
pub struct Scheduler {
    model: Model,
    gpu_id: i32,
    rank: i32,
    world_size: i32,
    device: Arc<dyn DeviceManager>,
    transport: Arc<dyn IpcTransport>,
    catalog: Arc<dyn KernelCatalog>,
    options: ScheduleOptions,
}

impl Scheduler {
    pub fn new(
        model: Model,
        gpu_id: i32,
        rank: i32,
        world_size: i32,
        device: Arc<dyn DeviceManager>,
        transport: Arc<dyn IpcTransport>,
    ) -> Self {
        Scheduler {
            model,
            gpu_id,
            rank,
            world_size,
            device,
            transport,
            catalog: Arc::new(DefaultCatalog),
            options: ScheduleOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ScheduleOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn KernelCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Runs the full pipeline and returns the kernel plan. Offline and
    /// single-threaded; the only blocking calls go into the transport.
    pub fn schedule(mut self) -> Result<KernelPlan> {
        info!(
            "scheduling rank {}/{} on gpu {} ({} ops)",
            self.rank,
            self.world_size,
            self.gpu_id,
            self.model.ops().len()
        );
        optimize_model(&mut self.model);
        let graph = OpGraph::build(&self.model)?;
        let plan = plan_buffers(
            &self.model,
            &graph,
            self.gpu_id,
            self.device.as_ref(),
            self.transport.as_ref(),
            self.options.arena_strategy,
            Duration::from_millis(self.options.import_deadline_ms),
        )?;

        let dev_info = self.device.device_info();
        let packer: Box<dyn Packer> = match self.options.packer {
            PackerKind::Default => Box::new(DefaultPacker),
            PackerKind::Partitioned => Box::new(PartitionedPacker::new(
                Arc::clone(&self.device),
                Duration::from_millis(self.options.partition_budget_ms),
            )),
        };

        let mut kernel_sources = Vec::with_capacity(graph.num_depths());
        let mut launches = Vec::with_capacity(graph.num_depths());
        for depth in 0..graph.num_depths() {
            let seqs = build_seqs(
                &self.model,
                &graph,
                &plan,
                self.catalog.as_ref(),
                &dev_info,
                depth,
                self.options.wps,
            );
            let scheds = if seqs.iter().any(|s| s.comm) {
                pack_comm_depth(depth, &seqs, &dev_info)?
            } else {
                packer.pack(depth, &seqs, &dev_info)?
            };
            kernel_sources.push(emit_depth(
                &self.model,
                &plan,
                self.catalog.as_ref(),
                &seqs,
                &scheds,
                depth,
            )?);
            launches.push(scheds);
        }
        info!(
            "schedule complete: {} depths, arena {} bytes",
            launches.len(),
            plan.arena_bytes
        );
        Ok(KernelPlan {
            kernel_sources,
            launches,
            buf_infos: plan.buf_infos,
            model: self.model,
            buf_trans: plan.buf_trans,
        })
    }
}
