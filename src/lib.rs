//! Strata: a depth-layered GPU kernel scheduler.
//!
//! Strata takes a user-declared graph of tensor operations, lowers it
//! into a dependency DAG, assigns physical device memory to logical
//! buffers (including cross-rank import/export), groups ops into
//! sequences that share a kernel launch, packs sequences onto streaming
//! multiprocessors under a warp budget, and emits per-depth kernel source
//! plus a launch schedule for the surrounding executor.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use strata::prelude::*;
//!
//! let mut model = Model::new();
//! let x = model.tensor(Dims::new(vec![64, 64])?, TensorType::Fp32)?;
//! let y = model.relu(x)?;
//! model.mark_output(y);
//!
//! let device = Arc::new(HostDevice::new(DeviceInfo {
//!     sm_count: 4,
//!     warps_per_sm: 16,
//!     bytes_free: 1 << 24,
//! }));
//! let hub = LocalHub::new();
//! let plan = Scheduler::new(model, 0, 0, 1, device, Arc::new(hub.transport_for(0)))
//!     .schedule()?;
//! assert_eq!(plan.num_depths(), 1);
//! # Ok::<(), strata::SchedError>(())
//! ```

pub mod catalog;
pub mod codegen;
pub mod device;
pub mod error;
pub mod graph;
pub mod ipc;
pub mod model;
pub mod sched;
pub mod shape;
pub mod tensor;

pub use catalog::{DefaultCatalog, KernelCatalog, KernelSignature};
pub use device::{DeviceAddress, DeviceInfo, DeviceManager, HostDevice, IpcHandle};
pub use error::{Result, SchedError};
pub use graph::{optimize_model, OpGraph};
pub use ipc::{IpcTransport, LocalHub, LocalTransport};
pub use model::{Model, Op, OpConfig, OpId, OpType};
pub use sched::{
    ArenaStrategy, BufInfo, KernelPlan, PackerKind, PhysicalAddress, Sched, SchedOp, SchedOpSeq,
    ScheduleOptions, Scheduler,
};
pub use shape::{DimType, Dims};
pub use tensor::{Tensor, TensorBuf, TensorBufId, TensorId, TensorType};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::device::{DeviceInfo, HostDevice};
    pub use crate::ipc::LocalHub;
    pub use crate::model::Model;
    pub use crate::sched::{ArenaStrategy, PackerKind, ScheduleOptions, Scheduler};
    pub use crate::shape::Dims;
    pub use crate::tensor::TensorType;
}
