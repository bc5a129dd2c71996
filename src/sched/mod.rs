//! The scheduling pipeline: buffer planning, sequence building, depth
//! packing and the scheduler that drives it all.

pub mod packer;
pub mod planner;
pub mod profiler;
pub mod scheduler;
pub mod seq;

pub use packer::{DefaultPacker, Packer, PartitionedPacker, Sched};
pub use planner::{ArenaStrategy, BufInfo, BufferPlan, PhysicalAddress};
pub use profiler::SeqProfiler;
pub use scheduler::{KernelPlan, PackerKind, ScheduleOptions, Scheduler};
pub use seq::{SchedOp, SchedOpSeq};
