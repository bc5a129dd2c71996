//! Error types for scheduling.

use thiserror::Error;

use crate::shape::Dims;

/// Main error type for the scheduling pipeline.
///
/// Every variant carries enough context (ids, shapes, depths) to reproduce
/// the failure from the model alone.
#[derive(Debug, Error)]
pub enum SchedError {
    /// A shape, stride or padding invariant was violated.
    #[error("invalid shape for tensor `{name}`: {reason} (shape {shape}, ldims {ldims}, offs {offs}, pads {pads})")]
    ShapeInvalid {
        name: String,
        reason: String,
        shape: Dims,
        ldims: Dims,
        offs: Dims,
        pads: Dims,
    },

    /// The op graph contains a dependency cycle.
    #[error("op graph contains a cycle through ops {op_ids:?}")]
    CyclicGraph { op_ids: Vec<usize> },

    /// The planned arena does not fit on the device.
    #[error("out of device memory: planned {needed} bytes, {available} bytes free")]
    OutOfDeviceMemory { needed: u64, available: u64 },

    /// An imported buffer could not be resolved before the deadline.
    #[error("import (rank {rank}, sid {sid}) unresolved after {waited_ms} ms")]
    ImportUnresolved { rank: i32, sid: i32, waited_ms: u64 },

    /// Two local buffers claim the same export sid.
    #[error("export conflict: buffers {first} and {second} both use sid {sid}")]
    ExportConflict { sid: i32, first: usize, second: usize },

    /// A sequence cannot fit on the device under any packing.
    #[error("packer infeasible at depth {depth}: sequence {seq} needs {warps} warps, device budget is {budget}")]
    PackerInfeasible {
        depth: usize,
        seq: usize,
        warps: u32,
        budget: u32,
    },

    /// The code generator has no template for an opcode/dtype pair.
    #[error("codegen unsupported: {opcode} on {dtype}")]
    CodegenUnsupported { opcode: String, dtype: String },

    /// A profiler measurement exceeded its time budget. Non-fatal; the
    /// packer substitutes a heuristic cost.
    #[error("profiler timeout for sequence {hash:#018x} at {warps} warps")]
    ProfilerTimeout { hash: u64, warps: u32 },
}

pub type Result<T> = std::result::Result<T, SchedError>;
