//! Per-depth kernel source and launch descriptor emission.
//!
//! The generated text is deterministic: declarations come out in buffer-id
//! and sequence-id order, there are no timestamps and no absolute
//! addresses. Buffers are referenced through `B<id>` macros over the
//! arena symbol (or an import symbol), so equal plans produce identical
//! bytes regardless of where the arena lands.

use std::fmt::Write as _;

use rustc_hash::FxHashSet;

use crate::catalog::{ctype, KernelCatalog};
use crate::error::Result;
use crate::model::{Model, Op};
use crate::sched::packer::Sched;
use crate::sched::planner::BufferPlan;
use crate::sched::seq::SchedOpSeq;
use crate::tensor::TensorBufId;

/// Emits the kernel source unit of one depth: buffer macros, one device
/// function per unique sequence hash and one `__global__` wrapper per
/// launch entry.
pub fn emit_depth(
    model: &Model,
    plan: &BufferPlan,
    catalog: &dyn KernelCatalog,
    seqs: &[SchedOpSeq],
    scheds: &[Sched],
    depth: usize,
) -> Result<String> {
    let mut src = String::new();
    let _ = writeln!(src, "// depth {depth}: {} sequences, {} launch entries", seqs.len(), scheds.len());
    let _ = writeln!(src, "extern \"C\" __device__ char _arena[];");

    let bufs = depth_bufs(seqs);
    for &buf in &bufs {
        if let Some(info) = plan.info_for(buf) {
            if model.get_buf(buf).imported_rank >= 0 {
                let _ = writeln!(
                    src,
                    "extern \"C\" __device__ char _import_{}_{}[];",
                    info.gpu_id, info.sid
                );
            }
        }
    }
    for &buf in &bufs {
        if let Some(info) = plan.info_for(buf) {
            if model.get_buf(buf).imported_rank >= 0 {
                let _ = writeln!(src, "#define B{} (_import_{}_{})", buf.0, info.gpu_id, info.sid);
            } else {
                let _ = writeln!(src, "#define B{} (_arena + {})", buf.0, info.offset);
            }
        }
    }
    src.push('\n');

    // One function per unique signature, first occurrence wins.
    let mut emitted: FxHashSet<u64> = FxHashSet::default();
    for seq in seqs {
        if !emitted.insert(seq.hash) {
            continue;
        }
        let ops = seq_ops(seq, model);
        src.push_str(&catalog.emit(seq.hash, &ops, model)?);
        src.push('\n');
    }

    for sched in scheds {
        src.push_str(&emit_entry(model, sched, seqs));
        src.push('\n');
    }
    Ok(src)
}

/// The `__global__` wrapper of one launch entry: blocks are divided among
/// the entry's sequences by their SM demand, in sequence-id order.
fn emit_entry(model: &Model, sched: &Sched, seqs: &[SchedOpSeq]) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "__global__ void {}(void) {{", sched.kernel);
    let _ = writeln!(s, "  unsigned slot = blockIdx.x;");
    let mut end = 0u32;
    for &id in &sched.seq_ids {
        let seq = &seqs[id];
        end += seq.sm_demand.max(1);
        let args = seq_args(seq, model);
        let _ = writeln!(
            s,
            "  if (slot < {end}) {{ seq_{:016x}({args}); return; }}",
            seq.hash
        );
    }
    s.push_str("}\n");
    s
}

/// Buffer operands of one sequence as typed casts of the buffer macros,
/// matching the parameter order of the sequence function.
fn seq_args(seq: &SchedOpSeq, model: &Model) -> String {
    let mut args = Vec::new();
    for sop in &seq.ops {
        let op = &model.ops()[sop.op.0];
        for &t in &op.inputs {
            let tensor = model.get_tensor(t);
            args.push(format!("(const {}*)B{}", ctype(tensor.ttype), tensor.buf.0));
        }
        for &t in &op.outputs {
            let tensor = model.get_tensor(t);
            args.push(format!("({}*)B{}", ctype(tensor.ttype), tensor.buf.0));
        }
    }
    args.join(", ")
}

fn seq_ops<'m>(seq: &SchedOpSeq, model: &'m Model) -> Vec<&'m Op> {
    seq.ops.iter().map(|s| &model.ops()[s.op.0]).collect()
}

/// Buffers any sequence of the depth touches, ascending by id.
fn depth_bufs(seqs: &[SchedOpSeq]) -> Vec<TensorBufId> {
    let mut bufs: Vec<TensorBufId> = seqs.iter().flat_map(|s| s.bufs.iter().copied()).collect();
    bufs.sort_unstable();
    bufs.dedup();
    bufs
}
