//! Kernel template catalog.
//!
//! The catalog declares, per opcode, what the code generator can do with
//! it: operand arity, supported element types, the warp-count heuristic
//! and which opcodes may share a launch. [`DefaultCatalog`] covers the
//! built-in op set; an executor with a richer template library can swap
//! in its own implementation.

use std::fmt::Write as _;

use crate::error::{Result, SchedError};
use crate::model::{Model, Op, OpConfig, OpType};
use crate::shape::div_up;
use crate::tensor::{Tensor, TensorType};

/// Elements one warp is expected to cover in the warp heuristic.
const ELEMS_PER_WARP: i64 = 8192;

/// Hard cap of the per-op warp estimate.
const MAX_OP_WARPS: u32 = 32;

/// Static description of an opcode's kernel template.
#[derive(Debug, Clone)]
pub struct KernelSignature {
    /// Expected input count; `None` for variadic ops (coalesced chains).
    pub in_arity: Option<usize>,
    pub out_arity: usize,
    /// Element types the template can be instantiated with.
    pub dtypes: &'static [TensorType],
    /// Whether the op may share a sequence with other fusable ops.
    pub fusable: bool,
}

/// What the scheduler needs to know about kernel templates.
pub trait KernelCatalog: Send + Sync {
    fn signature(&self, otype: OpType) -> KernelSignature;

    /// True if ops of these opcodes may run in one sequence.
    fn seq_compatible(&self, a: OpType, b: OpType) -> bool;

    /// Warp-count estimate for one op.
    fn warps_for(&self, op: &Op, model: &Model) -> u32;

    /// Emits the device function body for a sequence of ops. The emitted
    /// function is address-agnostic (operands arrive as pointer
    /// parameters) so sequences with equal hash can share it.
    fn emit(&self, hash: u64, ops: &[&Op], model: &Model) -> Result<String>;
}

/// Catalog of the built-in templates: element-wise, matmul, transpose and
/// the send/recv collectives.
#[derive(Debug, Default)]
pub struct DefaultCatalog;

const ALL_TYPES: &[TensorType] = &[
    TensorType::Byte,
    TensorType::Int32,
    TensorType::Fp16,
    TensorType::Fp32,
];
const ARITH_TYPES: &[TensorType] = &[TensorType::Int32, TensorType::Fp16, TensorType::Fp32];

impl KernelCatalog for DefaultCatalog {
    fn signature(&self, otype: OpType) -> KernelSignature {
        match otype {
            OpType::Identity | OpType::Reshape => KernelSignature {
                in_arity: Some(1),
                out_arity: 1,
                dtypes: ALL_TYPES,
                fusable: true,
            },
            OpType::Add | OpType::Mul => KernelSignature {
                in_arity: Some(2),
                out_arity: 1,
                dtypes: ARITH_TYPES,
                fusable: true,
            },
            OpType::Scale | OpType::Relu => KernelSignature {
                in_arity: Some(1),
                out_arity: 1,
                dtypes: ARITH_TYPES,
                fusable: true,
            },
            OpType::FusedElementwise => KernelSignature {
                in_arity: None,
                out_arity: 1,
                dtypes: ARITH_TYPES,
                fusable: true,
            },
            OpType::Matmul => KernelSignature {
                in_arity: Some(2),
                out_arity: 1,
                dtypes: ARITH_TYPES,
                fusable: true,
            },
            OpType::Transpose => KernelSignature {
                in_arity: Some(1),
                out_arity: 1,
                dtypes: ALL_TYPES,
                fusable: false,
            },
            OpType::Send | OpType::Recv => KernelSignature {
                in_arity: None,
                out_arity: 1,
                dtypes: ALL_TYPES,
                fusable: false,
            },
        }
    }

    fn seq_compatible(&self, a: OpType, b: OpType) -> bool {
        if a.is_comm() || b.is_comm() {
            return false;
        }
        self.signature(a).fusable && self.signature(b).fusable
    }

    fn warps_for(&self, op: &Op, model: &Model) -> u32 {
        if op.otype.is_comm() || op.otype.is_view() {
            return 1;
        }
        let out = model.get_tensor(op.outputs[0]);
        div_up(out.size(), ELEMS_PER_WARP).clamp(1, MAX_OP_WARPS as i64) as u32
    }

    fn emit(&self, hash: u64, ops: &[&Op], model: &Model) -> Result<String> {
        let mut src = String::new();
        let params = seq_params(ops, model);
        let _ = writeln!(src, "__device__ void seq_{hash:016x}({params}) {{");
        for (i, op) in ops.iter().enumerate() {
            check_dtypes(&self.signature(op.otype), op, model)?;
            let body = match op.otype {
                OpType::Identity | OpType::Reshape => {
                    format!("  // op {i}: {} is an alias view; no data movement\n", op.otype.name())
                }
                OpType::Transpose => emit_transpose(i, op, model),
                OpType::Matmul => emit_matmul(i, op, model),
                OpType::Send | OpType::Recv => emit_comm(i, op, model),
                _ => emit_elementwise(i, op, model),
            };
            src.push_str(&body);
        }
        src.push_str("}\n");
        Ok(src)
    }
}

/// C parameter list: one typed pointer per operand of each op, inputs
/// first, in op order.
fn seq_params(ops: &[&Op], model: &Model) -> String {
    let mut parts = Vec::new();
    for (i, op) in ops.iter().enumerate() {
        for (k, &t) in op.inputs.iter().enumerate() {
            let ty = ctype(model.get_tensor(t).ttype);
            parts.push(format!("const {ty}* in{i}_{k}"));
        }
        for (k, &t) in op.outputs.iter().enumerate() {
            let ty = ctype(model.get_tensor(t).ttype);
            parts.push(format!("{ty}* out{i}_{k}"));
        }
    }
    parts.join(", ")
}

fn check_dtypes(sig: &KernelSignature, op: &Op, model: &Model) -> Result<()> {
    for &t in op.inputs.iter().chain(op.outputs.iter()) {
        let ttype = model.get_tensor(t).ttype;
        if !sig.dtypes.contains(&ttype) {
            return Err(SchedError::CodegenUnsupported {
                opcode: op.otype.name().into(),
                dtype: ttype.name().into(),
            });
        }
    }
    Ok(())
}

/// C element type of a tensor type.
pub fn ctype(t: TensorType) -> &'static str {
    match t {
        TensorType::Byte => "unsigned char",
        TensorType::Int32 => "int",
        TensorType::Fp16 => "__half",
        TensorType::Fp32 => "float",
    }
}

/// Emits `(expr)` giving the buffer-relative element offset of logical
/// index `idx` decomposed from flat counter `i` over `shape`.
fn offset_expr(t: &Tensor, flat: &str) -> String {
    // Decompose the flat loop counter into coordinates over the logical
    // shape, then apply offs and ldims strides.
    let n = t.ndims();
    let mut terms = Vec::with_capacity(n);
    let mut div: i64 = 1;
    for k in (0..n).rev() {
        let coord = format!("({flat} / {div} % {})", t.shape[k]);
        let mut stride: i64 = 1;
        for j in (k + 1)..n {
            stride *= t.ldims[j];
        }
        terms.push(format!("({} + {coord}) * {stride}", t.offs[k]));
        div *= t.shape[k];
    }
    terms.join(" + ")
}

fn emit_elementwise(i: usize, op: &Op, model: &Model) -> String {
    let out = model.get_tensor(op.outputs[0]);
    let n = out.size();
    let mut s = String::new();
    let _ = writeln!(s, "  // op {i}: {} over {} elements", op.otype.name(), n);
    let _ = writeln!(
        s,
        "  for (long i = warp_elem_begin(); i < {n}; i += warp_elem_stride()) {{"
    );
    let loads: Vec<String> = op
        .inputs
        .iter()
        .enumerate()
        .map(|(k, &t)| format!("in{i}_{k}[{}]", offset_expr(model.get_tensor(t), "i")))
        .collect();
    let expr = match (&op.otype, &op.cfg) {
        (OpType::Add, _) => format!("{} + {}", loads[0], loads[1]),
        (OpType::Mul, _) => format!("{} * {}", loads[0], loads[1]),
        (OpType::Scale, OpConfig::Scale(f)) => format!("{} * {f:?}f", loads[0]),
        (OpType::Relu, _) => format!("max({}, 0)", loads[0]),
        (OpType::FusedElementwise, OpConfig::FusedChain(steps)) => {
            let mut expr = match steps[0].op {
                OpType::Add => format!("{} + {}", loads[0], loads[1]),
                OpType::Mul => format!("{} * {}", loads[0], loads[1]),
                OpType::Scale => format!("{} * {:?}f", loads[0], steps[0].factor.unwrap_or(1.0)),
                _ => format!("max({}, 0)", loads[0]),
            };
            for step in &steps[1..] {
                expr = match step.op {
                    OpType::Scale => {
                        format!("({expr}) * {:?}f", step.factor.unwrap_or(1.0))
                    }
                    _ => format!("max({expr}, 0)"),
                };
            }
            expr
        }
        _ => loads[0].clone(),
    };
    let _ = writeln!(s, "    out{i}_0[{}] = {expr};", offset_expr(out, "i"));
    let _ = writeln!(s, "  }}");
    s
}

fn emit_transpose(i: usize, op: &Op, model: &Model) -> String {
    let t_in = model.get_tensor(op.inputs[0]);
    let out = model.get_tensor(op.outputs[0]);
    let perm = match &op.cfg {
        OpConfig::Transpose(p) => p.clone(),
        _ => (0..out.ndims()).collect(),
    };
    // out[j0..jn] = in[j_perm^-1], i.e. in coordinate p is out coordinate
    // at the position where perm maps p.
    let n = out.size();
    let mut s = String::new();
    let _ = writeln!(
        s,
        "  // op {i}: transpose perm {perm:?}, shape {} -> {}",
        t_in.shape, out.shape
    );
    let _ = writeln!(
        s,
        "  for (long i = warp_elem_begin(); i < {n}; i += warp_elem_stride()) {{"
    );
    // Output coordinates from the flat counter.
    let mut div: i64 = 1;
    let mut out_coord = vec![String::new(); out.ndims()];
    for k in (0..out.ndims()).rev() {
        out_coord[k] = format!("(i / {div} % {})", out.shape[k]);
        div *= out.shape[k];
    }
    // Input offset through the permutation: input axis p reads output
    // coordinate at perm's position of p.
    let mut in_terms = Vec::new();
    for p in 0..t_in.ndims() {
        let pos = perm.iter().position(|&x| x == p).unwrap();
        let mut stride: i64 = 1;
        for j in (p + 1)..t_in.ndims() {
            stride *= t_in.ldims[j];
        }
        in_terms.push(format!(
            "({} + {}) * {stride}",
            t_in.offs[p], out_coord[pos]
        ));
    }
    let mut out_terms = Vec::new();
    for k in 0..out.ndims() {
        let mut stride: i64 = 1;
        for j in (k + 1)..out.ndims() {
            stride *= out.ldims[j];
        }
        out_terms.push(format!("({} + {}) * {stride}", out.offs[k], out_coord[k]));
    }
    let _ = writeln!(
        s,
        "    out{i}_0[{}] = in{i}_0[{}];",
        out_terms.join(" + "),
        in_terms.join(" + ")
    );
    let _ = writeln!(s, "  }}");
    s
}

fn emit_matmul(i: usize, op: &Op, model: &Model) -> String {
    let a = model.get_tensor(op.inputs[0]);
    let b = model.get_tensor(op.inputs[1]);
    let out = model.get_tensor(op.outputs[0]);
    let (tile_m, tile_n) = match op.cfg {
        OpConfig::Matmul { tile_m, tile_n } => (tile_m, tile_n),
        _ => (16, 16),
    };
    let nd = out.ndims();
    let batch: i64 = (0..nd - 2).map(|k| out.shape[k]).product();
    let (m, n) = (out.shape[nd - 2], out.shape[nd - 1]);
    let k_extent = a.shape[a.ndims() - 1];
    let (lda, ldb, ldc) = (
        a.ldims[a.ndims() - 1],
        b.ldims[b.ndims() - 1],
        out.ldims[nd - 1],
    );
    let mut s = String::new();
    let _ = writeln!(
        s,
        "  // op {i}: matmul {m}x{k_extent} * {k_extent}x{n}, batch {batch}, tile {tile_m}x{tile_n}"
    );
    let _ = writeln!(s, "  for (long b = 0; b < {batch}; ++b) {{");
    let _ = writeln!(
        s,
        "    for (long r = warp_tile_begin({m}); r < {m}; r += warp_tile_stride()) {{"
    );
    let _ = writeln!(s, "      for (long c = 0; c < {n}; ++c) {{");
    let _ = writeln!(s, "        float acc = 0;");
    let _ = writeln!(s, "        for (long k = 0; k < {k_extent}; ++k) {{");
    let _ = writeln!(
        s,
        "          acc += in{i}_0[(b * {m} + r) * {lda} + k] * in{i}_1[(b * {k_extent} + k) * {ldb} + c];"
    );
    let _ = writeln!(s, "        }}");
    let _ = writeln!(s, "        out{i}_0[(b * {m} + r) * {ldc} + c] = acc;");
    let _ = writeln!(s, "      }}");
    let _ = writeln!(s, "    }}");
    let _ = writeln!(s, "  }}");
    s
}

fn emit_comm(i: usize, op: &Op, model: &Model) -> String {
    let (peer, sid) = match op.cfg {
        OpConfig::Comm { peer, sid } => (peer, sid),
        _ => (-1, -1),
    };
    let mut s = String::new();
    match op.otype {
        OpType::Send => {
            let src = model.get_tensor(op.inputs[0]);
            let bytes = src.shape_bytes();
            let _ = writeln!(s, "  // op {i}: send {bytes} bytes to rank {peer}, sid {sid}");
            let _ = writeln!(s, "  comm_put({peer}, {sid}, in{i}_0, {bytes});");
            let _ = writeln!(s, "  out{i}_0[0] = 1;");
        }
        _ => {
            let _ = writeln!(s, "  // op {i}: recv from rank {peer}, sid {sid}");
            let _ = writeln!(s, "  comm_wait({peer}, {sid});");
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Dims;

    fn dims(v: &[i64]) -> Dims {
        Dims::new(v.to_vec()).unwrap()
    }

    #[test]
    fn test_seq_compat() {
        let c = DefaultCatalog;
        assert!(c.seq_compatible(OpType::Add, OpType::Relu));
        assert!(c.seq_compatible(OpType::Matmul, OpType::Scale));
        assert!(!c.seq_compatible(OpType::Transpose, OpType::Transpose));
        assert!(!c.seq_compatible(OpType::Send, OpType::Add));
    }

    #[test]
    fn test_warp_heuristic() {
        let c = DefaultCatalog;
        let mut m = Model::new();
        let x = m.tensor(dims(&[81920]), TensorType::Fp32).unwrap();
        let y = m.relu(x).unwrap();
        let _ = y;
        assert_eq!(c.warps_for(&m.ops()[0], &m), 10);

        let small = m.tensor(dims(&[4]), TensorType::Fp32).unwrap();
        let _ = m.relu(small).unwrap();
        assert_eq!(c.warps_for(&m.ops()[1], &m), 1);
    }

    #[test]
    fn test_emit_unsupported_dtype() {
        let c = DefaultCatalog;
        let mut m = Model::new();
        let x = m.tensor(dims(&[16, 16]), TensorType::Byte).unwrap();
        let y = m.tensor(dims(&[16, 16]), TensorType::Byte).unwrap();
        let _ = m.matmul(x, y).unwrap();
        let op = &m.ops()[0];
        let err = c.emit(0, &[op], &m).unwrap_err();
        assert!(matches!(err, SchedError::CodegenUnsupported { .. }));
    }

    #[test]
    fn test_emit_elementwise_mentions_operands() {
        let c = DefaultCatalog;
        let mut m = Model::new();
        let x = m.tensor(dims(&[16]), TensorType::Fp32).unwrap();
        let y = m.tensor(dims(&[16]), TensorType::Fp32).unwrap();
        let _ = m.add(x, y).unwrap();
        let op = &m.ops()[0];
        let src = c.emit(0xabcd, &[op], &m).unwrap();
        assert!(src.contains("seq_000000000000abcd"));
        assert!(src.contains("in0_0"));
        assert!(src.contains("in0_1"));
        assert!(src.contains("out0_0"));
    }

    #[test]
    fn test_emit_deterministic() {
        let c = DefaultCatalog;
        let mut m = Model::new();
        let x = m.tensor(dims(&[8, 8]), TensorType::Fp32).unwrap();
        let _ = m.transpose(x, &[1, 0]).unwrap();
        let op = &m.ops()[0];
        let a = c.emit(1, &[op], &m).unwrap();
        let b = c.emit(1, &[op], &m).unwrap();
        assert_eq!(a, b);
    }
}
