//! Model construction: tensors, buffers and the declared op list.
//!
//! The `Model` exclusively owns every [`TensorBuf`] and [`Tensor`]; ops
//! reference both by id. Declaration order is preserved and is the
//! tie-break order everywhere downstream.

use log::debug;

use crate::error::{Result, SchedError};
use crate::shape::{DimType, Dims};
use crate::tensor::{Tensor, TensorBuf, TensorBufId, TensorId, TensorType};

/// Matmul operands are padded to this unit on their last two axes so the
/// generated tile loops never read past a row.
pub const MATMUL_PAD: DimType = 16;

/// Handle to an [`Op`] inside its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub usize);

/// Opcode of a model op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Identity,
    Reshape,
    Add,
    Mul,
    Scale,
    Relu,
    /// Result of coalescing an element-wise chain during optimization.
    FusedElementwise,
    Matmul,
    Transpose,
    Send,
    Recv,
}

impl OpType {
    pub fn name(&self) -> &'static str {
        match self {
            OpType::Identity => "identity",
            OpType::Reshape => "reshape",
            OpType::Add => "add",
            OpType::Mul => "mul",
            OpType::Scale => "scale",
            OpType::Relu => "relu",
            OpType::FusedElementwise => "fused_elementwise",
            OpType::Matmul => "matmul",
            OpType::Transpose => "transpose",
            OpType::Send => "send",
            OpType::Recv => "recv",
        }
    }

    /// Element-wise ops map one input element to one output element and
    /// may be coalesced into chains.
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            OpType::Add | OpType::Mul | OpType::Scale | OpType::Relu | OpType::FusedElementwise
        )
    }

    /// View ops create an alias on the input buffer and move no data.
    pub fn is_view(&self) -> bool {
        matches!(self, OpType::Identity | OpType::Reshape)
    }

    /// Communication ops cross rank boundaries.
    pub fn is_comm(&self) -> bool {
        matches!(self, OpType::Send | OpType::Recv)
    }
}

/// One step of a coalesced element-wise chain: the original opcode plus
/// its scalar factor when it had one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElemStep {
    pub op: OpType,
    pub factor: Option<f32>,
}

/// Per-op configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum OpConfig {
    None,
    Scale(f32),
    Transpose(Vec<usize>),
    Matmul { tile_m: DimType, tile_n: DimType },
    Comm { peer: i32, sid: i32 },
    FusedChain(Vec<ElemStep>),
}

/// A node in the declared computation: opcode, operand tensors and config.
#[derive(Debug, Clone)]
pub struct Op {
    pub id: OpId,
    pub otype: OpType,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub cfg: OpConfig,
}

/// A user-declared computation over tensors.
#[derive(Debug, Default)]
pub struct Model {
    bufs: Vec<TensorBuf>,
    tensors: Vec<Tensor>,
    ops: Vec<Op>,
    outputs: Vec<TensorId>,
}

impl Model {
    pub fn new() -> Self {
        Model::default()
    }

    // --- tensor construction ---

    /// Creates a tensor on a fresh buffer with the default layout.
    pub fn tensor(&mut self, shape: Dims, ttype: TensorType) -> Result<TensorId> {
        self.tensor_full(shape, ttype, Dims::none(), Dims::none(), Dims::none(), None)
    }

    /// Creates a tensor with an explicit layout on a fresh buffer.
    pub fn tensor_full(
        &mut self,
        shape: Dims,
        ttype: TensorType,
        ldims: Dims,
        offs: Dims,
        pads: Dims,
        name: Option<&str>,
    ) -> Result<TensorId> {
        let buf = self.new_buf();
        self.add_tensor(buf, shape, ttype, ldims, offs, pads, false, -1, name)
    }

    /// Declares a tensor whose buffer lives on `owner_rank`, matched to a
    /// remote export by `sid`.
    pub fn import(
        &mut self,
        shape: Dims,
        ttype: TensorType,
        owner_rank: i32,
        sid: i32,
    ) -> Result<TensorId> {
        let buf = self.new_buf();
        self.bufs[buf.0].imported_rank = owner_rank;
        self.bufs[buf.0].sid = sid;
        self.add_tensor(
            buf,
            shape,
            ttype,
            Dims::none(),
            Dims::none(),
            Dims::none(),
            false,
            owner_rank,
            None,
        )
    }

    /// Publishes a tensor's buffer to other ranks under `sid`.
    pub fn export(&mut self, t: TensorId, sid: i32) {
        let buf = self.tensors[t.0].buf;
        self.bufs[buf.0].sid = sid;
        self.tensors[t.0].exported = true;
        debug!("exported tensor {} (buf {}) as sid {sid}", t.0, buf.0);
    }

    /// Marks a tensor as externally observed; it survives every
    /// optimization pass.
    pub fn mark_output(&mut self, t: TensorId) {
        if !self.outputs.contains(&t) {
            self.outputs.push(t);
        }
    }

    // --- op construction ---

    /// Alias view of `t` on the same buffer.
    pub fn identity(&mut self, t: TensorId) -> Result<TensorId> {
        let src = self.tensors[t.0].clone();
        let out = self.add_tensor(
            src.buf,
            src.shape.clone(),
            src.ttype,
            src.ldims.clone(),
            src.offs.clone(),
            src.pads.clone(),
            false,
            -1,
            None,
        )?;
        self.push_op(OpType::Identity, vec![t], vec![out], OpConfig::None);
        Ok(out)
    }

    /// Element-count-preserving view change. Only sequential, unshifted
    /// views can be reshaped.
    pub fn reshape(&mut self, t: TensorId, shape: Dims) -> Result<TensorId> {
        let src = self.tensors[t.0].clone();
        if shape.size() != src.shape.size()
            || !src.is_sequential()
            || src.offs.as_slice().iter().any(|&o| o != 0)
        {
            return Err(SchedError::ShapeInvalid {
                name: src.name.clone(),
                reason: format!("cannot reshape to {shape}"),
                shape: src.shape,
                ldims: src.ldims,
                offs: src.offs,
                pads: src.pads,
            });
        }
        let out = self.add_tensor(
            src.buf,
            shape,
            src.ttype,
            Dims::none(),
            Dims::none(),
            Dims::none(),
            false,
            -1,
            None,
        )?;
        self.push_op(OpType::Reshape, vec![t], vec![out], OpConfig::None);
        Ok(out)
    }

    /// Element-wise sum of two equally shaped tensors.
    pub fn add(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        let out = self.elementwise_out(&[a, b], "add")?;
        self.push_op(OpType::Add, vec![a, b], vec![out], OpConfig::None);
        Ok(out)
    }

    /// Element-wise product of two equally shaped tensors.
    pub fn mul(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        let out = self.elementwise_out(&[a, b], "mul")?;
        self.push_op(OpType::Mul, vec![a, b], vec![out], OpConfig::None);
        Ok(out)
    }

    /// Multiplies every element by a scalar.
    pub fn scale(&mut self, t: TensorId, factor: f32) -> Result<TensorId> {
        let out = self.elementwise_out(&[t], "scale")?;
        self.push_op(OpType::Scale, vec![t], vec![out], OpConfig::Scale(factor));
        Ok(out)
    }

    /// Element-wise max(x, 0).
    pub fn relu(&mut self, t: TensorId) -> Result<TensorId> {
        let out = self.elementwise_out(&[t], "relu")?;
        self.push_op(OpType::Relu, vec![t], vec![out], OpConfig::None);
        Ok(out)
    }

    /// Matrix product contracting the last axis of `a` with the
    /// second-to-last axis of `b`. Leading axes must match. Operands and
    /// the output are padded to the tile unit on their last two axes.
    pub fn matmul(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        let (sa, sb, ttype) = {
            let ta = &self.tensors[a.0];
            let tb = &self.tensors[b.0];
            if ta.ttype != tb.ttype {
                return Err(self.type_mismatch(ta, tb, "matmul"));
            }
            (ta.shape.clone(), tb.shape.clone(), ta.ttype)
        };
        let na = sa.ndims();
        let nb = sb.ndims();
        if na < 2 || nb < 2 || na != nb {
            return Err(self.shape_mismatch(a, b, "matmul needs equal-rank operands of rank >= 2"));
        }
        let (m, k) = (sa[na - 2], sa[na - 1]);
        let (k2, n) = (sb[nb - 2], sb[nb - 1]);
        if k != k2 || sa.as_slice()[..na - 2] != sb.as_slice()[..nb - 2] {
            return Err(self.shape_mismatch(a, b, "matmul contraction axes disagree"));
        }
        let mut out_dims = sa.as_slice()[..na - 2].to_vec();
        out_dims.push(m);
        out_dims.push(n);
        let out = self.tensor(Dims::new(out_dims)?, ttype)?;

        self.tensors[a.0].update_pads(&[MATMUL_PAD, MATMUL_PAD])?;
        self.tensors[b.0].update_pads(&[MATMUL_PAD, MATMUL_PAD])?;
        self.tensors[out.0].update_pads(&[MATMUL_PAD, MATMUL_PAD])?;
        self.grow_bufs_for(&[a, b, out]);

        self.push_op(
            OpType::Matmul,
            vec![a, b],
            vec![out],
            OpConfig::Matmul {
                tile_m: MATMUL_PAD,
                tile_n: MATMUL_PAD,
            },
        );
        Ok(out)
    }

    /// Axis permutation. `perm` must be a permutation of `0..ndims`.
    pub fn transpose(&mut self, t: TensorId, perm: &[usize]) -> Result<TensorId> {
        let src = self.tensors[t.0].clone();
        let ndims = src.ndims();
        let mut seen = vec![false; ndims];
        if perm.len() != ndims || perm.iter().any(|&p| p >= ndims || std::mem::replace(&mut seen[p], true)) {
            return Err(SchedError::ShapeInvalid {
                name: src.name.clone(),
                reason: format!("invalid permutation {perm:?} for rank {ndims}"),
                shape: src.shape,
                ldims: src.ldims,
                offs: src.offs,
                pads: src.pads,
            });
        }
        let out_dims = perm.iter().map(|&p| src.shape[p]).collect::<Vec<_>>();
        let out = self.tensor(Dims::new(out_dims)?, src.ttype)?;
        self.push_op(
            OpType::Transpose,
            vec![t],
            vec![out],
            OpConfig::Transpose(perm.to_vec()),
        );
        Ok(out)
    }

    /// Sends `t` to `dst_rank`'s buffer exported under `sid`. Returns a
    /// one-byte completion flag tensor that orders dependents after the
    /// transfer.
    pub fn send(&mut self, t: TensorId, dst_rank: i32, sid: i32) -> Result<TensorId> {
        let flag = self.tensor(Dims::new(vec![1])?, TensorType::Byte)?;
        self.push_op(
            OpType::Send,
            vec![t],
            vec![flag],
            OpConfig::Comm {
                peer: dst_rank,
                sid,
            },
        );
        Ok(flag)
    }

    /// Receives into a fresh local tensor exported under `sid` so the
    /// sending rank can resolve it.
    pub fn recv(
        &mut self,
        shape: Dims,
        ttype: TensorType,
        src_rank: i32,
        sid: i32,
    ) -> Result<TensorId> {
        let out = self.tensor(shape, ttype)?;
        self.export(out, sid);
        self.push_op(
            OpType::Recv,
            vec![],
            vec![out],
            OpConfig::Comm {
                peer: src_rank,
                sid,
            },
        );
        Ok(out)
    }

    // --- accessors ---

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn bufs(&self) -> &[TensorBuf] {
        &self.bufs
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn get_tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.0]
    }

    pub fn get_buf(&self, id: TensorBufId) -> &TensorBuf {
        &self.bufs[id.0]
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// True if eliminating this tensor would change what the executor or a
    /// remote rank can observe.
    pub fn is_observed(&self, id: TensorId) -> bool {
        self.tensors[id.0].exported || self.outputs.contains(&id)
    }

    pub(crate) fn replace_ops(&mut self, ops: Vec<Op>) {
        self.ops = ops;
    }

    // --- internals ---

    fn new_buf(&mut self) -> TensorBufId {
        let id = TensorBufId(self.bufs.len());
        self.bufs.push(TensorBuf::new(id, 0));
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn add_tensor(
        &mut self,
        buf: TensorBufId,
        shape: Dims,
        ttype: TensorType,
        ldims: Dims,
        offs: Dims,
        pads: Dims,
        exported: bool,
        imported_rank: i32,
        name: Option<&str>,
    ) -> Result<TensorId> {
        let id = TensorId(self.tensors.len());
        let name = name
            .map(str::to_owned)
            .unwrap_or_else(|| format!("t{}", id.0));
        let t = Tensor::new(
            id,
            buf,
            ttype,
            shape,
            ldims,
            offs,
            pads,
            exported,
            imported_rank,
            name,
        )?;
        self.bufs[buf.0].bytes = self.bufs[buf.0].bytes.max(t.ldims_bytes() as u64);
        self.tensors.push(t);
        Ok(id)
    }

    fn push_op(&mut self, otype: OpType, inputs: Vec<TensorId>, outputs: Vec<TensorId>, cfg: OpConfig) {
        let id = OpId(self.ops.len());
        debug!(
            "op {} {}: in {:?} out {:?}",
            id.0,
            otype.name(),
            inputs.iter().map(|t| t.0).collect::<Vec<_>>(),
            outputs.iter().map(|t| t.0).collect::<Vec<_>>()
        );
        self.ops.push(Op {
            id,
            otype,
            inputs,
            outputs,
            cfg,
        });
    }

    /// Creates the output tensor of an element-wise op after checking that
    /// all operands agree on shape and type.
    fn elementwise_out(&mut self, ins: &[TensorId], what: &str) -> Result<TensorId> {
        let first = &self.tensors[ins[0].0];
        let (shape, ttype) = (first.shape.clone(), first.ttype);
        for &i in &ins[1..] {
            let t = &self.tensors[i.0];
            if t.shape != shape {
                return Err(self.shape_mismatch(ins[0], i, what));
            }
            if t.ttype != ttype {
                let (a, b) = (self.tensors[ins[0].0].clone(), t.clone());
                return Err(self.type_mismatch(&a, &b, what));
            }
        }
        self.tensor(shape, ttype)
    }

    /// Re-grows buffer byte sizes after a pad update enlarged some ldims.
    fn grow_bufs_for(&mut self, ids: &[TensorId]) {
        for &id in ids {
            let (buf, bytes) = {
                let t = &self.tensors[id.0];
                (t.buf, t.ldims_bytes() as u64)
            };
            self.bufs[buf.0].bytes = self.bufs[buf.0].bytes.max(bytes);
        }
    }

    fn shape_mismatch(&self, a: TensorId, b: TensorId, what: &str) -> SchedError {
        let ta = &self.tensors[a.0];
        let tb = &self.tensors[b.0];
        SchedError::ShapeInvalid {
            name: format!("{} x {}", ta.name, tb.name),
            reason: format!("{what}: shapes {} and {} are incompatible", ta.shape, tb.shape),
            shape: ta.shape.clone(),
            ldims: ta.ldims.clone(),
            offs: ta.offs.clone(),
            pads: ta.pads.clone(),
        }
    }

    fn type_mismatch(&self, a: &Tensor, b: &Tensor, what: &str) -> SchedError {
        SchedError::ShapeInvalid {
            name: format!("{} x {}", a.name, b.name),
            reason: format!(
                "{what}: element types {} and {} disagree",
                a.ttype.name(),
                b.ttype.name()
            ),
            shape: a.shape.clone(),
            ldims: a.ldims.clone(),
            offs: a.offs.clone(),
            pads: a.pads.clone(),
        }
    }
}
