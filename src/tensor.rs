//! Logical tensors and the buffers that back them.
//!
//! A [`TensorBuf`] is a logical memory region owned by a [`Model`]; a
//! [`Tensor`] is a strided, padded view into one. Tensors reference their
//! buffer by id, never by pointer, so a model can be serialized and the
//! planner can rebind buffers to device memory without touching views.
//!
//! [`Model`]: crate::model::Model

use crate::error::{Result, SchedError};
use crate::shape::{lcm, pad, DimType, Dims};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorType {
    Byte,
    Int32,
    Fp16,
    Fp32,
}

impl TensorType {
    /// Number of bytes of one element.
    pub fn bytes(&self) -> DimType {
        match self {
            TensorType::Byte => 1,
            TensorType::Int32 => 4,
            TensorType::Fp16 => 2,
            TensorType::Fp32 => 4,
        }
    }

    /// Lower-case name used in diagnostics and generated source.
    pub fn name(&self) -> &'static str {
        match self {
            TensorType::Byte => "byte",
            TensorType::Int32 => "int32",
            TensorType::Fp16 => "fp16",
            TensorType::Fp32 => "fp32",
        }
    }
}

/// Non-owning handle to a [`TensorBuf`] inside its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorBufId(pub usize);

/// Non-owning handle to a [`Tensor`] inside its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

/// A logical memory region.
///
/// `bytes` grows as tensors are laid out over the buffer; the planner later
/// assigns it a physical range inside the device arena. A `sid >= 0` marks
/// the buffer as an import/export endpoint keyed by that stream id.
#[derive(Debug, Clone)]
pub struct TensorBuf {
    pub id: TensorBufId,
    pub bytes: u64,
    pub sid: i32,
    pub imported_rank: i32,
}

impl TensorBuf {
    pub fn new(id: TensorBufId, bytes: u64) -> Self {
        TensorBuf {
            id,
            bytes,
            sid: -1,
            imported_rank: -1,
        }
    }

    /// True if the buffer lives on a remote rank.
    pub fn is_imported(&self) -> bool {
        self.imported_rank >= 0
    }
}

/// A strided, padded view over a [`TensorBuf`].
#[derive(Debug, Clone)]
pub struct Tensor {
    pub id: TensorId,
    pub buf: TensorBufId,
    pub ttype: TensorType,
    /// Logical extent per axis.
    pub shape: Dims,
    /// Leading dimensions: the physical stride skeleton.
    pub ldims: Dims,
    /// Per-axis origin of the view inside the buffer.
    pub offs: Dims,
    /// Per-axis alignment; `ldims[i]` is always a multiple of `pads[i]`.
    pub pads: Dims,
    /// Published to other ranks when true and the buffer has a sid.
    pub exported: bool,
    /// Owning rank when >= 0; the buffer then lives remotely.
    pub imported_rank: i32,
    pub name: String,
}

impl Tensor {
    /// Builds a tensor, filling layout defaults and validating every
    /// invariant. No-dim `ldims` defaults to `shape`, no-dim `offs` to
    /// all-zero, no-dim `pads` to all-one.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TensorId,
        buf: TensorBufId,
        ttype: TensorType,
        shape: Dims,
        ldims: Dims,
        offs: Dims,
        pads: Dims,
        exported: bool,
        imported_rank: i32,
        name: String,
    ) -> Result<Self> {
        let invalid = |reason: String, shape: &Dims, ldims: &Dims, offs: &Dims, pads: &Dims| {
            SchedError::ShapeInvalid {
                name: name.clone(),
                reason,
                shape: shape.clone(),
                ldims: ldims.clone(),
                offs: offs.clone(),
                pads: pads.clone(),
            }
        };

        if shape.is_none() {
            return Err(invalid(
                "shape must not be the no-dim sentinel".into(),
                &shape,
                &ldims,
                &offs,
                &pads,
            ));
        }
        let ndims = shape.ndims();
        let ldims = if ldims.is_none() {
            shape.clone()
        } else {
            ldims
        };
        let offs = if offs.is_none() {
            Dims::repeated(0, ndims)
        } else {
            offs
        };
        let pads = if pads.is_none() {
            Dims::repeated(1, ndims)
        } else {
            pads
        };

        if ldims.ndims() != ndims || offs.ndims() != ndims || pads.ndims() != ndims {
            return Err(invalid(
                "shape, ldims, offs and pads must have equal ndims".into(),
                &shape,
                &ldims,
                &offs,
                &pads,
            ));
        }
        for i in 0..ndims {
            if offs[i] < 0 {
                return Err(invalid(
                    format!("offs[{i}] must be non-negative"),
                    &shape,
                    &ldims,
                    &offs,
                    &pads,
                ));
            }
            if pads[i] <= 0 {
                return Err(invalid(
                    format!("pads[{i}] must be positive"),
                    &shape,
                    &ldims,
                    &offs,
                    &pads,
                ));
            }
            if ldims[i] % pads[i] != 0 {
                return Err(invalid(
                    format!("ldims[{i}] must be a multiple of pads[{i}]"),
                    &shape,
                    &ldims,
                    &offs,
                    &pads,
                ));
            }
            if offs[i] + shape[i] > ldims[i] {
                return Err(invalid(
                    format!("view exceeds the buffer along axis {i}"),
                    &shape,
                    &ldims,
                    &offs,
                    &pads,
                ));
            }
        }

        Ok(Tensor {
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
        })
    }

    /// Number of dimensions.
    pub fn ndims(&self) -> usize {
        self.shape.ndims()
    }

    /// Number of elements, excluding padding.
    pub fn size(&self) -> DimType {
        self.shape.size()
    }

    /// Element offset of `idx` inside the backing buffer:
    /// `sum((offs[k] + idx[k]) * prod(ldims[j] for j > k))`.
    pub fn offset(&self, idx: &[DimType]) -> DimType {
        debug_assert_eq!(idx.len(), self.ndims());
        let mut off = 0;
        let mut stride = 1;
        for k in (0..self.ndims()).rev() {
            off += (self.offs[k] + idx[k]) * stride;
            stride *= self.ldims[k];
        }
        off
    }

    /// Byte offset of `idx` inside the backing buffer.
    pub fn offset_bytes(&self, idx: &[DimType]) -> DimType {
        self.offset(idx) * self.type_bytes()
    }

    /// Bytes of one element.
    pub fn type_bytes(&self) -> DimType {
        self.ttype.bytes()
    }

    /// Payload bytes of the view.
    pub fn shape_bytes(&self) -> DimType {
        self.size() * self.type_bytes()
    }

    /// Bytes the view's stride skeleton occupies in the buffer.
    pub fn ldims_bytes(&self) -> DimType {
        self.ldims.size() * self.type_bytes()
    }

    /// Shape rounded up to the pad units per axis.
    pub fn padded_shape(&self) -> Dims {
        let dims = (0..self.ndims())
            .map(|i| pad(self.shape[i], self.pads[i]))
            .collect();
        Dims::from_raw(dims)
    }

    /// True if the trailing dims of the view cover the buffer, i.e. the
    /// elements of the view are contiguous in memory.
    pub fn is_sequential(&self) -> bool {
        (1..self.ndims()).all(|i| self.shape[i] == self.ldims[i])
    }

    /// Aligns the view to additional pad units.
    ///
    /// A `new_pads` shorter than ndims is right-aligned; leading axes keep
    /// pad 1. Each pad becomes `lcm(old, new)` and each ldim is rounded up
    /// to the new pad, so pads and ldims only ever grow.
    pub fn update_pads(&mut self, new_pads: &[DimType]) -> Result<()> {
        let ndims = self.ndims();
        if new_pads.len() > ndims || new_pads.iter().any(|&p| p <= 0) {
            return Err(SchedError::ShapeInvalid {
                name: self.name.clone(),
                reason: format!("invalid pad update {new_pads:?}"),
                shape: self.shape.clone(),
                ldims: self.ldims.clone(),
                offs: self.offs.clone(),
                pads: self.pads.clone(),
            });
        }
        let lead = ndims - new_pads.len();
        let mut pads = Vec::with_capacity(ndims);
        let mut ldims = Vec::with_capacity(ndims);
        for i in 0..ndims {
            let unit = if i < lead { 1 } else { new_pads[i - lead] };
            let merged = lcm(self.pads[i], unit);
            pads.push(merged);
            ldims.push(pad(self.ldims[i], merged));
        }
        self.pads = Dims::from_raw(pads);
        self.ldims = Dims::from_raw(ldims);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(shape: Vec<DimType>, ldims: Dims, offs: Dims, pads: Dims) -> Result<Tensor> {
        Tensor::new(
            TensorId(0),
            TensorBufId(0),
            TensorType::Fp32,
            Dims::new(shape)?,
            ldims,
            offs,
            pads,
            false,
            -1,
            "t".into(),
        )
    }

    #[test]
    fn test_defaults_from_shape() {
        let t = tensor(vec![2, 3], Dims::none(), Dims::none(), Dims::none()).unwrap();
        assert_eq!(t.ldims, Dims::new(vec![2, 3]).unwrap());
        assert_eq!(t.offs.as_slice(), &[0, 0]);
        assert_eq!(t.pads.as_slice(), &[1, 1]);
        assert!(t.is_sequential());
    }

    #[test]
    fn test_rejects_view_outside_buffer() {
        let r = tensor(
            vec![4, 4],
            Dims::new(vec![4, 4]).unwrap(),
            Dims::from_raw(vec![1, 0]),
            Dims::none(),
        );
        assert!(matches!(r, Err(SchedError::ShapeInvalid { .. })));
    }

    #[test]
    fn test_rejects_unaligned_ldims() {
        let r = tensor(
            vec![4, 4],
            Dims::new(vec![4, 6]).unwrap(),
            Dims::none(),
            Dims::new(vec![1, 4]).unwrap(),
        );
        assert!(r.is_err());
    }

    #[test]
    fn test_offset_law() {
        // A 2x3 view at offset (1, 2) inside a 4x8 buffer.
        let t = tensor(
            vec![2, 3],
            Dims::new(vec![4, 8]).unwrap(),
            Dims::from_raw(vec![1, 2]),
            Dims::none(),
        )
        .unwrap();
        assert_eq!(t.offset(&[0, 0]), 10);
        assert_eq!(t.offset(&[1, 2]), 20);
        assert_eq!(t.offset_bytes(&[1, 2]), 80);

        // Every offset is unique and in bounds.
        let mut seen = std::collections::HashSet::new();
        for i in 0..2 {
            for j in 0..3 {
                let off = t.offset(&[i, j]);
                assert!(off >= 0 && off < t.ldims.size());
                assert!(seen.insert(off));
            }
        }
    }

    #[test]
    fn test_update_pads_monotonic() {
        let mut t = tensor(vec![5, 10], Dims::none(), Dims::none(), Dims::none()).unwrap();
        t.update_pads(&[4, 8]).unwrap();
        assert_eq!(t.pads.as_slice(), &[4, 8]);
        assert_eq!(t.ldims.as_slice(), &[8, 16]);

        // A second update merges via lcm and never shrinks.
        t.update_pads(&[6]).unwrap();
        assert_eq!(t.pads.as_slice(), &[4, 24]);
        assert_eq!(t.ldims.as_slice(), &[8, 24]);
    }

    #[test]
    fn test_update_pads_right_aligned() {
        let mut t = tensor(vec![5, 10], Dims::none(), Dims::none(), Dims::none()).unwrap();
        t.update_pads(&[32]).unwrap();
        assert_eq!(t.pads.as_slice(), &[1, 32]);
        assert_eq!(t.ldims.as_slice(), &[5, 32]);
    }

    #[test]
    fn test_padded_shape() {
        let mut t = tensor(vec![5, 10], Dims::none(), Dims::none(), Dims::none()).unwrap();
        t.update_pads(&[4, 8]).unwrap();
        assert_eq!(t.padded_shape(), Dims::new(vec![8, 16]).unwrap());
    }
}
