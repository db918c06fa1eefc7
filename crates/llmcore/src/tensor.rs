//! Tensor Descriptors and Element Types
//!
//! # Overview
//!
//! A tensor is a semantic n-dimensional array (n <= 4) described by an
//! element type, up to four extents, four byte strides, a data slot inside
//! the arena slab, and — for computed nodes — a producing op tag with up to
//! two source references. A tensor whose op is [`Op::None`] is a *leaf*
//! (loaded weight or input); anything else is a *node* the executor must
//! compute.
//!
//! Sources are referenced by [`TensorId`] — an index into the arena's
//! descriptor table — rather than pointers, so the executor can walk the
//! table linearly without dereference hazards.
//!
//! # Invariants
//!
//! - `nb[0]` equals the dtype's block byte size
//! - `nb[i] >= nb[i-1] * ne[i-1] / block` for dense tensors; views may
//!   permute strides
//! - for quantized dtypes, `ne[0]` must be a multiple of the block
//!   granularity (256)

use crate::errors::{LlmError, LlmResult};
use crate::quantize::{
    Q4K_BLOCK_BYTES, Q5K_BLOCK_BYTES, Q6K_BLOCK_BYTES, Q8K_BLOCK_BYTES, QK_K,
};

/// Maximum tensor rank
pub const MAX_DIMS: usize = 4;

/// Tensor element types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    Q4K,
    Q5K,
    Q6K,
    Q8K,
    I32,
}

impl DType {
    /// Map a GGUF tensor dtype id to an element type
    ///
    /// Ids outside the interpreted set are rejected rather than silently
    /// misread.
    pub fn from_gguf(id: u32) -> LlmResult<Self> {
        match id {
            0 => Ok(DType::F32),
            1 => Ok(DType::F16),
            12 => Ok(DType::Q4K),
            13 => Ok(DType::Q5K),
            14 => Ok(DType::Q6K),
            15 => Ok(DType::Q8K),
            16 => Ok(DType::I32),
            _ => Err(LlmError::unsupported(format!("gguf tensor dtype {}", id))),
        }
    }

    /// GGUF tensor dtype id
    pub fn gguf_id(self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::Q4K => 12,
            DType::Q5K => 13,
            DType::Q6K => 14,
            DType::Q8K => 15,
            DType::I32 => 16,
        }
    }

    /// Elements per storage block
    pub fn block_elems(self) -> usize {
        match self {
            DType::F32 | DType::F16 | DType::I32 => 1,
            DType::Q4K | DType::Q5K | DType::Q6K | DType::Q8K => QK_K,
        }
    }

    /// Bytes per storage block
    pub fn block_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
            DType::Q4K => Q4K_BLOCK_BYTES,
            DType::Q5K => Q5K_BLOCK_BYTES,
            DType::Q6K => Q6K_BLOCK_BYTES,
            DType::Q8K => Q8K_BLOCK_BYTES,
        }
    }

    /// Bytes for a contiguous run of `n` elements
    ///
    /// `n` must be a multiple of the block granularity for quantized types.
    pub fn row_bytes(self, n: usize) -> usize {
        n / self.block_elems() * self.block_bytes()
    }

    pub fn is_quantized(self) -> bool {
        self.block_elems() > 1
    }
}

/// Op tags for computed nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    None,
    Add,
    Mul,
    Scale,
    Silu,
    RmsNorm,
    SoftMax,
    CausalMask,
    Rope,
    MulMat,
    GetRows,
    Cpy,
    // Layout ops: no kernel, resolved as views of their source
    Reshape,
    Permute,
    View,
}

impl Op {
    /// Layout ops share their source's bytes instead of owning a range
    pub fn is_view(self) -> bool {
        matches!(self, Op::Reshape | Op::Permute | Op::View)
    }
}

/// Rotary embedding lane layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RopeMode {
    /// Rotate adjacent lane pairs (2k, 2k+1) — the driver's layout
    #[default]
    Interleaved,
    /// Rotate lane pairs (k, k + n_dims/2)
    HalfSplit,
}

/// Op-specific scratch parameters recorded on the node
#[derive(Debug, Clone, Copy, Default)]
pub enum OpParams {
    #[default]
    None,
    Scale(f32),
    RmsNorm {
        eps: f32,
    },
    Rope {
        n_past: i32,
        n_dims: usize,
        mode: RopeMode,
    },
    CausalMask {
        n_past: i32,
    },
    /// Byte offset into the source's data, for sub-range views
    View {
        byte_offset: usize,
    },
}

/// Index of a tensor descriptor in its arena's table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub(crate) u32);

impl TensorId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a tensor's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSlot {
    /// A graph node not yet materialized; the executor reserves its range
    Unallocated,
    /// A byte range within the arena slab
    Range { offset: usize, len: usize },
    /// Shares the source's range (plus the view byte offset), resolved
    /// when the source materializes
    View,
}

/// Tensor descriptor
#[derive(Debug, Clone)]
pub struct TensorDesc {
    pub dtype: DType,
    /// Extents; unused trailing dims are 1
    pub ne: [usize; MAX_DIMS],
    /// Byte strides; `nb[0]` is the block byte size
    pub nb: [usize; MAX_DIMS],
    pub op: Op,
    pub src0: Option<TensorId>,
    pub src1: Option<TensorId>,
    pub params: OpParams,
    pub data: DataSlot,
}

impl TensorDesc {
    /// Dense strides for the given dtype and extents
    pub fn contiguous_strides(dtype: DType, ne: &[usize; MAX_DIMS]) -> [usize; MAX_DIMS] {
        let row = dtype.row_bytes(ne[0]);
        [dtype.block_bytes(), row, row * ne[1], row * ne[1] * ne[2]]
    }

    /// A leaf descriptor with dense strides and no data yet
    pub fn leaf(dtype: DType, ne: [usize; MAX_DIMS]) -> Self {
        TensorDesc {
            dtype,
            ne,
            nb: Self::contiguous_strides(dtype, &ne),
            op: Op::None,
            src0: None,
            src1: None,
            params: OpParams::None,
            data: DataSlot::Unallocated,
        }
    }

    /// Total element count
    pub fn nelements(&self) -> usize {
        self.ne.iter().product()
    }

    /// Number of axis-0 rows
    pub fn nrows(&self) -> usize {
        self.ne[1] * self.ne[2] * self.ne[3]
    }

    /// Bytes a dense copy of this tensor occupies
    pub fn nbytes(&self) -> usize {
        self.dtype.row_bytes(self.ne[0]) * self.nrows()
    }

    /// Bytes spanned by this tensor through its strides, from its data
    /// start to one past its last element
    pub fn span_bytes(&self) -> usize {
        let mut span = self.dtype.block_bytes();
        for i in 0..MAX_DIMS {
            if self.ne[i] > 1 {
                let steps = match i {
                    0 => self.ne[0] / self.dtype.block_elems() - 1,
                    _ => self.ne[i] - 1,
                };
                span += steps * self.nb[i];
            }
        }
        span
    }

    /// Whether the layout matches dense contiguous strides
    pub fn is_contiguous(&self) -> bool {
        self.nb == Self::contiguous_strides(self.dtype, &self.ne)
    }

    /// Rows along axis 0 are dense (strided views may still satisfy this)
    pub fn has_contiguous_rows(&self) -> bool {
        self.nb[0] == self.dtype.block_bytes()
    }

    /// Shapes equal in every dimension
    pub fn same_shape(&self, other: &TensorDesc) -> bool {
        self.ne == other.ne
    }
}
