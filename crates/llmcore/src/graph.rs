//! Computation Graph Builder and Executor
//!
//! # Overview
//!
//! Graph construction and execution over arena-backed tensor descriptors.
//! Builder functions validate shapes and record op nodes — no arithmetic
//! happens at construction time. The executor topologically sorts the
//! graph from its roots, reserves data for each node in bump order, and
//! dispatches to the kernels in [`crate::ops`].
//!
//! # Node Identity
//!
//! Nodes reference their sources as [`TensorId`] indices into the arena's
//! descriptor table, so the executor iterates the table linearly and never
//! chases raw pointers. Duplicate visits are rejected by id identity.
//!
//! # Execution Order
//!
//! `execute` takes a *list* of roots expanded in order. Side-effecting
//! copies (KV-cache appends) are passed as early roots so they run before
//! the attention reads that consume the cache through a leaf view; data
//! dependencies within each subtree are handled by the post-order sort.
//!
//! # Failure Semantics
//!
//! A kernel-level failure (shape violation detected late) logs a warning
//! and zero-fills the node's output so the pass still completes with
//! degraded output. Arena exhaustion mid-pass is a hard abort returned to
//! the driver.

use tracing::warn;

use crate::arena::{cast_f32, cast_f32_mut, TensorArena};
use crate::errors::{LlmError, LlmResult};
use crate::ops;
use crate::tensor::{
    DataSlot, DType, Op, OpParams, RopeMode, TensorDesc, TensorId, MAX_DIMS,
};

/// Default rotary base frequency when the model metadata omits it
pub const DEFAULT_ROPE_THETA: f32 = 10000.0;

fn new_node(
    arena: &mut TensorArena,
    dtype: DType,
    ne: [usize; MAX_DIMS],
    op: Op,
    src0: Option<TensorId>,
    src1: Option<TensorId>,
    params: OpParams,
) -> LlmResult<TensorId> {
    let desc = TensorDesc {
        dtype,
        ne,
        nb: TensorDesc::contiguous_strides(dtype, &ne),
        op,
        src0,
        src1,
        params,
        data: DataSlot::Unallocated,
    };
    arena.push_desc(desc)
}

fn require_f32(arena: &TensorArena, id: TensorId, op: &'static str) -> LlmResult<()> {
    if arena.desc(id)?.dtype != DType::F32 {
        return Err(LlmError::ShapeMismatch {
            op,
            detail: "operand must be f32".to_string(),
        });
    }
    Ok(())
}

/// Element-wise `a + b`; shapes must match exactly
pub fn add(arena: &mut TensorArena, a: TensorId, b: TensorId) -> LlmResult<TensorId> {
    require_f32(arena, a, "add")?;
    require_f32(arena, b, "add")?;
    let (ne_a, ne_b) = (arena.desc(a)?.ne, arena.desc(b)?.ne);
    if ne_a != ne_b {
        return Err(LlmError::ShapeMismatch {
            op: "add",
            detail: format!("{:?} vs {:?}", ne_a, ne_b),
        });
    }
    new_node(arena, DType::F32, ne_a, Op::Add, Some(a), Some(b), OpParams::None)
}

/// Element-wise `a * b`; `b` may be a single row broadcast across `a`
pub fn mul(arena: &mut TensorArena, a: TensorId, b: TensorId) -> LlmResult<TensorId> {
    require_f32(arena, a, "mul")?;
    require_f32(arena, b, "mul")?;
    let (ne_a, ne_b) = (arena.desc(a)?.ne, arena.desc(b)?.ne);
    let broadcast = ne_b[0] == ne_a[0] && ne_b[1] == 1 && ne_b[2] == 1 && ne_b[3] == 1;
    if ne_a != ne_b && !broadcast {
        return Err(LlmError::ShapeMismatch {
            op: "mul",
            detail: format!("{:?} vs {:?}", ne_a, ne_b),
        });
    }
    new_node(arena, DType::F32, ne_a, Op::Mul, Some(a), Some(b), OpParams::None)
}

/// Multiply by a scalar recorded on the node
pub fn scale(arena: &mut TensorArena, x: TensorId, s: f32) -> LlmResult<TensorId> {
    require_f32(arena, x, "scale")?;
    let ne = arena.desc(x)?.ne;
    new_node(arena, DType::F32, ne, Op::Scale, Some(x), None, OpParams::Scale(s))
}

/// SiLU activation
pub fn silu(arena: &mut TensorArena, x: TensorId) -> LlmResult<TensorId> {
    require_f32(arena, x, "silu")?;
    let ne = arena.desc(x)?.ne;
    new_node(arena, DType::F32, ne, Op::Silu, Some(x), None, OpParams::None)
}

/// Per-row RMS normalization along the contiguous axis
pub fn rms_norm(arena: &mut TensorArena, x: TensorId, eps: f32) -> LlmResult<TensorId> {
    require_f32(arena, x, "rms_norm")?;
    let ne = arena.desc(x)?.ne;
    new_node(
        arena,
        DType::F32,
        ne,
        Op::RmsNorm,
        Some(x),
        None,
        OpParams::RmsNorm { eps },
    )
}

/// Numerically-stable softmax along the contiguous axis
pub fn soft_max(arena: &mut TensorArena, x: TensorId) -> LlmResult<TensorId> {
    require_f32(arena, x, "soft_max")?;
    let ne = arena.desc(x)?.ne;
    new_node(arena, DType::F32, ne, Op::SoftMax, Some(x), None, OpParams::None)
}

/// Causal mask over attention score rows: lane `i0` of query row `i1` is
/// knocked to -inf when `i0 > n_past + i1`
pub fn causal_mask(arena: &mut TensorArena, x: TensorId, n_past: i32) -> LlmResult<TensorId> {
    require_f32(arena, x, "causal_mask")?;
    let ne = arena.desc(x)?.ne;
    new_node(
        arena,
        DType::F32,
        ne,
        Op::CausalMask,
        Some(x),
        None,
        OpParams::CausalMask { n_past },
    )
}

/// Rotary position embedding over `[lanes, heads, positions]`
pub fn rope(
    arena: &mut TensorArena,
    x: TensorId,
    n_past: i32,
    n_dims: usize,
    mode: RopeMode,
) -> LlmResult<TensorId> {
    require_f32(arena, x, "rope")?;
    let desc = arena.desc(x)?;
    if n_dims > desc.ne[0] || n_dims % 2 != 0 {
        return Err(LlmError::ShapeMismatch {
            op: "rope",
            detail: format!("n_dims {} does not fit lanes {}", n_dims, desc.ne[0]),
        });
    }
    let ne = desc.ne;
    new_node(
        arena,
        DType::F32,
        ne,
        Op::Rope,
        Some(x),
        None,
        OpParams::Rope {
            n_past,
            n_dims,
            mode,
        },
    )
}

/// Matrix multiplication contracting both operands over axis 0
///
/// `a: [K, M, Ba]` (f32/f16/Q4_K), `b: [K, N, Bb]` (f32) gives
/// `[M, N, Bb]`; `Ba` must divide `Bb` (grouped-query head broadcast).
pub fn mul_mat(arena: &mut TensorArena, a: TensorId, b: TensorId) -> LlmResult<TensorId> {
    let (da, db) = (arena.desc(a)?, arena.desc(b)?);
    if da.ne[0] != db.ne[0] {
        return Err(LlmError::ShapeMismatch {
            op: "mul_mat",
            detail: format!("contracting axes differ: {} vs {}", da.ne[0], db.ne[0]),
        });
    }
    if db.dtype != DType::F32 {
        return Err(LlmError::ShapeMismatch {
            op: "mul_mat",
            detail: "right operand must be f32".to_string(),
        });
    }
    if !da.has_contiguous_rows() || !db.has_contiguous_rows() {
        return Err(LlmError::ShapeMismatch {
            op: "mul_mat",
            detail: "operands must have dense axis-0 rows".to_string(),
        });
    }
    if da.ne[3] != 1 || db.ne[3] != 1 {
        return Err(LlmError::ShapeMismatch {
            op: "mul_mat",
            detail: "rank-4 batching is not supported".to_string(),
        });
    }
    if da.ne[2] == 0 || db.ne[2] % da.ne[2] != 0 {
        return Err(LlmError::ShapeMismatch {
            op: "mul_mat",
            detail: format!("batch {} does not broadcast into {}", da.ne[2], db.ne[2]),
        });
    }
    let ne = [da.ne[1], db.ne[1], db.ne[2], 1];
    new_node(arena, DType::F32, ne, Op::MulMat, Some(a), Some(b), OpParams::None)
}

/// Gather rows of `e: [d, V]` at i32 indices, producing `[d, len(idx)]` f32
pub fn get_rows(arena: &mut TensorArena, e: TensorId, idx: TensorId) -> LlmResult<TensorId> {
    let (de, di) = (arena.desc(e)?, arena.desc(idx)?);
    if di.dtype != DType::I32 {
        return Err(LlmError::ShapeMismatch {
            op: "get_rows",
            detail: "indices must be i32".to_string(),
        });
    }
    let ne = [de.ne[0], di.ne[0], 1, 1];
    new_node(arena, DType::F32, ne, Op::GetRows, Some(e), Some(idx), OpParams::None)
}

/// Reinterpret a contiguous tensor with a new shape of equal element count
pub fn reshape(arena: &mut TensorArena, x: TensorId, ne: [usize; MAX_DIMS]) -> LlmResult<TensorId> {
    let desc = arena.desc(x)?;
    if !desc.is_contiguous() {
        return Err(LlmError::ShapeMismatch {
            op: "reshape",
            detail: "source must be contiguous".to_string(),
        });
    }
    if desc.nelements() != ne.iter().product::<usize>() {
        return Err(LlmError::ShapeMismatch {
            op: "reshape",
            detail: format!("{:?} -> {:?} changes element count", desc.ne, ne),
        });
    }
    let dtype = desc.dtype;
    let node = TensorDesc {
        dtype,
        ne,
        nb: TensorDesc::contiguous_strides(dtype, &ne),
        op: Op::Reshape,
        src0: Some(x),
        src1: None,
        params: OpParams::View { byte_offset: 0 },
        data: DataSlot::View,
    };
    arena.push_desc(node)
}

/// Permute axes; produces a stride view without moving data
pub fn permute(
    arena: &mut TensorArena,
    x: TensorId,
    perm: [usize; MAX_DIMS],
) -> LlmResult<TensorId> {
    let desc = arena.desc(x)?;
    let mut ne = [1usize; MAX_DIMS];
    let mut nb = [0usize; MAX_DIMS];
    for (dst_axis, &src_axis) in perm.iter().enumerate() {
        if src_axis >= MAX_DIMS {
            return Err(LlmError::ShapeMismatch {
                op: "permute",
                detail: format!("axis {} out of range", src_axis),
            });
        }
        ne[dst_axis] = desc.ne[src_axis];
        nb[dst_axis] = desc.nb[src_axis];
    }
    let dtype = desc.dtype;
    let node = TensorDesc {
        dtype,
        ne,
        nb,
        op: Op::Permute,
        src0: Some(x),
        src1: None,
        params: OpParams::View { byte_offset: 0 },
        data: DataSlot::View,
    };
    arena.push_desc(node)
}

/// Swap the first two axes (a stride view; copy through [`cont`] when a
/// dense layout is required downstream)
pub fn transpose(arena: &mut TensorArena, x: TensorId) -> LlmResult<TensorId> {
    permute(arena, x, [1, 0, 2, 3])
}

/// Arbitrary sub-range view with explicit shape and strides
pub fn view(
    arena: &mut TensorArena,
    x: TensorId,
    ne: [usize; MAX_DIMS],
    nb: [usize; MAX_DIMS],
    byte_offset: usize,
) -> LlmResult<TensorId> {
    let dtype = arena.desc(x)?.dtype;
    let node = TensorDesc {
        dtype,
        ne,
        nb,
        op: Op::View,
        src0: Some(x),
        src1: None,
        params: OpParams::View { byte_offset },
        data: DataSlot::View,
    };
    arena.push_desc(node)
}

/// Copy a (possibly strided) view into a fresh contiguous tensor
pub fn cont(arena: &mut TensorArena, x: TensorId) -> LlmResult<TensorId> {
    require_f32(arena, x, "cont")?;
    let ne = arena.desc(x)?.ne;
    new_node(arena, DType::F32, ne, Op::Cpy, Some(x), None, OpParams::None)
}

/// Copy `src` into an existing destination view (the KV-cache append)
///
/// The returned node owns no data; it writes through the destination's
/// strides into the destination's bytes. Pass it to the executor as an
/// early root so the write lands before any read of the underlying leaf.
pub fn copy_to(arena: &mut TensorArena, src: TensorId, dst: TensorId) -> LlmResult<TensorId> {
    require_f32(arena, src, "copy_to")?;
    require_f32(arena, dst, "copy_to")?;
    let (ne_src, d_dst) = (arena.desc(src)?.ne, arena.desc(dst)?.clone());
    if ne_src != d_dst.ne {
        return Err(LlmError::ShapeMismatch {
            op: "copy_to",
            detail: format!("{:?} vs {:?}", ne_src, d_dst.ne),
        });
    }
    let node = TensorDesc {
        dtype: DType::F32,
        ne: d_dst.ne,
        nb: d_dst.nb,
        op: Op::Cpy,
        src0: Some(src),
        src1: Some(dst),
        params: OpParams::None,
        data: DataSlot::View,
    };
    arena.push_desc(node)
}

/// Graph executor with reusable scratch state
pub struct Executor {
    scratch: Vec<f32>,
    /// Rotary base frequency used by rope nodes
    pub rope_theta: f32,
    /// Nodes executed by the most recent pass
    pub nodes_executed: usize,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Executor {
            scratch: Vec::new(),
            rope_theta: DEFAULT_ROPE_THETA,
            nodes_executed: 0,
        }
    }

    /// Execute the graph reachable from `roots`, in root order
    pub fn execute(&mut self, arena: &mut TensorArena, roots: &[TensorId]) -> LlmResult<()> {
        let order = topo_sort(arena, roots)?;
        self.nodes_executed = 0;

        for id in order {
            let op = arena.desc(id)?.op;
            if op == Op::None {
                // Leaves must arrive materialized (weights, cache, inputs)
                if !matches!(arena.desc(id)?.data, DataSlot::Range { .. }) {
                    return Err(LlmError::internal(format!(
                        "leaf tensor {:?} has no data",
                        id
                    )));
                }
                continue;
            }

            materialize(arena, id)?;
            if op.is_view() {
                continue;
            }

            match self.dispatch(arena, id) {
                Ok(()) => {}
                Err(err @ LlmError::OutOfMemory { .. }) => return Err(err),
                Err(err) => {
                    // Degrade, don't abort: downstream ops see zeros
                    warn!(node = id.0, error = %err, "kernel failed, zero-filling output");
                    arena.bytes_mut(id)?.fill(0);
                }
            }
            self.nodes_executed += 1;
        }
        Ok(())
    }

    fn dispatch(&mut self, arena: &mut TensorArena, id: TensorId) -> LlmResult<()> {
        let node = arena.desc(id)?.clone();
        let (dst_off, dst_len) = arena.range(id)?;

        // Every compute node has a first source; binary ops have a second
        let missing = || LlmError::internal("compute node missing a source");
        let id0 = node.src0.ok_or_else(missing)?;
        let d_src0 = arena.desc(id0)?.clone();
        let src0 = arena.range(id0)?;
        let d_src1 = node.src1.map(|s| arena.desc(s).map(|d| d.clone())).transpose()?;
        let src1 = node.src1.map(|s| arena.range(s)).transpose()?;

        let base = arena.base_ptr();
        // SAFETY: the destination range was either bump-allocated past every
        // already-materialized range or is a cache view disjoint from this
        // node's sources; the slab pointer is stable and no other references
        // into the slab are live across this call.
        let dst: &mut [u8] = unsafe { std::slice::from_raw_parts_mut(base.add(dst_off), dst_len) };
        let s0: &[u8] = unsafe { std::slice::from_raw_parts(base.add(src0.0), src0.1) };
        let s1: Option<&[u8]> =
            src1.map(|(off, len)| unsafe { std::slice::from_raw_parts(base.add(off), len) });

        match node.op {
            Op::Add => {
                let b = s1.ok_or_else(missing)?;
                ops::vec_add(cast_f32(s0), cast_f32(b), cast_f32_mut(dst));
            }
            Op::Mul => {
                let b = cast_f32(s1.ok_or_else(missing)?);
                let out = cast_f32_mut(dst);
                if d_src1.as_ref().map(|d| d.nrows()) == Some(1) && d_src0.nrows() != 1 {
                    ops::vec_mul_broadcast(cast_f32(s0), b, out);
                } else {
                    ops::vec_mul(cast_f32(s0), b, out);
                }
            }
            Op::Scale => {
                let s = match node.params {
                    OpParams::Scale(s) => s,
                    _ => return Err(LlmError::internal("scale node without factor")),
                };
                ops::vec_scale(cast_f32(s0), s, cast_f32_mut(dst));
            }
            Op::Silu => {
                ops::vec_silu(cast_f32(s0), cast_f32_mut(dst));
            }
            Op::RmsNorm => {
                let eps = match node.params {
                    OpParams::RmsNorm { eps } => eps,
                    _ => return Err(LlmError::internal("rms_norm node without eps")),
                };
                ops::rms_norm_rows(cast_f32(s0), cast_f32_mut(dst), node.ne[0], eps);
            }
            Op::SoftMax => {
                ops::softmax_rows(cast_f32(s0), cast_f32_mut(dst), node.ne[0]);
            }
            Op::CausalMask => {
                let n_past = match node.params {
                    OpParams::CausalMask { n_past } => n_past,
                    _ => return Err(LlmError::internal("mask node without n_past")),
                };
                ops::causal_mask_rows(
                    cast_f32(s0),
                    cast_f32_mut(dst),
                    [node.ne[0], node.ne[1], node.ne[2]],
                    n_past,
                );
            }
            Op::Rope => {
                let (n_past, n_dims, mode) = match node.params {
                    OpParams::Rope {
                        n_past,
                        n_dims,
                        mode,
                    } => (n_past, n_dims, mode),
                    _ => return Err(LlmError::internal("rope node without params")),
                };
                ops::rope_rows(
                    cast_f32(s0),
                    cast_f32_mut(dst),
                    [node.ne[0], node.ne[1], node.ne[2]],
                    n_past,
                    n_dims,
                    mode,
                    self.rope_theta,
                );
            }
            Op::MulMat => {
                let db = d_src1.ok_or_else(missing)?;
                let a = ops::MatView {
                    data: s0,
                    dtype: d_src0.dtype,
                    ne: [d_src0.ne[0], d_src0.ne[1], d_src0.ne[2]],
                    nb: [d_src0.nb[0], d_src0.nb[1], d_src0.nb[2]],
                };
                let b = ops::MatView {
                    data: s1.ok_or_else(missing)?,
                    dtype: db.dtype,
                    ne: [db.ne[0], db.ne[1], db.ne[2]],
                    nb: [db.nb[0], db.nb[1], db.nb[2]],
                };
                ops::mul_mat(&a, &b, cast_f32_mut(dst), &mut self.scratch)?;
            }
            Op::GetRows => {
                let idx_bytes = s1.ok_or_else(missing)?;
                // SAFETY: i32 tensors are 4-aligned within the slab.
                let idx: &[i32] = unsafe {
                    std::slice::from_raw_parts(idx_bytes.as_ptr() as *const i32, idx_bytes.len() / 4)
                };
                ops::get_rows(
                    s0,
                    d_src0.dtype,
                    d_src0.ne[0],
                    d_src0.ne[1],
                    idx,
                    cast_f32_mut(dst),
                )?;
            }
            Op::Cpy => {
                ops::strided_copy_f32(s0, d_src0.nb, dst, node.nb, node.ne);
            }
            // Leaves and layout views never reach dispatch
            Op::None | Op::Reshape | Op::Permute | Op::View => {
                return Err(LlmError::internal("layout node reached dispatch"))
            }
        }
        Ok(())
    }
}

/// Reserve or resolve a node's data slot
fn materialize(arena: &mut TensorArena, id: TensorId) -> LlmResult<()> {
    let desc = arena.desc(id)?;
    match desc.data {
        DataSlot::Range { .. } => Ok(()),
        DataSlot::Unallocated => {
            let len = desc.nbytes();
            let offset = arena.alloc_bytes(len)?;
            arena.desc_mut(id)?.data = DataSlot::Range { offset, len };
            Ok(())
        }
        DataSlot::View => {
            // A plain view resolves against src0; a copy_to node writes
            // through src1's bytes
            let span = desc.span_bytes();
            let byte_offset = match desc.params {
                OpParams::View { byte_offset } => byte_offset,
                _ => 0,
            };
            let target = match desc.op {
                Op::Cpy => desc.src1,
                _ => desc.src0,
            }
            .ok_or_else(|| LlmError::internal("view without source"))?;
            let (src_off, src_len) = arena.range(target)?;
            if byte_offset + span > src_len {
                return Err(LlmError::ShapeMismatch {
                    op: "view",
                    detail: format!(
                        "view spans {} bytes at offset {}, source has {}",
                        span, byte_offset, src_len
                    ),
                });
            }
            arena.desc_mut(id)?.data = DataSlot::Range {
                offset: src_off + byte_offset,
                len: src_len - byte_offset,
            };
            Ok(())
        }
    }
}

/// Post-order topological sort from `roots`, visiting sources before
/// consumers; later roots extend the order without revisiting shared nodes
fn topo_sort(arena: &TensorArena, roots: &[TensorId]) -> LlmResult<Vec<TensorId>> {
    let mut visited = vec![false; arena.tensor_count()];
    let mut order = Vec::new();

    for &root in roots {
        if root.index() >= visited.len() {
            return Err(LlmError::internal(format!("stale root id {:?}", root)));
        }
        // Iterative DFS; the bool marks whether children were expanded
        let mut stack: Vec<(TensorId, bool)> = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if visited[id.index()] && !expanded {
                continue;
            }
            if expanded {
                if !visited[id.index()] {
                    visited[id.index()] = true;
                    order.push(id);
                }
                continue;
            }
            stack.push((id, true));
            let desc = arena.desc(id)?;
            // For copy_to nodes src1 is the destination view; it still must
            // resolve before the copy runs
            if let Some(s1) = desc.src1 {
                stack.push((s1, false));
            }
            if let Some(s0) = desc.src0 {
                stack.push((s0, false));
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with(values: &[f32], ne: [usize; MAX_DIMS]) -> (TensorArena, TensorId) {
        let mut arena = TensorArena::new(1 << 20);
        let id = arena.alloc_tensor(DType::F32, ne).unwrap();
        arena.f32_mut(id).unwrap().copy_from_slice(values);
        (arena, id)
    }

    #[test]
    fn test_build_records_without_computing() {
        let (mut arena, x) = arena_with(&[1.0, 2.0], [2, 1, 1, 1]);
        let y = scale(&mut arena, x, 2.0).unwrap();
        // Node exists but has no data until executed
        assert!(matches!(
            arena.desc(y).unwrap().data,
            DataSlot::Unallocated
        ));
    }

    #[test]
    fn test_execute_chain() {
        let (mut arena, x) = arena_with(&[1.0, 2.0, 3.0, 4.0], [4, 1, 1, 1]);
        let doubled = scale(&mut arena, x, 2.0).unwrap();
        let summed = add(&mut arena, doubled, x).unwrap();

        let mut exec = Executor::new();
        exec.execute(&mut arena, &[summed]).unwrap();
        assert_eq!(arena.f32(summed).unwrap(), &[3.0, 6.0, 9.0, 12.0]);
        assert_eq!(exec.nodes_executed, 2);
    }

    #[test]
    fn test_shared_node_executes_once() {
        let (mut arena, x) = arena_with(&[1.0, 1.0], [2, 1, 1, 1]);
        let shared = scale(&mut arena, x, 3.0).unwrap();
        let a = add(&mut arena, shared, shared).unwrap();

        let mut exec = Executor::new();
        exec.execute(&mut arena, &[a]).unwrap();
        assert_eq!(arena.f32(a).unwrap(), &[6.0, 6.0]);
        assert_eq!(exec.nodes_executed, 2); // shared counted once
    }

    #[test]
    fn test_mul_broadcast_gain() {
        let (mut arena, x) = arena_with(&[1.0, 2.0, 3.0, 4.0], [2, 2, 1, 1]);
        let g = arena.alloc_tensor(DType::F32, [2, 1, 1, 1]).unwrap();
        arena.f32_mut(g).unwrap().copy_from_slice(&[10.0, 100.0]);
        let scaled = mul(&mut arena, x, g).unwrap();

        Executor::new().execute(&mut arena, &[scaled]).unwrap();
        assert_eq!(arena.f32(scaled).unwrap(), &[10.0, 200.0, 30.0, 400.0]);
    }

    #[test]
    fn test_mul_mat_through_graph() {
        let (mut arena, a) = arena_with(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], [2, 3, 1, 1]);
        let b = arena.alloc_tensor(DType::F32, [2, 1, 1, 1]).unwrap();
        arena.f32_mut(b).unwrap().copy_from_slice(&[5.0, 7.0]);
        let c = mul_mat(&mut arena, a, b).unwrap();
        assert_eq!(arena.desc(c).unwrap().ne, [3, 1, 1, 1]);

        Executor::new().execute(&mut arena, &[c]).unwrap();
        assert_eq!(arena.f32(c).unwrap(), &[5.0, 7.0, 12.0]);
    }

    #[test]
    fn test_transpose_then_cont() {
        let (mut arena, x) = arena_with(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3, 1, 1]);
        let t = transpose(&mut arena, x).unwrap();
        let dense = cont(&mut arena, t).unwrap();

        Executor::new().execute(&mut arena, &[dense]).unwrap();
        assert_eq!(arena.desc(dense).unwrap().ne, [3, 2, 1, 1]);
        assert_eq!(arena.f32(dense).unwrap(), &[1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_copy_to_view_lands_in_leaf() {
        // A 4-column destination leaf; write columns 2..4 through a view
        let (mut arena, dst_leaf) = arena_with(&[0.0; 8], [2, 4, 1, 1]);
        let (src_values, src_ne) = ([9.0f32, 8.0, 7.0, 6.0], [2usize, 2, 1, 1]);
        let src = arena.alloc_tensor(DType::F32, src_ne).unwrap();
        arena.f32_mut(src).unwrap().copy_from_slice(&src_values);

        let dst_view = view(&mut arena, dst_leaf, [2, 2, 1, 1], [4, 8, 16, 16], 16).unwrap();
        let append = copy_to(&mut arena, src, dst_view).unwrap();

        Executor::new().execute(&mut arena, &[append]).unwrap();
        assert_eq!(
            arena.f32(dst_leaf).unwrap(),
            &[0.0, 0.0, 0.0, 0.0, 9.0, 8.0, 7.0, 6.0]
        );
    }

    #[test]
    fn test_shape_mismatch_at_build_time() {
        let (mut arena, x) = arena_with(&[0.0; 4], [4, 1, 1, 1]);
        let y = arena.alloc_tensor(DType::F32, [2, 1, 1, 1]).unwrap();
        assert!(matches!(
            add(&mut arena, x, y).unwrap_err(),
            LlmError::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn test_arena_oom_aborts_pass() {
        // Slab large enough to build descriptors but not node data
        let mut arena = TensorArena::new(256);
        let x = arena.alloc_tensor(DType::F32, [16, 1, 1, 1]).unwrap();
        let mut last = x;
        for _ in 0..8 {
            last = scale(&mut arena, last, 1.5).unwrap();
        }
        let err = Executor::new().execute(&mut arena, &[last]).unwrap_err();
        assert!(matches!(err, LlmError::OutOfMemory { .. }));
    }

    #[test]
    fn test_get_rows_through_graph() {
        let mut arena = TensorArena::new(1 << 20);
        let e = arena.alloc_tensor(DType::F32, [4, 10, 1, 1]).unwrap();
        for (i, v) in arena.f32_mut(e).unwrap().iter_mut().enumerate() {
            *v = i as f32;
        }
        let idx = arena.alloc_tensor(DType::I32, [2, 1, 1, 1]).unwrap();
        arena.i32_mut(idx).unwrap().copy_from_slice(&[9, 0]);
        let rows = get_rows(&mut arena, e, idx).unwrap();

        Executor::new().execute(&mut arena, &[rows]).unwrap();
        assert_eq!(
            arena.f32(rows).unwrap(),
            &[36.0, 37.0, 38.0, 39.0, 0.0, 1.0, 2.0, 3.0]
        );
    }
}
