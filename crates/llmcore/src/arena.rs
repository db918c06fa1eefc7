//! Bump-Allocated Tensor Arena
//!
//! # Overview
//!
//! Deterministic, non-fragmenting allocation for tensor descriptors and
//! tensor data during model load, graph construction, and execution. The
//! arena owns (or adopts) a single byte slab and partitions it in bump
//! order; descriptors live in a bounded side table indexed by [`TensorId`].
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Model weights (uploaded once at load)       │
//! ├──────────────────────────────────────────────┤
//! │  KV cache (lives with the inference state)   │
//! ├──────────────────────────────────────────────┤  ← generation mark
//! │  Per-pass graph node data (reset each pass)  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Design Rationale
//!
//! - **O(1) allocation**: a bump cursor, no free lists, no coalescing
//! - **Zero fragmentation**: the cursor only moves forward within a pass
//! - **Cheap reuse**: [`TensorArena::reset_to`] rewinds cursor and table to
//!   a snapshot between forward passes; per-element free does not exist
//!
//! The slab may be adopted from a host-reserved memory region
//! ([`TensorArena::from_raw_region`]); the arena owns its slab iff it
//! allocated it.
//!
//! # Thread Safety
//!
//! The arena is owned by exactly one worker at a time and is not
//! internally synchronized.

use crate::errors::{LlmError, LlmResult};
use crate::tensor::{DataSlot, DType, TensorDesc, TensorId, MAX_DIMS};

/// Alignment for all descriptors and data regions
pub const ARENA_ALIGNMENT: usize = 32;

/// Descriptor table capacity
///
/// Overflow is fatal to the current forward pass but not to the arena.
pub const MAX_TENSORS: usize = 4096;

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[derive(Debug)]
enum Slab {
    Owned(Box<[u8]>),
    External { ptr: *mut u8, len: usize },
}

// SAFETY: an external region is handed to exactly one arena, and the arena
// is owned by a single worker at any instant (see module docs).
unsafe impl Send for Slab {}

impl Slab {
    fn as_slice(&self) -> &[u8] {
        match self {
            Slab::Owned(b) => b,
            // SAFETY: `from_raw_region` requires ptr/len to describe a
            // valid region for the arena's lifetime.
            Slab::External { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Slab::Owned(b) => b,
            // SAFETY: as above; `&mut self` guarantees exclusive access.
            Slab::External { ptr, len } => unsafe { std::slice::from_raw_parts_mut(*ptr, *len) },
        }
    }

    fn len(&self) -> usize {
        match self {
            Slab::Owned(b) => b.len(),
            Slab::External { len, .. } => *len,
        }
    }
}

/// Snapshot of the bump cursor and descriptor table
#[derive(Debug, Clone, Copy)]
pub struct ArenaMark {
    cursor: usize,
    table_len: usize,
}

/// Arena usage statistics
#[derive(Debug, Clone, Copy)]
pub struct ArenaStats {
    pub used: usize,
    pub capacity: usize,
    pub high_water: usize,
    pub tensor_count: usize,
    pub allocation_count: u64,
}

/// Bump allocator over a byte slab with a bounded tensor table
#[derive(Debug)]
pub struct TensorArena {
    slab: Slab,
    cursor: usize,
    table: Vec<TensorDesc>,
    high_water: usize,
    allocation_count: u64,
}

impl TensorArena {
    /// Create an arena that owns a zero-initialized slab of `size` bytes
    pub fn new(size: usize) -> Self {
        TensorArena {
            slab: Slab::Owned(vec![0u8; size].into_boxed_slice()),
            cursor: 0,
            table: Vec::with_capacity(256),
            high_water: 0,
            allocation_count: 0,
        }
    }

    /// Adopt a caller-provided memory region without taking ownership
    ///
    /// Stands in for a boot-time physical reservation: the arena does not
    /// care how the region was obtained and never frees it.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the
    /// arena's entire lifetime, and no other code may access the region
    /// while the arena lives.
    pub unsafe fn from_raw_region(ptr: *mut u8, len: usize) -> Self {
        TensorArena {
            slab: Slab::External { ptr, len },
            cursor: 0,
            table: Vec::with_capacity(256),
            high_water: 0,
            allocation_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slab.len()
    }

    pub fn used(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.slab.len() - self.cursor
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            used: self.cursor,
            capacity: self.slab.len(),
            high_water: self.high_water,
            tensor_count: self.table.len(),
            allocation_count: self.allocation_count,
        }
    }

    /// Reserve `size` bytes, 32-byte aligned; returns the slab offset
    pub fn alloc_bytes(&mut self, size: usize) -> LlmResult<usize> {
        let offset = align_up(self.cursor, ARENA_ALIGNMENT);
        let end = offset.checked_add(size).ok_or(LlmError::OutOfMemory {
            requested: size,
            available: self.remaining(),
        })?;
        if end > self.slab.len() {
            return Err(LlmError::OutOfMemory {
                requested: size,
                available: self.slab.len() - offset.min(self.slab.len()),
            });
        }
        self.cursor = end;
        self.allocation_count += 1;
        if self.cursor > self.high_water {
            self.high_water = self.cursor;
        }
        Ok(offset)
    }

    /// Append a descriptor to the table
    pub fn push_desc(&mut self, desc: TensorDesc) -> LlmResult<TensorId> {
        if self.table.len() >= MAX_TENSORS {
            return Err(LlmError::NodeLimit {
                capacity: MAX_TENSORS,
            });
        }
        let id = TensorId(self.table.len() as u32);
        self.table.push(desc);
        Ok(id)
    }

    /// Allocate a dense leaf tensor with its data range reserved now
    ///
    /// Quantized extents must be a multiple of the block granularity.
    pub fn alloc_tensor(&mut self, dtype: DType, ne: [usize; MAX_DIMS]) -> LlmResult<TensorId> {
        if ne[0] % dtype.block_elems() != 0 {
            return Err(LlmError::ShapeMismatch {
                op: "alloc_tensor",
                detail: format!(
                    "ne[0] = {} is not a multiple of the {}-element block",
                    ne[0],
                    dtype.block_elems()
                ),
            });
        }
        let mut desc = TensorDesc::leaf(dtype, ne);
        let len = desc.nbytes();
        let offset = self.alloc_bytes(len)?;
        desc.data = DataSlot::Range { offset, len };
        self.push_desc(desc)
    }

    pub fn desc(&self, id: TensorId) -> LlmResult<&TensorDesc> {
        self.table
            .get(id.index())
            .ok_or_else(|| LlmError::internal(format!("stale tensor id {}", id.0)))
    }

    pub fn desc_mut(&mut self, id: TensorId) -> LlmResult<&mut TensorDesc> {
        self.table
            .get_mut(id.index())
            .ok_or_else(|| LlmError::internal(format!("stale tensor id {}", id.0)))
    }

    /// Resolved data range of a materialized tensor
    pub fn range(&self, id: TensorId) -> LlmResult<(usize, usize)> {
        match self.desc(id)?.data {
            DataSlot::Range { offset, len } => Ok((offset, len)),
            _ => Err(LlmError::internal(format!(
                "tensor {} has no materialized data",
                id.0
            ))),
        }
    }

    /// Snapshot the cursor and table for a later [`Self::reset_to`]
    pub fn mark(&self) -> ArenaMark {
        ArenaMark {
            cursor: self.cursor,
            table_len: self.table.len(),
        }
    }

    /// Rewind to a snapshot taken earlier
    ///
    /// Callers must ensure no descriptor allocated after the mark remains
    /// reachable; stale ids afterwards resolve to an internal error, never
    /// to another tensor's bytes.
    pub fn reset_to(&mut self, mark: ArenaMark) {
        debug_assert!(mark.cursor <= self.cursor);
        debug_assert!(mark.table_len <= self.table.len());
        self.cursor = mark.cursor;
        self.table.truncate(mark.table_len);
    }

    /// Raw bytes of a materialized tensor
    pub fn bytes(&self, id: TensorId) -> LlmResult<&[u8]> {
        let (offset, len) = self.range(id)?;
        Ok(&self.slab.as_slice()[offset..offset + len])
    }

    /// Mutable raw bytes of a materialized tensor
    pub fn bytes_mut(&mut self, id: TensorId) -> LlmResult<&mut [u8]> {
        let (offset, len) = self.range(id)?;
        Ok(&mut self.slab.as_mut_slice()[offset..offset + len])
    }

    /// Copy bytes into the slab at an absolute offset
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> LlmResult<()> {
        let slab = self.slab.as_mut_slice();
        if offset + bytes.len() > slab.len() {
            return Err(LlmError::OutOfMemory {
                requested: bytes.len(),
                available: slab.len().saturating_sub(offset),
            });
        }
        slab[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// f32 view of a materialized tensor's dense bytes
    pub fn f32(&self, id: TensorId) -> LlmResult<&[f32]> {
        let bytes = self.bytes(id)?;
        Ok(cast_f32(bytes))
    }

    /// Mutable f32 view of a materialized tensor's dense bytes
    pub fn f32_mut(&mut self, id: TensorId) -> LlmResult<&mut [f32]> {
        let bytes = self.bytes_mut(id)?;
        Ok(cast_f32_mut(bytes))
    }

    /// Mutable i32 view of a materialized tensor's dense bytes
    pub fn i32_mut(&mut self, id: TensorId) -> LlmResult<&mut [i32]> {
        let bytes = self.bytes_mut(id)?;
        // SAFETY: allocations are 32-byte aligned and views keep 4-byte
        // alignment; the length is a multiple of 4 for i32 tensors.
        unsafe {
            Ok(std::slice::from_raw_parts_mut(
                bytes.as_mut_ptr() as *mut i32,
                bytes.len() / 4,
            ))
        }
    }

    /// Stable base pointer for kernel dispatch
    ///
    /// The slab never reallocates, so the pointer stays valid until the
    /// arena is dropped.
    pub(crate) fn base_ptr(&mut self) -> *mut u8 {
        self.slab.as_mut_slice().as_mut_ptr()
    }

    pub(crate) fn tensor_count(&self) -> usize {
        self.table.len()
    }
}

pub(crate) fn cast_f32(bytes: &[u8]) -> &[f32] {
    // SAFETY: arena ranges are 32-byte aligned, view offsets are multiples
    // of the element size, and f32 has no invalid bit patterns.
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, bytes.len() / 4) }
}

pub(crate) fn cast_f32_mut(bytes: &mut [u8]) -> &mut [f32] {
    // SAFETY: as in `cast_f32`; the caller holds the only mutable borrow.
    unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut f32, bytes.len() / 4) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_creation() {
        let arena = TensorArena::new(1024);
        assert_eq!(arena.capacity(), 1024);
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.remaining(), 1024);
    }

    #[test]
    fn test_alloc_alignment() {
        let mut arena = TensorArena::new(4096);
        let a = arena.alloc_bytes(10).unwrap();
        let b = arena.alloc_bytes(10).unwrap();
        assert_eq!(a % ARENA_ALIGNMENT, 0);
        assert_eq!(b % ARENA_ALIGNMENT, 0);
        assert!(b >= a + 10);
    }

    #[test]
    fn test_alloc_oom() {
        let mut arena = TensorArena::new(64);
        assert!(arena.alloc_bytes(32).is_ok());
        let err = arena.alloc_bytes(64).unwrap_err();
        assert!(matches!(err, LlmError::OutOfMemory { .. }));
    }

    #[test]
    fn test_alloc_tensor_and_access() {
        let mut arena = TensorArena::new(4096);
        let id = arena.alloc_tensor(DType::F32, [8, 2, 1, 1]).unwrap();

        let values = arena.f32_mut(id).unwrap();
        assert_eq!(values.len(), 16);
        values[0] = 3.5;
        values[15] = -1.0;

        let values = arena.f32(id).unwrap();
        assert_eq!(values[0], 3.5);
        assert_eq!(values[15], -1.0);
    }

    #[test]
    fn test_quantized_block_granularity() {
        let mut arena = TensorArena::new(4096);
        let err = arena.alloc_tensor(DType::Q4K, [100, 1, 1, 1]).unwrap_err();
        assert!(matches!(err, LlmError::ShapeMismatch { .. }));
        assert!(arena.alloc_tensor(DType::Q4K, [256, 1, 1, 1]).is_ok());
    }

    #[test]
    fn test_mark_reset() {
        let mut arena = TensorArena::new(4096);
        let keep = arena.alloc_tensor(DType::F32, [4, 1, 1, 1]).unwrap();
        let mark = arena.mark();

        let scratch = arena.alloc_tensor(DType::F32, [64, 1, 1, 1]).unwrap();
        assert!(arena.used() > 16);

        arena.reset_to(mark);
        assert!(arena.desc(keep).is_ok());
        assert!(arena.desc(scratch).is_err()); // stale id rejected
    }

    #[test]
    fn test_high_water_survives_reset() {
        let mut arena = TensorArena::new(4096);
        let mark = arena.mark();
        arena.alloc_bytes(1000).unwrap();
        arena.reset_to(mark);
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.high_water(), 1000);
    }

    #[test]
    fn test_node_limit() {
        let mut arena = TensorArena::new(1 << 20);
        for _ in 0..MAX_TENSORS {
            arena
                .push_desc(TensorDesc::leaf(DType::F32, [1, 1, 1, 1]))
                .unwrap();
        }
        let err = arena
            .push_desc(TensorDesc::leaf(DType::F32, [1, 1, 1, 1]))
            .unwrap_err();
        assert!(matches!(err, LlmError::NodeLimit { .. }));
    }

    #[test]
    fn test_external_region() {
        let mut backing = vec![0u8; 2048];
        // SAFETY: `backing` outlives the arena and nothing else touches it.
        let mut arena =
            unsafe { TensorArena::from_raw_region(backing.as_mut_ptr(), backing.len()) };
        let id = arena.alloc_tensor(DType::F32, [4, 1, 1, 1]).unwrap();
        arena.f32_mut(id).unwrap()[0] = 7.0;
        drop(arena);
        assert_eq!(f32::from_le_bytes(backing[0..4].try_into().unwrap()), 7.0);
    }
}
