//! Key-Value Cache for Transformer Attention
//!
//! # Overview
//!
//! Stores the post-rotary key and value projections of previously
//! processed positions so autoregressive generation recomputes nothing:
//! each step appends one column per layer and attends over the whole
//! prefix. Without the cache every step would recompute K and V for the
//! entire sequence, turning O(N) generation into O(N^2).
//!
//! # Memory Layout
//!
//! Per-layer tensors inside the model arena, allocated once with the
//! inference state and reused across generations:
//!
//! ```text
//! K[layer]: [d_kv, C_max]   column p holds all kv-heads of position p
//! V[layer]: [C_max, d_kv]   transposed, so the context gather contracts
//!                           over positions with unit stride
//! ```
//!
//! # Invariants
//!
//! The fill count `n` grows monotonically within a generation and resets
//! atomically between generations. For every layer and position `p < n`,
//! the cache holds the post-rotary projections of the token at `p`.

use crate::arena::TensorArena;
use crate::errors::LlmResult;
use crate::tensor::{DType, TensorId};

/// Per-layer cache tensors plus the shared fill count
pub struct KvCache {
    k: Vec<TensorId>,
    v: Vec<TensorId>,
    n_layer: usize,
    n_ctx: usize,
    d_kv: usize,
    /// Positions currently resident; equals the driver's `n_past`
    n: usize,
    hits: u64,
    misses: u64,
}

impl KvCache {
    /// Allocate cache tensors in the arena (zero-filled slab)
    pub fn new(
        arena: &mut TensorArena,
        n_layer: usize,
        n_ctx: usize,
        d_kv: usize,
    ) -> LlmResult<KvCache> {
        let mut k = Vec::with_capacity(n_layer);
        let mut v = Vec::with_capacity(n_layer);
        for _ in 0..n_layer {
            k.push(arena.alloc_tensor(DType::F32, [d_kv, n_ctx, 1, 1])?);
            v.push(arena.alloc_tensor(DType::F32, [n_ctx, d_kv, 1, 1])?);
        }
        Ok(KvCache {
            k,
            v,
            n_layer,
            n_ctx,
            d_kv,
            n: 0,
            hits: 0,
            misses: 0,
        })
    }

    /// Key tensor of a layer, `[d_kv, C_max]`
    pub fn k(&self, layer: usize) -> TensorId {
        self.k[layer]
    }

    /// Value tensor of a layer, stored transposed `[C_max, d_kv]`
    pub fn v(&self, layer: usize) -> TensorId {
        self.v[layer]
    }

    /// Number of resident positions
    pub fn fill(&self) -> usize {
        self.n
    }

    pub fn capacity(&self) -> usize {
        self.n_ctx
    }

    pub fn can_fit(&self, extra: usize) -> bool {
        self.n + extra <= self.n_ctx
    }

    /// Advance the fill count after all layers appended `t` positions
    pub fn advance(&mut self, t: usize) {
        debug_assert!(self.n + t <= self.n_ctx);
        self.n += t;
    }

    /// Record a prefix lookup; a non-empty prefix is a hit
    pub fn record_lookup(&mut self) {
        if self.n > 0 {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }

    /// Start a new generation
    ///
    /// The fill count resets; stale columns are overwritten as positions
    /// are refilled, so the backing bytes are left as they are.
    pub fn reset(&mut self) {
        self.n = 0;
    }

    pub fn memory_bytes(&self) -> usize {
        2 * self.n_layer * self.n_ctx * self.d_kv * 4
    }

    pub fn stats(&self) -> KvCacheStats {
        KvCacheStats {
            n_layer: self.n_layer,
            n_ctx: self.n_ctx,
            d_kv: self.d_kv,
            fill: self.n,
            hits: self.hits,
            misses: self.misses,
            hit_rate: if self.hits + self.misses > 0 {
                self.hits as f32 / (self.hits + self.misses) as f32
            } else {
                0.0
            },
            memory_bytes: self.memory_bytes(),
        }
    }
}

/// Cache statistics for the stats endpoint
#[derive(Debug, Clone, Copy)]
pub struct KvCacheStats {
    pub n_layer: usize,
    pub n_ctx: usize,
    pub d_kv: usize,
    pub fill: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f32,
    pub memory_bytes: usize,
}
