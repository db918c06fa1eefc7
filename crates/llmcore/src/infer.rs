//! Inference Driver: Forward Pass and State
//!
//! # Overview
//!
//! Owns everything one generation needs: the model, the KV cache, the
//! token buffer, `n_past`, and the logits buffer. Each call to
//! [`InferState::eval`] materializes a fresh computation graph for the
//! batch — embedding lookup, `L` transformer blocks of grouped-query
//! attention plus SwiGLU feed-forward, final norm, and the vocabulary
//! projection — executes it, and copies the last position's logits out.
//!
//! # Per-Block Data Flow
//!
//! ```text
//! x ──rms_norm──mul(g_attn)──┬─W_q──rope──┐
//!                            ├─W_k──rope──┼── append to KV cache
//!                            └─W_v────────┘
//!     scores = K_all^T Q / sqrt(d_head)  (per head, kv-heads broadcast)
//!     probs  = softmax(causal_mask(scores))
//!     ctx    = V_all probs ── merge heads ── W_o
//! x ── + ctx ──rms_norm──mul(g_ffn)── silu(W_gate) * W_up ── W_down ── + ──▶
//! ```
//!
//! Attention runs per head through stride views over the cache; query
//! heads within a group share the K/V head (`kv_head = h * H_kv / H`).
//!
//! # Memory Discipline
//!
//! The arena is rewound to the post-weights/post-cache mark at the start
//! of every batch, so graph nodes never accumulate across steps. Prompts
//! longer than [`MAX_BATCH`](crate::model::MAX_BATCH) are evaluated in
//! chunks to bound per-pass memory.

use crate::arena::ArenaMark;
use crate::errors::{LlmError, LlmResult};
use crate::graph::{self, Executor};
use crate::kv_cache::KvCache;
use crate::model::{Model, MAX_BATCH};
use crate::tensor::{DType, RopeMode, TensorId};
use crate::tokenizer::TokenId;

/// Inference state bound to one model
pub struct InferState {
    pub model: Model,
    pub kv: KvCache,
    /// Positions already consumed this generation
    pub n_past: usize,
    /// Logits of the most recently evaluated position, `n_vocab` wide
    pub logits: Vec<f32>,
    /// Tokens consumed or produced this generation
    pub tokens: Vec<TokenId>,
    gen_mark: ArenaMark,
    exec: Executor,
}

impl InferState {
    /// Wrap a model, allocating the KV cache after its weight region
    pub fn new(mut model: Model) -> LlmResult<InferState> {
        let hp = &model.hparams;
        let (n_layer, n_ctx, d_kv, n_vocab) = (hp.n_layer, hp.n_ctx, hp.n_embd_kv(), hp.n_vocab);
        let rope_theta = hp.rope_theta;

        let kv = KvCache::new(&mut model.arena, n_layer, n_ctx, d_kv)?;
        let gen_mark = model.arena.mark();
        let mut exec = Executor::new();
        exec.rope_theta = rope_theta;

        Ok(InferState {
            model,
            kv,
            n_past: 0,
            logits: vec![0.0; n_vocab],
            tokens: Vec::new(),
            gen_mark,
            exec,
        })
    }

    /// Start a new generation: empty cache, empty token buffer, rewound
    /// arena
    pub fn reset(&mut self) {
        self.kv.reset();
        self.n_past = 0;
        self.tokens.clear();
        self.model.arena.reset_to(self.gen_mark);
    }

    /// Evaluate input tokens, leaving the last position's logits in
    /// [`Self::logits`]
    ///
    /// Fails with `ContextOverflow` before touching the cache when the
    /// batch does not fit.
    pub fn eval(&mut self, input: &[TokenId]) -> LlmResult<()> {
        if input.is_empty() {
            return Ok(());
        }
        if !self.kv.can_fit(input.len()) {
            return Err(LlmError::ContextOverflow {
                needed: self.n_past + input.len(),
                capacity: self.kv.capacity(),
            });
        }
        for chunk in input.chunks(MAX_BATCH) {
            self.eval_batch(chunk)?;
        }
        Ok(())
    }

    fn eval_batch(&mut self, input: &[TokenId]) -> LlmResult<()> {
        let t = input.len();
        let hp = self.model.hparams.clone();
        let (d, dh, n_head, n_head_kv) = (hp.n_embd, hp.head_dim(), hp.n_head, hp.n_head_kv);
        let d_kv = hp.n_embd_kv();
        let c_max = hp.n_ctx;
        let n_past = self.n_past;
        let n = n_past + t;

        let layers = self.model.layers.clone();
        let (tok_embd, output_norm, output_w) =
            (self.model.tok_embd, self.model.output_norm, self.model.output);

        self.model.arena.reset_to(self.gen_mark);
        let arena = &mut self.model.arena;

        // Input ids as an i32 column
        let inp = arena.alloc_tensor(DType::I32, [t, 1, 1, 1])?;
        {
            let ids = arena.i32_mut(inp)?;
            for (i, &tok) in input.iter().enumerate() {
                ids[i] = tok as i32;
            }
        }

        let mut roots: Vec<TensorId> = Vec::with_capacity(2 * hp.n_layer + 1);
        let mut x = graph::get_rows(arena, tok_embd, inp)?;

        for (l, layer) in layers.iter().enumerate() {
            // Attention sublayer
            let norm = graph::rms_norm(arena, x, hp.rms_eps)?;
            let h = graph::mul(arena, norm, layer.attn_norm)?;

            let q = graph::mul_mat(arena, layer.attn_q, h)?;
            let k = graph::mul_mat(arena, layer.attn_k, h)?;
            let vcur = graph::mul_mat(arena, layer.attn_v, h)?;

            let q3 = graph::reshape(arena, q, [dh, n_head, t, 1])?;
            let q3 = graph::rope(arena, q3, n_past as i32, hp.n_rot, RopeMode::Interleaved)?;
            let k3 = graph::reshape(arena, k, [dh, n_head_kv, t, 1])?;
            let k3 = graph::rope(arena, k3, n_past as i32, hp.n_rot, RopeMode::Interleaved)?;

            // Append this batch's keys and values at columns
            // [n_past, n_past + t)
            let k_cache = self.kv.k(l);
            let v_cache = self.kv.v(l);

            let k_flat = graph::reshape(arena, k3, [d_kv, t, 1, 1])?;
            let k_dst = graph::view(
                arena,
                k_cache,
                [d_kv, t, 1, 1],
                [4, d_kv * 4, d_kv * t * 4, d_kv * t * 4],
                n_past * d_kv * 4,
            )?;
            roots.push(graph::copy_to(arena, k_flat, k_dst)?);

            // V lands transposed: lane j of position p at (j * C_max + p)
            let v_dst = graph::view(
                arena,
                v_cache,
                [d_kv, t, 1, 1],
                [c_max * 4, 4, t * 4, t * 4],
                n_past * 4,
            )?;
            roots.push(graph::copy_to(arena, vcur, v_dst)?);

            // Attention over the whole prefix through cache views
            let k_all = graph::view(
                arena,
                k_cache,
                [dh, n, n_head_kv, 1],
                [4, d_kv * 4, dh * 4, d_kv * c_max * 4],
                0,
            )?;
            let q_perm = graph::permute(arena, q3, [0, 2, 1, 3])?;
            let mut kq = graph::mul_mat(arena, k_all, q_perm)?;
            kq = graph::scale(arena, kq, 1.0 / (dh as f32).sqrt())?;
            kq = graph::causal_mask(arena, kq, n_past as i32)?;
            kq = graph::soft_max(arena, kq)?;

            let v_all = graph::view(
                arena,
                v_cache,
                [n, dh, n_head_kv, 1],
                [4, c_max * 4, dh * c_max * 4, d_kv * c_max * 4],
                0,
            )?;
            let kqv = graph::mul_mat(arena, v_all, kq)?;
            let merged = graph::permute(arena, kqv, [0, 2, 1, 3])?;
            let merged = graph::cont(arena, merged)?;
            let ctx = graph::reshape(arena, merged, [d, t, 1, 1])?;

            let attn_out = graph::mul_mat(arena, layer.attn_output, ctx)?;
            x = graph::add(arena, x, attn_out)?;

            // Feed-forward sublayer (SwiGLU)
            let norm2 = graph::rms_norm(arena, x, hp.rms_eps)?;
            let h2 = graph::mul(arena, norm2, layer.ffn_norm)?;
            let gate = graph::mul_mat(arena, layer.ffn_gate, h2)?;
            let gate = graph::silu(arena, gate)?;
            let up = graph::mul_mat(arena, layer.ffn_up, h2)?;
            let act = graph::mul(arena, gate, up)?;
            let ffn_out = graph::mul_mat(arena, layer.ffn_down, act)?;
            x = graph::add(arena, x, ffn_out)?;
        }

        // Final norm and vocabulary projection
        let norm = graph::rms_norm(arena, x, hp.rms_eps)?;
        let normed = graph::mul(arena, norm, output_norm)?;
        let logits_node = graph::mul_mat(arena, output_w, normed)?;
        roots.push(logits_node);

        self.kv.record_lookup();
        self.exec.execute(arena, &roots)?;

        // Keep the last position's row
        let all_logits = arena.f32(logits_node)?;
        let v = hp.n_vocab;
        self.logits.copy_from_slice(&all_logits[(t - 1) * v..t * v]);

        self.kv.advance(t);
        self.n_past += t;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::tiny_model_writer;
    use crate::model::LoadConfig;

    fn tiny_state() -> InferState {
        let bytes = tiny_model_writer(true).build();
        let model = Model::from_bytes(&bytes, &LoadConfig::default()).unwrap();
        InferState::new(model).unwrap()
    }

    #[test]
    fn test_eval_produces_finite_logits() {
        let mut state = tiny_state();
        state.eval(&[1, 5, 9]).unwrap();
        assert_eq!(state.n_past, 3);
        assert_eq!(state.logits.len(), 16);
        assert!(state.logits.iter().all(|v| v.is_finite()));
        // A nontrivial model does not emit a constant row
        let first = state.logits[0];
        assert!(state.logits.iter().any(|&v| (v - first).abs() > 1e-9));
    }

    #[test]
    fn test_incremental_eval_matches_one_shot() {
        // The cache plus causal mask must make [a,b,c] in one pass agree
        // with [a,b] then [c]
        let mut one_shot = tiny_state();
        one_shot.eval(&[1, 5, 9]).unwrap();

        let mut incremental = tiny_state();
        incremental.eval(&[1, 5]).unwrap();
        incremental.eval(&[9]).unwrap();

        assert_eq!(one_shot.n_past, incremental.n_past);
        for (a, b) in one_shot.logits.iter().zip(&incremental.logits) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_n_past_tracks_cache_fill() {
        let mut state = tiny_state();
        state.eval(&[1, 2]).unwrap();
        assert_eq!(state.n_past, 2);
        assert_eq!(state.kv.fill(), 2);
        state.eval(&[3]).unwrap();
        assert_eq!(state.n_past, 3);
        assert_eq!(state.kv.fill(), 3);
    }

    #[test]
    fn test_context_overflow_rejected_before_cache_write() {
        let mut state = tiny_state(); // n_ctx = 32
        let long: Vec<TokenId> = (0..33).map(|i| i % 16).collect();
        let err = state.eval(&long).unwrap_err();
        assert!(matches!(err, LlmError::ContextOverflow { .. }));
        assert_eq!(state.n_past, 0);
        assert_eq!(state.kv.fill(), 0);
    }

    #[test]
    fn test_reset_allows_fresh_generation() {
        let mut state = tiny_state();
        state.eval(&[1, 2, 3]).unwrap();
        let logits_a = state.logits.clone();

        state.reset();
        assert_eq!(state.n_past, 0);
        state.eval(&[1, 2, 3]).unwrap();
        assert_eq!(logits_a, state.logits);
    }

    #[test]
    fn test_deterministic_across_states() {
        let mut a = tiny_state();
        let mut b = tiny_state();
        a.eval(&[4, 7]).unwrap();
        b.eval(&[4, 7]).unwrap();
        assert_eq!(a.logits, b.logits);
    }
}
