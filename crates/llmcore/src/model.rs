//! Model Assembly: Hyper-Parameters and Named-Tensor Binding
//!
//! # Overview
//!
//! Turns a parsed GGUF file into a usable in-memory model: derives the
//! hyper-parameters from metadata, sizes and creates the tensor arena,
//! uploads every required weight into it at aligned offsets, and binds the
//! weights by name to the transformer structure.
//!
//! # Tensor Naming Convention
//!
//! ```text
//! token_embd.weight            token embedding      [d, V]
//! output_norm.weight           final norm gain      [d]
//! output.weight                output projection    [d, V]  (optional; tied to the embedding when absent)
//! blk.N.attn_norm.weight       attention norm gain  [d]
//! blk.N.attn_q.weight          query projection     [d, d]
//! blk.N.attn_k.weight          key projection       [d, d_kv]
//! blk.N.attn_v.weight          value projection     [d, d_kv]
//! blk.N.attn_output.weight     output projection    [d, d]
//! blk.N.ffn_norm.weight        ffn norm gain        [d]
//! blk.N.ffn_gate.weight        gate projection      [d, d_ff]
//! blk.N.ffn_up.weight          up projection        [d, d_ff]
//! blk.N.ffn_down.weight        down projection      [d_ff, d]
//! ```
//!
//! Unknown tensor names are permitted and ignored. A missing per-layer
//! tensor is fatal unless `allow_missing_tensors` is set, in which case a
//! zero-initialized placeholder of the expected shape is materialized so
//! the graph still evaluates — an explicit bring-up flag, never a silent
//! default.

use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use tracing::{info, warn};

use crate::arena::{ArenaMark, TensorArena, ARENA_ALIGNMENT};
use crate::errors::{LlmError, LlmResult};
use crate::gguf::GgufFile;
use crate::tensor::{DType, TensorId, MAX_DIMS};
use crate::tokenizer::Tokenizer;

/// The only architecture family the core implements
pub const ARCH_LLAMA: &str = "llama";

/// RMS-norm epsilon when metadata omits it
pub const DEFAULT_RMS_EPS: f32 = 1e-5;

/// Rotary base frequency when metadata omits it
pub const DEFAULT_ROPE_THETA: f32 = 10000.0;

/// Largest token batch a single forward pass evaluates
///
/// Prompts longer than this are chunked by the driver; the default arena
/// size is computed against it.
pub const MAX_BATCH: usize = 32;

/// Model hyper-parameters derived from metadata
#[derive(Debug, Clone)]
pub struct Hyperparams {
    pub name: String,
    pub architecture: String,
    pub n_vocab: usize,
    pub n_ctx: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_head_kv: usize,
    pub n_ff: usize,
    pub n_rot: usize,
    pub rope_theta: f32,
    pub rms_eps: f32,
}

impl Hyperparams {
    /// Derive hyper-parameters from the metadata directory
    ///
    /// `n_vocab` comes from the tokenizer token list when present and is
    /// otherwise patched from the embedding extent during assembly.
    pub fn from_gguf(file: &GgufFile) -> LlmResult<Self> {
        let architecture = file.get_str("general.architecture")?.to_string();
        if architecture != ARCH_LLAMA {
            return Err(LlmError::unsupported(format!(
                "architecture '{}' (only '{}' is implemented)",
                architecture, ARCH_LLAMA
            )));
        }
        let name = file
            .get("general.name")
            .and_then(|v| v.as_str())
            .unwrap_or("unnamed")
            .to_string();

        let n_ctx = file.get_usize("llama.context_length")?;
        let n_embd = file.get_usize("llama.embedding_length")?;
        let n_layer = file.get_usize("llama.block_count")?;
        let n_head = file.get_usize("llama.attention.head_count")?;
        let n_head_kv = file
            .get("llama.attention.head_count_kv")
            .and_then(|v| v.as_usize())
            .unwrap_or(n_head);
        let n_ff = file.get_usize("llama.feed_forward_length")?;
        let head_dim = if n_head > 0 { n_embd / n_head } else { 0 };
        let n_rot = file
            .get("llama.rope.dimension_count")
            .and_then(|v| v.as_usize())
            .unwrap_or(head_dim);
        let rope_theta = file
            .get("llama.rope.freq_base")
            .and_then(|v| v.as_f32())
            .unwrap_or(DEFAULT_ROPE_THETA);
        let rms_eps = file
            .get("llama.attention.layer_norm_rms_epsilon")
            .and_then(|v| v.as_f32())
            .unwrap_or(DEFAULT_RMS_EPS);

        let n_vocab = file
            .get("tokenizer.ggml.tokens")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);

        let hp = Hyperparams {
            name,
            architecture,
            n_vocab,
            n_ctx,
            n_embd,
            n_layer,
            n_head,
            n_head_kv,
            n_ff,
            n_rot,
            rope_theta,
            rms_eps,
        };
        hp.validate()?;
        Ok(hp)
    }

    /// Internal consistency checks; fatal to model load on failure
    pub fn validate(&self) -> LlmResult<()> {
        if self.n_layer == 0 || self.n_head == 0 || self.n_embd == 0 || self.n_ctx == 0 {
            return Err(LlmError::bad_format(format!(
                "degenerate hyper-parameters: layers={} heads={} embd={} ctx={}",
                self.n_layer, self.n_head, self.n_embd, self.n_ctx
            )));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(LlmError::bad_format(format!(
                "embedding {} not divisible by head count {}",
                self.n_embd, self.n_head
            )));
        }
        if self.n_head_kv == 0 || self.n_head % self.n_head_kv != 0 {
            return Err(LlmError::bad_format(format!(
                "head count {} not divisible by kv head count {}",
                self.n_head, self.n_head_kv
            )));
        }
        if self.n_rot > self.head_dim() || self.n_rot % 2 != 0 {
            return Err(LlmError::bad_format(format!(
                "rotary dimension {} does not fit head dimension {}",
                self.n_rot,
                self.head_dim()
            )));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Key/value width: `H_kv * d_head`
    pub fn n_embd_kv(&self) -> usize {
        self.n_head_kv * self.head_dim()
    }
}

/// Weight ids for one transformer block
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub attn_norm: TensorId,
    pub attn_q: TensorId,
    pub attn_k: TensorId,
    pub attn_v: TensorId,
    pub attn_output: TensorId,
    pub ffn_norm: TensorId,
    pub ffn_gate: TensorId,
    pub ffn_up: TensorId,
    pub ffn_down: TensorId,
}

/// Load-time configuration
#[derive(Debug, Clone, Default)]
pub struct LoadConfig {
    /// Arena slab size; computed from the model when `None`
    pub arena_size: Option<usize>,
    /// Materialize zero placeholders for missing per-layer tensors
    /// (incremental bring-up aid)
    pub allow_missing_tensors: bool,
    /// Clamp the context length below the model's maximum
    pub context_length: Option<usize>,
}

/// An assembled model: weights resident in the arena, bound by role
#[derive(Debug)]
pub struct Model {
    pub hparams: Hyperparams,
    pub arena: TensorArena,
    pub tok_embd: TensorId,
    pub output_norm: TensorId,
    /// Output projection; equals `tok_embd` when the weights are tied
    pub output: TensorId,
    pub layers: Vec<LayerWeights>,
    pub tokenizer: Tokenizer,
    /// Snapshot taken after the weight region; the KV cache and graph grow
    /// past it
    pub weight_mark: ArenaMark,
    /// Bytes occupied by weights alone
    pub weight_bytes: usize,
    /// Count of placeholder tensors materialized for missing weights
    pub placeholder_count: usize,
}

impl Model {
    /// Memory-map a GGUF file and assemble the model
    pub fn load_file(path: impl AsRef<Path>, config: &LoadConfig) -> LlmResult<Model> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and dropped before this function
        // returns; the source file is expected not to be truncated while
        // loading.
        let mmap = unsafe { Mmap::map(&file)? };
        info!(path = %path.display(), bytes = mmap.len(), "loading model");
        Self::from_bytes(&mmap, config)
    }

    /// Assemble a model from an in-memory GGUF image
    pub fn from_bytes(data: &[u8], config: &LoadConfig) -> LlmResult<Model> {
        let file = GgufFile::parse(data)?;
        let mut hparams = Hyperparams::from_gguf(&file)?;
        if let Some(ctx) = config.context_length {
            hparams.n_ctx = hparams.n_ctx.min(ctx);
        }

        if hparams.n_vocab == 0 {
            // No tokenizer metadata: take the vocabulary extent from the
            // embedding tensor
            let embd = file
                .find_tensor("token_embd.weight")
                .ok_or_else(|| LlmError::TensorNotFound {
                    name: "token_embd.weight".to_string(),
                })?;
            hparams.n_vocab = embd.ne[1];
        }

        let arena_size = config
            .arena_size
            .unwrap_or_else(|| default_arena_size(&hparams, &file, data.len()));
        let mut arena = TensorArena::new(arena_size);

        let mut assembler = Assembler {
            file: &file,
            data,
            arena: &mut arena,
            hparams: &hparams,
            allow_missing: config.allow_missing_tensors,
            weight_bytes: 0,
            placeholder_count: 0,
        };

        let d = hparams.n_embd;
        let d_kv = hparams.n_embd_kv();
        let d_ff = hparams.n_ff;
        let v = hparams.n_vocab;

        // The token embedding is the one tensor with no fallback
        let tok_embd = assembler.require("token_embd.weight", [d, v, 1, 1])?;
        let output_norm = assembler.bind("output_norm.weight", [d, 1, 1, 1])?;
        let output = match assembler.try_bind("output.weight", [d, v, 1, 1])? {
            Some(id) => id,
            None => {
                info!("output.weight absent, tying output projection to the embedding");
                tok_embd
            }
        };

        let mut layers = Vec::with_capacity(hparams.n_layer);
        for l in 0..hparams.n_layer {
            layers.push(LayerWeights {
                attn_norm: assembler.bind(&format!("blk.{}.attn_norm.weight", l), [d, 1, 1, 1])?,
                attn_q: assembler.bind(&format!("blk.{}.attn_q.weight", l), [d, d, 1, 1])?,
                attn_k: assembler.bind(&format!("blk.{}.attn_k.weight", l), [d, d_kv, 1, 1])?,
                attn_v: assembler.bind(&format!("blk.{}.attn_v.weight", l), [d, d_kv, 1, 1])?,
                attn_output: assembler
                    .bind(&format!("blk.{}.attn_output.weight", l), [d, d, 1, 1])?,
                ffn_norm: assembler.bind(&format!("blk.{}.ffn_norm.weight", l), [d, 1, 1, 1])?,
                ffn_gate: assembler.bind(&format!("blk.{}.ffn_gate.weight", l), [d, d_ff, 1, 1])?,
                ffn_up: assembler.bind(&format!("blk.{}.ffn_up.weight", l), [d, d_ff, 1, 1])?,
                ffn_down: assembler.bind(&format!("blk.{}.ffn_down.weight", l), [d_ff, d, 1, 1])?,
            });
        }

        let weight_bytes = assembler.weight_bytes;
        let placeholder_count = assembler.placeholder_count;
        if placeholder_count > 0 {
            warn!(
                placeholders = placeholder_count,
                "model assembled with zero-filled placeholder tensors"
            );
        }

        let tokenizer = Tokenizer::from_gguf(&file)?;
        let weight_mark = arena.mark();

        info!(
            name = %hparams.name,
            layers = hparams.n_layer,
            n_embd = hparams.n_embd,
            heads = hparams.n_head,
            kv_heads = hparams.n_head_kv,
            ctx = hparams.n_ctx,
            vocab = hparams.n_vocab,
            weight_mb = weight_bytes / (1024 * 1024),
            "model assembled"
        );

        Ok(Model {
            hparams,
            arena,
            tok_embd,
            output_norm,
            output,
            layers,
            tokenizer,
            weight_mark,
            weight_bytes,
            placeholder_count,
        })
    }

    /// Whether the output projection shares the embedding tensor
    pub fn tied_output(&self) -> bool {
        self.output == self.tok_embd
    }
}

struct Assembler<'a> {
    file: &'a GgufFile,
    data: &'a [u8],
    arena: &'a mut TensorArena,
    hparams: &'a Hyperparams,
    allow_missing: bool,
    weight_bytes: usize,
    placeholder_count: usize,
}

impl<'a> Assembler<'a> {
    /// Bind a tensor that must exist regardless of configuration
    fn require(&mut self, name: &str, expected_ne: [usize; MAX_DIMS]) -> LlmResult<TensorId> {
        match self.upload(name, expected_ne)? {
            Some(id) => Ok(id),
            None => Err(LlmError::TensorNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Bind a tensor, materializing a placeholder when permitted
    fn bind(&mut self, name: &str, expected_ne: [usize; MAX_DIMS]) -> LlmResult<TensorId> {
        if let Some(id) = self.upload(name, expected_ne)? {
            return Ok(id);
        }
        if !self.allow_missing {
            return Err(LlmError::TensorNotFound {
                name: name.to_string(),
            });
        }
        warn!(tensor = name, "missing, materializing zero placeholder");
        self.placeholder_count += 1;
        let id = self.arena.alloc_tensor(DType::F32, expected_ne)?;
        self.weight_bytes += self.arena.desc(id)?.nbytes();
        // Owned slabs are zero-initialized; adopted regions are not
        self.arena.bytes_mut(id)?.fill(0);
        Ok(id)
    }

    /// Bind a tensor that may legitimately be absent (tied weights)
    fn try_bind(
        &mut self,
        name: &str,
        expected_ne: [usize; MAX_DIMS],
    ) -> LlmResult<Option<TensorId>> {
        self.upload(name, expected_ne)
    }

    /// Copy a named tensor's bytes from the file into the arena
    fn upload(&mut self, name: &str, expected_ne: [usize; MAX_DIMS]) -> LlmResult<Option<TensorId>> {
        let info = match self.file.find_tensor(name) {
            Some(info) => info,
            None => return Ok(None),
        };
        if info.ne != expected_ne {
            return Err(LlmError::bad_format(format!(
                "tensor '{}' has shape {:?}, expected {:?} for {}",
                name, info.ne, expected_ne, self.hparams.name
            )));
        }
        let dtype = info.dtype()?;
        match dtype {
            DType::F32 | DType::F16 | DType::Q4K => {}
            other => {
                return Err(LlmError::unsupported(format!(
                    "tensor '{}' uses dtype {:?}",
                    name, other
                )))
            }
        }
        let (start, end) = self.file.tensor_data_range(info, self.data.len())?;
        let id = self.arena.alloc_tensor(dtype, info.ne)?;
        let (offset, len) = self.arena.range(id)?;
        debug_assert_eq!(len, end - start);
        self.arena.write_at(offset, &self.data[start..end])?;
        self.weight_bytes += len;
        Ok(Some(id))
    }
}

/// Size the arena for weights, KV cache, and per-pass graph data
fn default_arena_size(hp: &Hyperparams, file: &GgufFile, file_len: usize) -> usize {
    // Weights: sum of declared tensor sizes, padded per-tensor for alignment
    let weights: usize = file
        .tensors
        .iter()
        .map(|t| t.byte_size().unwrap_or(0) + ARENA_ALIGNMENT)
        .sum::<usize>()
        .min(file_len);

    let kv = 2 * hp.n_layer * hp.n_embd_kv() * hp.n_ctx * 4;

    // Per-pass graph estimate at the batch cap: activations plus attention
    // scores, doubled for slack
    let t = MAX_BATCH.min(hp.n_ctx);
    let per_layer = 4 * t * (8 * hp.n_embd + 2 * hp.n_embd_kv() + 4 * hp.n_ff)
        + 12 * hp.n_ctx * t * hp.n_head;
    let graph = 2 * (hp.n_layer * per_layer + 8 * hp.n_vocab * t) + (4 << 20);

    weights + kv + graph
}
