//! CPU Inference Core for GGUF-Quantized LLaMA-Family Models
//!
//! # Overview
//!
//! Loads a transformer language model from a GGUF file, holds its weights
//! in one contiguous arena, and answers prompts by running autoregressive
//! token generation on the host CPU — no external inference library
//! involved. The canonical target is a decoder-only LLaMA-style model:
//! rotary position embeddings, RMS-norm sublayers, grouped-query
//! attention, and a SwiGLU feed-forward block, with 4-bit K-quant
//! weights.
//!
//! # Architecture
//!
//! ```text
//! prompt ─▶ Mailbox ─▶ worker ─▶ Tokenizer ─▶ InferState::eval ─┐
//!                                                              │
//!    ┌────────────── per step ─────────────────────────────────┘
//!    ▼
//!  graph builder ─▶ arena nodes over loaded weights ─▶ executor
//!    │                  (Q4_K decoded on demand)          │
//!    └◀─────────── sample next token from logits ◀────────┘
//! ```
//!
//! The building blocks, leaves first:
//!
//! - [`arena`]: bump-allocated slab for tensor descriptors and data
//! - [`tensor`]: dtypes, shapes, strides, op-node metadata
//! - [`quantize`]: K-quant block decoding and FP16 conversion
//! - [`gguf`]: model-file parser and directory writer
//! - [`ops`] / [`graph`]: kernels, graph builder, and executor
//! - [`model`]: hyper-parameter derivation and named-tensor binding
//! - [`kv_cache`], [`infer`], [`sampling`], [`generate`]: the driver
//! - [`tokenizer`]: vocabulary lookup with a fallback mode
//! - [`mailbox`], [`metrics`], [`engine`]: request handoff and the
//!   long-lived engine with its text control surface
//!
//! # Example
//!
//! ```no_run
//! use llmcore::engine::{Engine, EngineConfig};
//!
//! let engine = Engine::load("/models/tiny.gguf", EngineConfig::default())?;
//! engine.submit_prompt("What is a mutex?")?;
//! let answer = engine.read_prompt();
//! println!("{answer}");
//! # Ok::<(), llmcore::LlmError>(())
//! ```

pub mod arena;
pub mod engine;
pub mod errors;
pub mod generate;
pub mod gguf;
pub mod graph;
pub mod infer;
pub mod kv_cache;
pub mod mailbox;
pub mod metrics;
pub mod model;
pub mod ops;
pub mod quantize;
pub mod sampling;
pub mod tensor;
pub mod tokenizer;

pub use engine::{Engine, EngineConfig};
pub use errors::{LlmError, LlmResult};
pub use generate::{generate, GenerationConfig};
pub use infer::InferState;
pub use model::{LoadConfig, Model};
pub use sampling::SamplingParams;

#[cfg(test)]
mod tests;
