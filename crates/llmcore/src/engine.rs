//! Inference Engine: Worker Thread and Control Surface
//!
//! # Overview
//!
//! The long-lived top-level value that owns everything: the model (moved
//! into a dedicated worker thread together with its inference state), the
//! request mailbox, and the metrics. Collaborators hold a handle to the
//! [`Engine`] instead of reaching through globals.
//!
//! ```text
//!  producers                 Engine                    worker thread
//!  ─────────   submit   ┌──────────────┐  wait/claim  ┌─────────────┐
//!  write ────────────▶  │   Mailbox    │ ───────────▶ │ InferState  │
//!  read  ◀────────────  │   Metrics    │ ◀─────────── │ generate()  │
//!  status/stats ◀─────  └──────────────┘   complete   └─────────────┘
//! ```
//!
//! Exactly one worker performs inference; the arena, KV cache, logits and
//! token buffers all live on its side of the mailbox. Producers only ever
//! touch the mailbox and the atomic counters.
//!
//! # Control Surface
//!
//! Three text endpoints for the host's pseudo-filesystem facade:
//! [`Engine::status_text`], [`Engine::stats_text`], and the prompt pair
//! [`Engine::submit_prompt`] / [`Engine::read_prompt`] (write submits,
//! read blocks up to five seconds while a request is in flight).

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::errors::{LlmError, LlmResult};
use crate::generate::{generate, GenerationConfig};
use crate::infer::InferState;
use crate::mailbox::Mailbox;
use crate::metrics::EngineMetrics;
use crate::model::{LoadConfig, Model};
use crate::tokenizer::TokenizerMode;

/// How long a prompt read blocks while a request is pending
pub const PROMPT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine configuration: model loading plus per-request generation
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub load: LoadConfig,
    pub generation: GenerationConfig,
}

/// Immutable facts about the loaded model, for the status endpoint
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub model_name: String,
    pub n_layer: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_head_kv: usize,
    pub n_ctx: usize,
    pub n_vocab: usize,
    pub weight_bytes: usize,
    pub arena_capacity: usize,
    pub tied_output: bool,
    pub fallback_tokenizer: bool,
    pub placeholder_count: usize,
}

/// Owns the worker thread, mailbox, and metrics for one loaded model
pub struct Engine {
    mailbox: Arc<Mailbox>,
    metrics: Arc<EngineMetrics>,
    info: EngineInfo,
    generation: GenerationConfig,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    /// Load a model file and spin up the worker
    pub fn load(path: &str, config: EngineConfig) -> LlmResult<Engine> {
        let model = Model::load_file(path, &config.load)?;
        Self::from_model(model, config)
    }

    /// Wrap an already-assembled model
    pub fn from_model(model: Model, config: EngineConfig) -> LlmResult<Engine> {
        let info = EngineInfo {
            model_name: model.hparams.name.clone(),
            n_layer: model.hparams.n_layer,
            n_embd: model.hparams.n_embd,
            n_head: model.hparams.n_head,
            n_head_kv: model.hparams.n_head_kv,
            n_ctx: model.hparams.n_ctx,
            n_vocab: model.hparams.n_vocab,
            weight_bytes: model.weight_bytes,
            arena_capacity: model.arena.capacity(),
            tied_output: model.tied_output(),
            fallback_tokenizer: model.tokenizer.mode() == TokenizerMode::Fallback,
            placeholder_count: model.placeholder_count,
        };

        let state = InferState::new(model)?;
        let mailbox = Arc::new(Mailbox::new());
        let metrics = Arc::new(EngineMetrics::new());
        let generation = config.generation;

        let worker = {
            let mailbox = Arc::clone(&mailbox);
            let metrics = Arc::clone(&metrics);
            thread::Builder::new()
                .name("llm-worker".to_string())
                .spawn(move || worker_loop(state, mailbox, metrics, generation))?
        };

        info!(model = %info.model_name, "engine started");
        Ok(Engine {
            mailbox,
            metrics,
            info,
            generation,
            worker: Some(worker),
        })
    }

    /// Prompt-endpoint write: strip one trailing newline, submit
    ///
    /// Returns `Busy` while a request is already in flight.
    pub fn submit_prompt(&self, raw: &str) -> LlmResult<()> {
        let prompt = raw.strip_suffix('\n').unwrap_or(raw);
        self.mailbox.submit(prompt)
    }

    /// Prompt-endpoint read: last response, a ready placeholder, or a
    /// still-processing notice after blocking up to five seconds
    pub fn read_prompt(&self) -> String {
        match self.mailbox.await_response(PROMPT_READ_TIMEOUT) {
            Ok(Some(response)) => response,
            Ok(None) => {
                "ready for prompt; write to this endpoint to run inference".to_string()
            }
            Err(LlmError::Timeout) => "still processing...".to_string(),
            Err(_) => "engine is shut down".to_string(),
        }
    }

    /// Block up to `timeout` for the in-flight response
    pub fn await_response(&self, timeout: Duration) -> LlmResult<Option<String>> {
        self.mailbox.await_response(timeout)
    }

    /// Status endpoint: human-readable engine and model state
    pub fn status_text(&self) -> String {
        let i = &self.info;
        let m = self.metrics.snapshot();
        let s = self.generation.sampling;
        let mut out = String::new();
        out.push_str("Inference Engine Status\n");
        out.push_str("=======================\n");
        out.push_str(&format!("Version: {}\n", env!("CARGO_PKG_VERSION")));
        out.push_str("Initialized: Yes\n");
        out.push_str(&format!(
            "Request Pending: {}\n",
            if self.mailbox.is_busy() { "Yes" } else { "No" }
        ));
        out.push_str("\nMemory:\n");
        out.push_str(&format!(
            "  Arena: {} / {} MB\n",
            m.arena_used / (1024 * 1024),
            i.arena_capacity / (1024 * 1024)
        ));
        out.push_str(&format!(
            "  Weights: {} MB\n",
            i.weight_bytes / (1024 * 1024)
        ));
        out.push_str("\nModel:\n");
        out.push_str(&format!("  Name: {}\n", i.model_name));
        out.push_str(&format!("  Layers: {}\n", i.n_layer));
        out.push_str(&format!("  Embedding: {}\n", i.n_embd));
        out.push_str(&format!(
            "  Heads: {} ({} kv)\n",
            i.n_head, i.n_head_kv
        ));
        out.push_str(&format!("  Context: {} tokens\n", i.n_ctx));
        out.push_str(&format!("  Vocabulary: {} tokens\n", i.n_vocab));
        if i.tied_output {
            out.push_str("  Output projection: tied to embedding\n");
        }
        if i.fallback_tokenizer {
            out.push_str("  Tokenizer: fallback word vocabulary\n");
        }
        if i.placeholder_count > 0 {
            out.push_str(&format!(
                "  Placeholder tensors: {} (bring-up mode)\n",
                i.placeholder_count
            ));
        }
        out.push_str("\nInference Ready: Yes\n");
        out.push_str(&format!("Temperature: {:.2}\n", s.temperature));
        out.push_str(&format!("Top-K: {}\n", s.top_k));
        out.push_str(&format!("Top-P: {:.2}\n", s.top_p));
        out
    }

    /// Stats endpoint: cumulative performance report
    pub fn stats_text(&self) -> String {
        let m = self.metrics.snapshot();
        let mut out = String::new();
        out.push_str("Performance Statistics\n");
        out.push_str("======================\n\n");
        out.push_str("Token Generation:\n");
        out.push_str(&format!("  Total Tokens Generated: {}\n", m.total_tokens));
        out.push_str(&format!(
            "  Total Inference Time: {} ms\n",
            m.total_inference_ms
        ));
        out.push_str(&format!("  Average Speed: {:.2} tokens/sec\n", m.avg_tps));
        out.push_str(&format!("  Current Speed: {} tokens/sec\n\n", m.current_tps));
        out.push_str("Cache Performance:\n");
        out.push_str(&format!("  Cache Hits: {}\n", m.cache_hits));
        out.push_str(&format!("  Cache Misses: {}\n", m.cache_misses));
        out.push_str(&format!(
            "  Hit Rate: {:.1}%\n\n",
            m.cache_hit_rate * 100.0
        ));
        out.push_str("Requests:\n");
        out.push_str(&format!("  Total Requests: {}\n", m.total_requests));
        out.push_str(&format!("  Failed Requests: {}\n\n", m.failed_requests));
        out.push_str("Memory:\n");
        out.push_str(&format!(
            "  Peak Usage: {} MB\n",
            m.peak_memory / (1024 * 1024)
        ));
        out
    }

    pub fn info(&self) -> &EngineInfo {
        &self.info
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Stop the worker, draining any pending request as cancelled
    pub fn shutdown(&mut self) {
        self.mailbox.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    mut state: InferState,
    mailbox: Arc<Mailbox>,
    metrics: Arc<EngineMetrics>,
    config: GenerationConfig,
) {
    while let Some(prompt) = mailbox.wait_for_request() {
        metrics.record_request();
        let start = Instant::now();

        match generate(&mut state, &prompt, &config) {
            Ok(out) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                metrics.record_generation(out.token_count, elapsed_ms.max(1));
                let kv = state.kv.stats();
                metrics.set_cache_counters(kv.hits, kv.misses);
                metrics.set_memory(
                    state.model.arena.used() as u64,
                    state.model.arena.high_water() as u64,
                );
                let response = if out.text.is_empty() {
                    "(no output)".to_string()
                } else {
                    out.text
                };
                mailbox.complete(response);
            }
            Err(err) => {
                error!(error = %err, "generation failed");
                metrics.record_failure();
                // Failures surface as a readable response, not a dead slot
                mailbox.complete(format!("error [{}]: {}", err.code(), err));
            }
        }
    }
    info!("worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::tiny_model_writer;

    fn tiny_engine() -> Engine {
        let bytes = tiny_model_writer(true).build();
        let model = Model::from_bytes(&bytes, &LoadConfig::default()).unwrap();
        let config = EngineConfig {
            load: LoadConfig::default(),
            generation: GenerationConfig {
                max_tokens: 8,
                stop_on_eos: false,
                ..GenerationConfig::greedy()
            },
        };
        Engine::from_model(model, config).unwrap()
    }

    #[test]
    fn test_submit_and_await_roundtrip() {
        let engine = tiny_engine();
        engine.submit_prompt("hello\n").unwrap();
        let response = engine
            .await_response(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert!(!response.is_empty());
        assert!(engine.metrics().snapshot().total_tokens >= 1);
    }

    #[test]
    fn test_busy_while_processing_or_idle_after() {
        let engine = tiny_engine();
        engine.submit_prompt("hello").unwrap();
        // A second submit either races into Busy or lands after completion
        match engine.submit_prompt("world") {
            Ok(()) | Err(LlmError::Busy) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
        let _ = engine.await_response(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_status_text_contents() {
        let engine = tiny_engine();
        let status = engine.status_text();
        assert!(status.contains("Initialized: Yes"));
        assert!(status.contains("Layers: 1"));
        assert!(status.contains("Context: 32 tokens"));
        assert!(status.contains("Temperature: 0.00"));
    }

    #[test]
    fn test_stats_text_counts_requests() {
        let engine = tiny_engine();
        engine.submit_prompt("hello").unwrap();
        let _ = engine.await_response(Duration::from_secs(5)).unwrap();
        let stats = engine.stats_text();
        assert!(stats.contains("Total Requests: 1"));
        assert!(stats.contains("Total Tokens Generated"));
    }

    #[test]
    fn test_read_prompt_idle_placeholder() {
        let engine = tiny_engine();
        let text = engine.read_prompt();
        assert!(text.contains("ready for prompt"));
    }

    #[test]
    fn test_shutdown_joins_worker() {
        let mut engine = tiny_engine();
        engine.shutdown();
        assert!(matches!(
            engine.submit_prompt("late").unwrap_err(),
            LlmError::Cancelled
        ));
    }
}
