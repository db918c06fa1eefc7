//! Autoregressive Text Generation
//!
//! # Overview
//!
//! The generation loop over an [`InferState`]: reset the state, tokenize
//! the prompt with BOS, evaluate it in one shot, then repeatedly sample a
//! token, stop on EOS or budget, and evaluate the single new token with
//! `n_past` advanced. Collected tokens are detokenized into the output.
//!
//! ```text
//! 1. Tokenize prompt: "Hello" -> [1, 3]
//! 2. Evaluate the prompt batch
//! 3. Loop up to max_tokens:
//!    a. sample next token from the logits
//!    b. stop on EOS or when the character budget fills
//!    c. evaluate the new token
//! 4. Detokenize the generated ids
//! ```
//!
//! The context budget is checked before any cache write: a request whose
//! prompt plus `max_tokens` cannot fit the context window fails with
//! `ContextOverflow` up front rather than mid-generation.

use tracing::debug;

use crate::errors::{LlmError, LlmResult};
use crate::infer::InferState;
use crate::sampling::{Sampler, SamplingParams};
use crate::tokenizer::TokenId;

/// Generation configuration
#[derive(Debug, Clone, Copy)]
pub struct GenerationConfig {
    /// Upper bound on generated tokens
    pub max_tokens: usize,
    /// Upper bound on generated characters
    pub max_chars: usize,
    pub sampling: SamplingParams,
    /// Stop at the vocabulary's EOS id
    pub stop_on_eos: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            max_tokens: 64,
            max_chars: 1024,
            sampling: SamplingParams::greedy(),
            stop_on_eos: true,
        }
    }
}

impl GenerationConfig {
    pub fn greedy() -> Self {
        Self::default()
    }

    pub fn sampled(params: SamplingParams) -> Self {
        GenerationConfig {
            sampling: params,
            ..Self::default()
        }
    }
}

/// Why a generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Eos,
    TokenBudget,
    CharBudget,
}

/// A finished generation
#[derive(Debug, Clone)]
pub struct Generated {
    pub text: String,
    pub token_count: usize,
    pub finish: FinishReason,
}

/// Run a full generation for `prompt`
pub fn generate(
    state: &mut InferState,
    prompt: &str,
    config: &GenerationConfig,
) -> LlmResult<Generated> {
    generate_stream(state, prompt, config, |_| {})
}

/// Run a generation, handing each decoded piece to `on_piece` as it lands
pub fn generate_stream(
    state: &mut InferState,
    prompt: &str,
    config: &GenerationConfig,
    mut on_piece: impl FnMut(&str),
) -> LlmResult<Generated> {
    state.reset();

    let prompt_ids = state.model.tokenizer.tokenize(prompt, true);
    if prompt_ids.is_empty() {
        return Err(LlmError::TokenizationFailed {
            reason: "empty prompt".to_string(),
        });
    }

    // Pre-flight context budget: never start a generation the cache
    // cannot finish
    let n_ctx = state.model.hparams.n_ctx;
    if prompt_ids.len() + config.max_tokens > n_ctx {
        return Err(LlmError::ContextOverflow {
            needed: prompt_ids.len() + config.max_tokens,
            capacity: n_ctx,
        });
    }

    debug!(prompt_tokens = prompt_ids.len(), "evaluating prompt");
    state.eval(&prompt_ids)?;
    state.tokens.extend_from_slice(&prompt_ids);

    let eos = state.model.tokenizer.eos_id();
    let mut sampler = Sampler::new(config.sampling);
    let mut generated: Vec<TokenId> = Vec::new();
    let mut text = String::new();
    let mut finish = FinishReason::TokenBudget;

    for _ in 0..config.max_tokens {
        let next = sampler.sample(&state.logits) as TokenId;

        if config.stop_on_eos && next == eos {
            finish = FinishReason::Eos;
            break;
        }

        generated.push(next);
        state.tokens.push(next);

        if !state.model.tokenizer.is_special(next) {
            let piece = state
                .model
                .tokenizer
                .piece(next)
                .replace('\u{2581}', " ");
            on_piece(&piece);
            text.push_str(&piece);
        }
        if text.len() >= config.max_chars {
            finish = FinishReason::CharBudget;
            truncate_at_boundary(&mut text, config.max_chars);
            break;
        }

        state.eval(&[next])?;
    }

    debug!(
        tokens = generated.len(),
        chars = text.len(),
        ?finish,
        "generation finished"
    );
    Ok(Generated {
        text,
        token_count: generated.len(),
        finish,
    })
}

/// Trim to at most `max` bytes without splitting a UTF-8 sequence
fn truncate_at_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}
