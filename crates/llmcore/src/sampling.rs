//! Token Sampling Strategies
//!
//! # Overview
//!
//! Next-token selection over the driver's logits buffer:
//!
//! - **Greedy**: deterministic argmax; the required default, and mandatory
//!   whenever `temperature == 0` regardless of the other knobs
//! - **Temperature**: divide logits by τ before the softmax; τ < 1
//!   sharpens, τ > 1 flattens
//! - **Top-k**: keep only the k most probable tokens
//! - **Top-p (nucleus)**: keep the smallest probability-sorted prefix
//!   whose cumulative mass reaches p
//!
//! Filters compose in that order and the surviving mass is renormalized
//! before drawing. Randomness comes from a seeded PRNG so a fixed seed
//! reproduces a generation exactly.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Sampling configuration
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    /// 0.0 forces greedy selection
    pub temperature: f32,
    /// 0 disables top-k filtering
    pub top_k: usize,
    /// 1.0 disables nucleus filtering
    pub top_p: f32,
    /// PRNG seed; 0 draws a seed from the OS
    pub seed: u64,
}

impl SamplingParams {
    /// Deterministic argmax selection
    pub fn greedy() -> Self {
        SamplingParams {
            temperature: 0.0,
            top_k: 1,
            top_p: 1.0,
            seed: 0,
        }
    }

    /// A reasonable middle ground for chat-style output
    pub fn balanced() -> Self {
        SamplingParams {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.9,
            seed: 0,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self::greedy()
    }
}

/// Stateful sampler: one per generation
pub struct Sampler {
    params: SamplingParams,
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        let rng = if params.seed == 0 {
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(params.seed)
        };
        Sampler { params, rng }
    }

    pub fn params(&self) -> SamplingParams {
        self.params
    }

    /// Select the next token id from a logits row
    pub fn sample(&mut self, logits: &[f32]) -> usize {
        debug_assert!(!logits.is_empty());
        let p = self.params;

        // Greedy fast path; mandatory for temperature zero
        if p.temperature <= 0.0 || p.top_k == 1 {
            return argmax(logits);
        }

        let scaled: Vec<f32> = logits.iter().map(|&x| x / p.temperature).collect();
        let mut probs = softmax(&scaled);

        if p.top_k > 0 && p.top_k < probs.len() {
            apply_top_k(&mut probs, p.top_k);
        }
        if p.top_p > 0.0 && p.top_p < 1.0 {
            apply_top_p(&mut probs, p.top_p);
        }
        renormalize(&mut probs);

        let draw: f32 = self.rng.gen();
        pick(&probs, draw)
    }
}

/// Index of the maximum logit
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut out: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = out.iter().sum();
    if sum > 0.0 {
        for v in out.iter_mut() {
            *v /= sum;
        }
    }
    out
}

/// Zero out everything below the k-th largest probability
fn apply_top_k(probs: &mut [f32], k: usize) {
    debug_assert!(k > 0 && k < probs.len());
    let mut sorted: Vec<f32> = probs.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

/// Keep the smallest descending-sorted prefix with cumulative mass >= p
fn apply_top_p(probs: &mut [f32], top_p: f32) {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumulative = 0.0f32;
    let mut keep = indexed.len();
    for (rank, (_, prob)) in indexed.iter().enumerate() {
        cumulative += prob;
        if cumulative >= top_p {
            keep = rank + 1;
            break;
        }
    }
    for (idx, _) in indexed.into_iter().skip(keep) {
        probs[idx] = 0.0;
    }
}

fn renormalize(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

/// Walk the cumulative distribution to the drawn point
fn pick(probs: &[f32], draw: f32) -> usize {
    let mut cumulative = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if draw < cumulative {
            return i;
        }
    }
    // Numerical tail: last surviving token
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or(probs.len() - 1)
}
