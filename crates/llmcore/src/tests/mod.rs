//! End-to-End Integration Tests
//!
//! # Overview
//!
//! Pipeline-level coverage that the per-module unit tests cannot give:
//! model files written to disk and loaded back, quantized weights flowing
//! through the graph executor, full generations through the engine and
//! mailbox, and the concurrency contract of the request slot.
//!
//! Unit tests live in `#[cfg(test)]` modules next to the code they cover;
//! this module seeds the scenarios the design treats as acceptance
//! criteria.

use std::io::Write as _;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use crate::arena::TensorArena;
use crate::engine::{Engine, EngineConfig};
use crate::errors::LlmError;
use crate::generate::{generate, GenerationConfig};
use crate::gguf::GgufFile;
use crate::graph::{self, Executor};
use crate::infer::InferState;
use crate::mailbox::Mailbox;
use crate::model::tests::tiny_model_writer;
use crate::model::{LoadConfig, Model};
use crate::quantize::{dequantize_q4_k, f32_to_f16, Q4K_BLOCK_BYTES, QK_K};
use crate::sampling::SamplingParams;
use crate::tensor::DType;

fn tiny_engine(max_tokens: usize) -> Engine {
    let bytes = tiny_model_writer(true).build();
    let model = Model::from_bytes(&bytes, &LoadConfig::default()).unwrap();
    let config = EngineConfig {
        load: LoadConfig::default(),
        generation: GenerationConfig {
            max_tokens,
            stop_on_eos: false,
            ..GenerationConfig::greedy()
        },
    };
    Engine::from_model(model, config).unwrap()
}

/// Model files survive a disk round trip and the parsed directory
/// re-serializes byte-for-byte
#[test]
fn test_model_file_disk_roundtrip() {
    let bytes = tiny_model_writer(false).build();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();
    file.flush().unwrap();

    let model = Model::load_file(file.path(), &LoadConfig::default()).unwrap();
    assert_eq!(model.hparams.n_layer, 1);
    assert!(!model.tied_output());

    let parsed = GgufFile::parse(&bytes).unwrap();
    assert_eq!(
        parsed.serialize_directory(),
        bytes[..parsed.data_region_start]
    );
}

/// A full generation through the library API: prompt in, text out,
/// state advanced
#[test]
fn test_complete_inference_pipeline() {
    let bytes = tiny_model_writer(true).build();
    let model = Model::from_bytes(&bytes, &LoadConfig::default()).unwrap();
    let mut state = InferState::new(model).unwrap();

    let config = GenerationConfig {
        max_tokens: 6,
        stop_on_eos: false,
        ..GenerationConfig::greedy()
    };
    let out = generate(&mut state, "hello world", &config).unwrap();
    assert_eq!(out.token_count, 6);
    assert!(state.n_past >= out.token_count);
    assert_eq!(state.kv.fill(), state.n_past);
}

/// Engine scenario: a prompt submitted to an idle mailbox produces a
/// non-empty response within the read deadline and the token counter
/// moves
#[test]
fn test_engine_prompt_roundtrip() {
    let engine = tiny_engine(8);
    engine.submit_prompt("Hello").unwrap();

    let response = engine
        .await_response(Duration::from_secs(5))
        .unwrap()
        .unwrap();
    assert!(!response.is_empty());
    assert!(engine.metrics().snapshot().total_tokens >= 1);
    assert_eq!(engine.metrics().snapshot().total_requests, 1);
}

/// Mailbox scenario: two producers racing for the slot see exactly one
/// acceptance and one Busy
#[test]
fn test_concurrent_submit_exactly_one_accepted() {
    let mailbox = Arc::new(Mailbox::new());
    let barrier = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for prompt in ["A", "B"] {
        let mailbox = Arc::clone(&mailbox);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            mailbox.submit(prompt)
        }));
    }

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(LlmError::Busy)))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(busy, 1);

    // The worker observes the accepted prompt, whichever won
    let seen = mailbox.wait_for_request().unwrap();
    assert!(seen == "A" || seen == "B");
}

/// Sampling scenario: temperature zero yields the identical output for
/// the identical prompt, across independent engines
#[test]
fn test_greedy_engine_deterministic() {
    let run = || -> String {
        let engine = tiny_engine(6);
        engine.submit_prompt("hello world").unwrap();
        engine
            .await_response(Duration::from_secs(5))
            .unwrap()
            .unwrap()
    };
    assert_eq!(run(), run());
}

/// Context scenario: a request that cannot fit the window is refused
/// up front and reported as a readable error through the mailbox
#[test]
fn test_engine_context_overflow_reported() {
    let engine = tiny_engine(40); // n_ctx = 32
    engine.submit_prompt("hello").unwrap();
    let response = engine
        .await_response(Duration::from_secs(5))
        .unwrap()
        .unwrap();
    assert!(response.starts_with("error"), "got: {}", response);
    assert_eq!(engine.metrics().snapshot().failed_requests, 1);
}

/// Quantized weights flow through the matmul kernel identically to
/// their dequantized f32 image
#[test]
fn test_q4k_matmul_matches_dequantized_reference() {
    // Two Q4_K rows of 256 elements with varied scales and nibbles
    let mut raw = Vec::with_capacity(2 * Q4K_BLOCK_BYTES);
    for row in 0..2u8 {
        raw.extend_from_slice(&f32_to_f16(0.5 + row as f32).to_le_bytes());
        raw.extend_from_slice(&f32_to_f16(0.25).to_le_bytes());
        let mut scales = [0u8; 12];
        for (j, s) in scales.iter_mut().enumerate() {
            *s = ((j as u8) * 7 + row) % 63;
        }
        raw.extend_from_slice(&scales);
        raw.extend((0..128u32).map(|i| ((i * 37 + row as u32 * 11) % 256) as u8));
    }

    // Reference image
    let mut reference = vec![0.0f32; 2 * QK_K];
    dequantize_q4_k(&raw, &mut reference, 2 * QK_K).unwrap();

    let mut arena = TensorArena::new(1 << 20);
    let a_q = arena.alloc_tensor(DType::Q4K, [QK_K, 2, 1, 1]).unwrap();
    arena.bytes_mut(a_q).unwrap().copy_from_slice(&raw);
    let a_f = arena.alloc_tensor(DType::F32, [QK_K, 2, 1, 1]).unwrap();
    arena.f32_mut(a_f).unwrap().copy_from_slice(&reference);

    let b = arena.alloc_tensor(DType::F32, [QK_K, 1, 1, 1]).unwrap();
    for (i, v) in arena.f32_mut(b).unwrap().iter_mut().enumerate() {
        *v = ((i as f32) * 0.01).sin();
    }

    let c_q = graph::mul_mat(&mut arena, a_q, b).unwrap();
    let c_f = graph::mul_mat(&mut arena, a_f, b).unwrap();
    Executor::new().execute(&mut arena, &[c_q, c_f]).unwrap();

    let (got, want) = (
        arena.f32(c_q).unwrap().to_vec(),
        arena.f32(c_f).unwrap().to_vec(),
    );
    for (g, w) in got.iter().zip(&want) {
        assert!((g - w).abs() <= 1e-4 * w.abs().max(1.0), "{} vs {}", g, w);
    }
}

/// F16 weights decode through the same mixed-dtype matmul path
#[test]
fn test_f16_matmul_path() {
    let values = [1.0f32, -0.5, 0.25, 2.0];
    let mut raw = Vec::new();
    for v in values {
        raw.extend_from_slice(&f32_to_f16(v).to_le_bytes());
    }

    let mut arena = TensorArena::new(1 << 16);
    let a = arena.alloc_tensor(DType::F16, [2, 2, 1, 1]).unwrap();
    arena.bytes_mut(a).unwrap().copy_from_slice(&raw);
    let b = arena.alloc_tensor(DType::F32, [2, 1, 1, 1]).unwrap();
    arena.f32_mut(b).unwrap().copy_from_slice(&[2.0, 4.0]);

    let c = graph::mul_mat(&mut arena, a, b).unwrap();
    Executor::new().execute(&mut arena, &[c]).unwrap();
    // col0 . b = 1*2 + -0.5*4 = 0; col1 . b = 0.25*2 + 2*4 = 8.5
    assert_eq!(arena.f32(c).unwrap(), &[0.0, 8.5]);
}

/// Grouped-query attention: a model with fewer kv heads than query heads
/// generates cleanly and incremental evaluation matches one-shot
#[test]
fn test_gqa_incremental_consistency() {
    let bytes = tiny_model_writer(true).build(); // 2 heads, 1 kv head
    let model = Model::from_bytes(&bytes, &LoadConfig::default()).unwrap();
    let mut one_shot = InferState::new(model).unwrap();
    one_shot.eval(&[3, 4, 5, 6]).unwrap();

    let model = Model::from_bytes(&bytes, &LoadConfig::default()).unwrap();
    let mut incremental = InferState::new(model).unwrap();
    incremental.eval(&[3]).unwrap();
    incremental.eval(&[4, 5]).unwrap();
    incremental.eval(&[6]).unwrap();

    for (a, b) in one_shot.logits.iter().zip(&incremental.logits) {
        assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
    }
}

/// The bring-up flag evaluates a model with holes instead of refusing it
#[test]
fn test_placeholder_model_still_generates() {
    use crate::gguf::{GgufValue, GgufWriter};

    let (d, v) = (8usize, 16usize);
    let mut w = GgufWriter::new();
    w.put("general.architecture", GgufValue::String("llama".into()))
        .put("llama.context_length", GgufValue::U32(32))
        .put("llama.embedding_length", GgufValue::U32(d as u32))
        .put("llama.block_count", GgufValue::U32(1))
        .put("llama.attention.head_count", GgufValue::U32(2))
        .put("llama.feed_forward_length", GgufValue::U32(16));
    w.add_f32_tensor(
        "token_embd.weight",
        &[d, v],
        &(0..d * v).map(|i| (i as f32 * 0.1).cos()).collect::<Vec<_>>(),
    );

    let config = LoadConfig {
        allow_missing_tensors: true,
        ..Default::default()
    };
    let model = Model::from_bytes(&w.build(), &config).unwrap();
    assert!(model.placeholder_count > 0);

    let mut state = InferState::new(model).unwrap();
    state.eval(&[1, 2]).unwrap();
    assert!(state.logits.iter().all(|v| v.is_finite()));
}

/// Sampled generation with a fixed seed reproduces across runs
#[test]
fn test_seeded_sampling_reproducible_end_to_end() {
    let run = || -> String {
        let bytes = tiny_model_writer(true).build();
        let model = Model::from_bytes(&bytes, &LoadConfig::default()).unwrap();
        let mut state = InferState::new(model).unwrap();
        let config = GenerationConfig {
            max_tokens: 8,
            stop_on_eos: false,
            sampling: SamplingParams::balanced().seed(42),
            ..GenerationConfig::greedy()
        };
        generate(&mut state, "hello", &config).unwrap().text
    };
    assert_eq!(run(), run());
}
