//! Engine Performance Metrics
//!
//! # Overview
//!
//! Lock-free counters behind the `stats` control-surface endpoint:
//! throughput (tokens, inference time, tokens/sec), reliability (total
//! and failed requests), cache effectiveness, and memory high-water
//! marks. The worker thread writes after each generation; readers take a
//! consistent-enough snapshot without blocking inference.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared between the worker and the control surface
#[derive(Default)]
pub struct EngineMetrics {
    total_tokens: AtomicU64,
    total_inference_ms: AtomicU64,
    /// Tokens/sec of the most recent generation
    current_tps: AtomicU64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    arena_used: AtomicU64,
    peak_memory: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished generation
    pub fn record_generation(&self, tokens: usize, elapsed_ms: u64) {
        self.total_tokens.fetch_add(tokens as u64, Ordering::Relaxed);
        self.total_inference_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        if elapsed_ms > 0 {
            self.current_tps
                .store(tokens as u64 * 1000 / elapsed_ms, Ordering::Relaxed);
        }
    }

    /// Publish KV-cache counters from the worker's cache
    pub fn set_cache_counters(&self, hits: u64, misses: u64) {
        self.cache_hits.store(hits, Ordering::Relaxed);
        self.cache_misses.store(misses, Ordering::Relaxed);
    }

    /// Publish arena occupancy; the peak only ratchets upward
    pub fn set_memory(&self, used: u64, high_water: u64) {
        self.arena_used.store(used, Ordering::Relaxed);
        let mut peak = self.peak_memory.load(Ordering::Relaxed);
        while high_water > peak {
            match self.peak_memory.compare_exchange_weak(
                peak,
                high_water,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => peak = actual,
            }
        }
    }

    pub fn avg_tokens_per_sec(&self) -> f32 {
        let ms = self.total_inference_ms.load(Ordering::Relaxed);
        let tokens = self.total_tokens.load(Ordering::Relaxed);
        if ms > 0 {
            tokens as f32 * 1000.0 / ms as f32
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            total_inference_ms: self.total_inference_ms.load(Ordering::Relaxed),
            current_tps: self.current_tps.load(Ordering::Relaxed),
            avg_tps: self.avg_tokens_per_sec(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if hits + misses > 0 {
                hits as f32 / (hits + misses) as f32
            } else {
                0.0
            },
            arena_used: self.arena_used.load(Ordering::Relaxed),
            peak_memory: self.peak_memory.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub total_tokens: u64,
    pub total_inference_ms: u64,
    pub current_tps: u64,
    pub avg_tps: f32,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f32,
    pub arena_used: u64,
    pub peak_memory: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_accounting() {
        let m = EngineMetrics::new();
        m.record_request();
        m.record_generation(50, 1000);
        m.record_request();
        m.record_generation(50, 1000);

        let snap = m.snapshot();
        assert_eq!(snap.total_tokens, 100);
        assert_eq!(snap.total_inference_ms, 2000);
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.current_tps, 50);
        assert!((snap.avg_tps - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_failure_counter() {
        let m = EngineMetrics::new();
        m.record_request();
        m.record_failure();
        let snap = m.snapshot();
        assert_eq!(snap.failed_requests, 1);
    }

    #[test]
    fn test_peak_memory_ratchets() {
        let m = EngineMetrics::new();
        m.set_memory(100, 500);
        m.set_memory(50, 200);
        let snap = m.snapshot();
        assert_eq!(snap.arena_used, 50);
        assert_eq!(snap.peak_memory, 500);
    }

    #[test]
    fn test_cache_hit_rate() {
        let m = EngineMetrics::new();
        m.set_cache_counters(3, 1);
        let snap = m.snapshot();
        assert!((snap.cache_hit_rate - 0.75).abs() < 1e-6);
    }
}
