//! Error Types for the Inference Core
//!
//! # Overview
//!
//! A single error enum covers every fallible operation in the crate:
//! file parsing, metadata lookup, arena allocation, graph construction,
//! kernel execution, generation, and the request mailbox. All public APIs
//! return [`LlmResult<T>`]; `null`-like returns (`Option`) are reserved for
//! lookup paths where absence is not an error.
//!
//! # Design Philosophy
//!
//! **No panics in production**: fallible operations return
//! `Result<T, LlmError>` and propagate with `?`. Panicking is confined to
//! tests.
//!
//! **Actionable errors**: each variant carries the context needed to act on
//! it (sizes for OOM, shapes for mismatches, keys and names for lookups).
//!
//! # Error Codes
//!
//! Every variant maps to a stable numeric code via [`LlmError::code`] for
//! programmatic handling at the control surface, grouped by category:
//! 1xxx parsing, 2xxx inference, 3xxx resources, 4xxx tokenization,
//! 5xxx mailbox, 9xxx internal.

use std::io;
use thiserror::Error;

/// Result type for all core operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Errors recognized by the inference core
#[derive(Debug, Error)]
pub enum LlmError {
    // Parsing
    /// Magic mismatch, unsupported version, or structurally invalid
    /// metadata/tensor-info
    #[error("bad model format: {reason}")]
    BadFormat { reason: String },

    /// A declared byte range lies past end-of-buffer
    #[error("truncated file: need {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A dtype, metadata type, or architecture the core does not implement
    #[error("unsupported: {what}")]
    Unsupported { what: String },

    /// Metadata key required by the assembler is absent
    #[error("metadata missing: {key}")]
    MetadataMissing { key: String },

    /// A required named tensor is absent from the model file
    #[error("tensor not found: {name}")]
    TensorNotFound { name: String },

    // Resources
    /// Arena exhausted or weight region too small
    #[error("out of memory: requested {requested} bytes, available {available}")]
    OutOfMemory { requested: usize, available: usize },

    /// The arena's descriptor table filled up during graph construction
    #[error("node limit reached: {capacity} descriptors")]
    NodeLimit { capacity: usize },

    // Inference
    /// Operand shapes fail an op's contract
    #[error("shape mismatch in {op}: {detail}")]
    ShapeMismatch { op: &'static str, detail: String },

    /// KV cache cannot accommodate another token
    #[error("context overflow: need {needed} positions, capacity {capacity}")]
    ContextOverflow { needed: usize, capacity: usize },

    // Tokenization
    /// Tokenization produced no usable tokens
    #[error("tokenization failed: {reason}")]
    TokenizationFailed { reason: String },

    // Mailbox
    /// The request slot is already occupied
    #[error("busy: a request is already pending")]
    Busy,

    /// `await_response` exceeded its deadline
    #[error("timed out waiting for response")]
    Timeout,

    /// Shutdown arrived while a request was pending
    #[error("cancelled by shutdown")]
    Cancelled,

    // Ambient
    /// I/O failure reading the model file
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation (should never happen)
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl LlmError {
    /// Stable numeric code for programmatic handling
    pub fn code(&self) -> u32 {
        match self {
            LlmError::BadFormat { .. } => 1001,
            LlmError::Truncated { .. } => 1002,
            LlmError::Unsupported { .. } => 1003,
            LlmError::MetadataMissing { .. } => 1004,
            LlmError::TensorNotFound { .. } => 1005,
            LlmError::ShapeMismatch { .. } => 2001,
            LlmError::ContextOverflow { .. } => 2002,
            LlmError::OutOfMemory { .. } => 3001,
            LlmError::NodeLimit { .. } => 3002,
            LlmError::TokenizationFailed { .. } => 4001,
            LlmError::Busy => 5001,
            LlmError::Timeout => 5002,
            LlmError::Cancelled => 5003,
            LlmError::Io(_) => 8001,
            LlmError::Internal { .. } => 9999,
        }
    }

    /// Error category, for log grouping
    pub fn category(&self) -> &'static str {
        match self {
            LlmError::BadFormat { .. }
            | LlmError::Truncated { .. }
            | LlmError::Unsupported { .. }
            | LlmError::MetadataMissing { .. }
            | LlmError::TensorNotFound { .. } => "Parsing",

            LlmError::ShapeMismatch { .. } | LlmError::ContextOverflow { .. } => "Inference",

            LlmError::OutOfMemory { .. } | LlmError::NodeLimit { .. } => "Resources",

            LlmError::TokenizationFailed { .. } => "Tokenization",

            LlmError::Busy | LlmError::Timeout | LlmError::Cancelled => "Mailbox",

            LlmError::Io(_) => "Io",

            LlmError::Internal { .. } => "Internal",
        }
    }

    /// Whether retrying the same operation can succeed without
    /// reconfiguration
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LlmError::Busy | LlmError::Timeout | LlmError::Cancelled
        )
    }

    /// Shorthand for a bad-format error
    pub fn bad_format(reason: impl Into<String>) -> Self {
        LlmError::BadFormat {
            reason: reason.into(),
        }
    }

    /// Shorthand for an unsupported-feature error
    pub fn unsupported(what: impl Into<String>) -> Self {
        LlmError::Unsupported { what: what.into() }
    }

    /// Shorthand for an internal-invariant error
    pub fn internal(message: impl Into<String>) -> Self {
        LlmError::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = LlmError::bad_format("no magic");
        assert_eq!(err.code(), 1001);

        let err = LlmError::Busy;
        assert_eq!(err.code(), 5001);
    }

    #[test]
    fn test_error_categories() {
        let err = LlmError::Truncated {
            offset: 10,
            needed: 4,
            available: 12,
        };
        assert_eq!(err.category(), "Parsing");

        let err = LlmError::OutOfMemory {
            requested: 100,
            available: 50,
        };
        assert_eq!(err.category(), "Resources");
    }

    #[test]
    fn test_error_display() {
        let err = LlmError::ContextOverflow {
            needed: 2049,
            capacity: 2048,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("2049"));
        assert!(msg.contains("2048"));
    }

    #[test]
    fn test_error_recoverable() {
        assert!(LlmError::Timeout.is_recoverable());
        assert!(LlmError::Busy.is_recoverable());
        assert!(!LlmError::bad_format("x").is_recoverable());
        assert!(!LlmError::NodeLimit { capacity: 4096 }.is_recoverable());
    }
}
