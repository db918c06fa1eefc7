//! Vocabulary Tokenizer
//!
//! # Overview
//!
//! Two operating modes behind one interface:
//!
//! - **Vocabulary mode**: backed by the token list carried in the model
//!   file (`tokenizer.ggml.tokens` plus scores, types, and the four
//!   distinguished special ids). Tokenization is greedy longest-match over
//!   the input byte stream; a position with no match emits UNK and
//!   advances one byte.
//! - **Fallback mode**: a tiny hand-curated word vocabulary used when the
//!   model file carries no vocabulary metadata. BOS is prepended and EOS
//!   appended around every fallback encoding.
//!
//! Detokenization concatenates textual forms, suppresses special tokens,
//! and maps the sentencepiece space marker (`▁`) back to a plain space.
//!
//! A real byte-pair-encoding implementation with merge ranks can replace
//! this behind the same interface without touching the rest of the core.

use std::collections::HashMap;
use tracing::info;

use crate::errors::LlmResult;
use crate::gguf::GgufFile;

/// Token id type; the driver widens to i32 for index tensors
pub type TokenId = u32;

/// Longest vocabulary piece considered during matching (bytes)
pub const MAX_PIECE_LEN: usize = 64;

/// Sentencepiece word-boundary marker used by LLaMA-family vocabularies
const SPACE_MARKER: &str = "\u{2581}";

/// Special roles a token can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl TokenKind {
    fn from_gguf(v: i32) -> TokenKind {
        match v {
            2 => TokenKind::Unknown,
            3 => TokenKind::Control,
            4 => TokenKind::UserDefined,
            5 => TokenKind::Unused,
            6 => TokenKind::Byte,
            _ => TokenKind::Normal,
        }
    }
}

/// One vocabulary entry
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub text: String,
    pub score: f32,
    pub kind: TokenKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerMode {
    Vocab,
    Fallback,
}

/// Vocabulary-lookup tokenizer with special-token handling
#[derive(Debug)]
pub struct Tokenizer {
    tokens: Vec<TokenRecord>,
    /// piece bytes -> id, for longest-match encoding
    index: HashMap<Vec<u8>, TokenId>,
    mode: TokenizerMode,
    max_piece_len: usize,
    bos: TokenId,
    eos: TokenId,
    unk: TokenId,
    pad: TokenId,
}

impl Tokenizer {
    /// Build from model-file metadata, falling back to the built-in word
    /// vocabulary when the file carries none
    pub fn from_gguf(file: &GgufFile) -> LlmResult<Tokenizer> {
        let token_values = match file.get("tokenizer.ggml.tokens").and_then(|v| v.as_array()) {
            Some(values) if !values.is_empty() => values,
            _ => {
                info!("no vocabulary metadata, using fallback tokenizer");
                return Ok(Self::fallback());
            }
        };

        let scores = file
            .get("tokenizer.ggml.scores")
            .and_then(|v| v.as_array());
        let types = file
            .get("tokenizer.ggml.token_type")
            .and_then(|v| v.as_array());

        let mut tokens = Vec::with_capacity(token_values.len());
        for (i, value) in token_values.iter().enumerate() {
            let text = value.as_str().unwrap_or("").to_string();
            let score = scores
                .and_then(|s| s.get(i))
                .and_then(|v| v.as_f32())
                .unwrap_or(0.0);
            let kind = types
                .and_then(|t| t.get(i))
                .and_then(|v| v.as_usize())
                .map(|v| TokenKind::from_gguf(v as i32))
                .unwrap_or(TokenKind::Normal);
            tokens.push(TokenRecord { text, score, kind });
        }

        let get_id = |key: &str, default: TokenId| -> TokenId {
            file.get(key)
                .and_then(|v| v.as_usize())
                .map(|v| v as TokenId)
                .unwrap_or(default)
        };
        let bos = get_id("tokenizer.ggml.bos_token_id", 1);
        let eos = get_id("tokenizer.ggml.eos_token_id", 2);
        let unk = get_id("tokenizer.ggml.unknown_token_id", 0);
        let pad = get_id("tokenizer.ggml.padding_token_id", unk);

        info!(vocab = tokens.len(), bos, eos, "tokenizer loaded from model");
        Ok(Self::from_records(tokens, TokenizerMode::Vocab, bos, eos, unk, pad))
    }

    /// The built-in fallback vocabulary
    pub fn fallback() -> Tokenizer {
        let mut tokens: Vec<TokenRecord> = Vec::new();
        let mut push = |text: &str, kind: TokenKind| {
            tokens.push(TokenRecord {
                text: text.to_string(),
                score: 0.0,
                kind,
            });
        };

        push("<unk>", TokenKind::Unknown);
        push("<s>", TokenKind::Control);
        push("</s>", TokenKind::Control);
        push("<pad>", TokenKind::Control);

        for word in [
            "the", "a", "an", "is", "are", "was", "to", "of", "and", "or", "in", "on", "it",
            "you", "i", "we", "not", "what", "how", "why", "hello", "world", "linux", "kernel",
            "file", "system", "memory", "process", "run", "time", "with", "for", "this", "that",
        ] {
            push(word, TokenKind::Normal);
        }
        for c in ('a'..='z').chain('0'..='9') {
            push(&c.to_string(), TokenKind::Normal);
        }
        for c in [' ', '.', ',', '?', '!', '\'', '-', '\n'] {
            push(&c.to_string(), TokenKind::Normal);
        }

        Self::from_records(tokens, TokenizerMode::Fallback, 1, 2, 0, 3)
    }

    fn from_records(
        tokens: Vec<TokenRecord>,
        mode: TokenizerMode,
        bos: TokenId,
        eos: TokenId,
        unk: TokenId,
        pad: TokenId,
    ) -> Tokenizer {
        let mut index = HashMap::with_capacity(tokens.len());
        let mut max_piece_len = 1;
        for (id, record) in tokens.iter().enumerate() {
            if record.kind == TokenKind::Control || record.text.is_empty() {
                continue;
            }
            let bytes = record.text.as_bytes().to_vec();
            max_piece_len = max_piece_len.max(bytes.len());
            // First writer wins so duplicated pieces keep the lowest id
            index.entry(bytes).or_insert(id as TokenId);
        }
        Tokenizer {
            tokens,
            index,
            mode,
            max_piece_len: max_piece_len.min(MAX_PIECE_LEN),
            bos,
            eos,
            unk,
            pad,
        }
    }

    /// Encode text into token ids
    ///
    /// Greedy longest-match; unmatched bytes emit UNK and advance one
    /// byte. `add_bos` prepends the BOS id (fallback mode always brackets
    /// with BOS and EOS).
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        let mut ids = Vec::new();
        if add_bos || self.mode == TokenizerMode::Fallback {
            ids.push(self.bos);
        }

        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let limit = self.max_piece_len.min(bytes.len() - i);
            let mut matched = None;
            for len in (1..=limit).rev() {
                if let Some(&id) = self.index.get(&bytes[i..i + len]) {
                    matched = Some((id, len));
                    break;
                }
            }
            match matched {
                Some((id, len)) => {
                    ids.push(id);
                    i += len;
                }
                None => {
                    ids.push(self.unk);
                    i += 1;
                }
            }
        }

        if self.mode == TokenizerMode::Fallback {
            ids.push(self.eos);
        }
        ids
    }

    /// Decode token ids into text, suppressing special tokens
    pub fn detokenize(&self, ids: &[TokenId]) -> String {
        let mut out = String::new();
        for &id in ids {
            if self.is_special(id) {
                continue;
            }
            match self.tokens.get(id as usize) {
                Some(record) if record.kind != TokenKind::Control => {
                    out.push_str(&record.text.replace(SPACE_MARKER, " "));
                }
                _ => {}
            }
        }
        out
    }

    /// Textual form of a single token (specials included), for streaming
    pub fn piece(&self, id: TokenId) -> &str {
        self.tokens
            .get(id as usize)
            .map(|r| r.text.as_str())
            .unwrap_or("")
    }

    pub fn is_special(&self, id: TokenId) -> bool {
        id == self.bos
            || id == self.eos
            || id == self.pad
            || id == self.unk
            || self
                .tokens
                .get(id as usize)
                .map(|r| r.kind == TokenKind::Control)
                .unwrap_or(false)
    }

    pub fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    pub fn mode(&self) -> TokenizerMode {
        self.mode
    }

    pub fn bos_id(&self) -> TokenId {
        self.bos
    }

    pub fn eos_id(&self) -> TokenId {
        self.eos
    }

    pub fn pad_id(&self) -> TokenId {
        self.pad
    }

    pub fn unk_id(&self) -> TokenId {
        self.unk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::{GgufValue, GgufWriter};

    fn vocab_file(pieces: &[&str]) -> GgufFile {
        let mut w = GgufWriter::new();
        let tokens: Vec<GgufValue> = pieces
            .iter()
            .map(|p| GgufValue::String(p.to_string()))
            .collect();
        w.put("tokenizer.ggml.tokens", GgufValue::Array(8, tokens))
            .put("tokenizer.ggml.bos_token_id", GgufValue::U32(1))
            .put("tokenizer.ggml.eos_token_id", GgufValue::U32(2))
            .put("tokenizer.ggml.unknown_token_id", GgufValue::U32(0))
            .put(
                "tokenizer.ggml.token_type",
                GgufValue::Array(
                    5,
                    (0..pieces.len() as i32)
                        .map(|i| GgufValue::I32(if i < 3 { 3 } else { 1 }))
                        .collect(),
                ),
            );
        GgufFile::parse(&w.build()).unwrap()
    }

    #[test]
    fn test_longest_match_wins() {
        let file = vocab_file(&["<unk>", "<s>", "</s>", "He", "Hello", "llo", "!"]);
        let tok = Tokenizer::from_gguf(&file).unwrap();
        assert_eq!(tok.mode(), TokenizerMode::Vocab);

        let ids = tok.tokenize("Hello!", false);
        // "Hello" (4) beats "He" (3); then "!"
        assert_eq!(ids, vec![4, 6]);
    }

    #[test]
    fn test_unknown_bytes_emit_unk() {
        let file = vocab_file(&["<unk>", "<s>", "</s>", "ab"]);
        let tok = Tokenizer::from_gguf(&file).unwrap();
        let ids = tok.tokenize("abzab", false);
        assert_eq!(ids, vec![3, 0, 3]);
    }

    #[test]
    fn test_bos_prepended_on_request() {
        let file = vocab_file(&["<unk>", "<s>", "</s>", "hi"]);
        let tok = Tokenizer::from_gguf(&file).unwrap();
        assert_eq!(tok.tokenize("hi", true), vec![1, 3]);
        assert_eq!(tok.tokenize("hi", false), vec![3]);
    }

    #[test]
    fn test_detokenize_suppresses_specials_and_space_marker() {
        let file = vocab_file(&["<unk>", "<s>", "</s>", "\u{2581}hello", "\u{2581}world"]);
        let tok = Tokenizer::from_gguf(&file).unwrap();
        let text = tok.detokenize(&[1, 3, 4, 2]);
        assert_eq!(text, " hello world");
    }

    #[test]
    fn test_fallback_mode_brackets_with_specials() {
        let tok = Tokenizer::fallback();
        assert_eq!(tok.mode(), TokenizerMode::Fallback);

        let ids = tok.tokenize("hello world", false);
        assert_eq!(*ids.first().unwrap(), tok.bos_id());
        assert_eq!(*ids.last().unwrap(), tok.eos_id());
        // Words resolve to single tokens, not letter runs
        assert!(ids.len() <= 5);

        let text = tok.detokenize(&ids);
        assert_eq!(text, "hello world");
    }

    #[test]
    fn test_fallback_covers_arbitrary_ascii() {
        let tok = Tokenizer::fallback();
        let ids = tok.tokenize("what is qzx?", false);
        assert!(!ids.iter().any(|&id| id == tok.unk_id()));
        assert_eq!(tok.detokenize(&ids), "what is qzx?");
    }

    #[test]
    fn test_empty_vocab_falls_back() {
        let w = GgufWriter::new();
        let file = GgufFile::parse(&w.build()).unwrap();
        let tok = Tokenizer::from_gguf(&file).unwrap();
        assert_eq!(tok.mode(), TokenizerMode::Fallback);
    }
}
