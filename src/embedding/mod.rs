//! Subword skipgram embeddings
//!
//! Commands are encoded as fixed-dimension vectors by an unsupervised
//! subword skipgram model trained on the rolling corpus of tokenized
//! command lines. Character n-grams back every token, so unseen tokens
//! (typos, new paths) still land near their neighbors.
//!
//! # Architecture
//!
//! ```text
//! rolling corpus (embeddings.corpus)
//!         │ train / merge (scheduler)
//!         ▼
//! SkipgramModel ──encode()──→ f32[D] ──→ ANN index
//! ```
//!
//! The model family has no true online update: `merge` appends new lines
//! to the corpus, caps it, and retrains over the union. On success the new
//! model atomically supersedes the old; on failure the old model and the
//! corpus are left untouched.

pub mod corpus;
pub mod queue;
pub mod trainer;

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Embedding vector type.
pub type Embedding = Vec<f32>;

/// Model file magic + format version.
const MODEL_MAGIC: &[u8; 8] = b"HSVEC01\0";

/// Errors from training and persistence.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("corpus too small: {lines} lines (minimum {minimum})")]
    CorpusTooSmall { lines: usize, minimum: usize },
    #[error("trainer unavailable: {0}")]
    TrainerUnavailable(String),
    #[error("model file format error: {0}")]
    Format(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Context for context-aware encoding: the cwd leaf name plus the most
/// recent commands (at most 5 are used).
#[derive(Debug, Clone, Default)]
pub struct EncodeContext {
    pub cwd_leaf: String,
    pub recent_commands: Vec<String>,
}

/// Weight of the context encoding when blended with the command encoding.
const CONTEXT_WEIGHT: f32 = 0.3;
const COMMAND_WEIGHT: f32 = 0.7;
/// Most recent commands considered from the context.
const CONTEXT_COMMANDS: usize = 5;

#[derive(Debug, Clone)]
pub struct VocabEntry {
    pub word: String,
    pub count: u64,
}

/// A trained subword skipgram model. Read-mostly: `encode` takes `&self`;
/// retraining builds a replacement and the owner swaps it in.
#[derive(Debug)]
pub struct SkipgramModel {
    dim: usize,
    min_ngram: usize,
    max_ngram: usize,
    word_ngrams: usize,
    buckets: usize,
    vocab: HashMap<String, usize>,
    vocab_entries: Vec<VocabEntry>,
    /// Input vectors: vocabulary rows first, then subword/phrase buckets.
    input: Vec<f32>,
}

impl SkipgramModel {
    pub(crate) fn new(
        dim: usize,
        min_ngram: usize,
        max_ngram: usize,
        word_ngrams: usize,
        buckets: usize,
        vocab_entries: Vec<VocabEntry>,
        input: Vec<f32>,
    ) -> Self {
        let vocab = vocab_entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.word.clone(), i))
            .collect();
        Self {
            dim,
            min_ngram,
            max_ngram,
            word_ngrams,
            buckets,
            vocab,
            vocab_entries,
            input,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_entries.len()
    }

    /// Encode a command into a unit-norm vector. Deterministic for a
    /// fixed model: two calls on the same input are bit-identical.
    pub fn encode(&self, command: &str) -> Embedding {
        let text = crate::tokenizer::tokenize(command).embedding_text();
        self.encode_text(&text)
    }

    /// Encode with directory/history context blended in at 0.3 weight.
    pub fn encode_with_context(&self, command: &str, context: &EncodeContext) -> Embedding {
        let command_vec = self.encode(command);

        let mut context_parts: Vec<String> = Vec::new();
        if !context.cwd_leaf.is_empty() {
            context_parts.push(context.cwd_leaf.clone());
        }
        for recent in context.recent_commands.iter().rev().take(CONTEXT_COMMANDS) {
            context_parts.push(crate::tokenizer::tokenize(recent).embedding_text());
        }
        if context_parts.is_empty() {
            return command_vec;
        }

        let mut context_vec = vec![0.0f32; self.dim];
        let mut contributions = 0usize;
        for part in &context_parts {
            let encoded = self.encode_text(part);
            if encoded.iter().any(|x| *x != 0.0) {
                for (acc, x) in context_vec.iter_mut().zip(encoded.iter()) {
                    *acc += x;
                }
                contributions += 1;
            }
        }
        if contributions == 0 {
            return command_vec;
        }
        for x in context_vec.iter_mut() {
            *x /= contributions as f32;
        }
        normalize(&mut context_vec);

        let mut blended: Vec<f32> = command_vec
            .iter()
            .zip(context_vec.iter())
            .map(|(c, x)| COMMAND_WEIGHT * c + CONTEXT_WEIGHT * x)
            .collect();
        normalize(&mut blended);
        blended
    }

    /// Encode already-normalized token text (whitespace-separated tokens).
    pub(crate) fn encode_text(&self, text: &str) -> Embedding {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let mut sum = vec![0.0f32; self.dim];
        let mut contributions = 0usize;

        for token in &tokens {
            if self.accumulate_token(token, &mut sum) {
                contributions += 1;
            }
        }

        // phrase units: word n-grams hashed into the bucket table
        for n in 2..=self.word_ngrams {
            if tokens.len() < n {
                break;
            }
            for window in tokens.windows(n) {
                let phrase = window.join(" ");
                let row = self.bucket_row(&phrase);
                add_row(&self.input, row, self.dim, &mut sum);
                contributions += 1;
            }
        }

        if contributions == 0 {
            return vec![0.0; self.dim];
        }
        for x in sum.iter_mut() {
            *x /= contributions as f32;
        }
        normalize(&mut sum);
        sum
    }

    /// Mean of the token's unit rows (vocabulary word + subword buckets)
    /// added into `sum`. Returns false when the token yields no units.
    fn accumulate_token(&self, token: &str, sum: &mut [f32]) -> bool {
        let mut rows: Vec<usize> = Vec::new();
        if let Some(&word_idx) = self.vocab.get(token) {
            rows.push(word_idx);
        }
        self.subword_rows(token, &mut rows);
        if rows.is_empty() {
            return false;
        }

        let scale = 1.0 / rows.len() as f32;
        for row in rows {
            let base = row * self.dim;
            for (i, x) in sum.iter_mut().enumerate() {
                *x += self.input[base + i] * scale;
            }
        }
        true
    }

    /// Character n-gram bucket rows for a token, boundary-marked the way
    /// fastText does (`<token>`).
    fn subword_rows(&self, token: &str, rows: &mut Vec<usize>) {
        let bracketed: Vec<char> = std::iter::once('<')
            .chain(token.chars())
            .chain(std::iter::once('>'))
            .collect();
        for n in self.min_ngram..=self.max_ngram {
            if bracketed.len() < n {
                break;
            }
            for window in bracketed.windows(n) {
                let gram: String = window.iter().collect();
                rows.push(self.bucket_row(&gram));
            }
        }
    }

    fn bucket_row(&self, unit: &str) -> usize {
        self.vocab_entries.len() + (fnv1a(unit.as_bytes()) as usize % self.buckets)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    /// Write the model to `path` atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), EmbedError> {
        let tmp_path = path.with_extension("model.tmp");
        {
            let file = std::fs::File::create(&tmp_path)?;
            let mut w = BufWriter::new(file);

            w.write_all(MODEL_MAGIC)?;
            w.write_all(&(self.dim as u32).to_le_bytes())?;
            w.write_all(&(self.min_ngram as u32).to_le_bytes())?;
            w.write_all(&(self.max_ngram as u32).to_le_bytes())?;
            w.write_all(&(self.word_ngrams as u32).to_le_bytes())?;
            w.write_all(&(self.buckets as u32).to_le_bytes())?;
            w.write_all(&(self.vocab_entries.len() as u32).to_le_bytes())?;

            for entry in &self.vocab_entries {
                let bytes = entry.word.as_bytes();
                w.write_all(&(bytes.len() as u16).to_le_bytes())?;
                w.write_all(bytes)?;
                w.write_all(&entry.count.to_le_bytes())?;
            }

            for value in &self.input {
                w.write_all(&value.to_le_bytes())?;
            }
            w.flush()?;
        }
        std::fs::rename(&tmp_path, path)?;
        crate::util::restrict_file_permissions(path)?;
        Ok(())
    }

    /// Load a model from `path`.
    pub fn load(path: &Path) -> Result<Self, EmbedError> {
        let file = std::fs::File::open(path)?;
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MODEL_MAGIC {
            return Err(EmbedError::Format("bad magic".to_string()));
        }

        let dim = read_u32(&mut r)? as usize;
        let min_ngram = read_u32(&mut r)? as usize;
        let max_ngram = read_u32(&mut r)? as usize;
        let word_ngrams = read_u32(&mut r)? as usize;
        let buckets = read_u32(&mut r)? as usize;
        let vocab_len = read_u32(&mut r)? as usize;

        if dim == 0 || dim > 4096 || buckets == 0 || min_ngram == 0 || max_ngram < min_ngram {
            return Err(EmbedError::Format("implausible hyperparameters".to_string()));
        }

        let mut vocab_entries = Vec::with_capacity(vocab_len);
        for _ in 0..vocab_len {
            let len = read_u16(&mut r)? as usize;
            let mut bytes = vec![0u8; len];
            r.read_exact(&mut bytes)?;
            let word = String::from_utf8(bytes)
                .map_err(|_| EmbedError::Format("non-UTF-8 vocab entry".to_string()))?;
            let count = read_u64(&mut r)?;
            vocab_entries.push(VocabEntry { word, count });
        }

        let rows = vocab_len + buckets;
        let mut input = vec![0.0f32; rows * dim];
        let mut buf = [0u8; 4];
        for value in input.iter_mut() {
            r.read_exact(&mut buf)?;
            *value = f32::from_le_bytes(buf);
        }

        Ok(Self::new(
            dim,
            min_ngram,
            max_ngram,
            word_ngrams,
            buckets,
            vocab_entries,
            input,
        ))
    }
}

fn add_row(input: &[f32], row: usize, dim: usize, sum: &mut [f32]) {
    let base = row * dim;
    for (i, x) in sum.iter_mut().enumerate() {
        *x += input[base + i];
    }
}

pub(crate) fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity between two vectors of equal length.
#[cfg(test)]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let norm = norm_a.sqrt() * norm_b.sqrt();
    if norm == 0.0 {
        0.0
    } else {
        dot / norm
    }
}

/// FNV-1a over bytes; the bucket hash for subword and phrase units.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn read_u16<R: Read>(r: &mut R) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::trainer::{train, TrainParams};
    use super::*;

    fn tiny_corpus() -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..20 {
            lines.push("git status".to_string());
            lines.push("git commit -m msg".to_string());
            lines.push("git push origin main".to_string());
            lines.push("docker ps -a".to_string());
            lines.push("docker compose up".to_string());
            lines.push("ls -la".to_string());
        }
        lines
    }

    fn tiny_params() -> TrainParams {
        TrainParams {
            dim: 16,
            epochs: 2,
            ..TrainParams::default()
        }
    }

    #[test]
    fn test_encode_deterministic() {
        let model = train(&tiny_corpus(), &tiny_params()).expect("train");
        let a = model.encode("git status");
        let b = model.encode("git status");
        assert_eq!(a, b);
    }

    #[test]
    fn test_encode_unit_norm() {
        let model = train(&tiny_corpus(), &tiny_params()).expect("train");
        let v = model.encode("docker ps");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_unseen_token_nonzero() {
        let model = train(&tiny_corpus(), &tiny_params()).expect("train");
        // typo never seen in the corpus still gets a subword-backed vector
        let v = model.encode("doker ps");
        assert!(v.iter().any(|x| *x != 0.0));
    }

    #[test]
    fn test_typo_lands_near_original() {
        let model = train(&tiny_corpus(), &tiny_params()).expect("train");
        let original = model.encode("docker ps -a");
        let typo = model.encode("doker ps");
        let unrelated = model.encode("git status");
        assert!(
            cosine_similarity(&typo, &original) > cosine_similarity(&typo, &unrelated),
            "typo should sit closer to its original than to an unrelated command"
        );
    }

    #[test]
    fn test_save_load_roundtrip_encoding() {
        let model = train(&tiny_corpus(), &tiny_params()).expect("train");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("embeddings.model");
        model.save(&path).expect("save");

        let loaded = SkipgramModel::load(&path).expect("load");
        for command in ["git status", "docker ps -a", "never seen before"] {
            assert_eq!(model.encode(command), loaded.encode(command));
        }
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("embeddings.model");
        std::fs::write(&path, b"definitely not a model").expect("write");
        assert!(SkipgramModel::load(&path).is_err());
    }

    #[test]
    fn test_context_blend_changes_encoding() {
        let model = train(&tiny_corpus(), &tiny_params()).expect("train");
        let plain = model.encode("git status");
        let context = EncodeContext {
            cwd_leaf: "project".to_string(),
            recent_commands: vec!["docker ps -a".to_string()],
        };
        let blended = model.encode_with_context("git status", &context);
        assert_ne!(plain, blended);
        // still dominated by the command itself
        assert!(cosine_similarity(&plain, &blended) > 0.5);
    }

    #[test]
    fn test_empty_context_is_noop() {
        let model = train(&tiny_corpus(), &tiny_params()).expect("train");
        let plain = model.encode("git status");
        let blended = model.encode_with_context("git status", &EncodeContext::default());
        assert_eq!(plain, blended);
    }
}
