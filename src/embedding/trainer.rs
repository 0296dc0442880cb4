//! Skipgram training over the rolling corpus
//!
//! Plain negative-sampling skipgram with subword input units, retrained
//! from scratch each cycle over the bounded corpus. Seeded from the corpus
//! size so repeated training over identical input yields identical models.

use super::{EmbedError, SkipgramModel, VocabEntry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// Training hyperparameters. Fixed defaults per the model design; only
/// the dimension is user-configurable.
#[derive(Debug, Clone)]
pub struct TrainParams {
    pub dim: usize,
    pub min_ngram: usize,
    pub max_ngram: usize,
    pub word_ngrams: usize,
    pub buckets: usize,
    pub min_count: u64,
    pub epochs: usize,
    pub window: usize,
    pub negatives: usize,
    pub learning_rate: f32,
    /// Minimum corpus lines; fewer is `CorpusTooSmall`.
    pub min_corpus_lines: usize,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            dim: 128,
            min_ngram: 3,
            max_ngram: 6,
            word_ngrams: 3,
            buckets: 1 << 15,
            min_count: 2,
            epochs: 5,
            window: 5,
            negatives: 5,
            learning_rate: 0.05,
            min_corpus_lines: 50,
        }
    }
}

/// Size of the precomputed negative-sampling table.
const NEGATIVE_TABLE_SIZE: usize = 1 << 17;

/// Train a model over tokenized corpus lines (whitespace-separated tokens,
/// one command per line).
pub fn train(lines: &[String], params: &TrainParams) -> Result<SkipgramModel, EmbedError> {
    if lines.len() < params.min_corpus_lines {
        return Err(EmbedError::CorpusTooSmall {
            lines: lines.len(),
            minimum: params.min_corpus_lines,
        });
    }

    let vocab_entries = build_vocab(lines, params.min_count);
    if vocab_entries.is_empty() {
        return Err(EmbedError::CorpusTooSmall {
            lines: lines.len(),
            minimum: params.min_corpus_lines,
        });
    }
    let vocab: HashMap<&str, usize> = vocab_entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.word.as_str(), i))
        .collect();

    let negative_table = build_negative_table(&vocab_entries);

    let rows = vocab_entries.len() + params.buckets;
    let mut rng = StdRng::seed_from_u64(0x9e37_79b9_7f4a_7c15 ^ lines.len() as u64);

    // fastText-style init: small uniform input vectors, zero output vectors
    let spread = 1.0 / params.dim as f32;
    let mut input: Vec<f32> = (0..rows * params.dim)
        .map(|_| rng.gen_range(-spread..spread))
        .collect();
    let mut output = vec![0.0f32; vocab_entries.len() * params.dim];

    // a probe model gives us the exact unit-row computation used at encode
    // time, so training and inference agree on subword hashing
    let probe = SkipgramModel::new(
        params.dim,
        params.min_ngram,
        params.max_ngram,
        params.word_ngrams,
        params.buckets,
        vocab_entries.clone(),
        Vec::new(),
    );

    let tokenized: Vec<Vec<&str>> = lines
        .iter()
        .map(|line| line.split_whitespace().collect())
        .collect();

    let total_tokens: usize = tokenized.iter().map(|t| t.len()).sum();
    let total_work = (total_tokens * params.epochs).max(1);
    let mut processed = 0usize;

    let dim = params.dim;
    let mut hidden = vec![0.0f32; dim];
    let mut grad = vec![0.0f32; dim];

    for _epoch in 0..params.epochs {
        for tokens in &tokenized {
            for center in 0..tokens.len() {
                processed += 1;
                let lr = params.learning_rate
                    * (1.0 - processed as f32 / total_work as f32).max(1e-4);

                let mut input_rows: Vec<usize> = Vec::new();
                collect_unit_rows(&probe, &vocab, tokens, center, params, &mut input_rows);
                if input_rows.is_empty() {
                    continue;
                }

                // hidden = mean of input unit rows
                hidden.iter_mut().for_each(|x| *x = 0.0);
                for &row in &input_rows {
                    let base = row * dim;
                    for i in 0..dim {
                        hidden[i] += input[base + i];
                    }
                }
                let inv = 1.0 / input_rows.len() as f32;
                hidden.iter_mut().for_each(|x| *x *= inv);

                let span = rng.gen_range(1..=params.window);
                let lo = center.saturating_sub(span);
                let hi = (center + span).min(tokens.len() - 1);
                for target_pos in lo..=hi {
                    if target_pos == center {
                        continue;
                    }
                    let Some(&target) = vocab.get(tokens[target_pos]) else {
                        continue;
                    };

                    grad.iter_mut().for_each(|x| *x = 0.0);
                    train_pair(
                        &mut output,
                        &hidden,
                        &mut grad,
                        target,
                        &negative_table,
                        params.negatives,
                        lr,
                        dim,
                        &mut rng,
                    );

                    // distribute the hidden-layer gradient back to the units
                    let scale = 1.0 / input_rows.len() as f32;
                    for &row in &input_rows {
                        let base = row * dim;
                        for i in 0..dim {
                            input[base + i] += grad[i] * scale;
                        }
                    }
                }
            }
        }
    }

    Ok(SkipgramModel::new(
        params.dim,
        params.min_ngram,
        params.max_ngram,
        params.word_ngrams,
        params.buckets,
        vocab_entries,
        input,
    ))
}

/// Input unit rows for the center token: its vocab row, its subword
/// buckets, and the phrase buckets of word n-grams ending at it.
fn collect_unit_rows(
    probe: &SkipgramModel,
    vocab: &HashMap<&str, usize>,
    tokens: &[&str],
    center: usize,
    params: &TrainParams,
    rows: &mut Vec<usize>,
) {
    let token = tokens[center];
    if let Some(&idx) = vocab.get(token) {
        rows.push(idx);
    }
    probe.subword_rows(token, rows);
    for n in 2..=params.word_ngrams {
        if center + 1 < n {
            continue;
        }
        let phrase = tokens[center + 1 - n..=center].join(" ");
        rows.push(probe.bucket_row(&phrase));
    }
}

/// One positive + `negatives` sampled updates of the output layer,
/// accumulating the hidden gradient.
#[allow(clippy::too_many_arguments)]
fn train_pair(
    output: &mut [f32],
    hidden: &[f32],
    grad: &mut [f32],
    target: usize,
    negative_table: &[usize],
    negatives: usize,
    lr: f32,
    dim: usize,
    rng: &mut StdRng,
) {
    for sample in 0..=negatives {
        let (row, label) = if sample == 0 {
            (target, 1.0f32)
        } else {
            let mut neg = negative_table[rng.gen_range(0..negative_table.len())];
            if neg == target {
                neg = negative_table[rng.gen_range(0..negative_table.len())];
            }
            (neg, 0.0f32)
        };

        let base = row * dim;
        let mut score = 0.0f32;
        for i in 0..dim {
            score += hidden[i] * output[base + i];
        }
        let g = (label - sigmoid(score)) * lr;
        for i in 0..dim {
            grad[i] += g * output[base + i];
            output[base + i] += g * hidden[i];
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    // clamp to keep exp well-behaved
    let x = x.clamp(-8.0, 8.0);
    1.0 / (1.0 + (-x).exp())
}

/// Count tokens and keep those at or above `min_count`, ordered by count
/// descending then word ascending for determinism.
fn build_vocab(lines: &[String], min_count: u64) -> Vec<VocabEntry> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for line in lines {
        for token in line.split_whitespace() {
            *counts.entry(token).or_insert(0) += 1;
        }
    }
    let mut entries: Vec<VocabEntry> = counts
        .into_iter()
        .filter(|(_, count)| *count >= min_count)
        .map(|(word, count)| VocabEntry {
            word: word.to_string(),
            count,
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
    entries
}

/// Unigram^0.75 table for negative sampling.
fn build_negative_table(vocab: &[VocabEntry]) -> Vec<usize> {
    let total: f64 = vocab.iter().map(|e| (e.count as f64).powf(0.75)).sum();
    let mut table = Vec::with_capacity(NEGATIVE_TABLE_SIZE);
    for (idx, entry) in vocab.iter().enumerate() {
        let share = (entry.count as f64).powf(0.75) / total;
        let slots = ((share * NEGATIVE_TABLE_SIZE as f64).ceil() as usize).max(1);
        for _ in 0..slots {
            if table.len() >= NEGATIVE_TABLE_SIZE {
                break;
            }
            table.push(idx);
        }
    }
    if table.is_empty() {
        table.push(0);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus(n: usize) -> Vec<String> {
        let mut lines = Vec::new();
        for i in 0..n {
            lines.push(match i % 3 {
                0 => "git status".to_string(),
                1 => "git push origin main".to_string(),
                _ => "cargo build --release".to_string(),
            });
        }
        lines
    }

    #[test]
    fn test_corpus_too_small() {
        let lines = corpus(10);
        let err = train(&lines, &TrainParams::default()).expect_err("should fail");
        assert!(matches!(err, EmbedError::CorpusTooSmall { lines: 10, minimum: 50 }));
    }

    #[test]
    fn test_training_deterministic() {
        let lines = corpus(60);
        let params = TrainParams {
            dim: 8,
            epochs: 1,
            ..TrainParams::default()
        };
        let a = train(&lines, &params).expect("train");
        let b = train(&lines, &params).expect("train");
        assert_eq!(a.encode("git status"), b.encode("git status"));
    }

    #[test]
    fn test_vocab_filtering() {
        let mut lines = corpus(60);
        lines.push("onlyonce".to_string());
        let entries = build_vocab(&lines, 2);
        assert!(entries.iter().all(|e| e.word != "onlyonce"));
        assert!(entries.iter().any(|e| e.word == "git"));
    }

    #[test]
    fn test_vocab_deterministic_order() {
        let lines = corpus(60);
        assert_eq!(
            build_vocab(&lines, 2)
                .iter()
                .map(|e| e.word.clone())
                .collect::<Vec<_>>(),
            build_vocab(&lines, 2)
                .iter()
                .map(|e| e.word.clone())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_related_commands_cluster() {
        let mut lines = Vec::new();
        for _ in 0..40 {
            lines.push("git status".to_string());
            lines.push("git diff".to_string());
            lines.push("docker ps".to_string());
            lines.push("docker images".to_string());
        }
        let params = TrainParams {
            dim: 24,
            epochs: 5,
            ..TrainParams::default()
        };
        let model = train(&lines, &params).expect("train");
        let sim = crate::embedding::cosine_similarity;
        let git_pair = sim(&model.encode("git status"), &model.encode("git diff"));
        let cross_pair = sim(&model.encode("git status"), &model.encode("docker images"));
        assert!(
            git_pair > cross_pair,
            "git commands should cluster ({} vs {})",
            git_pair,
            cross_pair
        );
    }
}
