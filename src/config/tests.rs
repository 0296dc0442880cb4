//! Configuration loading tests

use super::*;
use crate::privacy::PrivacyAction;

fn parse(toml_str: &str) -> Config {
    let file: FileConfig = toml::from_str(toml_str).expect("test TOML parses");
    Config::from_file_config(file)
}

#[test]
fn test_defaults() {
    let config = parse("");
    assert_eq!(config.embedding.dim, 128);
    assert_eq!(config.ann.trees, 10);
    assert_eq!(config.ann.metric, "angular");
    assert_eq!(config.suggest.max, 5);
    assert!((config.suggest.min_confidence - 0.3).abs() < 1e-9);
    assert_eq!(config.retention_days, 90);
    assert_eq!(config.rolling_corpus.max_lines, 10_000);
    assert_eq!(config.retrain.min_new_events, 500);
    assert_eq!(config.protocol.framing, Framing::LengthPrefixed);
    assert_eq!(config.safety.level, SafetyLevel::Annotate);
}

#[test]
fn test_top_level_options() {
    let config = parse(
        r#"
        embedding_dim = 64
        retention_days = 30
        "#,
    );
    assert_eq!(config.embedding.dim, 64);
    assert_eq!(config.retention_days, 30);
}

#[test]
fn test_sections() {
    let config = parse(
        r#"
        [suggest]
        max = 8
        min_confidence = 0.5

        [ann]
        trees = 20

        [rolling_corpus]
        max_lines = 5000

        [retrain]
        min_new_events = 100

        [protocol]
        framing = "newline"
        "#,
    );
    assert_eq!(config.suggest.max, 8);
    assert!((config.suggest.min_confidence - 0.5).abs() < 1e-9);
    assert_eq!(config.ann.trees, 20);
    assert_eq!(config.rolling_corpus.max_lines, 5000);
    assert_eq!(config.retrain.min_new_events, 100);
    assert_eq!(config.protocol.framing, Framing::NewlineDelimited);
}

#[test]
fn test_invalid_values_fall_back() {
    let config = parse(
        r#"
        embedding_dim = 2
        retention_days = 0

        [suggest]
        max = 0
        min_confidence = 3.5

        [ann]
        trees = 0
        metric = "euclidean"

        [safety]
        level = "nonsense"
        "#,
    );
    assert_eq!(config.embedding.dim, 128);
    assert_eq!(config.retention_days, 90);
    assert_eq!(config.suggest.max, 5);
    assert!((config.suggest.min_confidence - 0.3).abs() < 1e-9);
    assert_eq!(config.ann.trees, 10);
    assert_eq!(config.ann.metric, "angular");
    assert_eq!(config.safety.level, SafetyLevel::Annotate);
}

#[test]
fn test_privacy_patterns_both_shapes() {
    let config = parse(
        r#"
        [privacy]
        excluded_paths = ["/home/u/work/secrets"]
        excluded_patterns = [
            "plain-redact",
            { pattern = "dropped-thing", action = "drop" },
        ]
        "#,
    );
    assert_eq!(config.privacy.excluded_paths, vec!["/home/u/work/secrets"]);
    assert_eq!(config.privacy.excluded_patterns.len(), 2);
    assert_eq!(config.privacy.excluded_patterns[0].action, PrivacyAction::Redact);
    assert_eq!(config.privacy.excluded_patterns[1].action, PrivacyAction::Drop);
}

#[test]
fn test_oversized_privacy_pattern_ignored() {
    let long = "a".repeat(1_500);
    let config = parse(&format!(
        r#"
        [privacy]
        excluded_patterns = ["{}"]
        "#,
        long
    ));
    assert!(config.privacy.excluded_patterns.is_empty());
}

#[test]
fn test_safety_block_downgrades_to_annotate() {
    let config = parse(
        r#"
        [safety]
        level = "block"
        "#,
    );
    assert_eq!(config.safety.level, SafetyLevel::Annotate);
}
