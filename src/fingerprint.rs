//! Command fingerprints
//!
//! A fingerprint is a stable identifier for a command *shape*: the command
//! with its argument values masked to placeholders, hashed. Two runs of
//! `git commit -m "..."` with different messages share a fingerprint, so
//! statistics and sequences aggregate across them.

use crate::tokenizer;
use sha2::{Digest, Sha256};

/// Placeholder for masked path-shaped arguments.
pub const PATH_MASK: &str = "\u{27e8}PATH\u{27e9}";
/// Placeholder for masked integer arguments.
pub const NUM_MASK: &str = "\u{27e8}N\u{27e9}";
/// Placeholder for masked quoted strings and flag values.
pub const STR_MASK: &str = "\u{27e8}STR\u{27e9}";

/// Separator between masked words inside the hashed byte stream. A control
/// character cannot appear in a token, so shapes never collide by joining.
const UNIT_SEP: char = '\u{1f}';

/// Compute the fingerprint of a command: lowercase hex of the first
/// 16 bytes of SHA-256 over the masked word stream.
pub fn fingerprint(command: &str) -> String {
    let masked = masked_shape(command);
    let mut hasher = Sha256::new();
    hasher.update(masked.as_bytes());
    let digest = hasher.finalize();
    hex_lower(&digest[..16])
}

/// The masked, human-readable shape the fingerprint hashes. Exposed so the
/// explain endpoint and tests can show what aggregated.
pub fn masked_shape(command: &str) -> String {
    let (words, _malformed) = tokenizer::words(command);
    let mut out = String::new();
    let mut prev_was_flag = false;

    for (i, word) in words.iter().enumerate() {
        if i > 0 {
            out.push(UNIT_SEP);
        }
        let masked = mask_word(&word.text, word.quoted, i, prev_was_flag);
        prev_was_flag = !word.quoted && word.text.starts_with('-');
        out.push_str(masked);
    }
    out
}

/// Mask one word. The command name (index 0) and flags stay verbatim;
/// quoted strings, integers, path-shaped words and flag values become
/// placeholders.
fn mask_word<'a>(text: &'a str, quoted: bool, index: usize, prev_was_flag: bool) -> &'a str {
    if index == 0 {
        return text;
    }
    if quoted {
        return STR_MASK;
    }
    if text.starts_with('-') {
        return text;
    }
    if is_integer(text) {
        return NUM_MASK;
    }
    if is_path_shaped(text) {
        return PATH_MASK;
    }
    if prev_was_flag {
        // value position after a flag, e.g. `-m msg` or `-n 3`
        return STR_MASK;
    }
    text
}

fn is_integer(text: &str) -> bool {
    let digits = text.strip_prefix('-').or_else(|| text.strip_prefix('+')).unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_path_shaped(text: &str) -> bool {
    text.contains('/') || text.starts_with('~') || text.starts_with('.')
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_across_calls() {
        assert_eq!(fingerprint("git status"), fingerprint("git status"));
    }

    #[test]
    fn test_distinct_subcommands() {
        assert_ne!(fingerprint("git status"), fingerprint("git stash"));
        assert_ne!(fingerprint("ls"), fingerprint("ll"));
    }

    #[test]
    fn test_quoted_values_aggregate() {
        assert_eq!(
            fingerprint("git commit -m \"fix parser\""),
            fingerprint("git commit -m \"another message\"")
        );
    }

    #[test]
    fn test_flag_values_aggregate() {
        // unquoted value after a flag is still a value position
        assert_eq!(
            fingerprint("git commit -m x"),
            fingerprint("git commit -m y")
        );
    }

    #[test]
    fn test_paths_aggregate() {
        assert_eq!(fingerprint("cat src/main.rs"), fingerprint("cat docs/README.md"));
        assert_eq!(fingerprint("git add ."), fingerprint("git add ./src"));
        assert_ne!(fingerprint("cat src/main.rs"), fingerprint("rm src/main.rs"));
    }

    #[test]
    fn test_integers_aggregate() {
        assert_eq!(fingerprint("head -n 20"), fingerprint("head -n 50"));
        assert_eq!(fingerprint("kill 1234"), fingerprint("kill 99"));
    }

    #[test]
    fn test_flags_distinguish() {
        assert_ne!(fingerprint("ls -l"), fingerprint("ls -a"));
    }

    #[test]
    fn test_masked_shape_readable() {
        let shape = masked_shape("git commit -m \"fix\"");
        assert!(shape.contains("git"));
        assert!(shape.contains("commit"));
        assert!(shape.contains("-m"));
        assert!(shape.contains(STR_MASK));
    }

    #[test]
    fn test_empty_command() {
        // zero tokens still produce a stable fingerprint for noise events
        assert_eq!(fingerprint(""), fingerprint("   "));
        assert_eq!(fingerprint("").len(), 32);
    }

    #[test]
    fn test_fingerprint_length() {
        assert_eq!(fingerprint("docker ps -a").len(), 32);
    }
}
