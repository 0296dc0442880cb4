//! Shell-aware command tokenizer
//!
//! Splits a command line into a deterministic token stream that the
//! embedding model, the fingerprint generator and FTS normalization all
//! share. The tokenizer understands just enough shell to be useful:
//!
//! - single and double quotes group their content into one token
//! - backslash escapes the next character outside single quotes
//! - flag tokens (leading `-`) are preserved whole
//! - everything else is split on non-word characters, with each separator
//!   run kept as its own token
//!
//! Malformed input (an unterminated quote) falls back to a plain
//! whitespace split and sets the `malformed` flag; it never errors.

/// Classification of a single token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// A run of word characters (`[A-Za-z0-9_]`).
    Word,
    /// A whole token starting with `-` (e.g. `-la`, `--force`).
    Flag,
    /// A run of non-word, non-space characters kept as its own token.
    Separator,
    /// The contents of a quoted region, kept as one token.
    Quoted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub kind: TokenKind,
}

impl Token {
    fn new(text: impl Into<String>, kind: TokenKind) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }
}

/// Tokenizer output: the token sequence plus a malformed-input flag.
#[derive(Debug, Clone, Default)]
pub struct TokenStream {
    pub tokens: Vec<Token>,
    /// Set when an unterminated quote forced the whitespace fallback.
    pub malformed: bool,
}

impl TokenStream {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Token texts, in order.
    pub fn texts(&self) -> Vec<&str> {
        self.tokens.iter().map(|t| t.text.as_str()).collect()
    }

    /// The text fed to the embedding model and the FTS index: words, flags
    /// and quoted content joined by single spaces. Separator runs carry no
    /// semantic weight and are skipped.
    pub fn embedding_text(&self) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            if token.kind == TokenKind::Separator {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&token.text);
        }
        out
    }
}

/// A whitespace-delimited word plus whether any part of it was quoted or
/// escaped. This is the unit fingerprint masking operates on; `tokenize`
/// splits words further for the embedding model and FTS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    pub text: String,
    pub quoted: bool,
}

/// Quote-aware split into whitespace-delimited words. The second return
/// value is the malformed flag: on an unterminated quote the input is
/// whitespace-split instead.
pub fn words(command: &str) -> (Vec<Word>, bool) {
    match split_words(command) {
        Some(words) => (words, false),
        None => (
            command
                .split_whitespace()
                .map(|w| Word {
                    text: w.to_string(),
                    quoted: false,
                })
                .collect(),
            true,
        ),
    }
}

/// Tokenize a command line. Deterministic: identical inputs yield
/// identical streams.
pub fn tokenize(command: &str) -> TokenStream {
    let raw = match split_words(command) {
        Some(words) => words,
        None => return fallback_whitespace(command),
    };

    let mut tokens = Vec::new();
    for word in raw {
        if word.text.is_empty() {
            continue;
        }
        if word.quoted {
            tokens.push(Token::new(word.text, TokenKind::Quoted));
        } else if word.text.starts_with('-') {
            tokens.push(Token::new(word.text, TokenKind::Flag));
        } else {
            split_word(&word.text, &mut tokens);
        }
    }

    TokenStream {
        tokens,
        malformed: false,
    }
}

/// First pass: quote-aware split into whitespace-delimited words.
/// Returns `None` on an unterminated quote.
fn split_words(command: &str) -> Option<Vec<Word>> {
    #[derive(PartialEq)]
    enum State {
        Normal,
        Single,
        Double,
    }

    let mut words = Vec::new();
    let mut current = String::new();
    let mut current_quoted = false;
    let mut state = State::Normal;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '\'' => {
                    state = State::Single;
                    current_quoted = true;
                }
                '"' => {
                    state = State::Double;
                    current_quoted = true;
                }
                '\\' => {
                    // Escaped character: taken literally, or trailing backslash kept.
                    // Escaping is a quoting mechanism, so the word is kept whole.
                    current_quoted = true;
                    match chars.next() {
                        Some(escaped) => current.push(escaped),
                        None => current.push('\\'),
                    }
                }
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        words.push(Word {
                            text: std::mem::take(&mut current),
                            quoted: current_quoted,
                        });
                    }
                    current_quoted = false;
                }
                c => current.push(c),
            },
            State::Single => match c {
                '\'' => state = State::Normal,
                c => current.push(c),
            },
            State::Double => match c {
                '"' => state = State::Normal,
                '\\' => match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => current.push('\\'),
                },
                c => current.push(c),
            },
        }
    }

    if state != State::Normal {
        return None;
    }
    if !current.is_empty() {
        words.push(Word {
            text: current,
            quoted: current_quoted,
        });
    }
    Some(words)
}

/// Second pass for unquoted non-flag words: split into word-character runs
/// and separator runs, keeping both.
fn split_word(word: &str, tokens: &mut Vec<Token>) {
    let mut current = String::new();
    let mut current_is_word: Option<bool> = None;

    for c in word.chars() {
        let is_word = c.is_ascii_alphanumeric() || c == '_';
        match current_is_word {
            Some(prev) if prev == is_word => current.push(c),
            Some(prev) => {
                let kind = if prev { TokenKind::Word } else { TokenKind::Separator };
                tokens.push(Token::new(std::mem::take(&mut current), kind));
                current.push(c);
                current_is_word = Some(is_word);
            }
            None => {
                current.push(c);
                current_is_word = Some(is_word);
            }
        }
    }
    if let Some(is_word) = current_is_word {
        let kind = if is_word { TokenKind::Word } else { TokenKind::Separator };
        tokens.push(Token::new(current, kind));
    }
}

/// Fallback for malformed input: plain whitespace split, flags still
/// classified, no sub-word splitting.
fn fallback_whitespace(command: &str) -> TokenStream {
    let tokens = command
        .split_whitespace()
        .map(|w| {
            let kind = if w.starts_with('-') {
                TokenKind::Flag
            } else {
                TokenKind::Word
            };
            Token::new(w, kind)
        })
        .collect();
    TokenStream {
        tokens,
        malformed: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(stream: &TokenStream) -> Vec<String> {
        stream.tokens.iter().map(|t| t.text.clone()).collect()
    }

    #[test]
    fn test_simple_command() {
        let stream = tokenize("git status");
        assert_eq!(texts(&stream), vec!["git", "status"]);
        assert!(!stream.malformed);
    }

    #[test]
    fn test_flags_kept_whole() {
        let stream = tokenize("ls -la --color=auto");
        assert_eq!(texts(&stream), vec!["ls", "-la", "--color=auto"]);
        assert_eq!(stream.tokens[1].kind, TokenKind::Flag);
        assert_eq!(stream.tokens[2].kind, TokenKind::Flag);
    }

    #[test]
    fn test_separators_preserved() {
        let stream = tokenize("tar xf release.tar.gz");
        assert_eq!(
            texts(&stream),
            vec!["tar", "xf", "release", ".", "tar", ".", "gz"]
        );
        assert_eq!(stream.tokens[3].kind, TokenKind::Separator);
    }

    #[test]
    fn test_separator_runs_grouped() {
        let stream = tokenize("a=b//c");
        assert_eq!(texts(&stream), vec!["a", "=", "b", "//", "c"]);
    }

    #[test]
    fn test_double_quotes() {
        let stream = tokenize("git commit -m \"fix the bug\"");
        assert_eq!(texts(&stream), vec!["git", "commit", "-m", "fix the bug"]);
        assert_eq!(stream.tokens[3].kind, TokenKind::Quoted);
    }

    #[test]
    fn test_single_quotes_literal() {
        let stream = tokenize("echo 'a \"b\" c'");
        assert_eq!(texts(&stream), vec!["echo", "a \"b\" c"]);
    }

    #[test]
    fn test_backslash_escape() {
        // the escaped space joins the word
        let stream = tokenize("touch my\\ file");
        assert_eq!(texts(&stream), vec!["touch", "my file"]);
    }

    #[test]
    fn test_unterminated_quote_falls_back() {
        let stream = tokenize("echo \"oops");
        assert!(stream.malformed);
        assert_eq!(texts(&stream), vec!["echo", "\"oops"]);
    }

    #[test]
    fn test_deterministic() {
        let a = tokenize("docker run -it --rm ubuntu:22.04 /bin/bash");
        let b = tokenize("docker run -it --rm ubuntu:22.04 /bin/bash");
        assert_eq!(a.tokens, b.tokens);
    }

    #[test]
    fn test_empty_input() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_embedding_text_skips_separators() {
        let stream = tokenize("cd src/engine");
        assert_eq!(stream.embedding_text(), "cd src engine");
    }
}
