//! Rolling training corpus
//!
//! A flat UTF-8 file, one tokenized command per line, append-only between
//! training cycles. After each cycle the file is capped to the most recent
//! N lines via an atomic rewrite, so it transiently holds up to 2N lines
//! but never more at rest.

use crate::util::restrict_file_permissions;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct RollingCorpus {
    path: PathBuf,
    max_lines: usize,
}

impl RollingCorpus {
    pub fn new(path: impl Into<PathBuf>, max_lines: usize) -> Self {
        Self {
            path: path.into(),
            max_lines: max_lines.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append lines to the corpus file. Empty lines are skipped.
    pub fn append(&self, lines: &[String]) -> std::io::Result<()> {
        if lines.iter().all(|l| l.trim().is_empty()) {
            return Ok(());
        }
        let created = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut w = BufWriter::new(file);
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            writeln!(w, "{}", line)?;
        }
        w.flush()?;
        if created {
            restrict_file_permissions(&self.path)?;
        }
        Ok(())
    }

    /// All corpus lines, oldest first. A missing file is an empty corpus.
    pub fn load(&self) -> std::io::Result<Vec<String>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let reader = BufReader::new(file);
        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    }

    pub fn line_count(&self) -> std::io::Result<usize> {
        Ok(self.load()?.len())
    }

    /// Trim the corpus to its most recent `max_lines` lines. Rewrites via
    /// a temp file and rename so a crash leaves either the old or the new
    /// file, never a torn one. Returns the retained lines.
    pub fn cap(&self) -> std::io::Result<Vec<String>> {
        let lines = self.load()?;
        if lines.len() <= self.max_lines {
            return Ok(lines);
        }

        let keep_from = lines.len() - self.max_lines;
        let kept: Vec<String> = lines[keep_from..].to_vec();

        let tmp_path = self.path.with_extension("corpus.tmp");
        {
            let file = std::fs::File::create(&tmp_path)?;
            let mut w = BufWriter::new(file);
            for line in &kept {
                writeln!(w, "{}", line)?;
            }
            w.flush()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        restrict_file_permissions(&self.path)?;
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let corpus = RollingCorpus::new(dir.path().join("embeddings.corpus"), 100);

        corpus
            .append(&["git status".to_string(), "".to_string(), "ls -la".to_string()])
            .expect("append");
        let lines = corpus.load().expect("load");
        assert_eq!(lines, vec!["git status", "ls -la"]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let corpus = RollingCorpus::new(dir.path().join("embeddings.corpus"), 100);
        assert!(corpus.load().expect("load").is_empty());
        assert_eq!(corpus.line_count().expect("count"), 0);
    }

    #[test]
    fn test_cap_keeps_most_recent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let corpus = RollingCorpus::new(dir.path().join("embeddings.corpus"), 3);

        let lines: Vec<String> = (0..10).map(|i| format!("command {}", i)).collect();
        corpus.append(&lines).expect("append");

        let kept = corpus.cap().expect("cap");
        assert_eq!(kept, vec!["command 7", "command 8", "command 9"]);
        assert_eq!(corpus.line_count().expect("count"), 3);

        // idempotent
        let again = corpus.cap().expect("cap again");
        assert_eq!(again.len(), 3);
    }
}
