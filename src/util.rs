//! Shared utility functions

use std::path::Path;

/// Clip a string to a byte budget without splitting a UTF-8 character.
///
/// Returns the longest prefix of `s` whose encoded length fits in `budget`
/// bytes. Bounds encoder input for pathological command lines.
pub fn clip_to_char_boundary(s: &str, budget: usize) -> &str {
    if s.len() <= budget {
        return s;
    }
    let mut fits = 0;
    for (offset, c) in s.char_indices() {
        let next = offset + c.len_utf8();
        if next > budget {
            break;
        }
        fits = next;
    }
    &s[..fits]
}

/// Current wall-clock time as nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Whether `prefix` is a path-component-wise prefix of `path`.
///
/// `/home/u` is an ancestor of `/home/u/src`, but not of `/home/user`.
pub fn is_path_ancestor(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() || path.is_empty() {
        return false;
    }
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        // "/" is an ancestor of every absolute path
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Restrict a file to owner read/write (0600). No-op on non-Unix targets.
pub fn restrict_file_permissions(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Restrict a directory to owner access (0700). No-op on non-Unix targets.
pub fn restrict_dir_permissions(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Total size in bytes of the regular files directly inside `dir`.
///
/// The data directory is flat, so one level is enough.
pub fn dir_size_bytes(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}
