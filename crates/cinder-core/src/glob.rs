//! Path globs and workspace file hashing.

use sha2::{Digest, Sha256};
use std::path::Path;

/// Glob match where `*` and `?` stay within one path segment and `**` spans segments.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob(&pattern, &text)
}

fn glob(pattern: &[char], text: &[char]) -> bool {
    match pattern {
        [] => text.is_empty(),
        ['*', '*', rest @ ..] => {
            // `**/` also matches zero directories.
            if let ['/', after @ ..] = rest
                && glob(after, text)
            {
                return true;
            }
            (0..=text.len()).any(|i| glob(rest, &text[i..]))
        }
        ['*', rest @ ..] => (0..=text.len())
            .take_while(|&i| i == 0 || text[i - 1] != '/')
            .any(|i| glob(rest, &text[i..])),
        ['?', rest @ ..] => matches!(text, [c, ..] if *c != '/') && glob(rest, &text[1..]),
        [c, rest @ ..] => text.first() == Some(c) && glob(rest, &text[1..]),
    }
}

/// Hex SHA-256 over the files under `root` matching any of `patterns`.
///
/// Files are visited in sorted relative-path order and each contributes the digest of its
/// contents. Returns an empty string when no file matches.
pub fn hash_files(root: &Path, patterns: &[String]) -> String {
    let patterns: Vec<&str> = patterns
        .iter()
        .map(|p| p.trim().trim_start_matches("./"))
        .filter(|p| !p.is_empty())
        .collect();

    let mut files = Vec::new();
    walk(root, "", &mut files);
    files.sort();

    let mut hasher = Sha256::new();
    let mut matched = false;
    for relative in files {
        if !patterns.iter().any(|p| glob_match(p, &relative)) {
            continue;
        }
        // Unreadable files are left out of the hash.
        if let Ok(data) = std::fs::read(root.join(&relative)) {
            hasher.update(Sha256::digest(&data));
            matched = true;
        }
    }

    if matched {
        hex::encode(hasher.finalize())
    } else {
        String::new()
    }
}

/// Collect regular files as `/`-separated paths relative to the walk root.
fn walk(dir: &Path, prefix: &str, files: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        if file_type.is_dir() {
            walk(&entry.path(), &relative, files);
        } else if file_type.is_file() {
            files.push(relative);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("main", "main"));
        assert!(!glob_match("main", "develop"));
        assert!(glob_match("feature/*", "feature/foo"));
        assert!(!glob_match("feature/*", "feature/foo/bar"));
        assert!(glob_match("release/**", "release/v1/hotfix"));
        assert!(glob_match("**/*.rs", "src/lib.rs"));
        assert!(glob_match("**/*.rs", "lib.rs"));
        assert!(glob_match("v?.*", "v1.2"));
    }

    fn write(root: &Path, path: &str, content: &str) {
        let file = root.join(path);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(file, content).unwrap();
    }

    #[test]
    fn test_hash_files_tracks_contents() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Cargo.lock", "a");
        write(dir.path(), "crates/x/Cargo.lock", "b");
        write(dir.path(), "src/main.rs", "fn main() {}");

        let patterns = vec!["**/Cargo.lock".to_string()];
        let first = hash_files(dir.path(), &patterns);
        assert_eq!(first.len(), 64);
        assert_eq!(first, hash_files(dir.path(), &["./**/Cargo.lock".to_string()]));

        // Files outside the patterns do not matter.
        write(dir.path(), "src/main.rs", "fn main() { panic!() }");
        assert_eq!(hash_files(dir.path(), &patterns), first);

        write(dir.path(), "crates/x/Cargo.lock", "c");
        assert_ne!(hash_files(dir.path(), &patterns), first);
    }

    #[test]
    fn test_hash_files_without_match_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "README.md", "hi");
        assert_eq!(hash_files(dir.path(), &["*.lock".to_string()]), "");
        assert_eq!(hash_files(&dir.path().join("missing"), &["**".to_string()]), "");
    }
}
