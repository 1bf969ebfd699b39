//! Cache key helpers.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of a blob.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn matches_prefix(key: &str, prefix: &str) -> bool {
    key.starts_with(prefix)
}

/// Make a key safe as a file name. A short digest of the original key keeps distinct
/// keys distinct after sanitizing.
pub fn sanitize_key(key: &str) -> String {
    let readable: String = key
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '_',
            _ => c,
        })
        .take(96)
        .collect();
    let digest = Sha256::digest(key.as_bytes());
    format!("{readable}-{}", hex::encode(&digest[..6]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_matches_prefix() {
        assert!(matches_prefix("cargo-linux-abc", "cargo-"));
        assert!(!matches_prefix("npm-abc", "cargo-"));
    }

    #[test]
    fn test_sanitize_key() {
        let a = sanitize_key("deps/linux:x64");
        assert!(a.starts_with("deps_linux_x64-"));
        assert_ne!(a, sanitize_key("deps_linux_x64"));
    }
}
