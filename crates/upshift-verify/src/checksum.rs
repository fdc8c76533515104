use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256, Sha512};
use upshift_core::HashAlgorithm;

/// Why a downloaded patch archive was rejected. Callers branch on this to
/// drive the partial-to-complete fallback, so it is a typed result rather
/// than an opaque error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyFailure {
    SizeMismatch { expected: u64, actual: u64 },
    HashMismatch { expected: String, actual: String },
    Unreadable(String),
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: expected {expected} bytes, got {actual}")
            }
            Self::HashMismatch { expected, actual } => {
                write!(f, "hash mismatch: expected {expected}, got {actual}")
            }
            Self::Unreadable(detail) => write!(f, "archive unreadable: {detail}"),
        }
    }
}

/// Validates a downloaded patch archive before it may be applied. The size
/// comparison is only a fast pre-check; the full file is always re-hashed.
pub fn verify_patch(
    path: &Path,
    expected_size: u64,
    algorithm: HashAlgorithm,
    expected_hash: &str,
) -> Result<(), VerifyFailure> {
    let metadata = fs::metadata(path).map_err(|err| VerifyFailure::Unreadable(err.to_string()))?;
    if metadata.len() != expected_size {
        return Err(VerifyFailure::SizeMismatch {
            expected: expected_size,
            actual: metadata.len(),
        });
    }

    let actual = hash_file_hex(path, algorithm)
        .map_err(|err| VerifyFailure::Unreadable(err.to_string()))?;
    if !actual.eq_ignore_ascii_case(expected_hash.trim()) {
        return Err(VerifyFailure::HashMismatch {
            expected: expected_hash.trim().to_ascii_lowercase(),
            actual,
        });
    }
    Ok(())
}

pub fn hash_file_hex(path: &Path, algorithm: HashAlgorithm) -> std::io::Result<String> {
    match algorithm {
        HashAlgorithm::Sha256 => hash_file::<Sha256>(path),
        HashAlgorithm::Sha512 => hash_file::<Sha512>(path),
    }
}

fn hash_file<D: Digest>(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = D::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn test_file(contents: &[u8]) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time")
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "upshift-verify-tests-{}-{}",
            std::process::id(),
            nanos
        ));
        fs::write(&path, contents).expect("must write test file");
        path
    }

    #[test]
    fn verify_accepts_matching_size_and_hash() {
        let path = test_file(b"hello");

        verify_patch(&path, 5, HashAlgorithm::Sha256, HELLO_SHA256)
            .expect("matching archive must verify");
        // Hash comparison is case-insensitive.
        verify_patch(
            &path,
            5,
            HashAlgorithm::Sha256,
            &HELLO_SHA256.to_ascii_uppercase(),
        )
        .expect("uppercase hash must verify");

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn verify_rejects_wrong_size_before_hashing() {
        let path = test_file(b"hello");

        let failure = verify_patch(&path, 99, HashAlgorithm::Sha256, HELLO_SHA256)
            .expect_err("wrong size must fail");
        assert_eq!(
            failure,
            VerifyFailure::SizeMismatch {
                expected: 99,
                actual: 5
            }
        );

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn verify_rejects_wrong_hash_even_when_size_matches() {
        let path = test_file(b"hellp");

        let failure = verify_patch(&path, 5, HashAlgorithm::Sha256, HELLO_SHA256)
            .expect_err("wrong hash must fail");
        assert!(
            matches!(failure, VerifyFailure::HashMismatch { .. }),
            "unexpected failure: {failure}"
        );

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn verify_reports_missing_file_as_unreadable() {
        let path = std::env::temp_dir().join("upshift-verify-missing-archive");
        let failure = verify_patch(&path, 5, HashAlgorithm::Sha256, HELLO_SHA256)
            .expect_err("missing file must fail");
        assert!(
            matches!(failure, VerifyFailure::Unreadable(_)),
            "unexpected failure: {failure}"
        );
    }

    #[test]
    fn sha512_hashes_are_supported() {
        let path = test_file(b"hello");
        let digest = hash_file_hex(&path, HashAlgorithm::Sha512).expect("must hash");
        assert_eq!(digest.len(), 128);
        let _ = fs::remove_file(&path);
    }
}
