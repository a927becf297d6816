use anyhow::{Context, Result};
use std::fmt;
use std::io::Read;
use std::path::Path;
use tracing::debug;

const BUFFER_SIZE: usize = 128 * 1024;

/// Reason a copied file failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchReason {
    /// BLAKE3 hash of source and destination differ
    HashMismatch,
    /// File exists in source but not in destination
    MissingInDestination,
}

impl fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HashMismatch => f.write_str("hash mismatch"),
            Self::MissingInDestination => f.write_str("missing in destination"),
        }
    }
}

/// Compare a copy against its source byte for byte.
///
/// Returns `Ok(None)` when both sides hash identically. Errors reading the
/// source are returned as `Err`; an unreadable destination counts as a
/// mismatch.
pub fn compare_copy(source: &Path, destination: &Path) -> Result<Option<MismatchReason>> {
    if !destination.exists() {
        return Ok(Some(MismatchReason::MissingInDestination));
    }

    let source_hash = hash_file(source)?;

    match hash_file(destination) {
        Ok(dest_hash) if dest_hash == source_hash => {
            debug!(file = %destination.display(), hash = %source_hash, "Copy verified");
            Ok(None)
        }
        Ok(_) => Ok(Some(MismatchReason::HashMismatch)),
        Err(e) => {
            debug!(
                file = %destination.display(),
                error = %e,
                "Failed to hash destination file"
            );
            Ok(Some(MismatchReason::HashMismatch))
        }
    }
}

/// Hash a file using BLAKE3, streaming in chunks to handle large files
pub fn hash_file(path: &Path) -> Result<blake3::Hash> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut reader = std::io::BufReader::with_capacity(BUFFER_SIZE, file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_hash_file_matches_in_memory_hash() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("data.bin");
        let content: Vec<u8> = (0..300 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        assert_eq!(hash_file(&path).unwrap(), blake3::hash(&content));
    }

    #[test]
    fn test_compare_copy_identical() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("a");
        let dst = temp.path().join("b");
        std::fs::write(&src, b"same bytes").unwrap();
        std::fs::write(&dst, b"same bytes").unwrap();

        assert_eq!(compare_copy(&src, &dst).unwrap(), None);
    }

    #[test]
    fn test_compare_copy_detects_corruption() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("a");
        let dst = temp.path().join("b");
        std::fs::write(&src, b"original content").unwrap();
        std::fs::write(&dst, b"corrupted content").unwrap();

        assert_eq!(
            compare_copy(&src, &dst).unwrap(),
            Some(MismatchReason::HashMismatch)
        );
    }

    #[test]
    fn test_compare_copy_missing_destination() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("a");
        std::fs::write(&src, b"content").unwrap();

        let reason = compare_copy(&src, &temp.path().join("missing")).unwrap();
        assert_eq!(reason, Some(MismatchReason::MissingInDestination));
        assert_eq!(reason.unwrap().to_string(), "missing in destination");
    }

    #[test]
    fn test_compare_copy_missing_source_is_error() {
        let temp = tempdir().unwrap();
        let dst = temp.path().join("b");
        std::fs::write(&dst, b"content").unwrap();

        assert!(compare_copy(&temp.path().join("missing"), &dst).is_err());
    }
}
