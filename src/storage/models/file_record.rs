use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One row per indexed source file.
///
/// `path` is unique; `(id, path)` form a bijection within a snapshot.
/// Deleting a file cascades to all dependent entities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    /// Opaque non-empty identifier, primary key
    pub id: String,
    /// Absolute or workspace-relative path, unique
    pub path: String,
    pub filename: String,
    pub extension: String,
    /// File size in bytes
    pub size: i64,
    /// Modification timestamp in milliseconds
    pub last_modified: i64,
    /// SHA-256 of the file content, 64 hex characters
    pub hash: String,
    pub language: String,
    /// Timestamp of the last indexing pass, in milliseconds
    pub indexed_at: i64,
}

impl FileRecord {
    /// Creates a record, deriving `filename` and `extension` from the path.
    pub fn new(
        id: impl Into<String>,
        path: impl Into<String>,
        size: i64,
        last_modified: i64,
        hash: impl Into<String>,
        language: impl Into<String>,
        indexed_at: i64,
    ) -> Self {
        let path = path.into();
        let filename = std::path::Path::new(&path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();
        let extension = std::path::Path::new(&path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        Self {
            id: id.into(),
            path,
            filename,
            extension,
            size,
            last_modified,
            hash: hash.into(),
            language: language.into(),
            indexed_at,
        }
    }

    /// Validates the record. Runs before any write reaches the database.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StoreError::validation("File id cannot be empty"));
        }
        if self.path.trim().is_empty() {
            return Err(StoreError::validation("File path cannot be empty"));
        }
        if self.size < 0 {
            return Err(StoreError::validation("File size cannot be negative"));
        }
        if self.last_modified < 0 {
            return Err(StoreError::validation(
                "File last_modified cannot be negative",
            ));
        }
        if self.indexed_at < 0 {
            return Err(StoreError::validation("File indexed_at cannot be negative"));
        }
        if !is_sha256_hex(&self.hash) {
            return Err(StoreError::validation(
                "Hash must be a valid SHA-256 digest (64 hexadecimal characters)",
            ));
        }
        Ok(())
    }

    /// True if the stored hash differs from a freshly computed one.
    pub fn needs_reindexing(&self, current_hash: &str, current_modified: i64) -> bool {
        !self.hash.eq_ignore_ascii_case(current_hash) || self.last_modified < current_modified
    }
}

fn is_sha256_hex(hash: &str) -> bool {
    hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit())
}

/// Canonical lowercase SHA-256 of file content, in the format the `hash`
/// column stores.
pub fn content_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileRecord {
        FileRecord::new(
            "f1",
            "/src/app.ts",
            1024,
            1_700_000_000_000,
            "a".repeat(64),
            "typescript",
            1_700_000_100_000,
        )
    }

    #[test]
    fn test_new_derives_filename_and_extension() {
        let record = sample();
        assert_eq!(record.filename, "app.ts");
        assert_eq!(record.extension, "ts");
    }

    #[test]
    fn test_valid_record_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_empty_id_rejected() {
        let mut record = sample();
        record.id = "  ".to_string();
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_empty_path_rejected() {
        let mut record = sample();
        record.path = String::new();
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_negative_numbers_rejected() {
        let mut record = sample();
        record.size = -1;
        assert!(record.validate().is_err());

        let mut record = sample();
        record.last_modified = -1;
        assert!(record.validate().is_err());

        let mut record = sample();
        record.indexed_at = -5;
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_hash_validation() {
        let mut record = sample();
        record.hash = "not-hex".to_string();
        let err = record.validate().unwrap_err();
        assert!(err.to_string().contains("Hash must be a valid SHA-256"));

        record.hash = "g".repeat(64);
        assert!(record.validate().is_err());

        // Uppercase hex is accepted
        record.hash = "A".repeat(64);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_content_hash_shape() {
        let hash = content_hash(b"hello world");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, content_hash(b"hello world"));
        assert_ne!(hash, content_hash(b"hello worlds"));
    }

    #[test]
    fn test_needs_reindexing() {
        let record = sample();
        assert!(!record.needs_reindexing(&record.hash.clone(), record.last_modified));
        assert!(record.needs_reindexing(&"b".repeat(64), record.last_modified));
        assert!(record.needs_reindexing(&record.hash.clone(), record.last_modified + 1));
    }
}
