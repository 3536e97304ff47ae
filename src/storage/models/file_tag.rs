use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// A weighted tag attached to a file. `(file_id, tag)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileTag {
    pub file_id: String,
    pub tag: String,
    pub weight: f64,
}

impl FileTag {
    pub fn new(file_id: impl Into<String>, tag: impl Into<String>, weight: f64) -> Self {
        Self {
            file_id: file_id.into(),
            tag: tag.into(),
            weight,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.file_id.trim().is_empty() {
            return Err(StoreError::validation("Tag file_id cannot be empty"));
        }
        if self.tag.trim().is_empty() {
            return Err(StoreError::validation("Tag cannot be empty"));
        }
        if !self.weight.is_finite() {
            return Err(StoreError::validation("Tag weight must be finite"));
        }
        Ok(())
    }
}
