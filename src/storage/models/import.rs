use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// A module dependency of a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Import {
    pub id: String,
    pub file_id: String,
    pub module: String,
    /// Import form, e.g. "named", "default", "namespace"
    pub kind: String,
    pub alias: Option<String>,
    pub line: i64,
    pub column: i64,
}

impl Import {
    pub fn new(
        id: impl Into<String>,
        file_id: impl Into<String>,
        module: impl Into<String>,
        kind: impl Into<String>,
        line: i64,
        column: i64,
    ) -> Self {
        Self {
            id: id.into(),
            file_id: file_id.into(),
            module: module.into(),
            kind: kind.into(),
            alias: None,
            line,
            column,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StoreError::validation("Import id cannot be empty"));
        }
        if self.file_id.trim().is_empty() {
            return Err(StoreError::validation("Import file_id cannot be empty"));
        }
        if self.module.trim().is_empty() {
            return Err(StoreError::validation("Import module cannot be empty"));
        }
        if self.line < 1 || self.column < 1 {
            return Err(StoreError::validation("Import position must be 1-based"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_import() {
        let import = Import::new("i1", "f1", "react", "default", 1, 1).with_alias("React");
        assert!(import.validate().is_ok());
        assert_eq!(import.alias.as_deref(), Some("React"));
    }

    #[test]
    fn test_empty_module_rejected() {
        let import = Import::new("i1", "f1", "", "default", 1, 1);
        assert!(import.validate().is_err());
    }
}
