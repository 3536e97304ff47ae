use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// A local (non-top-level) name occurrence.
///
/// The definition reference is weak: deleting the definition nulls it out,
/// deleting the file removes the symbol entirely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolOccurrence {
    pub id: String,
    pub file_id: String,
    pub definition_id: Option<String>,
    pub name: String,
    pub kind: String,
    pub line: i64,
    pub column: i64,
    pub scope: String,
}

impl SymbolOccurrence {
    pub fn new(
        id: impl Into<String>,
        file_id: impl Into<String>,
        name: impl Into<String>,
        kind: impl Into<String>,
        line: i64,
        column: i64,
    ) -> Self {
        Self {
            id: id.into(),
            file_id: file_id.into(),
            definition_id: None,
            name: name.into(),
            kind: kind.into(),
            line,
            column,
            scope: String::new(),
        }
    }

    pub fn with_definition(mut self, definition_id: impl Into<String>) -> Self {
        self.definition_id = Some(definition_id.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StoreError::validation("Symbol id cannot be empty"));
        }
        if self.file_id.trim().is_empty() {
            return Err(StoreError::validation("Symbol file_id cannot be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(StoreError::validation("Symbol name cannot be empty"));
        }
        if self.line < 1 || self.column < 1 {
            return Err(StoreError::validation("Symbol position must be 1-based"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_symbol() {
        let symbol = SymbolOccurrence::new("s1", "f1", "count", "variable", 5, 9)
            .with_definition("d1")
            .with_scope("handleRequest");
        assert!(symbol.validate().is_ok());
        assert_eq!(symbol.definition_id.as_deref(), Some("d1"));
    }

    #[test]
    fn test_symbol_without_definition_is_valid() {
        let symbol = SymbolOccurrence::new("s1", "f1", "x", "variable", 1, 1);
        assert!(symbol.validate().is_ok());
        assert!(symbol.definition_id.is_none());
    }

    #[test]
    fn test_invalid_position_rejected() {
        let symbol = SymbolOccurrence::new("s1", "f1", "x", "variable", 0, 0);
        assert!(symbol.validate().is_err());
    }
}
