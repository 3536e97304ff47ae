use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// A top-level symbol extracted from a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Definition {
    pub id: String,
    pub file_id: String,
    pub name: String,
    /// Kind tag, e.g. "function", "class", "variable"
    pub kind: String,
    /// 1-based position
    pub line: i64,
    pub column: i64,
    pub exported: bool,
    pub docstring: Option<String>,
    pub decorators: Option<String>,
    pub signature: Option<String>,
}

impl Definition {
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
            name: name.into(),
            kind: kind.into(),
            line,
            column,
            exported: false,
            docstring: None,
            decorators: None,
            signature: None,
        }
    }

    pub fn exported(mut self) -> Self {
        self.exported = true;
        self
    }

    pub fn with_docstring(mut self, docstring: impl Into<String>) -> Self {
        self.docstring = Some(docstring.into());
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StoreError::validation("Definition id cannot be empty"));
        }
        if self.file_id.trim().is_empty() {
            return Err(StoreError::validation("Definition file_id cannot be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(StoreError::validation("Definition name cannot be empty"));
        }
        if self.kind.trim().is_empty() {
            return Err(StoreError::validation("Definition kind cannot be empty"));
        }
        if self.line < 1 || self.column < 1 {
            return Err(StoreError::validation(
                "Definition position must be 1-based",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_definition() {
        let def = Definition::new("d1", "f1", "handleRequest", "function", 10, 1)
            .exported()
            .with_signature("(req: Request) => Response");
        assert!(def.validate().is_ok());
        assert!(def.exported);
    }

    #[test]
    fn test_zero_based_position_rejected() {
        let def = Definition::new("d1", "f1", "x", "variable", 0, 1);
        assert!(def.validate().is_err());

        let def = Definition::new("d1", "f1", "x", "variable", 1, 0);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_empty_fields_rejected() {
        assert!(Definition::new("", "f1", "x", "variable", 1, 1).validate().is_err());
        assert!(Definition::new("d1", "", "x", "variable", 1, 1).validate().is_err());
        assert!(Definition::new("d1", "f1", "", "variable", 1, 1).validate().is_err());
        assert!(Definition::new("d1", "f1", "x", "", 1, 1).validate().is_err());
    }
}
