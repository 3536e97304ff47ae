use crate::error::{Result, StoreError};
use rusqlite::ToSql;

/// Sort direction for ORDER BY clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }

    /// Parses a direction name. Unknown values are a validation error, never
    /// interpolated.
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "ASC" => Ok(SortOrder::Asc),
            "DESC" => Ok(SortOrder::Desc),
            other => Err(StoreError::validation(format!(
                "unknown sort order: {other}"
            ))),
        }
    }
}

/// Validates an identifier against the allow-list shape
/// `[A-Za-z_][A-Za-z0-9_]*`. Everything that is not an identifier goes
/// through positional parameters instead.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::validation(format!(
            "invalid identifier: {name:?}"
        )))
    }
}

/// Composes parameterized statements with identifier validation.
///
/// Identifiers (tables, columns, sort keys) are validated before they are
/// interpolated; values only ever travel as positional parameters.
pub struct QueryBuilder {
    table: String,
    columns: Vec<String>,
    conditions: Vec<String>,
    params: Vec<Box<dyn ToSql + Send>>,
    order_by: Option<(String, SortOrder)>,
    limit: Option<i64>,
    offset: Option<i64>,
    allowed_columns: Option<Vec<String>>,
}

impl QueryBuilder {
    /// Starts a SELECT over `table`.
    pub fn select(table: &str) -> Result<Self> {
        validate_identifier(table)?;
        Ok(Self {
            table: table.to_string(),
            columns: Vec::new(),
            conditions: Vec::new(),
            params: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
            allowed_columns: None,
        })
    }

    /// Restricts accepted column names to the given set.
    pub fn with_allowed_columns(mut self, columns: &[&str]) -> Self {
        self.allowed_columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    fn check_column(&self, column: &str) -> Result<()> {
        validate_identifier(column)?;
        if let Some(allowed) = &self.allowed_columns {
            if !allowed.iter().any(|c| c == column) {
                return Err(StoreError::validation(format!(
                    "column {column:?} is not in the allow-list"
                )));
            }
        }
        Ok(())
    }

    pub fn column(mut self, column: &str) -> Result<Self> {
        self.check_column(column)?;
        self.columns.push(column.to_string());
        Ok(self)
    }

    pub fn columns(mut self, columns: &[&str]) -> Result<Self> {
        for column in columns {
            self.check_column(column)?;
            self.columns.push(column.to_string());
        }
        Ok(self)
    }

    pub fn where_eq<V: ToSql + Send + 'static>(mut self, column: &str, value: V) -> Result<Self> {
        self.check_column(column)?;
        self.params.push(Box::new(value));
        self.conditions
            .push(format!("{column} = ?{}", self.params.len()));
        Ok(self)
    }

    /// Adds `column LIKE '%value%'`; the wildcard wrapping happens in the
    /// parameter, never in the SQL text.
    pub fn where_contains(mut self, column: &str, value: &str) -> Result<Self> {
        self.check_column(column)?;
        self.params.push(Box::new(format!("%{value}%")));
        self.conditions
            .push(format!("{column} LIKE ?{}", self.params.len()));
        Ok(self)
    }

    pub fn where_ge<V: ToSql + Send + 'static>(mut self, column: &str, value: V) -> Result<Self> {
        self.check_column(column)?;
        self.params.push(Box::new(value));
        self.conditions
            .push(format!("{column} >= ?{}", self.params.len()));
        Ok(self)
    }

    pub fn where_le<V: ToSql + Send + 'static>(mut self, column: &str, value: V) -> Result<Self> {
        self.check_column(column)?;
        self.params.push(Box::new(value));
        self.conditions
            .push(format!("{column} <= ?{}", self.params.len()));
        Ok(self)
    }

    pub fn order_by(mut self, column: &str, order: SortOrder) -> Result<Self> {
        self.check_column(column)?;
        self.order_by = Some((column.to_string(), order));
        Ok(self)
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit.max(0));
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset.max(0));
        self
    }

    /// Produces the SQL text and its positional parameters.
    pub fn build(mut self) -> (String, Vec<Box<dyn ToSql + Send>>) {
        let projection = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        let mut sql = format!("SELECT {projection} FROM {}", self.table);
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.conditions.join(" AND "));
        }
        if let Some((column, order)) = &self.order_by {
            sql.push_str(&format!(" ORDER BY {column} {}", order.as_str()));
        }
        if let Some(limit) = self.limit {
            self.params.push(Box::new(limit));
            sql.push_str(&format!(" LIMIT ?{}", self.params.len()));
        }
        if let Some(offset) = self.offset {
            self.params.push(Box::new(offset));
            sql.push_str(&format!(" OFFSET ?{}", self.params.len()));
        }
        (sql, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("files").is_ok());
        assert!(validate_identifier("last_modified").is_ok());
        assert!(validate_identifier("_private").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1files").is_err());
        assert!(validate_identifier("files; DROP TABLE files").is_err());
        assert!(validate_identifier("na me").is_err());
        assert!(validate_identifier("name--").is_err());
    }

    #[test]
    fn test_sort_order_parse() {
        assert_eq!(SortOrder::parse("asc").unwrap(), SortOrder::Asc);
        assert_eq!(SortOrder::parse("DESC").unwrap(), SortOrder::Desc);
        assert!(SortOrder::parse("sideways").is_err());
    }

    #[test]
    fn test_simple_select() {
        let (sql, params) = QueryBuilder::select("files").unwrap().build();
        assert_eq!(sql, "SELECT * FROM files");
        assert!(params.is_empty());
    }

    #[test]
    fn test_full_query_shape() {
        let (sql, params) = QueryBuilder::select("files")
            .unwrap()
            .columns(&["id", "path", "size"])
            .unwrap()
            .where_eq("language", "rust")
            .unwrap()
            .where_ge("size", 100_i64)
            .unwrap()
            .order_by("size", SortOrder::Desc)
            .unwrap()
            .limit(10)
            .offset(5)
            .build();
        assert_eq!(
            sql,
            "SELECT id, path, size FROM files WHERE language = ?1 AND size >= ?2 ORDER BY size DESC LIMIT ?3 OFFSET ?4"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_contains_wraps_parameter_not_sql() {
        let (sql, params) = QueryBuilder::select("files")
            .unwrap()
            .where_contains("path", "src")
            .unwrap()
            .build();
        assert_eq!(sql, "SELECT * FROM files WHERE path LIKE ?1");
        assert_eq!(params.len(), 1);
        assert!(!sql.contains('%'));
    }

    #[test]
    fn test_malicious_identifiers_rejected() {
        assert!(QueryBuilder::select("files; DROP TABLE files").is_err());
        let builder = QueryBuilder::select("files").unwrap();
        assert!(builder.where_eq("path = '' OR 1=1 --", "x").is_err());
    }

    #[test]
    fn test_allow_list_enforced() {
        let builder = QueryBuilder::select("files")
            .unwrap()
            .with_allowed_columns(&["id", "path"]);
        assert!(builder.where_eq("hash", "x").is_err());

        let builder = QueryBuilder::select("files")
            .unwrap()
            .with_allowed_columns(&["id", "path"]);
        assert!(builder.where_eq("path", "/a.ts").is_ok());
    }

    #[test]
    fn test_negative_limit_clamped() {
        let (sql, params) = QueryBuilder::select("files").unwrap().limit(-5).build();
        assert!(sql.ends_with("LIMIT ?1"));
        assert_eq!(params.len(), 1);
    }
}
