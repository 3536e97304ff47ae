use crate::config::MAX_CACHE_SIZE;
use crate::error::{Result, StoreError};
use crate::monitor::degradation::{Capability, DegradationManager};
use crate::query::builder::{validate_identifier, SortOrder};
use crate::storage::models::FileRecord;
use crate::storage::service::DatabaseService;
use rusqlite::{params, Row, ToSql};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Sort keys accepted by `list`. Anything else fails validation before any
/// SQL is composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    IndexedAt,
    LastModified,
    Size,
    Filename,
}

impl SortKey {
    pub fn as_column(&self) -> &'static str {
        match self {
            SortKey::IndexedAt => "indexed_at",
            SortKey::LastModified => "last_modified",
            SortKey::Size => "size",
            SortKey::Filename => "filename",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "indexed_at" => Ok(SortKey::IndexedAt),
            "last_modified" => Ok(SortKey::LastModified),
            "size" => Ok(SortKey::Size),
            "filename" => Ok(SortKey::Filename),
            other => Err(StoreError::validation(format!(
                "unknown sort field: {other}"
            ))),
        }
    }
}

/// Options for `list`.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub language: Option<String>,
    pub extension: Option<String>,
    /// Substring match on the path
    pub path_pattern: Option<String>,
    pub sort_by: Option<SortKey>,
    pub sort_order: Option<SortOrder>,
}

/// Partial update restricted to the mutable field allow-list.
#[derive(Debug, Clone, Default)]
pub struct FileUpdate {
    pub filename: Option<String>,
    pub extension: Option<String>,
    pub size: Option<i64>,
    pub last_modified: Option<i64>,
    pub hash: Option<String>,
    pub language: Option<String>,
    pub indexed_at: Option<i64>,
}

impl FileUpdate {
    fn is_empty(&self) -> bool {
        self.filename.is_none()
            && self.extension.is_none()
            && self.size.is_none()
            && self.last_modified.is_none()
            && self.hash.is_none()
            && self.language.is_none()
            && self.indexed_at.is_none()
    }

    fn validate(&self) -> Result<()> {
        if let Some(size) = self.size {
            if size < 0 {
                return Err(StoreError::validation("File size cannot be negative"));
            }
        }
        if let Some(ts) = self.last_modified {
            if ts < 0 {
                return Err(StoreError::validation(
                    "File last_modified cannot be negative",
                ));
            }
        }
        if let Some(ts) = self.indexed_at {
            if ts < 0 {
                return Err(StoreError::validation("File indexed_at cannot be negative"));
            }
        }
        if let Some(hash) = &self.hash {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(StoreError::validation(
                    "Hash must be a valid SHA-256 digest (64 hexadecimal characters)",
                ));
            }
        }
        Ok(())
    }
}

/// Per-item failure inside a batch.
#[derive(Debug, Clone)]
pub struct BatchError {
    pub id: String,
    pub error: String,
}

/// Outcome of a batch save or delete.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub success: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub errors: Vec<BatchError>,
}

const SELECT_COLUMNS: &str =
    "id, path, filename, extension, size, last_modified, hash, language, indexed_at";

fn map_file_record(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        filename: row.get(2)?,
        extension: row.get(3)?,
        size: row.get(4)?,
        last_modified: row.get(5)?,
        hash: row.get(6)?,
        language: row.get(7)?,
        indexed_at: row.get(8)?,
    })
}

/// CRUD and batched upsert/delete over the `files` entity.
pub struct FileRepository {
    service: Arc<DatabaseService>,
    degradation: Option<Arc<DegradationManager>>,
}

impl FileRepository {
    pub fn new(service: Arc<DatabaseService>) -> Self {
        Self {
            service,
            degradation: None,
        }
    }

    /// Wires the capability gate consulted before load-sensitive batches.
    pub fn with_degradation(mut self, degradation: Arc<DegradationManager>) -> Self {
        self.degradation = Some(degradation);
        self
    }

    fn require_capability(&self, capability: Capability) -> Result<()> {
        if let Some(manager) = &self.degradation {
            if !manager.is_capability_available(capability) {
                return Err(StoreError::resource_exhausted(
                    format!("{} capability is currently degraded", capability.as_str()),
                    Some(30_000),
                ));
            }
        }
        Ok(())
    }

    /// INSERT-OR-REPLACE keyed on the primary key. Validation runs before
    /// any write.
    pub fn save(&self, record: &FileRecord) -> Result<()> {
        record.validate()?;
        self.service.execute_run(
            "INSERT OR REPLACE INTO files (id, path, filename, extension, size, last_modified, hash, language, indexed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            &[
                &record.id,
                &record.path,
                &record.filename,
                &record.extension,
                &record.size,
                &record.last_modified,
                &record.hash,
                &record.language,
                &record.indexed_at,
            ],
        )?;
        debug!(id = %record.id, path = %record.path, "file saved");
        Ok(())
    }

    pub fn find_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        self.service.execute_one(
            &format!("SELECT {SELECT_COLUMNS} FROM files WHERE path = ?1"),
            &[&path],
            map_file_record,
        )
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<FileRecord>> {
        self.service.execute_one(
            &format!("SELECT {SELECT_COLUMNS} FROM files WHERE id = ?1"),
            &[&id],
            map_file_record,
        )
    }

    /// Dynamic UPDATE built from the field allow-list only. Fails when the
    /// path matches no row.
    pub fn update(&self, path: &str, changes: &FileUpdate) -> Result<()> {
        changes.validate()?;
        if changes.is_empty() {
            // Nothing to write; still report a missing row
            if self.find_by_path(path)?.is_none() {
                return Err(StoreError::validation(format!("no file at path {path}")));
            }
            return Ok(());
        }

        fn push(
            column: &str,
            value: Box<dyn ToSql + Send>,
            sets: &mut Vec<String>,
            values: &mut Vec<Box<dyn ToSql + Send>>,
        ) {
            values.push(value);
            sets.push(format!("{column} = ?{}", values.len()));
        }

        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql + Send>> = Vec::new();

        if let Some(v) = &changes.filename {
            push("filename", Box::new(v.clone()), &mut sets, &mut values);
        }
        if let Some(v) = &changes.extension {
            push("extension", Box::new(v.clone()), &mut sets, &mut values);
        }
        if let Some(v) = changes.size {
            push("size", Box::new(v), &mut sets, &mut values);
        }
        if let Some(v) = changes.last_modified {
            push("last_modified", Box::new(v), &mut sets, &mut values);
        }
        if let Some(v) = &changes.hash {
            push("hash", Box::new(v.clone()), &mut sets, &mut values);
        }
        if let Some(v) = &changes.language {
            push("language", Box::new(v.clone()), &mut sets, &mut values);
        }
        if let Some(v) = changes.indexed_at {
            push("indexed_at", Box::new(v), &mut sets, &mut values);
        }

        values.push(Box::new(path.to_string()));
        let sql = format!(
            "UPDATE files SET {} WHERE path = ?{}",
            sets.join(", "),
            values.len()
        );
        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref() as &dyn ToSql).collect();
        let result = self.service.execute_run(&sql, &refs)?;
        if result.changes == 0 {
            return Err(StoreError::validation(format!("no file at path {path}")));
        }
        Ok(())
    }

    /// Deletes a file; dependents cascade at the database layer. Returns
    /// whether a row existed.
    pub fn delete(&self, path: &str) -> Result<bool> {
        let result = self
            .service
            .execute_run("DELETE FROM files WHERE path = ?1", &[&path])?;
        Ok(result.changes > 0)
    }

    pub fn count(&self) -> Result<i64> {
        Ok(self
            .service
            .execute_one("SELECT COUNT(*) FROM files", &[], |row| row.get(0))?
            .unwrap_or(0))
    }

    /// Lists files with filters, sorting, and pagination. WHERE clauses are
    /// composed with positional parameters only.
    pub fn list(&self, options: &ListOptions) -> Result<Vec<FileRecord>> {
        let sort_key = options.sort_by.unwrap_or(SortKey::IndexedAt);
        let sort_order = options.sort_order.unwrap_or(SortOrder::Desc);
        validate_identifier(sort_key.as_column())?;

        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql + Send>> = Vec::new();

        if let Some(language) = &options.language {
            values.push(Box::new(language.clone()));
            conditions.push(format!("language = ?{}", values.len()));
        }
        if let Some(extension) = &options.extension {
            values.push(Box::new(extension.clone()));
            conditions.push(format!("extension = ?{}", values.len()));
        }
        if let Some(pattern) = &options.path_pattern {
            values.push(Box::new(format!("%{pattern}%")));
            conditions.push(format!("path LIKE ?{}", values.len()));
        }

        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM files");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY {} {}",
            sort_key.as_column(),
            sort_order.as_str()
        ));

        values.push(Box::new(options.limit.unwrap_or(i64::MAX).max(0)));
        sql.push_str(&format!(" LIMIT ?{}", values.len()));
        values.push(Box::new(options.offset.unwrap_or(0).max(0)));
        sql.push_str(&format!(" OFFSET ?{}", values.len()));

        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref() as &dyn ToSql).collect();
        self.service.execute_query(&sql, &refs, map_file_record)
    }

    /// Saves records in chunks, one transaction per chunk. Invalid items are
    /// collected into `errors`; the rest proceed.
    pub fn save_batch(&self, records: &[FileRecord]) -> Result<BatchResult> {
        self.require_capability(Capability::Indexing)?;
        let started = Instant::now();
        let mut outcome = BatchResult::default();

        for chunk in records.chunks(MAX_CACHE_SIZE) {
            let mut valid: Vec<&FileRecord> = Vec::with_capacity(chunk.len());
            for record in chunk {
                match record.validate() {
                    Ok(()) => valid.push(record),
                    Err(err) => {
                        outcome.failed += 1;
                        outcome.errors.push(BatchError {
                            id: record.id.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
            if valid.is_empty() {
                continue;
            }

            let saved = self.service.execute_transaction(|tx| {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT OR REPLACE INTO files (id, path, filename, extension, size, last_modified, hash, language, indexed_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    )
                    .map_err(StoreError::from)?;
                let mut saved = 0usize;
                for record in &valid {
                    stmt.execute(params![
                        record.id,
                        record.path,
                        record.filename,
                        record.extension,
                        record.size,
                        record.last_modified,
                        record.hash,
                        record.language,
                        record.indexed_at,
                    ])
                    .map_err(StoreError::from)?;
                    saved += 1;
                }
                Ok(saved)
            });

            match saved {
                Ok(count) => outcome.success += count,
                Err(err) => {
                    // The whole chunk rolled back
                    warn!(error = %err, chunk = valid.len(), "batch chunk failed");
                    outcome.failed += valid.len();
                    for record in &valid {
                        outcome.errors.push(BatchError {
                            id: record.id.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        Ok(outcome)
    }

    /// Deletes by path in chunked transactions. A non-existent path is not
    /// an error.
    pub fn delete_batch(&self, paths: &[String]) -> Result<BatchResult> {
        let started = Instant::now();
        let mut outcome = BatchResult::default();

        for chunk in paths.chunks(MAX_CACHE_SIZE) {
            let deleted = self.service.execute_transaction(|tx| {
                let mut stmt = tx
                    .prepare_cached("DELETE FROM files WHERE path = ?1")
                    .map_err(StoreError::from)?;
                let mut processed = 0usize;
                for path in chunk {
                    stmt.execute([path]).map_err(StoreError::from)?;
                    processed += 1;
                }
                Ok(processed)
            });

            match deleted {
                Ok(count) => outcome.success += count,
                Err(err) => {
                    outcome.failed += chunk.len();
                    for path in chunk {
                        outcome.errors.push(BatchError {
                            id: path.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        Ok(outcome)
    }
}
