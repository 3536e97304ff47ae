use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// A single ordered schema change with forward and reverse actions.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub up: String,
    pub down: String,
}

impl Migration {
    pub fn new(
        version: i64,
        name: impl Into<String>,
        up: impl Into<String>,
        down: impl Into<String>,
    ) -> Self {
        Self {
            version,
            name: name.into(),
            up: up.into(),
            down: down.into(),
        }
    }

    /// Content address of the migration definition. Drift between code and
    /// the applied schema is detected by comparing this against the stored
    /// value.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        hasher.update(self.name.as_bytes());
        hasher.update(self.up.as_bytes());
        hasher.update(self.down.as_bytes());
        hex_encode(&hasher.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A migration as recorded in `schema_migrations`.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    pub checksum: String,
    pub executed_at: DateTime<Utc>,
}

/// Ordered, checksummed schema migration engine.
///
/// All forward and reverse work happens inside a single transaction; partial
/// progress is impossible.
pub struct MigrationManager {
    migrations: Vec<Migration>,
}

impl MigrationManager {
    /// Creates an empty manager. Most callers want `with_builtin`.
    pub fn new() -> Self {
        Self {
            migrations: Vec::new(),
        }
    }

    /// Creates a manager pre-loaded with the engine schema catalog.
    pub fn with_builtin() -> Self {
        let mut manager = Self::new();
        for migration in builtin_migrations() {
            manager
                .add(migration)
                .expect("builtin migration catalog has duplicate versions");
        }
        manager
    }

    /// Registers a migration. Duplicate versions are a configuration error.
    pub fn add(&mut self, migration: Migration) -> Result<()> {
        if self.migrations.iter().any(|m| m.version == migration.version) {
            return Err(StoreError::configuration(format!(
                "duplicate migration version {}",
                migration.version
            )));
        }
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.version);
        Ok(())
    }

    pub fn registered(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn latest_version(&self) -> i64 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }

    /// Creates the `schema_migrations` table if absent.
    pub fn initialize(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                checksum TEXT NOT NULL,
                executed_at TEXT NOT NULL
            )
            "#,
        )
        .map_err(|e| StoreError::migration(format!("failed to create migration table: {e}"), None))
    }

    /// Highest applied version, or 0 for a fresh database.
    pub fn current_version(&self, conn: &Connection) -> Result<i64> {
        self.initialize(conn)?;
        let version: Option<i64> = conn
            .query_row(
                "SELECT MAX(version) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::from)?;
        Ok(version.unwrap_or(0))
    }

    /// Applied migration records, ascending by version.
    pub fn executed(&self, conn: &Connection) -> Result<Vec<MigrationRecord>> {
        self.initialize(conn)?;
        let mut stmt = conn
            .prepare(
                "SELECT version, name, checksum, executed_at FROM schema_migrations ORDER BY version",
            )
            .map_err(StoreError::from)?;
        let records = stmt
            .query_map([], |row| {
                let executed_at: String = row.get(3)?;
                Ok(MigrationRecord {
                    version: row.get(0)?,
                    name: row.get(1)?,
                    checksum: row.get(2)?,
                    executed_at: executed_at
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(StoreError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(records)
    }

    /// Registered migrations newer than the current version.
    pub fn pending(&self, conn: &Connection) -> Result<Vec<Migration>> {
        let current = self.current_version(conn)?;
        Ok(self
            .migrations
            .iter()
            .filter(|m| m.version > current)
            .cloned()
            .collect())
    }

    /// Applies every pending migration.
    pub fn migrate(&self, conn: &mut Connection) -> Result<i64> {
        self.migrate_to(conn, self.latest_version())
    }

    /// Migrates forward or backward to the target version.
    pub fn migrate_to(&self, conn: &mut Connection, target: i64) -> Result<i64> {
        self.initialize(conn)?;
        self.verify_checksums(conn)?;
        let current = self.current_version(conn)?;

        if target == current {
            return Ok(current);
        }
        if target > self.latest_version() {
            return Err(StoreError::configuration(format!(
                "target version {target} is not registered (latest is {})",
                self.latest_version()
            )));
        }

        if target > current {
            self.apply_up(conn, current, target)?;
        } else {
            self.apply_down(conn, current, target)?;
        }
        Ok(target)
    }

    /// Rolls back to the target version. The target must be below the
    /// current version.
    pub fn rollback(&self, conn: &mut Connection, target: i64) -> Result<i64> {
        let current = self.current_version(conn)?;
        if target >= current {
            return Err(StoreError::configuration(format!(
                "rollback target {target} is not below current version {current}"
            )));
        }
        self.migrate_to(conn, target)
    }

    /// Refuses to proceed when an applied record's checksum no longer
    /// matches the registered definition.
    fn verify_checksums(&self, conn: &Connection) -> Result<()> {
        for record in self.executed(conn)? {
            if let Some(migration) = self.migrations.iter().find(|m| m.version == record.version) {
                let expected = migration.checksum();
                if expected != record.checksum {
                    return Err(StoreError::migration(
                        format!(
                            "checksum mismatch for migration v{} ({}): definition drifted from the applied schema",
                            record.version, record.name
                        ),
                        Some(record.version),
                    ));
                }
            }
        }
        Ok(())
    }

    fn apply_up(&self, conn: &mut Connection, current: i64, target: i64) -> Result<()> {
        let pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.version > current && m.version <= target)
            .collect();

        let tx = conn
            .transaction()
            .map_err(|e| StoreError::migration(format!("failed to open transaction: {e}"), None))?;

        for migration in &pending {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT checksum FROM schema_migrations WHERE version = ?1",
                    [migration.version],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(StoreError::from(other)),
                })?;
            if let Some(checksum) = existing {
                if checksum != migration.checksum() {
                    return Err(StoreError::migration(
                        format!("checksum mismatch for migration v{}", migration.version),
                        Some(migration.version),
                    ));
                }
                continue;
            }

            debug!(version = migration.version, migration = %migration.name, "applying migration");
            tx.execute_batch(&migration.up).map_err(|e| {
                StoreError::migration(
                    format!("migration v{} ({}) failed: {e}", migration.version, migration.name),
                    Some(migration.version),
                )
            })?;
            tx.execute(
                "INSERT OR REPLACE INTO schema_migrations (version, name, checksum, executed_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    migration.version,
                    migration.name,
                    migration.checksum(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| {
                StoreError::migration(
                    format!("failed to record migration v{}: {e}", migration.version),
                    Some(migration.version),
                )
            })?;
        }

        tx.commit()
            .map_err(|e| StoreError::migration(format!("failed to commit migrations: {e}"), None))?;
        info!(version = target, count = pending.len(), "schema migrated forward");
        Ok(())
    }

    fn apply_down(&self, conn: &mut Connection, current: i64, target: i64) -> Result<()> {
        let mut downward: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.version > target && m.version <= current)
            .collect();
        downward.sort_by_key(|m| std::cmp::Reverse(m.version));

        let tx = conn
            .transaction()
            .map_err(|e| StoreError::migration(format!("failed to open transaction: {e}"), None))?;

        for migration in &downward {
            debug!(version = migration.version, migration = %migration.name, "reverting migration");
            tx.execute_batch(&migration.down).map_err(|e| {
                StoreError::migration(
                    format!(
                        "rollback of v{} ({}) failed: {e}",
                        migration.version, migration.name
                    ),
                    Some(migration.version),
                )
            })?;
            tx.execute(
                "DELETE FROM schema_migrations WHERE version = ?1",
                [migration.version],
            )
            .map_err(|e| {
                StoreError::migration(
                    format!("failed to delete migration record v{}: {e}", migration.version),
                    Some(migration.version),
                )
            })?;
        }

        tx.commit()
            .map_err(|e| StoreError::migration(format!("failed to commit rollback: {e}"), None))?;
        info!(version = target, count = downward.len(), "schema rolled back");
        Ok(())
    }
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// Migration V1: base tables for files and extracted structure.
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE files (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    filename TEXT NOT NULL DEFAULT '',
    extension TEXT NOT NULL DEFAULT '',
    size INTEGER NOT NULL DEFAULT 0,
    last_modified INTEGER NOT NULL DEFAULT 0,
    hash TEXT NOT NULL,
    language TEXT NOT NULL DEFAULT '',
    indexed_at INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX idx_files_path ON files(path);
CREATE INDEX idx_files_language ON files(language);

CREATE TABLE definitions (
    id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    line INTEGER NOT NULL,
    column INTEGER NOT NULL,
    exported INTEGER NOT NULL DEFAULT 0,
    docstring TEXT,
    decorators TEXT,
    signature TEXT,
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX idx_definitions_file_id ON definitions(file_id);
CREATE INDEX idx_definitions_type ON definitions(type);

CREATE TABLE imports (
    id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL,
    module TEXT NOT NULL,
    type TEXT NOT NULL,
    alias TEXT,
    line INTEGER NOT NULL,
    column INTEGER NOT NULL,
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX idx_imports_file_id ON imports(file_id);
CREATE INDEX idx_imports_module ON imports(module);

CREATE TABLE symbols (
    id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL,
    definition_id TEXT,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    line INTEGER NOT NULL,
    column INTEGER NOT NULL,
    scope TEXT NOT NULL DEFAULT '',
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE,
    FOREIGN KEY (definition_id) REFERENCES definitions(id) ON DELETE SET NULL
);

CREATE INDEX idx_symbols_file_id ON symbols(file_id);
CREATE INDEX idx_symbols_definition_id ON symbols(definition_id);
CREATE INDEX idx_symbols_name ON symbols(name);
"#;

const MIGRATION_V1_DOWN: &str = r#"
DROP TABLE IF EXISTS symbols;
DROP TABLE IF EXISTS imports;
DROP TABLE IF EXISTS definitions;
DROP TABLE IF EXISTS files;
"#;

/// Migration V2: weighted tags plus the inverted index and its sync
/// triggers. Field order in files_fts fixes the snippet column numbering:
/// 0=filename, 1=path, 2=definitions, 3=imports, 4=docstrings, 5=tags.
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE file_tags (
    file_id TEXT NOT NULL,
    tag TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 1.0,
    PRIMARY KEY (file_id, tag),
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX idx_file_tags_file_id ON file_tags(file_id);
CREATE INDEX idx_file_tags_tag ON file_tags(tag);
CREATE INDEX idx_file_tags_weight ON file_tags(weight);

CREATE VIRTUAL TABLE files_fts USING fts5(
    filename,
    path,
    definitions,
    imports,
    docstrings,
    tags,
    file_id UNINDEXED,
    tokenize = 'unicode61'
);

CREATE TRIGGER files_fts_insert AFTER INSERT ON files BEGIN
    DELETE FROM files_fts WHERE file_id = new.id;
    INSERT INTO files_fts (filename, path, definitions, imports, docstrings, tags, file_id)
    VALUES (
        new.filename,
        new.path,
        (SELECT COALESCE(GROUP_CONCAT(name, ' '), '') FROM definitions WHERE file_id = new.id),
        (SELECT COALESCE(GROUP_CONCAT(module, ' '), '') FROM imports WHERE file_id = new.id),
        (SELECT COALESCE(GROUP_CONCAT(docstring, ' '), '') FROM definitions WHERE file_id = new.id AND docstring IS NOT NULL),
        (SELECT COALESCE(GROUP_CONCAT(tag, ' '), '') FROM file_tags WHERE file_id = new.id),
        new.id
    );
END;

CREATE TRIGGER files_fts_update AFTER UPDATE ON files BEGIN
    DELETE FROM files_fts WHERE file_id = old.id;
    INSERT INTO files_fts (filename, path, definitions, imports, docstrings, tags, file_id)
    VALUES (
        new.filename,
        new.path,
        (SELECT COALESCE(GROUP_CONCAT(name, ' '), '') FROM definitions WHERE file_id = new.id),
        (SELECT COALESCE(GROUP_CONCAT(module, ' '), '') FROM imports WHERE file_id = new.id),
        (SELECT COALESCE(GROUP_CONCAT(docstring, ' '), '') FROM definitions WHERE file_id = new.id AND docstring IS NOT NULL),
        (SELECT COALESCE(GROUP_CONCAT(tag, ' '), '') FROM file_tags WHERE file_id = new.id),
        new.id
    );
END;

CREATE TRIGGER files_fts_delete AFTER DELETE ON files BEGIN
    DELETE FROM files_fts WHERE file_id = old.id;
END;

INSERT INTO files_fts (filename, path, definitions, imports, docstrings, tags, file_id)
SELECT
    f.filename,
    f.path,
    (SELECT COALESCE(GROUP_CONCAT(name, ' '), '') FROM definitions WHERE file_id = f.id),
    (SELECT COALESCE(GROUP_CONCAT(module, ' '), '') FROM imports WHERE file_id = f.id),
    (SELECT COALESCE(GROUP_CONCAT(docstring, ' '), '') FROM definitions WHERE file_id = f.id AND docstring IS NOT NULL),
    '',
    f.id
FROM files f;
"#;

const MIGRATION_V2_DOWN: &str = r#"
DROP TRIGGER IF EXISTS files_fts_delete;
DROP TRIGGER IF EXISTS files_fts_update;
DROP TRIGGER IF EXISTS files_fts_insert;
DROP TABLE IF EXISTS files_fts;
DROP TABLE IF EXISTS file_tags;
"#;

/// The engine's schema catalog.
pub fn builtin_migrations() -> Vec<Migration> {
    vec![
        Migration::new(1, "core_tables", MIGRATION_V1_UP, MIGRATION_V1_DOWN),
        Migration::new(2, "tags_and_search_index", MIGRATION_V2_UP, MIGRATION_V2_DOWN),
    ]
}
