use crate::error::{Result, StoreError};
use crate::storage::models::{Definition, FileTag, Import, SymbolOccurrence};
use crate::storage::service::DatabaseService;
use rusqlite::{params, Row, Transaction};
use std::sync::Arc;
use tracing::debug;

fn map_definition(row: &Row<'_>) -> rusqlite::Result<Definition> {
    Ok(Definition {
        id: row.get(0)?,
        file_id: row.get(1)?,
        name: row.get(2)?,
        kind: row.get(3)?,
        line: row.get(4)?,
        column: row.get(5)?,
        exported: row.get(6)?,
        docstring: row.get(7)?,
        decorators: row.get(8)?,
        signature: row.get(9)?,
    })
}

fn map_import(row: &Row<'_>) -> rusqlite::Result<Import> {
    Ok(Import {
        id: row.get(0)?,
        file_id: row.get(1)?,
        module: row.get(2)?,
        kind: row.get(3)?,
        alias: row.get(4)?,
        line: row.get(5)?,
        column: row.get(6)?,
    })
}

fn map_symbol(row: &Row<'_>) -> rusqlite::Result<SymbolOccurrence> {
    Ok(SymbolOccurrence {
        id: row.get(0)?,
        file_id: row.get(1)?,
        definition_id: row.get(2)?,
        name: row.get(3)?,
        kind: row.get(4)?,
        line: row.get(5)?,
        column: row.get(6)?,
        scope: row.get(7)?,
    })
}

/// Persists the structure extracted from a file: definitions, imports,
/// symbol occurrences, and tags.
///
/// Writes are delete-then-insert per file so re-indexing a file is a single
/// transaction, and the search index row is refreshed afterwards.
pub struct SymbolRepository {
    service: Arc<DatabaseService>,
}

impl SymbolRepository {
    pub fn new(service: Arc<DatabaseService>) -> Self {
        Self { service }
    }

    /// Replaces every definition, import, and symbol attached to a file in
    /// one transaction.
    pub fn replace_file_structure(
        &self,
        file_id: &str,
        definitions: &[Definition],
        imports: &[Import],
        symbols: &[SymbolOccurrence],
    ) -> Result<()> {
        for definition in definitions {
            definition.validate()?;
        }
        for import in imports {
            import.validate()?;
        }
        for symbol in symbols {
            symbol.validate()?;
        }

        self.service.execute_transaction(|tx| {
            tx.execute("DELETE FROM symbols WHERE file_id = ?1", [file_id])
                .map_err(StoreError::from)?;
            tx.execute("DELETE FROM imports WHERE file_id = ?1", [file_id])
                .map_err(StoreError::from)?;
            tx.execute("DELETE FROM definitions WHERE file_id = ?1", [file_id])
                .map_err(StoreError::from)?;

            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO definitions (id, file_id, name, type, line, column, exported, docstring, decorators, signature) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    )
                    .map_err(StoreError::from)?;
                for d in definitions {
                    stmt.execute(params![
                        d.id, d.file_id, d.name, d.kind, d.line, d.column, d.exported,
                        d.docstring, d.decorators, d.signature,
                    ])
                    .map_err(StoreError::from)?;
                }
            }
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO imports (id, file_id, module, type, alias, line, column) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )
                    .map_err(StoreError::from)?;
                for i in imports {
                    stmt.execute(params![i.id, i.file_id, i.module, i.kind, i.alias, i.line, i.column])
                        .map_err(StoreError::from)?;
                }
            }
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO symbols (id, file_id, definition_id, name, type, line, column, scope) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    )
                    .map_err(StoreError::from)?;
                for s in symbols {
                    stmt.execute(params![
                        s.id, s.file_id, s.definition_id, s.name, s.kind, s.line, s.column, s.scope,
                    ])
                    .map_err(StoreError::from)?;
                }
            }

            refresh_search_row(tx, file_id)?;
            Ok(())
        })?;

        debug!(
            file_id,
            definitions = definitions.len(),
            imports = imports.len(),
            symbols = symbols.len(),
            "file structure replaced"
        );
        Ok(())
    }

    /// Replaces the tag set of a file.
    pub fn set_tags(&self, file_id: &str, tags: &[FileTag]) -> Result<()> {
        for tag in tags {
            tag.validate()?;
        }
        self.service.execute_transaction(|tx| {
            tx.execute("DELETE FROM file_tags WHERE file_id = ?1", [file_id])
                .map_err(StoreError::from)?;
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO file_tags (file_id, tag, weight) VALUES (?1, ?2, ?3)",
                )
                .map_err(StoreError::from)?;
            for tag in tags {
                stmt.execute(params![tag.file_id, tag.tag, tag.weight])
                    .map_err(StoreError::from)?;
            }
            drop(stmt);
            refresh_search_row(tx, file_id)?;
            Ok(())
        })
    }

    pub fn definitions_for_file(&self, file_id: &str) -> Result<Vec<Definition>> {
        self.service.execute_query(
            "SELECT id, file_id, name, type, line, column, exported, docstring, decorators, signature \
             FROM definitions WHERE file_id = ?1 ORDER BY line, column",
            &[&file_id],
            map_definition,
        )
    }

    pub fn imports_for_file(&self, file_id: &str) -> Result<Vec<Import>> {
        self.service.execute_query(
            "SELECT id, file_id, module, type, alias, line, column \
             FROM imports WHERE file_id = ?1 ORDER BY line, column",
            &[&file_id],
            map_import,
        )
    }

    pub fn symbols_for_file(&self, file_id: &str) -> Result<Vec<SymbolOccurrence>> {
        self.service.execute_query(
            "SELECT id, file_id, definition_id, name, type, line, column, scope \
             FROM symbols WHERE file_id = ?1 ORDER BY line, column",
            &[&file_id],
            map_symbol,
        )
    }

    pub fn tags_for_file(&self, file_id: &str) -> Result<Vec<FileTag>> {
        self.service.execute_query(
            "SELECT file_id, tag, weight FROM file_tags WHERE file_id = ?1 ORDER BY tag",
            &[&file_id],
            |row| {
                Ok(FileTag {
                    file_id: row.get(0)?,
                    tag: row.get(1)?,
                    weight: row.get(2)?,
                })
            },
        )
    }

    pub fn symbols_by_name(&self, name: &str) -> Result<Vec<SymbolOccurrence>> {
        self.service.execute_query(
            "SELECT id, file_id, definition_id, name, type, line, column, scope \
             FROM symbols WHERE name = ?1 ORDER BY file_id, line",
            &[&name],
            map_symbol,
        )
    }
}

/// The FTS triggers fire on `files` changes only; after rewriting dependent
/// rows the index row must be rebuilt from the new aggregates.
fn refresh_search_row(tx: &Transaction<'_>, file_id: &str) -> Result<()> {
    let has_fts: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'files_fts'",
            [],
            |row| row.get(0),
        )
        .map_err(StoreError::from)?;
    if has_fts == 0 {
        return Ok(());
    }
    tx.execute(
        "UPDATE files SET indexed_at = indexed_at WHERE id = ?1",
        [file_id],
    )
    .map_err(StoreError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::file_repository::FileRepository;
    use crate::storage::migrations::MigrationManager;
    use crate::storage::models::FileRecord;
    use crate::storage::pool::ConnectionPool;

    fn test_repos() -> (FileRepository, SymbolRepository, Arc<DatabaseService>) {
        let pool = ConnectionPool::new(&StoreConfig::in_memory()).unwrap();
        let service = Arc::new(DatabaseService::new(pool));
        service
            .with_connection_mut(|conn| MigrationManager::with_builtin().migrate(conn).map(|_| ()))
            .unwrap();
        (
            FileRepository::new(Arc::clone(&service)),
            SymbolRepository::new(Arc::clone(&service)),
            service,
        )
    }

    fn seed_file(files: &FileRepository, id: &str, path: &str) {
        files
            .save(&FileRecord::new(id, path, 10, 100, "a".repeat(64), "typescript", 200))
            .unwrap();
    }

    #[test]
    fn test_replace_and_read_back() {
        let (files, symbols, _service) = test_repos();
        seed_file(&files, "f1", "/a.ts");

        let defs = vec![
            Definition::new("d1", "f1", "main", "function", 1, 1).exported(),
            Definition::new("d2", "f1", "helper", "function", 10, 1),
        ];
        let imports = vec![Import::new("i1", "f1", "react", "default", 1, 1)];
        let occurrences =
            vec![SymbolOccurrence::new("s1", "f1", "x", "variable", 2, 5).with_definition("d1")];

        symbols
            .replace_file_structure("f1", &defs, &imports, &occurrences)
            .unwrap();

        assert_eq!(symbols.definitions_for_file("f1").unwrap(), defs);
        assert_eq!(symbols.imports_for_file("f1").unwrap(), imports);
        assert_eq!(symbols.symbols_for_file("f1").unwrap(), occurrences);
    }

    #[test]
    fn test_replace_is_destructive_per_file() {
        let (files, symbols, _service) = test_repos();
        seed_file(&files, "f1", "/a.ts");

        symbols
            .replace_file_structure(
                "f1",
                &[Definition::new("d1", "f1", "old", "function", 1, 1)],
                &[],
                &[],
            )
            .unwrap();
        symbols
            .replace_file_structure(
                "f1",
                &[Definition::new("d2", "f1", "new", "function", 1, 1)],
                &[],
                &[],
            )
            .unwrap();

        let defs = symbols.definitions_for_file("f1").unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "new");
    }

    #[test]
    fn test_validation_blocks_whole_batch() {
        let (files, symbols, _service) = test_repos();
        seed_file(&files, "f1", "/a.ts");

        let err = symbols
            .replace_file_structure(
                "f1",
                &[Definition::new("", "f1", "x", "function", 1, 1)],
                &[],
                &[],
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConstraintViolation);
        assert!(symbols.definitions_for_file("f1").unwrap().is_empty());
    }

    #[test]
    fn test_set_tags_replaces() {
        let (files, symbols, _service) = test_repos();
        seed_file(&files, "f1", "/a.ts");

        symbols
            .set_tags("f1", &[FileTag::new("f1", "typescript", 1.0)])
            .unwrap();
        symbols
            .set_tags(
                "f1",
                &[
                    FileTag::new("f1", "frontend", 0.5),
                    FileTag::new("f1", "react", 2.0),
                ],
            )
            .unwrap();

        let tags = symbols.tags_for_file("f1").unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].tag, "frontend");
    }

    #[test]
    fn test_structure_updates_search_index() {
        let (files, symbols, service) = test_repos();
        seed_file(&files, "f1", "/a.ts");

        symbols
            .replace_file_structure(
                "f1",
                &[Definition::new("d1", "f1", "renderWidget", "function", 1, 1)],
                &[],
                &[],
            )
            .unwrap();

        let hits: i64 = service
            .execute_one(
                "SELECT COUNT(*) FROM files_fts WHERE files_fts MATCH 'definitions:renderWidget'",
                &[],
                |row| row.get(0),
            )
            .unwrap()
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_deleting_definition_nulls_symbol_reference() {
        let (files, symbols, service) = test_repos();
        seed_file(&files, "f1", "/a.ts");
        symbols
            .replace_file_structure(
                "f1",
                &[Definition::new("d1", "f1", "main", "function", 1, 1)],
                &[],
                &[SymbolOccurrence::new("s1", "f1", "x", "variable", 2, 1).with_definition("d1")],
            )
            .unwrap();

        service
            .execute_run("DELETE FROM definitions WHERE id = 'd1'", &[])
            .unwrap();

        let occurrences = symbols.symbols_for_file("f1").unwrap();
        assert_eq!(occurrences.len(), 1);
        assert!(occurrences[0].definition_id.is_none());
    }
}
