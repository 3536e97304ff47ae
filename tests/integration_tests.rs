//! End-to-end scenarios over the full engine: fresh database bring-up,
//! file round-trips, batching, migrations, and pool behavior.

use code_index_store::storage::migrations::{builtin_migrations, Migration, MigrationManager};
use code_index_store::storage::ListOptions;
use code_index_store::{
    ErrorKind, FileRecord, FileTag, SearchOptions, SortKey, SortOrder, Store, StoreConfig,
};
use std::sync::Arc;

fn sample_file(id: &str, path: &str) -> FileRecord {
    FileRecord::new(id, path, 10, 100, "a".repeat(64), "typescript", 200)
}

/// Honors RUST_LOG when running tests; safe to call repeatedly.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn scenario_fresh_database() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fresh.db");
    let store = Store::open(StoreConfig::new(&db_path)).unwrap();

    // Migrations reached the current version and created both table families
    let info = store.info().unwrap();
    assert_eq!(info.schema_version, 2);

    let tables: Vec<String> = store
        .service()
        .execute_query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
            &[],
            |row| row.get(0),
        )
        .unwrap();
    assert!(tables.contains(&"files".to_string()));
    assert!(tables.contains(&"files_fts".to_string()));

    let m = sample_file("f1", "/a.ts");
    store.files().save(&m).unwrap();
    assert_eq!(store.files().find_by_path("/a.ts").unwrap().unwrap(), m);
    assert_eq!(store.files().count().unwrap(), 1);
}

#[test]
fn scenario_duplicate_path_save() {
    let store = Store::open(StoreConfig::in_memory()).unwrap();
    store.files().save(&sample_file("f1", "/a.ts")).unwrap();

    let mut updated = sample_file("f1", "/a.ts");
    updated.size = 20;
    store.files().save(&updated).unwrap();

    assert_eq!(store.files().find_by_path("/a.ts").unwrap().unwrap().size, 20);
    assert_eq!(store.files().count().unwrap(), 1);
}

#[test]
fn scenario_batch_with_one_bad_hash() {
    let store = Store::open(StoreConfig::in_memory()).unwrap();
    let valid = sample_file("f1", "/a.ts");
    let mut invalid = sample_file("f2", "/b.ts");
    invalid.hash = "not-hex".to_string();

    let result = store.files().save_batch(&[valid, invalid]).unwrap();
    assert_eq!(result.success, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].id, "f2");
    assert!(result.errors[0].error.contains("Hash must be a valid SHA-256"));
    assert_eq!(store.files().count().unwrap(), 1);
}

#[test]
fn scenario_tag_search_with_expansion() {
    let store = Store::open(StoreConfig::in_memory()).unwrap();
    store.files().save(&sample_file("f1", "/a.ts")).unwrap();
    store
        .symbols()
        .set_tags("f1", &[FileTag::new("f1", "typescript", 1.0)])
        .unwrap();

    // "ts" expands to "typescript"
    let hits = store
        .search()
        .search_by_tags(&["ts".to_string()], &SearchOptions::default())
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "f1");
}

#[test]
fn scenario_free_text_injection_attempt() {
    let store = Store::open(StoreConfig::in_memory()).unwrap();
    store.files().save(&sample_file("f1", "/a.ts")).unwrap();

    let err = store
        .search()
        .search_by_text("x'; DROP TABLE files; --", &SearchOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    assert_eq!(store.files().count().unwrap(), 1);
}

#[test]
fn scenario_migration_checksum_mismatch() {
    let store = Store::open(StoreConfig::in_memory()).unwrap();

    // The live schema is at v2 with recorded checksums; re-register v1 with
    // a drifted definition and try to migrate again
    let mut drifted = MigrationManager::new();
    drifted
        .add(Migration::new(
            1,
            "core_tables",
            "CREATE TABLE files (id TEXT PRIMARY KEY);",
            "DROP TABLE files;",
        ))
        .unwrap();
    drifted.add(builtin_migrations().remove(1)).unwrap();
    drifted
        .add(Migration::new(3, "later", "SELECT 1;", "SELECT 1;"))
        .unwrap();

    let err = store
        .service()
        .with_connection_mut(|conn| drifted.migrate(conn).map(|_| ()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MigrationFailed);

    // The database is untouched: still v2, files table intact
    let version = store
        .service()
        .with_connection_mut(|conn| MigrationManager::with_builtin().current_version(conn))
        .unwrap();
    assert_eq!(version, 2);
    store.files().save(&sample_file("f1", "/a.ts")).unwrap();
}

#[test]
fn migration_cycle_returns_to_fresh_schema() {
    let store = Store::open(StoreConfig::in_memory()).unwrap();
    let manager = MigrationManager::with_builtin();

    store
        .service()
        .with_connection_mut(|conn| {
            manager.rollback(conn, 0)?;
            assert_eq!(manager.current_version(conn)?, 0);
            manager.migrate(conn)?;
            assert_eq!(manager.current_version(conn)?, 2);
            Ok(())
        })
        .unwrap();

    // The re-created schema is fully functional
    store.files().save(&sample_file("f1", "/a.ts")).unwrap();
    assert_eq!(store.files().count().unwrap(), 1);
}

#[test]
fn cascade_delete_reaches_every_dependent() {
    use code_index_store::{Definition, Import, SymbolOccurrence};

    let store = Store::open(StoreConfig::in_memory()).unwrap();
    store.files().save(&sample_file("f1", "/a.ts")).unwrap();
    store
        .symbols()
        .replace_file_structure(
            "f1",
            &[Definition::new("d1", "f1", "main", "function", 1, 1)],
            &[Import::new("i1", "f1", "react", "default", 1, 1)],
            &[SymbolOccurrence::new("s1", "f1", "x", "variable", 2, 1).with_definition("d1")],
        )
        .unwrap();
    store
        .symbols()
        .set_tags("f1", &[FileTag::new("f1", "typescript", 1.0)])
        .unwrap();

    assert!(store.files().delete("/a.ts").unwrap());

    for table in ["definitions", "imports", "symbols", "file_tags"] {
        let count: i64 = store
            .service()
            .execute_one(&format!("SELECT COUNT(*) FROM {table}"), &[], |row| row.get(0))
            .unwrap()
            .unwrap();
        assert_eq!(count, 0, "{table} not cascaded");
    }
    let fts: i64 = store
        .service()
        .execute_one("SELECT COUNT(*) FROM files_fts", &[], |row| row.get(0))
        .unwrap()
        .unwrap();
    assert_eq!(fts, 0);
}

#[test]
fn list_sorting_holds_after_mixed_saves() {
    let store = Store::open(StoreConfig::in_memory()).unwrap();
    for (i, size) in [40_i64, 10, 30, 20].iter().enumerate() {
        let mut record = sample_file(&format!("f{i}"), &format!("/m{i}.ts"));
        record.size = *size;
        store.files().save(&record).unwrap();
    }

    let ascending = store
        .files()
        .list(&ListOptions {
            sort_by: Some(SortKey::Size),
            sort_order: Some(SortOrder::Asc),
            ..Default::default()
        })
        .unwrap();
    let sizes: Vec<i64> = ascending.iter().map(|f| f.size).collect();
    assert_eq!(sizes, vec![10, 20, 30, 40]);

    let descending = store
        .files()
        .list(&ListOptions {
            sort_by: Some(SortKey::Size),
            sort_order: Some(SortOrder::Desc),
            ..Default::default()
        })
        .unwrap();
    let sizes: Vec<i64> = descending.iter().map(|f| f.size).collect();
    assert_eq!(sizes, vec![40, 30, 20, 10]);

    assert!(SortKey::parse("unknown_key").is_err());
}

#[test]
fn pool_counts_restored_after_operation_mix() {
    let store = Store::open(StoreConfig::in_memory()).unwrap();
    // Warm up so the pool reaches a steady state before measuring
    store.files().save(&sample_file("warm", "/warm.ts")).unwrap();
    let before = store.pool_stats().available;

    for i in 0..10 {
        store
            .files()
            .save(&sample_file(&format!("f{i}"), &format!("/f{i}.ts")))
            .unwrap();
        let _ = store.files().find_by_path(&format!("/f{i}.ts")).unwrap();
        // Failures release their handles too
        let _ = store.service().execute_run("INSERT INTO nope VALUES (1)", &[]);
    }

    assert_eq!(store.pool_stats().available, before);
}

#[test]
fn concurrent_writers_serialize_cleanly() {
    // File-backed: WAL plus the busy timeout serialize concurrent writers
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(StoreConfig::new(dir.path().join("concurrent.db"))).unwrap());
    let mut handles = Vec::new();
    for worker in 0..4 {
        let store = Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            for i in 0..20 {
                let id = format!("w{worker}f{i}");
                let path = format!("/{worker}/{i}.ts");
                store.files().save(&sample_file(&id, &path)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(store.files().count().unwrap(), 80);
}

#[test]
fn save_then_update_then_delete_batch_flow() {
    let store = Store::open(StoreConfig::in_memory()).unwrap();
    let records: Vec<FileRecord> = (0..30)
        .map(|i| sample_file(&format!("f{i}"), &format!("/f{i}.ts")))
        .collect();
    let saved = store.files().save_batch(&records).unwrap();
    assert_eq!(saved.success, 30);

    store
        .files()
        .update(
            "/f0.ts",
            &code_index_store::FileUpdate {
                language: Some("javascript".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(
        store.files().find_by_path("/f0.ts").unwrap().unwrap().language,
        "javascript"
    );

    let paths: Vec<String> = (0..40).map(|i| format!("/f{i}.ts")).collect();
    let deleted = store.files().delete_batch(&paths).unwrap();
    assert_eq!(deleted.failed, 0);
    assert_eq!(store.files().count().unwrap(), 0);
}

#[test]
fn health_check_reports_healthy_store() {
    let store = Store::open(StoreConfig::in_memory()).unwrap();
    let report = store.service().health_check();
    assert!(report.accessible);
    assert_eq!(
        report.status,
        code_index_store::storage::HealthStatus::Healthy
    );
}
