//! End-to-end coverage of the search surface, the monitoring pipeline, and
//! the degradation control loop.

use code_index_store::monitor::degradation::DegradationLevel;
use code_index_store::storage::search_repository::MaintenanceOptions;
use code_index_store::{
    Capability, Definition, FileRecord, FileTag, SearchOptions, Store, StoreConfig,
};
use std::time::Duration;

fn sample_file(id: &str, path: &str, language: &str) -> FileRecord {
    FileRecord::new(id, path, 100, 1_000, "a".repeat(64), language, 2_000)
}

fn seeded_store() -> Store {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let store = Store::open(StoreConfig::in_memory()).unwrap();
    for (id, path, language, tags) in [
        ("f1", "/src/app.ts", "typescript", vec!["typescript", "frontend"]),
        ("f2", "/src/api.py", "python", vec!["python", "backend"]),
        ("f3", "/src/db.rs", "rust", vec!["rust", "backend"]),
    ] {
        store.files().save(&sample_file(id, path, language)).unwrap();
        let tag_rows: Vec<FileTag> = tags.iter().map(|t| FileTag::new(id, *t, 1.0)).collect();
        store.symbols().set_tags(id, &tag_rows).unwrap();
    }
    store
}

#[test]
fn tag_search_case_insensitive_via_expansion() {
    let store = seeded_store();
    let lower = store
        .search()
        .search_by_tags(&["rust".to_string()], &SearchOptions::default())
        .unwrap();
    let upper = store
        .search()
        .search_by_tags(&["RUST".to_string()], &SearchOptions::default())
        .unwrap();
    assert_eq!(lower.len(), upper.len());
    assert_eq!(lower[0].id, upper[0].id);
}

#[test]
fn search_limit_is_respected() {
    let store = seeded_store();
    let hits = store
        .search()
        .search_by_tags(
            &["backend".to_string()],
            &SearchOptions {
                limit: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(hits.len(), 1);
}

#[test]
fn result_shape_carries_metadata_and_defaults() {
    let store = seeded_store();
    let hits = store
        .search()
        .search_by_tags(&["typescript".to_string()], &SearchOptions::default())
        .unwrap();
    let hit = &hits[0];
    assert_eq!(hit.path, "/src/app.ts");
    assert_eq!(hit.filename, "app.ts");
    assert_eq!(hit.metadata.extension, "ts");
    assert_eq!(hit.metadata.language, "typescript");
    assert_eq!(hit.metadata.size, 100);
    assert!(hit.matches.is_empty());
}

#[test]
fn free_text_snippets_on_docstrings() {
    let store = seeded_store();
    store
        .symbols()
        .replace_file_structure(
            "f2",
            &[Definition::new("d1", "f2", "fetch_records", "function", 3, 1)
                .with_docstring("Fetches paginated records from the warehouse")],
            &[],
            &[],
        )
        .unwrap();

    let hits = store
        .search()
        .search_by_text(
            "warehouse",
            &SearchOptions {
                include_snippets: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "f2");
    let doc_match = hits[0]
        .matches
        .iter()
        .find(|m| m.field == "docstrings")
        .unwrap();
    assert!(doc_match.snippet.contains("<match>warehouse</match>"));
}

#[test]
fn optimize_twice_keeps_results_stable() {
    let store = seeded_store();
    let before = store
        .search()
        .search_by_tags(&["backend".to_string()], &SearchOptions::default())
        .unwrap();

    assert!(store.search().optimize_index(&MaintenanceOptions::default()).success);
    assert!(store.search().optimize_index(&MaintenanceOptions::default()).success);

    let after = store
        .search()
        .search_by_tags(&["backend".to_string()], &SearchOptions::default())
        .unwrap();
    let before_ids: Vec<&str> = before.iter().map(|h| h.id.as_str()).collect();
    let after_ids: Vec<&str> = after.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(before_ids, after_ids);
}

#[test]
fn rebuild_reports_sizes_and_clears_cache() {
    let store = seeded_store();
    store
        .search()
        .search_by_tags(&["rust".to_string()], &SearchOptions::default())
        .unwrap();
    assert!(store.search().cache_stats().entries > 0);

    let outcome = store.search().rebuild_index(&MaintenanceOptions::default());
    assert!(outcome.success);
    assert!(outcome.before_bytes > 0);
    assert!(outcome.after_bytes > 0);
    assert_eq!(store.search().cache_stats().entries, 0);
}

#[test]
fn search_failures_feed_error_statistics() {
    let store = seeded_store();
    for _ in 0..3 {
        let _ = store
            .search()
            .search_by_text("x'; DROP TABLE files; --", &SearchOptions::default());
    }

    let stats = store.search().get_error_statistics().unwrap();
    assert_eq!(stats.total_errors, 3);
    assert!(stats.by_kind.contains_key("CONSTRAINT_VIOLATION"));
}

#[test]
fn degradation_gates_caching_and_indexing() {
    let store = seeded_store();
    store
        .degradation()
        .manual_degrade(DegradationLevel::Limited, "load test");
    assert!(!store.degradation().is_capability_available(Capability::Caching));
    assert!(!store.degradation().is_capability_available(Capability::Indexing));

    // Search still works at LIMITED, but results are not cached
    store.search().clear_cache();
    store
        .search()
        .search_by_tags(&["rust".to_string()], &SearchOptions::default())
        .unwrap();
    assert_eq!(store.search().cache_stats().entries, 0);

    // Index maintenance is refused in-band
    let outcome = store.search().rebuild_index(&MaintenanceOptions::default());
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("degraded"));

    store.degradation().reset();
    assert!(store.search().rebuild_index(&MaintenanceOptions::default()).success);
}

#[test]
fn degradation_history_tracks_transitions() {
    let store = seeded_store();
    store
        .degradation()
        .manual_degrade(DegradationLevel::Emergency, "incident");
    store.degradation().reset();

    let history = store.degradation().history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].to, DegradationLevel::Emergency);
    assert_eq!(history[1].to, DegradationLevel::Full);
}

#[test]
fn monitor_collects_query_shapes_and_slow_queries() {
    let store = Store::open(
        StoreConfig::in_memory().with_slow_query_threshold_ms(0),
    )
    .unwrap();
    let monitor = store.monitor();

    monitor.record_query_execution(
        "SELECT * FROM files WHERE path = ?1",
        Duration::from_millis(12),
        true,
        Some(1),
        None,
    );
    monitor.record_query_execution(
        "SELECT * FROM files WHERE path = ?1",
        Duration::from_millis(8),
        true,
        Some(1),
        None,
    );

    let metrics = monitor
        .get_query_metrics("SELECT * FROM files WHERE path = ?1")
        .unwrap();
    assert_eq!(metrics.execution_count, 2);
    assert_eq!(metrics.success_count, 2);

    // Threshold 0: everything lands in the slow log
    assert_eq!(monitor.get_slow_queries().len(), 2);

    let report = monitor.get_performance_report();
    assert_eq!(report.total_executions, 2);
    assert!(report.pool.is_some());
    assert!(report.errors.is_some());
}

#[test]
fn error_rate_drives_degradation_loop() {
    let store = seeded_store();

    // Push the aggregator over the LIMITED error-rate trigger
    for _ in 0..40 {
        let _ = store
            .search()
            .search_by_text("x'; DROP TABLE files; --", &SearchOptions::default());
    }
    store.degradation().evaluate();
    assert_eq!(store.degradation().current_level(), DegradationLevel::Limited);

    // Still serving reads at LIMITED
    assert!(store
        .search()
        .search_by_tags(&["rust".to_string()], &SearchOptions::default())
        .is_ok());
}

#[test]
fn suggestions_cover_both_halves() {
    let store = seeded_store();
    let suggestions = store.search().get_suggestions("back", 10).unwrap();
    let tag_terms: Vec<&str> = suggestions
        .iter()
        .filter(|s| s.kind == "tag")
        .map(|s| s.term.as_str())
        .collect();
    assert!(tag_terms.contains(&"backend"));

    let file_suggestions = store.search().get_suggestions("app", 10).unwrap();
    assert!(file_suggestions
        .iter()
        .any(|s| s.kind == "filename" && s.term == "app.ts"));
}

#[test]
fn optimizer_end_to_end_over_live_schema() {
    let store = seeded_store();
    let optimized = store
        .optimizer()
        .optimize_query("SELECT * FROM files WHERE language = ?1")
        .unwrap();
    assert!(!optimized.plan.rows.is_empty());
    assert_eq!(
        optimized.original_sql,
        "SELECT * FROM files WHERE language = ?1"
    );

    let report = store
        .optimizer()
        .analyze_query_security("SELECT * FROM files WHERE path = ?1");
    assert!(report.is_safe);
}
