use crate::error::{Result, StoreError};
use crate::monitor::performance::PerformanceMonitor;
use crate::storage::migrations::MigrationManager;
use crate::storage::pool::{ConnectionPool, PoolStats, PooledConnection};
use rusqlite::{Row, ToSql, Transaction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, warn};

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    pub changes: usize,
    pub last_insert_id: i64,
}

/// Per-service operation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ServiceStats {
    pub total_queries: u64,
    pub failed_queries: u64,
    pub transactions: u64,
    pub failed_transactions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of a health probe.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub accessible: bool,
    pub probe_latency_ms: f64,
    pub pool: PoolStats,
}

/// Thin transactional façade around the pool.
///
/// Every operation acquires a handle, runs, and releases; the lease guard
/// guarantees release on all exit paths including unwinding.
pub struct DatabaseService {
    pool: Arc<ConnectionPool>,
    monitor: OnceLock<Arc<PerformanceMonitor>>,
    total_queries: AtomicU64,
    failed_queries: AtomicU64,
    transactions: AtomicU64,
    failed_transactions: AtomicU64,
}

impl DatabaseService {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            monitor: OnceLock::new(),
            total_queries: AtomicU64::new(0),
            failed_queries: AtomicU64::new(0),
            transactions: AtomicU64::new(0),
            failed_transactions: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Wires the per-query timing sink. Set once, during store assembly.
    pub fn attach_monitor(&self, monitor: Arc<PerformanceMonitor>) {
        let _ = self.monitor.set(monitor);
    }

    fn observe_query(
        &self,
        sql: &str,
        started: Instant,
        ok: bool,
        row_count: Option<usize>,
        error: Option<&str>,
    ) {
        if let Some(monitor) = self.monitor.get() {
            monitor.record_query_execution(sql, started.elapsed(), ok, row_count, error);
        }
    }

    /// Builds a migration manager over the engine's schema catalog.
    pub fn migration_manager(&self) -> MigrationManager {
        MigrationManager::with_builtin()
    }

    fn acquire(&self) -> Result<PooledConnection> {
        self.pool.acquire()
    }

    fn record(&self, failed: bool) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed_queries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Runs a read statement, mapping each row through `mapper`.
    pub fn execute_query<T, F>(&self, sql: &str, params: &[&dyn ToSql], mapper: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let started = Instant::now();
        let result = self.query_inner(sql, params, mapper);
        self.record(result.is_err());
        match &result {
            Ok(rows) => self.observe_query(sql, started, true, Some(rows.len()), None),
            Err(err) => self.observe_query(sql, started, false, None, Some(&err.to_string())),
        }
        result
    }

    fn query_inner<T, F>(&self, sql: &str, params: &[&dyn ToSql], mapper: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.acquire()?;
        let mut stmt = conn
            .prepare_cached(sql)
            .map_err(|e| StoreError::query(e, sql, params.len()))?;
        let rows = stmt
            .query_map(params, mapper)
            .map_err(|e| StoreError::query(e, sql, params.len()))?
            .collect::<std::result::Result<Vec<T>, _>>()
            .map_err(|e| StoreError::query(e, sql, params.len()))?;
        Ok(rows)
    }

    /// Runs a read statement expected to produce at most one row.
    pub fn execute_one<T, F>(&self, sql: &str, params: &[&dyn ToSql], mapper: F) -> Result<Option<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut rows = self.execute_query(sql, params, mapper)?;
        if rows.len() > 1 {
            debug!(rows = rows.len(), "execute_one discarded extra rows");
        }
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    /// Runs a write statement.
    pub fn execute_run(&self, sql: &str, params: &[&dyn ToSql]) -> Result<RunResult> {
        let started = Instant::now();
        let result = self.run_inner(sql, params);
        self.record(result.is_err());
        match &result {
            Ok(run) => self.observe_query(sql, started, true, Some(run.changes), None),
            Err(err) => self.observe_query(sql, started, false, None, Some(&err.to_string())),
        }
        result
    }

    fn run_inner(&self, sql: &str, params: &[&dyn ToSql]) -> Result<RunResult> {
        let conn = self.acquire()?;
        let mut stmt = conn
            .prepare_cached(sql)
            .map_err(|e| StoreError::query(e, sql, params.len()))?;
        let changes = stmt
            .execute(params)
            .map_err(|e| StoreError::query(e, sql, params.len()))?;
        Ok(RunResult {
            changes,
            last_insert_id: conn.last_insert_rowid(),
        })
    }

    /// Runs `f` inside a transaction: commit on normal return, rollback on
    /// any failure propagating out. The failure counter is bumped even when
    /// the caller's closure is the failing party.
    pub fn execute_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        self.transactions.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let mut conn = self.acquire()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::transaction(format!("failed to begin: {e}")))?;

        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(|e| {
                    self.failed_transactions.fetch_add(1, Ordering::Relaxed);
                    StoreError::transaction(format!("commit failed: {e}"))
                })?;
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "transaction committed"
                );
                Ok(value)
            }
            Err(err) => {
                // Dropping the transaction rolls it back
                self.failed_transactions.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }

    /// Borrow a handle for a sequence of reads that should share one
    /// connection (EXPLAIN capture, maintenance probes).
    pub fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T>,
    {
        let conn = self.acquire()?;
        f(&conn)
    }

    /// Borrow a handle mutably (migrations need `&mut Connection`).
    pub fn with_connection_mut<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T>,
    {
        let mut conn = self.acquire()?;
        f(&mut conn)
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            failed_transactions: self.failed_transactions.load(Ordering::Relaxed),
        }
    }

    /// Probes the database with `SELECT 1` and inspects pool pressure.
    pub fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let probe = self.with_connection(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))
                .map_err(StoreError::from)
        });
        let probe_latency_ms = started.elapsed().as_micros() as f64 / 1_000.0;
        let pool = self.pool.stats();

        let (status, accessible) = match probe {
            Ok(1) => {
                let saturated = pool.available == 0 && pool.waiters > 0;
                let stats = self.stats();
                let failure_heavy =
                    stats.total_queries > 10 && stats.failed_queries * 2 > stats.total_queries;
                if saturated || failure_heavy {
                    (HealthStatus::Degraded, true)
                } else {
                    (HealthStatus::Healthy, true)
                }
            }
            Ok(_) | Err(_) => (HealthStatus::Unhealthy, false),
        };

        HealthReport {
            status,
            accessible,
            probe_latency_ms,
            pool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn test_service() -> DatabaseService {
        let pool = ConnectionPool::new(&StoreConfig::in_memory()).unwrap();
        let service = DatabaseService::new(pool);
        service
            .with_connection_mut(|conn| MigrationManager::with_builtin().migrate(conn).map(|_| ()))
            .unwrap();
        service
    }

    fn insert_file(service: &DatabaseService, id: &str, path: &str) {
        let hash = "a".repeat(64);
        service
            .execute_run(
                "INSERT INTO files (id, path, filename, hash) VALUES (?1, ?2, ?3, ?4)",
                &[&id, &path, &"f", &hash],
            )
            .unwrap();
    }

    #[test]
    fn test_execute_query_maps_rows() {
        let service = test_service();
        insert_file(&service, "f1", "/a.ts");
        insert_file(&service, "f2", "/b.ts");

        let paths = service
            .execute_query("SELECT path FROM files ORDER BY path", &[], |row| {
                row.get::<_, String>(0)
            })
            .unwrap();
        assert_eq!(paths, vec!["/a.ts", "/b.ts"]);
    }

    #[test]
    fn test_execute_one_returns_none_for_no_rows() {
        let service = test_service();
        let found = service
            .execute_one("SELECT path FROM files WHERE id = ?1", &[&"missing"], |row| {
                row.get::<_, String>(0)
            })
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_execute_run_reports_changes() {
        let service = test_service();
        insert_file(&service, "f1", "/a.ts");
        let result = service
            .execute_run("DELETE FROM files WHERE id = ?1", &[&"f1"])
            .unwrap();
        assert_eq!(result.changes, 1);
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let service = test_service();
        service
            .execute_transaction(|tx| {
                tx.execute(
                    "INSERT INTO files (id, path, filename, hash) VALUES ('f1', '/a.ts', 'a', ?1)",
                    [&"a".repeat(64)],
                )
                .map_err(StoreError::from)?;
                Ok(())
            })
            .unwrap();

        let count: i64 = service
            .execute_one("SELECT COUNT(*) FROM files", &[], |row| row.get(0))
            .unwrap()
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let service = test_service();
        let err = service
            .execute_transaction(|tx| {
                tx.execute(
                    "INSERT INTO files (id, path, filename, hash) VALUES ('f1', '/a.ts', 'a', ?1)",
                    [&"a".repeat(64)],
                )
                .map_err(StoreError::from)?;
                Err::<(), _>(StoreError::validation("abort"))
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConstraintViolation);

        let count: i64 = service
            .execute_one("SELECT COUNT(*) FROM files", &[], |row| row.get(0))
            .unwrap()
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(service.stats().failed_transactions, 1);
    }

    #[test]
    fn test_stats_count_failures() {
        let service = test_service();
        let _ = service.execute_run("INSERT INTO nope VALUES (1)", &[]);
        let stats = service.stats();
        assert_eq!(stats.total_queries, 1);
        assert_eq!(stats.failed_queries, 1);
    }

    #[test]
    fn test_health_check_on_live_database() {
        let service = test_service();
        let report = service.health_check();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.accessible);
    }

    #[test]
    fn test_no_handle_leaks_after_failures() {
        let service = test_service();
        let before = service.pool().stats().available;
        for _ in 0..5 {
            let _ = service.execute_run("INSERT INTO nope VALUES (1)", &[]);
        }
        assert_eq!(service.pool().stats().available, before);
    }
}
