use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::monitor::degradation::DegradationManager;
use crate::monitor::error_aggregator::ErrorAggregator;
use crate::monitor::performance::PerformanceMonitor;
use crate::query::optimizer::QueryOptimizer;
use crate::resilience::timeout::TimeoutRegistry;
use crate::storage::file_repository::FileRepository;
use crate::storage::migrations::MigrationManager;
use crate::storage::pool::{ConnectionPool, PoolStats};
use crate::storage::search_repository::SearchRepository;
use crate::storage::service::DatabaseService;
use crate::storage::symbol_repository::SymbolRepository;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Database introspection snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseInfo {
    pub schema_version: i64,
    pub file_size_bytes: i64,
    pub page_count: i64,
    pub page_size: i64,
    pub table_count: i64,
    pub index_count: i64,
    pub journal_mode: String,
    pub foreign_keys_enabled: bool,
}

impl DatabaseInfo {
    /// Returns the file size in a human-readable format.
    pub fn file_size_human_readable(&self) -> String {
        let size = self.file_size_bytes as f64;
        if size < 1024.0 {
            format!("{size} B")
        } else if size < 1024.0 * 1024.0 {
            format!("{:.1} KB", size / 1024.0)
        } else if size < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.1} MB", size / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB", size / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

/// Result of the offline maintenance pass.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MaintenanceReport {
    pub analyze_duration_ms: u64,
    pub optimize_duration_ms: u64,
    pub vacuum_duration_ms: Option<u64>,
}

/// The engine façade: pool, schema, repositories, optimizer, and the
/// metrics → degradation control loop, wired together at construction.
pub struct Store {
    config: StoreConfig,
    pool: Arc<ConnectionPool>,
    service: Arc<DatabaseService>,
    files: FileRepository,
    symbols: SymbolRepository,
    search: SearchRepository,
    optimizer: QueryOptimizer,
    monitor: Arc<PerformanceMonitor>,
    errors: Arc<ErrorAggregator>,
    degradation: Arc<DegradationManager>,
    timeouts: TimeoutRegistry,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (creating if missing) the database at the configured path,
    /// applies pending migrations, and wires the component graph.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let pool = ConnectionPool::new(&config)?;
        let service = Arc::new(DatabaseService::new(Arc::clone(&pool)));
        if !config.readonly {
            service.with_connection_mut(|conn| {
                MigrationManager::with_builtin().migrate(conn).map(|_| ())
            })?;
        }

        let errors = Arc::new(ErrorAggregator::new(config.alerting.clone()));
        let monitor = Arc::new(
            PerformanceMonitor::new(config.monitoring.clone())
                .with_pool(Arc::clone(&pool))
                .with_error_aggregator(Arc::clone(&errors))
                .with_max_memory(config.memory.max_usage_bytes),
        );
        service.attach_monitor(Arc::clone(&monitor));
        let degradation = Arc::new(DegradationManager::new(
            Some(Arc::clone(&monitor)),
            Some(Arc::clone(&errors)),
        ));

        let files = FileRepository::new(Arc::clone(&service))
            .with_degradation(Arc::clone(&degradation));
        let symbols = SymbolRepository::new(Arc::clone(&service));
        let search = SearchRepository::new(Arc::clone(&service), &config.query_cache)
            .with_degradation(Arc::clone(&degradation))
            .with_error_aggregator(Arc::clone(&errors));
        let optimizer = QueryOptimizer::new(Arc::clone(&service), &config.statement_cache);

        info!(path = %config.path.display(), "store opened");
        Ok(Self {
            config,
            pool,
            service,
            files,
            symbols,
            search,
            optimizer,
            monitor,
            errors,
            degradation,
            timeouts: TimeoutRegistry::new(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn files(&self) -> &FileRepository {
        &self.files
    }

    pub fn symbols(&self) -> &SymbolRepository {
        &self.symbols
    }

    pub fn search(&self) -> &SearchRepository {
        &self.search
    }

    pub fn service(&self) -> &Arc<DatabaseService> {
        &self.service
    }

    pub fn optimizer(&self) -> &QueryOptimizer {
        &self.optimizer
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn error_aggregator(&self) -> &Arc<ErrorAggregator> {
        &self.errors
    }

    pub fn degradation(&self) -> &Arc<DegradationManager> {
        &self.degradation
    }

    pub fn timeouts(&self) -> &TimeoutRegistry {
        &self.timeouts
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn migration_manager(&self) -> MigrationManager {
        MigrationManager::with_builtin()
    }

    /// Database information and statistics.
    pub fn info(&self) -> Result<DatabaseInfo> {
        let schema_version = self
            .service
            .with_connection_mut(|conn| MigrationManager::with_builtin().current_version(conn))?;
        self.service.with_connection(|conn| {
            let page_count: i64 = conn
                .query_row("PRAGMA page_count", [], |row| row.get(0))
                .map_err(StoreError::from)?;
            let page_size: i64 = conn
                .query_row("PRAGMA page_size", [], |row| row.get(0))
                .map_err(StoreError::from)?;
            let journal_mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .map_err(StoreError::from)?;
            let foreign_keys: i64 = conn
                .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
                .map_err(StoreError::from)?;
            let table_count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                    [],
                    |row| row.get(0),
                )
                .map_err(StoreError::from)?;
            let index_count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name NOT LIKE 'sqlite_%'",
                    [],
                    |row| row.get(0),
                )
                .map_err(StoreError::from)?;

            Ok(DatabaseInfo {
                schema_version,
                file_size_bytes: page_count * page_size,
                page_count,
                page_size,
                table_count,
                index_count,
                journal_mode,
                foreign_keys_enabled: foreign_keys == 1,
            })
        })
    }

    /// ANALYZE and PRAGMA optimize; VACUUM only outside WAL mode, which
    /// file-backed databases run in.
    pub fn maintenance(&self) -> Result<MaintenanceReport> {
        self.service.with_connection(|conn| {
            let analyze_start = Instant::now();
            conn.execute_batch("ANALYZE").map_err(StoreError::from)?;
            let analyze_duration = analyze_start.elapsed();

            let journal_mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .map_err(StoreError::from)?;
            let vacuum_duration = if journal_mode.eq_ignore_ascii_case("wal")
                || self.config.is_in_memory()
            {
                None
            } else {
                let vacuum_start = Instant::now();
                conn.execute_batch("VACUUM").map_err(StoreError::from)?;
                Some(vacuum_start.elapsed())
            };

            let optimize_start = Instant::now();
            conn.execute_batch("PRAGMA optimize")
                .map_err(StoreError::from)?;
            let optimize_duration = optimize_start.elapsed();

            Ok(MaintenanceReport {
                analyze_duration_ms: analyze_duration.as_millis() as u64,
                optimize_duration_ms: optimize_duration.as_millis() as u64,
                vacuum_duration_ms: vacuum_duration.map(|d: Duration| d.as_millis() as u64),
            })
        })
    }

    /// The single offline copy operation: writes a compacted snapshot of
    /// the database to `target`.
    pub fn backup_to<P: AsRef<Path>>(&self, target: P) -> Result<()> {
        let target = target.as_ref();
        if target.exists() {
            return Err(StoreError::configuration(format!(
                "backup target already exists: {}",
                target.display()
            )));
        }
        let target_str = target
            .to_str()
            .ok_or_else(|| StoreError::configuration("backup target path is not valid UTF-8"))?
            .to_string();
        self.service.with_connection(|conn| {
            conn.execute("VACUUM INTO ?1", [&target_str])
                .map_err(StoreError::from)?;
            Ok(())
        })?;
        info!(path = %target.display(), "offline backup written");
        Ok(())
    }

    /// Stops background tasks and closes the pool. Outstanding leases are
    /// destroyed as they return.
    pub fn close(&self) {
        self.monitor.close();
        self.degradation.close();
        self.pool.close();
        info!("store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::FileRecord;

    fn sample(id: &str, path: &str) -> FileRecord {
        FileRecord::new(id, path, 10, 100, "a".repeat(64), "typescript", 200)
    }

    #[test]
    fn test_open_in_memory_and_roundtrip() {
        let store = Store::open(StoreConfig::in_memory()).unwrap();
        store.files().save(&sample("f1", "/a.ts")).unwrap();
        assert_eq!(store.files().count().unwrap(), 1);

        let info = store.info().unwrap();
        assert_eq!(info.schema_version, 2);
        assert!(info.foreign_keys_enabled);
        assert!(info.table_count > 0);
        assert!(info.index_count > 0);
    }

    #[test]
    fn test_open_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("index.db");
        let store = Store::open(StoreConfig::new(&db_path)).unwrap();
        assert!(db_path.exists());

        let info = store.info().unwrap();
        assert_eq!(info.journal_mode.to_ascii_lowercase(), "wal");
        store.close();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = StoreConfig::in_memory();
        config.max_connections = 0;
        let err = Store::open(config).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn test_maintenance_reports_durations() {
        let store = Store::open(StoreConfig::in_memory()).unwrap();
        let report = store.maintenance().unwrap();
        assert!(report.vacuum_duration_ms.is_none());
    }

    #[test]
    fn test_backup_to_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreConfig::new(dir.path().join("live.db"))).unwrap();
        store.files().save(&sample("f1", "/a.ts")).unwrap();

        let backup_path = dir.path().join("backup.db");
        store.backup_to(&backup_path).unwrap();
        assert!(backup_path.exists());

        // The snapshot is a complete database
        let restored = Store::open(StoreConfig::new(&backup_path)).unwrap();
        assert_eq!(restored.files().count().unwrap(), 1);

        // Refusing to clobber an existing file
        assert!(store.backup_to(&backup_path).is_err());
    }

    #[test]
    fn test_degradation_wired_into_repositories() {
        let store = Store::open(StoreConfig::in_memory()).unwrap();
        store
            .degradation()
            .manual_degrade(crate::monitor::degradation::DegradationLevel::Basic, "test");

        let records: Vec<FileRecord> = vec![sample("f1", "/a.ts")];
        let err = store.files().save_batch(&records).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhausted);

        // Single-row file operations stay available at BASIC
        store.files().save(&sample("f2", "/b.ts")).unwrap();

        store.degradation().reset();
        assert!(store.files().save_batch(&records).is_ok());
    }

    #[test]
    fn test_file_size_human_readable() {
        let info = DatabaseInfo {
            schema_version: 2,
            file_size_bytes: 1024,
            page_count: 1,
            page_size: 1024,
            table_count: 1,
            index_count: 1,
            journal_mode: "memory".to_string(),
            foreign_keys_enabled: true,
        };
        assert_eq!(info.file_size_human_readable(), "1.0 KB");
    }

    #[test]
    fn test_human_readable_scales() {
        let mut info = DatabaseInfo {
            schema_version: 2,
            file_size_bytes: 512,
            page_count: 1,
            page_size: 512,
            table_count: 0,
            index_count: 0,
            journal_mode: "wal".to_string(),
            foreign_keys_enabled: true,
        };
        assert_eq!(info.file_size_human_readable(), "512 B");
        info.file_size_bytes = 5 * 1024 * 1024;
        assert_eq!(info.file_size_human_readable(), "5.0 MB");
    }
}
