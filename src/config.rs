use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Soft cap shared by the result cache, batch chunking, and the optimizer's
/// safety LIMIT rewrite.
pub const MAX_CACHE_SIZE: usize = 100;

/// Query result cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl_ms: u64,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: MAX_CACHE_SIZE,
            ttl_ms: 5 * 60 * 1000,
        }
    }
}

/// Prepared statement cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementCacheConfig {
    pub enabled: bool,
    pub max_size: usize,
}

impl Default for StatementCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 128,
        }
    }
}

/// Performance monitoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
    /// How long per-query metrics and slow-query entries are retained
    pub retention_ms: u64,
    pub slow_query_threshold_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_ms: 60 * 60 * 1000,
            slow_query_threshold_ms: 1_000,
        }
    }
}

/// Memory budget settings consumed by the degradation manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub max_usage_bytes: u64,
    pub check_interval_ms: u64,
    pub optimization_enabled: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_usage_bytes: 512 * 1024 * 1024,
            check_interval_ms: 30_000,
            optimization_enabled: true,
        }
    }
}

/// The pragma contract applied to every new handle. The journal and
/// foreign-key settings are relied on by the FTS triggers and CASCADE
/// semantics; cache size and temp store are tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PragmaConfig {
    /// Journal mode for file-backed databases
    pub journal_mode: String,
    pub synchronous: String,
    pub foreign_keys: bool,
    /// SQLite page cache size, in KiB
    pub cache_size_kib: u64,
    pub temp_store: String,
}

impl Default for PragmaConfig {
    fn default() -> Self {
        Self {
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            foreign_keys: true,
            cache_size_kib: 64_000,
            temp_store: "MEMORY".to_string(),
        }
    }
}

/// Error alerting thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Errors per minute before an error_rate alert fires
    pub error_rate: f64,
    /// Critical-coded error count before a critical_error alert fires
    pub critical_error_count: u64,
    /// Minimum time between alerts of the same kind
    pub cooldown_ms: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: 10.0,
            critical_error_count: 5,
            cooldown_ms: 60_000,
        }
    }
}

/// Alerting configuration. The callback and custom handler channels are
/// registered at runtime on the aggregator; this record only toggles them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    pub enabled: bool,
    pub thresholds: AlertThresholds,
    /// Emit alerts through the structured log channel
    pub log_channel: bool,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: AlertThresholds::default(),
            log_channel: true,
        }
    }
}

/// Top-level configuration for the storage engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file, or ":memory:" for tests
    pub path: PathBuf,
    /// Upper bound on pooled handles
    pub max_connections: usize,
    /// Handles kept warm even when idle
    pub min_connections: usize,
    /// How long `acquire` may block before failing with ResourceExhausted
    pub connection_timeout_ms: u64,
    /// Idle handles beyond `min_connections` are reaped after this long
    pub idle_timeout_ms: u64,
    /// Open the database read-only
    pub readonly: bool,
    pub pragmas: PragmaConfig,
    pub query_cache: QueryCacheConfig,
    pub statement_cache: StatementCacheConfig,
    pub monitoring: MonitoringConfig,
    pub memory: MemoryConfig,
    pub alerting: AlertingConfig,
}

impl StoreConfig {
    /// Creates a configuration with default values for the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_ms: 30_000,
            idle_timeout_ms: 60_000,
            readonly: false,
            pragmas: PragmaConfig::default(),
            query_cache: QueryCacheConfig::default(),
            statement_cache: StatementCacheConfig::default(),
            monitoring: MonitoringConfig::default(),
            memory: MemoryConfig::default(),
            alerting: AlertingConfig::default(),
        }
    }

    /// Creates configuration for an in-memory database (testing)
    pub fn in_memory() -> Self {
        let mut config = Self::new(":memory:");
        config.max_connections = 4;
        config.connection_timeout_ms = 10_000;
        config
    }

    /// Creates configuration for a temporary on-disk database (testing)
    pub fn temporary() -> Self {
        let db_name = format!("code_index_test_{}.db", uuid::Uuid::new_v4());
        let mut config = Self::new(std::env::temp_dir().join(db_name));
        config.connection_timeout_ms = 10_000;
        config
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_connection_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connection_timeout_ms = timeout_ms;
        self
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_slow_query_threshold_ms(mut self, threshold_ms: u64) -> Self {
        self.monitoring.slow_query_threshold_ms = threshold_ms;
        self
    }

    /// Returns true if this is an in-memory database
    pub fn is_in_memory(&self) -> bool {
        self.path == Path::new(":memory:")
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(StoreError::configuration("database path is required"));
        }
        if self.max_connections == 0 {
            return Err(StoreError::configuration(
                "max_connections must be greater than 0",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(StoreError::configuration(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.connection_timeout_ms == 0 {
            return Err(StoreError::configuration(
                "connection_timeout_ms must be greater than 0",
            ));
        }
        if self.query_cache.enabled && self.query_cache.max_size == 0 {
            return Err(StoreError::configuration(
                "query_cache.max_size must be greater than 0 when enabled",
            ));
        }
        if self.statement_cache.enabled && self.statement_cache.max_size == 0 {
            return Err(StoreError::configuration(
                "statement_cache.max_size must be greater than 0 when enabled",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StoreConfig::new("/tmp/index.db");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.connection_timeout_ms, 30_000);
        assert!(config.query_cache.enabled);
        assert_eq!(config.query_cache.max_size, MAX_CACHE_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_in_memory_config() {
        let config = StoreConfig::in_memory();
        assert!(config.is_in_memory());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_temporary_config_is_unique() {
        let a = StoreConfig::temporary();
        let b = StoreConfig::temporary();
        assert_ne!(a.path, b.path);
        assert!(a.path.to_string_lossy().contains("code_index_test_"));
    }

    #[test]
    fn test_validation_rejects_zero_pool() {
        let mut config = StoreConfig::in_memory();
        config.max_connections = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn test_validation_rejects_min_over_max() {
        let mut config = StoreConfig::in_memory();
        config.min_connections = 8;
        config.max_connections = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_path() {
        let config = StoreConfig::new("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_setters() {
        let config = StoreConfig::new("/tmp/index.db")
            .with_max_connections(2)
            .with_connection_timeout_ms(500)
            .with_readonly(true);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.connection_timeout_ms, 500);
        assert!(config.readonly);
    }
}
