use crate::config::MonitoringConfig;
use crate::monitor::error_aggregator::{ErrorAggregator, ErrorStatistics};
use crate::query::optimizer::QueryOptimizer;
use crate::storage::pool::{ConnectionPool, PoolStats};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Bounded ring of slow-query records.
const MAX_SLOW_QUERIES_STORED: usize = 100;
/// How many slow queries a report includes.
const REPORT_TOP_SLOW: usize = 10;

/// Per-query-shape metrics, keyed by the stable hash of the SQL text.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryMetrics {
    pub sql: String,
    pub execution_count: u64,
    pub total_time_ms: f64,
    pub avg_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Average over successful executions only
    pub avg_rows_returned: f64,
    pub last_execution: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SlowQuery {
    pub hash: u64,
    pub sql: String,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub row_count: Option<usize>,
    pub error: Option<String>,
}

/// Thresholds compared against current aggregates by `check_thresholds`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PerformanceThresholds {
    pub avg_duration_warn_ms: f64,
    pub avg_duration_crit_ms: f64,
    pub error_rate_warn: f64,
    pub error_rate_crit: f64,
    pub memory_warn_bytes: u64,
    pub memory_crit_bytes: u64,
    /// Fraction of executions that were slow
    pub slow_rate_warn: f64,
    pub slow_rate_crit: f64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            avg_duration_warn_ms: 500.0,
            avg_duration_crit_ms: 2_000.0,
            error_rate_warn: 0.05,
            error_rate_crit: 0.20,
            memory_warn_bytes: 384 * 1024 * 1024,
            memory_crit_bytes: 512 * 1024 * 1024,
            slow_rate_warn: 0.10,
            slow_rate_crit: 0.30,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ThresholdReport {
    pub alerts: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MemoryReport {
    pub used_bytes: u64,
    pub max_bytes: u64,
}

/// Snapshot assembled by `get_performance_report`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PerformanceReport {
    pub total_executions: u64,
    pub total_failures: u64,
    pub avg_duration_ms: f64,
    pub tracked_query_shapes: usize,
    pub slow_queries: Vec<SlowQuery>,
    pub connection_acquisition_avg_ms: f64,
    pub pool: Option<PoolStats>,
    pub memory: MemoryReport,
    pub errors: Option<ErrorStatistics>,
}

#[derive(Default)]
struct AcquisitionStats {
    count: u64,
    total_ms: f64,
    peak_ms: f64,
}

pub type MemoryProbe = Box<dyn Fn() -> u64 + Send + Sync>;

/// Records per-query-shape timings and failures, keeps a bounded slow-query
/// log, and evaluates alert thresholds.
pub struct PerformanceMonitor {
    config: Mutex<MonitoringConfig>,
    thresholds: PerformanceThresholds,
    metrics: Mutex<HashMap<u64, QueryMetrics>>,
    slow_queries: Mutex<VecDeque<SlowQuery>>,
    acquisition: Mutex<AcquisitionStats>,
    pool: Option<Arc<ConnectionPool>>,
    errors: Option<Arc<ErrorAggregator>>,
    memory_probe: Mutex<Option<MemoryProbe>>,
    max_memory_bytes: u64,
    cleanup_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            config: Mutex::new(config),
            thresholds: PerformanceThresholds::default(),
            metrics: Mutex::new(HashMap::new()),
            slow_queries: Mutex::new(VecDeque::new()),
            acquisition: Mutex::new(AcquisitionStats::default()),
            pool: None,
            errors: None,
            memory_probe: Mutex::new(None),
            max_memory_bytes: 512 * 1024 * 1024,
            cleanup_task: Mutex::new(None),
        }
    }

    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_error_aggregator(mut self, errors: Arc<ErrorAggregator>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn with_thresholds(mut self, thresholds: PerformanceThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_max_memory(mut self, max_bytes: u64) -> Self {
        self.max_memory_bytes = max_bytes;
        self
    }

    /// Injects a memory usage probe; defaults to an estimate derived from
    /// tracked state when absent.
    pub fn set_memory_probe(&self, probe: MemoryProbe) {
        *self.memory_probe.lock().expect("memory probe lock poisoned") = Some(probe);
    }

    fn enabled(&self) -> bool {
        self.config.lock().expect("config lock poisoned").enabled
    }

    fn slow_threshold_ms(&self) -> f64 {
        self.config
            .lock()
            .expect("config lock poisoned")
            .slow_query_threshold_ms as f64
    }

    /// Records one statement execution against its query shape.
    pub fn record_query_execution(
        &self,
        sql: &str,
        duration: Duration,
        ok: bool,
        row_count: Option<usize>,
        error: Option<&str>,
    ) {
        if !self.enabled() {
            return;
        }
        let hash = QueryOptimizer::query_hash(sql);
        let duration_ms = duration.as_secs_f64() * 1_000.0;
        let now = Utc::now();

        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            let entry = metrics.entry(hash).or_insert_with(|| QueryMetrics {
                sql: sql.to_string(),
                execution_count: 0,
                total_time_ms: 0.0,
                avg_time_ms: 0.0,
                min_time_ms: f64::MAX,
                max_time_ms: 0.0,
                success_count: 0,
                failure_count: 0,
                avg_rows_returned: 0.0,
                last_execution: now,
            });
            entry.execution_count += 1;
            entry.total_time_ms += duration_ms;
            entry.avg_time_ms = entry.total_time_ms / entry.execution_count as f64;
            entry.min_time_ms = entry.min_time_ms.min(duration_ms);
            entry.max_time_ms = entry.max_time_ms.max(duration_ms);
            entry.last_execution = now;
            if ok {
                entry.success_count += 1;
                if let Some(rows) = row_count {
                    // Running average over successes only
                    let n = entry.success_count as f64;
                    entry.avg_rows_returned =
                        entry.avg_rows_returned + (rows as f64 - entry.avg_rows_returned) / n;
                }
            } else {
                entry.failure_count += 1;
            }
        }

        if duration_ms > self.slow_threshold_ms() {
            debug!(duration_ms, "slow query recorded");
            let mut slow = self.slow_queries.lock().expect("slow query lock poisoned");
            slow.push_back(SlowQuery {
                hash,
                sql: sql.to_string(),
                duration_ms,
                timestamp: now,
                row_count,
                error: error.map(|e| e.to_string()),
            });
            while slow.len() > MAX_SLOW_QUERIES_STORED {
                slow.pop_front();
            }
        }
    }

    pub fn record_connection_acquisition(&self, duration: Duration) {
        if !self.enabled() {
            return;
        }
        let duration_ms = duration.as_secs_f64() * 1_000.0;
        let mut acquisition = self.acquisition.lock().expect("acquisition lock poisoned");
        acquisition.count += 1;
        acquisition.total_ms += duration_ms;
        acquisition.peak_ms = acquisition.peak_ms.max(duration_ms);
    }

    pub fn get_query_metrics(&self, sql: &str) -> Option<QueryMetrics> {
        let hash = QueryOptimizer::query_hash(sql);
        self.metrics
            .lock()
            .expect("metrics lock poisoned")
            .get(&hash)
            .cloned()
    }

    pub fn get_slow_queries(&self) -> Vec<SlowQuery> {
        self.slow_queries
            .lock()
            .expect("slow query lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn memory_used(&self) -> u64 {
        if let Some(probe) = &*self.memory_probe.lock().expect("memory probe lock poisoned") {
            return probe();
        }
        // Rough resident estimate from tracked state
        let metrics = self.metrics.lock().expect("metrics lock poisoned");
        let slow = self.slow_queries.lock().expect("slow query lock poisoned");
        (metrics.len() * 256 + slow.len() * 512) as u64
    }

    pub fn get_performance_report(&self) -> PerformanceReport {
        let metrics = self.metrics.lock().expect("metrics lock poisoned");
        let total_executions: u64 = metrics.values().map(|m| m.execution_count).sum();
        let total_failures: u64 = metrics.values().map(|m| m.failure_count).sum();
        let total_time: f64 = metrics.values().map(|m| m.total_time_ms).sum();
        let avg_duration_ms = if total_executions > 0 {
            total_time / total_executions as f64
        } else {
            0.0
        };
        let tracked_query_shapes = metrics.len();
        drop(metrics);

        let mut slow_queries = self.get_slow_queries();
        slow_queries.sort_by(|a, b| {
            b.duration_ms
                .partial_cmp(&a.duration_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        slow_queries.truncate(REPORT_TOP_SLOW);

        let acquisition = self.acquisition.lock().expect("acquisition lock poisoned");
        let connection_acquisition_avg_ms = if acquisition.count > 0 {
            acquisition.total_ms / acquisition.count as f64
        } else {
            0.0
        };
        drop(acquisition);

        PerformanceReport {
            total_executions,
            total_failures,
            avg_duration_ms,
            tracked_query_shapes,
            slow_queries,
            connection_acquisition_avg_ms,
            pool: self.pool.as_ref().map(|p| p.stats()),
            memory: MemoryReport {
                used_bytes: self.memory_used(),
                max_bytes: self.max_memory_bytes,
            },
            errors: self.errors.as_ref().map(|e| e.get_error_statistics()),
        }
    }

    /// Compares current aggregates against the configured thresholds.
    pub fn check_thresholds(&self) -> ThresholdReport {
        let report = self.get_performance_report();
        let mut out = ThresholdReport::default();
        let thresholds = &self.thresholds;

        if report.avg_duration_ms > thresholds.avg_duration_crit_ms {
            out.alerts.push(format!(
                "average query duration {:.1}ms exceeds critical threshold {:.0}ms",
                report.avg_duration_ms, thresholds.avg_duration_crit_ms
            ));
        } else if report.avg_duration_ms > thresholds.avg_duration_warn_ms {
            out.warnings.push(format!(
                "average query duration {:.1}ms exceeds warning threshold {:.0}ms",
                report.avg_duration_ms, thresholds.avg_duration_warn_ms
            ));
        }

        if report.total_executions > 0 {
            let error_rate = report.total_failures as f64 / report.total_executions as f64;
            if error_rate > thresholds.error_rate_crit {
                out.alerts
                    .push(format!("error rate {:.1}% is critical", error_rate * 100.0));
            } else if error_rate > thresholds.error_rate_warn {
                out.warnings
                    .push(format!("error rate {:.1}% is elevated", error_rate * 100.0));
            }

            let slow_count = self
                .slow_queries
                .lock()
                .expect("slow query lock poisoned")
                .len() as f64;
            let slow_rate = slow_count / report.total_executions as f64;
            if slow_rate > thresholds.slow_rate_crit {
                out.alerts
                    .push(format!("slow query rate {:.1}% is critical", slow_rate * 100.0));
            } else if slow_rate > thresholds.slow_rate_warn {
                out.warnings
                    .push(format!("slow query rate {:.1}% is elevated", slow_rate * 100.0));
            }
        }

        if report.memory.used_bytes > thresholds.memory_crit_bytes {
            out.alerts.push(format!(
                "memory usage {} bytes exceeds critical threshold",
                report.memory.used_bytes
            ));
        } else if report.memory.used_bytes > thresholds.memory_warn_bytes {
            out.warnings.push(format!(
                "memory usage {} bytes exceeds warning threshold",
                report.memory.used_bytes
            ));
        }

        out
    }

    /// Drops per-shape and slow-query entries older than the retention
    /// window.
    pub fn clear_old_metrics(&self) {
        let retention_ms = self
            .config
            .lock()
            .expect("config lock poisoned")
            .retention_ms;
        let cutoff = Utc::now() - chrono::Duration::milliseconds(retention_ms as i64);

        let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
        let before = metrics.len();
        metrics.retain(|_, m| m.last_execution >= cutoff);
        let dropped = before - metrics.len();
        drop(metrics);

        let mut slow = self.slow_queries.lock().expect("slow query lock poisoned");
        while slow
            .front()
            .map(|s| s.timestamp < cutoff)
            .unwrap_or(false)
        {
            slow.pop_front();
        }

        if dropped > 0 {
            debug!(dropped, "retention sweep dropped stale query shapes");
        }
    }

    pub fn reset_metrics(&self) {
        self.metrics.lock().expect("metrics lock poisoned").clear();
        self.slow_queries
            .lock()
            .expect("slow query lock poisoned")
            .clear();
        *self.acquisition.lock().expect("acquisition lock poisoned") =
            AcquisitionStats::default();
        info!("performance metrics reset");
    }

    pub fn update_config(&self, config: MonitoringConfig) {
        *self.config.lock().expect("config lock poisoned") = config;
    }

    /// Starts the periodic retention sweep. One task per monitor; calling
    /// again replaces the previous task.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let retention_ms = self
            .config
            .lock()
            .expect("config lock poisoned")
            .retention_ms;
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(retention_ms.max(1_000)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                monitor.clear_old_metrics();
            }
        });
        let mut task = self.cleanup_task.lock().expect("cleanup task lock poisoned");
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    /// Stops the cleanup task if one is running.
    pub fn close(&self) {
        if let Some(handle) = self
            .cleanup_task
            .lock()
            .expect("cleanup task lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        self.close();
    }
}
