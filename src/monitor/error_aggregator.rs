use crate::config::AlertingConfig;
use crate::error::{ErrorKind, StoreError};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, warn};

/// Raw observations older than this are dropped by cleanup.
const RATE_WINDOW: Duration = Duration::from_secs(10 * 60);
/// Aggregations idle longer than this with a small count are dropped.
const AGGREGATION_WINDOW: Duration = Duration::from_secs(60 * 60);
const AGGREGATION_KEEP_COUNT: u64 = 5;
const MAX_SAMPLE_ERRORS: usize = 5;
const MAX_ACTIVE_ALERTS: usize = 50;
/// Distinct error kinds sharing a keyword before a pattern is reported.
const PATTERN_MIN_KINDS: usize = 3;
const SPIKE_FACTOR: f64 = 3.0;
const SPIKE_MIN_COUNT: u64 = 5;

#[derive(Debug, Clone)]
struct Observation {
    service: String,
    operation: String,
    timestamp: DateTime<Utc>,
    error_count: u64,
    total_requests: u64,
}

/// A unique error shape with its occurrence envelope.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AggregatedError {
    pub kind: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sample_errors: Vec<String>,
    pub services: Vec<String>,
    pub operations: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub total_requests: u64,
    pub errors_per_minute: f64,
    pub unique_errors: usize,
    pub by_kind: HashMap<String, u64>,
}

/// A detected cross-error pattern, e.g. a cluster of timeout shapes.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ErrorPattern {
    pub name: String,
    pub kinds: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ErrorRate,
    CriticalError,
    ErrorSpike,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ErrorRate => "error_rate",
            AlertKind::CriticalError => "critical_error",
            AlertKind::ErrorSpike => "error_spike",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub message: String,
    pub value: f64,
    pub triggered_at: DateTime<Utc>,
}

pub type AlertHandler = Box<dyn Fn(&Alert) + Send + Sync>;

/// Aggregates error observations, computes rates, detects patterns, and
/// dispatches alerts through the configured sink set.
pub struct ErrorAggregator {
    config: AlertingConfig,
    observations: Mutex<VecDeque<Observation>>,
    aggregates: Mutex<HashMap<String, AggregatedError>>,
    active_alerts: Mutex<Vec<Alert>>,
    last_alert: Mutex<HashMap<AlertKind, DateTime<Utc>>>,
    callback: Mutex<Option<AlertHandler>>,
    custom_handlers: Mutex<Vec<AlertHandler>>,
}

impl ErrorAggregator {
    pub fn new(config: AlertingConfig) -> Self {
        Self {
            config,
            observations: Mutex::new(VecDeque::new()),
            aggregates: Mutex::new(HashMap::new()),
            active_alerts: Mutex::new(Vec::new()),
            last_alert: Mutex::new(HashMap::new()),
            callback: Mutex::new(None),
            custom_handlers: Mutex::new(Vec::new()),
        }
    }

    /// Registers the callback alert channel.
    pub fn set_alert_callback(&self, handler: AlertHandler) {
        *self.callback.lock().expect("alert callback lock poisoned") = Some(handler);
    }

    /// Adds a custom alert handler.
    pub fn add_alert_handler(&self, handler: AlertHandler) {
        self.custom_handlers
            .lock()
            .expect("alert handler lock poisoned")
            .push(handler);
    }

    /// Records a failed operation. Handler failures are swallowed with a
    /// logged warning; they never prevent the recording itself.
    pub fn record_error(&self, err: &StoreError, service: &str, operation: &str) {
        let now = Utc::now();
        {
            let mut observations = self.observations.lock().expect("observation lock poisoned");
            observations.push_back(Observation {
                service: service.to_string(),
                operation: operation.to_string(),
                timestamp: now,
                error_count: 1,
                total_requests: 1,
            });
        }
        {
            let mut aggregates = self.aggregates.lock().expect("aggregate lock poisoned");
            let key = format!("{}:{}", err.code(), err.kind().code());
            let message = err.to_string();
            let entry = aggregates.entry(key).or_insert_with(|| AggregatedError {
                kind: err.code().to_string(),
                count: 0,
                first_seen: now,
                last_seen: now,
                sample_errors: Vec::new(),
                services: Vec::new(),
                operations: Vec::new(),
            });
            entry.count += 1;
            entry.last_seen = now;
            if entry.sample_errors.len() < MAX_SAMPLE_ERRORS && !entry.sample_errors.contains(&message)
            {
                entry.sample_errors.push(message);
            }
            if !entry.services.iter().any(|s| s == service) {
                entry.services.push(service.to_string());
            }
            if !entry.operations.iter().any(|o| o == operation) {
                entry.operations.push(operation.to_string());
            }
        }

        if self.config.enabled {
            self.check_alerts(err);
        }
    }

    /// Records a successful operation, feeding the request denominator.
    pub fn record_success(&self, service: &str, operation: &str) {
        let mut observations = self.observations.lock().expect("observation lock poisoned");
        observations.push_back(Observation {
            service: service.to_string(),
            operation: operation.to_string(),
            timestamp: Utc::now(),
            error_count: 0,
            total_requests: 1,
        });
    }

    /// Errors per minute over the last minute.
    pub fn get_error_rate(&self) -> f64 {
        self.errors_in_window(Duration::from_secs(60)) as f64
    }

    fn errors_in_window(&self, window: Duration) -> u64 {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.observations
            .lock()
            .expect("observation lock poisoned")
            .iter()
            .filter(|o| o.timestamp >= cutoff)
            .map(|o| o.error_count)
            .sum()
    }

    pub fn get_error_statistics(&self) -> ErrorStatistics {
        let observations = self.observations.lock().expect("observation lock poisoned");
        let total_errors: u64 = observations.iter().map(|o| o.error_count).sum();
        let total_requests: u64 = observations.iter().map(|o| o.total_requests).sum();
        drop(observations);

        let aggregates = self.aggregates.lock().expect("aggregate lock poisoned");
        let mut by_kind: HashMap<String, u64> = HashMap::new();
        for aggregate in aggregates.values() {
            *by_kind.entry(aggregate.kind.clone()).or_insert(0) += aggregate.count;
        }

        ErrorStatistics {
            total_errors,
            total_requests,
            errors_per_minute: self.get_error_rate(),
            unique_errors: aggregates.len(),
            by_kind,
        }
    }

    pub fn get_aggregated_errors(&self) -> Vec<AggregatedError> {
        self.aggregates
            .lock()
            .expect("aggregate lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Detects clusters: a pattern is reported when at least three distinct
    /// error shapes share a keyword.
    pub fn get_error_patterns(&self) -> Vec<ErrorPattern> {
        let aggregates = self.aggregates.lock().expect("aggregate lock poisoned");
        let mut patterns = Vec::new();
        for (keyword, name) in [("timeout", "timeout cluster"), ("connection", "connection cluster")]
        {
            let kinds: Vec<String> = aggregates
                .values()
                .filter(|a| {
                    a.kind.to_ascii_lowercase().contains(keyword)
                        || a.sample_errors
                            .iter()
                            .any(|s| s.to_ascii_lowercase().contains(keyword))
                })
                .map(|a| a.kind.clone())
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();
            if kinds.len() >= PATTERN_MIN_KINDS {
                patterns.push(ErrorPattern {
                    name: name.to_string(),
                    kinds,
                });
            }
        }
        patterns
    }

    pub fn get_active_alerts(&self) -> Vec<Alert> {
        self.active_alerts
            .lock()
            .expect("alert lock poisoned")
            .clone()
    }

    fn check_alerts(&self, err: &StoreError) {
        let thresholds = &self.config.thresholds;

        let rate = self.get_error_rate();
        if rate > thresholds.error_rate {
            self.fire_alert(
                AlertKind::ErrorRate,
                format!("error rate {rate:.1}/min exceeds threshold {:.1}", thresholds.error_rate),
                rate,
            );
        }

        if is_critical(err.kind()) {
            let critical_count: u64 = self
                .aggregates
                .lock()
                .expect("aggregate lock poisoned")
                .values()
                .filter(|a| is_critical_code(&a.kind))
                .map(|a| a.count)
                .sum();
            if critical_count > thresholds.critical_error_count {
                self.fire_alert(
                    AlertKind::CriticalError,
                    format!(
                        "critical error count {critical_count} exceeds threshold {}",
                        thresholds.critical_error_count
                    ),
                    critical_count as f64,
                );
            }
        }

        let last_minute = self.errors_in_window(Duration::from_secs(60));
        let window_total = self.errors_in_window(RATE_WINDOW);
        let window_minutes = RATE_WINDOW.as_secs() as f64 / 60.0;
        let rolling_average = window_total as f64 / window_minutes;
        if last_minute > SPIKE_MIN_COUNT && last_minute as f64 > rolling_average * SPIKE_FACTOR {
            self.fire_alert(
                AlertKind::ErrorSpike,
                format!(
                    "last-minute errors ({last_minute}) exceed {SPIKE_FACTOR}x the rolling average ({rolling_average:.1})"
                ),
                last_minute as f64,
            );
        }
    }

    /// Fires one alert, honoring the per-kind cooldown.
    fn fire_alert(&self, kind: AlertKind, message: String, value: f64) {
        let now = Utc::now();
        {
            let mut last = self.last_alert.lock().expect("last alert lock poisoned");
            if let Some(previous) = last.get(&kind) {
                let cooldown = chrono::Duration::milliseconds(
                    self.config.thresholds.cooldown_ms as i64,
                );
                if now - *previous < cooldown {
                    return;
                }
            }
            last.insert(kind, now);
        }

        let alert = Alert {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            message,
            value,
            triggered_at: now,
        };

        {
            let mut alerts = self.active_alerts.lock().expect("alert lock poisoned");
            alerts.push(alert.clone());
            let overflow = alerts.len().saturating_sub(MAX_ACTIVE_ALERTS);
            if overflow > 0 {
                alerts.drain(0..overflow);
            }
        }

        self.dispatch(&alert);
    }

    fn dispatch(&self, alert: &Alert) {
        if self.config.log_channel {
            error!(
                alert = alert.kind.as_str(),
                value = alert.value,
                "{}",
                alert.message
            );
        }

        if let Some(handler) = &*self.callback.lock().expect("alert callback lock poisoned") {
            if let Err(panic) =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(alert)))
            {
                warn!(?panic, "alert callback failed");
            }
        }
        for handler in self
            .custom_handlers
            .lock()
            .expect("alert handler lock poisoned")
            .iter()
        {
            if let Err(panic) =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(alert)))
            {
                warn!(?panic, "custom alert handler failed");
            }
        }
    }

    /// Drops stale observations and idle low-count aggregations.
    pub fn run_cleanup(&self) {
        let observation_cutoff = Utc::now()
            - chrono::Duration::from_std(RATE_WINDOW).unwrap_or_else(|_| chrono::Duration::minutes(10));
        {
            let mut observations = self.observations.lock().expect("observation lock poisoned");
            while observations
                .front()
                .map(|o| o.timestamp < observation_cutoff)
                .unwrap_or(false)
            {
                observations.pop_front();
            }
        }

        let aggregate_cutoff = Utc::now()
            - chrono::Duration::from_std(AGGREGATION_WINDOW)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        self.aggregates
            .lock()
            .expect("aggregate lock poisoned")
            .retain(|_, a| a.last_seen >= aggregate_cutoff || a.count >= AGGREGATION_KEEP_COUNT);
    }

    /// Lists services seen in the retained observation window.
    pub fn observed_services(&self) -> Vec<String> {
        let observations = self.observations.lock().expect("observation lock poisoned");
        let mut services: Vec<String> = Vec::new();
        for o in observations.iter() {
            if !services.iter().any(|s| s == &o.service) {
                services.push(o.service.clone());
            }
        }
        services
    }
}

fn is_critical(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionFailed | ErrorKind::TransactionFailed | ErrorKind::MigrationFailed
    )
}

fn is_critical_code(code: &str) -> bool {
    matches!(
        code,
        "CONNECTION_FAILED" | "TRANSACTION_FAILED" | "MIGRATION_FAILED"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertThresholds;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn aggregator_with_thresholds(error_rate: f64, cooldown_ms: u64) -> ErrorAggregator {
        ErrorAggregator::new(AlertingConfig {
            enabled: true,
            thresholds: AlertThresholds {
                error_rate,
                critical_error_count: 3,
                cooldown_ms,
            },
            log_channel: false,
        })
    }

    #[test]
    fn test_aggregation_by_kind() {
        let aggregator = aggregator_with_thresholds(1_000.0, 60_000);
        for _ in 0..3 {
            aggregator.record_error(&StoreError::validation("bad hash"), "files", "save");
        }
        aggregator.record_error(&StoreError::connection("refused"), "pool", "acquire");

        let aggregates = aggregator.get_aggregated_errors();
        assert_eq!(aggregates.len(), 2);
        let validation = aggregates
            .iter()
            .find(|a| a.kind == "CONSTRAINT_VIOLATION")
            .unwrap();
        assert_eq!(validation.count, 3);
        assert_eq!(validation.services, vec!["files"]);
        assert!(validation.sample_errors.len() <= MAX_SAMPLE_ERRORS);
    }

    #[test]
    fn test_sample_errors_bounded() {
        let aggregator = aggregator_with_thresholds(1_000.0, 60_000);
        for i in 0..10 {
            aggregator.record_error(
                &StoreError::validation(format!("bad input {i}")),
                "files",
                "save",
            );
        }
        let aggregates = aggregator.get_aggregated_errors();
        assert_eq!(aggregates[0].sample_errors.len(), MAX_SAMPLE_ERRORS);
        assert_eq!(aggregates[0].count, 10);
    }

    #[test]
    fn test_statistics_track_rates() {
        let aggregator = aggregator_with_thresholds(1_000.0, 60_000);
        aggregator.record_success("search", "search_by_tags");
        aggregator.record_success("search", "search_by_tags");
        aggregator.record_error(&StoreError::validation("boom"), "search", "search_by_tags");

        let stats = aggregator.get_error_statistics();
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.unique_errors, 1);
        assert!(stats.errors_per_minute >= 1.0);
    }

    #[test]
    fn test_error_rate_alert_fires_with_cooldown() {
        let aggregator = aggregator_with_thresholds(2.0, 60_000);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        aggregator.set_alert_callback(Box::new(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        }));

        // Four errors: enough to cross the rate threshold, not enough to
        // look like a spike
        for _ in 0..4 {
            aggregator.record_error(&StoreError::validation("x"), "files", "save");
        }

        // Threshold crossed repeatedly but the cooldown admits one alert
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let alerts = aggregator.get_active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::ErrorRate);
    }

    #[test]
    fn test_error_spike_alert() {
        let aggregator = aggregator_with_thresholds(1_000.0, 60_000);
        // A burst well above the rolling average and above the spike floor
        for _ in 0..8 {
            aggregator.record_error(&StoreError::validation("x"), "files", "save");
        }
        let alerts = aggregator.get_active_alerts();
        assert!(alerts.iter().any(|a| a.kind == AlertKind::ErrorSpike));
    }

    #[test]
    fn test_handler_panic_does_not_block_recording() {
        let aggregator = aggregator_with_thresholds(1.0, 60_000);
        aggregator.add_alert_handler(Box::new(|_| panic!("handler exploded")));

        for _ in 0..5 {
            aggregator.record_error(&StoreError::validation("x"), "files", "save");
        }
        assert_eq!(aggregator.get_error_statistics().total_errors, 5);
    }

    #[test]
    fn test_pattern_detection_needs_three_kinds() {
        let aggregator = aggregator_with_thresholds(1_000.0, 60_000);
        aggregator.record_error(&StoreError::timeout("database", 10, 20), "db", "run");
        aggregator.record_error(
            &StoreError::connection("connect timeout"),
            "pool",
            "acquire",
        );
        assert!(aggregator.get_error_patterns().is_empty());

        aggregator.record_error(
            &StoreError::QueryFailed {
                message: "statement timeout".to_string(),
                statement: None,
                timestamp: Utc::now(),
            },
            "db",
            "query",
        );
        aggregator.record_error(
            &StoreError::resource_exhausted("pool acquisition timeout", None),
            "pool",
            "acquire",
        );

        let patterns = aggregator.get_error_patterns();
        assert!(patterns.iter().any(|p| p.name == "timeout cluster"));
    }

    #[test]
    fn test_cleanup_retains_heavy_aggregates() {
        let aggregator = aggregator_with_thresholds(1_000.0, 60_000);
        for _ in 0..10 {
            aggregator.record_error(&StoreError::validation("frequent"), "files", "save");
        }
        aggregator.run_cleanup();
        // Recent and heavy: retained
        assert_eq!(aggregator.get_aggregated_errors().len(), 1);
    }

    #[test]
    fn test_disabled_alerting_still_aggregates() {
        let aggregator = ErrorAggregator::new(AlertingConfig {
            enabled: false,
            thresholds: AlertThresholds {
                error_rate: 0.5,
                critical_error_count: 1,
                cooldown_ms: 0,
            },
            log_channel: false,
        });
        for _ in 0..5 {
            aggregator.record_error(&StoreError::validation("x"), "files", "save");
        }
        assert!(aggregator.get_active_alerts().is_empty());
        assert_eq!(aggregator.get_error_statistics().total_errors, 5);
    }
}
