use crate::monitor::error_aggregator::ErrorAggregator;
use crate::monitor::performance::PerformanceMonitor;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Bounded transition history.
const MAX_HISTORY: usize = 50;
/// Default evaluation tick.
pub const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(30);

/// A named privilege gating work a caller may attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Search,
    Indexing,
    Parsing,
    FileOps,
    DbOps,
    NetworkOps,
    Caching,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Search => "search",
            Capability::Indexing => "indexing",
            Capability::Parsing => "parsing",
            Capability::FileOps => "file_ops",
            Capability::DbOps => "db_ops",
            Capability::NetworkOps => "network_ops",
            Capability::Caching => "caching",
        }
    }
}

/// Capability tiers, strictest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DegradationLevel {
    Full,
    Limited,
    Basic,
    Emergency,
}

impl DegradationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::Full => "FULL",
            DegradationLevel::Limited => "LIMITED",
            DegradationLevel::Basic => "BASIC",
            DegradationLevel::Emergency => "EMERGENCY",
        }
    }

    /// The capability set granted at this level.
    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            DegradationLevel::Full => &[
                Capability::Search,
                Capability::Indexing,
                Capability::Parsing,
                Capability::FileOps,
                Capability::DbOps,
                Capability::NetworkOps,
                Capability::Caching,
            ],
            DegradationLevel::Limited => &[
                Capability::Search,
                Capability::FileOps,
                Capability::DbOps,
            ],
            DegradationLevel::Basic => &[Capability::Search, Capability::FileOps],
            DegradationLevel::Emergency => &[Capability::FileOps],
        }
    }

    fn from_ordinal(value: u8) -> Self {
        match value {
            0 => DegradationLevel::Full,
            1 => DegradationLevel::Limited,
            2 => DegradationLevel::Basic,
            _ => DegradationLevel::Emergency,
        }
    }

    fn ordinal(&self) -> u8 {
        match self {
            DegradationLevel::Full => 0,
            DegradationLevel::Limited => 1,
            DegradationLevel::Basic => 2,
            DegradationLevel::Emergency => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Memory fraction in 0..1
    ResourceUsage,
    /// Errors per minute
    ErrorRate,
    /// Average query duration in milliseconds
    ResponseTime,
    Manual,
}

/// A condition that, when its metric meets the threshold, pulls the system
/// down to `level`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DegradationTrigger {
    pub kind: TriggerKind,
    pub threshold: f64,
    pub level: DegradationLevel,
    pub enabled: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Transition {
    pub from: DegradationLevel,
    pub to: DegradationLevel,
    pub reason: String,
    pub at: DateTime<Utc>,
}

pub type ResourceProbe = Box<dyn Fn() -> f64 + Send + Sync>;

/// Maps observed metrics to one of four capability tiers and gates features.
///
/// The performance monitor and the error aggregator are the two metric
/// inputs, wired explicitly at construction. On each evaluation every
/// enabled trigger is checked and the strictest firing level is adopted;
/// FULL is re-entered when all triggers clear or on explicit `reset`.
pub struct DegradationManager {
    level: AtomicU8,
    triggers: Mutex<Vec<DegradationTrigger>>,
    history: Mutex<VecDeque<Transition>>,
    monitor: Option<Arc<PerformanceMonitor>>,
    errors: Option<Arc<ErrorAggregator>>,
    resource_probe: Mutex<Option<ResourceProbe>>,
    manual_level: Mutex<Option<DegradationLevel>>,
    evaluation_interval: Duration,
    ticker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DegradationManager {
    pub fn new(
        monitor: Option<Arc<PerformanceMonitor>>,
        errors: Option<Arc<ErrorAggregator>>,
    ) -> Self {
        Self {
            level: AtomicU8::new(DegradationLevel::Full.ordinal()),
            triggers: Mutex::new(Self::default_triggers()),
            history: Mutex::new(VecDeque::new()),
            monitor,
            errors,
            resource_probe: Mutex::new(None),
            manual_level: Mutex::new(None),
            evaluation_interval: DEFAULT_EVALUATION_INTERVAL,
            ticker: Mutex::new(None),
        }
    }

    fn default_triggers() -> Vec<DegradationTrigger> {
        vec![
            DegradationTrigger {
                kind: TriggerKind::ErrorRate,
                threshold: 30.0,
                level: DegradationLevel::Limited,
                enabled: true,
            },
            DegradationTrigger {
                kind: TriggerKind::ErrorRate,
                threshold: 120.0,
                level: DegradationLevel::Emergency,
                enabled: true,
            },
            DegradationTrigger {
                kind: TriggerKind::ResponseTime,
                threshold: 2_000.0,
                level: DegradationLevel::Limited,
                enabled: true,
            },
            DegradationTrigger {
                kind: TriggerKind::ResponseTime,
                threshold: 10_000.0,
                level: DegradationLevel::Basic,
                enabled: true,
            },
            DegradationTrigger {
                kind: TriggerKind::ResourceUsage,
                threshold: 0.85,
                level: DegradationLevel::Limited,
                enabled: true,
            },
            DegradationTrigger {
                kind: TriggerKind::ResourceUsage,
                threshold: 0.95,
                level: DegradationLevel::Emergency,
                enabled: true,
            },
        ]
    }

    /// Replaces the trigger set.
    pub fn set_triggers(&self, triggers: Vec<DegradationTrigger>) {
        *self.triggers.lock().expect("trigger lock poisoned") = triggers;
    }

    pub fn triggers(&self) -> Vec<DegradationTrigger> {
        self.triggers.lock().expect("trigger lock poisoned").clone()
    }

    /// Injects the resource usage probe (fraction of budget in use, 0..1).
    pub fn set_resource_probe(&self, probe: ResourceProbe) {
        *self
            .resource_probe
            .lock()
            .expect("resource probe lock poisoned") = Some(probe);
    }

    pub fn current_level(&self) -> DegradationLevel {
        DegradationLevel::from_ordinal(self.level.load(Ordering::Acquire))
    }

    /// The single query callers make before starting expensive work.
    pub fn is_capability_available(&self, capability: Capability) -> bool {
        self.current_level().capabilities().contains(&capability)
    }

    pub fn active_capabilities(&self) -> &'static [Capability] {
        self.current_level().capabilities()
    }

    /// Checks every enabled trigger and adopts the strictest firing level.
    pub fn evaluate(&self) {
        let manual = *self.manual_level.lock().expect("manual level lock poisoned");
        let error_rate = self.errors.as_ref().map(|e| e.get_error_rate());
        let avg_response = self
            .monitor
            .as_ref()
            .map(|m| m.get_performance_report().avg_duration_ms);
        let resource_usage = self
            .resource_probe
            .lock()
            .expect("resource probe lock poisoned")
            .as_ref()
            .map(|probe| probe());

        let mut target = DegradationLevel::Full;
        let mut reason = "all triggers clear".to_string();

        for trigger in self.triggers.lock().expect("trigger lock poisoned").iter() {
            if !trigger.enabled {
                continue;
            }
            let metric = match trigger.kind {
                TriggerKind::ErrorRate => error_rate,
                TriggerKind::ResponseTime => avg_response,
                TriggerKind::ResourceUsage => resource_usage,
                TriggerKind::Manual => manual.map(|_| 1.0),
            };
            let fired = match trigger.kind {
                TriggerKind::Manual => manual.is_some(),
                _ => metric.map(|m| m >= trigger.threshold).unwrap_or(false),
            };
            if fired {
                let level = if trigger.kind == TriggerKind::Manual {
                    manual.unwrap_or(trigger.level)
                } else {
                    trigger.level
                };
                if level.ordinal() > target.ordinal() {
                    target = level;
                    reason = match trigger.kind {
                        TriggerKind::ErrorRate => format!(
                            "error rate {:.1}/min reached threshold {:.1}",
                            metric.unwrap_or(0.0),
                            trigger.threshold
                        ),
                        TriggerKind::ResponseTime => format!(
                            "average response time {:.0}ms reached threshold {:.0}ms",
                            metric.unwrap_or(0.0),
                            trigger.threshold
                        ),
                        TriggerKind::ResourceUsage => format!(
                            "resource usage {:.0}% reached threshold {:.0}%",
                            metric.unwrap_or(0.0) * 100.0,
                            trigger.threshold * 100.0
                        ),
                        TriggerKind::Manual => "manual degradation requested".to_string(),
                    };
                }
            }
        }

        // A standing manual request always participates, even without a
        // Manual trigger in the set
        if let Some(level) = manual {
            if level.ordinal() > target.ordinal() {
                target = level;
                reason = "manual degradation requested".to_string();
            }
        }

        self.transition_to(target, &reason);
    }

    /// Pins the system at `level` until `reset`.
    pub fn manual_degrade(&self, level: DegradationLevel, reason: &str) {
        *self.manual_level.lock().expect("manual level lock poisoned") = Some(level);
        self.transition_to(level, reason);
    }

    /// Clears any manual pin and returns to FULL.
    pub fn reset(&self) {
        *self.manual_level.lock().expect("manual level lock poisoned") = None;
        self.transition_to(DegradationLevel::Full, "explicit reset");
    }

    fn transition_to(&self, target: DegradationLevel, reason: &str) {
        let previous =
            DegradationLevel::from_ordinal(self.level.swap(target.ordinal(), Ordering::AcqRel));
        if previous == target {
            return;
        }

        if target.ordinal() > previous.ordinal() {
            warn!(
                from = previous.as_str(),
                to = target.as_str(),
                reason,
                "degrading capability level"
            );
        } else {
            info!(
                from = previous.as_str(),
                to = target.as_str(),
                reason,
                "restoring capability level"
            );
        }

        let mut history = self.history.lock().expect("history lock poisoned");
        history.push_back(Transition {
            from: previous,
            to: target,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        while history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<Transition> {
        self.history
            .lock()
            .expect("history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Starts the periodic evaluation tick. Calling again replaces the
    /// previous ticker.
    pub fn start_evaluation_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = self.evaluation_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.evaluate();
            }
        });
        let mut ticker = self.ticker.lock().expect("ticker lock poisoned");
        if let Some(previous) = ticker.replace(handle) {
            previous.abort();
        }
    }

    pub fn close(&self) {
        if let Some(handle) = self.ticker.lock().expect("ticker lock poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for DegradationManager {
    fn drop(&mut self) {
        self.close();
    }
}
