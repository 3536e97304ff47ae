use crate::error::{Result, StoreError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Operation classes with distinct timeout budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Database,
    Parsing,
    Network,
    Filesystem,
    Indexing,
    Query,
    Connection,
    Default,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Database => "database",
            OperationClass::Parsing => "parsing",
            OperationClass::Network => "network",
            OperationClass::Filesystem => "filesystem",
            OperationClass::Indexing => "indexing",
            OperationClass::Query => "query",
            OperationClass::Connection => "connection",
            OperationClass::Default => "default",
        }
    }

    fn default_budget(&self) -> Duration {
        match self {
            OperationClass::Database => Duration::from_secs(30),
            OperationClass::Parsing => Duration::from_secs(10),
            OperationClass::Network => Duration::from_secs(5),
            OperationClass::Filesystem => Duration::from_secs(5),
            OperationClass::Indexing => Duration::from_secs(300),
            OperationClass::Query => Duration::from_secs(30),
            OperationClass::Connection => Duration::from_secs(10),
            OperationClass::Default => Duration::from_secs(10),
        }
    }
}

/// Central registry of per-operation-class timeout budgets.
///
/// Defaults follow the engine contract; individual classes can be overridden
/// at runtime without touching the rest.
#[derive(Debug, Default)]
pub struct TimeoutRegistry {
    overrides: Mutex<HashMap<OperationClass, Duration>>,
}

impl TimeoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn budget(&self, class: OperationClass) -> Duration {
        self.overrides
            .lock()
            .expect("timeout registry lock poisoned")
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_budget())
    }

    pub fn set_budget(&self, class: OperationClass, budget: Duration) {
        self.overrides
            .lock()
            .expect("timeout registry lock poisoned")
            .insert(class, budget);
    }

    /// Runs a future under the class budget. Fails with a Timeout error
    /// carrying the operation class, budget, and elapsed time.
    pub async fn with_timeout<F, T>(&self, class: OperationClass, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let budget = self.budget(class);
        let started = Instant::now();
        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = started.elapsed();
                warn!(
                    operation = class.as_str(),
                    timeout_ms = budget.as_millis() as u64,
                    "operation exceeded its timeout budget"
                );
                Err(StoreError::timeout(
                    class.as_str(),
                    budget.as_millis() as u64,
                    elapsed.as_millis() as u64,
                ))
            }
        }
    }

    /// Blocking variant. The closure runs to completion; if it overruns the
    /// budget the result is discarded and a Timeout error is returned, since
    /// an in-flight statement cannot be interrupted.
    pub fn block_with_timeout<F, T>(&self, class: OperationClass, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let budget = self.budget(class);
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed();
        if elapsed > budget {
            warn!(
                operation = class.as_str(),
                elapsed_ms = elapsed.as_millis() as u64,
                "blocking operation overran its timeout budget"
            );
            return Err(StoreError::timeout(
                class.as_str(),
                budget.as_millis() as u64,
                elapsed.as_millis() as u64,
            ));
        }
        result
    }

    /// Progressive variant: on a Timeout failure the budget is multiplied and
    /// the operation retried, up to `max_attempts`. Validation and constraint
    /// failures are returned immediately.
    pub async fn with_progressive_timeout<F, Fut, T>(
        &self,
        class: OperationClass,
        multiplier: f64,
        max_attempts: u32,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut budget = self.budget(class);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            match tokio::time::timeout(budget, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => return Err(err),
                Err(_) if attempt < max_attempts => {
                    warn!(
                        operation = class.as_str(),
                        attempt,
                        timeout_ms = budget.as_millis() as u64,
                        "timeout, retrying with a larger budget"
                    );
                    budget = Duration::from_millis(
                        ((budget.as_millis() as f64) * multiplier).round() as u64,
                    );
                }
                Err(_) => {
                    return Err(StoreError::timeout(
                        class.as_str(),
                        budget.as_millis() as u64,
                        started.elapsed().as_millis() as u64,
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budgets() {
        let registry = TimeoutRegistry::new();
        assert_eq!(
            registry.budget(OperationClass::Database),
            Duration::from_secs(30)
        );
        assert_eq!(
            registry.budget(OperationClass::Indexing),
            Duration::from_secs(300)
        );
        assert_eq!(
            registry.budget(OperationClass::Default),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_override_budget() {
        let registry = TimeoutRegistry::new();
        registry.set_budget(OperationClass::Query, Duration::from_millis(50));
        assert_eq!(
            registry.budget(OperationClass::Query),
            Duration::from_millis(50)
        );
        // Other classes keep their defaults
        assert_eq!(
            registry.budget(OperationClass::Database),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn test_with_timeout_passes_fast_operations() {
        let registry = TimeoutRegistry::new();
        let result = registry
            .with_timeout(OperationClass::Query, async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn test_with_timeout_fails_slow_operations() {
        let registry = TimeoutRegistry::new();
        registry.set_budget(OperationClass::Query, Duration::from_millis(10));
        let err = registry
            .with_timeout(OperationClass::Query, async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        match err {
            StoreError::Timeout {
                operation_type,
                timeout_ms,
                ..
            } => {
                assert_eq!(operation_type, "query");
                assert_eq!(timeout_ms, 10);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_block_with_timeout_reports_overrun() {
        let registry = TimeoutRegistry::new();
        registry.set_budget(OperationClass::Filesystem, Duration::from_millis(5));
        let err = registry
            .block_with_timeout(OperationClass::Filesystem, || {
                std::thread::sleep(Duration::from_millis(30));
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_progressive_timeout_eventually_succeeds() {
        let registry = TimeoutRegistry::new();
        registry.set_budget(OperationClass::Network, Duration::from_millis(20));
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = registry
            .with_progressive_timeout(OperationClass::Network, 4.0, 3, || {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert!(result >= 1);
    }

    #[tokio::test]
    async fn test_progressive_timeout_does_not_retry_validation() {
        let registry = TimeoutRegistry::new();
        let err = registry
            .with_progressive_timeout(OperationClass::Database, 2.0, 3, || async {
                Err::<(), _>(StoreError::validation("bad input"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConstraintViolation);
    }
}
