// Observability and load-shedding: per-query metrics, error aggregation,
// and the capability degradation control loop.

pub mod degradation;
pub mod error_aggregator;
pub mod performance;

pub use degradation::{Capability, DegradationLevel, DegradationManager};
pub use error_aggregator::ErrorAggregator;
pub use performance::PerformanceMonitor;
