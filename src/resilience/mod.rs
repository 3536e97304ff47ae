// Resilience primitives shared by the storage layers: cooperative
// cancellation, timeout budgets, and retry policies.

pub mod cancel;
pub mod retry;
pub mod timeout;

pub use cancel::CancelToken;
pub use retry::{retry_async, retry_blocking, RetryConfig, RetryPolicy};
pub use timeout::{OperationClass, TimeoutRegistry};
