pub mod backend;
pub mod cache;
pub mod dispatch;
pub mod executor;
pub mod metrics;
#[cfg(test)]
mod testing;

pub use backend::{Backend, BackendError, HttpBackend};
pub use cache::{CacheError, Fidelity, ModelCatalog, ResourceCache, WarmHandle};
pub use dispatch::{Dispatcher, DispatcherSettings};
pub use executor::{ExecuteError, Executor, FailureKind, Outcome, OutcomeResult, RetryPolicy};
pub use metrics::{DispatchMetrics, SharedMetrics};
