//! Outbound call orchestration
//!
//! The dispatch engine is the single entry point for upstream calls. Each
//! call waits for a slot under a global concurrency gate (FIFO admission),
//! takes a key from the pool, issues the HTTP call, and runs the
//! classify/reconcile/retry loop until it reaches a terminal outcome.
//! Every attempt's outcome is recorded through the buffered log sink, and
//! successful calls feed the per-period usage counters.
//!
//! Supporting pieces:
//! - [`retry::RetryConfig`]: capped exponential backoff with jitter
//! - [`cost::CostFn`]: pluggable per-operation credit cost
//! - [`usage::UsageReconciler`]: authoritative usage fetch for ambiguous
//!   rate limits and periodic sync
//! - [`logsink::LogSink`]: batched, failure-tolerant audit writer
//! - [`tasks`]: background usage sync, log retention, quota rollover

pub mod cost;
pub mod engine;
pub mod error;
pub mod logsink;
pub mod retry;
pub mod tasks;
pub mod upstream;
pub mod usage;

#[cfg(test)]
pub(crate) mod testing;

pub use cost::{CostFn, default_cost_fn};
pub use engine::{DispatchEngine, EngineConfig};
pub use error::{Error, Result};
pub use logsink::LogSink;
pub use retry::RetryConfig;
pub use upstream::{CallOutcome, DEFAULT_BASE_URL, HttpUpstream, UsageSnapshot, Upstream};
pub use usage::UsageReconciler;
