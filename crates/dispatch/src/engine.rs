//! The select/call/classify/retry loop
//!
//! One engine instance serves every caller. Admission runs through a
//! fair semaphore so calls enter the loop in arrival order and at most
//! `max_concurrent` are in flight past admission. A call holds its slot
//! for the whole loop, including backoff sleeps, and releases it on any
//! terminal outcome.

use std::sync::Arc;
use std::time::Instant;

use keypool::pool::SelectedKey;
use keypool::{Classification, ErrorKind, KeyPool, UpstreamFailure, classify, classify_payload};
use keystore::{KeyStatus, NewLogEntry, Operation};
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::cost::CostFn;
use crate::error::{Error, Result};
use crate::logsink::LogSink;
use crate::retry::RetryConfig;
use crate::upstream::Upstream;
use crate::usage::UsageReconciler;

/// Engine knobs. Both are hot-swappable at runtime; in-flight calls keep
/// the values they started with.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent: usize,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            retry: RetryConfig::default(),
        }
    }
}

pub struct DispatchEngine {
    pool: Arc<KeyPool>,
    upstream: Arc<dyn Upstream>,
    reconciler: UsageReconciler,
    logs: Arc<LogSink>,
    cost: CostFn,
    /// Replaced wholesale on a limit change; holders of old permits drain
    /// against the old semaphore.
    gate: RwLock<Arc<Semaphore>>,
    retry: RwLock<RetryConfig>,
}

impl DispatchEngine {
    pub fn new(
        pool: Arc<KeyPool>,
        upstream: Arc<dyn Upstream>,
        logs: Arc<LogSink>,
        cost: CostFn,
        config: EngineConfig,
    ) -> Self {
        let reconciler = UsageReconciler::new(pool.store().clone(), upstream.clone());
        Self {
            pool,
            upstream,
            reconciler,
            logs,
            cost,
            gate: RwLock::new(Arc::new(Semaphore::new(config.max_concurrent.max(1)))),
            retry: RwLock::new(config.retry),
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    /// Swap the concurrency ceiling. New calls are admitted against the
    /// new limit immediately.
    pub async fn set_max_concurrent(&self, limit: usize) {
        let mut gate = self.gate.write().await;
        *gate = Arc::new(Semaphore::new(limit.max(1)));
        info!(limit, "concurrency limit updated");
    }

    pub async fn set_retry(&self, retry: RetryConfig) {
        *self.retry.write().await = retry;
    }

    /// Execute one operation. Returns the upstream response body on
    /// success, or the terminal classified error.
    pub async fn call(&self, operation: Operation, params: Value) -> Result<Value> {
        let gate = self.gate.read().await.clone();
        let _permit = gate.acquire().await.map_err(|_| Error::Shutdown)?;
        let retry = self.retry.read().await.clone();
        let queued_at = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let Some(key) = self.pool.next().await else {
                warn!(operation = operation.as_str(), "no api keys available");
                self.log_failure(None, operation, &params, "no_keys", "no api keys available", 0)
                    .await;
                metrics::counter!("gateway_requests_total",
                    "operation" => operation.as_str(), "status" => "no_keys")
                .increment(1);
                return Err(Error::NoAvailableKeys);
            };

            let attempt_started = Instant::now();
            let outcome = self
                .upstream
                .call(operation, key.secret.expose(), &params)
                .await;
            let duration_ms = attempt_started.elapsed().as_millis() as u64;

            let (mut verdict, http_status): (Classification, Option<u16>) = match outcome {
                Ok(ok) if (200..300).contains(&ok.status) => match classify_payload(&ok.body) {
                    None => {
                        return self
                            .finish_success(&key, operation, &params, ok.body, duration_ms, queued_at)
                            .await;
                    }
                    Some(verdict) => (verdict, Some(ok.status)),
                },
                Ok(ok) => {
                    let status = ok.status;
                    let failure = UpstreamFailure::Http {
                        status: ok.status,
                        body: ok.body,
                        retry_after_secs: ok.retry_after_secs,
                    };
                    (classify(&failure), Some(status))
                }
                Err(message) => (classify(&UpstreamFailure::Transport { message }), None),
            };

            // A 429 without quota wording is ambiguous: the monthly limit
            // may in fact be gone. Ask the provider before deciding.
            if verdict.kind == ErrorKind::RateLimit && http_status == Some(429) {
                verdict = self.disambiguate_rate_limit(&key, verdict).await;
            }

            if verdict.kind == ErrorKind::RateLimit {
                let cooldown = verdict.retry_delay.unwrap_or_else(|| retry.delay(attempt));
                self.pool.set_cooldown(key.id, cooldown).await;
            }
            self.pool.mark_failure(key.id, &verdict).await?;
            self.log_failure(
                Some(key.id),
                operation,
                &params,
                verdict.kind.label(),
                &verdict.message,
                duration_ms,
            )
            .await;
            metrics::counter!("gateway_upstream_errors_total", "kind" => verdict.kind.label())
                .increment(1);
            warn!(
                key_id = key.id,
                operation = operation.as_str(),
                kind = verdict.kind.label(),
                attempt,
                error = %verdict.message,
                "upstream call failed"
            );

            if verdict.should_retry && attempt < retry.max_retries {
                let delay = verdict.retry_delay.unwrap_or_else(|| retry.delay(attempt));
                debug!(delay_ms = delay.as_millis() as u64, "backing off before retry");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            metrics::counter!("gateway_requests_total",
                "operation" => operation.as_str(), "status" => "error")
            .increment(1);
            return Err(if verdict.should_retry {
                Error::RetriesExhausted {
                    attempts: attempt + 1,
                    message: verdict.message,
                }
            } else {
                Error::Upstream {
                    kind: verdict.kind,
                    message: verdict.message,
                }
            });
        }
    }

    async fn finish_success(
        &self,
        key: &SelectedKey,
        operation: Operation,
        params: &Value,
        body: Value,
        duration_ms: u64,
        queued_at: Instant,
    ) -> Result<Value> {
        self.pool.mark_success(key.id).await?;
        let cost = (self.cost)(operation, params);
        if let Err(e) = self.pool.store().increment_usage(key.id, operation, cost).await {
            warn!(key_id = key.id, error = %e, "failed to record usage");
        }
        self.logs
            .enqueue(NewLogEntry {
                key_id: Some(key.id),
                operation: operation.as_str().to_string(),
                request_params: Some(params.to_string()),
                response_data: Some(body.to_string()),
                status: "success".into(),
                duration_ms: Some(duration_ms),
                error_type: None,
                error_message: None,
            })
            .await;
        metrics::counter!("gateway_requests_total",
            "operation" => operation.as_str(), "status" => "success")
        .increment(1);
        metrics::histogram!("gateway_request_duration_seconds",
            "operation" => operation.as_str())
        .record(queued_at.elapsed().as_secs_f64());
        debug!(
            key_id = key.id,
            operation = operation.as_str(),
            duration_ms,
            cost,
            "upstream call succeeded"
        );
        Ok(body)
    }

    /// Resolve an ambiguous rate limit against the provider's usage
    /// endpoint. A fetch failure means "remaining unknown": keep the
    /// rate-limit verdict rather than wrongly parking a healthy key.
    async fn disambiguate_rate_limit(
        &self,
        key: &SelectedKey,
        verdict: Classification,
    ) -> Classification {
        match self.reconciler.fetch_usage(key.secret.expose()).await {
            Ok(snapshot) => {
                self.reconciler.record(key.id, snapshot).await;
                if snapshot.remaining().is_some_and(|remaining| remaining <= 0) {
                    info!(
                        key_id = key.id,
                        used = snapshot.used,
                        limit = ?snapshot.limit,
                        "rate limit was quota exhaustion"
                    );
                    Classification {
                        kind: ErrorKind::QuotaExceeded,
                        should_retry: false,
                        disable_to: Some(KeyStatus::QuotaExceeded),
                        retry_delay: None,
                        message: format!(
                            "usage limit reached ({} of {})",
                            snapshot.used,
                            snapshot.limit.unwrap_or(snapshot.used)
                        ),
                        increment_error_count: true,
                    }
                } else {
                    verdict
                }
            }
            Err(e) => {
                debug!(key_id = key.id, error = %e, "usage check failed, treating 429 as transient");
                verdict
            }
        }
    }

    async fn log_failure(
        &self,
        key_id: Option<u64>,
        operation: Operation,
        params: &Value,
        error_type: &str,
        message: &str,
        duration_ms: u64,
    ) {
        self.logs
            .enqueue(NewLogEntry {
                key_id,
                operation: operation.as_str().to_string(),
                request_params: Some(params.to_string()),
                response_data: None,
                status: "error".into(),
                duration_ms: Some(duration_ms),
                error_type: Some(error_type.to_string()),
                error_message: Some(message.to_string()),
            })
            .await;
    }
}
