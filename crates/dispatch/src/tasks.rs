//! Background maintenance tasks
//!
//! Three periodic loops run alongside the dispatch path: authoritative
//! usage sync for every active key, request-log retention, and the
//! monthly quota rollover that puts exhausted keys back in rotation.

use std::sync::Arc;
use std::time::Duration;

use keypool::KeyPool;
use keystore::{KeyStatus, KeyStore, current_period, days_ago_iso};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::upstream::Upstream;
use crate::usage::UsageReconciler;

const PERIOD_CONFIG_KEY: &str = "quota_period";

/// Spawn the periodic usage sync over all active keys.
pub fn spawn_usage_sync_task(
    pool: Arc<KeyPool>,
    upstream: Arc<dyn Upstream>,
    interval: Duration,
) -> JoinHandle<()> {
    let reconciler = UsageReconciler::new(pool.store().clone(), upstream);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; startup should not burst the
        // usage endpoint for every key at once
        ticker.tick().await;
        loop {
            ticker.tick().await;
            usage_sync_cycle(&pool, &reconciler).await;
        }
    })
}

async fn usage_sync_cycle(pool: &KeyPool, reconciler: &UsageReconciler) {
    for key in pool.store().all_keys().await {
        if key.status != KeyStatus::Active {
            continue;
        }
        reconciler.sync_usage(key.id, &key.key_value).await;
    }
}

/// Spawn the request-log retention loop. Entries older than
/// `retention_days` are deleted each cycle.
pub fn spawn_log_cleanup_task(
    store: Arc<KeyStore>,
    interval: Duration,
    retention_days: i64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            cleanup_cycle(&store, retention_days).await;
        }
    })
}

async fn cleanup_cycle(store: &KeyStore, retention_days: i64) {
    let cutoff = days_ago_iso(retention_days);
    match store.delete_logs_older_than(&cutoff).await {
        Ok(0) => {}
        Ok(deleted) => info!(deleted, "pruned old request logs"),
        Err(e) => warn!(error = %e, "log cleanup failed"),
    }
}

/// Spawn the quota-period watcher. When the calendar month changes,
/// every `quota_exceeded` key goes back to `active`; their quota rows for
/// the new period start from zero on first touch.
pub fn spawn_quota_rollover_task(pool: Arc<KeyPool>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately and seeds the stored period
        loop {
            ticker.tick().await;
            rollover_cycle(&pool).await;
        }
    })
}

async fn rollover_cycle(pool: &KeyPool) {
    let store = pool.store();
    let period = current_period();
    match store.get_config(PERIOD_CONFIG_KEY).await {
        Some(stored) if stored == period => {}
        Some(stored) => {
            info!(from = %stored, to = %period, "quota period rolled over, restoring exhausted keys");
            for key in store.all_keys().await {
                if key.status == KeyStatus::QuotaExceeded
                    && let Err(e) = store.set_status(key.id, KeyStatus::Active).await
                {
                    warn!(key_id = key.id, error = %e, "failed to restore key");
                }
            }
            pool.reload().await;
            if let Err(e) = store.set_config(PERIOD_CONFIG_KEY, &period).await {
                warn!(error = %e, "failed to record quota period");
            }
        }
        None => {
            if let Err(e) = store.set_config(PERIOD_CONFIG_KEY, &period).await {
                warn!(error = %e, "failed to record quota period");
            }
        }
    }
}
