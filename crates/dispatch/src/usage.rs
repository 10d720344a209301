//! Usage reconciliation against the provider
//!
//! Local usage counters drift from the provider's billing view: other
//! consumers of the same key, cost-formula changes, missed increments.
//! The reconciler fetches the authoritative numbers and overwrites the
//! current period's quota row. It runs on a schedule and on demand when
//! a 429 needs disambiguating.

use std::sync::Arc;

use keystore::{KeyStore, current_period};
use tracing::{debug, warn};

use crate::upstream::{UsageSnapshot, Upstream};

pub struct UsageReconciler {
    store: Arc<KeyStore>,
    upstream: Arc<dyn Upstream>,
}

impl UsageReconciler {
    pub fn new(store: Arc<KeyStore>, upstream: Arc<dyn Upstream>) -> Self {
        Self { store, upstream }
    }

    /// Ask the provider for the key's current usage. Transport failures
    /// propagate; the caller decides what "unknown" means.
    pub async fn fetch_usage(&self, api_key: &str) -> std::result::Result<UsageSnapshot, String> {
        self.upstream.fetch_usage(api_key).await
    }

    /// Overwrite the current period's quota row with fetched numbers.
    /// Best effort: a write failure is logged, not surfaced.
    pub async fn record(&self, key_id: u64, snapshot: UsageSnapshot) {
        let period = current_period();
        match self
            .store
            .overwrite_quota(key_id, &period, snapshot.limit, snapshot.used)
            .await
        {
            Ok(()) => debug!(
                key_id,
                used = snapshot.used,
                limit = ?snapshot.limit,
                "usage reconciled"
            ),
            Err(e) => warn!(key_id, error = %e, "failed to persist reconciled usage"),
        }
    }

    /// Fetch and persist in one step. Failures are logged and swallowed;
    /// reconciliation never sits on a call's critical path.
    pub async fn sync_usage(&self, key_id: u64, api_key: &str) {
        match self.fetch_usage(api_key).await {
            Ok(snapshot) => self.record(key_id, snapshot).await,
            Err(e) => warn!(key_id, error = %e, "usage fetch failed"),
        }
    }
}
