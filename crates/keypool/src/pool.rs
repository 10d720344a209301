//! Key pool with weighted selection and cooldown tracking
//!
//! The pool caches key records in memory for selection and patches that
//! cache from the records the store hands back after each mutation.
//! Structural changes (add, import, update, delete) go through the store
//! and then reload the whole cache. Cooldowns are transient and live only
//! here; a restart clears them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::secret::Secret;
use keystore::{ApiKeyRecord, ApiKeyView, KeyStatus, KeyStore, NewKey, UpdateKey};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::classify::Classification;
use crate::error::Result;
use crate::selector::WeightedSelector;

/// A key picked for one upstream call.
pub struct SelectedKey {
    pub id: u64,
    pub secret: Secret<String>,
}

struct PoolState {
    keys: Vec<ApiKeyRecord>,
    /// key id -> instant the cooldown expires
    cooldowns: HashMap<u64, Instant>,
    selector: WeightedSelector,
    /// Identity of the eligible set the selector was last reset against,
    /// "id:weight:status|..." over eligible keys in id order.
    fingerprint: String,
}

pub struct KeyPool {
    store: Arc<KeyStore>,
    state: RwLock<PoolState>,
}

impl KeyPool {
    pub async fn new(store: Arc<KeyStore>) -> Self {
        let keys = store.all_keys().await;
        info!(keys = keys.len(), "key pool initialized");
        Self {
            store,
            state: RwLock::new(PoolState {
                keys,
                cooldowns: HashMap::new(),
                selector: WeightedSelector::default(),
                fingerprint: String::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    /// Re-read all key records from the store. Cooldowns survive a reload.
    pub async fn reload(&self) {
        let keys = self.store.all_keys().await;
        let mut state = self.state.write().await;
        state.keys = keys;
    }

    /// Pick the next key for an upstream call, or `None` when no key is
    /// eligible (active, off cooldown, nonzero weight).
    pub async fn next(&self) -> Option<SelectedKey> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let now = Instant::now();
        state.cooldowns.retain(|_, expires| *expires > now);

        let eligible: Vec<usize> = state
            .keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.status == KeyStatus::Active && !state.cooldowns.contains_key(&k.id))
            .map(|(idx, _)| idx)
            .collect();
        let weights: Vec<u32> = eligible.iter().map(|&idx| state.keys[idx].weight).collect();

        let fingerprint = eligible
            .iter()
            .map(|&idx| {
                let k = &state.keys[idx];
                format!("{}:{}:{}", k.id, k.weight, k.status.label())
            })
            .collect::<Vec<_>>()
            .join("|");
        if fingerprint != state.fingerprint {
            debug!("eligible key set changed, selector reset");
            state.selector.reset(&weights);
            state.fingerprint = fingerprint;
        }

        let pick = state.selector.select(&weights)?;
        let key = &state.keys[eligible[pick]];
        Some(SelectedKey {
            id: key.id,
            secret: Secret::from(key.key_value.clone()),
        })
    }

    /// Park a key for `duration`. It is skipped by [`KeyPool::next`] until
    /// the window expires.
    pub async fn set_cooldown(&self, id: u64, duration: Duration) {
        let mut state = self.state.write().await;
        state.cooldowns.insert(id, Instant::now() + duration);
        debug!(key_id = id, secs = duration.as_secs_f64(), "key cooling down");
    }

    /// Record a successful call; resets the key's consecutive error count.
    pub async fn mark_success(&self, id: u64) -> Result<()> {
        let record = self.store.mark_success(id).await?;
        self.patch(record).await;
        Ok(())
    }

    /// Record a failed call and apply the classifier's verdict: park the
    /// key in the status it names, or disable it when counted errors reach
    /// the key's threshold.
    pub async fn mark_failure(&self, id: u64, verdict: &Classification) -> Result<()> {
        let mut record = self
            .store
            .mark_failure(id, Some(&verdict.message), verdict.increment_error_count)
            .await?;
        if let Some(target) = verdict.disable_to {
            warn!(
                key_id = id,
                status = target.label(),
                kind = verdict.kind.label(),
                "key parked by classifier"
            );
            record = self.store.set_status(id, target).await?;
        } else if verdict.increment_error_count
            && record.error_count >= record.max_errors
            && record.status != KeyStatus::QuotaExceeded
        {
            warn!(
                key_id = id,
                errors = record.error_count,
                "error threshold reached, key disabled"
            );
            record = self.store.set_status(id, KeyStatus::Disabled).await?;
        }
        self.patch(record).await;
        Ok(())
    }

    // --- admin operations, delegated to the store ---

    pub async fn add_key(&self, new: NewKey) -> Result<ApiKeyView> {
        let record = self.store.add_key(new).await?;
        let view = record.to_view();
        self.reload().await;
        Ok(view)
    }

    /// Bulk import; duplicates are skipped. Returns the number added.
    pub async fn import_keys(&self, keys: Vec<NewKey>) -> Result<usize> {
        let added = self.store.import_keys(keys).await?;
        self.reload().await;
        Ok(added)
    }

    pub async fn update_key(&self, id: u64, updates: UpdateKey) -> Result<ApiKeyView> {
        let record = self.store.update_key(id, updates).await?;
        let view = record.to_view();
        self.reload().await;
        Ok(view)
    }

    pub async fn delete_key(&self, id: u64) -> Result<()> {
        self.store.delete_key(id).await?;
        let mut state = self.state.write().await;
        state.cooldowns.remove(&id);
        drop(state);
        self.reload().await;
        Ok(())
    }

    pub async fn set_status(&self, id: u64, status: KeyStatus) -> Result<ApiKeyView> {
        let record = self.store.set_status(id, status).await?;
        let view = record.to_view();
        self.patch(record).await;
        Ok(view)
    }

    pub async fn reset_errors(&self, id: u64) -> Result<ApiKeyView> {
        let record = self.store.reset_errors(id).await?;
        let view = record.to_view();
        self.patch(record).await;
        Ok(view)
    }

    /// Redacted snapshots of every key, for the admin surface.
    pub async fn views(&self) -> Vec<ApiKeyView> {
        let state = self.state.read().await;
        state.keys.iter().map(ApiKeyRecord::to_view).collect()
    }

    pub async fn active_count(&self) -> usize {
        let state = self.state.read().await;
        state
            .keys
            .iter()
            .filter(|k| k.status == KeyStatus::Active)
            .count()
    }

    /// Pool summary for the health endpoint.
    pub async fn health(&self) -> Value {
        let state = self.state.read().await;
        let now = Instant::now();
        let count = |status: KeyStatus| state.keys.iter().filter(|k| k.status == status).count();
        json!({
            "total_keys": state.keys.len(),
            "active": count(KeyStatus::Active),
            "disabled": count(KeyStatus::Disabled),
            "quota_exceeded": count(KeyStatus::QuotaExceeded),
            "banned": count(KeyStatus::Banned),
            "cooling_down": state.cooldowns.values().filter(|e| **e > now).count(),
        })
    }

    async fn patch(&self, record: ApiKeyRecord) {
        let mut state = self.state.write().await;
        if let Some(slot) = state.keys.iter_mut().find(|k| k.id == record.id) {
            *slot = record;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorKind;
    use tempfile::TempDir;

    async fn pool_with(weights: &[u32]) -> (KeyPool, Vec<u64>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            KeyStore::load(dir.path().join("keys.json"))
                .await
                .unwrap(),
        );
        let mut ids = Vec::new();
        for (i, &weight) in weights.iter().enumerate() {
            let record = store
                .add_key(NewKey {
                    key_value: format!("tvly-test-key-{i:04}"),
                    display_name: None,
                    weight: Some(weight),
                    max_errors: None,
                })
                .await
                .unwrap();
            ids.push(record.id);
        }
        (KeyPool::new(store).await, ids, dir)
    }

    fn counted_failure() -> Classification {
        Classification {
            kind: ErrorKind::Unknown,
            should_retry: false,
            disable_to: None,
            retry_delay: None,
            message: "boom".into(),
            increment_error_count: true,
        }
    }

    #[tokio::test]
    async fn empty_pool_selects_nothing() {
        let (pool, _, _dir) = pool_with(&[]).await;
        assert!(pool.next().await.is_none());
    }

    #[tokio::test]
    async fn weighted_selection_interleaves() {
        let (pool, ids, _dir) = pool_with(&[3, 1]).await;
        let mut picked = Vec::new();
        for _ in 0..4 {
            picked.push(pool.next().await.unwrap().id);
        }
        assert_eq!(picked, vec![ids[0], ids[0], ids[1], ids[0]]);
    }

    #[tokio::test]
    async fn non_active_keys_are_skipped() {
        let (pool, ids, _dir) = pool_with(&[1, 1]).await;
        pool.set_status(ids[0], KeyStatus::Disabled).await.unwrap();
        for _ in 0..3 {
            assert_eq!(pool.next().await.unwrap().id, ids[1]);
        }
    }

    #[tokio::test]
    async fn cooldown_excludes_key_until_expiry() {
        let (pool, ids, _dir) = pool_with(&[1]).await;
        pool.set_cooldown(ids[0], Duration::from_millis(40)).await;
        assert!(pool.next().await.is_none());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.next().await.unwrap().id, ids[0]);
    }

    #[tokio::test]
    async fn selector_restarts_when_membership_changes() {
        let (pool, ids, _dir) = pool_with(&[3, 1]).await;
        pool.next().await.unwrap();
        pool.next().await.unwrap();
        pool.set_status(ids[1], KeyStatus::Disabled).await.unwrap();
        assert_eq!(pool.next().await.unwrap().id, ids[0]);
        // re-enabling resets the cycle from the start
        pool.set_status(ids[1], KeyStatus::Active).await.unwrap();
        let mut picked = Vec::new();
        for _ in 0..4 {
            picked.push(pool.next().await.unwrap().id);
        }
        assert_eq!(picked, vec![ids[0], ids[0], ids[1], ids[0]]);
    }

    #[tokio::test]
    async fn counted_failures_disable_at_threshold() {
        let (pool, ids, _dir) = pool_with(&[1]).await;
        pool.update_key(
            ids[0],
            UpdateKey {
                max_errors: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        pool.mark_failure(ids[0], &counted_failure()).await.unwrap();
        assert!(pool.next().await.is_some());
        pool.mark_failure(ids[0], &counted_failure()).await.unwrap();
        assert!(pool.next().await.is_none());
        let views = pool.views().await;
        assert_eq!(views[0].status, KeyStatus::Disabled);
    }

    #[tokio::test]
    async fn uncounted_failures_never_disable() {
        let (pool, ids, _dir) = pool_with(&[1]).await;
        let verdict = Classification {
            increment_error_count: false,
            ..counted_failure()
        };
        for _ in 0..10 {
            pool.mark_failure(ids[0], &verdict).await.unwrap();
        }
        assert_eq!(pool.views().await[0].status, KeyStatus::Active);
    }

    #[tokio::test]
    async fn quota_verdict_parks_key_in_quota_status() {
        let (pool, ids, _dir) = pool_with(&[1]).await;
        let verdict = Classification {
            kind: ErrorKind::QuotaExceeded,
            disable_to: Some(KeyStatus::QuotaExceeded),
            ..counted_failure()
        };
        pool.mark_failure(ids[0], &verdict).await.unwrap();
        assert_eq!(pool.views().await[0].status, KeyStatus::QuotaExceeded);
        assert!(pool.next().await.is_none());
    }

    #[tokio::test]
    async fn success_resets_the_error_count() {
        let (pool, ids, _dir) = pool_with(&[1]).await;
        pool.mark_failure(ids[0], &counted_failure()).await.unwrap();
        assert_eq!(pool.views().await[0].error_count, 1);
        pool.mark_success(ids[0]).await.unwrap();
        assert_eq!(pool.views().await[0].error_count, 0);
    }

    #[tokio::test]
    async fn health_reports_status_breakdown() {
        let (pool, ids, _dir) = pool_with(&[1, 1, 1]).await;
        pool.set_status(ids[1], KeyStatus::Banned).await.unwrap();
        pool.set_cooldown(ids[2], Duration::from_secs(60)).await;
        let health = pool.health().await;
        assert_eq!(health["total_keys"], 3);
        assert_eq!(health["active"], 2);
        assert_eq!(health["banned"], 1);
        assert_eq!(health["cooling_down"], 1);
    }
}
