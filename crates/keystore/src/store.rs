//! JSON-file backed store with atomic writes
//!
//! All four record families live in one file. Writes serialize the whole
//! state to a temp file in the same directory and rename it over the
//! target, so a crash mid-write never leaves a torn file. The file is
//! created 0600 because it contains key secrets. A tokio Mutex serializes
//! writers; readers take the lock briefly to clone what they need.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::records::{
    ApiKeyRecord, KeyStatus, LogPage, LogQuery, MonthlyQuotaRecord, NewKey, NewLogEntry,
    Operation, RequestLogRecord, UpdateKey,
};
use crate::time::now_iso;

/// Default max consecutive errors before a key is disabled.
const DEFAULT_MAX_ERRORS: u32 = 5;

/// Everything the store persists. Id counters are stored so ids stay
/// unique across deletes and restarts.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_key_id: u64,
    next_quota_id: u64,
    next_log_id: u64,
    /// Kept sorted ascending by id; selection order depends on it.
    keys: Vec<ApiKeyRecord>,
    quotas: Vec<MonthlyQuotaRecord>,
    logs: Vec<RequestLogRecord>,
    config: BTreeMap<String, String>,
}

/// Thread-safe store handle.
pub struct KeyStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl KeyStore {
    /// Load the store from the given file path.
    ///
    /// If the file doesn't exist, creates it empty (cold start with zero
    /// keys). The pool will select nothing until keys are added.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading store file: {e}")))?;
            let state: StoreState = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing store file: {e}")))?;
            info!(
                path = %path.display(),
                keys = state.keys.len(),
                logs = state.logs.len(),
                "loaded store"
            );
            state
        } else {
            info!(path = %path.display(), "store file not found, starting empty");
            let state = StoreState::default();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    // --- keys ---

    /// Insert a new key. Fails with `DuplicateKey` if a key with the same
    /// secret already exists.
    pub async fn add_key(&self, new: NewKey) -> Result<ApiKeyRecord> {
        let mut state = self.state.lock().await;
        let hash = hash_key(&new.key_value);
        if state.keys.iter().any(|k| k.key_hash == hash) {
            return Err(Error::DuplicateKey);
        }
        let record = insert_key(&mut state, new, hash);
        debug!(key_id = record.id, "added key");
        write_atomic(&self.path, &state).await?;
        Ok(record)
    }

    /// Bulk insert, skipping duplicates. Returns how many were inserted.
    /// The whole batch persists in one write.
    pub async fn import_keys(&self, keys: Vec<NewKey>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut inserted = 0usize;
        for new in keys {
            let hash = hash_key(&new.key_value);
            if state.keys.iter().any(|k| k.key_hash == hash) {
                continue;
            }
            insert_key(&mut state, new, hash);
            inserted += 1;
        }
        if inserted > 0 {
            write_atomic(&self.path, &state).await?;
        }
        info!(inserted, "imported keys");
        Ok(inserted)
    }

    /// All keys, ascending id order.
    pub async fn all_keys(&self) -> Vec<ApiKeyRecord> {
        let state = self.state.lock().await;
        state.keys.clone()
    }

    pub async fn get_key(&self, id: u64) -> Option<ApiKeyRecord> {
        let state = self.state.lock().await;
        state.keys.iter().find(|k| k.id == id).cloned()
    }

    /// Update label/weight/max_errors. `None` fields keep current values.
    pub async fn update_key(&self, id: u64, updates: UpdateKey) -> Result<ApiKeyRecord> {
        let mut state = self.state.lock().await;
        let key = find_key(&mut state, id)?;
        if let Some(name) = updates.display_name {
            key.display_name = Some(name);
        }
        if let Some(weight) = updates.weight {
            key.weight = weight;
        }
        if let Some(max_errors) = updates.max_errors {
            key.max_errors = max_errors;
        }
        key.updated_at = now_iso();
        let record = key.clone();
        write_atomic(&self.path, &state).await?;
        Ok(record)
    }

    /// Hard delete. Quota rows and logs for the key are kept for audit.
    pub async fn delete_key(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.keys.len();
        state.keys.retain(|k| k.id != id);
        if state.keys.len() == before {
            return Err(Error::KeyNotFound(id));
        }
        debug!(key_id = id, "deleted key");
        write_atomic(&self.path, &state).await
    }

    pub async fn set_status(&self, id: u64, status: KeyStatus) -> Result<ApiKeyRecord> {
        let mut state = self.state.lock().await;
        let key = find_key(&mut state, id)?;
        key.status = status;
        key.updated_at = now_iso();
        let record = key.clone();
        write_atomic(&self.path, &state).await?;
        Ok(record)
    }

    pub async fn reset_errors(&self, id: u64) -> Result<ApiKeyRecord> {
        let mut state = self.state.lock().await;
        let key = find_key(&mut state, id)?;
        key.error_count = 0;
        key.last_error_message = None;
        key.updated_at = now_iso();
        let record = key.clone();
        write_atomic(&self.path, &state).await?;
        Ok(record)
    }

    /// Record a successful call: counters bump, error count resets.
    pub async fn mark_success(&self, id: u64) -> Result<ApiKeyRecord> {
        let mut state = self.state.lock().await;
        let now = now_iso();
        let key = find_key(&mut state, id)?;
        key.total_requests += 1;
        key.successful_requests += 1;
        key.error_count = 0;
        key.last_used_at = Some(now.clone());
        key.updated_at = now;
        let record = key.clone();
        write_atomic(&self.path, &state).await?;
        Ok(record)
    }

    /// Record a failed call. `increment_error` is false for failures that
    /// say nothing about the key's health (network errors, rate limits).
    pub async fn mark_failure(
        &self,
        id: u64,
        message: Option<&str>,
        increment_error: bool,
    ) -> Result<ApiKeyRecord> {
        let mut state = self.state.lock().await;
        let now = now_iso();
        let key = find_key(&mut state, id)?;
        key.total_requests += 1;
        key.failed_requests += 1;
        if increment_error {
            key.error_count += 1;
        }
        key.last_error_at = Some(now.clone());
        key.last_error_message = message.map(str::to_owned);
        key.updated_at = now;
        let record = key.clone();
        write_atomic(&self.path, &state).await?;
        Ok(record)
    }

    // --- monthly quotas ---

    /// Get-or-create the quota row for (key, period).
    pub async fn ensure_quota(&self, key_id: u64, period: &str) -> Result<MonthlyQuotaRecord> {
        let mut state = self.state.lock().await;
        if let Some(row) = state
            .quotas
            .iter()
            .find(|q| q.key_id == key_id && q.period == period)
        {
            return Ok(row.clone());
        }
        let row = insert_quota(&mut state, key_id, period);
        write_atomic(&self.path, &state).await?;
        Ok(row)
    }

    /// Add `count` calls to the current period's counters for one operation.
    pub async fn increment_usage(
        &self,
        key_id: u64,
        operation: Operation,
        count: u64,
    ) -> Result<()> {
        let period = crate::time::current_period();
        let mut state = self.state.lock().await;
        if !state
            .quotas
            .iter()
            .any(|q| q.key_id == key_id && q.period == period)
        {
            insert_quota(&mut state, key_id, &period);
        }
        let row = state
            .quotas
            .iter_mut()
            .find(|q| q.key_id == key_id && q.period == period)
            .expect("quota row just ensured");
        row.used_count += count;
        match operation {
            Operation::Search => row.search_count += count,
            Operation::Extract => row.extract_count += count,
            Operation::Crawl => row.crawl_count += count,
            Operation::Map => row.map_count += count,
        }
        row.updated_at = now_iso();
        write_atomic(&self.path, &state).await
    }

    /// Overwrite local counters with the provider's authoritative numbers.
    pub async fn overwrite_quota(
        &self,
        key_id: u64,
        period: &str,
        quota_limit: Option<u64>,
        used_count: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state
            .quotas
            .iter()
            .any(|q| q.key_id == key_id && q.period == period)
        {
            insert_quota(&mut state, key_id, period);
        }
        let row = state
            .quotas
            .iter_mut()
            .find(|q| q.key_id == key_id && q.period == period)
            .expect("quota row just ensured");
        row.quota_limit = quota_limit;
        row.used_count = used_count;
        row.updated_at = now_iso();
        write_atomic(&self.path, &state).await
    }

    pub async fn quota_for_key(&self, key_id: u64, period: &str) -> Option<MonthlyQuotaRecord> {
        let state = self.state.lock().await;
        state
            .quotas
            .iter()
            .find(|q| q.key_id == key_id && q.period == period)
            .cloned()
    }

    pub async fn quotas_for_period(&self, period: &str) -> Vec<MonthlyQuotaRecord> {
        let state = self.state.lock().await;
        state
            .quotas
            .iter()
            .filter(|q| q.period == period)
            .cloned()
            .collect()
    }

    // --- request logs ---

    /// Append a batch of log entries in one write.
    pub async fn append_logs(&self, entries: &[NewLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let now = now_iso();
        for entry in entries {
            let id = state.next_log_id + 1;
            state.next_log_id = id;
            state.logs.push(RequestLogRecord {
                id,
                key_id: entry.key_id,
                operation: entry.operation.clone(),
                request_params: entry.request_params.clone(),
                response_data: entry.response_data.clone(),
                status: entry.status.clone(),
                duration_ms: entry.duration_ms,
                error_type: entry.error_type.clone(),
                error_message: entry.error_message.clone(),
                created_at: now.clone(),
            });
        }
        write_atomic(&self.path, &state).await
    }

    /// Filtered, paginated query, newest first.
    pub async fn query_logs(&self, query: &LogQuery) -> LogPage {
        let state = self.state.lock().await;
        let mut matched: Vec<&RequestLogRecord> = state
            .logs
            .iter()
            .filter(|log| log_matches(log, query))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = matched.len();
        let limit = query.limit.max(1);
        let offset = query.page.saturating_sub(1) * limit;
        let logs = matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        LogPage { total, logs }
    }

    /// Drop log entries older than the RFC 3339 cutoff. Returns how many
    /// were removed.
    pub async fn delete_logs_older_than(&self, cutoff: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.logs.len();
        state.logs.retain(|log| log.created_at.as_str() >= cutoff);
        let removed = before - state.logs.len();
        if removed > 0 {
            write_atomic(&self.path, &state).await?;
        }
        Ok(removed)
    }

    // --- config KV ---

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.config.insert(key.to_owned(), value.to_owned());
        write_atomic(&self.path, &state).await
    }

    pub async fn get_config(&self, key: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.config.get(key).cloned()
    }

    pub async fn all_config(&self) -> BTreeMap<String, String> {
        let state = self.state.lock().await;
        state.config.clone()
    }
}

/// Hex SHA-256 of a key secret.
pub fn hash_key(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn find_key(state: &mut StoreState, id: u64) -> Result<&mut ApiKeyRecord> {
    state
        .keys
        .iter_mut()
        .find(|k| k.id == id)
        .ok_or(Error::KeyNotFound(id))
}

fn insert_key(state: &mut StoreState, new: NewKey, hash: String) -> ApiKeyRecord {
    let id = state.next_key_id + 1;
    state.next_key_id = id;
    let now = now_iso();
    let record = ApiKeyRecord {
        id,
        key_value: new.key_value,
        key_hash: hash,
        display_name: new.display_name,
        status: KeyStatus::Active,
        weight: new.weight.unwrap_or(1),
        error_count: 0,
        max_errors: new.max_errors.unwrap_or(DEFAULT_MAX_ERRORS),
        total_requests: 0,
        successful_requests: 0,
        failed_requests: 0,
        last_used_at: None,
        last_error_at: None,
        last_error_message: None,
        created_at: now.clone(),
        updated_at: now,
    };
    state.keys.push(record.clone());
    record
}

fn insert_quota(state: &mut StoreState, key_id: u64, period: &str) -> MonthlyQuotaRecord {
    let id = state.next_quota_id + 1;
    state.next_quota_id = id;
    let now = now_iso();
    let row = MonthlyQuotaRecord {
        id,
        key_id,
        period: period.to_owned(),
        quota_limit: None,
        used_count: 0,
        search_count: 0,
        extract_count: 0,
        crawl_count: 0,
        map_count: 0,
        reset_at: None,
        created_at: now.clone(),
        updated_at: now,
    };
    state.quotas.push(row.clone());
    row
}

fn log_matches(log: &RequestLogRecord, query: &LogQuery) -> bool {
    if let Some(ref start) = query.start_date
        && log.created_at.as_str() < start.as_str()
    {
        return false;
    }
    if let Some(ref end) = query.end_date
        && log.created_at.as_str() > end.as_str()
    {
        return false;
    }
    if let Some(ref op) = query.operation
        && log.operation != *op
    {
        return false;
    }
    if let Some(key_id) = query.key_id
        && log.key_id != Some(key_id)
    {
        return false;
    }
    if let Some(ref status) = query.status
        && log.status != *status
    {
        return false;
    }
    if let Some(ref keyword) = query.keyword {
        let in_params = log
            .request_params
            .as_deref()
            .is_some_and(|p| p.contains(keyword.as_str()));
        let in_error = log
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains(keyword.as_str()));
        if !in_params && !in_error {
            return false;
        }
    }
    true
}

/// Write the store state to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains key secrets.
async fn write_atomic(path: &Path, state: &StoreState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::Parse(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".store.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted store");
    Ok(())
}
