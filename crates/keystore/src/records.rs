//! Persisted record types
//!
//! These structs are the on-disk schema. Records are plain data; all
//! mutation goes through [`crate::KeyStore`] so counters and timestamps
//! stay consistent.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a managed API key.
///
/// Transitions:
/// - Active → Disabled (max consecutive errors, or admin action)
/// - Active → QuotaExceeded (monthly quota exhausted)
/// - Active → Banned (upstream rejected the key as invalid)
/// - QuotaExceeded → Active (new quota period, or admin reset)
/// - Disabled/Banned → Active (admin reset only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Disabled,
    QuotaExceeded,
    Banned,
}

impl KeyStatus {
    /// Status label for logging and admin snapshots.
    pub fn label(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Disabled => "disabled",
            KeyStatus::QuotaExceeded => "quota_exceeded",
            KeyStatus::Banned => "banned",
        }
    }
}

/// The four upstream operations the gateway dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Search,
    Extract,
    Crawl,
    Map,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Search => "search",
            Operation::Extract => "extract",
            Operation::Crawl => "crawl",
            Operation::Map => "map",
        }
    }

    /// Parse an operation name, tolerating prefixed tool names such as
    /// `tavily-search`.
    pub fn parse(name: &str) -> Option<Self> {
        if name.contains("search") {
            Some(Operation::Search)
        } else if name.contains("extract") {
            Some(Operation::Extract)
        } else if name.contains("crawl") {
            Some(Operation::Crawl)
        } else if name.contains("map") {
            Some(Operation::Map)
        } else {
            None
        }
    }
}

/// One managed upstream API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: u64,
    /// The key secret. Only the store and pool boundary see this field;
    /// admin snapshots use [`ApiKeyRecord::to_view`] instead.
    pub key_value: String,
    /// Hex SHA-256 of the secret, unique, used for import dedup.
    pub key_hash: String,
    pub display_name: Option<String>,
    pub status: KeyStatus,
    pub weight: u32,
    pub error_count: u32,
    pub max_errors: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_used_at: Option<String>,
    pub last_error_at: Option<String>,
    pub last_error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ApiKeyRecord {
    /// Redacted copy for the admin layer: the secret is replaced with a
    /// masked preview.
    pub fn to_view(&self) -> ApiKeyView {
        ApiKeyView {
            id: self.id,
            key_preview: common::secret::mask_key(&self.key_value),
            display_name: self.display_name.clone(),
            status: self.status,
            weight: self.weight,
            error_count: self.error_count,
            max_errors: self.max_errors,
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            last_used_at: self.last_used_at.clone(),
            last_error_at: self.last_error_at.clone(),
            last_error_message: self.last_error_message.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

/// Key record without the secret, safe to serialize outward.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyView {
    pub id: u64,
    pub key_preview: String,
    pub display_name: Option<String>,
    pub status: KeyStatus,
    pub weight: u32,
    pub error_count: u32,
    pub max_errors: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_used_at: Option<String>,
    pub last_error_at: Option<String>,
    pub last_error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Parameters for inserting one key.
#[derive(Debug, Clone)]
pub struct NewKey {
    pub key_value: String,
    pub display_name: Option<String>,
    pub weight: Option<u32>,
    pub max_errors: Option<u32>,
}

/// Partial update for an existing key. `None` fields keep the current value.
#[derive(Debug, Clone, Default)]
pub struct UpdateKey {
    pub display_name: Option<String>,
    pub weight: Option<u32>,
    pub max_errors: Option<u32>,
}

/// Per-key, per-month usage counters. One row per (key, period).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyQuotaRecord {
    pub id: u64,
    pub key_id: u64,
    /// UTC calendar month, `YYYY-MM`.
    pub period: String,
    /// `None` means unknown or unbounded.
    pub quota_limit: Option<u64>,
    pub used_count: u64,
    pub search_count: u64,
    pub extract_count: u64,
    pub crawl_count: u64,
    pub map_count: u64,
    pub reset_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Append-only audit record for one upstream attempt outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogRecord {
    pub id: u64,
    /// `None` when the call failed before a key could be selected.
    pub key_id: Option<u64>,
    pub operation: String,
    pub request_params: Option<String>,
    pub response_data: Option<String>,
    /// `success` or `error`.
    pub status: String,
    pub duration_ms: Option<u64>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
}

/// A log entry before the store assigns its id and timestamp.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub key_id: Option<u64>,
    pub operation: String,
    pub request_params: Option<String>,
    pub response_data: Option<String>,
    pub status: String,
    pub duration_ms: Option<u64>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

/// Filtered, paginated log query. All filters are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub page: usize,
    pub limit: usize,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub operation: Option<String>,
    pub key_id: Option<u64>,
    pub status: Option<String>,
    pub keyword: Option<String>,
}

/// One page of log results, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub total: usize,
    pub logs: Vec<RequestLogRecord>,
}
