//! Durable storage for the key-pool gateway
//!
//! Holds the system of record for API keys and their lifetime counters,
//! per-month quota rows, the append-only request audit log, and persisted
//! config overrides. Everything lives in one JSON file written atomically
//! (temp file + rename) and guarded by a tokio Mutex, so concurrent writers
//! from the dispatch path and background tasks cannot corrupt it.
//!
//! The in-memory key pool reads from this store on reload; between reloads
//! the pool's snapshot is authoritative for selection decisions.

pub mod error;
pub mod records;
pub mod store;
pub mod time;

pub use error::{Error, Result};
pub use records::{
    ApiKeyRecord, ApiKeyView, KeyStatus, LogPage, LogQuery, MonthlyQuotaRecord, NewKey,
    NewLogEntry, Operation, RequestLogRecord, UpdateKey,
};
pub use store::KeyStore;
pub use time::{current_period, days_ago_iso, now_iso};
