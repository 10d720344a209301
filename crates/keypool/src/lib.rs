//! Credential pool for upstream API keys
//!
//! Manages the in-memory view of all managed keys with smooth weighted
//! round-robin selection, transient cooldown windows, and a typed error
//! classifier that drives retry/disable policy. The durable store is the
//! system of record; the pool is a cache with explicit invalidation
//! (`reload` after structural changes, targeted patches after counter
//! updates) that is authoritative for selection decisions between reloads.
//!
//! Key lifecycle:
//! 1. Admin adds or imports a key → stored, status `Active`, weight 1
//! 2. Pool selects among eligible keys by weight → dispatch uses the secret
//! 3. Rate-limit response → cooldown window, key skipped until it expires
//! 4. Quota-exhausted response → status `QuotaExceeded` until period rollover
//! 5. Auth rejection → status `Banned`; repeated counted errors → `Disabled`
//! 6. Success resets the consecutive error count

pub mod classify;
pub mod error;
pub mod pool;
pub mod selector;

pub use classify::{Classification, ErrorKind, UpstreamFailure, classify, classify_payload};
pub use error::{Error, Result};
pub use pool::{KeyPool, SelectedKey};
pub use selector::WeightedSelector;
