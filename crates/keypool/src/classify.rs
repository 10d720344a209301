//! Upstream error classification
//!
//! Maps transport failures and HTTP error responses onto a small taxonomy
//! that drives the dispatch policy: whether to retry with another key,
//! whether the key that failed should be parked, and for how long.

use std::time::Duration;

use keystore::KeyStatus;
use serde_json::Value;

/// Quota-exhaustion wording seen in upstream error bodies. A 429 whose
/// body matches one of these is a monthly-limit failure, not a burst
/// rate limit, and the key stays parked until the period rolls over.
const QUOTA_MARKERS: &[&str] = &["quota", "exceed", "credit", "usage limit"];

const RATE_MARKERS: &[&str] = &["rate limit", "too many requests"];

const AUTH_MARKERS: &[&str] = &["invalid api key", "unauthorized", "forbidden"];

/// Failure category for an upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect, TLS, or timeout failure before a response arrived
    Network,
    /// Burst rate limit; the key recovers on its own
    RateLimit,
    /// Monthly quota exhausted; the key is out until the next period
    QuotaExceeded,
    /// Key rejected by the upstream
    Auth,
    /// Malformed request, not the key's fault
    Client,
    /// Upstream 5xx
    Server,
    Unknown,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Auth => "auth",
            Self::Client => "client",
            Self::Server => "server",
            Self::Unknown => "unknown",
        }
    }
}

/// Raw failure observed by the dispatch engine, before classification.
#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// The request never produced an HTTP response.
    Transport { message: String },
    /// The upstream answered with a non-success status.
    Http {
        status: u16,
        body: Value,
        retry_after_secs: Option<u64>,
    },
}

/// Policy verdict for one failure.
#[derive(Debug, Clone)]
pub struct Classification {
    pub kind: ErrorKind,
    /// Whether the engine should try again with another key.
    pub should_retry: bool,
    /// Status the failing key should be moved to, if any.
    pub disable_to: Option<KeyStatus>,
    /// Server-directed wait before the next attempt. `None` leaves the
    /// engine's own backoff schedule in charge.
    pub retry_delay: Option<Duration>,
    pub message: String,
    /// Whether this failure counts toward the key's consecutive error
    /// threshold. Rate limits and server faults do not.
    pub increment_error_count: bool,
}

impl Classification {
    pub fn should_disable_key(&self) -> bool {
        self.disable_to.is_some()
    }
}

/// Classify a failed upstream call.
///
/// Order matters: transport failures first, then 5xx, then the specific
/// 4xx statuses, with a keyword scan over the body as the last resort.
pub fn classify(failure: &UpstreamFailure) -> Classification {
    match failure {
        UpstreamFailure::Transport { message } => Classification {
            kind: ErrorKind::Network,
            should_retry: true,
            disable_to: None,
            retry_delay: None,
            message: message.clone(),
            increment_error_count: false,
        },
        UpstreamFailure::Http {
            status,
            body,
            retry_after_secs,
        } => {
            let message = extract_message(body)
                .unwrap_or_else(|| format!("upstream returned status {status}"));
            classify_http(*status, &message, *retry_after_secs)
        }
    }
}

fn classify_http(status: u16, message: &str, retry_after_secs: Option<u64>) -> Classification {
    let lower = message.to_lowercase();
    if status >= 500 {
        return Classification {
            kind: ErrorKind::Server,
            should_retry: true,
            disable_to: None,
            retry_delay: None,
            message: message.to_string(),
            increment_error_count: false,
        };
    }
    match status {
        401 | 403 => Classification {
            kind: ErrorKind::Auth,
            should_retry: false,
            disable_to: Some(KeyStatus::Banned),
            retry_delay: None,
            message: message.to_string(),
            increment_error_count: true,
        },
        // Upstream-specific statuses for keys in a bad plan state
        432 | 433 => Classification {
            kind: ErrorKind::Auth,
            should_retry: false,
            disable_to: Some(KeyStatus::Disabled),
            retry_delay: None,
            message: message.to_string(),
            increment_error_count: true,
        },
        429 => {
            if contains_any(&lower, QUOTA_MARKERS) {
                Classification {
                    kind: ErrorKind::QuotaExceeded,
                    should_retry: false,
                    disable_to: Some(KeyStatus::QuotaExceeded),
                    retry_delay: None,
                    message: message.to_string(),
                    increment_error_count: true,
                }
            } else {
                Classification {
                    kind: ErrorKind::RateLimit,
                    should_retry: true,
                    disable_to: None,
                    retry_delay: retry_after_secs.map(Duration::from_secs),
                    message: message.to_string(),
                    increment_error_count: false,
                }
            }
        }
        s if s >= 400 => classify_by_wording(&lower, message).unwrap_or(Classification {
            kind: ErrorKind::Client,
            should_retry: false,
            disable_to: None,
            retry_delay: None,
            message: message.to_string(),
            increment_error_count: false,
        }),
        _ => classify_by_wording(&lower, message).unwrap_or(Classification {
            kind: ErrorKind::Unknown,
            should_retry: false,
            disable_to: None,
            retry_delay: None,
            message: message.to_string(),
            increment_error_count: true,
        }),
    }
}

/// Classify an error envelope found inside a 2xx response body. Some
/// upstream failures arrive this way instead of as an HTTP status.
pub fn classify_payload(body: &Value) -> Option<Classification> {
    let detail = body.get("detail")?;
    let message = match detail {
        Value::String(s) => s.clone(),
        other => extract_message(other)?,
    };
    let lower = message.to_lowercase();
    classify_by_wording(&lower, &message)
}

fn classify_by_wording(lower: &str, message: &str) -> Option<Classification> {
    if contains_any(lower, QUOTA_MARKERS) {
        return Some(Classification {
            kind: ErrorKind::QuotaExceeded,
            should_retry: false,
            disable_to: Some(KeyStatus::QuotaExceeded),
            retry_delay: None,
            message: message.to_string(),
            increment_error_count: true,
        });
    }
    if contains_any(lower, RATE_MARKERS) {
        return Some(Classification {
            kind: ErrorKind::RateLimit,
            should_retry: true,
            disable_to: None,
            retry_delay: None,
            message: message.to_string(),
            increment_error_count: false,
        });
    }
    if contains_any(lower, AUTH_MARKERS) {
        return Some(Classification {
            kind: ErrorKind::Auth,
            should_retry: false,
            disable_to: Some(KeyStatus::Banned),
            retry_delay: None,
            message: message.to_string(),
            increment_error_count: true,
        });
    }
    None
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Pull a human-readable message out of an upstream error body. Bodies
/// vary between `{"detail": "..."}`, `{"error": "..."}`, and nested
/// `{"detail": {"error": "..."}}` shapes.
fn extract_message(body: &Value) -> Option<String> {
    match body {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => ["detail", "error", "message"]
            .iter()
            .find_map(|field| map.get(*field).and_then(extract_message)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http(status: u16, body: Value) -> UpstreamFailure {
        UpstreamFailure::Http {
            status,
            body,
            retry_after_secs: None,
        }
    }

    #[test]
    fn transport_failure_is_retryable_network() {
        let c = classify(&UpstreamFailure::Transport {
            message: "connection reset by peer".into(),
        });
        assert_eq!(c.kind, ErrorKind::Network);
        assert!(c.should_retry);
        assert!(!c.should_disable_key());
        assert!(!c.increment_error_count);
    }

    #[test]
    fn server_errors_retry_without_counting() {
        let c = classify(&http(503, json!({"detail": "service unavailable"})));
        assert_eq!(c.kind, ErrorKind::Server);
        assert!(c.should_retry);
        assert!(!c.increment_error_count);
        assert!(c.disable_to.is_none());
    }

    #[test]
    fn unauthorized_bans_the_key() {
        let c = classify(&http(401, json!({"detail": "Invalid API key"})));
        assert_eq!(c.kind, ErrorKind::Auth);
        assert_eq!(c.disable_to, Some(KeyStatus::Banned));
        assert!(!c.should_retry);
        assert!(c.increment_error_count);
    }

    #[test]
    fn plan_status_432_disables_without_ban() {
        let c = classify(&http(432, json!({"detail": "Plan suspended"})));
        assert_eq!(c.kind, ErrorKind::Auth);
        assert_eq!(c.disable_to, Some(KeyStatus::Disabled));
    }

    #[test]
    fn quota_worded_429_parks_key_for_the_period() {
        let c = classify(&http(429, json!({"detail": "Usage limit exceeded"})));
        assert_eq!(c.kind, ErrorKind::QuotaExceeded);
        assert_eq!(c.disable_to, Some(KeyStatus::QuotaExceeded));
        assert!(!c.should_retry);
        assert!(c.increment_error_count);
    }

    #[test]
    fn quota_wording_is_case_insensitive() {
        let c = classify(&http(429, json!({"detail": "MONTHLY QUOTA reached"})));
        assert_eq!(c.kind, ErrorKind::QuotaExceeded);
    }

    #[test]
    fn plain_429_is_a_rate_limit() {
        let c = classify(&http(429, json!({"detail": "Too many requests"})));
        assert_eq!(c.kind, ErrorKind::RateLimit);
        assert!(c.should_retry);
        assert!(!c.should_disable_key());
        assert!(!c.increment_error_count);
    }

    #[test]
    fn retry_after_header_sets_the_delay() {
        let c = classify(&UpstreamFailure::Http {
            status: 429,
            body: json!({"detail": "Too many requests"}),
            retry_after_secs: Some(12),
        });
        assert_eq!(c.retry_delay, Some(Duration::from_secs(12)));
    }

    #[test]
    fn rate_limit_without_header_leaves_backoff_to_engine() {
        let c = classify(&http(429, json!({"detail": "slow down"})));
        assert_eq!(c.retry_delay, None);
    }

    #[test]
    fn bad_request_is_terminal_client_error() {
        let c = classify(&http(400, json!({"detail": "query is required"})));
        assert_eq!(c.kind, ErrorKind::Client);
        assert!(!c.should_retry);
        assert!(!c.increment_error_count);
    }

    #[test]
    fn quota_wording_wins_over_generic_4xx() {
        let c = classify(&http(400, json!({"detail": "credits exhausted"})));
        assert_eq!(c.kind, ErrorKind::QuotaExceeded);
    }

    #[test]
    fn message_extraction_handles_nested_detail() {
        let c = classify(&http(429, json!({"detail": {"error": "usage limit hit"}})));
        assert_eq!(c.kind, ErrorKind::QuotaExceeded);
        assert_eq!(c.message, "usage limit hit");
    }

    #[test]
    fn missing_message_falls_back_to_status() {
        let c = classify(&http(502, json!(null)));
        assert_eq!(c.kind, ErrorKind::Server);
        assert_eq!(c.message, "upstream returned status 502");
    }

    #[test]
    fn payload_envelope_with_quota_wording() {
        let c = classify_payload(&json!({"detail": "Quota exceeded for this month"})).unwrap();
        assert_eq!(c.kind, ErrorKind::QuotaExceeded);
        assert_eq!(c.disable_to, Some(KeyStatus::QuotaExceeded));
    }

    #[test]
    fn payload_envelope_with_rate_wording() {
        let c = classify_payload(&json!({"detail": "Rate limit hit, retry later"})).unwrap();
        assert_eq!(c.kind, ErrorKind::RateLimit);
        assert!(!c.increment_error_count);
    }

    #[test]
    fn payload_envelope_with_auth_wording() {
        let c = classify_payload(&json!({"detail": "Invalid API key provided"})).unwrap();
        assert_eq!(c.kind, ErrorKind::Auth);
        assert_eq!(c.disable_to, Some(KeyStatus::Banned));
    }

    #[test]
    fn clean_payload_is_not_an_error() {
        assert!(classify_payload(&json!({"results": []})).is_none());
        assert!(classify_payload(&json!({"detail": "all good here"})).is_none());
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(ErrorKind::QuotaExceeded.label(), "quota_exceeded");
        assert_eq!(ErrorKind::RateLimit.label(), "rate_limit");
    }
}
