//! Upstream provider HTTP client
//!
//! The [`Upstream`] trait is the seam between the dispatch engine and the
//! provider's HTTP API: four task endpoints plus the usage endpoint.
//! `Err` carries a transport-level message (connect, TLS, timeout); any
//! HTTP response, success or not, comes back as a [`CallOutcome`] for the
//! classifier to judge.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use keystore::Operation;
use serde_json::Value;

pub const DEFAULT_BASE_URL: &str = "https://api.tavily.com";

/// The usage endpoint answers fast or not at all; keep its timeout short
/// so a 429 disambiguation never stalls the retry loop.
const USAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw outcome of an upstream exchange that produced an HTTP response.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub status: u16,
    pub body: Value,
    /// Parsed `Retry-After` header, when present.
    pub retry_after_secs: Option<u64>,
}

/// Plan usage reported by the provider's usage endpoint.
#[derive(Debug, Clone, Copy)]
pub struct UsageSnapshot {
    pub used: u64,
    /// `None` when the plan is unbounded or the limit is unknown.
    pub limit: Option<u64>,
}

impl UsageSnapshot {
    /// Remaining credits, `None` when no limit is known.
    pub fn remaining(&self) -> Option<i64> {
        self.limit.map(|limit| limit as i64 - self.used as i64)
    }
}

/// Transport seam for the dispatch engine.
///
/// `Pin<Box<dyn Future>>` return types keep the trait dyn-compatible so
/// the engine can hold an `Arc<dyn Upstream>` and tests can substitute a
/// scripted double.
pub trait Upstream: Send + Sync {
    /// POST one task operation with the given key.
    fn call<'a>(
        &'a self,
        operation: Operation,
        api_key: &'a str,
        params: &'a Value,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<CallOutcome, String>> + Send + 'a>>;

    /// Fetch the key's current plan usage.
    fn fetch_usage<'a>(
        &'a self,
        api_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<UsageSnapshot, String>> + Send + 'a>>;
}

/// reqwest-backed client against the real provider.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    async fn post_task(
        &self,
        operation: Operation,
        api_key: &str,
        params: &Value,
    ) -> std::result::Result<CallOutcome, String> {
        let url = endpoint_url(&self.base_url, operation.as_str());
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .header("X-Client-Source", "pool-gateway")
            .json(params)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let text = response.text().await.map_err(|e| e.to_string())?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(CallOutcome {
            status,
            body,
            retry_after_secs,
        })
    }

    async fn get_usage(&self, api_key: &str) -> std::result::Result<UsageSnapshot, String> {
        let url = endpoint_url(&self.base_url, "usage");
        let response = self
            .client
            .get(&url)
            .bearer_auth(api_key)
            .timeout(USAGE_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("usage endpoint returned status {}", response.status()));
        }
        let body: Value = response.json().await.map_err(|e| e.to_string())?;
        parse_usage(&body).ok_or_else(|| "usage response missing plan counters".to_string())
    }
}

impl Upstream for HttpUpstream {
    fn call<'a>(
        &'a self,
        operation: Operation,
        api_key: &'a str,
        params: &'a Value,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<CallOutcome, String>> + Send + 'a>> {
        Box::pin(self.post_task(operation, api_key, params))
    }

    fn fetch_usage<'a>(
        &'a self,
        api_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<UsageSnapshot, String>> + Send + 'a>> {
        Box::pin(self.get_usage(api_key))
    }
}

fn endpoint_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

/// Usage bodies come in two shapes; prefer the account-level plan
/// counters over the per-key ones.
pub fn parse_usage(body: &Value) -> Option<UsageSnapshot> {
    if let Some(account) = body.get("account")
        && let Some(used) = account.get("plan_usage").and_then(Value::as_u64)
    {
        return Some(UsageSnapshot {
            used,
            limit: account.get("plan_limit").and_then(Value::as_u64),
        });
    }
    let key = body.get("key")?;
    Some(UsageSnapshot {
        used: key.get("usage").and_then(Value::as_u64)?,
        limit: key.get("limit").and_then(Value::as_u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_url_joins_without_double_slash() {
        assert_eq!(
            endpoint_url("https://api.tavily.com/", "search"),
            "https://api.tavily.com/search"
        );
        assert_eq!(
            endpoint_url("https://api.tavily.com", "usage"),
            "https://api.tavily.com/usage"
        );
    }

    #[test]
    fn parse_usage_prefers_account_counters() {
        let body = json!({
            "key": {"usage": 5, "limit": 100},
            "account": {"plan_usage": 950, "plan_limit": 1000}
        });
        let usage = parse_usage(&body).unwrap();
        assert_eq!(usage.used, 950);
        assert_eq!(usage.limit, Some(1000));
    }

    #[test]
    fn parse_usage_falls_back_to_key_counters() {
        let body = json!({"key": {"usage": 5, "limit": 100}});
        let usage = parse_usage(&body).unwrap();
        assert_eq!(usage.used, 5);
        assert_eq!(usage.limit, Some(100));
    }

    #[test]
    fn parse_usage_handles_unlimited_plan() {
        let body = json!({"account": {"plan_usage": 42}});
        let usage = parse_usage(&body).unwrap();
        assert_eq!(usage.limit, None);
        assert_eq!(usage.remaining(), None);
    }

    #[test]
    fn parse_usage_rejects_unrecognized_shape() {
        assert!(parse_usage(&json!({"credits": 10})).is_none());
    }

    #[test]
    fn remaining_goes_negative_past_the_limit() {
        let usage = UsageSnapshot {
            used: 1010,
            limit: Some(1000),
        };
        assert_eq!(usage.remaining(), Some(-10));
    }
}
