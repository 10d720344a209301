//! Scripted upstream double shared by dispatch tests

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use keystore::Operation;
use serde_json::{Value, json};

use crate::upstream::{CallOutcome, UsageSnapshot, Upstream};

pub(crate) struct MockUpstream {
    outcomes: Mutex<VecDeque<Result<CallOutcome, String>>>,
    usage: Mutex<Result<UsageSnapshot, String>>,
    pub keys_seen: Mutex<Vec<String>>,
    pub calls: AtomicU32,
    in_flight: AtomicU32,
    pub max_in_flight: AtomicU32,
    delay: Option<Duration>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            usage: Mutex::new(Err("usage not scripted".into())),
            keys_seen: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            delay: None,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    /// Queue one scripted outcome; once the queue is empty every call
    /// succeeds with [`MockUpstream::ok_body`].
    pub fn script(&self, outcome: Result<CallOutcome, String>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn script_status(&self, status: u16, body: Value) {
        self.script(Ok(CallOutcome {
            status,
            body,
            retry_after_secs: None,
        }));
    }

    pub fn set_usage(&self, usage: Result<UsageSnapshot, String>) {
        *self.usage.lock().unwrap() = usage;
    }

    pub fn ok_body() -> Value {
        json!({"query": "test", "results": []})
    }
}

impl Upstream for MockUpstream {
    fn call<'a>(
        &'a self,
        _operation: Operation,
        api_key: &'a str,
        _params: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<CallOutcome, String>> + Send + 'a>> {
        Box::pin(async move {
            self.keys_seen.lock().unwrap().push(api_key.to_string());
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.outcomes.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(CallOutcome {
                    status: 200,
                    body: Self::ok_body(),
                    retry_after_secs: None,
                })
            })
        })
    }

    fn fetch_usage<'a>(
        &'a self,
        _api_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<UsageSnapshot, String>> + Send + 'a>> {
        Box::pin(async move { self.usage.lock().unwrap().clone() })
    }
}
