//! Per-operation credit cost

use std::sync::Arc;

use keystore::Operation;
use serde_json::Value;

/// Computes the credit cost of one successful call from its request
/// shape. The provider's billing formula changes over time; operators can
/// swap this without touching the dispatch loop.
pub type CostFn = Arc<dyn Fn(Operation, &Value) -> u64 + Send + Sync>;

/// Approximation of the provider's published pricing: searches bill by
/// depth, extraction bills per five URLs (doubled for advanced depth),
/// crawl and map count one credit per call.
pub fn default_cost_fn() -> CostFn {
    Arc::new(|operation, params| match operation {
        Operation::Search => depth_multiplier(params),
        Operation::Extract => {
            let urls = params
                .get("urls")
                .and_then(Value::as_array)
                .map_or(1, Vec::len)
                .max(1) as u64;
            urls.div_ceil(5) * depth_multiplier(params)
        }
        Operation::Crawl | Operation::Map => 1,
    })
}

fn depth_multiplier(params: &Value) -> u64 {
    let depth = params
        .get("search_depth")
        .or_else(|| params.get("extract_depth"))
        .and_then(Value::as_str);
    match depth {
        Some("advanced") => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn basic_search_costs_one() {
        let cost = default_cost_fn();
        assert_eq!(cost(Operation::Search, &json!({"query": "rust"})), 1);
    }

    #[test]
    fn advanced_search_costs_two() {
        let cost = default_cost_fn();
        assert_eq!(
            cost(Operation::Search, &json!({"query": "rust", "search_depth": "advanced"})),
            2
        );
    }

    #[test]
    fn extract_bills_per_five_urls() {
        let cost = default_cost_fn();
        let five = json!({"urls": ["a", "b", "c", "d", "e"]});
        let six = json!({"urls": ["a", "b", "c", "d", "e", "f"]});
        assert_eq!(cost(Operation::Extract, &five), 1);
        assert_eq!(cost(Operation::Extract, &six), 2);
    }

    #[test]
    fn advanced_extract_doubles() {
        let cost = default_cost_fn();
        let params = json!({"urls": ["a"], "extract_depth": "advanced"});
        assert_eq!(cost(Operation::Extract, &params), 2);
    }

    #[test]
    fn crawl_and_map_cost_one() {
        let cost = default_cost_fn();
        assert_eq!(cost(Operation::Crawl, &json!({"url": "https://example.com"})), 1);
        assert_eq!(cost(Operation::Map, &json!({"url": "https://example.com"})), 1);
    }
}
