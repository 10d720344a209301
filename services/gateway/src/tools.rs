//! Operation catalog and parameter shaping
//!
//! Callers send loosely typed argument objects. Before dispatch each
//! operation's payload is rebuilt from its known fields, configured search
//! defaults fill the gaps, and empty values are pruned so the provider
//! never sees `""`, `null`, or `[]`.

use keystore::Operation;
use serde_json::{Map, Value, json};

const SEARCH_FIELDS: &[&str] = &[
    "query",
    "search_depth",
    "topic",
    "days",
    "time_range",
    "max_results",
    "include_images",
    "include_image_descriptions",
    "include_raw_content",
    "include_domains",
    "exclude_domains",
    "country",
    "include_favicon",
    "start_date",
    "end_date",
];

const EXTRACT_FIELDS: &[&str] = &[
    "urls",
    "extract_depth",
    "include_images",
    "format",
    "include_favicon",
    "query",
];

const CRAWL_FIELDS: &[&str] = &[
    "url",
    "max_depth",
    "max_breadth",
    "limit",
    "instructions",
    "select_paths",
    "select_domains",
    "allow_external",
    "extract_depth",
    "format",
    "include_favicon",
];

const MAP_FIELDS: &[&str] = &[
    "url",
    "max_depth",
    "max_breadth",
    "limit",
    "instructions",
    "select_paths",
    "select_domains",
    "allow_external",
];

/// Crawl extraction is always chunked at this width.
const CRAWL_CHUNKS_PER_SOURCE: u64 = 3;

/// The four operations as exposed on `/tools/list`.
pub fn catalog() -> Value {
    json!([
        descriptor(
            Operation::Search,
            "Web search with topic, recency, and domain filtering",
            &["query"],
            SEARCH_FIELDS,
        ),
        descriptor(
            Operation::Extract,
            "Extract page content from a list of URLs",
            &["urls"],
            EXTRACT_FIELDS,
        ),
        descriptor(
            Operation::Crawl,
            "Crawl a site from a base URL and extract matching pages",
            &["url"],
            CRAWL_FIELDS,
        ),
        descriptor(
            Operation::Map,
            "Map a site's link structure from a base URL",
            &["url"],
            MAP_FIELDS,
        ),
    ])
}

fn descriptor(
    operation: Operation,
    description: &str,
    required: &[&str],
    fields: &[&str],
) -> Value {
    let optional: Vec<&str> = fields
        .iter()
        .copied()
        .filter(|f| !required.contains(f))
        .collect();
    json!({
        "name": operation.as_str(),
        "description": description,
        "parameters": { "required": required, "optional": optional },
    })
}

/// Rebuild the request payload for `operation` from the caller's arguments.
///
/// Unknown fields are dropped. For search, `search_defaults` fill fields the
/// caller left unset, a `country` filter forces `topic = "general"`, and an
/// explicit date range wins over the relative `time_range`/`days` window.
pub fn shape(operation: Operation, args: &Value, search_defaults: &Map<String, Value>) -> Value {
    let args = args.as_object().cloned().unwrap_or_default();
    let fields = match operation {
        Operation::Search => SEARCH_FIELDS,
        Operation::Extract => EXTRACT_FIELDS,
        Operation::Crawl => CRAWL_FIELDS,
        Operation::Map => MAP_FIELDS,
    };

    let mut payload = Map::new();
    for &field in fields {
        if let Some(value) = args.get(field) {
            payload.insert(field.to_string(), value.clone());
        }
    }

    if operation == Operation::Search {
        for (key, value) in search_defaults {
            if payload.get(key).is_none_or(Value::is_null) {
                payload.insert(key.clone(), value.clone());
            }
        }
        if is_set(payload.get("country")) {
            payload.insert("topic".into(), Value::String("general".into()));
        }
        if is_set(payload.get("start_date")) || is_set(payload.get("end_date")) {
            payload.remove("time_range");
            payload.remove("days");
        }
    }

    if operation == Operation::Crawl {
        payload.insert("chunks_per_source".into(), json!(CRAWL_CHUNKS_PER_SOURCE));
    }

    prune_empty(payload)
}

fn is_set(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn prune_empty(payload: Map<String, Value>) -> Value {
    let cleaned: Map<String, Value> = payload
        .into_iter()
        .filter(|(_, value)| match value {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            _ => true,
        })
        .collect();
    Value::Object(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_defaults() -> Map<String, Value> {
        Map::new()
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn catalog_lists_all_four_operations() {
        let tools = catalog();
        let names: Vec<&str> = tools
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["search", "extract", "crawl", "map"]);
    }

    #[test]
    fn unknown_fields_are_dropped() {
        let shaped = shape(
            Operation::Search,
            &json!({"query": "rust", "api_key": "tvly-oops"}),
            &no_defaults(),
        );
        assert_eq!(shaped, json!({"query": "rust"}));
    }

    #[test]
    fn defaults_fill_only_missing_fields() {
        let defaults = obj(json!({"search_depth": "advanced", "max_results": 5}));
        let shaped = shape(
            Operation::Search,
            &json!({"query": "rust", "max_results": 10}),
            &defaults,
        );
        assert_eq!(shaped["search_depth"], "advanced");
        assert_eq!(shaped["max_results"], 10);
    }

    #[test]
    fn null_argument_takes_the_default() {
        let defaults = obj(json!({"search_depth": "advanced"}));
        let shaped = shape(
            Operation::Search,
            &json!({"query": "rust", "search_depth": null}),
            &defaults,
        );
        assert_eq!(shaped["search_depth"], "advanced");
    }

    #[test]
    fn country_filter_forces_general_topic() {
        let shaped = shape(
            Operation::Search,
            &json!({"query": "rust", "topic": "news", "country": "france"}),
            &no_defaults(),
        );
        assert_eq!(shaped["topic"], "general");
    }

    #[test]
    fn empty_country_does_not_touch_topic() {
        let shaped = shape(
            Operation::Search,
            &json!({"query": "rust", "topic": "news", "country": ""}),
            &no_defaults(),
        );
        assert_eq!(shaped["topic"], "news");
        assert!(shaped.get("country").is_none());
    }

    #[test]
    fn explicit_dates_clear_relative_windows() {
        let shaped = shape(
            Operation::Search,
            &json!({
                "query": "rust",
                "start_date": "2025-01-01",
                "time_range": "week",
                "days": 7,
            }),
            &no_defaults(),
        );
        assert_eq!(shaped["start_date"], "2025-01-01");
        assert!(shaped.get("time_range").is_none());
        assert!(shaped.get("days").is_none());
    }

    #[test]
    fn relative_window_survives_without_dates() {
        let shaped = shape(
            Operation::Search,
            &json!({"query": "rust", "time_range": "week"}),
            &no_defaults(),
        );
        assert_eq!(shaped["time_range"], "week");
    }

    #[test]
    fn empty_values_are_pruned_but_falsy_ones_kept() {
        let shaped = shape(
            Operation::Search,
            &json!({
                "query": "rust",
                "topic": "",
                "include_domains": [],
                "days": 0,
                "include_images": false,
            }),
            &no_defaults(),
        );
        assert!(shaped.get("topic").is_none());
        assert!(shaped.get("include_domains").is_none());
        assert_eq!(shaped["days"], 0);
        assert_eq!(shaped["include_images"], false);
    }

    #[test]
    fn crawl_always_carries_chunks_per_source() {
        let shaped = shape(
            Operation::Crawl,
            &json!({"url": "https://example.com", "max_depth": 2}),
            &no_defaults(),
        );
        assert_eq!(shaped["chunks_per_source"], 3);
        assert_eq!(shaped["max_depth"], 2);
    }

    #[test]
    fn map_payload_has_no_extraction_fields() {
        let shaped = shape(
            Operation::Map,
            &json!({"url": "https://example.com", "extract_depth": "advanced"}),
            &no_defaults(),
        );
        assert_eq!(shaped, json!({"url": "https://example.com"}));
    }

    #[test]
    fn non_object_arguments_shape_to_defaults() {
        let defaults = obj(json!({"search_depth": "basic"}));
        let shaped = shape(Operation::Search, &Value::Null, &defaults);
        assert_eq!(shaped, json!({"search_depth": "basic"}));
    }
}
