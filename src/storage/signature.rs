//! Canonical endpoint signatures
//!
//! Requests that hit the same endpoint collapse to one archive entry. The
//! signature is `METHOD:path`, extended with the operation name for GraphQL.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use url::Url;

use crate::models::NetworkRequest;

static NAMED_OPERATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(query|mutation|subscription)\s+(\w+)").expect("valid operation pattern")
});

/// Deterministic 32-bit rolling hash rendered as 8 hex digits
pub fn hash8(input: &str) -> String {
    let hash = input.encode_utf16().fold(0u32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(u32::from(unit))
    });
    format!("{hash:08x}")
}

pub fn endpoint_signature(request: &NetworkRequest) -> String {
    let method = request.method.to_ascii_uppercase();
    let Ok(url) = Url::parse(&request.url) else {
        return format!("{method}:{}", request.url);
    };
    let base = format!("{method}:{}", url.path());

    let body = request
        .request_body
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty());
    let json_body = body.and_then(|b| serde_json::from_str::<Value>(b).ok());
    let lower_path = url.path().to_ascii_lowercase();
    let is_graphql = lower_path.contains("graphql")
        || lower_path.contains("gql")
        || json_body.as_ref().is_some_and(looks_like_graphql)
        || body.is_some_and(has_operation_keyword);
    if !is_graphql {
        return base;
    }

    match operation_name(body, json_body.as_ref(), &url) {
        Some(operation) => format!("{base}:{operation}"),
        None => base,
    }
}

fn has_operation_keyword(body: &str) -> bool {
    ["query ", "mutation ", "subscription "]
        .iter()
        .any(|keyword| body.contains(keyword))
}

fn looks_like_graphql(value: &Value) -> bool {
    match value {
        Value::Object(obj) => {
            obj.contains_key("query")
                || obj.contains_key("operationName")
                || obj.contains_key("variables")
        }
        Value::Array(items) => items.first().is_some_and(looks_like_graphql),
        _ => false,
    }
}

fn operation_name(body: Option<&str>, json_body: Option<&Value>, url: &Url) -> Option<String> {
    match json_body {
        Some(Value::Object(obj)) => {
            if let Some(name) = operation_from_object(obj) {
                return Some(name);
            }
        }
        Some(Value::Array(items)) => {
            let names = items
                .iter()
                .filter_map(Value::as_object)
                .filter_map(operation_from_object)
                .collect::<Vec<_>>();
            if !names.is_empty() {
                return Some(names.join("+"));
            }
        }
        Some(_) => {}
        None => {
            if let Some(text) = body {
                if has_operation_keyword(text) {
                    return Some(operation_from_query(text));
                }
            }
        }
    }

    if body.is_none() {
        let params = url
            .query_pairs()
            .filter(|(key, _)| key == "operationName" || key == "query")
            .map(|(key, value)| (key.into_owned(), Value::String(value.into_owned())))
            .collect::<Map<_, _>>();
        if let Some(name) = operation_from_object(&params) {
            return Some(name);
        }
    }

    body.map(|text| format!("operation_{}", hash8(text)))
}

fn operation_from_object(obj: &Map<String, Value>) -> Option<String> {
    if let Some(name) = obj
        .get("operationName")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
    {
        return Some(name.to_string());
    }
    obj.get("query")
        .and_then(Value::as_str)
        .filter(|query| !query.trim().is_empty())
        .map(operation_from_query)
}

/// Named operation from a query document, or `{type}_{hash8}` when anonymous
fn operation_from_query(query: &str) -> String {
    if let Some(captures) = NAMED_OPERATION.captures(query) {
        return captures[2].to_string();
    }
    let trimmed = query.trim_start();
    let op_type = if trimmed.starts_with("mutation") {
        "mutation"
    } else if trimmed.starts_with("subscription") {
        "subscription"
    } else {
        "query"
    };
    format!("{op_type}_{}", hash8(query))
}
