//! Endpoint classifier
//!
//! Decides, per request initiation, whether the request is API traffic worth
//! recording. Pure: the same inputs always give the same answer.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::capture::events::Initiator;
use crate::models::{header_value, Headers};

const STATIC_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".mjs", ".map", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp",
    ".avif", ".bmp", ".woff", ".woff2", ".ttf", ".otf", ".eot", ".mp4", ".webm", ".mp3", ".wav",
    ".ogg", ".pdf", ".wasm",
];

/// Analytics, tracking, advertising and error-reporting vendors
const NON_API_PATTERNS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "analytics.google.com",
    "doubleclick.net",
    "googlesyndication.com",
    "googleadservices.com",
    "adservice.google.",
    "facebook.com/tr",
    "connect.facebook.net",
    "segment.io",
    "segment.com/v1",
    "mixpanel.com",
    "amplitude.com",
    "hotjar.com",
    "hotjar.io",
    "fullstory.com",
    "clarity.ms",
    "sentry.io",
    "bugsnag.com",
    "nr-data.net",
    "newrelic.com",
    "browser-intake-datadoghq",
    "rollbar.com",
    "logrocket.",
    "heap.io",
    "heapanalytics.com",
    "/__utm.gif",
    "/pixel.gif",
];

const AUTH_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "x-auth-token",
    "x-access-token",
    "x-csrf-token",
    "x-xsrf-token",
];

const AUTH_QUERY_PARAMS: &[&str] = &[
    "access_token",
    "api_key",
    "apikey",
    "auth",
    "jwt",
    "key",
    "session",
    "signature",
    "token",
];

const AUTH_COOKIE_HINTS: &[&str] = &["session", "sid", "token", "jwt", "auth"];

static STRONG_API_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(/api(/|$|\?)|/graphql|/gql(/|$|\?)|/v\d+(/|$|\?)|/auth/|/oauth|/rest/|/trpc/|/jsonrpc)")
        .expect("valid strong api pattern")
});

static WEAK_API_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\.json($|\?)|/search|/export|/query|/data/|/ajax|/rpc|/feed|/autocomplete|/suggest)")
        .expect("valid weak api pattern")
});

static AUTH_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(^|/)(login|logout|signin|signup|sign-in|token|session|sso|mfa)(/|$|[-_.])")
        .expect("valid auth pattern")
});

static APP_BUNDLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(chunk|bundle|main|app|vendor|runtime|index)[.\-][^/]*\.m?js")
        .expect("valid bundle pattern")
});

/// Request-side facts available at initiation
#[derive(Debug, Clone, Copy)]
pub struct RequestRecord<'a> {
    pub method: &'a str,
    pub headers: &'a Headers,
    /// Present when classifying after a response arrived
    pub response_headers: Option<&'a Headers>,
}

/// Which rule decided the outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    StaticAsset,
    NonApiVendor,
    DeclaredProgrammatic,
    ApiPath,
    ApiContentType,
    ApiHost,
    WeakSignals(u8),
}

impl Classification {
    pub fn is_retained(&self) -> bool {
        match self {
            Classification::StaticAsset | Classification::NonApiVendor => false,
            Classification::WeakSignals(count) => *count >= 2,
            _ => true,
        }
    }
}

/// Retain/drop decision for a newly observed request
pub fn retain(
    url: &str,
    declared_type: Option<&str>,
    request: &RequestRecord<'_>,
    initiator: Option<&Initiator>,
) -> bool {
    classify(url, declared_type, request, initiator).is_retained()
}

/// First matching rule wins.
pub fn classify(
    url: &str,
    declared_type: Option<&str>,
    request: &RequestRecord<'_>,
    initiator: Option<&Initiator>,
) -> Classification {
    let parsed = Url::parse(url).ok();
    let path = parsed
        .as_ref()
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_else(|| url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase());
    let lower_url = url.to_ascii_lowercase();

    if STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return Classification::StaticAsset;
    }
    if NON_API_PATTERNS.iter().any(|p| lower_url.contains(p)) {
        return Classification::NonApiVendor;
    }
    if is_programmatic_type(declared_type) {
        return Classification::DeclaredProgrammatic;
    }
    if STRONG_API_PATH.is_match(&lower_url) {
        return Classification::ApiPath;
    }
    let structured = header_value(request.headers, "content-type")
        .into_iter()
        .chain(request.response_headers.and_then(|h| header_value(h, "content-type")))
        .any(is_structured_content_type);
    if structured {
        return Classification::ApiContentType;
    }
    let host = parsed
        .as_ref()
        .and_then(|u| u.host_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if ["api.", "api-", "gateway.", "backend.", "graphql."]
        .iter()
        .any(|prefix| host.starts_with(prefix))
    {
        return Classification::ApiHost;
    }

    let signals = [
        !matches!(request.method.to_ascii_uppercase().as_str(), "GET" | "HEAD"),
        has_auth_signal(&path, parsed.as_ref(), request.headers),
        is_app_initiator(initiator),
        WEAK_API_PATH.is_match(&lower_url),
    ];
    Classification::WeakSignals(signals.iter().filter(|s| **s).count() as u8)
}

fn is_programmatic_type(declared_type: Option<&str>) -> bool {
    matches!(
        declared_type.map(|t| t.to_ascii_lowercase()).as_deref(),
        Some("xhr") | Some("fetch") | Some("xmlhttprequest")
    )
}

/// Content types that carry structured API payloads
pub fn is_structured_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("json")
        || ct.contains("application/xml")
        || ct.contains("+xml")
        || ct.contains("grpc")
        || ct.contains("protobuf")
        || ct.contains("graphql")
        || ct.contains("msgpack")
}

fn has_auth_signal(path: &str, url: Option<&Url>, headers: &Headers) -> bool {
    if AUTH_PATH.is_match(path) {
        return true;
    }
    if AUTH_HEADERS
        .iter()
        .any(|name| header_value(headers, name).is_some())
    {
        return true;
    }
    if let Some(cookie) = header_value(headers, "cookie") {
        let has_auth_cookie = cookie.split(';').any(|pair| {
            let name = pair.split('=').next().unwrap_or_default().trim().to_ascii_lowercase();
            AUTH_COOKIE_HINTS.iter().any(|hint| name.contains(hint))
        });
        if has_auth_cookie {
            return true;
        }
    }
    url.map(|u| {
        u.query_pairs().any(|(name, _)| {
            let name = name.to_ascii_lowercase();
            AUTH_QUERY_PARAMS.contains(&name.as_str())
        })
    })
    .unwrap_or(false)
}

/// Script-initiated from what looks like a single-page-app bundle
fn is_app_initiator(initiator: Option<&Initiator>) -> bool {
    let Some(initiator) = initiator else {
        return false;
    };
    if !initiator.kind.eq_ignore_ascii_case("script") {
        return false;
    }
    let from_bundle = initiator
        .url
        .as_deref()
        .map(|u| APP_BUNDLE.is_match(u))
        .unwrap_or(false);
    let has_stack = initiator
        .stack
        .as_ref()
        .and_then(|s| s.get("callFrames"))
        .and_then(|f| f.as_array())
        .map(|frames| !frames.is_empty())
        .unwrap_or(false);
    from_bundle || has_stack
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record<'a>(method: &'a str, headers: &'a Headers) -> RequestRecord<'a> {
        RequestRecord {
            method,
            headers,
            response_headers: None,
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn declared_fetch_to_api_path_is_retained() {
        let h = Headers::new();
        let decision = classify(
            "https://app.example.com/api/users/42",
            Some("Fetch"),
            &record("GET", &h),
            None,
        );
        assert_eq!(decision, Classification::DeclaredProgrammatic);
        assert!(decision.is_retained());
    }

    #[test]
    fn static_bundle_is_rejected_even_when_fetched() {
        let h = Headers::new();
        assert!(!retain(
            "https://cdn.example.com/bundle.a1b2.js",
            Some("Fetch"),
            &record("GET", &h),
            None
        ));
    }

    #[test]
    fn single_weak_signal_is_not_enough() {
        let h = Headers::new();
        let decision = classify(
            "https://example.com/search?q=x",
            Some("Script"),
            &record("GET", &h),
            None,
        );
        assert_eq!(decision, Classification::WeakSignals(1));
        assert!(!decision.is_retained());
    }

    #[test]
    fn two_weak_signals_are_retained() {
        let h = Headers::new();
        let decision = classify(
            "https://example.com/search?q=x",
            Some("Other"),
            &record("POST", &h),
            None,
        );
        assert_eq!(decision, Classification::WeakSignals(2));
        assert!(decision.is_retained());
    }

    #[test]
    fn tracking_vendor_is_rejected_before_declared_type() {
        let h = Headers::new();
        assert_eq!(
            classify(
                "https://www.google-analytics.com/g/collect?v=2",
                Some("XHR"),
                &record("POST", &h),
                None
            ),
            Classification::NonApiVendor
        );
    }

    #[test]
    fn beacon_to_rest_path_is_retained() {
        let h = Headers::new();
        assert_eq!(
            classify(
                "https://shop.example.com/v2/cart/items",
                Some("Ping"),
                &record("POST", &h),
                None
            ),
            Classification::ApiPath
        );
    }

    #[test]
    fn json_content_type_is_retained() {
        let h = headers(&[("Content-Type", "application/json; charset=utf-8")]);
        assert_eq!(
            classify(
                "https://example.com/cart/add",
                Some("Other"),
                &record("POST", &h),
                None
            ),
            Classification::ApiContentType
        );
    }

    #[test]
    fn api_subdomain_is_retained() {
        let h = Headers::new();
        assert_eq!(
            classify(
                "https://api.example.com/users",
                Some("Other"),
                &record("GET", &h),
                None
            ),
            Classification::ApiHost
        );
    }

    #[test]
    fn auth_header_and_app_initiator_corroborate() {
        let h = headers(&[("Authorization", "Bearer abc")]);
        let initiator = Initiator {
            kind: "script".into(),
            url: Some("https://example.com/static/main.8f3a.js".into()),
            stack: None,
        };
        assert_eq!(
            classify(
                "https://example.com/me",
                Some("Other"),
                &record("GET", &h),
                Some(&initiator)
            ),
            Classification::WeakSignals(2)
        );
    }

    #[test]
    fn stack_frames_mark_script_initiator() {
        let initiator: Initiator = serde_json::from_value(json!({
            "type": "script",
            "stack": { "callFrames": [{ "functionName": "load" }] }
        }))
        .unwrap();
        assert!(is_app_initiator(Some(&initiator)));
        assert!(!is_app_initiator(None));
    }

    #[test]
    fn auth_cookie_and_query_param_are_detected() {
        let h = headers(&[("Cookie", "theme=dark; sessionid=xyz")]);
        assert!(has_auth_signal("/profile", None, &h));
        let url = Url::parse("https://example.com/profile?access_token=1").unwrap();
        assert!(has_auth_signal("/profile", Some(&url), &Headers::new()));
        assert!(!has_auth_signal("/profile", Some(&url.join("/x?q=1").unwrap()), &Headers::new()));
    }

    #[test]
    fn auth_keywords_match_whole_path_segments() {
        let none = Headers::new();
        assert!(has_auth_signal("/login", None, &none));
        assert!(has_auth_signal("/auth/sso/start", None, &none));
        assert!(has_auth_signal("/api/session-refresh", None, &none));
        assert!(!has_auth_signal("/lessons/search", None, &none));
        assert!(!has_auth_signal("/professors/list", None, &none));
        assert!(!has_auth_signal("/pmfa-docs", None, &none));

        let decision = classify(
            "https://example.com/lessons/search",
            Some("Script"),
            &record("GET", &none),
            None,
        );
        assert_eq!(decision, Classification::WeakSignals(1));
        assert!(!decision.is_retained());
    }

    #[test]
    fn classification_is_deterministic() {
        let h = headers(&[("X-Api-Key", "k")]);
        let first = classify("https://example.com/export", None, &record("GET", &h), None);
        for _ in 0..10 {
            assert_eq!(
                classify("https://example.com/export", None, &record("GET", &h), None),
                first
            );
        }
    }
}
