use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;
use http::{HeaderMap, Uri, Version};
use opentelemetry::KeyValue;

use crate::error::Error;

/// Header names whose values never reach logs or spans verbatim.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
];

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn build_version() -> &'static str {
    option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
}

/// Result of parsing a request URL that may be relative (resolved later
/// against a host base URL) or absolute HTTP(S).
#[derive(Clone, Debug)]
pub(crate) enum ParsedUrl {
    Absolute(url::Url),
    Relative,
}

pub(crate) fn parse_relative_or_http_url(raw: &str) -> Result<ParsedUrl, Error> {
    match url::Url::parse(raw) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") {
                Ok(ParsedUrl::Absolute(parsed))
            } else {
                Err(Error::InvalidUrl {
                    url: raw.to_owned(),
                })
            }
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(ParsedUrl::Relative),
        Err(_) => Err(Error::InvalidUrl {
            url: raw.to_owned(),
        }),
    }
}

pub(crate) fn validate_http_url(raw: &str) -> Result<url::Url, Error> {
    match parse_relative_or_http_url(raw)? {
        ParsedUrl::Absolute(parsed) => Ok(parsed),
        ParsedUrl::Relative => Err(Error::InvalidUrl {
            url: raw.to_owned(),
        }),
    }
}

/// Join a request path onto a host base URL with exactly one separating
/// slash. Absolute URLs pass through untouched; empty and "/" map to the
/// base itself.
pub(crate) fn join_base_url(base_url: &str, path: &str) -> String {
    if path.is_empty() || path == "/" {
        return base_url.to_owned();
    }
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_owned();
    }

    let joined = if path.starts_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    };

    joined.trim_end_matches('/').to_owned()
}

/// Capture headers for logging and tracing. `None` allows everything,
/// an empty list allows nothing; credential-bearing headers are redacted.
pub(crate) fn telemetry_headers(
    headers: &HeaderMap,
    allowed: Option<&[String]>,
) -> BTreeMap<String, String> {
    let mut captured = BTreeMap::new();
    if allowed.is_some_and(<[String]>::is_empty) {
        return captured;
    }

    for name in headers.keys() {
        let name_text = name.as_str();
        if let Some(allowed) = allowed
            && !allowed
                .iter()
                .any(|entry| entry.eq_ignore_ascii_case(name_text))
        {
            continue;
        }

        let value = if SENSITIVE_HEADERS.contains(&name_text) {
            "<redacted>".to_owned()
        } else {
            headers
                .get_all(name)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect::<Vec<_>>()
                .join(", ")
        };
        captured.insert(name_text.to_owned(), value);
    }

    captured
}

/// Decode a `Retry-After` header: either a non-negative integer number of
/// seconds or an RFC 1123 HTTP-date in the future.
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let raw_value = value.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<u64>() {
        if seconds == 0 {
            return None;
        }
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    date.duration_since(now).ok().filter(|d| !d.is_zero())
}

pub(crate) fn default_port(scheme: Option<&str>, explicit: Option<u16>) -> Option<u16> {
    explicit.or_else(|| {
        let scheme = scheme?;
        if scheme.eq_ignore_ascii_case("https") {
            Some(443)
        } else if scheme.eq_ignore_ascii_case("http") {
            Some(80)
        } else {
            None
        }
    })
}

/// The common metric attribute set `{server.address, server.port,
/// url.scheme, http.request.method}` for a target URI.
pub(crate) fn metric_attributes(method: &str, uri: &Uri) -> Vec<KeyValue> {
    let mut attributes = vec![KeyValue::new("http.request.method", method.to_owned())];
    if let Some(host) = uri.host() {
        attributes.push(KeyValue::new("server.address", host.to_owned()));
        if let Some(port) = default_port(uri.scheme_str(), uri.port_u16()) {
            attributes.push(KeyValue::new("server.port", i64::from(port)));
        }
    }
    if let Some(scheme) = uri.scheme_str() {
        attributes.push(KeyValue::new("url.scheme", scheme.to_owned()));
    }
    attributes
}

pub(crate) fn protocol_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    }
}

/// Body content types worth echoing into debug logs and span attributes.
pub(crate) fn is_content_type_debuggable(content_type: &str) -> bool {
    content_type.starts_with("application/json")
        || content_type.starts_with("text/")
        || content_type.starts_with("application/xml")
        || content_type.starts_with("multipart/form-data")
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use http::HeaderMap;

    use super::*;

    #[test]
    fn join_base_url_handles_all_shapes() {
        assert_eq!(join_base_url("http://a.example", ""), "http://a.example");
        assert_eq!(join_base_url("http://a.example", "/"), "http://a.example");
        assert_eq!(
            join_base_url("http://a.example", "/v1/items"),
            "http://a.example/v1/items"
        );
        assert_eq!(
            join_base_url("http://a.example", "v1/items/"),
            "http://a.example/v1/items"
        );
        assert_eq!(
            join_base_url("http://a.example", "https://other.example/x"),
            "https://other.example/x"
        );
    }

    #[test]
    fn retry_after_integer_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "3".parse().expect("header value"));
        let delay = parse_retry_after(&headers, SystemTime::now());
        assert_eq!(delay, Some(Duration::from_secs(3)));
    }

    #[test]
    fn retry_after_http_date_in_future() {
        let now = SystemTime::now();
        let future = now + Duration::from_secs(90);
        let mut headers = HeaderMap::new();
        headers.insert(
            "retry-after",
            httpdate::fmt_http_date(future)
                .parse()
                .expect("header value"),
        );
        let delay = parse_retry_after(&headers, now).expect("future date parses");
        assert!(delay >= Duration::from_secs(89));
    }

    #[test]
    fn retry_after_past_date_is_ignored() {
        let now = SystemTime::now();
        let past = now - Duration::from_secs(90);
        let mut headers = HeaderMap::new();
        headers.insert(
            "retry-after",
            httpdate::fmt_http_date(past).parse().expect("header value"),
        );
        assert_eq!(parse_retry_after(&headers, now), None);
    }

    #[test]
    fn telemetry_headers_allow_list_semantics() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        headers.insert("x-trace", "t1".parse().unwrap());

        let all = telemetry_headers(&headers, None);
        assert_eq!(all.len(), 3);
        assert_eq!(all["authorization"], "<redacted>");

        let none = telemetry_headers(&headers, Some(&[]));
        assert!(none.is_empty());

        let some = telemetry_headers(&headers, Some(&["X-Trace".to_owned()]));
        assert_eq!(some.len(), 1);
        assert_eq!(some["x-trace"], "t1");
    }

    #[test]
    fn relative_urls_are_accepted() {
        assert!(matches!(
            parse_relative_or_http_url("/v1/items"),
            Ok(ParsedUrl::Relative)
        ));
        assert!(matches!(
            parse_relative_or_http_url("https://api.example.com/v1"),
            Ok(ParsedUrl::Absolute(_))
        ));
        assert!(parse_relative_or_http_url("ftp://api.example.com").is_err());
    }
}
