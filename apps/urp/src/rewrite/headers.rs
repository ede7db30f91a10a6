//! Response header policy (spec 4.C.5): strip headers that would block
//! framing or script execution from a foreign origin, and rewrite cookies
//! so they land on the proxy's own origin.

use http::{HeaderMap, HeaderName, HeaderValue};

const STRIPPED_HEADERS: &[&str] = &[
    "content-security-policy",
    "content-security-policy-report-only",
    "x-content-security-policy",
    "x-frame-options",
    "cross-origin-opener-policy",
    "cross-origin-embedder-policy",
    "cross-origin-resource-policy",
    "permissions-policy",
    "x-xss-protection",
];

/// Strip headers that would otherwise prevent the rewritten page from
/// being framed or from running its (rewritten) scripts.
pub fn strip_restrictive_headers(headers: &mut HeaderMap) {
    for name in STRIPPED_HEADERS {
        headers.remove(*name);
    }
}

/// Rewrite every `Set-Cookie` so it is valid for the proxy's own origin:
/// drop `Domain=` (cookie then scopes to the responding host), drop
/// `Secure` on a plain-HTTP proxy, and force `SameSite=Lax` so the cookie
/// still rides along on top-level navigations.
pub fn rewrite_set_cookie_headers(headers: &mut HeaderMap, proxy_is_https: bool) {
    let rewritten: Vec<HeaderValue> = headers
        .get_all(http::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| rewrite_set_cookie(v, proxy_is_https))
        .filter_map(|v| HeaderValue::from_str(&v).ok())
        .collect();
    headers.remove(http::header::SET_COOKIE);
    for value in rewritten {
        headers.append(http::header::SET_COOKIE, value);
    }
}

fn rewrite_set_cookie(raw: &str, proxy_is_https: bool) -> String {
    let mut parts: Vec<String> = Vec::new();
    for attr in raw.split(';') {
        let trimmed = attr.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("domain=") {
            continue;
        }
        if lower == "secure" && !proxy_is_https {
            continue;
        }
        if lower.starts_with("samesite=") {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    parts.push("SameSite=Lax".to_string());
    parts.join("; ")
}

/// Headers the upstream may legitimately want the browser to see again,
/// even though the proxy otherwise minimizes what it forwards: CSRF and
/// challenge/verification tokens some SPAs read out of the response.
const RELAYED_CHALLENGE_HEADERS: &[&str] = &["x-csrf-token", "x-challenge-token", "x-verification-token"];

/// Ensure CORS exposes the headers scripts on the rewritten page may need
/// to read via `fetch().headers.get(...)`.
pub fn exposed_header_names() -> Vec<HeaderName> {
    RELAYED_CHALLENGE_HEADERS.iter().filter_map(|n| HeaderName::from_bytes(n.as_bytes()).ok()).collect()
}

/// Drop framing on a removed `Content-Length`/`Content-Encoding` once the
/// body has been decompressed and/or rewritten to a different length.
pub fn drop_length_and_encoding(headers: &mut HeaderMap) {
    headers.remove(http::header::CONTENT_LENGTH);
    headers.remove(http::header::CONTENT_ENCODING);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_frame_and_csp_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-security-policy", HeaderValue::from_static("default-src 'self'"));
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        strip_restrictive_headers(&mut headers);
        assert!(headers.get("content-security-policy").is_none());
        assert!(headers.get("x-frame-options").is_none());
        assert!(headers.get("content-type").is_some());
    }

    #[test]
    fn rewrites_cookie_domain_and_secure_and_samesite() {
        let mut headers = HeaderMap::new();
        headers.append(
            http::header::SET_COOKIE,
            HeaderValue::from_static("sid=abc; Domain=example.com; Secure; SameSite=None; Path=/"),
        );
        rewrite_set_cookie_headers(&mut headers, false);
        let value = headers.get(http::header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(!value.to_ascii_lowercase().contains("domain="));
        assert!(!value.to_ascii_lowercase().contains("secure"));
        assert!(value.contains("SameSite=Lax"));
        assert!(value.contains("Path=/"));
    }

    #[test]
    fn keeps_secure_when_proxy_is_https() {
        let mut headers = HeaderMap::new();
        headers.append(http::header::SET_COOKIE, HeaderValue::from_static("sid=abc; Secure"));
        rewrite_set_cookie_headers(&mut headers, true);
        let value = headers.get(http::header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(value.to_ascii_lowercase().contains("secure"));
    }
}
