//! App state and shared helpers.
//!
//! `AppState` holds the services every handler needs: the fleet (session &
//! token store), the rate limiter, and an HTTP client for the browser
//! reverse proxy's upstream leg.

use std::sync::Arc;

use axum::http::HeaderMap;
use fleet::Fleet;
use rate::RateLimiter;

/// Cookie carrying the long-lived `cookie_token` once a browser slot has
/// been granted.
pub const SESSION_COOKIE: &str = "session";

/// Companion cookie carrying the slot id a `session` cookie is scoped to.
pub const BROWSER_COOKIE: &str = "browser";

const COOKIE_MAX_AGE_SECS: u32 = 86400;

#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<Fleet>,
    pub rate: Arc<RateLimiter>,
    pub http: reqwest::Client,
    /// Pre-shared `Authorization: Basic ...` value forwarded to upstream
    /// containers that require it. `None` when the container variant in
    /// use has no such requirement.
    pub container_auth: Option<String>,
}

/// Build the `Set-Cookie` value for the `session` cookie carrying
/// `cookie_token`: `HttpOnly; SameSite=Lax`, good for 24 hours.
pub fn session_cookie_header(cookie_token: &str) -> String {
    format!("{SESSION_COOKIE}={cookie_token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={COOKIE_MAX_AGE_SECS}")
}

/// Build the `Set-Cookie` value for the `browser` companion cookie carrying
/// the slot id a `session` cookie is scoped to.
pub fn browser_cookie_header(slot_id: u32) -> String {
    format!("{BROWSER_COOKIE}={slot_id}; Path=/; HttpOnly; SameSite=Lax; Max-Age={COOKIE_MAX_AGE_SECS}")
}

/// Pull the session cookie's raw value out of the `Cookie` header.
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers.get(axum::http::header::COOKIE).and_then(|hv| hv.to_str().ok()).and_then(|cookie_header| {
        cookie_header.split(';').find_map(|kv| {
            let kv = kv.trim();
            kv.strip_prefix(&format!("{SESSION_COOKIE}=")).map(|v| v.to_string())
        })
    })
}

/// Derive a per-request rate key: the session cookie if present, else the
/// caller's address.
pub fn rate_key(headers: &HeaderMap, remote_addr: &str) -> String {
    session_cookie(headers).unwrap_or_else(|| remote_addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_header_has_expected_shape() {
        let header = session_cookie_header("tok123");
        assert_eq!(header, "session=tok123; Path=/; HttpOnly; SameSite=Lax; Max-Age=86400");
    }

    #[test]
    fn browser_cookie_header_has_expected_shape() {
        let header = browser_cookie_header(3);
        assert_eq!(header, "browser=3; Path=/; HttpOnly; SameSite=Lax; Max-Age=86400");
    }
}
