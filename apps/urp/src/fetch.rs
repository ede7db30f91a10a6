//! The upstream fetcher (component B): one HTTP request to an origin with
//! spoofed headers, redirect following, and transparent decompression.
//!
//! Grounded in the bouncer reverse proxy's header ignore-list and the
//! warpgate HTTP proxy's forwarded-header injection and redirect/TLS
//! client configuration, adapted to reqwest's blocking-free client.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use url::Url;

use crate::error::ProxyError;

const MAX_REDIRECTS: u8 = 10;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-origin CSRF token cache, last-writer-wins, shared across requests.
#[derive(Default)]
pub struct CsrfCache {
    tokens: Mutex<HashMap<String, String>>,
}

impl CsrfCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, origin: &str) -> Option<String> {
        self.tokens.lock().unwrap().get(origin).cloned()
    }

    fn set(&self, origin: &str, token: String) {
        self.tokens.lock().unwrap().insert(origin.to_string(), token);
    }
}

/// Caller context the fetcher needs beyond the bare request: the client's
/// cookie jar, an optional explicit CSRF token, and the effective referer.
#[derive(Default, Clone)]
pub struct FetchContext {
    pub cookies: Option<String>,
    pub csrf_token: Option<String>,
    pub referer: Option<String>,
}

pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub final_url: Url,
}

fn insecure_tls_enabled() -> bool {
    std::env::var("URP_INSECURE_TLS").map(|v| v != "0" && v.to_lowercase() != "false").unwrap_or(true)
}

pub fn build_client() -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(UPSTREAM_TIMEOUT);
    if insecure_tls_enabled() {
        builder = builder.danger_accept_invalid_certs(true);
    }
    Ok(builder.build()?)
}

fn default_headers(target: &Url) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::USER_AGENT,
        HeaderValue::from_static(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        ),
    );
    headers.insert(http::header::ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"));
    headers.insert(http::header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(http::header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
    headers.insert(http::header::CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Ok(origin) = HeaderValue::from_str(&target.origin().ascii_serialization()) {
        headers.insert(http::header::ORIGIN, origin.clone());
        headers.insert(http::header::REFERER, origin);
    }
    headers
}

/// Issue a single logical request to `target`, following redirects
/// transparently and decompressing the final body.
pub async fn fetch(
    client: &reqwest::Client,
    csrf_cache: &CsrfCache,
    target: &Url,
    method: Method,
    caller_headers: &HeaderMap,
    body: Option<Bytes>,
    ctx: &FetchContext,
) -> Result<FetchResponse, ProxyError> {
    let mut current = target.clone();
    let mut current_method = method;
    let mut redirects = 0u8;

    loop {
        let mut headers = default_headers(&current);
        for (name, value) in caller_headers {
            headers.insert(name.clone(), value.clone());
        }
        if let Some(referer) = &ctx.referer {
            if let Ok(v) = HeaderValue::from_str(referer) {
                headers.insert(http::header::REFERER, v);
            }
        }
        if let Some(cookies) = &ctx.cookies {
            if let Ok(v) = HeaderValue::from_str(cookies) {
                headers.insert(http::header::COOKIE, v);
            }
        }
        let origin = current.origin().ascii_serialization();
        let csrf = ctx.csrf_token.clone().or_else(|| csrf_cache.get(&origin));
        if let Some(csrf) = csrf {
            if let Ok(v) = HeaderValue::from_str(&csrf) {
                headers.insert(HeaderName::from_static("x-csrf-token"), v);
            }
        }

        let mut req = client.request(current_method.clone(), current.clone()).headers(headers);
        if let Some(body) = body.clone() {
            req = req.body(body);
        }

        let resp = req.send().await.map_err(classify_error)?;
        let status = resp.status();

        if status.is_redirection() {
            if let Some(location) = resp.headers().get(http::header::LOCATION).and_then(|v| v.to_str().ok()) {
                if redirects >= MAX_REDIRECTS {
                    return Err(ProxyError::UpstreamConnectFailure);
                }
                redirects += 1;
                if let Ok(next) = current.join(location) {
                    // 307/308 preserve method; 301/302/303 downgrade POST to GET per RFC semantics.
                    if matches!(status.as_u16(), 301 | 302 | 303) && current_method == Method::POST {
                        current_method = Method::GET;
                    }
                    current = next;
                    continue;
                }
            }
        }

        let mut headers = resp.headers().clone();
        if let Some(token) = headers.get(HeaderName::from_static("x-csrf-token")).and_then(|v| v.to_str().ok()) {
            csrf_cache.set(&origin, token.to_string());
        }

        let encoding = headers.get(http::header::CONTENT_ENCODING).and_then(|v| v.to_str().ok()).map(|s| s.to_string());
        let final_url = resp.url().clone();
        let raw = resp.bytes().await.map_err(classify_error)?;
        let body_bytes = decompress(encoding.as_deref(), raw);
        headers.remove(http::header::CONTENT_ENCODING);
        headers.remove(http::header::CONTENT_LENGTH);

        return Ok(FetchResponse { status, headers, body: body_bytes, final_url });
    }
}

fn classify_error(err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError::UpstreamTimeout
    } else if err.to_string().to_lowercase().contains("tls") || err.to_string().to_lowercase().contains("certificate") {
        ProxyError::UpstreamTlsFailure
    } else {
        ProxyError::UpstreamConnectFailure
    }
}

/// Transparently decompress the body per `Content-Encoding`. Decompression
/// failures degrade to passing the compressed buffer through unchanged,
/// with a warning, rather than failing the request.
fn decompress(encoding: Option<&str>, body: Bytes) -> Bytes {
    use std::io::Read;
    match encoding {
        Some("gzip") => {
            let mut out = Vec::new();
            let mut decoder = flate2::read::GzDecoder::new(&body[..]);
            match decoder.read_to_end(&mut out) {
                Ok(_) => Bytes::from(out),
                Err(err) => {
                    tracing::warn!(error = %err, "gzip decompression failed, passing through");
                    body
                }
            }
        }
        Some("deflate") => {
            // Most servers send zlib-wrapped deflate; a few send raw deflate.
            let mut out = Vec::new();
            let zlib_ok = flate2::read::ZlibDecoder::new(&body[..]).read_to_end(&mut out).is_ok();
            if zlib_ok {
                return Bytes::from(out);
            }
            out.clear();
            if flate2::read::DeflateDecoder::new(&body[..]).read_to_end(&mut out).is_ok() {
                Bytes::from(out)
            } else {
                tracing::warn!("deflate decompression failed, passing through");
                body
            }
        }
        Some("br") => {
            let mut out = Vec::new();
            let mut decoder = brotli::Decompressor::new(&body[..], 4096);
            match decoder.read_to_end(&mut out) {
                Ok(_) => Bytes::from(out),
                Err(err) => {
                    tracing::warn!(error = %err, "brotli decompression failed, passing through");
                    body
                }
            }
        }
        _ => body,
    }
}
