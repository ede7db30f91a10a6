//! The request router (component E): a four-state classifier deciding
//! whether an inbound request is the landing page, a fingerprinted proxy
//! request, a relative fall-through against a remembered base, or a 404.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use url::Url;

use crate::error::ProxyError;
use crate::fetch::{self, FetchContext};
use crate::rewrite::{css, html, js, RewriteContext};
use crate::shim;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(shim::MAIN_SHIM_PATH, get(serve_shim))
        .route("/healthz", get(|| async { "ok" }))
        .fallback(handle_proxy)
        .with_state(state)
}

async fn serve_shim() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        shim::main_shim_js(),
    )
}

fn landing_page() -> Html<&'static str> {
    Html(
        r#"<!doctype html><html><head><meta charset="utf-8"><title>Proxy</title></head>
<body>
<form method="get" action="/">
<input name="url" placeholder="https://example.com" style="width:24rem">
<button type="submit">Go</button>
</form>
<script>
document.querySelector('form').addEventListener('submit', function (ev) {
  ev.preventDefault();
  var u = new FormData(ev.target).get('url');
  location.href = '/?' + new URLSearchParams({ url: u });
});
var params = new URLSearchParams(location.search);
var direct = params.get('url');
if (direct) {
  fetch('/__cpo/resolve?url=' + encodeURIComponent(direct)).then(function () {});
}
</script>
</body></html>"#,
    )
}

fn client_key(addr: Option<SocketAddr>, headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            return first.trim().to_string();
        }
    }
    addr.map(|a| a.ip().to_string()).unwrap_or_else(|| "unknown".to_string())
}

fn is_self_loop(target: &Url, public_origin: &str) -> bool {
    let Ok(public) = Url::parse(public_origin) else { return false };
    let loopback_hosts = ["localhost", "127.0.0.1", "::1"];
    match (target.host_str(), public.host_str()) {
        (Some(th), Some(ph)) if th == ph && target.port_or_known_default() == public.port_or_known_default() => true,
        (Some(th), _) if loopback_hosts.contains(&th) && target.port_or_known_default() == public.port_or_known_default() => true,
        _ => false,
    }
}

/// Pull the proxy's own `__cpo` fingerprint out of a URL's query string,
/// if present, leaving every other parameter untouched.
fn extract_fingerprint(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == urlcodec::FINGERPRINT_PARAM)
        .map(|(_, v)| v.into_owned())
}

fn base_directory(target: &Url) -> Url {
    let mut base = target.clone();
    base.set_query(None);
    let path = base.path().to_string();
    let dir = match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "/",
    };
    base.set_path(dir);
    base
}

/// Resolve a target from the referer's own `__cpo` fingerprint, joined
/// against the inbound request's path and query.
fn resolve_from_referer(uri: &Uri, headers: &HeaderMap) -> Option<Url> {
    let referer = headers.get(axum::http::header::REFERER).and_then(|v| v.to_str().ok())?;
    let referer_url = Url::parse(referer).ok()?;
    let ref_fp = extract_fingerprint(referer_url.query())?;
    let referer_target = urlcodec::decode(&ref_fp).ok()?;
    base_directory(&referer_target).join(&request_path_and_query(uri)).ok()
}

/// Resolve a target from the remembered session base for `key`, joined
/// against the inbound request's path and query.
fn resolve_from_session_base(uri: &Uri, state: &AppState, key: &str) -> Option<Url> {
    let base = state.recall_base(key)?;
    base.join(&request_path_and_query(uri)).ok()
}

/// Resolve the logical target URL for an inbound request using the four
/// states in turn; `None` means "serve the landing page or 404".
///
/// A fingerprinted target that turns out to be a self-loop (the decoded
/// token points back at this proxy's own origin, e.g. a stale or forged
/// `__cpo` param) falls through to the referer base and then the
/// remembered session base rather than being returned as-is, so the
/// caller never has to fetch the proxy from itself.
fn resolve_target(uri: &Uri, headers: &HeaderMap, state: &AppState, key: &str) -> Result<Option<Url>, ProxyError> {
    if let Some(fp) = extract_fingerprint(uri.query()) {
        let target = urlcodec::decode(&fp).map_err(|_| ProxyError::MalformedToken)?;
        if !is_self_loop(&target, &state.public_origin) {
            return Ok(Some(target));
        }
        if let Some(resolved) = resolve_from_referer(uri, headers) {
            if !is_self_loop(&resolved, &state.public_origin) {
                return Ok(Some(resolved));
            }
        }
        if let Some(resolved) = resolve_from_session_base(uri, state, key) {
            if !is_self_loop(&resolved, &state.public_origin) {
                return Ok(Some(resolved));
            }
        }
        return Ok(None);
    }

    if let Some(resolved) = resolve_from_referer(uri, headers) {
        return Ok(Some(resolved));
    }

    if let Some(resolved) = resolve_from_session_base(uri, state, key) {
        return Ok(Some(resolved));
    }

    Ok(None)
}

fn request_path_and_query(uri: &Uri) -> String {
    match uri.query() {
        Some(q) => format!("{}?{q}", uri.path()),
        None => uri.path().to_string(),
    }
}

fn content_kind(headers: &HeaderMap) -> ContentKind {
    let ct = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if ct.contains("text/html") {
        ContentKind::Html
    } else if ct.contains("text/css") {
        ContentKind::Css
    } else if ct.contains("javascript") || ct.contains("ecmascript") {
        ContentKind::Js
    } else {
        ContentKind::Other
    }
}

enum ContentKind {
    Html,
    Css,
    Js,
    Other,
}

async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let key = client_key(Some(addr), &headers);
    let target = resolve_target(&uri, &headers, &state, &key)?;

    let Some(target) = target else {
        return Ok(if uri.path() == "/" { landing_page().into_response() } else { ProxyError::NotFound.into_response() });
    };

    state.remember_base(&key, base_directory(&target));

    let cookies = headers.get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok()).map(|s| s.to_string());
    let ctx = FetchContext { cookies, csrf_token: None, referer: Some(target.origin().ascii_serialization()) };
    let body = if body.is_empty() { None } else { Some(body) };

    let resp = fetch::fetch(&state.client, &state.csrf_cache, &target, method, &headers, body, &ctx).await?;

    let mut out_headers = resp.headers;
    let rewrite_ctx = RewriteContext { base_url: resp.final_url, public_origin: state.public_origin.clone() };
    let kind = content_kind(&out_headers);
    let rewritten_body = match kind {
        ContentKind::Html => {
            let text = String::from_utf8_lossy(&resp.body);
            let real_origin = rewrite_ctx.base_url.origin().ascii_serialization();
            let early = shim::early_script(&real_origin, &state.public_origin);
            let main = shim::main_shim_script_tag();
            Some(html::rewrite_html(&text, &rewrite_ctx, &early, &main))
        }
        ContentKind::Css => Some(css::rewrite_css(&String::from_utf8_lossy(&resp.body), &rewrite_ctx)),
        ContentKind::Js => Some(js::rewrite_js(&String::from_utf8_lossy(&resp.body), &rewrite_ctx)),
        ContentKind::Other => None,
    };

    crate::rewrite::headers::strip_restrictive_headers(&mut out_headers);
    crate::rewrite::headers::rewrite_set_cookie_headers(&mut out_headers, state.public_is_https);
    if rewritten_body.is_some() {
        crate::rewrite::headers::drop_length_and_encoding(&mut out_headers);
    }

    let mut builder = Response::builder().status(resp.status);
    for (name, value) in out_headers.iter() {
        builder = builder.header(name, value);
    }
    let final_body = match rewritten_body {
        Some(text) => axum::body::Body::from(text),
        None => axum::body::Body::from(resp.body),
    };
    builder.body(final_body).map_err(|e| ProxyError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_self_loop_on_same_host_and_port() {
        let target = Url::parse("https://proxy.test:8443/x").unwrap();
        assert!(is_self_loop(&target, "https://proxy.test:8443"));
    }

    #[test]
    fn allows_distinct_host() {
        let target = Url::parse("https://example.com/x").unwrap();
        assert!(!is_self_loop(&target, "https://proxy.test"));
    }

    #[test]
    fn base_directory_strips_filename() {
        let url = Url::parse("https://example.com/a/b/page.html?x=1").unwrap();
        assert_eq!(base_directory(&url).as_str(), "https://example.com/a/b/");
    }

    #[test]
    fn extract_fingerprint_finds_param_among_others() {
        assert_eq!(extract_fingerprint(Some("a=1&__cpo=xyz&b=2")), Some("xyz".to_string()));
        assert_eq!(extract_fingerprint(Some("a=1")), None);
    }

    #[test]
    fn self_loop_fingerprint_falls_back_to_session_base() {
        let state = AppState::new("https://proxy.test".to_string()).unwrap();
        state.remember_base("client-a", Url::parse("https://example.com/a/").unwrap());

        let fp = urlcodec::encode("https://proxy.test/loop");
        let uri: Uri = format!("/?__cpo={fp}&x=1").parse().unwrap();
        let headers = HeaderMap::new();

        let resolved = resolve_target(&uri, &headers, &state, "client-a").unwrap().unwrap();
        assert_eq!(resolved.as_str(), "https://example.com/a/?x=1");
    }

    #[test]
    fn self_loop_fingerprint_with_no_fallback_yields_none() {
        let state = AppState::new("https://proxy.test".to_string()).unwrap();

        let fp = urlcodec::encode("https://proxy.test/loop");
        let uri: Uri = format!("/?__cpo={fp}").parse().unwrap();
        let headers = HeaderMap::new();

        assert!(resolve_target(&uri, &headers, &state, "client-a").unwrap().is_none());
    }
}
