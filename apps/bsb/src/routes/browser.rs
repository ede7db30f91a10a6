//! The browser reverse proxy (spec 4.H): the access-control state machine
//! guarding a client's assigned container, an HTTP reverse-proxy leg, a
//! WebSocket tunnel for the container's own remote-control protocol, and an
//! optional audio side-channel tunnel.
//!
//! The WebSocket tunnel's shape (two independent forwarding tasks, one per
//! direction, translating between axum's and tungstenite's `Message` types)
//! is modeled on warpgate's `proxy_ws_inner`.

use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use crate::state::{browser_cookie_header, session_cookie, session_cookie_header, AppState};

/// Build the HTTP client used for the reverse-proxy leg of the browser
/// proxy. Containers are addressed by host/port on a private network, so
/// no TLS handling is needed here (unlike `apps/urp`'s public-internet
/// fetcher).
pub fn http_client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(std::time::Duration::from_secs(30)).build()?)
}

const ENHANCEMENT_SCRIPT_PATH: &str = "/__bsb/enhance.js";
const ENHANCEMENT_SCRIPT_JS: &str = include_str!("../../assets/enhance.js");

pub fn router() -> Router<AppState> {
    Router::new()
        .route(ENHANCEMENT_SCRIPT_PATH, any(serve_enhancement_script))
        .route("/browser/ws/{*path}", any(handle_ws))
        .route("/browser/audio", any(handle_audio_ws))
        .route("/browser/{*path}", any(handle_http))
        .route("/browser", any(handle_http_root))
}

async fn serve_enhancement_script() -> impl IntoResponse {
    ([(axum::http::header::CONTENT_TYPE, "application/javascript; charset=utf-8")], ENHANCEMENT_SCRIPT_JS)
}

/// Insert a `<script src=...>` tag for the enhancement script, preferring
/// just before `</body>`, then `</html>`, then after the last `</script>`,
/// then appending outright.
fn inject_enhancement_script(html: &str) -> String {
    let tag = format!(r#"<script src="{ENHANCEMENT_SCRIPT_PATH}"></script>"#);
    if let Some(idx) = html.to_ascii_lowercase().rfind("</body>") {
        return format!("{}{}{}", &html[..idx], tag, &html[idx..]);
    }
    if let Some(idx) = html.to_ascii_lowercase().rfind("</html>") {
        return format!("{}{}{}", &html[..idx], tag, &html[idx..]);
    }
    if let Some(idx) = html.to_ascii_lowercase().rfind("</script>") {
        let insert_at = idx + "</script>".len();
        return format!("{}{}{}", &html[..insert_at], tag, &html[insert_at..]);
    }
    format!("{html}{tag}")
}

enum BrokerError {
    AccessDenied,
    Unavailable,
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        match self {
            BrokerError::AccessDenied => (StatusCode::FORBIDDEN, "access denied").into_response(),
            BrokerError::Unavailable => (StatusCode::BAD_GATEWAY, Html(starting_up_page())).into_response(),
        }
    }
}

fn starting_up_page() -> &'static str {
    r#"<!doctype html><html><head><meta charset="utf-8"><title>Starting</title></head>
<body style="font-family:sans-serif;text-align:center;padding-top:4rem">
<h1>Your browser is starting up</h1>
<p>Retrying in <span id="n">5</span>s&hellip;</p>
<script>
let n = 5;
const el = document.getElementById('n');
setInterval(() => { n = n <= 0 ? 5 : n - 1; el.textContent = n; if (n === 0) location.reload(); }, 1000);
</script>
</body></html>"#
}

/// Resolve the slot a request is authorized for: a one-shot `url_token` in
/// the query string takes priority (and mints the `session`/`browser`
/// cookie pair on the response), falling back to the existing session
/// cookie.
fn resolve_slot(state: &AppState, headers: &HeaderMap, url_token: Option<&str>) -> Result<(u32, Vec<String>), BrokerError> {
    if let Some(token) = url_token {
        return match state.fleet.consume_url_token(token) {
            Ok(grant) => {
                let cookies = vec![session_cookie_header(&grant.cookie_token), browser_cookie_header(grant.slot_id)];
                Ok((grant.slot_id, cookies))
            }
            Err(_) => Err(BrokerError::AccessDenied),
        };
    }
    let cookie = session_cookie(headers).ok_or(BrokerError::AccessDenied)?;
    let slot_id = state.fleet.access_by_cookie(&cookie).ok_or(BrokerError::AccessDenied)?;
    Ok((slot_id, Vec::new()))
}

/// Split a `/browser/{*path}` capture into its leading `<slot_id>` segment
/// (if the first segment parses as one) and the remainder to forward
/// upstream. `None` when the path carries no numeric slot prefix at all
/// (the bare `/browser` route).
fn split_slot_prefix(path: &str) -> (Option<u32>, &str) {
    match path.split_once('/') {
        Some((first, rest)) => match first.parse::<u32>() {
            Ok(id) => (Some(id), rest),
            Err(_) => (None, path),
        },
        None => match path.parse::<u32>() {
            Ok(id) => (Some(id), ""),
            Err(_) => (None, path),
        },
    }
}

/// Rebuild a query string with the one-shot `token` parameter removed,
/// so it never reaches the upstream container.
fn strip_token_param(query: Option<&str>) -> String {
    let Some(query) = query else { return String::new() };
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .filter(|(k, _)| k != "token")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        return String::new();
    }
    url::form_urlencoded::Serializer::new(String::new()).extend_pairs(pairs).finish()
}

const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-security-policy",
    "x-frame-options",
    "cross-origin-opener-policy",
    "cross-origin-embedder-policy",
    "content-length",
];

fn strip_restrictive_headers(headers: &mut reqwest::header::HeaderMap) {
    for name in STRIPPED_RESPONSE_HEADERS {
        headers.remove(*name);
    }
}

fn extract_url_token(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes()).find(|(k, _)| k == "token").map(|(_, v)| v.into_owned())
}

async fn handle_http_root(
    state: State<AppState>,
    addr: ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_http_inner(state, addr, method, uri, headers, body, String::new()).await
}

async fn handle_http(
    state: State<AppState>,
    addr: ConnectInfo<SocketAddr>,
    Path(path): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_http_inner(state, addr, method, uri, headers, body, path).await
}

async fn handle_http_inner(
    State(state): State<AppState>,
    ConnectInfo(_addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    path: String,
) -> Response {
    let url_token = extract_url_token(uri.query());
    let (slot_id, set_cookies) = match resolve_slot(&state, &headers, url_token.as_deref()) {
        Ok(v) => v,
        Err(err) => return err.into_response(),
    };

    let (path_slot, remainder) = split_slot_prefix(&path);
    if path_slot.is_some_and(|id| id != slot_id) {
        return BrokerError::AccessDenied.into_response();
    }

    let Some((host, port)) = state.fleet.slot_address(slot_id) else {
        return BrokerError::Unavailable.into_response();
    };

    let query = strip_token_param(uri.query());
    let target = format!("http://{host}:{port}/{remainder}{}{query}", if query.is_empty() { "" } else { "?" });

    let mut req = state.http.request(method, target.as_str());
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST || name == axum::http::header::COOKIE {
            continue;
        }
        req = req.header(name, value);
    }
    if let Some(auth) = &state.container_auth {
        req = req.header(axum::http::header::AUTHORIZATION, auth);
    }
    req = req.body(body.to_vec());

    let upstream = match req.send().await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(slot_id, error = %err, "browser proxy upstream request failed");
            return BrokerError::Unavailable.into_response();
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    let is_html = response_headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"));
    let body_bytes = upstream.bytes().await.unwrap_or_default();

    strip_restrictive_headers(&mut response_headers);

    let final_body = if is_html {
        response_headers.remove(reqwest::header::CONTENT_LENGTH);
        response_headers.remove(reqwest::header::CONTENT_ENCODING);
        let rewritten = inject_enhancement_script(&String::from_utf8_lossy(&body_bytes));
        Body::from(rewritten)
    } else {
        Body::from(body_bytes)
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in response_headers.iter() {
        builder = builder.header(name, value);
    }
    for cookie in set_cookies {
        builder = builder.header(axum::http::header::SET_COOKIE, cookie);
    }
    builder.body(final_body).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_ws(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let url_token = extract_url_token(query.as_deref());
    let (slot_id, _set_cookies) = match resolve_slot(&state, &headers, url_token.as_deref()) {
        Ok(v) => v,
        Err(err) => return err.into_response(),
    };
    let Some((host, port)) = state.fleet.slot_address(slot_id) else {
        return BrokerError::Unavailable.into_response();
    };

    let upstream_url = format!("ws://{host}:{port}/{path}");
    let auth = state.container_auth.clone();
    ws.on_upgrade(move |socket| tunnel(socket, upstream_url, auth, state.fleet.clone(), slot_id))
}

async fn handle_audio_ws(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let url_token = extract_url_token(query.as_deref());
    let (slot_id, _set_cookies) = match resolve_slot(&state, &headers, url_token.as_deref()) {
        Ok(v) => v,
        Err(err) => return err.into_response(),
    };
    let Some((host, port)) = state.fleet.slot_address(slot_id) else {
        return BrokerError::Unavailable.into_response();
    };

    let upstream_url = format!("ws://{host}:{port}/audio");
    let auth = state.container_auth.clone();
    ws.on_upgrade(move |socket| tunnel(socket, upstream_url, auth, state.fleet.clone(), slot_id))
}

/// Build the upstream connect request, attaching the pre-shared basic-auth
/// header when the container variant in use requires one.
fn upstream_ws_request(upstream_url: &str, auth: Option<&str>) -> anyhow::Result<http::Request<()>> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut req = upstream_url.into_client_request()?;
    if let Some(auth) = auth {
        req.headers_mut().insert(axum::http::header::AUTHORIZATION, auth.parse()?);
    }
    Ok(req)
}

/// Bidirectional byte tunnel between the client's axum WebSocket and the
/// container's own WebSocket endpoint. Two independent forwarding tasks so
/// either direction can make progress without waiting on the other.
async fn tunnel(client_socket: WebSocket, upstream_url: String, auth: Option<String>, fleet: std::sync::Arc<fleet::Fleet>, slot_id: u32) {
    fleet.note_ws_open(slot_id);

    let connect_result = match upstream_ws_request(&upstream_url, auth.as_deref()) {
        Ok(req) => tokio_tungstenite::connect_async(req).await,
        Err(err) => {
            tracing::warn!(slot_id, error = %err, "failed to build container websocket request");
            fleet.note_ws_close(slot_id);
            return;
        }
    };
    let upstream = match connect_result {
        Ok((stream, _)) => stream,
        Err(err) => {
            tracing::warn!(slot_id, error = %err, "failed to connect to container websocket");
            fleet.note_ws_close(slot_id);
            return;
        }
    };

    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let translated = match msg {
                AxumMessage::Text(t) => TungsteniteMessage::Text(t.to_string().into()),
                AxumMessage::Binary(b) => TungsteniteMessage::Binary(b),
                AxumMessage::Ping(p) => TungsteniteMessage::Ping(p),
                AxumMessage::Pong(p) => TungsteniteMessage::Pong(p),
                AxumMessage::Close(_) => break,
            };
            if upstream_tx.send(translated).await.is_err() {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let translated = match msg {
                TungsteniteMessage::Text(t) => AxumMessage::Text(t.to_string().into()),
                TungsteniteMessage::Binary(b) => AxumMessage::Binary(b),
                TungsteniteMessage::Ping(p) => AxumMessage::Ping(p),
                TungsteniteMessage::Pong(p) => AxumMessage::Pong(p),
                TungsteniteMessage::Close(_) | TungsteniteMessage::Frame(_) => break,
            };
            if client_tx.send(translated).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }

    fleet.note_ws_close(slot_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_before_closing_body() {
        let html = "<html><body><p>hi</p></body></html>";
        let out = inject_enhancement_script(html);
        assert!(out.contains(&format!(r#"<script src="{ENHANCEMENT_SCRIPT_PATH}"></script></body>"#)));
    }

    #[test]
    fn injects_before_closing_html_when_no_body_tag() {
        let html = "<html><p>hi</p></html>";
        let out = inject_enhancement_script(html);
        assert!(out.contains(&format!(r#"<script src="{ENHANCEMENT_SCRIPT_PATH}"></script></html>"#)));
    }

    #[test]
    fn appends_when_no_anchor_tag_found() {
        let html = "<p>hi</p>";
        let out = inject_enhancement_script(html);
        assert!(out.ends_with(&format!(r#"<script src="{ENHANCEMENT_SCRIPT_PATH}"></script>"#)));
    }

    #[test]
    fn extract_url_token_finds_param() {
        assert_eq!(extract_url_token(Some("a=1&token=xyz")), Some("xyz".to_string()));
        assert_eq!(extract_url_token(Some("a=1")), None);
    }

    #[test]
    fn split_slot_prefix_strips_numeric_leading_segment() {
        assert_eq!(split_slot_prefix("3/foo/bar"), (Some(3), "foo/bar"));
        assert_eq!(split_slot_prefix("3"), (Some(3), ""));
    }

    #[test]
    fn split_slot_prefix_leaves_non_numeric_path_untouched() {
        assert_eq!(split_slot_prefix("foo/bar"), (None, "foo/bar"));
        assert_eq!(split_slot_prefix(""), (None, ""));
    }

    #[test]
    fn strip_token_param_removes_token_keeps_others() {
        assert_eq!(strip_token_param(Some("a=1&token=xyz&b=2")), "a=1&b=2");
        assert_eq!(strip_token_param(Some("token=xyz")), "");
        assert_eq!(strip_token_param(None), "");
    }
}
