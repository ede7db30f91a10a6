//! Admin & heartbeat API (spec 4.I): the JSON control plane clients use to
//! acquire, check, renew, and release a browser slot. Distinct from the
//! browser reverse proxy itself (`routes::browser`), which clients use once
//! they hold a grant.
//!
//! Field names follow the external contract's camelCase JSON shape rather
//! than the teacher's snake-case internal structs, since these requests and
//! responses are consumed by the browser-streaming client directly.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use fleet::FleetError;
use serde::{Deserialize, Serialize};

use crate::state::{browser_cookie_header, session_cookie_header, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/request-browser", post(request_browser))
        .route("/api/check-session", get(check_session))
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/release", post(release))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    total: u32,
    available: u32,
    in_use: u32,
    browsers: Vec<BrowserEntry>,
}

#[derive(Serialize)]
struct BrowserEntry {
    id: u32,
    available: bool,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let s = state.fleet.status();
    Json(StatusResponse {
        total: s.total,
        available: s.available,
        in_use: s.in_use,
        browsers: s.browsers.into_iter().map(|b| BrowserEntry { id: b.id, available: b.available }).collect(),
    })
}

fn resolve_client_id(explicit: Option<String>, headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(id) = explicit.filter(|s| !s.is_empty()) {
        return id;
    }
    let ua = headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok()).unwrap_or_default();
    fleet::derive_client_id(&addr.ip().to_string(), ua)
}

/// `<scheme>://<host>/browser/<slot_id>/?token=<url_token>`, honouring
/// `X-Forwarded-Proto`/`X-Forwarded-Host` ahead of `Host`.
fn browser_url(headers: &HeaderMap, slot_id: u32, url_token: &str) -> String {
    let scheme = headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()).unwrap_or("http");
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(axum::http::header::HOST))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}/browser/{slot_id}/?token={url_token}")
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RequestBrowserBody {
    client_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestBrowserResponse {
    success: bool,
    session_id: String,
    browser_url: String,
    browser_id: u32,
    existing: bool,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestBrowserBusy {
    success: bool,
    error: String,
    retry_after_seconds: u64,
}

async fn request_browser(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<axum::Json<RequestBrowserBody>>,
) -> Response {
    let client_id = resolve_client_id(body.and_then(|b| b.0.client_id), &headers, &addr);

    match state.fleet.request(&client_id) {
        Ok(outcome) => {
            let mut cookie_headers = HeaderMap::new();
            for cookie in [session_cookie_header(&outcome.cookie_token), browser_cookie_header(outcome.slot_id)] {
                if let Ok(value) = cookie.parse() {
                    cookie_headers.append(axum::http::header::SET_COOKIE, value);
                }
            }
            let message = if outcome.existing { "existing session".to_string() } else { "browser assigned".to_string() };
            let body = Json(RequestBrowserResponse {
                success: true,
                session_id: outcome.session_id,
                browser_url: browser_url(&headers, outcome.slot_id, &outcome.url_token),
                browser_id: outcome.slot_id,
                existing: outcome.existing,
                message,
            });
            (cookie_headers, body).into_response()
        }
        Err(FleetError::AllSlotsBusy { retry_after_seconds, .. }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("retry-after".to_string(), retry_after_seconds.to_string())],
            Json(RequestBrowserBusy { success: false, error: "all_browsers_in_use".to_string(), retry_after_seconds }),
        )
            .into_response(),
        Err(err) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(RequestBrowserBusy { success: false, error: err.to_string(), retry_after_seconds: 0 }))
                .into_response()
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckSessionQuery {
    client_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckSessionResponse {
    has_session: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    browser_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_age: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    browser_url: Option<String>,
}

async fn check_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(q): Query<CheckSessionQuery>,
) -> Json<CheckSessionResponse> {
    let client_id = resolve_client_id(q.client_id, &headers, &addr);
    match state.fleet.check(&client_id) {
        Some(outcome) => Json(CheckSessionResponse {
            has_session: true,
            browser_id: Some(outcome.slot_id),
            session_age: Some(outcome.session_age_secs),
            browser_url: Some(browser_url(&headers, outcome.slot_id, &outcome.url_token)),
        }),
        None => Json(CheckSessionResponse { has_session: false, browser_id: None, session_age: None, browser_url: None }),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct HeartbeatBody {
    browser_id: Option<u32>,
    session_id: Option<String>,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

async fn heartbeat(State(state): State<AppState>, body: Option<axum::Json<HeartbeatBody>>) -> Response {
    let body = body.map(|b| b.0).unwrap_or_default();
    let result = match (body.browser_id, body.session_id) {
        (Some(slot_id), _) => state.fleet.heartbeat_by_slot(slot_id),
        (None, Some(session_id)) => state.fleet.heartbeat_by_session(&session_id),
        (None, None) => Err(FleetError::NotFound),
    };
    match result {
        Ok(()) => Json(SuccessResponse { success: true }).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Json(SuccessResponse { success: false })).into_response(),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ReleaseBody {
    client_id: Option<String>,
    browser_id: Option<u32>,
}

async fn release(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<axum::Json<ReleaseBody>>,
) -> Json<SuccessResponse> {
    let body = body.map(|b| b.0).unwrap_or_default();
    if let Some(slot_id) = body.browser_id {
        state.fleet.release_by_slot(slot_id);
    } else {
        let client_id = resolve_client_id(body.client_id, &headers, &addr);
        state.fleet.release_by_client(&client_id);
    }
    Json(SuccessResponse { success: true })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_browser_body_accepts_camel_case() {
        let body: RequestBrowserBody = serde_json::from_str(r#"{"clientId":"c1"}"#).unwrap();
        assert_eq!(body.client_id.as_deref(), Some("c1"));
    }

    #[test]
    fn heartbeat_body_accepts_camel_case() {
        let body: HeartbeatBody = serde_json::from_str(r#"{"browserId":3,"sessionId":"s1"}"#).unwrap();
        assert_eq!(body.browser_id, Some(3));
        assert_eq!(body.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn check_session_response_omits_absent_fields() {
        let resp = CheckSessionResponse { has_session: false, browser_id: None, session_age: None, browser_url: None };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"hasSession":false}"#);
    }
}
