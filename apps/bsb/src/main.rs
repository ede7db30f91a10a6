// Browser session broker entrypoint (Axum + Tokio).
//
// Wires up shared services (fleet/mirror/rate), builds the HTTP router from
// the route modules, attaches middleware layers (rate limit, CORS, trace,
// timeout, compression, body limit), and starts listening with graceful
// shutdown.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::error_handling::HandleErrorLayer;
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, Method};
use axum::{extract::DefaultBodyLimit, middleware};
use tokio::{net::TcpListener, signal};
use tower::timeout::TimeoutLayer;
use tower::{BoxError, ServiceBuilder};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use fleet::{Fleet, FleetConfig, SlotConfig};
use mirror::Mirror;
use rate::RateLimiter;

mod middleware;
mod routes;
mod state;

use crate::middleware as gw_mw;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let data_dir = std::env::var("BSB_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let mirror = Arc::new(Mirror::new(&data_dir)?);

    let slots = parse_slot_configs(&std::env::var("BSB_BROWSER_SLOTS").unwrap_or_default());
    let fleet = Fleet::new(slots, mirror, FleetConfig::default())?;
    let rate_limiter = Arc::new(RateLimiter::new(30, 2.0));
    let http = crate::routes::browser::http_client()?;
    let container_auth = container_auth_header();

    let state = AppState { fleet: Arc::clone(&fleet), rate: rate_limiter, http, container_auth };

    let cors_layer: CorsLayer = {
        let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
        let default = vec![
            axum::http::HeaderValue::from_static("http://127.0.0.1:5173"),
            axum::http::HeaderValue::from_static("http://localhost:5173"),
        ];
        let origins: Vec<axum::http::HeaderValue> = std::env::var("CORS_ALLOW_ORIGINS")
            .ok()
            .and_then(|s| {
                let list: Vec<_> = s.split(',').filter_map(|o| axum::http::HeaderValue::from_str(o.trim()).ok()).collect();
                if list.is_empty() {
                    None
                } else {
                    Some(list)
                }
            })
            .unwrap_or(default);
        let allow_hdrs = [ACCEPT, CONTENT_TYPE, AUTHORIZATION, HeaderName::from_static("x-csrf-token")];
        CorsLayer::new()
            .allow_methods(methods)
            .allow_headers(allow_hdrs)
            .allow_origin(AllowOrigin::list(origins))
            .allow_credentials(true)
            .expose_headers([CONTENT_TYPE])
    };

    let base = routes::all().with_state(state.clone());

    async fn handle_timeout_error(err: BoxError) -> axum::response::Response {
        use axum::response::IntoResponse;
        if err.is::<tower::timeout::error::Elapsed>() {
            (axum::http::StatusCode::REQUEST_TIMEOUT, "request timed out").into_response()
        } else {
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
    let timeout_stack = ServiceBuilder::new().layer(HandleErrorLayer::new(handle_timeout_error)).layer(TimeoutLayer::new(Duration::from_secs(35)));

    let body_limit: usize = std::env::var("BODY_LIMIT_BYTES").ok().and_then(|s| s.parse().ok()).unwrap_or(4 * 1024 * 1024);
    let app = base
        .layer(middleware::from_fn_with_state(state.clone(), gw_mw::rate_limit_middleware))
        .layer(cors_layer)
        .layer(TraceLayer::new_for_http())
        .layer(timeout_stack)
        .layer(CompressionLayer::new())
        .layer(DefaultBodyLimit::max(body_limit));

    let addr: SocketAddr = std::env::var("BSB_ADDR").unwrap_or_else(|_| "0.0.0.0:7100".to_string()).parse()?;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => {
            tracing::info!(%addr, "listening");
            l
        }
        Err(e) => {
            tracing::error!(%addr, error = %e, "failed to bind");
            return Err(e.into());
        }
    };

    let fleet_for_shutdown = Arc::clone(&fleet);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            fleet_for_shutdown.shutdown().await;
        })
        .await?;

    Ok(())
}

/// Build the `Authorization: Basic ...` header value from
/// `BSB_CONTAINER_BASIC_AUTH=<user>:<pass>`, for container variants that
/// require it. Absent the env var, the browser proxy forwards no auth.
fn container_auth_header() -> Option<String> {
    let raw = std::env::var("BSB_CONTAINER_BASIC_AUTH").ok()?;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    Some(format!("Basic {}", STANDARD.encode(raw.as_bytes())))
}

/// Parse `BSB_BROWSER_SLOTS` as `host:port,host:port,...`; falls back to a
/// single local slot for development.
fn parse_slot_configs(raw: &str) -> Vec<SlotConfig> {
    let parsed: Vec<SlotConfig> = raw
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|entry| {
            let (host, port) = entry.trim().rsplit_once(':')?;
            Some(SlotConfig { host: host.to_string(), port: port.parse().ok()? })
        })
        .collect();
    if parsed.is_empty() {
        vec![SlotConfig { host: "127.0.0.1".to_string(), port: 9222 }]
    } else {
        parsed
    }
}
