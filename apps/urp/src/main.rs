mod error;
mod fetch;
mod middleware;
mod rewrite;
mod router;
mod shim;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::BoxError;
use rate::RateLimiter;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::middleware::{rate_limit_middleware, RateLimitState};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let public_origin = std::env::var("URP_PUBLIC_ORIGIN").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let bind_addr: SocketAddr = std::env::var("URP_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()).parse()?;

    let app_state = Arc::new(AppState::new(public_origin)?);
    let rate_state = Arc::new(RateLimitState { limiter: RateLimiter::new(60, 1.0) });

    let cors = build_cors_layer();

    let app = router::router(app_state)
        .layer(axum::middleware::from_fn_with_state(rate_state, rate_limit_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .timeout(Duration::from_secs(35)),
        )
        .layer(CompressionLayer::new());

    tracing::info!(%bind_addr, "starting url-rewriting proxy");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn handle_timeout_error(err: BoxError) -> (StatusCode, String) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, "upstream request timed out".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("unhandled error: {err}"))
    }
}

fn build_cors_layer() -> CorsLayer {
    let allowed = std::env::var("URP_CORS_ALLOW_ORIGINS").unwrap_or_default();
    let origins: Vec<_> = allowed
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    let origin = if origins.is_empty() { AllowOrigin::any() } else { AllowOrigin::list(origins) };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
        .expose_headers(rewrite::headers::exposed_header_names())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
