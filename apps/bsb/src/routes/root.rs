// Root and health endpoints.
// - `/` responds with a simple HTML string (smoke-test endpoint)
// - `/healthz` is used by orchestrators/containers to check liveness
use axum::{response::Html, routing::get, Router};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(root)).route("/healthz", get(|| async { "ok" }))
}

async fn root() -> Html<&'static str> {
    Html("Browser session broker up")
}
