use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

/// Error taxonomy surfaced to callers, matching the status codes and body
/// shapes the URP must produce.
#[derive(Debug)]
pub enum ProxyError {
    MalformedToken,
    UpstreamTimeout,
    UpstreamConnectFailure,
    UpstreamTlsFailure,
    NotFound,
    Internal(String),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::MalformedToken => write!(f, "malformed proxy fingerprint"),
            ProxyError::UpstreamTimeout => write!(f, "upstream request timed out"),
            ProxyError::UpstreamConnectFailure => write!(f, "could not connect to upstream"),
            ProxyError::UpstreamTlsFailure => write!(f, "upstream TLS handshake failed"),
            ProxyError::NotFound => write!(f, "not found"),
            ProxyError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::MalformedToken => {
                (StatusCode::BAD_REQUEST, "malformed proxy fingerprint").into_response()
            }
            ProxyError::UpstreamTimeout | ProxyError::UpstreamConnectFailure | ProxyError::UpstreamTlsFailure => {
                (StatusCode::BAD_GATEWAY, Html(starting_up_page())).into_response()
            }
            ProxyError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            ProxyError::Internal(msg) => {
                tracing::error!(error = %msg, "unhandled proxy error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

/// Minimal self-contained failure page with inline countdown retry; works
/// with CSP stripped since there is no external script dependency.
pub fn starting_up_page() -> String {
    r#"<!doctype html><html><head><meta charset="utf-8"><title>Unavailable</title></head>
<body style="font-family:sans-serif;text-align:center;padding-top:4rem">
<h1>Upstream unavailable</h1>
<p>Retrying in <span id="n">5</span>s&hellip; <button onclick="location.reload()">Retry now</button></p>
<script>
let n = 5;
const el = document.getElementById('n');
const id = setInterval(() => { n -= 1; el.textContent = n; if (n <= 0) { clearInterval(id); location.reload(); } }, 1000);
</script>
</body></html>"#
        .to_string()
}
