//! The client shim (component D): a small inline bootstrap injected as the
//! first child of `<head>`, and a larger external bundle injected just
//! before `</head>`. Together they patch the handful of browser APIs that
//! leak the real origin or bypass the server-side rewrite.

/// Served at this path by the router; browsers cache it like any other
/// static script, so it does not need per-page templating.
pub const MAIN_SHIM_PATH: &str = "/__cpo/shim.js";

static MAIN_SHIM_JS: &str = include_str!("../assets/shim.js");

pub fn main_shim_js() -> &'static str {
    MAIN_SHIM_JS
}

pub fn main_shim_script_tag() -> String {
    format!(r#"<script src="{MAIN_SHIM_PATH}"></script>"#)
}

/// The inline bootstrap: the only thing that must run before any page
/// script, since it establishes the globals the external bundle and every
/// patched API read from. Templated per-response with the real and proxy
/// origins, so it carries no request-specific logic itself.
pub fn early_script(real_origin: &str, proxy_origin: &str) -> String {
    let real_origin_js = serde_json::to_string(real_origin).unwrap_or_else(|_| "\"\"".to_string());
    let proxy_origin_js = serde_json::to_string(proxy_origin).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"<script>window.__cpoRealOrigin={real_origin_js};window.__cpoProxyOrigin={proxy_origin_js};</script>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_script_embeds_both_origins_as_json_strings() {
        let html = early_script("https://target.example", "https://proxy.test");
        assert!(html.contains("\"https://target.example\""));
        assert!(html.contains("\"https://proxy.test\""));
    }

    #[test]
    fn main_shim_script_tag_points_at_static_path() {
        assert_eq!(main_shim_script_tag(), r#"<script src="/__cpo/shim.js"></script>"#);
    }

    #[test]
    fn main_shim_bundle_is_nonempty() {
        assert!(!main_shim_js().trim().is_empty());
    }
}
