//! The content rewriter (component C): HTML, CSS, and JavaScript body
//! transforms that route every embedded URL back through the proxy.

pub mod css;
pub mod headers;
pub mod html;
pub mod js;

use url::Url;

/// Context shared by every sub-rewriter: the document's own URL and the
/// proxy's public-facing origin.
#[derive(Clone)]
pub struct RewriteContext {
    pub base_url: Url,
    pub public_origin: String,
}

/// The shared URL absolutisation rule (spec 4.C.1). Returns `None` when the
/// reference should be left untouched (`data:`, `blob:`, `javascript:`, `#`).
pub fn absolutize(reference: &str, base_url: &Url) -> Option<Url> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("data:") || lower.starts_with("blob:") || lower.starts_with("javascript:") || trimmed.starts_with('#') {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        let candidate = format!("{}:{}", base_url.scheme(), format!("//{rest}"));
        return Url::parse(&candidate).ok();
    }
    if trimmed.starts_with('/') {
        return base_url.join(trimmed).ok();
    }
    if Url::parse(trimmed).is_ok() {
        return Url::parse(trimmed).ok();
    }
    base_url.join(trimmed).ok()
}

/// Build the rewritten, proxy-routed form of an absolute URL.
pub fn proxy_url(public_origin: &str, abs: &Url) -> String {
    let fingerprint = urlcodec::encode(abs.as_str());
    let path = abs.path();
    let query = abs.query();
    let mut out = format!("{public_origin}{path}");
    match query {
        Some(q) if !q.is_empty() => {
            out.push('?');
            out.push_str(q);
            out.push('&');
        }
        _ => out.push('?'),
    }
    out.push_str(urlcodec::FINGERPRINT_PARAM);
    out.push('=');
    out.push_str(&fingerprint);
    out
}

/// Resolve and rewrite a reference in one step; returns `None` (leave
/// as-is) for references `absolutize` skips or fails to resolve.
pub fn rewrite_reference(reference: &str, ctx: &RewriteContext) -> Option<String> {
    if already_proxied(reference) {
        return None;
    }
    let abs = absolutize(reference, &ctx.base_url)?;
    Some(proxy_url(&ctx.public_origin, &abs))
}

/// The idempotence guard (spec 9): every rewriter must apply this check
/// uniformly so an already-proxied reference is never re-proxied.
pub fn already_proxied(reference: &str) -> bool {
    reference.contains(urlcodec::FINGERPRINT_PARAM)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/a/b/page.html?x=1").unwrap()
    }

    #[test]
    fn leaves_data_and_blob_and_js_and_hash_alone() {
        for u in ["data:image/png;base64,AA", "blob:https://x/y", "javascript:void(0)", "#section"] {
            assert_eq!(absolutize(u, &base()), None, "{u}");
        }
    }

    #[test]
    fn protocol_relative_inherits_scheme() {
        let abs = absolutize("//cdn.example.com/a.js", &base()).unwrap();
        assert_eq!(abs.as_str(), "https://cdn.example.com/a.js");
    }

    #[test]
    fn root_relative_uses_origin() {
        let abs = absolutize("/foryou", &base()).unwrap();
        assert_eq!(abs.as_str(), "https://example.com/foryou");
    }

    #[test]
    fn relative_resolves_against_directory() {
        let abs = absolutize("other.html", &base()).unwrap();
        assert_eq!(abs.as_str(), "https://example.com/a/b/other.html");
    }

    #[test]
    fn already_absolute_is_used_as_is() {
        let abs = absolutize("https://other.test/z", &base()).unwrap();
        assert_eq!(abs.as_str(), "https://other.test/z");
    }

    #[test]
    fn proxy_url_preserves_path_and_query() {
        let abs = Url::parse("https://example.com/foryou?x=1").unwrap();
        let out = proxy_url("https://proxy.test", &abs);
        assert!(out.starts_with("https://proxy.test/foryou?x=1&__cpo="));
    }

    #[test]
    fn rewrite_reference_is_idempotent() {
        let ctx = RewriteContext { base_url: base(), public_origin: "https://proxy.test".into() };
        let already = "https://proxy.test/x?__cpo=abc";
        assert_eq!(rewrite_reference(already, &ctx), None);
    }
}
