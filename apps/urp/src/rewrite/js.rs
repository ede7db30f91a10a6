//! JavaScript body rewriting (spec 4.C.4): only unambiguous string-literal
//! URL patterns are rewritten server-side. Anything built from
//! concatenation, template literals, or runtime computation is left to the
//! client shim, which intercepts the URL-consuming APIs at call time.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use super::{rewrite_reference, RewriteContext};

/// Hosts allowed through full-URL-literal rewriting; third-party embed and
/// challenge scripts that hardcode their own origin in a string literal.
const ALLOWED_LITERAL_HOSTS: &[&str] = &["client-api.arkoselabs.com", "www.google.com", "www.recaptcha.net", "hcaptcha.com"];

static IMPORT_SCRIPTS_RE: Lazy<Regex> =
    Lazy::new(|| RegexBuilder::new(r#"(?s)(importScripts\(\s*)(["'])([^"']+)\2"#).build().unwrap());

static NEW_WORKER_RE: Lazy<Regex> =
    Lazy::new(|| RegexBuilder::new(r#"(?s)(new\s+Worker\(\s*)(["'])([^"']+)\2"#).build().unwrap());

// Only string literals beginning with `/` are rewritten here; full absolute
// literals are handled separately by the allowlist pass below, and
// concatenated/templated URLs are left for the client shim.
static FETCH_RE: Lazy<Regex> = Lazy::new(|| RegexBuilder::new(r#"(?s)(fetch\(\s*)(["'])(/[^"']*)\2"#).build().unwrap());

static XHR_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| RegexBuilder::new(r#"(?s)(\.open\(\s*["'][A-Za-z]+["']\s*,\s*)(["'])(/[^"']*)\2"#).build().unwrap());

static RELATIVE_LITERAL_RE: Lazy<Regex> = Lazy::new(|| RegexBuilder::new(r#"(["'])(\./[^"']*|\.\./[^"']*)\1"#).build().unwrap());

static FULL_URL_LITERAL_RE: Lazy<Regex> = Lazy::new(|| RegexBuilder::new(r#"(["'])(https?://[^"']+)\1"#).build().unwrap());

fn rewrite_with(body: &str, re: &Regex, ctx: &RewriteContext) -> String {
    re.replace_all(body, |caps: &regex::Captures| {
        let prefix = &caps[1];
        let quote = &caps[2];
        let value = &caps[3];
        match rewrite_reference(value, ctx) {
            Some(rewritten) => format!("{prefix}{quote}{rewritten}{quote}"),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}

fn rewrite_relative_literals(body: &str, ctx: &RewriteContext) -> String {
    RELATIVE_LITERAL_RE
        .replace_all(body, |caps: &regex::Captures| {
            let quote = &caps[1];
            let value = &caps[2];
            match rewrite_reference(value, ctx) {
                Some(rewritten) => format!("{quote}{rewritten}{quote}"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn rewrite_allowlisted_full_urls(body: &str, ctx: &RewriteContext) -> String {
    FULL_URL_LITERAL_RE
        .replace_all(body, |caps: &regex::Captures| {
            let quote = &caps[1];
            let value = &caps[2];
            let allowed = url::Url::parse(value)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string()))
                .map(|host| ALLOWED_LITERAL_HOSTS.iter().any(|allowed| host == *allowed))
                .unwrap_or(false);
            if !allowed {
                return caps[0].to_string();
            }
            match rewrite_reference(value, ctx) {
                Some(rewritten) => format!("{quote}{rewritten}{quote}"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Rewrite a JavaScript source body in place, touching only the
/// unambiguous literal-URL call patterns named in spec 4.C.4.
pub fn rewrite_js(body: &str, ctx: &RewriteContext) -> String {
    let mut out = rewrite_with(body, &IMPORT_SCRIPTS_RE, ctx);
    out = rewrite_with(&out, &NEW_WORKER_RE, ctx);
    out = rewrite_with(&out, &FETCH_RE, ctx);
    out = rewrite_with(&out, &XHR_OPEN_RE, ctx);
    out = rewrite_relative_literals(&out, ctx);
    rewrite_allowlisted_full_urls(&out, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn ctx() -> RewriteContext {
        RewriteContext {
            base_url: Url::parse("https://example.com/js/app.js").unwrap(),
            public_origin: "https://proxy.test".into(),
        }
    }

    #[test]
    fn rewrites_import_scripts_and_new_worker() {
        let js = r#"importScripts("worker-helper.js"); new Worker("/worker.js");"#;
        let out = rewrite_js(js, &ctx());
        assert!(out.contains("__cpo="));
        assert_eq!(out.matches("__cpo=").count(), 2);
    }

    #[test]
    fn rewrites_fetch_and_xhr_string_literals() {
        let js = r#"fetch("/api/data"); xhr.open("GET", "/api/thing");"#;
        let out = rewrite_js(js, &ctx());
        assert_eq!(out.matches("__cpo=").count(), 2);
    }

    #[test]
    fn rewrites_relative_script_literal() {
        let js = r#"const p = "./chunk.js";"#;
        let out = rewrite_js(js, &ctx());
        assert!(out.contains("__cpo="));
    }

    #[test]
    fn leaves_unrelated_full_url_literal_untouched() {
        let js = r#"const u = "https://random-tracker.example/pixel.gif";"#;
        let out = rewrite_js(js, &ctx());
        assert_eq!(out, js);
    }

    #[test]
    fn rewrites_allowlisted_captcha_host_literal() {
        let js = r#"const u = "https://client-api.arkoselabs.com/v2/bootstrap";"#;
        let out = rewrite_js(js, &ctx());
        assert!(out.contains("__cpo="));
    }

    #[test]
    fn leaves_concatenated_urls_for_the_client_shim() {
        let js = r#"const u = base + "/path" + suffix;"#;
        let out = rewrite_js(js, &ctx());
        assert_eq!(out, js);
    }
}
