//! Stylesheet rewriting (spec 4.C.3): `url(...)` references and `@import`.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use super::html::rewrite_css_urls;
use super::{rewrite_reference, RewriteContext};

static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| RegexBuilder::new(r#"(?is)(@import\s+)(["'])([^"']+)\2"#).build().unwrap());

fn rewrite_imports(css: &str, ctx: &RewriteContext) -> String {
    IMPORT_RE
        .replace_all(css, |caps: &regex::Captures| {
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

/// Rewrite a full CSS document body: `url()` references first, then
/// `@import` statements that use the quoted form rather than `url()`.
pub fn rewrite_css(body: &str, ctx: &RewriteContext) -> String {
    let out = rewrite_css_urls(body, ctx);
    rewrite_imports(&out, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn ctx() -> RewriteContext {
        RewriteContext {
            base_url: Url::parse("https://example.com/css/site.css").unwrap(),
            public_origin: "https://proxy.test".into(),
        }
    }

    #[test]
    fn rewrites_url_function_reference() {
        let css = "body { background: url(/bg.png); }";
        let out = rewrite_css(css, &ctx());
        assert!(out.contains("https://proxy.test/bg.png?__cpo="));
    }

    #[test]
    fn skips_data_uri_in_url_function() {
        let css = "body { background: url(data:image/gif;base64,AA==); }";
        let out = rewrite_css(css, &ctx());
        assert_eq!(out, css);
    }

    #[test]
    fn rewrites_quoted_import() {
        let css = r#"@import "reset.css";"#;
        let out = rewrite_css(css, &ctx());
        assert!(out.contains("__cpo="));
    }
}
