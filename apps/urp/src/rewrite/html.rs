//! HTML body rewriting (spec 4.C.2): attribute URL rewriting and shim
//! injection. Regex-based rather than a full parse, in the style of the
//! internex CSP rewriter this module takes its shape from — real browsers
//! tolerate the handful of malformed edge cases a regex misses, and a full
//! parser is more machinery than the rewrite rules need.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use super::{already_proxied, rewrite_reference, RewriteContext};

/// (tag alternation, attribute name) pairs that carry a single URL.
const HREF_ATTRS: &[(&str, &str)] = &[("a|link", "href"), ("form", "action")];
const SRC_ATTRS: &[(&str, &str)] = &[("script|img|iframe|video|audio|source|embed|track", "src")];

fn attr_regex(tag_alt: &str, attr: &str) -> Regex {
    let pattern = format!(r#"(?is)(<(?:{tag_alt})\b[^>]*?\s{attr}\s*=\s*)("[^"]*"|'[^']*')"#);
    RegexBuilder::new(&pattern).build().expect("valid attribute regex")
}

static SRCSET_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(?is)(<(?:img|source)\b[^>]*?\ssrcset\s*=\s*)("[^"]*"|'[^']*')"#)
        .build()
        .unwrap()
});

static STYLE_ATTR_RE: Lazy<Regex> = Lazy::new(|| RegexBuilder::new(r#"(?is)\sstyle\s*=\s*("[^"]*"|'[^']*')"#).build().unwrap());

static CSS_URL_RE: Lazy<Regex> = Lazy::new(|| RegexBuilder::new(r#"(?is)url\(\s*(['"]?)([^'")]+)\1\s*\)"#).build().unwrap());

static META_REFRESH_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(?is)(<meta\b[^>]*?http-equiv\s*=\s*["']refresh["'][^>]*?content\s*=\s*["'][^;]*;\s*url\s*=\s*)([^"'>]+)(["'])"#)
        .build()
        .unwrap()
});

static INTEGRITY_RE: Lazy<Regex> = Lazy::new(|| RegexBuilder::new(r#"(?is)\sintegrity\s*=\s*("[^"]*"|'[^']*')"#).build().unwrap());

static CROSSORIGIN_RE: Lazy<Regex> =
    Lazy::new(|| RegexBuilder::new(r#"(?is)\scrossorigin\s*=\s*("[^"]*"|'[^']*')"#).build().unwrap());

static HEAD_OPEN_RE: Lazy<Regex> = Lazy::new(|| RegexBuilder::new(r#"(?is)<head\b[^>]*>"#).build().unwrap());
static HEAD_CLOSE_RE: Lazy<Regex> = Lazy::new(|| RegexBuilder::new(r#"(?is)</head\s*>"#).build().unwrap());
static BODY_OPEN_RE: Lazy<Regex> = Lazy::new(|| RegexBuilder::new(r#"(?is)<body\b[^>]*>"#).build().unwrap());

/// Strip an attribute's quoted value entirely (`integrity=`), leaving the
/// surrounding tag intact.
fn strip_attr(html: &str, re: &Regex) -> String {
    re.replace_all(html, "").into_owned()
}

fn force_crossorigin_anonymous(html: &str) -> String {
    CROSSORIGIN_RE.replace_all(html, r#" crossorigin="anonymous""#).into_owned()
}

fn rewrite_simple_attrs(html: &str, pairs: &[(&str, &str)], ctx: &RewriteContext) -> String {
    let mut out = html.to_string();
    for (tag_alt, attr) in pairs {
        let re = attr_regex(tag_alt, attr);
        out = re
            .replace_all(&out, |caps: &regex::Captures| {
                let prefix = &caps[1];
                let quoted = &caps[2];
                let quote = &quoted[..1];
                let value = &quoted[1..quoted.len() - 1];
                match rewrite_reference(value, ctx) {
                    Some(rewritten) => format!("{prefix}{quote}{rewritten}{quote}"),
                    None => format!("{prefix}{quoted}"),
                }
            })
            .into_owned();
    }
    out
}

fn rewrite_srcset(html: &str, ctx: &RewriteContext) -> String {
    SRCSET_RE
        .replace_all(html, |caps: &regex::Captures| {
            let prefix = &caps[1];
            let quoted = &caps[2];
            let quote = &quoted[..1];
            let value = &quoted[1..quoted.len() - 1];
            let rewritten: Vec<String> = value
                .split(',')
                .map(|candidate| {
                    let candidate = candidate.trim();
                    let mut parts = candidate.splitn(2, char::is_whitespace);
                    let url_part = parts.next().unwrap_or_default();
                    let descriptor = parts.next().unwrap_or_default();
                    let new_url = rewrite_reference(url_part, ctx).unwrap_or_else(|| url_part.to_string());
                    if descriptor.is_empty() {
                        new_url
                    } else {
                        format!("{new_url} {descriptor}")
                    }
                })
                .collect();
            format!("{prefix}{quote}{}{quote}", rewritten.join(", "))
        })
        .into_owned()
}

fn rewrite_inline_style_urls(html: &str, ctx: &RewriteContext) -> String {
    STYLE_ATTR_RE
        .replace_all(html, |caps: &regex::Captures| {
            let quoted = &caps[1];
            let quote = &quoted[..1];
            let value = &quoted[1..quoted.len() - 1];
            let rewritten = rewrite_css_urls(value, ctx);
            format!(" style={quote}{rewritten}{quote}")
        })
        .into_owned()
}

/// Shared by inline `style=""` attributes and full CSS documents.
pub(super) fn rewrite_css_urls(css: &str, ctx: &RewriteContext) -> String {
    CSS_URL_RE
        .replace_all(css, |caps: &regex::Captures| {
            let quote = &caps[1];
            let value = &caps[2];
            if value.trim_start().to_ascii_lowercase().starts_with("data:") {
                return caps[0].to_string();
            }
            match rewrite_reference(value, ctx) {
                Some(rewritten) => format!("url({quote}{rewritten}{quote})"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn rewrite_meta_refresh(html: &str, ctx: &RewriteContext) -> String {
    META_REFRESH_RE
        .replace_all(html, |caps: &regex::Captures| {
            let prefix = &caps[1];
            let url = caps[2].trim();
            let suffix = &caps[3];
            match rewrite_reference(url, ctx) {
                Some(rewritten) => format!("{prefix}{rewritten}{suffix}"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Inject the client shim: an early script as the first child of `<head>`,
/// and the main shim bundle just before `</head>` (falling back to the
/// start of `<body>`, then to appending at the end of the document).
fn inject_shim(html: &str, early_script: &str, main_script: &str) -> String {
    let mut out = html.to_string();
    if already_proxied(&out) && out.contains(early_script) {
        return out;
    }
    if let Some(m) = HEAD_OPEN_RE.find(&out) {
        let at = m.end();
        out.insert_str(at, early_script);
    } else {
        out = format!("{early_script}{out}");
    }
    if let Some(m) = HEAD_CLOSE_RE.find(&out) {
        let at = m.start();
        out.insert_str(at, main_script);
    } else if let Some(m) = BODY_OPEN_RE.find(&out) {
        let at = m.end();
        out.insert_str(at, main_script);
    } else {
        out.push_str(main_script);
    }
    out
}

/// Rewrite an HTML document body in place, applying every rule in spec
/// 4.C.2 and 4.C.5 relevant to markup, then injecting the client shim.
pub fn rewrite_html(body: &str, ctx: &RewriteContext, early_shim: &str, main_shim: &str) -> String {
    let mut out = rewrite_simple_attrs(body, HREF_ATTRS, ctx);
    out = rewrite_simple_attrs(&out, SRC_ATTRS, ctx);
    out = rewrite_srcset(&out, ctx);
    out = rewrite_inline_style_urls(&out, ctx);
    out = rewrite_meta_refresh(&out, ctx);
    out = strip_attr(&out, &INTEGRITY_RE);
    out = force_crossorigin_anonymous(&out);
    inject_shim(&out, early_shim, main_shim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn ctx() -> RewriteContext {
        RewriteContext {
            base_url: Url::parse("https://example.com/a/page.html").unwrap(),
            public_origin: "https://proxy.test".into(),
        }
    }

    #[test]
    fn rewrites_anchor_href() {
        let html = r#"<a href="/foryou">link</a>"#;
        let out = rewrite_simple_attrs(html, HREF_ATTRS, &ctx());
        assert!(out.contains("https://proxy.test/foryou?__cpo="));
    }

    #[test]
    fn rewrites_script_src_and_form_action() {
        let html = r#"<script src="app.js"></script><form action="/submit"></form>"#;
        let mut out = rewrite_simple_attrs(html, SRC_ATTRS, &ctx());
        out = rewrite_simple_attrs(&out, HREF_ATTRS, &ctx());
        assert!(out.contains("src=\"https://proxy.test/a/app.js?__cpo="));
        assert!(out.contains("action=\"https://proxy.test/submit?__cpo="));
    }

    #[test]
    fn leaves_javascript_href_untouched() {
        let html = r#"<a href="javascript:void(0)">x</a>"#;
        let out = rewrite_simple_attrs(html, HREF_ATTRS, &ctx());
        assert_eq!(out, html);
    }

    #[test]
    fn rewrites_srcset_candidates_preserving_descriptors() {
        let html = r#"<img srcset="/a.png 1x, /b.png 2x">"#;
        let out = rewrite_srcset(html, &ctx());
        assert!(out.contains("1x"));
        assert!(out.contains("2x"));
        assert!(out.contains("__cpo="));
    }

    #[test]
    fn rewrites_inline_style_url_but_skips_data_uri() {
        let html = r#"<div style="background:url(/bg.png);color:red"></div>"#;
        let out = rewrite_inline_style_urls(html, &ctx());
        assert!(out.contains("__cpo="));

        let data_html = r#"<div style="background:url(data:image/png;base64,AA==)"></div>"#;
        let data_out = rewrite_inline_style_urls(data_html, &ctx());
        assert_eq!(data_out, data_html);
    }

    #[test]
    fn rewrites_meta_refresh_target() {
        let html = r#"<meta http-equiv="refresh" content="3; url=/next">"#;
        let out = rewrite_meta_refresh(html, &ctx());
        assert!(out.contains("__cpo="));
    }

    #[test]
    fn strips_integrity_and_downgrades_crossorigin() {
        let html = r#"<script src="a.js" integrity="sha384-xyz" crossorigin="use-credentials"></script>"#;
        let out = strip_attr(html, &INTEGRITY_RE);
        let out = force_crossorigin_anonymous(&out);
        assert!(!out.contains("integrity"));
        assert!(out.contains(r#"crossorigin="anonymous""#));
    }

    #[test]
    fn injects_shim_into_head_and_before_close() {
        let html = "<html><head><title>t</title></head><body></body></html>";
        let out = inject_shim(html, "<script>EARLY</script>", "<script>MAIN</script>");
        let head_pos = out.find("<head>").unwrap();
        let early_pos = out.find("EARLY").unwrap();
        let title_pos = out.find("<title>").unwrap();
        assert!(head_pos < early_pos && early_pos < title_pos);
        let main_pos = out.find("MAIN").unwrap();
        let head_close_pos = out.find("</head>").unwrap();
        assert!(main_pos < head_close_pos);
    }

    #[test]
    fn injects_shim_into_body_when_no_head() {
        let html = "<html><body><p>hi</p></body></html>";
        let out = inject_shim(html, "<script>EARLY</script>", "<script>MAIN</script>");
        assert!(out.contains("EARLY"));
        let body_open = out.find("<body>").unwrap() + "<body>".len();
        let main_pos = out.find("MAIN").unwrap();
        assert_eq!(body_open, main_pos);
    }

    #[test]
    fn full_pipeline_is_idempotent_on_already_proxied_refs() {
        let html = r#"<a href="https://proxy.test/x?__cpo=abc">x</a>"#;
        let out = rewrite_html(html, &ctx(), "", "");
        assert_eq!(out, html);
    }
}
