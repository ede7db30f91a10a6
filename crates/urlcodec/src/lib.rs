//! Encodes absolute URLs into the opaque, URL-safe fingerprint carried as the
//! `__cpo` query parameter, and decodes them back.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use url::Url;

/// Query parameter name the fingerprint travels under.
pub const FINGERPRINT_PARAM: &str = "__cpo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The token did not decode to a well-formed absolute http(s) URL.
    MalformedToken,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::MalformedToken => write!(f, "malformed proxy fingerprint"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode an absolute URL into a fingerprint safe for path, query, CSS `url(...)`,
/// and HTML attribute contexts: only `[A-Za-z0-9_-]`.
pub fn encode(abs_url: &str) -> String {
    URL_SAFE_NO_PAD.encode(abs_url.as_bytes())
}

/// Decode a fingerprint back to the absolute URL it represents.
///
/// Fingerprints may arrive URL-percent-encoded once (some browsers/CDNs
/// re-escape query values); if the raw token fails to decode as base64, a
/// single percent-decode pass is attempted before giving up.
pub fn decode(fingerprint: &str) -> Result<Url, DecodeError> {
    decode_once(fingerprint).or_else(|_| {
        let unescaped = percent_encoding::percent_decode_str(fingerprint)
            .decode_utf8()
            .map_err(|_| DecodeError::MalformedToken)?;
        decode_once(&unescaped)
    })
}

fn decode_once(fingerprint: &str) -> Result<Url, DecodeError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(fingerprint.as_bytes())
        .map_err(|_| DecodeError::MalformedToken)?;
    let raw = String::from_utf8(bytes).map_err(|_| DecodeError::MalformedToken)?;
    let url = Url::parse(&raw).map_err(|_| DecodeError::MalformedToken)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(DecodeError::MalformedToken),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple_url() {
        let url = "https://www.tiktok.com";
        let fp = encode(url);
        assert_eq!(decode(&fp).unwrap().as_str().trim_end_matches('/'), url);
    }

    #[test]
    fn roundtrip_url_with_path_and_query() {
        let url = "https://example.com/a/b?c=1&d=2";
        let fp = encode(url);
        assert_eq!(decode(&fp).unwrap().as_str(), url);
    }

    #[test]
    fn fingerprint_alphabet_is_url_safe() {
        let fp = encode("https://example.com/a b/?x=y+z");
        assert!(fp.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn rejects_non_http_scheme() {
        let fp = encode("javascript:alert(1)");
        assert_eq!(decode(&fp), Err(DecodeError::MalformedToken));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(decode("not-a-valid-token!!"), Err(DecodeError::MalformedToken));
    }

    #[test]
    fn recovers_from_one_percent_encoding_pass() {
        let fp = encode("https://example.com/x?y=1&z=2");
        let percent_encoded: String = percent_encoding::utf8_percent_encode(
            &fp,
            percent_encoding::NON_ALPHANUMERIC,
        )
        .collect();
        // base64url alphabet minus '-'/'_' still decodes fine without percent-decoding,
        // so only exercise the fallback when the encoding actually changed the token.
        if percent_encoded != fp {
            assert!(decode(&percent_encoded).is_ok());
        }
    }
}
