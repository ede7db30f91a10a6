use std::collections::HashMap;
use std::sync::Mutex;

use url::Url;

use crate::fetch::CsrfCache;

/// Shared state for the URL-rewriting proxy: an upstream HTTP client, the
/// CSRF token cache, this instance's own public origin (used to build
/// proxied URLs and to guard against self-loops), and the per-client
/// fallback base map the router uses for relative-URL requests that carry
/// no fingerprint of their own (spec 4.E state 3).
pub struct AppState {
    pub client: reqwest::Client,
    pub csrf_cache: CsrfCache,
    pub public_origin: String,
    pub public_is_https: bool,
    pub last_base: Mutex<HashMap<String, Url>>,
}

impl AppState {
    pub fn new(public_origin: String) -> anyhow::Result<Self> {
        let public_is_https = public_origin.starts_with("https://");
        Ok(Self {
            client: crate::fetch::build_client()?,
            csrf_cache: CsrfCache::new(),
            public_origin,
            public_is_https,
            last_base: Mutex::new(HashMap::new()),
        })
    }

    pub fn remember_base(&self, client_key: &str, base: Url) {
        self.last_base.lock().unwrap().insert(client_key.to_string(), base);
    }

    pub fn recall_base(&self, client_key: &str) -> Option<Url> {
        self.last_base.lock().unwrap().get(client_key).cloned()
    }
}
