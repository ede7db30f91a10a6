//! The authoritative in-memory fleet slot table: client-to-slot assignment,
//! the cookie/URL two-token access scheme, and the stale-session reaper.
//!
//! One mutex guards the slot table and all of its secondary indexes
//! (`client_id -> slot_id`, `cookie_token -> slot_id`, `url_token -> ...`);
//! release clears every index in a single critical section so no stale
//! cross-reference can survive a release.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mirror::Mirror;
use rand::RngCore;
use serde_json::json;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

/// Upstream host/port for one fleet slot. The set of slots is fixed at start.
#[derive(Debug, Clone)]
pub struct SlotConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub session_timeout_secs: i64,
    pub ws_presence_timeout_secs: i64,
    pub assignment_grace_secs: i64,
    pub url_token_ttl_secs: i64,
    pub reaper_interval_secs: u64,
    pub url_token_gc_interval_secs: u64,
    pub heartbeat_mirror_sample: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 300,
            ws_presence_timeout_secs: 120,
            assignment_grace_secs: 60,
            url_token_ttl_secs: 300,
            reaper_interval_secs: 30,
            url_token_gc_interval_secs: 60,
            heartbeat_mirror_sample: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetError {
    AllSlotsBusy { in_use: u32, total: u32, retry_after_seconds: u32 },
    AccessDenied,
    NotFound,
}

impl std::fmt::Display for FleetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FleetError::AllSlotsBusy { .. } => write!(f, "all browser slots are busy"),
            FleetError::AccessDenied => write!(f, "access denied"),
            FleetError::NotFound => write!(f, "no matching session"),
        }
    }
}

impl std::error::Error for FleetError {}

#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub slot_id: u32,
    pub session_id: String,
    pub cookie_token: String,
    pub url_token: String,
    pub existing: bool,
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub slot_id: u32,
    pub session_age_secs: i64,
    pub url_token: String,
}

#[derive(Debug, Clone)]
pub struct ConsumedGrant {
    pub slot_id: u32,
    pub cookie_token: String,
}

#[derive(Debug, Clone)]
pub struct BrowserStatus {
    pub id: u32,
    pub available: bool,
}

#[derive(Debug, Clone)]
pub struct FleetStatus {
    pub total: u32,
    pub available: u32,
    pub in_use: u32,
    pub browsers: Vec<BrowserStatus>,
}

struct Session {
    client_id: String,
    session_id: String,
    assigned_at: i64,
    last_heartbeat_at: i64,
    heartbeat_count: u64,
    cookie_token: String,
    active_ws_count: u32,
    last_disconnect_at: i64,
}

struct Slot {
    id: u32,
    host: String,
    port: u16,
    session: Option<Session>,
}

struct UrlTokenEntry {
    slot_id: u32,
    cookie_token: String,
    minted_at: i64,
}

struct Inner {
    slots: Vec<Slot>,
    client_index: HashMap<String, u32>,
    cookie_index: HashMap<String, u32>,
    url_token_index: HashMap<String, UrlTokenEntry>,
}

/// The session & token store plus its background reaper.
pub struct Fleet {
    inner: Mutex<Inner>,
    mirror: Arc<Mirror>,
    config: FleetConfig,
    shutdown_tx: watch::Sender<bool>,
    reaper_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn random_token() -> String {
    let mut buf = [0u8; 32];
    rand::rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Derive a stable client identity from source address and user-agent when
/// the caller supplied none, so behind-CDN users still get single-session
/// semantics.
pub fn derive_client_id(remote_addr: &str, user_agent: &str) -> String {
    let ua_prefix: String = user_agent.chars().take(32).collect();
    format!("derived:{remote_addr}:{ua_prefix}")
}

impl Fleet {
    /// Build the fleet from its fixed slot configuration, restoring any
    /// slot whose mirrored heartbeat is still within the session timeout.
    pub fn new(slot_configs: Vec<SlotConfig>, mirror: Arc<Mirror>, config: FleetConfig) -> anyhow::Result<Arc<Self>> {
        let slots = slot_configs
            .into_iter()
            .enumerate()
            .map(|(idx, cfg)| Slot { id: (idx + 1) as u32, host: cfg.host, port: cfg.port, session: None })
            .collect();

        let mut inner = Inner { slots, client_index: HashMap::new(), cookie_index: HashMap::new(), url_token_index: HashMap::new() };
        restore_from_mirror(&mut inner, &mirror, config.session_timeout_secs)?;

        let (shutdown_tx, _rx) = watch::channel(false);
        let fleet = Arc::new(Self {
            inner: Mutex::new(inner),
            mirror,
            config,
            shutdown_tx,
            reaper_handle: AsyncMutex::new(None),
        });

        fleet.write_summary();

        let reaper_fleet = Arc::clone(&fleet);
        let handle = tokio::spawn(async move { reaper_fleet.run_reaper().await });
        // Set once, synchronously, before any other task can observe the lock empty.
        if let Ok(mut slot) = fleet.reaper_handle.try_lock() {
            *slot = Some(handle);
        }

        Ok(fleet)
    }

    async fn run_reaper(self: Arc<Self>) {
        let mut reaper_tick = time::interval(Duration::from_secs(self.config.reaper_interval_secs));
        let mut gc_tick = time::interval(Duration::from_secs(self.config.url_token_gc_interval_secs));
        let mut rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = reaper_tick.tick() => self.sweep_stale_sessions(),
                _ = gc_tick.tick() => self.gc_url_tokens(),
                changed = rx.changed() => {
                    if changed.is_ok() && *rx.borrow() { break; }
                }
            }
        }
    }

    fn sweep_stale_sessions(&self) {
        let now = now_unix();
        let mut to_release = Vec::new();
        {
            let inner = self.inner.lock().unwrap();
            for slot in &inner.slots {
                let Some(session) = &slot.session else { continue };
                let heartbeat_stale = now - session.last_heartbeat_at > self.config.session_timeout_secs;
                let ws_absent = session.active_ws_count == 0
                    && now - session.last_disconnect_at > self.config.ws_presence_timeout_secs
                    && now - session.assigned_at > self.config.assignment_grace_secs;
                if heartbeat_stale || ws_absent {
                    to_release.push(slot.id);
                }
            }
        }
        for slot_id in to_release {
            tracing::info!(slot_id, "reaper releasing stale session");
            self.release_by_slot(slot_id);
        }
    }

    fn gc_url_tokens(&self) {
        let now = now_unix();
        let mut inner = self.inner.lock().unwrap();
        let ttl = self.config.url_token_ttl_secs;
        inner.url_token_index.retain(|_, entry| now - entry.minted_at <= ttl);
    }

    /// Stop the reaper task. Awaits its completion.
    pub async fn shutdown(self: Arc<Self>) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.reaper_handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub fn request(&self, client_id: &str) -> Result<RequestOutcome, FleetError> {
        let now = now_unix();
        let mut inner = self.inner.lock().unwrap();

        if let Some(&slot_id) = inner.client_index.get(client_id) {
            let url_token = random_token();
            let cookie_token;
            {
                let slot = inner.slots.iter_mut().find(|s| s.id == slot_id).expect("indexed slot exists");
                let session = slot.session.as_mut().expect("indexed slot has a session");
                cookie_token = session.cookie_token.clone();
            }
            inner.url_token_index.insert(
                url_token.clone(),
                UrlTokenEntry { slot_id, cookie_token: cookie_token.clone(), minted_at: now },
            );
            let session_id = {
                let slot = inner.slots.iter().find(|s| s.id == slot_id).unwrap();
                slot.session.as_ref().unwrap().session_id.clone()
            };
            drop(inner);
            return Ok(RequestOutcome { slot_id, session_id, cookie_token, url_token, existing: true });
        }

        let free_slot = inner.slots.iter_mut().find(|s| s.session.is_none());
        let Some(slot) = free_slot else {
            let total = inner.slots.len() as u32;
            let in_use = inner.slots.iter().filter(|s| s.session.is_some()).count() as u32;
            return Err(FleetError::AllSlotsBusy { in_use, total, retry_after_seconds: 10 });
        };

        let slot_id = slot.id;
        let session_id = Uuid::new_v4().to_string();
        let cookie_token = random_token();
        let url_token = random_token();
        slot.session = Some(Session {
            client_id: client_id.to_string(),
            session_id: session_id.clone(),
            assigned_at: now,
            last_heartbeat_at: now,
            heartbeat_count: 0,
            cookie_token: cookie_token.clone(),
            active_ws_count: 0,
            last_disconnect_at: now,
        });
        inner.client_index.insert(client_id.to_string(), slot_id);
        inner.cookie_index.insert(cookie_token.clone(), slot_id);
        inner.url_token_index.insert(
            url_token.clone(),
            UrlTokenEntry { slot_id, cookie_token: cookie_token.clone(), minted_at: now },
        );
        drop(inner);
        self.mirror_slot_state(slot_id);
        self.write_summary();

        Ok(RequestOutcome { slot_id, session_id, cookie_token, url_token, existing: false })
    }

    /// Check whether `client_id` still holds a live session, minting a fresh
    /// one-shot `url_token` for it so the caller can obtain a new browse URL
    /// without having to release and re-request.
    pub fn check(&self, client_id: &str) -> Option<CheckOutcome> {
        let now = now_unix();
        let mut inner = self.inner.lock().unwrap();
        let slot_id = *inner.client_index.get(client_id)?;
        let (session_age_secs, cookie_token) = {
            let slot = inner.slots.iter().find(|s| s.id == slot_id)?;
            let session = slot.session.as_ref()?;
            (now - session.assigned_at, session.cookie_token.clone())
        };
        let url_token = random_token();
        inner.url_token_index.insert(url_token.clone(), UrlTokenEntry { slot_id, cookie_token, minted_at: now });
        Some(CheckOutcome { slot_id, session_age_secs, url_token })
    }

    pub fn release_by_client(&self, client_id: &str) {
        let slot_id = {
            let inner = self.inner.lock().unwrap();
            inner.client_index.get(client_id).copied()
        };
        if let Some(slot_id) = slot_id {
            self.release_by_slot(slot_id);
        }
    }

    pub fn release_by_slot(&self, slot_id: u32) {
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(slot) = inner.slots.iter_mut().find(|s| s.id == slot_id) else { return };
            let Some(session) = slot.session.take() else { return };
            inner.client_index.remove(&session.client_id);
            inner.cookie_index.remove(&session.cookie_token);
            inner.url_token_index.retain(|_, entry| entry.slot_id != slot_id);
        }
        self.mirror_tombstone(slot_id);
        self.write_summary();
    }

    pub fn heartbeat_by_slot(&self, slot_id: u32) -> Result<(), FleetError> {
        let sample = {
            let now = now_unix();
            let mut inner = self.inner.lock().unwrap();
            let slot = inner.slots.iter_mut().find(|s| s.id == slot_id).ok_or(FleetError::NotFound)?;
            let session = slot.session.as_mut().ok_or(FleetError::NotFound)?;
            session.last_heartbeat_at = now;
            session.heartbeat_count += 1;
            session.heartbeat_count % self.config.heartbeat_mirror_sample == 0
        };
        if sample {
            self.mirror_slot_state(slot_id);
        }
        Ok(())
    }

    pub fn heartbeat_by_session(&self, session_id: &str) -> Result<(), FleetError> {
        let slot_id = {
            let inner = self.inner.lock().unwrap();
            inner
                .slots
                .iter()
                .find(|s| s.session.as_ref().map(|sess| sess.session_id.as_str()) == Some(session_id))
                .map(|s| s.id)
                .ok_or(FleetError::NotFound)?
        };
        self.heartbeat_by_slot(slot_id)
    }

    pub fn access_by_cookie(&self, cookie_token: &str) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner.cookie_index.get(cookie_token).copied()
    }

    /// Atomically consume a one-shot `url_token`, returning the slot id and
    /// partner `cookie_token` to set. A second attempt with the same token
    /// fails with `AccessDenied`.
    pub fn consume_url_token(&self, token: &str) -> Result<ConsumedGrant, FleetError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.url_token_index.remove(token).ok_or(FleetError::AccessDenied)?;
        Ok(ConsumedGrant { slot_id: entry.slot_id, cookie_token: entry.cookie_token })
    }

    pub fn note_ws_open(&self, slot_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.id == slot_id) {
            if let Some(session) = slot.session.as_mut() {
                session.active_ws_count += 1;
            }
        }
    }

    pub fn note_ws_close(&self, slot_id: u32) {
        let now = now_unix();
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.id == slot_id) {
            if let Some(session) = slot.session.as_mut() {
                session.active_ws_count = session.active_ws_count.saturating_sub(1);
                if session.active_ws_count == 0 {
                    session.last_disconnect_at = now;
                }
            }
        }
    }

    pub fn slot_address(&self, slot_id: u32) -> Option<(String, u16)> {
        let inner = self.inner.lock().unwrap();
        inner.slots.iter().find(|s| s.id == slot_id).map(|s| (s.host.clone(), s.port))
    }

    pub fn status(&self) -> FleetStatus {
        let inner = self.inner.lock().unwrap();
        let total = inner.slots.len() as u32;
        let in_use = inner.slots.iter().filter(|s| s.session.is_some()).count() as u32;
        let browsers = inner
            .slots
            .iter()
            .map(|s| BrowserStatus { id: s.id, available: s.session.is_none() })
            .collect();
        FleetStatus { total, available: total - in_use, in_use, browsers }
    }

    fn mirror_slot_state(&self, slot_id: u32) {
        let payload = {
            let inner = self.inner.lock().unwrap();
            let Some(slot) = inner.slots.iter().find(|s| s.id == slot_id) else { return };
            match &slot.session {
                Some(session) => json!({
                    "inUse": true,
                    "clientId": session.client_id,
                    "sessionId": session.session_id,
                    "lastUsed": session.assigned_at,
                    "lastHeartbeat": session.last_heartbeat_at,
                }),
                None => json!({ "inUse": false }),
            }
        };
        if let Err(err) = self.mirror.set(&format!("fleet/state/{slot_id}"), &payload) {
            tracing::warn!(slot_id, error = %err, "state mirror write failed");
        }
    }

    fn mirror_tombstone(&self, slot_id: u32) {
        if let Err(err) = self.mirror.set(&format!("fleet/state/{slot_id}"), &json!({ "inUse": false })) {
            tracing::warn!(slot_id, error = %err, "state mirror tombstone failed");
        }
    }

    fn write_summary(&self) {
        let status = self.status();
        let browsers: Vec<_> = status
            .browsers
            .iter()
            .map(|b| json!({ "id": b.id, "available": b.available }))
            .collect();
        let payload = json!({
            "inUse": status.in_use,
            "available": status.available,
            "total": status.total,
            "updatedAt": now_unix(),
            "browsers": browsers,
        });
        if let Err(err) = self.mirror.set("fleet/summary", &payload) {
            tracing::warn!(error = %err, "state mirror summary write failed");
        }
    }
}

/// Restore slots whose mirrored heartbeat is still within the session
/// timeout window; mint a fresh `cookie_token` since the in-process reverse
/// map did not survive the restart. Stale slots are tombstoned back to
/// `{inUse:false}`.
fn restore_from_mirror(inner: &mut Inner, mirror: &Mirror, session_timeout_secs: i64) -> anyhow::Result<()> {
    let now = now_unix();
    for (key, value) in mirror.get_prefix("fleet/state/")? {
        let Some(slot_id_str) = key.strip_prefix("fleet/state/") else { continue };
        let Ok(slot_id) = slot_id_str.parse::<u32>() else { continue };
        let Some(slot) = inner.slots.iter_mut().find(|s| s.id == slot_id) else { continue };

        let in_use = value.get("inUse").and_then(|v| v.as_bool()).unwrap_or(false);
        if !in_use {
            continue;
        }
        let last_heartbeat = value.get("lastHeartbeat").and_then(|v| v.as_i64()).unwrap_or(0);
        if now - last_heartbeat > session_timeout_secs {
            mirror.set(&key, &json!({ "inUse": false }))?;
            continue;
        }

        let client_id = value.get("clientId").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let session_id = value
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cookie_token = random_token();

        slot.session = Some(Session {
            client_id: client_id.clone(),
            session_id,
            assigned_at: value.get("lastUsed").and_then(|v| v.as_i64()).unwrap_or(now),
            last_heartbeat_at: last_heartbeat,
            heartbeat_count: 0,
            cookie_token: cookie_token.clone(),
            active_ws_count: 0,
            last_disconnect_at: now,
        });
        inner.client_index.insert(client_id, slot_id);
        inner.cookie_index.insert(cookie_token, slot_id);
        tracing::info!(slot_id, "restored session from state mirror");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_mirror() -> Arc<Mirror> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("fleet-test-{}-{}", std::process::id(), n));
        let _ = fs::remove_dir_all(&dir);
        Arc::new(Mirror::new(&dir).unwrap())
    }

    fn two_slots() -> Vec<SlotConfig> {
        vec![
            SlotConfig { host: "127.0.0.1".into(), port: 9001 },
            SlotConfig { host: "127.0.0.1".into(), port: 9002 },
        ]
    }

    #[tokio::test]
    async fn request_assigns_lowest_free_slot() {
        let fleet = Fleet::new(two_slots(), test_mirror(), FleetConfig::default()).unwrap();
        let outcome = fleet.request("client-a").unwrap();
        assert_eq!(outcome.slot_id, 1);
        assert!(!outcome.existing);
        Arc::clone(&fleet).shutdown().await;
    }

    #[tokio::test]
    async fn repeated_request_same_client_reuses_slot_and_cookie() {
        let fleet = Fleet::new(two_slots(), test_mirror(), FleetConfig::default()).unwrap();
        let first = fleet.request("client-a").unwrap();
        let second = fleet.request("client-a").unwrap();
        assert_eq!(first.slot_id, second.slot_id);
        assert_eq!(first.cookie_token, second.cookie_token);
        assert_ne!(first.url_token, second.url_token);
        assert!(second.existing);
        Arc::clone(&fleet).shutdown().await;
    }

    #[tokio::test]
    async fn all_slots_busy_once_capacity_exhausted() {
        let fleet = Fleet::new(two_slots(), test_mirror(), FleetConfig::default()).unwrap();
        fleet.request("client-a").unwrap();
        fleet.request("client-b").unwrap();
        let err = fleet.request("client-c").unwrap_err();
        assert_eq!(err, FleetError::AllSlotsBusy { in_use: 2, total: 2, retry_after_seconds: 10 });
        Arc::clone(&fleet).shutdown().await;
    }

    #[tokio::test]
    async fn url_token_is_single_use() {
        let fleet = Fleet::new(two_slots(), test_mirror(), FleetConfig::default()).unwrap();
        let outcome = fleet.request("client-a").unwrap();
        let grant = fleet.consume_url_token(&outcome.url_token).unwrap();
        assert_eq!(grant.slot_id, outcome.slot_id);
        assert_eq!(fleet.consume_url_token(&outcome.url_token), Err(FleetError::AccessDenied));
        Arc::clone(&fleet).shutdown().await;
    }

    #[tokio::test]
    async fn check_mints_a_fresh_url_token_each_call() {
        let fleet = Fleet::new(two_slots(), test_mirror(), FleetConfig::default()).unwrap();
        let requested = fleet.request("client-a").unwrap();
        let first_check = fleet.check("client-a").unwrap();
        let second_check = fleet.check("client-a").unwrap();
        assert_eq!(first_check.slot_id, requested.slot_id);
        assert_ne!(first_check.url_token, requested.url_token);
        assert_ne!(first_check.url_token, second_check.url_token);
        let grant = fleet.consume_url_token(&second_check.url_token).unwrap();
        assert_eq!(grant.slot_id, requested.slot_id);
        Arc::clone(&fleet).shutdown().await;
    }

    #[tokio::test]
    async fn release_invalidates_cookie_access() {
        let fleet = Fleet::new(two_slots(), test_mirror(), FleetConfig::default()).unwrap();
        let outcome = fleet.request("client-a").unwrap();
        assert_eq!(fleet.access_by_cookie(&outcome.cookie_token), Some(outcome.slot_id));
        fleet.release_by_client("client-a");
        assert_eq!(fleet.access_by_cookie(&outcome.cookie_token), None);
        Arc::clone(&fleet).shutdown().await;
    }
}
