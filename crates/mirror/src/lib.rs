//! The state mirror: a best-effort, external-durability side-channel for
//! fleet state. The spec treats the real thing as an opaque `get(path)`/
//! `set(path, value)` collaborator; this is a redb-backed stand-in with the
//! same narrow shape, so restarts can restore in-memory fleet state.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde_json::Value;

const STATE_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("state");

/// Narrow KV mirror used by `fleet` to persist and restore slot state.
pub struct Mirror {
    base: PathBuf,
    db: Database,
}

impl Mirror {
    /// Open (or create) a mirror database rooted at `base_path`.
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base)
            .with_context(|| format!("creating base path {}", base.display()))?;

        let db_path = base.join("mirror.redb");
        let db = Database::create(&db_path)
            .with_context(|| format!("opening redb database {}", db_path.display()))?;

        {
            let write_txn = db.begin_write()?;
            let _ = write_txn.open_table(STATE_TABLE)?;
            write_txn.commit()?;
        }

        Ok(Self { base, db })
    }

    /// `set(path, value)` per the spec's state-mirror interface.
    pub fn set(&self, path: &str, value: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(STATE_TABLE)?;
            table.insert(path, &bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// `get(path)` per the spec's state-mirror interface.
    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(STATE_TABLE)?;
        match table.get(path)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value().as_slice())?)),
            None => Ok(None),
        }
    }

    /// List every entry whose key starts with `prefix`, used at boot to
    /// restore `fleet/state/<slot_id>` records without knowing slot ids
    /// ahead of time.
    pub fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(STATE_TABLE)?;
        let mut out = Vec::new();
        for pair in table.iter()? {
            let (k, v) = pair?;
            let key = k.value().to_string();
            if !key.starts_with(prefix) {
                continue;
            }
            let bytes = v.value();
            if let Ok(val) = serde_json::from_slice::<Value>(bytes.as_slice()) {
                out.push((key, val));
            }
        }
        Ok(out)
    }

    fn db_path(&self) -> PathBuf {
        self.base.join("mirror.redb")
    }

    /// Copy the mirror file as-is to `dest`; used by operational tooling,
    /// not by the fleet itself.
    pub fn snapshot(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        fs::create_dir_all(dest)?;
        let db_file = self.db_path();
        if db_file.exists() {
            let filename = db_file.file_name().unwrap();
            fs::copy(&db_file, dest.join(filename))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get_roundtrips() {
        let dir = tempdir();
        let mirror = Mirror::new(&dir).unwrap();
        mirror.set("fleet/state/1", &json!({"inUse": true, "clientId": "c1"})).unwrap();
        let got = mirror.get("fleet/state/1").unwrap().unwrap();
        assert_eq!(got["inUse"], true);
        assert_eq!(got["clientId"], "c1");
    }

    #[test]
    fn get_missing_is_none() {
        let dir = tempdir();
        let mirror = Mirror::new(&dir).unwrap();
        assert!(mirror.get("fleet/state/999").unwrap().is_none());
    }

    #[test]
    fn get_prefix_only_returns_matching_keys() {
        let dir = tempdir();
        let mirror = Mirror::new(&dir).unwrap();
        mirror.set("fleet/state/1", &json!({"inUse": true})).unwrap();
        mirror.set("fleet/state/2", &json!({"inUse": false})).unwrap();
        mirror.set("fleet/summary", &json!({"total": 2})).unwrap();
        let entries = mirror.get_prefix("fleet/state/").unwrap();
        assert_eq!(entries.len(), 2);
    }

    fn tempdir() -> PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("mirror-test-{}-{}", std::process::id(), n));
        let _ = fs::remove_dir_all(&dir);
        dir
    }
}
