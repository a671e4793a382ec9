//! Durable key/value storage using SQLite.
//!
//! Every higher layer persists through this map: item records under
//! `item/<id>`, registry slots under `slot/<namespace>/<key>`, allocation
//! high-water marks under `next_id/<kind>`. Values are JSON documents and
//! always pass through serialization on the way in and out, so callers get
//! deep-copy semantics — a value read back never aliases the value written.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;

/// Persists JSON values keyed by path-like strings.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (or creates) the SQLite database and ensures the table exists.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open store at {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_table()?;
        Ok(store)
    }

    fn create_table(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .context("Failed to create kv table")?;
        Ok(())
    }

    /// Writes a value, replacing any existing entry for the key.
    pub fn put(&self, key: &str, value: &Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value.to_string()],
        )
        .with_context(|| format!("Failed to write key {}", key))?;
        Ok(())
    }

    /// Reads a value. Returns `None` when the key is absent.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT value FROM kv WHERE key = ?1")
            .context("Failed to prepare get query")?;
        let mut rows = stmt
            .query(params![key])
            .with_context(|| format!("Failed to read key {}", key))?;
        match rows.next().context("Failed to step get query")? {
            Some(row) => {
                let text: String = row.get(0)?;
                let value = serde_json::from_str(&text)
                    .with_context(|| format!("Corrupt value under key {}", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Removes a key. Returns Ok(()) whether or not the row exists.
    pub fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .with_context(|| format!("Failed to remove key {}", key))?;
        Ok(())
    }

    /// Returns every (key, value) pair whose key starts with the prefix,
    /// ordered by key.
    pub fn load_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv ORDER BY key ASC")
            .context("Failed to prepare prefix query")?;
        let rows = stmt
            .query_map([], |row| {
                let key: String = row.get(0)?;
                let value: String = row.get(1)?;
                Ok((key, value))
            })
            .context("Failed to query keys")?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, text) = row.context("Failed to read kv row")?;
            if !key.starts_with(prefix) {
                continue;
            }
            let value = serde_json::from_str(&text)
                .with_context(|| format!("Corrupt value under key {}", key))?;
            entries.push((key, value));
        }
        Ok(entries)
    }

    /// Serializes a record and writes it under the key.
    pub fn put_record<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        let value = serde_json::to_value(record)
            .with_context(|| format!("Failed to serialize record for key {}", key))?;
        self.put(key, &value)
    }

    /// Reads and deserializes a record. Returns `None` when the key is absent.
    pub fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(value) => {
                let record = serde_json::from_value(value)
                    .with_context(|| format!("Corrupt record under key {}", key))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn in_memory_store() -> Store {
        Store::open(":memory:").expect("in-memory store failed")
    }

    #[test]
    fn test_put_get_round_trip() {
        let store = in_memory_store();
        store.put("item/1", &json!({"name": "lamp"})).unwrap();

        let loaded = store.get("item/1").expect("get failed");
        assert_eq!(loaded, Some(json!({"name": "lamp"})));
    }

    #[test]
    fn test_get_missing_key() {
        let store = in_memory_store();
        assert_eq!(store.get("item/99").unwrap(), None);
    }

    #[test]
    fn test_put_replaces_existing() {
        let store = in_memory_store();
        store.put("item/1", &json!({"name": "lamp"})).unwrap();
        store.put("item/1", &json!({"name": "fan"})).unwrap();

        let loaded = store.get("item/1").unwrap();
        assert_eq!(loaded, Some(json!({"name": "fan"})));
    }

    #[test]
    fn test_remove_existing_and_missing() {
        let store = in_memory_store();
        store.put("item/1", &json!(1)).unwrap();

        store.remove("item/1").expect("remove should succeed");
        assert_eq!(store.get("item/1").unwrap(), None);

        store.remove("item/1").expect("removing absent key is ok");
    }

    #[test]
    fn test_load_prefix_filters_and_orders() {
        let store = in_memory_store();
        store.put("item/1", &json!(1)).unwrap();
        store.put("item/2", &json!(2)).unwrap();
        store.put("slot/endpoints/item/1", &json!(3)).unwrap();

        let items = store.load_prefix("item/").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, "item/1");
        assert_eq!(items[1].0, "item/2");

        let slots = store.load_prefix("slot/").unwrap();
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn test_read_back_is_a_copy() {
        let store = in_memory_store();
        let original = json!({"nested": {"n": 1}});
        store.put("k", &original).unwrap();

        let mut loaded = store.get("k").unwrap().unwrap();
        loaded["nested"]["n"] = json!(2);

        // Mutating the read value never leaks back into storage
        assert_eq!(store.get("k").unwrap(), Some(original));
    }

    #[test]
    fn test_typed_record_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Rec {
            id: u32,
            name: String,
        }

        let store = in_memory_store();
        let rec = Rec {
            id: 7,
            name: "probe".to_string(),
        };
        store.put_record("item/7", &rec).unwrap();

        let loaded: Option<Rec> = store.get_record("item/7").unwrap();
        assert_eq!(loaded, Some(rec));
    }

    #[test]
    fn test_on_disk_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.db");
        let path = path.to_str().unwrap();

        {
            let store = Store::open(path).unwrap();
            store.put("item/1", &json!({"name": "lamp"})).unwrap();
        }

        let reopened = Store::open(path).unwrap();
        assert_eq!(
            reopened.get("item/1").unwrap(),
            Some(json!({"name": "lamp"}))
        );
    }
}
