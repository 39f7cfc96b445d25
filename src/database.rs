//! Local key-value store.
//!
//! Wraps a `sled` database behind the small surface the rest of the system
//! needs: atomic single-key set/get/delete/exists plus helpers for the
//! metadata, user-index, leadership-status, and membership-snapshot keys.
//! sled handles its own locking; handles are cheap to clone.

use std::path::Path;

use crate::error::{StoreError, StoreResult};
use crate::metadata::{self, MetaRef};

const PRIMARY_STATUS_KEY: &str = "primaryStatus";
const IP_ADDRESSES_KEY: &str = "ip_addresses";

/// Handle to the node-local byte-keyed blob store.
#[derive(Debug, Clone)]
pub struct Database {
    db: sled::Db,
}

impl Database {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    pub fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    pub fn delete(&self, key: &str) -> StoreResult<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    pub fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.db.contains_key(key.as_bytes())?)
    }

    /// Store a metadata record under the file key.
    pub fn save_metadata(&self, file_key: &str, meta: &MetaRef) -> StoreResult<()> {
        self.set(file_key, &metadata::encode_meta(meta)?)
    }

    /// Load and decode the metadata record for a file, if present.
    pub fn load_metadata(&self, file_key: &str) -> StoreResult<Option<MetaRef>> {
        match self.get(file_key)? {
            Some(bytes) => Ok(Some(metadata::decode_meta(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Append a file name to the user's index, suppressing duplicates.
    pub fn save_user_file(&self, user: &str, name: &str) -> StoreResult<()> {
        let mut names = self.user_files(user)?;
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
            self.set(user, &bincode::serialize(&names)?)?;
        }
        Ok(())
    }

    /// File names owned by a user; empty when the user is unknown.
    pub fn user_files(&self, user: &str) -> StoreResult<Vec<String>> {
        match self.get(user)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Drop a file name from the user's index.
    pub fn remove_user_file(&self, user: &str, name: &str) -> StoreResult<()> {
        let mut names = self.user_files(user)?;
        let before = names.len();
        names.retain(|n| n != name);
        if names.len() != before {
            self.set(user, &bincode::serialize(&names)?)?;
        }
        Ok(())
    }

    /// Leadership flag: 1 when this node believes it is the cluster leader.
    pub fn primary_status(&self) -> StoreResult<u8> {
        match self.get(PRIMARY_STATUS_KEY)? {
            Some(bytes) if bytes == b"1" => Ok(1),
            _ => Ok(0),
        }
    }

    pub fn set_primary_status(&self, status: u8) -> StoreResult<()> {
        let value: &[u8] = if status == 1 { b"1" } else { b"0" };
        self.set(PRIMARY_STATUS_KEY, value)
    }

    /// Persist the comma-joined membership snapshot.
    pub fn set_ip_addresses(&self, addrs: &[String]) -> StoreResult<()> {
        self.set(IP_ADDRESSES_KEY, addrs.join(",").as_bytes())
    }

    /// Last persisted membership snapshot.
    pub fn ip_addresses(&self) -> StoreResult<Vec<String>> {
        match self.get(IP_ADDRESSES_KEY)? {
            Some(bytes) => {
                let joined = String::from_utf8(bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(joined
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect())
            }
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FileMeta, Shard};
    use chrono::Utc;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("db")).unwrap();
        (dir, db)
    }

    #[test]
    fn basic_key_operations() {
        let (_dir, db) = open_temp();
        assert!(!db.exists("k").unwrap());
        db.set("k", b"v").unwrap();
        assert!(db.exists("k").unwrap());
        assert_eq!(db.get("k").unwrap().as_deref(), Some(&b"v"[..]));
        db.delete("k").unwrap();
        assert!(!db.exists("k").unwrap());
        assert!(db.get("k").unwrap().is_none());
    }

    #[test]
    fn user_index_suppresses_duplicates() {
        let (_dir, db) = open_temp();
        db.save_user_file("alice", "a.txt").unwrap();
        db.save_user_file("alice", "b.txt").unwrap();
        db.save_user_file("alice", "a.txt").unwrap();
        assert_eq!(db.user_files("alice").unwrap(), vec!["a.txt", "b.txt"]);

        db.remove_user_file("alice", "a.txt").unwrap();
        assert_eq!(db.user_files("alice").unwrap(), vec!["b.txt"]);
    }

    #[test]
    fn primary_status_defaults_to_follower() {
        let (_dir, db) = open_temp();
        assert_eq!(db.primary_status().unwrap(), 0);
        db.set_primary_status(1).unwrap();
        assert_eq!(db.primary_status().unwrap(), 1);
        db.set_primary_status(0).unwrap();
        assert_eq!(db.primary_status().unwrap(), 0);
    }

    #[test]
    fn metadata_round_trips() {
        let (_dir, db) = open_temp();
        let meta = MetaRef::Leader(FileMeta {
            shards: vec![Shard {
                primary: "127.0.0.1:7001".into(),
                seq: 1,
                replica: None,
            }],
            size: 9,
            stored_at: Utc::now(),
        });
        db.save_metadata("alice_a.txt", &meta).unwrap();
        assert_eq!(db.load_metadata("alice_a.txt").unwrap(), Some(meta));
        assert_eq!(db.load_metadata("alice_b.txt").unwrap(), None);
    }

    #[test]
    fn ip_snapshot_round_trips() {
        let (_dir, db) = open_temp();
        assert!(db.ip_addresses().unwrap().is_empty());
        let addrs = vec!["10.0.0.1:7000".to_string(), "10.0.0.2:7000".to_string()];
        db.set_ip_addresses(&addrs).unwrap();
        assert_eq!(db.ip_addresses().unwrap(), addrs);
    }
}
