//! File metadata records.
//!
//! Two record shapes share the metadata keyspace: the router keeps
//! `(primary cluster, replica cluster)` per file, a cluster leader keeps
//! the ordered shard descriptor list. Both are carried by the tagged
//! `MetaRef` enum and serialized with bincode, whose enum discriminant is
//! the on-disk discriminator. Records written by older deployments were
//! plain JSON arrays; those are still readable at the import boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Location of one shard of a file.
///
/// `seq` values within a file are dense and 1-based; they define the
/// reassembly order. `replica` never equals `primary` when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Address of the node holding the authoritative copy
    pub primary: String,
    /// 1-based position of this shard within the file
    pub seq: u64,
    /// Address of the node holding the best-effort copy, if any
    pub replica: Option<String>,
}

/// Leader-side metadata for one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Shard descriptors in ascending `seq` order
    pub shards: Vec<Shard>,
    /// Total file size in bytes
    pub size: u64,
    /// Timestamp of the successful upload
    pub stored_at: DateTime<Utc>,
}

/// Tagged metadata record stored under `user_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaRef {
    /// Router record: which clusters hold the file
    Router {
        primary_cluster: String,
        replica_cluster: Option<String>,
    },
    /// Leader record: where each shard lives
    Leader(FileMeta),
}

/// Global key for a file's metadata.
pub fn file_key(user: &str, name: &str) -> String {
    format!("{}_{}", user, name)
}

/// Key for one shard's raw bytes on the node storing it.
pub fn chunk_key(user: &str, name: &str, seq: u64) -> String {
    format!("{}_{}_{}", user, name, seq)
}

/// Serialize a metadata record for storage or broadcast.
pub fn encode_meta(meta: &MetaRef) -> StoreResult<Vec<u8>> {
    Ok(bincode::serialize(meta)?)
}

/// Decode a metadata record, accepting legacy JSON-array records.
pub fn decode_meta(bytes: &[u8]) -> StoreResult<MetaRef> {
    if let Ok(meta) = bincode::deserialize::<MetaRef>(bytes) {
        return Ok(meta);
    }
    import_legacy(bytes)
}

/// Import boundary for records written before the tagged format.
///
/// The shape heuristic from the old deployments is retained here and only
/// here: a first element that is itself an array means a leader record,
/// anything else is a router record.
fn import_legacy(bytes: &[u8]) -> StoreResult<MetaRef> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Serialization(format!("unreadable metadata record: {}", e)))?;
    let entries = value
        .as_array()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| StoreError::Serialization("metadata record is not a list".to_string()))?;

    if entries[0].is_array() {
        let mut shards = Vec::with_capacity(entries.len());
        for entry in entries {
            let parts = entry.as_array().ok_or_else(|| {
                StoreError::Serialization("malformed legacy shard descriptor".to_string())
            })?;
            let primary = parts
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    StoreError::Serialization("legacy shard descriptor lacks an address".to_string())
                })?
                .to_string();
            let seq = parts.get(1).and_then(|v| v.as_u64()).ok_or_else(|| {
                StoreError::Serialization("legacy shard descriptor lacks a seq".to_string())
            })?;
            let replica = parts
                .get(2)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());
            shards.push(Shard {
                primary,
                seq,
                replica,
            });
        }
        // Legacy records carry neither size nor timestamp.
        Ok(MetaRef::Leader(FileMeta {
            shards,
            size: 0,
            stored_at: Utc::now(),
        }))
    } else {
        let primary_cluster = entries[0]
            .as_str()
            .ok_or_else(|| {
                StoreError::Serialization("legacy router record lacks a cluster".to_string())
            })?
            .to_string();
        let replica_cluster = entries
            .get(1)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        Ok(MetaRef::Router {
            primary_cluster,
            replica_cluster,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_join_with_underscores() {
        assert_eq!(file_key("alice", "a.txt"), "alice_a.txt");
        assert_eq!(chunk_key("alice", "a.txt", 2), "alice_a.txt_2");
    }

    #[test]
    fn tagged_records_round_trip() {
        let leader = MetaRef::Leader(FileMeta {
            shards: vec![
                Shard {
                    primary: "10.0.0.1:7000".into(),
                    seq: 1,
                    replica: Some("10.0.0.2:7000".into()),
                },
                Shard {
                    primary: "10.0.0.2:7000".into(),
                    seq: 2,
                    replica: None,
                },
            ],
            size: 123,
            stored_at: Utc::now(),
        });
        let router = MetaRef::Router {
            primary_cluster: "cluster1".into(),
            replica_cluster: Some("cluster2".into()),
        };

        for record in [leader, router] {
            let bytes = encode_meta(&record).unwrap();
            assert_eq!(decode_meta(&bytes).unwrap(), record);
        }
    }

    #[test]
    fn legacy_router_records_are_readable() {
        let bytes = br#"["cluster1", "cluster2"]"#;
        match decode_meta(bytes).unwrap() {
            MetaRef::Router {
                primary_cluster,
                replica_cluster,
            } => {
                assert_eq!(primary_cluster, "cluster1");
                assert_eq!(replica_cluster.as_deref(), Some("cluster2"));
            }
            other => panic!("expected router record, got {:?}", other),
        }
    }

    #[test]
    fn legacy_leader_records_are_readable() {
        let bytes = br#"[["10.0.0.1:7000", 1, "10.0.0.2:7000"], ["10.0.0.2:7000", 2, ""]]"#;
        match decode_meta(bytes).unwrap() {
            MetaRef::Leader(meta) => {
                assert_eq!(meta.shards.len(), 2);
                assert_eq!(meta.shards[0].primary, "10.0.0.1:7000");
                assert_eq!(meta.shards[0].replica.as_deref(), Some("10.0.0.2:7000"));
                assert_eq!(meta.shards[1].seq, 2);
                assert_eq!(meta.shards[1].replica, None);
            }
            other => panic!("expected leader record, got {:?}", other),
        }
    }

    #[test]
    fn garbage_records_are_rejected() {
        assert!(decode_meta(b"not metadata").is_err());
        assert!(decode_meta(b"[]").is_err());
    }
}
