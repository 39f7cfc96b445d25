//! Two-phase file deletion across the cluster.
//!
//! Phase one removes every chunk at its recorded holders (primary and
//! replica per shard); phase two removes the replicated metadata record
//! from every reachable peer. Individual failures are counted and logged
//! but do not stop the sweep: a peer that is down will simply hold
//! unreferenced chunks, which nothing can reach once the metadata is gone.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::database::Database;
use crate::metadata::{chunk_key, FileMeta};
use crate::wire::{FileInfo, PeerChannel, Request};

const DELETE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delete all chunks and metadata copies of a file. Returns the number of
/// successful and failed per-peer operations.
pub async fn delete_file_everywhere(
    self_addr: &str,
    db: &Database,
    active: &HashMap<String, PeerChannel>,
    meta: &FileMeta,
    user: &str,
    name: &str,
) -> (usize, usize) {
    let mut succeeded = 0usize;
    let mut failed = 0usize;

    // Phase one: chunks at every recorded holder.
    for shard in &meta.shards {
        let mut holders = vec![shard.primary.clone()];
        if let Some(replica) = &shard.replica {
            holders.push(replica.clone());
        }
        for addr in holders {
            if addr == self_addr {
                match db.delete(&chunk_key(user, name, shard.seq)) {
                    Ok(()) => succeeded += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(seq = shard.seq, error = %e, "local chunk delete failed");
                    }
                }
                continue;
            }
            let channel = active
                .get(&addr)
                .cloned()
                .unwrap_or_else(|| PeerChannel::new(addr.clone()));
            let request = Request::Delete(FileInfo {
                user: user.to_string(),
                name: name.to_string(),
                seq_no: shard.seq,
            });
            match channel.call_for_ack(request, DELETE_TIMEOUT).await {
                Ok(ack) if ack.success => succeeded += 1,
                Ok(ack) => {
                    failed += 1;
                    warn!(peer = %addr, seq = shard.seq, message = %ack.message, "chunk delete rejected");
                }
                Err(e) => {
                    failed += 1;
                    warn!(peer = %addr, seq = shard.seq, error = %e, "chunk delete failed");
                }
            }
        }
    }

    // Phase two: replicated metadata on every reachable peer.
    for (addr, channel) in active {
        let request = Request::Delete(FileInfo {
            user: user.to_string(),
            name: name.to_string(),
            seq_no: 0,
        });
        match channel.call_for_ack(request, DELETE_TIMEOUT).await {
            Ok(ack) if ack.success => succeeded += 1,
            Ok(ack) => {
                failed += 1;
                warn!(peer = %addr, message = %ack.message, "metadata delete rejected");
            }
            Err(e) => {
                failed += 1;
                warn!(peer = %addr, error = %e, "metadata delete failed");
            }
        }
    }

    debug!(user, name, succeeded, failed, "delete sweep finished");
    (succeeded, failed)
}
