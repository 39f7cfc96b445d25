//! Whole-file reassembly on the leader.
//!
//! When a download misses the cache, the shard descriptors say which peer
//! holds each piece. All shards are fetched concurrently, each fetch
//! bounded by its own deadline, and joined back together in `seq` order.
//! A shard whose primary is the current node is read straight from the
//! local store.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::try_join_all;
use tracing::debug;

use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::metadata::{chunk_key, FileMeta};
use crate::wire::PeerChannel;

const CHUNK_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetch every shard of a file and concatenate them in order.
pub async fn fetch_file(
    self_addr: &str,
    db: &Database,
    active: &HashMap<String, PeerChannel>,
    meta: &FileMeta,
    user: &str,
    name: &str,
) -> StoreResult<Vec<u8>> {
    let fetches = meta.shards.iter().map(|shard| {
        let local = shard.primary == self_addr;
        let channel = active
            .get(&shard.primary)
            .cloned()
            .unwrap_or_else(|| PeerChannel::new(shard.primary.clone()));
        let db = db.clone();
        let user = user.to_string();
        let name = name.to_string();
        let seq = shard.seq;
        async move {
            if local {
                db.get(&chunk_key(&user, &name, seq))?
                    .ok_or_else(|| StoreError::NotFound(chunk_key(&user, &name, seq)))
            } else {
                channel
                    .download_bytes(&user, &name, seq, CHUNK_DOWNLOAD_TIMEOUT)
                    .await
            }
        }
    });

    let chunks = try_join_all(fetches).await?;
    let total: usize = chunks.iter().map(Vec::len).sum();
    debug!(
        user,
        name,
        shards = chunks.len(),
        bytes = total,
        "reassembled file from peers"
    );
    Ok(chunks.concat())
}
