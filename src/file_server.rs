//! Storage node RPC service.
//!
//! Every node in a cluster runs this server. Followers store and serve
//! individual chunks; the elected leader additionally drives the shard
//! pipeline for uploads, reassembles files for downloads, answers cluster
//! stats queries for the supernode, and coordinates deletion.
//!
//! Which role applies is decided per request from the persisted
//! `primaryStatus` flag, so a node survives leadership changes without
//! restarting its accept loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::assembly;
use crate::config::Config;
use crate::database::Database;
use crate::deletion;
use crate::error::{StoreError, StoreResult};
use crate::hybrid_cache::HybridCache;
use crate::load_balancer::{LoadPicker, Placement};
use crate::membership::MembershipTracker;
use crate::metadata::{self, chunk_key, file_key, FileMeta, MetaRef, Shard};
use crate::metrics::Metrics;
use crate::system_stats::StatsSampler;
use crate::wire::{
    self, Connection, FileData, FileInfo, NodeStats, PeerChannel, Request, Response,
};

const SHARD_WRITE_TIMEOUT: Duration = Duration::from_secs(20);
const CHUNK_REPLICATION_TIMEOUT: Duration = Duration::from_secs(20);
const METADATA_BROADCAST_TIMEOUT: Duration = Duration::from_secs(5);
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// RPC service for one storage node.
pub struct FileServer {
    self_addr: String,
    shard_limit: usize,
    cache_dir: PathBuf,
    worker_pool_size: usize,
    db: Database,
    cache: Arc<HybridCache>,
    tracker: Arc<MembershipTracker>,
    picker: LoadPicker,
    sampler: Arc<StatsSampler>,
    metrics: Arc<Metrics>,
}

impl FileServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        self_addr: impl Into<String>,
        db: Database,
        cache: Arc<HybridCache>,
        tracker: Arc<MembershipTracker>,
        picker: LoadPicker,
        sampler: Arc<StatsSampler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            self_addr: self_addr.into(),
            shard_limit: config.storage.shard_limit,
            cache_dir: config.cache_dir(),
            worker_pool_size: config.network.worker_pool_size,
            db,
            cache,
            tracker,
            picker,
            sampler,
            metrics,
        }
    }

    /// Accept and serve RPC connections until the process exits.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> StoreResult<()> {
        let permits = Arc::new(Semaphore::new(self.worker_pool_size));
        info!(addr = %self.self_addr, "file server listening");
        loop {
            let (stream, remote) = listener.accept().await?;
            let Ok(permit) = permits.clone().acquire_owned().await else {
                return Ok(());
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = server.handle_connection(stream).await {
                    debug!(remote = %remote, error = %e, "request handling failed");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> StoreResult<()> {
        let mut conn = wire::frame_connection(stream);
        let Some(request) = wire::next_request(&mut conn).await? else {
            return Ok(());
        };
        match request {
            Request::Upload(first) => self.handle_upload(&mut conn, first).await,
            Request::UploadDone => wire::send_ack(&mut conn, false, "No data received").await,
            Request::Download(info) => self.handle_download(&mut conn, info).await,
            Request::Search(info) => self.handle_search(&mut conn, info).await,
            Request::Delete(info) => self.handle_delete(&mut conn, info).await,
            Request::List { user } => self.handle_list(&mut conn, &user).await,
            Request::Metadata { file_key, payload } => {
                self.handle_metadata(&mut conn, &file_key, &payload).await
            }
            Request::ClusterStats => self.handle_cluster_stats(&mut conn).await,
            Request::IsAlive => {
                wire::send_response(&mut conn, &Response::Stats(self.sampler.sample())).await
            }
            Request::RegisterLeader(_) => {
                wire::send_ack(&mut conn, false, "Leader registration is a supernode operation")
                    .await
            }
        }
    }

    /// Channel to a peer, reusing the tracker's when it has one.
    fn channel_for(&self, addr: &str) -> PeerChannel {
        self.tracker
            .get_active_channels()
            .get(addr)
            .cloned()
            .unwrap_or_else(|| PeerChannel::new(addr))
    }

    // ===== Upload =====

    /// Dispatch an upload stream based on its first frame only.
    ///
    /// A non-empty `replica_node` marks a chunk-store request from another
    /// node's pipeline. With an empty `replica_node`, a leader runs the
    /// full shard pipeline; a follower accepts replica pushes (real shard
    /// seq) and rejects whole-file uploads (seq 0) that belong on the
    /// leader.
    async fn handle_upload(&self, conn: &mut Connection, first: FileData) -> StoreResult<()> {
        if !first.replica_node.is_empty() {
            return self.store_chunk(conn, first).await;
        }
        if self.db.primary_status()? == 1 {
            return self.full_upload(conn, first).await;
        }
        if first.seq_no == 0 {
            wire::drain_upload_stream(conn).await;
            return wire::send_ack(conn, false, "Only leader can accept file uploads").await;
        }
        self.follower_sink(conn, first).await
    }

    /// Buffer the rest of an upload stream onto `buffer`.
    async fn collect_upload_stream(
        &self,
        conn: &mut Connection,
        mut buffer: Vec<u8>,
    ) -> StoreResult<Vec<u8>> {
        while let Some(request) = wire::next_request(conn).await? {
            match request {
                Request::Upload(frame) => buffer.extend_from_slice(&frame.data),
                Request::UploadDone => return Ok(buffer),
                other => {
                    return Err(StoreError::Internal(format!(
                        "unexpected frame in upload stream: {:?}",
                        other
                    )))
                }
            }
        }
        Err(StoreError::Unavailable(
            "upload stream ended without terminator".to_string(),
        ))
    }

    /// Chunk-store mode: persist one already-placed shard and push its
    /// replica in the background.
    async fn store_chunk(&self, conn: &mut Connection, first: FileData) -> StoreResult<()> {
        let (user, name, seq) = (first.user.clone(), first.name.clone(), first.seq_no);
        let replica_node = first.replica_node.clone();
        let data = self.collect_upload_stream(conn, first.data).await?;

        self.db.set(&chunk_key(&user, &name, seq), &data)?;
        debug!(%user, %name, seq, bytes = data.len(), "stored shard chunk");

        // The forwarded stream carries an empty replica_node, so the push
        // cannot cascade.
        let channel = self.channel_for(&replica_node);
        tokio::spawn(replicate_chunk(
            channel,
            user,
            name,
            seq,
            data,
            Arc::clone(&self.metrics),
        ));

        wire::send_ack(conn, true, "Saved").await
    }

    /// Follower sink for replica pushes: buffer the stream and store it
    /// under the seq announced in the first frame.
    async fn follower_sink(&self, conn: &mut Connection, first: FileData) -> StoreResult<()> {
        let key = chunk_key(&first.user, &first.name, first.seq_no);
        let data = self.collect_upload_stream(conn, first.data).await?;
        self.db.set(&key, &data)?;
        debug!(%key, bytes = data.len(), "stored replica chunk");
        wire::send_ack(conn, true, "Saved").await
    }

    /// Leader shard pipeline for a whole-file upload.
    async fn full_upload(&self, conn: &mut Connection, first: FileData) -> StoreResult<()> {
        let (user, name) = (first.user.clone(), first.name.clone());
        let key = file_key(&user, &name);

        let Some(mut placement) = self.picker.least_loaded().await else {
            let message = self.no_capacity_message("no other nodes available for sharding");
            wire::drain_upload_stream(conn).await;
            return wire::send_ack(conn, false, &message).await;
        };

        if self.db.exists(&key)? {
            wire::drain_upload_stream(conn).await;
            return wire::send_ack(
                conn,
                false,
                "File already exists for this user. Please rename or delete file first.",
            )
            .await;
        }

        let mut shards: Vec<Shard> = Vec::new();
        let mut buffer = first.data;
        let mut total = buffer.len() as u64;
        let mut seq: u64 = 1;

        loop {
            let Some(request) = wire::next_request(conn).await? else {
                return Err(StoreError::Unavailable(
                    "upload stream ended without terminator".to_string(),
                ));
            };
            match request {
                Request::Upload(frame) => {
                    total += frame.data.len() as u64;
                    if !buffer.is_empty() && buffer.len() + frame.data.len() > self.shard_limit {
                        if let Err(message) =
                            self.ship_shard(&placement, &user, &name, seq, &buffer).await
                        {
                            wire::drain_upload_stream(conn).await;
                            return wire::send_ack(conn, false, &message).await;
                        }
                        shards.push(placed_shard(&placement, seq));
                        self.metrics.record_shard_creation();
                        seq += 1;
                        buffer = frame.data;
                        placement = match self.picker.least_loaded().await {
                            Some(next) => next,
                            None => {
                                let message = self
                                    .no_capacity_message("no nodes available during chunk processing");
                                wire::drain_upload_stream(conn).await;
                                return wire::send_ack(conn, false, &message).await;
                            }
                        };
                    } else {
                        buffer.extend_from_slice(&frame.data);
                    }
                }
                Request::UploadDone => break,
                other => {
                    return Err(StoreError::Internal(format!(
                        "unexpected frame in upload stream: {:?}",
                        other
                    )))
                }
            }
        }

        if !buffer.is_empty() {
            if let Err(message) = self.ship_shard(&placement, &user, &name, seq, &buffer).await {
                return wire::send_ack(conn, false, &message).await;
            }
            shards.push(placed_shard(&placement, seq));
            self.metrics.record_shard_creation();
        }

        if shards.is_empty() {
            return wire::send_ack(conn, false, "No data received").await;
        }

        // Reaching this point means every shard write acked success; only
        // now may the file become visible.
        let meta = FileMeta {
            shards,
            size: total,
            stored_at: Utc::now(),
        };
        self.db.save_metadata(&key, &MetaRef::Leader(meta.clone()))?;
        self.db.save_user_file(&user, &name)?;
        info!(%key, shards = meta.shards.len(), bytes = total, "stored file");

        let payload = metadata::encode_meta(&MetaRef::Leader(meta))?;
        tokio::spawn(broadcast_metadata(
            self.tracker.get_active_channels(),
            key,
            payload,
            Arc::clone(&self.metrics),
        ));

        wire::send_ack(conn, true, "Saved").await
    }

    /// Write one shard to its primary; success means the primary acked.
    /// The replica push never blocks the pipeline.
    async fn ship_shard(
        &self,
        placement: &Placement,
        user: &str,
        name: &str,
        seq: u64,
        data: &[u8],
    ) -> Result<(), String> {
        let replica = placement.replica.clone().unwrap_or_default();

        if placement.primary == self.self_addr {
            if let Err(e) = self.db.set(&chunk_key(user, name, seq), data) {
                return Err(format!("Error saving shard locally: {}", e));
            }
            if !replica.is_empty() {
                tokio::spawn(replicate_chunk(
                    self.channel_for(&replica),
                    user.to_string(),
                    name.to_string(),
                    seq,
                    data.to_vec(),
                    Arc::clone(&self.metrics),
                ));
            }
            return Ok(());
        }

        let channel = self.channel_for(&placement.primary);
        match channel
            .upload_bytes(user, name, seq, &replica, data, SHARD_WRITE_TIMEOUT)
            .await
        {
            Ok(ack) if ack.success => Ok(()),
            Ok(ack) => Err(format!(
                "Error saving shard on {}: {}",
                placement.primary, ack.message
            )),
            Err(e) => Err(format!("Error saving shard on {}: {}", placement.primary, e)),
        }
    }

    fn no_capacity_message(&self, detail: &str) -> String {
        format!(
            "Error saving file: {}. (Total active: {}, Other nodes: {})",
            detail,
            self.tracker.total_active_count(),
            self.tracker.other_active_count()
        )
    }

    // ===== Download =====

    async fn handle_download(&self, conn: &mut Connection, info: FileInfo) -> StoreResult<()> {
        if self.db.primary_status()? == 1 {
            self.leader_download(conn, info).await
        } else {
            self.follower_download(conn, info).await
        }
    }

    async fn leader_download(&self, conn: &mut Connection, info: FileInfo) -> StoreResult<()> {
        let key = file_key(&info.user, &info.name);
        let meta = match self.db.load_metadata(&key)? {
            Some(MetaRef::Leader(meta)) => meta,
            _ => return wire::send_not_found_sentinel(conn, &info.user, &info.name).await,
        };

        if let Some(path) = self.cache.get(&key) {
            self.metrics.record_cache_hit();
            debug!(%key, "serving download from cache");
            return self.stream_artifact(conn, &info, &path).await;
        }
        self.metrics.record_cache_miss();

        let active = self.tracker.get_active_channels();
        let data =
            assembly::fetch_file(&self.self_addr, &self.db, &active, &meta, &info.user, &info.name)
                .await?;
        wire::send_data_stream(conn, &info.user, &info.name, info.seq_no, &data).await?;

        // Write-back runs detached; the client already has its bytes.
        tokio::spawn(write_back_cache(
            Arc::clone(&self.cache),
            self.cache_dir.clone(),
            key,
            data,
            Arc::clone(&self.metrics),
        ));
        Ok(())
    }

    /// Stream a cached artifact from disk in wire-sized frames.
    async fn stream_artifact(
        &self,
        conn: &mut Connection,
        info: &FileInfo,
        path: &Path,
    ) -> StoreResult<()> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut chunk = vec![0u8; wire::MAX_FRAME_SIZE];
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            wire::send_response(
                conn,
                &Response::Data(FileData {
                    user: info.user.clone(),
                    name: info.name.clone(),
                    data: chunk[..n].to_vec(),
                    seq_no: 1,
                    replica_node: String::new(),
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn follower_download(&self, conn: &mut Connection, info: FileInfo) -> StoreResult<()> {
        let key = chunk_key(&info.user, &info.name, info.seq_no);
        match self.db.get(&key)? {
            Some(data) => {
                wire::send_data_stream(conn, &info.user, &info.name, info.seq_no, &data).await
            }
            None => wire::send_not_found_sentinel(conn, &info.user, &info.name).await,
        }
    }

    // ===== Delete / search / list =====

    async fn handle_delete(&self, conn: &mut Connection, info: FileInfo) -> StoreResult<()> {
        if self.db.primary_status()? == 1 {
            let key = file_key(&info.user, &info.name);
            let meta = match self.db.load_metadata(&key)? {
                Some(MetaRef::Leader(meta)) => meta,
                _ => return wire::send_ack(conn, false, "File does not exist").await,
            };

            let active = self.tracker.get_active_channels();
            let (succeeded, failed) = deletion::delete_file_everywhere(
                &self.self_addr,
                &self.db,
                &active,
                &meta,
                &info.user,
                &info.name,
            )
            .await;

            self.db.delete(&key)?;
            self.db.remove_user_file(&info.user, &info.name)?;
            self.cache.del(&key);
            self.metrics.set_cache_size(self.cache.len() as u64);
            info!(%key, succeeded, failed, "deleted file from cluster");

            wire::send_ack(conn, true, "Successfully deleted file from the cluster").await
        } else {
            let meta_key = file_key(&info.user, &info.name);
            let data_key = chunk_key(&info.user, &info.name, info.seq_no);
            if self.db.exists(&meta_key)? {
                self.db.delete(&meta_key)?;
            }
            if self.db.exists(&data_key)? {
                self.db.delete(&data_key)?;
            }
            wire::send_ack(conn, true, "Successfully deleted file from the cluster").await
        }
    }

    async fn handle_search(&self, conn: &mut Connection, info: FileInfo) -> StoreResult<()> {
        if self.db.exists(&file_key(&info.user, &info.name))? {
            wire::send_ack(conn, true, "File exists in the cluster.").await
        } else {
            wire::send_ack(conn, false, "File does not exist in the cluster.").await
        }
    }

    async fn handle_list(&self, conn: &mut Connection, user: &str) -> StoreResult<()> {
        let names = self.db.user_files(user)?;
        wire::send_response(conn, &Response::Files { names }).await
    }

    /// Store a metadata record broadcast by the cluster leader.
    async fn handle_metadata(
        &self,
        conn: &mut Connection,
        file_key: &str,
        payload: &[u8],
    ) -> StoreResult<()> {
        self.db.set(file_key, payload)?;
        let message = format!("Successfully saved the metadata on {}", self.self_addr);
        wire::send_ack(conn, true, &message).await
    }

    /// Average the heartbeat stats of all reachable peers for the router.
    async fn handle_cluster_stats(&self, conn: &mut Connection) -> StoreResult<()> {
        let active = self.tracker.get_active_channels();
        let mut totals = NodeStats {
            cpu: 0.0,
            disk: 0.0,
            mem: 0.0,
        };
        let mut reachable = 0u32;

        for (addr, channel) in active {
            if !channel.is_ready(READY_PROBE_TIMEOUT).await {
                continue;
            }
            match channel
                .call_unary(Request::IsAlive, READY_PROBE_TIMEOUT)
                .await
            {
                Ok(Response::Stats(stats)) => {
                    totals.cpu += stats.cpu;
                    totals.disk += stats.disk;
                    totals.mem += stats.mem;
                    reachable += 1;
                }
                Ok(other) => debug!(peer = %addr, reply = ?other, "unexpected heartbeat reply"),
                Err(e) => debug!(peer = %addr, error = %e, "heartbeat probe failed"),
            }
        }

        // A cluster with no reachable followers reports itself saturated
        // so the router never prefers it.
        let stats = if reachable == 0 {
            NodeStats {
                cpu: 100.0,
                disk: 100.0,
                mem: 100.0,
            }
        } else {
            NodeStats {
                cpu: totals.cpu / reachable as f64,
                disk: totals.disk / reachable as f64,
                mem: totals.mem / reachable as f64,
            }
        };
        wire::send_response(conn, &Response::Stats(stats)).await
    }
}

fn placed_shard(placement: &Placement, seq: u64) -> Shard {
    Shard {
        primary: placement.primary.clone(),
        seq,
        replica: placement.replica.clone(),
    }
}

/// Background push of one chunk to its replica peer.
async fn replicate_chunk(
    channel: PeerChannel,
    user: String,
    name: String,
    seq: u64,
    data: Vec<u8>,
    metrics: Arc<Metrics>,
) {
    metrics.record_replication_attempt();
    match channel
        .upload_bytes(&user, &name, seq, "", &data, CHUNK_REPLICATION_TIMEOUT)
        .await
    {
        Ok(ack) if ack.success => {
            metrics.record_replication_success();
            debug!(replica = %channel.addr(), %user, %name, seq, "replicated chunk");
        }
        Ok(ack) => {
            metrics.record_replication_failure();
            warn!(replica = %channel.addr(), message = %ack.message, "chunk replication rejected");
        }
        Err(e) => {
            metrics.record_replication_failure();
            warn!(replica = %channel.addr(), error = %e, "chunk replication failed");
        }
    }
}

/// Best-effort metadata fan-out to every reachable peer.
async fn broadcast_metadata(
    active: HashMap<String, PeerChannel>,
    file_key: String,
    payload: Vec<u8>,
    metrics: Arc<Metrics>,
) {
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    for (addr, channel) in active {
        let request = Request::Metadata {
            file_key: file_key.clone(),
            payload: payload.clone(),
        };
        match channel
            .call_for_ack(request, METADATA_BROADCAST_TIMEOUT)
            .await
        {
            Ok(ack) if ack.success => {
                succeeded += 1;
                metrics.record_metadata_replication();
            }
            Ok(ack) => {
                failed += 1;
                metrics.record_metadata_replication_failure();
                warn!(peer = %addr, message = %ack.message, "metadata broadcast rejected");
            }
            Err(e) => {
                failed += 1;
                metrics.record_metadata_replication_failure();
                debug!(peer = %addr, error = %e, "metadata broadcast failed");
            }
        }
    }
    debug!(key = %file_key, succeeded, failed, "metadata broadcast finished");
}

/// Detached write-back of a downloaded file into the leader cache.
async fn write_back_cache(
    cache: Arc<HybridCache>,
    cache_dir: PathBuf,
    key: String,
    data: Vec<u8>,
    metrics: Arc<Metrics>,
) {
    if cache.contains(&key) {
        // Already resident; the set only refreshes access tracking.
        cache.set(&key, cache_dir.join(&key));
        return;
    }

    if let Err(e) = tokio::fs::create_dir_all(&cache_dir).await {
        warn!(dir = %cache_dir.display(), error = %e, "cache directory unavailable");
        return;
    }
    let path = cache_dir.join(&key);
    if let Err(e) = tokio::fs::write(&path, &data).await {
        warn!(path = %path.display(), error = %e, "cache write-back failed");
        return;
    }

    cache.set(&key, path);
    metrics.set_cache_size(cache.len() as u64);
    debug!(%key, "cached file for future downloads");
}
