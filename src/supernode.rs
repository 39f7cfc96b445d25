//! Supernode: the cross-cluster router and entry point.
//!
//! Tracks the current leader of every cluster, records which clusters hold
//! each file, and forwards client operations to a live leader: the primary
//! cluster first, the replica cluster when the primary's channel is not
//! ready. Uploads are forwarded as a stream while the bytes are buffered
//! so a full copy can be pushed to the replica cluster in the background.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::metadata::{file_key, MetaRef};
use crate::metrics::Metrics;
use crate::wire::{self, Ack, ClusterInfo, Connection, FileData, FileInfo, PeerChannel, Request, Response};

const FORWARD_UPLOAD_TIMEOUT: Duration = Duration::from_secs(25);
const ROUTE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);
const ROUTE_DELETE_TIMEOUT: Duration = Duration::from_secs(10);
const ROUTE_SEARCH_TIMEOUT: Duration = Duration::from_secs(5);
const CLUSTER_STATS_TIMEOUT: Duration = Duration::from_secs(5);
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// A routable cluster: its name and its current leader's address.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClusterTarget {
    cluster: String,
    addr: String,
}

#[derive(Default)]
struct RouterState {
    /// Current leader address per cluster name
    cluster_leaders: HashMap<String, String>,
    /// One channel per known leader address
    channels: HashMap<String, PeerChannel>,
}

/// The cross-cluster router service.
pub struct SuperNode {
    addr: String,
    db: Database,
    worker_pool_size: usize,
    state: Mutex<RouterState>,
    metrics: Arc<Metrics>,
}

impl SuperNode {
    pub fn new(
        addr: impl Into<String>,
        db: Database,
        worker_pool_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            addr: addr.into(),
            db,
            worker_pool_size,
            state: Mutex::new(RouterState::default()),
            metrics,
        }
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current leader address for a cluster, if one has registered.
    pub fn cluster_leader(&self, cluster: &str) -> Option<String> {
        self.state().cluster_leaders.get(cluster).cloned()
    }

    fn channel_for(&self, addr: &str) -> PeerChannel {
        let mut state = self.state();
        state
            .channels
            .entry(addr.to_string())
            .or_insert_with(|| PeerChannel::new(addr))
            .clone()
    }

    /// Accept and route client connections until the process exits.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> StoreResult<()> {
        let permits = Arc::new(Semaphore::new(self.worker_pool_size));
        info!(addr = %self.addr, "supernode listening");
        loop {
            let (stream, remote) = listener.accept().await?;
            let Ok(permit) = permits.clone().acquire_owned().await else {
                return Ok(());
            };
            let router = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = router.handle_connection(stream).await {
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
            Request::RegisterLeader(info) => self.handle_register(&mut conn, info).await,
            Request::Upload(first) => self.handle_upload(&mut conn, first).await,
            Request::UploadDone => wire::send_ack(&mut conn, false, "No data received.").await,
            Request::Download(info) => self.handle_download(&mut conn, info).await,
            Request::Delete(info) => self.handle_delete(&mut conn, info).await,
            Request::Search(info) => self.handle_search(&mut conn, info).await,
            Request::List { user } => self.handle_list(&mut conn, &user).await,
            other => {
                debug!(request = ?other, "unsupported request at supernode");
                wire::send_ack(&mut conn, false, "Unsupported operation at supernode").await
            }
        }
    }

    /// A cluster leader announcing itself.
    async fn handle_register(&self, conn: &mut Connection, info: ClusterInfo) -> StoreResult<()> {
        let addr = format!("{}:{}", info.ip, info.port);
        {
            let mut state = self.state();
            state.cluster_leaders.insert(info.cluster.clone(), addr.clone());
            state
                .channels
                .entry(addr.clone())
                .or_insert_with(|| PeerChannel::new(addr.clone()));
        }
        self.metrics.record_leader_registration();
        info!(cluster = %info.cluster, leader = %addr, "cluster leader updated");
        wire::send_ack(conn, true, "Leader Updated.").await
    }

    /// Pick the two least-utilized clusters by polling each leader's
    /// aggregate stats.
    async fn least_utilized_clusters(&self) -> Option<(ClusterTarget, Option<ClusterTarget>)> {
        let leaders: Vec<(String, String)> = {
            let state = self.state();
            state
                .cluster_leaders
                .iter()
                .map(|(cluster, addr)| (cluster.clone(), addr.clone()))
                .collect()
        };

        let mut min1: Option<(ClusterTarget, f64)> = None;
        let mut min2: Option<(ClusterTarget, f64)> = None;
        for (cluster, addr) in leaders {
            let channel = self.channel_for(&addr);
            if !channel.is_ready(READY_PROBE_TIMEOUT).await {
                continue;
            }
            let stats = match channel
                .call_unary(Request::ClusterStats, CLUSTER_STATS_TIMEOUT)
                .await
            {
                Ok(Response::Stats(stats)) => stats,
                Ok(other) => {
                    debug!(leader = %addr, reply = ?other, "unexpected cluster stats reply");
                    continue;
                }
                Err(e) => {
                    debug!(leader = %addr, error = %e, "cluster stats probe failed");
                    continue;
                }
            };
            let score = (stats.cpu + stats.disk + stats.mem) / 3.0;
            let target = ClusterTarget { cluster, addr };
            match &min1 {
                None => min1 = Some((target, score)),
                Some((_, best)) if score < *best => {
                    min2 = min1.take();
                    min1 = Some((target, score));
                }
                Some(_) => match &min2 {
                    None => min2 = Some((target, score)),
                    Some((_, second)) if score < *second => min2 = Some((target, score)),
                    Some(_) => {}
                },
            }
        }

        min1.map(|(primary, _)| (primary, min2.map(|(replica, _)| replica)))
    }

    /// Forward a client upload to the least-utilized cluster's leader and
    /// replicate the whole file to the runner-up in the background.
    async fn handle_upload(&self, conn: &mut Connection, first: FileData) -> StoreResult<()> {
        let (user, name) = (first.user.clone(), first.name.clone());
        let key = file_key(&user, &name);

        if self.db.exists(&key)? {
            wire::drain_upload_stream(conn).await;
            return wire::send_ack(
                conn,
                false,
                "File already exists for this user. Please rename or delete file first.",
            )
            .await;
        }

        let Some((primary, replica)) = self.least_utilized_clusters().await else {
            wire::drain_upload_stream(conn).await;
            return wire::send_ack(conn, false, "No Active Clusters.").await;
        };
        debug!(
            primary = %primary.addr,
            replica = replica.as_ref().map(|r| r.addr.as_str()).unwrap_or("-"),
            "routing upload"
        );

        let leader = self.channel_for(&primary.addr);
        let relay = async {
            let mut payload = first.data.clone();
            let mut upstream = leader.open().await?;
            wire::send_request(&mut upstream, &Request::Upload(first)).await?;
            loop {
                match wire::next_request(conn).await? {
                    Some(Request::Upload(frame)) => {
                        payload.extend_from_slice(&frame.data);
                        wire::send_request(&mut upstream, &Request::Upload(frame)).await?;
                    }
                    Some(Request::UploadDone) => {
                        wire::send_request(&mut upstream, &Request::UploadDone).await?;
                        break;
                    }
                    Some(other) => {
                        return Err(StoreError::Internal(format!(
                            "unexpected frame in upload stream: {:?}",
                            other
                        )))
                    }
                    None => {
                        return Err(StoreError::Unavailable(
                            "client upload stream ended early".to_string(),
                        ))
                    }
                }
            }
            match wire::next_response(&mut upstream).await? {
                Some(Response::Ack(ack)) => Ok((ack, payload)),
                _ => Err(StoreError::Unavailable(
                    "cluster leader closed before upload ack".to_string(),
                )),
            }
        };

        let (ack, payload) = match timeout(FORWARD_UPLOAD_TIMEOUT, relay).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(leader = %primary.addr, error = %e, "upload forward failed");
                wire::drain_upload_stream(conn).await;
                return wire::send_ack(conn, false, &format!("Upload error: {}", e)).await;
            }
            Err(_) => {
                warn!(leader = %primary.addr, "upload forward deadline exceeded");
                wire::drain_upload_stream(conn).await;
                return wire::send_ack(
                    conn,
                    false,
                    "Upload error: deadline exceeded forwarding to cluster leader",
                )
                .await;
            }
        };

        if ack.success {
            self.db.save_metadata(
                &key,
                &MetaRef::Router {
                    primary_cluster: primary.cluster.clone(),
                    replica_cluster: replica.as_ref().map(|r| r.cluster.clone()),
                },
            )?;
            self.db.save_user_file(&user, &name)?;

            if let Some(replica) = replica {
                let channel = self.channel_for(&replica.addr);
                tokio::spawn(replicate_file(
                    channel,
                    user,
                    name,
                    payload,
                    Arc::clone(&self.metrics),
                ));
            }
        }

        wire::send_response(conn, &Response::Ack(ack)).await
    }

    /// Resolve a metadata record to (primary, replica) route targets.
    ///
    /// Leader-form records can appear here from older deployments; they
    /// are routed by shard addresses instead of cluster names.
    fn resolve_targets(&self, meta: &MetaRef) -> (Option<ClusterTarget>, Option<ClusterTarget>) {
        match meta {
            MetaRef::Router {
                primary_cluster,
                replica_cluster,
            } => {
                let state = self.state();
                let primary = state
                    .cluster_leaders
                    .get(primary_cluster)
                    .map(|addr| ClusterTarget {
                        cluster: primary_cluster.clone(),
                        addr: addr.clone(),
                    });
                let replica = replica_cluster.as_ref().and_then(|cluster| {
                    state.cluster_leaders.get(cluster).map(|addr| ClusterTarget {
                        cluster: cluster.clone(),
                        addr: addr.clone(),
                    })
                });
                (primary, replica)
            }
            MetaRef::Leader(meta) => {
                let primary = meta.shards.first().map(|shard| ClusterTarget {
                    cluster: shard.primary.clone(),
                    addr: shard.primary.clone(),
                });
                let replica = meta
                    .shards
                    .iter()
                    .find_map(|shard| shard.replica.clone())
                    .map(|addr| ClusterTarget {
                        cluster: addr.clone(),
                        addr,
                    });
                (primary, replica)
            }
        }
    }

    /// First route target whose leader channel is ready.
    async fn first_ready_target(
        &self,
        primary: Option<ClusterTarget>,
        replica: Option<ClusterTarget>,
    ) -> Option<ClusterTarget> {
        for target in [primary, replica].into_iter().flatten() {
            let channel = self.channel_for(&target.addr);
            if channel.is_ready(READY_PROBE_TIMEOUT).await {
                return Some(target);
            }
            debug!(leader = %target.addr, cluster = %target.cluster, "leader channel not ready");
        }
        None
    }

    async fn handle_download(&self, conn: &mut Connection, info: FileInfo) -> StoreResult<()> {
        let key = file_key(&info.user, &info.name);
        let Some(meta) = self.db.load_metadata(&key)? else {
            return wire::send_not_found_sentinel(conn, &info.user, &info.name).await;
        };

        let (primary, replica) = self.resolve_targets(&meta);
        let Some(target) = self.first_ready_target(primary, replica).await else {
            return wire::send_not_found_sentinel(conn, &info.user, &info.name).await;
        };

        let channel = self.channel_for(&target.addr);
        let relay = async {
            let mut upstream = channel.open().await?;
            wire::send_request(&mut upstream, &Request::Download(info.clone())).await?;
            while let Some(response) = wire::next_response(&mut upstream).await? {
                match response {
                    Response::Data(frame) => {
                        wire::send_response(conn, &Response::Data(frame)).await?;
                    }
                    other => {
                        return Err(StoreError::Internal(format!(
                            "unexpected download reply: {:?}",
                            other
                        )))
                    }
                }
            }
            Ok(())
        };
        timeout(ROUTE_DOWNLOAD_TIMEOUT, relay)
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!(
                    "download deadline exceeded for cluster leader {}",
                    target.addr
                ))
            })?
    }

    async fn handle_delete(&self, conn: &mut Connection, info: FileInfo) -> StoreResult<()> {
        let key = file_key(&info.user, &info.name);
        let Some(meta) = self.db.load_metadata(&key)? else {
            let message = format!("File {} does not exist.", info.name);
            return wire::send_ack(conn, false, &message).await;
        };

        let (primary, replica) = self.resolve_targets(&meta);
        let mut response: Option<(ClusterTarget, Ack)> = None;
        for target in [primary, replica].into_iter().flatten() {
            let channel = self.channel_for(&target.addr);
            if !channel.is_ready(READY_PROBE_TIMEOUT).await {
                continue;
            }
            let request = Request::Delete(FileInfo {
                user: info.user.clone(),
                name: info.name.clone(),
                seq_no: 0,
            });
            match channel.call_for_ack(request, ROUTE_DELETE_TIMEOUT).await {
                Ok(ack) => {
                    let success = ack.success;
                    response = Some((target, ack));
                    if success {
                        break;
                    }
                }
                Err(e) => {
                    warn!(leader = %target.addr, error = %e, "delete forward failed");
                }
            }
        }

        match response {
            Some((target, ack)) if ack.success => {
                self.db.delete(&key)?;
                self.db.remove_user_file(&info.user, &info.name)?;
                let message = format!(
                    "File successfully deleted from cluster : {}",
                    target.cluster
                );
                wire::send_ack(conn, true, &message).await
            }
            _ => wire::send_ack(conn, false, "Internal error: Could not delete file").await,
        }
    }

    async fn handle_search(&self, conn: &mut Connection, info: FileInfo) -> StoreResult<()> {
        let key = file_key(&info.user, &info.name);
        let Some(meta) = self.db.load_metadata(&key)? else {
            let message = format!("File {} does not exist.", info.name);
            return wire::send_ack(conn, false, &message).await;
        };

        let (primary, replica) = self.resolve_targets(&meta);
        for target in [primary, replica].into_iter().flatten() {
            let channel = self.channel_for(&target.addr);
            if !channel.is_ready(READY_PROBE_TIMEOUT).await {
                continue;
            }
            let request = Request::Search(FileInfo {
                user: info.user.clone(),
                name: info.name.clone(),
                seq_no: 0,
            });
            match channel.call_for_ack(request, ROUTE_SEARCH_TIMEOUT).await {
                Ok(ack) if ack.success => {
                    return wire::send_ack(conn, true, "File exists!").await;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!(leader = %target.addr, error = %e, "search forward failed");
                }
            }
        }
        wire::send_ack(conn, false, "File does not exist in any cluster.").await
    }

    async fn handle_list(&self, conn: &mut Connection, user: &str) -> StoreResult<()> {
        let names = self.db.user_files(user)?;
        wire::send_response(conn, &Response::Files { names }).await
    }
}

/// Background whole-file replication to the replica cluster's leader.
async fn replicate_file(
    channel: PeerChannel,
    user: String,
    name: String,
    data: Vec<u8>,
    metrics: Arc<Metrics>,
) {
    metrics.record_replication_attempt();
    match channel
        .upload_bytes(&user, &name, 0, "", &data, FORWARD_UPLOAD_TIMEOUT)
        .await
    {
        Ok(ack) if ack.success => {
            metrics.record_replication_success();
            debug!(replica = %channel.addr(), %user, %name, "replicated file to alternate cluster");
        }
        Ok(ack) => {
            metrics.record_replication_failure();
            warn!(replica = %channel.addr(), message = %ack.message, "file replication rejected");
        }
        Err(e) => {
            metrics.record_replication_failure();
            warn!(replica = %channel.addr(), error = %e, "file replication failed");
        }
    }
}
