/// End-to-end cluster tests.
///
/// Each test stands up real storage nodes (and, where needed, a
/// supernode) on loopback TCP with ephemeral ports, then drives them
/// through the same wire protocol a client would use. The shard limit is
/// scaled down so multi-shard behavior is exercised with small payloads.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use shardmesh::config::Config;
use shardmesh::database::Database;
use shardmesh::file_server::FileServer;
use shardmesh::hybrid_cache::HybridCache;
use shardmesh::leadership::{LeadershipAgent, ManualConsensus};
use shardmesh::load_balancer::LoadPicker;
use shardmesh::membership::MembershipTracker;
use shardmesh::metadata::{chunk_key, file_key, MetaRef};
use shardmesh::metrics::Metrics;
use shardmesh::supernode::SuperNode;
use shardmesh::system_stats::StatsSampler;
use shardmesh::wire::{Ack, ClusterInfo, FileInfo, PeerChannel, Request, Response};

const SHARD_LIMIT: usize = 1 << 20; // 1 MiB
const FRAME_SIZE: usize = 256 * 1024; // divides the shard limit evenly
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

struct TestNode {
    addr: String,
    db: Database,
    cache: Arc<HybridCache>,
    cache_dir: PathBuf,
    tracker: Arc<MembershipTracker>,
    metrics: Arc<Metrics>,
    handle: JoinHandle<()>,
}

struct Cluster {
    nodes: Vec<TestNode>,
}

impl Cluster {
    fn leader(&self) -> &TestNode {
        &self.nodes[0]
    }

    fn node_by_addr(&self, addr: &str) -> Option<&TestNode> {
        self.nodes.iter().find(|n| n.addr == addr)
    }
}

async fn start_node(
    dir: &Path,
    tag: &str,
    peer_table: &Path,
    shard_limit: usize,
    addr: String,
    listener: TcpListener,
) -> Result<TestNode> {
    let mut config = Config::default();
    config.network.bind_addr = addr.clone();
    config.network.peer_table = peer_table.to_path_buf();
    config.network.peer_table_fallback = dir.join("no_such_peers.txt");
    config.storage.db_path = Some(dir.join(format!("{}_db", tag)));
    config.storage.cache_dir = Some(dir.join(format!("{}_cache", tag)));
    config.storage.shard_limit = shard_limit;
    config.cache.capacity = 8;

    let metrics = Arc::new(Metrics::new());
    let db = Database::open(&config.db_path())?;
    let cache = Arc::new(HybridCache::new(
        config.cache.capacity,
        config.cache.frequency_weight,
        config.cache.recency_weight,
    ));
    let tracker = Arc::new(MembershipTracker::new(
        addr.clone(),
        &config.network,
        db.clone(),
        Arc::clone(&metrics),
    ));
    let picker = LoadPicker::new(Arc::clone(&tracker), Arc::clone(&metrics));
    let sampler = Arc::new(StatsSampler::new());
    let cache_dir = config.cache_dir();

    let server = Arc::new(FileServer::new(
        &config,
        addr.clone(),
        db.clone(),
        Arc::clone(&cache),
        Arc::clone(&tracker),
        picker,
        sampler,
        Arc::clone(&metrics),
    ));
    let handle = tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    Ok(TestNode {
        addr,
        db,
        cache,
        cache_dir,
        tracker,
        metrics,
        handle,
    })
}

/// Start a cluster of `node_count` nodes; the first one is made leader.
async fn start_cluster(
    dir: &Path,
    tag: &str,
    node_count: usize,
    shard_limit: usize,
) -> Result<Cluster> {
    let mut listeners = Vec::new();
    for _ in 0..node_count {
        listeners.push(TcpListener::bind("127.0.0.1:0").await?);
    }
    let addrs: Vec<String> = listeners
        .iter()
        .map(|l| l.local_addr().map(|a| a.to_string()))
        .collect::<std::io::Result<_>>()?;

    let peer_table = dir.join(format!("{}_peers.txt", tag));
    std::fs::write(&peer_table, addrs.join("\n"))?;

    let mut nodes = Vec::new();
    for (i, listener) in listeners.into_iter().enumerate() {
        let node = start_node(
            dir,
            &format!("{}_{}", tag, i),
            &peer_table,
            shard_limit,
            addrs[i].clone(),
            listener,
        )
        .await?;
        nodes.push(node);
    }

    nodes[0].db.set_primary_status(1)?;
    for node in &nodes {
        node.tracker.refresh_once().await;
    }

    Ok(Cluster { nodes })
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn test_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn client_upload(addr: &str, user: &str, name: &str, data: &[u8]) -> Result<Ack> {
    let channel = PeerChannel::new(addr);
    Ok(channel
        .upload_bytes_framed(user, name, 0, "", data, FRAME_SIZE, CALL_TIMEOUT)
        .await?)
}

async fn client_download(addr: &str, user: &str, name: &str) -> Result<Vec<u8>> {
    let channel = PeerChannel::new(addr);
    Ok(channel.download_bytes(user, name, 0, CALL_TIMEOUT).await?)
}

async fn client_search(addr: &str, user: &str, name: &str) -> Result<Ack> {
    let channel = PeerChannel::new(addr);
    let request = Request::Search(FileInfo {
        user: user.to_string(),
        name: name.to_string(),
        seq_no: 0,
    });
    Ok(channel.call_for_ack(request, CALL_TIMEOUT).await?)
}

async fn client_delete(addr: &str, user: &str, name: &str) -> Result<Ack> {
    let channel = PeerChannel::new(addr);
    let request = Request::Delete(FileInfo {
        user: user.to_string(),
        name: name.to_string(),
        seq_no: 0,
    });
    Ok(channel.call_for_ack(request, CALL_TIMEOUT).await?)
}

async fn client_list(addr: &str, user: &str) -> Result<Vec<String>> {
    let channel = PeerChannel::new(addr);
    let request = Request::List {
        user: user.to_string(),
    };
    match channel.call_unary(request, CALL_TIMEOUT).await? {
        Response::Files { names } => Ok(names),
        other => anyhow::bail!("unexpected list reply: {:?}", other),
    }
}

fn split_addr(addr: &str) -> (String, u16) {
    let (ip, port) = addr.rsplit_once(':').expect("host:port");
    (ip.to_string(), port.parse().expect("port"))
}

#[tokio::test]
async fn upload_shards_and_round_trips() -> Result<()> {
    let dir = TempDir::new()?;
    let cluster = start_cluster(dir.path(), "c1", 3, SHARD_LIMIT).await?;
    let leader = cluster.leader();

    let data = test_bytes(2_400_000);
    let ack = client_upload(&leader.addr, "alice", "a.txt", &data).await?;
    assert!(ack.success, "upload failed: {}", ack.message);

    let key = file_key("alice", "a.txt");
    let meta = match leader.db.load_metadata(&key)? {
        Some(MetaRef::Leader(meta)) => meta,
        other => panic!("expected leader metadata, got {:?}", other),
    };

    // ceil(2_400_000 / 1 MiB) descriptors with dense 1-based seqs.
    assert_eq!(meta.shards.len(), 3);
    let seqs: Vec<u64> = meta.shards.iter().map(|s| s.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(meta.size, 2_400_000);

    // Shards split at exactly the limit for limit-aligned client frames,
    // and never land on the leader itself.
    let mut sizes = Vec::new();
    for shard in &meta.shards {
        assert_ne!(shard.primary, leader.addr);
        if let Some(replica) = &shard.replica {
            assert_ne!(replica, &shard.primary);
        }
        let holder = cluster.node_by_addr(&shard.primary).expect("shard holder");
        let chunk = holder
            .db
            .get(&chunk_key("alice", "a.txt", shard.seq))?
            .expect("chunk bytes");
        sizes.push(chunk.len());
    }
    assert_eq!(sizes, vec![1_048_576, 1_048_576, 302_848]);

    // Replica copies land in the background.
    for shard in &meta.shards {
        if let Some(replica) = shard.replica.clone() {
            let holder = cluster.node_by_addr(&replica).expect("replica holder");
            let db = holder.db.clone();
            let chunk = chunk_key("alice", "a.txt", shard.seq);
            wait_for("replica chunk", move || db.exists(&chunk).unwrap_or(false)).await;
        }
    }

    let fetched = client_download(&leader.addr, "alice", "a.txt").await?;
    assert_eq!(fetched, data);

    assert_eq!(client_list(&leader.addr, "alice").await?, vec!["a.txt"]);
    assert!(leader.metrics.snapshot().shards_created >= 3);
    Ok(())
}

#[tokio::test]
async fn duplicate_upload_is_rejected_and_leaves_data_intact() -> Result<()> {
    let dir = TempDir::new()?;
    let cluster = start_cluster(dir.path(), "dup", 3, SHARD_LIMIT).await?;
    let leader = cluster.leader();

    let data = test_bytes(700_000);
    let ack = client_upload(&leader.addr, "alice", "a.txt", &data).await?;
    assert!(ack.success, "{}", ack.message);

    let key = file_key("alice", "a.txt");
    let before = leader.db.load_metadata(&key)?.expect("metadata");

    let again = client_upload(&leader.addr, "alice", "a.txt", &data).await?;
    assert!(!again.success);
    assert!(
        again.message.starts_with("File already exists"),
        "unexpected message: {}",
        again.message
    );

    // The original record and chunks are untouched.
    assert_eq!(leader.db.load_metadata(&key)?.expect("metadata"), before);
    let fetched = client_download(&leader.addr, "alice", "a.txt").await?;
    assert_eq!(fetched, data);
    Ok(())
}

#[tokio::test]
async fn delete_removes_every_copy_and_is_not_repeatable() -> Result<()> {
    let dir = TempDir::new()?;
    let cluster = start_cluster(dir.path(), "del", 3, SHARD_LIMIT).await?;
    let leader = cluster.leader();

    let data = test_bytes(1_500_000);
    let ack = client_upload(&leader.addr, "alice", "gone.bin", &data).await?;
    assert!(ack.success, "{}", ack.message);

    let key = file_key("alice", "gone.bin");
    let meta = match leader.db.load_metadata(&key)? {
        Some(MetaRef::Leader(meta)) => meta,
        other => panic!("expected leader metadata, got {:?}", other),
    };

    // Let the background replica pushes and the metadata broadcast land
    // before sweeping, so nothing races the delete.
    for shard in &meta.shards {
        if let Some(replica) = shard.replica.clone() {
            let holder = cluster.node_by_addr(&replica).expect("replica holder");
            let db = holder.db.clone();
            let chunk = chunk_key("alice", "gone.bin", shard.seq);
            wait_for("replica chunk", move || db.exists(&chunk).unwrap_or(false)).await;
        }
    }
    for node in &cluster.nodes[1..] {
        let db = node.db.clone();
        let key = key.clone();
        wait_for("metadata broadcast", move || db.exists(&key).unwrap_or(false)).await;
    }

    let deleted = client_delete(&leader.addr, "alice", "gone.bin").await?;
    assert!(deleted.success, "{}", deleted.message);

    // No chunk key survives on any node, no metadata record either.
    for node in &cluster.nodes {
        assert!(!node.db.exists(&key)?, "metadata left on {}", node.addr);
        for seq in 1..=meta.shards.len() as u64 {
            assert!(
                !node.db.exists(&chunk_key("alice", "gone.bin", seq))?,
                "chunk {} left on {}",
                seq,
                node.addr
            );
        }
    }
    assert!(client_list(&leader.addr, "alice").await?.is_empty());

    let search = client_search(&leader.addr, "alice", "gone.bin").await?;
    assert!(!search.success);

    let second = client_delete(&leader.addr, "alice", "gone.bin").await?;
    assert!(!second.success);
    assert!(second.message.contains("does not exist"));
    Ok(())
}

#[tokio::test]
async fn upload_fails_cleanly_without_eligible_peers() -> Result<()> {
    let dir = TempDir::new()?;
    let cluster = start_cluster(dir.path(), "solo", 1, SHARD_LIMIT).await?;
    let leader = cluster.leader();

    // Self-counting: the node alone still counts as one active node.
    assert_eq!(leader.tracker.total_active_count(), 1);
    assert_eq!(leader.tracker.other_active_count(), 0);

    let ack = client_upload(&leader.addr, "alice", "lonely.txt", &test_bytes(10_000)).await?;
    assert!(!ack.success);
    assert!(
        ack.message.contains("no other nodes available"),
        "unexpected message: {}",
        ack.message
    );
    assert!(ack.message.contains("Total active: 1"));

    // No partial state became visible.
    assert!(leader
        .db
        .load_metadata(&file_key("alice", "lonely.txt"))?
        .is_none());
    assert!(client_list(&leader.addr, "alice").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn follower_rejects_whole_file_uploads() -> Result<()> {
    let dir = TempDir::new()?;
    let cluster = start_cluster(dir.path(), "rej", 3, SHARD_LIMIT).await?;
    let follower = &cluster.nodes[1];

    let ack = client_upload(&follower.addr, "alice", "wrong.txt", &test_bytes(5_000)).await?;
    assert!(!ack.success);
    assert!(ack.message.contains("Only leader"));
    Ok(())
}

#[tokio::test]
async fn downloads_populate_the_cache_and_hit_it_afterwards() -> Result<()> {
    let dir = TempDir::new()?;
    let cluster = start_cluster(dir.path(), "cache", 3, SHARD_LIMIT).await?;
    let leader = cluster.leader();

    let data = test_bytes(400_000);
    let ack = client_upload(&leader.addr, "carol", "hot.bin", &data).await?;
    assert!(ack.success, "{}", ack.message);

    let key = file_key("carol", "hot.bin");
    assert!(!leader.cache.contains(&key));

    let fetched = client_download(&leader.addr, "carol", "hot.bin").await?;
    assert_eq!(fetched, data);

    // The write-back is detached from the client response.
    {
        let cache = Arc::clone(&leader.cache);
        let key = key.clone();
        wait_for("cache write-back", move || cache.contains(&key)).await;
    }
    let artifact = leader.cache_dir.join(&key);
    assert!(artifact.exists());

    let cached = client_download(&leader.addr, "carol", "hot.bin").await?;
    assert_eq!(cached, data);
    assert!(leader.metrics.snapshot().cache_hits >= 1);

    // Deleting the file also destroys the cache entry and its artifact.
    let deleted = client_delete(&leader.addr, "carol", "hot.bin").await?;
    assert!(deleted.success);
    assert!(!leader.cache.contains(&key));
    assert!(!artifact.exists());
    Ok(())
}

#[tokio::test]
async fn supernode_routes_across_clusters_with_replica_fallback() -> Result<()> {
    let dir = TempDir::new()?;

    let sn_listener = TcpListener::bind("127.0.0.1:0").await?;
    let sn_addr = sn_listener.local_addr()?.to_string();
    let sn_db = Database::open(&dir.path().join("sn_db"))?;
    let router = Arc::new(SuperNode::new(
        sn_addr.clone(),
        sn_db.clone(),
        10,
        Arc::new(Metrics::new()),
    ));
    {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            let _ = router.serve(sn_listener).await;
        });
    }

    let alpha = start_cluster(dir.path(), "alpha", 3, SHARD_LIMIT).await?;
    let beta = start_cluster(dir.path(), "beta", 3, SHARD_LIMIT).await?;

    // Register both leaders the way the leadership agent would.
    let sn = PeerChannel::new(&sn_addr);
    for (cluster_name, cluster) in [("alpha", &alpha), ("beta", &beta)] {
        let (ip, port) = split_addr(&cluster.leader().addr);
        let ack = sn
            .call_for_ack(
                Request::RegisterLeader(ClusterInfo {
                    ip,
                    port,
                    cluster: cluster_name.to_string(),
                }),
                CALL_TIMEOUT,
            )
            .await?;
        assert!(ack.success);
    }
    assert_eq!(
        router.cluster_leader("alpha").as_deref(),
        Some(alpha.leader().addr.as_str())
    );
    assert_eq!(
        router.cluster_leader("beta").as_deref(),
        Some(beta.leader().addr.as_str())
    );

    let data = test_bytes(800_000);
    let ack = client_upload(&sn_addr, "bob", "b.bin", &data).await?;
    assert!(ack.success, "routed upload failed: {}", ack.message);

    // The router records which clusters hold the file.
    let key = file_key("bob", "b.bin");
    let (primary_cluster, replica_cluster) = match sn_db.load_metadata(&key)? {
        Some(MetaRef::Router {
            primary_cluster,
            replica_cluster,
        }) => (primary_cluster, replica_cluster.expect("replica cluster")),
        other => panic!("expected router metadata, got {:?}", other),
    };
    assert_ne!(primary_cluster, replica_cluster);

    // Duplicate uploads are rejected at the router by metadata presence.
    let again = client_upload(&sn_addr, "bob", "b.bin", &data).await?;
    assert!(!again.success);
    assert!(again.message.starts_with("File already exists"));

    let fetched = client_download(&sn_addr, "bob", "b.bin").await?;
    assert_eq!(fetched, data);

    let search = client_search(&sn_addr, "bob", "b.bin").await?;
    assert!(search.success);

    assert_eq!(client_list(&sn_addr, "bob").await?, vec!["b.bin"]);

    // Wait until cross-cluster replication completed, then take the
    // primary cluster's leader down; downloads must come from the
    // replica cluster intact.
    let primary = if primary_cluster == "alpha" {
        &alpha
    } else {
        &beta
    };
    let replica = if primary_cluster == "alpha" {
        &beta
    } else {
        &alpha
    };
    {
        let db = replica.leader().db.clone();
        let key = key.clone();
        wait_for("cross-cluster replication", move || {
            db.exists(&key).unwrap_or(false)
        })
        .await;
    }

    primary.leader().handle.abort();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let fallback = client_download(&sn_addr, "bob", "b.bin").await?;
    assert_eq!(fallback, data);

    // Delete through the router: the replica cluster serves it, the
    // router record disappears, further downloads report not found.
    let deleted = client_delete(&sn_addr, "bob", "b.bin").await?;
    assert!(deleted.success, "{}", deleted.message);
    assert!(sn_db.load_metadata(&key)?.is_none());
    assert!(client_list(&sn_addr, "bob").await?.is_empty());
    assert!(client_download(&sn_addr, "bob", "b.bin").await.is_err());
    Ok(())
}

#[tokio::test]
async fn leadership_agent_self_promotes_and_steps_down() -> Result<()> {
    let dir = TempDir::new()?;

    let sn_listener = TcpListener::bind("127.0.0.1:0").await?;
    let sn_addr = sn_listener.local_addr()?.to_string();
    let sn_db = Database::open(&dir.path().join("sn_db"))?;
    let sn_metrics = Arc::new(Metrics::new());
    let router = Arc::new(SuperNode::new(
        sn_addr.clone(),
        sn_db,
        10,
        Arc::clone(&sn_metrics),
    ));
    {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            let _ = router.serve(sn_listener).await;
        });
    }

    let mut config = Config::default();
    config.network.peer_table = dir.path().join("peers.txt");
    config.network.peer_table_fallback = dir.path().join("peers_local.txt");
    std::fs::write(&config.network.peer_table, "127.0.0.1:7701\n")?;

    let metrics = Arc::new(Metrics::new());
    let db = Database::open(&dir.path().join("node_db"))?;
    let tracker = Arc::new(MembershipTracker::new(
        "127.0.0.1:7701",
        &config.network,
        db.clone(),
        Arc::clone(&metrics),
    ));
    let consensus = Arc::new(ManualConsensus::new());
    let agent = Arc::new(LeadershipAgent::new(
        db.clone(),
        tracker,
        Arc::clone(&consensus) as Arc<dyn shardmesh::leadership::Consensus>,
        &sn_addr,
        "gamma",
        "127.0.0.1",
        7701,
        metrics,
    ));
    tokio::spawn(agent.run());

    // With no leader reported, the agent promotes itself and registers.
    {
        let db = db.clone();
        wait_for("self promotion", move || db.primary_status().unwrap_or(0) == 1).await;
    }
    {
        let router = Arc::clone(&router);
        wait_for("supernode registration", move || {
            router.cluster_leader("gamma").is_some()
        })
        .await;
    }
    assert_eq!(
        router.cluster_leader("gamma").as_deref(),
        Some("127.0.0.1:7701")
    );
    // Exactly the self-promotion announcement so far.
    assert_eq!(sn_metrics.snapshot().leader_registrations, 1);

    // Consensus reports a different leader: the agent steps down on one
    // of its reconciliation ticks.
    consensus.set_leader(Some("10.0.0.9:7000".to_string()), false);
    {
        let db = db.clone();
        wait_for("step down", move || db.primary_status().unwrap_or(1) == 0).await;
    }

    // The step-down must not re-announce the demoted node to the
    // supernode, neither on the demoting tick nor on later ones; only a
    // successor's registration may move the leader record forward.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(sn_metrics.snapshot().leader_registrations, 1);
    Ok(())
}
