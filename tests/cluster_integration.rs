//! End-to-end tests against in-process clusters of metadata replicas and chunk servers.

#[allow(dead_code)]
mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use blockfs::client::http::{build_client, post_json};
use blockfs::metadata::operations::{CreateRequest, CreateResponse};
use blockfs::metadata::MetadataState;
use blockfs::{BlockFsError, BlockId, FileInfo};

use common::{eventually, pattern, TestCluster, BLOCK_SIZE, REPLICA_FACTOR, WAIT};

fn file_blocks(state: &MetadataState, path: &str) -> Vec<BlockId> {
    state
        .namespace
        .get(path)
        .map(|entry| entry.blocks.clone())
        .unwrap_or_default()
}

/// Addresses holding a valid copy of `block`.
fn valid_addrs(state: &MetadataState, block: &BlockId) -> BTreeSet<String> {
    state
        .replicas
        .addrs_with_validity(block, true)
        .into_iter()
        .collect()
}

// =============================================================================
// Data path
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_put_get_round_trip() {
    let cluster = TestCluster::start(3, 3).await;
    let client = cluster.client();
    let data = pattern(200);

    client.mkdir("/doc/").await.unwrap();
    client.put_bytes("/doc/readme", &data).await.unwrap();

    let state = cluster.leader_state().await.unwrap();
    let blocks = file_blocks(&state, "/doc/readme");
    assert_eq!(blocks.len() as u64, 200u64.div_ceil(BLOCK_SIZE));
    for block in &blocks {
        assert_eq!(valid_addrs(&state, block).len(), REPLICA_FACTOR);
    }

    assert_eq!(client.get_bytes("/doc/readme").await.unwrap(), data);

    let listing = client.list("/doc/").await.unwrap();
    assert_eq!(
        listing,
        vec![
            FileInfo {
                name: "/doc/".into(),
                size: 0
            },
            FileInfo {
                name: "/doc/readme".into(),
                size: 200
            },
        ]
    );

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_file_round_trip() {
    let cluster = TestCluster::start(1, 3).await;
    let client = cluster.client();
    let dir = tempfile::TempDir::new().unwrap();
    let source = dir.path().join("source");
    let target = dir.path().join("target");
    std::fs::write(&source, pattern(130)).unwrap();

    client.put(&source, "/blob").await.unwrap();
    client.get("/blob", &target).await.unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), pattern(130));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_file() {
    let cluster = TestCluster::start(1, 3).await;
    let client = cluster.client();

    client.put_bytes("/empty", &[]).await.unwrap();
    assert!(client.get_bytes("/empty").await.unwrap().is_empty());
    assert_eq!(client.stat("/empty").await.unwrap().size, 0);

    client.remove("/empty").await.unwrap();
    assert!(matches!(
        client.stat("/empty").await,
        Err(BlockFsError::NotFound(_))
    ));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_put_rejects_existing_path() {
    let cluster = TestCluster::start(1, 3).await;
    let client = cluster.client();

    client.put_bytes("/a", b"first").await.unwrap();
    let result = client.put_bytes("/a", b"second").await;
    assert!(matches!(result, Err(BlockFsError::AlreadyExists(_))));
    assert_eq!(client.get_bytes("/a").await.unwrap(), b"first");

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_insufficient_chunk_servers() {
    let cluster = TestCluster::start(1, 2).await;
    let client = cluster.client();

    let result = client.put_bytes("/a", &pattern(10)).await;
    assert!(matches!(
        result,
        Err(BlockFsError::InsufficientReplicas { need: 3, have: 2 })
    ));
    assert!(matches!(client.stat("/a").await, Err(BlockFsError::NotFound(_))));

    cluster.shutdown().await;
}

// =============================================================================
// Namespace
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stat_is_idempotent() {
    let cluster = TestCluster::start(3, 3).await;
    let client = cluster.client();
    client.put_bytes("/a", &pattern(200)).await.unwrap();

    let first = client.stat("/a").await.unwrap();
    let second = client.stat("/a").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.size, 200);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rename_moves_contents() {
    let cluster = TestCluster::start(1, 3).await;
    let client = cluster.client();
    client.mkdir("/x/").await.unwrap();
    client.put_bytes("/a", &pattern(100)).await.unwrap();
    client.put_bytes("/b", b"other").await.unwrap();

    client.rename("/a", "/x/a").await.unwrap();
    assert_eq!(client.get_bytes("/x/a").await.unwrap(), pattern(100));
    assert!(matches!(client.stat("/a").await, Err(BlockFsError::NotFound(_))));

    // Existing targets are never overwritten.
    let result = client.rename("/b", "/x/a").await;
    assert!(matches!(result, Err(BlockFsError::AlreadyExists(_))));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_directory_operations() {
    let cluster = TestCluster::start(1, 3).await;
    let client = cluster.client();

    assert!(matches!(
        client.mkdir("/missing/child/").await,
        Err(BlockFsError::NotFound(_))
    ));
    client.mkdir("/d/").await.unwrap();
    client.mkdir("/d/e/").await.unwrap();
    assert!(matches!(client.mkdir("/d/").await, Err(BlockFsError::AlreadyExists(_))));

    let names: Vec<String> = client
        .list("/")
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.name)
        .collect();
    assert_eq!(names, vec!["/", "/d/", "/d/e/"]);

    assert!(matches!(
        client.get_bytes("/d/").await,
        Err(BlockFsError::InvalidOperation(_))
    ));

    cluster.shutdown().await;
}

// =============================================================================
// Remove
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_tombstones_file() {
    let cluster = TestCluster::start(3, 3).await;
    let client = cluster.client();
    client.put_bytes("/a", &pattern(200)).await.unwrap();
    let blocks = file_blocks(&cluster.leader_state().await.unwrap(), "/a");

    client.remove("/a").await.unwrap();

    assert!(matches!(client.get_bytes("/a").await, Err(BlockFsError::NotFound(_))));
    assert!(matches!(client.remove("/a").await, Err(BlockFsError::NotFound(_))));

    let state = cluster.leader_state().await.unwrap();
    assert!(!state.namespace.contains("/a"));
    for block in &blocks {
        assert!(state.replicas.replicas(block).is_none());
    }
    for node in cluster.chunks.iter().flatten() {
        assert_eq!(node.handle.server().store().block_count(), 0);
    }

    // The path is free again.
    client.put_bytes("/a", b"again").await.unwrap();
    assert_eq!(client.get_bytes("/a").await.unwrap(), b"again");

    cluster.shutdown().await;
}

// =============================================================================
// Leadership
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_refuses_mutations() {
    let cluster = TestCluster::start(3, 3).await;
    let followers = cluster.followers().await;
    let follower = followers.first().expect("no follower");

    let http = build_client(Duration::from_secs(1), Duration::from_secs(5));
    let result: blockfs::Result<CreateResponse> = post_json(
        &http,
        &follower.addr,
        "metadata/create",
        &CreateRequest {
            path: "/refused".into(),
            size: 10,
        },
    )
    .await;
    assert!(matches!(result, Err(BlockFsError::NotLeader { .. })));

    let follower_state = follower.server.service().state().await;
    assert!(!follower_state.namespace.contains("/refused"));
    let leader_state = cluster.leader_state().await.unwrap();
    assert!(!leader_state.namespace.contains("/refused"));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_followers_catch_up_for_reads() {
    let cluster = TestCluster::start(3, 3).await;
    let client = cluster.client();
    client.put_bytes("/a", &pattern(70)).await.unwrap();

    let followers = cluster.followers().await;
    for follower in followers {
        let service = follower.server.service();
        let caught_up = eventually(WAIT, || async move {
            service.state().await.namespace.contains("/a")
        })
        .await;
        assert!(caught_up, "follower {} never saw /a", follower.addr);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_failover_keeps_files() {
    let mut cluster = TestCluster::start(3, 3).await;
    let client = cluster.client();
    client.put_bytes("/a", &pattern(150)).await.unwrap();

    let old_leader = cluster.kill_leader().await;
    let view = &cluster;
    assert!(
        eventually(WAIT, || async move { view.leader().await.is_some() }).await,
        "no new leader after {} stopped",
        old_leader
    );

    assert_eq!(client.get_bytes("/a").await.unwrap(), pattern(150));
    client.put_bytes("/b", b"after failover").await.unwrap();
    assert_eq!(client.stat("/b").await.unwrap().size, 14);

    cluster.shutdown().await;
}

// =============================================================================
// Chunk server failures
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dead_chunk_server_is_transparent() {
    let mut cluster = TestCluster::start(3, 4).await;
    let client = cluster.client();
    let data = pattern(200);
    client.put_bytes("/a", &data).await.unwrap();

    let state = cluster.leader_state().await.unwrap();
    let blocks = file_blocks(&state, "/a");
    let holder = valid_addrs(&state, &blocks[0])
        .into_iter()
        .next()
        .expect("block 0 has no replica");
    let index = cluster
        .chunk_addrs()
        .iter()
        .position(|addr| *addr == holder)
        .unwrap();
    let dead = cluster.kill_chunk_server(index).await;

    assert_eq!(client.get_bytes("/a").await.unwrap(), data);

    let view = &cluster;
    let dead_ref = dead.as_str();
    let blocks_ref = &blocks;
    let migrated = eventually(WAIT, || async move {
        let Some(state) = view.leader_state().await else {
            return false;
        };
        state.replicas.loc_of(dead_ref).is_none()
            && blocks_ref.iter().all(|block| {
                let addrs = valid_addrs(&state, block);
                addrs.len() == REPLICA_FACTOR && !addrs.contains(dead_ref)
            })
    })
    .await;
    assert!(migrated, "replicas never left {}", dead);

    assert_eq!(client.get_bytes("/a").await.unwrap(), data);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reregistration_gets_new_loc() {
    let cluster = TestCluster::start(1, 3).await;
    let client = cluster.client();
    client.put_bytes("/a", &pattern(100)).await.unwrap();

    let addr = cluster.chunk_addrs()[0].clone();
    let before = cluster.leader_state().await.unwrap();
    let old_loc = before.replicas.loc_of(&addr).unwrap();

    let registered = client.metadata().register(&addr).await.unwrap();
    assert!(registered.loc > old_loc);
    assert_eq!(registered.block_size, BLOCK_SIZE);

    let after = cluster.leader_state().await.unwrap();
    assert_eq!(after.replicas.loc_of(&addr), Some(registered.loc));
    assert!(after.replicas.addr_of(old_loc).is_none());
    for block in file_blocks(&after, "/a") {
        let replicas = after.replicas.replicas(&block).unwrap();
        assert!(!replicas.contains_key(&old_loc));
        assert_eq!(replicas.get(&registered.loc), Some(&true));
    }

    assert_eq!(client.get_bytes("/a").await.unwrap(), pattern(100));

    cluster.shutdown().await;
}
