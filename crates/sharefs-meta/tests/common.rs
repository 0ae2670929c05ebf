//! Common test utilities: an in-process cluster of instances joined by
//! simulated peer links.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sharefs_meta::{
    accept_peer, join_peer, CacheLog, Instance, LeaseConfig, MemoryStore, MetaConfig, PeerConfig,
    PeerOrdinal,
};
use sharefs_transport::SimLink;

/// Filesystem every test node mounts.
pub const FS_NAME: &str = "testfs";

/// Host name of a test node.
pub fn host_name(ordinal: u32) -> String {
    format!("node{ordinal}")
}

/// Configuration of node `ordinal` in a cluster of `nodes`, coordinated by
/// node 1. Leases are short and freeze polling is fast.
pub fn node_config(ordinal: u32, nodes: u32) -> MetaConfig {
    MetaConfig {
        fs_name: FS_NAME.to_string(),
        ordinal,
        host_name: host_name(ordinal),
        coordinator: 1,
        peers: (1..=nodes)
            .filter(|o| *o != ordinal)
            .map(|o| PeerConfig {
                ordinal: o,
                name: host_name(o),
                addr: format!("sim:{o}"),
            })
            .collect(),
        lease: LeaseConfig {
            read_secs: 2,
            write_secs: 2,
            append_secs: 2,
            stage_secs: 2,
            multi_host_write: false,
        },
        freeze_poll_ms: 20,
        request_timeout_secs: 5,
        ..Default::default()
    }
}

/// One started instance with its collaborators.
pub struct TestNode {
    pub instance: Arc<Instance>,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<CacheLog>,
}

impl TestNode {
    /// Builds and starts an instance on a fresh in-memory store.
    pub async fn start(config: MetaConfig) -> Self {
        Self::start_with_store(config, Arc::new(MemoryStore::new())).await
    }

    /// Builds and starts an instance on `store`.
    pub async fn start_with_store(config: MetaConfig, store: Arc<MemoryStore>) -> Self {
        let cache = Arc::new(CacheLog::new());
        let instance = Instance::new(config, store.clone(), cache.clone()).expect("valid config");
        instance.start().await.expect("instance starts");
        Self {
            instance,
            store,
            cache,
        }
    }
}

/// Fully meshed in-process cluster. Node 1 starts as coordinator.
pub struct TestCluster {
    nodes: Vec<TestNode>,
    links: HashMap<(u32, u32), Arc<SimLink>>,
}

impl TestCluster {
    /// Starts `size` nodes and connects every pair.
    pub async fn start(size: u32) -> Self {
        let mut nodes = Vec::new();
        for ordinal in 1..=size {
            nodes.push(TestNode::start(node_config(ordinal, size)).await);
        }
        let mut cluster = Self {
            nodes,
            links: HashMap::new(),
        };
        for low in 1..=size {
            for high in (low + 1)..=size {
                cluster.connect(low, high).await;
            }
        }
        cluster
    }

    /// Runs the handshake between two nodes; the higher ordinal dials.
    pub async fn connect(&mut self, low: u32, high: u32) {
        let (a, b) = SimLink::pair(&host_name(low), &host_name(high));
        let (a, b) = (Arc::new(a), Arc::new(b));
        let acceptor = self.instance(low).clone();
        let joiner = self.instance(high).clone();
        let (accepted, joined) = tokio::join!(
            accept_peer(&acceptor, a.clone()),
            join_peer(&joiner, b.clone()),
        );
        assert_eq!(accepted.expect("handshake accepted"), PeerOrdinal::new(high));
        assert_eq!(joined.expect("handshake joined"), PeerOrdinal::new(low));
        self.links.insert((low, high), a);
        self.links.insert((high, low), b);
    }

    /// Node by ordinal.
    pub fn node(&self, ordinal: u32) -> &TestNode {
        &self.nodes[(ordinal - 1) as usize]
    }

    /// Instance by ordinal.
    pub fn instance(&self, ordinal: u32) -> &Arc<Instance> {
        &self.node(ordinal).instance
    }

    /// The end of the link `from` uses to talk to `to`.
    pub fn link(&self, from: u32, to: u32) -> &Arc<SimLink> {
        &self.links[&(from, to)]
    }

    /// Ordinals of the nodes that believe they are the coordinator.
    pub fn servers(&self) -> Vec<u32> {
        self.nodes
            .iter()
            .filter(|n| n.instance.is_server())
            .map(|n| n.instance.local().as_u32())
            .collect()
    }

    /// Stops every node.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.instance.shutdown().await;
        }
    }
}

/// Polls `check` until it holds, failing the test after ten seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
