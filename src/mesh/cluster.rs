//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and gossip of per-node request logs. Every node
//! publishes only the requests it admitted itself; an admission sums the
//! live entries of all live nodes.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::ratelimit::log::{LogView, RequestLog};
use crate::ratelimit::store::RateLimitStore;
use crate::ratelimit::{LimitConfig, RateLimitDecision};

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "talktime".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// Gossip key for one identifier's state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogKey {
    /// Timestamps admitted by the publishing node
    Log(String),
    /// Time of the last reset issued by the publishing node
    Reset(String),
}

impl LogKey {
    /// Convert to a chitchat key string.
    /// Format: "log|{identifier}" or "reset|{identifier}".
    pub fn to_chitchat_key(&self) -> String {
        match self {
            LogKey::Log(identifier) => format!("log|{}", identifier),
            LogKey::Reset(identifier) => format!("reset|{}", identifier),
        }
    }

    /// Parse from a chitchat key string.
    pub fn from_chitchat_key(key: &str) -> Option<Self> {
        let (kind, identifier) = key.split_once('|')?;
        match kind {
            "log" => Some(LogKey::Log(identifier.to_string())),
            "reset" => Some(LogKey::Reset(identifier.to_string())),
            _ => None,
        }
    }
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    /// Identifiers this node has written state for.
    published: parking_lot::Mutex<HashSet<String>>,
    config: ClusterConfig,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> std::result::Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            published: parking_lot::Mutex::new(HashSet::new()),
            config,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the chitchat handle for direct access.
    pub fn chitchat(&self) -> Arc<Mutex<Chitchat>> {
        self.handle.chitchat()
    }

    /// Latest reset time for an identifier across all live nodes.
    fn reset_marker(&self, chitchat: &Chitchat, identifier: &str) -> u64 {
        let key = LogKey::Reset(identifier.to_string()).to_chitchat_key();
        chitchat
            .live_nodes()
            .filter_map(|id| chitchat.node_state(id))
            .filter_map(|state| state.get(&key))
            .filter_map(|value| value.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
    }

    /// Live entries published by every other live node.
    fn remote_view(
        &self,
        chitchat: &Chitchat,
        identifier: &str,
        now_ms: u64,
        window_ms: u64,
        marker_ms: u64,
    ) -> LogView {
        let key = LogKey::Log(identifier.to_string()).to_chitchat_key();
        chitchat
            .live_nodes()
            .filter(|id| id.node_id != self.node_id)
            .filter_map(|id| chitchat.node_state(id))
            .filter_map(|state| state.get(&key))
            .map(|value| RequestLog::decode(value).view_since(now_ms, window_ms, marker_ms))
            .fold(LogView::default(), LogView::merge)
    }

    /// Our own published log for an identifier.
    fn local_log(chitchat: &mut Chitchat, identifier: &str) -> RequestLog {
        let key = LogKey::Log(identifier.to_string()).to_chitchat_key();
        chitchat
            .self_node_state()
            .get(&key)
            .map(|value| RequestLog::decode(value))
            .unwrap_or_default()
    }

    /// Tombstone one of our keys; chitchat drops it after the grace period.
    fn delete_key(chitchat: &mut Chitchat, key: &str) {
        let state = chitchat.self_node_state();
        if state.get(key).is_some() {
            state.delete(key);
        }
    }

    /// Number of keys this node currently publishes.
    pub async fn published_key_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        chitchat.self_node_state().num_key_values()
    }

    /// Total live requests for an identifier across the cluster.
    pub async fn live_count(&self, identifier: &str, now_ms: u64, window_ms: u64) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let marker = self.reset_marker(&chitchat, identifier);
        let remote = self.remote_view(&chitchat, identifier, now_ms, window_ms, marker);
        let local = Self::local_log(&mut chitchat, identifier).view_since(now_ms, window_ms, marker);
        local.merge(remote).count
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> std::result::Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for Cluster {
    async fn admit(
        &self,
        identifier: &str,
        now_ms: u64,
        limits: &LimitConfig,
    ) -> Result<RateLimitDecision> {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let window_ms = limits.window_ms();

        let marker = self.reset_marker(&chitchat, identifier);
        let remote = self.remote_view(&chitchat, identifier, now_ms, window_ms, marker);

        let mut local = Self::local_log(&mut chitchat, identifier);
        local.discard_before(marker);
        let decision = local.admit_with(now_ms, limits, remote);

        let key = LogKey::Log(identifier.to_string()).to_chitchat_key();
        chitchat.self_node_state().set(&key, local.encode());
        self.published.lock().insert(identifier.to_string());

        debug!(
            key = %key,
            local_entries = local.len(),
            remote_entries = remote.count,
            allowed = decision.allowed,
            "Recorded cluster admission"
        );

        Ok(decision)
    }

    async fn reset(&self, identifier: &str, now_ms: u64) -> Result<()> {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let log_key = LogKey::Log(identifier.to_string()).to_chitchat_key();
        let reset_key = LogKey::Reset(identifier.to_string()).to_chitchat_key();
        Self::delete_key(&mut chitchat, &log_key);
        chitchat.self_node_state().set(&reset_key, now_ms.to_string());
        self.published.lock().insert(identifier.to_string());

        debug!(identifier = %identifier, marker = now_ms, "Published cluster reset");
        Ok(())
    }

    async fn sweep(&self, now_ms: u64, limits: &LimitConfig) -> Result<usize> {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let window_ms = limits.window_ms();
        let identifiers: Vec<String> = self.published.lock().iter().cloned().collect();
        let mut evicted = 0;

        for identifier in identifiers {
            let log_key = LogKey::Log(identifier.clone()).to_chitchat_key();
            let reset_key = LogKey::Reset(identifier.clone()).to_chitchat_key();

            let mut local = Self::local_log(&mut chitchat, &identifier);
            local.prune(now_ms, window_ms);
            if local.is_empty() {
                Self::delete_key(&mut chitchat, &log_key);
            } else {
                chitchat.self_node_state().set(&log_key, local.encode());
            }

            // A marker older than the window no longer hides any live entry.
            let marker_live = chitchat
                .self_node_state()
                .get(&reset_key)
                .and_then(|value| value.parse::<u64>().ok())
                .is_some_and(|marker| now_ms.saturating_sub(marker) < window_ms);
            if !marker_live {
                Self::delete_key(&mut chitchat, &reset_key);
            }

            if local.is_empty() && !marker_live {
                self.published.lock().remove(&identifier);
                evicted += 1;
            }
        }

        debug!(evicted, "Swept cluster state");
        Ok(evicted)
    }

    fn name(&self) -> &'static str {
        "cluster"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_log_key() {
        let key = LogKey::Log("user:123".to_string());
        assert_eq!(key.to_chitchat_key(), "log|user:123");
        assert_eq!(LogKey::from_chitchat_key("log|user:123"), Some(key));

        let key = LogKey::Reset("a|b".to_string());
        assert_eq!(key.to_chitchat_key(), "reset|a|b");
        assert_eq!(LogKey::from_chitchat_key("reset|a|b"), Some(key));
    }

    #[test]
    fn test_log_key_parsing_invalid() {
        assert!(LogKey::from_chitchat_key("invalid").is_none());
        assert!(LogKey::from_chitchat_key("counter|a").is_none());
    }

    #[tokio::test]
    async fn test_cluster_start() {
        let cluster = Cluster::start(test_config(17946)).await.unwrap();

        assert_eq!(cluster.node_id(), "test-node-17946");
        assert_eq!(cluster.live_node_count().await, 1); // Just ourselves

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_admission_and_reset() {
        let cluster = Cluster::start(test_config(17947)).await.unwrap();
        let limits = LimitConfig::new(1_000, 2).unwrap();

        assert_eq!(
            cluster.admit("caller", 10_000, &limits).await.unwrap(),
            RateLimitDecision::allowed(1, 1_000)
        );
        assert_eq!(
            cluster.admit("caller", 10_100, &limits).await.unwrap(),
            RateLimitDecision::allowed(0, 900)
        );
        assert!(!cluster.admit("caller", 10_500, &limits).await.unwrap().allowed);
        assert_eq!(cluster.live_count("caller", 10_500, 1_000).await, 2);

        cluster.reset("caller", 10_600).await.unwrap();
        assert_eq!(cluster.live_count("caller", 10_600, 1_000).await, 0);
        assert_eq!(
            cluster.admit("caller", 10_600, &limits).await.unwrap(),
            RateLimitDecision::allowed(1, 1_000)
        );

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_sweep() {
        let cluster = Cluster::start(test_config(17950)).await.unwrap();
        let limits = LimitConfig::new(1_000, 5).unwrap();

        cluster.admit("old", 10_000, &limits).await.unwrap();
        cluster.admit("fresh", 10_800, &limits).await.unwrap();

        assert_eq!(cluster.sweep(11_200, &limits).await.unwrap(), 1);
        assert_eq!(cluster.live_count("old", 11_200, 1_000).await, 0);
        assert_eq!(cluster.live_count("fresh", 11_200, 1_000).await, 1);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_sweep_removes_gossip_keys() {
        let cluster = Cluster::start(test_config(17951)).await.unwrap();
        let limits = LimitConfig::new(1_000, 5).unwrap();
        let baseline = cluster.published_key_count().await;

        for i in 0..100 {
            cluster.admit(&format!("caller-{}", i), 10_000, &limits).await.unwrap();
        }
        cluster.reset("caller-0", 10_500).await.unwrap();
        assert_eq!(cluster.published_key_count().await, baseline + 100);

        assert_eq!(cluster.sweep(20_000, &limits).await.unwrap(), 100);
        assert_eq!(cluster.published_key_count().await, baseline);

        // Evicted identifiers start over.
        assert_eq!(
            cluster.admit("caller-1", 20_000, &limits).await.unwrap(),
            RateLimitDecision::allowed(4, 1_000)
        );
        assert_eq!(cluster.published_key_count().await, baseline + 1);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_sweep_keeps_live_reset_marker() {
        let cluster = Cluster::start(test_config(17952)).await.unwrap();
        let limits = LimitConfig::new(1_000, 5).unwrap();
        let baseline = cluster.published_key_count().await;

        cluster.admit("caller", 10_000, &limits).await.unwrap();
        cluster.reset("caller", 10_900).await.unwrap();

        assert_eq!(cluster.sweep(11_500, &limits).await.unwrap(), 0);
        assert_eq!(cluster.published_key_count().await, baseline + 1);

        assert_eq!(cluster.sweep(12_000, &limits).await.unwrap(), 1);
        assert_eq!(cluster.published_key_count().await, baseline);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_two_nodes_share_quota() {
        let cluster1 = Cluster::start(test_config(17948)).await.unwrap();

        let mut config2 = test_config(17949);
        config2.seed_nodes = vec!["127.0.0.1:17948".to_string()];
        let cluster2 = Cluster::start(config2).await.unwrap();

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(cluster1.live_node_count().await, 2);
        assert_eq!(cluster2.live_node_count().await, 2);

        let limits = LimitConfig::new(60_000, 3).unwrap();
        let now = 1_000_000;

        assert!(cluster1.admit("shared", now, &limits).await.unwrap().allowed);
        assert!(cluster1.admit("shared", now + 1, &limits).await.unwrap().allowed);

        // Give time for gossip
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(cluster2.live_count("shared", now + 2, 60_000).await, 2);
        let decision = cluster2.admit("shared", now + 2, &limits).await.unwrap();
        assert_eq!(decision.remaining, 0);
        assert!(!cluster2.admit("shared", now + 3, &limits).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!cluster1.admit("shared", now + 4, &limits).await.unwrap().allowed);

        cluster1.shutdown().await.unwrap();
        cluster2.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_reset_on_peer_clears_quota() {
        let cluster1 = Cluster::start(test_config(17953)).await.unwrap();

        let mut config2 = test_config(17954);
        config2.seed_nodes = vec!["127.0.0.1:17953".to_string()];
        let cluster2 = Cluster::start(config2).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(cluster1.live_node_count().await, 2);

        let limits = LimitConfig::new(60_000, 2).unwrap();
        let now = 1_000_000;

        assert!(cluster1.admit("shared", now, &limits).await.unwrap().allowed);
        assert!(cluster1.admit("shared", now + 1, &limits).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!cluster2.admit("shared", now + 2, &limits).await.unwrap().allowed);

        // The marker from node 2 hides node 1's own entries once gossiped.
        cluster2.reset("shared", now + 3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(cluster1.live_count("shared", now + 4, 60_000).await, 0);
        assert_eq!(
            cluster1.admit("shared", now + 4, &limits).await.unwrap(),
            RateLimitDecision::allowed(1, 60_000)
        );

        cluster1.shutdown().await.unwrap();
        cluster2.shutdown().await.unwrap();
    }
}
