//! In-process cluster of nodes wired over a [`LocalNetwork`].

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{ConsensusError, Result};
use crate::log::MemoryLog;
use crate::raft::{Consumer, NodeHandle, NodeStatus, RaftNode, RaftRole};
use crate::transport::LocalNetwork;
use crate::MemberId;

pub struct LocalCluster {
    network: LocalNetwork,
    nodes: BTreeMap<MemberId, NodeHandle>,
    shutdown: CancellationToken,
}

impl LocalCluster {
    /// Starts and opens nodes `1..=size`.
    ///
    /// Every node takes its timing and batching settings from `base`;
    /// `consumer` builds the state each node applies entries to. Cancelling
    /// `shutdown` stops every node, as does dropping the cluster.
    pub async fn start(
        size: u64,
        base: &NodeConfig,
        mut consumer: impl FnMut(MemberId) -> Consumer,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        if size == 0 {
            return Err(ConsensusError::InvalidConfig(
                "a cluster needs at least one node".to_string(),
            ));
        }

        let shutdown = shutdown.child_token();
        let network = LocalNetwork::new();
        let members: Vec<MemberId> = (1..=size).collect();
        let mut nodes = BTreeMap::new();

        for id in &members {
            let config = NodeConfig {
                node_id: *id,
                peers: members.iter().copied().filter(|m| m != id).collect(),
                ..base.clone()
            };
            let handle = RaftNode::spawn(
                config,
                Box::new(MemoryLog::new()),
                consumer(*id),
                network.transport(*id),
                shutdown.child_token(),
            )?;
            network.register(handle.clone());
            nodes.insert(*id, handle);
        }

        for handle in nodes.values() {
            handle.open().await?;
        }

        tracing::info!(nodes = size, "Started local cluster");

        Ok(Self {
            network,
            nodes,
            shutdown,
        })
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    pub fn node(&self, id: MemberId) -> Option<&NodeHandle> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeHandle> {
        self.nodes.values()
    }

    /// Status of every node that is still running.
    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses = Vec::with_capacity(self.nodes.len());
        for handle in self.nodes.values() {
            if let Ok(status) = handle.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// The leader of the highest term any running node reports.
    pub async fn leader(&self) -> Option<MemberId> {
        self.statuses()
            .await
            .into_iter()
            .filter(|s| s.role == RaftRole::Leader)
            .max_by_key(|s| s.term)
            .map(|s| s.id)
    }

    /// Polls until some node is leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<MemberId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConsensusError::Internal(format!(
                    "no leader elected within {:?}",
                    timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Closes one node and removes it from the network.
    pub async fn stop_node(&mut self, id: MemberId) -> Result<()> {
        self.network.deregister(id);
        match self.nodes.remove(&id) {
            Some(handle) => handle.close().await,
            None => Ok(()),
        }
    }

    pub fn shutdown(&self) {
        tracing::info!("Shutting down local cluster");
        self.shutdown.cancel();
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
