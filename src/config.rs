use crate::error::{ConsensusError, Result};
use crate::MemberId;

/// Default number of entries shipped to a follower in a single append.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: MemberId,
    /// Every other voting member of the cluster.
    pub peers: Vec<MemberId>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_batch_size: usize,
    /// Capacity of the node's request/event channel.
    pub channel_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            channel_capacity: 1024,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: MemberId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: MemberId) -> Self {
        self.peers.push(node_id);
        self
    }

    pub fn with_peers(mut self, peers: impl IntoIterator<Item = MemberId>) -> Self {
        self.peers.extend(peers);
        self
    }

    /// All members of the cluster, this node included.
    pub fn members(&self) -> Vec<MemberId> {
        let mut members = Vec::with_capacity(self.peers.len() + 1);
        members.push(self.node_id);
        members.extend(self.peers.iter().copied());
        members
    }

    /// Number of remote acknowledgements needed for a majority.
    ///
    /// The local node always counts toward the majority, so this is
    /// `floor(members / 2)` rather than `floor(members / 2) + 1`.
    pub fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2
    }

    pub fn validate(&self) -> Result<()> {
        if self.peers.contains(&self.node_id) {
            return Err(ConsensusError::InvalidConfig(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }
        let mut peers = self.peers.clone();
        peers.sort_unstable();
        peers.dedup();
        if peers.len() != self.peers.len() {
            return Err(ConsensusError::InvalidConfig(
                "duplicate peer ids".to_string(),
            ));
        }
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(ConsensusError::InvalidConfig(format!(
                "invalid election timeout range {}..={}",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(ConsensusError::InvalidConfig(format!(
                "heartbeat interval {}ms must be non-zero and below the election timeout",
                self.heartbeat_interval_ms
            )));
        }
        if self.max_batch_size == 0 {
            return Err(ConsensusError::InvalidConfig(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConsensusError::InvalidConfig(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
