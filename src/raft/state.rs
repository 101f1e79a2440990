use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::NodeConfig;
use crate::error::{ConsensusError, Result};
use crate::log::Log;
use crate::raft::node::RaftMessage;
use crate::transport::Transport;
use crate::MemberId;

/// Applies a payload to the state built on top of the log.
///
/// Called with `Some(index)` for committed log entries and `None` for
/// read-only queries.
pub type Consumer = Box<dyn FnMut(Option<u64>, &[u8]) -> Result<Vec<u8>> + Send>;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RaftRole {
    /// Initial, inert state before the node is opened.
    Start,
    Follower,
    Candidate,
    Leader,
    Closed,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Start => write!(f, "start"),
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
            RaftRole::Closed => write!(f, "closed"),
        }
    }
}

/// Everything a node's active role reads and mutates.
///
/// Owned by the node task, so no field needs synchronization. Role
/// behaviors borrow it for the duration of a single message.
pub struct RaftState {
    pub id: MemberId,
    pub config: NodeConfig,

    pub current_term: u64,
    pub voted_for: Option<MemberId>,
    pub leader_id: Option<MemberId>,

    pub commit_index: u64,
    pub last_applied: u64,

    /// Bumped on every role transition. Asynchronous completions carry the
    /// epoch they were issued under and are dropped once it is stale.
    pub epoch: u64,

    pub log: Box<dyn Log>,
    consumer: Consumer,
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Sender<RaftMessage>,
}

impl RaftState {
    pub fn new(
        config: NodeConfig,
        log: Box<dyn Log>,
        consumer: Consumer,
        transport: Arc<dyn Transport>,
        events: mpsc::Sender<RaftMessage>,
    ) -> Self {
        Self {
            id: config.node_id,
            config,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            epoch: 0,
            log,
            consumer,
            transport,
            events,
        }
    }

    pub fn last_log_index(&self) -> Option<u64> {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Option<u64> {
        self.log.last_term()
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: Option<u64>, last_log_term: Option<u64>) -> bool {
        let our_last_term = self.last_log_term().unwrap_or(0);
        let our_last_index = self.last_log_index().unwrap_or(0);
        let last_log_term = last_log_term.unwrap_or(0);
        let last_log_index = last_log_index.unwrap_or(0);

        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Adopts `term` if it is newer than ours. Returns true if it was.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            true
        } else {
            false
        }
    }

    /// Starts a new term voting for ourselves.
    pub fn become_candidate(&mut self) {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
    }

    /// Applies the entry at `index` to the consumer and marks it applied,
    /// whether or not the consumer succeeds.
    pub fn apply_entry(&mut self, index: u64) -> Result<Vec<u8>> {
        let result = match self.log.get(index) {
            Some(entry) => (self.consumer)(Some(index), &entry.payload),
            None => Err(ConsensusError::Log(format!("no entry at index {}", index))),
        };
        self.last_applied = self.last_applied.max(index);
        result
    }

    /// Runs a read-only query against the consumer.
    pub fn apply_query(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        (self.consumer)(None, payload)
    }

    /// Applies every unapplied entry up to and including `through`.
    /// Returns the number of entries handed to the consumer.
    pub fn apply_through(&mut self, through: u64) -> usize {
        let mut count = 0;
        while self.last_applied < through {
            let index = self.last_applied + 1;
            if let Err(e) = self.apply_entry(index) {
                tracing::warn!(node_id = self.id, index, error = %e, "Failed to apply entry");
            }
            count += 1;
        }
        count
    }

    /// Learns a commit index from the leader and applies what became
    /// committed. The commit index never moves backwards.
    pub fn learn_commit_index(&mut self, commit_index: u64) {
        let bounded = commit_index.min(self.last_log_index().unwrap_or(0));
        if bounded > self.commit_index {
            self.commit_index = bounded;
            let applied = self.apply_through(bounded);
            tracing::debug!(
                node_id = self.id,
                commit_index = bounded,
                applied,
                "Advanced commit index"
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn replace_consumer(&mut self, consumer: Consumer) {
        self.consumer = consumer;
    }
}

impl std::fmt::Debug for RaftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftState")
            .field("id", &self.id)
            .field("current_term", &self.current_term)
            .field("voted_for", &self.voted_for)
            .field("leader_id", &self.leader_id)
            .field("commit_index", &self.commit_index)
            .field("last_applied", &self.last_applied)
            .field("epoch", &self.epoch)
            .field("last_log_index", &self.last_log_index())
            .finish()
    }
}
