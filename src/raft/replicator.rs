//! Drives replication to every follower and tracks the commit index.

use std::sync::Arc;

use crate::error::{ConsensusError, TransportError};
use crate::protocol::{AppendResponse, PingResponse};
use crate::raft::pending::{PendingRegistry, PendingResult, ResultReceiver};
use crate::raft::quorum::Quorum;
use crate::raft::replica::{Progress, Replica};
use crate::raft::state::RaftState;
use crate::MemberId;

/// Highest index stored on at least `quorum` replicas.
///
/// Returns `None` when fewer than `quorum` replicas exist or when that
/// index is 0.
pub fn quorum_match_index(match_indexes: &[u64], quorum: usize) -> Option<u64> {
    if quorum == 0 || match_indexes.len() < quorum {
        return None;
    }
    let mut sorted = match_indexes.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let index = sorted[quorum - 1];
    (index > 0).then_some(index)
}

#[derive(Debug)]
pub struct Replicator {
    replicas: Vec<Replica>,
    quorum: usize,
    commits: PendingRegistry,
}

impl Replicator {
    pub fn new(state: &RaftState) -> Self {
        Self {
            replicas: state.config.peers.iter().map(|id| Replica::new(*id)).collect(),
            quorum: state.config.quorum_size(),
            commits: PendingRegistry::new(),
        }
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum
    }

    pub fn replica(&self, member: MemberId) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.member() == member)
    }

    /// Confirms with a quorum that this node is still leader through the
    /// last log index.
    pub fn ping_all(&mut self, state: &RaftState) -> ResultReceiver {
        self.ping(state, state.log.last_index())
    }

    pub fn ping(&mut self, state: &RaftState, index: Option<u64>) -> ResultReceiver {
        let (pending, rx) = PendingResult::new();
        let quorum = self.new_quorum(pending, index.unwrap_or(0));
        for replica in &mut self.replicas {
            count_vote(replica.ping(state, index), quorum.clone());
        }
        rx
    }

    /// Replicates through the last log index.
    pub fn commit_all(&mut self, state: &mut RaftState) -> ResultReceiver {
        let last_index = state.log.last_index();
        self.commit(state, last_index)
    }

    /// Resolves once `index` is stored on a majority and the commit index
    /// has reached it.
    pub fn commit(&mut self, state: &mut RaftState, index: Option<u64>) -> ResultReceiver {
        let Some(index) = index else {
            return self.ping(state, None);
        };

        let (pending, rx) = PendingResult::new();
        self.commits.insert(index, pending.clone());
        let quorum = self.new_quorum(pending, index);
        for replica in &mut self.replicas {
            count_vote(replica.commit(state, index), quorum.clone());
        }

        if self.replicas.is_empty() {
            self.advance_commit_index(state, index);
        } else {
            self.check_commits(state);
        }
        rx
    }

    /// Returns a newer term if the follower reported one.
    pub fn handle_ping_result(
        &mut self,
        state: &RaftState,
        member: MemberId,
        index: Option<u64>,
        result: Result<PingResponse, TransportError>,
    ) -> Option<u64> {
        let replica = self.replicas.iter_mut().find(|r| r.member() == member)?;
        match replica.handle_ping_result(state, index, result) {
            Progress::HigherTerm(term) => Some(term),
            _ => None,
        }
    }

    /// Returns a newer term if the follower reported one.
    pub fn handle_append_result(
        &mut self,
        state: &mut RaftState,
        member: MemberId,
        start: u64,
        end: u64,
        prev_index: Option<u64>,
        result: Result<AppendResponse, TransportError>,
    ) -> Option<u64> {
        let replica = self.replicas.iter_mut().find(|r| r.member() == member)?;
        match replica.handle_append_result(state, start, end, prev_index, result) {
            Progress::HigherTerm(term) => Some(term),
            Progress::Matched(_) => {
                self.check_commits(state);
                None
            }
            Progress::Unchanged => None,
        }
    }

    /// Fails every outstanding waiter on this replicator and its replicas.
    pub fn close(&mut self, error: &ConsensusError) {
        for replica in &mut self.replicas {
            replica.close(error);
        }
        self.commits.fail_all(error);
    }

    fn check_commits(&mut self, state: &mut RaftState) {
        let matched: Vec<u64> = self
            .replicas
            .iter()
            .map(|r| r.match_index().unwrap_or(0))
            .collect();
        if let Some(commit_index) = quorum_match_index(&matched, self.quorum) {
            self.advance_commit_index(state, commit_index);
        }
    }

    fn advance_commit_index(&mut self, state: &mut RaftState, commit_index: u64) {
        if commit_index > state.commit_index {
            state.commit_index = commit_index;
            tracing::debug!(node_id = state.id, commit_index, "Advanced commit index");
        }
        self.commits.resolve_through(state.commit_index, |k| k);
    }

    fn new_quorum(&self, pending: PendingResult, index: u64) -> Arc<Quorum> {
        Arc::new(Quorum::new(
            self.quorum,
            self.replicas.len(),
            move |succeeded| {
                if succeeded {
                    pending.complete(Ok(index));
                } else {
                    pending.complete(Err(ConsensusError::QuorumUnreachable));
                }
            },
        ))
    }
}

fn count_vote(rx: ResultReceiver, quorum: Arc<Quorum>) {
    tokio::spawn(async move {
        match rx.await {
            Ok(Ok(_)) => quorum.succeed(),
            _ => quorum.fail(),
        }
    });
}
