//! Leader role: accepts client operations and drives replication.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{ConsensusError, Result, TransportError};
use crate::log::LogEntry;
use crate::protocol::{
    AppendResponse, CommitRequest, CommitResponse, Consistency, OperationResponse, PingResponse,
    QueryRequest, QueryResponse,
};
use crate::raft::node::RaftMessage;
use crate::raft::pending::ResultReceiver;
use crate::raft::replicator::Replicator;
use crate::raft::rpc;
use crate::raft::state::RaftState;
use crate::raft::timer::HeartbeatTimer;
use crate::MemberId;

#[derive(Debug)]
pub struct LeaderState {
    replicator: Replicator,
    heartbeat: HeartbeatTimer,
    /// Consumer outputs of applied entries whose commit has not been answered yet.
    outputs: BTreeMap<u64, Result<Vec<u8>>>,
    /// Unapplied entries whose commit was already answered with an error.
    answered: BTreeSet<u64>,
}

impl LeaderState {
    /// Takes over leadership for the current term.
    ///
    /// Announces leadership with an immediate round of pings, applies any
    /// entries left unapplied from earlier terms and starts the heartbeat.
    pub fn open(state: &mut RaftState) -> Self {
        let mut replicator = Replicator::new(state);
        drop(replicator.ping_all(state));
        state.leader_id = Some(state.id);

        if let Some(last_index) = state.last_log_index() {
            let replayed = state.apply_through(last_index);
            if replayed > 0 {
                tracing::debug!(node_id = state.id, replayed, "Applied entries from earlier terms");
            }
        }

        let heartbeat = HeartbeatTimer::start(
            Duration::from_millis(state.config.heartbeat_interval_ms),
            state.events.clone(),
            state.epoch,
        );

        tracing::info!(
            node_id = state.id,
            term = state.current_term,
            quorum = replicator.quorum_size(),
            "Became leader"
        );

        Self {
            replicator,
            heartbeat,
            outputs: BTreeMap::new(),
            answered: BTreeSet::new(),
        }
    }

    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    pub fn heartbeat(&mut self, state: &RaftState) {
        drop(self.replicator.ping_all(state));
    }

    pub fn query(
        &mut self,
        state: &mut RaftState,
        request: QueryRequest,
        response_tx: oneshot::Sender<QueryResponse>,
    ) {
        match request.consistency {
            Consistency::Weak | Consistency::Default => {
                let _ = response_tx.send(rpc::local_query(state, &request));
            }
            Consistency::Strong => {
                let confirmed = self.replicator.ping_all(state);
                let events = state.events.clone();
                let epoch = state.epoch;
                tokio::spawn(async move {
                    let result = await_result(confirmed).await;
                    let _ = events
                        .send(RaftMessage::QueryConfirmed {
                            epoch,
                            request,
                            result,
                            response_tx,
                        })
                        .await;
                });
            }
        }
    }

    pub fn commit(
        &mut self,
        state: &mut RaftState,
        request: CommitRequest,
        response_tx: oneshot::Sender<CommitResponse>,
    ) {
        let entry = LogEntry::new(state.current_term, request.payload.clone());
        let index = match state.log.append(entry) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(node_id = state.id, error = %e, "Failed to append to log");
                let _ = response_tx.send(OperationResponse::error(request.id, state.id, &e));
                return;
            }
        };
        tracing::debug!(node_id = state.id, index, term = state.current_term, "Appended entry");

        let replicated = self.replicator.commit(state, Some(index));
        let events = state.events.clone();
        let epoch = state.epoch;
        tokio::spawn(async move {
            let result = await_result(replicated).await;
            let _ = events
                .send(RaftMessage::CommitReplicated {
                    epoch,
                    index,
                    request,
                    result,
                    response_tx,
                })
                .await;
        });
    }

    /// Applies a replicated entry and builds the client response.
    ///
    /// Entries reach the consumer in index order. Replication results can
    /// arrive out of order, so outputs of entries applied on the way to a
    /// later index are kept until their own result comes in. A failed
    /// replication leaves the entry unapplied; it is applied once a later
    /// commit covers it.
    pub fn complete_commit(
        &mut self,
        state: &mut RaftState,
        index: u64,
        request: &CommitRequest,
        result: Result<u64>,
    ) -> CommitResponse {
        let outcome = match result {
            Ok(_) if index > state.last_applied => {
                let mut output = Err(ConsensusError::Internal(format!(
                    "entry {} was not applied",
                    index
                )));
                while state.last_applied < index {
                    let next = state.last_applied + 1;
                    let applied = state.apply_entry(next);
                    if next == index {
                        output = applied;
                    } else if !self.answered.remove(&next) {
                        self.outputs.insert(next, applied);
                    }
                }
                output
            }
            Ok(_) => self.outputs.remove(&index).unwrap_or_else(|| {
                Err(ConsensusError::Internal(format!(
                    "entry {} was already answered",
                    index
                )))
            }),
            Err(e) => {
                if self.outputs.remove(&index).is_none() && index > state.last_applied {
                    self.answered.insert(index);
                }
                Err(e)
            }
        };

        match outcome {
            Ok(output) => OperationResponse::ok(request.id, state.id, output),
            Err(e) => {
                tracing::debug!(node_id = state.id, index, error = %e, "Commit failed");
                OperationResponse::error(request.id, state.id, &e)
            }
        }
    }

    /// Runs a query once leadership has been confirmed.
    pub fn complete_query(
        state: &mut RaftState,
        request: &QueryRequest,
        result: Result<u64>,
    ) -> QueryResponse {
        match result {
            Ok(_) => rpc::local_query(state, request),
            Err(e) => {
                tracing::debug!(node_id = state.id, error = %e, "Could not confirm leadership");
                OperationResponse::error(request.id, state.id, &e)
            }
        }
    }

    pub fn handle_ping_result(
        &mut self,
        state: &RaftState,
        member: MemberId,
        index: Option<u64>,
        result: std::result::Result<PingResponse, TransportError>,
    ) -> Option<u64> {
        self.replicator.handle_ping_result(state, member, index, result)
    }

    pub fn handle_append_result(
        &mut self,
        state: &mut RaftState,
        member: MemberId,
        start: u64,
        end: u64,
        prev_index: Option<u64>,
        result: std::result::Result<AppendResponse, TransportError>,
    ) -> Option<u64> {
        self.replicator
            .handle_append_result(state, member, start, end, prev_index, result)
    }

    /// Stops the heartbeat and fails everything still waiting on replication.
    pub fn close(&mut self, state: &RaftState) {
        self.heartbeat.cancel();
        self.replicator
            .close(&ConsensusError::NotLeader(state.leader_id.filter(|id| *id != state.id)));
        tracing::debug!(node_id = state.id, term = state.current_term, "Leader closed");
    }
}

async fn await_result(rx: ResultReceiver) -> Result<u64> {
    rx.await
        .unwrap_or_else(|_| Err(ConsensusError::NotLeader(None)))
}
