//! Leader-side replication state for a single follower.

use uuid::Uuid;

use crate::error::{ConsensusError, TransportError};
use crate::log::LogEntry;
use crate::protocol::{AppendRequest, AppendResponse, PingRequest, PingResponse};
use crate::raft::node::RaftMessage;
use crate::raft::pending::{PendingRegistry, PendingResult, ResultReceiver};
use crate::raft::state::RaftState;
use crate::MemberId;

/// What a response changed about a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Unchanged,
    /// The follower's match index moved to the given value.
    Matched(u64),
    /// The follower reported a newer term; the leader must step down.
    HigherTerm(u64),
}

#[derive(Debug)]
pub struct Replica {
    member: MemberId,
    next_index: Option<u64>,
    match_index: Option<u64>,
    pings: PendingRegistry,
    replicates: PendingRegistry,
    /// At most one append is in flight per follower.
    syncing: bool,
}

impl Replica {
    pub fn new(member: MemberId) -> Self {
        Self {
            member,
            next_index: None,
            match_index: None,
            pings: PendingRegistry::new(),
            replicates: PendingRegistry::new(),
            syncing: false,
        }
    }

    pub fn member(&self) -> MemberId {
        self.member
    }

    pub fn next_index(&self) -> Option<u64> {
        self.next_index
    }

    pub fn match_index(&self) -> Option<u64> {
        self.match_index
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    /// Confirms the follower agrees with the leader's log through `index`.
    ///
    /// If the follower may not hold `index` yet, this becomes a replication
    /// request for it. A probe for an index already covered by an
    /// outstanding probe shares that probe's result.
    pub fn ping(&mut self, state: &RaftState, index: Option<u64>) -> ResultReceiver {
        if let Some(index) = index {
            if self.match_index.map_or(true, |matched| index > matched) {
                return self.commit(state, index);
            }
        }

        let key = index.unwrap_or(0);
        if let Some(outstanding) = self.pings.last_index() {
            if outstanding >= key {
                return self.pings.register(outstanding);
            }
        }

        let rx = self.pings.register(key);
        self.send_ping(state, index);
        rx
    }

    /// Resolves once the follower has stored every entry through `index`.
    pub fn commit(&mut self, state: &RaftState, index: u64) -> ResultReceiver {
        if self.match_index.map_or(false, |matched| index <= matched) {
            return PendingResult::ready(Ok(index));
        }
        let rx = self.replicates.register(index);
        if !self.syncing {
            self.sync(state);
        }
        rx
    }

    fn send_ping(&self, state: &RaftState, index: Option<u64>) {
        let request = PingRequest {
            id: Uuid::new_v4(),
            member: state.id,
            term: state.current_term,
            leader: state.id,
            log_index: index,
            log_term: index.and_then(|i| state.log.term_at(i)),
            commit_index: state.commit_index,
        };
        tracing::trace!(node_id = state.id, member = self.member, ?index, "Sending ping");

        let transport = state.transport.clone();
        let events = state.events.clone();
        let epoch = state.epoch;
        let member = self.member;
        tokio::spawn(async move {
            let result = transport.ping(member, request).await;
            let _ = events
                .send(RaftMessage::PingResult {
                    epoch,
                    member,
                    index,
                    result,
                })
                .await;
        });
    }

    /// Ships the next batch of entries if none is in flight.
    fn sync(&mut self, state: &RaftState) {
        if self.syncing {
            return;
        }
        let Some(last_index) = state.log.last_index() else {
            return;
        };
        let next_index = *self.next_index.get_or_insert(last_index);
        if !state.log.contains_index(next_index) {
            return;
        }

        let prev_index = next_index.checked_sub(1).filter(|i| *i > 0);
        let batch = state.config.max_batch_size.max(1) as u64;
        let end_index = last_index.min(next_index.saturating_add(batch - 1));
        let entries: Vec<LogEntry> = (next_index..=end_index)
            .filter_map(|i| state.log.get(i).cloned())
            .collect();
        if entries.is_empty() {
            return;
        }

        let request = AppendRequest {
            id: Uuid::new_v4(),
            member: state.id,
            term: state.current_term,
            leader: state.id,
            log_index: prev_index,
            log_term: prev_index.and_then(|i| state.log.term_at(i)),
            entries,
            commit_index: state.commit_index,
        };
        tracing::debug!(
            node_id = state.id,
            member = self.member,
            start = next_index,
            end = end_index,
            "Sending entries"
        );

        self.syncing = true;
        let transport = state.transport.clone();
        let events = state.events.clone();
        let epoch = state.epoch;
        let member = self.member;
        tokio::spawn(async move {
            let result = transport.append(member, request).await;
            let _ = events
                .send(RaftMessage::AppendResult {
                    epoch,
                    member,
                    start: next_index,
                    end: end_index,
                    prev_index,
                    result,
                })
                .await;
        });
    }

    pub fn handle_ping_result(
        &mut self,
        state: &RaftState,
        index: Option<u64>,
        result: Result<PingResponse, TransportError>,
    ) -> Progress {
        let key = index.unwrap_or(0);
        match result {
            Err(e) => {
                tracing::trace!(node_id = state.id, member = self.member, error = %e, "Ping failed");
                self.pings.fail(key, &e.into());
                Progress::Unchanged
            }
            Ok(resp) if resp.term > state.current_term => {
                self.pings.fail(key, &ConsensusError::NotLeader(None));
                Progress::HigherTerm(resp.term)
            }
            Ok(resp) if !resp.succeeded => {
                self.pings.fail(key, &ConsensusError::ConsistencyGap(self.member));
                Progress::Unchanged
            }
            Ok(_) => {
                self.pings.resolve_through(key, |_| key);
                Progress::Unchanged
            }
        }
    }

    pub fn handle_append_result(
        &mut self,
        state: &RaftState,
        start: u64,
        end: u64,
        prev_index: Option<u64>,
        result: Result<AppendResponse, TransportError>,
    ) -> Progress {
        self.syncing = false;
        match result {
            Err(e) => {
                tracing::debug!(
                    node_id = state.id,
                    member = self.member,
                    error = %e,
                    "Append failed"
                );
                // Nothing past `start` can succeed until a later sync gets through.
                self.replicates.fail_range(start, u64::MAX, &e.into());
                Progress::Unchanged
            }
            Ok(resp) if resp.succeeded => {
                let matched = self.match_index.map_or(end, |m| m.max(end));
                self.match_index = Some(matched);
                self.next_index = Some(matched + 1);
                self.replicates.resolve_through(matched, |k| k);
                tracing::trace!(node_id = state.id, member = self.member, matched, "Replica matched");
                self.sync(state);
                Progress::Matched(matched)
            }
            Ok(resp) if resp.term > state.current_term => {
                self.replicates
                    .fail_range(start, u64::MAX, &ConsensusError::NotLeader(None));
                Progress::HigherTerm(resp.term)
            }
            Ok(resp) => {
                match prev_index {
                    Some(prev) => {
                        let first = state.log.first_index().unwrap_or(1);
                        let next = resp
                            .log_index
                            .map_or(prev, |i| i.saturating_add(1))
                            .min(prev)
                            .max(first);
                        tracing::debug!(
                            node_id = state.id,
                            member = self.member,
                            next,
                            "Append rejected, rewinding"
                        );
                        self.next_index = Some(next);
                        self.sync(state);
                    }
                    None => {
                        tracing::warn!(
                            node_id = state.id,
                            member = self.member,
                            "Append rejected at the start of the log"
                        );
                        self.replicates.fail_range(
                            start,
                            u64::MAX,
                            &ConsensusError::ConsistencyGap(self.member),
                        );
                    }
                }
                Progress::Unchanged
            }
        }
    }

    /// Fails every outstanding waiter.
    pub fn close(&mut self, error: &ConsensusError) {
        self.pings.fail_all(error);
        self.replicates.fail_all(error);
    }
}
