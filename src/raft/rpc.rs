//! Handlers for requests a node answers from its own log.
//!
//! The node adopts newer terms and picks the role before calling these, so
//! a handler only sees terms at or below its own.

use tokio::sync::oneshot;

use crate::error::ConsensusError;
use crate::log::Log;
use crate::protocol::{
    AppendRequest, AppendResponse, CommitRequest, CommitResponse, OperationResponse, PingRequest,
    PingResponse, QueryRequest, QueryResponse, VoteRequest, VoteResponse,
};
use crate::raft::state::RaftState;

/// Handle a leader ping on a follower
pub fn handle_ping(state: &mut RaftState, req: &PingRequest) -> PingResponse {
    if req.term < state.current_term {
        return reject_ping(state, req);
    }
    state.leader_id = Some(req.leader);

    let consistent = match req.log_index {
        None => true,
        Some(index) => state.log.term_at(index) == req.log_term,
    };
    if consistent {
        state.learn_commit_index(req.commit_index.min(req.log_index.unwrap_or(0)));
    }

    PingResponse {
        id: req.id,
        member: state.id,
        term: state.current_term,
        succeeded: consistent,
        log_index: state.last_log_index(),
    }
}

pub fn reject_ping(state: &RaftState, req: &PingRequest) -> PingResponse {
    PingResponse {
        id: req.id,
        member: state.id,
        term: state.current_term,
        succeeded: false,
        log_index: state.last_log_index(),
    }
}

/// Handle an append on a follower
pub fn handle_append(state: &mut RaftState, req: &AppendRequest) -> AppendResponse {
    if req.term < state.current_term {
        return reject_append(state, req);
    }
    state.leader_id = Some(req.leader);

    // Check if we have the entry preceding the batch
    if let Some(prev_index) = req.log_index {
        match state.log.term_at(prev_index) {
            None => return reject_append(state, req),
            Some(term) if Some(term) != req.log_term => {
                // Term mismatch - drop the conflicting suffix and reject
                if prev_index > state.commit_index {
                    if let Err(e) = state.log.truncate(prev_index) {
                        tracing::warn!(node_id = state.id, error = %e, "Failed to truncate log");
                    }
                }
                return reject_append(state, req);
            }
            Some(_) => {}
        }
    }

    let mut index = req.log_index.unwrap_or(0);
    for entry in &req.entries {
        index += 1;
        match state.log.term_at(index) {
            Some(term) if term == entry.term => continue,
            Some(_) => {
                if index <= state.commit_index {
                    tracing::error!(
                        node_id = state.id,
                        index,
                        "Leader sent an entry conflicting with a committed one"
                    );
                    return reject_append(state, req);
                }
                if let Err(e) = truncate_and_append(state.log.as_mut(), index, entry.clone()) {
                    tracing::warn!(node_id = state.id, index, error = %e, "Failed to append entry");
                    return reject_append(state, req);
                }
            }
            None => {
                if let Err(e) = state.log.append(entry.clone()) {
                    tracing::warn!(node_id = state.id, index, error = %e, "Failed to append entry");
                    return reject_append(state, req);
                }
            }
        }
    }

    if !req.entries.is_empty() {
        tracing::debug!(
            node_id = state.id,
            entries_appended = req.entries.len(),
            new_last_index = index,
            "Appended entries"
        );
    }

    state.learn_commit_index(req.commit_index.min(index));

    AppendResponse {
        id: req.id,
        member: state.id,
        term: state.current_term,
        succeeded: true,
        log_index: state.last_log_index(),
    }
}

fn truncate_and_append(
    log: &mut dyn Log,
    index: u64,
    entry: crate::log::LogEntry,
) -> crate::error::Result<u64> {
    log.truncate(index)?;
    log.append(entry)
}

pub fn reject_append(state: &RaftState, req: &AppendRequest) -> AppendResponse {
    AppendResponse {
        id: req.id,
        member: state.id,
        term: state.current_term,
        succeeded: false,
        log_index: state.last_log_index(),
    }
}

/// Handle a vote request
pub fn handle_vote(state: &mut RaftState, req: &VoteRequest) -> VoteResponse {
    let voted = if req.term < state.current_term {
        // Reject if request term is less than our current term
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate) {
        // Already voted for someone else in this term
        false
    } else if !state.is_log_up_to_date(req.log_index, req.log_term) {
        // Candidate's log is not up-to-date
        false
    } else {
        state.voted_for = Some(req.candidate);
        true
    };

    tracing::debug!(
        node_id = state.id,
        candidate = req.candidate,
        term = req.term,
        voted,
        "Vote response"
    );

    VoteResponse {
        id: req.id,
        member: state.id,
        term: state.current_term,
        voted,
    }
}

pub fn reject_vote(state: &RaftState, req: &VoteRequest) -> VoteResponse {
    VoteResponse {
        id: req.id,
        member: state.id,
        term: state.current_term,
        voted: false,
    }
}

/// Serves a query from local state.
pub fn local_query(state: &mut RaftState, req: &QueryRequest) -> QueryResponse {
    match state.apply_query(&req.payload) {
        Ok(result) => OperationResponse::ok(req.id, state.id, result),
        Err(e) => OperationResponse::error(req.id, state.id, &e),
    }
}

/// Forwards a client query to the known leader.
///
/// Requests already forwarded by another member are not forwarded again.
pub fn forward_query(
    state: &RaftState,
    req: QueryRequest,
    response_tx: oneshot::Sender<QueryResponse>,
) {
    let Some(leader) = forward_target(state, req.member) else {
        let _ = response_tx.send(OperationResponse::error(
            req.id,
            state.id,
            &ConsensusError::NotLeader(state.leader_id),
        ));
        return;
    };

    tracing::debug!(node_id = state.id, leader, "Forwarding query to leader");
    let transport = state.transport.clone();
    let node_id = state.id;
    tokio::spawn(async move {
        let id = req.id;
        let response = match transport.query(leader, req).await {
            Ok(response) => response,
            Err(e) => OperationResponse::error(id, node_id, &e.into()),
        };
        let _ = response_tx.send(response);
    });
}

/// Forwards a client commit to the known leader.
pub fn forward_commit(
    state: &RaftState,
    req: CommitRequest,
    response_tx: oneshot::Sender<CommitResponse>,
) {
    let Some(leader) = forward_target(state, req.member) else {
        let _ = response_tx.send(OperationResponse::error(
            req.id,
            state.id,
            &ConsensusError::NotLeader(state.leader_id),
        ));
        return;
    };

    tracing::debug!(node_id = state.id, leader, "Forwarding commit to leader");
    let transport = state.transport.clone();
    let node_id = state.id;
    tokio::spawn(async move {
        let id = req.id;
        let response = match transport.commit(leader, req).await {
            Ok(response) => response,
            Err(e) => OperationResponse::error(id, node_id, &e.into()),
        };
        let _ = response_tx.send(response);
    });
}

fn forward_target(state: &RaftState, origin: crate::MemberId) -> Option<crate::MemberId> {
    if origin != state.id {
        return None;
    }
    state.leader_id.filter(|leader| *leader != state.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::log::LogEntry;
    use crate::protocol::Consistency;
    use crate::raft::testing::{recording_consumer, test_state, Call};
    use uuid::Uuid;

    fn append(term: u64, prev: Option<(u64, u64)>, entries: &[u64], commit: u64) -> AppendRequest {
        AppendRequest {
            id: Uuid::new_v4(),
            member: 2,
            term,
            leader: 2,
            log_index: prev.map(|(i, _)| i),
            log_term: prev.map(|(_, t)| t),
            entries: entries.iter().map(|t| LogEntry::new(*t, vec![*t as u8])).collect(),
            commit_index: commit,
        }
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let (mut state, _rx, _transport) = test_state(NodeConfig::new(1).with_peers([2, 3]));
        state.current_term = 1;

        let req = VoteRequest {
            id: Uuid::new_v4(),
            member: 2,
            term: 1,
            candidate: 2,
            log_index: None,
            log_term: None,
        };
        assert!(handle_vote(&mut state, &req).voted);
        // Same candidate again is fine.
        assert!(handle_vote(&mut state, &req).voted);

        let other = VoteRequest {
            candidate: 3,
            member: 3,
            ..req.clone()
        };
        assert!(!handle_vote(&mut state, &other).voted);
    }

    #[test]
    fn test_vote_rejects_stale_term_and_stale_log() {
        let (mut state, _rx, _transport) = test_state(NodeConfig::new(1));
        state.current_term = 3;
        state.log.append(LogEntry::new(3, Vec::new())).unwrap();

        let stale_term = VoteRequest {
            id: Uuid::new_v4(),
            member: 2,
            term: 2,
            candidate: 2,
            log_index: Some(5),
            log_term: Some(3),
        };
        let resp = handle_vote(&mut state, &stale_term);
        assert!(!resp.voted);
        assert_eq!(resp.term, 3);

        let stale_log = VoteRequest {
            term: 3,
            log_index: Some(1),
            log_term: Some(2),
            ..stale_term
        };
        assert!(!handle_vote(&mut state, &stale_log).voted);
    }

    #[test]
    fn test_append_to_empty_log() {
        let (mut state, _rx, _transport) = test_state(NodeConfig::new(1));
        state.current_term = 1;

        let resp = handle_append(&mut state, &append(1, None, &[1, 1], 1));
        assert!(resp.succeeded);
        assert_eq!(resp.log_index, Some(2));
        assert_eq!(state.leader_id, Some(2));
        assert_eq!(state.commit_index, 1);
        assert_eq!(state.last_applied, 1);
    }

    #[test]
    fn test_append_rejects_missing_prev() {
        let (mut state, _rx, _transport) = test_state(NodeConfig::new(1));
        state.current_term = 1;

        let resp = handle_append(&mut state, &append(1, Some((3, 1)), &[1], 0));
        assert!(!resp.succeeded);
        assert_eq!(resp.log_index, None);
    }

    #[test]
    fn test_append_rejects_stale_term() {
        let (mut state, _rx, _transport) = test_state(NodeConfig::new(1));
        state.current_term = 4;

        let resp = handle_append(&mut state, &append(3, None, &[3], 0));
        assert!(!resp.succeeded);
        assert_eq!(resp.term, 4);
        assert!(state.log.is_empty());
        assert_eq!(state.leader_id, None);
    }

    #[test]
    fn test_append_truncates_conflicting_suffix() {
        let (mut state, _rx, _transport) = test_state(NodeConfig::new(1));
        state.current_term = 3;
        for term in [1, 1, 2] {
            state.log.append(LogEntry::new(term, Vec::new())).unwrap();
        }

        // Leader has [1, 1, 3]: entry 3 conflicts.
        let resp = handle_append(&mut state, &append(3, Some((2, 1)), &[3, 3], 0));
        assert!(resp.succeeded);
        assert_eq!(state.log.last_index(), Some(4));
        assert_eq!(state.log.term_at(3), Some(3));
        assert_eq!(state.log.term_at(4), Some(3));
    }

    #[test]
    fn test_append_prev_term_mismatch_truncates() {
        let (mut state, _rx, _transport) = test_state(NodeConfig::new(1));
        state.current_term = 3;
        for term in [1, 2, 2] {
            state.log.append(LogEntry::new(term, Vec::new())).unwrap();
        }

        let resp = handle_append(&mut state, &append(3, Some((2, 3)), &[3], 0));
        assert!(!resp.succeeded);
        assert_eq!(resp.log_index, Some(1));
    }

    #[test]
    fn test_append_is_idempotent() {
        let (mut state, _rx, _transport) = test_state(NodeConfig::new(1));
        state.current_term = 1;
        let req = append(1, None, &[1, 1, 1], 0);

        handle_append(&mut state, &req);
        let resp = handle_append(&mut state, &req);
        assert!(resp.succeeded);
        assert_eq!(state.log.last_index(), Some(3));
    }

    #[test]
    fn test_ping_learns_commit_index() {
        let (consumer, applied) = recording_consumer();
        let (mut state, _rx, _transport) = test_state(NodeConfig::new(1));
        state.replace_consumer(consumer);
        state.current_term = 1;
        handle_append(&mut state, &append(1, None, &[1, 1], 0));
        assert_eq!(state.commit_index, 0);

        let ping = PingRequest {
            id: Uuid::new_v4(),
            member: 2,
            term: 1,
            leader: 2,
            log_index: Some(2),
            log_term: Some(1),
            commit_index: 2,
        };
        let resp = handle_ping(&mut state, &ping);
        assert!(resp.succeeded);
        assert_eq!(state.commit_index, 2);
        assert_eq!(applied.lock().unwrap().len(), 2);

        let inconsistent = PingRequest {
            log_index: Some(5),
            ..ping
        };
        assert!(!handle_ping(&mut state, &inconsistent).succeeded);
    }

    #[tokio::test]
    async fn test_forward_requires_known_leader() {
        let (mut state, _rx, transport) = test_state(NodeConfig::new(1).with_peers([2]));

        let (tx, rx) = oneshot::channel();
        forward_commit(&state, CommitRequest::new(1, b"x".to_vec()), tx);
        let resp = rx.await.unwrap();
        assert!(!resp.is_ok());

        state.leader_id = Some(2);
        let (tx, rx) = oneshot::channel();
        forward_query(
            &state,
            QueryRequest::new(1, b"q".to_vec(), Consistency::Default),
            tx,
        );
        let resp = rx.await.unwrap();
        assert!(resp.is_ok());
        assert!(matches!(transport.calls().as_slice(), [(2, Call::Query(_))]));

        // Requests that already hopped once are not forwarded again.
        let (tx, rx) = oneshot::channel();
        forward_commit(&state, CommitRequest::new(3, b"x".to_vec()), tx);
        assert!(!rx.await.unwrap().is_ok());
    }
}
