use std::sync::Arc;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::protocol::VoteRequest;
use crate::raft::node::RaftMessage;
use crate::raft::quorum::Quorum;
use crate::raft::state::RaftState;

/// Start a new election
///
/// Bumps the term, votes for ourselves and requests votes from every peer.
/// The outcome arrives as [`RaftMessage::ElectionComplete`] tagged with the
/// current epoch; a peer reporting a newer term sends
/// [`RaftMessage::HigherTerm`] as soon as it is seen.
pub fn start_election(state: &mut RaftState) {
    state.become_candidate();

    let term = state.current_term;
    let epoch = state.epoch;
    let peers = state.config.peers.clone();
    let request = VoteRequest {
        id: Uuid::new_v4(),
        member: state.id,
        term,
        candidate: state.id,
        log_index: state.last_log_index(),
        log_term: state.last_log_term(),
    };

    tracing::info!(
        node_id = state.id,
        term,
        peers = peers.len(),
        "Starting election"
    );

    let (outcome_tx, outcome_rx) = oneshot::channel();
    let quorum = Arc::new(Quorum::new(
        state.config.quorum_size(),
        peers.len(),
        move |won| {
            let _ = outcome_tx.send(won);
        },
    ));

    for peer in peers {
        let transport = state.transport.clone();
        let events = state.events.clone();
        let quorum = quorum.clone();
        let request = VoteRequest {
            id: Uuid::new_v4(),
            ..request.clone()
        };
        let node_id = state.id;
        tokio::spawn(async move {
            match transport.vote(peer, request).await {
                Ok(resp) if resp.term > term => {
                    quorum.fail();
                    let _ = events.send(RaftMessage::HigherTerm { term: resp.term }).await;
                }
                Ok(resp) if resp.voted => {
                    tracing::debug!(node_id, peer, term, "Received vote");
                    quorum.succeed();
                }
                Ok(_) => quorum.fail(),
                Err(e) => {
                    tracing::debug!(node_id, peer, error = %e, "Vote request failed");
                    quorum.fail();
                }
            }
        });
    }

    let events = state.events.clone();
    tokio::spawn(async move {
        let won = outcome_rx.await.unwrap_or(false);
        let _ = events
            .send(RaftMessage::ElectionComplete { epoch, term, won })
            .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::raft::testing::{next_event, test_state, Call};

    #[tokio::test]
    async fn test_election_won_with_votes() {
        let (mut state, mut rx, transport) = test_state(NodeConfig::new(1).with_peers([2, 3]));
        state.epoch = 4;
        start_election(&mut state);

        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, Some(1));
        match next_event(&mut rx).await {
            RaftMessage::ElectionComplete { epoch, term, won } => {
                assert_eq!(epoch, 4);
                assert_eq!(term, 1);
                assert!(won);
            }
            other => panic!("expected election outcome, got {:?}", other),
        }
        assert!(transport
            .calls()
            .iter()
            .all(|(_, call)| matches!(call, Call::Vote(req) if req.term == 1 && req.candidate == 1)));
    }

    #[tokio::test]
    async fn test_election_lost_when_peers_unreachable() {
        let (mut state, mut rx, transport) = test_state(NodeConfig::new(1).with_peers([2, 3]));
        transport.fail();
        start_election(&mut state);

        match next_event(&mut rx).await {
            RaftMessage::ElectionComplete { won, .. } => assert!(!won),
            other => panic!("expected election outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_member_wins_immediately() {
        let (mut state, mut rx, transport) = test_state(NodeConfig::new(1));
        start_election(&mut state);

        match next_event(&mut rx).await {
            RaftMessage::ElectionComplete { won, .. } => assert!(won),
            other => panic!("expected election outcome, got {:?}", other),
        }
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_higher_term_reported() {
        let (mut state, mut rx, transport) = test_state(NodeConfig::new(1).with_peers([2, 3]));
        transport.reject_appends(9, None);
        start_election(&mut state);

        let mut saw_higher_term = false;
        for _ in 0..3 {
            match next_event(&mut rx).await {
                RaftMessage::HigherTerm { term } => {
                    assert_eq!(term, 9);
                    saw_higher_term = true;
                }
                RaftMessage::ElectionComplete { won, .. } => assert!(!won),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(saw_higher_term);
    }
}
