use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{ConsensusError, Result, TransportError};
use crate::log::Log;
use crate::protocol::{
    AppendRequest, AppendResponse, CommitRequest, CommitResponse, Consistency, OperationResponse,
    PingRequest, PingResponse, QueryRequest, QueryResponse, VoteRequest, VoteResponse,
};
use crate::raft::candidate;
use crate::raft::leader::LeaderState;
use crate::raft::rpc;
use crate::raft::state::{Consumer, RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;
use crate::transport::Transport;
use crate::MemberId;

/// Message types for the Raft node event loop
#[derive(Debug)]
pub enum RaftMessage {
    /// Leave the start state and join the cluster as a follower
    Open {
        response_tx: oneshot::Sender<Result<()>>,
    },
    Ping {
        request: PingRequest,
        response_tx: oneshot::Sender<PingResponse>,
    },
    Append {
        request: AppendRequest,
        response_tx: oneshot::Sender<AppendResponse>,
    },
    Vote {
        request: VoteRequest,
        response_tx: oneshot::Sender<VoteResponse>,
    },
    Query {
        request: QueryRequest,
        response_tx: oneshot::Sender<QueryResponse>,
    },
    Commit {
        request: CommitRequest,
        response_tx: oneshot::Sender<CommitResponse>,
    },
    Status {
        response_tx: oneshot::Sender<NodeStatus>,
    },
    Close {
        response_tx: oneshot::Sender<()>,
    },

    /// Heartbeat tick from the leader's timer
    Heartbeat { epoch: u64 },
    /// A ping sent to a follower finished
    PingResult {
        epoch: u64,
        member: MemberId,
        index: Option<u64>,
        result: std::result::Result<PingResponse, TransportError>,
    },
    /// An append sent to a follower finished
    AppendResult {
        epoch: u64,
        member: MemberId,
        start: u64,
        end: u64,
        prev_index: Option<u64>,
        result: std::result::Result<AppendResponse, TransportError>,
    },
    /// A peer answered with a newer term
    HigherTerm { term: u64 },
    /// Votes for an election have been counted
    ElectionComplete { epoch: u64, term: u64, won: bool },
    /// A client entry finished replicating, successfully or not
    CommitReplicated {
        epoch: u64,
        index: u64,
        request: CommitRequest,
        result: Result<u64>,
        response_tx: oneshot::Sender<CommitResponse>,
    },
    /// Leadership was confirmed, or not, for a strong query
    QueryConfirmed {
        epoch: u64,
        request: QueryRequest,
        result: Result<u64>,
        response_tx: oneshot::Sender<QueryResponse>,
    },
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: MemberId,
    pub role: RaftRole,
    pub term: u64,
    pub leader: Option<MemberId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: Option<u64>,
}

enum Role {
    Start,
    Follower,
    Candidate,
    Leader(Box<LeaderState>),
    Closed,
}

impl Role {
    fn kind(&self) -> RaftRole {
        match self {
            Role::Start => RaftRole::Start,
            Role::Follower => RaftRole::Follower,
            Role::Candidate => RaftRole::Candidate,
            Role::Leader(_) => RaftRole::Leader,
            Role::Closed => RaftRole::Closed,
        }
    }
}

/// The main Raft node that coordinates consensus
///
/// All state lives in a single task that drains one message channel:
/// requests from peers and clients, plus completions of the RPCs and timers
/// it spawned. Completions carry the epoch they were issued under and are
/// ignored once the node has changed role.
pub struct RaftNode {
    state: RaftState,
    role: Role,
    election_deadline: Instant,
    message_tx: mpsc::Sender<RaftMessage>,
}

impl RaftNode {
    pub fn new(
        config: NodeConfig,
        log: Box<dyn Log>,
        consumer: Consumer,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::Receiver<RaftMessage>)> {
        config.validate()?;
        let (message_tx, message_rx) = mpsc::channel(config.channel_capacity);
        let state = RaftState::new(config, log, consumer, transport, message_tx.clone());

        let node = Self {
            state,
            role: Role::Start,
            election_deadline: Instant::now(),
            message_tx,
        };
        Ok((node, message_rx))
    }

    /// Creates a node and runs it on a new task until `shutdown` fires or
    /// the node is closed.
    pub fn spawn(
        config: NodeConfig,
        log: Box<dyn Log>,
        consumer: Consumer,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Result<NodeHandle> {
        let (node, message_rx) = Self::new(config, log, consumer, transport)?;
        let handle = node.handle();
        tokio::spawn(node.run(message_rx, shutdown));
        Ok(handle)
    }

    pub fn id(&self) -> MemberId {
        self.state.id
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            id: self.state.id,
            tx: self.message_tx.clone(),
        }
    }

    /// Run the Raft node main loop
    pub async fn run(mut self, mut message_rx: mpsc::Receiver<RaftMessage>, shutdown: CancellationToken) {
        tracing::debug!(node_id = self.state.id, "Raft node task started");

        loop {
            let awaiting_leader = matches!(self.role, Role::Follower | Role::Candidate);
            let deadline = self.election_deadline;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(node_id = self.state.id, "Shutdown signal received");
                    self.transition(RaftRole::Closed);
                    break;
                }

                msg = message_rx.recv() => {
                    let Some(msg) = msg else {
                        self.transition(RaftRole::Closed);
                        break;
                    };
                    if !self.handle_message(msg) {
                        break;
                    }
                }

                // Election timeout (for followers and candidates)
                _ = tokio::time::sleep_until(deadline), if awaiting_leader => {
                    self.handle_election_timeout();
                }
            }
        }

        tracing::debug!(node_id = self.state.id, "Raft node task stopped");
    }

    /// Returns false once the node has closed.
    fn handle_message(&mut self, msg: RaftMessage) -> bool {
        match msg {
            RaftMessage::Open { response_tx } => {
                let _ = response_tx.send(self.open());
            }
            RaftMessage::Ping {
                request,
                response_tx,
            } => {
                let _ = response_tx.send(self.handle_ping(request));
            }
            RaftMessage::Append {
                request,
                response_tx,
            } => {
                let _ = response_tx.send(self.handle_append(request));
            }
            RaftMessage::Vote {
                request,
                response_tx,
            } => {
                let _ = response_tx.send(self.handle_vote(request));
            }
            RaftMessage::Query {
                request,
                response_tx,
            } => self.handle_query(request, response_tx),
            RaftMessage::Commit {
                request,
                response_tx,
            } => self.handle_commit(request, response_tx),
            RaftMessage::Status { response_tx } => {
                let _ = response_tx.send(self.status());
            }
            RaftMessage::Close { response_tx } => {
                self.transition(RaftRole::Closed);
                let _ = response_tx.send(());
                return false;
            }
            RaftMessage::Heartbeat { epoch } => {
                if epoch == self.state.epoch {
                    if let Role::Leader(leader) = &mut self.role {
                        leader.heartbeat(&self.state);
                    }
                }
            }
            RaftMessage::PingResult {
                epoch,
                member,
                index,
                result,
            } => {
                if epoch != self.state.epoch {
                    return true;
                }
                let higher = match &mut self.role {
                    Role::Leader(leader) => {
                        leader.handle_ping_result(&self.state, member, index, result)
                    }
                    _ => None,
                };
                if let Some(term) = higher {
                    self.observe_term(term);
                }
            }
            RaftMessage::AppendResult {
                epoch,
                member,
                start,
                end,
                prev_index,
                result,
            } => {
                if epoch != self.state.epoch {
                    return true;
                }
                let higher = match &mut self.role {
                    Role::Leader(leader) => leader.handle_append_result(
                        &mut self.state,
                        member,
                        start,
                        end,
                        prev_index,
                        result,
                    ),
                    _ => None,
                };
                if let Some(term) = higher {
                    self.observe_term(term);
                }
            }
            RaftMessage::HigherTerm { term } => {
                self.observe_term(term);
            }
            RaftMessage::ElectionComplete { epoch, term, won } => {
                if epoch != self.state.epoch || term != self.state.current_term {
                    return true;
                }
                if let Role::Candidate = self.role {
                    if won {
                        self.transition(RaftRole::Leader);
                    } else {
                        tracing::debug!(node_id = self.state.id, term, "Election lost");
                    }
                }
            }
            RaftMessage::CommitReplicated {
                epoch,
                index,
                request,
                result,
                response_tx,
            } => {
                let response = match &mut self.role {
                    Role::Leader(leader) if epoch == self.state.epoch => {
                        leader.complete_commit(&mut self.state, index, &request, result)
                    }
                    // Left to be applied once committed under the new leader.
                    _ => OperationResponse::error(
                        request.id,
                        self.state.id,
                        &ConsensusError::NotLeader(self.state.leader_id),
                    ),
                };
                let _ = response_tx.send(response);
            }
            RaftMessage::QueryConfirmed {
                epoch,
                request,
                result,
                response_tx,
            } => {
                let response = match self.role {
                    Role::Leader(_) if epoch == self.state.epoch => {
                        LeaderState::complete_query(&mut self.state, &request, result)
                    }
                    _ => OperationResponse::error(
                        request.id,
                        self.state.id,
                        &ConsensusError::NotLeader(self.state.leader_id),
                    ),
                };
                let _ = response_tx.send(response);
            }
        }
        true
    }

    fn open(&mut self) -> Result<()> {
        match self.role {
            Role::Start => {
                self.transition(RaftRole::Follower);
                Ok(())
            }
            Role::Closed => Err(ConsensusError::Closed),
            _ => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        !matches!(self.role, Role::Start | Role::Closed)
    }

    fn handle_election_timeout(&mut self) {
        if Instant::now() < self.election_deadline {
            return;
        }
        match self.role {
            Role::Follower | Role::Candidate => {
                tracing::info!(
                    node_id = self.state.id,
                    term = self.state.current_term,
                    role = %self.role.kind(),
                    "Election timeout, starting election"
                );
                self.transition(RaftRole::Candidate);
            }
            _ => {}
        }
    }

    /// Adopts a newer term and steps down to follower.
    fn observe_term(&mut self, term: u64) {
        if self.state.observe_term(term) {
            tracing::info!(node_id = self.state.id, term, "Observed newer term");
            match self.role {
                Role::Follower => self.reset_election_deadline(),
                Role::Start | Role::Closed => {}
                _ => self.transition(RaftRole::Follower),
            }
        }
    }

    fn handle_ping(&mut self, request: PingRequest) -> PingResponse {
        if !self.is_open() {
            return rpc::reject_ping(&self.state, &request);
        }
        self.observe_term(request.term);
        self.yield_to_leader(request.term, request.leader);

        match self.role {
            Role::Follower => {
                let response = rpc::handle_ping(&mut self.state, &request);
                if request.term == self.state.current_term {
                    self.reset_election_deadline();
                }
                response
            }
            _ => rpc::reject_ping(&self.state, &request),
        }
    }

    fn handle_append(&mut self, request: AppendRequest) -> AppendResponse {
        if !self.is_open() {
            return rpc::reject_append(&self.state, &request);
        }
        self.observe_term(request.term);
        self.yield_to_leader(request.term, request.leader);

        match self.role {
            Role::Follower => {
                let response = rpc::handle_append(&mut self.state, &request);
                if request.term == self.state.current_term {
                    self.reset_election_deadline();
                }
                response
            }
            _ => rpc::reject_append(&self.state, &request),
        }
    }

    fn handle_vote(&mut self, request: VoteRequest) -> VoteResponse {
        if !self.is_open() {
            return rpc::reject_vote(&self.state, &request);
        }
        self.observe_term(request.term);

        match self.role {
            Role::Follower | Role::Candidate | Role::Leader(_) => {
                let response = rpc::handle_vote(&mut self.state, &request);
                if response.voted {
                    self.reset_election_deadline();
                }
                response
            }
            Role::Start | Role::Closed => rpc::reject_vote(&self.state, &request),
        }
    }

    /// A candidate or leader that hears from another leader of its own term
    /// steps down.
    fn yield_to_leader(&mut self, term: u64, leader: MemberId) {
        if term != self.state.current_term || leader == self.state.id {
            return;
        }
        match self.role {
            Role::Candidate => self.transition(RaftRole::Follower),
            Role::Leader(_) => {
                tracing::warn!(
                    node_id = self.state.id,
                    term,
                    other = leader,
                    "Another leader claims this term, stepping down"
                );
                self.transition(RaftRole::Follower);
            }
            _ => {}
        }
    }

    fn handle_query(&mut self, request: QueryRequest, response_tx: oneshot::Sender<QueryResponse>) {
        match &mut self.role {
            Role::Leader(leader) => leader.query(&mut self.state, request, response_tx),
            Role::Follower | Role::Candidate if request.consistency == Consistency::Weak => {
                let _ = response_tx.send(rpc::local_query(&mut self.state, &request));
            }
            Role::Follower => rpc::forward_query(&self.state, request, response_tx),
            Role::Candidate => {
                let _ = response_tx.send(OperationResponse::error(
                    request.id,
                    self.state.id,
                    &ConsensusError::NotLeader(None),
                ));
            }
            Role::Start => {
                let _ = response_tx.send(OperationResponse::error(
                    request.id,
                    self.state.id,
                    &ConsensusError::NotOpen,
                ));
            }
            Role::Closed => {
                let _ = response_tx.send(OperationResponse::error(
                    request.id,
                    self.state.id,
                    &ConsensusError::Closed,
                ));
            }
        }
    }

    fn handle_commit(&mut self, request: CommitRequest, response_tx: oneshot::Sender<CommitResponse>) {
        match &mut self.role {
            Role::Leader(leader) => leader.commit(&mut self.state, request, response_tx),
            Role::Follower => rpc::forward_commit(&self.state, request, response_tx),
            Role::Candidate => {
                let _ = response_tx.send(OperationResponse::error(
                    request.id,
                    self.state.id,
                    &ConsensusError::NotLeader(None),
                ));
            }
            Role::Start => {
                let _ = response_tx.send(OperationResponse::error(
                    request.id,
                    self.state.id,
                    &ConsensusError::NotOpen,
                ));
            }
            Role::Closed => {
                let _ = response_tx.send(OperationResponse::error(
                    request.id,
                    self.state.id,
                    &ConsensusError::Closed,
                ));
            }
        }
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.state.id,
            role: self.role.kind(),
            term: self.state.current_term,
            leader: self.state.leader_id,
            commit_index: self.state.commit_index,
            last_applied: self.state.last_applied,
            last_log_index: self.state.last_log_index(),
        }
    }

    /// Closes the current role and opens `next` under a fresh epoch.
    fn transition(&mut self, next: RaftRole) {
        let previous = self.role.kind();
        if previous == RaftRole::Closed {
            return;
        }

        if let Role::Leader(leader) = &mut self.role {
            leader.close(&self.state);
            if self.state.leader_id == Some(self.state.id) {
                self.state.leader_id = None;
            }
        }
        self.state.epoch += 1;

        self.role = match next {
            RaftRole::Start => Role::Start,
            RaftRole::Follower => {
                self.reset_election_deadline();
                Role::Follower
            }
            RaftRole::Candidate => {
                self.reset_election_deadline();
                candidate::start_election(&mut self.state);
                Role::Candidate
            }
            RaftRole::Leader => Role::Leader(Box::new(LeaderState::open(&mut self.state))),
            RaftRole::Closed => Role::Closed,
        };

        tracing::info!(
            node_id = self.state.id,
            term = self.state.current_term,
            from = %previous,
            to = %next,
            "Role transition"
        );
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now()
            + random_election_timeout(
                self.state.config.election_timeout_min_ms,
                self.state.config.election_timeout_max_ms,
            );
    }
}

/// Cloneable client for a running [`RaftNode`].
#[derive(Clone, Debug)]
pub struct NodeHandle {
    id: MemberId,
    tx: mpsc::Sender<RaftMessage>,
}

impl NodeHandle {
    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RaftMessage) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| ConsensusError::Closed)?;
        response_rx.await.map_err(|_| ConsensusError::Closed)
    }

    pub async fn open(&self) -> Result<()> {
        self.request(|response_tx| RaftMessage::Open { response_tx })
            .await?
    }

    pub async fn ping(&self, request: PingRequest) -> Result<PingResponse> {
        self.request(|response_tx| RaftMessage::Ping {
            request,
            response_tx,
        })
        .await
    }

    pub async fn append(&self, request: AppendRequest) -> Result<AppendResponse> {
        self.request(|response_tx| RaftMessage::Append {
            request,
            response_tx,
        })
        .await
    }

    pub async fn vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.request(|response_tx| RaftMessage::Vote {
            request,
            response_tx,
        })
        .await
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.request(|response_tx| RaftMessage::Query {
            request,
            response_tx,
        })
        .await
    }

    pub async fn commit(&self, request: CommitRequest) -> Result<CommitResponse> {
        self.request(|response_tx| RaftMessage::Commit {
            request,
            response_tx,
        })
        .await
    }

    /// Commits `payload` through this node and returns the consumer's output.
    pub async fn submit(&self, payload: impl Into<Vec<u8>>) -> Result<Vec<u8>> {
        self.commit(CommitRequest::new(self.id, payload))
            .await?
            .into_result()
    }

    /// Queries through this node and returns the consumer's output.
    pub async fn read(
        &self,
        payload: impl Into<Vec<u8>>,
        consistency: Consistency,
    ) -> Result<Vec<u8>> {
        self.query(QueryRequest::new(self.id, payload, consistency))
            .await?
            .into_result()
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        self.request(|response_tx| RaftMessage::Status { response_tx })
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.request(|response_tx| RaftMessage::Close { response_tx })
            .await
    }
}
