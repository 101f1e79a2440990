pub mod candidate;
pub mod leader;
pub mod node;
pub mod pending;
pub mod quorum;
pub mod replica;
pub mod replicator;
pub mod rpc;
pub mod state;
pub mod timer;

pub use node::{NodeHandle, NodeStatus, RaftMessage, RaftNode};
pub use quorum::Quorum;
pub use state::{Consumer, RaftRole, RaftState};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::node::RaftMessage;
    use super::state::{Consumer, RaftState};
    use crate::config::NodeConfig;
    use crate::error::TransportError;
    use crate::log::MemoryLog;
    use crate::protocol::{
        AppendRequest, AppendResponse, CommitRequest, CommitResponse, OperationResponse,
        PingRequest, PingResponse, QueryRequest, QueryResponse, VoteRequest, VoteResponse,
    };
    use crate::transport::Transport;
    use crate::MemberId;

    #[derive(Debug, Clone)]
    pub enum Call {
        Ping(PingRequest),
        Append(AppendRequest),
        Vote(VoteRequest),
        Query(QueryRequest),
        Commit(CommitRequest),
    }

    #[derive(Debug, Clone, Copy)]
    enum Mode {
        Accept,
        Reject { term: u64, log_index: Option<u64> },
        Fail,
    }

    /// Transport double that records every request and answers from a
    /// configurable mode, optionally overridden per member.
    pub struct RecordingTransport {
        calls: Mutex<Vec<(MemberId, Call)>>,
        mode: Mutex<Mode>,
        members: Mutex<HashMap<MemberId, Mode>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                mode: Mutex::new(Mode::Accept),
                members: Mutex::new(HashMap::new()),
            }
        }

        pub fn calls(&self) -> Vec<(MemberId, Call)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }

        pub fn accept(&self) {
            *self.mode.lock().unwrap() = Mode::Accept;
        }

        /// Rejects pings, appends and votes, reporting `term` and `log_index`.
        pub fn reject_appends(&self, term: u64, log_index: Option<u64>) {
            *self.mode.lock().unwrap() = Mode::Reject { term, log_index };
        }

        pub fn fail(&self) {
            *self.mode.lock().unwrap() = Mode::Fail;
        }

        /// Makes every request to `member` fail, whatever the shared mode.
        pub fn fail_member(&self, member: MemberId) {
            self.members.lock().unwrap().insert(member, Mode::Fail);
        }

        fn record(&self, target: MemberId, call: Call) -> Mode {
            self.calls.lock().unwrap().push((target, call));
            match self.members.lock().unwrap().get(&target) {
                Some(mode) => *mode,
                None => *self.mode.lock().unwrap(),
            }
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn ping(
            &self,
            target: MemberId,
            request: PingRequest,
        ) -> Result<PingResponse, TransportError> {
            match self.record(target, Call::Ping(request.clone())) {
                Mode::Accept => Ok(PingResponse {
                    id: request.id,
                    member: target,
                    term: request.term,
                    succeeded: true,
                    log_index: request.log_index,
                }),
                Mode::Reject { term, log_index } => Ok(PingResponse {
                    id: request.id,
                    member: target,
                    term,
                    succeeded: false,
                    log_index,
                }),
                Mode::Fail => Err(TransportError::Unreachable(target)),
            }
        }

        async fn append(
            &self,
            target: MemberId,
            request: AppendRequest,
        ) -> Result<AppendResponse, TransportError> {
            match self.record(target, Call::Append(request.clone())) {
                Mode::Accept => Ok(AppendResponse {
                    id: request.id,
                    member: target,
                    term: request.term,
                    succeeded: true,
                    log_index: Some(request.log_index.unwrap_or(0) + request.entries.len() as u64),
                }),
                Mode::Reject { term, log_index } => Ok(AppendResponse {
                    id: request.id,
                    member: target,
                    term,
                    succeeded: false,
                    log_index,
                }),
                Mode::Fail => Err(TransportError::Unreachable(target)),
            }
        }

        async fn vote(
            &self,
            target: MemberId,
            request: VoteRequest,
        ) -> Result<VoteResponse, TransportError> {
            match self.record(target, Call::Vote(request.clone())) {
                Mode::Accept => Ok(VoteResponse {
                    id: request.id,
                    member: target,
                    term: request.term,
                    voted: true,
                }),
                Mode::Reject { term, .. } => Ok(VoteResponse {
                    id: request.id,
                    member: target,
                    term,
                    voted: false,
                }),
                Mode::Fail => Err(TransportError::Unreachable(target)),
            }
        }

        async fn query(
            &self,
            target: MemberId,
            request: QueryRequest,
        ) -> Result<QueryResponse, TransportError> {
            match self.record(target, Call::Query(request.clone())) {
                Mode::Fail => Err(TransportError::Unreachable(target)),
                _ => Ok(OperationResponse::ok(request.id, target, request.payload)),
            }
        }

        async fn commit(
            &self,
            target: MemberId,
            request: CommitRequest,
        ) -> Result<CommitResponse, TransportError> {
            match self.record(target, Call::Commit(request.clone())) {
                Mode::Fail => Err(TransportError::Unreachable(target)),
                _ => Ok(OperationResponse::ok(request.id, target, request.payload)),
            }
        }
    }

    pub type Applied = Arc<Mutex<Vec<(Option<u64>, Vec<u8>)>>>;

    /// Consumer that records every call and echoes the payload back.
    pub fn recording_consumer() -> (Consumer, Applied) {
        let applied: Applied = Arc::new(Mutex::new(Vec::new()));
        let sink = applied.clone();
        let consumer: Consumer = Box::new(move |index: Option<u64>, payload: &[u8]| {
            sink.lock().unwrap().push((index, payload.to_vec()));
            Ok(payload.to_vec())
        });
        (consumer, applied)
    }

    /// Builds a state wired to a recording transport. Events that the state
    /// would send to its node arrive on the returned receiver.
    pub fn test_state(
        config: NodeConfig,
    ) -> (RaftState, mpsc::Receiver<RaftMessage>, Arc<RecordingTransport>) {
        let (tx, rx) = mpsc::channel(64);
        let transport = Arc::new(RecordingTransport::new());
        let (consumer, _) = recording_consumer();
        let state = RaftState::new(
            config,
            Box::new(MemoryLog::new()),
            consumer,
            transport.clone(),
            tx,
        );
        (state, rx, transport)
    }

    pub async fn next_event(rx: &mut mpsc::Receiver<RaftMessage>) -> RaftMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }
}
