//! Request/response messages exchanged between cluster members.
//!
//! Every pair carries a correlation id and the identity of its sender.
//! Encoding is left to the transport.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConsensusError;
use crate::log::LogEntry;
use crate::MemberId;

/// Read freshness requested by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Consistency {
    /// Served from local state, possibly stale.
    Weak,
    /// Served from the leader's state without confirming leadership.
    #[default]
    Default,
    /// Served by the leader after a quorum confirms it is still leader.
    Strong,
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Consistency::Weak => write!(f, "weak"),
            Consistency::Default => write!(f, "default"),
            Consistency::Strong => write!(f, "strong"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Error,
}

/// Heartbeat and consistency probe sent by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub id: Uuid,
    pub member: MemberId,
    pub term: u64,
    pub leader: MemberId,
    pub log_index: Option<u64>,
    pub log_term: Option<u64>,
    pub commit_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub id: Uuid,
    pub member: MemberId,
    pub term: u64,
    pub succeeded: bool,
    pub log_index: Option<u64>,
}

/// Log shipping request. `log_index`/`log_term` identify the entry that
/// precedes `entries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub id: Uuid,
    pub member: MemberId,
    pub term: u64,
    pub leader: MemberId,
    pub log_index: Option<u64>,
    pub log_term: Option<u64>,
    pub entries: Vec<LogEntry>,
    pub commit_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub id: Uuid,
    pub member: MemberId,
    pub term: u64,
    pub succeeded: bool,
    /// The follower's last log index after handling the request.
    pub log_index: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub id: Uuid,
    pub member: MemberId,
    pub term: u64,
    pub candidate: MemberId,
    pub log_index: Option<u64>,
    pub log_term: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub id: Uuid,
    pub member: MemberId,
    pub term: u64,
    pub voted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub id: Uuid,
    pub member: MemberId,
    pub payload: Vec<u8>,
    pub consistency: Consistency,
}

impl QueryRequest {
    pub fn new(member: MemberId, payload: impl Into<Vec<u8>>, consistency: Consistency) -> Self {
        Self {
            id: Uuid::new_v4(),
            member,
            payload: payload.into(),
            consistency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub id: Uuid,
    pub member: MemberId,
    pub payload: Vec<u8>,
}

impl CommitRequest {
    pub fn new(member: MemberId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            member,
            payload: payload.into(),
        }
    }
}

/// Outcome of a client operation: a result on `Ok`, an error otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub id: Uuid,
    pub member: MemberId,
    pub status: Status,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
}

pub type QueryResponse = OperationResponse;
pub type CommitResponse = OperationResponse;

impl OperationResponse {
    pub fn ok(id: Uuid, member: MemberId, result: Vec<u8>) -> Self {
        Self {
            id,
            member,
            status: Status::Ok,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Uuid, member: MemberId, error: &ConsensusError) -> Self {
        Self {
            id,
            member,
            status: Status::Error,
            result: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Converts the response into the result payload or an application error.
    pub fn into_result(self) -> crate::error::Result<Vec<u8>> {
        match self.status {
            Status::Ok => Ok(self.result.unwrap_or_default()),
            Status::Error => Err(ConsensusError::Application(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            )),
        }
    }
}
