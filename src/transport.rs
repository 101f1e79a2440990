//! Member-to-member delivery.
//!
//! The consensus core only talks to peers through [`Transport`]. Encoding and
//! connection management belong to the implementation; [`LocalNetwork`]
//! routes requests between nodes running in the same process and can inject
//! partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::TransportError;
use crate::protocol::{
    AppendRequest, AppendResponse, CommitRequest, CommitResponse, PingRequest, PingResponse,
    QueryRequest, QueryResponse, VoteRequest, VoteResponse,
};
use crate::raft::NodeHandle;
use crate::MemberId;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn ping(
        &self,
        target: MemberId,
        request: PingRequest,
    ) -> Result<PingResponse, TransportError>;

    async fn append(
        &self,
        target: MemberId,
        request: AppendRequest,
    ) -> Result<AppendResponse, TransportError>;

    async fn vote(
        &self,
        target: MemberId,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError>;

    async fn query(
        &self,
        target: MemberId,
        request: QueryRequest,
    ) -> Result<QueryResponse, TransportError>;

    async fn commit(
        &self,
        target: MemberId,
        request: CommitRequest,
    ) -> Result<CommitResponse, TransportError>;
}

#[derive(Default)]
struct Routes {
    nodes: HashMap<MemberId, NodeHandle>,
    /// Directed links that drop every request.
    blocked: HashSet<(MemberId, MemberId)>,
}

/// In-process router between [`NodeHandle`]s.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the transport a node uses to reach its peers.
    pub fn transport(&self, member: MemberId) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            source: member,
        })
    }

    pub fn register(&self, handle: NodeHandle) {
        tracing::debug!(node_id = handle.id(), "Registered node with local network");
        self.routes().nodes.insert(handle.id(), handle);
    }

    pub fn deregister(&self, member: MemberId) -> Option<NodeHandle> {
        self.routes().nodes.remove(&member)
    }

    pub fn members(&self) -> Vec<MemberId> {
        let mut members: Vec<_> = self.routes().nodes.keys().copied().collect();
        members.sort_unstable();
        members
    }

    /// Drops traffic between `a` and `b` in both directions.
    pub fn disconnect(&self, a: MemberId, b: MemberId) {
        let mut routes = self.routes();
        routes.blocked.insert((a, b));
        routes.blocked.insert((b, a));
    }

    pub fn reconnect(&self, a: MemberId, b: MemberId) {
        let mut routes = self.routes();
        routes.blocked.remove(&(a, b));
        routes.blocked.remove(&(b, a));
    }

    /// Cuts `member` off from every other registered node.
    pub fn isolate(&self, member: MemberId) {
        let mut routes = self.routes();
        let others: Vec<_> = routes
            .nodes
            .keys()
            .copied()
            .filter(|id| *id != member)
            .collect();
        for other in others {
            routes.blocked.insert((member, other));
            routes.blocked.insert((other, member));
        }
        tracing::debug!(node_id = member, "Isolated node");
    }

    /// Restores every link to and from `member`.
    pub fn heal(&self, member: MemberId) {
        self.routes()
            .blocked
            .retain(|(from, to)| *from != member && *to != member);
        tracing::debug!(node_id = member, "Healed node");
    }

    /// Splits the cluster so that only members of the same group can talk.
    pub fn partition(&self, groups: &[&[MemberId]]) {
        let mut routes = self.routes();
        for (i, group) in groups.iter().enumerate() {
            for (j, other) in groups.iter().enumerate() {
                if i == j {
                    continue;
                }
                for a in group.iter() {
                    for b in other.iter() {
                        routes.blocked.insert((*a, *b));
                    }
                }
            }
        }
    }

    pub fn heal_all(&self) {
        self.routes().blocked.clear();
    }

    fn route(&self, from: MemberId, to: MemberId) -> Result<NodeHandle, TransportError> {
        let routes = self.routes();
        if routes.blocked.contains(&(from, to)) {
            return Err(TransportError::Partitioned { from, to });
        }
        routes
            .nodes
            .get(&to)
            .cloned()
            .ok_or(TransportError::Unreachable(to))
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        match self.routes.lock() {
            Ok(routes) => routes,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct LocalTransport {
    network: LocalNetwork,
    source: MemberId,
}

impl LocalTransport {
    /// Routes a request and re-checks the link for the response, so a
    /// partition raised mid-flight also drops the reply.
    async fn deliver<T, F, Fut>(&self, target: MemberId, send: F) -> Result<T, TransportError>
    where
        F: FnOnce(NodeHandle) -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<T>>,
    {
        let handle = self.network.route(self.source, target)?;
        let response = send(handle)
            .await
            .map_err(|_| TransportError::Closed(target))?;
        self.network.route(target, self.source)?;
        Ok(response)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn ping(
        &self,
        target: MemberId,
        request: PingRequest,
    ) -> Result<PingResponse, TransportError> {
        self.deliver(target, |node| async move { node.ping(request).await })
            .await
    }

    async fn append(
        &self,
        target: MemberId,
        request: AppendRequest,
    ) -> Result<AppendResponse, TransportError> {
        self.deliver(target, |node| async move { node.append(request).await })
            .await
    }

    async fn vote(
        &self,
        target: MemberId,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        self.deliver(target, |node| async move { node.vote(request).await })
            .await
    }

    async fn query(
        &self,
        target: MemberId,
        request: QueryRequest,
    ) -> Result<QueryResponse, TransportError> {
        self.deliver(target, |node| async move { node.query(request).await })
            .await
    }

    async fn commit(
        &self,
        target: MemberId,
        request: CommitRequest,
    ) -> Result<CommitResponse, TransportError> {
        self.deliver(target, |node| async move { node.commit(request).await })
            .await
    }
}
