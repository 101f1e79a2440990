//! Replicated state driven by named operations.
//!
//! Payloads on the log are JSON invocations `{"op": <name>, "args": <value>}`;
//! results are the JSON encoding of the handler's return value.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConsensusError, Result};
use crate::raft::{Consumer, NodeHandle};
use crate::resource::registry::{Catalog, OperationKind, OperationTable};

#[derive(Debug, Serialize, Deserialize)]
struct Invocation {
    op: String,
    #[serde(default)]
    args: Value,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ConsensusError::Application(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| ConsensusError::Application(e.to_string()))
}

/// A state value plus the operations that read and change it.
pub struct StateLog<S> {
    state: S,
    table: OperationTable<S>,
}

impl<S: Send + 'static> StateLog<S> {
    pub fn new(state: S, table: OperationTable<S>) -> Self {
        Self { state, table }
    }

    pub fn catalog(&self) -> Catalog {
        self.table.catalog()
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Decodes and runs one invocation. `index` is set for committed
    /// entries and unset for queries.
    pub fn apply(&mut self, index: Option<u64>, payload: &[u8]) -> Result<Vec<u8>> {
        let invocation: Invocation = decode(payload)?;
        let result = match index {
            Some(index) => {
                tracing::trace!(index, op = %invocation.op, "Applying command");
                self.table
                    .apply(&mut self.state, &invocation.op, invocation.args)?
            }
            None => self
                .table
                .read(&self.state, &invocation.op, invocation.args)?,
        };
        encode(&result)
    }

    /// Turns this state into the consumer a node applies entries to.
    pub fn into_consumer(mut self) -> Consumer {
        Box::new(move |index: Option<u64>, payload: &[u8]| self.apply(index, payload))
    }
}

/// Submits named operations through a node.
#[derive(Clone)]
pub struct StateLogClient {
    node: NodeHandle,
    catalog: Catalog,
}

impl StateLogClient {
    pub fn new(node: NodeHandle, catalog: Catalog) -> Self {
        Self { node, catalog }
    }

    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    /// Commands are committed through the log; queries are read at their
    /// registered consistency.
    pub async fn submit<T: DeserializeOwned>(&self, name: &str, args: impl Serialize) -> Result<T> {
        let kind = self.catalog.get(name).copied().ok_or_else(|| {
            ConsensusError::Application(format!("unknown operation {}", name))
        })?;
        let args = serde_json::to_value(args)
            .map_err(|e| ConsensusError::Application(e.to_string()))?;
        let payload = encode(&Invocation {
            op: name.to_string(),
            args,
        })?;

        let output = match kind {
            OperationKind::Command => self.node.submit(payload).await?,
            OperationKind::Query(consistency) => self.node.read(payload, consistency).await?,
        };
        decode(&output)
    }
}
