use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ConsensusError, Result};
use crate::protocol::Consistency;

type CommandHandler<S> = Box<dyn Fn(&mut S, Value) -> Result<Value> + Send + Sync>;
type QueryHandler<S> = Box<dyn Fn(&S, Value) -> Result<Value> + Send + Sync>;

/// How an operation reaches the state: through the log, or as a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Command,
    Query(Consistency),
}

enum Handler<S> {
    Command(CommandHandler<S>),
    Query(Consistency, QueryHandler<S>),
}

/// Names and kinds of the operations in a table, shared with clients.
pub type Catalog = Arc<HashMap<String, OperationKind>>;

/// Named operations over a state value `S`.
pub struct OperationTable<S> {
    operations: HashMap<String, Handler<S>>,
}

impl<S> Default for OperationTable<S> {
    fn default() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }
}

impl<S> OperationTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mutating operation. Replaces any operation of the same name.
    pub fn command(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&mut S, Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.operations
            .insert(name.into(), Handler::Command(Box::new(handler)));
        self
    }

    /// Registers a read-only operation served at `consistency`.
    pub fn query(
        mut self,
        name: impl Into<String>,
        consistency: Consistency,
        handler: impl Fn(&S, Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.operations
            .insert(name.into(), Handler::Query(consistency, Box::new(handler)));
        self
    }

    pub fn kind(&self, name: &str) -> Option<OperationKind> {
        self.operations.get(name).map(|handler| match handler {
            Handler::Command(_) => OperationKind::Command,
            Handler::Query(consistency, _) => OperationKind::Query(*consistency),
        })
    }

    pub fn catalog(&self) -> Catalog {
        Arc::new(
            self.operations
                .keys()
                .filter_map(|name| self.kind(name).map(|kind| (name.clone(), kind)))
                .collect(),
        )
    }

    /// Runs a committed operation. Queries are allowed as well.
    pub fn apply(&self, state: &mut S, name: &str, args: Value) -> Result<Value> {
        match self.operations.get(name) {
            Some(Handler::Command(handler)) => handler(state, args),
            Some(Handler::Query(_, handler)) => handler(state, args),
            None => Err(unknown(name)),
        }
    }

    /// Runs a read-only operation; commands are rejected.
    pub fn read(&self, state: &S, name: &str, args: Value) -> Result<Value> {
        match self.operations.get(name) {
            Some(Handler::Query(_, handler)) => handler(state, args),
            Some(Handler::Command(_)) => Err(ConsensusError::Application(format!(
                "operation {} is a command and must be committed",
                name
            ))),
            None => Err(unknown(name)),
        }
    }
}

fn unknown(name: &str) -> ConsensusError {
    ConsensusError::Application(format!("unknown operation {}", name))
}
