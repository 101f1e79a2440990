//! Pending result handles keyed by log index.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::{ConsensusError, Result};

pub type ResultReceiver = oneshot::Receiver<Result<u64>>;

/// A result slot that may be completed from several places; the first
/// completion wins and later ones are ignored.
#[derive(Clone, Debug)]
pub struct PendingResult {
    tx: Arc<Mutex<Option<oneshot::Sender<Result<u64>>>>>,
}

impl PendingResult {
    pub fn new() -> (Self, ResultReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Returns a receiver that already holds `result`.
    pub fn ready(result: Result<u64>) -> ResultReceiver {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        rx
    }

    /// Completes the slot. Returns false if it was already completed.
    pub fn complete(&self, result: Result<u64>) -> bool {
        let tx = match self.tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match tx {
            Some(tx) => {
                // The waiter may have gone away; the slot still counts as resolved.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        match self.tx.lock() {
            Ok(slot) => slot.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

/// Ordered index -> waiters map. Each registered waiter is resolved or
/// failed exactly once, after which it leaves the registry.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    entries: BTreeMap<u64, Vec<PendingResult>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct indexes with waiters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, index: u64) -> bool {
        self.entries.contains_key(&index)
    }

    /// Highest index with an outstanding waiter.
    pub fn last_index(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }

    /// Registers a new waiter for `index`.
    pub fn register(&mut self, index: u64) -> ResultReceiver {
        let (pending, rx) = PendingResult::new();
        self.insert(index, pending);
        rx
    }

    /// Adds an existing slot as a waiter for `index`.
    pub fn insert(&mut self, index: u64, pending: PendingResult) {
        self.entries.entry(index).or_default().push(pending);
    }

    /// Completes every waiter at or below `index` with `value`, in
    /// ascending order. Returns how many slots were completed.
    pub fn resolve_through(&mut self, index: u64, value: impl Fn(u64) -> u64) -> usize {
        let above = match index.checked_add(1) {
            Some(next) => self.entries.split_off(&next),
            None => BTreeMap::new(),
        };
        let resolved = std::mem::replace(&mut self.entries, above);
        let mut count = 0;
        for (key, waiters) in resolved {
            for waiter in waiters {
                if waiter.complete(Ok(value(key))) {
                    count += 1;
                }
            }
        }
        count
    }

    /// Fails the waiters registered exactly at `index`.
    pub fn fail(&mut self, index: u64, error: &ConsensusError) -> usize {
        self.entries
            .remove(&index)
            .map(|waiters| Self::fail_all_of(waiters, error))
            .unwrap_or(0)
    }

    /// Fails every waiter in `start..=end`.
    pub fn fail_range(&mut self, start: u64, end: u64, error: &ConsensusError) -> usize {
        if end < start {
            return 0;
        }
        let keys: Vec<u64> = self.entries.range(start..=end).map(|(k, _)| *k).collect();
        keys.into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .map(|waiters| Self::fail_all_of(waiters, error))
            .sum()
    }

    pub fn fail_all(&mut self, error: &ConsensusError) -> usize {
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|waiters| Self::fail_all_of(waiters, error))
            .sum()
    }

    fn fail_all_of(waiters: Vec<PendingResult>, error: &ConsensusError) -> usize {
        waiters
            .into_iter()
            .filter(|w| w.complete(Err(error.clone())))
            .count()
    }
}
