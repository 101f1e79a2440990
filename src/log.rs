//! Replicated log abstraction.
//!
//! Storage internals live outside this crate; the consensus core only needs
//! indexed access to an append-only sequence of term-tagged entries.

use serde::{Deserialize, Serialize};

use crate::error::{ConsensusError, Result};

/// A single entry in the replicated log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term of the leader that created the entry.
    pub term: u64,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            term,
            payload: payload.into(),
        }
    }
}

/// Indexed, append-only entry storage. Indexes are 1-based.
pub trait Log: Send + 'static {
    /// Appends an entry and returns its index.
    fn append(&mut self, entry: LogEntry) -> Result<u64>;

    fn get(&self, index: u64) -> Option<&LogEntry>;

    fn first_index(&self) -> Option<u64>;

    fn last_index(&self) -> Option<u64>;

    fn contains_index(&self, index: u64) -> bool {
        match (self.first_index(), self.last_index()) {
            (Some(first), Some(last)) => index >= first && index <= last,
            _ => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.last_index().is_none()
    }

    /// Removes the entry at `index` and everything after it.
    ///
    /// Only followers call this, to discard an uncommitted suffix that
    /// conflicts with the leader's log.
    fn truncate(&mut self, index: u64) -> Result<()>;

    /// Term of the entry at `index`, if present.
    fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    fn last_term(&self) -> Option<u64> {
        self.last_index().and_then(|i| self.term_at(i))
    }
}

/// In-memory log backed by a `Vec`.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Vec<LogEntry>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Log for MemoryLog {
    fn append(&mut self, entry: LogEntry) -> Result<u64> {
        self.entries.push(entry);
        Ok(self.entries.len() as u64)
    }

    fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    fn first_index(&self) -> Option<u64> {
        if self.entries.is_empty() {
            None
        } else {
            Some(1)
        }
    }

    fn last_index(&self) -> Option<u64> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.len() as u64)
        }
    }

    fn truncate(&mut self, index: u64) -> Result<()> {
        if index == 0 {
            return Err(ConsensusError::Log("cannot truncate at index 0".to_string()));
        }
        self.entries.truncate((index - 1) as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_log() {
        let log = MemoryLog::new();
        assert!(log.is_empty());
        assert_eq!(log.first_index(), None);
        assert_eq!(log.last_index(), None);
        assert!(!log.contains_index(1));
        assert!(log.get(0).is_none());
        assert_eq!(log.last_term(), None);
    }

    #[test]
    fn test_append_and_get() {
        let mut log = MemoryLog::new();
        assert_eq!(log.append(LogEntry::new(1, b"a".to_vec())).unwrap(), 1);
        assert_eq!(log.append(LogEntry::new(2, b"b".to_vec())).unwrap(), 2);

        assert_eq!(log.first_index(), Some(1));
        assert_eq!(log.last_index(), Some(2));
        assert_eq!(log.get(1).unwrap().payload, b"a");
        assert_eq!(log.term_at(2), Some(2));
        assert_eq!(log.last_term(), Some(2));
        assert!(log.contains_index(2));
        assert!(!log.contains_index(3));
        assert!(log.get(3).is_none());
    }

    #[test]
    fn test_truncate() {
        let mut log = MemoryLog::new();
        for term in 1..=3 {
            log.append(LogEntry::new(term, Vec::new())).unwrap();
        }
        log.truncate(2).unwrap();
        assert_eq!(log.last_index(), Some(1));

        log.truncate(1).unwrap();
        assert!(log.is_empty());

        assert!(log.truncate(0).is_err());
    }
}
