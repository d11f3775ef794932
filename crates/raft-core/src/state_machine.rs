//! # state_machine
//!
//! why: the boundary where committed entries leave the consensus core
//! relations: driven exclusively by the apply loop in log.rs, once per committed index, in order
//! what: StateMachine trait, KvStore (SET/DEL commands over an in-memory map)

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::LogEntry;

pub type ApplyError = Box<dyn Error + Send + Sync>;

/// Consumer of committed, ordered log entries.
///
/// Errors are logged by the apply loop and never retried, so implementations
/// must tolerate seeing an already-applied prefix again after a restart.
pub trait StateMachine: Send {
    fn apply(&mut self, entry: &LogEntry) -> Result<(), ApplyError>;
}

/// Key/value state machine over `SET <key> <value>` and `DEL <key>` payloads.
///
/// Clones share the same map, so a caller can keep one to read while the
/// node owns another.
#[derive(Debug, Clone, Default)]
pub struct KvStore {
    data: Arc<RwLock<BTreeMap<String, String>>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.read().clone()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, entry: &LogEntry) -> Result<(), ApplyError> {
        let command = std::str::from_utf8(&entry.payload)?.trim();
        if command.is_empty() {
            return Ok(());
        }

        let mut parts = command.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("SET"), Some(key), Some(value)) => {
                self.data.write().insert(key.to_string(), value.to_string());
                Ok(())
            }
            (Some("DEL"), Some(key), None) => {
                self.data.write().remove(key);
                Ok(())
            }
            _ => Err(format!("unrecognised command at index {}: {command:?}", entry.index).into()),
        }
    }
}
