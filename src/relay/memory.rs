//! In-process relay that records what it receives.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{RelayConnection, RelayConnector, RelayError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedUpload {
    pub remote_path: String,
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryState {
    remote: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    uploads: Vec<RecordedUpload>,
    opened: u64,
    closed: u64,
    fail_connects: bool,
    fail_uploads: bool,
}

/// Cloneable handle; clones share the same remote state.
#[derive(Clone, Debug, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file that already exists remotely.
    pub fn insert_remote(&self, remote_path: &str, name: &str, bytes: Vec<u8>) {
        self.lock()
            .remote
            .entry(remote_path.to_string())
            .or_default()
            .insert(name.to_string(), bytes);
    }

    pub fn fail_connects(&self, fail: bool) {
        self.lock().fail_connects = fail;
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.lock().fail_uploads = fail;
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.lock().uploads.clone()
    }

    pub fn upload_names(&self) -> Vec<String> {
        self.lock()
            .uploads
            .iter()
            .map(|upload| upload.name.clone())
            .collect()
    }

    pub fn opened(&self) -> u64 {
        self.lock().opened
    }

    pub fn closed(&self) -> u64 {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }
}

impl RelayConnector for MemoryRelay {
    fn open(&self) -> Result<Box<dyn RelayConnection>, RelayError> {
        let mut state = self.lock();
        if state.fail_connects {
            return Err(RelayError::Connect("memory relay refused connection".into()));
        }
        state.opened += 1;
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    closed: bool,
}

impl RelayConnection for MemoryConnection {
    fn list(&mut self, remote_path: &str) -> Result<HashSet<String>, RelayError> {
        if self.closed {
            return Err(RelayError::NotConnected);
        }
        Ok(lock_state(&self.state)
            .remote
            .get(remote_path)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn upload(&mut self, remote_path: &str, name: &str, bytes: &[u8]) -> Result<(), RelayError> {
        if self.closed {
            return Err(RelayError::NotConnected);
        }
        let mut state = lock_state(&self.state);
        if state.fail_uploads {
            return Err(RelayError::Upload {
                name: name.to_string(),
                reason: "memory relay rejected upload".to_string(),
            });
        }
        state
            .remote
            .entry(remote_path.to_string())
            .or_default()
            .insert(name.to_string(), bytes.to_vec());
        state.uploads.push(RecordedUpload {
            remote_path: remote_path.to_string(),
            name: name.to_string(),
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            lock_state(&self.state).closed += 1;
        }
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
