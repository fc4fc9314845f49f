//! The dispatcher's view of the fleet.
//!
//! A read-mostly snapshot of the manager's server table, replaced
//! wholesale by the redistribution loop. Request handlers only read
//! it; a lookup miss triggers at most one inline refresh.

use std::collections::HashMap;
use std::sync::RwLock;

use cachemesh_core::{ServerEntry, ServerId};

/// Server id -> (port, last capacity factor), as last pulled from the
/// manager's control API.
#[derive(Debug, Default)]
pub struct BackendTable {
    entries: RwLock<HashMap<ServerId, ServerEntry>>,
}

impl BackendTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a freshly pulled table.
    pub fn replace(&self, entries: HashMap<ServerId, ServerEntry>) {
        *self.entries.write().expect("backend table lock") = entries;
    }

    pub fn get(&self, id: ServerId) -> Option<ServerEntry> {
        self.entries
            .read()
            .expect("backend table lock")
            .get(&id)
            .copied()
    }

    /// Deep copy for iteration.
    pub fn snapshot(&self) -> HashMap<ServerId, ServerEntry> {
        self.entries.read().expect("backend table lock").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("backend table lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
