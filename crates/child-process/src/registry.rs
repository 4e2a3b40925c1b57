//! Process-wide table of live child processes
//!
//! Handles are inserted by [`spawn`](crate::spawn) and removed by their exit
//! watcher right after the exit event. At host shutdown the table is swept
//! once and every remaining child is killed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::handle::ProcessHandle;

static GLOBAL: OnceLock<ProcessRegistry> = OnceLock::new();

/// Table of live processes keyed by handle id
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: Mutex<HashMap<u64, ProcessHandle>>,
    drained: AtomicBool,
}

impl ProcessRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry every spawned handle is recorded in
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(Self::new)
    }

    /// Insert a handle
    pub fn register(&self, handle: ProcessHandle) {
        let id = handle.id();
        self.processes.lock().insert(id, handle);
        debug!(id, "Process registered");
    }

    /// Remove a handle by id
    pub fn unregister(&self, id: u64) -> Option<ProcessHandle> {
        let removed = self.processes.lock().remove(&id);
        if removed.is_some() {
            debug!(id, "Process unregistered");
        }
        removed
    }

    /// Check if a handle is registered
    pub fn contains(&self, id: u64) -> bool {
        self.processes.lock().contains_key(&id)
    }

    /// Number of registered handles
    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    /// Whether no handles are registered
    pub fn is_empty(&self) -> bool {
        self.processes.lock().is_empty()
    }

    /// Ids of registered handles, ascending
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.processes.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Kill every registered process. Returns how many were signalled.
    ///
    /// The table stays locked for the sweep so a concurrent spawn is either
    /// killed here or registered afterwards.
    pub fn kill_all(&self) -> usize {
        let processes = self.processes.lock();
        for handle in processes.values() {
            handle.kill();
        }
        processes.len()
    }

    /// Run [`kill_all`](Self::kill_all) once; later calls do nothing
    pub fn shutdown(&self) -> usize {
        if self.drained.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let killed = self.kill_all();
        info!(killed, "Process registry drained");
        killed
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }
}

/// Drains the global registry when dropped
///
/// Keep one alive for the lifetime of `main` so no child outlives the host.
#[derive(Debug)]
#[must_use = "the registry is drained when the guard is dropped"]
pub struct ShutdownGuard {
    _private: (),
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        ProcessRegistry::global().shutdown();
    }
}

/// Create a guard that drains the global registry on drop
pub fn shutdown_guard() -> ShutdownGuard {
    ShutdownGuard { _private: () }
}
