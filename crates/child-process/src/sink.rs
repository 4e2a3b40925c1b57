//! Stderr accumulation buffer

use parking_lot::Mutex;
use std::sync::Arc;

/// Sink shared between the transport (writer) and the exit watcher (drainer)
pub(crate) type SharedSink = Arc<Mutex<StderrSink>>;

/// Collects the whole stderr stream until the process terminates
#[derive(Debug, Default)]
pub(crate) struct StderrSink {
    data: Vec<u8>,
    open: bool,
}

impl StderrSink {
    /// Create an open, empty sink
    pub(crate) fn open() -> Self {
        Self {
            data: Vec::new(),
            open: true,
        }
    }

    pub(crate) fn shared() -> SharedSink {
        Arc::new(Mutex::new(Self::open()))
    }

    /// Append bytes. Ignored once the sink is shut down.
    pub(crate) fn append(&mut self, bytes: &[u8]) {
        if self.open {
            self.data.extend_from_slice(bytes);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    #[cfg(test)]
    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take the collected bytes, leaving the sink empty
    pub(crate) fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    /// Close the sink and release its buffer
    pub(crate) fn shutdown(&mut self) {
        self.open = false;
        self.data = Vec::new();
    }
}
