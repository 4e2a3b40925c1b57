//! Exit watcher: the single finalize path of a process

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    events::{EventHub, ProcessEvent},
    registry::ProcessRegistry,
    sink::SharedSink,
    stream::{InputStream, RequestObserver},
};

/// Lifecycle state of a process handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Process is running or its output is still draining
    Running,
    /// Stop observed; flushing stderr and emitting exit
    Finalizing,
    /// Exit delivered; absorbing
    Terminated,
}

/// Everything the watcher needs from its handle. Dropped as a unit when the
/// watcher terminates.
pub(crate) struct WatcherLink {
    pub hub: Arc<EventHub>,
    /// None when stderr is merged into stdout
    pub sink: Option<SharedSink>,
    pub stdin: InputStream,
    pub registry: &'static ProcessRegistry,
    pub completion: watch::Sender<Option<i32>>,
}

/// Turns the transport's stop notification into exactly one exit event
pub(crate) struct ExitWatcher {
    id: u64,
    lifecycle: Arc<Mutex<Lifecycle>>,
    link: Option<WatcherLink>,
}

impl ExitWatcher {
    pub(crate) fn new(id: u64, lifecycle: Arc<Mutex<Lifecycle>>, link: WatcherLink) -> Self {
        Self {
            id,
            lifecycle,
            link: Some(link),
        }
    }

    fn finalize(&mut self, link: WatcherLink, exit_code: i32) {
        if let Some(sink) = link.sink {
            let data = {
                let mut sink = sink.lock();
                let data = sink.take_data();
                sink.shutdown();
                data
            };
            if !data.is_empty() {
                debug!(id = self.id, bytes = data.len(), "Flushing stderr");
                link.hub.emit(ProcessEvent::Stderr(data));
            }
        }

        link.hub.emit(ProcessEvent::Exit(exit_code));
        link.registry.unregister(self.id);
        link.stdin.detach();

        *self.lifecycle.lock() = Lifecycle::Terminated;
        link.completion.send_replace(Some(exit_code));
        link.hub.close();

        info!(id = self.id, code = exit_code, "Process exited");
    }
}

impl RequestObserver for ExitWatcher {
    fn on_start_request(&mut self) {
        debug!(id = self.id, "Watching process");
    }

    fn on_stop_request(&mut self, exit_code: i32) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Running {
                warn!(id = self.id, state = ?*lifecycle, "Ignoring repeated stop notification");
                return;
            }
            *lifecycle = Lifecycle::Finalizing;
        }

        if let Some(link) = self.link.take() {
            self.finalize(link, exit_code);
        }
    }
}

impl Drop for ExitWatcher {
    fn drop(&mut self) {
        // Pump task went away without a stop notification
        if let Some(link) = self.link.take() {
            warn!(id = self.id, "Process watcher dropped before exit");
            link.registry.unregister(self.id);
        }
    }
}
