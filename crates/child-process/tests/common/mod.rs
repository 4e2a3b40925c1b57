//! Shared helpers for integration tests

#![allow(dead_code)]

use child_process::{ProcessEvent, ProcessHandle};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Upper bound for any single test process
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Drain a handle's event channel until it closes
pub async fn collect(mut events: UnboundedReceiver<ProcessEvent>) -> Vec<ProcessEvent> {
    let drain = async {
        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            collected.push(event);
        }
        collected
    };
    tokio::time::timeout(TIMEOUT, drain)
        .await
        .expect("process did not finish in time")
}

/// Spawn-time subscription plus drain
pub async fn run_to_exit(handle: &ProcessHandle) -> Vec<ProcessEvent> {
    collect(handle.events()).await
}

/// Concatenated stdout chunks
pub fn stdout_bytes(events: &[ProcessEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            ProcessEvent::Stdout(chunk) => Some(chunk.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}

/// Every stderr payload
pub fn stderr_events(events: &[ProcessEvent]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|event| match event {
            ProcessEvent::Stderr(data) => Some(data.clone()),
            _ => None,
        })
        .collect()
}

/// Every exit code
pub fn exit_codes(events: &[ProcessEvent]) -> Vec<i32> {
    events
        .iter()
        .filter_map(|event| match event {
            ProcessEvent::Exit(code) => Some(*code),
            _ => None,
        })
        .collect()
}

/// Thread-safe event log for callback subscriptions
#[derive(Clone, Default)]
pub struct Recorder(std::sync::Arc<parking_lot::Mutex<Vec<ProcessEvent>>>);

impl Recorder {
    pub fn push(&self, event: ProcessEvent) {
        self.0.lock().push(event);
    }

    pub fn snapshot(&self) -> Vec<ProcessEvent> {
        self.0.lock().clone()
    }
}
