//! Stdio streams of a child process

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    error::{ProcessError, Result},
    events::{EventHub, EventKind, ProcessEvent, SubscriptionId},
    transport::StreamListener,
};

/// Which output descriptor a stream reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Child stdout
    Stdout,
    /// Child stderr
    Stderr,
}

impl From<StreamKind> for EventKind {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Stdout => EventKind::Stdout,
            StreamKind::Stderr => EventKind::Stderr,
        }
    }
}

/// Data events of one output descriptor
///
/// Stdout produces one event per chunk read from the pipe. Stderr produces
/// at most one event carrying everything the child wrote, right before exit.
/// A child that wrote nothing to stderr gets no stderr event rather than an
/// empty one, and merged stderr never produces one.
#[derive(Clone)]
pub struct OutputStream {
    kind: StreamKind,
    hub: Arc<EventHub>,
}

impl OutputStream {
    pub(crate) fn new(kind: StreamKind, hub: Arc<EventHub>) -> Self {
        Self { kind, hub }
    }

    /// Descriptor this stream reads from
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Subscribe to data events. Data emitted while the process runs and
    /// before the first subscriber arrived is replayed immediately, up to
    /// [`BACKLOG_LIMIT`](crate::events::BACKLOG_LIMIT) bytes.
    pub fn on_data<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let kind = EventKind::from(self.kind);
        self.hub.subscribe(kind.into(), move |event| match event {
            ProcessEvent::Stdout(data) | ProcessEvent::Stderr(data) => callback(data),
            ProcessEvent::Exit(_) => {}
        })
    }

    /// Remove a data subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Start/stop notifications relayed from the stdout listener
pub(crate) trait RequestObserver: Send {
    fn on_start_request(&mut self);
    fn on_stop_request(&mut self, exit_code: i32);
}

/// Receives pump callbacks for stdout and turns them into events
pub(crate) struct StdoutListener {
    hub: Option<Arc<EventHub>>,
    observer: Option<Box<dyn RequestObserver>>,
    chunks: u64,
}

impl StdoutListener {
    pub(crate) fn new(hub: Arc<EventHub>) -> Self {
        Self {
            hub: Some(hub),
            observer: None,
            chunks: 0,
        }
    }

    /// Attach the observer that receives start/stop
    pub(crate) fn observe(&mut self, observer: impl RequestObserver + 'static) {
        self.observer = Some(Box::new(observer));
    }
}

impl StreamListener for StdoutListener {
    fn on_start_request(&mut self) {
        if let Some(observer) = self.observer.as_mut() {
            observer.on_start_request();
        }
    }

    fn on_data_available(&mut self, chunk: &[u8]) {
        if let Some(hub) = &self.hub {
            self.chunks += 1;
            hub.emit(ProcessEvent::Stdout(chunk.to_vec()));
        }
    }

    fn on_stop_request(&mut self, exit_code: i32) {
        debug!(chunks = self.chunks, "Stdout closed");
        if let Some(mut observer) = self.observer.take() {
            observer.on_stop_request(exit_code);
        }
        self.hub = None;
    }
}

enum StdinState {
    Open(ChildStdin),
    /// Closed by the caller
    Ended,
    /// Process terminated
    Detached,
}

struct StdinPipe {
    state: Mutex<StdinState>,
    /// Cleared as soon as `end` or termination begins, without waiting for
    /// an in-flight write to release `state`
    open: AtomicBool,
}

/// Write side of the child's stdin
#[derive(Clone)]
pub struct InputStream {
    pipe: Arc<StdinPipe>,
}

impl InputStream {
    pub(crate) fn new(stdin: ChildStdin) -> Self {
        Self::with_state(StdinState::Open(stdin), true)
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::with_state(StdinState::Detached, false)
    }

    fn with_state(state: StdinState, open: bool) -> Self {
        Self {
            pipe: Arc::new(StdinPipe {
                state: Mutex::new(state),
                open: AtomicBool::new(open),
            }),
        }
    }

    /// Write all of `data` to the child and flush it
    ///
    /// Fails with [`ProcessError::InvalidState`] after [`end`](Self::end),
    /// and with [`ProcessError::WriteFailed`] if the pipe is broken or the
    /// process has already terminated.
    pub async fn write(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let mut pipe = self.pipe.state.lock().await;
        match &mut *pipe {
            StdinState::Open(stdin) => {
                let data = data.as_ref();
                let written = async {
                    stdin.write_all(data).await?;
                    stdin.flush().await
                }
                .await;
                written.map_err(|e| ProcessError::WriteFailed(e.to_string()))
            }
            StdinState::Ended => Err(ProcessError::InvalidState(
                "stdin already closed".to_string(),
            )),
            StdinState::Detached => Err(ProcessError::WriteFailed(
                "process has exited".to_string(),
            )),
        }
    }

    /// Close stdin. A second call fails with [`ProcessError::InvalidState`].
    pub async fn end(&self) -> Result<()> {
        self.pipe.open.store(false, Ordering::Release);
        let mut pipe = self.pipe.state.lock().await;
        match std::mem::replace(&mut *pipe, StdinState::Ended) {
            StdinState::Open(stdin) => {
                drop(stdin);
                Ok(())
            }
            StdinState::Detached => Ok(()),
            StdinState::Ended => Err(ProcessError::InvalidState(
                "stdin already closed".to_string(),
            )),
        }
    }

    /// Whether writes can still reach the child
    ///
    /// False as soon as [`end`](Self::end) is called or the process has
    /// terminated, even while an earlier write is still in flight.
    pub fn is_open(&self) -> bool {
        self.pipe.open.load(Ordering::Acquire)
    }

    /// Release the pipe after termination. An in-flight write keeps it
    /// until the write fails on its own.
    pub(crate) fn detach(&self) {
        self.pipe.open.store(false, Ordering::Release);
        if let Ok(mut pipe) = self.pipe.state.try_lock() {
            if matches!(*pipe, StdinState::Open(_)) {
                *pipe = StdinState::Detached;
            }
        }
    }
}

impl fmt::Debug for InputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStream")
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Interest;
    use parking_lot::Mutex as SyncMutex;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::process::Command;

    struct CountingObserver(Arc<SyncMutex<Vec<&'static str>>>);

    impl RequestObserver for CountingObserver {
        fn on_start_request(&mut self) {
            self.0.lock().push("start");
        }

        fn on_stop_request(&mut self, _exit_code: i32) {
            self.0.lock().push("stop");
        }
    }

    #[test]
    fn test_listener_relays_chunks_and_notifications() {
        let hub = Arc::new(EventHub::new());
        let calls = Arc::new(SyncMutex::new(Vec::new()));
        let mut listener = StdoutListener::new(Arc::clone(&hub));
        listener.observe(CountingObserver(Arc::clone(&calls)));

        listener.on_start_request();
        listener.on_data_available(b"a\0b");
        listener.on_data_available(b"c");
        listener.on_stop_request(0);

        // References are dropped on stop
        assert!(listener.hub.is_none());
        assert!(listener.observer.is_none());
        listener.on_data_available(b"after stop");
        listener.on_stop_request(0);

        assert_eq!(*calls.lock(), vec!["start", "stop"]);

        let stdout = OutputStream::new(StreamKind::Stdout, hub);
        let chunks = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        stdout.on_data(move |data| sink.lock().push(data.to_vec()));
        assert_eq!(*chunks.lock(), vec![b"a\0b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_stderr_stream_ignores_stdout_events() {
        let hub = Arc::new(EventHub::new());
        let stderr = OutputStream::new(StreamKind::Stderr, Arc::clone(&hub));
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = stderr.on_data(move |data| sink.lock().push(data.to_vec()));

        hub.emit(ProcessEvent::Stdout(b"out".to_vec()));
        hub.emit(ProcessEvent::Stderr(b"err".to_vec()));
        assert_eq!(*seen.lock(), vec![b"err".to_vec()]);

        assert!(stderr.unsubscribe(id));
        // stdout chunk still waiting for a stdout subscriber
        let replayed = Arc::new(SyncMutex::new(0));
        let counter = Arc::clone(&replayed);
        hub.subscribe(Interest::STDOUT, move |_| *counter.lock() += 1);
        assert_eq!(*replayed.lock(), 1);
    }

    #[tokio::test]
    async fn test_write_then_end() {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdin = InputStream::new(child.stdin.take().unwrap());
        let mut stdout = child.stdout.take().unwrap();

        stdin.write("abc").await.unwrap();
        stdin.write(b"\0def").await.unwrap();
        assert!(stdin.is_open());
        stdin.end().await.unwrap();
        assert!(!stdin.is_open());

        let err = stdin.write("late").await.unwrap_err();
        assert!(matches!(err, ProcessError::InvalidState(_)));
        let err = stdin.end().await.unwrap_err();
        assert!(matches!(err, ProcessError::InvalidState(_)));

        let mut output = Vec::new();
        stdout.read_to_end(&mut output).await.unwrap();
        assert_eq!(output, b"abc\0def");
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_write_after_detach_fails() {
        let stdin = InputStream::detached();
        let err = stdin.write("x").await.unwrap_err();
        assert!(matches!(err, ProcessError::WriteFailed(_)));

        stdin.end().await.unwrap();
        let err = stdin.write("x").await.unwrap_err();
        assert!(matches!(err, ProcessError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_closed_while_end_waits_behind_write() {
        // sleep never reads, so a large write parks holding the pipe
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdin = InputStream::new(child.stdin.take().unwrap());

        let writer = stdin.clone();
        let write = tokio::spawn(async move { writer.write(vec![0u8; 1 << 20]).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(stdin.is_open());

        let closer = stdin.clone();
        let end = tokio::spawn(async move { closer.end().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!end.is_finished());
        assert!(!stdin.is_open());

        child.start_kill().unwrap();
        let written = write.await.unwrap();
        assert!(matches!(written, Err(ProcessError::WriteFailed(_))));
        end.await.unwrap().unwrap();
        assert!(!stdin.is_open());
        child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_detach_closes_immediately() {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdin = InputStream::new(child.stdin.take().unwrap());
        assert!(stdin.is_open());

        stdin.detach();
        assert!(!stdin.is_open());
        let err = stdin.write("x").await.unwrap_err();
        assert!(matches!(err, ProcessError::WriteFailed(_)));
        assert!(child.wait().await.unwrap().success());
    }
}
