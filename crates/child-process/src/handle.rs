//! Process handle - the aggregate root of one spawned child

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::{
    config::{Args, Executable, IntoArgs, SpawnOptions},
    error::{ProcessError, Result},
    events::{EventHub, Interest, ProcessEvent, SubscriptionId},
    registry::ProcessRegistry,
    sink::StderrSink,
    stream::{InputStream, OutputStream, StdoutListener, StreamKind},
    transport::{KillSwitch, LaunchSpec, PipeTransport, StderrTarget},
    watcher::{ExitWatcher, Lifecycle, WatcherLink},
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    command: Executable,
    args: Args,
    options: SpawnOptions,
    pid: Option<u32>,
    hub: Arc<EventHub>,
    stdin: InputStream,
    kill: KillSwitch,
    lifecycle: Arc<Mutex<Lifecycle>>,
    completion: watch::Receiver<Option<i32>>,
}

/// Handle to a spawned child process
///
/// Clones refer to the same process. The handle stays usable after the
/// process exits: `wait` returns the recorded code and late exit subscribers
/// still get the exit event. Output is only replayed while the process runs.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<Inner>,
}

impl ProcessHandle {
    /// Spawn a child process
    ///
    /// Stdout pumping starts before this returns. Must be called from within
    /// a tokio runtime.
    ///
    /// # Examples
    /// ```no_run
    /// use child_process::{ProcessHandle, SpawnOptions};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let child = ProcessHandle::spawn("echo", ["hello"], SpawnOptions::new())?;
    /// child.stdout().on_data(|chunk| print!("{}", String::from_utf8_lossy(chunk)));
    /// let code = child.wait().await?;
    /// assert_eq!(code, 0);
    /// # Ok(())
    /// # }
    /// ```
    pub fn spawn(
        command: impl Into<Executable>,
        args: impl IntoArgs,
        options: SpawnOptions,
    ) -> Result<Self> {
        let command = command.into();
        let args = args.into_args()?;
        let env = options.env_pairs()?;

        debug!(
            command = %command,
            args = ?args.as_slice(),
            merge_stderr = options.merge_stderr,
            "Spawning process"
        );

        let sink = if options.merge_stderr {
            None
        } else {
            Some(StderrSink::shared())
        };
        let stderr = match &sink {
            Some(sink) => StderrTarget::Sink(Arc::clone(sink)),
            None => StderrTarget::Merge,
        };

        let (transport, stdin) = PipeTransport::open(LaunchSpec {
            executable: &command,
            cwd: options.cwd.as_deref(),
            args: args.as_slice(),
            env: &env,
            stderr,
        })?;

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let pid = transport.pid();
        let hub = Arc::new(EventHub::new());
        let stdin = InputStream::new(stdin);
        let lifecycle = Arc::new(Mutex::new(Lifecycle::Running));
        let (completion_tx, completion_rx) = watch::channel(None);

        info!(id, pid = ?pid, command = %command, "Process spawned");

        let handle = Self {
            inner: Arc::new(Inner {
                id,
                command,
                args,
                options,
                pid,
                hub: Arc::clone(&hub),
                stdin: stdin.clone(),
                kill: transport.kill_switch(),
                lifecycle: Arc::clone(&lifecycle),
                completion: completion_rx,
            }),
        };

        let registry = ProcessRegistry::global();
        registry.register(handle.clone());

        let watcher = ExitWatcher::new(
            id,
            lifecycle,
            WatcherLink {
                hub: Arc::clone(&hub),
                sink,
                stdin,
                registry,
                completion: completion_tx,
            },
        );
        let mut listener = StdoutListener::new(hub);
        listener.observe(watcher);
        transport.async_read(listener);

        Ok(handle)
    }

    /// Wait until the exit event has been delivered and return its code
    ///
    /// Returns immediately once the process has exited.
    pub async fn wait(&self) -> Result<i32> {
        let mut completion = self.inner.completion.clone();
        let code = *completion
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ProcessError::Aborted)?;
        code.ok_or(ProcessError::Aborted)
    }

    /// Blocking variant of [`wait`](Self::wait) for threads outside the
    /// runtime. Calling it on a runtime worker thread stalls that worker.
    pub fn wait_blocking(&self) -> Result<i32> {
        futures::executor::block_on(self.wait())
    }

    /// Forcefully terminate the process
    ///
    /// Never fails. Does nothing once the process has exited. The exit event
    /// still arrives through the normal path.
    pub fn kill(&self) {
        if *self.inner.lifecycle.lock() != Lifecycle::Running {
            return;
        }
        debug!(id = self.inner.id, pid = ?self.inner.pid, "Kill requested");
        self.inner.kill.trigger();
    }

    /// Stdout data events
    pub fn stdout(&self) -> OutputStream {
        OutputStream::new(StreamKind::Stdout, Arc::clone(&self.inner.hub))
    }

    /// Buffered stderr event. Emitted only when the child wrote to stderr.
    pub fn stderr(&self) -> OutputStream {
        OutputStream::new(StreamKind::Stderr, Arc::clone(&self.inner.hub))
    }

    /// Child stdin
    pub fn stdin(&self) -> &InputStream {
        &self.inner.stdin
    }

    /// Subscribe to the exit event
    pub fn on_exit<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.inner.hub.subscribe(Interest::EXIT, move |event| {
            if let ProcessEvent::Exit(code) = event {
                callback(*code);
            }
        })
    }

    /// Subscribe a callback to the event kinds in `interest`
    pub fn subscribe<F>(&self, interest: Interest, callback: F) -> SubscriptionId
    where
        F: Fn(&ProcessEvent) + Send + Sync + 'static,
    {
        self.inner.hub.subscribe(interest, callback)
    }

    /// Subscribe to every event through a channel
    ///
    /// The channel yields events in emission order and closes after
    /// [`ProcessEvent::Exit`].
    pub fn events(&self) -> mpsc::UnboundedReceiver<ProcessEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.hub.subscribe(Interest::ALL, move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Remove a subscription made through this handle or its streams
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.hub.unsubscribe(id)
    }

    /// Process-unique handle id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// OS process id, if the OS reported one at spawn time
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Executable that was started
    pub fn command(&self) -> &Executable {
        &self.inner.command
    }

    /// Arguments the process was started with
    pub fn args(&self) -> &[String] {
        self.inner.args.as_slice()
    }

    /// Options the process was started with
    pub fn options(&self) -> &SpawnOptions {
        &self.inner.options
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.lock()
    }

    /// Exit code, once the process has terminated
    pub fn exit_code(&self) -> Option<i32> {
        *self.inner.completion.borrow()
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid)
            .field("command", &self.inner.command)
            .field("args", &self.inner.args)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
