//! Pipe transport over a tokio child process
//!
//! The transport owns the [`Child`] and its output pipes. A single pump
//! task reads them, services kill requests and joins the child; it reports
//! to a [`StreamListener`] and is the only code that ever produces the stop
//! notification for a process.
//!
//! Merged output is wired at the OS level: stdout and stderr share the write
//! end of one pipe, so the listener sees bytes in the order the child wrote
//! them.

use std::fmt;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    config::Executable,
    error::{ProcessError, Result},
    sink::SharedSink,
};

/// Read size for a single pipe read
const CHUNK_SIZE: usize = 8 * 1024;

/// Exit code reported when the OS gives neither a code nor a signal
pub(crate) const UNKNOWN_EXIT_CODE: i32 = -1;

/// Read end carrying the listener's data, either the child's stdout or the
/// shared stdout/stderr pipe
type OutputPipe = Box<dyn AsyncRead + Send + Unpin>;

/// Callbacks from the pump, in order: one start, any number of data
/// chunks, one stop
pub(crate) trait StreamListener: Send + 'static {
    fn on_start_request(&mut self);
    fn on_data_available(&mut self, chunk: &[u8]);
    fn on_stop_request(&mut self, exit_code: i32);
}

/// Where the child's stderr goes
#[derive(Debug)]
pub(crate) enum StderrTarget {
    /// Share the stdout pipe
    Merge,
    /// Accumulate stderr into a sink
    Sink(SharedSink),
}

/// Kill request channel into the pump task
#[derive(Debug, Clone, Default)]
pub(crate) struct KillSwitch(Arc<Notify>);

impl KillSwitch {
    /// Request a kill. Stored if the pump is busy, harmless after exit.
    pub(crate) fn trigger(&self) {
        self.0.notify_one();
    }

    async fn triggered(&self) {
        self.0.notified().await;
    }
}

/// What the transport needs to start a process
#[derive(Debug)]
pub(crate) struct LaunchSpec<'a> {
    pub executable: &'a Executable,
    pub cwd: Option<&'a Path>,
    pub args: &'a [String],
    pub env: &'a [(String, String)],
    pub stderr: StderrTarget,
}

/// Output wiring chosen before spawn
enum Wiring {
    Merged(io::PipeReader),
    Split(SharedSink),
}

/// A running child with its output pipes
pub(crate) struct PipeTransport {
    child: Child,
    stdout: OutputPipe,
    /// Separate stderr pipe and its sink; `None` when merged
    stderr: Option<(ChildStderr, SharedSink)>,
    kill: KillSwitch,
}

impl PipeTransport {
    /// Start the process. Returns the transport and the child's stdin.
    pub(crate) fn open(spec: LaunchSpec<'_>) -> Result<(Self, ChildStdin)> {
        let mut cmd = Command::new(spec.executable);
        cmd.args(spec.args);

        if let Some(dir) = spec.cwd {
            cmd.current_dir(dir);
        }

        for (key, value) in spec.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::piped()).kill_on_drop(true);

        let wiring = match spec.stderr {
            StderrTarget::Merge => {
                let (reader, writer) = io::pipe()?;
                cmd.stdout(writer.try_clone()?).stderr(writer);
                Wiring::Merged(reader)
            }
            StderrTarget::Sink(sink) => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
                Wiring::Split(sink)
            }
        };

        let spawned = cmd.spawn();
        // The command holds our copies of a shared write end; EOF on the
        // merged pipe needs them closed
        drop(cmd);
        let mut child = spawned?;
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;

        let (stdout, stderr): (OutputPipe, _) = match wiring {
            Wiring::Merged(reader) => (merged_reader(reader)?, None),
            Wiring::Split(sink) => {
                let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
                let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
                (Box::new(stdout) as OutputPipe, Some((stderr, sink)))
            }
        };

        Ok((
            Self {
                child,
                stdout,
                stderr,
                kill: KillSwitch::default(),
            },
            stdin,
        ))
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub(crate) fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    /// Start pumping output into `listener` on the current runtime
    pub(crate) fn async_read<L: StreamListener>(self, listener: L) -> JoinHandle<()> {
        tokio::spawn(self.pump(listener))
    }

    async fn pump<L: StreamListener>(self, mut listener: L) {
        let Self {
            mut child,
            mut stdout,
            mut stderr,
            kill,
        } = self;
        let pid = child.id();

        listener.on_start_request();

        let mut stdout_buf = vec![0u8; CHUNK_SIZE];
        let mut stderr_buf = vec![0u8; CHUNK_SIZE];
        let mut stdout_open = true;
        let mut stderr_open = stderr.is_some();
        let mut status: Option<io::Result<ExitStatus>> = None;

        while stdout_open || stderr_open || status.is_none() {
            tokio::select! {
                read = stdout.read(&mut stdout_buf), if stdout_open => match read {
                    Ok(0) => stdout_open = false,
                    Ok(n) => listener.on_data_available(&stdout_buf[..n]),
                    Err(e) => {
                        warn!(pid = ?pid, error = %e, "Failed to read stdout");
                        stdout_open = false;
                    }
                },
                read = read_stderr(&mut stderr, &mut stderr_buf), if stderr_open => match read {
                    Ok(0) => stderr_open = false,
                    Ok(n) => {
                        if let Some((_, sink)) = &stderr {
                            sink.lock().append(&stderr_buf[..n]);
                        }
                    }
                    Err(e) => {
                        warn!(pid = ?pid, error = %e, "Failed to read stderr");
                        stderr_open = false;
                    }
                },
                result = child.wait(), if status.is_none() => {
                    status = Some(result);
                }
                _ = kill.triggered(), if status.is_none() => {
                    // Fails only when the child is already reaped
                    if let Err(e) = child.start_kill() {
                        debug!(pid = ?pid, error = %e, "Kill request ignored");
                    }
                }
            }
        }

        let exit_code = match status {
            Some(Ok(status)) => exit_code(status),
            Some(Err(e)) => {
                warn!(pid = ?pid, error = %e, "Failed to join process");
                UNKNOWN_EXIT_CODE
            }
            None => UNKNOWN_EXIT_CODE,
        };
        listener.on_stop_request(exit_code);
    }
}

impl fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeTransport")
            .field("pid", &self.child.id())
            .field("merged", &self.stderr.is_none())
            .finish_non_exhaustive()
    }
}

async fn read_stderr(
    stderr: &mut Option<(ChildStderr, SharedSink)>,
    buf: &mut [u8],
) -> io::Result<usize> {
    match stderr {
        Some((pipe, _)) => pipe.read(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn merged_reader(reader: io::PipeReader) -> io::Result<OutputPipe> {
    let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(reader.into())?;
    Ok(Box::new(receiver))
}

#[cfg(windows)]
fn merged_reader(reader: io::PipeReader) -> io::Result<OutputPipe> {
    // Anonymous pipes have no async reader here; reads run on the blocking pool
    let handle = std::os::windows::io::OwnedHandle::from(reader);
    Ok(Box::new(tokio::fs::File::from_std(std::fs::File::from(handle))))
}

fn missing_pipe(name: &str) -> ProcessError {
    ProcessError::SpawnFailed(io::Error::other(format!("child {name} pipe unavailable")))
}

/// Exit code of a finished process. Signal deaths map to `128 + signal`.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    UNKNOWN_EXIT_CODE
}
