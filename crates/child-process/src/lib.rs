//! # child-process
//!
//! **Purpose**: Event-driven child process lifecycle
//!
//! Spawns an external program, streams its stdout back as data events,
//! feeds it stdin, and reports its termination exactly once.
//!
//! ## Features
//!
//! - **Streaming stdout**: One event per chunk read from the pipe, starting
//!   before `spawn` returns; output is held for listeners that attach while
//!   the process runs, up to a fixed limit
//! - **Buffered stderr**: Collected whole and delivered once, right before
//!   exit, unless merged into stdout at the OS level
//! - **Exactly-once exit**: A single finalize path shared by event delivery,
//!   `wait` and `kill`
//! - **Stdin control**: Awaited writes and an explicit `end`
//! - **Shutdown sweep**: A process-wide registry kills every live child on
//!   host shutdown
//!
//! ## Usage
//!
//! ```rust,no_run
//! use child_process::{spawn, ProcessEvent, SpawnOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let _shutdown = child_process::shutdown_guard();
//!
//! let child = spawn("cat", Vec::<String>::new(), SpawnOptions::new())?;
//! let mut events = child.events();
//!
//! child.stdin().write("abc").await?;
//! child.stdin().end().await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ProcessEvent::Stdout(chunk) => print!("{}", String::from_utf8_lossy(&chunk)),
//!         ProcessEvent::Stderr(all) => eprint!("{}", String::from_utf8_lossy(&all)),
//!         ProcessEvent::Exit(code) => println!("exited with {code}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod registry;
pub mod stream;
mod sink;
mod transport;
mod watcher;

pub use config::{Args, Executable, IntoArgs, SpawnOptions};
pub use error::{ProcessError, Result};
pub use events::{EventKind, Interest, ProcessEvent, SubscriptionId, BACKLOG_LIMIT};
pub use handle::ProcessHandle;
pub use registry::{shutdown_guard, ProcessRegistry, ShutdownGuard};
pub use stream::{InputStream, OutputStream, StreamKind};
pub use watcher::Lifecycle;

/// Spawn a child process. See [`ProcessHandle::spawn`].
pub fn spawn(
    command: impl Into<Executable>,
    args: impl IntoArgs,
    options: SpawnOptions,
) -> Result<ProcessHandle> {
    ProcessHandle::spawn(command, args, options)
}
