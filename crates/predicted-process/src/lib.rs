//! # predicted-process
//!
//! **Purpose**: Cancellable, memoized execution of shell commands
//!
//! A [`PredictedProcess`] wraps one shell command. Each call to
//! [`run`](PredictedProcess::run) launches the command as an OS process with
//! inherited stdio, unless a run under the same [`CancelSignal`] is already
//! memoized, in which case that run's future is returned instead.
//!
//! ## Features
//!
//! - **Memoization by signal**: one run per signal identity, in flight or settled
//! - **Cancellation**: cancelling the signal terminates the OS process
//! - **Error classification**: spawn failure, non-zero exit, cancellation
//! - **Memoized views**: [`PredictedProcess::memoize`] shares only the cache
//! - **Batch runs**: [`ProcessManager::run_all`] runs every member concurrently
//! - **Graceful termination**: SIGTERM→SIGKILL escalation with a configurable grace period
//!
//! ## Usage
//!
//! ```rust,no_run
//! use predicted_process::{CancelSource, PredictedProcess, RunError};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let process = PredictedProcess::new(1, "sleep 30");
//! let source = CancelSource::new();
//!
//! let run = process.run(Some(&source.signal()));
//! source.cancel();
//!
//! assert!(matches!(run.await, Err(RunError::Cancelled)));
//! # }
//! ```

pub mod config;
pub mod error;
pub mod launcher;
pub mod manager;
pub mod memo;
pub mod process;
pub mod signal;

pub use config::{ConfigLoader, LauncherConfig};
pub use error::{ProcessError, Result, RunError};
pub use launcher::{ExitReport, Launch, LaunchEvent, ProcessHandle, ProcessLauncher, ShellLauncher};
pub use manager::ProcessManager;
pub use memo::MemoTable;
pub use process::{PredictedProcess, ProcessId, RunFuture, RunOutcome};
pub use signal::{CancelSignal, CancelSource, SignalId};
