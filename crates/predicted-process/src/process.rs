//! Predicted processes: memoized, cancellable runs of one shell command
//!
//! A [`PredictedProcess`] launches a fresh OS process on every
//! [`run`](PredictedProcess::run) unless the caller passes a
//! [`CancelSignal`] whose run is already in the memo table, in which case
//! the cached future is handed back as-is.
//!
//! Each run is decided by the first of three notifications: spawn error,
//! process exit, or signal cancellation. Whichever wins performs the single
//! cleanup step (release the handle, request termination, clear the taint
//! set); the run stops listening afterwards, so late notifications are
//! dropped unseen.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::RunError;
use crate::launcher::{
    ExitReport, Launch, LaunchEvent, ProcessHandle, ProcessLauncher, ShellLauncher,
};
use crate::memo::MemoTable;
use crate::signal::CancelSignal;

/// Caller-assigned identifier of a predicted process
pub type ProcessId = u64;

/// Outcome of a single run
pub type RunOutcome = std::result::Result<(), RunError>;

/// Cloneable handle to a run's outcome; every clone observes the same run
pub type RunFuture = Shared<BoxFuture<'static, RunOutcome>>;

/// A reusable, memoizing handle to one shell command
pub struct PredictedProcess {
    id: ProcessId,
    command: Arc<str>,
    launcher: Arc<dyn ProcessLauncher>,
    memo: MemoTable,
    tracker: Arc<RunTracker>,
}

impl PredictedProcess {
    /// Create a predicted process run through the default [`ShellLauncher`]
    pub fn new(id: ProcessId, command: impl Into<String>) -> Self {
        Self::with_launcher(id, command, Arc::new(ShellLauncher::default()))
    }

    /// Create a predicted process started by `launcher`
    pub fn with_launcher(
        id: ProcessId,
        command: impl Into<String>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let command: String = command.into();
        let command: Arc<str> = Arc::from(command);
        Self {
            id,
            tracker: Arc::new(RunTracker::new(Arc::clone(&command))),
            command,
            launcher,
            memo: MemoTable::new(),
        }
    }

    /// Caller-assigned identifier
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Shell command line run by this process
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether an OS process handle is currently held
    pub fn is_running(&self) -> bool {
        self.tracker.state.lock().active.is_some()
    }

    /// Whether the current (or last) launched run was decided as a failure
    ///
    /// Runs cancelled while queued behind another run never launch, so they
    /// are not reflected here.
    pub fn is_terminated(&self) -> bool {
        self.tracker.state.lock().terminated
    }

    /// Number of signals with a memoized run
    pub fn memoized_runs(&self) -> usize {
        self.memo.len()
    }

    /// Whether `self` and `other` consult the same memo table
    pub fn shares_memo_with(&self, other: &PredictedProcess) -> bool {
        self.memo.shares_with(&other.memo)
    }

    /// Run the command, or replay the run memoized for `signal`
    ///
    /// The returned future resolves once the process exits, fails to spawn,
    /// or `signal` is cancelled, whichever happens first. The run makes
    /// progress whether or not the future is polled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run(&self, signal: Option<&CancelSignal>) -> RunFuture {
        if let Some(signal) = signal {
            if signal.is_cancelled() {
                debug!(id = self.id, signal = %signal.id(), "Signal already cancelled, not spawning");
                return settled(Err(RunError::AlreadyCancelled));
            }
            if let Some(memoized) = self.memo.get(signal.id()) {
                debug!(id = self.id, signal = %signal.id(), "Replaying memoized run");
                return memoized;
            }
        }

        let (run, terminated) = self.dispatch(signal.cloned());

        if let Some(signal) = signal {
            if terminated || decided_failure(&run) {
                debug!(
                    id = self.id,
                    signal = %signal.id(),
                    "Run already failed, not memoizing"
                );
            } else {
                self.memo.insert(signal.id(), run.clone());
            }
        }

        run
    }

    /// A view of this process sharing its memo table and nothing else
    pub fn memoize(&self) -> PredictedProcess {
        Self {
            id: self.id,
            command: Arc::clone(&self.command),
            launcher: Arc::clone(&self.launcher),
            memo: self.memo.clone(),
            tracker: Arc::new(RunTracker::new(Arc::clone(&self.command))),
        }
    }

    /// Start the run, returning it and whether it was already decided as a
    /// failure by the time this returns
    fn dispatch(&self, signal: Option<CancelSignal>) -> (RunFuture, bool) {
        let tracker = Arc::clone(&self.tracker);

        let permit = match Arc::clone(&tracker.gate).try_lock_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(id = self.id, "Run queued behind the outstanding run");
                let launcher = Arc::clone(&self.launcher);
                return (spawn_run(queued(tracker, launcher, signal)), false);
            }
        };

        let mut events = tracker.launch(self.launcher.as_ref());

        // Some launchers report spawn failures before `start` returns.
        if let Ok(event) = events.try_recv() {
            let outcome = tracker.settle(event);
            let terminated = tracker.state.lock().terminated;
            drop(permit);
            return (settled(outcome), terminated);
        }

        (spawn_run(drive(tracker, events, signal, permit)), false)
    }
}

impl fmt::Debug for PredictedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictedProcess")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("memo", &self.memo)
            .finish_non_exhaustive()
    }
}

struct RunState {
    active: Option<Box<dyn ProcessHandle>>,
    tainted: HashSet<String>,
    terminated: bool,
}

/// Per-instance run bookkeeping, shared with the task driving the run
struct RunTracker {
    command: Arc<str>,
    state: Mutex<RunState>,
    /// Held for the lifetime of a launched run
    gate: Arc<AsyncMutex<()>>,
}

impl RunTracker {
    fn new(command: Arc<str>) -> Self {
        Self {
            command,
            state: Mutex::new(RunState {
                active: None,
                tainted: HashSet::new(),
                terminated: false,
            }),
            gate: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Start a process and take ownership of its handle
    fn launch(&self, launcher: &dyn ProcessLauncher) -> mpsc::UnboundedReceiver<LaunchEvent> {
        let Launch { handle, events } = launcher.start(&self.command);

        let mut state = self.state.lock();
        state.terminated = false;
        state.active = Some(handle);
        events
    }

    /// Decide the run from a launcher notification
    fn settle(&self, event: LaunchEvent) -> RunOutcome {
        let outcome = {
            let mut state = self.state.lock();
            match event {
                LaunchEvent::SpawnError(e) => {
                    state.tainted.insert(self.command.to_string());
                    state.terminated = true;
                    Err(RunError::spawn(e))
                }
                LaunchEvent::Exited(report)
                    if report.success() && !state.tainted.contains(&*self.command) =>
                {
                    Ok(())
                }
                LaunchEvent::Exited(ExitReport { code, signal }) => {
                    state.terminated = true;
                    Err(RunError::Exit { code, signal })
                }
            }
        };

        self.cleanup();
        outcome
    }

    /// Decide the run as cancelled
    fn cancel(&self) -> RunOutcome {
        self.state.lock().terminated = true;
        self.cleanup();
        Err(RunError::Cancelled)
    }

    fn cleanup(&self) {
        let handle = {
            let mut state = self.state.lock();
            state.tainted.clear();
            state.active.take()
        };

        if let Some(handle) = handle {
            debug!(pid = ?handle.pid(), command = %self.command, "Releasing process handle");
            handle.terminate();
        }
    }
}

fn settled(outcome: RunOutcome) -> RunFuture {
    future::ready(outcome).boxed().shared()
}

/// Whether `run` has already completed with an error
fn decided_failure(run: &RunFuture) -> bool {
    matches!(run.peek(), Some(Err(_)))
}

fn spawn_run(run: impl Future<Output = RunOutcome> + Send + 'static) -> RunFuture {
    let run = run.boxed().shared();
    tokio::spawn(run.clone());
    run
}

async fn wait_cancelled(signal: Option<&CancelSignal>) {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => future::pending().await,
    }
}

/// Wait for the first decisive notification of a launched run
async fn drive(
    tracker: Arc<RunTracker>,
    mut events: mpsc::UnboundedReceiver<LaunchEvent>,
    signal: Option<CancelSignal>,
    _permit: OwnedMutexGuard<()>,
) -> RunOutcome {
    tokio::select! {
        biased;
        event = events.recv() => match event {
            Some(event) => tracker.settle(event),
            None => {
                warn!(command = %tracker.command, "Launcher dropped the process without reporting an exit");
                tracker.settle(LaunchEvent::Exited(ExitReport::default()))
            }
        },
        () = wait_cancelled(signal.as_ref()) => tracker.cancel(),
    }
}

/// Wait for the outstanding run to settle, then launch
async fn queued(
    tracker: Arc<RunTracker>,
    launcher: Arc<dyn ProcessLauncher>,
    signal: Option<CancelSignal>,
) -> RunOutcome {
    let permit = tokio::select! {
        biased;
        () = wait_cancelled(signal.as_ref()) => {
            debug!(command = %tracker.command, "Signal cancelled while queued, not spawning");
            return Err(RunError::Cancelled);
        }
        permit = Arc::clone(&tracker.gate).lock_owned() => permit,
    };

    let events = tracker.launch(launcher.as_ref());
    drive(tracker, events, signal, permit).await
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::launcher::testing::ScriptedLauncher;
    use crate::signal::CancelSource;

    async fn wait_for_starts(launcher: &ScriptedLauncher, starts: usize) {
        while launcher.starts() < starts {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_exit_zero_resolves() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "true", launcher.clone());

        let run = process.run(None);
        assert!(process.is_running());
        launcher.controller(0).exit(0);

        assert!(run.await.is_ok());
        assert!(!process.is_running());
        assert!(!process.is_terminated());
        // Cleanup always sends a termination request, harmless after exit.
        assert_eq!(launcher.controller(0).terminations(), 1);
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "false", launcher.clone());

        let run = process.run(None);
        launcher.controller(0).exit(3);

        match run.await {
            Err(RunError::Exit { code, signal }) => {
                assert_eq!(code, Some(3));
                assert_eq!(signal, None);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(process.is_terminated());
    }

    #[tokio::test]
    async fn test_killed_by_signal_fails() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "sleep 1", launcher.clone());

        let run = process.run(None);
        launcher
            .controller(0)
            .emit(LaunchEvent::Exited(ExitReport::signal(9)));

        assert!(matches!(
            run.await,
            Err(RunError::Exit {
                code: None,
                signal: Some(9)
            })
        ));
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_spawn() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "true", launcher.clone());
        let source = CancelSource::new();
        source.cancel();

        let result = process.run(Some(&source.signal())).await;

        assert!(matches!(result, Err(RunError::AlreadyCancelled)));
        assert_eq!(launcher.starts(), 0);
        assert_eq!(process.memoized_runs(), 0);
    }

    #[tokio::test]
    async fn test_same_signal_shares_one_run() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "true", launcher.clone());
        let source = CancelSource::new();

        let first = process.run(Some(&source.signal()));
        let second = process.run(Some(&source.signal()));

        assert!(first.ptr_eq(&second));
        assert_eq!(launcher.starts(), 1);

        launcher.controller(0).exit(0);
        assert!(first.await.is_ok());
        assert!(second.await.is_ok());
    }

    #[tokio::test]
    async fn test_distinct_signals_cached_separately() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "true", launcher.clone());
        let first = CancelSource::new();
        let second = CancelSource::new();

        let run = process.run(Some(&first.signal()));
        launcher.controller(0).exit(0);
        run.await.unwrap();

        let run = process.run(Some(&second.signal()));
        launcher.controller(1).exit(0);
        run.await.unwrap();

        assert_eq!(launcher.starts(), 2);
        assert_eq!(process.memoized_runs(), 2);
    }

    #[tokio::test]
    async fn test_unsignalled_runs_are_never_cached() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "true", launcher.clone());

        let first = process.run(None);
        let second = process.run(None);
        assert!(!first.ptr_eq(&second));

        // The second run waits for the first to release its handle.
        assert_eq!(launcher.starts(), 1);
        launcher.controller(0).exit(0);
        first.await.unwrap();

        wait_for_starts(&launcher, 2).await;
        launcher.controller(1).exit(0);
        second.await.unwrap();

        assert_eq!(process.memoized_runs(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_terminates_process() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "sleep 10", launcher.clone());
        let source = CancelSource::new();

        let run = process.run(Some(&source.signal()));
        source.cancel();

        assert!(matches!(run.await, Err(RunError::Cancelled)));
        assert_eq!(launcher.controller(0).terminations(), 1);
        assert!(process.is_terminated());
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_cancelled_run_stays_memoized() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "sleep 10", launcher.clone());
        let source = CancelSource::new();
        let signal = source.signal();

        let run = process.run(Some(&signal));
        source.cancel();
        assert!(matches!(run.await, Err(RunError::Cancelled)));

        // The entry is kept, but a cancelled signal is rejected before the
        // memo is consulted.
        assert!(matches!(
            process.run(Some(&signal)).await,
            Err(RunError::AlreadyCancelled)
        ));
        assert_eq!(process.memoized_runs(), 1);
        assert_eq!(launcher.starts(), 1);
    }

    #[tokio::test]
    async fn test_late_notifications_are_ignored() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "sleep 10", launcher.clone());
        let source = CancelSource::new();

        let run = process.run(Some(&source.signal()));
        source.cancel();
        assert!(matches!(run.clone().await, Err(RunError::Cancelled)));

        let controller = launcher.controller(0);
        controller.exit(0);
        controller.exit(1);
        tokio::task::yield_now().await;

        assert!(matches!(run.await, Err(RunError::Cancelled)));
        assert_eq!(controller.terminations(), 1);
    }

    #[tokio::test]
    async fn test_spawn_error_then_exit_stays_failed() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "missing-binary", launcher.clone());

        let run = process.run(None);
        let controller = launcher.controller(0);
        controller.emit(LaunchEvent::SpawnError(io::Error::new(
            io::ErrorKind::NotFound,
            "not found",
        )));
        controller.exit(0);

        assert!(matches!(run.await, Err(RunError::Spawn(_))));
        assert_eq!(controller.terminations(), 1);
        assert!(process.tracker.state.lock().tainted.is_empty());
    }

    #[tokio::test]
    async fn test_tainted_command_fails_on_clean_exit() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "flaky", launcher.clone());

        let run = process.run(None);
        process
            .tracker
            .state
            .lock()
            .tainted
            .insert("flaky".to_string());
        launcher.controller(0).exit(0);

        assert!(matches!(
            run.await,
            Err(RunError::Exit {
                code: Some(0),
                signal: None
            })
        ));
        assert!(process.tracker.state.lock().tainted.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_error_at_dispatch_is_not_memoized() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "missing-binary", launcher.clone());
        let source = CancelSource::new();

        for _ in 0..2 {
            launcher.queue_immediate(vec![LaunchEvent::SpawnError(io::Error::new(
                io::ErrorKind::NotFound,
                "not found",
            ))]);
            let result = process.run(Some(&source.signal())).await;
            assert!(matches!(result, Err(RunError::Spawn(_))));
        }

        assert_eq!(launcher.starts(), 2);
        assert_eq!(process.memoized_runs(), 0);
    }

    #[tokio::test]
    async fn test_failed_exit_is_memoized_as_failure() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "false", launcher.clone());
        let source = CancelSource::new();

        let run = process.run(Some(&source.signal()));
        launcher.controller(0).exit(1);
        assert!(run.await.is_err());

        let replay = process.run(Some(&source.signal())).await;
        assert!(matches!(replay, Err(RunError::Exit { code: Some(1), .. })));
        assert_eq!(launcher.starts(), 1);
    }

    #[tokio::test]
    async fn test_memoize_shares_cache_only() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(7, "false", launcher.clone());
        let view = process.memoize();
        let source = CancelSource::new();

        assert_eq!(view.id(), 7);
        assert_eq!(view.command(), "false");
        assert!(view.shares_memo_with(&process));

        let original = process.run(Some(&source.signal()));
        let replay = view.run(Some(&source.signal()));
        assert!(original.ptr_eq(&replay));
        assert!(!view.is_running());

        launcher.controller(0).exit(2);
        assert!(replay.await.is_err());

        assert!(process.is_terminated());
        assert!(!view.is_terminated());
        assert_eq!(launcher.starts(), 1);
    }

    #[tokio::test]
    async fn test_queued_run_cancelled_before_launch() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "sleep 10", launcher.clone());
        let source = CancelSource::new();

        let first = process.run(None);
        let queued = process.run(Some(&source.signal()));
        source.cancel();

        assert!(matches!(queued.await, Err(RunError::Cancelled)));
        assert_eq!(launcher.starts(), 1);
        assert!(process.is_running());

        launcher.controller(0).exit(0);
        first.await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_cancel_leaves_terminated_flag_alone() {
        let launcher = ScriptedLauncher::new();
        let process = PredictedProcess::with_launcher(1, "sleep 10", launcher.clone());
        let source = CancelSource::new();

        let first = process.run(None);
        let queued = process.run(Some(&source.signal()));
        source.cancel();

        assert!(matches!(queued.await, Err(RunError::Cancelled)));
        assert!(!process.is_terminated());

        launcher.controller(0).exit(0);
        first.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_settled_before_caching_is_detected() {
        let failed = spawn_run(async { Err(RunError::Cancelled) });
        let succeeded = spawn_run(async { Ok(()) });
        let pending = spawn_run(future::pending());

        let _ = failed.clone().await;
        succeeded.clone().await.unwrap();

        assert!(decided_failure(&failed));
        assert!(!decided_failure(&succeeded));
        assert!(!decided_failure(&pending));
    }
}
