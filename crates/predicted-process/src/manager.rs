//! Process manager - batch orchestration of predicted processes

use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::{
    error::{ProcessError, Result},
    process::{PredictedProcess, ProcessId},
    signal::CancelSignal,
};

/// Ordered collection of predicted processes that can be run together
#[derive(Debug, Default)]
pub struct ProcessManager {
    processes: Vec<PredictedProcess>,
}

impl ProcessManager {
    /// Create an empty process manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a process manager holding `processes` in order
    pub fn with_processes(processes: impl IntoIterator<Item = PredictedProcess>) -> Self {
        Self {
            processes: processes.into_iter().collect(),
        }
    }

    /// Current members, in insertion order
    pub fn processes(&self) -> &[PredictedProcess] {
        &self.processes
    }

    /// Append a process
    pub fn add_process(&mut self, process: PredictedProcess) -> &mut Self {
        self.processes.push(process);
        self
    }

    /// Remove every process with `id`
    pub fn remove_process(&mut self, id: ProcessId) -> &mut Self {
        self.processes.retain(|process| process.id() != id);
        self
    }

    /// First process with `id`
    pub fn get_process(&self, id: ProcessId) -> Option<&PredictedProcess> {
        self.processes.iter().find(|process| process.id() == id)
    }

    /// Number of member processes
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Whether the manager has no members
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Run every member concurrently and wait for all of them to settle
    ///
    /// All runs are dispatched before any is awaited, so one failure never
    /// keeps a sibling from running.
    ///
    /// # Arguments
    /// * `signal` - Passed to every member's [`PredictedProcess::run`]
    ///
    /// # Examples
    /// ```no_run
    /// use predicted_process::{CancelSource, PredictedProcess, ProcessManager};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut manager = ProcessManager::new();
    /// manager
    ///     .add_process(PredictedProcess::new(1, "echo one"))
    ///     .add_process(PredictedProcess::new(2, "echo two"));
    ///
    /// let source = CancelSource::new();
    /// manager.run_all(Some(&source.signal())).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run_all(&self, signal: Option<&CancelSignal>) -> Result<()> {
        debug!(processes = self.processes.len(), "Running all processes");

        let runs: Vec<_> = self
            .processes
            .iter()
            .map(|process| {
                let id = process.id();
                process.run(signal).map(move |outcome| (id, outcome))
            })
            .collect();

        let failures: Vec<_> = join_all(runs)
            .await
            .into_iter()
            .filter_map(|(id, outcome)| outcome.err().map(|e| (id, e)))
            .collect();

        if failures.is_empty() {
            info!(processes = self.processes.len(), "All processes completed");
            return Ok(());
        }

        for (id, e) in &failures {
            warn!(id = %id, error = %e, "Process failed");
        }
        Err(ProcessError::BatchFailed {
            total: self.processes.len(),
            failures,
        })
    }
}
