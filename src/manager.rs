//! Process registry and orchestration
//!
//! The [`ProcessManager`] owns the process table: a mapping from logical
//! process id to the single live [`ManagedProcess`] for that id. It is an
//! explicitly constructed instance meant to be dependency-injected into
//! callers; there is no hidden global table.

use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::error::{Result, WardenError};
use crate::output::{OutputRecord, OutputSource};
use crate::process::{ManagedProcess, ProcessSnapshot, ProcessState, SpawnSpec};

/// Registry-level notifications for consumers such as a status UI.
///
/// Each event carries a snapshot of the process taken when the event was
/// published, so subscribers can render state without a table lookup.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// A process was registered under a fresh id
    ProcessAdded { process: ProcessSnapshot },

    /// A process replaced an existing entry for its id
    ProcessUpdated { process: ProcessSnapshot },

    /// A registered process changed lifecycle state
    StateChanged {
        process: ProcessSnapshot,
        state: ProcessState,
    },
}

/// The process table and its orchestration operations.
///
/// Table lookups and listings are safe while a start/stop/remove for another
/// id is in flight. Operations for the *same* id must be serialized by the
/// caller; interleaving them races the one-live-process-per-id invariant.
pub struct ProcessManager {
    /// At most one entry per id
    table: RwLock<HashMap<String, Arc<ManagedProcess>>>,

    /// Registry event subscribers
    events: broadcast::Sender<ManagerEvent>,
}

impl ProcessManager {
    /// Create an empty manager
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            table: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Construct a process from a spec without registering or starting it
    pub fn init_process(&self, spec: SpawnSpec) -> Arc<ManagedProcess> {
        Arc::new(ManagedProcess::new(spec))
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Register and start a process.
    ///
    /// If an entry already exists for the process id, the existing process
    /// is fully stopped first, so two live OS processes never share an id.
    pub async fn start(&self, process: Arc<ManagedProcess>) -> Result<()> {
        let id = process.id().to_string();

        let existing = {
            let table = self.read_table()?;
            table.get(&id).cloned()
        };

        let replaced = existing.is_some();
        if let Some(old) = existing {
            debug!("Replacing existing process '{}'", id);
            old.stop().await?;
        }

        {
            let mut table = self.write_table()?;
            table.insert(id.clone(), Arc::clone(&process));
        }

        let snapshot = process.snapshot()?;
        if replaced {
            let _ = self
                .events
                .send(ManagerEvent::ProcessUpdated { process: snapshot });
        } else {
            let _ = self
                .events
                .send(ManagerEvent::ProcessAdded { process: snapshot });
        }
        self.forward_state_changes(&process);

        process.start().await
    }

    /// Start an already registered process
    pub async fn start_existing(&self, id: &str) -> Result<()> {
        let process = self.get(id)?;
        process.start().await
    }

    /// Stop a registered process; a no-op for an absent id
    pub async fn stop(&self, id: &str) -> Result<()> {
        let process = {
            let table = self.read_table()?;
            table.get(id).cloned()
        };

        match process {
            Some(process) => process.stop().await,
            None => Ok(()),
        }
    }

    /// Stop and then start a registered process
    pub async fn restart(&self, id: &str) -> Result<()> {
        let process = self.get(id)?;
        process.stop().await?;
        process.start().await
    }

    /// Stop a registered process and delete its table entry.
    ///
    /// The process and its output history become unreachable afterwards. If
    /// the stop fails the entry is kept, since the OS process may be alive.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let process = self.get(id)?;
        process.stop().await?;

        let mut table = self.write_table()?;
        table.remove(id);
        Ok(())
    }

    /// Get a registered process by id
    pub fn get(&self, id: &str) -> Result<Arc<ManagedProcess>> {
        let table = self.read_table()?;
        table
            .get(id)
            .cloned()
            .ok_or_else(|| WardenError::ProcessNotFound(id.to_string()))
    }

    /// Get all registered processes
    pub fn get_all(&self) -> Result<Vec<Arc<ManagedProcess>>> {
        let table = self.read_table()?;
        Ok(table.values().cloned().collect())
    }

    /// All output records of a registered process
    pub fn output(&self, id: &str) -> Result<Vec<OutputRecord>> {
        self.get(id)?.output()
    }

    /// Number of registered processes
    pub fn count(&self) -> Result<usize> {
        let table = self.read_table()?;
        Ok(table.len())
    }

    /// Whether an id is registered
    pub fn contains(&self, id: &str) -> Result<bool> {
        let table = self.read_table()?;
        Ok(table.contains_key(id))
    }

    /// Start a process, wait for its natural exit, and return its output.
    ///
    /// Lets a one-off CLI invocation be used as a fallible call: a non-zero
    /// exit becomes [`WardenError::CommandFailed`] carrying the concatenated
    /// stderr lines.
    pub async fn run_until_termination(
        &self,
        process: Arc<ManagedProcess>,
    ) -> Result<Vec<OutputRecord>> {
        self.start(Arc::clone(&process)).await?;
        let status = process.wait_on_exit().await?;
        let output = process.output()?;

        if status.success() {
            Ok(output)
        } else {
            let stderr = output
                .iter()
                .filter(|r| r.source == OutputSource::Stderr)
                .map(|r| r.data.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            Err(WardenError::CommandFailed {
                id: process.id().to_string(),
                stderr,
            })
        }
    }

    /// Stop every registered process concurrently.
    ///
    /// Individual stop failures are isolated: every process gets its stop
    /// attempt, and the first failure is returned afterwards.
    pub async fn stop_all(&self) -> Result<()> {
        let processes = self.get_all()?;
        debug!("Stopping all {} registered processes", processes.len());

        let mut stops = JoinSet::new();
        for process in processes {
            stops.spawn(async move {
                let id = process.id().to_string();
                (id, process.stop().await)
            });
        }

        let mut first_failure = None;
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => {
                    error!("Failed to stop process '{}': {}", id, e);
                    first_failure.get_or_insert(e);
                }
                Err(e) => {
                    error!("Stop task panicked: {}", e);
                    first_failure
                        .get_or_insert(WardenError::Internal(format!("stop task failed: {}", e)));
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether every registered process has confirmed it is not running
    pub fn is_stopped_all(&self) -> Result<bool> {
        let processes = self.get_all()?;
        for process in processes {
            if process.state()? == ProcessState::Running {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Install interrupt/terminate handlers that stop every process and
    /// then exit.
    ///
    /// A deployment concern, off unless called: embedding applications that
    /// manage their own shutdown ordering should not install this.
    pub fn install_shutdown_hook(self: &Arc<Self>) -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => debug!("Received SIGINT"),
                _ = terminate.recv() => debug!("Received SIGTERM"),
            }

            if let Err(e) = manager.stop_all().await {
                error!("Shutdown hook failed to stop all processes: {}", e);
            }
            std::process::exit(0);
        });

        Ok(())
    }

    /// Relay a process's state transitions onto the registry event channel.
    ///
    /// Holds only a weak reference so the relay task never keeps a removed
    /// process alive; once the last strong reference is dropped the task ends.
    fn forward_state_changes(&self, process: &Arc<ManagedProcess>) {
        let id = process.id().to_string();
        let handle = Arc::downgrade(process);
        let mut state_rx = process.subscribe();
        let events = self.events.clone();

        tokio::spawn(async move {
            loop {
                match state_rx.recv().await {
                    Ok(state) => {
                        let Some(process) = Weak::upgrade(&handle) else {
                            break;
                        };
                        match process.snapshot() {
                            Ok(snapshot) => {
                                let _ = events.send(ManagerEvent::StateChanged {
                                    process: snapshot,
                                    state,
                                });
                            }
                            Err(e) => warn!("Could not snapshot '{}': {}", id, e),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} state changes of '{}'", n, id);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn read_table(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ManagedProcess>>>> {
        self.table
            .read()
            .map_err(|_| WardenError::Internal("Lock poisoned".to_string()))
    }

    fn write_table(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ManagedProcess>>>> {
        self.table
            .write()
            .map_err(|_| WardenError::Internal("Lock poisoned".to_string()))
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
