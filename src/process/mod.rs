//! Managed process lifecycle
//!
//! A [`ManagedProcess`] owns one supervised child program: it spawns and
//! stops the OS process, tracks its lifecycle state, and accumulates its
//! output lines. Instances are shared as `Arc<ManagedProcess>`; the process
//! exclusively owns its output buffer and child handle.

use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Serialize;
use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use uuid::Uuid;

use crate::command::Command;
use crate::error::{Result, WardenError};
use crate::output::{OutputBuffer, OutputRecord, OutputSource, OutputStream};

/// Default bound on graceful shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(6);

/// Lifecycle state of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// No OS process is alive; the last run (if any) exited cleanly
    NotRunning,
    /// An OS process has been spawned and has not yet exited
    Running,
    /// The last run exited with a failure status
    Error,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::NotRunning => write!(f, "not running"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Error => write!(f, "error"),
        }
    }
}

/// Options for constructing a [`ManagedProcess`]
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Stable id; generated when omitted
    pub id: Option<String>,

    /// Human-readable name for logs and UIs
    pub name: String,

    /// Program invocation, immutable after construction
    pub command: Command,

    /// Bound on graceful shutdown; defaults to [`DEFAULT_SHUTDOWN_TIMEOUT`]
    pub shutdown_timeout: Option<Duration>,
}

impl SpawnSpec {
    /// Create a spec with a generated id and default shutdown timeout
    pub fn new(name: impl Into<String>, command: Command) -> Self {
        Self {
            id: None,
            name: name.into(),
            command,
            shutdown_timeout: None,
        }
    }

    /// Use a caller-chosen stable id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Override the graceful shutdown bound
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }
}

/// Serializable read view of a process, for status endpoints and UIs
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub id: String,
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One supervised child program
#[derive(Debug)]
pub struct ManagedProcess {
    /// Stable across restarts of the same logical process
    id: String,

    /// Human-readable name
    name: String,

    /// Invocation used for every start
    command: Command,

    /// Bound on graceful shutdown
    shutdown_timeout: Duration,

    /// Construction time
    created_at: DateTime<Utc>,

    /// Last state transition time
    updated_at: RwLock<DateTime<Utc>>,

    /// Lifecycle state
    state: RwLock<ProcessState>,

    /// OS process id while a child is alive
    pid: RwLock<Option<u32>>,

    /// Accumulated output lines
    output: Arc<OutputBuffer>,

    /// State transition notifications; fires once per transition
    state_tx: broadcast::Sender<ProcessState>,

    /// Exit status of the current run; reset to `None` on each start.
    /// Stays `None` forever if the process was never started.
    exit_tx: watch::Sender<Option<ExitStatus>>,
}

impl ManagedProcess {
    /// Construct a process from a spec; does not spawn anything
    pub fn new(spec: SpawnSpec) -> Self {
        let now = Utc::now();
        let (state_tx, _) = broadcast::channel(16);
        let (exit_tx, _) = watch::channel(None);

        Self {
            id: spec.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: spec.name,
            command: spec.command,
            shutdown_timeout: spec.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
            created_at: now,
            updated_at: RwLock::new(now),
            state: RwLock::new(ProcessState::NotRunning),
            pid: RwLock::new(None),
            output: Arc::new(OutputBuffer::new()),
            state_tx,
            exit_tx,
        }
    }

    /// Get the process id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configured command
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Construction time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last state transition time
    pub fn updated_at(&self) -> Result<DateTime<Utc>> {
        Ok(*self
            .updated_at
            .read()
            .map_err(|_| WardenError::Internal("Lock poisoned".to_string()))?)
    }

    /// Current lifecycle state
    pub fn state(&self) -> Result<ProcessState> {
        Ok(*self
            .state
            .read()
            .map_err(|_| WardenError::Internal("Lock poisoned".to_string()))?)
    }

    /// OS process id of the current run, if one is alive
    pub fn pid(&self) -> Result<Option<u32>> {
        Ok(*self
            .pid
            .read()
            .map_err(|_| WardenError::Internal("Lock poisoned".to_string()))?)
    }

    /// Subscribe to state transitions. Fires once per transition; a lagging
    /// receiver may miss transitions, there is no buffering guarantee.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    /// Watch the exit status of the current run
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.exit_tx.subscribe()
    }

    /// Snapshot of all output records captured so far
    pub fn output(&self) -> Result<Vec<OutputRecord>> {
        self.output.snapshot()
    }

    /// Live tail of output records appended from now on
    pub fn tail(&self) -> OutputStream {
        self.output.tail()
    }

    /// Drop the output history; state is unaffected
    pub fn clear_logs(&self) -> Result<()> {
        self.output.clear()
    }

    /// Serializable read view
    pub fn snapshot(&self) -> Result<ProcessSnapshot> {
        Ok(ProcessSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state()?,
            pid: self.pid()?,
            created_at: self.created_at,
            updated_at: self.updated_at()?,
        })
    }

    /// Spawn the configured command.
    ///
    /// Fails with [`WardenError::AlreadyRunning`] if a child is alive and
    /// with [`WardenError::Spawn`] if the OS refuses to create the process;
    /// in both cases the state is unchanged. On success the state is
    /// `Running` and output capture is wired up before this returns.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let spawned = {
            let mut state = self
                .state
                .write()
                .map_err(|_| WardenError::Internal("Lock poisoned".to_string()))?;

            if *state == ProcessState::Running {
                return Err(WardenError::AlreadyRunning(self.id.clone()));
            }

            let spawned = self.command.spawn()?;

            // New run: previous exit status no longer applies
            self.exit_tx.send_replace(None);
            *self
                .pid
                .write()
                .map_err(|_| WardenError::Internal("Lock poisoned".to_string()))? = spawned.pid;
            *self
                .updated_at
                .write()
                .map_err(|_| WardenError::Internal("Lock poisoned".to_string()))? = Utc::now();
            *state = ProcessState::Running;

            spawned
        };

        debug!(
            "Started process '{}' ({}) with pid {:?}",
            self.name, self.id, spawned.pid
        );
        let _ = self.state_tx.send(ProcessState::Running);

        self.monitor(spawned.child);

        Ok(())
    }

    /// Wire up output capture and exit monitoring for a freshly spawned child
    fn monitor(self: &Arc<Self>, mut child: tokio::process::Child) {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let out_task = stdout.map(|pipe| {
            tokio::spawn(Self::capture_lines(
                Arc::clone(&self.output),
                self.id.clone(),
                OutputSource::Stdout,
                BufReader::new(pipe).lines(),
            ))
        });
        let err_task = stderr.map(|pipe| {
            tokio::spawn(Self::capture_lines(
                Arc::clone(&self.output),
                self.id.clone(),
                OutputSource::Stderr,
                BufReader::new(pipe).lines(),
            ))
        });

        let process = Arc::clone(self);
        tokio::spawn(async move {
            // Drain both pipes before observing the exit, so the full
            // output is in the buffer when the exit becomes visible.
            if let Some(task) = out_task {
                let _ = task.await;
            }
            if let Some(task) = err_task {
                let _ = task.await;
            }

            match child.wait().await {
                Ok(status) => process.settle_exit(status),
                Err(e) => {
                    error!(
                        "Failed to await exit of process '{}': {}",
                        process.id, e
                    );
                }
            }
        });
    }

    /// Append lines from one stream of the child to the output buffer
    async fn capture_lines<R>(
        output: Arc<OutputBuffer>,
        process_id: String,
        source: OutputSource,
        mut lines: tokio::io::Lines<R>,
    ) where
        R: AsyncBufRead + Unpin,
    {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Err(e) = output.append(OutputRecord::line(&process_id, line, source)) {
                        error!("Failed to record output of '{}': {}", process_id, e);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading {:?} of '{}': {}", source, process_id, e);
                    break;
                }
            }
        }
    }

    /// Record an observed exit: derive the new state from the exit status
    /// and publish it to exit waiters and state subscribers.
    ///
    /// The pid, timestamp, and exit status are published under the same
    /// `state` lock acquisition that flips the state. `start()` runs its
    /// whole spawn-and-reset section under that lock too, so a settling
    /// run and the next run's startup are fully serialized: no caller can
    /// observe the state flip and restart while this settlement is still
    /// half-published.
    fn settle_exit(&self, status: ExitStatus) {
        let new_state = if status.success() {
            ProcessState::NotRunning
        } else {
            ProcessState::Error
        };

        debug!(
            "Process '{}' ({}) exited with {}; now {}",
            self.name, self.id, status, new_state
        );

        {
            let mut state = match self.state.write() {
                Ok(state) => state,
                Err(_) => {
                    error!("State lock poisoned while settling exit of '{}'", self.id);
                    return;
                }
            };

            if let Ok(mut pid) = self.pid.write() {
                *pid = None;
            }
            if let Ok(mut updated_at) = self.updated_at.write() {
                *updated_at = Utc::now();
            }
            self.exit_tx.send_replace(Some(status));
            *state = new_state;
        }

        let _ = self.state_tx.send(new_state);
    }

    /// Stop the child via graceful shutdown escalation.
    ///
    /// No-op unless the process is `Running`. Sends an interrupt signal,
    /// escalating to a forceful kill if the interrupt cannot be delivered,
    /// then waits for the exit up to the configured bound. On timeout the
    /// OS process is left as-is and [`WardenError::ShutdownTimeout`] is
    /// returned; callers must treat that as fatal rather than retrying.
    pub async fn stop(&self) -> Result<()> {
        if self.state()? != ProcessState::Running {
            return Ok(());
        }

        let pid = match self.pid()? {
            Some(pid) => pid,
            // Exit settled between the state check and here
            None => return Ok(()),
        };

        self.signal_with_escalation(pid)?;

        let mut exit_rx = self.exit_tx.subscribe();
        match timeout(self.shutdown_timeout, exit_rx.wait_for(|s| s.is_some())).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(WardenError::Internal(
                "exit channel closed while stopping".to_string(),
            )),
            Err(_) => {
                error!(
                    "Process '{}' (pid {}) ignored shutdown for {:?}",
                    self.id, pid, self.shutdown_timeout
                );
                Err(WardenError::ShutdownTimeout {
                    id: self.id.clone(),
                    pid: Some(pid),
                    timeout: self.shutdown_timeout,
                })
            }
        }
    }

    /// Send SIGINT, escalating to SIGKILL if the interrupt cannot be
    /// delivered. Any other signalling error propagates immediately.
    fn signal_with_escalation(&self, pid: u32) -> Result<()> {
        let target = Pid::from_raw(pid as i32);

        debug!("Sending SIGINT to process '{}' (pid {})", self.id, pid);
        match kill(target, Signal::SIGINT) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                warn!(
                    "SIGINT undeliverable to '{}' (pid {}); escalating to SIGKILL",
                    self.id, pid
                );
                match kill(target, Signal::SIGKILL) {
                    // Already gone; the exit will be observed by the monitor
                    Ok(()) | Err(Errno::ESRCH) => Ok(()),
                    Err(e) => Err(self.signal_error(e)),
                }
            }
            Err(e) => Err(self.signal_error(e)),
        }
    }

    fn signal_error(&self, errno: Errno) -> WardenError {
        WardenError::Signal {
            id: self.id.clone(),
            source: io::Error::from_raw_os_error(errno as i32),
        }
    }

    /// Wait for the current run to exit, however it exits.
    ///
    /// Pends forever if `start()` was never called. Resolves once per run;
    /// after a restart, waiters observe the next exit.
    pub async fn wait_on_exit(&self) -> Result<ExitStatus> {
        let mut exit_rx = self.exit_tx.subscribe();
        let status = exit_rx
            .wait_for(|s| s.is_some())
            .await
            .map_err(|_| WardenError::Internal("process dropped while waiting".to_string()))?;
        (*status).ok_or_else(|| WardenError::Internal("empty exit status".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, sleep};

    fn shell(script: &str) -> Command {
        Command::new("sh").args(["-c", script])
    }

    fn process(script: &str) -> Arc<ManagedProcess> {
        Arc::new(ManagedProcess::new(SpawnSpec::new("test", shell(script))))
    }

    #[tokio::test]
    async fn start_runs_and_settles_not_running_on_clean_exit() {
        let proc = process("echo hello");
        proc.start().await.unwrap();
        assert_eq!(proc.state().unwrap(), ProcessState::Running);
        assert!(proc.created_at() <= proc.updated_at().unwrap());

        let status = proc.wait_on_exit().await.unwrap();
        assert!(status.success());
        assert_eq!(proc.state().unwrap(), ProcessState::NotRunning);

        let output = proc.output().unwrap();
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].data, "hello");
        assert_eq!(output[0].source, OutputSource::Stdout);
    }

    #[tokio::test]
    async fn nonzero_exit_settles_error() {
        let proc = process("exit 3");
        proc.start().await.unwrap();

        let status = proc.wait_on_exit().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(proc.state().unwrap(), ProcessState::Error);
    }

    #[tokio::test]
    async fn double_start_fails_without_mutating_state() {
        let proc = process("sleep 5");
        proc.start().await.unwrap();

        let before = proc.updated_at().unwrap();
        let err = proc.start().await.unwrap_err();
        assert!(matches!(err, WardenError::AlreadyRunning(_)));
        assert_eq!(proc.state().unwrap(), ProcessState::Running);
        assert_eq!(proc.updated_at().unwrap(), before);

        proc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_error_is_allowed() {
        let proc = process("exit 1");
        proc.start().await.unwrap();
        proc.wait_on_exit().await.unwrap();
        assert_eq!(proc.state().unwrap(), ProcessState::Error);

        proc.start().await.unwrap();
        proc.wait_on_exit().await.unwrap();
        assert_eq!(proc.state().unwrap(), ProcessState::Error);
    }

    #[tokio::test]
    async fn restart_on_the_heels_of_an_exit_sees_only_the_new_run() {
        // First run exits immediately; once the flag file exists, the same
        // command loops until interrupted
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("keep-running");
        let script = format!(
            "if [ -e {} ]; then trap 'exit 0' INT; while :; do sleep 0.05; done; fi",
            flag.display()
        );
        let proc = process(&script);

        proc.start().await.unwrap();

        // Restart the moment the state flips, the way an eager supervisor
        // polling `state()` would
        while proc.state().unwrap() == ProcessState::Running {
            tokio::task::yield_now().await;
        }
        std::fs::File::create(&flag).unwrap();
        proc.start().await.unwrap();

        // Nothing from the settled first run may leak into the new one
        assert_eq!(proc.state().unwrap(), ProcessState::Running);
        assert!(proc.pid().unwrap().is_some());
        let stale = timeout(Duration::from_millis(300), proc.wait_on_exit()).await;
        assert!(stale.is_err(), "stale exit status surfaced for the new run");

        proc.stop().await.unwrap();
        assert_eq!(proc.state().unwrap(), ProcessState::NotRunning);
    }

    #[tokio::test]
    async fn rapid_restarts_after_observed_exits_stay_consistent() {
        let proc = process("exit 0");

        for _ in 0..10 {
            proc.start().await.unwrap();
            let status = proc.wait_on_exit().await.unwrap();
            assert!(status.success());
            assert_eq!(proc.state().unwrap(), ProcessState::NotRunning);
            assert_eq!(proc.pid().unwrap(), None);
        }
    }

    #[tokio::test]
    async fn stop_on_not_running_is_a_noop() {
        let proc = process("echo unused");
        proc.stop().await.unwrap();
        assert_eq!(proc.state().unwrap(), ProcessState::NotRunning);
    }

    #[tokio::test]
    async fn stop_interrupts_a_cooperative_child() {
        let proc = process("trap 'exit 0' INT; while :; do sleep 0.05; done");
        proc.start().await.unwrap();

        // Give the shell a moment to install its trap
        sleep(Duration::from_millis(200)).await;

        proc.stop().await.unwrap();
        assert_eq!(proc.state().unwrap(), ProcessState::NotRunning);
        assert_eq!(proc.pid().unwrap(), None);
    }

    #[tokio::test]
    async fn stop_times_out_on_a_child_that_ignores_interrupts() {
        let spec = SpawnSpec::new(
            "stubborn",
            shell("trap '' INT; while :; do sleep 0.05; done"),
        )
        .with_shutdown_timeout(Duration::from_millis(300));
        let proc = Arc::new(ManagedProcess::new(spec));
        proc.start().await.unwrap();
        sleep(Duration::from_millis(200)).await;

        let err = proc.stop().await.unwrap_err();
        assert!(matches!(err, WardenError::ShutdownTimeout { .. }));
        assert_eq!(proc.state().unwrap(), ProcessState::Running);

        // Clean up the stubborn child
        let pid = proc.pid().unwrap().unwrap();
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
        proc.wait_on_exit().await.unwrap();
    }

    #[tokio::test]
    async fn clear_logs_keeps_state() {
        let proc = process("echo one; echo two");
        proc.start().await.unwrap();
        proc.wait_on_exit().await.unwrap();
        assert_eq!(proc.output().unwrap().len(), 2);

        let state = proc.state().unwrap();
        proc.clear_logs().unwrap();
        assert!(proc.output().unwrap().is_empty());
        assert_eq!(proc.state().unwrap(), state);
    }

    #[tokio::test]
    async fn per_stream_order_is_preserved() {
        let proc = process("echo a; echo b; echo 1 >&2; echo c; echo 2 >&2");
        proc.start().await.unwrap();
        proc.wait_on_exit().await.unwrap();

        let output = proc.output().unwrap();
        let stdout: Vec<_> = output
            .iter()
            .filter(|r| r.source == OutputSource::Stdout)
            .map(|r| r.data.as_str())
            .collect();
        let stderr: Vec<_> = output
            .iter()
            .filter(|r| r.source == OutputSource::Stderr)
            .map(|r| r.data.as_str())
            .collect();

        assert_eq!(stdout, ["a", "b", "c"]);
        assert_eq!(stderr, ["1", "2"]);
    }

    #[tokio::test]
    async fn wait_on_exit_pends_if_never_started() {
        let proc = process("echo never");
        let waited = timeout(Duration::from_millis(100), proc.wait_on_exit()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn state_changes_are_broadcast() {
        let proc = process("echo done");
        let mut rx = proc.subscribe();

        proc.start().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ProcessState::Running);
        assert_eq!(rx.recv().await.unwrap(), ProcessState::NotRunning);
    }

    #[tokio::test]
    async fn spawn_failure_leaves_state_untouched() {
        let spec = SpawnSpec::new("missing", Command::new("no-such-binary-51c2"));
        let proc = Arc::new(ManagedProcess::new(spec));

        let err = proc.start().await.unwrap_err();
        assert!(matches!(err, WardenError::Spawn { .. }));
        assert_eq!(proc.state().unwrap(), ProcessState::NotRunning);
    }

    #[tokio::test]
    async fn snapshot_serializes() {
        let proc = process("echo hi");
        let snapshot = proc.snapshot().unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "not_running");
        assert_eq!(json["name"], "test");
    }
}
