//! Readiness detection for started processes
//!
//! A spawned process is not necessarily usable: an emulator may take a
//! while to print its startup banner, or fail early with a line on stderr.
//! [`wait_until_ready`] polls the accumulated output of a started
//! [`ManagedProcess`], racing a success predicate against a failure
//! predicate with a bounded attempt budget.

use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use crate::error::{Result, WardenError};
use crate::output::{OutputRecord, OutputSource};
use crate::process::ManagedProcess;

/// Polling parameters for readiness detection
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    /// Interval between predicate evaluations
    pub poll_interval: Duration,

    /// How many polls the failure predicate gets before it retires.
    /// Keeps a single transient stderr line from failing a service that
    /// goes on to become ready.
    pub failure_attempts: usize,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            failure_attempts: 5,
        }
    }
}

/// Wait until a started process is semantically ready.
///
/// Both predicates are re-evaluated against a snapshot of the live output
/// buffer on every poll. The success predicate is unbounded; the failure
/// predicate only participates for the first `failure_attempts` polls and
/// returns the offending record when it fires. Process exit before success
/// resolves as [`WardenError::ExitedBeforeReady`], so this never hangs on a
/// process that dies quietly.
pub async fn wait_until_ready<S, F>(
    process: &Arc<ManagedProcess>,
    probe: &ReadinessProbe,
    mut success: S,
    mut failure: F,
) -> Result<()>
where
    S: FnMut(&[OutputRecord]) -> bool,
    F: FnMut(&[OutputRecord]) -> Option<OutputRecord>,
{
    let mut exit_rx = process.exit_watch();
    let mut ticker = interval(probe.poll_interval);
    let mut failure_polls = 0;

    loop {
        let records = process.output()?;

        // Success takes precedence at any single poll
        if success(&records) {
            debug!("Process '{}' is ready", process.id());
            return Ok(());
        }

        if failure_polls < probe.failure_attempts {
            failure_polls += 1;
            if let Some(record) = failure(&records) {
                return Err(WardenError::ReadinessFailure {
                    id: process.id().to_string(),
                    line: record.data,
                });
            }
        }

        if exit_rx.borrow().is_some() {
            return Err(WardenError::ExitedBeforeReady {
                id: process.id().to_string(),
            });
        }

        tokio::select! {
            _ = ticker.tick() => {}
            changed = exit_rx.changed() => {
                if changed.is_err() {
                    return Err(WardenError::Internal(
                        "process dropped during readiness detection".to_string(),
                    ));
                }
                // Re-evaluate immediately: output drained before the exit
                // settled, so success may hold even though the child died
            }
        }
    }
}

/// Success predicate: some stdout line contains the given substring
pub fn stdout_contains(needle: impl Into<String>) -> impl FnMut(&[OutputRecord]) -> bool {
    let needle = needle.into();
    move |records| {
        records
            .iter()
            .any(|r| r.source == OutputSource::Stdout && r.data.contains(&needle))
    }
}

/// Failure predicate: any non-empty stderr line
pub fn any_stderr() -> impl FnMut(&[OutputRecord]) -> Option<OutputRecord> {
    |records| {
        records
            .iter()
            .find(|r| r.source == OutputSource::Stderr && !r.data.trim().is_empty())
            .cloned()
    }
}
