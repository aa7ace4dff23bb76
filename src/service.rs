//! Service-level wrapper over managed processes
//!
//! A [`ManagedService`] bundles a spawn specification with the readiness
//! predicates for the program behind it, so callers can ask for a service
//! and get back a process that is confirmed usable, not merely spawned.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::manager::ProcessManager;
use crate::output::{OutputRecord, OutputSource};
use crate::process::{ManagedProcess, SpawnSpec};
use crate::readiness::{ReadinessProbe, wait_until_ready};

/// A long-running program with an output-derived readiness contract
#[async_trait]
pub trait ManagedService: Send + Sync + 'static {
    /// Spec for the process backing this service
    fn spawn_spec(&self) -> SpawnSpec;

    /// Whether the accumulated output shows the service is usable
    fn is_ready(&self, output: &[OutputRecord]) -> bool;

    /// The output record proving startup failed, if any.
    /// Defaults to the first non-empty stderr line.
    fn failed_record(&self, output: &[OutputRecord]) -> Option<OutputRecord> {
        output
            .iter()
            .find(|r| r.source == OutputSource::Stderr && !r.data.trim().is_empty())
            .cloned()
    }

    /// Polling parameters for readiness detection
    fn probe(&self) -> ReadinessProbe {
        ReadinessProbe::default()
    }

    /// Called once after the service has become ready
    async fn on_ready(&self, _process: &Arc<ManagedProcess>) -> Result<()> {
        Ok(())
    }
}

/// Start a service through the manager and wait until it is ready.
///
/// The process is registered under its id like any other managed process;
/// stopping or restarting it afterwards goes through the manager.
pub async fn start_service<S: ManagedService>(
    manager: &ProcessManager,
    service: &S,
) -> Result<Arc<ManagedProcess>> {
    let process = manager.init_process(service.spawn_spec());
    manager.start(Arc::clone(&process)).await?;

    wait_until_ready(
        &process,
        &service.probe(),
        |output| service.is_ready(output),
        |output| service.failed_record(output),
    )
    .await?;

    service.on_ready(&process).await?;
    Ok(process)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::error::WardenError;
    use crate::process::ProcessState;

    struct Emulator {
        script: &'static str,
    }

    #[async_trait]
    impl ManagedService for Emulator {
        fn spawn_spec(&self) -> SpawnSpec {
            SpawnSpec::new("emulator", Command::new("sh").args(["-c", self.script]))
                .with_id("emulator")
        }

        fn is_ready(&self, output: &[OutputRecord]) -> bool {
            output.iter().any(|r| r.data.contains("Started"))
        }
    }

    #[tokio::test]
    async fn service_start_waits_for_readiness() {
        let manager = ProcessManager::new();
        let emulator = Emulator {
            script: "trap 'exit 0' INT; sleep 0.2; echo 'Started emulator'; \
                     while :; do sleep 0.05; done",
        };

        let process = start_service(&manager, &emulator).await.unwrap();
        assert_eq!(process.state().unwrap(), ProcessState::Running);
        assert!(manager.contains("emulator").unwrap());

        manager.stop("emulator").await.unwrap();
    }

    #[tokio::test]
    async fn service_start_surfaces_startup_failure() {
        let manager = ProcessManager::new();
        let emulator = Emulator {
            script: "trap 'exit 0' INT; echo 'port 8545 unavailable' >&2; \
                     while :; do sleep 0.05; done",
        };

        let err = start_service(&manager, &emulator).await.unwrap_err();
        assert!(matches!(err, WardenError::ReadinessFailure { .. }));

        manager.stop("emulator").await.unwrap();
    }
}
