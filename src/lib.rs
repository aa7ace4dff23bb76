//! A core library for supervising long-running external processes
//!
//! `warden` spawns, monitors, restarts, and gracefully terminates child
//! programs, captures their interleaved output streams, and detects when a
//! started service has actually become usable.

pub mod command;
pub mod config;
pub mod error;
pub mod manager;
pub mod output;
pub mod process;
pub mod readiness;
pub mod service;
pub mod util;

/// Re-export of commonly used types for convenience
pub mod prelude {
    pub use crate::command::Command;
    pub use crate::config::SupervisorConfig;
    pub use crate::error::{Result, WardenError};
    pub use crate::manager::{ManagerEvent, ProcessManager};
    pub use crate::output::{OutputRecord, OutputSource, OutputStream};
    pub use crate::process::{ManagedProcess, ProcessSnapshot, ProcessState, SpawnSpec};
    pub use crate::readiness::{ReadinessProbe, wait_until_ready};
    pub use crate::service::{ManagedService, start_service};
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
