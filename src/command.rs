use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::debug;
use tokio::process::{Child, Command as TokioCommand};

use crate::error::{Result, WardenError};

/// Description of a program invocation for a managed process.
///
/// Immutable after construction; a `ManagedProcess` re-spawns the same
/// command on every `start()`.
#[derive(Debug, Clone)]
pub struct Command {
    /// Program to execute
    program: String,

    /// Arguments to pass to the program
    args: Vec<String>,

    /// Current working directory
    current_dir: Option<PathBuf>,

    /// Environment variable overrides
    env_vars: HashMap<String, String>,
}

impl Command {
    /// Create a new command
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env_vars: HashMap::new(),
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self.args.push(arg.into());
        }
        self
    }

    /// Set the current working directory
    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Add an environment variable override
    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars.insert(key.into(), val.into());
        self
    }

    /// Add multiple environment variable overrides
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, val) in vars {
            self.env_vars.insert(key.into(), val.into());
        }
        self
    }

    /// Get the program name
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Get the argument list
    pub fn arg_list(&self) -> &[String] {
        &self.args
    }

    /// Spawn the command with both output streams captured.
    ///
    /// A spawn failure (e.g. binary not found) is returned as
    /// [`WardenError::Spawn`] and leaves nothing running.
    pub fn spawn(&self) -> Result<SpawnedChild> {
        debug!("Spawning command: {} {:?}", self.program, self.args);

        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.args);

        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        for (key, val) in &self.env_vars {
            cmd.env(key, val);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| WardenError::Spawn {
            name: self.program.clone(),
            source: e,
        })?;

        let pid = child.id();

        Ok(SpawnedChild { child, pid })
    }
}

/// A freshly spawned OS process with its captured output pipes.
#[derive(Debug)]
pub struct SpawnedChild {
    /// Child process, output pipes still attached
    pub child: Child,

    /// OS process id, if the child has not already been reaped
    pub pid: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_args_and_env() {
        let cmd = Command::new("echo")
            .arg("one")
            .args(["two", "three"])
            .env("A", "1")
            .envs([("B", "2"), ("C", "3")]);

        assert_eq!(cmd.program(), "echo");
        assert_eq!(cmd.arg_list(), &["one", "two", "three"]);
        assert_eq!(cmd.env_vars.len(), 3);
        assert_eq!(cmd.env_vars.get("B"), Some(&"2".to_string()));
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails() {
        let cmd = Command::new("definitely-not-a-real-binary-7f3a");
        let err = cmd.spawn().unwrap_err();
        assert!(matches!(err, WardenError::Spawn { .. }));
    }

    #[tokio::test]
    async fn spawn_reports_pid() {
        let cmd = Command::new("sh").args(["-c", "exit 0"]);
        let spawned = cmd.spawn().unwrap();
        assert!(spawned.pid.is_some());
    }
}
