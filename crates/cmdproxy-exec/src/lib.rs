//! Subprocess executor (C7).
//!
//! Spawns a command with an assembled argv, environment, working directory
//! and stdio redirection, and reports the process exit code. Does not
//! interpret stdio content.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod which;

use cmdproxy_error::CmdproxyError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Materialised, executor-ready process specification.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// `argv[0]`, the command to execute.
    pub command: String,
    /// `argv[1..]`.
    pub args: Vec<String>,
    /// Environment mapping. `None` means inherit the worker's environment.
    pub env: Option<BTreeMap<String, String>>,
    /// Working directory. `None` means inherit the worker's cwd.
    pub cwd: Option<String>,
    /// Path to redirect stdout into (created/truncated).
    pub stdout_path: Option<PathBuf>,
    /// Path to redirect stderr into (created/truncated).
    pub stderr_path: Option<PathBuf>,
}

impl ExecSpec {
    /// Build a bare spec with no env/cwd/stdio overrides.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: None,
            cwd: None,
            stdout_path: None,
            stderr_path: None,
        }
    }
}

/// Spawn `spec` and wait for it to exit, returning the exit code.
///
/// On Unix, a process terminated by a signal has no exit code; this is
/// reported as [`cmdproxy_error::ErrorCode::ExecutionFailure`] rather than a
/// fabricated code, since the distinction matters to callers.
pub async fn execute(spec: &ExecSpec) -> Result<i32, CmdproxyError> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args);

    if let Some(env) = &spec.env {
        cmd.env_clear();
        cmd.envs(env);
    }

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdout(stdio_for(&spec.stdout_path).await?);
    cmd.stderr(stdio_for(&spec.stderr_path).await?);
    cmd.stdin(Stdio::null());

    debug!(command = %spec.command, args = ?spec.args, "spawning subprocess");

    let mut child = cmd.spawn().map_err(|e| {
        CmdproxyError::execution_failure(format!("failed to spawn {}: {e}", spec.command))
            .with_context("command", spec.command.clone())
            .with_source(e)
    })?;

    let status = child.wait().await.map_err(|e| {
        CmdproxyError::execution_failure(format!("failed to wait for {}: {e}", spec.command))
            .with_source(e)
    })?;

    status.code().ok_or_else(|| {
        CmdproxyError::execution_failure(format!(
            "{} terminated by signal before exiting",
            spec.command
        ))
    })
}

async fn stdio_for(path: &Option<PathBuf>) -> Result<Stdio, CmdproxyError> {
    match path {
        None => Ok(Stdio::null()),
        Some(p) => {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(p)
                .await
                .map_err(|e| {
                    CmdproxyError::execution_failure(format!(
                        "opening stdio sink {}: {e}",
                        p.display()
                    ))
                    .with_source(e)
                })?;
            Ok(Stdio::from(file.into_std().await))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_exits_zero() {
        let spec = ExecSpec::new("/bin/sh", vec!["-c".into(), "exit 0".into()]);
        assert_eq!(execute(&spec).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_not_an_error() {
        let spec = ExecSpec::new("/bin/sh", vec!["-c".into(), "exit 7".into()]);
        assert_eq!(execute(&spec).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn stdout_redirection_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut spec = ExecSpec::new("/bin/sh", vec!["-c".into(), "echo hello".into()]);
        spec.stdout_path = Some(out.clone());
        execute(&spec).await.unwrap();
        let contents = tokio::fs::read_to_string(&out).await.unwrap();
        assert_eq!(contents, "hello\n");
    }

    #[tokio::test]
    async fn spawn_failure_is_execution_failure() {
        let spec = ExecSpec::new("/no/such/binary-cmdproxy", vec![]);
        let err = execute(&spec).await.unwrap_err();
        assert_eq!(err.code, cmdproxy_error::ErrorCode::ExecutionFailure);
    }
}
