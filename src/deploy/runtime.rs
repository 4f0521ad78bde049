//! Deploy runtime: the commands a deploy run executes.
//!
//! The sequencer only talks to the [`DeployRuntime`] capability so tests
//! can observe ordering without spawning processes. The production
//! implementation shells out to the configured argv vectors, typically
//! `git pull`, `podman build` and `podman stop`/`run`.

use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{DeploySettings, DeployTarget};

#[derive(Debug, Clone, Error)]
pub enum DeployError {
    #[error("`{command}` could not be spawned: {reason}")]
    Spawn { command: String, reason: String },
    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("deploy step has no command configured")]
    EmptyCommand,
}

#[async_trait]
pub trait DeployRuntime: Send + Sync {
    /// Bring the local checkout up to date with the remote.
    async fn pull_latest(&self) -> Result<(), DeployError>;

    /// Build the new image from the updated checkout.
    async fn build_image(&self) -> Result<(), DeployError>;

    /// Stop the running container for one target.
    async fn stop_container(&self, target: &DeployTarget) -> Result<(), DeployError>;

    /// Start a fresh container for one target from the new image.
    async fn start_container(&self, target: &DeployTarget) -> Result<(), DeployError>;
}

/// Runs each step as a child process and surfaces stderr on failure.
pub struct ShellRuntime {
    settings: DeploySettings,
}

impl ShellRuntime {
    pub fn new(settings: DeploySettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl DeployRuntime for ShellRuntime {
    async fn pull_latest(&self) -> Result<(), DeployError> {
        run(&self.settings.pull).await
    }

    async fn build_image(&self) -> Result<(), DeployError> {
        run(&self.settings.build).await
    }

    async fn stop_container(&self, target: &DeployTarget) -> Result<(), DeployError> {
        run(&target.stop).await
    }

    async fn start_container(&self, target: &DeployTarget) -> Result<(), DeployError> {
        run(&target.start).await
    }
}

async fn run(argv: &[String]) -> Result<(), DeployError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(DeployError::EmptyCommand);
    };
    let rendered = argv.join(" ");
    debug!(command = %rendered, "Running deploy command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| DeployError::Spawn {
            command: rendered.clone(),
            reason: err.to_string(),
        })?;

    if output.status.success() {
        info!(command = %rendered, "Deploy command succeeded");
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(DeployError::CommandFailed {
            command: rendered,
            status: output.status.code().unwrap_or(-1),
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn successful_command_returns_ok() {
        run(&argv(&["true"])).await.expect("true succeeds");
    }

    #[tokio::test]
    async fn failing_command_reports_status_and_stderr() {
        let err = run(&argv(&["sh", "-c", "echo build broke >&2; exit 3"]))
            .await
            .expect_err("should fail");

        match err {
            DeployError::CommandFailed {
                status, stderr, ..
            } => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "build broke");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unspawnable_command_is_reported() {
        let err = run(&argv(&["/nonexistent/definitely-not-a-binary"]))
            .await
            .expect_err("should fail");
        assert!(matches!(err, DeployError::Spawn { .. }));
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        assert!(matches!(
            run(&[]).await,
            Err(DeployError::EmptyCommand)
        ));
    }
}
