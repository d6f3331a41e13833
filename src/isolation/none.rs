use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::agent::host_platform;
use crate::isolation::{IsolationError, RunConfig};

/// Runs the agent directly on the host, without isolation.
#[derive(Debug)]
pub struct NoneInstance {
    scratch: TempDir,
}

impl NoneInstance {
    pub fn new() -> Result<Self, IsolationError> {
        let scratch = tempfile::Builder::new()
            .prefix("persistent-worker-")
            .tempdir()?;
        Ok(Self { scratch })
    }

    pub fn working_directory(&self, project_dir: &str, dirty_mode: bool) -> PathBuf {
        if dirty_mode && !project_dir.is_empty() {
            PathBuf::from(project_dir)
        } else {
            self.scratch.path().join("working-dir")
        }
    }

    pub async fn run(
        &mut self,
        token: &CancellationToken,
        config: &RunConfig,
    ) -> Result<(), IsolationError> {
        let (os, arch) = host_platform();
        let agent = config.agent.get(&config.agent_version, os, arch).await?;

        let working_dir = self.working_directory(&config.project_dir, config.dirty_mode);
        if !config.dirty_mode && !config.project_dir.is_empty() {
            let source = PathBuf::from(&config.project_dir);
            let destination = working_dir.clone();
            tokio::task::spawn_blocking(move || copy_tree(&source, &destination))
                .await
                .map_err(std::io::Error::other)??;
        } else {
            tokio::fs::create_dir_all(&working_dir).await?;
        }

        tracing::info!(
            task_id = %config.task_id,
            agent = %agent.display(),
            working_dir = %working_dir.display(),
            "Starting agent without isolation"
        );

        let mut child = Command::new(&agent)
            .args(config.agent_args(&config.direct_endpoint))
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("CIRRUS_WORKING_DIR", &working_dir)
            .current_dir(&working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let task_id = config.task_id.clone();
        if let Some(stdout) = child.stdout.take() {
            let task_id = task_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(task_id = %task_id, "{}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(task_id = %task_id, stream = "stderr", "{}", line);
                }
            });
        }

        tokio::select! {
            status = child.wait() => check_exit(status?),
            _ = token.cancelled() => {
                tracing::info!(task_id = %config.task_id, "Cancelling agent process");
                if let Err(e) = child.kill().await {
                    tracing::warn!(task_id = %config.task_id, error = %e, "Failed to kill agent process");
                }
                Err(IsolationError::Cancelled)
            }
        }
    }

    pub fn close(self) -> Result<(), IsolationError> {
        self.scratch.close()?;
        Ok(())
    }
}

fn check_exit(status: ExitStatus) -> Result<(), IsolationError> {
    if status.success() {
        Ok(())
    } else {
        Err(IsolationError::ExecutionFailed(status.to_string()))
    }
}

/// Recursively copy `source` into `destination`, creating it if needed.
fn copy_tree(source: &Path, destination: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(source) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
