use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::agent_arch;
use crate::isolation::{ContainerSpec, IsolationError, RunConfig};
use crate::upstream::TaskId;

const DOCKER_BINARY: &str = "docker";
const CONTAINER_WORKING_DIR: &str = "/tmp/cirrus-ci-build";
const CONTAINER_AGENT_PATH: &str = "/tmp/cirrus-ci-agent";

/// Lines of container stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

/// Runs the agent inside a Docker container.
///
/// Containers get:
/// - CPU and memory limits from the isolation request
/// - the requested bind volumes
/// - the agent binary mounted read-only
/// - either the project directory bind-mounted (dirty mode) or a private
///   copy of it
#[derive(Debug)]
pub struct ContainerInstance {
    spec: ContainerSpec,
    docker: PathBuf,
    container_name: Option<String>,
}

impl ContainerInstance {
    pub fn new(spec: ContainerSpec) -> Self {
        Self {
            spec,
            docker: PathBuf::from(DOCKER_BINARY),
            container_name: None,
        }
    }

    #[cfg(test)]
    fn with_docker(spec: ContainerSpec, docker: impl Into<PathBuf>) -> Self {
        Self {
            docker: docker.into(),
            ..Self::new(spec)
        }
    }

    pub fn working_directory(&self, _project_dir: &str, _dirty_mode: bool) -> PathBuf {
        PathBuf::from(CONTAINER_WORKING_DIR)
    }

    /// Arguments for `docker create`, excluding the agent's own arguments.
    pub fn create_args(&self, name: &str, agent: &str, config: &RunConfig) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--workdir".to_string(),
            CONTAINER_WORKING_DIR.to_string(),
            "--add-host=host.docker.internal:host-gateway".to_string(),
            "--env".to_string(),
            format!("CIRRUS_WORKING_DIR={}", CONTAINER_WORKING_DIR),
        ];

        if self.spec.cpu > 0.0 {
            args.push(format!("--cpus={}", self.spec.cpu));
        }
        if self.spec.memory > 0 {
            args.push(format!("--memory={}m", self.spec.memory));
        }

        for (key, value) in &config.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push("--volume".to_string());
        args.push(format!("{}:{}:ro", agent, CONTAINER_AGENT_PATH));

        if config.dirty_mode && !config.project_dir.is_empty() {
            args.push("--volume".to_string());
            args.push(format!("{}:{}", config.project_dir, CONTAINER_WORKING_DIR));
        }

        for volume in &self.spec.volumes {
            let mut mount = format!("{}:{}", volume.source, volume.target);
            if volume.read_only {
                mount.push_str(":ro");
            }
            args.push("--volume".to_string());
            args.push(mount);
        }

        args.push(self.spec.image.clone());
        args.push(CONTAINER_AGENT_PATH.to_string());
        args.extend(config.agent_args(&config.container_endpoint));
        args
    }

    pub async fn run(
        &mut self,
        token: &CancellationToken,
        config: &RunConfig,
    ) -> Result<(), IsolationError> {
        self.pull_if_missing().await?;

        let agent = config
            .agent
            .get(&config.agent_version, "linux", agent_arch(std::env::consts::ARCH))
            .await?;

        let name = format!("persistent-worker-{}-{}", config.task_id, Uuid::new_v4());
        let args = self.create_args(&name, &agent.to_string_lossy(), config);
        docker(&self.docker, &args).await?;
        self.container_name = Some(name.clone());

        if !config.dirty_mode && !config.project_dir.is_empty() {
            let source = format!("{}/.", config.project_dir.trim_end_matches('/'));
            let destination = format!("{}:{}", name, CONTAINER_WORKING_DIR);
            docker(&self.docker, &["cp".to_string(), source, destination]).await?;
        }

        tracing::info!(
            task_id = %config.task_id,
            container = %name,
            image = %self.spec.image,
            "Starting container"
        );

        let mut child = Command::new(&self.docker)
            .args(["start", "--attach", &name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            let task_id = config.task_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(task_id = %task_id, "{}", line);
                }
            });
        }
        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| drain_stderr(stderr, config.task_id.clone()));

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    return Ok(());
                }
                let tail = match stderr_tail {
                    Some(handle) => handle.await.unwrap_or_default(),
                    None => String::new(),
                };
                Err(IsolationError::ExecutionFailed(if tail.is_empty() {
                    status.to_string()
                } else {
                    tail
                }))
            }
            _ = token.cancelled() => {
                tracing::info!(task_id = %config.task_id, container = %name, "Stopping container");
                if let Err(e) = docker(&self.docker, &["kill".to_string(), name.clone()]).await {
                    tracing::warn!(container = %name, error = %e, "Failed to kill container");
                }
                if let Err(e) = child.kill().await {
                    tracing::warn!(container = %name, error = %e, "Failed to kill docker client");
                }
                Err(IsolationError::Cancelled)
            }
        }
    }

    async fn pull_if_missing(&self) -> Result<(), IsolationError> {
        let inspect = Command::new(&self.docker)
            .args(["image", "inspect", &self.spec.image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if inspect.success() {
            return Ok(());
        }

        tracing::info!(image = %self.spec.image, "Pulling container image");
        docker(&self.docker, &["pull".to_string(), self.spec.image.clone()]).await?;
        Ok(())
    }

    pub async fn close(self) -> Result<(), IsolationError> {
        if let Some(name) = self.container_name {
            docker(&self.docker, &["rm".to_string(), "--force".to_string(), name]).await?;
        }
        Ok(())
    }
}

/// Log container stderr as it arrives and return its last lines once the
/// stream closes.
fn drain_stderr(stderr: ChildStderr, task_id: TaskId) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(task_id = %task_id, stream = "stderr", "{}", line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n").trim().to_string()
    })
}

/// Run a docker CLI command to completion, returning its stdout.
async fn docker(binary: &Path, args: &[String]) -> Result<String, IsolationError> {
    let output = Command::new(binary)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(IsolationError::backend(
            DOCKER_BINARY,
            format!(
                "{} ({}): {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                stderr.trim()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::agent::{AgentCache, AgentConfig};
    use crate::isolation::Volume;
    use crate::upstream::TaskId;

    fn run_config() -> RunConfig {
        let agent = AgentCache::new(&AgentConfig {
            cache_dir: Some(PathBuf::from("/tmp")),
            ..Default::default()
        })
        .unwrap();
        let mut config = RunConfig::new(TaskId::from("7"), Arc::new(agent));
        config.container_endpoint = "http://host.docker.internal:8080".to_string();
        config
    }

    #[test]
    fn create_args_apply_limits_and_volumes() {
        let instance = ContainerInstance::new(ContainerSpec {
            image: "alpine:latest".to_string(),
            cpu: 0.5,
            memory: 512,
            volumes: vec![Volume {
                source: "/cache".to_string(),
                target: "/root/.cache".to_string(),
                read_only: true,
            }],
        });

        let args = instance.create_args("c1", "/agent", &run_config());
        assert_eq!(args[0], "create");
        assert!(args.contains(&"--cpus=0.5".to_string()));
        assert!(args.contains(&"--memory=512m".to_string()));
        assert!(args.contains(&"/cache:/root/.cache:ro".to_string()));
        assert!(args.contains(&"/agent:/tmp/cirrus-ci-agent:ro".to_string()));

        let image_pos = args.iter().position(|a| a == "alpine:latest").unwrap();
        assert_eq!(args[image_pos + 1], CONTAINER_AGENT_PATH);
        assert_eq!(args[image_pos + 3], "http://host.docker.internal:8080");
    }

    /// Fake docker CLI whose `start` floods stderr well past a pipe buffer.
    fn noisy_docker(dir: &Path, exit_code: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("docker");
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = start ]; then\n  yes 'container output line' | head -n 20000 >&2\n  echo 'fatal: disk full' >&2\n  exit {exit_code}\nfi\nexit 0\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn agent_run_config() -> RunConfig {
        let agent = AgentCache::new(&AgentConfig {
            binary: Some(PathBuf::from("/bin/true")),
            cache_dir: Some(PathBuf::from("/tmp")),
            ..Default::default()
        })
        .unwrap();
        RunConfig::new(TaskId::from("7"), Arc::new(agent))
    }

    fn alpine() -> ContainerSpec {
        ContainerSpec {
            image: "alpine:latest".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn run_completes_despite_large_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mut instance = ContainerInstance::with_docker(alpine(), noisy_docker(dir.path(), 0));

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            instance.run(&CancellationToken::new(), &agent_run_config()),
        )
        .await
        .expect("container run should not block on a full stderr pipe");
        assert!(result.is_ok(), "{result:?}");
    }

    #[tokio::test]
    async fn failure_message_carries_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut instance = ContainerInstance::with_docker(alpine(), noisy_docker(dir.path(), 2));

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            instance.run(&CancellationToken::new(), &agent_run_config()),
        )
        .await
        .expect("container run should not block on a full stderr pipe");

        match result {
            Err(IsolationError::ExecutionFailed(message)) => {
                assert!(message.ends_with("fatal: disk full"), "{message}");
                assert!(message.lines().count() <= STDERR_TAIL_LINES);
            }
            other => panic!("unexpected result {other:?}"),
        }
        instance.close().await.unwrap();
    }

    #[test]
    fn dirty_mode_bind_mounts_project() {
        let instance = ContainerInstance::new(ContainerSpec {
            image: "alpine:latest".to_string(),
            ..Default::default()
        });
        let mut config = run_config();
        config.project_dir = "/src/project".to_string();
        config.dirty_mode = true;

        let args = instance.create_args("c1", "/agent", &config);
        assert!(args.contains(&"/src/project:/tmp/cirrus-ci-build".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--cpus")));
    }
}
