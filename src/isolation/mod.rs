//! Isolated environments that tasks execute in.
//!
//! Five isolation families share one capability set:
//!
//! - **none**: the agent runs as a local process in a scratch directory
//! - **container**: the agent runs inside a Docker container
//! - **parallels**, **tart**, **vetu**: the agent is bootstrapped over SSH
//!   into a freshly cloned virtual machine
//!
//! The set of families is closed and security-sensitive, so [`Instance`] is
//! an enum and [`Instance::new`] applies the [`Security`] policy before
//! anything is allocated. VM instances additionally implement
//! [`StandbyCapableInstance`], splitting clone+boot from running the agent so
//! the standby slot can pre-warm them.

pub mod container;
pub mod none;
mod spec;
pub mod vm;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentCache, AgentError};
use crate::bootstrap::BootstrapError;
use crate::security::{Security, SecurityError};
use crate::upstream::TaskId;

pub use container::ContainerInstance;
pub use none::NoneInstance;
pub use spec::{
    ContainerSpec, IsolationSpec, ParallelsSpec, Platform, TartSpec, VetuNetworking, VetuSpec,
    Volume,
};
pub use vm::{Hypervisor, VmInstance};

#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error("invalid isolation: {0}")]
    InvalidIsolation(#[from] SecurityError),

    #[error("agent unavailable: {0}")]
    Agent(#[from] AgentError),

    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("{0} isolation is not a virtual machine")]
    NotVirtualMachine(&'static str),

    #[error("{tool} failed: {message}")]
    Backend { tool: &'static str, message: String },

    #[error("agent exited with {0}")]
    ExecutionFailed(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IsolationError {
    pub fn backend(tool: &'static str, message: impl Into<String>) -> Self {
        IsolationError::Backend {
            tool,
            message: message.into(),
        }
    }
}

/// Per-task parameters handed to [`Instance::run`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub task_id: TaskId,
    /// Host project directory, empty to let the instance use its own
    /// scratch directory
    pub project_dir: String,
    /// Use `project_dir` verbatim instead of a private copy
    pub dirty_mode: bool,
    /// RPC endpoint reachable from inside containers
    pub container_endpoint: String,
    /// RPC endpoint reachable from the host and VMs
    pub direct_endpoint: String,
    pub server_secret: String,
    pub client_secret: String,
    pub agent: Arc<AgentCache>,
    pub agent_version: String,
    /// Extra environment exported before the agent starts
    pub env: Vec<(String, String)>,
    /// Extra arguments for the VM start command, from a resource modifier
    pub extra_args: Vec<String>,
}

impl RunConfig {
    pub fn new(task_id: TaskId, agent: Arc<AgentCache>) -> Self {
        let agent_version = agent.version().to_string();
        Self {
            task_id,
            project_dir: String::new(),
            dirty_mode: false,
            container_endpoint: String::new(),
            direct_endpoint: String::new(),
            server_secret: String::new(),
            client_secret: String::new(),
            agent,
            agent_version,
            env: Vec::new(),
            extra_args: Vec::new(),
        }
    }

    /// Command line arguments the agent is started with.
    pub fn agent_args(&self, endpoint: &str) -> Vec<String> {
        vec![
            "-api-endpoint".to_string(),
            endpoint.to_string(),
            "-server-token".to_string(),
            self.server_secret.clone(),
            "-client-token".to_string(),
            self.client_secret.clone(),
            "-task-id".to_string(),
            self.task_id.to_string(),
        ]
    }
}

/// Extension implemented by isolations that can be cloned and booted
/// before the task that will use them is known.
#[async_trait]
pub trait StandbyCapableInstance: Send {
    /// Best-effort image pre-fetch. Failures are logged, not returned, so
    /// a missing image fails loudly at clone time instead.
    async fn pull(&mut self, token: &CancellationToken);

    /// Fully-qualified name of the image actually in use.
    async fn fqn(&mut self, token: &CancellationToken) -> Result<String, IsolationError>;

    /// Clone from the pulled image, apply resources, and boot, without
    /// starting the agent.
    async fn clone_configure_start(
        &mut self,
        token: &CancellationToken,
        config: &RunConfig,
    ) -> Result<(), IsolationError>;

    /// Specification this instance was built from.
    fn isolation(&self) -> &IsolationSpec;
}

/// An isolated environment for one task.
#[derive(Debug)]
pub enum Instance {
    None(NoneInstance),
    Container(ContainerInstance),
    Vm(VmInstance),
}

impl Instance {
    /// Build an instance for `spec`, rejecting it first if the security
    /// policy does not allow it.
    pub fn new(spec: &IsolationSpec, security: &Security) -> Result<Self, IsolationError> {
        security.validate(spec)?;

        let instance = match spec {
            IsolationSpec::None => Instance::None(NoneInstance::new()?),
            IsolationSpec::Container(container) => {
                Instance::Container(ContainerInstance::new(container.clone()))
            }
            IsolationSpec::Parallels(_) | IsolationSpec::Tart(_) | IsolationSpec::Vetu(_) => {
                Instance::Vm(VmInstance::new(spec.clone())?)
            }
        };

        Ok(instance)
    }

    /// Run the task to completion. On cancellation, in-progress work is
    /// terminated before returning.
    pub async fn run(
        &mut self,
        token: &CancellationToken,
        config: &RunConfig,
    ) -> Result<(), IsolationError> {
        match self {
            Instance::None(instance) => instance.run(token, config).await,
            Instance::Container(instance) => instance.run(token, config).await,
            Instance::Vm(instance) => instance.run(token, config).await,
        }
    }

    /// Directory the task executes in, computed without side effects.
    pub fn working_directory(&self, project_dir: &str, dirty_mode: bool) -> PathBuf {
        match self {
            Instance::None(instance) => instance.working_directory(project_dir, dirty_mode),
            Instance::Container(instance) => instance.working_directory(project_dir, dirty_mode),
            Instance::Vm(instance) => instance.working_directory(project_dir, dirty_mode),
        }
    }

    /// Release everything acquired for this instance.
    pub async fn close(self) -> Result<(), IsolationError> {
        match self {
            Instance::None(instance) => instance.close(),
            Instance::Container(instance) => instance.close().await,
            Instance::Vm(instance) => instance.close().await,
        }
    }

    pub fn family(&self) -> &'static str {
        match self {
            Instance::None(_) => "none",
            Instance::Container(_) => "container",
            Instance::Vm(instance) => instance.isolation().family(),
        }
    }

    /// Take the standby-capable instance out, or give `self` back.
    pub fn into_standby(self) -> Result<VmInstance, Instance> {
        match self {
            Instance::Vm(instance) => Ok(instance),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{AllowedIsolations, TartPolicy};

    #[test]
    fn construction_rejects_disallowed_image_before_allocation() {
        let security = Security {
            allowed_isolations: AllowedIsolations {
                tart: Some(TartPolicy {
                    allowed_images: vec!["ghcr.io/cirruslabs/*".to_string()],
                    ..Default::default()
                }),
                ..Default::default()
            },
        };
        let spec = IsolationSpec::Tart(TartSpec {
            image: "evil/*".to_string(),
            ..Default::default()
        });

        let result = Instance::new(&spec, &security);
        assert!(matches!(result, Err(IsolationError::InvalidIsolation(_))));
    }

    #[test]
    fn construction_builds_vm_for_allowed_image() {
        let security = Security::permissive();
        let spec = IsolationSpec::Tart(TartSpec {
            image: "ghcr.io/cirruslabs/macos-sonoma-base:latest".to_string(),
            ..Default::default()
        });

        let instance = Instance::new(&spec, &security).unwrap();
        assert_eq!(instance.family(), "tart");
        assert!(instance.into_standby().is_ok());
    }

    #[test]
    fn none_instance_is_not_standby_capable() {
        let instance = Instance::new(&IsolationSpec::None, &Security::permissive()).unwrap();
        assert!(matches!(instance.into_standby(), Err(Instance::None(_))));
    }

    #[test]
    fn agent_args_keep_order() {
        let agent = Arc::new(
            AgentCache::new(&crate::agent::AgentConfig {
                cache_dir: Some(PathBuf::from("/tmp")),
                ..Default::default()
            })
            .unwrap(),
        );
        let mut config = RunConfig::new(TaskId::from("42"), agent);
        config.server_secret = "server".to_string();
        config.client_secret = "client".to_string();

        let args = config.agent_args("http://127.0.0.1:8080");
        assert_eq!(
            args,
            vec![
                "-api-endpoint",
                "http://127.0.0.1:8080",
                "-server-token",
                "server",
                "-client-token",
                "client",
                "-task-id",
                "42"
            ]
        );
    }
}
