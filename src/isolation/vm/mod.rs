//! Virtual machine isolations.
//!
//! Every VM family follows the same lifecycle: clone a source image into a
//! uniquely named VM, apply resources, boot it, wait for an IP, then hand
//! over to [`crate::bootstrap`] to get the agent running over SSH. Only the
//! hypervisor command line differs, so it sits behind [`Hypervisor`].

mod parallels;
mod tart;
mod vetu;

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::agent_arch;
use crate::bootstrap::{self, BootstrapConfig, Hook};
use crate::isolation::{IsolationError, IsolationSpec, RunConfig, StandbyCapableInstance};

pub use parallels::Parallels;
pub use tart::Tart;
pub use vetu::Vetu;

const DEFAULT_USER: &str = "admin";
const DEFAULT_PASSWORD: &str = "admin";
const DEFAULT_SSH_PORT: u16 = 22;

const IP_RETRY_DELAY: Duration = Duration::from_secs(1);
const IP_MAX_ATTEMPTS: u32 = 120;

/// Directory Tart guests mount host shares under.
pub const TART_SHARED_DIR: &str = "/Volumes/My Shared Files";

/// Command line driver for one hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync + Debug {
    fn tool(&self) -> &'static str;

    async fn pull(&self, image: &str) -> Result<(), IsolationError>;

    async fn fqn(&self, image: &str) -> Result<String, IsolationError>;

    async fn clone_vm(&self, image: &str, name: &str) -> Result<(), IsolationError>;

    /// Apply CPU, memory, disk and display settings from `spec`.
    async fn configure(&self, name: &str, spec: &IsolationSpec) -> Result<(), IsolationError>;

    /// Boot the VM. Hypervisors whose run command stays in the foreground
    /// return the child process, which lives as long as the VM.
    async fn start(
        &self,
        name: &str,
        spec: &IsolationSpec,
        shares: &[Share],
        extra_args: &[String],
    ) -> Result<Option<Child>, IsolationError>;

    async fn ip(&self, name: &str) -> Result<String, IsolationError>;

    async fn stop(&self, name: &str) -> Result<(), IsolationError>;

    async fn delete(&self, name: &str) -> Result<(), IsolationError>;
}

/// Host directory exposed to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub name: String,
    pub source: String,
    pub read_only: bool,
}

/// A VM-backed isolation instance.
#[derive(Debug)]
pub struct VmInstance {
    spec: IsolationSpec,
    hypervisor: Box<dyn Hypervisor>,
    name: String,
    cloned: bool,
    started: bool,
    shares: Vec<Share>,
    child: Option<Child>,
}

impl VmInstance {
    /// Build an instance driven by the hypervisor for `spec`'s family.
    pub fn new(spec: IsolationSpec) -> Result<Self, IsolationError> {
        let hypervisor: Box<dyn Hypervisor> = match &spec {
            IsolationSpec::Parallels(_) => Box::new(Parallels::default()),
            IsolationSpec::Tart(_) => Box::new(Tart::default()),
            IsolationSpec::Vetu(_) => Box::new(Vetu::default()),
            IsolationSpec::None | IsolationSpec::Container(_) => {
                return Err(IsolationError::NotVirtualMachine(spec.family()))
            }
        };
        Ok(Self::with_hypervisor(spec, hypervisor))
    }

    pub fn with_hypervisor(spec: IsolationSpec, hypervisor: Box<dyn Hypervisor>) -> Self {
        Self {
            spec,
            hypervisor,
            name: format!("persistent-worker-{}", Uuid::new_v4()),
            cloned: false,
            started: false,
            shares: Vec::new(),
            child: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn image(&self) -> &str {
        self.spec.image().unwrap_or_default()
    }

    fn credentials(&self) -> (String, String, u16) {
        let (user, password, port) = match &self.spec {
            IsolationSpec::Tart(spec) => (spec.user.as_str(), spec.password.as_str(), spec.port),
            IsolationSpec::Vetu(spec) => (spec.user.as_str(), spec.password.as_str(), spec.port),
            IsolationSpec::Parallels(spec) => (spec.user.as_str(), spec.password.as_str(), 0),
            _ => ("", "", 0),
        };
        (
            non_empty_or(user, DEFAULT_USER),
            non_empty_or(password, DEFAULT_PASSWORD),
            if port == 0 { DEFAULT_SSH_PORT } else { port },
        )
    }

    /// Agent platform the guest expects.
    fn guest_platform(&self) -> (&'static str, &'static str) {
        match &self.spec {
            IsolationSpec::Vetu(_) => ("linux", agent_arch(std::env::consts::ARCH)),
            IsolationSpec::Parallels(spec) => (spec.platform.as_str(), "amd64"),
            _ => ("darwin", "arm64"),
        }
    }

    fn uses_shared_project(&self, config: &RunConfig) -> bool {
        matches!(self.spec, IsolationSpec::Tart(_))
            && config.dirty_mode
            && !config.project_dir.is_empty()
    }

    pub fn working_directory(&self, project_dir: &str, dirty_mode: bool) -> PathBuf {
        let (user, _, _) = self.credentials();
        match &self.spec {
            IsolationSpec::Tart(_) if dirty_mode && !project_dir.is_empty() => {
                Path::new(TART_SHARED_DIR).join("working-dir")
            }
            IsolationSpec::Tart(_) => PathBuf::from(format!("/Users/{}/working-dir", user)),
            IsolationSpec::Vetu(_) => PathBuf::from(format!("/home/{}/working-dir", user)),
            _ => PathBuf::from("/tmp/cirrus-ci/working-dir"),
        }
    }

    /// Whether the project directory was shared at boot. A VM warmed up
    /// before the task was known never has it.
    fn project_shared(&self) -> bool {
        self.shares.iter().any(|share| share.name == "working-dir")
    }

    fn effective_working_directory(&self, config: &RunConfig) -> String {
        let dirty_mode = config.dirty_mode && self.project_shared();
        self.working_directory(&config.project_dir, dirty_mode)
            .to_string_lossy()
            .to_string()
    }

    /// Directories to share with the guest at boot.
    fn shares_for(&self, config: &RunConfig) -> Vec<Share> {
        let mut shares = Vec::new();
        if let IsolationSpec::Tart(spec) = &self.spec {
            if self.uses_shared_project(config) {
                shares.push(Share {
                    name: "working-dir".to_string(),
                    source: config.project_dir.clone(),
                    read_only: false,
                });
            }
            for (i, volume) in spec.volumes.iter().enumerate() {
                shares.push(Share {
                    name: format!("volume-{}", i),
                    source: volume.source.clone(),
                    read_only: volume.read_only,
                });
            }
        }
        shares
    }

    /// Hooks run over SSH before and after the agent.
    fn hooks(&self, config: &RunConfig) -> (Vec<Hook>, Vec<Hook>) {
        let mut init = Vec::new();
        let mut termination = Vec::new();

        if let IsolationSpec::Tart(spec) = &self.spec {
            if !self.shares.is_empty() {
                init.push(Hook::Command(format!(
                    "mkdir -p '{dir}' && (mount | grep -q '{dir}' || mount_virtiofs com.apple.virtio-fs.automount '{dir}')",
                    dir = TART_SHARED_DIR
                )));
                termination.push(Hook::Command(format!("umount '{}'", TART_SHARED_DIR)));
            }
            for (i, volume) in spec.volumes.iter().enumerate() {
                init.push(Hook::Command(format!(
                    "sudo mkdir -p \"$(dirname '{target}')\" && sudo ln -sfn '{shared}/volume-{i}' '{target}'",
                    target = volume.target,
                    shared = TART_SHARED_DIR,
                    i = i
                )));
            }
        }

        if !self.project_shared() && !config.project_dir.is_empty() {
            init.push(Hook::SyncProject {
                local: PathBuf::from(&config.project_dir),
                remote: self.effective_working_directory(config),
            });
        }

        (init, termination)
    }

    async fn retrieve_ip(&self, token: &CancellationToken) -> Result<String, IsolationError> {
        let mut last_error = None;
        for attempt in 1..=IP_MAX_ATTEMPTS {
            match self.hypervisor.ip(&self.name).await {
                Ok(ip) if !ip.is_empty() => return Ok(ip),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(vm = %self.name, attempt, error = %e, "VM has no IP yet");
                    last_error = Some(e);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(IP_RETRY_DELAY) => {}
                _ = token.cancelled() => return Err(IsolationError::Cancelled),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            IsolationError::backend(self.hypervisor.tool(), "VM did not report an IP address")
        }))
    }

    pub async fn run(
        &mut self,
        token: &CancellationToken,
        config: &RunConfig,
    ) -> Result<(), IsolationError> {
        if !self.started {
            self.pull(token).await;
            self.clone_configure_start(token, config).await?;
        } else {
            tracing::info!(task_id = %config.task_id, vm = %self.name, "Using pre-warmed VM");
        }

        let ip = self.retrieve_ip(token).await?;
        let (os, arch) = self.guest_platform();
        let agent = config.agent.get(&config.agent_version, os, arch).await?;

        let (user, password, port) = self.credentials();
        let working_dir = self.effective_working_directory(config);
        let (init_hooks, termination_hooks) = self.hooks(config);

        let mut env = config.env.clone();
        env.push(("CIRRUS_WORKING_DIR".to_string(), working_dir));

        let bootstrap = BootstrapConfig {
            host: ip,
            port,
            user,
            password,
            agent_binary: agent,
            endpoint: config.direct_endpoint.clone(),
            server_secret: config.server_secret.clone(),
            client_secret: config.client_secret.clone(),
            task_id: config.task_id.clone(),
            env,
            sync_time: matches!(self.spec, IsolationSpec::Parallels(_)),
            init_hooks,
            termination_hooks,
        };

        tracing::info!(task_id = %config.task_id, vm = %self.name, host = %bootstrap.host, "Bootstrapping agent");

        match bootstrap::run(token, &bootstrap).await {
            Ok(()) => Ok(()),
            Err(_) if token.is_cancelled() => Err(IsolationError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn close(mut self) -> Result<(), IsolationError> {
        let mut result = Ok(());

        if self.started {
            if let Err(e) = self.hypervisor.stop(&self.name).await {
                tracing::warn!(vm = %self.name, error = %e, "Failed to stop VM");
            }
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(vm = %self.name, error = %e, "Failed to kill hypervisor process");
            }
        }
        if self.cloned {
            if let Err(e) = self.hypervisor.delete(&self.name).await {
                result = Err(e);
            }
        }

        result
    }
}

#[async_trait]
impl StandbyCapableInstance for VmInstance {
    async fn pull(&mut self, token: &CancellationToken) {
        let image = self.image().to_string();
        tokio::select! {
            result = self.hypervisor.pull(&image) => {
                if let Err(e) = result {
                    tracing::warn!(image = %image, error = %e, "Failed to pull VM image");
                }
            }
            _ = token.cancelled() => {}
        }
    }

    async fn fqn(&mut self, token: &CancellationToken) -> Result<String, IsolationError> {
        tokio::select! {
            fqn = self.hypervisor.fqn(self.image()) => fqn,
            _ = token.cancelled() => Err(IsolationError::Cancelled),
        }
    }

    async fn clone_configure_start(
        &mut self,
        token: &CancellationToken,
        config: &RunConfig,
    ) -> Result<(), IsolationError> {
        if token.is_cancelled() {
            return Err(IsolationError::Cancelled);
        }

        tracing::info!(vm = %self.name, image = %self.image(), "Cloning VM");
        self.hypervisor.clone_vm(self.image(), &self.name).await?;
        self.cloned = true;
        if token.is_cancelled() {
            return Err(IsolationError::Cancelled);
        }

        self.hypervisor.configure(&self.name, &self.spec).await?;
        if token.is_cancelled() {
            return Err(IsolationError::Cancelled);
        }

        self.shares = self.shares_for(config);
        self.child = self
            .hypervisor
            .start(&self.name, &self.spec, &self.shares, &config.extra_args)
            .await?;
        self.started = true;

        Ok(())
    }

    fn isolation(&self) -> &IsolationSpec {
        &self.spec
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// Run a hypervisor CLI command to completion, returning trimmed stdout.
pub(crate) async fn cli(tool: &'static str, args: &[String]) -> Result<String, IsolationError> {
    let output = Command::new(tool).args(args).output().await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(IsolationError::backend(
            tool,
            format!(
                "{} ({}): {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                stderr.trim()
            ),
        ))
    }
}

/// Spawn a long-running hypervisor command whose stderr goes to the log.
pub(crate) fn spawn(tool: &'static str, args: &[String], vm: &str) -> Result<Child, IsolationError> {
    use std::process::Stdio;
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut child = Command::new(tool)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(stderr) = child.stderr.take() {
        let vm = vm.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(vm = %vm, tool, "{}", line);
            }
        });
    }

    Ok(child)
}
