//! Getting the agent running inside a freshly booted VM over SSH.
//!
//! The sequence is: connect (retrying until the guest's SSH server is up),
//! run initialization hooks, upload the agent, then feed a login shell the
//! agent command line and wait for it to exit, followed by termination
//! hooks.
//!
//! The SSH client cannot observe a [`CancellationToken`], so a watcher task
//! force-closes the connection when the token fires. Everything blocked on
//! the connection then returns and the cancellation is reported instead of
//! whatever I/O error the disconnect produced.

mod connect;
mod relay;
pub mod script;
mod session;

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::upstream::TaskId;

pub use connect::{wait_for_ssh, SshDialer, TcpDialer, RETRY_DELAY};
pub use session::{ForwardTarget, SessionCloser, SshSession};

/// Remote location of the uploaded agent.
pub const REMOTE_AGENT_PATH: &str = "/tmp/cirrus-ci/cirrus-ci-agent";

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH authentication failed for user {user}")]
    AuthenticationFailed { user: String },

    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("hook `{hook}` failed: {message}")]
    Hook { hook: String, message: String },

    #[error("agent exited with status {0}")]
    AgentExited(u32),

    #[error("SSH session closed without an exit status")]
    SessionClosed,

    #[error("bootstrap was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Step run over SSH around the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hook {
    /// Shell command that must exit with status 0
    Command(String),
    /// Copy a host directory into the guest
    SyncProject { local: PathBuf, remote: String },
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Hook::Command(command) => write!(f, "{}", command),
            Hook::SyncProject { local, remote } => {
                write!(f, "sync {} to {}", local.display(), remote)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Host path of the agent binary for the guest's platform
    pub agent_binary: PathBuf,
    /// Worker RPC endpoint the agent reports to
    pub endpoint: String,
    pub server_secret: String,
    pub client_secret: String,
    pub task_id: TaskId,
    pub env: Vec<(String, String)>,
    /// Set the guest clock first, for VMs resumed from suspend
    pub sync_time: bool,
    pub init_hooks: Vec<Hook>,
    pub termination_hooks: Vec<Hook>,
}

/// Bootstrap and run the agent, returning once it exits.
pub async fn run(token: &CancellationToken, config: &BootstrapConfig) -> Result<(), BootstrapError> {
    let forward = ForwardTarget::for_endpoint(&config.endpoint);
    let dialer = TcpDialer::new(
        config.host.clone(),
        config.port,
        config.user.clone(),
        config.password.clone(),
    )
    .with_forward(forward.clone());

    let session = wait_for_ssh(token, &dialer).await?;

    let done = CancellationToken::new();
    let _watcher = done.clone().drop_guard();
    spawn_watcher(token.clone(), done, session.closer());

    let result = async {
        for hook in &config.init_hooks {
            run_hook(&session, hook).await?;
        }

        let result = run_agent(&session, config, forward.is_some()).await;

        for hook in &config.termination_hooks {
            if token.is_cancelled() {
                break;
            }
            if let Err(e) = run_hook(&session, hook).await {
                tracing::warn!(task_id = %config.task_id, hook = %hook, error = %e, "Termination hook failed");
            }
        }

        result
    }
    .await;

    session.close().await;

    match result {
        Err(_) if token.is_cancelled() => Err(BootstrapError::Cancelled),
        other => other,
    }
}

/// Force-close the connection when `token` fires, until `done` does.
fn spawn_watcher(token: CancellationToken, done: CancellationToken, closer: SessionCloser) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!("Cancellation requested, closing SSH connection");
                closer.close().await;
            }
            _ = done.cancelled() => {}
        }
    });
}

async fn run_hook(session: &SshSession, hook: &Hook) -> Result<(), BootstrapError> {
    tracing::debug!(hook = %hook, "Running hook");
    match hook {
        Hook::Command(command) => {
            let status = session.exec(command).await?;
            if status != 0 {
                return Err(BootstrapError::Hook {
                    hook: hook.to_string(),
                    message: format!("exited with status {}", status),
                });
            }
        }
        Hook::SyncProject { local, remote } => {
            session
                .sync_dir(local, remote)
                .await
                .map_err(|e| BootstrapError::Hook {
                    hook: hook.to_string(),
                    message: e.to_string(),
                })?;
        }
    }
    Ok(())
}

async fn run_agent(
    session: &SshSession,
    config: &BootstrapConfig,
    forward: bool,
) -> Result<(), BootstrapError> {
    session
        .upload_executable(&config.agent_binary, REMOTE_AGENT_PATH)
        .await?;

    let endpoint = if forward {
        let port = session.forward_remote().await?;
        tracing::debug!(task_id = %config.task_id, port, "Forwarding guest port to worker endpoint");
        format!("http://127.0.0.1:{}", port)
    } else {
        config.endpoint.clone()
    };

    let sync_time = config.sync_time.then(chrono::Utc::now);
    let script = script::render(
        &config.env,
        sync_time,
        &script::AgentCommand {
            binary: REMOTE_AGENT_PATH,
            endpoint: &endpoint,
            server_secret: &config.server_secret,
            client_secret: &config.client_secret,
            task_id: config.task_id.as_str(),
        },
    );

    tracing::info!(task_id = %config.task_id, "Starting agent in guest");
    session.shell(&script, &config.task_id).await
}
