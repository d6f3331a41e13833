//! Thin wrapper over a russh client connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::relay;
use super::BootstrapError;
use crate::upstream::TaskId;

/// Local endpoint that guest connections through the remote forward are
/// relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardTarget {
    Tcp(String),
    Unix(PathBuf),
}

impl ForwardTarget {
    /// Forward target for `endpoint`, if the guest cannot reach it directly.
    ///
    /// Only loopback and unix socket endpoints need forwarding.
    pub fn for_endpoint(endpoint: &str) -> Option<Self> {
        if let Some(path) = endpoint.strip_prefix("unix://") {
            return Some(ForwardTarget::Unix(PathBuf::from(path)));
        }
        if let Some(path) = endpoint.strip_prefix("unix:") {
            return Some(ForwardTarget::Unix(PathBuf::from(path)));
        }

        let authority = endpoint
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(endpoint)
            .split('/')
            .next()
            .unwrap_or_default();

        let host = match authority.rsplit_once(':') {
            Some((host, _port)) => host,
            None => authority,
        };

        match host {
            "127.0.0.1" | "localhost" | "[::1]" => Some(ForwardTarget::Tcp(authority.to_string())),
            _ => None,
        }
    }
}

pub(crate) struct ClientHandler {
    forward: Option<ForwardTarget>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // Guests are freshly cloned from images and regenerate host keys.
    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            connected = %format!("{}:{}", connected_address, connected_port),
            originator = %format!("{}:{}", originator_address, originator_port),
            "Guest opened forwarded connection"
        );
        if let Some(target) = self.forward.clone() {
            tokio::spawn(relay::pipe(channel, target));
        }
        Ok(())
    }
}

/// Closes the connection from another task.
///
/// Requests that hold the handle while waiting on the guest give it up as
/// soon as `closing` fires, so a stalled guest cannot hold off the close.
#[derive(Clone)]
pub struct SessionCloser {
    handle: Arc<Mutex<Handle<ClientHandler>>>,
    closing: CancellationToken,
}

impl SessionCloser {
    pub async fn close(&self) {
        self.closing.cancel();
        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(error = %e, "SSH disconnect failed");
        }
    }
}

/// An authenticated SSH connection to a guest.
pub struct SshSession {
    handle: Arc<Mutex<Handle<ClientHandler>>>,
    closing: CancellationToken,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession").finish_non_exhaustive()
    }
}

impl SshSession {
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        forward: Option<ForwardTarget>,
    ) -> Result<Self, BootstrapError> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        let stream = TcpStream::connect((host, port)).await?;
        let mut handle = client::connect_stream(config, stream, ClientHandler { forward }).await?;

        if !handle.authenticate_password(user, password).await? {
            return Err(BootstrapError::AuthenticationFailed {
                user: user.to_string(),
            });
        }

        Ok(Self {
            handle: Arc::new(Mutex::new(handle)),
            closing: CancellationToken::new(),
        })
    }

    pub fn closer(&self) -> SessionCloser {
        SessionCloser {
            handle: self.handle.clone(),
            closing: self.closing.clone(),
        }
    }

    async fn open_channel(&self) -> Result<Channel<client::Msg>, BootstrapError> {
        tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(BootstrapError::SessionClosed),
            channel = async {
                let handle = self.handle.lock().await;
                handle.channel_open_session().await
            } => Ok(channel?),
        }
    }

    /// Run `command` and return its exit status.
    pub async fn exec(&self, command: &str) -> Result<u32, BootstrapError> {
        let mut channel = self.open_channel().await?;
        channel.exec(true, command).await?;

        let mut output = LineLogger::new("exec");
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } | ChannelMsg::ExtendedData { ref data, .. } => {
                    output.push(data)
                }
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }
        output.flush();

        exit_status.ok_or(BootstrapError::SessionClosed)
    }

    async fn sftp(&self) -> Result<SftpSession, BootstrapError> {
        let channel = self.open_channel().await?;
        channel.request_subsystem(true, "sftp").await?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| BootstrapError::Sftp(e.to_string()))
    }

    /// Upload `local` to `remote` and make it executable.
    pub async fn upload_executable(&self, local: &Path, remote: &str) -> Result<(), BootstrapError> {
        let sftp = self.sftp().await?;

        if let Some(parent) = Path::new(remote).parent() {
            create_dir_all(&sftp, &parent.to_string_lossy()).await?;
        }
        upload_file(&sftp, local, remote).await?;

        let status = self
            .exec(&format!("chmod 755 {}", super::script::shell_quote(remote)))
            .await?;
        if status != 0 {
            return Err(BootstrapError::Sftp(format!(
                "chmod {} exited with {}",
                remote, status
            )));
        }
        Ok(())
    }

    /// Copy the tree under `local` to `remote`.
    pub async fn sync_dir(&self, local: &Path, remote: &str) -> Result<(), BootstrapError> {
        let sftp = self.sftp().await?;
        create_dir_all(&sftp, remote).await?;

        for entry in walkdir::WalkDir::new(local).min_depth(1) {
            let entry = entry.map_err(|e| BootstrapError::Sftp(e.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(local)
                .map_err(|e| BootstrapError::Sftp(e.to_string()))?;
            let target = format!("{}/{}", remote.trim_end_matches('/'), relative.to_string_lossy());

            if entry.file_type().is_dir() {
                create_dir_all(&sftp, &target).await?;
            } else if entry.file_type().is_file() {
                upload_file(&sftp, entry.path(), &target).await?;
            }
        }

        Ok(())
    }

    /// Ask the guest to listen on an ephemeral loopback port and forward
    /// connections back over this session. Returns the port.
    pub async fn forward_remote(&self) -> Result<u32, BootstrapError> {
        tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(BootstrapError::SessionClosed),
            port = async {
                let mut handle = self.handle.lock().await;
                handle.tcpip_forward("127.0.0.1", 0).await
            } => Ok(port?),
        }
    }

    /// Start a login shell, feed it `script` and wait for it to exit.
    pub async fn shell(&self, script: &str, task_id: &TaskId) -> Result<(), BootstrapError> {
        let mut channel = self.open_channel().await?;
        channel.request_shell(true).await?;
        channel.data(script.as_bytes()).await?;
        channel.eof().await?;

        let mut output = LineLogger::new(task_id.as_str());
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } | ChannelMsg::ExtendedData { ref data, .. } => {
                    output.push(data)
                }
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }
        output.flush();

        match exit_status {
            Some(0) => Ok(()),
            Some(status) => Err(BootstrapError::AgentExited(status)),
            None => Err(BootstrapError::SessionClosed),
        }
    }

    pub async fn close(&self) {
        self.closer().close().await;
    }
}

async fn create_dir_all(sftp: &SftpSession, path: &str) -> Result<(), BootstrapError> {
    let mut current = String::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        current.push('/');
        current.push_str(component);

        let exists = sftp
            .try_exists(current.clone())
            .await
            .map_err(|e| BootstrapError::Sftp(e.to_string()))?;
        if !exists {
            sftp.create_dir(current.clone())
                .await
                .map_err(|e| BootstrapError::Sftp(format!("mkdir {}: {}", current, e)))?;
        }
    }
    Ok(())
}

async fn upload_file(sftp: &SftpSession, local: &Path, remote: &str) -> Result<(), BootstrapError> {
    let mut source = tokio::fs::File::open(local).await?;
    let mut destination = sftp
        .create(remote.to_string())
        .await
        .map_err(|e| BootstrapError::Sftp(format!("create {}: {}", remote, e)))?;

    tokio::io::copy(&mut source, &mut destination).await?;
    destination.shutdown().await?;
    Ok(())
}

/// Re-assembles remote output into lines for the log.
struct LineLogger<'a> {
    source: &'a str,
    buffer: String,
}

impl<'a> LineLogger<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            buffer: String::new(),
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(data));
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            tracing::debug!(source = self.source, "{}", line.trim_end());
        }
    }

    fn flush(&mut self) {
        if !self.buffer.is_empty() {
            tracing::debug!(source = self.source, "{}", self.buffer.trim_end());
            self.buffer.clear();
        }
    }
}
