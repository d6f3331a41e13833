use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::session::{ForwardTarget, SshSession};
use super::BootstrapError;

/// Delay between connection attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// One attempt at establishing an authenticated SSH session.
#[async_trait]
pub trait SshDialer: Send + Sync {
    type Session: Send;

    async fn dial(&self) -> Result<Self::Session, BootstrapError>;
}

/// Dial until a session is established or `token` is cancelled.
///
/// A freshly booted VM typically refuses connections for a while, so
/// failures are only logged. There is no attempt limit.
pub async fn wait_for_ssh<D>(
    token: &CancellationToken,
    dialer: &D,
) -> Result<D::Session, BootstrapError>
where
    D: SshDialer + ?Sized,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        tokio::select! {
            result = dialer.dial() => match result {
                Ok(session) => {
                    tracing::debug!(attempt, "SSH connection established");
                    return Ok(session);
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "SSH connection attempt failed");
                }
            },
            _ = token.cancelled() => return Err(BootstrapError::Cancelled),
        }

        tokio::select! {
            _ = tokio::time::sleep(RETRY_DELAY) => {}
            _ = token.cancelled() => return Err(BootstrapError::Cancelled),
        }
    }
}

/// Dials a guest over TCP with password authentication.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    host: String,
    port: u16,
    user: String,
    password: String,
    forward: Option<ForwardTarget>,
}

impl TcpDialer {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            forward: None,
        }
    }

    /// Relay connections the guest opens through a remote forward to `target`.
    pub fn with_forward(mut self, target: Option<ForwardTarget>) -> Self {
        self.forward = target;
        self
    }
}

#[async_trait]
impl SshDialer for TcpDialer {
    type Session = SshSession;

    async fn dial(&self) -> Result<SshSession, BootstrapError> {
        let connect = SshSession::connect(
            &self.host,
            self.port,
            &self.user,
            &self.password,
            self.forward.clone(),
        );

        match tokio::time::timeout(ATTEMPT_TIMEOUT, connect).await {
            Ok(result) => result,
            Err(_) => Err(BootstrapError::Timeout(format!(
                "{}:{}",
                self.host, self.port
            ))),
        }
    }
}
