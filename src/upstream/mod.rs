//! Client for one control-plane endpoint.
//!
//! Each call carries its credentials as gRPC metadata: the registration
//! token until [`Upstream::register`] succeeds, then the session token plus
//! the worker name. An `UNAUTHENTICATED` reply drops the session so the next
//! loop iteration registers again.

mod convert;
mod task;

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request};

use crate::config::{TlsConfig, UpstreamConfig};
use crate::proto;
use crate::proto::persistent_worker_client::PersistentWorkerClient;
use crate::resources::Resources;
use crate::tls::{client_tls_config, TlsError};

pub use convert::{
    identification, isolation_from_proto, running_tasks_to_proto, task_from_proto,
    task_ids_from_proto, InvalidTask,
};
pub use task::{Task, TaskId};

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC error: {0}")]
    Status(#[from] tonic::Status),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Invalid credential metadata: {0}")]
    InvalidMetadata(String),
}

/// Identity and capacity reported to the control plane.
#[derive(Debug, Clone, Default)]
pub struct WorkerInfo {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub resources_total: Resources,
    pub version: String,
    pub hostname: String,
    pub os: String,
    pub architecture: String,
}

impl WorkerInfo {
    /// Info for this host, with the crate version.
    pub fn for_host(
        name: impl Into<String>,
        labels: HashMap<String, String>,
        resources_total: Resources,
    ) -> Self {
        Self {
            name: name.into(),
            labels,
            resources_total,
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }

    fn to_proto(&self) -> proto::WorkerInfo {
        proto::WorkerInfo {
            name: self.name.clone(),
            labels: self.labels.clone(),
            resources_total: self.resources_total.clone().into_map(),
            version: self.version.clone(),
            hostname: self.hostname.clone(),
            os: self.os.clone(),
            architecture: self.architecture.clone(),
        }
    }
}

/// Result of one poll.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub tasks_to_start: Vec<Result<Task, InvalidTask>>,
    pub tasks_to_stop: Vec<TaskId>,
    /// Interval the control plane asked for, if any
    pub poll_interval: Option<Duration>,
    pub shutdown: bool,
}

pub struct Upstream {
    name: String,
    client: PersistentWorkerClient<Channel>,
    registration_token: String,
    worker_info: WorkerInfo,
    session_token: RwLock<Option<String>>,
    agent_endpoint: String,
    container_endpoint: String,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("name", &self.name)
            .field("agent_endpoint", &self.agent_endpoint)
            .finish_non_exhaustive()
    }
}

impl Upstream {
    /// Create a client for `config`. The channel connects lazily, so an
    /// unreachable control plane only surfaces on the first call.
    pub async fn new(
        config: &UpstreamConfig,
        worker_info: WorkerInfo,
        tls: &TlsConfig,
    ) -> Result<Self, UpstreamError> {
        let mut endpoint = Endpoint::from_shared(config.url.clone())?
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60));

        if !config.insecure {
            endpoint = endpoint.tls_config(client_tls_config(tls).await?)?;
        }

        let agent_endpoint = if config.agent_endpoint.is_empty() {
            config.url.clone()
        } else {
            config.agent_endpoint.clone()
        };
        let container_endpoint = if config.container_endpoint.is_empty() {
            agent_endpoint.clone()
        } else {
            config.container_endpoint.clone()
        };

        Ok(Self {
            name: config.name.clone(),
            client: PersistentWorkerClient::new(endpoint.connect_lazy()),
            registration_token: config.token.clone(),
            worker_info,
            session_token: RwLock::new(None),
            agent_endpoint,
            container_endpoint,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint agents on the host and in VMs report to.
    pub fn agent_endpoint(&self) -> &str {
        &self.agent_endpoint
    }

    /// Endpoint agents inside containers report to.
    pub fn container_endpoint(&self) -> &str {
        &self.container_endpoint
    }

    pub fn is_registered(&self) -> bool {
        self.session().is_some()
    }

    fn session(&self) -> Option<String> {
        self.session_token
            .read()
            .map(|token| token.clone())
            .unwrap_or_default()
    }

    fn set_session(&self, token: Option<String>) {
        if let Ok(mut session) = self.session_token.write() {
            *session = token;
        }
    }

    fn authenticated<T>(&self, message: T) -> Result<Request<T>, UpstreamError> {
        let mut request = Request::new(message);
        let metadata = request.metadata_mut();

        match self.session() {
            Some(session) => {
                metadata.insert("session-token", ascii(&session)?);
                metadata.insert("worker-name", ascii(&self.worker_info.name)?);
            }
            None => {
                metadata.insert("registration-token", ascii(&self.registration_token)?);
            }
        }

        Ok(request)
    }

    /// Drop the session on authentication failures so the next iteration
    /// registers again.
    fn check<T>(&self, result: Result<T, tonic::Status>) -> Result<T, UpstreamError> {
        result.map_err(|status| {
            if status.code() == Code::Unauthenticated {
                tracing::warn!(upstream = %self.name, "Session rejected, will register again");
                self.set_session(None);
            }
            UpstreamError::Status(status)
        })
    }

    /// Register this worker. No-op once a session is held.
    pub async fn register(&self) -> Result<(), UpstreamError> {
        if self.is_registered() {
            return Ok(());
        }

        let request = self.authenticated(proto::RegisterRequest {
            worker_info: Some(self.worker_info.to_proto()),
            registration_token: self.registration_token.clone(),
        })?;
        let response = self.check(self.client.clone().register(request).await)?;

        self.set_session(Some(response.into_inner().session_token));
        tracing::info!(upstream = %self.name, worker = %self.worker_info.name, "Registered worker");
        Ok(())
    }

    pub async fn poll(
        &self,
        resources_in_use: &Resources,
        running: &[TaskId],
    ) -> Result<PollOutcome, UpstreamError> {
        let (old_running_tasks, running_tasks) = running_tasks_to_proto(running);
        let request = self.authenticated(proto::PollRequest {
            worker_info: Some(self.worker_info.to_proto()),
            resources_in_use: resources_in_use.clone().into_map(),
            old_running_tasks,
            running_tasks,
        })?;
        let response = self.check(self.client.clone().poll(request).await)?.into_inner();

        Ok(PollOutcome {
            tasks_to_start: response
                .tasks_to_start
                .into_iter()
                .map(task_from_proto)
                .collect(),
            tasks_to_stop: task_ids_from_proto(response.old_tasks_to_stop, response.tasks_to_stop),
            poll_interval: (response.poll_interval_in_seconds > 0)
                .then(|| Duration::from_secs(u64::from(response.poll_interval_in_seconds))),
            shutdown: response.shutdown,
        })
    }

    pub async fn task_started(&self, id: &TaskId, secret: &str) -> Result<(), UpstreamError> {
        let request = self.authenticated(identification(id, secret))?;
        self.check(self.client.clone().task_started(request).await)?;
        Ok(())
    }

    pub async fn task_stopped(&self, id: &TaskId, secret: &str) -> Result<(), UpstreamError> {
        let request = self.authenticated(identification(id, secret))?;
        self.check(self.client.clone().task_stopped(request).await)?;
        Ok(())
    }

    pub async fn task_failed(
        &self,
        id: &TaskId,
        secret: &str,
        message: &str,
    ) -> Result<(), UpstreamError> {
        let request = self.authenticated(proto::TaskFailedRequest {
            task_identification: Some(identification(id, secret)),
            message: message.to_string(),
        })?;
        self.check(self.client.clone().task_failed(request).await)?;
        Ok(())
    }

    /// Set the disabled flag. Returns the flag the control plane recorded.
    pub async fn update_status(&self, disabled: bool) -> Result<bool, UpstreamError> {
        let request = self.authenticated(proto::UpdateStatusRequest { disabled })?;
        let response = self.check(self.client.clone().update_status(request).await)?;
        Ok(response.into_inner().disabled)
    }

    /// Tasks the control plane believes are running on this worker.
    pub async fn query_running_tasks(&self) -> Result<Vec<TaskId>, UpstreamError> {
        let request = self.authenticated(proto::QueryRunningTasksRequest {})?;
        let response = self
            .check(self.client.clone().query_running_tasks(request).await)?
            .into_inner();
        Ok(task_ids_from_proto(
            response.old_running_tasks,
            response.running_tasks,
        ))
    }
}

fn ascii(value: &str) -> Result<MetadataValue<tonic::metadata::Ascii>, UpstreamError> {
    value
        .parse()
        .map_err(|_| UpstreamError::InvalidMetadata("value is not printable ASCII".to_string()))
}
