//! Test harness for worker integration tests.
//!
//! Provides an in-process control plane that records every call a worker
//! makes and serves whatever tasks a test queues up.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use persistent_worker::agent::AgentConfig;
use persistent_worker::config::{TlsConfig, UpstreamConfig};
use persistent_worker::proto;
use persistent_worker::proto::isolation::{NoIsolation, Type};
use persistent_worker::proto::persistent_worker_server::{
    PersistentWorker, PersistentWorkerServer,
};
use persistent_worker::resources::Resources;
use persistent_worker::upstream::{Upstream, WorkerInfo};
use persistent_worker::worker::WorkerBuilder;

pub const REGISTRATION_TOKEN: &str = "test-registration-token";
pub const SESSION_TOKEN: &str = "test-session";
pub const WORKER_NAME: &str = "test-worker";

/// Everything the fake control plane has observed, plus what it will
/// answer next.
#[derive(Debug, Default)]
pub struct ControlPlaneState {
    pub registrations: usize,
    pub polls: usize,
    pub pending: VecDeque<proto::StartingTask>,
    pub to_stop: Vec<String>,
    pub shutdown: bool,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub disabled: bool,
    /// Answer to `QueryRunningTasks`
    pub running: Vec<String>,
    /// Running set and resource usage from the most recent poll
    pub last_running: Vec<String>,
    pub last_resources_in_use: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeControlPlane {
    state: Arc<Mutex<ControlPlaneState>>,
}

impl FakeControlPlane {
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ControlPlaneState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn queue_task(&self, task: proto::StartingTask) {
        self.with_state(|state| state.pending.push_back(task));
    }

    pub fn stop_task(&self, id: &str) {
        self.with_state(|state| state.to_stop.push(id.to_string()));
    }

    pub fn started(&self) -> Vec<String> {
        self.with_state(|state| state.started.clone())
    }

    pub fn stopped(&self) -> Vec<String> {
        self.with_state(|state| state.stopped.clone())
    }

    pub fn failed(&self) -> Vec<(String, String)> {
        self.with_state(|state| state.failed.clone())
    }

    fn authorize<T>(&self, request: &Request<T>) -> Result<(), Status> {
        let metadata = request.metadata();
        let session = metadata.get("session-token").and_then(|v| v.to_str().ok());
        let name = metadata.get("worker-name").and_then(|v| v.to_str().ok());
        if session == Some(SESSION_TOKEN) && name == Some(WORKER_NAME) {
            Ok(())
        } else {
            Err(Status::unauthenticated("invalid session"))
        }
    }
}

#[tonic::async_trait]
impl PersistentWorker for FakeControlPlane {
    async fn register(
        &self,
        request: Request<proto::RegisterRequest>,
    ) -> Result<Response<proto::RegisterResponse>, Status> {
        let token = request
            .metadata()
            .get("registration-token")
            .and_then(|v| v.to_str().ok());
        if token != Some(REGISTRATION_TOKEN) {
            return Err(Status::unauthenticated("invalid registration token"));
        }

        self.with_state(|state| state.registrations += 1);
        Ok(Response::new(proto::RegisterResponse {
            session_token: SESSION_TOKEN.to_string(),
        }))
    }

    async fn poll(
        &self,
        request: Request<proto::PollRequest>,
    ) -> Result<Response<proto::PollResponse>, Status> {
        self.authorize(&request)?;
        let request = request.into_inner();

        let response = self.with_state(|state| {
            state.polls += 1;
            state.last_running = request.running_tasks.clone();
            state.last_resources_in_use = request.resources_in_use.clone();
            proto::PollResponse {
                tasks_to_start: state.pending.drain(..).collect(),
                old_tasks_to_stop: Vec::new(),
                tasks_to_stop: std::mem::take(&mut state.to_stop),
                poll_interval_in_seconds: 0,
                shutdown: state.shutdown,
            }
        });
        Ok(Response::new(response))
    }

    async fn task_started(
        &self,
        request: Request<proto::TaskIdentification>,
    ) -> Result<Response<proto::Empty>, Status> {
        self.authorize(&request)?;
        let id = request.into_inner().task_id;
        self.with_state(|state| state.started.push(id));
        Ok(Response::new(proto::Empty {}))
    }

    async fn task_stopped(
        &self,
        request: Request<proto::TaskIdentification>,
    ) -> Result<Response<proto::Empty>, Status> {
        self.authorize(&request)?;
        let id = request.into_inner().task_id;
        self.with_state(|state| state.stopped.push(id));
        Ok(Response::new(proto::Empty {}))
    }

    async fn task_failed(
        &self,
        request: Request<proto::TaskFailedRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        self.authorize(&request)?;
        let request = request.into_inner();
        let id = request
            .task_identification
            .map(|identification| identification.task_id)
            .unwrap_or_default();
        self.with_state(|state| state.failed.push((id, request.message)));
        Ok(Response::new(proto::Empty {}))
    }

    async fn update_status(
        &self,
        request: Request<proto::UpdateStatusRequest>,
    ) -> Result<Response<proto::WorkerStatus>, Status> {
        self.authorize(&request)?;
        let disabled = request.into_inner().disabled;
        self.with_state(|state| state.disabled = disabled);
        Ok(Response::new(proto::WorkerStatus { disabled }))
    }

    async fn query_running_tasks(
        &self,
        request: Request<proto::QueryRunningTasksRequest>,
    ) -> Result<Response<proto::QueryRunningTasksResponse>, Status> {
        self.authorize(&request)?;
        let running = self.with_state(|state| state.running.clone());
        Ok(Response::new(proto::QueryRunningTasksResponse {
            old_running_tasks: Vec::new(),
            running_tasks: running,
        }))
    }
}

/// A fake control plane served on an ephemeral loopback port.
pub struct TestControlPlane {
    pub service: FakeControlPlane,
    /// Upstream name the worker knows this control plane by
    pub name: String,
    pub url: String,
    handle: JoinHandle<()>,
}

impl TestControlPlane {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = FakeControlPlane::default();

        let server = PersistentWorkerServer::new(service.clone());
        let handle = tokio::spawn(async move {
            Server::builder()
                .add_service(server)
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        Self {
            service,
            name: format!("control-plane-{}", addr.port()),
            url: format!("http://{}", addr),
            handle,
        }
    }

    /// Client for this control plane, as the worker would build it.
    pub async fn upstream(&self) -> Upstream {
        let mut config = UpstreamConfig::new(self.name.clone(), self.url.clone());
        config.token = REGISTRATION_TOKEN.to_string();
        config.insecure = true;

        let info = WorkerInfo::for_host(WORKER_NAME, HashMap::new(), Resources::new());
        Upstream::new(&config, info, &TlsConfig::default())
            .await
            .unwrap()
    }

    /// Worker builder polling this control plane quickly, with `agent` as
    /// the agent binary for every platform.
    pub async fn worker(&self, agent: &str) -> WorkerBuilder {
        let agent = AgentConfig {
            binary: Some(agent.into()),
            cache_dir: Some(std::env::temp_dir().join("persistent-worker-tests")),
            ..AgentConfig::default()
        };
        persistent_worker::worker::Worker::builder()
            .upstream(self.upstream().await)
            .agent(agent)
            .resources(Resources::new().with("slots", 2.0))
            .poll_interval(Duration::from_millis(100))
    }
}

impl Drop for TestControlPlane {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A task without isolation.
pub fn none_task(id: &str) -> proto::StartingTask {
    proto::StartingTask {
        old_task_id: 0,
        task_id: id.to_string(),
        client_secret: "client-secret".to_string(),
        server_secret: "server-secret".to_string(),
        resources_to_use: HashMap::from([("slots".to_string(), 1.0)]),
        isolation: Some(proto::Isolation {
            r#type: Some(Type::None(NoIsolation {})),
        }),
    }
}

/// Write an executable shell script into `dir` and return its path.
pub fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().to_string()
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
