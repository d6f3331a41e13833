//! The worker control loop.
//!
//! A [`Worker`] polls every configured upstream, starts and stops tasks as
//! instructed, keeps the standby slot populated and reports resource usage.
//!
//! # Loop
//!
//! 1. Try to pre-warm a standby instance
//! 2. For each upstream: register, fold finished tasks out of the running
//!    set, poll, cancel stopped tasks, spawn started ones
//! 3. Sleep for the shortest poll interval any upstream asked for
//!
//! An upstream's shutdown instruction ends the loop. Cancelling the token
//! passed to [`Worker::run`] does too, and cancels every running task.
//!
//! # Task execution
//!
//! Each task runs in its own tokio task with a token derived from the
//! worker's. Start is reported before the isolation is created, stop after
//! it is torn down, and completion is always signalled back to the loop.

mod registry;
mod task;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentCache, AgentConfig};
use crate::config::{ConfigError, WorkerConfig};
use crate::error::{Result, WorkerError};
use crate::resources::{ResourceModifierConfig, ResourceModifierManager, Resources};
use crate::security::Security;
use crate::standby::{InstanceFactory, Standby, StandbyConfig};
use crate::upstream::{Task, Upstream, WorkerInfo};

pub use registry::{TaskKey, TaskRegistry};
use task::TaskContext;

const PAUSE_WAIT_INTERVAL: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for [`Worker`].
pub struct WorkerBuilder {
    upstreams: Vec<Arc<Upstream>>,
    security: Security,
    resources: Resources,
    standby: Option<StandbyConfig>,
    standby_factory: Option<InstanceFactory>,
    resource_modifiers: Vec<ResourceModifierConfig>,
    agent: AgentConfig,
    poll_interval: Duration,
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self {
            upstreams: Vec::new(),
            security: Security::permissive(),
            resources: Resources::new(),
            standby: None,
            standby_factory: None,
            resource_modifiers: Vec::new(),
            agent: AgentConfig::default(),
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl WorkerBuilder {
    pub fn upstream(mut self, upstream: Upstream) -> Self {
        self.upstreams.push(Arc::new(upstream));
        self
    }

    pub fn security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn standby(mut self, standby: Option<StandbyConfig>) -> Self {
        self.standby = standby;
        self
    }

    /// Build standby instances with `factory` instead of the security
    /// policy and the real hypervisors.
    pub fn standby_factory(mut self, factory: InstanceFactory) -> Self {
        self.standby_factory = Some(factory);
        self
    }

    pub fn resource_modifiers(mut self, modifiers: Vec<ResourceModifierConfig>) -> Self {
        self.resource_modifiers = modifiers;
        self
    }

    pub fn agent(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn build(self) -> Result<Worker> {
        for (i, upstream) in self.upstreams.iter().enumerate() {
            if self.upstreams[..i]
                .iter()
                .any(|other| other.name() == upstream.name())
            {
                return Err(ConfigError::DuplicateUpstream(upstream.name().to_string()).into());
            }
        }

        let security = Arc::new(self.security);
        let agent = Arc::new(AgentCache::new(&self.agent)?);
        let standby = match self.standby_factory {
            Some(factory) => Standby::with_factory(self.standby, factory, agent.clone()),
            None => Standby::new(self.standby, security.clone(), agent.clone()),
        };
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        Ok(Worker {
            upstreams: self.upstreams,
            security,
            modifiers: Arc::new(ResourceModifierManager::new(self.resource_modifiers)),
            standby: Arc::new(standby),
            agent,
            resources: self.resources,
            poll_interval: self.poll_interval,
            registry: Arc::new(Mutex::new(TaskRegistry::new())),
            completions_tx,
            completions_rx: Mutex::new(completions_rx),
        })
    }
}

/// What one upstream's poll asks of the loop.
struct PollStep {
    interval: Option<Duration>,
    shutdown: bool,
}

pub struct Worker {
    upstreams: Vec<Arc<Upstream>>,
    security: Arc<Security>,
    modifiers: Arc<ResourceModifierManager>,
    standby: Arc<Standby>,
    agent: Arc<AgentCache>,
    resources: Resources,
    poll_interval: Duration,
    registry: Arc<Mutex<TaskRegistry>>,
    completions_tx: UnboundedSender<TaskKey>,
    completions_rx: Mutex<UnboundedReceiver<TaskKey>>,
}

impl Worker {
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::default()
    }

    /// Build a worker from a loaded configuration file.
    pub async fn from_config(config: &WorkerConfig) -> Result<Self> {
        let info = WorkerInfo::for_host(
            config.worker_name(),
            config.labels.clone(),
            config.resources.clone(),
        );

        let mut builder = Worker::builder()
            .security(config.security())
            .resources(config.resources.clone())
            .standby(config.standby.clone())
            .resource_modifiers(config.resource_modifiers.clone())
            .agent(config.agent.clone())
            .poll_interval(config.poll_interval());

        for upstream in config.resolved_upstreams()? {
            builder = builder.upstream(Upstream::new(&upstream, info.clone(), &config.tls).await?);
        }

        builder.build()
    }

    /// Tasks currently running on this worker, across all upstreams.
    pub async fn running_tasks(&self) -> Vec<TaskKey> {
        self.registry.lock().await.keys()
    }

    pub fn standby(&self) -> &Standby {
        &self.standby
    }

    /// Run the control loop until an upstream asks for shutdown or `token`
    /// is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        tracing::info!(upstreams = self.upstreams.len(), "Worker started");

        let lifetime = token.child_token();
        let result = self.run_loop(&lifetime).await;

        lifetime.cancel();
        self.standby.shutdown().await;
        self.drain().await;

        tracing::info!("Worker stopped");
        result
    }

    async fn run_loop(&self, lifetime: &CancellationToken) -> Result<()> {
        loop {
            if lifetime.is_cancelled() {
                return Ok(());
            }

            let free = self.free_resources().await;
            self.standby.try_start(lifetime, &free).await;

            let mut interval: Option<Duration> = None;
            for upstream in &self.upstreams {
                match self.poll_upstream(upstream, lifetime).await {
                    Ok(step) => {
                        if step.shutdown {
                            tracing::info!(upstream = %upstream.name(), "Upstream requested shutdown");
                            return Ok(());
                        }
                        let requested = step.interval.unwrap_or(self.poll_interval);
                        interval = Some(interval.map_or(requested, |current| current.min(requested)));
                    }
                    Err(e) => {
                        tracing::warn!(upstream = %upstream.name(), error = %e, "Failed to poll upstream");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval.unwrap_or(self.poll_interval)) => {}
                _ = lifetime.cancelled() => {
                    tracing::info!("Worker shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn poll_upstream(
        &self,
        upstream: &Arc<Upstream>,
        lifetime: &CancellationToken,
    ) -> Result<PollStep> {
        upstream.register().await?;
        self.drain_completions().await;

        let (running, mut in_use) = {
            let registry = self.registry.lock().await;
            (registry.ids(upstream.name()), registry.resources_in_use())
        };
        in_use.add(&self.standby.reservation().await);

        let outcome = upstream.poll(&in_use, &running).await?;

        {
            let mut registry = self.registry.lock().await;
            for id in &outcome.tasks_to_stop {
                if registry.stop(&TaskKey::new(upstream.name(), id.clone())) {
                    tracing::info!(task_id = %id, upstream = %upstream.name(), "Stopping task");
                } else {
                    tracing::warn!(task_id = %id, upstream = %upstream.name(), "Asked to stop unknown task");
                }
            }
        }

        for task in outcome.tasks_to_start {
            match task {
                Ok(task) => self.start_task(upstream, task, lifetime).await,
                Err(invalid) => {
                    tracing::error!(upstream = %upstream.name(), error = %invalid, "Rejected task");
                    if let Some(id) = &invalid.id {
                        if let Err(e) = upstream.task_failed(id, "", &invalid.to_string()).await {
                            tracing::warn!(task_id = %id, error = %e, "Failed to report task failure");
                        }
                    }
                }
            }
        }

        Ok(PollStep {
            interval: outcome.poll_interval,
            shutdown: outcome.shutdown,
        })
    }

    async fn start_task(&self, upstream: &Arc<Upstream>, task: Task, lifetime: &CancellationToken) {
        let token = lifetime.child_token();
        let key = TaskKey::new(upstream.name(), task.id.clone());
        {
            let mut registry = self.registry.lock().await;
            if !registry.start(key.clone(), token.clone(), task.resources.clone()) {
                tracing::debug!(task = %key, "Task is already running");
                return;
            }
        }

        let ctx = TaskContext {
            upstream: upstream.clone(),
            security: self.security.clone(),
            standby: self.standby.clone(),
            modifiers: self.modifiers.clone(),
            agent: self.agent.clone(),
            completions: self.completions_tx.clone(),
        };
        tokio::spawn(task::execute(ctx, key, task, token));
    }

    async fn drain_completions(&self) {
        let mut completions = self.completions_rx.lock().await;
        let mut registry = self.registry.lock().await;
        while let Ok(key) = completions.try_recv() {
            registry.complete(&key);
            tracing::debug!(task = %key, "Task completed");
        }
    }

    /// Wait for cancelled tasks to report completion.
    async fn drain(&self) {
        let wait = async {
            let mut completions = self.completions_rx.lock().await;
            loop {
                {
                    let mut registry = self.registry.lock().await;
                    registry.cancel_all();
                    while let Ok(key) = completions.try_recv() {
                        registry.complete(&key);
                    }
                    if registry.is_empty() {
                        return;
                    }
                }
                match completions.recv().await {
                    Some(key) => {
                        self.registry.lock().await.complete(&key);
                    }
                    None => return,
                }
            }
        };

        if tokio::time::timeout(DRAIN_TIMEOUT, wait).await.is_err() {
            tracing::warn!("Timed out waiting for tasks to finish");
        }
    }

    async fn free_resources(&self) -> Resources {
        let mut free = self.resources.clone();
        free.subtract(&self.registry.lock().await.resources_in_use());
        free.subtract(&self.standby.reservation().await);
        free
    }

    /// Disable this worker on every upstream. With `wait`, return only once
    /// no upstream reports running tasks.
    pub async fn pause(&self, token: &CancellationToken, wait: bool) -> Result<()> {
        for upstream in &self.upstreams {
            upstream.register().await?;
            upstream.update_status(true).await?;
            tracing::info!(upstream = %upstream.name(), "Worker paused");
        }

        if !wait {
            return Ok(());
        }

        for upstream in &self.upstreams {
            loop {
                let running = upstream.query_running_tasks().await?;
                if running.is_empty() {
                    break;
                }
                tracing::info!(upstream = %upstream.name(), running = running.len(), "Waiting for tasks to finish");

                tokio::select! {
                    _ = tokio::time::sleep(PAUSE_WAIT_INTERVAL) => {}
                    _ = token.cancelled() => return Err(WorkerError::Cancelled),
                }
            }
        }

        Ok(())
    }

    /// Re-enable this worker on every upstream.
    pub async fn resume(&self) -> Result<()> {
        for upstream in &self.upstreams {
            upstream.register().await?;
            upstream.update_status(false).await?;
            tracing::info!(upstream = %upstream.name(), "Worker resumed");
        }
        Ok(())
    }
}
