use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentCache;
use crate::isolation::{Instance, IsolationError, RunConfig};
use crate::resources::ResourceModifierManager;
use crate::security::Security;
use crate::standby::Standby;
use crate::upstream::{Task, Upstream};
use crate::worker::TaskKey;

/// Everything a task execution needs from the worker.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub upstream: Arc<Upstream>,
    pub security: Arc<Security>,
    pub standby: Arc<Standby>,
    pub modifiers: Arc<ResourceModifierManager>,
    pub agent: Arc<AgentCache>,
    pub completions: UnboundedSender<TaskKey>,
}

/// Reports completion when dropped, so the task is de-registered however
/// its execution ends.
struct CompletionGuard {
    key: TaskKey,
    completions: UnboundedSender<TaskKey>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.completions.send(self.key.clone()).is_err() {
            tracing::debug!(task = %self.key, "Worker no longer listening for completions");
        }
    }
}

/// Execute one task: report start, run it isolated, report the outcome.
pub(crate) async fn execute(ctx: TaskContext, key: TaskKey, task: Task, token: CancellationToken) {
    let _completion = CompletionGuard {
        key,
        completions: ctx.completions.clone(),
    };
    let upstream = ctx.upstream.name().to_string();

    if let Err(e) = ctx.upstream.task_started(&task.id, &task.client_secret).await {
        tracing::warn!(task_id = %task.id, upstream = %upstream, error = %e, "Failed to report task start");
    }
    tracing::info!(task_id = %task.id, isolation = %task.isolation, "Task started");

    match run(&ctx, &task, &token).await {
        Ok(()) => {
            tracing::info!(task_id = %task.id, "Task finished");
        }
        Err(IsolationError::Cancelled) => {
            tracing::info!(task_id = %task.id, "Task cancelled");
        }
        Err(e) => {
            tracing::error!(task_id = %task.id, error = %e, "Task failed");
            if let Err(report) = ctx
                .upstream
                .task_failed(&task.id, &task.client_secret, &e.to_string())
                .await
            {
                tracing::warn!(task_id = %task.id, upstream = %upstream, error = %report, "Failed to report task failure");
            }
        }
    }

    if let Err(e) = ctx.upstream.task_stopped(&task.id, &task.client_secret).await {
        tracing::warn!(task_id = %task.id, upstream = %upstream, error = %e, "Failed to report task stop");
    }
}

async fn run(
    ctx: &TaskContext,
    task: &Task,
    token: &CancellationToken,
) -> Result<(), IsolationError> {
    let instance = Instance::new(&task.isolation, &ctx.security)?;
    let mut instance = ctx.standby.find(token, instance).await;

    let lease = ctx.modifiers.acquire(&task.resources);

    let mut config = RunConfig::new(task.id.clone(), ctx.agent.clone());
    config.server_secret = task.server_secret.clone();
    config.client_secret = task.client_secret.clone();
    config.direct_endpoint = ctx.upstream.agent_endpoint().to_string();
    config.container_endpoint = ctx.upstream.container_endpoint().to_string();
    if let Some(lease) = &lease {
        config.extra_args = lease.append_args().to_vec();
    }

    let result = instance.run(token, &config).await;

    if let Err(e) = instance.close().await {
        tracing::warn!(task_id = %task.id, error = %e, "Failed to clean up isolation");
    }
    drop(lease);

    result
}
