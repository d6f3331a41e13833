//! Pre-warmed VM held in reserve for the next task.
//!
//! Booting a VM dominates task start latency. When a standby isolation is
//! configured and there is headroom for its reservation, the worker clones
//! and boots one VM ahead of time. An incoming task whose isolation is
//! structurally equal, and whose image resolves to the same fully-qualified
//! name, takes over that VM and skips straight to bootstrapping the agent.
//!
//! One lock guards the slot; the warm-up itself runs in its own task and
//! publishes the booted instance only once it is complete. Releasing a slot
//! waits for its warm-up task, so no VM outlives the slot that created it.

use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentCache;
use crate::isolation::{
    Instance, IsolationError, IsolationSpec, RunConfig, StandbyCapableInstance, VmInstance,
};
use crate::resources::Resources;
use crate::security::Security;
use crate::upstream::TaskId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandbyConfig {
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub isolation: IsolationSpec,
    /// Resources held while the standby VM exists
    pub resources: Resources,
}

/// Builds standby-capable instances from the configured isolation.
pub type InstanceFactory =
    Arc<dyn Fn(&IsolationSpec) -> Result<VmInstance, IsolationError> + Send + Sync>;

struct Warmed {
    fqn: String,
    instance: VmInstance,
}

struct Slot {
    id: Uuid,
    token: CancellationToken,
    ready: Arc<StdMutex<Option<Warmed>>>,
    warm_up: JoinHandle<()>,
}

impl Slot {
    /// Cancel the warm-up, close whatever instance it produced, and wait
    /// for the warm-up task to finish.
    async fn release(self) {
        self.token.cancel();
        if let Some(warmed) = self.take_ready() {
            tracing::info!(vm = %warmed.instance.name(), "Closing standby instance");
            if let Err(e) = warmed.instance.close().await {
                tracing::warn!(error = %e, "Failed to close standby instance");
            }
        }
        if let Err(e) = self.warm_up.await {
            tracing::warn!(error = %e, "Standby warm-up task failed");
        }
    }

    fn ready_fqn(&self) -> Option<String> {
        self.ready
            .lock()
            .ok()
            .and_then(|ready| ready.as_ref().map(|warmed| warmed.fqn.clone()))
    }

    fn isolation_matches(&self, isolation: &IsolationSpec) -> bool {
        self.ready.lock().ok().is_some_and(|ready| {
            ready
                .as_ref()
                .is_some_and(|warmed| warmed.instance.isolation() == isolation)
        })
    }

    fn take_ready(&self) -> Option<Warmed> {
        self.ready.lock().ok().and_then(|mut ready| ready.take())
    }
}

pub struct Standby {
    config: Option<StandbyConfig>,
    factory: InstanceFactory,
    agent: Arc<AgentCache>,
    slot: Arc<Mutex<Option<Slot>>>,
}

impl std::fmt::Debug for Standby {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Standby")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Standby {
    /// Standby manager building instances through the security policy.
    pub fn new(
        config: Option<StandbyConfig>,
        security: Arc<Security>,
        agent: Arc<AgentCache>,
    ) -> Self {
        let factory: InstanceFactory = Arc::new(
            move |spec: &IsolationSpec| -> Result<VmInstance, IsolationError> {
                Instance::new(spec, &security)?
                    .into_standby()
                    .map_err(|instance| {
                        IsolationError::backend(
                            "standby",
                            format!("{} isolation cannot be pre-warmed", instance.family()),
                        )
                    })
            },
        );
        Self::with_factory(config, factory, agent)
    }

    pub fn with_factory(
        config: Option<StandbyConfig>,
        factory: InstanceFactory,
        agent: Arc<AgentCache>,
    ) -> Self {
        Self {
            config,
            factory,
            agent,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    /// Resources held by the slot, empty when there is none.
    pub async fn reservation(&self) -> Resources {
        match (&self.config, self.slot.lock().await.as_ref()) {
            (Some(config), Some(_)) => config.resources.clone(),
            _ => Resources::new(),
        }
    }

    pub async fn has_slot(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Whether a booted instance is waiting for a task.
    pub async fn is_ready(&self) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .and_then(Slot::ready_fqn)
            .is_some()
    }

    /// Start warming up a standby instance unless one already exists or
    /// `free` cannot hold the reservation. Returns whether a warm-up began.
    pub async fn try_start(&self, worker_token: &CancellationToken, free: &Resources) -> bool {
        let Some(config) = &self.config else {
            return false;
        };

        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            return false;
        }
        if !free.can_fit(&config.resources) {
            tracing::debug!(reservation = ?config.resources, "Not enough free resources for standby");
            return false;
        }

        let instance = match (self.factory)(&config.isolation) {
            Ok(instance) => instance,
            Err(e) => {
                tracing::warn!(isolation = %config.isolation, error = %e, "Cannot create standby instance");
                return false;
            }
        };

        let id = Uuid::new_v4();
        let token = worker_token.child_token();
        let ready = Arc::new(StdMutex::new(None));

        tracing::info!(isolation = %config.isolation, "Warming up standby instance");
        let run_config = RunConfig::new(TaskId::from("standby"), self.agent.clone());
        let warm_up = tokio::spawn(warm_up(
            self.slot.clone(),
            id,
            token.clone(),
            ready.clone(),
            instance,
            run_config,
        ));

        // Stored under the lock the warm-up task needs to clear a failed slot
        *slot = Some(Slot {
            id,
            token,
            ready,
            warm_up,
        });

        true
    }

    /// Hand over the standby instance if it matches `incoming`, otherwise
    /// return `incoming` unchanged.
    ///
    /// A mismatch discards the standby so the next [`Standby::try_start`]
    /// warms up one for the current workload.
    pub async fn find(&self, token: &CancellationToken, incoming: Instance) -> Instance {
        let mut incoming = match incoming.into_standby() {
            Ok(instance) => instance,
            Err(instance) => return instance,
        };

        let mut slot = self.slot.lock().await;
        let Some(standby_fqn) = slot.as_ref().and_then(Slot::ready_fqn) else {
            return Instance::Vm(incoming);
        };

        incoming.pull(token).await;
        let incoming_fqn = match incoming.fqn(token).await {
            Ok(fqn) => fqn,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot resolve image of incoming task, keeping standby");
                return Instance::Vm(incoming);
            }
        };

        let Some(taken) = slot.take() else {
            return Instance::Vm(incoming);
        };
        drop(slot);

        if standby_fqn == incoming_fqn && taken.isolation_matches(incoming.isolation()) {
            if let Some(warmed) = taken.take_ready() {
                tracing::info!(fqn = %incoming_fqn, vm = %warmed.instance.name(), "Using standby instance");
                return Instance::Vm(warmed.instance);
            }
        }

        tracing::info!(
            standby_fqn = %standby_fqn,
            incoming_fqn = %incoming_fqn,
            "Standby instance does not match task, discarding it"
        );
        taken.release().await;

        Instance::Vm(incoming)
    }

    /// Release the slot and its instance, waiting for an in-flight warm-up
    /// to tear down what it created.
    pub async fn shutdown(&self) {
        let Some(slot) = self.slot.lock().await.take() else {
            return;
        };
        slot.release().await;
    }
}

async fn warm_up(
    slot: Arc<Mutex<Option<Slot>>>,
    id: Uuid,
    token: CancellationToken,
    ready: Arc<StdMutex<Option<Warmed>>>,
    mut instance: VmInstance,
    config: RunConfig,
) {
    instance.pull(&token).await;

    let result = async {
        instance.clone_configure_start(&token, &config).await?;
        instance.fqn(&token).await
    }
    .await;

    let (instance, reason) = match result {
        Ok(fqn) => match publish(&ready, &token, Warmed { fqn, instance }) {
            None => return,
            Some(rejected) => (rejected.instance, "standby slot was released".to_string()),
        },
        Err(e) => (instance, e.to_string()),
    };

    tracing::warn!(reason = %reason, "Standby warm-up did not complete");
    if let Err(e) = instance.close().await {
        tracing::warn!(error = %e, "Failed to close standby instance");
    }

    let mut slot = slot.lock().await;
    if slot.as_ref().map(|slot| slot.id) == Some(id) {
        *slot = None;
    }
}

/// Publish a booted instance, handing it back if the slot was released
/// in the meantime.
fn publish(
    ready: &StdMutex<Option<Warmed>>,
    token: &CancellationToken,
    warmed: Warmed,
) -> Option<Warmed> {
    let Ok(mut ready) = ready.lock() else {
        return Some(warmed);
    };
    if token.is_cancelled() {
        return Some(warmed);
    }
    tracing::info!(fqn = %warmed.fqn, vm = %warmed.instance.name(), "Standby instance is ready");
    *ready = Some(warmed);
    None
}
