//! Conversions between wire messages and domain types.

use std::collections::HashSet;

use crate::isolation::{
    ContainerSpec, IsolationSpec, ParallelsSpec, Platform, TartSpec, VetuNetworking, VetuSpec,
    Volume,
};
use crate::proto;
use crate::proto::isolation::vetu::Networking;
use crate::proto::isolation::Type;
use crate::resources::Resources;
use crate::upstream::{Task, TaskId};

/// A task the control plane sent in a form this worker cannot run.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidTask {
    pub id: Option<TaskId>,
    pub reason: String,
}

impl std::fmt::Display for InvalidTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "invalid task {}: {}", id, self.reason),
            None => write!(f, "invalid task: {}", self.reason),
        }
    }
}

impl std::error::Error for InvalidTask {}

pub fn task_from_proto(task: proto::StartingTask) -> Result<Task, InvalidTask> {
    let id = TaskId::from_wire(task.old_task_id, task.task_id).ok_or_else(|| InvalidTask {
        id: None,
        reason: "task has no identifier".to_string(),
    })?;

    let isolation = match task.isolation {
        Some(isolation) => isolation_from_proto(isolation).map_err(|reason| InvalidTask {
            id: Some(id.clone()),
            reason,
        })?,
        None => IsolationSpec::None,
    };

    Ok(Task {
        id,
        client_secret: task.client_secret,
        server_secret: task.server_secret,
        resources: Resources::from(task.resources_to_use),
        isolation,
    })
}

pub fn isolation_from_proto(isolation: proto::Isolation) -> Result<IsolationSpec, String> {
    let spec = match isolation.r#type {
        None | Some(Type::None(_)) => IsolationSpec::None,
        Some(Type::Container(container)) => IsolationSpec::Container(ContainerSpec {
            image: container.image,
            cpu: container.cpu,
            memory: container.memory,
            volumes: volumes_from_proto(container.volumes),
        }),
        Some(Type::Parallels(parallels)) => {
            let platform = Platform::parse(&parallels.platform)
                .ok_or_else(|| format!("unsupported Parallels platform {:?}", parallels.platform))?;
            IsolationSpec::Parallels(ParallelsSpec {
                image: parallels.image,
                user: parallels.user,
                password: parallels.password,
                platform,
            })
        }
        Some(Type::Tart(tart)) => IsolationSpec::Tart(TartSpec {
            image: tart.image,
            user: tart.user,
            password: tart.password,
            port: port_from_proto(tart.port)?,
            cpu: tart.cpu,
            memory: tart.memory,
            softnet: tart.softnet,
            volumes: volumes_from_proto(tart.volumes),
            display: tart.display,
            disk_size: tart.disk_size,
        }),
        Some(Type::Vetu(vetu)) => IsolationSpec::Vetu(VetuSpec {
            image: vetu.image,
            user: vetu.user,
            password: vetu.password,
            port: port_from_proto(vetu.port)?,
            cpu: vetu.cpu,
            memory: vetu.memory,
            networking: match vetu.networking {
                None => VetuNetworking::Default,
                Some(Networking::Bridged(bridged)) => VetuNetworking::Bridged {
                    interface: bridged.interface,
                },
                Some(Networking::Host(_)) => VetuNetworking::Host,
            },
            disk_size: vetu.disk_size,
        }),
    };
    Ok(spec)
}

fn port_from_proto(port: u32) -> Result<u16, String> {
    u16::try_from(port).map_err(|_| format!("SSH port {} is out of range", port))
}

fn volumes_from_proto(volumes: Vec<proto::Volume>) -> Vec<Volume> {
    volumes
        .into_iter()
        .map(|volume| Volume {
            source: volume.source,
            target: volume.target,
            read_only: volume.read_only,
        })
        .collect()
}

pub fn identification(id: &TaskId, secret: &str) -> proto::TaskIdentification {
    proto::TaskIdentification {
        old_task_id: id.legacy().unwrap_or_default(),
        task_id: id.to_string(),
        secret: secret.to_string(),
    }
}

/// Encode running task IDs in both the legacy and current form.
pub fn running_tasks_to_proto(running: &[TaskId]) -> (Vec<i64>, Vec<String>) {
    let legacy = running.iter().filter_map(TaskId::legacy).collect();
    let current = running.iter().map(TaskId::to_string).collect();
    (legacy, current)
}

/// Merge task IDs sent in either form, without duplicates.
pub fn task_ids_from_proto(legacy: Vec<i64>, current: Vec<String>) -> Vec<TaskId> {
    let mut seen = HashSet::new();
    current
        .into_iter()
        .filter(|id| !id.is_empty())
        .map(TaskId::from)
        .chain(
            legacy
                .into_iter()
                .filter(|id| *id != 0)
                .map(|id| TaskId::from(id.to_string())),
        )
        .filter(|id| seen.insert(id.clone()))
        .collect()
}
