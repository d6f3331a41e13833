use std::collections::HashMap;
use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::resources::Resources;
use crate::upstream::TaskId;

/// A task as assigned by one upstream. Task IDs are only unique within the
/// upstream that issued them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub upstream: String,
    pub id: TaskId,
}

impl TaskKey {
    pub fn new(upstream: impl Into<String>, id: TaskId) -> Self {
        Self {
            upstream: upstream.into(),
            id,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.upstream, self.id)
    }
}

#[derive(Debug)]
struct RunningTask {
    token: CancellationToken,
    resources: Resources,
}

/// Tasks currently executing on this worker.
///
/// A task enters on start and leaves only when its execution signals
/// completion. A stop instruction cancels it but keeps it registered until
/// then, so the control plane keeps seeing it as running while it winds
/// down. Each upstream only sees and stops the tasks it assigned.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskKey, RunningTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Returns `false` if it is already running.
    pub fn start(&mut self, key: TaskKey, token: CancellationToken, resources: Resources) -> bool {
        if self.tasks.contains_key(&key) {
            return false;
        }
        self.tasks.insert(key, RunningTask { token, resources });
        true
    }

    /// Cancel a task. Returns `false` if the upstream has no such task.
    pub fn stop(&mut self, key: &TaskKey) -> bool {
        match self.tasks.get(key) {
            Some(task) => {
                task.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove a task whose execution finished.
    pub fn complete(&mut self, key: &TaskKey) -> bool {
        self.tasks.remove(key).is_some()
    }

    #[cfg(test)]
    fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    /// IDs of tasks `upstream` assigned, in a stable order.
    pub fn ids(&self, upstream: &str) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .tasks
            .keys()
            .filter(|key| key.upstream == upstream)
            .map(|key| key.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every running task, in a stable order.
    pub fn keys(&self) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self.tasks.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Sum of resources held by running tasks of every upstream.
    pub fn resources_in_use(&self) -> Resources {
        let mut in_use = Resources::new();
        for task in self.tasks.values() {
            in_use.add(&task.resources);
        }
        in_use
    }

    pub fn cancel_all(&self) {
        for task in self.tasks.values() {
            task.token.cancel();
        }
    }
}
