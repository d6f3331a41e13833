use std::fmt;

use crate::isolation::IsolationSpec;
use crate::resources::Resources;

/// Identifier of a task assigned by the control plane.
///
/// Control planes send either a legacy numeric ID or an opaque string. The
/// worker only deals in strings; the numeric form exists on the wire alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Decode a wire identifier, preferring the string form.
    pub fn from_wire(legacy: i64, id: String) -> Option<Self> {
        if !id.is_empty() {
            Some(Self(id))
        } else if legacy != 0 {
            Some(Self(legacy.to_string()))
        } else {
            None
        }
    }

    /// Numeric form for control planes that only understand it.
    pub fn legacy(&self) -> Option<i64> {
        self.0.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A task the control plane asked this worker to start.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub client_secret: String,
    pub server_secret: String,
    pub resources: Resources,
    pub isolation: IsolationSpec,
}
