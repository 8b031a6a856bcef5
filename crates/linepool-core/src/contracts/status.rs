//! Run status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a node or flow run.
///
/// `Running` is the only non-terminal state. Node runs may be created
/// directly as `Bypassed` without ever entering `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Running,
    Completed,
    Failed,
    Bypassed,
    Canceled,
}

impl Status {
    /// Whether the run can no longer change state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Running)
    }

    /// Whether a record in this state may move to `next`.
    pub fn can_transition_to(self, next: Status) -> bool {
        self == Status::Running && next != Status::Running
    }

    /// Lowercase name used in status summary keys.
    pub fn as_key(self) -> &'static str {
        match self {
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Bypassed => "bypassed",
            Status::Canceled => "canceled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Running => "Running",
            Status::Completed => "Completed",
            Status::Failed => "Failed",
            Status::Bypassed => "Bypassed",
            Status::Canceled => "Canceled",
        };
        f.write_str(name)
    }
}
