//! The `Task` record and its state machine (§3).

use std::convert::TryFrom;
use std::fmt;

/// Bound on a task name's printable length, matching the wire codec's
/// cstring slot (`MAX_TASK_NAME_LEN - 1` printable bytes).
pub const MAX_TASK_NAME_LEN: usize = crate::codec::MAX_TASK_NAME_LEN - 1;

/// A task's lifecycle state. The numeric values match the `state` column
/// of the `demo_task` table (§6) and the original C enum, so storing and
/// loading a task never needs a translation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum TaskState {
    Created = 0,
    Running = 1,
    Killed = 2,
    Success = 3,
}

impl TryFrom<i64> for TaskState {
    type Error = InvalidTaskState;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskState::Created),
            1 => Ok(TaskState::Running),
            2 => Ok(TaskState::Killed),
            3 => Ok(TaskState::Success),
            other => Err(InvalidTaskState(other)),
        }
    }
}

/// A `state` column value outside the range `demo_task` is defined for.
#[derive(Debug)]
pub struct InvalidTaskState(pub i64);

impl fmt::Display for InvalidTaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state {}", self.0)
    }
}

impl std::error::Error for InvalidTaskState {}

/// A task record, mirrored in memory from the authoritative copy in the
/// store (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub task_name: String,
    pub sleep_time: u32,
    pub state: TaskState,
    pub worker: String,
    pub assign_time: u64,
    pub complete_time: u64,
}

impl Task {
    /// A freshly loaded, never-assigned task, as it first appears in
    /// `demo_task` before any Controller has touched it.
    pub fn created(task_name: impl Into<String>, sleep_time: u32) -> Task {
        Task {
            task_name: task_name.into(),
            sleep_time,
            state: TaskState::Created,
            worker: String::new(),
            assign_time: 0,
            complete_time: 0,
        }
    }

    /// Whether this task is eligible to be handed out by the dispatch scan
    /// (§4.3): either fresh or reclaimed from a dead worker.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self.state, TaskState::Created | TaskState::Killed)
    }

    /// Whether this task is in flight and therefore subject to the
    /// liveness sweep's delinquency check.
    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }

    /// Invariant (3): a `Running` task is stale once its worker has
    /// exceeded its declared sleep time by more than the grace period.
    pub fn is_delinquent(&self, now: u64, grace_secs: u64) -> bool {
        self.is_running()
            && now.saturating_sub(self.assign_time) > u64::from(self.sleep_time) + grace_secs
    }
}
