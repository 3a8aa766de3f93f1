//! Tasks and their per-task container join.

use std::collections::BTreeSet;
use std::time::Instant;

use serde::Serialize;

use slotgrid_core::{
    AgentId, ContainerId, ContainerState, PortRequest, SlotId, TaskId, TaskSpec, TaskState,
};
use slotgrid_placement::{Constraints, ReservedRange};

/// Fan-in over the containers of one task.
///
/// Counts outcomes as containers terminate. The task succeeds only when
/// every container exited cleanly; the first unclean exit fails it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskJoin {
    pub expected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub stopped: usize,
}

/// What the join concluded after recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Outstanding,
    FirstFailure,
    AllSucceeded,
    AllTerminal,
}

impl TaskJoin {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            ..Self::default()
        }
    }

    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.stopped
    }

    pub fn is_complete(&self) -> bool {
        self.finished() >= self.expected
    }

    /// Record one container's terminal state. Callers record each
    /// container exactly once.
    ///
    /// `stopping` is set while the task is being torn down; a `killed`
    /// container then counts as stopped rather than failed.
    pub fn record(&mut self, state: ContainerState, stopping: bool) -> JoinOutcome {
        let failed = match state {
            ContainerState::ExitedOk => {
                self.succeeded += 1;
                false
            }
            ContainerState::Killed if stopping => {
                self.stopped += 1;
                false
            }
            _ => {
                self.failed += 1;
                true
            }
        };
        let first_failure = failed && self.failed == 1;

        if self.is_complete() {
            if self.succeeded == self.expected {
                JoinOutcome::AllSucceeded
            } else {
                JoinOutcome::AllTerminal
            }
        } else if first_failure {
            JoinOutcome::FirstFailure
        } else {
            JoinOutcome::Outstanding
        }
    }
}

/// A task as held by the provider.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub state: TaskState,
    pub constraints: Constraints,
    /// Validated port requests, in backend order.
    pub port_requests: Vec<(String, PortRequest)>,
    pub containers: Vec<ContainerId>,
    pub join: TaskJoin,
    pub reason: Option<String>,
    pub kill_requested: bool,
    pub kill_deadline: Option<Instant>,
    /// Set once slots and ports are back in their pools.
    pub resources_released: bool,
    pub submitted_seq: u64,
}

impl Task {
    pub fn new(
        id: TaskId,
        spec: TaskSpec,
        port_requests: Vec<(String, PortRequest)>,
        submitted_seq: u64,
    ) -> Self {
        let constraints = Constraints {
            placement: spec.placement,
            required_labels: spec.required_labels.clone(),
        };
        Self {
            id,
            spec,
            state: TaskState::Pending,
            constraints,
            port_requests,
            containers: Vec::new(),
            join: TaskJoin::default(),
            reason: None,
            kill_requested: false,
            kill_deadline: None,
            resources_released: false,
            submitted_seq,
        }
    }

    /// Move to `state`. Terminal tasks never change again.
    pub fn transition(&mut self, state: TaskState, reason: Option<String>) -> bool {
        if self.state.is_terminal() || self.state == state {
            return false;
        }
        self.state = state;
        if reason.is_some() {
            self.reason = reason;
        }
        true
    }
}

/// Read-only view of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSnapshot {
    pub id: ContainerId,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub slots: Vec<SlotId>,
    pub state: ContainerState,
    pub ports: Vec<ReservedRange>,
    pub log_lines: usize,
}

/// Read-only view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub reason: Option<String>,
    pub slots: u32,
    pub containers: Vec<ContainerSnapshot>,
    pub agents: BTreeSet<AgentId>,
    pub join: TaskJoin,
    pub kill_requested: bool,
}

/// A task status change, published to submitters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub state: TaskState,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ContainerState::*;

    #[test]
    fn join_succeeds_only_when_all_exit_ok() {
        let mut join = TaskJoin::new(3);
        assert_eq!(join.record(ExitedOk, false), JoinOutcome::Outstanding);
        assert_eq!(join.record(ExitedOk, false), JoinOutcome::Outstanding);
        assert_eq!(join.record(ExitedOk, false), JoinOutcome::AllSucceeded);
    }

    #[test]
    fn join_reports_first_failure_once() {
        let mut join = TaskJoin::new(3);
        assert_eq!(join.record(ExitedError, false), JoinOutcome::FirstFailure);
        assert_eq!(join.record(Lost, true), JoinOutcome::Outstanding);
        assert_eq!(join.record(Killed, true), JoinOutcome::AllTerminal);
        assert_eq!(join.failed, 2);
        assert_eq!(join.stopped, 1);
    }

    #[test]
    fn single_failure_completes_single_container_join() {
        let mut join = TaskJoin::new(1);
        assert_eq!(join.record(Lost, false), JoinOutcome::AllTerminal);
    }

    #[test]
    fn unexpected_kill_is_a_failure() {
        let mut join = TaskJoin::new(2);
        assert_eq!(join.record(Killed, false), JoinOutcome::FirstFailure);
        assert_eq!(join.stopped, 0);
        assert_eq!(join.failed, 1);
    }

    #[test]
    fn terminal_task_does_not_transition() {
        let spec = TaskSpec {
            name: "t".into(),
            image: "img".into(),
            slots: 1,
            ..Default::default()
        };
        let mut task = Task::new("t1".into(), spec, Vec::new(), 0);
        assert!(task.transition(TaskState::Failed, Some("boom".into())));
        assert!(!task.transition(TaskState::Succeeded, None));
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.reason.as_deref(), Some("boom"));
    }
}
