//! Domain types shared by the registry, allocator, and scheduler.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ports::PortRange;

/// Unique identifier for an agent.
pub type AgentId = String;

/// Unique identifier for a task.
pub type TaskId = String;

/// Unique identifier for a container. At least 8 characters long.
pub type ContainerId = String;

/// Index of a slot within its agent.
pub type SlotId = u32;

// ── Agents ─────────────────────────────────────────────────────────

/// What an agent advertises when it connects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRegistration {
    pub id: AgentId,
    pub address: String,
    pub slots: u32,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

// ── Tasks ──────────────────────────────────────────────────────────

/// Where the slots of a task may be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Every slot on one agent, one container.
    #[default]
    SingleAgent,
    /// One slot on each of N distinct agents, one container per agent.
    OnePerAgent,
}

impl Placement {
    /// Number of containers a task with `slots` slots will own.
    pub fn container_count(self, slots: u32) -> u32 {
        match self {
            Placement::SingleAgent => 1,
            Placement::OnePerAgent => slots,
        }
    }
}

/// A task as submitted, before validation.
///
/// `port_ranges` maps a backend name to either `""` (allocator picks a
/// default block) or `"MIN:MAX"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskSpec {
    pub name: String,
    pub image: String,
    pub slots: u32,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub required_labels: HashMap<String, String>,
    #[serde(default)]
    pub port_ranges: BTreeMap<String, String>,
}

/// A validated port request for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRequest {
    /// Let the allocator derive a non-overlapping default block.
    Default,
    /// Exactly this range.
    Explicit(PortRange),
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::Killed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Scheduled => "scheduled",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Killed => "killed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Containers ─────────────────────────────────────────────────────

/// Lifecycle of a container, ordered from creation to termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Assigned,
    Pulling,
    Starting,
    Running,
    ExitedOk,
    ExitedError,
    Killed,
    Lost,
}

impl ContainerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ContainerState::ExitedOk
                | ContainerState::ExitedError
                | ContainerState::Killed
                | ContainerState::Lost
        )
    }

    /// Position in the forward lifecycle. All terminal states share a rank.
    pub fn rank(self) -> u8 {
        match self {
            ContainerState::Assigned => 0,
            ContainerState::Pulling => 1,
            ContainerState::Starting => 2,
            ContainerState::Running => 3,
            _ => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContainerState::Assigned => "assigned",
            ContainerState::Pulling => "pulling",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::ExitedOk => "exited_ok",
            ContainerState::ExitedError => "exited_error",
            ContainerState::Killed => "killed",
            ContainerState::Lost => "lost",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
