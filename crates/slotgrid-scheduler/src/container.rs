//! Container lifecycle.
//!
//! `assigned → pulling → starting → running → {exited_ok, exited_error, killed, lost}`
//!
//! Agents may deliver reports late, twice, or out of order. A container
//! only ever moves forward; anything else is classified and dropped by
//! the caller. Once terminal, a container never changes again.

use tracing::{debug, warn};

use slotgrid_core::{AgentId, ContainerId, ContainerState, SlotId, TaskId};
use slotgrid_placement::ReservedRange;

use crate::logs::short_id;

/// Outcome of applying a reported state to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Moved forward to a non-terminal state.
    Advanced,
    /// Entered a terminal state. Happens at most once per container.
    Terminated,
    /// Same state as the current one.
    Duplicate,
    /// Behind the current state; a late delivery.
    Stale,
    /// The container is already terminal with a different outcome.
    AfterTerminal,
}

impl Transition {
    /// Whether the container changed.
    pub fn changed(self) -> bool {
        matches!(self, Transition::Advanced | Transition::Terminated)
    }
}

#[derive(Debug, Clone)]
pub struct Container {
    pub id: ContainerId,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub slots: Vec<SlotId>,
    pub ports: Vec<ReservedRange>,
    state: ContainerState,
    log: Vec<String>,
}

impl Container {
    pub fn new(
        id: ContainerId,
        task_id: TaskId,
        agent_id: AgentId,
        slots: Vec<SlotId>,
        ports: Vec<ReservedRange>,
    ) -> Self {
        Self {
            id,
            task_id,
            agent_id,
            slots,
            ports,
            state: ContainerState::Assigned,
            log: Vec::new(),
        }
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// Apply a reported state.
    pub fn apply(&mut self, next: ContainerState) -> Transition {
        let current = self.state;

        let transition = if current == next {
            Transition::Duplicate
        } else if current.is_terminal() {
            Transition::AfterTerminal
        } else if next.rank() < current.rank() {
            Transition::Stale
        } else if next.is_terminal() {
            Transition::Terminated
        } else {
            Transition::Advanced
        };

        match transition {
            Transition::Advanced | Transition::Terminated => {
                debug!(
                    container_id = %self.short_id(),
                    from = %current,
                    to = %next,
                    "container transition"
                );
                self.state = next;
            }
            Transition::Duplicate => {
                debug!(
                    container_id = %self.short_id(),
                    state = %next,
                    "duplicate container state ignored"
                );
            }
            Transition::Stale => {
                debug!(
                    container_id = %self.short_id(),
                    current = %current,
                    reported = %next,
                    "stale container state ignored"
                );
            }
            Transition::AfterTerminal => {
                warn!(
                    container_id = %self.short_id(),
                    current = %current,
                    reported = %next,
                    "report for terminated container discarded"
                );
            }
        }
        transition
    }

    /// Append a normalized log line. The history is append-only.
    pub fn append_log(&mut self, line: String) {
        self.log.push(line);
    }

    pub fn logs(&self) -> &[String] {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ContainerState::*;

    fn make_container() -> Container {
        Container::new(
            "abcdef1234567890".to_string(),
            "task-1".to_string(),
            "agent-1".to_string(),
            vec![0],
            Vec::new(),
        )
    }

    #[test]
    fn happy_path_advances() {
        let mut c = make_container();
        assert_eq!(c.apply(Pulling), Transition::Advanced);
        assert_eq!(c.apply(Starting), Transition::Advanced);
        assert_eq!(c.apply(Running), Transition::Advanced);
        assert_eq!(c.apply(ExitedOk), Transition::Terminated);
        assert_eq!(c.state(), ExitedOk);
    }

    #[test]
    fn states_may_be_skipped() {
        let mut c = make_container();
        assert_eq!(c.apply(Running), Transition::Advanced);
        let mut c = make_container();
        assert_eq!(c.apply(ExitedError), Transition::Terminated);
    }

    #[test]
    fn stale_reports_do_not_move_backwards() {
        let mut c = make_container();
        c.apply(Running);
        assert_eq!(c.apply(Pulling), Transition::Stale);
        assert_eq!(c.state(), Running);
    }

    #[test]
    fn terminal_is_final() {
        let mut c = make_container();
        c.apply(Running);
        assert_eq!(c.apply(ExitedError), Transition::Terminated);
        assert_eq!(c.apply(ExitedError), Transition::Duplicate);
        assert_eq!(c.apply(ExitedOk), Transition::AfterTerminal);
        assert_eq!(c.apply(Lost), Transition::AfterTerminal);
        assert_eq!(c.apply(Running), Transition::AfterTerminal);
        assert_eq!(c.state(), ExitedError);
    }

    #[test]
    fn duplicate_non_terminal_is_not_a_change() {
        let mut c = make_container();
        c.apply(Pulling);
        let t = c.apply(Pulling);
        assert_eq!(t, Transition::Duplicate);
        assert!(!t.changed());
    }

    #[test]
    fn log_history_is_ordered() {
        let mut c = make_container();
        c.append_log("first".to_string());
        c.append_log("second".to_string());
        assert_eq!(c.logs(), ["first", "second"]);
        assert_eq!(c.short_id(), "abcdef12");
    }
}
