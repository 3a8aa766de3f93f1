//! Resource provider: the single owner of fleet and task state.
//!
//! Every decision (slot reservation, port reservation, container and task
//! transitions) happens through `&mut self` on one instance. The service
//! actor holds that instance and feeds it one request at a time.
//!
//! Side effects are queued rather than performed: agent commands, task
//! updates and log records accumulate until the owner drains them.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use slotgrid_core::{
    AgentId, AgentRegistration, ContainerId, ContainerState, MasterConfig, PortPoolConfig,
    PortRequest, SlotId, TaskId, TaskSpec, TaskState, TrialRunnerConfig, parse_range,
};
use slotgrid_placement::{
    AgentRegistry, AgentSummary, PortAllocator, RegistryError, ReservedRange, SlotState,
};

use crate::container::{Container, Transition};
use crate::error::{AdmissionError, SchedulerError, SchedulerResult};
use crate::logs::{LogEvent, LogRecord, RawLogEvent};
use crate::task::{ContainerSnapshot, JoinOutcome, Task, TaskJoin, TaskSnapshot, TaskUpdate};

/// Provider settings, usually derived from `MasterConfig`.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub heartbeat_timeout: Duration,
    pub kill_timeout: Duration,
    pub ports: PortPoolConfig,
    pub trial_runner: TrialRunnerConfig,
    /// Finished tasks kept for queries before the oldest are pruned.
    pub retained_tasks: usize,
}

impl From<&MasterConfig> for ProviderConfig {
    fn from(config: &MasterConfig) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout(),
            kill_timeout: config.kill_timeout(),
            ports: config.ports,
            trial_runner: config.trial_runner.clone(),
            retained_tasks: config.master.retained_tasks,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::from(&MasterConfig::default())
    }
}

/// Instruction for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    StartContainer {
        agent_id: AgentId,
        task_id: TaskId,
        container_id: ContainerId,
        image: String,
        slots: Vec<SlotId>,
        ports: Vec<ReservedRange>,
    },
    KillContainer {
        agent_id: AgentId,
        container_id: ContainerId,
    },
}

impl AgentCommand {
    pub fn agent_id(&self) -> &str {
        match self {
            AgentCommand::StartContainer { agent_id, .. }
            | AgentCommand::KillContainer { agent_id, .. } => agent_id,
        }
    }

    pub fn container_id(&self) -> &str {
        match self {
            AgentCommand::StartContainer { container_id, .. }
            | AgentCommand::KillContainer { container_id, .. } => container_id,
        }
    }
}

/// Something an agent reports about one of its containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ContainerEvent {
    State(ContainerState),
    Log(RawLogEvent),
}

/// What a reaper pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub expired_agents: Vec<AgentId>,
    /// Containers asserted lost because a kill was never confirmed.
    pub kill_timeouts: Vec<ContainerId>,
}

enum Attempt {
    Scheduled,
    Deferred,
    Dropped,
}

#[derive(Debug)]
pub struct ResourceProvider {
    config: ProviderConfig,
    registry: AgentRegistry,
    ports: PortAllocator,
    tasks: HashMap<TaskId, Task>,
    containers: HashMap<ContainerId, Container>,
    /// Pending tasks, oldest first.
    pending: VecDeque<TaskId>,
    /// Tasks whose resources are all released, oldest first.
    finished: VecDeque<TaskId>,
    next_seq: u64,
    commands: Vec<AgentCommand>,
    updates: Vec<TaskUpdate>,
    log_records: Vec<LogRecord>,
}

fn new_container_id() -> ContainerId {
    Uuid::new_v4().simple().to_string()
}

impl ResourceProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let ports = PortAllocator::new(config.ports);
        Self {
            config,
            registry: AgentRegistry::new(),
            ports,
            tasks: HashMap::new(),
            containers: HashMap::new(),
            pending: VecDeque::new(),
            finished: VecDeque::new(),
            next_seq: 0,
            commands: Vec::new(),
            updates: Vec::new(),
            log_records: Vec::new(),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    // ── Agents ─────────────────────────────────────────────────────

    pub fn register_agent(
        &mut self,
        reg: AgentRegistration,
        now: Instant,
    ) -> SchedulerResult<AgentId> {
        Ok(self.registry.register(reg, now)?)
    }

    /// Remove an agent. Every container still active on it becomes `lost`.
    ///
    /// Returns the containers that were lost.
    pub fn deregister_agent(
        &mut self,
        agent_id: &str,
        now: Instant,
    ) -> SchedulerResult<Vec<ContainerId>> {
        let assignments = self.registry.deregister(agent_id)?;

        let mut lost: Vec<ContainerId> = Vec::new();
        for assignment in assignments {
            if !lost.contains(&assignment.container_id) {
                lost.push(assignment.container_id);
            }
        }
        // Containers with no slots left on the agent are already terminal,
        // so anything active here that the registry did not report is a
        // bookkeeping error.
        for container in self.containers.values() {
            if container.agent_id == agent_id
                && !container.is_terminal()
                && !lost.contains(&container.id)
            {
                return Err(SchedulerError::Corrupted(format!(
                    "active container {} on agent {agent_id} holds no slots",
                    container.id
                )));
            }
        }

        let reason = format!("agent {agent_id} disconnected");
        for container_id in &lost {
            self.apply_state(container_id, ContainerState::Lost, Some(&reason), now)?;
        }
        Ok(lost)
    }

    pub fn heartbeat(&mut self, agent_id: &str, now: Instant) -> SchedulerResult<()> {
        if self.registry.heartbeat(agent_id, now) {
            Ok(())
        } else {
            Err(RegistryError::UnknownAgent(agent_id.to_string()).into())
        }
    }

    /// Deregister silent agents and assert `lost` on containers whose kill
    /// was never confirmed.
    pub fn expire(&mut self, now: Instant) -> SchedulerResult<ReapReport> {
        let mut report = ReapReport::default();

        for agent_id in self.registry.expired(now, self.config.heartbeat_timeout) {
            warn!(
                %agent_id,
                timeout = ?self.config.heartbeat_timeout,
                "agent missed heartbeat deadline"
            );
            self.deregister_agent(&agent_id, now)?;
            report.expired_agents.push(agent_id);
        }

        let overdue: Vec<ContainerId> = self
            .tasks
            .values()
            .filter(|t| t.kill_deadline.is_some_and(|d| d <= now))
            .flat_map(|t| t.containers.iter())
            .filter(|cid| self.containers.get(*cid).is_some_and(|c| !c.is_terminal()))
            .cloned()
            .collect();
        for container_id in overdue {
            warn!(%container_id, "kill not confirmed before deadline");
            self.apply_state(&container_id, ContainerState::Lost, Some("kill timeout"), now)?;
            report.kill_timeouts.push(container_id);
        }

        Ok(report)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Validate and admit a task. It waits in `pending` until `tick`
    /// finds room for it.
    pub fn submit(&mut self, spec: TaskSpec) -> SchedulerResult<TaskId> {
        let port_requests = match self.admit(&spec) {
            Ok(requests) => requests,
            Err(e) => {
                warn!(task = %spec.name, error = %e, "task rejected");
                return Err(e.into());
            }
        };

        let task_id = Uuid::new_v4().to_string();
        let seq = self.next_seq;
        self.next_seq += 1;

        info!(
            %task_id,
            name = %spec.name,
            slots = spec.slots,
            placement = ?spec.placement,
            "task submitted"
        );
        self.tasks
            .insert(task_id.clone(), Task::new(task_id.clone(), spec, port_requests, seq));
        self.pending.push_back(task_id.clone());
        self.publish(&task_id);
        Ok(task_id)
    }

    fn admit(&self, spec: &TaskSpec) -> Result<Vec<(String, PortRequest)>, AdmissionError> {
        if spec.slots == 0 {
            return Err(AdmissionError::ZeroSlots);
        }
        if spec.image.trim().is_empty() {
            return Err(AdmissionError::EmptyImage);
        }

        let domain = self.config.ports.domain();
        let mut requests = Vec::with_capacity(spec.port_ranges.len());
        for (backend, text) in &spec.port_ranges {
            if backend.trim().is_empty() {
                return Err(AdmissionError::EmptyBackend);
            }
            let parsed = parse_range(text).map_err(|source| AdmissionError::PortRange {
                backend: backend.clone(),
                source,
            })?;
            let request = match parsed.or_else(|| self.config.trial_runner.backend_range(backend)) {
                Some(range) if !range.within(&domain) => {
                    return Err(AdmissionError::OutOfDomain {
                        backend: backend.clone(),
                        range,
                        domain,
                    });
                }
                Some(range) => PortRequest::Explicit(range),
                None => PortRequest::Default,
            };
            requests.push((backend.clone(), request));
        }

        // Explicit ranges of one task that overlap each other can never be
        // reserved together.
        for (i, (a, ra)) in requests.iter().enumerate() {
            for (b, rb) in &requests[i + 1..] {
                if let (PortRequest::Explicit(ra), PortRequest::Explicit(rb)) = (ra, rb) {
                    if ra.overlaps(rb) {
                        return Err(AdmissionError::OverlappingBackends {
                            a: a.clone(),
                            b: b.clone(),
                        });
                    }
                }
            }
        }
        Ok(requests)
    }

    /// One scheduling pass over pending tasks, oldest first.
    ///
    /// A task that does not fit stays pending and does not stop younger
    /// tasks from being considered. Returns the tasks scheduled.
    pub fn tick(&mut self) -> SchedulerResult<Vec<TaskId>> {
        self.prune_finished();
        let queue: Vec<TaskId> = self.pending.drain(..).collect();
        let mut scheduled = Vec::new();
        let mut iter = queue.into_iter();

        while let Some(task_id) = iter.next() {
            match self.try_schedule(&task_id) {
                Ok(Attempt::Scheduled) => scheduled.push(task_id),
                Ok(Attempt::Deferred) => self.pending.push_back(task_id),
                Ok(Attempt::Dropped) => {}
                Err(e) => {
                    self.pending.push_back(task_id);
                    self.pending.extend(iter);
                    return Err(e);
                }
            }
        }
        Ok(scheduled)
    }

    fn try_schedule(&mut self, task_id: &str) -> SchedulerResult<Attempt> {
        let Some(task) = self.tasks.get(task_id) else {
            return Ok(Attempt::Dropped);
        };
        if task.state != TaskState::Pending {
            return Ok(Attempt::Dropped);
        }
        let count = task.spec.slots;
        let constraints = task.constraints.clone();
        let requests = task.port_requests.clone();

        let grants = match self
            .registry
            .reserve_slots(task_id, count, &constraints, new_container_id)
        {
            Ok(grants) => grants,
            Err(RegistryError::InsufficientCapacity { free, .. }) => {
                debug!(%task_id, requested = count, free, "task waiting for slots");
                return Ok(Attempt::Deferred);
            }
            Err(e) => return Err(e.into()),
        };

        let agent_ids: Vec<AgentId> = grants.iter().map(|g| g.agent_id.clone()).collect();
        let mut ports = match self.ports.reserve_many(&agent_ids, task_id, &requests) {
            Ok(ports) => ports,
            Err(e) => {
                for grant in &grants {
                    self.registry.release_container(&grant.agent_id, &grant.container_id);
                }
                if e.is_capacity() {
                    debug!(%task_id, error = %e, "task waiting for ports");
                    return Ok(Attempt::Deferred);
                }
                warn!(%task_id, error = %e, "port reservation failed");
                self.fail_pending(task_id, e.to_string());
                return Ok(Attempt::Dropped);
            }
        };

        let Some(task) = self.tasks.get_mut(task_id) else {
            return Ok(Attempt::Dropped);
        };
        task.join = TaskJoin::new(grants.len());
        for grant in grants {
            let ranges = ports.remove(&grant.agent_id).unwrap_or_default();
            self.commands.push(AgentCommand::StartContainer {
                agent_id: grant.agent_id.clone(),
                task_id: task_id.to_string(),
                container_id: grant.container_id.clone(),
                image: task.spec.image.clone(),
                slots: grant.slots.clone(),
                ports: ranges.clone(),
            });
            task.containers.push(grant.container_id.clone());
            self.containers.insert(
                grant.container_id.clone(),
                Container::new(
                    grant.container_id,
                    task_id.to_string(),
                    grant.agent_id,
                    grant.slots,
                    ranges,
                ),
            );
        }
        task.transition(TaskState::Scheduled, None);
        info!(%task_id, containers = task.containers.len(), agents = ?agent_ids, "task scheduled");
        self.publish(task_id);
        Ok(Attempt::Scheduled)
    }

    fn fail_pending(&mut self, task_id: &str, reason: String) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.transition(TaskState::Failed, Some(reason));
            task.resources_released = true;
            self.finished.push_back(task_id.to_string());
        }
        self.publish(task_id);
    }

    /// Forget the oldest finished tasks and their containers beyond the
    /// retention limit.
    fn prune_finished(&mut self) {
        while self.finished.len() > self.config.retained_tasks {
            let Some(task_id) = self.finished.pop_front() else {
                break;
            };
            if let Some(task) = self.tasks.remove(&task_id) {
                for container_id in &task.containers {
                    self.containers.remove(container_id);
                }
                debug!(%task_id, containers = task.containers.len(), "finished task pruned");
            }
        }
    }

    /// Apply a report from an agent about one of its containers.
    ///
    /// State reports return how the container reacted; log events `None`.
    /// Any report counts as contact from the container's agent.
    pub fn report_container_event(
        &mut self,
        container_id: &str,
        event: ContainerEvent,
        now: Instant,
    ) -> SchedulerResult<Option<Transition>> {
        if let Some(container) = self.containers.get(container_id) {
            self.registry.heartbeat(&container.agent_id, now);
        }
        match event {
            ContainerEvent::State(state) => {
                self.apply_state(container_id, state, None, now).map(Some)
            }
            ContainerEvent::Log(raw) => self.append_log(container_id, raw).map(|()| None),
        }
    }

    fn append_log(&mut self, container_id: &str, raw: RawLogEvent) -> SchedulerResult<()> {
        let container = self
            .containers
            .get_mut(container_id)
            .ok_or_else(|| SchedulerError::ContainerNotFound(container_id.to_string()))?;
        if container.is_terminal() {
            debug!(
                container_id = %container.short_id(),
                "log event for terminated container discarded"
            );
            return Ok(());
        }

        let event = LogEvent::from_raw(container_id, raw).inspect_err(|e| {
            warn!(container_id = %container.short_id(), error = %e, "log event rejected");
        })?;
        let line = event.format(container.state());
        container.append_log(line.clone());
        self.log_records.push(LogRecord {
            task_id: container.task_id.clone(),
            container_id: container.id.clone(),
            timestamp: event.timestamp,
            line,
        });
        Ok(())
    }

    fn apply_state(
        &mut self,
        container_id: &str,
        state: ContainerState,
        reason: Option<&str>,
        now: Instant,
    ) -> SchedulerResult<Transition> {
        let container = self
            .containers
            .get_mut(container_id)
            .ok_or_else(|| SchedulerError::ContainerNotFound(container_id.to_string()))?;
        let transition = container.apply(state);
        let task_id = container.task_id.clone();

        match transition {
            Transition::Advanced if state == ContainerState::Running => {
                let started = self.tasks.get_mut(&task_id).is_some_and(|t| {
                    t.state == TaskState::Scheduled && t.transition(TaskState::Running, None)
                });
                if started {
                    info!(%task_id, "task running");
                    self.publish(&task_id);
                }
            }
            Transition::Terminated => self.on_container_terminated(container_id, reason, now)?,
            _ => {}
        }
        Ok(transition)
    }

    /// Runs exactly once per container, when it first becomes terminal.
    fn on_container_terminated(
        &mut self,
        container_id: &str,
        reason: Option<&str>,
        now: Instant,
    ) -> SchedulerResult<()> {
        let Some(container) = self.containers.get(container_id) else {
            return Ok(());
        };
        let state = container.state();
        let agent_id = container.agent_id.clone();
        let task_id = container.task_id.clone();
        let short = container.short_id().to_string();
        let expected_slots = container.slots.len();

        let released = self.registry.release_container(&agent_id, container_id);
        if self.registry.contains(&agent_id) && released.len() != expected_slots {
            return Err(SchedulerError::Corrupted(format!(
                "container {container_id} held {} slots on agent {agent_id}, released {}",
                expected_slots,
                released.len()
            )));
        }
        info!(%task_id, container_id = %short, %agent_id, %state, "container terminated");

        let Some(task) = self.tasks.get_mut(&task_id) else {
            return Err(SchedulerError::Corrupted(format!(
                "container {container_id} belongs to unknown task {task_id}"
            )));
        };
        let stopping = task.kill_requested || task.kill_deadline.is_some();
        let outcome = task.join.record(state, stopping);

        let mut changed = false;
        let mut abort_siblings = false;
        match outcome {
            // A task being killed ends as killed, whatever its containers do.
            JoinOutcome::Outstanding => {}
            JoinOutcome::FirstFailure if task.kill_requested => {}
            JoinOutcome::FirstFailure => {
                let why = match reason {
                    Some(r) => format!("container {short} {state}: {r}"),
                    None => format!("container {short} {state}"),
                };
                changed = task.transition(TaskState::Failed, Some(why));
                abort_siblings = true;
            }
            JoinOutcome::AllSucceeded => {
                changed = task.transition(TaskState::Succeeded, None);
            }
            JoinOutcome::AllTerminal => {
                changed = if task.kill_requested {
                    task.transition(TaskState::Killed, Some("killed by request".to_string()))
                } else {
                    let why = match reason {
                        Some(r) => format!("container {short} {state}: {r}"),
                        None => format!("container {short} {state}"),
                    };
                    task.transition(TaskState::Failed, Some(why))
                };
            }
        }

        if changed {
            info!(%task_id, state = %task.state, reason = ?task.reason, "task finished");
        }
        if abort_siblings && task.kill_deadline.is_none() {
            task.kill_deadline = Some(now + self.config.kill_timeout);
            let siblings: Vec<ContainerId> = task.containers.clone();
            self.stop_containers(&siblings);
        }

        self.release_task_resources(&task_id);
        if changed {
            self.publish(&task_id);
        }
        Ok(())
    }

    /// Queue kill commands for every active container in `ids`.
    fn stop_containers(&mut self, ids: &[ContainerId]) {
        for id in ids {
            let Some(c) = self.containers.get(id) else { continue };
            if c.is_terminal() {
                continue;
            }
            debug!(container_id = %c.short_id(), agent_id = %c.agent_id, "stopping container");
            self.commands.push(AgentCommand::KillContainer {
                agent_id: c.agent_id.clone(),
                container_id: c.id.clone(),
            });
        }
    }

    /// Return a finished task's ports. Idempotent; runs once all of the
    /// task's containers are terminal.
    fn release_task_resources(&mut self, task_id: &str) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if task.resources_released || !task.state.is_terminal() || !task.join.is_complete() {
            return;
        }
        task.resources_released = true;
        task.kill_deadline = None;
        self.finished.push_back(task_id.to_string());
        let ranges = self.ports.release_task(task_id);
        debug!(%task_id, port_ranges = ranges, "task resources released");
    }

    /// Stop a task. Idempotent.
    ///
    /// Pending tasks have no containers and are killed at once. Otherwise
    /// agents are told to stop the containers, even ones still `assigned`
    /// since their start command is already out. Slots stay held until
    /// each agent confirms or the kill timeout asserts the container lost.
    pub fn kill(&mut self, task_id: &str, now: Instant) -> SchedulerResult<TaskState> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        if task.state.is_terminal() || task.kill_requested {
            debug!(%task_id, state = %task.state, "kill ignored");
            return Ok(task.state);
        }
        task.kill_requested = true;

        if task.state == TaskState::Pending {
            task.transition(TaskState::Killed, Some("killed while pending".to_string()));
            task.resources_released = true;
            self.pending.retain(|id| id != task_id);
            self.finished.push_back(task_id.to_string());
            info!(%task_id, "pending task killed");
            self.publish(task_id);
            return Ok(TaskState::Killed);
        }

        info!(%task_id, "kill requested");
        let containers = task.containers.clone();
        let state = task.state;
        task.kill_deadline = Some(now + self.config.kill_timeout);
        self.stop_containers(&containers);
        Ok(state)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn task(&self, task_id: &str) -> Option<TaskSnapshot> {
        let task = self.tasks.get(task_id)?;
        let containers: Vec<ContainerSnapshot> = task
            .containers
            .iter()
            .filter_map(|id| self.container(id))
            .collect();
        let agents: BTreeSet<AgentId> = containers.iter().map(|c| c.agent_id.clone()).collect();
        Some(TaskSnapshot {
            id: task.id.clone(),
            name: task.spec.name.clone(),
            state: task.state,
            reason: task.reason.clone(),
            slots: task.spec.slots,
            containers,
            agents,
            join: task.join.clone(),
            kill_requested: task.kill_requested,
        })
    }

    pub fn container(&self, container_id: &str) -> Option<ContainerSnapshot> {
        let c = self.containers.get(container_id)?;
        Some(ContainerSnapshot {
            id: c.id.clone(),
            task_id: c.task_id.clone(),
            agent_id: c.agent_id.clone(),
            slots: c.slots.clone(),
            state: c.state(),
            ports: c.ports.clone(),
            log_lines: c.logs().len(),
        })
    }

    pub fn container_logs(&self, container_id: &str) -> Option<Vec<String>> {
        self.containers.get(container_id).map(|c| c.logs().to_vec())
    }

    pub fn agents(&self) -> Vec<AgentSummary> {
        self.registry.agents()
    }

    /// Pending task ids, oldest first.
    pub fn pending(&self) -> Vec<TaskId> {
        self.pending.iter().cloned().collect()
    }

    // ── Outbound queues ────────────────────────────────────────────

    pub fn drain_commands(&mut self) -> Vec<AgentCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn drain_updates(&mut self) -> Vec<TaskUpdate> {
        std::mem::take(&mut self.updates)
    }

    pub fn drain_log_records(&mut self) -> Vec<LogRecord> {
        std::mem::take(&mut self.log_records)
    }

    fn publish(&mut self, task_id: &str) {
        if let Some(task) = self.tasks.get(task_id) {
            self.updates.push(TaskUpdate {
                task_id: task.id.clone(),
                state: task.state,
                reason: task.reason.clone(),
            });
        }
    }

    // ── Consistency ────────────────────────────────────────────────

    /// Cross-check slot and port bookkeeping against container records.
    pub fn verify_consistency(&self) -> SchedulerResult<()> {
        let corrupted = |msg: String| SchedulerError::Corrupted(msg);

        self.registry.check_invariants().map_err(|e| corrupted(e.to_string()))?;
        self.ports.check_all().map_err(|e| corrupted(e.to_string()))?;

        for a in self.registry.assignments() {
            let Some(c) = self.containers.get(&a.container_id) else {
                return Err(corrupted(format!(
                    "slot {} on agent {} assigned to unknown container {}",
                    a.slot_id, a.agent_id, a.container_id
                )));
            };
            if c.is_terminal()
                || c.task_id != a.task_id
                || c.agent_id != a.agent_id
                || !c.slots.contains(&a.slot_id)
            {
                return Err(corrupted(format!(
                    "slot {} on agent {} does not match container {} ({})",
                    a.slot_id,
                    a.agent_id,
                    c.id,
                    c.state()
                )));
            }
        }

        for c in self.containers.values().filter(|c| !c.is_terminal()) {
            if !self.registry.contains(&c.agent_id) {
                return Err(corrupted(format!(
                    "active container {} on unregistered agent {}",
                    c.id, c.agent_id
                )));
            }
            for &slot in &c.slots {
                let held = matches!(
                    self.registry.slot(&c.agent_id, slot),
                    Some(SlotState::Assigned { container_id, .. }) if *container_id == c.id
                );
                if !held {
                    return Err(corrupted(format!(
                        "active container {} does not hold slot {slot} on agent {}",
                        c.id, c.agent_id
                    )));
                }
            }
        }
        Ok(())
    }
}
