//! Scheduler service: the provider behind a serialized request queue.
//!
//! One tokio task owns the `ResourceProvider`. Callers talk to it through
//! a cloneable `SchedulerHandle`; every request is applied in arrival
//! order and answered on a oneshot channel. After each request the actor
//! runs a scheduling pass and flushes the provider's outbound queues:
//!
//! - agent commands and log records go to unbounded channels, so the
//!   actor never waits on a slow consumer
//! - task updates go to a broadcast channel for any number of watchers
//!
//! A reaper tick expires silent agents, enforces kill deadlines and
//! verifies bookkeeping. Corruption stops the actor with an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use slotgrid_core::{
    AgentId, AgentRegistration, ContainerId, MasterConfig, TaskId, TaskSpec, TaskState,
};
use slotgrid_placement::AgentSummary;

use crate::container::Transition;
use crate::error::{SchedulerError, SchedulerResult};
use crate::logs::LogRecord;
use crate::provider::{AgentCommand, ContainerEvent, ProviderConfig, ResourceProvider};
use crate::task::{ContainerSnapshot, TaskSnapshot, TaskUpdate};

/// Settings for the service actor.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub provider: ProviderConfig,
    pub reaper_interval: Duration,
    /// Depth of the inbound request queue.
    pub queue_depth: usize,
    /// Capacity of the task update broadcast channel.
    pub update_capacity: usize,
}

impl From<&MasterConfig> for ServiceConfig {
    fn from(config: &MasterConfig) -> Self {
        Self {
            provider: ProviderConfig::from(config),
            reaper_interval: config.reaper_interval(),
            ..Self::default()
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            reaper_interval: Duration::from_secs(5),
            queue_depth: 1024,
            update_capacity: 256,
        }
    }
}

type Reply<T> = oneshot::Sender<SchedulerResult<T>>;

enum Request {
    RegisterAgent {
        registration: AgentRegistration,
        reply: Reply<AgentId>,
    },
    DeregisterAgent {
        agent_id: AgentId,
        reply: Reply<Vec<ContainerId>>,
    },
    Heartbeat {
        agent_id: AgentId,
        reply: Reply<()>,
    },
    Submit {
        spec: TaskSpec,
        reply: Reply<TaskId>,
    },
    Kill {
        task_id: TaskId,
        reply: Reply<TaskState>,
    },
    ContainerEvent {
        container_id: ContainerId,
        event: ContainerEvent,
        reply: Reply<Option<Transition>>,
    },
    Task {
        task_id: TaskId,
        reply: oneshot::Sender<Option<TaskSnapshot>>,
    },
    Container {
        container_id: ContainerId,
        reply: oneshot::Sender<Option<ContainerSnapshot>>,
    },
    ContainerLogs {
        container_id: ContainerId,
        reply: oneshot::Sender<Option<Vec<String>>>,
    },
    Agents {
        reply: oneshot::Sender<Vec<AgentSummary>>,
    },
    Verify {
        reply: Reply<()>,
    },
}

/// Receiving ends of the service's outbound streams.
pub struct ServiceChannels {
    pub commands: mpsc::UnboundedReceiver<AgentCommand>,
    pub logs: mpsc::UnboundedReceiver<LogRecord>,
}

/// Cloneable front door to the scheduler actor.
#[derive(Clone)]
pub struct SchedulerHandle {
    requests: mpsc::Sender<Request>,
    updates: broadcast::Sender<TaskUpdate>,
    shutdown: Arc<watch::Sender<bool>>,
}

pub struct SchedulerService {
    provider: ResourceProvider,
    requests: mpsc::Receiver<Request>,
    commands: mpsc::UnboundedSender<AgentCommand>,
    logs: mpsc::UnboundedSender<LogRecord>,
    updates: broadcast::Sender<TaskUpdate>,
    shutdown: watch::Receiver<bool>,
    reaper_interval: Duration,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl SchedulerService {
    /// Start the actor on the current runtime.
    pub fn spawn(
        config: ServiceConfig,
    ) -> (SchedulerHandle, ServiceChannels, JoinHandle<SchedulerResult<()>>) {
        let (request_tx, request_rx) = mpsc::channel(config.queue_depth.max(1));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (update_tx, _) = broadcast::channel(config.update_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let service = SchedulerService {
            provider: ResourceProvider::new(config.provider),
            requests: request_rx,
            commands: command_tx,
            logs: log_tx,
            updates: update_tx.clone(),
            shutdown: shutdown_rx,
            reaper_interval: config.reaper_interval,
        };
        let join = tokio::spawn(service.run());

        let handle = SchedulerHandle {
            requests: request_tx,
            updates: update_tx,
            shutdown: Arc::new(shutdown_tx),
        };
        let channels = ServiceChannels {
            commands: command_rx,
            logs: log_rx,
        };
        (handle, channels, join)
    }

    async fn run(mut self) -> SchedulerResult<()> {
        let mut interval = tokio::time::interval(self.reaper_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(reaper_interval = ?self.reaper_interval, "scheduler started");

        loop {
            let outcome = tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = interval.tick() => self.reap(),
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
            };
            self.flush();

            if let Err(e) = outcome {
                error!(error = %e, "scheduler state corrupted, stopping");
                return Err(e);
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    /// Apply one request. Only fatal errors are returned; everything
    /// else goes back to the caller.
    fn handle(&mut self, request: Request) -> SchedulerResult<()> {
        let now = now();
        match request {
            Request::RegisterAgent { registration, reply } => {
                let result = self.provider.register_agent(registration, now);
                self.settle(reply, result)
            }
            Request::DeregisterAgent { agent_id, reply } => {
                let result = self.provider.deregister_agent(&agent_id, now);
                self.settle(reply, result)
            }
            Request::Heartbeat { agent_id, reply } => {
                let result = self.provider.heartbeat(&agent_id, now);
                self.settle(reply, result)
            }
            Request::Submit { spec, reply } => {
                let result = self.provider.submit(spec);
                self.settle(reply, result)
            }
            Request::Kill { task_id, reply } => {
                let result = self.provider.kill(&task_id, now);
                self.settle(reply, result)
            }
            Request::ContainerEvent {
                container_id,
                event,
                reply,
            } => {
                let result = self.provider.report_container_event(&container_id, event, now);
                self.settle(reply, result)
            }
            Request::Verify { reply } => {
                let result = self.provider.verify_consistency();
                self.settle(reply, result)
            }
            Request::Task { task_id, reply } => {
                let _ = reply.send(self.provider.task(&task_id));
                Ok(())
            }
            Request::Container { container_id, reply } => {
                let _ = reply.send(self.provider.container(&container_id));
                Ok(())
            }
            Request::ContainerLogs { container_id, reply } => {
                let _ = reply.send(self.provider.container_logs(&container_id));
                Ok(())
            }
            Request::Agents { reply } => {
                let _ = reply.send(self.provider.agents());
                Ok(())
            }
        }
    }

    /// Schedule, flush, then answer. By the time a caller sees its
    /// result, every command and update it caused is already queued.
    fn settle<T>(&mut self, reply: Reply<T>, result: SchedulerResult<T>) -> SchedulerResult<()> {
        let pass = if matches!(result, Err(SchedulerError::Corrupted(_))) {
            Ok(())
        } else {
            self.provider.tick().map(|scheduled| {
                if !scheduled.is_empty() {
                    debug!(count = scheduled.len(), "scheduling pass placed tasks");
                }
            })
        };
        self.flush();

        match answer(reply, result) {
            Some(fatal) => Err(fatal),
            None => pass,
        }
    }

    fn reap(&mut self) -> SchedulerResult<()> {
        let report = self.provider.expire(now())?;
        if !report.expired_agents.is_empty() {
            info!(
                count = report.expired_agents.len(),
                agents = ?report.expired_agents,
                "reaped silent agents"
            );
        }
        if !report.kill_timeouts.is_empty() {
            info!(count = report.kill_timeouts.len(), "containers lost after kill timeout");
        }
        self.provider.tick()?;
        self.provider.verify_consistency()
    }

    fn flush(&mut self) {
        for command in self.provider.drain_commands() {
            if self.commands.send(command).is_err() {
                warn!("agent command receiver dropped");
            }
        }
        for record in self.provider.drain_log_records() {
            if self.logs.send(record).is_err() {
                warn!("log record receiver dropped");
            }
        }
        for update in self.provider.drain_updates() {
            // No subscribers is fine.
            let _ = self.updates.send(update);
        }
    }
}

/// Send `result` to the caller. A corruption error is also handed back
/// to the actor so it can stop.
fn answer<T>(reply: Reply<T>, result: SchedulerResult<T>) -> Option<SchedulerError> {
    match result {
        Err(SchedulerError::Corrupted(msg)) => {
            let _ = reply.send(Err(SchedulerError::Corrupted(msg.clone())));
            Some(SchedulerError::Corrupted(msg))
        }
        other => {
            let _ = reply.send(other);
            None
        }
    }
}

impl SchedulerHandle {
    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> SchedulerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| SchedulerError::ServiceStopped)?;
        rx.await.map_err(|_| SchedulerError::ServiceStopped)?
    }

    async fn query<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> SchedulerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| SchedulerError::ServiceStopped)?;
        rx.await.map_err(|_| SchedulerError::ServiceStopped)
    }

    pub async fn register_agent(
        &self,
        registration: AgentRegistration,
    ) -> SchedulerResult<AgentId> {
        self.call(|reply| Request::RegisterAgent { registration, reply }).await
    }

    pub async fn deregister_agent(&self, agent_id: &str) -> SchedulerResult<Vec<ContainerId>> {
        let agent_id = agent_id.to_string();
        self.call(|reply| Request::DeregisterAgent { agent_id, reply }).await
    }

    pub async fn heartbeat(&self, agent_id: &str) -> SchedulerResult<()> {
        let agent_id = agent_id.to_string();
        self.call(|reply| Request::Heartbeat { agent_id, reply }).await
    }

    pub async fn submit(&self, spec: TaskSpec) -> SchedulerResult<TaskId> {
        self.call(|reply| Request::Submit { spec, reply }).await
    }

    pub async fn kill(&self, task_id: &str) -> SchedulerResult<TaskState> {
        let task_id = task_id.to_string();
        self.call(|reply| Request::Kill { task_id, reply }).await
    }

    pub async fn report_container_event(
        &self,
        container_id: &str,
        event: ContainerEvent,
    ) -> SchedulerResult<Option<Transition>> {
        let container_id = container_id.to_string();
        self.call(|reply| Request::ContainerEvent {
            container_id,
            event,
            reply,
        })
        .await
    }

    pub async fn verify_consistency(&self) -> SchedulerResult<()> {
        self.call(|reply| Request::Verify { reply }).await
    }

    pub async fn task(&self, task_id: &str) -> SchedulerResult<Option<TaskSnapshot>> {
        let task_id = task_id.to_string();
        self.query(|reply| Request::Task { task_id, reply }).await
    }

    pub async fn container(
        &self,
        container_id: &str,
    ) -> SchedulerResult<Option<ContainerSnapshot>> {
        let container_id = container_id.to_string();
        self.query(|reply| Request::Container { container_id, reply }).await
    }

    pub async fn container_logs(&self, container_id: &str) -> SchedulerResult<Option<Vec<String>>> {
        let container_id = container_id.to_string();
        self.query(|reply| Request::ContainerLogs { container_id, reply }).await
    }

    pub async fn agents(&self) -> SchedulerResult<Vec<AgentSummary>> {
        self.query(|reply| Request::Agents { reply }).await
    }

    /// Watch task status changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdate> {
        self.updates.subscribe()
    }

    /// Ask the actor to stop after the request it is handling.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
