//! Agent registry: the slot arena of the cluster.
//!
//! Tracks connected agents, their slots, and when each was last heard
//! from. Reservation is bin-packing: the agent with the fewest free
//! slots that still fits is filled first, ties broken by registration
//! order. A reservation either grants every requested slot or none.
//!
//! The registry is plain data with `&mut self` mutators. Callers own the
//! serialization boundary (the scheduler actor holds the only instance).

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use slotgrid_core::{AgentId, AgentRegistration, ContainerId, Placement, SlotId, TaskId};

/// Errors from registry operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent already registered: {0}")]
    DuplicateAgent(AgentId),

    #[error("agent not registered: {0}")]
    UnknownAgent(AgentId),

    #[error("agent {0} advertises zero slots")]
    NoSlots(AgentId),

    #[error("insufficient capacity: requested {requested} slots ({placement:?}), {free} free on eligible agents")]
    InsufficientCapacity {
        requested: u32,
        placement: Placement,
        free: u32,
    },

    #[error("slot bookkeeping corrupted: {0}")]
    Corrupted(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Occupancy of a single slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    Free,
    Assigned {
        task_id: TaskId,
        container_id: ContainerId,
    },
}

/// Placement constraints for a reservation.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    pub placement: Placement,
    /// Every label must match exactly on a candidate agent.
    pub required_labels: HashMap<String, String>,
}

/// Slots granted to one container on one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotGrant {
    pub agent_id: AgentId,
    pub container_id: ContainerId,
    pub slots: Vec<SlotId>,
}

/// An assigned slot, as reported when its agent goes away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAssignment {
    pub agent_id: AgentId,
    pub slot_id: SlotId,
    pub task_id: TaskId,
    pub container_id: ContainerId,
}

/// Read-only view of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    pub id: AgentId,
    pub address: String,
    pub labels: HashMap<String, String>,
    pub total_slots: u32,
    pub free_slots: u32,
}

#[derive(Debug)]
struct Agent {
    address: String,
    labels: HashMap<String, String>,
    slots: Vec<SlotState>,
    /// Registration order, used as the bin-packing tie breaker.
    seq: u64,
    last_heartbeat: Instant,
}

impl Agent {
    fn free_count(&self) -> u32 {
        self.slots.iter().filter(|s| **s == SlotState::Free).count() as u32
    }

    fn free_slot_ids(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == SlotState::Free)
            .map(|(i, _)| i as SlotId)
    }

    fn matches(&self, labels: &HashMap<String, String>) -> bool {
        labels
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|av| av == v))
    }
}

/// Tracks every connected agent and its slots.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<AgentId, Agent>,
    next_seq: u64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent with all of its slots free.
    pub fn register(&mut self, reg: AgentRegistration, now: Instant) -> RegistryResult<AgentId> {
        if self.agents.contains_key(&reg.id) {
            return Err(RegistryError::DuplicateAgent(reg.id));
        }
        if reg.slots == 0 {
            return Err(RegistryError::NoSlots(reg.id));
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        info!(agent_id = %reg.id, address = %reg.address, slots = reg.slots, "agent registered");
        self.agents.insert(
            reg.id.clone(),
            Agent {
                address: reg.address,
                labels: reg.labels,
                slots: vec![SlotState::Free; reg.slots as usize],
                seq,
                last_heartbeat: now,
            },
        );
        Ok(reg.id)
    }

    /// Remove an agent. Returns every slot that was assigned on it so the
    /// caller can fail the affected containers.
    pub fn deregister(&mut self, agent_id: &str) -> RegistryResult<Vec<SlotAssignment>> {
        let agent = self
            .agents
            .remove(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;

        let lost: Vec<SlotAssignment> = agent
            .slots
            .into_iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                SlotState::Free => None,
                SlotState::Assigned { task_id, container_id } => Some(SlotAssignment {
                    agent_id: agent_id.to_string(),
                    slot_id: i as SlotId,
                    task_id,
                    container_id,
                }),
            })
            .collect();

        if lost.is_empty() {
            info!(%agent_id, "agent deregistered");
        } else {
            warn!(%agent_id, lost_slots = lost.len(), "agent deregistered with assigned slots");
        }
        Ok(lost)
    }

    /// Record contact from an agent. Returns false for unknown agents.
    pub fn heartbeat(&mut self, agent_id: &str, now: Instant) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.last_heartbeat = now;
                debug!(%agent_id, "heartbeat received");
                true
            }
            None => {
                warn!(%agent_id, "heartbeat from unknown agent");
                false
            }
        }
    }

    /// Agents not heard from within `timeout`, in registration order.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<AgentId> {
        let mut stale: Vec<(&AgentId, &Agent)> = self
            .agents
            .iter()
            .filter(|(_, a)| now.saturating_duration_since(a.last_heartbeat) > timeout)
            .collect();
        stale.sort_by_key(|(_, a)| a.seq);
        stale.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Reserve `count` slots for `task_id`, atomically.
    ///
    /// `next_container` is called once per granted container, in grant
    /// order, only after the reservation is known to succeed.
    pub fn reserve_slots(
        &mut self,
        task_id: &str,
        count: u32,
        constraints: &Constraints,
        mut next_container: impl FnMut() -> ContainerId,
    ) -> RegistryResult<Vec<SlotGrant>> {
        let mut candidates: Vec<(&AgentId, &Agent, u32)> = self
            .agents
            .iter()
            .filter(|(_, a)| a.matches(&constraints.required_labels))
            .map(|(id, a)| (id, a, a.free_count()))
            .filter(|(_, _, free)| *free > 0)
            .collect();
        candidates.sort_by_key(|(_, a, free)| (*free, a.seq));

        let eligible_free: u32 = candidates.iter().map(|(_, _, f)| f).sum();
        let insufficient = || RegistryError::InsufficientCapacity {
            requested: count,
            placement: constraints.placement,
            free: eligible_free,
        };

        if count == 0 {
            return Err(insufficient());
        }

        // Plan first, mutate after, so a failed reservation changes nothing.
        let plan: Vec<(AgentId, Vec<SlotId>)> = match constraints.placement {
            Placement::SingleAgent => {
                let (id, agent, _) = candidates
                    .iter()
                    .find(|(_, _, free)| *free >= count)
                    .ok_or_else(insufficient)?;
                vec![((*id).clone(), agent.free_slot_ids().take(count as usize).collect())]
            }
            Placement::OnePerAgent => {
                if (candidates.len() as u64) < u64::from(count) {
                    return Err(insufficient());
                }
                candidates
                    .iter()
                    .take(count as usize)
                    .map(|(id, agent, _)| ((*id).clone(), agent.free_slot_ids().take(1).collect()))
                    .collect()
            }
        };

        let mut grants = Vec::with_capacity(plan.len());
        for (agent_id, slot_ids) in plan {
            let container_id = next_container();
            if let Some(agent) = self.agents.get_mut(&agent_id) {
                for &slot in &slot_ids {
                    agent.slots[slot as usize] = SlotState::Assigned {
                        task_id: task_id.to_string(),
                        container_id: container_id.clone(),
                    };
                }
            }
            debug!(%task_id, %agent_id, %container_id, slots = ?slot_ids, "slots reserved");
            grants.push(SlotGrant {
                agent_id,
                container_id,
                slots: slot_ids,
            });
        }

        Ok(grants)
    }

    /// Return a single slot to the free pool. No-op for unknown agents or slots.
    pub fn release(&mut self, agent_id: &str, slot_id: SlotId) -> bool {
        let Some(slot) = self
            .agents
            .get_mut(agent_id)
            .and_then(|a| a.slots.get_mut(slot_id as usize))
        else {
            return false;
        };
        let was_assigned = *slot != SlotState::Free;
        *slot = SlotState::Free;
        was_assigned
    }

    /// Free every slot held by `container_id` on `agent_id`.
    ///
    /// Returns the released slot ids; empty if the agent is gone.
    pub fn release_container(&mut self, agent_id: &str, container_id: &str) -> Vec<SlotId> {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return Vec::new();
        };

        let mut released = Vec::new();
        for (i, slot) in agent.slots.iter_mut().enumerate() {
            let held = matches!(
                slot,
                SlotState::Assigned { container_id: c, .. } if c.as_str() == container_id
            );
            if held {
                *slot = SlotState::Free;
                released.push(i as SlotId);
            }
        }
        debug!(%agent_id, %container_id, slots = ?released, "slots released");
        released
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn free_slots(&self, agent_id: &str) -> Option<u32> {
        self.agents.get(agent_id).map(Agent::free_count)
    }

    pub fn total_free(&self) -> u32 {
        self.agents.values().map(Agent::free_count).sum()
    }

    /// Occupancy of one slot.
    pub fn slot(&self, agent_id: &str, slot_id: SlotId) -> Option<&SlotState> {
        self.agents.get(agent_id)?.slots.get(slot_id as usize)
    }

    /// Every assigned slot in the cluster.
    pub fn assignments(&self) -> Vec<SlotAssignment> {
        self.agents
            .iter()
            .flat_map(|(agent_id, agent)| {
                agent.slots.iter().enumerate().filter_map(move |(i, s)| match s {
                    SlotState::Free => None,
                    SlotState::Assigned { task_id, container_id } => Some(SlotAssignment {
                        agent_id: agent_id.clone(),
                        slot_id: i as SlotId,
                        task_id: task_id.clone(),
                        container_id: container_id.clone(),
                    }),
                })
            })
            .collect()
    }

    /// Snapshot of all agents in registration order.
    pub fn agents(&self) -> Vec<AgentSummary> {
        let mut agents: Vec<(&AgentId, &Agent)> = self.agents.iter().collect();
        agents.sort_by_key(|(_, a)| a.seq);
        agents
            .into_iter()
            .map(|(id, a)| AgentSummary {
                id: id.clone(),
                address: a.address.clone(),
                labels: a.labels.clone(),
                total_slots: a.slots.len() as u32,
                free_slots: a.free_count(),
            })
            .collect()
    }

    /// A container's slots must all live on a single agent.
    pub fn check_invariants(&self) -> RegistryResult<()> {
        let mut homes: HashMap<&str, &str> = HashMap::new();
        for (agent_id, agent) in &self.agents {
            for slot in &agent.slots {
                if let SlotState::Assigned { container_id, .. } = slot {
                    if let Some(other) = homes.insert(container_id.as_str(), agent_id.as_str()) {
                        if other != agent_id.as_str() {
                            return Err(RegistryError::Corrupted(format!(
                                "container {container_id} holds slots on both {other} and {agent_id}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(id: &str, slots: u32) -> AgentRegistration {
        AgentRegistration {
            id: id.to_string(),
            address: format!("10.0.0.{}", slots),
            slots,
            labels: HashMap::new(),
        }
    }

    fn test_registry(agents: &[(&str, u32)]) -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        let now = Instant::now();
        for (id, slots) in agents {
            registry.register(reg(id, *slots), now).unwrap();
        }
        registry
    }

    fn single() -> Constraints {
        Constraints::default()
    }

    fn spread() -> Constraints {
        Constraints {
            placement: Placement::OnePerAgent,
            ..Default::default()
        }
    }

    fn ids(prefix: &str) -> impl FnMut() -> ContainerId + '_ {
        let mut n = 0;
        move || {
            n += 1;
            format!("{prefix}-container-{n:04}")
        }
    }

    #[test]
    fn duplicate_agent_rejected() {
        let mut registry = test_registry(&[("a1", 4)]);
        let err = registry.register(reg("a1", 2), Instant::now()).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateAgent("a1".to_string()));
        assert_eq!(registry.free_slots("a1"), Some(4));
    }

    #[test]
    fn zero_slot_agent_rejected() {
        let mut registry = AgentRegistry::new();
        assert!(matches!(
            registry.register(reg("a1", 0), Instant::now()),
            Err(RegistryError::NoSlots(_))
        ));
    }

    #[test]
    fn single_agent_prefers_fewest_free() {
        let mut registry = test_registry(&[("big", 8), ("small", 2), ("mid", 4)]);
        let grants = registry.reserve_slots("t1", 2, &single(), ids("t1")).unwrap();

        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].agent_id, "small");
        assert_eq!(grants[0].slots, vec![0, 1]);
        assert_eq!(registry.free_slots("small"), Some(0));
    }

    #[test]
    fn single_agent_skips_agents_that_cannot_fit() {
        let mut registry = test_registry(&[("big", 8), ("small", 2), ("mid", 4)]);
        let grants = registry.reserve_slots("t1", 3, &single(), ids("t1")).unwrap();
        assert_eq!(grants[0].agent_id, "mid");
    }

    #[test]
    fn ties_broken_by_registration_order() {
        let mut registry = test_registry(&[("zeta", 4), ("alpha", 4)]);
        let grants = registry.reserve_slots("t1", 1, &single(), ids("t1")).unwrap();
        assert_eq!(grants[0].agent_id, "zeta");
    }

    #[test]
    fn insufficient_capacity_leaves_state_unchanged() {
        let mut registry = test_registry(&[("a1", 2), ("a2", 2)]);
        let before = registry.agents();

        let err = registry.reserve_slots("t1", 3, &single(), ids("t1")).unwrap_err();
        assert!(matches!(err, RegistryError::InsufficientCapacity { requested: 3, free: 4, .. }));
        assert_eq!(registry.agents(), before);
    }

    #[test]
    fn one_per_agent_spreads_and_packs() {
        let mut registry = test_registry(&[("a1", 4), ("a2", 1), ("a3", 2)]);
        let grants = registry.reserve_slots("t1", 2, &spread(), ids("t1")).unwrap();

        let agents: Vec<&str> = grants.iter().map(|g| g.agent_id.as_str()).collect();
        assert_eq!(agents, vec!["a2", "a3"]);
        assert!(grants.iter().all(|g| g.slots.len() == 1));
        assert_ne!(grants[0].container_id, grants[1].container_id);
    }

    #[test]
    fn one_per_agent_needs_distinct_agents() {
        let mut registry = test_registry(&[("a1", 8)]);
        assert!(registry.reserve_slots("t1", 2, &spread(), ids("t1")).is_err());
        assert_eq!(registry.free_slots("a1"), Some(8));
    }

    #[test]
    fn container_ids_only_drawn_on_success() {
        let mut registry = test_registry(&[("a1", 1)]);
        let mut drawn = 0;
        let _ = registry.reserve_slots("t1", 2, &single(), || {
            drawn += 1;
            "never".to_string()
        });
        assert_eq!(drawn, 0);
    }

    #[test]
    fn required_labels_filter_candidates() {
        let mut registry = AgentRegistry::new();
        let now = Instant::now();
        let mut gpu = reg("gpu", 4);
        gpu.labels.insert("accel".to_string(), "a100".to_string());
        registry.register(reg("cpu", 1), now).unwrap();
        registry.register(gpu, now).unwrap();

        let constraints = Constraints {
            placement: Placement::SingleAgent,
            required_labels: HashMap::from([("accel".to_string(), "a100".to_string())]),
        };
        let grants = registry.reserve_slots("t1", 1, &constraints, ids("t1")).unwrap();
        assert_eq!(grants[0].agent_id, "gpu");
    }

    #[test]
    fn zero_slot_request_rejected() {
        let mut registry = test_registry(&[("a1", 2)]);
        assert!(registry.reserve_slots("t1", 0, &single(), ids("t1")).is_err());
    }

    #[test]
    fn release_returns_slot_and_ignores_unknown_agent() {
        let mut registry = test_registry(&[("a1", 2)]);
        let grants = registry.reserve_slots("t1", 1, &single(), ids("t1")).unwrap();
        let slot = grants[0].slots[0];

        assert!(registry.release("a1", slot));
        assert!(!registry.release("a1", slot));
        assert!(!registry.release("gone", 0));
        assert_eq!(registry.free_slots("a1"), Some(2));
    }

    #[test]
    fn release_container_frees_all_its_slots() {
        let mut registry = test_registry(&[("a1", 4)]);
        let grants = registry.reserve_slots("t1", 3, &single(), ids("t1")).unwrap();

        let released = registry.release_container("a1", &grants[0].container_id);
        assert_eq!(released, vec![0, 1, 2]);
        assert_eq!(registry.free_slots("a1"), Some(4));
        assert!(registry.release_container("a1", &grants[0].container_id).is_empty());
    }

    #[test]
    fn deregister_reports_assigned_slots() {
        let mut registry = test_registry(&[("a1", 4)]);
        let grants = registry.reserve_slots("t1", 2, &single(), ids("t1")).unwrap();

        let lost = registry.deregister("a1").unwrap();
        assert_eq!(lost.len(), 2);
        assert!(lost.iter().all(|l| l.container_id == grants[0].container_id));
        assert!(!registry.contains("a1"));
        assert!(matches!(registry.deregister("a1"), Err(RegistryError::UnknownAgent(_))));
    }

    #[test]
    fn reregister_after_deregister() {
        let mut registry = test_registry(&[("a1", 4)]);
        registry.deregister("a1").unwrap();
        registry.register(reg("a1", 2), Instant::now()).unwrap();
        assert_eq!(registry.free_slots("a1"), Some(2));
    }

    #[test]
    fn expired_agents_detected() {
        let mut registry = AgentRegistry::new();
        let t0 = Instant::now();
        registry.register(reg("old", 1), t0).unwrap();
        registry.register(reg("fresh", 1), t0).unwrap();

        let later = t0 + Duration::from_secs(40);
        assert!(registry.heartbeat("fresh", later));
        assert!(!registry.heartbeat("ghost", later));

        let expired = registry.expired(later, Duration::from_secs(30));
        assert_eq!(expired, vec!["old".to_string()]);
    }

    #[test]
    fn split_container_detected_as_corruption() {
        let mut registry = test_registry(&[("a1", 1), ("a2", 1)]);
        registry.reserve_slots("t1", 1, &single(), ids("t1")).unwrap();
        assert!(registry.check_invariants().is_ok());

        // Forge the same container on a second agent.
        let forged = SlotState::Assigned {
            task_id: "t1".to_string(),
            container_id: "t1-container-0001".to_string(),
        };
        for agent in registry.agents.values_mut() {
            agent.slots[0] = forged.clone();
        }
        assert!(matches!(
            registry.check_invariants(),
            Err(RegistryError::Corrupted(_))
        ));
    }
}
