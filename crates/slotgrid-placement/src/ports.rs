//! Port allocator: per-agent arena of port ranges.
//!
//! Distributed backends bind listener ports on every node they run on.
//! Ports are agent-local, so the only invariant is that ranges held on
//! the same agent never overlap. Ranges on different agents may coincide.
//!
//! Requests without explicit bounds get a default block: fixed-width
//! blocks laid out from `default_base`, picked by a per-agent counter
//! that only moves forward, skipping blocks that collide with held ranges.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use slotgrid_core::{AgentId, PortPoolConfig, PortRange, PortRequest, TaskId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortAllocError {
    #[error("port range conflict on agent {agent_id}: {backend} requested {range}, overlaps {held} held by task {held_by}")]
    Conflict {
        agent_id: AgentId,
        backend: String,
        range: PortRange,
        held: PortRange,
        held_by: TaskId,
    },

    #[error("{backend} range {range} lies outside the port domain {domain}")]
    OutOfDomain {
        backend: String,
        range: PortRange,
        domain: PortRange,
    },

    #[error("no free default block for {backend} on agent {agent_id}")]
    Exhausted { agent_id: AgentId, backend: String },

    #[error("port bookkeeping corrupted on agent {agent_id}: {a} overlaps {b}")]
    Corrupted {
        agent_id: AgentId,
        a: PortRange,
        b: PortRange,
    },
}

impl PortAllocError {
    /// Capacity errors are retried on a later scheduling pass.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Exhausted { .. })
    }
}

pub type PortResult<T> = Result<T, PortAllocError>;

/// A range currently held on an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldRange {
    pub task_id: TaskId,
    pub backend: String,
    pub range: PortRange,
}

/// A range confirmed for one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservedRange {
    pub backend: String,
    pub range: PortRange,
}

#[derive(Debug, Default)]
struct AgentPorts {
    held: Vec<HeldRange>,
    next_block: u32,
}

/// Hands out disjoint port ranges per agent.
#[derive(Debug)]
pub struct PortAllocator {
    config: PortPoolConfig,
    agents: BTreeMap<AgentId, AgentPorts>,
}

impl PortAllocator {
    pub fn new(config: PortPoolConfig) -> Self {
        Self {
            config,
            agents: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &PortPoolConfig {
        &self.config
    }

    /// Number of default blocks that fit between `default_base` and the
    /// top of the domain.
    fn block_count(&self) -> u32 {
        let width = u32::from(self.config.default_width.max(1));
        let span = u32::from(self.config.domain_max)
            .saturating_sub(u32::from(self.config.default_base))
            + 1;
        span / width
    }

    fn block(&self, index: u32) -> PortRange {
        let width = u32::from(self.config.default_width.max(1));
        let min = u32::from(self.config.default_base) + index * width;
        // block_count() guarantees the block fits in u16.
        PortRange {
            min: min as u16,
            max: (min + width - 1) as u16,
        }
    }

    /// Check `range` against everything in `taken`.
    fn first_overlap<'a>(range: &PortRange, taken: &'a [HeldRange]) -> Option<&'a HeldRange> {
        taken.iter().find(|h| h.range.overlaps(range))
    }

    /// Reserve ranges for every `(backend, request)` pair on one agent.
    ///
    /// Atomic: on error nothing is held. Results follow request order.
    pub fn reserve(
        &mut self,
        agent_id: &str,
        task_id: &str,
        requests: &[(String, PortRequest)],
    ) -> PortResult<Vec<ReservedRange>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let domain = self.config.domain();
        let (mut taken, mut next_block) = match self.agents.get(agent_id) {
            Some(pool) => (pool.held.clone(), pool.next_block),
            None => (Vec::new(), 0),
        };
        let committed = taken.len();
        let mut confirmed: Vec<Option<PortRange>> = vec![None; requests.len()];

        // Explicit ranges first so default blocks route around them.
        for (i, (backend, request)) in requests.iter().enumerate() {
            let PortRequest::Explicit(range) = request else {
                continue;
            };
            if !range.within(&domain) {
                return Err(PortAllocError::OutOfDomain {
                    backend: backend.clone(),
                    range: *range,
                    domain,
                });
            }
            if let Some(held) = Self::first_overlap(range, &taken) {
                return Err(PortAllocError::Conflict {
                    agent_id: agent_id.to_string(),
                    backend: backend.clone(),
                    range: *range,
                    held: held.range,
                    held_by: held.task_id.clone(),
                });
            }
            taken.push(HeldRange {
                task_id: task_id.to_string(),
                backend: backend.clone(),
                range: *range,
            });
            confirmed[i] = Some(*range);
        }

        let blocks = self.block_count();
        for (i, (backend, request)) in requests.iter().enumerate() {
            if *request != PortRequest::Default {
                continue;
            }
            let found = (0..blocks)
                .map(|step| (next_block + step) % blocks)
                .find(|&idx| Self::first_overlap(&self.block(idx), &taken).is_none());
            let Some(idx) = found else {
                return Err(PortAllocError::Exhausted {
                    agent_id: agent_id.to_string(),
                    backend: backend.clone(),
                });
            };
            let range = self.block(idx);
            next_block = (idx + 1) % blocks;
            taken.push(HeldRange {
                task_id: task_id.to_string(),
                backend: backend.clone(),
                range,
            });
            confirmed[i] = Some(range);
        }

        let new_held = taken.split_off(committed);
        let pool = self.agents.entry(agent_id.to_string()).or_default();
        pool.held.extend(new_held);
        pool.next_block = next_block;

        let reserved: Vec<ReservedRange> = requests
            .iter()
            .zip(confirmed)
            .filter_map(|((backend, _), range)| {
                range.map(|range| ReservedRange {
                    backend: backend.clone(),
                    range,
                })
            })
            .collect();
        debug!(%agent_id, %task_id, ranges = ?reserved, "port ranges reserved");
        Ok(reserved)
    }

    /// Reserve the same requests on several agents; all or nothing.
    pub fn reserve_many(
        &mut self,
        agent_ids: &[AgentId],
        task_id: &str,
        requests: &[(String, PortRequest)],
    ) -> PortResult<BTreeMap<AgentId, Vec<ReservedRange>>> {
        let mut out = BTreeMap::new();
        for agent_id in agent_ids {
            if out.contains_key(agent_id) {
                continue;
            }
            match self.reserve(agent_id, task_id, requests) {
                Ok(ranges) => {
                    out.insert(agent_id.clone(), ranges);
                }
                Err(e) => {
                    for (done, ranges) in &out {
                        let ranges: Vec<PortRange> = ranges.iter().map(|r| r.range).collect();
                        self.release(done, &ranges);
                    }
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    /// Return specific ranges on an agent to the pool. Returns how many
    /// held ranges were removed.
    pub fn release(&mut self, agent_id: &str, ranges: &[PortRange]) -> usize {
        let Some(pool) = self.agents.get_mut(agent_id) else {
            return 0;
        };
        let before = pool.held.len();
        for range in ranges {
            if let Some(pos) = pool.held.iter().position(|h| h.range == *range) {
                pool.held.remove(pos);
            } else {
                warn!(%agent_id, %range, "released a port range that was not held");
            }
        }
        before - pool.held.len()
    }

    /// Release every range held by a task on any agent.
    pub fn release_task(&mut self, task_id: &str) -> usize {
        let mut released = 0;
        for (agent_id, pool) in &mut self.agents {
            let before = pool.held.len();
            pool.held.retain(|h| h.task_id != task_id);
            let n = before - pool.held.len();
            if n > 0 {
                debug!(%agent_id, %task_id, count = n, "port ranges released");
            }
            released += n;
        }
        released
    }

    /// Ranges currently held on an agent.
    pub fn held(&self, agent_id: &str) -> Vec<HeldRange> {
        self.agents
            .get(agent_id)
            .map(|p| p.held.clone())
            .unwrap_or_default()
    }

    /// Verify the ranges held on one agent are pairwise disjoint.
    pub fn check_disjoint(&self, agent_id: &str) -> PortResult<()> {
        let Some(pool) = self.agents.get(agent_id) else {
            return Ok(());
        };
        let mut ranges: Vec<PortRange> = pool.held.iter().map(|h| h.range).collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(PortAllocError::Corrupted {
                    agent_id: agent_id.to_string(),
                    a: pair[0],
                    b: pair[1],
                });
            }
        }
        Ok(())
    }

    /// `check_disjoint` for every agent.
    pub fn check_all(&self) -> PortResult<()> {
        self.agents.keys().try_for_each(|id| self.check_disjoint(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_allocator() -> PortAllocator {
        PortAllocator::new(PortPoolConfig {
            domain_min: 1,
            domain_max: 1299,
            default_base: 1000,
            default_width: 100,
        })
    }

    fn explicit(backend: &str, min: u16, max: u16) -> (String, PortRequest) {
        (backend.to_string(), PortRequest::Explicit(PortRange { min, max }))
    }

    fn default(backend: &str) -> (String, PortRequest) {
        (backend.to_string(), PortRequest::Default)
    }

    #[test]
    fn explicit_ranges_granted_verbatim() {
        let mut ports = test_allocator();
        let got = ports
            .reserve("a1", "t1", &[explicit("nccl", 500, 599)])
            .unwrap();
        assert_eq!(got[0].range, PortRange { min: 500, max: 599 });
        assert_eq!(ports.held("a1").len(), 1);
    }

    #[test]
    fn overlapping_explicit_on_same_agent_conflicts() {
        let mut ports = test_allocator();
        ports.reserve("a1", "t1", &[explicit("nccl", 500, 599)]).unwrap();

        let err = ports
            .reserve("a1", "t2", &[explicit("nccl", 599, 650)])
            .unwrap_err();
        assert!(matches!(&err, PortAllocError::Conflict { held_by, .. } if held_by == "t1"));
        assert!(err.is_capacity());
        assert_eq!(ports.held("a1").len(), 1);
    }

    #[test]
    fn same_range_on_different_agents_is_fine() {
        let mut ports = test_allocator();
        ports.reserve("a1", "t1", &[explicit("nccl", 500, 599)]).unwrap();
        ports.reserve("a2", "t2", &[explicit("nccl", 500, 599)]).unwrap();
    }

    #[test]
    fn defaults_are_successive_blocks() {
        let mut ports = test_allocator();
        let a = ports.reserve("a1", "t1", &[default("nccl"), default("gloo")]).unwrap();
        let b = ports.reserve("a1", "t2", &[default("nccl")]).unwrap();

        assert_eq!(a[0].range, PortRange { min: 1000, max: 1099 });
        assert_eq!(a[1].range, PortRange { min: 1100, max: 1199 });
        assert_eq!(b[0].range, PortRange { min: 1200, max: 1299 });
    }

    #[test]
    fn defaults_route_around_explicit_ranges() {
        let mut ports = test_allocator();
        let got = ports
            .reserve("a1", "t1", &[default("gloo"), explicit("nccl", 1050, 1060)])
            .unwrap();
        assert_eq!(got[0].backend, "gloo");
        assert_eq!(got[0].range, PortRange { min: 1100, max: 1199 });
        assert_eq!(got[1].range, PortRange { min: 1050, max: 1060 });
    }

    #[test]
    fn default_blocks_wrap_and_reuse_released() {
        let mut ports = test_allocator();
        ports.reserve("a1", "t1", &[default("x")]).unwrap();
        ports.reserve("a1", "t2", &[default("x")]).unwrap();
        ports.reserve("a1", "t3", &[default("x")]).unwrap();
        assert!(matches!(
            ports.reserve("a1", "t4", &[default("x")]),
            Err(PortAllocError::Exhausted { .. })
        ));

        assert_eq!(ports.release_task("t1"), 1);
        let got = ports.reserve("a1", "t4", &[default("x")]).unwrap();
        assert_eq!(got[0].range, PortRange { min: 1000, max: 1099 });
    }

    #[test]
    fn out_of_domain_rejected() {
        let mut ports = test_allocator();
        let err = ports
            .reserve("a1", "t1", &[explicit("nccl", 1200, 1400)])
            .unwrap_err();
        assert!(matches!(err, PortAllocError::OutOfDomain { .. }));
        assert!(!err.is_capacity());
    }

    #[test]
    fn failed_reserve_holds_nothing() {
        let mut ports = test_allocator();
        ports.reserve("a1", "t1", &[explicit("a", 100, 200)]).unwrap();
        let err = ports.reserve("a1", "t2", &[explicit("b", 300, 400), explicit("c", 150, 160)]);
        assert!(err.is_err());
        assert_eq!(ports.held("a1").len(), 1);
    }

    #[test]
    fn reserve_many_rolls_back() {
        let mut ports = test_allocator();
        ports.reserve("a2", "t0", &[explicit("nccl", 500, 599)]).unwrap();

        let agents = vec!["a1".to_string(), "a2".to_string()];
        let err = ports.reserve_many(&agents, "t1", &[explicit("nccl", 550, 560)]);
        assert!(err.is_err());
        assert!(ports.held("a1").is_empty());
        assert_eq!(ports.held("a2").len(), 1);
    }

    #[test]
    fn release_specific_ranges() {
        let mut ports = test_allocator();
        let got = ports
            .reserve("a1", "t1", &[explicit("a", 10, 20), explicit("b", 30, 40)])
            .unwrap();
        assert_eq!(ports.release("a1", &[got[0].range]), 1);
        assert_eq!(ports.held("a1").len(), 1);
        assert_eq!(ports.release("a1", &[got[0].range]), 0);
        assert_eq!(ports.release("nobody", &[got[1].range]), 0);
    }

    #[test]
    fn forged_overlap_detected() {
        let mut ports = test_allocator();
        ports.reserve("a1", "t1", &[explicit("a", 10, 20)]).unwrap();
        ports.agents.get_mut("a1").unwrap().held.push(HeldRange {
            task_id: "t2".to_string(),
            backend: "a".to_string(),
            range: PortRange { min: 15, max: 25 },
        });
        assert!(matches!(ports.check_all(), Err(PortAllocError::Corrupted { .. })));
    }
}
