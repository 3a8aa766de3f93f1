//! slotgrid placement: slot and port bookkeeping for the scheduler.
//!
//! This crate holds the two resource arenas the scheduler draws from.
//! Neither does any locking or I/O; the scheduler owns one instance of
//! each and serializes every mutation.
//!
//! # Components
//!
//! - **`registry`**: agents, their slots, heartbeats, bin-packing reservation
//! - **`ports`**: per-agent port ranges for distributed-communication backends

pub mod ports;
pub mod registry;

pub use ports::{HeldRange, PortAllocError, PortAllocator, PortResult, ReservedRange};
pub use registry::{
    AgentRegistry, AgentSummary, Constraints, RegistryError, RegistryResult, SlotAssignment,
    SlotGrant, SlotState,
};
