//! slotgrid-scheduler: task admission, slot matching, container
//! lifecycle and log normalization.
//!
//! Turns `TaskSpec`s into containers on agent slots. The scheduler:
//!
//! - Validates tasks at submission and queues them FIFO
//! - Reserves slots and per-agent port ranges in one atomic step
//! - Tracks every container from `assigned` to a terminal state
//! - Fails a task on its first failed container and stops the rest
//! - Normalizes agent log events into single-line records
//!
//! # Architecture
//!
//! ```text
//! SchedulerService (tokio actor, serialized request queue)
//!   └── ResourceProvider (sole owner of mutable state)
//!       ├── AgentRegistry (slot arena, bin-packing)
//!       ├── PortAllocator (per-agent port ranges)
//!       ├── Task + TaskJoin (per-task fan-in)
//!       └── Container (forward-only state machine, log history)
//! ```

pub mod container;
pub mod error;
pub mod logs;
pub mod provider;
pub mod service;
pub mod task;

pub use container::{Container, Transition};
pub use error::{AdmissionError, SchedulerError, SchedulerResult};
pub use logs::{LogEvent, LogEventError, LogPayload, LogRecord, RawLogEvent, format_line};
pub use provider::{AgentCommand, ContainerEvent, ProviderConfig, ReapReport, ResourceProvider};
pub use service::{SchedulerHandle, SchedulerService, ServiceChannels, ServiceConfig};
pub use task::{ContainerSnapshot, TaskJoin, TaskSnapshot, TaskUpdate};
