//! Scheduler error types.

use thiserror::Error;

use slotgrid_core::{ContainerId, PortRange, PortRangeError, TaskId};
use slotgrid_placement::{PortAllocError, RegistryError};

use crate::logs::LogEventError;

/// Reasons a task spec is refused at submission.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("task must request at least one slot")]
    ZeroSlots,

    #[error("task image must not be empty")]
    EmptyImage,

    #[error("port range backend name must not be empty")]
    EmptyBackend,

    #[error("invalid port range for backend {backend}: {source}")]
    PortRange {
        backend: String,
        #[source]
        source: PortRangeError,
    },

    #[error("port range {range} for backend {backend} lies outside the port domain {domain}")]
    OutOfDomain {
        backend: String,
        range: PortRange,
        domain: PortRange,
    },

    #[error("port ranges for backends {a} and {b} overlap")]
    OverlappingBackends { a: String, b: String },
}

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task rejected: {0}")]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Registry(RegistryError),

    #[error(transparent)]
    Ports(#[from] PortAllocError),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("container not found: {0}")]
    ContainerNotFound(ContainerId),

    #[error("rejected log event: {0}")]
    LogEvent(#[from] LogEventError),

    /// Slot or port bookkeeping no longer matches container records.
    #[error("scheduler state corrupted: {0}")]
    Corrupted(String),

    #[error("scheduler service stopped")]
    ServiceStopped,
}

impl From<RegistryError> for SchedulerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Corrupted(msg) => SchedulerError::Corrupted(msg),
            other => SchedulerError::Registry(other),
        }
    }
}

impl SchedulerError {
    /// Only corruption stops the scheduler; everything else is per-request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SchedulerError::Corrupted(_))
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
