//! slotgrid-core: shared types for the slotgrid control plane.
//!
//! Everything the placement and scheduler crates agree on lives here:
//! identifiers, task and container lifecycles, port ranges, and the
//! configuration objects consumed at startup.

pub mod config;
pub mod error;
pub mod ports;
pub mod types;

pub use config::{AgentOptions, MasterConfig, MasterSection, PortPoolConfig, TrialRunnerConfig};
pub use error::{ConfigError, PortRangeError};
pub use ports::{PortRange, parse_range, validate_range};
pub use types::*;
