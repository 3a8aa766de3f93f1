//! Error types shared across slotgrid crates.

use thiserror::Error;

/// Errors produced when parsing a `"MIN:MAX"` port range.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("expected port range of format \"MIN:MAX\" but got {0:?}")]
    Malformed(String),

    #[error("invalid minimum port value: {0:?}")]
    InvalidMin(String),

    #[error("invalid maximum port value: {0:?}")]
    InvalidMax(String),

    #[error("port range minimum exceeds maximum ({min} > {max})")]
    Inverted { min: u16, max: u16 },
}

impl PortRangeError {
    /// True for every shape error other than an inverted range.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Self::Inverted { .. })
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unable to convert config to JSON: {0}")]
    Printable(#[from] serde_json::Error),

    #[error("{setting}: {source}")]
    PortRange {
        setting: &'static str,
        #[source]
        source: PortRangeError,
    },

    #[error("TLS cert file not specified")]
    MissingCertFile,

    #[error("TLS key file not specified")]
    MissingKeyFile,

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
