//! Startup configuration for the master and its agents.
//!
//! Validation never stops at the first problem: every `validate()` returns
//! the full list of errors so operators can fix a config in one pass.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ports::{PortRange, parse_range, validate_range};

/// slotgrid.toml: master process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct MasterConfig {
    pub master: MasterSection,
    pub ports: PortPoolConfig,
    pub trial_runner: TrialRunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MasterSection {
    pub host: String,
    pub port: u16,
    /// Agents silent for longer than this are deregistered.
    pub heartbeat_timeout_secs: u64,
    /// How long a killed container may take to confirm before it is lost.
    pub kill_timeout_secs: u64,
    /// How often the reaper checks heartbeat and kill deadlines.
    pub reaper_interval_secs: u64,
    /// Finished tasks kept for queries. Older ones are forgotten.
    pub retained_tasks: usize,
}

impl Default for MasterSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            heartbeat_timeout_secs: 30,
            kill_timeout_secs: 60,
            reaper_interval_secs: 5,
            retained_tasks: 1000,
        }
    }
}

/// Port domain and default-block settings for the port allocator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PortPoolConfig {
    pub domain_min: u16,
    pub domain_max: u16,
    /// First port of default block 0.
    pub default_base: u16,
    /// Width of each default block.
    pub default_width: u16,
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            domain_min: 1,
            domain_max: u16::MAX,
            default_base: 29400,
            default_width: 100,
        }
    }
}

impl PortPoolConfig {
    pub fn domain(&self) -> PortRange {
        PortRange {
            min: self.domain_min,
            max: self.domain_max,
        }
    }

    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errs = Vec::new();
        if self.domain_min == 0 {
            errs.push(ConfigError::Invalid {
                field: "ports.domain_min",
                reason: "port 0 is not assignable".to_string(),
            });
        }
        if self.domain_min > self.domain_max {
            errs.push(ConfigError::Invalid {
                field: "ports.domain_min",
                reason: format!("{} exceeds domain_max {}", self.domain_min, self.domain_max),
            });
        }
        if self.default_width == 0 {
            errs.push(ConfigError::Invalid {
                field: "ports.default_width",
                reason: "must be at least 1".to_string(),
            });
        }
        let block_end =
            u32::from(self.default_base) + u32::from(self.default_width).saturating_sub(1);
        if self.default_base < self.domain_min || block_end > u32::from(self.domain_max) {
            errs.push(ConfigError::Invalid {
                field: "ports.default_base",
                reason: format!(
                    "first default block {}..={} lies outside the port domain {}",
                    self.default_base,
                    block_end,
                    self.domain()
                ),
            });
        }
        errs
    }
}

/// Port ranges and network settings handed to distributed workloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TrialRunnerConfig {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub network_interface: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub nccl_port_range: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub gloo_port_range: String,
}

impl TrialRunnerConfig {
    /// Validate both backend ranges independently.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errs = Vec::new();
        for (setting, text) in [
            ("nccl_port_range", &self.nccl_port_range),
            ("gloo_port_range", &self.gloo_port_range),
        ] {
            errs.extend(
                validate_range(text)
                    .into_iter()
                    .map(|source| ConfigError::PortRange { setting, source }),
            );
        }
        errs
    }

    /// Configured range for a backend name (`nccl` or `gloo`), if any.
    ///
    /// Only meaningful after `validate()` passed; invalid text yields `None`.
    pub fn backend_range(&self, backend: &str) -> Option<PortRange> {
        let text = match backend {
            "nccl" => &self.nccl_port_range,
            "gloo" => &self.gloo_port_range,
            _ => return None,
        };
        parse_range(text).ok().flatten()
    }
}

impl MasterConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errs = Vec::new();
        if self.master.heartbeat_timeout_secs == 0 {
            errs.push(ConfigError::Invalid {
                field: "master.heartbeat_timeout_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.master.reaper_interval_secs == 0 {
            errs.push(ConfigError::Invalid {
                field: "master.reaper_interval_secs",
                reason: "must be positive".to_string(),
            });
        }
        errs.extend(self.ports.validate());
        errs.extend(self.trial_runner.validate());
        errs
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.master.heartbeat_timeout_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.master.kill_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.master.reaper_interval_secs)
    }
}

/// Options for an agent process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentOptions {
    pub config_file: String,

    pub master_host: String,
    pub master_port: u16,
    pub agent_id: String,
    pub artificial_slots: u32,

    pub label: String,

    pub api_enabled: bool,
    pub bind_ip: String,
    pub bind_port: u16,

    pub tls: bool,
    pub cert_file: String,
    pub key_file: String,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            config_file: String::new(),
            master_host: "localhost".to_string(),
            master_port: 8080,
            agent_id: String::new(),
            artificial_slots: 0,
            label: String::new(),
            api_enabled: false,
            bind_ip: "0.0.0.0".to_string(),
            bind_port: 9090,
            tls: false,
            cert_file: String::new(),
            key_file: String::new(),
        }
    }
}

impl AgentOptions {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut opts: AgentOptions = toml::from_str(&content)?;
        if opts.config_file.is_empty() {
            opts.config_file = path.display().to_string();
        }
        Ok(opts)
    }

    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errs = Vec::new();
        if let Err(e) = self.validate_tls() {
            errs.push(e);
        }
        if self.master_host.is_empty() {
            errs.push(ConfigError::Invalid {
                field: "master_host",
                reason: "must not be empty".to_string(),
            });
        }
        errs
    }

    /// Cert and key are only required when the API is served over TLS.
    fn validate_tls(&self) -> Result<(), ConfigError> {
        if !self.tls || !self.api_enabled {
            return Ok(());
        }
        if self.cert_file.is_empty() {
            return Err(ConfigError::MissingCertFile);
        }
        if self.key_file.is_empty() {
            return Err(ConfigError::MissingKeyFile);
        }
        Ok(())
    }

    /// JSON text form for diagnostics.
    pub fn printable(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortRangeError;

    #[test]
    fn empty_trial_runner_config_is_valid() {
        assert!(TrialRunnerConfig::default().validate().is_empty());
    }

    #[test]
    fn trial_runner_errors_are_aggregated() {
        let trc = TrialRunnerConfig {
            network_interface: String::new(),
            nccl_port_range: "9000:8000".to_string(),
            gloo_port_range: "nope".to_string(),
        };
        let errs = trc.validate();
        assert_eq!(errs.len(), 2);
        assert!(matches!(
            &errs[0],
            ConfigError::PortRange {
                setting: "nccl_port_range",
                source: PortRangeError::Inverted { .. }
            }
        ));
        assert!(matches!(
            &errs[1],
            ConfigError::PortRange {
                setting: "gloo_port_range",
                source: PortRangeError::Malformed(_)
            }
        ));
        assert_eq!(
            errs[0].to_string(),
            "nccl_port_range: port range minimum exceeds maximum (9000 > 8000)"
        );
    }

    #[test]
    fn backend_range_lookup() {
        let trc = TrialRunnerConfig {
            nccl_port_range: "30000:30100".to_string(),
            ..Default::default()
        };
        assert_eq!(
            trc.backend_range("nccl"),
            Some(PortRange { min: 30000, max: 30100 })
        );
        assert_eq!(trc.backend_range("gloo"), None);
        assert_eq!(trc.backend_range("mpi"), None);
    }

    #[test]
    fn tls_requires_cert_and_key_when_api_enabled() {
        let mut opts = AgentOptions {
            tls: true,
            api_enabled: true,
            ..Default::default()
        };
        assert!(matches!(opts.validate().as_slice(), [ConfigError::MissingCertFile]));

        opts.cert_file = "/etc/agent/cert.pem".to_string();
        assert!(matches!(opts.validate().as_slice(), [ConfigError::MissingKeyFile]));

        opts.key_file = "/etc/agent/key.pem".to_string();
        assert!(opts.validate().is_empty());
    }

    #[test]
    fn tls_without_api_needs_no_files() {
        let opts = AgentOptions {
            tls: true,
            api_enabled: false,
            ..Default::default()
        };
        assert!(opts.validate().is_empty());
    }

    #[test]
    fn printable_is_json() {
        let opts = AgentOptions {
            agent_id: "agent-1".to_string(),
            ..Default::default()
        };
        let text = opts.printable().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["agent_id"], "agent-1");
        assert_eq!(value["master_port"], 8080);
    }

    #[test]
    fn parse_minimal_master_config() {
        let config = MasterConfig::parse(
            r#"
[master]
port = 9000

[trial_runner]
nccl_port_range = "30000:30100"
"#,
        )
        .unwrap();
        assert_eq!(config.master.port, 9000);
        assert_eq!(config.master.heartbeat_timeout_secs, 30);
        assert_eq!(config.master.retained_tasks, 1000);
        assert_eq!(config.ports, PortPoolConfig::default());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn master_config_collects_all_errors() {
        let mut config = MasterConfig::default();
        config.master.reaper_interval_secs = 0;
        config.ports.default_width = 0;
        config.trial_runner.gloo_port_range = "1:x".to_string();
        assert_eq!(config.validate().len(), 3);
    }

    #[test]
    fn default_block_outside_domain_rejected() {
        let ports = PortPoolConfig {
            domain_min: 1000,
            domain_max: 2000,
            default_base: 1950,
            default_width: 100,
        };
        assert_eq!(ports.validate().len(), 1);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "agent_id = \"gpu-7\"\nartificial_slots = 4\n").unwrap();

        let opts = AgentOptions::from_file(&path).unwrap();
        assert_eq!(opts.agent_id, "gpu-7");
        assert_eq!(opts.artificial_slots, 4);
        assert_eq!(opts.config_file, path.display().to_string());
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = MasterConfig::from_file(Path::new("/nonexistent/slotgrid.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read(_)));
    }
}
