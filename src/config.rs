// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Configuration file types and parsing for mcproxyd.
//!
//! JSON5 configuration format supporting comments and trailing commas. Each
//! proxy instance names its protocol, one upstream interface, and the
//! downstream interfaces to run queriers on; timer values may be overridden
//! per instance.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::Severity;
use crate::proxy::membership_db::ProtocolVersion;
use crate::proxy::timers::TimersValues;

/// Startup configuration (JSON5 file format).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    /// Minimum log severity; defaults to `info`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<Severity>,

    /// Proxy instances to run.
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// One proxy instance as stored in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceConfig {
    /// Instance name for display/logging
    pub name: String,

    /// Group-membership protocol: "igmpv3" or "mldv2"
    pub protocol: ProtocolVersion,

    /// Upstream interface the aggregated subscription is placed on
    pub upstream: String,

    /// Downstream interfaces to act as querier on
    pub downstream: Vec<String>,

    /// Optional protocol timer overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timers: Option<TimerOverrides>,
}

/// Per-instance timer overrides; unset fields keep the RFC defaults.
/// Intervals are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TimerOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robustness: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_response_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_query_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_query_count: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_member_query_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_member_query_count: Option<u8>,
}

impl TimerOverrides {
    /// Produce the effective timer values for a querier.
    pub fn to_timers_values(&self) -> TimersValues {
        let defaults = TimersValues::default();
        let robustness = self.robustness.unwrap_or(defaults.robustness_variable);
        let query_interval = self
            .query_interval
            .map(Duration::from_secs)
            .unwrap_or(defaults.query_interval);
        TimersValues {
            robustness_variable: robustness,
            query_interval,
            query_response_interval: self
                .query_response_interval
                .map(Duration::from_secs)
                .unwrap_or(defaults.query_response_interval),
            startup_query_interval: self
                .startup_query_interval
                .map(Duration::from_secs)
                .unwrap_or(query_interval / 4),
            startup_query_count: self.startup_query_count.unwrap_or(robustness),
            last_member_query_interval: self
                .last_member_query_interval
                .map(Duration::from_secs)
                .unwrap_or(defaults.last_member_query_interval),
            last_member_query_count: self.last_member_query_count.unwrap_or(robustness),
        }
    }
}

impl InstanceConfig {
    /// Effective timer values (overrides applied over RFC defaults).
    pub fn timers_values(&self) -> TimersValues {
        self.timers
            .as_ref()
            .map(TimerOverrides::to_timers_values)
            .unwrap_or_default()
    }
}

impl Config {
    /// Load configuration from a JSON5 file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Serialize to JSON5. The json5 crate has no pretty printer, so output
    /// goes through serde_json; json5 handles comments on the way back in.
    pub fn to_json5(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_json5())
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instances.is_empty() {
            return Err(ConfigError::NoInstances);
        }

        let mut seen_names = HashSet::new();
        for instance in &self.instances {
            if !seen_names.insert(instance.name.as_str()) {
                return Err(ConfigError::DuplicateInstance {
                    name: instance.name.clone(),
                });
            }

            validate_interface_name(&instance.upstream)?;
            if instance.downstream.is_empty() {
                return Err(ConfigError::EmptyDownstream {
                    instance: instance.name.clone(),
                });
            }

            let mut seen_interfaces = HashSet::new();
            seen_interfaces.insert(instance.upstream.as_str());
            for interface in &instance.downstream {
                validate_interface_name(interface)?;
                if !seen_interfaces.insert(interface.as_str()) {
                    return Err(ConfigError::DuplicateInterface {
                        instance: instance.name.clone(),
                        interface: interface.clone(),
                    });
                }
            }

            if let Some(timers) = &instance.timers {
                if timers.robustness == Some(0) {
                    return Err(ConfigError::InvalidTimerValue {
                        instance: instance.name.clone(),
                        reason: "robustness must be at least 1".to_string(),
                    });
                }
                if timers.query_interval == Some(0) || timers.query_response_interval == Some(0) {
                    return Err(ConfigError::InvalidTimerValue {
                        instance: instance.name.clone(),
                        reason: "query intervals must be non-zero".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// All interface names referenced across instances.
    pub fn get_interfaces(&self) -> Vec<String> {
        let mut interfaces: Vec<String> = self
            .instances
            .iter()
            .flat_map(|i| {
                std::iter::once(i.upstream.clone()).chain(i.downstream.iter().cloned())
            })
            .collect();
        interfaces.sort();
        interfaces.dedup();
        interfaces
    }
}

/// Validate an interface name
fn validate_interface_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::InvalidInterfaceName {
            name: name.to_string(),
            reason: "interface name cannot be empty".to_string(),
        });
    }
    if name.len() > 15 {
        // Linux IFNAMSIZ limit
        return Err(ConfigError::InvalidInterfaceName {
            name: name.to_string(),
            reason: "interface name too long (max 15 chars)".to_string(),
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ConfigError::InvalidInterfaceName {
            name: name.to_string(),
            reason: "interface name contains invalid characters".to_string(),
        });
    }
    if name.chars().next().map(|c| c.is_ascii_digit()) == Some(true) {
        return Err(ConfigError::InvalidInterfaceName {
            name: name.to_string(),
            reason: "interface name cannot start with a digit".to_string(),
        });
    }
    Ok(())
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    IoError(std::path::PathBuf, String),
    ParseError(String),
    NoInstances,
    DuplicateInstance {
        name: String,
    },
    EmptyDownstream {
        instance: String,
    },
    DuplicateInterface {
        instance: String,
        interface: String,
    },
    InvalidInterfaceName {
        name: String,
        reason: String,
    },
    InvalidTimerValue {
        instance: String,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, msg) => {
                write!(f, "failed to read config file '{}': {}", path.display(), msg)
            }
            ConfigError::ParseError(msg) => write!(f, "failed to parse config: {}", msg),
            ConfigError::NoInstances => write!(f, "configuration defines no proxy instances"),
            ConfigError::DuplicateInstance { name } => {
                write!(f, "duplicate instance name '{}'", name)
            }
            ConfigError::EmptyDownstream { instance } => {
                write!(f, "instance '{}' has no downstream interfaces", instance)
            }
            ConfigError::DuplicateInterface {
                instance,
                interface,
            } => write!(
                f,
                "instance '{}' references interface '{}' more than once",
                instance, interface
            ),
            ConfigError::InvalidInterfaceName { name, reason } => {
                write!(f, "invalid interface name '{}': {}", name, reason)
            }
            ConfigError::InvalidTimerValue { instance, reason } => {
                write!(f, "invalid timer value in instance '{}': {}", instance, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
