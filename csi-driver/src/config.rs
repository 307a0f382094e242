//! Typed driver configuration.
//!
//! Command-line arguments are converted into a [`DriverConfig`] once at
//! startup and validated before any service is built.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::deletion::DeletionConfig;
use crate::error::DriverError;
use crate::topology::EmptyGroupPolicy;
use crate::volume_id::validate_cluster_prefix;

pub const DEFAULT_CLUSTER_PREFIX: &str = "CSI";
pub const DEFAULT_MAX_CONCURRENT_OPS: usize = 10;
pub const DEFAULT_ARRAY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

impl From<ConfigError> for DriverError {
    fn from(e: ConfigError) -> Self {
        DriverError::Configuration(e.to_string())
    }
}

/// Every recognized driver setting.
#[derive(Debug, Clone, Serialize)]
pub struct DriverConfig {
    /// Name reported by GetPluginInfo
    pub driver_name: String,
    /// CSI gRPC endpoint (`unix://` path or TCP address)
    pub csi_endpoint: String,
    /// Array management API address
    pub endpoint: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Controller instance name reported in the plugin info manifest
    pub node_name: String,
    /// Port groups used for new masking views
    pub port_groups: Vec<String>,
    /// Permitted arrays; empty permits all
    pub array_whitelist: Vec<String>,
    /// Tag embedded in every identifier (1 to 3 alphanumerics)
    pub cluster_prefix: String,
    /// Concurrent RPCs admitted before ResourceExhausted
    pub max_concurrent_ops: usize,
    /// Deadline for synchronous array calls
    pub array_timeout: Duration,
    pub metrics_addr: Option<SocketAddr>,
    pub empty_group_policy: EmptyGroupPolicy,
    pub deletion: DeletionConfig,
    /// JSON inventory loaded into the simulated array
    pub simulator_inventory: Option<PathBuf>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: crate::identity::DRIVER_NAME.to_string(),
            csi_endpoint: "unix:///var/run/csi/csi.sock".to_string(),
            endpoint: String::new(),
            user: String::new(),
            password: String::new(),
            node_name: String::new(),
            port_groups: Vec::new(),
            array_whitelist: Vec::new(),
            cluster_prefix: DEFAULT_CLUSTER_PREFIX.to_string(),
            max_concurrent_ops: DEFAULT_MAX_CONCURRENT_OPS,
            array_timeout: DEFAULT_ARRAY_TIMEOUT,
            metrics_addr: None,
            empty_group_policy: EmptyGroupPolicy::default(),
            deletion: DeletionConfig::default(),
            simulator_inventory: None,
        }
    }
}

impl DriverConfig {
    /// Check every field once. The first violation is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.driver_name.is_empty() {
            return Err(ConfigError::invalid("driver_name", "must not be empty"));
        }
        if self.csi_endpoint.is_empty() {
            return Err(ConfigError::invalid("csi_endpoint", "must not be empty"));
        }
        validate_cluster_prefix(&self.cluster_prefix)
            .map_err(|e| ConfigError::invalid("cluster_prefix", e.to_string()))?;
        if self.port_groups.is_empty() {
            return Err(ConfigError::invalid(
                "port_groups",
                "at least one port group is required",
            ));
        }
        if self.max_concurrent_ops == 0 {
            return Err(ConfigError::invalid("max_concurrent_ops", "must be positive"));
        }
        if self.array_timeout.is_zero() {
            return Err(ConfigError::invalid("array_timeout", "must be positive"));
        }
        if self.deletion.max_attempts == 0 {
            return Err(ConfigError::invalid("deletion.max_attempts", "must be positive"));
        }
        if self.deletion.job_poll_attempts == 0 {
            return Err(ConfigError::invalid(
                "deletion.job_poll_attempts",
                "must be positive",
            ));
        }
        if self.deletion.history_capacity == 0 {
            return Err(ConfigError::invalid(
                "deletion.history_capacity",
                "must be positive",
            ));
        }
        Ok(())
    }

    /// Effective configuration as JSON, without the password.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Split a comma or whitespace separated list, dropping empty items.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
