//! Failover configuration management

use crate::error::{ElectionError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest lease TTL a node may be configured with, in seconds
pub const MIN_LEASE_TTL_SECONDS: u64 = 3;

/// Default coordination store endpoint
pub const DEFAULT_CLUSTER_URL: &str = "127.0.0.1:2379";

/// Interval between two liveness probes of a healthy session
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(5000);

/// Interval between two liveness probes while the store is unreachable
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// Failover configuration, read from the `[failover]` table of a node config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Whether leader election is enabled for this node
    pub enable: bool,

    /// Address of the coordination store
    pub cluster_url: String,

    /// Stable identity of this node among the candidates
    pub member_id: String,

    /// Lease TTL in seconds backing the leader key
    pub lease_ttl: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enable: false,
            cluster_url: DEFAULT_CLUSTER_URL.to_string(),
            member_id: String::new(),
            lease_ttl: MIN_LEASE_TTL_SECONDS,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    failover: FailoverConfig,
}

impl FailoverConfig {
    /// Create an enabled configuration for the given member
    pub fn new<T: Into<String>>(member_id: T) -> Self {
        Self {
            enable: true,
            member_id: member_id.into(),
            ..Self::default()
        }
    }

    /// Set the lease TTL in seconds
    pub fn with_lease_ttl(mut self, lease_ttl: u64) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Set the coordination store endpoint
    pub fn with_cluster_url<T: Into<String>>(mut self, cluster_url: T) -> Self {
        self.cluster_url = cluster_url.into();
        self
    }

    /// Load the `[failover]` table from a TOML file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ElectionError::configuration(format!("Failed to read config file: {}", e))
        })?;

        Self::from_toml_str(&content)
    }

    /// Parse the `[failover]` table from TOML text. A missing table yields the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| ElectionError::configuration(format!("Failed to parse config: {}", e)))?;

        Ok(file.failover)
    }

    /// Save configuration to file under a `[failover]` table
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let file = ConfigFile {
            failover: self.clone(),
        };
        let content = toml::to_string_pretty(&file).map_err(|e| {
            ElectionError::configuration(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, content).map_err(|e| {
            ElectionError::configuration(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate configuration.
    ///
    /// Components that only observe leaders may skip the member id check.
    pub fn validate(&self, enforce_member_id: bool) -> Result<()> {
        if !self.enable {
            return Ok(());
        }

        if enforce_member_id && self.member_id.is_empty() {
            return Err(ElectionError::configuration(
                "failover.member_id must be non-empty",
            ));
        }

        if self.lease_ttl < MIN_LEASE_TTL_SECONDS {
            return Err(ElectionError::configuration(format!(
                "Please set failover.lease_ttl to no less than {} seconds",
                MIN_LEASE_TTL_SECONDS
            )));
        }

        if self.cluster_url.is_empty() {
            return Err(ElectionError::configuration(
                "failover.cluster_url cannot be empty",
            ));
        }

        Ok(())
    }

    /// Cadence of lease renewals: one second shorter than the TTL, never below one second
    pub fn keep_alive_cadence(&self) -> Duration {
        keep_alive_cadence(self.lease_ttl)
    }

    /// Interval of the campaign retry timer
    pub fn retry_interval(&self) -> Duration {
        retry_interval(self.lease_ttl)
    }
}

pub(crate) fn keep_alive_cadence(lease_ttl: u64) -> Duration {
    Duration::from_secs(lease_ttl.saturating_sub(1).max(1))
}

pub(crate) fn retry_interval(lease_ttl: u64) -> Duration {
    Duration::from_millis(lease_ttl.saturating_mul(1000))
}

/// Timing of the connection-health loop of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Probe interval while the store is healthy
    pub health_check_interval: Duration,

    /// Probe interval while waiting for the store to come back
    pub reconnect_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            health_check_interval: HEALTH_CHECK_INTERVAL,
            reconnect_interval: RECONNECT_INTERVAL,
        }
    }
}
