//! Operator configuration

use anyhow::{anyhow, Context, Result};
use operator_lib::controller::ControllerConfig;
use operator_lib::gate::{ProtectedTarget, ProtectedTargets};
use operator_lib::pricing::Provider;
use operator_lib::units::parse_duration;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "COSTOPT_CONFIG";

/// Operator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    /// Lease holder identity; the pod name in a cluster
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// API server port for health, metrics and policy endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Inventory file seeding workloads, utilization and policies
    #[serde(default)]
    pub inventory_path: Option<PathBuf>,

    /// Directory for the durable rollback store and the lease file
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: String,

    #[serde(default = "default_analysis_timeout")]
    pub analysis_timeout: String,

    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: String,

    #[serde(default = "default_fast_store_ttl")]
    pub fast_store_ttl: String,

    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,

    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,

    /// Deny-list entries on top of the built-in ones: `ns`, `ns/name`, `*/key=value`
    #[serde(default)]
    pub protected_targets: Vec<String>,

    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_region")]
    pub region: String,
}

fn default_instance_id() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| "costopt-operator".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/costopt")
}

fn default_reconcile_interval() -> String {
    "30m".to_string()
}

fn default_analysis_timeout() -> String {
    "10s".to_string()
}

fn default_lease_ttl() -> String {
    "15s".to_string()
}

fn default_fast_store_ttl() -> String {
    "7d".to_string()
}

fn default_backoff_base() -> String {
    "30s".to_string()
}

fn default_backoff_max() -> String {
    "30m".to_string()
}

fn default_provider() -> String {
    "aws".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl OperatorConfig {
    /// Load configuration from the optional file and the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::load_from(file)
    }

    /// Environment variables (`COSTOPT__API_PORT`, ...) override the file
    pub fn load_from(file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("COSTOPT")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("protected_targets"),
            )
            .build()
            .context("Failed to read configuration")?;

        let parsed: OperatorConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        parsed.controller_config()?;
        parsed.protected()?;
        Ok(parsed)
    }

    pub fn controller_config(&self) -> Result<ControllerConfig> {
        Ok(ControllerConfig {
            instance_id: self.instance_id.clone(),
            reconcile_interval: duration("reconcile_interval", &self.reconcile_interval)?,
            analysis_timeout: duration("analysis_timeout", &self.analysis_timeout)?,
            lease_ttl: duration("lease_ttl", &self.lease_ttl)?,
            backoff_base: duration("backoff_base", &self.backoff_base)?,
            backoff_max: duration("backoff_max", &self.backoff_max)?,
            provider: self
                .provider
                .parse::<Provider>()
                .map_err(|e| anyhow!(e))
                .context("Invalid provider")?,
            region: self.region.clone(),
        })
    }

    pub fn fast_store_ttl(&self) -> Result<Duration> {
        duration("fast_store_ttl", &self.fast_store_ttl)
    }

    pub fn protected(&self) -> Result<ProtectedTargets> {
        let extra = self
            .protected_targets
            .iter()
            .map(|raw| {
                raw.parse::<ProtectedTarget>()
                    .map_err(|e| anyhow!(e))
                    .with_context(|| format!("Invalid protected target '{}'", raw))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ProtectedTargets::with_extra(extra))
    }

    pub fn rollback_dir(&self) -> PathBuf {
        self.state_dir.join("rollback")
    }

    pub fn lease_path(&self) -> PathBuf {
        self.state_dir.join("leader.json")
    }
}

fn duration(field: &str, raw: &str) -> Result<Duration> {
    parse_duration(raw)
        .filter(|d| !d.is_zero())
        .ok_or_else(|| anyhow!("Invalid duration '{}' for {}", raw, field))
}
