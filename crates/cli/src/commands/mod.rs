pub mod analyze;
pub mod policies;

use anyhow::{bail, Context, Result};
use operator_lib::{OptimizationPolicy, PolicyKey, WorkloadKind, WorkloadRef};
use std::path::Path;

/// Parse `namespace/name`
pub fn parse_policy_ref(raw: &str) -> Result<PolicyKey> {
    match raw.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(PolicyKey::new(ns, name))
        }
        _ => bail!("Invalid policy '{}', expected namespace/name", raw),
    }
}

/// Parse `kind/namespace/name`
pub fn parse_workload_ref(raw: &str) -> Result<WorkloadRef> {
    let parts: Vec<&str> = raw.split('/').collect();
    match parts.as_slice() {
        [kind, ns, name] if !ns.is_empty() && !name.is_empty() => {
            let kind: WorkloadKind = kind.parse().map_err(anyhow::Error::msg)?;
            Ok(WorkloadRef::new(kind, *ns, *name))
        }
        _ => bail!("Invalid workload '{}', expected kind/namespace/name", raw),
    }
}

pub async fn read_policy_file(path: &Path) -> Result<OptimizationPolicy> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid policy in {}", path.display()))
}
