//! Policy commands against a running operator

use anyhow::Result;
use colored::Colorize;
use operator_lib::OptimizationPolicy;
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;

use super::{parse_policy_ref, read_policy_file};
use crate::client::{ApiClient, DeleteOutcome};
use crate::output::{
    color_phase, format_currency, print_info, print_json, print_success, print_table,
    print_warning, OutputFormat,
};

/// Row for policies table
#[derive(Tabled)]
struct PolicyRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Type")]
    optimization_type: String,
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "Applied")]
    applied: u64,
    #[tabled(rename = "Savings")]
    savings: String,
}

impl From<&OptimizationPolicy> for PolicyRow {
    fn from(p: &OptimizationPolicy) -> Self {
        Self {
            namespace: p.metadata.namespace.clone(),
            name: p.metadata.name.clone(),
            target: p
                .spec
                .target_workload
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            optimization_type: p
                .spec
                .optimization_type
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            phase: color_phase(p.status.phase),
            applied: p.status.applied_optimizations,
            savings: format_currency(p.status.total_savings),
        }
    }
}

/// Row for savings table
#[derive(Tabled)]
struct SavingsRow {
    #[tabled(rename = "Policy")]
    policy: String,
    #[tabled(rename = "Applied")]
    applied: u64,
    #[tabled(rename = "Realized/mo")]
    realized: String,
    #[tabled(rename = "Pending/mo")]
    potential: String,
}

#[derive(Debug, Default, Serialize)]
pub struct SavingsSummary {
    pub policies: usize,
    pub applied_optimizations: u64,
    pub realized_monthly: f64,
    pub potential_monthly: f64,
}

/// Realized savings come from status; pending ones from recommendations not yet applied
pub fn summarize(policies: &[OptimizationPolicy]) -> SavingsSummary {
    let mut summary = SavingsSummary {
        policies: policies.len(),
        ..SavingsSummary::default()
    };
    for p in policies {
        summary.applied_optimizations += p.status.applied_optimizations;
        summary.realized_monthly += p.status.total_savings;
        summary.potential_monthly += pending_savings(p);
    }
    summary
}

fn pending_savings(policy: &OptimizationPolicy) -> f64 {
    match &policy.status.current_recommendation {
        Some(rec)
            if policy.status.applied_recommendation_id.as_deref() != Some(rec.id.as_str()) =>
        {
            rec.monthly_savings
        }
        _ => 0.0,
    }
}

pub async fn get_policies(
    client: &ApiClient,
    namespace: Option<String>,
    phase: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let policies: Vec<OptimizationPolicy> = client
        .list_policies()
        .await?
        .into_iter()
        .filter(|p| {
            namespace
                .as_ref()
                .map(|ns| &p.metadata.namespace == ns)
                .unwrap_or(true)
        })
        .filter(|p| {
            phase
                .as_ref()
                .map(|ph| p.status.phase.as_str().eq_ignore_ascii_case(ph))
                .unwrap_or(true)
        })
        .collect();

    match format {
        OutputFormat::Json => print_json(&policies)?,
        OutputFormat::Table => {
            let rows: Vec<PolicyRow> = policies.iter().map(PolicyRow::from).collect();
            print_table(&rows);
        }
    }
    Ok(())
}

pub async fn get_policy(client: &ApiClient, policy: &str, format: OutputFormat) -> Result<()> {
    let key = parse_policy_ref(policy)?;
    let Some(policy) = client.get_policy(&key).await? else {
        anyhow::bail!("Policy {} not found", key);
    };

    match format {
        OutputFormat::Json => print_json(&policy)?,
        OutputFormat::Table => print_policy_detail(&policy),
    }
    Ok(())
}

fn print_policy_detail(policy: &OptimizationPolicy) {
    let spec = &policy.spec;
    let status = &policy.status;

    println!("{}", format!("Policy {}", policy.key()).bold());
    println!("{}", "=".repeat(50));
    if let Some(target) = &spec.target_workload {
        println!("Target:                 {}", target.to_string().cyan());
    }
    if let Some(t) = spec.optimization_type {
        println!("Type:                   {}", t);
    }
    println!(
        "Mode:                   {}",
        if spec.dry_run {
            "dry-run"
        } else if spec.auto_apply {
            "auto-apply"
        } else {
            "manual"
        }
    );
    println!(
        "Limits:                 change <= {}%, confidence >= {:.2}, risk <= {}",
        spec.max_change_percent, spec.min_confidence, spec.max_risk_level
    );
    println!();

    println!("{}", "Status".bold());
    println!("{}", "-".repeat(50));
    println!("Phase:                  {}", color_phase(status.phase));
    println!(
        "Generation:             {} (observed {})",
        policy.metadata.generation, status.observed_generation
    );
    println!("Applied optimizations:  {}", status.applied_optimizations);
    println!(
        "Total savings:          {}",
        format_currency(status.total_savings).green()
    );
    if let Some(message) = &status.message {
        println!("Message:                {}", message);
    }
    if let Some(reason) = &status.skip_reason {
        println!("Skipped:                {}", reason.yellow());
    }
    if let Some(at) = status.last_analysis {
        println!("Last analysis:          {}", at.to_rfc3339().dimmed());
    }
    if let Some(at) = status.last_applied {
        println!("Last applied:           {}", at.to_rfc3339().dimmed());
    }

    if let Some(rec) = &status.current_recommendation {
        println!();
        println!("{}", "Current recommendation".bold());
        println!("{}", "-".repeat(50));
        println!("{}", rec.title);
        println!("  {}", rec.description.dimmed());
        println!(
            "  Savings {} /mo ({:.1}%), confidence {:.0}%, risk {}",
            format_currency(rec.monthly_savings).green(),
            rec.savings_percentage,
            rec.confidence * 100.0,
            rec.risk.level
        );
    }

    if let Some(warning) = &status.rollback_warning {
        println!();
        print_warning(warning);
    }
    if let Some(err) = &status.last_error {
        println!();
        print_warning(&format!("{}: {}", err.class, err.message));
    }
    if status.requires_intervention {
        print_warning("Manual intervention required; see the last error");
    }
}

/// Create the policy, or update its spec when it already exists
pub async fn apply_policy(client: &ApiClient, file: &Path, format: OutputFormat) -> Result<()> {
    let policy = read_policy_file(file).await?;
    let key = policy.key();

    let (result, verb) = match client.get_policy(&key).await? {
        Some(_) => (client.update_policy(&key, &policy.spec).await?, "configured"),
        None => (client.create_policy(&policy).await?, "created"),
    };

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => print_success(&format!(
            "Policy {} {} (generation {})",
            key, verb, result.metadata.generation
        )),
    }
    Ok(())
}

pub async fn delete_policy(
    client: &ApiClient,
    policy: &str,
    force: bool,
    format: OutputFormat,
) -> Result<()> {
    let key = parse_policy_ref(policy)?;
    let outcome = client.delete_policy(&key, force).await?;

    match (outcome, format) {
        (DeleteOutcome::Pending(policy), OutputFormat::Json) => print_json(&policy)?,
        (DeleteOutcome::Pending(policy), OutputFormat::Table) => {
            if policy.status.applied_recommendation_id.is_some() {
                print_info(&format!(
                    "Policy {} marked for deletion; applied changes will be rolled back first",
                    key
                ));
            } else {
                print_success(&format!("Policy {} marked for deletion", key));
            }
        }
        (DeleteOutcome::Removed, OutputFormat::Json) => {
            print_json(&serde_json::json!({ "deleted": key.to_string() }))?
        }
        (DeleteOutcome::Removed, OutputFormat::Table) => {
            print_warning(&format!("Policy {} removed without rollback", key))
        }
    }
    Ok(())
}

pub async fn show_savings(
    client: &ApiClient,
    namespace: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let policies: Vec<OptimizationPolicy> = client
        .list_policies()
        .await?
        .into_iter()
        .filter(|p| {
            namespace
                .as_ref()
                .map(|ns| &p.metadata.namespace == ns)
                .unwrap_or(true)
        })
        .collect();
    let summary = summarize(&policies);

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Table => {
            let rows: Vec<SavingsRow> = policies
                .iter()
                .map(|p| SavingsRow {
                    policy: p.key().to_string(),
                    applied: p.status.applied_optimizations,
                    realized: format_currency(p.status.total_savings),
                    potential: format_currency(pending_savings(p)),
                })
                .collect();
            print_table(&rows);
            println!();
            println!(
                "{}  {} /mo across {} policies",
                "Realized savings:".bold(),
                format_currency(summary.realized_monthly).green().bold(),
                summary.policies
            );
            println!(
                "{}   {} /mo",
                "Pending savings:".bold(),
                format_currency(summary.potential_monthly).yellow()
            );
        }
    }
    Ok(())
}
