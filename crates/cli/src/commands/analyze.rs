//! Offline commands: admission checks and engine runs against an inventory file

use anyhow::{anyhow, bail, Context, Result};
use colored::Colorize;
use operator_lib::{
    engine::{AnalysisInput, RecommendationEngine},
    gate::{apply_admission_defaults, GateViolation, PolicyGate, ProtectedTarget, ProtectedTargets},
    inventory::Inventory,
    pricing::{PriceBook, Provider, StaticPriceCatalog},
    OptimizationType, OptimizerError, Recommendation, WorkloadSpec,
};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tabled::Tabled;

use super::{parse_workload_ref, read_policy_file};
use crate::client::ApiClient;
use crate::output::{
    color_confidence, color_risk, format_currency, print_error, print_info, print_json,
    print_success, print_table, print_warning, OutputFormat,
};

const PRICE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
pub struct LocalValidation {
    pub allowed: bool,
    pub code: u16,
    pub violations: Vec<String>,
}

/// Same status mapping as the operator's admission endpoint
pub fn validation_result(violations: &[GateViolation]) -> LocalValidation {
    let code = if violations.is_empty() {
        200
    } else if violations.iter().any(GateViolation::is_protected_target) {
        403
    } else {
        400
    };
    LocalValidation {
        allowed: violations.is_empty(),
        code,
        violations: violations.iter().map(|v| v.to_string()).collect(),
    }
}

pub async fn validate_local(
    file: &Path,
    inventory: Option<&Path>,
    protected: &[String],
    format: OutputFormat,
) -> Result<()> {
    let mut policy = read_policy_file(file).await?;
    apply_admission_defaults(&mut policy);

    let inventory = match inventory {
        Some(path) => Some(load_inventory(path).await?),
        None => None,
    };
    let workload: Option<&WorkloadSpec> = match (&inventory, &policy.spec.target_workload) {
        (Some(inv), Some(target)) => inv.workload(target),
        _ => None,
    };

    let extra = protected
        .iter()
        .map(|raw| {
            raw.parse::<ProtectedTarget>()
                .map_err(|e| anyhow!(e))
                .with_context(|| format!("Invalid protected target '{}'", raw))
        })
        .collect::<Result<Vec<_>>>()?;
    let gate = PolicyGate::new(ProtectedTargets::with_extra(extra));
    let result = validation_result(&gate.violations(&policy, workload));

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            if result.allowed {
                print_success(&format!("Policy {} is valid", policy.key()));
            } else {
                for violation in &result.violations {
                    print_error(violation);
                }
            }
        }
    }

    if !result.allowed {
        bail!("Policy {} rejected ({})", policy.key(), result.code);
    }
    Ok(())
}

pub async fn validate_remote(client: &ApiClient, file: &Path, format: OutputFormat) -> Result<()> {
    let policy = read_policy_file(file).await?;
    let response = client.validate(&policy).await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table if response.allowed => {
            print_success(&format!("Policy {} is valid", policy.key()))
        }
        OutputFormat::Table => print_error(&response.message),
    }

    if !response.allowed {
        bail!("Policy {} rejected ({})", policy.key(), response.code);
    }
    Ok(())
}

pub struct AnalyzeOptions {
    pub workload: Option<String>,
    pub optimization_type: String,
    pub provider: String,
    pub region: String,
}

/// Row for recommendations table
#[derive(Tabled)]
struct RecommendationRow {
    #[tabled(rename = "Workload")]
    workload: String,
    #[tabled(rename = "Type")]
    optimization_type: String,
    #[tabled(rename = "Savings/mo")]
    savings: String,
    #[tabled(rename = "Savings %")]
    savings_percentage: String,
    #[tabled(rename = "Change")]
    change: String,
    #[tabled(rename = "Confidence")]
    confidence: String,
    #[tabled(rename = "Risk")]
    risk: String,
    #[tabled(rename = "ID")]
    id: String,
}

impl From<&Recommendation> for RecommendationRow {
    fn from(rec: &Recommendation) -> Self {
        Self {
            workload: rec
                .workload
                .as_ref()
                .map(|w| w.to_string())
                .unwrap_or_else(|| "(cluster)".to_string()),
            optimization_type: rec.optimization_type.to_string(),
            savings: format_currency(rec.monthly_savings),
            savings_percentage: format!("{:.1}%", rec.savings_percentage),
            change: format!("{:.1}%", rec.change_percent),
            confidence: color_confidence(rec.confidence),
            risk: color_risk(rec.risk.level),
            id: rec.id.clone(),
        }
    }
}

/// Analyze every workload in the inventory (or one), plus node consolidation
pub async fn run_analysis(
    inventory: &Inventory,
    options: &AnalyzeOptions,
) -> Result<(Vec<Recommendation>, Vec<String>)> {
    let optimization_type: OptimizationType = options
        .optimization_type
        .parse()
        .map_err(|e: String| anyhow!(e))?;
    let provider: Provider = options.provider.parse().map_err(|e: String| anyhow!(e))?;

    let targets: Vec<&WorkloadSpec> = match &options.workload {
        Some(raw) => {
            let target = parse_workload_ref(raw)?;
            let found = inventory
                .workload(&target)
                .with_context(|| format!("Workload {} is not in the inventory", target))?;
            vec![found]
        }
        None => inventory.workloads.iter().collect(),
    };

    let (prices, pricing_error) = PriceBook::resolve(
        &StaticPriceCatalog,
        provider,
        &options.region,
        None,
        PRICE_LOOKUP_TIMEOUT,
    )
    .await;

    let mut notes = Vec::new();
    if let Some(err) = pricing_error {
        notes.push(format!("Using fallback pricing: {}", err));
    }

    let engine = RecommendationEngine::default();
    let mut recommendations = Vec::new();
    for workload in targets {
        let samples = inventory.samples_for(&workload.reference);
        let min_replicas = inventory
            .budget_for(&workload.reference)
            .and_then(|b| b.min_available)
            .unwrap_or(1);
        let input = AnalysisInput {
            workload,
            samples: &samples,
            prices: &prices,
            optimization_type,
            min_replicas,
        };
        match engine.analyze(&input) {
            Ok(found) => recommendations.extend(found),
            Err(OptimizerError::InsufficientData(reason)) => {
                notes.push(format!("{}: {}", workload.reference, reason));
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Analysis of {} failed", workload.reference))
            }
        }
    }

    if options.workload.is_none()
        && optimization_type.accepts(OptimizationType::NodeConsolidation)
    {
        recommendations.extend(engine.analyze_cluster(&inventory.snapshot(), &prices));
    }

    operator_lib::engine::sort_by_savings(&mut recommendations);
    Ok((recommendations, notes))
}

pub async fn analyze_inventory(
    path: &Path,
    options: &AnalyzeOptions,
    format: OutputFormat,
) -> Result<()> {
    let inventory = load_inventory(path).await?;
    let (recommendations, notes) = run_analysis(&inventory, options).await?;

    match format {
        OutputFormat::Json => print_json(&recommendations)?,
        OutputFormat::Table => {
            for note in &notes {
                print_warning(note);
            }
            let rows: Vec<RecommendationRow> =
                recommendations.iter().map(RecommendationRow::from).collect();
            print_table(&rows);
            if !recommendations.is_empty() {
                let total: f64 = recommendations.iter().map(|r| r.monthly_savings).sum();
                println!();
                print_info(&format!(
                    "{} candidates, up to {} /mo if all were applied",
                    recommendations.len(),
                    format_currency(total).green()
                ));
            }
        }
    }
    Ok(())
}

async fn load_inventory(path: &Path) -> Result<Inventory> {
    Inventory::load(path)
        .await
        .with_context(|| format!("Failed to load inventory {}", path.display()))
}
