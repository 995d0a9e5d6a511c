//! Cost Optimization Operator CLI
//!
//! A command-line tool for managing optimization policies on a running
//! operator and for analyzing an inventory file offline.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{analyze, policies};
use std::path::PathBuf;

/// Cost Optimization Operator CLI
#[derive(Parser)]
#[command(name = "costopt")]
#[command(author, version, about = "CLI for the Cost Optimization Operator", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via COSTOPT_API_URL env var)
    #[arg(long, env = "COSTOPT_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show optimization policies
    #[command(subcommand)]
    Get(GetCommands),

    /// Create a policy, or update its spec if it already exists
    Apply {
        /// Policy file (JSON)
        #[arg(long, short = 'f')]
        file: PathBuf,
    },

    /// Delete a policy; the operator rolls back applied changes first
    Delete {
        /// Policy as namespace/name
        policy: String,

        /// Remove the policy without waiting for a rollback
        #[arg(long)]
        force: bool,
    },

    /// Check a policy file against the admission rules
    Validate {
        /// Policy file (JSON)
        #[arg(long, short = 'f')]
        file: PathBuf,

        /// Inventory file used to resolve the target's labels
        #[arg(long)]
        inventory: Option<PathBuf>,

        /// Extra protected targets (ns, ns/name or */key=value)
        #[arg(long = "protect")]
        protected: Vec<String>,

        /// Ask the operator instead of checking locally
        #[arg(long)]
        remote: bool,
    },

    /// Run the recommendation engine against an inventory file
    Analyze {
        /// Inventory file (JSON)
        #[arg(long)]
        inventory: PathBuf,

        /// Only analyze one workload (kind/namespace/name)
        #[arg(long, short)]
        workload: Option<String>,

        /// Optimization type (RightSizeCPU, SpotMigration, All, ...)
        #[arg(long = "type", default_value = "All")]
        optimization_type: String,

        /// Cloud provider to price against
        #[arg(long, default_value = "aws")]
        provider: String,

        /// Provider region
        #[arg(long, default_value = "us-east-1")]
        region: String,
    },

    /// Show realized and potential savings across policies
    Savings {
        /// Filter by namespace
        #[arg(long, short)]
        namespace: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum GetCommands {
    /// List policies
    Policies {
        /// Filter by namespace
        #[arg(long, short)]
        namespace: Option<String>,

        /// Filter by phase (Pending, Ready, Applied, ...)
        #[arg(long)]
        phase: Option<String>,
    },

    /// Show one policy in detail
    Policy {
        /// Policy as namespace/name
        policy: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config::Config::load()?;
    let api_url = settings.api_url(cli.api_url.as_deref());

    match cli.command {
        Commands::Get(get_cmd) => {
            let client = client::ApiClient::new(&api_url)?;
            match get_cmd {
                GetCommands::Policies { namespace, phase } => {
                    policies::get_policies(&client, namespace, phase, cli.format).await?;
                }
                GetCommands::Policy { policy } => {
                    policies::get_policy(&client, &policy, cli.format).await?;
                }
            }
        }
        Commands::Apply { file } => {
            let client = client::ApiClient::new(&api_url)?;
            policies::apply_policy(&client, &file, cli.format).await?;
        }
        Commands::Delete { policy, force } => {
            let client = client::ApiClient::new(&api_url)?;
            policies::delete_policy(&client, &policy, force, cli.format).await?;
        }
        Commands::Validate {
            file,
            inventory,
            protected,
            remote,
        } => {
            if remote {
                let client = client::ApiClient::new(&api_url)?;
                analyze::validate_remote(&client, &file, cli.format).await?;
            } else {
                analyze::validate_local(&file, inventory.as_deref(), &protected, cli.format).await?;
            }
        }
        Commands::Analyze {
            inventory,
            workload,
            optimization_type,
            provider,
            region,
        } => {
            let options = analyze::AnalyzeOptions {
                workload,
                optimization_type,
                provider,
                region,
            };
            analyze::analyze_inventory(&inventory, &options, cli.format).await?;
        }
        Commands::Savings { namespace } => {
            let client = client::ApiClient::new(&api_url)?;
            policies::show_savings(&client, namespace, cli.format).await?;
        }
    }

    Ok(())
}
