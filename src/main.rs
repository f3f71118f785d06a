use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepwise_core::config::StepwiseConfig;
use stepwise_core::data::AccumulatedData;
use stepwise_core::types::Plan;
use stepwise_engine::{DataFlowResolver, PlanValidator};
use stepwise_tools::SchemaRegistry;

#[derive(Parser)]
#[command(
    name = "stepwise",
    version,
    about = "Schema-driven data flow and completeness checks for tool plans"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepwise.toml", env = "STEPWISE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tool schemas in the catalog
    Schemas {
        /// Print full schemas as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a plan file against the schema catalog
    Validate {
        /// Plan as JSON
        plan: PathBuf,
    },
    /// Resolve a plan's parameters against accumulated data without running tools
    Resolve {
        /// Plan as JSON
        plan: PathBuf,
        /// Accumulated data as a JSON object of `{ source: { field: value } }`
        #[arg(long)]
        data: PathBuf,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stepwise=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let schemas = SchemaRegistry::from_config(&config);

    match cli.command {
        Commands::Schemas { json } => print_schemas(&schemas, json)?,
        Commands::Validate { plan } => {
            let mut plan = read_plan(&plan)?;
            PlanValidator::new(&schemas)
                .validate_plan(&mut plan, &HashSet::new())
                .context("plan rejected")?;
            println!("plan {} is valid: {} subtasks", plan.id, plan.subtasks.len());
        }
        Commands::Resolve { plan, data } => {
            let mut plan = read_plan(&plan)?;
            PlanValidator::new(&schemas)
                .validate_plan(&mut plan, &HashSet::new())
                .context("plan rejected")?;
            let data = read_data(&data)?;
            let report = dry_run(&plan, &schemas, &data);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<StepwiseConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return StepwiseConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()));
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(StepwiseConfig::default())
}

fn read_plan(path: &Path) -> anyhow::Result<Plan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid plan JSON in {}", path.display()))
}

fn read_data(path: &Path) -> anyhow::Result<AccumulatedData> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read data {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("invalid data JSON in {}", path.display()))?;
    Ok(AccumulatedData::from_value(&value)?)
}

fn print_schemas(schemas: &SchemaRegistry, json: bool) -> anyhow::Result<()> {
    if json {
        let all: Vec<_> = schemas
            .tools()
            .into_iter()
            .filter_map(|t| schemas.get(t))
            .map(|s| s.as_ref().clone())
            .collect();
        println!("{}", serde_json::to_string_pretty(&all)?);
        return Ok(());
    }

    for tool in schemas.tools() {
        let Some(schema) = schemas.get(tool) else {
            continue;
        };
        println!("{}  {}", schema.tool, schema.description);
        for input in &schema.inputs {
            let sources: Vec<String> = input.sources.iter().map(|s| s.to_string()).collect();
            println!(
                "    in  {}{}{}",
                input.name,
                if input.required { "" } else { " (optional)" },
                if sources.is_empty() {
                    String::new()
                } else {
                    format!(" <- {}", sources.join(", "))
                }
            );
        }
        for output in &schema.outputs {
            println!("    out {}", output.name);
        }
    }
    Ok(())
}

/// Resolve every subtask in order against fixed data. Tools never run, so
/// later subtasks only see what the data file seeds.
fn dry_run(plan: &Plan, schemas: &SchemaRegistry, data: &AccumulatedData) -> serde_json::Value {
    let resolver = DataFlowResolver::new();
    let results: Vec<serde_json::Value> = plan
        .subtasks
        .iter()
        .map(|subtask| {
            let outcome = schemas
                .schema_for(&subtask.tool)
                .and_then(|schema| resolver.resolve(subtask, &schema, data));
            match outcome {
                Ok(resolved) => serde_json::json!({
                    "id": subtask.id,
                    "tool": subtask.tool,
                    "resolved": resolved,
                }),
                Err(e) => serde_json::json!({
                    "id": subtask.id,
                    "tool": subtask.tool,
                    "error": e.to_string(),
                }),
            }
        })
        .collect();
    serde_json::json!({ "plan": plan.id, "subtasks": results })
}
