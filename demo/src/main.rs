//! flowsim: policy impact preview CLI
//!
//! Replays the flow records of a scenario file against its policy
//! configuration before and after the scenario's proposed changes, and
//! prints the before/after aggregated flows as JSON.
//!
//! Usage:
//!   cargo run -p flowsim-cli -- run --scenario demo/scenarios/new-default-deny.json
//!   cargo run -p flowsim-cli -- run --scenario s.json --impacted-only --limit 10
//!   cargo run -p flowsim-cli -- check-hit '0|tier1|ns1/tier1.policy|deny|-1'

mod scenario;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowsim_contracts::{
    config::PreviewConfig,
    error::{FlowsimError, FlowsimResult},
    policy_hit::PolicyHit,
};
use flowsim_core::{FlowPipeline, InMemoryPager};
use flowsim_policycalc::{apply_policy_changes, EndpointCache, FlowPolicyCalculator};

use scenario::Scenario;

// ── CLI definition ────────────────────────────────────────────────────────────

/// flowsim: preview the effect of network policy changes on recorded flows.
#[derive(Parser)]
#[command(
    name = "flowsim",
    about = "Network policy impact preview",
    long_about = "Replays recorded flows against a policy configuration before and after\n\
                  a set of proposed changes and reports which flows change outcome."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a scenario and print the before/after flows as JSON.
    Run {
        /// Scenario JSON file.
        #[arg(long)]
        scenario: PathBuf,
        /// Stop after this many flows. Overrides the scenario's limit.
        #[arg(long)]
        limit: Option<usize>,
        /// Only print flows whose outcome changes.
        #[arg(long)]
        impacted_only: bool,
        /// Preview configuration TOML file. Overrides the scenario's config.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Parse a flow-log policy hit string and print its fields.
    CheckHit {
        /// e.g. `0|tier1|ns1/tier1.policy|allow|2`
        hit: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Logs go to stderr so stdout stays valid JSON. Set RUST_LOG=debug for
    // per-flow calculation detail.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run { scenario, limit, impacted_only, config } => {
            run_scenario(scenario, limit, impacted_only, config).await
        }
        Command::CheckHit { hit } => check_hit(&hit),
    };

    if let Err(e) = result {
        eprintln!("flowsim error: {}", e);
        std::process::exit(1);
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn run_scenario(
    path: PathBuf,
    limit: Option<usize>,
    impacted_only: bool,
    config_path: Option<PathBuf>,
) -> FlowsimResult<()> {
    let scenario = Scenario::from_file(&path)?;
    info!(scenario = %scenario.name, records = scenario.records.len(), "loaded scenario");

    let config = match &config_path {
        Some(p) => PreviewConfig::from_file(p)?,
        None => scenario.config.clone().unwrap_or_default(),
    };

    let before = scenario.resource_data();
    let (after, impacted) = apply_policy_changes(&before, &scenario.changes)?;

    let endpoints = Arc::new(EndpointCache::new());
    for update in scenario.endpoints.iter().cloned() {
        endpoints.apply(update);
    }

    let calculator = Arc::new(FlowPolicyCalculator::new(config.clone(), endpoints, &before, &after, &impacted));
    let mut pipeline = FlowPipeline::new(calculator, config).impacted_only(impacted_only || scenario.impacted_only);
    if let Some(limit) = limit.or(scenario.limit) {
        pipeline = pipeline.with_limit(limit);
    }

    let pager = InMemoryPager::new(scenario.windowed_records(), scenario.page_size());
    let mut handle = pipeline.spawn(Box::new(pager));

    let mut emitted = 0usize;
    let mut impacted_flows = 0usize;
    while let Some(flows) = handle.next().await {
        emitted += 1;
        if flows.after.iter().any(|b| b.key.flow_impacted) {
            impacted_flows += 1;
        }
        println!("{}", to_json(&flows)?);
    }
    if let Some(e) = handle.finish().await {
        return Err(e);
    }

    eprintln!("{} flow(s) emitted, {} impacted", emitted, impacted_flows);
    Ok(())
}

fn check_hit(hit: &str) -> FlowsimResult<()> {
    let parsed = PolicyHit::from_flow_log_str(hit, 1)?;
    println!("{}", to_json(&parsed)?);
    println!("flow log name: {}", parsed.flow_log_name());
    println!("rendered:      {}", parsed.to_flow_log_string());
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> FlowsimResult<String> {
    serde_json::to_string_pretty(value).map_err(|e| FlowsimError::ConfigError {
        reason: format!("failed to render JSON: {}", e),
    })
}
