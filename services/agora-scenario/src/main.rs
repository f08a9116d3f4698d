//! Agora Scenario Runner
//!
//! Starts an in-process market cluster of requestor and provider nodes and
//! runs negotiation scenarios against it.
//!
//! # Scenarios
//!
//! - `multi-activity`: agreements with every provider, several sequential
//!   activities per agreement, termination and payment
//! - `single-simultaneous`: a second live activity on one agreement is
//!   refused until the first is destroyed
//! - `renegotiate`: a requestor turned away by a full provider gets an
//!   agreement after another requestor terminates
//!
//! # Usage
//!
//! ```bash
//! # Run every scenario with default nodes
//! agora-scenario
//!
//! # One scenario with a custom node layout
//! agora-scenario --scenario renegotiate --config /path/to/nodes.yaml
//!
//! # Environment overrides
//! AGORA__WORKLOAD__CYCLES=5 agora-scenario --log-format json
//! ```

mod config;
mod scenarios;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::ScenarioConfig;
use crate::scenarios::ScenarioReport;

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    MultiActivity,
    SingleSimultaneous,
    Renegotiate,
    All,
}

/// Agora scenario runner - negotiation and admission scenarios
#[derive(Parser, Debug)]
#[command(name = "agora-scenario")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, JSON, or YAML)
    #[arg(short, long, env = "AGORA_CONFIG")]
    config: Option<String>,

    /// Scenario to run
    #[arg(short, long, value_enum, default_value = "all")]
    scenario: Scenario,

    /// Activity cycles per agreement
    #[arg(long, env = "AGORA_CYCLES")]
    cycles: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "AGORA_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (json, pretty)
    #[arg(long, env = "AGORA_LOG_FORMAT")]
    log_format: Option<String>,
}

impl Args {
    /// Override configured values with the ones given on the command line
    fn apply_overrides(&self, config: &mut ScenarioConfig) {
        if let Some(cycles) = self.cycles {
            config.workload.cycles = cycles;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut scenario_config = ScenarioConfig::load(args.config.as_deref())?;
    args.apply_overrides(&mut scenario_config);

    init_logging(&scenario_config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        nodes = scenario_config.nodes.len(),
        "Starting Agora scenario runner"
    );

    scenario_config.validate()?;

    let selected = match args.scenario {
        Scenario::All => vec![
            Scenario::MultiActivity,
            Scenario::SingleSimultaneous,
            Scenario::Renegotiate,
        ],
        one => vec![one],
    };

    let mut failed = 0;
    for scenario in selected {
        match run(scenario, &scenario_config).await {
            Ok(report) => log_report(&report),
            Err(e) => {
                failed += 1;
                tracing::error!(scenario = ?scenario, error = %e, "Scenario failed");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} scenario(s) failed", failed);
    }
    tracing::info!("All scenarios passed");
    Ok(())
}

async fn run(scenario: Scenario, config: &ScenarioConfig) -> anyhow::Result<ScenarioReport> {
    tracing::info!(scenario = ?scenario, "Running scenario");
    match scenario {
        Scenario::MultiActivity => scenarios::multi_activity(config).await,
        Scenario::SingleSimultaneous => scenarios::single_simultaneous_activity(config).await,
        Scenario::Renegotiate => scenarios::renegotiate(config).await,
        Scenario::All => anyhow::bail!("`all` is expanded before running"),
    }
}

fn log_report(report: &ScenarioReport) {
    tracing::info!(
        scenario = report.name,
        agreements = report.agreements,
        activities = report.activities,
        invoices = report.invoices,
        total_paid = %report.total_paid,
        elapsed_ms = report.elapsed_ms,
        "Scenario passed"
    );
    if let Ok(json) = serde_json::to_string(report) {
        tracing::debug!(report = %json, "Scenario report");
    }
}

// =============================================================================
// Initialization Functions
// =============================================================================

/// Initialize logging based on configuration
fn init_logging(config: &config::LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match config.format.as_str() {
        "json" => {
            subscriber
                .with(fmt::layer().json().with_target(true))
                .init();
        }
        _ => {
            subscriber
                .with(fmt::layer().pretty().with_target(true))
                .init();
        }
    }

    Ok(())
}
