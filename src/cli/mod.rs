use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::core::{
    MonteCarloSettings, PercentileMethod, ProjectionError, ProjectionSettings, SimulationRunner,
    UserProfile, WithdrawalStrategyEvaluator, default_catalog, project_deterministic,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliPercentileMethod {
    Truncate,
    Linear,
}

impl From<CliPercentileMethod> for PercentileMethod {
    fn from(value: CliPercentileMethod) -> Self {
        match value {
            CliPercentileMethod::Truncate => PercentileMethod::Truncate,
            CliPercentileMethod::Linear => PercentileMethod::Linear,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "networth",
    about = "Net worth projections under fixed and Monte Carlo market assumptions"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Year-by-year projection at the fixed assumption rates
    Project(ScenarioArgs),
    /// Monte Carlo simulation with final-value statistics
    MonteCarlo(SimulationArgs),
    /// Compare the built-in withdrawal strategies
    Strategies(SimulationArgs),
}

#[derive(Args, Debug, Clone)]
struct ScenarioArgs {
    #[arg(
        long,
        help = "Scenario JSON file with `profile` and `settings` objects"
    )]
    scenario: PathBuf,
    #[arg(
        long,
        help = "Apply the flat tax rate to income received after retirement"
    )]
    tax_retirement_income: bool,
}

#[derive(Args, Debug, Clone)]
struct SimulationArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,
    #[arg(
        long,
        help = "Number of simulated trajectories, defaults to the scenario or 1000"
    )]
    simulations: Option<usize>,
    #[arg(
        long,
        help = "Seed for reproducible runs; random when omitted"
    )]
    seed: Option<u64>,
    #[arg(long, help = "Annual return volatility in percent, e.g. 15")]
    return_volatility: Option<f64>,
    #[arg(
        long,
        help = "Annual inflation volatility in percent, e.g. 1"
    )]
    inflation_volatility: Option<f64>,
    #[arg(
        long,
        help = "Annual retirement income target; success means final net worth x SWR covers it"
    )]
    income_target: Option<f64>,
    #[arg(long, help = "Safe withdrawal rate in percent, e.g. 4")]
    safe_withdrawal_rate: Option<f64>,
    #[arg(long, value_enum)]
    percentile_method: Option<CliPercentileMethod>,
    #[arg(
        long,
        help = "Omit the per-year simulation arrays from the output"
    )]
    summary_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub profile: UserProfile,
    pub settings: ProjectionSettings,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to read scenario {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid scenario JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Args(String),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

/// Runs the parsed command and returns the pretty-printed JSON result.
pub fn run(cli: Cli) -> Result<String, CliError> {
    let scenario = load_scenario(&cli.command.scenario_args().scenario)?;
    execute(&cli.command, scenario)
}

impl Command {
    fn scenario_args(&self) -> &ScenarioArgs {
        match self {
            Command::Project(args) => args,
            Command::MonteCarlo(args) | Command::Strategies(args) => &args.scenario,
        }
    }
}

pub fn load_scenario(path: &Path) -> Result<Scenario, CliError> {
    let json = fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_scenario(&json)
}

pub fn parse_scenario(json: &str) -> Result<Scenario, CliError> {
    Ok(serde_json::from_str::<Scenario>(json)?)
}

fn execute(command: &Command, scenario: Scenario) -> Result<String, CliError> {
    let mut settings = scenario.settings;
    if command.scenario_args().tax_retirement_income {
        settings.tax_policy.retirement_income_taxed = true;
    }

    match command {
        Command::Project(_) => {
            let years = project_deterministic(&scenario.profile, &settings)?;
            info!(years = years.len(), "deterministic projection complete");
            Ok(serde_json::to_string_pretty(&years)?)
        }
        Command::MonteCarlo(args) => {
            let settings = build_settings(settings, args).map_err(CliError::Args)?;
            let runner = SimulationRunner::new().with_progress(|fraction, message| {
                info!(percent = (fraction * 100.0).round(), "{message}");
            });
            let mut result = runner.run(&scenario.profile, &settings)?;
            if args.summary_only {
                result.annual_projections.clear();
            }
            Ok(serde_json::to_string_pretty(&result)?)
        }
        Command::Strategies(args) => {
            let settings = build_settings(settings, args).map_err(CliError::Args)?;
            let outcomes = WithdrawalStrategyEvaluator::new().evaluate(
                &scenario.profile,
                &settings,
                &default_catalog(),
            )?;
            Ok(serde_json::to_string_pretty(&outcomes)?)
        }
    }
}

fn build_settings(
    mut settings: ProjectionSettings,
    args: &SimulationArgs,
) -> Result<ProjectionSettings, String> {
    let mut mc = settings.monte_carlo.unwrap_or_else(MonteCarloSettings::default);

    if let Some(simulations) = args.simulations {
        if simulations < 2 {
            return Err("--simulations must be >= 2".to_string());
        }
        mc.num_simulations = simulations;
    }

    if let Some(seed) = args.seed {
        mc.seed = Some(seed);
    }

    if let Some(vol) = args.return_volatility {
        if !(0.0..=100.0).contains(&vol) {
            return Err("--return-volatility must be between 0 and 100".to_string());
        }
        mc.return_std_dev = vol / 100.0;
    }

    if let Some(vol) = args.inflation_volatility {
        if !(0.0..=100.0).contains(&vol) {
            return Err("--inflation-volatility must be between 0 and 100".to_string());
        }
        mc.inflation_std_dev = vol / 100.0;
    }

    if let Some(target) = args.income_target {
        if !target.is_finite() || target < 0.0 {
            return Err("--income-target must be >= 0".to_string());
        }
        mc.retirement_income_target = Some(target);
    }

    if let Some(rate) = args.safe_withdrawal_rate {
        if !(rate > 0.0 && rate <= 100.0) {
            return Err("--safe-withdrawal-rate must be > 0 and <= 100".to_string());
        }
        mc.safe_withdrawal_rate = rate / 100.0;
    }

    if let Some(method) = args.percentile_method {
        mc.percentile_method = method.into();
    }

    settings.monte_carlo = Some(mc);
    Ok(settings)
}
