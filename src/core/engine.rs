use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use rayon::prelude::*;
use tracing::{info, warn};

use super::error::ProjectionError;
use super::projector::CashflowPlan;
use super::sampler::{SeededNormals, StochasticSampler, derive_seed};
use super::statistics::{MIN_SAMPLES, percentile, sort_values, summarize};
use super::types::{
    AnnualSimulationResults, MonteCarloResult, MonteCarloSettings, NET_WORTH_KEY,
    PORTFOLIO_VALUE_KEY, PercentileBand, ProjectionSettings, SimulationYearResult, UserProfile,
};

pub const DEFAULT_PROGRESS_INTERVAL: usize = 100;

/// Receives `(fraction_done, message)`. Runs on a separate reporter thread;
/// a panic inside it is logged and ignored.
pub type ProgressCallback = Arc<dyn Fn(f64, &str) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct SimulationRunner {
    seed: Option<u64>,
    progress: Option<ProgressCallback>,
    progress_interval: usize,
    cancellation: CancellationToken,
}

impl Default for SimulationRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulationRunner {
    pub fn new() -> Self {
        Self {
            seed: None,
            progress: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            cancellation: CancellationToken::new(),
        }
    }

    /// Overrides any seed carried in the settings.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(f64, &str) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn with_progress_interval(mut self, every: usize) -> Self {
        self.progress_interval = every.max(1);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn run(
        &self,
        profile: &UserProfile,
        settings: &ProjectionSettings,
    ) -> Result<MonteCarloResult, ProjectionError> {
        let plan = CashflowPlan::new(profile, settings)?;
        let mc = settings.monte_carlo_or_default();
        let requested = mc.num_simulations;
        if requested < MIN_SAMPLES {
            return Err(ProjectionError::InsufficientData {
                required: MIN_SAMPLES,
                actual: requested,
            });
        }

        let base_seed = self.seed.or(mc.seed).unwrap_or_else(rand::random);
        info!(
            simulations = requested,
            years = plan.projection_years(),
            seed = base_seed,
            "starting monte carlo run"
        );

        let reporter = self.progress.clone().map(ProgressReporter::spawn);
        let completed = AtomicUsize::new(0);

        let trajectories = (0..requested)
            .into_par_iter()
            .map(|index| {
                if self.cancellation.is_cancelled() {
                    return Err(ProjectionError::Cancelled {
                        completed: completed.load(Ordering::SeqCst),
                        requested,
                    });
                }

                let years = simulate_trajectory(&plan, &mc, derive_seed(base_seed, index as u64))?;

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(reporter) = &reporter {
                    if done % self.progress_interval == 0 && done < requested {
                        reporter.notify(
                            done as f64 / requested as f64,
                            format!("Completed {done} of {requested} simulations"),
                        );
                    }
                }
                Ok(years)
            })
            .collect::<Result<Vec<_>, _>>();

        let trajectories = match trajectories {
            Ok(trajectories) => trajectories,
            Err(err) => {
                if let ProjectionError::Cancelled { completed, .. } = &err {
                    info!(completed, requested, "monte carlo run cancelled");
                }
                return Err(err);
            }
        };

        let result = aggregate(&plan, &mc, base_seed, trajectories)?;
        if let Some(reporter) = &reporter {
            reporter.notify(1.0, format!("Completed {requested} of {requested} simulations"));
        }
        info!(
            success_probability = result.success_probability,
            median_final_value = result.median_final_value,
            "monte carlo run finished"
        );
        Ok(result)
    }
}

/// One trajectory: the fixed-rate cashflow rules with the return and
/// inflation replaced by fresh draws every year.
pub(crate) fn simulate_trajectory(
    plan: &CashflowPlan<'_>,
    mc: &MonteCarloSettings,
    seed: u64,
) -> Result<Vec<SimulationYearResult>, ProjectionError> {
    let assumptions = plan.assumptions();
    let mut sampler = StochasticSampler::new(&assumptions, mc, SeededNormals::from_seed(seed));

    let mut assets = plan.starting_assets();
    let mut price_index = 1.0;
    let mut years = Vec::with_capacity(plan.projection_years() as usize);

    for index in 0..plan.projection_years() {
        let sample = sampler.sample();
        let row = plan.project_year(index, assets, price_index, sample.investment_return)?;
        price_index *= 1.0 + sample.inflation;

        let drawn = (-row.net_cash_flow).clamp(0.0, row.beginning_assets);
        let withdrawal_rate = if row.beginning_assets > 0.0 {
            drawn / row.beginning_assets
        } else {
            0.0
        };

        years.push(SimulationYearResult {
            net_worth: row.net_worth,
            portfolio_value: row.ending_assets,
            annual_income: row.income,
            withdrawal_rate,
        });
        assets = row.ending_assets;
    }

    Ok(years)
}

pub(crate) fn is_success(final_net_worth: f64, mc: &MonteCarloSettings) -> bool {
    match mc.retirement_income_target {
        Some(target) => final_net_worth * mc.safe_withdrawal_rate >= target,
        None => final_net_worth > 0.0,
    }
}

fn aggregate(
    plan: &CashflowPlan<'_>,
    mc: &MonteCarloSettings,
    seed: u64,
    trajectories: Vec<Vec<SimulationYearResult>>,
) -> Result<MonteCarloResult, ProjectionError> {
    let simulations_run = trajectories.len();

    let mut annual_projections = (0..plan.projection_years())
        .map(|index| {
            let (year, age) = plan.year_and_age(index);
            AnnualSimulationResults {
                year,
                age,
                simulation_results: Vec::with_capacity(simulations_run),
            }
        })
        .collect::<Vec<_>>();
    for trajectory in &trajectories {
        for (annual, point) in annual_projections.iter_mut().zip(trajectory) {
            annual.simulation_results.push(*point);
        }
    }

    let finals = trajectories
        .iter()
        .filter_map(|t| t.last())
        .copied()
        .collect::<Vec<_>>();
    let successes = finals
        .iter()
        .filter(|p| is_success(p.net_worth, mc))
        .count();

    let mut final_net_worth = finals.iter().map(|p| p.net_worth).collect::<Vec<_>>();
    let mut final_portfolio = finals.iter().map(|p| p.portfolio_value).collect::<Vec<_>>();
    sort_values(&mut final_net_worth);
    sort_values(&mut final_portfolio);

    let summary = summarize(&final_net_worth, mc.percentile_method)?;

    let percentile_bands = annual_projections
        .iter()
        .map(|annual| {
            let mut values = annual
                .simulation_results
                .iter()
                .map(|p| p.net_worth)
                .collect::<Vec<_>>();
            sort_values(&mut values);
            PercentileBand {
                year: annual.year,
                age: annual.age,
                percentile_10: percentile(&values, 0.1, mc.percentile_method),
                median: percentile(&values, 0.5, mc.percentile_method),
                percentile_90: percentile(&values, 0.9, mc.percentile_method),
            }
        })
        .collect();

    let mut final_distribution = BTreeMap::new();
    final_distribution.insert(NET_WORTH_KEY.to_string(), final_net_worth);
    final_distribution.insert(PORTFOLIO_VALUE_KEY.to_string(), final_portfolio);

    Ok(MonteCarloResult {
        simulations_run,
        projection_years: plan.projection_years(),
        seed,
        success_probability: successes as f64 / simulations_run as f64,
        median_final_value: summary.median,
        mean_final_value: summary.mean,
        std_dev_final_value: summary.std_dev,
        percentile_10: summary.percentile_10,
        percentile_90: summary.percentile_90,
        annual_projections,
        percentile_bands,
        final_distribution,
    })
}

struct ProgressUpdate {
    fraction: f64,
    message: String,
}

/// Forwards progress to the callback on a detached thread so a slow or
/// panicking callback never holds up the simulation workers.
struct ProgressReporter {
    sender: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    fn spawn(callback: ProgressCallback) -> Self {
        let (sender, receiver) = mpsc::channel::<ProgressUpdate>();
        let spawned = thread::Builder::new()
            .name("mc-progress".to_string())
            .spawn(move || {
                for update in receiver {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        callback(update.fraction, &update.message)
                    }));
                    if outcome.is_err() {
                        warn!(
                            fraction = update.fraction,
                            "progress callback panicked; continuing without it"
                        );
                    }
                }
            });
        if let Err(err) = spawned {
            warn!(%err, "could not start progress reporter; progress updates disabled");
        }
        Self { sender }
    }

    fn notify(&self, fraction: f64, message: String) {
        // The reporter thread may be gone; progress is best-effort.
        let _ = self.sender.send(ProgressUpdate { fraction, message });
    }
}
