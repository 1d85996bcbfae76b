mod engine;
mod error;
mod projector;
mod sampler;
mod statistics;
mod strategies;
mod types;

pub use engine::{CancellationToken, DEFAULT_PROGRESS_INTERVAL, ProgressCallback, SimulationRunner};
pub use error::{ProjectionError, ValidationError};
pub use projector::project_deterministic;
pub use sampler::{
    MIN_INFLATION, MIN_RETURN, MarketSample, NormalSource, SeededNormals, StochasticSampler,
    derive_seed,
};
pub use statistics::{DistributionSummary, MIN_SAMPLES, percentile, sort_values, summarize};
pub use strategies::{
    BondLadder, FixedPercentage, FnPolicy, Guardrails, InflationAdjusted, PortfolioState,
    StrategyOutcome, WithdrawalPolicy, WithdrawalStrategyEvaluator, default_catalog,
};
pub use types::{
    AnnualSimulationResults, Asset, Assumptions, DEFAULT_END_AGE, Expense, IncomeSource,
    Liability, MonteCarloResult, MonteCarloSettings, NET_WORTH_KEY, PORTFOLIO_VALUE_KEY,
    PercentileBand, PercentileMethod, ProjectionSettings, ProjectionYear, SimulationYearResult,
    TaxPolicy, UserProfile,
};
