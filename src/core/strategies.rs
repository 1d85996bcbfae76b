use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::{ProjectionError, ensure_finite};
use super::projector::{CashflowPlan, compound};
use super::sampler::{SeededNormals, StochasticSampler, derive_seed};
use super::statistics::{MIN_SAMPLES, percentile, sort_values};
use super::types::{MonteCarloSettings, ProjectionSettings, UserProfile};

/// What a withdrawal policy sees at the start of each retirement year.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortfolioState {
    pub portfolio_value: f64,
    pub retirement_start_value: f64,
    /// Cumulative price index since the first retirement year (1.0 in that year).
    pub inflation_index: f64,
    pub previous_withdrawal: f64,
    pub previous_return: f64,
    pub previous_inflation: f64,
    /// Projection years left, counting this one.
    pub years_remaining: u32,
    /// Expenses this year that retirement income does not cover.
    pub required_spending: f64,
}

/// A pure mapping from portfolio state and retirement year (0-based) to the
/// amount to withdraw. Amounts above the portfolio value are capped.
pub trait WithdrawalPolicy: Send + Sync {
    fn name(&self) -> &str;
    fn withdrawal(&self, state: &PortfolioState, year: u32) -> f64;
}

pub struct FnPolicy<F> {
    name: String,
    rule: F,
}

impl<F> FnPolicy<F>
where
    F: Fn(&PortfolioState, u32) -> f64 + Send + Sync,
{
    pub fn new(name: impl Into<String>, rule: F) -> Self {
        Self {
            name: name.into(),
            rule,
        }
    }
}

impl<F> WithdrawalPolicy for FnPolicy<F>
where
    F: Fn(&PortfolioState, u32) -> f64 + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn withdrawal(&self, state: &PortfolioState, year: u32) -> f64 {
        (self.rule)(state, year)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedPercentage {
    pub rate: f64,
}

impl WithdrawalPolicy for FixedPercentage {
    fn name(&self) -> &str {
        "fixed_percentage"
    }

    fn withdrawal(&self, state: &PortfolioState, _year: u32) -> f64 {
        state.portfolio_value * self.rate
    }
}

/// The classic "4% rule": a fixed share of the starting portfolio, indexed
/// to inflation.
#[derive(Debug, Clone, Copy)]
pub struct InflationAdjusted {
    pub rate: f64,
}

impl WithdrawalPolicy for InflationAdjusted {
    fn name(&self) -> &str {
        "inflation_adjusted"
    }

    fn withdrawal(&self, state: &PortfolioState, _year: u32) -> f64 {
        state.retirement_start_value * self.rate * state.inflation_index
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Guardrails {
    pub initial_rate: f64,
    pub bad_year_threshold: f64,
    pub good_year_threshold: f64,
    pub bad_year_cut: f64,
    pub good_year_raise: f64,
    pub floor_rate: f64,
    pub ceiling_rate: f64,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            initial_rate: 0.045,
            bad_year_threshold: -0.05,
            good_year_threshold: 0.10,
            bad_year_cut: 0.10,
            good_year_raise: 0.05,
            floor_rate: 0.03,
            ceiling_rate: 0.06,
        }
    }
}

impl WithdrawalPolicy for Guardrails {
    fn name(&self) -> &str {
        "dynamic"
    }

    fn withdrawal(&self, state: &PortfolioState, year: u32) -> f64 {
        if year == 0 {
            return state.portfolio_value * self.initial_rate;
        }

        let mut amount = state.previous_withdrawal;
        if state.previous_return < self.bad_year_threshold {
            amount *= 1.0 - self.bad_year_cut;
        } else {
            amount *= 1.0 + state.previous_inflation;
            if state.previous_return > self.good_year_threshold {
                amount *= 1.0 + self.good_year_raise;
            }
        }

        let floor = state.portfolio_value * self.floor_rate;
        let ceiling = state.portfolio_value * self.ceiling_rate.max(self.floor_rate);
        amount.max(floor).min(ceiling)
    }
}

/// Level payments from a bond ladder holding `ladder_share` of the starting
/// portfolio for `ladder_years`, then a fixed percentage of what remains.
#[derive(Debug, Clone, Copy)]
pub struct BondLadder {
    pub ladder_years: u32,
    pub ladder_yield: f64,
    pub ladder_share: f64,
    pub fallback_rate: f64,
}

impl Default for BondLadder {
    fn default() -> Self {
        Self {
            ladder_years: 10,
            ladder_yield: 0.03,
            ladder_share: 0.4,
            fallback_rate: 0.04,
        }
    }
}

impl WithdrawalPolicy for BondLadder {
    fn name(&self) -> &str {
        "bond_ladder"
    }

    fn withdrawal(&self, state: &PortfolioState, year: u32) -> f64 {
        if year < self.ladder_years {
            state.retirement_start_value
                * self.ladder_share
                * annuity_withdrawal_rate(self.ladder_yield, self.ladder_years)
        } else {
            state.portfolio_value * self.fallback_rate
        }
    }
}

pub(crate) fn annuity_withdrawal_rate(rate: f64, years: u32) -> f64 {
    let years = years.max(1) as f64;
    if rate.abs() < 1e-9 {
        return (1.0 / years).clamp(0.0, 1.0);
    }

    if rate <= -0.99 {
        return 1.0;
    }

    let denom = 1.0 - (1.0 + rate).powf(-years);
    if denom <= 1e-9 {
        1.0
    } else {
        (rate / denom).clamp(0.0, 1.0)
    }
}

pub fn default_catalog() -> Vec<Box<dyn WithdrawalPolicy>> {
    vec![
        Box::new(FixedPercentage { rate: 0.04 }),
        Box::new(InflationAdjusted { rate: 0.04 }),
        Box::new(Guardrails::default()),
        Box::new(BondLadder::default()),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyOutcome {
    pub name: String,
    pub success_rate: f64,
    pub depletion_rate: f64,
    pub median_final_value: f64,
    pub percentile_10: f64,
    pub percentile_90: f64,
    pub median_total_withdrawn: f64,
}

#[derive(Debug, Clone, Copy)]
struct PolicyRun {
    final_portfolio: f64,
    total_withdrawn: f64,
    needs_met: bool,
    depleted: bool,
}

#[derive(Debug, Clone, Copy)]
struct RetirementTrack {
    start_value: f64,
    start_price_index: f64,
    previous_withdrawal: f64,
    previous_return: f64,
    previous_inflation: f64,
    year: u32,
}

#[derive(Debug, Clone, Default)]
pub struct WithdrawalStrategyEvaluator {
    seed: Option<u64>,
}

impl WithdrawalStrategyEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Runs every policy against the same sampled markets and returns the
    /// outcomes ranked by success rate, then median final portfolio.
    pub fn evaluate(
        &self,
        profile: &UserProfile,
        settings: &ProjectionSettings,
        policies: &[Box<dyn WithdrawalPolicy>],
    ) -> Result<Vec<StrategyOutcome>, ProjectionError> {
        let plan = CashflowPlan::new(profile, settings)?;
        let mc = settings.monte_carlo_or_default();
        let n = mc.num_simulations;
        if n < MIN_SAMPLES {
            return Err(ProjectionError::InsufficientData {
                required: MIN_SAMPLES,
                actual: n,
            });
        }

        let base_seed = self.seed.or(mc.seed).unwrap_or_else(rand::random);
        info!(
            strategies = policies.len(),
            simulations = n,
            seed = base_seed,
            "evaluating withdrawal strategies"
        );

        let mut outcomes = Vec::with_capacity(policies.len());
        for policy in policies {
            let runs = (0..n)
                .into_par_iter()
                .map(|index| {
                    run_policy(&plan, &mc, policy.as_ref(), derive_seed(base_seed, index as u64))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let outcome = summarize_runs(policy.name(), &runs, &mc);
            debug!(
                strategy = %outcome.name,
                success_rate = outcome.success_rate,
                median_final_value = outcome.median_final_value,
                "strategy evaluated"
            );
            outcomes.push(outcome);
        }

        outcomes.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then(b.median_final_value.total_cmp(&a.median_final_value))
        });
        Ok(outcomes)
    }
}

fn run_policy(
    plan: &CashflowPlan<'_>,
    mc: &MonteCarloSettings,
    policy: &dyn WithdrawalPolicy,
    seed: u64,
) -> Result<PolicyRun, ProjectionError> {
    let assumptions = plan.assumptions();
    let mut sampler = StochasticSampler::new(&assumptions, mc, SeededNormals::from_seed(seed));

    let years = plan.projection_years();
    let mut assets = plan.starting_assets();
    let mut price_index = 1.0;
    let mut track: Option<RetirementTrack> = None;
    let mut total_withdrawn = 0.0;
    let mut needs_met = true;
    let mut depleted = false;

    for index in 0..years {
        let sample = sampler.sample();
        let (_, age) = plan.year_and_age(index);

        if age < plan.retirement_age() {
            let row = plan.project_year(index, assets, price_index, sample.investment_return)?;
            assets = row.ending_assets;
        } else {
            let flows = plan.flows(index, price_index)?;
            let retirement = track.get_or_insert(RetirementTrack {
                start_value: assets,
                start_price_index: price_index,
                previous_withdrawal: 0.0,
                previous_return: 0.0,
                previous_inflation: 0.0,
                year: 0,
            });

            let state = PortfolioState {
                portfolio_value: assets,
                retirement_start_value: retirement.start_value,
                inflation_index: price_index / retirement.start_price_index,
                previous_withdrawal: retirement.previous_withdrawal,
                previous_return: retirement.previous_return,
                previous_inflation: retirement.previous_inflation,
                years_remaining: years - index,
                required_spending: (flows.expenses - flows.income).max(0.0),
            };

            let requested = policy.withdrawal(&state, retirement.year);
            if !requested.is_finite() {
                return Err(ProjectionError::Computation(format!(
                    "withdrawal policy '{}' returned {requested}",
                    policy.name()
                )));
            }
            let withdrawal = requested.max(0.0).min(assets);
            if withdrawal + 1e-9 * state.required_spending.max(1.0) < state.required_spending {
                needs_met = false;
            }

            assets = ensure_finite(
                compound(assets, -withdrawal, sample.investment_return),
                "portfolio value",
            )?;
            if assets <= 0.0 {
                depleted = true;
            }

            total_withdrawn += withdrawal;
            retirement.previous_withdrawal = withdrawal;
            retirement.previous_return = sample.investment_return;
            retirement.previous_inflation = sample.inflation;
            retirement.year += 1;
        }

        price_index *= 1.0 + sample.inflation;
    }

    Ok(PolicyRun {
        final_portfolio: assets,
        total_withdrawn,
        needs_met,
        depleted,
    })
}

fn summarize_runs(name: &str, runs: &[PolicyRun], mc: &MonteCarloSettings) -> StrategyOutcome {
    let n = runs.len().max(1) as f64;
    let successes = runs.iter().filter(|r| r.needs_met).count();
    let depletions = runs.iter().filter(|r| r.depleted).count();

    let mut finals = runs.iter().map(|r| r.final_portfolio).collect::<Vec<_>>();
    let mut withdrawn = runs.iter().map(|r| r.total_withdrawn).collect::<Vec<_>>();
    sort_values(&mut finals);
    sort_values(&mut withdrawn);

    StrategyOutcome {
        name: name.to_string(),
        success_rate: successes as f64 / n,
        depletion_rate: depletions as f64 / n,
        median_final_value: percentile(&finals, 0.5, mc.percentile_method),
        percentile_10: percentile(&finals, 0.1, mc.percentile_method),
        percentile_90: percentile(&finals, 0.9, mc.percentile_method),
        median_total_withdrawn: percentile(&withdrawn, 0.5, mc.percentile_method),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        Asset, Assumptions, DEFAULT_END_AGE, Expense, IncomeSource, TaxPolicy,
    };

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    fn retiree_profile() -> UserProfile {
        UserProfile {
            current_age: 60,
            retirement_age: 62,
            life_expectancy: 92,
            annual_salary: 80_000.0,
            assets: vec![Asset {
                name: "Portfolio".to_string(),
                current_value: 1_000_000.0,
                return_rate: 0.06,
            }],
            liabilities: Vec::new(),
            income_sources: vec![IncomeSource {
                name: "Social Security".to_string(),
                annual_amount: 20_000.0,
                start_age: 67,
                end_age: DEFAULT_END_AGE,
                growth_rate: 0.02,
            }],
            expenses: vec![Expense {
                name: "Living".to_string(),
                annual_amount: 40_000.0,
                start_age: 0,
                end_age: DEFAULT_END_AGE,
                inflation_adjusted: true,
            }],
        }
    }

    fn settings(num_simulations: usize) -> ProjectionSettings {
        ProjectionSettings {
            start_year: 2025,
            projection_years: 30,
            assumptions: Assumptions::default(),
            tax_policy: TaxPolicy::default(),
            monte_carlo: Some(MonteCarloSettings {
                num_simulations,
                ..MonteCarloSettings::default()
            }),
        }
    }

    fn state(portfolio_value: f64) -> PortfolioState {
        PortfolioState {
            portfolio_value,
            retirement_start_value: 1_000_000.0,
            inflation_index: 1.0,
            previous_withdrawal: 0.0,
            previous_return: 0.0,
            previous_inflation: 0.0,
            years_remaining: 30,
            required_spending: 0.0,
        }
    }

    #[test]
    fn fixed_percentage_tracks_current_portfolio() {
        let policy = FixedPercentage { rate: 0.04 };
        assert_approx(policy.withdrawal(&state(500_000.0), 3), 20_000.0);
    }

    #[test]
    fn inflation_adjusted_indexes_initial_withdrawal() {
        let policy = InflationAdjusted { rate: 0.04 };
        let mut s = state(700_000.0);
        s.inflation_index = 1.1;
        assert_approx(policy.withdrawal(&s, 5), 44_000.0);
    }

    #[test]
    fn guardrails_cut_after_bad_year_and_respect_floor_and_ceiling() {
        let policy = Guardrails::default();
        assert_approx(policy.withdrawal(&state(1_000_000.0), 0), 45_000.0);

        let mut bad = state(1_000_000.0);
        bad.previous_withdrawal = 45_000.0;
        bad.previous_return = -0.20;
        assert_approx(policy.withdrawal(&bad, 1), 40_500.0);

        let mut good = state(1_000_000.0);
        good.previous_withdrawal = 45_000.0;
        good.previous_return = 0.15;
        good.previous_inflation = 0.02;
        assert_approx(policy.withdrawal(&good, 1), 45_000.0 * 1.02 * 1.05);

        let mut capped = state(500_000.0);
        capped.previous_withdrawal = 45_000.0;
        assert_approx(policy.withdrawal(&capped, 1), 30_000.0);

        let mut floored = state(2_000_000.0);
        floored.previous_withdrawal = 45_000.0;
        assert_approx(policy.withdrawal(&floored, 1), 60_000.0);
    }

    #[test]
    fn bond_ladder_pays_level_amount_then_falls_back() {
        let policy = BondLadder::default();
        let rung = 1_000_000.0 * 0.4 * annuity_withdrawal_rate(0.03, 10);
        assert_approx(policy.withdrawal(&state(900_000.0), 0), rung);
        assert_approx(policy.withdrawal(&state(600_000.0), 9), rung);
        assert_approx(policy.withdrawal(&state(600_000.0), 10), 24_000.0);
    }

    #[test]
    fn annuity_rate_handles_zero_and_positive_returns() {
        assert_approx(annuity_withdrawal_rate(0.0, 10), 0.1);
        assert_approx(annuity_withdrawal_rate(0.05, 10), 0.129_504_574_965);
        assert_eq!(annuity_withdrawal_rate(-0.995, 10), 1.0);
    }

    #[test]
    fn catalog_is_evaluated_and_ranked() {
        let catalog = default_catalog();
        let names = catalog
            .iter()
            .map(|p| p.name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["fixed_percentage", "inflation_adjusted", "dynamic", "bond_ladder"]
        );

        let outcomes = WithdrawalStrategyEvaluator::new()
            .with_seed(21)
            .evaluate(&retiree_profile(), &settings(200), &catalog)
            .expect("valid evaluation");
        assert_eq!(outcomes.len(), 4);
        for pair in outcomes.windows(2) {
            assert!(pair[0].success_rate >= pair[1].success_rate);
        }
        for outcome in &outcomes {
            assert!((0.0..=1.0).contains(&outcome.success_rate));
            assert!((0.0..=1.0).contains(&outcome.depletion_rate));
            assert!(outcome.percentile_10 <= outcome.median_final_value);
            assert!(outcome.median_final_value <= outcome.percentile_90);
        }
    }

    #[test]
    fn evaluation_is_reproducible_with_a_seed() {
        let catalog = default_catalog();
        let a = WithdrawalStrategyEvaluator::new()
            .with_seed(5)
            .evaluate(&retiree_profile(), &settings(100), &catalog)
            .expect("valid evaluation");
        let b = WithdrawalStrategyEvaluator::new()
            .with_seed(5)
            .evaluate(&retiree_profile(), &settings(100), &catalog)
            .expect("valid evaluation");
        assert_eq!(a, b);
    }

    #[test]
    fn custom_policies_plug_in_and_share_market_paths() {
        let policies: Vec<Box<dyn WithdrawalPolicy>> = vec![
            Box::new(FnPolicy::new("four_percent_a", |s: &PortfolioState, _| {
                s.portfolio_value * 0.04
            })),
            Box::new(FnPolicy::new("four_percent_b", |s: &PortfolioState, _| {
                s.portfolio_value * 0.04
            })),
        ];
        let outcomes = WithdrawalStrategyEvaluator::new()
            .with_seed(13)
            .evaluate(&retiree_profile(), &settings(80), &policies)
            .expect("valid evaluation");

        let a = outcomes
            .iter()
            .find(|o| o.name == "four_percent_a")
            .expect("present");
        let b = outcomes
            .iter()
            .find(|o| o.name == "four_percent_b")
            .expect("present");
        assert_eq!(a.success_rate, b.success_rate);
        assert_eq!(a.median_final_value, b.median_final_value);
        assert_eq!(a.median_total_withdrawn, b.median_total_withdrawn);
    }

    #[test]
    fn draining_everything_depletes_and_fails_later_years() {
        let policies: Vec<Box<dyn WithdrawalPolicy>> = vec![Box::new(FnPolicy::new(
            "drain",
            |s: &PortfolioState, _| s.portfolio_value,
        ))];
        let outcomes = WithdrawalStrategyEvaluator::new()
            .with_seed(2)
            .evaluate(&retiree_profile(), &settings(20), &policies)
            .expect("valid evaluation");
        assert_eq!(outcomes[0].depletion_rate, 1.0);
        assert_eq!(outcomes[0].success_rate, 0.0);
        assert_eq!(outcomes[0].median_final_value, 0.0);
    }

    #[test]
    fn nothing_needed_and_nothing_withdrawn_always_succeeds() {
        let mut profile = retiree_profile();
        profile.expenses.clear();
        let policies: Vec<Box<dyn WithdrawalPolicy>> =
            vec![Box::new(FnPolicy::new("hold", |_: &PortfolioState, _| 0.0))];
        let outcomes = WithdrawalStrategyEvaluator::new()
            .with_seed(3)
            .evaluate(&profile, &settings(50), &policies)
            .expect("valid evaluation");
        assert_eq!(outcomes[0].success_rate, 1.0);
        assert_eq!(outcomes[0].median_total_withdrawn, 0.0);
    }

    #[test]
    fn non_finite_policy_output_is_a_computation_error() {
        let policies: Vec<Box<dyn WithdrawalPolicy>> =
            vec![Box::new(FnPolicy::new("broken", |_: &PortfolioState, _| f64::NAN))];
        let err = WithdrawalStrategyEvaluator::new()
            .with_seed(1)
            .evaluate(&retiree_profile(), &settings(10), &policies)
            .expect_err("must fail");
        assert!(matches!(err, ProjectionError::Computation(_)));
    }

    #[test]
    fn too_few_simulations_is_insufficient_data() {
        let err = WithdrawalStrategyEvaluator::new()
            .evaluate(&retiree_profile(), &settings(1), &default_catalog())
            .expect_err("must fail");
        assert!(matches!(err, ProjectionError::InsufficientData { actual: 1, .. }));
    }
}
