use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::ValidationError;

pub const DEFAULT_END_AGE: u32 = 120;
pub const DEFAULT_SIMULATIONS: usize = 1_000;
pub const DEFAULT_RETURN_STD_DEV: f64 = 0.15;
pub const DEFAULT_INFLATION_STD_DEV: f64 = 0.01;
pub const DEFAULT_SAFE_WITHDRAWAL_RATE: f64 = 0.04;

pub const NET_WORTH_KEY: &str = "net_worth";
pub const PORTFOLIO_VALUE_KEY: &str = "portfolio_value";

fn default_end_age() -> u32 {
    DEFAULT_END_AGE
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub name: String,
    pub current_value: f64,
    /// Informational only; the projector pools every asset and compounds the
    /// pool at `Assumptions::investment_return`.
    #[serde(default)]
    pub return_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Liability {
    pub name: String,
    pub balance: f64,
    pub interest_rate: f64,
    pub term_years: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeSource {
    pub name: String,
    pub annual_amount: f64,
    pub start_age: u32,
    #[serde(default = "default_end_age")]
    pub end_age: u32,
    #[serde(default)]
    pub growth_rate: f64,
}

impl IncomeSource {
    pub fn is_active(&self, age: u32) -> bool {
        self.start_age <= age && age <= self.end_age
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub name: String,
    pub annual_amount: f64,
    #[serde(default)]
    pub start_age: u32,
    #[serde(default = "default_end_age")]
    pub end_age: u32,
    #[serde(default = "default_true")]
    pub inflation_adjusted: bool,
}

impl Expense {
    pub fn is_active(&self, age: u32) -> bool {
        self.start_age <= age && age <= self.end_age
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub current_age: u32,
    pub retirement_age: u32,
    pub life_expectancy: u32,
    pub annual_salary: f64,
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub liabilities: Vec<Liability>,
    #[serde(default)]
    pub income_sources: Vec<IncomeSource>,
    #[serde(default)]
    pub expenses: Vec<Expense>,
}

impl UserProfile {
    pub fn total_assets(&self) -> f64 {
        self.assets.iter().map(|a| a.current_value).sum()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.retirement_age <= self.current_age {
            return Err(ValidationError::RetirementNotAfterCurrentAge {
                current_age: self.current_age,
                retirement_age: self.retirement_age,
            });
        }
        check_non_negative("annualSalary", self.annual_salary)?;

        for asset in &self.assets {
            check_non_negative(
                &format!("asset '{}' currentValue", asset.name),
                asset.current_value,
            )?;
            check_finite(&format!("asset '{}' returnRate", asset.name), asset.return_rate)?;
        }

        for liability in &self.liabilities {
            check_non_negative(
                &format!("liability '{}' balance", liability.name),
                liability.balance,
            )?;
            check_range(
                &format!("liability '{}' interestRate", liability.name),
                liability.interest_rate,
                0.0,
                1.0,
            )?;
            if liability.term_years == 0 {
                return Err(ValidationError::ZeroTerm {
                    name: liability.name.clone(),
                });
            }
        }

        for source in &self.income_sources {
            check_non_negative(
                &format!("income '{}' annualAmount", source.name),
                source.annual_amount,
            )?;
            check_range(
                &format!("income '{}' growthRate", source.name),
                source.growth_rate,
                -1.0,
                1.0,
            )?;
            if source.end_age < source.start_age {
                return Err(ValidationError::EndBeforeStart {
                    kind: "income source",
                    name: source.name.clone(),
                    start_age: source.start_age,
                    end_age: source.end_age,
                });
            }
        }

        for expense in &self.expenses {
            check_non_negative(
                &format!("expense '{}' annualAmount", expense.name),
                expense.annual_amount,
            )?;
            if expense.end_age < expense.start_age {
                return Err(ValidationError::EndBeforeStart {
                    kind: "expense",
                    name: expense.name.clone(),
                    start_age: expense.start_age,
                    end_age: expense.end_age,
                });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assumptions {
    pub inflation_rate: f64,
    pub investment_return: f64,
    pub salary_growth_rate: f64,
    pub tax_rate: f64,
}

impl Default for Assumptions {
    fn default() -> Self {
        Self {
            inflation_rate: 0.03,
            investment_return: 0.07,
            salary_growth_rate: 0.03,
            tax_rate: 0.22,
        }
    }
}

impl Assumptions {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("inflationRate", self.inflation_rate, -1.0, 1.0)?;
        check_range("investmentReturn", self.investment_return, -1.0, 1.0)?;
        check_range("salaryGrowthRate", self.salary_growth_rate, -1.0, 1.0)?;
        check_range("taxRate", self.tax_rate, 0.0, 1.0)?;
        Ok(())
    }
}

/// Whether the flat tax rate also applies to income received after retirement.
/// Off by default: retirement-era income sources pass through untaxed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxPolicy {
    #[serde(default)]
    pub retirement_income_taxed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PercentileMethod {
    /// `sorted[floor(n * p)]`, clamped to the last element.
    #[default]
    Truncate,
    /// Linear interpolation between the two closest ranks.
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonteCarloSettings {
    pub num_simulations: usize,
    pub return_std_dev: f64,
    pub inflation_std_dev: f64,
    pub retirement_income_target: Option<f64>,
    pub safe_withdrawal_rate: f64,
    pub percentile_method: PercentileMethod,
    pub seed: Option<u64>,
}

impl Default for MonteCarloSettings {
    fn default() -> Self {
        Self {
            num_simulations: DEFAULT_SIMULATIONS,
            return_std_dev: DEFAULT_RETURN_STD_DEV,
            inflation_std_dev: DEFAULT_INFLATION_STD_DEV,
            retirement_income_target: None,
            safe_withdrawal_rate: DEFAULT_SAFE_WITHDRAWAL_RATE,
            percentile_method: PercentileMethod::Truncate,
            seed: None,
        }
    }
}

impl MonteCarloSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("returnStdDev", self.return_std_dev, 0.0, 1.0)?;
        check_range("inflationStdDev", self.inflation_std_dev, 0.0, 1.0)?;
        check_range("safeWithdrawalRate", self.safe_withdrawal_rate, 0.0, 1.0)?;
        if let Some(target) = self.retirement_income_target {
            check_non_negative("retirementIncomeTarget", target)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionSettings {
    pub start_year: i32,
    pub projection_years: u32,
    #[serde(default)]
    pub assumptions: Assumptions,
    #[serde(default)]
    pub tax_policy: TaxPolicy,
    #[serde(default)]
    pub monte_carlo: Option<MonteCarloSettings>,
}

impl ProjectionSettings {
    pub fn monte_carlo_or_default(&self) -> MonteCarloSettings {
        self.monte_carlo.unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.projection_years == 0 {
            return Err(ValidationError::EmptyHorizon);
        }
        self.assumptions.validate()?;
        if let Some(mc) = &self.monte_carlo {
            mc.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionYear {
    pub year: i32,
    pub age: u32,
    pub beginning_assets: f64,
    pub income: f64,
    pub expenses: f64,
    pub net_cash_flow: f64,
    pub ending_assets: f64,
    pub tax_liability: f64,
    pub liability_balance: f64,
    pub net_worth: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationYearResult {
    pub net_worth: f64,
    pub portfolio_value: f64,
    pub annual_income: f64,
    pub withdrawal_rate: f64,
}

/// Every trajectory's value for one projected year; `simulation_results[s]`
/// belongs to simulation `s`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnualSimulationResults {
    pub year: i32,
    pub age: u32,
    pub simulation_results: Vec<SimulationYearResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileBand {
    pub year: i32,
    pub age: u32,
    pub percentile_10: f64,
    pub median: f64,
    pub percentile_90: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonteCarloResult {
    pub simulations_run: usize,
    pub projection_years: u32,
    pub seed: u64,
    pub success_probability: f64,
    pub median_final_value: f64,
    pub mean_final_value: f64,
    pub std_dev_final_value: f64,
    pub percentile_10: f64,
    pub percentile_90: f64,
    pub annual_projections: Vec<AnnualSimulationResults>,
    pub percentile_bands: Vec<PercentileBand>,
    pub final_distribution: BTreeMap<String, Vec<f64>>,
}

fn check_finite(field: &str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::NonFinite {
            field: field.to_string(),
            value,
        })
    }
}

fn check_non_negative(field: &str, value: f64) -> Result<(), ValidationError> {
    check_finite(field, value)?;
    if value < 0.0 {
        return Err(ValidationError::Negative {
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    check_finite(field, value)?;
    if !(min..=max).contains(&value) {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> UserProfile {
        UserProfile {
            current_age: 38,
            retirement_age: 65,
            life_expectancy: 90,
            annual_salary: 75_000.0,
            assets: vec![Asset {
                name: "Brokerage".to_string(),
                current_value: 120_000.0,
                return_rate: 0.07,
            }],
            liabilities: Vec::new(),
            income_sources: Vec::new(),
            expenses: vec![Expense {
                name: "Living".to_string(),
                annual_amount: 48_000.0,
                start_age: 0,
                end_age: DEFAULT_END_AGE,
                inflation_adjusted: true,
            }],
        }
    }

    #[test]
    fn valid_profile_passes() {
        assert_eq!(sample_profile().validate(), Ok(()));
    }

    #[test]
    fn retirement_must_follow_current_age() {
        let mut profile = sample_profile();
        profile.retirement_age = 38;
        assert_eq!(
            profile.validate(),
            Err(ValidationError::RetirementNotAfterCurrentAge {
                current_age: 38,
                retirement_age: 38
            })
        );
    }

    #[test]
    fn life_expectancy_is_not_a_validation_rule() {
        let mut profile = sample_profile();
        profile.life_expectancy = 60;
        assert_eq!(profile.validate(), Ok(()));
    }

    #[test]
    fn expense_ending_before_start_is_rejected() {
        let mut profile = sample_profile();
        profile.expenses[0].start_age = 50;
        profile.expenses[0].end_age = 45;
        let err = profile
            .validate()
            .expect_err("must reject inverted expense range");
        assert!(matches!(err, ValidationError::EndBeforeStart { kind: "expense", .. }));
    }

    #[test]
    fn negative_asset_value_is_rejected() {
        let mut profile = sample_profile();
        profile.assets[0].current_value = -1.0;
        assert!(matches!(profile.validate(), Err(ValidationError::Negative { .. })));
    }

    #[test]
    fn liability_needs_a_term() {
        let mut profile = sample_profile();
        profile.liabilities.push(Liability {
            name: "Mortgage".to_string(),
            balance: 200_000.0,
            interest_rate: 0.05,
            term_years: 0,
        });
        assert_eq!(
            profile.validate(),
            Err(ValidationError::ZeroTerm {
                name: "Mortgage".to_string()
            })
        );
    }

    #[test]
    fn tax_rate_above_one_is_out_of_range() {
        let assumptions = Assumptions {
            tax_rate: 1.5,
            ..Assumptions::default()
        };
        assert!(matches!(assumptions.validate(), Err(ValidationError::OutOfRange { .. })));
    }

    #[test]
    fn zero_projection_years_is_rejected() {
        let settings = ProjectionSettings {
            start_year: 2025,
            projection_years: 0,
            assumptions: Assumptions::default(),
            tax_policy: TaxPolicy::default(),
            monte_carlo: None,
        };
        assert_eq!(settings.validate(), Err(ValidationError::EmptyHorizon));
    }

    #[test]
    fn scenario_json_fills_defaults() {
        let json = r#"{
            "profile": {
                "currentAge": 40,
                "retirementAge": 60,
                "lifeExpectancy": 90,
                "annualSalary": 50000,
                "incomeSources": [{"name": "Pension", "annualAmount": 12000, "startAge": 67}],
                "expenses": [{"name": "Living", "annualAmount": 30000}]
            },
            "settings": {
                "startYear": 2025,
                "projectionYears": 10,
                "monteCarlo": {"numSimulations": 50}
            }
        }"#;

        #[derive(Deserialize)]
        struct Scenario {
            profile: UserProfile,
            settings: ProjectionSettings,
        }

        let scenario: Scenario = serde_json::from_str(json).expect("scenario should parse");
        assert_eq!(scenario.profile.income_sources[0].end_age, DEFAULT_END_AGE);
        assert!(scenario.profile.expenses[0].inflation_adjusted);
        assert_eq!(scenario.profile.expenses[0].start_age, 0);
        assert_eq!(scenario.settings.assumptions, Assumptions::default());

        let mc = scenario.settings.monte_carlo_or_default();
        assert_eq!(mc.num_simulations, 50);
        assert_eq!(mc.percentile_method, PercentileMethod::Truncate);
        assert!((mc.safe_withdrawal_rate - DEFAULT_SAFE_WITHDRAWAL_RATE).abs() < 1e-12);
    }
}
