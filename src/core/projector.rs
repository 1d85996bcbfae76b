use super::error::{ProjectionError, ensure_finite};
use super::types::{
    Assumptions, Liability, ProjectionSettings, ProjectionYear, TaxPolicy, UserProfile,
};

/// Deterministic inputs for one projected year, shared by the fixed-rate
/// projection and every Monte Carlo trajectory.
pub(crate) struct CashflowPlan<'a> {
    profile: &'a UserProfile,
    assumptions: Assumptions,
    tax_policy: TaxPolicy,
    start_year: i32,
    projection_years: u32,
    debt_schedule: Vec<DebtYear>,
}

#[derive(Debug, Clone, Copy, Default)]
struct DebtYear {
    payment: f64,
    ending_balance: f64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct YearFlows {
    pub year: i32,
    pub age: u32,
    pub income: f64,
    pub tax: f64,
    pub expenses: f64,
    pub liability_balance: f64,
}

impl<'a> CashflowPlan<'a> {
    /// Validates both inputs, so nothing is computed for a malformed request.
    pub fn new(
        profile: &'a UserProfile,
        settings: &ProjectionSettings,
    ) -> Result<Self, ProjectionError> {
        profile.validate()?;
        settings.validate()?;

        let debt_schedule = build_debt_schedule(&profile.liabilities, settings.projection_years)?;
        Ok(Self {
            profile,
            assumptions: settings.assumptions,
            tax_policy: settings.tax_policy,
            start_year: settings.start_year,
            projection_years: settings.projection_years,
            debt_schedule,
        })
    }

    pub fn projection_years(&self) -> u32 {
        self.projection_years
    }

    pub fn assumptions(&self) -> Assumptions {
        self.assumptions
    }

    pub fn starting_assets(&self) -> f64 {
        self.profile.total_assets()
    }

    pub fn retirement_age(&self) -> u32 {
        self.profile.retirement_age
    }

    pub fn year_and_age(&self, index: u32) -> (i32, u32) {
        (
            self.start_year + index as i32,
            self.profile.current_age + index,
        )
    }

    /// `inflation_factor` is the cumulative price index for this year:
    /// `(1 + inflation)^index` on the fixed path, the running product of
    /// sampled inflation on a stochastic one.
    pub fn flows(&self, index: u32, inflation_factor: f64) -> Result<YearFlows, ProjectionError> {
        let (year, age) = self.year_and_age(index);

        let sources = self.income_sources_at(age);
        let (gross, taxable) = if age < self.profile.retirement_age {
            let salary = self.profile.annual_salary
                * (1.0 + self.assumptions.salary_growth_rate).powi(index as i32);
            (salary + sources, true)
        } else {
            (sources, self.tax_policy.retirement_income_taxed)
        };
        let tax = if taxable {
            gross * self.assumptions.tax_rate
        } else {
            0.0
        };
        let income = ensure_finite(gross - tax, "income")?;

        let living = self
            .profile
            .expenses
            .iter()
            .filter(|e| e.is_active(age))
            .map(|e| {
                if e.inflation_adjusted {
                    e.annual_amount * inflation_factor
                } else {
                    e.annual_amount
                }
            })
            .sum::<f64>();
        let debt = self
            .debt_schedule
            .get(index as usize)
            .copied()
            .unwrap_or_default();
        let expenses = ensure_finite(living + debt.payment, "expenses")?;

        Ok(YearFlows {
            year,
            age,
            income,
            tax,
            expenses,
            liability_balance: debt.ending_balance,
        })
    }

    pub fn project_year(
        &self,
        index: u32,
        beginning_assets: f64,
        inflation_factor: f64,
        investment_return: f64,
    ) -> Result<ProjectionYear, ProjectionError> {
        let flows = self.flows(index, inflation_factor)?;
        let net_cash_flow = flows.income - flows.expenses;
        let ending_assets = ensure_finite(
            compound(beginning_assets, net_cash_flow, investment_return),
            "ending assets",
        )?;

        Ok(ProjectionYear {
            year: flows.year,
            age: flows.age,
            beginning_assets,
            income: flows.income,
            expenses: flows.expenses,
            net_cash_flow,
            ending_assets,
            tax_liability: flows.tax,
            liability_balance: flows.liability_balance,
            net_worth: ending_assets - flows.liability_balance,
        })
    }

    fn income_sources_at(&self, age: u32) -> f64 {
        self.profile
            .income_sources
            .iter()
            .filter(|s| s.is_active(age))
            .map(|s| s.annual_amount * (1.0 + s.growth_rate).powi((age - s.start_age) as i32))
            .sum()
    }
}

/// Net worth is never modelled below zero: a depleted portfolio stays at 0.
pub(crate) fn compound(beginning_assets: f64, net_cash_flow: f64, rate: f64) -> f64 {
    ((beginning_assets + net_cash_flow) * (1.0 + rate)).max(0.0)
}

pub fn project_deterministic(
    profile: &UserProfile,
    settings: &ProjectionSettings,
) -> Result<Vec<ProjectionYear>, ProjectionError> {
    let plan = CashflowPlan::new(profile, settings)?;
    let assumptions = plan.assumptions();

    let mut assets = plan.starting_assets();
    let mut years = Vec::with_capacity(plan.projection_years() as usize);
    for index in 0..plan.projection_years() {
        let inflation_factor = (1.0 + assumptions.inflation_rate).powi(index as i32);
        let row = plan.project_year(
            index,
            assets,
            inflation_factor,
            assumptions.investment_return,
        )?;
        assets = row.ending_assets;
        years.push(row);
    }
    Ok(years)
}

pub(crate) fn amortized_payment(
    balance: f64,
    rate: f64,
    term_years: u32,
) -> Result<f64, ProjectionError> {
    let years = term_years as f64;
    let payment = if rate.abs() < 1e-12 {
        balance / years
    } else {
        balance * rate / (1.0 - (1.0 + rate).powf(-years))
    };
    ensure_finite(payment, "amortized payment")
}

fn build_debt_schedule(
    liabilities: &[Liability],
    projection_years: u32,
) -> Result<Vec<DebtYear>, ProjectionError> {
    let mut schedule = vec![DebtYear::default(); projection_years as usize];

    for liability in liabilities {
        let payment =
            amortized_payment(liability.balance, liability.interest_rate, liability.term_years)?;
        let mut balance = liability.balance;
        for slot in schedule.iter_mut() {
            if balance > 0.0 {
                let owed = balance * (1.0 + liability.interest_rate);
                let paid = payment.min(owed);
                balance = owed - paid;
                if balance < 1e-6 {
                    balance = 0.0;
                }
                slot.payment += paid;
            }
            slot.ending_balance += balance;
        }
    }

    Ok(schedule)
}
