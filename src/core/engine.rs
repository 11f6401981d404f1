//! Year-stepping projection engine.
//!
//! Each year is computed only from the previous year's [`SimulationYear`]
//! plus the immutable assumptions. Within a year the steps run in a fixed
//! order: age incomes, age expenses, synthesize interest, tax the baseline,
//! convert to Roth, price living expenses, apply the withdrawal strategy, run
//! the withdrawal waterfall, force RMDs, book any deficit, allocate surplus,
//! then grow accounts. Account balances only change in that last step; the
//! earlier steps record [`AccountFlows`] against the opening balances.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::benefits::{
    BendPointCalculator, BenefitCalculator, High3Pension, PensionCalculator,
    claim_social_security, earnings_test_reduction, start_pension,
};
use super::entities::{
    Account, DeficitDebtAccount, EarningsRecord, Expense, Frequency, Income, IncomeCore,
    InvestedAccount, PassiveIncome, PassiveKind, TaxType, net_worth,
};
use super::error::EngineError;
use super::growth::{
    AccountFlows, AccountGrowth, GrowthContext, active_month_multiplier, advance_account,
    advance_expense, advance_income, amortize, expense_cost, realized_income, saved_interest_rate,
    snap_cents,
};
use super::strategy::{StrategyInputs, target_withdrawal};
use super::tables::{
    Bracket, FicaParameters, Jurisdiction, StaticTaxTables, TaxParameterSource, TaxParameters,
    rmd_start_age,
};
use super::tax::{
    CapitalGainsRequest, GROSS_UP_TOLERANCE, GrossUpRequest, Schedule, adjusted_gross_income,
    bracket_ceiling, capital_gains_tax, fica_tax, gross_up, gross_up_capital_gains, income_tax,
    marginal_rate, solve_monotone, taxable_social_security,
};
use super::types::{
    AllocationPolicy, Assumptions, CashflowBreakdown, DeductionMethod, FilingStatus, RmdAccountDetail,
    RmdDiagnostic, RothConversionDiagnostic, SimulationYear, StrategyDiagnostic, TaxBreakdown,
    TaxState, WithdrawalRule, WithdrawalStrategy,
};

pub const EARLY_WITHDRAWAL_PENALTY: f64 = 0.10;
pub const RMD_SHORTFALL_PENALTY: f64 = 0.25;
/// First whole age at which retirement accounts are past 59 1/2.
pub const PENALTY_FREE_AGE: u32 = 60;
/// Positive solver overshoot below this is dropped instead of allocated.
pub const SOLVER_OVERSHOOT_LIMIT: f64 = 2.0;

const DEFICIT_DEBT_ID: &str = "deficit-debt";
const ROTH_CONVERSION_ID: &str = "roth-conversion";

/// Projection with the bundled 2024 tables and default benefit formulas.
pub fn run_projection(
    duration_years: u32,
    accounts: &[Account],
    incomes: &[Income],
    expenses: &[Expense],
    assumptions: &Assumptions,
    tax_state: &TaxState,
) -> Result<Vec<SimulationYear>, EngineError> {
    ProjectionEngine::default().project(
        duration_years,
        accounts,
        incomes,
        expenses,
        assumptions,
        tax_state,
    )
}

/// Number of years a projection produces: the requested duration, clamped
/// so the last year is the one in which age equals life expectancy.
pub fn projection_years(duration_years: u32, assumptions: &Assumptions) -> u32 {
    let demographics = &assumptions.demographics;
    let remaining = demographics
        .life_expectancy
        .checked_sub(demographics.start_age())
        .map(|span| span + 1)
        .unwrap_or(0);
    duration_years.min(remaining)
}

#[derive(Clone, Copy)]
pub struct ProjectionEngine<'a> {
    tables: &'a dyn TaxParameterSource,
    benefits: &'a dyn BenefitCalculator,
    pensions: &'a dyn PensionCalculator,
    returns: Option<&'a [f64]>,
}

impl Default for ProjectionEngine<'static> {
    fn default() -> Self {
        Self {
            tables: &StaticTaxTables,
            benefits: &BendPointCalculator,
            pensions: &High3Pension,
            returns: None,
        }
    }
}

impl<'a> ProjectionEngine<'a> {
    pub fn new(
        tables: &'a dyn TaxParameterSource,
        benefits: &'a dyn BenefitCalculator,
        pensions: &'a dyn PensionCalculator,
    ) -> Self {
        Self {
            tables,
            benefits,
            pensions,
            returns: None,
        }
    }

    /// Nominal market return per projected year, replacing the assumed
    /// return. Years past the end of the sequence use the assumption.
    pub fn with_returns(mut self, returns: &'a [f64]) -> Self {
        self.returns = Some(returns);
        self
    }

    pub fn project(
        &self,
        duration_years: u32,
        accounts: &[Account],
        incomes: &[Income],
        expenses: &[Expense],
        assumptions: &Assumptions,
        tax_state: &TaxState,
    ) -> Result<Vec<SimulationYear>, EngineError> {
        validate(accounts, incomes, expenses, assumptions)?;
        let start_year = assumptions.demographics.start_year;
        if tax_state.federal_override.is_none()
            && self
                .tables
                .tax_parameters(
                    start_year,
                    tax_state.filing_status,
                    Jurisdiction::Federal,
                    assumptions,
                )
                .is_none()
        {
            return Err(EngineError::MissingTaxParameters {
                year: start_year,
                jurisdiction: Jurisdiction::Federal.to_string(),
            });
        }

        let household = Household {
            accounts,
            incomes,
            expenses,
        };
        let roth_target = assumptions
            .investments
            .auto_roth_conversion
            .then(|| self.roth_target(duration_years, &household, assumptions, tax_state));
        Ok(self.run_years(duration_years, &household, assumptions, tax_state, roth_target))
    }

    fn run_years(
        &self,
        duration_years: u32,
        household: &Household<'_>,
        assumptions: &Assumptions,
        tax_state: &TaxState,
        roth_target: Option<RothTarget>,
    ) -> Vec<SimulationYear> {
        let count = projection_years(duration_years, assumptions);
        let mut years: Vec<SimulationYear> = Vec::with_capacity(count as usize);
        for index in 0..count as usize {
            let ctx = YearContext {
                index,
                year: assumptions.demographics.start_year + index as i32,
                assumptions,
                tax_state,
                roth_target,
            };
            let next = match years.last() {
                Some(prev) => self.step(
                    &ctx,
                    &Household {
                        accounts: &prev.accounts,
                        incomes: &prev.incomes,
                        expenses: &prev.expenses,
                    },
                    prev.strategy.as_ref(),
                ),
                None => self.step(&ctx, household, None),
            };
            years.push(next);
        }
        years
    }

    /// Conversion target: the floor rate or the median marginal federal rate
    /// of a conversion-free run's retired years, whichever is higher.
    fn roth_target(
        &self,
        duration_years: u32,
        household: &Household<'_>,
        assumptions: &Assumptions,
        tax_state: &TaxState,
    ) -> RothTarget {
        let mut baseline = assumptions.clone();
        baseline.investments.auto_roth_conversion = false;
        let mut rates: Vec<f64> = self
            .run_years(duration_years, household, &baseline, tax_state, None)
            .iter()
            .filter(|y| y.retired)
            .map(|y| y.taxes.marginal_federal_rate)
            .collect();
        let observed_median = median(&mut rates);
        let floor = assumptions.investments.roth_conversion_floor_rate;
        RothTarget {
            rate: observed_median.map_or(floor, |m| m.max(floor)),
            observed_median,
        }
    }

    fn step(
        &self,
        ctx: &YearContext<'_>,
        prior: &Household<'_>,
        previous_strategy: Option<&StrategyDiagnostic>,
    ) -> SimulationYear {
        let assumptions = ctx.assumptions;
        let demographics = &assumptions.demographics;
        let age = demographics.age_in(ctx.year);
        let retired = age >= demographics.retirement_age;
        let compound = ctx.index > 0;
        let mut year = YearState::new(*self, ctx, age, prior.accounts);

        let lifestyle_factor = if compound && !retired {
            1.0 + assumptions.economy.lifestyle_creep.max(0.0)
                * assumptions.real_salary_growth().max(0.0)
        } else {
            1.0
        };
        let growth = GrowthContext {
            assumptions,
            tables: self.tables,
            year: ctx.year,
            age,
            compound,
            lifestyle_factor,
        };

        let mut incomes: Vec<Income> = prior
            .incomes
            .iter()
            .filter(|income| !is_synthesized_interest(income))
            .map(|income| advance_income(income, &growth))
            .map(|income| year.start_benefits(income))
            .collect();
        let mut expenses: Vec<Expense> = prior
            .expenses
            .iter()
            .map(|expense| advance_expense(expense, &growth))
            .collect();
        incomes.extend(synthesize_interest(prior.accounts, assumptions));

        let realized = year.realize_incomes(&incomes);
        year.tax_baseline(&realized);
        if retired {
            year.convert_to_roth();
        }

        let mut living = year.living_expenses(&expenses);
        year.spendable = realized.total
            - realized.pre_tax
            - realized.roth
            - realized.insurance
            - year.taxes.total_tax()
            - living.total
            - realized.reinvested;

        let strategy = retired.then(|| {
            let diagnostic = target_withdrawal(&StrategyInputs {
                settings: &assumptions.investments,
                portfolio_value: prior.accounts.iter().map(Account::portfolio_value).sum(),
                inflation: assumptions.economy.effective_inflation(),
                remaining_years: demographics.life_expectancy.saturating_sub(age),
                previous: previous_strategy,
            });
            if diagnostic.strategy == WithdrawalStrategy::GuytonKlinger
                && diagnostic.discretionary_adjustment != 0.0
            {
                year.adjust_discretionary(&mut expenses, &living, &diagnostic);
                let adjusted = year.living_expenses(&expenses);
                year.spendable += living.total - adjusted.total;
                living = adjusted;
            }
            diagnostic
        });

        let mut withdrew = false;
        if year.spendable < 0.0 {
            let raised = year.run_waterfall(-year.spendable);
            withdrew = raised > 0.0;
            year.spendable += raised;
        }
        year.force_rmds();
        year.spendable = snap_cents(year.spendable);
        if year.spendable < 0.0 {
            year.book_deficit(-year.spendable);
            year.spendable = 0.0;
        } else if withdrew && year.spendable < SOLVER_OVERSHOOT_LIMIT {
            year.spendable = 0.0;
        }
        year.cashflow.discretionary = year.spendable;
        if year.spendable > 0.0 {
            year.allocate_surplus(living.total);
        }

        year.post_expenses(&expenses);
        year.record_earnings(&mut incomes, &realized);

        let cashflow_total_expense = living.total;
        year.finish(incomes, expenses, retired, strategy, cashflow_total_expense)
    }
}

#[derive(Clone, Copy)]
struct Household<'h> {
    accounts: &'h [Account],
    incomes: &'h [Income],
    expenses: &'h [Expense],
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct RothTarget {
    rate: f64,
    observed_median: Option<f64>,
}

struct YearContext<'c> {
    index: usize,
    year: i32,
    assumptions: &'c Assumptions,
    tax_state: &'c TaxState,
    roth_target: Option<RothTarget>,
}

/// Tax parameters resolved for one year. A jurisdiction whose liability is
/// overridden has no parameters, so withdrawals owe nothing extra there.
struct TaxYear {
    federal: Option<TaxParameters>,
    state: Option<TaxParameters>,
    capital_gains: Option<Vec<Bracket>>,
    fica: FicaParameters,
    federal_deduction: f64,
    state_deduction: f64,
}

impl TaxYear {
    fn price(&self, position: TaxPosition, status: FilingStatus) -> Liability {
        let taxable_ss = taxable_social_security(
            position.ordinary + position.gains,
            position.social_security,
            status,
        );
        let federal_income = adjusted_gross_income(
            position.ordinary + position.social_security,
            position.social_security,
            taxable_ss,
            0.0,
        );
        let state_benefits = if self
            .state
            .as_ref()
            .is_some_and(|params| params.taxes_social_security)
        {
            taxable_ss
        } else {
            0.0
        };
        let state_income = position.ordinary + position.gains + state_benefits;
        Liability {
            federal: self
                .federal
                .as_ref()
                .map(|p| income_tax(federal_income, self.federal_deduction, &p.brackets))
                .unwrap_or(0.0),
            capital_gains: self
                .capital_gains
                .as_deref()
                .map(|brackets| {
                    capital_gains_tax(federal_income - self.federal_deduction, position.gains, brackets)
                })
                .unwrap_or(0.0),
            state: self
                .state
                .as_ref()
                .map(|p| income_tax(state_income, self.state_deduction, &p.brackets))
                .unwrap_or(0.0),
            taxable_social_security: taxable_ss,
            federal_income,
            state_income,
        }
    }
}

/// Income recognized so far this year, split the way the worksheets use it.
#[derive(Clone, Copy, Debug, Default)]
struct TaxPosition {
    /// AGI excluding benefits and capital gains.
    ordinary: f64,
    social_security: f64,
    gains: f64,
}

impl TaxPosition {
    fn plus(self, ordinary: f64, gains: f64) -> Self {
        Self {
            ordinary: self.ordinary + ordinary,
            gains: self.gains + gains,
            ..self
        }
    }
}

/// Income tax on a whole [`TaxPosition`]. Always priced from scratch, so a
/// later ordinary dollar also pulls in taxable benefits and pushes earlier
/// gains into higher gains brackets.
#[derive(Clone, Copy, Debug, Default)]
struct Liability {
    federal: f64,
    capital_gains: f64,
    state: f64,
    taxable_social_security: f64,
    /// AGI less gains, with benefits at their taxable share.
    federal_income: f64,
    state_income: f64,
}

impl Liability {
    fn total(&self) -> f64 {
        self.federal + self.capital_gains + self.state
    }
}

/// Cash side of one withdrawal.
#[derive(Clone, Copy, Debug, Default)]
struct Draw {
    gross: f64,
    net: f64,
}

#[derive(Clone, Copy, Debug, Default)]
struct RealizedIncome {
    total: f64,
    earned: f64,
    wages: f64,
    ordinary: f64,
    social_security: f64,
    pre_tax: f64,
    roth: f64,
    insurance: f64,
    reinvested: f64,
}

#[derive(Clone, Copy, Debug, Default)]
struct LivingExpenses {
    total: f64,
    discretionary: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Treatment {
    TaxFree,
    Roth,
    Ordinary,
    CapitalGains,
    NotASource,
}

fn treatment(account: &Account) -> Treatment {
    match account {
        Account::Saved(_) => Treatment::TaxFree,
        Account::Invested(invested) => match invested.tax_type {
            TaxType::Traditional401k | TaxType::TraditionalIra => Treatment::Ordinary,
            TaxType::Roth401k | TaxType::RothIra => Treatment::Roth,
            TaxType::Brokerage => Treatment::CapitalGains,
            TaxType::Hsa | TaxType::Other => Treatment::TaxFree,
        },
        Account::Debt(_) | Account::Property(_) | Account::DeficitDebt(_) => Treatment::NotASource,
    }
}

/// Draw order used when none is configured.
fn default_rank(account: &Account) -> Option<u8> {
    match account {
        Account::Saved(_) => Some(0),
        Account::Invested(invested) => Some(match invested.tax_type {
            TaxType::Brokerage => 1,
            TaxType::Traditional401k | TaxType::TraditionalIra => 2,
            TaxType::Roth401k | TaxType::RothIra => 3,
            TaxType::Hsa => 4,
            TaxType::Other => 5,
        }),
        Account::Debt(_) | Account::Property(_) | Account::DeficitDebt(_) => None,
    }
}

fn is_synthesized_interest(income: &Income) -> bool {
    matches!(
        income,
        Income::Passive(p) if p.kind == PassiveKind::Interest && p.source_account_id.is_some()
    )
}

/// Interest for the year from each cash account's opening balance. It is
/// taxed but stays in the account.
fn synthesize_interest(accounts: &[Account], assumptions: &Assumptions) -> Vec<Income> {
    accounts
        .iter()
        .filter_map(|account| match account {
            Account::Saved(saved) => {
                let interest =
                    saved.amount * saved_interest_rate(saved.apr, &assumptions.economy);
                (interest > 0.0).then(|| {
                    let mut core = IncomeCore::new(
                        format!("interest-{}", saved.id),
                        interest,
                        Frequency::Annually,
                    );
                    core.name = format!("{} interest", saved.name);
                    Income::Passive(PassiveIncome {
                        core,
                        kind: PassiveKind::Interest,
                        inflation_adjusted: false,
                        source_account_id: Some(saved.id.clone()),
                        reinvested: true,
                    })
                })
            }
            _ => None,
        })
        .collect()
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) * 0.5
    } else {
        values[mid]
    })
}

fn deduction(params: &TaxParameters, method: &DeductionMethod) -> f64 {
    match method {
        DeductionMethod::Standard => params.standard_deduction,
        DeductionMethod::Itemized { amount } => amount.max(0.0),
    }
}

fn validate(
    accounts: &[Account],
    incomes: &[Income],
    expenses: &[Expense],
    assumptions: &Assumptions,
) -> Result<(), EngineError> {
    let economy = &assumptions.economy;
    let investments = &assumptions.investments;
    let rates = [
        ("inflation rate", economy.inflation_rate),
        ("healthcare inflation", economy.healthcare_inflation),
        ("rent inflation", economy.rent_inflation),
        ("lifestyle creep", economy.lifestyle_creep),
        ("salary growth", assumptions.income.salary_growth),
        ("return rate", investments.return_rate),
        ("withdrawal rate", investments.withdrawal_rate),
        ("roth conversion floor rate", investments.roth_conversion_floor_rate),
    ];
    for (name, value) in rates {
        if !value.is_finite() || value <= -1.0 {
            return Err(EngineError::InvalidInput(format!(
                "{name} must be finite and above -100%, got {value}"
            )));
        }
    }
    let demographics = &assumptions.demographics;
    if demographics.birth_year > demographics.start_year {
        return Err(EngineError::InvalidInput(format!(
            "birth year {} is after start year {}",
            demographics.birth_year, demographics.start_year
        )));
    }
    if demographics.life_expectancy < demographics.start_age() {
        return Err(EngineError::InvalidInput(format!(
            "life expectancy {} is before current age {}",
            demographics.life_expectancy,
            demographics.start_age()
        )));
    }

    let mut ids = std::collections::BTreeSet::new();
    for account in accounts {
        if !ids.insert(account.id()) {
            return Err(EngineError::InvalidInput(format!(
                "duplicate account id {}",
                account.id()
            )));
        }
        if !(account.assets().is_finite() && account.liabilities().is_finite())
            || account.assets() < 0.0
            || account.liabilities() < 0.0
        {
            return Err(EngineError::InvalidInput(format!(
                "account {} has a negative or non-finite balance",
                account.id()
            )));
        }
    }
    for income in incomes {
        let amount = income.core().amount;
        if !amount.is_finite() || amount < 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "income {} has amount {amount}",
                income.id()
            )));
        }
    }
    for expense in expenses {
        let amount = expense.core().amount;
        if !amount.is_finite() || amount < 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "expense {} has amount {amount}",
                expense.id()
            )));
        }
    }
    Ok(())
}

/// Working state for one year: opening balances, the flows recorded against
/// them, and the running tax position.
struct YearState<'a, 'c> {
    engine: ProjectionEngine<'a>,
    ctx: &'c YearContext<'c>,
    age: u32,
    accounts: Vec<Account>,
    flows: Vec<AccountFlows>,
    tax: TaxYear,
    position: TaxPosition,
    /// Liability on `position`, before overrides.
    liability: Liability,
    spendable: f64,
    cashflow: CashflowBreakdown,
    taxes: TaxBreakdown,
    logs: Vec<String>,
    rmd: Option<RmdDiagnostic>,
    roth_conversion: Option<RothConversionDiagnostic>,
}

impl<'a, 'c> YearState<'a, 'c> {
    fn new(
        engine: ProjectionEngine<'a>,
        ctx: &'c YearContext<'c>,
        age: u32,
        accounts: &[Account],
    ) -> Self {
        let mut logs = Vec::new();
        let tax = resolve_tax_year(engine.tables, ctx, &mut logs);
        Self {
            engine,
            ctx,
            age,
            accounts: accounts.to_vec(),
            flows: vec![AccountFlows::default(); accounts.len()],
            tax,
            position: TaxPosition::default(),
            liability: Liability::default(),
            spendable: 0.0,
            cashflow: CashflowBreakdown::default(),
            taxes: TaxBreakdown::default(),
            logs,
            rmd: None,
            roth_conversion: None,
        }
    }

    fn log(&mut self, message: String) {
        debug!(year = self.ctx.year, "{message}");
        self.logs.push(message);
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.accounts.iter().position(|a| a.id() == id)
    }

    fn first_index(&self, matches: impl Fn(&Account) -> bool) -> Option<usize> {
        self.accounts.iter().position(matches)
    }

    fn add_account(&mut self, account: Account) -> usize {
        self.accounts.push(account);
        self.flows.push(AccountFlows::default());
        self.accounts.len() - 1
    }

    fn federal_schedule(&self) -> Option<Schedule<'_>> {
        self.tax.federal.as_ref().map(|params| {
            Schedule::new(
                self.liability.federal_income,
                self.tax.federal_deduction,
                &params.brackets,
            )
        })
    }

    fn state_schedule(&self) -> Option<Schedule<'_>> {
        self.tax.state.as_ref().map(|params| {
            Schedule::new(
                self.liability.state_income,
                self.tax.state_deduction,
                &params.brackets,
            )
        })
    }

    fn price(&self, position: TaxPosition) -> Liability {
        self.tax.price(position, self.ctx.tax_state.filing_status)
    }

    /// Extra income tax owed if the year moved to `position`.
    fn added_tax(&self, position: TaxPosition) -> f64 {
        self.price(position).total() - self.liability.total()
    }

    /// Moves the year to `position`, books the extra tax and returns it.
    fn recognize(&mut self, position: TaxPosition) -> f64 {
        let next = self.price(position);
        self.taxes.federal += next.federal - self.liability.federal;
        self.taxes.capital_gains += next.capital_gains - self.liability.capital_gains;
        self.taxes.state += next.state - self.liability.state;
        self.taxes.taxable_social_security = next.taxable_social_security;
        let added = next.total() - self.liability.total();
        self.position = position;
        self.liability = next;
        added
    }

    /// Claiming-year and pension-start transitions. A failing calculator
    /// leaves the income unchanged for the year.
    fn start_benefits(&mut self, income: Income) -> Income {
        let ctx = self.ctx;
        let birth_year = ctx.assumptions.demographics.birth_year;
        match income {
            Income::FutureSocialSecurity(ss) if !ss.started() && self.age >= ss.claiming_age => {
                match claim_social_security(
                    &ss,
                    self.engine.benefits,
                    birth_year,
                    ctx.year,
                    ctx.assumptions,
                ) {
                    Ok(claimed) => {
                        self.log(format!(
                            "{} claimed at {}: PIA {:.2}, monthly benefit {:.2}",
                            claimed.core.id,
                            self.age,
                            claimed.calculated_pia,
                            claimed.core.amount
                        ));
                        Income::FutureSocialSecurity(claimed)
                    }
                    Err(err) => {
                        warn!(income = %ss.core.id, error = %err, "social security claim failed");
                        self.log(format!("{} not started: {err}", ss.core.id));
                        Income::FutureSocialSecurity(ss)
                    }
                }
            }
            Income::Pension(pension)
                if pension.calculated_benefit <= 0.0 && self.age >= pension.start_age =>
            {
                match start_pension(&pension, self.engine.pensions, ctx.year, ctx.assumptions) {
                    Ok(started) => {
                        self.log(format!(
                            "{} started at {}: annual benefit {:.2}",
                            started.core.id, self.age, started.calculated_benefit
                        ));
                        Income::Pension(started)
                    }
                    Err(err) => {
                        warn!(income = %pension.core.id, error = %err, "pension start failed");
                        self.log(format!("{} not started: {err}", pension.core.id));
                        Income::Pension(pension)
                    }
                }
            }
            other => other,
        }
    }

    fn realize_incomes(&mut self, incomes: &[Income]) -> RealizedIncome {
        let year = self.ctx.year;
        let mut realized = RealizedIncome {
            earned: incomes
                .iter()
                .filter(|income| income.core().earned_income)
                .map(|income| realized_income(income, year))
                .sum(),
            ..RealizedIncome::default()
        };
        let exempt = self
            .engine
            .tables
            .earnings_test_exempt_amount(year, self.ctx.assumptions);

        for income in incomes {
            let mut amount = realized_income(income, year);
            match income {
                Income::Work(work) => {
                    let active = active_month_multiplier(
                        work.core.start_date,
                        work.core.end_date,
                        year,
                    );
                    let mut pre_tax = work.pre_tax_contribution.max(0.0) * active;
                    let mut roth = work.roth_contribution.max(0.0) * active;
                    let mut insurance = work.insurance_premium.max(0.0) * active;
                    let withheld = pre_tax + roth + insurance;
                    if withheld > amount && withheld > 0.0 {
                        let scale = amount / withheld;
                        pre_tax *= scale;
                        roth *= scale;
                        insurance *= scale;
                    }
                    let employer = work.employer_match.max(0.0) * active;

                    let pre_tax_target = work
                        .contribution_account_id
                        .as_deref()
                        .and_then(|id| self.index_of(id))
                        .or_else(|| {
                            self.first_index(|a| {
                                matches!(a, Account::Invested(i) if i.tax_type == TaxType::Traditional401k)
                            })
                        });
                    let roth_target = work
                        .roth_account_id
                        .as_deref()
                        .and_then(|id| self.index_of(id))
                        .or_else(|| {
                            self.first_index(|a| {
                                matches!(a, Account::Invested(i) if i.tax_type == TaxType::Roth401k)
                            })
                        });
                    let match_target = work
                        .match_account_id
                        .as_deref()
                        .and_then(|id| self.index_of(id))
                        .or(pre_tax_target);

                    realized.pre_tax += self.contribute(pre_tax_target, pre_tax, &work.core.id, false);
                    realized.roth += self.contribute(roth_target, roth, &work.core.id, false);
                    self.contribute(match_target, employer, &work.core.id, true);
                    realized.insurance += insurance;
                    realized.wages += amount;
                    realized.ordinary += amount;
                }
                Income::SocialSecurity(_) | Income::FutureSocialSecurity(_) => {
                    let withheld =
                        earnings_test_reduction(amount, realized.earned, exempt, self.age);
                    if withheld > 0.0 {
                        self.log(format!(
                            "earnings test withheld {withheld:.2} of {}",
                            income.id()
                        ));
                        amount -= withheld;
                    }
                    realized.social_security += amount;
                }
                Income::Passive(passive) => {
                    if passive.reinvested {
                        realized.reinvested += amount;
                    }
                    realized.ordinary += amount;
                }
                Income::Windfall(windfall) => {
                    if windfall.taxable {
                        realized.ordinary += amount;
                    }
                }
                Income::Pension(_) => realized.ordinary += amount,
            }
            if amount > 0.0 {
                *self
                    .cashflow
                    .income_detail
                    .entry(income.id().to_string())
                    .or_default() += amount;
            }
            realized.total += amount;
        }
        realized
    }

    /// Routes a payroll contribution; without a target account nothing is
    /// withheld.
    fn contribute(&mut self, target: Option<usize>, amount: f64, source: &str, employer: bool) -> f64 {
        if amount <= 0.0 {
            return 0.0;
        }
        let Some(idx) = target else {
            self.log(format!(
                "no account for {amount:.2} of contributions from {source}; skipped"
            ));
            return 0.0;
        };
        if employer {
            self.flows[idx].employer += amount;
        } else {
            self.flows[idx].contributed += amount;
        }
        let id = self.accounts[idx].id().to_string();
        *self.cashflow.invested_detail.entry(id).or_default() += amount;
        self.cashflow.invested += amount;
        amount
    }

    fn tax_baseline(&mut self, realized: &RealizedIncome) {
        let tax_state = self.ctx.tax_state;
        let exclusions = realized.pre_tax + realized.insurance;
        self.position = TaxPosition {
            ordinary: realized.ordinary - exclusions,
            social_security: realized.social_security,
            gains: 0.0,
        };
        self.liability = self.price(self.position);

        self.taxes.federal = tax_state
            .federal_override
            .unwrap_or(self.liability.federal);
        self.taxes.state = tax_state.state_override.unwrap_or(self.liability.state);
        self.taxes.capital_gains = self.liability.capital_gains;
        self.taxes.fica = tax_state.fica_override.unwrap_or_else(|| {
            fica_tax(realized.earned - realized.insurance, &self.tax.fica).total()
        });
        self.taxes.pre_tax = realized.pre_tax;
        self.taxes.insurance = realized.insurance;
        self.taxes.post_tax = realized.roth;
        self.taxes.taxable_social_security = self.liability.taxable_social_security;
    }

    /// Fills ordinary brackets up to the target rate with Traditional money
    /// moved into Roth. Stops once RMDs begin.
    fn convert_to_roth(&mut self) {
        let ctx = self.ctx;
        let Some(target) = ctx.roth_target else {
            return;
        };
        if self.age >= rmd_start_age(ctx.assumptions.demographics.birth_year) {
            return;
        }
        let Some(ceiling) = self
            .tax
            .federal
            .as_ref()
            .and_then(|p| bracket_ceiling(target.rate, &p.brackets))
        else {
            return;
        };

        let sources: Vec<(usize, f64)> = self
            .accounts
            .iter()
            .enumerate()
            .filter_map(|(idx, account)| match account {
                Account::Invested(invested) if invested.tax_type.is_traditional() => {
                    Some((idx, invested.vested_amount()))
                }
                _ => None,
            })
            .filter(|(_, available)| *available > 0.0)
            .collect();
        // Converted dollars can make more benefits taxable, so the fill is
        // solved on federal income rather than subtracted.
        let top = ceiling + self.tax.federal_deduction;
        let total_available: f64 = sources.iter().map(|(_, a)| a).sum();
        let position = self.position;
        let amount = solve_monotone(
            top,
            total_available,
            top - self.liability.federal_income,
            |amount| self.price(position.plus(amount, 0.0)).federal_income,
        )
        .x;
        if !amount.is_finite() || amount < 1.0 {
            return;
        }
        let cost = self.recognize(position.plus(amount, 0.0));

        let destination = match self.first_index(
            |a| matches!(a, Account::Invested(i) if i.tax_type == TaxType::RothIra),
        ) {
            Some(idx) => idx,
            None => {
                let mut roth = InvestedAccount::new(ROTH_CONVERSION_ID, 0.0, TaxType::RothIra);
                roth.name = "Roth conversions".to_string();
                self.add_account(Account::Invested(roth))
            }
        };

        let mut remaining = amount;
        let mut moved = BTreeMap::new();
        for (idx, available) in sources {
            if remaining <= 0.0 {
                break;
            }
            let take = remaining.min(available);
            let basis = proportional_basis(&self.accounts[idx], take);
            self.flows[idx].converted_out += take;
            self.flows[idx].basis_withdrawn += basis;
            moved.insert(self.accounts[idx].id().to_string(), take);
            remaining -= take;
        }
        self.flows[destination].converted_in += amount;

        let destination_id = self.accounts[destination].id().to_string();
        self.log(format!(
            "converted {amount:.2} to {destination_id} at target rate {:.2}%, tax {cost:.2}",
            target.rate * 100.0
        ));
        self.roth_conversion = Some(RothConversionDiagnostic {
            amount,
            target_rate: target.rate,
            observed_median_rate: target.observed_median,
            tax_cost: cost,
            destination: destination_id,
            sources: moved,
        });
    }

    fn living_expenses(&self, expenses: &[Expense]) -> LivingExpenses {
        let year = self.ctx.year;
        let mut living = LivingExpenses::default();
        for expense in expenses {
            let cost = expense_cost(expense, year).total;
            living.total += cost;
            if matches!(expense, Expense::Recurring(r) if r.core.is_discretionary) {
                living.discretionary += cost;
            }
        }
        living.total += self
            .accounts
            .iter()
            .map(|account| match account {
                Account::Debt(debt) => amortize(debt.amount, debt.apr, debt.monthly_payment, 12).paid,
                _ => 0.0,
            })
            .sum::<f64>();
        living
    }

    /// Scales discretionary recurring expenses by the guardrail adjustment.
    fn adjust_discretionary(
        &mut self,
        expenses: &mut [Expense],
        living: &LivingExpenses,
        diagnostic: &StrategyDiagnostic,
    ) {
        let adjustment = diagnostic.discretionary_adjustment;
        if living.discretionary <= 0.0 {
            self.log(format!(
                "guardrail adjustment of {adjustment:.2} has no discretionary spending to apply to"
            ));
            return;
        }
        let target = living.discretionary + adjustment;
        if target < 0.0 {
            self.log(format!(
                "guardrail cut of {:.2} exceeds discretionary spending of {:.2}",
                -adjustment, living.discretionary
            ));
        }
        let factor = target.max(0.0) / living.discretionary;
        for expense in expenses.iter_mut() {
            if let Expense::Recurring(recurring) = expense {
                if recurring.core.is_discretionary {
                    recurring.core.amount *= factor;
                }
            }
        }
        self.log(format!(
            "guardrail scaled discretionary spending by {:.4}",
            factor
        ));
    }

    fn withdrawal_order(&self) -> Vec<WithdrawalRule> {
        let configured = &self.ctx.assumptions.withdrawal_order;
        if !configured.is_empty() {
            return configured.clone();
        }
        let mut ranked: Vec<(u8, usize)> = self
            .accounts
            .iter()
            .enumerate()
            .filter_map(|(idx, account)| default_rank(account).map(|rank| (rank, idx)))
            .collect();
        ranked.sort();
        ranked
            .into_iter()
            .map(|(_, idx)| WithdrawalRule::new(self.accounts[idx].id()))
            .collect()
    }

    /// Balance still withdrawable from an account this year.
    fn available(&self, idx: usize) -> f64 {
        let flows = &self.flows[idx];
        let balance = match &self.accounts[idx] {
            Account::Saved(saved) => saved.amount,
            Account::Invested(invested) => invested.vested_amount(),
            Account::Debt(_) | Account::Property(_) | Account::DeficitDebt(_) => 0.0,
        };
        (balance - flows.withdrawn - flows.converted_out).max(0.0)
    }

    /// Walks the withdrawal order until `need` is met net of tax. Returns
    /// the net cash raised.
    fn run_waterfall(&mut self, need: f64) -> f64 {
        let mut remaining = need;
        for rule in self.withdrawal_order() {
            if remaining <= GROSS_UP_TOLERANCE {
                break;
            }
            let Some(idx) = self.index_of(&rule.account_id) else {
                self.log(format!(
                    "withdrawal order names unknown account {}",
                    rule.account_id
                ));
                continue;
            };
            let cap = rule
                .max_annual
                .map(|max| (max - self.flows[idx].withdrawn).max(0.0))
                .unwrap_or(f64::INFINITY);
            let available = self.available(idx).min(cap);
            if available <= 0.0 {
                continue;
            }
            remaining -= self.withdraw(idx, remaining, available);
        }
        need - remaining.max(0.0)
    }

    fn withdraw(&mut self, idx: usize, net_target: f64, available: f64) -> f64 {
        let penalty_rate = if self.age < PENALTY_FREE_AGE {
            EARLY_WITHDRAWAL_PENALTY
        } else {
            0.0
        };
        match treatment(&self.accounts[idx]) {
            Treatment::NotASource => 0.0,
            Treatment::TaxFree => {
                let gross = net_target.min(available);
                let basis = proportional_basis(&self.accounts[idx], gross);
                self.record_withdrawal(idx, gross, basis);
                gross
            }
            Treatment::Ordinary => {
                let result = self.ordinary_gross_up(net_target, available, penalty_rate);
                let basis = proportional_basis(&self.accounts[idx], result.gross);
                self.record_withdrawal(idx, result.gross, basis);
                result.net
            }
            Treatment::Roth => {
                let Account::Invested(roth) = &self.accounts[idx] else {
                    return 0.0;
                };
                let basis_left = (roth.cost_basis - self.flows[idx].basis_withdrawn).max(0.0);
                if penalty_rate == 0.0 {
                    let gross = net_target.min(available);
                    self.record_withdrawal(idx, gross, gross.min(basis_left));
                    return gross;
                }
                // Contributions come out first, tax- and penalty-free.
                let from_basis = net_target.min(basis_left).min(available);
                let result =
                    self.ordinary_gross_up(net_target - from_basis, available - from_basis, penalty_rate);
                self.record_withdrawal(idx, from_basis + result.gross, from_basis);
                from_basis + result.net
            }
            Treatment::CapitalGains => {
                let gains_ratio = match &self.accounts[idx] {
                    Account::Invested(invested) => invested.gains_ratio().clamp(0.0, 1.0),
                    _ => 0.0,
                };
                let estimate = gross_up_capital_gains(&CapitalGainsRequest {
                    net_target,
                    available,
                    gains_ratio,
                    ordinary_taxable: self.liability.federal_income - self.tax.federal_deduction,
                    realized_gains: self.position.gains,
                    brackets: self.tax.capital_gains.as_deref(),
                    state: self.state_schedule(),
                });
                let position = self.position;
                let solved = solve_monotone(net_target, available, estimate.gross, |gross| {
                    gross - self.added_tax(position.plus(0.0, gross * gains_ratio))
                });
                if !solved.converged {
                    warn!(account = %self.accounts[idx].id(), "capital gains gross-up did not converge");
                }
                let gains = solved.x * gains_ratio;
                let tax = self.recognize(position.plus(0.0, gains));
                self.record_withdrawal(idx, solved.x, solved.x - gains);
                solved.x - tax
            }
        }
    }

    /// Ordinary-income draw netting `net_target`. The bracket walk prices
    /// the draw alone; the solve reprices the whole year, so benefits that
    /// become taxable and gains pushed out of the zero band are paid for too.
    fn ordinary_gross_up(&mut self, net_target: f64, available: f64, penalty_rate: f64) -> Draw {
        if net_target <= 0.0 || available <= 0.0 {
            return Draw::default();
        }
        let penalty_rate = penalty_rate.max(0.0);
        let estimate = gross_up(&GrossUpRequest {
            net_target,
            available,
            federal: self.federal_schedule(),
            state: self.state_schedule(),
            penalty_rate,
        });
        let position = self.position;
        let solved = solve_monotone(net_target, available, estimate.gross, |gross| {
            gross * (1.0 - penalty_rate) - self.added_tax(position.plus(gross, 0.0))
        });
        if !solved.converged {
            warn!(year = self.ctx.year, net_target, "gross-up did not converge");
        }
        let gross = solved.x;
        let tax = self.recognize(position.plus(gross, 0.0));
        let penalty = gross * penalty_rate;
        self.taxes.penalties += penalty;
        Draw {
            gross,
            net: gross - tax - penalty,
        }
    }

    fn record_withdrawal(&mut self, idx: usize, gross: f64, basis: f64) {
        if gross <= 0.0 {
            return;
        }
        self.flows[idx].withdrawn += gross;
        self.flows[idx].basis_withdrawn += basis;
        self.cashflow.withdrawals += gross;
        let id = self.accounts[idx].id().to_string();
        *self.cashflow.withdrawal_detail.entry(id).or_default() += gross;
    }

    /// Forces each Traditional account's distribution out. Withdrawals
    /// already taken this year count toward it.
    fn force_rmds(&mut self) {
        let ctx = self.ctx;
        if self.age < rmd_start_age(ctx.assumptions.demographics.birth_year) {
            return;
        }
        let Some(divisor) = self.engine.tables.rmd_divisor(self.age) else {
            self.log(format!("no distribution period for age {}; RMD skipped", self.age));
            return;
        };

        let mut diagnostic = RmdDiagnostic {
            age: self.age,
            ..RmdDiagnostic::default()
        };
        for idx in 0..self.accounts.len() {
            let Account::Invested(account) = &self.accounts[idx] else {
                continue;
            };
            if !account.tax_type.is_traditional() || account.amount <= 0.0 {
                continue;
            }
            let prior_balance = account.amount;
            let id = account.id.clone();
            let required = prior_balance / divisor;
            let shortfall = (required - self.flows[idx].withdrawn).max(0.0);
            let forced = shortfall.min(self.available(idx));
            if forced > 0.0 {
                let tax = self.recognize(self.position.plus(forced, 0.0));
                let basis = proportional_basis(&self.accounts[idx], forced);
                self.record_withdrawal(idx, forced, basis);
                diagnostic.forced_gross += forced;
                diagnostic.forced_net += forced - tax;
            }
            let uncovered = shortfall - forced;
            diagnostic.shortfall += uncovered;
            diagnostic.required_total += required;
            diagnostic.distributed_total += self.flows[idx].withdrawn;
            diagnostic.accounts.insert(
                id,
                RmdAccountDetail {
                    prior_balance,
                    divisor,
                    required,
                    distributed: self.flows[idx].withdrawn,
                },
            );
        }
        if diagnostic.accounts.is_empty() {
            return;
        }

        diagnostic.penalty = diagnostic.shortfall * RMD_SHORTFALL_PENALTY;
        self.taxes.penalties += diagnostic.penalty;
        self.spendable += diagnostic.forced_net - diagnostic.penalty;
        if diagnostic.shortfall > 0.0 {
            self.log(format!(
                "RMD shortfall of {:.2}; penalty {:.2}",
                diagnostic.shortfall, diagnostic.penalty
            ));
        }
        if diagnostic.forced_gross > 0.0 {
            self.log(format!(
                "forced RMD of {:.2} (net {:.2})",
                diagnostic.forced_gross, diagnostic.forced_net
            ));
        }
        self.rmd = Some(diagnostic);
    }

    fn book_deficit(&mut self, amount: f64) {
        let idx = match self.first_index(|a| matches!(a, Account::DeficitDebt(_))) {
            Some(idx) => idx,
            None => self.add_account(Account::DeficitDebt(DeficitDebtAccount {
                id: DEFICIT_DEBT_ID.to_string(),
                name: "Unfunded spending".to_string(),
                amount: 0.0,
                apr: 0.0,
            })),
        };
        self.flows[idx].borrowed += amount;
        self.cashflow.deficit_debt_added += amount;
        self.log(format!("uncovered deficit of {amount:.2} added to deficit debt"));
    }

    fn allocate_surplus(&mut self, living_expenses: f64) {
        for idx in 0..self.accounts.len() {
            if self.spendable <= 0.0 {
                return;
            }
            if let Account::DeficitDebt(_) = self.accounts[idx] {
                let paid = self.pay_down(idx, self.spendable);
                self.cashflow.deficit_debt_repaid += paid;
                self.spendable -= paid;
            }
        }

        let ctx = self.ctx;
        for bucket in &ctx.assumptions.priorities {
            if self.spendable <= 0.0 {
                break;
            }
            let Some(idx) = self.index_of(&bucket.account_id) else {
                self.log(format!("priority names unknown account {}", bucket.account_id));
                continue;
            };
            let wanted = match &bucket.policy {
                AllocationPolicy::FixedMonthly { amount } => amount.max(0.0) * 12.0,
                AllocationPolicy::Remainder => self.spendable,
                AllocationPolicy::CappedMax { cap } => cap.max(0.0),
                AllocationPolicy::MultipleOfExpenses { multiple } => {
                    let target = multiple.max(0.0) * living_expenses / 12.0;
                    (target - self.projected_balance(idx)).max(0.0)
                }
            };
            let amount = wanted.min(self.spendable);
            if amount <= 0.0 {
                continue;
            }
            let placed = self.deposit(idx, amount);
            self.spendable -= placed;
        }

        if self.spendable > 0.0 {
            let leftover = self.spendable;
            match self.first_index(|a| matches!(a, Account::Saved(_))) {
                Some(idx) => {
                    self.deposit(idx, leftover);
                }
                None => {
                    self.cashflow.unallocated += leftover;
                    self.log(format!("{leftover:.2} of surplus had no account to go to"));
                }
            }
            self.spendable = 0.0;
        }
    }

    /// Opening balance adjusted for this year's flows so far.
    fn projected_balance(&self, idx: usize) -> f64 {
        let flows = &self.flows[idx];
        self.accounts[idx].assets() - flows.withdrawn - flows.converted_out
            + flows.contributed
            + flows.converted_in
    }

    /// Places surplus into an account; liabilities take at most what is owed.
    fn deposit(&mut self, idx: usize, amount: f64) -> f64 {
        let placed = match self.accounts[idx] {
            Account::Saved(_) | Account::Invested(_) => {
                self.flows[idx].contributed += amount;
                amount
            }
            Account::Debt(_) | Account::Property(_) | Account::DeficitDebt(_) => {
                self.pay_down(idx, amount)
            }
        };
        if placed > 0.0 {
            let id = self.accounts[idx].id().to_string();
            *self.cashflow.bucket_detail.entry(id).or_default() += placed;
            self.cashflow.bucket_allocations += placed;
        }
        placed
    }

    fn pay_down(&mut self, idx: usize, amount: f64) -> f64 {
        let flows = &self.flows[idx];
        let owed = match &self.accounts[idx] {
            Account::Debt(debt) => {
                amortize(debt.amount, debt.apr, debt.monthly_payment, 12).balance - flows.payment
            }
            Account::Property(property) => property.loan_balance - flows.payment,
            Account::DeficitDebt(deficit) => {
                deficit.amount * (1.0 + deficit.apr.max(0.0)) + flows.borrowed - flows.payment
            }
            Account::Saved(_) | Account::Invested(_) => 0.0,
        };
        let paid = amount.min(owed.max(0.0));
        self.flows[idx].payment += paid;
        paid
    }

    /// Records expense detail and applies mortgage principal to the linked
    /// property's loan.
    fn post_expenses(&mut self, expenses: &[Expense]) {
        let year = self.ctx.year;
        for expense in expenses {
            let cost = expense_cost(expense, year);
            if cost.total > 0.0 {
                *self
                    .cashflow
                    .expense_detail
                    .entry(expense.id().to_string())
                    .or_default() += cost.total;
            }
            let Expense::Mortgage(mortgage) = expense else {
                continue;
            };
            let property = mortgage
                .property_account_id
                .as_deref()
                .and_then(|id| self.index_of(id))
                .filter(|idx| matches!(self.accounts[*idx], Account::Property(_)));
            if let Some(idx) = property {
                let owed = self.accounts[idx].liabilities() - self.flows[idx].payment;
                self.flows[idx].payment += cost.principal.min(owed.max(0.0));
            }
        }
        for idx in 0..self.accounts.len() {
            if let Account::Debt(debt) = &self.accounts[idx] {
                let paid = amortize(debt.amount, debt.apr, debt.monthly_payment, 12).paid;
                if paid > 0.0 {
                    *self
                        .cashflow
                        .expense_detail
                        .entry(debt.id.clone())
                        .or_default() += paid;
                }
            }
        }
    }

    /// Appends this year's covered earnings to benefits not yet started.
    fn record_earnings(&self, incomes: &mut [Income], realized: &RealizedIncome) {
        if realized.wages <= 0.0 {
            return;
        }
        let year = self.ctx.year;
        for income in incomes.iter_mut() {
            match income {
                Income::FutureSocialSecurity(ss) if !ss.started() => {
                    ss.earnings_record.push(EarningsRecord {
                        year,
                        amount: realized.wages.min(self.tax.fica.wage_base),
                    });
                }
                Income::Pension(pension) if pension.calculated_benefit <= 0.0 => {
                    pension.salary_history.push(EarningsRecord {
                        year,
                        amount: realized.wages,
                    });
                    pension.service_years += 1.0;
                }
                _ => {}
            }
        }
    }

    fn finish(
        mut self,
        incomes: Vec<Income>,
        expenses: Vec<Expense>,
        retired: bool,
        strategy: Option<StrategyDiagnostic>,
        total_expense: f64,
    ) -> SimulationYear {
        let ctx = self.ctx;
        let assumptions = ctx.assumptions;
        let market_return = self
            .engine
            .returns
            .and_then(|returns| returns.get(ctx.index))
            .map(|nominal| assumptions.economy.deflate(*nominal))
            .unwrap_or_else(|| assumptions.effective_return());
        let growth = AccountGrowth {
            market_return,
            economy: &assumptions.economy,
            working: !retired,
        };
        let accounts: Vec<Account> = self
            .accounts
            .iter()
            .zip(&self.flows)
            .map(|(account, flows)| advance_account(account, flows, &growth))
            .collect();

        self.taxes.marginal_federal_rate = self
            .tax
            .federal
            .as_ref()
            .map(|p| {
                marginal_rate(
                    self.liability.federal_income - self.tax.federal_deduction,
                    &p.brackets,
                )
            })
            .unwrap_or(0.0);
        self.cashflow.total_income = snap_cents(self.cashflow.income_detail.values().sum());
        self.cashflow.total_expense = snap_cents(total_expense);

        let net_worth = net_worth(&accounts);
        debug!(
            year = ctx.year,
            age = self.age,
            net_worth,
            withdrawals = self.cashflow.withdrawals,
            "projected year"
        );
        SimulationYear {
            year: ctx.year,
            age: self.age,
            retired,
            incomes,
            expenses,
            accounts,
            cashflow: self.cashflow,
            taxes: self.taxes,
            logs: self.logs,
            strategy,
            rmd: self.rmd,
            roth_conversion: self.roth_conversion,
            net_worth,
        }
    }
}

fn proportional_basis(account: &Account, gross: f64) -> f64 {
    match account {
        Account::Invested(invested) if invested.amount > 0.0 => {
            invested.cost_basis.max(0.0) * (gross / invested.amount).min(1.0)
        }
        _ => 0.0,
    }
}

/// Most recent year in `first..=year` for which `lookup` has data.
fn latest_known<T>(first: i32, year: i32, lookup: impl Fn(i32) -> Option<T>) -> Option<(i32, T)> {
    (first.min(year)..=year)
        .rev()
        .find_map(|candidate| lookup(candidate).map(|found| (candidate, found)))
}

/// Federal schedules fall back to the latest year the source knows; a
/// missing state table means no state tax.
fn resolve_tax_year(
    tables: &dyn TaxParameterSource,
    ctx: &YearContext<'_>,
    logs: &mut Vec<String>,
) -> TaxYear {
    let tax_state = ctx.tax_state;
    let status = tax_state.filing_status;
    let assumptions = ctx.assumptions;
    let first_year = assumptions.demographics.start_year;
    let federal_overridden = tax_state.federal_override.is_some();

    let federal = if federal_overridden {
        None
    } else {
        let found = latest_known(first_year, ctx.year, |year| {
            tables.tax_parameters(year, status, Jurisdiction::Federal, assumptions)
        });
        match found {
            Some((year, params)) => {
                if year != ctx.year {
                    warn!(year = ctx.year, table_year = year, "federal tax table carried forward");
                    logs.push(format!(
                        "no federal tax table for {}; using the {year} table",
                        ctx.year
                    ));
                }
                Some(params)
            }
            None => {
                warn!(year = ctx.year, "no federal tax table; tax treated as zero");
                logs.push(format!(
                    "no federal tax table for {}; federal tax treated as zero",
                    ctx.year
                ));
                None
            }
        }
    };
    let state_jurisdiction = Jurisdiction::State(&tax_state.state_code);
    let state = if tax_state.state_override.is_some() {
        None
    } else {
        let params = tables.tax_parameters(ctx.year, status, state_jurisdiction, assumptions);
        if params.is_none() {
            warn!(year = ctx.year, jurisdiction = %state_jurisdiction, "no tax table; tax treated as zero");
            logs.push(format!(
                "no {state_jurisdiction} tax table for {}; {state_jurisdiction} tax treated as zero",
                ctx.year
            ));
        }
        params
    };
    let capital_gains = if federal_overridden {
        None
    } else {
        latest_known(first_year, ctx.year, |year| {
            tables.capital_gains_brackets(year, status, assumptions)
        })
        .map(|(_, brackets)| brackets)
    };
    TaxYear {
        federal_deduction: federal
            .as_ref()
            .map(|p| deduction(p, &tax_state.deduction))
            .unwrap_or(0.0),
        state_deduction: state
            .as_ref()
            .map(|p| deduction(p, &tax_state.deduction))
            .unwrap_or(0.0),
        federal,
        state,
        capital_gains,
        fica: tables.fica(ctx.year, status, assumptions),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entities::{
        ContributionLimitKind, ExpenseCore, FutureSocialSecurityIncome, RecurringExpense,
        SavedAccount, SocialSecurityIncome, WorkIncome,
    };
    use crate::core::types::{Guardrail, PriorityBucket};
    use proptest::prelude::{prop_assert, proptest};

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    /// Flat economy: no inflation, no growth, 30-year-old in 2024.
    fn flat_assumptions() -> Assumptions {
        let mut a = Assumptions::default();
        a.economy.inflation_rate = 0.0;
        a.economy.healthcare_inflation = 0.0;
        a.economy.inflation_adjusted = true;
        a.income.salary_growth = 0.0;
        a.investments.return_rate = 0.0;
        a.demographics.birth_year = 1994;
        a.demographics.start_year = 2024;
        a.demographics.retirement_age = 65;
        a.demographics.life_expectancy = 90;
        a
    }

    fn retiree_assumptions(age: u32) -> Assumptions {
        let mut a = flat_assumptions();
        a.demographics.birth_year = 2024 - age as i32;
        a.demographics.retirement_age = 60;
        a.demographics.life_expectancy = 100;
        a
    }

    fn account<'y>(year: &'y SimulationYear, id: &str) -> &'y Account {
        year.accounts
            .iter()
            .find(|a| a.id() == id)
            .expect("account present")
    }

    fn expense(id: &str, annual: f64) -> Expense {
        Expense::Recurring(RecurringExpense::new(id, annual))
    }

    struct FailingBenefits;

    impl BenefitCalculator for FailingBenefits {
        fn primary_insurance_amount(
            &self,
            _earnings: &[EarningsRecord],
            _birth_year: i32,
            _assumptions: &Assumptions,
        ) -> Result<f64, EngineError> {
            Err(EngineError::Benefit("earnings service unavailable".to_string()))
        }
    }

    #[test]
    fn shortfall_is_withdrawn_so_discretionary_cash_is_zero() {
        let assumptions = flat_assumptions();
        let accounts = vec![Account::Saved(SavedAccount::new("cash", 200_000.0, 0.0))];
        let incomes = vec![Income::Work(WorkIncome::new("job", 50_000.0))];
        let expenses = vec![expense("living", 80_000.0)];
        let years = run_projection(
            1,
            &accounts,
            &incomes,
            &expenses,
            &assumptions,
            &TaxState::default(),
        )
        .expect("projection");
        let first = &years[0];
        assert_eq!(first.cashflow.discretionary, 0.0);
        assert!(first.cashflow.withdrawals > 30_000.0);
        assert!(account(first, "cash").assets() < 200_000.0);
        assert_eq!(first.cashflow.deficit_debt_added, 0.0);
    }

    #[test]
    fn projection_stops_at_life_expectancy() {
        let mut assumptions = flat_assumptions();
        assumptions.demographics.life_expectancy = 40;
        let years = run_projection(50, &[], &[], &[], &assumptions, &TaxState::default())
            .expect("projection");
        assert_eq!(years.len(), 11);
        assert_eq!(years.first().map(|y| y.age), Some(30));
        assert_eq!(years.last().map(|y| y.age), Some(40));
    }

    #[test]
    fn nominal_projection_ends_richer_than_real_one() {
        let mut nominal = flat_assumptions();
        nominal.economy.inflation_rate = 0.03;
        nominal.investments.return_rate = 0.07;
        let mut real = nominal.clone();
        real.economy.inflation_adjusted = false;
        let accounts = vec![
            Account::Saved(SavedAccount::new("cash", 20_000.0, 0.02)),
            Account::Invested(InvestedAccount::new("brokerage", 100_000.0, TaxType::Brokerage)),
        ];
        let nominal_years =
            run_projection(10, &accounts, &[], &[], &nominal, &TaxState::default()).expect("nominal");
        let real_years =
            run_projection(10, &accounts, &[], &[], &real, &TaxState::default()).expect("real");
        let nominal_end = nominal_years.last().map(|y| y.net_worth).unwrap_or_default();
        let real_end = real_years.last().map(|y| y.net_worth).unwrap_or_default();
        assert!(nominal_end > real_end, "{nominal_end} <= {real_end}");

        // Both runs start from the same household; only growth differs.
        let start = net_worth(&accounts);
        assert_approx_tol(start, 120_000.0, 1e-9);
        assert_eq!(nominal_years[0].incomes.len(), real_years[0].incomes.len());
        assert_eq!(nominal_years[0].cashflow.total_expense, real_years[0].cashflow.total_expense);
        assert!(nominal_years[0].net_worth >= start);
        assert!(real_years[0].net_worth >= start);
    }

    #[test]
    fn adding_social_security_leaves_fica_unchanged() {
        let mut assumptions = flat_assumptions();
        // Past full retirement age, so the earnings test does not apply.
        assumptions.demographics.birth_year = 1956;
        assumptions.demographics.retirement_age = 70;
        let accounts = vec![Account::Saved(SavedAccount::new("cash", 0.0, 0.0))];
        let work = Income::Work(WorkIncome::new("job", 120_000.0));
        let ss = Income::SocialSecurity(SocialSecurityIncome {
            core: IncomeCore::new("ss", 3_000.0, Frequency::Monthly),
            cola: true,
        });
        let without = run_projection(1, &accounts, &[work.clone()], &[], &assumptions, &TaxState::default())
            .expect("projection");
        let with = run_projection(1, &accounts, &[work, ss], &[], &assumptions, &TaxState::default())
            .expect("projection");
        assert!(without[0].taxes.fica > 0.0);
        assert_eq!(without[0].taxes.fica, with[0].taxes.fica);
        assert!(with[0].taxes.federal > without[0].taxes.federal);
    }

    fn single_brackets() -> Vec<Bracket> {
        StaticTaxTables
            .tax_parameters(2024, FilingStatus::Single, Jurisdiction::Federal, &flat_assumptions())
            .expect("federal table")
            .brackets
    }

    #[test]
    fn ira_draws_make_social_security_taxable() {
        let assumptions = retiree_assumptions(70);
        let ss = Income::SocialSecurity(SocialSecurityIncome {
            core: IncomeCore::new("ss", 2_500.0, Frequency::Monthly),
            cola: true,
        });
        let accounts = vec![Account::Invested(InvestedAccount::new(
            "ira",
            800_000.0,
            TaxType::TraditionalIra,
        ))];
        let years = run_projection(
            1,
            &accounts,
            &[ss],
            &[expense("living", 60_000.0)],
            &assumptions,
            &TaxState::default(),
        )
        .expect("projection");
        let first = &years[0];
        let drawn = first.cashflow.withdrawals;
        let taxable_ss = taxable_social_security(drawn, 30_000.0, FilingStatus::Single);
        assert!(taxable_ss > 15_000.0, "taxable share {taxable_ss}");
        assert_approx_tol(first.taxes.taxable_social_security, taxable_ss, 1e-6);
        // Federal tax is on the draw plus the taxable share, not the draw alone.
        let expected = income_tax(drawn + taxable_ss, 14_600.0, &single_brackets());
        assert_approx_tol(first.taxes.federal, expected, 0.01);
        assert!(first.taxes.federal > income_tax(drawn, 14_600.0, &single_brackets()));
        assert_approx_tol(drawn - first.taxes.federal, 30_000.0, 0.01);
        assert_eq!(first.cashflow.discretionary, 0.0);
    }

    #[test]
    fn later_ordinary_draws_push_brokerage_gains_out_of_zero_band() {
        let assumptions = retiree_assumptions(62);
        let mut brokerage = InvestedAccount::new("brokerage", 30_000.0, TaxType::Brokerage);
        brokerage.cost_basis = 0.0;
        let accounts = vec![
            Account::Invested(brokerage),
            Account::Invested(InvestedAccount::new("ira", 500_000.0, TaxType::TraditionalIra)),
        ];
        let years = run_projection(
            1,
            &accounts,
            &[],
            &[expense("living", 100_000.0)],
            &assumptions,
            &TaxState::default(),
        )
        .expect("projection");
        let first = &years[0];
        let detail = &first.cashflow.withdrawal_detail;
        assert_approx_tol(detail["brokerage"], 30_000.0, 1e-6);
        let ira = detail["ira"];
        // Ordinary taxable income tops the 15% gains threshold, so every
        // dollar of the gain lands in the 15% band.
        assert!(ira - 14_600.0 > 47_025.0);
        assert_approx_tol(first.taxes.capital_gains, 4_500.0, 0.01);
        assert_approx_tol(
            first.taxes.federal,
            income_tax(ira, 14_600.0, &single_brackets()),
            0.01,
        );
        assert_approx_tol(
            first.cashflow.withdrawals - first.taxes.total_tax(),
            100_000.0,
            0.01,
        );
    }

    #[test]
    fn forced_rmd_reprices_gains_sold_earlier() {
        let assumptions = retiree_assumptions(80);
        let mut brokerage = InvestedAccount::new("brokerage", 40_000.0, TaxType::Brokerage);
        brokerage.cost_basis = 0.0;
        let accounts = vec![
            Account::Invested(brokerage),
            Account::Invested(InvestedAccount::new("ira", 2_000_000.0, TaxType::TraditionalIra)),
        ];
        let years = run_projection(
            1,
            &accounts,
            &[],
            &[expense("living", 20_000.0)],
            &assumptions,
            &TaxState::default(),
        )
        .expect("projection");
        let first = &years[0];
        let rmd = first.rmd.as_ref().expect("rmd diagnostic");
        assert!(rmd.forced_gross > 47_025.0 + 14_600.0);
        // The 20k sale was priced in the zero band; the RMD moves it to 15%.
        let gains = first.cashflow.withdrawal_detail["brokerage"];
        assert_approx_tol(gains, 20_000.0, 0.01);
        assert_approx_tol(first.taxes.capital_gains, gains * 0.15, 0.01);
        assert_approx_tol(rmd.forced_net, rmd.forced_gross - first.taxes.total_tax(), 0.01);
    }

    /// Knows federal schedules for 2024 only.
    struct FirstYearOnly;

    impl TaxParameterSource for FirstYearOnly {
        fn tax_parameters(
            &self,
            year: i32,
            status: FilingStatus,
            jurisdiction: Jurisdiction<'_>,
            assumptions: &Assumptions,
        ) -> Option<TaxParameters> {
            match jurisdiction {
                Jurisdiction::Federal if year != 2024 => None,
                _ => StaticTaxTables.tax_parameters(year, status, jurisdiction, assumptions),
            }
        }

        fn capital_gains_brackets(
            &self,
            year: i32,
            status: FilingStatus,
            assumptions: &Assumptions,
        ) -> Option<Vec<Bracket>> {
            (year == 2024)
                .then(|| StaticTaxTables.capital_gains_brackets(year, status, assumptions))
                .flatten()
        }

        fn fica(
            &self,
            year: i32,
            status: FilingStatus,
            assumptions: &Assumptions,
        ) -> FicaParameters {
            StaticTaxTables.fica(year, status, assumptions)
        }

        fn rmd_divisor(&self, age: u32) -> Option<f64> {
            StaticTaxTables.rmd_divisor(age)
        }

        fn contribution_limit(
            &self,
            kind: ContributionLimitKind,
            year: i32,
            age: u32,
            assumptions: &Assumptions,
        ) -> f64 {
            StaticTaxTables.contribution_limit(kind, year, age, assumptions)
        }

        fn earnings_test_exempt_amount(&self, year: i32, assumptions: &Assumptions) -> f64 {
            StaticTaxTables.earnings_test_exempt_amount(year, assumptions)
        }
    }

    #[test]
    fn missing_federal_table_carries_latest_year_forward() {
        let assumptions = flat_assumptions();
        let engine = ProjectionEngine::new(&FirstYearOnly, &BendPointCalculator, &High3Pension);
        let years = engine
            .project(
                3,
                &[Account::Saved(SavedAccount::new("cash", 0.0, 0.0))],
                &[Income::Work(WorkIncome::new("job", 100_000.0))],
                &[],
                &assumptions,
                &TaxState::default(),
            )
            .expect("projection");
        assert_approx_tol(years[0].taxes.federal, 13_841.0, 1e-6);
        for later in &years[1..] {
            assert_approx_tol(later.taxes.federal, years[0].taxes.federal, 1e-6);
            assert!(later.logs.iter().any(|l| l.contains("using the 2024 table")));
        }
        assert!(years[0].logs.iter().all(|l| !l.contains("using the")));
    }

    #[test]
    fn unfunded_spending_becomes_deficit_debt() {
        let assumptions = flat_assumptions();
        let years = run_projection(
            2,
            &[],
            &[],
            &[expense("rent", 10_000.0)],
            &assumptions,
            &TaxState::default(),
        )
        .expect("projection");
        assert_eq!(years.len(), 2);
        assert_approx_tol(years[0].cashflow.deficit_debt_added, 10_000.0, 1e-6);
        assert_approx_tol(account(&years[0], DEFICIT_DEBT_ID).liabilities(), 10_000.0, 1e-6);
        assert_approx_tol(years[0].net_worth, -10_000.0, 1e-6);
        assert_approx_tol(years[1].net_worth, -20_000.0, 1e-6);
        assert!(years[0].logs.iter().any(|l| l.contains("deficit debt")));
    }

    #[test]
    fn surplus_repays_deficit_debt_before_buckets() {
        let mut assumptions = flat_assumptions();
        assumptions.priorities = vec![PriorityBucket {
            account_id: "cash".into(),
            policy: AllocationPolicy::Remainder,
        }];
        let accounts = vec![
            Account::Saved(SavedAccount::new("cash", 0.0, 0.0)),
            Account::DeficitDebt(DeficitDebtAccount {
                id: "old-deficit".into(),
                name: "old".into(),
                amount: 5_000.0,
                apr: 0.0,
            }),
        ];
        let mut windfall_core = IncomeCore::new("gift", 8_000.0, Frequency::Annually);
        windfall_core.name = "Gift".into();
        let incomes = vec![Income::Windfall(crate::core::entities::WindfallIncome {
            core: windfall_core,
            taxable: false,
        })];
        let years = run_projection(1, &accounts, &incomes, &[], &assumptions, &TaxState::default())
            .expect("projection");
        let first = &years[0];
        assert_approx_tol(first.cashflow.deficit_debt_repaid, 5_000.0, 1e-6);
        assert_approx_tol(account(first, "old-deficit").liabilities(), 0.0, 1e-6);
        assert_approx_tol(account(first, "cash").assets(), 3_000.0, 1e-6);
        assert_approx_tol(first.cashflow.bucket_detail["cash"], 3_000.0, 1e-6);
    }

    #[test]
    fn capped_and_fixed_buckets_fill_in_order() {
        let mut assumptions = flat_assumptions();
        assumptions.priorities = vec![
            PriorityBucket {
                account_id: "emergency".into(),
                policy: AllocationPolicy::MultipleOfExpenses { multiple: 6.0 },
            },
            PriorityBucket {
                account_id: "roth".into(),
                policy: AllocationPolicy::CappedMax { cap: 7_000.0 },
            },
            PriorityBucket {
                account_id: "brokerage".into(),
                policy: AllocationPolicy::FixedMonthly { amount: 100.0 },
            },
        ];
        let accounts = vec![
            Account::Saved(SavedAccount::new("emergency", 10_000.0, 0.0)),
            Account::Invested(InvestedAccount::new("roth", 0.0, TaxType::RothIra)),
            Account::Invested(InvestedAccount::new("brokerage", 0.0, TaxType::Brokerage)),
        ];
        let incomes = vec![Income::Windfall(crate::core::entities::WindfallIncome {
            core: IncomeCore::new("gift", 50_000.0, Frequency::Annually),
            taxable: false,
        })];
        let years = run_projection(
            1,
            &accounts,
            &incomes,
            &[expense("living", 24_000.0)],
            &assumptions,
            &TaxState::default(),
        )
        .expect("projection");
        let detail = &years[0].cashflow.bucket_detail;
        // 6 months of 24k/yr is 12k; 10k already saved.
        assert_approx_tol(detail["emergency"], 2_000.0 + (26_000.0 - 2_000.0 - 7_000.0 - 1_200.0), 1e-6);
        assert_approx_tol(detail["roth"], 7_000.0, 1e-6);
        assert_approx_tol(detail["brokerage"], 1_200.0, 1e-6);
        assert_eq!(years[0].cashflow.unallocated, 0.0);
    }

    #[test]
    fn rmds_are_forced_even_without_a_spending_need() {
        let assumptions = retiree_assumptions(80);
        let accounts = vec![
            Account::Saved(SavedAccount::new("cash", 0.0, 0.0)),
            Account::Invested(InvestedAccount::new("ira", 1_000_000.0, TaxType::TraditionalIra)),
        ];
        let years = run_projection(1, &accounts, &[], &[], &assumptions, &TaxState::default())
            .expect("projection");
        let first = &years[0];
        let rmd = first.rmd.as_ref().expect("rmd diagnostic");
        let divisor = StaticTaxTables.rmd_divisor(80).expect("divisor");
        assert_approx_tol(rmd.required_total, 1_000_000.0 / divisor, 1e-6);
        assert_approx_tol(rmd.forced_gross, 1_000_000.0 / divisor, 1e-6);
        assert_eq!(rmd.shortfall, 0.0);
        assert_approx_tol(account(first, "cash").assets(), rmd.forced_net, 0.01);
        assert!(rmd.forced_net < rmd.forced_gross);
    }

    #[test]
    fn waterfall_withdrawals_count_toward_the_rmd() {
        let assumptions = retiree_assumptions(80);
        let accounts = vec![Account::Invested(InvestedAccount::new(
            "ira",
            100_000.0,
            TaxType::TraditionalIra,
        ))];
        let years = run_projection(
            1,
            &accounts,
            &[],
            &[expense("living", 40_000.0)],
            &assumptions,
            &TaxState::default(),
        )
        .expect("projection");
        let rmd = years[0].rmd.as_ref().expect("rmd diagnostic");
        assert_eq!(rmd.forced_gross, 0.0);
        assert!(rmd.distributed_total > rmd.required_total);
    }

    #[test]
    fn early_traditional_withdrawal_pays_penalty() {
        let mut assumptions = flat_assumptions();
        assumptions.demographics.retirement_age = 30;
        let accounts = vec![Account::Invested(InvestedAccount::new(
            "401k",
            500_000.0,
            TaxType::Traditional401k,
        ))];
        let years = run_projection(
            1,
            &accounts,
            &[],
            &[expense("living", 30_000.0)],
            &assumptions,
            &TaxState::default(),
        )
        .expect("projection");
        let first = &years[0];
        assert!(first.taxes.penalties > 0.0);
        assert_approx_tol(first.taxes.penalties, first.cashflow.withdrawals * 0.10, 0.01);
        assert_eq!(first.cashflow.discretionary, 0.0);
    }

    #[test]
    fn early_roth_withdrawal_returns_contributions_first() {
        let mut assumptions = flat_assumptions();
        assumptions.demographics.retirement_age = 30;
        let mut roth = InvestedAccount::new("roth", 100_000.0, TaxType::RothIra);
        roth.cost_basis = 40_000.0;
        let years = run_projection(
            1,
            &[Account::Invested(roth)],
            &[],
            &[expense("living", 30_000.0)],
            &assumptions,
            &TaxState::default(),
        )
        .expect("projection");
        let first = &years[0];
        assert_eq!(first.taxes.penalties, 0.0);
        assert_approx_tol(first.cashflow.withdrawals, 30_000.0, 1e-6);
        let Account::Invested(after) = account(first, "roth") else {
            panic!("invested");
        };
        assert_approx_tol(after.cost_basis, 10_000.0, 1e-6);
    }

    #[test]
    fn guyton_klinger_cut_scales_discretionary_expenses() {
        let mut assumptions = retiree_assumptions(65);
        assumptions.investments.withdrawal_strategy = WithdrawalStrategy::GuytonKlinger;
        assumptions.investments.withdrawal_rate = 0.04;
        let accounts = vec![Account::Invested(InvestedAccount::new(
            "stocks",
            1_000_000.0,
            TaxType::Brokerage,
        ))];
        let mut travel = RecurringExpense::new("travel", 30_000.0);
        travel.core.is_discretionary = true;
        let expenses = vec![expense("essentials", 20_000.0), Expense::Recurring(travel)];
        let crash = [-0.5];
        let years = ProjectionEngine::default()
            .with_returns(&crash)
            .project(2, &accounts, &[], &expenses, &assumptions, &TaxState::default())
            .expect("projection");

        assert_eq!(years[0].strategy.as_ref().and_then(|s| s.guardrail), None);
        let second = &years[1];
        let strategy = second.strategy.as_ref().expect("strategy");
        assert_eq!(strategy.guardrail, Some(Guardrail::CapitalPreservation));
        assert_approx_tol(strategy.discretionary_adjustment, -4_000.0, 1e-6);
        assert_approx_tol(second.expenses[1].core().amount, 26_000.0, 1e-6);
        assert_approx_tol(second.expenses[0].core().amount, 20_000.0, 1e-9);
        assert_approx_tol(second.cashflow.total_expense, 46_000.0, 1e-6);
    }

    #[test]
    fn failing_benefit_calculator_degrades_to_no_op() {
        let mut assumptions = flat_assumptions();
        assumptions.demographics.birth_year = 1957;
        assumptions.demographics.retirement_age = 65;
        let mut ss = FutureSocialSecurityIncome::new("ss", 67);
        ss.earnings_record.push(EarningsRecord {
            year: 2020,
            amount: 80_000.0,
        });
        let engine = ProjectionEngine::new(&StaticTaxTables, &FailingBenefits, &High3Pension);
        let years = engine
            .project(
                2,
                &[Account::Saved(SavedAccount::new("cash", 50_000.0, 0.0))],
                &[Income::FutureSocialSecurity(ss)],
                &[],
                &assumptions,
                &TaxState::default(),
            )
            .expect("projection");
        assert_eq!(years.len(), 2);
        let Income::FutureSocialSecurity(after) = &years[0].incomes[0] else {
            panic!("future social security");
        };
        assert!(!after.started());
        assert!(years[0].logs.iter().any(|l| l.contains("earnings service unavailable")));
    }

    #[test]
    fn social_security_is_claimed_once_at_claiming_age() {
        let mut assumptions = flat_assumptions();
        assumptions.demographics.birth_year = 1958;
        assumptions.demographics.retirement_age = 60;
        let mut ss = FutureSocialSecurityIncome::new("ss", 67);
        ss.earnings_record = (1980..2015)
            .map(|year| EarningsRecord {
                year,
                amount: 60_000.0,
            })
            .collect();
        let years = run_projection(
            3,
            &[Account::Saved(SavedAccount::new("cash", 100_000.0, 0.0))],
            &[Income::FutureSocialSecurity(ss)],
            &[],
            &assumptions,
            &TaxState::default(),
        )
        .expect("projection");
        // Age 66 in 2024, claims in 2025.
        assert!(!years[0].cashflow.income_detail.contains_key("ss"));
        let Income::FutureSocialSecurity(claimed) = &years[1].incomes[0] else {
            panic!("future social security");
        };
        assert!(claimed.started());
        let pia = claimed.calculated_pia;
        let Income::FutureSocialSecurity(later) = &years[2].incomes[0] else {
            panic!("future social security");
        };
        assert_eq!(later.calculated_pia, pia);
        assert_approx_tol(years[1].cashflow.income_detail["ss"], pia * 12.0, 1e-6);
    }

    #[test]
    fn working_years_extend_earnings_history() {
        let assumptions = flat_assumptions();
        let years = run_projection(
            2,
            &[Account::Saved(SavedAccount::new("cash", 0.0, 0.0))],
            &[
                Income::Work(WorkIncome::new("job", 500_000.0)),
                Income::FutureSocialSecurity(FutureSocialSecurityIncome::new("ss", 67)),
            ],
            &[],
            &assumptions,
            &TaxState::default(),
        )
        .expect("projection");
        let Income::FutureSocialSecurity(ss) = &years[1].incomes[1] else {
            panic!("future social security");
        };
        assert_eq!(ss.earnings_record.len(), 2);
        assert!(ss.earnings_record[0].amount < 500_000.0);
    }

    #[test]
    fn interest_is_regenerated_not_compounded_as_income() {
        let assumptions = flat_assumptions();
        let years = run_projection(
            3,
            &[Account::Saved(SavedAccount::new("cash", 100_000.0, 0.05))],
            &[],
            &[],
            &assumptions,
            &TaxState::default(),
        )
        .expect("projection");
        for year in &years {
            let interest: Vec<_> = year.incomes.iter().filter(|i| i.is_interest()).collect();
            assert_eq!(interest.len(), 1);
        }
        assert_approx_tol(years[0].cashflow.income_detail["interest-cash"], 5_000.0, 1e-6);
        assert_approx_tol(years[1].cashflow.income_detail["interest-cash"], 5_250.0, 1e-6);
        assert_approx_tol(account(&years[0], "cash").assets(), 105_000.0, 1e-6);
    }

    #[test]
    fn state_without_table_is_untaxed_and_logged() {
        let assumptions = flat_assumptions();
        let tax_state = TaxState {
            state_code: "ZZ".into(),
            ..TaxState::default()
        };
        let years = run_projection(
            1,
            &[Account::Saved(SavedAccount::new("cash", 0.0, 0.0))],
            &[Income::Work(WorkIncome::new("job", 80_000.0))],
            &[],
            &assumptions,
            &tax_state,
        )
        .expect("projection");
        assert_eq!(years[0].taxes.state, 0.0);
        assert!(years[0].logs.iter().any(|l| l.contains("tax treated as zero")));
    }

    #[test]
    fn overrides_replace_calculated_liabilities() {
        let assumptions = flat_assumptions();
        let tax_state = TaxState {
            filing_status: FilingStatus::MarriedJoint,
            federal_override: Some(1_234.0),
            fica_override: Some(0.0),
            ..TaxState::default()
        };
        let years = run_projection(
            1,
            &[Account::Saved(SavedAccount::new("cash", 0.0, 0.0))],
            &[Income::Work(WorkIncome::new("job", 80_000.0))],
            &[],
            &assumptions,
            &tax_state,
        )
        .expect("projection");
        assert_eq!(years[0].taxes.federal, 1_234.0);
        assert_eq!(years[0].taxes.fica, 0.0);
    }

    #[test]
    fn auto_roth_conversion_fills_to_target_before_rmd_age() {
        let mut assumptions = retiree_assumptions(62);
        assumptions.investments.auto_roth_conversion = true;
        assumptions.investments.roth_conversion_floor_rate = 0.12;
        let accounts = vec![
            Account::Saved(SavedAccount::new("cash", 200_000.0, 0.0)),
            Account::Invested(InvestedAccount::new("ira", 500_000.0, TaxType::TraditionalIra)),
        ];
        let years = run_projection(
            1,
            &accounts,
            &[],
            &[expense("living", 20_000.0)],
            &assumptions,
            &TaxState::default(),
        )
        .expect("projection");
        let conversion = years[0].roth_conversion.as_ref().expect("conversion");
        assert!(conversion.target_rate >= 0.12);
        assert_eq!(conversion.destination, ROTH_CONVERSION_ID);
        let roth = account(&years[0], ROTH_CONVERSION_ID);
        assert_approx_tol(roth.assets(), conversion.amount, 1e-6);
        assert!(years[0].taxes.federal > 0.0);
        // Nothing else is taxable, so the conversion fills the 12% bracket
        // plus the standard deduction.
        assert_approx_tol(conversion.amount, 47_150.0 + 14_600.0, 1e-6);
    }

    #[test]
    fn invalid_inputs_are_rejected_up_front() {
        let mut assumptions = flat_assumptions();
        assumptions.economy.inflation_rate = f64::NAN;
        assert!(matches!(
            run_projection(5, &[], &[], &[], &assumptions, &TaxState::default()),
            Err(EngineError::InvalidInput(_))
        ));
        let assumptions = flat_assumptions();
        let dupes = vec![
            Account::Saved(SavedAccount::new("a", 1.0, 0.0)),
            Account::Saved(SavedAccount::new("a", 2.0, 0.0)),
        ];
        assert!(run_projection(5, &dupes, &[], &[], &assumptions, &TaxState::default()).is_err());
        let mut late = flat_assumptions();
        late.demographics.life_expectancy = 25;
        assert!(matches!(
            run_projection(5, &[], &[], &[], &late, &TaxState::default()),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn mortgage_principal_reduces_linked_property_loan() {
        let assumptions = flat_assumptions();
        let accounts = vec![
            Account::Saved(SavedAccount::new("cash", 100_000.0, 0.0)),
            Account::Property(crate::core::entities::PropertyAccount {
                id: "home".into(),
                name: "Home".into(),
                value: 400_000.0,
                loan_balance: 200_000.0,
                appreciation_rate: Some(0.0),
            }),
        ];
        let mortgage = Expense::Mortgage(crate::core::entities::MortgageExpense {
            core: ExpenseCore::new("mortgage", 1_500.0, Frequency::Monthly),
            balance: 200_000.0,
            apr: 0.06,
            escrow: 0.0,
            property_account_id: Some("home".into()),
        });
        let years = run_projection(1, &accounts, &[], &[mortgage], &assumptions, &TaxState::default())
            .expect("projection");
        let principal = expense_cost(&years[0].expenses[0], 2024).principal;
        assert!(principal > 0.0);
        assert_approx_tol(
            account(&years[0], "home").liabilities(),
            200_000.0 - principal,
            1e-6,
        );
        assert_approx_tol(years[0].cashflow.total_expense, 18_000.0, 1e-6);
    }

    proptest! {
        #[test]
        fn net_worth_moves_by_income_less_taxes_and_spending(
            salary in 0.0f64..250_000.0,
            spending in 0.0f64..150_000.0,
            cash in 0.0f64..300_000.0,
            pre_tax in 0.0f64..20_000.0,
        ) {
            let assumptions = flat_assumptions();
            let accounts = vec![
                Account::Saved(SavedAccount::new("cash", cash, 0.0)),
                Account::Invested(InvestedAccount::new("401k", 50_000.0, TaxType::Traditional401k)),
            ];
            let mut work = WorkIncome::new("job", salary);
            work.pre_tax_contribution = pre_tax.min(salary);
            let years = run_projection(
                3,
                &accounts,
                &[Income::Work(work)],
                &[expense("living", spending)],
                &assumptions,
                &TaxState::default(),
            )
            .expect("projection");
            let mut previous = net_worth(&accounts);
            for year in &years {
                let expected = previous + year.cashflow.total_income
                    - year.taxes.total_tax()
                    - year.cashflow.total_expense;
                prop_assert!(
                    (year.net_worth - expected).abs() <= SOLVER_OVERSHOOT_LIMIT,
                    "year {}: {} vs {}", year.year, year.net_worth, expected
                );
                previous = year.net_worth;
            }
        }
    }
}
