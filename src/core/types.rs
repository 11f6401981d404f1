use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::entities::{Account, Expense, Income};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilingStatus {
    #[serde(alias = "single")]
    Single,
    #[serde(alias = "marriedJoint", alias = "married_joint")]
    MarriedJoint,
    #[serde(alias = "marriedSeparate", alias = "married_separate")]
    MarriedSeparate,
    #[serde(alias = "headOfHousehold", alias = "head_of_household")]
    HeadOfHousehold,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum DeductionMethod {
    Standard,
    Itemized { amount: f64 },
}

/// Filing facts for the household. Any override short-circuits the matching
/// calculation: the stated liability is used verbatim and incremental
/// withdrawal tax for that jurisdiction is treated as zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaxState {
    pub filing_status: FilingStatus,
    pub state_code: String,
    pub deduction: DeductionMethod,
    pub federal_override: Option<f64>,
    pub fica_override: Option<f64>,
    pub state_override: Option<f64>,
}

impl Default for TaxState {
    fn default() -> Self {
        Self {
            filing_status: FilingStatus::Single,
            state_code: "TX".to_string(),
            deduction: DeductionMethod::Standard,
            federal_override: None,
            fica_override: None,
            state_override: None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WithdrawalStrategy {
    /// Rate applied to the first retirement-year portfolio, held flat.
    #[serde(alias = "fixedPercentage")]
    FixedPercentage,
    /// Rate applied to the current portfolio every year.
    #[serde(alias = "percentageOfPortfolio")]
    PercentageOfPortfolio,
    /// First-year amount escalated by inflation.
    #[serde(alias = "inflationAdjusted")]
    InflationAdjusted,
    #[serde(alias = "guytonKlinger", alias = "guyton_klinger")]
    GuytonKlinger,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GuardrailSettings {
    /// Prosperity fires when the current rate falls below
    /// `rate * (1 - prosperity_threshold)`.
    pub prosperity_threshold: f64,
    /// Capital preservation fires when the current rate exceeds
    /// `rate * (1 + preservation_threshold)`.
    pub preservation_threshold: f64,
    pub adjustment: f64,
    pub fifteen_year_rule: bool,
}

impl Default for GuardrailSettings {
    fn default() -> Self {
        Self {
            prosperity_threshold: 0.20,
            preservation_threshold: 0.20,
            adjustment: 0.10,
            fifteen_year_rule: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MacroAssumptions {
    pub inflation_rate: f64,
    pub healthcare_inflation: f64,
    pub rent_inflation: f64,
    /// `true` projects nominal dollars, `false` projects today's dollars.
    pub inflation_adjusted: bool,
    /// Share of real salary growth that turns into discretionary spending.
    pub lifestyle_creep: f64,
}

impl Default for MacroAssumptions {
    fn default() -> Self {
        Self {
            inflation_rate: 0.03,
            healthcare_inflation: 0.05,
            rent_inflation: 0.0,
            inflation_adjusted: true,
            lifestyle_creep: 0.0,
        }
    }
}

impl MacroAssumptions {
    pub fn effective_inflation(&self) -> f64 {
        if self.inflation_adjusted {
            self.inflation_rate
        } else {
            0.0
        }
    }

    pub fn effective_healthcare_inflation(&self) -> f64 {
        self.deflate(self.healthcare_inflation)
    }

    /// Converts a nominal rate into the dollar basis of the projection.
    pub fn deflate(&self, nominal_rate: f64) -> f64 {
        if self.inflation_adjusted {
            nominal_rate
        } else {
            (1.0 + nominal_rate) / (1.0 + self.inflation_rate).max(1e-9) - 1.0
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Demographics {
    pub birth_year: i32,
    pub start_year: i32,
    pub retirement_age: u32,
    pub life_expectancy: u32,
}

impl Default for Demographics {
    fn default() -> Self {
        Self {
            birth_year: 1990,
            start_year: 2024,
            retirement_age: 65,
            life_expectancy: 90,
        }
    }
}

impl Demographics {
    pub fn age_in(&self, year: i32) -> u32 {
        (year - self.birth_year).max(0) as u32
    }

    pub fn start_age(&self) -> u32 {
        self.age_in(self.start_year)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IncomeAssumptions {
    /// Nominal annual raise applied to work income.
    pub salary_growth: f64,
}

impl Default for IncomeAssumptions {
    fn default() -> Self {
        Self {
            salary_growth: 0.03,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InvestmentAssumptions {
    /// Nominal market return for invested accounts.
    pub return_rate: f64,
    pub withdrawal_strategy: WithdrawalStrategy,
    pub withdrawal_rate: f64,
    pub guardrails: GuardrailSettings,
    pub auto_roth_conversion: bool,
    pub roth_conversion_floor_rate: f64,
}

impl Default for InvestmentAssumptions {
    fn default() -> Self {
        Self {
            return_rate: 0.07,
            withdrawal_strategy: WithdrawalStrategy::InflationAdjusted,
            withdrawal_rate: 0.04,
            guardrails: GuardrailSettings::default(),
            auto_roth_conversion: false,
            roth_conversion_floor_rate: 0.12,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AllocationPolicy {
    #[serde(alias = "fixedMonthly")]
    FixedMonthly { amount: f64 },
    Remainder,
    #[serde(alias = "cappedMax")]
    CappedMax { cap: f64 },
    /// Top the account up to `multiple` months of living expenses.
    #[serde(alias = "multipleOfExpenses")]
    MultipleOfExpenses { multiple: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityBucket {
    pub account_id: String,
    pub policy: AllocationPolicy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRule {
    pub account_id: String,
    #[serde(default)]
    pub max_annual: Option<f64>,
}

impl WithdrawalRule {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            max_annual: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Assumptions {
    #[serde(rename = "macro", alias = "economy")]
    pub economy: MacroAssumptions,
    pub demographics: Demographics,
    pub income: IncomeAssumptions,
    pub investments: InvestmentAssumptions,
    pub priorities: Vec<PriorityBucket>,
    pub withdrawal_order: Vec<WithdrawalRule>,
}

impl Assumptions {
    /// Return applied to invested balances, in the projection's dollar basis.
    pub fn effective_return(&self) -> f64 {
        self.economy.deflate(self.investments.return_rate)
    }

    pub fn effective_salary_growth(&self) -> f64 {
        self.economy.deflate(self.income.salary_growth)
    }

    /// Salary growth net of inflation, used for lifestyle creep.
    pub fn real_salary_growth(&self) -> f64 {
        (1.0 + self.income.salary_growth) / (1.0 + self.economy.inflation_rate).max(1e-9) - 1.0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashflowBreakdown {
    pub total_income: f64,
    pub total_expense: f64,
    pub discretionary: f64,
    pub invested: f64,
    pub withdrawals: f64,
    pub bucket_allocations: f64,
    pub deficit_debt_added: f64,
    pub deficit_debt_repaid: f64,
    pub unallocated: f64,
    pub income_detail: BTreeMap<String, f64>,
    pub expense_detail: BTreeMap<String, f64>,
    pub invested_detail: BTreeMap<String, f64>,
    pub withdrawal_detail: BTreeMap<String, f64>,
    pub bucket_detail: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBreakdown {
    pub federal: f64,
    pub state: f64,
    pub fica: f64,
    pub pre_tax: f64,
    pub insurance: f64,
    pub post_tax: f64,
    pub capital_gains: f64,
    pub penalties: f64,
    pub taxable_social_security: f64,
    pub marginal_federal_rate: f64,
}

impl TaxBreakdown {
    pub fn total_tax(&self) -> f64 {
        self.federal + self.state + self.fica + self.capital_gains + self.penalties
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Guardrail {
    Prosperity,
    CapitalPreservation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDiagnostic {
    pub strategy: WithdrawalStrategy,
    pub amount: f64,
    pub base_amount: f64,
    pub initial_portfolio: f64,
    pub portfolio_value: f64,
    pub current_withdrawal_rate: f64,
    pub years_in_retirement: u32,
    pub guardrail: Option<Guardrail>,
    pub suppressed_by_fifteen_year_rule: bool,
    pub discretionary_adjustment: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RmdAccountDetail {
    pub prior_balance: f64,
    pub divisor: f64,
    pub required: f64,
    pub distributed: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RmdDiagnostic {
    pub age: u32,
    pub required_total: f64,
    pub distributed_total: f64,
    pub forced_gross: f64,
    pub forced_net: f64,
    pub shortfall: f64,
    pub penalty: f64,
    pub accounts: BTreeMap<String, RmdAccountDetail>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RothConversionDiagnostic {
    pub amount: f64,
    pub target_rate: f64,
    pub observed_median_rate: Option<f64>,
    pub tax_cost: f64,
    pub destination: String,
    pub sources: BTreeMap<String, f64>,
}

/// One simulated year. Entities are the versions in force for the year;
/// account balances are end-of-year.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationYear {
    pub year: i32,
    pub age: u32,
    pub retired: bool,
    pub incomes: Vec<Income>,
    pub expenses: Vec<Expense>,
    pub accounts: Vec<Account>,
    pub cashflow: CashflowBreakdown,
    pub taxes: TaxBreakdown,
    pub logs: Vec<String>,
    pub strategy: Option<StrategyDiagnostic>,
    pub rmd: Option<RmdDiagnostic>,
    pub roth_conversion: Option<RothConversionDiagnostic>,
    pub net_worth: f64,
}

const DEFAULT_DURATION_YEARS: u32 = 30;

fn default_duration_years() -> u32 {
    DEFAULT_DURATION_YEARS
}

/// A whole household plus how long to project it; the payload accepted by
/// the CLI and the HTTP API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionRequest {
    #[serde(default = "default_duration_years")]
    pub duration_years: u32,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub incomes: Vec<Income>,
    #[serde(default)]
    pub expenses: Vec<Expense>,
    #[serde(default)]
    pub assumptions: Assumptions,
    #[serde(default)]
    pub tax_state: TaxState,
}

impl Default for ProjectionRequest {
    fn default() -> Self {
        Self {
            duration_years: DEFAULT_DURATION_YEARS,
            accounts: Vec::new(),
            incomes: Vec::new(),
            expenses: Vec::new(),
            assumptions: Assumptions::default(),
            tax_state: TaxState::default(),
        }
    }
}
