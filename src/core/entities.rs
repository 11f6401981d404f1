//! Household entities: incomes, expenses and accounts.
//!
//! Every family is a closed enum with a stable `className` discriminator so a
//! persisted record can be turned back into a typed value with
//! [`reconstitute`]. Variant structs only carry plain data.

use chrono::NaiveDate;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Frequency {
    Weekly,
    Monthly,
    #[default]
    #[serde(alias = "annual", alias = "yearly")]
    Annually,
}

impl Frequency {
    pub fn periods_per_year(self) -> f64 {
        match self {
            Frequency::Weekly => 52.0,
            Frequency::Monthly => 12.0,
            Frequency::Annually => 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarningsRecord {
    pub year: i32,
    pub amount: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeCore {
    pub id: String,
    pub name: String,
    pub amount: f64,
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default)]
    pub earned_income: bool,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl IncomeCore {
    pub fn new(id: impl Into<String>, amount: f64, frequency: Frequency) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            amount: amount.max(0.0),
            frequency,
            earned_income: false,
            start_date: None,
            end_date: None,
        }
    }

    pub fn annual_amount(&self) -> f64 {
        self.amount.max(0.0) * self.frequency.periods_per_year()
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContributionGrowth {
    #[default]
    GrowWithSalary,
    TrackAnnualMax,
    Fixed,
    /// Unrecognised strategies from older records behave as grow-with-salary.
    #[serde(other)]
    Unknown,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContributionLimitKind {
    #[default]
    Plan401k,
    Ira,
    Hsa,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkIncome {
    #[serde(flatten)]
    pub core: IncomeCore,
    #[serde(default)]
    pub pre_tax_contribution: f64,
    #[serde(default)]
    pub roth_contribution: f64,
    #[serde(default)]
    pub employer_match: f64,
    #[serde(default)]
    pub insurance_premium: f64,
    #[serde(default)]
    pub contribution_account_id: Option<String>,
    #[serde(default)]
    pub roth_account_id: Option<String>,
    #[serde(default)]
    pub match_account_id: Option<String>,
    #[serde(default)]
    pub contribution_growth: ContributionGrowth,
    #[serde(default)]
    pub limit_kind: ContributionLimitKind,
}

impl WorkIncome {
    pub fn new(id: impl Into<String>, annual_salary: f64) -> Self {
        let mut core = IncomeCore::new(id, annual_salary, Frequency::Annually);
        core.earned_income = true;
        Self {
            core,
            pre_tax_contribution: 0.0,
            roth_contribution: 0.0,
            employer_match: 0.0,
            insurance_premium: 0.0,
            contribution_account_id: None,
            roth_account_id: None,
            match_account_id: None,
            contribution_growth: ContributionGrowth::GrowWithSalary,
            limit_kind: ContributionLimitKind::Plan401k,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialSecurityIncome {
    #[serde(flatten)]
    pub core: IncomeCore,
    #[serde(default = "default_true")]
    pub cola: bool,
}

/// A benefit not yet claimed. `calculated_pia` is the monthly PIA; it stays 0
/// until the claiming-age year, when it is derived once from
/// `earnings_record`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FutureSocialSecurityIncome {
    #[serde(flatten)]
    pub core: IncomeCore,
    pub claiming_age: u32,
    #[serde(default)]
    pub calculated_pia: f64,
    #[serde(default)]
    pub earnings_record: Vec<EarningsRecord>,
    #[serde(default = "default_true")]
    pub cola: bool,
}

impl FutureSocialSecurityIncome {
    pub fn new(id: impl Into<String>, claiming_age: u32) -> Self {
        Self {
            core: IncomeCore::new(id, 0.0, Frequency::Monthly),
            claiming_age,
            calculated_pia: 0.0,
            earnings_record: Vec::new(),
            cola: true,
        }
    }

    pub fn started(&self) -> bool {
        self.calculated_pia > 0.0
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PassiveKind {
    Rental,
    Dividend,
    Interest,
    Royalty,
    Other,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassiveIncome {
    #[serde(flatten)]
    pub core: IncomeCore,
    pub kind: PassiveKind,
    #[serde(default = "default_true")]
    pub inflation_adjusted: bool,
    #[serde(default)]
    pub source_account_id: Option<String>,
    /// Taxable but not spendable: the cash stays inside the source account.
    #[serde(default)]
    pub reinvested: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindfallIncome {
    #[serde(flatten)]
    pub core: IncomeCore,
    #[serde(default)]
    pub taxable: bool,
}

/// Defined-benefit pension. `calculated_benefit` is annual and is derived
/// once at `start_age` from `salary_history`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PensionIncome {
    #[serde(flatten)]
    pub core: IncomeCore,
    pub start_age: u32,
    #[serde(default)]
    pub service_years: f64,
    #[serde(default)]
    pub multiplier: f64,
    #[serde(default)]
    pub calculated_benefit: f64,
    #[serde(default)]
    pub salary_history: Vec<EarningsRecord>,
    #[serde(default)]
    pub cola: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "className")]
pub enum Income {
    #[serde(rename = "WorkIncome", deserialize_with = "work_income_earned_by_default")]
    Work(WorkIncome),
    #[serde(rename = "CurrentSocialSecurityIncome")]
    SocialSecurity(SocialSecurityIncome),
    #[serde(rename = "FutureSocialSecurityIncome")]
    FutureSocialSecurity(FutureSocialSecurityIncome),
    #[serde(rename = "PassiveIncome")]
    Passive(PassiveIncome),
    #[serde(rename = "WindfallIncome")]
    Windfall(WindfallIncome),
    #[serde(rename = "PensionIncome")]
    Pension(PensionIncome),
}

impl Income {
    pub fn core(&self) -> &IncomeCore {
        match self {
            Income::Work(i) => &i.core,
            Income::SocialSecurity(i) => &i.core,
            Income::FutureSocialSecurity(i) => &i.core,
            Income::Passive(i) => &i.core,
            Income::Windfall(i) => &i.core,
            Income::Pension(i) => &i.core,
        }
    }

    pub fn id(&self) -> &str {
        &self.core().id
    }

    pub fn is_interest(&self) -> bool {
        matches!(self, Income::Passive(p) if p.kind == PassiveKind::Interest)
    }
}

/// Wages are earned income unless a record says otherwise.
fn work_income_earned_by_default<'de, D>(deserializer: D) -> Result<WorkIncome, D::Error>
where
    D: Deserializer<'de>,
{
    let record = Value::deserialize(deserializer)?;
    let flagged = record.get("earnedIncome").is_some();
    let mut work: WorkIncome = serde_json::from_value(record).map_err(D::Error::custom)?;
    if !flagged {
        work.core.earned_income = true;
    }
    Ok(work)
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpenseCategory {
    #[default]
    General,
    Healthcare,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseCore {
    pub id: String,
    pub name: String,
    pub amount: f64,
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default)]
    pub is_discretionary: bool,
    #[serde(default = "default_true")]
    pub inflation_adjusted: bool,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl ExpenseCore {
    pub fn new(id: impl Into<String>, amount: f64, frequency: Frequency) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            amount: amount.max(0.0),
            frequency,
            is_discretionary: false,
            inflation_adjusted: true,
            start_date: None,
            end_date: None,
        }
    }

    pub fn annual_amount(&self) -> f64 {
        self.amount.max(0.0) * self.frequency.periods_per_year()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringExpense {
    #[serde(flatten)]
    pub core: ExpenseCore,
    #[serde(default)]
    pub category: ExpenseCategory,
}

impl RecurringExpense {
    pub fn new(id: impl Into<String>, annual_amount: f64) -> Self {
        Self {
            core: ExpenseCore::new(id, annual_amount, Frequency::Annually),
            category: ExpenseCategory::General,
        }
    }
}

/// Mortgage payment: `core.amount` is the scheduled principal-and-interest
/// payment per `core.frequency`; `escrow` is an annual, inflating add-on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MortgageExpense {
    #[serde(flatten)]
    pub core: ExpenseCore,
    pub balance: f64,
    pub apr: f64,
    #[serde(default)]
    pub escrow: f64,
    #[serde(default)]
    pub property_account_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanExpense {
    #[serde(flatten)]
    pub core: ExpenseCore,
    pub balance: f64,
    pub apr: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "className")]
pub enum Expense {
    #[serde(rename = "Expense")]
    Recurring(RecurringExpense),
    #[serde(rename = "MortgageExpense")]
    Mortgage(MortgageExpense),
    #[serde(rename = "LoanExpense")]
    Loan(LoanExpense),
}

impl Expense {
    pub fn core(&self) -> &ExpenseCore {
        match self {
            Expense::Recurring(e) => &e.core,
            Expense::Mortgage(e) => &e.core,
            Expense::Loan(e) => &e.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut ExpenseCore {
        match self {
            Expense::Recurring(e) => &mut e.core,
            Expense::Mortgage(e) => &mut e.core,
            Expense::Loan(e) => &mut e.core,
        }
    }

    pub fn id(&self) -> &str {
        &self.core().id
    }

    pub fn is_discretionary(&self) -> bool {
        self.core().is_discretionary
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaxType {
    #[serde(alias = "traditional401k")]
    Traditional401k,
    #[serde(alias = "traditionalIra")]
    TraditionalIra,
    #[serde(alias = "roth401k")]
    Roth401k,
    #[serde(alias = "rothIra")]
    RothIra,
    #[serde(alias = "HSA")]
    Hsa,
    Brokerage,
    /// Anything the tax engine does not model; withdrawn untaxed.
    Other,
}

impl TaxType {
    pub fn is_traditional(self) -> bool {
        matches!(self, TaxType::Traditional401k | TaxType::TraditionalIra)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedAccount {
    pub id: String,
    pub name: String,
    pub amount: f64,
    #[serde(default)]
    pub apr: f64,
}

impl SavedAccount {
    pub fn new(id: impl Into<String>, amount: f64, apr: f64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            amount: amount.max(0.0),
            apr,
        }
    }
}

/// Market account. `cost_basis` is the purchase basis for brokerage accounts
/// and the contribution basis for Roth accounts. `employer_balance` is the
/// part of `amount` that came from employer contributions and is subject to
/// graded vesting over `vesting_years`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestedAccount {
    pub id: String,
    pub name: String,
    pub amount: f64,
    pub tax_type: TaxType,
    #[serde(default)]
    pub cost_basis: f64,
    #[serde(default)]
    pub employer_balance: f64,
    #[serde(default)]
    pub vesting_years: u32,
    #[serde(default)]
    pub service_years: u32,
}

impl InvestedAccount {
    pub fn new(id: impl Into<String>, amount: f64, tax_type: TaxType) -> Self {
        let id = id.into();
        let amount = amount.max(0.0);
        Self {
            name: id.clone(),
            id,
            amount,
            tax_type,
            cost_basis: amount,
            employer_balance: 0.0,
            vesting_years: 0,
            service_years: 0,
        }
    }

    pub fn vested_fraction(&self) -> f64 {
        if self.vesting_years == 0 {
            return 1.0;
        }
        (self.service_years as f64 / self.vesting_years as f64).clamp(0.0, 1.0)
    }

    pub fn vested_amount(&self) -> f64 {
        let unvested = self.employer_balance.max(0.0) * (1.0 - self.vested_fraction());
        (self.amount - unvested).clamp(0.0, self.amount.max(0.0))
    }

    /// Share of the balance that is unrealized gain, held constant across
    /// partial withdrawals.
    pub fn gains_ratio(&self) -> f64 {
        if self.amount <= 0.0 {
            return 0.0;
        }
        ((self.amount - self.cost_basis) / self.amount).clamp(0.0, 1.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebtAccount {
    pub id: String,
    pub name: String,
    pub amount: f64,
    #[serde(default)]
    pub apr: f64,
    #[serde(default)]
    pub monthly_payment: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyAccount {
    pub id: String,
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub loan_balance: f64,
    /// Defaults to general inflation when absent.
    #[serde(default)]
    pub appreciation_rate: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeficitDebtAccount {
    pub id: String,
    pub name: String,
    pub amount: f64,
    #[serde(default)]
    pub apr: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "className")]
pub enum Account {
    #[serde(rename = "SavedAccount")]
    Saved(SavedAccount),
    #[serde(rename = "InvestedAccount")]
    Invested(InvestedAccount),
    #[serde(rename = "DebtAccount")]
    Debt(DebtAccount),
    #[serde(rename = "PropertyAccount")]
    Property(PropertyAccount),
    #[serde(rename = "DeficitDebtAccount")]
    DeficitDebt(DeficitDebtAccount),
}

impl Account {
    pub fn id(&self) -> &str {
        match self {
            Account::Saved(a) => &a.id,
            Account::Invested(a) => &a.id,
            Account::Debt(a) => &a.id,
            Account::Property(a) => &a.id,
            Account::DeficitDebt(a) => &a.id,
        }
    }

    pub fn assets(&self) -> f64 {
        match self {
            Account::Saved(a) => a.amount,
            Account::Invested(a) => a.amount,
            Account::Property(a) => a.value,
            Account::Debt(_) | Account::DeficitDebt(_) => 0.0,
        }
    }

    pub fn liabilities(&self) -> f64 {
        match self {
            Account::Debt(a) => a.amount,
            Account::Property(a) => a.loan_balance,
            Account::DeficitDebt(a) => a.amount,
            Account::Saved(_) | Account::Invested(_) => 0.0,
        }
    }

    /// Liquid balance counted by withdrawal strategies.
    pub fn portfolio_value(&self) -> f64 {
        match self {
            Account::Saved(a) => a.amount,
            Account::Invested(a) => a.amount,
            Account::Debt(_) | Account::Property(_) | Account::DeficitDebt(_) => 0.0,
        }
    }
}

pub fn net_worth(accounts: &[Account]) -> f64 {
    accounts
        .iter()
        .map(|a| a.assets() - a.liabilities())
        .sum()
}

fn default_true() -> bool {
    true
}

/// Rebuilds a typed entity from a keyed record. Unknown `className` tags (or
/// malformed records) yield `None`.
pub fn reconstitute<T: DeserializeOwned>(record: &Value) -> Option<T> {
    serde_json::from_value(record.clone()).ok()
}

pub fn reconstitute_all<T: DeserializeOwned>(records: &[Value]) -> Vec<T> {
    records.iter().filter_map(reconstitute).collect()
}

pub fn reconstitute_account(record: &Value) -> Option<Account> {
    reconstitute(record)
}

pub fn reconstitute_income(record: &Value) -> Option<Income> {
    reconstitute(record)
}

pub fn reconstitute_expense(record: &Value) -> Option<Expense> {
    reconstitute(record)
}
