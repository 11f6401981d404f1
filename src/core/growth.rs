//! One-year transforms for incomes, expenses and accounts.
//!
//! Every function takes an entity by reference and returns the next one; none
//! of them fail. Account balances only move in [`advance_account`].

use chrono::{Datelike, NaiveDate};

use super::entities::{
    Account, ContributionGrowth, Expense, ExpenseCategory, Income, InvestedAccount, PassiveKind,
    TaxType, WorkIncome,
};
use super::tables::TaxParameterSource;
use super::types::{Assumptions, MacroAssumptions};

/// Residues smaller than half a cent are treated as zero.
pub const CENT_RESIDUE: f64 = 0.005;

pub fn snap_cents(value: f64) -> f64 {
    if value.abs() < CENT_RESIDUE {
        0.0
    } else {
        value
    }
}

/// Fraction of `year` covered by an active window, counted in whole months
/// with both boundary months included.
pub fn active_month_multiplier(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    year: i32,
) -> f64 {
    if start.is_some_and(|s| s.year() > year) || end.is_some_and(|e| e.year() < year) {
        return 0.0;
    }
    let start_idx = match start {
        Some(s) if s.year() == year => s.month0() as i32,
        _ => 0,
    };
    let end_idx = match end {
        Some(e) if e.year() == year => e.month0() as i32,
        _ => 11,
    };
    ((end_idx - start_idx + 1) as f64 / 12.0).max(0.0)
}

pub fn active_months(start: Option<NaiveDate>, end: Option<NaiveDate>, year: i32) -> u32 {
    (active_month_multiplier(start, end, year) * 12.0).round() as u32
}

pub struct GrowthContext<'a> {
    pub assumptions: &'a Assumptions,
    pub tables: &'a dyn TaxParameterSource,
    pub year: i32,
    pub age: u32,
    /// `false` on the first projected year: entities are taken as entered.
    pub compound: bool,
    /// Multiplier applied to discretionary expenses for lifestyle creep.
    pub lifestyle_factor: f64,
}

impl GrowthContext<'_> {
    fn inflation(&self) -> f64 {
        self.assumptions.economy.effective_inflation()
    }
}

/// Annual amount realized by an income in `year`.
pub fn realized_income(income: &Income, year: i32) -> f64 {
    let core = income.core();
    let gated = match income {
        Income::FutureSocialSecurity(ss) => ss.started(),
        Income::Pension(p) => p.calculated_benefit > 0.0,
        Income::Work(_) | Income::SocialSecurity(_) | Income::Passive(_) | Income::Windfall(_) => {
            true
        }
    };
    if !gated {
        return 0.0;
    }
    core.annual_amount() * active_month_multiplier(core.start_date, core.end_date, year)
}

pub fn advance_income(income: &Income, ctx: &GrowthContext<'_>) -> Income {
    let inflation = ctx.inflation();
    match income {
        Income::Work(work) => Income::Work(advance_work(work, ctx)),
        Income::SocialSecurity(ss) => {
            let mut next = ss.clone();
            if ctx.compound && ss.cola {
                next.core.amount = ss.core.amount * (1.0 + inflation);
            }
            Income::SocialSecurity(next)
        }
        Income::FutureSocialSecurity(ss) => {
            let mut next = ss.clone();
            if ctx.compound && ss.cola && ss.started() {
                next.core.amount = ss.core.amount * (1.0 + inflation);
                next.calculated_pia = ss.calculated_pia * (1.0 + inflation);
            }
            Income::FutureSocialSecurity(next)
        }
        Income::Passive(passive) => {
            let mut next = passive.clone();
            if ctx.compound {
                let growth = match passive.kind {
                    PassiveKind::Interest => 0.0,
                    PassiveKind::Rental => ctx.assumptions.economy.rent_inflation + inflation,
                    PassiveKind::Dividend | PassiveKind::Royalty | PassiveKind::Other => {
                        if passive.inflation_adjusted {
                            inflation
                        } else {
                            0.0
                        }
                    }
                };
                next.core.amount = passive.core.amount * (1.0 + growth);
            }
            Income::Passive(next)
        }
        Income::Windfall(w) => Income::Windfall(w.clone()),
        Income::Pension(p) => {
            let mut next = p.clone();
            if ctx.compound && p.cola && p.calculated_benefit > 0.0 {
                next.core.amount = p.core.amount * (1.0 + inflation);
                next.calculated_benefit = p.calculated_benefit * (1.0 + inflation);
            }
            Income::Pension(next)
        }
    }
}

fn advance_work(work: &WorkIncome, ctx: &GrowthContext<'_>) -> WorkIncome {
    let mut next = work.clone();
    let retirement_age = ctx.assumptions.demographics.retirement_age;

    if ctx.age >= retirement_age && work.core.end_date.is_none() {
        // Keep the record for history; it simply stops paying.
        let last_year = ctx.year - (ctx.age - retirement_age) as i32 - 1;
        next.core.amount = 0.0;
        next.pre_tax_contribution = 0.0;
        next.roth_contribution = 0.0;
        next.employer_match = 0.0;
        next.insurance_premium = 0.0;
        next.core.end_date = NaiveDate::from_ymd_opt(last_year, 12, 31);
        return next;
    }

    if !ctx.compound {
        return next;
    }

    let raise = 1.0 + ctx.assumptions.effective_salary_growth();
    next.core.amount = work.core.amount * raise;
    next.employer_match = work.employer_match * raise;
    next.insurance_premium = work.insurance_premium
        * (1.0 + ctx.assumptions.economy.effective_healthcare_inflation());

    match work.contribution_growth {
        ContributionGrowth::GrowWithSalary | ContributionGrowth::Unknown => {
            next.pre_tax_contribution = work.pre_tax_contribution * raise;
            next.roth_contribution = work.roth_contribution * raise;
        }
        ContributionGrowth::Fixed => {}
        ContributionGrowth::TrackAnnualMax => {
            let limit = ctx
                .tables
                .contribution_limit(work.limit_kind, ctx.year, ctx.age, ctx.assumptions)
                .min(next.core.annual_amount());
            let elective = work.pre_tax_contribution + work.roth_contribution;
            if elective > 0.0 {
                next.pre_tax_contribution = limit * work.pre_tax_contribution / elective;
                next.roth_contribution = limit * work.roth_contribution / elective;
            } else {
                next.pre_tax_contribution = limit;
            }
        }
    }
    next
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Amortization {
    pub paid: f64,
    pub interest: f64,
    pub principal: f64,
    pub balance: f64,
}

/// Month-by-month amortization; the final payment is trimmed to the payoff.
pub fn amortize(balance: f64, apr: f64, monthly_payment: f64, months: u32) -> Amortization {
    let monthly_rate = apr.max(0.0) / 12.0;
    let mut result = Amortization {
        balance: balance.max(0.0),
        ..Amortization::default()
    };
    for _ in 0..months {
        if result.balance <= 0.0 {
            break;
        }
        let interest = result.balance * monthly_rate;
        let payment = monthly_payment.max(0.0).min(result.balance + interest);
        result.balance = snap_cents(result.balance + interest - payment);
        result.paid += payment;
        result.interest += interest;
        result.principal += payment - interest;
    }
    result
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ExpenseCost {
    pub total: f64,
    pub principal: f64,
}

/// Cash cost of an expense in `year`; debt-backed expenses are amortized.
pub fn expense_cost(expense: &Expense, year: i32) -> ExpenseCost {
    let core = expense.core();
    let multiplier = active_month_multiplier(core.start_date, core.end_date, year);
    match expense {
        Expense::Recurring(_) => ExpenseCost {
            total: core.annual_amount() * multiplier,
            principal: 0.0,
        },
        Expense::Mortgage(m) => {
            let months = active_months(core.start_date, core.end_date, year);
            let amort = amortize(m.balance, m.apr, core.annual_amount() / 12.0, months);
            ExpenseCost {
                total: amort.paid + m.escrow.max(0.0) * multiplier,
                principal: amort.principal,
            }
        }
        Expense::Loan(l) => {
            let months = active_months(core.start_date, core.end_date, year);
            let amort = amortize(l.balance, l.apr, core.annual_amount() / 12.0, months);
            ExpenseCost {
                total: amort.paid,
                principal: amort.principal,
            }
        }
    }
}

pub fn advance_expense(expense: &Expense, ctx: &GrowthContext<'_>) -> Expense {
    let mut next = expense.clone();
    if !ctx.compound {
        return next;
    }
    let economy = &ctx.assumptions.economy;
    let inflation = ctx.inflation();

    match &mut next {
        Expense::Recurring(e) => {
            if e.core.inflation_adjusted {
                let rate = match e.category {
                    ExpenseCategory::General => inflation,
                    ExpenseCategory::Healthcare => economy.effective_healthcare_inflation(),
                };
                e.core.amount *= 1.0 + rate;
            }
        }
        Expense::Mortgage(m) => {
            let months = active_months(m.core.start_date, m.core.end_date, ctx.year - 1);
            m.balance = amortize(m.balance, m.apr, m.core.annual_amount() / 12.0, months).balance;
            m.escrow *= 1.0 + inflation;
            if m.balance <= 0.0 {
                m.core.amount = 0.0;
            }
        }
        Expense::Loan(l) => {
            let months = active_months(l.core.start_date, l.core.end_date, ctx.year - 1);
            l.balance = amortize(l.balance, l.apr, l.core.annual_amount() / 12.0, months).balance;
            if l.balance <= 0.0 {
                l.core.amount = 0.0;
            }
        }
    }

    if next.is_discretionary() {
        let core = next.core_mut();
        core.amount *= ctx.lifestyle_factor.max(0.0);
    }
    next
}

/// Money moved in or out of one account during a year.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccountFlows {
    pub withdrawn: f64,
    /// Basis leaving with `withdrawn` and `converted_out`.
    pub basis_withdrawn: f64,
    pub contributed: f64,
    pub employer: f64,
    pub converted_in: f64,
    pub converted_out: f64,
    /// Principal paid against a liability.
    pub payment: f64,
    /// New borrowing, used by the deficit account.
    pub borrowed: f64,
}

pub struct AccountGrowth<'a> {
    pub market_return: f64,
    pub economy: &'a MacroAssumptions,
    /// Holder still working: vesting service accrues.
    pub working: bool,
}

/// Interest rate paid by a cash account in the projection's dollar basis.
pub fn saved_interest_rate(apr: f64, economy: &MacroAssumptions) -> f64 {
    economy.deflate(apr).max(0.0)
}

pub fn advance_account(account: &Account, flows: &AccountFlows, growth: &AccountGrowth<'_>) -> Account {
    match account {
        Account::Saved(saved) => {
            let mut next = saved.clone();
            let interest = saved.amount * saved_interest_rate(saved.apr, growth.economy);
            next.amount = snap_cents(
                saved.amount + interest - flows.withdrawn + flows.contributed,
            )
            .max(0.0);
            Account::Saved(next)
        }
        Account::Invested(invested) => Account::Invested(advance_invested(invested, flows, growth)),
        Account::Debt(debt) => {
            let mut next = debt.clone();
            let amort = amortize(debt.amount, debt.apr, debt.monthly_payment, 12);
            next.amount = snap_cents(amort.balance - flows.payment).max(0.0);
            Account::Debt(next)
        }
        Account::Property(property) => {
            let mut next = property.clone();
            let appreciation = property
                .appreciation_rate
                .map(|r| growth.economy.deflate(r))
                .unwrap_or_else(|| growth.economy.effective_inflation());
            next.value = snap_cents(property.value * (1.0 + appreciation)).max(0.0);
            next.loan_balance = snap_cents(property.loan_balance - flows.payment).max(0.0);
            Account::Property(next)
        }
        Account::DeficitDebt(deficit) => {
            let mut next = deficit.clone();
            next.amount = snap_cents(
                deficit.amount * (1.0 + deficit.apr.max(0.0)) + flows.borrowed - flows.payment,
            )
            .max(0.0);
            Account::DeficitDebt(next)
        }
    }
}

fn advance_invested(
    account: &InvestedAccount,
    flows: &AccountFlows,
    growth: &AccountGrowth<'_>,
) -> InvestedAccount {
    let mut next = account.clone();
    let factor = 1.0 + growth.market_return;
    let outflow = (flows.withdrawn + flows.converted_out).min(account.amount.max(0.0));
    let employer_share = if account.amount > 0.0 {
        (account.employer_balance / account.amount).clamp(0.0, 1.0)
    } else {
        0.0
    };

    next.amount = snap_cents(
        (account.amount - outflow).max(0.0) * factor
            + flows.contributed
            + flows.employer
            + flows.converted_in,
    )
    .max(0.0);
    next.employer_balance = snap_cents(
        (account.employer_balance - outflow * employer_share).max(0.0) * factor + flows.employer,
    )
    .max(0.0);

    next.cost_basis = match account.tax_type {
        // Basis only matters where it shields withdrawals.
        TaxType::Brokerage | TaxType::Roth401k | TaxType::RothIra => snap_cents(
            (account.cost_basis - flows.basis_withdrawn).max(0.0)
                + flows.contributed
                + flows.converted_in,
        ),
        TaxType::Traditional401k | TaxType::TraditionalIra | TaxType::Hsa | TaxType::Other => {
            (account.cost_basis - flows.basis_withdrawn).max(0.0) + flows.contributed
        }
    };

    if growth.working {
        next.service_years = account.service_years.saturating_add(1);
    }
    next
}
