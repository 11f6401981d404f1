mod benefits;
mod engine;
mod entities;
mod error;
mod growth;
mod montecarlo;
mod strategy;
mod tables;
mod tax;
mod types;

pub use benefits::{
    BendPointCalculator, BenefitCalculator, High3Pension, PensionCalculator, claiming_adjustment,
};
pub use engine::{ProjectionEngine, projection_years, run_projection};
pub use entities::{
    Account, DebtAccount, DeficitDebtAccount, EarningsRecord, Expense, Frequency,
    FutureSocialSecurityIncome, Income, IncomeCore, InvestedAccount, PassiveIncome, PensionIncome,
    PropertyAccount, RecurringExpense, SavedAccount, SocialSecurityIncome, TaxType, WorkIncome,
    net_worth, reconstitute_account, reconstitute_all, reconstitute_expense, reconstitute_income,
};
pub use error::EngineError;
pub use montecarlo::{MonteCarloConfig, MonteCarloSummary, YearPercentiles, run_monte_carlo};
pub use tables::{StaticTaxTables, TaxParameterSource};
pub use types::{
    Assumptions, FilingStatus, ProjectionRequest, SimulationYear, TaxState, WithdrawalStrategy,
};
