//! Decumulation targets.
//!
//! The target is advisory: the engine only turns a Guyton-Klinger guardrail
//! into a discretionary-spending adjustment. What actually leaves the accounts
//! is driven by the year's funding gap.

use super::types::{
    Guardrail, GuardrailSettings, InvestmentAssumptions, StrategyDiagnostic, WithdrawalStrategy,
};

/// Remaining-years threshold under which preservation cuts are skipped.
pub const FIFTEEN_YEAR_RULE_HORIZON: u32 = 15;

#[derive(Clone, Copy, Debug)]
pub struct StrategyInputs<'a> {
    pub settings: &'a InvestmentAssumptions,
    /// Liquid portfolio at the start of the year.
    pub portfolio_value: f64,
    pub inflation: f64,
    /// Years left until life expectancy.
    pub remaining_years: u32,
    /// Last retired year's diagnostic; `None` in the first retired year.
    pub previous: Option<&'a StrategyDiagnostic>,
}

pub fn target_withdrawal(inputs: &StrategyInputs<'_>) -> StrategyDiagnostic {
    let settings = inputs.settings;
    let rate = settings.withdrawal_rate.max(0.0);
    let portfolio = inputs.portfolio_value.max(0.0);
    let initial_portfolio = inputs
        .previous
        .map(|p| p.initial_portfolio)
        .unwrap_or(portfolio);
    let years_in_retirement = inputs.previous.map(|p| p.years_in_retirement + 1).unwrap_or(1);
    let escalated = inputs
        .previous
        .map(|p| p.amount * (1.0 + inputs.inflation));

    let mut diagnostic = StrategyDiagnostic {
        strategy: settings.withdrawal_strategy,
        amount: 0.0,
        base_amount: 0.0,
        initial_portfolio,
        portfolio_value: portfolio,
        current_withdrawal_rate: 0.0,
        years_in_retirement,
        guardrail: None,
        suppressed_by_fifteen_year_rule: false,
        discretionary_adjustment: 0.0,
    };

    let base = match settings.withdrawal_strategy {
        WithdrawalStrategy::FixedPercentage => rate * initial_portfolio,
        WithdrawalStrategy::PercentageOfPortfolio => rate * portfolio,
        WithdrawalStrategy::InflationAdjusted | WithdrawalStrategy::GuytonKlinger => {
            escalated.unwrap_or(rate * portfolio)
        }
    };
    diagnostic.base_amount = base;
    diagnostic.amount = base;
    diagnostic.current_withdrawal_rate = withdrawal_rate(base, portfolio);

    if settings.withdrawal_strategy == WithdrawalStrategy::GuytonKlinger && escalated.is_some() {
        apply_guardrails(&mut diagnostic, rate, &settings.guardrails, inputs.remaining_years);
    }
    diagnostic
}

fn withdrawal_rate(amount: f64, portfolio: f64) -> f64 {
    if portfolio > 0.0 {
        amount / portfolio
    } else if amount > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

fn apply_guardrails(
    diagnostic: &mut StrategyDiagnostic,
    initial_rate: f64,
    guardrails: &GuardrailSettings,
    remaining_years: u32,
) {
    if initial_rate <= 0.0 {
        return;
    }
    let current = diagnostic.current_withdrawal_rate;
    let adjustment = guardrails.adjustment.clamp(0.0, 1.0);

    if current < initial_rate * (1.0 - guardrails.prosperity_threshold) {
        diagnostic.guardrail = Some(Guardrail::Prosperity);
        diagnostic.amount = diagnostic.base_amount * (1.0 + adjustment);
    } else if current > initial_rate * (1.0 + guardrails.preservation_threshold) {
        if guardrails.fifteen_year_rule && remaining_years < FIFTEEN_YEAR_RULE_HORIZON {
            diagnostic.suppressed_by_fifteen_year_rule = true;
        } else {
            diagnostic.guardrail = Some(Guardrail::CapitalPreservation);
            diagnostic.amount = diagnostic.base_amount * (1.0 - adjustment);
        }
    }
    diagnostic.discretionary_adjustment = diagnostic.amount - diagnostic.base_amount;
}
