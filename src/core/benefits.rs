//! Social Security and pension benefit determination.
//!
//! Benefit formulas sit behind traits so the engine can be handed a different
//! calculator (or a failing one in tests). Both are consulted once, in the
//! year the benefit starts; the resulting amount then only grows by COLA.

use chrono::NaiveDate;

use super::entities::{EarningsRecord, Frequency, FutureSocialSecurityIncome, PensionIncome};
use super::error::EngineError;
use super::tables::index_factor;
use super::types::Assumptions;

pub const EARLIEST_CLAIMING_AGE: u32 = 62;
pub const FULL_RETIREMENT_AGE: u32 = 67;
pub const LATEST_CLAIMING_AGE: u32 = 70;

/// Years of earnings counted in the average indexed monthly earnings.
pub const AIME_YEARS: usize = 35;
pub const BEND_POINTS_2024: (f64, f64) = (1_174.0, 7_078.0);
const PIA_FACTORS: (f64, f64, f64) = (0.90, 0.32, 0.15);

pub trait BenefitCalculator: Send + Sync {
    /// Monthly primary insurance amount at full retirement age.
    fn primary_insurance_amount(
        &self,
        earnings: &[EarningsRecord],
        birth_year: i32,
        assumptions: &Assumptions,
    ) -> Result<f64, EngineError>;
}

pub trait PensionCalculator: Send + Sync {
    /// Annual benefit payable from the start age.
    fn annual_benefit(
        &self,
        pension: &PensionIncome,
        assumptions: &Assumptions,
    ) -> Result<f64, EngineError>;
}

/// Three-tier bend-point formula over the top 35 years of capped earnings.
#[derive(Clone, Copy, Debug, Default)]
pub struct BendPointCalculator;

impl BenefitCalculator for BendPointCalculator {
    fn primary_insurance_amount(
        &self,
        earnings: &[EarningsRecord],
        birth_year: i32,
        assumptions: &Assumptions,
    ) -> Result<f64, EngineError> {
        if earnings.is_empty() {
            return Err(EngineError::Benefit("no earnings history".to_string()));
        }
        if earnings.iter().any(|r| !r.amount.is_finite()) {
            return Err(EngineError::Benefit("non-finite earnings record".to_string()));
        }

        let mut amounts: Vec<f64> = earnings.iter().map(|r| r.amount.max(0.0)).collect();
        amounts.sort_by(|a, b| b.total_cmp(a));
        amounts.truncate(AIME_YEARS);
        let aime = amounts.iter().sum::<f64>() / (AIME_YEARS as f64 * 12.0);

        let factor = index_factor(birth_year + EARLIEST_CLAIMING_AGE as i32, assumptions);
        let (first, second) = (BEND_POINTS_2024.0 * factor, BEND_POINTS_2024.1 * factor);
        let (low, mid, high) = PIA_FACTORS;
        Ok(low * aime.min(first)
            + mid * (aime.min(second) - first).max(0.0)
            + high * (aime - second).max(0.0))
    }
}

/// Average of the three highest salaries times multiplier times service.
#[derive(Clone, Copy, Debug, Default)]
pub struct High3Pension;

impl PensionCalculator for High3Pension {
    fn annual_benefit(
        &self,
        pension: &PensionIncome,
        _assumptions: &Assumptions,
    ) -> Result<f64, EngineError> {
        if pension.salary_history.is_empty() {
            return Err(EngineError::Benefit(format!(
                "pension {} has no salary history",
                pension.core.id
            )));
        }
        if pension.multiplier < 0.0 || pension.service_years < 0.0 {
            return Err(EngineError::Benefit(format!(
                "pension {} has a negative multiplier or service",
                pension.core.id
            )));
        }
        let mut salaries: Vec<f64> = pension
            .salary_history
            .iter()
            .map(|r| r.amount.max(0.0))
            .collect();
        salaries.sort_by(|a, b| b.total_cmp(a));
        salaries.truncate(3);
        let high3 = salaries.iter().sum::<f64>() / salaries.len() as f64;
        Ok(high3 * pension.multiplier * pension.service_years)
    }
}

/// Multiplier applied to the PIA for claiming at `claiming_age`.
///
/// Early claims lose 5/9 of 1% per month for the first 36 months and 5/12 of
/// 1% per month beyond that; delayed claims earn 8% per year up to age 70.
pub fn claiming_adjustment(claiming_age: u32) -> f64 {
    let age = claiming_age.clamp(EARLIEST_CLAIMING_AGE, LATEST_CLAIMING_AGE);
    if age < FULL_RETIREMENT_AGE {
        let months = ((FULL_RETIREMENT_AGE - age) * 12) as f64;
        let first = months.min(36.0);
        let beyond = (months - 36.0).max(0.0);
        1.0 - first * (5.0 / 9.0) / 100.0 - beyond * (5.0 / 12.0) / 100.0
    } else {
        1.0 + (age - FULL_RETIREMENT_AGE) as f64 * 0.08
    }
}

/// Benefit withheld under the retirement earnings test: one dollar for every
/// two earned above the exempt amount, before full retirement age only.
pub fn earnings_test_reduction(annual_benefit: f64, earned: f64, exempt: f64, age: u32) -> f64 {
    if age >= FULL_RETIREMENT_AGE || annual_benefit <= 0.0 {
        return 0.0;
    }
    ((earned - exempt) / 2.0).clamp(0.0, annual_benefit)
}

/// Fixes the benefit of a future Social Security income in its claiming year.
pub fn claim_social_security(
    income: &FutureSocialSecurityIncome,
    calculator: &dyn BenefitCalculator,
    birth_year: i32,
    year: i32,
    assumptions: &Assumptions,
) -> Result<FutureSocialSecurityIncome, EngineError> {
    let pia = calculator.primary_insurance_amount(&income.earnings_record, birth_year, assumptions)?;
    if !pia.is_finite() || pia <= 0.0 {
        return Err(EngineError::Benefit(format!(
            "{} produced a non-positive PIA",
            income.core.id
        )));
    }
    let mut next = income.clone();
    next.calculated_pia = pia;
    next.core.amount = pia * claiming_adjustment(income.claiming_age);
    next.core.frequency = Frequency::Monthly;
    next.core.start_date = NaiveDate::from_ymd_opt(year, 1, 1);
    Ok(next)
}

/// Fixes a pension's annual benefit in its start year.
pub fn start_pension(
    pension: &PensionIncome,
    calculator: &dyn PensionCalculator,
    year: i32,
    assumptions: &Assumptions,
) -> Result<PensionIncome, EngineError> {
    let benefit = calculator.annual_benefit(pension, assumptions)?;
    if !benefit.is_finite() || benefit <= 0.0 {
        return Err(EngineError::Benefit(format!(
            "pension {} produced no benefit",
            pension.core.id
        )));
    }
    let mut next = pension.clone();
    next.calculated_benefit = benefit;
    next.core.amount = benefit;
    next.core.frequency = Frequency::Annually;
    next.core.start_date = NaiveDate::from_ymd_opt(year, 1, 1);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entities::IncomeCore;
    use proptest::prelude::{prop_assert, proptest};

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn history(years: i32, amount: f64) -> Vec<EarningsRecord> {
        (0..years)
            .map(|i| EarningsRecord {
                year: 1990 + i,
                amount,
            })
            .collect()
    }

    #[test]
    fn pia_uses_bend_points_over_top_35_years() {
        let assumptions = Assumptions::default();
        let mut earnings = history(35, 60_000.0);
        earnings.push(EarningsRecord {
            year: 1989,
            amount: 1_000.0,
        });
        let pia = BendPointCalculator
            .primary_insurance_amount(&earnings, 1960, &assumptions)
            .expect("pia");
        assert_approx_tol(pia, 0.9 * 1_174.0 + 0.32 * (5_000.0 - 1_174.0), 1e-6);
    }

    #[test]
    fn empty_earnings_history_is_an_error() {
        let assumptions = Assumptions::default();
        assert!(
            BendPointCalculator
                .primary_insurance_amount(&[], 1960, &assumptions)
                .is_err()
        );
    }

    #[test]
    fn claiming_adjustment_matches_published_factors() {
        assert_approx_tol(claiming_adjustment(62), 0.70, 1e-9);
        assert_approx_tol(claiming_adjustment(64), 0.80, 1e-9);
        assert_approx_tol(claiming_adjustment(67), 1.00, 1e-9);
        assert_approx_tol(claiming_adjustment(70), 1.24, 1e-9);
        assert_approx_tol(claiming_adjustment(75), 1.24, 1e-9);
    }

    #[test]
    fn earnings_test_withholds_half_the_excess_before_fra() {
        assert_approx_tol(earnings_test_reduction(24_000.0, 42_320.0, 22_320.0, 63), 10_000.0, 1e-9);
        assert_eq!(earnings_test_reduction(24_000.0, 142_320.0, 22_320.0, 63), 24_000.0);
        assert_eq!(earnings_test_reduction(24_000.0, 142_320.0, 22_320.0, 67), 0.0);
    }

    #[test]
    fn claim_sets_monthly_benefit_from_adjusted_pia() {
        let assumptions = Assumptions::default();
        let mut ss = FutureSocialSecurityIncome::new("ss", 62);
        ss.earnings_record = history(35, 60_000.0);
        let claimed =
            claim_social_security(&ss, &BendPointCalculator, 1960, 2022, &assumptions).expect("claim");
        assert!(claimed.started());
        assert_approx_tol(claimed.core.amount, claimed.calculated_pia * 0.70, 1e-9);
        assert_eq!(claimed.core.frequency, Frequency::Monthly);
    }

    #[test]
    fn high3_pension_averages_best_three_salaries() {
        let pension = PensionIncome {
            core: IncomeCore::new("pension", 0.0, Frequency::Annually),
            start_age: 60,
            service_years: 20.0,
            multiplier: 0.02,
            calculated_benefit: 0.0,
            salary_history: vec![
                EarningsRecord { year: 2020, amount: 50_000.0 },
                EarningsRecord { year: 2021, amount: 90_000.0 },
                EarningsRecord { year: 2022, amount: 100_000.0 },
                EarningsRecord { year: 2023, amount: 110_000.0 },
            ],
            cola: false,
        };
        let started =
            start_pension(&pension, &High3Pension, 2030, &Assumptions::default()).expect("pension");
        assert_approx_tol(started.calculated_benefit, 100_000.0 * 0.02 * 20.0, 1e-6);
        assert_approx_tol(started.core.annual_amount(), 40_000.0, 1e-6);
    }

    proptest! {
        #[test]
        fn pia_is_monotone_in_earnings(base in 0.0f64..300_000.0, bump in 0.0f64..50_000.0) {
            let assumptions = Assumptions::default();
            let low = BendPointCalculator
                .primary_insurance_amount(&history(35, base), 1960, &assumptions)
                .expect("pia");
            let high = BendPointCalculator
                .primary_insurance_amount(&history(35, base + bump), 1960, &assumptions)
                .expect("pia");
            prop_assert!(high + 1e-9 >= low);
        }
    }
}
