//! Tax-parameter lookups.
//!
//! The engine never hard-codes law; it asks a [`TaxParameterSource`] for the
//! year's schedules. [`StaticTaxTables`] ships 2024 figures and indexes them
//! forward by the assumed inflation rate when the projection is nominal.

use serde::{Deserialize, Serialize};

use super::entities::ContributionLimitKind;
use super::types::{Assumptions, FilingStatus};

pub const BASE_TABLE_YEAR: i32 = 2024;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bracket {
    pub threshold: f64,
    pub rate: f64,
}

impl Bracket {
    pub const fn new(threshold: f64, rate: f64) -> Self {
        Self { threshold, rate }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxParameters {
    pub standard_deduction: f64,
    pub brackets: Vec<Bracket>,
    pub taxes_social_security: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FicaParameters {
    pub social_security_rate: f64,
    pub wage_base: f64,
    pub medicare_rate: f64,
    pub additional_medicare_rate: f64,
    pub additional_medicare_threshold: f64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Jurisdiction<'a> {
    Federal,
    State(&'a str),
}

impl std::fmt::Display for Jurisdiction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Jurisdiction::Federal => write!(f, "federal"),
            Jurisdiction::State(code) => write!(f, "state {code}"),
        }
    }
}

pub trait TaxParameterSource: Send + Sync {
    /// `None` when no table exists for the jurisdiction.
    fn tax_parameters(
        &self,
        year: i32,
        status: FilingStatus,
        jurisdiction: Jurisdiction<'_>,
        assumptions: &Assumptions,
    ) -> Option<TaxParameters>;

    fn capital_gains_brackets(
        &self,
        year: i32,
        status: FilingStatus,
        assumptions: &Assumptions,
    ) -> Option<Vec<Bracket>>;

    fn fica(&self, year: i32, status: FilingStatus, assumptions: &Assumptions) -> FicaParameters;

    fn rmd_divisor(&self, age: u32) -> Option<f64>;

    fn contribution_limit(
        &self,
        kind: ContributionLimitKind,
        year: i32,
        age: u32,
        assumptions: &Assumptions,
    ) -> f64;

    fn earnings_test_exempt_amount(&self, year: i32, assumptions: &Assumptions) -> f64;
}

/// Age at which required minimum distributions begin for a birth cohort.
pub fn rmd_start_age(birth_year: i32) -> u32 {
    if birth_year <= 1950 {
        72
    } else if birth_year <= 1959 {
        73
    } else {
        75
    }
}

/// Growth multiplier for indexing a 2024 figure to `year`.
pub fn index_factor(year: i32, assumptions: &Assumptions) -> f64 {
    if !assumptions.economy.inflation_adjusted || year <= BASE_TABLE_YEAR {
        return 1.0;
    }
    (1.0 + assumptions.economy.inflation_rate).powi(year - BASE_TABLE_YEAR)
}

const FEDERAL_SINGLE: [Bracket; 7] = [
    Bracket::new(0.0, 0.10),
    Bracket::new(11_600.0, 0.12),
    Bracket::new(47_150.0, 0.22),
    Bracket::new(100_525.0, 0.24),
    Bracket::new(191_950.0, 0.32),
    Bracket::new(243_725.0, 0.35),
    Bracket::new(609_350.0, 0.37),
];

const FEDERAL_JOINT: [Bracket; 7] = [
    Bracket::new(0.0, 0.10),
    Bracket::new(23_200.0, 0.12),
    Bracket::new(94_300.0, 0.22),
    Bracket::new(201_050.0, 0.24),
    Bracket::new(383_900.0, 0.32),
    Bracket::new(487_450.0, 0.35),
    Bracket::new(731_200.0, 0.37),
];

const FEDERAL_SEPARATE: [Bracket; 7] = [
    Bracket::new(0.0, 0.10),
    Bracket::new(11_600.0, 0.12),
    Bracket::new(47_150.0, 0.22),
    Bracket::new(100_525.0, 0.24),
    Bracket::new(191_950.0, 0.32),
    Bracket::new(243_725.0, 0.35),
    Bracket::new(365_600.0, 0.37),
];

const FEDERAL_HEAD: [Bracket; 7] = [
    Bracket::new(0.0, 0.10),
    Bracket::new(16_550.0, 0.12),
    Bracket::new(63_100.0, 0.22),
    Bracket::new(100_500.0, 0.24),
    Bracket::new(191_950.0, 0.32),
    Bracket::new(243_700.0, 0.35),
    Bracket::new(609_350.0, 0.37),
];

const CALIFORNIA_SINGLE: [Bracket; 9] = [
    Bracket::new(0.0, 0.01),
    Bracket::new(10_756.0, 0.02),
    Bracket::new(25_499.0, 0.04),
    Bracket::new(40_245.0, 0.06),
    Bracket::new(55_866.0, 0.08),
    Bracket::new(70_606.0, 0.093),
    Bracket::new(360_659.0, 0.103),
    Bracket::new(432_787.0, 0.113),
    Bracket::new(721_314.0, 0.123),
];

/// Uniform Lifetime Table divisors for ages 72 through 120.
const UNIFORM_LIFETIME: [f64; 49] = [
    27.4, 26.5, 25.5, 24.6, 23.7, 22.9, 22.0, 21.1, 20.2, 19.4, 18.5, 17.7, 16.8, 16.0, 15.2,
    14.4, 13.7, 12.9, 12.2, 11.5, 10.8, 10.1, 9.5, 8.9, 8.4, 7.8, 7.3, 6.8, 6.4, 6.0, 5.6, 5.2,
    4.9, 4.6, 4.3, 4.1, 3.9, 3.7, 3.5, 3.4, 3.3, 3.1, 3.0, 2.9, 2.8, 2.7, 2.5, 2.3, 2.0,
];

const NO_INCOME_TAX_STATES: [&str; 9] = ["AK", "FL", "NV", "NH", "SD", "TN", "TX", "WA", "WY"];

struct FlatState {
    code: &'static str,
    rate: f64,
    deduction: f64,
    taxes_social_security: bool,
}

const FLAT_STATES: [FlatState; 5] = [
    FlatState {
        code: "IL",
        rate: 0.0495,
        deduction: 2_775.0,
        taxes_social_security: false,
    },
    FlatState {
        code: "PA",
        rate: 0.0307,
        deduction: 0.0,
        taxes_social_security: false,
    },
    FlatState {
        code: "CO",
        rate: 0.044,
        deduction: 14_600.0,
        taxes_social_security: true,
    },
    FlatState {
        code: "NC",
        rate: 0.045,
        deduction: 12_750.0,
        taxes_social_security: false,
    },
    FlatState {
        code: "UT",
        rate: 0.0465,
        deduction: 0.0,
        taxes_social_security: true,
    },
];

#[derive(Clone, Copy, Debug, Default)]
pub struct StaticTaxTables;

impl StaticTaxTables {
    fn federal(status: FilingStatus) -> (f64, &'static [Bracket]) {
        match status {
            FilingStatus::Single => (14_600.0, &FEDERAL_SINGLE),
            FilingStatus::MarriedJoint => (29_200.0, &FEDERAL_JOINT),
            FilingStatus::MarriedSeparate => (14_600.0, &FEDERAL_SEPARATE),
            FilingStatus::HeadOfHousehold => (21_900.0, &FEDERAL_HEAD),
        }
    }

    fn state(code: &str, status: FilingStatus) -> Option<TaxParameters> {
        let code = code.trim().to_ascii_uppercase();
        let joint = status == FilingStatus::MarriedJoint;
        let doubling = if joint { 2.0 } else { 1.0 };

        if NO_INCOME_TAX_STATES.contains(&code.as_str()) {
            return Some(TaxParameters {
                standard_deduction: 0.0,
                brackets: Vec::new(),
                taxes_social_security: false,
            });
        }

        if let Some(flat) = FLAT_STATES.iter().find(|s| s.code == code) {
            return Some(TaxParameters {
                standard_deduction: flat.deduction * doubling,
                brackets: vec![Bracket::new(0.0, flat.rate)],
                taxes_social_security: flat.taxes_social_security,
            });
        }

        if code == "CA" {
            return Some(TaxParameters {
                standard_deduction: 5_540.0 * doubling,
                brackets: CALIFORNIA_SINGLE
                    .iter()
                    .map(|b| Bracket::new(b.threshold * doubling, b.rate))
                    .collect(),
                taxes_social_security: false,
            });
        }

        None
    }
}

fn scale(params: TaxParameters, factor: f64) -> TaxParameters {
    TaxParameters {
        standard_deduction: params.standard_deduction * factor,
        brackets: params
            .brackets
            .into_iter()
            .map(|b| Bracket::new(b.threshold * factor, b.rate))
            .collect(),
        taxes_social_security: params.taxes_social_security,
    }
}

impl TaxParameterSource for StaticTaxTables {
    fn tax_parameters(
        &self,
        year: i32,
        status: FilingStatus,
        jurisdiction: Jurisdiction<'_>,
        assumptions: &Assumptions,
    ) -> Option<TaxParameters> {
        let base = match jurisdiction {
            Jurisdiction::Federal => {
                let (deduction, brackets) = Self::federal(status);
                TaxParameters {
                    standard_deduction: deduction,
                    brackets: brackets.to_vec(),
                    taxes_social_security: true,
                }
            }
            Jurisdiction::State(code) => Self::state(code, status)?,
        };
        Some(scale(base, index_factor(year, assumptions)))
    }

    fn capital_gains_brackets(
        &self,
        year: i32,
        status: FilingStatus,
        assumptions: &Assumptions,
    ) -> Option<Vec<Bracket>> {
        let (fifteen, twenty) = match status {
            FilingStatus::Single => (47_025.0, 518_900.0),
            FilingStatus::MarriedJoint => (94_050.0, 583_750.0),
            FilingStatus::MarriedSeparate => (47_025.0, 291_850.0),
            FilingStatus::HeadOfHousehold => (63_000.0, 551_350.0),
        };
        let factor = index_factor(year, assumptions);
        Some(vec![
            Bracket::new(0.0, 0.0),
            Bracket::new(fifteen * factor, 0.15),
            Bracket::new(twenty * factor, 0.20),
        ])
    }

    fn fica(&self, year: i32, status: FilingStatus, assumptions: &Assumptions) -> FicaParameters {
        // The additional Medicare threshold is fixed in statute, not indexed.
        let additional_medicare_threshold = match status {
            FilingStatus::MarriedJoint => 250_000.0,
            FilingStatus::MarriedSeparate => 125_000.0,
            FilingStatus::Single | FilingStatus::HeadOfHousehold => 200_000.0,
        };
        FicaParameters {
            social_security_rate: 0.062,
            wage_base: 168_600.0 * index_factor(year, assumptions),
            medicare_rate: 0.0145,
            additional_medicare_rate: 0.009,
            additional_medicare_threshold,
        }
    }

    fn rmd_divisor(&self, age: u32) -> Option<f64> {
        if age < 72 {
            return None;
        }
        let idx = ((age - 72) as usize).min(UNIFORM_LIFETIME.len() - 1);
        Some(UNIFORM_LIFETIME[idx])
    }

    fn contribution_limit(
        &self,
        kind: ContributionLimitKind,
        year: i32,
        age: u32,
        assumptions: &Assumptions,
    ) -> f64 {
        let (base, catch_up, catch_up_age) = match kind {
            ContributionLimitKind::Plan401k => (23_000.0, 7_500.0, 50),
            ContributionLimitKind::Ira => (7_000.0, 1_000.0, 50),
            ContributionLimitKind::Hsa => (4_150.0, 1_000.0, 55),
        };
        let limit = if age >= catch_up_age {
            base + catch_up
        } else {
            base
        };
        limit * index_factor(year, assumptions)
    }

    fn earnings_test_exempt_amount(&self, year: i32, assumptions: &Assumptions) -> f64 {
        22_320.0 * index_factor(year, assumptions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nominal() -> Assumptions {
        let mut assumptions = Assumptions::default();
        assumptions.economy.inflation_rate = 0.03;
        assumptions.economy.inflation_adjusted = true;
        assumptions
    }

    #[test]
    fn federal_tables_cover_all_statuses() {
        let tables = StaticTaxTables;
        let a = nominal();
        for status in [
            FilingStatus::Single,
            FilingStatus::MarriedJoint,
            FilingStatus::MarriedSeparate,
            FilingStatus::HeadOfHousehold,
        ] {
            let params = tables
                .tax_parameters(2024, status, Jurisdiction::Federal, &a)
                .expect("federal table");
            assert_eq!(params.brackets.len(), 7);
            assert_eq!(params.brackets[0].threshold, 0.0);
            assert!(params.brackets.windows(2).all(|w| w[0].threshold < w[1].threshold));
        }
    }

    #[test]
    fn thresholds_index_only_when_nominal() {
        let tables = StaticTaxTables;
        let mut a = nominal();
        let later = tables
            .tax_parameters(2026, FilingStatus::Single, Jurisdiction::Federal, &a)
            .expect("table");
        assert!((later.standard_deduction - 14_600.0 * 1.03 * 1.03).abs() < 1e-6);

        a.economy.inflation_adjusted = false;
        let real = tables
            .tax_parameters(2026, FilingStatus::Single, Jurisdiction::Federal, &a)
            .expect("table");
        assert_eq!(real.standard_deduction, 14_600.0);
    }

    #[test]
    fn unknown_state_has_no_table() {
        let tables = StaticTaxTables;
        let a = nominal();
        assert!(
            tables
                .tax_parameters(2024, FilingStatus::Single, Jurisdiction::State("ZZ"), &a)
                .is_none()
        );
        let texas = tables
            .tax_parameters(2024, FilingStatus::Single, Jurisdiction::State("tx"), &a)
            .expect("texas");
        assert!(texas.brackets.is_empty());
    }

    #[test]
    fn rmd_divisors_follow_uniform_lifetime_table() {
        let tables = StaticTaxTables;
        assert_eq!(tables.rmd_divisor(71), None);
        assert_eq!(tables.rmd_divisor(73), Some(26.5));
        assert_eq!(tables.rmd_divisor(120), Some(2.0));
        assert_eq!(tables.rmd_divisor(130), Some(2.0));
    }

    #[test]
    fn rmd_start_age_depends_on_birth_cohort() {
        assert_eq!(rmd_start_age(1950), 72);
        assert_eq!(rmd_start_age(1955), 73);
        assert_eq!(rmd_start_age(1960), 75);
    }

    #[test]
    fn contribution_limits_include_catch_up() {
        let tables = StaticTaxTables;
        let a = nominal();
        assert_eq!(
            tables.contribution_limit(ContributionLimitKind::Plan401k, 2024, 49, &a),
            23_000.0
        );
        assert_eq!(
            tables.contribution_limit(ContributionLimitKind::Plan401k, 2024, 50, &a),
            30_500.0
        );
        assert_eq!(
            tables.contribution_limit(ContributionLimitKind::Hsa, 2024, 55, &a),
            5_150.0
        );
    }
}
