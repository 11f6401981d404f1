//! Progressive tax math and the withdrawal gross-up solvers.
//!
//! Everything here is a pure function of its arguments. Income figures are
//! gross for the jurisdiction in question; a [`Schedule`] pairs a baseline
//! income with the deduction and brackets that apply to it.

use super::tables::{Bracket, FicaParameters};
use super::types::FilingStatus;

/// Net-amount tolerance of both gross-up solvers, in dollars.
pub const GROSS_UP_TOLERANCE: f64 = 0.01;
/// Upper bound on bracket segments walked by [`gross_up`].
pub const GROSS_UP_MAX_SEGMENTS: usize = 256;
/// Upper bound on Newton-style corrections after the bracket walk.
pub const GROSS_UP_MAX_REFINEMENTS: usize = 32;
/// Upper bound on bisection steps in [`solve_monotone`].
pub const SOLVER_MAX_ITERATIONS: usize = 96;
/// Width of the final bisection bracket, in dollars.
pub const SOLVER_RESOLUTION: f64 = 1e-7;

const BREAKPOINT_EPS: f64 = 1e-7;

pub fn bracket_tax(taxable: f64, brackets: &[Bracket]) -> f64 {
    if taxable <= 0.0 {
        return 0.0;
    }
    let mut tax = 0.0;
    for (idx, bracket) in brackets.iter().enumerate() {
        if taxable <= bracket.threshold {
            break;
        }
        let upper = brackets
            .get(idx + 1)
            .map(|next| next.threshold)
            .unwrap_or(f64::INFINITY);
        tax += (upper.min(taxable) - bracket.threshold) * bracket.rate;
    }
    tax.max(0.0)
}

pub fn income_tax(gross: f64, deduction: f64, brackets: &[Bracket]) -> f64 {
    bracket_tax((gross - deduction).max(0.0), brackets)
}

/// Rate applied to the next dollar of taxable income.
pub fn marginal_rate(taxable: f64, brackets: &[Bracket]) -> f64 {
    if taxable < 0.0 {
        return 0.0;
    }
    brackets
        .iter()
        .rev()
        .find(|b| taxable >= b.threshold)
        .map(|b| b.rate)
        .unwrap_or(0.0)
}

/// Top of the highest bracket whose rate does not exceed `rate`, in taxable
/// income. `None` when no bracket qualifies; infinite when the top bracket
/// qualifies.
pub fn bracket_ceiling(rate: f64, brackets: &[Bracket]) -> Option<f64> {
    let idx = brackets
        .iter()
        .rposition(|b| b.rate <= rate + BREAKPOINT_EPS)?;
    Some(
        brackets
            .get(idx + 1)
            .map(|next| next.threshold)
            .unwrap_or(f64::INFINITY),
    )
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FicaTax {
    pub social_security: f64,
    pub medicare: f64,
}

impl FicaTax {
    pub fn total(self) -> f64 {
        self.social_security + self.medicare
    }
}

/// Payroll tax on earned wages only. Benefits and passive income must never
/// be passed here.
pub fn fica_tax(earned: f64, params: &FicaParameters) -> FicaTax {
    let wages = earned.max(0.0);
    let social_security = wages.min(params.wage_base.max(0.0)) * params.social_security_rate;
    let medicare = wages * params.medicare_rate
        + (wages - params.additional_medicare_threshold).max(0.0) * params.additional_medicare_rate;
    FicaTax {
        social_security,
        medicare,
    }
}

/// Portion of Social-Security benefits included in federal income, from the
/// combined-income worksheet. `other_income` is AGI excluding every benefit
/// dollar.
pub fn taxable_social_security(other_income: f64, benefits: f64, status: FilingStatus) -> f64 {
    if benefits <= 0.0 {
        return 0.0;
    }
    let (base, adjusted) = match status {
        FilingStatus::MarriedJoint => (32_000.0, 44_000.0),
        FilingStatus::MarriedSeparate => (0.0, 0.0),
        FilingStatus::Single | FilingStatus::HeadOfHousehold => (25_000.0, 34_000.0),
    };
    let combined = other_income.max(0.0) + 0.5 * benefits;
    if combined <= base {
        return 0.0;
    }
    let first_tier = (0.5 * (combined.min(adjusted) - base)).min(0.5 * benefits);
    let second_tier = 0.85 * (combined - adjusted).max(0.0);
    (first_tier + second_tier).min(0.85 * benefits)
}

/// AGI with benefits swapped for their taxable portion. Benefits are already
/// part of `gross_income`, so they are removed before the taxable share is
/// added back.
pub fn adjusted_gross_income(
    gross_income: f64,
    social_security_benefits: f64,
    taxable_benefits: f64,
    exclusions: f64,
) -> f64 {
    gross_income - social_security_benefits + taxable_benefits - exclusions
}

/// Long-term gains tax where `gains` stack on top of `ordinary_taxable`
/// (ordinary income after deduction, possibly negative).
pub fn capital_gains_tax(ordinary_taxable: f64, gains: f64, brackets: &[Bracket]) -> f64 {
    if gains <= 0.0 {
        return 0.0;
    }
    let start = ordinary_taxable.max(0.0);
    let end = (ordinary_taxable + gains).max(0.0);
    if end <= start {
        return 0.0;
    }
    let mut tax = 0.0;
    for (idx, bracket) in brackets.iter().enumerate() {
        let upper = brackets
            .get(idx + 1)
            .map(|next| next.threshold)
            .unwrap_or(f64::INFINITY);
        let overlap = end.min(upper) - start.max(bracket.threshold);
        if overlap > 0.0 {
            tax += overlap * bracket.rate;
        }
    }
    tax
}

/// A jurisdiction's schedule evaluated on top of income already realized.
#[derive(Clone, Copy, Debug)]
pub struct Schedule<'a> {
    pub baseline: f64,
    pub deduction: f64,
    pub brackets: &'a [Bracket],
}

impl<'a> Schedule<'a> {
    pub fn new(baseline: f64, deduction: f64, brackets: &'a [Bracket]) -> Self {
        Self {
            baseline,
            deduction,
            brackets,
        }
    }

    pub fn incremental_tax(&self, extra: f64) -> f64 {
        let before = income_tax(self.baseline, self.deduction, self.brackets);
        let after = income_tax(self.baseline + extra.max(0.0), self.deduction, self.brackets);
        (after - before).max(0.0)
    }

    pub fn rate_at(&self, extra: f64) -> f64 {
        marginal_rate(self.baseline + extra - self.deduction, self.brackets)
    }

    /// Gross income remaining before the marginal rate changes.
    fn room(&self, extra: f64) -> f64 {
        let position = self.baseline + extra;
        std::iter::once(self.deduction)
            .chain(self.brackets.iter().map(|b| self.deduction + b.threshold))
            .map(|point| point - position)
            .filter(|distance| *distance > BREAKPOINT_EPS)
            .fold(f64::INFINITY, f64::min)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GrossUpRequest<'a> {
    pub net_target: f64,
    pub available: f64,
    pub federal: Option<Schedule<'a>>,
    pub state: Option<Schedule<'a>>,
    pub penalty_rate: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GrossUp {
    pub gross: f64,
    pub net: f64,
    pub federal_tax: f64,
    pub state_tax: f64,
    pub penalty: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl GrossUpRequest<'_> {
    fn rate_at(&self, extra: f64) -> f64 {
        self.federal.map(|s| s.rate_at(extra)).unwrap_or(0.0)
            + self.state.map(|s| s.rate_at(extra)).unwrap_or(0.0)
            + self.penalty_rate.max(0.0)
    }

    fn room(&self, extra: f64) -> f64 {
        let fed = self.federal.map(|s| s.room(extra)).unwrap_or(f64::INFINITY);
        let state = self.state.map(|s| s.room(extra)).unwrap_or(f64::INFINITY);
        fed.min(state)
    }
}

/// Net proceeds of withdrawing `gross` as ordinary income.
pub fn evaluate_ordinary(gross: f64, request: &GrossUpRequest<'_>) -> GrossUp {
    let gross = gross.max(0.0);
    let federal_tax = request
        .federal
        .map(|s| s.incremental_tax(gross))
        .unwrap_or(0.0);
    let state_tax = request
        .state
        .map(|s| s.incremental_tax(gross))
        .unwrap_or(0.0);
    let penalty = gross * request.penalty_rate.max(0.0);
    GrossUp {
        gross,
        net: gross - federal_tax - state_tax - penalty,
        federal_tax,
        state_tax,
        penalty,
        iterations: 0,
        converged: true,
    }
}

/// Smallest ordinary-income withdrawal whose after-tax proceeds reach
/// `net_target`, capped at `available`.
///
/// Walks bracket segments: each segment's remaining room is consumed at its
/// combined marginal rate until the target is met, then a bounded correction
/// loop removes floating residue. The result nets within
/// [`GROSS_UP_TOLERANCE`] of the target unless capped by `available`.
pub fn gross_up(request: &GrossUpRequest<'_>) -> GrossUp {
    let available = request.available.max(0.0);
    if request.net_target <= 0.0 || available <= 0.0 {
        return GrossUp {
            converged: true,
            ..GrossUp::default()
        };
    }

    let mut extra = 0.0;
    let mut remaining = request.net_target;
    let mut iterations = 0;

    while remaining > 0.0 && iterations < GROSS_UP_MAX_SEGMENTS {
        iterations += 1;
        // Look just past the current point so a segment that ended exactly on
        // a breakpoint picks up the next bracket's rate.
        let keep = 1.0 - request.rate_at(extra + BREAKPOINT_EPS);
        let room = request.room(extra).min(available - extra);

        if keep <= BREAKPOINT_EPS {
            if room.is_infinite() {
                break;
            }
            extra += room;
        } else if room.is_infinite() || remaining <= room * keep {
            extra += remaining / keep;
            remaining = 0.0;
        } else {
            extra += room;
            remaining -= room * keep;
        }

        if extra >= available - BREAKPOINT_EPS {
            extra = available;
            break;
        }
    }

    let mut result = evaluate_ordinary(extra.min(available), request);
    for _ in 0..GROSS_UP_MAX_REFINEMENTS {
        let residual = request.net_target - result.net;
        if residual.abs() <= GROSS_UP_TOLERANCE || (residual > 0.0 && result.gross >= available) {
            break;
        }
        iterations += 1;
        let keep = (1.0 - request.rate_at(result.gross)).max(0.01);
        let next = (result.gross + residual / keep).clamp(0.0, available);
        result = evaluate_ordinary(next, request);
    }

    let residual = request.net_target - result.net;
    result.iterations = iterations;
    result.converged =
        residual.abs() <= GROSS_UP_TOLERANCE || (residual > 0.0 && result.gross >= available);
    result
}

#[derive(Clone, Copy, Debug)]
pub struct CapitalGainsRequest<'a> {
    pub net_target: f64,
    pub available: f64,
    /// Gain share of every dollar sold (average-cost approximation).
    pub gains_ratio: f64,
    /// Federal ordinary taxable income, after deduction, may be negative.
    pub ordinary_taxable: f64,
    /// Gains already realized earlier in the year.
    pub realized_gains: f64,
    pub brackets: Option<&'a [Bracket]>,
    /// State taxes gains as ordinary income.
    pub state: Option<Schedule<'a>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CapitalGainsGrossUp {
    pub gross: f64,
    pub net: f64,
    pub gains: f64,
    pub federal_tax: f64,
    pub state_tax: f64,
    pub iterations: usize,
    pub converged: bool,
}

pub fn evaluate_capital_gains(gross: f64, request: &CapitalGainsRequest<'_>) -> CapitalGainsGrossUp {
    let gross = gross.max(0.0);
    let gains = gross * request.gains_ratio.clamp(0.0, 1.0);
    let federal_tax = request
        .brackets
        .map(|brackets| {
            let before =
                capital_gains_tax(request.ordinary_taxable, request.realized_gains, brackets);
            let after = capital_gains_tax(
                request.ordinary_taxable,
                request.realized_gains + gains,
                brackets,
            );
            (after - before).max(0.0)
        })
        .unwrap_or(0.0);
    let state_tax = request
        .state
        .map(|s| s.incremental_tax(gains))
        .unwrap_or(0.0);
    CapitalGainsGrossUp {
        gross,
        net: gross - federal_tax - state_tax,
        gains,
        federal_tax,
        state_tax,
        iterations: 0,
        converged: true,
    }
}

/// Result of [`solve_monotone`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Solved {
    pub x: f64,
    pub value: f64,
    pub iterations: usize,
    /// `value` is within [`GROSS_UP_TOLERANCE`] of the target, or the target
    /// is out of reach and `x` is the upper bound.
    pub converged: bool,
}

/// Smallest `x` in `[0, upper]` with `f(x) >= target`, by bisection. `f` must
/// be non-decreasing. `hint` is a first guess used to narrow the bracket; an
/// infinite `upper` is replaced by doubling from the hint.
pub fn solve_monotone(target: f64, upper: f64, hint: f64, f: impl Fn(f64) -> f64) -> Solved {
    let upper = upper.max(0.0);
    let at_zero = f(0.0);
    if at_zero >= target || upper <= 0.0 {
        return Solved {
            x: 0.0,
            value: at_zero,
            iterations: 0,
            converged: at_zero >= target - GROSS_UP_TOLERANCE || upper <= 0.0,
        };
    }

    let mut iterations = 0;
    let mut lo = 0.0;
    let mut hi = upper;
    let hint = hint.clamp(0.0, upper);
    if hint > 0.0 && hint.is_finite() {
        if f(hint) < target {
            lo = hint;
        } else {
            hi = hint;
        }
    }
    if !hi.is_finite() {
        let mut reach = lo.max(1.0);
        while f(reach) < target && iterations < SOLVER_MAX_ITERATIONS {
            iterations += 1;
            lo = reach;
            reach *= 2.0;
        }
        hi = reach;
    } else if hi == upper {
        let at_upper = f(upper);
        if at_upper < target {
            return Solved {
                x: upper,
                value: at_upper,
                iterations,
                converged: true,
            };
        }
    }

    while hi - lo > SOLVER_RESOLUTION && iterations < SOLVER_MAX_ITERATIONS {
        iterations += 1;
        let mid = (lo + hi) * 0.5;
        if f(mid) < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let value = f(hi);
    Solved {
        x: hi,
        value,
        iterations,
        converged: (value - target).abs() <= GROSS_UP_TOLERANCE,
    }
}

/// Brokerage sale needed to net `net_target`. The sale's own gains move the
/// stacking point for the gains bracket, so the sale size is solved on the
/// monotone net-proceeds curve.
pub fn gross_up_capital_gains(request: &CapitalGainsRequest<'_>) -> CapitalGainsGrossUp {
    if request.net_target <= 0.0 || request.available <= 0.0 {
        return CapitalGainsGrossUp {
            converged: true,
            ..CapitalGainsGrossUp::default()
        };
    }
    let solved = solve_monotone(request.net_target, request.available, 0.0, |gross| {
        evaluate_capital_gains(gross, request).net
    });
    let mut result = evaluate_capital_gains(solved.x, request);
    result.iterations = solved.iterations;
    result.converged = solved.converged;
    result
}
