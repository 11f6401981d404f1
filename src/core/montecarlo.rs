//! Monte Carlo batches over the projection engine.
//!
//! Each trial replays the same household with its own sequence of annual
//! market returns. Trials share nothing, so a trial's result depends only on
//! `(seed, trial)`.

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::engine::{ProjectionEngine, projection_years};
use super::entities::Account;
use super::error::EngineError;
use super::types::{ProjectionRequest, SimulationYear};

const MIN_RETURN: f64 = -0.95;
const MAX_RETURN: f64 = 2.5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonteCarloConfig {
    pub trials: u32,
    pub seed: u64,
    /// Standard deviation of the annual nominal return.
    pub volatility: f64,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            trials: 500,
            seed: 42,
            volatility: 0.15,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearPercentiles {
    pub year: i32,
    pub age: u32,
    pub p10_net_worth: f64,
    pub p50_net_worth: f64,
    pub p90_net_worth: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonteCarloSummary {
    pub trials_requested: u32,
    pub trials_completed: u32,
    pub cancelled: bool,
    /// Share of completed trials that end without unfunded spending.
    pub success_rate: f64,
    pub years: Vec<YearPercentiles>,
}

/// Runs up to `config.trials` projections. `progress` is called with
/// `(completed, requested)` after every trial; `cancel` is checked before
/// each one.
pub fn run_monte_carlo(
    request: &ProjectionRequest,
    config: &MonteCarloConfig,
    progress: &mut dyn FnMut(u32, u32),
    cancel: &AtomicBool,
) -> Result<MonteCarloSummary, EngineError> {
    if config.trials == 0 {
        return Err(EngineError::InvalidInput("trials must be at least 1".to_string()));
    }
    if !config.volatility.is_finite() || config.volatility < 0.0 {
        return Err(EngineError::InvalidInput(format!(
            "volatility must be finite and non-negative, got {}",
            config.volatility
        )));
    }

    let assumptions = &request.assumptions;
    let horizon = projection_years(request.duration_years, assumptions) as usize;
    let mean = assumptions.investments.return_rate;
    info!(
        trials = config.trials,
        seed = config.seed,
        horizon,
        "starting monte carlo batch"
    );

    let mut net_worths: Vec<Vec<f64>> = vec![Vec::with_capacity(config.trials as usize); horizon];
    let mut timeline: Vec<(i32, u32)> = Vec::with_capacity(horizon);
    let mut successes = 0_u32;
    let mut completed = 0_u32;
    let mut cancelled = false;

    for trial in 0..config.trials {
        if cancel.load(Ordering::Relaxed) {
            cancelled = true;
            info!(completed, "monte carlo batch cancelled");
            break;
        }

        let mut sampler = NormalSampler::new(derive_seed(config.seed, trial));
        let returns: Vec<f64> = (0..horizon)
            .map(|_| sample_return(mean, config.volatility, &mut sampler))
            .collect();
        let years = ProjectionEngine::default().with_returns(&returns).project(
            request.duration_years,
            &request.accounts,
            &request.incomes,
            &request.expenses,
            assumptions,
            &request.tax_state,
        )?;

        if timeline.is_empty() {
            timeline = years.iter().map(|y| (y.year, y.age)).collect();
        }
        for (bucket, year) in net_worths.iter_mut().zip(&years) {
            bucket.push(year.net_worth);
        }
        let funded = trial_succeeded(&years);
        if funded {
            successes += 1;
        }
        completed += 1;
        debug!(trial, funded, "monte carlo trial finished");
        progress(completed, config.trials);
    }

    let years = timeline
        .into_iter()
        .zip(net_worths.iter_mut())
        .map(|((year, age), values)| YearPercentiles {
            year,
            age,
            p10_net_worth: percentile(values, 10.0),
            p50_net_worth: percentile(values, 50.0),
            p90_net_worth: percentile(values, 90.0),
        })
        .collect();
    let success_rate = if completed > 0 {
        successes as f64 / completed as f64
    } else {
        0.0
    };
    info!(completed, success_rate, "monte carlo batch finished");

    Ok(MonteCarloSummary {
        trials_requested: config.trials,
        trials_completed: completed,
        cancelled,
        success_rate,
        years,
    })
}

/// A trial fails if its last year still carries unfunded spending.
fn trial_succeeded(years: &[SimulationYear]) -> bool {
    years.last().is_none_or(|last| {
        !last
            .accounts
            .iter()
            .any(|a| matches!(a, Account::DeficitDebt(d) if d.amount > 0.0))
    })
}

fn sample_return(mean: f64, volatility: f64, sampler: &mut NormalSampler) -> f64 {
    (mean + volatility * sampler.standard_normal()).clamp(MIN_RETURN, MAX_RETURN)
}

fn derive_seed(base_seed: u64, trial: u32) -> u64 {
    splitmix64(base_seed ^ ((trial as u64) << 32 | trial as u64))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Box-Muller over a ChaCha stream; the second draw of each pair is cached.
struct NormalSampler {
    rng: ChaCha8Rng,
    cached_normal: Option<f64>,
}

impl NormalSampler {
    fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            cached_normal: None,
        }
    }

    fn standard_normal(&mut self) -> f64 {
        if let Some(z) = self.cached_normal.take() {
            return z;
        }

        let u1: f64 = self.rng.r#gen::<f64>().max(1e-12);
        let u2: f64 = self.rng.r#gen();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * PI * u2;

        self.cached_normal = Some(r * theta.sin());
        r * theta.cos()
    }
}

fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}
