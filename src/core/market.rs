use std::f64::consts::PI;

use rand::{Rng, RngCore};

use super::types::{AssetClass, AssetMap, ReturnParams, SimConfig};

/// Source of market outcomes for one episode.
///
/// Returns are gross real factors for one period (1.0 is no change).
/// Callers take `inflation` once per period, then sample each enabled
/// asset class, then `step`.
pub trait MarketSampler: Send {
    fn reset(&mut self, rng: &mut dyn RngCore);

    /// Gross inflation factor for the current period.
    fn inflation(&mut self, rng: &mut dyn RngCore) -> f64;

    /// Gross real return of `class`; bonds take the portfolio duration.
    fn sample(&mut self, class: AssetClass, duration: Option<f64>, rng: &mut dyn RngCore) -> f64;

    fn step(&mut self, rng: &mut dyn RngCore);

    /// Short real interest rate and short inflation rate, annualised.
    fn observe(&self) -> (f64, f64);
}

/// Log-normal parameters of a gross annual factor with the given
/// arithmetic mean and volatility.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LogNormal {
    mu: f64,
    sigma: f64,
}

impl LogNormal {
    fn from_moments(mean: f64, volatility: f64) -> Self {
        let gross = 1.0 + mean;
        let variance = (1.0 + (volatility / gross).powi(2)).ln();
        Self {
            mu: gross.ln() - variance / 2.0,
            sigma: variance.sqrt(),
        }
    }

    fn sample(&self, time_period: f64, sigma_scale: f64, rng: &mut dyn RngCore) -> f64 {
        let sigma = self.sigma * sigma_scale;
        (self.mu * time_period + sigma * time_period.sqrt() * standard_normal(rng)).exp()
    }
}

/// Independent log-normal returns and inflation. Episode means are drawn
/// once at reset from each parameter's standard error. Bond volatility
/// scales linearly with duration relative to the reference duration.
#[derive(Debug, Clone)]
pub struct LognormalMarket {
    params: AssetMap<ReturnParams>,
    inflation_mean: f64,
    inflation_volatility: f64,
    inflation_standard_error: f64,
    standard_error: bool,
    reference_duration: f64,
    time_period: f64,
    episode: AssetMap<LogNormal>,
    episode_inflation: LogNormal,
    episode_means: AssetMap<f64>,
    episode_inflation_mean: f64,
}

impl LognormalMarket {
    pub fn new(config: &SimConfig) -> Self {
        let params = AssetMap::from_fn(|class| *config.return_params(class));
        Self {
            episode: AssetMap::from_fn(|class| {
                LogNormal::from_moments(params[class].mean, params[class].volatility)
            }),
            episode_means: AssetMap::from_fn(|class| params[class].mean),
            params,
            inflation_mean: config.inflation_mean,
            inflation_volatility: config.inflation_volatility,
            inflation_standard_error: config.inflation_standard_error,
            standard_error: config.returns_standard_error,
            reference_duration: config.bonds_reference_duration,
            time_period: config.time_period,
            episode_inflation: LogNormal::from_moments(config.inflation_mean, config.inflation_volatility),
            episode_inflation_mean: config.inflation_mean,
        }
    }
}

impl MarketSampler for LognormalMarket {
    fn reset(&mut self, rng: &mut dyn RngCore) {
        for class in AssetClass::ALL {
            let p = self.params[class];
            let mean = if self.standard_error {
                p.mean + p.standard_error * standard_normal(rng)
            } else {
                p.mean
            };
            let mean = mean.max(-0.99);
            self.episode_means[class] = mean;
            self.episode[class] = LogNormal::from_moments(mean, p.volatility);
        }
        let inflation = if self.standard_error {
            self.inflation_mean + self.inflation_standard_error * standard_normal(rng)
        } else {
            self.inflation_mean
        };
        self.episode_inflation_mean = inflation.max(-0.99);
        self.episode_inflation =
            LogNormal::from_moments(self.episode_inflation_mean, self.inflation_volatility);
    }

    fn inflation(&mut self, rng: &mut dyn RngCore) -> f64 {
        self.episode_inflation.sample(self.time_period, 1.0, rng)
    }

    fn sample(&mut self, class: AssetClass, duration: Option<f64>, rng: &mut dyn RngCore) -> f64 {
        let scale = match (class, duration) {
            (AssetClass::RealBonds | AssetClass::NominalBonds, Some(d)) => d / self.reference_duration,
            _ => 1.0,
        };
        self.episode[class].sample(self.time_period, scale, rng)
    }

    fn step(&mut self, _rng: &mut dyn RngCore) {}

    fn observe(&self) -> (f64, f64) {
        (self.episode_means[AssetClass::Bills], self.episode_inflation_mean)
    }
}

/// Box-Muller transform over the injected generator.
pub fn standard_normal(rng: &mut dyn RngCore) -> f64 {
    let u1 = rng.random::<f64>().max(1e-12);
    let u2 = rng.random::<f64>();
    let r = (-2.0 * u1.ln()).sqrt();
    r * (2.0 * PI * u2).cos()
}
