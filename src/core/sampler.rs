use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use super::types::{Assumptions, MonteCarloSettings};

/// Anything that can hand out standard normal draws. Each trajectory owns
/// its own source; nothing here is shared between threads.
pub trait NormalSource {
    fn next_standard_normal(&mut self) -> f64;
}

pub struct SeededNormals {
    rng: ChaCha8Rng,
}

impl SeededNormals {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl NormalSource for SeededNormals {
    fn next_standard_normal(&mut self) -> f64 {
        StandardNormal.sample(&mut self.rng)
    }
}

/// A year can lose at most everything; anything below is a tail draw the
/// cashflow step can't represent.
pub const MIN_RETURN: f64 = -1.0;
/// Keeps the cumulative price index non-negative.
pub const MIN_INFLATION: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketSample {
    pub investment_return: f64,
    pub inflation: f64,
}

pub struct StochasticSampler<S> {
    source: S,
    return_mean: f64,
    return_std_dev: f64,
    inflation_mean: f64,
    inflation_std_dev: f64,
}

impl<S: NormalSource> StochasticSampler<S> {
    pub fn new(assumptions: &Assumptions, settings: &MonteCarloSettings, source: S) -> Self {
        Self {
            source,
            return_mean: assumptions.investment_return,
            return_std_dev: settings.return_std_dev,
            inflation_mean: assumptions.inflation_rate,
            inflation_std_dev: settings.inflation_std_dev,
        }
    }

    /// Return is drawn before inflation on every call.
    pub fn sample(&mut self) -> MarketSample {
        let z_return = self.source.next_standard_normal();
        let z_inflation = self.source.next_standard_normal();
        MarketSample {
            investment_return: (self.return_mean + self.return_std_dev * z_return)
                .max(MIN_RETURN),
            inflation: (self.inflation_mean + self.inflation_std_dev * z_inflation)
                .max(MIN_INFLATION),
        }
    }
}

/// Seed for trajectory `index` of a run started from `base_seed`.
pub fn derive_seed(base_seed: u64, index: u64) -> u64 {
    splitmix64(base_seed ^ index.wrapping_mul(0xD1B5_4A32_D192_ED03))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
