use serde::{Deserialize, Serialize};

use super::error::ProjectionError;
use super::types::PercentileMethod;

pub const MIN_SAMPLES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionSummary {
    pub median: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub percentile_10: f64,
    pub percentile_90: f64,
}

/// Summarises final-year outcomes. `sorted` must be in ascending order.
pub fn summarize(
    sorted: &[f64],
    method: PercentileMethod,
) -> Result<DistributionSummary, ProjectionError> {
    if sorted.len() < MIN_SAMPLES {
        return Err(ProjectionError::InsufficientData {
            required: MIN_SAMPLES,
            actual: sorted.len(),
        });
    }

    let n = sorted.len() as f64;
    let mean = sorted.iter().sum::<f64>() / n;
    let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    Ok(DistributionSummary {
        median: percentile(sorted, 0.5, method),
        mean,
        std_dev: variance.sqrt(),
        percentile_10: percentile(sorted, 0.1, method),
        percentile_90: percentile(sorted, 0.9, method),
    })
}

/// `p` is a fraction in [0, 1].
pub fn percentile(sorted: &[f64], p: f64, method: PercentileMethod) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let n = sorted.len();
    match method {
        PercentileMethod::Truncate => {
            let index = ((n as f64 * p).floor() as usize).min(n - 1);
            sorted[index]
        }
        PercentileMethod::Linear => {
            if n == 1 {
                return sorted[0];
            }
            let rank = p * (n as f64 - 1.0);
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            if lower == upper {
                sorted[lower]
            } else {
                let w = rank - lower as f64;
                sorted[lower] * (1.0 - w) + sorted[upper] * w
            }
        }
    }
}

pub fn sort_values(values: &mut [f64]) {
    values.sort_by(|a, b| a.total_cmp(b));
}
