//! Descriptive statistics, z-scores and least-squares fitting.

use crate::error::AnalyticsError;
use serde::{Deserialize, Serialize};

/// Minimum baseline length for a z-score.
pub const MIN_Z_BASELINE: usize = 3;

/// A simple time series for statistical analysis.
pub struct TimeSeries<'a> {
    values: &'a [f64],
}

impl<'a> TimeSeries<'a> {
    pub fn new(values: &'a [f64]) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self.values.iter().map(|&x| (x - mean).powi(2)).sum();
        sum_sq_diff / self.values.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Standard deviation relative to the mean. Falls back to the absolute
    /// standard deviation when the mean is zero.
    pub fn coefficient_of_variation(&self) -> f64 {
        let mean = self.mean();
        if mean.abs() < f64::EPSILON {
            return self.std_dev();
        }
        self.std_dev() / mean.abs()
    }

    /// Z-score of a value relative to this series.
    /// Z = (value - mean) / std_dev
    pub fn z_score(&self, value: f64) -> Result<f64, AnalyticsError> {
        if self.values.len() < MIN_Z_BASELINE {
            return Err(AnalyticsError::insufficient("z-score baseline", MIN_Z_BASELINE, self.values.len()));
        }
        let std = self.std_dev();
        let mean = self.mean();
        if std == 0.0 {
            // Any departure from a constant baseline is infinitely surprising.
            if (value - mean).abs() > f64::EPSILON {
                return Ok(f64::INFINITY.copysign(value - mean));
            }
            return Ok(0.0);
        }
        Ok((value - mean) / std)
    }
}

/// Mean / standard deviation snapshot of a baseline window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub std_dev: f64,
    pub sample_count: usize,
}

impl Baseline {
    pub fn from_values(values: &[f64]) -> Self {
        let ts = TimeSeries::new(values);
        Self {
            mean: ts.mean(),
            std_dev: ts.std_dev(),
            sample_count: ts.len(),
        }
    }
}

/// Least-squares line through `(x, y)` points plus Pearson correlation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Regression {
    pub slope: f64,
    pub intercept: f64,
    pub correlation: f64,
    pub n: usize,
}

impl Regression {
    pub fn at(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/// Fit `y = intercept + slope * x`. `None` with fewer than two points or
/// when every x is identical.
pub fn linear_regression(points: &[(f64, f64)]) -> Option<Regression> {
    let n = points.len();
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / nf;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / nf;

    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for &(x, y) in points {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    if sxx <= f64::EPSILON {
        return None;
    }

    let slope = sxy / sxx;
    let correlation = if syy <= f64::EPSILON {
        0.0
    } else {
        (sxy / (sxx.sqrt() * syy.sqrt())).clamp(-1.0, 1.0)
    };

    Some(Regression {
        slope,
        intercept: mean_y - slope * mean_x,
        correlation,
        n,
    })
}
