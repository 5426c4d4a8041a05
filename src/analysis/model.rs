//! Per-metric linear models: prior weights, ridge fitting and feature importance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::features::{model_feature_names, QualityMetric, LEVEL_FEATURE, MOMENTUM_FEATURE};
use crate::error::{AnalyticsError, Result};

/// Ridge penalty pulling fitted weights toward the priors.
pub const RIDGE_LAMBDA: f64 = 1.0;
/// Accuracy reported for a model that has never been trained.
pub const PRIOR_ACCURACY: f64 = 0.5;

/// Per-metric linear model over normalized inputs.
///
/// Prior weights carry the current level forward plus its momentum, which
/// is a plain trend extrapolation; training adjusts every weight by
/// regularised least squares around that prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub metric: QualityMetric,
    pub feature_names: Vec<String>,
    pub weights: Vec<f64>,
    pub bias: f64,
    pub accuracy: f64,
    pub trained_at: Option<DateTime<Utc>>,
    pub samples: usize,
    prior: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

impl LinearModel {
    pub fn with_priors(metric: QualityMetric) -> Self {
        let feature_names = model_feature_names();
        let prior: Vec<f64> = feature_names
            .iter()
            .map(|n| if n == LEVEL_FEATURE || n == MOMENTUM_FEATURE { 1.0 } else { 0.0 })
            .collect();
        Self {
            metric,
            feature_names,
            weights: prior.clone(),
            bias: 0.0,
            accuracy: PRIOR_ACCURACY,
            trained_at: None,
            samples: 0,
            prior,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.trained_at.is_some()
    }

    /// Bounded to [0, 1].
    pub fn predict(&self, x: &[f64]) -> f64 {
        let raw: f64 = self.bias + self.weights.iter().zip(x).map(|(w, v)| w * v).sum::<f64>();
        raw.clamp(0.0, 1.0)
    }

    /// Signed contribution of each input to the prediction.
    pub fn contributions(&self, x: &[f64]) -> Vec<(String, f64)> {
        self.feature_names
            .iter()
            .zip(self.weights.iter().zip(x))
            .map(|(name, (w, v))| (name.clone(), w * v))
            .collect()
    }

    /// |weight| normalized to sum to 1.
    pub fn importance(&self) -> Vec<FeatureImportance> {
        let total: f64 = self.weights.iter().map(|w| w.abs()).sum();
        let n = self.weights.len().max(1) as f64;
        self.feature_names
            .iter()
            .zip(&self.weights)
            .map(|(feature, w)| FeatureImportance {
                feature: feature.clone(),
                importance: if total > f64::EPSILON { w.abs() / total } else { 1.0 / n },
            })
            .collect()
    }

    /// Fit by ridge regression toward the priors. Accuracy is left to the
    /// caller, which knows the holdout split.
    pub fn fit(&mut self, xs: &[Vec<f64>], ys: &[f64]) -> Result<()> {
        if xs.is_empty() || xs.len() != ys.len() {
            return Err(AnalyticsError::analysis(
                "model training",
                format!("{} inputs for {} targets", xs.len(), ys.len()),
            ));
        }
        let d = self.prior.len() + 1;
        if let Some(bad) = xs.iter().find(|x| x.len() + 1 != d) {
            return Err(AnalyticsError::analysis(
                "model training",
                format!("expected {} inputs, got {}", d - 1, bad.len()),
            ));
        }

        // (X'X + λI) w = X'y + λ w_prior, bias as a trailing constant column.
        let mut a = vec![vec![0.0; d]; d];
        let mut b = vec![0.0; d];
        for (x, y) in xs.iter().zip(ys) {
            let row: Vec<f64> = x.iter().copied().chain(std::iter::once(1.0)).collect();
            for i in 0..d {
                b[i] += row[i] * y;
                for j in 0..d {
                    a[i][j] += row[i] * row[j];
                }
            }
        }
        for i in 0..d {
            a[i][i] += RIDGE_LAMBDA;
            b[i] += RIDGE_LAMBDA * self.prior.get(i).copied().unwrap_or(0.0);
        }

        let solution = solve(a, b).ok_or_else(|| AnalyticsError::analysis("model training", "singular system"))?;
        if solution.iter().any(|v| !v.is_finite()) {
            return Err(AnalyticsError::analysis("model training", "non-finite weights"));
        }
        self.bias = solution[d - 1];
        self.weights = solution[..d - 1].to_vec();
        self.samples = xs.len();
        self.trained_at = Some(Utc::now());
        Ok(())
    }

    /// 1 - mean absolute error, in [0, 1].
    pub fn evaluate(&self, xs: &[Vec<f64>], ys: &[f64]) -> Option<f64> {
        if xs.is_empty() {
            return None;
        }
        let mae = xs.iter().zip(ys).map(|(x, y)| (self.predict(x) - y).abs()).sum::<f64>() / xs.len() as f64;
        Some((1.0 - mae).clamp(0.0, 1.0))
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}
