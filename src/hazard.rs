//! Probability estimator seam.
//!
//! The CPCV engine is agnostic to the model family; it only needs something
//! that fits on labeled rows and emits probabilities in [0, 1]. External
//! modeling code implements [`ProbabilityEstimator`]; [`LogisticHazard`] is
//! the in-crate reference implementation so the pipeline runs end to end.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{Error, Result};

/// A trainable flip-probability estimator.
///
/// `fit` receives one feature row per timeline minute and the binary
/// flip-within-horizon label; `predict` must return one probability in
/// [0, 1] per input row. Implementations must be deterministic for identical
/// inputs.
pub trait ProbabilityEstimator {
    type Model;

    fn fit(&self, features: &[&[f64]], labels: &[bool]) -> Result<Self::Model>;

    fn predict(&self, model: &Self::Model, features: &[&[f64]]) -> Vec<f64>;
}

/// Reference logistic hazard model.
///
/// Balanced class weights, L2 penalty, deterministic full-batch gradient
/// descent from a zero initialization; inputs are standardized internally so
/// the learning rate is scale-free.
#[derive(Debug, Clone)]
pub struct LogisticHazard {
    pub max_iter: usize,
    pub learning_rate: f64,
    pub l2: f64,
    /// Stop when the gradient max-norm falls below this.
    pub tol: f64,
}

impl Default for LogisticHazard {
    fn default() -> Self {
        Self {
            max_iter: 200,
            learning_rate: 0.5,
            l2: 1e-4,
            tol: 1e-6,
        }
    }
}

/// Fitted logistic model, including its standardization constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    weights: Vec<f64>,
    bias: f64,
    means: Vec<f64>,
    stds: Vec<f64>,
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl LogisticHazard {
    fn standardization(features: &[&[f64]]) -> (Vec<f64>, Vec<f64>) {
        let n = features.len() as f64;
        let dim = features[0].len();
        let mut means = vec![0.0; dim];
        for row in features {
            for (m, v) in means.iter_mut().zip(*row) {
                *m += v;
            }
        }
        for m in &mut means {
            *m /= n;
        }
        let mut stds = vec![0.0; dim];
        for row in features {
            for ((s, v), m) in stds.iter_mut().zip(*row).zip(&means) {
                *s += (v - m) * (v - m);
            }
        }
        for s in &mut stds {
            *s = (*s / n).sqrt();
            if *s < 1e-12 {
                *s = 1.0; // constant column: leave it centered only
            }
        }
        (means, stds)
    }
}

impl ProbabilityEstimator for LogisticHazard {
    type Model = LogisticModel;

    fn fit(&self, features: &[&[f64]], labels: &[bool]) -> Result<Self::Model> {
        if features.is_empty() {
            return Err(Error::EmptyInput {
                context: "estimator training rows",
            });
        }
        if features.len() != labels.len() {
            return Err(Error::DimensionMismatch {
                context: "estimator labels",
                expected: features.len(),
                actual: labels.len(),
            });
        }
        let dim = features[0].len();
        if features.iter().any(|r| r.len() != dim) {
            return Err(Error::DimensionMismatch {
                context: "estimator feature rows",
                expected: dim,
                actual: 0,
            });
        }

        let (means, stds) = Self::standardization(features);

        let n = features.len();
        let n_pos = labels.iter().filter(|&&y| y).count();
        let n_neg = n - n_pos;

        // Single-class training set: fall back to the (clamped) base rate.
        if n_pos == 0 || n_neg == 0 {
            let base = (n_pos as f64 / n as f64).clamp(1e-6, 1.0 - 1e-6);
            warn!(
                n_rows = n,
                n_pos, "single-class training set; fitting intercept-only model"
            );
            return Ok(LogisticModel {
                weights: vec![0.0; dim],
                bias: (base / (1.0 - base)).ln(),
                means,
                stds,
            });
        }

        // sklearn-style "balanced": w_c = n / (2 * n_c)
        let w_pos = n as f64 / (2.0 * n_pos as f64);
        let w_neg = n as f64 / (2.0 * n_neg as f64);
        let weight_sum = w_pos * n_pos as f64 + w_neg * n_neg as f64;

        // Pre-standardize once.
        let x: Vec<Vec<f64>> = features
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&means)
                    .zip(&stds)
                    .map(|((v, m), s)| (v - m) / s)
                    .collect()
            })
            .collect();

        let mut weights = vec![0.0; dim];
        let mut bias = 0.0;
        for iter in 0..self.max_iter {
            let mut grad_w = vec![0.0; dim];
            let mut grad_b = 0.0;
            for (row, &y) in x.iter().zip(labels) {
                let z = bias + row.iter().zip(&weights).map(|(a, w)| a * w).sum::<f64>();
                let p = sigmoid(z);
                let target = if y { 1.0 } else { 0.0 };
                let cw = if y { w_pos } else { w_neg };
                let err = cw * (p - target);
                for (g, v) in grad_w.iter_mut().zip(row) {
                    *g += err * v;
                }
                grad_b += err;
            }
            let mut max_grad = grad_b.abs() / weight_sum;
            for (g, w) in grad_w.iter_mut().zip(&weights) {
                *g = *g / weight_sum + self.l2 * w;
                max_grad = max_grad.max(g.abs());
            }
            grad_b /= weight_sum;

            for (w, g) in weights.iter_mut().zip(&grad_w) {
                *w -= self.learning_rate * g;
            }
            bias -= self.learning_rate * grad_b;

            if max_grad < self.tol {
                debug!(iterations = iter + 1, "logistic fit converged");
                break;
            }
        }

        Ok(LogisticModel {
            weights,
            bias,
            means,
            stds,
        })
    }

    fn predict(&self, model: &Self::Model, features: &[&[f64]]) -> Vec<f64> {
        features
            .iter()
            .map(|row| {
                let z = model.bias
                    + row
                        .iter()
                        .zip(&model.means)
                        .zip(&model.stds)
                        .zip(&model.weights)
                        .map(|(((v, m), s), w)| (v - m) / s * w)
                        .sum::<f64>();
                sigmoid(z)
            })
            .collect()
    }
}
