use crate::cluster::{KMeans, KMeansParams};
use crate::{Error, Result};
use log::*;
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct GmmParams {
    pub max_iterations: usize,
    /// EM stops when the mean log-likelihood improves by less than this.
    pub tolerance: f64,
    /// Added to every variance to keep them positive.
    pub reg_covar: f64,
    pub seed: u64,
}

impl Default for GmmParams {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-3,
            reg_covar: 1e-6,
            seed: 42,
        }
    }
}

/// Gaussian mixture with diagonal covariances, fitted by expectation maximization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianMixture {
    pub weights: Array1<f64>,
    /// One mean per row.
    pub means: Array2<f64>,
    /// Diagonal of every covariance, one per row.
    pub variances: Array2<f64>,
    pub converged: bool,
    pub log_likelihood: f64,
}

fn log_sum_exp(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + values.map(|v| (v - max).exp()).sum::<f64>().ln()
}

impl GaussianMixture {
    pub fn fit(x: ArrayView2<f64>, k: usize, params: &GmmParams) -> Result<Self> {
        let (n, d) = x.dim();
        let kmeans = KMeans::fit(
            x,
            k,
            &KMeansParams {
                seed: params.seed,
                ..Default::default()
            },
        )?;
        let assignments = kmeans.predict(x)?;
        let mut resp = Array2::zeros((n, k));
        for (i, &cluster) in assignments.iter().enumerate() {
            resp[(i, cluster)] = 1.0;
        }
        let mut gmm = Self {
            weights: Array1::zeros(k),
            means: Array2::zeros((k, d)),
            variances: Array2::ones((k, d)),
            converged: false,
            log_likelihood: f64::NEG_INFINITY,
        };
        gmm.maximization(x, resp.view(), params.reg_covar);

        for iteration in 0..params.max_iterations {
            let (log_resp, log_likelihood) = gmm.expectation(x);
            let resp = log_resp.mapv(f64::exp);
            gmm.maximization(x, resp.view(), params.reg_covar);
            let change = log_likelihood - gmm.log_likelihood;
            gmm.log_likelihood = log_likelihood;
            debug!(
                "gmm iteration {} mean log-likelihood {} change {}",
                iteration, log_likelihood, change
            );
            if change.abs() < params.tolerance {
                gmm.converged = true;
                break;
            }
        }
        if !gmm.converged {
            warn!(
                "gmm with {} components did not converge in {} iterations",
                k, params.max_iterations
            );
        }
        Ok(gmm)
    }

    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    pub fn dim(&self) -> usize {
        self.means.ncols()
    }

    fn maximization(&mut self, x: ArrayView2<f64>, resp: ArrayView2<f64>, reg_covar: f64) {
        let n = x.nrows() as f64;
        let nk = resp.sum_axis(Axis(0)) + 10.0 * f64::EPSILON;
        let sum_x = resp.t().dot(&x);
        let sum_x2 = resp.t().dot(&x.mapv(|v| v * v));
        let nk_col = nk.view().insert_axis(Axis(1));
        let means = &sum_x / &nk_col;
        let mut variances = &sum_x2 / &nk_col - &means.mapv(|m| m * m);
        variances.mapv_inplace(|v| v.max(0.0) + reg_covar);
        self.weights = nk / n;
        self.means = means;
        self.variances = variances;
    }

    /// Per-sample, per-component `log(w_k N(x | mu_k, var_k))`.
    fn weighted_log_prob(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let d = self.dim() as f64;
        let precisions = self.variances.mapv(f64::recip);
        let log_det: Array1<f64> = self.variances.mapv(f64::ln).sum_axis(Axis(1));
        let mean_term: Array1<f64> = (&self.means * &self.means * &precisions).sum_axis(Axis(1));
        let quadratic = x.mapv(|v| v * v).dot(&precisions.t())
            - 2.0 * x.dot(&(&self.means * &precisions).t())
            + &mean_term;
        let mut log_prob = quadratic;
        Zip::from(log_prob.columns_mut())
            .and(&log_det)
            .and(&self.weights)
            .for_each(|mut column, &log_det, &weight| {
                column.mapv_inplace(|q| -0.5 * (d * (2.0 * PI).ln() + log_det + q) + weight.ln());
            });
        log_prob
    }

    /// Log responsibilities and the mean log-likelihood of `x`.
    fn expectation(&self, x: ArrayView2<f64>) -> (Array2<f64>, f64) {
        let mut log_prob = self.weighted_log_prob(x);
        let mut total = 0.0;
        for mut row in log_prob.outer_iter_mut() {
            let norm = log_sum_exp(row.iter().copied());
            total += norm;
            row.mapv_inplace(|v| v - norm);
        }
        (log_prob, total / x.nrows().max(1) as f64)
    }

    /// Posterior probability of every component for every sample.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.dim() {
            return Err(Error::shape(
                format!("{} features", self.dim()),
                format!("{} features", x.ncols()),
            ));
        }
        Ok(self.expectation(x).0.mapv(f64::exp))
    }

    /// Mean log-likelihood of the samples under the mixture.
    pub fn score(&self, x: ArrayView2<f64>) -> f64 {
        self.expectation(x).1
    }
}
