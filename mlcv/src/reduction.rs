use crate::{Error, Result};
use float_ord::FloatOrd;
use log::*;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Principal component analysis fitted on a sample matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pca {
    pub mean: Array1<f64>,
    /// One component per row, sorted by decreasing explained variance.
    pub components: Array2<f64>,
    pub explained_variance: Array1<f64>,
    total_variance: f64,
}

impl Pca {
    /// Fits the `n_components` directions of largest variance of `x`.
    pub fn fit(x: ArrayView2<f64>, n_components: usize) -> Result<Self> {
        let (n_samples, n_features) = x.dim();
        if n_components == 0 || n_components > n_features {
            return Err(Error::invalid(
                "n_components",
                format!("{n_components} is not in 1..={n_features}"),
            ));
        }
        if n_samples < 2 {
            return Err(Error::EmptyInput("pca needs at least two samples"));
        }
        let mean = x
            .mean_axis(Axis(0))
            .ok_or(Error::EmptyInput("pca needs at least two samples"))?;
        let centered = &x - &mean;
        let covariance = centered.t().dot(&centered) / (n_samples - 1) as f64;
        debug!(
            "decomposing {} x {} covariance matrix",
            n_features, n_features
        );
        let covariance =
            DMatrix::from_fn(n_features, n_features, |i, j| covariance[(i, j)]);
        let eigen = SymmetricEigen::new(covariance);

        let mut order: Vec<usize> = (0..n_features).collect();
        order.sort_unstable_by_key(|&i| std::cmp::Reverse(FloatOrd(eigen.eigenvalues[i])));
        let order = &order[..n_components];

        let components = Array2::from_shape_fn((n_components, n_features), |(c, f)| {
            eigen.eigenvectors[(f, order[c])]
        });
        let explained_variance =
            Array1::from_iter(order.iter().map(|&i| eigen.eigenvalues[i].max(0.0)));
        let total_variance = eigen.eigenvalues.iter().map(|v| v.max(0.0)).sum();
        Ok(Self {
            mean,
            components,
            explained_variance,
            total_variance,
        })
    }

    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    /// Fraction of the total variance captured by each kept component.
    pub fn explained_variance_ratio(&self) -> Array1<f64> {
        if self.total_variance > 0.0 {
            &self.explained_variance / self.total_variance
        } else {
            Array1::zeros(self.n_components())
        }
    }

    /// Projects `x` onto the principal components.
    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.mean.len() {
            return Err(Error::shape(
                format!("{} features", self.mean.len()),
                format!("{} features", x.ncols()),
            ));
        }
        Ok((&x - &self.mean).dot(&self.components.t()))
    }
}
