//! Gram matrix builders for SVMs trained on precomputed kernels.

use crate::{Error, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, Zip};
use rayon::prelude::*;

/// Histogram intersection `sum_i min(a_i, b_i)`.
pub fn intersection(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    Zip::from(a).and(b).fold(0.0, |acc, &x, &y| acc + x.min(y))
}

/// Evaluates `kernel` between every row of `a` and every row of `b`.
///
/// Rows of the result are computed in parallel.
pub fn gram_matrix<F>(a: ArrayView2<f64>, b: ArrayView2<f64>, kernel: F) -> Result<Array2<f64>>
where
    F: Fn(ArrayView1<f64>, ArrayView1<f64>) -> f64 + Sync,
{
    if a.ncols() != b.ncols() {
        return Err(Error::shape(
            format!("{} features", a.ncols()),
            format!("{} features", b.ncols()),
        ));
    }
    let rows: Vec<Vec<f64>> = (0..a.nrows())
        .into_par_iter()
        .map(|i| b.outer_iter().map(|bj| kernel(a.row(i), bj)).collect())
        .collect();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((a.nrows(), b.nrows()), flat)
        .map_err(|e| Error::shape("a dense gram matrix", e))
}

/// Histogram intersection kernel between the rows of `a` and `b`.
pub fn intersection_kernel(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>> {
    gram_matrix(a, b, intersection)
}

pub fn linear_kernel(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>> {
    gram_matrix(a, b, |x, y| x.dot(&y))
}

/// Radial basis kernel `exp(-gamma |a - b|^2)`.
pub fn rbf_kernel(a: ArrayView2<f64>, b: ArrayView2<f64>, gamma: f64) -> Result<Array2<f64>> {
    gram_matrix(a, b, |x, y| {
        (-gamma * crate::cluster::squared_distance(x, y)).exp()
    })
}
