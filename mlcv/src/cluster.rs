use crate::{Error, Result};
use float_ord::FloatOrd;
use log::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansParams {
    pub max_iterations: usize,
    /// Iteration stops once no centroid moves more than this (squared distance).
    pub tolerance: f64,
    pub seed: u64,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-4,
            seed: 42,
        }
    }
}

/// Lloyd's k-means with k-means++ seeding. Serves as the visual word codebook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeans {
    pub centroids: Array2<f64>,
    pub inertia: f64,
}

pub(crate) fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    Zip::from(a).and(b).fold(0.0, |acc, &x, &y| acc + (x - y) * (x - y))
}

fn nearest(centroids: ArrayView2<f64>, sample: ArrayView1<f64>) -> (usize, f64) {
    centroids
        .outer_iter()
        .enumerate()
        .map(|(i, c)| (i, squared_distance(c, sample)))
        .min_by_key(|&(_, d)| FloatOrd(d))
        .unwrap_or((0, f64::INFINITY))
}

fn kmeans_plus_plus(x: ArrayView2<f64>, k: usize, rng: &mut impl Rng) -> Array2<f64> {
    let n = x.nrows();
    let mut centroids = Array2::zeros((k, x.ncols()));
    centroids.row_mut(0).assign(&x.row(rng.gen_range(0..n)));
    let mut distances: Vec<f64> = x
        .outer_iter()
        .map(|row| squared_distance(row, centroids.row(0)))
        .collect();
    for c in 1..k {
        let index = match WeightedIndex::new(&distances) {
            Ok(weights) => weights.sample(rng),
            // Every sample coincides with a centroid already.
            Err(_) => rng.gen_range(0..n),
        };
        centroids.row_mut(c).assign(&x.row(index));
        for (d, row) in distances.iter_mut().zip(x.outer_iter()) {
            *d = d.min(squared_distance(row, centroids.row(c)));
        }
    }
    centroids
}

impl KMeans {
    pub fn fit(x: ArrayView2<f64>, k: usize, params: &KMeansParams) -> Result<Self> {
        if k == 0 {
            return Err(Error::invalid("k", "must be positive"));
        }
        if x.nrows() < k {
            return Err(Error::invalid(
                "k",
                format!("{} clusters requested from {} samples", k, x.nrows()),
            ));
        }
        let mut rng = Pcg64::seed_from_u64(params.seed);
        let mut centroids = kmeans_plus_plus(x, k, &mut rng);
        let mut inertia = f64::INFINITY;
        for iteration in 0..params.max_iterations {
            let assignments: Vec<(usize, f64)> = (0..x.nrows())
                .into_par_iter()
                .map(|i| nearest(centroids.view(), x.row(i)))
                .collect();
            inertia = assignments.iter().map(|&(_, d)| d).sum();

            let mut sums = Array2::<f64>::zeros(centroids.dim());
            let mut counts = vec![0usize; k];
            for (row, &(cluster, _)) in x.outer_iter().zip(&assignments) {
                let mut sum = sums.row_mut(cluster);
                sum += &row;
                counts[cluster] += 1;
            }
            let mut shift = 0f64;
            for (cluster, count) in counts.into_iter().enumerate() {
                if count == 0 {
                    // Keep the old centroid of an empty cluster.
                    continue;
                }
                let updated = sums.row(cluster).mapv(|v| v / count as f64);
                shift = shift.max(squared_distance(updated.view(), centroids.row(cluster)));
                centroids.row_mut(cluster).assign(&updated);
            }
            debug!(
                "k-means iteration {} inertia {} max shift {}",
                iteration, inertia, shift
            );
            if shift <= params.tolerance {
                break;
            }
        }
        Ok(Self { centroids, inertia })
    }

    pub fn k(&self) -> usize {
        self.centroids.nrows()
    }

    /// Index of the closest centroid of every row.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<usize>> {
        if x.ncols() != self.centroids.ncols() {
            return Err(Error::shape(
                format!("{} features", self.centroids.ncols()),
                format!("{} features", x.ncols()),
            ));
        }
        Ok(x.outer_iter()
            .map(|row| nearest(self.centroids.view(), row).0)
            .collect())
    }
}
