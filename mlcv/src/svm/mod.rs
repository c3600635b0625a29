//! Support vector classifiers.
//!
//! [`Svc`] solves the C-SVC dual with SMO and combines binary machines one-vs-one.
//! [`LinearSvc`] trains one-vs-rest linear machines by dual coordinate descent,
//! which scales to many more samples when a linear kernel is enough.

mod linear;
mod solver;

pub use linear::{LinearSvc, LinearSvcParams};

use crate::kernels::intersection;
use crate::{Error, Label, Result};
use log::*;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use solver::KernelRows;
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

/// Kernel coefficient of the polynomial, radial basis and sigmoid kernels.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum Gamma {
    /// `1 / n_features`.
    Auto,
    Value(f64),
}

impl Gamma {
    fn value(self, n_features: usize) -> f64 {
        match self {
            Gamma::Auto => 1.0 / n_features.max(1) as f64,
            Gamma::Value(gamma) => gamma,
        }
    }
}

impl Default for Gamma {
    fn default() -> Self {
        Gamma::Auto
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum Kernel {
    Linear,
    Polynomial { degree: u32, gamma: Gamma, coef0: f64 },
    Rbf { gamma: Gamma },
    Sigmoid { gamma: Gamma, coef0: f64 },
    /// Histogram intersection evaluated on the fly.
    Intersection,
    /// Training input is the Gram matrix itself, prediction input is `K(test, train)`.
    Precomputed,
}

impl Kernel {
    pub fn is_precomputed(&self) -> bool {
        matches!(self, Kernel::Precomputed)
    }

    /// Evaluates the kernel on a pair of samples.
    ///
    /// Precomputed kernels are looked up in the Gram matrix, callers must never evaluate them.
    pub(crate) fn compute(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        let n_features = a.len();
        match *self {
            Kernel::Linear => a.dot(&b),
            Kernel::Polynomial {
                degree,
                gamma,
                coef0,
            } => (gamma.value(n_features) * a.dot(&b) + coef0).powi(degree as i32),
            Kernel::Rbf { gamma } => {
                (-gamma.value(n_features) * crate::cluster::squared_distance(a, b)).exp()
            }
            Kernel::Sigmoid { gamma, coef0 } => (gamma.value(n_features) * a.dot(&b) + coef0).tanh(),
            Kernel::Intersection => intersection(a, b),
            Kernel::Precomputed => unreachable!("precomputed kernels have no closed form"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvcParams {
    /// Penalty of the hinge loss.
    pub c: f64,
    pub kernel: Kernel,
    /// Stopping tolerance on the maximal KKT violation.
    pub tolerance: f64,
    /// Memory in megabytes given to the kernel row cache of each binary problem.
    pub cache_size: usize,
    /// Unlimited when `None`.
    pub max_iterations: Option<usize>,
}

impl Default for SvcParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            kernel: Kernel::Rbf { gamma: Gamma::Auto },
            tolerance: 1e-3,
            cache_size: 200,
            max_iterations: None,
        }
    }
}

/// One binary machine of the one-vs-one ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BinaryMachine {
    /// Class voted for by a positive decision value.
    positive: usize,
    negative: usize,
    /// Positions into [`Svc::support`].
    support: Vec<usize>,
    /// `alpha_i * y_i` of every support vector.
    coef: Vec<f64>,
    rho: f64,
}

/// C-support vector classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Svc {
    kernel: Kernel,
    classes: Vec<Label>,
    /// Training indices of the support vectors of all machines, ascending.
    support: Vec<usize>,
    /// Rows of the support vectors. Empty for precomputed kernels.
    support_vectors: Array2<f64>,
    /// Number of columns the training input had.
    n_features: usize,
    machines: Vec<BinaryMachine>,
}

/// Sorted distinct labels and the class index of every sample.
pub(crate) fn encode_labels(y: &[Label]) -> (Vec<Label>, Vec<usize>) {
    let classes: Vec<Label> = y
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let index: HashMap<&Label, usize> = classes.iter().enumerate().map(|(i, l)| (l, i)).collect();
    let encoded = y.iter().map(|l| index[l]).collect();
    (classes, encoded)
}

impl Svc {
    /// Trains one binary machine per pair of classes.
    ///
    /// The machines are trained in parallel on the current rayon pool.
    pub fn fit(x: ArrayView2<f64>, y: &[Label], params: &SvcParams) -> Result<Self> {
        if x.nrows() != y.len() {
            return Err(Error::shape(
                format!("{} labels", x.nrows()),
                format!("{} labels", y.len()),
            ));
        }
        if params.kernel.is_precomputed() && x.nrows() != x.ncols() {
            return Err(Error::shape(
                "a square gram matrix",
                format!("{}x{}", x.nrows(), x.ncols()),
            ));
        }
        if params.c <= 0.0 {
            return Err(Error::invalid("c", format!("{} is not positive", params.c)));
        }
        let (classes, encoded) = encode_labels(y);
        if classes.len() < 2 {
            return Err(Error::SingleClass(classes.len()));
        }

        let start = Instant::now();
        let max_iterations = params
            .max_iterations
            .unwrap_or_else(|| 10_000_000.max(100 * x.nrows()));
        let pairs: Vec<(usize, usize)> = (0..classes.len())
            .flat_map(|i| (i + 1..classes.len()).map(move |j| (i, j)))
            .collect();

        let solutions: Vec<(usize, usize, Vec<usize>, solver::Solution)> = pairs
            .into_par_iter()
            .map(|(positive, negative)| {
                let indices: Vec<usize> = (0..encoded.len())
                    .filter(|&i| encoded[i] == positive || encoded[i] == negative)
                    .collect();
                let targets: Vec<f64> = indices
                    .iter()
                    .map(|&i| if encoded[i] == positive { 1.0 } else { -1.0 })
                    .collect();
                let capacity = (params.cache_size << 20) / (8 * indices.len().max(1));
                let mut rows = if params.kernel.is_precomputed() {
                    KernelRows::precomputed(x, indices, capacity)
                } else {
                    KernelRows::features(x, params.kernel, indices, capacity)
                };
                let solution =
                    solver::solve(&mut rows, &targets, params.c, params.tolerance, max_iterations);
                let indices = rows.into_indices();
                if !solution.converged {
                    warn!(
                        "svm {} vs {} stopped after {} iterations without converging",
                        classes[positive], classes[negative], solution.iterations
                    );
                }
                debug!(
                    "svm {} vs {} solved in {} iterations, rho {}",
                    classes[positive], classes[negative], solution.iterations, solution.rho
                );
                (positive, negative, indices, solution)
            })
            .collect();

        let support: Vec<usize> = solutions
            .iter()
            .flat_map(|(_, _, indices, solution)| {
                indices
                    .iter()
                    .zip(&solution.alpha)
                    .filter(|(_, &a)| a > 0.0)
                    .map(|(&i, _)| i)
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let position: HashMap<usize, usize> =
            support.iter().enumerate().map(|(p, &i)| (i, p)).collect();

        let machines = solutions
            .into_iter()
            .map(|(positive, negative, indices, solution)| {
                let (support, coef) = indices
                    .iter()
                    .enumerate()
                    .filter(|&(k, _)| solution.alpha[k] > 0.0)
                    .map(|(k, i)| {
                        let y = if encoded[*i] == positive { 1.0 } else { -1.0 };
                        (position[i], solution.alpha[k] * y)
                    })
                    .unzip();
                BinaryMachine {
                    positive,
                    negative,
                    support,
                    coef,
                    rho: solution.rho,
                }
            })
            .collect();

        let support_vectors = if params.kernel.is_precomputed() {
            Array2::zeros((0, 0))
        } else {
            x.select(Axis(0), &support)
        };
        info!(
            "trained {} machines over {} classes with {} support vectors in {:.2} s",
            classes.len() * (classes.len() - 1) / 2,
            classes.len(),
            support.len(),
            start.elapsed().as_secs_f64()
        );

        Ok(Self {
            kernel: params.kernel,
            classes,
            support,
            support_vectors,
            n_features: x.ncols(),
            machines,
        })
    }

    pub fn classes(&self) -> &[Label] {
        &self.classes
    }

    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    /// Training indices of the support vectors.
    pub fn support(&self) -> &[usize] {
        &self.support
    }

    /// Number of support vectors of every class.
    pub fn n_support(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes.len()];
        let mut seen = vec![None; self.support.len()];
        for machine in &self.machines {
            for (&s, &coef) in machine.support.iter().zip(&machine.coef) {
                seen[s] = Some(if coef > 0.0 {
                    machine.positive
                } else {
                    machine.negative
                });
            }
        }
        for class in seen.into_iter().flatten() {
            counts[class] += 1;
        }
        counts
    }

    /// Kernel values between every sample and every support vector.
    fn support_kernel(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.n_features {
            return Err(Error::shape(
                format!("{} columns", self.n_features),
                format!("{} columns", x.ncols()),
            ));
        }
        if self.kernel.is_precomputed() {
            return Ok(x.select(Axis(1), &self.support));
        }
        let rows: Vec<f64> = (0..x.nrows())
            .into_par_iter()
            .flat_map_iter(|i| {
                self.support_vectors
                    .outer_iter()
                    .map(move |sv| self.kernel.compute(x.row(i), sv))
            })
            .collect();
        Array2::from_shape_vec((x.nrows(), self.support.len()), rows)
            .map_err(|e| Error::shape("a support kernel matrix", e))
    }

    /// Decision value of every binary machine, one column per class pair `(i, j)` with `i < j`.
    ///
    /// Positive values vote for the first class of the pair.
    pub fn decision_function(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        let k = self.support_kernel(x)?;
        let mut decisions = Array2::zeros((x.nrows(), self.machines.len()));
        for (mut column, machine) in decisions.columns_mut().into_iter().zip(&self.machines) {
            for (value, kernel_row) in column.iter_mut().zip(k.outer_iter()) {
                let sum: f64 = machine
                    .support
                    .iter()
                    .zip(&machine.coef)
                    .map(|(&s, &c)| c * kernel_row[s])
                    .sum();
                *value = sum - machine.rho;
            }
        }
        Ok(decisions)
    }

    /// Majority vote of the one-vs-one machines. Ties go to the class that sorts first.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Vec<Label>> {
        let decisions = self.decision_function(x)?;
        Ok(decisions
            .outer_iter()
            .map(|row| {
                let mut votes = vec![0usize; self.classes.len()];
                for (machine, &value) in self.machines.iter().zip(row.iter()) {
                    if value > 0.0 {
                        votes[machine.positive] += 1;
                    } else {
                        votes[machine.negative] += 1;
                    }
                }
                self.classes[argmax_first(&votes)].clone()
            })
            .collect())
    }
}

/// Index of the first maximum.
pub(crate) fn argmax_first<T: PartialOrd + Copy>(values: &[T]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// A trained classifier of either flavour, as persisted by [`crate::ArtifactStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Model {
    Svc(Svc),
    LinearSvc(LinearSvc),
}

impl Model {
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Vec<Label>> {
        match self {
            Model::Svc(svc) => svc.predict(x),
            Model::LinearSvc(svc) => svc.predict(x),
        }
    }

    pub fn classes(&self) -> &[Label] {
        match self {
            Model::Svc(svc) => svc.classes(),
            Model::LinearSvc(svc) => svc.classes(),
        }
    }

    /// Decision values, one column per binary machine.
    pub fn decision_function(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        match self {
            Model::Svc(svc) => svc.decision_function(x),
            Model::LinearSvc(svc) => svc.decision_function(x),
        }
    }
}

impl From<Svc> for Model {
    fn from(svc: Svc) -> Self {
        Model::Svc(svc)
    }
}

impl From<LinearSvc> for Model {
    fn from(svc: LinearSvc) -> Self {
        Model::LinearSvc(svc)
    }
}

/// Fraction of matching labels.
pub(crate) fn score(expected: &[Label], predicted: &[Label]) -> f64 {
    if expected.is_empty() {
        return 0.0;
    }
    let correct = expected
        .iter()
        .zip(predicted)
        .filter(|(a, b)| a == b)
        .count();
    correct as f64 / expected.len() as f64
}
