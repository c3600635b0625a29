//! Image level encodings built from local descriptors.
//!
//! Both encodings produce one row per image of a [`DescriptorSet`], in image order,
//! so their rows line up with [`DescriptorSet::image_labels`].

use crate::cluster::{KMeans, KMeansParams};
use crate::gmm::{GaussianMixture, GmmParams};
use crate::{ArtifactStore, DescriptorSet, Error, Label, Result};
use log::*;
use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Post-processing applied to every encoded image vector.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Normalization {
    None,
    L1,
    L2,
    /// Signed square root followed by L2 normalization.
    Power,
}

impl Normalization {
    pub fn apply(self, mut v: ArrayViewMut1<f64>) {
        match self {
            Normalization::None => {}
            Normalization::L1 => {
                let norm: f64 = v.iter().map(|x| x.abs()).sum();
                if norm > 0.0 {
                    v /= norm;
                }
            }
            Normalization::L2 => l2_normalize(v),
            Normalization::Power => {
                v.mapv_inplace(|x| x.signum() * x.abs().sqrt());
                l2_normalize(v);
            }
        }
    }
}

fn l2_normalize(mut v: ArrayViewMut1<f64>) {
    let norm = v.dot(&v).sqrt();
    if norm > 0.0 {
        v /= norm;
    }
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Normalization::None => "none",
            Normalization::L1 => "l1",
            Normalization::L2 => "l2",
            Normalization::Power => "power",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Normalization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Normalization::None),
            "l1" => Ok(Normalization::L1),
            "l2" => Ok(Normalization::L2),
            "power" => Ok(Normalization::Power),
            other => Err(Error::invalid(
                "normalization",
                format!("unknown normalization {other}"),
            )),
        }
    }
}

/// Clusters descriptors into a `k` word codebook, or loads the codebook saved as `name`.
pub fn create_codebook(
    store: &ArtifactStore,
    name: &str,
    descriptors: ArrayView2<f64>,
    k: usize,
    seed: u64,
) -> Result<KMeans> {
    store.load_or_compute(name, || {
        info!(
            "clustering {} descriptors into {} visual words",
            descriptors.nrows(),
            k
        );
        KMeans::fit(
            descriptors,
            k,
            &KMeansParams {
                seed,
                ..Default::default()
            },
        )
    })
}

/// Fits a `k` component mixture on the descriptors, or loads the one saved as `name`.
pub fn create_gmm(
    store: &ArtifactStore,
    name: &str,
    descriptors: ArrayView2<f64>,
    k: usize,
    seed: u64,
) -> Result<GaussianMixture> {
    store.load_or_compute(name, || {
        info!(
            "fitting a {} component gmm on {} descriptors",
            k,
            descriptors.nrows()
        );
        GaussianMixture::fit(
            descriptors,
            k,
            &GmmParams {
                seed,
                ..Default::default()
            },
        )
    })
}

/// Histogram of visual word occurrences of every image.
pub fn visual_words(
    set: &DescriptorSet,
    codebook: &KMeans,
    normalization: Normalization,
) -> Result<(Array2<f64>, Vec<Label>)> {
    let words = codebook.predict(set.descriptors.view())?;
    let mut histograms = Array2::zeros((set.num_images(), codebook.k()));
    for (image, &word) in set.image_indices().into_iter().zip(words.iter()) {
        histograms[(image, word)] += 1.0;
    }
    for row in histograms.outer_iter_mut() {
        normalization.apply(row);
    }
    Ok((histograms, set.image_labels.clone()))
}

/// Fisher vector of a single image: gradients of the mixture log-likelihood
/// with respect to the means and the standard deviations.
///
/// The result has `2 * k * d` entries, mean gradients first. An image without
/// descriptors encodes to zeros.
pub fn fisher_vector(descriptors: ArrayView2<f64>, gmm: &GaussianMixture) -> Result<Array1<f64>> {
    let (k, d) = (gmm.n_components(), gmm.dim());
    let mut fv = Array1::zeros(2 * k * d);
    let t = descriptors.nrows();
    if t == 0 {
        return Ok(fv);
    }
    let posteriors = gmm.predict_proba(descriptors)?;
    let sigmas = gmm.variances.mapv(f64::sqrt);
    for c in 0..k {
        let weight = gmm.weights[c];
        if weight <= 0.0 {
            continue;
        }
        let mean = gmm.means.row(c);
        let sigma = sigmas.row(c);
        let gamma = posteriors.column(c);
        let mut g_mu = Array1::<f64>::zeros(d);
        let mut g_sigma = Array1::<f64>::zeros(d);
        for (x, &g) in descriptors.outer_iter().zip(gamma.iter()) {
            if g == 0.0 {
                continue;
            }
            let z = (&x - &mean) / &sigma;
            g_sigma.scaled_add(g, &z.mapv(|v| v * v - 1.0));
            g_mu.scaled_add(g, &z);
        }
        g_mu /= t as f64 * weight.sqrt();
        g_sigma /= t as f64 * (2.0 * weight).sqrt();
        fv.slice_mut(ndarray::s![c * d..(c + 1) * d]).assign(&g_mu);
        fv.slice_mut(ndarray::s![(k + c) * d..(k + c + 1) * d])
            .assign(&g_sigma);
    }
    Ok(fv)
}

/// Fisher vectors of every image of the set, one row per image.
pub fn fisher_vectors(
    set: &DescriptorSet,
    gmm: &GaussianMixture,
    normalization: Normalization,
) -> Result<(Array2<f64>, Vec<Label>)> {
    if set.dim() != gmm.dim() {
        return Err(Error::shape(
            format!("{} dimensional descriptors", gmm.dim()),
            format!("{} dimensional descriptors", set.dim()),
        ));
    }
    let rows = (0..set.num_images())
        .into_par_iter()
        .map(|image| {
            let mut fv = fisher_vector(set.image(image), gmm)?;
            normalization.apply(fv.view_mut());
            Ok(fv)
        })
        .collect::<Result<Vec<_>>>()?;
    let mut encoded = Array2::zeros((rows.len(), 2 * gmm.n_components() * gmm.dim()));
    for (mut out, row) in encoded.axis_iter_mut(Axis(0)).zip(rows) {
        out.assign(&row);
    }
    Ok((encoded, set.image_labels.clone()))
}
