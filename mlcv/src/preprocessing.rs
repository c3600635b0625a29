use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Removes the mean and scales every feature to unit variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Array1<f64>,
    pub scale: Array1<f64>,
}

impl StandardScaler {
    /// Computes the per-feature mean and population standard deviation.
    ///
    /// Constant features get a scale of 1 so they are only centered.
    pub fn fit(x: ArrayView2<f64>) -> Result<Self> {
        if x.nrows() == 0 {
            return Err(Error::EmptyInput("cannot fit a scaler without samples"));
        }
        let mean = x
            .mean_axis(Axis(0))
            .ok_or(Error::EmptyInput("cannot fit a scaler without samples"))?;
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > f64::EPSILON { s } else { 1.0 });
        Ok(Self { mean, scale })
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.mean.len() {
            return Err(Error::shape(
                format!("{} features", self.mean.len()),
                format!("{} features", x.ncols()),
            ));
        }
        Ok((&x - &self.mean) / &self.scale)
    }

    pub fn fit_transform(x: ArrayView2<f64>) -> Result<(Self, Array2<f64>)> {
        let scaler = Self::fit(x)?;
        let transformed = scaler.transform(x)?;
        Ok((scaler, transformed))
    }
}
