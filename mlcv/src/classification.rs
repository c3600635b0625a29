//! Training and prediction helpers chaining PCA, standardization and an SVM.

use crate::preprocessing::StandardScaler;
use crate::reduction::Pca;
use crate::svm::{Gamma, Kernel, LinearSvc, LinearSvcParams, Model, Svc, SvcParams};
use crate::{ArtifactStore, Label, Result};
use log::*;
use ndarray::{ArrayView2, CowArray, Ix2};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOptions {
    pub c: f64,
    pub kernel: Kernel,
    pub standardize: bool,
    /// Number of principal components kept before standardization. `None` or `Some(0)` skips PCA.
    pub dim_reduction: Option<usize>,
    /// Name under which the fitted scaler is saved.
    pub save_scaler: Option<String>,
    /// Name under which the fitted PCA is saved.
    pub save_pca: Option<String>,
    /// The model is loaded from this artifact when present, otherwise trained and saved under it.
    pub model_name: Option<String>,
    /// Train a [`LinearSvc`] instead of a linear kernel [`Svc`].
    pub liblinear: bool,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            c: 1.0,
            kernel: Kernel::Linear,
            standardize: true,
            dim_reduction: None,
            save_scaler: None,
            save_pca: None,
            model_name: None,
            liblinear: false,
        }
    }
}

/// A classifier together with the preprocessing fitted on its training data.
#[derive(Debug, Clone)]
pub struct TrainedSvm {
    pub model: Model,
    pub scaler: Option<StandardScaler>,
    pub pca: Option<Pca>,
}

impl TrainedSvm {
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Vec<Label>> {
        predict_svm(x, &self.model, self.scaler.as_ref(), self.pca.as_ref())
    }

    pub fn classes(&self) -> &[Label] {
        self.model.classes()
    }
}

fn fit_model(x: ArrayView2<f64>, y: &[Label], options: &TrainOptions) -> Result<Model> {
    let start = Instant::now();
    info!(
        "training svm with {:?} kernel, C = {} on {} samples of {} features",
        options.kernel,
        options.c,
        x.nrows(),
        x.ncols()
    );
    let model = if options.liblinear && options.kernel == Kernel::Linear {
        LinearSvc::fit(
            x,
            y,
            &LinearSvcParams {
                c: options.c,
                ..Default::default()
            },
        )?
        .into()
    } else {
        Svc::fit(
            x,
            y,
            &SvcParams {
                c: options.c,
                kernel: options.kernel,
                ..Default::default()
            },
        )?
        .into()
    };
    info!("svm trained in {:.2} s", start.elapsed().as_secs_f64());
    Ok(model)
}

/// Fits the optional PCA and scaler, then trains the classifier on the transformed samples.
///
/// When `model_name` names an existing artifact the classifier is loaded instead, while PCA
/// and scaler are still fitted on `x`.
pub fn train_svm(
    store: &ArtifactStore,
    x: ArrayView2<f64>,
    y: &[Label],
    options: &TrainOptions,
) -> Result<TrainedSvm> {
    let mut features: CowArray<f64, Ix2> = x.into();

    let pca = match options.dim_reduction {
        Some(n) if n > 0 => {
            let pca = Pca::fit(features.view(), n)?;
            features = pca.transform(features.view())?.into();
            Some(pca)
        }
        _ => None,
    };

    let scaler = if options.standardize {
        let scaler = StandardScaler::fit(features.view())?;
        features = scaler.transform(features.view())?.into();
        Some(scaler)
    } else {
        None
    };

    let model = match &options.model_name {
        Some(name) => store.load_or_compute(name, || fit_model(features.view(), y, options))?,
        None => fit_model(features.view(), y, options)?,
    };

    if let (Some(name), Some(scaler)) = (&options.save_scaler, &scaler) {
        store.save(name, scaler)?;
    }
    if let (Some(name), Some(pca)) = (&options.save_pca, &pca) {
        store.save(name, pca)?;
    }

    Ok(TrainedSvm { model, scaler, pca })
}

pub fn train_linear_svm(
    store: &ArtifactStore,
    x: ArrayView2<f64>,
    y: &[Label],
    c: f64,
    options: TrainOptions,
) -> Result<TrainedSvm> {
    train_svm(
        store,
        x,
        y,
        &TrainOptions {
            c,
            kernel: Kernel::Linear,
            ..options
        },
    )
}

#[allow(clippy::too_many_arguments)]
pub fn train_poly_svm(
    store: &ArtifactStore,
    x: ArrayView2<f64>,
    y: &[Label],
    c: f64,
    degree: u32,
    gamma: Gamma,
    coef0: f64,
    options: TrainOptions,
) -> Result<TrainedSvm> {
    train_svm(
        store,
        x,
        y,
        &TrainOptions {
            c,
            kernel: Kernel::Polynomial {
                degree,
                gamma,
                coef0,
            },
            ..options
        },
    )
}

pub fn train_rbf_svm(
    store: &ArtifactStore,
    x: ArrayView2<f64>,
    y: &[Label],
    c: f64,
    gamma: Gamma,
    options: TrainOptions,
) -> Result<TrainedSvm> {
    train_svm(
        store,
        x,
        y,
        &TrainOptions {
            c,
            kernel: Kernel::Rbf { gamma },
            ..options
        },
    )
}

pub fn train_sigmoid_svm(
    store: &ArtifactStore,
    x: ArrayView2<f64>,
    y: &[Label],
    c: f64,
    gamma: Gamma,
    coef0: f64,
    options: TrainOptions,
) -> Result<TrainedSvm> {
    train_svm(
        store,
        x,
        y,
        &TrainOptions {
            c,
            kernel: Kernel::Sigmoid { gamma, coef0 },
            ..options
        },
    )
}

/// Histogram intersection SVM, meant for visual word histograms.
pub fn train_intersection_svm(
    store: &ArtifactStore,
    x: ArrayView2<f64>,
    y: &[Label],
    c: f64,
    options: TrainOptions,
) -> Result<TrainedSvm> {
    train_svm(
        store,
        x,
        y,
        &TrainOptions {
            c,
            kernel: Kernel::Intersection,
            ..options
        },
    )
}

/// Applies the PCA, then the scaler, then predicts a label per row.
pub fn predict_svm(
    x: ArrayView2<f64>,
    model: &Model,
    scaler: Option<&StandardScaler>,
    pca: Option<&Pca>,
) -> Result<Vec<Label>> {
    let mut features: CowArray<f64, Ix2> = x.into();
    if let Some(pca) = pca {
        features = pca.transform(features.view())?.into();
    }
    if let Some(scaler) = scaler {
        features = scaler.transform(features.view())?.into();
    }
    model.predict(features.view())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn toy() -> (Array2<f64>, Vec<Label>) {
        let x = array![
            [10.0, 0.1, 100.0],
            [11.0, 0.2, 102.0],
            [12.0, 0.1, 101.0],
            [30.0, 0.9, 140.0],
            [31.0, 1.0, 141.0],
            [29.0, 0.8, 139.0],
        ];
        let y = ["low", "low", "low", "high", "high", "high"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        (x, y)
    }

    #[test]
    fn pipeline_predicts_training_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let (x, y) = toy();
        let trained = train_rbf_svm(
            &store,
            x.view(),
            &y,
            10.0,
            Gamma::Auto,
            TrainOptions {
                dim_reduction: Some(2),
                save_scaler: Some("scaler".to_owned()),
                save_pca: Some("pca".to_owned()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(trained.pca.as_ref().unwrap().n_components(), 2);
        assert_eq!(trained.predict(x.view()).unwrap(), y);
        assert!(store.contains("scaler"));
        assert!(store.contains("pca"));
    }

    #[test]
    fn named_model_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let (x, y) = toy();
        let options = TrainOptions {
            model_name: Some("linear".to_owned()),
            liblinear: true,
            ..Default::default()
        };
        let first = train_linear_svm(&store, x.view(), &y, 1.0, options.clone()).unwrap();
        assert!(matches!(first.model, Model::LinearSvc(_)));
        assert!(store.contains("linear"));

        // Different labels would train a different model, the cached one is returned instead.
        let flipped: Vec<Label> = y.iter().rev().cloned().collect();
        let second = train_linear_svm(&store, x.view(), &flipped, 1.0, options).unwrap();
        assert_eq!(second.model, first.model);
    }

    #[test]
    fn predict_applies_pca_then_scaler() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let (x, y) = toy();
        let trained = train_linear_svm(
            &store,
            x.view(),
            &y,
            1.0,
            TrainOptions {
                dim_reduction: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        let (pca, scaler) = (trained.pca.as_ref(), trained.scaler.as_ref());
        assert!(pca.is_some() && scaler.is_some());
        assert_eq!(predict_svm(x.view(), &trained.model, scaler, pca).unwrap(), y);
        // without the fitted PCA the model sees the wrong number of columns
        assert!(predict_svm(x.view(), &trained.model, scaler, None).is_err());
    }

    #[test]
    fn poly_svm_separates_toy_classes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let (x, y) = toy();
        let trained = train_poly_svm(
            &store,
            x.view(),
            &y,
            10.0,
            2,
            Gamma::Auto,
            1.0,
            TrainOptions {
                model_name: Some("poly".to_owned()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(matches!(
            trained.model,
            Model::Svc(ref svc) if matches!(svc.kernel(), Kernel::Polynomial { degree: 2, .. })
        ));
        assert_eq!(trained.predict(x.view()).unwrap(), y);
        assert!(store.contains("poly"));
    }

    #[test]
    fn sigmoid_svm_separates_toy_classes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let (x, y) = toy();
        let trained = train_sigmoid_svm(
            &store,
            x.view(),
            &y,
            1.0,
            Gamma::Value(0.5),
            0.0,
            TrainOptions::default(),
        )
        .unwrap();
        assert_eq!(trained.predict(x.view()).unwrap(), y);
    }

    #[test]
    fn intersection_on_raw_histograms() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let x = array![
            [0.8, 0.1, 0.1],
            [0.7, 0.2, 0.1],
            [0.75, 0.1, 0.15],
            [0.1, 0.1, 0.8],
            [0.1, 0.2, 0.7],
            [0.15, 0.1, 0.75],
        ];
        let (_, y) = toy();
        let trained = train_intersection_svm(
            &store,
            x.view(),
            &y,
            10.0,
            TrainOptions {
                standardize: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(trained.scaler.is_none());
        assert!(trained.pca.is_none());
        assert_eq!(
            predict_svm(x.view(), &trained.model, None, None).unwrap(),
            y
        );
    }
}
