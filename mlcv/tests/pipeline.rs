use image::{GrayImage, Luma};
use log::*;
use mlcv::bovw::Normalization;
use mlcv::experiments::bovw_svm::{self, BovwSvmOptions};
use mlcv::experiments::fisher_sweep::{self, BestParams, SweepResults, BEST_PARAMS, SWEEP_RESULTS};
use mlcv::experiments::sift_svm::{self, SiftSvmOptions};
use mlcv::features::Method;
use mlcv::svm::Kernel;
use mlcv::{FeatureSettings, Settings};
use std::fs;
use std::path::{Path, PathBuf};

/// Stripes along one axis, shifted by `phase` pixels.
fn stripes(horizontal: bool, phase: u32) -> GrayImage {
    GrayImage::from_fn(64, 64, |x, y| {
        let t = if horizontal { y } else { x } + phase;
        if (t / 4) % 2 == 0 {
            Luma([220])
        } else {
            Luma([30])
        }
    })
}

/// Bright squares of side `2 * half + 1` on a dark background, one every 40 pixels.
fn squares(half: u32, offset: u32) -> GrayImage {
    GrayImage::from_fn(128, 128, |x, y| {
        let near = |t: u32| (t + 40 - offset % 40) % 40 <= 2 * half;
        if near(x) && near(y) && x > 8 && y > 8 && x < 120 && y < 120 {
            Luma([230])
        } else {
            Luma([20])
        }
    })
}

fn write_images(dir: &Path, split: &str, images: Vec<(&str, GrayImage)>) {
    let mut filenames: Vec<PathBuf> = vec![];
    let mut labels: Vec<String> = vec![];
    for (i, (class, image)) in images.into_iter().enumerate() {
        let path = dir.join(format!("{split}_{class}_{i}.png"));
        image.save(&path).unwrap();
        filenames.push(path);
        labels.push(class.to_owned());
    }
    fs::write(
        dir.join(format!("{split}_images_filenames.json")),
        serde_json::to_string(&filenames).unwrap(),
    )
    .unwrap();
    fs::write(
        dir.join(format!("{split}_labels.json")),
        serde_json::to_string(&labels).unwrap(),
    )
    .unwrap();
}

fn write_split(dir: &Path, split: &str, per_class: u32) {
    let images = [("horizontal", true), ("vertical", false)]
        .into_iter()
        .flat_map(|(class, horizontal)| (0..per_class).map(move |i| (class, stripes(horizontal, i))))
        .collect();
    write_images(dir, split, images);
}

fn settings(root: &Path) -> Settings {
    let dataset_dir = root.join("dataset");
    fs::create_dir_all(&dataset_dir).unwrap();
    write_split(&dataset_dir, "train", 6);
    write_split(&dataset_dir, "test", 3);
    Settings {
        dataset_dir,
        models_dir: root.join("models"),
        cache_dir: root.join("ignore"),
        n_jobs: 2,
        features: FeatureSettings {
            dense_sampling_density: 16,
            ..Default::default()
        },
        dense_sampling_densities: vec![16],
        codebook_sizes: vec![2, 4],
        pca_reductions: vec![8],
        search_iterations: 3,
        search_folds: 2,
        c_log_num: 1000,
        ..Default::default()
    }
}

#[test]
fn bovw_svm_separates_stripe_orientations() {
    let _ = pretty_env_logger::try_init_timed();
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let options = BovwSvmOptions {
        method: Method::Dense,
        codebook_size: 4,
        normalization: Normalization::L1,
        kernel: Kernel::Intersection,
        plot: Some(dir.path().join("cm.png")),
        ..Default::default()
    };

    info!("first run trains every stage");
    let evaluation = bovw_svm::run(&settings, &options).unwrap();
    assert_eq!(evaluation.accuracy, 100.0);
    assert_eq!(evaluation.confusion.total(), 6);
    assert_eq!(evaluation.confusion.counts[(0, 0)], 3);
    assert!(settings.models().contains("bovw_svm"));
    assert!(settings.models().contains("bovw_svm_cm"));
    assert!(settings.models().contains("codebook_4_dense_16_size_16"));
    assert!(settings.cache().contains("train_dense_16_size_16_descriptors"));
    assert!(dir.path().join("cm.png").is_file());

    info!("second run reuses the cached artifacts");
    let again = bovw_svm::run(&settings, &options).unwrap();
    assert_eq!(again, evaluation);
}

#[test]
fn fisher_sweep_train_then_plot() {
    let _ = pretty_env_logger::try_init_timed();
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());

    let best = fisher_sweep::train(&settings).unwrap();
    assert_eq!(best.pca, 8);
    assert_eq!(best.dense_grid, 16);
    assert!(settings.codebook_sizes.contains(&best.k));
    assert!(best.accuracy > 0.5);

    let cache = settings.cache();
    let saved: BestParams = cache.load(BEST_PARAMS).unwrap();
    assert_eq!(saved, best);
    let results: SweepResults = cache.load(SWEEP_RESULTS).unwrap();
    assert_eq!(results.len(), 2);
    for ((k, pca, ds), entry) in &results {
        assert_eq!((*pca, *ds), (8, 16));
        assert_eq!(entry.cv_results.param_c.len(), 3);
        assert!(entry.timings.total() >= entry.timings.crossvalidation);
        assert!(settings
            .models()
            .contains(&format!("gmm_{k}_dense_16_pca_8")));
    }

    let figure = dir.path().join("sweep.png");
    let panels = fisher_sweep::plot(&settings, &figure).unwrap();
    assert_eq!(panels.len(), 2);
    assert!(figure.is_file());
}

#[test]
fn sift_svm_skips_images_without_keypoints() {
    let _ = pretty_env_logger::try_init_timed();
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let dataset_dir = &settings.dataset_dir;
    let train = (0..3)
        .flat_map(|i| [("small", squares(3, 5 * i)), ("large", squares(12, 5 * i))])
        .collect();
    write_images(dataset_dir, "train", train);
    let flat = GrayImage::from_pixel(128, 128, Luma([128]));
    let test = vec![
        ("small", squares(3, 17)),
        ("large", squares(12, 17)),
        ("small", flat),
    ];
    write_images(dataset_dir, "test", test);

    let options = SiftSvmOptions {
        images_per_class: Some(2),
        model_name: "sift_svm".to_owned(),
        ..Default::default()
    };
    let evaluation = sift_svm::run(&settings, &options).unwrap();
    // the flat image has no keypoints, it counts as wrong but stays out of the matrix
    assert_eq!(evaluation.confusion.total(), 2);
    let correct = evaluation.confusion.counts.diag().sum();
    assert_eq!(evaluation.accuracy, correct as f64 * 100.0 / 3.0);
    assert!(evaluation.accuracy < 100.0);
    assert!(settings.models().contains("sift_svm"));
    assert!(settings.models().contains("sift_svm_cm"));
}
