use crate::image::{gaussian_blur, Gradients, GrayFloatImage};
use crate::{io, thread_pool, Dataset, Error, FeatureSettings, Label, Result};
use ::image::DynamicImage;
use akaze::{Akaze, KeyPoint};
use log::*;
use ndarray::{s, Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Number of spatial cells along each side of the descriptor patch.
const CELLS: usize = 4;
/// Number of orientation bins of every cell histogram.
const ORIENTATION_BINS: usize = 8;
/// Length of a descriptor.
pub const DESCRIPTOR_SIZE: usize = CELLS * CELLS * ORIENTATION_BINS;
/// Histogram entries are clipped to this value after the first normalization.
const DESCRIPTOR_CLAMP: f32 = 0.2;
/// Blur applied before computing gradients.
const PRESMOOTHING_SIGMA: f32 = 0.8;

/// Keypoints of an image together with one descriptor row per keypoint.
#[derive(Debug, Clone)]
pub struct Features {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Array2<f64>,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// How local features are located in an image.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// Keypoints found by the AKAZE detector.
    Sift,
    /// Upright patches on a regular grid.
    Dense,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Sift => write!(f, "sift"),
            Method::Dense => write!(f, "dense"),
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sift" => Ok(Method::Sift),
            "dense" => Ok(Method::Dense),
            other => Err(Error::invalid("method", format!("unknown method {other}"))),
        }
    }
}

/// The detector links against an older `image` release, so it gets an 8-bit luma copy.
fn detector_image(image: &DynamicImage) -> Result<akaze_image::DynamicImage> {
    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();
    akaze_image::GrayImage::from_raw(width, height, gray.into_raw())
        .map(akaze_image::DynamicImage::ImageLuma8)
        .ok_or_else(|| Error::shape(format!("{width}x{height} luma pixels"), "a shorter buffer"))
}

/// Detects keypoints with AKAZE and describes them with gradient orientation histograms.
///
/// A uniform image has no keypoints and is not handed to the detector.
pub fn sift(image: &DynamicImage, settings: &FeatureSettings) -> Result<Features> {
    let gray = GrayFloatImage::from_dynamic(image);
    let mut values = gray.pixels().map(|p| p[0]);
    let uniform = match values.next() {
        Some(first) => values.all(|v| v == first),
        None => true,
    };
    if uniform {
        debug!("uniform {} x {} image, no keypoints", gray.width(), gray.height());
        return Ok(Features {
            keypoints: vec![],
            descriptors: Array2::zeros((0, DESCRIPTOR_SIZE)),
        });
    }
    let (keypoints, _) = Akaze::new(settings.akaze_threshold).extract(&detector_image(image)?);
    Ok(describe(&gradients(&gray), keypoints))
}

/// Describes upright patches laid out on a grid with a fixed step.
pub fn dense(image: &DynamicImage, settings: &FeatureSettings) -> Features {
    let gray = GrayFloatImage::from_dynamic(image);
    let keypoints = dense_keypoints(
        gray.width(),
        gray.height(),
        settings.dense_sampling_density,
        settings.dense_keypoint_size,
    );
    describe(&gradients(&gray), keypoints)
}

pub fn describe_image(
    image: &DynamicImage,
    method: Method,
    settings: &FeatureSettings,
) -> Result<Features> {
    match method {
        Method::Sift => sift(image, settings),
        Method::Dense => Ok(dense(image, settings)),
    }
}

fn gradients(gray: &GrayFloatImage) -> Gradients {
    Gradients::new(&gaussian_blur(gray, PRESMOOTHING_SIGMA))
}

/// Grid positions starting half a step from the top left corner.
pub fn dense_keypoints(width: usize, height: usize, step: usize, size: f32) -> Vec<KeyPoint> {
    let step = step.max(1);
    let start = step / 2;
    (start..height)
        .step_by(step)
        .flat_map(|y| {
            (start..width).step_by(step).map(move |x| KeyPoint {
                point: (x as f32, y as f32),
                response: 0.0,
                size,
                octave: 0,
                class_id: 0,
                angle: 0.0,
            })
        })
        .collect()
}

fn describe(gradients: &Gradients, keypoints: Vec<KeyPoint>) -> Features {
    let keypoints: Vec<KeyPoint> = keypoints
        .into_iter()
        .filter(|kp| {
            let (x, y) = kp.point;
            x >= 0.0
                && y >= 0.0
                && (x as usize) < gradients.width()
                && (y as usize) < gradients.height()
        })
        .collect();
    let mut descriptors = Array2::zeros((keypoints.len(), DESCRIPTOR_SIZE));
    for (keypoint, mut row) in keypoints.iter().zip(descriptors.outer_iter_mut()) {
        let descriptor = gradient_histogram(gradients, keypoint);
        for (out, value) in row.iter_mut().zip(descriptor) {
            *out = f64::from(value);
        }
    }
    Features {
        keypoints,
        descriptors,
    }
}

/// Computes the 4x4x8 orientation histogram of the patch around `keypoint`.
///
/// The patch is rotated by the keypoint angle and has a side of `keypoint.size` pixels.
/// Every gradient sample is weighted by a Gaussian window and spread over the neighboring
/// cells and orientation bins by linear interpolation.
pub fn gradient_histogram(gradients: &Gradients, keypoint: &KeyPoint) -> [f32; DESCRIPTOR_SIZE] {
    let mut histogram = [0f32; DESCRIPTOR_SIZE];
    let cell_width = (keypoint.size / CELLS as f32).max(1.0);
    let radius = (cell_width * CELLS as f32 * 0.5 * std::f32::consts::SQRT_2).ceil() as isize;
    let (co, si) = (keypoint.angle.cos(), keypoint.angle.sin());
    let cx = keypoint.point.0.round() as isize;
    let cy = keypoint.point.1.round() as isize;
    let half_cells = CELLS as f32 * 0.5;
    // Gaussian window with sigma equal to half the descriptor width, in cell units.
    let window_denominator = 2.0 * half_cells * half_cells;
    let bins_per_radian = ORIENTATION_BINS as f32 / (2.0 * PI);

    for dy in -radius..=radius {
        let y = cy + dy;
        if y < 0 || y >= gradients.height() as isize {
            continue;
        }
        for dx in -radius..=radius {
            let x = cx + dx;
            if x < 0 || x >= gradients.width() as isize {
                continue;
            }
            // Sample position in the rotated frame, in cell units.
            let rx = (co * dx as f32 + si * dy as f32) / cell_width;
            let ry = (-si * dx as f32 + co * dy as f32) / cell_width;
            let col = rx + half_cells - 0.5;
            let row = ry + half_cells - 0.5;
            if row <= -1.0 || row >= CELLS as f32 || col <= -1.0 || col >= CELLS as f32 {
                continue;
            }
            let magnitude = gradients.magnitude[(y as usize, x as usize)];
            if magnitude == 0.0 {
                continue;
            }
            let weight = (-(rx * rx + ry * ry) / window_denominator).exp();
            let orientation = (gradients.orientation[(y as usize, x as usize)] - keypoint.angle)
                .rem_euclid(2.0 * PI);
            let bin = orientation * bins_per_radian;
            accumulate(&mut histogram, row, col, bin, weight * magnitude);
        }
    }

    normalize_descriptor(&mut histogram);
    histogram
}

/// Trilinear interpolation of one sample into the histogram.
fn accumulate(histogram: &mut [f32; DESCRIPTOR_SIZE], row: f32, col: f32, bin: f32, value: f32) {
    let (r0, c0, o0) = (row.floor(), col.floor(), bin.floor());
    let (dr, dc, d_o) = (row - r0, col - c0, bin - o0);
    for (ri, rw) in [(r0 as isize, 1.0 - dr), (r0 as isize + 1, dr)] {
        if ri < 0 || ri >= CELLS as isize {
            continue;
        }
        for (ci, cw) in [(c0 as isize, 1.0 - dc), (c0 as isize + 1, dc)] {
            if ci < 0 || ci >= CELLS as isize {
                continue;
            }
            for (oi, ow) in [(o0 as usize, 1.0 - d_o), (o0 as usize + 1, d_o)] {
                let oi = oi % ORIENTATION_BINS;
                let index = (ri as usize * CELLS + ci as usize) * ORIENTATION_BINS + oi;
                histogram[index] += value * rw * cw * ow;
            }
        }
    }
}

fn normalize_descriptor(descriptor: &mut [f32]) {
    let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for v in descriptor.iter_mut() {
        *v = (*v / norm).min(DESCRIPTOR_CLAMP);
    }
    let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
    for v in descriptor.iter_mut() {
        *v /= norm;
    }
}

/// Descriptors of a set of images, stacked in image order.
///
/// Rows of image `i` are `offsets[i]..offsets[i + 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorSet {
    pub descriptors: Array2<f64>,
    offsets: Vec<usize>,
    pub image_labels: Vec<Label>,
}

impl DescriptorSet {
    /// Stacks per-image descriptor arrays that all share the same width.
    pub fn from_images(images: Vec<(Array2<f64>, Label)>, dim: usize) -> Result<Self> {
        let total = images.iter().map(|(d, _)| d.nrows()).sum();
        let mut descriptors = Array2::zeros((total, dim));
        let mut offsets = Vec::with_capacity(images.len() + 1);
        let mut image_labels = Vec::with_capacity(images.len());
        let mut row = 0;
        offsets.push(0);
        for (image_descriptors, label) in images {
            if image_descriptors.nrows() > 0 && image_descriptors.ncols() != dim {
                return Err(Error::shape(
                    format!("{dim} columns"),
                    format!("{} columns", image_descriptors.ncols()),
                ));
            }
            let end = row + image_descriptors.nrows();
            descriptors
                .slice_mut(s![row..end, ..])
                .assign(&image_descriptors);
            row = end;
            offsets.push(row);
            image_labels.push(label);
        }
        Ok(Self {
            descriptors,
            offsets,
            image_labels,
        })
    }

    /// Total number of descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.nrows() == 0
    }

    pub fn dim(&self) -> usize {
        self.descriptors.ncols()
    }

    pub fn num_images(&self) -> usize {
        self.image_labels.len()
    }

    pub fn image(&self, index: usize) -> ArrayView2<f64> {
        self.descriptors
            .slice(s![self.offsets[index]..self.offsets[index + 1], ..])
    }

    /// The label of the image every descriptor came from.
    pub fn descriptor_labels(&self) -> Vec<Label> {
        self.image_indices()
            .into_iter()
            .map(|i| self.image_labels[i].clone())
            .collect()
    }

    /// The index of the image every descriptor came from.
    pub fn image_indices(&self) -> Vec<usize> {
        self.offsets
            .windows(2)
            .enumerate()
            .flat_map(|(i, w)| std::iter::repeat(i).take(w[1] - w[0]))
            .collect()
    }

    /// Replaces the descriptors by a transformed version with the same number of rows.
    pub fn with_descriptors(&self, descriptors: Array2<f64>) -> Result<Self> {
        if descriptors.nrows() != self.len() {
            return Err(Error::shape(
                format!("{} rows", self.len()),
                format!("{} rows", descriptors.nrows()),
            ));
        }
        Ok(Self {
            descriptors,
            offsets: self.offsets.clone(),
            image_labels: self.image_labels.clone(),
        })
    }
}

/// Keeps the first `per_class` images of each class, in dataset order.
pub fn sample_per_class(dataset: &Dataset, per_class: Option<usize>) -> Dataset {
    let Some(limit) = per_class else {
        return dataset.clone();
    };
    let mut counts: HashMap<&Label, usize> = HashMap::new();
    let (filenames, labels) = dataset
        .iter()
        .filter(|(_, label)| {
            let count = counts.entry(*label).or_insert(0);
            *count += 1;
            *count <= limit
        })
        .map(|(path, label)| (path.clone(), label.clone()))
        .unzip();
    Dataset { filenames, labels }
}

/// Extracts descriptors of every image in parallel.
///
/// Images are processed on a pool of `n_jobs` threads and stacked in dataset order.
pub fn extract(
    dataset: &Dataset,
    method: Method,
    settings: &FeatureSettings,
    images_per_class: Option<usize>,
    n_jobs: usize,
) -> Result<DescriptorSet> {
    let start = Instant::now();
    let selected = sample_per_class(dataset, images_per_class);
    info!(
        "extracting {} features from {} images",
        method,
        selected.len()
    );
    let pool = thread_pool(n_jobs)?;
    let images = pool.install(|| {
        selected
            .filenames
            .par_iter()
            .zip(selected.labels.par_iter())
            .map(|(path, label)| {
                let image = io::load_image(path)?;
                let features = describe_image(&image, method, settings)?;
                trace!("{} descriptors in {}", features.len(), path.display());
                Ok((features.descriptors, label.clone()))
            })
            .collect::<Result<Vec<_>>>()
    })?;
    let set = DescriptorSet::from_images(images, DESCRIPTOR_SIZE)?;
    info!(
        "extracted {} descriptors in {:.2} s",
        set.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::path::PathBuf;

    fn stripes(angle: f32) -> GrayFloatImage {
        let (co, si) = (angle.cos(), angle.sin());
        GrayFloatImage::from_fn(64, 64, |x, y| {
            let t = co * x as f32 + si * y as f32;
            0.5 + 0.5 * (t * 0.7).sin()
        })
    }

    fn centered(size: f32) -> KeyPoint {
        KeyPoint {
            point: (32.0, 32.0),
            response: 0.0,
            size,
            octave: 0,
            class_id: 0,
            angle: 0.0,
        }
    }

    #[test]
    fn descriptor_is_unit_length_and_clamped() {
        let gradients = Gradients::new(&stripes(0.3));
        let descriptor = gradient_histogram(&gradients, &centered(16.0));
        let norm: f32 = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!(descriptor.iter().all(|&v| v >= 0.0 && v <= 1.0));
    }

    #[test]
    fn flat_image_gives_zero_descriptor() {
        let gradients = Gradients::new(&GrayFloatImage::from_fn(32, 32, |_, _| 0.5));
        let descriptor = gradient_histogram(&gradients, &centered(8.0));
        assert!(descriptor.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn rotating_keypoint_follows_rotated_image() {
        let angle = PI / 2.0;
        let upright = gradient_histogram(&Gradients::new(&stripes(0.0)), &centered(16.0));
        let mut rotated_kp = centered(16.0);
        rotated_kp.angle = angle;
        let rotated = gradient_histogram(&Gradients::new(&stripes(angle)), &rotated_kp);
        let dot: f32 = upright.iter().zip(rotated.iter()).map(|(a, b)| a * b).sum();
        assert!(dot > 0.9, "similarity was {dot}");
    }

    /// Bright squares on a dark background.
    fn squares() -> DynamicImage {
        DynamicImage::ImageLuma8(::image::GrayImage::from_fn(128, 128, |x, y| {
            let inside =
                |c: u32, half: u32| x + half >= c && x <= c + half && y + half >= c && y <= c + half;
            if inside(32, 6) || inside(80, 10) || (x % 48 > 36 && y % 48 > 36) {
                ::image::Luma([230])
            } else {
                ::image::Luma([20])
            }
        }))
    }

    #[test]
    fn sift_finds_square_corners() {
        let features = sift(&squares(), &FeatureSettings::default()).unwrap();
        assert!(!features.is_empty());
        assert_eq!(features.descriptors.dim(), (features.len(), DESCRIPTOR_SIZE));
        for row in features.descriptors.outer_iter() {
            let norm = row.dot(&row).sqrt();
            assert!((norm - 1.0).abs() < 1e-4 || norm == 0.0);
        }
    }

    #[test]
    fn sift_on_flat_image_is_empty() {
        let flat = DynamicImage::ImageLuma8(::image::GrayImage::from_pixel(
            64,
            64,
            ::image::Luma([128]),
        ));
        let features = sift(&flat, &FeatureSettings::default()).unwrap();
        assert!(features.is_empty());
        assert_eq!(features.descriptors.nrows(), 0);
    }

    #[test]
    fn dense_grid_positions() {
        let kps = dense_keypoints(20, 10, 8, 16.0);
        let points: Vec<_> = kps.iter().map(|kp| kp.point).collect();
        assert_eq!(points, vec![(4.0, 4.0), (12.0, 4.0)]);
        assert!(kps.iter().all(|kp| kp.size == 16.0 && kp.angle == 0.0));
    }

    #[test]
    fn descriptor_set_groups_rows_by_image() {
        let set = DescriptorSet::from_images(
            vec![
                (array![[1.0, 1.0], [2.0, 2.0]], "a".to_owned()),
                (Array2::zeros((0, 2)), "b".to_owned()),
                (array![[3.0, 3.0]], "c".to_owned()),
            ],
            2,
        )
        .unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.num_images(), 3);
        assert_eq!(set.image_indices(), vec![0, 0, 2]);
        assert_eq!(set.descriptor_labels(), vec!["a", "a", "c"]);
        assert_eq!(set.image(1).nrows(), 0);
        assert_eq!(set.image(2), array![[3.0, 3.0]]);
    }

    #[test]
    fn per_class_sampling_keeps_dataset_order() {
        let dataset = Dataset::new(
            (0..6).map(|i| PathBuf::from(format!("{i}.png"))).collect(),
            ["a", "b", "a", "a", "b", "c"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
        .unwrap();
        let sampled = sample_per_class(&dataset, Some(1));
        assert_eq!(sampled.labels, vec!["a", "b", "c"]);
        assert_eq!(sampled.filenames[2], PathBuf::from("5.png"));
    }
}
