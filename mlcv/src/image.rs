use derive_more::{Deref, DerefMut};
use image::{DynamicImage, ImageBuffer, Luma};
use log::*;
use ndarray::Array2;

/// Single channel image with intensities in `[0, 1]`.
///
/// Descriptor sampling works on this type. Decoding is left to the image crate and
/// filtering to imageproc.
#[derive(Debug, Clone, Deref, DerefMut)]
pub struct GrayFloatImage(pub ImageBuffer<Luma<f32>, Vec<f32>>);

impl GrayFloatImage {
    pub fn from_dynamic(input_image: &DynamicImage) -> Self {
        let gray = input_image.to_luma32f();
        trace!("converted a {} x {} image to gray", gray.width(), gray.height());
        Self(gray)
    }

    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> f32) -> Self {
        Self(ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
            Luma([f(x as usize, y as usize)])
        }))
    }

    pub fn width(&self) -> usize {
        self.0.width() as usize
    }

    pub fn height(&self) -> usize {
        self.0.height() as usize
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.get_pixel(x as u32, y as u32)[0]
    }
}

/// Gaussian blur with standard deviation `sigma`, which must be positive.
pub fn gaussian_blur(image: &GrayFloatImage, sigma: f32) -> GrayFloatImage {
    GrayFloatImage(imageproc::filter::gaussian_blur_f32(&image.0, sigma))
}

/// Gradient magnitude and orientation (radians, `atan2(dy, dx)`) of every pixel.
///
/// Central differences are used in the interior and one-sided differences on the border.
pub struct Gradients {
    pub magnitude: Array2<f32>,
    pub orientation: Array2<f32>,
}

impl Gradients {
    pub fn new(image: &GrayFloatImage) -> Self {
        let (width, height) = (image.width(), image.height());
        let mut magnitude = Array2::zeros((height, width));
        let mut orientation = Array2::zeros((height, width));
        for y in 0..height {
            for x in 0..width {
                let dx = image.get((x + 1).min(width - 1), y) - image.get(x.saturating_sub(1), y);
                let dy = image.get(x, (y + 1).min(height - 1)) - image.get(x, y.saturating_sub(1));
                magnitude[(y, x)] = (dx * dx + dy * dy).sqrt();
                orientation[(y, x)] = dy.atan2(dx);
            }
        }
        Self {
            magnitude,
            orientation,
        }
    }

    pub fn width(&self) -> usize {
        self.magnitude.ncols()
    }

    pub fn height(&self) -> usize {
        self.magnitude.nrows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blur_keeps_flat_image() {
        let flat = GrayFloatImage::from_fn(16, 12, |_, _| 0.25);
        let blurred = gaussian_blur(&flat, 0.8);
        assert_eq!((blurred.width(), blurred.height()), (16, 12));
        // the sampled kernel is not renormalized, so the level drops slightly but stays uniform
        let level = blurred.get(0, 0);
        assert!(level > 0.2 && level <= 0.25);
        assert!(blurred.pixels().all(|p| (p[0] - level).abs() < 1e-6));
    }

    #[test]
    fn blur_softens_a_step() {
        let step = GrayFloatImage::from_fn(20, 4, |x, _| if x < 10 { 0.0 } else { 1.0 });
        let blurred = gaussian_blur(&step, 1.5);
        let (left, right) = (blurred.get(9, 2), blurred.get(10, 2));
        assert!(left > 0.0 && left < 0.5, "left of the edge was {left}");
        assert!(right > 0.5 && right < 1.0, "right of the edge was {right}");
        assert!(blurred.get(0, 2) < 1e-3);
    }

    #[test]
    fn gradient_of_horizontal_ramp() {
        let image = GrayFloatImage::from_fn(8, 5, |x, _| x as f32 * 0.1);
        let gradients = Gradients::new(&image);
        assert!((gradients.magnitude[(2, 4)] - 0.2).abs() < 1e-6);
        assert!(gradients.orientation[(2, 4)].abs() < 1e-6);
        // one-sided difference on the border
        assert!((gradients.magnitude[(2, 0)] - 0.1).abs() < 1e-6);
    }
}
