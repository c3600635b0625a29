//! Raster figures of experiment results.

use crate::metrics::ConfusionMatrix;
use crate::Result;
use image::{Rgb, RgbImage};
use imageproc::drawing;
use imageproc::rect::Rect;
use log::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const GRAY: Rgb<u8> = Rgb([190, 190, 190]);

const PALETTE: [Rgb<u8>; 9] = [
    Rgb([0, 0, 255]),
    Rgb([0, 128, 0]),
    Rgb([255, 0, 0]),
    Rgb([0, 191, 191]),
    Rgb([191, 0, 191]),
    Rgb([191, 191, 0]),
    Rgb([85, 107, 47]),
    Rgb([148, 0, 211]),
    Rgb([0, 0, 0]),
];

const CELL: u32 = 48;
const MARGIN: u32 = 16;

/// Blue color map from white (0) to dark blue (1).
fn blues(value: f64) -> Rgb<u8> {
    let t = value.clamp(0.0, 1.0);
    let lerp = |from: f64, to: f64| (from + (to - from) * t).round() as u8;
    Rgb([lerp(247.0, 8.0), lerp(251.0, 48.0), lerp(255.0, 107.0)])
}

/// Renders the matrix as a heat map, one square cell per pair of labels.
///
/// Unnormalized counts are scaled by the largest count.
pub fn render_confusion_matrix(cm: &ConfusionMatrix, normalize: bool) -> RgbImage {
    let n = cm.labels.len() as u32;
    let values = if normalize {
        cm.normalized()
    } else {
        let max = cm.counts.iter().max().copied().unwrap_or(0).max(1) as f64;
        cm.counts.mapv(|c| c as f64 / max)
    };
    let side = 2 * MARGIN + n * CELL;
    let mut canvas = RgbImage::from_pixel(side.max(1), side.max(1), WHITE);
    for ((row, column), &value) in values.indexed_iter() {
        let x = (MARGIN + column as u32 * CELL) as i32;
        let y = (MARGIN + row as u32 * CELL) as i32;
        let cell = Rect::at(x, y).of_size(CELL, CELL);
        drawing::draw_filled_rect_mut(&mut canvas, cell, blues(value));
        drawing::draw_hollow_rect_mut(&mut canvas, cell, GRAY);
    }
    if n > 0 {
        drawing::draw_hollow_rect_mut(
            &mut canvas,
            Rect::at(MARGIN as i32, MARGIN as i32).of_size(n * CELL, n * CELL),
            BLACK,
        );
    }
    canvas
}

pub fn plot_confusion_matrix(
    cm: &ConfusionMatrix,
    normalize: bool,
    path: impl AsRef<Path>,
) -> Result<()> {
    let path = path.as_ref();
    if normalize {
        info!("normalized confusion matrix ({})", cm.labels.join(", "));
        for (label, row) in cm.labels.iter().zip(cm.normalized().outer_iter()) {
            let cells: Vec<String> = row.iter().map(|v| format!("{v:.2}")).collect();
            info!("{:>12} {}", label, cells.join(" "));
        }
    } else {
        info!("confusion matrix, without normalization\n{}", cm);
    }
    render_confusion_matrix(cm, normalize).save(path)?;
    info!("saved confusion matrix plot to {}", path.display());
    Ok(())
}

/// Mean accuracy with its standard deviation against C, drawn on a log axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBarPanel {
    pub title: String,
    pub c: Vec<f64>,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

const PANEL_WIDTH: u32 = 480;
const PANEL_HEIGHT: u32 = 320;
const COLUMNS: u32 = 2;

fn draw_panel(canvas: &mut RgbImage, panel: &ErrorBarPanel, origin: (f32, f32), color: Rgb<u8>) {
    let margin = MARGIN as f32 * 2.0;
    let (left, top) = (origin.0 + margin, origin.1 + margin);
    let (right, bottom) = (
        origin.0 + PANEL_WIDTH as f32 - margin,
        origin.1 + PANEL_HEIGHT as f32 - margin,
    );
    drawing::draw_line_segment_mut(canvas, (left, bottom), (right, bottom), BLACK);
    drawing::draw_line_segment_mut(canvas, (left, top), (left, bottom), BLACK);

    let log_c: Vec<f64> = panel.c.iter().map(|c| c.log10()).collect();
    let (lo, hi) = log_c
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let span = if hi > lo { hi - lo } else { 1.0 };
    let to_x = |v: f64| left + ((v - lo) / span) as f32 * (right - left);
    // Accuracy lives in [0, 1].
    let to_y = |v: f64| bottom - v.clamp(0.0, 1.0) as f32 * (bottom - top);

    let points: Vec<(f32, f32)> = log_c
        .iter()
        .zip(&panel.mean)
        .map(|(&c, &m)| (to_x(c), to_y(m)))
        .collect();
    for pair in points.windows(2) {
        // Dashed connection.
        let steps = 8;
        for s in (0..steps).step_by(2) {
            let t0 = s as f32 / steps as f32;
            let t1 = (s + 1) as f32 / steps as f32;
            let lerp = |t: f32| {
                (
                    pair[0].0 + (pair[1].0 - pair[0].0) * t,
                    pair[0].1 + (pair[1].1 - pair[0].1) * t,
                )
            };
            drawing::draw_line_segment_mut(canvas, lerp(t0), lerp(t1), color);
        }
    }
    for ((&(x, _), &mean), &std) in points.iter().zip(&panel.mean).zip(&panel.std) {
        let (y_low, y_high) = (to_y(mean - std), to_y(mean + std));
        drawing::draw_line_segment_mut(canvas, (x, y_low), (x, y_high), color);
        drawing::draw_line_segment_mut(canvas, (x - 3.0, y_low), (x + 3.0, y_low), color);
        drawing::draw_line_segment_mut(canvas, (x - 3.0, y_high), (x + 3.0, y_high), color);
        drawing::draw_cross_mut(canvas, color, x as i32, to_y(mean) as i32);
    }
}

/// Lays panels out two per row, each in its own color.
pub fn render_error_bars(panels: &[ErrorBarPanel]) -> RgbImage {
    let rows = ((panels.len() as u32 + COLUMNS - 1) / COLUMNS).max(1);
    let mut canvas = RgbImage::from_pixel(COLUMNS * PANEL_WIDTH, rows * PANEL_HEIGHT, WHITE);
    for (i, panel) in panels.iter().enumerate() {
        let i = i as u32;
        let origin = (
            ((i % COLUMNS) * PANEL_WIDTH) as f32,
            ((i / COLUMNS) * PANEL_HEIGHT) as f32,
        );
        draw_panel(&mut canvas, panel, origin, PALETTE[i as usize % PALETTE.len()]);
    }
    canvas
}

pub fn plot_error_bars(panels: &[ErrorBarPanel], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    render_error_bars(panels).save(path)?;
    info!("saved {} error bar panels to {}", panels.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn heat_map_shades_by_value() {
        let names = labels(&["a", "b"]);
        let expected = labels(&["a", "a", "a", "b"]);
        let predicted = labels(&["a", "a", "a", "a"]);
        let cm = ConfusionMatrix::new(&expected, &predicted, &names).unwrap();
        let image = render_confusion_matrix(&cm, true);
        assert_eq!(image.dimensions(), (2 * MARGIN + 2 * CELL, 2 * MARGIN + 2 * CELL));
        let center = |row: u32, column: u32| {
            *image.get_pixel(MARGIN + column * CELL + CELL / 2, MARGIN + row * CELL + CELL / 2)
        };
        // row a is all on the diagonal, row b is all off it
        assert_eq!(center(0, 0), blues(1.0));
        assert_eq!(center(0, 1), blues(0.0));
        assert_eq!(center(1, 0), blues(1.0));
        assert_eq!(center(1, 1), blues(0.0));
    }

    #[test]
    fn error_bar_figure_layout() {
        let panel = ErrorBarPanel {
            title: "16 Gaussians in GMM".to_owned(),
            c: vec![0.01, 0.1, 1.0],
            mean: vec![0.5, 0.7, 0.6],
            std: vec![0.05, 0.02, 0.1],
        };
        let image = render_error_bars(&[panel.clone(), panel.clone(), panel]);
        assert_eq!(image.dimensions(), (2 * PANEL_WIDTH, 2 * PANEL_HEIGHT));
        assert!(image.pixels().any(|p| *p == PALETTE[0]));
        assert!(image.pixels().any(|p| *p == PALETTE[2]));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curves.png");
        plot_error_bars(&[], &path).unwrap();
        assert!(path.is_file());
    }
}
