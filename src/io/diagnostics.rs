//! Checkpoint montage: measured vs. predicted images and the Δn projection.
//!
//! Panels, left to right: measured retardance, measured azimuth (hue),
//! predicted retardance, predicted azimuth (hue) and the birefringence MIP.

use crate::error::Result;
use crate::optim::MeasuredImages;
use image::{Rgb, RgbImage};
use std::f32::consts::PI;
use std::path::{Path, PathBuf};

const GAP: u32 = 2;

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Fully saturated color for hue in `[0, 1)`, scaled by `value`.
fn hue_to_rgb(hue: f32, value: f32) -> [u8; 3] {
    let h = hue.rem_euclid(1.0) * 6.0;
    let x = 1.0 - (h % 2.0 - 1.0).abs();
    let (r, g, b) = match h as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    [to_u8(r * value), to_u8(g * value), to_u8(b * value)]
}

/// Grayscale panel scaled by `max` (or left black when `max` is zero).
pub fn gray_panel(values: &[f32], (height, width): (usize, usize), max: f32) -> RgbImage {
    let mut img = RgbImage::new(width as u32, height as u32);
    let scale = if max > 0.0 { 1.0 / max } else { 0.0 };
    for (i, &v) in values.iter().enumerate().take(height * width) {
        let g = to_u8(v * scale);
        img.put_pixel((i % width) as u32, (i / width) as u32, Rgb([g, g, g]));
    }
    img
}

/// Azimuth in `[0, π)` mapped to hue, with per-pixel brightness `value`.
pub fn azimuth_panel(azimuth: &[f32], value: &[f32], (height, width): (usize, usize)) -> RgbImage {
    let mut img = RgbImage::new(width as u32, height as u32);
    for (i, (&a, &v)) in azimuth.iter().zip(value).enumerate().take(height * width) {
        img.put_pixel(
            (i % width) as u32,
            (i / width) as u32,
            Rgb(hue_to_rgb(a / PI, v)),
        );
    }
    img
}

fn max_of(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |m, &v| m.max(v))
}

/// Lay panels side by side, top aligned.
fn concat(panels: &[RgbImage]) -> RgbImage {
    let width = panels.iter().map(|p| p.width()).sum::<u32>()
        + GAP * panels.len().saturating_sub(1) as u32;
    let height = panels.iter().map(|p| p.height()).max().unwrap_or(0);
    let mut out = RgbImage::from_pixel(width.max(1), height.max(1), Rgb([255, 255, 255]));
    let mut x0 = 0;
    for panel in panels {
        for (x, y, p) in panel.enumerate_pixels() {
            out.put_pixel(x0 + x, y, *p);
        }
        x0 += panel.width() + GAP;
    }
    out
}

/// Predicted azimuth brightness: dark wherever the measurement has no retardance.
///
/// With an all-zero measurement there is nothing to compare against, so the
/// damping is skipped.
pub fn damped_azimuth_weight(measured_retardance: &[f32]) -> Vec<f32> {
    if max_of(measured_retardance) == 0.0 {
        return vec![1.0; measured_retardance.len()];
    }
    measured_retardance
        .iter()
        .map(|&r| if r == 0.0 { 0.0 } else { 1.0 })
        .collect()
}

pub fn render_montage(
    measured: &MeasuredImages,
    predicted_retardance: &[f32],
    predicted_azimuth: &[f32],
    mip: &[f32],
    mip_shape: (usize, usize),
) -> RgbImage {
    let shape = measured.image_shape;
    let ret_max = max_of(&measured.retardance).max(max_of(predicted_retardance));
    let full = vec![1.0; measured.azimuth.len()];

    concat(&[
        gray_panel(&measured.retardance, shape, ret_max),
        azimuth_panel(&measured.azimuth, &full, shape),
        gray_panel(predicted_retardance, shape, ret_max),
        azimuth_panel(
            predicted_azimuth,
            &damped_azimuth_weight(&measured.retardance),
            shape,
        ),
        gray_panel(mip, mip_shape, max_of(mip)),
    ])
}

/// Write `optim_ep_XXXX.png` into `dir`.
pub fn save_montage(dir: &Path, epoch: usize, montage: &RgbImage) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("optim_ep_{epoch:04}.png"));
    montage.save(&path)?;
    Ok(path)
}
