// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Motion analyzer — per-frame grayscale background model producing
//! motion metrics and an adaptive static mask (spec §4.9).
//!
//! Ported from the exponentially-weighted background/foreground model in
//! `r_motion::r_motion_state`, using `image`/`imageproc` in place of
//! OpenCV. Every named constant (decay rates, thresholds, warm-up count)
//! matches the source.

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::contours::BorderType;
use imageproc::distance_transform::Norm;

/// Raw pixel layout a caller may hand to [`MotionState::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgra,
    Bgr,
    Rgb,
    Gray8,
}

#[derive(Debug, Clone, Copy)]
pub struct MotionParams {
    /// Background learning rate under normal conditions.
    pub alpha: f32,
    /// Background learning rate during an illumination-change veto.
    pub fast_alpha: f32,
    /// Per-pixel absolute-difference threshold counted toward the
    /// illumination-change fraction.
    pub illum_diff_threshold: u8,
    /// Fraction of pixels above `illum_diff_threshold` that triggers the
    /// veto.
    pub illum_fraction_threshold: f32,
    /// `mean + k * stddev` adaptive threshold multiplier.
    pub adaptive_k: f32,
    /// Exponential decay applied to the per-pixel motion-frequency map.
    pub freq_decay: f32,
    /// Frames observed before the static mask starts suppressing motion.
    pub min_observation_frames: u64,
    /// Frequency above which a pixel is considered chronically moving
    /// and is masked out.
    pub motion_freq_thresh: f32,
    /// Minimum contour area, as a fraction of frame area, to count as
    /// motion.
    pub min_area_fraction: f64,
    pub enable_masking: bool,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            alpha: 0.002,
            fast_alpha: 0.10,
            illum_diff_threshold: 35,
            illum_fraction_threshold: 0.25,
            adaptive_k: 2.0,
            freq_decay: 0.70,
            min_observation_frames: 100,
            motion_freq_thresh: 0.95,
            min_area_fraction: 0.003,
            enable_masking: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MotionBBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub has_motion: bool,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MotionInfo {
    pub motion: u64,
    pub avg_motion: f64,
    pub stddev: f64,
    pub motion_before_mask: u64,
    pub masked_pixels: u64,
    pub masking_active: bool,
    pub motion_bbox: MotionBBox,
}

/// Exponentially-weighted mean/variance estimator for the motion-pixel
/// count, ported from `r_utils::r_exp_avg`: an EMA of `x` alongside an
/// EMA of `x^2`, with variance taken as `E[x^2] - E[x]^2`. `MEMORY`
/// mirrors `r_motion_state`'s default construction of its `_avg_motion`
/// member (`r_exp_avg(0, 500)`), a "period" constructor where
/// `alpha = 2 / (memory + 1)`.
#[derive(Debug)]
struct RunningStat {
    mean: f64,
    mean_sq: f64,
    alpha: f64,
    initialized: bool,
}

impl RunningStat {
    const MEMORY: f64 = 500.0;

    fn new() -> Self {
        Self { mean: 0.0, mean_sq: 0.0, alpha: 2.0 / (Self::MEMORY + 1.0), initialized: false }
    }

    fn update(&mut self, x: f64) -> f64 {
        if !self.initialized {
            self.mean = x;
            self.mean_sq = x * x;
            self.initialized = true;
        } else {
            self.mean = self.alpha * x + (1.0 - self.alpha) * self.mean;
            self.mean_sq = self.alpha * (x * x) + (1.0 - self.alpha) * self.mean_sq;
        }
        self.mean
    }

    fn standard_deviation(&self) -> f64 {
        // Guard against a tiny negative from floating-point cancellation.
        (self.mean_sq - self.mean * self.mean).max(0.0).sqrt()
    }
}

impl Default for RunningStat {
    fn default() -> Self {
        Self::new()
    }
}

/// A single camera's running background model. Lives as long as the
/// recording context it belongs to (spec §3.2).
pub struct MotionState {
    params: MotionParams,
    width: u32,
    height: u32,
    bg: Option<Vec<f32>>,
    freq: Vec<f32>,
    static_mask: Vec<bool>,
    avg_motion: RunningStat,
    frame_count: u64,
}

impl MotionState {
    pub fn new(params: MotionParams) -> Self {
        Self {
            params,
            width: 0,
            height: 0,
            bg: None,
            freq: Vec::new(),
            static_mask: Vec::new(),
            avg_motion: RunningStat::default(),
            frame_count: 0,
        }
    }

    /// Feed one decoded frame. Returns `None` on the seeding frame (the
    /// background model needs two frames to diff against) and during an
    /// illumination-change veto (spec §4.9 steps 2, 5).
    pub fn process(&mut self, data: &[u8], width: u32, height: u32, format: PixelFormat) -> Option<MotionInfo> {
        if width == 0 || height == 0 {
            return None;
        }
        let gray = to_grayscale(data, width, height, format)?;
        let blurred = gaussian_blur_u8(&gray, 5.0 / 3.0);

        if self.bg.is_none() || self.width != width || self.height != height {
            self.width = width;
            self.height = height;
            self.bg = Some(blurred.pixels().map(|p| p.0[0] as f32).collect());
            self.freq = vec![0.0; (width * height) as usize];
            self.static_mask = vec![true; (width * height) as usize];
            return None;
        }

        let bg = self.bg.as_mut().unwrap();
        accumulate_weighted(bg, &blurred, self.params.alpha);

        let diff: Vec<u8> = bg
            .iter()
            .zip(blurred.pixels())
            .map(|(b, p)| (*b - p.0[0] as f32).abs().round().clamp(0.0, 255.0) as u8)
            .collect();

        let illum_count = diff.iter().filter(|&&d| d > self.params.illum_diff_threshold).count();
        let illum_fraction = illum_count as f32 / diff.len() as f32;
        if illum_fraction > self.params.illum_fraction_threshold {
            let bg = self.bg.as_mut().unwrap();
            accumulate_weighted(bg, &blurred, self.params.fast_alpha);
            return None;
        }

        let (mean, stddev) = mean_stddev(&diff);
        let thresh = mean + self.params.adaptive_k * stddev;
        let binary: Vec<u8> = diff.iter().map(|&d| if d as f32 > thresh { 255 } else { 0 }).collect();
        let binary_img = GrayImage::from_raw(width, height, binary).expect("buffer matches dimensions");

        // Morphological close: dilate then erode over a 3x3 neighborhood.
        let dilated = imageproc::morphology::dilate(&binary_img, Norm::LInf, 1);
        let closed = imageproc::morphology::erode(&dilated, Norm::LInf, 1);

        self.frame_count += 1;
        let motion_before_mask = closed.pixels().filter(|p| p.0[0] > 0).count() as u64;

        for (f, p) in self.freq.iter_mut().zip(closed.pixels()) {
            let norm = if p.0[0] > 0 { 1.0 } else { 0.0 };
            *f = *f * self.params.freq_decay + norm * (1.0 - self.params.freq_decay);
        }

        let masking_active = self.params.enable_masking && self.frame_count >= self.params.min_observation_frames;
        let mut masked_pixels = 0u64;
        let mut motion_img = closed;
        if masking_active {
            for (m, f) in self.static_mask.iter_mut().zip(self.freq.iter()) {
                *m = *f < self.params.motion_freq_thresh;
            }
            for (p, keep) in motion_img.pixels_mut().zip(self.static_mask.iter()) {
                if p.0[0] > 0 && !keep {
                    masked_pixels += 1;
                    p.0[0] = 0;
                }
            }
        }

        let contours = imageproc::contours::find_contours::<i32>(&motion_img);
        let min_area_px = self.params.min_area_fraction * (width as f64 * height as f64);
        let mut motion_pixels = 0u64;
        let mut bbox: Option<(i32, i32, i32, i32)> = None;
        for c in contours.iter().filter(|c| c.border_type == BorderType::Outer) {
            let area = polygon_area(&c.points);
            if area < min_area_px {
                continue;
            }
            motion_pixels += area as u64;
            let (min_x, min_y, max_x, max_y) = c.points.iter().fold(
                (i32::MAX, i32::MAX, i32::MIN, i32::MIN),
                |(min_x, min_y, max_x, max_y), p| (min_x.min(p.x), min_y.min(p.y), max_x.max(p.x), max_y.max(p.y)),
            );
            bbox = Some(match bbox {
                None => (min_x, min_y, max_x, max_y),
                Some((ex0, ey0, ex1, ey1)) => (ex0.min(min_x), ey0.min(min_y), ex1.max(max_x), ey1.max(max_y)),
            });
        }

        let motion_bbox = match bbox {
            Some((x0, y0, x1, y1)) => {
                MotionBBox { x: x0, y: y0, width: x1 - x0 + 1, height: y1 - y0 + 1, has_motion: true }
            }
            None => MotionBBox::default(),
        };

        let avg_motion = self.avg_motion.update(motion_pixels as f64);
        Some(MotionInfo {
            motion: motion_pixels,
            avg_motion,
            stddev: self.avg_motion.standard_deviation(),
            motion_before_mask,
            masked_pixels,
            masking_active,
            motion_bbox,
        })
    }
}

/// Canonical trigger used by downstream readers (spec §4.9).
pub fn is_motion_significant(motion: u64, avg: f64, stddev: f64, k: f64) -> bool {
    (motion as f64) > avg + k * stddev
}

fn to_grayscale(data: &[u8], width: u32, height: u32, format: PixelFormat) -> Option<GrayImage> {
    match format {
        PixelFormat::Gray8 => GrayImage::from_raw(width, height, data.to_vec()),
        PixelFormat::Rgb => {
            let img = image::RgbImage::from_raw(width, height, data.to_vec())?;
            Some(image::DynamicImage::ImageRgb8(img).to_luma8())
        }
        PixelFormat::Bgr => {
            let mut rgb = data.to_vec();
            for px in rgb.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            let img = image::RgbImage::from_raw(width, height, rgb)?;
            Some(image::DynamicImage::ImageRgb8(img).to_luma8())
        }
        PixelFormat::Bgra => {
            let mut rgba = data.to_vec();
            for px in rgba.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
            let img = image::RgbaImage::from_raw(width, height, rgba)?;
            Some(image::DynamicImage::ImageRgba8(img).to_luma8())
        }
    }
}

fn gaussian_blur_u8(img: &GrayImage, sigma: f32) -> GrayImage {
    let f32_img: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_fn(img.width(), img.height(), |x, y| Luma([img.get_pixel(x, y).0[0] as f32]));
    let blurred = imageproc::filter::gaussian_blur_f32(&f32_img, sigma);
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        Luma([blurred.get_pixel(x, y).0[0].round().clamp(0.0, 255.0) as u8])
    })
}

fn accumulate_weighted(bg: &mut [f32], current: &GrayImage, alpha: f32) {
    for (b, p) in bg.iter_mut().zip(current.pixels()) {
        *b = (1.0 - alpha) * *b + alpha * p.0[0] as f32;
    }
}

fn mean_stddev(diff: &[u8]) -> (f32, f32) {
    let n = diff.len() as f64;
    let mean = diff.iter().map(|&d| d as f64).sum::<f64>() / n;
    let var = diff.iter().map(|&d| (d as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean as f32, var.sqrt() as f32)
}

fn polygon_area(points: &[imageproc::point::Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..points.len() {
        let (p0, p1) = (points[i], points[(i + 1) % points.len()]);
        sum += (p0.x as f64) * (p1.y as f64) - (p1.x as f64) * (p0.y as f64);
    }
    (sum / 2.0).abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_frame_produces_no_metric() {
        let mut state = MotionState::new(MotionParams::default());
        let frame = vec![128u8; 320 * 240];
        assert!(state.process(&frame, 320, 240, PixelFormat::Gray8).is_none());
    }

    #[test]
    fn significance_helper_matches_mean_plus_k_sigma() {
        assert!(is_motion_significant(100, 50.0, 10.0, 2.0));
        assert!(!is_motion_significant(60, 50.0, 10.0, 2.0));
    }
}
