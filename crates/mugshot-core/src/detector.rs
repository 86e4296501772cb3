//! Multi-scale Haar cascade face detector.
//!
//! Slides the cascade window over the image at every scale, evaluates each
//! window against the boosted stages, then groups overlapping raw hits and
//! keeps groups with enough neighbours.

use crate::cascade::{HaarCascade, STAGE_THRESHOLD_EPS};
use crate::image_buffer::ImageBuffer;
use crate::types::BoundingBox;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const DEFAULT_SCALE_FACTOR: f64 = 1.2;
const DEFAULT_MIN_NEIGHBORS: usize = 10;
const DEFAULT_MIN_SIZE: u32 = 10;
/// Windows stop growing once they come within this many pixels of the image size.
const SCAN_MARGIN: f64 = 10.0;
const MIN_STEP: f64 = 2.0;
/// Relative tolerance of the rectangle similarity used for grouping.
const GROUP_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade file not found: {0} (point cascade_path at an OpenCV Haar cascade XML)")]
    ModelNotFound(String),
    #[error("invalid cascade: {0}")]
    InvalidModel(String),
    #[error("unsupported cascade: {0}")]
    UnsupportedFeature(String),
    #[error("invalid detector config: {0}")]
    InvalidConfig(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Scan parameters. Immutable once handed to [`FaceDetector::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Ratio between successive window sizes.
    pub scale_factor: f64,
    /// Raw hits a group needs before it is reported.
    pub min_neighbors: usize,
    pub min_width: u32,
    pub min_height: u32,
    /// Skip windows with no edges when the cascade rejects flat windows.
    pub edge_pruning: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_width: DEFAULT_MIN_SIZE,
            min_height: DEFAULT_MIN_SIZE,
            edge_pruning: true,
        }
    }
}

/// Haar cascade face detector.
pub struct FaceDetector {
    cascade: HaarCascade,
    config: DetectorConfig,
    /// Cascade outcome on a pixel-constant window.
    flat_verdict: bool,
}

impl FaceDetector {
    pub fn new(cascade: HaarCascade, config: DetectorConfig) -> Result<Self, DetectorError> {
        if !(config.scale_factor > 1.0) {
            return Err(DetectorError::InvalidConfig(format!(
                "scale_factor must be > 1.0, got {}",
                config.scale_factor
            )));
        }
        let flat_verdict = cascade.flat_verdict();
        tracing::debug!(flat_verdict, ?config, "face detector ready");
        Ok(Self {
            cascade,
            config,
            flat_verdict,
        })
    }

    /// Load the cascade XML from the given path.
    pub fn load(path: impl AsRef<Path>, config: DetectorConfig) -> Result<Self, DetectorError> {
        Self::new(HaarCascade::load(path)?, config)
    }

    /// Detect faces, returning one box per neighbour group in discovery order.
    pub fn detect(&self, image: &ImageBuffer) -> Vec<BoundingBox> {
        let hits = self.raw_hits(image);
        let faces = group_rectangles(&hits, self.config.min_neighbors, image.width(), image.height());
        tracing::debug!(raw = hits.len(), faces = faces.len(), "detection finished");
        faces
    }

    /// Every window accepted by the cascade, before grouping.
    pub fn raw_hits(&self, image: &ImageBuffer) -> Vec<BoundingBox> {
        let gray = image.to_grayscale();
        let (width, height) = (gray.width(), gray.height());
        let integral = IntegralImage::new(gray.data(), width, height, self.config.edge_pruning);

        let base_w = self.cascade.window_width as f64;
        let base_h = self.cascade.window_height as f64;
        let prune = self.config.edge_pruning && !self.flat_verdict;

        let mut hits = Vec::new();
        let mut pruned = 0usize;
        let mut factor = 1.0f64;

        while factor * base_w < width as f64 - SCAN_MARGIN && factor * base_h < height as f64 - SCAN_MARGIN {
            let win_w = (base_w * factor).round() as u32;
            let win_h = (base_h * factor).round() as u32;
            let step = factor.max(MIN_STEP);

            if win_w >= self.config.min_width
                && win_h >= self.config.min_height
                && win_w <= width
                && win_h <= height
            {
                let scaled = ScaledCascade::new(&self.cascade, factor, win_w, win_h);
                let rows = ((height - win_h) as f64 / step).floor() as u32;
                let cols = ((width - win_w) as f64 / step).floor() as u32;

                for iy in 0..=rows {
                    let y = (iy as f64 * step).round() as u32;
                    if y + win_h > height {
                        break;
                    }
                    for ix in 0..=cols {
                        let x = (ix as f64 * step).round() as u32;
                        if x + win_w > width {
                            break;
                        }
                        if prune && integral.edge_count(x, y, win_w, win_h) == 0 {
                            pruned += 1;
                            continue;
                        }
                        if self.classify_window(&integral, &scaled, x, y) {
                            hits.push(BoundingBox::new(x, y, win_w, win_h));
                        }
                    }
                }
            }

            factor *= self.config.scale_factor;
        }

        tracing::trace!(hits = hits.len(), pruned, "cascade scan");
        hits
    }

    /// Run every stage on the window at (`x`, `y`).
    fn classify_window(&self, integral: &IntegralImage, scaled: &ScaledCascade, x: u32, y: u32) -> bool {
        let (win_w, win_h) = scaled.window;
        if is_constant(integral, x, y, win_w, win_h) {
            return self.flat_verdict;
        }

        // A constant normalization region inside a varying window keeps norm 1.
        let (nx, ny, nw, nh) = scaled.norm_rect;
        let norm = if is_constant(integral, x + nx, y + ny, nw, nh) {
            1.0
        } else {
            let mean = integral.sum(x + nx, y + ny, nw, nh) as f64 * scaled.inv_area;
            let variance = integral.sqsum(x + nx, y + ny, nw, nh) as f64 * scaled.inv_area - mean * mean;
            if variance > 0.0 {
                variance.sqrt()
            } else {
                1.0
            }
        };

        for stage in &self.cascade.stages {
            let total: f64 = stage
                .classifiers
                .iter()
                .map(|wc| {
                    wc.evaluate(|node| {
                        let value = scaled.features[node.feature].value(integral, x, y);
                        value < node.threshold as f64 * norm
                    })
                })
                .sum();
            if total < stage.threshold as f64 - STAGE_THRESHOLD_EPS {
                return false;
            }
        }
        true
    }
}

/// Exact zero-variance test: `n·Σp² == (Σp)²` holds only when every pixel is equal.
fn is_constant(integral: &IntegralImage, x: u32, y: u32, w: u32, h: u32) -> bool {
    let sum = integral.sum(x, y, w, h) as u128;
    let sqsum = integral.sqsum(x, y, w, h) as u128;
    w as u128 * h as u128 * sqsum == sum * sum
}

/// A feature rectangle at one scale, weight already divided by the normalization area.
#[derive(Debug, Clone, Copy)]
struct ScaledRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone)]
struct ScaledFeature {
    rects: Vec<ScaledRect>,
}

impl ScaledFeature {
    fn value(&self, integral: &IntegralImage, x: u32, y: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| integral.sum(x + r.x, y + r.y, r.width, r.height) as f64 * r.weight)
            .sum()
    }
}

/// The cascade's features resized for one window size.
struct ScaledCascade {
    features: Vec<ScaledFeature>,
    window: (u32, u32),
    /// Variance normalization region inside the window: (x, y, w, h).
    norm_rect: (u32, u32, u32, u32),
    inv_area: f64,
}

impl ScaledCascade {
    fn new(cascade: &HaarCascade, factor: f64, win_w: u32, win_h: u32) -> Self {
        // Normalize over the window inset by one base pixel on each side.
        let nx = factor.round() as u32;
        let ny = factor.round() as u32;
        let nw = (((cascade.window_width - 2) as f64 * factor).round() as u32)
            .min(win_w.saturating_sub(nx))
            .max(1);
        let nh = (((cascade.window_height - 2) as f64 * factor).round() as u32)
            .min(win_h.saturating_sub(ny))
            .max(1);
        let inv_area = 1.0 / (nw as f64 * nh as f64);

        let features = cascade
            .features
            .iter()
            .map(|f| {
                let mut rects: Vec<ScaledRect> = f
                    .rects
                    .iter()
                    .map(|r| {
                        let x = ((r.x as f64 * factor).round() as u32).min(win_w);
                        let y = ((r.y as f64 * factor).round() as u32).min(win_h);
                        ScaledRect {
                            x,
                            y,
                            width: ((r.width as f64 * factor).round() as u32).min(win_w - x),
                            height: ((r.height as f64 * factor).round() as u32).min(win_h - y),
                            weight: r.weight as f64 * inv_area,
                        }
                    })
                    .collect();

                // Re-balance the first rectangle so the weighted areas cancel
                // exactly at this scale.
                let area0 = rects[0].width as f64 * rects[0].height as f64;
                let rest: f64 = rects[1..]
                    .iter()
                    .map(|r| r.weight * r.width as f64 * r.height as f64)
                    .sum();
                rects[0].weight = if area0 > 0.0 { -rest / area0 } else { 0.0 };

                ScaledFeature { rects }
            })
            .collect();

        Self {
            features,
            window: (win_w, win_h),
            norm_rect: (nx, ny, nw, nh),
            inv_area,
        }
    }
}

/// Summed-area tables over pixel values, squared values, and edges.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sqsum: Vec<u64>,
    /// Count of pixels that differ from their right or bottom neighbour.
    edges: Option<Vec<u32>>,
}

impl IntegralImage {
    fn new(gray: &[u8], width: u32, height: u32, with_edges: bool) -> Self {
        let w = width as usize;
        let h = height as usize;
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sqsum = vec![0u64; stride * (h + 1)];
        let mut edges = with_edges.then(|| vec![0u32; stride * (h + 1)]);

        for y in 0..h {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            let mut row_edges = 0u32;
            for x in 0..w {
                let p = gray[y * w + x];
                row_sum += p as u64;
                row_sq += p as u64 * p as u64;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row_sum;
                sqsum[idx] = sqsum[idx - stride] + row_sq;
                if let Some(edges) = edges.as_mut() {
                    let right = x + 1 < w && gray[y * w + x + 1] != p;
                    let below = y + 1 < h && gray[(y + 1) * w + x] != p;
                    row_edges += (right || below) as u32;
                    edges[idx] = edges[idx - stride] + row_edges;
                }
            }
        }

        Self {
            stride,
            sum,
            sqsum,
            edges,
        }
    }

    fn rect<T>(table: &[T], stride: usize, x: u32, y: u32, w: u32, h: u32) -> T
    where
        T: Copy + std::ops::Add<Output = T> + std::ops::Sub<Output = T>,
    {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0] - table[y0 * stride + x1] - table[y1 * stride + x0]
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn sqsum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sqsum, self.stride, x, y, w, h)
    }

    /// Edge pixels inside the rectangle; zero means the region is pixel-constant.
    fn edge_count(&self, x: u32, y: u32, w: u32, h: u32) -> u32 {
        match &self.edges {
            Some(edges) => Self::rect(edges, self.stride, x, y, w, h),
            None => u32::MAX,
        }
    }
}

/// Whether two rectangles are close enough to count as the same detection.
fn similar(a: &BoundingBox, b: &BoundingBox) -> bool {
    let delta = GROUP_EPS
        * (a.width.min(b.width) as f64 + a.height.min(b.height) as f64)
        * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x) && close(a.y, b.y) && close(a.right(), b.right()) && close(a.bottom(), b.bottom())
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Partition raw hits into similarity classes and average each class with at
/// least `min_neighbors` members. `min_neighbors == 0` returns the raw hits.
fn group_rectangles(hits: &[BoundingBox], min_neighbors: usize, width: u32, height: u32) -> Vec<BoundingBox> {
    if min_neighbors == 0 {
        return hits.to_vec();
    }

    let n = hits.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&hits[i], &hits[j]) {
                let (ri, rj) = (find_root(&mut parent, i), find_root(&mut parent, j));
                if ri != rj {
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    // Accumulate per class in order of first appearance.
    let mut class_of_root = vec![usize::MAX; n];
    let mut classes: Vec<[u64; 5]> = Vec::new(); // x, y, w, h, count
    for (i, hit) in hits.iter().enumerate() {
        let root = find_root(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes.len();
            classes.push([0; 5]);
        }
        let c = &mut classes[class_of_root[root]];
        c[0] += hit.x as u64;
        c[1] += hit.y as u64;
        c[2] += hit.width as u64;
        c[3] += hit.height as u64;
        c[4] += 1;
    }

    classes
        .iter()
        .filter(|c| c[4] as usize >= min_neighbors)
        .filter_map(|c| {
            let n = c[4];
            let avg = |s: u64| ((s * 2 + n) / (2 * n)) as u32;
            let x = avg(c[0]).min(width.saturating_sub(1));
            let y = avg(c[1]).min(height.saturating_sub(1));
            let w = avg(c[2]).min(width - x);
            let h = avg(c[3]).min(height - y);
            (w > 0 && h > 0).then(|| BoundingBox::new(x, y, w, h))
        })
        .collect()
}
