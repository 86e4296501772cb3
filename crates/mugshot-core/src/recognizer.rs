//! Eigenface recognizer.
//!
//! Builds a linear subspace from the flattened corpus faces (principal
//! components of the training set) and classifies a query face by its nearest
//! training face in that subspace.

use crate::corpus::TrainingCorpus;
use crate::image_buffer::{ImageBuffer, FACE_HEIGHT, FACE_WIDTH};
use crate::types::Classification;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Named constants ---
const DEFAULT_DISTANCE_THRESHOLD: f64 = 3000.0;
const DEFAULT_EPSILON: f64 = 0.001;
const JACOBI_MAX_SWEEPS: usize = 100;
/// Jacobi stops once the off-diagonal energy falls below this fraction of the total.
const JACOBI_TOLERANCE: f64 = 1e-24;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("face is {actual:?}, model expects {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

/// Stopping rule for eigenface extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TermCriteria {
    /// Upper bound on the number of eigenfaces kept.
    pub max_iterations: usize,
    /// Smallest eigenvalue, relative to the largest, still worth keeping.
    pub epsilon: f64,
}

impl TermCriteria {
    pub fn new(max_iterations: usize, epsilon: f64) -> Self {
        Self {
            max_iterations,
            epsilon,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Largest eigenspace distance that still counts as a match. Also the
    /// resolution floor for retaining eigenfaces during training.
    pub distance_threshold: f64,
    pub epsilon: f64,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            epsilon: DEFAULT_EPSILON,
        }
    }
}

/// Trains eigenspace models from a corpus.
#[derive(Debug, Clone, Default)]
pub struct EigenfaceRecognizer {
    config: RecognizerConfig,
}

impl EigenfaceRecognizer {
    pub fn new(config: RecognizerConfig) -> Self {
        Self { config }
    }

    /// Train on every face in the corpus, in insertion order.
    pub fn train(&self, corpus: &TrainingCorpus) -> Result<EigenModel, RecognizerError> {
        let samples: Vec<(&str, &ImageBuffer)> = corpus
            .records()
            .iter()
            .map(|r| (r.label.as_str(), &r.image))
            .collect();
        self.train_samples(&samples)
    }

    /// Train on labeled faces that all share the same dimensions.
    pub fn train_samples(&self, samples: &[(&str, &ImageBuffer)]) -> Result<EigenModel, RecognizerError> {
        let threshold = self.config.distance_threshold;
        let Some((_, first)) = samples.first() else {
            return Ok(EigenModel::empty(threshold));
        };
        let (width, height) = (first.width(), first.height());
        let n = samples.len();
        let dim = width as usize * height as usize;

        let mut data = Array2::<f64>::zeros((n, dim));
        for (i, (_, img)) in samples.iter().enumerate() {
            if (img.width(), img.height()) != (width, height) {
                return Err(RecognizerError::DimensionMismatch {
                    expected: (width, height),
                    actual: (img.width(), img.height()),
                });
            }
            let gray = img.to_grayscale();
            for (dst, &src) in data.row_mut(i).iter_mut().zip(gray.data()) {
                *dst = src as f64;
            }
        }

        let mean = data.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(dim));
        data -= &mean;

        let gram = data.dot(&data.t());
        let (values, vectors) = jacobi_eigen(gram);

        let criteria = TermCriteria::new(n, self.config.epsilon);
        let kept = select_components(&values, criteria, threshold);

        let mut eigenfaces = Array2::<f64>::zeros((kept.len(), dim));
        for (row, &k) in kept.iter().enumerate() {
            let face = data.t().dot(&vectors.column(k)) / values[k].sqrt();
            eigenfaces.row_mut(row).assign(&face);
        }
        let projections = data.dot(&eigenfaces.t());

        tracing::info!(
            samples = n,
            components = kept.len(),
            largest_eigenvalue = kept.first().map(|&k| values[k]).unwrap_or(0.0),
            "eigenspace trained"
        );

        Ok(EigenModel {
            labels: samples.iter().map(|(label, _)| label.to_string()).collect(),
            mean,
            eigenvalues: kept.iter().map(|&k| values[k]).collect(),
            eigenfaces,
            projections,
            width,
            height,
            threshold,
        })
    }
}

/// Pick eigenvalue indices, largest first, under the termination criteria.
///
/// At most `max_iterations` and at most `n - 1` components are kept. Retention
/// stops at the first eigenvalue below `epsilon` times the largest, or whose
/// spread `sqrt(λ)` is below `epsilon × threshold`.
fn select_components(values: &[f64], criteria: TermCriteria, threshold: f64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(std::cmp::Ordering::Equal));

    let Some(&top) = order.first() else {
        return Vec::new();
    };
    let largest = values[top];
    let limit = criteria.max_iterations.min(values.len().saturating_sub(1));
    let floor = criteria.epsilon * threshold;

    order
        .into_iter()
        .take(limit)
        .take_while(|&k| {
            let lambda = values[k];
            lambda > 0.0 && lambda / largest >= criteria.epsilon && lambda.sqrt() >= floor
        })
        .collect()
}

/// Eigen-decompose a symmetric matrix with cyclic Jacobi rotations.
///
/// Returns the eigenvalues and a matrix whose columns are the matching
/// unit eigenvectors (unsorted).
fn jacobi_eigen(mut a: Array2<f64>) -> (Vec<f64>, Array2<f64>) {
    let n = a.nrows();
    let mut v = Array2::<f64>::eye(n);
    let total: f64 = a.iter().map(|x| x * x).sum();

    for _ in 0..JACOBI_MAX_SWEEPS {
        let mut off = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off += a[[p, q]] * a[[p, q]];
            }
        }
        if off <= JACOBI_TOLERANCE * total {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let sign = if theta >= 0.0 { 1.0 } else { -1.0 };
                let t = sign / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let (akp, akq) = (a[[k, p]], a[[k, q]]);
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let (apk, aqk) = (a[[p, k]], a[[q, k]]);
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let (vkp, vkq) = (v[[k, p]], v[[k, q]]);
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    ((0..n).map(|i| a[[i, i]]).collect(), v)
}

/// A trained eigenspace. Valid only for the corpus it was trained on.
#[derive(Debug, Clone)]
pub struct EigenModel {
    labels: Vec<String>,
    mean: Array1<f64>,
    eigenvalues: Vec<f64>,
    /// One unit-length eigenface per row.
    eigenfaces: Array2<f64>,
    /// Training faces in eigenspace coordinates, one per row.
    projections: Array2<f64>,
    width: u32,
    height: u32,
    threshold: f64,
}

impl EigenModel {
    fn empty(threshold: f64) -> Self {
        let dim = (FACE_WIDTH * FACE_HEIGHT) as usize;
        Self {
            labels: Vec::new(),
            mean: Array1::zeros(dim),
            eigenvalues: Vec::new(),
            eigenfaces: Array2::zeros((0, dim)),
            projections: Array2::zeros((0, 0)),
            width: FACE_WIDTH,
            height: FACE_HEIGHT,
            threshold,
        }
    }

    /// Number of training faces.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of retained eigenfaces.
    pub fn components(&self) -> usize {
        self.eigenfaces.nrows()
    }

    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    pub fn eigenfaces(&self) -> &Array2<f64> {
        &self.eigenfaces
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Coordinates of a face in the eigenspace.
    pub fn project(&self, face: &ImageBuffer) -> Result<Array1<f64>, RecognizerError> {
        if (face.width(), face.height()) != (self.width, self.height) {
            return Err(RecognizerError::DimensionMismatch {
                expected: (self.width, self.height),
                actual: (face.width(), face.height()),
            });
        }
        let gray = face.to_grayscale();
        let centered: Array1<f64> = gray
            .data()
            .iter()
            .zip(self.mean.iter())
            .map(|(&p, &m)| p as f64 - m)
            .collect();
        Ok(self.eigenfaces.dot(&centered))
    }

    /// Nearest training face by eigenspace distance; the first of equal
    /// distances wins. Farther than the threshold means unknown.
    pub fn classify(&self, face: &ImageBuffer) -> Result<Classification, RecognizerError> {
        if self.labels.is_empty() {
            return Ok(Classification::unknown());
        }
        let coords = self.project(face)?;

        let mut best_idx = 0;
        let mut best_dist = f64::INFINITY;
        for (i, row) in self.projections.axis_iter(Axis(0)).enumerate() {
            let dist = row
                .iter()
                .zip(coords.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt();
            if dist < best_dist {
                best_dist = dist;
                best_idx = i;
            }
        }

        let accepted = self.threshold <= 0.0 || best_dist <= self.threshold;
        tracing::debug!(
            nearest = %self.labels[best_idx],
            distance = best_dist,
            accepted,
            "face classified"
        );

        Ok(Classification {
            label: accepted.then(|| self.labels[best_idx].clone()),
            distance: best_dist,
        })
    }
}
