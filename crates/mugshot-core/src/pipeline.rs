//! Recognition pipeline: source image → detection → per-face classification →
//! biographical lookup → annotated image.
//!
//! Owns the detector, annotator and training corpus. The eigenspace model is
//! trained lazily and retrained on the first classification after the corpus
//! changes.

use crate::annotate::{AnnotateError, Annotator};
use crate::config::Config;
use crate::corpus::{CorpusError, TrainingCorpus};
use crate::detector::{DetectorError, FaceDetector};
use crate::image_buffer::{ImageBuffer, ImageError};
use crate::recognizer::{EigenModel, EigenfaceRecognizer, RecognizerConfig, RecognizerError};
use crate::types::{BoundingBox, Classification, FaceInfo, RecognitionResult};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Width every source image is scaled to before detection.
pub const DEFAULT_SOURCE_WIDTH: u32 = 500;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no source image set")]
    NoImage,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("{0}")]
    Corpus(#[from] CorpusError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("image error: {0}")]
    Image(#[from] ImageError),
    #[error("annotation error: {0}")]
    Annotate(#[from] AnnotateError),
}

/// Outcome of one recognition pass over the current image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionSummary {
    pub face_count: usize,
    /// Record of the last detected face; empty when there is none or it is unknown.
    pub primary: FaceInfo,
    pub faces: Vec<RecognitionResult>,
}

pub struct RecognitionPipeline {
    detector: FaceDetector,
    annotator: Annotator,
    corpus: TrainingCorpus,
    recognizer: EigenfaceRecognizer,
    source_width: u32,
    current: Option<ImageBuffer>,
    annotated: Option<ImageBuffer>,
    model: Option<EigenModel>,
    /// Corpus generation the cached model was trained on.
    model_generation: u64,
}

impl RecognitionPipeline {
    pub fn new(
        detector: FaceDetector,
        annotator: Annotator,
        corpus: TrainingCorpus,
        recognizer: RecognizerConfig,
    ) -> Self {
        Self {
            detector,
            annotator,
            corpus,
            recognizer: EigenfaceRecognizer::new(recognizer),
            source_width: DEFAULT_SOURCE_WIDTH,
            current: None,
            annotated: None,
            model: None,
            model_generation: 0,
        }
    }

    /// Width source images are scaled to by [`set_image`](Self::set_image).
    pub fn with_source_width(mut self, width: u32) -> Self {
        self.source_width = width.max(1);
        self
    }

    /// Load the cascade, label font and corpus named by `config`.
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let detector = FaceDetector::load(&config.cascade_path, config.detector.clone())?;
        let annotator = match &config.font_path {
            Some(path) => Annotator::from_font_file(path, config.text_scale)?,
            None => Annotator::new(None, config.text_scale),
        };
        let corpus = TrainingCorpus::load(&config.corpus_dir, &config.metadata_file)?;
        Ok(Self::new(detector, annotator, corpus, config.recognizer.clone()).with_source_width(config.source_width))
    }

    /// Replace the source image, scaled to the configured width.
    pub fn set_image(&mut self, image: ImageBuffer) {
        let resized = image.resize_to_width(self.source_width);
        tracing::debug!(
            width = resized.width(),
            height = resized.height(),
            brightness = resized.avg_brightness(),
            "source image set"
        );
        self.annotated = Some(resized.clone());
        self.current = Some(resized);
    }

    pub fn current_image(&self) -> Option<&ImageBuffer> {
        self.current.as_ref()
    }

    /// Source image with boxes and labels from the last recognition pass.
    pub fn annotated_image(&self) -> Option<&ImageBuffer> {
        self.annotated.as_ref()
    }

    /// Detect, classify and annotate every face in the current image, in
    /// detector order.
    pub fn recognize(&mut self) -> Result<Vec<RecognitionResult>, PipelineError> {
        let image = self.current.as_ref().ok_or(PipelineError::NoImage)?;
        let boxes = self.detector.detect(image);
        let faces = normalized_crops(image, &boxes)?;

        let classifications: Vec<Option<Classification>> = if self.corpus.is_empty() {
            vec![None; boxes.len()]
        } else {
            let model = self.current_model()?;
            faces
                .iter()
                .map(|face| model.classify(face).map(Some))
                .collect::<Result<_, _>>()?
        };

        let mut results = Vec::with_capacity(boxes.len());
        for (bbox, classification) in boxes.iter().zip(classifications) {
            let label = classification.as_ref().and_then(|c| c.label.clone());
            let info = match &label {
                Some(l) => self.corpus.get_or_create(l).clone(),
                None => FaceInfo::default(),
            };
            results.push(RecognitionResult {
                bbox: *bbox,
                label,
                distance: classification.map(|c| c.distance),
                info,
            });
        }

        let image = self.current.as_ref().ok_or(PipelineError::NoImage)?;
        let marks: Vec<(BoundingBox, Option<&str>)> = results
            .iter()
            .map(|r| (r.bbox, r.label.as_deref()))
            .collect();
        self.annotated = Some(self.annotator.annotate(image, &marks));

        tracing::debug!(
            faces = results.len(),
            recognized = results.iter().filter(|r| r.label.is_some()).count(),
            "recognition pass complete"
        );
        Ok(results)
    }

    /// [`recognize`](Self::recognize), reduced to the face count and the
    /// record of the last detected face.
    pub fn recognize_faces(&mut self) -> Result<RecognitionSummary, PipelineError> {
        let faces = self.recognize()?;
        let primary = faces.last().map(|r| r.info.clone()).unwrap_or_default();
        Ok(RecognitionSummary {
            face_count: faces.len(),
            primary,
            faces,
        })
    }

    /// Normalized crops of every detected face, without classification.
    pub fn detected_faces(&self) -> Result<Vec<ImageBuffer>, PipelineError> {
        let image = self.current.as_ref().ok_or(PipelineError::NoImage)?;
        let boxes = self.detector.detect(image);
        Ok(normalized_crops(image, &boxes)?)
    }

    /// Store a labeled face in the corpus.
    pub fn add_face(&mut self, label: &str, face: &ImageBuffer) -> Result<PathBuf, PipelineError> {
        let path = self.corpus.add_face(label, face)?;
        self.model = None;
        Ok(path)
    }

    /// Biographical record for `label`, created empty if unknown.
    pub fn lookup(&mut self, label: &str) -> FaceInfo {
        self.corpus.get_or_create(label).clone()
    }

    pub fn corpus(&self) -> &TrainingCorpus {
        &self.corpus
    }

    pub fn corpus_mut(&mut self) -> &mut TrainingCorpus {
        &mut self.corpus
    }

    pub fn detector(&self) -> &FaceDetector {
        &self.detector
    }

    /// The cached eigenspace model, if one has been trained for the current corpus.
    pub fn model(&self) -> Option<&EigenModel> {
        self.model
            .as_ref()
            .filter(|_| self.model_generation == self.corpus.generation())
    }

    /// Model for the current corpus, retrained when the corpus changed.
    fn current_model(&mut self) -> Result<&EigenModel, RecognizerError> {
        let generation = self.corpus.generation();
        if self.model_generation != generation {
            self.model = None;
        }
        let model = match self.model.take() {
            Some(model) => model,
            None => {
                let model = self.recognizer.train(&self.corpus)?;
                tracing::debug!(
                    generation,
                    components = model.components(),
                    threshold = model.threshold(),
                    "model retrained for corpus"
                );
                model
            }
        };
        self.model_generation = generation;
        Ok(self.model.insert(model))
    }
}

fn normalized_crops(image: &ImageBuffer, boxes: &[BoundingBox]) -> Result<Vec<ImageBuffer>, ImageError> {
    boxes
        .iter()
        .map(|bbox| Ok(image.crop(bbox)?.normalize_face()))
        .collect()
}
