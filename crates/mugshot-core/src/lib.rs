//! mugshot-core: face detection and recognition engine.
//!
//! Uses a Haar cascade for face detection and eigenfaces for recognition
//! against a small labeled corpus kept on disk.

pub mod annotate;
pub mod cascade;
pub mod config;
pub mod corpus;
pub mod detector;
pub mod image_buffer;
pub mod pipeline;
pub mod recognizer;
pub mod types;

pub use annotate::{AnnotateError, Annotator};
pub use cascade::HaarCascade;
pub use config::{Config, ConfigError};
pub use corpus::{CorpusError, FaceRecord, TrainingCorpus};
pub use detector::{DetectorConfig, DetectorError, FaceDetector};
pub use image_buffer::{ImageBuffer, ImageError, FACE_HEIGHT, FACE_WIDTH};
pub use pipeline::{PipelineError, RecognitionPipeline, RecognitionSummary};
pub use recognizer::{EigenModel, EigenfaceRecognizer, RecognizerConfig, RecognizerError, TermCriteria};
pub use types::{BoundingBox, Classification, FaceInfo, RecognitionResult};
