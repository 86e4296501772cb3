use serde::{Deserialize, Serialize};

/// Bounding box of a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Whether the box lies fully inside a `width` × `height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0 && self.height > 0 && self.right() <= width && self.bottom() <= height
    }

    /// Center point as floating-point coordinates.
    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }
}

/// Biographical record for one identity label.
///
/// Every field except `label` is free text and defaults to empty when unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceInfo {
    pub label: String,
    pub first_name: String,
    pub last_name: String,
    pub age: String,
    pub sex: String,
    pub glasses: String,
    pub skin_color: String,
    pub beard: String,
    pub hair_size: String,
}

impl FaceInfo {
    /// Empty record for `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Whether any field besides the label carries information.
    pub fn has_details(&self) -> bool {
        self.fields()[1..].iter().any(|f| !f.is_empty())
    }

    /// All nine fields in metadata-file order.
    pub fn fields(&self) -> [&str; 9] {
        [
            &self.label,
            &self.first_name,
            &self.last_name,
            &self.age,
            &self.sex,
            &self.glasses,
            &self.skin_color,
            &self.beard,
            &self.hair_size,
        ]
    }
}

/// Outcome of classifying one face against an eigenspace model.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Label of the nearest training face, or `None` when unrecognized.
    pub label: Option<String>,
    /// Euclidean distance in eigenspace to the nearest training face.
    pub distance: f64,
}

impl Classification {
    /// Result for an empty corpus.
    pub fn unknown() -> Self {
        Self {
            label: None,
            distance: f64::INFINITY,
        }
    }
}

/// Recognition outcome for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionResult {
    pub bbox: BoundingBox,
    /// Assigned label; `None` when unknown or when the corpus is empty.
    pub label: Option<String>,
    /// Eigenspace distance to the nearest training face (`None` when not classified).
    pub distance: Option<f64>,
    /// Resolved record; empty when unknown.
    pub info: FaceInfo,
}
