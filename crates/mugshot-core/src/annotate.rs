//! Draw detection boxes and identity labels onto a copy of the source image.

use crate::image_buffer::ImageBuffer;
use crate::types::BoundingBox;
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};
use thiserror::Error;

// --- Named constants ---
const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_COLOR: Rgb<u8> = Rgb([173, 216, 230]);
const BOX_THICKNESS: u32 = 2;
/// Labels sit this many pixels up and left of the box corner.
const LABEL_OFFSET: i32 = 2;
pub const DEFAULT_TEXT_SCALE: f32 = 16.0;

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("font file not readable at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not a TrueType/OpenType font: {}", .0.display())]
    InvalidFont(PathBuf),
}

/// Box and label renderer. Without a font only boxes are drawn.
pub struct Annotator {
    font: Option<FontVec>,
    text_scale: f32,
}

impl std::fmt::Debug for Annotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Annotator")
            .field("font", &self.font.is_some())
            .field("text_scale", &self.text_scale)
            .finish()
    }
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new(None, DEFAULT_TEXT_SCALE)
    }
}

impl Annotator {
    pub fn new(font: Option<FontVec>, text_scale: f32) -> Self {
        Self { font, text_scale }
    }

    /// Load a font from disk and build an annotator around it.
    pub fn from_font_file(path: &Path, text_scale: f32) -> Result<Self, AnnotateError> {
        let bytes = std::fs::read(path).map_err(|source| AnnotateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let font = FontVec::try_from_vec(bytes).map_err(|_| AnnotateError::InvalidFont(path.to_path_buf()))?;
        tracing::info!(path = %path.display(), "label font loaded");
        Ok(Self::new(Some(font), text_scale))
    }

    /// Render every box, and its label when one is given, on an RGB copy of `image`.
    pub fn annotate(&self, image: &ImageBuffer, faces: &[(BoundingBox, Option<&str>)]) -> ImageBuffer {
        let mut canvas = image.to_rgb_image();
        for (bbox, label) in faces {
            draw_box(&mut canvas, bbox);
            let Some(text) = label.filter(|t| !t.is_empty()) else {
                continue;
            };
            match &self.font {
                Some(font) => {
                    let x = bbox.x as i32 - LABEL_OFFSET;
                    let y = bbox.y as i32 - LABEL_OFFSET - self.text_scale.ceil() as i32;
                    draw_text_mut(&mut canvas, LABEL_COLOR, x, y, PxScale::from(self.text_scale), font, text);
                }
                None => tracing::debug!(label = text, "no font configured, label not drawn"),
            }
        }
        ImageBuffer::from(canvas)
    }
}

fn draw_box(canvas: &mut RgbImage, bbox: &BoundingBox) {
    for inset in 0..BOX_THICKNESS {
        let (w, h) = (bbox.width.saturating_sub(2 * inset), bbox.height.saturating_sub(2 * inset));
        if w == 0 || h == 0 {
            break;
        }
        let rect = Rect::at((bbox.x + inset) as i32, (bbox.y + inset) as i32).of_size(w, h);
        draw_hollow_rect_mut(canvas, rect, BOX_COLOR);
    }
}
