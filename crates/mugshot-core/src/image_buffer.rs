//! Raster image container: crop, bicubic resize, grayscale reduction.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};
use std::path::Path;
use thiserror::Error;

/// Width of a normalized corpus face.
pub const FACE_WIDTH: u32 = 92;
/// Height of a normalized corpus face.
pub const FACE_HEIGHT: u32 = 112;

// ITU-R BT.601 luma weights.
const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image dimensions are zero")]
    ZeroDimensions,
    #[error("unsupported channel count: {0} (expected 1 or 3)")]
    UnsupportedChannels(u8),
    #[error("pixel buffer has {actual} bytes, expected {expected}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("crop {bbox:?} out of bounds for {width}x{height} image")]
    CropOutOfBounds {
        bbox: BoundingBox,
        width: u32,
        height: u32,
    },
    #[error("codec: {0}")]
    Codec(#[from] image::ImageError),
}

/// Row-major interleaved 8-bit raster, grayscale (1 channel) or RGB (3 channels).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    width: u32,
    height: u32,
    channels: u8,
    data: Vec<u8>,
}

impl ImageBuffer {
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Result<Self, ImageError> {
        if width == 0 || height == 0 {
            return Err(ImageError::ZeroDimensions);
        }
        if channels != 1 && channels != 3 {
            return Err(ImageError::UnsupportedChannels(channels));
        }
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(ImageError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Grayscale image filled with a single intensity.
    pub fn filled_gray(width: u32, height: u32, value: u8) -> Result<Self, ImageError> {
        Self::new(width, height, 1, vec![value; width as usize * height as usize])
    }

    /// Decode an image file. Grayscale sources stay single-channel; everything
    /// else is reduced to 8-bit RGB.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let img = image::open(path.as_ref())?;
        Ok(Self::from_dynamic(img))
    }

    /// Encode to `path`; the format follows the file extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        match self.channels {
            1 => self.to_gray_image().save(path.as_ref())?,
            _ => self.to_rgb_image().save(path.as_ref())?,
        }
        Ok(())
    }

    pub fn from_dynamic(img: DynamicImage) -> Self {
        if img.color().has_color() {
            Self::from(img.to_rgb8())
        } else {
            Self::from(img.to_luma8())
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn is_grayscale(&self) -> bool {
        self.channels == 1
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Average pixel intensity (0.0–255.0) over all channels.
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Reduce to a single luma channel. Grayscale input is returned unchanged.
    pub fn to_grayscale(&self) -> ImageBuffer {
        if self.is_grayscale() {
            return self.clone();
        }
        let data = self
            .data
            .chunks_exact(3)
            .map(|px| {
                let y = LUMA_R * px[0] as f32 + LUMA_G * px[1] as f32 + LUMA_B * px[2] as f32;
                y.round().clamp(0.0, 255.0) as u8
            })
            .collect();
        ImageBuffer {
            width: self.width,
            height: self.height,
            channels: 1,
            data,
        }
    }

    /// Copy out the region covered by `bbox`, which must lie fully inside the image.
    pub fn crop(&self, bbox: &BoundingBox) -> Result<ImageBuffer, ImageError> {
        if !bbox.fits_within(self.width, self.height) {
            return Err(ImageError::CropOutOfBounds {
                bbox: *bbox,
                width: self.width,
                height: self.height,
            });
        }
        let ch = self.channels as usize;
        let stride = self.width as usize * ch;
        let row_len = bbox.width as usize * ch;
        let mut data = Vec::with_capacity(row_len * bbox.height as usize);
        for y in bbox.y..bbox.bottom() {
            let start = y as usize * stride + bbox.x as usize * ch;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }
        Ok(ImageBuffer {
            width: bbox.width,
            height: bbox.height,
            channels: self.channels,
            data,
        })
    }

    /// Bicubic (Catmull-Rom) resample to exactly `width` × `height`.
    pub fn resize(&self, width: u32, height: u32) -> ImageBuffer {
        let width = width.max(1);
        let height = height.max(1);
        if width == self.width && height == self.height {
            return self.clone();
        }
        match self.channels {
            1 => Self::from(image::imageops::resize(
                &self.to_gray_image(),
                width,
                height,
                FilterType::CatmullRom,
            )),
            _ => Self::from(image::imageops::resize(
                &self.to_rgb_image(),
                width,
                height,
                FilterType::CatmullRom,
            )),
        }
    }

    /// Aspect-preserving bicubic resize to the given width.
    pub fn resize_to_width(&self, width: u32) -> ImageBuffer {
        let scale = width as f64 / self.width as f64;
        let height = (self.height as f64 * scale).round().max(1.0) as u32;
        self.resize(width, height)
    }

    /// Grayscale 92×112, the layout every corpus face uses.
    pub fn normalize_face(&self) -> ImageBuffer {
        self.to_grayscale().resize(FACE_WIDTH, FACE_HEIGHT)
    }

    /// Whether this buffer already has the normalized face layout.
    pub fn is_normalized_face(&self) -> bool {
        self.is_grayscale() && self.width == FACE_WIDTH && self.height == FACE_HEIGHT
    }

    pub fn to_gray_image(&self) -> GrayImage {
        let gray = self.to_grayscale();
        // Dimensions and length are validated at construction.
        GrayImage::from_raw(gray.width, gray.height, gray.data)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        let data = if self.is_grayscale() {
            self.data.iter().flat_map(|&v| [v, v, v]).collect()
        } else {
            self.data.clone()
        };
        RgbImage::from_raw(self.width, self.height, data)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }
}

impl From<GrayImage> for ImageBuffer {
    fn from(img: GrayImage) -> Self {
        let (width, height) = img.dimensions();
        ImageBuffer {
            width,
            height,
            channels: 1,
            data: img.into_raw(),
        }
    }
}

impl From<RgbImage> for ImageBuffer {
    fn from(img: RgbImage) -> Self {
        let (width, height) = img.dimensions();
        ImageBuffer {
            width,
            height,
            channels: 3,
            data: img.into_raw(),
        }
    }
}
