// src/manual.rs

//! Manual fields: their region is known exactly, so the value is read by
//! cropping that region and running OCR on it directly.

use crate::model::{Bounds, FieldReference};
use crate::ocr::{OcrLine, TextRecognizer};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const STANDARD_UPSCALE: u32 = 2;
const ALTERNATE_UPSCALE: u32 = 3;

/// Integer crop rectangle guaranteed to lie inside the image and be at least 1×1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelCrop {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelCrop {
    /// `left/top` clamp to `[0, dim - 1]`, `right/bottom` to `[left + 1, dim]`.
    pub fn clamped(bounds: &Bounds, image_width: u32, image_height: u32) -> Option<Self> {
        let finite = [bounds.left, bounds.top, bounds.width, bounds.height]
            .iter()
            .all(|v| v.is_finite());
        if !finite || image_width == 0 || image_height == 0 {
            return None;
        }
        let (w, h) = (f64::from(image_width), f64::from(image_height));
        let left = bounds.left.floor().clamp(0.0, w - 1.0);
        let top = bounds.top.floor().clamp(0.0, h - 1.0);
        let right = bounds.right().ceil().clamp(left + 1.0, w);
        let bottom = bounds.bottom().ceil().clamp(top + 1.0, h);
        Some(Self {
            x: left as u32,
            y: top as u32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        })
    }
}

/// Grayscale, min/max contrast stretch, 2× Lanczos upscale.
pub fn standard_preprocess(region: &DynamicImage) -> DynamicImage {
    let stretched = contrast_stretch(&region.to_luma8());
    let (w, h) = stretched.dimensions();
    DynamicImage::ImageLuma8(imageops::resize(
        &stretched,
        w * STANDARD_UPSCALE,
        h * STANDARD_UPSCALE,
        FilterType::Lanczos3,
    ))
}

/// Grayscale, 3× upscale, binarised at the midpoint of the intensity range.
pub fn alternate_preprocess(region: &DynamicImage) -> DynamicImage {
    let gray = region.to_luma8();
    let (w, h) = gray.dimensions();
    let upscaled = imageops::resize(
        &gray,
        w * ALTERNATE_UPSCALE,
        h * ALTERNATE_UPSCALE,
        FilterType::CatmullRom,
    );
    let (min, max) = intensity_range(&upscaled);
    let threshold = ((u16::from(min) + u16::from(max)) / 2) as u8;
    let mut binary = upscaled;
    for pixel in binary.pixels_mut() {
        pixel[0] = if pixel[0] > threshold { 255 } else { 0 };
    }
    DynamicImage::ImageLuma8(binary)
}

fn intensity_range(image: &GrayImage) -> (u8, u8) {
    image
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])))
}

fn contrast_stretch(image: &GrayImage) -> GrayImage {
    let (min, max) = intensity_range(image);
    if max <= min {
        return image.clone();
    }
    let scale = 255.0 / f32::from(max - min);
    let mut output = image.clone();
    for pixel in output.pixels_mut() {
        pixel[0] = (f32::from(pixel[0] - min) * scale).round() as u8;
    }
    output
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualReading {
    pub text: String,
    pub confidence: f64,
    pub engine: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ManualOutcome {
    Read(ManualReading),
    /// Neither engine returned any text for the region.
    Unreadable,
    /// The reference box has non-finite coordinates or the page is empty.
    InvalidGeometry,
}

/// Reads manual fields with a primary engine and an optional fallback.
pub struct ManualFieldReader<'a> {
    primary: &'a dyn TextRecognizer,
    fallback: Option<&'a dyn TextRecognizer>,
}

impl<'a> ManualFieldReader<'a> {
    pub fn new(primary: &'a dyn TextRecognizer, fallback: Option<&'a dyn TextRecognizer>) -> Self {
        Self { primary, fallback }
    }

    pub async fn read(&self, page: &DynamicImage, field: &FieldReference) -> ManualOutcome {
        let (width, height) = page.dimensions();
        let Some(crop) = PixelCrop::clamped(&field.bounds, width, height) else {
            return ManualOutcome::InvalidGeometry;
        };
        let region = page.crop_imm(crop.x, crop.y, crop.width, crop.height);

        match self.primary.recognize(&standard_preprocess(&region)).await {
            Ok(lines) => {
                if let Some(reading) = join_lines(&lines, self.primary.name()) {
                    return ManualOutcome::Read(reading);
                }
                debug!(field = %field.field_name, "Primary OCR returned no text");
            }
            Err(e) => {
                warn!(field = %field.field_name, error = %e, "Primary OCR failed on manual field")
            }
        }

        let Some(fallback) = self.fallback else {
            return ManualOutcome::Unreadable;
        };
        match fallback.recognize(&alternate_preprocess(&region)).await {
            Ok(lines) => join_lines(&lines, fallback.name())
                .map_or(ManualOutcome::Unreadable, ManualOutcome::Read),
            Err(e) => {
                warn!(field = %field.field_name, error = %e, "Fallback OCR failed on manual field");
                ManualOutcome::Unreadable
            }
        }
    }
}

/// Non-empty lines in reading order (top, then left), joined by spaces.
fn join_lines(lines: &[OcrLine], engine: &str) -> Option<ManualReading> {
    let mut kept: Vec<(f64, f64, &OcrLine)> = lines
        .iter()
        .filter(|l| !l.text.trim().is_empty())
        .map(|l| {
            let top = l.points.iter().map(|p| p[1]).fold(f64::INFINITY, f64::min);
            let left = l.points.iter().map(|p| p[0]).fold(f64::INFINITY, f64::min);
            (top, left, l)
        })
        .collect();
    if kept.is_empty() {
        return None;
    }
    kept.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));

    let text = kept
        .iter()
        .map(|(_, _, l)| l.text.trim())
        .collect::<Vec<_>>()
        .join(" ");
    let confidence = kept.iter().map(|(_, _, l)| l.confidence).sum::<f64>() / kept.len() as f64;
    Some(ManualReading {
        text,
        confidence,
        engine: engine.to_string(),
    })
}
