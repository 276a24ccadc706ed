// src/ocr.rs

use crate::model::{Bounds, DetectedBox};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info};

/// One recognised text line as produced by an OCR engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrLine {
    /// Polygon corners in image pixels.
    pub points: Vec<[f64; 2]>,
    pub text: String,
    #[serde(default)]
    pub confidence: f64,
}

impl OcrLine {
    /// Axis-aligned box around the polygon; `None` for empty text or an
    /// empty / non-finite polygon.
    pub fn to_detected_box(&self) -> Option<DetectedBox> {
        if self.points.is_empty() {
            return None;
        }
        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for [x, y] in &self.points {
            if !x.is_finite() || !y.is_finite() {
                return None;
            }
            min_x = min_x.min(*x);
            min_y = min_y.min(*y);
            max_x = max_x.max(*x);
            max_y = max_y.max(*y);
        }
        DetectedBox::new(
            &self.text,
            self.confidence,
            Bounds::new(min_x, min_y, max_x - min_x, max_y - min_y),
        )
    }
}

/// Detected boxes in detection order, dropping lines without text or geometry.
pub fn detected_boxes(lines: &[OcrLine]) -> Vec<DetectedBox> {
    lines.iter().filter_map(OcrLine::to_detected_box).collect()
}

/// Errors from an OCR collaborator.
#[derive(Debug)]
pub enum OcrError {
    /// The image could not be encoded for transport.
    Encode(String),
    /// The request never got a response.
    Transport(String),
    /// The engine answered with a non-success status.
    Status { status: u16, body: String },
    /// The response body was not the expected JSON.
    Decode(String),
}

impl fmt::Display for OcrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrError::Encode(msg) => write!(f, "Failed to encode image for OCR: {msg}"),
            OcrError::Transport(msg) => write!(f, "OCR request failed: {msg}"),
            OcrError::Status { status, body } => write!(f, "OCR engine error {status}: {body}"),
            OcrError::Decode(msg) => write!(f, "Failed to decode OCR response: {msg}"),
        }
    }
}

impl std::error::Error for OcrError {}

/// An engine turning an image into recognised lines.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    fn name(&self) -> &str;

    async fn recognize(&self, image: &DynamicImage) -> Result<Vec<OcrLine>, OcrError>;
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    lines: Vec<OcrLine>,
}

/// OCR engine reached over HTTP: the PNG-encoded image is POSTed and the
/// engine answers `{"lines": [{"points": [[x, y], ...], "text": ..., "confidence": ...}]}`.
pub struct HttpRecognizer {
    name: String,
    endpoint: String,
    timeout: Duration,
    client: Client,
}

impl HttpRecognizer {
    pub fn new(name: &str, endpoint: &str, timeout: Duration) -> Self {
        info!(name, endpoint, "Using HTTP OCR engine");
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            timeout,
            client: Client::new(),
        }
    }
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, OcrError> {
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, ImageFormat::Png)
        .map_err(|e| OcrError::Encode(e.to_string()))?;
    Ok(bytes.into_inner())
}

#[async_trait]
impl TextRecognizer for HttpRecognizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recognize(&self, image: &DynamicImage) -> Result<Vec<OcrLine>, OcrError> {
        let body = encode_png(image)?;
        debug!(engine = %self.name, bytes = body.len(), "Sending image to OCR engine");

        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "image/png")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| OcrError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(OcrError::Status { status, body });
        }

        let parsed: OcrResponse = response
            .json()
            .await
            .map_err(|e| OcrError::Decode(e.to_string()))?;
        debug!(engine = %self.name, lines = parsed.lines.len(), "OCR engine answered");
        Ok(parsed.lines)
    }
}
