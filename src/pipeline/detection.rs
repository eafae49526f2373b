//! Detection gateway
//!
//! Reads the meter at a given offset of a source (video file or camera)
//! through an external digit-detection service.
//!
//! ## API Reference
//!
//! Request: `POST {DETECTION_URL}?api_key=...`
//! ```json
//! { "source": "static/sample.mp4", "offset_seconds": 12.5, "confidence": 0.05, "overlap": 0.5 }
//! ```
//! Returns: one prediction per detected glyph
//! ```json
//! { "predictions": [ { "x": 104.5, "class": "7", "confidence": 0.91 } ] }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::types::GatewayError;

/// Digits on the meter face
pub const READING_WIDTH: usize = 4;

/// Non-digit glyph classes the detector may report
const IGNORED_CLASSES: [&str; 2] = [".", "-"];

#[derive(Debug, Clone, Serialize)]
struct DetectionRequest<'a> {
    source: &'a str,
    offset_seconds: f64,
    confidence: f64,
    overlap: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResponse {
    #[serde(default)]
    pub predictions: Vec<Prediction>,
}

/// One detected glyph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub x: f64,
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f64,
}

/// A usable meter reading
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Assembled digit string, e.g. "1500"
    pub raw_text: String,
    pub reading: f64,
    pub offset_seconds: f64,
    pub num_detections: usize,
    pub avg_confidence: f64,
}

/// Source of raw meter readings
#[async_trait]
pub trait DetectionGateway: Send + Sync {
    async fn detect(
        &self,
        source_ref: &str,
        offset_seconds: f64,
        confidence: f64,
    ) -> Result<Detection, GatewayError>;
}

/// HTTP client for the digit-detection service
pub struct HttpDetectionGateway {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpDetectionGateway {
    pub fn new(url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        log::info!("✅ Initialized detection gateway");
        log::info!("   └─ Endpoint: {}", url);

        Ok(Self {
            client,
            url: url.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl DetectionGateway for HttpDetectionGateway {
    async fn detect(
        &self,
        source_ref: &str,
        offset_seconds: f64,
        confidence: f64,
    ) -> Result<Detection, GatewayError> {
        let mut request = self.client.post(&self.url).json(&DetectionRequest {
            source: source_ref,
            offset_seconds,
            confidence,
            overlap: 0.5,
        });
        if let Some(key) = &self.api_key {
            request = request.query(&[("api_key", key)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::Status(response.status().as_u16()));
        }

        let body: DetectionResponse = response.json().await?;
        log::debug!(
            "   Detected {} objects at {:.1}s",
            body.predictions.len(),
            offset_seconds
        );

        detection_from_predictions(&body.predictions, offset_seconds)
    }
}

/// Convert raw predictions into a typed reading
pub fn detection_from_predictions(
    predictions: &[Prediction],
    offset_seconds: f64,
) -> Result<Detection, GatewayError> {
    if predictions.is_empty() {
        return Err(GatewayError::NoDetections);
    }

    let raw_text = group_digits(predictions).ok_or(GatewayError::NoReading)?;
    let reading = raw_text
        .parse::<f64>()
        .map_err(|_| GatewayError::Malformed(format!("non-numeric reading '{}'", raw_text)))?;

    let avg_confidence =
        predictions.iter().map(|p| p.confidence).sum::<f64>() / predictions.len() as f64;

    Ok(Detection {
        raw_text,
        reading,
        offset_seconds,
        num_detections: predictions.len(),
        avg_confidence,
    })
}

/// Join glyphs left-to-right into a fixed-width reading
///
/// Separators are dropped; short readings are zero-padded on the left and
/// long ones truncated to [`READING_WIDTH`].
pub fn group_digits(predictions: &[Prediction]) -> Option<String> {
    let mut sorted: Vec<&Prediction> = predictions.iter().collect();
    sorted.sort_by(|a, b| a.x.total_cmp(&b.x));

    let digits: String = sorted
        .iter()
        .filter(|p| !IGNORED_CLASSES.contains(&p.class_name.as_str()))
        .map(|p| p.class_name.as_str())
        .collect();

    if digits.is_empty() {
        return None;
    }

    let mut reading = format!("{:0>width$}", digits, width = READING_WIDTH);
    if reading.chars().count() > READING_WIDTH {
        reading = reading.chars().take(READING_WIDTH).collect();
    }
    Some(reading)
}
