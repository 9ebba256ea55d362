//! Person-detection payload decoding.
//!
//! Sensors publish:
//! `{ "detections": [{ "id", "x", "y", "confidence", ... }], "totalPeople", "avgConfidence", "fps", "zones" }`
//!
//! Decoding is tolerant per detection (missing fields get placeholders) but
//! strict about the overall shape: a payload that is not UTF-8, not JSON, or
//! not an object with a `detections` array of objects is rejected whole.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{IngestError, IngestResult};

/// Placeholder for a missing id or attribute.
pub const UNKNOWN: &str = "unknown";

/// Characters of payload text kept in log previews.
pub const PREVIEW_CHARS: usize = 100;

/// One reported person sighting, in source-frame pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub id: String,
    pub x: f64,
    pub y: f64,
    /// Always within [0, 1].
    pub confidence: f64,
    /// Open attribute map (age_group, gender, ...).
    pub attributes: BTreeMap<String, String>,
}

impl Detection {
    pub fn new(id: impl Into<String>, x: f64, y: f64, confidence: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            confidence: clamp_confidence(confidence),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Attribute value, or `"unknown"` when the sensor did not report it.
    pub fn attribute(&self, key: &str) -> &str {
        self.attributes.get(key).map(String::as_str).unwrap_or(UNKNOWN)
    }
}

/// The decoded contents of one transport message.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionBatch {
    pub detections: Vec<Detection>,
    /// Every other top-level field, passed through unmodified.
    pub summary: Map<String, Value>,
}

impl DetectionBatch {
    pub fn total_people(&self) -> Option<u64> {
        self.summary.get("totalPeople").and_then(Value::as_u64)
    }

    pub fn avg_confidence(&self) -> Option<f64> {
        self.summary.get("avgConfidence").and_then(Value::as_f64)
    }

    pub fn fps(&self) -> Option<f64> {
        self.summary.get("fps").and_then(Value::as_f64)
    }

    pub fn zones(&self) -> Option<u64> {
        self.summary.get("zones").and_then(Value::as_u64)
    }
}

#[derive(Debug, Deserialize)]
struct WireBatch {
    #[serde(default)]
    detections: Vec<WireDetection>,

    #[serde(flatten)]
    summary: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    /// Some sensors send numeric ids.
    #[serde(default)]
    id: Option<Value>,

    #[serde(default)]
    x: Option<f64>,

    #[serde(default)]
    y: Option<f64>,

    #[serde(default)]
    confidence: Option<f64>,

    /// Nested attribute object used by newer firmware.
    #[serde(default)]
    attributes: Option<Map<String, Value>>,

    /// Flat attributes used by older firmware (age_group, gender, ...).
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<WireDetection> for Detection {
    fn from(wire: WireDetection) -> Self {
        let id = match wire.id {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => UNKNOWN.to_string(),
        };

        let mut attributes = BTreeMap::new();
        let nested = wire.attributes.into_iter().flatten();
        for (key, value) in wire.extra.into_iter().chain(nested) {
            if let Some(value) = attribute_value(value) {
                attributes.insert(key, value);
            }
        }

        Self {
            id,
            x: wire.x.unwrap_or(0.0),
            y: wire.y.unwrap_or(0.0),
            confidence: clamp_confidence(wire.confidence.unwrap_or(0.0)),
            attributes,
        }
    }
}

fn attribute_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        return 0.0;
    }
    confidence.clamp(0.0, 1.0)
}

/// Decode raw payload bytes as UTF-8 text.
pub fn decode_text(payload: &[u8]) -> IngestResult<&str> {
    std::str::from_utf8(payload).map_err(|_| IngestError::Decode {
        preview: preview(&String::from_utf8_lossy(payload)),
    })
}

/// Parse payload text into a detection batch.
pub fn parse_batch(text: &str) -> IngestResult<DetectionBatch> {
    let wire: WireBatch = serde_json::from_str(text).map_err(|e| IngestError::MalformedPayload {
        reason: e.to_string(),
        raw: text.to_string(),
    })?;

    Ok(DetectionBatch {
        detections: wire.detections.into_iter().map(Detection::from).collect(),
        summary: wire.summary,
    })
}

/// Decode and parse a raw transport payload.
pub fn decode_payload(payload: &[u8]) -> IngestResult<DetectionBatch> {
    parse_batch(decode_text(payload)?)
}

/// First `PREVIEW_CHARS` characters of `text`, with `...` when truncated.
pub fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Five-person batch for exercising the pipeline without a live sensor.
pub fn demo_batch() -> DetectionBatch {
    let detections = vec![
        Detection::new("P001", 100.0, 120.0, 0.95),
        Detection::new("P002", 300.0, 200.0, 0.87),
        Detection::new("P003", 500.0, 150.0, 0.92),
        Detection::new("P004", 200.0, 350.0, 0.88),
        Detection::new("P005", 450.0, 400.0, 0.91),
    ];

    let mut summary = Map::new();
    summary.insert("totalPeople".to_string(), Value::from(5));
    summary.insert("avgConfidence".to_string(), Value::from(0.89));
    summary.insert("fps".to_string(), Value::from(30.0));
    summary.insert("zones".to_string(), Value::from(4));

    DetectionBatch {
        detections,
        summary,
    }
}
