//! Document model for the event stream.
//!
//! Every frame on the bus carries one [`Document`]: a fixed envelope with the
//! kind, the run it belongs to, a sequence number, a timestamp and a free-form
//! payload. The payload is decoded into a typed [`DocumentBody`] for dispatch.
//!
//! ```text
//! RunStart (1)
//!    │
//!    ├── Descriptor (1+)
//!    │       │
//!    │       └── DataEvent (N)  ──► Analysis | Error (1 each, derived)
//!    │
//! RunStop (1)
//! ```

use super::calibration::Calibration;
use super::frame::{DarkFrame, ImageFrame, MaskFrame};
use crate::error::{DocumentError, RunError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current time as float seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Kind of a document on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentKind {
    RunStart,
    Descriptor,
    DataEvent,
    RunStop,
    Analysis,
    Error,
}

impl DocumentKind {
    pub fn name(&self) -> &'static str {
        match self {
            DocumentKind::RunStart => "RunStart",
            DocumentKind::Descriptor => "Descriptor",
            DocumentKind::DataEvent => "DataEvent",
            DocumentKind::RunStop => "RunStop",
            DocumentKind::Analysis => "Analysis",
            DocumentKind::Error => "Error",
        }
    }

    /// Derived kinds are produced by this server and never reprocessed.
    pub fn is_derived(&self) -> bool {
        matches!(self, DocumentKind::Analysis | DocumentKind::Error)
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub kind: DocumentKind,
    pub run_id: Uuid,
    pub sequence_number: u64,
    pub timestamp: f64,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Document {
    /// Create a document stamped with the current time.
    pub fn new(kind: DocumentKind, run_id: Uuid, sequence_number: u64) -> Self {
        Self {
            kind,
            run_id,
            sequence_number,
            timestamp: now_secs(),
            payload: Map::new(),
        }
    }

    /// Replace the payload with a serialisable value. Non-object values are
    /// stored under `"value"`.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, DocumentError> {
        match serde_json::to_value(payload).map_err(DocumentError::Encode)? {
            Value::Object(map) => self.payload = map,
            other => {
                self.payload = Map::new();
                self.payload.insert("value".to_string(), other);
            }
        }
        Ok(self)
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Decode from a relay frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DocumentError> {
        serde_json::from_slice(bytes).map_err(DocumentError::Decode)
    }

    /// Encode into a relay frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DocumentError> {
        serde_json::to_vec(self).map_err(DocumentError::Encode)
    }

    /// Decode the payload into the typed body for this document's kind.
    pub fn body(&self) -> Result<DocumentBody, RunError> {
        self.clone().into_body()
    }

    /// Consuming variant of [`Document::body`]; avoids copying large payloads.
    pub fn into_body(self) -> Result<DocumentBody, RunError> {
        let (run_id, kind) = (self.run_id, self.kind);
        let invalid = |source| RunError::InvalidPayload {
            run_id,
            kind,
            source,
        };
        let payload = Value::Object(self.payload);
        Ok(match kind {
            DocumentKind::RunStart => {
                DocumentBody::RunStart(serde_json::from_value(payload).map_err(invalid)?)
            }
            DocumentKind::Descriptor => {
                DocumentBody::Descriptor(serde_json::from_value(payload).map_err(invalid)?)
            }
            DocumentKind::DataEvent => {
                DocumentBody::DataEvent(serde_json::from_value(payload).map_err(invalid)?)
            }
            DocumentKind::RunStop => {
                DocumentBody::RunStop(serde_json::from_value(payload).map_err(invalid)?)
            }
            DocumentKind::Analysis => DocumentBody::Analysis,
            DocumentKind::Error => DocumentBody::Error,
        })
    }
}

/// Typed payload, one variant per document kind.
#[derive(Debug, Clone)]
pub enum DocumentBody {
    RunStart(RunStartPayload),
    Descriptor(DescriptorPayload),
    DataEvent(EventPayload),
    RunStop(RunStopPayload),
    Analysis,
    Error,
}

/// Configuration fields a run may carry in its start or descriptor documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSettings {
    #[serde(default, alias = "calibration_md", skip_serializing_if = "Option::is_none")]
    pub calibration: Option<Calibration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dark_frame: Option<DarkFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<MaskFrame>,
    #[serde(default, alias = "bg_scale", skip_serializing_if = "Option::is_none")]
    pub background_scale: Option<f64>,
    #[serde(default, alias = "composition_str", skip_serializing_if = "Option::is_none")]
    pub composition: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStartPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_name: Option<String>,
    #[serde(flatten)]
    pub settings: RunSettings,
    /// Per-run overrides of the server's pipeline settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_config: Option<Value>,
    /// Everything else in the start document.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Schema entry for one event field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// "number", "integer", "string" or "array".
    pub dtype: String,
    #[serde(default)]
    pub shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

impl DataKey {
    pub fn image(rows: usize, cols: usize) -> Self {
        Self {
            dtype: "array".to_string(),
            shape: vec![rows, cols],
            source: None,
            units: None,
        }
    }

    pub fn scalar(units: &str) -> Self {
        Self {
            dtype: "number".to_string(),
            shape: Vec::new(),
            source: None,
            units: Some(units.to_string()),
        }
    }

    pub fn is_image(&self) -> bool {
        self.dtype == "array" && self.shape.len() == 2
    }
}

/// Stream whose events carry images.
pub const PRIMARY_STREAM: &str = "primary";
/// Stream whose events carry calibration values instead of images.
pub const CALIBRATION_STREAM: &str = "calib";

fn default_stream_name() -> String {
    PRIMARY_STREAM.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default = "default_stream_name")]
    pub name: String,
    #[serde(default)]
    pub data_keys: BTreeMap<String, DataKey>,
    #[serde(flatten)]
    pub settings: RunSettings,
}

impl Default for DescriptorPayload {
    fn default() -> Self {
        Self {
            uid: None,
            name: default_stream_name(),
            data_keys: BTreeMap::new(),
            settings: RunSettings::default(),
        }
    }
}

impl DescriptorPayload {
    pub fn is_calibration_stream(&self) -> bool {
        self.name == CALIBRATION_STREAM
    }

    /// First 2-D array field in lexical order.
    pub fn image_key(&self) -> Option<&str> {
        self.data_keys
            .iter()
            .find(|(_, key)| key.is_image())
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventPayload {
    /// Descriptor uid or stream name the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl EventPayload {
    /// Extract the image stored under `key`.
    pub fn image(&self, key: &str) -> Result<ImageFrame, String> {
        let value = self
            .data
            .get(key)
            .ok_or_else(|| format!("event has no image field '{key}'"))?;
        ImageFrame::deserialize(value).map_err(|e| format!("field '{key}' is not an image: {e}"))
    }

    pub fn exposure_time(&self) -> Option<f64> {
        self.data.get("exposure_time").and_then(Value::as_f64)
    }

    /// Read a calibration-stream event.
    ///
    /// Fields are named `<detector>_<parameter>`, e.g. `pe1c_dist`; the
    /// detector prefix is dropped.
    pub fn calibration(&self) -> Result<Calibration, String> {
        let fields: Map<String, Value> = self
            .data
            .iter()
            .map(|(key, value)| {
                let param = key.split_once('_').map_or(key.as_str(), |(_, param)| param);
                (param.to_string(), value.clone())
            })
            .collect();
        Calibration::deserialize(Value::Object(fields))
            .map_err(|e| format!("calibration event is unreadable: {e}"))
    }
}

/// Exit status carried by `RunStop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    #[default]
    Success,
    Abort,
    Fail,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStopPayload {
    #[serde(default)]
    pub exit_status: ExitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload of an `Analysis` document.
///
/// Empty integration bins are NaN in memory and `null` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub event_sequence_number: u64,
    pub q: Vec<f64>,
    #[serde(with = "nullable_floats")]
    pub intensity: Vec<f64>,
    pub fq_q: Vec<f64>,
    #[serde(with = "nullable_floats")]
    pub fq: Vec<f64>,
    /// Scattering angle 2θ (degrees) of every `q` bin.
    #[serde(with = "nullable_floats")]
    pub chi_2theta: Vec<f64>,
    /// Highest integrated intensity and the Q it sits at.
    pub chi_max: Option<f64>,
    pub chi_argmax: Option<f64>,
    /// S(Q) = 1 + F(Q)/Q on the `fq_q` axis.
    #[serde(with = "nullable_floats")]
    pub sq: Vec<f64>,
    pub r: Vec<f64>,
    #[serde(with = "nullable_floats")]
    pub gr: Vec<f64>,
    /// Highest G(r) and the r it sits at.
    pub gr_max: Option<f64>,
    pub gr_argmax: Option<f64>,
    pub stages: Vec<String>,
}

mod nullable_floats {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|v| v.is_finite().then_some(*v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let values = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

/// Payload of an `Error` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub event_sequence_number: u64,
    pub cause: String,
    pub category: String,
    pub stage: Option<String>,
    pub message: String,
}
