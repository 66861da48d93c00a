use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Side length of the square input the local cleanliness model was trained on.
pub const LOCAL_MODEL_INPUT_SIZE: u32 = 224;

/// Canonical envelope returned by both detection features.
///
/// Numbers are kept as `serde_json::Number` and unknown fields land in
/// `extra`, so a remote response serializes back exactly as it arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    #[serde(default)]
    pub predictions: Vec<Prediction>,
    pub image: ImageDimensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Number>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub x: Number,
    pub y: Number,
    pub width: Number,
    pub height: Number,
    pub confidence: Number,
    pub class: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDimensions {
    pub width: Number,
    pub height: Number,
}

/// JSON object printed on stdout by the inference script.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerOutput {
    #[serde(default)]
    pub success: bool,
    pub prediction: Option<LocalPrediction>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocalPrediction {
    pub label: String,
    pub confidence: f64,
}

impl LocalPrediction {
    pub fn is_well_formed(&self) -> bool {
        !self.label.trim().is_empty()
            && self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
    }

    /// Wraps a whole-image label in the detection envelope. The local model
    /// produces no box, so coordinates are zero and nothing is timed.
    /// Callers check [`LocalPrediction::is_well_formed`] first; a non-finite
    /// confidence would be reported as 0.
    pub fn into_detection_response(self) -> DetectionResponse {
        let zero = Number::from(0);
        DetectionResponse {
            predictions: vec![Prediction {
                x: zero.clone(),
                y: zero.clone(),
                width: zero.clone(),
                height: zero.clone(),
                confidence: Number::from_f64(self.confidence).unwrap_or_else(|| zero.clone()),
                class: self.label,
                extra: Map::new(),
            }],
            image: ImageDimensions {
                width: Number::from(LOCAL_MODEL_INPUT_SIZE),
                height: Number::from(LOCAL_MODEL_INPUT_SIZE),
            },
            time: Some(zero),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectByUrlRequest {
    #[serde(rename = "imageUrl")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
}

impl HealthResponse {
    pub fn ok(message: &str) -> Self {
        Self {
            status: "ok".to_string(),
            message: message.to_string(),
        }
    }
}
