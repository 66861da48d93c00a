use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Configuration(String),

    #[error("Invalid remote classifier API key. Please check your ROBOFLOW_API_KEY environment variable.")]
    Unauthorized,

    #[error("Remote classifier access forbidden. Please check your API key permissions.")]
    Forbidden,

    #[error("Remote classifier rate limit exceeded. Please try again later.")]
    RateLimited,

    #[error("{context}: {message}")]
    Upstream {
        context: &'static str,
        message: String,
    },

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("Failed to download image from URL: {0}")]
    Network(String),
}

/// Failures of the local classifier subprocess.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Required files not found. Model: {}, Script: {}", model.display(), script.display())]
    MissingFiles { model: PathBuf, script: PathBuf },

    #[error("Failed to start classifier process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Classifier process failed with code {code}: {stderr}")]
    Exit { code: i32, stderr: String },

    #[error("Invalid response from classifier process")]
    InvalidOutput,

    #[error("Classifier process did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("Failed to stage image for classifier process: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to collect classifier process output: {0}")]
    Wait(#[source] std::io::Error),

    #[error("{0}")]
    Prediction(String),
}

impl DetectionError {
    pub fn kind(&self) -> &'static str {
        match self {
            DetectionError::Validation(_) => "validation",
            DetectionError::Configuration(_) => "configuration",
            DetectionError::Unauthorized
            | DetectionError::Forbidden
            | DetectionError::RateLimited
            | DetectionError::Upstream { .. } => "upstream",
            DetectionError::Runner(_) => "runner",
            DetectionError::Network(_) => "network",
        }
    }
}

impl IntoResponse for DetectionError {
    fn into_response(self) -> Response {
        // Every failure is reported to the caller as a bad request; the
        // frontend only reads `message`.
        let status = StatusCode::BAD_REQUEST;
        let body = json!({
            "statusCode": status.as_u16(),
            "message": self.to_string(),
            "error": "Bad Request",
        });

        (status, Json(body)).into_response()
    }
}
