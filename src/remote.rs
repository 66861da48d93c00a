use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;

use crate::classifier::{Classifier, ImageInput};
use crate::config::RemoteClassifierConfig;
use crate::error::DetectionError;
use crate::types::DetectionResponse;

pub const MISSING_API_KEY: &str =
    "Remote classifier API key is not configured. Please set ROBOFLOW_API_KEY environment variable.";

/// Client for the hosted scratch & dent detector. One POST per call, no
/// retries; the hosted API already answers in the canonical shape.
pub struct RemoteHttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl RemoteHttpClassifier {
    pub fn new(config: RemoteClassifierConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint,
            api_key: config.api_key,
        })
    }

    #[tracing::instrument(skip(self, input), fields(source = input.source()))]
    pub async fn detect(&self, input: ImageInput) -> Result<DetectionResponse, DetectionError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            tracing::error!("Remote classifier called without an API key");
            DetectionError::Configuration(MISSING_API_KEY.to_string())
        })?;

        let (request, context) = match input {
            ImageInput::Base64(image) => (
                self.client
                    .post(&self.endpoint)
                    .query(&[("api_key", api_key)])
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(image),
                "Failed to process image",
            ),
            ImageInput::Url(url) => (
                self.client
                    .post(&self.endpoint)
                    .query(&[("api_key", api_key), ("image", url.as_str())]),
                "Failed to process image URL",
            ),
        };

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "Remote classifier request failed");
            DetectionError::Upstream {
                context,
                message: e.without_url().to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), body = %body, "Remote classifier returned an error");
            return Err(classify_failure(status, &body, context));
        }

        response.json::<DetectionResponse>().await.map_err(|e| {
            tracing::error!(error = %e, "Remote classifier returned an unexpected body");
            DetectionError::Upstream {
                context,
                message: format!("unexpected response from remote classifier: {}", e.without_url()),
            }
        })
    }
}

#[async_trait]
impl Classifier for RemoteHttpClassifier {
    fn name(&self) -> &'static str {
        "remote-http"
    }

    async fn classify(&self, input: ImageInput) -> Result<DetectionResponse, DetectionError> {
        self.detect(input).await
    }
}

fn classify_failure(status: StatusCode, body: &str, context: &'static str) -> DetectionError {
    match status {
        StatusCode::UNAUTHORIZED => DetectionError::Unauthorized,
        StatusCode::FORBIDDEN => DetectionError::Forbidden,
        StatusCode::TOO_MANY_REQUESTS => DetectionError::RateLimited,
        _ => DetectionError::Upstream {
            context,
            message: upstream_message(body).unwrap_or_else(|| {
                format!("Request failed with status code {}", status.as_u16())
            }),
        },
    }
}

/// Pulls a human readable message out of an error body, if it has one.
fn upstream_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let text = value
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| value.get("error").and_then(|e| e.as_str()))
        .or_else(|| {
            value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
        })?;

    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::{Query, State},
        http::HeaderMap,
        routing::post,
    };
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    struct Captured {
        query: HashMap<String, String>,
        content_type: Option<String>,
        body: String,
    }

    type Log = Arc<Mutex<Vec<Captured>>>;

    fn sample_response() -> Value {
        json!({
            "inference_id": "7d0a",
            "time": 0.118,
            "image": { "width": 640, "height": 480 },
            "predictions": [
                {
                    "x": 312.5, "y": 201.0, "width": 88.0, "height": 40.5,
                    "confidence": 0.91, "class": "dent", "class_id": 0,
                    "detection_id": "a1"
                },
                {
                    "x": 120.0, "y": 330.5, "width": 60.0, "height": 22.0,
                    "confidence": 0.42, "class": "scratch", "class_id": 1,
                    "detection_id": "a2"
                }
            ]
        })
    }

    async fn spawn_upstream(status: StatusCode, reply: Value) -> (String, Log) {
        let log: Log = Arc::default();

        async fn handler(
            State((log, status, reply)): State<(Log, StatusCode, Value)>,
            Query(query): Query<HashMap<String, String>>,
            headers: HeaderMap,
            body: String,
        ) -> (StatusCode, Json<Value>) {
            log.lock().unwrap().push(Captured {
                query,
                content_type: headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                body,
            });
            (status, Json(reply))
        }

        let app = Router::new()
            .route("/car-scratch-and-dent/3", post(handler))
            .with_state((log.clone(), status, reply));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/car-scratch-and-dent/3"), log)
    }

    fn classifier(endpoint: String, api_key: Option<&str>) -> RemoteHttpClassifier {
        RemoteHttpClassifier::new(RemoteClassifierConfig {
            endpoint,
            api_key: api_key.map(str::to_string),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn uploads_send_base64_body_with_key_in_query() {
        let (endpoint, log) = spawn_upstream(StatusCode::OK, sample_response()).await;
        let remote = classifier(endpoint, Some("test-key"));

        let response = remote
            .detect(ImageInput::Base64("aGVsbG8=".to_string()))
            .await
            .unwrap();

        assert_eq!(serde_json::to_value(&response).unwrap(), sample_response());

        let captured = log.lock().unwrap().clone();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].query.get("api_key").map(String::as_str), Some("test-key"));
        assert!(!captured[0].query.contains_key("image"));
        assert_eq!(
            captured[0].content_type.as_deref(),
            Some("application/x-www-form-urlencoded")
        );
        assert_eq!(captured[0].body, "aGVsbG8=");
    }

    #[tokio::test]
    async fn urls_are_forwarded_as_query_parameters() {
        let (endpoint, log) = spawn_upstream(StatusCode::OK, sample_response()).await;
        let remote = classifier(endpoint, Some("test-key"));

        remote
            .detect(ImageInput::Url("https://cdn.example.com/car.jpg?w=800".to_string()))
            .await
            .unwrap();

        let captured = log.lock().unwrap().clone();
        assert_eq!(
            captured[0].query.get("image").map(String::as_str),
            Some("https://cdn.example.com/car.jpg?w=800")
        );
        assert_eq!(captured[0].query.get("api_key").map(String::as_str), Some("test-key"));
        assert!(captured[0].body.is_empty());
    }

    #[tokio::test]
    async fn error_statuses_are_classified() {
        let cases = [
            (StatusCode::UNAUTHORIZED, "Invalid remote classifier API key"),
            (StatusCode::FORBIDDEN, "access forbidden"),
            (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded"),
        ];

        for (status, expected) in cases {
            let (endpoint, _) = spawn_upstream(status, json!({ "message": "nope" })).await;
            let err = classifier(endpoint, Some("k"))
                .detect(ImageInput::Base64("AAAA".to_string()))
                .await
                .unwrap_err();
            assert!(err.to_string().contains(expected), "{status}: {err}");
        }
    }

    #[tokio::test]
    async fn generic_failures_carry_upstream_message() {
        let (endpoint, _) = spawn_upstream(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "message": "model overloaded" }),
        )
        .await;
        let remote = classifier(endpoint, Some("k"));

        let err = remote
            .detect(ImageInput::Base64("AAAA".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to process image: model overloaded");

        let err = remote
            .detect(ImageInput::Url("https://example.com/a.png".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to process image URL: model overloaded");
    }

    #[tokio::test]
    async fn missing_key_fails_without_calling_upstream() {
        let (endpoint, log) = spawn_upstream(StatusCode::OK, sample_response()).await;
        let err = classifier(endpoint, None)
            .detect(ImageInput::Base64("AAAA".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(err, DetectionError::Configuration(_)));
        assert!(err.to_string().contains("ROBOFLOW_API_KEY"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn upstream_message_fallbacks() {
        assert_eq!(upstream_message(r#"{"error":"bad image"}"#).as_deref(), Some("bad image"));
        assert_eq!(
            upstream_message(r#"{"error":{"message":"too big"}}"#).as_deref(),
            Some("too big")
        );
        assert_eq!(upstream_message("<html>502</html>"), None);
        assert!(
            classify_failure(StatusCode::BAD_GATEWAY, "", "Failed to process image")
                .to_string()
                .ends_with("Request failed with status code 502")
        );
    }
}
