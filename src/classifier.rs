use async_trait::async_trait;

use crate::error::DetectionError;
use crate::types::DetectionResponse;

/// Image handed to a classifier: either embedded data or a URL the
/// classifier fetches itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    Base64(String),
    Url(String),
}

impl ImageInput {
    pub fn source(&self) -> &'static str {
        match self {
            ImageInput::Base64(_) => "upload",
            ImageInput::Url(_) => "url",
        }
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn classify(&self, input: ImageInput) -> Result<DetectionResponse, DetectionError>;
}
