use async_trait::async_trait;
use axum::body::Bytes;
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use reqwest::redirect::Policy;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::classifier::{Classifier, ImageInput};
use crate::config::DownloadConfig;
use crate::error::DetectionError;
use crate::types::DetectionResponse;

/// One detection feature as seen by the HTTP layer.
#[async_trait]
pub trait DetectionService: Send + Sync {
    /// Short label used in logs and metrics.
    fn feature(&self) -> &'static str;

    fn health_message(&self) -> &'static str;

    async fn detect_from_bytes(&self, bytes: Bytes) -> Result<DetectionResponse, DetectionError>;

    async fn detect_from_url(&self, url: &str) -> Result<DetectionResponse, DetectionError>;
}

pub fn encode_image(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

/// Scratch & dent detection. The remote classifier fetches URLs itself and
/// its response is returned untouched.
pub struct DamageDetectionService {
    classifier: Arc<dyn Classifier>,
}

impl DamageDetectionService {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self { classifier }
    }
}

#[async_trait]
impl DetectionService for DamageDetectionService {
    fn feature(&self) -> &'static str {
        "scratch-and-dent"
    }

    fn health_message(&self) -> &'static str {
        "Car detection service is running"
    }

    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len(), classifier = self.classifier.name()))]
    async fn detect_from_bytes(&self, bytes: Bytes) -> Result<DetectionResponse, DetectionError> {
        self.classifier
            .classify(ImageInput::Base64(encode_image(&bytes)))
            .await
    }

    #[tracing::instrument(skip(self), fields(classifier = self.classifier.name()))]
    async fn detect_from_url(&self, url: &str) -> Result<DetectionResponse, DetectionError> {
        self.classifier
            .classify(ImageInput::Url(url.to_string()))
            .await
    }
}

/// Dirty/clean detection. The local classifier only takes embedded image
/// data, so URLs are downloaded here first.
pub struct CleanlinessDetectionService {
    classifier: Arc<dyn Classifier>,
    http: reqwest::Client,
    max_bytes: usize,
    allow_private_hosts: bool,
}

impl CleanlinessDetectionService {
    pub fn new(classifier: Arc<dyn Classifier>, download: DownloadConfig) -> anyhow::Result<Self> {
        let allow_private_hosts = download.allow_private_hosts;
        let redirects = Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if !allow_private_hosts && is_private_host(attempt.url()) {
                attempt.error("redirect to a private or loopback address")
            } else {
                attempt.follow()
            }
        });

        let http = reqwest::Client::builder()
            .timeout(download.timeout)
            .redirect(redirects)
            .build()?;

        Ok(Self {
            classifier,
            http,
            max_bytes: download.max_bytes,
            allow_private_hosts,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn download(&self, url: &str) -> Result<Bytes, DetectionError> {
        let url = reqwest::Url::parse(url).map_err(download_failed)?;
        if !self.allow_private_hosts && is_private_host(&url) {
            return Err(download_failed("refusing to fetch from a private or loopback address"));
        }

        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(download_failed)?;

        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                return Err(download_failed(self.too_large()));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(download_failed)? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(download_failed(self.too_large()));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(Bytes::from(body))
    }

    fn too_large(&self) -> String {
        format!("image is larger than {} bytes", self.max_bytes)
    }
}

const MAX_REDIRECTS: usize = 10;

fn download_failed(cause: impl std::fmt::Display) -> DetectionError {
    tracing::error!(error = %cause, "Image download failed");
    DetectionError::Network(cause.to_string())
}

/// Loopback, private, link-local and unspecified addresses, plus `localhost`.
/// Only literal hosts are checked; names are not resolved here.
pub fn is_private_host(url: &reqwest::Url) -> bool {
    let Some(host) = url.host_str() else {
        return true;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => is_private_v4(ip),
        Ok(IpAddr::V6(ip)) => {
            let first = ip.segments()[0];
            ip.is_loopback()
                || ip.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || ip.to_ipv4_mapped().is_some_and(is_private_v4)
        }
        Err(_) => {
            let host = host.trim_end_matches('.').to_ascii_lowercase();
            host == "localhost" || host.ends_with(".localhost")
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

#[async_trait]
impl DetectionService for CleanlinessDetectionService {
    fn feature(&self) -> &'static str {
        "dirty-clean"
    }

    fn health_message(&self) -> &'static str {
        "Car dirty clean detection service is running"
    }

    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len(), classifier = self.classifier.name()))]
    async fn detect_from_bytes(&self, bytes: Bytes) -> Result<DetectionResponse, DetectionError> {
        self.classifier
            .classify(ImageInput::Base64(encode_image(&bytes)))
            .await
    }

    #[tracing::instrument(skip(self), fields(classifier = self.classifier.name()))]
    async fn detect_from_url(&self, url: &str) -> Result<DetectionResponse, DetectionError> {
        let bytes = self.download(url).await?;
        tracing::debug!(size = bytes.len(), "Downloaded image");
        self.detect_from_bytes(bytes).await
    }
}
