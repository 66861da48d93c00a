use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_REMOTE_CLASSIFIER_URL: &str =
    "https://serverless.roboflow.com/car-scratch-and-dent/3";

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to bind to
    #[arg(long, env = "PORT", default_value = "3005")]
    pub port: u16,

    /// API key for the hosted scratch & dent classifier
    #[arg(long, env = "ROBOFLOW_API_KEY", hide_env_values = true)]
    pub roboflow_api_key: Option<String>,

    /// Inference endpoint of the hosted scratch & dent classifier
    #[arg(long, env = "REMOTE_CLASSIFIER_URL", default_value = DEFAULT_REMOTE_CLASSIFIER_URL)]
    pub remote_classifier_url: String,

    /// Timeout in seconds for calls to the hosted classifier
    #[arg(long, env = "REMOTE_TIMEOUT_SECS", default_value = "15")]
    pub remote_timeout_secs: u64,

    /// Interpreter used to run the local inference script
    #[arg(long, env = "CLASSIFIER_INTERPRETER", default_value = "python3")]
    pub classifier_interpreter: String,

    /// Path to the local dirty/clean inference script
    #[arg(
        long,
        env = "CLASSIFIER_SCRIPT_PATH",
        default_value = "scripts/car_dirty_prediction.py"
    )]
    pub classifier_script_path: PathBuf,

    /// Path to the local dirty/clean model artifact
    #[arg(
        long,
        env = "CLASSIFIER_MODEL_PATH",
        default_value = "../model/car_dirty_clean_model.h5"
    )]
    pub classifier_model_path: PathBuf,

    /// Timeout in seconds before the inference process is killed
    #[arg(long, env = "CLASSIFIER_TIMEOUT_SECS", default_value = "30")]
    pub classifier_timeout_secs: u64,

    /// Largest base64 payload passed inline on the command line; bigger
    /// images are handed to the script as a temporary file
    #[arg(long, env = "INLINE_IMAGE_LIMIT", default_value = "98304")]
    pub inline_image_limit: usize,

    /// Timeout in seconds for downloading images given by URL
    #[arg(long, env = "DOWNLOAD_TIMEOUT_SECS", default_value = "10")]
    pub download_timeout_secs: u64,

    /// Largest image accepted from a URL download, in bytes
    #[arg(long, env = "MAX_DOWNLOAD_BYTES", default_value = "10485760")]
    pub max_download_bytes: usize,

    /// Allow URL downloads from loopback, private and link-local addresses
    #[arg(long, env = "ALLOW_PRIVATE_DOWNLOADS")]
    pub allow_private_downloads: bool,

    /// Maximum accepted upload body size in bytes
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value = "10485760")]
    pub max_upload_bytes: usize,

    /// Origin allowed to call the API from a browser ("*" for any)
    #[arg(long, env = "CORS_ALLOW_ORIGIN")]
    pub cors_allow_origin: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

#[derive(Debug, Clone)]
pub struct RemoteClassifierConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl From<&Config> for RemoteClassifierConfig {
    fn from(config: &Config) -> Self {
        Self {
            endpoint: config.remote_classifier_url.clone(),
            api_key: config
                .roboflow_api_key
                .clone()
                .filter(|key| !key.trim().is_empty()),
            timeout: Duration::from_secs(config.remote_timeout_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalClassifierConfig {
    pub interpreter: String,
    pub script_path: PathBuf,
    pub model_path: PathBuf,
    pub timeout: Duration,
    pub inline_image_limit: usize,
}

impl From<&Config> for LocalClassifierConfig {
    fn from(config: &Config) -> Self {
        Self {
            interpreter: config.classifier_interpreter.clone(),
            script_path: config.classifier_script_path.clone(),
            model_path: config.classifier_model_path.clone(),
            timeout: Duration::from_secs(config.classifier_timeout_secs),
            inline_image_limit: config.inline_image_limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub timeout: Duration,
    pub max_bytes: usize,
    pub allow_private_hosts: bool,
}

impl From<&Config> for DownloadConfig {
    fn from(config: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(config.download_timeout_secs),
            max_bytes: config.max_download_bytes,
            allow_private_hosts: config.allow_private_downloads,
        }
    }
}

impl Config {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Rejects settings that can never work. Missing credentials and model
    /// files are not fatal here; see [`Config::report_readiness`].
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = reqwest::Url::parse(&self.remote_classifier_url).map_err(|e| {
            anyhow::anyhow!(
                "REMOTE_CLASSIFIER_URL {:?} is not a valid URL: {e}",
                self.remote_classifier_url
            )
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("REMOTE_CLASSIFIER_URL must use http or https");
        }

        for (name, secs) in [
            ("REMOTE_TIMEOUT_SECS", self.remote_timeout_secs),
            ("CLASSIFIER_TIMEOUT_SECS", self.classifier_timeout_secs),
            ("DOWNLOAD_TIMEOUT_SECS", self.download_timeout_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }

        for (name, bytes) in [
            ("MAX_UPLOAD_BYTES", self.max_upload_bytes),
            ("MAX_DOWNLOAD_BYTES", self.max_download_bytes),
        ] {
            if bytes == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }

        Ok(())
    }

    /// Logs which detection backends are not usable yet. Health endpoints
    /// keep working either way.
    pub fn report_readiness(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if RemoteClassifierConfig::from(self).api_key.is_none() {
            problems.push(
                "ROBOFLOW_API_KEY is not set; scratch & dent detection will fail".to_string(),
            );
        }

        for (what, path) in [
            ("model", self.classifier_model_path.as_path()),
            ("script", self.classifier_script_path.as_path()),
        ] {
            if !exists(path) {
                problems.push(format!(
                    "classifier {what} not found at {}; dirty/clean detection will fail",
                    path.display()
                ));
            }
        }

        for problem in &problems {
            tracing::warn!("{problem}");
        }

        problems
    }
}

fn exists(path: &Path) -> bool {
    std::fs::metadata(path).is_ok()
}
