use async_trait::async_trait;
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;

use crate::classifier::{Classifier, ImageInput};
use crate::config::LocalClassifierConfig;
use crate::error::{DetectionError, RunnerError};
use crate::types::{DetectionResponse, RunnerOutput};

/// Runs the dirty/clean model through its inference script, one process
/// per request:
///
/// ```text
/// <interpreter> <script> <model> <base64 image | image file>
/// ```
///
/// The script prints a single JSON object on stdout. The child is killed if
/// it outlives `timeout` or if the calling future is dropped.
pub struct LocalProcessClassifier {
    interpreter: String,
    script_path: PathBuf,
    model_path: PathBuf,
    timeout: Duration,
    inline_image_limit: usize,
}

/// Third argument of the script. Large images go through a temp file that
/// must outlive the child.
enum ImageArg {
    Inline(String),
    Staged(NamedTempFile),
}

impl LocalProcessClassifier {
    pub fn new(config: LocalClassifierConfig) -> Self {
        Self {
            interpreter: config.interpreter,
            script_path: config.script_path,
            model_path: config.model_path,
            timeout: config.timeout,
            inline_image_limit: config.inline_image_limit,
        }
    }

    pub async fn validate_paths(&self) -> Result<(), RunnerError> {
        let model = tokio::fs::metadata(&self.model_path).await;
        let script = tokio::fs::metadata(&self.script_path).await;

        if model.is_err() || script.is_err() {
            return Err(RunnerError::MissingFiles {
                model: self.model_path.clone(),
                script: self.script_path.clone(),
            });
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, base64_image), fields(image_len = base64_image.len()))]
    pub async fn run(&self, base64_image: String) -> Result<RunnerOutput, RunnerError> {
        self.validate_paths().await?;

        let image_arg = self.image_arg(base64_image)?;
        let mut command = Command::new(&self.interpreter);
        command
            .arg(&self.script_path)
            .arg(&self.model_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &image_arg {
            ImageArg::Inline(data) => command.arg(data),
            ImageArg::Staged(file) => command.arg(file.path()),
        };

        let child = command.spawn().map_err(|e| {
            tracing::error!(interpreter = %self.interpreter, error = %e, "Failed to start classifier process");
            RunnerError::Spawn(e)
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                tracing::error!(error = %e, "Failed to wait for classifier process");
                RunnerError::Wait(e)
            })?,
            Err(_) => {
                tracing::error!(timeout = ?self.timeout, "Classifier process timed out and was killed");
                return Err(RunnerError::TimedOut(self.timeout));
            }
        };
        drop(image_arg);

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            tracing::error!(code, stderr = %stderr, "Classifier process exited with failure");
            return Err(RunnerError::Exit { code, stderr });
        }
        if !stderr.is_empty() {
            tracing::debug!(stderr = %stderr, "Classifier process diagnostics");
        }

        serde_json::from_slice::<RunnerOutput>(&output.stdout).map_err(|e| {
            tracing::error!(
                error = %e,
                stdout = %String::from_utf8_lossy(&output.stdout),
                "Failed to parse classifier process output"
            );
            RunnerError::InvalidOutput
        })
    }

    fn image_arg(&self, base64_image: String) -> Result<ImageArg, RunnerError> {
        if base64_image.len() <= self.inline_image_limit {
            return Ok(ImageArg::Inline(base64_image));
        }

        let bytes = BASE64_STANDARD
            .decode(base64_image.as_bytes())
            .map_err(|e| RunnerError::Prediction(format!("Invalid image data: {e}")))?;
        let mut file = NamedTempFile::new().map_err(RunnerError::Io)?;
        file.write_all(&bytes).map_err(RunnerError::Io)?;
        file.flush().map_err(RunnerError::Io)?;
        tracing::debug!(path = %file.path().display(), size = bytes.len(), "Staged image for classifier process");

        Ok(ImageArg::Staged(file))
    }
}

#[async_trait]
impl Classifier for LocalProcessClassifier {
    fn name(&self) -> &'static str {
        "local-process"
    }

    async fn classify(&self, input: ImageInput) -> Result<DetectionResponse, DetectionError> {
        let ImageInput::Base64(image) = input else {
            return Err(DetectionError::Validation(
                "The local classifier only accepts embedded image data".to_string(),
            ));
        };

        let output = self.run(image).await?;
        if !output.success {
            let message = output
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "Prediction failed".to_string());
            tracing::warn!(error = %message, "Classifier reported an unsuccessful prediction");
            return Err(RunnerError::Prediction(message).into());
        }

        match output.prediction {
            Some(prediction) if prediction.is_well_formed() => {
                Ok(prediction.into_detection_response())
            }
            other => {
                tracing::error!(prediction = ?other, "Classifier returned a malformed prediction");
                Err(RunnerError::InvalidOutput.into())
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use base64::Engine as _;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        script: PathBuf,
        model: PathBuf,
    }

    fn fixture(script_body: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("predict.sh");
        let model = dir.path().join("model.h5");
        fs::write(&script, script_body).unwrap();
        fs::write(&model, b"weights").unwrap();
        Fixture { dir, script, model }
    }

    fn classifier(fixture: &Fixture, timeout: Duration) -> LocalProcessClassifier {
        LocalProcessClassifier::new(LocalClassifierConfig {
            interpreter: "sh".to_string(),
            script_path: fixture.script.clone(),
            model_path: fixture.model.clone(),
            timeout,
            inline_image_limit: 1024,
        })
    }

    #[tokio::test]
    async fn successful_run_is_reshaped() {
        let fx = fixture(
            r#"echo '{"success": true, "prediction": {"label": "dirty", "confidence": 0.93, "raw_score": 0.93}}'"#,
        );
        let response = classifier(&fx, Duration::from_secs(10))
            .classify(ImageInput::Base64("aGVsbG8=".to_string()))
            .await
            .unwrap();

        assert_eq!(response.predictions.len(), 1);
        assert_eq!(response.predictions[0].class, "dirty");
        assert_eq!(response.predictions[0].confidence.as_f64(), Some(0.93));
        assert_eq!(response.image.width.as_u64(), Some(224));
        assert_eq!(response.time.as_ref().and_then(|t| t.as_u64()), Some(0));
    }

    #[tokio::test]
    async fn script_receives_model_and_image_arguments() {
        // Echo the arguments back through the label.
        let fx = fixture(
            r#"printf '{"success": true, "prediction": {"label": "%s|%s", "confidence": 0.5}}' "$(basename "$1")" "$2""#,
        );
        let response = classifier(&fx, Duration::from_secs(10))
            .classify(ImageInput::Base64("aGVsbG8=".to_string()))
            .await
            .unwrap();

        assert_eq!(response.predictions[0].class, "model.h5|aGVsbG8=");
    }

    #[tokio::test]
    async fn non_zero_exit_reports_code_and_stderr() {
        let fx = fixture("echo 'model load failed' >&2\nexit 1");
        let err = classifier(&fx, Duration::from_secs(10))
            .classify(ImageInput::Base64("aGVsbG8=".to_string()))
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("model load failed"), "{message}");
        assert!(message.contains("code 1"), "{message}");
    }

    #[tokio::test]
    async fn unparseable_stdout_is_invalid_output() {
        let fx = fixture("echo 'Model loaded successfully'");
        let err = classifier(&fx, Duration::from_secs(10))
            .run("aGVsbG8=".to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::InvalidOutput));
        assert_eq!(err.to_string(), "Invalid response from classifier process");
    }

    #[tokio::test]
    async fn unsuccessful_prediction_surfaces_runner_error() {
        let fx = fixture(r#"echo '{"success": false, "error": "Prediction failed: cannot identify image file"}'"#);
        let err = classifier(&fx, Duration::from_secs(10))
            .classify(ImageInput::Base64("aGVsbG8=".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Prediction failed: cannot identify image file");

        let fx = fixture(r#"echo '{"success": false}'"#);
        let err = classifier(&fx, Duration::from_secs(10))
            .classify(ImageInput::Base64("aGVsbG8=".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Prediction failed");
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_rejected() {
        let fx = fixture(r#"echo '{"success": true, "prediction": {"label": "dirty", "confidence": 7}}'"#);
        let err = classifier(&fx, Duration::from_secs(10))
            .classify(ImageInput::Base64("aGVsbG8=".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, DetectionError::Runner(RunnerError::InvalidOutput)));
    }

    #[tokio::test]
    async fn missing_files_fail_before_spawning() {
        let fx = fixture("touch \"$(dirname \"$1\")/spawned\"\necho '{}'");
        fs::remove_file(&fx.model).unwrap();

        let err = classifier(&fx, Duration::from_secs(10))
            .run("aGVsbG8=".to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::MissingFiles { .. }));
        assert!(err.to_string().contains("model.h5"));
        assert!(err.to_string().contains("predict.sh"));
        assert!(!fx.dir.path().join("spawned").exists());
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_spawn_error() {
        let fx = fixture("echo '{}'");
        let mut runner = classifier(&fx, Duration::from_secs(10));
        runner.interpreter = "/nonexistent/python3".to_string();

        let err = runner.run("aGVsbG8=".to_string()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn(_)));
        assert!(err.to_string().starts_with("Failed to start classifier process"));
    }

    #[tokio::test]
    async fn hung_process_is_killed_at_deadline() {
        let fx = fixture("sleep 5\necho '{}'");
        let started = std::time::Instant::now();

        let err = classifier(&fx, Duration::from_millis(200))
            .run("aGVsbG8=".to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn large_images_are_staged_in_a_file() {
        let fx = fixture(
            r#"if [ -f "$2" ]; then label=file; else label=inline; fi
echo "{\"success\": true, \"prediction\": {\"label\": \"$label\", \"confidence\": 0.7}}""#,
        );
        let runner = classifier(&fx, Duration::from_secs(10));

        let small = runner
            .classify(ImageInput::Base64(BASE64_STANDARD.encode(b"tiny")))
            .await
            .unwrap();
        assert_eq!(small.predictions[0].class, "inline");

        let large = runner
            .classify(ImageInput::Base64(BASE64_STANDARD.encode(vec![7u8; 4096])))
            .await
            .unwrap();
        assert_eq!(large.predictions[0].class, "file");
    }

    #[tokio::test]
    async fn url_input_is_rejected() {
        let fx = fixture("echo '{}'");
        let err = classifier(&fx, Duration::from_secs(10))
            .classify(ImageInput::Url("https://example.com/car.jpg".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, DetectionError::Validation(_)));
    }
}
