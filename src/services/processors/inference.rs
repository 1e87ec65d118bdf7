use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ExecutionError, Processor};
use crate::models::job::JobView;

/// Client for a model-serving endpoint that runs the learned methods
/// (upscalers, restoration, background removal, denoise).
///
/// `POST {base_url}/v1/run/{method}` with the image base64-encoded; the response
/// carries the transformed image the same way.
pub struct InferenceProcessor {
    http: Client,
    base_url: Option<String>,
    api_token: Option<String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    method: &'a str,
    scale: i32,
    denoise_first: bool,
    face_enhance: bool,
    image: String,
}

#[derive(Deserialize)]
struct InferenceResponse {
    image: String,
}

impl InferenceProcessor {
    pub fn new(
        base_url: Option<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ExecutionError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExecutionError::Unavailable(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
            api_token,
            timeout,
        })
    }

    fn map_http(&self, method: &str, error: reqwest::Error) -> ExecutionError {
        if error.is_timeout() {
            ExecutionError::Timeout {
                method: method.to_string(),
                secs: self.timeout.as_secs(),
            }
        } else {
            ExecutionError::Failed(format!("inference request failed: {error}"))
        }
    }
}

#[async_trait]
impl Processor for InferenceProcessor {
    async fn execute(
        &self,
        job: &JobView<'_>,
        input: &Path,
        output: &Path,
    ) -> Result<(), ExecutionError> {
        let base_url = self.base_url.as_deref().ok_or_else(|| {
            ExecutionError::Unavailable(format!("no inference endpoint configured for {}", job.method))
        })?;

        let image_bytes = match tokio::fs::read(input).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExecutionError::MissingInput(input.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let body = InferenceRequest {
            method: job.method,
            scale: job.scale,
            denoise_first: job.denoise_first,
            face_enhance: job.face_enhance,
            image: base64::engine::general_purpose::STANDARD.encode(&image_bytes),
        };

        let mut request = self
            .http
            .post(format!("{base_url}/v1/run/{}", job.method))
            .json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_http(job.method, e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ExecutionError::Failed(format!(
                "inference endpoint returned {status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }

        let payload: InferenceResponse = response
            .json()
            .await
            .map_err(|e| self.map_http(job.method, e))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(payload.image.as_bytes())
            .map_err(|e| ExecutionError::Failed(format!("invalid image payload: {e}")))?;

        tokio::fs::write(output, decoded).await?;
        tracing::debug!(job_id = %job.id, method = job.method, "Inference completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::params::MethodParams;

    #[tokio::test]
    async fn test_unconfigured_endpoint_is_unavailable() {
        let processor = InferenceProcessor::new(None, None, Duration::from_secs(5)).unwrap();
        let job = JobView {
            id: uuid::Uuid::new_v4(),
            method: "real_esrgan",
            params: &MethodParams::Upscale,
            scale: 4,
            denoise_first: false,
            face_enhance: false,
        };
        let dir = tempfile::tempdir().unwrap();
        let err = processor
            .execute(&job, &dir.path().join("input"), &dir.path().join("output.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Unavailable(_)));
    }
}
