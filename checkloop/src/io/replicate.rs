//! Replicate predictions as a generation backend.
//!
//! A job is one prediction. `POST` creates it, `GET <api_base>/predictions/<id>`
//! reports `starting`, `processing`, `succeeded`, `failed` or `canceled`, and
//! the finished video is downloaded from the prediction's output URL.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};

use crate::core::types::JobSpec;
use crate::io::config::BackendConfig;
use crate::io::job_client::{BackendError, GenerationBackend, JobError, JobStatus, RemoteJob};
use crate::io::{http_backend_error, prefixed_prompt};

/// HTTP client for the Replicate API.
pub struct ReplicateBackend {
    agent: ureq::Agent,
    api_base: String,
    model: String,
    token: String,
    prompt_prefix: String,
    input: BTreeMap<String, Value>,
    extension: String,
}

impl ReplicateBackend {
    pub fn new(cfg: &BackendConfig, token: String) -> Self {
        // Body reads stay unbounded so large videos can download.
        let timeout = Some(Duration::from_secs(cfg.request_timeout_secs));
        let config = ureq::Agent::config_builder()
            .timeout_connect(timeout)
            .timeout_recv_response(timeout)
            .build();
        Self {
            agent: config.into(),
            api_base: cfg.replicate.api_base.trim_end_matches('/').to_string(),
            model: cfg.replicate.model.clone(),
            token,
            prompt_prefix: cfg.prompt_prefix.clone(),
            input: cfg.replicate.input.clone(),
            extension: cfg.artifact_extension.clone(),
        }
    }

    /// Reads the API token from the variable named by `backend.replicate.token_env`.
    pub fn from_config(cfg: &BackendConfig) -> Result<Self> {
        let var = &cfg.replicate.token_env;
        let token = env::var(var)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("{var} is not set; export it or add it to .env"))?;
        Ok(Self::new(cfg, token))
    }

    /// Endpoint and body that create a prediction for `spec`. A pinned
    /// `owner/name:version` model goes through `/predictions`, a bare
    /// `owner/name` through the model's own endpoint.
    pub fn create_request(&self, spec: &JobSpec) -> (String, Value) {
        let mut input: Map<String, Value> = self.input.clone().into_iter().collect();
        input.insert(
            "prompt".to_string(),
            json!(prefixed_prompt(&self.prompt_prefix, &spec.prompt_text)),
        );
        input.insert("width".to_string(), json!(spec.width));
        input.insert("height".to_string(), json!(spec.height));
        let input = Value::Object(input);

        match self.model.split_once(':') {
            Some((_, version)) => (
                format!("{}/predictions", self.api_base),
                json!({"version": version, "input": input}),
            ),
            None => (
                format!("{}/models/{}/predictions", self.api_base, self.model),
                json!({"input": input}),
            ),
        }
    }

    fn prediction(&self, id: &str) -> Result<Value, BackendError> {
        let url = format!("{}/predictions/{id}", self.api_base);
        let response = self
            .agent
            .get(&url)
            .header("authorization", &format!("Bearer {}", self.token))
            .call()
            .map_err(http_backend_error)?;
        response
            .into_body()
            .read_json()
            .map_err(|e| BackendError::Transport(format!("unparseable prediction: {e}")))
    }

    fn download(&self, url: &str, dest: &Path) -> Result<(), JobError> {
        let mut request = self.agent.get(url);
        // Files served by the API itself need the token; delivery URLs are public.
        if url.starts_with(&self.api_base) {
            request = request.header("authorization", &format!("Bearer {}", self.token));
        }
        let response = request
            .call()
            .map_err(|e| JobError::ArtifactMissing(format!("download {url}: {e}")))?;

        let partial = dest.with_extension("part");
        let written = fs::File::create(&partial).and_then(|mut file| {
            io::copy(&mut response.into_body().into_reader(), &mut file)?;
            file.sync_all()
        });
        if let Err(err) = written {
            let _ = fs::remove_file(&partial);
            return Err(err.into());
        }
        fs::rename(&partial, dest)?;
        Ok(())
    }
}

impl GenerationBackend for ReplicateBackend {
    #[instrument(skip_all, fields(tag = %spec.output_tag, model = %self.model))]
    fn submit(&self, spec: &JobSpec) -> Result<String, BackendError> {
        let (url, body) = self.create_request(spec);
        let response = self
            .agent
            .post(&url)
            .header("authorization", &format!("Bearer {}", self.token))
            .header("content-type", "application/json")
            .send_json(&body)
            .map_err(http_backend_error)?;
        let value: Value = response
            .into_body()
            .read_json()
            .map_err(|e| BackendError::Rejected(format!("unparseable create response: {e}")))?;
        debug!(response = %value, "prediction created");
        parse_created(&value)
    }

    fn status(&self, submission_id: &str) -> Result<JobStatus, BackendError> {
        Ok(parse_prediction_status(&self.prediction(submission_id)?))
    }

    fn fetch_artifact(&self, job: &RemoteJob, dest: &Path) -> Result<(), JobError> {
        let prediction = self.prediction(&job.submission_id).map_err(|e| {
            JobError::ArtifactMissing(format!("reload prediction {}: {e}", job.submission_id))
        })?;
        let url = output_url(&prediction).ok_or_else(|| {
            JobError::ArtifactMissing(format!(
                "prediction {} has no output URL",
                job.submission_id
            ))
        })?;
        debug!(%url, to = %dest.display(), "downloading artifact");
        self.download(&url, dest)
    }

    fn artifact_extension(&self) -> &str {
        &self.extension
    }
}

/// Prediction id from a create response, surfacing `error` as a rejection.
pub fn parse_created(value: &Value) -> Result<String, BackendError> {
    if let Some(detail) = error_text(value) {
        return Err(BackendError::Rejected(detail));
    }
    match value.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(BackendError::Rejected(format!("response has no id: {value}"))),
    }
}

pub fn parse_prediction_status(value: &Value) -> JobStatus {
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();
    match status.as_str() {
        "starting" => JobStatus::Queued,
        "processing" => JobStatus::Running,
        "succeeded" => JobStatus::Completed,
        "failed" => JobStatus::Failed {
            detail: error_text(value).unwrap_or_else(|| "failed".to_string()),
        },
        "canceled" => JobStatus::Failed {
            detail: "canceled".to_string(),
        },
        other => JobStatus::Unknown(other.to_string()),
    }
}

/// `output` is either a URL or a list of URLs; the first one wins.
pub fn output_url(value: &Value) -> Option<String> {
    let url = match value.get("output")? {
        Value::String(url) => Some(url.as_str()),
        Value::Array(items) => items.iter().find_map(Value::as_str),
        _ => None,
    }?;
    let url = url.trim();
    (!url.is_empty()).then(|| url.to_string())
}

fn error_text(value: &Value) -> Option<String> {
    match value.get("error")? {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::run_job_spec;

    fn backend(model: &str) -> ReplicateBackend {
        let mut cfg = BackendConfig::default();
        cfg.replicate.model = model.to_string();
        cfg.prompt_prefix = "cinematic".to_string();
        ReplicateBackend::new(&cfg, "r8_token".to_string())
    }

    #[test]
    fn create_request_targets_model_or_pinned_version() {
        let spec = run_job_spec("r1", 2);

        let (url, body) = backend("tencent/hunyuan-video").create_request(&spec);
        assert_eq!(
            url,
            "https://api.replicate.com/v1/models/tencent/hunyuan-video/predictions"
        );
        assert_eq!(body.get("version"), None);
        let input = &body["input"];
        assert_eq!(input["prompt"], json!("cinematic prompt 2"));
        assert_eq!(input["width"], json!(512));
        assert_eq!(input["height"], json!(512));
        assert_eq!(input["video_length"], json!(69));
        assert_eq!(input["infer_steps"], json!(50));

        let (url, body) = backend("tencent/hunyuan-video:6c9132aee1").create_request(&spec);
        assert_eq!(url, "https://api.replicate.com/v1/predictions");
        assert_eq!(body["version"], json!("6c9132aee1"));
        assert_eq!(body["input"]["fps"], json!(24));
    }

    #[test]
    fn job_dimensions_override_configured_input() {
        let mut cfg = BackendConfig::default();
        cfg.replicate.input.insert("width".to_string(), json!(1280));
        let backend = ReplicateBackend::new(&cfg, "t".to_string());
        let (_, body) = backend.create_request(&run_job_spec("r1", 1));
        assert_eq!(body["input"]["width"], json!(512));
        assert_eq!(body["input"]["prompt"], json!("prompt 1"));
    }

    #[test]
    fn created_response_parsing() {
        assert_eq!(
            parse_created(&json!({"id": "abc", "status": "starting", "error": null})),
            Ok("abc".to_string())
        );
        assert_eq!(
            parse_created(&json!({"error": "invalid version"})),
            Err(BackendError::Rejected("invalid version".to_string()))
        );
        assert!(parse_created(&json!({"status": "starting"})).is_err());
    }

    #[test]
    fn prediction_status_mapping() {
        assert_eq!(
            parse_prediction_status(&json!({"status": "starting"})),
            JobStatus::Queued
        );
        assert_eq!(
            parse_prediction_status(&json!({"status": "processing"})),
            JobStatus::Running
        );
        assert_eq!(
            parse_prediction_status(&json!({"status": "succeeded", "output": "https://x/v.mp4"})),
            JobStatus::Completed
        );
        assert_eq!(
            parse_prediction_status(&json!({"status": "failed", "error": "CUDA out of memory"})),
            JobStatus::Failed {
                detail: "CUDA out of memory".to_string()
            }
        );
        assert_eq!(
            parse_prediction_status(&json!({"status": "canceled"})),
            JobStatus::Failed {
                detail: "canceled".to_string()
            }
        );
        assert_eq!(
            parse_prediction_status(&json!({"status": "paused"})),
            JobStatus::Unknown("paused".to_string())
        );
    }

    #[test]
    fn output_url_accepts_string_or_list() {
        assert_eq!(
            output_url(&json!({"output": "https://replicate.delivery/a.mp4"})),
            Some("https://replicate.delivery/a.mp4".to_string())
        );
        assert_eq!(
            output_url(&json!({"output": ["https://replicate.delivery/b.mp4"]})),
            Some("https://replicate.delivery/b.mp4".to_string())
        );
        assert_eq!(output_url(&json!({"output": null})), None);
        assert_eq!(output_url(&json!({"output": ""})), None);
        assert_eq!(output_url(&json!({})), None);
    }

    #[test]
    fn missing_token_is_a_config_error() {
        let mut cfg = BackendConfig::default();
        cfg.replicate.token_env = "CHECKLOOP_TEST_TOKEN_NEVER_SET".to_string();
        let err = ReplicateBackend::from_config(&cfg).err().expect("no token");
        assert!(err.to_string().contains("CHECKLOOP_TEST_TOKEN_NEVER_SET"));
    }
}
