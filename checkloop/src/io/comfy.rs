//! ComfyUI-compatible generation backend over HTTP.
//!
//! The workflow graph is opaque: the only values the client writes into it
//! are the prompt, the dimensions, the filename prefix and the configured
//! static overrides, each at a configured JSON pointer. Finished videos are
//! picked up from the server's output directory by their run-scoped prefix.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::core::types::JobSpec;
use crate::io::config::{BackendConfig, WorkflowBindings};
use crate::io::{http_backend_error, prefixed_prompt};
use crate::io::job_client::{
    BackendError, GenerationBackend, JobError, JobStatus, LocalOutputs, RemoteJob,
};

/// Workflow graph plus the locations the client is allowed to write.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowTemplate {
    graph: Value,
    bindings: WorkflowBindings,
    prompt_prefix: String,
    filename_prefix_dir: Option<String>,
    overrides: BTreeMap<String, Value>,
}

impl WorkflowTemplate {
    pub fn load(cfg: &BackendConfig) -> Result<Self> {
        let path = &cfg.workflow_path;
        let contents =
            fs::read_to_string(path).with_context(|| format!("read workflow {}", path.display()))?;
        let graph: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse workflow {}", path.display()))?;
        Self::new(graph, cfg).with_context(|| format!("bind workflow {}", path.display()))
    }

    /// Check every binding and override resolves inside `graph`.
    pub fn new(graph: Value, cfg: &BackendConfig) -> Result<Self> {
        let b = &cfg.bindings;
        for pointer in [&b.prompt, &b.width, &b.height, &b.filename_prefix]
            .into_iter()
            .chain(cfg.overrides.keys())
        {
            if graph.pointer(pointer).is_none() {
                return Err(anyhow!("workflow has no value at {pointer}"));
            }
        }
        Ok(Self {
            graph,
            bindings: cfg.bindings.clone(),
            prompt_prefix: cfg.prompt_prefix.clone(),
            filename_prefix_dir: cfg.filename_prefix_dir.clone(),
            overrides: cfg.overrides.clone(),
        })
    }

    /// Graph for one job. Overrides apply first so bindings always win.
    pub fn render(&self, spec: &JobSpec) -> Result<Value, BackendError> {
        let mut graph = self.graph.clone();
        for (pointer, value) in &self.overrides {
            set_pointer(&mut graph, pointer, value.clone())?;
        }

        let prompt = prefixed_prompt(&self.prompt_prefix, &spec.prompt_text);
        let filename_prefix = match &self.filename_prefix_dir {
            Some(dir) => format!("{}/{}", dir.trim_end_matches('/'), spec.output_tag),
            None => spec.output_tag.clone(),
        };

        set_pointer(&mut graph, &self.bindings.prompt, json!(prompt))?;
        set_pointer(&mut graph, &self.bindings.width, json!(spec.width))?;
        set_pointer(&mut graph, &self.bindings.height, json!(spec.height))?;
        set_pointer(&mut graph, &self.bindings.filename_prefix, json!(filename_prefix))?;
        Ok(graph)
    }
}

fn set_pointer(graph: &mut Value, pointer: &str, value: Value) -> Result<(), BackendError> {
    let slot = graph
        .pointer_mut(pointer)
        .ok_or_else(|| BackendError::Rejected(format!("workflow has no value at {pointer}")))?;
    *slot = value;
    Ok(())
}

/// HTTP client for a ComfyUI server.
pub struct ComfyBackend {
    agent: ureq::Agent,
    api_url: String,
    history_base: String,
    client_id: String,
    template: WorkflowTemplate,
    outputs: LocalOutputs,
}

impl ComfyBackend {
    pub fn new(cfg: &BackendConfig, template: WorkflowTemplate) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(cfg.request_timeout_secs)))
            .build();
        Self {
            agent: config.into(),
            api_url: cfg.api_url.clone(),
            history_base: history_base(&cfg.api_url),
            client_id: cfg.client_id.clone(),
            template,
            outputs: LocalOutputs::from_config(cfg),
        }
    }

    pub fn from_config(cfg: &BackendConfig) -> Result<Self> {
        let template = WorkflowTemplate::load(cfg)?;
        Ok(Self::new(cfg, template))
    }
}

impl GenerationBackend for ComfyBackend {
    #[instrument(skip_all, fields(tag = %spec.output_tag, url = %self.api_url))]
    fn submit(&self, spec: &JobSpec) -> Result<String, BackendError> {
        let body = json!({
            "prompt": self.template.render(spec)?,
            "client_id": self.client_id,
        });
        let response = self
            .agent
            .post(&self.api_url)
            .header("content-type", "application/json")
            .send_json(&body)
            .map_err(http_backend_error)?;
        let value: Value = response
            .into_body()
            .read_json()
            .map_err(|e| BackendError::Rejected(format!("unparseable submit response: {e}")))?;
        debug!(response = %value, "submit response");
        parse_submit_response(&value)
    }

    fn status(&self, submission_id: &str) -> Result<JobStatus, BackendError> {
        let url = format!("{}/history/{submission_id}", self.history_base);
        let response = self.agent.get(&url).call().map_err(http_backend_error)?;
        let value: Value = response
            .into_body()
            .read_json()
            .map_err(|e| BackendError::Transport(format!("unparseable history response: {e}")))?;
        Ok(parse_history_status(&value, submission_id))
    }

    fn fetch_artifact(&self, job: &RemoteJob, dest: &Path) -> Result<(), JobError> {
        self.outputs.copy_to(job, dest)
    }

    fn artifact_extension(&self) -> &str {
        &self.outputs.extension
    }
}

/// `http://host/api/prompt` → `http://host/api`.
pub fn history_base(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((base, _)) if base.contains("://") => base.to_string(),
        _ => trimmed.to_string(),
    }
}

/// Extract `prompt_id`, surfacing `error` / `node_errors` as a rejection.
pub fn parse_submit_response(value: &Value) -> Result<String, BackendError> {
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        return Err(BackendError::Rejected(error.to_string()));
    }
    if let Some(errors) = value
        .get("node_errors")
        .and_then(Value::as_object)
        .filter(|m| !m.is_empty())
    {
        return Err(BackendError::Rejected(format!(
            "node errors: {}",
            Value::Object(errors.clone())
        )));
    }
    match value.get("prompt_id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(BackendError::Rejected(format!(
            "response has no prompt_id: {value}"
        ))),
    }
}

/// Map a history document `{id: {status: {status_str, completed}}}` to a status.
///
/// A missing entry means the job has not started yet.
pub fn parse_history_status(value: &Value, submission_id: &str) -> JobStatus {
    let Some(entry) = value.get(submission_id) else {
        return JobStatus::Queued;
    };
    let status = entry.get("status");
    let completed = status
        .and_then(|s| s.get("completed"))
        .is_some_and(|c| c.as_bool() == Some(true) || c.as_str() == Some("true"));
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();

    match status_str.as_str() {
        "error" | "failed" => JobStatus::Failed {
            detail: failure_detail(status).unwrap_or_else(|| status_str.clone()),
        },
        "success" => JobStatus::Completed,
        _ if completed => JobStatus::Completed,
        "" | "running" => JobStatus::Running,
        other => JobStatus::Unknown(other.to_string()),
    }
}

/// Exception message from ComfyUI's `messages` list, when present.
fn failure_detail(status: Option<&Value>) -> Option<String> {
    status?
        .get("messages")?
        .as_array()?
        .iter()
        .filter_map(|m| m.as_array())
        .find(|m| m.first().and_then(Value::as_str) == Some("execution_error"))
        .and_then(|m| m.get(1))
        .and_then(|body| body.get("exception_message"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
}
