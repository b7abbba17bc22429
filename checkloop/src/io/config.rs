//! Run configuration stored in `checkloop.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::dimensions::DimensionPolicy;
use crate::core::types::Mode;

/// Default config file name, resolved relative to the working directory.
pub const CONFIG_FILE: &str = "checkloop.toml";

/// Loop configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values that work against a local ComfyUI instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckloopConfig {
    pub mode: Mode,

    /// Parent directory for run directories.
    pub runs_directory: PathBuf,

    /// Iteration budget per run, failed generations included.
    pub max_iterations: u32,

    /// Stop the run after this many consecutive iterations end in `client_unavailable`.
    pub max_consecutive_unavailable: u32,

    /// Byte budget for the drafting prompt; history and guide are trimmed to fit.
    pub history_budget_bytes: usize,

    /// Optional prompting guide handed to the drafter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guide: Option<PathBuf>,

    pub job: JobConfig,
    pub dimensions: DimensionPolicy,
    pub frames: FramesConfig,
    pub backend: BackendConfig,
    pub reasoning: ReasoningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    /// Seconds between status polls; fractions allowed.
    pub poll_interval_secs: f64,
    pub max_wait_secs: f64,
    /// Consecutive transport errors tolerated while polling.
    pub max_consecutive_poll_errors: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5.0,
            max_wait_secs: 30.0 * 60.0,
            max_consecutive_poll_errors: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FramesConfig {
    /// Keep every n-th decoded frame.
    pub sample_interval: u32,
    /// Upper bound on frames attached to one judgment request.
    pub max_frames: usize,
    pub timeout_secs: u64,
    pub ffmpeg: String,
}

impl Default for FramesConfig {
    fn default() -> Self {
        Self {
            sample_interval: 30,
            max_frames: 8,
            timeout_secs: 120,
            ffmpeg: "ffmpeg".to_string(),
        }
    }
}

/// Which generation service renders the jobs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// A ComfyUI server writing into a local output directory.
    #[default]
    Comfy,
    /// Hosted Replicate predictions, downloaded from their output URL.
    Replicate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// ComfyUI submission endpoint; the history endpoint is derived from its parent.
    pub api_url: String,
    pub client_id: String,
    /// Workflow graph (JSON) forwarded to the backend.
    pub workflow_path: PathBuf,
    /// Directory the backend writes finished artifacts into.
    pub output_dir: PathBuf,
    pub artifact_extension: String,
    /// Only consider artifacts whose file name starts with the iteration tag.
    pub match_tag_prefix: bool,
    /// Subfolder written in front of the iteration tag in the filename prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename_prefix_dir: Option<String>,
    pub request_timeout_secs: u64,
    /// Text prepended to every prompt (e.g. a LoRA trigger word).
    pub prompt_prefix: String,
    pub bindings: WorkflowBindings,
    /// Static values written into the workflow at the given JSON pointers.
    pub overrides: BTreeMap<String, serde_json::Value>,
    pub replicate: ReplicateConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Comfy,
            api_url: "http://127.0.0.1:8188/prompt".to_string(),
            client_id: "checkloop".to_string(),
            workflow_path: PathBuf::from("workflow.json"),
            output_dir: PathBuf::from("output"),
            artifact_extension: "mp4".to_string(),
            match_tag_prefix: true,
            filename_prefix_dir: None,
            request_timeout_secs: 30,
            prompt_prefix: String::new(),
            bindings: WorkflowBindings::default(),
            overrides: BTreeMap::new(),
            replicate: ReplicateConfig::default(),
        }
    }
}

/// Settings for `kind = "replicate"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicateConfig {
    pub api_base: String,
    /// `owner/name` for the model's latest version, or `owner/name:version`.
    pub model: String,
    /// Environment variable holding the API token.
    pub token_env: String,
    /// Extra model inputs; prompt, width and height are always set per job.
    pub input: BTreeMap<String, serde_json::Value>,
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        let input = [
            ("video_length", serde_json::json!(69)),
            ("infer_steps", serde_json::json!(50)),
            ("fps", serde_json::json!(24)),
            ("embedded_guidance_scale", serde_json::json!(6)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            api_base: "https://api.replicate.com/v1".to_string(),
            model: "tencent/hunyuan-video".to_string(),
            token_env: "REPLICATE_API_TOKEN".to_string(),
            input,
        }
    }
}

/// JSON pointers (RFC 6901) into the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkflowBindings {
    pub prompt: String,
    pub width: String,
    pub height: String,
    pub filename_prefix: String,
}

impl Default for WorkflowBindings {
    fn default() -> Self {
        Self {
            prompt: "/44/inputs/text".to_string(),
            width: "/45/inputs/width".to_string(),
            height: "/45/inputs/height".to_string(),
            filename_prefix: "/89/inputs/filename_prefix".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReasoningConfig {
    pub api_url: String,
    pub model: String,
    /// Environment variable holding the bearer key.
    pub api_key_env: String,
    pub max_completion_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_completion_tokens: 2000,
            timeout_secs: 120,
        }
    }
}

impl Default for CheckloopConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Ordered,
            runs_directory: PathBuf::from("runs"),
            max_iterations: 10,
            max_consecutive_unavailable: 3,
            history_budget_bytes: 24_000,
            guide: None,
            job: JobConfig::default(),
            dimensions: DimensionPolicy::default(),
            frames: FramesConfig::default(),
            backend: BackendConfig::default(),
            reasoning: ReasoningConfig::default(),
        }
    }
}

impl CheckloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_consecutive_unavailable == 0 {
            return Err(anyhow!("max_consecutive_unavailable must be > 0"));
        }
        if self.history_budget_bytes == 0 {
            return Err(anyhow!("history_budget_bytes must be > 0"));
        }
        for (name, secs) in [
            ("poll_interval_secs", self.job.poll_interval_secs),
            ("max_wait_secs", self.job.max_wait_secs),
        ] {
            if !secs.is_finite() || secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                return Err(anyhow!("job.{name} must be a finite number > 0, got {secs}"));
            }
        }
        if self.job.max_consecutive_poll_errors == 0 {
            return Err(anyhow!("job.max_consecutive_poll_errors must be > 0"));
        }
        self.dimensions.validate()?;
        if self.frames.sample_interval == 0 {
            return Err(anyhow!("frames.sample_interval must be > 0"));
        }
        if self.frames.max_frames == 0 {
            return Err(anyhow!("frames.max_frames must be > 0"));
        }
        if self.frames.timeout_secs == 0 {
            return Err(anyhow!("frames.timeout_secs must be > 0"));
        }
        if self.frames.ffmpeg.trim().is_empty() {
            return Err(anyhow!("frames.ffmpeg must be non-empty"));
        }
        if self.backend.api_url.trim().is_empty() {
            return Err(anyhow!("backend.api_url must be non-empty"));
        }
        let replicate = &self.backend.replicate;
        if self.backend.kind == BackendKind::Replicate {
            if replicate.api_base.trim().is_empty() {
                return Err(anyhow!("backend.replicate.api_base must be non-empty"));
            }
            if !replicate.model.contains('/') {
                return Err(anyhow!(
                    "backend.replicate.model must look like \"owner/name\" or \"owner/name:version\""
                ));
            }
        }
        if self.backend.artifact_extension.trim().is_empty()
            || self.backend.artifact_extension.contains('.')
        {
            return Err(anyhow!(
                "backend.artifact_extension must be a bare extension like \"mp4\""
            ));
        }
        if self.backend.request_timeout_secs == 0 {
            return Err(anyhow!("backend.request_timeout_secs must be > 0"));
        }
        let bindings = &self.backend.bindings;
        for (name, pointer) in [
            ("prompt", &bindings.prompt),
            ("width", &bindings.width),
            ("height", &bindings.height),
            ("filename_prefix", &bindings.filename_prefix),
        ] {
            if !pointer.starts_with('/') {
                return Err(anyhow!(
                    "backend.bindings.{name} must be a JSON pointer starting with '/'"
                ));
            }
        }
        if let Some(bad) = self.backend.overrides.keys().find(|k| !k.starts_with('/')) {
            return Err(anyhow!(
                "backend.overrides key {bad:?} must be a JSON pointer starting with '/'"
            ));
        }
        if self.reasoning.model.trim().is_empty() {
            return Err(anyhow!("reasoning.model must be non-empty"));
        }
        if self.reasoning.timeout_secs == 0 {
            return Err(anyhow!("reasoning.timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CheckloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<CheckloopConfig> {
    if !path.exists() {
        let cfg = CheckloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CheckloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CheckloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Dimensions;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, CheckloopConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        let mut cfg = CheckloopConfig::default();
        cfg.backend
            .overrides
            .insert("/3/inputs/steps".to_string(), serde_json::json!(30));
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn parses_partial_file_with_presets() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
mode = "set"
max_iterations = 4

[job]
poll_interval_secs = 2

[dimensions]
policy = "presets"
sizes = [{ width = 480, height = 848 }, { width = 720, height = 1280 }]

[backend.overrides]
"/91/inputs/lora_1/strength" = 0.8
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.mode, Mode::Set);
        assert_eq!(cfg.max_iterations, 4);
        assert_eq!(cfg.job.poll_interval_secs, 2.0);
        assert_eq!(cfg.job.max_wait_secs, JobConfig::default().max_wait_secs);
        assert_eq!(
            cfg.dimensions,
            DimensionPolicy::Presets {
                sizes: vec![Dimensions::new(480, 848), Dimensions::new(720, 1280)]
            }
        );
        assert_eq!(
            cfg.backend.overrides.get("/91/inputs/lora_1/strength"),
            Some(&serde_json::json!(0.8))
        );
    }

    #[test]
    fn rejects_zero_budget_and_bad_pointers() {
        let mut cfg = CheckloopConfig::default();
        cfg.max_iterations = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = CheckloopConfig::default();
        cfg.backend.bindings.prompt = "44/inputs/text".to_string();
        let err = cfg.validate().expect_err("pointer");
        assert!(err.to_string().contains("bindings.prompt"));

        let mut cfg = CheckloopConfig::default();
        cfg.frames.sample_interval = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fractional_poll_interval_loads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        fs::write(&path, "[job]\npoll_interval_secs = 0.5\nmax_wait_secs = 90.5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.job.poll_interval_secs, 0.5);
        assert_eq!(cfg.job.max_wait_secs, 90.5);
    }

    #[test]
    fn rejects_non_positive_or_non_finite_poll_timing() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let mut cfg = CheckloopConfig::default();
            cfg.job.poll_interval_secs = bad;
            let err = cfg.validate().expect_err("poll interval");
            assert!(err.to_string().contains("poll_interval_secs"), "{err}");

            let mut cfg = CheckloopConfig::default();
            cfg.job.max_wait_secs = bad;
            let err = cfg.validate().expect_err("max wait");
            assert!(err.to_string().contains("max_wait_secs"), "{err}");
        }
    }

    #[test]
    fn replicate_backend_section_parses() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
[backend]
kind = "replicate"

[backend.replicate]
model = "owner/video:abc123"

[backend.replicate.input]
fps = 12
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.backend.kind, BackendKind::Replicate);
        assert_eq!(cfg.backend.replicate.model, "owner/video:abc123");
        assert_eq!(cfg.backend.replicate.token_env, "REPLICATE_API_TOKEN");
        assert_eq!(
            cfg.backend.replicate.input.get("fps"),
            Some(&serde_json::json!(12))
        );

        let mut cfg = CheckloopConfig::default();
        cfg.backend.kind = BackendKind::Replicate;
        cfg.backend.replicate.model = "hunyuan".to_string();
        let err = cfg.validate().expect_err("model");
        assert!(err.to_string().contains("replicate.model"));
    }
}
