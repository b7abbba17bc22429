//! Judgment: artifact + requirements → per-requirement booleans and notes.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::agents::validate_output;
use crate::core::judgment::{ReportedResult, Resolution, resolve};
use crate::core::types::{RequirementItem, SatisfactionMap};
use crate::io::frames::FrameSampler;
use crate::io::prompt::render_judge;
use crate::io::reasoning::{
    AdapterError, ImageInput, ReasoningRequest, ReasoningService, parse_json_reply,
};

const JUDGMENT_OUTPUT_SCHEMA: &str = include_str!("../../schemas/judgment_output.schema.json");

const SYSTEM: &str = "You are a strict visual reviewer of generated videos. \
You always answer with one JSON object.";

#[derive(Debug, Clone, Copy)]
pub struct JudgmentRequest<'a> {
    pub artifact: &'a Path,
    pub requirements: &'a [RequirementItem],
    /// Map from the previous judged iteration, if any.
    pub prior: Option<&'a SatisfactionMap>,
    /// Where sampled frames for this iteration are written.
    pub frames_dir: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Judgment {
    /// One entry per requirement, fail-closed.
    pub satisfaction: SatisfactionMap,
    pub notes: String,
    pub resolution: Resolution,
}

pub trait Judge {
    fn judge(&self, request: &JudgmentRequest<'_>) -> Result<Judgment, AdapterError>;
}

impl<J: Judge + ?Sized> Judge for &J {
    fn judge(&self, request: &JudgmentRequest<'_>) -> Result<Judgment, AdapterError> {
        (**self).judge(request)
    }
}

#[derive(Debug, Deserialize)]
struct JudgmentReply {
    results: Vec<ReportedResult>,
    #[serde(default)]
    notes: String,
}

/// Parse a judgment reply and resolve it onto `requirements`.
pub fn parse_judgment(raw: &str, requirements: &[RequirementItem]) -> Result<Judgment, AdapterError> {
    let value = parse_json_reply(raw)?;
    validate_output(JUDGMENT_OUTPUT_SCHEMA, &value, raw)?;
    let reply: JudgmentReply =
        serde_json::from_value(value).map_err(|e| AdapterError::Malformed {
            reason: format!("unexpected shape: {e}"),
            raw: raw.to_string(),
        })?;
    let resolution = resolve(requirements, &reply.results);
    if !resolution.is_clean() {
        warn!(
            omitted = ?resolution.omitted,
            conflicting = ?resolution.conflicting,
            unknown = ?resolution.unknown,
            "judgment resolved fail-closed"
        );
    }
    Ok(Judgment {
        satisfaction: resolution.satisfaction.clone(),
        notes: reply.notes.trim().to_string(),
        resolution,
    })
}

/// Samples frames from the artifact and asks a vision-capable reasoning service.
pub struct FrameJudge<S, R> {
    sampler: S,
    service: R,
}

impl<S: FrameSampler, R: ReasoningService> FrameJudge<S, R> {
    pub fn new(sampler: S, service: R) -> Self {
        Self { sampler, service }
    }
}

impl<S: FrameSampler, R: ReasoningService> Judge for FrameJudge<S, R> {
    #[instrument(skip_all, fields(artifact = %request.artifact.display()))]
    fn judge(&self, request: &JudgmentRequest<'_>) -> Result<Judgment, AdapterError> {
        let unusable = |reason: String| AdapterError::Malformed {
            reason,
            raw: String::new(),
        };
        let frames = self
            .sampler
            .sample(request.artifact, request.frames_dir)
            .map_err(|e| unusable(format!("frame sampling failed: {e:#}")))?;
        let images = frames
            .iter()
            .map(|path| ImageInput::from_file(path))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|e| unusable(format!("read frames: {e:#}")))?;
        let user = render_judge(request.requirements, request.prior, images.len())
            .map_err(|e| unusable(format!("render prompt: {e:#}")))?;
        debug!(frames = images.len(), "requesting judgment");

        let raw = self.service.complete_json(&ReasoningRequest {
            system: SYSTEM.to_string(),
            user,
            images,
        })?;
        parse_judgment(&raw, request.requirements)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use anyhow::Result;

    use super::*;
    use crate::test_support::{ScriptedReasoning, requirements};

    struct StaticFrames(Vec<PathBuf>);

    impl FrameSampler for StaticFrames {
        fn sample(&self, _artifact: &Path, _out_dir: &Path) -> Result<Vec<PathBuf>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenSampler;

    impl FrameSampler for BrokenSampler {
        fn sample(&self, _artifact: &Path, _out_dir: &Path) -> Result<Vec<PathBuf>> {
            anyhow::bail!("ffmpeg exploded")
        }
    }

    #[test]
    fn parse_resolves_omitted_ids_to_false() {
        let items = requirements(&["a", "b"]);
        let judgment = parse_judgment(
            r#"{"results": [{"id": "a", "present": true}], "notes": " b missing "}"#,
            &items,
        )
        .expect("parse");
        assert_eq!(judgment.satisfaction.get("a"), Some(&true));
        assert_eq!(judgment.satisfaction.get("b"), Some(&false));
        assert_eq!(judgment.notes, "b missing");
        assert_eq!(judgment.resolution.omitted, vec!["b"]);
    }

    #[test]
    fn parse_rejects_wrong_types() {
        let items = requirements(&["a"]);
        let err = parse_judgment(r#"{"results": [{"id": "a", "present": "yes"}]}"#, &items)
            .expect_err("schema");
        assert!(matches!(err, AdapterError::Malformed { .. }));
        assert!(parse_judgment("{}", &items).is_err());
    }

    #[test]
    fn judge_attaches_frames_as_images() {
        let temp = tempfile::tempdir().expect("tempdir");
        let frame = temp.path().join("frame_0001.png");
        fs::write(&frame, b"png").expect("write");
        let service = ScriptedReasoning::new(vec![Ok(
            r#"{"results": [{"id": "a", "present": true}], "notes": ""}"#.to_string(),
        )]);
        let judge = FrameJudge::new(StaticFrames(vec![frame.clone(), frame]), &service);
        let items = requirements(&["a"]);
        let judgment = judge
            .judge(&JudgmentRequest {
                artifact: &temp.path().join("iteration_1.mp4"),
                requirements: &items,
                prior: None,
                frames_dir: temp.path(),
            })
            .expect("judge");
        assert_eq!(judgment.satisfaction.get("a"), Some(&true));
        let requests = service.requests();
        assert_eq!(requests[0].images.len(), 2);
        assert!(requests[0].user.contains("shown 2 frames"));
    }

    #[test]
    fn sampling_failure_is_malformed_judgment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let service = ScriptedReasoning::new(Vec::new());
        let judge = FrameJudge::new(BrokenSampler, &service);
        let items = requirements(&["a"]);
        let err = judge
            .judge(&JudgmentRequest {
                artifact: &temp.path().join("missing.mp4"),
                requirements: &items,
                prior: None,
                frames_dir: temp.path(),
            })
            .expect_err("sampling");
        assert!(err.to_string().contains("frame sampling failed"));
        assert!(service.requests().is_empty());
    }
}
