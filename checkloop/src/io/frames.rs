//! Frame sampling for judgment: fixed-interval extraction through `ffmpeg`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};

use crate::io::config::FramesConfig;
use crate::io::process::run_with_timeout;

/// Turns an artifact into still frames the judge can look at.
pub trait FrameSampler {
    /// Write frames for `artifact` into `out_dir` and return them in temporal order.
    fn sample(&self, artifact: &Path, out_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Samples every n-th frame with an external `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct FfmpegSampler {
    pub program: String,
    pub interval: u32,
    pub max_frames: usize,
    pub timeout: Duration,
}

impl FfmpegSampler {
    pub fn from_config(cfg: &FramesConfig) -> Self {
        Self {
            program: cfg.ffmpeg.clone(),
            interval: cfg.sample_interval,
            max_frames: cfg.max_frames,
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }
}

impl FrameSampler for FfmpegSampler {
    #[instrument(skip_all, fields(artifact = %artifact.display(), interval = self.interval))]
    fn sample(&self, artifact: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
        reset_frames_dir(out_dir)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(artifact)
            .arg("-vf")
            .arg(format!("select='not(mod(n,{}))'", self.interval))
            .args(["-vsync", "vfr"])
            .arg(out_dir.join("frame_%04d.png"));

        let output = run_with_timeout(cmd, self.timeout, 64 * 1024)
            .with_context(|| format!("run {}", self.program))?;
        if output.timed_out {
            bail!("{} timed out after {}s", self.program, self.timeout.as_secs());
        }
        if !output.status.success() {
            bail!(
                "{} exited with {:?}: {}",
                self.program,
                output.status.code(),
                output.stderr_tail(2000)
            );
        }

        let frames = list_frames(out_dir)?;
        if frames.is_empty() {
            bail!("no frames extracted from {}", artifact.display());
        }
        let picked = evenly_spaced(frames.len(), self.max_frames)
            .into_iter()
            .map(|i| frames[i].clone())
            .collect::<Vec<_>>();
        debug!(extracted = frames.len(), kept = picked.len(), "frames sampled");
        Ok(picked)
    }
}

/// Empty `dir` so frames left by an interrupted attempt are never judged.
pub fn reset_frames_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("clear frames dir {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("create frames dir {}", dir.display()))
}

/// Image files in `dir`, sorted by name.
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read frames dir {}", dir.display()))? {
        let path = entry.context("read frames dir entry")?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"));
        if is_image && path.is_file() {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

/// Up to `k` indices spread evenly over `0..n`, always including the first and last.
pub fn evenly_spaced(n: usize, k: usize) -> Vec<usize> {
    if n == 0 || k == 0 {
        return Vec::new();
    }
    if k >= n {
        return (0..n).collect();
    }
    if k == 1 {
        return vec![0];
    }
    (0..k).map(|i| i * (n - 1) / (k - 1)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evenly_spaced_keeps_ends() {
        assert_eq!(evenly_spaced(10, 4), vec![0, 3, 6, 9]);
        assert_eq!(evenly_spaced(3, 8), vec![0, 1, 2]);
        assert_eq!(evenly_spaced(5, 1), vec![0]);
        assert!(evenly_spaced(0, 3).is_empty());
    }

    #[test]
    fn list_frames_filters_and_sorts() {
        let temp = tempfile::tempdir().expect("tempdir");
        for name in ["frame_0002.png", "frame_0001.png", "notes.txt", "frame_0003.JPG"] {
            fs::write(temp.path().join(name), b"x").expect("write");
        }
        let frames = list_frames(temp.path()).expect("list");
        let names: Vec<_> = frames
            .iter()
            .map(|p| p.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string())
            .collect();
        assert_eq!(names, vec!["frame_0001.png", "frame_0002.png", "frame_0003.JPG"]);
    }

    #[test]
    fn reset_drops_frames_from_an_earlier_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("frames").join("iteration_3");
        fs::create_dir_all(&dir).expect("mkdir");
        for name in ["frame_0001.png", "frame_0002.png", "frame_0003.png"] {
            fs::write(dir.join(name), b"stale").expect("write");
        }
        reset_frames_dir(&dir).expect("reset");
        assert!(dir.is_dir());
        assert!(list_frames(&dir).expect("list").is_empty());

        let fresh = temp.path().join("frames").join("iteration_4");
        reset_frames_dir(&fresh).expect("create");
        assert!(fresh.is_dir());
    }

    #[test]
    fn missing_ffmpeg_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sampler = FfmpegSampler {
            program: "/definitely/not/ffmpeg".to_string(),
            interval: 10,
            max_frames: 4,
            timeout: Duration::from_secs(5),
        };
        let artifact = temp.path().join("a.mp4");
        assert!(sampler.sample(&artifact, &temp.path().join("frames")).is_err());
    }
}
