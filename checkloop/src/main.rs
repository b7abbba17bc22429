//! `checkloop`: drive a generation backend toward a goal, one checklist item at a time.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use checkloop::agents::drafter::ReasoningDrafter;
use checkloop::agents::extractor::ReasoningExtractor;
use checkloop::agents::judge::FrameJudge;
use checkloop::core::types::{Mode, RunExit};
use checkloop::exit_codes;
use checkloop::io::comfy::ComfyBackend;
use checkloop::io::config::{BackendKind, CONFIG_FILE, CheckloopConfig, load_config, write_config};
use checkloop::io::frames::FfmpegSampler;
use checkloop::io::job_client::{GenerationBackend, JobClient, PollPolicy};
use checkloop::io::paths::RunPaths;
use checkloop::io::reasoning::OpenAiChat;
use checkloop::io::replicate::ReplicateBackend;
use checkloop::io::summary::write_summary;
use checkloop::logging;
use checkloop::looping::{LoopSettings, run_loop};
use checkloop::start::{RunRequest, extract_requirements, load_requirements_file, start_run};
use checkloop::step::{Services, StepOutcome};

#[derive(Parser)]
#[command(
    name = "checkloop",
    version,
    about = "Checklist-driven generate/judge loop for a remote generation backend"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new run and iterate until it stops.
    Run {
        /// What the generated artifact should show.
        #[arg(long)]
        goal: String,
        /// Run directory name (defaults to a timestamp).
        #[arg(long)]
        run_name: Option<String>,
        /// Overrides `mode` from the config.
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// JSON requirements file; skips extraction from the goal.
        #[arg(long)]
        requirements: Option<PathBuf>,
        /// Overrides `max_iterations` from the config.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Continue an interrupted run from its last recorded iteration.
    Resume { run_dir: PathBuf },
    /// Regenerate and print the final summary of a run.
    Summary { run_dir: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Ordered,
    Set,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Ordered => Mode::Ordered,
            ModeArg::Set => Mode::Set,
        }
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let env_file = dotenvy::dotenv().ok();
    logging::init();
    if let Some(path) = env_file {
        debug!(path = %path.display(), "loaded .env");
    }

    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Run {
            goal,
            run_name,
            mode,
            requirements,
            max_iterations,
        } => {
            let cfg = load_config(&cli.config)?;
            let request = RunArgs {
                goal,
                run_name,
                mode: mode.map(Mode::from).unwrap_or(cfg.mode),
                requirements,
                max_iterations: max_iterations.unwrap_or(cfg.max_iterations),
            };
            cmd_run(&cfg, request)
        }
        Command::Resume { run_dir } => {
            let cfg = load_config(&cli.config)?;
            cmd_resume(&cfg, &run_dir)
        }
        Command::Summary { run_dir } => cmd_summary(&run_dir),
    }
}

struct RunArgs {
    goal: String,
    run_name: Option<String>,
    mode: Mode,
    requirements: Option<PathBuf>,
    max_iterations: u32,
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    write_config(config_path, &CheckloopConfig::default())
        .with_context(|| format!("write {}", config_path.display()))?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(cfg: &CheckloopConfig, args: RunArgs) -> Result<i32> {
    let chat = OpenAiChat::from_config(&cfg.reasoning);
    let requirements = match &args.requirements {
        Some(path) => load_requirements_file(path)?,
        None => extract_requirements(&ReasoningExtractor::new(&chat), &args.goal)?,
    };

    let started = start_run(
        &cfg.runs_directory,
        &RunRequest {
            run_name: args.run_name,
            goal: args.goal,
            mode: args.mode,
            max_iterations: args.max_iterations,
            requirements,
        },
    )?;
    println!(
        "run {} ({} requirements): {}",
        started.run_name,
        started.requirement_count,
        started.run_dir.display()
    );
    if let Some(exit) = started.exit {
        return Ok(report_exit(&exit, &RunPaths::new(&started.run_dir).summary));
    }
    drive(cfg, &chat, &started.run_dir)
}

fn cmd_resume(cfg: &CheckloopConfig, run_dir: &Path) -> Result<i32> {
    let chat = OpenAiChat::from_config(&cfg.reasoning);
    drive(cfg, &chat, run_dir)
}

fn cmd_summary(run_dir: &Path) -> Result<i32> {
    let summary = write_summary(&RunPaths::new(run_dir))?;
    print!("{summary}");
    Ok(exit_codes::OK)
}

fn drive(cfg: &CheckloopConfig, chat: &OpenAiChat, run_dir: &Path) -> Result<i32> {
    match cfg.backend.kind {
        BackendKind::Comfy => {
            drive_with(cfg, chat, run_dir, ComfyBackend::from_config(&cfg.backend)?)
        }
        BackendKind::Replicate => {
            drive_with(cfg, chat, run_dir, ReplicateBackend::from_config(&cfg.backend)?)
        }
    }
}

fn drive_with<B: GenerationBackend>(
    cfg: &CheckloopConfig,
    chat: &OpenAiChat,
    run_dir: &Path,
    backend: B,
) -> Result<i32> {
    debug!(backend = ?cfg.backend.kind, "generation backend ready");
    let guide = match &cfg.guide {
        Some(path) => {
            Some(fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?)
        }
        None => None,
    };
    let services = Services {
        drafter: ReasoningDrafter::new(chat, cfg.history_budget_bytes, guide),
        judge: FrameJudge::new(FfmpegSampler::from_config(&cfg.frames), chat),
        jobs: JobClient::new(backend, PollPolicy::from_config(&cfg.job)),
        dimensions: cfg.dimensions.clone(),
    };
    let settings = LoopSettings {
        max_consecutive_unavailable: cfg.max_consecutive_unavailable,
    };
    let outcome = run_loop(run_dir, &services, &settings, print_step)?;
    Ok(report_exit(&outcome.exit, &outcome.summary_path))
}

fn print_step(step: &StepOutcome) {
    let status = match (step.failure, step.advanced) {
        (Some(failure), _) => format!("generation failed ({})", failure.as_str()),
        (None, true) => "advanced".to_string(),
        (None, false) if !step.regressed_ids.is_empty() => {
            let ids: Vec<&str> = step.regressed_ids.iter().map(String::as_str).collect();
            format!("regressed: {}", ids.join(", "))
        }
        (None, false) if step.judgment_degraded => "judgment unusable".to_string(),
        (None, false) => "not advanced".to_string(),
    };
    println!("iteration {}: {status}", step.index);
}

fn report_exit(exit: &RunExit, summary: &Path) -> i32 {
    println!("{exit}");
    println!("summary: {}", summary.display());
    exit_codes::for_exit(exit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force_with_config() {
        let cli = Cli::parse_from(["checkloop", "--config", "alt.toml", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
    }

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "checkloop",
            "run",
            "--goal",
            "a red sneaker",
            "--mode",
            "set",
            "--max-iterations",
            "4",
        ]);
        assert_eq!(cli.config, PathBuf::from(CONFIG_FILE));
        match cli.command {
            Command::Run {
                goal,
                mode,
                max_iterations,
                requirements,
                run_name,
            } => {
                assert_eq!(goal, "a red sneaker");
                assert_eq!(mode.map(Mode::from), Some(Mode::Set));
                assert_eq!(max_iterations, Some(4));
                assert_eq!(requirements, None);
                assert_eq!(run_name, None);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_resume_and_summary() {
        let cli = Cli::parse_from(["checkloop", "resume", "runs/r1"]);
        assert!(matches!(cli.command, Command::Resume { run_dir } if run_dir == Path::new("runs/r1")));
        let cli = Cli::parse_from(["checkloop", "summary", "runs/r1"]);
        assert!(matches!(cli.command, Command::Summary { .. }));
    }

    #[test]
    fn exit_codes_follow_run_exit() {
        assert_eq!(
            exit_codes::for_exit(&RunExit::AllSatisfied { iterations_used: 2 }),
            exit_codes::OK
        );
        assert_eq!(
            exit_codes::for_exit(&RunExit::NoRequirements),
            exit_codes::NO_REQUIREMENTS
        );
    }
}
