use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use events::{DataChannel, JsonlWriter, LogTarget};
use multiplexer::{Multiplexer, SpawnOptions, Tick};
use overseer::{gated, walltime, Overseer, OverseerOptions, ProgramExit, RunOutcome};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_FILE: &str = "overwatch.toml";
const CONFIG_DIR: &str = "overwatch";
const USER_CONFIG_FILE: &str = "config.toml";

#[derive(Parser)]
#[command(name = "overwatch")]
#[command(about = "Run programs under instruments and multiplex their output", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program under the overseer: [OVERSEER ARGS] SCRIPT [ARGV...]
    Run {
        /// Where to write the overseer's JSON log (path or descriptor)
        #[arg(long)]
        logfile: Option<String>,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Spawn a program and print each of its events as a JSON line
    Supervise {
        /// Emit idle ticks after this many milliseconds without output
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Name recorded in the info of every event
        #[arg(long)]
        name: Option<String>,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        program: Vec<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OverwatchConfig {
    run: RunConfig,
    supervise: SuperviseConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunConfig {
    logfile: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SuperviseConfig {
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config()?;
    let code = match cli.command {
        Commands::Run { logfile, args } => run(logfile, args, &config)?,
        Commands::Supervise {
            timeout_ms,
            name,
            program,
        } => supervise(timeout_ms, name, program, &config).await?,
    };

    std::process::exit(exit_status(code));
}

fn run(logfile: Option<String>, args: Vec<String>, config: &OverwatchConfig) -> Result<i32> {
    let logfile = match logfile.or_else(|| config.run.logfile.clone()) {
        Some(target) => Some(log_target(&target)),
        None => DataChannel::target_from_env()?,
    };

    let mut options = OverseerOptions::default();
    if let Some(target) = logfile {
        tracing::debug!(logfile = %target, "Logging overseer events");
        options = options.with_logfile(target);
    }

    let instruments = vec![gated(
        "--walltime",
        Some("Report the wall-clock time of the program"),
        walltime(),
    )];
    let overseer = Overseer::with_options(instruments, options)?;

    match overseer.run(args) {
        Ok(RunOutcome::Completed(_)) | Ok(RunOutcome::Stopped) => Ok(0),
        Err(error) => {
            if let Some(failure) = error.failure() {
                if let Some(exit) = failure.downcast_ref::<ProgramExit>() {
                    return Ok(exit.code);
                }
                if let Some(usage) = failure.downcast_ref::<clap::Error>() {
                    usage.print()?;
                    return Ok(usage.exit_code());
                }
            }
            Err(error.into())
        }
    }
}

async fn supervise(
    timeout_ms: Option<u64>,
    name: Option<String>,
    program: Vec<String>,
    config: &OverwatchConfig,
) -> Result<i32> {
    let timeout = timeout_ms
        .or(config.supervise.timeout_ms)
        .map(Duration::from_millis);

    let mut info = Map::new();
    if let Some(name) = name {
        info.insert("name".to_string(), Value::String(name));
    }

    let mut multiplexer = Multiplexer::new(timeout);
    multiplexer
        .start(&program, info, &SpawnOptions::default())
        .with_context(|| format!("Failed to start {}", program.join(" ")))?;

    let mut out = JsonlWriter::open(&LogTarget::Fd(1), true)?;
    let mut return_code = 0;
    while let Some(tick) = multiplexer.next().await {
        match tick {
            Tick::Event(event) => {
                if let Some(code) = event.return_code() {
                    return_code = code;
                }
                out.log(&event);
            }
            Tick::Idle => tracing::trace!("No output this round"),
        }
    }
    out.flush();

    tracing::info!(return_code, "Program ended");
    Ok(return_code)
}

fn log_target(raw: &str) -> LogTarget {
    match raw.parse::<LogTarget>() {
        Ok(target) => target,
        Err(never) => match never {},
    }
}

/// Shell convention: a program killed by signal N exits with 128 + N.
fn exit_status(code: i32) -> i32 {
    if code < 0 {
        128 - code
    } else {
        code
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join(CONFIG_DIR).join(USER_CONFIG_FILE));
    }
    paths
}

fn load_config() -> Result<OverwatchConfig> {
    match config_paths().into_iter().find(|path| path.exists()) {
        Some(path) => read_config(&path),
        None => Ok(OverwatchConfig::default()),
    }
}

fn read_config(path: &Path) -> Result<OverwatchConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Loaded config");
    Ok(config)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overwatch=info,overseer=info,multiplexer=info".into()),
        )
        .init();
}
