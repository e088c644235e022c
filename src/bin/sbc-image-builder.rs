use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use sbc_image_builder::packages::Pacstrap;
use sbc_image_builder::process::HostRunner;
use sbc_image_builder::{
    preflight, BuildError, BuildProfile, CancellationToken, Pipeline, PipelineOptions,
};
use time::OffsetDateTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_FILE: &str = "mkimage.log";

/// Build a flashable SBC disk image from a board configuration directory.
#[derive(Debug, Parser)]
#[command(name = "sbc-image-builder", version)]
struct Cli {
    /// Work directory (image files, mounts, install root)
    #[arg(short = 'w', long)]
    work_dir: PathBuf,

    /// Board configuration directory containing profile.toml
    #[arg(short = 'c', long)]
    config_dir: PathBuf,

    /// Output directory for the finished artifacts
    #[arg(short = 'o', long)]
    out_dir: PathBuf,

    /// Keep the raw image instead of compressing it
    #[arg(short = 'x', long)]
    no_compress: bool,

    /// Compress with a low ratio for faster turnaround
    #[arg(short = 'f', long)]
    fast: bool,

    /// Debug-level logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn init_logging(config_dir: &Path, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    let log_path = config_dir.join(LOG_FILE);
    let log_file = File::create(&log_path)
        .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_filter(filter()))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(log_file))
                .with_filter(filter()),
        )
        .try_init()
        .context("installing log subscriber")?;
    Ok(())
}

fn log_banner(cli: &Cli, profile: &BuildProfile) {
    let today = OffsetDateTime::now_utc().date();
    tracing::info!("Build starting");
    tracing::info!("Architecture: {}", profile.arch);
    tracing::info!("Edition: {}", profile.edition);
    tracing::info!("Version: {}", profile.img_version);
    tracing::info!("Work directory: {}", cli.work_dir.display());
    tracing::info!("Install directory: {}", cli.work_dir.join(profile.arch.name()).display());
    tracing::info!("Output directory: {}", cli.out_dir.display());
    tracing::info!("Build date: {today}");
    tracing::info!("Device: {}", profile.device);
    tracing::info!("Filesystem: {}", profile.fs);
    tracing::info!("Image type: {}", profile.kind);
    tracing::info!("Image name: {}", profile.img_name);
    tracing::info!("Packages file: {}", profile.packages_file.display());
}

fn format_elapsed(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn require_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } != 0 {
        return Err(BuildError::config("this tool must be run as root"));
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    require_root()?;
    let profile = BuildProfile::load(&cli.config_dir)?;
    log_banner(cli, &profile);
    preflight::check_host_tools(&profile, !cli.no_compress)?;

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::error!("SIGINT or SIGTERM received, stopping after the current step");
        handler_token.cancel();
    })
    .context("installing signal handler")?;

    let mut options = PipelineOptions::new(&cli.work_dir, &cli.out_dir);
    options.compress = !cli.no_compress;
    options.fast = cli.fast;

    let materializer = Pacstrap {
        pacman_conf: profile.pacman_conf.clone(),
    };
    let report = Pipeline::new(&profile, options, &HostRunner, &materializer, cancel).run()?;
    for artifact in &report.artifacts {
        tracing::info!("Artifact: {}", artifact.display());
    }
    tracing::info!("Manifest: {}", report.manifest.display());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.config_dir, cli.verbose) {
        eprintln!("Error: {e:#}");
        return ExitCode::FAILURE;
    }

    let started = Instant::now();
    let result = run(&cli);
    tracing::info!(
        "Total time: {}",
        format_elapsed(started.elapsed().as_secs())
    );

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = match BuildError::classify(&e) {
                Some(BuildError::Interrupted) => {
                    tracing::warn!("Build interrupted, cleanup attempted");
                    0
                }
                Some(kind) => {
                    tracing::error!("Error: {e:#}");
                    kind.exit_code()
                }
                None => {
                    tracing::error!("Error: {e:#}");
                    1
                }
            };
            ExitCode::from(code as u8)
        }
    }
}
