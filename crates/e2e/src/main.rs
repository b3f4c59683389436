//! ParaBank UI test runner
//!
//! Runs the YAML scenarios against ParaBank in one worker, or with
//! `--workers N` coordinates N worker processes of itself.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use parabank_common::{Environment, Settings, WorkerId, MAX_WORKERS};
use parabank_e2e::playwright::{check_playwright_installed, BrowserKind, PlaywrightBrowser, PlaywrightConfig};
use parabank_e2e::{MetricsEmitter, RunnerConfig, TestRunner};

const EXIT_OK: i32 = 0;
const EXIT_FAILURES: i32 = 1;
const EXIT_ERROR: i32 = 2;
const EXIT_ABORTED: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "parabank-e2e")]
#[command(about = "ParaBank UI tests driven from Rust through Playwright")]
#[command(version)]
struct Cli {
    /// Target environment; selects config/<env>.toml
    #[arg(long, default_value = "dev")]
    env: Environment,

    /// Do not log in once per worker; every test logs in itself
    #[arg(long)]
    no_restore_session: bool,

    /// Delete the worker's auth-state file after the run
    #[arg(long)]
    cleanup_session: bool,

    /// Worker identity (gw0, gw1, ...); omitted means a single-process run
    #[arg(long, env = "PARABANK_WORKER")]
    worker: Option<String>,

    /// Spawn this many worker processes and aggregate their results
    #[arg(long, conflicts_with = "worker")]
    workers: Option<usize>,

    /// Run only slice I of N of the scenario list, as "I/N"
    #[arg(long, value_parser = parse_shard)]
    shard: Option<(usize, usize)>,

    /// Scenario directory
    #[arg(long, default_value = "scenarios")]
    scenarios: PathBuf,

    /// Only run scenarios with this tag
    #[arg(long)]
    tag: Option<String>,

    /// Only run the scenario with this name
    #[arg(long, conflicts_with = "tag")]
    name: Option<String>,

    /// Rerun a failing test up to N more times
    #[arg(long, default_value_t = 0)]
    reruns: u32,

    /// Show the browser window (ignored in CI)
    #[arg(long)]
    headed: bool,

    /// chromium, firefox or webkit
    #[arg(long)]
    browser: Option<BrowserKind>,

    /// Results directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Configuration directory
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn parse_shard(value: &str) -> Result<(usize, usize), String> {
    let (index, total) = value
        .split_once('/')
        .ok_or_else(|| format!("expected I/N, got '{}'", value))?;
    let index: usize = index.trim().parse().map_err(|_| format!("bad shard index '{}'", index))?;
    let total: usize = total.trim().parse().map_err(|_| format!("bad shard count '{}'", total))?;
    if total == 0 || index >= total {
        return Err(format!("shard {} out of range for {} shard(s)", index, total));
    }
    Ok((index, total))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("ParaBank UI tests v{}", parabank_common::VERSION);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let config_dir = cli.config_dir.clone().unwrap_or_else(parabank_common::default_config_dir);
    let mut settings = Settings::load(&config_dir, cli.env)
        .with_context(|| format!("loading {} settings from {}", cli.env, config_dir.display()))?;

    if cli.no_restore_session {
        settings.session.restore = false;
    }
    if cli.cleanup_session {
        settings.session.cleanup = true;
    }
    if cli.headed && !settings.ci {
        settings.browser.headless = false;
    }
    if let Some(kind) = cli.browser {
        settings.browser.kind = kind.as_str().to_string();
    }
    if let Some(output) = &cli.output {
        settings.session.state_dir = output.clone();
    }
    Ok(settings)
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let settings = load_settings(&cli)?;
    info!("Environment {} at {}", settings.environment, settings.base_url);

    match cli.workers {
        Some(n) if n > 1 => coordinate(&settings, n).await,
        _ => run_worker(&cli, settings).await,
    }
}

async fn run_worker(cli: &Cli, settings: Settings) -> anyhow::Result<i32> {
    check_playwright_installed()?;

    let worker = WorkerId::parse(cli.worker.as_deref());
    let browser = PlaywrightBrowser::launch(PlaywrightConfig::from_settings(&settings)?).await?;

    let config = RunnerConfig {
        scenarios_dir: cli.scenarios.clone(),
        output_dir: cli.output.clone().unwrap_or_else(parabank_common::default_results_dir),
        reruns: cli.reruns,
        shard: cli.shard,
    };
    let mut runner = TestRunner::new(settings, Arc::new(browser), worker, config)?;

    runner.start().await?;
    let suite = match (&cli.name, &cli.tag) {
        (Some(name), _) => runner.run_named(name).await,
        (None, Some(tag)) => runner.run_tagged(tag).await,
        (None, None) => runner.run_all().await,
    };
    let suite = match suite {
        Ok(suite) => suite,
        Err(e) => {
            let result = runner.finish(&Default::default()).await;
            if let Err(finish_err) = result {
                warn!("Shutdown after error failed: {}", finish_err);
            }
            return Err(e.into());
        }
    };

    runner.write_results(&suite)?;
    runner.finish(&suite).await?;
    if let Some(reason) = &suite.aborted {
        error!("Stopping: {}", reason);
    }
    Ok(suite.exit_code())
}

/// Clear stale metric groups once, then run `n` sharded workers of this binary
async fn coordinate(settings: &Settings, n: usize) -> anyhow::Result<i32> {
    anyhow::ensure!(n <= MAX_WORKERS, "at most {} workers are supported", MAX_WORKERS);

    if settings.metrics.enabled {
        MetricsEmitter::from_config(&settings.metrics)?.cleanup_metrics().await;
    }

    let exe = std::env::current_exe().context("locating own executable")?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let forwarded = strip_coordinator_args(&args);

    info!("Starting {} workers", n);
    let mut children = Vec::with_capacity(n);
    for index in 0..n {
        let worker = WorkerId::indexed(index);
        let child = Command::new(&exe)
            .args(&forwarded)
            .arg("--worker")
            .arg(worker.as_str())
            .arg("--shard")
            .arg(format!("{}/{}", index, n))
            .env("PARABANK_WORKER", worker.as_str())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning worker {}", worker))?;
        children.push((worker, child));
    }

    let mut codes = Vec::with_capacity(n);
    for (worker, mut child) in children {
        let status = child.wait().await?;
        let code = status.code().unwrap_or(EXIT_ERROR);
        info!("Worker {} exited with {}", worker, code);
        codes.push(code);
    }
    Ok(aggregate_exit_codes(&codes))
}

/// Drop the flags only the coordinator understands
fn strip_coordinator_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--workers" | "--worker" | "--shard" => {
                iter.next();
            }
            a if a.starts_with("--workers=") || a.starts_with("--worker=") || a.starts_with("--shard=") => {}
            _ => out.push(arg.clone()),
        }
    }
    out
}

/// Worst worker wins: abort, then error, then failures
fn aggregate_exit_codes(codes: &[i32]) -> i32 {
    if codes.contains(&EXIT_ABORTED) {
        EXIT_ABORTED
    } else if codes.iter().any(|c| *c != EXIT_OK && *c != EXIT_FAILURES) {
        EXIT_ERROR
    } else if codes.contains(&EXIT_FAILURES) {
        EXIT_FAILURES
    } else {
        EXIT_OK
    }
}
