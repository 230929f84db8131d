//! bx - Ninja-compatible build executor for remote C/C++ compilation.
//!
//! This is a thin CLI over the execution core. It loads the persisted
//! filesystem state, reads a pre-digested step manifest, runs the
//! scheduler, and writes the compatibility logs and the build report.

mod manifest;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use eyre::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bx_digest::ContentStore;
use bx_execute::{BuildGraph, ExecConfig, Scheduler, StepExecutor, StepStatus};
use bx_hashfs::{HashFS, Options};
use bx_ninja::{DepsLog, NinjaLog};
use bx_report::{BuildReport, ReportStore, StepReport, StepStatusReport};
use bx_scandeps::Scandeps;
use bx_sema::{Limits, LimitsConfig};

#[derive(Parser, Debug)]
#[command(name = "bx", version, about = "build executor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a build.
    Build {
        /// Change to this directory (the exec root) first.
        #[arg(short = 'C', long)]
        dir: Option<Utf8PathBuf>,

        /// Step manifest to build.
        #[arg(short = 'f', long, default_value = "build.bx.json")]
        manifest: Utf8PathBuf,

        /// Keep scheduling unaffected steps after a failure.
        #[arg(short = 'k', long)]
        keep_going: bool,

        /// Treat a missing output after a local run as a warning.
        #[arg(long)]
        ignore_missing_outputs: bool,

        /// Local concurrency override.
        #[arg(short = 'j', long)]
        jobs: Option<usize>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Build {
            dir,
            manifest,
            keep_going,
            ignore_missing_outputs,
            jobs,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start runtime")?;
            runtime.block_on(build(
                dir,
                manifest,
                keep_going,
                ignore_missing_outputs,
                jobs,
            ))
        }
    }
}

async fn build(
    dir: Option<Utf8PathBuf>,
    manifest: Utf8PathBuf,
    keep_going: bool,
    ignore_missing_outputs: bool,
    jobs: Option<usize>,
) -> Result<()> {
    if let Some(dir) = &dir {
        std::env::set_current_dir(dir).with_context(|| format!("chdir {dir}"))?;
    }
    let exec_root = std::env::current_dir()
        .context("resolving exec root")?
        .canonicalize()
        .context("canonicalizing exec root")?;
    let exec_root = Utf8PathBuf::from_path_buf(exec_root)
        .map_err(|p| eyre::eyre!("exec root is not utf-8: {}", p.display()))?;
    let build_id = std::env::var("BX_BUILD_ID").unwrap_or_else(|_| String::new());
    let project = std::env::var("BX_PROJECT").unwrap_or_else(|_| String::new());
    let rbe_instance = std::env::var("BX_REAPI_INSTANCE").unwrap_or_else(|_| String::new());
    info!(
        exec_root = %exec_root,
        build_id = %build_id,
        project = %project,
        rbe_instance = %rbe_instance,
        "starting build"
    );

    let store = Arc::new(
        ContentStore::new(exec_root.join(".bx/store")).context("opening content store")?,
    );
    let fs = Arc::new(HashFS::new(Options { store }));
    let state_path = exec_root.join(".bx/fs_state");
    fs.load(&state_path).context("loading fs state")?;
    fs.set_build_epoch(HashFS::now_ns());

    let steps = manifest::load(&manifest, &exec_root)?;
    if steps.is_empty() {
        bail!("{manifest}: no steps");
    }
    let input_deps = manifest::load_input_deps(&exec_root)?;
    let graph = BuildGraph::new(steps).context("building step graph")?;

    let num_cpu = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let mut limits_config = LimitsConfig::default_for(jobs.unwrap_or(num_cpu), 0);
    apply_limit_overrides(&mut limits_config);
    let limits = Arc::new(Limits::new(&limits_config));

    let deps_log = Arc::new(Mutex::new(
        DepsLog::open(&exec_root.join(".bx_deps")).context("opening deps log")?,
    ));
    let ninja_log = Arc::new(Mutex::new(
        NinjaLog::open(&exec_root.join(".ninja_log")).context("opening ninja log")?,
    ));

    let scandeps = Arc::new(Scandeps::new(fs.clone(), input_deps));
    let executor = Arc::new(StepExecutor::new(
        fs.clone(),
        Some(scandeps),
        None,
        None,
        limits,
        deps_log.clone(),
        ninja_log,
        ExecConfig {
            exec_root: exec_root.to_string(),
            ignore_missing_outputs,
            execution_priority: 0,
        },
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted; canceling build");
                cancel.cancel();
            }
        });
    }

    let mut report = BuildReport::new(exec_root.to_string());
    let scheduler = Scheduler::new(executor, graph, keep_going, cancel);
    let result = scheduler.run().await?;

    for outcome in &result.outcomes {
        if !matches!(
            outcome.status,
            StepStatus::Success | StepStatus::CacheHit | StepStatus::Skipped
        ) {
            eprintln!("FAILED: {} ({})", outcome.id, outcome.rule);
            eprint!("{}", String::from_utf8_lossy(&outcome.stderr));
        }
        report.steps.push(StepReport {
            step_id: outcome.id.clone(),
            rule: outcome.rule.clone(),
            status: report_status(outcome.status),
            exit_code: outcome.exit_code,
            action_digest: String::new(),
            duration_ms: outcome.duration.as_millis() as u64,
            error: outcome.error.clone(),
        });
    }
    report.done = result.done as u64;
    report.cache_hits = result.cache_hits as u64;
    report.skipped = result.skipped as u64;
    report.failed = (result.failed + result.canceled) as u64;
    report.finish(result.success);
    if let Err(e) = ReportStore::new(&exec_root).save(&report) {
        warn!(err = %e, "failed to save build report");
    }

    if let Some(mut log) = deps_log.lock().ok().filter(|l| l.needs_recompact()) {
        if let Err(e) = log.recompact() {
            warn!(err = %e, "deps log recompact failed");
        }
    }
    fs.save(&state_path).context("saving fs state")?;

    if result.success {
        println!(
            "SUCCESS: {} done, {} cached, {} up-to-date",
            result.done, result.cache_hits, result.skipped
        );
        Ok(())
    } else {
        println!(
            "FAILURE: {} failed, {} blocked, {} canceled",
            result.failed, result.blocked, result.canceled
        );
        std::process::exit(1);
    }
}

fn report_status(status: StepStatus) -> StepStatusReport {
    match status {
        StepStatus::Success => StepStatusReport::Success,
        StepStatus::CacheHit => StepStatusReport::CacheHit,
        StepStatus::Skipped => StepStatusReport::Skipped,
        StepStatus::NonZeroExit => StepStatusReport::NonZeroExit,
        StepStatus::Timeout => StepStatusReport::Timeout,
        StepStatus::Canceled => StepStatusReport::Canceled,
    }
}

/// `BX_LIMITS=local=8,remote=80,step=120` overrides pool capacities.
fn apply_limit_overrides(config: &mut LimitsConfig) {
    let Ok(spec) = std::env::var("BX_LIMITS") else {
        return;
    };
    let mut overrides: HashMap<&str, usize> = HashMap::new();
    for part in spec.split(',') {
        let Some((name, value)) = part.split_once('=') else {
            warn!(part, "ignoring malformed BX_LIMITS entry");
            continue;
        };
        match value.trim().parse() {
            Ok(v) => {
                overrides.insert(name.trim(), v);
            }
            Err(_) => warn!(part, "ignoring malformed BX_LIMITS entry"),
        }
    }
    for (name, value) in overrides {
        match name {
            "step" => config.step = value,
            "preproc" => config.preproc = value,
            "scandeps" => config.scandeps = value,
            "local" => config.local = value,
            "fastlocal" => config.fastlocal = value,
            "startlocal" => config.startlocal = value,
            "remote" => config.remote = value,
            "rewrap" => config.rewrap = value,
            "cache" => config.cache = value,
            "thread" => config.thread = value,
            other => warn!(pool = other, "unknown pool in BX_LIMITS"),
        }
    }
}
