//! # callscope - Main Entry Point
//!
//! Supports two operational modes:
//! - **Ingest** (`callscope trace.jsonl`): load a recorded trace, aggregate it
//!   and print the report, optionally saving the profile with `--export`
//! - **Load** (`--load profile.json`): print the report of a saved profile
//!
//! Ingestion runs on a blocking thread; Ctrl+C cancels it and exits with 130.

use anyhow::{Context, Result};
use callscope::analysis::ProfileData;
use clap::Parser;
use crossbeam_channel::{bounded, Receiver};
use log::{info, warn};
use std::io::Write;
use std::path::PathBuf;

use callscope::cli::Args;
use callscope::domain::IngestError;
use callscope::export::{load_profile, save_profile, write_report};
use callscope::profiling::{
    CancellationToken, ChannelProgress, ProgressStage, ProgressUpdate, SampleProcessor,
};
use callscope::trace_source::load_trace;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

fn main() {
    env_logger::init();
    // clap exits with status 2 on usage errors.
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<IngestError>() {
        Some(IngestError::Cancelled) => EXIT_CANCELLED,
        _ => EXIT_ERROR,
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    let profile = if let Some(path) = &args.load {
        load_profile(path).with_context(|| format!("Failed to load profile {}", path.display()))?
    } else {
        let trace = args.trace.clone().context("Missing required argument: TRACE")?;
        ingest_trace(&args, trace).await?
    };

    let mut stdout = std::io::stdout().lock();
    write_report(&profile, &args.report_options(), &mut stdout).context("Failed to write report")?;
    stdout.flush()?;

    if let Some(path) = &args.export {
        save_profile(&profile, path)
            .with_context(|| format!("Failed to save profile {}", path.display()))?;
        if !args.quiet {
            eprintln!("saved: {}", path.display());
        }
    }

    Ok(())
}

async fn ingest_trace(args: &Args, trace: PathBuf) -> Result<ProfileData> {
    let cancel = CancellationToken::new();
    let (progress_tx, progress_rx) = bounded(64);
    let printer = (!args.quiet).then(|| std::thread::spawn(move || print_progress(&progress_rx)));

    let options = args.profile_options();
    let source = args.symbol_source();
    let worker_cancel = cancel.clone();

    let mut task = tokio::task::spawn_blocking(move || -> Result<ProfileData, IngestError> {
        let mut reporter = ChannelProgress::new(progress_tx);
        let (raw, loaded) = load_trace(&trace, &mut reporter, &worker_cancel)?;
        info!("{} samples, {} stacks dropped", loaded.samples, loaded.stacks_dropped);

        let (profile, stats) =
            SampleProcessor::new(&raw, source, &options).run(&mut reporter, &worker_cancel)?;
        info!(
            "{}: {} attributed, {} without stack, {} counter events, {} stack cache hits",
            stats.main_process,
            stats.attributed,
            stats.without_stack,
            stats.counter_events,
            stats.resolver.stack_hits
        );
        Ok(profile)
    });

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = &mut ctrl_c => {
            warn!("Interrupted, cancelling ingestion");
            cancel.cancel();
            task.await
        }
    };

    // The printer stops once the worker drops its sender.
    if let Some(handle) = printer {
        handle.join().ok();
    }

    let profile = joined.context("Ingestion thread failed")?.context("Ingestion failed")?;
    Ok(profile)
}

fn print_progress(rx: &Receiver<ProgressUpdate>) {
    let mut last: Option<(ProgressStage, u32)> = None;
    let mut printed = false;

    for update in rx {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let percent = update.percentage() as u32;
        if last == Some((update.stage, percent)) {
            continue;
        }
        if last.is_some_and(|(stage, _)| stage != update.stage) {
            eprintln!();
        }
        last = Some((update.stage, percent));
        eprint!("\r{:<22} {percent:>3}%", update.stage.to_string());
        printed = true;
    }

    if printed {
        eprintln!();
    }
}
