use anyhow::Context;
use clap::Parser;
use pebsmon::channel_set::ChannelSet;
use pebsmon::cli::Cli;
use pebsmon::error::exit_code;
use pebsmon::hotness::PageTracker;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(err) = e.downcast_ref::<pebsmon::Error>() {
                ExitCode::from(err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    cli.validate()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Invalid arguments")?;

    let kinds: Vec<_> = cli.events.iter().map(|e| e.kind()).collect();

    let mut set = ChannelSet::new();
    set.init(&kinds).context("Failed to initialize channel set")?;
    set.set_period(cli.period)
        .context("Failed to set sampling period")?;
    for &pid in &cli.pids {
        set.add(pid)
            .with_context(|| format!("Failed to monitor PID {pid}"))?;
        info!(pid, "monitoring");
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl-C handler")?;

    let mut tracker = PageTracker::new(cli.hot_threshold);
    let start = Instant::now();
    let mut last_classify = Instant::now();
    let mut total: u64 = 0;

    info!(
        period = cli.period,
        events = ?kinds.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        "recording (Ctrl-C to stop)"
    );

    while running.load(Ordering::SeqCst) {
        if let Some(max_duration) = cli.duration
            && start.elapsed() >= max_duration
        {
            break;
        }

        let count = set
            .poll_samples(Some(cli.poll_timeout), |sample| {
                debug!(
                    kind = %sample.kind,
                    cpu = sample.cpu,
                    pid = sample.pid,
                    tid = sample.tid,
                    address = format_args!("{:#x}", sample.address),
                    "sample"
                );
                tracker.record(sample);
            })
            .context("Failed to poll samples")?;
        total += count as u64;

        if last_classify.elapsed() >= cli.classify_interval {
            let summary = tracker.classify();
            info!(
                hot = summary.hot_pages,
                cold = summary.cold_pages,
                accesses = summary.accesses,
                total_samples = total,
                "classification pass"
            );
            last_classify = Instant::now();
        }
    }

    let summary = tracker.classify();
    println!(
        "Samples: {} | Pages: {} | Hot: {} | Cold: {}",
        total,
        tracker.page_count(),
        summary.hot_pages,
        summary.cold_pages
    );

    Ok(())
}
