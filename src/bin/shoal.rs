//! Standalone runtime launcher: validates a configuration, optionally
//! dumps it, and can run a small self-test workload.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shoal::{Error, ErrorKind, RuntimeBuilder, RuntimeConfig};

#[derive(Parser)]
#[command(name = "shoal", version, about = "Elastic user-level thread runtime")]
struct Args {
    /// Path to the runtime configuration file.
    config: PathBuf,

    /// Run a self-test workload with this many threads, then exit.
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Print the parsed configuration as JSON and exit.
    #[arg(long)]
    dump_config: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "startup failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> shoal::Result<()> {
    let config = RuntimeConfig::from_file(&args.config)?;
    if args.dump_config {
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| Error::with_message(ErrorKind::Internal, e.to_string()))?;
        println!("{json}");
        return Ok(());
    }

    let runtime = RuntimeBuilder::new(config).start()?;
    if args.threads == 0 {
        info!("configuration valid; nothing to run (use --threads)");
        runtime.shutdown();
        return Ok(());
    }

    let threads = args.threads;
    let counter = Arc::new(AtomicU64::new(0));
    let total = runtime.run(move || {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = counter.clone();
                shoal::spawn_move(move || {
                    for _ in 0..1_000 {
                        counter.fetch_add(1, Ordering::Relaxed);
                        shoal::yield_now();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join();
        }
        counter.load(Ordering::Relaxed)
    });
    info!(increments = total.unwrap_or(0), "self-test complete");
    Ok(())
}
