use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use kraken::cli::WorkerOpts;
use kraken::disk::SystemDisks;
use kraken::{logger, shutdown, Transport, Worker, WorkerConfig};

fn main() -> Result<()> {
    let opts = WorkerOpts::parse();
    logger::init(opts.verbose);

    let mut config = WorkerConfig::load(&opts.config)?;
    if let Some(coordinator) = opts.coordinator {
        config.coordinator = coordinator;
    }

    println!("Starting Kloud Kraken worker:");
    println!("  Coordinator: {}", config.coordinator);
    println!("  Staging:     {}", config.staging_dir.display());
    println!("  Headroom:    {} bytes", config.reserved_headroom);
    println!("  Max file:    {} bytes", config.max_file_size);

    let transport = Transport::from_settings(config.tls.as_ref()).context("Failed to set up TLS")?;
    let worker = Worker::new(config, transport, Arc::new(SystemDisks))?;

    let (trigger, stop) = shutdown::channel();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted; abandoning session...");
        trigger.trigger();
    })
    .context("Error setting Ctrl-C handler")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let report = rt.block_on(worker.run(stop))?;
    println!(
        "Done: {} files received, {} processed, {} failed, completed={}",
        report.received, report.processing.processed, report.processing.failed, report.completed
    );
    Ok(())
}
