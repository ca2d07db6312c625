use anyhow::{Context, Result};
use clap::Parser;

use kraken::cli::BrainOpts;
use kraken::{logger, shutdown, Coordinator, CoordinatorConfig, Transport};

fn main() -> Result<()> {
    let opts = BrainOpts::parse();
    logger::init(opts.verbose);

    let mut config = CoordinatorConfig::load(&opts.config)?;
    if let Some(listen) = opts.listen {
        config.listen = listen;
    }
    if let Some(capacity) = opts.capacity {
        config.capacity = capacity;
    }

    println!("Starting Kloud Kraken brain:");
    println!("  Listen:   {}", config.listen);
    println!("  Capacity: {}", config.capacity);
    println!("  Pool:     {}", config.pool_dir.display());
    println!("  Results:  {}", config.results_path.display());
    if config.tls.is_some() {
        println!("  Security: mutual TLS");
    } else {
        eprintln!("WARNING: no [tls] section; control and data streams are unencrypted");
    }

    let transport = Transport::from_settings(config.tls.as_ref()).context("Failed to set up TLS")?;
    let coordinator = Coordinator::new(config, transport)?;

    let (trigger, stop) = shutdown::channel();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted; closing sessions...");
        trigger.trigger();
    })
    .context("Error setting Ctrl-C handler")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let reports = rt.block_on(async {
        let listener = coordinator.bind().await?;
        coordinator.serve(listener, stop).await
    })?;

    let transferred: usize = reports.iter().map(|r| r.transferred).sum();
    let failed: usize = reports.iter().map(|r| r.failed).sum();
    let output_bytes: u64 = reports.iter().map(|r| r.output_bytes).sum();
    let broken = reports.iter().filter(|r| r.error.is_some()).count();
    println!(
        "Done: {} sessions ({} ended in error), {} files transferred, {} failed, {} bytes of results",
        reports.len(),
        broken,
        transferred,
        failed,
        output_bytes
    );
    Ok(())
}
