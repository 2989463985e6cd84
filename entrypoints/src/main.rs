use std::time::Duration;

use absum_core::{Coordinator, RunArgs};
use clap::Parser;

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let metrics = common::MetricsBuilder::new()
        .with_flush_period(Duration::from_secs(args.metrics_flush_secs.max(1)))
        .install()?;
    let coordinator = Coordinator::from(&args)?;
    let result = coordinator.run().await;
    metrics.flush();
    let report = result?;
    if let Some(path) = &report.summary_file {
        tracing::info!(
            "{} summaries from {} ranks written to {}",
            report.summaries.len(),
            report.world_size,
            path.display()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = RunArgs::parse();
    let _guard = common::init_tracing(args.log_dir.as_deref(), true);
    tracing::info!("node {} starting", args.rank);

    if let Err(e) = run(args).await {
        tracing::error!("inference failed: {:#}", e);
        std::process::exit(1);
    }
}
