use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use candle::Device;

use crate::common::config::ModelConfig;
use crate::data::{SummarizationDataset, SummaryExample};
use crate::model_executor::{ModelFactory, Summarizer};
use crate::parallel::{
    plan_shard, shorten, ParallelState, RendezvousClient, RendezvousConfig, ResultEntry, Role,
    ShardPolicy,
};

pub struct Worker {
    state: ParallelState,
    reports_progress: bool,
    device: Device,
    batch_size: usize,
    summarizer: Box<dyn Summarizer>,
}

impl Worker {
    pub fn from(model_config: &ModelConfig, role: Role) -> Result<Self> {
        let state = worker_state(role)?;
        let device = common::select_device(state.local_rank())?;
        let summarizer = ModelFactory::load_summarizer(model_config, &device)?;
        Self::with_summarizer(summarizer, role, model_config.batch_size(), device)
    }

    pub fn with_summarizer(
        summarizer: Box<dyn Summarizer>,
        role: Role,
        batch_size: usize,
        device: Device,
    ) -> Result<Self> {
        let state = worker_state(role)?;
        if batch_size == 0 {
            return Err(anyhow!("batch size must be positive"));
        }
        Ok(Self {
            state,
            reports_progress: role.reports_progress(),
            device,
            batch_size,
            summarizer,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Summarizes `examples` batch by batch; output `i` belongs to example `i`.
    pub fn execute(&mut self, examples: &[SummaryExample]) -> Result<Vec<String>> {
        let rank = self.state.rank().to_string();
        let mut outputs = Vec::with_capacity(examples.len());
        let num_batches = examples.len().div_ceil(self.batch_size);
        for (idx, batch) in examples.chunks(self.batch_size).enumerate() {
            let start = Instant::now();
            let summaries = self.summarizer.summarize_batch(batch)?;
            if summaries.len() != batch.len() {
                return Err(anyhow!(
                    "summarizer returned {} outputs for a batch of {}",
                    summaries.len(),
                    batch.len()
                ));
            }
            outputs.extend(summaries);
            metrics::histogram!("absum.batch_secs", "rank" => rank.clone())
                .record(start.elapsed().as_secs_f64());
            metrics::counter!("absum.examples", "rank" => rank.clone())
                .increment(batch.len() as u64);
            if self.reports_progress {
                tracing::info!(
                    "batch {}/{} done in {:?}",
                    idx + 1,
                    num_batches,
                    start.elapsed()
                );
            }
        }
        Ok(outputs)
    }
}

fn worker_state(role: Role) -> Result<ParallelState> {
    role.parallel_state()
        .ok_or_else(|| anyhow!("{} cannot run inference", role))
}

/// Everything a worker needs besides its placement.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub model_config: ModelConfig,
    pub dataset: Arc<SummarizationDataset>,
    pub top_n: Option<usize>,
    pub shard_policy: ShardPolicy,
    pub rendezvous: RendezvousConfig,
}

/// Life of one rank: join the group, summarize the own shard, hand the
/// result to the rendezvous host.
pub async fn run_worker(role: Role, ctx: WorkerContext) -> Result<ResultEntry> {
    let state = worker_state(role)?;
    let rank = state.rank();
    let client = RendezvousClient::join(&ctx.rendezvous, rank).await?;
    tracing::info!("rank {} joined run {}", rank, client.run_id());

    let total = shorten(ctx.dataset.len(), ctx.top_n);
    let shard = plan_shard(total, state.world_size(), rank, ctx.shard_policy)?;
    tracing::info!("rank {} assigned shard {} of {}", rank, shard, total);

    let start = Instant::now();
    let dataset = ctx.dataset.clone();
    let model_config = ctx.model_config.clone();
    let outputs = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
        let mut worker = Worker::from(&model_config, role)?;
        worker.execute(dataset.shard(shard)?)
    })
    .await??;
    tracing::info!("rank {} duration {:?}", rank, start.elapsed());

    let entry = ResultEntry::new(rank, shard, outputs);
    client.submit(entry.clone()).await?;
    Ok(entry)
}

#[cfg(test)]
struct EchoSummarizer;

#[cfg(test)]
impl Summarizer for EchoSummarizer {
    fn summarize_batch(&mut self, batch: &[SummaryExample]) -> Result<Vec<String>> {
        Ok(batch.iter().map(|e| e.source.join("|")).collect())
    }
}

#[test]
fn test_execute_in_batches() -> Result<()> {
    let examples: Vec<SummaryExample> = (0..5)
        .map(|i| crate::data::example(&[&i.to_string()], &[]))
        .collect();
    let mut worker = Worker::with_summarizer(
        Box::new(EchoSummarizer),
        Role::standalone_worker(),
        2,
        Device::Cpu,
    )?;
    assert_eq!(worker.execute(&examples)?, vec!["0", "1", "2", "3", "4"]);
    assert!(worker.execute(&[])?.is_empty());
    assert!(Worker::with_summarizer(
        Box::new(EchoSummarizer),
        Role::standalone_worker(),
        0,
        Device::Cpu
    )
    .is_err());
    assert!(Worker::with_summarizer(
        Box::new(EchoSummarizer),
        Role::coordinator(0),
        2,
        Device::Cpu
    )
    .is_err());
    Ok(())
}
