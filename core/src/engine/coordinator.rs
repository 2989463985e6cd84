use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use candle::Device;
use tokio::task::{JoinHandle, JoinSet};

use crate::common::config::{DataConfig, ModelConfig, OutputConfig, ParallelConfig, RunArgs};
use crate::common::output::{write_scores, write_summaries, RunReport};
use crate::data::SummarizationDataset;
use crate::eval::{RougeScorer, Scorer};
use crate::model_executor::Checkpoint;
use crate::parallel::{
    covered_range, shorten, RendezvousError, RendezvousServer, ResultCollector, Role,
};
use crate::worker::{run_worker, Worker, WorkerContext};

/// Per-node driver. Starts one worker per local device; on node 0 it also
/// hosts the rendezvous, collects every rank's results and writes them out.
pub struct Coordinator {
    role: Role,
    data_config: DataConfig,
    model_config: ModelConfig,
    parallel_config: ParallelConfig,
    output_config: OutputConfig,
    scorer: Box<dyn Scorer>,
}

impl Coordinator {
    pub fn from(args: &RunArgs) -> Result<Self> {
        let (data_config, model_config, parallel_config, output_config) =
            args.create_run_configs()?;
        Ok(Self::new(
            data_config,
            model_config,
            parallel_config,
            output_config,
        ))
    }

    pub fn new(
        data_config: DataConfig,
        model_config: ModelConfig,
        parallel_config: ParallelConfig,
        output_config: OutputConfig,
    ) -> Self {
        Self {
            role: Role::coordinator(parallel_config.node_rank()),
            data_config,
            model_config,
            parallel_config,
            output_config,
            scorer: Box::new(RougeScorer),
        }
    }

    pub fn with_scorer(mut self, scorer: Box<dyn Scorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn run(self) -> Result<RunReport> {
        let start = Instant::now();
        let world_size = self.parallel_config.world_size();
        tracing::info!("{} starting, world size {}", self.role, world_size);
        metrics::gauge!("absum.world_size").set(world_size as f64);

        let dataset = Arc::new(SummarizationDataset::load(&self.data_config.test_file)?);
        tracing::debug!(
            "train file {} is not used for inference",
            self.data_config.train_file.display()
        );
        // fail fast on a bad checkpoint before any worker joins
        Checkpoint::load(
            self.model_config.checkpoint(),
            &Device::Cpu,
            self.model_config.get_dtype(),
        )?;

        let mut rendezvous = self.parallel_config.rendezvous().clone();
        let mut hosted = None;
        let mut serve = None;
        if self.role.hosts_rendezvous() {
            let server = RendezvousServer::bind(rendezvous.clone()).await?;
            rendezvous = rendezvous.with_addr(server.local_addr()?);
            let run_id = server.run_id();
            let collector = ResultCollector::new(world_size);
            serve = Some(tokio::spawn(server.serve(collector.sender())));
            hosted = Some((run_id, collector));
        }

        let ctx = WorkerContext {
            model_config: self.model_config.clone(),
            dataset: dataset.clone(),
            top_n: self.data_config.top_n,
            shard_policy: self.parallel_config.shard_policy(),
            rendezvous,
        };
        let mut workers = JoinSet::new();
        for role in self.role.local_workers(
            self.parallel_config.node_count(),
            self.parallel_config.workers_per_node(),
        ) {
            workers.spawn(run_worker(role, ctx.clone()));
        }

        // the first failure, local or in the rendezvous, stops everything
        let mut first_err = None;
        loop {
            tokio::select! {
                joined = workers.join_next() => {
                    let failure = match joined {
                        None => break,
                        Some(Ok(Ok(entry))) => {
                            tracing::debug!("rank {} finished shard {}", entry.rank, entry.shard);
                            None
                        }
                        Some(Ok(Err(e))) => Some(e),
                        Some(Err(e)) if e.is_cancelled() => None,
                        Some(Err(e)) => Some(anyhow!("worker task panicked: {}", e)),
                    };
                    if let Some(e) = failure {
                        tracing::error!("worker failed: {}", e);
                        if first_err.is_none() {
                            first_err = Some(e);
                            workers.abort_all();
                        }
                    }
                }
                served = wait_serve(&mut serve) => {
                    serve = None;
                    if let Err(e) = served {
                        tracing::error!("rendezvous failed: {}", e);
                        if first_err.is_none() {
                            first_err = Some(e);
                            workers.abort_all();
                        }
                    }
                }
            }
        }
        if let Some(e) = first_err {
            if let Some(serve) = serve {
                serve.abort();
            }
            return Err(e);
        }

        let (run_id, collector) = match hosted {
            Some(hosted) => hosted,
            None => {
                tracing::info!(
                    "{} done in {:?}, results are collected by node 0",
                    self.role,
                    start.elapsed()
                );
                return Ok(RunReport {
                    world_size,
                    ..Default::default()
                });
            }
        };
        if let Some(serve) = serve {
            serve.await??;
        }
        let results = collector.collect().await?;

        let total = shorten(dataset.len(), self.data_config.top_n);
        let expected = covered_range(total, world_size, self.parallel_config.shard_policy())?;
        if results.covered() != Some(expected) {
            return Err(anyhow!(
                "ranks covered {:?} but this node plans {} of {} examples; check that every node \
                 uses the same dataset, --top-n and --shard-policy",
                results.covered(),
                expected,
                total
            ));
        }
        if results.len() < total {
            tracing::warn!(
                "{} of {} examples not assigned to any rank under the {} shard policy (covered {})",
                total - results.len(),
                total,
                self.parallel_config.shard_policy(),
                expected
            );
        }

        let references = dataset.references();
        let references = references.get(..results.len()).ok_or_else(|| {
            anyhow!(
                "{} summaries for {} references",
                results.len(),
                references.len()
            )
        })?;
        write_summaries(&self.output_config.summary_file, results.outputs())?;
        let scores = self.scorer.score(results.outputs(), references)?;
        tracing::info!("scores: {}", scores);
        write_scores(&self.output_config.scores_file, &scores)?;
        tracing::info!(
            "run {} finished {} summaries in {:?}",
            run_id,
            results.len(),
            start.elapsed()
        );

        Ok(RunReport {
            run_id: Some(run_id.to_string()),
            world_size,
            covered: results.covered(),
            summaries: results.into_outputs(),
            scores: Some(scores),
            summary_file: Some(self.output_config.summary_file.clone()),
        })
    }
}

/// Summarizes the first `top_n` examples in one worker without any
/// rendezvous.
pub fn run_direct(
    model_config: &ModelConfig,
    dataset: &SummarizationDataset,
    top_n: Option<usize>,
) -> Result<Vec<String>> {
    let total = shorten(dataset.len(), top_n);
    let mut worker = Worker::from(model_config, Role::standalone_worker())?;
    worker.execute(&dataset.examples()[..total])
}

/// Resolves once the hosted rendezvous finishes; never without one.
async fn wait_serve(
    serve: &mut Option<JoinHandle<std::result::Result<(), RendezvousError>>>,
) -> Result<()> {
    match serve.as_mut() {
        Some(handle) => Ok(handle.await??),
        None => std::future::pending().await,
    }
}
