use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use candle::DType;
use clap::Parser;

use crate::model_executor::ModelType;
use crate::parallel::{parse_dist_url, RendezvousConfig, ShardPolicy};

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct RunArgs {
    #[clap(default_value = "0", long, help = "rank of the current node in the cluster")]
    pub rank: usize,
    #[clap(
        default_value = "tcp://127.0.0.1:29500",
        long,
        help = "endpoint every worker uses to form the process group"
    )]
    dist_url: String,
    #[clap(default_value = "1", long, help = "number of nodes in the cluster")]
    node_count: usize,
    #[clap(
        long,
        help = "workers started on this node, one per device. Defaults to the visible device count"
    )]
    workers_per_node: Option<usize>,
    #[clap(
        default_value = "1800",
        long,
        help = "seconds to wait for all workers to join"
    )]
    rendezvous_timeout_secs: u64,
    #[clap(
        default_value = "true",
        long,
        action = clap::ArgAction::Set,
        help = "disable Nagle on rendezvous connections"
    )]
    tcp_nodelay: bool,

    #[clap(default_value = "./abstemp", long, help = "directory holding tokenizer.json")]
    cache_dir: String,
    #[clap(default_value = "./", long, help = "directory with the preprocessed datasets")]
    data_dir: String,
    #[clap(
        default_value = "./abstemp",
        long,
        help = "directory with the model checkpoint, receives the predictions"
    )]
    output_dir: String,
    #[clap(default_value = "train_abssum_dataset_full.jsonl", long)]
    train_file: String,
    #[clap(default_value = "test_abssum_dataset_full.jsonl", long)]
    test_file: String,
    #[clap(default_value = "dist_abssum_model.safetensors", long)]
    model_filename: String,
    #[clap(default_value = "generated_summaries.txt", long)]
    summary_filename: String,
    #[clap(default_value = "rouge_scores.json", long)]
    scores_filename: String,

    #[clap(default_value = "64", long, help = "examples per inference batch")]
    batch_size: usize,
    #[clap(
        default_value = "64",
        long,
        allow_negative_numbers = true,
        help = "number of leading test examples to use, -1 for all"
    )]
    top_n: i64,
    #[clap(
        default_value = "false",
        long,
        action = clap::ArgAction::Set,
        help = "use half-precision model weights"
    )]
    fp16: bool,
    #[clap(value_enum, default_value_t = ModelType::Centroid, long)]
    model_type: ModelType,
    #[clap(default_value = "3", long, help = "sentences per generated summary")]
    max_sentences: usize,
    #[clap(value_enum, default_value_t = ShardPolicy::Exact, long)]
    shard_policy: ShardPolicy,

    #[clap(long, help = "write logs to a daily rolling file in this directory")]
    pub log_dir: Option<String>,
    #[clap(default_value = "60", long)]
    pub metrics_flush_secs: u64,
}

impl RunArgs {
    pub fn create_run_configs(
        &self,
    ) -> Result<(DataConfig, ModelConfig, ParallelConfig, OutputConfig)> {
        let data_dir = Path::new(&self.data_dir);
        let data_cfg = DataConfig {
            test_file: data_dir.join(&self.test_file),
            train_file: data_dir.join(&self.train_file),
            top_n: if self.top_n < 0 {
                None
            } else {
                Some(self.top_n as usize)
            },
        };

        let output_dir = PathBuf::from(&self.output_dir);
        let model_cfg = ModelConfig::new(output_dir.join(&self.model_filename), &self.cache_dir)
            .with_model_type(self.model_type)
            .with_dtype(if self.fp16 { DType::F16 } else { DType::F32 })
            .with_max_sentences(self.max_sentences)
            .with_batch_size(self.batch_size)?;

        let workers_per_node = match self.workers_per_node {
            Some(n) => n,
            None => common::visible_devices(),
        };
        let addr = parse_dist_url(&self.dist_url)?;
        let parallel_cfg = ParallelConfig::new(self.rank, self.node_count, workers_per_node, addr)?
            .with_shard_policy(self.shard_policy)
            .with_rendezvous_timeout(Duration::from_secs(self.rendezvous_timeout_secs))
            .with_nodelay(self.tcp_nodelay);

        let output_cfg = OutputConfig {
            summary_file: output_dir.join(&self.summary_filename),
            scores_file: output_dir.join(&self.scores_filename),
        };
        tracing::info!("{:?}", data_cfg);
        tracing::info!("{:?}", model_cfg);
        tracing::info!("{:?}", parallel_cfg);
        tracing::info!("{:?}", output_cfg);
        Ok((data_cfg, model_cfg, parallel_cfg, output_cfg))
    }
}

#[derive(Debug, Clone)]
pub struct DataConfig {
    pub(crate) test_file: PathBuf,
    // accepted for compatibility, never read
    pub(crate) train_file: PathBuf,
    pub(crate) top_n: Option<usize>,
}

impl DataConfig {
    pub fn test_file(&self) -> &Path {
        &self.test_file
    }
    pub fn top_n(&self) -> Option<usize> {
        self.top_n
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    checkpoint: PathBuf,
    cache_dir: PathBuf,
    model_type: ModelType,
    dtype: DType,
    max_sentences: usize,
    batch_size: usize,
}

impl ModelConfig {
    pub fn new<P: Into<PathBuf>, C: Into<PathBuf>>(checkpoint: P, cache_dir: C) -> Self {
        Self {
            checkpoint: checkpoint.into(),
            cache_dir: cache_dir.into(),
            model_type: ModelType::Centroid,
            dtype: DType::F32,
            max_sentences: 3,
            batch_size: 64,
        }
    }
    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = model_type;
        self
    }
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }
    pub fn with_max_sentences(mut self, max_sentences: usize) -> Self {
        self.max_sentences = max_sentences;
        self
    }
    pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(anyhow!("batch size must be positive"));
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    pub fn checkpoint(&self) -> &Path {
        &self.checkpoint
    }
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
    pub fn model_type(&self) -> ModelType {
        self.model_type
    }
    pub fn get_dtype(&self) -> DType {
        self.dtype
    }
    pub fn max_sentences(&self) -> usize {
        self.max_sentences
    }
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[derive(Debug, Clone)]
pub struct ParallelConfig {
    node_rank: usize,
    node_count: usize,
    workers_per_node: usize,
    shard_policy: ShardPolicy,
    rendezvous: RendezvousConfig,
}

impl ParallelConfig {
    pub fn new(
        node_rank: usize,
        node_count: usize,
        workers_per_node: usize,
        addr: std::net::SocketAddr,
    ) -> Result<Self> {
        if node_count == 0 || workers_per_node == 0 {
            return Err(anyhow!(
                "empty world: {} nodes with {} workers each",
                node_count,
                workers_per_node
            ));
        }
        if node_rank >= node_count {
            return Err(anyhow!(
                "node rank {} out of range for {} nodes",
                node_rank,
                node_count
            ));
        }
        Ok(Self {
            node_rank,
            node_count,
            workers_per_node,
            shard_policy: ShardPolicy::default(),
            rendezvous: RendezvousConfig::new(addr, node_count * workers_per_node),
        })
    }
    pub fn with_shard_policy(mut self, policy: ShardPolicy) -> Self {
        self.shard_policy = policy;
        self
    }
    pub fn with_rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous = self.rendezvous.with_timeout(timeout);
        self
    }
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.rendezvous = self.rendezvous.with_nodelay(nodelay);
        self
    }

    pub fn node_rank(&self) -> usize {
        self.node_rank
    }
    pub fn node_count(&self) -> usize {
        self.node_count
    }
    pub fn workers_per_node(&self) -> usize {
        self.workers_per_node
    }
    pub fn world_size(&self) -> usize {
        self.node_count * self.workers_per_node
    }
    pub fn shard_policy(&self) -> ShardPolicy {
        self.shard_policy
    }
    pub fn rendezvous(&self) -> &RendezvousConfig {
        &self.rendezvous
    }
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub(crate) summary_file: PathBuf,
    pub(crate) scores_file: PathBuf,
}

impl OutputConfig {
    pub fn summary_file(&self) -> &Path {
        &self.summary_file
    }
    pub fn scores_file(&self) -> &Path {
        &self.scores_file
    }
}

#[test]
fn test_default_args() -> Result<()> {
    let args = RunArgs::parse_from(["absum-infer", "--workers-per-node", "2"]);
    let (data_cfg, model_cfg, parallel_cfg, output_cfg) = args.create_run_configs()?;
    assert_eq!(data_cfg.top_n(), Some(64));
    assert_eq!(data_cfg.test_file(), Path::new("./test_abssum_dataset_full.jsonl"));
    assert_eq!(model_cfg.get_dtype(), DType::F32);
    assert_eq!(model_cfg.batch_size(), 64);
    assert_eq!(
        model_cfg.checkpoint(),
        Path::new("./abstemp/dist_abssum_model.safetensors")
    );
    assert_eq!(parallel_cfg.world_size(), 2);
    assert_eq!(parallel_cfg.shard_policy(), ShardPolicy::Exact);
    assert_eq!(
        parallel_cfg.rendezvous().addr,
        "127.0.0.1:29500".parse::<std::net::SocketAddr>()?
    );
    assert_eq!(
        output_cfg.summary_file(),
        Path::new("./abstemp/generated_summaries.txt")
    );
    Ok(())
}

#[test]
fn test_unbounded_top_n_and_fp16() -> Result<()> {
    let args = RunArgs::parse_from([
        "absum-infer",
        "--top-n",
        "-1",
        "--fp16",
        "true",
        "--workers-per-node",
        "1",
        "--shard-policy",
        "literal",
        "--node-count",
        "2",
        "--rank",
        "1",
    ]);
    let (data_cfg, model_cfg, parallel_cfg, _) = args.create_run_configs()?;
    assert_eq!(data_cfg.top_n(), None);
    assert_eq!(model_cfg.get_dtype(), DType::F16);
    assert_eq!(parallel_cfg.shard_policy(), ShardPolicy::Literal);
    assert_eq!(parallel_cfg.world_size(), 2);
    assert_eq!(parallel_cfg.node_rank(), 1);
    Ok(())
}

#[test]
fn test_invalid_topology() {
    let args = RunArgs::parse_from(["absum-infer", "--rank", "2", "--workers-per-node", "1"]);
    assert!(args.create_run_configs().is_err());
    let args = RunArgs::parse_from(["absum-infer", "--dist-url", "env://", "--workers-per-node", "1"]);
    assert!(args.create_run_configs().is_err());
    let args = RunArgs::parse_from(["absum-infer", "--batch-size", "0", "--workers-per-node", "1"]);
    assert!(args.create_run_configs().is_err());
}
