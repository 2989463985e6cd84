mod common;
mod data;
mod engine;
mod eval;
mod model_executor;
mod parallel;
mod worker;

pub use crate::common::config::{DataConfig, ModelConfig, OutputConfig, ParallelConfig, RunArgs};
pub use crate::common::output::RunReport;
pub use crate::common::tokenizer::{load_tokenizer, HashedTokenizer, PretrainedTokenizer, TextTokenizer};
pub use crate::data::{SummarizationDataset, SummaryExample};
pub use crate::engine::{run_direct, Coordinator};
pub use crate::eval::{RougeReport, RougeScore, RougeScorer, Scorer};
pub use crate::model_executor::{
    CentroidSummarizer, Checkpoint, LeadSummarizer, ModelFactory, ModelType, Summarizer,
    EMBEDDINGS, LEAD_BIAS, MODEL_PREFIX,
};
pub use crate::parallel::{
    assemble, covered_range, parse_dist_url, plan_shard, shorten, CollectError,
    CollectedResults, ParallelState, RendezvousClient, RendezvousConfig, RendezvousError,
    RendezvousMessage, RendezvousServer, ResultCollector, ResultEntry, ResultSender, Role, Shard,
    ShardError, ShardPolicy,
};
pub use crate::worker::{run_worker, Worker, WorkerContext};
