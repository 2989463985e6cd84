mod checkpoint;
mod model_factory;
mod summarizer;

pub use checkpoint::{Checkpoint, EMBEDDINGS, LEAD_BIAS, MODEL_PREFIX};
#[cfg(test)]
pub(crate) use checkpoint::write_test_checkpoint;
pub use model_factory::{ModelFactory, ModelType};
pub use summarizer::{CentroidSummarizer, LeadSummarizer, Summarizer};
