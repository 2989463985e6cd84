use anyhow::Result;
use candle::Device;
use strum_macros::{Display, EnumString};

use super::checkpoint::Checkpoint;
use super::summarizer::{CentroidSummarizer, LeadSummarizer, Summarizer};
use crate::common::config::ModelConfig;
use crate::common::tokenizer::load_tokenizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, clap::ValueEnum)]
#[strum(serialize_all = "snake_case")]
pub enum ModelType {
    Centroid,
    Lead,
}

pub struct ModelFactory;
impl ModelFactory {
    /// Loads the checkpoint named by `cfg` onto `device` and builds the
    /// summarizer for its model type. The checkpoint is validated even for
    /// model types that do not read its weights.
    pub fn load_summarizer(cfg: &ModelConfig, device: &Device) -> Result<Box<dyn Summarizer>> {
        let checkpoint = Checkpoint::load(cfg.checkpoint(), device, cfg.get_dtype())?;
        match cfg.model_type() {
            ModelType::Centroid => {
                let tokenizer = load_tokenizer(cfg.cache_dir())?;
                Ok(Box::new(CentroidSummarizer::new(
                    &checkpoint,
                    tokenizer,
                    cfg.max_sentences(),
                    device,
                )?))
            }
            ModelType::Lead => Ok(Box::new(LeadSummarizer::new(cfg.max_sentences()))),
        }
    }
}

#[test]
fn test_load_summarizer() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("dist_abssum_model.safetensors");
    super::checkpoint::write_test_checkpoint(&path, 32, 4)?;
    let batch = vec![crate::data::example(&["a b.", "c d.", "e f."], &[])];
    for model_type in [ModelType::Centroid, ModelType::Lead] {
        let cfg = ModelConfig::new(&path, dir.path())
            .with_model_type(model_type)
            .with_max_sentences(2);
        let mut summarizer = ModelFactory::load_summarizer(&cfg, &Device::Cpu)?;
        let out = summarizer.summarize_batch(&batch)?;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].split(". ").count(), 2, "{}: {}", model_type, out[0]);
    }
    let cfg = ModelConfig::new(dir.path().join("missing.safetensors"), dir.path());
    assert!(ModelFactory::load_summarizer(&cfg, &Device::Cpu).is_err());
    Ok(())
}
