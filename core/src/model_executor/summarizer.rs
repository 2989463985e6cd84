use anyhow::Result;
use candle::{DType, Device, Tensor, D};

use super::checkpoint::{Checkpoint, EMBEDDINGS, LEAD_BIAS};
use crate::common::tokenizer::TextTokenizer;
use crate::data::SummaryExample;

const NORM_EPS: f64 = 1e-8;

/// Turns a batch of examples into one summary each, in input order.
pub trait Summarizer: Send {
    fn summarize_batch(&mut self, batch: &[SummaryExample]) -> Result<Vec<String>>;
}

/// Keeps sentences `indices` (any order) in source order, joined by spaces.
fn extract(source: &[String], mut indices: Vec<usize>) -> String {
    indices.sort_unstable();
    indices
        .into_iter()
        .map(|i| source[i].trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// First `max_sentences` sentences of the article.
pub struct LeadSummarizer {
    max_sentences: usize,
}

impl LeadSummarizer {
    pub fn new(max_sentences: usize) -> Self {
        Self { max_sentences }
    }
}

impl Summarizer for LeadSummarizer {
    fn summarize_batch(&mut self, batch: &[SummaryExample]) -> Result<Vec<String>> {
        Ok(batch
            .iter()
            .map(|example| {
                let n = example.source.len().min(self.max_sentences);
                extract(&example.source, (0..n).collect())
            })
            .collect())
    }
}

/// Extractive summarizer over checkpoint embeddings.
///
/// A sentence is embedded as the mean of its token embeddings; sentences are
/// ranked by cosine similarity to the article centroid plus
/// `lead_bias / (1 + position)`. The best `max_sentences` are emitted in
/// source order, ties going to the earlier sentence.
pub struct CentroidSummarizer {
    embeddings: Tensor,
    vocab_size: usize,
    dim: usize,
    lead_bias: f32,
    max_sentences: usize,
    tokenizer: Box<dyn TextTokenizer>,
    device: Device,
}

impl CentroidSummarizer {
    pub fn new(
        checkpoint: &Checkpoint,
        tokenizer: Box<dyn TextTokenizer>,
        max_sentences: usize,
        device: &Device,
    ) -> Result<Self> {
        let embeddings = checkpoint.get(EMBEDDINGS)?.clone();
        let (vocab_size, dim) = embeddings.dims2()?;
        let lead_bias = match checkpoint.get_opt(LEAD_BIAS) {
            Some(t) => t
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()?
                .first()
                .copied()
                .unwrap_or(0.0),
            None => 0.0,
        };
        Ok(Self {
            embeddings,
            vocab_size,
            dim,
            lead_bias,
            max_sentences,
            tokenizer,
            device: device.clone(),
        })
    }

    fn embed_sentence(&self, sentence: &str) -> Result<Tensor> {
        let ids: Vec<u32> = self
            .tokenizer
            .encode(sentence)?
            .into_iter()
            .map(|id| id % self.vocab_size as u32)
            .collect();
        if ids.is_empty() {
            return Ok(Tensor::zeros(self.dim, DType::F32, &self.device)?);
        }
        let ids = Tensor::new(ids.as_slice(), &self.device)?;
        let vectors = self.embeddings.index_select(&ids, 0)?.to_dtype(DType::F32)?;
        Ok(vectors.mean(0)?)
    }

    fn score_sentences(&self, source: &[String]) -> Result<Vec<f32>> {
        let vectors = source
            .iter()
            .map(|s| self.embed_sentence(s))
            .collect::<Result<Vec<_>>>()?;
        // [n, dim]
        let vectors = Tensor::stack(&vectors, 0)?;
        let centroid = vectors.mean_keepdim(0)?;
        let dot = vectors.broadcast_mul(&centroid)?.sum(D::Minus1)?;
        let norms = vectors.sqr()?.sum(D::Minus1)?.sqrt()?;
        let centroid_norm = centroid.sqr()?.sum_all()?.sqrt()?;
        let denom = norms.broadcast_mul(&centroid_norm)?.affine(1.0, NORM_EPS)?;
        let cosine = (dot / denom)?.to_vec1::<f32>()?;
        Ok(cosine
            .into_iter()
            .enumerate()
            .map(|(pos, c)| c + self.lead_bias / (1 + pos) as f32)
            .collect())
    }

    fn summarize(&self, example: &SummaryExample) -> Result<String> {
        if example.source.is_empty() || self.max_sentences == 0 {
            return Ok(String::new());
        }
        let scores = self.score_sentences(&example.source)?;
        let mut order: Vec<usize> = (0..scores.len()).collect();
        // stable: equal scores keep source order
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
        order.truncate(self.max_sentences);
        Ok(extract(&example.source, order))
    }
}

impl Summarizer for CentroidSummarizer {
    fn summarize_batch(&mut self, batch: &[SummaryExample]) -> Result<Vec<String>> {
        batch.iter().map(|example| self.summarize(example)).collect()
    }
}

#[cfg(test)]
fn test_summarizer(max_sentences: usize) -> Result<CentroidSummarizer> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.safetensors");
    super::checkpoint::write_test_checkpoint(&path, 97, 8)?;
    let checkpoint = Checkpoint::load(&path, &Device::Cpu, DType::F32)?;
    CentroidSummarizer::new(
        &checkpoint,
        Box::new(crate::common::tokenizer::HashedTokenizer),
        max_sentences,
        &Device::Cpu,
    )
}

#[test]
fn test_lead_summarizer() -> Result<()> {
    let mut lead = LeadSummarizer::new(2);
    let batch = vec![
        crate::data::example(&["a.", "b.", "c."], &[]),
        crate::data::example(&["only."], &[]),
        crate::data::example(&[], &[]),
    ];
    assert_eq!(lead.summarize_batch(&batch)?, vec!["a. b.", "only.", ""]);
    Ok(())
}

#[test]
fn test_centroid_summary_keeps_source_order() -> Result<()> {
    let mut summarizer = test_summarizer(2)?;
    let source = [
        "The council approved the new budget on Monday.",
        "Weather was mild.",
        "The budget funds schools and roads.",
        "Council members debated the budget for hours.",
    ];
    let example = crate::data::example(&source, &[]);
    let summary = summarizer.summarize_batch(std::slice::from_ref(&example))?;
    assert_eq!(summary.len(), 1);
    let picked: Vec<usize> = source
        .iter()
        .enumerate()
        .filter(|(_, s)| summary[0].contains(*s))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(picked.len(), 2, "{}", summary[0]);
    assert!(picked[0] < picked[1]);
    assert_eq!(
        summary[0],
        format!("{} {}", source[picked[0]], source[picked[1]])
    );
    Ok(())
}

#[test]
fn test_centroid_is_deterministic() -> Result<()> {
    let batch = vec![
        crate::data::example(&["one two three.", "four five.", "six."], &[]),
        crate::data::example(&[], &["x"]),
        crate::data::example(&["!!!", "words here."], &[]),
    ];
    let a = test_summarizer(1)?.summarize_batch(&batch)?;
    let b = test_summarizer(1)?.summarize_batch(&batch)?;
    assert_eq!(a, b);
    assert_eq!(a[1], "");
    assert!(!a[0].is_empty());
    Ok(())
}

#[test]
fn test_centroid_short_article_is_copied() -> Result<()> {
    let mut summarizer = test_summarizer(3)?;
    let batch = vec![crate::data::example(&["first.", "second."], &[])];
    assert_eq!(summarizer.summarize_batch(&batch)?, vec!["first. second."]);
    Ok(())
}
