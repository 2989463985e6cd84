mod dataset;

#[cfg(test)]
pub(crate) use dataset::example;
pub use dataset::{SummarizationDataset, SummaryExample};
