use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::parallel::Shard;

/// One article with its reference summary, both as sentence lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryExample {
    pub source: Vec<String>,
    pub target: Vec<String>,
}

impl SummaryExample {
    pub fn new(source: Vec<String>, target: Vec<String>) -> Self {
        Self { source, target }
    }

    /// Reference summary as scored: sentences joined by a single space,
    /// trailing whitespace removed.
    pub fn reference(&self) -> String {
        self.target.join(" ").trim_end().to_string()
    }
}

/// Immutable, ordered set of examples loaded from a JSON-lines file.
#[derive(Debug, Clone, Default)]
pub struct SummarizationDataset {
    examples: Vec<SummaryExample>,
}

impl SummarizationDataset {
    pub fn from_examples(examples: Vec<SummaryExample>) -> Self {
        Self { examples }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow!("open dataset {}: {}", path.display(), e))?;
        let mut examples = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let example: SummaryExample = serde_json::from_str(&line)
                .map_err(|e| anyhow!("{}:{}: invalid example: {}", path.display(), idx + 1, e))?;
            examples.push(example);
        }
        tracing::info!("loaded {} examples from {}", examples.len(), path.display());
        Ok(Self { examples })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(std::fs::File::create(path.as_ref())?);
        for example in &self.examples {
            serde_json::to_writer(&mut writer, example)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[SummaryExample] {
        &self.examples
    }

    pub fn shard(&self, shard: Shard) -> Result<&[SummaryExample]> {
        if shard.end > self.examples.len() || shard.start > shard.end {
            return Err(anyhow!(
                "shard {} out of bounds for {} examples",
                shard,
                self.examples.len()
            ));
        }
        Ok(&self.examples[shard.range()])
    }

    pub fn references(&self) -> Vec<String> {
        self.examples.iter().map(SummaryExample::reference).collect()
    }
}

#[cfg(test)]
pub(crate) fn example(source: &[&str], target: &[&str]) -> SummaryExample {
    SummaryExample::new(
        source.iter().map(|s| s.to_string()).collect(),
        target.iter().map(|s| s.to_string()).collect(),
    )
}

#[test]
fn test_load_skips_blank_lines() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.jsonl");
    std::fs::write(
        &path,
        "{\"source\":[\"a b.\"],\"target\":[\"a.\"]}\n\n{\"source\":[],\"target\":[\"c \"]}\n",
    )?;
    let dataset = SummarizationDataset::load(&path)?;
    assert_eq!(dataset.len(), 2);
    assert_eq!(dataset.references(), vec!["a.", "c"]);
    Ok(())
}

#[test]
fn test_load_reports_bad_line() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.jsonl");
    std::fs::write(&path, "{\"source\":[],\"target\":[]}\nnot json\n")?;
    let err = SummarizationDataset::load(&path).unwrap_err();
    assert!(err.to_string().contains(":2:"), "{}", err);
    Ok(())
}

#[test]
fn test_save_then_shard() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.jsonl");
    let dataset = SummarizationDataset::from_examples(vec![
        example(&["one."], &["1"]),
        example(&["two."], &["2"]),
        example(&["three."], &["3"]),
    ]);
    dataset.save(&path)?;
    let loaded = SummarizationDataset::load(&path)?;
    let shard = loaded.shard(Shard::new(1, 3))?;
    assert_eq!(shard, &dataset.examples()[1..3]);
    assert!(loaded.shard(Shard::new(2, 4)).is_err());
    Ok(())
}
