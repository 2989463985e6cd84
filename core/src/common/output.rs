use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::eval::RougeReport;
use crate::parallel::Shard;

/// Outcome of a run as seen by one node's coordinator. Only the node hosting
/// the rendezvous carries summaries and scores.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_id: Option<String>,
    pub world_size: usize,
    pub summaries: Vec<String>,
    pub covered: Option<Shard>,
    pub scores: Option<RougeReport>,
    pub summary_file: Option<PathBuf>,
}

/// One summary per line; embedded line breaks become spaces so the line
/// count always matches the number of summaries.
pub fn write_summaries<P: AsRef<Path>>(path: P, summaries: &[String]) -> Result<()> {
    let path = path.as_ref();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = std::fs::File::create(path)
        .map_err(|e| anyhow!("create {}: {}", path.display(), e))?;
    let mut writer = BufWriter::new(file);
    for summary in summaries {
        let line = summary.replace("\r\n", " ").replace(['\n', '\r'], " ");
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    tracing::info!("wrote {} summaries to {}", summaries.len(), path.display());
    Ok(())
}

pub fn write_scores<P: AsRef<Path>>(path: P, report: &RougeReport) -> Result<()> {
    let path = path.as_ref();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

#[test]
fn test_write_summaries_one_per_line() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("out").join("generated_summaries.txt");
    let summaries = vec![
        "first".to_string(),
        "second\nwith break".to_string(),
        String::new(),
        "windows\r\nbreak".to_string(),
    ];
    write_summaries(&path, &summaries)?;
    let content = std::fs::read_to_string(&path)?;
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(
        lines,
        vec!["first", "second with break", "", "windows break"]
    );
    Ok(())
}

#[test]
fn test_write_scores() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("rouge_scores.json");
    let report = RougeReport {
        count: 3,
        ..Default::default()
    };
    write_scores(&path, &report)?;
    let loaded: RougeReport = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(loaded, report);
    Ok(())
}
