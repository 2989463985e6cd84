use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::common::tokenizer::normalized_words;

/// Scores predictions against references, pairwise and in order.
pub trait Scorer: Send + Sync {
    fn score(&self, predictions: &[String], references: &[String]) -> Result<RougeReport>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RougeScore {
    pub f: f64,
    pub p: f64,
    pub r: f64,
}

impl RougeScore {
    fn from_counts(overlap: usize, predicted: usize, reference: usize) -> Self {
        if overlap == 0 || predicted == 0 || reference == 0 {
            return Self::default();
        }
        let p = overlap as f64 / predicted as f64;
        let r = overlap as f64 / reference as f64;
        Self {
            f: 2.0 * p * r / (p + r),
            p,
            r,
        }
    }

    fn accumulate(&mut self, other: &RougeScore) {
        self.f += other.f;
        self.p += other.p;
        self.r += other.r;
    }

    fn scale(&mut self, factor: f64) {
        self.f *= factor;
        self.p *= factor;
        self.r *= factor;
    }
}

/// Macro averages over all scored pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RougeReport {
    #[serde(rename = "rouge-1")]
    pub rouge_1: RougeScore,
    #[serde(rename = "rouge-2")]
    pub rouge_2: RougeScore,
    #[serde(rename = "rouge-l")]
    pub rouge_l: RougeScore,
    pub count: usize,
}

impl std::fmt::Display for RougeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (name, s) in [
            ("rouge-1", &self.rouge_1),
            ("rouge-2", &self.rouge_2),
            ("rouge-l", &self.rouge_l),
        ] {
            write!(f, "{}: f={:.4} p={:.4} r={:.4}; ", name, s.f, s.p, s.r)?;
        }
        write!(f, "count={}", self.count)
    }
}

fn ngrams(words: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    if words.len() >= n {
        for gram in words.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

fn rouge_n(pred: &[String], reference: &[String], n: usize) -> RougeScore {
    let pred_grams = ngrams(pred, n);
    let ref_grams = ngrams(reference, n);
    let overlap = pred_grams
        .iter()
        .map(|(gram, count)| ref_grams.get(gram).map_or(0, |c| (*c).min(*count)))
        .sum();
    RougeScore::from_counts(
        overlap,
        pred_grams.values().sum(),
        ref_grams.values().sum(),
    )
}

fn lcs_len(a: &[String], b: &[String]) -> usize {
    let mut row = vec![0usize; b.len() + 1];
    for x in a {
        let mut diag = 0;
        for (j, y) in b.iter().enumerate() {
            let up = row[j + 1];
            row[j + 1] = if x == y { diag + 1 } else { up.max(row[j]) };
            diag = up;
        }
    }
    row[b.len()]
}

fn rouge_l(pred: &[String], reference: &[String]) -> RougeScore {
    RougeScore::from_counts(lcs_len(pred, reference), pred.len(), reference.len())
}

/// ROUGE-1, ROUGE-2 and ROUGE-L (longest common subsequence) over lowercased
/// alphanumeric words.
#[derive(Debug, Default, Clone, Copy)]
pub struct RougeScorer;

impl Scorer for RougeScorer {
    fn score(&self, predictions: &[String], references: &[String]) -> Result<RougeReport> {
        if predictions.len() != references.len() {
            return Err(anyhow!(
                "{} predictions for {} references",
                predictions.len(),
                references.len()
            ));
        }
        let mut report = RougeReport {
            count: predictions.len(),
            ..Default::default()
        };
        if predictions.is_empty() {
            return Ok(report);
        }
        for (pred, reference) in predictions.iter().zip(references) {
            let pred: Vec<String> = normalized_words(pred).collect();
            let reference: Vec<String> = normalized_words(reference).collect();
            report.rouge_1.accumulate(&rouge_n(&pred, &reference, 1));
            report.rouge_2.accumulate(&rouge_n(&pred, &reference, 2));
            report.rouge_l.accumulate(&rouge_l(&pred, &reference));
        }
        let factor = 1.0 / predictions.len() as f64;
        report.rouge_1.scale(factor);
        report.rouge_2.scale(factor);
        report.rouge_l.scale(factor);
        Ok(report)
    }
}

#[cfg(test)]
fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_identical_and_disjoint() -> Result<()> {
    let scorer = RougeScorer;
    let texts = strings(&["the cat sat on the mat", "a quick brown fox"]);
    let report = scorer.score(&texts, &texts)?;
    for s in [report.rouge_1, report.rouge_2, report.rouge_l] {
        assert!((s.f - 1.0).abs() < 1e-9, "{:?}", s);
        assert!((s.p - 1.0).abs() < 1e-9);
        assert!((s.r - 1.0).abs() < 1e-9);
    }
    assert_eq!(report.count, 2);

    let report = scorer.score(&strings(&["alpha beta"]), &strings(&["gamma delta"]))?;
    assert_eq!(report.rouge_1, RougeScore::default());
    assert_eq!(report.rouge_l, RougeScore::default());
    Ok(())
}

#[test]
fn test_partial_overlap() -> Result<()> {
    let report = RougeScorer.score(
        &strings(&["the cat was found under the bed"]),
        &strings(&["the cat was under the bed"]),
    )?;
    // 6 of 7 predicted unigrams appear in the 6-word reference
    assert!((report.rouge_1.p - 6.0 / 7.0).abs() < 1e-9);
    assert!((report.rouge_1.r - 1.0).abs() < 1e-9);
    // lcs = "the cat was under the bed"
    assert!((report.rouge_l.r - 1.0).abs() < 1e-9);
    // bigrams: the cat, cat was, under the, the bed
    assert!((report.rouge_2.p - 4.0 / 6.0).abs() < 1e-9);
    assert!((report.rouge_2.r - 4.0 / 5.0).abs() < 1e-9);
    Ok(())
}

#[test]
fn test_length_mismatch_and_json_keys() -> Result<()> {
    assert!(RougeScorer.score(&strings(&["a"]), &[]).is_err());
    let report = RougeScorer.score(&[], &[])?;
    let json = serde_json::to_value(&report)?;
    assert!(json.get("rouge-1").is_some());
    assert!(json["rouge-l"].get("f").is_some());
    assert_eq!(json["count"], 0);
    Ok(())
}
