use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use absum_core::{
    run_direct, Checkpoint, Coordinator, ModelConfig, RunArgs, ShardPolicy, SummarizationDataset,
    SummaryExample, EMBEDDINGS,
};
use anyhow::Result;
use candle::{Device, Tensor};
use clap::Parser;

const TOPICS: [&str; 5] = ["budget", "storm", "election", "match", "harvest"];

fn dataset(n: usize) -> SummarizationDataset {
    let examples = (0..n)
        .map(|i| {
            let topic = TOPICS[i % TOPICS.len()];
            SummaryExample::new(
                vec![
                    format!("Article {} opens with news about the {}.", i, topic),
                    "Officials declined to comment.".to_string(),
                    format!("The {} dominated local debate for {} days.", topic, i + 1),
                    format!("Experts expect the {} to matter next year.", topic),
                ],
                vec![format!("The {} dominated debate.", topic)],
            )
        })
        .collect();
    SummarizationDataset::from_examples(examples)
}

fn write_checkpoint(path: &Path) -> Result<()> {
    let (vocab, dim) = (64, 8);
    let values: Vec<f32> = (0..vocab * dim)
        .map(|i| ((i * 31) % 17) as f32 / 17.0 - 0.5)
        .collect();
    let mut tensors = HashMap::new();
    tensors.insert(
        EMBEDDINGS.to_string(),
        Tensor::from_vec(values, (vocab, dim), &Device::Cpu)?,
    );
    tensors.insert(
        "model.lead_bias".to_string(),
        Tensor::new(&[0.05f32], &Device::Cpu)?,
    );
    Checkpoint::save(&tensors, path)
}

struct Fixture {
    dir: tempfile::TempDir,
    dataset: SummarizationDataset,
}

impl Fixture {
    fn new(n: usize) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let dataset = dataset(n);
        dataset.save(dir.path().join("test_abssum_dataset_full.jsonl"))?;
        write_checkpoint(&dir.path().join("dist_abssum_model.safetensors"))?;
        Ok(Self { dir, dataset })
    }

    fn args(&self, extra: &[&str]) -> RunArgs {
        self.args_with_timeout(30, extra)
    }

    fn args_with_timeout(&self, timeout_secs: u64, extra: &[&str]) -> RunArgs {
        let dir = self.dir.path().to_string_lossy().to_string();
        let mut argv = vec![
            "absum-infer".to_string(),
            "--data-dir".to_string(),
            dir.clone(),
            "--output-dir".to_string(),
            dir.clone(),
            "--cache-dir".to_string(),
            dir,
            "--batch-size".to_string(),
            "2".to_string(),
            "--rendezvous-timeout-secs".to_string(),
            timeout_secs.to_string(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        RunArgs::parse_from(argv)
    }

    fn direct(&self, top_n: Option<usize>) -> Result<Vec<String>> {
        let cfg = ModelConfig::new(
            self.dir.path().join("dist_abssum_model.safetensors"),
            self.dir.path(),
        )
        .with_batch_size(2)?;
        run_direct(&cfg, &self.dataset, top_n)
    }

    fn written(&self) -> Result<Vec<String>> {
        let content =
            std::fs::read_to_string(self.dir.path().join("generated_summaries.txt"))?;
        Ok(content.lines().map(|s| s.to_string()).collect())
    }
}

fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[tokio::test]
async fn test_single_worker_matches_direct_inference() -> Result<()> {
    let fixture = Fixture::new(5)?;
    let args = fixture.args(&["--dist-url", "tcp://127.0.0.1:0", "--workers-per-node", "1"]);
    let report = Coordinator::from(&args)?.run().await?;

    let direct = fixture.direct(Some(64))?;
    assert_eq!(direct.len(), 5);
    assert_eq!(report.summaries, direct);
    assert_eq!(fixture.written()?, direct);
    assert!(fixture.dir.path().join("rouge_scores.json").is_file());
    let scores = report.scores.expect("node 0 scores the run");
    assert_eq!(scores.count, 5);
    assert!(scores.rouge_1.f > 0.0);
    Ok(())
}

#[tokio::test]
async fn test_three_workers_preserve_dataset_order() -> Result<()> {
    let fixture = Fixture::new(10)?;
    let args = fixture.args(&["--dist-url", "tcp://127.0.0.1:0", "--workers-per-node", "3"]);
    let report = Coordinator::from(&args)?.run().await?;

    let direct = fixture.direct(None)?;
    assert_eq!(report.world_size, 3);
    assert_eq!(report.summaries, direct);
    assert_eq!(fixture.written()?, direct);
    for (i, summary) in report.summaries.iter().enumerate() {
        let topic = TOPICS[i % TOPICS.len()];
        assert!(summary.contains(topic), "{}: {}", i, summary);
    }
    Ok(())
}

#[tokio::test]
async fn test_top_n_limits_the_run() -> Result<()> {
    let fixture = Fixture::new(10)?;
    let args = fixture.args(&[
        "--dist-url",
        "tcp://127.0.0.1:0",
        "--workers-per-node",
        "4",
        "--top-n",
        "6",
    ]);
    let report = Coordinator::from(&args)?.run().await?;
    assert_eq!(report.summaries, fixture.direct(Some(6))?);
    assert_eq!(report.scores.map(|s| s.count), Some(6));
    Ok(())
}

#[tokio::test]
async fn test_two_nodes_form_one_group() -> Result<()> {
    let fixture = Fixture::new(7)?;
    let url = format!("tcp://127.0.0.1:{}", free_port()?);
    let node = |rank: &str| {
        fixture.args(&[
            "--dist-url",
            url.as_str(),
            "--node-count",
            "2",
            "--workers-per-node",
            "2",
            "--rank",
            rank,
        ])
    };
    let host = Coordinator::from(&node("0"))?;
    let peer = Coordinator::from(&node("1"))?;
    assert!(host.role().hosts_rendezvous());
    assert!(!peer.role().hosts_rendezvous());

    let (host, peer) = tokio::join!(host.run(), peer.run());
    let (host, peer) = (host?, peer?);
    assert!(peer.summaries.is_empty());
    assert!(peer.run_id.is_none());
    assert_eq!(host.world_size, 4);
    assert_eq!(host.summaries, fixture.direct(None)?);
    Ok(())
}

#[tokio::test]
async fn test_literal_policy_reports_dropped_tail() -> Result<()> {
    let fixture = Fixture::new(3)?;
    let args = fixture.args(&[
        "--dist-url",
        "tcp://127.0.0.1:0",
        "--workers-per-node",
        "49",
        "--top-n",
        "1",
        "--shard-policy",
        "literal",
    ]);
    let report = Coordinator::from(&args)?.run().await?;
    assert!(report.summaries.is_empty());
    assert!(fixture.written()?.is_empty());

    let args = fixture.args(&[
        "--dist-url",
        "tcp://127.0.0.1:0",
        "--workers-per-node",
        "49",
        "--top-n",
        "1",
    ]);
    let report = Coordinator::from(&args)?.run().await?;
    assert_eq!(report.summaries, fixture.direct(Some(1))?);
    assert_eq!(ShardPolicy::default(), ShardPolicy::Exact);
    Ok(())
}

#[tokio::test]
async fn test_missing_checkpoint_fails_before_rendezvous() -> Result<()> {
    let fixture = Fixture::new(2)?;
    std::fs::remove_file(fixture.dir.path().join("dist_abssum_model.safetensors"))?;
    let args = fixture.args(&["--dist-url", "tcp://127.0.0.1:0", "--workers-per-node", "2"]);
    let err = Coordinator::from(&args)?.run().await.unwrap_err();
    assert!(err.to_string().contains("not found"), "{}", err);
    Ok(())
}

fn two_nodes(fixture: &Fixture, url: &str, rank: &str, top_n: &str) -> RunArgs {
    fixture.args(&[
        "--dist-url",
        url,
        "--node-count",
        "2",
        "--workers-per-node",
        "1",
        "--rank",
        rank,
        "--top-n",
        top_n,
    ])
}

#[tokio::test]
async fn test_nodes_disagreeing_on_top_n_leave_a_gap() -> Result<()> {
    let fixture = Fixture::new(8)?;
    let url = format!("tcp://127.0.0.1:{}", free_port()?);
    // node 0 plans [0, 2), node 1 plans [4, 8)
    let host = Coordinator::from(&two_nodes(&fixture, &url, "0", "4"))?;
    let peer = Coordinator::from(&two_nodes(&fixture, &url, "1", "8"))?;
    let (host, _) = tokio::join!(host.run(), peer.run());
    let err = host.unwrap_err();
    assert!(format!("{:#}", err).contains("gap"), "{:#}", err);
    assert!(!fixture.dir.path().join("generated_summaries.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_nodes_disagreeing_on_top_n_fail_coverage() -> Result<()> {
    let fixture = Fixture::new(8)?;
    let url = format!("tcp://127.0.0.1:{}", free_port()?);
    // shards [0, 2) and [2, 5) are contiguous but node 0 expects [0, 4)
    let host = Coordinator::from(&two_nodes(&fixture, &url, "0", "4"))?;
    let peer = Coordinator::from(&two_nodes(&fixture, &url, "1", "5"))?;
    let (host, _) = tokio::join!(host.run(), peer.run());
    let err = host.unwrap_err();
    assert!(err.to_string().contains("ranks covered"), "{}", err);
    assert!(!fixture.dir.path().join("generated_summaries.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_missing_node_fails_the_host_at_the_deadline() -> Result<()> {
    let fixture = Fixture::new(4)?;
    let args = fixture.args_with_timeout(
        1,
        &[
            "--dist-url",
            "tcp://127.0.0.1:0",
            "--node-count",
            "2",
            "--workers-per-node",
            "1",
        ],
    );
    let start = Instant::now();
    let run = tokio::time::timeout(Duration::from_secs(20), Coordinator::from(&args)?.run()).await;
    let err = run.expect("host must not hang without its peer").unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(20));
    let msg = err.to_string();
    assert!(
        msg.contains("timed out") || msg.contains("could not join"),
        "{}",
        msg
    );
    Ok(())
}
