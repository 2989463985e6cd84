//! Process-group formation and result handoff over TCP.
//!
//! The coordinator of node 0 binds the `tcp://host:port` endpoint shared by
//! every worker of the run. Each worker connects, announces its rank and
//! blocks until all `world_size` ranks have joined (the formation barrier).
//! After inference every worker submits exactly one [`ResultEntry`] on the
//! same connection; the server forwards it to the [`ResultSender`] and drops
//! its senders once all connections are done, which opens the collection
//! barrier.
//!
//! Messages are newline-delimited JSON.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use super::collector::{CollectError, ResultEntry, ResultSender};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(200);
/// How long an accepted connection may stay silent before it is dropped.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("invalid rendezvous url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("group formation timed out after {timeout_ms}ms: {joined}/{expected} ranks joined")]
    FormationTimeout {
        joined: usize,
        expected: usize,
        timeout_ms: u64,
    },
    #[error("rank {rank} could not join within {timeout_ms}ms")]
    JoinTimeout { rank: usize, timeout_ms: u64 },
    #[error("rank {rank} rejected: {reason}")]
    Rejected { rank: usize, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("peer closed the connection")]
    Disconnected,
    #[error("message codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Collect(#[from] CollectError),
}

pub type Result<T> = std::result::Result<T, RendezvousError>;

/// Settings shared by the endpoint and every joining worker.
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub addr: SocketAddr,
    pub world_size: usize,
    /// Bound on group formation. Inference itself is not bounded.
    pub timeout: Duration,
    pub nodelay: bool,
}

impl RendezvousConfig {
    pub fn new(addr: SocketAddr, world_size: usize) -> Self {
        Self {
            addr,
            world_size,
            timeout: Duration::from_secs(1800),
            nodelay: true,
        }
    }
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }
}

/// Resolves a `tcp://host:port` endpoint.
pub fn parse_dist_url(url: &str) -> Result<SocketAddr> {
    let invalid = |reason: String| RendezvousError::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let host_port = url
        .strip_prefix("tcp://")
        .ok_or_else(|| invalid("only tcp:// endpoints are supported".to_string()))?
        .trim_end_matches('/');
    let mut addrs = host_port
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?;
    addrs
        .next()
        .ok_or_else(|| invalid("host did not resolve".to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RendezvousMessage {
    Join { rank: usize, world_size: usize },
    Ready { run_id: Uuid, world_size: usize },
    Submit { entry: ResultEntry },
    Ack { rank: usize },
    Reject { reason: String },
}

struct MessageStream {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl MessageStream {
    fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, msg: &RendezvousMessage) -> Result<()> {
        let mut buf = serde_json::to_vec(msg)?;
        buf.push(b'\n');
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<RendezvousMessage>> {
        match self.lines.next_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }

    async fn reject(&mut self, reason: &str) {
        let msg = RendezvousMessage::Reject {
            reason: reason.to_string(),
        };
        if let Err(e) = self.send(&msg).await {
            tracing::warn!("failed to deliver reject '{}': {}", reason, e);
        }
    }
}

pub struct RendezvousServer {
    listener: TcpListener,
    config: RendezvousConfig,
    run_id: Uuid,
}

impl RendezvousServer {
    pub async fn bind(config: RendezvousConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.addr).await?;
        let run_id = Uuid::new_v4();
        tracing::info!(
            "rendezvous for run {} listening on {}, expecting {} ranks",
            run_id,
            listener.local_addr()?,
            config.world_size
        );
        Ok(Self {
            listener,
            config,
            run_id,
        })
    }

    /// Address workers should connect to; differs from the configured one
    /// when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Forms the group, releases it, then relays one submission per rank into
    /// `results`. Returns once every member connection is finished; a member
    /// that fails to submit is logged here and shows up as a missing rank in
    /// the collector.
    pub async fn serve(self, results: ResultSender) -> Result<()> {
        let mut members = self.form_group().await?;
        for (rank, stream) in members.iter_mut() {
            stream
                .send(&RendezvousMessage::Ready {
                    run_id: self.run_id,
                    world_size: self.config.world_size,
                })
                .await
                .map_err(|e| {
                    tracing::error!("failed to release rank {}: {}", rank, e);
                    e
                })?;
        }
        tracing::info!("run {} formed with {} ranks", self.run_id, members.len());

        let mut tasks = JoinSet::new();
        for (rank, stream) in members {
            tasks.spawn(relay_submission(rank, stream, results.clone()));
        }
        drop(results);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(rank)) => tracing::debug!("rank {} submitted", rank),
                Ok(Err(e)) => tracing::warn!("submission failed: {}", e),
                Err(e) => tracing::error!("submission task aborted: {}", e),
            }
        }
        Ok(())
    }

    /// Accepts connections until every rank has joined. Each hello is read in
    /// its own task, so a silent or misbehaving peer is dropped without
    /// holding up the others; only the overall deadline fails the group.
    async fn form_group(&self) -> Result<Vec<(usize, MessageStream)>> {
        let world_size = self.config.world_size;
        let expire = tokio::time::sleep_until(Instant::now() + self.config.timeout);
        tokio::pin!(expire);
        let mut members: Vec<Option<MessageStream>> = (0..world_size).map(|_| None).collect();
        let mut joined = 0;
        let mut hellos = JoinSet::new();
        while joined < world_size {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(self.config.nodelay) {
                            tracing::warn!("set_nodelay for {}: {}", peer, e);
                        }
                        hellos.spawn(read_hello(peer, MessageStream::new(stream)));
                    }
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                        tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                    }
                },
                Some(done) = hellos.join_next() => match done {
                    Ok((peer, mut stream, hello)) => {
                        let rank = match hello {
                            Ok(Some(RendezvousMessage::Join {
                                rank,
                                world_size: peer_world_size,
                            })) => {
                                if peer_world_size != world_size {
                                    Err(format!(
                                        "world size {} does not match {}",
                                        peer_world_size, world_size
                                    ))
                                } else if rank >= world_size {
                                    Err(format!("rank {} out of range", rank))
                                } else if members[rank].is_some() {
                                    Err(format!("rank {} already joined", rank))
                                } else {
                                    Ok(rank)
                                }
                            }
                            Ok(Some(other)) => Err(format!("expected join, got {:?}", other)),
                            Ok(None) => Err("closed before joining".to_string()),
                            Err(e) => Err(e.to_string()),
                        };
                        match rank {
                            Ok(rank) => {
                                members[rank] = Some(stream);
                                joined += 1;
                                tracing::info!(
                                    "rank {} joined from {}: {}/{}",
                                    rank,
                                    peer,
                                    joined,
                                    world_size
                                );
                            }
                            Err(reason) => {
                                tracing::warn!("dropping connection from {}: {}", peer, reason);
                                stream.reject(&reason).await;
                            }
                        }
                    }
                    Err(e) => tracing::error!("hello task aborted: {}", e),
                },
                _ = &mut expire => {
                    return Err(RendezvousError::FormationTimeout {
                        joined,
                        expected: world_size,
                        timeout_ms: self.config.timeout.as_millis() as u64,
                    });
                }
            }
        }
        Ok(members
            .into_iter()
            .enumerate()
            .filter_map(|(rank, stream)| stream.map(|s| (rank, s)))
            .collect())
    }
}

async fn read_hello(
    peer: SocketAddr,
    mut stream: MessageStream,
) -> (SocketAddr, MessageStream, Result<Option<RendezvousMessage>>) {
    let hello = match tokio::time::timeout(HELLO_TIMEOUT, stream.recv()).await {
        Ok(hello) => hello,
        Err(_) => Err(RendezvousError::Protocol(format!(
            "no join within {:?}",
            HELLO_TIMEOUT
        ))),
    };
    (peer, stream, hello)
}

async fn relay_submission(
    rank: usize,
    mut stream: MessageStream,
    results: ResultSender,
) -> Result<usize> {
    match stream.recv().await? {
        Some(RendezvousMessage::Submit { entry }) if entry.rank == rank => {
            results.submit(entry)?;
            stream.send(&RendezvousMessage::Ack { rank }).await?;
            Ok(rank)
        }
        Some(RendezvousMessage::Submit { entry }) => {
            stream.reject("submission rank mismatch").await;
            Err(RendezvousError::Protocol(format!(
                "rank {} submitted results tagged rank {}",
                rank, entry.rank
            )))
        }
        Some(other) => {
            stream.reject("expected submit").await;
            Err(RendezvousError::Protocol(format!(
                "rank {} sent {:?} instead of results",
                rank, other
            )))
        }
        None => Err(RendezvousError::Protocol(format!(
            "rank {} disconnected without results",
            rank
        ))),
    }
}

/// One worker's membership in a formed group.
pub struct RendezvousClient {
    rank: usize,
    run_id: Uuid,
    stream: MessageStream,
}

impl RendezvousClient {
    /// Connects (retrying until the endpoint is up) and blocks until the whole
    /// group has joined.
    pub async fn join(config: &RendezvousConfig, rank: usize) -> Result<Self> {
        let deadline = Instant::now() + config.timeout;
        let timeout = || RendezvousError::JoinTimeout {
            rank,
            timeout_ms: config.timeout.as_millis() as u64,
        };
        let stream = loop {
            match TcpStream::connect(config.addr).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if Instant::now() + CONNECT_RETRY_INTERVAL >= deadline {
                        tracing::error!("rank {} cannot reach {}: {}", rank, config.addr, e);
                        return Err(timeout());
                    }
                    tracing::debug!("rank {} waiting for {}: {}", rank, config.addr, e);
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        };
        stream.set_nodelay(config.nodelay)?;
        let mut stream = MessageStream::new(stream);
        stream
            .send(&RendezvousMessage::Join {
                rank,
                world_size: config.world_size,
            })
            .await?;
        let reply = tokio::time::timeout_at(deadline, stream.recv())
            .await
            .map_err(|_| timeout())??;
        match reply {
            Some(RendezvousMessage::Ready { run_id, world_size }) => {
                if world_size != config.world_size {
                    return Err(RendezvousError::Protocol(format!(
                        "group formed with world size {}, expected {}",
                        world_size, config.world_size
                    )));
                }
                Ok(Self {
                    rank,
                    run_id,
                    stream,
                })
            }
            Some(RendezvousMessage::Reject { reason }) => {
                Err(RendezvousError::Rejected { rank, reason })
            }
            Some(other) => Err(RendezvousError::Protocol(format!(
                "expected ready, got {:?}",
                other
            ))),
            None => Err(RendezvousError::Disconnected),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Hands this rank's results to the endpoint and leaves the group.
    pub async fn submit(mut self, entry: ResultEntry) -> Result<()> {
        self.stream
            .send(&RendezvousMessage::Submit { entry })
            .await?;
        match self.stream.recv().await? {
            Some(RendezvousMessage::Ack { rank }) if rank == self.rank => Ok(()),
            Some(RendezvousMessage::Reject { reason }) => Err(RendezvousError::Rejected {
                rank: self.rank,
                reason,
            }),
            Some(other) => Err(RendezvousError::Protocol(format!(
                "expected ack, got {:?}",
                other
            ))),
            None => Err(RendezvousError::Disconnected),
        }
    }
}

#[cfg(test)]
async fn local_server(world_size: usize, timeout: Duration) -> (RendezvousServer, RendezvousConfig) {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let config = RendezvousConfig::new(addr, world_size).with_timeout(timeout);
    let server = RendezvousServer::bind(config.clone()).await.unwrap();
    let config = config.with_addr(server.local_addr().unwrap());
    (server, config)
}

#[test]
fn test_parse_dist_url() {
    let addr = parse_dist_url("tcp://127.0.0.1:29500").unwrap();
    assert_eq!(addr, "127.0.0.1:29500".parse::<SocketAddr>().unwrap());
    assert!(parse_dist_url("tcp://127.0.0.1:29500/").is_ok());
    assert!(matches!(
        parse_dist_url("env://"),
        Err(RendezvousError::InvalidUrl { .. })
    ));
    assert!(matches!(
        parse_dist_url("tcp://127.0.0.1"),
        Err(RendezvousError::InvalidUrl { .. })
    ));
}

#[test]
fn test_message_wire_format() {
    let msg = RendezvousMessage::Join {
        rank: 2,
        world_size: 4,
    };
    let text = serde_json::to_string(&msg).unwrap();
    assert_eq!(text, r#"{"type":"join","rank":2,"world_size":4}"#);
}

#[tokio::test]
async fn test_group_forms_and_relays_results() {
    use super::collector::ResultCollector;
    use super::shard::Shard;

    let (server, config) = local_server(3, Duration::from_secs(10)).await;
    let run_id = server.run_id();
    let collector = ResultCollector::new(3);
    let serving = tokio::spawn(server.serve(collector.sender()));

    let mut workers = Vec::new();
    for rank in [2usize, 0, 1] {
        let config = config.clone();
        workers.push(tokio::spawn(async move {
            let client = RendezvousClient::join(&config, rank).await?;
            assert_eq!(client.run_id(), run_id);
            let entry = ResultEntry::new(rank, Shard::new(rank, rank + 1), vec![rank.to_string()]);
            client.submit(entry).await
        }));
    }
    for w in workers {
        w.await.unwrap().unwrap();
    }
    serving.await.unwrap().unwrap();
    let collected = collector.collect().await.unwrap();
    assert_eq!(collected.outputs(), &["0", "1", "2"]);
}

#[tokio::test]
async fn test_formation_times_out() {
    let (server, config) = local_server(2, Duration::from_millis(300)).await;
    let collector = super::collector::ResultCollector::new(2);
    let serving = tokio::spawn(server.serve(collector.sender()));

    let lonely = tokio::spawn(async move { RendezvousClient::join(&config, 0).await });
    let served = serving.await.unwrap();
    assert!(matches!(
        served,
        Err(RendezvousError::FormationTimeout {
            joined: 1,
            expected: 2,
            ..
        })
    ));
    assert!(lonely.await.unwrap().is_err());
}

#[cfg(test)]
async fn join_and_submit(config: RendezvousConfig, rank: usize) -> Result<()> {
    let client = RendezvousClient::join(&config, rank).await?;
    let shard = super::shard::Shard::new(rank, rank + 1);
    client
        .submit(ResultEntry::new(rank, shard, vec![rank.to_string()]))
        .await
}

#[tokio::test]
async fn test_mismatched_world_size_is_rejected() {
    let (server, config) = local_server(2, Duration::from_secs(10)).await;
    let collector = super::collector::ResultCollector::new(2);
    let serving = tokio::spawn(server.serve(collector.sender()));

    let wrong = RendezvousConfig {
        world_size: 3,
        ..config.clone()
    };
    let joined = RendezvousClient::join(&wrong, 0).await;
    assert!(matches!(joined, Err(RendezvousError::Rejected { rank: 0, .. })));

    // the bad peer is dropped, the group still forms from the right ones
    let (a, b) = tokio::join!(
        join_and_submit(config.clone(), 0),
        join_and_submit(config, 1)
    );
    a.unwrap();
    b.unwrap();
    serving.await.unwrap().unwrap();
    let collected = collector.collect().await.unwrap();
    assert_eq!(collected.outputs(), &["0", "1"]);
}

#[tokio::test]
async fn test_silent_connection_does_not_stall_formation() {
    let (server, config) = local_server(2, Duration::from_secs(30)).await;
    let collector = super::collector::ResultCollector::new(2);
    let serving = tokio::spawn(server.serve(collector.sender()));

    let _silent = TcpStream::connect(config.addr).await.unwrap();
    let formed = tokio::time::timeout(HELLO_TIMEOUT / 2, async {
        let (a, b) = tokio::join!(
            join_and_submit(config.clone(), 1),
            join_and_submit(config.clone(), 0)
        );
        a.unwrap();
        b.unwrap();
        serving.await.unwrap().unwrap();
    })
    .await;
    assert!(formed.is_ok(), "a silent peer held up the group");
    let collected = collector.collect().await.unwrap();
    assert_eq!(collected.outputs(), &["0", "1"]);
}

#[tokio::test]
async fn test_malformed_hello_is_dropped() {
    let (server, config) = local_server(1, Duration::from_secs(10)).await;
    let collector = super::collector::ResultCollector::new(1);
    let serving = tokio::spawn(server.serve(collector.sender()));

    let mut garbage = MessageStream::new(TcpStream::connect(config.addr).await.unwrap());
    garbage.writer.write_all(b"not json\n").await.unwrap();
    assert!(matches!(
        garbage.recv().await.unwrap(),
        Some(RendezvousMessage::Reject { .. })
    ));

    join_and_submit(config, 0).await.unwrap();
    serving.await.unwrap().unwrap();
    assert_eq!(collector.collect().await.unwrap().outputs(), &["0"]);
}
