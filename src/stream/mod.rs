//! Data-plane streams.
//!
//! A [`TestStream`] owns one data connection of a test. Depending on the
//! direction of the test it either runs a send loop, which writes blocks
//! until the stop condition is met or the stream is stopped, or a receive
//! loop, which counts incoming bytes and optionally writes them to a file.
//!
//! The transport-specific parts live in [`tcp`] and [`udp`]; everything that
//! does not depend on the transport (block gating, data source and sink,
//! counters, start/stop bookkeeping) is here.

pub mod tcp;
pub mod udp;

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, info};

use crate::error::{Iperf3Error, Result};
use crate::protocol::StreamResults;
use crate::settings::StopCondition;
use crate::stats::{StreamCounters, StreamSample};

use self::udp::UdpReceiveStats;

/// Identifier of the stream created `index`-th within a test.
///
/// The numbering skips 2, as the reference implementation does.
pub fn stream_id(index: usize) -> u32 {
    if index == 0 { 1 } else { index as u32 + 2 }
}

/// Notifications a stream sends to its test.
#[derive(Debug)]
pub enum StreamEvent {
    /// The stream has no more data to send.
    Depleted {
        /// Stream identifier.
        id: u32,
    },
    /// The stream's send or receive loop failed.
    Failed {
        /// Stream identifier.
        id: u32,
        /// What went wrong.
        error: Iperf3Error,
    },
}

/// An established data connection, not yet wrapped in a stream.
#[derive(Debug)]
pub enum DataConnection {
    /// TCP connection; the cookie has already been exchanged.
    Tcp(TcpStream),
    /// Connected UDP socket; the connect probe has already been exchanged.
    Udp(UdpSocket),
}

/// Outcome of asking a [`SendBudget`] for the next block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Send a block of this many bytes and carry on.
    Send(usize),
    /// Send a final block of this many bytes, then report depletion.
    Last(usize),
    /// Nothing left to send.
    Depleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BudgetKind {
    Unlimited,
    Blocks,
    Bytes,
}

/// Remaining blocks or bytes of a test, shared by all of its streams.
#[derive(Debug)]
pub struct SendBudget {
    kind: BudgetKind,
    remaining: AtomicU64,
    min_block: u64,
}

impl SendBudget {
    /// Budget for `stop`. Time-based tests never run out.
    pub fn new(stop: StopCondition) -> Self {
        let (kind, remaining) = match stop {
            StopCondition::Duration(_) => (BudgetKind::Unlimited, 0),
            StopCondition::Blocks(n) => (BudgetKind::Blocks, n),
            StopCondition::Bytes(n) => (BudgetKind::Bytes, n),
        };
        SendBudget {
            kind,
            remaining: AtomicU64::new(remaining),
            min_block: 0,
        }
    }

    /// Never leave a byte remainder smaller than `min_block`; the block
    /// before it is shortened instead. UDP needs room for its header in
    /// every datagram.
    pub fn with_min_block(mut self, min_block: usize) -> Self {
        self.min_block = min_block as u64;
        self
    }

    /// Claim the next block of at most `block_size` bytes.
    pub fn take(&self, block_size: usize) -> Gate {
        let block = block_size as u64;
        match self.kind {
            BudgetKind::Unlimited => Gate::Send(block_size),
            BudgetKind::Blocks => {
                match self
                    .remaining
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
                {
                    Ok(_) => Gate::Send(block_size),
                    Err(_) => Gate::Depleted,
                }
            }
            BudgetKind::Bytes => {
                let min = self.min_block;
                let left_after = |r: u64| match r {
                    0 => None,
                    r if r > block => {
                        let rest = r - block;
                        Some(if rest < min && r > min { min } else { rest })
                    }
                    _ => Some(0),
                };
                match self
                    .remaining
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, left_after)
                {
                    Ok(prev) => {
                        let left = left_after(prev).unwrap_or(0);
                        let len = (prev - left) as usize;
                        if left > 0 {
                            Gate::Send(len)
                        } else {
                            Gate::Last(len)
                        }
                    }
                    Err(_) => Gate::Depleted,
                }
            }
        }
    }

    /// Blocks or bytes left, zero for time-based tests.
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }
}

/// Where outgoing blocks come from.
#[derive(Debug)]
pub enum BlockSource {
    /// One random block generated up front and reused for every send.
    Random(Bytes),
    /// Consecutive chunks of a file.
    File(File),
}

impl BlockSource {
    /// Random block of `block_size` bytes.
    pub fn random(block_size: usize) -> Self {
        let mut rng = StdRng::from_os_rng();
        let mut buf = vec![0u8; block_size];
        rng.fill_bytes(&mut buf);
        BlockSource::Random(buf.into())
    }

    /// Read blocks from `path`, or generate a random one when unset.
    pub async fn open(path: Option<&Path>, block_size: usize) -> Result<Self> {
        match path {
            Some(path) => {
                let file = File::open(path)
                    .await
                    .map_err(Iperf3Error::file("failed opening data source"))?;
                Ok(BlockSource::File(file))
            }
            None => Ok(Self::random(block_size)),
        }
    }

    /// Next block of up to `len` bytes, `None` once a file source hits EOF.
    pub async fn next_block(&mut self, len: usize) -> Result<Option<Bytes>> {
        match self {
            BlockSource::Random(block) => Ok(Some(block.slice(..len.min(block.len())))),
            BlockSource::File(file) => {
                let mut buf = BytesMut::with_capacity(len);
                while buf.len() < len {
                    let want = (len - buf.len()) as u64;
                    let n = (&mut *file)
                        .take(want)
                        .read_buf(&mut buf)
                        .await
                        .map_err(Iperf3Error::file("failed reading data source"))?;
                    if n == 0 {
                        break;
                    }
                }
                if buf.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(buf.freeze()))
                }
            }
        }
    }
}

/// Open the receive-side file sink.
pub async fn open_sink(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(Iperf3Error::file("failed opening data sink"))
}

/// Forward received data to the sink, if there is one.
pub(crate) async fn write_sink(sink: &mut Option<File>, data: &[u8]) -> Result<()> {
    if let Some(file) = sink {
        file.write_all(data)
            .await
            .map_err(Iperf3Error::file("failed writing received data"))?;
    }
    Ok(())
}

/// Limits a stream to a target rate, one second at a time.
#[derive(Debug)]
pub struct Pacer {
    bytes_per_second: u64,
    window_start: Instant,
    sent_in_window: u64,
}

impl Pacer {
    /// Pacer for `bits_per_second`, `None` when unpaced.
    pub fn new(bits_per_second: Option<u64>) -> Option<Self> {
        let bytes_per_second = bits_per_second.filter(|b| *b > 0)? / 8;
        Some(Pacer {
            bytes_per_second: bytes_per_second.max(1),
            window_start: Instant::now(),
            sent_in_window: 0,
        })
    }

    /// Account `bytes` and wait for the next window once this one is full.
    pub async fn pace(&mut self, bytes: usize) {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.sent_in_window = 0;
        }
        self.sent_in_window += bytes as u64;
        if self.sent_in_window >= self.bytes_per_second {
            let next = self.window_start + Duration::from_secs(1);
            sleep_until(next).await;
            self.window_start = next;
            self.sent_in_window = 0;
        }
    }
}

/// The transport half of a send loop.
pub(crate) trait BlockTransport: Send + 'static {
    /// Packets each block counts as.
    const PACKETS_PER_BLOCK: u64;

    /// Write one block, returning the number of bytes put on the wire.
    fn send_block(&mut self, block: Bytes) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Everything a send loop needs besides its transport.
pub(crate) struct SendLoop {
    pub id: u32,
    pub block_size: usize,
    pub source: BlockSource,
    pub budget: Arc<SendBudget>,
    pub counters: Arc<StreamCounters>,
    pub pacer: Option<Pacer>,
    pub events: mpsc::UnboundedSender<StreamEvent>,
}

impl SendLoop {
    /// Send blocks until the budget or the source runs out.
    ///
    /// Only returns on depletion or error; a time-based test ends by
    /// aborting the task.
    pub(crate) async fn run<T: BlockTransport>(mut self, mut transport: T) -> Result<()> {
        loop {
            let (len, last) = match self.budget.take(self.block_size) {
                Gate::Send(len) => (len, false),
                Gate::Last(len) => (len, true),
                Gate::Depleted => break,
            };

            let Some(block) = self.source.next_block(len).await? else {
                debug!(id = self.id, "data source exhausted");
                break;
            };

            let sent = transport.send_block(block).await?;
            self.counters.record_sent(sent, T::PACKETS_PER_BLOCK);

            if last {
                break;
            }
            if let Some(pacer) = &mut self.pacer {
                pacer.pace(sent).await;
            }
            tokio::task::yield_now().await;
        }

        let _ = self.events.send(StreamEvent::Depleted { id: self.id });
        Ok(())
    }
}

/// Settings every stream of a test shares.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Block size in bytes.
    pub block_size: usize,
    /// Whether this endpoint sends.
    pub sender: bool,
    /// File data source (sender) or sink (receiver).
    pub file: Option<PathBuf>,
    /// Use 64-bit UDP packet counters.
    pub udp64: bool,
    /// Per-stream pacing target in bits per second.
    pub bandwidth: Option<u64>,
    /// Shared send budget.
    pub budget: Arc<SendBudget>,
    /// Channel back to the owning test.
    pub events: mpsc::UnboundedSender<StreamEvent>,
}

enum Link {
    /// TCP connection, held until the send or receive loop takes it.
    Tcp(Option<TcpStream>),
    /// UDP socket and the receive side's sequence and jitter state.
    Udp {
        socket: Arc<UdpSocket>,
        stats: watch::Receiver<UdpReceiveStats>,
    },
}

/// One data stream of a test.
pub struct TestStream {
    id: u32,
    socket: i32,
    config: StreamConfig,
    link: Link,
    counters: Arc<StreamCounters>,
    sending: Option<JoinHandle<()>>,
    receiving: Option<JoinHandle<()>>,
    done: bool,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl TestStream {
    /// Wrap an established connection. A receiving stream starts reading
    /// right away.
    pub async fn established(id: u32, conn: DataConnection, config: StreamConfig) -> Result<Self> {
        let counters = Arc::new(StreamCounters::new());
        let (socket, link) = match conn {
            DataConnection::Tcp(stream) => (tcp::socket_id(&stream), Link::Tcp(Some(stream))),
            DataConnection::Udp(socket) => {
                let id = udp::socket_id(&socket);
                let (_, stats) = watch::channel(UdpReceiveStats::default());
                (
                    id,
                    Link::Udp {
                        socket: Arc::new(socket),
                        stats,
                    },
                )
            }
        };
        info!(id, socket, "stream connected");

        let mut stream = TestStream {
            id,
            socket,
            config,
            link,
            counters,
            sending: None,
            receiving: None,
            done: false,
            started_at: None,
            stopped_at: None,
        };
        if !stream.config.sender {
            stream.start_receiving().await?;
        }
        Ok(stream)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Platform socket identifier, used to tag stats.
    pub fn socket(&self) -> i32 {
        self.socket
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Whether the send loop is scheduled.
    pub fn is_sending(&self) -> bool {
        self.sending.is_some()
    }

    pub fn counters(&self) -> &StreamCounters {
        &self.counters
    }

    async fn start_receiving(&mut self) -> Result<()> {
        let sink = match &self.config.file {
            Some(path) => Some(open_sink(path).await?),
            None => None,
        };
        let id = self.id;
        let counters = self.counters.clone();
        let events = self.config.events.clone();

        let task = match &mut self.link {
            Link::Tcp(conn) => {
                let Some(conn) = conn.take() else {
                    return Ok(());
                };
                let fut = tcp::receive_loop(conn, counters, sink);
                spawn_reporting(id, events, fut)
            }
            Link::Udp { socket, stats } => {
                let (tx, rx) = watch::channel(UdpReceiveStats::default());
                *stats = rx;
                let fut = udp::receive_loop(socket.clone(), self.config.udp64, counters, tx, sink);
                spawn_reporting(id, events, fut)
            }
        };
        self.receiving = Some(task);
        Ok(())
    }

    /// Begin the send loop. A no-op for receivers, streams already sending
    /// and stopped streams.
    pub async fn start_stream(&mut self) -> Result<()> {
        if !self.config.sender || self.sending.is_some() || self.done {
            return Ok(());
        }
        debug!(id = self.id, "start stream");
        self.started_at = Some(Instant::now());

        let send_loop = SendLoop {
            id: self.id,
            block_size: self.config.block_size,
            source: BlockSource::open(self.config.file.as_deref(), self.config.block_size).await?,
            budget: self.config.budget.clone(),
            counters: self.counters.clone(),
            pacer: Pacer::new(self.config.bandwidth),
            events: self.config.events.clone(),
        };
        let events = self.config.events.clone();

        let task = match &mut self.link {
            Link::Tcp(conn) => {
                let Some(conn) = conn.take() else {
                    return Ok(());
                };
                spawn_reporting(self.id, events, send_loop.run(tcp::TcpBlocks::new(conn)))
            }
            Link::Udp { socket, .. } => {
                let blocks = udp::UdpBlocks::new(socket.clone(), self.config.udp64);
                spawn_reporting(self.id, events, send_loop.run(blocks))
            }
        };
        self.sending = Some(task);
        Ok(())
    }

    /// Cancel the pending send and mark the stream done.
    ///
    /// The receive loop keeps draining the connection until the peer closes
    /// it or the stream is dropped. A receive-side file sink belongs to that
    /// loop and is closed when it ends, not here.
    pub fn stop_stream(&mut self) {
        if self.done {
            return;
        }
        debug!(id = self.id, "stop stream");
        if let Some(task) = self.sending.take() {
            task.abort();
        }
        self.stopped_at = Some(Instant::now());
        self.done = true;
    }

    /// Read and reset this interval's counters for the stats harvest.
    pub fn interval_sample(&self) -> StreamSample {
        let counts = self.counters.take_interval();
        StreamSample {
            id: self.id,
            socket: self.socket,
            bytes: if self.config.sender {
                counts.bytes_sent
            } else {
                counts.bytes_received
            },
            retransmits: 0,
        }
    }

    /// UDP receive state, `None` for TCP.
    pub fn udp_stats(&self) -> Option<UdpReceiveStats> {
        match &self.link {
            Link::Udp { stats, .. } => Some(*stats.borrow()),
            Link::Tcp(_) => None,
        }
    }

    /// Totals exchanged with the peer at the end of the test. Times are
    /// relative to `test_start`.
    pub fn results(&self, test_start: Instant) -> StreamResults {
        let totals = self.counters.totals();
        let offset = |t: Instant| t.saturating_duration_since(test_start).as_secs_f64();
        let start_time = self.started_at.map(offset).unwrap_or(0.0);
        let end_time = offset(self.stopped_at.unwrap_or_else(Instant::now));

        let mut results = StreamResults {
            id: self.id,
            bytes: totals.bytes_sent,
            retransmits: -1,
            jitter: 0.0,
            errors: 0,
            packets: totals.packets_sent,
            start_time,
            end_time,
        };
        if !self.config.sender {
            results.bytes = totals.bytes_received;
            results.packets = totals.packets_received;
            if let Some(udp) = self.udp_stats() {
                results.jitter = udp.jitter;
                results.errors = udp.errors as i64;
            }
        }
        results
    }
}

impl Drop for TestStream {
    fn drop(&mut self) {
        if let Some(task) = self.sending.take() {
            task.abort();
        }
        if let Some(task) = self.receiving.take() {
            task.abort();
        }
    }
}

fn spawn_reporting<F>(id: u32, events: mpsc::UnboundedSender<StreamEvent>, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(
        async move {
            if let Err(error) = fut.await {
                let _ = events.send(StreamEvent::Failed { id, error });
            }
        }
        .in_current_span(),
    )
}
