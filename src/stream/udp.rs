//! UDP data streams.
//!
//! Every datagram starts with a header carrying the send time and a packet
//! sequence number:
//!
//! ```text
//! [u32 seconds][u32 microseconds][u32 sequence]   32-bit counters
//! [u32 seconds][u32 microseconds][u64 sequence]   64-bit counters
//! ```
//!
//! all big-endian. The receiver uses the sequence numbers to count lost and
//! reordered packets and the timestamps to estimate jitter.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::fs::File;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::Result;
use crate::params;
use crate::stats::StreamCounters;

use super::{BlockTransport, write_sink};

/// Platform socket identifier of `socket`.
pub fn socket_id(socket: &UdpSocket) -> i32 {
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        socket.as_raw_fd()
    }
    #[cfg(not(unix))]
    {
        let _ = socket;
        0
    }
}

/// Header size for the negotiated counter width.
pub fn header_size(wide: bool) -> usize {
    if wide {
        params::UDP_HEADER_SIZE_64
    } else {
        params::UDP_HEADER_SIZE
    }
}

/// Seconds since the Unix epoch as a float.
pub fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// The header at the front of every data datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub sec: u32,
    pub usec: u32,
    pub seq: u64,
}

impl UdpHeader {
    /// Header for packet `seq` stamped with the current time.
    pub fn now(seq: u64) -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        UdpHeader {
            sec: elapsed.as_secs() as u32,
            usec: elapsed.subsec_micros(),
            seq,
        }
    }

    /// Write the header into the front of `buf`, which must hold at least
    /// [`header_size`] bytes.
    pub fn write(&self, mut buf: &mut [u8], wide: bool) {
        buf.put_u32(self.sec);
        buf.put_u32(self.usec);
        if wide {
            buf.put_u64(self.seq);
        } else {
            buf.put_u32(self.seq as u32);
        }
    }

    /// Parse the header at the front of `data`, `None` if it is too short.
    pub fn read(mut data: &[u8], wide: bool) -> Option<Self> {
        if data.len() < header_size(wide) {
            return None;
        }
        let sec = data.get_u32();
        let usec = data.get_u32();
        let seq = if wide {
            data.get_u64()
        } else {
            data.get_u32() as u64
        };
        Some(UdpHeader { sec, usec, seq })
    }

    /// Send time in seconds since the Unix epoch.
    pub fn sent_at(&self) -> f64 {
        self.sec as f64 + self.usec as f64 / 1_000_000.0
    }
}

/// Loss, reordering and jitter accounting of a receiving UDP stream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UdpReceiveStats {
    /// Highest sequence number seen so far.
    pub highest_seen: u64,
    /// Packets presumed lost.
    pub errors: u64,
    /// Packets that arrived after a later one.
    pub out_of_order: u64,
    /// Smoothed jitter in seconds.
    pub jitter: f64,
    /// Data packets received.
    pub packets: u64,
    prev_transit: f64,
}

impl UdpReceiveStats {
    /// Account a data packet that arrived at `now` (seconds since the Unix
    /// epoch).
    pub fn record(&mut self, header: &UdpHeader, now: f64) {
        self.packets += 1;

        if header.seq > self.highest_seen {
            if header.seq > self.highest_seen + 1 {
                self.errors += (header.seq - 1) - self.highest_seen;
            }
            self.highest_seen = header.seq;
        } else {
            self.out_of_order += 1;
            if self.errors > 0 {
                self.errors -= 1;
            }
            debug!(
                seq = header.seq,
                expected = self.highest_seen + 1,
                "out-of-order packet"
            );
        }

        // RFC 1889 interarrival jitter
        let transit = now - header.sent_at();
        let d = (transit - self.prev_transit).abs();
        self.prev_transit = transit;
        self.jitter += (d - self.jitter) / params::JITTER_SMOOTHING;
    }
}

/// Write side of a UDP stream's send loop.
pub(crate) struct UdpBlocks {
    socket: Arc<UdpSocket>,
    wide: bool,
    seq: u64,
}

impl UdpBlocks {
    pub(crate) fn new(socket: Arc<UdpSocket>, wide: bool) -> Self {
        UdpBlocks {
            socket,
            wide,
            seq: 0,
        }
    }

    /// Build the next datagram: `block` with its first bytes replaced by the
    /// header. Blocks shorter than the header are padded to fit it.
    fn datagram(&mut self, block: &[u8]) -> Bytes {
        self.seq += 1;
        let header_len = header_size(self.wide);
        let mut datagram = BytesMut::zeroed(block.len().max(header_len));
        datagram[..block.len()].copy_from_slice(block);
        UdpHeader::now(self.seq).write(&mut datagram[..header_len], self.wide);
        datagram.freeze()
    }
}

impl BlockTransport for UdpBlocks {
    const PACKETS_PER_BLOCK: u64 = 1;

    async fn send_block(&mut self, block: Bytes) -> io::Result<usize> {
        let datagram = self.datagram(&block);
        self.socket.send(&datagram).await
    }
}

/// Read datagrams until the stream is dropped.
pub(crate) async fn receive_loop(
    socket: Arc<UdpSocket>,
    wide: bool,
    counters: Arc<StreamCounters>,
    stats: watch::Sender<UdpReceiveStats>,
    mut sink: Option<File>,
) -> Result<()> {
    let mut buf = vec![0u8; params::READ_BUFFER_SIZE];
    loop {
        let n = socket.recv(&mut buf).await?;
        let data = &buf[..n];

        // connect probes and their replies
        if n == 4 {
            continue;
        }
        let Some(header) = UdpHeader::read(data, wide) else {
            debug!(len = n, "runt datagram ignored");
            continue;
        };

        let now = wall_clock();
        stats.send_modify(|s| s.record(&header, now));
        counters.record_received(n, 1);
        write_sink(&mut sink, data).await?;
    }
}

fn unspecified_like(addr: &SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn apply_window(socket: &UdpSocket, window: Option<u32>) -> io::Result<()> {
    if let Some(window) = window {
        let sock = SockRef::from(socket);
        sock.set_send_buffer_size(window as usize)?;
        sock.set_recv_buffer_size(window as usize)?;
        info!(
            send_buffer = sock.send_buffer_size()?,
            recv_buffer = sock.recv_buffer_size()?,
            "UDP socket configured"
        );
    }
    Ok(())
}

/// Open a UDP stream to `server` and complete the connect probe exchange.
pub async fn connect(
    server: SocketAddr,
    local: Option<IpAddr>,
    window: Option<u32>,
) -> io::Result<UdpSocket> {
    let local = SocketAddr::new(local.unwrap_or_else(|| unspecified_like(&server)), 0);
    let socket = UdpSocket::bind(local).await?;
    apply_window(&socket, window)?;
    socket.connect(server).await?;

    socket.send(&params::UDP_CONNECT_MSG.to_be_bytes()).await?;
    let mut reply = [0u8; 4];
    let n = socket.recv(&mut reply).await?;
    if n != 4 || u32::from_be_bytes(reply) != params::UDP_CONNECT_REPLY {
        debug!(len = n, "unexpected UDP connect reply");
    }
    debug!(%server, "UDP data connection established");
    Ok(socket)
}

/// Bind a server socket that waits for a UDP connect probe on `local`.
///
/// Several of these may share `local` over the life of a test, one for each
/// stream, so address reuse is enabled.
pub fn bind_listener(local: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Wait for a client's connect probe on `listener`, connect to the client
/// and answer the probe.
///
/// When `next` is set, the listener for the following stream is bound
/// before the reply goes out, so the client's next probe always finds it.
pub async fn accept(
    listener: UdpSocket,
    next: Option<SocketAddr>,
    window: Option<u32>,
) -> io::Result<(UdpSocket, Option<UdpSocket>)> {
    let mut probe = [0u8; 64];
    let (n, peer) = listener.recv_from(&mut probe).await?;
    debug!(%peer, len = n, "UDP connect probe received");

    let next = next.map(bind_listener).transpose()?;
    listener.connect(peer).await?;
    apply_window(&listener, window)?;
    listener
        .send(&params::UDP_CONNECT_REPLY.to_be_bytes())
        .await?;
    Ok((listener, next))
}
