//! TCP data streams.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, info};

use crate::error::Result;
use crate::params;
use crate::stats::StreamCounters;

use super::{BlockTransport, write_sink};

/// Platform socket identifier of `stream`.
pub fn socket_id(stream: &TcpStream) -> i32 {
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        stream.as_raw_fd()
    }
    #[cfg(not(unix))]
    {
        let _ = stream;
        0
    }
}

/// Apply Nagle and buffer settings to a data connection.
pub fn configure(stream: &TcpStream, no_delay: bool, window: Option<u32>) -> io::Result<()> {
    stream.set_nodelay(no_delay)?;

    let sock = SockRef::from(stream);
    if let Some(window) = window {
        sock.set_send_buffer_size(window as usize)?;
        sock.set_recv_buffer_size(window as usize)?;
    }
    info!(
        no_delay,
        send_buffer = sock.send_buffer_size()?,
        recv_buffer = sock.recv_buffer_size()?,
        "TCP socket configured"
    );
    Ok(())
}

/// Open a data connection to `server` and send the test cookie on it.
pub async fn connect(
    server: SocketAddr,
    local: Option<IpAddr>,
    cookie: &str,
    no_delay: bool,
    window: Option<u32>,
) -> io::Result<TcpStream> {
    let socket = match server {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(ip) = local {
        socket.bind(SocketAddr::new(ip, 0))?;
    }

    let mut stream = socket.connect(server).await?;
    configure(&stream, no_delay, window)?;
    stream.write_all(cookie.as_bytes()).await?;
    debug!(%server, "TCP data connection established");
    Ok(stream)
}

/// Write side of a TCP stream's send loop.
pub(crate) struct TcpBlocks {
    stream: TcpStream,
}

impl TcpBlocks {
    pub(crate) fn new(stream: TcpStream) -> Self {
        TcpBlocks { stream }
    }
}

impl BlockTransport for TcpBlocks {
    const PACKETS_PER_BLOCK: u64 = 0;

    // A full socket buffer keeps this write pending, which pauses the send
    // loop until the peer catches up.
    async fn send_block(&mut self, block: Bytes) -> io::Result<usize> {
        self.stream.write_all(&block).await?;
        Ok(block.len())
    }
}

/// Count everything the peer sends until it closes the connection.
pub(crate) async fn receive_loop(
    mut stream: TcpStream,
    counters: Arc<StreamCounters>,
    mut sink: Option<File>,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(params::READ_BUFFER_SIZE);
    loop {
        buf.clear();
        buf.reserve(params::READ_BUFFER_SIZE);
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            debug!("TCP data connection closed by peer");
            return Ok(());
        }
        counters.record_received(n, 0);
        write_sink(&mut sink, &buf).await?;
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::cookie;

    #[tokio::test]
    async fn connect_sends_cookie_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cookie = cookie::make_cookie();

        let client = connect(addr, None, &cookie, true, Some(64 * 1024));
        let (client, accepted) = tokio::join!(client, listener.accept());
        let client = client.unwrap();
        let (mut server, _) = accepted.unwrap();

        let mut wire = [0u8; params::COOKIE_WIRE_SIZE];
        server.read_exact(&mut wire).await.unwrap();
        assert_eq!(cookie::parse_cookie(&wire).unwrap().len(), params::COOKIE_SIZE);
        assert_eq!(format!("{}\0", cookie::parse_cookie(&wire).unwrap()), cookie);
        assert!(client.nodelay().unwrap());
    }

    #[tokio::test]
    async fn receive_loop_counts_until_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (server, _) = accepted.unwrap();

        let counters = Arc::new(StreamCounters::new());
        let receiver = tokio::spawn(receive_loop(server, counters.clone(), None));

        let mut blocks = TcpBlocks::new(client);
        for _ in 0..4 {
            let n = blocks.send_block(Bytes::from(vec![1u8; 1000])).await.unwrap();
            assert_eq!(n, 1000);
        }
        drop(blocks);

        receiver.await.unwrap().unwrap();
        assert_eq!(counters.totals().bytes_received, 4000);
        assert_eq!(counters.totals().packets_received, 0);
    }
}
