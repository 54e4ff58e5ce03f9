//! Server shell and connection router.
//!
//! Every connection a client opens, control and data alike, starts with the
//! test cookie. The router keeps newly accepted connections as orphans until
//! their cookie is complete, then either starts a new test with the
//! connection as its control channel or hands it to the test that already
//! owns the cookie as a data stream.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, warn};

use crate::client::resolve;
use crate::control;
use crate::cookie;
use crate::error::Result;
use crate::params;
use crate::session::{Report, TestHandle, TestSession};
use crate::settings::{Role, TestSettings};

type ConnId = u64;

type PendingRead = Pin<Box<dyn Future<Output = (ConnId, TcpStream, io::Result<Bytes>)> + Send>>;

// Read whatever arrives next, but never past the end of the cookie: the
// bytes after it belong to the test.
fn read_chunk(id: ConnId, mut stream: TcpStream, want: usize) -> PendingRead {
    Box::pin(async move {
        let mut buf = BytesMut::with_capacity(want);
        let result = (&mut stream)
            .take(want as u64)
            .read_buf(&mut buf)
            .await
            .map(|_| buf.freeze());
        (id, stream, result)
    })
}

/// A connection whose cookie is still incomplete.
#[derive(Debug)]
struct Orphan {
    peer: SocketAddr,
    received: BytesMut,
}

/// Routes accepted connections to tests by cookie.
struct Router {
    settings: TestSettings,
    next_id: ConnId,
    orphans: HashMap<ConnId, Orphan>,
    tests: HashMap<String, TestHandle>,
    reads: FuturesUnordered<PendingRead>,
    done_tx: mpsc::UnboundedSender<String>,
    reports: Option<mpsc::Sender<Report>>,
}

impl Router {
    fn new(
        settings: TestSettings,
        done_tx: mpsc::UnboundedSender<String>,
        reports: Option<mpsc::Sender<Report>>,
    ) -> Self {
        Router {
            settings,
            next_id: 0,
            orphans: HashMap::new(),
            tests: HashMap::new(),
            reads: FuturesUnordered::new(),
            done_tx,
            reports,
        }
    }

    fn accepted(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;
        debug!(id, %peer, "connection accepted");

        self.orphans.insert(
            id,
            Orphan {
                peer,
                received: BytesMut::with_capacity(params::COOKIE_WIRE_SIZE),
            },
        );
        self.reads
            .push(read_chunk(id, stream, params::COOKIE_WIRE_SIZE));
    }

    fn chunk_received(&mut self, id: ConnId, stream: TcpStream, chunk: io::Result<Bytes>) {
        let chunk = match chunk {
            Ok(chunk) if !chunk.is_empty() => chunk,
            Ok(_) => {
                debug!(id, "connection closed before sending a cookie");
                self.orphans.remove(&id);
                return;
            }
            Err(e) => {
                warn!(id, error = %e, "error reading cookie");
                self.orphans.remove(&id);
                return;
            }
        };

        let Some(orphan) = self.orphans.get_mut(&id) else {
            return;
        };
        orphan.received.extend_from_slice(&chunk);
        let have = orphan.received.len();
        if have < params::COOKIE_WIRE_SIZE {
            self.reads
                .push(read_chunk(id, stream, params::COOKIE_WIRE_SIZE - have));
            return;
        }

        let Some(orphan) = self.orphans.remove(&id) else {
            return;
        };
        match cookie::parse_cookie(&orphan.received) {
            Some(token) => self.resolve(token, stream, orphan.peer),
            None => warn!(id, peer = %orphan.peer, "malformed cookie, connection dropped"),
        }
    }

    fn resolve(&mut self, token: String, stream: TcpStream, peer: SocketAddr) {
        if let Some(test) = self.tests.get(&token) {
            debug!(cookie = %token, %peer, "data connection routed");
            if !test.add_connection(stream) {
                self.tests.remove(&token);
            }
            return;
        }
        if let Err(e) = self.start_test(token, stream, peer) {
            error!(error = %e, %peer, "failed to start test");
        }
    }

    fn start_test(&mut self, token: String, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let local = stream.local_addr()?;
        let (reader, writer) = control::split(stream);
        let mut session = TestSession::new(
            Role::Server,
            format!("{token}\0"),
            self.settings.clone(),
            writer,
            local,
            peer,
        );
        if let Some(reports) = &self.reports {
            session = session.with_reports(reports.clone());
        }
        info!(cookie = %token, %peer, "new test");

        let span = session.span();
        self.tests.insert(token.clone(), session.handle());

        let done_tx = self.done_tx.clone();
        let reports = self.reports.clone();
        tokio::spawn(
            async move {
                let report = match session.run(reader).await {
                    Ok(outcome) => {
                        info!("test finished");
                        Report::Finished(Box::new(outcome))
                    }
                    Err(error) => {
                        error!(%error, "test failed");
                        Report::Failed {
                            cookie: token.clone(),
                            error,
                        }
                    }
                };
                if let Some(reports) = reports {
                    let _ = reports.send(report).await;
                }
                let _ = done_tx.send(token);
            }
            .instrument(span),
        );
        Ok(())
    }

    fn test_done(&mut self, token: &str) {
        debug!(cookie = %token, "test removed");
        self.tests.remove(token);
    }

    fn terminate_all(&mut self) {
        for test in self.tests.values() {
            test.terminate();
        }
    }
}

/// The unspecified address of the requested IP version.
fn unspecified(ip_version: Option<u8>) -> IpAddr {
    match ip_version {
        Some(6) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }
}

/// Listens for clients and runs their tests.
pub struct Server {
    settings: TestSettings,
    listener: TcpListener,
    reports: Option<mpsc::Sender<Report>>,
}

impl Server {
    /// Bind the listening socket on `server_address`, or on every address of
    /// the chosen IP version when it is empty.
    pub async fn bind(settings: TestSettings) -> Result<Self> {
        settings.validate()?;
        let addr = if settings.server_address.is_empty() {
            SocketAddr::new(unspecified(settings.ip_version), settings.server_port)
        } else {
            resolve(
                &settings.server_address,
                settings.server_port,
                settings.ip_version,
            )
            .await?
        };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;
        info!(addr = %listener.local_addr()?, "server listening");

        Ok(Server {
            settings,
            listener,
            reports: None,
        })
    }

    /// Send progress of every test to `reports`.
    pub fn with_reports(mut self, reports: mpsc::Sender<Report>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Address the server accepts control connections on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and route connections until `shutdown` completes, then ask
    /// every running test to terminate.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut router = Router::new(self.settings, done_tx, self.reports);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => router.accepted(stream, peer),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some((id, stream, chunk)) = router.reads.next(), if !router.reads.is_empty() => {
                    router.chunk_received(id, stream, chunk);
                }
                Some(token) = done_rx.recv() => router.test_done(&token),
                _ = &mut shutdown => {
                    info!(tests = router.tests.len(), "server shutting down");
                    router.terminate_all();
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use super::*;
    use crate::protocol::State;

    async fn start_server() -> (SocketAddr, oneshot::Sender<()>) {
        let settings = TestSettings {
            server_address: "127.0.0.1".into(),
            server_port: 0,
            ..Default::default()
        };
        let server = Server::bind(settings).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx)
    }

    #[tokio::test]
    async fn same_cookie_never_creates_two_tests() {
        let (addr, _stop) = start_server().await;
        let cookie = cookie::make_cookie();

        let mut control = TcpStream::connect(addr).await.unwrap();
        // cookie in two pieces
        control.write_all(&cookie.as_bytes()[..10]).await.unwrap();
        control.write_all(&cookie.as_bytes()[10..]).await.unwrap();
        let mut op = [0u8; 1];
        control.read_exact(&mut op).await.unwrap();
        assert_eq!(op[0], State::ParamExchange.to_byte());

        // the second connection joins the existing test instead of starting
        // one; arriving before CREATE_STREAMS it is dropped
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(cookie.as_bytes()).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // a different cookie is a different test
        let mut other = TcpStream::connect(addr).await.unwrap();
        other
            .write_all(cookie::make_cookie().as_bytes())
            .await
            .unwrap();
        other.read_exact(&mut op).await.unwrap();
        assert_eq!(op[0], State::ParamExchange.to_byte());
    }

    #[tokio::test]
    async fn bind_rejects_out_of_range_interval() {
        let settings = TestSettings {
            server_address: "127.0.0.1".into(),
            server_port: 0,
            report_interval: 1e30,
            ..Default::default()
        };
        let err = Server::bind(settings).await.err().unwrap();
        assert!(matches!(err, crate::error::Iperf3Error::InvalidSettings(_)));
    }

    #[tokio::test]
    async fn malformed_cookie_is_dropped() {
        let (addr, _stop) = start_server().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(&[b'x'; params::COOKIE_WIRE_SIZE])
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn shutdown_terminates_running_tests() {
        let (addr, stop) = start_server().await;

        let mut control = TcpStream::connect(addr).await.unwrap();
        control
            .write_all(cookie::make_cookie().as_bytes())
            .await
            .unwrap();
        let mut op = [0u8; 1];
        control.read_exact(&mut op).await.unwrap();
        assert_eq!(op[0], State::ParamExchange.to_byte());

        stop.send(()).unwrap();
        control.read_exact(&mut op).await.unwrap();
        assert_eq!(op[0], State::ServerTerminate.to_byte());
    }
}
