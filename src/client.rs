use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, warn};

use crate::control;
use crate::cookie;
use crate::error::{Iperf3Error, Result};
use crate::params;
use crate::session::{Report, TestHandle, TestSession};
use crate::settings::{Role, TestSettings};

/// Resolve `host` to the first address of the requested IP version.
pub async fn resolve(host: &str, port: u16, ip_version: Option<u8>) -> Result<SocketAddr> {
    let mut addrs = lookup_host((host, port)).await?;
    addrs
        .find(|addr| match ip_version {
            Some(4) => addr.is_ipv4(),
            Some(6) => addr.is_ipv6(),
            _ => true,
        })
        .ok_or_else(|| {
            Iperf3Error::InvalidSettings(format!("no usable address for {host}"))
        })
}

/// Runs tests against iperf3 servers.
///
/// Tests are queued with [`Client::create_test`] and started together by
/// [`Client::run_all_tests`]. Each test runs in its own task and reports
/// through the returned channel.
pub struct Client {
    queued: Vec<(String, TestSettings)>,
    running: HashMap<String, TestHandle>,
    done_tx: mpsc::UnboundedSender<String>,
    done_rx: mpsc::UnboundedReceiver<String>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// A client with no tests.
    pub fn new() -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Client {
            queued: Vec::new(),
            running: HashMap::new(),
            done_tx,
            done_rx,
        }
    }

    /// Queue a test and return its cookie.
    pub fn create_test(&mut self, settings: TestSettings) -> Result<String> {
        settings.validate()?;
        let wire = cookie::make_cookie();
        let token = cookie::token(&wire).to_string();
        debug!(cookie = %token, server = %settings.server_address, "test created");
        self.queued.push((wire, settings));
        Ok(token)
    }

    /// Connect every queued test's control channel and start them.
    ///
    /// Interval reports, then a final [`Report::Finished`] or
    /// [`Report::Failed`] per test, arrive on the returned channel. It closes
    /// once every test is over.
    pub async fn run_all_tests(&mut self) -> Result<mpsc::Receiver<Report>> {
        let (tx, rx) = mpsc::channel(64);

        for (wire, settings) in std::mem::take(&mut self.queued) {
            let stream = connect_control(&settings).await?;
            let local = stream.local_addr()?;
            let peer = stream.peer_addr()?;
            info!(%local, %peer, "control connection established");

            let (reader, writer) = control::split(stream);
            let session = TestSession::new(Role::Client, wire, settings, writer, local, peer)
                .with_reports(tx.clone());
            let token = session.cookie().to_string();
            let span = session.span();
            self.running.insert(token.clone(), session.handle());

            let tx = tx.clone();
            let done_tx = self.done_tx.clone();
            tokio::spawn(
                async move {
                    let report = match session.run(reader).await {
                        Ok(outcome) => Report::Finished(Box::new(outcome)),
                        Err(error) => {
                            error!(%error, "test failed");
                            Report::Failed {
                                cookie: token.clone(),
                                error,
                            }
                        }
                    };
                    let _ = tx.send(report).await;
                    let _ = done_tx.send(token);
                }
                .instrument(span),
            );
        }

        Ok(rx)
    }

    /// Ask every running test to terminate.
    pub fn stop_all_tests(&mut self) {
        self.reap();
        for (cookie, test) in self.running.drain() {
            info!(%cookie, "stopping test");
            test.terminate();
        }
    }

    /// Number of tests started and not yet finished.
    pub fn running_tests(&mut self) -> usize {
        self.reap();
        self.running.len()
    }

    /// Forget a finished test.
    pub fn test_done(&mut self, cookie: &str) {
        if self.running.remove(cookie).is_some() {
            debug!(%cookie, "test removed");
        }
    }

    fn reap(&mut self) {
        while let Ok(cookie) = self.done_rx.try_recv() {
            self.test_done(&cookie);
        }
    }
}

/// Open the control connection, retrying once after a short delay.
async fn connect_control(settings: &TestSettings) -> Result<TcpStream> {
    let addr = resolve(
        &settings.server_address,
        settings.server_port,
        settings.ip_version,
    )
    .await?;

    let mut retries = params::CONTROL_CONNECT_RETRIES;
    loop {
        match open_control(addr, settings).await {
            Ok(stream) => return Ok(stream),
            Err(source) if retries > 0 => {
                retries -= 1;
                warn!(%addr, error = %source, "control connection failed, retrying");
                tokio::time::sleep(params::CONTROL_RETRY_DELAY).await;
            }
            Err(source) => return Err(Iperf3Error::ConnectionFailed { addr, source }),
        }
    }
}

async fn open_control(addr: SocketAddr, settings: &TestSettings) -> io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    if settings.client_address.is_some() || settings.client_port.is_some() {
        let ip = match &settings.client_address {
            Some(ip) => ip
                .parse::<IpAddr>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
            None if addr.is_ipv6() => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        if settings.client_port.is_some() {
            socket.set_reuseaddr(true)?;
        }
        socket.bind(SocketAddr::new(ip, settings.client_port.unwrap_or(0)))?;
    }

    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn resolve_filters_by_ip_version() {
        let addr = resolve("127.0.0.1", 5201, Some(4)).await.unwrap();
        assert_eq!(addr, "127.0.0.1:5201".parse().unwrap());

        let err = resolve("127.0.0.1", 5201, Some(6)).await.unwrap_err();
        assert!(matches!(err, Iperf3Error::InvalidSettings(_)));
    }

    #[test]
    fn create_test_validates_settings() {
        let mut client = Client::new();
        let err = client
            .create_test(TestSettings {
                parallel: 0,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Iperf3Error::InvalidSettings(_)));

        let cookie = client.create_test(TestSettings::default()).unwrap();
        assert_eq!(cookie.len(), params::COOKIE_SIZE);
    }

    #[tokio::test(start_paused = true)]
    async fn control_connect_retries_once() {
        // grab a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = Client::new();
        client
            .create_test(TestSettings {
                server_address: "127.0.0.1".into(),
                server_port: port,
                ..Default::default()
            })
            .unwrap();

        let started = tokio::time::Instant::now();
        let err = client.run_all_tests().await.unwrap_err();
        assert!(matches!(err, Iperf3Error::ConnectionFailed { .. }));
        assert!(started.elapsed() >= params::CONTROL_RETRY_DELAY);
    }

    #[tokio::test]
    async fn client_sends_cookie_on_control_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client = Client::new();
        let cookie = client
            .create_test(TestSettings {
                server_address: "127.0.0.1".into(),
                server_port: port,
                ..Default::default()
            })
            .unwrap();
        let _reports = client.run_all_tests().await.unwrap();
        assert_eq!(client.running_tests(), 1);

        let (mut control, _) = listener.accept().await.unwrap();
        let mut wire = [0u8; params::COOKIE_WIRE_SIZE];
        tokio::io::AsyncReadExt::read_exact(&mut control, &mut wire)
            .await
            .unwrap();
        assert_eq!(cookie::parse_cookie(&wire).unwrap(), cookie);

        client.stop_all_tests();
        assert_eq!(client.running_tests(), 0);
    }
}
