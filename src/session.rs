//! The test state machine.
//!
//! A [`TestSession`] drives one test from either end of the control
//! connection. It runs as a single task that owns all test state and reacts
//! to four sources: control messages from the peer, events from its streams
//! and connectors, the duration timer and the stats timer. Nothing else
//! touches the session's state, so none of it is locked.
//!
//! A client session goes through
//! `PARAM_EXCHANGE → CREATE_STREAMS → TEST_START → TEST_RUNNING →
//! EXCHANGE_RESULTS → DISPLAY_RESULTS → IPERF_DONE`, driven by op-codes from
//! the server. A server session sends those op-codes and reacts to
//! `TEST_END`, `IPERF_DONE` and `CLIENT_TERMINATE` from the client.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, error, info, warn};

use crate::control::{ControlProtocol, ControlReader, Drained, StringDrain, op_codes};
use crate::cookie;
use crate::error::{Iperf3Error, Result};
use crate::protocol::{ExchangeResults, IntervalReport, State, TestParameters};
use crate::settings::{Role, StopCondition, TestSettings, Transport};
use crate::stats::{IntervalClock, interval_report};
use crate::stream::{
    DataConnection, SendBudget, StreamConfig, StreamEvent, TestStream, stream_id, tcp, udp,
};

/// Events delivered to a running session from outside the control channel.
#[derive(Debug)]
pub enum TestEvent {
    /// A data connection was opened and its handshake completed.
    Connected {
        /// Stream id.
        id: u32,
        /// The connected data-plane socket.
        conn: DataConnection,
    },
    /// Opening a data connection failed.
    ConnectFailed {
        /// Stream id.
        id: u32,
        /// Why it failed.
        error: io::Error,
    },
    /// The server router identified a TCP data connection for this test.
    DataConnection(TcpStream),
    /// The owning shell is shutting down.
    Terminate,
}

/// Progress reported to the owner of a test.
#[derive(Debug)]
pub enum Report {
    /// A stats interval was harvested.
    Interval {
        /// Printable test cookie.
        cookie: String,
        /// Per-stream and aggregate stats.
        report: IntervalReport,
    },
    /// The test completed.
    Finished(Box<TestOutcome>),
    /// The test failed.
    Failed {
        /// Printable test cookie.
        cookie: String,
        /// What went wrong.
        error: Iperf3Error,
    },
}

/// Everything known about a test once it has finished.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    /// Printable test cookie.
    pub cookie: String,
    /// The end this outcome was collected on.
    pub role: Role,
    /// Data-plane transport.
    pub transport: Transport,
    /// Whether this end sent data.
    pub sender: bool,
    /// Our own per-stream totals.
    pub local: ExchangeResults,
    /// The peer's per-stream totals.
    pub remote: Option<ExchangeResults>,
    /// Every harvested interval.
    pub intervals: Vec<IntervalReport>,
}

/// Handle for delivering [`TestEvent`]s to a running session.
#[derive(Debug, Clone)]
pub struct TestHandle {
    events: mpsc::UnboundedSender<TestEvent>,
}

impl TestHandle {
    /// Hand a data connection to the test. Returns `false` if the test is
    /// gone.
    pub fn add_connection(&self, stream: TcpStream) -> bool {
        self.events.send(TestEvent::DataConnection(stream)).is_ok()
    }

    /// Ask the test to shut down.
    pub fn terminate(&self) {
        let _ = self.events.send(TestEvent::Terminate);
    }
}

/// What the string currently being drained is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainTarget {
    /// Client parameters, received by the server.
    Parameters,
    /// Peer results.
    Results,
}

// Position of a main-line state in the protocol sequence. Side states
// (terminate, errors) have no rank and are accepted at any point.
fn rank(state: State) -> Option<u8> {
    let rank = match state {
        State::ParamExchange => 0,
        State::CreateStreams => 1,
        State::TestStart => 2,
        State::TestRunning => 3,
        State::TestEnd => 4,
        State::ExchangeResults => 5,
        State::DisplayResults => 6,
        State::IperfDone => 7,
        _ => return None,
    };
    Some(rank)
}

fn send_budget(settings: &TestSettings) -> Arc<SendBudget> {
    let min_block = match settings.transport {
        Transport::Tcp => 0,
        Transport::Udp => settings.udp_header_size(),
    };
    Arc::new(SendBudget::new(settings.stop_condition()).with_min_block(min_block))
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// One test, from either end.
pub struct TestSession {
    role: Role,
    cookie: String,
    settings: TestSettings,
    state: Option<State>,
    control: ControlProtocol,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,

    streams: Vec<TestStream>,
    budget: Arc<SendBudget>,
    connector: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<TestEvent>,
    events: mpsc::UnboundedReceiver<TestEvent>,
    stream_events_tx: mpsc::UnboundedSender<StreamEvent>,
    stream_events: mpsc::UnboundedReceiver<StreamEvent>,

    drain: Option<(StringDrain, DrainTarget)>,
    remote_results: Option<ExchangeResults>,

    test_start: Option<Instant>,
    clock: Option<IntervalClock>,
    intervals: Vec<IntervalReport>,
    stop_deadline: Option<Instant>,
    stats_deadline: Option<Instant>,
    depleted_streams: Vec<u32>,
    depleted: bool,
    streams_stopped: bool,
    finished: bool,

    reports: Option<mpsc::Sender<Report>>,
}

impl TestSession {
    /// Create a session over an established control connection.
    ///
    /// `cookie` is the full wire cookie including its NUL terminator. A
    /// client session sends it as soon as it runs; a server session was
    /// created because the client already sent it.
    pub fn new(
        role: Role,
        cookie: String,
        settings: TestSettings,
        control: ControlProtocol,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (stream_events_tx, stream_events) = mpsc::unbounded_channel();
        let budget = send_budget(&settings);

        TestSession {
            role,
            cookie,
            settings,
            state: None,
            control,
            local_addr,
            peer_addr,
            streams: Vec::new(),
            budget,
            connector: None,
            events_tx,
            events,
            stream_events_tx,
            stream_events,
            drain: None,
            remote_results: None,
            test_start: None,
            clock: None,
            intervals: Vec::new(),
            stop_deadline: None,
            stats_deadline: None,
            depleted_streams: Vec::new(),
            depleted: false,
            streams_stopped: false,
            finished: false,
            reports: None,
        }
    }

    /// Send progress reports to `reports`.
    pub fn with_reports(mut self, reports: mpsc::Sender<Report>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Handle for delivering events to this session once it runs.
    pub fn handle(&self) -> TestHandle {
        TestHandle {
            events: self.events_tx.clone(),
        }
    }

    /// Printable cookie.
    pub fn cookie(&self) -> &str {
        cookie::token(&self.cookie)
    }

    /// Span every log line of this test is recorded under.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("test", role = ?self.role, cookie = %self.cookie())
    }

    /// Last protocol state entered, if any.
    pub fn state(&self) -> Option<State> {
        self.state
    }

    /// Drive the test to completion.
    pub async fn run(mut self, mut reader: ControlReader) -> Result<TestOutcome> {
        self.begin().await?;

        while !self.finished {
            tokio::select! {
                message = reader.next_message() => match message? {
                    Some(message) => self.handle_message(message).await?,
                    None => self.control_closed()?,
                },
                Some(event) = self.events.recv() => self.handle_event(event).await?,
                Some(event) = self.stream_events.recv() => self.handle_stream_event(event).await?,
                _ = wait_until(self.stop_deadline) => {
                    debug!("test duration elapsed");
                    self.stop_deadline = None;
                    self.stop_all_streams().await?;
                }
                _ = wait_until(self.stats_deadline) => {
                    let next = self.stats_deadline.map(|d| d + self.settings.report_interval());
                    self.stats_deadline = next;
                    self.collect_stats().await;
                    if self.receive_target_reached() {
                        debug!("all expected data received");
                        self.stop_all_streams().await?;
                    }
                }
            }
        }

        Ok(self.outcome())
    }

    async fn begin(&mut self) -> Result<()> {
        match self.role {
            Role::Client => {
                debug!("sending cookie");
                let cookie = self.cookie.clone();
                self.control.send_data(cookie.as_bytes()).await
            }
            Role::Server => {
                self.set_and_send_state(State::ParamExchange).await?;
                self.drain = Some((StringDrain::new(), DrainTarget::Parameters));
                Ok(())
            }
        }
    }

    /// Process one chunk read from the control connection.
    pub async fn handle_message(&mut self, message: Bytes) -> Result<()> {
        let mut pending = Some(message);

        while let Some(message) = pending.take() {
            if let Some((drain, target)) = &mut self.drain {
                let target = *target;
                if let Drained::Complete { string, rest } = drain.feed(&message)? {
                    self.drain = None;
                    self.string_received(target, &string).await?;
                    if !rest.is_empty() && !self.finished {
                        pending = Some(rest);
                    }
                }
                continue;
            }

            let codes = op_codes(&message)?;
            for (i, &code) in codes.iter().enumerate() {
                self.handle_op_code(code).await?;
                if self.finished {
                    return Ok(());
                }
                // an op-code that starts a drain owns the rest of the message
                if self.drain.is_some() && i + 1 < codes.len() {
                    pending = Some(message.slice(i + 1..));
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_op_code(&mut self, code: u8) -> Result<()> {
        let Some(state) = State::from_byte(code) else {
            warn!(code, "unknown op-code ignored");
            return Ok(());
        };
        debug!(?state, "received op-code");

        if let (Some(to), Some(from)) = (rank(state), self.state.and_then(rank))
            && to <= from
        {
            return Err(Iperf3Error::Protocol(format!(
                "unexpected {state:?} in state {:?}",
                self.state
            )));
        }
        self.state = Some(state);

        match self.role {
            Role::Client => self.client_op_code(state).await,
            Role::Server => self.server_op_code(state).await,
        }
    }

    async fn client_op_code(&mut self, state: State) -> Result<()> {
        match state {
            State::ParamExchange => {
                let params = self.settings.to_parameters();
                debug!(?params, "sending parameters");
                self.control.send_json(&params).await?;
            }
            State::CreateStreams => self.create_streams(),
            State::TestStart => self.start_test().await?,
            State::TestRunning => info!("test is running"),
            State::ExchangeResults => {
                self.send_results().await?;
                self.drain = Some((StringDrain::new(), DrainTarget::Results));
            }
            State::DisplayResults => {
                info!(results = ?self.remote_results, "received results");
                self.client_cleanup().await?;
            }
            State::IperfDone | State::ServerTerminate => {
                debug!(?state, "peer is done");
            }
            State::AccessDenied => {
                error!("access denied by server");
                return Err(Iperf3Error::AccessDenied);
            }
            State::ServerError => {
                error!("server reported an error");
                return Err(Iperf3Error::ServerError);
            }
            State::TestEnd | State::ClientTerminate | State::IperfStart => {
                warn!(?state, "op-code not expected by a client, ignored");
            }
        }
        Ok(())
    }

    async fn server_op_code(&mut self, state: State) -> Result<()> {
        match state {
            State::TestEnd => {
                self.stop_all_streams().await?;
                self.set_and_send_state(State::ExchangeResults).await?;
                self.drain = Some((StringDrain::new(), DrainTarget::Results));
            }
            State::IperfDone => {
                self.control.close_connection().await?;
                self.finished = true;
            }
            State::ClientTerminate => {
                info!("client terminated the test");
                self.stop_all_streams().await?;
                self.control.close_connection().await?;
                self.finished = true;
            }
            _ => warn!(?state, "op-code not expected by a server, ignored"),
        }
        Ok(())
    }

    async fn string_received(&mut self, target: DrainTarget, string: &str) -> Result<()> {
        debug!(?target, %string, "string received");
        match target {
            DrainTarget::Parameters => {
                let params: TestParameters = serde_json::from_str(string)?;
                self.apply_parameters(&params)?;
                self.set_and_send_state(State::CreateStreams).await?;
                if self.settings.transport == Transport::Udp {
                    self.accept_udp_streams()?;
                }
            }
            DrainTarget::Results => {
                self.remote_results = Some(serde_json::from_str(string)?);
                if self.role == Role::Server {
                    self.send_results().await?;
                    self.set_and_send_state(State::DisplayResults).await?;
                }
            }
        }
        Ok(())
    }

    fn apply_parameters(&mut self, params: &TestParameters) -> Result<()> {
        self.settings.apply_parameters(params);
        self.settings.validate()?;
        self.budget = send_budget(&self.settings);
        info!(
            transport = ?self.settings.transport,
            parallel = self.settings.parallel,
            reverse = self.settings.reverse,
            block_size = self.settings.block_size(),
            "test parameters accepted"
        );
        Ok(())
    }

    async fn handle_event(&mut self, event: TestEvent) -> Result<()> {
        match event {
            TestEvent::Connected { id, conn } => self.add_stream(id, conn).await,
            TestEvent::ConnectFailed { id, error } => {
                error!(id, %error, "failed to create stream");
                Err(Iperf3Error::StreamCreate { id, source: error })
            }
            TestEvent::DataConnection(stream) => {
                if self.role != Role::Server
                    || self.settings.transport != Transport::Tcp
                    || self.state != Some(State::CreateStreams)
                    || self.streams.len() >= self.settings.parallel as usize
                {
                    warn!("unexpected data connection dropped");
                    return Ok(());
                }
                let id = stream_id(self.streams.len());
                tcp::configure(&stream, self.settings.no_delay, self.settings.window)
                    .map_err(|source| Iperf3Error::StreamCreate { id, source })?;
                self.add_stream(id, DataConnection::Tcp(stream)).await
            }
            TestEvent::Terminate => self.terminate().await,
        }
    }

    async fn handle_stream_event(&mut self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Depleted { id } => {
                debug!(id, "stream depleted");
                self.stream_depleted(id).await
            }
            StreamEvent::Failed { id, error } => {
                let stopped = self
                    .streams
                    .iter()
                    .find(|s| s.id() == id)
                    .is_none_or(TestStream::is_done);
                if stopped {
                    debug!(id, %error, "error on stopped stream ignored");
                    Ok(())
                } else {
                    error!(id, %error, "stream failed");
                    Err(error)
                }
            }
        }
    }

    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            block_size: self.settings.block_size(),
            sender: self.settings.is_sender(self.role),
            file: self.settings.file.clone(),
            udp64: self.settings.udp64bitcounters,
            bandwidth: self.settings.bandwidth,
            budget: self.budget.clone(),
            events: self.stream_events_tx.clone(),
        }
    }

    fn create_streams(&mut self) {
        let parallel = self.settings.parallel as usize;
        let transport = self.settings.transport;
        let server = self.peer_addr;
        let local = self.settings.client_address.as_ref().map(|_| self.local_addr.ip());
        let cookie = self.cookie.clone();
        let no_delay = self.settings.no_delay;
        let window = self.settings.window;
        let events = self.events_tx.clone();
        info!(parallel, ?transport, "creating streams");

        // one at a time, so a UDP server sees each connect probe in turn
        let task = async move {
            for index in 0..parallel {
                let id = stream_id(index);
                let conn = match transport {
                    Transport::Tcp => tcp::connect(server, local, &cookie, no_delay, window)
                        .await
                        .map(DataConnection::Tcp),
                    Transport::Udp => udp::connect(server, local, window)
                        .await
                        .map(DataConnection::Udp),
                };
                let event = match conn {
                    Ok(conn) => TestEvent::Connected { id, conn },
                    Err(error) => TestEvent::ConnectFailed { id, error },
                };
                let failed = matches!(event, TestEvent::ConnectFailed { .. });
                if events.send(event).is_err() || failed {
                    return;
                }
            }
        };
        self.connector = Some(tokio::spawn(task.in_current_span()));
    }

    fn accept_udp_streams(&mut self) -> Result<()> {
        let local = self.local_addr;
        let parallel = self.settings.parallel as usize;
        let window = self.settings.window;
        let events = self.events_tx.clone();

        // bound before CREATE_STREAMS reaches the client
        let first = udp::bind_listener(local)
            .map_err(|source| Iperf3Error::StreamCreate { id: 1, source })?;

        let task = async move {
            let mut listener = Some(first);
            for index in 0..parallel {
                let Some(current) = listener.take() else {
                    return;
                };
                let id = stream_id(index);
                let next = (index + 1 < parallel).then_some(local);
                let event = match udp::accept(current, next, window).await {
                    Ok((socket, next)) => {
                        listener = next;
                        TestEvent::Connected {
                            id,
                            conn: DataConnection::Udp(socket),
                        }
                    }
                    Err(error) => TestEvent::ConnectFailed { id, error },
                };
                if events.send(event).is_err() {
                    return;
                }
            }
        };
        self.connector = Some(tokio::spawn(task.in_current_span()));
        Ok(())
    }

    async fn add_stream(&mut self, id: u32, conn: DataConnection) -> Result<()> {
        let mut stream = TestStream::established(id, conn, self.stream_config()).await?;

        // TEST_START may have overtaken this connection's event
        if self.test_start.is_some() && !self.streams_stopped {
            stream.start_stream().await?;
        }
        self.streams.push(stream);

        if self.role == Role::Server
            && self.state == Some(State::CreateStreams)
            && self.streams.len() == self.settings.parallel as usize
        {
            self.set_and_send_state(State::TestStart).await?;
            self.start_test().await?;
            self.set_and_send_state(State::TestRunning).await?;
        }
        Ok(())
    }

    async fn start_test(&mut self) -> Result<()> {
        let now = Instant::now();
        self.test_start = Some(now);
        self.clock = Some(IntervalClock::new(now));

        if self.settings.is_sender(self.role) {
            for stream in &mut self.streams {
                stream.start_stream().await?;
            }
        }

        if self.role == Role::Client
            && let StopCondition::Duration(duration) = self.settings.stop_condition()
        {
            self.stop_deadline = Some(now + duration);
        }
        self.stats_deadline = Some(now + self.settings.report_interval());
        info!(streams = self.streams.len(), "test started");
        Ok(())
    }

    // Streams share one budget, so the first to find it empty may still have
    // siblings writing their last block. Stop once every sender has drained.
    async fn stream_depleted(&mut self, id: u32) -> Result<()> {
        if !self.depleted_streams.contains(&id) {
            self.depleted_streams.push(id);
        }
        let senders = self.streams.iter().filter(|s| s.is_sending()).count();
        if self.depleted_streams.len() < senders {
            return Ok(());
        }
        self.data_depleted().await
    }

    async fn data_depleted(&mut self) -> Result<()> {
        if self.depleted {
            return Ok(());
        }
        self.depleted = true;
        self.stop_all_streams().await
    }

    /// Stop every stream and, on the client, tell the server with
    /// `TEST_END`. Calling it again does nothing.
    pub async fn stop_all_streams(&mut self) -> Result<()> {
        if self.streams_stopped {
            return Ok(());
        }
        self.streams_stopped = true;
        debug!("stopping all streams");

        for stream in &mut self.streams {
            stream.stop_stream();
        }
        self.stop_deadline = None;

        if self.stats_deadline.take().is_some() {
            self.collect_stats().await;
        }
        if self.role == Role::Client {
            self.set_and_send_state(State::TestEnd).await?;
        }
        Ok(())
    }

    async fn collect_stats(&mut self) {
        let Some(clock) = &mut self.clock else {
            return;
        };
        let bounds = clock.advance(Instant::now());
        if bounds.seconds <= 0.0 {
            return;
        }

        let samples: Vec<_> = self.streams.iter().map(TestStream::interval_sample).collect();
        let report = interval_report(bounds, &samples);
        info!(
            start = format_args!("{:.2}", bounds.start),
            end = format_args!("{:.2}", bounds.end),
            bytes = report.sum.bytes,
            bits_per_second = report.sum.bits_per_second,
            "interval"
        );
        self.intervals.push(report.clone());
        let cookie = self.cookie().to_string();
        self.report(Report::Interval { cookie, report }).await;
    }

    // A receiving client has no depletion signal of its own; it ends a
    // block or byte count test once it has seen everything the server sends.
    fn receive_target_reached(&self) -> bool {
        if self.role != Role::Client || self.settings.is_sender(self.role) {
            return false;
        }
        let target = match self.settings.stop_condition() {
            StopCondition::Duration(_) => return false,
            StopCondition::Bytes(n) => n,
            StopCondition::Blocks(n) => n.saturating_mul(self.settings.block_size() as u64),
        };
        let received: u64 = self
            .streams
            .iter()
            .map(|s| s.counters().totals().bytes_received)
            .sum();
        received >= target
    }

    async fn send_results(&mut self) -> Result<()> {
        let results = self.local_results();
        debug!(?results, "sending results");
        self.control.send_json(&results).await
    }

    fn local_results(&self) -> ExchangeResults {
        let start = self.test_start.unwrap_or_else(Instant::now);
        ExchangeResults {
            cpu_util_total: 0.0,
            cpu_util_user: 0.0,
            cpu_util_system: 0.0,
            sender_has_retransmits: 0,
            congestion_used: match self.settings.transport {
                Transport::Tcp => Some("unknown".to_string()),
                Transport::Udp => None,
            },
            streams: self.streams.iter().map(|s| s.results(start)).collect(),
        }
    }

    async fn client_cleanup(&mut self) -> Result<()> {
        self.set_and_send_state(State::IperfDone).await?;
        self.control.close_connection().await?;
        self.finished = true;
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        let state = match self.role {
            Role::Client => State::ClientTerminate,
            Role::Server => State::ServerTerminate,
        };
        info!("terminating test");
        for stream in &mut self.streams {
            stream.stop_stream();
        }
        self.streams_stopped = true;
        self.set_and_send_state(state).await?;
        self.control.close_connection().await?;
        self.finished = true;
        Ok(())
    }

    fn control_closed(&mut self) -> Result<()> {
        // a client may hang up without IPERF_DONE once it has the results
        if self.role == Role::Server && self.state == Some(State::DisplayResults) {
            self.finished = true;
            return Ok(());
        }
        error!(state = ?self.state, "control connection closed");
        Err(Iperf3Error::ControlClosed)
    }

    async fn set_and_send_state(&mut self, state: State) -> Result<()> {
        debug!(?state, "set and send state");
        self.state = Some(state);
        self.control.send_state(state).await
    }

    async fn report(&mut self, report: Report) {
        if let Some(reports) = &self.reports {
            let _ = reports.send(report).await;
        }
    }

    fn outcome(&mut self) -> TestOutcome {
        TestOutcome {
            cookie: self.cookie().to_string(),
            role: self.role,
            transport: self.settings.transport,
            sender: self.settings.is_sender(self.role),
            local: self.local_results(),
            remote: self.remote_results.take(),
            intervals: std::mem::take(&mut self.intervals),
        }
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        if let Some(connector) = self.connector.take() {
            connector.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    use super::*;
    use crate::control::encode_json;
    use crate::params;
    use crate::protocol::StreamResults;

    fn addr() -> SocketAddr {
        "127.0.0.1:5201".parse().unwrap()
    }

    fn client_session(settings: TestSettings) -> (TestSession, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let session = TestSession::new(
            Role::Client,
            cookie::make_cookie(),
            settings,
            ControlProtocol::new(Box::new(ours)),
            addr(),
            addr(),
        );
        (session, theirs)
    }

    fn results_frame(bytes: u64) -> Vec<u8> {
        let results = ExchangeResults {
            streams: vec![StreamResults {
                id: 1,
                bytes,
                ..Default::default()
            }],
            ..Default::default()
        };
        encode_json(&results).unwrap().to_vec()
    }

    async fn read_frame(peer: &mut DuplexStream) -> serde_json::Value {
        let len = peer.read_u32().await.unwrap() as usize;
        let mut buf = vec![0u8; len];
        peer.read_exact(&mut buf).await.unwrap();
        serde_json::from_slice(&buf).unwrap()
    }

    #[tokio::test]
    async fn parameters_sent_on_param_exchange() {
        let settings = TestSettings {
            test_duration: 3,
            parallel: 2,
            ..Default::default()
        };
        let (mut session, mut peer) = client_session(settings);

        session
            .handle_message(Bytes::from_static(&[9]))
            .await
            .unwrap();

        let params = read_frame(&mut peer).await;
        assert_eq!(params["time"], 3);
        assert_eq!(params["parallel"], 2);
        assert_eq!(params["tcp"], true);
        assert_eq!(session.state(), Some(State::ParamExchange));
    }

    #[tokio::test]
    async fn too_many_op_codes_is_fatal() {
        let (mut session, _peer) = client_session(TestSettings::default());
        let err = session
            .handle_message(Bytes::from_static(&[9, 10, 1]))
            .await
            .unwrap_err();
        assert!(matches!(err, Iperf3Error::Protocol(_)));
    }

    #[tokio::test]
    async fn unknown_op_code_ignored() {
        let (mut session, _peer) = client_session(TestSettings::default());
        session
            .handle_message(Bytes::from_static(&[3]))
            .await
            .unwrap();
        assert_eq!(session.state(), None);
    }

    #[tokio::test]
    async fn access_denied_surfaces_distinctly() {
        let (mut session, _peer) = client_session(TestSettings::default());
        let err = session
            .handle_message(Bytes::copy_from_slice(&[State::AccessDenied.to_byte()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Iperf3Error::AccessDenied));
    }

    #[tokio::test]
    async fn backwards_transition_rejected() {
        let (mut session, _peer) = client_session(TestSettings::default());
        session
            .handle_message(Bytes::from_static(&[9]))
            .await
            .unwrap();
        let err = session
            .handle_message(Bytes::from_static(&[9]))
            .await
            .unwrap_err();
        assert!(matches!(err, Iperf3Error::Protocol(_)));
    }

    #[tokio::test]
    async fn stop_all_streams_is_idempotent() {
        let (mut session, mut peer) = client_session(TestSettings::default());

        session.stop_all_streams().await.unwrap();
        session.data_depleted().await.unwrap();
        session.stop_all_streams().await.unwrap();
        session.control.close_connection().await.unwrap();

        let mut sent = Vec::new();
        peer.read_to_end(&mut sent).await.unwrap();
        assert_eq!(sent, [State::TestEnd.to_byte()]);
    }

    #[tokio::test]
    async fn results_drain_redispatches_trailing_op_code() {
        let (mut session, mut peer) = client_session(TestSettings::default());
        session.state = Some(State::TestEnd);

        session
            .handle_message(Bytes::copy_from_slice(&[State::ExchangeResults.to_byte()]))
            .await
            .unwrap();
        let ours = read_frame(&mut peer).await;
        assert_eq!(ours["streams"], serde_json::json!([]));

        // results and DISPLAY_RESULTS in one read, split at an odd place
        let mut wire = results_frame(4096);
        wire.push(State::DisplayResults.to_byte());
        let (a, b) = wire.split_at(3);
        session
            .handle_message(Bytes::copy_from_slice(a))
            .await
            .unwrap();
        assert!(session.remote_results.is_none());
        session
            .handle_message(Bytes::copy_from_slice(b))
            .await
            .unwrap();

        assert_eq!(session.remote_results.as_ref().unwrap().streams[0].bytes, 4096);
        assert!(session.finished);

        let mut tail = Vec::new();
        peer.read_to_end(&mut tail).await.unwrap();
        assert_eq!(tail, [State::IperfDone.to_byte()]);
    }

    #[tokio::test]
    async fn client_block_count_test_against_scripted_server() {
        let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = data_listener.local_addr().unwrap();
        let (ours, mut peer) = tokio::io::duplex(64 * 1024);
        let (reader_side, writer_side) = tokio::io::split(ours);

        let settings = TestSettings {
            blockcount: Some(3),
            block_size: Some(1000),
            ..Default::default()
        };
        let session = TestSession::new(
            Role::Client,
            cookie::make_cookie(),
            settings,
            ControlProtocol::new(Box::new(writer_side)),
            "127.0.0.1:0".parse().unwrap(),
            server_addr,
        );
        let reader = ControlReader::new(Box::new(reader_side));
        let client = tokio::spawn(session.run(reader));

        let mut cookie = [0u8; params::COOKIE_WIRE_SIZE];
        peer.read_exact(&mut cookie).await.unwrap();

        peer.write_all(&[State::ParamExchange.to_byte()]).await.unwrap();
        let params = read_frame(&mut peer).await;
        assert_eq!(params["blockcount"], 3);
        assert_eq!(params["len"], 1000);

        peer.write_all(&[State::CreateStreams.to_byte()]).await.unwrap();
        let (mut data, _) = data_listener.accept().await.unwrap();
        let mut data_cookie = [0u8; params::COOKIE_WIRE_SIZE];
        data.read_exact(&mut data_cookie).await.unwrap();
        assert_eq!(data_cookie, cookie);

        peer.write_all(&[State::TestStart.to_byte(), State::TestRunning.to_byte()])
            .await
            .unwrap();

        let mut payload = vec![0u8; 3000];
        data.read_exact(&mut payload).await.unwrap();

        assert_eq!(peer.read_u8().await.unwrap(), State::TestEnd.to_byte());
        peer.write_all(&[State::ExchangeResults.to_byte()]).await.unwrap();
        let client_results = read_frame(&mut peer).await;
        assert_eq!(client_results["streams"][0]["id"], 1);
        assert_eq!(client_results["streams"][0]["bytes"], 3000);

        let mut reply = results_frame(3000);
        reply.push(State::DisplayResults.to_byte());
        peer.write_all(&reply).await.unwrap();
        assert_eq!(peer.read_u8().await.unwrap(), State::IperfDone.to_byte());

        let outcome = client.await.unwrap().unwrap();
        assert!(outcome.sender);
        assert_eq!(outcome.local.streams[0].bytes, 3000);
        assert_eq!(outcome.remote.unwrap().streams[0].bytes, 3000);
    }

    #[tokio::test]
    async fn server_exchanges_parameters_and_results() {
        let (ours, mut peer) = tokio::io::duplex(64 * 1024);
        let (reader_side, writer_side) = tokio::io::split(ours);
        let session = TestSession::new(
            Role::Server,
            cookie::make_cookie(),
            TestSettings::default(),
            ControlProtocol::new(Box::new(writer_side)),
            addr(),
            addr(),
        );
        let handle = session.handle();
        let reader = ControlReader::new(Box::new(reader_side));
        let server = tokio::spawn(session.run(reader));

        assert_eq!(peer.read_u8().await.unwrap(), State::ParamExchange.to_byte());
        let params = TestSettings {
            test_duration: 1,
            ..Default::default()
        }
        .to_parameters();
        peer.write_all(&encode_json(&params).unwrap()).await.unwrap();
        assert_eq!(peer.read_u8().await.unwrap(), State::CreateStreams.to_byte());

        // one data connection over loopback, as the router would hand it over
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client_data, accepted) = tokio::join!(
            TcpStream::connect(listener.local_addr().unwrap()),
            listener.accept()
        );
        let mut client_data = client_data.unwrap();
        assert!(handle.add_connection(accepted.unwrap().0));

        assert_eq!(peer.read_u8().await.unwrap(), State::TestStart.to_byte());
        assert_eq!(peer.read_u8().await.unwrap(), State::TestRunning.to_byte());

        client_data.write_all(&[0u8; 5000]).await.unwrap();
        client_data.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        peer.write_all(&[State::TestEnd.to_byte()]).await.unwrap();
        assert_eq!(peer.read_u8().await.unwrap(), State::ExchangeResults.to_byte());
        peer.write_all(&results_frame(5000)).await.unwrap();

        let server_results = read_frame(&mut peer).await;
        assert_eq!(server_results["streams"][0]["bytes"], 5000);
        assert_eq!(peer.read_u8().await.unwrap(), State::DisplayResults.to_byte());

        peer.write_all(&[State::IperfDone.to_byte()]).await.unwrap();
        let outcome = server.await.unwrap().unwrap();
        assert!(!outcome.sender);
        assert_eq!(outcome.remote.unwrap().streams[0].bytes, 5000);
    }
}
