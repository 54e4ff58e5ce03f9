use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::{ArgGroup, Parser};
use iperf3_engine::client::Client;
use iperf3_engine::emitter::{Emitter, HumanReadableEmitter, JsonEmitter};
use iperf3_engine::params;
use iperf3_engine::server::Server;
use iperf3_engine::session::Report;
use iperf3_engine::settings::{TestSettings, Transport};
use iperf3_engine::summary::Summary;
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "iperf3", version, about = "iPerf3 compatible throughput tester")]
#[command(group(ArgGroup::new("mode").required(true).args(["server", "client"])))]
struct Cli {
    /// Run in server mode
    #[arg(short, long)]
    server: bool,
    /// Run in client mode, connecting to <host>
    #[arg(short, long, value_name = "host")]
    client: Option<String>,
    /// Server port to listen on / connect to
    #[arg(short, long, default_value_t = params::DEFAULT_PORT)]
    port: u16,
    /// Use UDP rather than TCP
    #[arg(short, long)]
    udp: bool,
    /// Time in seconds to transmit for
    #[arg(short = 't', long = "time", default_value_t = params::DEFAULT_DURATION_SECS)]
    time: u64,
    /// Number of bytes to transmit (instead of -t), K/M/G suffixes allowed
    #[arg(short = 'n', long, value_parser = parse_bytes, conflicts_with = "blockcount")]
    bytes: Option<u64>,
    /// Number of blocks to transmit (instead of -t or -n)
    #[arg(short = 'k', long)]
    blockcount: Option<u64>,
    /// Length of buffer to read or write, K/M suffixes allowed
    #[arg(short = 'l', long, value_parser = parse_bytes)]
    length: Option<u64>,
    /// Number of parallel client streams to run
    #[arg(short = 'P', long, default_value_t = 1)]
    parallel: u32,
    /// Run in reverse mode (server sends, client receives)
    #[arg(short = 'R', long)]
    reverse: bool,
    /// Set TCP no delay, disabling Nagle's algorithm
    #[arg(short = 'N', long)]
    no_delay: bool,
    /// Set window size / socket buffer size, K/M suffixes allowed
    #[arg(short, long, value_parser = parse_bytes)]
    window: Option<u64>,
    /// Title sent to the server with the test parameters
    #[arg(short = 'T', long)]
    title: Option<String>,
    /// Only use IPv4
    #[arg(short = '4', long = "version4", conflicts_with = "ipv6")]
    ipv4: bool,
    /// Only use IPv6
    #[arg(short = '6', long = "version6")]
    ipv6: bool,
    /// Transmit from / write received data to a file
    #[arg(short = 'F', long)]
    file: Option<PathBuf>,
    /// Seconds between periodic throughput reports
    #[arg(short, long, default_value_t = params::DEFAULT_REPORT_INTERVAL)]
    interval: f64,
    /// Target bitrate in bits/sec per stream, K/M/G suffixes allowed
    #[arg(short, long, value_parser = parse_rate)]
    bandwidth: Option<u64>,
    /// Format to report: k, m, g (bits) or K, M, G (bytes)
    #[arg(short, long)]
    format: Option<char>,
    /// Use 64-bit counters in UDP test packets
    #[arg(long = "udp-counters-64bit")]
    udp_counters_64bit: bool,
    /// Bind the client control socket to this port
    #[arg(long)]
    cport: Option<u16>,
    /// Bind to the interface associated with this address
    #[arg(short = 'B', long)]
    bind: Option<String>,
    /// Output in JSON lines format
    #[arg(short = 'J', long)]
    json: bool,
    /// Emit debugging output
    #[arg(short, long)]
    debug: bool,
    /// Send log output to a file
    #[arg(long, value_name = "file")]
    logfile: Option<PathBuf>,
}

impl Cli {
    fn settings(&self) -> Result<TestSettings, Box<dyn std::error::Error>> {
        let (server_address, client_address) = match &self.client {
            Some(host) => (host.clone(), self.bind.clone()),
            None => (self.bind.clone().unwrap_or_default(), None),
        };
        let window = self
            .window
            .map(u32::try_from)
            .transpose()
            .map_err(|_| "window size too large")?;

        Ok(TestSettings {
            transport: if self.udp {
                Transport::Udp
            } else {
                Transport::Tcp
            },
            server_address,
            server_port: self.port,
            client_address,
            client_port: self.cport,
            block_size: self.length.map(|l| l as usize),
            parallel: self.parallel,
            reverse: self.reverse,
            no_delay: self.no_delay,
            window,
            title: self.title.clone(),
            ip_version: if self.ipv4 {
                Some(4)
            } else if self.ipv6 {
                Some(6)
            } else {
                None
            },
            file: self.file.clone(),
            udp64bitcounters: self.udp_counters_64bit,
            test_duration: self.time,
            blockcount: self.blockcount,
            bytes: self.bytes,
            report_interval: self.interval,
            bandwidth: self.bandwidth,
            format: self.format,
        })
    }
}

fn split_suffix(s: &str) -> Result<(f64, i32), String> {
    let (number, exponent) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 1),
        Some('m' | 'M') => (&s[..s.len() - 1], 2),
        Some('g' | 'G') => (&s[..s.len() - 1], 3),
        Some('t' | 'T') => (&s[..s.len() - 1], 4),
        _ => (s, 0),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid number '{s}'"))?;
    if value < 0.0 {
        return Err(format!("'{s}' must not be negative"));
    }
    Ok((value, exponent))
}

/// Sizes scale by 1024 per suffix step.
fn parse_bytes(s: &str) -> Result<u64, String> {
    let (value, exponent) = split_suffix(s)?;
    Ok((value * 1024f64.powi(exponent)) as u64)
}

/// Rates scale by 1000 per suffix step.
fn parse_rate(s: &str) -> Result<u64, String> {
    let (value, exponent) = split_suffix(s)?;
    Ok((value * 1000f64.powi(exponent)) as u64)
}

fn init_tracing(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match &cli.logfile {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(File::create(path)?)),
        ),
        None => None,
    };
    let stderr_layer = cli
        .logfile
        .is_none()
        .then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

/// Forward one report to the emitter. Returns `false` for a failed test.
fn emit(emitter: &mut dyn Emitter, report: Report) -> Result<bool, Box<dyn std::error::Error>> {
    match report {
        Report::Interval { cookie, report } => emitter.on_interval(&cookie, &report)?,
        Report::Finished(outcome) => {
            emitter.on_summary(&Summary::from_outcome(&outcome))?;
            emitter.on_complete(&outcome.cookie)?;
        }
        Report::Failed { cookie, error } => {
            emitter.on_error(&cookie, &error.to_string())?;
            return Ok(false);
        }
    }
    Ok(true)
}

async fn run_client(
    settings: TestSettings,
    emitter: &mut dyn Emitter,
) -> Result<bool, Box<dyn std::error::Error>> {
    let mut client = Client::new();
    let host = settings.server_address.clone();
    let port = settings.server_port;
    let cookie = client.create_test(settings)?;
    emitter.on_starting(&cookie, &host, port)?;

    let mut rx = client.run_all_tests().await?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut ok = true;
    let mut interrupted = false;
    loop {
        tokio::select! {
            report = rx.recv() => match report {
                Some(report) => ok &= emit(emitter, report)?,
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                client.stop_all_tests();
            }
        }
    }
    Ok(ok && !interrupted)
}

async fn run_server(
    settings: TestSettings,
    emitter: &mut dyn Emitter,
) -> Result<bool, Box<dyn std::error::Error>> {
    let (tx, mut rx) = mpsc::channel(64);
    let server = Server::bind(settings).await?.with_reports(tx);
    emitter.on_listening(server.local_addr()?)?;

    let server = tokio::spawn(server.run(async {
        let _ = tokio::signal::ctrl_c().await;
    }));

    // closes once the server and every test it started are gone
    while let Some(report) = rx.recv().await {
        emit(emitter, report)?;
    }
    server.await??;
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(&cli)?;
    let settings = cli.settings()?;

    let mut emitter: Box<dyn Emitter> = if cli.json {
        Box::new(JsonEmitter::new(std::io::stdout()))
    } else {
        Box::new(HumanReadableEmitter::new(std::io::stdout(), cli.format))
    };

    let ok = if cli.server {
        run_server(settings, emitter.as_mut()).await?
    } else {
        run_client(settings, emitter.as_mut()).await?
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
