//! Test configuration.
//!
//! [`TestSettings`] is the parameter set a test is created from. On the client
//! it comes from the command line; on the server it starts from the server's
//! own settings and is overwritten by the parameters the client sends.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Iperf3Error, Result};
use crate::params;
use crate::protocol::TestParameters;

/// Data-plane transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Transport {
    /// TCP streams.
    #[default]
    Tcp,
    /// UDP streams.
    Udp,
}

/// Which end of the control connection a test runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Opens the control connection.
    Client,
    /// Accepts the control connection.
    Server,
}

/// What ends data transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    /// Stop after a fixed time.
    Duration(Duration),
    /// Stop after sending this many blocks.
    Blocks(u64),
    /// Stop after sending this many bytes.
    Bytes(u64),
}

/// Parameters of a single test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSettings {
    /// Data-plane transport.
    #[serde(default)]
    pub transport: Transport,
    /// Server host name or address. Empty on a server means "any".
    #[serde(default)]
    pub server_address: String,
    /// Server port.
    #[serde(default = "default_port")]
    pub server_port: u16,
    /// Local address to bind client sockets to.
    #[serde(default)]
    pub client_address: Option<String>,
    /// Local port to bind the client control socket to.
    #[serde(default)]
    pub client_port: Option<u16>,
    /// Block size; `None` picks the transport default.
    #[serde(default)]
    pub block_size: Option<usize>,
    /// Number of parallel data streams.
    #[serde(default = "default_parallel")]
    pub parallel: u32,
    /// Server sends, client receives.
    #[serde(default)]
    pub reverse: bool,
    /// Disable Nagle's algorithm on TCP data connections.
    #[serde(default)]
    pub no_delay: bool,
    /// Socket send and receive buffer size.
    #[serde(default)]
    pub window: Option<u32>,
    /// Free-form title carried in the parameter exchange.
    #[serde(default)]
    pub title: Option<String>,
    /// Restrict name resolution to IPv4 (`4`) or IPv6 (`6`).
    #[serde(default)]
    pub ip_version: Option<u8>,
    /// File used as data source (sender) or sink (receiver).
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Use 64-bit UDP packet counters.
    #[serde(default)]
    pub udp64bitcounters: bool,
    /// Test duration in seconds.
    #[serde(default = "default_duration")]
    pub test_duration: u64,
    /// Number of blocks to send instead of running for a duration.
    #[serde(default)]
    pub blockcount: Option<u64>,
    /// Number of bytes to send instead of running for a duration.
    #[serde(default)]
    pub bytes: Option<u64>,
    /// Seconds between interval reports.
    #[serde(default = "default_report_interval")]
    pub report_interval: f64,
    /// Per-stream pacing target in bits per second.
    #[serde(default)]
    pub bandwidth: Option<u64>,
    /// Unit for human-readable rates: `k`, `m`, `g` (bits) or `K`, `M`, `G` (bytes).
    #[serde(default)]
    pub format: Option<char>,
}

fn default_port() -> u16 {
    params::DEFAULT_PORT
}

fn default_parallel() -> u32 {
    1
}

fn default_duration() -> u64 {
    params::DEFAULT_DURATION_SECS
}

fn default_report_interval() -> f64 {
    params::DEFAULT_REPORT_INTERVAL
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            transport: Transport::Tcp,
            server_address: String::new(),
            server_port: default_port(),
            client_address: None,
            client_port: None,
            block_size: None,
            parallel: default_parallel(),
            reverse: false,
            no_delay: false,
            window: None,
            title: None,
            ip_version: None,
            file: None,
            udp64bitcounters: false,
            test_duration: default_duration(),
            blockcount: None,
            bytes: None,
            report_interval: default_report_interval(),
            bandwidth: None,
            format: None,
        }
    }
}

impl TestSettings {
    /// Block size, falling back to the transport default.
    pub fn block_size(&self) -> usize {
        self.block_size.unwrap_or(match self.transport {
            Transport::Tcp => params::DEFAULT_BLOCK_TCP,
            Transport::Udp => params::DEFAULT_BLOCK_UDP,
        })
    }

    /// Size of the UDP header prepended to every datagram.
    pub fn udp_header_size(&self) -> usize {
        if self.udp64bitcounters {
            params::UDP_HEADER_SIZE_64
        } else {
            params::UDP_HEADER_SIZE
        }
    }

    /// The active stop condition. Byte count wins over block count, which
    /// wins over duration.
    pub fn stop_condition(&self) -> StopCondition {
        if let Some(bytes) = self.bytes.filter(|b| *b > 0) {
            StopCondition::Bytes(bytes)
        } else if let Some(blocks) = self.blockcount.filter(|b| *b > 0) {
            StopCondition::Blocks(blocks)
        } else {
            StopCondition::Duration(Duration::from_secs(self.test_duration))
        }
    }

    /// Whether an endpoint with `role` sends data in this test.
    pub fn is_sender(&self, role: Role) -> bool {
        match role {
            Role::Client => !self.reverse,
            Role::Server => self.reverse,
        }
    }

    /// Interval between stats harvests.
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs_f64(self.report_interval)
    }

    /// Reject settings no test can run with.
    pub fn validate(&self) -> Result<()> {
        if self.parallel == 0 {
            return Err(Iperf3Error::InvalidSettings(
                "at least one stream is required".into(),
            ));
        }
        if self.bytes.is_some_and(|b| b > 0) && self.blockcount.is_some_and(|b| b > 0) {
            return Err(Iperf3Error::InvalidSettings(
                "only one of bytes and blockcount may be set".into(),
            ));
        }
        if let StopCondition::Duration(d) = self.stop_condition()
            && d.is_zero()
        {
            return Err(Iperf3Error::InvalidSettings(
                "test duration must be positive".into(),
            ));
        }
        if self.test_duration > params::MAX_DURATION_SECS {
            return Err(Iperf3Error::InvalidSettings(format!(
                "test duration must not exceed {} seconds",
                params::MAX_DURATION_SECS
            )));
        }
        let block_size = self.block_size();
        if block_size == 0 {
            return Err(Iperf3Error::InvalidSettings(
                "block size must be positive".into(),
            ));
        }
        let max_block = match self.transport {
            Transport::Tcp => params::MAX_BLOCK_TCP,
            Transport::Udp => params::MAX_BLOCK_UDP,
        };
        if block_size > max_block {
            return Err(Iperf3Error::InvalidSettings(format!(
                "block size must not exceed {max_block} bytes"
            )));
        }
        if self.transport == Transport::Udp {
            let header = self.udp_header_size();
            if block_size < header {
                return Err(Iperf3Error::InvalidSettings(format!(
                    "UDP block size must be at least {header} bytes"
                )));
            }
            if let StopCondition::Bytes(bytes) = self.stop_condition()
                && bytes < header as u64
            {
                return Err(Iperf3Error::InvalidSettings(format!(
                    "UDP byte count must be at least {header} bytes"
                )));
            }
        }
        if !(self.report_interval > 0.0 && self.report_interval <= params::MAX_REPORT_INTERVAL) {
            return Err(Iperf3Error::InvalidSettings(format!(
                "report interval must be positive and at most {} seconds",
                params::MAX_REPORT_INTERVAL
            )));
        }
        if let Some(v) = self.ip_version
            && v != 4
            && v != 6
        {
            return Err(Iperf3Error::InvalidSettings(format!(
                "unknown IP version {v}"
            )));
        }
        Ok(())
    }

    /// Parameter JSON sent to the server during PARAM_EXCHANGE.
    pub fn to_parameters(&self) -> TestParameters {
        TestParameters {
            tcp: self.transport == Transport::Tcp,
            udp: self.transport == Transport::Udp,
            omit: 0,
            time: self.test_duration,
            bytes: self.bytes.filter(|b| *b > 0),
            blockcount: self.blockcount.filter(|b| *b > 0),
            parallel: self.parallel,
            reverse: self.reverse,
            window: self.window,
            block_size: self.block_size(),
            nodelay: self.no_delay,
            bandwidth: self.bandwidth,
            title: self.title.clone(),
            udp_counters_64bit: self.udp64bitcounters,
            client_version: params::CLIENT_VERSION.to_string(),
        }
    }

    /// Overwrite the negotiated fields with what the client sent.
    pub fn apply_parameters(&mut self, p: &TestParameters) {
        self.transport = if p.udp { Transport::Udp } else { Transport::Tcp };
        self.test_duration = p.time;
        self.bytes = p.bytes;
        self.blockcount = p.blockcount;
        self.parallel = p.parallel;
        self.reverse = p.reverse;
        self.window = p.window;
        self.block_size = Some(p.block_size).filter(|b| *b > 0);
        self.no_delay = p.nodelay;
        self.bandwidth = p.bandwidth;
        self.title = p.title.clone();
        self.udp64bitcounters = p.udp_counters_64bit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = TestSettings::default();
        assert_eq!(settings.server_port, 5201);
        assert_eq!(settings.parallel, 1);
        assert_eq!(settings.block_size(), 128 * 1024);
        assert_eq!(
            settings.stop_condition(),
            StopCondition::Duration(Duration::from_secs(10))
        );
        assert!(settings.validate().is_ok());

        let udp = TestSettings {
            transport: Transport::Udp,
            ..Default::default()
        };
        assert_eq!(udp.block_size(), 8 * 1024);
    }

    #[test]
    fn exactly_one_stop_condition() {
        let blocks = TestSettings {
            blockcount: Some(20),
            ..Default::default()
        };
        assert_eq!(blocks.stop_condition(), StopCondition::Blocks(20));

        let bytes = TestSettings {
            bytes: Some(1000),
            test_duration: 3,
            ..Default::default()
        };
        assert_eq!(bytes.stop_condition(), StopCondition::Bytes(1000));

        let both = TestSettings {
            bytes: Some(1000),
            blockcount: Some(20),
            ..Default::default()
        };
        assert!(matches!(
            both.validate(),
            Err(Iperf3Error::InvalidSettings(_))
        ));
    }

    #[test]
    fn udp_block_must_fit_header() {
        let settings = TestSettings {
            transport: Transport::Udp,
            block_size: Some(8),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn block_size_is_bounded_per_transport() {
        let tcp = |len| TestSettings {
            reverse: true,
            block_size: Some(len),
            ..Default::default()
        };
        assert!(tcp(params::MAX_BLOCK_TCP).validate().is_ok());
        assert!(matches!(
            tcp(1 << 40).validate(),
            Err(Iperf3Error::InvalidSettings(_))
        ));

        let udp = |len| TestSettings {
            transport: Transport::Udp,
            block_size: Some(len),
            ..Default::default()
        };
        assert!(udp(params::MAX_BLOCK_UDP).validate().is_ok());
        assert!(matches!(
            udp(70_000).validate(),
            Err(Iperf3Error::InvalidSettings(_))
        ));
    }

    #[test]
    fn negotiated_block_size_is_checked() {
        let client = TestSettings {
            block_size: Some(4096),
            ..Default::default()
        };
        let mut params = client.to_parameters();
        params.block_size = 1 << 40;

        let mut server = TestSettings::default();
        server.apply_parameters(&params);
        assert!(server.validate().is_err());
    }

    #[test]
    fn out_of_range_timing_rejected() {
        let interval = |i| TestSettings {
            report_interval: i,
            ..Default::default()
        };
        assert!(interval(params::MAX_REPORT_INTERVAL).validate().is_ok());
        assert!(interval(1e30).validate().is_err());
        assert!(interval(f64::NAN).validate().is_err());
        assert!(interval(0.0).validate().is_err());

        let duration = TestSettings {
            test_duration: u64::MAX,
            ..Default::default()
        };
        assert!(duration.validate().is_err());
    }

    #[test]
    fn udp_byte_count_must_fit_header() {
        let settings = TestSettings {
            transport: Transport::Udp,
            bytes: Some(5),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn sender_direction() {
        let mut settings = TestSettings::default();
        assert!(settings.is_sender(Role::Client));
        assert!(!settings.is_sender(Role::Server));

        settings.reverse = true;
        assert!(!settings.is_sender(Role::Client));
        assert!(settings.is_sender(Role::Server));
    }

    #[test]
    fn parameters_round_trip() {
        let client = TestSettings {
            test_duration: 7,
            parallel: 3,
            block_size: Some(4096),
            reverse: true,
            title: Some("lab".into()),
            ..Default::default()
        };

        let json = serde_json::to_string(&client.to_parameters()).unwrap();
        let received: TestParameters = serde_json::from_str(&json).unwrap();

        let mut server = TestSettings::default();
        server.apply_parameters(&received);

        assert_eq!(server.test_duration, 7);
        assert_eq!(server.parallel, 3);
        assert_eq!(server.block_size(), 4096);
        assert!(server.reverse);
        assert_eq!(server.transport, Transport::Tcp);
        assert_eq!(server.title.as_deref(), Some("lab"));
    }
}
