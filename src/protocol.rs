//! iPerf3 wire data types.
//!
//! The control channel carries single-byte op-codes and length-prefixed JSON
//! blobs. These types match the JSON emitted and accepted by the reference
//! iperf3 implementation, so either end of a test can be a stock `iperf3`.

use serde::{Deserialize, Deserializer, Serialize};

/// Control-channel op-codes, one byte each on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum State {
    /// Streams may start sending.
    TestStart = 1,
    /// The test is running.
    TestRunning = 2,
    /// Sender asks the peer to stop (client to server).
    TestEnd = 4,
    /// Parameter JSON is expected next.
    ParamExchange = 9,
    /// Data connections should be opened.
    CreateStreams = 10,
    /// The server is going away.
    ServerTerminate = 11,
    /// The client is going away.
    ClientTerminate = 12,
    /// Results JSON is exchanged next.
    ExchangeResults = 13,
    /// Peer results are available.
    DisplayResults = 14,
    /// The server is ready for a test.
    IperfStart = 15,
    /// The test is complete.
    IperfDone = 16,
    /// The server refused the test.
    AccessDenied = -1,
    /// The server hit an error.
    ServerError = -2,
}

impl State {
    /// Decode an op-code byte, `None` for codes this engine does not know.
    pub fn from_byte(b: u8) -> Option<Self> {
        let state = match b as i8 {
            1 => State::TestStart,
            2 => State::TestRunning,
            4 => State::TestEnd,
            9 => State::ParamExchange,
            10 => State::CreateStreams,
            11 => State::ServerTerminate,
            12 => State::ClientTerminate,
            13 => State::ExchangeResults,
            14 => State::DisplayResults,
            15 => State::IperfStart,
            16 => State::IperfDone,
            -1 => State::AccessDenied,
            -2 => State::ServerError,
            _ => return None,
        };
        Some(state)
    }

    /// The op-code byte sent on the wire.
    pub fn to_byte(self) -> u8 {
        (self as i8) as u8
    }
}

/// Test parameters sent by the client after PARAM_EXCHANGE.
///
/// The reference server treats several keys as flags that are set by their
/// mere presence, so `false` flags are left out of the JSON entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestParameters {
    /// TCP test.
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "is_false")]
    pub tcp: bool,
    /// UDP test.
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "is_false")]
    pub udp: bool,
    /// Seconds omitted at the start of the test.
    #[serde(default)]
    pub omit: u32,
    /// Test duration in seconds.
    #[serde(default)]
    pub time: u64,
    /// Number of bytes to send, replaces the duration when present.
    #[serde(rename = "num", default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    /// Number of blocks to send, replaces the duration when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockcount: Option<u64>,
    /// Number of parallel data streams.
    pub parallel: u32,
    /// Server sends, client receives.
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "is_false")]
    pub reverse: bool,
    /// Socket buffer size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<u32>,
    /// Block size.
    #[serde(rename = "len")]
    pub block_size: usize,
    /// Disable Nagle's algorithm.
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "is_false")]
    pub nodelay: bool,
    /// Per-stream pacing target in bits per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u64>,
    /// Free-form test title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Use 64-bit UDP packet counters.
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "is_false")]
    pub udp_counters_64bit: bool,
    /// Version string of the client.
    #[serde(default)]
    pub client_version: String,
}

/// Results one side sends the other during EXCHANGE_RESULTS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeResults {
    /// CPU utilization, always zero here.
    #[serde(default)]
    pub cpu_util_total: f64,
    /// User CPU utilization, always zero here.
    #[serde(default)]
    pub cpu_util_user: f64,
    /// System CPU utilization, always zero here.
    #[serde(default)]
    pub cpu_util_system: f64,
    /// Whether the sender could read retransmit counters.
    #[serde(default)]
    pub sender_has_retransmits: i32,
    /// Congestion control algorithm name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub congestion_used: Option<String>,
    /// Per-stream totals.
    #[serde(default)]
    pub streams: Vec<StreamResults>,
}

/// Totals for a single stream, part of [`ExchangeResults`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamResults {
    /// Stream identifier.
    pub id: u32,
    /// Bytes sent or received, depending on direction.
    pub bytes: u64,
    /// TCP retransmits, `-1` when unknown.
    #[serde(default)]
    pub retransmits: i64,
    /// UDP jitter in seconds.
    #[serde(default)]
    pub jitter: f64,
    /// UDP packets presumed lost.
    #[serde(default)]
    pub errors: i64,
    /// UDP packets sent or received.
    #[serde(default)]
    pub packets: u64,
    /// Seconds since test start when the stream started.
    #[serde(default)]
    pub start_time: f64,
    /// Seconds since test start when the stream stopped.
    #[serde(default)]
    pub end_time: f64,
}

/// One stream's share of a stats interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInterval {
    /// Stream identifier.
    pub id: u32,
    /// Platform socket identifier.
    pub socket: i32,
    /// Interval start, seconds since TEST_START.
    pub start: f64,
    /// Interval end, seconds since TEST_START.
    pub end: f64,
    /// Interval length in seconds.
    pub seconds: f64,
    /// Bytes moved in the interval.
    pub bytes: u64,
    /// Throughput over the interval.
    pub bits_per_second: f64,
    /// TCP retransmits in the interval.
    pub retransmits: i64,
    /// Whether the interval falls in the omit period.
    pub omitted: bool,
}

/// Aggregate of all streams over one stats interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntervalSum {
    /// Interval start, seconds since TEST_START.
    pub start: f64,
    /// Interval end, seconds since TEST_START.
    pub end: f64,
    /// Interval length in seconds.
    pub seconds: f64,
    /// Bytes moved by all streams.
    pub bytes: u64,
    /// Sum of the streams' throughput.
    pub bits_per_second: f64,
    /// Sum of the streams' retransmits.
    pub retransmits: i64,
    /// Whether the interval falls in the omit period.
    pub omitted: bool,
}

/// A harvested stats interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalReport {
    /// Per-stream records.
    pub streams: Vec<StreamInterval>,
    /// Aggregate record.
    pub sum: IntervalSum,
}

fn is_false(b: &bool) -> bool {
    !*b
}

// Presence flags: `1`, `true` and `{}` all count as set.
fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(!matches!(
        value,
        serde_json::Value::Null | serde_json::Value::Bool(false)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_byte_conversion() {
        let states = [
            State::TestStart,
            State::TestRunning,
            State::TestEnd,
            State::ParamExchange,
            State::CreateStreams,
            State::ServerTerminate,
            State::ClientTerminate,
            State::ExchangeResults,
            State::DisplayResults,
            State::IperfStart,
            State::IperfDone,
            State::AccessDenied,
            State::ServerError,
        ];

        for state in states {
            assert_eq!(State::from_byte(state.to_byte()), Some(state));
        }
        assert_eq!(State::AccessDenied.to_byte(), 0xff);
        assert_eq!(State::from_byte(3), None);
    }

    #[test]
    fn false_flags_omitted() {
        let params = TestParameters {
            tcp: true,
            udp: false,
            omit: 0,
            time: 10,
            bytes: None,
            blockcount: None,
            parallel: 1,
            reverse: false,
            window: None,
            block_size: 131072,
            nodelay: false,
            bandwidth: None,
            title: None,
            udp_counters_64bit: false,
            client_version: "test".into(),
        };

        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains(r#""tcp":true"#));
        assert!(json.contains(r#""len":131072"#));
        assert!(!json.contains("reverse"));
        assert!(!json.contains("udp"));
        assert!(!json.contains("num"));
    }

    #[test]
    fn deserialize_reference_client_parameters() {
        let json = r#"{"udp":true,"omit":0,"time":5,"parallel":2,"reverse":true,
            "len":1460,"bandwidth":1048576,"pacing_timer":1000,
            "udp_counters_64bit":1,"client_version":"3.9"}"#;
        let params: TestParameters = serde_json::from_str(json).unwrap();

        assert!(params.udp);
        assert!(!params.tcp);
        assert!(params.reverse);
        assert!(params.udp_counters_64bit);
        assert_eq!(params.parallel, 2);
        assert_eq!(params.block_size, 1460);
        assert_eq!(params.bandwidth, Some(1048576));
    }

    #[test]
    fn deserialize_reference_results() {
        let json = r#"{"cpu_util_total":1.5,"cpu_util_user":0.5,"cpu_util_system":1.0,
            "sender_has_retransmits":1,"congestion_used":"cubic",
            "streams":[{"id":1,"bytes":1000,"retransmits":3,"jitter":0,"errors":0,
            "omitted_errors":0,"packets":0,"omitted_packets":0,"start_time":0,"end_time":10.0}]}"#;
        let results: ExchangeResults = serde_json::from_str(json).unwrap();

        assert_eq!(results.congestion_used.as_deref(), Some("cubic"));
        assert_eq!(results.streams.len(), 1);
        assert_eq!(results.streams[0].retransmits, 3);
        assert_eq!(results.streams[0].end_time, 10.0);
    }
}
