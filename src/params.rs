//! Protocol constants and tuning parameters.

use std::time::Duration;

/// Number of printable characters in a test cookie.
pub const COOKIE_SIZE: usize = 36;

/// Cookie length on the wire: the printable characters plus a NUL terminator.
pub const COOKIE_WIRE_SIZE: usize = COOKIE_SIZE + 1;

/// Default control and data port.
pub const DEFAULT_PORT: u16 = 5201;

/// Default TCP block size (128 KiB).
pub const DEFAULT_BLOCK_TCP: usize = 128 * 1024;

/// Default UDP block size (8 KiB).
pub const DEFAULT_BLOCK_UDP: usize = 8 * 1024;

/// Largest TCP block size a test may use (1 MiB).
pub const MAX_BLOCK_TCP: usize = 1 << 20;

/// Largest UDP block size: the biggest payload an IPv4 datagram can carry.
pub const MAX_BLOCK_UDP: usize = 65507;

/// Default test duration in seconds.
pub const DEFAULT_DURATION_SECS: u64 = 10;

/// Longest test duration in seconds (one day).
pub const MAX_DURATION_SECS: u64 = 86_400;

/// Default interval between stats harvests, in seconds.
pub const DEFAULT_REPORT_INTERVAL: f64 = 1.0;

/// Longest interval between stats harvests, in seconds.
pub const MAX_REPORT_INTERVAL: f64 = 60.0;

/// UDP header with a 32-bit packet counter: seconds, microseconds, sequence.
pub const UDP_HEADER_SIZE: usize = 12;

/// UDP header with a 64-bit packet counter.
pub const UDP_HEADER_SIZE_64: usize = 16;

/// Payload of the datagram a client sends to open a UDP stream.
pub const UDP_CONNECT_MSG: u32 = 0x3637_3839;

/// Payload of the datagram a server answers a UDP connect probe with.
pub const UDP_CONNECT_REPLY: u32 = 0x3938_3736;

/// Smoothing divisor of the RFC 1889 jitter estimator.
pub const JITTER_SMOOTHING: f64 = 16.0;

/// Largest JSON blob accepted on the control channel (1 MiB).
pub const MAX_JSON_SIZE: usize = 1 << 20;

/// Number of extra attempts made when the control connection fails.
pub const CONTROL_CONNECT_RETRIES: u32 = 1;

/// Pause between control connection attempts.
pub const CONTROL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Read buffer used by receiving streams and the control channel.
pub const READ_BUFFER_SIZE: usize = 128 * 1024;

/// Version string advertised in the parameter exchange.
pub const CLIENT_VERSION: &str = concat!("iperf3-engine ", env!("CARGO_PKG_VERSION"));
