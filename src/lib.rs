//! An [iPerf3](https://software.es.net/iperf/) compatible network throughput
//! test engine.
//!
//! iPerf3 measures throughput between two hosts. A client opens a TCP control
//! connection to a server, negotiates parameters as JSON, opens one or more
//! TCP or UDP data streams and pushes data over them for a fixed time, block
//! count or byte count while both ends collect interval statistics. At the
//! end the two sides exchange their totals.
//!
//! Either end may be a stock `iperf3`.
//!
//! # Quick start
//!
//! ```no_run
//! use iperf3_engine::client::Client;
//! use iperf3_engine::session::Report;
//! use iperf3_engine::settings::TestSettings;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = Client::new();
//! client.create_test(TestSettings {
//!     server_address: "iperf.example.net".into(),
//!     test_duration: 5,
//!     ..Default::default()
//! })?;
//!
//! let mut rx = client.run_all_tests().await?;
//! while let Some(report) = rx.recv().await {
//!     if let Report::Interval { report, .. } = report {
//!         println!("{:.0} bits/s", report.sum.bits_per_second);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
pub mod control;
pub mod cookie;
pub mod emitter;
pub mod error;
pub mod params;
pub mod protocol;
pub mod server;
pub mod session;
pub mod settings;
pub mod stats;
pub mod stream;
pub mod summary;
