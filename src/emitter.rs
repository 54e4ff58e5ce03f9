//! Output formatting for test events.
//!
//! The [`Emitter`] trait defines callbacks for each stage of a test run.
//! Two implementations are provided:
//! - [`HumanReadableEmitter`]: iperf3-style interval lines and a final summary.
//! - [`JsonEmitter`]: one JSON object per line, suitable for machine consumption.

use std::io::Write;
use std::net::SocketAddr;

use serde::Serialize;

use crate::error::Result;
use crate::protocol::{IntervalReport, StreamInterval};
use crate::summary::{SideTotals, Summary, UdpTotals};

#[derive(Serialize)]
#[serde(tag = "type")]
enum Event<'a> {
    Listening {
        addr: SocketAddr,
    },
    Starting {
        cookie: &'a str,
        server: &'a str,
        port: u16,
    },
    Interval {
        cookie: &'a str,
        report: &'a IntervalReport,
    },
    Error {
        cookie: &'a str,
        error: &'a str,
    },
    Summary {
        summary: &'a Summary,
    },
    Complete {
        cookie: &'a str,
    },
}

/// Callbacks for iperf3 test lifecycle events.
pub trait Emitter {
    /// Called once a server is accepting tests.
    fn on_listening(&mut self, addr: SocketAddr) -> Result<()>;
    /// Called before a client test connects.
    fn on_starting(&mut self, cookie: &str, server: &str, port: u16) -> Result<()>;
    /// Called for each harvested stats interval.
    fn on_interval(&mut self, cookie: &str, report: &IntervalReport) -> Result<()>;
    /// Called when a test fails.
    fn on_error(&mut self, cookie: &str, err: &str) -> Result<()>;
    /// Called once a test has its final results.
    fn on_summary(&mut self, s: &Summary) -> Result<()>;
    /// Called when a test is over.
    fn on_complete(&mut self, cookie: &str) -> Result<()>;
}

const PREFIXES: [&str; 5] = ["", "K", "M", "G", "T"];

fn prefix_index(unit: char) -> Option<usize> {
    match unit.to_ascii_lowercase() {
        'k' => Some(1),
        'm' => Some(2),
        'g' => Some(3),
        't' => Some(4),
        _ => None,
    }
}

fn scale(mut value: f64, base: f64, fixed: Option<usize>) -> (f64, usize) {
    if let Some(index) = fixed {
        return (value / base.powi(index as i32), index);
    }
    let mut index = 0;
    while value >= base && index < PREFIXES.len() - 1 {
        value /= base;
        index += 1;
    }
    (value, index)
}

// three significant digits, like iperf3
fn number(value: f64) -> String {
    if value < 9.995 {
        format!("{value:4.2}")
    } else if value < 99.95 {
        format!("{value:4.1}")
    } else {
        format!("{value:4.0}")
    }
}

/// Byte count with binary (1024-based) units.
pub fn format_bytes(bytes: u64) -> String {
    let (value, index) = scale(bytes as f64, 1024.0, None);
    format!("{} {}Bytes", number(value), PREFIXES[index])
}

/// Rate in the unit `format` selects: lower case picks bits with decimal
/// units, upper case bytes with binary units, anything else adapts in bits.
pub fn format_rate(bits_per_second: f64, format: Option<char>) -> String {
    match format {
        Some(unit) if unit.is_ascii_uppercase() => {
            let (value, index) = scale(bits_per_second / 8.0, 1024.0, prefix_index(unit));
            format!("{} {}Bytes/sec", number(value), PREFIXES[index])
        }
        unit => {
            let (value, index) = scale(bits_per_second, 1000.0, unit.and_then(prefix_index));
            format!("{} {}bits/sec", number(value), PREFIXES[index])
        }
    }
}

/// Emits human-readable progress and results to a writer.
pub struct HumanReadableEmitter<W: Write> {
    out: W,
    format: Option<char>,
    header_printed: bool,
}

impl<W: Write> HumanReadableEmitter<W> {
    /// Create a new emitter writing to `out`, with rates in the unit
    /// `format` selects.
    pub fn new(out: W, format: Option<char>) -> Self {
        HumanReadableEmitter {
            out,
            format,
            header_printed: false,
        }
    }

    fn line(&mut self, label: &str, start: f64, end: f64, bytes: u64, bps: f64) -> Result<()> {
        write!(
            self.out,
            "[{label:>3}] {start:>6.2}-{end:<6.2} sec  {}  {}",
            format_bytes(bytes),
            format_rate(bps, self.format)
        )?;
        Ok(())
    }

    fn stream_line(&mut self, s: &StreamInterval) -> Result<()> {
        self.line(&s.id.to_string(), s.start, s.end, s.bytes, s.bits_per_second)?;
        writeln!(self.out)?;
        Ok(())
    }

    fn totals_line(
        &mut self,
        label: &str,
        t: &SideTotals,
        udp: Option<&UdpTotals>,
        role: &str,
    ) -> Result<()> {
        self.line(label, t.start, t.end, t.bytes, t.bits_per_second)?;
        if let Some(udp) = udp {
            write!(
                self.out,
                "  {:6.3} ms  {}/{} ({:.2}%)",
                udp.jitter_ms, udp.lost, udp.packets, udp.lost_percent
            )?;
        } else if let Some(retransmits) = t.retransmits {
            write!(self.out, "  {retransmits:>4}")?;
        }
        writeln!(self.out, "  {role}")?;
        Ok(())
    }
}

impl<W: Write> Emitter for HumanReadableEmitter<W> {
    fn on_listening(&mut self, addr: SocketAddr) -> Result<()> {
        writeln!(self.out, "-----------------------------------------------------------")?;
        writeln!(self.out, "Server listening on {}", addr.port())?;
        writeln!(self.out, "-----------------------------------------------------------")?;
        Ok(())
    }

    fn on_starting(&mut self, _cookie: &str, server: &str, port: u16) -> Result<()> {
        writeln!(self.out, "Connecting to host {server}, port {port}")?;
        Ok(())
    }

    fn on_interval(&mut self, _cookie: &str, report: &IntervalReport) -> Result<()> {
        if !self.header_printed {
            writeln!(self.out, "[ ID] Interval           Transfer     Bitrate")?;
            self.header_printed = true;
        }
        for stream in &report.streams {
            self.stream_line(stream)?;
        }
        if report.streams.len() > 1 {
            let sum = &report.sum;
            self.line("SUM", sum.start, sum.end, sum.bytes, sum.bits_per_second)?;
            writeln!(self.out)?;
        }
        self.out.flush()?;
        Ok(())
    }

    fn on_error(&mut self, _cookie: &str, err: &str) -> Result<()> {
        writeln!(self.out, "iperf3: error - {err}")?;
        Ok(())
    }

    fn on_summary(&mut self, s: &Summary) -> Result<()> {
        writeln!(self.out, "- - - - - - - - - - - - - - - - - - - - - - - - -")?;
        if s.udp.is_some() {
            writeln!(
                self.out,
                "[ ID] Interval           Transfer     Bitrate         Jitter    Lost/Total Datagrams"
            )?;
        } else {
            writeln!(self.out, "[ ID] Interval           Transfer     Bitrate         Retr")?;
        }

        for stream in &s.streams {
            let label = stream.id.to_string();
            if let Some(sender) = &stream.sender {
                self.totals_line(&label, sender, stream.udp.as_ref(), "sender")?;
            }
            if let Some(receiver) = &stream.receiver {
                self.totals_line(&label, receiver, stream.udp.as_ref(), "receiver")?;
            }
        }
        if s.streams.len() > 1 {
            if let Some(sender) = &s.sender {
                self.totals_line("SUM", sender, s.udp.as_ref(), "sender")?;
            }
            if let Some(receiver) = &s.receiver {
                self.totals_line("SUM", receiver, s.udp.as_ref(), "receiver")?;
            }
        }
        Ok(())
    }

    fn on_complete(&mut self, _cookie: &str) -> Result<()> {
        writeln!(self.out, "\niperf Done.")?;
        self.header_printed = false;
        Ok(())
    }
}

/// Emits one JSON object per line for each event.
pub struct JsonEmitter<W: Write> {
    out: W,
}

impl<W: Write> JsonEmitter<W> {
    /// Create a new JSON emitter writing to `out`.
    pub fn new(out: W) -> Self {
        JsonEmitter { out }
    }

    fn emit(&mut self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event)?;
        writeln!(self.out, "{}", json)?;
        Ok(())
    }
}

impl<W: Write> Emitter for JsonEmitter<W> {
    fn on_listening(&mut self, addr: SocketAddr) -> Result<()> {
        self.emit(&Event::Listening { addr })
    }

    fn on_starting(&mut self, cookie: &str, server: &str, port: u16) -> Result<()> {
        self.emit(&Event::Starting {
            cookie,
            server,
            port,
        })
    }

    fn on_interval(&mut self, cookie: &str, report: &IntervalReport) -> Result<()> {
        self.emit(&Event::Interval { cookie, report })
    }

    fn on_error(&mut self, cookie: &str, err: &str) -> Result<()> {
        self.emit(&Event::Error { cookie, error: err })
    }

    fn on_summary(&mut self, s: &Summary) -> Result<()> {
        self.emit(&Event::Summary { summary: s })
    }

    fn on_complete(&mut self, cookie: &str) -> Result<()> {
        self.emit(&Event::Complete { cookie })
    }
}
