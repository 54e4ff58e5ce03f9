//! Per-stream counters and interval stats.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

use crate::protocol::{IntervalReport, IntervalSum, StreamInterval};

/// Byte and packet counters of one stream.
///
/// The interval counters are bumped by the stream's own send and receive
/// tasks and read-and-reset by the stats harvest, so each one is a single
/// atomic swapped to zero on harvest.
#[derive(Debug, Default)]
pub struct StreamCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    blocks_sent: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    total_bytes_sent: AtomicU64,
    total_bytes_received: AtomicU64,
    total_packets_sent: AtomicU64,
    total_packets_received: AtomicU64,
}

/// Counter values read out of [`StreamCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub blocks_sent: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl StreamCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one block written to the transport.
    pub fn record_sent(&self, bytes: usize, packets: u64) {
        let bytes = bytes as u64;
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.total_bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.blocks_sent.fetch_add(1, Ordering::Relaxed);
        self.packets_sent.fetch_add(packets, Ordering::Relaxed);
        self.total_packets_sent.fetch_add(packets, Ordering::Relaxed);
    }

    /// Account data read from the transport.
    pub fn record_received(&self, bytes: usize, packets: u64) {
        let bytes = bytes as u64;
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.total_bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.packets_received.fetch_add(packets, Ordering::Relaxed);
        self.total_packets_received
            .fetch_add(packets, Ordering::Relaxed);
    }

    /// Read and reset the interval counters.
    pub fn take_interval(&self) -> Counts {
        Counts {
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
            bytes_received: self.bytes_received.swap(0, Ordering::Relaxed),
            blocks_sent: self.blocks_sent.swap(0, Ordering::Relaxed),
            packets_sent: self.packets_sent.swap(0, Ordering::Relaxed),
            packets_received: self.packets_received.swap(0, Ordering::Relaxed),
        }
    }

    /// Totals since the stream was created. `blocks_sent` is not tracked
    /// cumulatively and reads as zero.
    pub fn totals(&self) -> Counts {
        Counts {
            bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.total_bytes_received.load(Ordering::Relaxed),
            blocks_sent: 0,
            packets_sent: self.total_packets_sent.load(Ordering::Relaxed),
            packets_received: self.total_packets_received.load(Ordering::Relaxed),
        }
    }
}

/// Bounds of one stats interval, in seconds since TEST_START.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalBounds {
    pub start: f64,
    pub end: f64,
    pub seconds: f64,
}

/// Tracks the previous harvest time so consecutive intervals line up.
#[derive(Debug, Clone)]
pub struct IntervalClock {
    started: Instant,
    last: Option<Instant>,
}

impl IntervalClock {
    pub fn new(started: Instant) -> Self {
        IntervalClock {
            started,
            last: None,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Close the current interval at `now` and open the next one.
    pub fn advance(&mut self, now: Instant) -> IntervalBounds {
        let start = match self.last {
            Some(last) => last.duration_since(self.started).as_secs_f64(),
            None => 0.0,
        };
        let end = now.duration_since(self.started).as_secs_f64();
        self.last = Some(now);
        IntervalBounds {
            start,
            end,
            seconds: end - start,
        }
    }
}

/// What one stream contributes to an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSample {
    pub id: u32,
    pub socket: i32,
    pub bytes: u64,
    pub retransmits: i64,
}

/// Throughput in bits per second, zero for an empty interval.
pub fn bits_per_second(bytes: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        bytes as f64 * 8.0 / seconds
    } else {
        0.0
    }
}

/// Build the interval record for `samples`, with a sum over all streams.
pub fn interval_report(bounds: IntervalBounds, samples: &[StreamSample]) -> IntervalReport {
    let streams: Vec<StreamInterval> = samples
        .iter()
        .map(|s| StreamInterval {
            id: s.id,
            socket: s.socket,
            start: bounds.start,
            end: bounds.end,
            seconds: bounds.seconds,
            bytes: s.bytes,
            bits_per_second: bits_per_second(s.bytes, bounds.seconds),
            retransmits: s.retransmits,
            omitted: false,
        })
        .collect();

    let sum = IntervalSum {
        start: bounds.start,
        end: bounds.end,
        seconds: bounds.seconds,
        bytes: streams.iter().map(|s| s.bytes).sum(),
        bits_per_second: streams.iter().map(|s| s.bits_per_second).sum(),
        retransmits: streams.iter().map(|s| s.retransmits).sum(),
        omitted: false,
    };

    IntervalReport { streams, sum }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn take_interval_resets() {
        let counters = StreamCounters::new();
        counters.record_sent(1000, 1);
        counters.record_sent(1000, 1);
        counters.record_received(10, 0);

        let first = counters.take_interval();
        assert_eq!(first.bytes_sent, 2000);
        assert_eq!(first.blocks_sent, 2);
        assert_eq!(first.packets_sent, 2);
        assert_eq!(first.bytes_received, 10);

        assert_eq!(counters.take_interval(), Counts::default());
        assert_eq!(counters.totals().bytes_sent, 2000);
    }

    #[test]
    fn intervals_are_contiguous() {
        let t0 = Instant::now();
        let mut clock = IntervalClock::new(t0);

        let first = clock.advance(t0 + Duration::from_millis(1000));
        assert_eq!(first.start, 0.0);
        assert!((first.end - 1.0).abs() < 1e-9);

        let second = clock.advance(t0 + Duration::from_millis(2500));
        assert_eq!(second.start, first.end);
        assert!((second.seconds - 1.5).abs() < 1e-9);
    }

    #[test]
    fn report_sums_streams() {
        let bounds = IntervalBounds {
            start: 1.0,
            end: 2.0,
            seconds: 1.0,
        };
        let samples = [
            StreamSample {
                id: 1,
                socket: 5,
                bytes: 1000,
                retransmits: 0,
            },
            StreamSample {
                id: 3,
                socket: 6,
                bytes: 3000,
                retransmits: 2,
            },
        ];

        let report = interval_report(bounds, &samples);
        assert_eq!(report.streams.len(), 2);
        assert_eq!(report.streams[1].bits_per_second, 24_000.0);
        assert_eq!(report.sum.bytes, 4000);
        assert_eq!(report.sum.bits_per_second, 32_000.0);
        assert_eq!(report.sum.retransmits, 2);
        assert_eq!(report.sum.start, 1.0);
    }

    #[test]
    fn zero_length_interval() {
        assert_eq!(bits_per_second(100, 0.0), 0.0);
    }
}
