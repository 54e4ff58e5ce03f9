use serde::Serialize;

use crate::protocol::{ExchangeResults, StreamResults};
use crate::session::TestOutcome;
use crate::settings::Transport;
use crate::stats::bits_per_second;

/// What one end of a stream moved over the whole test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideTotals {
    pub start: f64,
    pub end: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    /// Sender-side TCP retransmits, when the sender could count them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retransmits: Option<i64>,
}

/// UDP loss and jitter as seen by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UdpTotals {
    pub jitter_ms: f64,
    pub lost: i64,
    pub packets: u64,
    pub lost_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub id: u32,
    pub sender: Option<SideTotals>,
    pub receiver: Option<SideTotals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpTotals>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub cookie: String,
    pub transport: Transport,
    pub streams: Vec<StreamSummary>,
    pub sender: Option<SideTotals>,
    pub receiver: Option<SideTotals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpTotals>,
}

fn side(r: &StreamResults, sender: bool) -> SideTotals {
    let seconds = r.end_time - r.start_time;
    SideTotals {
        start: r.start_time,
        end: r.end_time,
        bytes: r.bytes,
        bits_per_second: bits_per_second(r.bytes, seconds),
        retransmits: (sender && r.retransmits >= 0).then_some(r.retransmits),
    }
}

fn udp(sent: Option<&StreamResults>, received: Option<&StreamResults>) -> Option<UdpTotals> {
    let received = received?;
    // the sender knows how many datagrams went out; fall back to what arrived
    let packets = sent.map_or(received.packets, |s| s.packets);
    Some(UdpTotals {
        jitter_ms: received.jitter * 1000.0,
        lost: received.errors,
        packets,
        lost_percent: percent(received.errors, packets),
    })
}

fn percent(lost: i64, packets: u64) -> f64 {
    if packets == 0 {
        0.0
    } else {
        100.0 * lost as f64 / packets as f64
    }
}

fn sum<'a>(sides: impl Iterator<Item = &'a SideTotals>) -> Option<SideTotals> {
    sides.fold(None, |acc: Option<SideTotals>, s| {
        Some(match acc {
            None => s.clone(),
            Some(acc) => SideTotals {
                start: acc.start.min(s.start),
                end: acc.end.max(s.end),
                bytes: acc.bytes + s.bytes,
                bits_per_second: acc.bits_per_second + s.bits_per_second,
                retransmits: match (acc.retransmits, s.retransmits) {
                    (Some(a), Some(b)) => Some(a + b),
                    (a, b) => a.or(b),
                },
            },
        })
    })
}

impl Summary {
    /// Pair up both ends' results stream by stream.
    pub fn from_outcome(outcome: &TestOutcome) -> Self {
        let empty = ExchangeResults::default();
        let remote = outcome.remote.as_ref().unwrap_or(&empty);
        let (sent, received) = if outcome.sender {
            (&outcome.local, remote)
        } else {
            (remote, &outcome.local)
        };

        let mut ids: Vec<u32> = sent
            .streams
            .iter()
            .chain(&received.streams)
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let streams: Vec<StreamSummary> = ids
            .into_iter()
            .map(|id| {
                let s = sent.streams.iter().find(|s| s.id == id);
                let r = received.streams.iter().find(|s| s.id == id);
                StreamSummary {
                    id,
                    sender: s.map(|s| side(s, true)),
                    receiver: r.map(|r| side(r, false)),
                    udp: match outcome.transport {
                        Transport::Udp => udp(s, r),
                        Transport::Tcp => None,
                    },
                }
            })
            .collect();

        let udp = match outcome.transport {
            Transport::Udp => {
                let totals: Vec<&UdpTotals> = streams.iter().filter_map(|s| s.udp.as_ref()).collect();
                (!totals.is_empty()).then(|| {
                    let lost = totals.iter().map(|t| t.lost).sum();
                    let packets = totals.iter().map(|t| t.packets).sum();
                    UdpTotals {
                        jitter_ms: totals.iter().map(|t| t.jitter_ms).sum::<f64>() / totals.len() as f64,
                        lost,
                        packets,
                        lost_percent: percent(lost, packets),
                    }
                })
            }
            Transport::Tcp => None,
        };

        Summary {
            cookie: outcome.cookie.clone(),
            transport: outcome.transport,
            sender: sum(streams.iter().filter_map(|s| s.sender.as_ref())),
            receiver: sum(streams.iter().filter_map(|s| s.receiver.as_ref())),
            streams,
            udp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Role;

    fn results(streams: Vec<StreamResults>) -> ExchangeResults {
        ExchangeResults {
            streams,
            ..Default::default()
        }
    }

    fn stream(id: u32, bytes: u64) -> StreamResults {
        StreamResults {
            id,
            bytes,
            retransmits: -1,
            start_time: 0.0,
            end_time: 2.0,
            ..Default::default()
        }
    }

    fn outcome(transport: Transport, sender: bool, local: ExchangeResults, remote: Option<ExchangeResults>) -> TestOutcome {
        TestOutcome {
            cookie: "c".into(),
            role: Role::Client,
            transport,
            sender,
            local,
            remote,
            intervals: Vec::new(),
        }
    }

    #[test]
    fn tcp_sender_and_receiver_totals() {
        let o = outcome(
            Transport::Tcp,
            true,
            results(vec![stream(1, 2_000_000), stream(3, 1_000_000)]),
            Some(results(vec![stream(1, 1_900_000), stream(3, 1_000_000)])),
        );
        let s = Summary::from_outcome(&o);

        assert_eq!(s.streams.len(), 2);
        assert_eq!(s.streams[0].sender.as_ref().unwrap().bytes, 2_000_000);
        assert_eq!(s.streams[0].receiver.as_ref().unwrap().bytes, 1_900_000);
        assert_eq!(s.streams[0].sender.as_ref().unwrap().retransmits, None);

        let sender = s.sender.unwrap();
        assert_eq!(sender.bytes, 3_000_000);
        assert_eq!(sender.bits_per_second, 12_000_000.0);
        assert_eq!(s.receiver.unwrap().bytes, 2_900_000);
        assert!(s.udp.is_none());
    }

    #[test]
    fn reverse_udp_takes_loss_from_local_receiver() {
        let sent = StreamResults {
            packets: 200,
            ..stream(1, 200_000)
        };
        let received = StreamResults {
            packets: 190,
            errors: 10,
            jitter: 0.0005,
            ..stream(1, 190_000)
        };
        let o = outcome(Transport::Udp, false, results(vec![received]), Some(results(vec![sent])));
        let s = Summary::from_outcome(&o);

        let udp = s.udp.unwrap();
        assert_eq!(udp.lost, 10);
        assert_eq!(udp.packets, 200);
        assert_eq!(udp.lost_percent, 5.0);
        assert!((udp.jitter_ms - 0.5).abs() < 1e-9);
        assert_eq!(s.sender.unwrap().bytes, 200_000);
    }

    #[test]
    fn missing_remote_leaves_one_side() {
        let o = outcome(Transport::Tcp, true, results(vec![stream(1, 10)]), None);
        let s = Summary::from_outcome(&o);
        assert!(s.sender.is_some());
        assert!(s.receiver.is_none());
    }
}
