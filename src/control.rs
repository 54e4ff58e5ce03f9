//! Control channel framing.
//!
//! The control connection carries three kinds of payload: the cookie, single
//! byte op-codes (at most two of which may arrive coalesced in one read) and
//! JSON blobs framed as `[i32 big-endian length][JSON bytes]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Iperf3Error, Result};
use crate::params;
use crate::protocol::State;

/// Owning write side of a control connection.
pub type ControlWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Owning read side of a control connection.
pub type ControlSource = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// The op-codes carried by one control message. One or two codes are valid,
/// anything longer is a protocol violation.
pub fn op_codes(message: &[u8]) -> Result<&[u8]> {
    match message.len() {
        1 | 2 => Ok(message),
        n => Err(Iperf3Error::Protocol(format!(
            "expected one or two op-codes, got {n} bytes"
        ))),
    }
}

/// Serialize `value` and frame it with its big-endian length.
pub fn encode_json<T: Serialize>(value: &T) -> Result<Bytes> {
    let json = serde_json::to_vec(value)?;
    let len = i32::try_from(json.len())
        .map_err(|_| Iperf3Error::Protocol(format!("JSON blob too large: {}", json.len())))?;
    let mut frame = BytesMut::with_capacity(4 + json.len());
    frame.put_i32(len);
    frame.put_slice(&json);
    Ok(frame.freeze())
}

/// Outcome of feeding bytes to a [`StringDrain`].
#[derive(Debug, PartialEq, Eq)]
pub enum Drained {
    /// More bytes are needed.
    Pending,
    /// The string is complete. `rest` holds bytes that followed it and belong
    /// to the next control message.
    Complete { string: String, rest: Bytes },
}

/// Reassembles a length-prefixed string from arbitrarily fragmented reads.
#[derive(Debug, Default)]
pub struct StringDrain {
    length: Option<usize>,
    buffer: BytesMut,
}

impl StringDrain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `data` to the buffer and return the string once it is complete.
    /// The drain resets itself after completing.
    pub fn feed(&mut self, data: &[u8]) -> Result<Drained> {
        self.buffer.extend_from_slice(data);

        let length = match self.length {
            Some(length) => length,
            None => {
                if self.buffer.len() < 4 {
                    return Ok(Drained::Pending);
                }
                let length = self.buffer.get_u32() as usize;
                if length > params::MAX_JSON_SIZE {
                    return Err(Iperf3Error::Protocol(format!(
                        "length-prefixed string too large: {length} bytes"
                    )));
                }
                self.length = Some(length);
                length
            }
        };

        if self.buffer.len() < length {
            return Ok(Drained::Pending);
        }

        let string = self.buffer.split_to(length);
        let rest = std::mem::take(&mut self.buffer).freeze();
        self.length = None;

        let string = String::from_utf8(string.to_vec())
            .map_err(|e| Iperf3Error::Protocol(format!("string is not UTF-8: {e}")))?;
        debug!(len = length, "string draining done");
        Ok(Drained::Complete { string, rest })
    }
}

/// Write side of the control connection.
pub struct ControlProtocol {
    writer: ControlWriter,
    closed: bool,
}

impl ControlProtocol {
    pub fn new(writer: ControlWriter) -> Self {
        ControlProtocol {
            writer,
            closed: false,
        }
    }

    /// Send raw bytes.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        debug!(len = data.len(), "control TX {:02x?}", &data[..data.len().min(16)]);
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send a single op-code.
    pub async fn send_state(&mut self, state: State) -> Result<()> {
        self.send_data(&[state.to_byte()]).await
    }

    /// Send a length-prefixed JSON blob.
    pub async fn send_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let frame = encode_json(value)?;
        self.send_data(&frame).await
    }

    /// Shut the connection down. Further close calls are no-ops.
    pub async fn close_connection(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        debug!("closing control connection");
        self.closed = true;
        self.writer.shutdown().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Read side of the control connection; yields whatever each read returns.
pub struct ControlReader {
    source: ControlSource,
    buf: BytesMut,
}

impl ControlReader {
    pub fn new(source: ControlSource) -> Self {
        ControlReader {
            source,
            buf: BytesMut::with_capacity(params::READ_BUFFER_SIZE),
        }
    }

    /// Next chunk from the peer, `None` on EOF.
    pub async fn next_message(&mut self) -> Result<Option<Bytes>> {
        self.buf.reserve(params::READ_BUFFER_SIZE);
        let n = self.source.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let message = self.buf.split().freeze();
        debug!(len = n, "control RX {:02x?}", &message[..n.min(16)]);
        Ok(Some(message))
    }
}

/// Split a connected control socket into its read and write sides.
pub fn split(stream: TcpStream) -> (ControlReader, ControlProtocol) {
    let (read, write) = stream.into_split();
    (
        ControlReader::new(Box::new(read)),
        ControlProtocol::new(Box::new(write)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: &str) -> Vec<u8> {
        let mut v = (s.len() as u32).to_be_bytes().to_vec();
        v.extend_from_slice(s.as_bytes());
        v
    }

    #[test]
    fn one_or_two_op_codes() {
        assert_eq!(op_codes(&[13]).unwrap(), &[13]);
        assert_eq!(op_codes(&[1, 2]).unwrap(), &[1, 2]);
        assert!(matches!(
            op_codes(&[1, 2, 14]),
            Err(Iperf3Error::Protocol(_))
        ));
        assert!(op_codes(&[]).is_err());
    }

    #[test]
    fn json_frame_is_length_prefixed() {
        let frame = encode_json(&serde_json::json!({"time": 10})).unwrap();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(&frame[4..], br#"{"time":10}"#);
    }

    #[test]
    fn drain_reassembles_single_byte_fragments() {
        let json = r#"{"streams":[{"id":1,"bytes":12345}]}"#;
        let wire = frame(json);
        let mut drain = StringDrain::new();

        for b in &wire[..wire.len() - 1] {
            assert_eq!(drain.feed(std::slice::from_ref(b)).unwrap(), Drained::Pending);
        }
        let done = drain.feed(&wire[wire.len() - 1..]).unwrap();
        assert_eq!(
            done,
            Drained::Complete {
                string: json.to_string(),
                rest: Bytes::new()
            }
        );
    }

    #[test]
    fn drain_returns_trailing_bytes() {
        let mut wire = frame("{}");
        wire.push(State::DisplayResults.to_byte());

        let mut drain = StringDrain::new();
        assert_eq!(drain.feed(&wire[..3]).unwrap(), Drained::Pending);
        match drain.feed(&wire[3..]).unwrap() {
            Drained::Complete { string, rest } => {
                assert_eq!(string, "{}");
                assert_eq!(&rest[..], &[State::DisplayResults.to_byte()]);
            }
            Drained::Pending => panic!("string should be complete"),
        }

        // the drain is reusable after completing
        assert_eq!(drain.feed(&frame("[]")).unwrap(), Drained::Complete {
            string: "[]".into(),
            rest: Bytes::new()
        });
    }

    #[test]
    fn drain_rejects_oversized_length() {
        let mut drain = StringDrain::new();
        let len = (params::MAX_JSON_SIZE as u32 + 1).to_be_bytes();
        assert!(drain.feed(&len).is_err());
    }

    #[tokio::test]
    async fn control_protocol_writes_frames() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut control = ControlProtocol::new(Box::new(client));

        control.send_state(State::TestEnd).await.unwrap();
        control.send_json(&serde_json::json!([])).await.unwrap();
        control.close_connection().await.unwrap();
        control.close_connection().await.unwrap();
        assert!(control.is_closed());

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, [4, 0, 0, 0, 2, b'[', b']']);
    }
}
