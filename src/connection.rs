//! Buffered frame I/O over a `TcpStream`.
//!
//! Send/receive [`crate::codec::StatusFrame`]/[`crate::codec::AssignmentFrame`]
//! values to and from a remote peer. `Connection` accumulates bytes read off
//! the socket into an internal buffer until a complete, length-prefixed frame
//! is available, then hands back one parsed frame per call — the same shape
//! as the teacher's own `read_frame`/`write_frame`, generalized from a single
//! bidirectional `Frame` type to this protocol's two directional frame types.
//!
//! This is also where §9's invited upgrade happens: the original reference
//! implementation issues one blocking `read()` per field and treats a short
//! read as a protocol error. Accumulating into a buffer first means a frame
//! split across TCP segments is reassembled transparently instead of being
//! rejected.

use crate::codec::{
    self, AssignmentFrame, ProtocolError, StatusFrame, LEN_PREFIX_SIZE, MAX_CLIENT_MSG_LEN,
    MAX_SERVER_MSG_LEN,
};

use bytes::BytesMut;
use std::fmt;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

/// Either the frame was malformed ([`ProtocolError`]) or the socket itself
/// failed. Both are reported up so the caller can apply §7's policy (close
/// the connection either way; never mutate task state on a protocol error).
#[derive(Debug)]
pub enum ConnectionError {
    Protocol(ProtocolError),
    Io(io::Error),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Protocol(e) => write!(f, "{}", e),
            ConnectionError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// A length-prefixed-frame connection to a remote peer.
///
/// Both the Controller and the Worker use this same type: the Controller
/// reads [`StatusFrame`]s and writes [`AssignmentFrame`]s, the Worker does
/// the reverse.
pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl Connection {
    /// Wraps `socket`, allocating the read buffer at a size comfortably
    /// larger than the largest frame either direction can produce.
    pub fn new(socket: TcpStream) -> Connection {
        Connection {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Reads one status frame (worker -> controller). Returns `Ok(None)` on
    /// a clean peer shutdown with no partial frame buffered.
    pub async fn read_status_frame(&mut self) -> Result<Option<StatusFrame>, ConnectionError> {
        self.read_frame(MAX_CLIENT_MSG_LEN, codec::decode_status_frame)
            .await
    }

    /// Reads one assignment frame (controller -> worker). Returns `Ok(None)`
    /// on a clean peer shutdown with no partial frame buffered.
    pub async fn read_assignment_frame(
        &mut self,
    ) -> Result<Option<AssignmentFrame>, ConnectionError> {
        self.read_frame(MAX_SERVER_MSG_LEN, codec::decode_assignment_frame)
            .await
    }

    /// Writes one status frame and flushes it immediately: per §5, a write
    /// is always a one-shot operation following its triggering read, never
    /// a suspending, partially-buffered one.
    pub async fn write_status_frame(&mut self, frame: &StatusFrame) -> io::Result<()> {
        let buf = codec::encode_status_frame(frame);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await
    }

    /// Writes one assignment frame and flushes it immediately.
    pub async fn write_assignment_frame(&mut self, frame: &AssignmentFrame) -> io::Result<()> {
        let buf = codec::encode_assignment_frame(frame);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await
    }

    async fn read_frame<T>(
        &mut self,
        max_len: u32,
        decode: fn(&[u8]) -> Result<T, ProtocolError>,
    ) -> Result<Option<T>, ConnectionError> {
        loop {
            if let Some(frame) = self.try_parse_frame(max_len, decode)? {
                return Ok(Some(frame));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                // The peer closed the socket. A frame still sitting half
                // assembled in the buffer means the peer hung up mid-frame,
                // which is a protocol error; an empty buffer is a clean
                // disconnect.
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(ProtocolError::Eof.into())
                };
            }
        }
    }

    fn try_parse_frame<T>(
        &mut self,
        max_len: u32,
        decode: fn(&[u8]) -> Result<T, ProtocolError>,
    ) -> Result<Option<T>, ConnectionError> {
        if self.buffer.len() < LEN_PREFIX_SIZE {
            return Ok(None);
        }

        let declared = u32::from_le_bytes(self.buffer[0..LEN_PREFIX_SIZE].try_into().unwrap());
        if declared > max_len || (declared as usize) < LEN_PREFIX_SIZE {
            return Err(ProtocolError::TooLong {
                declared,
                max: max_len,
            }
            .into());
        }

        let total_len = declared as usize;
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let frame_bytes = self.buffer.split_to(total_len);
        let body = &frame_bytes[LEN_PREFIX_SIZE..];
        Ok(Some(decode(body)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_status_frame;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Connection::new(client), Connection::new(server))
    }

    #[tokio::test]
    async fn round_trips_status_frame_over_a_real_socket() {
        let (mut worker_side, mut controller_side) = pair().await;
        let frame = StatusFrame {
            worker_id: "W1".into(),
            task_name: "T1".into(),
            time_left: 7,
        };
        worker_side.write_status_frame(&frame).await.unwrap();
        let got = controller_side
            .read_status_frame()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn round_trips_assignment_frame_over_a_real_socket() {
        let (mut worker_side, mut controller_side) = pair().await;
        let frame = AssignmentFrame {
            task_name: "T1".into(),
            sleep_time: 30,
        };
        controller_side
            .write_assignment_frame(&frame)
            .await
            .unwrap();
        let got = worker_side.read_assignment_frame().await.unwrap().unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn clean_disconnect_yields_none() {
        let (worker_side, mut controller_side) = pair().await;
        drop(worker_side);
        let got = controller_side.read_status_frame().await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_a_protocol_error() {
        let (mut worker_side, mut controller_side) = pair().await;
        // Claim a 10 MB frame.
        worker_side
            .stream
            .write_all(&(10 * 1024 * 1024u32).to_le_bytes())
            .await
            .unwrap();
        worker_side.stream.flush().await.unwrap();
        let err = controller_side.read_status_frame().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::TooLong { .. })
        ));
    }

    #[tokio::test]
    async fn reassembles_a_frame_split_across_writes() {
        let (mut worker_side, mut controller_side) = pair().await;
        let frame = StatusFrame {
            worker_id: "W1".into(),
            task_name: "T1".into(),
            time_left: 5,
        };
        let encoded = encode_status_frame(&frame);
        let (first, second) = encoded.split_at(encoded.len() / 2);
        worker_side.stream.write_all(first).await.unwrap();
        worker_side.stream.flush().await.unwrap();
        worker_side.stream.write_all(second).await.unwrap();
        worker_side.stream.flush().await.unwrap();
        let got = controller_side
            .read_status_frame()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, frame);
    }
}
