//! The wire protocol shared by Controller and Worker.
//!
//! Every frame begins with a 4-byte little-endian `u32` giving the total
//! frame length, itself included, followed immediately by the frame body.
//! There are exactly two frame shapes, one per direction:
//!
//! ```text
//! client -> server (status):     <len:u32><worker_id:cstring><task_name:cstring><time_left:u32>
//! server -> client (assignment): <len:u32><task_name:cstring><sleep_time:u32>
//! ```
//!
//! `cstring` means NUL-terminated bytes with `strlen <= MAX_TASK_NAME_LEN - 1`.
//! An empty `task_name` (a lone NUL) means "idle, request a task" on a status
//! frame, or "exit" on an assignment frame.

use std::fmt;

/// Size in bytes of a `cstring` slot on the wire, NUL terminator included.
/// Printable content is therefore bounded to `MAX_TASK_NAME_LEN - 1` bytes.
pub const MAX_TASK_NAME_LEN: usize = 32;

/// Upper bound on a status frame's declared length prefix: the prefix
/// itself (4 bytes) plus two cstring slots plus a trailing `u32`. Bounding
/// the *declared* length rather than the body keeps a maximally-sized
/// legitimate frame (two 31-byte names) from being rejected — see
/// DESIGN.md for why this is 4 bytes larger than a literal reading of the
/// spec's `2 * MAX_TASK_NAME_LEN + sizeof(u32)` formula.
pub const MAX_CLIENT_MSG_LEN: u32 = (4 + MAX_TASK_NAME_LEN * 2 + 4) as u32;

/// Upper bound on an assignment frame's declared length prefix: the prefix
/// itself plus one cstring slot plus a trailing `u32`.
pub const MAX_SERVER_MSG_LEN: u32 = (4 + MAX_TASK_NAME_LEN + 4) as u32;

/// Size of the length prefix itself.
pub const LEN_PREFIX_SIZE: usize = 4;

/// A decode failure: the frame is malformed or violates a size bound.
/// Carries no connection/task state — a `ProtocolError` only ever leads to
/// closing the offending connection (see §7).
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ProtocolError {
    /// The declared frame length exceeds the bound for its direction.
    TooLong { declared: u32, max: u32 },
    /// A cstring field ran past the frame boundary without a NUL byte.
    UnterminatedString,
    /// Bytes remained after the frame's trailing fixed-size field.
    TrailingBytes,
    /// The frame body ended before a required fixed-size field was read.
    Eof,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::TooLong { declared, max } => {
                write!(f, "frame length {} exceeds maximum {}", declared, max)
            }
            ProtocolError::UnterminatedString => write!(f, "cstring missing NUL terminator"),
            ProtocolError::TrailingBytes => write!(f, "trailing bytes after frame body"),
            ProtocolError::Eof => write!(f, "frame body too short"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// A worker's report of its current status: either an idle handshake
/// (`task_name` empty, `time_left == 0`), a completion (`task_name` set,
/// `time_left == 0`), or a reconnect mid-task (`task_name` set,
/// `time_left > 0`).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct StatusFrame {
    pub worker_id: String,
    pub task_name: String,
    pub time_left: u32,
}

/// The Controller's reply: either a task assignment (`task_name` set) or
/// an exit signal (`task_name` empty).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AssignmentFrame {
    pub task_name: String,
    pub sleep_time: u32,
}

impl AssignmentFrame {
    /// Builds the "exit" assignment frame: empty task name, arbitrary sleep time.
    pub fn exit() -> AssignmentFrame {
        AssignmentFrame {
            task_name: String::new(),
            sleep_time: 0,
        }
    }

    pub fn is_exit(&self) -> bool {
        self.task_name.is_empty()
    }
}

/// Encodes `worker_id` and `task_name` as NUL-terminated cstrings followed
/// by `time_left`, with the length prefix computed up front, into a single
/// contiguous buffer.
pub fn encode_status_frame(frame: &StatusFrame) -> Vec<u8> {
    let body_len = frame.worker_id.len() + 1 + frame.task_name.len() + 1 + 4;
    let total_len = LEN_PREFIX_SIZE + body_len;

    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(&(total_len as u32).to_le_bytes());
    buf.extend_from_slice(frame.worker_id.as_bytes());
    buf.push(0);
    buf.extend_from_slice(frame.task_name.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&frame.time_left.to_le_bytes());
    buf
}

/// Encodes `task_name` as a NUL-terminated cstring followed by `sleep_time`.
pub fn encode_assignment_frame(frame: &AssignmentFrame) -> Vec<u8> {
    let body_len = frame.task_name.len() + 1 + 4;
    let total_len = LEN_PREFIX_SIZE + body_len;

    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(&(total_len as u32).to_le_bytes());
    buf.extend_from_slice(frame.task_name.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&frame.sleep_time.to_le_bytes());
    buf
}

/// Reads one NUL-terminated cstring off the front of `body`, advancing
/// `body` past the terminator. Rejects strings with no NUL before the end.
fn take_cstring<'a>(body: &mut &'a [u8]) -> Result<&'a str, ProtocolError> {
    let nul_pos = body
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::UnterminatedString)?;
    let (raw, rest) = body.split_at(nul_pos);
    let s = std::str::from_utf8(raw).map_err(|_| ProtocolError::UnterminatedString)?;
    *body = &rest[1..]; // skip the NUL itself
    Ok(s)
}

fn take_u32(body: &mut &[u8]) -> Result<u32, ProtocolError> {
    if body.len() < 4 {
        return Err(ProtocolError::Eof);
    }
    let (raw, rest) = body.split_at(4);
    *body = rest;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Decodes a status frame body (everything after the length prefix).
/// `declared_len` is the value read from the length prefix, already
/// bounds-checked by the caller against [`MAX_CLIENT_MSG_LEN`].
pub fn decode_status_frame(body: &[u8]) -> Result<StatusFrame, ProtocolError> {
    let mut cursor = body;
    let worker_id = take_cstring(&mut cursor)?.to_owned();
    let task_name = take_cstring(&mut cursor)?.to_owned();
    let time_left = take_u32(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(ProtocolError::TrailingBytes);
    }
    Ok(StatusFrame {
        worker_id,
        task_name,
        time_left,
    })
}

/// Decodes an assignment frame body (everything after the length prefix).
pub fn decode_assignment_frame(body: &[u8]) -> Result<AssignmentFrame, ProtocolError> {
    let mut cursor = body;
    let task_name = take_cstring(&mut cursor)?.to_owned();
    let sleep_time = take_u32(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(ProtocolError::TrailingBytes);
    }
    Ok(AssignmentFrame {
        task_name,
        sleep_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_frame_round_trips() {
        let frame = StatusFrame {
            worker_id: "W1".into(),
            task_name: "T1".into(),
            time_left: 42,
        };
        let encoded = encode_status_frame(&frame);
        assert!(encoded.len() as u32 <= MAX_CLIENT_MSG_LEN);
        let len = u32::from_le_bytes(encoded[0..4].try_into().unwrap());
        assert_eq!(len as usize, encoded.len());
        let decoded = decode_status_frame(&encoded[4..]).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn assignment_frame_round_trips() {
        let frame = AssignmentFrame {
            task_name: "T1".into(),
            sleep_time: 30,
        };
        let encoded = encode_assignment_frame(&frame);
        assert!(encoded.len() as u32 <= MAX_SERVER_MSG_LEN);
        let decoded = decode_assignment_frame(&encoded[4..]).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn exit_frame_is_empty_name() {
        let frame = AssignmentFrame::exit();
        assert!(frame.is_exit());
        let encoded = encode_assignment_frame(&frame);
        let decoded = decode_assignment_frame(&encoded[4..]).unwrap();
        assert!(decoded.is_exit());
    }

    #[test]
    fn idle_handshake_is_empty_name_zero_time_left() {
        let frame = StatusFrame {
            worker_id: "W1".into(),
            task_name: String::new(),
            time_left: 0,
        };
        let encoded = encode_status_frame(&frame);
        let decoded = decode_status_frame(&encoded[4..]).unwrap();
        assert_eq!(decoded.task_name, "");
        assert_eq!(decoded.time_left, 0);
    }

    #[test]
    fn max_length_names_fit_within_bound() {
        let name31 = "a".repeat(31);
        let frame = StatusFrame {
            worker_id: name31.clone(),
            task_name: name31,
            time_left: u32::MAX,
        };
        let encoded = encode_status_frame(&frame);
        assert!(encoded.len() as u32 <= MAX_CLIENT_MSG_LEN);
    }

    #[test]
    fn missing_nul_terminator_is_rejected() {
        let body = vec![b'a', b'b', b'c'];
        assert_eq!(
            decode_status_frame(&body),
            Err(ProtocolError::UnterminatedString)
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut body = Vec::new();
        body.push(0); // empty worker_id
        body.push(0); // empty task_name
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(0xFF); // trailing garbage
        assert_eq!(decode_status_frame(&body), Err(ProtocolError::TrailingBytes));
    }

    #[test]
    fn short_trailing_u32_is_rejected() {
        let mut body = Vec::new();
        body.push(0);
        body.push(0);
        body.extend_from_slice(&[1, 2]); // only 2 of 4 bytes
        assert_eq!(decode_status_frame(&body), Err(ProtocolError::Eof));
    }
}
