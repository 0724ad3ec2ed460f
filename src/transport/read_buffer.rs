//! Newline-delimited message framer
//!
//! Byte-stream transports cannot guarantee message-aligned delivery, so
//! inbound bytes accumulate here until a full `\n`-terminated line is
//! available. Each line holds exactly one JSON-RPC message; empty lines are
//! skipped rather than rejected.

use crate::error::Result;
use crate::protocol::messages::{deserialize_message, JsonRpcMessage};

/// Stateful line framer over an append-only byte accumulator
///
/// Exclusively owned by one transport's read task; never shared.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    buffer: Vec<u8>,
}

impl ReadBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the wire.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Extract and decode at most one complete message.
    ///
    /// Returns `Ok(None)` when no newline-terminated line is buffered yet.
    /// Call repeatedly until it returns `Ok(None)`: a single `append` may
    /// have delivered many messages. A line that fails to decode yields an
    /// error, but the buffer has already advanced past it, so framing
    /// continues with the next line.
    pub fn read_message(&mut self) -> Result<Option<JsonRpcMessage>> {
        loop {
            let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };

            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop(); // the newline itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if line.is_empty() {
                continue;
            }

            let text = String::from_utf8_lossy(&line);
            return deserialize_message(&text).map(Some);
        }
    }

    /// Discard everything buffered. Called when the transport closes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::serialize_message;

    fn test_message() -> JsonRpcMessage {
        JsonRpcMessage::notification("foobar", None)
    }

    #[test]
    fn test_empty_after_initialization() {
        let mut buffer = ReadBuffer::new();
        assert!(buffer.read_message().unwrap().is_none());
    }

    #[test]
    fn test_only_yields_message_after_newline() {
        let mut buffer = ReadBuffer::new();

        let encoded = serialize_message(&test_message()).unwrap();
        buffer.append(encoded.as_bytes());
        assert!(buffer.read_message().unwrap().is_none());

        buffer.append(b"\n");
        assert_eq!(buffer.read_message().unwrap(), Some(test_message()));
        assert!(buffer.read_message().unwrap().is_none());
    }

    #[test]
    fn test_skips_empty_line() {
        let mut buffer = ReadBuffer::new();
        buffer.append(b"\n");
        assert!(buffer.read_message().unwrap().is_none());
    }

    #[test]
    fn test_many_messages_in_one_append() {
        let mut buffer = ReadBuffer::new();

        let mut wire = String::new();
        for method in ["one", "two", "three"] {
            wire.push_str(
                &serialize_message(&JsonRpcMessage::notification(method, None)).unwrap(),
            );
            wire.push('\n');
        }
        buffer.append(wire.as_bytes());

        for method in ["one", "two", "three"] {
            match buffer.read_message().unwrap() {
                Some(JsonRpcMessage::Notification(n)) => assert_eq!(n.method, method),
                other => panic!("expected notification {method}, got {:?}", other),
            }
        }
        assert!(buffer.read_message().unwrap().is_none());
    }

    #[test]
    fn test_message_split_across_appends() {
        let mut buffer = ReadBuffer::new();

        let encoded = serialize_message(&test_message()).unwrap();
        let bytes = encoded.as_bytes();
        let (left, right) = bytes.split_at(bytes.len() / 2);

        buffer.append(left);
        assert!(buffer.read_message().unwrap().is_none());
        buffer.append(right);
        assert!(buffer.read_message().unwrap().is_none());
        buffer.append(b"\n");
        assert_eq!(buffer.read_message().unwrap(), Some(test_message()));
    }

    #[test]
    fn test_crlf_terminated_line() {
        let mut buffer = ReadBuffer::new();
        let encoded = serialize_message(&test_message()).unwrap();
        buffer.append(encoded.as_bytes());
        buffer.append(b"\r\n");
        assert_eq!(buffer.read_message().unwrap(), Some(test_message()));
    }

    #[test]
    fn test_malformed_line_does_not_stall_framing() {
        let mut buffer = ReadBuffer::new();
        buffer.append(b"{not json}\n");
        let encoded = serialize_message(&test_message()).unwrap();
        buffer.append(encoded.as_bytes());
        buffer.append(b"\n");

        assert!(buffer.read_message().is_err());
        // The bad line is consumed; the next call sees the valid message.
        assert_eq!(buffer.read_message().unwrap(), Some(test_message()));
    }

    #[test]
    fn test_reusable_after_clearing() {
        let mut buffer = ReadBuffer::new();

        buffer.append(b"foobar");
        buffer.clear();
        assert!(buffer.read_message().unwrap().is_none());

        let encoded = serialize_message(&test_message()).unwrap();
        buffer.append(encoded.as_bytes());
        buffer.append(b"\n");
        assert_eq!(buffer.read_message().unwrap(), Some(test_message()));
    }
}
