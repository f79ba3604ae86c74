//! Streaming frame decoder and encoder for the LSP `Content-Length` header
//! protocol.
//!
//! Grounded in the teacher's line-based [`crate::read_msg_text`]/
//! [`crate::write_msg_text`] pair, generalized from a blocking
//! `BufRead`/`Write` reader into a `feed`-based state machine that never
//! blocks and can be driven with byte chunks of arbitrary size (the
//! [`tower-lsp`] codec in the reference corpus demonstrates the same
//! buffer-with-offset-compaction idiom against `bytes::BytesMut`).

use std::fmt;

use bytes::{Buf, BytesMut};

use crate::msg::Message;

/// The upper bound on `Content-Length` accepted by [`Codec`] unless
/// overridden. 100 MiB, per the spec.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 100 * 1024 * 1024;

/// A protocol-level framing error: malformed headers, a missing or
/// duplicate `Content-Length`, an oversized frame, or a body that fails to
/// parse as JSON.
///
/// Once returned by [`Codec::feed`], the codec is left in a terminal bad
/// state until [`Codec::reset`] is called.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolError(String);

impl ProtocolError {
    fn new(msg: impl Into<String>) -> Self {
        ProtocolError(msg.into())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    /// Accumulating header bytes, looking for the `\r\n\r\n` delimiter.
    ReadingHeaders,
    /// Headers parsed; waiting for `len` body bytes to arrive.
    ReadingBody { content_length: usize },
    /// A previous `feed` call hit a protocol error; refuses further input
    /// until [`Codec::reset`].
    Poisoned,
}

/// A streaming decoder/encoder for `Content-Length`-framed JSON-RPC
/// messages.
///
/// `Codec` owns a growable receive buffer. Callers push raw transport
/// bytes in via [`Codec::feed`], which may split headers, the blank-line
/// delimiter, or the body at any boundary — the codec preserves unparsed
/// bytes across calls and only ever emits whole messages.
pub struct Codec {
    buf: BytesMut,
    state: DecodeState,
    max_content_length: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTENT_LENGTH)
    }
}

impl Codec {
    /// Creates a codec that rejects any `Content-Length` larger than
    /// `max_content_length`.
    pub fn new(max_content_length: usize) -> Self {
        Codec {
            buf: BytesMut::new(),
            state: DecodeState::ReadingHeaders,
            max_content_length,
        }
    }

    /// Clears all buffered state, returning the decoder to its initial
    /// state. The next `feed` call starts decoding a fresh frame.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = DecodeState::ReadingHeaders;
    }

    /// Feeds a chunk of transport bytes into the decoder, returning every
    /// whole [`Message`] that became available.
    ///
    /// On a protocol error the codec is poisoned: this and all future
    /// calls to `feed` return the same error until [`Codec::reset`] is
    /// called.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Message>, ProtocolError> {
        if matches!(self.state, DecodeState::Poisoned) {
            return Err(ProtocolError::new(
                "decoder is poisoned by a prior protocol error; call reset() first",
            ));
        }

        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        loop {
            match self.try_decode_one() {
                Ok(Some(msg)) => out.push(msg),
                Ok(None) => break,
                Err(e) => {
                    self.state = DecodeState::Poisoned;
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    fn try_decode_one(&mut self) -> Result<Option<Message>, ProtocolError> {
        if let DecodeState::ReadingHeaders = self.state {
            let Some(content_length) = self.try_parse_headers()? else {
                return Ok(None);
            };
            self.state = DecodeState::ReadingBody { content_length };
        }

        let DecodeState::ReadingBody { content_length } = self.state else {
            unreachable!("headers always transition to ReadingBody");
        };

        if self.buf.len() < content_length {
            return Ok(None);
        }

        let body = self.buf.split_to(content_length);
        self.state = DecodeState::ReadingHeaders;

        let text = std::str::from_utf8(&body)
            .map_err(|e| ProtocolError::new(format!("body is not valid UTF-8: {e}")))?;
        log::trace!("< {text}");
        let msg: Message = serde_json::from_str(text)
            .map_err(|e| ProtocolError::new(format!("malformed JSON-RPC payload: {e}")))?;
        Ok(Some(msg))
    }

    /// Attempts to parse a complete header block from the front of the
    /// buffer. Returns `Ok(None)` if the header block isn't fully
    /// buffered yet, without consuming anything.
    fn try_parse_headers(&mut self) -> Result<Option<usize>, ProtocolError> {
        let Some(header_end) = find_subslice(&self.buf, b"\r\n\r\n") else {
            return Ok(None);
        };

        let header_block = &self.buf[..header_end];
        let mut content_length: Option<usize> = None;

        for line in header_block.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            let line = std::str::from_utf8(line)
                .map_err(|_| ProtocolError::new("header is not valid ASCII/UTF-8"))?;
            let mut parts = line.splitn(2, ':');
            let name = parts.next().unwrap_or_default();
            let value = parts
                .next()
                .ok_or_else(|| ProtocolError::new(format!("malformed header: {line:?}")))?
                .trim();

            if name.eq_ignore_ascii_case("content-length") {
                if content_length.is_some() {
                    return Err(ProtocolError::new("Duplicate Content-Length header"));
                }
                if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ProtocolError::new(format!(
                        "invalid Content-Length value: {value:?}"
                    )));
                }
                let len: usize = value
                    .parse()
                    .map_err(|_| ProtocolError::new(format!("invalid Content-Length value: {value:?}")))?;
                if len > self.max_content_length {
                    return Err(ProtocolError::new(format!(
                        "Content-Length {len} exceeds the maximum of {}",
                        self.max_content_length
                    )));
                }
                content_length = Some(len);
            }
            // Unknown headers (e.g. Content-Type) are tolerated and ignored.
        }

        let content_length =
            content_length.ok_or_else(|| ProtocolError::new("missing Content-Length header"))?;

        self.buf.advance(header_end + 4);
        Ok(Some(content_length))
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Encodes a [`Message`] to `Content-Length: N\r\n\r\n<json>` bytes, where
/// `N` is the UTF-8 byte length of the minified JSON body (not its
/// character count — messages routinely contain non-ASCII content).
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let body = serde_json::to_string(msg).expect("Message serialization cannot fail");
    log::trace!("> {body}");
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{Notification, Request, RequestId};

    fn ping_request() -> Message {
        Message::Request(Request {
            id: RequestId::from(7),
            method: "ping".into(),
            params: None,
        })
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let msg = ping_request();
        let bytes = encode_message(&msg);
        let mut codec = Codec::default();
        let mut out = codec.feed(&bytes).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.remove(0), msg);
    }

    #[test]
    fn split_across_arbitrary_chunk_boundaries() {
        let msg = Message::Notification(Notification {
            method: "noop".into(),
            params: None,
        });
        let bytes = encode_message(&msg);

        for split_at in 0..bytes.len() {
            let (a, b) = bytes.split_at(split_at);
            let mut codec = Codec::default();
            let mut first = codec.feed(a).unwrap();
            let mut second = codec.feed(b).unwrap();
            first.append(&mut second);
            assert_eq!(first, vec![msg.clone()], "split at byte {split_at}");
        }
    }

    #[test]
    fn scenario_c_three_chunk_split() {
        let mut codec = Codec::default();
        assert!(codec.feed(b"Content-Length: 33\r\n").unwrap().is_empty());
        assert!(codec.feed(b"\r\n").unwrap().is_empty());
        let out = codec
            .feed(br#"{"jsonrpc":"2.0","method":"noop"}"#)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Message::Notification(n) if n.method == "noop"));
    }

    #[test]
    fn duplicate_content_length_is_rejected() {
        let mut codec = Codec::default();
        let err = codec
            .feed(b"Content-Length: 5\r\nContent-Length: 5\r\n\r\nHELLO")
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn missing_content_length_is_rejected() {
        let mut codec = Codec::default();
        let err = codec.feed(b"Foo: bar\r\n\r\n").unwrap_err();
        assert!(err.to_string().contains("missing Content-Length"));
    }

    #[test]
    fn negative_content_length_is_rejected() {
        let mut codec = Codec::default();
        let err = codec.feed(b"Content-Length: -1\r\n\r\n").unwrap_err();
        assert!(err.to_string().contains("invalid Content-Length"));
    }

    #[test]
    fn mixed_case_header_name_is_accepted() {
        let msg = ping_request();
        let body = serde_json::to_string(&msg).unwrap();
        let framed = format!("content-length: {}\r\n\r\n{}", body.len(), body);
        let mut codec = Codec::default();
        let out = codec.feed(framed.as_bytes()).unwrap();
        assert_eq!(out, vec![msg]);
    }

    #[test]
    fn content_length_over_max_is_rejected_before_allocation() {
        let mut codec = Codec::new(10);
        let err = codec.feed(b"Content-Length: 11\r\n\r\n").unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum"));
    }

    #[test]
    fn content_length_at_max_is_accepted() {
        let mut codec = Codec::new(2);
        // Two-byte body "{}" is not valid JSON-RPC, so we expect a JSON
        // parse failure, not a length rejection.
        let err = codec.feed(b"Content-Length: 2\r\n\r\n{}").unwrap_err();
        assert!(!err.to_string().contains("exceeds the maximum"));
    }

    #[test]
    fn empty_body_fails_json_parse() {
        let mut codec = Codec::default();
        let err = codec.feed(b"Content-Length: 0\r\n\r\n").unwrap_err();
        assert!(err.to_string().contains("malformed JSON-RPC payload"));
    }

    #[test]
    fn poisoned_decoder_rejects_until_reset() {
        let mut codec = Codec::default();
        assert!(codec.feed(b"Foo: bar\r\n\r\n").is_err());
        assert!(codec.feed(b"Content-Length: 2\r\n\r\n{}").is_err());
        codec.reset();
        let msg = ping_request();
        let bytes = encode_message(&msg);
        assert_eq!(codec.feed(&bytes).unwrap(), vec![msg]);
    }

    #[test]
    fn multi_byte_utf8_body_uses_byte_length_not_char_count() {
        let msg = Message::Notification(Notification {
            method: "noop".into(),
            params: Some(serde_json::json!({"greeting": "Hello 世界"})),
        });
        let bytes = encode_message(&msg);
        let header_end = find_subslice(&bytes, b"\r\n\r\n").unwrap();
        let header = std::str::from_utf8(&bytes[..header_end]).unwrap();
        let declared_len: usize = header
            .strip_prefix("Content-Length: ")
            .unwrap()
            .parse()
            .unwrap();
        let actual_body_len = bytes.len() - header_end - 4;
        assert_eq!(declared_len, actual_body_len);

        let mut codec = Codec::default();
        assert_eq!(codec.feed(&bytes).unwrap(), vec![msg]);
    }

    #[test]
    fn sequential_frames_in_one_chunk_both_emit() {
        let a = ping_request();
        let b = Message::Notification(Notification {
            method: "noop".into(),
            params: None,
        });
        let mut combined = encode_message(&a);
        combined.extend_from_slice(&encode_message(&b));

        let mut codec = Codec::default();
        assert_eq!(codec.feed(&combined).unwrap(), vec![a, b]);
    }
}
