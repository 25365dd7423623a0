//! Length-prefixed wire framing and a streaming parser that tolerates
//! arbitrary fragmentation and coalescing of TCP reads.
//!
//! A frame on the wire is a 4-byte big-endian length prefix followed by
//! that many bytes of an opaque, schema-encoded body. The parser is fed
//! bytes as they arrive and reports when a complete frame is available.

use serde::de::DeserializeOwned;
use serde::Serialize;
use smallvec::SmallVec;

use crate::error::{Error, ErrorKind, Result};

/// Number of bytes used to encode a frame's length prefix.
const LENGTH_PREFIX_BYTES: usize = 4;

/// Serializes `msg` into a length-prefixed frame ready to be written to a
/// socket. The body encoding itself is `bincode`; the framing is
/// schema-agnostic.
pub fn serialize<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(msg).map_err(|e| Error::wrapped(ErrorKind::Protocol, e))?;
    let mut framed = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ParserState {
    AwaitLength,
    AwaitBody,
    Done,
}

/// Streaming, incremental parser for one peer's byte stream.
///
/// Bytes are pushed in with [`feed`](MessageParser::feed) as they are read
/// off a socket, in whatever chunk sizes the transport happens to deliver
/// them. The parser keeps enough internal state to reconstruct frames that
/// were split across reads, and to carry over bytes belonging to the next
/// frame that arrived coalesced with the current one.
pub struct MessageParser<T> {
    state: ParserState,
    partial_length: SmallVec<[u8; LENGTH_PREFIX_BYTES]>,
    body: Vec<u8>,
    expected_len: usize,
    overflow: Vec<u8>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Default for MessageParser<T> {
    fn default() -> Self {
        MessageParser {
            state: ParserState::AwaitLength,
            partial_length: SmallVec::new(),
            body: Vec::new(),
            expected_len: 0,
            overflow: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: DeserializeOwned> MessageParser<T> {
    /// Creates a fresh parser, ready to receive bytes of a new stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds new bytes into the parser. May be called with any slice size,
    /// including zero-length slices.
    pub fn feed(&mut self, data: &[u8]) {
        let mut offset = self.parse_length(data);
        offset += self.parse_body(data, offset);
        self.save_overflow(data, offset);
    }

    /// True once a complete frame's body has been accumulated.
    pub fn has_complete_message(&self) -> bool {
        self.state == ParserState::Done
    }

    /// True if any bytes belonging to the frame after the current one have
    /// already been observed.
    pub fn has_overflow(&self) -> bool {
        !self.overflow.is_empty()
    }

    /// True if we have started, but not finished, reading a frame.
    pub fn has_partial_message(&self) -> bool {
        !self.body.is_empty() || !self.partial_length.is_empty()
    }

    /// Returns (without consuming) the bytes currently held in the overflow
    /// buffer.
    pub fn overflow(&self) -> &[u8] {
        &self.overflow
    }

    /// Consumes and returns the overflow buffer. The returned bytes are
    /// equivalent to feeding them into a fresh parser.
    pub fn take_overflow(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.overflow)
    }

    /// Resets all parser state, including the overflow buffer.
    pub fn reset(&mut self) {
        self.state = ParserState::AwaitLength;
        self.partial_length.clear();
        self.body.clear();
        self.expected_len = 0;
        self.overflow.clear();
    }

    /// Decodes and returns the completed message, if any.
    ///
    /// On success or schema-decode failure alike, internal state is reset
    /// except for the overflow buffer, which is immediately re-fed so the
    /// parser is ready to continue with the next frame. This never recurses:
    /// the overflow is re-parsed with one iterative call, not by having
    /// `take_message` call itself.
    pub fn take_message(&mut self) -> Option<T> {
        if !self.has_complete_message() {
            return None;
        }

        let decoded = bincode::deserialize(&self.body).ok();

        let pending_overflow = std::mem::take(&mut self.overflow);
        self.state = ParserState::AwaitLength;
        self.partial_length.clear();
        self.body.clear();
        self.expected_len = 0;
        // overflow already cleared via mem::take above.
        self.feed(&pending_overflow);

        decoded
    }

    fn parse_length(&mut self, data: &[u8]) -> usize {
        if self.state != ParserState::AwaitLength {
            return 0;
        }

        let need = LENGTH_PREFIX_BYTES - self.partial_length.len();
        let take = need.min(data.len());
        self.partial_length.extend_from_slice(&data[..take]);

        if self.partial_length.len() == LENGTH_PREFIX_BYTES {
            let mut len_bytes = [0u8; LENGTH_PREFIX_BYTES];
            len_bytes.copy_from_slice(&self.partial_length);
            self.expected_len = u32::from_be_bytes(len_bytes) as usize;
            self.state = ParserState::AwaitBody;
        }

        take
    }

    fn parse_body(&mut self, data: &[u8], start_offset: usize) -> usize {
        if self.state != ParserState::AwaitBody {
            return 0;
        }

        let remaining_input = data.len() - start_offset;
        let remaining_body = self.expected_len - self.body.len();
        let take = remaining_input.min(remaining_body);

        self.body
            .extend_from_slice(&data[start_offset..start_offset + take]);

        if self.body.len() == self.expected_len {
            self.state = ParserState::Done;
        }

        take
    }

    fn save_overflow(&mut self, data: &[u8], start_offset: usize) {
        if self.state != ParserState::Done {
            return;
        }
        self.overflow.extend_from_slice(&data[start_offset..]);
    }
}
