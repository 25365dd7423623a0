//! Chunked file transfer over a plain `TcpStream`, layered on top of the
//! same length-prefixed wire codec used by the message-passing layer.
//!
//! A `FileContents` frame carries one chunk of a file plus a flag marking
//! the final chunk; `ChunkedFileSender`/`ChunkedFileReceiver` drive a
//! socket through a whole transfer one chunk at a time so callers can
//! interleave other I/O between calls rather than blocking for the whole
//! file.

use std::io::{Read, Write};
use std::net::TcpStream;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::wire::MessageParser;

/// Bytes of file content carried per chunk.
const CHUNK_SIZE: usize = 1000;

/// Size of each raw `recv()` performed while reassembling chunks.
const RECEIVE_BUFFER_SIZE: usize = 4096;

/// One chunk of a file in flight, plus whether it is the last one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileContents {
    pub contents: Vec<u8>,
    pub is_last: bool,
}

/// Feeds a file's bytes across a socket one [`CHUNK_SIZE`]-sized frame at a
/// time. Call [`set_file_contents`](ChunkedFileSender::set_file_contents)
/// once, then [`send_next_chunk`](ChunkedFileSender::send_next_chunk)
/// repeatedly until [`sent_complete_file`](ChunkedFileSender::sent_complete_file).
pub struct ChunkedFileSender<'a> {
    socket: &'a mut TcpStream,
    file_contents: Vec<u8>,
    total_bytes_sent: usize,
}

impl<'a> ChunkedFileSender<'a> {
    pub fn new(socket: &'a mut TcpStream) -> Self {
        ChunkedFileSender {
            socket,
            file_contents: Vec::new(),
            total_bytes_sent: 0,
        }
    }

    /// Begins a new transfer, discarding any in-progress one.
    pub fn set_file_contents(&mut self, contents: Vec<u8>) {
        self.file_contents = contents;
        self.total_bytes_sent = 0;
    }

    /// Sends the next chunk, returning bytes written (0 if the peer
    /// disconnected mid-write, matching the underlying socket convention).
    pub fn send_next_chunk(&mut self) -> Result<usize> {
        let remaining = self.file_contents.len() - self.total_bytes_sent;
        let actual_size = CHUNK_SIZE.min(remaining);
        let start = self.total_bytes_sent;
        let chunk = FileContents {
            contents: self.file_contents[start..start + actual_size].to_vec(),
            is_last: self.total_bytes_sent + CHUNK_SIZE >= self.file_contents.len(),
        };

        let frame = crate::wire::serialize(&chunk)?;

        let mut sent = 0;
        while sent < frame.len() {
            match self.socket.write(&frame[sent..]) {
                Ok(0) => return Ok(0),
                Ok(n) => sent += n,
                Err(e) => return Err(Error::wrapped(ErrorKind::Transport, e)),
            }
        }

        self.total_bytes_sent += actual_size;
        Ok(sent)
    }

    /// True once every byte handed to `set_file_contents` has been sent.
    pub fn sent_complete_file(&self) -> bool {
        self.total_bytes_sent == self.file_contents.len()
    }
}

/// Reassembles a file sent by a [`ChunkedFileSender`] on the other end of a
/// socket, one frame at a time.
pub struct ChunkedFileReceiver<'a> {
    socket: &'a mut TcpStream,
    parser: MessageParser<FileContents>,
    file_contents: Vec<u8>,
    complete_file: bool,
}

impl<'a> ChunkedFileReceiver<'a> {
    pub fn new(socket: &'a mut TcpStream) -> Self {
        ChunkedFileReceiver {
            socket,
            parser: MessageParser::new(),
            file_contents: Vec::new(),
            complete_file: false,
        }
    }

    /// Blocks reading raw bytes until one full `FileContents` frame is
    /// parsed, appends its chunk, and returns the number of content bytes
    /// just appended. Returns `Ok(0)` if the peer disconnected.
    pub fn receive_next_chunk(&mut self) -> Result<usize> {
        let mut buf = [0u8; RECEIVE_BUFFER_SIZE];

        while !self.parser.has_complete_message() {
            match self.socket.read(&mut buf) {
                Ok(0) => return Ok(0),
                Ok(n) => self.parser.feed(&buf[..n]),
                Err(e) => return Err(Error::wrapped(ErrorKind::Transport, e)),
            }
        }

        let message: FileContents = self
            .parser
            .take_message()
            .ok_or_else(|| Error::simple(ErrorKind::Protocol))?;

        let len = message.contents.len();
        self.file_contents.extend_from_slice(&message.contents);
        if message.is_last {
            self.complete_file = true;
        }

        Ok(len)
    }

    /// True once a frame with `is_last` set has been parsed.
    pub fn has_complete_file(&self) -> bool {
        self.complete_file
    }

    /// Takes the accumulated file bytes and resets for the next transfer.
    pub fn take_file_contents(&mut self) -> Vec<u8> {
        let contents = std::mem::take(&mut self.file_contents);
        self.reset();
        contents
    }

    fn reset(&mut self) {
        self.parser.reset();
        self.file_contents.clear();
        self.complete_file = false;
    }

    /// Drains any remaining socket data until the current message (if any)
    /// finishes parsing, so the socket isn't left mid-frame. Used when
    /// abandoning a transfer early, e.g. after a command error.
    pub fn clean_up(&mut self) -> Result<()> {
        while self.parser.has_overflow() || self.parser.has_partial_message() {
            if self.receive_next_chunk()? == 0 {
                return Err(Error::simple(ErrorKind::Transport));
            }
        }
        self.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn round_trip_multi_chunk_file() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let data: Vec<u8> = (0..2500u32).map(|b| (b % 256) as u8).collect();
        let data_for_sender = data.clone();

        let sender_thread = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut sender = ChunkedFileSender::new(&mut stream);
            sender.set_file_contents(data_for_sender);
            while !sender.sent_complete_file() {
                let n = sender.send_next_chunk().unwrap();
                assert!(n > 0);
            }
        });

        let (mut server_stream, _) = listener.accept().unwrap();
        let mut receiver = ChunkedFileReceiver::new(&mut server_stream);
        while !receiver.has_complete_file() {
            receiver.receive_next_chunk().unwrap();
        }
        let received = receiver.take_file_contents();

        sender_thread.join().unwrap();
        assert_eq!(received, data);
    }

    #[test]
    fn single_chunk_file_marks_last_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let data = vec![7u8; 42];
        let data_for_sender = data.clone();

        let sender_thread = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut sender = ChunkedFileSender::new(&mut stream);
            sender.set_file_contents(data_for_sender);
            sender.send_next_chunk().unwrap();
            assert!(sender.sent_complete_file());
        });

        let (mut server_stream, _) = listener.accept().unwrap();
        let mut receiver = ChunkedFileReceiver::new(&mut server_stream);
        receiver.receive_next_chunk().unwrap();
        assert!(receiver.has_complete_file());
        assert_eq!(receiver.take_file_contents(), data);

        sender_thread.join().unwrap();
    }

    #[test]
    fn empty_file_sends_one_last_empty_chunk() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let sender_thread = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut sender = ChunkedFileSender::new(&mut stream);
            sender.set_file_contents(Vec::new());
            sender.send_next_chunk().unwrap();
            assert!(sender.sent_complete_file());
        });

        let (mut server_stream, _) = listener.accept().unwrap();
        let mut receiver = ChunkedFileReceiver::new(&mut server_stream);
        receiver.receive_next_chunk().unwrap();
        assert!(receiver.has_complete_file());
        assert!(receiver.take_file_contents().is_empty());

        sender_thread.join().unwrap();
    }
}
