// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing for DSO messages over TCP.
//!
//! TCP is a stream protocol without message boundaries. DSO sessions carry
//! DNS messages delimited the DNS-over-TCP way:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (2B BE) | DNS message       |
//! +----------------+-------------------+
//! ```
//!
//! The length field is a 16-bit big-endian integer giving the size of the
//! message payload (not including the 2-byte header). A length of zero is
//! a protocol violation: the decoder reports it and the connection owner
//! forcibly aborts.
//!
//! The decoder keeps partial-read state so frames split across reads and
//! several frames arriving in one read both come out as an exact sequence
//! of payloads, whatever the chunking.

use std::io::{self, Read};

/// Frame header size (2 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 2;

/// Largest payload expressible in the 16-bit length prefix.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Encode one message into a framed buffer: `[length: u16 BE][payload]`.
///
/// The payload must fit the 16-bit length prefix; callers validate against
/// [`MAX_PAYLOAD_SIZE`] before queueing.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Append one framed message to an existing buffer.
pub fn encode_into(payload: &[u8], buf: &mut Vec<u8>) {
    debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);

    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
}

/// Outcome of one decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete message payload.
    Frame(Vec<u8>),
    /// The reader would block; call again when readable.
    NeedMore,
    /// The reader returned EOF: the peer closed the stream.
    Closed,
    /// A zero-length frame arrived; the connection must be aborted.
    ZeroLength,
}

/// Internal state for incremental reading.
#[derive(Debug, Clone, Copy)]
enum ReadState {
    /// Reading the 2-byte length header.
    ReadingLength { bytes_read: usize },

    /// Reading the message body.
    ReadingBody {
        expected_len: usize,
        bytes_read: usize,
    },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingLength { bytes_read: 0 }
    }
}

/// Incremental frame decoder for one connection.
#[derive(Debug)]
pub struct FrameDecoder {
    state: ReadState,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; FRAME_HEADER_SIZE],
        }
    }

    /// Try to decode one complete message from the reader.
    ///
    /// Designed for non-blocking I/O: call repeatedly while it returns
    /// [`Decoded::Frame`], stop on [`Decoded::NeedMore`]. `Closed` and
    /// `ZeroLength` are terminal for the connection; the decoder resets
    /// its own state so it could in principle be reused.
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Decoded> {
        loop {
            match self.state {
                ReadState::ReadingLength { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..FRAME_HEADER_SIZE]) {
                        Ok(0) => {
                            self.state = ReadState::default();
                            return Ok(Decoded::Closed);
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < FRAME_HEADER_SIZE {
                                self.state = ReadState::ReadingLength { bytes_read: total };
                                continue;
                            }

                            let len =
                                u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
                            if len == 0 {
                                self.state = ReadState::default();
                                return Ok(Decoded::ZeroLength);
                            }

                            self.buffer.resize(len, 0);
                            self.state = ReadState::ReadingBody {
                                expected_len: len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.state = ReadState::ReadingLength { bytes_read };
                            return Ok(Decoded::NeedMore);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                ReadState::ReadingBody {
                    expected_len,
                    bytes_read,
                } => {
                    match reader.read(&mut self.buffer[bytes_read..expected_len]) {
                        Ok(0) => {
                            self.state = ReadState::default();
                            return Ok(Decoded::Closed);
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < expected_len {
                                self.state = ReadState::ReadingBody {
                                    expected_len,
                                    bytes_read: total,
                                };
                                continue;
                            }

                            let message = self.buffer[..expected_len].to_vec();
                            self.buffer.resize(FRAME_HEADER_SIZE, 0);
                            self.state = ReadState::default();
                            return Ok(Decoded::Frame(message));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.state = ReadState::ReadingBody {
                                expected_len,
                                bytes_read,
                            };
                            return Ok(Decoded::NeedMore);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// True when a frame is partially read.
    pub fn is_partial(&self) -> bool {
        match self.state {
            ReadState::ReadingLength { bytes_read } => bytes_read > 0,
            ReadState::ReadingBody { .. } => true,
        }
    }

    /// Bytes still needed to complete the current header or body.
    pub fn bytes_needed(&self) -> usize {
        match self.state {
            ReadState::ReadingLength { bytes_read } => FRAME_HEADER_SIZE - bytes_read,
            ReadState::ReadingBody {
                expected_len,
                bytes_read,
            } => expected_len - bytes_read,
        }
    }

    /// Reset to expecting a fresh frame header.
    pub fn reset(&mut self) {
        self.state = ReadState::default();
        self.buffer.resize(FRAME_HEADER_SIZE, 0);
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Reader that serves scripted chunks and then reports WouldBlock,
    /// mimicking a non-blocking socket.
    struct ChunkReader {
        chunks: VecDeque<Vec<u8>>,
        current: Vec<u8>,
        pos: usize,
        eof_at_end: bool,
    }

    impl ChunkReader {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into(),
                current: Vec::new(),
                pos: 0,
                eof_at_end: false,
            }
        }

        fn eof(chunks: Vec<Vec<u8>>) -> Self {
            let mut reader = Self::new(chunks);
            reader.eof_at_end = true;
            reader
        }
    }

    impl Read for ChunkReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.current.len() {
                match self.chunks.pop_front() {
                    Some(next) => {
                        self.current = next;
                        self.pos = 0;
                    }
                    None if self.eof_at_end => return Ok(0),
                    None => return Err(io::ErrorKind::WouldBlock.into()),
                }
            }
            let n = buf.len().min(self.current.len() - self.pos);
            buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_encode_wire_bytes() {
        let frame = encode(b"abc");
        assert_eq!(frame, vec![0x00, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn test_encode_into_appends() {
        let mut buf = Vec::new();
        encode_into(b"ab", &mut buf);
        encode_into(b"c", &mut buf);
        assert_eq!(buf, vec![0x00, 0x02, b'a', b'b', 0x00, 0x01, b'c']);
    }

    #[test]
    fn test_decode_single_frame() {
        let mut decoder = FrameDecoder::new();
        let mut reader = ChunkReader::new(vec![encode(b"hello")]);

        assert_eq!(
            decoder.decode(&mut reader).unwrap(),
            Decoded::Frame(b"hello".to_vec())
        );
        assert_eq!(decoder.decode(&mut reader).unwrap(), Decoded::NeedMore);
    }

    #[test]
    fn test_decode_split_across_reads() {
        // The spec's frame-split scenario: [0x00,0x03,'a'] then
        // ['b','c',0x00,0x02,'d','e'] must yield "abc" and "de".
        let mut decoder = FrameDecoder::new();
        let mut reader = ChunkReader::new(vec![
            vec![0x00, 0x03, b'a'],
            vec![b'b', b'c', 0x00, 0x02, b'd', b'e'],
        ]);

        assert_eq!(
            decoder.decode(&mut reader).unwrap(),
            Decoded::Frame(b"abc".to_vec())
        );
        assert_eq!(
            decoder.decode(&mut reader).unwrap(),
            Decoded::Frame(b"de".to_vec())
        );
        assert_eq!(decoder.decode(&mut reader).unwrap(), Decoded::NeedMore);
    }

    #[test]
    fn test_decode_any_chunking_yields_same_frames() {
        let mut wire = Vec::new();
        encode_into(b"first", &mut wire);
        encode_into(b"second message", &mut wire);
        encode_into(&[0xAA; 300], &mut wire);

        for chunk_size in [1, 2, 3, 7, 64, wire.len()] {
            let chunks: Vec<Vec<u8>> = wire.chunks(chunk_size).map(|c| c.to_vec()).collect();
            let mut decoder = FrameDecoder::new();
            let mut reader = ChunkReader::new(chunks);

            let mut frames = Vec::new();
            loop {
                match decoder.decode(&mut reader).unwrap() {
                    Decoded::Frame(payload) => frames.push(payload),
                    Decoded::NeedMore => break,
                    other => panic!("unexpected outcome: {:?}", other),
                }
            }

            assert_eq!(frames.len(), 3, "chunk size {}", chunk_size);
            assert_eq!(frames[0], b"first");
            assert_eq!(frames[1], b"second message");
            assert_eq!(frames[2], vec![0xAA; 300]);
        }
    }

    #[test]
    fn test_decode_zero_length_frame() {
        let mut decoder = FrameDecoder::new();
        let mut reader = ChunkReader::new(vec![vec![0x00, 0x00]]);

        assert_eq!(decoder.decode(&mut reader).unwrap(), Decoded::ZeroLength);
        assert!(!decoder.is_partial());
    }

    #[test]
    fn test_decode_peer_close() {
        let mut decoder = FrameDecoder::new();
        let mut reader = ChunkReader::eof(vec![]);
        assert_eq!(decoder.decode(&mut reader).unwrap(), Decoded::Closed);
    }

    #[test]
    fn test_decode_close_mid_frame() {
        let mut decoder = FrameDecoder::new();
        // Header promises 4 bytes, stream ends after 1.
        let mut reader = ChunkReader::eof(vec![vec![0x00, 0x04, b'x']]);
        assert_eq!(decoder.decode(&mut reader).unwrap(), Decoded::Closed);
    }

    #[test]
    fn test_bytes_needed_tracks_progress() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.bytes_needed(), 2);
        assert!(!decoder.is_partial());

        let mut reader = ChunkReader::new(vec![vec![0x00]]);
        assert_eq!(decoder.decode(&mut reader).unwrap(), Decoded::NeedMore);
        assert_eq!(decoder.bytes_needed(), 1);
        assert!(decoder.is_partial());

        let mut reader = ChunkReader::new(vec![vec![0x05, b'a', b'b']]);
        assert_eq!(decoder.decode(&mut reader).unwrap(), Decoded::NeedMore);
        assert_eq!(decoder.bytes_needed(), 3);

        decoder.reset();
        assert_eq!(decoder.bytes_needed(), 2);
    }

    #[test]
    fn test_decode_max_length_frame() {
        let payload = vec![0x42u8; MAX_PAYLOAD_SIZE];
        let mut decoder = FrameDecoder::new();
        let mut reader = ChunkReader::new(vec![encode(&payload)]);

        match decoder.decode(&mut reader).unwrap() {
            Decoded::Frame(got) => assert_eq!(got.len(), MAX_PAYLOAD_SIZE),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
