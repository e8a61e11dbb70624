// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One DSO connection: a non-blocking TCP socket, an egress buffer, and
//! the frame reassembly state.

use std::io::{self, Write};
use std::net::{SocketAddr, SocketAddrV6, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use super::frame::{self, Decoded, FrameDecoder};

/// Connection lifecycle. A torn-down connection is removed from the
/// registry rather than parked in a terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Non-blocking connect in flight; completion shows up as
    /// writability.
    Connecting,
    /// Established; frames flow.
    Connected,
}

/// What a read pass concluded about the connection.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// Would block; still healthy.
    Open,
    /// Peer closed the stream (EOF).
    PeerClosed,
    /// Peer sent a zero-length frame; protocol violation.
    ZeroLengthFrame,
}

pub(crate) struct DsoConnection {
    pub peer: SocketAddrV6,
    pub state: ConnState,
    stream: TcpStream,
    decoder: FrameDecoder,
    outbuf: Vec<u8>,
}

impl DsoConnection {
    /// Start a non-blocking connect to `peer`.
    pub fn connect(peer: SocketAddrV6) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;

        let state = match socket.connect(&SocketAddr::V6(peer).into()) {
            Ok(()) => ConnState::Connected,
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => ConnState::Connecting,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ConnState::Connecting,
            Err(e) => return Err(e),
        };

        Ok(Self {
            peer,
            state,
            stream: socket.into(),
            decoder: FrameDecoder::new(),
            outbuf: Vec::new(),
        })
    }

    /// Wrap a socket handed out by `accept`.
    pub fn from_accepted(stream: TcpStream, peer: SocketAddrV6) -> Self {
        Self {
            peer,
            state: ConnState::Connected,
            stream,
            decoder: FrameDecoder::new(),
            outbuf: Vec::new(),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Resolve an in-flight connect after the socket reported
    /// writability.
    pub fn finish_connect(&mut self) -> io::Result<()> {
        if let Some(error) = self.stream.take_error()? {
            return Err(error);
        }
        self.state = ConnState::Connected;
        Ok(())
    }

    /// Frame a message into the egress buffer; flushed opportunistically
    /// and on write readiness.
    pub fn queue_message(&mut self, payload: &[u8]) {
        frame::encode_into(payload, &mut self.outbuf);
    }

    /// Push buffered egress bytes into the socket. Returns `true` once
    /// the buffer is drained.
    pub fn flush(&mut self) -> io::Result<bool> {
        let mut written = 0;
        let drained = loop {
            if written == self.outbuf.len() {
                break true;
            }
            match self.stream.write(&self.outbuf[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.outbuf.drain(..written);
        Ok(drained)
    }

    /// Whether the mainloop should watch for writability.
    pub fn wants_write(&self) -> bool {
        self.state == ConnState::Connecting || !self.outbuf.is_empty()
    }

    /// Drain every complete frame currently readable.
    pub fn read_frames(&mut self, frames: &mut Vec<Vec<u8>>) -> io::Result<ReadOutcome> {
        loop {
            match self.decoder.decode(&mut self.stream)? {
                Decoded::Frame(payload) => frames.push(payload),
                Decoded::NeedMore => return Ok(ReadOutcome::Open),
                Decoded::Closed => return Ok(ReadOutcome::PeerClosed),
                Decoded::ZeroLength => return Ok(ReadOutcome::ZeroLengthFrame),
            }
        }
    }

    /// Arrange for close to emit TCP RST instead of FIN.
    pub fn abort(&mut self) {
        if let Err(e) = SockRef::from(&self.stream).set_linger(Some(Duration::ZERO)) {
            log::warn!("[DSO] failed to set linger on {}: {}", self.peer, e);
        }
    }
}
