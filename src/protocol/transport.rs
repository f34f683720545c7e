use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    time::Duration,
};

use log::{debug, trace};
use thiserror::Error;

use crate::Command;

use super::{Codec, Origin, Request, codec::CodecError};

const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    /// A single frame could not be decoded; the connection is still usable.
    #[error("malformed request: {0}")]
    Malformed(#[from] CodecError),
    #[error("frame exceeds the {max} byte limit")]
    FrameTooLarge { max: usize },
    #[error("connection closed in the middle of a frame ({0} bytes buffered)")]
    Truncated(usize),
    #[error("connection is closed")]
    Closed,
    #[error("timed out waiting for a response")]
    TimedOut,
    #[error("unexpected '{0}' response")]
    Unexpected(Command),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the connection survives this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Malformed(_) | TransportError::TimedOut | TransportError::Unexpected(_)
        )
    }
}

/// Byte stream a [`ProtocolTransport`] runs over.
pub trait Socket: Read + Write + Send {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Release the connection. Called once, on every exit path of the owner.
    fn close(&mut self) -> io::Result<()>;
}

impl Socket for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// What a single read attempt produced.
#[derive(Debug)]
pub enum ReadEvent {
    Request(Request),
    /// The read timeout expired before a whole frame arrived.
    Idle,
    /// Bytes arrived but no frame is complete yet.
    Partial,
    /// The peer closed the connection between frames.
    Closed,
}

/// Framed request reader/writer that owns one socket.
///
/// Partial frames stay buffered across read timeouts. The socket is closed when
/// the transport is closed or dropped, whichever happens first.
pub struct ProtocolTransport<S: Socket> {
    socket: S,
    codec: Codec,
    origin: Option<Origin>,
    buffer: Vec<u8>,
    closed: bool,
}

impl<S: Socket> ProtocolTransport<S> {
    pub fn new(socket: S, codec: Codec) -> Self {
        Self {
            socket,
            codec,
            origin: None,
            buffer: Vec::with_capacity(READ_CHUNK_SIZE),
            closed: false,
        }
    }

    /// Stamp every request read from this transport with `origin`.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn write_request(&mut self, request: &Request) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let frame = self.codec.encode(request)?;
        self.socket.write_all(&frame)?;
        self.socket.flush()?;
        trace!("sent {} byte '{}' frame", frame.len(), request.command());
        Ok(())
    }

    /// Read the next frame as an undecoded request.
    ///
    /// Performs at most one socket read, so a peer that trickles bytes without ever
    /// finishing a frame still hands control back as [`ReadEvent::Partial`].
    pub fn read_request(&mut self) -> Result<ReadEvent, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if let Some(request) = self.next_buffered()? {
            return Ok(ReadEvent::Request(request));
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let read = loop {
            match self.socket.read(&mut chunk) {
                Ok(read) => break read,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(ReadEvent::Idle);
                }
                Err(e) => return Err(e.into()),
            }
        };

        if read == 0 {
            return match self.buffer.len() {
                0 => Ok(ReadEvent::Closed),
                buffered => Err(TransportError::Truncated(buffered)),
            };
        }
        self.buffer.extend_from_slice(&chunk[..read]);

        Ok(match self.next_buffered()? {
            Some(request) => ReadEvent::Request(request),
            None => ReadEvent::Partial,
        })
    }

    /// Release the socket. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffer.clear();
        self.socket.close()?;
        Ok(())
    }

    fn next_buffered(&mut self) -> Result<Option<Request>, TransportError> {
        loop {
            let len = match self.codec.split_frame(&self.buffer) {
                Ok(Some(len)) => len,
                Ok(None) => return Ok(None),
                Err(_) => {
                    return Err(TransportError::FrameTooLarge {
                        max: self.codec.max_frame_len(),
                    });
                }
            };

            let frame: Vec<u8> = self.buffer.drain(..len).collect();
            match self.codec.decode_frame(&frame, self.origin)? {
                Some(request) => return Ok(Some(request)),
                None => continue,
            }
        }
    }
}

impl<S: Socket> Drop for ProtocolTransport<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("failed to close socket: {e}");
        }
    }
}
