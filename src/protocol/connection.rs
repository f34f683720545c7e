//! Per-connection read loop.
//!
//! A [`ConnectionHandler`] exclusively owns one socket for its whole life:
//!
//! ```text
//! Ready ──> Reading ──> Closing ──> Closed
//!             │  ▲
//!             └──┘  one frame -> one Request -> dispatch -> write responses
//! ```
//!
//! Control commands are answered in place: `PING` with `PONG`, `CLOSE_CONNECTION`
//! with a positive `ACK` followed by teardown, and a stray `PONG` is ignored. Every
//! other request goes through the [`RequestHandler`], and whatever it queued on its
//! output is written back before the next frame is read, so responses keep request
//! order.
//!
//! Malformed frames, control commands included, are logged and skipped. Peer EOF, an
//! I/O error, the idle timeout or the shutdown signal end the loop; in every case the
//! socket is closed before [`ConnectionHandler::run`] returns. Idleness is measured
//! from the last complete frame, so trickled bytes do not keep a connection alive.
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};

use crate::{Command, config::DEFAULT_POLL_INTERVAL};

use super::{
    Processor, Request, RequestHandler,
    transport::{ProtocolTransport, ReadEvent, Socket, TransportError},
};

/// Cooperative stop signal observed by accept loops and connection handlers.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Ready,
    Reading,
    Closing,
    Closed,
}

#[derive(Debug)]
pub enum CloseReason {
    PeerClosed,
    CloseCommand,
    Idle,
    Shutdown,
    Fault(TransportError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed the connection"),
            CloseReason::CloseCommand => f.write_str("close requested"),
            CloseReason::Idle => f.write_str("idle timeout"),
            CloseReason::Shutdown => f.write_str("server shutting down"),
            CloseReason::Fault(e) => write!(f, "{e}"),
        }
    }
}

pub struct ConnectionHandler<S: Socket, P: Processor> {
    transport: ProtocolTransport<S>,
    handler: RequestHandler<P>,
    state: ConnectionState,
    shutdown: Shutdown,
    poll_interval: Duration,
    idle_timeout: Option<Duration>,
}

impl<S: Socket, P: Processor> ConnectionHandler<S, P> {
    pub fn new(transport: ProtocolTransport<S>, handler: RequestHandler<P>) -> Self {
        Self {
            transport,
            handler,
            state: ConnectionState::Ready,
            shutdown: Shutdown::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_timeout: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// How long a read may block before the shutdown signal is checked again.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Serve the connection until it ends, then release the socket.
    pub fn run(mut self) -> CloseReason {
        let peer = self.peer();
        debug!("serving connection {peer}");

        let reason = self.serve();
        self.state = ConnectionState::Closing;

        if let Err(e) = self.transport.close() {
            debug!("error closing connection {peer}: {e}");
        }
        self.handler.input().close();
        self.handler.output().close();
        self.state = ConnectionState::Closed;

        match &reason {
            CloseReason::Fault(e) => warn!("connection {peer} failed: {e}"),
            reason => info!("connection {peer} closed: {reason}"),
        }
        reason
    }

    fn serve(&mut self) -> CloseReason {
        if self.shutdown.is_triggered() {
            return CloseReason::Shutdown;
        }
        if let Err(e) = self.transport.set_read_timeout(Some(self.poll_interval)) {
            return CloseReason::Fault(e);
        }

        self.state = ConnectionState::Reading;
        let mut last_activity = Instant::now();

        loop {
            if self.shutdown.is_triggered() {
                return CloseReason::Shutdown;
            }

            let mut request = match self.transport.read_request() {
                Ok(ReadEvent::Request(request)) => request,
                // Idleness counts from the last complete frame.
                Ok(ReadEvent::Idle | ReadEvent::Partial) => {
                    if self.idle_timeout.is_some_and(|t| last_activity.elapsed() >= t) {
                        return CloseReason::Idle;
                    }
                    continue;
                }
                Ok(ReadEvent::Closed) => return CloseReason::PeerClosed,
                Err(TransportError::Malformed(e)) => {
                    warn!("skipping malformed frame from {}: {e}", self.peer());
                    last_activity = Instant::now();
                    continue;
                }
                Err(e) => return CloseReason::Fault(e),
            };
            last_activity = Instant::now();
            trace!("received '{request}' from {}", self.peer());

            // Processors decode their own requests; control commands are decoded here.
            if request.command().is_control() {
                if let Err(e) = request.decode_body(self.transport.codec()) {
                    warn!("skipping malformed '{}' from {}: {e}", request.command(), self.peer());
                    continue;
                }
            }

            match request.command() {
                Command::CloseConnection => {
                    // The peer may already be gone; teardown happens either way.
                    let ack = request.reply(Request::ack(true, "closing"));
                    if let Err(e) = self.transport.write_request(&ack) {
                        debug!("could not acknowledge close: {e}");
                    }
                    return CloseReason::CloseCommand;
                }
                Command::Ping => {
                    let pong = request.reply(Request::pong());
                    if let Err(e) = self.transport.write_request(&pong) {
                        return CloseReason::Fault(e);
                    }
                }
                Command::Pong => debug!("ignoring unsolicited PONG from {}", self.peer()),
                _ => {
                    self.handler.handle(request);
                    if let Err(e) = self.flush_responses() {
                        return CloseReason::Fault(e);
                    }
                }
            }
        }
    }

    fn flush_responses(&mut self) -> Result<(), TransportError> {
        for response in self.handler.output().drain() {
            match self.transport.write_request(&response) {
                Err(TransportError::Malformed(e)) => {
                    warn!("dropping unencodable '{}' response: {e}", response.command());
                }
                other => other?,
            }
        }
        Ok(())
    }

    fn peer(&self) -> String {
        match self.transport.socket().peer_addr() {
            Some(addr) => addr.to_string(),
            None => "(unknown peer)".to_string(),
        }
    }
}
