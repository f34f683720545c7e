use std::{
    net::TcpStream,
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{Command, config::ClientConfig};

use super::{
    Codec, ReadEvent, Request, RequestQueue,
    transport::{ProtocolTransport, TransportError},
};

/// Blocking, single connection protocol client.
pub struct Client {
    transport: ProtocolTransport<TcpStream>,
    read_timeout: Option<Duration>,
}

impl Client {
    pub fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        Self::connect_with(&ClientConfig {
            address: format!("{host}:{port}"),
            ..Default::default()
        })
    }

    pub fn connect_with(config: &ClientConfig) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(&config.address)?;
        stream.set_nodelay(true)?;
        debug!("connected to {}", config.address);

        let codec = Codec::new(config.framing).with_max_frame_len(config.max_frame_len);
        let transport = ProtocolTransport::new(stream, codec);
        transport.set_read_timeout(config.read_timeout)?;

        Ok(Self {
            transport,
            read_timeout: config.read_timeout,
        })
    }

    pub fn send(&mut self, request: &Request) -> Result<(), TransportError> {
        self.transport.write_request(request)
    }

    /// Wait for the next response and decode it.
    ///
    /// Fails with [`TransportError::TimedOut`] once the configured read timeout
    /// passes; a partially received response is kept for the next call.
    pub fn receive(&mut self) -> Result<Request, TransportError> {
        self.receive_within(self.read_timeout)
    }

    /// Like [`Client::receive`] with a one-off bound on the wait.
    pub fn receive_timeout(&mut self, timeout: Duration) -> Result<Request, TransportError> {
        self.transport.set_read_timeout(Some(timeout))?;
        let result = self.receive_within(Some(timeout));
        self.transport.set_read_timeout(self.read_timeout)?;
        result
    }

    fn receive_within(&mut self, timeout: Option<Duration>) -> Result<Request, TransportError> {
        let started = Instant::now();
        let mut request = loop {
            match self.transport.read_request()? {
                ReadEvent::Request(request) => break request,
                ReadEvent::Partial if timeout.is_none_or(|t| started.elapsed() < t) => continue,
                ReadEvent::Partial | ReadEvent::Idle => return Err(TransportError::TimedOut),
                ReadEvent::Closed => return Err(TransportError::Closed),
            }
        };
        request.decode_body(self.transport.codec())?;
        Ok(request)
    }

    /// Send `request` and wait for its response.
    pub fn request(&mut self, request: &Request) -> Result<Request, TransportError> {
        self.send(request)?;
        self.receive()
    }

    /// Measure one `PING`/`PONG` round trip.
    pub fn ping(&mut self) -> Result<Duration, TransportError> {
        let started = Instant::now();
        let response = self.request(&Request::ping())?;
        match response.command() {
            Command::Pong => Ok(started.elapsed()),
            other => Err(TransportError::Unexpected(other)),
        }
    }

    /// Read responses on a second thread, pushing each onto `queue`.
    ///
    /// The thread stops, closing `queue`, when the connection ends. Responses that
    /// fail to decode are logged and skipped.
    pub fn spawn_reader(
        &self,
        queue: RequestQueue,
    ) -> Result<thread::JoinHandle<()>, TransportError> {
        // The clone shares the socket's read timeout; timeouts surface as `Idle`.
        let stream = self.transport.socket().try_clone()?;
        let codec = *self.transport.codec();
        let mut reader = ProtocolTransport::new(stream, codec);

        Ok(thread::spawn(move || {
            loop {
                match reader.read_request() {
                    Ok(ReadEvent::Request(mut response)) => match response.decode_body(&codec) {
                        Ok(()) => queue.push(response),
                        Err(e) => warn!("skipping undecodable '{}': {e}", response.command()),
                    },
                    Ok(ReadEvent::Idle | ReadEvent::Partial) => continue,
                    Ok(ReadEvent::Closed) => break,
                    Err(e) if e.is_recoverable() => warn!("skipping response: {e}"),
                    Err(e) => {
                        debug!("response reader stopped: {e}");
                        break;
                    }
                }
            }
            queue.close();
        }))
    }

    /// Ask the server to close the connection and wait for its acknowledgement.
    pub fn close(mut self) -> Result<(), TransportError> {
        self.send(&Request::close())?;
        loop {
            match self.receive() {
                Ok(response) if response.command() == Command::Ack => break,
                Ok(response) => debug!("discarding '{response}' while closing"),
                Err(TransportError::Closed) => break,
                Err(e) => return Err(e),
            }
        }
        self.transport.close()
    }
}
