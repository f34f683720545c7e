use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread,
};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::{ConfigError, ServerConfig};

use super::{
    Codec, ConnectionHandler, ConnectionId, HandlerFactory, HandlerStats, Origin, Processor,
    ProtocolTransport, RequestHandler, RequestQueue, Shutdown, ThreadPool,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid server configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("no request handler registered")]
    NoHandler,
    #[error("accept loop failed: {0}")]
    Accept(#[from] io::Error),
    #[error("server thread panicked")]
    Panicked,
}

#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    active: AtomicUsize,
    requests: Arc<HandlerStats>,
}

impl ServerStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections currently being served by a worker.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Request outcomes summed over every connection.
    pub fn requests(&self) -> &HandlerStats {
        &self.requests
    }
}

/// Cloneable handle that asks a running server to stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    shutdown: Shutdown,
}

impl StopHandle {
    pub fn stop(&self) {
        self.shutdown.trigger();
    }
}

/// Accepts connections and serves each one on a fixed size worker pool.
pub struct Server {
    listener: TcpListener,
    address: SocketAddr,
    config: ServerConfig,
    codec: Codec,
    factory: Option<HandlerFactory>,
    shutdown: Shutdown,
    stats: Arc<ServerStats>,
}

impl Server {
    /// Validate `config` and bind the listening socket.
    ///
    /// Nothing is accepted until [`Server::run`]; a bind failure surfaces here.
    pub fn listen(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let bind_error = |source| ServerError::Bind {
            address: config.address,
            source,
        };
        let listener = TcpListener::bind(config.address).map_err(bind_error)?;
        // Accept polls so the loop can notice a stop request.
        listener.set_nonblocking(true).map_err(bind_error)?;
        let address = listener.local_addr().map_err(bind_error)?;

        let codec = Codec::new(config.framing).with_max_frame_len(config.max_frame_len);
        Ok(Self {
            listener,
            address,
            config,
            codec,
            factory: None,
            shutdown: Shutdown::new(),
            stats: Arc::new(ServerStats::default()),
        })
    }

    /// Listen on `port` of every local interface, with otherwise default settings.
    pub fn bind(port: u16, pool_size: usize) -> Result<Self, ServerError> {
        Self::listen(ServerConfig {
            address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            pool_size,
            ..Default::default()
        })
    }

    /// Register the processor built for every accepted connection.
    pub fn on_request<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Origin) -> Box<dyn Processor> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Run the accept loop on the calling thread until stopped.
    ///
    /// On stop, new connections are refused, in-flight connections finish their
    /// current request and close, and the workers are joined before returning.
    pub fn run(self) -> Result<(), ServerError> {
        let factory = self.factory.clone().ok_or(ServerError::NoHandler)?;
        let pool = ThreadPool::new(self.config.pool_size);
        info!(
            "listening at {} with {} workers",
            self.address, self.config.pool_size
        );

        let mut next_id = 0;
        let result = loop {
            if self.shutdown.is_triggered() {
                break Ok(());
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    next_id += 1;
                    let origin = Origin::new(ConnectionId(next_id), Some(peer));
                    if let Err(e) = self.dispatch(&pool, &factory, stream, origin) {
                        warn!("dropping connection {origin}: {e}");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(self.config.poll_interval);
                }
                Err(e) if is_transient(&e) => warn!("broken connection: {e:?}"),
                Err(e) => {
                    error!("accept failed: {e}");
                    self.shutdown.trigger();
                    break Err(ServerError::Accept(e));
                }
            }
        };

        info!(
            "stopped accepting at {}; waiting for {} active and {} queued connections",
            self.address,
            pool.active(),
            pool.queued()
        );
        drop(pool);
        info!("server at {} stopped", self.address);
        result
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self) -> ServerHandle {
        let address = self.address;
        let stop = self.stop_handle();
        let stats = self.stats();
        let thread = thread::spawn(move || self.run());

        ServerHandle {
            address,
            stop,
            stats,
            thread,
        }
    }

    fn dispatch(
        &self,
        pool: &ThreadPool,
        factory: &HandlerFactory,
        stream: TcpStream,
        origin: Origin,
    ) -> Result<(), ServerError> {
        // Accepted sockets may inherit the listener's non-blocking mode.
        stream.set_nonblocking(false)?;
        self.stats.accepted.fetch_add(1, Ordering::SeqCst);
        debug!("accepted connection {origin}");

        let codec = self.codec;
        let factory = Arc::clone(factory);
        let shutdown = self.shutdown.clone();
        let stats = Arc::clone(&self.stats);
        let poll_interval = self.config.poll_interval;
        let idle_timeout = self.config.idle_timeout;

        pool.execute(move || {
            let transport = ProtocolTransport::new(stream, codec).with_origin(origin);
            if shutdown.is_triggered() {
                debug!("refusing queued connection {origin} during shutdown");
                return;
            }

            stats.active.fetch_add(1, Ordering::SeqCst);
            let handler = RequestHandler::new(
                codec,
                factory(&origin),
                RequestQueue::new(),
                RequestQueue::new(),
            )
            .with_stats(Arc::clone(&stats.requests));

            ConnectionHandler::new(transport, handler)
                .with_shutdown(shutdown)
                .with_poll_interval(poll_interval)
                .with_idle_timeout(idle_timeout)
                .run();
            stats.active.fetch_sub(1, Ordering::SeqCst);
        })
        .map_err(|e| ServerError::Accept(io::Error::other(e)))
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::TimedOut
    )
}

/// A server running on its own thread.
pub struct ServerHandle {
    address: SocketAddr,
    stop: StopHandle,
    stats: Arc<ServerStats>,
    thread: thread::JoinHandle<Result<(), ServerError>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop the server and wait for every connection to close.
    pub fn stop(self) -> Result<(), ServerError> {
        self.stop.stop();
        self.thread.join().map_err(|_| ServerError::Panicked)?
    }
}
