//! Client-server messaging layer.
//!
//! This module turns raw TCP byte streams into typed [`Request`]s and back, and hosts
//! the server and client that exchange them. Both ends speak the same framing, chosen
//! through [`Framing`](crate::Framing).
//!
//! # Overview
//!
//! Every connection accepted by a [`Server`] is owned by exactly one
//! [`ConnectionHandler`], which runs on a worker of the server's [`ThreadPool`].
//! The handler reads one frame at a time through its [`ProtocolTransport`], hands each
//! request to a [`RequestHandler`] and writes whatever the request's [`Processor`]
//! queued in response. The pool size bounds how many connections are served at once;
//! further connections wait in the pool's queue until a worker frees up.
//!
//! # Key Components
//!
//! - [`Codec`]: Stateless encoder/decoder for fields and whole frames.
//! - [`Request`]: A command plus its fields, decoded lazily from the raw body.
//! - [`RequestQueue`]: Unbounded FIFO shared between producers and consumers.
//! - [`RequestHandler`] / [`Processor`]: Fixed decode-and-dispatch around pluggable logic.
//! - [`ProtocolTransport`]: Framed reader/writer over any [`Socket`].
//! - [`Server`] / [`Client`]: The two network ends.
//!
//! # Wire Format
//!
//! In line mode each frame is a single line:
//!
//! ```text
//! SET speed 0.5\n
//! TRANSMIT loss 12 0.031 1\n
//! ```
//!
//! In binary mode each frame is length prefixed:
//!
//! ```text
//! +----------------+-----------+---------------------------+
//! | len: u32 (BE)  | id: u8    | fields (fixed width, BE)  |
//! +----------------+-----------+---------------------------+
//! ```
//!
//! Integers take 4 bytes, doubles 8, booleans 1, and strings carry an 8 byte length
//! prefix. A frame that fails to decode is skipped without ending the connection.
mod client;
mod codec;
mod connection;
mod field;
mod handler;
mod queue;
mod request;
mod server;
mod thread;
mod transport;

pub use client::Client;
pub use codec::{Codec, CodecError};
pub use connection::{CloseReason, ConnectionHandler, ConnectionState, Shutdown};
pub use field::{Field, FieldKind};
pub use handler::{HandlerError, HandlerFactory, HandlerStats, Outcome, Processor, RequestHandler};
pub use queue::{QueueClosed, RequestQueue};
pub use request::{ConnectionId, DecodeState, Origin, RawBody, Request};
pub use server::{Server, ServerError, ServerHandle, ServerStats, StopHandle};
pub use thread::{PoolClosed, ThreadPool};
pub use transport::{ProtocolTransport, ReadEvent, Socket, TransportError};
